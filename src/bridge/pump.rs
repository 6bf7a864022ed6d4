use std::sync::{Arc, OnceLock};

use tonic::Status;
use tracing::{debug, trace, warn};

use crate::call_id::CallId;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::reactive::{AtomicLifecycle, DemandCounter, Lifecycle, Subscriber, Subscription};
use crate::transport::CallStreamObserver;

/// Writes a producer's elements to the outbound half of a call, pulling from the producer only
/// while the transport reports that it can take more.
///
/// The pump keeps a small batch of credit outstanding with the producer (one element by
/// default). A new batch is requested only once the previous one is used up and the transport is
/// ready, either right after a write or from the transport's on-ready callback. Whichever of the
/// two gets there first issues the request, so the producer never sees a duplicate.
///
/// A cancelled call cancels the producer.
pub struct BackpressurePump<T> {
    call_id: CallId,
    call: Arc<dyn CallStreamObserver<T>>,
    batch: u64,
    outstanding: DemandCounter,
    upstream: OnceLock<Arc<dyn Subscription>>,
    lifecycle: AtomicLifecycle,
}

impl<T: Send + 'static> BackpressurePump<T> {
    /// Create a pump for `call` and register its on-ready and on-cancel handlers. Subscribe the
    /// returned pump to the producer to start writing.
    pub fn new(
        call: Arc<dyn CallStreamObserver<T>>,
        config: &BridgeConfig,
        call_id: CallId,
    ) -> Arc<Self> {
        let pump = Arc::new(Self {
            call_id,
            call: Arc::clone(&call),
            batch: config.pump_credits(),
            outstanding: DemandCounter::new(),
            upstream: OnceLock::new(),
            lifecycle: AtomicLifecycle::new(),
        });

        let ready = Arc::downgrade(&pump);
        call.set_on_ready_handler(Arc::new(move || {
            if let Some(pump) = ready.upgrade() {
                pump.on_ready();
            }
        }));
        let cancelled = Arc::downgrade(&pump);
        call.set_on_cancel_handler(Arc::new(move || {
            if let Some(pump) = cancelled.upgrade() {
                pump.cancel();
            }
        }));

        pump
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.load()
    }

    /// Stop pulling from the producer. Nothing more is written to the call.
    pub fn cancel(&self) {
        if !self.lifecycle.terminate() {
            return;
        }
        debug!(call_id = %self.call_id, "Call cancelled, cancelling producer");
        self.outstanding.clear();
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    /// Cancel the producer and fail the call with `status`.
    fn abort(&self, status: Status) {
        if !self.lifecycle.terminate() {
            return;
        }
        warn!(call_id = %self.call_id, status = %status, "Aborting outbound call");
        self.outstanding.clear();
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
        self.call.on_error(status);
    }

    fn on_ready(&self) {
        if self.lifecycle.is_terminated() {
            return;
        }
        trace!(call_id = %self.call_id, "Transport ready");
        self.refill();
    }

    /// Request the next batch if none is outstanding.
    fn refill(&self) {
        let Some(upstream) = self.upstream.get() else {
            return;
        };
        if self.outstanding.refill_if_empty(self.batch) {
            self.lifecycle.activate();
            upstream.request(self.batch);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BackpressurePump<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(Arc::clone(&subscription)).is_err() {
            warn!(call_id = %self.call_id, "Cancelling duplicate producer subscription");
            subscription.cancel();
            return;
        }
        if !self.lifecycle.subscribe() {
            subscription.cancel();
            return;
        }
        self.refill();
    }

    fn on_next(&self, item: T) {
        if self.lifecycle.is_terminated() {
            trace!(call_id = %self.call_id, "Dropping element after termination");
            return;
        }
        if !self.outstanding.try_take() {
            warn!(call_id = %self.call_id, "Producer emitted more than requested");
            self.abort(BridgeError::DemandExceeded.into());
            return;
        }

        self.call.on_next(item);

        if self.call.is_ready() {
            self.refill();
        } else {
            trace!(call_id = %self.call_id, "Transport not ready, waiting for on-ready");
        }
    }

    fn on_error(&self, status: Status) {
        if self.lifecycle.terminate() {
            debug!(call_id = %self.call_id, status = %status, "Producer failed");
            self.call.on_error(status);
        }
    }

    fn on_complete(&self) {
        if self.lifecycle.terminate() {
            debug!(call_id = %self.call_id, "Producer completed");
            self.call.on_completed();
        }
    }
}
