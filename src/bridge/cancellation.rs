use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tonic::Status;
use tracing::{trace, warn};

use crate::reactive::{Flowable, Publisher, Subscriber, Subscription};

/// Wraps a flowable so that a subscriber which cancels still receives a terminal signal.
///
/// Cancelling through the bridge cancels the upstream subscription and then completes the
/// subscriber, unless a terminal already reached it. Each subscriber sees at most one terminal
/// and nothing after it.
pub struct CancellationBridge<T> {
    source: Flowable<T>,
}

impl<T: Send + 'static> CancellationBridge<T> {
    pub fn new(source: Flowable<T>) -> Self {
        Self { source }
    }
}

impl<T: Send + 'static> Publisher<T> for CancellationBridge<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let shared = Arc::new(Shared {
            actual: Mutex::new(Some(subscriber)),
            upstream: OnceLock::new(),
        });
        self.source.subscribe(Arc::new(BridgeSubscriber(shared)));
    }
}

struct Shared<T> {
    // Taken by the first terminal.
    actual: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    upstream: OnceLock<Arc<dyn Subscription>>,
}

impl<T> Shared<T> {
    fn actual(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.actual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_actual(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.actual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

struct BridgeSubscriber<T>(Arc<Shared<T>>);

impl<T: Send + 'static> Subscriber<T> for BridgeSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.0.upstream.set(Arc::clone(&subscription)).is_err() {
            warn!("Cancelling duplicate upstream subscription");
            subscription.cancel();
            return;
        }
        if let Some(actual) = self.0.actual() {
            actual.on_subscribe(Arc::new(BridgeSubscription(Arc::clone(&self.0))));
        }
    }

    fn on_next(&self, item: T) {
        match self.0.actual() {
            Some(actual) => actual.on_next(item),
            None => trace!("Dropping element after terminal"),
        }
    }

    fn on_error(&self, status: Status) {
        if let Some(actual) = self.0.take_actual() {
            actual.on_error(status);
        }
    }

    fn on_complete(&self) {
        if let Some(actual) = self.0.take_actual() {
            actual.on_complete();
        }
    }
}

struct BridgeSubscription<T>(Arc<Shared<T>>);

impl<T: Send + 'static> Subscription for BridgeSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            warn!("Ignoring request(0)");
            return;
        }
        if let Some(upstream) = self.0.upstream.get() {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        if let Some(upstream) = self.0.upstream.get() {
            upstream.cancel();
        }
        if let Some(actual) = self.0.take_actual() {
            actual.on_complete();
        }
    }
}
