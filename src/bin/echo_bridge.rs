use anyhow::Result;
use async_stream::stream;
use futures::StreamExt;
use grpc_flow_bridge::transport::{
    CallControl, CallStreamObserver, OnCancelHandler, OnReadyHandler, StreamObserver,
};
use grpc_flow_bridge::{BridgeConfig, Flowable, ServerCalls};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tonic::Status;
use tracing::{debug, error, info, warn};

const DEFAULT_MESSAGES: usize = 10;
const DEFAULT_WINDOW: usize = 2;
const NETWORK_TICK: Duration = Duration::from_millis(5);

/// Runs a bidirectional echo through the bridge over an in-process call.
///
/// Requests are only delivered when the bridge grants credit, and the response side accepts
/// `ECHO_WINDOW` unsent messages before reporting back-pressure.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let total = env_or("ECHO_MESSAGES", DEFAULT_MESSAGES)?;
    let window = env_or("ECHO_WINDOW", DEFAULT_WINDOW)?;

    let (credit_tx, credit_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = watch::channel(false);
    let call = Arc::new(LocalCall::new(window, credit_tx, done_tx));

    let calls = ServerCalls::new(BridgeConfig::default());
    let response: Arc<dyn CallStreamObserver<String>> = call.clone();
    let inbound = calls.many_to_many(response, |requests: Flowable<String>| {
        Ok(requests.map(|message| message.to_uppercase()))
    });

    info!(total, window, "Starting echo");
    tokio::spawn(feed_requests(inbound, credit_rx, total));
    tokio::spawn(drain_network(Arc::clone(&call)));

    done_rx.wait_for(|done| *done).await?;
    info!(written = call.written(), "Echo finished");
    Ok(())
}

fn env_or(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

/// Plays the remote client: delivers one request per granted credit, then half-closes.
async fn feed_requests(
    inbound: Arc<dyn StreamObserver<String>>,
    mut credits: mpsc::UnboundedReceiver<usize>,
    total: usize,
) {
    let mut messages = Box::pin(stream! {
        for i in 0..total {
            yield format!("message {i}");
        }
    });

    while let Some(credit) = credits.recv().await {
        for _ in 0..credit {
            match messages.next().await {
                Some(message) => {
                    debug!(message = %message, "Request delivered");
                    inbound.on_next(message);
                }
                None => {
                    debug!("Requests exhausted, half-closing");
                    inbound.on_completed();
                    return;
                }
            }
        }
    }
}

/// Plays the network: sends one buffered response per tick.
async fn drain_network(call: Arc<LocalCall>) {
    let mut ticker = tokio::time::interval(NETWORK_TICK);
    while !call.is_done() {
        ticker.tick().await;
        call.flush_one();
    }
}

/// An in-process call: the response half buffers up to `window` messages, inbound credit is
/// forwarded to the request feeder.
struct LocalCall {
    window: usize,
    in_flight: AtomicUsize,
    written: AtomicUsize,
    credits: mpsc::UnboundedSender<usize>,
    done: watch::Sender<bool>,
    on_ready: Mutex<Option<OnReadyHandler>>,
    on_cancel: Mutex<Option<OnCancelHandler>>,
}

impl LocalCall {
    fn new(window: usize, credits: mpsc::UnboundedSender<usize>, done: watch::Sender<bool>) -> Self {
        Self {
            window: window.max(1),
            in_flight: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            credits,
            done,
            on_ready: Mutex::new(None),
            on_cancel: Mutex::new(None),
        }
    }

    fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Send one buffered message, firing the on-ready handler when room opens up.
    fn flush_one(&self) {
        let Ok(previous) =
            self.in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        else {
            return;
        };
        if previous == self.window {
            let handler = self
                .on_ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn finish(&self) {
        self.done.send_replace(true);
    }
}

impl StreamObserver<String> for LocalCall {
    fn on_next(&self, value: String) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.written.fetch_add(1, Ordering::AcqRel);
        info!(response = %value, in_flight, "Response written");
    }

    fn on_error(&self, status: Status) {
        error!(status = %status, "Call failed");
        self.finish();
    }

    fn on_completed(&self) {
        info!("Response stream completed");
        self.finish();
    }
}

impl CallControl for LocalCall {
    fn disable_auto_inbound_flow_control(&self) {
        debug!("Auto inbound flow control disabled");
    }

    fn request(&self, count: usize) {
        debug!(count, "Inbound credit granted");
        if self.credits.send(count).is_err() {
            warn!("Request feeder is gone");
        }
    }

    fn cancel(&self, reason: Status) {
        warn!(reason = %reason, "Call cancelled");
        let handler = self
            .on_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
        self.finish();
    }
}

impl CallStreamObserver<String> for LocalCall {
    fn is_ready(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) < self.window
    }

    fn set_on_ready_handler(&self, handler: OnReadyHandler) {
        *self.on_ready.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn set_on_cancel_handler(&self, handler: OnCancelHandler) {
        *self.on_cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}
