use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll, ready};

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;
use tracing::{debug, trace, warn};

use crate::error::BridgeError;
use crate::reactive::{DemandCounter, Flowable, Publisher, Subscriber, Subscription, reject};

impl<T: Send + 'static> Flowable<T> {
    /// Adapt an async stream into a flowable. The stream is polled on the current tokio runtime
    /// and only while the subscriber has outstanding demand.
    ///
    /// A stream can be consumed once, so a second subscriber fails with
    /// [`BridgeError::AlreadySubscribed`].
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, Status>> + Send + 'static,
    {
        Self::from_publisher(StreamPublisher {
            stream: Mutex::new(Some(stream.boxed())),
        })
    }

    /// Subscribe now and expose the elements as an async stream.
    ///
    /// `prefetch` elements are requested up front and one more each time the stream yields, so at
    /// most `prefetch` elements are buffered. Dropping the stream before it ends cancels the
    /// subscription.
    pub fn into_stream(self, prefetch: u64) -> FlowableStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(ChannelSubscriber {
            tx,
            prefetch: prefetch.max(1),
            upstream: OnceLock::new(),
        });
        self.subscribe(subscriber.clone());

        FlowableStream {
            events: UnboundedReceiverStream::new(rx),
            subscriber,
            done: false,
        }
    }
}

enum Signal<T> {
    Next(T),
    Error(Status),
    Complete,
}

struct ChannelSubscriber<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
    prefetch: u64,
    upstream: OnceLock<Arc<dyn Subscription>>,
}

impl<T> ChannelSubscriber<T> {
    fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }

    fn send(&self, signal: Signal<T>) {
        if self.tx.send(signal).is_err() {
            trace!("Stream dropped, discarding signal");
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for ChannelSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(Arc::clone(&subscription)).is_err() {
            warn!("Cancelling duplicate subscription");
            subscription.cancel();
            return;
        }
        subscription.request(self.prefetch);
    }

    fn on_next(&self, item: T) {
        self.send(Signal::Next(item));
    }

    fn on_error(&self, status: Status) {
        self.send(Signal::Error(status));
    }

    fn on_complete(&self) {
        self.send(Signal::Complete);
    }
}

/// A [`Flowable`] consumed as a [`Stream`] of results. Created by [`Flowable::into_stream`].
pub struct FlowableStream<T> {
    events: UnboundedReceiverStream<Signal<T>>,
    subscriber: Arc<ChannelSubscriber<T>>,
    done: bool,
}

impl<T: Send + 'static> Stream for FlowableStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.events).poll_next(cx)) {
            Some(Signal::Next(item)) => {
                this.subscriber.request(1);
                Poll::Ready(Some(Ok(item)))
            }
            Some(Signal::Error(status)) => {
                this.done = true;
                Poll::Ready(Some(Err(status)))
            }
            Some(Signal::Complete) | None => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<T> Drop for FlowableStream<T> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Stream dropped before its end, cancelling subscription");
            self.subscriber.cancel();
        }
    }
}

struct StreamPublisher<T> {
    stream: Mutex<Option<BoxStream<'static, Result<T, Status>>>>,
}

impl<T: Send + 'static> Publisher<T> for StreamPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let Some(stream) = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            reject(subscriber.as_ref(), BridgeError::AlreadySubscribed.into());
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            reject(subscriber.as_ref(), BridgeError::NoRuntime.into());
            return;
        };

        let subscription = Arc::new(StreamSubscription {
            demand: DemandCounter::new(),
            wake: Notify::new(),
            cancelled: AtomicBool::new(false),
            invalid_request: AtomicBool::new(false),
        });
        subscriber.on_subscribe(subscription.clone());
        runtime.spawn(drive(stream, subscriber, subscription));
    }
}

struct StreamSubscription {
    demand: DemandCounter,
    wake: Notify,
    cancelled: AtomicBool,
    invalid_request: AtomicBool,
}

impl Subscription for StreamSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            warn!("Rejecting request(0) on stream source");
            self.invalid_request.store(true, Ordering::Release);
        } else {
            self.demand.add(n);
        }
        self.wake.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Pull from `stream` one element per credit until it ends, fails, or is cancelled.
async fn drive<T>(
    mut stream: BoxStream<'static, Result<T, Status>>,
    subscriber: Arc<dyn Subscriber<T>>,
    subscription: Arc<StreamSubscription>,
) {
    loop {
        loop {
            if subscription.cancelled.load(Ordering::Acquire) {
                trace!("Stream source cancelled");
                return;
            }
            if subscription.invalid_request.load(Ordering::Acquire) {
                subscriber.on_error(BridgeError::InvalidDemand(0).into());
                return;
            }
            if subscription.demand.try_take() {
                break;
            }
            subscription.wake.notified().await;
        }

        // Stay responsive to cancel while the source is idle.
        let next = loop {
            tokio::select! {
                next = stream.next() => break next,
                _ = subscription.wake.notified() => {
                    if subscription.cancelled.load(Ordering::Acquire) {
                        trace!("Stream source cancelled while waiting for an item");
                        return;
                    }
                    if subscription.invalid_request.load(Ordering::Acquire) {
                        subscriber.on_error(BridgeError::InvalidDemand(0).into());
                        return;
                    }
                }
            }
        };

        match next {
            Some(Ok(item)) => {
                if subscription.cancelled.load(Ordering::Acquire) {
                    return;
                }
                subscriber.on_next(item);
            }
            Some(Err(status)) => {
                subscriber.on_error(status);
                return;
            }
            None => {
                subscriber.on_complete();
                return;
            }
        }
    }
}
