use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tonic::Status;
use tracing::{debug, trace, warn};

use crate::call_id::CallId;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, cancelled_by_subscriber, is_cancelled};
use crate::reactive::{
    AtomicLifecycle, DemandCounter, Flowable, Lifecycle, Publisher, Subscriber, Subscription,
    Terminal, reject,
};
use crate::transport::{CallControl, StreamObserver};

/// Presents the inbound messages of a call as a [`Publisher`].
///
/// The transport feeds messages through the [`StreamObserver`] side; the single subscriber pulls
/// them through its subscription, and every `request(n)` becomes credit for `n` more messages on
/// the call. Auto inbound flow control is switched off when the call is attached, so nothing
/// arrives that the subscriber has not asked for.
///
/// On the client side the call handle only exists once the transport hands it over in
/// `before_start`, so the publisher can be created [`detached`](Self::detached) and
/// [`attach`](Self::attach)ed later. Credit and cancellation issued in the meantime are held back
/// and flushed on attach. A terminal signal that arrives before anybody subscribed is kept and
/// delivered right after `on_subscribe`.
pub struct StreamObserverPublisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StreamObserverPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    call_id: CallId,
    cancelled_as_completion: bool,
    lifecycle: AtomicLifecycle,
    demand: DemandCounter,
    state: Mutex<State<T>>,
}

struct State<T> {
    call: Option<Arc<dyn CallControl>>,
    subscriber: Option<Arc<dyn Subscriber<T>>>,
    // Set once `on_subscribe` has returned; terminals are held back until then.
    published: bool,
    pending_terminal: Option<Terminal>,
    unsent_credit: u64,
    cancel_on_attach: bool,
}

impl<T: Send + 'static> StreamObserverPublisher<T> {
    /// Bind to a call whose control handle is already known.
    pub fn new(call: Arc<dyn CallControl>, config: &BridgeConfig, call_id: CallId) -> Self {
        let publisher = Self::detached(config, call_id);
        publisher.attach(call);
        publisher
    }

    /// Create the publisher before the call exists. See [`attach`](Self::attach).
    pub fn detached(config: &BridgeConfig, call_id: CallId) -> Self {
        Self {
            inner: Arc::new(Inner {
                call_id,
                cancelled_as_completion: config.cancelled_as_completion,
                lifecycle: AtomicLifecycle::new(),
                demand: DemandCounter::new(),
                state: Mutex::new(State {
                    call: None,
                    subscriber: None,
                    published: false,
                    pending_terminal: None,
                    unsent_credit: 0,
                    cancel_on_attach: false,
                }),
            }),
        }
    }

    /// Hand over the call's control handle. Disables auto inbound flow control, then forwards
    /// any credit or cancellation the subscriber issued before the call was known. Only the
    /// first call is kept.
    pub fn attach(&self, call: Arc<dyn CallControl>) {
        let (credit, cancel) = {
            let mut state = self.inner.state();
            if state.call.is_some() {
                warn!(call_id = %self.inner.call_id, "Publisher already attached to a call");
                return;
            }
            call.disable_auto_inbound_flow_control();
            state.call = Some(Arc::clone(&call));
            (
                std::mem::take(&mut state.unsent_credit),
                std::mem::take(&mut state.cancel_on_attach),
            )
        };

        debug!(call_id = %self.inner.call_id, credit, cancel, "Attached inbound call");
        if cancel {
            call.cancel(cancelled_by_subscriber());
        } else if credit > 0 {
            call.request(transport_credit(credit));
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lifecycle.load()
    }

    /// Fail the subscriber with `status` and cancel the call. Used when the bridge itself gives
    /// up on a call, such as when the user's setup code failed.
    pub fn fail(&self, status: Status) {
        self.inner.abort(status);
    }

    /// End the inbound flow without cancelling the call, failing a current subscriber with
    /// `status`. Used once the call's response side is already closed; later messages are dropped.
    pub fn close(&self, status: Status) {
        let inner = &self.inner;
        let subscriber = inner.state().subscriber.take();
        match subscriber {
            Some(subscriber) => {
                inner.finish(subscriber.as_ref(), Terminal::Failed(status));
            }
            None => {
                if inner.lifecycle.terminate() {
                    debug!(call_id = %inner.call_id, "Inbound flow closed");
                    inner.demand.clear();
                }
            }
        }
    }

    pub fn flowable(&self) -> Flowable<T> {
        Flowable::from_publisher(self.clone())
    }
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.state().subscriber.clone()
    }

    /// Cancel the call, or remember to do so once it is attached.
    fn cancel_call(&self) {
        let call = {
            let mut state = self.state();
            if state.call.is_none() {
                state.cancel_on_attach = true;
            }
            state.call.clone()
        };
        self.demand.clear();
        if let Some(call) = call {
            call.cancel(cancelled_by_subscriber());
        }
    }

    /// Terminate from inside the bridge: fail the subscriber, or whoever subscribes later, then
    /// cancel the call.
    fn abort(&self, status: Status) {
        if self.lifecycle.is_terminated() || self.state().pending_terminal.is_some() {
            return;
        }
        warn!(call_id = %self.call_id, status = %status, "Aborting inbound call");
        self.signal_terminal(Terminal::Failed(status));
        self.cancel_call();
    }

    /// Deliver a terminal, holding it back until the subscriber's `on_subscribe` has returned.
    fn signal_terminal(&self, terminal: Terminal) {
        let subscriber = {
            let mut state = self.state();
            if !state.published {
                if !self.lifecycle.is_terminated() && state.pending_terminal.is_none() {
                    trace!(call_id = %self.call_id, "Buffering terminal until subscribed");
                    state.pending_terminal = Some(terminal);
                }
                return;
            }
            match state.subscriber.take() {
                Some(subscriber) => subscriber,
                None => {
                    trace!(call_id = %self.call_id, "Dropping terminal after termination");
                    return;
                }
            }
        };
        self.finish(subscriber.as_ref(), terminal);
    }

    /// Move to `Terminated` and deliver `terminal`. Returns false if the flow had already ended.
    fn finish(&self, subscriber: &dyn Subscriber<T>, terminal: Terminal) -> bool {
        if !self.lifecycle.terminate() {
            trace!(call_id = %self.call_id, "Dropping terminal after termination");
            return false;
        }
        debug!(call_id = %self.call_id, terminal = ?terminal, "Inbound call terminated");
        self.demand.clear();
        terminal.deliver(subscriber);
        true
    }
}

impl<T: Send + 'static> Publisher<T> for StreamObserverPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if !self.inner.lifecycle.subscribe() {
            warn!(call_id = %self.inner.call_id, "Rejecting second subscriber");
            reject(subscriber.as_ref(), BridgeError::AlreadySubscribed.into());
            return;
        }

        self.inner.state().subscriber = Some(Arc::clone(&subscriber));
        subscriber.on_subscribe(Arc::new(InboundSubscription {
            inner: Arc::clone(&self.inner),
        }));

        let drained = {
            let mut state = self.inner.state();
            state.published = true;
            match state.pending_terminal.take() {
                Some(terminal) => state.subscriber.take().map(|s| (s, terminal)),
                None => None,
            }
        };
        if let Some((subscriber, terminal)) = drained {
            self.inner.finish(subscriber.as_ref(), terminal);
        }
    }
}

impl<T: Send + 'static> StreamObserver<T> for StreamObserverPublisher<T> {
    fn on_next(&self, value: T) {
        let inner = &self.inner;
        if inner.lifecycle.is_terminated() {
            trace!(call_id = %inner.call_id, "Dropping message after termination");
            return;
        }
        if !inner.demand.try_take() {
            warn!(call_id = %inner.call_id, "Transport delivered a message without demand");
            inner.abort(BridgeError::DemandExceeded.into());
            return;
        }
        if let Some(subscriber) = inner.subscriber() {
            subscriber.on_next(value);
        }
    }

    fn on_error(&self, status: Status) {
        let terminal = if is_cancelled(&status) && self.inner.cancelled_as_completion {
            debug!(call_id = %self.inner.call_id, "Call cancelled, completing consumer");
            Terminal::Completed
        } else {
            Terminal::Failed(status)
        };
        self.inner.signal_terminal(terminal);
    }

    fn on_completed(&self) {
        self.inner.signal_terminal(Terminal::Completed);
    }
}

struct InboundSubscription<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Subscription for InboundSubscription<T> {
    fn request(&self, n: u64) {
        let inner = &self.inner;
        if inner.lifecycle.is_terminated() {
            return;
        }
        if n == 0 {
            inner.abort(BridgeError::InvalidDemand(n).into());
            return;
        }

        inner.lifecycle.activate();
        inner.demand.add(n);
        let call = {
            let mut state = inner.state();
            if state.call.is_none() {
                state.unsent_credit = state.unsent_credit.saturating_add(n);
            }
            state.call.clone()
        };
        if let Some(call) = call {
            call.request(transport_credit(n));
        }
    }

    fn cancel(&self) {
        let inner = &self.inner;
        let subscriber = inner.state().subscriber.take();
        let Some(subscriber) = subscriber else {
            return;
        };
        if inner.finish(subscriber.as_ref(), Terminal::Cancelled) {
            inner.cancel_call();
        }
    }
}

/// Transport credit is a `usize`; anything larger is as good as unbounded.
fn transport_credit(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::UNBOUNDED;
    use crate::testkit::{RecordingCall, RecordingSubscriber};
    use crate::transport::CallStreamObserver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tonic::Code;

    fn attached() -> (StreamObserverPublisher<u32>, Arc<RecordingCall<u32>>) {
        let call = RecordingCall::new();
        let publisher =
            StreamObserverPublisher::new(call.clone(), &BridgeConfig::default(), CallId::generate());
        (publisher, call)
    }

    #[test]
    fn test_attach_disables_auto_flow_control() {
        let (publisher, call) = attached();
        assert!(call.auto_flow_disabled());
        assert_eq!(publisher.lifecycle(), Lifecycle::Created);
        assert!(call.request_calls().is_empty());
    }

    #[test]
    fn test_credit_matches_demand() {
        let (publisher, call) = attached();
        let subscriber = RecordingSubscriber::new(3);
        publisher.subscribe(subscriber.clone());
        assert_eq!(call.request_calls(), vec![3]);
        assert_eq!(publisher.lifecycle(), Lifecycle::Active);

        for v in 0..3 {
            publisher.on_next(v);
        }
        subscriber.request(2);
        publisher.on_next(3);
        publisher.on_completed();

        assert_eq!(call.request_calls(), vec![3, 2]);
        assert_eq!(subscriber.values(), vec![0, 1, 2, 3]);
        assert!(subscriber.is_completed());
        assert_eq!(publisher.lifecycle(), Lifecycle::Terminated);
    }

    #[test]
    fn test_unbounded_demand_is_clamped_for_transport() {
        let (publisher, call) = attached();
        publisher.subscribe(RecordingSubscriber::new(UNBOUNDED));
        assert_eq!(call.request_calls(), vec![usize::MAX]);
    }

    #[test]
    fn test_message_without_demand_fails_and_cancels() {
        let (publisher, call) = attached();
        let subscriber = RecordingSubscriber::new(1);
        publisher.subscribe(subscriber.clone());

        publisher.on_next(1);
        publisher.on_next(2);
        publisher.on_next(3);

        assert_eq!(subscriber.values(), vec![1]);
        assert_eq!(subscriber.error().unwrap().code(), Code::ResourceExhausted);
        assert_eq!(subscriber.terminal_count(), 1);
        assert!(!subscriber.next_after_terminal());
        assert_eq!(call.cancelled().unwrap().code(), Code::Cancelled);
    }

    #[test]
    fn test_request_zero_fails_and_cancels() {
        let (publisher, call) = attached();
        let subscriber = RecordingSubscriber::new(0);
        publisher.subscribe(subscriber.clone());

        subscriber.request(0);

        assert_eq!(subscriber.error().unwrap().code(), Code::InvalidArgument);
        assert!(call.cancelled().is_some());
        assert!(call.request_calls().is_empty());
    }

    #[test]
    fn test_cancel_cancels_call_once_and_drops_later_signals() {
        let (publisher, call) = attached();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);
        call.set_on_cancel_handler(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let subscriber = RecordingSubscriber::cancelling_after(UNBOUNDED, 2);
        publisher.subscribe(subscriber.clone());
        for v in 0..5 {
            publisher.on_next(v);
        }
        subscriber.cancel();
        publisher.on_error(Status::cancelled("peer saw cancel"));

        assert_eq!(subscriber.values(), vec![0, 1]);
        assert_eq!(subscriber.terminal_count(), 0);
        assert_eq!(call.cancelled().unwrap().code(), Code::Cancelled);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_before_subscribe_is_buffered() {
        let (publisher, _call) = attached();
        publisher.on_error(Status::unavailable("gone"));
        publisher.on_completed();

        let subscriber = RecordingSubscriber::<u32>::new(0);
        publisher.subscribe(subscriber.clone());

        assert_eq!(subscriber.subscribe_calls(), 1);
        assert_eq!(subscriber.error().unwrap().code(), Code::Unavailable);
        assert_eq!(subscriber.terminal_count(), 1);
    }

    #[test]
    fn test_inbound_cancelled_completes_consumer() {
        let (publisher, _call) = attached();
        let subscriber = RecordingSubscriber::new(1);
        publisher.subscribe(subscriber.clone());
        publisher.on_error(Status::cancelled("client went away"));
        assert!(subscriber.is_completed());

        let config = BridgeConfig::builder().cancelled_as_completion(false).build();
        let publisher =
            StreamObserverPublisher::<u32>::new(RecordingCall::<u32>::new(), &config, CallId::generate());
        let subscriber = RecordingSubscriber::new(1);
        publisher.subscribe(subscriber.clone());
        publisher.on_error(Status::cancelled("client went away"));
        assert_eq!(subscriber.error().unwrap().code(), Code::Cancelled);
    }

    #[test]
    fn test_second_subscriber_rejected() {
        let (publisher, _call) = attached();
        let first = RecordingSubscriber::<u32>::new(1);
        let second = RecordingSubscriber::<u32>::new(1);
        publisher.subscribe(first.clone());
        publisher.subscribe(second.clone());

        assert_eq!(second.subscribe_calls(), 1);
        assert_eq!(second.error().unwrap().code(), Code::FailedPrecondition);
        assert_eq!(first.terminal_count(), 0);
    }

    #[test]
    fn test_detached_flushes_credit_on_attach() {
        let publisher =
            StreamObserverPublisher::<u32>::detached(&BridgeConfig::default(), CallId::generate());
        let subscriber = RecordingSubscriber::new(2);
        publisher.subscribe(subscriber.clone());
        subscriber.request(3);

        let call = RecordingCall::<u32>::new();
        publisher.attach(call.clone());
        assert!(call.auto_flow_disabled());
        assert_eq!(call.request_calls(), vec![5]);

        subscriber.request(1);
        assert_eq!(call.request_calls(), vec![5, 1]);
    }

    #[test]
    fn test_detached_cancel_is_forwarded_on_attach() {
        let publisher =
            StreamObserverPublisher::<u32>::detached(&BridgeConfig::default(), CallId::generate());
        let subscriber = RecordingSubscriber::new(4);
        publisher.subscribe(subscriber.clone());
        subscriber.cancel();

        let call = RecordingCall::<u32>::new();
        publisher.attach(call.clone());
        assert!(call.cancelled().is_some());
        assert!(call.request_calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_call() {
        use futures::StreamExt;

        let (publisher, call) = attached();
        let mut stream = publisher.flowable().into_stream(2);
        publisher.on_next(7);
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
        drop(stream);

        assert_eq!(call.request_calls(), vec![2, 1]);
        assert!(call.cancelled().is_some());
    }

    #[test]
    fn test_terminal_racing_subscribe_waits_for_on_subscribe() {
        use std::sync::Barrier;
        use std::thread;

        for _ in 0..2_000 {
            let (publisher, _call) = attached();
            let subscriber = RecordingSubscriber::<u32>::new(0);
            let barrier = Arc::new(Barrier::new(2));

            let transport = {
                let publisher = publisher.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    publisher.on_completed();
                })
            };
            barrier.wait();
            publisher.subscribe(subscriber.clone());
            transport.join().unwrap();

            assert!(!subscriber.terminal_before_subscribed());
            assert!(subscriber.is_completed());
            assert_eq!(subscriber.terminal_count(), 1);
        }
    }

    #[test]
    fn test_close_drops_later_signals_without_cancelling() {
        let (publisher, call) = attached();
        publisher.close(Status::internal("handler failed"));
        publisher.on_next(1);
        publisher.on_completed();

        assert_eq!(publisher.lifecycle(), Lifecycle::Terminated);
        assert!(call.cancelled().is_none());

        let (publisher, call) = attached();
        let subscriber = RecordingSubscriber::new(2);
        publisher.subscribe(subscriber.clone());
        publisher.close(Status::internal("handler failed"));

        assert_eq!(subscriber.error().unwrap().code(), Code::Internal);
        assert_eq!(subscriber.terminal_count(), 1);
        assert!(call.cancelled().is_none());
    }
}
