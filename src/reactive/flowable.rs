use std::iter::Peekable;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tonic::Status;
use tracing::warn;

use crate::bridge::CancellationBridge;
use crate::error::{BridgeError, catch_setup};
use crate::reactive::{
    DemandCounter, EmptySubscription, Publisher, Single, SingleEmitter, Subscriber, Subscription,
    UNBOUNDED, reject,
};

/// A multi-value producer: a shareable handle to a [`Publisher`].
pub struct Flowable<T> {
    source: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flowable<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> Flowable<T> {
    pub fn from_publisher(publisher: impl Publisher<T> + 'static) -> Self {
        Self {
            source: Arc::new(publisher),
        }
    }

    pub fn from_shared(publisher: Arc<dyn Publisher<T>>) -> Self {
        Self { source: publisher }
    }

    /// Emit the items of `items` as they are requested, then complete.
    ///
    /// `items` is cloned for every subscriber, so each one sees the full sequence.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::from_publisher(IterPublisher { items })
    }

    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::from_iter(std::iter::once(value))
    }

    pub fn empty() -> Self {
        Self::from_publisher(TerminalPublisher { status: None })
    }

    pub fn error(status: Status) -> Self {
        Self::from_publisher(TerminalPublisher {
            status: Some(status),
        })
    }

    /// Build a fresh flowable for every subscriber. An error or panic from `factory` fails that
    /// subscriber only.
    pub fn defer<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Flowable<T>, Status> + Send + Sync + 'static,
    {
        Self::from_publisher(DeferPublisher { factory })
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(subscriber);
    }

    /// Subscribe with closures and unbounded demand. The returned handle cancels the flow.
    pub fn subscribe_with(
        &self,
        on_next: impl Fn(T) + Send + Sync + 'static,
        on_error: impl Fn(Status) + Send + Sync + 'static,
        on_complete: impl Fn() + Send + Sync + 'static,
    ) -> Arc<dyn Subscription> {
        let subscriber = Arc::new(LambdaSubscriber {
            upstream: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            on_next,
            on_error,
            on_complete,
            _item: PhantomData,
        });
        self.subscribe(subscriber.clone());
        subscriber
    }

    pub fn map<U, F>(self, f: F) -> Flowable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Flowable::from_publisher(MapPublisher {
            source: self,
            f: Arc::new(f),
        })
    }

    /// Fold every element into an accumulator, starting from `init` for each subscription, and
    /// resolve with the result once the flowable completes.
    pub fn reduce<U, F>(self, init: U, f: F) -> Single<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(U, T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Single::create(move |emitter| {
            self.subscribe(Arc::new(ReduceSubscriber {
                acc: Mutex::new(Some(init.clone())),
                f: Arc::clone(&f),
                emitter,
                _item: PhantomData::<fn(T)>,
            }));
        })
    }

    /// Guarantee a terminal signal to subscribers that cancel. See [`CancellationBridge`].
    pub fn with_cancellation_bridge(self) -> Self {
        Self::from_publisher(CancellationBridge::new(self))
    }
}

impl<T> Publisher<T> for Flowable<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.source.subscribe(subscriber);
    }
}

struct TerminalPublisher {
    status: Option<Status>,
}

impl<T> Publisher<T> for TerminalPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Arc::new(EmptySubscription));
        match &self.status {
            Some(status) => subscriber.on_error(status.clone()),
            None => subscriber.on_complete(),
        }
    }
}

struct DeferPublisher<F> {
    factory: F,
}

impl<T, F> Publisher<T> for DeferPublisher<F>
where
    T: Send + 'static,
    F: Fn() -> Result<Flowable<T>, Status> + Send + Sync,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        match catch_setup(|| (self.factory)()) {
            Ok(flowable) => flowable.subscribe(subscriber),
            Err(status) => {
                warn!(status = %status, "Deferred flowable failed to build");
                reject(subscriber.as_ref(), status);
            }
        }
    }
}

struct IterPublisher<I> {
    items: I,
}

impl<I> Publisher<I::Item> for IterPublisher<I>
where
    I: IntoIterator + Clone + Send + Sync,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        let mut iter = self.items.clone().into_iter().peekable();
        let exhausted = iter.peek().is_none();
        let subscription = Arc::new(IterSubscription {
            iter: Mutex::new(iter),
            demand: DemandCounter::new(),
            finished: AtomicBool::new(false),
            subscriber: Mutex::new(Some(Arc::clone(&subscriber))),
        });

        subscriber.on_subscribe(subscription.clone());
        if exhausted {
            subscription.complete();
        }
    }
}

/// Demand-driven drain over an iterator. Whoever moves demand off zero drains; a request that
/// arrives while a drain is running only adds credit, which the running drain picks up. This
/// keeps `on_next` -> `request` recursion flat.
struct IterSubscription<It: Iterator> {
    iter: Mutex<Peekable<It>>,
    demand: DemandCounter,
    finished: AtomicBool,
    // Dropped on termination to break the subscriber <-> subscription cycle.
    subscriber: Mutex<Option<Arc<dyn Subscriber<It::Item>>>>,
}

impl<It> IterSubscription<It>
where
    It: Iterator + Send,
    It::Item: Send + 'static,
{
    fn subscriber(&self) -> Option<Arc<dyn Subscriber<It::Item>>> {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the subscription finished, handing back the subscriber if this call did it.
    fn finish(&self) -> Option<Arc<dyn Subscriber<It::Item>>> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn complete(&self) {
        if let Some(subscriber) = self.finish() {
            subscriber.on_complete();
        }
    }

    fn drain(&self) {
        let Some(subscriber) = self.subscriber() else {
            return;
        };

        let mut emitted = 0u64;
        loop {
            let requested = self.demand.current();
            while emitted < requested {
                if self.finished.load(Ordering::Acquire) {
                    return;
                }

                let (next, last) = {
                    let mut iter = self.iter.lock().unwrap_or_else(PoisonError::into_inner);
                    let next = iter.next();
                    let last = iter.peek().is_none();
                    (next, last)
                };

                let Some(item) = next else {
                    self.complete();
                    return;
                };
                subscriber.on_next(item);
                emitted += 1;

                if last {
                    self.complete();
                    return;
                }
            }

            if self.demand.produced(emitted) == 0 {
                return;
            }
            emitted = 0;
        }
    }
}

impl<It> Subscription for IterSubscription<It>
where
    It: Iterator + Send,
    It::Item: Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            warn!("Rejecting request(0) on iterator source");
            if let Some(subscriber) = self.finish() {
                subscriber.on_error(BridgeError::InvalidDemand(n).into());
            }
            return;
        }
        if self.demand.add(n) == 0 {
            self.drain();
        }
    }

    fn cancel(&self) {
        let _ = self.finish();
    }
}

struct MapPublisher<T, F> {
    source: Flowable<T>,
    f: Arc<F>,
}

impl<T, U, F> Publisher<U> for MapPublisher<T, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<U>>) {
        self.source.subscribe(Arc::new(MapSubscriber {
            downstream: subscriber,
            f: Arc::clone(&self.f),
            _item: PhantomData::<fn(T)>,
        }));
    }
}

struct MapSubscriber<T, U, F> {
    downstream: Arc<dyn Subscriber<U>>,
    f: Arc<F>,
    _item: PhantomData<fn(T)>,
}

impl<T, U, F> Subscriber<T> for MapSubscriber<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, item: T) {
        self.downstream.on_next((self.f)(item));
    }

    fn on_error(&self, status: Status) {
        self.downstream.on_error(status);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct ReduceSubscriber<T, U, F> {
    acc: Mutex<Option<U>>,
    f: Arc<F>,
    emitter: SingleEmitter<U>,
    _item: PhantomData<fn(T)>,
}

impl<T, U, F> Subscriber<T> for ReduceSubscriber<T, U, F>
where
    T: Send + 'static,
    U: Send + Sync,
    F: Fn(U, T) -> U + Send + Sync,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, item: T) {
        let taken = self.acc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(acc) = taken {
            let next = (self.f)(acc, item);
            *self.acc.lock().unwrap_or_else(PoisonError::into_inner) = Some(next);
        }
    }

    fn on_error(&self, status: Status) {
        self.emitter.on_error(status);
    }

    fn on_complete(&self) {
        let taken = self.acc.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(acc) = taken {
            self.emitter.on_success(acc);
        }
    }
}

struct LambdaSubscriber<T, N, E, C> {
    upstream: OnceLock<Arc<dyn Subscription>>,
    cancelled: AtomicBool,
    done: AtomicBool,
    on_next: N,
    on_error: E,
    on_complete: C,
    _item: PhantomData<fn(T)>,
}

impl<T, N, E, C> Subscriber<T> for LambdaSubscriber<T, N, E, C>
where
    T: Send + 'static,
    N: Fn(T) + Send + Sync,
    E: Fn(Status) + Send + Sync,
    C: Fn() + Send + Sync,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.upstream.set(Arc::clone(&subscription)).is_err() {
            warn!("Cancelling duplicate subscription");
            subscription.cancel();
            return;
        }
        if self.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
        } else {
            subscription.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire) {
            (self.on_next)(item);
        }
    }

    fn on_error(&self, status: Status) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_error)(status);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.on_complete)();
        }
    }
}

impl<T, N, E, C> Subscription for LambdaSubscriber<T, N, E, C>
where
    N: Send + Sync,
    E: Send + Sync,
    C: Send + Sync,
{
    fn request(&self, n: u64) {
        if let Some(upstream) = self.upstream.get() {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(upstream) = self.upstream.get() {
            upstream.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::RecordingSubscriber;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tonic::Code;

    #[test]
    fn test_from_iter_honours_demand() {
        let flowable = Flowable::from_iter(vec![1, 2, 3, 4, 5]);
        let subscriber = RecordingSubscriber::new(0);
        flowable.subscribe(subscriber.clone());

        assert!(subscriber.values().is_empty());

        subscriber.request(2);
        assert_eq!(subscriber.values(), vec![1, 2]);
        assert!(!subscriber.is_completed());

        subscriber.request(2);
        assert_eq!(subscriber.values(), vec![1, 2, 3, 4]);

        subscriber.request(10);
        assert_eq!(subscriber.values(), vec![1, 2, 3, 4, 5]);
        assert!(subscriber.is_completed());
        assert_eq!(subscriber.terminal_count(), 1);
    }

    #[test]
    fn test_completes_when_demand_matches_length() {
        let flowable = Flowable::from_iter(vec!["a", "b"]);
        let subscriber = RecordingSubscriber::new(2);
        flowable.subscribe(subscriber.clone());

        assert_eq!(subscriber.values(), vec!["a", "b"]);
        assert!(subscriber.is_completed());
    }

    #[test]
    fn test_empty_and_error() {
        let subscriber = RecordingSubscriber::<u8>::new(0);
        Flowable::empty().subscribe(subscriber.clone());
        assert!(subscriber.is_completed());

        let subscriber = RecordingSubscriber::<u8>::new(0);
        Flowable::from_iter(Vec::new()).subscribe(subscriber.clone());
        assert!(subscriber.is_completed());
        assert_eq!(subscriber.terminal_count(), 1);

        let subscriber = RecordingSubscriber::<u8>::new(1);
        Flowable::error(Status::aborted("nope")).subscribe(subscriber.clone());
        assert_eq!(subscriber.error().unwrap().code(), Code::Aborted);
    }

    #[test]
    fn test_request_zero_is_an_error() {
        let subscriber = RecordingSubscriber::new(0);
        Flowable::from_iter(vec![1, 2]).subscribe(subscriber.clone());

        subscriber.request(0);
        assert_eq!(subscriber.error().unwrap().code(), Code::InvalidArgument);

        subscriber.request(5);
        assert!(subscriber.values().is_empty());
        assert_eq!(subscriber.terminal_count(), 1);
    }

    #[test]
    fn test_cancel_stops_emission() {
        let subscriber = RecordingSubscriber::cancelling_after(UNBOUNDED, 3);
        Flowable::from_iter(0..10_000).subscribe(subscriber.clone());

        assert_eq!(subscriber.values(), vec![0, 1, 2]);
        assert_eq!(subscriber.terminal_count(), 0);
    }

    #[test]
    fn test_reentrant_requests_stay_in_order() {
        let subscriber = RecordingSubscriber::requesting_each(1);
        Flowable::from_iter(0..500).subscribe(subscriber.clone());

        assert_eq!(subscriber.values(), (0..500).collect::<Vec<_>>());
        assert!(subscriber.is_completed());
    }

    #[test]
    fn test_map_and_resubscribe() {
        let flowable = Flowable::from_iter(vec![1, 2, 3]).map(|v| v * 10);

        for _ in 0..2 {
            let subscriber = RecordingSubscriber::new(UNBOUNDED);
            flowable.subscribe(subscriber.clone());
            assert_eq!(subscriber.values(), vec![10, 20, 30]);
            assert!(subscriber.is_completed());
        }
    }

    #[test]
    fn test_subscribe_with_and_cancel_handle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let completed = Arc::new(AtomicBool::new(false));
        let done = Arc::clone(&completed);

        let handle = Flowable::from_iter(vec![4, 5, 6]).subscribe_with(
            move |v| sink.lock().unwrap().push(v),
            |_| {},
            move || done.store(true, Ordering::SeqCst),
        );
        handle.cancel();

        assert_eq!(*seen.lock().unwrap(), vec![4, 5, 6]);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reduce_folds_each_subscription() {
        let sum = Flowable::from_iter(1..=4u32).reduce(0u32, |acc, v| acc + v);
        assert_eq!(sum.clone().into_future().await.unwrap(), 10);
        assert_eq!(sum.into_future().await.unwrap(), 10);

        let failed = Flowable::<u32>::error(Status::aborted("stop"))
            .reduce(0u32, |acc, v| acc + v)
            .into_future()
            .await;
        assert_eq!(failed.unwrap_err().code(), Code::Aborted);
    }

    #[test]
    fn test_defer_builds_per_subscriber_and_catches_failures() {
        let builds = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let deferred = Flowable::defer(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(Flowable::just(n))
        });
        for expected in 0..2u32 {
            let subscriber = RecordingSubscriber::new(1);
            deferred.subscribe(subscriber.clone());
            assert_eq!(subscriber.values(), vec![expected]);
        }

        let subscriber = RecordingSubscriber::<u8>::new(1);
        Flowable::defer(|| -> Result<Flowable<u8>, Status> { panic!("factory blew up") })
            .subscribe(subscriber.clone());
        assert_eq!(subscriber.subscribe_calls(), 1);
        assert_eq!(subscriber.error().unwrap().code(), Code::Internal);
    }

    #[test]
    fn test_random_request_sequences_never_exceed_demand() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let len = rng.random_range(0..200u32);
            let subscriber = RecordingSubscriber::new(0);
            Flowable::from_iter(0..len).subscribe(subscriber.clone());

            let mut granted = 0u64;
            while !subscriber.is_completed() {
                let n = rng.random_range(1..8u64);
                granted += n;
                subscriber.request(n);
                assert!(subscriber.values().len() as u64 <= granted);
            }
            assert_eq!(subscriber.values().len(), len as usize);
            assert_eq!(subscriber.terminal_count(), 1);
        }
    }
}
