//! Recording doubles for the reactive and transport roles.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tonic::Status;

use crate::reactive::{Subscriber, Subscription, Terminal};
use crate::transport::{
    CallControl, CallStreamObserver, OnCancelHandler, OnReadyHandler, StreamObserver,
};

pub(crate) enum Event<T> {
    Next(T),
    Error(Status),
    Complete,
}

/// A subscriber that records every signal and can drive demand by hand.
pub(crate) struct RecordingSubscriber<T> {
    initial: u64,
    request_each: u64,
    cancel_after: Option<usize>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    subscribe_calls: AtomicUsize,
    // Set when `on_subscribe` returns.
    subscribed: AtomicBool,
    early_terminal: AtomicBool,
    events: Mutex<Vec<Event<T>>>,
}

impl<T> RecordingSubscriber<T> {
    fn build(initial: u64, request_each: u64, cancel_after: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            initial,
            request_each,
            cancel_after,
            subscription: Mutex::new(None),
            subscribe_calls: AtomicUsize::new(0),
            subscribed: AtomicBool::new(false),
            early_terminal: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Requests `initial` elements on subscribe (nothing when zero).
    pub(crate) fn new(initial: u64) -> Arc<Self> {
        Self::build(initial, 0, None)
    }

    /// Requests `n` on subscribe and again after every element.
    pub(crate) fn requesting_each(n: u64) -> Arc<Self> {
        Self::build(n, n, None)
    }

    /// Cancels its subscription once `count` elements have arrived.
    pub(crate) fn cancelling_after(initial: u64, count: usize) -> Arc<Self> {
        Self::build(initial, 0, Some(count))
    }

    fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.subscription.lock().unwrap().clone()
    }

    pub(crate) fn request(&self, n: u64) {
        if let Some(subscription) = self.subscription() {
            subscription.request(n);
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(subscription) = self.subscription() {
            subscription.cancel();
        }
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn terminal_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !matches!(e, Event::Next(_)))
            .count()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Complete))
    }

    pub(crate) fn error(&self) -> Option<Status> {
        self.events.lock().unwrap().iter().find_map(|e| match e {
            Event::Error(status) => Some(status.clone()),
            _ => None,
        })
    }

    /// Whether a terminal signal arrived before `on_subscribe` had returned.
    pub(crate) fn terminal_before_subscribed(&self) -> bool {
        self.early_terminal.load(Ordering::SeqCst)
    }

    fn record_terminal(&self, event: Event<T>) {
        if !self.subscribed.load(Ordering::SeqCst) {
            self.early_terminal.store(true, Ordering::SeqCst);
        }
        self.events.lock().unwrap().push(event);
    }

    /// Whether any element arrived after the first terminal signal.
    pub(crate) fn next_after_terminal(&self) -> bool {
        let events = self.events.lock().unwrap();
        let Some(first_terminal) = events.iter().position(|e| !matches!(e, Event::Next(_))) else {
            return false;
        };
        events[first_terminal..]
            .iter()
            .any(|e| matches!(e, Event::Next(_)))
    }
}

impl<T: Clone> RecordingSubscriber<T> {
    pub(crate) fn values(&self) -> Vec<T> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T: Send + 'static> Subscriber<T> for RecordingSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        *self.subscription.lock().unwrap() = Some(Arc::clone(&subscription));
        if self.initial > 0 {
            subscription.request(self.initial);
        }
        self.subscribed.store(true, Ordering::SeqCst);
    }

    fn on_next(&self, item: T) {
        let count = {
            let mut events = self.events.lock().unwrap();
            events.push(Event::Next(item));
            events.iter().filter(|e| matches!(e, Event::Next(_))).count()
        };
        if self.cancel_after == Some(count) {
            self.cancel();
        }
        if self.request_each > 0 {
            self.request(self.request_each);
        }
    }

    fn on_error(&self, status: Status) {
        self.record_terminal(Event::Error(status));
    }

    fn on_complete(&self) {
        self.record_terminal(Event::Complete);
    }
}

/// An in-memory call half with credit accounting and controllable readiness.
///
/// Readiness is `ready && written < write_budget`; tests lower the budget to make the call
/// report back-pressure after a given number of writes.
pub(crate) struct RecordingCall<T> {
    ready: AtomicBool,
    write_budget: AtomicUsize,
    auto_flow_disabled: AtomicBool,
    requests: Mutex<Vec<usize>>,
    cancelled: Mutex<Option<Status>>,
    written: Mutex<Vec<T>>,
    terminals: Mutex<Vec<Terminal>>,
    on_ready: Mutex<Option<OnReadyHandler>>,
    on_cancel: Mutex<Option<OnCancelHandler>>,
}

impl<T> RecordingCall<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            write_budget: AtomicUsize::new(usize::MAX),
            auto_flow_disabled: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(None),
            written: Mutex::new(Vec::new()),
            terminals: Mutex::new(Vec::new()),
            on_ready: Mutex::new(None),
            on_cancel: Mutex::new(None),
        })
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Report not-ready once `writes` messages in total have been written.
    pub(crate) fn set_write_budget(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    /// Allow `writes` more messages, mark the call ready, and fire the on-ready handler.
    pub(crate) fn drain(&self, writes: usize) {
        let written = self.written.lock().unwrap().len();
        self.write_budget
            .store(written.saturating_add(writes), Ordering::SeqCst);
        self.fire_ready();
    }

    pub(crate) fn fire_ready(&self) {
        self.set_ready(true);
        let handler = self.on_ready.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn fire_cancel(&self) {
        let handler = self.on_cancel.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn has_on_ready_handler(&self) -> bool {
        self.on_ready.lock().unwrap().is_some()
    }

    pub(crate) fn auto_flow_disabled(&self) -> bool {
        self.auto_flow_disabled.load(Ordering::SeqCst)
    }

    pub(crate) fn request_calls(&self) -> Vec<usize> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn total_requested(&self) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .fold(0usize, |acc, n| acc.saturating_add(*n))
    }

    pub(crate) fn cancelled(&self) -> Option<Status> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn written_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub(crate) fn terminals(&self) -> Vec<Terminal> {
        self.terminals.lock().unwrap().clone()
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self.terminals().as_slice(), [Terminal::Completed])
    }

    pub(crate) fn error(&self) -> Option<Status> {
        self.terminals().into_iter().find_map(|t| match t {
            Terminal::Failed(status) => Some(status),
            _ => None,
        })
    }
}

impl<T: Clone> RecordingCall<T> {
    pub(crate) fn written(&self) -> Vec<T> {
        self.written.lock().unwrap().clone()
    }
}

impl<T: Send> StreamObserver<T> for RecordingCall<T> {
    fn on_next(&self, value: T) {
        self.written.lock().unwrap().push(value);
    }

    fn on_error(&self, status: Status) {
        self.terminals.lock().unwrap().push(Terminal::Failed(status));
    }

    fn on_completed(&self) {
        self.terminals.lock().unwrap().push(Terminal::Completed);
    }
}

impl<T: Send> CallControl for RecordingCall<T> {
    fn disable_auto_inbound_flow_control(&self) {
        self.auto_flow_disabled.store(true, Ordering::SeqCst);
    }

    fn request(&self, count: usize) {
        self.requests.lock().unwrap().push(count);
    }

    fn cancel(&self, reason: Status) {
        self.cancelled.lock().unwrap().get_or_insert(reason);
        self.fire_cancel();
    }
}

impl<T: Send> CallStreamObserver<T> for RecordingCall<T> {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
            && self.written_count() < self.write_budget.load(Ordering::SeqCst)
    }

    fn set_on_ready_handler(&self, handler: OnReadyHandler) {
        *self.on_ready.lock().unwrap() = Some(handler);
    }

    fn set_on_cancel_handler(&self, handler: OnCancelHandler) {
        *self.on_cancel.lock().unwrap() = Some(handler);
    }
}
