//! Client-side response observers that wire a call into the reactive adapters.
//!
//! The transport hands the request stream over in `before_start`, so each envelope creates its
//! adapters up front and binds them to the call there.

use std::sync::{Arc, OnceLock};

use tonic::Status;
use tracing::{debug, warn};

use crate::bridge::{BackpressurePump, StreamObserverPublisher};
use crate::call_id::CallId;
use crate::config::BridgeConfig;
use crate::error::cancelled_by_subscriber;
use crate::reactive::Flowable;
use crate::transport::{
    CallStreamObserver, ClientResponseObserver, LambdaStreamObserver, StreamObserver, control_of,
};

/// Consumes a streamed response: responses flow into a [`StreamObserverPublisher`] whose credit
/// goes to the call handed over in `before_start`.
pub struct ConsumerStreamObserver<Resp> {
    publisher: StreamObserverPublisher<Resp>,
}

impl<Resp: Send + 'static> ConsumerStreamObserver<Resp> {
    pub fn new(config: &BridgeConfig) -> Self {
        Self::with_call_id(config, CallId::generate())
    }

    fn with_call_id(config: &BridgeConfig, call_id: CallId) -> Self {
        Self {
            publisher: StreamObserverPublisher::detached(config, call_id),
        }
    }

    pub fn call_id(&self) -> &CallId {
        self.publisher.call_id()
    }

    /// The responses of the call.
    pub fn flowable(&self) -> Flowable<Resp> {
        self.publisher.flowable()
    }

    /// Fail the response consumer and cancel the call if it already started.
    pub fn fail(&self, status: Status) {
        self.publisher.fail(status);
    }

    fn attach<Req: 'static>(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        debug!(call_id = %self.call_id(), "Response stream starting");
        self.publisher.attach(control_of(request_stream));
    }
}

impl<Resp: Send + 'static> StreamObserver<Resp> for ConsumerStreamObserver<Resp> {
    fn on_next(&self, value: Resp) {
        self.publisher.on_next(value);
    }

    fn on_error(&self, status: Status) {
        self.publisher.on_error(status);
    }

    fn on_completed(&self) {
        self.publisher.on_completed();
    }
}

impl<Req, Resp> ClientResponseObserver<Req, Resp> for ConsumerStreamObserver<Resp>
where
    Req: 'static,
    Resp: Send + 'static,
{
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        self.attach(request_stream);
    }
}

/// Produces a streamed request: once the call starts, the producer is pumped into the request
/// stream. The unary response goes to a [`LambdaStreamObserver`].
pub struct ProducerStreamObserver<Req, Resp> {
    call_id: CallId,
    config: BridgeConfig,
    producer: Flowable<Req>,
    response: LambdaStreamObserver<Resp>,
    request_stream: OnceLock<Arc<dyn CallStreamObserver<Req>>>,
    pump: OnceLock<Arc<BackpressurePump<Req>>>,
}

impl<Req, Resp> ProducerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        producer: Flowable<Req>,
        response: LambdaStreamObserver<Resp>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            call_id: CallId::generate(),
            config: config.clone(),
            producer,
            response,
            request_stream: OnceLock::new(),
            pump: OnceLock::new(),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Stop pumping the producer into the request stream.
    pub fn cancel_producer(&self) {
        if let Some(pump) = self.pump.get() {
            pump.cancel();
        }
    }

    /// Cancel the call if it already started and fail the response.
    pub fn fail(&self, status: Status) {
        if let Some(request_stream) = self.request_stream.get() {
            request_stream.cancel(cancelled_by_subscriber());
        }
        self.cancel_producer();
        self.response.on_error(status);
    }
}

impl<Req, Resp> StreamObserver<Resp> for ProducerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_next(&self, value: Resp) {
        self.response.on_next(value);
    }

    fn on_error(&self, status: Status) {
        self.response.on_error(status);
    }

    fn on_completed(&self) {
        self.response.on_completed();
    }
}

impl<Req, Resp> ClientResponseObserver<Req, Resp> for ProducerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        if self.request_stream.set(Arc::clone(&request_stream)).is_err() {
            warn!(call_id = %self.call_id, "Call already started");
            return;
        }
        debug!(call_id = %self.call_id, "Request stream starting");
        let pump = BackpressurePump::new(request_stream, &self.config, self.call_id.clone());
        let _ = self.pump.set(Arc::clone(&pump));
        self.producer.subscribe(pump);
    }
}

/// Both directions streamed: the consumer half handles responses and the producer is pumped into
/// the request stream of the same call.
pub struct ProducerConsumerStreamObserver<Req, Resp> {
    consumer: ConsumerStreamObserver<Resp>,
    config: BridgeConfig,
    producer: Flowable<Req>,
    request_stream: OnceLock<Arc<dyn CallStreamObserver<Req>>>,
}

impl<Req, Resp> ProducerConsumerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(producer: Flowable<Req>, config: &BridgeConfig) -> Self {
        Self {
            consumer: ConsumerStreamObserver::new(config),
            config: config.clone(),
            producer,
            request_stream: OnceLock::new(),
        }
    }

    pub fn call_id(&self) -> &CallId {
        self.consumer.call_id()
    }

    pub fn flowable(&self) -> Flowable<Resp> {
        self.consumer.flowable()
    }

    /// Fail the response consumer and cancel the call, which also stops the producer.
    pub fn fail(&self, status: Status) {
        self.consumer.fail(status);
    }
}

impl<Req, Resp> StreamObserver<Resp> for ProducerConsumerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_next(&self, value: Resp) {
        self.consumer.on_next(value);
    }

    fn on_error(&self, status: Status) {
        self.consumer.on_error(status);
    }

    fn on_completed(&self) {
        self.consumer.on_completed();
    }
}

impl<Req, Resp> ClientResponseObserver<Req, Resp> for ProducerConsumerStreamObserver<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn before_start(&self, request_stream: Arc<dyn CallStreamObserver<Req>>) {
        if self.request_stream.set(Arc::clone(&request_stream)).is_err() {
            warn!(call_id = %self.call_id(), "Call already started");
            return;
        }
        let pump =
            BackpressurePump::new(Arc::clone(&request_stream), &self.config, self.call_id().clone());
        self.consumer.attach(request_stream);
        self.producer.subscribe(pump);
    }
}
