use std::sync::Arc;

use tonic::Status;
use tracing::{debug, warn};

use crate::bridge::{
    ConsumerStreamObserver, ProducerConsumerStreamObserver, ProducerStreamObserver,
};
use crate::call_id::CallId;
use crate::config::BridgeConfig;
use crate::error::catch_setup;
use crate::reactive::{Flowable, Single};
use crate::transport::{
    CancellableStreamObserver, ClientResponseObserver, LambdaStreamObserver, StreamObserver,
};

/// Client-side call shapes. Each method takes the stub operation as `delegate` and returns the
/// response as a reactive type.
///
/// Calls start when the returned value is subscribed, and every subscription starts a new call.
#[derive(Debug, Clone, Default)]
pub struct ClientCalls {
    config: BridgeConfig,
}

impl ClientCalls {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Unary: `delegate` sends the request and reports the response to the observer it is given.
    pub fn one_to_one<Req, Resp, D>(&self, request: Single<Req>, delegate: D) -> Single<Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Req, Arc<dyn StreamObserver<Resp>>) -> Result<(), Status> + Send + Sync + 'static,
    {
        let delegate = Arc::new(delegate);
        Single::create(move |emitter| {
            let delegate = Arc::clone(&delegate);
            let failed = emitter.clone();
            request.subscribe_with(
                move |request| {
                    let call_id = CallId::generate();
                    debug!(call_id = %call_id, "Starting unary call");
                    let response: Arc<dyn StreamObserver<Resp>> =
                        Arc::new(LambdaStreamObserver::from_single_emitter(emitter.clone()));
                    if let Err(status) = catch_setup(|| (*delegate)(request, response)) {
                        warn!(call_id = %call_id, status = %status, "Unary call setup failed");
                        emitter.on_error(status);
                    }
                },
                move |status| failed.on_error(status),
            );
        })
    }

    /// Server streaming: responses are pulled from the call as the subscriber requests them.
    pub fn one_to_many<Req, Resp, D>(&self, request: Single<Req>, delegate: D) -> Flowable<Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Req, Arc<dyn ClientResponseObserver<Req, Resp>>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
    {
        let config = self.config.clone();
        let delegate = Arc::new(delegate);
        Flowable::defer(move || {
            let envelope = Arc::new(ConsumerStreamObserver::new(&config));
            let responses = envelope.flowable();
            let delegate = Arc::clone(&delegate);
            let started = Arc::clone(&envelope);
            request.subscribe_with(
                move |request| {
                    debug!(call_id = %started.call_id(), "Starting server streaming call");
                    let observer: Arc<dyn ClientResponseObserver<Req, Resp>> = started.clone();
                    if let Err(status) = catch_setup(|| (*delegate)(request, observer)) {
                        warn!(
                            call_id = %started.call_id(),
                            status = %status,
                            "Call setup failed"
                        );
                        started.fail(status);
                    }
                },
                move |status| envelope.fail(status),
            );
            Ok(responses)
        })
    }

    /// Client streaming: `requests` is pumped into the call at the pace the transport allows.
    pub fn many_to_one<Req, Resp, D>(&self, requests: Flowable<Req>, delegate: D) -> Single<Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Arc<dyn ClientResponseObserver<Req, Resp>>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
    {
        let config = self.config.clone();
        Single::create(move |emitter| {
            let envelope = Arc::new(ProducerStreamObserver::new(
                requests.clone(),
                LambdaStreamObserver::from_single_emitter(emitter),
                &config,
            ));
            debug!(call_id = %envelope.call_id(), "Starting client streaming call");

            // A cancelled call also stops the request producer.
            let producer = Arc::clone(&envelope);
            let observer: Arc<dyn ClientResponseObserver<Req, Resp>> = Arc::new(
                CancellableStreamObserver::new(Arc::clone(&envelope), move || {
                    producer.cancel_producer()
                }),
            );
            if let Err(status) = catch_setup(|| delegate(observer)) {
                warn!(call_id = %envelope.call_id(), status = %status, "Call setup failed");
                envelope.fail(status);
            }
        })
    }

    /// Bidirectional streaming: `requests` is pumped into the call and responses are pulled as
    /// the subscriber requests them.
    pub fn many_to_many<Req, Resp, D>(&self, requests: Flowable<Req>, delegate: D) -> Flowable<Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        D: Fn(Arc<dyn ClientResponseObserver<Req, Resp>>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
    {
        let config = self.config.clone();
        Flowable::defer(move || {
            let envelope =
                Arc::new(ProducerConsumerStreamObserver::new(requests.clone(), &config));
            debug!(call_id = %envelope.call_id(), "Starting bidirectional call");
            let responses = envelope.flowable();
            let observer: Arc<dyn ClientResponseObserver<Req, Resp>> = envelope.clone();
            if let Err(status) = catch_setup(|| delegate(observer)) {
                warn!(call_id = %envelope.call_id(), status = %status, "Call setup failed");
                envelope.fail(status);
            }
            Ok(responses)
        })
    }
}
