use std::sync::Arc;

use tonic::Status;
use tracing::{debug, warn};

use crate::bridge::{BackpressurePump, StreamObserverPublisher};
use crate::call_id::CallId;
use crate::config::BridgeConfig;
use crate::error::catch_setup;
use crate::reactive::{Flowable, Single};
use crate::transport::{CallStreamObserver, StreamObserver, control_of};

/// Server-side call shapes. Each method binds one incoming call to a user transform.
#[derive(Debug, Clone, Default)]
pub struct ServerCalls {
    config: BridgeConfig,
}

impl ServerCalls {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Unary: the response is written, then the call completes.
    pub fn one_to_one<Req, Resp, F>(
        &self,
        request: Req,
        response: Arc<dyn StreamObserver<Resp>>,
        transform: F,
    ) where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: FnOnce(Single<Req>) -> Result<Single<Resp>, Status>,
    {
        let call_id = CallId::generate();
        debug!(call_id = %call_id, "Unary call");
        match catch_setup(|| transform(Single::just(request))) {
            Ok(single) => respond_once(single, response),
            Err(status) => {
                warn!(call_id = %call_id, status = %status, "Unary handler failed");
                response.on_error(status);
            }
        }
    }

    /// Server streaming: the response flowable is pumped into the call as fast as the transport
    /// can take it.
    pub fn one_to_many<Req, Resp, F>(
        &self,
        request: Req,
        response: Arc<dyn CallStreamObserver<Resp>>,
        transform: F,
    ) where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
        F: FnOnce(Single<Req>) -> Result<Flowable<Resp>, Status>,
    {
        let call_id = CallId::generate();
        debug!(call_id = %call_id, "Server streaming call");
        match catch_setup(|| transform(Single::just(request))) {
            Ok(flowable) => {
                flowable.subscribe(BackpressurePump::new(response, &self.config, call_id));
            }
            Err(status) => {
                warn!(call_id = %call_id, status = %status, "Server streaming handler failed");
                response.on_error(status);
            }
        }
    }

    /// Client streaming: returns the observer the transport feeds requests into. The requests
    /// reach the transform as a flowable whose demand becomes inbound credit.
    pub fn many_to_one<Req, Resp, F>(
        &self,
        response: Arc<dyn CallStreamObserver<Resp>>,
        transform: F,
    ) -> Arc<dyn StreamObserver<Req>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: FnOnce(Flowable<Req>) -> Result<Single<Resp>, Status>,
    {
        let call_id = CallId::generate();
        debug!(call_id = %call_id, "Client streaming call");
        let requests = StreamObserverPublisher::new(
            control_of(Arc::clone(&response)),
            &self.config,
            call_id.clone(),
        );

        match catch_setup(|| transform(requests.flowable())) {
            Ok(single) => respond_once(single, response),
            Err(status) => {
                warn!(call_id = %call_id, status = %status, "Client streaming handler failed");
                requests.close(status.clone());
                response.on_error(status);
            }
        }
        Arc::new(requests)
    }

    /// Bidirectional streaming: inbound requests arrive as a flowable, and the returned flowable
    /// is pumped into the call.
    pub fn many_to_many<Req, Resp, F>(
        &self,
        response: Arc<dyn CallStreamObserver<Resp>>,
        transform: F,
    ) -> Arc<dyn StreamObserver<Req>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: FnOnce(Flowable<Req>) -> Result<Flowable<Resp>, Status>,
    {
        let call_id = CallId::generate();
        debug!(call_id = %call_id, "Bidirectional streaming call");
        let requests = StreamObserverPublisher::new(
            control_of(Arc::clone(&response)),
            &self.config,
            call_id.clone(),
        );

        match catch_setup(|| transform(requests.flowable())) {
            Ok(flowable) => {
                flowable.subscribe(BackpressurePump::new(response, &self.config, call_id));
            }
            Err(status) => {
                warn!(call_id = %call_id, status = %status, "Bidirectional handler failed");
                requests.close(status.clone());
                response.on_error(status);
            }
        }
        Arc::new(requests)
    }
}

/// Write the single's value and complete, or fail the call.
fn respond_once<Resp, O>(single: Single<Resp>, response: Arc<O>)
where
    Resp: Send + 'static,
    O: StreamObserver<Resp> + ?Sized + 'static,
{
    let writer = Arc::clone(&response);
    single.subscribe_with(
        move |value| {
            writer.on_next(value);
            writer.on_completed();
        },
        move |status| response.on_error(status),
    );
}
