use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tonic::{Code, Status};

/// Errors raised by the bridge itself, as opposed to failures reported by the transport or by
/// the application's reactive pipeline.
///
/// Every variant converts into a [`Status`] so it can travel through the same `on_error` path as
/// transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// A user transform panicked while the call shape was being assembled.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// A subscriber requested zero elements.
    #[error("demand must be positive, got request({0})")]
    InvalidDemand(u64),

    /// A message arrived from the transport or a producer without outstanding demand.
    #[error("message delivered without outstanding demand")]
    DemandExceeded,

    /// A single-use publisher was subscribed more than once.
    #[error("publisher only allows a single subscriber")]
    AlreadySubscribed,

    /// A unary response stream completed without carrying a value.
    #[error("call completed without a response message")]
    NoResponse,

    /// An async source was subscribed outside of a tokio runtime.
    #[error("no tokio runtime available to drive the source")]
    NoRuntime,
}

impl BridgeError {
    /// The gRPC code used when this error is surfaced as a [`Status`].
    pub fn code(&self) -> Code {
        match self {
            BridgeError::HandlerPanic(_) | BridgeError::NoResponse => Code::Internal,
            BridgeError::InvalidDemand(_) => Code::InvalidArgument,
            BridgeError::DemandExceeded => Code::ResourceExhausted,
            BridgeError::AlreadySubscribed | BridgeError::NoRuntime => Code::FailedPrecondition,
        }
    }
}

impl From<BridgeError> for Status {
    fn from(err: BridgeError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

/// Returns `true` when the status reports a cancelled call rather than a failure.
pub fn is_cancelled(status: &Status) -> bool {
    status.code() == Code::Cancelled
}

/// The status handed to the transport when the consumer cancels a call.
pub(crate) fn cancelled_by_subscriber() -> Status {
    Status::cancelled("subscription cancelled by consumer")
}

/// Run user setup code, turning both an `Err` and a panic into a [`Status`].
pub(crate) fn catch_setup<R>(setup: impl FnOnce() -> Result<R, Status>) -> Result<R, Status> {
    match panic::catch_unwind(AssertUnwindSafe(setup)) {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::HandlerPanic(panic_message(payload.as_ref())).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
