//! Adapters between the transport's credit-based flow control and reactive demand.
//!
//! - [`StreamObserverPublisher`] turns the inbound messages of a call into a [`Publisher`]
//!   whose demand becomes transport credit.
//! - [`BackpressurePump`] drains a producer into the outbound half of a call at the pace the
//!   transport's readiness allows.
//! - [`CancellationBridge`] guarantees a terminal signal to subscribers that cancel.
//! - The envelopes in [`envelope`] wire the above into a client call once the transport hands
//!   over the request stream.
//!
//! [`Publisher`]: crate::reactive::Publisher

mod cancellation;
pub mod envelope;
mod publisher;
mod pump;

pub use cancellation::CancellationBridge;
pub use envelope::{ConsumerStreamObserver, ProducerConsumerStreamObserver, ProducerStreamObserver};
pub use publisher::StreamObserverPublisher;
pub use pump::BackpressurePump;
