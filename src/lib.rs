//! # grpc-flow-bridge
//!
//! Connects the credit-based flow control of a streaming RPC transport with demand-based
//! reactive streams, so that a slow consumer on either side of a call throttles the producer on
//! the other side.
//!
//! ## Server Side
//!
//! [`ServerCalls`] binds an incoming call to a transform over [`Single`] and [`Flowable`]. Inbound
//! messages are only pulled from the transport as the transform's pipeline requests them, and
//! the transform's output is written only while the transport reports it is ready.
//!
//! ```ignore
//! use grpc_flow_bridge::{Flowable, ServerCalls};
//!
//! let calls = ServerCalls::default();
//!
//! // The transport feeds requests into the returned observer.
//! let requests = calls.many_to_many(response_call, |requests: Flowable<Chat>| {
//!     Ok(requests.map(|chat| chat.reply()))
//! });
//! ```
//!
//! ## Client Side
//!
//! [`ClientCalls`] wraps a stub operation and returns the response as a reactive type. The call
//! starts when the result is subscribed.
//!
//! ```ignore
//! use grpc_flow_bridge::{ClientCalls, Flowable};
//! use futures::StreamExt;
//!
//! let calls = ClientCalls::default();
//! let replies = calls.many_to_many(Flowable::from_iter(chats), |observer| {
//!     stub.chat(observer)
//! });
//!
//! let mut replies = replies.into_stream(16);
//! while let Some(reply) = replies.next().await {
//!     println!("{:?}", reply?);
//! }
//! ```

pub mod bridge;
mod call_id;
pub mod calls;
pub mod config;
pub mod error;
pub mod reactive;
pub mod transport;

#[cfg(test)]
mod testkit;

pub use call_id::CallId;
pub use calls::{ClientCalls, ServerCalls};
pub use config::BridgeConfig;
pub use error::{BridgeError, is_cancelled};
pub use reactive::{Flowable, Publisher, Single, Subscriber, Subscription};
pub use transport::{CallStreamObserver, ClientResponseObserver, StreamObserver};
