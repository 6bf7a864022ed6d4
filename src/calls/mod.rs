//! Call-shape combinators: the four RPC shapes (unary, server streaming, client streaming,
//! bidirectional) expressed with [`Single`](crate::reactive::Single) and
//! [`Flowable`](crate::reactive::Flowable).
//!
//! A failure while assembling a call, whether an `Err` or a panic from user code, never escapes
//! to the caller. It is delivered to the call's response channel instead.

mod client;
mod server;

pub use client::ClientCalls;
pub use server::ServerCalls;
