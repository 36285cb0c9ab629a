//! Bidirectional MessagePack-RPC over stream transports.
//!
//! Symmetric client and server endpoints speaking [MessagePack-RPC] over
//! TCP or unix domain sockets. Clients keep one logical connection alive
//! with jittered exponential backoff; servers dispatch registered methods on
//! a dedicated callback pool.
//!
//! ```no_run
//! use mrpc::{ClientBuilder, ServerBuilder};
//!
//! let server = ServerBuilder::new()
//!     .method("add", |(x, y): (i32, i32)| Ok(x + y))
//!     .listen_to("tcp://localhost:0")
//!     .build()?;
//!
//! let client = ClientBuilder::new()
//!     .connect_to(server.local_uris()[0].to_string())
//!     .build()?;
//!
//! let sum: i32 = client.call("add", (2, 3))?;
//! assert_eq!(sum, 5);
//! # mrpc::Result::Ok(())
//! ```
//!
//! [MessagePack-RPC]: https://github.com/msgpack-rpc/msgpack-rpc/blob/master/spec.md

#[macro_use]
extern crate tracing;

mod acceptor;
mod client;
mod codec;
mod connect;
mod connection;
mod error;
mod executor;
mod server;
mod transport;
mod uri;

pub mod config;

pub use self::acceptor::Acceptor;
pub use self::client::{CallFuture, Client, ClientBuilder};
pub use self::connection::{Connection, ConnectionHandler};
pub use self::error::{Error, ErrorKind, Result};
pub use self::executor::{ChildTask, Executor, OperationType, ShutdownHandle, ShutdownSignal};
pub use self::server::{MethodError, Server, ServerBuilder};
pub use self::transport::Backend;
pub use self::uri::{Scheme, Uri};

// Re-exported because they appear in the public API.
#[rustfmt::skip]
pub use mrpc_proto::{
    DecodeError, EncodeError, FromParams, IntoParams, Message, MessageId, MessageParser,
    MethodName, Params, ParamsError, SerializedMessage,
};
#[rustfmt::skip]
pub use rmpv::Value;
