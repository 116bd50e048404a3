//! # Remoting
//!
//! Transparent remote object references over a single call/reply channel.
//!
//! ## Architecture
//!
//! A `Connection` owns one `Transport`. Calls are framed with `wirepack`,
//! tagged with a sequence number and demultiplexed by a single pump task, so
//! any number of calls may be in flight and complete out of order.
//!
//! Every value that crosses the channel is classified once by the
//! `SurrogateRegistry`: copied, sent as a reference the peer proxies, wrapped
//! with its concrete type, or streamed as raw bytes after the frame. Objects
//! sent by reference stay in the owner's `InstanceRegistry` until the peer
//! releases every descriptor it received.
//!
//! On top of the channel sit weak events with ordered asynchronous firing, a
//! sequential task queue and a cancellation token observable from the far
//! side.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod frame;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod skeleton;
pub mod surrogate;
pub mod task_queue;
pub mod transport;
pub mod value;

mod marshal;

pub use crate::cancel::CancellationSource;
pub use crate::cancel::CancellationToken;
pub use crate::cancel::RemoteCancellationToken;
pub use crate::config::Config;
pub use crate::connection::Connection;
pub use crate::error::Error;
pub use crate::error::Fault;
pub use crate::error::FaultKind;
pub use crate::error::Result;
pub use crate::events::Validity;
pub use crate::events::WeakEvent;
pub use crate::events::WeakEventEntry;
pub use crate::proxy::Proxy;
pub use crate::registry::InstanceRegistry;
pub use crate::registry::ObjectId;
pub use crate::skeleton::Args;
pub use crate::skeleton::RemoteType;
pub use crate::surrogate::ManualBinary;
pub use crate::surrogate::SurrogateRegistry;
pub use crate::task_queue::TaskQueue;
pub use crate::transport::Transport;
pub use crate::value::Declared;
pub use crate::value::IntoArgs;
pub use crate::value::Value;
