//! Asynchronous networking toolkit: a per-thread event reactor with delayed
//! tasks, non-blocking sockets with batched write pipelines, multi-reactor
//! TCP/UDP servers and a KCP reliable transport over UDP.
//!
//! # Architecture
//!
//! Everything runs on [`EventPoller`] reactors, one per thread, pooled in
//! [`EventPollerPool`]. A [`net::Socket`] lives on exactly one poller and
//! fires all of its callbacks there; cross-thread work travels through the
//! poller's task queue. Servers clone themselves across the pool (one
//! accept/receive path per reactor) and hand each session to the
//! least-loaded poller. [`kcp::KcpTransport`] layers reliability on top of
//! a UDP socket.
//!
//! # Example
//!
//! ```no_run
//! use netkit::net::{Session, TcpServer};
//! use netkit::buffer::{Buffer, BufferRaw};
//! use netkit::SockError;
//!
//! struct Echo(netkit::net::Socket);
//!
//! impl Session for Echo {
//!     fn on_recv(&mut self, buf: &mut BufferRaw) {
//!         self.0.send(buf.data());
//!     }
//!     fn on_error(&mut self, _err: &SockError) {}
//! }
//!
//! let server = TcpServer::new(Box::new(|socket, _id| Box::new(Echo(socket))));
//! let port = server.start(0, "127.0.0.1").unwrap();
//! println!("echo on port {}", port);
//! ```

#[macro_use]
mod macros;

pub mod buffer;
mod error;
pub mod executor;
pub mod kcp;
pub mod net;
pub mod poller;
mod sys;
pub mod thread_pool;
pub mod util;

pub use crate::error::{ErrorKind, SockError};
pub use crate::executor::{Task, TaskExecutor};
pub use crate::poller::{DelayTask, EventPoller, EventPollerPool, PollEvent};
pub use crate::thread_pool::ThreadPool;
