//! Framed, multiplexed session layer over TCP, TLS-over-TCP, or UNIX
//! domain sockets.
//!
//! A [`SessionRegistry`] owns every active [`Session`] and listener, runs
//! the shared timer service, and hands out sessions on connect or accept.
//! Each session exchanges discrete messages over one transport: small
//! single-block frames via [`Session::send_stream_data`] and arbitrarily
//! large payloads via [`Session::send_multiblock_data`], which the
//! multiblock engine fragments, serializes through a per-session backlog,
//! and reassembles on the far side.
//!
//! ## Features
//!
//! - **Handshake**: id negotiation with server-authoritative collision
//!   handling, surfacing the initiator's opaque session identifier
//! - **Multiblock transfers**: chunked out-of-band payloads with abort
//!   support and per-transfer failure isolation
//! - **Reply tracking**: reply-expected messages time out through a
//!   process-wide timer sweep
//! - **Heartbeats**: idle ready sessions are probed automatically
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lattice_session::{
//!     ErrorCode, RegistryConfig, Session, SessionEvents, SessionRegistry,
//! };
//!
//! struct Printer;
//!
//! impl SessionEvents for Printer {
//!     fn session_changed(&self, session: &Session, established: bool, identifier: u64) {
//!         println!("session {} established={established} id={identifier:#x}",
//!                  session.session_id());
//!     }
//!     fn data_received(&self, _session: &Session, is_stream: bool, payload: &[u8]) {
//!         println!("got {} bytes (stream: {is_stream})", payload.len());
//!     }
//!     fn error_occurred(&self, _session: Option<&Session>, code: ErrorCode, message: &str) {
//!         eprintln!("error {code:?}: {message}");
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(Printer));
//! let session = registry
//!     .connect_tcp("127.0.0.1:4321".parse()?, 0x11)
//!     .await?;
//!
//! session.send_stream_data(b"hello", true, true);
//! let transfer = session.send_multiblock_data(&vec![0u8; 1 << 20]);
//! assert_ne!(transfer, 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod dispatch;
pub mod multiblock;
pub mod registry;
pub mod session;
pub mod state;
mod timer;
pub mod transport;

pub use lattice_wire::ErrorCode;
pub use multiblock::{part_count, MAX_TRANSFER_SIZE, PART_SIZE};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{Session, SessionEvents, SessionStats};
pub use state::{ConnectedState, SessionState};
pub use transport::{connect_tcp, listen_tcp, IoStream};

#[cfg(unix)]
pub use transport::{connect_uds, listen_uds};

#[cfg(feature = "tls")]
pub use transport::tls::{accept_tls, connect_tls, make_client_config, make_server_config};
