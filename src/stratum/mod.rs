//! Stratum v1 server side.
//!
//! The pool speaks the classic JSON-over-TCP mining protocol:
//!
//! - **Client requests**: subscribe, configure, authorize,
//!   suggest_difficulty, submit
//! - **Server notifications**: mining.notify (new work),
//!   mining.set_difficulty, mining.set_version_mask, client.reconnect
//!
//! [`server`] owns the accept loop, [`session`] the per-connection state
//! machine, [`registry`] the cross-session fan-out, [`connection`] the
//! line framing, and [`messages`] the JSON-RPC envelope.

pub mod connection;
pub mod messages;
pub mod registry;
pub mod server;
pub mod session;

pub use messages::JsonRpcMessage;
pub use registry::{SessionId, SessionRegistry};
pub use server::StratumServer;
pub use session::{SessionSettings, USER_AGENT};
