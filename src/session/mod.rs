//! Streaming sessions: one [`Session`] per WebSocket connection.
//!
//! A session starts `Connected`, becomes `Active` after `session.authenticate`
//! or `session.demo` binds it to its document, and ends `Closed`. Closing
//! cancels every chat turn the connection started.
pub mod busy;
pub mod protocol;
pub mod router;
pub mod turn;

pub use protocol::Envelope;
pub use router::{Flow, Session, SessionState};
