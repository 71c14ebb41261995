//! Client-facing side of the gateway: the line protocol, the per-client
//! session and the loop driving it.

pub mod command;
pub mod connection;
pub mod error;
pub mod reply;
pub mod session;
pub mod text;

pub use command::{Command, ParseError};
pub use connection::{Disconnect, serve};
pub use error::SessionError;
pub use reply::{Reply, format_reply};
pub use session::{Flow, Session, SessionConfig};
