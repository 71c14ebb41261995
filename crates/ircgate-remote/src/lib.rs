//! Client side of the remote chat service: transport, caches, event
//! normalization, history replay, and the reconnecting event stream.

pub mod echo;
pub mod error;
pub mod history;
pub mod members;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod normalize;
pub mod reconnect;
pub mod state;
pub mod transport;
pub mod web;

pub use echo::EchoFilter;
pub use error::{RemoteError, TransportError};
pub use members::{Cursor, MemberCache};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockTransport;
pub use reconnect::{LinkState, ReconnectLoop, Wake};
pub use state::{MAX_INVITE, RemoteState};
pub use transport::RemoteTransport;
pub use web::{Credentials, WebTransport};
