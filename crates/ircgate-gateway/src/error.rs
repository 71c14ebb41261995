use thiserror::Error;

use ircgate_remote::RemoteError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Writing to the client failed; the session cannot continue.
    #[error("client connection: {0}")]
    Io(#[from] std::io::Error),

    /// A remote call behind a command or an event failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
