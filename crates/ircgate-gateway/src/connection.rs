use std::future::Future;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use ircgate_remote::ReconnectLoop;

use crate::session::{Flow, Session};

/// Longest client line accepted. Longer lines are discarded.
const MAX_LINE: usize = 16 * 1024;

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Quit,
    Eof,
    Shutdown,
}

/// Runs one client to completion.
///
/// Client lines and remote events are handled strictly one at a time, so a
/// command never sees the session half way through an event and vice versa.
/// The remote link is (re)connected as needed and keeps retrying with backoff
/// while the client stays connected.
pub async fn serve<R, W>(
    reader: R,
    session: &mut Session<W>,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<Disconnect>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE));
    let mut link = ReconnectLoop::new();
    tokio::pin!(shutdown);

    loop {
        // Every branch future is dropped before its handler runs.
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down client session");
                return Ok(Disconnect::Shutdown);
            }
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    debug!("<< {}", line);
                    if session.command(&line).await? == Flow::Quit {
                        return Ok(Disconnect::Quit);
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!("Discarding client line longer than {} bytes", MAX_LINE);
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
                None => {
                    info!("Client closed the connection");
                    return Ok(Disconnect::Eof);
                }
            },
            wake = link.wait(session.remote()) => {
                for event in link.handle(wake, session.remote_mut()).await {
                    session.deliver(event).await?;
                }
            }
        }
    }
}
