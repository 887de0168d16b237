//! Byte-stream transports for replication sessions
//!
//! The session itself only needs a reader and a writer; these helpers
//! supply them from a TCP connection or from the process's stdio.

use crate::replicate::{Mode, ReplicationOutcome};
use crate::{Result, Store};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{error, info, info_span, Instrument};

/// Port used when a peer address does not name one
pub const DEFAULT_PORT: u16 = 7787;

/// Connect to a serving peer and run one session in `mode`
pub async fn connect(
    store: &Store,
    addr: impl ToSocketAddrs,
    mode: Mode,
) -> Result<ReplicationOutcome> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    info!(%peer, %mode, "connected");

    let (reader, writer) = stream.into_split();
    store.replicate(mode, reader, writer).await
}

/// Accept peers forever, running one session in `mode` per connection
///
/// A failed session is logged and does not stop the listener.
pub async fn serve(store: Store, listener: TcpListener, mode: Mode) -> Result<()> {
    info!(addr = %listener.local_addr()?, %mode, "serving");
    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(
            async move {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                match store.replicate(mode, reader, writer).await {
                    Ok(outcome) => info!(
                        sent = outcome.sent,
                        received = outcome.received,
                        "session finished"
                    ),
                    Err(err) => error!(%err, "session failed"),
                }
            }
            .instrument(info_span!("peer", %peer)),
        );
    }
}

/// Run one session over stdin/stdout, for use behind a pipe or ssh
pub async fn replicate_stdio(store: &Store, mode: Mode) -> Result<ReplicationOutcome> {
    store
        .replicate(mode, tokio::io::stdin(), tokio::io::stdout())
        .await
}
