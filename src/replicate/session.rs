//! One replication session between the local store and a peer

use super::protocol::{FrameCodec, Message};
use super::{Mode, ReplicationOutcome};
use crate::model::{Hash, Revision};
use crate::revision::Applied;
use crate::store::Blob;
use crate::{Error, Result, Store, PROTOCOL_VERSION};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn, Instrument};

/// Objects buffered between the producer and the socket writer
const OBJECT_QUEUE: usize = 16;

/// Drives the protocol for one side of a session
///
/// Reading, object production and writing run as three futures joined on
/// the calling task. The reader only ever pushes small control messages into
/// an unbounded queue, so it keeps draining the peer's stream while our own
/// object stream is blocked on a slow peer. Blob and index I/O runs on the
/// blocking thread pool, off the runtime's workers.
pub struct Replicator {
    store: Store,
    mode: Mode,
    manifest_recent: usize,
}

/// Receive-side bookkeeping
#[derive(Default)]
struct Inbound {
    /// Hashes we asked for and have not yet received
    expected: HashSet<Hash>,
    /// Revisions waiting for their parent, keyed by that parent
    parked: HashMap<Hash, Vec<Revision>>,
    parked_hashes: HashSet<Hash>,
    touched: BTreeSet<String>,
    received: usize,
    skipped: usize,
}

impl Replicator {
    pub fn new(store: Store, mode: Mode) -> Self {
        let manifest_recent = store.options().manifest_recent;
        Replicator {
            store,
            mode,
            manifest_recent,
        }
    }

    /// Run the session to completion over `reader`/`writer`
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<ReplicationOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let span = tracing::info_span!("replicate", mode = %self.mode);
        async move {
            let mut frames_in = FramedRead::new(reader, FrameCodec);
            let mut frames_out = FramedWrite::new(writer, FrameCodec);

            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let (object_tx, object_rx) = mpsc::channel(OBJECT_QUEUE);
            let (queue_tx, queue_rx) = oneshot::channel();

            let hello = Message::Hello {
                version: PROTOCOL_VERSION,
                mode: self.mode,
            };
            // The receiver is alive until write_frames runs below
            let _ = control_tx.send(hello);
            let _ = control_tx.send(self.manifest()?);

            let (inbound, sent, ()) = tokio::try_join!(
                self.read_frames(&mut frames_in, control_tx, queue_tx),
                self.send_objects(queue_rx, object_tx),
                write_frames(&mut frames_out, control_rx, object_rx),
            )?;

            let mut diverged = Vec::new();
            for key in &inbound.touched {
                if self.store.revisions().head_hashes(key).len() > 1 {
                    diverged.push(key.clone());
                }
            }

            let outcome = ReplicationOutcome {
                sent,
                received: inbound.received,
                skipped: inbound.skipped,
                diverged,
            };
            info!(
                sent = outcome.sent,
                received = outcome.received,
                skipped = outcome.skipped,
                diverged = outcome.diverged.len(),
                "replication complete"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    fn manifest(&self) -> Result<Message> {
        let revisions = self.store.revisions();
        let recent = revisions
            .recent(Some(self.manifest_recent))
            .map(|r| r.map(|r| (r.key, r.hash)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Message::Manifest {
            heads: revisions.all_heads(),
            recent,
        })
    }

    /// Local revisions the peer is missing, parents before children
    ///
    /// Walks back from every local head until reaching a revision the peer
    /// reported under the same key (which implies the peer has its whole
    /// ancestry) or one already queued by an earlier walk. A hash the peer
    /// holds under a different key says nothing about this chain.
    fn frontier(
        &self,
        peer_heads: &[(String, Hash)],
        peer_recent: &[(String, Hash)],
    ) -> Result<Vec<Hash>> {
        let known: HashSet<(&str, Hash)> = peer_heads
            .iter()
            .chain(peer_recent)
            .map(|(key, hash)| (key.as_str(), *hash))
            .collect();

        let revisions = self.store.revisions();
        let mut queued = HashSet::new();
        let mut order = Vec::new();

        for (key, head) in revisions.all_heads() {
            let mut segment = Vec::new();
            for revision in revisions.history(head) {
                match revision {
                    Ok(revision) => {
                        if known.contains(&(revision.key.as_str(), revision.hash))
                            || queued.contains(&revision.hash)
                        {
                            break;
                        }
                        segment.push(revision.hash);
                    }
                    Err(Error::BrokenChain { missing }) => {
                        warn!(%key, %missing, "local history is incomplete; offering what is present");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            queued.extend(segment.iter().copied());
            order.extend(segment.into_iter().rev());
        }

        Ok(order)
    }

    async fn read_frames<R>(
        &self,
        frames: &mut FramedRead<R, FrameCodec>,
        control: mpsc::UnboundedSender<Message>,
        queue_tx: oneshot::Sender<Vec<Hash>>,
    ) -> Result<Inbound>
    where
        R: AsyncRead + Unpin,
    {
        let mut peer_mode: Option<Mode> = None;
        let mut offered: Option<Vec<Hash>> = None;
        let mut queue_tx = Some(queue_tx);
        let mut inbound = Inbound::default();

        let send = |message: Message| {
            control
                .send(message)
                .map_err(|_| Error::ChannelClosed)
        };

        while let Some(frame) = frames.next().await {
            let message = frame?;
            trace!(kind = message.kind(), "received frame");

            match message {
                Message::Hello { version, mode } => {
                    if version != PROTOCOL_VERSION {
                        return Err(Error::Protocol(format!(
                            "peer speaks protocol version {}, expected {}",
                            version, PROTOCOL_VERSION
                        )));
                    }
                    if peer_mode.replace(mode).is_some() {
                        return Err(Error::Protocol("duplicate hello".into()));
                    }
                    if !(self.mode.sends() && mode.receives()) && !(self.mode.receives() && mode.sends()) {
                        warn!(local = %self.mode, peer = %mode, "modes allow no transfer in either direction");
                    }
                }
                Message::Manifest { heads, recent } => {
                    let peer = require_hello(peer_mode)?;
                    if offered.is_some() {
                        return Err(Error::Protocol("duplicate manifest".into()));
                    }
                    let offer = if self.mode.sends() && peer.receives() {
                        self.frontier(&heads, &recent)?
                    } else {
                        Vec::new()
                    };
                    debug!(peer_heads = heads.len(), offer = offer.len(), "computed frontier");
                    send(Message::Offer {
                        hashes: offer.clone(),
                    })?;
                    offered = Some(offer);
                }
                Message::Offer { hashes } => {
                    let peer = require_hello(peer_mode)?;
                    let want: Vec<Hash> = if self.mode.receives() && peer.sends() {
                        let revisions = self.store.revisions();
                        hashes
                            .into_iter()
                            .filter(|h| !revisions.contains(h))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    debug!(want = want.len(), "requesting revisions");
                    inbound.expected = want.iter().copied().collect();
                    send(Message::Want { hashes: want })?;
                }
                Message::Want { hashes } => {
                    let offer = offered
                        .take()
                        .ok_or_else(|| Error::Protocol("want before our offer".into()))?;
                    let wanted: HashSet<Hash> = hashes.into_iter().collect();
                    let queue: Vec<Hash> = offer.into_iter().filter(|h| wanted.contains(h)).collect();
                    let tx = queue_tx
                        .take()
                        .ok_or_else(|| Error::Protocol("duplicate want".into()))?;
                    let _ = tx.send(queue);
                }
                Message::Object { revision, data } => {
                    if !inbound.expected.remove(&revision.hash) {
                        return Err(Error::Protocol(format!(
                            "unrequested object {}",
                            revision.hash
                        )));
                    }
                    self.receive_object(revision, data, &mut inbound).await?;
                }
                Message::Done => {
                    if queue_tx.is_some() {
                        return Err(Error::Protocol("done before want".into()));
                    }
                    self.finish_inbound(&mut inbound);
                    return Ok(inbound);
                }
            }
        }

        Err(Error::ChannelClosed)
    }

    async fn receive_object(
        &self,
        revision: Revision,
        data: Vec<u8>,
        inbound: &mut Inbound,
    ) -> Result<()> {
        // The blob is durable before anything references it
        let expected = revision.hash;
        self.blocking(move |store| {
            let blob = Blob::new(data);
            if blob.hash != expected {
                return Err(Error::Corrupt(format!(
                    "peer sent {} for revision {}",
                    blob.hash, expected
                )));
            }
            store.blobs().put_blob(&blob)
        })
        .await?;

        if let Some(prev) = revision.prev {
            if !self.store.revisions().contains(&prev) {
                if inbound.expected.contains(&prev) || inbound.parked_hashes.contains(&prev) {
                    trace!(hash = %revision.hash.short(), prev = %prev.short(), "parking until parent arrives");
                    inbound.parked_hashes.insert(revision.hash);
                    inbound.parked.entry(prev).or_default().push(revision);
                } else {
                    warn!(
                        key = %revision.key,
                        hash = %revision.hash.short(),
                        missing = %prev.short(),
                        "dropping revision whose ancestry the peer did not send"
                    );
                    inbound.skipped += 1;
                }
                return Ok(());
            }
        }

        let mut ready = vec![revision];
        while let Some(revision) = ready.pop() {
            inbound.parked_hashes.remove(&revision.hash);
            let applied = {
                let revision = revision.clone();
                self.blocking(move |store| store.apply_replicated(&revision))
                    .await?
            };
            match applied {
                Applied::Inserted => {
                    debug!(key = %revision.key, hash = %revision.hash.short(), "applied revision");
                    inbound.received += 1;
                    inbound.touched.insert(revision.key.clone());
                }
                Applied::Present => {}
                // Its parked children stay parked and are dropped at `Done`
                Applied::Conflict => {
                    inbound.skipped += 1;
                    continue;
                }
            }
            if let Some(children) = inbound.parked.remove(&revision.hash) {
                ready.extend(children);
            }
        }
        Ok(())
    }

    /// Run store work that touches the disk on the blocking thread pool
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    /// Anything still parked at end of stream has an ancestor that never came
    fn finish_inbound(&self, inbound: &mut Inbound) {
        let orphans: usize = inbound.parked.values().map(Vec::len).sum();
        if orphans > 0 {
            warn!(orphans, "peer finished without sending some ancestors; dropping dependents");
            inbound.skipped += orphans;
        }
        if !inbound.expected.is_empty() {
            warn!(missing = inbound.expected.len(), "peer did not send every requested revision");
        }
        inbound.parked.clear();
        inbound.parked_hashes.clear();
    }

    async fn send_objects(
        &self,
        queue_rx: oneshot::Receiver<Vec<Hash>>,
        objects: mpsc::Sender<Message>,
    ) -> Result<usize> {
        let queue = queue_rx.await.map_err(|_| Error::ChannelClosed)?;

        for hash in queue.iter().copied() {
            let (revision, data) = self
                .blocking(move |store| Ok((store.revision(&hash)?, store.get(&hash)?)))
                .await?;
            trace!(hash = %hash.short(), size = data.len(), "sending revision");
            objects
                .send(Message::Object { revision, data })
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }

        objects
            .send(Message::Done)
            .await
            .map_err(|_| Error::ChannelClosed)?;
        Ok(queue.len())
    }
}

fn require_hello(mode: Option<Mode>) -> Result<Mode> {
    mode.ok_or_else(|| Error::Protocol("message before hello".into()))
}

/// Write control messages ahead of objects until both queues are closed
async fn write_frames<W>(
    frames: &mut FramedWrite<W, FrameCodec>,
    mut control: mpsc::UnboundedReceiver<Message>,
    mut objects: mpsc::Receiver<Message>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            Some(message) = control.recv() => message,
            Some(message) = objects.recv() => message,
            else => break,
        };
        trace!(kind = message.kind(), "sending frame");
        frames.send(message).await?;
    }
    frames.close().await?;
    Ok(())
}
