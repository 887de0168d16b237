//! Replication Integration Tests
//!
//! Two stores talk over an in-memory duplex pipe, exactly as they would over
//! TCP or stdio.

use futures::{SinkExt, StreamExt};
use howto::replicate::{FrameCodec, Message};
use howto::{Error, Hash, Mode, ReplicationOutcome, Revision, Store, WriteOptions, PROTOCOL_VERSION};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncWrite, DuplexStream};
use tokio_util::codec::{FramedRead, FramedWrite};

fn new_store() -> (TempDir, Store) {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    (dir, store)
}

fn write(store: &Store, key: &str, prev: Option<Hash>, content: &str) -> Revision {
    let mut options = WriteOptions::key(key);
    options.prev = prev;
    store.write(content.as_bytes(), options).unwrap()
}

/// A chain of `len` revisions of `key`, returning its head
fn chain(store: &Store, key: &str, len: usize, size: usize) -> Hash {
    let mut prev = None;
    for i in 0..len {
        let content = format!("{} revision {}\n", key, i).repeat(size / 16 + 1);
        prev = Some(write(store, key, prev, &content).hash);
    }
    prev.unwrap()
}

async fn session(
    a: &Store,
    mode_a: Mode,
    b: &Store,
    mode_b: Mode,
    buffer: usize,
) -> (howto::Result<ReplicationOutcome>, howto::Result<ReplicationOutcome>) {
    let (left, right) = tokio::io::duplex(buffer);
    tokio::join!(
        a.replicate_stream(mode_a, left),
        b.replicate_stream(mode_b, right)
    )
}

async fn replicate(a: &Store, mode_a: Mode, b: &Store, mode_b: Mode) -> (ReplicationOutcome, ReplicationOutcome) {
    let (a_out, b_out) = session(a, mode_a, b, mode_b, 64 * 1024).await;
    (a_out.unwrap(), b_out.unwrap())
}

fn sorted_heads(store: &Store) -> Vec<(String, Hash)> {
    let mut heads = store.revisions().all_heads();
    heads.sort();
    heads
}

/// Every head's history reaches its root without gaps
fn assert_no_broken_chains(store: &Store) {
    for (_, head) in store.revisions().all_heads() {
        for revision in store.history(head) {
            revision.unwrap();
        }
    }
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn test_push_copies_everything() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "tea", 3, 64);
    chain(&a, "coffee", 2, 64);

    let (a_out, b_out) = replicate(&a, Mode::Push, &b, Mode::Pull).await;
    assert_eq!(a_out.sent, 5);
    assert_eq!(b_out.received, 5);
    assert_eq!(b_out.skipped, 0);
    assert!(b_out.diverged.is_empty());

    assert_eq!(sorted_heads(&a), sorted_heads(&b));
    assert_eq!(a.status().unwrap().revisions, b.status().unwrap().revisions);
    assert_no_broken_chains(&b);

    let mut content = String::new();
    std::io::Read::read_to_string(&mut b.read("tea").unwrap(), &mut content).unwrap();
    assert!(content.starts_with("tea revision 2"));
}

#[tokio::test]
async fn test_repeated_push_is_idempotent() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "tea", 4, 64);

    replicate(&a, Mode::Push, &b, Mode::Pull).await;
    let before = b.status().unwrap();

    let (a_out, b_out) = replicate(&a, Mode::Push, &b, Mode::Pull).await;
    assert_eq!(a_out.sent, 0);
    assert_eq!(b_out.received, 0);
    assert_eq!(b.status().unwrap().revisions, before.revisions);
    assert_eq!(sorted_heads(&a), sorted_heads(&b));
}

#[tokio::test]
async fn test_sync_extends_shared_history() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    let root = write(&a, "doc", None, "v1");
    replicate(&a, Mode::Push, &b, Mode::Pull).await;

    // Only `a` moves on; `b` learns the new head and the key stays linear
    let v2 = write(&a, "doc", Some(root.hash), "v2");
    let (a_out, b_out) = replicate(&a, Mode::Sync, &b, Mode::Sync).await;
    assert_eq!(a_out.sent, 1);
    assert_eq!(b_out.received, 1);
    assert_eq!(b.heads("doc").unwrap().hashes(), vec![v2.hash]);
}

#[tokio::test]
async fn test_sync_keeps_divergence() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    let root = write(&a, "doc", None, "shared");
    replicate(&a, Mode::Push, &b, Mode::Pull).await;

    let ours = write(&a, "doc", Some(root.hash), "edited on a");
    let theirs = write(&b, "doc", Some(root.hash), "edited on b");

    let (a_out, b_out) = replicate(&a, Mode::Sync, &b, Mode::Sync).await;
    assert_eq!(a_out.diverged, vec!["doc".to_string()]);
    assert_eq!(b_out.diverged, vec!["doc".to_string()]);

    for store in [&a, &b] {
        let heads = store.heads("doc").unwrap();
        assert!(heads.is_diverged());
        let mut hashes = heads.hashes();
        hashes.sort();
        let mut expected = vec![ours.hash, theirs.hash];
        expected.sort();
        assert_eq!(hashes, expected);
    }
    assert_eq!(sorted_heads(&a), sorted_heads(&b));
}

#[tokio::test]
async fn test_same_content_under_different_keys() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    let root = write(&a, "foo", None, "shared");
    let next = write(&a, "foo", Some(root.hash), "next");
    let theirs = write(&b, "bar", None, "shared");
    assert_eq!(root.hash, theirs.hash);

    let (a_out, b_out) = replicate(&a, Mode::Sync, &b, Mode::Sync).await;

    // `next` cannot hang off a revision `b` records under `bar`
    assert_eq!(b_out.received, 0);
    assert_eq!(b_out.skipped, 1);
    assert_eq!(a_out.received, 0);

    assert_eq!(a.keys(), vec!["foo"]);
    assert_eq!(a.heads("foo").unwrap().hashes(), vec![next.hash]);
    assert_eq!(b.keys(), vec!["bar"]);
    assert_eq!(b.heads("bar").unwrap().hashes(), vec![theirs.hash]);

    let mut content = String::new();
    std::io::Read::read_to_string(&mut b.read("bar").unwrap(), &mut content).unwrap();
    assert_eq!(content, "shared");

    for store in [&a, &b] {
        for key in store.keys() {
            assert!(!store.heads(&key).unwrap().is_empty(), "{} lost its heads", key);
        }
        assert_no_broken_chains(store);
    }

    // A second round changes nothing
    let (_, b_out) = replicate(&a, Mode::Sync, &b, Mode::Sync).await;
    assert_eq!(b_out.received, 0);
    assert_eq!(b.heads("bar").unwrap().hashes(), vec![theirs.hash]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_between_spawned_sessions() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "left", 10, 2 * 1024);
    chain(&b, "right", 10, 2 * 1024);

    let (left, right) = tokio::io::duplex(4 * 1024);
    let a_task = tokio::spawn({
        let a = a.clone();
        async move { a.replicate_stream(Mode::Sync, left).await }
    });
    let b_task = tokio::spawn({
        let b = b.clone();
        async move { b.replicate_stream(Mode::Sync, right).await }
    });

    let a_out = a_task.await.unwrap().unwrap();
    let b_out = b_task.await.unwrap().unwrap();
    assert_eq!(a_out.received, 10);
    assert_eq!(b_out.received, 10);
    assert_eq!(sorted_heads(&a), sorted_heads(&b));
    assert_no_broken_chains(&a);
}

#[tokio::test]
async fn test_pull_only_receives() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "mine", 2, 32);
    chain(&b, "theirs", 2, 32);

    let (a_out, b_out) = replicate(&a, Mode::Pull, &b, Mode::Sync).await;
    assert_eq!(a_out.received, 2);
    assert_eq!(a_out.sent, 0);
    assert_eq!(b_out.received, 0);
    assert_eq!(a.keys(), vec!["mine", "theirs"]);
    assert_eq!(b.keys(), vec!["theirs"]);
}

#[tokio::test]
async fn test_modes_without_a_direction_transfer_nothing() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "a", 1, 8);
    chain(&b, "b", 1, 8);

    let (a_out, b_out) = replicate(&a, Mode::Push, &b, Mode::Push).await;
    assert_eq!((a_out.sent, a_out.received), (0, 0));
    assert_eq!((b_out.sent, b_out.received), (0, 0));
    assert_eq!(a.keys(), vec!["a"]);
}

#[tokio::test]
async fn test_large_bidirectional_sync_does_not_deadlock() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    chain(&a, "left", 40, 8 * 1024);
    chain(&b, "right", 40, 8 * 1024);

    // A pipe far smaller than either side's object stream
    let (a_out, b_out) = session(&a, Mode::Sync, &b, Mode::Sync, 1024).await;
    let (a_out, b_out) = (a_out.unwrap(), b_out.unwrap());
    assert_eq!(a_out.received, 40);
    assert_eq!(b_out.received, 40);
    assert_eq!(sorted_heads(&a), sorted_heads(&b));
}

// ============================================================================
// Interruption
// ============================================================================

/// Fails every write once `remaining` bytes have been written
struct Truncating<W> {
    inner: W,
    remaining: usize,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Truncating<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let len = buf.len().min(self.remaining);
        let poll = Pin::new(&mut self.inner).poll_write(cx, &buf[..len]);
        if let Poll::Ready(Ok(n)) = poll {
            self.remaining -= n;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn test_interrupted_push_resumes() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    let head = chain(&a, "long", 20, 4 * 1024);

    {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(left);
        let writer = Truncating {
            inner: writer,
            remaining: 30 * 1024,
        };
        let (a_out, b_out) = tokio::join!(
            a.replicate(Mode::Push, reader, writer),
            b.replicate_stream(Mode::Pull, right)
        );
        assert!(a_out.is_err());
        assert!(b_out.is_err());
    }

    // Whatever arrived is a parent-complete prefix
    let partial = b.status().unwrap().revisions;
    assert!(partial < 20, "expected a partial transfer, got {}", partial);
    assert_no_broken_chains(&b);

    let (a_out, b_out) = replicate(&a, Mode::Push, &b, Mode::Pull).await;
    assert_eq!(a_out.sent, 20 - partial);
    assert_eq!(b_out.received, 20 - partial);
    assert_eq!(b.heads("long").unwrap().hashes(), vec![head]);
    assert_eq!(b.history(head).count(), 20);
}

// ============================================================================
// Derived indices follow replication
// ============================================================================

#[tokio::test]
async fn test_received_revisions_are_searchable_and_recent() {
    let (_da, a) = new_store();
    let (_db, b) = new_store();
    let tagged = a
        .write(&b"..."[..], WriteOptions::key("install rust").with_tags(["linux"]))
        .unwrap();

    replicate(&a, Mode::Push, &b, Mode::Pull).await;

    let hits = b.search(&["linux"]).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].hash, tagged.hash);

    // Original timestamps survive the trip
    let recent = b.recent(Some(1)).unwrap();
    assert_eq!(recent[0], tagged);
}

// ============================================================================
// Misbehaving peers
// ============================================================================

/// Send `messages` as a peer would, then hang up
async fn scripted_peer(stream: DuplexStream, messages: Vec<Message>) {
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedWrite::new(writer, FrameCodec);
    for message in messages {
        if frames.send(message).await.is_err() {
            break;
        }
    }
    let _ = frames.close().await;
    // Drain until the local side hangs up
    let mut incoming = FramedRead::new(reader, FrameCodec);
    while let Some(Ok(_)) = incoming.next().await {}
}

async fn against_script(store: &Store, messages: Vec<Message>) -> howto::Result<ReplicationOutcome> {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (outcome, ()) = tokio::join!(
        store.replicate_stream(Mode::Pull, left),
        scripted_peer(right, messages)
    );
    outcome
}

fn opening() -> Vec<Message> {
    vec![
        Message::Hello {
            version: PROTOCOL_VERSION,
            mode: Mode::Push,
        },
        Message::Manifest {
            heads: vec![],
            recent: vec![],
        },
    ]
}

fn object(key: &str, prev: Option<Hash>, data: &[u8]) -> (Hash, Message) {
    let hash = Hash::digest(data);
    let revision = Revision::new(hash, key, prev).with_time(1_000);
    (
        hash,
        Message::Object {
            revision,
            data: data.to_vec(),
        },
    )
}

#[tokio::test]
async fn test_corrupt_object_aborts() {
    let (_d, store) = new_store();
    let hash = Hash::digest(b"promised");
    let mut script = opening();
    script.push(Message::Offer { hashes: vec![hash] });
    script.push(Message::Want { hashes: vec![] });
    script.push(Message::Object {
        revision: Revision::new(hash, "doc", None),
        data: b"tampered".to_vec(),
    });

    let err = against_script(&store, script).await.unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {:?}", err);
    assert!(!store.revisions().contains(&hash));
}

#[tokio::test]
async fn test_unrequested_object_is_a_protocol_error() {
    let (_d, store) = new_store();
    let (_, obj) = object("doc", None, b"surprise");
    let mut script = opening();
    script.push(Message::Offer { hashes: vec![] });
    script.push(Message::Want { hashes: vec![] });
    script.push(obj);

    let err = against_script(&store, script).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_version_mismatch_is_rejected() {
    let (_d, store) = new_store();
    let script = vec![Message::Hello {
        version: PROTOCOL_VERSION + 1,
        mode: Mode::Push,
    }];
    let err = against_script(&store, script).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_hangup_before_done() {
    let (_d, store) = new_store();
    let err = against_script(&store, opening()).await.unwrap_err();
    assert!(matches!(err, Error::ChannelClosed), "got {:?}", err);
}

#[tokio::test]
async fn test_children_wait_for_their_parent() {
    let (_d, store) = new_store();
    let (parent, parent_obj) = object("doc", None, b"first");
    let (child, child_obj) = object("doc", Some(parent), b"second");

    let mut script = opening();
    script.push(Message::Offer {
        hashes: vec![parent, child],
    });
    script.push(Message::Want { hashes: vec![] });
    // Delivered out of order
    script.push(child_obj);
    script.push(parent_obj);
    script.push(Message::Done);

    let outcome = against_script(&store, script).await.unwrap();
    assert_eq!(outcome.received, 2);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(store.heads("doc").unwrap().hashes(), vec![child]);
}

#[tokio::test]
async fn test_orphans_are_dropped() {
    let (_d, store) = new_store();
    let missing = Hash::digest(b"never sent");
    let (orphan, orphan_obj) = object("doc", Some(missing), b"orphan");

    let mut script = opening();
    script.push(Message::Offer {
        hashes: vec![orphan],
    });
    script.push(Message::Want { hashes: vec![] });
    script.push(orphan_obj);
    script.push(Message::Done);

    let outcome = against_script(&store, script).await.unwrap();
    assert_eq!(outcome.received, 0);
    assert_eq!(outcome.skipped, 1);
    assert!(!store.revisions().contains(&orphan));
    assert!(store.keys().is_empty());
}
