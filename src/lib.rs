//! # howto
//!
//! A content-addressed document store with peer replication.
//!
//! Content is stored once under its BLAKE3 hash and organized into named,
//! append-only revision chains. Two stores converge by exchanging the
//! revisions the other lacks over a single duplex byte stream.
//!
//! ## Core Concepts
//!
//! - **Blobs**: Immutable content, addressed and verified by hash
//! - **Keys**: Human-chosen names with one or more revision chains
//! - **Revisions**: Snapshots of a key's content linked to their predecessor
//! - **Heads**: Revisions nothing supersedes yet; more than one means the key diverged
//!
//! ## Example
//!
//! ```ignore
//! use howto::{Store, WriteOptions};
//!
//! let store = Store::open("~/.config/howto")?;
//! let rev = store.write(&b"sudo apt install rustup"[..], WriteOptions::key("install rust"))?;
//! let hits = store.search(&["rust"])?;
//! ```

pub mod model;
pub mod remote;
pub mod replicate;
pub mod revision;
pub mod search;
pub mod store;

mod database;
mod error;

pub use database::{Store, StoreOptions, StoreStatus, WriteOptions};
pub use error::{Error, Result};
pub use model::{Hash, Heads, Revision};
pub use remote::{Remote, RemoteConfig};
pub use replicate::{Mode, ReplicationOutcome};
pub use revision::{Applied, RevisionIndex};
pub use search::{SearchHit, SearchIndex};
pub use store::{BlobStore, KvStore};

/// Index log format version
pub const KV_VERSION: u32 = 1;

/// Magic bytes for index log identification
pub const KV_MAGIC: &[u8; 8] = b"HOWTO_KV";

/// Replication protocol version exchanged in `Hello`
pub const PROTOCOL_VERSION: u32 = 1;
