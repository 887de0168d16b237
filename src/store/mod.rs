//! Storage layer
//!
//! Blob bytes live in a directory of content-addressed files; revision and
//! search metadata live in a single append-only key/value log.

mod blob;
mod blob_store;
mod kv;

pub use blob::{Blob, Encoding};
pub use blob_store::BlobStore;
pub use kv::{Batch, KvStore, Op};
