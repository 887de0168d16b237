//! Keyword search over key names and tags

mod keyword;

pub use keyword::{tokenize, SearchHit, SearchIndex};
