//! Blob envelope - how content bytes are laid out on the storage medium

use crate::model::Hash;
use crate::{Error, Result};

/// Storage encoding of a blob file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Stored verbatim
    Raw,
    /// zstd-compressed
    Zstd,
}

impl Encoding {
    pub fn as_byte(&self) -> u8 {
        match self {
            Encoding::Raw => 0,
            Encoding::Zstd => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Encoding::Raw),
            1 => Some(Encoding::Zstd),
            _ => None,
        }
    }
}

/// Content bytes plus the hash they are addressed by
#[derive(Clone, Debug)]
pub struct Blob {
    pub hash: Hash,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Blob {
            hash: Hash::digest(&data),
            data,
        }
    }

    /// Encode for storage: one encoding byte followed by the body
    pub fn encode(&self, encoding: Encoding) -> Result<Vec<u8>> {
        let mut output = vec![encoding.as_byte()];
        match encoding {
            Encoding::Raw => output.extend_from_slice(&self.data),
            Encoding::Zstd => output.extend(zstd::encode_all(self.data.as_slice(), 3)?),
        }
        Ok(output)
    }

    /// Decode a stored envelope and verify it against the hash it was filed under
    pub fn decode(expected: &Hash, stored: &[u8]) -> Result<Self> {
        let (&tag, body) = stored
            .split_first()
            .ok_or_else(|| Error::Corrupt(format!("{}: empty blob file", expected)))?;

        let encoding = Encoding::from_byte(tag)
            .ok_or_else(|| Error::Corrupt(format!("{}: unknown encoding {}", expected, tag)))?;

        let data = match encoding {
            Encoding::Raw => body.to_vec(),
            Encoding::Zstd => zstd::decode_all(body)
                .map_err(|e| Error::Corrupt(format!("{}: {}", expected, e)))?,
        };

        let blob = Blob::new(data);
        if &blob.hash != expected {
            return Err(Error::Corrupt(format!(
                "{}: content hashes to {}",
                expected, blob.hash
            )));
        }
        Ok(blob)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
