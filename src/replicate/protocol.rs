//! Replication wire messages and framing

use super::Mode;
use crate::model::{Hash, Revision};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame either side will send or accept
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Replication protocol
///
/// Each side sends, in this order:
/// - `Hello` and `Manifest` immediately
/// - `Offer` once the peer's manifest has arrived
/// - `Want` once the peer's offer has arrived
/// - its `Object`s and finally `Done` once the peer's want list has arrived
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Hello {
        version: u32,
        mode: Mode,
    },
    /// Current heads plus a bounded summary of recent revisions, each
    /// paired with the key it belongs to
    Manifest {
        heads: Vec<(String, Hash)>,
        recent: Vec<(String, Hash)>,
    },
    /// Hashes the sender believes the peer lacks, parents before children
    Offer { hashes: Vec<Hash> },
    /// The subset of the peer's offer the sender does not have
    Want { hashes: Vec<Hash> },
    Object {
        revision: Revision,
        data: Vec<u8>,
    },
    /// No more objects will follow from the sender
    Done,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Manifest { .. } => "manifest",
            Message::Offer { .. } => "offer",
            Message::Want { .. } => "want",
            Message::Object { .. } => "object",
            Message::Done => "done",
        }
    }
}

/// Length-prefixed (u32 big-endian) bincode frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "received frame that is too large: {}",
                frame_len
            )));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(frame_len);
        let message = bincode::deserialize(&frame)
            .map_err(|e| Error::Protocol(format!("undecodable frame: {}", e)))?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload = bincode::serialize(&item)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "attempting to send frame that is too large: {}",
                payload.len()
            )));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
