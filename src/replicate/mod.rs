//! Peer replication over a single duplex byte stream
//!
//! Two stores exchange manifests of their heads, work out which revisions
//! the other side lacks, and stream those revisions (blob plus metadata)
//! parents first. Re-running a session is always safe: anything the
//! receiver already has is filtered out before transfer.

mod protocol;
mod session;

pub use protocol::{FrameCodec, Message, MAX_FRAME_SIZE};
pub use session::Replicator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which directions a side is willing to replicate in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Send local revisions the peer lacks
    Push,
    /// Receive revisions from the peer
    Pull,
    /// Both directions at once
    Sync,
}

impl Mode {
    pub fn sends(&self) -> bool {
        matches!(self, Mode::Push | Mode::Sync)
    }

    pub fn receives(&self) -> bool {
        matches!(self, Mode::Pull | Mode::Sync)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Push => "push",
            Mode::Pull => "pull",
            Mode::Sync => "sync",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "push" => Ok(Mode::Push),
            "pull" => Ok(Mode::Pull),
            "sync" => Ok(Mode::Sync),
            other => Err(crate::Error::Config(format!(
                "unknown replication mode: {}",
                other
            ))),
        }
    }
}

/// Summary of a completed session, from the local side's point of view
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationOutcome {
    /// Revisions streamed to the peer
    pub sent: usize,
    /// Revisions newly recorded locally
    pub received: usize,
    /// Received revisions dropped because their ancestors never arrived
    pub skipped: usize,
    /// Keys touched by this session that now have more than one head
    pub diverged: Vec<String>,
}
