//! Named replication peers
//!
//! Peers are stored in `remotes.json` inside the data directory. The
//! transport that carries a replication session lives in [`transport`].

mod transport;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use transport::{connect, replicate_stdio, serve, DEFAULT_PORT};

const CONFIG_FILE: &str = "remotes.json";

/// A named peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    /// Name of the remote (e.g., "laptop")
    pub name: String,
    /// `host:port` the peer serves on
    pub address: String,
    /// When we last completed a session with this remote (unix seconds)
    #[serde(default)]
    pub last_sync: Option<u64>,
}

impl Remote {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Remote {
            name: name.into(),
            address: address.into(),
            last_sync: None,
        }
    }

    /// The address with the default port filled in when none is given
    pub fn socket_address(&self) -> String {
        with_default_port(&self.address)
    }
}

/// `addr`, with [`DEFAULT_PORT`] appended if it carries no port
pub fn with_default_port(addr: &str) -> String {
    let addr = addr.trim();
    let has_port = match addr.rsplit_once(':') {
        // Bracketed IPv6 literals contain colons of their own
        Some((host, port)) => {
            !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    }
}

/// Configuration for all remotes, stored alongside the store
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Map of remote name to remote configuration
    pub remotes: BTreeMap<String, Remote>,
    /// Default remote for sync/push/pull
    #[serde(default)]
    pub default_remote: Option<String>,
}

impl RemoteConfig {
    /// Load remote config from a data directory
    pub fn load(datadir: &Path) -> crate::Result<Self> {
        let config_path = Self::config_path(datadir);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save remote config to a data directory
    pub fn save(&self, datadir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(datadir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::config_path(datadir), content)?;
        Ok(())
    }

    fn config_path(datadir: &Path) -> PathBuf {
        datadir.join(CONFIG_FILE)
    }

    /// Add a new remote
    pub fn add(&mut self, name: impl Into<String>, address: impl Into<String>) -> crate::Result<()> {
        let name = name.into();
        if self.remotes.contains_key(&name) {
            return Err(crate::Error::Remote(format!(
                "Remote '{}' already exists",
                name
            )));
        }
        self.remotes
            .insert(name.clone(), Remote::new(name.clone(), address));

        // First remote becomes the default
        if self.default_remote.is_none() {
            self.default_remote = Some(name);
        }

        Ok(())
    }

    /// Remove a remote
    pub fn remove(&mut self, name: &str) -> crate::Result<()> {
        if self.remotes.remove(name).is_none() {
            return Err(crate::Error::Remote(format!("Remote '{}' not found", name)));
        }

        if self.default_remote.as_deref() == Some(name) {
            self.default_remote = self.remotes.keys().next().cloned();
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.get(name)
    }

    pub fn list(&self) -> Vec<&Remote> {
        self.remotes.values().collect()
    }

    /// The default remote, if one is configured
    pub fn default_peer(&self) -> Option<&Remote> {
        self.default_remote
            .as_deref()
            .and_then(|name| self.remotes.get(name))
    }

    pub fn set_default(&mut self, name: &str) -> crate::Result<()> {
        if !self.remotes.contains_key(name) {
            return Err(crate::Error::Remote(format!("Remote '{}' not found", name)));
        }
        self.default_remote = Some(name.to_string());
        Ok(())
    }

    /// Resolve a peer argument: a remote name, a literal address, or the default
    pub fn resolve(&self, peer: Option<&str>) -> Option<(Option<String>, String)> {
        match peer {
            Some(peer) => Some(match self.get(peer) {
                Some(remote) => (Some(remote.name.clone()), remote.socket_address()),
                None => (None, with_default_port(peer)),
            }),
            None => self
                .default_peer()
                .map(|remote| (Some(remote.name.clone()), remote.socket_address())),
        }
    }

    /// Update the last_sync timestamp for a remote
    pub fn update_last_sync(&mut self, name: &str) -> crate::Result<()> {
        let remote = self
            .remotes
            .get_mut(name)
            .ok_or_else(|| crate::Error::Remote(format!("Remote '{}' not found", name)))?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        remote.last_sync = Some(now);
        Ok(())
    }
}
