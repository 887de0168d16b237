//! howto CLI - Command line interface for the howto store
//!
//! Thin glue over the library: resolves the data directory, dispatches
//! commands and prints results as JSON or text.

use anyhow::Context;
use clap::{Parser, Subcommand};
use howto::remote::{self, RemoteConfig};
use howto::{Hash, Mode, ReplicationOutcome, Revision, Store, WriteOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "howto")]
#[command(about = "A content-addressed document store with peer replication")]
#[command(version)]
struct Cli {
    /// Data directory (default: $HOWTO_PATH, then the user config directory)
    #[arg(short, long)]
    datadir: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    // === Document Commands ===
    /// Store a new revision, reading content from a file or stdin
    Create {
        /// Key to record under (inherited from --prev when omitted)
        key: Option<String>,
        /// Head this revision supersedes
        #[arg(short, long)]
        prev: Option<String>,
        /// Tag the revision (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Read content from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print the content of a hash or of a key's latest head
    #[command(visible_alias = "show")]
    Read {
        /// Hash or key
        target: String,
    },

    /// Edit a key's latest head (or a given hash) in $EDITOR
    Edit {
        /// Hash or key
        target: String,
    },

    /// Show the current heads of a key
    Heads {
        /// The key
        key: String,
    },

    /// List all keys
    Keys,

    /// List recent revisions, newest first
    Recent {
        /// Maximum number of revisions to return
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Find revisions whose key or tags match every term
    Search {
        /// Search terms
        #[arg(required = true)]
        terms: Vec<String>,
        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the history of a hash or of a key's latest head
    Log {
        /// Hash or key
        target: String,
        /// Maximum number of revisions to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    // === Replication Commands ===
    /// Exchange revisions with a peer in both directions
    Sync {
        /// Remote name or host:port (default remote, or stdin/stdout if none)
        peer: Option<String>,
    },

    /// Send local revisions to a peer
    Push {
        /// Remote name or host:port (default remote, or stdin/stdout if none)
        peer: Option<String>,
    },

    /// Receive revisions from a peer
    Pull {
        /// Remote name or host:port (default remote, or stdin/stdout if none)
        peer: Option<String>,
    },

    /// Accept replication sessions over TCP
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = remote::DEFAULT_PORT)]
        port: u16,
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Only send revisions, never accept them
        #[arg(long)]
        read_only: bool,
    },

    /// Manage named peers
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },

    // === Maintenance Commands ===
    /// Rebuild the search index
    Reindex,

    /// Rewrite the index log without superseded entries
    Compact,

    /// Show store status
    Status {
        /// Also verify every blob
        #[arg(long)]
        scrub: bool,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// Add a named peer
    Add {
        /// Name of the remote
        name: String,
        /// host[:port] the peer serves on
        address: String,
    },
    /// Remove a named peer
    Remove {
        /// Name of the remote
        name: String,
    },
    /// Use a remote when sync/push/pull is given no peer
    Default {
        /// Name of the remote
        name: String,
    },
    /// List named peers
    List,
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries content and stdio replication
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let datadir = resolve_datadir(cli.datadir.as_deref());

    match cli.command {
        Commands::Create {
            key,
            prev,
            tags,
            file,
        } => {
            let store = open_store(&datadir)?;
            let options = WriteOptions {
                key,
                prev: prev.map(|p| p.parse::<Hash>()).transpose()?,
                tags,
            };
            let revision = match file {
                Some(path) => {
                    let file = std::fs::File::open(&path)
                        .with_context(|| format!("cannot open {}", path.display()))?;
                    store.write(file, options)?
                }
                None => store.write(std::io::stdin().lock(), options)?,
            };
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "revision": revision_json(&revision)
                }),
            )?;
        }

        Commands::Read { target } => {
            let store = open_store(&datadir)?;
            let mut reader = store.read(&target)?;
            let mut stdout = std::io::stdout().lock();
            std::io::copy(&mut reader, &mut stdout)?;
            stdout.flush()?;
        }

        Commands::Edit { target } => {
            let store = open_store(&datadir)?;
            let hash = store.resolve(&target)?;
            let revision = store.revision(&hash)?;
            let original = store.get(&hash)?;

            let edited = edit_in_editor(&revision, &original)?;
            if edited == original {
                output(
                    &cli.format,
                    &serde_json::json!({
                        "status": "unchanged",
                        "revision": revision_json(&revision)
                    }),
                )?;
            } else {
                let options = WriteOptions {
                    prev: Some(hash),
                    ..Default::default()
                };
                let new = store.write(&edited[..], options)?;
                output(
                    &cli.format,
                    &serde_json::json!({
                        "status": "ok",
                        "revision": revision_json(&new)
                    }),
                )?;
            }
        }

        Commands::Heads { key } => {
            let store = open_store(&datadir)?;
            let heads = store.heads(&key)?;
            let items: Vec<_> = heads.iter().map(revision_json).collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "key": key,
                    "diverged": heads.is_diverged(),
                    "count": items.len(),
                    "heads": items
                }),
            )?;
        }

        Commands::Keys => {
            let store = open_store(&datadir)?;
            let keys = store.keys();
            output(
                &cli.format,
                &serde_json::json!({
                    "count": keys.len(),
                    "keys": keys
                }),
            )?;
        }

        Commands::Recent { limit } => {
            let store = open_store(&datadir)?;
            let revisions = store.recent(Some(limit))?;
            let items: Vec<_> = revisions.iter().map(revision_json).collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "count": items.len(),
                    "revisions": items
                }),
            )?;
        }

        Commands::Search { terms, limit } => {
            let store = open_store(&datadir)?;
            let mut hits = store.search(&terms[..])?;
            if let Some(limit) = limit {
                hits.truncate(limit);
            }
            let items: Vec<_> = hits
                .iter()
                .map(|hit| {
                    serde_json::json!({
                        "key": hit.key,
                        "hash": hit.hash.to_hex(),
                        "time": hit.time
                    })
                })
                .collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "terms": terms,
                    "count": items.len(),
                    "results": items
                }),
            )?;
        }

        Commands::Log { target, limit } => {
            let store = open_store(&datadir)?;
            let hash = store.resolve(&target)?;
            let revisions = store
                .history(hash)
                .take(limit.unwrap_or(usize::MAX))
                .collect::<howto::Result<Vec<_>>>()?;
            let items: Vec<_> = revisions.iter().map(revision_json).collect();
            output(
                &cli.format,
                &serde_json::json!({
                    "count": items.len(),
                    "revisions": items
                }),
            )?;
        }

        Commands::Sync { peer } => replicate(&datadir, &cli.format, Mode::Sync, peer)?,
        Commands::Push { peer } => replicate(&datadir, &cli.format, Mode::Push, peer)?,
        Commands::Pull { peer } => replicate(&datadir, &cli.format, Mode::Pull, peer)?,

        Commands::Serve {
            port,
            bind,
            read_only,
        } => {
            let store = open_store(&datadir)?;
            let mode = if read_only { Mode::Push } else { Mode::Sync };
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind((bind.as_str(), port))
                    .await
                    .with_context(|| format!("failed to bind {}:{}", bind, port))?;
                eprintln!("serving {} on {}", datadir.display(), listener.local_addr()?);
                remote::serve(store, listener, mode).await?;
                anyhow::Ok(())
            })?;
        }

        Commands::Remote { command } => {
            let mut config = RemoteConfig::load(&datadir)?;
            match command {
                RemoteCommands::Add { name, address } => {
                    config.add(&name, &address)?;
                    config.save(&datadir)?;
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "status": "ok",
                            "name": name,
                            "address": address
                        }),
                    )?;
                }
                RemoteCommands::Remove { name } => {
                    config.remove(&name)?;
                    config.save(&datadir)?;
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "status": "ok",
                            "name": name
                        }),
                    )?;
                }
                RemoteCommands::Default { name } => {
                    config.set_default(&name)?;
                    config.save(&datadir)?;
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "status": "ok",
                            "default": name
                        }),
                    )?;
                }
                RemoteCommands::List => {
                    let items: Vec<_> = config
                        .list()
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "name": r.name,
                                "address": r.address,
                                "last_sync": r.last_sync,
                                "default": config.default_remote.as_deref() == Some(r.name.as_str())
                            })
                        })
                        .collect();
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "count": items.len(),
                            "remotes": items
                        }),
                    )?;
                }
            }
        }

        Commands::Reindex => {
            let store = open_store(&datadir)?;
            let count = store.reindex()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "indexed": count
                }),
            )?;
        }

        Commands::Compact => {
            let store = open_store(&datadir)?;
            store.compact()?;
            output(&cli.format, &serde_json::json!({ "status": "ok" }))?;
        }

        Commands::Status { scrub } => {
            let store = open_store(&datadir)?;
            let status = store.status()?;
            let mut value = serde_json::to_value(&status)?;
            if scrub {
                let corrupt: Vec<String> = store.scrub()?.iter().map(Hash::to_hex).collect();
                value["corrupt"] = serde_json::json!(corrupt);
            }
            output(&cli.format, &value)?;
        }
    }

    Ok(())
}

/// `--datadir`, then `$HOWTO_PATH`, then the user config directory, then cwd
fn resolve_datadir(flag: Option<&Path>) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Some(path) = std::env::var_os("HOWTO_PATH").filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .map(|dir| dir.join("howto"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn open_store(datadir: &Path) -> anyhow::Result<Store> {
    Store::open(datadir).with_context(|| format!("cannot open store at {}", datadir.display()))
}

fn replicate(
    datadir: &Path,
    format: &OutputFormat,
    mode: Mode,
    peer: Option<String>,
) -> anyhow::Result<()> {
    let store = open_store(datadir)?;
    let mut config = RemoteConfig::load(datadir)?;
    let runtime = tokio::runtime::Runtime::new()?;

    match config.resolve(peer.as_deref()) {
        Some((name, address)) => {
            let outcome = runtime
                .block_on(remote::connect(&store, address.as_str(), mode))
                .with_context(|| format!("{} with {} failed", mode, address))?;
            if let Some(name) = name {
                config.update_last_sync(&name)?;
                config.save(datadir)?;
            }
            output(format, &outcome_json(&outcome, Some(&address)))
        }
        None => {
            let outcome = runtime.block_on(remote::replicate_stdio(&store, mode))?;
            // stdout carried the session itself
            eprintln!("{}", serde_json::to_string(&outcome_json(&outcome, None))?);
            Ok(())
        }
    }
}

/// Open the content of `revision` in `$EDITOR` and return what was saved
fn edit_in_editor(revision: &Revision, content: &[u8]) -> anyhow::Result<Vec<u8>> {
    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let path = std::env::temp_dir().join(format!(
        "howto-{}-{}.txt",
        std::process::id(),
        revision.hash.short()
    ));
    std::fs::write(&path, content)?;

    let result = (|| -> anyhow::Result<Vec<u8>> {
        let status = std::process::Command::new(&editor)
            .arg(&path)
            .status()
            .with_context(|| format!("failed to launch editor '{}'", editor))?;
        if !status.success() {
            anyhow::bail!("editor '{}' exited with {}", editor, status);
        }
        let mut edited = Vec::new();
        std::fs::File::open(&path)?.read_to_end(&mut edited)?;
        Ok(edited)
    })();

    let _ = std::fs::remove_file(&path);
    result
}

fn revision_json(revision: &Revision) -> serde_json::Value {
    serde_json::json!({
        "hash": revision.hash.to_hex(),
        "key": revision.key,
        "prev": revision.prev.map(|p| p.to_hex()),
        "time": revision.time,
        "tags": revision.tags
    })
}

fn outcome_json(outcome: &ReplicationOutcome, peer: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "status": "ok",
        "peer": peer,
        "sent": outcome.sent,
        "received": outcome.received,
        "skipped": outcome.skipped,
        "diverged": outcome.diverged
    })
}

fn output(format: &OutputFormat, value: &serde_json::Value) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(value)?);
        }
        OutputFormat::Text => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    Ok(())
}
