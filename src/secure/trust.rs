//! Peer certificate trust.
//!
//! Certificates are self-signed, so there is no chain to validate. Instead a
//! peer is identified by the fingerprint of its certificate, which is compared
//! against the fingerprint recorded for that peer the first time it was seen
//! (or confirmed by the user, or pinned in the configuration).
//!
//! The file store is a small TOML document:
//!
//! ```toml
//! [peers]
//! "192.168.1.20" = "3A:9F:...:C1"
//! "desk.local:24800" = "77:02:...:5E"
//! ```

use super::fingerprint::Fingerprint;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// How a peer's fingerprint is judged after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrustPolicy {
    /// Unknown peers are recorded and accepted; known peers must match.
    #[default]
    TrustOnFirstUse,
    /// Unknown peers are rejected until [`TrustVerifier::trust`] records them;
    /// known peers must match.
    Confirm,
    /// Only this fingerprint is accepted. The store is not consulted.
    Pinned(Fingerprint),
}

impl FromStr for TrustPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tofu" | "trust_on_first_use" => Ok(TrustPolicy::TrustOnFirstUse),
            "confirm" => Ok(TrustPolicy::Confirm),
            _ => Err(Error::InvalidTrustPolicy { got: s.to_string() }),
        }
    }
}

impl fmt::Display for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::TrustOnFirstUse => f.write_str("tofu"),
            TrustPolicy::Confirm => f.write_str("confirm"),
            TrustPolicy::Pinned(fp) => write!(f, "pinned({fp})"),
        }
    }
}

/// Fingerprints recorded per peer.
pub trait TrustStore: Send + Sync + fmt::Debug {
    fn lookup(&self, peer: &str) -> Option<Fingerprint>;

    /// Records `fingerprint` for `peer`, replacing any previous entry.
    fn store(&self, peer: &str, fingerprint: Fingerprint) -> Result<(), Error>;

    /// Persists pending changes, if the store is backed by anything.
    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Process-local store; forgets everything on exit.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    peers: Mutex<HashMap<String, Fingerprint>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn lookup(&self, peer: &str) -> Option<Fingerprint> {
        lock(&self.peers).get(peer).copied()
    }

    fn store(&self, peer: &str, fingerprint: Fingerprint) -> Result<(), Error> {
        lock(&self.peers).insert(peer.to_string(), fingerprint);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustFile {
    #[serde(default)]
    peers: BTreeMap<String, Fingerprint>,
}

#[derive(Debug)]
struct FileState {
    contents: TrustFile,
    dirty: bool,
}

/// Store backed by a TOML file.
///
/// The file is read once on open and rewritten on every change. A failed
/// write leaves the change pending; it is retried on the next store, flush,
/// or drop.
#[derive(Debug)]
pub struct FileTrustStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileTrustStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let contents = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| Error::TrustStore {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrustFile::default(),
            Err(e) => {
                return Err(Error::TrustStore {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        debug!(path = %path.display(), peers = contents.peers.len(), "Trust store opened");
        Ok(Self {
            path,
            state: Mutex::new(FileState {
                contents,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, state: &mut FileState) -> Result<(), Error> {
        if !state.dirty {
            return Ok(());
        }
        let store_error = |reason: String| Error::TrustStore {
            path: self.path.display().to_string(),
            reason,
        };

        let text = toml::to_string_pretty(&state.contents).map_err(|e| store_error(e.to_string()))?;
        if let Some(dir) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| store_error(e.to_string()))?;
        }

        // Readers never see a half-written file
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, text).map_err(|e| store_error(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| store_error(e.to_string()))?;

        state.dirty = false;
        Ok(())
    }
}

impl TrustStore for FileTrustStore {
    fn lookup(&self, peer: &str) -> Option<Fingerprint> {
        lock(&self.state).contents.peers.get(peer).copied()
    }

    fn store(&self, peer: &str, fingerprint: Fingerprint) -> Result<(), Error> {
        let mut state = lock(&self.state);
        state.contents.peers.insert(peer.to_string(), fingerprint);
        state.dirty = true;
        self.write(&mut state)
    }

    fn flush(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        self.write(&mut state)
    }
}

impl Drop for FileTrustStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "Failed to flush trust store");
        }
    }
}

/// Applies a [`TrustPolicy`] against a [`TrustStore`].
#[derive(Debug, Clone)]
pub struct TrustVerifier {
    policy: TrustPolicy,
    store: Arc<dyn TrustStore>,
}

impl TrustVerifier {
    pub fn new(policy: TrustPolicy, store: Arc<dyn TrustStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn TrustStore> {
        &self.store
    }

    /// Decides whether `peer` presenting `fingerprint` is trusted.
    ///
    /// Under trust-on-first-use an unknown peer is recorded as a side effect.
    ///
    /// # Errors
    ///
    /// - [`Error::FingerprintMismatch`] if a different fingerprint is recorded
    ///   or pinned.
    /// - [`Error::UntrustedFingerprint`] for an unknown peer under
    ///   [`TrustPolicy::Confirm`].
    pub fn verify(&self, peer: &str, fingerprint: &Fingerprint) -> Result<(), Error> {
        let mismatch = |expected: &Fingerprint| Error::FingerprintMismatch {
            peer: peer.to_string(),
            expected: expected.to_string(),
            actual: fingerprint.to_string(),
        };

        if let TrustPolicy::Pinned(pinned) = &self.policy {
            return if pinned == fingerprint {
                Ok(())
            } else {
                Err(mismatch(pinned))
            };
        }

        match self.store.lookup(peer) {
            Some(known) if known == *fingerprint => {
                debug!(peer, %fingerprint, "Peer fingerprint matches");
                Ok(())
            }
            Some(known) => Err(mismatch(&known)),
            None => match self.policy {
                TrustPolicy::TrustOnFirstUse => {
                    info!(peer, %fingerprint, "Trusting new peer on first use");
                    self.store.store(peer, *fingerprint)
                }
                _ => Err(Error::UntrustedFingerprint {
                    peer: peer.to_string(),
                    fingerprint: fingerprint.to_string(),
                }),
            },
        }
    }

    /// Records `fingerprint` as trusted for `peer`, for example after the
    /// user confirmed it.
    pub fn trust(&self, peer: &str, fingerprint: Fingerprint) -> Result<(), Error> {
        info!(peer, %fingerprint, "Peer fingerprint trusted");
        self.store.store(peer, fingerprint)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
