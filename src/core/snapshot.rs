//! The engine state snapshot.
//!
//! Lives at `<download-root>/.state/state.json`. One record per swarm:
//! identity, where it came from, where it stores content, which pieces are
//! done, the upload total and the last lifecycle state. Written atomically
//! (temp file + rename) so a crash mid-save never corrupts the previous
//! snapshot.
use std::path::{Path, PathBuf};

use harbor_primitives::info_hash::InfoHash;
use serde::{Deserialize, Serialize};
use tracing::debug;

const STATE_DIR: &str = ".state";
const STATE_FILE: &str = "state.json";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("the snapshot is not valid JSON: {source}")]
    BadJson {
        #[from]
        source: serde_json::Error,
    },
}

/// Where a swarm's metadata came from; enough to re-create it on boot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwarmSource {
    TorrentFile { path: String },
    Magnet { uri: String },
}

/// The last observed lifecycle state, reduced to what matters across a
/// restart: whether to auto-start the swarm again.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistedState {
    Active,
    Paused,
    Stopped,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SwarmSnapshot {
    pub info_hash: InfoHash,
    pub source: SwarmSource,
    pub download_root: String,
    pub completed_pieces: Vec<u32>,
    pub uploaded_bytes: u64,
    /// `None` means all files are selected.
    pub selected_files: Option<Vec<usize>>,
    pub state: PersistedState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EngineSnapshot {
    pub swarms: Vec<SwarmSnapshot>,
}

fn state_file(download_root: &Path) -> PathBuf {
    download_root.join(STATE_DIR).join(STATE_FILE)
}

/// Writes the snapshot atomically.
///
/// # Errors
///
/// Will return an [`Error`] on any filesystem failure.
pub async fn save(download_root: &Path, snapshot: &EngineSnapshot) -> Result<(), Error> {
    let path = state_file(download_root);
    let directory = path.parent().expect("the state file always has a parent");

    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|source| Error::Io {
            path: directory.to_path_buf(),
            source,
        })?;

    let json = serde_json::to_vec_pretty(snapshot)?;

    let temp = path.with_extension("json.tmp");
    tokio::fs::write(&temp, &json).await.map_err(|source| Error::Io {
        path: temp.clone(),
        source,
    })?;
    tokio::fs::rename(&temp, &path).await.map_err(|source| Error::Io {
        path: path.clone(),
        source,
    })?;

    debug!(swarms = snapshot.swarms.len(), path = %path.display(), "state snapshot saved");
    Ok(())
}

/// Loads the snapshot; `None` when none was ever saved.
///
/// # Errors
///
/// Will return an [`Error`] on unreadable or malformed state.
pub async fn load(download_root: &Path) -> Result<Option<EngineSnapshot>, Error> {
    let path = state_file(download_root);

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(Error::Io { path, source }),
    };

    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Looks up one swarm in a snapshot.
#[must_use]
pub fn find_swarm<'a>(snapshot: &'a EngineSnapshot, info_hash: &InfoHash) -> Option<&'a SwarmSnapshot> {
    snapshot.swarms.iter().find(|swarm| swarm.info_hash == *info_hash)
}

#[cfg(test)]
mod tests {
    use harbor_primitives::info_hash::InfoHash;

    use super::{load, save, EngineSnapshot, PersistedState, SwarmSnapshot, SwarmSource};

    fn sample() -> EngineSnapshot {
        EngineSnapshot {
            swarms: vec![SwarmSnapshot {
                info_hash: InfoHash([7; 20]),
                source: SwarmSource::Magnet {
                    uri: "magnet:?xt=urn:btih:0707070707070707070707070707070707070707".to_owned(),
                },
                download_root: "/srv/torrents".to_owned(),
                completed_pieces: vec![0, 1, 5],
                uploaded_bytes: 12_345,
                selected_files: Some(vec![0, 2]),
                state: PersistedState::Active,
            }],
        }
    }

    #[tokio::test]
    async fn a_snapshot_should_round_trip_through_disk() {
        let root = tempfile::tempdir().unwrap();

        save(root.path(), &sample()).await.unwrap();
        let loaded = load(root.path()).await.unwrap();

        assert_eq!(loaded, Some(sample()));
    }

    #[tokio::test]
    async fn loading_with_no_snapshot_should_yield_none() {
        let root = tempfile::tempdir().unwrap();

        assert_eq!(load(root.path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn saving_should_overwrite_the_previous_snapshot() {
        let root = tempfile::tempdir().unwrap();

        save(root.path(), &sample()).await.unwrap();
        save(root.path(), &EngineSnapshot::default()).await.unwrap();

        assert_eq!(load(root.path()).await.unwrap(), Some(EngineSnapshot::default()));
    }

    #[tokio::test]
    async fn the_identity_should_be_stored_as_hex() {
        let root = tempfile::tempdir().unwrap();
        save(root.path(), &sample()).await.unwrap();

        let json = std::fs::read_to_string(root.path().join(".state/state.json")).unwrap();

        assert!(json.contains(&"07".repeat(20)));
        assert!(json.contains("magnet"));
    }
}
