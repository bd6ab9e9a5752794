//! The swarm error taxonomy.
//!
//! Internal activities never crash the engine. Failures surface as a
//! structured [`SwarmError`] record on the swarm or engine emitter, carrying
//! a category, a stable machine-readable code, whether the condition is
//! recoverable, and the action the engine took or recommends. Control
//! surface calls collapse to an [`EngineError`].
use harbor_primitives::info_hash::InfoHash;
use thiserror::Error;

/// The failure domains of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Category {
    /// Malformed metainfo, framing violation, bencode residue. Fatal to the
    /// swarm, never retried.
    Parse,
    /// Tracker transport or protocol failure. Recovered by failover.
    Tracker,
    /// A misbehaving remote peer. The peer is dropped, the swarm continues.
    Peer,
    /// A completed piece failed its hash. The piece is refetched; repeated
    /// failures pause the swarm.
    Verification,
    /// Disk trouble. The swarm pauses.
    Filesystem,
    /// A magnet swarm could not obtain its metainfo.
    MetadataFetch,
    /// An engine-level limit was hit.
    Resource,
}

/// What the engine did (or wants the operator to do) about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Action {
    Retry,
    Skip,
    Pause,
    Abort,
}

/// A structured error record as emitted on the event surface.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[error("{category:?}/{code}: {message}")]
pub struct SwarmError {
    pub category: Category,
    /// Stable machine-readable code, e.g. `piece-hash-mismatch`.
    pub code: &'static str,
    pub message: String,
    /// Free-form context: a path, a peer address, a tracker URL.
    pub context: Option<String>,
    pub recoverable: bool,
    pub action: Action,
}

impl SwarmError {
    #[must_use]
    pub fn new(category: Category, code: &'static str, message: String, recoverable: bool, action: Action) -> Self {
        Self {
            category,
            code,
            message,
            context: None,
            recoverable,
            action,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn parse(code: &'static str, message: String) -> Self {
        Self::new(Category::Parse, code, message, false, Action::Abort)
    }

    #[must_use]
    pub fn tracker(code: &'static str, message: String) -> Self {
        Self::new(Category::Tracker, code, message, true, Action::Retry)
    }

    #[must_use]
    pub fn peer(code: &'static str, message: String) -> Self {
        Self::new(Category::Peer, code, message, true, Action::Skip)
    }

    #[must_use]
    pub fn verification(code: &'static str, message: String) -> Self {
        Self::new(Category::Verification, code, message, false, Action::Pause)
    }

    #[must_use]
    pub fn filesystem(code: &'static str, message: String) -> Self {
        Self::new(Category::Filesystem, code, message, false, Action::Pause)
    }

    #[must_use]
    pub fn metadata_fetch(code: &'static str, message: String) -> Self {
        Self::new(Category::MetadataFetch, code, message, false, Action::Abort)
    }
}

impl From<&super::storage::Error> for SwarmError {
    fn from(error: &super::storage::Error) -> Self {
        Self::filesystem("storage-failure", error.to_string())
    }
}

impl From<&harbor_metainfo::Error> for SwarmError {
    fn from(error: &harbor_metainfo::Error) -> Self {
        Self::parse("bad-metainfo", error.to_string())
    }
}

/// Errors returned by the engine's control surface.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("the swarm {info_hash} already exists")]
    DuplicateSwarm { info_hash: InfoHash },

    #[error("no swarm with identity {info_hash}")]
    UnknownSwarm { info_hash: InfoHash },

    #[error("the engine is at its limit of {max} active swarms")]
    TooManySwarms { max: usize },

    #[error("could not read the torrent source: {source}")]
    Source { source: std::io::Error },

    #[error("invalid metainfo: {source}")]
    Metainfo {
        #[from]
        source: harbor_metainfo::Error,
    },

    #[error("invalid magnet link: {source}")]
    Magnet {
        #[from]
        source: harbor_metainfo::magnet::Error,
    },

    #[error("the swarm rejected the command (it is shutting down)")]
    SwarmGone,
}

#[cfg(test)]
mod tests {
    use super::{Action, Category, SwarmError};

    #[test]
    fn the_display_form_should_carry_category_code_and_message() {
        let error = SwarmError::verification("piece-hash-mismatch", "piece 7 failed 3 times".to_owned());

        assert_eq!(
            error.to_string(),
            "Verification/piece-hash-mismatch: piece 7 failed 3 times"
        );
        assert_eq!(error.action, Action::Pause);
        assert!(!error.recoverable);
    }

    #[test]
    fn category_constructors_should_pick_the_documented_default_actions() {
        assert_eq!(SwarmError::parse("x", String::new()).action, Action::Abort);
        assert_eq!(SwarmError::tracker("x", String::new()).action, Action::Retry);
        assert_eq!(SwarmError::peer("x", String::new()).action, Action::Skip);
        assert_eq!(SwarmError::filesystem("x", String::new()).action, Action::Pause);
        assert_eq!(Category::Resource, SwarmError::new(Category::Resource, "x", String::new(), false, Action::Abort).category);
    }
}
