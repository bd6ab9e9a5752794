//! Application assembly: configuration in, running engine and service jobs
//! out.
//!
//! The binary (and any embedder that wants the whole service rather than a
//! bare [`Engine`](crate::core::Engine)) calls [`start`]: it builds the
//! engine, restores the previous session from the state snapshot, binds the
//! peer listener and starts the periodic snapshot job. The returned
//! [`Running`] bundle keeps everything alive until [`Running::shutdown`].
use std::sync::Arc;

use harbor_configuration::Configuration;
use tokio::sync::mpsc;
use tracing::info;

use crate::core::events::{self, Event};
use crate::core::Engine;

/// A started application.
pub struct Running {
    pub engine: Arc<Engine>,
    /// Lifecycle events for whoever embeds the engine.
    pub events: mpsc::Receiver<Event>,
    snapshot_job: tokio::task::JoinHandle<()>,
}

impl Running {
    /// Persists state and stops every swarm.
    pub async fn shutdown(self) {
        self.snapshot_job.abort();
        self.engine.shutdown().await;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not start the DHT: {source}")]
    Dht {
        #[from]
        source: crate::dht::Error,
    },

    #[error("could not bind the peer listener: {source}")]
    Listener { source: std::io::Error },
}

/// Builds and starts the whole application.
///
/// # Errors
///
/// Will return an [`Error`] when a socket cannot be bound.
pub async fn start(configuration: Configuration) -> Result<Running, Error> {
    let (event_sender, events) = events::channel();

    let engine = Engine::new(configuration, event_sender).await?;

    engine.restore_state().await;

    let listen_address = engine
        .spawn_listener()
        .await
        .map_err(|source| Error::Listener { source })?;
    info!(%listen_address, "accepting peers");

    let snapshot_job = engine.spawn_snapshot_job();

    Ok(Running {
        engine,
        events,
        snapshot_job,
    })
}

#[cfg(test)]
mod tests {
    use harbor_configuration::Configuration;

    #[tokio::test]
    async fn the_application_should_boot_with_a_default_configuration() {
        let root = tempfile::tempdir().unwrap();

        let mut configuration = Configuration::default();
        configuration.download_root = root.path().display().to_string();
        configuration.dht.enabled = false;
        configuration.network.port = 0;

        let running = super::start(configuration).await.unwrap();

        assert!(running.engine.list_swarms().await.is_empty());

        running.shutdown().await;
    }
}
