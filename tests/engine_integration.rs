//! Whole-engine integration: one engine seeds a torrent, a second engine
//! downloads it through the peer listener, verifies it and reaches
//! seeding itself.
use std::time::Duration;

use harbor::core::events::{channel, Event};
use harbor::core::swarm::SwarmState;
use harbor::core::{AddSource, Engine};
use harbor_configuration::Configuration;
use sha1::{Digest, Sha1};

const PIECE_LENGTH: usize = 4096;

fn sha1(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// A single-file torrent over `content`, named `transfer-me`.
fn make_torrent(content: &[u8]) -> Vec<u8> {
    let mut pieces = Vec::new();
    for piece in content.chunks(PIECE_LENGTH) {
        pieces.extend_from_slice(&sha1(piece));
    }

    let mut document = Vec::new();
    document.extend_from_slice(b"d4:infod6:length");
    document.extend_from_slice(format!("i{}e", content.len()).as_bytes());
    document.extend_from_slice(b"4:name11:transfer-me12:piece length");
    document.extend_from_slice(format!("i{PIECE_LENGTH}e").as_bytes());
    document.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    document.extend_from_slice(&pieces);
    document.extend_from_slice(b"ee");
    document
}

fn config_for(root: &std::path::Path) -> Configuration {
    let mut configuration = Configuration::default();
    configuration.download_root = root.display().to_string();
    configuration.dht.enabled = false;
    configuration.network.port = 0;
    configuration
}

#[tokio::test]
async fn a_download_should_flow_from_one_engine_to_another() {
    // 3 full pieces plus a short tail.
    let content: Vec<u8> = (0..PIECE_LENGTH * 3 + 1000).map(|index| (index % 251) as u8).collect();

    let seeder_root = tempfile::tempdir().unwrap();
    let leecher_root = tempfile::tempdir().unwrap();

    let torrent_path = seeder_root.path().join("transfer-me.torrent");
    std::fs::write(&torrent_path, make_torrent(&content)).unwrap();

    // The seeder already has the content on disk.
    std::fs::write(seeder_root.path().join("transfer-me"), &content).unwrap();

    let (seeder_events, _seeder_receiver) = channel();
    let seeder = Engine::new(config_for(seeder_root.path()), seeder_events).await.unwrap();
    let info_hash = seeder
        .add_swarm(
            AddSource::TorrentFile {
                path: torrent_path.clone(),
            },
            None,
            true,
        )
        .await
        .unwrap();
    let seeder_address = seeder.spawn_listener().await.unwrap();

    // Wait for the disk check to finish.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = seeder.detailed_stats(info_hash).await.unwrap();
        if stats.state == SwarmState::Seeding {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "seeder never reached seeding");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The leecher knows the torrent and the seeder's address, nothing else.
    let (leecher_events, mut events) = channel();
    let leecher = Engine::new(config_for(leecher_root.path()), leecher_events).await.unwrap();
    leecher
        .add_swarm(AddSource::TorrentFile { path: torrent_path }, None, true)
        .await
        .unwrap();
    leecher
        .add_peers(info_hash, vec![format!("127.0.0.1:{}", seeder_address.port()).parse().unwrap()])
        .await
        .unwrap();

    // The lifecycle must pass through piece completions into `done`.
    let mut pieces_completed = 0;
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await.expect("the event channel stays open") {
                Event::PieceComplete { .. } => pieces_completed += 1,
                Event::Done { info_hash: done } => {
                    assert_eq!(done, info_hash);
                    break;
                }
                _ => (),
            }
        }
    })
    .await
    .expect("the transfer should finish in time");
    assert_eq!(pieces_completed, 4);

    // The content arrived bit-exact.
    assert_eq!(std::fs::read(leecher_root.path().join("transfer-me")).unwrap(), content);

    // And the leecher's stats agree.
    let stats = leecher.detailed_stats(info_hash).await.unwrap();
    assert_eq!(stats.state, SwarmState::Seeding);
    assert_eq!(stats.downloaded_bytes, content.len() as u64);
    assert_eq!(stats.per_file_progress, vec![content.len() as u64]);

    // The seeder served every byte.
    let seeder_stats = seeder.detailed_stats(info_hash).await.unwrap();
    assert_eq!(seeder_stats.uploaded_bytes, content.len() as u64);

    leecher.shutdown().await;
    seeder.shutdown().await;
}
