//! Content manifest paging and missing file downloads during join.

use std::sync::Arc;

use kart_netsync::files::TransferError;
use kart_netsync::{
    ContentManifest, ContentStore, FileEntry, FileTransferConfig, GoneReason, JoinState,
    MemoryContentStore, SessionEvent,
};
use parking_lot::Mutex;

use crate::common::{host_builder, racer_builder, Match, MAX_JOIN_STEPS};

/// A store the test keeps a handle to after the session takes ownership.
#[derive(Clone, Default)]
struct SharedStore(Arc<Mutex<MemoryContentStore>>);

impl SharedStore {
    fn with(files: &[(&str, &[u8])]) -> Self {
        let store = Self::default();
        for (name, data) in files {
            store.0.lock().insert(*name, data.to_vec());
        }
        store
    }

    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.0.lock().read(name).ok()
    }
}

impl ContentStore for SharedStore {
    fn read(&self, name: &str) -> Result<Vec<u8>, TransferError> {
        self.0.lock().read(name)
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), TransferError> {
        self.0.lock().write(name, data)
    }
}

fn track_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn downloaded(events: &[SessionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::FileDownloaded { name } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn missing_track_is_downloaded_before_joining() {
    let track = track_bytes(7, 5_000);
    let music = track_bytes(3, 700);
    let manifest = ContentManifest::new(vec![
        FileEntry::describe("tracks/sunset.kart", &track),
        FileEntry::describe("music/sunset.ogg", &music),
    ]);
    let server_store = SharedStore::with(&[
        ("tracks/sunset.kart", track.as_slice()),
        ("music/sunset.ogg", music.as_slice()),
    ]);
    let client_store = SharedStore::with(&[("music/sunset.ogg", music.as_slice())]);

    let mut game = Match::custom(
        host_builder()
            .with_manifest(manifest.clone())
            .with_content_store(server_store),
        vec![(racer_builder(0).with_content_store(client_store.clone()), 1)],
    );
    game.join_all();

    assert_eq!(downloaded(&game.clients[0].events), vec!["tracks/sunset.kart".to_owned()]);
    assert_eq!(client_store.get("tracks/sunset.kart"), Some(track));
    assert_eq!(game.clients[0].session.manifest(), &manifest);
    let states: Vec<JoinState> = game.clients[0]
        .events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::JoinStateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert!(states.contains(&JoinState::DownloadingFiles));
}

#[test]
fn complete_content_joins_without_downloads() {
    let track = track_bytes(1, 2_000);
    let manifest = ContentManifest::new(vec![FileEntry::describe("tracks/harbor.kart", &track)]);
    let server_store = SharedStore::with(&[("tracks/harbor.kart", track.as_slice())]);
    let client_store = SharedStore::with(&[("tracks/harbor.kart", track.as_slice())]);

    let mut game = Match::custom(
        host_builder()
            .with_manifest(manifest)
            .with_content_store(server_store),
        vec![(racer_builder(0).with_content_store(client_store), 1)],
    );
    game.join_all();
    assert!(downloaded(&game.clients[0].events).is_empty());
}

#[test]
fn stale_local_copy_is_replaced() {
    let track = track_bytes(9, 3_000);
    let stale = track_bytes(10, 3_000);
    let manifest = ContentManifest::new(vec![FileEntry::describe("tracks/canyon.kart", &track)]);
    let server_store = SharedStore::with(&[("tracks/canyon.kart", track.as_slice())]);
    let client_store = SharedStore::with(&[("tracks/canyon.kart", stale.as_slice())]);

    let mut game = Match::custom(
        host_builder()
            .with_manifest(manifest)
            .with_content_store(server_store),
        vec![(racer_builder(0).with_content_store(client_store.clone()), 1)],
    );
    game.join_all();
    assert_eq!(client_store.get("tracks/canyon.kart"), Some(track));
}

#[test]
fn long_manifest_is_paged() {
    let files: Vec<(String, Vec<u8>)> = (0..70)
        .map(|i| (format!("addons/kart_{:03}.pk3", i), track_bytes(i as u8, 64)))
        .collect();
    let manifest: ContentManifest = files
        .iter()
        .map(|(name, data)| FileEntry::describe(name.clone(), data))
        .collect();
    let server_store = SharedStore::default();
    let client_store = SharedStore::default();
    for (name, data) in &files {
        server_store.0.lock().insert(name.clone(), data.clone());
        client_store.0.lock().insert(name.clone(), data.clone());
    }

    let mut game = Match::custom(
        host_builder()
            .with_manifest(manifest.clone())
            .with_content_store(server_store),
        vec![(racer_builder(0).with_content_store(client_store), 1)],
    );
    game.join_all();
    assert_eq!(game.clients[0].session.manifest().len(), 70);
    assert_eq!(game.clients[0].session.manifest(), &manifest);
}

#[test]
fn unservable_file_refuses_the_join() {
    let track = track_bytes(4, 1_000);
    let manifest = ContentManifest::new(vec![FileEntry::describe("tracks/secret.kart", &track)]);

    let mut game = Match::custom(
        host_builder().with_manifest(manifest),
        vec![(racer_builder(0).with_content_store(SharedStore::default()), 1)],
    );
    assert!(game.run_until(MAX_JOIN_STEPS, |m| m.clients[0].session.state().is_gone()));
    assert!(matches!(
        game.clients[0].session.state(),
        JoinState::Gone(GoneReason::Refused(_)) | JoinState::Gone(GoneReason::TransferFailed)
    ));
}

#[test]
fn file_above_the_size_limit_is_never_downloaded() {
    let track = track_bytes(5, 5_000);
    let manifest = ContentManifest::new(vec![FileEntry::describe("tracks/mountain.kart", &track)]);
    let server_store = SharedStore::with(&[("tracks/mountain.kart", track.as_slice())]);
    let client_store = SharedStore::default();
    let limited = FileTransferConfig {
        max_file_size: 2_000,
        ..FileTransferConfig::default()
    };

    let mut game = Match::custom(
        host_builder()
            .with_manifest(manifest)
            .with_content_store(server_store),
        vec![(
            racer_builder(0)
                .with_content_store(client_store.clone())
                .with_file_transfer_config(limited),
            1,
        )],
    );
    assert!(game.run_until(MAX_JOIN_STEPS, |m| m.clients[0].session.state().is_gone()));
    assert_eq!(
        game.clients[0].session.state(),
        JoinState::Gone(GoneReason::TransferFailed)
    );
    assert!(client_store.get("tracks/mountain.kart").is_none());
    assert!(downloaded(&game.clients[0].events).is_empty());
}
