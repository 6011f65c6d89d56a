//! End-to-end coverage across the repository/chunk-store/builder/restorer
//! seam: the scenarios the original Go test suite exercised per-package
//! (`snapshot_test.go`'s unknown-snapshot lookup, `volume_test.go`'s
//! unknown-volume lookup, `storage_local.go`'s dedup-by-idempotent-store)
//! driven here end-to-end through a real [`LocalBackend`] instead of a bare
//! model-layer unit test.

use knoxite::backend::LocalBackend;
use knoxite::builder::{BuilderConfig, SnapshotBuilder};
use knoxite::chunk_store::{ChunkStore, ChunkStoreConfig, ChunkStoreError};
use knoxite::repository::{Repository, RepositoryError};
use knoxite::restorer::{RestorerConfig, RestorerError, SnapshotRestorer};
use knoxite_core::envelope::EnvelopeError;
use knoxite_core::model::Volume;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

async fn open_repo(root: &std::path::Path, password: &[u8]) -> Repository<LocalBackend> {
    let backend = LocalBackend::new(root);
    Repository::new(backend, password).await.unwrap()
}

#[tokio::test]
async fn single_file_round_trips_through_local_backend() {
    let repo_root = tempdir().unwrap();
    let source = tempdir().unwrap();
    let original = b"the quick brown fox jumps over the lazy dog";
    fs::write(source.path().join("fox.txt"), original).unwrap();

    let mut repo = open_repo(repo_root.path(), b"hunter2").await;
    let store = ChunkStore::new(
        repo.backend().clone(),
        repo.key().clone(),
        repo.envelope(),
        ChunkStoreConfig::default(),
    );

    let builder = SnapshotBuilder::new(store.clone());
    let (mut rx, handle) = builder.add(
        source.path().to_path_buf(),
        vec![PathBuf::from("fox.txt")],
        "fox snapshot".into(),
        BuilderConfig::default(),
    );
    while rx.recv().await.is_some() {}
    let snapshot = handle.await.unwrap().unwrap();

    let mut volume = Volume::new("vol1".into(), "default".into(), "".into());
    volume.add_snapshot(snapshot.id.clone()).unwrap();
    repo.add_volume(volume);
    repo.save_snapshot(&snapshot).await.unwrap();
    repo.save().await.unwrap();

    let target = tempdir().unwrap();
    let restorer = SnapshotRestorer::new(store);
    let (mut rx, handle) = restorer.decode_snapshot(snapshot, target.path().to_path_buf(), RestorerConfig::default());
    while rx.recv().await.is_some() {}
    handle.await.unwrap().unwrap();

    let restored = fs::read(target.path().join("fox.txt")).unwrap();
    assert_eq!(sha256_hex(&restored), sha256_hex(original));
}

#[tokio::test]
async fn unknown_snapshot_prefix_is_rejected() {
    let repo_root = tempdir().unwrap();
    let repo = open_repo(repo_root.path(), b"pw").await;
    let err = repo.find_snapshot("deadbeef").await.unwrap_err();
    assert!(matches!(err, RepositoryError::SnapshotNotFound(_)));
}

#[tokio::test]
async fn unknown_volume_is_rejected() {
    let repo_root = tempdir().unwrap();
    let repo = open_repo(repo_root.path(), b"pw").await;
    let err = repo.find_volume("no-such-volume").unwrap_err();
    assert!(matches!(err, RepositoryError::VolumeNotFound(_)));
}

#[tokio::test]
async fn duplicate_content_is_stored_once_on_disk() {
    let repo_root = tempdir().unwrap();
    let source = tempdir().unwrap();
    let payload = vec![0x42_u8; 8192];
    fs::write(source.path().join("a.bin"), &payload).unwrap();
    fs::write(source.path().join("b.bin"), &payload).unwrap();

    let repo = open_repo(repo_root.path(), b"pw").await;
    let store = ChunkStore::new(
        repo.backend().clone(),
        repo.key().clone(),
        repo.envelope(),
        ChunkStoreConfig::default(),
    );
    let builder = SnapshotBuilder::new(store.clone());
    let (mut rx, handle) = builder.add(
        source.path().to_path_buf(),
        vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")],
        "dedup snapshot".into(),
        BuilderConfig::default(),
    );
    while rx.recv().await.is_some() {}
    let snapshot = handle.await.unwrap().unwrap();

    let a = &snapshot.items.iter().find(|i| i.path == "a.bin").unwrap().chunks;
    let b = &snapshot.items.iter().find(|i| i.path == "b.bin").unwrap().chunks;
    assert_eq!(a.len(), b.len());
    assert_eq!(a[0].sha_sum, b[0].sha_sum);

    let chunk_files: Vec<_> = fs::read_dir(repo_root.path().join("chunks")).unwrap().collect();
    assert_eq!(chunk_files.len(), 1, "identical content must be stored exactly once");
    assert!(store.dedup_hits() >= 1);
}

#[tokio::test]
async fn tampered_chunk_aborts_restore_without_oversized_partial() {
    let repo_root = tempdir().unwrap();
    let source = tempdir().unwrap();
    fs::write(source.path().join("secret.txt"), b"do not tamper with me").unwrap();

    let repo = open_repo(repo_root.path(), b"pw").await;
    let store = ChunkStore::new(
        repo.backend().clone(),
        repo.key().clone(),
        repo.envelope(),
        ChunkStoreConfig::default(),
    );
    let builder = SnapshotBuilder::new(store.clone());
    let (mut rx, handle) = builder.add(
        source.path().to_path_buf(),
        vec![PathBuf::from("secret.txt")],
        "tamper snapshot".into(),
        BuilderConfig::default(),
    );
    while rx.recv().await.is_some() {}
    let snapshot = handle.await.unwrap().unwrap();

    let chunk_ref = &snapshot.items[0].chunks[0];
    let chunk_path = repo_root.path().join("chunks").join(chunk_ref.storage_filename());
    let mut bytes = fs::read(&chunk_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&chunk_path, &bytes).unwrap();

    let target = tempdir().unwrap();
    let restorer = SnapshotRestorer::new(store);
    let (mut rx, handle) = restorer.decode_snapshot(snapshot.clone(), target.path().to_path_buf(), RestorerConfig::default());
    while rx.recv().await.is_some() {}

    // A flipped bit fails the AEAD tag check before the sha256 fingerprint is
    // ever computed, so this aborts the whole restore rather than recovering
    // per-file the way a `ChunkCorrupt` fingerprint mismatch does.
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RestorerError::ChunkStore(ChunkStoreError::Envelope(EnvelopeError::IntegrityFailure))
    ));

    let partial = target.path().join("secret.txt.partial");
    let original_len = snapshot.items[0].size;
    if partial.exists() {
        let partial_len = fs::metadata(&partial).unwrap().len();
        assert!(partial_len <= original_len, "partial output must not exceed the original size");
    }
}

#[tokio::test]
async fn wrong_password_is_rejected_on_open() {
    let repo_root = tempdir().unwrap();
    {
        let backend = LocalBackend::new(repo_root.path());
        Repository::new(backend, b"correct horse battery staple").await.unwrap();
    }

    let backend = LocalBackend::new(repo_root.path());
    let err = Repository::open(backend, b"wrong password").await.unwrap_err();
    assert!(matches!(err, RepositoryError::WrongPassword));
}

#[tokio::test]
async fn repository_cannot_be_initialized_twice_at_same_location() {
    let repo_root = tempdir().unwrap();
    let backend = LocalBackend::new(repo_root.path());
    Repository::new(backend.clone(), b"pw").await.unwrap();
    let err = Repository::new(backend, b"pw").await.unwrap_err();
    assert!(matches!(err, RepositoryError::RepositoryExists));
}
