//! Integration tests for the concrete snapshot scenarios.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bdsnap_engine::prelude::*;
use bdsnap_engine::devices::classify_path;
use bdsnap_engine::journal::HEADER_SIZE;
use bdsnap_engine::mount::{MountEvent, MountObserver};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn engine_with_root(root: &Path) -> (Arc<Engine>, tokio::sync::mpsc::UnboundedSender<MountEvent>) {
    let mut cfg = EngineConfig::default();
    cfg.snapshot_root = root.to_path_buf();
    let engine = Arc::new(Engine::new(cfg));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let observer = MountObserver::new(engine.clone());
    tokio::spawn(observer.run(rx));
    (engine, tx)
}

/// Parse every `(blknr, payload)` record out of a raw snapblocks file.
fn read_records(path: &Path) -> Vec<(u64, Vec<u8>)> {
    let bytes = std::fs::read(path).unwrap();
    let mut out = Vec::new();
    let mut off = 0usize;
    while off + HEADER_SIZE <= bytes.len() {
        let mut hdr_buf = [0u8; HEADER_SIZE];
        hdr_buf.copy_from_slice(&bytes[off..off + HEADER_SIZE]);
        let hdr = bdsnap_engine::journal::SnapblockHeader::from_bytes(&hdr_buf).unwrap();
        let payload_start = off + hdr.payload_off as usize;
        let payload_end = payload_start + hdr.payload_size as usize;
        out.push((hdr.blknr, bytes[payload_start..payload_end].to_vec()));
        off = payload_start + hdr.payload_size as usize;
    }
    out
}

fn snapblocks_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<_> = std::fs::read_dir(root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

#[tokio::test]
async fn s1_baseline_capture() {
    let root = tempfile::tempdir().unwrap();
    let img = tempfile::NamedTempFile::new().unwrap();
    let (engine, tx) = engine_with_root(root.path());

    let key = engine.register(img.path()).unwrap();
    tx.send(MountEvent::Mounted(img.path().to_path_buf())).unwrap();
    settle().await;

    let handle = engine.search(&key).expect("device should be mountable");
    let data: Box<[u8]> = b"AAAA".to_vec().into_boxed_slice();
    assert!(engine.enqueue(handle, 7, 4, data));
    settle().await;

    tx.send(MountEvent::Unmounted(img.path().to_path_buf())).unwrap();
    settle().await;

    let dirs = snapblocks_dirs(root.path());
    assert_eq!(dirs.len(), 1);
    let records = read_records(&dirs[0].join("snapblocks"));
    assert_eq!(records, vec![(7, b"AAAA".to_vec())]);
}

#[tokio::test]
async fn s2_hot_dedup() {
    let root = tempfile::tempdir().unwrap();
    let img = tempfile::NamedTempFile::new().unwrap();
    let (engine, tx) = engine_with_root(root.path());

    let key = engine.register(img.path()).unwrap();
    tx.send(MountEvent::Mounted(img.path().to_path_buf())).unwrap();
    settle().await;

    for payload in [&b"AAAA"[..], b"BBBB", b"BBBB"] {
        let handle = engine.search(&key).unwrap();
        let data: Box<[u8]> = payload.to_vec().into_boxed_slice();
        engine.enqueue(handle, 7, 4, data);
        settle().await;
    }

    tx.send(MountEvent::Unmounted(img.path().to_path_buf())).unwrap();
    settle().await;

    let dirs = snapblocks_dirs(root.path());
    let records = read_records(&dirs[0].join("snapblocks"));
    assert_eq!(records, vec![(7, b"AAAA".to_vec())]);
}

#[tokio::test]
async fn s3_cross_epoch_recapture() {
    let root = tempfile::tempdir().unwrap();
    let img = tempfile::NamedTempFile::new().unwrap();
    let (engine, tx) = engine_with_root(root.path());

    let key = engine.register(img.path()).unwrap();

    tx.send(MountEvent::Mounted(img.path().to_path_buf())).unwrap();
    settle().await;
    let handle = engine.search(&key).unwrap();
    engine.enqueue(handle, 7, 4, b"AAAA".to_vec().into_boxed_slice());
    settle().await;
    tx.send(MountEvent::Unmounted(img.path().to_path_buf())).unwrap();
    settle().await;

    // distinct epoch: wait a full second so the formatted timestamp differs
    tokio::time::sleep(Duration::from_secs(1)).await;

    tx.send(MountEvent::Mounted(img.path().to_path_buf())).unwrap();
    settle().await;
    let handle = engine.search(&key).unwrap();
    engine.enqueue(handle, 7, 4, b"CCCC".to_vec().into_boxed_slice());
    settle().await;
    tx.send(MountEvent::Unmounted(img.path().to_path_buf())).unwrap();
    settle().await;

    let dirs = snapblocks_dirs(root.path());
    assert_eq!(dirs.len(), 2);
    let first = read_records(&dirs[0].join("snapblocks"));
    let second = read_records(&dirs[1].join("snapblocks"));
    assert_eq!(first, vec![(7, b"AAAA".to_vec())]);
    assert_eq!(second, vec![(7, b"CCCC".to_vec())]);
}

#[tokio::test]
async fn s4_shutdown_ordering() {
    let root = tempfile::tempdir().unwrap();
    let img = tempfile::NamedTempFile::new().unwrap();
    let (engine, tx) = engine_with_root(root.path());

    let key = engine.register(img.path()).unwrap();
    tx.send(MountEvent::Mounted(img.path().to_path_buf())).unwrap();
    settle().await;

    for blknr in 1..=1000u64 {
        if let Some(handle) = engine.search(&key) {
            engine.enqueue(handle, blknr, 1, vec![b'x'].into_boxed_slice());
        }
    }
    engine.unregister(&key).unwrap();
    settle().await;

    // device is gone from the registry; no dangling state to query
    assert!(!engine.test(&key));

    let dirs = snapblocks_dirs(root.path());
    assert_eq!(dirs.len(), 1);
    let records = read_records(&dirs[0].join("snapblocks"));
    // every record that was written is in enqueue order and fully formed
    for (i, (blknr, payload)) in records.iter().enumerate() {
        assert_eq!(*blknr, (i as u64) + 1);
        assert_eq!(payload, &vec![b'x']);
    }
}

#[tokio::test]
async fn s5_auth_reject() {
    let root = tempfile::tempdir().unwrap();
    let img = tempfile::NamedTempFile::new().unwrap();
    let mut cfg = EngineConfig::default();
    cfg.snapshot_root = root.path().to_path_buf();
    let engine = Engine::new(cfg);

    let auth = LiteralAuthenticator::new(zeroize::Zeroizing::new("correct-password".to_string()));

    let mut payload = Vec::new();
    payload.extend_from_slice(img.path().to_string_lossy().as_bytes());
    payload.push(b'\r');
    payload.extend_from_slice(b"wrong-password");
    payload.push(0);

    let err = bdsnap_engine::activation::activate(&engine, &payload, &auth, &AlwaysAdmin).unwrap_err();
    assert!(matches!(err, Error::AccessDenied));

    let key = classify_path(img.path()).unwrap();
    assert!(!engine.test(&key));
    assert!(!root.path().join("snapshot").exists());
}

#[tokio::test]
async fn s6_conflict_continues_operating_other_devices() {
    let root = tempfile::tempdir().unwrap();
    // pre-create the snapshot root itself as a regular file
    let fake_root = root.path().join("snapshot_root_as_file");
    std::fs::write(&fake_root, b"not a directory").unwrap();

    let mut cfg = EngineConfig::default();
    cfg.snapshot_root = fake_root.clone();
    let engine = Arc::new(Engine::new(cfg));
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let observer = MountObserver::new(engine.clone());
    tokio::spawn(observer.run(rx));

    let broken = tempfile::NamedTempFile::new().unwrap();
    let other = tempfile::NamedTempFile::new().unwrap();

    let broken_key = engine.register(broken.path()).unwrap();
    let other_key = engine.register(other.path()).unwrap();

    tx.send(MountEvent::Mounted(broken.path().to_path_buf())).unwrap();
    tx.send(MountEvent::Mounted(other.path().to_path_buf())).unwrap();
    settle().await;

    let handle = engine.search(&broken_key).unwrap();
    engine.enqueue(handle, 1, 4, b"AAAA".to_vec().into_boxed_slice());
    settle().await;

    // the broken device's job failed with a conflict and was swallowed;
    // the engine itself, and other devices, keep working.
    assert!(engine.test(&other_key));
    let handle = engine.search(&other_key).unwrap();
    assert!(engine.enqueue(handle, 1, 4, b"BBBB".to_vec().into_boxed_slice()));
}
