//! Session lifecycle through the registry: control routing, peer
//! notifications and rate sampling of live transfers.

use fdx_core::{
    Accountable, BufferPool, ControlHandle, ControlMessage, Direction, Error, FileSpec, SessionId,
    WriterConfig,
};
use fdx_disk::DiskWriterManager;
use fdx_integration_tests::{
    BLOCK, RecordingHandle, blocks_for, eventually, local_registry, pattern, write_source,
};
use fdx_monitor::RateEngine;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn test_pushed_file_list_is_written_and_reported() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let manager = DiskWriterManager::new(WriterConfig::default(), Arc::clone(&registry)).unwrap();
    let pool = BufferPool::new(BLOCK, 8);

    let handle = RecordingHandle::new(false);
    let session = registry.create_client_session(handle.clone()).unwrap();
    assert_eq!(session.direction(), Direction::Writer);
    assert_eq!(handle.session_id(), Some(session.id()));

    let spec = FileSpec::new("incoming.bin", 6000);
    let file_id = spec.id;
    registry
        .route_control_message(&*handle, ControlMessage::FileList(vec![spec]))
        .unwrap();
    let unit = session.file(file_id).unwrap();
    assert_eq!(unit.path(), dir.path().join("incoming.bin"));

    let data = pattern(6000);
    for block in blocks_for(&pool, &unit, &data) {
        manager.put(block, unit.partition()).unwrap();
    }
    assert!(registry.await_drain_timeout(WAIT));

    assert_eq!(std::fs::read(dir.path().join("incoming.bin")).unwrap(), data);
    assert_eq!(
        handle.sent(),
        vec![ControlMessage::FileFinished {
            file_id,
            error: None
        }]
    );
    assert_eq!(handle.closed_with().as_deref(), Some("transfer finished"));
}

#[test]
fn test_pulling_peer_makes_a_reader() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let source = write_source(dir.path(), "src.bin", &pattern(321));

    let handle = RecordingHandle::new(true);
    let session = registry.create_client_session(handle.clone()).unwrap();
    assert_eq!(session.direction(), Direction::Reader);

    let unit = session.add_file(FileSpec::local(&source)).unwrap();
    assert_eq!(unit.path(), source.as_path());
    assert_eq!(unit.size(), 321);
    assert!(unit.last_modified().is_some());
}

#[test]
fn test_peer_abort_finishes_session() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let handle = RecordingHandle::new(false);
    let session = registry.create_client_session(handle.clone()).unwrap();

    registry
        .route_control_message(
            &*handle,
            ControlMessage::Abort {
                reason: "peer cancelled".to_string(),
            },
        )
        .unwrap();

    assert!(session.is_closed());
    assert_eq!(registry.session_count(), 0);
    let (reason, cause) = registry.last_shutdown_reason();
    assert_eq!(reason.as_deref(), Some("peer cancelled"));
    assert!(matches!(cause.as_deref(), Some(Error::Aborted(_))));
    assert_eq!(handle.closed_with().as_deref(), Some("peer cancelled"));
}

#[test]
fn test_unknown_session_is_rejected() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let stray = RecordingHandle::detached(SessionId::new());

    let err = registry
        .route_control_message(&*stray, ControlMessage::KeepAlive)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSession(_)));
    assert!(err.is_protocol_violation());

    // Going down is a no-op for a session the registry does not know
    registry.notify_session_down(&*stray, None);
    let (reason, cause) = registry.last_shutdown_reason();
    assert!(reason.is_none());
    assert!(cause.is_none());
    assert!(!registry.has_had_session());
}

#[test]
fn test_failed_attach_closes_handle() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let handle = RecordingHandle::failing_attach();

    let err = registry.create_client_session(handle.clone()).unwrap_err();
    assert!(matches!(err, Error::SessionSetup(_)));
    assert!(handle.closed_with().is_some());
    assert_eq!(registry.session_count(), 0);
}

#[test]
fn test_transport_down_fails_live_session() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let handle = RecordingHandle::new(false);
    let session = registry.create_client_session(handle.clone()).unwrap();
    let unit = session.add_file(FileSpec::new("partial.bin", 4096)).unwrap();

    registry.notify_session_down(
        &*handle,
        Some(Arc::new(Error::control("connection reset"))),
    );

    assert!(session.is_closed());
    assert!(unit.is_closed());
    assert!(registry.await_drain_timeout(Duration::from_millis(10)));
    let (reason, cause) = registry.last_shutdown_reason();
    assert_eq!(reason.as_deref(), Some("control channel down"));
    assert!(cause.is_some());
}

#[test]
fn test_registry_close_finishes_every_session() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let sessions: Vec<_> = (0..3)
        .map(|port| registry.create_local_session(port).unwrap())
        .collect();

    registry.close("shutting down");

    assert!(sessions.iter().all(|s| s.is_closed()));
    assert!(matches!(
        registry.create_local_session(9),
        Err(Error::RegistryClosed)
    ));
    assert!(registry.await_drain_timeout(Duration::from_millis(10)));
}

#[test]
fn test_rate_engine_tracks_live_transfer() {
    let dir = TempDir::new().unwrap();
    let registry = local_registry(dir.path());
    let manager =
        Arc::new(DiskWriterManager::new(WriterConfig::default(), Arc::clone(&registry)).unwrap());
    let pool = BufferPool::new(BLOCK, 8);

    let session = registry.create_local_session(0).unwrap();
    let unit = session.add_file(FileSpec::new("rated.bin", 4 * 4096)).unwrap();

    let rates = RateEngine::new();
    rates.register("manager", Arc::clone(&manager) as Arc<dyn Accountable>);
    rates.register("session", Arc::clone(&session) as Arc<dyn Accountable>);
    rates.register("file", Arc::clone(&unit) as Arc<dyn Accountable>);

    rates.tick_at(0);
    for block in blocks_for(&pool, &unit, &pattern(4 * 4096)) {
        manager.put(block, unit.partition()).unwrap();
    }
    assert!(registry.await_drain_timeout(WAIT));
    assert!(eventually(WAIT, || manager.total_bytes() == 4 * 4096));

    // Two seconds later
    rates.tick_at(2_000_000_000);
    for key in ["manager", "session", "file"] {
        let snap = rates.snapshot(&key).unwrap();
        assert_eq!(snap.total_bytes, 4 * 4096, "{key}");
        assert!((snap.total_rate - 8192.0).abs() < f64::EPSILON, "{key}");
        assert!((snap.avg_total_rate - 8192.0).abs() < f64::EPSILON, "{key}");
        assert_eq!(snap.util_bytes, snap.total_bytes);
    }
}
