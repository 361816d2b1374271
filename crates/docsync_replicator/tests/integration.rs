//! End-to-end replicator sessions against the mock engine.

use docsync_core::{
    Database, DatabaseConfig, Document, DocumentFlags, ErrorInfo, ManualScheduler, MemoryStore,
    Properties, RevisionFlags, TaskScheduler, DEFAULT_COLLECTION,
};
use docsync_replicator::{
    ActivityLevel, ConflictResolverFn, DocumentEnded, EngineActivityLevel, EngineStatus, Endpoint,
    MockEngine, MockReplicator, ProgressLevel, ReplicatedDocument, Replicator,
    ReplicatorConfiguration, ReplicatorStatus, ReplicatorType,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manual_db(name: &str) -> (Database, Arc<ManualScheduler>) {
    init_tracing();
    let scheduler = Arc::new(ManualScheduler::new());
    let db = Database::open_with(
        name,
        Arc::new(MemoryStore::new()),
        Arc::clone(&scheduler) as Arc<dyn TaskScheduler>,
        DatabaseConfig::default().close_timeout(Duration::from_millis(200)),
    )
    .unwrap();
    (db, scheduler)
}

fn endpoint() -> Endpoint {
    Endpoint::url("wss://sync.example.com:4984/db").unwrap()
}

fn build(config: ReplicatorConfiguration) -> (MockEngine, Replicator, Arc<MockReplicator>) {
    let engine = MockEngine::new();
    let replicator = Replicator::new(config, &engine).unwrap();
    let mock = engine.last().unwrap();
    (engine, replicator, mock)
}

fn record_statuses(replicator: &Replicator) -> Arc<Mutex<Vec<ReplicatorStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    replicator.add_change_listener(Arc::new(move |status: &ReplicatorStatus| {
        s.lock().push(status.clone());
    }));
    seen
}

fn record_documents(replicator: &Replicator) -> Arc<Mutex<Vec<(bool, Vec<ReplicatedDocument>)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    replicator.add_document_listener(Arc::new(move |pushing: bool, docs: &[ReplicatedDocument]| {
        s.lock().push((pushing, docs.to_vec()));
    }));
    seen
}

fn activities(seen: &Mutex<Vec<ReplicatorStatus>>) -> Vec<ActivityLevel> {
    seen.lock().iter().map(|s| s.activity).collect()
}

fn body(side: &str) -> Properties {
    let mut props = Properties::new();
    props.insert("side".into(), json!(side));
    props
}

#[test]
fn one_shot_push_reports_three_statuses_then_releases_itself() {
    let (db, _scheduler) = manual_db("lifecycle");
    let config = ReplicatorConfiguration::new(&db, endpoint())
        .with_replicator_type(ReplicatorType::Push)
        .with_continuous(false);
    let (_engine, replicator, mock) = build(config);
    let seen = record_statuses(&replicator);

    replicator.start(false);
    assert_eq!(db.running_count(), 1);

    mock.emit_status(EngineStatus::new(EngineActivityLevel::Busy).with_progress(0, 10));
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Busy).with_progress(10, 10));
    assert_eq!(db.running_count(), 1);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Stopped));

    let statuses = seen.lock().clone();
    assert_eq!(statuses.len(), 3);
    assert_eq!(statuses[0].activity, ActivityLevel::Busy);
    assert_eq!(statuses[0].progress.complete, 0.0);
    assert_eq!(statuses[1].activity, ActivityLevel::Busy);
    assert!((statuses[1].progress.complete - 1.0).abs() < f32::EPSILON);
    assert_eq!(statuses[2].activity, ActivityLevel::Stopped);
    assert!(statuses[2].error.is_none());
    assert_eq!(db.running_count(), 0);

    drop(replicator);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Busy));
    assert_eq!(seen.lock().len(), 3);
}

#[test]
fn running_replicator_outlives_its_handle() {
    let (db, _scheduler) = manual_db("keepalive");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    let seen = record_statuses(&replicator);
    replicator.start(false);
    drop(replicator);

    mock.emit_status(EngineStatus::new(EngineActivityLevel::Idle));
    assert_eq!(activities(&seen), vec![ActivityLevel::Idle]);

    mock.emit_status(EngineStatus::new(EngineActivityLevel::Stopped));
    assert_eq!(db.running_count(), 0);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Busy));
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn closing_database_stops_running_replicators() {
    let (db, _scheduler) = manual_db("close");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    let seen = record_statuses(&replicator);
    replicator.start(false);

    db.close().unwrap();
    assert!(db.is_closed());
    assert_eq!(mock.stop_count(), 1);
    assert_eq!(activities(&seen), vec![ActivityLevel::Stopped]);
}

#[test]
fn close_times_out_when_engine_never_stops() {
    let (db, _scheduler) = manual_db("stuck");
    let engine = MockEngine::without_auto_stop();
    let replicator = Replicator::new(ReplicatorConfiguration::new(&db, endpoint()), &engine).unwrap();
    replicator.start(false);

    assert!(db.close().is_err());
    assert!(!db.is_closed());
    assert_eq!(db.running_count(), 1);

    engine.last().unwrap().emit_status(EngineStatus::new(EngineActivityLevel::Stopped));
    db.close().unwrap();
}

#[test]
fn start_on_closed_database_is_ignored() {
    let (db, _scheduler) = manual_db("closed");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    db.close().unwrap();

    replicator.start(false);
    assert!(mock.starts().is_empty());
    assert_eq!(db.running_count(), 0);
}

#[test]
fn restart_after_stop_registers_again() {
    let (db, _scheduler) = manual_db("restart");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    replicator.start(false);
    replicator.stop();
    assert_eq!(db.running_count(), 0);

    replicator.start(true);
    assert_eq!(mock.starts(), vec![false, true]);
    assert_eq!(db.running_count(), 1);
}

#[test]
fn pulled_conflicts_are_resolved_in_the_background() {
    let (db, scheduler) = manual_db("conflicts");
    let coll = db.default_collection();
    let mut doc = Document::with_properties("a", body("local"));
    coll.save_document(&mut doc).unwrap();
    db.store()
        .insert_conflicting_revision(DEFAULT_COLLECTION, "a", "2-remote", body("remote"), false)
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let take_remote: Arc<ConflictResolverFn> = Arc::new(
        move |_: &str, _: Option<Arc<Document>>, remote: Option<Arc<Document>>| {
            c.fetch_add(1, Ordering::SeqCst);
            remote
        },
    );
    let config = ReplicatorConfiguration::new(&db, endpoint())
        .with_replicator_type(ReplicatorType::Pull)
        .with_conflict_resolver(take_remote);
    let (_engine, replicator, mock) = build(config);
    let statuses = record_statuses(&replicator);
    let documents = record_documents(&replicator);

    replicator.start(false);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Idle));
    mock.emit_documents_ended(
        false,
        &[
            DocumentEnded::new(DEFAULT_COLLECTION, "a", "2-remote", RevisionFlags::CONFLICT),
            DocumentEnded::new(DEFAULT_COLLECTION, "b", "1-b", RevisionFlags::DELETED),
        ],
    );

    // The conflicted document is held back until it is resolved.
    assert_eq!(replicator.active_conflict_resolvers(), 1);
    assert_eq!(replicator.status().activity, ActivityLevel::Busy);
    assert_eq!(activities(&statuses), vec![ActivityLevel::Idle, ActivityLevel::Busy]);
    {
        let docs = documents.lock();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].1.len(), 1);
        assert_eq!(docs[0].1[0].id, "b");
        assert!(docs[0].1[0].flags.contains(DocumentFlags::DELETED));
    }

    assert_eq!(scheduler.run_pending(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(replicator.active_conflict_resolvers(), 0);
    assert_eq!(replicator.status().activity, ActivityLevel::Idle);
    assert_eq!(
        activities(&statuses),
        vec![ActivityLevel::Idle, ActivityLevel::Busy, ActivityLevel::Idle]
    );

    let docs = documents.lock();
    assert_eq!(docs.len(), 2);
    assert!(!docs[1].0);
    assert_eq!(docs[1].1[0].id, "a");
    assert!(docs[1].1[0].error.is_none());
    let resolved = coll.get_document("a").unwrap().unwrap();
    assert_eq!(resolved.get("side"), Some(&json!("remote")));
    assert!(db.store().conflicting_revisions(DEFAULT_COLLECTION, "a").unwrap().is_empty());
}

#[test]
fn resolution_attempts_follow_configuration() {
    let (db, scheduler) = manual_db("attempts");
    let coll = db.default_collection();
    let mut doc = Document::with_properties("a", body("local"));
    coll.save_document(&mut doc).unwrap();
    db.store()
        .insert_conflicting_revision(DEFAULT_COLLECTION, "a", "2-remote", body("remote"), false)
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let writer = coll.clone();
    let racing: Arc<ConflictResolverFn> = Arc::new(
        move |id: &str, local: Option<Arc<Document>>, _: Option<Arc<Document>>| {
            c.fetch_add(1, Ordering::SeqCst);
            let mut current = writer.get_document(id).unwrap().unwrap();
            current.set("touched", true);
            writer.save_document(&mut current).unwrap();
            local
        },
    );
    let config = ReplicatorConfiguration::new(&db, endpoint())
        .with_conflict_resolver(racing)
        .with_max_resolution_attempts(3);
    let (_engine, replicator, mock) = build(config);
    let documents = record_documents(&replicator);
    replicator.start(false);

    mock.emit_documents_ended(
        false,
        &[DocumentEnded::new(DEFAULT_COLLECTION, "a", "2-remote", RevisionFlags::CONFLICT)],
    );
    scheduler.run_pending();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let docs = documents.lock();
    let error = docs[0].1[0].error.clone().unwrap();
    assert!(error.is_conflict());
    assert_eq!(replicator.active_conflict_resolvers(), 0);
}

#[test]
fn pushed_conflicts_are_reported_not_resolved() {
    let (db, scheduler) = manual_db("pushed");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    let documents = record_documents(&replicator);
    replicator.start(false);

    mock.emit_documents_ended(
        true,
        &[DocumentEnded::new(DEFAULT_COLLECTION, "a", "3-a", RevisionFlags::CONFLICT)
            .with_error(ErrorInfo::conflict("rejected by remote"))],
    );
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(replicator.active_conflict_resolvers(), 0);
    let docs = documents.lock();
    assert!(docs[0].0);
    assert!(docs[0].1[0].error.as_ref().unwrap().is_conflict());
}

#[test]
fn resolving_while_offline_reports_offline() {
    let (db, scheduler) = manual_db("offline");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    let statuses = record_statuses(&replicator);
    replicator.start(false);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Offline));

    mock.emit_documents_ended(
        false,
        &[DocumentEnded::new(DEFAULT_COLLECTION, "gone", "2-x", RevisionFlags::CONFLICT)],
    );
    assert_eq!(replicator.status().activity, ActivityLevel::Offline);
    scheduler.run_pending();
    assert_eq!(activities(&statuses), vec![ActivityLevel::Offline]);
}

#[test]
fn progress_level_follows_document_listeners() {
    let (db, _scheduler) = manual_db("progress");
    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    assert_eq!(mock.progress_level(), ProgressLevel::Overall);

    let token = replicator.add_document_listener(Arc::new(|_: bool, _: &[ReplicatedDocument]| {}));
    assert_eq!(mock.progress_level(), ProgressLevel::PerDocument);
    replicator.add_document_listener(Arc::new(|_: bool, _: &[ReplicatedDocument]| {}))
        .remove();
    assert_eq!(mock.progress_level_history(), vec![ProgressLevel::PerDocument]);

    token.remove();
    replicator.start(false);
    mock.emit_documents_ended(
        true,
        &[DocumentEnded::new(DEFAULT_COLLECTION, "a", "1-a", RevisionFlags::NONE)],
    );
    assert_eq!(mock.progress_level(), ProgressLevel::Overall);
    assert_eq!(
        mock.progress_level_history(),
        vec![ProgressLevel::PerDocument, ProgressLevel::Overall]
    );
}

#[test]
fn buffered_notifications_wait_for_the_application() {
    let (db, _scheduler) = manual_db("buffered");
    let ready = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ready);
    db.buffer_notifications(Arc::new(move || {
        r.fetch_add(1, Ordering::SeqCst);
    }));

    let (_engine, replicator, mock) = build(ReplicatorConfiguration::new(&db, endpoint()));
    let seen = record_statuses(&replicator);
    replicator.start(false);
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Connecting));
    mock.emit_status(EngineStatus::new(EngineActivityLevel::Idle));

    assert!(seen.lock().is_empty());
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    db.send_notifications();
    assert_eq!(
        activities(&seen),
        vec![ActivityLevel::Connecting, ActivityLevel::Idle]
    );
}

#[test]
fn local_database_endpoints() {
    let (db, _scheduler) = manual_db("rejected");
    let other = Database::open_in_memory("other").unwrap();
    let config = ReplicatorConfiguration::new(&db, Endpoint::Database(db.clone()));
    let engine = MockEngine::new();
    assert!(Replicator::new(config, &engine).is_err());

    assert!(engine.replicators().is_empty());

    let address = format!("db:{}", other.uuid());
    let config = ReplicatorConfiguration::new(&db, Endpoint::Database(other));
    let replicator = Replicator::new(config, &engine).unwrap();
    assert_eq!(engine.last().unwrap().endpoint_address(), address);
    drop(replicator);
}
