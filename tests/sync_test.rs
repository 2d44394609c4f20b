//! Syncer trigger tests: session deltas, watcher, warm sessions, manager cache

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::TestWorkspace;
use recall::{
    emit_session_transcript_update, MemoryIndexManager, MemorySource, SyncOptions, SyncReason,
};
use serial_test::serial;

fn forced() -> SyncOptions {
    SyncOptions {
        force: true,
        ..Default::default()
    }
}

/// A line of exactly `n` bytes including the trailing newline.
fn line_of(n: usize) -> String {
    let mut s = "x".repeat(n - 1);
    s.push('\n');
    s
}

#[tokio::test]
async fn test_session_delta_threshold() {
    let mut ws = TestWorkspace::new("delta");
    ws.settings.sync.session_delta.delta_bytes = 1024;
    ws.settings.sync.session_delta.delta_messages = 5;
    let manager = ws.manager().await;

    // 512 bytes across 2 messages: neither threshold reached.
    let path = ws.write_session("s1.jsonl", &line_of(256).repeat(2));
    assert!(!manager.check_session_delta(&path).await.unwrap());
    let (last_size, pending_bytes, pending_messages) = manager.session_delta_state(&path);
    assert_eq!(last_size, 512);
    assert_eq!(pending_bytes, 512);
    assert_eq!(pending_messages, 2);

    // Another 600 bytes: 1112 >= 1024, the byte threshold fires.
    ws.append_session("s1.jsonl", &line_of(300).repeat(2));
    assert!(manager.check_session_delta(&path).await.unwrap());
    let (last_size, pending_bytes, _) = manager.session_delta_state(&path);
    assert_eq!(last_size, 1112);
    // Counters decrement by the triggering threshold, floored at zero.
    assert_eq!(pending_bytes, 1112 - 1024);

    // Indexing the file resets the delta state entirely.
    manager.mark_session_dirty(&path);
    let report = manager
        .sync(SyncOptions {
            reason: SyncReason::SessionDelta,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.files_indexed, 1);
    assert_eq!(manager.session_delta_state(&path), (1112, 0, 0));

    manager.close().await;
}

#[tokio::test]
async fn test_session_delta_message_threshold() {
    let mut ws = TestWorkspace::new("deltamsg");
    ws.settings.sync.session_delta.delta_bytes = 1_000_000;
    ws.settings.sync.session_delta.delta_messages = 5;
    let manager = ws.manager().await;

    let path = ws.write_session("s1.jsonl", &line_of(10).repeat(4));
    assert!(!manager.check_session_delta(&path).await.unwrap());

    // Two more newlines pushes pending messages to 6 >= 5.
    ws.append_session("s1.jsonl", &line_of(10).repeat(2));
    assert!(manager.check_session_delta(&path).await.unwrap());

    manager.close().await;
}

#[tokio::test]
async fn test_session_delta_zero_byte_threshold() {
    let mut ws = TestWorkspace::new("deltazero");
    ws.settings.sync.session_delta.delta_bytes = 0;
    ws.settings.sync.session_delta.delta_messages = 1_000_000;
    let manager = ws.manager().await;

    // Any pending bytes at all trigger when the threshold is <= 0.
    let path = ws.write_session("s1.jsonl", "x\n");
    assert!(manager.check_session_delta(&path).await.unwrap());

    manager.close().await;
}

#[tokio::test]
async fn test_session_rotation_counts_new_file() {
    let mut ws = TestWorkspace::new("rotate");
    ws.settings.sync.session_delta.delta_bytes = 1_000_000;
    ws.settings.sync.session_delta.delta_messages = 1_000_000;
    let manager = ws.manager().await;

    let path = ws.write_session("s1.jsonl", &line_of(100).repeat(4));
    manager.check_session_delta(&path).await.unwrap();
    let (_, pending_before, _) = manager.session_delta_state(&path);
    assert_eq!(pending_before, 400);

    // Rotation: the file shrinks; the whole new content counts as pending.
    ws.write_session("s1.jsonl", &line_of(50).repeat(2));
    manager.check_session_delta(&path).await.unwrap();
    let (last_size, pending_bytes, pending_messages) = manager.session_delta_state(&path);
    assert_eq!(last_size, 100);
    assert_eq!(pending_bytes, 400 + 100);
    assert_eq!(pending_messages, 4 + 2);

    manager.close().await;
}

#[tokio::test]
async fn test_incremental_session_pass_only_touches_dirty_files() {
    let ws = TestWorkspace::new("dirtyonly");
    let s1 = ws.write_session("s1.jsonl", &common::transcript("rust", 3));
    ws.write_session("s2.jsonl", &common::transcript("music", 3));
    let manager = ws.manager().await;
    manager.sync(forced()).await.unwrap();

    // Grow s1 only and queue it for the incremental pass.
    ws.append_session("s1.jsonl", &common::transcript("database", 2));
    manager.mark_session_dirty(&s1);
    let report = manager
        .sync(SyncOptions {
            reason: SyncReason::SessionDelta,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.files_indexed, 1, "only the dirty session reindexed");
    assert_eq!(report.files_unchanged, 0);

    manager.close().await;
}

#[tokio::test]
async fn test_watch_reason_never_syncs_sessions() {
    let ws = TestWorkspace::new("watchgate");
    let s1 = ws.write_session("s1.jsonl", &common::transcript("rust", 3));
    ws.write_memory("a.md", "memory file\n");
    let manager = ws.manager().await;
    manager.sync(forced()).await.unwrap();

    ws.append_session("s1.jsonl", &common::transcript("rust", 2));
    manager.mark_session_dirty(&s1);
    manager.mark_dirty();

    let report = manager
        .sync(SyncOptions {
            reason: SyncReason::Watch,
            ..Default::default()
        })
        .await
        .unwrap();
    // The memory pass ran (unchanged file skipped); the session stayed queued.
    assert_eq!(report.files_indexed, 0);
    assert_eq!(report.files_unchanged, 1);

    // A session-delta sync picks it up afterwards.
    let report = manager
        .sync(SyncOptions {
            reason: SyncReason::SessionDelta,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.files_indexed, 1);

    manager.close().await;
}

#[tokio::test]
async fn test_watcher_triggers_reindex() {
    let mut ws = TestWorkspace::new("watcher");
    ws.settings.sync.watch = true;
    ws.settings.sync.watch_debounce_ms = 100;
    let manager = ws.manager().await;

    ws.write_memory("watched.md", "rust appears by magic\n");

    // Watcher event -> debounce -> settle -> sync. Poll until it lands.
    let mut indexed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if manager.status().await.unwrap().files >= 1 {
            indexed = true;
            break;
        }
    }
    assert!(indexed, "watcher never scheduled a sync");

    let store = ws.inspect_store().await;
    assert!(store.count_chunks().await.unwrap() >= 1);

    manager.close().await;
}

#[tokio::test]
async fn test_warm_session_runs_once_per_key() {
    let mut ws = TestWorkspace::new("warm");
    ws.settings.sync.on_session_start = true;
    ws.write_memory("a.md", "rust warmup\n");
    let manager = ws.manager().await;

    manager.warm_session("session-1");
    let mut warmed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if manager.status().await.unwrap().files >= 1 {
            warmed = true;
            break;
        }
    }
    assert!(warmed, "session start never warmed the index");

    // Same key again: no new sync. The file changes but stays unindexed.
    ws.write_memory("a.md", "rust warmup changed\n");
    manager.warm_session("session-1");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let store = ws.inspect_store().await;
    let chunks = store
        .chunks_for_file(
            MemorySource::Memory,
            &ws.stored_path(&ws.memory_path("a.md")),
        )
        .await
        .unwrap();
    assert!(
        chunks.iter().all(|c| !c.text.contains("changed")),
        "second warm with the same key must not sync"
    );

    manager.close().await;
}

#[tokio::test]
async fn test_session_event_bus_filters_foreign_agents() {
    let mut ws = TestWorkspace::new("busfilter");
    ws.settings.sync.session_delta.delta_bytes = 1;
    let manager = ws.manager().await;

    // An event for some other agent's transcript directory is ignored; there
    // is nothing to index afterwards.
    emit_session_transcript_update("/somewhere/else/agents/other/sessions/s9.jsonl");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.status().await.unwrap().files, 0);

    manager.close().await;
}

#[tokio::test]
#[serial]
async fn test_manager_cache_reuse_and_eviction() {
    let ws = TestWorkspace::new("cachekey");
    let factory = common::mock_factory(Arc::clone(&ws.state));

    let a = MemoryIndexManager::get(ws.scope.clone(), ws.settings.clone(), factory.clone())
        .await
        .unwrap();
    let b = MemoryIndexManager::get(ws.scope.clone(), ws.settings.clone(), factory.clone())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b), "same key returns the same manager");

    // A different settings hash gets its own manager.
    let mut other_settings = ws.settings.clone();
    other_settings.chunking.tokens = 256;
    let c = MemoryIndexManager::get(ws.scope.clone(), other_settings, factory.clone())
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    c.close().await;

    // Close evicts; the next get builds a fresh instance.
    a.close().await;
    let d = MemoryIndexManager::get(ws.scope.clone(), ws.settings.clone(), factory)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &d));
    d.close().await;
}
