mod common;

use common::capture_logs;
use flowtrace::{CheckpointManager, NewNode, ORPHAN_WARN_AFTER};
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn test_orphan_warns_once_its_wait_runs_out() {
    let (logs, _guard) = capture_logs();
    let manager = CheckpointManager::disabled();

    manager.add_node(NewNode::new("Lonely").with_id("lonely"), Some("ghost"));

    sleep(ORPHAN_WARN_AFTER - Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
    assert!(!logs.contents().contains("still waiting"));

    sleep(Duration::from_millis(2)).await;
    tokio::task::yield_now().await;
    let output = logs.contents();
    assert!(output.contains("still waiting"), "no warning in: {}", output);
    assert!(output.contains("lonely"));
    assert!(output.contains("ghost"));
    assert!(output.contains("Lonely"));
    assert!(!manager.is_tree_complete());
}

#[tokio::test(start_paused = true)]
async fn test_no_warning_when_parent_arrives_in_time() {
    let (logs, _guard) = capture_logs();
    let manager = CheckpointManager::disabled();

    manager.add_node(NewNode::new("Child").with_id("child"), Some("parent"));
    sleep(Duration::from_secs(1)).await;
    manager.add_node(NewNode::new("Parent").with_id("parent"), None);

    sleep(ORPHAN_WARN_AFTER * 2).await;
    tokio::task::yield_now().await;
    assert!(logs.contents().is_empty(), "unexpected logs: {}", logs.contents());
    assert!(manager.is_tree_complete());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_manager_silences_pending_timer() {
    let (logs, _guard) = capture_logs();
    let manager = CheckpointManager::disabled();
    manager.add_node(NewNode::new("Child").with_id("child"), Some("parent"));
    drop(manager);

    sleep(ORPHAN_WARN_AFTER * 2).await;
    tokio::task::yield_now().await;
    assert!(!logs.contents().contains("still waiting"));
}
