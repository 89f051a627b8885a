mod common;

use common::RecordingStore;
use flowtrace::{
    decode_raw_execution, run_component, run_workflow, CheckpointConfig, CheckpointManager,
    ComponentOpts, ExecutionNode, NewNode, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn completed(id: &str, parent: Option<&str>, seq: u64, output: &str) -> ExecutionNode {
    let node = ExecutionNode::new(id, id).with_sequence(seq).with_output(output);
    match parent {
        Some(parent) => node.with_parent(parent),
        None => node,
    }
}

fn source() -> ExecutionNode {
    completed("wf", None, 0, "all done").with_child(
        completed("X", Some("wf"), 1, "x-out")
            .with_child(completed("X1", Some("X"), 2, "first"))
            .with_child(completed("X2", Some("X"), 3, "second")),
    )
}

#[tokio::test]
async fn test_completed_result_prefers_exact_sequence() {
    let looped = ExecutionNode::new("wf", "wf")
        .with_child(completed("X", Some("wf"), 3, "foo"))
        .with_child(completed("X", Some("wf"), 7, "bar"));

    let manager = CheckpointManager::disabled();
    manager.set_replay_checkpoint(looped);

    assert_eq!(manager.get_completed_result("X", 3), Some(Value::from("foo")));
    assert_eq!(manager.get_completed_result("X", 3), Some(Value::from("bar")));
    assert_eq!(manager.get_completed_result("X", 3), None);
    assert_eq!(manager.get_completed_result("unknown", 0), None);
}

#[tokio::test]
async fn test_cached_subtree_is_spliced_once() {
    let manager = CheckpointManager::disabled();
    manager.set_replay_checkpoint(source());

    manager.add_node(NewNode::new("wf").with_id("wf"), None);
    let x = manager.add_node(NewNode::new("X").with_id("X"), Some("wf"));
    let seq = manager.sequence_number(&x).unwrap();
    let cached = manager.get_completed_result(&x, seq).unwrap();
    manager.complete_node(&x, cached);

    assert_eq!(manager.add_cached_subtree_to_checkpoint(&x), 2);
    assert_eq!(manager.add_cached_subtree_to_checkpoint(&x), 0);

    let tree = manager.snapshot().unwrap();
    let x_node = tree.find("X").unwrap();
    let children: Vec<&str> = x_node.children.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(children, vec!["X1", "X2"]);
    assert_eq!(x_node.output, Some(Value::from("x-out")));
    assert_eq!(tree.count_steps(), 4);
    assert!(manager.is_tree_complete());

    // Sequence numbers stay monotonic past the replayed ones.
    let next = manager.add_node(NewNode::new("Y").with_id("Y"), Some("wf"));
    assert_eq!(manager.sequence_number(&next), Some(4));
}

#[tokio::test]
async fn test_unknown_cached_subtree_is_a_noop() {
    let manager = CheckpointManager::disabled();
    assert_eq!(manager.add_cached_subtree_to_checkpoint("nothing"), 0);

    manager.set_replay_checkpoint(source());
    assert_eq!(manager.add_cached_subtree_to_checkpoint("nothing"), 0);
    assert!(manager.snapshot().is_none());
}

#[tokio::test]
async fn test_persisted_run_replays_without_rework() {
    let store = RecordingStore::open();
    let first = CheckpointManager::with_store(CheckpointConfig::enabled("key", "acme"), store.clone());
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |manager: CheckpointManager, calls: Arc<AtomicUsize>| async move {
        let inner = manager.clone();
        run_workflow(
            &manager,
            "Pipeline",
            Value::from(json!({"topic": "rust"})),
            ComponentOpts::default(),
            move |root| async move {
                let fetched = run_component(
                    &inner,
                    "Fetch",
                    Value::from(json!({"url": "https://example.com"})),
                    Some(root.as_str()),
                    ComponentOpts::default(),
                    |_| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(Value::from("page"))
                    },
                )
                .await
                .map_err(|e| e.to_string())?;
                Ok::<_, String>(Value::from(json!({"summary": fetched.as_str().unwrap_or_default()})))
            },
        )
        .await
    };

    let output = run(first.clone(), calls.clone()).await.unwrap();
    assert_eq!(output.get_path("summary"), Some(&Value::from("page")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let last = store.calls().last().cloned().unwrap();
    let persisted = decode_raw_execution(&last.payload().raw_execution).unwrap();
    assert_eq!(persisted.component_name, "Pipeline");
    assert!(persisted.is_completed());

    let second = CheckpointManager::disabled();
    second.set_replay_checkpoint(persisted);
    let replayed = run(second.clone(), calls.clone()).await.unwrap();

    assert_eq!(replayed, output);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "cached work must not run again");
    let tree = second.snapshot().unwrap();
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].component_name, "Fetch");
    assert_eq!(tree.children[0].output, Some(Value::from("page")));
}

#[tokio::test]
async fn test_spliced_sequence_at_limit_does_not_overflow() {
    let recorded = completed("wf", None, 0, "done").with_child(
        completed("X", Some("wf"), 1, "x-out").with_child(completed("X1", Some("X"), u64::MAX, "last")),
    );
    let manager = CheckpointManager::disabled();
    manager.set_replay_checkpoint(recorded);

    manager.add_node(NewNode::new("wf").with_id("wf"), None);
    let x = manager.add_node(NewNode::new("X").with_id("X"), Some("wf"));
    assert_eq!(manager.add_cached_subtree_to_checkpoint(&x), 1);

    let a = manager.add_node(NewNode::new("A").with_id("A"), Some("wf"));
    let b = manager.add_node(NewNode::new("B").with_id("B"), Some("wf"));
    assert_eq!(manager.sequence_number(&a), Some(u64::MAX));
    assert_eq!(manager.sequence_number(&b), Some(u64::MAX));
}
