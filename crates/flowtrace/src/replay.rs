use flowcore::{ExecutionNode, NodeId, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Parent id hashed for nodes that have no parent.
pub const ROOT_SENTINEL: &str = "__root__";

/// Stable id for an invocation: same component, props and parent give the
/// same id on every run. Replay matching relies on nothing else.
pub fn generate_deterministic_id(
    component_name: &str,
    props: &Value,
    parent_id: Option<&str>,
) -> NodeId {
    generate_invocation_id(component_name, props, parent_id, 0)
}

/// Id for the `occurrence`-th identical call under the same parent.
///
/// Occurrence 0 is the plain deterministic id; later repeats (a component
/// invoked in a loop) hash the occurrence in, so each one is recorded as
/// its own node and reruns still land on the same ids in the same order.
pub fn generate_invocation_id(
    component_name: &str,
    props: &Value,
    parent_id: Option<&str>,
    occurrence: u64,
) -> NodeId {
    // Objects are key-ordered, so this is the sorted-key JSON form.
    let props_json = serde_json::to_string(&props.detached()).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(component_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(props_json.as_bytes());
    hasher.update([0u8]);
    hasher.update(parent_id.unwrap_or(ROOT_SENTINEL).as_bytes());
    if occurrence > 0 {
        hasher.update([0u8]);
        hasher.update(occurrence.to_be_bytes());
    }
    let digest = hasher.finalize();

    let short: String = digest.iter().take(12).map(|b| format!("{:02x}", b)).collect();
    format!("{}:{}", component_name, short)
}

#[derive(Debug, Clone)]
struct CachedResult {
    sequence_number: u64,
    output: Value,
    consumed: bool,
}

/// Completed results from a previous run, ready to be handed out again.
#[derive(Debug, Default)]
pub struct ReplayIndex {
    source: Option<ExecutionNode>,
    entries: HashMap<NodeId, Vec<CachedResult>>,
}

impl ReplayIndex {
    /// Index every completed node of `root`. Ids may repeat (loops), so
    /// each id maps to all of its results in depth-first walk order.
    pub fn load(root: ExecutionNode) -> Self {
        let mut entries: HashMap<NodeId, Vec<CachedResult>> = HashMap::new();
        let mut stack = vec![&root];
        while let Some(node) = stack.pop() {
            if let (Some(_), Some(output)) = (node.end_time, node.output.as_ref()) {
                if !output.is_streaming_placeholder() {
                    entries.entry(node.id.clone()).or_default().push(CachedResult {
                        sequence_number: node.sequence_number,
                        output: output.clone(),
                        consumed: false,
                    });
                }
            }
            stack.extend(node.children.iter().rev());
        }
        Self {
            source: Some(root),
            entries,
        }
    }

    /// Hand out a cached result for `node_id`, preferring the entry recorded
    /// at `sequence_number`. Each entry is handed out once.
    pub fn take(&mut self, node_id: &str, sequence_number: u64) -> Option<Value> {
        let results = self.entries.get_mut(node_id)?;

        let exact = results
            .iter()
            .position(|r| !r.consumed && r.sequence_number == sequence_number);
        let index = match exact {
            Some(index) => index,
            None => {
                let index = results.iter().position(|r| !r.consumed)?;
                tracing::warn!(
                    node_id = %node_id,
                    expected = sequence_number,
                    found = results[index].sequence_number,
                    "Replay sequence drift; using first unconsumed result"
                );
                index
            }
        };

        let entry = &mut results[index];
        entry.consumed = true;
        Some(entry.output.clone())
    }

    /// Cached results for `node_id` not yet handed out.
    pub fn remaining(&self, node_id: &str) -> usize {
        self.entries
            .get(node_id)
            .map(|results| results.iter().filter(|r| !r.consumed).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The recorded subtree rooted at `node_id`.
    pub fn subtree(&self, node_id: &str) -> Option<&ExecutionNode> {
        self.source.as_ref()?.find(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> ExecutionNode {
        ExecutionNode::new("root", "Workflow")
            .with_sequence(0)
            .with_output("final")
            .with_child(
                ExecutionNode::new("X", "Step")
                    .with_parent("root")
                    .with_sequence(3)
                    .with_output("foo"),
            )
            .with_child(
                ExecutionNode::new("X", "Step")
                    .with_parent("root")
                    .with_sequence(5)
                    .with_output("bar"),
            )
            .with_child(ExecutionNode::new("running", "Step").with_parent("root"))
    }

    #[test]
    fn exact_sequence_match_wins_then_next_unconsumed() {
        let mut index = ReplayIndex::load(source());
        assert_eq!(index.take("X", 3), Some(Value::from("foo")));
        assert_eq!(index.remaining("X"), 1);
        assert_eq!(index.take("X", 3), Some(Value::from("bar")));
        assert_eq!(index.take("X", 3), None);
    }

    #[test]
    fn drift_falls_back_to_first_unconsumed() {
        let mut index = ReplayIndex::load(source());
        assert_eq!(index.take("X", 99), Some(Value::from("foo")));
        assert_eq!(index.take("X", 5), Some(Value::from("bar")));
    }

    #[test]
    fn incomplete_and_streaming_nodes_are_not_cached() {
        let root = source().with_child(
            ExecutionNode::new("stream", "Step").with_output(Value::streaming_placeholder()),
        );
        let mut index = ReplayIndex::load(root);
        assert_eq!(index.take("running", 0), None);
        assert_eq!(index.take("stream", 0), None);
        assert_eq!(index.len(), 3);
        assert!(index.subtree("running").is_some());
    }

    #[test]
    fn deterministic_ids_depend_on_name_props_and_parent() {
        let props = Value::from(json!({"b": 2, "a": 1}));
        let reordered = Value::from(json!({"a": 1, "b": 2}));

        let id = generate_deterministic_id("Fetch", &props, Some("parent"));
        assert_eq!(id, generate_deterministic_id("Fetch", &reordered, Some("parent")));
        assert!(id.starts_with("Fetch:"));
        assert_ne!(id, generate_deterministic_id("Fetch", &props, None));
        assert_ne!(id, generate_deterministic_id("Other", &props, Some("parent")));
        assert_ne!(
            id,
            generate_deterministic_id("Fetch", &Value::from(json!({"a": 2})), Some("parent"))
        );
    }

    #[test]
    fn fallback_follows_walk_order_not_sequence_order() {
        // Attached out of start order: the later-started sibling comes first.
        let root = ExecutionNode::new("root", "Workflow")
            .with_child(
                ExecutionNode::new("X", "Step")
                    .with_parent("root")
                    .with_sequence(9)
                    .with_output("attached-first"),
            )
            .with_child(
                ExecutionNode::new("X", "Step")
                    .with_parent("root")
                    .with_sequence(2)
                    .with_output("attached-second"),
            );
        let mut index = ReplayIndex::load(root);
        assert_eq!(index.take("X", 42), Some(Value::from("attached-first")));
        assert_eq!(index.take("X", 42), Some(Value::from("attached-second")));
    }

    #[test]
    fn repeated_invocations_get_distinct_stable_ids() {
        let first = generate_invocation_id("Poll", &Value::Null, Some("root"), 0);
        let second = generate_invocation_id("Poll", &Value::Null, Some("root"), 1);
        let third = generate_invocation_id("Poll", &Value::Null, Some("root"), 2);

        assert_eq!(first, generate_deterministic_id("Poll", &Value::Null, Some("root")));
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(second, generate_invocation_id("Poll", &Value::Null, Some("root"), 1));
        assert!(third.starts_with("Poll:"));
    }
}
