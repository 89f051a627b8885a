use flowcore::{ExecutionNode, NodeId, Value, FUNCTION_MARKER};
use std::collections::{HashMap, HashSet};

/// Strings shorter than this are never treated as secrets.
pub const MIN_SECRET_LENGTH: usize = 8;

/// Replacement for every redacted occurrence.
pub const REDACTED: &str = "[secret]";

/// Per-node sets of values that must not leave the process.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    by_node: HashMap<NodeId, HashSet<String>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the values found at each dotted path of `payload`.
    ///
    /// Returns how many new secrets were recorded for the node.
    pub fn register_paths(&mut self, payload: &Value, paths: &[String], node_id: &str) -> usize {
        let secrets = self.by_node.entry(node_id.to_string()).or_default();
        let before = secrets.len();
        for path in paths {
            if let Some(value) = payload.get_path(path) {
                collect_secrets(value, secrets);
            }
        }
        secrets.len() - before
    }

    /// Register every qualifying string anywhere in `payload`.
    pub fn register_all(&mut self, payload: &Value, node_id: &str) -> usize {
        let secrets = self.by_node.entry(node_id.to_string()).or_default();
        let before = secrets.len();
        collect_secrets(payload, secrets);
        secrets.len() - before
    }

    pub fn secrets_for(&self, node_id: &str) -> Option<&HashSet<String>> {
        self.by_node.get(node_id)
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.values().all(HashSet::is_empty)
    }

    pub fn scrubber(&self) -> Scrubber<'_> {
        Scrubber {
            registry: self,
            chain: Vec::new(),
            active: Vec::new(),
        }
    }
}

fn collect_secrets(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) if s.chars().count() >= MIN_SECRET_LENGTH => {
            out.insert(s.clone());
        }
        Value::Array(items) => items.iter().for_each(|item| collect_secrets(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_secrets(item, out)),
        _ => {}
    }
}

/// Redacts values on behalf of a chain of nodes.
///
/// The chain is an explicit stack: `push` a node before scrubbing its data
/// and `pop` it afterwards. Secrets in scope are the union of every node on
/// the stack, so a node's data is checked against its own secrets and its
/// ancestors', never its siblings'.
pub struct Scrubber<'a> {
    registry: &'a SecretRegistry,
    chain: Vec<NodeId>,
    active: Vec<&'a str>,
}

impl<'a> Scrubber<'a> {
    pub fn push(&mut self, node_id: &str) {
        self.chain.push(node_id.to_string());
        self.refresh();
    }

    pub fn pop(&mut self) {
        self.chain.pop();
        self.refresh();
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    fn refresh(&mut self) {
        let registry = self.registry;
        let mut active: Vec<&'a str> = self
            .chain
            .iter()
            .filter_map(|id| registry.by_node.get(id))
            .flatten()
            .map(String::as_str)
            .collect();
        // Longest first, so a secret that contains another is replaced whole.
        active.sort_unstable_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        active.dedup();
        self.active = active;
    }

    pub fn scrub_text(&self, text: &str) -> String {
        let mut result = text.to_string();
        for secret in &self.active {
            if result.contains(secret) {
                result = result.replace(secret, REDACTED);
            }
        }
        result
    }

    /// Redact `value`. `path` names its location for diagnostics.
    pub fn scrub(&self, value: &Value, path: &str) -> Value {
        match value {
            Value::Function(_) => Value::String(FUNCTION_MARKER.to_string()),
            Value::String(s) => self.redacted_string(s, path),
            Value::Number(n) => self.redacted_string(&Value::format_number(*n), path),
            Value::Null | Value::Bool(_) | Value::Bytes(_) => value.clone(),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.scrub(item, &format!("{}[{}]", path, i)))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| {
                        let child_path = if path.is_empty() {
                            key.clone()
                        } else {
                            format!("{}.{}", path, key)
                        };
                        (key.clone(), self.scrub(item, &child_path))
                    })
                    .collect(),
            ),
        }
    }

    fn redacted_string(&self, text: &str, path: &str) -> Value {
        let scrubbed = self.scrub_text(text);
        if scrubbed != text {
            tracing::trace!(path = %path, "Redacted secret value");
        }
        Value::String(scrubbed)
    }

    /// Redacted copy of a whole subtree. Each node stays on the stack while
    /// its descendants are masked.
    pub fn mask_tree(&mut self, node: &ExecutionNode) -> ExecutionNode {
        self.push(&node.id);
        let masked = ExecutionNode {
            id: node.id.clone(),
            parent_id: node.parent_id.clone(),
            sequence_number: node.sequence_number,
            component_name: node.component_name.clone(),
            start_time: node.start_time,
            end_time: node.end_time,
            props: self.scrub(&node.props, "props"),
            output: node.output.as_ref().map(|out| self.scrub(out, "output")),
            metadata: node
                .metadata
                .iter()
                .map(|(key, value)| (key.clone(), self.scrub(value, &format!("metadata.{}", key))))
                .collect(),
            children: node
                .children
                .iter()
                .map(|child| self.mask_tree(child))
                .collect(),
        };
        self.pop();
        masked
    }
}
