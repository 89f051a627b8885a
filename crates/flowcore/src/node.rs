use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = String;

/// Free-form annotations attached to a node.
pub type Metadata = BTreeMap<String, Value>;

/// One recorded invocation of a workflow component.
///
/// `children` is only populated in materialized snapshots; the live tree
/// keeps adjacency separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionNode {
    pub id: NodeId,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub sequence_number: u64,
    pub component_name: String,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub props: Value,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_output"
    )]
    pub output: Option<Value>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub children: Vec<ExecutionNode>,
}

// A stored `"output": null` is a completed node that produced null.
fn deserialize_output<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ExecutionNode {
    pub fn new(id: impl Into<NodeId>, component_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            sequence_number: 0,
            component_name: component_name.into(),
            start_time: None,
            end_time: None,
            props: Value::Null,
            output: None,
            metadata: Metadata::new(),
            children: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<NodeId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_props(mut self, props: impl Into<Value>) -> Self {
        self.props = props.into();
        self
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self.end_time.get_or_insert_with(Utc::now);
        self
    }

    pub fn with_child(mut self, child: ExecutionNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.end_time.is_some() && self.output.is_some()
    }

    /// Depth-first search through this node and its descendants.
    pub fn find(&self, id: &str) -> Option<&ExecutionNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Number of nodes in this subtree.
    pub fn count_steps(&self) -> usize {
        1 + self.children.iter().map(ExecutionNode::count_steps).sum::<usize>()
    }
}

/// Options a component declares about its own checkpointing.
#[derive(Debug, Clone, Default)]
pub struct ComponentOpts {
    /// Dotted prop paths whose values must never be persisted.
    pub secret_props: Vec<String>,
    /// Treat every string in the output as a secret.
    pub secret_outputs: bool,
    pub metadata: Metadata,
    /// Overrides the component name recorded in the tree.
    pub name: Option<String>,
}

impl ComponentOpts {
    pub fn with_secret_props<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secret_props.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_secret_outputs(mut self) -> Self {
        self.secret_outputs = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Input to `add_node`: what the caller knows at invocation start.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub id: Option<NodeId>,
    pub component_name: String,
    pub props: Value,
    pub opts: ComponentOpts,
}

impl NewNode {
    pub fn new(component_name: impl Into<String>) -> Self {
        Self {
            id: None,
            component_name: component_name.into(),
            props: Value::Null,
            opts: ComponentOpts::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_props(mut self, props: impl Into<Value>) -> Self {
        self.props = props.into();
        self
    }

    pub fn with_opts(mut self, opts: ComponentOpts) -> Self {
        self.opts = opts;
        self
    }
}

/// Partial update for `update_node`. Metadata merges, everything else replaces.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub component_name: Option<String>,
    pub props: Option<Value>,
    pub output: Option<Value>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

impl NodePatch {
    pub fn output(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn props(props: impl Into<Value>) -> Self {
        Self {
            props: Some(props.into()),
            ..Self::default()
        }
    }
}
