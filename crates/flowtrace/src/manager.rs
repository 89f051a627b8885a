use crate::config::{CheckpointConfig, CheckpointOptions};
use crate::replay::ReplayIndex;
use crate::secrets::SecretRegistry;
use crate::store::{HttpTraceStore, TraceStore};
use crate::tree::{Attachment, ExecutionTree};
use crate::writer::{CheckpointWriter, PreparedCheckpoint, WriteState};
use chrono::Utc;
use flowcore::{CheckpointError, ExecutionNode, Metadata, NewNode, NodeId, NodePatch, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::time::Duration;
use uuid::Uuid;

/// How long a node may wait for its parent before we log about it.
pub const ORPHAN_WARN_AFTER: Duration = Duration::from_secs(5);

/// Records the execution tree of one workflow run and keeps the remote
/// trace store up to date.
///
/// Every lifecycle method is synchronous and never fails; the only work
/// that awaits is the checkpoint write, which runs on a background task.
/// Cloning is cheap and shares the same run. Separate runs need separate
/// managers.
#[derive(Clone)]
pub struct CheckpointManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CheckpointConfig,
    state: Mutex<TraceState>,
    writer: CheckpointWriter,
}

#[derive(Default)]
struct TraceState {
    tree: ExecutionTree,
    secrets: SecretRegistry,
    secret_outputs: HashSet<NodeId>,
    replay: ReplayIndex,
    /// Identical calls seen so far, keyed by their deterministic id.
    occurrences: HashMap<NodeId, u64>,
    next_sequence: u64,
    workflow_name: Option<String>,
    /// A write was skipped because the tree was incomplete.
    deferred: bool,
}

impl CheckpointManager {
    /// Resolve configuration from options, environment and config file and
    /// talk to the HTTP trace store when checkpointing is enabled.
    pub fn new(options: CheckpointOptions) -> Result<Self, CheckpointError> {
        Ok(Self::with_config(options.resolve()?))
    }

    pub fn with_config(config: CheckpointConfig) -> Self {
        let store: Option<Arc<dyn TraceStore>> = match (&config.api_key, &config.org) {
            (Some(key), Some(org)) if config.enabled => Some(Arc::new(HttpTraceStore::new(
                config.api_base_url.clone(),
                org.clone(),
                key.clone(),
            ))),
            _ => None,
        };
        Self::build(config, store)
    }

    /// Use a custom trace store. Writes happen only if `config.enabled`.
    pub fn with_store(config: CheckpointConfig, store: Arc<dyn TraceStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// In-memory only: the tree is kept for inspection and replay, nothing is sent.
    pub fn disabled() -> Self {
        Self::build(CheckpointConfig::disabled(), None)
    }

    fn build(config: CheckpointConfig, store: Option<Arc<dyn TraceStore>>) -> Self {
        if config.enabled {
            tracing::info!(
                org = ?config.org,
                api = %config.api_base_url,
                "Checkpoints enabled"
            );
        } else if config.api_key.is_none() {
            tracing::info!("Checkpoints disabled: no API key provided");
        } else {
            tracing::info!("Checkpoints disabled via configuration");
        }

        Self {
            inner: Arc::new(Inner {
                writer: CheckpointWriter::new(config.clone(), store),
                config,
                state: Mutex::new(TraceState::default()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Record the start of an invocation and return its id.
    ///
    /// The node is attached under `parent_id` if that parent is known,
    /// parked as an orphan if not, or treated as a root candidate when no
    /// parent is given.
    pub fn add_node(&self, new: NewNode, parent_id: Option<&str>) -> NodeId {
        let NewNode {
            id,
            component_name,
            props,
            opts,
        } = new;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let attachment = {
            let mut state = self.inner.state.lock();
            if state.tree.contains(&id) {
                tracing::warn!(node_id = %id, "Node already recorded; ignoring duplicate add");
                return id;
            }

            let sequence_number = state.next_sequence;
            state.next_sequence = sequence_number.saturating_add(1);

            let node = ExecutionNode {
                id: id.clone(),
                parent_id: parent_id.map(str::to_string),
                sequence_number,
                component_name: opts.name.clone().unwrap_or(component_name),
                start_time: Some(Utc::now()),
                end_time: None,
                props: props.detached(),
                output: None,
                metadata: opts
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.detached()))
                    .collect(),
                children: Vec::new(),
            };

            if !opts.secret_props.is_empty() {
                state
                    .secrets
                    .register_paths(&node.props, &opts.secret_props, &id);
            }
            if opts.secret_outputs {
                state.secret_outputs.insert(id.clone());
            }

            state.tree.insert(node, parent_id)
        };

        if let Attachment::Orphaned { waiting_for } = attachment {
            self.inner.watch_orphan(id.clone(), waiting_for);
        }
        self.inner.update_checkpoint();
        id
    }

    /// How many identical calls with deterministic id `key` came before
    /// this one. Each call bumps the count.
    pub fn claim_occurrence(&self, key: &str) -> u64 {
        let mut state = self.inner.state.lock();
        let count = state.occurrences.entry(key.to_string()).or_insert(0);
        let occurrence = *count;
        *count = count.saturating_add(1);
        occurrence
    }

    /// Record the end of an invocation. `output` may be the streaming placeholder.
    pub fn complete_node(&self, id: &str, output: Value) {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(node) = state.tree.get_mut(id) else {
                tracing::warn!(node_id = %id, "Attempted to complete unknown node");
                return;
            };
            node.end_time = Some(Utc::now());
            node.output = Some(output.detached());

            if state.secret_outputs.contains(id) && !output.is_streaming_placeholder() {
                state.secrets.register_all(&output, id);
            }
        }
        self.inner.update_checkpoint();
    }

    pub fn add_metadata(&self, id: &str, metadata: Metadata) {
        {
            let mut state = self.inner.state.lock();
            let Some(node) = state.tree.get_mut(id) else {
                tracing::warn!(node_id = %id, "Attempted to add metadata to unknown node");
                return;
            };
            for (key, value) in metadata {
                node.metadata.insert(key, value.detached());
            }
        }
        self.inner.update_checkpoint();
    }

    pub fn update_node(&self, id: &str, patch: NodePatch) {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(node) = state.tree.get_mut(id) else {
                tracing::warn!(node_id = %id, "Attempted to update unknown node");
                return;
            };

            if let Some(name) = patch.component_name {
                node.component_name = name;
            }
            if let Some(props) = patch.props {
                node.props = props.detached();
            }
            if let Some(end_time) = patch.end_time {
                node.end_time = Some(end_time);
            }
            if let Some(metadata) = patch.metadata {
                for (key, value) in metadata {
                    node.metadata.insert(key, value.detached());
                }
            }
            if let Some(output) = patch.output {
                node.output = Some(output.detached());
                if state.secret_outputs.contains(id) && !output.is_streaming_placeholder() {
                    state.secrets.register_all(&output, id);
                }
            }
        }
        self.inner.update_checkpoint();
    }

    /// Register the values at `paths` inside `payload` as secrets of `node_id`.
    pub fn register_secrets(&self, payload: &Value, paths: &[String], node_id: &str) {
        self.inner
            .state
            .lock()
            .secrets
            .register_paths(payload, paths, node_id);
    }

    /// Redact `data` with the secrets of `node_id` and its ancestors.
    pub fn scrub(&self, data: &Value, node_id: &str, path: &str) -> Value {
        let state = self.inner.state.lock();
        let mut scrubber = state.secrets.scrubber();
        let lineage = state.tree.lineage(node_id);
        if lineage.is_empty() {
            scrubber.push(node_id);
        }
        for id in &lineage {
            scrubber.push(id);
        }
        scrubber.scrub(data, path)
    }

    pub fn set_workflow_name(&self, name: impl Into<String>) {
        self.inner.state.lock().workflow_name = Some(name.into());
    }

    pub fn set_print_url(&self, print_url: bool) {
        self.inner.writer.set_print_url(print_url);
    }

    pub fn print_url(&self) -> bool {
        self.inner.writer.print_url()
    }

    /// Trigger a checkpoint write of the current state.
    pub fn write(&self) {
        self.inner.update_checkpoint();
    }

    /// Resolves once every in-flight and queued write has been attempted.
    pub async fn wait_for_pending_updates(&self) {
        let flush = {
            let state = self.inner.state.lock();
            state.deferred && state.tree.is_complete()
        };
        if flush {
            self.inner.update_checkpoint();
        }
        self.inner.writer.wait_idle().await;
    }

    pub fn write_state(&self) -> WriteState {
        self.inner.writer.state()
    }

    /// Version the next write will carry.
    pub fn version(&self) -> u64 {
        self.inner.writer.version()
    }

    pub fn trace_id(&self) -> Option<String> {
        self.inner.writer.trace_id()
    }

    pub fn is_tree_complete(&self) -> bool {
        self.inner.state.lock().tree.is_complete()
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.inner.state.lock().tree.root_id().map(str::to_string)
    }

    /// Copy of a single node, without children.
    pub fn node(&self, id: &str) -> Option<ExecutionNode> {
        self.inner.state.lock().tree.get(id).cloned()
    }

    pub fn sequence_number(&self, id: &str) -> Option<u64> {
        self.inner
            .state
            .lock()
            .tree
            .get(id)
            .map(|node| node.sequence_number)
    }

    /// Nested, unredacted copy of the tree.
    pub fn snapshot(&self) -> Option<ExecutionNode> {
        self.inner.state.lock().tree.snapshot()
    }

    /// Nested copy of the tree as it would be persisted.
    pub fn masked_snapshot(&self) -> Option<ExecutionNode> {
        let state = self.inner.state.lock();
        let root = state.tree.snapshot()?;
        Some(state.secrets.scrubber().mask_tree(&root))
    }

    /// Use `root`, a tree captured by an earlier run, as the replay source.
    pub fn set_replay_checkpoint(&self, root: ExecutionNode) {
        let index = ReplayIndex::load(root);
        tracing::info!(cached = index.len(), "Loaded replay checkpoint");
        self.inner.state.lock().replay = index;
    }

    /// Cached output for `node_id`, preferring the one recorded at
    /// `sequence_number`. Each cached result is handed out once.
    pub fn get_completed_result(&self, node_id: &str, sequence_number: u64) -> Option<Value> {
        self.inner
            .state
            .lock()
            .replay
            .take(node_id, sequence_number)
    }

    /// Copy the cached subtree rooted at `node_id` into the live tree.
    /// Ids already present are skipped. Returns how many nodes were added.
    pub fn add_cached_subtree_to_checkpoint(&self, node_id: &str) -> usize {
        let (added, orphaned) = {
            let mut state = self.inner.state.lock();
            let TraceState {
                tree,
                replay,
                next_sequence,
                ..
            } = &mut *state;

            let Some(cached) = replay.subtree(node_id) else {
                tracing::warn!(node_id = %node_id, "No cached subtree for node");
                return 0;
            };
            let mut orphaned = Vec::new();
            let added = splice(tree, cached, next_sequence, &mut orphaned);
            if added == 0 {
                return 0;
            }
            tracing::debug!(node_id = %node_id, added, "Spliced cached subtree");
            (added, orphaned)
        };

        for (child, parent) in orphaned {
            self.inner.watch_orphan(child, parent);
        }
        self.inner.update_checkpoint();
        added
    }
}

fn splice(
    tree: &mut ExecutionTree,
    cached: &ExecutionNode,
    next_sequence: &mut u64,
    orphaned: &mut Vec<(NodeId, NodeId)>,
) -> usize {
    let mut added = 0;
    if !tree.contains(&cached.id) {
        let mut node = cached.clone();
        node.children = Vec::new();
        let parent = node.parent_id.clone();
        *next_sequence = (*next_sequence).max(cached.sequence_number.saturating_add(1));
        if let Attachment::Orphaned { waiting_for } = tree.insert(node, parent.as_deref()) {
            orphaned.push((cached.id.clone(), waiting_for));
        }
        added += 1;
    }
    for child in &cached.children {
        added += splice(tree, child, next_sequence, orphaned);
    }
    added
}

impl Inner {
    /// Entry point for every mutation: write now, fold into the running
    /// write, or defer until the tree is complete.
    fn update_checkpoint(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }

        {
            let mut state = self.state.lock();
            if !state.tree.is_complete() {
                tracing::trace!("Tree incomplete; deferring checkpoint");
                state.deferred = true;
                return;
            }
            state.deferred = false;
        }

        if !self.writer.request() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.drain().await });
            }
            Err(_) => {
                tracing::warn!("No async runtime available; skipping checkpoint write");
                self.writer.finish();
            }
        }
    }

    /// Run writes until no request is left pending. Each write captures
    /// the tree as it is when that write begins.
    async fn drain(self: Arc<Self>) {
        loop {
            if let Some(checkpoint) = self.prepare() {
                self.writer.send(checkpoint).await;
            }
            if !self.writer.finish() {
                break;
            }
        }
    }

    fn prepare(&self) -> Option<PreparedCheckpoint> {
        let state = self.state.lock();
        let root = state.tree.snapshot()?;
        let masked_root = state.secrets.scrubber().mask_tree(&root);
        Some(PreparedCheckpoint {
            workflow_name: state
                .workflow_name
                .clone()
                .unwrap_or_else(|| root.component_name.clone()),
            started_at: root.start_time,
            completed_at: root.end_time,
            masked_root,
        })
    }

    fn watch_orphan(self: &Arc<Self>, node_id: NodeId, parent_id: NodeId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(ORPHAN_WARN_AFTER).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let state = inner.state.lock();
            if state.tree.is_waiting(&node_id, &parent_id) {
                let name = state
                    .tree
                    .get(&node_id)
                    .map(|node| node.component_name.clone())
                    .unwrap_or_default();
                tracing::warn!(
                    node_id = %node_id,
                    component = %name,
                    parent_id = %parent_id,
                    "Node still waiting for its parent after {:?}",
                    ORPHAN_WARN_AFTER
                );
            }
        });
    }
}
