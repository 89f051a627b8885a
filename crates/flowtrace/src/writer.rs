use crate::config::CheckpointConfig;
use crate::store::{encode_raw_execution, CheckpointPayload, TraceReceipt, TraceStore, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use flowcore::{ExecutionNode, StoreError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Write coalescing state. At most one write is ever in flight; any number
/// of requests made during it collapse into a single follow-up write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Writing,
    WritingWithPending,
}

/// Redacted tree plus the facts the payload needs, captured when a write begins.
#[derive(Debug, Clone)]
pub struct PreparedCheckpoint {
    pub masked_root: ExecutionNode,
    pub workflow_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct CheckpointWriter {
    state: watch::Sender<WriteState>,
    store: Option<Arc<dyn TraceStore>>,
    config: CheckpointConfig,
    version: AtomicU64,
    trace_id: Mutex<Option<String>>,
    print_url: AtomicBool,
    printed_url: AtomicBool,
}

impl CheckpointWriter {
    pub fn new(config: CheckpointConfig, store: Option<Arc<dyn TraceStore>>) -> Self {
        let (state, _) = watch::channel(WriteState::Idle);
        Self {
            state,
            store,
            config,
            version: AtomicU64::new(1),
            trace_id: Mutex::new(None),
            print_url: AtomicBool::new(false),
            printed_url: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WriteState {
        *self.state.borrow()
    }

    /// Ask for a write. Returns `true` when the caller must start one;
    /// otherwise the request was folded into the write already running.
    pub fn request(&self) -> bool {
        let mut start = false;
        self.state.send_if_modified(|state| match *state {
            WriteState::Idle => {
                *state = WriteState::Writing;
                start = true;
                true
            }
            WriteState::Writing => {
                *state = WriteState::WritingWithPending;
                true
            }
            WriteState::WritingWithPending => false,
        });
        if !start {
            tracing::trace!("Checkpoint write already in flight; coalescing");
        }
        start
    }

    /// Mark the running write as done. Returns `true` when a request arrived
    /// meanwhile and exactly one more write must run now.
    pub fn finish(&self) -> bool {
        let mut again = false;
        self.state.send_modify(|state| {
            if *state == WriteState::WritingWithPending {
                *state = WriteState::Writing;
                again = true;
            } else {
                *state = WriteState::Idle;
            }
        });
        again
    }

    /// Resolves once no write is running or queued.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|state| *state == WriteState::Idle).await;
    }

    /// Next version to be sent.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn trace_id(&self) -> Option<String> {
        self.trace_id.lock().clone()
    }

    pub fn set_print_url(&self, print_url: bool) {
        self.print_url.store(print_url, Ordering::SeqCst);
    }

    pub fn print_url(&self) -> bool {
        self.print_url.load(Ordering::SeqCst)
    }

    pub fn build_payload(
        &self,
        checkpoint: &PreparedCheckpoint,
        version: u64,
    ) -> Result<CheckpointPayload, StoreError> {
        let root = &checkpoint.masked_root;
        Ok(CheckpointPayload {
            execution_id: root.id.clone(),
            version,
            schema_version: SCHEMA_VERSION,
            workflow_name: checkpoint.workflow_name.clone(),
            started_at: checkpoint
                .started_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_default(),
            completed_at: checkpoint.completed_at.map(|t| t.timestamp_millis()),
            raw_execution: encode_raw_execution(root, Utc::now())?,
            steps: root.count_steps(),
            runtime: self.config.runtime.clone(),
            runtime_version: self.config.runtime_version.clone(),
            execution_run_id: self.config.execution_run_id.clone(),
        })
    }

    /// Send one checkpoint. Failures are logged and swallowed; the version
    /// advances either way.
    pub async fn send(&self, checkpoint: PreparedCheckpoint) {
        let Some(store) = &self.store else {
            return;
        };
        let version = self.version.fetch_add(1, Ordering::SeqCst);

        let payload = match self.build_payload(&checkpoint, version) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(version, "Failed to encode checkpoint: {}", e);
                return;
            }
        };

        let trace_id = self.trace_id();
        let result = match trace_id.as_deref() {
            None => store.create_trace(&payload).await,
            Some(id) => store.update_trace(id, &payload).await,
        };

        match result {
            Ok(receipt) => {
                if let Some(id) = &receipt.trace_id {
                    *self.trace_id.lock() = Some(id.clone());
                }
                tracing::info!(
                    version,
                    trace_id = ?self.trace_id(),
                    "Saved checkpoint"
                );
                self.announce_url(&receipt);
            }
            Err(e) => {
                tracing::warn!(version, "Failed to save checkpoint: {}", e);
            }
        }
    }

    fn announce_url(&self, receipt: &TraceReceipt) {
        if !self.print_url() {
            return;
        }
        let (Some(execution_id), Some(workflow_name), Some(org)) = (
            receipt.execution_id.as_deref(),
            receipt.workflow_name.as_deref(),
            self.config.org.as_deref(),
        ) else {
            return;
        };
        if self.printed_url.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            "View execution at: {}/{}/default/executions/{}?workflowName={}",
            self.config.console_base_url.trim_end_matches('/'),
            org,
            execution_id,
            workflow_name
        );
    }
}
