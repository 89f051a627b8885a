//! Execution checkpointing
//!
//! This crate records the tree of component invocations of a workflow run,
//! redacts declared secrets, and persists the tree to a remote trace store
//! as versioned checkpoints. A persisted tree can be loaded back to replay
//! completed work instead of re-running it.

mod component;
mod config;
mod manager;
mod replay;
mod secrets;
mod store;
mod tree;
mod writer;

pub use component::{run_component, run_workflow};
pub use config::{
    print_url_by_default, ApiSection, CheckpointConfig, CheckpointOptions, ConsoleSection,
    FileConfig, DEFAULT_API_BASE_URL, DEFAULT_CONSOLE_BASE_URL,
};
pub use manager::{CheckpointManager, ORPHAN_WARN_AFTER};
pub use replay::{generate_deterministic_id, generate_invocation_id, ReplayIndex, ROOT_SENTINEL};
pub use secrets::{Scrubber, SecretRegistry, MIN_SECRET_LENGTH, REDACTED};
pub use store::{
    decode_raw_execution, encode_raw_execution, gunzip, gzip, parse_receipt, CheckpointPayload,
    HttpTraceStore, TraceReceipt, TraceStore, SCHEMA_VERSION,
};
pub use tree::{Attachment, ExecutionTree};
pub use writer::{CheckpointWriter, PreparedCheckpoint, WriteState};

pub use flowcore::{
    CheckpointError, ComponentError, ComponentOpts, ExecutionNode, Metadata, NewNode, NodeId,
    NodePatch, StoreError, Value, FUNCTION_MARKER, STREAMING_PLACEHOLDER,
};
