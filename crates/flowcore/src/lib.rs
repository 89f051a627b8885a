//! Core data model for execution traces
//!
//! This crate provides the node, value and error types shared by the
//! checkpoint subsystem and whatever engine drives it. It has no runtime
//! dependencies.

mod error;
mod node;
mod value;

pub use error::{CheckpointError, ComponentError, StoreError};
pub use node::{ComponentOpts, ExecutionNode, Metadata, NewNode, NodeId, NodePatch};
pub use value::{Value, FUNCTION_MARKER, STREAMING_PLACEHOLDER};
