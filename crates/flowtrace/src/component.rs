use crate::config::print_url_by_default;
use crate::manager::CheckpointManager;
use crate::replay::{generate_deterministic_id, generate_invocation_id};
use flowcore::{ComponentError, ComponentOpts, Metadata, NewNode, NodeId, Value};
use std::fmt::Display;
use std::future::Future;

/// Run one component invocation under checkpointing.
///
/// The node id is derived from `name`, `props`, `parent_id` and how many
/// identical calls preceded this one, so a rerun of the same workflow
/// lands on the same ids and repeated calls in a loop stay separate
/// nodes. When a replay checkpoint holds a completed result for that id, `work` is skipped and the cached
/// output (and the subtree that produced it) is recorded instead.
///
/// `work` receives the node id to pass as the parent of nested components.
pub async fn run_component<F, Fut, E>(
    manager: &CheckpointManager,
    name: &str,
    props: Value,
    parent_id: Option<&str>,
    opts: ComponentOpts,
    work: F,
) -> Result<Value, ComponentError>
where
    F: FnOnce(NodeId) -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: Display,
{
    let base = generate_deterministic_id(name, &props, parent_id);
    let occurrence = manager.claim_occurrence(&base);
    let id = generate_invocation_id(name, &props, parent_id, occurrence);
    let new = NewNode::new(name)
        .with_id(id.clone())
        .with_props(props)
        .with_opts(opts);
    let node_id = manager.add_node(new, parent_id);

    if let Some(cached) = manager
        .sequence_number(&node_id)
        .and_then(|seq| manager.get_completed_result(&node_id, seq))
    {
        tracing::debug!(node_id = %node_id, component = %name, "Using cached result");
        manager.complete_node(&node_id, cached.clone());
        manager.add_cached_subtree_to_checkpoint(&node_id);
        return Ok(cached);
    }

    match work(node_id.clone()).await {
        Ok(output) => {
            manager.complete_node(&node_id, output.clone());
            Ok(output)
        }
        Err(e) => {
            let message = e.to_string();
            tracing::error!(node_id = %node_id, component = %name, "Component failed: {}", message);

            let mut error = Metadata::new();
            error.insert("name".into(), Value::from(short_type_name::<E>()));
            error.insert("message".into(), Value::from(message.as_str()));
            error.insert("type".into(), Value::from("error"));
            let mut metadata = Metadata::new();
            metadata.insert("error".into(), Value::Object(error));

            manager.add_metadata(&node_id, metadata);
            manager.complete_node(&node_id, Value::Null);
            Err(ComponentError::new(name, message))
        }
    }
}

/// Run the root component of a workflow and wait until its final
/// checkpoint has been attempted.
///
/// Workflow-level metadata goes in `opts.metadata` and lands on the root.
/// The console URL is announced unless `CI` is set.
pub async fn run_workflow<F, Fut, E>(
    manager: &CheckpointManager,
    name: &str,
    props: Value,
    opts: ComponentOpts,
    work: F,
) -> Result<Value, ComponentError>
where
    F: FnOnce(NodeId) -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: Display,
{
    manager.set_workflow_name(name);
    manager.set_print_url(print_url_by_default(|key| std::env::var(key).ok()));
    let result = run_component(manager, name, props, None, opts, work).await;
    manager.wait_for_pending_updates().await;
    result
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
