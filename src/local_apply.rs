//! Applies one finalized copilot action to the local workflow store. Local
//! application is synchronous and total: either it dispatches exactly one
//! structural command, or it reports false and leaves the store untouched.

use serde_json::Value;

use crate::action::{ActionOp, ConfigType, CopilotAction};
use crate::history::{WorkflowCommand, WorkflowStore};

/// Route a local (non-trigger) action into the store. Returns whether the
/// action took effect; duplicate creates and edits or deletes of missing
/// entities are no-ops.
pub fn apply_local_action(
    store: &mut WorkflowStore,
    action: &CopilotAction,
    default_model: &str,
) -> bool {
    if action.config_type.is_trigger() {
        tracing::warn!(name = %action.name, "trigger action routed to local applier");
        return false;
    }

    let name = action.name.clone();
    match (action.op, action.config_type) {
        (ActionOp::CreateNew, ConfigType::Agent) => {
            if store.workflow().agent(&name).is_some() {
                tracing::warn!(%name, "agent already exists, skipping create");
                return false;
            }
            store.dispatch(WorkflowCommand::AddAgent {
                changes: named_changes(action),
            })
        }
        (ActionOp::CreateNew, ConfigType::Tool) => {
            if store.workflow().tool(&name).is_some() {
                tracing::warn!(%name, "tool already exists, skipping create");
                return false;
            }
            store.dispatch(WorkflowCommand::AddTool {
                changes: named_changes(action),
            })
        }
        (ActionOp::CreateNew, ConfigType::Prompt) => {
            if store.workflow().prompt(&name).is_some() {
                tracing::warn!(%name, "prompt already exists, skipping create");
                return false;
            }
            store.dispatch(WorkflowCommand::AddPrompt {
                changes: named_changes(action),
                select: false,
            })
        }
        (ActionOp::CreateNew, ConfigType::Pipeline) => {
            if store.workflow().pipeline(&name).is_some() {
                tracing::warn!(%name, "pipeline already exists, skipping create");
                return false;
            }
            store.dispatch(WorkflowCommand::AddPipeline {
                changes: named_changes(action),
                default_model: Some(default_model.to_owned()),
            })
        }
        (ActionOp::Edit, ConfigType::Agent) => store.dispatch(WorkflowCommand::UpdateAgent {
            name,
            changes: action.config_changes.clone(),
            select: false,
        }),
        (ActionOp::Edit, ConfigType::Tool) => store.dispatch(WorkflowCommand::UpdateTool {
            name,
            changes: action.config_changes.clone(),
            select: false,
        }),
        (ActionOp::Edit, ConfigType::Prompt) => store.dispatch(WorkflowCommand::UpdatePrompt {
            name,
            changes: action.config_changes.clone(),
            select: false,
        }),
        (ActionOp::Edit, ConfigType::Pipeline) => store.dispatch(WorkflowCommand::UpdatePipeline {
            name,
            changes: action.config_changes.clone(),
        }),
        (ActionOp::Edit, ConfigType::StartAgent) => {
            store.dispatch(WorkflowCommand::SetMainAgent { name })
        }
        (ActionOp::Delete, ConfigType::Agent) => {
            store.dispatch(WorkflowCommand::DeleteAgent { name })
        }
        (ActionOp::Delete, ConfigType::Tool) => {
            store.dispatch(WorkflowCommand::DeleteTool { name })
        }
        (ActionOp::Delete, ConfigType::Prompt) => {
            store.dispatch(WorkflowCommand::DeletePrompt { name })
        }
        (ActionOp::Delete, ConfigType::Pipeline) => {
            store.dispatch(WorkflowCommand::DeletePipeline { name })
        }
        (op, config_type) => {
            tracing::warn!(?op, ?config_type, %name, "unhandled local action");
            false
        }
    }
}

/// Creates carry the action name inside the change set so the store does not
/// fall back to a generated default name.
fn named_changes(action: &CopilotAction) -> serde_json::Map<String, Value> {
    let mut changes = action.config_changes.clone();
    changes.insert("name".to_owned(), Value::String(action.name.clone()));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use serde_json::Map;

    fn action(op: ActionOp, config_type: ConfigType, name: &str) -> CopilotAction {
        CopilotAction {
            op,
            config_type,
            name: name.to_owned(),
            change_description: String::new(),
            config_changes: Map::new(),
            error: None,
        }
    }

    fn empty_store() -> WorkflowStore {
        WorkflowStore::new(Workflow::default(), false)
    }

    #[test]
    fn create_uses_the_action_name() {
        let mut store = empty_store();
        let mut create = action(ActionOp::CreateNew, ConfigType::Agent, "Router");
        create
            .config_changes
            .insert("model".into(), Value::String("gpt-4.1".into()));

        assert!(apply_local_action(&mut store, &create, "gpt-4.1"));
        let agent = store.workflow().agent("Router").unwrap();
        assert_eq!(agent.model, "gpt-4.1");
    }

    #[test]
    fn duplicate_create_is_a_no_op() {
        let mut store = empty_store();
        let create = action(ActionOp::CreateNew, ConfigType::Agent, "Router");
        assert!(apply_local_action(&mut store, &create, "gpt-4.1"));
        assert!(!apply_local_action(&mut store, &create, "gpt-4.1"));
        assert_eq!(store.workflow().agents.len(), 1);
    }

    #[test]
    fn edit_of_missing_entity_is_a_no_op() {
        let mut store = empty_store();
        let edit = action(ActionOp::Edit, ConfigType::Tool, "missing_tool");
        assert!(!apply_local_action(&mut store, &edit, "gpt-4.1"));
        assert!(!store.can_undo());
    }

    #[test]
    fn start_agent_edit_repoints_the_entry_agent() {
        let mut store = empty_store();
        let create = action(ActionOp::CreateNew, ConfigType::Agent, "Router");
        apply_local_action(&mut store, &create, "gpt-4.1");
        let repoint = action(ActionOp::Edit, ConfigType::StartAgent, "Router");

        assert!(apply_local_action(&mut store, &repoint, "gpt-4.1"));
        assert_eq!(store.workflow().start_agent, "Router");
    }

    #[test]
    fn trigger_actions_are_rejected() {
        let mut store = empty_store();
        let create = action(ActionOp::CreateNew, ConfigType::OneTimeTrigger, "t");
        assert!(!apply_local_action(&mut store, &create, "gpt-4.1"));
    }
}
