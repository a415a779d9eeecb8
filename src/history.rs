//! Command-sourced store over the workflow configuration with linear
//! undo/redo. Every structural dispatch records a forward and an inverse
//! patch; for an aggregate this small the patches are the before and after
//! snapshots themselves, so replay is a plain assignment and the round-trip
//! invariants hold by construction.
//!
//! Live configuration is never mutated in place: dispatching a structural
//! command while `is_live` is set first forks into draft mode and raises a
//! one-shot mode-change notice, then applies the change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::workflow::{
    Workflow, WorkflowAgent, WorkflowPipeline, WorkflowPrompt, WorkflowTool, merge_entity,
};

const FALLBACK_MODEL: &str = "gpt-4.1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Selection {
    Agent(String),
    Tool(String),
    Prompt(String),
    Pipeline(String),
}

/// The present snapshot: the workflow plus the editing-session flags that
/// ride along with it through undo/redo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub workflow: Workflow,
    pub selection: Option<Selection>,
    pub saving: bool,
    pub publishing: bool,
    pub publish_error: Option<String>,
    pub publish_success: bool,
    pub pending_changes: bool,
    pub is_live: bool,
    pub mode_change_notice: bool,
    pub last_updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow: Workflow, is_live: bool) -> Self {
        Self {
            workflow,
            selection: None,
            saving: false,
            publishing: false,
            publish_error: None,
            publish_success: false,
            pending_changes: false,
            is_live,
            mode_change_notice: false,
            last_updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCommand {
    // Structural commands: these join the undo log.
    AddAgent {
        changes: Map<String, Value>,
    },
    AddTool {
        changes: Map<String, Value>,
    },
    AddPrompt {
        changes: Map<String, Value>,
        select: bool,
    },
    AddPipeline {
        changes: Map<String, Value>,
        default_model: Option<String>,
    },
    UpdateAgent {
        name: String,
        changes: Map<String, Value>,
        select: bool,
    },
    UpdateTool {
        name: String,
        changes: Map<String, Value>,
        select: bool,
    },
    UpdatePrompt {
        name: String,
        changes: Map<String, Value>,
        select: bool,
    },
    UpdatePipeline {
        name: String,
        changes: Map<String, Value>,
    },
    DeleteAgent {
        name: String,
    },
    DeleteTool {
        name: String,
    },
    DeletePrompt {
        name: String,
    },
    DeletePipeline {
        name: String,
    },
    ToggleAgent {
        name: String,
    },
    SetMainAgent {
        name: String,
    },
    ReorderAgents {
        agents: Vec<WorkflowAgent>,
    },
    ReorderPipelines {
        pipelines: Vec<WorkflowPipeline>,
    },
    // Session commands: applied in place, no history entry.
    Select {
        selection: Selection,
    },
    ClearSelection,
    SetSaving {
        saving: bool,
    },
    SetPublishing {
        publishing: bool,
    },
    SetPublishError {
        error: Option<String>,
    },
    SetPublishSuccess {
        success: bool,
    },
    SetLive {
        live: bool,
    },
    ClearModeChangeNotice,
}

impl WorkflowCommand {
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::Select { .. }
                | Self::ClearSelection
                | Self::SetSaving { .. }
                | Self::SetPublishing { .. }
                | Self::SetPublishError { .. }
                | Self::SetPublishSuccess { .. }
                | Self::SetLive { .. }
                | Self::ClearModeChangeNotice
        )
    }
}

pub struct WorkflowStore {
    present: WorkflowState,
    patches: Vec<WorkflowState>,
    inverse_patches: Vec<WorkflowState>,
    current_index: usize,
}

impl WorkflowStore {
    pub fn new(workflow: Workflow, is_live: bool) -> Self {
        Self::from_state(WorkflowState::new(workflow, is_live))
    }

    pub fn from_state(state: WorkflowState) -> Self {
        Self {
            present: state,
            patches: Vec::new(),
            inverse_patches: Vec::new(),
            current_index: 0,
        }
    }

    pub fn present(&self) -> &WorkflowState {
        &self.present
    }

    pub fn workflow(&self) -> &Workflow {
        &self.present.workflow
    }

    pub fn can_undo(&self) -> bool {
        self.current_index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current_index < self.patches.len()
    }

    /// Apply a command. Structural commands fork out of live mode, push a
    /// patch pair and truncate any redo tail; session commands mutate the
    /// present state in place. Returns false when the command did not change
    /// anything (missing target, duplicate name), in which case no history
    /// entry is recorded.
    pub fn dispatch(&mut self, command: WorkflowCommand) -> bool {
        if !command.is_structural() {
            apply_session(&mut self.present, command);
            return true;
        }

        let before = self.present.clone();
        let mut next = self.present.clone();
        if next.is_live {
            next.is_live = false;
            next.mode_change_notice = true;
        }
        if !apply_structural(&mut next, command) {
            return false;
        }
        next.pending_changes = true;
        next.last_updated_at = Utc::now();

        self.patches.truncate(self.current_index);
        self.inverse_patches.truncate(self.current_index);
        self.patches.push(next.clone());
        self.inverse_patches.push(before);
        self.current_index += 1;
        self.present = next;
        true
    }

    pub fn undo(&mut self) {
        if self.current_index == 0 {
            return;
        }
        self.current_index -= 1;
        self.present = self.inverse_patches[self.current_index].clone();
        self.present.pending_changes = true;
    }

    pub fn redo(&mut self) {
        if self.current_index == self.patches.len() {
            return;
        }
        self.present = self.patches[self.current_index].clone();
        self.present.pending_changes = true;
        self.current_index += 1;
    }

    /// Hard reset used when a different workflow is loaded wholesale. Not an
    /// undoable step.
    pub fn restore(&mut self, state: WorkflowState) {
        self.present = state;
        self.patches.clear();
        self.inverse_patches.clear();
        self.current_index = 0;
    }
}

fn apply_session(state: &mut WorkflowState, command: WorkflowCommand) {
    match command {
        WorkflowCommand::Select { selection } => state.selection = Some(selection),
        WorkflowCommand::ClearSelection => state.selection = None,
        WorkflowCommand::SetSaving { saving } => {
            state.saving = saving;
            state.pending_changes = saving;
            if !saving {
                state.last_updated_at = Utc::now();
            }
        }
        WorkflowCommand::SetPublishing { publishing } => state.publishing = publishing,
        WorkflowCommand::SetPublishError { error } => state.publish_error = error,
        WorkflowCommand::SetPublishSuccess { success } => state.publish_success = success,
        WorkflowCommand::SetLive { live } => state.is_live = live,
        WorkflowCommand::ClearModeChangeNotice => state.mode_change_notice = false,
        _ => unreachable!("structural command routed to session applier"),
    }
}

/// Pick a name that is not taken yet: the base itself, or the base suffixed
/// with how many taken names share its prefix, plus one.
fn dedupe_name<'a>(base: &str, sep: &str, taken: impl Iterator<Item = &'a str> + Clone) -> String {
    if !taken.clone().any(|name| name == base) {
        return base.to_owned();
    }
    let count = taken.filter(|name| name.starts_with(base)).count();
    format!("{base}{sep}{}", count + 1)
}

fn changed_name(changes: &Map<String, Value>) -> Option<String> {
    changes
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

fn apply_structural(state: &mut WorkflowState, command: WorkflowCommand) -> bool {
    let workflow = &mut state.workflow;
    match command {
        WorkflowCommand::AddAgent { changes } => {
            let name = changed_name(&changes).unwrap_or_else(|| {
                dedupe_name(
                    "New agent",
                    " ",
                    workflow.agents.iter().map(|a| a.name.as_str()),
                )
            });
            if workflow.agent(&name).is_some() {
                tracing::warn!("agent {} already exists, skipping create", name);
                return false;
            }
            let Ok(agent) = merge_entity(&WorkflowAgent::blank(&name), &changes) else {
                tracing::warn!("could not build agent {} from changes", name);
                return false;
            };
            workflow.agents.push(agent);
            state.selection = Some(Selection::Agent(name));
            true
        }
        WorkflowCommand::AddTool { changes } => {
            let name = changed_name(&changes).unwrap_or_else(|| {
                dedupe_name(
                    "new_tool",
                    "_",
                    workflow.tools.iter().map(|t| t.name.as_str()),
                )
            });
            if workflow.tool(&name).is_some() {
                tracing::warn!("tool {} already exists, skipping create", name);
                return false;
            }
            let Ok(tool) = merge_entity(&WorkflowTool::blank(&name), &changes) else {
                tracing::warn!("could not build tool {} from changes", name);
                return false;
            };
            workflow.tools.push(tool);
            state.selection = Some(Selection::Tool(name));
            true
        }
        WorkflowCommand::AddPrompt { changes, select } => {
            let name = changed_name(&changes).unwrap_or_else(|| {
                dedupe_name(
                    "New Variable",
                    " ",
                    workflow.prompts.iter().map(|p| p.name.as_str()),
                )
            });
            if workflow.prompt(&name).is_some() {
                tracing::warn!("prompt {} already exists, skipping create", name);
                return false;
            }
            let Ok(prompt) = merge_entity(&WorkflowPrompt::blank(&name), &changes) else {
                tracing::warn!("could not build prompt {} from changes", name);
                return false;
            };
            workflow.prompts.push(prompt);
            if select {
                state.selection = Some(Selection::Prompt(name));
            }
            true
        }
        WorkflowCommand::AddPipeline {
            changes,
            default_model,
        } => {
            let name = changed_name(&changes).unwrap_or_else(|| "New pipeline".to_owned());
            if workflow.pipeline(&name).is_some() {
                tracing::warn!("pipeline {} already exists, skipping create", name);
                return false;
            }
            let blank = WorkflowPipeline {
                name: name.clone(),
                description: String::new(),
                agents: Vec::new(),
            };
            let Ok(mut pipeline) = merge_entity(&blank, &changes) else {
                tracing::warn!("could not build pipeline {} from changes", name);
                return false;
            };
            let model = default_model.as_deref().unwrap_or(FALLBACK_MODEL);

            if pipeline.agents.is_empty() {
                // Never leave a pipeline with zero steps.
                let step = WorkflowAgent::pipeline_placeholder(&name, model);
                pipeline.agents.push(step.name.clone());
                workflow.agents.push(step);
            } else {
                for member in &pipeline.agents {
                    if workflow.agent(member).is_none() {
                        workflow
                            .agents
                            .push(WorkflowAgent::pipeline_step(member, &name, model));
                    }
                }
            }
            state.selection = pipeline.agents.first().cloned().map(Selection::Agent);
            workflow.pipelines.push(pipeline);
            true
        }
        WorkflowCommand::UpdateAgent {
            name,
            changes,
            select,
        } => {
            let Some(index) = workflow.agents.iter().position(|a| a.name == name) else {
                return false;
            };
            let Ok(merged) = merge_entity(&workflow.agents[index], &changes) else {
                tracing::warn!("could not merge changes into agent {}", name);
                return false;
            };
            let new_name = merged.name.clone();
            workflow.agents[index] = merged;
            if new_name != name {
                workflow.rename_agent_references(&name, &new_name);
                if state.selection == Some(Selection::Agent(name.clone())) {
                    state.selection = Some(Selection::Agent(new_name.clone()));
                }
            }
            if select {
                state.selection = Some(Selection::Agent(new_name));
            }
            true
        }
        WorkflowCommand::UpdateTool {
            name,
            changes,
            select,
        } => {
            let Some(index) = workflow.tools.iter().position(|t| t.name == name) else {
                return false;
            };
            let Ok(merged) = merge_entity(&workflow.tools[index], &changes) else {
                tracing::warn!("could not merge changes into tool {}", name);
                return false;
            };
            let new_name = merged.name.clone();
            workflow.tools[index] = merged;
            if new_name != name {
                workflow.rename_tool_references(&name, &new_name);
                if state.selection == Some(Selection::Tool(name.clone())) {
                    state.selection = Some(Selection::Tool(new_name.clone()));
                }
            }
            if select {
                state.selection = Some(Selection::Tool(new_name));
            }
            true
        }
        WorkflowCommand::UpdatePrompt {
            name,
            changes,
            select,
        } => {
            let Some(index) = workflow.prompts.iter().position(|p| p.name == name) else {
                return false;
            };
            let Ok(merged) = merge_entity(&workflow.prompts[index], &changes) else {
                tracing::warn!("could not merge changes into prompt {}", name);
                return false;
            };
            let new_name = merged.name.clone();
            workflow.prompts[index] = merged;
            if new_name != name {
                workflow.rename_prompt_references(&name, &new_name);
                if state.selection == Some(Selection::Prompt(name.clone())) {
                    state.selection = Some(Selection::Prompt(new_name.clone()));
                }
            }
            if select {
                state.selection = Some(Selection::Prompt(new_name));
            }
            true
        }
        WorkflowCommand::UpdatePipeline { name, changes } => {
            let Some(index) = workflow.pipelines.iter().position(|p| p.name == name) else {
                return false;
            };
            let Ok(merged) = merge_entity(&workflow.pipelines[index], &changes) else {
                tracing::warn!("could not merge changes into pipeline {}", name);
                return false;
            };
            workflow.pipelines[index] = merged;
            true
        }
        WorkflowCommand::DeleteAgent { name } => {
            let before = workflow.agents.len();
            workflow.agents.retain(|a| a.name != name);
            if workflow.agents.len() == before {
                return false;
            }
            workflow.scrub_agent_references(&name);
            state.selection = None;
            true
        }
        WorkflowCommand::DeleteTool { name } => {
            let before = workflow.tools.len();
            workflow.tools.retain(|t| t.name != name);
            if workflow.tools.len() == before {
                return false;
            }
            workflow.scrub_tool_references(&name);
            state.selection = None;
            true
        }
        WorkflowCommand::DeletePrompt { name } => {
            let before = workflow.prompts.len();
            workflow.prompts.retain(|p| p.name != name);
            if workflow.prompts.len() == before {
                return false;
            }
            workflow.scrub_prompt_references(&name);
            state.selection = None;
            true
        }
        WorkflowCommand::DeletePipeline { name } => {
            let Some(pipeline) = workflow.pipeline(&name) else {
                return false;
            };
            // Pipeline steps belong to the pipeline; deleting it deletes them
            // and scrubs every reference to them.
            let members = pipeline.agents.clone();
            workflow.agents.retain(|a| !members.contains(&a.name));
            workflow.pipelines.retain(|p| p.name != name);
            for member in &members {
                workflow.scrub_agent_references(member);
            }
            state.selection = None;
            true
        }
        WorkflowCommand::ToggleAgent { name } => {
            let Some(agent) = workflow.agents.iter_mut().find(|a| a.name == name) else {
                return false;
            };
            agent.disabled = !agent.disabled;
            true
        }
        WorkflowCommand::SetMainAgent { name } => {
            if workflow.start_agent == name {
                return false;
            }
            workflow.start_agent = name;
            true
        }
        WorkflowCommand::ReorderAgents { agents } => {
            workflow.agents = agents;
            true
        }
        WorkflowCommand::ReorderPipelines { pipelines } => {
            workflow.pipelines = pipelines;
            true
        }
        _ => unreachable!("session command routed to structural applier"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn store_with_agents(names: &[&str]) -> WorkflowStore {
        let workflow = Workflow {
            agents: names.iter().map(|n| WorkflowAgent::blank(*n)).collect(),
            start_agent: names.first().map(|n| (*n).to_owned()).unwrap_or_default(),
            ..Workflow::default()
        };
        WorkflowStore::new(workflow, false)
    }

    #[test]
    fn undo_redo_round_trip_is_bit_for_bit() {
        let mut store = store_with_agents(&["Hub"]);
        let dispatches = [
            WorkflowCommand::AddAgent {
                changes: changes(&[("name", Value::String("Router".into()))]),
            },
            WorkflowCommand::UpdateAgent {
                name: "Router".into(),
                changes: changes(&[("model", Value::String("gpt-4.1".into()))]),
                select: false,
            },
            WorkflowCommand::DeleteAgent { name: "Hub".into() },
        ];
        for cmd in dispatches {
            assert!(store.dispatch(cmd));
        }
        let after = store.present().clone();

        for _ in 0..3 {
            store.undo();
        }
        assert_eq!(store.workflow().agents.len(), 1);
        assert_eq!(store.workflow().agents[0].name, "Hub");
        for _ in 0..3 {
            store.redo();
        }
        assert_eq!(store.present(), &after);
    }

    #[test]
    fn undo_and_redo_are_no_ops_at_the_ends() {
        let mut store = store_with_agents(&["Hub"]);
        store.undo();
        assert_eq!(store.workflow().agents.len(), 1);
        store.redo();
        assert_eq!(store.workflow().agents.len(), 1);
    }

    #[test]
    fn dispatch_truncates_redo_tail() {
        let mut store = store_with_agents(&[]);
        store.dispatch(WorkflowCommand::AddAgent {
            changes: changes(&[("name", Value::String("A".into()))]),
        });
        store.dispatch(WorkflowCommand::AddAgent {
            changes: changes(&[("name", Value::String("B".into()))]),
        });
        store.undo();
        store.dispatch(WorkflowCommand::AddAgent {
            changes: changes(&[("name", Value::String("C".into()))]),
        });
        assert!(!store.can_redo());
        let names: Vec<_> = store.workflow().agents.iter().map(|a| &a.name).collect();
        assert_eq!(names, ["A", "C"]);
    }

    #[test]
    fn structural_dispatch_in_live_mode_forks_to_draft_first() {
        let mut store = WorkflowStore::new(Workflow::default(), true);
        assert!(store.present().is_live);

        store.dispatch(WorkflowCommand::AddAgent { changes: Map::new() });

        assert!(!store.present().is_live);
        assert!(store.present().mode_change_notice);
        // The inverse patch still remembers live mode, so undo restores it.
        store.undo();
        assert!(store.present().is_live);
    }

    #[test]
    fn session_commands_do_not_join_history() {
        let mut store = store_with_agents(&["Hub"]);
        store.dispatch(WorkflowCommand::Select {
            selection: Selection::Agent("Hub".into()),
        });
        store.dispatch(WorkflowCommand::SetPublishing { publishing: true });
        assert!(!store.can_undo());
    }

    #[test]
    fn failed_structural_command_records_nothing() {
        let mut store = store_with_agents(&["Hub"]);
        let ok = store.dispatch(WorkflowCommand::DeleteAgent {
            name: "Missing".into(),
        });
        assert!(!ok);
        assert!(!store.can_undo());
    }

    #[test]
    fn add_agent_generates_unique_default_names() {
        let mut store = store_with_agents(&[]);
        store.dispatch(WorkflowCommand::AddAgent { changes: Map::new() });
        store.dispatch(WorkflowCommand::AddAgent { changes: Map::new() });
        let names: Vec<_> = store.workflow().agents.iter().map(|a| &a.name).collect();
        assert_eq!(names, ["New agent", "New agent 2"]);
    }

    #[test]
    fn add_pipeline_without_agents_creates_placeholder_step() {
        let mut store = store_with_agents(&[]);
        store.dispatch(WorkflowCommand::AddPipeline {
            changes: changes(&[("name", Value::String("Onboarding".into()))]),
            default_model: Some("gpt-4.1".into()),
        });

        let pipeline = store.workflow().pipeline("Onboarding").unwrap();
        assert_eq!(pipeline.agents, vec!["Onboarding Step 1".to_owned()]);
        let step = store.workflow().agent("Onboarding Step 1").unwrap();
        assert_eq!(step.kind, crate::workflow::AgentKind::Pipeline);
        assert_eq!(step.model, "gpt-4.1");
    }

    #[test]
    fn add_pipeline_auto_creates_missing_members() {
        let mut store = store_with_agents(&["Existing"]);
        store.dispatch(WorkflowCommand::AddPipeline {
            changes: changes(&[
                ("name", Value::String("Flow".into())),
                (
                    "agents",
                    serde_json::json!(["Existing", "Brand New"]),
                ),
            ]),
            default_model: None,
        });

        assert_eq!(store.workflow().agents.len(), 2);
        let created = store.workflow().agent("Brand New").unwrap();
        assert_eq!(created.control_type, crate::workflow::ControlType::RelinquishToParent);
    }

    #[test]
    fn delete_pipeline_cascades_to_member_agents() {
        let mut store = store_with_agents(&["Keep"]);
        store.dispatch(WorkflowCommand::AddPipeline {
            changes: changes(&[
                ("name", Value::String("Flow".into())),
                ("agents", serde_json::json!(["Step A", "Step B"])),
            ]),
            default_model: None,
        });
        store.dispatch(WorkflowCommand::SetMainAgent {
            name: "Step A".into(),
        });

        store.dispatch(WorkflowCommand::DeletePipeline { name: "Flow".into() });

        assert!(store.workflow().pipeline("Flow").is_none());
        assert!(store.workflow().agent("Step A").is_none());
        assert!(store.workflow().agent("Step B").is_none());
        assert_eq!(store.workflow().start_agent, "Keep");
    }

    #[test]
    fn rename_via_update_propagates_everywhere() {
        let mut store = store_with_agents(&["Hub", "Greeter"]);
        store.dispatch(WorkflowCommand::UpdateAgent {
            name: "Greeter".into(),
            changes: changes(&[(
                "instructions",
                Value::String(format!("Defer to {}", crate::workflow::agent_mention("Hub"))),
            )]),
            select: false,
        });

        store.dispatch(WorkflowCommand::UpdateAgent {
            name: "Hub".into(),
            changes: changes(&[("name", Value::String("Router".into()))]),
            select: false,
        });

        assert!(store.workflow().agent("Router").is_some());
        assert!(
            store
                .workflow()
                .agent("Greeter")
                .unwrap()
                .instructions
                .contains("[@agent:Router](#mention)")
        );
        assert_eq!(store.workflow().start_agent, "Router");
    }

    #[test]
    fn restore_clears_history() {
        let mut store = store_with_agents(&[]);
        store.dispatch(WorkflowCommand::AddAgent { changes: Map::new() });
        assert!(store.can_undo());

        store.restore(WorkflowState::new(Workflow::default(), true));
        assert!(!store.can_undo());
        assert!(!store.can_redo());
        assert!(store.present().is_live);
    }
}
