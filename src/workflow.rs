//! The workflow aggregate: agents, tools, prompts, pipelines and the start
//! agent pointer. Entities are mutated through named field-merge patches, so
//! every type here is a plain serde struct that can round-trip through
//! `serde_json::Value`.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Conversation,
    Pipeline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputVisibility {
    UserFacing,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    Retain,
    RelinquishToParent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    BasePrompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAgent {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentKind,
    pub description: String,
    pub disabled: bool,
    pub instructions: String,
    pub model: String,
    pub locked: bool,
    pub toggle_able: bool,
    pub output_visibility: OutputVisibility,
    pub control_type: ControlType,
}

impl WorkflowAgent {
    /// A blank conversation agent, matching the editor's "add agent" defaults.
    pub fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AgentKind::Conversation,
            description: String::new(),
            disabled: false,
            instructions: String::new(),
            model: String::new(),
            locked: false,
            toggle_able: true,
            output_visibility: OutputVisibility::UserFacing,
            control_type: ControlType::Retain,
        }
    }

    /// The placeholder first step created when a pipeline is added with no
    /// agents, so no pipeline is ever left with zero steps.
    pub fn pipeline_placeholder(pipeline: &str, model: &str) -> Self {
        Self {
            name: format!("{pipeline} Step 1"),
            kind: AgentKind::Pipeline,
            description: format!("Default agent for {pipeline} pipeline"),
            instructions: format!(
                "You are the first step in the {pipeline} pipeline. Focus on your specific role."
            ),
            model: model.to_owned(),
            output_visibility: OutputVisibility::Internal,
            control_type: ControlType::RelinquishToParent,
            ..Self::blank(String::new())
        }
    }

    /// A minimal step agent auto-created for a pipeline member referenced by
    /// name before it exists.
    pub fn pipeline_step(name: &str, pipeline: &str, model: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: AgentKind::Pipeline,
            description: format!("Agent for {pipeline} pipeline"),
            instructions: format!(
                "You are part of the {pipeline} pipeline. Focus on your specific role."
            ),
            model: model.to_owned(),
            output_visibility: OutputVisibility::Internal,
            control_type: ControlType::RelinquishToParent,
            ..Self::blank(String::new())
        }
    }
}

fn default_tool_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": [],
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTool {
    pub name: String,
    pub description: String,
    #[serde(default = "default_tool_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub mock_tool: bool,
}

impl WorkflowTool {
    pub fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: default_tool_parameters(),
            mock_tool: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPrompt {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PromptKind,
    pub prompt: String,
}

impl WorkflowPrompt {
    pub fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PromptKind::BasePrompt,
            prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agents: Vec<String>,
}

/// Reference marker syntax used inside instruction and prompt text.
pub fn agent_mention(name: &str) -> String {
    format!("[@agent:{name}](#mention)")
}

pub fn tool_mention(name: &str) -> String {
    format!("[@tool:{name}](#mention)")
}

pub fn prompt_mention(name: &str) -> String {
    format!("[@prompt:{name}](#mention)")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub agents: Vec<WorkflowAgent>,
    #[serde(default)]
    pub tools: Vec<WorkflowTool>,
    #[serde(default)]
    pub prompts: Vec<WorkflowPrompt>,
    #[serde(default)]
    pub pipelines: Vec<WorkflowPipeline>,
    #[serde(default)]
    pub start_agent: String,
}

impl Workflow {
    pub fn agent(&self, name: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&WorkflowTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn prompt(&self, name: &str) -> Option<&WorkflowPrompt> {
        self.prompts.iter().find(|p| p.name == name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&WorkflowPipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Rewrite every `[@agent:old]` marker, pipeline membership entry and the
    /// start agent pointer to the new name.
    pub fn rename_agent_references(&mut self, old: &str, new: &str) {
        let from = agent_mention(old);
        let to = agent_mention(new);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&from, &to);
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&from, &to);
        }
        for pipeline in &mut self.pipelines {
            for member in &mut pipeline.agents {
                if member == old {
                    *member = new.to_owned();
                }
            }
        }
        if self.start_agent == old {
            self.start_agent = new.to_owned();
        }
    }

    pub fn rename_tool_references(&mut self, old: &str, new: &str) {
        let from = tool_mention(old);
        let to = tool_mention(new);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&from, &to);
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&from, &to);
        }
    }

    pub fn rename_prompt_references(&mut self, old: &str, new: &str) {
        let from = prompt_mention(old);
        let to = prompt_mention(new);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&from, &to);
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&from, &to);
        }
    }

    /// Remove every `[@agent:name]` marker from instruction and prompt text,
    /// drop the name from pipeline membership lists and repoint the start
    /// agent if it referenced the deleted agent.
    pub fn scrub_agent_references(&mut self, name: &str) {
        let marker = agent_mention(name);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&marker, "");
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&marker, "");
        }
        for pipeline in &mut self.pipelines {
            pipeline.agents.retain(|member| member != name);
        }
        if self.start_agent == name {
            self.start_agent = self
                .agents
                .first()
                .map(|a| a.name.clone())
                .unwrap_or_default();
        }
    }

    pub fn scrub_tool_references(&mut self, name: &str) {
        let marker = tool_mention(name);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&marker, "");
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&marker, "");
        }
    }

    pub fn scrub_prompt_references(&mut self, name: &str) {
        let marker = prompt_mention(name);
        for agent in &mut self.agents {
            agent.instructions = agent.instructions.replace(&marker, "");
        }
        for prompt in &mut self.prompts {
            prompt.prompt = prompt.prompt.replace(&marker, "");
        }
    }
}

/// Field-merge an entity with a validated partial update: serialize, overlay
/// the changed keys, deserialize back. Keys the entity does not know are
/// dropped by serde.
pub fn merge_entity<T>(entity: &T, changes: &Map<String, Value>) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(fields) = &mut value {
        for (key, change) in changes {
            fields.insert(key.clone(), change.clone());
        }
    }
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_entity_overlays_fields() {
        let agent = WorkflowAgent::blank("Hub");
        let mut changes = Map::new();
        changes.insert("model".into(), Value::String("gpt-4.1".into()));
        changes.insert("disabled".into(), Value::Bool(true));

        let merged = merge_entity(&agent, &changes).unwrap();
        assert_eq!(merged.model, "gpt-4.1");
        assert!(merged.disabled);
        assert_eq!(merged.name, "Hub");
    }

    #[test]
    fn rename_agent_updates_all_reference_sites() {
        let mut workflow = Workflow {
            agents: vec![WorkflowAgent::blank("Hub"), {
                let mut greeter = WorkflowAgent::blank("Greeter");
                greeter.instructions = format!("Hand off to {}", agent_mention("Hub"));
                greeter
            }],
            prompts: vec![{
                let mut p = WorkflowPrompt::blank("Intro");
                p.prompt = format!("Mention {}", agent_mention("Hub"));
                p
            }],
            pipelines: vec![WorkflowPipeline {
                name: "Onboarding".into(),
                description: String::new(),
                agents: vec!["Hub".into(), "Greeter".into()],
            }],
            start_agent: "Hub".into(),
            ..Workflow::default()
        };

        workflow.rename_agent_references("Hub", "Router");

        assert!(
            workflow.agents[1]
                .instructions
                .contains("[@agent:Router](#mention)")
        );
        assert!(workflow.prompts[0].prompt.contains("[@agent:Router](#mention)"));
        assert_eq!(workflow.pipelines[0].agents[0], "Router");
        assert_eq!(workflow.start_agent, "Router");
    }

    #[test]
    fn scrub_agent_removes_markers_and_repoints_start() {
        let mut workflow = Workflow {
            agents: vec![WorkflowAgent::blank("Survivor"), {
                let mut a = WorkflowAgent::blank("Other");
                a.instructions = format!("See {}", agent_mention("Gone"));
                a
            }],
            pipelines: vec![WorkflowPipeline {
                name: "Flow".into(),
                description: String::new(),
                agents: vec!["Gone".into(), "Survivor".into()],
            }],
            start_agent: "Gone".into(),
            ..Workflow::default()
        };

        workflow.scrub_agent_references("Gone");

        assert!(!workflow.agents[1].instructions.contains("Gone"));
        assert_eq!(workflow.pipelines[0].agents, vec!["Survivor".to_owned()]);
        assert_eq!(workflow.start_agent, "Survivor");
    }
}
