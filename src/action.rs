//! Protocol types shared by the stream parser, validator and appliers. One
//! `CopilotAction` is a single parsed mutation instruction; it is addressed by
//! its block index within a streamed message, never by entity name, because
//! the same name may legally appear in several actions of one message
//! (delete followed by create_new is the rename/replace pattern).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed error attached to `edit` actions on external triggers. Delete plus
/// create is the only supported mutation path for those.
pub const EXTERNAL_TRIGGER_EDIT_ERROR: &str =
    "Editing external triggers is not supported. Delete the trigger and create a new one instead.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    Tool,
    Agent,
    Prompt,
    Pipeline,
    StartAgent,
    OneTimeTrigger,
    RecurringTrigger,
    ExternalTrigger,
}

impl ConfigType {
    /// Trigger kinds live in remote subsystems; everything else is applied to
    /// the local workflow aggregate.
    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            Self::OneTimeTrigger | Self::RecurringTrigger | Self::ExternalTrigger
        )
    }
}

impl FromStr for ConfigType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(Self::Tool),
            "agent" => Ok(Self::Agent),
            "prompt" => Ok(Self::Prompt),
            "pipeline" => Ok(Self::Pipeline),
            "start_agent" => Ok(Self::StartAgent),
            "one_time_trigger" => Ok(Self::OneTimeTrigger),
            "recurring_trigger" => Ok(Self::RecurringTrigger),
            "external_trigger" => Ok(Self::ExternalTrigger),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOp {
    CreateNew,
    Edit,
    Delete,
}

impl FromStr for ActionOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_new" => Ok(Self::CreateNew),
            "edit" => Ok(Self::Edit),
            "delete" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// One finalized mutation instruction from the copilot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopilotAction {
    #[serde(rename = "action")]
    pub op: ActionOp,
    pub config_type: ConfigType,
    pub name: String,
    #[serde(default)]
    pub change_description: String,
    #[serde(default)]
    pub config_changes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CopilotAction {
    /// Key under which a staged delete waits for its replacing create_new.
    pub fn replacement_key(&self) -> (ConfigType, String) {
        (self.config_type, self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_type_round_trips_through_strings() {
        for raw in [
            "tool",
            "agent",
            "prompt",
            "pipeline",
            "start_agent",
            "one_time_trigger",
            "recurring_trigger",
            "external_trigger",
        ] {
            let parsed: ConfigType = raw.parse().unwrap();
            assert_eq!(serde_json::to_value(parsed).unwrap(), raw);
        }
        assert!("nonsense".parse::<ConfigType>().is_err());
    }

    #[test]
    fn trigger_kinds_are_classified() {
        assert!(ConfigType::OneTimeTrigger.is_trigger());
        assert!(ConfigType::ExternalTrigger.is_trigger());
        assert!(!ConfigType::Agent.is_trigger());
        assert!(!ConfigType::StartAgent.is_trigger());
    }
}
