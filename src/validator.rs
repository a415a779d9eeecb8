//! Per-kind validation of raw `config_changes`. Validation never fails a
//! whole block: each candidate field is spliced into a known-good probe
//! entity and type-checked in isolation; fields that do not fit are discarded
//! (logged at debug), so downstream appliers always receive a flat merge
//! patch of well-typed fields.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::action::ConfigType;
use crate::workflow::{WorkflowAgent, WorkflowPipeline, WorkflowPrompt, WorkflowTool};

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid { changes: Map<String, Value> },
    Invalid { error: String },
}

/// Seam for per-entity-kind shape validation.
pub trait SchemaRegistry: Send + Sync {
    fn validate(
        &self,
        config_type: ConfigType,
        changes: &Map<String, Value>,
        name: &str,
    ) -> Validation;
}

/// Default registry backed by the workflow entity types themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowSchemaRegistry;

impl WorkflowSchemaRegistry {
    fn check_fields<T>(
        probe: &T,
        changes: &Map<String, Value>,
        kind: &str,
        name: &str,
    ) -> Validation
    where
        T: Serialize + DeserializeOwned,
    {
        let probe_value = match serde_json::to_value(probe) {
            Ok(Value::Object(fields)) => fields,
            _ => return Validation::Valid { changes: changes.clone() },
        };

        let mut validated = changes.clone();
        for (key, value) in changes {
            let mut candidate = probe_value.clone();
            candidate.insert(key.clone(), value.clone());
            if serde_json::from_value::<T>(Value::Object(candidate)).is_err() {
                tracing::debug!("discarding field {} from {}: {}", key, kind, name);
                validated.remove(key);
            }
        }
        Validation::Valid { changes: validated }
    }
}

impl SchemaRegistry for WorkflowSchemaRegistry {
    fn validate(
        &self,
        config_type: ConfigType,
        changes: &Map<String, Value>,
        name: &str,
    ) -> Validation {
        match config_type {
            ConfigType::Agent => {
                Self::check_fields(&WorkflowAgent::blank("test"), changes, "agent", name)
            }
            ConfigType::Tool => {
                Self::check_fields(&WorkflowTool::blank("test"), changes, "tool", name)
            }
            ConfigType::Prompt => {
                Self::check_fields(&WorkflowPrompt::blank("test"), changes, "prompt", name)
            }
            ConfigType::Pipeline => {
                let probe = WorkflowPipeline {
                    name: "test".into(),
                    description: "test".into(),
                    agents: Vec::new(),
                };
                Self::check_fields(&probe, changes, "pipeline", name)
            }
            // The name itself is the payload; nothing to shape-check.
            ConfigType::StartAgent => Validation::Valid { changes: changes.clone() },
            // Trigger payloads are checked by the reconciler, which knows the
            // per-kind mandatory fields.
            ConfigType::OneTimeTrigger
            | ConfigType::RecurringTrigger
            | ConfigType::ExternalTrigger => Validation::Valid { changes: changes.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WorkflowSchemaRegistry {
        WorkflowSchemaRegistry
    }

    #[test]
    fn keeps_well_typed_agent_fields() {
        let changes = serde_json::json!({
            "instructions": "Route requests",
            "model": "gpt-4.1",
            "disabled": false,
        });
        let Value::Object(changes) = changes else { unreachable!() };

        match registry().validate(ConfigType::Agent, &changes, "Router") {
            Validation::Valid { changes } => {
                assert_eq!(changes.len(), 3);
                assert_eq!(changes["model"], "gpt-4.1");
            }
            Validation::Invalid { error } => panic!("unexpected rejection: {error}"),
        }
    }

    #[test]
    fn discards_fields_with_wrong_types() {
        let changes = serde_json::json!({
            "instructions": "ok",
            "disabled": "not-a-bool",
            "outputVisibility": "sideways",
        });
        let Value::Object(changes) = changes else { unreachable!() };

        match registry().validate(ConfigType::Agent, &changes, "Router") {
            Validation::Valid { changes } => {
                assert!(changes.contains_key("instructions"));
                assert!(!changes.contains_key("disabled"));
                assert!(!changes.contains_key("outputVisibility"));
            }
            Validation::Invalid { error } => panic!("unexpected rejection: {error}"),
        }
    }

    #[test]
    fn trigger_changes_pass_through_untouched() {
        let changes = serde_json::json!({
            "cron": "0 9 * * *",
            "input": { "messages": [] },
        });
        let Value::Object(changes) = changes else { unreachable!() };

        match registry().validate(ConfigType::RecurringTrigger, &changes, "Daily") {
            Validation::Valid { changes: validated } => assert_eq!(validated, changes),
            Validation::Invalid { error } => panic!("unexpected rejection: {error}"),
        }
    }
}
