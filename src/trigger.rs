//! Triggers live in three independent remote subsystems and are only ever
//! observed locally. This module holds the projected tagged union the
//! reconciler works against, the pure projection over the three raw item
//! lists, and the object-safe service traits the reconciler calls through.

use chrono::DateTime;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// How many items the copilot snapshot pulls from each subsystem.
pub const DEFAULT_TRIGGER_FETCH_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum TriggerServiceError {
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("trigger not found: {0}")]
    NotFound(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub role: String,
    pub content: String,
}

/// Conversation payload a trigger injects when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInput {
    pub messages: Vec<TriggerMessage>,
}

impl TriggerInput {
    /// Substituted when a remote item carries no input of its own.
    pub fn placeholder() -> Self {
        Self {
            messages: vec![TriggerMessage {
                role: "user".to_owned(),
                content: "Trigger execution".to_owned(),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Triggered,
}

/// Raw one-time job as the scheduling subsystem reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeJob {
    pub id: String,
    pub next_run_at: String,
    pub status: JobStatus,
    #[serde(default)]
    pub input: Option<TriggerInput>,
}

/// Raw recurring job as the scheduling subsystem reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringJob {
    pub id: String,
    pub cron: String,
    #[serde(default)]
    pub next_run_at: Option<String>,
    pub disabled: bool,
    #[serde(default)]
    pub input: Option<TriggerInput>,
}

/// Raw third-party trigger deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDeployment {
    pub id: String,
    pub trigger_type_name: String,
    pub toolkit_slug: String,
    pub trigger_type_slug: String,
    #[serde(default)]
    pub trigger_config: Map<String, Value>,
}

/// The projected trigger list the reconciler and the copilot context consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    #[serde(rename_all = "camelCase")]
    OneTime {
        id: String,
        name: String,
        next_run_at: String,
        status: JobStatus,
        input: TriggerInput,
    },
    #[serde(rename_all = "camelCase")]
    Recurring {
        id: String,
        name: String,
        cron: String,
        next_run_at: String,
        disabled: bool,
        input: TriggerInput,
    },
    #[serde(rename_all = "camelCase")]
    External {
        id: String,
        name: String,
        trigger_type_name: String,
        toolkit_slug: String,
        trigger_type_slug: String,
        trigger_config: Map<String, Value>,
    },
}

impl Trigger {
    pub fn id(&self) -> &str {
        match self {
            Self::OneTime { id, .. } | Self::Recurring { id, .. } | Self::External { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::OneTime { name, .. }
            | Self::Recurring { name, .. }
            | Self::External { name, .. } => name,
        }
    }
}

fn format_run_date(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.format("%-m/%-d/%Y").to_string(),
        Err(_) => raw.to_owned(),
    }
}

/// Pure projection of the three raw item lists into the tagged union. Display
/// names are derived here; the raw subsystems do not name their items.
pub fn project_triggers(
    one_time: &[OneTimeJob],
    recurring: &[RecurringJob],
    external: &[ExternalDeployment],
) -> Vec<Trigger> {
    let mut projected = Vec::with_capacity(one_time.len() + recurring.len() + external.len());

    for job in one_time {
        projected.push(Trigger::OneTime {
            id: job.id.clone(),
            name: format!("One-time trigger ({})", format_run_date(&job.next_run_at)),
            next_run_at: job.next_run_at.clone(),
            status: job.status,
            input: job.input.clone().unwrap_or_else(TriggerInput::placeholder),
        });
    }
    for job in recurring {
        projected.push(Trigger::Recurring {
            id: job.id.clone(),
            name: format!("Recurring trigger ({})", job.cron),
            cron: job.cron.clone(),
            next_run_at: job.next_run_at.clone().unwrap_or_default(),
            disabled: job.disabled,
            input: job.input.clone().unwrap_or_else(TriggerInput::placeholder),
        });
    }
    for deployment in external {
        projected.push(Trigger::External {
            id: deployment.id.clone(),
            name: deployment.trigger_type_name.clone(),
            trigger_type_name: deployment.trigger_type_name.clone(),
            toolkit_slug: deployment.toolkit_slug.clone(),
            trigger_type_slug: deployment.trigger_type_slug.clone(),
            trigger_config: deployment.trigger_config.clone(),
        });
    }

    projected
}

/// Fields required to create or overwrite a one-time job.
#[derive(Debug, Clone, PartialEq)]
pub struct OneTimeJobSpec {
    pub scheduled_time: String,
    pub input: TriggerInput,
}

/// Fields required to create or overwrite a recurring job.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJobSpec {
    pub cron: String,
    pub input: TriggerInput,
}

#[cfg_attr(test, mockall::automock)]
pub trait OneTimeTriggerService: Send + Sync {
    fn create(
        &self,
        spec: OneTimeJobSpec,
    ) -> BoxFuture<'static, Result<String, TriggerServiceError>>;
    fn update(
        &self,
        id: String,
        spec: OneTimeJobSpec,
    ) -> BoxFuture<'static, Result<(), TriggerServiceError>>;
    fn delete(&self, id: String) -> BoxFuture<'static, Result<(), TriggerServiceError>>;
    fn fetch(
        &self,
        id: String,
    ) -> BoxFuture<'static, Result<Option<OneTimeJob>, TriggerServiceError>>;
    fn list(
        &self,
        limit: usize,
    ) -> BoxFuture<'static, Result<Vec<OneTimeJob>, TriggerServiceError>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait RecurringTriggerService: Send + Sync {
    fn create(
        &self,
        spec: RecurringJobSpec,
    ) -> BoxFuture<'static, Result<String, TriggerServiceError>>;
    /// Returns the rule as it stands after the update, so callers can
    /// reconcile flags the update call does not carry.
    fn update(
        &self,
        id: String,
        spec: RecurringJobSpec,
    ) -> BoxFuture<'static, Result<RecurringJob, TriggerServiceError>>;
    fn toggle(
        &self,
        id: String,
        disabled: bool,
    ) -> BoxFuture<'static, Result<(), TriggerServiceError>>;
    fn delete(&self, id: String) -> BoxFuture<'static, Result<(), TriggerServiceError>>;
    fn fetch(
        &self,
        id: String,
    ) -> BoxFuture<'static, Result<Option<RecurringJob>, TriggerServiceError>>;
    fn list(
        &self,
        limit: usize,
    ) -> BoxFuture<'static, Result<Vec<RecurringJob>, TriggerServiceError>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ExternalTriggerService: Send + Sync {
    fn list(
        &self,
        limit: usize,
    ) -> BoxFuture<'static, Result<Vec<ExternalDeployment>, TriggerServiceError>>;
    fn delete(&self, deployment_id: String)
    -> BoxFuture<'static, Result<(), TriggerServiceError>>;
}

/// Hand-off payload for the interactive external-trigger setup flow. The
/// action index plus tracker epoch is the resumption key: the host confirms
/// completion through the orchestrator, which only commits if the epoch still
/// matches.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalSetupRequest {
    pub action_index: usize,
    pub epoch: u64,
    pub toolkit_slug: Option<String>,
    pub trigger_type_slug: Option<String>,
    pub config: Option<Map<String, Value>>,
}

#[cfg_attr(test, mockall::automock)]
pub trait ExternalSetupFlow: Send + Sync {
    fn request_setup(&self, request: ExternalSetupRequest);
}
