//! Reconciles trigger actions against the three remote trigger subsystems.
//!
//! The interesting part is deferred replacement: the copilot expresses "change
//! this trigger" as a delete followed by a create_new with the same name.
//! Issuing both remotely would drop and recreate the item, losing its id and
//! its position in the scheduler. Instead a delete whose replacing create_new
//! is still upcoming in the same batch is staged in a pending cache, and the
//! create_new that finds a staged entry collapses the pair into a single
//! remote update.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::action::{ActionOp, ConfigType, CopilotAction};
use crate::trigger::{
    ExternalSetupRequest, ExternalSetupFlow, ExternalTriggerService, OneTimeJobSpec,
    OneTimeTriggerService, RecurringJobSpec, RecurringTriggerService, Trigger, TriggerInput,
    TriggerServiceError, project_triggers,
};

pub struct TriggerReconciler {
    one_time: Arc<dyn OneTimeTriggerService>,
    recurring: Arc<dyn RecurringTriggerService>,
    external: Arc<dyn ExternalTriggerService>,
    setup_flow: Arc<dyn ExternalSetupFlow>,
    pending: DashMap<(ConfigType, String), Trigger>,
}

impl TriggerReconciler {
    pub fn new(
        one_time: Arc<dyn OneTimeTriggerService>,
        recurring: Arc<dyn RecurringTriggerService>,
        external: Arc<dyn ExternalTriggerService>,
        setup_flow: Arc<dyn ExternalSetupFlow>,
    ) -> Self {
        Self {
            one_time,
            recurring,
            external,
            setup_flow,
            pending: DashMap::new(),
        }
    }

    /// Drop all staged replacements.
    pub fn clear_pending(&self) {
        self.pending.clear();
    }

    /// Snapshot of a staged delete, without consuming it. The guard is
    /// released before any await point.
    fn staged_entry(&self, key: &(ConfigType, String)) -> Option<Trigger> {
        self.pending.get(key).map(|entry| entry.value().clone())
    }

    /// Fetch and project the current remote trigger list.
    pub async fn snapshot(&self, limit: usize) -> Result<Vec<Trigger>, TriggerServiceError> {
        let (one_time, recurring, external) = futures::try_join!(
            self.one_time.list(limit),
            self.recurring.list(limit),
            self.external.list(limit),
        )?;
        Ok(project_triggers(&one_time, &recurring, &external))
    }

    /// Apply one trigger action. `triggers` is the projected snapshot used to
    /// resolve display names to ids; `upcoming` holds the not-yet-applied
    /// actions after this one, consulted for the replacement lookahead.
    /// Returns whether the action counts as applied. Remote failures are
    /// logged and reported as not applied; they never abort the batch.
    pub async fn apply(
        &self,
        action: &CopilotAction,
        action_index: usize,
        epoch: u64,
        triggers: &[Trigger],
        upcoming: &[CopilotAction],
    ) -> bool {
        match action.config_type {
            ConfigType::OneTimeTrigger => self.apply_one_time(action, triggers, upcoming).await,
            ConfigType::RecurringTrigger => self.apply_recurring(action, triggers, upcoming).await,
            ConfigType::ExternalTrigger => {
                self.apply_external(action, action_index, epoch, triggers).await
            }
            other => {
                tracing::warn!(config_type = ?other, "non-trigger action routed to reconciler");
                false
            }
        }
    }

    async fn apply_one_time(
        &self,
        action: &CopilotAction,
        triggers: &[Trigger],
        upcoming: &[CopilotAction],
    ) -> bool {
        let changes = &action.config_changes;
        match action.op {
            ActionOp::CreateNew => {
                let key = action.replacement_key();
                if let Some(staged) = self.staged_entry(&key) {
                    let Trigger::OneTime {
                        id,
                        next_run_at,
                        input,
                        ..
                    } = staged
                    else {
                        tracing::warn!(name = %action.name, "staged replacement has wrong kind");
                        return false;
                    };
                    let spec = OneTimeJobSpec {
                        scheduled_time: string_field(changes, "scheduledTime")
                            .unwrap_or(next_run_at),
                        input: coerce_trigger_input(changes.get("input"), Some(&input))
                            .unwrap_or(input),
                    };
                    let applied =
                        self.report(self.one_time.update(id, spec).await, action, "update");
                    // The staged entry outlives a failed update so a retry
                    // re-attempts the update instead of creating a duplicate.
                    if applied {
                        self.pending.remove(&key);
                    }
                    return applied;
                }

                let Some(scheduled_time) = string_field(changes, "scheduledTime") else {
                    tracing::warn!(name = %action.name, "one-time create without scheduledTime");
                    return false;
                };
                let Some(input) = coerce_trigger_input(changes.get("input"), None) else {
                    tracing::warn!(name = %action.name, "one-time create without input");
                    return false;
                };
                let spec = OneTimeJobSpec {
                    scheduled_time,
                    input,
                };
                self.report(self.one_time.create(spec).await.map(|_| ()), action, "create")
            }
            ActionOp::Delete => {
                let Some(trigger) = resolve(triggers, ConfigType::OneTimeTrigger, &action.name)
                else {
                    tracing::warn!(name = %action.name, "one-time trigger not found");
                    return false;
                };
                if has_upcoming_replacement(upcoming, action) {
                    self.pending
                        .insert(action.replacement_key(), trigger.clone());
                    return true;
                }
                self.pending.remove(&action.replacement_key());
                let id = trigger.id().to_owned();
                self.report(self.one_time.delete(id).await, action, "delete")
            }
            ActionOp::Edit => {
                let Some(trigger) = resolve(triggers, ConfigType::OneTimeTrigger, &action.name)
                else {
                    tracing::warn!(name = %action.name, "one-time trigger not found");
                    return false;
                };
                let id = trigger.id().to_owned();
                // Merge over the authoritative remote item, not the snapshot.
                let job = match self.one_time.fetch(id.clone()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tracing::warn!(name = %action.name, %id, "one-time job vanished");
                        return false;
                    }
                    Err(error) => {
                        tracing::error!(name = %action.name, %error, "one-time fetch failed");
                        return false;
                    }
                };
                let fallback = job.input.unwrap_or_else(TriggerInput::placeholder);
                let spec = OneTimeJobSpec {
                    scheduled_time: string_field(changes, "scheduledTime")
                        .unwrap_or(job.next_run_at),
                    input: coerce_trigger_input(changes.get("input"), Some(&fallback))
                        .unwrap_or(fallback),
                };
                self.report(self.one_time.update(id, spec).await, action, "update")
            }
        }
    }

    async fn apply_recurring(
        &self,
        action: &CopilotAction,
        triggers: &[Trigger],
        upcoming: &[CopilotAction],
    ) -> bool {
        let changes = &action.config_changes;
        let desired_disabled = changes.get("disabled").and_then(Value::as_bool);
        match action.op {
            ActionOp::CreateNew => {
                let key = action.replacement_key();
                if let Some(staged) = self.staged_entry(&key) {
                    let Trigger::Recurring {
                        id, cron, input, ..
                    } = staged
                    else {
                        tracing::warn!(name = %action.name, "staged replacement has wrong kind");
                        return false;
                    };
                    let spec = RecurringJobSpec {
                        cron: string_field(changes, "cron").unwrap_or(cron),
                        input: coerce_trigger_input(changes.get("input"), Some(&input))
                            .unwrap_or(input),
                    };
                    let updated = match self.recurring.update(id, spec).await {
                        Ok(updated) => updated,
                        Err(error) => {
                            tracing::error!(name = %action.name, %error, "recurring update failed");
                            return false;
                        }
                    };
                    // Consumed only once the update and any follow-up toggle
                    // have both landed; a failure keeps the entry for retry.
                    if let Some(desired) = desired_disabled
                        && desired != updated.disabled
                    {
                        let applied = self.report(
                            self.recurring.toggle(updated.id, desired).await,
                            action,
                            "toggle",
                        );
                        if applied {
                            self.pending.remove(&key);
                        }
                        return applied;
                    }
                    self.pending.remove(&key);
                    return true;
                }

                let Some(cron) = string_field(changes, "cron") else {
                    tracing::warn!(name = %action.name, "recurring create without cron");
                    return false;
                };
                let Some(input) = coerce_trigger_input(changes.get("input"), None) else {
                    tracing::warn!(name = %action.name, "recurring create without input");
                    return false;
                };
                let id = match self.recurring.create(RecurringJobSpec { cron, input }).await {
                    Ok(id) => id,
                    Err(error) => {
                        tracing::error!(name = %action.name, %error, "recurring create failed");
                        return false;
                    }
                };
                if desired_disabled == Some(true) {
                    return self.report(self.recurring.toggle(id, true).await, action, "toggle");
                }
                true
            }
            ActionOp::Delete => {
                let Some(trigger) = resolve(triggers, ConfigType::RecurringTrigger, &action.name)
                else {
                    tracing::warn!(name = %action.name, "recurring trigger not found");
                    return false;
                };
                if has_upcoming_replacement(upcoming, action) {
                    self.pending
                        .insert(action.replacement_key(), trigger.clone());
                    return true;
                }
                self.pending.remove(&action.replacement_key());
                let id = trigger.id().to_owned();
                self.report(self.recurring.delete(id).await, action, "delete")
            }
            ActionOp::Edit => {
                let Some(trigger) = resolve(triggers, ConfigType::RecurringTrigger, &action.name)
                else {
                    tracing::warn!(name = %action.name, "recurring trigger not found");
                    return false;
                };
                let id = trigger.id().to_owned();

                // A lone disabled flip does not need the update round trip.
                if let Some(desired) = desired_disabled
                    && !changes.contains_key("cron")
                    && !changes.contains_key("input")
                {
                    return self
                        .report(self.recurring.toggle(id, desired).await, action, "toggle");
                }

                let job = match self.recurring.fetch(id.clone()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        tracing::warn!(name = %action.name, %id, "recurring job vanished");
                        return false;
                    }
                    Err(error) => {
                        tracing::error!(name = %action.name, %error, "recurring fetch failed");
                        return false;
                    }
                };
                let fallback = job.input.unwrap_or_else(TriggerInput::placeholder);
                let spec = RecurringJobSpec {
                    cron: string_field(changes, "cron").unwrap_or(job.cron),
                    input: coerce_trigger_input(changes.get("input"), Some(&fallback))
                        .unwrap_or(fallback),
                };
                let updated = match self.recurring.update(id, spec).await {
                    Ok(updated) => updated,
                    Err(error) => {
                        tracing::error!(name = %action.name, %error, "recurring update failed");
                        return false;
                    }
                };
                if let Some(desired) = desired_disabled
                    && desired != updated.disabled
                {
                    return self.report(
                        self.recurring.toggle(updated.id, desired).await,
                        action,
                        "toggle",
                    );
                }
                true
            }
        }
    }

    async fn apply_external(
        &self,
        action: &CopilotAction,
        action_index: usize,
        epoch: u64,
        triggers: &[Trigger],
    ) -> bool {
        match action.op {
            ActionOp::CreateNew => {
                // External setup is interactive; hand off to the host flow and
                // report not-applied. The host confirms through the
                // orchestrator once the provider-side setup completes.
                let changes = &action.config_changes;
                self.setup_flow.request_setup(ExternalSetupRequest {
                    action_index,
                    epoch,
                    toolkit_slug: extract_slug(changes, &["toolkitSlug", "toolkit_slug", "toolkit"]),
                    trigger_type_slug: extract_slug(
                        changes,
                        &["triggerTypeSlug", "trigger_type_slug", "triggerType"],
                    ),
                    config: changes
                        .get("triggerConfig")
                        .or_else(|| changes.get("trigger_config"))
                        .or_else(|| changes.get("config"))
                        .and_then(Value::as_object)
                        .cloned(),
                });
                false
            }
            ActionOp::Delete => {
                // External items are addressed loosely: the copilot may name
                // the trigger by type name, slug or raw deployment id.
                let deployment = triggers.iter().find_map(|t| match t {
                    Trigger::External {
                        id,
                        name,
                        trigger_type_name,
                        trigger_type_slug,
                        ..
                    } if *id == action.name
                        || *name == action.name
                        || *trigger_type_name == action.name
                        || *trigger_type_slug == action.name =>
                    {
                        Some(id.clone())
                    }
                    _ => None,
                });
                let Some(id) = deployment else {
                    tracing::warn!(name = %action.name, "external trigger not found");
                    return false;
                };
                self.report(self.external.delete(id).await, action, "delete")
            }
            // The parser attaches a fixed error to external edits, so an
            // error-free edit cannot reach here.
            ActionOp::Edit => false,
        }
    }

    fn report(
        &self,
        result: Result<(), TriggerServiceError>,
        action: &CopilotAction,
        call: &str,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(
                    name = %action.name,
                    config_type = ?action.config_type,
                    %error,
                    "remote {call} failed"
                );
                false
            }
        }
    }
}

/// A delete may skip its remote call when an error-free create_new for the
/// same (kind, name) is still coming up in this batch.
fn has_upcoming_replacement(upcoming: &[CopilotAction], action: &CopilotAction) -> bool {
    upcoming.iter().any(|candidate| {
        candidate.error.is_none()
            && candidate.op == ActionOp::CreateNew
            && candidate.replacement_key() == action.replacement_key()
    })
}

fn resolve<'a>(triggers: &'a [Trigger], kind: ConfigType, name: &str) -> Option<&'a Trigger> {
    triggers.iter().find(|t| match (kind, t) {
        (ConfigType::OneTimeTrigger, Trigger::OneTime { name: n, .. }) => n == name,
        (ConfigType::RecurringTrigger, Trigger::Recurring { name: n, .. }) => n == name,
        _ => false,
    })
}

fn string_field(changes: &Map<String, Value>, key: &str) -> Option<String> {
    changes.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Accept either a structured input object or a bare string shorthand.
fn coerce_trigger_input(
    value: Option<&Value>,
    fallback: Option<&TriggerInput>,
) -> Option<TriggerInput> {
    match value {
        Some(Value::String(content)) => Some(TriggerInput {
            messages: vec![crate::trigger::TriggerMessage {
                role: "user".to_owned(),
                content: content.clone(),
            }],
        }),
        Some(value) => serde_json::from_value(value.clone())
            .ok()
            .or_else(|| fallback.cloned()),
        None => fallback.cloned(),
    }
}

/// Pull a slug out of a change set that may carry it under several keys, as a
/// bare string or nested under an object's `slug` field.
fn extract_slug(changes: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match changes.get(*key) {
        Some(Value::String(slug)) => Some(slug.clone()),
        Some(Value::Object(obj)) => obj
            .get("slug")
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    })
}
