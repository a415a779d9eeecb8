//! Drives the apply lifecycle for one streamed copilot message: parse the
//! buffer into blocks, apply local actions synchronously, hand trigger
//! actions to the reconciler one at a time, and keep the applied set
//! consistent across re-parses, resets and in-flight async work.

use std::sync::Arc;

use serde::Deserialize;

use crate::action::CopilotAction;
use crate::apply_tracker::ApplyTracker;
use crate::history::WorkflowStore;
use crate::local_apply::apply_local_action;
use crate::reconciler::TriggerReconciler;
use crate::stream_parser::{Block, parse_blocks};
use crate::trigger::{DEFAULT_TRIGGER_FETCH_LIMIT, Trigger};
use crate::validator::SchemaRegistry;

fn default_model() -> String {
    "gpt-4.1".to_owned()
}

fn default_fetch_limit() -> usize {
    DEFAULT_TRIGGER_FETCH_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Model assigned to agents auto-created on behalf of pipelines.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Page size for trigger snapshot fetches.
    #[serde(default = "default_fetch_limit")]
    pub trigger_fetch_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            trigger_fetch_limit: default_fetch_limit(),
        }
    }
}

/// Progress of the current message's action batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStatus {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
}

pub struct CopilotOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<dyn SchemaRegistry>,
    reconciler: TriggerReconciler,
    store: WorkflowStore,
    tracker: ApplyTracker,
    blocks: Vec<Block>,
    triggers: Vec<Trigger>,
}

impl CopilotOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn SchemaRegistry>,
        reconciler: TriggerReconciler,
        store: WorkflowStore,
    ) -> Self {
        Self {
            config,
            registry,
            reconciler,
            store,
            tracker: ApplyTracker::new(),
            blocks: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// Start a fresh assistant message. Invalidates any in-flight applies
    /// from the previous one.
    pub fn begin_message(&mut self) {
        self.tracker.reset();
        self.blocks.clear();
    }

    /// Re-parse the full message buffer received so far. Safe to call on
    /// every chunk; parsing is deterministic over the whole buffer.
    pub fn ingest(&mut self, text: &str) {
        self.blocks = parse_blocks(text, self.registry.as_ref());
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Replace the trigger snapshot. Staged replacements survive a refresh
    /// that reports the same list (a staged delete makes no remote change, so
    /// the list is unchanged); an actually different list means the outside
    /// world moved and staged state is stale.
    pub fn update_snapshot(&mut self, triggers: Vec<Trigger>) {
        if triggers != self.triggers {
            self.reconciler.clear_pending();
            self.triggers = triggers;
        }
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Finalized actions of the current message, in stream order.
    pub fn actions(&self) -> Vec<&CopilotAction> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                Block::Action { action } => Some(action),
                _ => None,
            })
            .collect()
    }

    pub fn is_applied(&self, index: usize) -> bool {
        self.tracker.is_applied(index)
    }

    /// Apply every unapplied action of the current message. Local actions go
    /// first and synchronously, so trigger actions that reference workflow
    /// state observe it post-mutation; trigger actions are awaited strictly
    /// in order. A reset during an await abandons the rest of the batch.
    pub async fn apply_all(&mut self) -> ApplyStatus {
        let epoch = self.tracker.epoch();
        let actions: Vec<CopilotAction> = self.actions().into_iter().cloned().collect();

        for (index, action) in actions.iter().enumerate() {
            if action.config_type.is_trigger()
                || self.tracker.is_applied(index)
                || action.error.is_some()
            {
                continue;
            }
            if apply_local_action(&mut self.store, action, &self.config.default_model) {
                self.tracker.mark_applied(index);
            }
        }

        for (index, action) in actions.iter().enumerate() {
            if !action.config_type.is_trigger()
                || self.tracker.is_applied(index)
                || action.error.is_some()
            {
                continue;
            }
            let upcoming = self.unapplied_after(&actions, index);
            let applied = self
                .reconciler
                .apply(action, index, epoch, &self.triggers, &upcoming)
                .await;
            if self.tracker.epoch() != epoch {
                // Message changed underneath us; drop the rest of the batch.
                return self.status();
            }
            if applied {
                self.tracker.mark_applied(index);
                self.refresh_triggers().await;
                if self.tracker.epoch() != epoch {
                    return self.status();
                }
            }
        }

        self.status()
    }

    /// Apply a single action by its index in the message's action sequence.
    pub async fn apply_one(&mut self, index: usize) -> bool {
        let epoch = self.tracker.epoch();
        let actions: Vec<CopilotAction> = self.actions().into_iter().cloned().collect();
        let Some(action) = actions.get(index) else {
            return false;
        };
        if self.tracker.is_applied(index) || action.error.is_some() {
            return false;
        }

        if !action.config_type.is_trigger() {
            let applied = apply_local_action(&mut self.store, action, &self.config.default_model);
            if applied {
                self.tracker.mark_applied(index);
            }
            return applied;
        }

        let upcoming = self.unapplied_after(&actions, index);
        let applied = self
            .reconciler
            .apply(action, index, epoch, &self.triggers, &upcoming)
            .await;
        if self.tracker.epoch() != epoch {
            return false;
        }
        if applied {
            self.tracker.mark_applied(index);
            self.refresh_triggers().await;
        }
        applied
    }

    /// Called by the host when an interactive external-trigger setup finishes.
    /// The epoch captured at hand-off time guards against marking an action of
    /// a different message.
    pub fn confirm_external_setup(&mut self, index: usize, epoch: u64) -> bool {
        if epoch != self.tracker.epoch() {
            tracing::warn!(index, "stale external setup confirmation dropped");
            return false;
        }
        self.tracker.mark_applied(index);
        true
    }

    pub fn status(&self) -> ApplyStatus {
        let actions = self.actions();
        let applied = (0..actions.len())
            .filter(|&i| self.tracker.is_applied(i))
            .count();
        ApplyStatus {
            total: actions.len(),
            applied,
            pending: actions.len() - applied,
        }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut WorkflowStore {
        &mut self.store
    }

    /// Lookahead slice for the replacement policy: only actions that are both
    /// later in the message and still unapplied can consume a staged delete.
    /// An already-applied create_new went through as a genuine create and
    /// must not cause a delete to defer forever.
    fn unapplied_after(&self, actions: &[CopilotAction], index: usize) -> Vec<CopilotAction> {
        actions
            .iter()
            .enumerate()
            .skip(index + 1)
            .filter(|(i, _)| !self.tracker.is_applied(*i))
            .map(|(_, action)| action.clone())
            .collect()
    }

    async fn refresh_triggers(&mut self) {
        let snapshot = self.reconciler.snapshot(self.config.trigger_fetch_limit).await;
        match snapshot {
            Ok(triggers) => self.update_snapshot(triggers),
            Err(error) => {
                tracing::error!(%error, "trigger snapshot refresh failed");
            }
        }
    }
}
