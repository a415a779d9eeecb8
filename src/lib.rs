//! Helmsman is a mutation protocol and reconciliation engine for AI-copilot
//! driven workflow editing. It parses streamed action blocks, validates and
//! applies them to a local workflow aggregate with full undo/redo, and
//! reconciles trigger mutations against their remote subsystems.
pub mod action;
pub mod apply_tracker;
pub mod history;
pub mod local_apply;
pub mod orchestrator;
pub mod reconciler;
pub mod stream_parser;
pub mod trigger;
pub mod validator;
pub mod workflow;
