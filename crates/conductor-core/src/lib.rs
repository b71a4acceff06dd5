//! # conductor-core
//!
//! Core of Conductor, which runs AI agent sessions as supervised
//! subprocesses.
//!
//! This crate is transport-agnostic and can be used by:
//! - the `conductor` daemon (console front end)
//! - the HTTP bridge servers (`conductor-http`)
//! - anything else that wants to run agents in-process
//!
//! ## Key Concepts
//!
//! - **Task**: one prompt run to completion by one agent process
//! - **ProcessAdapter**: owns one agent subprocess and turns its terminal
//!   output into typed [`AdapterEvent`]s
//! - **TaskManager**: bounds how many adapters run at once and queues the rest
//! - **Bridge**: correlates permission/question requests from tool servers
//!   with a human's answer

pub mod adapter;
pub mod bridge;
pub mod event_bus;
pub mod logging;
pub mod provider;
pub mod provision;
pub mod shell;
pub mod spawn;
pub mod stream;
pub mod task;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use adapter::{AdapterError, AdapterEvent, AdapterServices, ProcessAdapter, TaskConfig};
pub use bridge::{PermissionBridge, QuestionBridge};
pub use event_bus::{BridgeEvent, EventBus};
pub use task::{Task, TaskCallbacks, TaskManager, TaskManagerConfig, TaskStatus};
