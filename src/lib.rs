//! # Agent Pipeline
//!
//! A staged, plugin-driven request pipeline for LLM agent orchestration.
//!
//! Every run moves a [`state::PipelineState`] through six stages — INPUT,
//! PARSE, THINK, DO, REVIEW, OUTPUT — plus an ERROR side-stage reached only
//! by failure dispatch. Each stage runs a list of [`plugin::Plugin`]s drawn
//! from the [`registry::PluginRegistry`] (or overridden by a
//! [`workflow::Workflow`]); plugins mutate state exclusively through a
//! [`context::PluginContext`], queue tool calls drained by the
//! [`tool::ToolRegistry`], and read dependency-injected resources from the
//! [`resource::ResourceContainer`].
//!
//! ## Core Concepts
//!
//! - **[`resource::ResourceContainer`]** — layered, dependency-injected
//!   resource lifecycle: registration, topological init, health checks,
//!   reverse-order shutdown, optional pooling.
//! - **[`registry::PluginRegistry`]** — stage-indexed plugin lists in
//!   registration order, declared dependencies/capabilities, DAG validation.
//! - **[`tool::ToolRegistry`]** — intent-based tool discovery and a
//!   bounded-concurrency drain of queued tool calls.
//! - **[`state::PipelineState`] / [`context::PluginContext`]** — the
//!   per-run data and the only surface plugins use to touch it.
//! - **[`executor`]** — runs one stage's plugin list, handling memory
//!   load/save, tool drains, and ERROR-stage dispatch on fault.
//! - **[`pipeline::PipelineLoop`]** — drives the full stage sequence across
//!   iterations until a response is produced or `max_iterations` trips.
//! - **[`config`]** — declarative, in-memory configuration schema and the
//!   hot-reload sequence (config/dependency validation, apply, circuit
//!   breaker-gated runtime check, rollback).
//! - **[`workflow::Workflow`]** — optional per-stage plugin-order/predicate
//!   override.
//! - **[`error`]** — the `PluginFault` taxonomy, severity/category
//!   classification, and recovery-strategy suggestions.
//!
//! ## Quick Start
//!
//! ```
//! use agent_pipeline::{PipelineLoopBuilder, PluginContext, PluginRegistry, ResourceContainer};
//! use agent_pipeline::Plugin;
//! use agent_pipeline::stages::PipelineStage;
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Plugin for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     fn stages(&self) -> &[PipelineStage] { &[PipelineStage::Output] }
//!
//!     async fn execute(&self, ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
//!         let first = ctx.get_conversation_history().first().map(|e| e.content.clone());
//!         ctx.set_response(first.unwrap_or(Value::Null));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = PluginRegistry::new();
//!     registry.register_plugin(Arc::new(Echo));
//!     registry.register_plugin_for_stage("echo", PipelineStage::Output).unwrap();
//!
//!     let resources = Arc::new(ResourceContainer::new(5));
//!     let pipeline = PipelineLoopBuilder::new(resources).registry(registry).build();
//!
//!     let response = pipeline.run_message("hello", "user-1", "req-1", None).await;
//!     assert_eq!(response, Value::from("hello"));
//! }
//! ```

pub mod config;
pub mod context;
pub mod depgraph;
pub mod error;
pub mod events;
pub mod executor;
pub mod pipeline;
pub mod plugin;
pub mod registry;
pub mod resource;
pub mod stages;
pub mod state;
pub mod tool;
pub mod workflow;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use config::{CircuitBreaker, HotReloadOutcome, PipelineConfig};
pub use context::PluginContext;
pub use error::{PluginFault, Result, ValidationResult};
pub use pipeline::{PipelineLoop, PipelineLoopBuilder};
pub use plugin::Plugin;
pub use registry::PluginRegistry;
pub use resource::{Resource, ResourceContainer};
pub use stages::PipelineStage;
pub use state::PipelineState;
pub use tool::{Tool, ToolRegistry};
pub use workflow::Workflow;
