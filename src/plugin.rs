//! Plugin interface (spec §6): the unit of behavior the Stage Executor
//! invokes once per stage-visit.
//!
//! Grounded on `payload.rs`'s object-safe `Payload` trait, generalized from
//! a single `invoke()` entry point to the stage/dependency/capability model
//! spec §4.2/§6 require. Uses `async_trait` for the same reason as
//! [`crate::resource::Resource`]: several async methods, most with sensible
//! defaults.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::PluginContext;
use crate::error::ValidationResult;
use crate::stages::PipelineStage;

/// Declared capabilities for a registered plugin (spec §3, PluginEntry):
/// which stages it supports and which resources it requires, accumulated
/// across calls to [`crate::registry::PluginRegistry::declare_capabilities`].
#[derive(Debug, Clone, Default)]
pub struct PluginCapabilities {
    pub supported_stages: Vec<PipelineStage>,
    pub required_resources: Vec<String>,
}

/// A unit of pipeline behavior. `execute` is the only method every plugin
/// must implement; the rest have permissive defaults mirroring spec §6's
/// "optional" class-level hooks.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier used in registry lookups, workflow descriptors, and
    /// result-key derivation.
    fn name(&self) -> &str;

    /// Stages this plugin may be registered for. Must be non-empty.
    fn stages(&self) -> &[PipelineStage];

    /// Declared dependencies using the `"name"` / `"name?"` syntax (spec
    /// §4.2). May name other plugins or resources.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()>;

    fn validate_config(&self, _config: &Value) -> ValidationResult {
        ValidationResult::success()
    }

    /// Optional dependency self-check beyond the registry's own DAG
    /// validation (e.g. a plugin that needs one of two interchangeable
    /// resources rather than a single named one).
    fn validate_dependencies(&self, _available: &[String]) -> ValidationResult {
        ValidationResult::success()
    }

    async fn validate_runtime(&self) -> ValidationResult {
        ValidationResult::success()
    }

    /// Applies a new configuration version at runtime (spec §4.8, §6). The
    /// default no-op suits plugins with nothing configurable; stateful
    /// plugins override this and typically hold the active version behind
    /// interior mutability, since hot-reload only ever has `&self`.
    fn update_config(&self, _new_config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Restores a previously active configuration version after a failed
    /// hot-reload (spec §4.8's rollback path).
    fn rollback_config(&self, _previous_version: &Value) -> anyhow::Result<()> {
        Ok(())
    }
}
