//! Configuration & Hot-Reload (C8).
//!
//! The declarative schema from spec §4.8, modeled as plain serde structs —
//! no file-format parser ships (TOML/YAML parsing is explicitly out of
//! scope). Callers hand the core an already-deserialized [`PipelineConfig`]
//! or construct one programmatically.
//!
//! Grounded on `entity/core/validators.py`'s `ValidationResult` pattern for
//! the validation shape, and on the original's `CircuitBreaker` for the
//! breaker gating `validate_runtime()` during hot-reload.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationResult;
use crate::plugin::Plugin;
use crate::resource::Layer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub reload: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub layer: Option<Layer>,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub resources: HashMap<String, ResourceConfig>,
    #[serde(default)]
    pub tools: HashMap<String, ToolConfig>,
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub prompts: HashMap<String, PromptConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistryConfig {
    pub concurrency_limit: usize,
    #[serde(default)]
    pub cache_ttl: Option<u64>,
}

/// `stage -> ordered plugin names`, matching [`crate::workflow::Workflow`]'s
/// shape but carried here as plain data for (de)serialization.
pub type WorkflowConfig = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    pub tool_registry: ToolRegistryConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl PipelineConfig {
    /// Structural sanity, not plugin-level semantics: schema shape only.
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        if self.tool_registry.concurrency_limit == 0 {
            errors.push("tool_registry.concurrency_limit must be at least 1".to_string());
        }
        for (name, resource) in &self.plugins.resources {
            if resource.kind.is_empty() {
                errors.push(format!("resource '{name}' has an empty type"));
            }
        }
        if errors.is_empty() {
            ValidationResult::success()
        } else {
            ValidationResult::failure(errors)
        }
    }

    /// Diffs `self.plugins.resources` against `previous`, returning the
    /// names that were added, removed, or changed layer — changes that
    /// require a restart rather than a hot-reload (spec §4.8's last line).
    pub fn structural_resource_changes(&self, previous: &PluginsConfig) -> Vec<String> {
        let mut changed = Vec::new();
        for name in self.plugins.resources.keys() {
            if !previous.resources.contains_key(name) {
                changed.push(format!("{name} added"));
            }
        }
        for (name, prev) in &previous.resources {
            match self.plugins.resources.get(name) {
                None => changed.push(format!("{name} removed")),
                Some(next) if next.layer != prev.layer => {
                    changed.push(format!("{name} re-layered ({:?} -> {:?})", prev.layer, next.layer))
                }
                Some(_) => {}
            }
        }
        changed
    }
}

/// Closed/open/half-open breaker gating `validate_runtime()` calls during
/// hot-reload (spec §4.8). Trips after `failure_threshold` consecutive
/// failures; after `recovery_timeout` elapses, allows one trial call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a `validate_runtime()` call should be attempted right now.
    /// Also performs the Open -> HalfOpen transition once the recovery
    /// timeout has elapsed.
    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.state == BreakerState::HalfOpen || self.consecutive_failures >= self.failure_threshold {
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }
}

/// Outcome of one plugin's hot-reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotReloadOutcome {
    Applied,
    RolledBack { reason: String },
    Rejected { errors: Vec<String> },
}

/// Drives one plugin through the hot-reload sequence from spec §4.8:
/// validate config, validate dependencies, apply, optionally verify at
/// runtime through the circuit breaker, rolling back on any runtime
/// failure or an open breaker.
pub async fn reload_plugin(
    plugin: &dyn Plugin,
    new_config: &Value,
    previous_version: &Value,
    known_resources: &[String],
    breaker: &mut CircuitBreaker,
) -> HotReloadOutcome {
    let config_check = plugin.validate_config(new_config);
    if !config_check.success {
        return HotReloadOutcome::Rejected { errors: config_check.errors };
    }

    let dependency_check = plugin.validate_dependencies(known_resources);
    if !dependency_check.success {
        return HotReloadOutcome::Rejected { errors: dependency_check.errors };
    }

    if let Err(e) = plugin.update_config(new_config) {
        return HotReloadOutcome::Rejected { errors: vec![e.to_string()] };
    }

    if !breaker.is_call_permitted() {
        let _ = plugin.rollback_config(previous_version);
        return HotReloadOutcome::RolledBack { reason: "circuit breaker open".to_string() };
    }

    let runtime_check = plugin.validate_runtime().await;
    if runtime_check.success {
        breaker.record_success();
        HotReloadOutcome::Applied
    } else {
        breaker.record_failure();
        let _ = plugin.rollback_config(previous_version);
        HotReloadOutcome::RolledBack { reason: runtime_check.message() }
    }
}
