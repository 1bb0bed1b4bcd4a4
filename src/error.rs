//! Error taxonomy for the pipeline core.
//!
//! Mirrors spec §4.10 / §7: `ValidationError`, `PluginExecutionError`,
//! `ToolExecutionError`, `ResourceError`, `PipelineError`,
//! `CircuitBreakerTripped`, and `SandboxError`. Control flow never matches on
//! these types directly inside the executor — a fault is converted to
//! [`crate::state::FailureInfo`] the moment it's caught, per spec §4.6.

use thiserror::Error;

/// Raised while validating or building a [`crate::resource::ResourceContainer`]
/// (missing dependency, layer violation, cyclic graph, failed health check).
#[derive(Error, Debug, Clone)]
#[error("{kind} '{name}' failed {phase}: {message}")]
pub struct InitializationError {
    pub name: String,
    pub phase: String,
    pub message: String,
    pub kind: String,
}

impl InitializationError {
    pub fn new(name: impl Into<String>, phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            message: message.into(),
            kind: "Resource".to_string(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// A single fault raised by a plugin, tool, or resource during stage execution.
///
/// The Rust analogue of the original's caught-exception taxonomy (spec
/// §4.6 step c). The Stage Executor converts any variant into a
/// [`crate::state::FailureInfo`] as soon as it's caught; the variant itself
/// is only retained transiently for classification before that conversion.
#[derive(Error, Debug)]
pub enum PluginFault {
    #[error("circuit breaker tripped: {0}")]
    CircuitBreakerTripped(String),

    #[error("plugin '{plugin}' raised: {message}")]
    PluginExecutionError { plugin: String, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecutionError { tool: String, message: String },

    #[error("resource error: {0}")]
    ResourceError(String),

    #[error("pipeline error: {0}")]
    PipelineError(String),

    #[error("sandbox violation in '{sandbox_type}': {message} (security_violation={security_violation})")]
    SandboxError {
        sandbox_type: String,
        message: String,
        security_violation: bool,
    },

    #[error("validation error: {0:?}")]
    ValidationError(Vec<String>),

    #[error("unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PluginFault {
    /// The `error_type` string stored on [`crate::state::FailureInfo`].
    pub fn error_type(&self) -> &'static str {
        match self {
            PluginFault::CircuitBreakerTripped(_) => "circuit_breaker",
            PluginFault::PluginExecutionError { .. } => "plugin_error",
            PluginFault::ToolExecutionError { .. } => "tool_error",
            PluginFault::ResourceError(_) => "resource_error",
            PluginFault::PipelineError(_) => "pipeline_error",
            PluginFault::SandboxError { .. } => "sandbox_error",
            PluginFault::ValidationError(_) => "validation_error",
            PluginFault::Other(_) => "unexpected_error",
        }
    }

    /// Whether ERROR-stage recovery is worth attempting for this fault.
    ///
    /// Sandbox security violations are non-recoverable per spec §7 — they
    /// must not trigger recovery strategies.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            PluginFault::SandboxError {
                security_violation: true,
                ..
            }
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PluginFault::CircuitBreakerTripped(_) => ErrorCategory::Plugin,
            PluginFault::PluginExecutionError { .. } => ErrorCategory::Plugin,
            PluginFault::ToolExecutionError { .. } => ErrorCategory::Resource,
            PluginFault::ResourceError(_) => ErrorCategory::Resource,
            PluginFault::PipelineError(_) => ErrorCategory::Pipeline,
            PluginFault::SandboxError { .. } => ErrorCategory::Sandbox,
            PluginFault::ValidationError(_) => ErrorCategory::Validation,
            PluginFault::Other(_) => ErrorCategory::Unknown,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Sandbox => ErrorSeverity::Critical,
            ErrorCategory::Resource | ErrorCategory::Memory => ErrorSeverity::High,
            ErrorCategory::Plugin | ErrorCategory::Network | ErrorCategory::Timeout => {
                ErrorSeverity::Medium
            }
            _ => ErrorSeverity::Low,
        }
    }
}

/// **[EXPANSION]** Severity classification, ported from the original's
/// `ErrorSeverity`. Used for logging/diagnostics only, never consulted by
/// control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// **[EXPANSION]** Category classification, ported from the original's
/// `ErrorCategory`. Used to look up suggested recovery strategies and for
/// log/metric labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Resource,
    Network,
    Timeout,
    Plugin,
    Pipeline,
    Sandbox,
    Memory,
    Unknown,
}

/// Suggested (non-binding) recovery strategies per category, ported from the
/// original's `ErrorContextManager._recovery_strategies`.
pub fn suggest_recovery(category: ErrorCategory) -> &'static [&'static str] {
    match category {
        ErrorCategory::Validation => &["retry_with_fixed_input", "use_default_values"],
        ErrorCategory::Resource => &["retry_after_delay", "use_fallback_resource"],
        ErrorCategory::Network => &["retry_with_backoff", "use_cached_response"],
        ErrorCategory::Timeout => &["increase_timeout", "use_async_processing"],
        ErrorCategory::Plugin => &["skip_plugin", "use_fallback_plugin"],
        ErrorCategory::Sandbox => &["restart_sandbox", "use_safe_mode"],
        ErrorCategory::Memory => &["trigger_gc", "use_memory_efficient_mode"],
        ErrorCategory::Pipeline | ErrorCategory::Unknown => &[],
    }
}

/// Result of validating a config blob, a dependency declaration, or a
/// runtime check. Used uniformly across resource config validation, plugin
/// config validation, and hot-reload validation (spec §4.8).
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub success: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn message(&self) -> String {
        if self.errors.is_empty() {
            "ok".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginFault>;
