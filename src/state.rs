//! Pipeline state (C4): the authoritative per-run record the Stage Executor
//! and Pipeline Loop operate on. Plugins never touch this directly — they
//! go through [`crate::context::PluginContext`] (C5).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCategory, ErrorSeverity};
use crate::stages::PipelineStage;

/// Who produced a [`ConversationEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry in the ordered conversation log.
///
/// Invariant: the first entry of a fresh state is the incoming user message
/// with `role = User` (enforced by [`PipelineState::fresh`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub content: Value,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ConversationEntry {
    pub fn new(content: impl Into<Value>, role: Role) -> Self {
        Self {
            content: content.into(),
            role,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A plugin's request to run a named tool, queued during stage execution and
/// consumed by the Tool Dispatcher drain (C3). Never persisted across
/// iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub params: HashMap<String, Value>,
    pub result_key: String,
}

/// Records a single fault in the current pipeline run.
///
/// Set by the Stage Executor on the first plugin fault within a stage; drives
/// dispatch to the ERROR stage. Cleared only on a fresh pipeline, never by
/// the loop itself mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub stage: PipelineStage,
    pub plugin_name: String,
    pub error_type: String,
    pub error_message: String,
    pub original_exception: Option<String>,
    pub context_snapshot: HashMap<String, Value>,
    /// **[EXPANSION]** classification for diagnostics/recovery-strategy lookup
    /// (never consulted by control flow — see `error::suggest_recovery`).
    #[serde(default)]
    pub severity: Option<ErrorSeverity>,
    #[serde(default)]
    pub category: Option<ErrorCategory>,
}

impl FailureInfo {
    pub fn new(
        stage: PipelineStage,
        plugin_name: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            plugin_name: plugin_name.into(),
            error_type: error_type.into(),
            error_message: error_message.into(),
            original_exception: None,
            context_snapshot: HashMap::new(),
            severity: None,
            category: None,
        }
    }

    pub fn with_original_exception(mut self, exception: impl Into<String>) -> Self {
        self.original_exception = Some(exception.into());
        self
    }

    pub fn with_context_snapshot(mut self, snapshot: HashMap<String, Value>) -> Self {
        self.context_snapshot = snapshot;
        self
    }

    pub fn with_classification(mut self, severity: ErrorSeverity, category: ErrorCategory) -> Self {
        self.severity = Some(severity);
        self.category = Some(category);
        self
    }
}

/// Authoritative per-run pipeline state (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub conversation: Vec<ConversationEntry>,
    pub pending_tool_calls: Vec<ToolCall>,
    /// Transient per-run values keyed by plugin-chosen keys; cleared at end of run.
    pub stage_results: HashMap<String, Value>,
    /// Shared across iterations of a single message; cleared when the response is finalized.
    pub temporary_thoughts: HashMap<String, Value>,
    pub response: Option<Value>,
    pub pipeline_id: String,
    pub iteration: u32,
    pub current_stage: Option<PipelineStage>,
    pub last_completed_stage: Option<PipelineStage>,
    pub next_stage: Option<PipelineStage>,
    pub skip_stages: HashSet<PipelineStage>,
    pub failure_info: Option<FailureInfo>,
}

impl PipelineState {
    /// Construct a fresh state with the incoming user message as the first
    /// conversation entry, per the data-model invariant.
    pub fn fresh(pipeline_id: impl Into<String>, message: impl Into<Value>) -> Self {
        Self {
            conversation: vec![ConversationEntry::new(message, Role::User)],
            pending_tool_calls: Vec::new(),
            stage_results: HashMap::new(),
            temporary_thoughts: HashMap::new(),
            response: None,
            pipeline_id: pipeline_id.into(),
            iteration: 0,
            current_stage: None,
            last_completed_stage: None,
            next_stage: None,
            skip_stages: HashSet::new(),
            failure_info: None,
        }
    }

    /// Clears run-scoped caches at the very end of the pipeline loop.
    pub fn clear_run_scoped(&mut self) {
        self.stage_results.clear();
        self.temporary_thoughts.clear();
    }
}
