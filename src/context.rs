//! Plugin Context (C5): the only surface plugins touch on [`PipelineState`].
//!
//! Direct state access is forbidden to plugins by construction — a
//! `PluginContext` borrows the state mutably for the duration of one
//! plugin invocation and exposes only the operations spec §4.4 allows.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::resource::{Resource, ResourceContainer};
use crate::stages::PipelineStage;
use crate::state::{ConversationEntry, PipelineState, Role, ToolCall};

/// Scoped to exactly one plugin's one visit to one stage.
pub struct PluginContext<'a> {
    state: &'a mut PipelineState,
    resources: Arc<ResourceContainer>,
    plugin_name: String,
    stage: PipelineStage,
    request_id: String,
    user_id: String,
    /// Count of `execute_tool` calls made so far by this plugin during this
    /// visit, used to derive a stable `result_key` per call.
    tool_call_seq: u32,
}

impl<'a> PluginContext<'a> {
    pub fn new(
        state: &'a mut PipelineState,
        resources: Arc<ResourceContainer>,
        plugin_name: impl Into<String>,
        stage: PipelineStage,
        request_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            state,
            resources,
            plugin_name: plugin_name.into(),
            stage,
            request_id: request_id.into(),
            user_id: user_id.into(),
            tool_call_seq: 0,
        }
    }

    pub fn add_conversation_entry(
        &mut self,
        content: impl Into<Value>,
        role: Role,
        metadata: HashMap<String, Value>,
    ) {
        self.state
            .conversation
            .push(ConversationEntry::new(content, role).with_metadata(metadata));
    }

    pub fn get_conversation_history(&self) -> &[ConversationEntry] {
        &self.state.conversation
    }

    /// Assigns the pipeline's final response. Must be called at most once
    /// per run, except during ERROR-stage recovery, where the executor
    /// permits a fresh assignment after clearing the prior fault.
    pub fn set_response(&mut self, value: Value) {
        self.state.response = Some(value);
    }

    /// Queues a tool call and returns a deterministic `result_key`, derived
    /// from the plugin name, stage, and this plugin's call sequence number
    /// so replays produce identical keys.
    pub fn execute_tool(&mut self, name: impl Into<String>, params: HashMap<String, Value>) -> String {
        let result_key = format!("{}_{}_{}", self.plugin_name, self.stage, self.tool_call_seq);
        self.tool_call_seq += 1;
        self.state.pending_tool_calls.push(ToolCall {
            name: name.into(),
            params,
            result_key: result_key.clone(),
        });
        result_key
    }

    pub fn think(&mut self, key: impl Into<String>, value: Value) {
        self.state.temporary_thoughts.insert(key.into(), value);
    }

    pub fn get_think(&self, key: &str) -> Option<&Value> {
        self.state.temporary_thoughts.get(key)
    }

    pub async fn get_resource(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.resources.get(name).await
    }

    /// Sets `next_stage`; the Stage Executor breaks the current stage's
    /// plugin loop once this plugin returns.
    pub fn jump_to_stage(&mut self, stage: PipelineStage) {
        self.state.next_stage = Some(stage);
    }

    /// Adds `stage` to `skip_stages`; consumed (removed) the next time the
    /// pipeline loop encounters it.
    pub fn skip_stage(&mut self, stage: PipelineStage) {
        self.state.skip_stages.insert(stage);
    }

    pub fn pipeline_id(&self) -> &str {
        &self.state.pipeline_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn current_stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn stage_results(&self) -> &HashMap<String, Value> {
        &self.state.stage_results
    }
}
