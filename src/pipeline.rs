//! Pipeline Loop (C7).
//!
//! Builds or resumes a [`PipelineState`], then repeatedly dispatches stages
//! to the Stage Executor until a response is produced, a failure survives
//! ERROR recovery, or `max_iterations` is reached.
//!
//! Grounded on `entity/pipeline/pipeline.py`'s `execute_pipeline` /
//! `run_message`; the control-flow shape below is a direct translation of
//! that function's `while True` loop. Builder pattern follows
//! `exec_ctx.rs`'s `ExecCtxBuilder` / the old `PipelineBuilder<T>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::events::{self, Event, EventHandler};
use crate::executor::{self, ExecutorDeps, Validators};
use crate::registry::PluginRegistry;
use crate::resource::ResourceContainer;
use crate::stages::{PipelineStage, STAGE_ORDER};
use crate::state::{FailureInfo, PipelineState};
use crate::tool::ToolRegistry;
use crate::workflow::Workflow;

/// `pipeline_id` format: `{user_id}_{timestamp}`, matching the original's
/// `generate_pipeline_id`. Millisecond precision keeps same-user concurrent
/// runs distinguishable without a counter.
fn generate_pipeline_id(user_id: &str) -> String {
    format!("{user_id}_{}", Utc::now().format("%Y%m%d%H%M%S%3f"))
}

fn create_default_response(message: &str, pipeline_id: &str) -> Value {
    json!({ "message": message, "pipeline_id": pipeline_id })
}

/// The default ERROR-stage handler's output shape (spec §4.10), used as the
/// final fallback when ERROR+OUTPUT still leave `state.response` unset:
/// `{error, message, error_id=pipeline_id, plugin, stage, type}`, where
/// `error` carries the underlying fault text and `message` is a fixed,
/// user-facing string.
fn default_error_response(failure: &FailureInfo, pipeline_id: &str) -> Value {
    json!({
        "error": failure.error_message,
        "message": "Unable to process request",
        "error_id": pipeline_id,
        "plugin": failure.plugin_name,
        "stage": failure.stage.name(),
        "type": failure.error_type,
    })
}

/// Assembles everything a pipeline run needs: the shared, read-mostly
/// Plugin Registry / Tool Registry / Resource Container, plus an optional
/// Workflow override and per-stage validators.
pub struct PipelineLoop {
    registry: PluginRegistry,
    tools: ToolRegistry,
    resources: Arc<ResourceContainer>,
    workflow: Option<Workflow>,
    validators: Option<Validators>,
    max_iterations: u32,
    cancellation: Option<Arc<AtomicBool>>,
    events: Option<Arc<dyn EventHandler>>,
}

pub struct PipelineLoopBuilder {
    registry: PluginRegistry,
    tools: ToolRegistry,
    resources: Arc<ResourceContainer>,
    workflow: Option<Workflow>,
    validators: Option<Validators>,
    max_iterations: u32,
    cancellation: Option<Arc<AtomicBool>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl PipelineLoopBuilder {
    pub fn new(resources: Arc<ResourceContainer>) -> Self {
        Self {
            registry: PluginRegistry::new(),
            tools: ToolRegistry::new(5),
            resources,
            workflow: None,
            validators: None,
            max_iterations: 10,
            cancellation: None,
            events: None,
        }
    }

    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn workflow(mut self, workflow: Workflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn validators(mut self, validators: Validators) -> Self {
        self.validators = Some(validators);
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn events(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    pub fn build(self) -> PipelineLoop {
        PipelineLoop {
            registry: self.registry,
            tools: self.tools,
            resources: self.resources,
            workflow: self.workflow,
            validators: self.validators,
            max_iterations: self.max_iterations,
            cancellation: self.cancellation,
            events: self.events,
        }
    }
}

impl PipelineLoop {
    fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().map(|f| f.load(Ordering::Relaxed)).unwrap_or(false)
    }

    async fn load_checkpoint(&self, checkpoint_key: &str, user_id: &str) -> Option<PipelineState> {
        let memory = self.resources.get("memory").await?;
        let memory = memory.as_memory_resource()?;
        let value = memory.fetch_persistent(checkpoint_key, user_id).await.ok()??;
        serde_json::from_value(value).ok()
    }

    async fn write_checkpoint(&self, checkpoint_key: &str, state: &PipelineState, user_id: &str) {
        let Some(memory) = self.resources.get("memory").await else {
            return;
        };
        let Some(memory) = memory.as_memory_resource() else {
            return;
        };
        if let Ok(value) = serde_json::to_value(state) {
            let _ = memory.store_persistent(checkpoint_key, value, user_id).await;
            events::emit(
                self.events.as_ref(),
                Event::Checkpoint {
                    pipeline_id: state.pipeline_id.clone(),
                    checkpoint_key: checkpoint_key.to_string(),
                },
            );
        }
    }

    /// Runs one full pipeline: builds or resumes state, then drives the
    /// stage sequence until termination. Returns the final response value.
    pub async fn run_message(
        &self,
        message: impl Into<Value>,
        user_id: &str,
        request_id: &str,
        checkpoint_key: Option<&str>,
    ) -> Value {
        let mut state = match checkpoint_key {
            Some(key) => match self.load_checkpoint(key, user_id).await {
                Some(resumed) => resumed,
                None => PipelineState::fresh(generate_pipeline_id(user_id), message),
            },
            None => PipelineState::fresh(generate_pipeline_id(user_id), message),
        };

        let deps = ExecutorDeps {
            registry: &self.registry,
            tools: &self.tools,
            resources: &self.resources,
            workflow: self.workflow.as_ref(),
            validators: self.validators.as_ref(),
            request_id,
            user_id,
            events: self.events.as_ref(),
        };

        info!(pipeline_id = %state.pipeline_id, "pipeline run starting");

        loop {
            if self.is_cancelled() {
                state.failure_info = Some(FailureInfo::new(
                    state.current_stage.unwrap_or(PipelineStage::Input),
                    "pipeline",
                    "pipeline_error",
                    "cancelled",
                ));
                break;
            }

            state.iteration += 1;
            let start = state.next_stage.take().unwrap_or(STAGE_ORDER[0]);
            let start_idx = STAGE_ORDER.iter().position(|s| *s == start).unwrap_or(0);

            for &stage in &STAGE_ORDER[start_idx..] {
                if state.skip_stages.remove(&stage) {
                    continue;
                }
                if let Some(workflow) = &self.workflow {
                    if !workflow.should_execute(stage, &state) {
                        continue;
                    }
                }
                if let Some(last) = state.last_completed_stage {
                    if stage <= last {
                        continue;
                    }
                }

                executor::execute_stage(stage, &mut state, &deps).await;

                if let Some(checkpoint_key) = checkpoint_key {
                    self.write_checkpoint(checkpoint_key, &state, user_id).await;
                }

                if state.next_stage.is_some() {
                    state.last_completed_stage = Some(stage);
                    break;
                }
                if state.failure_info.is_some() || state.response.is_some() {
                    break;
                }
                state.last_completed_stage = Some(stage);
            }

            if state.response.is_some() {
                break;
            }
            if state.next_stage.is_some() {
                state.last_completed_stage = None;
                continue;
            }
            if state.failure_info.is_some() || state.iteration >= self.max_iterations {
                if state.failure_info.is_none() {
                    warn!(pipeline_id = %state.pipeline_id, "pipeline reached max_iterations without a response");
                    state.failure_info = Some(FailureInfo::new(
                        state.current_stage.unwrap_or(PipelineStage::Output),
                        "pipeline",
                        "max_iterations",
                        format!("exceeded max_iterations ({})", self.max_iterations),
                    ));
                }
                break;
            }
        }

        let result = if let Some(failure) = state.failure_info.clone() {
            if state.last_completed_stage != Some(PipelineStage::Error) {
                executor::execute_stage(PipelineStage::Error, &mut state, &deps).await;
            }
            executor::execute_stage(PipelineStage::Output, &mut state, &deps).await;
            match state.response.clone() {
                Some(response) => response,
                None => default_error_response(&failure, &state.pipeline_id),
            }
        } else {
            match state.response.clone() {
                Some(response) => response,
                None => create_default_response("No response generated", &state.pipeline_id),
            }
        };

        state.clear_run_scoped();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::plugin::Plugin;
    use crate::tool::Tool;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Output]
        }

        async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            let history = context.get_conversation_history();
            let first = history.first().map(|e| e.content.clone()).unwrap_or(Value::Null);
            context.set_response(first);
            Ok(())
        }
    }

    struct Calculator;

    #[async_trait]
    impl Plugin for Calculator {
        fn name(&self) -> &str {
            "calculator"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Do]
        }

        async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            let mut params = HashMap::new();
            params.insert("expr".to_string(), Value::from("1+1"));
            context.execute_tool("calc", params);
            Ok(())
        }
    }

    struct Calc;

    #[async_trait]
    impl Tool for Calc {
        fn name(&self) -> &str {
            "calc"
        }

        async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<Value> {
            let expr = params.get("expr").and_then(|v| v.as_str()).unwrap_or_default();
            match expr {
                "1+1" => Ok(Value::from(2)),
                _ => Err(anyhow::anyhow!("unsupported expression '{expr}'")),
            }
        }
    }

    struct CalcResultResponder;

    #[async_trait]
    impl Plugin for CalcResultResponder {
        fn name(&self) -> &str {
            "calc_result_responder"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Output]
        }

        async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            let value = context
                .stage_results()
                .get("calculator_DO_0")
                .cloned()
                .unwrap_or(Value::Null);
            context.set_response(value);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Plugin for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Parse]
        }

        async fn execute(&self, _context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("parse failure")
        }
    }

    #[tokio::test]
    async fn echo_scenario_returns_incoming_message() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(Echo));
        registry.register_plugin_for_stage("echo", PipelineStage::Output).unwrap();

        let resources = Arc::new(ResourceContainer::new(2));
        let pipeline = PipelineLoopBuilder::new(resources).registry(registry).build();

        let response = pipeline.run_message("hello", "user1", "req1", None).await;
        assert_eq!(response, Value::from("hello"));
    }

    #[tokio::test]
    async fn tool_use_scenario_produces_computed_response() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(Calculator));
        registry.register_plugin(Arc::new(CalcResultResponder));
        registry.register_plugin_for_stage("calculator", PipelineStage::Do).unwrap();
        registry
            .register_plugin_for_stage("calc_result_responder", PipelineStage::Output)
            .unwrap();

        let mut tools = ToolRegistry::new(2);
        tools.add(Arc::new(Calc));

        let resources = Arc::new(ResourceContainer::new(2));
        let pipeline = PipelineLoopBuilder::new(resources).registry(registry).tools(tools).build();

        let response = pipeline.run_message("compute", "user1", "req1", None).await;
        assert_eq!(response, Value::from(2));
    }

    #[tokio::test]
    async fn plugin_fault_dispatches_error_and_terminates_with_structured_response() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(AlwaysFails));
        registry.register_plugin_for_stage("always_fails", PipelineStage::Parse).unwrap();

        let resources = Arc::new(ResourceContainer::new(2));
        let pipeline = PipelineLoopBuilder::new(resources).registry(registry).max_iterations(3).build();

        let response = pipeline.run_message("hi", "user1", "req1", None).await;
        assert_eq!(response["error"], Value::from("parse failure"));
        assert_eq!(response["message"], Value::from("Unable to process request"));
        assert_eq!(response["plugin"], Value::from("always_fails"));
        assert_eq!(response["stage"], Value::from("PARSE"));
    }

    struct NeverResponds;

    #[async_trait]
    impl Plugin for NeverResponds {
        fn name(&self) -> &str {
            "never_responds"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Output]
        }

        async fn execute(&self, _context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            // Deliberately never sets a response, never jumps: every outer
            // iteration replays the already-completed stages (all skipped
            // via last_completed_stage) until max_iterations trips.
            Ok(())
        }
    }

    #[tokio::test]
    async fn max_iterations_without_response_is_a_failure() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(NeverResponds));
        registry.register_plugin_for_stage("never_responds", PipelineStage::Output).unwrap();

        let resources = Arc::new(ResourceContainer::new(2));
        let pipeline = PipelineLoopBuilder::new(resources).registry(registry).max_iterations(3).build();

        let response = pipeline.run_message("hi", "user1", "req1", None).await;
        assert_eq!(response["type"], Value::from("max_iterations"));
    }
}
