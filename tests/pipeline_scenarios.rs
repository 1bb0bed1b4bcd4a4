//! End-to-end scenarios against the full pipeline loop, using only the
//! in-crate mocks (`agent_pipeline::mocks`). Run with
//! `cargo test --features test-support`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_pipeline::config::{CircuitBreaker, HotReloadOutcome};
use agent_pipeline::config::reload_plugin;
use agent_pipeline::mocks::MockPlugin;
use agent_pipeline::{PipelineLoopBuilder, PluginRegistry, ResourceContainer, ToolRegistry};
use agent_pipeline::stages::PipelineStage;
use agent_pipeline::Plugin;
use agent_pipeline::PluginContext;
use serde_json::{json, Value};

#[tokio::test]
async fn echo_scenario() {
    let mut registry = PluginRegistry::new();
    registry.register_plugin(Arc::new(MockPlugin::new("echo", vec![PipelineStage::Output], |ctx| {
        let first = ctx.get_conversation_history().first().map(|e| e.content.clone());
        ctx.set_response(first.unwrap_or(Value::Null));
        Ok(())
    })));
    registry.register_plugin_for_stage("echo", PipelineStage::Output).unwrap();

    let resources = Arc::new(ResourceContainer::new(2));
    let pipeline = PipelineLoopBuilder::new(resources).registry(registry).build();

    let response = pipeline.run_message("hi", "user1", "req1", None).await;
    assert_eq!(response, Value::from("hi"));
}

#[tokio::test]
async fn tool_use_scenario() {
    let mut registry = PluginRegistry::new();
    registry.register_plugin(Arc::new(MockPlugin::new("calculator", vec![PipelineStage::Do], |ctx| {
        let mut params = std::collections::HashMap::new();
        params.insert("expr".to_string(), Value::from("1+1"));
        ctx.execute_tool("calc", params);
        Ok(())
    })));
    registry.register_plugin_for_stage("calculator", PipelineStage::Do).unwrap();

    registry.register_plugin(Arc::new(MockPlugin::new(
        "result_reader",
        vec![PipelineStage::Output],
        |ctx| {
            let value = ctx.stage_results().get("calculator_DO_0").cloned().unwrap_or(Value::Null);
            ctx.set_response(value);
            Ok(())
        },
    )));
    registry.register_plugin_for_stage("result_reader", PipelineStage::Output).unwrap();

    let mut tools = ToolRegistry::new(2);
    tools.add(Arc::new(agent_pipeline::mocks::MockTool::fixed("calc", Value::from(2))));

    let resources = Arc::new(ResourceContainer::new(2));
    let pipeline = PipelineLoopBuilder::new(resources).registry(registry).tools(tools).build();

    let response = pipeline.run_message("compute", "user1", "req1", None).await;
    assert_eq!(response, Value::from(2));
}

#[tokio::test]
async fn jump_scenario() {
    let parse_visits = Arc::new(AtomicU32::new(0));
    let visits = parse_visits.clone();

    let mut registry = PluginRegistry::new();
    registry.register_plugin(Arc::new(MockPlugin::new("jumper", vec![PipelineStage::Think], |ctx| {
        ctx.jump_to_stage(PipelineStage::Parse);
        Ok(())
    })));
    registry.register_plugin_for_stage("jumper", PipelineStage::Think).unwrap();

    registry.register_plugin(Arc::new(MockPlugin::new("responder", vec![PipelineStage::Parse], move |ctx| {
        let count = visits.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= 2 {
            ctx.set_response(Value::from("done"));
        }
        Ok(())
    })));
    registry.register_plugin_for_stage("responder", PipelineStage::Parse).unwrap();

    let resources = Arc::new(ResourceContainer::new(2));
    let pipeline = PipelineLoopBuilder::new(resources).registry(registry).max_iterations(5).build();

    let response = pipeline.run_message("x", "user1", "req1", None).await;
    assert_eq!(response, Value::from("done"));
    assert_eq!(parse_visits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn plugin_fault_scenario() {
    let mut registry = PluginRegistry::new();
    registry.register_plugin(Arc::new(MockPlugin::new("BoomPlugin", vec![PipelineStage::Think], |_ctx| {
        anyhow::bail!("boom")
    })));
    registry.register_plugin_for_stage("BoomPlugin", PipelineStage::Think).unwrap();

    let resources = Arc::new(ResourceContainer::new(2));
    let pipeline = PipelineLoopBuilder::new(resources).registry(registry).build();

    let response = pipeline.run_message("hi", "user1", "req1", None).await;
    assert_eq!(response["error"], Value::from("boom"));
    assert_eq!(response["message"], Value::from("Unable to process request"));
    assert_eq!(response["plugin"], Value::from("BoomPlugin"));
    assert_eq!(response["stage"], Value::from("THINK"));
    assert_eq!(response["type"], Value::from("plugin_error"));
    assert!(response["error_id"].is_string());
}

#[tokio::test]
async fn max_iterations_scenario() {
    let mut registry = PluginRegistry::new();
    registry.register_plugin(Arc::new(MockPlugin::new("noop", vec![PipelineStage::Do], |_ctx| Ok(()))));
    registry.register_plugin_for_stage("noop", PipelineStage::Do).unwrap();

    let resources = Arc::new(ResourceContainer::new(2));
    let pipeline = PipelineLoopBuilder::new(resources).registry(registry).max_iterations(3).build();

    let response = pipeline.run_message("hi", "user1", "req1", None).await;
    assert_eq!(response["type"], Value::from("max_iterations"));
}

#[tokio::test]
async fn hot_reload_failure_rollback_scenario() {
    struct Versioned {
        active: std::sync::Mutex<Value>,
    }

    #[async_trait::async_trait]
    impl Plugin for Versioned {
        fn name(&self) -> &str {
            "versioned"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Think]
        }

        async fn execute(&self, _context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }

        fn update_config(&self, new_config: &Value) -> anyhow::Result<()> {
            *self.active.lock().unwrap() = new_config.clone();
            Ok(())
        }

        fn rollback_config(&self, previous_version: &Value) -> anyhow::Result<()> {
            *self.active.lock().unwrap() = previous_version.clone();
            Ok(())
        }

        async fn validate_runtime(&self) -> agent_pipeline::ValidationResult {
            agent_pipeline::ValidationResult::failure(vec!["v2 fails runtime validation".to_string()])
        }
    }

    let plugin = Versioned { active: std::sync::Mutex::new(json!("v1")) };
    let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));

    let outcome = reload_plugin(&plugin, &json!("v2"), &json!("v1"), &[], &mut breaker).await;

    assert!(matches!(outcome, HotReloadOutcome::RolledBack { .. }));
    assert_eq!(*plugin.active.lock().unwrap(), json!("v1"));
}
