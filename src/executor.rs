//! Stage Executor (C6).
//!
//! Executes all plugins of one stage in registration order, handling memory
//! load/save, tool drains, failure capture, and ERROR-stage dispatch.
//!
//! Grounded on `entity/pipeline/pipeline.py`'s `execute_stage`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::PluginContext;
use crate::events::{self, Event, EventHandler};
use crate::registry::PluginRegistry;
use crate::resource::ResourceContainer;
use crate::stages::PipelineStage;
use crate::state::{FailureInfo, PipelineState};
use crate::tool::{self, ToolRegistry};
use crate::workflow::Workflow;

/// A pure-of-state validation hook run before each plugin invocation within
/// a stage. Grounded on the original's `registries.validators.validate`.
pub type StageValidator = Arc<dyn Fn(&PipelineState, PipelineStage) -> crate::error::ValidationResult + Send + Sync>;

#[derive(Default, Clone)]
pub struct Validators {
    by_stage: HashMap<PipelineStage, Vec<StageValidator>>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: PipelineStage, validator: StageValidator) {
        self.by_stage.entry(stage).or_default().push(validator);
    }

    pub fn validate(&self, stage: PipelineStage, state: &PipelineState) -> crate::error::ValidationResult {
        let Some(validators) = self.by_stage.get(&stage) else {
            return crate::error::ValidationResult::success();
        };
        for validator in validators {
            let outcome = validator(state, stage);
            if !outcome.success {
                return outcome;
            }
        }
        crate::error::ValidationResult::success()
    }
}

/// Everything the executor needs that doesn't change between stage visits
/// within one pipeline run — bundled so [`execute_stage`] doesn't take nine
/// positional arguments.
pub struct ExecutorDeps<'a> {
    pub registry: &'a PluginRegistry,
    pub tools: &'a ToolRegistry,
    pub resources: &'a Arc<ResourceContainer>,
    pub workflow: Option<&'a Workflow>,
    pub validators: Option<&'a Validators>,
    pub request_id: &'a str,
    pub user_id: &'a str,
    pub events: Option<&'a Arc<dyn EventHandler>>,
}

fn notify(deps: &ExecutorDeps<'_>, event: Event) {
    events::emit(deps.events, event);
}

async fn load_memory(deps: &ExecutorDeps<'_>, state: &mut PipelineState) {
    let Some(memory) = deps.resources.get("memory").await else {
        return;
    };
    let Some(memory) = memory.as_memory_resource() else {
        return;
    };
    if let Ok(entries) = memory.load_conversation(&state.pipeline_id, deps.user_id).await {
        if !entries.is_empty() {
            state.conversation = entries;
        }
    }
    if let Ok(Some(thoughts)) = memory
        .fetch_persistent(&format!("{}_temp", state.pipeline_id), deps.user_id)
        .await
    {
        if let Some(map) = thoughts.as_object() {
            state.temporary_thoughts = map.clone().into_iter().collect();
        }
    }
}

async fn save_memory(deps: &ExecutorDeps<'_>, state: &PipelineState) {
    let Some(memory) = deps.resources.get("memory").await else {
        return;
    };
    let Some(memory) = memory.as_memory_resource() else {
        return;
    };
    let _ = memory.save_conversation(&state.pipeline_id, &state.conversation, deps.user_id).await;
    let thoughts = Value::Object(state.temporary_thoughts.clone().into_iter().collect());
    let _ = memory
        .store_persistent(&format!("{}_temp", state.pipeline_id), thoughts, deps.user_id)
        .await;
}

/// Which plugins run for `stage`, in order: the workflow's list if it
/// overrides this stage, else the registry's natural registration order
/// (spec §4.9).
fn resolve_plugin_names(deps: &ExecutorDeps<'_>, stage: PipelineStage) -> Vec<String> {
    match deps.workflow.and_then(|w| w.plugins_for(stage)) {
        Some(names) => names.to_vec(),
        None => deps
            .registry
            .plugins_for_stage(stage)
            .iter()
            .map(|p| p.name().to_string())
            .collect(),
    }
}

/// Runs one stage's plugin list against `state`, draining tool calls and
/// recursing into ERROR on the first fault. Boxed because it recurses into
/// itself for ERROR dispatch (spec §4.6 step 4) — `async fn` can't call
/// itself directly without erasing the future's type at the call site.
pub fn execute_stage<'a>(
    stage: PipelineStage,
    state: &'a mut PipelineState,
    deps: &'a ExecutorDeps<'a>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        load_memory(deps, state).await;
        state.current_stage = Some(stage);

        notify(deps, Event::StageStart { pipeline_id: state.pipeline_id.clone(), stage });

        let plugin_names = resolve_plugin_names(deps, stage);

        for name in plugin_names {
            let Some(plugin) = deps.registry.get_by_name(&name) else {
                continue;
            };

            if let Some(validators) = deps.validators {
                let outcome = validators.validate(stage, state);
                if !outcome.success {
                    state.failure_info = Some(FailureInfo::new(
                        stage,
                        name.clone(),
                        "validation_error",
                        outcome.message(),
                    ));
                    break;
                }
            }

            notify(deps, Event::PluginStart { pipeline_id: state.pipeline_id.clone(), plugin: name.clone(), stage });

            let invocation = {
                let mut ctx = PluginContext::new(
                    state,
                    deps.resources.clone(),
                    name.clone(),
                    stage,
                    deps.request_id,
                    deps.user_id,
                );
                plugin.execute(&mut ctx).await
            };

            notify(
                deps,
                Event::PluginEnd {
                    pipeline_id: state.pipeline_id.clone(),
                    plugin: name.clone(),
                    stage,
                    ok: invocation.is_ok(),
                },
            );

            if let Err(e) = invocation {
                state.failure_info = Some(
                    FailureInfo::new(stage, name.clone(), "plugin_error", e.to_string())
                        .with_original_exception(format!("{e:?}")),
                );
                notify(
                    deps,
                    Event::Failure {
                        pipeline_id: state.pipeline_id.clone(),
                        stage,
                        plugin: name.clone(),
                        error_type: "plugin_error".to_string(),
                    },
                );
            }

            if state.response.is_some() && stage == PipelineStage::Output {
                break;
            }

            if !state.pending_tool_calls.is_empty() {
                notify(
                    deps,
                    Event::ToolDispatch {
                        pipeline_id: state.pipeline_id.clone(),
                        stage,
                        tool_count: state.pending_tool_calls.len(),
                    },
                );
                tool::drain(deps.tools, state, stage).await;
            }

            if state.failure_info.is_some() {
                break;
            }
        }

        notify(
            deps,
            Event::StageEnd { pipeline_id: state.pipeline_id.clone(), stage, ok: state.failure_info.is_none() },
        );

        if state.failure_info.is_some() && stage != PipelineStage::Error {
            execute_stage(PipelineStage::Error, state, deps).await;
            state.last_completed_stage = Some(PipelineStage::Error);
        }

        save_memory(deps, state).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Plugin;
    use crate::registry::PluginRegistry;
    use crate::tool::ToolRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct Responder;

    #[async_trait]
    impl Plugin for Responder {
        fn name(&self) -> &str {
            "responder"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Output]
        }

        async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            context.set_response(Value::from("done"));
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl Plugin for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn stages(&self) -> &[PipelineStage] {
            &[PipelineStage::Do]
        }

        async fn execute(&self, _context: &mut PluginContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn responder_sets_response_and_short_circuits() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(Responder));
        registry.register_plugin_for_stage("responder", PipelineStage::Output).unwrap();

        let tools = ToolRegistry::new(2);
        let resources = Arc::new(ResourceContainer::new(2));
        let deps = ExecutorDeps {
            registry: &registry,
            tools: &tools,
            resources: &resources,
            workflow: None,
            validators: None,
            request_id: "r1",
            user_id: "u1",
            events: None,
        };

        let mut state = PipelineState::fresh("p1", "hi");
        execute_stage(PipelineStage::Output, &mut state, &deps).await;
        assert_eq!(state.response, Some(Value::from("done")));
    }

    #[tokio::test]
    async fn faulty_plugin_dispatches_to_error_stage() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(Faulty));
        registry.register_plugin_for_stage("faulty", PipelineStage::Do).unwrap();

        let tools = ToolRegistry::new(2);
        let resources = Arc::new(ResourceContainer::new(2));
        let deps = ExecutorDeps {
            registry: &registry,
            tools: &tools,
            resources: &resources,
            workflow: None,
            validators: None,
            request_id: "r1",
            user_id: "u1",
            events: None,
        };

        let mut state = PipelineState::fresh("p1", "hi");
        execute_stage(PipelineStage::Do, &mut state, &deps).await;
        assert!(state.failure_info.is_some());
        assert_eq!(state.last_completed_stage, Some(PipelineStage::Error));
    }

    #[tokio::test]
    async fn workflow_override_restricts_and_orders_plugins() {
        let mut registry = PluginRegistry::new();
        registry.register_plugin(Arc::new(Responder));
        // Not scheduled via register_plugin_for_stage; only the workflow lists it.
        let tools = ToolRegistry::new(2);
        let resources = Arc::new(ResourceContainer::new(2));
        let workflow = Workflow::new().with_stage(PipelineStage::Output, vec!["responder".to_string()]);
        let deps = ExecutorDeps {
            registry: &registry,
            tools: &tools,
            resources: &resources,
            workflow: Some(&workflow),
            validators: None,
            request_id: "r1",
            user_id: "u1",
            events: None,
        };

        let mut state = PipelineState::fresh("p1", "hi");
        execute_stage(PipelineStage::Output, &mut state, &deps).await;
        assert_eq!(state.response, Some(Value::from("done")));
        let _ = Map::<String, Value>::new();
    }
}
