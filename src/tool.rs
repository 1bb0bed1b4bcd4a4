//! Tool Registry & Dispatcher (C3).
//!
//! Holds tool callables keyed by name, executes queued tool calls with
//! bounded concurrency, and resolves intent-based discovery queries.
//!
//! Grounded on `entity/core/registries.py`'s `ToolRegistry` (intent
//! discovery) and `entity/pipeline/tools/execution.py`'s
//! `execute_pending_tools` (the semaphore-bounded drain).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::ValidationResult;
use crate::stages::PipelineStage;
use crate::state::{ConversationEntry, FailureInfo, PipelineState, Role};

/// A named, independently invocable unit of side-effecting behavior.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Declared intents for [`ToolRegistry::discover`]. Empty by default.
    fn intents(&self) -> &[String] {
        &[]
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<Value>;

    fn validate_params(&self, _params: &HashMap<String, Value>) -> ValidationResult {
        ValidationResult::success()
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    pub concurrency_limit: usize,
}

impl ToolRegistry {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            tools: HashMap::new(),
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Filtered tool lookup by name and/or declared intent.
    ///
    /// Intent filter rule (spec §4.3): when multiple tools declare the same
    /// intent AND at least one declares it exclusively (sole intent), tools
    /// that list the intent first but with additional intents are dropped;
    /// tools where the intent appears in a non-first position are retained.
    /// This is implemented exactly as specified, including the asymmetry
    /// between first-position and later-position matches — it is not
    /// "fixed" here even though it reads like a heuristic artifact.
    pub fn discover(&self, name: Option<&str>, intent: Option<&str>) -> Vec<Arc<dyn Tool>> {
        let mut candidates: Vec<Arc<dyn Tool>> = self.tools.values().cloned().collect();
        if let Some(n) = name {
            candidates.retain(|t| t.name() == n);
        }

        let Some(raw_intent) = intent else {
            return candidates;
        };
        let normalized = raw_intent.trim().to_lowercase();

        let matches: Vec<Arc<dyn Tool>> = candidates
            .into_iter()
            .filter(|t| t.intents().iter().any(|i| i.to_lowercase() == normalized))
            .collect();

        let has_exclusive = matches
            .iter()
            .any(|t| t.intents().len() == 1 && t.intents()[0].to_lowercase() == normalized);

        if !has_exclusive {
            return matches;
        }

        matches
            .into_iter()
            .filter(|t| {
                let intents = t.intents();
                let lists_first = intents.first().map(|s| s.to_lowercase()) == Some(normalized.clone());
                !(lists_first && intents.len() > 1)
            })
            .collect()
    }
}

/// Drains `state.pending_tool_calls`, bounded by `tool_registry.concurrency_limit`.
///
/// All queued calls are started concurrently (spawned immediately); each
/// waits on the semaphore before invoking its tool. Results are appended in
/// scheduling order — the order calls were originally queued — not
/// completion order, preserving deterministic replay (spec §4.3, §5).
///
/// On the first tool failure, `state.failure_info` is set and any
/// not-yet-awaited calls are aborted; their results, even if the underlying
/// task completes, are discarded.
pub async fn drain(tool_registry: &ToolRegistry, state: &mut PipelineState, stage: PipelineStage) {
    let calls = std::mem::take(&mut state.pending_tool_calls);
    if calls.is_empty() {
        return;
    }

    let semaphore = Arc::new(Semaphore::new(tool_registry.concurrency_limit));
    let mut handles = Vec::with_capacity(calls.len());

    for call in calls {
        let tool = tool_registry.get(&call.name);
        let sem = semaphore.clone();
        let params = call.params.clone();
        let handle = tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore is never closed");
            match tool {
                Some(tool) => tool.execute(params).await,
                None => Err(anyhow::anyhow!("tool '{}' is not registered", call.name)),
            }
        });
        handles.push((call.name, call.result_key, handle));
    }

    let mut aborted = false;
    for (name, result_key, handle) in handles {
        if aborted {
            handle.abort();
            continue;
        }

        let outcome = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::anyhow!(join_err)),
        };

        match outcome {
            Ok(result) => {
                state.stage_results.insert(result_key, result.clone());
                let mut metadata = HashMap::new();
                metadata.insert("tool_name".to_string(), Value::from(name.clone()));
                metadata.insert("stage".to_string(), Value::from(stage.to_string()));
                state.conversation.push(
                    ConversationEntry::new(Value::from(format!("Tool result: {result}")), Role::System)
                        .with_metadata(metadata),
                );
            }
            Err(e) => {
                state.failure_info = Some(FailureInfo::new(stage, name, "tool_error", e.to_string()));
                aborted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    struct Intent {
        name: &'static str,
        intents: Vec<String>,
    }

    #[async_trait]
    impl Tool for Intent {
        fn name(&self) -> &str {
            self.name
        }

        fn intents(&self) -> &[String] {
            &self.intents
        }

        async fn execute(&self, _params: HashMap<String, Value>) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn drain_stores_result_and_appends_system_entry() {
        let mut registry = ToolRegistry::new(2);
        registry.add(Arc::new(Calc));

        let mut state = PipelineState::fresh("p1", "compute");
        let mut params = HashMap::new();
        params.insert("expr".to_string(), Value::from("1+1"));
        state.pending_tool_calls.push(crate::state::ToolCall {
            name: "calc".to_string(),
            params,
            result_key: "r1".to_string(),
        });

        drain(&registry, &mut state, PipelineStage::Do).await;

        assert_eq!(state.stage_results.get("r1"), Some(&Value::from(2)));
        assert!(state.pending_tool_calls.is_empty());
        let last = state.conversation.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert_eq!(last.content, Value::from("Tool result: 2"));
    }

    #[tokio::test]
    async fn drain_sets_failure_info_on_tool_error_and_aborts_remaining() {
        let mut registry = ToolRegistry::new(2);
        registry.add(Arc::new(Calc));

        let mut state = PipelineState::fresh("p1", "compute");
        state.pending_tool_calls.push(crate::state::ToolCall {
            name: "calc".to_string(),
            params: HashMap::new(),
            result_key: "bad".to_string(),
        });
        state.pending_tool_calls.push(crate::state::ToolCall {
            name: "calc".to_string(),
            params: {
                let mut p = HashMap::new();
                p.insert("expr".to_string(), Value::from("1+1"));
                p
            },
            result_key: "good".to_string(),
        });

        drain(&registry, &mut state, PipelineStage::Do).await;
        assert!(state.failure_info.is_some());
        assert!(!state.stage_results.contains_key("good"));
    }

    #[test]
    fn discover_drops_nonexclusive_first_listed_matches() {
        let mut registry = ToolRegistry::new(1);
        registry.add(Arc::new(Intent {
            name: "exclusive",
            intents: vec!["search".to_string()],
        }));
        registry.add(Arc::new(Intent {
            name: "first_but_shared",
            intents: vec!["search".to_string(), "browse".to_string()],
        }));
        registry.add(Arc::new(Intent {
            name: "search_secondary",
            intents: vec!["browse".to_string(), "search".to_string()],
        }));

        let found = registry.discover(None, Some("search"));
        let names: Vec<&str> = found.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"exclusive"));
        assert!(names.contains(&"search_secondary"));
        assert!(!names.contains(&"first_but_shared"));
    }

    #[test]
    fn discover_without_exclusive_match_keeps_everything() {
        let mut registry = ToolRegistry::new(1);
        registry.add(Arc::new(Intent {
            name: "a",
            intents: vec!["search".to_string(), "browse".to_string()],
        }));
        registry.add(Arc::new(Intent {
            name: "b",
            intents: vec!["browse".to_string(), "search".to_string()],
        }));

        let found = registry.discover(None, Some("search"));
        assert_eq!(found.len(), 2);
    }
}
