//! In-crate mock resources, tools, and plugins for tests and the
//! integration scenarios in `tests/pipeline_scenarios.rs`.
//!
//! Grounded on `backend/mock.rs`'s `MockBackend` (canned, order-cycling
//! responses via an `AtomicUsize` counter).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::PluginContext;
use crate::error::ValidationResult;
use crate::plugin::Plugin;
use crate::resource::{MemoryResource, Resource};
use crate::stages::PipelineStage;
use crate::state::ConversationEntry;
use crate::tool::Tool;

/// An in-memory, process-local [`MemoryResource`] for tests. Conversations
/// and persistent keys are scoped by `(pipeline_id or key, user_id)`.
#[derive(Default)]
pub struct MockMemoryResource {
    conversations: Mutex<HashMap<(String, String), Vec<ConversationEntry>>>,
    persistent: Mutex<HashMap<(String, String), Value>>,
}

impl MockMemoryResource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Resource for MockMemoryResource {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_memory_resource(&self) -> Option<&dyn MemoryResource> {
        Some(self)
    }
}

#[async_trait]
impl MemoryResource for MockMemoryResource {
    async fn load_conversation(&self, pipeline_id: &str, user_id: &str) -> anyhow::Result<Vec<ConversationEntry>> {
        let key = (pipeline_id.to_string(), user_id.to_string());
        Ok(self.conversations.lock().unwrap().get(&key).cloned().unwrap_or_default())
    }

    async fn save_conversation(&self, pipeline_id: &str, entries: &[ConversationEntry], user_id: &str) -> anyhow::Result<()> {
        let key = (pipeline_id.to_string(), user_id.to_string());
        self.conversations.lock().unwrap().insert(key, entries.to_vec());
        Ok(())
    }

    async fn fetch_persistent(&self, key: &str, user_id: &str) -> anyhow::Result<Option<Value>> {
        let composite = (key.to_string(), user_id.to_string());
        Ok(self.persistent.lock().unwrap().get(&composite).cloned())
    }

    async fn store_persistent(&self, key: &str, value: Value, user_id: &str) -> anyhow::Result<()> {
        let composite = (key.to_string(), user_id.to_string());
        self.persistent.lock().unwrap().insert(composite, value);
        Ok(())
    }
}

/// A plain (non-memory) resource for dependency-injection tests: stores a
/// single `Value` set at construction time.
pub struct MockResource {
    pub value: Value,
}

impl MockResource {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Resource for MockResource {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A tool that returns canned responses in order, cycling once exhausted.
/// Mirrors `backend::MockBackend`'s behavior for the tool-dispatch surface.
pub struct MockTool {
    name: String,
    intents: Vec<String>,
    responses: Vec<Value>,
    index: AtomicUsize,
}

impl MockTool {
    pub fn new(name: impl Into<String>, responses: Vec<Value>) -> Self {
        assert!(!responses.is_empty(), "MockTool requires at least one response");
        Self { name: name.into(), intents: Vec::new(), responses, index: AtomicUsize::new(0) }
    }

    pub fn fixed(name: impl Into<String>, response: Value) -> Self {
        Self::new(name, vec![response])
    }

    pub fn with_intents(mut self, intents: Vec<String>) -> Self {
        self.intents = intents;
        self
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn intents(&self) -> &[String] {
        &self.intents
    }

    async fn execute(&self, _params: HashMap<String, Value>) -> anyhow::Result<Value> {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        Ok(self.responses[idx].clone())
    }
}

/// A plugin that runs a closure against its context. Lets scenario tests
/// define ad hoc stage behavior without a dedicated struct per case.
pub struct MockPlugin<F>
where
    F: Fn(&mut PluginContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    name: String,
    stages: Vec<PipelineStage>,
    dependencies: Vec<String>,
    behavior: F,
}

impl<F> MockPlugin<F>
where
    F: Fn(&mut PluginContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, stages: Vec<PipelineStage>, behavior: F) -> Self {
        Self { name: name.into(), stages, dependencies: Vec::new(), behavior }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

#[async_trait]
impl<F> Plugin for MockPlugin<F>
where
    F: Fn(&mut PluginContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    async fn execute(&self, context: &mut PluginContext<'_>) -> anyhow::Result<()> {
        (self.behavior)(context)
    }

    fn validate_config(&self, _config: &Value) -> ValidationResult {
        ValidationResult::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_memory_round_trips_conversation_and_persistent_keys() {
        let memory = MockMemoryResource::new();
        let entries = vec![ConversationEntry::new(Value::from("hi"), crate::state::Role::User)];
        memory.save_conversation("p1", &entries, "u1").await.unwrap();
        let loaded = memory.load_conversation("p1", "u1").await.unwrap();
        assert_eq!(loaded.len(), 1);

        memory.store_persistent("k1", Value::from(42), "u1").await.unwrap();
        let fetched = memory.fetch_persistent("k1", "u1").await.unwrap();
        assert_eq!(fetched, Some(Value::from(42)));
    }

    #[tokio::test]
    async fn mock_tool_cycles_canned_responses() {
        let tool = MockTool::new("echo", vec![Value::from(1), Value::from(2)]);
        let a = tool.execute(HashMap::new()).await.unwrap();
        let b = tool.execute(HashMap::new()).await.unwrap();
        let c = tool.execute(HashMap::new()).await.unwrap();
        assert_eq!((a, b, c), (Value::from(1), Value::from(2), Value::from(1)));
    }
}
