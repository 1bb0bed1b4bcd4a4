//! Resource Container (C1).
//!
//! Registers resource factories with layer annotations, instantiates them in
//! dependency order, injects declared dependencies by name, initializes them,
//! offers typed lookup, shuts them down in reverse order, and reports health.
//!
//! Grounded on `entity/core/resources/container.py`'s `ResourceContainer` /
//! `ResourcePool` / `DependencyGraph`. Uses `async_trait` (already in the
//! dependency stack) rather than hand-rolled `BoxFut` futures since the
//! `Resource` trait has several async methods with default bodies.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};

use crate::depgraph::{parse_dependency, DependencyGraph};
use crate::error::{InitializationError, ValidationResult};
use crate::state::ConversationEntry;

/// Layer semantics (spec §3, ResourceEntry): dependency edges must cross
/// exactly one layer boundary (`dependent.layer - dependency.layer == 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Layer {
    Infrastructure = 1,
    ResourceInterface = 2,
    Domain = 3,
    PluginFacing = 4,
}

impl Layer {
    fn value(&self) -> i32 {
        *self as i32
    }
}

/// Anything the container can hand back to a plugin through
/// [`crate::context::PluginContext::get_resource`].
///
/// All methods have default no-op bodies: most resources only need a subset.
#[async_trait]
pub trait Resource: Send + Sync + Any {
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }

    /// Allows the container to hand dependents a concrete reference to
    /// inspect, e.g. downcast to a domain-specific resource type.
    fn as_any(&self) -> &dyn Any;

    /// Trait-object cast to [`MemoryResource`], for the Stage Executor's
    /// memory load/save hooks (spec §4.6 steps 1/5). `None` for any
    /// resource that isn't the memory resource; implementors of
    /// `MemoryResource` override this to return `Some(self)`.
    fn as_memory_resource(&self) -> Option<&dyn MemoryResource> {
        None
    }
}

/// The memory resource's extended interface (spec §6): conversation
/// persistence and the generic persistent key/value store used for
/// temporary-thought sharing and checkpoints.
#[async_trait]
pub trait MemoryResource: Resource {
    async fn load_conversation(
        &self,
        pipeline_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Vec<ConversationEntry>>;

    async fn save_conversation(
        &self,
        pipeline_id: &str,
        entries: &[ConversationEntry],
        user_id: &str,
    ) -> anyhow::Result<()>;

    async fn fetch_persistent(&self, key: &str, user_id: &str) -> anyhow::Result<Option<Value>>;

    async fn store_persistent(&self, key: &str, value: Value, user_id: &str) -> anyhow::Result<()>;
}

/// A resolved reference to a dependency resource, injected by name at build
/// time. Optional dependencies resolve to `None` when absent.
pub type InjectedDeps = HashMap<String, Option<Arc<dyn Resource>>>;

/// Factory for a registered resource: the Rust analogue of the original's
/// class-level `validate_config` plus constructor.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    fn validate_config(&self, config: &Value) -> ValidationResult;

    async fn create(&self, config: Value, deps: InjectedDeps) -> anyhow::Result<Arc<dyn Resource>>;
}

struct Registration {
    factory: Arc<dyn ResourceFactory>,
    config: Value,
    dependencies: Vec<String>,
    layer: Layer,
    pool_config: Option<PoolConfig>,
}

/// Pool sizing knobs (spec §4.1). `min_size` is provisioned eagerly at
/// `build_all`; `max_size` bounds total growth.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub scale_threshold: f64,
    pub scale_step: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            scale_threshold: 0.8,
            scale_step: 1,
        }
    }
}

/// A pool of homogeneous resource instances behind a single registered name.
///
/// Grounded on `ResourcePool` (`container.py`): an async queue of idle
/// instances, grown on demand up to `max_size`, with scale-up triggered once
/// utilization crosses `scale_threshold`.
pub struct ResourcePool {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory>,
    resource_config: Value,
    idle: Mutex<Vec<Arc<dyn Resource>>>,
    total: Mutex<usize>,
    in_use: Mutex<usize>,
}

impl ResourcePool {
    async fn new(
        config: PoolConfig,
        factory: Arc<dyn ResourceFactory>,
        resource_config: Value,
    ) -> anyhow::Result<Self> {
        let pool = Self {
            config,
            factory,
            resource_config,
            idle: Mutex::new(Vec::new()),
            total: Mutex::new(0),
            in_use: Mutex::new(0),
        };
        for _ in 0..config.min_size {
            pool.grow().await?;
        }
        Ok(pool)
    }

    async fn grow(&self) -> anyhow::Result<()> {
        let instance = self
            .factory
            .create(self.resource_config.clone(), HashMap::new())
            .await?;
        instance.initialize().await?;
        self.idle.lock().await.push(instance);
        *self.total.lock().await += 1;
        Ok(())
    }

    async fn utilization(&self) -> f64 {
        let total = *self.total.lock().await;
        if total == 0 {
            return 0.0;
        }
        *self.in_use.lock().await as f64 / total as f64
    }

    pub async fn acquire(&self) -> anyhow::Result<Arc<dyn Resource>> {
        let mut idle = self.idle.lock().await;
        if idle.is_empty() && *self.total.lock().await < self.config.max_size {
            drop(idle);
            self.grow().await?;
            idle = self.idle.lock().await;
        }
        let instance = idle.pop();
        drop(idle);

        if self.utilization().await >= self.config.scale_threshold {
            let total = *self.total.lock().await;
            let headroom = self.config.max_size.saturating_sub(total);
            let step = self.config.scale_step.min(headroom);
            for _ in 0..step {
                self.grow().await?;
            }
        }

        match instance {
            Some(res) => {
                *self.in_use.lock().await += 1;
                Ok(res)
            }
            None => anyhow::bail!("resource pool exhausted at max_size={}", self.config.max_size),
        }
    }

    pub async fn release(&self, resource: Arc<dyn Resource>) {
        self.idle.lock().await.push(resource);
        let mut in_use = self.in_use.lock().await;
        *in_use = in_use.saturating_sub(1);
    }

    pub async fn metrics(&self) -> (usize, usize, f64) {
        (*self.total.lock().await, *self.in_use.lock().await, self.utilization().await)
    }
}

/// Registers, builds, and owns the lifetime of every resource in the
/// process. Shared read-mostly across concurrently running pipelines.
pub struct ResourceContainer {
    registrations: HashMap<String, Registration>,
    instances: RwLock<HashMap<String, Arc<dyn Resource>>>,
    pools: RwLock<HashMap<String, Arc<ResourcePool>>>,
    init_order: RwLock<Vec<String>>,
    /// Global bound on concurrently executing tool calls across all pipelines
    /// (spec §5, "this bound is global"). Not a resource itself, but owned
    /// here so the container and the Tool Dispatcher share one lifetime.
    pub tool_concurrency: Arc<Semaphore>,
}

impl Default for ResourceContainer {
    fn default() -> Self {
        Self::new(5)
    }
}

impl ResourceContainer {
    pub fn new(tool_concurrency_limit: usize) -> Self {
        Self {
            registrations: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            init_order: RwLock::new(Vec::new()),
            tool_concurrency: Arc::new(Semaphore::new(tool_concurrency_limit.max(1))),
        }
    }

    /// Idempotent by name: a later registration overwrites an earlier one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ResourceFactory>,
        config: Value,
        dependencies: Vec<String>,
        layer: Layer,
    ) {
        self.registrations.insert(
            name.into(),
            Registration {
                factory,
                config,
                dependencies,
                layer,
                pool_config: None,
            },
        );
    }

    /// Like [`Self::register`] but the resource is accessed through a
    /// [`ResourcePool`] instead of a single shared instance.
    pub fn register_pool(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ResourceFactory>,
        config: Value,
        dependencies: Vec<String>,
        layer: Layer,
        pool_config: PoolConfig,
    ) {
        self.registrations.insert(
            name.into(),
            Registration {
                factory,
                config,
                dependencies,
                layer,
                pool_config: Some(pool_config),
            },
        );
    }

    fn validate_layers(&self) -> Result<(), InitializationError> {
        for (name, reg) in &self.registrations {
            if reg.layer == Layer::Infrastructure && !reg.dependencies.is_empty() {
                return Err(InitializationError::new(
                    name,
                    "layer validation",
                    "infrastructure-layer resources must not declare dependencies",
                ));
            }
            for dep_spec in &reg.dependencies {
                let (dep_name, optional) = parse_dependency(dep_spec);
                let Some(dep_reg) = self.registrations.get(&dep_name) else {
                    if optional {
                        continue;
                    }
                    return Err(InitializationError::new(
                        name,
                        "layer validation",
                        format!("required dependency '{dep_name}' is not registered"),
                    ));
                };
                if reg.layer.value() - dep_reg.layer.value() != 1 {
                    return Err(InitializationError::new(
                        name,
                        "layer validation",
                        format!(
                            "dependency '{dep_name}' (layer {}) does not cross exactly one boundary into layer {}",
                            dep_reg.layer.value(),
                            reg.layer.value()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn resolve_order(&self) -> Result<Vec<String>, InitializationError> {
        let mut edges: HashMap<String, Vec<String>> =
            self.registrations.keys().map(|n| (n.clone(), Vec::new())).collect();
        for (name, reg) in &self.registrations {
            for dep_spec in &reg.dependencies {
                let (dep_name, _) = parse_dependency(dep_spec);
                if let Some(dependents) = edges.get_mut(&dep_name) {
                    dependents.push(name.clone());
                }
            }
        }
        DependencyGraph::new(edges).topological_sort()
    }

    /// Validates layer rules, topologically sorts across the whole
    /// registration set, then builds each resource in order: validate
    /// config, validate dependencies, instantiate, inject, initialize,
    /// health-check.
    pub async fn build_all(&self) -> Result<(), InitializationError> {
        self.validate_layers()?;
        let order = self.resolve_order()?;

        let mut built: HashMap<String, Arc<dyn Resource>> = HashMap::new();
        let mut init_order = Vec::new();

        for name in &order {
            let reg = self.registrations.get(name).expect("name came from own registrations");

            let outcome = reg.factory.validate_config(&reg.config);
            if !outcome.success {
                return Err(InitializationError::new(name, "config validation", outcome.message()));
            }

            let mut deps: InjectedDeps = HashMap::new();
            for dep_spec in &reg.dependencies {
                let (dep_name, optional) = parse_dependency(dep_spec);
                match built.get(&dep_name) {
                    Some(instance) => {
                        deps.insert(dep_name, Some(instance.clone()));
                    }
                    None if optional => {
                        deps.insert(dep_name, None);
                    }
                    None => {
                        return Err(InitializationError::new(
                            name,
                            "dependency injection",
                            format!("required dependency '{dep_name}' failed to build"),
                        ));
                    }
                }
            }

            if let Some(pool_config) = reg.pool_config {
                let pool = ResourcePool::new(pool_config, reg.factory.clone(), reg.config.clone())
                    .await
                    .map_err(|e| InitializationError::new(name, "pool instantiation", e.to_string()))?;
                self.pools.write().await.insert(name.clone(), Arc::new(pool));
                init_order.push(name.clone());
                continue;
            }

            let instance = reg
                .factory
                .create(reg.config.clone(), deps)
                .await
                .map_err(|e| InitializationError::new(name, "instantiation", e.to_string()))?;

            instance
                .initialize()
                .await
                .map_err(|e| InitializationError::new(name, "initialize", e.to_string()))?;

            if !instance.health_check().await {
                return Err(InitializationError::new(name, "health check", "health_check returned false"));
            }

            built.insert(name.clone(), instance);
            init_order.push(name.clone());
        }

        *self.instances.write().await = built;
        *self.init_order.write().await = init_order;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Resource>> {
        self.instances.read().await.get(name).cloned()
    }

    /// Calls `shutdown` on every initialized resource in reverse
    /// initialization order. Errors are collected and reported but never
    /// abort subsequent shutdowns.
    pub async fn shutdown_all(&self) -> Vec<(String, anyhow::Error)> {
        let order = self.init_order.read().await.clone();
        let instances = self.instances.read().await;
        let mut errors = Vec::new();
        for name in order.into_iter().rev() {
            if let Some(instance) = instances.get(&name) {
                if let Err(e) = instance.shutdown().await {
                    errors.push((name, e));
                }
            }
        }
        errors
    }

    pub async fn health_report(&self) -> HashMap<String, bool> {
        let instances = self.instances.read().await;
        let mut report = HashMap::new();
        for (name, instance) in instances.iter() {
            report.insert(name.clone(), instance.health_check().await);
        }
        report
    }

    pub async fn acquire(&self, name: &str) -> anyhow::Result<Arc<dyn Resource>> {
        if let Some(pool) = self.pools.read().await.get(name) {
            return pool.acquire().await;
        }
        self.get(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("no resource or pool registered under '{name}'"))
    }

    pub async fn release(&self, name: &str, resource: Arc<dyn Resource>) {
        if let Some(pool) = self.pools.read().await.get(name) {
            pool.release(resource).await;
        }
    }
}
