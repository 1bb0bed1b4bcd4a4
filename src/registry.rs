//! Plugin Registry (C2).
//!
//! Records plugins indexed by stage and by name, tracks declared
//! capabilities, validates the plugin dependency graph (a DAG), and resolves
//! lookups for the Stage Executor.
//!
//! Grounded on `entity/core/registries.py`'s `PluginRegistry`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::depgraph::{parse_dependency, DependencyGraph};
use crate::error::InitializationError;
use crate::plugin::{Plugin, PluginCapabilities};
use crate::stages::PipelineStage;

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    /// Per-stage plugin name lists in insertion order. Insertion order IS
    /// execution order within a stage (spec §4.2).
    stage_plugins: HashMap<PipelineStage, Vec<String>>,
    capabilities: HashMap<String, PluginCapabilities>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the plugin under its own name for dependency-graph
    /// validation and `get_by_name` lookups. Does not, by itself, schedule
    /// the plugin into any stage — see [`Self::register_plugin_for_stage`].
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Appends `name` to `stage`'s ordered plugin list. The plugin must
    /// already be registered via [`Self::register_plugin`]. Idempotent: a
    /// `(name, stage)` pair already present is left untouched rather than
    /// duplicated (spec §8's register idempotence law).
    pub fn register_plugin_for_stage(
        &mut self,
        name: &str,
        stage: PipelineStage,
    ) -> Result<(), InitializationError> {
        if !self.plugins.contains_key(name) {
            return Err(InitializationError::new(
                name,
                "stage registration",
                "plugin must be registered before it can be scheduled into a stage",
            )
            .with_kind("Plugin"));
        }
        let names = self.stage_plugins.entry(stage).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        Ok(())
    }

    pub fn declare_capabilities(
        &mut self,
        name: &str,
        stages: Vec<PipelineStage>,
        required_resources: Vec<String>,
    ) {
        let entry = self.capabilities.entry(name.to_string()).or_default();
        entry.supported_stages.extend(stages);
        entry.required_resources.extend(required_resources);
    }

    /// Plugins in insertion order for `stage`. Empty if none are registered.
    pub fn plugins_for_stage(&self, stage: PipelineStage) -> Vec<Arc<dyn Plugin>> {
        self.stage_plugins
            .get(&stage)
            .map(|names| names.iter().filter_map(|n| self.plugins.get(n).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn get_capabilities(&self, name: &str) -> Option<&PluginCapabilities> {
        self.capabilities.get(name)
    }

    pub fn list_plugins(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    /// Every non-optional dependency must resolve against either a
    /// registered plugin or a name in `known_resources`; self-dependency is
    /// forbidden; the derived plugin-to-plugin graph must be acyclic.
    pub fn validate_dependencies(&self, known_resources: &[String]) -> Result<(), InitializationError> {
        let resource_set: HashSet<&str> = known_resources.iter().map(|s| s.as_str()).collect();
        let mut edges: HashMap<String, Vec<String>> =
            self.plugins.keys().map(|n| (n.clone(), Vec::new())).collect();

        for (name, plugin) in &self.plugins {
            for dep_spec in plugin.dependencies() {
                let (dep_name, optional) = parse_dependency(dep_spec);

                if dep_name == *name {
                    return Err(InitializationError::new(
                        name,
                        "dependency validation",
                        "a plugin cannot depend on itself",
                    )
                    .with_kind("Plugin"));
                }

                let resolves_to_plugin = self.plugins.contains_key(&dep_name);
                let resolves_to_resource = resource_set.contains(dep_name.as_str());

                if !resolves_to_plugin && !resolves_to_resource {
                    if optional {
                        continue;
                    }
                    return Err(InitializationError::new(
                        name,
                        "dependency validation",
                        format!("required dependency '{dep_name}' does not resolve to a plugin or resource"),
                    )
                    .with_kind("Plugin"));
                }

                if resolves_to_plugin {
                    edges.get_mut(&dep_name).expect("dep is a known plugin").push(name.clone());
                }
            }

            if let Some(capabilities) = self.capabilities.get(name) {
                if capabilities.supported_stages.is_empty() && plugin.stages().is_empty() {
                    return Err(InitializationError::new(
                        name,
                        "dependency validation",
                        "plugin declares no stages",
                    )
                    .with_kind("Plugin"));
                }
            }
        }

        DependencyGraph::new(edges).topological_sort().map(|_| ())
    }
}
