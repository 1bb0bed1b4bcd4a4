//! Workflow Descriptor (C9).
//!
//! An immutable mapping `{stage -> ordered plugin names}` plus an optional
//! pure predicate per stage. Absent a workflow, the Stage Executor falls
//! back to whatever the Plugin Registry has for that stage; with a
//! workflow, only the listed plugins run, in the order listed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::stages::PipelineStage;
use crate::state::PipelineState;

/// Must be a pure function of `(state, stage)` — spec §4.9. Nothing in this
/// crate enforces purity; callers are responsible for not mutating state
/// from inside one.
pub type StagePredicate = Arc<dyn Fn(&PipelineState, PipelineStage) -> bool + Send + Sync>;

#[derive(Default, Clone)]
pub struct Workflow {
    stage_plugins: HashMap<PipelineStage, Vec<String>>,
    predicates: HashMap<PipelineStage, StagePredicate>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: PipelineStage, plugins: Vec<String>) -> Self {
        self.stage_plugins.insert(stage, plugins);
        self
    }

    pub fn with_predicate(mut self, stage: PipelineStage, predicate: StagePredicate) -> Self {
        self.predicates.insert(stage, predicate);
        self
    }

    /// `None` means this workflow doesn't override `stage` — callers should
    /// fall back to the Plugin Registry's natural order for it.
    pub fn plugins_for(&self, stage: PipelineStage) -> Option<&[String]> {
        self.stage_plugins.get(&stage).map(|v| v.as_slice())
    }

    /// `true` when no predicate is registered for `stage` (the default:
    /// every stage runs unless told otherwise).
    pub fn should_execute(&self, stage: PipelineStage, state: &PipelineState) -> bool {
        match self.predicates.get(&stage) {
            Some(predicate) => predicate(state, stage),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlisted_stage_falls_back_to_none() {
        let workflow = Workflow::new().with_stage(PipelineStage::Do, vec!["planner".to_string()]);
        assert_eq!(workflow.plugins_for(PipelineStage::Do), Some(["planner".to_string()].as_slice()));
        assert_eq!(workflow.plugins_for(PipelineStage::Review), None);
    }

    #[test]
    fn predicate_gates_stage_execution() {
        let workflow = Workflow::new().with_predicate(
            PipelineStage::Review,
            Arc::new(|state: &PipelineState, _stage| state.iteration > 1),
        );
        let state = PipelineState::fresh("p1", "hi");
        assert!(!workflow.should_execute(PipelineStage::Review, &state));
        assert!(workflow.should_execute(PipelineStage::Think, &state));
    }
}
