//! Event system for pipeline lifecycle observation.
//!
//! Provides an optional, non-intrusive way to watch a pipeline run from the
//! outside — stage transitions, plugin invocations, tool dispatch, and
//! checkpoint writes. Implement [`EventHandler`] for logging, metrics, or a
//! progress UI; the pipeline works identically without one.

use std::sync::Arc;

use crate::stages::PipelineStage;

/// Events emitted during one pipeline run.
#[derive(Debug, Clone)]
pub enum Event {
    /// The Stage Executor is about to run `stage`'s plugins.
    StageStart { pipeline_id: String, stage: PipelineStage },
    /// `stage` finished: either all its plugins ran, or one faulted.
    StageEnd { pipeline_id: String, stage: PipelineStage, ok: bool },
    /// A plugin is about to execute for one stage-visit.
    PluginStart { pipeline_id: String, plugin: String, stage: PipelineStage },
    /// A plugin finished its stage-visit.
    PluginEnd { pipeline_id: String, plugin: String, stage: PipelineStage, ok: bool },
    /// Queued tool calls are being drained for `stage`.
    ToolDispatch { pipeline_id: String, stage: PipelineStage, tool_count: usize },
    /// State was written to `checkpoint_key`.
    Checkpoint { pipeline_id: String, checkpoint_key: String },
    /// A plugin fault was recorded and ERROR-stage dispatch is starting.
    Failure { pipeline_id: String, stage: PipelineStage, plugin: String, error_type: String },
    /// A plugin's configuration was hot-reloaded (applied or rolled back).
    HotReload { plugin: String, applied: bool, reason: Option<String> },
}

/// Handler for pipeline lifecycle events.
///
/// Implement this trait to receive stage/plugin/tool/checkpoint signals
/// during a pipeline run. Entirely optional — pipelines work without one.
///
/// # Example
///
/// ```
/// use agent_pipeline::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StageStart { stage, .. } => println!("[stage] {}", stage),
///             Event::Failure { plugin, error_type, .. } => {
///                 println!("[failure] {} ({})", plugin, error_type)
///             }
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise. Shared by the
/// Stage Executor and the Pipeline Loop so neither hand-rolls its own
/// `if let Some(handler) = ...` dispatch.
pub(crate) fn emit(handler: Option<&Arc<dyn EventHandler>>, event: Event) {
    if let Some(h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use agent_pipeline::events::{Event, FnEventHandler};
///
/// let handler = FnEventHandler(|event: Event| {
///     if let Event::StageStart { stage, .. } = event {
///         println!("entering {stage}");
///     }
/// });
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
