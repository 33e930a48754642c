//! Run events and notifiers for observability.
//!
//! Events are emitted while a run progresses so that consumers can annotate
//! a displayed graph, stream progress, or persist results.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::report::VariableRef;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
  /// A run has started.
  RunStarted { run_id: String, stages: usize },

  /// A dirty stage's compute callback has been invoked.
  StageStarted { run_id: String, stage: String },

  /// A stage ran successfully.
  StageCompleted {
    run_id: String,
    stage: String,
    outputs: Vec<VariableRef>,
  },

  /// A clean stage was skipped.
  StageSkipped { run_id: String, stage: String },

  /// A stage's compute callback failed.
  StageFailed {
    run_id: String,
    stage: String,
    error: String,
  },

  /// A stage was not run because an ancestor failed.
  StageBlocked {
    run_id: String,
    stage: String,
    blocked_by: String,
  },

  /// A stage was cancelled or never started.
  StageCancelled { run_id: String, stage: String },

  /// A stage lies outside the part of the graph the run covers.
  StageNotSelected { run_id: String, stage: String },

  /// Every stage has an outcome.
  RunCompleted { run_id: String, success: bool },
}

/// Receives run events.
///
/// The runtime calls `notify` for each event; implementations decide what to
/// do with them.
pub trait RunNotifier: Send + Sync {
  fn notify(&self, event: RunEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl RunNotifier for NoopNotifier {
  fn notify(&self, _event: RunEvent) {}
}

/// Forwards events to an unbounded channel.
///
/// Unbounded so a slow consumer never stalls a run; volume is a handful of
/// events per stage.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<RunEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<RunEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl RunNotifier for ChannelNotifier {
  fn notify(&self, event: RunEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
