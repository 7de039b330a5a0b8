//! Collaborators at the controller's boundary
//!
//! - [`ReplayEngine`]: the native record/replay engine owning the child processes.
//! - [`HostMessenger`]: notifications to the embedding host.
//! - [`DebuggerHooks`]: callbacks into the debugger front-end.
//!
//! [`SimulatedEngine`] implements the engine over an in-memory recording and
//! [`EventLog`] records host and debugger traffic.

mod simulated;

pub use simulated::{EventLog, LoggedEvent, SimulatedEngine, SimulatedRecording};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::child::ChildId;
use crate::manifest::{ManifestContents, ManifestResponse};
use crate::point::ExecutionPoint;
use crate::Result;

/// Result of a blocking wait on a child
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The child finished its manifest
    Finished(ManifestResponse),
    /// The child had nothing in flight
    AlreadyPaused,
    /// The child died
    Crashed,
}

/// The native record/replay engine
pub trait ReplayEngine: Send {
    /// Start a manifest on a paused child; returns immediately
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the manifest
    fn send_manifest(&mut self, child: ChildId, contents: &ManifestContents) -> Result<()>;

    /// Block until the child is paused, optionally forcing it to stop at
    /// the next checkpoint. A response returned here is not also
    /// delivered asynchronously.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails
    fn wait_until_paused(&mut self, child: ChildId, force_checkpoint: bool) -> Result<WaitOutcome>;

    /// Start a new replaying child
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be spawned
    fn spawn_replaying_child(&mut self) -> Result<ChildId>;

    /// Whether replaying children can restore snapshots
    fn can_rewind(&self) -> bool;

    /// Repaint from the active child
    fn on_repaint(&mut self);

    /// Blank the graphics while no child is paused at the pause point
    fn clear_graphics(&mut self);

    /// Show the recording child's graphics again
    fn restore_main_graphics(&mut self);

    /// Whether every pause should repaint
    fn in_repaint_stress_mode(&self) -> bool;
}

/// Notifications to the embedding host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HostMessage {
    /// A time warp reached its target
    TimeWarpFinished,
    /// The frontier reached the end of the recording
    HitRecordingEndpoint {
        /// The endpoint
        point: ExecutionPoint,
    },
    /// A recording save completed
    SaveRecordingFinished,
}

/// The embedding host
pub trait HostMessenger: Send {
    /// Deliver a notification
    fn send(&mut self, message: HostMessage);
}

/// Debugger front-end callbacks
pub trait DebuggerHooks: Send {
    /// Paused at `point`
    fn on_pause(&mut self, _point: &ExecutionPoint) {}

    /// The pause point changed
    fn on_position_change(&mut self, _point: &ExecutionPoint) {}

    /// A logpoint produced a message
    fn on_new_console_message(&mut self, _point: &ExecutionPoint, _message: &Value) {}

    /// The frontier created a script
    fn on_new_script(&mut self, _script: &Value) {}

    /// A search ran off either end of the recording
    fn on_hit_recording_boundary(&mut self) {}
}
