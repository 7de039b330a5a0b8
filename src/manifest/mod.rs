//! Manifests: units of work sent to child processes
//!
//! [`ManifestContents`] and [`ManifestResponse`] are the JSON messages
//! exchanged with the engine. A [`Manifest`] pairs contents with the
//! [`Completion`] the controller dispatches on when the child finishes.

mod queue;

pub use queue::{AsyncManifest, AsyncTask, AsyncWorklist};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::checkpoint::{CheckpointId, RecordedEvent};
use crate::point::{ExecutionPoint, Position};
use crate::Result;

/// Operation sent to one child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ManifestContents {
    /// Run forward to `target`, snapshotting at each of `snapshot_points`
    RunToPoint {
        /// Where to stop
        target: ExecutionPoint,
        /// Where to take snapshots on the way
        snapshot_points: Vec<ExecutionPoint>,
    },
    /// Discard the last `num_snapshots` snapshots and restore the newest left
    RestoreSnapshot {
        /// Snapshots to pop
        num_snapshots: usize,
    },
    /// Run until a breakpoint hits or the recording ends
    Resume {
        /// Direction
        forward: bool,
        /// Positions to stop at
        breakpoints: Vec<Position>,
    },
    /// Take over the frontier role
    SetMainChild,
    /// Make everything recorded so far available to replaying children
    FlushRecording,
    /// Scan the region between two saved checkpoints
    ScanRecording {
        /// Region start
        checkpoint: CheckpointId,
        /// Region end (exclusive)
        end_checkpoint: CheckpointId,
    },
    /// Find every hit of `position` in a scanned region
    FindHits {
        /// Region start
        checkpoint: CheckpointId,
        /// Region end (exclusive)
        end_checkpoint: CheckpointId,
        /// Position searched for
        position: Position,
    },
    /// Find the steps of the frame executing at `point`
    FindFrameSteps {
        /// Point inside the frame
        point: ExecutionPoint,
    },
    /// Find where the caller of the frame at `point` was entered
    FindParentFrameEntryPoint {
        /// Point inside the frame
        point: ExecutionPoint,
    },
    /// Find the frame entry of the handler for a recorded event
    FindEventFrameEntry {
        /// Event dispatch point
        point: ExecutionPoint,
        /// Event name
        event: String,
    },
    /// A single debugger request
    DebuggerRequest {
        /// Request payload
        request: Value,
    },
    /// Replay buffered debugger requests in order
    BatchDebuggerRequest {
        /// Request payloads
        requests: Vec<Value>,
    },
    /// Collect the data shown to the user when paused here
    GetPauseData,
    /// Evaluate a logpoint at the current point
    HitLogpoint {
        /// Message template
        text: String,
        /// Optional condition
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
}

impl ManifestContents {
    /// Name of the manifest kind, for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunToPoint { .. } => "runToPoint",
            Self::RestoreSnapshot { .. } => "restoreSnapshot",
            Self::Resume { .. } => "resume",
            Self::SetMainChild => "setMainChild",
            Self::FlushRecording => "flushRecording",
            Self::ScanRecording { .. } => "scanRecording",
            Self::FindHits { .. } => "findHits",
            Self::FindFrameSteps { .. } => "findFrameSteps",
            Self::FindParentFrameEntryPoint { .. } => "findParentFrameEntryPoint",
            Self::FindEventFrameEntry { .. } => "findEventFrameEntry",
            Self::DebuggerRequest { .. } => "debuggerRequest",
            Self::BatchDebuggerRequest { .. } => "batchDebuggerRequest",
            Self::GetPauseData => "getPauseData",
            Self::HitLogpoint { .. } => "hitLogpoint",
        }
    }

    /// Encode for the engine transport
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A checkpoint the frontier reached since its last report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachedCheckpoint {
    /// Checkpoint reached
    pub checkpoint: CheckpointId,
    /// Execution time since the previous checkpoint
    pub duration_ms: u64,
}

impl ReachedCheckpoint {
    /// Execution time since the previous checkpoint
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Kind-specific part of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ManifestResult {
    /// Nothing beyond the common fields
    #[default]
    None,
    /// Region scan output
    #[serde(rename_all = "camelCase")]
    Scan {
        /// Debugger statements hit in the region
        debugger_statements: Vec<ExecutionPoint>,
        /// Events recorded in the region
        events: Vec<RecordedEvent>,
    },
    /// A list of points (hits, frame steps)
    Points(Vec<ExecutionPoint>),
    /// At most one point (frame entries)
    Point(Option<ExecutionPoint>),
    /// Opaque debugger data
    Value(Value),
}

/// What a child reports when it finishes a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResponse {
    /// Where the child is now paused
    pub point: ExecutionPoint,
    /// Process memory usage in bytes
    #[serde(default)]
    pub memory_usage: Option<u64>,
    /// The child restored a snapshot while handling the manifest
    #[serde(default)]
    pub restored_snapshot: bool,
    /// Checkpoints reached (frontier only)
    #[serde(default)]
    pub checkpoints: Vec<ReachedCheckpoint>,
    /// Scripts created (frontier only)
    #[serde(default)]
    pub new_scripts: Vec<Value>,
    /// The end of the recording was reached
    #[serde(default)]
    pub hit_endpoint: bool,
    /// Kind-specific result
    #[serde(default)]
    pub result: ManifestResult,
}

impl ManifestResponse {
    /// A plain response at `point`
    #[must_use]
    pub fn at(point: ExecutionPoint) -> Self {
        Self {
            point,
            memory_usage: None,
            restored_snapshot: false,
            checkpoints: Vec::new(),
            new_scripts: Vec::new(),
            hit_endpoint: false,
            result: ManifestResult::None,
        }
    }

    /// Attach a result
    #[must_use]
    pub fn with_result(mut self, result: ManifestResult) -> Self {
        self.result = result;
        self
    }

    /// Decode from the engine transport
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// How the controller handles a finished manifest
#[derive(Debug)]
pub enum Completion {
    /// `runToPoint`: record the snapshots taken on the way
    Travel,
    /// `restoreSnapshot`: pop snapshots and clear divergence
    Restore {
        /// Snapshots popped
        popped: usize,
    },
    /// Frontier `resume`: react to breakpoint hits and the endpoint
    Frontier,
    /// Frontier `setMainChild`: start running once it took over
    MainChild,
    /// Frontier `flushRecording`
    Flush,
    /// An async manifest's task
    Task(AsyncManifest),
    /// Synchronous debugger request
    DebuggerRequest,
    /// Buffered debugger requests replayed on arrival
    BatchRequest,
    /// Nothing to do
    Ignore,
}

/// A manifest bound to one child
#[derive(Debug)]
pub struct Manifest {
    /// What to send
    pub contents: ManifestContents,
    /// How to handle the response
    pub completion: Completion,
    /// Where the child will be afterwards, if known
    pub destination: Option<ExecutionPoint>,
    /// How long it should take
    pub expected_duration: Option<Duration>,
}

impl Manifest {
    /// A manifest with no destination or duration estimate
    #[must_use]
    pub fn new(contents: ManifestContents, completion: Completion) -> Self {
        Self {
            contents,
            completion,
            destination: None,
            expected_duration: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RewindError;

    #[test]
    fn test_contents_wire_format() {
        let contents = ManifestContents::RunToPoint {
            target: ExecutionPoint::checkpoint(4),
            snapshot_points: vec![ExecutionPoint::checkpoint(3)],
        };
        let json: Value = serde_json::from_str(&contents.to_json().unwrap()).unwrap();
        assert_eq!(json["kind"], "runToPoint");
        assert_eq!(json["target"]["checkpoint"], 4);
        assert_eq!(json["snapshotPoints"][0]["checkpoint"], 3);

        let restore = serde_json::to_value(ManifestContents::RestoreSnapshot { num_snapshots: 2 })
            .unwrap();
        assert_eq!(restore["kind"], "restoreSnapshot");
        assert_eq!(restore["numSnapshots"], 2);

        let flush = serde_json::to_value(ManifestContents::FlushRecording).unwrap();
        assert_eq!(flush, serde_json::json!({ "kind": "flushRecording" }));
    }

    #[test]
    fn test_response_defaults() {
        let response = ManifestResponse::from_json(r#"{"point":{"checkpoint":2}}"#).unwrap();
        assert_eq!(response, ManifestResponse::at(ExecutionPoint::checkpoint(2)));
    }

    #[test]
    fn test_response_rejects_invalid_point() {
        let err = ManifestResponse::from_json(r#"{"point":{"checkpoint":0}}"#).unwrap_err();
        assert!(matches!(err, RewindError::Serialization(_)));
    }

    #[test]
    fn test_response_with_result() {
        let json = r#"{
            "point": {"checkpoint": 6},
            "hitEndpoint": true,
            "checkpoints": [{"checkpoint": 6, "durationMs": 120}],
            "result": {"kind": "points", "value": [{"checkpoint": 5}]}
        }"#;
        let response = ManifestResponse::from_json(json).unwrap();
        assert!(response.hit_endpoint);
        assert_eq!(response.checkpoints[0].duration(), Duration::from_millis(120));
        assert_eq!(
            response.result,
            ManifestResult::Points(vec![ExecutionPoint::checkpoint(5)])
        );
    }
}
