//! Event loop driving a [`Controller`] from host events

use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::child::ChildId;
use crate::control::{Controller, RequestOutcome};
use crate::engine::DebuggerHooks;
use crate::manifest::ManifestResponse;
use crate::point::{ExecutionPoint, Position};
use crate::{Result, RewindError};

/// Something the host needs the controller to handle
pub enum HostEvent {
    /// Create the children; record mode passes the recording child
    Initialize {
        /// The recording child, in record mode
        recording_child: Option<ChildId>,
    },
    /// Attach the debugger front end
    ConnectDebugger(Box<dyn DebuggerHooks>),
    /// A child finished its manifest
    ManifestFinished {
        /// The child
        child: ChildId,
        /// Its response
        response: ManifestResponse,
    },
    /// A child process died
    ChildCrashed {
        /// The child
        child: ChildId,
    },
    /// Stop live execution
    Pause,
    /// Resume in a direction
    Resume {
        /// Search forward rather than backward
        forward: bool,
    },
    /// Jump to a point
    TimeWarp(ExecutionPoint),
    /// Install a breakpoint
    AddBreakpoint(Position),
    /// Ask the child at the pause point something
    Request {
        /// Request payload
        request: serde_json::Value,
        /// Where the outcome goes
        reply: oneshot::Sender<Result<RequestOutcome>>,
    },
    /// The host is about to save the recording
    BeforeSaveRecording,
    /// The host finished saving the recording
    AfterSaveRecording,
    /// End the session
    Shutdown,
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize { recording_child } => f
                .debug_struct("Initialize")
                .field("recording_child", recording_child)
                .finish(),
            Self::ConnectDebugger(_) => f.write_str("ConnectDebugger"),
            Self::ManifestFinished { child, .. } => f
                .debug_struct("ManifestFinished")
                .field("child", child)
                .finish_non_exhaustive(),
            Self::ChildCrashed { child } => {
                f.debug_struct("ChildCrashed").field("child", child).finish()
            }
            Self::Pause => f.write_str("Pause"),
            Self::Resume { forward } => f.debug_struct("Resume").field("forward", forward).finish(),
            Self::TimeWarp(point) => f.debug_tuple("TimeWarp").field(point).finish(),
            Self::AddBreakpoint(position) => {
                f.debug_tuple("AddBreakpoint").field(position).finish()
            }
            Self::Request { request, .. } => f
                .debug_struct("Request")
                .field("request", request)
                .finish_non_exhaustive(),
            Self::BeforeSaveRecording => f.write_str("BeforeSaveRecording"),
            Self::AfterSaveRecording => f.write_str("AfterSaveRecording"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Owns the controller and serializes every event onto it
pub struct ControlLoop {
    controller: Controller,
    events: mpsc::Receiver<HostEvent>,
}

impl ControlLoop {
    /// Create a loop over `events`
    #[must_use]
    pub fn new(controller: Controller, events: mpsc::Receiver<HostEvent>) -> Self {
        Self { controller, events }
    }

    /// Run until shutdown, the channel closing, SIGINT or a fatal error
    ///
    /// Hang checks run on the configured interval between events.
    ///
    /// # Errors
    ///
    /// Returns the first fatal controller error
    pub async fn run(mut self) -> Result<Controller> {
        let mut hang_checks = tokio::time::interval(self.controller.config().hang_check_interval());
        hang_checks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                now = hang_checks.tick() => {
                    let result = self.controller.check_hangs(now.into_std());
                    settle(result)?;
                }
                event = self.events.recv() => {
                    match event {
                        None => {
                            info!("Host channel closed, shutting down");
                            break;
                        }
                        Some(HostEvent::Shutdown) => {
                            info!("Shutdown requested");
                            break;
                        }
                        Some(event) => {
                            let result = self.handle(event);
                            settle(result)?;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
            }
        }

        Ok(self.controller)
    }

    fn handle(&mut self, event: HostEvent) -> Result<()> {
        let controller = &mut self.controller;
        match event {
            HostEvent::Initialize { recording_child } => controller.initialize(recording_child),
            HostEvent::ConnectDebugger(debugger) => {
                controller.connect_debugger(debugger);
                Ok(())
            }
            HostEvent::ManifestFinished { child, response } => {
                controller.manifest_finished(child, response)
            }
            HostEvent::ChildCrashed { child } => controller.child_crashed(child),
            HostEvent::Pause => controller.pause(),
            HostEvent::Resume { forward } => controller.resume(forward),
            HostEvent::TimeWarp(point) => controller.time_warp(point),
            HostEvent::AddBreakpoint(position) => controller.add_breakpoint(position),
            HostEvent::Request { request, reply } => match controller.send_request(request) {
                Err(e) if e.is_fatal() => {
                    reply
                        .send(Err(RewindError::Engine(format!("session ended: {e}"))))
                        .ok();
                    Err(e)
                }
                outcome => {
                    if reply.send(outcome).is_err() {
                        warn!("Request dropped before its reply");
                    }
                    Ok(())
                }
            },
            HostEvent::BeforeSaveRecording => controller.before_save_recording(),
            HostEvent::AfterSaveRecording => controller.after_save_recording(),
            HostEvent::Shutdown => Ok(()),
        }
    }
}

/// Keep going after recoverable errors; stop on fatal ones
fn settle(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!("Fatal controller error: {}", e);
            Err(e)
        }
        Err(e) => {
            warn!("Controller error: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::control::PauseMode;
    use crate::engine::{EventLog, SimulatedEngine, SimulatedRecording};
    use std::time::Duration;

    fn controller(engine: &SimulatedEngine) -> Controller {
        Controller::new(
            Config::default(),
            Box::new(engine.clone()),
            Box::new(EventLog::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pause_then_shutdown() {
        let engine = SimulatedEngine::new(SimulatedRecording::new(10, 100));
        let recording_child = engine.spawn_recording_child();
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(ControlLoop::new(controller(&engine), rx).run());

        tx.send(HostEvent::Initialize {
            recording_child: Some(recording_child),
        })
        .await
        .unwrap();
        tx.send(HostEvent::Pause).await.unwrap();
        tx.send(HostEvent::Shutdown).await.unwrap();

        let controller = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(controller.pause_mode(), PauseMode::Arriving);
        assert_eq!(controller.last_flush_checkpoint(), 10);
    }

    #[tokio::test]
    async fn test_recoverable_errors_keep_running() {
        let engine = SimulatedEngine::new(SimulatedRecording::new(10, 100));
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(ControlLoop::new(controller(&engine), rx).run());

        let (reply, answer) = oneshot::channel();
        tx.send(HostEvent::Request {
            request: serde_json::json!({"type": "frames"}),
            reply,
        })
        .await
        .unwrap();
        assert!(matches!(answer.await.unwrap(), Err(RewindError::NotPaused)));

        drop(tx);
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
