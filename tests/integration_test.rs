//! Integration tests driving a controller against the simulated engine

use std::time::{Duration, Instant};

use serde_json::json;

use rewind::config::{Config, Mode};
use rewind::control::{Lookup, PauseMode, ResumeSearch, SearchStep};
use rewind::engine::{EventLog, HostMessage, LoggedEvent, SimulatedEngine, SimulatedRecording};
use rewind::point::{ExecutionPoint, Position};
use rewind::{Controller, RewindError};

/// Recording child id in record-mode sessions
const RECORDING_CHILD: usize = 0;

fn bp() -> Position {
    Position::breakpoint(1, 5)
}

fn early_hit() -> ExecutionPoint {
    ExecutionPoint::at(3, bp(), 0.25)
}

fn late_hit() -> ExecutionPoint {
    ExecutionPoint::at(7, bp(), 0.7)
}

/// Ten checkpoints, 100ms apart, with a breakpoint hit on each side of
/// checkpoint 6
fn recording() -> SimulatedRecording {
    SimulatedRecording::new(10, 100).with_points([early_hit(), late_hit()])
}

struct Session {
    controller: Controller,
    engine: SimulatedEngine,
    log: EventLog,
}

impl Session {
    fn with_config(recording: SimulatedRecording, config: Config) -> Self {
        let engine = SimulatedEngine::new(recording);
        let log = EventLog::new();
        let mut controller =
            Controller::new(config, Box::new(engine.clone()), Box::new(log.clone())).unwrap();
        controller.connect_debugger(Box::new(log.clone()));
        Self {
            controller,
            engine,
            log,
        }
    }

    /// A record-mode session, not yet initialized
    fn new(recording: SimulatedRecording) -> Self {
        Self::with_config(recording, Config::default())
    }

    /// A record-mode session with the frontier running
    fn started(recording: SimulatedRecording) -> Self {
        let mut session = Self::new(recording);
        let child = session.engine.spawn_recording_child();
        assert_eq!(child, RECORDING_CHILD);
        session.controller.initialize(Some(child)).unwrap();
        session
    }

    /// A record-mode session paused at the end of the recording with every
    /// region scanned
    fn paused(recording: SimulatedRecording) -> Self {
        let mut session = Self::started(recording);
        session.controller.pause().unwrap();
        session.run_until_idle();
        assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
        session
    }

    /// Deliver finished manifests until every child is idle
    fn run_until_idle(&mut self) {
        while let Some((child, response)) = self.engine.take_finished() {
            self.controller.manifest_finished(child, response).unwrap();
        }
    }

    fn events(&self) -> Vec<LoggedEvent> {
        self.log.events()
    }
}

#[test]
fn test_saved_checkpoints_assigned_round_robin() {
    let mut session = Session::started(recording());
    let ctl = &mut session.controller;

    for checkpoint in [5, 10, 15, 20] {
        ctl.add_saved_checkpoint(checkpoint).unwrap();
    }

    let owners: Vec<_> = [5, 10, 15, 20]
        .iter()
        .map(|&checkpoint| ctl.checkpoints().get(checkpoint).unwrap().owner)
        .collect();
    assert_eq!(owners, vec![Some(2), Some(3), Some(4), Some(1)]);
    assert!(ctl.checkpoints().get(1).unwrap().owner.is_none());
    assert!(ctl.pool().get(2).unwrap().saved_checkpoints.contains(&5));
    assert!(ctl.pool().get(1).unwrap().saved_checkpoints.contains(&20));
}

#[test]
fn test_no_owners_without_rewind() {
    let mut session = Session::started(recording());
    session.engine.set_can_rewind(false);

    session.controller.add_saved_checkpoint(5).unwrap();

    let info = session.controller.checkpoints().get(5).unwrap();
    assert!(info.saved);
    assert!(info.owner.is_none());
}

#[test]
fn test_pause_flushes_and_settles_at_frontier_checkpoint() {
    let recording = recording().with_script(4, json!({ "url": "app.js" }));
    let mut session = Session::started(recording);

    session.controller.pause().unwrap();
    assert_eq!(session.controller.pause_mode(), PauseMode::Arriving);
    assert_eq!(session.controller.last_flush_checkpoint(), 10);

    session.run_until_idle();
    let ctl = &session.controller;
    let end = ExecutionPoint::checkpoint(10);

    assert_eq!(ctl.pause_mode(), PauseMode::Paused);
    assert_eq!(ctl.pause_point(), &end);
    assert_ne!(ctl.active_child(), Some(RECORDING_CHILD));
    assert_eq!(ctl.checkpoints().saved_checkpoints().collect::<Vec<_>>(), vec![1, 6, 10]);
    assert_eq!(
        ctl.checkpoints().range_duration(1, 10),
        Duration::from_millis(900)
    );
    assert!(ctl.unscanned_regions().is_empty());
    assert!(ctl.pause_data(&end).is_some());

    let events = session.events();
    assert!(events.contains(&LoggedEvent::Pause(end)));
    assert!(events.contains(&LoggedEvent::NewScript(json!({ "url": "app.js" }))));
}

#[test]
fn test_unscanned_regions_before_flush() {
    let session = Session::started(recording());
    assert_eq!(session.controller.unscanned_regions(), vec![(0.0, 1.0)]);
}

#[test]
fn test_backward_resume_walks_regions() {
    let mut session = Session::paused(recording());
    session.controller.add_breakpoint(bp()).unwrap();
    session.run_until_idle();

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.pause_point(), &late_hit());

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &early_hit());

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::start());
    assert!(session.events().contains(&LoggedEvent::HitBoundary));

    session.controller.resume(true).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &early_hit());

    // Every region was searched once and scanned once
    assert_eq!(session.engine.count_sent("findHits"), 2);
    assert_eq!(session.engine.count_sent("scanRecording"), 2);
}

#[test]
fn test_resume_waits_for_pending_hit_search() {
    let mut session = Session::paused(recording());
    session.controller.add_breakpoint(bp()).unwrap();

    session.controller.resume(false).unwrap();
    assert_eq!(session.controller.pause_mode(), PauseMode::ResumingBackward);
    assert_eq!(session.controller.active_child(), None);

    // Deliver responses one at a time until the search lands
    while session.controller.pause_mode() == PauseMode::ResumingBackward {
        let (child, response) = session.engine.take_finished().unwrap();
        session.controller.manifest_finished(child, response).unwrap();
    }
    assert_eq!(session.controller.pause_mode(), PauseMode::Arriving);
    assert_eq!(session.controller.pause_point(), &late_hit());

    session.run_until_idle();
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.pause_point(), &late_hit());
}

#[test]
fn test_forward_resume_past_flush_runs_frontier() {
    let mut session = Session::paused(recording());
    let resumes = session.engine.count_sent("resume");

    session.controller.resume(true).unwrap();

    assert_eq!(session.controller.pause_mode(), PauseMode::Running);
    assert_eq!(session.controller.active_child(), None);
    assert_eq!(session.engine.count_sent("resume"), resumes + 1);
}

#[test]
fn test_resume_target_exhausted_without_breakpoints() {
    let mut session = Session::paused(recording());
    let ctl = &mut session.controller;

    let mut backward = ResumeSearch::new(
        ExecutionPoint::checkpoint(10),
        false,
        Vec::new(),
        ctl.checkpoints(),
    );
    assert_eq!(ctl.resume_target(&mut backward).unwrap(), SearchStep::Exhausted);

    let mut forward = ResumeSearch::new(ExecutionPoint::start(), true, Vec::new(), ctl.checkpoints());
    assert_eq!(ctl.resume_target(&mut forward).unwrap(), SearchStep::Exhausted);
}

#[test]
fn test_frontier_pauses_at_breakpoint_then_switches() {
    let mut session = Session::new(recording());
    session.controller.add_breakpoint(bp()).unwrap();
    let child = session.engine.spawn_recording_child();
    session.controller.initialize(Some(child)).unwrap();
    session.run_until_idle();

    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.pause_point(), &early_hit());
    assert_eq!(session.controller.active_child(), Some(RECORDING_CHILD));

    assert!(session.controller.maybe_switch_to_replaying_child().unwrap());
    assert_eq!(session.controller.last_flush_checkpoint(), 10);
    session.run_until_idle();

    let active = session.controller.active_child();
    assert!(active.is_some());
    assert_ne!(active, Some(RECORDING_CHILD));
    assert_eq!(session.controller.pause_point(), &early_hit());

    // Forward across the region boundary to the next hit
    session.controller.resume(true).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &late_hit());
}

#[test]
fn test_crash_while_arriving_rebinds_pause_point() {
    let mut session = Session::started(recording());
    session.controller.pause().unwrap();
    let crashed = session.controller.active_child().unwrap();

    session.engine.crash(crashed);
    session.controller.child_crashed(crashed).unwrap();

    let ctl = &session.controller;
    assert_eq!(ctl.crashes(), 1);
    assert_eq!(ctl.pause_mode(), PauseMode::Arriving);
    assert_ne!(ctl.active_child(), Some(crashed));
    assert!(ctl.pool().get(crashed).unwrap().crashed);
    assert_eq!(ctl.pool().replaying().count(), 4);
    for checkpoint in ctl.checkpoints().saved_checkpoints() {
        assert_ne!(ctl.checkpoints().get(checkpoint).unwrap().owner, Some(crashed));
    }

    session.run_until_idle();
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::checkpoint(10));
    assert!(session.controller.unscanned_regions().is_empty());
}

#[test]
fn test_crash_budget_and_frontier_crash_are_fatal() {
    let config = Config {
        crash_budget: 1,
        ..Config::default()
    };
    let mut session = Session::with_config(recording(), config);
    let child = session.engine.spawn_recording_child();
    session.controller.initialize(Some(child)).unwrap();

    session.controller.child_crashed(1).unwrap();
    let err = session.controller.child_crashed(2).unwrap_err();
    assert!(matches!(err, RewindError::CrashBudgetExceeded { crashes: 2, limit: 1 }));
    assert!(err.is_fatal());

    let err = session.controller.child_crashed(RECORDING_CHILD).unwrap_err();
    assert!(matches!(err, RewindError::FrontierCrashed(RECORDING_CHILD)));
}

#[test]
fn test_duplicate_hit_search_sends_one_manifest() {
    let mut session = Session::paused(recording());
    let ctl = &mut session.controller;

    assert_eq!(ctl.find_hits(1, &bp()).unwrap(), Lookup::Requested);
    assert_eq!(ctl.find_hits(1, &bp()).unwrap(), Lookup::Requested);
    session.run_until_idle();

    assert_eq!(session.engine.count_sent("findHits"), 1);
    let ctl = &mut session.controller;
    assert_eq!(ctl.find_hits(1, &bp()).unwrap(), Lookup::Ready(vec![early_hit()]));
    assert_eq!(ctl.cached_hits(1, &bp()), Some(&[early_hit()][..]));
    assert_eq!(session.engine.count_sent("findHits"), 1);
}

#[test]
fn test_frame_positions_cannot_be_hit_searched() {
    let mut session = Session::paused(recording());
    let err = session
        .controller
        .find_hits(1, &Position::on_pop(None, None))
        .unwrap_err();
    assert!(matches!(err, RewindError::Invariant(_)));
}

#[test]
fn test_reaching_current_point_sends_nothing() {
    let mut session = Session::paused(recording());
    let ctl = &mut session.controller;
    let child = ctl
        .pool()
        .replaying()
        .find(|child| child.paused && !child.diverged)
        .map(|child| child.id())
        .unwrap();
    let here = ctl.pool().get(child).unwrap().last_pause_point.clone();
    let sent = session.engine.sent().len();

    for _ in 0..2 {
        assert_eq!(
            session.controller.maybe_reach_point(child, &here, None).unwrap(),
            rewind::control::Reach::Reached
        );
    }
    assert_eq!(session.engine.sent().len(), sent);
}

#[test]
fn test_parent_frame_entry_lookup() {
    let entry = ExecutionPoint::at(3, Position::enter_frame(Some(4), Some(1)), 0.2);
    let inner = ExecutionPoint::at(3, Position::on_step(4, 8, 1), 0.22);
    let callee = ExecutionPoint::at(3, Position::on_step(5, 2, 2), 0.24);
    let mut session =
        Session::paused(recording().with_points([entry.clone(), inner, callee.clone()]));

    assert_eq!(
        session.controller.find_parent_frame_entry_point(&callee).unwrap(),
        Lookup::Requested
    );
    session.run_until_idle();
    assert_eq!(
        session.controller.find_parent_frame_entry_point(&callee).unwrap(),
        Lookup::Ready(Some(entry))
    );
}

#[test]
fn test_debugger_requests_diverge_and_replay() {
    let mut session = Session::paused(recording());
    let active = session.controller.active_child().unwrap();

    let outcome = session
        .controller
        .send_request(json!({ "type": "frames" }))
        .unwrap();
    assert!(!outcome.unhandled_divergence);
    assert_eq!(outcome.value["request"], json!({ "type": "frames" }));
    assert!(session.controller.pool().get(active).unwrap().diverged);
    assert_eq!(session.controller.debugger_requests().len(), 1);

    session.engine.restore_on_next_request();
    let outcome = session
        .controller
        .send_request(json!({ "type": "scopes" }))
        .unwrap();
    assert!(outcome.unhandled_divergence);
    assert_eq!(outcome.value, serde_json::Value::Null);

    let ctl = &session.controller;
    assert_eq!(ctl.pause_mode(), PauseMode::Paused);
    assert_eq!(ctl.pause_point(), &ExecutionPoint::checkpoint(10));
    assert_eq!(ctl.debugger_requests().len(), 1);
    assert_eq!(session.engine.count_sent("batchDebuggerRequest"), 1);
}

#[test]
fn test_request_requires_pause() {
    let mut session = Session::started(recording());
    let err = session.controller.send_request(json!({})).unwrap_err();
    assert!(matches!(err, RewindError::NotPaused));
}

#[test]
fn test_request_to_running_frontier() {
    let mut session = Session::started(recording());
    let value = session
        .controller
        .send_request_main_child(json!({ "type": "eval" }))
        .unwrap();

    assert_eq!(value["request"], json!({ "type": "eval" }));
    assert_eq!(session.controller.pause_mode(), PauseMode::Running);
    assert_eq!(session.engine.count_sent("resume"), 2);
}

#[test]
fn test_logpoints_fire_at_every_hit() {
    let mut session = Session::paused(recording());
    session
        .controller
        .add_logpoint(bp(), "hit".to_string(), None)
        .unwrap();
    session.run_until_idle();

    let message = |point: ExecutionPoint| LoggedEvent::ConsoleMessage(point, json!("hit"));
    let events = session.events();
    assert!(events.contains(&message(early_hit())));
    assert!(events.contains(&message(late_hit())));

    // A second logpoint reuses the cached hits
    session
        .controller
        .add_logpoint(bp(), "again".to_string(), Some("x > 1".to_string()))
        .unwrap();
    session.run_until_idle();
    assert_eq!(session.engine.count_sent("findHits"), 2);
    assert_eq!(session.engine.count_sent("hitLogpoint"), 4);
}

#[test]
fn test_event_trigger_stops_backward_resume() {
    let handler = ExecutionPoint::at(4, Position::enter_frame(Some(9), Some(1)), 0.4);
    let recording = recording()
        .with_points([handler.clone()])
        .with_event("click", ExecutionPoint::at(4, Position::breakpoint(9, 1), 0.35));
    let mut session = Session::paused(recording);

    session
        .controller
        .set_event_triggers(vec!["click".to_string()])
        .unwrap();
    session.run_until_idle();
    assert_eq!(session.engine.count_sent("findEventFrameEntry"), 1);

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &handler);
}

#[test]
fn test_debugger_statement_pauses_frontier() {
    let statement = ExecutionPoint::at(5, Position::breakpoint(2, 2), 0.45);
    let mut session = Session::started(recording().with_debugger_statement(statement.clone()));
    session.run_until_idle();

    assert_eq!(session.controller.pause_point(), &statement);
    assert_eq!(session.controller.active_child(), Some(RECORDING_CHILD));

    session.controller.maybe_switch_to_replaying_child().unwrap();
    session.run_until_idle();
    assert!(session.controller.paused_at_debugger_statement());

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::start());
    assert!(!session.controller.paused_at_debugger_statement());

    session.controller.resume(true).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &statement);
}

#[test]
fn test_time_warp_notifies_host() {
    let mut session = Session::paused(recording());
    let target = ExecutionPoint::at(4, Position::breakpoint(3, 3), 0.33);

    session.controller.time_warp(target.clone()).unwrap();
    assert_eq!(session.controller.pause_mode(), PauseMode::Arriving);
    session.run_until_idle();

    assert_eq!(session.controller.pause_point(), &target);
    let events = session.events();
    assert!(events.contains(&LoggedEvent::Host(HostMessage::TimeWarpFinished)));
    assert!(events.contains(&LoggedEvent::PositionChange(target)));
}

#[test]
fn test_time_warp_past_flush_rejected() {
    let mut session = Session::paused(recording());
    let err = session
        .controller
        .time_warp(ExecutionPoint::checkpoint(12))
        .unwrap_err();
    assert!(matches!(err, RewindError::UnknownCheckpoint(12)));
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
}

#[test]
fn test_replay_mode_hits_endpoint() {
    let config = Config {
        mode: Mode::Replay,
        ..Config::default()
    };
    let mut session = Session::with_config(recording(), config);
    session.controller.initialize(None).unwrap();
    session.run_until_idle();

    let end = ExecutionPoint::checkpoint(10);
    let frontier = session.controller.pool().frontier_id().unwrap();
    assert_eq!(session.controller.recording_endpoint(), Some(&end));
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.active_child(), Some(frontier));
    assert!(session
        .events()
        .contains(&LoggedEvent::Host(HostMessage::HitRecordingEndpoint { point: end })));

    session.controller.resume(false).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::start());
    assert!(session.events().contains(&LoggedEvent::HitBoundary));
}

#[test]
fn test_record_mode_needs_recording_child() {
    let mut session = Session::new(recording());
    let err = session.controller.initialize(None).unwrap_err();
    assert!(matches!(err, RewindError::ConfigError(_)));
}

#[test]
fn test_save_recording_round_trip() {
    let mut session = Session::started(recording());

    session.controller.before_save_recording().unwrap();
    assert_eq!(session.controller.last_flush_checkpoint(), 10);
    session.controller.after_save_recording().unwrap();

    assert_eq!(session.controller.pause_mode(), PauseMode::Running);
    assert_eq!(session.engine.count_sent("resume"), 2);
    assert!(session
        .events()
        .contains(&LoggedEvent::Host(HostMessage::SaveRecordingFinished)));
}

#[test]
fn test_hang_check_escalates_to_blocking_wait() {
    let mut session = Session::started(recording());
    session.controller.pause().unwrap();

    session
        .controller
        .check_hangs(Instant::now() + Duration::from_secs(3600))
        .unwrap();
    session.run_until_idle();

    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::checkpoint(10));
}

#[test]
fn test_stress_mode_repaints_after_requests() {
    let mut session = Session::paused(recording());
    session.engine.set_stress_mode(true);
    let repaints = session.engine.repaints();

    session.controller.send_request(json!({ "type": "frames" })).unwrap();
    assert_eq!(session.engine.repaints(), repaints + 1);
}

#[test]
fn test_hit_search_waits_for_scanning_child() {
    let mut session = Session::paused(recording());
    let scanner = session
        .controller
        .pool()
        .iter()
        .find(|child| child.is_live() && child.scanned.contains(&1))
        .map(|child| child.id())
        .unwrap();

    // Keep the scanner busy traveling
    let here = session.controller.pool().get(scanner).unwrap().last_pause_point.clone();
    let elsewhere = if here == ExecutionPoint::checkpoint(2) {
        ExecutionPoint::checkpoint(3)
    } else {
        ExecutionPoint::checkpoint(2)
    };
    assert_eq!(
        session.controller.maybe_reach_point(scanner, &elsewhere, None).unwrap(),
        rewind::control::Reach::Pending
    );

    assert_eq!(session.controller.find_hits(1, &bp()).unwrap(), Lookup::Requested);
    assert_eq!(session.engine.count_sent("findHits"), 0);

    session.run_until_idle();
    let searched_on: Vec<_> = session
        .engine
        .sent()
        .into_iter()
        .filter(|(_, contents)| contents.kind() == "findHits")
        .map(|(child, _)| child)
        .collect();
    assert_eq!(searched_on, vec![scanner]);
    assert_eq!(
        session.controller.find_hits(1, &bp()).unwrap(),
        Lookup::Ready(vec![early_hit()])
    );
}

#[test]
fn test_forward_resume_mode_sequence() {
    let mut session = Session::paused(recording());
    session.controller.time_warp(ExecutionPoint::checkpoint(4)).unwrap();
    session.run_until_idle();
    let mut modes = vec![session.controller.pause_mode()];

    session.controller.add_breakpoint(bp()).unwrap();
    session.controller.resume(true).unwrap();
    modes.push(session.controller.pause_mode());

    while session.controller.pause_mode() == PauseMode::ResumingForward {
        let (child, response) = session.engine.take_finished().unwrap();
        session.controller.manifest_finished(child, response).unwrap();
    }
    modes.push(session.controller.pause_mode());
    assert_eq!(session.controller.pause_point(), &late_hit());

    session.run_until_idle();
    modes.push(session.controller.pause_mode());

    assert_eq!(
        modes,
        vec![
            PauseMode::Paused,
            PauseMode::ResumingForward,
            PauseMode::Arriving,
            PauseMode::Paused
        ]
    );
    assert_eq!(session.controller.pause_point(), &late_hit());
}

#[test]
fn test_crash_while_servicing_request_is_fatal() {
    let mut session = Session::paused(recording());
    let active = session.controller.active_child().unwrap();
    session.engine.crash_on_next_request();

    let err = session
        .controller
        .send_request(json!({ "type": "frames" }))
        .unwrap_err();

    assert!(matches!(err, RewindError::RequestCrashed(id) if id == active));
    assert!(err.is_fatal());
    assert_eq!(session.controller.crashes(), 0);
}

#[test]
fn test_rejected_time_warp_keeps_frontier_running() {
    let mut session = Session::started(recording());

    let err = session
        .controller
        .time_warp(ExecutionPoint::checkpoint(12))
        .unwrap_err();

    assert!(matches!(err, RewindError::UnknownCheckpoint(12)));
    assert_eq!(session.controller.pause_mode(), PauseMode::Running);
    let frontier = session.controller.pool().get(RECORDING_CHILD).unwrap();
    assert!(frontier.in_flight().is_some());
    assert_eq!(session.engine.count_sent("resume"), 2);
}

#[test]
fn test_rejected_time_warp_keeps_frontier_pause_point() {
    let mut session = Session::new(recording());
    session.controller.add_breakpoint(bp()).unwrap();
    let child = session.engine.spawn_recording_child();
    session.controller.initialize(Some(child)).unwrap();
    session.run_until_idle();

    let err = session
        .controller
        .time_warp(ExecutionPoint::checkpoint(5))
        .unwrap_err();
    assert!(matches!(err, RewindError::UnknownCheckpoint(5)));
    assert_eq!(session.controller.pause_mode(), PauseMode::Paused);
    assert_eq!(session.controller.active_child(), Some(RECORDING_CHILD));
    assert_eq!(
        session.controller.pool().get(RECORDING_CHILD).unwrap().last_pause_point,
        early_hit()
    );
    assert_eq!(session.engine.count_sent("resume"), 1);

    // Points before the frontier's pause point stay reachable
    session.controller.time_warp(ExecutionPoint::checkpoint(2)).unwrap();
    session.run_until_idle();
    assert_eq!(session.controller.pause_point(), &ExecutionPoint::checkpoint(2));
    assert_ne!(session.controller.active_child(), Some(RECORDING_CHILD));
}

#[test]
fn test_step_neighbours_get_pause_data() {
    let before = ExecutionPoint::at(3, Position::on_step(2, 1, 0), 0.21);
    let origin = ExecutionPoint::at(3, Position::on_step(2, 2, 0), 0.23);
    let after = ExecutionPoint::at(3, Position::on_step(2, 3, 0), 0.27);
    let callee = ExecutionPoint::at(3, Position::enter_frame(Some(5), Some(1)), 0.28);
    let recording = recording().with_points([
        before.clone(),
        origin.clone(),
        after.clone(),
        callee.clone(),
    ]);
    let mut session = Session::paused(recording);

    session.controller.time_warp(origin.clone()).unwrap();
    session.run_until_idle();

    assert_eq!(session.controller.pause_point(), &origin);
    let cached = session.controller.cached_points();
    for point in [&origin, &before, &after, &callee] {
        assert!(cached.contains(point), "no pause data at {point:?}");
    }
}
