//! Rewind CLI

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use rewind::config::Config;
use rewind::engine::{EventLog, SimulatedEngine, SimulatedRecording};
use rewind::point::{ExecutionPoint, Position};
use rewind::Controller;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Rewind v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: rewind <command> [options]");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  config <file>            Validate a configuration file");
        eprintln!("  simulate <checkpoints>   Run a session against a simulated recording");
        process::exit(1);
    }

    let command = &args[1];

    let result = match command.as_str() {
        "config" => {
            let Some(path) = args.get(2) else {
                eprintln!("Usage: rewind config <file>");
                process::exit(1);
            };
            check_config(PathBuf::from(path))
        }
        "simulate" => {
            let checkpoints = args.get(2).map_or("20", String::as_str);
            simulate(checkpoints)
        }
        _ => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'rewind' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = Config::from_file(&path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Record a simulated run, then pause and search backward for a breakpoint
fn simulate(checkpoints: &str) -> Result<()> {
    let checkpoints: usize = checkpoints
        .parse()
        .with_context(|| format!("not a checkpoint count: {checkpoints}"))?;
    anyhow::ensure!(checkpoints >= 2, "need at least two checkpoints");

    let breakpoint = Position::breakpoint(1, 10);
    let hits = (2..=checkpoints).step_by(3).map(|checkpoint| {
        let progress = checkpoint as f64 / checkpoints as f64;
        ExecutionPoint::at(checkpoint, breakpoint.clone(), progress)
    });
    let engine = SimulatedEngine::new(SimulatedRecording::new(checkpoints, 100).with_points(hits));
    let log = EventLog::new();

    let mut controller = Controller::new(
        Config::default(),
        Box::new(engine.clone()),
        Box::new(log.clone()),
    )?;
    controller.connect_debugger(Box::new(log.clone()));
    controller.initialize(Some(engine.spawn_recording_child()))?;

    controller.pause()?;
    drain(&mut controller, &engine)?;
    println!(
        "Paused at checkpoint {} ({} saved)",
        controller.pause_point().checkpoint,
        controller.checkpoints().saved_checkpoints().count()
    );

    controller.add_breakpoint(breakpoint)?;
    controller.resume(false)?;
    drain(&mut controller, &engine)?;
    let point = controller.pause_point();
    println!(
        "Backward resume stopped at checkpoint {} (progress {:.3}), mode {}",
        point.checkpoint,
        point.progress,
        controller.pause_mode()
    );
    println!("Unscanned regions: {:?}", controller.unscanned_regions());
    println!("Manifests sent: {}", engine.sent().len());
    println!("Debugger events: {}", log.events().len());
    Ok(())
}

/// Deliver finished manifests until every child is idle
fn drain(controller: &mut Controller, engine: &SimulatedEngine) -> Result<()> {
    while let Some((child, response)) = engine.take_finished() {
        controller.manifest_finished(child, response)?;
    }
    Ok(())
}
