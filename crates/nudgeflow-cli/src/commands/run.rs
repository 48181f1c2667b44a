//! Interactive flow session in the terminal.
//!
//! Reads one command per line from stdin, drives the flow runner, and
//! prints nudges as the engine publishes them.

use anyhow::{Context, Result};
use chrono::Utc;
use nudgeflow_core::event::{KIND_TASK_OPENED, KIND_TASK_SWITCHED};
use nudgeflow_core::{
    config::config_path, ActionEngine, ActionEvent, EngineConfig, FlowSession, FlowSnapshot,
    LogTelemetry, MicroFlow, NoopMirror, Nudge, RawInput, SequenceProvider, SessionDebrief,
    SessionMirror, StaticSequenceProvider, StepOutcome, TelemetrySink,
};
use nudgeflow_integrations::{HttpSequenceClient, HttpSessionMirror, HttpTelemetrySink};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;

use super::plan::{default_plan_path, load_plan};

/// The one surface this host observes
const SURFACE: &str = "terminal";

#[derive(Debug)]
pub struct RunOptions {
    pub minutes: u32,
    pub energy: Option<String>,
    pub plan: Option<PathBuf>,
    pub api: Option<String>,
    pub api_key: Option<String>,
}

/// A line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Done,
    Skip,
    Stop,
    Status,
    Switch(String),
    Open { task: String, minutes: Option<u64> },
    Type(u32),
    Erase(u32),
    Dismiss,
    Help,
}

const HELP: &str = "Commands: done, skip, stop, status, switch <task>, \
open <task> [minutes], type [n], erase [n], dismiss, help";

fn parse_count(arg: Option<&str>) -> Result<u32, String> {
    arg.map_or(Ok(1), |n| {
        n.parse()
            .map_err(|_| format!("'{n}' is not a number of keystrokes"))
    })
}

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Err(HELP.to_string());
    };
    let arg = parts.next();

    match word.to_lowercase().as_str() {
        "done" | "d" => Ok(Command::Done),
        "skip" | "s" => Ok(Command::Skip),
        "stop" | "quit" | "q" => Ok(Command::Stop),
        "status" => Ok(Command::Status),
        "switch" => arg
            .map(|task| Command::Switch(task.to_string()))
            .ok_or_else(|| "Usage: switch <task>".to_string()),
        "open" => {
            let task = arg.ok_or_else(|| "Usage: open <task> [minutes]".to_string())?;
            let minutes = match parts.next() {
                Some(m) => Some(
                    m.parse()
                        .map_err(|_| format!("'{m}' is not a number of minutes"))?,
                ),
                None => None,
            };
            Ok(Command::Open {
                task: task.to_string(),
                minutes,
            })
        }
        "type" => parse_count(arg).map(Command::Type),
        "erase" => parse_count(arg).map(Command::Erase),
        "dismiss" => Ok(Command::Dismiss),
        "help" | "?" => Ok(Command::Help),
        other => Err(format!("Unknown command '{other}'. {HELP}")),
    }
}

type Collaborators = (
    Arc<dyn SequenceProvider>,
    Arc<dyn SessionMirror>,
    Arc<dyn TelemetrySink>,
);

fn collaborators(options: &RunOptions) -> Result<Collaborators> {
    if let Some(api) = &options.api {
        log::info!("Using flow service at {api}");
        return Ok((
            Arc::new(HttpSequenceClient::new(api, options.api_key.clone())?),
            Arc::new(HttpSessionMirror::new(api, options.api_key.clone())?),
            Arc::new(HttpTelemetrySink::new(api, options.api_key.clone())?),
        ));
    }

    let path = match &options.plan {
        Some(path) => path.clone(),
        None => default_plan_path()?,
    };
    let tasks = load_plan(&path)
        .with_context(|| "Provide a task plan with --plan <file> or a service with --api <url>")?;
    Ok((
        Arc::new(StaticSequenceProvider::new(tasks)),
        Arc::new(NoopMirror),
        Arc::new(LogTelemetry),
    ))
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Task")]
    title: String,
    #[tabled(rename = "Minutes")]
    minutes: u32,
    #[tabled(rename = "Status")]
    status: &'static str,
}

fn task_rows(session: &FlowSession) -> Vec<TaskRow> {
    session
        .sequence
        .iter()
        .enumerate()
        .map(|(i, task)| {
            let status = if session.completed_task_ids.contains(&task.id) {
                "done"
            } else if session.skipped_task_ids.contains(&task.id) {
                "skipped"
            } else if i == session.current_index {
                "active"
            } else {
                "pending"
            };
            TaskRow {
                position: i + 1,
                title: task.title.clone(),
                minutes: task.duration,
                status,
            }
        })
        .collect()
}

fn print_status(snapshot: &FlowSnapshot) {
    let Some(session) = &snapshot.session else {
        println!("No flow session ({})", snapshot.state);
        return;
    };
    println!("\n{}", Table::new(task_rows(session)));
    if let Some(progress) = snapshot.progress {
        println!(
            "Task {} of {} ({}% done)",
            progress.current, progress.total, progress.percentage
        );
    }
}

fn print_debrief(debrief: &SessionDebrief) {
    println!("\nSession debrief");
    if debrief.is_empty() {
        println!("  Nothing to report.");
    }
    for highlight in &debrief.highlights {
        println!("  + {highlight}");
    }
    for insight in &debrief.insights {
        println!("  - {insight}");
    }
}

fn print_nudge(nudge: &Nudge, micro_flow: Option<&MicroFlow>) {
    println!("\n>> {}", nudge.message);
    if let Some(micro_flow) = micro_flow {
        println!("   {}:", micro_flow.title);
        for (i, step) in micro_flow.steps.iter().enumerate() {
            println!("   {}. {step}", i + 1);
        }
    }
}

fn current_task_id(engine: &ActionEngine) -> Option<String> {
    engine.runner().snapshot().current_task().map(|t| t.id.clone())
}

/// Execute one command. Returns `true` once the session is over.
async fn execute(engine: &ActionEngine, command: Command) -> Result<bool> {
    let runner = engine.runner();
    let now = Utc::now();
    match command {
        Command::Done | Command::Skip => {
            let step = if command == Command::Done {
                runner.complete_task().await
            } else {
                runner.skip_task().await
            };
            match step {
                Ok(StepOutcome::Advanced(_)) => {
                    print_status(&runner.snapshot());
                    Ok(false)
                }
                Ok(StepOutcome::Finished(debrief)) => {
                    print_debrief(&debrief);
                    Ok(true)
                }
                Err(e) => {
                    println!("{e}");
                    Ok(false)
                }
            }
        }
        Command::Stop => {
            match runner.stop().await {
                Ok(Some(debrief)) => print_debrief(&debrief),
                Ok(None) => println!("Session cancelled"),
                Err(e) => println!("{e}"),
            }
            Ok(true)
        }
        Command::Status => {
            print_status(&runner.snapshot());
            Ok(false)
        }
        Command::Switch(task) => {
            send(
                engine,
                ActionEvent::new(KIND_TASK_SWITCHED, now).with_subject(task),
            );
            Ok(false)
        }
        Command::Open { task, minutes } => {
            let payload =
                minutes.map_or(serde_json::Value::Null, |m| json!({ "estimateMinutes": m }));
            send(
                engine,
                ActionEvent::new(KIND_TASK_OPENED, now)
                    .with_subject(task)
                    .with_payload(payload),
            );
            Ok(false)
        }
        Command::Type(count) | Command::Erase(count) => {
            let deletion = matches!(command, Command::Erase(_));
            for _ in 0..count {
                engine
                    .collector()
                    .record(SURFACE, RawInput::Keystroke { deletion }, now);
            }
            Ok(false)
        }
        Command::Dismiss => {
            let view = engine.view(now);
            let nudge = view
                .visible_nudge
                .is_some_and(|nudge| engine.dismiss_nudge(nudge.id));
            let micro_flow = view
                .micro_flow
                .is_some_and(|micro_flow| engine.dismiss_micro_flow(micro_flow.id));
            if !nudge && !micro_flow {
                println!("Nothing to dismiss");
            }
            Ok(false)
        }
        Command::Help => {
            println!("{HELP}");
            Ok(false)
        }
    }
}

fn send(engine: &ActionEngine, event: ActionEvent) {
    if engine.sender().send(event).is_err() {
        log::warn!("Engine event loop is gone");
    }
}

pub async fn run_command(options: RunOptions) -> Result<()> {
    let config = EngineConfig::load_or_default(&config_path()?)?;
    let (provider, mirror, telemetry) = collaborators(&options)?;
    let (engine, events) = ActionEngine::new(config, provider, mirror, telemetry);
    let engine = Arc::new(engine);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let event_loop = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .run(events, async {
                    let _ = stop_rx.await;
                })
                .await;
        }
    });

    match engine
        .runner()
        .start(options.minutes, options.energy.as_deref())
        .await
    {
        Ok(_) => print_status(&engine.runner().snapshot()),
        Err(e) => {
            let _ = stop_tx.send(());
            event_loop.await.context("Engine event loop panicked")?;
            anyhow::bail!("Could not start a flow session: {e}");
        }
    }
    println!("{HELP}");

    let mut subject = current_task_id(&engine);
    let mut subscription = engine.observe(SURFACE, subject.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut refresh = tokio::time::interval(Duration::from_secs(1));
    let mut last_shown = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    // stdin closed
                    execute(&engine, Command::Stop).await?;
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                engine.collector().record(SURFACE, RawInput::Pointer, Utc::now());
                match parse_command(line) {
                    Ok(command) => {
                        if execute(&engine, command).await? {
                            break;
                        }
                    }
                    Err(message) => println!("{message}"),
                }
            }
            _ = refresh.tick() => {}
        }

        let current = current_task_id(&engine);
        if current != subject {
            subject = current;
            subscription = engine.observe(SURFACE, subject.clone());
        }

        let view = engine.view(Utc::now());
        if let Some(nudge) = view.visible_nudge {
            if last_shown != Some(nudge.id) {
                last_shown = Some(nudge.id);
                print_nudge(&nudge, view.micro_flow.as_ref());
            }
        }
    }

    subscription.unsubscribe();
    let _ = stop_tx.send(());
    event_loop.await.context("Engine event loop panicked")?;
    for failure in engine.runner().diagnostics() {
        log::warn!("{failure}");
    }
    Ok(())
}
