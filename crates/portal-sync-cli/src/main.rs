use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use portal_sync_core::models::{ChainStatus, TaskKind, TaskSchedule};
use portal_sync_core::orchestration::ChainOptions;
use portal_sync_core::schedule::parse_schedule_time;
use portal_sync_core::sqlite::SqliteStore;
use portal_sync_core::{SchedulerConfig, SyncEngine};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_PATH: &str = "portal-sync.sqlite3";
const DEFAULT_HISTORY_LIMIT: usize = 20;

const USAGE: &str = "\
usage: portal-sync [--db PATH] <command> [args]

commands:
  tasks                              list task definitions with run totals
  task <task_type>                   show one task definition
  history <task_type> [--limit N]    recent runs, newest first
  enable <task_type>                 enable and make eligible immediately
  disable <task_type>                disable and clear next run
  configure <task_type> <json>       replace the task config
  schedule <task_type> --interval MINUTES [--day 0-6 --time HH:MM]
  run <task_type>                    run a task and wait for it
  trigger <task_type>                start a task in the background
  chain [--full] [--skip STEP]...    run the daily sync chain
  status                             scheduler status and active tasks
  serve                              run the scheduler until ctrl-c

environment:
  PORTAL_SYNC_DB                     database path (default portal-sync.sqlite3)
  PORTAL_SYNC_ENABLED, APP_ENV       scheduler enable gate
  RUST_LOG                           log filter (default info)

This binary is an operator shell over the task store. It registers no sync
adapters, so entity sync tasks and daily_sync_chain fail with 'no adapter is
registered' when run from here; history_cleanup is the only task it can run.
`serve` logs a warning at startup for every enabled task in that state;
disable those tasks, or host the engine in a process that registers adapters.";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(args).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Vec<String>) -> anyhow::Result<ExitCode> {
    let db_path = flag_value(&args, "--db")
        .or_else(|| std::env::var("PORTAL_SYNC_DB").ok())
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let positional = positional_args(
        &args,
        &["--db", "--limit", "--skip", "--interval", "--day", "--time"],
    );
    let Some(command) = positional.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        return Ok(ExitCode::FAILURE);
    };

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    let store = SqliteStore::new(&db_path);
    store
        .migrate_to_latest()
        .with_context(|| format!("failed to migrate {db_path}"))?;
    let engine = SyncEngine::builder(Arc::new(store)).config(config).build()?;
    engine.seed_default_tasks().await?;

    match command {
        "tasks" => print_json(&engine.get_all_tasks().await?)?,
        "task" => {
            let kind = task_kind_arg(&positional)?;
            match engine.get_task(kind).await? {
                Some(definition) => print_json(&definition)?,
                None => bail!("task '{kind}' has no definition"),
            }
        }
        "history" => {
            let kind = task_kind_arg(&positional)?;
            let limit = flag_value(&args, "--limit")
                .map(|raw| raw.parse::<usize>())
                .transpose()
                .context("--limit must be a positive integer")?
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, 500);
            print_json(&engine.get_task_history(kind, limit).await?)?;
        }
        "enable" | "disable" => {
            let kind = task_kind_arg(&positional)?;
            engine.set_task_enabled(kind, command == "enable").await?;
            print_json(&engine.get_task(kind).await?)?;
        }
        "configure" => {
            let kind = task_kind_arg(&positional)?;
            let raw = positional
                .get(2)
                .context("configure requires a JSON config argument")?;
            let value: serde_json::Value =
                serde_json::from_str(raw).context("config argument is not valid JSON")?;
            print_json(&engine.update_task_config(kind, &value).await?)?;
        }
        "schedule" => {
            let kind = task_kind_arg(&positional)?;
            let schedule = schedule_args(&args)?;
            match engine.update_task_schedule(kind, schedule).await? {
                Some(next) => println!("next run at {}", next.format(&Rfc3339)?),
                None => println!("schedule saved; task is disabled"),
            }
        }
        "run" => {
            let kind = task_kind_arg(&positional)?;
            print_json(&engine.run_task_now(kind).await?)?;
        }
        "trigger" => {
            let kind = task_kind_arg(&positional)?;
            engine.trigger_task(kind).await?;
            // The process exits once the run settles.
            engine.shutdown().await;
            print_json(&engine.get_task(kind).await?)?;
        }
        "chain" => {
            let mut options = if args.iter().any(|arg| arg == "--full") {
                ChainOptions::full()
            } else {
                ChainOptions::default()
            };
            for step in flag_values(&args, "--skip") {
                options = options.skip(step);
            }
            let run = engine.run_daily_sync_chain(options).await?;
            print_json(&run)?;
            if run.status == ChainStatus::Failed {
                return Ok(ExitCode::FAILURE);
            }
        }
        "status" => print_json(&engine.get_scheduler_status())?,
        "serve" => serve(&engine).await?,
        other => {
            eprintln!("unknown command '{other}'\n\n{USAGE}");
            return Ok(ExitCode::FAILURE);
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(engine: &SyncEngine) -> anyhow::Result<()> {
    for (kind, missing) in engine.unbacked_enabled_tasks().await? {
        let missing: Vec<&str> = missing.iter().map(|kind| kind.as_str()).collect();
        tracing::warn!(
            task_type = %kind,
            missing_adapters = ?missing,
            "enabled task has no registered adapter; its scheduled runs will fail"
        );
    }

    match engine.initialize_scheduler().await? {
        Some(report) if !report.is_empty() => {
            tracing::warn!(
                cancelled_runs = report.cancelled_runs,
                "recovered interrupted runs at startup"
            );
        }
        Some(_) => {}
        None => {
            tracing::warn!("scheduler is disabled; serving status only until ctrl-c");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    let aborted = engine.shutdown().await;
    if aborted > 0 {
        tracing::warn!(aborted, "aborted task runs still in flight at shutdown");
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn task_kind_arg(positional: &[String]) -> anyhow::Result<TaskKind> {
    let raw = positional.get(1).context("missing <task_type> argument")?;
    Ok(raw.parse::<TaskKind>()?)
}

fn schedule_args(args: &[String]) -> anyhow::Result<TaskSchedule> {
    let interval_minutes = flag_value(args, "--interval")
        .context("schedule requires --interval MINUTES")?
        .parse::<u32>()
        .context("--interval must be a positive integer")?;
    let schedule_day = flag_value(args, "--day")
        .map(|raw| raw.parse::<u8>())
        .transpose()
        .context("--day must be 0 (Sunday) through 6 (Saturday)")?;
    let schedule_time = flag_value(args, "--time")
        .map(|raw| parse_schedule_time(&raw))
        .transpose()?;
    Ok(TaskSchedule {
        interval_minutes,
        schedule_day,
        schedule_time,
    })
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|window| window[0] == flag)
        .map(|window| window[1].clone())
}

fn flag_values(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|window| window[0] == flag)
        .map(|window| window[1].clone())
        .collect()
}

/// Arguments that are neither flags nor flag values.
fn positional_args(args: &[String], valued_flags: &[&str]) -> Vec<String> {
    let mut positional = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if valued_flags.contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        if arg.starts_with("--") {
            continue;
        }
        positional.push(arg.clone());
    }
    positional
}
