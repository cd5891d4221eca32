//! Hearth CLI
//!
//! ```text
//! hearth [--config FILE] run PLAN.json [--yes | --deny]
//! hearth [--config FILE] rollback SESSION [STEPS]
//! hearth [--config FILE] show SESSION
//! hearth [--config FILE] sessions
//! hearth [--config FILE] expire
//! hearth [--config FILE] close SESSION
//! hearth schema
//! hearth [--config FILE] tools
//! ```
//!
//! 报告以 JSON 写到 stdout，日志写到 stderr。运行中 Ctrl+C 会在当前步骤结束后中断计划。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use hearth::config::load_config;
use hearth::engine::{AutoApprove, AutoDeny, ConfirmationChannel, ConfirmationRequest, Decision};
use hearth::tools::plan_schema_json;
use hearth::{observability, Plan, RuntimeContext};

/// 在终端询问 y/N
struct StdinConfirmation {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinConfirmation {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl ConfirmationChannel for StdinConfirmation {
    async fn confirm(&self, request: ConfirmationRequest) -> Decision {
        let mut lines = self.lines.lock().await;
        eprintln!(
            "[{:?}] step {} {}: {}",
            request.risk_class, request.step_index, request.tool_name, request.message
        );
        if request.bulk_exceeded {
            eprintln!("  affects {} items", request.affected_items);
        }
        eprint!("approve? [y/N] ");
        match lines.next_line().await {
            Ok(Some(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => Decision::Approve,
            _ => Decision::Deny,
        }
    }
}

struct Cli {
    config: Option<PathBuf>,
    command: String,
    rest: Vec<String>,
}

fn parse_args() -> anyhow::Result<Cli> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config = Some(PathBuf::from(args.next().context("--config needs a file")?));
        } else {
            positional.push(arg);
        }
    }
    if positional.is_empty() {
        bail!("usage: hearth [--config FILE] <run|rollback|show|sessions|expire|close|schema|tools> ...");
    }
    let command = positional.remove(0);
    Ok(Cli {
        config,
        command,
        rest: positional,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

fn session_arg(cli: &Cli) -> anyhow::Result<&str> {
    cli.rest
        .first()
        .map(String::as_str)
        .context("missing SESSION argument")
}

async fn run_plan(ctx: Arc<RuntimeContext>, cli: &Cli) -> anyhow::Result<ExitCode> {
    let path = cli.rest.iter().find(|a| !a.starts_with("--")).context("missing PLAN.json")?;
    let source = std::fs::read_to_string(path).with_context(|| format!("read {}", path))?;
    let plan: Plan = serde_json::from_str(&source).with_context(|| format!("parse {}", path))?;

    let approve_all = cli.rest.iter().any(|a| a == "--yes");
    let deny_all = cli.rest.iter().any(|a| a == "--deny");
    let confirmation: Box<dyn ConfirmationChannel> = if approve_all {
        Box::new(AutoApprove)
    } else if deny_all {
        Box::new(AutoDeny)
    } else {
        Box::new(StdinConfirmation::new())
    };

    let session_id = ctx.submit(plan).await.context("submit plan")?;
    eprintln!("session {}", session_id);

    ctx.shutdown_manager().install_signal_handlers();
    let watcher = {
        let ctx = ctx.clone();
        let sid = session_id.clone();
        tokio::spawn(async move {
            ctx.shutdown_manager().wait_for_shutdown().await;
            match ctx.interrupt(&sid).await {
                Ok(true) => eprintln!("interrupt requested; stopping after the current step"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "interrupt failed"),
            }
        })
    };

    let report = ctx.run(&session_id, confirmation.as_ref()).await.context("run plan")?;
    watcher.abort();
    println!("{}", report.to_json_pretty());
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    observability::init();
    let cli = parse_args()?;

    if cli.command == "schema" {
        println!("{}", plan_schema_json());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(cli.config.clone()).context("load config")?;
    let ctx = Arc::new(RuntimeContext::builder(config).build().context("build runtime")?);
    let logger = observability::spawn_event_logger(ctx.events());

    let code = match cli.command.as_str() {
        "run" => run_plan(ctx.clone(), &cli).await?,
        "rollback" => {
            let sid = session_arg(&cli)?;
            let steps = match cli.rest.get(1) {
                Some(n) => n.parse::<usize>().with_context(|| format!("invalid STEPS '{}'", n))?,
                None => 1,
            };
            print_json(&ctx.rollback(sid, steps).await.context("rollback")?)?;
            ExitCode::SUCCESS
        }
        "show" => {
            print_json(&ctx.session_record(session_arg(&cli)?).await.context("load session")?)?;
            ExitCode::SUCCESS
        }
        "sessions" => {
            print_json(&ctx.list_sessions().await.context("list sessions")?)?;
            ExitCode::SUCCESS
        }
        "expire" => {
            print_json(&ctx.expire_snapshots().await.context("expire snapshots")?)?;
            ExitCode::SUCCESS
        }
        "close" => {
            ctx.close_session(session_arg(&cli)?).await.context("close session")?;
            ExitCode::SUCCESS
        }
        "tools" => {
            println!("{}", ctx.registry().schema_json());
            ExitCode::SUCCESS
        }
        other => bail!("unknown command '{}'", other),
    };

    ctx.shutdown().await;
    logger.abort();
    Ok(code)
}
