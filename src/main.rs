// ABOUTME: hookslack command line: inspect config, call Web API methods, replay recordings
// ABOUTME: Drives the task runtime from a tokio current-thread runtime and LocalSet

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hookslack::config::Config;
use hookslack::replay::replay_dir;
use hookslack::tokio_host::{TokioHost, DEFAULT_FD_BUDGET};
use hookslack::{build_router, Runtime, SlackApi};
use hookslack_core::error::{format_uncaught, SlackErrorSink};
use hookslack_core::Params;
use hookslack_task::TaskError;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "hookslack")]
#[command(version, about = "Slack event routing on callback-only hosts")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration (secrets redacted)
    Config,

    /// Call a Web API method and print the JSON response
    Call {
        /// Workspace name from the config file or SLACK_TOKEN_<NAME>
        workspace: String,
        /// Method name, e.g. conversations.list
        method: String,
        /// Parameters as key=value
        params: Vec<String>,
        /// Follow pagination cursors for at most N pages (0 = every page)
        #[arg(long)]
        pages: Option<i32>,
        /// Array field concatenated across pages
        #[arg(long, default_value = "members")]
        list_key: String,
    },

    /// Route a recorded event directory through the default handlers
    Replay {
        dir: PathBuf,
        /// Print Prometheus metrics after replaying
        #[arg(long)]
        metrics: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            cli.json_logs
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!cli.json_logs)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = Config::load()?;

    match cli.command {
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Command::Call {
            workspace,
            method,
            params,
            pages,
            list_key,
        } => call(&config, &workspace, &method, &params, pages, &list_key),
        Command::Replay { dir, metrics } => replay(&config, &dir, metrics),
    }
}

fn block_on_local<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let local = tokio::task::LocalSet::new();
    Ok(local.block_on(&runtime, future))
}

fn parse_params(raw: &[String]) -> Result<Params> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Parameter {pair:?} is not key=value"))?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn call(
    config: &Config,
    workspace: &str,
    method: &str,
    raw_params: &[String],
    pages: Option<i32>,
    list_key: &str,
) -> Result<()> {
    let settings = config
        .workspace(&workspace.to_lowercase())
        .with_context(|| format!("Workspace {workspace} is not configured"))?;
    let api = SlackApi::from_config(workspace, settings, &config.network)
        .with_context(|| format!("Workspace {workspace} has no api_token"))?;
    let params = parse_params(raw_params)?;

    let outcome = block_on_local(async {
        let (host, mut events) = TokioHost::new(DEFAULT_FD_BUDGET);
        let runtime = Runtime::with_sink(host, Rc::new(SlackErrorSink));
        let r = runtime.clone();
        let method = method.to_string();
        let list_key = list_key.to_string();
        let task = runtime.spawn("call", async move {
            let response = match pages {
                Some(pages) => api.fetch_list(&r, &method, &list_key, &params, pages).await,
                None => api.fetch(&r, &method, &params).await,
            };
            // Failure is returned to the command, not reported as uncaught
            Ok(response.map_err(TaskError::from))
        });
        events.drive_until(&runtime, || task.is_done()).await;

        for uncaught in runtime.uncaught_errors() {
            tracing::warn!("{}", format_uncaught(&uncaught));
        }
        task.result()
    })?;

    let response: Value = match outcome {
        Some(Ok(Ok(response))) => response,
        Some(Ok(Err(error))) | Some(Err(error)) => {
            return Err(error).with_context(|| format!("{method} failed"))
        }
        None => bail!("{method} did not finish"),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn replay(config: &Config, dir: &Path, with_metrics: bool) -> Result<()> {
    let handle = if with_metrics {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install metrics recorder")?,
        )
    } else {
        None
    };

    let summary = block_on_local(async {
        let (host, _events) = TokioHost::new(DEFAULT_FD_BUDGET);
        let runtime = Runtime::with_sink(host, Rc::new(SlackErrorSink));
        let router = build_router(runtime, config);
        router.set_recorder(None);
        replay_dir(&router, dir)
    })??;

    println!(
        "events: {}, dispatched: {}, unknown: {}, ignored: {}, failed: {}",
        summary.events, summary.dispatched, summary.unknown, summary.ignored, summary.failed
    );
    if let Some(handle) = handle {
        print!("{}", handle.render());
    }
    Ok(())
}
