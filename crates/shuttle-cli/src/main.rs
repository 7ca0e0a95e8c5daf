use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shuttle_core::typed::{Handler, Job};
use shuttle_core::{
    DispatchMode, JobContext, JobEvent, JobMarket, ManagerBuilder, NewJob, Outcome,
    ProcessorRegistry, ProgressState, ShuttleConfig, ShuttleError, WorkerGroup,
};

/// Run a split -> join -> report job graph.
#[derive(Debug, Parser)]
#[command(name = "shuttle", version)]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, env = "SHUTTLE_CONFIG")]
    config: Option<PathBuf>,

    /// Override `scheduler.dispatch`.
    #[arg(long)]
    mode: Option<DispatchMode>,

    /// Number of split jobs feeding the join.
    #[arg(long, default_value_t = 4)]
    fan_out: u32,

    /// Make the split job with this id fail.
    #[arg(long)]
    fail: Option<String>,

    /// Market worker slots per job type.
    #[arg(long, default_value_t = 2)]
    slots: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Split {
    part: u32,
    fail: bool,
}

impl Job for Split {
    const TYPE: &'static str = "demo.split";
}

#[derive(Debug, Serialize, Deserialize)]
struct Join {
    parts: u32,
}

impl Job for Join {
    const TYPE: &'static str = "demo.join";
}

#[derive(Debug, Serialize, Deserialize)]
struct Report {
    title: String,
}

impl Job for Report {
    const TYPE: &'static str = "demo.report";
}

struct SplitHandler;

impl Handler<Split> for SplitHandler {
    fn handle(&self, job: Split, ctx: &JobContext) -> Result<Outcome, ShuttleError> {
        for step in 1..=4 {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(25));
            ctx.send_progress(
                ProgressState::running(step * 25, format!("part {}", job.part))
                    .with_metric("step", f64::from(step)),
            );
        }
        if job.fail {
            return Ok(Outcome::failure(format!("part {} was told to fail", job.part)));
        }
        Ok(Outcome::success().with_result(serde_json::json!({ "part": job.part })))
    }
}

struct JoinHandler;

impl Handler<Join> for JoinHandler {
    fn handle(&self, job: Join, _ctx: &JobContext) -> Result<Outcome, ShuttleError> {
        Ok(Outcome::success().with_result(serde_json::json!({ "merged": job.parts })))
    }
}

struct ReportHandler;

impl Handler<Report> for ReportHandler {
    fn handle(&self, job: Report, ctx: &JobContext) -> Result<Outcome, ShuttleError> {
        info!(job_id = %ctx.id(), title = %job.title, "report written");
        Ok(Outcome::success())
    }

    fn precheck(&self, _id: &shuttle_core::JobId, job: &Report) -> bool {
        !job.title.is_empty()
    }
}

fn demo_registry() -> Result<ProcessorRegistry, ShuttleError> {
    let mut registry = ProcessorRegistry::new();
    registry.register_typed::<Split, _>(SplitHandler)?;
    registry.register_typed::<Join, _>(JoinHandler)?;
    registry.register_typed::<Report, _>(ReportHandler)?;
    Ok(registry)
}

fn load_config(cli: &Cli) -> anyhow::Result<ShuttleConfig> {
    let mut config = match &cli.config {
        Some(path) => ShuttleConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = ShuttleConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(mode) = cli.mode {
        config.scheduler.dispatch = mode;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.logging.filter);

    let builder = ManagerBuilder::from_shuttle_config(&config)
        .typed::<Split, _>(SplitHandler)?
        .typed::<Join, _>(JoinHandler)?
        .typed::<Report, _>(ReportHandler)?
        .expect_types([Split::TYPE, Join::TYPE, Report::TYPE]);

    let mut market = None;
    let builder = match config.scheduler.dispatch {
        DispatchMode::Local => builder,
        DispatchMode::Market => {
            let (handle, join) = JobMarket::spawn(&config.market);
            let workers = WorkerGroup::spawn(handle.clone(), demo_registry()?, cli.slots);
            info!(workers = workers.workers().len(), "market workers ready");
            market = Some((handle.clone(), join, workers));
            builder.market(handle)
        }
    };
    let manager = builder.build()?;
    let mut events = manager.subscribe();

    // The report depends on the join, which stays open until every split
    // job has been attached.
    let report = serde_json::to_value(Report {
        title: "demo".to_string(),
    })?;
    manager
        .add_job(NewJob::new("report", Report::TYPE, report).depends_on(["join"]))
        .await?;
    let join = serde_json::to_value(Join {
        parts: cli.fan_out,
    })?;
    manager
        .add_job(NewJob::new("join", Join::TYPE, join).join())
        .await?;
    for part in 0..cli.fan_out {
        let id = format!("split-{part}");
        let fail = cli.fail.as_deref() == Some(id.as_str());
        manager
            .add_job(NewJob::new(
                id.clone(),
                Split::TYPE,
                serde_json::to_value(Split { part, fail })?,
            ))
            .await?;
        manager.add_dependent_jobs("join", [id]).await?;
    }
    manager.finalize("join").await?;

    let total = cli.fan_out as usize + 2;
    let mut finished = 0;
    let mut failures = Vec::new();
    while finished < total {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event stream lagged");
                continue;
            }
            Err(e) => bail!("event stream closed: {e}"),
        };
        println!("{}", serde_json::to_string(&event)?);
        if let JobEvent::Finished(outcome) = event {
            finished += 1;
            if !outcome.success {
                failures.push(outcome.id);
            }
        }
    }

    let counts = manager.counts().await?;
    info!(?counts, "all jobs finished");
    manager.shutdown().await?;
    if let Some((handle, join, workers)) = market {
        workers.shutdown_and_join().await;
        handle.shutdown().await?;
        let _ = join.await;
    }

    if !failures.is_empty() {
        bail!("{} job(s) did not complete: {:?}", failures.len(), failures);
    }
    Ok(())
}
