//! `mirrorctl`: operator commands against the pipeline database.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mirrorline_core::{BridgeRegistry, JobId, JobStatus, JobType, SourceId};
use mirrorline_infra::jobs::{
    EnqueueOutcome, Job, JobFilter, JobStore, MirrorItemPayload, MirrorRepliesPayload,
    SqliteJobStore,
};
use mirrorline_infra::mapping::{MappingCache, SqliteMappingCache};
use mirrorline_infra::{Database, Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "mirrorctl", version, about = "Inspect and steer the mirrorline job pipeline")]
pub struct Cli {
    /// SQLite database file (overrides MIRRORLINE_DATABASE).
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue a job with a JSON payload.
    Enqueue {
        #[arg(value_name = "TYPE")]
        job_type: JobType,
        payload: String,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List jobs.
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long = "type", value_name = "TYPE")]
        job_type: Option<JobType>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one job.
    Show { id: JobId },
    /// Job counts per status and mapping counts.
    Stats,
    /// Return stale in-progress jobs to the queue.
    Reclaim {
        /// Heartbeat age after which a job counts as abandoned.
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Put failed jobs back in the queue with a fresh retry budget.
    RequeueFailed {
        #[arg(long = "type", value_name = "TYPE")]
        job_type: Option<JobType>,
    },
    /// Mapping counts per platform pair.
    Mappings,
    /// Exclude a source item from mirroring.
    Ignore { source_id: SourceId, reason: String },
}

struct Session {
    config: PipelineConfig,
    jobs: Arc<SqliteJobStore>,
    mappings: Arc<SqliteMappingCache>,
    json: bool,
}

/// Load configuration, open the database and run `cli.command`.
pub async fn run<W: Write>(cli: Cli, out: &mut W) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env().context("invalid MIRRORLINE_* configuration")?;
    if let Some(path) = cli.database {
        config = config.with_database(path);
    }

    let db = Database::open(&config.database)
        .await
        .with_context(|| format!("failed to open database {}", config.database.display()))?;
    let ctx = Session {
        jobs: Arc::new(SqliteJobStore::new(&db)),
        mappings: Arc::new(SqliteMappingCache::new(&db)),
        config,
        json: cli.json,
    };

    let result = execute(cli.command, &ctx, out).await;
    db.close().await;
    result
}

async fn execute<W: Write>(command: Command, ctx: &Session, out: &mut W) -> anyhow::Result<()> {
    match command {
        Command::Enqueue {
            job_type,
            payload,
            max_retries,
        } => enqueue(ctx, job_type, &payload, max_retries, out).await,
        Command::Jobs {
            status,
            job_type,
            limit,
        } => {
            let jobs = ctx
                .jobs
                .list(&JobFilter {
                    status,
                    job_type,
                    limit,
                })
                .await
                .context("failed to list jobs")?;
            if ctx.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&jobs)?)?;
            } else {
                for job in &jobs {
                    writeln!(out, "{}", job_line(job))?;
                }
            }
            Ok(())
        }
        Command::Show { id } => {
            let Some(job) = ctx.jobs.get(id).await.context("failed to load job")? else {
                bail!("job {id} not found");
            };
            writeln!(out, "{}", serde_json::to_string_pretty(&job)?)?;
            Ok(())
        }
        Command::Stats => {
            let jobs = ctx.jobs.stats().await.context("failed to count jobs")?;
            let mappings = ctx
                .mappings
                .stats()
                .await
                .context("failed to count mappings")?;
            if ctx.json {
                let body = serde_json::json!({ "jobs": jobs, "mappings": mappings });
                writeln!(out, "{}", serde_json::to_string_pretty(&body)?)?;
            } else {
                for status in JobStatus::ALL {
                    writeln!(out, "{:<12} {}", status.as_str(), jobs.get(status))?;
                }
                writeln!(out, "{:<12} {}", "total", jobs.total())?;
                writeln!(out, "{:<12} {}", "mappings", mappings.mappings())?;
                writeln!(out, "{:<12} {}", "ignored", mappings.ignored)?;
            }
            Ok(())
        }
        Command::Reclaim { grace_secs } => {
            let grace = grace_secs.map_or(ctx.config.stale_grace, Duration::from_secs);
            let reclaimed = ctx
                .jobs
                .reclaim_stale(grace)
                .await
                .context("reclaim failed")?;
            writeln!(out, "reclaimed {reclaimed} job(s)")?;
            Ok(())
        }
        Command::RequeueFailed { job_type } => {
            let requeued = ctx
                .jobs
                .requeue_failed(job_type)
                .await
                .context("requeue failed")?;
            writeln!(out, "requeued {requeued} job(s)")?;
            Ok(())
        }
        Command::Mappings => {
            let stats = ctx
                .mappings
                .stats()
                .await
                .context("failed to count mappings")?;
            if ctx.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&stats)?)?;
            } else {
                for (pair, count) in &stats.per_pair {
                    writeln!(out, "{:<16} {count}", pair.to_string())?;
                }
                writeln!(out, "{:<16} {}", "ignored", stats.ignored)?;
            }
            Ok(())
        }
        Command::Ignore { source_id, reason } => {
            ctx.mappings
                .mark_ignored(&source_id, &reason)
                .await
                .context("failed to record ignored item")?;
            writeln!(out, "ignored {source_id}")?;
            Ok(())
        }
    }
}

async fn enqueue<W: Write>(
    ctx: &Session,
    job_type: JobType,
    payload: &str,
    max_retries: Option<u32>,
    out: &mut W,
) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("payload is not valid JSON")?;

    let mut config = ctx.config.clone();
    if let Some(max_retries) = max_retries {
        config = config.with_max_retries(max_retries);
    }
    let pipeline = Pipeline::new(
        config,
        ctx.jobs.clone(),
        ctx.mappings.clone(),
        BridgeRegistry::new(),
    );

    let outcome = match job_type {
        JobType::MirrorItem => {
            let item: MirrorItemPayload = serde_json::from_value(payload.clone())
                .context("mirror-item payload needs a source_id")?;
            if item.resync {
                EnqueueOutcome::Enqueued(pipeline.enqueue(job_type, payload).await?)
            } else {
                pipeline.enqueue_mirror_item(item.pair, item.source_id).await?
            }
        }
        JobType::MirrorReplies => {
            let replies: MirrorRepliesPayload = serde_json::from_value(payload)
                .context("mirror-replies payload needs a source_id")?;
            pipeline.enqueue_replies(replies).await?
        }
        JobType::Discovery => EnqueueOutcome::Enqueued(pipeline.enqueue(job_type, payload).await?),
    };

    match outcome {
        EnqueueOutcome::Enqueued(id) => writeln!(out, "enqueued {job_type} job {id}")?,
        EnqueueOutcome::Existing(id) => writeln!(out, "{job_type} job {id} already queued")?,
        EnqueueOutcome::Ignored => writeln!(out, "source item is ignored, nothing enqueued")?,
    }
    Ok(())
}

fn job_line(job: &Job) -> String {
    format!(
        "{:>6}  {:<14} {:<11} {}/{}  next_run={}  {}",
        job.id,
        job.job_type.as_str(),
        job.status.as_str(),
        job.retries,
        job.max_retries,
        job.next_run.to_rfc3339(),
        job.last_error.as_deref().unwrap_or(""),
    )
}
