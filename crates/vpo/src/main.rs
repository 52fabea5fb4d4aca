//! VPO command-line entry point.
//!
//! The CLI stays thin: every subcommand resolves configuration, opens the
//! pool, and calls into the library crates. Exit codes are contract:
//! 0 success, 1 general error, 2 policy validation error, 3 target not
//! found, 4 required tool unavailable, 5 operation failed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;

use vpo_db::{schema, DbError, DbPool};
use vpo_jobs::{JobsError, WorkerConfig};
use vpo_model::{Job, JobStatus, JobType, VpoConfig};
use vpo_policy::validation::validate_policy;
use vpo_policy::{PolicyDocument, PolicyError};
use vpo_tools::{detect_tools, ToolError, ToolKind};
use vpo_workflow::{WorkflowError, WorkflowProcessor};

const EXIT_GENERAL: u8 = 1;
const EXIT_POLICY: u8 = 2;
const EXIT_NOT_FOUND: u8 = 3;
const EXIT_TOOL: u8 = 4;
const EXIT_OPERATION: u8 = 5;

#[derive(Parser)]
#[command(name = "vpo", about = "Bring a media library into policy conformance", version)]
struct Cli {
    /// Verbose console output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Introspect files and refresh the library database.
    Scan {
        /// Files to scan.
        paths: Vec<PathBuf>,
    },
    /// Apply a policy to a file directly, without the queue.
    Apply {
        /// Path to the policy document (JSON).
        #[arg(long)]
        policy: PathBuf,
        /// File to process.
        path: PathBuf,
        /// Plan and report without touching the file.
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the job queue.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Run the queue worker.
    Worker {
        /// Stop after this many files.
        #[arg(long)]
        max_files: Option<u64>,
        /// Stop after this many seconds.
        #[arg(long)]
        max_duration: Option<u64>,
        /// Stop at the next local HH:MM.
        #[arg(long)]
        end_by: Option<String>,
        /// Threads for the transcoder.
        #[arg(long)]
        cpu_cores: Option<u32>,
    },
    /// Show detected external tools.
    Tools,
}

#[derive(Subcommand)]
enum JobsCommand {
    /// Queue a processing job for a file.
    Add {
        /// File to process.
        path: PathBuf,
        /// Path to the policy document (JSON).
        #[arg(long)]
        policy: PathBuf,
        /// Lower number is claimed first.
        #[arg(long, default_value_t = 100)]
        priority: i64,
    },
    /// List jobs, newest first.
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one job.
    Show { id: String },
    /// Cancel a queued job.
    Cancel { id: String },
    /// Requeue a failed or cancelled job.
    Requeue { id: String },
    /// Read a job's log.
    Logs {
        id: String,
        #[arg(long, default_value_t = 500)]
        lines: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show queue counts.
    Stats,
}

fn exit_code_for(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(policy) = cause.downcast_ref::<PolicyError>() {
            return match policy {
                PolicyError::Validation { .. } | PolicyError::Deserialize(_) => EXIT_POLICY,
                _ => EXIT_OPERATION,
            };
        }
        if let Some(tool) = cause.downcast_ref::<ToolError>() {
            return match tool {
                ToolError::NotAvailable { .. } => EXIT_TOOL,
                _ => EXIT_OPERATION,
            };
        }
        if let Some(workflow) = cause.downcast_ref::<WorkflowError>() {
            return match workflow {
                WorkflowError::FileNotFound(_) => EXIT_NOT_FOUND,
                WorkflowError::Tool(ToolError::NotAvailable { .. }) => EXIT_TOOL,
                WorkflowError::PhaseExecution { .. } => EXIT_OPERATION,
                _ => EXIT_GENERAL,
            };
        }
        if let Some(jobs) = cause.downcast_ref::<JobsError>() {
            return match jobs {
                JobsError::JobNotFound(_) => EXIT_NOT_FOUND,
                _ => EXIT_GENERAL,
            };
        }
        if cause.downcast_ref::<DbError>().is_some() {
            return EXIT_GENERAL;
        }
    }
    EXIT_GENERAL
}

async fn open_pool(config: &VpoConfig) -> anyhow::Result<DbPool> {
    let pool = DbPool::open(
        &config.db_path(),
        Duration::from_secs(config.db_busy_timeout_secs),
    )
    .await?;
    schema::initialize(&pool).await?;
    Ok(pool)
}

fn load_policy(path: &PathBuf) -> anyhow::Result<PolicyDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read policy file {}", path.display()))?;
    let document = PolicyDocument::from_json(&raw)?;
    validate_policy(&document)?;
    Ok(document)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = VpoConfig::from_env();

    match cli.command {
        Command::Scan { paths } => {
            let pool = open_pool(&config).await?;
            let registry = detect_tools().await;
            for path in &paths {
                let (record, probe) = vpo_workflow::scan::scan_file(&pool, &registry, path).await?;
                println!(
                    "{}: {} track(s), container {}",
                    record.path,
                    probe.tracks.len(),
                    probe.container.as_deref().unwrap_or("unknown")
                );
            }
            pool.close().await;
            Ok(())
        }

        Command::Apply {
            policy,
            path,
            dry_run,
        } => {
            let document = load_policy(&policy)?;
            let pool = open_pool(&config).await?;
            let registry = detect_tools().await;
            let processor = WorkflowProcessor::new(&pool, &registry, &document, "cli")
                .dry_run(dry_run);
            let result = processor.process_file(&path, None).await?;
            println!(
                "{}: {} ({} change(s), {} phase(s) completed, {} skipped)",
                path.display(),
                if result.success { "ok" } else { "FAILED" },
                result.total_changes,
                result.phases_completed,
                result.phases_skipped
            );
            pool.close().await;
            if result.success {
                Ok(())
            } else {
                anyhow::bail!(
                    "processing failed: {}",
                    result.error_message.unwrap_or_default()
                )
            }
        }

        Command::Jobs(command) => run_jobs(command, &config).await,

        Command::Worker {
            max_files,
            max_duration,
            end_by,
            cpu_cores,
        } => {
            let mut config = config;
            if max_files.is_some() {
                config.worker.max_files = max_files;
            }
            if max_duration.is_some() {
                config.worker.max_duration_secs = max_duration;
            }
            if end_by.is_some() {
                config.worker.end_by = end_by;
            }
            if cpu_cores.is_some() {
                config.worker.cpu_cores = cpu_cores;
            }

            let pool = open_pool(&config).await?;
            let registry = detect_tools().await;
            let worker_config = WorkerConfig::from_config(&config);
            let mut worker = vpo_jobs::JobWorker::new(&pool, &registry, worker_config);
            #[cfg(unix)]
            worker.install_signal_handlers()?;
            let processed = worker.run().await?;
            println!("processed {processed} job(s)");

            vpo_jobs::maintenance::compress_old_logs(
                &config.logs_dir(),
                config.jobs.log_compression_days,
            );
            vpo_jobs::maintenance::delete_old_logs(
                &config.logs_dir(),
                config.jobs.log_deletion_days,
            );
            pool.close().await;
            Ok(())
        }

        Command::Tools => {
            let registry = detect_tools().await;
            for kind in [
                ToolKind::Ffprobe,
                ToolKind::Ffmpeg,
                ToolKind::Mkvmerge,
                ToolKind::Mkvpropedit,
            ] {
                match registry.get(kind) {
                    Some(info) => {
                        let version = info
                            .version
                            .as_ref()
                            .map(|v| {
                                v.iter()
                                    .map(|part| part.to_string())
                                    .collect::<Vec<_>>()
                                    .join(".")
                            })
                            .unwrap_or_else(|| "unknown".to_string());
                        println!("{kind}: {} (version {version})", info.path.display());
                    }
                    None => println!("{kind}: NOT FOUND ({})", kind.purpose()),
                }
            }
            if let Some(capabilities) = &registry.capabilities {
                println!("encoders: {}", capabilities.encoders.len());
                println!("muxers: {}", capabilities.muxers.len());
            }
            Ok(())
        }
    }
}

async fn run_jobs(command: JobsCommand, config: &VpoConfig) -> anyhow::Result<()> {
    let pool = open_pool(config).await?;
    let result = match command {
        JobsCommand::Add {
            path,
            policy,
            priority,
        } => {
            let document = load_policy(&policy)?;
            let name = policy
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "policy".to_string());
            let job = Job::new(JobType::Process, path.to_string_lossy())
                .with_priority(priority)
                .with_policy(name, document.to_json()?);
            vpo_jobs::insert_job(&pool, &job).await?;
            println!("queued job {}", job.id);
            Ok(())
        }

        JobsCommand::List { status, limit } => {
            let status = status
                .as_deref()
                .map(|raw| raw.parse::<JobStatus>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let jobs = vpo_jobs::list_jobs(&pool, status, limit).await?;
            for job in jobs {
                println!(
                    "{}  {:9}  {:9}  p{:<4}  {:5.1}%  {}",
                    job.short_id(),
                    job.job_type,
                    job.status,
                    job.priority,
                    job.progress_percent,
                    job.file_path
                );
            }
            Ok(())
        }

        JobsCommand::Show { id } => {
            let job = vpo_jobs::get_job(&pool, &id)
                .await?
                .ok_or(JobsError::JobNotFound(id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }

        JobsCommand::Cancel { id } => {
            if vpo_jobs::cancel_job(&pool, &id).await? {
                println!("cancelled {id}");
                Ok(())
            } else {
                Err(anyhow::anyhow!("job {id} is not queued; only queued jobs can be cancelled"))
            }
        }

        JobsCommand::Requeue { id } => {
            if vpo_jobs::requeue_job(&pool, &id).await? {
                println!("requeued {id}");
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "job {id} is not failed or cancelled; nothing to requeue"
                ))
            }
        }

        JobsCommand::Logs { id, lines, offset } => {
            let (log_lines, total, has_more) =
                vpo_jobs::read_log_tail(&config.logs_dir(), &id, lines, offset);
            for line in &log_lines {
                println!("{line}");
            }
            if has_more {
                eprintln!(
                    "({} of {total} lines; --offset {} for more)",
                    log_lines.len(),
                    offset + log_lines.len()
                );
            }
            Ok(())
        }

        JobsCommand::Stats => {
            let stats = vpo_jobs::get_queue_stats(&pool).await?;
            println!("queued:    {}", stats.queued);
            println!("running:   {}", stats.running);
            println!("completed: {}", stats.completed);
            println!("failed:    {}", stats.failed);
            println!("cancelled: {}", stats.cancelled);
            println!("total:     {}", stats.total);
            Ok(())
        }
    };
    pool.close().await;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = vpo_logging::init_logging(vpo_logging::LogConfig {
        app_name: "vpo",
        verbose: cli.verbose,
    }) {
        eprintln!("logging setup failed: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}
