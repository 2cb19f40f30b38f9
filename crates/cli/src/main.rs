//! dq - rule-based quality testing of published documents.

mod config;
mod rules;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dq_core::{JobPayload, PackageId, RuntimeId};
use dq_quality::{CompiledRules, PackageOutcome, RuleCompiler, TestPipeline};
use dq_storage::{JsonStorage, StaticCodelist, Storage};
use dq_worker::{ChildRunner, Consumer, Dispatch, JobQueue, SpoolQueue};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::rules::load_rules;

#[derive(Parser)]
#[command(name = "dq")]
#[command(about = "Rule-based quality testing of published documents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true, env = "DQ_CONFIG")]
    config: Option<PathBuf>,

    /// Datastore directory
    #[arg(long, global = true, env = "DQ_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Rule file
    #[arg(long, global = true, env = "DQ_RULES")]
    rules: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Test one package file
    TestPackage {
        /// Package id
        #[arg(long)]
        package_id: PackageId,
        /// Run id; a new run is started when omitted
        #[arg(long)]
        runtime_id: Option<RuntimeId>,
        /// Document to test
        #[arg(long)]
        filename: PathBuf,
    },
    /// Test packages from the job queue
    TestQueue {
        /// Stop once the queue is empty
        #[arg(long)]
        once: bool,
        /// Test each job in a child process
        #[arg(long)]
        subprocess: bool,
        /// Spool directory
        #[arg(long, env = "DQ_QUEUE_DIR")]
        queue_dir: Option<PathBuf>,
    },
    /// Queue a package for testing
    Enqueue {
        /// Package id
        #[arg(long)]
        package_id: PackageId,
        /// Run id
        #[arg(long)]
        runtime_id: RuntimeId,
        /// Document to test
        #[arg(long)]
        filename: PathBuf,
        /// Spool directory
        #[arg(long, env = "DQ_QUEUE_DIR")]
        queue_dir: Option<PathBuf>,
    },
    /// Compile a rule file and report rules that do not parse
    CheckRules {
        /// Rule file; defaults to the configured one
        file: Option<PathBuf>,
    },
    /// Start a new test run and print its id
    NewRun,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn compile_rules(config: &Config, path: &Path) -> Result<CompiledRules> {
    let definitions = load_rules(path).await?;
    let compiler = RuleCompiler::new()?.with_levels(config.compile_levels.iter().copied());
    Ok(compiler.compile(&definitions))
}

async fn build_pipeline(config: &Config, storage: JsonStorage) -> Result<TestPipeline<JsonStorage>> {
    let rules = compile_rules(config, &config.rules_file).await?;
    info!("Compiled {} rules", rules.len());

    let mut pipeline = TestPipeline::new(storage, rules, config.pipeline_config()?);
    if let Some(path) = &config.codelist_file {
        let codelist = StaticCodelist::load(path)
            .await
            .with_context(|| format!("loading codelist {}", path.display()))?;
        pipeline = pipeline.with_codelist(Arc::new(codelist));
    }
    Ok(pipeline)
}

async fn open_storage(config: &Config) -> Result<JsonStorage> {
    JsonStorage::open(&config.data_dir)
        .await
        .with_context(|| format!("opening datastore {}", config.data_dir.display()))
}

async fn start_run(storage: &mut JsonStorage) -> Result<RuntimeId> {
    let run = storage.start_testrun().await?;
    storage.commit("Start test run").await?;
    Ok(run.id)
}

/// Arguments that give a child process the same configuration.
fn child_args(cli_config: Option<&Path>, config: &Config) -> Vec<PathBuf> {
    let mut args = Vec::new();
    if let Some(path) = cli_config {
        args.extend([PathBuf::from("--config"), path.to_path_buf()]);
    }
    args.extend([PathBuf::from("--data-dir"), config.data_dir.clone()]);
    args.extend([PathBuf::from("--rules"), config.rules_file.clone()]);
    args
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(rules) = cli.rules {
        config.rules_file = rules;
    }

    match cli.command {
        Commands::TestPackage {
            package_id,
            runtime_id,
            filename,
        } => {
            let mut storage = open_storage(&config).await?;
            let runtime_id = match runtime_id {
                Some(id) => id,
                None => start_run(&mut storage).await?,
            };

            let mut pipeline = build_pipeline(&config, storage).await?;
            match pipeline.check_file(&filename, runtime_id, package_id).await? {
                PackageOutcome::Tested {
                    results,
                    info_results,
                    aggregates,
                } => println!(
                    "Package {} tested in run {}: {} results, {} info results, {} aggregate rows",
                    package_id, runtime_id, results, info_results, aggregates
                ),
                PackageOutcome::InvalidDocument => {
                    println!("Package {} is not a valid document", package_id)
                }
            }
        }
        Commands::TestQueue {
            once,
            subprocess,
            queue_dir,
        } => {
            let queue_dir = queue_dir.unwrap_or_else(|| config.queue_dir.clone());
            let queue = SpoolQueue::open(&queue_dir)
                .await
                .with_context(|| format!("opening queue {}", queue_dir.display()))?;

            let dispatch = if subprocess || config.use_subprocess {
                let runner = ChildRunner::current_exe()?.with_args(child_args(cli.config.as_deref(), &config));
                Dispatch::Isolated(runner)
            } else {
                Dispatch::InProcess(build_pipeline(&config, open_storage(&config).await?).await?)
            };

            let mut consumer = Consumer::new(queue, dispatch).with_poll_interval(config.poll_interval());
            if once {
                let stats = consumer.drain_once().await?;
                println!(
                    "Processed {} jobs: {} tested, {} failed, {} malformed",
                    stats.total(),
                    stats.handled,
                    stats.failed,
                    stats.malformed
                );
            } else {
                info!("Watching {}", queue_dir.display());
                consumer.run_forever().await?;
            }
        }
        Commands::Enqueue {
            package_id,
            runtime_id,
            filename,
            queue_dir,
        } => {
            let queue_dir = queue_dir.unwrap_or_else(|| config.queue_dir.clone());
            let mut queue = SpoolQueue::open(&queue_dir).await?;
            let job = JobPayload {
                filename: filename.to_string_lossy().into_owned(),
                runtime_id,
                package_id,
            };
            queue.push(job.encode()?).await?;
            println!("Queued package {} for run {}", package_id, runtime_id);
        }
        Commands::CheckRules { file } => {
            let path = file.unwrap_or_else(|| config.rules_file.clone());
            let compiled = compile_rules(&config, &path).await?;
            for fault in compiled.faults() {
                println!("{}", fault);
            }
            println!(
                "{}: {} rules compiled, {} faults",
                path.display(),
                compiled.len(),
                compiled.faults().len()
            );
            if !compiled.faults().is_empty() {
                bail!("{} rules failed to compile", compiled.faults().len());
            }
        }
        Commands::NewRun => {
            let mut storage = open_storage(&config).await?;
            let runtime_id = start_run(&mut storage).await?;
            println!("{}", runtime_id);
        }
    }

    Ok(())
}
