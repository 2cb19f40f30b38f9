//! Running a job in process or in a child process.

use std::ffi::OsString;
use std::path::PathBuf;

use async_trait::async_trait;
use dq_core::{JobPayload, PackageId};
use dq_quality::{PackageOutcome, PipelineError, TestPipeline};
use dq_storage::Datastore;
use tokio::process::Command;
use tracing::{debug, info};

use crate::consumer::JobHandler;

/// Errors from running a job.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The pipeline failed in this process
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The child process could not be started
    #[error("cannot start child process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The child process exited unsuccessfully
    #[error("child process for package {package_id} exited with {}", .code.map_or("a signal".to_string(), |c| format!("status {c}")))]
    ChildFailed {
        /// Package the child was testing
        package_id: PackageId,
        /// Exit code, if the child was not killed by a signal
        code: Option<i32>,
    },
}

/// Runs one job in a fresh child process.
///
/// The child is invoked as `<program> [args..] test-package --package-id P
/// --runtime-id R --filename F`; only its exit status is observed.
#[derive(Debug, Clone)]
pub struct ChildRunner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ChildRunner {
    /// Create a runner for a program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Create a runner that re-invokes the current executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Pass these arguments before the subcommand.
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the command for a job.
    pub fn command(&self, job: &JobPayload) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("test-package")
            .arg("--package-id")
            .arg(job.package_id.to_string())
            .arg("--runtime-id")
            .arg(job.runtime_id.to_string())
            .arg("--filename")
            .arg(&job.filename)
            .kill_on_drop(true);
        cmd
    }

    /// Run a job and wait for the child to exit.
    pub async fn run(&self, job: &JobPayload) -> Result<(), DispatchError> {
        debug!("Spawning {} for package {}", self.program.display(), job.package_id);
        let status = self
            .command(job)
            .status()
            .await
            .map_err(DispatchError::Spawn)?;
        if !status.success() {
            return Err(DispatchError::ChildFailed {
                package_id: job.package_id,
                code: status.code(),
            });
        }
        Ok(())
    }
}

/// Where jobs are run.
pub enum Dispatch<S: Datastore> {
    /// In this process
    InProcess(TestPipeline<S>),
    /// In a child process per job
    Isolated(ChildRunner),
}

#[async_trait]
impl<S: Datastore + 'static> JobHandler for Dispatch<S> {
    async fn handle(&mut self, job: &JobPayload) -> Result<(), DispatchError> {
        match self {
            Dispatch::InProcess(pipeline) => {
                let outcome = pipeline
                    .check_file(&job.filename, job.runtime_id, job.package_id)
                    .await?;
                if let PackageOutcome::InvalidDocument = outcome {
                    info!("Package {} is not a valid document", job.package_id);
                }
                Ok(())
            }
            Dispatch::Isolated(runner) => runner.run(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dq_core::{OrganisationId, OrganisationTarget, RuleDefinition, RuntimeId};
    use dq_quality::{PipelineConfig, RuleCompiler};
    use dq_storage::{MemoryStorage, Storage};

    fn job(filename: &str) -> JobPayload {
        JobPayload {
            filename: filename.to_string(),
            runtime_id: RuntimeId(4),
            package_id: PackageId(9),
        }
    }

    #[test]
    fn test_child_command_line() {
        let runner = ChildRunner::new("/usr/local/bin/dq").with_args(["--data-dir", "/srv/dq"]);
        let cmd = runner.command(&job("/data/pkg.xml"));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--data-dir",
                "/srv/dq",
                "test-package",
                "--package-id",
                "9",
                "--runtime-id",
                "4",
                "--filename",
                "/data/pkg.xml",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_status() {
        assert!(ChildRunner::new("true").run(&job("x.xml")).await.is_ok());

        let err = ChildRunner::new("false").run(&job("x.xml")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ChildFailed { package_id, code: Some(1) } if package_id == PackageId(9)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ChildRunner::new("/nonexistent/dq-binary")
            .run(&job("x.xml"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_in_process_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.xml");
        tokio::fs::write(
            &path,
            "<iati-activities><iati-activity><iati-identifier>X-1</iati-identifier></iati-activity></iati-activities>",
        )
        .await
        .unwrap();

        let store = MemoryStorage::new().with_organisations(
            PackageId(9),
            vec![OrganisationTarget {
                organisation_id: OrganisationId(1),
                activities_selector: "//iati-activity".to_string(),
            }],
        );
        let rules = RuleCompiler::new()
            .unwrap()
            .compile(&RuleDefinition::from_lines("iati-identifier exists?"));
        let mut dispatch = Dispatch::InProcess(TestPipeline::new(store, rules, PipelineConfig::default()));

        dispatch
            .handle(&job(path.to_str().unwrap()))
            .await
            .unwrap();

        let Dispatch::InProcess(pipeline) = dispatch else {
            panic!("dispatch changed mode");
        };
        let results = pipeline.store().list_results(PackageId(9)).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_in_process_jobs_of_one_run_share_missing_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.xml");
        tokio::fs::write(&path, "<iati-activities><iati-activity/></iati-activities>")
            .await
            .unwrap();

        let targets = || {
            vec![OrganisationTarget {
                organisation_id: OrganisationId(1),
                activities_selector: "//iati-activity".to_string(),
            }]
        };
        let store = MemoryStorage::new()
            .with_organisations(PackageId(9), targets())
            .with_organisations(PackageId(10), targets());
        let rules = RuleCompiler::new()
            .unwrap()
            .compile(&RuleDefinition::from_lines("iati-identifier exists?"));
        let mut dispatch = Dispatch::InProcess(TestPipeline::new(store, rules, PipelineConfig::default()));

        let first = job(path.to_str().unwrap());
        let second = JobPayload {
            package_id: PackageId(10),
            ..first.clone()
        };
        dispatch.handle(&first).await.unwrap();
        dispatch.handle(&second).await.unwrap();

        let Dispatch::InProcess(pipeline) = dispatch else {
            panic!("dispatch changed mode");
        };
        for (package_id, identifier) in [(PackageId(9), "MISSING-1"), (PackageId(10), "MISSING-2")] {
            let results = pipeline.store().list_results(package_id).await.unwrap();
            assert!(results
                .iter()
                .any(|r| r.result_identifier.as_deref() == Some(identifier)));
        }
    }

    #[tokio::test]
    async fn test_in_process_pipeline_error() {
        let rules = RuleCompiler::new().unwrap().compile(&[]);
        let mut dispatch =
            Dispatch::InProcess(TestPipeline::new(MemoryStorage::new(), rules, PipelineConfig::default()));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.xml");
        tokio::fs::write(&path, "<iati-activities/>").await.unwrap();

        let err = dispatch.handle(&job(path.to_str().unwrap())).await.unwrap_err();
        assert!(matches!(err, DispatchError::Pipeline(PipelineError::NoOrganisations(_))));
    }
}
