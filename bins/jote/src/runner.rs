/// Test Runner
///
/// **Core Responsibility:**
/// Walk every definition, job and test of a catalog and give each test
/// exactly one outcome.
///
/// **Per-test gates, in order (first hit wins):**
/// 1. Name filter - a test that is not selected is not counted at all
/// 2. `ignore` - Ignored
/// 3. Run-level above the threshold - Skipped
/// 4. Resolve and render - Failed, no environment
/// 5. Create environment and stage inputs - Failed, environment kept
/// 6. Run and compare the exit code - Failed, environment kept
/// 7. Verify outputs - Failed, environment kept
/// 8. Passed (environment removed unless results are kept)
///
/// Under dry-run, steps 5-7 shrink to an input check and the test is
/// recorded as Rendered.
use crate::descriptor::ContainerSpec;
use crate::engine::ContainerBackend;
use crate::environment::{check_inputs, ExecutionEnvironment};
use crate::error::TestError;
use crate::evaluator::verify;
use crate::loader::Catalog;
use crate::renderer::CommandRenderer;
use crate::resolver::resolve;
use crate::summary::Summary;
use jote_common::config::Layout;
use jote_common::types::{Job, Test, VariableSchema};
use tracing::{debug, info_span, warn, Instrument};

/// What to run and how.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub collection: Option<String>,
    pub job: Option<String>,
    pub test: Option<String>,
    pub run_level: u32,
    pub dry_run: bool,
    pub keep_results: bool,
    pub verbose: bool,
    pub exit_on_failure: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            collection: None,
            job: None,
            test: None,
            run_level: 1,
            dry_run: false,
            keep_results: false,
            verbose: false,
            exit_on_failure: false,
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Passed,
    Failed(TestError),
    Ignored,
    Skipped { run_level: u32 },
    /// Dry-run only: the command rendered and the inputs are in place.
    Rendered,
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

/// Identifies one test for environments, banners and spans.
struct TestId<'a> {
    collection: &'a str,
    job: &'a str,
    test: &'a str,
}

pub struct TestRunner<'a, B: ContainerBackend + ?Sized> {
    backend: &'a B,
    layout: &'a Layout,
    options: RunOptions,
    renderer: CommandRenderer,
    backend_version: Option<String>,
}

impl<'a, B: ContainerBackend + ?Sized> TestRunner<'a, B> {
    /// `backend_version` is resolved once by the caller (`None` when the
    /// backend will not be used, e.g. under dry-run).
    pub fn new(
        backend: &'a B,
        layout: &'a Layout,
        options: RunOptions,
        backend_version: Option<String>,
    ) -> Self {
        Self {
            backend,
            layout,
            options,
            renderer: CommandRenderer::new(),
            backend_version,
        }
    }

    pub async fn run(&self, catalog: &Catalog) -> Summary {
        let mut summary = Summary::default();

        if let Some(version) = &self.backend_version {
            println!("# Container backend {version}");
        }

        'definitions: for loaded in &catalog.definitions {
            let definition = &loaded.definition;
            if self
                .options
                .collection
                .as_ref()
                .is_some_and(|wanted| *wanted != definition.collection)
            {
                continue;
            }
            debug!(path = %loaded.path.display(), "Running job definition");

            for (job_name, job) in &definition.jobs {
                if self.options.job.as_ref().is_some_and(|wanted| wanted != job_name) {
                    continue;
                }
                let schema = VariableSchema::from_variables(&job.variables);

                for (test_name, test) in &job.tests {
                    let id = TestId {
                        collection: &definition.collection,
                        job: job_name,
                        test: test_name,
                    };
                    let Some(outcome) = self.run_test(&id, job, &schema, test).await else {
                        continue;
                    };

                    summary.record(&outcome);
                    if outcome.is_failure() && self.options.exit_on_failure {
                        println!("! Stopping on first failure");
                        break 'definitions;
                    }
                }
            }
        }

        summary
    }

    /// `None` when the test is not selected.
    async fn run_test(
        &self,
        id: &TestId<'_>,
        job: &Job,
        schema: &VariableSchema,
        test: &Test,
    ) -> Option<RunOutcome> {
        if self.options.test.as_ref().is_some_and(|wanted| wanted != id.test) {
            return None;
        }

        println!();
        println!("+ collection={} job={} test={}", id.collection, id.job, id.test);

        let above_threshold = test
            .run_level
            .filter(|run_level| *run_level > self.options.run_level);

        let outcome = if test.ignore {
            RunOutcome::Ignored
        } else if let Some(run_level) = above_threshold {
            RunOutcome::Skipped { run_level }
        } else {
            let span = info_span!("test", collection = id.collection, job = id.job, test = id.test);
            self.execute(id, job, schema, test)
                .instrument(span)
                .await
                .unwrap_or_else(RunOutcome::Failed)
        };

        self.report(&outcome);
        Some(outcome)
    }

    fn report(&self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Passed => println!("  OK"),
            RunOutcome::Rendered => println!("  OK (dry-run)"),
            RunOutcome::Ignored => println!("  (ignored)"),
            RunOutcome::Skipped { run_level } => println!(
                "  (skipped, run-level {run_level} > {})",
                self.options.run_level
            ),
            RunOutcome::Failed(e) => report_failure(e, self.options.verbose),
        }
    }

    async fn execute(
        &self,
        id: &TestId<'_>,
        job: &Job,
        schema: &VariableSchema,
        test: &Test,
    ) -> Result<RunOutcome, TestError> {
        let resolution = resolve(test, schema)?;
        let command = self.renderer.render(&job.command, &resolution.substitutions)?;
        println!("  $ {command}");

        let environment = ExecutionEnvironment::new(self.layout, id.collection, id.job, id.test)?;

        if self.options.dry_run {
            check_inputs(self.layout, &resolution.input_files)?;
            return Ok(RunOutcome::Rendered);
        }

        let spec = ContainerSpec {
            image: job.image.reference(),
            command,
            memory: job.image.memory.clone(),
            cores: job.image.cores,
            project_directory: job.image.project_directory.clone(),
            working_directory: job.image.working_directory.clone(),
        };

        environment.create(&spec)?;
        environment.stage_inputs(self.layout, &resolution.input_files)?;

        let output = environment.run(self.backend).await?;
        debug!(
            exit_code = output.exit_code,
            execution_time_ms = output.execution_time_ms,
            "Container finished"
        );
        if self.options.verbose {
            print_output(&output.stdout, &output.stderr);
        }

        if output.exit_code != test.checks.exit_code {
            return Err(TestError::ExitCodeMismatch {
                actual: output.exit_code,
                expected: test.checks.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        verify(environment.project_path(), &test.checks.outputs)?;

        if !self.options.keep_results {
            // The test has passed; a leftover directory does not change that
            if let Err(e) = environment.delete() {
                warn!(error = %e, "Failed to delete test environment");
            }
        }
        Ok(RunOutcome::Passed)
    }
}

fn report_failure(error: &TestError, verbose: bool) {
    println!("  FAILED: {error}");
    // Verbose runs have printed the output already
    if let (Some((stdout, stderr)), false) = (error.captured_output(), verbose) {
        print_output(stdout, stderr);
    }
}

fn print_output(stdout: &str, stderr: &str) {
    for (name, text) in [("stdout", stdout), ("stderr", stderr)] {
        if text.is_empty() {
            continue;
        }
        println!("  --- {name}");
        for line in text.lines() {
            println!("  | {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BackendError, ContainerOutput};
    use crate::environment::CWD_LOCK;
    use crate::loader::LoadedDefinition;
    use crate::summary::Verdict;
    use async_trait::async_trait;
    use jote_common::config::PROJECT_DIRECTORY;
    use jote_common::types::JobDefinition;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::MutexGuard;
    use std::time::Duration;

    /// Exits with a fixed code after writing fixed files into the project
    /// directory, the way a real job would through its bind mount. The
    /// first `timeouts` runs time out after printing partial output.
    struct ScriptedBackend {
        exit_code: i64,
        writes: Vec<(&'static str, &'static str)>,
        timeouts: usize,
        calls: AtomicUsize,
    }

    impl ScriptedBackend {
        fn exiting(exit_code: i64) -> Self {
            Self {
                exit_code,
                writes: vec![],
                timeouts: 0,
                calls: AtomicUsize::new(0),
            }
        }

        fn timing_out(timeouts: usize) -> Self {
            Self {
                timeouts,
                ..Self::exiting(0)
            }
        }

        fn writing(writes: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                writes,
                ..Self::exiting(0)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContainerBackend for ScriptedBackend {
        async fn version(&self) -> Result<String, BackendError> {
            Ok("scripted".to_string())
        }

        async fn run(&self, environment: &Path) -> Result<ContainerOutput, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.timeouts {
                return Err(BackendError::Timeout {
                    after: Duration::from_secs(1800),
                    stdout: "partial".to_string(),
                    stderr: String::new(),
                });
            }
            for (name, content) in &self.writes {
                fs::write(environment.join(PROJECT_DIRECTORY).join(name), content).unwrap();
            }
            Ok(ContainerOutput {
                exit_code: self.exit_code,
                stdout: "hi\n".to_string(),
                stderr: String::new(),
                execution_time_ms: 1,
            })
        }
    }

    struct Fixture {
        _lock: MutexGuard<'static, ()>,
        _dir: tempfile::TempDir,
        layout: Layout,
    }

    fn fixture() -> Fixture {
        let lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data/mols.sdf"), "m\n").unwrap();
        let layout = Layout::new(dir.path());
        Fixture {
            _lock: lock,
            _dir: dir,
            layout,
        }
    }

    fn catalog(tests: &str) -> Catalog {
        let yaml = format!(
            r#"
collection: im-test
jobs:
  nop:
    image:
      name: busybox
      tag: "1.36"
      project-directory: /data
      working-directory: /data
    command: echo hi
    variables:
      inputs:
        properties:
          molecules:
            type: file
    tests:
{tests}"#
        );
        let definition: JobDefinition = serde_yaml::from_str(&yaml).unwrap();
        Catalog {
            test_count: definition.test_count(),
            definitions: vec![LoadedDefinition {
                path: PathBuf::from("im-test.yaml"),
                definition,
            }],
        }
    }

    fn env_path(layout: &Layout, test: &str) -> PathBuf {
        layout.test_path("im-test", "nop", test).unwrap()
    }

    #[tokio::test]
    async fn test_passing_test_removes_environment() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog("      simple:\n        checks:\n          exitCode: 0\n");

        let runner = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None);
        let summary = runner.run(&catalog).await;

        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(backend.calls(), 1);
        assert!(!env_path(&fx.layout, "simple").exists());
    }

    #[tokio::test]
    async fn test_exit_code_mismatch_keeps_environment() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog("      simple:\n        checks:\n          exitCode: 1\n");

        let runner = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None);
        let summary = runner.run(&catalog).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 0);
        assert!(env_path(&fx.layout, "simple").exists());
    }

    #[tokio::test]
    async fn test_undeclared_input_fails_before_environment() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      simple:\n        inputs:\n          molecule: data/mols.sdf\n        checks:\n          exitCode: 0\n",
        );
        let runner = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None);
        let id = TestId {
            collection: "im-test",
            job: "nop",
            test: "simple",
        };
        let job = &catalog.definitions[0].definition.jobs["nop"];
        let schema = VariableSchema::from_variables(&job.variables);

        let outcome = runner.run_test(&id, job, &schema, &job.tests["simple"]).await;

        match outcome {
            Some(RunOutcome::Failed(TestError::UndeclaredVariable { name })) => {
                assert_eq!(name, "molecule")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.calls(), 0);
        assert!(!env_path(&fx.layout, "simple").exists());
    }

    #[tokio::test]
    async fn test_dry_run_renders_without_running() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      simple:\n        inputs:\n          molecules: data/mols.sdf\n        checks:\n          exitCode: 0\n",
        );
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;

        assert_eq!(summary.rendered, 1);
        assert_eq!(summary.passed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(backend.calls(), 0);
        assert!(!fx.layout.test_root().exists());
        assert!(summary.verdict(true, false).is_success());
    }

    #[tokio::test]
    async fn test_dry_run_still_checks_inputs() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      simple:\n        inputs:\n          molecules: data/absent.sdf\n        checks:\n          exitCode: 0\n",
        );
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rendered, 0);
    }

    #[tokio::test]
    async fn test_aggregate_summary() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            r#"      a-ignored:
        ignore:
        checks:
          exitCode: 0
      b-skipped:
        run-level: 5
        checks:
          exitCode: 0
      c-passes:
        checks:
          exitCode: 0
      d-passes:
        checks:
          exitCode: 0
      e-fails:
        checks:
          exitCode: 2
"#,
        );

        let summary = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None)
            .run(&catalog)
            .await;

        assert_eq!(summary.to_string(), "passed=2 skipped=1 ignored=1 failed=1");
        assert_eq!(summary.verdict(false, false), Verdict::Failed);
        assert_eq!(backend.calls(), 3);
        assert!(!env_path(&fx.layout, "a-ignored").exists());
        assert!(!env_path(&fx.layout, "b-skipped").exists());
    }

    #[tokio::test]
    async fn test_run_level_threshold_admits() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      slow:\n        run-level: 5\n        checks:\n          exitCode: 0\n",
        );
        let options = RunOptions {
            run_level: 5,
            ..RunOptions::default()
        };

        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;

        assert_eq!(summary.passed, 1);
    }

    #[tokio::test]
    async fn test_name_filters_exclude_from_counts() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      one:\n        checks:\n          exitCode: 0\n      two:\n        checks:\n          exitCode: 0\n",
        );

        let options = RunOptions {
            collection: Some("im-test".to_string()),
            job: Some("nop".to_string()),
            test: Some("two".to_string()),
            ..RunOptions::default()
        };
        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;
        assert_eq!(summary, Summary { passed: 1, ..Summary::default() });

        let options = RunOptions {
            collection: Some("other".to_string()),
            ..RunOptions::default()
        };
        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;
        assert_eq!(summary, Summary::default());
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_exit_on_failure_stops_processing() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      a-fails:\n        checks:\n          exitCode: 1\n      b-passes:\n        checks:\n          exitCode: 0\n",
        );
        let options = RunOptions {
            exit_on_failure: true,
            ..RunOptions::default()
        };

        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 0);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_keep_results_retains_passed_environment() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog("      simple:\n        checks:\n          exitCode: 0\n");
        let options = RunOptions {
            keep_results: true,
            ..RunOptions::default()
        };

        let summary = TestRunner::new(&backend, &fx.layout, options, None)
            .run(&catalog)
            .await;

        assert_eq!(summary.passed, 1);
        assert!(env_path(&fx.layout, "simple").exists());
    }

    #[tokio::test]
    async fn test_outputs_are_verified() {
        let fx = fixture();
        let backend = ScriptedBackend::writing(vec![("out.smi", "C\nCC\n")]);
        let catalog = catalog(
            r#"      good:
        inputs:
          molecules: data/mols.sdf
        checks:
          exitCode: 0
          outputs:
          - name: out.smi
            checks:
            - exists: true
            - lineCount: 2
          - name: mols.sdf
            checks:
            - exists: true
      bad:
        checks:
          exitCode: 0
          outputs:
          - name: out.smi
            checks:
            - lineCount: 3
"#,
        );

        let summary = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None)
            .run(&catalog)
            .await;

        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!env_path(&fx.layout, "good").exists());
        assert!(env_path(&fx.layout, "bad").join("project/out.smi").is_file());
    }

    #[tokio::test]
    async fn test_missing_input_keeps_partial_environment() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      simple:\n        inputs:\n          molecules: data/absent.sdf\n        checks:\n          exitCode: 0\n",
        );

        let summary = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None)
            .run(&catalog)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(backend.calls(), 0);
        assert!(env_path(&fx.layout, "simple").exists());
    }

    #[tokio::test]
    async fn test_backend_timeout_fails_only_that_test() {
        let fx = fixture();
        let backend = ScriptedBackend::timing_out(1);
        let catalog = catalog(
            "      a-stalls:\n        checks:\n          exitCode: 0\n      b-passes:\n        checks:\n          exitCode: 0\n",
        );

        let summary = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None)
            .run(&catalog)
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 1);
        assert_eq!(backend.calls(), 2);
        assert!(env_path(&fx.layout, "a-stalls").exists());
        assert!(!env_path(&fx.layout, "b-passes").exists());
    }

    #[tokio::test]
    async fn test_backend_timeout_keeps_partial_output() {
        let fx = fixture();
        let backend = ScriptedBackend::timing_out(1);
        let catalog = catalog("      stalls:\n        checks:\n          exitCode: 0\n");
        let runner = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None);
        let id = TestId {
            collection: "im-test",
            job: "nop",
            test: "stalls",
        };
        let job = &catalog.definitions[0].definition.jobs["nop"];
        let schema = VariableSchema::from_variables(&job.variables);

        let outcome = runner.run_test(&id, job, &schema, &job.tests["stalls"]).await;

        match outcome {
            Some(RunOutcome::Failed(e)) => {
                assert!(matches!(e, TestError::Backend(BackendError::Timeout { .. })));
                assert_eq!(e.captured_output(), Some(("partial", "")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_escaping_test_name_never_touches_data() {
        let fx = fixture();
        let backend = ScriptedBackend::exiting(0);
        let catalog = catalog(
            "      \"x/../../../data\":\n        checks:\n          exitCode: 0\n",
        );

        for _ in 0..2 {
            let summary = TestRunner::new(&backend, &fx.layout, RunOptions::default(), None)
                .run(&catalog)
                .await;
            assert_eq!(summary.failed, 1);
        }

        assert_eq!(backend.calls(), 0);
        assert!(fx.layout.data_dir().join("mols.sdf").is_file());
        assert!(!fx.layout.data_dir().join("docker-compose.yml").exists());
    }
}
