//! Execution environments: one isolated directory per test.
//!
//! Layout of an environment at `<test root>/<collection>.<job>.<test>`:
//!
//! ```text
//! docker-compose.yml          execution descriptor
//! project/                    bind-mounted at the job's project directory
//! project/.instance-8888...   instance directory sentinel
//! ```

use crate::descriptor::{ContainerSpec, ExecutionDescriptor};
use crate::engine::{ContainerBackend, ContainerOutput};
use crate::error::TestError;
use jote_common::config::{Layout, DATA_DIRECTORY, INSTANCE_DIRECTORY, PROJECT_DIRECTORY};
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Switches the process working directory and restores it on drop,
/// including when the guarded run fails or times out.
pub struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    pub fn enter(path: &Path) -> io::Result<Self> {
        let previous = env::current_dir()?;
        env::set_current_dir(path)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.previous) {
            warn!(
                path = %self.previous.display(),
                error = %e,
                "Failed to restore working directory"
            );
        }
    }
}

/// The test environment of a single (collection, job, test).
#[derive(Debug, Clone)]
pub struct ExecutionEnvironment {
    path: PathBuf,
    project_path: PathBuf,
}

impl ExecutionEnvironment {
    /// Fails when the names would put the environment anywhere other than
    /// directly under the test root.
    pub fn new(layout: &Layout, collection: &str, job: &str, test: &str) -> Result<Self, TestError> {
        let path = layout
            .test_path(collection, job, test)
            .ok_or_else(|| TestError::UnsafeName {
                collection: collection.to_string(),
                job: job.to_string(),
                test: test.to_string(),
            })?;
        let project_path = path.join(PROJECT_DIRECTORY);
        Ok(Self { path, project_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Build the directory tree and persist the descriptor. Anything left
    /// at this path by an earlier run is removed first.
    ///
    /// Returns the project path (where inputs are staged and outputs appear).
    pub fn create(&self, spec: &ContainerSpec) -> Result<&Path, TestError> {
        self.delete()?;

        let instance_path = self.project_path.join(INSTANCE_DIRECTORY);
        fs::create_dir_all(&instance_path)
            .map_err(|e| TestError::environment(&instance_path, e))?;

        ExecutionDescriptor::new(spec, &self.project_path)
            .write(&self.path)
            .map_err(|e| TestError::environment(ExecutionDescriptor::path(&self.path), e))?;

        debug!(path = %self.path.display(), "Created test environment");
        Ok(&self.project_path)
    }

    /// Copy the test's input files into the project directory.
    pub fn stage_inputs(&self, layout: &Layout, inputs: &[String]) -> Result<(), TestError> {
        for (input, source) in inputs.iter().zip(check_inputs(layout, inputs)?) {
            let Some(name) = source.file_name() else {
                return Err(TestError::MisrootedInput {
                    path: input.clone(),
                    prefix: DATA_DIRECTORY,
                });
            };
            let target = self.project_path.join(name);
            fs::copy(&source, &target).map_err(|e| TestError::environment(&target, e))?;
            println!("  + {input}");
        }
        Ok(())
    }

    /// Run the container with the working directory switched to this
    /// environment for the duration of the call.
    pub async fn run<B>(&self, backend: &B) -> Result<ContainerOutput, TestError>
    where
        B: ContainerBackend + ?Sized,
    {
        let _cwd = WorkingDirGuard::enter(&self.path)
            .map_err(|e| TestError::environment(&self.path, e))?;
        Ok(backend.run(&self.path).await?)
    }

    /// Remove the environment. Removing an absent environment is not an error.
    pub fn delete(&self) -> Result<(), TestError> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Deleted test environment");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TestError::environment(&self.path, e)),
        }
    }
}

/// Check every input is written under the data directory and exists.
/// Returns the resolved source paths in input order.
pub fn check_inputs(layout: &Layout, inputs: &[String]) -> Result<Vec<PathBuf>, TestError> {
    let prefix = format!("{DATA_DIRECTORY}/");
    inputs
        .iter()
        .map(|input| {
            let escapes = Path::new(input)
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir));
            if !input.starts_with(&prefix) || escapes {
                return Err(TestError::MisrootedInput {
                    path: input.clone(),
                    prefix: DATA_DIRECTORY,
                });
            }
            let source = layout.input_path(input);
            if !source.is_file() {
                return Err(TestError::MissingInput {
                    path: input.clone(),
                });
            }
            Ok(source)
        })
        .collect()
}

/// Remove all test material.
pub fn wipe(layout: &Layout) -> io::Result<()> {
    match fs::remove_dir_all(layout.test_root()) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Serialises tests that touch the process working directory.
#[cfg(test)]
pub(crate) static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
