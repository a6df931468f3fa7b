// Repository layout and execution bounds
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Where job definitions (and the manifest) live.
pub const DEFINITION_DIRECTORY: &str = "data-manager";
pub const DEFAULT_MANIFEST: &str = "manifest.yaml";
/// Where test input files live. Inputs must be written with this prefix.
pub const DATA_DIRECTORY: &str = "data";
/// Lint policy of the repository under test.
pub const YAMLLINT_FILE: &str = ".yamllint";
/// Test material lives under the definitions directory.
pub const TEST_DIRECTORY: &str = "jote";
pub const PROJECT_DIRECTORY: &str = "project";
pub const DESCRIPTOR_FILE: &str = "docker-compose.yml";

/// Fixed instance directory name expected by jobs built for the Data Manager.
pub const INSTANCE_DIRECTORY: &str = ".instance-88888888-8888-8888-8888-888888888888";
pub const INSTANCE_DIRECTORY_VARIABLE: &str = "DM_INSTANCE_DIRECTORY";

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Time bounds applied to every container run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub run: Duration,
    pub teardown: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            run: DEFAULT_TEST_TIMEOUT,
            teardown: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

/// Paths of the repository under test, all anchored at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn definitions_dir(&self) -> PathBuf {
        self.root.join(DEFINITION_DIRECTORY)
    }

    pub fn manifest_path(&self, manifest: &str) -> PathBuf {
        self.definitions_dir().join(manifest)
    }

    pub fn definition_path(&self, filename: &str) -> PathBuf {
        self.definitions_dir().join(filename)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIRECTORY)
    }

    pub fn lint_policy_path(&self) -> PathBuf {
        self.root.join(YAMLLINT_FILE)
    }

    /// Root of all test material; removed wholesale by a wipe.
    pub fn test_root(&self) -> PathBuf {
        self.definitions_dir().join(TEST_DIRECTORY)
    }

    /// Unique per (collection, job, test) within a run.
    ///
    /// `None` unless the names form exactly one directory directly under
    /// the test root (no separators, no `.`/`..`, no empty names).
    pub fn test_path(&self, collection: &str, job: &str, test: &str) -> Option<PathBuf> {
        let names = [collection, job, test];
        if names.iter().any(|name| name.is_empty() || name.contains(['/', '\\'])) {
            return None;
        }
        let dir = format!("{collection}.{job}.{test}");
        let mut components = Path::new(&dir).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.test_root().join(dir)),
            _ => None,
        }
    }

    /// Resolve a test input (written relative to the repository root).
    pub fn input_path(&self, input: &str) -> PathBuf {
        self.root.join(input)
    }
}
