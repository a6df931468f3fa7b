//! Definition Validator and catalog loading.
//!
//! The manifest and every job definition it lists are validated against
//! fixed JSON schemas and (unless skipped) linted before anything runs.
//! The first file that fails aborts the whole load: with an untrustworthy
//! definition anywhere, the set of tests to run is unknown.

use crate::error::LoadError;
use crate::lint::{Level, LintPolicy};
use jote_common::config::Layout;
use jote_common::types::{JobDefinition, Manifest};
use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MANIFEST_SCHEMA: &str = include_str!("../schema/manifest.schema.json");
const JOB_DEFINITION_SCHEMA: &str = include_str!("../schema/job-definition.schema.json");

struct SchemaValidator {
    name: &'static str,
    validator: Validator,
}

impl SchemaValidator {
    fn new(name: &'static str, text: &str) -> Result<Self, LoadError> {
        let setup = |message: String| LoadError::SchemaSetup {
            schema: name,
            message,
        };
        let schema: Value = serde_json::from_str(text).map_err(|e| setup(e.to_string()))?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|e| setup(e.to_string()))?;
        Ok(Self { name, validator })
    }

    /// All violations, not just the first.
    fn violations(&self, doc: &Value) -> Vec<String> {
        self.validator
            .iter_errors(doc)
            .map(|err| format!("{} ({})", err, err.instance_path()))
            .collect()
    }
}

/// A validated definition and the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedDefinition {
    pub path: PathBuf,
    pub definition: JobDefinition,
}

/// Every definition that declares at least one test, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub definitions: Vec<LoadedDefinition>,
    /// Tests found, ignored ones included.
    pub test_count: usize,
}

pub struct DefinitionValidator {
    manifest_schema: SchemaValidator,
    definition_schema: SchemaValidator,
    lint: Option<LintPolicy>,
}

impl DefinitionValidator {
    /// `lint` is `None` when style linting is skipped.
    pub fn new(lint: Option<LintPolicy>) -> Result<Self, LoadError> {
        Ok(Self {
            manifest_schema: SchemaValidator::new("manifest", MANIFEST_SCHEMA)?,
            definition_schema: SchemaValidator::new("job definition", JOB_DEFINITION_SCHEMA)?,
            lint,
        })
    }

    pub fn validate_manifest(&self, path: &Path, text: &str) -> Result<Manifest, LoadError> {
        validate_document(&self.manifest_schema, path, text)
    }

    /// Schema-validate, lint and decode one job definition document.
    pub fn validate(&self, path: &Path, text: &str) -> Result<JobDefinition, LoadError> {
        let definition = validate_document(&self.definition_schema, path, text)?;

        if let Some(policy) = &self.lint {
            let problems = policy.lint(text);
            let failed = problems.iter().any(|p| p.level == Level::Error);
            if failed {
                return Err(LoadError::Lint {
                    path: path.to_path_buf(),
                    problems: problems.iter().map(ToString::to_string).collect(),
                });
            }
            for problem in &problems {
                println!("W {}{problem}", path.display());
            }
        }

        Ok(definition)
    }
}

fn validate_document<T: DeserializeOwned>(
    schema: &SchemaValidator,
    path: &Path,
    text: &str,
) -> Result<T, LoadError> {
    let doc: Value = serde_yaml::from_str(text).map_err(|source| LoadError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let violations = schema.violations(&doc);
    if !violations.is_empty() {
        return Err(LoadError::Schema {
            path: path.to_path_buf(),
            schema: schema.name,
            violations,
        });
    }

    serde_json::from_value(doc).map_err(|e| LoadError::Schema {
        path: path.to_path_buf(),
        schema: schema.name,
        violations: vec![e.to_string()],
    })
}

fn read(path: &Path) -> Result<String, LoadError> {
    if !path.is_file() {
        return Err(LoadError::Missing {
            what: "file",
            path: path.to_path_buf(),
        });
    }
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Sanity-check the repository before doing anything else.
pub fn check_layout(layout: &Layout, skip_lint: bool) -> Result<(), LoadError> {
    for dir in [layout.definitions_dir(), layout.data_dir()] {
        if !dir.is_dir() {
            return Err(LoadError::Missing {
                what: "directory",
                path: dir,
            });
        }
    }
    let policy = layout.lint_policy_path();
    if !skip_lint && !policy.is_file() {
        return Err(LoadError::Missing {
            what: "file",
            path: policy,
        });
    }
    Ok(())
}

/// Load every definition named in the manifest.
pub fn load(layout: &Layout, manifest: &str, skip_lint: bool) -> Result<Catalog, LoadError> {
    let lint = if skip_lint {
        None
    } else {
        Some(LintPolicy::load(&layout.lint_policy_path())?)
    };
    let validator = DefinitionValidator::new(lint)?;

    let manifest_path = layout.manifest_path(manifest);
    let manifest = validator.validate_manifest(&manifest_path, &read(&manifest_path)?)?;

    let mut catalog = Catalog::default();
    for filename in &manifest.job_definition_files {
        let path = layout.definition_path(filename);
        let definition = validator.validate(&path, &read(&path)?)?;

        let test_count = definition.test_count();
        debug!(path = %path.display(), test_count, "Loaded job definition");
        if test_count > 0 {
            catalog.test_count += test_count;
            catalog.definitions.push(LoadedDefinition { path, definition });
        }
    }

    info!(
        definitions = catalog.definitions.len(),
        tests = catalog.test_count,
        "Loaded catalog"
    );
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"---
collection: im-test
jobs:
  nop:
    image:
      name: busybox
      tag: "1.36"
      project-directory: /data
      working-directory: /data
    command: echo hi
    variables: {}
    tests:
      simple:
        checks:
          exitCode: 0
"#;

    const NO_TESTS: &str = r#"---
collection: im-empty
jobs:
  nop:
    image:
      name: busybox
      tag: "1.36"
      project-directory: /data
      working-directory: /data
    command: echo hi
    variables: {}
    tests: {}
"#;

    fn repo(files: &[(&str, &str)]) -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data-manager")).unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join(".yamllint"), "extends: default\n").unwrap();
        for (name, content) in files {
            fs::write(dir.path().join("data-manager").join(name), content).unwrap();
        }
        let layout = Layout::new(dir.path());
        (dir, layout)
    }

    #[test]
    fn test_load_counts_tests_and_drops_empty() {
        let (_dir, layout) = repo(&[
            (
                "manifest.yaml",
                "---\njob-definition-files:\n- good.yaml\n- empty.yaml\n",
            ),
            ("good.yaml", GOOD),
            ("empty.yaml", NO_TESTS),
        ]);

        let catalog = load(&layout, "manifest.yaml", false).unwrap();

        assert_eq!(catalog.test_count, 1);
        assert_eq!(catalog.definitions.len(), 1);
        assert_eq!(catalog.definitions[0].definition.collection, "im-test");
    }

    #[test]
    fn test_schema_reports_every_violation() {
        let bad = r#"---
collection: im-test
jobs:
  nop:
    image:
      name: busybox
      tag: "1.36"
      project-directory: /data
      working-directory: /data
    variables: {}
    tests:
      simple:
        checks: {}
"#;
        let (_dir, layout) = repo(&[
            ("manifest.yaml", "---\njob-definition-files:\n- bad.yaml\n"),
            ("bad.yaml", bad),
        ]);

        let err = load(&layout, "manifest.yaml", true).unwrap_err();

        assert!(matches!(err, LoadError::Schema { .. }));
        // missing `command` and missing `checks.exitCode`
        assert!(err.details().len() >= 2, "{:?}", err.details());
    }

    #[test]
    fn test_one_bad_definition_aborts_load() {
        let (_dir, layout) = repo(&[
            (
                "manifest.yaml",
                "---\njob-definition-files:\n- good.yaml\n- broken.yaml\n",
            ),
            ("good.yaml", GOOD),
            ("broken.yaml", "---\ncollection: im-test\n"),
        ]);

        assert!(load(&layout, "manifest.yaml", true).is_err());
    }

    #[test]
    fn test_lint_failure_and_skip() {
        let unlinted = GOOD.replace("command: echo hi\n", "command: echo hi  \n");
        let (_dir, layout) = repo(&[
            ("manifest.yaml", "---\njob-definition-files:\n- good.yaml\n"),
            ("good.yaml", unlinted.as_str()),
        ]);

        let err = load(&layout, "manifest.yaml", false).unwrap_err();
        assert!(matches!(err, LoadError::Lint { .. }));
        assert_eq!(err.details().len(), 1);

        assert!(load(&layout, "manifest.yaml", true).is_ok());
    }

    #[test]
    fn test_lint_warnings_do_not_reject() {
        let (_dir, layout) = repo(&[
            ("manifest.yaml", "---\njob-definition-files:\n- good.yaml\n"),
            ("good.yaml", GOOD.trim_start_matches("---\n")),
        ]);

        assert!(load(&layout, "manifest.yaml", false).is_ok());
    }

    #[test]
    fn test_job_and_test_names_must_be_plain() {
        for (from, to) in [
            ("      simple:", "      \"x/../../../data\":"),
            ("      simple:", "      \"..\":"),
            ("  nop:", "  \"a\\\\b\":"),
        ] {
            let bad = GOOD.replace(from, to);
            let (_dir, layout) = repo(&[
                ("manifest.yaml", "---\njob-definition-files:\n- bad.yaml\n"),
                ("bad.yaml", bad.as_str()),
            ]);

            assert!(
                matches!(load(&layout, "manifest.yaml", true), Err(LoadError::Schema { .. })),
                "{to}"
            );
        }
    }

    #[test]
    fn test_missing_manifest() {
        let (_dir, layout) = repo(&[]);
        assert!(matches!(
            load(&layout, "manifest.yaml", true),
            Err(LoadError::Missing { .. })
        ));
    }

    #[test]
    fn test_manifest_schema() {
        let (_dir, layout) = repo(&[("manifest.yaml", "---\nfiles: []\n")]);
        assert!(matches!(
            load(&layout, "manifest.yaml", true),
            Err(LoadError::Schema { schema: "manifest", .. })
        ));
    }

    #[test]
    fn test_check_layout() {
        let (dir, layout) = repo(&[]);
        assert!(check_layout(&layout, false).is_ok());

        fs::remove_file(dir.path().join(".yamllint")).unwrap();
        assert!(check_layout(&layout, false).is_err());
        assert!(check_layout(&layout, true).is_ok());

        fs::remove_dir_all(dir.path().join("data")).unwrap();
        assert!(check_layout(&layout, true).is_err());
    }
}
