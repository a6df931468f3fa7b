use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The manifest that names every job definition file under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "job-definition-files", default)]
    pub job_definition_files: Vec<String>,
}

/// One trusted job definition document (a collection of jobs).
#[derive(Debug, Clone, Deserialize)]
pub struct JobDefinition {
    pub collection: String,
    #[serde(default, deserialize_with = "nullable")]
    pub jobs: BTreeMap<String, Job>,
}

impl JobDefinition {
    /// Number of tests declared across every job, ignored ones included.
    pub fn test_count(&self) -> usize {
        self.jobs.values().map(|job| job.tests.len()).sum()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub image: Image,
    pub command: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, deserialize_with = "nullable")]
    pub tests: BTreeMap<String, Test>,
}

/// Container image and resource limits for a job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    pub name: String,
    pub tag: String,
    pub project_directory: String,
    pub working_directory: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cores")]
    pub cores: u32,
}

fn default_memory() -> String {
    "1Gi".to_string()
}

fn default_cores() -> u32 {
    1
}

impl Image {
    /// `name:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// The `variables` block of a job, as written in the definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Variables {
    #[serde(default, deserialize_with = "nullable")]
    pub inputs: VariableGroup,
    #[serde(default, deserialize_with = "nullable")]
    pub options: VariableGroup,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableGroup {
    #[serde(default, deserialize_with = "nullable")]
    pub properties: BTreeMap<String, VariableProperty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableProperty {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default, rename = "mime-types", deserialize_with = "nullable")]
    pub mime_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Scalar,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    Option,
    Input,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub name: String,
    pub kind: VariableKind,
    pub role: VariableRole,
}

/// Typed view of a job's variable declarations, built once per job.
///
/// A name declared both as an option and an input resolves to the option.
#[derive(Debug, Clone, Default)]
pub struct VariableSchema {
    specs: BTreeMap<String, VariableSpec>,
}

impl VariableSchema {
    pub fn from_variables(variables: &Variables) -> Self {
        let mut specs = BTreeMap::new();
        let groups = [
            (VariableRole::Input, &variables.inputs),
            (VariableRole::Option, &variables.options),
        ];
        for (role, group) in groups {
            for (name, property) in &group.properties {
                let kind = if property.multiple {
                    VariableKind::List
                } else {
                    VariableKind::Scalar
                };
                specs.insert(
                    name.clone(),
                    VariableSpec {
                        name: name.clone(),
                        kind,
                        role,
                    },
                );
            }
        }
        Self { specs }
    }

    pub fn get(&self, name: &str) -> Option<&VariableSpec> {
        self.specs.get(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// One concrete parameterisation of a job.
#[derive(Debug, Clone, Deserialize)]
pub struct Test {
    /// Set when the `ignore` key is present, whatever its value.
    #[serde(default, deserialize_with = "key_present")]
    pub ignore: bool,
    #[serde(default, rename = "run-level")]
    pub run_level: Option<u32>,
    #[serde(default, deserialize_with = "nullable")]
    pub options: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub inputs: BTreeMap<String, InputValue>,
    pub checks: Checks,
}

/// Treats an explicit null (`key:` with no value) like an absent key.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn key_present<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    serde::de::IgnoredAny::deserialize(deserializer)?;
    Ok(true)
}

/// A test input: one source path or an ordered list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Single(String),
    Multiple(Vec<String>),
}

impl InputValue {
    pub fn paths(&self) -> &[String] {
        match self {
            InputValue::Single(path) => std::slice::from_ref(path),
            InputValue::Multiple(paths) => paths,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Checks {
    #[serde(rename = "exitCode")]
    pub exit_code: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub outputs: Vec<OutputCheck>,
}

/// Checks applied, in order, to one file the job is expected to produce.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputCheck {
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub checks: Vec<Check>,
}

/// A single output assertion.
///
/// Anything that is not a recognised single-key mapping becomes `Unknown`
/// so the verifier can reject it instead of skipping it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub enum Check {
    Exists(bool),
    LineCount(u64),
    Unknown(String),
}

impl Check {
    pub fn kind(&self) -> &str {
        match self {
            Check::Exists(_) => "exists",
            Check::LineCount(_) => "lineCount",
            Check::Unknown(kind) => kind,
        }
    }
}

impl From<Map<String, Value>> for Check {
    fn from(map: Map<String, Value>) -> Self {
        if map.len() != 1 {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            return Check::Unknown(keys.join(","));
        }
        let Some((key, value)) = map.into_iter().next() else {
            return Check::Unknown(String::new());
        };
        let parsed = match (key.as_str(), &value) {
            ("exists", Value::Bool(expected)) => Some(Check::Exists(*expected)),
            ("lineCount", Value::Number(n)) => n.as_u64().map(Check::LineCount),
            _ => None,
        };
        parsed.unwrap_or(Check::Unknown(key))
    }
}
