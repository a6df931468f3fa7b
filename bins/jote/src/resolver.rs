/// Variable Resolver
///
/// Turns a test's `options` and `inputs` into the substitution map used to
/// render the job command, plus the ordered list of input files to stage.
///
/// Only the basename of an input ever reaches the command: the container
/// sees staged files in its project directory, not the repository layout.

use crate::error::TestError;
use jote_common::config::{INSTANCE_DIRECTORY, INSTANCE_DIRECTORY_VARIABLE};
use jote_common::types::{InputValue, Test, VariableKind, VariableSchema};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub type Substitutions = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub substitutions: Substitutions,
    /// Input paths as written in the test (relative to the repository root).
    pub input_files: Vec<String>,
}

pub fn resolve(test: &Test, schema: &VariableSchema) -> Result<Resolution, TestError> {
    let mut resolution = Resolution::default();

    for (name, value) in &test.options {
        if schema.get(name).is_none() {
            return Err(TestError::UndeclaredVariable { name: name.clone() });
        }
        resolution.substitutions.insert(name.clone(), value.clone());
    }

    for (name, value) in &test.inputs {
        let spec = schema
            .get(name)
            .ok_or_else(|| TestError::UndeclaredVariable { name: name.clone() })?;

        let substitution = match (spec.kind, value) {
            (VariableKind::List, value) => {
                let basenames = value
                    .paths()
                    .iter()
                    .map(|path| Value::String(basename(path)))
                    .collect();
                Value::Array(basenames)
            }
            (VariableKind::Scalar, InputValue::Single(path)) => Value::String(basename(path)),
            (VariableKind::Scalar, InputValue::Multiple(_)) => {
                return Err(TestError::InputArity { name: name.clone() });
            }
        };

        resolution.substitutions.insert(name.clone(), substitution);
        resolution.input_files.extend(value.paths().iter().cloned());
    }

    resolution.substitutions.insert(
        INSTANCE_DIRECTORY_VARIABLE.to_string(),
        Value::String(INSTANCE_DIRECTORY.to_string()),
    );

    Ok(resolution)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
