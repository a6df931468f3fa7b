/// Output Verifier
///
/// **Core Responsibility:**
/// Compare the files a job left in its project directory against the
/// test's declared output checks.
///
/// **Properties:**
/// - Knows nothing about Docker or templates
/// - Checks run in declaration order and stop at the first failure
/// - Unknown check kinds fail; they are never skipped
/// - Line counts are exact (no tolerance)

use jote_common::types::{Check, OutputCheck};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error("check exists \"{name}\" (expected {expected}, found {actual})")]
    Exists {
        name: String,
        expected: bool,
        actual: bool,
    },

    #[error("check lineCount \"{name}\" (found {actual}, expected {expected})")]
    LineCount {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("check lineCount \"{name}\" cannot read the file: {source}")]
    Unreadable {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown output check type ({kind}) for \"{name}\"")]
    Unknown { name: String, kind: String },
}

/// Count newline-delimited records; a final line without a trailing
/// newline still counts.
pub fn count_lines(content: &[u8]) -> u64 {
    let newlines = content.iter().filter(|&&b| b == b'\n').count() as u64;
    match content.last() {
        Some(b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

fn check_one(name: &str, path: &Path, check: &Check) -> Result<(), CheckFailure> {
    match check {
        Check::Exists(expected) => {
            let actual = path.exists();
            if actual != *expected {
                return Err(CheckFailure::Exists {
                    name: name.to_string(),
                    expected: *expected,
                    actual,
                });
            }
        }
        Check::LineCount(expected) => {
            let content = fs::read(path).map_err(|source| CheckFailure::Unreadable {
                name: name.to_string(),
                source,
            })?;
            let actual = count_lines(&content);
            if actual != *expected {
                return Err(CheckFailure::LineCount {
                    name: name.to_string(),
                    expected: *expected,
                    actual,
                });
            }
        }
        Check::Unknown(kind) => {
            return Err(CheckFailure::Unknown {
                name: name.to_string(),
                kind: kind.clone(),
            });
        }
    }
    Ok(())
}

/// Verify every output check against files under `project_path`.
pub fn verify(project_path: &Path, outputs: &[OutputCheck]) -> Result<(), CheckFailure> {
    if outputs.is_empty() {
        return Ok(());
    }

    println!("→ Checking outputs");

    for output in outputs {
        println!("  - {}", output.name);
        let path = project_path.join(&output.name);

        for check in &output.checks {
            match check_one(&output.name, &path, check) {
                Ok(()) => println!("    ✓ {}", describe(check)),
                Err(failure) => {
                    println!("    ✗ {}", describe(check));
                    return Err(failure);
                }
            }
        }
    }

    Ok(())
}

fn describe(check: &Check) -> String {
    match check {
        Check::Exists(expected) => format!("exists ({expected})"),
        Check::LineCount(expected) => format!("lineCount ({expected})"),
        Check::Unknown(kind) => format!("{kind} (unknown)"),
    }
}
