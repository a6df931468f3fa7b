//! YAML style lint for job definition files.
//!
//! The policy comes from the repository's `.yamllint` file and uses the
//! same rule names and options as yamllint for the rules supported here:
//! `line-length`, `trailing-spaces`, `document-start`,
//! `new-line-at-end-of-file` and `empty-lines`. Other rules in the policy
//! are ignored.

use crate::error::LoadError;
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => f.write_str("error"),
            Level::Warning => f.write_str("warning"),
        }
    }
}

/// One lint finding. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub line: usize,
    pub column: usize,
    pub level: Level,
    pub message: String,
    pub rule: &'static str,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {}:{}  {}  {}  ({})",
            self.line, self.column, self.level, self.message, self.rule
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule<T> {
    level: Level,
    options: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LineLength {
    max: usize,
    allow_non_breakable_words: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentStart {
    present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EmptyLines {
    max: usize,
    max_start: usize,
    max_end: usize,
}

const KNOWN_RULES: [&str; 5] = [
    "line-length",
    "trailing-spaces",
    "document-start",
    "new-line-at-end-of-file",
    "empty-lines",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LintPolicy {
    line_length: Option<Rule<LineLength>>,
    trailing_spaces: Option<Rule<()>>,
    document_start: Option<Rule<DocumentStart>>,
    new_line_at_end_of_file: Option<Rule<()>>,
    empty_lines: Option<Rule<EmptyLines>>,
}

/// The level and option mapping of an enabled rule.
type Setting<'a> = Option<(Level, Option<&'a Mapping>)>;

/// Level of each supported rule in yamllint's `default` configuration.
fn default_level(name: &str) -> Level {
    match name {
        "document-start" => Level::Warning,
        _ => Level::Error,
    }
}

/// A rule configured as a mapping without `level` keeps the level it has
/// in the configuration it extends.
fn rule_setting<'a>(
    rules: Option<&'a Mapping>,
    name: &str,
    extends_default: bool,
) -> Result<Setting<'a>, String> {
    let inherited = if extends_default {
        default_level(name)
    } else {
        Level::Error
    };
    let value = rules.and_then(|rules| rules.get(name));
    match value {
        None => Ok(extends_default.then_some((inherited, None))),
        Some(Value::String(s)) if s == "disable" => Ok(None),
        Some(Value::Bool(false)) => Ok(None),
        Some(Value::String(s)) if s == "enable" => Ok(Some((Level::Error, None))),
        Some(Value::Bool(true)) => Ok(Some((Level::Error, None))),
        Some(Value::Mapping(options)) => {
            let level = match options.get("level").and_then(Value::as_str) {
                None => inherited,
                Some("error") => Level::Error,
                Some("warning") => Level::Warning,
                Some(other) => return Err(format!("{name}: unknown level \"{other}\"")),
            };
            Ok(Some((level, Some(options))))
        }
        Some(other) => Err(format!("{name}: invalid rule configuration {other:?}")),
    }
}

fn usize_option(options: Option<&Mapping>, rule: &str, key: &str, default: usize) -> Result<usize, String> {
    match options.and_then(|options| options.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("{rule}: option \"{key}\" must be a non-negative integer")),
    }
}

fn bool_option(options: Option<&Mapping>, rule: &str, key: &str, default: bool) -> Result<bool, String> {
    match options.and_then(|options| options.get(key)) {
        None => Ok(default),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| format!("{rule}: option \"{key}\" must be a boolean")),
    }
}

impl LintPolicy {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|message| LoadError::LintPolicy {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let doc: Value = serde_yaml::from_str(text).map_err(|e| e.to_string())?;

        let extends_default = match doc.get("extends") {
            None => false,
            Some(Value::String(base)) if base == "default" => true,
            Some(other) => return Err(format!("unsupported extends: {other:?}")),
        };

        let rules = match doc.get("rules") {
            None | Some(Value::Null) => None,
            Some(Value::Mapping(rules)) => Some(rules),
            Some(_) => return Err("rules must be a mapping".to_string()),
        };

        if let Some(rules) = rules {
            for name in rules.keys().filter_map(Value::as_str) {
                if !KNOWN_RULES.contains(&name) {
                    debug!(rule = name, "Ignoring unsupported lint rule");
                }
            }
        }

        let mut policy = LintPolicy::default();

        if let Some((level, options)) = rule_setting(rules, "line-length", extends_default)? {
            policy.line_length = Some(Rule {
                level,
                options: LineLength {
                    max: usize_option(options, "line-length", "max", 80)?,
                    allow_non_breakable_words: bool_option(
                        options,
                        "line-length",
                        "allow-non-breakable-words",
                        true,
                    )?,
                },
            });
        }
        if let Some((level, _)) = rule_setting(rules, "trailing-spaces", extends_default)? {
            policy.trailing_spaces = Some(Rule { level, options: () });
        }
        if let Some((level, options)) = rule_setting(rules, "document-start", extends_default)? {
            policy.document_start = Some(Rule {
                level,
                options: DocumentStart {
                    present: bool_option(options, "document-start", "present", true)?,
                },
            });
        }
        if let Some((level, _)) = rule_setting(rules, "new-line-at-end-of-file", extends_default)? {
            policy.new_line_at_end_of_file = Some(Rule { level, options: () });
        }
        if let Some((level, options)) = rule_setting(rules, "empty-lines", extends_default)? {
            policy.empty_lines = Some(Rule {
                level,
                options: EmptyLines {
                    max: usize_option(options, "empty-lines", "max", 2)?,
                    max_start: usize_option(options, "empty-lines", "max-start", 0)?,
                    max_end: usize_option(options, "empty-lines", "max-end", 0)?,
                },
            });
        }

        Ok(policy)
    }

    /// Every problem found in `text`, ordered by position.
    pub fn lint(&self, text: &str) -> Vec<Problem> {
        let mut lines: Vec<&str> = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect();
        if text.ends_with('\n') {
            lines.pop();
        }

        let mut problems = Vec::new();

        if let Some(rule) = &self.document_start {
            check_document_start(rule, &lines, &mut problems);
        }
        if let Some(rule) = &self.line_length {
            check_line_length(rule, &lines, &mut problems);
        }
        if let Some(rule) = &self.trailing_spaces {
            for (index, line) in lines.iter().enumerate() {
                let trimmed = line.trim_end_matches([' ', '\t']);
                if trimmed.len() != line.len() {
                    problems.push(Problem {
                        line: index + 1,
                        column: trimmed.chars().count() + 1,
                        level: rule.level,
                        message: "trailing spaces".to_string(),
                        rule: "trailing-spaces",
                    });
                }
            }
        }
        if let Some(rule) = &self.empty_lines {
            check_empty_lines(rule, &lines, &mut problems);
        }
        if let Some(rule) = &self.new_line_at_end_of_file {
            if !text.is_empty() && !text.ends_with('\n') {
                problems.push(Problem {
                    line: lines.len(),
                    column: lines.last().map_or(0, |line| line.chars().count()) + 1,
                    level: rule.level,
                    message: "no new line character at the end of file".to_string(),
                    rule: "new-line-at-end-of-file",
                });
            }
        }

        problems.sort_by_key(|problem| (problem.line, problem.column));
        problems
    }
}

fn check_document_start(rule: &Rule<DocumentStart>, lines: &[&str], problems: &mut Vec<Problem>) {
    let first = lines.iter().enumerate().find(|(_, line)| {
        let content = line.trim_start();
        !content.is_empty() && !content.starts_with('#')
    });
    let Some((index, line)) = first else {
        return;
    };
    let has_start = line.starts_with("---");
    let message = match (rule.options.present, has_start) {
        (true, false) => "missing document start \"---\"",
        (false, true) => "found forbidden document start \"---\"",
        _ => return,
    };
    problems.push(Problem {
        line: index + 1,
        column: 1,
        level: rule.level,
        message: message.to_string(),
        rule: "document-start",
    });
}

fn check_line_length(rule: &Rule<LineLength>, lines: &[&str], problems: &mut Vec<Problem>) {
    let max = rule.options.max;
    for (index, line) in lines.iter().enumerate() {
        let length = line.chars().count();
        if length <= max {
            continue;
        }
        if rule.options.allow_non_breakable_words {
            let content = line
                .trim_start()
                .trim_start_matches("- ")
                .trim_start_matches('#')
                .trim_start();
            if !content.contains([' ', '\t']) {
                continue;
            }
        }
        problems.push(Problem {
            line: index + 1,
            column: max + 1,
            level: rule.level,
            message: format!("line too long ({length} > {max} characters)"),
            rule: "line-length",
        });
    }
}

fn check_empty_lines(rule: &Rule<EmptyLines>, lines: &[&str], problems: &mut Vec<Problem>) {
    let options = &rule.options;
    let mut push = |last_blank: usize, count: usize, max: usize| {
        if count > max {
            problems.push(Problem {
                line: last_blank,
                column: 1,
                level: rule.level,
                message: format!("too many blank lines ({count} > {max})"),
                rule: "empty-lines",
            });
        }
    };

    let mut run_start: Option<usize> = None;
    for (index, line) in lines.iter().enumerate() {
        if line.is_empty() {
            run_start.get_or_insert(index);
            continue;
        }
        if let Some(start) = run_start.take() {
            let max = if start == 0 { options.max_start } else { options.max };
            push(index, index - start, max);
        }
    }
    if let Some(start) = run_start {
        push(lines.len(), lines.len() - start, options.max_end);
    }
}
