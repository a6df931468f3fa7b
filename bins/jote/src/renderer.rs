// Command rendering with Jinja2 templates (minijinja)
use crate::error::TestError;
use crate::resolver::Substitutions;
use minijinja::{AutoEscape, Environment, UndefinedBehavior};

/// Renders job command templates into single-line shell commands.
///
/// Job definitions are written against Jinja2 (`{{ x }}`, `{% for %}`,
/// `{% if %}`, `|join(' ')`). Undefined variables are strict, so a
/// reference to a variable the test did not provide is an error rather
/// than an empty string. Output is never escaped.
pub struct CommandRenderer {
    env: Environment<'static>,
}

impl CommandRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        Self { env }
    }

    pub fn render(&self, template: &str, substitutions: &Substitutions) -> Result<String, TestError> {
        let rendered = self
            .env
            .render_str(template, substitutions)
            .map_err(|e| TestError::Render {
                template: template.to_string(),
                message: e.to_string(),
            })?;

        // The command is handed to the container as one shell invocation
        Ok(rendered.chars().filter(|c| !is_line_break(*c)).collect())
    }
}

impl Default for CommandRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Every character that ends a line, as far as text splitting goes.
fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}
