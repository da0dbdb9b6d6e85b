//! Entry-point discovery inside benchmark program text.
//!
//! Finds the first `procedure` declaration carrying a given boolean
//! attribute, e.g. `procedure {:entry_point} main(...)`. Other attributes
//! (with optional numeric or string payloads) may appear before or after
//! the one being searched for.

use std::fs;
use std::path::Path;

use regex::Regex;
use tracing::debug;

use crate::error::ConfigError;

/// Name of the first procedure in `program` annotated with
/// `{:attribute}`, or `None` when no declaration matches. Matching is
/// line-based and anchored at the start of the line.
pub fn find_with_bool_attribute(
    attribute: &str,
    program: &Path,
) -> Result<Option<String>, ConfigError> {
    if attribute.is_empty()
        || !attribute
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(ConfigError::InvalidEntryPointAttribute(
            attribute.to_string(),
        ));
    }

    // zero or more unrelated attributes, each optionally carrying a
    // number or a quoted string
    let attrs = r#"(?:\s*\{:\w+\s*(?:[0-9]+|"[^"]*")?\}\s*)*\s*"#;
    let pattern = format!(
        r#"^procedure\s*{attrs}\{{:{attribute}\s*\}}{attrs}(?P<proc>[a-zA-Z_$][a-zA-Z_$0-9]*)\("#
    );
    let matcher = Regex::new(&pattern)
        .map_err(|_| ConfigError::InvalidEntryPointAttribute(attribute.to_string()))?;

    let source = fs::read_to_string(program)?;
    for line in source.lines() {
        if let Some(caps) = matcher.captures(line) {
            let name = caps["proc"].to_string();
            debug!(entry_point = %name, program = %program.display(), "found entry point");
            return Ok(Some(name));
        }
    }
    debug!(program = %program.display(), attribute, "no entry point found");
    Ok(None)
}
