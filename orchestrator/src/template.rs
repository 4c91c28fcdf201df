//! Minimal argument templating: dotted-path substitution, nothing more.
//!
//! Placeholders look like `{{ .args.port }}` or `{{ .start.sessionID }}`.
//! A string that consists of exactly one placeholder resolves to the
//! referenced value with its JSON type intact; placeholders embedded in a
//! longer string stringify scalars. Unknown references are errors, never
//! silent empty strings.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template references unknown path `{path}`")]
    UnknownReference { path: String },

    #[error("template path `{path}` resolves to a non-scalar inside a string")]
    NonScalarInterpolation { path: String },

    #[error("unterminated placeholder in `{template}`")]
    Unterminated { template: String },
}

/// Render every string in `template` against `context`.
pub fn render_template(template: &Value, context: &Value) -> Result<Value, TemplateError> {
    match template {
        Value::String(s) => render_string(s, context),
        Value::Array(items) => items
            .iter()
            .map(|item| render_template(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render_template(value, context)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(template: &str, context: &Value) -> Result<Value, TemplateError> {
    // Whole-string placeholder keeps the referenced value's type.
    let trimmed = template.trim();
    if let Some(path) = sole_placeholder(trimmed) {
        return lookup(context, &path).cloned().ok_or(TemplateError::UnknownReference { path });
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unterminated {
                template: template.to_string(),
            });
        };
        let path = normalize_path(&after[..end]);
        let value = lookup(context, &path).ok_or_else(|| TemplateError::UnknownReference {
            path: path.clone(),
        })?;
        match value {
            Value::String(s) => out.push_str(s),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            _ => return Err(TemplateError::NonScalarInterpolation { path }),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// `Some(path)` when the whole string is exactly one placeholder.
fn sole_placeholder(s: &str) -> Option<String> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(normalize_path(inner))
}

fn normalize_path(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_string()
}

/// Walk a dotted path into `context`.
pub(crate) fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = current.get(segment)?;
    }
    Some(current)
}
