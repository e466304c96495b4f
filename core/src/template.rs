//! Pure-function facade over the template backend.
//!
//! The engine treats rendering as `(template_text, variables) -> text` with
//! up-front syntax validation; everything stateful (registries, inheritance,
//! file loading) is deliberately out of reach. Variables form a JSON tree
//! merged from auto-derived context, rule configuration, and per-template
//! metadata, in that order of increasing precedence.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde_json::Value;
use tera::Context;
use tera::Tera;

use crate::error::Result;
use crate::error::SxnErr;

/// Engine names a template entry may declare. `liquid` is the historical
/// default; both are served by the same backend, whose `{{ var }}`
/// interpolation is the supported surface.
pub const RECOGNIZED_ENGINES: &[&str] = &["liquid", "tera"];

pub const DEFAULT_ENGINE: &str = "liquid";

static VARIABLE_EXPR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)").ok());

pub fn is_recognized_engine(name: &str) -> bool {
    RECOGNIZED_ENGINES.contains(&name)
}

/// Check template syntax without rendering. `name` is only used in the error
/// message (typically the source-relative path).
pub fn validate(name: &str, text: &str) -> Result<()> {
    let mut tera = Tera::default();
    tera.add_raw_template(name, text)
        .map_err(|err| SxnErr::TemplateSyntax {
            name: name.to_string(),
            reason: flatten_tera_error(&err),
        })?;
    Ok(())
}

/// Render `text` against a variable tree. The tree must be a JSON object at
/// the top level.
pub fn render(text: &str, variables: &Value) -> Result<String> {
    let context = Context::from_value(variables.clone()).map_err(|err| {
        SxnErr::TemplateProcessing {
            reason: format!("variables must form a map: {err}"),
        }
    })?;
    Tera::one_off(text, &context, false).map_err(|err| SxnErr::TemplateProcessing {
        reason: flatten_tera_error(&err),
    })
}

/// Names referenced in `{{ ... }}` expressions, dotted paths included.
pub fn extract_variable_names(text: &str) -> BTreeSet<String> {
    let Some(re) = VARIABLE_EXPR.as_ref() else {
        return BTreeSet::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Merge `overlay` into `base`: maps merge key-by-key recursively, anything
/// else is replaced wholesale. Later calls therefore override earlier ones.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Tera nests the useful message in `source()`; fold the chain into one
/// line.
fn flatten_tera_error(err: &tera::Error) -> String {
    use std::error::Error as _;
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
