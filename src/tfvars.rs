//! Rendering stage configuration into `terraform.tfvars`.

use anyhow::{Context, Result};
use std::fmt;
use std::path::Path;

/// A single tfvars value. Every declared key is rendered, absent values as
/// `null`, so the stack's variable declarations are always satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum TfValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for TfValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TfValue::Null => write!(f, "null"),
            TfValue::Bool(value) => write!(f, "{value}"),
            TfValue::Int(value) => write!(f, "{value}"),
            TfValue::Str(value) => {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{escaped}\"")
            }
        }
    }
}

impl From<&str> for TfValue {
    fn from(value: &str) -> Self {
        TfValue::Str(value.to_string())
    }
}

impl From<String> for TfValue {
    fn from(value: String) -> Self {
        TfValue::Str(value)
    }
}

impl From<bool> for TfValue {
    fn from(value: bool) -> Self {
        TfValue::Bool(value)
    }
}

impl From<i64> for TfValue {
    fn from(value: i64) -> Self {
        TfValue::Int(value)
    }
}

impl<T: Into<TfValue>> From<Option<T>> for TfValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(TfValue::Null, Into::into)
    }
}

/// Render `key = value` assignments, one per line, in the given order.
pub fn render(items: &[(&str, TfValue)]) -> String {
    let mut out = String::new();
    for (key, value) in items {
        out.push_str(&format!("{key} = {value}\n"));
    }
    out
}

/// Write the rendered assignments to `<stack dir>/terraform.tfvars`.
pub fn write_tfvars(stack_dir: &Path, items: &[(&str, TfValue)]) -> Result<()> {
    let path = stack_dir.join("terraform.tfvars");
    std::fs::write(&path, render(items)).with_context(|| format!("write {}", path.display()))
}
