//! Settings file (`.env`) reading and write-back.
//!
//! The file is plain `KEY=VALUE` lines. A fixed subset of keys is written
//! first in a stable order so diffs stay readable; everything else is
//! appended sorted.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Keys written first, in this order, when the file is rewritten.
pub const PREFERRED_KEYS: [&str; 6] = [
    "OPENAI_API_BASE",
    "OPENAI_API_KEY",
    "OPENAI_API_VERSION",
    "OPENAI_DEPLOYMENT_NAME",
    "DATABRICKS_WORKSPACE_URL",
    "DATABRICKS_TOKEN",
];

/// Parse a settings file into a key/value map.
///
/// Blank lines and `#` comments are ignored. Values containing `=` keep
/// everything after the first split.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    if !path.exists() {
        return Ok(values);
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(key.to_string(), value.to_string());
    }
    Ok(values)
}

/// Load the settings file into the process environment without clobbering
/// variables that are already set.
pub fn load_into_process_env(path: &Path) -> Result<()> {
    for (key, value) in read_env_file(path)? {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

/// Merge `updates` into the settings file and rewrite it.
///
/// `None` values leave any existing entry untouched. The file is written at
/// most once per run; nothing is written when the merged map is empty.
pub fn write_env_file(path: &Path, updates: &[(&str, Option<&str>)]) -> Result<()> {
    let mut values = read_env_file(path)?;
    for (key, value) in updates {
        if let Some(value) = value {
            values.insert((*key).to_string(), (*value).to_string());
        }
    }
    if values.is_empty() {
        return Ok(());
    }
    let mut lines = Vec::new();
    for key in PREFERRED_KEYS {
        if let Some(value) = values.get(key) {
            lines.push(format!("{key}={value}"));
        }
    }
    for (key, value) in &values {
        if PREFERRED_KEYS.contains(&key.as_str()) {
            continue;
        }
        lines.push(format!("{key}={value}"));
    }
    let body = lines.join("\n") + "\n";
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Parse a boolean environment override; unrecognized values keep the default.
pub fn parse_bool_env(value: Option<&str>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_skips_comments_and_splits_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# header\n\nA=1\nB=x=y\nnoequals\n").unwrap();
        let values = read_env_file(&path).unwrap();
        assert_eq!(values.get("A").map(String::as_str), Some("1"));
        assert_eq!(values.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let values = read_env_file(&dir.path().join("absent")).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn write_orders_preferred_keys_then_sorted_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "ZZZ=last\nDATABRICKS_TOKEN=tok\n").unwrap();
        write_env_file(
            &path,
            &[
                ("OPENAI_API_KEY", Some("key")),
                ("OPENAI_API_BASE", Some("base")),
                ("AAA", Some("first")),
            ],
        )
        .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "OPENAI_API_BASE=base",
                "OPENAI_API_KEY=key",
                "DATABRICKS_TOKEN=tok",
                "AAA=first",
                "ZZZ=last",
            ]
        );
    }

    #[test]
    fn none_updates_do_not_touch_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "DATABRICKS_TOKEN=keepme\n").unwrap();
        write_env_file(&path, &[("DATABRICKS_TOKEN", None)]).unwrap();
        let values = read_env_file(&path).unwrap();
        assert_eq!(
            values.get("DATABRICKS_TOKEN").map(String::as_str),
            Some("keepme")
        );
    }

    #[test]
    fn bool_env_parsing() {
        assert!(parse_bool_env(Some("Yes"), false));
        assert!(parse_bool_env(Some("1"), false));
        assert!(!parse_bool_env(Some("off"), true));
        assert!(!parse_bool_env(Some("0"), true));
        assert!(parse_bool_env(Some("maybe"), true));
        assert!(!parse_bool_env(None, false));
    }
}
