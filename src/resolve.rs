//! Best-effort resolution chains against the Databricks control planes.
//!
//! Each chain tries a priority-ordered list of (endpoint, filter) strategies.
//! "Endpoint not found" and "invalid parameter" responses mean the workspace
//! does not speak that API version, so the chain falls through to the next
//! strategy; any other error is fatal. The first strategy with a non-empty
//! result wins. More than one distinct candidate is never silently picked.

use crate::api::{ApiError, ControlPlane, Method};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("multiple {what} found: {}. {hint}", .candidates.join(", "))]
    Ambiguous {
        what: &'static str,
        candidates: Vec<String>,
        hint: &'static str,
    },
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A resolved value tagged with the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub strategy: &'static str,
}

type Strategy<'a> = (
    &'static str,
    Box<dyn Fn(&dyn ControlPlane) -> Result<Vec<String>, ApiError> + 'a>,
);

/// Drive a chain: skip strategies the workspace does not support, stop at
/// the first non-empty result, surface everything else.
fn run_chain(
    api: &dyn ControlPlane,
    strategies: Vec<Strategy<'_>>,
) -> Result<Option<Resolved<Vec<String>>>, ResolveError> {
    for (strategy, lookup) in strategies {
        match lookup(api) {
            Ok(items) if !items.is_empty() => {
                return Ok(Some(Resolved {
                    value: items,
                    strategy,
                }))
            }
            Ok(_) => continue,
            Err(err) if err.is_endpoint_not_found() || err.is_invalid_parameter() => {
                tracing::debug!(strategy, error = %err, "strategy unsupported, falling through");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Responses come back either as a bare array or wrapped in one of several
/// envelope keys depending on API vintage.
fn array_field(value: &Value, keys: &[&str]) -> Vec<Value> {
    if let Some(items) = value.as_array() {
        return items.clone();
    }
    for key in keys {
        if let Some(items) = value.get(key).and_then(Value::as_array) {
            return items.clone();
        }
    }
    Vec::new()
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key).and_then(Value::as_str).map(str::to_string)
}

fn names_from(response: &Value, envelope: &str, key: &str) -> Vec<String> {
    array_field(response, &[envelope])
        .iter()
        .filter_map(|item| string_field(item, key))
        .collect()
}

fn matches_suffix(name: &str, suffix: &str) -> bool {
    name == suffix || name.ends_with(&format!(".{suffix}"))
}

/// Resolve the registered model name for a serving endpoint from its
/// configured suffix. Strategies, in order: MLflow registered-models search
/// by LIKE pattern, by exact name, a full listing filtered locally, the
/// Unity Catalog model listing (paged), and finally the legacy
/// model-versions search.
pub fn find_registered_model_name(
    api: &dyn ControlPlane,
    suffix: &str,
) -> Result<Option<Resolved<String>>, ResolveError> {
    let search = |filter: String| {
        move |api: &dyn ControlPlane| {
            let response = api.call(
                Method::Post,
                "/api/2.0/mlflow/registered-models/search",
                Some(&json!({ "filter": filter })),
            )?;
            Ok(names_from(&response, "registered_models", "name"))
        }
    };
    let versions_search = |filter: String| {
        move |api: &dyn ControlPlane| {
            let response = api.call(
                Method::Post,
                "/api/2.0/mlflow/model-versions/search",
                Some(&json!({ "filter": filter })),
            )?;
            Ok(names_from(&response, "model_versions", "name"))
        }
    };
    let strategies: Vec<Strategy<'_>> = vec![
        (
            "registered-models search (suffix)",
            Box::new(search(format!("name LIKE '%.{suffix}'"))),
        ),
        (
            "registered-models search (exact)",
            Box::new(search(format!("name = '{suffix}'"))),
        ),
        (
            "registered-models list",
            Box::new(|api: &dyn ControlPlane| {
                let response =
                    api.call(Method::Get, "/api/2.0/mlflow/registered-models/list", None)?;
                Ok(names_from(&response, "registered_models", "name")
                    .into_iter()
                    .filter(|name| matches_suffix(name, suffix))
                    .collect())
            }),
        ),
        (
            "unity-catalog models list",
            Box::new(|api: &dyn ControlPlane| {
                let mut names = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    let path = match &page_token {
                        Some(token) => {
                            format!("/api/2.1/unity-catalog/models?page_token={token}")
                        }
                        None => "/api/2.1/unity-catalog/models".to_string(),
                    };
                    let response = api.call(Method::Get, &path, None)?;
                    for item in array_field(&response, &["registered_models"]) {
                        let name = string_field(&item, "full_name")
                            .or_else(|| string_field(&item, "name"));
                        if let Some(name) = name {
                            if matches_suffix(&name, suffix) {
                                names.push(name);
                            }
                        }
                    }
                    page_token = string_field(&response, "next_page_token");
                    if page_token.is_none() {
                        break;
                    }
                }
                Ok(names)
            }),
        ),
        (
            "model-versions search (exact)",
            Box::new(versions_search(format!("name = '{suffix}'"))),
        ),
        (
            "model-versions search (suffix)",
            Box::new(versions_search(format!("name LIKE '%.{suffix}'"))),
        ),
    ];
    let Some(found) = run_chain(api, strategies)? else {
        return Ok(None);
    };
    let unique: BTreeSet<String> = found.value.into_iter().collect();
    if unique.len() > 1 {
        return Err(ResolveError::Ambiguous {
            what: "registered models",
            candidates: unique.into_iter().collect(),
            hint: "Set serving_model_name explicitly.",
        });
    }
    Ok(unique.into_iter().next().map(|value| Resolved {
        value,
        strategy: found.strategy,
    }))
}

fn numeric_versions(response: &Value) -> Vec<String> {
    array_field(response, &["model_versions"])
        .iter()
        .filter_map(|item| string_field(item, "version"))
        .filter(|version| version.parse::<u64>().is_ok())
        .collect()
}

/// Resolve the latest version of a registered model: the maximum numeric
/// version from the first strategy that yields any. Non-numeric versions are
/// ignored.
pub fn latest_model_version(
    api: &dyn ControlPlane,
    model_name: &str,
) -> Result<Option<Resolved<String>>, ResolveError> {
    let post = |path: &'static str, payload: Value| {
        move |api: &dyn ControlPlane| {
            let response = api.call(Method::Post, path, Some(&payload))?;
            Ok(numeric_versions(&response))
        }
    };
    let filter = json!({ "filter": format!("name='{model_name}'") });
    let strategies: Vec<Strategy<'_>> = vec![
        (
            "get-latest-versions",
            Box::new(post(
                "/api/2.0/mlflow/registered-models/get-latest-versions",
                json!({ "name": model_name }),
            )),
        ),
        (
            "model-versions search",
            Box::new(post("/api/2.0/mlflow/model-versions/search", filter.clone())),
        ),
        (
            "preview model-versions search",
            Box::new(post("/api/2.0/preview/mlflow/model-versions/search", filter)),
        ),
        (
            "unity-catalog model versions",
            Box::new(move |api: &dyn ControlPlane| {
                let path =
                    format!("/api/2.1/unity-catalog/models/{model_name}/versions?max_results=100");
                let response = api.call(Method::Get, &path, None)?;
                Ok(numeric_versions(&response))
            }),
        ),
    ];
    let Some(found) = run_chain(api, strategies)? else {
        return Ok(None);
    };
    let max = found
        .value
        .iter()
        .filter_map(|version| version.parse::<u64>().ok())
        .max();
    Ok(max.map(|max| Resolved {
        value: max.to_string(),
        strategy: found.strategy,
    }))
}

/// Resolve a workspace's numeric id from the account-level listing. A
/// missing workspace is fatal.
pub fn workspace_id(
    api: &dyn ControlPlane,
    account_id: &str,
    workspace_name: &str,
) -> Result<i64, ResolveError> {
    let response = api.call(
        Method::Get,
        &format!("/api/2.0/accounts/{account_id}/workspaces"),
        None,
    )?;
    for workspace in array_field(&response, &["workspaces", "items"]) {
        let name = string_field(&workspace, "workspace_name")
            .or_else(|| string_field(&workspace, "name"));
        if name.as_deref() != Some(workspace_name) {
            continue;
        }
        let id = workspace
            .get("workspace_id")
            .or_else(|| workspace.get("id"))
            .and_then(Value::as_i64);
        if let Some(id) = id {
            return Ok(id);
        }
        break;
    }
    Err(ResolveError::NotFound(format!(
        "Workspace '{workspace_name}' not found in Databricks account {account_id}."
    )))
}

/// Resolve a metastore id from the account listing, filtering by optional
/// name and region (case-insensitive). Zero matches is `None`; more than one
/// is a fatal ambiguity listing every candidate.
pub fn metastore_id(
    api: &dyn ControlPlane,
    account_id: &str,
    name: Option<&str>,
    region: Option<&str>,
) -> Result<Option<String>, ResolveError> {
    let response = api.call(
        Method::Get,
        &format!("/api/2.0/accounts/{account_id}/metastores"),
        None,
    )?;
    let mut matches = array_field(&response, &["metastores", "items"]);
    if let Some(name) = name {
        matches.retain(|ms| string_field(ms, "name").as_deref() == Some(name));
    }
    if let Some(region) = region {
        let region = region.to_lowercase();
        matches.retain(|ms| {
            string_field(ms, "region")
                .unwrap_or_default()
                .to_lowercase()
                == region
        });
    }
    if matches.is_empty() {
        return Ok(None);
    }
    if matches.len() > 1 {
        let candidates = matches
            .iter()
            .map(|ms| {
                format!(
                    "{}:{}",
                    string_field(ms, "name").unwrap_or_default(),
                    string_field(ms, "metastore_id").unwrap_or_default()
                )
            })
            .collect();
        return Err(ResolveError::Ambiguous {
            what: "metastores",
            candidates,
            hint: "Set existing_metastore_id explicitly.",
        });
    }
    Ok(string_field(&matches[0], "metastore_id"))
}

/// Resolve a service principal's SCIM id by application id equality.
pub fn service_principal_id(
    api: &dyn ControlPlane,
    application_id: &str,
) -> Result<Option<String>, ResolveError> {
    let path = format!(
        "/api/2.0/preview/scim/v2/ServicePrincipals?filter=applicationId%20eq%20%27{application_id}%27"
    );
    let response = api.call(Method::Get, &path, None)?;
    for principal in array_field(&response, &["Resources", "resources"]) {
        if string_field(&principal, "applicationId").as_deref() == Some(application_id) {
            return Ok(string_field(&principal, "id"));
        }
    }
    Ok(None)
}
