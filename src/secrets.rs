//! Key Vault secret sync and Databricks PAT bootstrap.

use crate::api::{ApiClient, ControlPlane, Method};
use crate::azure::{AzureCli, DATABRICKS_FIRST_PARTY_APP_ID};
use crate::config::{
    DeployConfig, SECRET_OPENAI_API_BASE, SECRET_OPENAI_API_KEY, SECRET_OPENAI_API_VERSION,
    SECRET_OPENAI_DEPLOYMENT_NAME,
};
use crate::terraform::Terraform;
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

/// OpenAI settings destined for Key Vault; absent fields are skipped.
#[derive(Debug, Default)]
pub struct OpenAiSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_version: Option<String>,
    pub deployment_name: Option<String>,
}

/// Sync the OpenAI settings and the Databricks token into the vault.
pub fn sync_key_vault_secrets(
    az: &AzureCli,
    vault: &str,
    config: &DeployConfig,
    openai: &OpenAiSettings,
    databricks_token: Option<&str>,
) -> Result<()> {
    let entries = [
        (SECRET_OPENAI_API_BASE, openai.endpoint.as_deref()),
        (SECRET_OPENAI_API_KEY, openai.api_key.as_deref()),
        (SECRET_OPENAI_API_VERSION, openai.api_version.as_deref()),
        (
            SECRET_OPENAI_DEPLOYMENT_NAME,
            openai.deployment_name.as_deref(),
        ),
        (config.databricks_pat_secret_name.as_str(), databricks_token),
    ];
    for (name, value) in entries {
        if let Some(value) = value {
            az.set_keyvault_secret(vault, name, value)
                .with_context(|| format!("set Key Vault secret '{name}'"))?;
        }
    }
    Ok(())
}

/// How the serving token should be obtained for this run.
#[derive(Debug, PartialEq, Eq)]
pub enum PatDecision {
    /// An operator-supplied token wins outright.
    UseToken(String),
    /// Auto-creation disabled or the vault already holds a PAT.
    Skip,
    /// Mint a fresh PAT against the workspace API.
    Create,
}

/// Decide the token source. The vault probe is lazy so an environment token
/// or a disabled toggle never touches az.
pub fn plan_pat(
    env_token: Option<String>,
    auto_create: bool,
    secret_exists: impl FnOnce() -> bool,
) -> PatDecision {
    if let Some(token) = env_token {
        if !token.is_empty() {
            return PatDecision::UseToken(token);
        }
    }
    if !auto_create {
        return PatDecision::Skip;
    }
    if secret_exists() {
        return PatDecision::Skip;
    }
    PatDecision::Create
}

/// Create a workspace PAT with the configured lifetime and comment.
pub fn create_databricks_pat(
    api: &dyn ControlPlane,
    lifetime_days: i64,
    comment: &str,
) -> Result<String> {
    let mut payload = json!({ "comment": comment });
    let lifetime_seconds = lifetime_days * 86_400;
    if lifetime_seconds > 0 {
        payload["lifetime_seconds"] = json!(lifetime_seconds);
    }
    let response = api.call(Method::Post, "/api/2.0/token/create", Some(&payload))?;
    response
        .get("token_value")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Databricks token create did not return token_value: {response}"))
}

/// Resolve the Databricks token for Key Vault sync: operator token, skip, or
/// auto-created PAT.
pub fn resolve_databricks_token(
    az: &AzureCli,
    config: &DeployConfig,
    vault: &str,
    databricks_tf: &Terraform,
    workspace_url: Option<String>,
) -> Result<Option<String>> {
    let secret_name = &config.databricks_pat_secret_name;
    let decision = plan_pat(
        std::env::var("DATABRICKS_TOKEN").ok(),
        config.auto_create_databricks_pat,
        || {
            let exists = az.keyvault_secret_exists(vault, secret_name);
            if exists {
                println!("\nKey Vault secret '{secret_name}' already exists; skipping PAT creation.");
            }
            exists
        },
    );
    match decision {
        PatDecision::UseToken(token) => Ok(Some(token)),
        PatDecision::Skip => Ok(None),
        PatDecision::Create => {
            let workspace_url = match workspace_url {
                Some(url) => url,
                None => databricks_tf
                    .output_optional("databricks_workspace_url")
                    .ok_or_else(|| {
                        anyhow!(
                            "Cannot auto-create Databricks PAT because workspace URL is \
                             unavailable. Set DATABRICKS_TOKEN or deploy the Databricks workspace."
                        )
                    })?,
            };
            println!("\nCreating a Databricks PAT for serving...");
            let aad_token = az.access_token(DATABRICKS_FIRST_PARTY_APP_ID)?;
            let api = ApiClient::new(&workspace_url, &aad_token);
            create_databricks_pat(
                &api,
                config.databricks_pat_lifetime_days,
                &config.databricks_pat_comment,
            )
            .context(
                "Failed to auto-create a Databricks PAT. Set DATABRICKS_TOKEN or disable auto \
                 creation with AUTO_CREATE_DATABRICKS_PAT=0.",
            )
            .map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use std::cell::RefCell;

    struct FakeApi {
        response: Value,
        requests: RefCell<Vec<(String, Option<Value>)>>,
    }

    impl ControlPlane for FakeApi {
        fn call(
            &self,
            _method: Method,
            path: &str,
            body: Option<&Value>,
        ) -> Result<Value, ApiError> {
            self.requests
                .borrow_mut()
                .push((path.to_string(), body.cloned()));
            Ok(self.response.clone())
        }
    }

    #[test]
    fn env_token_wins_without_probing_the_vault() {
        let decision = plan_pat(Some("tok123".to_string()), true, || {
            panic!("vault probed despite env token")
        });
        assert_eq!(decision, PatDecision::UseToken("tok123".to_string()));
    }

    #[test]
    fn disabled_toggle_skips_without_probing() {
        let decision = plan_pat(None, false, || panic!("vault probed despite disabled toggle"));
        assert_eq!(decision, PatDecision::Skip);
    }

    #[test]
    fn existing_secret_skips_creation() {
        assert_eq!(plan_pat(None, true, || true), PatDecision::Skip);
        assert_eq!(plan_pat(None, true, || false), PatDecision::Create);
    }

    #[test]
    fn pat_creation_sends_lifetime_and_reads_token_value() {
        let api = FakeApi {
            response: json!({ "token_value": "dapi-new" }),
            requests: RefCell::new(Vec::new()),
        };
        let token = create_databricks_pat(&api, 90, "ragstack serving PAT").unwrap();
        assert_eq!(token, "dapi-new");
        let requests = api.requests.borrow();
        assert_eq!(requests[0].0, "/api/2.0/token/create");
        let body = requests[0].1.as_ref().unwrap();
        assert_eq!(body["comment"], "ragstack serving PAT");
        assert_eq!(body["lifetime_seconds"], 90 * 86_400);
    }

    #[test]
    fn missing_token_value_is_an_error() {
        let api = FakeApi {
            response: json!({ "unexpected": true }),
            requests: RefCell::new(Vec::new()),
        };
        let err = create_databricks_pat(&api, 0, "c").unwrap_err();
        assert!(err.to_string().contains("token_value"));
    }
}
