//! Deployment configuration.
//!
//! One explicit value constructed at startup and passed into each stage.
//! Defaults mirror the reference architecture; individual fields can be
//! overridden before the pipeline runs. The only environment overrides are
//! the PAT auto-creation toggle and the token itself, read where used.

use crate::envfile::parse_bool_env;

/// Account host for account-scoped Databricks APIs (workspaces, metastores).
pub const ACCOUNT_HOST: &str = "https://accounts.azuredatabricks.net";

/// Key Vault secret names for the synced settings.
pub const SECRET_OPENAI_API_BASE: &str = "openai-api-base";
pub const SECRET_OPENAI_API_KEY: &str = "openai-api-key";
pub const SECRET_OPENAI_API_VERSION: &str = "openai-api-version";
pub const SECRET_OPENAI_DEPLOYMENT_NAME: &str = "openai-deployment-name";

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub resource_group_name_prefix: String,
    pub location: String,
    pub account_name_prefix: String,
    pub sku_name: String,
    pub deployment_name: String,
    pub model_name: String,
    pub model_version: String,
    pub scale_type: String,
    pub deployment_capacity: i64,
    pub openai_api_version: String,
    pub workspace_name_prefix: String,
    pub databricks_sku: String,
    pub key_vault_name_prefix: String,
    pub key_vault_sku_name: String,
    pub secret_scope_name: String,
    pub databricks_pat_secret_name: String,
    pub auto_create_databricks_pat: bool,
    pub databricks_pat_lifetime_days: i64,
    pub databricks_pat_comment: String,
    pub openai_pypi_package: String,
    pub vectorsearch_pypi_package: String,
    pub use_ml_runtime: bool,
    pub storage_account_name_prefix: String,
    pub storage_container_name: String,
    pub storage_is_hns_enabled: bool,
    pub storage_account_tier: String,
    pub storage_account_replication_type: String,
    pub storage_grant_current_principal_access: bool,
    pub access_connector_name_prefix: String,
    pub databricks_account_id: String,
    pub metastore_name_prefix: String,
    pub existing_metastore_id: Option<String>,
    pub storage_credential_name: String,
    pub external_location_name: String,
    pub serving_endpoint_name: String,
    pub serving_model_name: Option<String>,
    pub serving_model_suffix: String,
    pub serving_served_model_name: String,
    pub serving_model_version: Option<String>,
    pub serving_workload_size: String,
    pub serving_scale_to_zero: bool,
    pub serving_traffic_percentage: i64,
    pub seed_data_file: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        DeployConfig {
            resource_group_name_prefix: "rg-dbgenai".into(),
            location: "eastus2".into(),
            account_name_prefix: "aoaidbgenai".into(),
            sku_name: "S0".into(),
            deployment_name: "gpt-5-chat".into(),
            model_name: "gpt-5-chat".into(),
            model_version: "2025-10-03".into(),
            scale_type: "GlobalStandard".into(),
            deployment_capacity: 1,
            openai_api_version: "2024-02-15-preview".into(),
            workspace_name_prefix: "adb-genai".into(),
            databricks_sku: "premium".into(),
            key_vault_name_prefix: "kvdbgenai".into(),
            key_vault_sku_name: "standard".into(),
            secret_scope_name: "aoai-scope".into(),
            databricks_pat_secret_name: "databricks-pat".into(),
            auto_create_databricks_pat: true,
            databricks_pat_lifetime_days: 90,
            databricks_pat_comment: "ragstack serving PAT".into(),
            openai_pypi_package: "openai==1.56.0".into(),
            vectorsearch_pypi_package: "databricks-vectorsearch".into(),
            use_ml_runtime: true,
            storage_account_name_prefix: "stgdbgenai".into(),
            storage_container_name: "rag-data".into(),
            storage_is_hns_enabled: true,
            storage_account_tier: "Standard".into(),
            storage_account_replication_type: "LRS".into(),
            storage_grant_current_principal_access: true,
            access_connector_name_prefix: "dbac-genai".into(),
            databricks_account_id: "24237807-b0da-4ee9-8908-110accb095ca".into(),
            metastore_name_prefix: "uc-metastore".into(),
            existing_metastore_id: None,
            storage_credential_name: "uc-storage-credential".into(),
            external_location_name: "uc-external-location".into(),
            serving_endpoint_name: "rag-model-endpoint".into(),
            serving_model_name: None,
            serving_model_suffix: "rag_model".into(),
            serving_served_model_name: "rag-model".into(),
            serving_model_version: None,
            serving_workload_size: "Small".into(),
            serving_scale_to_zero: true,
            serving_traffic_percentage: 100,
            seed_data_file: "data/diabetes_treatment_faq.csv".into(),
        }
    }
}

impl DeployConfig {
    /// Build the effective config: defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = DeployConfig::default();
        let toggle = std::env::var("DATABRICKS_AUTO_PAT")
            .or_else(|_| std::env::var("AUTO_CREATE_DATABRICKS_PAT"))
            .ok();
        config.auto_create_databricks_pat =
            parse_bool_env(toggle.as_deref(), config.auto_create_databricks_pat);
        config
    }
}
