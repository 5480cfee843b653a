//! Stage descriptors and the pipeline driver.
//!
//! The pipeline is a fixed ordered list of stage descriptors interpreted by
//! a small driver: render tfvars, init, apply (with recovery where a stage
//! is known to conflict with out-of-band resources), read outputs, run
//! post-steps. Stages run strictly one at a time; the first unrecovered
//! failure stops the run with later stages skipped.

use crate::api::{self, ApiClient};
use crate::azure::{AzureCli, DATABRICKS_FIRST_PARTY_APP_ID};
use crate::config::DeployConfig;
use crate::envfile;
use crate::resolve;
use crate::secrets::{self, OpenAiSettings};
use crate::terraform::{
    apply_with_recovery, parse_notebook_conflicts, require_stack_dir,
    workspace_location_from_state, ConflictRule, ImportTarget, Terraform,
};
use crate::tfvars::{write_tfvars, TfValue};
use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageName {
    ResourceGroup,
    OpenaiAccount,
    OpenaiDeployment,
    DatabricksWorkspace,
    KeyVault,
    Storage,
    AccessConnector,
    UnityCatalog,
    Compute,
    Notebooks,
    Serving,
}

/// One unit of provisioning work bound to one terraform working directory.
pub struct StageSpec {
    pub name: StageName,
    pub dir: &'static str,
    pub deps: &'static [StageName],
}

use StageName::*;

/// Deploy order. Serving is deliberately last and excluded from full runs:
/// it consumes a model registered by the provisioned notebooks, which run
/// out-of-band.
pub const STAGES: [StageSpec; 11] = [
    StageSpec {
        name: ResourceGroup,
        dir: "terraform/01_resource_group",
        deps: &[],
    },
    StageSpec {
        name: OpenaiAccount,
        dir: "terraform/02_azure_openai",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: OpenaiDeployment,
        dir: "terraform/03_openai_deployment",
        deps: &[ResourceGroup, OpenaiAccount],
    },
    StageSpec {
        name: DatabricksWorkspace,
        dir: "terraform/04_databricks_workspace",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: KeyVault,
        dir: "terraform/05_key_vault",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: Storage,
        dir: "terraform/09_storage",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: AccessConnector,
        dir: "terraform/10_access_connector",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: UnityCatalog,
        dir: "terraform/11_unity_catalog",
        deps: &[ResourceGroup, DatabricksWorkspace],
    },
    StageSpec {
        name: Compute,
        dir: "terraform/06_databricks_compute",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: Notebooks,
        dir: "terraform/07_notebooks",
        deps: &[ResourceGroup],
    },
    StageSpec {
        name: Serving,
        dir: "terraform/08_serving_endpoint",
        deps: &[ResourceGroup, DatabricksWorkspace],
    },
];

pub fn spec(name: StageName) -> &'static StageSpec {
    STAGES
        .iter()
        .find(|spec| spec.name == name)
        .unwrap_or_else(|| unreachable!("every stage has a descriptor"))
}

pub struct Pipeline {
    root: PathBuf,
    config: DeployConfig,
    /// Settings-file updates accumulated across stages; flushed once per run.
    env_updates: RefCell<Vec<(&'static str, Option<String>)>>,
}

impl Pipeline {
    pub fn new(root: PathBuf, config: DeployConfig) -> Self {
        Pipeline {
            root,
            config,
            env_updates: RefCell::new(Vec::new()),
        }
    }

    fn tf(&self, stage: StageName) -> Terraform {
        Terraform::new(self.root.join(spec(stage).dir))
    }

    fn env_path(&self) -> PathBuf {
        self.root.join(".env")
    }

    fn record_env(&self, key: &'static str, value: Option<String>) {
        self.env_updates.borrow_mut().push((key, value));
    }

    fn flush_env(&self) -> Result<()> {
        let updates = self.env_updates.borrow();
        if updates.is_empty() {
            return Ok(());
        }
        let borrowed: Vec<(&str, Option<&str>)> = updates
            .iter()
            .map(|(key, value)| (*key, value.as_deref()))
            .collect();
        envfile::write_env_file(&self.env_path(), &borrowed)
    }

    /// Run the full pipeline, or exactly one selected stage.
    pub fn deploy(&self, only: Option<StageName>) -> Result<()> {
        match only {
            Some(stage) => self.run_stage(stage)?,
            None => {
                for spec in &STAGES {
                    if spec.name == Serving {
                        continue;
                    }
                    self.run_stage(spec.name)?;
                }
            }
        }
        self.flush_env()
    }

    /// Destroy all stacks in reverse deploy order, or exactly one.
    pub fn destroy(&self, only: Option<StageName>) -> Result<()> {
        let names: Vec<StageName> = match only {
            Some(stage) => vec![stage],
            None => STAGES.iter().rev().map(|spec| spec.name).collect(),
        };
        for name in names {
            let tf = self.tf(name);
            require_stack_dir(tf.dir())?;
            tf.destroy()?;
        }
        Ok(())
    }

    fn run_stage(&self, stage: StageName) -> Result<()> {
        let descriptor = spec(stage);
        require_stack_dir(&self.root.join(descriptor.dir))?;
        for dep in descriptor.deps {
            require_stack_dir(&self.root.join(spec(*dep).dir))
                .with_context(|| format!("stage {stage:?} depends on {dep:?}"))?;
        }
        tracing::info!(stage = ?stage, dir = descriptor.dir, "running stage");
        match stage {
            ResourceGroup => self.stage_resource_group(),
            OpenaiAccount => self.stage_openai_account(),
            OpenaiDeployment => self.stage_openai_deployment(),
            DatabricksWorkspace => self.stage_databricks_workspace(),
            KeyVault => self.stage_key_vault(),
            Storage => self.stage_storage(),
            AccessConnector => self.stage_access_connector(),
            UnityCatalog => self.stage_unity_catalog(),
            Compute => self.stage_compute(),
            Notebooks => self.stage_notebooks(),
            Serving => self.stage_serving(),
        }
    }

    /// Read the resource group name produced by the first stage.
    fn resource_group_name(&self) -> Result<String> {
        let tf = self.tf(ResourceGroup);
        tf.init()?;
        Ok(tf.output("resource_group_name")?)
    }

    fn stage_resource_group(&self) -> Result<()> {
        let config = &self.config;
        let tf = self.tf(ResourceGroup);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", TfValue::Null),
                (
                    "resource_group_name_prefix",
                    config.resource_group_name_prefix.as_str().into(),
                ),
                ("location", config.location.as_str().into()),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        Ok(())
    }

    fn stage_openai_account(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(OpenaiAccount);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("location", config.location.as_str().into()),
                (
                    "account_name_prefix",
                    config.account_name_prefix.as_str().into(),
                ),
                ("sku_name", config.sku_name.as_str().into()),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        let endpoint = tf.output("openai_endpoint")?;
        let api_key = tf.output_or_apply("openai_primary_key")?;
        self.record_openai_env(&endpoint, &api_key);
        Ok(())
    }

    fn stage_openai_deployment(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let openai = self.tf(OpenaiAccount);
        openai.init()?;
        let account_name = openai.output("openai_account_name")?;
        let account_id = openai.output("openai_account_id")?;
        let endpoint = openai.output("openai_endpoint")?;
        let api_key = openai.output_or_apply("openai_primary_key")?;
        let tf = self.tf(OpenaiDeployment);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("account_name", account_name.as_str().into()),
                ("deployment_name", config.deployment_name.as_str().into()),
                ("model_name", config.model_name.as_str().into()),
                ("model_version", config.model_version.as_str().into()),
                ("scale_type", config.scale_type.as_str().into()),
                ("deployment_capacity", config.deployment_capacity.into()),
            ],
        )?;
        tf.init()?;
        // A model deployment created out-of-band conflicts with the apply;
        // adopt it by its constructed resource id.
        let deployment_id = format!("{account_id}/deployments/{}", config.deployment_name);
        let targets = move |_: &str| {
            vec![ImportTarget {
                address: "azurerm_cognitive_deployment.main".to_string(),
                id: deployment_id.clone(),
            }]
        };
        apply_with_recovery(
            &tf,
            &[ConflictRule {
                needle: "already exists",
                kind: Some("azurerm_cognitive_deployment"),
                targets: &targets,
            }],
        )?;
        self.record_openai_env(&endpoint, &api_key);
        Ok(())
    }

    fn record_openai_env(&self, endpoint: &str, api_key: &str) {
        let config = &self.config;
        self.record_env("OPENAI_API_BASE", Some(endpoint.to_string()));
        self.record_env("OPENAI_API_KEY", Some(api_key.to_string()));
        self.record_env(
            "OPENAI_API_VERSION",
            Some(config.openai_api_version.clone()),
        );
        self.record_env(
            "OPENAI_DEPLOYMENT_NAME",
            Some(config.deployment_name.clone()),
        );
    }

    fn stage_databricks_workspace(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(DatabricksWorkspace);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("location", config.location.as_str().into()),
                (
                    "workspace_name_prefix",
                    config.workspace_name_prefix.as_str().into(),
                ),
                ("sku", config.databricks_sku.as_str().into()),
                ("managed_resource_group_name", TfValue::Null),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        let workspace_url = tf.output("databricks_workspace_url")?;
        self.record_env(
            "DATABRICKS_WORKSPACE_URL",
            Some(api::normalize_host(&workspace_url)),
        );
        Ok(())
    }

    fn stage_key_vault(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(KeyVault);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("location", config.location.as_str().into()),
                (
                    "key_vault_name_prefix",
                    config.key_vault_name_prefix.as_str().into(),
                ),
                ("sku_name", config.key_vault_sku_name.as_str().into()),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        let vault = tf.output("key_vault_name")?;
        let az = AzureCli::locate()?;
        az.grant_keyvault_read(&vault, DATABRICKS_FIRST_PARTY_APP_ID)?;
        let openai = self.tf(OpenaiAccount);
        let endpoint = openai.output_optional("openai_endpoint");
        let api_key = openai.output_optional("openai_primary_key");
        let have_openai = endpoint.is_some() && api_key.is_some();
        let openai_settings = OpenAiSettings {
            endpoint,
            api_key,
            api_version: have_openai.then(|| config.openai_api_version.clone()),
            deployment_name: have_openai.then(|| config.deployment_name.clone()),
        };
        let token = secrets::resolve_databricks_token(
            &az,
            config,
            &vault,
            &self.tf(DatabricksWorkspace),
            None,
        )?;
        secrets::sync_key_vault_secrets(&az, &vault, config, &openai_settings, token.as_deref())?;
        Ok(())
    }

    fn stage_storage(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(Storage);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("location", config.location.as_str().into()),
                ("storage_account_name", TfValue::Null),
                (
                    "storage_account_name_prefix",
                    config.storage_account_name_prefix.as_str().into(),
                ),
                (
                    "container_name",
                    config.storage_container_name.as_str().into(),
                ),
                ("is_hns_enabled", config.storage_is_hns_enabled.into()),
                ("account_tier", config.storage_account_tier.as_str().into()),
                (
                    "account_replication_type",
                    config.storage_account_replication_type.as_str().into(),
                ),
                (
                    "grant_current_principal_access",
                    config.storage_grant_current_principal_access.into(),
                ),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        self.upload_seed_data(&tf)
    }

    fn upload_seed_data(&self, storage: &Terraform) -> Result<()> {
        let data_file = self.root.join(&self.config.seed_data_file);
        if !data_file.exists() {
            println!("\nNo seed data found at {}, skipping upload.", data_file.display());
            return Ok(());
        }
        let az = AzureCli::locate()?;
        let storage_account = storage.output("storage_account_name")?;
        let container = storage.output("storage_container_name")?;
        az.upload_blob(&storage_account, &container, &data_file)?;
        Ok(())
    }

    fn stage_access_connector(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(AccessConnector);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                ("location", config.location.as_str().into()),
                ("access_connector_name", TfValue::Null),
                (
                    "access_connector_name_prefix",
                    config.access_connector_name_prefix.as_str().into(),
                ),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        Ok(())
    }

    fn stage_unity_catalog(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let databricks = self.tf(DatabricksWorkspace);
        databricks.init()?;
        let workspace_name = databricks.output("databricks_workspace_name")?;
        let az = AzureCli::locate()?;
        let aad_token = az.access_token(DATABRICKS_FIRST_PARTY_APP_ID)?;
        let account_api = ApiClient::new(crate::config::ACCOUNT_HOST, &aad_token);
        let workspace_id =
            resolve::workspace_id(&account_api, &config.databricks_account_id, &workspace_name)?;
        let workspace_location = workspace_location_from_state(databricks.dir())
            .unwrap_or_else(|| config.location.clone());
        let metastore_id = match &config.existing_metastore_id {
            Some(id) => Some(id.clone()),
            None => resolve::metastore_id(
                &account_api,
                &config.databricks_account_id,
                None,
                Some(&workspace_location),
            )?,
        };
        let tf = self.tf(UnityCatalog);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                (
                    "databricks_account_id",
                    config.databricks_account_id.as_str().into(),
                ),
                ("workspace_id", workspace_id.into()),
                ("metastore_name", TfValue::Null),
                ("existing_metastore_id", metastore_id.clone().into()),
                (
                    "metastore_name_prefix",
                    config.metastore_name_prefix.as_str().into(),
                ),
                ("metastore_region", TfValue::Null),
                ("metastore_storage_root", TfValue::Null),
                ("default_catalog_name", "main".into()),
                ("metastore_data_access_name", "metastore-access".into()),
                (
                    "storage_credential_name",
                    config.storage_credential_name.as_str().into(),
                ),
                (
                    "external_location_name",
                    config.external_location_name.as_str().into(),
                ),
                ("external_location_url", TfValue::Null),
            ],
        )?;
        tf.init()?;
        // A metastore created by a previous account-level run conflicts with
        // this apply; adopt it by id, looking the id up when the account API
        // can still see it.
        let account_id = config.databricks_account_id.clone();
        let region = workspace_location.clone();
        let targets = move |_: &str| {
            match resolve::metastore_id(&account_api, &account_id, None, Some(&region)) {
                Ok(Some(id)) => vec![ImportTarget {
                    address: "databricks_metastore.this[0]".to_string(),
                    id,
                }],
                _ => Vec::new(),
            }
        };
        apply_with_recovery(
            &tf,
            &[ConflictRule {
                needle: "already exists in this account",
                kind: None,
                targets: &targets,
            }],
        )?;
        Ok(())
    }

    fn stage_compute(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(Compute);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                (
                    "secret_scope_name",
                    config.secret_scope_name.as_str().into(),
                ),
                (
                    "openai_pypi_package",
                    config.openai_pypi_package.as_str().into(),
                ),
                (
                    "vectorsearch_pypi_package",
                    config.vectorsearch_pypi_package.as_str().into(),
                ),
                ("use_ml_runtime", config.use_ml_runtime.into()),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        Ok(())
    }

    fn stage_notebooks(&self) -> Result<()> {
        let rg_name = self.resource_group_name()?;
        let tf = self.tf(Notebooks);
        write_tfvars(tf.dir(), &[("resource_group_name", rg_name.as_str().into())])?;
        tf.init()?;
        // Several notebooks may conflict in one apply; each reports its own
        // workspace path, which doubles as the import id.
        apply_with_recovery(
            &tf,
            &[ConflictRule {
                needle: "already exists",
                kind: Some("databricks_notebook"),
                targets: &parse_notebook_conflicts,
            }],
        )?;
        Ok(())
    }

    fn stage_serving(&self) -> Result<()> {
        let config = &self.config;
        let rg_name = self.resource_group_name()?;
        let az = AzureCli::locate()?;
        let databricks = self.tf(DatabricksWorkspace);
        databricks.init()?;
        let workspace_url = databricks.output("databricks_workspace_url")?;
        let aad_token = az.access_token(DATABRICKS_FIRST_PARTY_APP_ID)?;
        let workspace_api = ApiClient::new(&workspace_url, &aad_token);
        let model_name = match &config.serving_model_name {
            Some(name) => name.clone(),
            None => resolve::find_registered_model_name(&workspace_api, &config.serving_model_suffix)?
                .map(|resolved| {
                    tracing::info!(
                        model = %resolved.value,
                        strategy = resolved.strategy,
                        "resolved registered model"
                    );
                    resolved.value
                })
                .ok_or_else(|| {
                    anyhow!(
                        "Could not find any model versions for '*.{suffix}' or '{suffix}'. \
                         Register the model in MLflow before deploying the serving endpoint \
                         or set serving_model_name.",
                        suffix = config.serving_model_suffix
                    )
                })?,
        };
        let model_version = match &config.serving_model_version {
            Some(version) => version.clone(),
            None => resolve::latest_model_version(&workspace_api, &model_name)?
                .map(|resolved| resolved.value)
                .ok_or_else(|| {
                    anyhow!(
                        "Could not find any model versions for '{model_name}'. Register the \
                         model in MLflow before deploying the serving endpoint."
                    )
                })?,
        };
        let tf = self.tf(Serving);
        write_tfvars(
            tf.dir(),
            &[
                ("resource_group_name", rg_name.as_str().into()),
                (
                    "endpoint_name",
                    config.serving_endpoint_name.as_str().into(),
                ),
                (
                    "served_model_name",
                    config.serving_served_model_name.as_str().into(),
                ),
                ("model_name", model_name.as_str().into()),
                ("model_version", model_version.as_str().into()),
                (
                    "secret_scope_name",
                    config.secret_scope_name.as_str().into(),
                ),
                (
                    "databricks_pat_secret_name",
                    config.databricks_pat_secret_name.as_str().into(),
                ),
                (
                    "workload_size",
                    config.serving_workload_size.as_str().into(),
                ),
                (
                    "scale_to_zero_enabled",
                    config.serving_scale_to_zero.into(),
                ),
                (
                    "traffic_percentage",
                    config.serving_traffic_percentage.into(),
                ),
            ],
        )?;
        tf.init()?;
        tf.apply()?;
        Ok(())
    }
}

/// Load the settings file into the process environment; missing file is fine.
pub fn load_settings(root: &Path) -> Result<()> {
    envfile::load_into_process_env(&root.join(".env"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_has_a_descriptor_and_declared_deps_precede_it() {
        for (index, spec) in STAGES.iter().enumerate() {
            for dep in spec.deps {
                let dep_index = STAGES
                    .iter()
                    .position(|candidate| candidate.name == *dep)
                    .expect("dep is a known stage");
                assert!(
                    dep_index < index,
                    "{:?} depends on later stage {:?}",
                    spec.name,
                    dep
                );
            }
        }
    }

    #[test]
    fn destroy_order_is_reverse_of_deploy_order() {
        let reversed: Vec<StageName> = STAGES.iter().rev().map(|spec| spec.name).collect();
        assert_eq!(reversed.first(), Some(&Serving));
        assert_eq!(reversed.last(), Some(&ResourceGroup));
    }

    #[test]
    fn missing_stack_dir_is_a_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(dir.path().to_path_buf(), DeployConfig::default());
        let err = pipeline.deploy(Some(ResourceGroup)).unwrap_err();
        assert!(err.to_string().contains("missing Terraform dir"));
    }
}
