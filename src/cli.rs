//! CLI argument parsing for the deployment pipeline.
//!
//! The CLI is intentionally thin: it selects a pipeline (deploy/destroy) or
//! the standalone permission grant, without embedding any stage logic.

use crate::stages::StageName;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragstack",
    version,
    about = "Terraform stack orchestrator for an Azure Databricks RAG architecture",
    after_help = "Examples:\n  ragstack deploy\n  ragstack deploy --only key-vault\n  ragstack destroy --only serving\n  ragstack grant-vector-search --host https://adb-1.azuredatabricks.net \\\n    --endpoint-name rag-vs --service-principal-app-id <appId> \\\n    --workspace-resource-id /subscriptions/.../workspaces/adb-genai",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Deploy(DeployArgs),
    Destroy(DestroyArgs),
    GrantVectorSearch(GrantArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Deploy all Terraform stacks in order, or exactly one")]
pub struct DeployArgs {
    /// Run only this stage instead of the full pipeline
    #[arg(long, value_enum, value_name = "STAGE")]
    pub only: Option<StageName>,

    /// Repository root containing terraform/ and the .env settings file
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Destroy all Terraform stacks in reverse order, or exactly one")]
pub struct DestroyArgs {
    /// Destroy only this stage's stack
    #[arg(long, value_enum, value_name = "STAGE")]
    pub only: Option<StageName>,

    /// Repository root containing terraform/
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,
}

#[derive(Parser, Debug)]
#[command(about = "Grant Vector Search endpoint permissions to a service principal")]
pub struct GrantArgs {
    /// Databricks workspace host (https://...)
    #[arg(long)]
    pub host: String,

    /// Vector Search endpoint name
    #[arg(long)]
    pub endpoint_name: String,

    /// Service principal application (client) ID
    #[arg(long)]
    pub service_principal_app_id: String,

    /// Azure Databricks workspace resource ID
    #[arg(long)]
    pub workspace_resource_id: String,

    /// Permission level to grant
    #[arg(long, default_value = "CAN_MANAGE")]
    pub permission_level: String,

    /// Treat a missing endpoint as a no-op instead of an error
    #[arg(long)]
    pub skip_if_missing: bool,
}
