use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api;
mod azure;
mod cli;
mod config;
mod envfile;
mod process;
mod resolve;
mod secrets;
mod stages;
mod terraform;
mod tfvars;
mod vector_search;

use api::{ApiClient, MANAGEMENT_TOKEN_HEADER, WORKSPACE_RESOURCE_ID_HEADER};
use azure::{AzureCli, DATABRICKS_FIRST_PARTY_APP_ID, MANAGEMENT_RESOURCE};
use cli::{Command, GrantArgs, RootArgs};
use config::DeployConfig;
use stages::Pipeline;
use vector_search::GrantRequest;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = RootArgs::parse();
    if let Err(err) = run(args) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// A failing subprocess propagates its own exit code; everything else is 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(command) = cause.downcast_ref::<process::CommandError>() {
            return command.code;
        }
    }
    1
}

fn run(args: RootArgs) -> Result<()> {
    match args.command {
        Command::Deploy(args) => {
            stages::load_settings(&args.root)?;
            let pipeline = Pipeline::new(args.root, DeployConfig::from_env());
            pipeline.deploy(args.only)
        }
        Command::Destroy(args) => {
            let pipeline = Pipeline::new(args.root, DeployConfig::from_env());
            pipeline.destroy(args.only)
        }
        Command::GrantVectorSearch(args) => cmd_grant(args),
    }
}

fn cmd_grant(args: GrantArgs) -> Result<()> {
    let az = AzureCli::locate()?;
    let token = az.access_token(DATABRICKS_FIRST_PARTY_APP_ID)?;
    let mut api = ApiClient::new(&args.host, &token)
        .with_header(WORKSPACE_RESOURCE_ID_HEADER, &args.workspace_resource_id);
    // The management-plane token is optional; workspace-local calls work
    // without it.
    if let Ok(management_token) = az.access_token(MANAGEMENT_RESOURCE) {
        api = api.with_header(MANAGEMENT_TOKEN_HEADER, &management_token);
    }
    vector_search::grant(
        &api,
        &GrantRequest {
            endpoint_name: &args.endpoint_name,
            service_principal_app_id: &args.service_principal_app_id,
            permission_level: &args.permission_level,
            skip_if_missing: args.skip_if_missing,
        },
    )?;
    Ok(())
}
