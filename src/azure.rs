//! Azure CLI adapter: AAD tokens, Key Vault operations, seed-data upload.
//!
//! The az binary is the only supported path for token acquisition, so its
//! absence is a precondition failure reported before any network call.

use crate::process::{self, CommandError};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

/// First-party application id of the Azure Databricks resource provider;
/// AAD tokens scoped to it authenticate against workspace and account APIs.
pub const DATABRICKS_FIRST_PARTY_APP_ID: &str = "2ff814a6-3304-4ab8-85cb-cd0e6f879c1d";
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

// Installer locations probed when az is not on PATH.
const FALLBACK_PATHS: [&str; 2] = [
    r"C:\Program Files (x86)\Microsoft SDKs\Azure\CLI2\wbin\az.cmd",
    r"C:\Program Files\Microsoft SDKs\Azure\CLI2\wbin\az.cmd",
];

pub struct AzureCli {
    bin: PathBuf,
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_string()).collect()
}

impl AzureCli {
    pub fn locate() -> Result<Self> {
        if let Ok(bin) = which::which("az") {
            return Ok(AzureCli { bin });
        }
        for path in FALLBACK_PATHS {
            let candidate = Path::new(path);
            if candidate.exists() {
                return Ok(AzureCli {
                    bin: candidate.to_path_buf(),
                });
            }
        }
        Err(anyhow!(
            "Azure CLI not found. Install Azure CLI or ensure az is on PATH."
        ))
    }

    /// Acquire an AAD access token for the given resource. The token itself
    /// is returned on stdout and never echoed.
    pub fn access_token(&self, resource: &str) -> Result<String, CommandError> {
        process::run_capture(
            &self.bin,
            &args(&[
                "account",
                "get-access-token",
                "--resource",
                resource,
                "--query",
                "accessToken",
                "-o",
                "tsv",
            ]),
        )
    }

    /// Probe whether a Key Vault secret exists; lookup failure means absent.
    pub fn keyvault_secret_exists(&self, vault: &str, name: &str) -> bool {
        process::run_capture(
            &self.bin,
            &args(&[
                "keyvault", "secret", "show", "--vault-name", vault, "--name", name, "--query",
                "id", "-o", "tsv",
            ]),
        )
        .map(|output| !output.is_empty())
        .unwrap_or(false)
    }

    /// Set a Key Vault secret. The value is the final argv entry and is
    /// redacted from the echoed command.
    pub fn set_keyvault_secret(
        &self,
        vault: &str,
        name: &str,
        value: &str,
    ) -> Result<(), CommandError> {
        let argv = args(&[
            "keyvault", "secret", "set", "--vault-name", vault, "--name", name, "--value", value,
        ]);
        let redacted = [argv.len() - 1];
        process::run_redacted(&self.bin, &argv, &redacted)
    }

    /// Grant get/list secret permissions on the vault to a service principal
    /// (used for the Databricks first-party application).
    pub fn grant_keyvault_read(&self, vault: &str, sp_app_id: &str) -> Result<(), CommandError> {
        process::run(
            &self.bin,
            &args(&[
                "keyvault",
                "set-policy",
                "--name",
                vault,
                "--spn",
                sp_app_id,
                "--secret-permissions",
                "get",
                "list",
            ]),
        )
    }

    /// Upload a file verbatim to a storage container under the caller's AAD
    /// identity, overwriting any previous blob of the same name.
    pub fn upload_blob(
        &self,
        storage_account: &str,
        container: &str,
        file: &Path,
    ) -> Result<(), CommandError> {
        let name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        process::run(
            &self.bin,
            &args(&[
                "storage",
                "blob",
                "upload",
                "--account-name",
                storage_account,
                "--container-name",
                container,
                "--file",
                &file.display().to_string(),
                "--name",
                &name,
                "--auth-mode",
                "login",
                "--overwrite",
                "true",
            ]),
        )
    }
}
