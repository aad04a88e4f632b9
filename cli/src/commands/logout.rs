//! `imgflow logout` command.

use clap::Args;
use imgflow_core::config::EngineConfig;
use imgflow_runtime::oci::CredentialStore;

use super::login::registry_host;

#[derive(Args)]
pub struct LogoutArgs {
    /// Registry host or an image name on it (default: first search registry)
    pub server: Option<String>,
}

pub async fn execute(
    args: LogoutArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = registry_host(args.server.as_deref(), config);

    if CredentialStore::default_path().remove(&server)? {
        println!("Removed login credentials for {}", server);
    } else {
        println!("Not logged in to {}", server);
    }
    Ok(())
}
