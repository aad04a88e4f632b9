//! `imgflow login` command.

use std::io::BufRead;

use clap::Args;
use imgflow_core::config::EngineConfig;
use imgflow_runtime::oci::{CredentialStore, ImageReference};

#[derive(Args)]
pub struct LoginArgs {
    /// Registry host or an image name on it (default: first search registry)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long, conflicts_with = "password_stdin")]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

/// Registry host credentials for `server` are kept under.
///
/// Without a server, the first unqualified-search registry of `config` is
/// used, so `imgflow login` targets the registry short names resolve to.
pub(crate) fn registry_host(server: Option<&str>, config: &EngineConfig) -> String {
    let server = match server {
        Some(server) => server.trim_start_matches("docker://"),
        None => {
            return config
                .registries
                .unqualified_search_registries
                .first()
                .cloned()
                .unwrap_or_else(|| "docker.io".to_string())
        }
    };
    if server.contains('/') {
        if let Ok(reference) = ImageReference::parse(server) {
            return reference.registry;
        }
    }
    server.trim_end_matches('/').to_string()
}

fn prompt(label: &str) -> std::io::Result<String> {
    if !label.is_empty() {
        eprint!("{label}");
    }
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub async fn execute(
    args: LoginArgs,
    config: &EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = registry_host(args.server.as_deref(), config);

    let username = match args.username {
        Some(u) => u,
        None => prompt("Username: ")?,
    };
    let password = match args.password {
        Some(p) => p,
        None if args.password_stdin => prompt("")?,
        None => prompt("Password: ")?,
    };
    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    CredentialStore::default_path().store(&server, &username, &password)?;
    tracing::debug!(registry = %server, username = %username, "Stored registry credentials");
    println!("Login Succeeded for {}", server);
    Ok(())
}
