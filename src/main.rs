use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;

use dynamics_connection::SecretVault;
use dynamics_connection::config::Config;

#[derive(Parser)]
#[command(name = "dynamics-connection", about = "Inspect saved Dynamics 365 connection profiles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved profiles
    Profiles,
    /// Show a saved profile with its masked connection string
    Show { name: String },
    /// Encrypt a secret with the configured key material
    Encrypt { plaintext: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_default_env().init();

    let config = Config::load()?;
    let cli = Cli::parse();
    info!("Starting dynamics-connection");

    match cli.command {
        Commands::Profiles => {
            if config.profiles.is_empty() {
                println!("No saved profiles.");
            }
            let mut names: Vec<_> = config.profiles.keys().collect();
            names.sort();
            for name in names {
                println!("{name}");
            }
        }
        Commands::Show { name } => {
            let profile = config
                .get_profile(&name)
                .with_context(|| format!("Profile '{name}' not found"))?;
            println!("{}", profile.to_connection_string());
            if let Some(version) = &profile.organization_version {
                println!("Organization version: {version}");
            }
            if let Some(organization) = &profile.organization {
                println!("Organization: {organization}");
            }
        }
        Commands::Encrypt { plaintext } => {
            if config.crypto.passphrase.is_empty() {
                bail!("No vault passphrase configured; set [crypto] in the config file first");
            }
            let vault = SecretVault::new(config.crypto.clone());
            println!("{}", vault.encrypt(&plaintext)?);
        }
    }

    Ok(())
}
