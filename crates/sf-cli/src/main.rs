use anyhow::Result;
use clap::{Parser, Subcommand};

const CLI_NAME: &str = "sf-cli";

#[derive(Parser)]
#[command(name = "sf", version, about = "Social feed service CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the feed service.
    Feed,
    Migrate,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Store the default feed settings unless a row already exists.
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Feed => {
            let config = sf_feed::load_config()?;
            sf_feed::run(config).await?;
        }
        Commands::Migrate => {
            sf_core::logging::init(CLI_NAME);
            let database_url = sf_core::config::required_env("DATABASE_URL")?;
            let pool = sf_core::db::connect(&database_url, 1).await?;
            sf_core::migrations::run(&pool).await?;
            tracing::info!("migrations applied");
        }
        Commands::Config { command } => {
            sf_core::logging::init(CLI_NAME);
            let database_url = sf_core::config::required_env("DATABASE_URL")?;
            let pool = sf_core::db::connect(&database_url, 1).await?;
            match command {
                ConfigCommand::Seed => {
                    let seeded = sf_core::service_config::seed_service_config(
                        &pool,
                        sf_feed::CONFIG_SERVICE,
                        sf_feed::config::default_config_json(),
                    )
                    .await?;
                    if seeded {
                        tracing::info!(service = sf_feed::CONFIG_SERVICE, "service config seeded");
                    } else {
                        tracing::info!(
                            service = sf_feed::CONFIG_SERVICE,
                            "service config already present"
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_config_seed() {
        let cli = Cli::try_parse_from(["sf", "config", "seed"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommand::Seed
            }
        ));
    }
}
