use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use qualrig::config::{LoggingConfig, QualrigConfig};

#[derive(Parser)]
#[command(
    name = "qualrig",
    about = "Automated qualification testing of network-attached devices",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file (defaults to $QUALRIG_CONFIG, then /etc/qualrig/qualrig.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the controller and test devices as they appear
    Run,

    /// Load and validate the configuration, then print it
    CheckConfig,

    /// Print the resolved host test list
    Tests,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = QualrigConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run => {
            tracing::info!("starting qualification run");
            let code = qualrig::run(&config)?;
            std::process::exit(code);
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration OK");
        }
        Commands::Tests => {
            for test in qualrig::testlist::resolve(&config)? {
                println!("{}", test);
            }
        }
    }

    Ok(())
}
