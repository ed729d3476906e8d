use anyhow::Result;
use clap::{Parser, Subcommand};
use mpctl_transport::ControlConfig;

mod commands;

#[derive(Parser)]
#[command(name = "mpctl")]
#[command(about = "Multipath TCP subflow control", long_about = None)]
struct Cli {
    /// Control configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON log output
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and open additional subflows
    Open {
        /// Server address
        #[arg(short = 'a', long, default_value = "127.0.0.1:8080")]
        connect: String,

        /// Local endpoint of a new subflow (repeatable)
        #[arg(short, long, required = true)]
        local: Vec<String>,

        /// Remote endpoint of the new subflows, defaults to the server address
        #[arg(short, long)]
        remote: Option<String>,

        /// Open the new subflows as backup paths
        #[arg(long)]
        low_priority: bool,

        /// IP_TOS value applied to each new subflow
        #[arg(long)]
        tos: Option<i32>,

        /// Close the new subflows before exiting
        #[arg(long)]
        close: bool,

        /// Use the in-process facility instead of the kernel
        #[arg(long)]
        simulate: bool,
    },

    /// Connect and list the subflows of the connection
    List {
        /// Server address
        #[arg(short = 'a', long, default_value = "127.0.0.1:8080")]
        connect: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Use the in-process facility instead of the kernel
        #[arg(long)]
        simulate: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate default configuration
    Generate {
        /// Output file
        #[arg(short, long, default_value = "mpctl.yaml")]
        output: String,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate
        #[arg(short, long)]
        file: String,
    },

    /// Show current configuration
    Show,
}

fn init_logging(cli: &Cli) {
    if cli.json_logs {
        mpctl_transport::logging::init_prod_logging();
    } else if cli.verbose {
        mpctl_transport::logging::init_dev_logging();
    } else {
        mpctl_transport::logging::init_logging_with_filter("warn");
    }
}

fn load_config(path: Option<&str>) -> Result<ControlConfig> {
    match path {
        Some(path) => Ok(ControlConfig::from_yaml_file(path)?),
        None => Ok(ControlConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Open { connect, local, remote, low_priority, tos, close, simulate } => {
            let config = load_config(cli.config.as_deref())?;
            let request = commands::open::OpenRequest {
                connect,
                locals: local,
                remote,
                low_priority,
                tos,
                close,
                simulate,
            };
            commands::open::run(request, config).await?;
        }
        Commands::List { connect, json, simulate } => {
            let config = load_config(cli.config.as_deref())?;
            commands::list::run(&connect, json, simulate, config).await?;
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Generate { output } => {
                    commands::config::generate(&output)?;
                }
                ConfigAction::Validate { file } => {
                    commands::config::validate(&file)?;
                }
                ConfigAction::Show => {
                    let config = load_config(cli.config.as_deref())?;
                    commands::config::show(&config)?;
                }
            }
        }
    }

    Ok(())
}
