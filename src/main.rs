use anyhow::Context;
use mongo_data_api::auth::AuthGate;
use mongo_data_api::config::{DEFAULT_CONFIG_FILE, DEFAULT_ENV_FILE};
use mongo_data_api::observability::{init_logging, LogConfig};
use mongo_data_api::{Config, Server, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const LOGO: &str = r#"
  ___       _          _   ___ ___
 |   \ __ _| |_ __ _  /_\ | _ \_ _|
 | |) / _` |  _/ _` |/ _ \|  _/| |
 |___/\__,_|\__\__,_/_/ \_\_| |___|
"#;

/// Command line arguments structure
struct CliArgs {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!("{}", LOGO);
    println!("mongo-data-api v{} - self-hosted MongoDB Data API", VERSION);
    println!();
    println!("USAGE:");
    println!("    mongo-data-api [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!(
        "    -c, --config <FILE>    Configuration file, .yaml/.yml or .toml (default: {})",
        DEFAULT_CONFIG_FILE
    );
    println!("    -H, --host <HOST>      Bind address (default: 0.0.0.0)");
    println!("    -p, --port <PORT>      Bind port (default: 3000)");
    println!("    -h, --help             Print help information");
    println!("    -v, --version          Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("    READ_ONLY_KEY          Secret granting read access");
    println!("    READ_WRITE_KEY         Secret granting read and write access");
    println!("    MONGO_URI_<NAME>       Connection string for cluster <name>");
    println!("    PORT                   Bind port");
    println!("    RUST_LOG               Log filter, overrides logging.level");
    println!();
    println!("    Variables may also be set in a .env file in the working directory.");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    server:");
    println!("      host: 0.0.0.0");
    println!("      port: 3000");
    println!("    logging:");
    println!("      level: info          # trace, debug, info, warn, error");
    println!("      format: text         # or json");
    println!("      slow_action_ms: 1000");
    println!("    mongoClusters:");
    println!("      main: mongodb://localhost:27017");
    println!("      scratch: memory://scratch");
    println!("    readOnly: <secret>");
    println!("    readWrite: <secret>");
}

fn print_version() {
    println!("mongo-data-api {}", VERSION);
}

/// Parse command line arguments
fn parse_args() -> anyhow::Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        host: None,
        port: None,
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                cli.show_help = true;
                return Ok(cli);
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return Ok(cli);
            }
            flag @ ("-c" | "--config") => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a file path argument", flag))?;
                cli.config_path = Some(PathBuf::from(value));
                i += 1;
            }
            flag @ ("-H" | "--host") => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a host argument", flag))?;
                cli.host = Some(value.clone());
                i += 1;
            }
            flag @ ("-p" | "--port") => {
                let value = args
                    .get(i + 1)
                    .with_context(|| format!("{} requires a port argument", flag))?;
                let port = value
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port number '{}'", value))?;
                cli.port = Some(port);
                i += 1;
            }
            arg => anyhow::bail!("Unknown option '{}'. Use --help for usage.", arg),
        }
        i += 1;
    }

    Ok(cli)
}

/// File, then .env, then process environment, then command line
fn load_config(cli: &CliArgs) -> anyhow::Result<Config> {
    let env_file = Path::new(DEFAULT_ENV_FILE);
    let file_vars = if env_file.exists() {
        Config::read_env_file(env_file)?
    } else {
        Vec::new()
    };
    let mut config = Config::load(cli.config_path.as_deref())?
        .with_env(file_vars)?
        .with_env(std::env::vars())?;

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args()?;
    if cli.show_help {
        print_help();
        return Ok(());
    }
    if cli.show_version {
        print_version();
        return Ok(());
    }

    let config = Arc::new(load_config(&cli).context("Failed to load configuration")?);
    init_logging(&LogConfig::from_config(&config.logging));

    println!("{}", LOGO);
    println!("mongo-data-api v{}", VERSION);
    println!();

    if Path::new(DEFAULT_ENV_FILE).exists() {
        info!(path = DEFAULT_ENV_FILE, "Loaded environment file");
    }
    if !AuthGate::from_config(&config).has_write_key() {
        warn!("No readWrite key configured, write actions will be rejected");
    }
    info!(clusters = ?config.cluster_names(), "Configured clusters");

    let server = Server::new(config);
    server.run().await.context("Server error")?;
    Ok(())
}
