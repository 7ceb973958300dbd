use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use swarmd::config::Config;
use swarmd::node::Node;

#[derive(Parser, Debug)]
#[command(name = "swarmd")]
#[command(about = "P2P resilience daemon for a decentralized trading network", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Print hostname at startup BEFORE any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!(
                "swarmd {} ({} {}) on {}",
                env!("CARGO_PKG_VERSION"),
                env!("GIT_HASH"),
                env!("BUILD_DATE"),
                short_name
            );
        }
    }

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(()) => {
                println!("Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}; using defaults", e);
            Config::default()
        }
    };
    if let Some(listen_addr) = args.listen_addr {
        config.network.listen_address = listen_addr;
    }

    init_tracing(&config, args.verbose);

    let node = match Node::build(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to build node: {}", e);
            std::process::exit(1);
        }
    };

    // The trading engine registers its monitored streams through
    // Node::register_monitor once it has parsed its application state.

    if let Err(e) = node.start().await {
        tracing::error!("Failed to start node: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    node.shutdown().await;
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.log_to_file {
        let log_dir = config.node.resolved_data_dir().join("logs");
        let appender = tracing_appender::rolling::daily(log_dir, "swarmd.log");
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(appender))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
