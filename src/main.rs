//! tablekeep node
//!
//! Starts a node on the in-memory engine with the configured replication
//! role and runs the expiry sweeper until Ctrl+C.

use std::sync::Arc;
use std::time::Duration;
use tablekeep::replication::{NodeState, ReplicationRole};
use tablekeep::storage::{Expiry, ExpiryConfig, ExpirySweeper, MemoryEngine, RouterConfig, TableRouter};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Node configuration
struct Config {
    /// Replication role at startup
    role: ReplicationRole,
    /// Originator id stamped on schedule entries
    originator: u32,
    /// Sweep interval in milliseconds
    tick_ms: u64,
    /// Due entries retired per sweep
    batch: usize,
    /// Default log filter when RUST_LOG is unset
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: ReplicationRole::Master,
            originator: 0,
            tick_ms: 1000,
            batch: 1,
            log_level: "info".to_string(),
        }
    }
}

/// Returns the value following a flag, or exits.
fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

/// Parses a flag value, or exits.
fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, what: &str) -> T {
    value_of(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid {}", what);
        std::process::exit(1);
    })
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--role" | "-r" => {
                    config.role = parse_value(&args, i, "role (expected master or client)");
                    i += 2;
                }
                "--originator" | "-o" => {
                    config.originator = parse_value(&args, i, "originator id");
                    i += 2;
                }
                "--tick-ms" | "-t" => {
                    config.tick_ms = parse_value(&args, i, "tick interval");
                    i += 2;
                }
                "--batch" | "-b" => {
                    config.batch = parse_value(&args, i, "batch size");
                    i += 2;
                }
                "--log-level" | "-l" => {
                    config.log_level = value_of(&args, i).to_string();
                    i += 2;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("tablekeep version {}", tablekeep::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn expiry_config(&self) -> ExpiryConfig {
        ExpiryConfig {
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            batch_size: self.batch.max(1),
            ..Default::default()
        }
    }
}

fn print_help() {
    println!(
        r#"
tablekeep - Table routing and TTL expiry node

USAGE:
    tablekeep [OPTIONS]

OPTIONS:
    -r, --role <ROLE>          master or client (default: master)
    -o, --originator <ID>      Originator id for TTL registrations (default: 0)
    -t, --tick-ms <MS>         Sweep interval in milliseconds (default: 1000)
    -b, --batch <N>            Due entries expired per sweep (default: 1)
    -l, --log-level <FILTER>   Log filter when RUST_LOG is unset (default: info)
    -v, --version              Print version information
    -h, --help                 Print this help message

EXAMPLES:
    tablekeep                          # Master, one expiry per second
    tablekeep --role client            # Replica: never creates tables or sweeps
    tablekeep --tick-ms 100 --batch 50 # Drain expirations faster
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
tablekeep v{} - Table Routing and TTL Expiry
──────────────────────────────────────────────────────────────
Role:        {}
Originator:  {}
Sweep:       every {}ms, up to {} per tick

Use Ctrl+C to shutdown gracefully.
"#,
        tablekeep::VERSION,
        config.role,
        config.originator,
        config.tick_ms,
        config.batch
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    print_banner(&config);

    // Shared role and shutdown flag
    let state = NodeState::new(config.role);
    let engine = Arc::new(MemoryEngine::new(state.clone()));
    info!(role = %config.role, "Storage engine initialized");

    let router = Arc::new(TableRouter::new(
        engine,
        state.clone(),
        RouterConfig::default(),
    ));
    let expiry = Arc::new(Expiry::new(router, config.expiry_config()));
    info!(originator = config.originator, "Expiry subsystem ready");

    // Start the background expiry sweeper
    let sweeper = ExpirySweeper::start(Arc::clone(&expiry));

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping node...");

    state.shutdown();
    sweeper.join().await;

    info!("Node shutdown complete");
    Ok(())
}
