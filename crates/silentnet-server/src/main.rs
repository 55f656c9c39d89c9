//! Silent Net server entry point.
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML file, then positional overrides
//!  └─ Storage::open()        -- SQLite event store
//!  └─ ConnectionServer::bind().start()
//!       ├─ silentnet-accept      (accept loop)
//!       └─ silentnet-session-N   (one per connection)
//!  └─ operator console on stdin: `q` quits, `e` erases all logs
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use silentnet_server::{load_config, ConfigOverrides, ConnectionServer, ServerHandle, Storage};

/// Silent Net monitoring server.
#[derive(Debug, Parser)]
#[command(name = "silentnet-server", version, about)]
struct Cli {
    /// Maximum simultaneous employee sessions (1-40, default 5).
    #[arg(allow_hyphen_values = true)]
    max_clients: Option<String>,

    /// Safety threshold (1-5, default 5); a session may send
    /// `10 - threshold` unsafe messages before it is closed.
    #[arg(allow_hyphen_values = true)]
    safety: Option<String>,

    /// Manager password (default "itzik").
    password: Option<String>,

    /// TOML configuration file; defaults are used if it does not exist.
    #[arg(long, env = "SILENTNET_CONFIG", default_value = "silentnet.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_thread_names(true)
        .init();

    // Unparsable numbers become 0 so the range check rejects them loudly.
    config.apply_overrides(ConfigOverrides {
        max_clients: cli.max_clients.map(|raw| raw.trim().parse().unwrap_or(0)),
        safety_threshold: cli.safety.map(|raw| raw.trim().parse().unwrap_or(0)),
        password: cli.password,
    });
    info!(
        max_clients = config.admission.max_clients,
        safety_threshold = config.admission.safety_threshold,
        "Silent Net server starting"
    );

    let storage = Storage::open(
        &config.storage.database_path,
        config.monitoring.idle_threshold_minutes,
    )
    .context("opening event store")?;

    let server = ConnectionServer::bind(&config, Arc::new(storage))
        .with_context(|| format!("binding {}", config.listen_address()))?
        .start()
        .context("starting server")?;

    info!("ready; type `q` to quit or `e` to erase all logs");
    run_console(&server);
    server.quit();
    Ok(())
}

/// Reads operator commands from stdin until `q` or end of input.
fn run_console(server: &ServerHandle) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "console read failed");
                break;
            }
        };
        match line.trim() {
            "q" => return,
            "e" => {
                server.erase_all_logs();
            }
            "" => {}
            other => warn!(command = other, "unknown command; use `q` or `e`"),
        }
    }

    // Without a console (daemonized, stdin closed) keep serving until killed.
    info!("console closed; serving until terminated");
    while server.is_running() {
        std::thread::park();
    }
}
