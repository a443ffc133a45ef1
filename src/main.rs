//! devpool - leasing and lifecycle engine for a shared pool of mobile test devices
//!
//! This is the binary entry point. Pool logic lives in the workspace crates.

mod commands;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use devpool_app::ports::{DEFAULT_BASE_PORT, DEFAULT_HOST, DEFAULT_RETRIES};
use devpool_app::{default_config_path, default_snapshot_path, load_config, PortRequest};
use devpool_core::logging::{self, LogSettings};

/// Exit code when a lease or boot found no device
const EXIT_POOL_EXHAUSTED: i32 = 2;

/// devpool - lease simulators and emulators to test runs
#[derive(Parser, Debug)]
#[command(name = "devpool")]
#[command(about = "Leasing and lifecycle engine for mobile test devices", long_about = None)]
struct Args {
    /// Device snapshot file (default: .devpool/devices.json)
    #[arg(long, global = true, value_name = "PATH")]
    store: Option<PathBuf>,

    /// Config file (default: .devpool/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List device records matching the filter
    Devices {
        #[arg(value_name = "KEY=VALUE")]
        filter: Vec<String>,
    },

    /// Resync matching records with the devices actually present
    Refresh {
        #[arg(value_name = "KEY=VALUE")]
        filter: Vec<String>,
    },

    /// Boot shut-down devices (`count=N`, `options=cold-boot,headless`)
    Boot {
        #[arg(value_name = "KEY=VALUE")]
        filter: Vec<String>,
    },

    /// Lease one device (`info=..`, `parentProcessPid=..`, `restart=true`)
    Subscribe {
        #[arg(value_name = "KEY=VALUE")]
        filter: Vec<String>,
    },

    /// Release a leased device
    Unsubscribe { token: String },

    /// Kill matching devices; no filter kills every device
    Kill {
        #[arg(value_name = "KEY=VALUE")]
        filter: Vec<String>,
    },

    /// Forget every record and rebuild the directory from scratch
    Drop,

    /// Patch fields of a record
    Update {
        token: String,
        #[arg(value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Reserve a free TCP port and print it
    Port {
        /// First port to try
        #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
        from: u16,

        /// Address the port must be bindable on
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Ports to try before giving up
        #[arg(long, default_value_t = DEFAULT_RETRIES)]
        retries: u32,
    },

    /// Give a reserved port back
    ReleasePort { port: u16 },

    /// Keep the pool reconciled until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let project_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let store = args
        .store
        .unwrap_or_else(|| default_snapshot_path(&project_path));
    let config_path = args
        .config
        .unwrap_or_else(|| default_config_path(&project_path));

    let log_settings = LogSettings::default();
    if matches!(args.command, Command::Serve) {
        logging::init_stderr(&log_settings)?;
    } else {
        logging::init(&log_settings)?;
    }
    let config = load_config(&config_path)?;

    let command = match args.command {
        Command::Serve => return Ok(serve::run(&store, config).await?),
        command => command,
    };

    let pool = commands::open_pool(&store, config).await?;
    let outcome = match command {
        Command::Devices { filter } => commands::devices(&pool, &filter).await,
        Command::Refresh { filter } => commands::refresh(&pool, &filter).await,
        Command::Boot { filter } => commands::boot(&pool, &filter).await,
        Command::Subscribe { filter } => commands::subscribe(&pool, &filter).await,
        Command::Unsubscribe { token } => commands::unsubscribe(&pool, &token).await,
        Command::Kill { filter } => commands::kill(&pool, &filter).await,
        Command::Drop => commands::drop_all(&pool).await,
        Command::Update { token, fields } => commands::update(&pool, &token, &fields).await,
        Command::Port {
            from,
            host,
            retries,
        } => {
            let request = PortRequest {
                from,
                host,
                retries,
            };
            commands::port(&pool, request).await
        }
        Command::ReleasePort { port } => commands::release_port(&pool, port).await,
        Command::Serve => Ok(true),
    };
    pool.shutdown().await;

    if !outcome? {
        std::process::exit(EXIT_POOL_EXHAUSTED);
    }
    Ok(())
}
