//! Command-line access to a LimaCharlie org.
//!
//! Credentials come from `LC_OID` plus `LC_API_KEY` and/or `LC_JWT`. Log
//! verbosity follows `RUST_LOG` (default `warn`, `--verbose` raises it to
//! `debug`).
//!
//! # Examples
//!
//! ```sh
//! # Check the credential
//! limacharlie auth
//!
//! # List sensors, then the next page
//! limacharlie sensors
//! limacharlie sensors --all
//!
//! # Inspect one sensor
//! limacharlie sensor 3f2e... info
//!
//! # Send a command
//! limacharlie task 3f2e... "os_version" --inv-id triage-1
//!
//! # Follow detections tagged "vip"
//! limacharlie stream --type detect --tag vip
//! ```

use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use limacharlie::api::streaming::{ConnectionFilter, Feed};
use limacharlie::config::FeedConfig;
use limacharlie::events::LoggingObserver;
use limacharlie::manager::{Manager, ManagerConfig};
use limacharlie::{ApiError, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "limacharlie", version, about = "Query and task a LimaCharlie org")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Exchange the API key for a token and report whether it worked
    Auth,

    /// List the org's sensors
    Sensors {
        /// Follow continuation tokens until the listing is exhausted
        #[arg(long)]
        all: bool,
    },

    /// Inspect one sensor
    Sensor {
        sid: String,
        #[arg(value_enum, default_value_t = SensorQuery::Info)]
        query: SensorQuery,
    },

    /// Send one or more commands to a sensor
    Task {
        sid: String,
        #[arg(required = true)]
        commands: Vec<String>,
        /// Investigation id attached to the responses
        #[arg(long)]
        inv_id: Option<String>,
    },

    /// Print feed events as JSON lines until interrupted
    Stream {
        /// Data type: event, detect, audit, ...
        #[arg(long = "type", default_value = "event")]
        data_type: String,
        #[arg(long)]
        inv_id: Option<String>,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        cat: Option<String>,
        #[arg(long)]
        sid: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SensorQuery {
    Info,
    Online,
    Tags,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "limacharlie=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ManagerConfig::from_env()?.with_observer(Arc::new(LoggingObserver));

    match cli.command {
        Command::Auth => {
            let manager = Manager::new(config)?;
            if manager.test_auth().await {
                println!("Authenticated to org {}", manager.org_id());
            } else {
                return Err(ApiError::Unauthorized(format!(
                    "could not authenticate to org {}",
                    manager.org_id()
                )));
            }
        }

        Command::Sensors { all } => {
            let manager = Manager::new(config)?;
            let mut page = manager.sensors(None, false).await?;
            while !page.is_empty() {
                for sensor in &page {
                    println!("{}", sensor.sid());
                }
                if !all {
                    break;
                }
                page = manager.sensors(None, true).await?;
            }
        }

        Command::Sensor { sid, query } => {
            let manager = Manager::new(config)?;
            let sensor = manager.sensor(sid, None);
            match query {
                SensorQuery::Info => {
                    let info = sensor.info().await?;
                    println!("aid:      {}", info.aid());
                    println!("hostname: {}", info.hostname.as_deref().unwrap_or("-"));
                    println!("platform: {:?}", info.platform());
                }
                SensorQuery::Online => println!("{}", sensor.is_online().await?),
                SensorQuery::Tags => {
                    for tag in sensor.tags().await? {
                        println!("{tag}");
                    }
                }
            }
        }

        Command::Task {
            sid,
            commands,
            inv_id,
        } => {
            let manager = Manager::new(config)?;
            let sensor = manager.sensor(sid, inv_id.as_deref());
            let response = sensor.task(&commands, None).await?;
            print_json(&response);
        }

        Command::Stream {
            data_type,
            inv_id,
            tag,
            cat,
            sid,
        } => {
            let mut filter = ConnectionFilter::new(data_type);
            filter.investigation_id = inv_id;
            filter.tag = tag;
            filter.category = cat;
            filter.sensor_id = sid;

            let feed = Feed::builder(filter)
                .config(FeedConfig::default())
                .observer(Arc::new(LoggingObserver))
                .handler(|event| println!("{event}"))
                .start(Arc::new(config.credentials))?;

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| ApiError::Configuration(format!("failed to wait for ctrl-c: {e}")))?;
            info!("Interrupted, {} event(s) reported dropped", feed.dropped_count());
            feed.shutdown();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
