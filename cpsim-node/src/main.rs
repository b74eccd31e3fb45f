//! cpsim-node - CLI for one simulated charge point
//!
//! Connects a simulated OCPP 1.6-J charge point to a central system and reads
//! operator commands from stdin.
//!
//! # Usage
//!
//! ```bash
//! # Connect with defaults
//! cpsim-node --cp-id CP-001
//!
//! # Specific CSMS, boot and start charging right away
//! cpsim-node --cp-id CP-001 --url ws://localhost:9000/ocpp --boot --auto-start
//!
//! # Basic auth and persisted state
//! cpsim-node --cp-id CP-001 --user cp --password secret --state-dir ./state
//! ```
//!
//! # Commands
//!
//! `boot`, `heartbeat`, `status <Status>`, `authorize [tag]`, `start [tag]`, `stop`,
//! `meter`, `state`, `log [n]`, `export`, `clear`, `pause`, `resume`, `connect`,
//! `disconnect`, `help`, `quit`

use std::sync::Arc;

use clap::Parser;
use cpsim_core::ocpp::{ChargePointErrorCode, ChargePointStatus};
use cpsim_core::{
    ChargePoint, ConnectionState, JsonFileStore, Protocol, SimulatorConfig, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Simulated OCPP-J charge point
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system WebSocket URL (charge point id is appended)
    #[arg(long, default_value = "ws://localhost:9000/ocpp/")]
    url: String,

    /// Charge point identity
    #[arg(long, default_value = cpsim_core::config::DEFAULT_CP_ID)]
    cp_id: String,

    /// WebSocket subprotocol (ocpp1.6 or ocpp2.0.1)
    #[arg(long, default_value = "ocpp1.6")]
    protocol: Protocol,

    /// Basic-auth user
    #[arg(long, default_value = "")]
    user: String,

    /// Basic-auth password
    #[arg(long, default_value = "")]
    password: String,

    /// Vendor name
    #[arg(long, default_value = "EVS-Sim")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "Browser-CP")]
    model: String,

    /// Connector used for sessions and status reports
    #[arg(long, default_value = "1")]
    connector: u32,

    /// idTag used for local sessions
    #[arg(long, default_value = "DEMO1234")]
    id_tag: String,

    /// Directory for persisted charge point state
    #[arg(long)]
    state_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Send BootNotification after connecting
    #[arg(long)]
    boot: bool,

    /// Start a charging session after booting
    #[arg(long)]
    auto_start: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              cpsim-node - Simulated Charge Point             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  CP ID:     {:<48} ║", truncate(&args.cp_id, 48));
    println!("║  CSMS URL:  {:<48} ║", truncate(&args.url, 48));
    println!("║  Protocol:  {:<48} ║", args.protocol.as_str());
    println!("║  Connector: {:<48} ║", args.connector);
    println!("║  idTag:     {:<48} ║", truncate(&args.id_tag, 48));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration; command-line flags win over stored values
    let config = SimulatorConfig::new(&args.cp_id, &args.url)
        .with_vendor(&args.vendor, &args.model)
        .with_protocol(args.protocol)
        .with_credentials(&args.user, &args.password)
        .with_connector(args.connector)
        .with_id_tag(&args.id_tag);

    let mut builder = ChargePoint::builder(config).transport(Arc::new(WsTransport::default()));
    if let Some(dir) = &args.state_dir {
        info!("Persisting state under {}", dir);
        builder = builder.store(Arc::new(JsonFileStore::new(dir))).keep_config();
    }
    let cp = builder.build().await?;

    cp.connect().await?;
    if args.boot || args.auto_start {
        run_command(&cp, "boot").await;
    }
    if args.auto_start {
        run_command(&cp, "start").await;
    }

    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" || line == "exit" {
                    break;
                }
                run_command(&cp, line).await;
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    info!("Shutting down...");
    if cp.transaction_state().is_active() {
        if let Err(e) = cp.stop_session().await {
            warn!("Session stop on exit failed: {}", e);
        }
    }
    cp.disconnect().await;

    Ok(())
}

async fn run_command(cp: &ChargePoint, line: &str) {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();

    match command {
        "boot" => match cp.boot_notification().await {
            Ok(reply) => info!(
                "BootNotification: {:?}, interval {} s",
                reply.status,
                cp.configuration_value("HeartbeatInterval").unwrap_or_default()
            ),
            Err(e) => error!("BootNotification failed: {}", e),
        },
        "heartbeat" => match cp.send_heartbeat().await {
            Ok(reply) => info!("Heartbeat: {}", reply),
            Err(e) => error!("Heartbeat failed: {}", e),
        },
        "status" => {
            let status = match arg.unwrap_or("Available").parse::<ChargePointStatus>() {
                Ok(status) => status,
                Err(e) => {
                    error!("{}", e);
                    return;
                }
            };
            let error_code = if status == ChargePointStatus::Faulted {
                ChargePointErrorCode::OtherError
            } else {
                ChargePointErrorCode::NoError
            };
            if let Err(e) = cp.send_status_notification(status, error_code).await {
                error!("StatusNotification failed: {}", e);
            }
        }
        "authorize" => match cp.authorize(arg).await {
            Ok(reply) => match reply.id_tag_info {
                Some(info) => info!("Authorize: {:?}", info.status),
                None => warn!("Authorize reply without idTagInfo"),
            },
            Err(e) => error!("Authorize failed: {}", e),
        },
        "start" => {
            let started = match arg {
                Some(tag) => cp.start_session_with(cp.runtime().connector_id, tag).await,
                None => cp.start_session().await,
            };
            match started {
                Ok(transaction_id) => info!("Charging, transaction {}", transaction_id),
                Err(e) => error!("Start failed: {}", e),
            }
        }
        "stop" => match cp.stop_session().await {
            Ok(()) => info!("Session stopped"),
            Err(e) => error!("Stop failed: {}", e),
        },
        "meter" => {
            if let Err(e) = cp.send_meter_values().await {
                error!("MeterValues failed: {}", e);
            }
        }
        "state" => {
            let state = cp.transaction_state();
            println!(
                "{:?} | connection {:?} | tx {} | {:.1} kW {:.1} A | {:.0} Wh | SoC {:.1}%",
                state.phase,
                cp.connection_state(),
                state
                    .transaction_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into()),
                state.power_kw,
                state.current_a,
                state.energy_wh,
                state.soc_percent
            );
        }
        "log" => {
            let count = arg.and_then(|n| n.parse().ok()).unwrap_or(20);
            for entry in cp.frame_log().await.iter().take(count) {
                println!("{}", entry.summary());
            }
        }
        "export" => match cp.export_frames().await {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Export failed: {}", e),
        },
        "clear" => cp.clear_frames().await,
        "pause" => cp.set_log_paused(true).await,
        "resume" => cp.set_log_paused(false).await,
        "connect" => {
            if cp.connection_state() != ConnectionState::Disconnected {
                warn!("Already {:?}", cp.connection_state());
            } else if let Err(e) = cp.connect().await {
                error!("Connect failed: {}", e);
            }
        }
        "disconnect" => cp.disconnect().await,
        "help" => print_help(),
        other => warn!("Unknown command: {} (try 'help')", other),
    }
}

fn print_help() {
    println!("  boot                 send BootNotification");
    println!("  heartbeat            send Heartbeat");
    println!("  status <Status>      send StatusNotification (default Available)");
    println!("  authorize [tag]      send Authorize");
    println!("  start [tag] | stop   start or stop a charging session");
    println!("  meter                send MeterValues");
    println!("  state                show session state");
    println!("  log [n]              show the newest n frames");
    println!("  export               print the frame log as JSON");
    println!("  clear                clear the frame log");
    println!("  pause | resume       pause or resume frame logging");
    println!("  connect | disconnect");
    println!("  quit");
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
