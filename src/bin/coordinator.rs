//! Utility coordinator process entry point (spec §6 "CLI (coordinator
//! mode)"): owns `UtilityCoordinator`, a TCP listener for meter traffic,
//! and a stdin-driven query submission loop (one `<type> <window-minutes>
//! <query-number>` line per query; the spec names the process's startup
//! arguments but leaves query submission itself unspecified).
//!
//! Grounded in `bin/sn_node.rs`'s bootstrap shape, same as `bin/meter.rs`.

use color_eyre::eyre::{self, WrapErr};
use meter_aggregation::config::{Config, ProtocolVariant};
use meter_aggregation::crypto::keys;
use meter_aggregation::crypto::null::NullCrypto;
use meter_aggregation::crypto::rsa_crypto::RsaCrypto;
use meter_aggregation::crypto::Crypto;
use meter_aggregation::net::tcp::{self, TcpNetwork};
use meter_aggregation::net::wire::WirePayload;
use meter_aggregation::net::Network;
use meter_aggregation::timer::tokio_timer::TokioTimer;
use meter_aggregation::timer::Timer;
use meter_aggregation::types::{QueryRequest, QueryType, UTILITY_ID};
use meter_aggregation::utility::{QueryResult, UtilityCoordinator, UtilityEvent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let config = Config::from_args_checked().wrap_err("invalid coordinator configuration")?;
    if config.meter_id != UTILITY_ID {
        return Err(eyre::eyre!("the coordinator binary always runs as the utility (id {})", UTILITY_ID));
    }
    init_logging(&config);

    let t = config.fault_threshold();
    info!(num_meters = config.num_meters, t, variant = ?config.variant, "starting coordinator");

    let addresses = keys::load_peer_addresses(&config.peers_file).wrap_err("loading peer address map")?;
    let network: Arc<dyn Network> = Arc::new(TcpNetwork::new(config.listen_address, config.listen_address, addresses));

    let crypto: Arc<dyn Crypto> = match config.variant {
        ProtocolVariant::Byzantine => {
            let private_folder = config
                .private_key_folder
                .as_deref()
                .ok_or_else(|| eyre::eyre!("--private-key-folder is required for the Byzantine variant"))?;
            let public_folder = config
                .public_key_folder
                .as_deref()
                .ok_or_else(|| eyre::eyre!("--public-key-folder is required for the Byzantine variant"))?;
            let private_key = keys::load_private_key(private_folder, UTILITY_ID).wrap_err("loading the utility's private key")?;
            let public_keys = keys::load_public_keys(public_folder, 0..config.num_meters as i64).wrap_err("loading meter public keys")?;
            Arc::new(RsaCrypto::new(UTILITY_ID, private_key, public_keys, UTILITY_ID))
        }
        ProtocolVariant::CrashTolerant | ProtocolVariant::HighFailureTolerant => Arc::new(NullCrypto::new(UTILITY_ID)),
    };

    let timer: Arc<dyn Timer> = Arc::new(TokioTimer::new());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<UtilityEvent>();
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<QueryResult>();

    let mut coordinator = UtilityCoordinator::new(config.num_meters, t, config.variant, network, crypto, timer, config.round_timeout_ms, event_tx.clone());
    coordinator.subscribe_results(results_tx);

    let listener = TcpListener::bind(config.listen_address)
        .await
        .wrap_err_with(|| format!("binding listen address {}", config.listen_address))?;

    let listen_tx = event_tx.clone();
    tokio::spawn(async move {
        let result = tcp::listen(listener, move |payload| {
            let event = match payload {
                WirePayload::Aggregation(message) => UtilityEvent::Aggregation(message),
                WirePayload::SignatureRequest(request) => UtilityEvent::SignatureRequest(request),
                other => {
                    warn!(?other, "coordinator received a message kind it never expects");
                    return;
                }
            };
            let _ = listen_tx.send(event);
        })
        .await;
        if let Err(error) = result {
            warn!(%error, "coordinator listener loop exited");
        }
    });

    tokio::spawn(async move {
        while let Some(result) = results_rx.recv().await {
            match result.body {
                Some(body) => println!("query {} => {:?} ({} contributors)", result.query_number, body, result.num_contributors),
                None => println!("query {} failed to reach quorum", result.query_number),
            }
        }
    });

    tokio::spawn(read_queries_from_stdin(event_tx));

    while let Some(event) = event_rx.recv().await {
        if let Err(error) = coordinator.handle_event(event).await {
            warn!(%error, "error handling coordinator event");
        }
    }

    Ok(())
}

/// Reads `<query-type> <window-minutes> <query-number>` lines from stdin
/// and submits each as a query, so an operator (or a driving script) can
/// batch queries without the coordinator needing its own RPC surface.
async fn read_queries_from_stdin(event_tx: mpsc::UnboundedSender<UtilityEvent>) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(request) = parse_query_line(&line) {
                    let _ = event_tx.send(UtilityEvent::SubmitQuery(request));
                } else if !line.trim().is_empty() {
                    warn!(%line, "ignoring unparseable query line");
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "stdin read failed; no further queries will be accepted");
                break;
            }
        }
    }
}

fn parse_query_line(line: &str) -> Option<QueryRequest> {
    let mut parts = line.split_whitespace();
    let kind = match parts.next()?.to_ascii_lowercase().as_str() {
        "total" | "total-consumption" => QueryType::TotalConsumption,
        "shiftable" | "shiftable-consumption" => QueryType::ShiftableConsumption,
        "daily" | "daily-consumption" => QueryType::DailyConsumption,
        _ => return None,
    };
    let window_minutes: u32 = parts.next()?.parse().ok()?;
    let query_number: u64 = parts.next()?.parse().ok()?;
    Some(QueryRequest::new(kind, window_minutes, query_number))
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "coordinator.log");
            let builder = tracing_subscriber::fmt().with_writer(file_appender).with_env_filter(filter).with_ansi(false);
            if config.json_logs {
                builder.json().init();
            } else {
                builder.compact().init();
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
