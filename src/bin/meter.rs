//! Meter process entry point (spec §6 "CLI (meter mode)").
//!
//! Grounded in `bin/sn_node.rs`'s bootstrap shape (color-eyre install,
//! tracing-subscriber setup from `Config`, then hand off to the async
//! runtime) adapted to this crate's `Config` flags rather than sn_node's
//! positional arguments — see `DESIGN.md`.

use color_eyre::eyre::{self, WrapErr};
use meter_aggregation::config::{Config, ProtocolVariant};
use meter_aggregation::crypto::keys;
use meter_aggregation::crypto::null::NullCrypto;
use meter_aggregation::crypto::rsa_crypto::RsaCrypto;
use meter_aggregation::crypto::Crypto;
use meter_aggregation::device::SimulatedMeter;
use meter_aggregation::meter::{MeterActor, MeterEvent};
use meter_aggregation::net::tcp::{self, TcpNetwork};
use meter_aggregation::net::wire::WirePayload;
use meter_aggregation::net::Network;
use meter_aggregation::timer::tokio_timer::TokioTimer;
use meter_aggregation::timer::Timer;
use meter_aggregation::types::UTILITY_ID;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let config = Config::from_args_checked().wrap_err("invalid meter configuration")?;
    init_logging(&config);

    let t = config.fault_threshold();
    let num_groups = config.num_aggregation_groups();
    info!(meter_id = config.meter_id, num_meters = config.num_meters, t, num_groups, "starting meter");

    let addresses = keys::load_peer_addresses(&config.peers_file).wrap_err("loading peer address map")?;
    let network: Arc<dyn Network> = Arc::new(TcpNetwork::new(config.listen_address, config.utility_address, addresses));

    let crypto: Arc<dyn Crypto> = match config.variant {
        ProtocolVariant::Byzantine => {
            let public_folder = config
                .public_key_folder
                .as_deref()
                .ok_or_else(|| eyre::eyre!("--public-key-folder is required for the Byzantine variant"))?;
            let private_folder = config
                .private_key_folder
                .as_deref()
                .ok_or_else(|| eyre::eyre!("--private-key-folder is required for the Byzantine variant"))?;
            let private_key =
                keys::load_private_key(private_folder, config.meter_id).wrap_err("loading this meter's private key")?;
            let mut ids: Vec<_> = (0..config.num_meters as i64).filter(|&id| id != config.meter_id).collect();
            ids.push(UTILITY_ID);
            let public_keys = keys::load_public_keys(public_folder, ids).wrap_err("loading peer public keys")?;
            Arc::new(RsaCrypto::new(config.meter_id, private_key, public_keys, UTILITY_ID))
        }
        ProtocolVariant::CrashTolerant | ProtocolVariant::HighFailureTolerant => Arc::new(NullCrypto::new(config.meter_id)),
    };

    let timer: Arc<dyn Timer> = Arc::new(TokioTimer::new());
    let capability = Arc::new(load_capability(&config)?);

    let (handle, _actor_join) = MeterActor::spawn(
        config.meter_id,
        config.num_meters,
        t,
        num_groups,
        config.variant,
        network,
        crypto,
        timer,
        capability,
        config.round_timeout_ms,
    );

    let listener = TcpListener::bind(config.listen_address)
        .await
        .wrap_err_with(|| format!("binding listen address {}", config.listen_address))?;

    tcp::listen(listener, move |payload| {
        let event = match payload {
            WirePayload::Overlay(batch) => MeterEvent::OverlayBatch(batch),
            WirePayload::Ping(ping) => MeterEvent::Ping(ping),
            WirePayload::Aggregation(message) => MeterEvent::Aggregation(message),
            WirePayload::QueryRequest(query) => MeterEvent::Query(query),
            WirePayload::SignatureResponse(response) => MeterEvent::SignatureResponse(response),
            WirePayload::SignatureRequest(_) => {
                warn!("meter received a signature request, which only the utility should ever handle");
                return;
            }
        };
        handle.send(event);
    })
    .await
    .wrap_err("meter listener loop exited")?;

    Ok(())
}

/// Sums the base loads declared across every `--device-config-files` entry
/// into one `SimulatedMeter` (spec §6's "device config files" plural: a
/// household may have more than one metered circuit).
fn load_capability(config: &Config) -> eyre::Result<SimulatedMeter> {
    let mut total_watts = 0.0;
    for path in &config.device_config_files {
        let contents = std::fs::read_to_string(path).wrap_err_with(|| format!("reading device config {}", path.display()))?;
        let watts: f64 = contents
            .trim()
            .parse()
            .wrap_err_with(|| format!("device config {} is not a base-load wattage", path.display()))?;
        total_watts += watts;
    }
    if config.device_config_files.is_empty() {
        total_watts = 500.0;
    }
    Ok(SimulatedMeter::new(config.meter_id as u64, total_watts))
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &config.log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::hourly(log_dir, "meter.log");
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
