//! Command line front-end for the BLE orchestrator
//!
//! Connects, reads, writes and watches named peripherals through the
//! btleplug driver.

use anyhow::{anyhow, Context, Result};
use ble_orchestrator::domain::models::{
    DeviceHandle, GattCharacteristic, ServiceSpec, TargetIdentity,
};
use ble_orchestrator::domain::request::ConnectRequest;
use ble_orchestrator::domain::settings::{KnownTarget, SettingsService};
use ble_orchestrator::infrastructure::bluetooth::btleplug_driver::BtleplugDriver;
use ble_orchestrator::infrastructure::bluetooth::{BluetoothService, OrchestratorObserver};
use ble_orchestrator::infrastructure::logging::init_logger;
use ble_orchestrator::BleError;
use clap::{Args, Parser, Subcommand};
use data_encoding::HEXUPPER;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ble-orchestrator")]
#[command(about = "Connect to and talk with named BLE peripherals")]
struct Cli {
    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Advertised local name
    name: String,
    /// Alias matched against the manufacturer data hex
    #[arg(short, long)]
    alias: Option<String>,
    /// Seconds before the attempt fails
    #[arg(short, long)]
    timeout: Option<u32>,
}

#[derive(Args)]
struct Endpoint {
    /// Service UUID
    service: Uuid,
    /// Characteristic UUID
    characteristic: Uuid,
}

impl Endpoint {
    fn characteristic(&self) -> GattCharacteristic {
        GattCharacteristic::new(self.service, self.characteristic)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and wait until the target is ready
    Connect {
        #[command(flatten)]
        target: Target,
        /// Save the target to the settings file
        #[arg(long)]
        remember: bool,
    },
    /// Read one characteristic
    Read {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        endpoint: Endpoint,
    },
    /// Write hex bytes to one characteristic
    Write {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        endpoint: Endpoint,
        /// Payload, e.g. 0A1B
        data: String,
    },
    /// Print notifications until Ctrl-C
    Watch {
        #[command(flatten)]
        target: Target,
        #[command(flatten)]
        endpoint: Endpoint,
    },
}

struct Printer;

impl OrchestratorObserver for Printer {
    fn on_characteristic_update(
        &self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
        value: Result<&[u8], &BleError>,
    ) {
        match value {
            Ok(bytes) => println!("{} {} {}", device, characteristic, HEXUPPER.encode(bytes)),
            Err(e) => println!("{} {} error: {}", device, characteristic, e),
        }
    }

    fn on_disconnected(
        &self,
        target: &TargetIdentity,
        _device: Option<DeviceHandle>,
        error: Option<&BleError>,
    ) {
        if let Some(e) = error {
            println!("{} disconnected: {}", target, e);
        }
    }
}

/// Fill in alias, services and timeout from the settings file
fn build_request(
    settings: &SettingsService,
    target: &Target,
    extra: Option<ServiceSpec>,
) -> ConnectRequest {
    let known = settings.find_target(&target.name);
    let mut identity = TargetIdentity::new(&target.name);
    identity.alias = target
        .alias
        .clone()
        .or_else(|| known.and_then(|k| k.target.alias.clone()));

    let mut services: Vec<ServiceSpec> = known.map(|k| k.services.clone()).unwrap_or_default();
    if let Some(extra) = extra.filter(|spec| !services.contains(spec)) {
        services.push(extra);
    }

    let timeout = target
        .timeout
        .unwrap_or(settings.get().orchestrator.default_timeout_secs);
    ConnectRequest::for_target(identity)
        .services(services)
        .timeout_secs(timeout)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = SettingsService::new()?;
    let base_dir = settings
        .path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    let _guard = init_logger(
        &settings.get().log_settings,
        &base_dir,
        cli.log_level.as_deref(),
    )?;
    info!("Settings loaded from {}", settings.path().display());

    let driver = BtleplugDriver::new().await?;
    let service = BluetoothService::start(driver, &settings.get().orchestrator);

    let result = match cli.command {
        Commands::Connect { target, remember } => {
            let request = build_request(&settings, &target, None);
            let identity = request.target().clone();
            let device = service.connect_async(request).await?;
            println!("{} ready as {}", identity, device);
            if remember {
                let services = settings
                    .find_target(&identity.name)
                    .map(|k| k.services.clone())
                    .unwrap_or_default();
                settings.remember_target(KnownTarget {
                    target: identity,
                    services,
                })?;
            }
            Ok(())
        }
        Commands::Read { target, endpoint } => {
            let ch = endpoint.characteristic();
            let spec = ServiceSpec::new(ch.service_uuid, [ch.uuid]);
            let request = build_request(&settings, &target, Some(spec));
            service.connect_async(request).await?;
            let value = service.read_async(target.name.as_str(), ch).await?;
            println!("{}", HEXUPPER.encode(&value));
            Ok(())
        }
        Commands::Write {
            target,
            endpoint,
            data,
        } => {
            let payload = HEXUPPER
                .decode(data.to_uppercase().as_bytes())
                .map_err(|e| anyhow!("Invalid hex payload: {}", e))?;
            let ch = endpoint.characteristic();
            let spec = ServiceSpec::new(ch.service_uuid, [ch.uuid]);
            let request = build_request(&settings, &target, Some(spec));
            service.connect_async(request).await?;
            service.write_async(target.name.as_str(), ch, payload).await?;
            println!("OK");
            Ok(())
        }
        Commands::Watch { target, endpoint } => {
            let ch = endpoint.characteristic();
            let printer: Arc<dyn OrchestratorObserver> = Arc::new(Printer);
            service.add_observer(&printer);
            let spec = ServiceSpec::new(ch.service_uuid, [ch.uuid]);
            let request = build_request(&settings, &target, Some(spec));
            service.connect_async(request).await?;
            service.subscribe(target.name.as_str(), ch, true);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            service.subscribe(target.name.as_str(), ch, false);
            Ok(())
        }
    };

    service.shutdown();
    result
}
