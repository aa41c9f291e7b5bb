//! Radio driver backed by btleplug.
//!
//! Each trait call spawns a task on the current runtime and reports its
//! outcome through the event sink, so the orchestrator never blocks on
//! the adapter.

use crate::domain::models::{DeviceHandle, GattCharacteristic, RadioState};
use crate::infrastructure::bluetooth::driver::{DriverEvent, DriverEventSink, RadioDriver};
use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use data_encoding::HEXUPPER;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

#[derive(Default)]
struct Peripherals {
    next_handle: u64,
    by_id: HashMap<PeripheralId, DeviceHandle>,
    by_handle: HashMap<DeviceHandle, Peripheral>,
}

impl Peripherals {
    fn handle_for(&mut self, peripheral: Peripheral) -> DeviceHandle {
        let id = peripheral.id();
        if let Some(handle) = self.by_id.get(&id) {
            return *handle;
        }
        self.next_handle += 1;
        let handle = DeviceHandle(self.next_handle);
        self.by_id.insert(id, handle);
        self.by_handle.insert(handle, peripheral);
        handle
    }
}

/// Upper-case hex of the advertisement's manufacturer data, lowest company id first
pub fn alias_value(properties: &PeripheralProperties) -> Option<String> {
    let sorted: BTreeMap<_, _> = properties.manufacturer_data.iter().collect();
    sorted
        .into_values()
        .next()
        .map(|data| HEXUPPER.encode(data))
}

pub struct BtleplugDriver {
    adapter: Adapter,
    peripherals: Arc<Mutex<Peripherals>>,
    sink: Option<DriverEventSink>,
    event_pump: Option<JoinHandle<()>>,
    connecting: HashMap<DeviceHandle, JoinHandle<()>>,
    notifying: HashMap<(DeviceHandle, GattCharacteristic), JoinHandle<()>>,
}

impl BtleplugDriver {
    /// Use the first adapter the platform reports
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.context("Bluetooth manager unavailable")?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(Peripherals::default())),
            sink: None,
            event_pump: None,
            connecting: HashMap::new(),
            notifying: HashMap::new(),
        })
    }

    fn sink(&self) -> Result<DriverEventSink> {
        self.sink
            .clone()
            .ok_or_else(|| anyhow!("Driver has no event sink"))
    }

    fn peripheral(&self, device: DeviceHandle) -> Result<Peripheral> {
        let peripherals = self
            .peripherals
            .lock()
            .map_err(|_| anyhow!("Lock error"))?;
        peripherals
            .by_handle
            .get(&device)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown device {}", device))
    }

    fn spawn_event_pump(&mut self, sink: DriverEventSink) {
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let pump = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    CentralEvent::DeviceDisconnected(id) => {
                        let handle = peripherals
                            .lock()
                            .ok()
                            .and_then(|p| p.by_id.get(&id).copied());
                        if let Some(device) = handle {
                            debug!("{} dropped the link", device);
                            sink.emit(DriverEvent::Disconnected {
                                device,
                                error: None,
                            });
                        }
                        continue;
                    }
                    _ => continue,
                };

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let device = match peripherals.lock() {
                    Ok(mut p) => p.handle_for(peripheral),
                    Err(_) => continue,
                };

                trace!("Advertisement from {}: {:?}", device, properties.local_name);
                let event = DriverEvent::Discovered {
                    alias_value: alias_value(&properties),
                    name: properties.local_name,
                    device,
                };
                if !sink.emit(event) {
                    break;
                }
            }
            debug!("Adapter event stream ended");
        });

        if let Some(previous) = self.event_pump.replace(pump) {
            previous.abort();
        }
    }
}

impl Drop for BtleplugDriver {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        for (_, task) in self.connecting.drain() {
            task.abort();
        }
        for (_, task) in self.notifying.drain() {
            task.abort();
        }
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    characteristic: &GattCharacteristic,
) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.service_uuid == characteristic.service_uuid && c.uuid == characteristic.uuid)
        .ok_or_else(|| anyhow!("{} not discovered", characteristic))
}

impl RadioDriver for BtleplugDriver {
    fn set_event_sink(&mut self, sink: DriverEventSink) {
        self.spawn_event_pump(sink.clone());
        self.sink = Some(sink);
    }

    fn radio_state(&self) -> RadioState {
        // btleplug does not expose power state; an adapter existing is enough
        RadioState::Ready
    }

    fn start_scan(&mut self) -> Result<()> {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                error!("Failed to start scan: {}", e);
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&mut self, device: DeviceHandle) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let sink = self.sink()?;
        self.connecting.retain(|_, task| !task.is_finished());

        let task = tokio::spawn(async move {
            info!("Connecting to {}...", device);
            let event = match peripheral.connect().await {
                Ok(()) => DriverEvent::Connected(device),
                Err(e) => DriverEvent::Disconnected {
                    device,
                    error: Some(e.to_string()),
                },
            };
            sink.emit(event);
        });
        self.connecting.insert(device, task);
        Ok(())
    }

    fn cancel_connect(&mut self, device: DeviceHandle) -> Result<()> {
        if let Some(task) = self.connecting.remove(&device) {
            task.abort();
        }
        self.disconnect(device)
    }

    fn disconnect(&mut self, device: DeviceHandle) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        self.notifying.retain(|(d, _), task| {
            if *d == device {
                task.abort();
            }
            *d != device
        });

        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect {}: {}", device, e);
            }
        });
        Ok(())
    }

    fn discover_services(&mut self, device: DeviceHandle, services: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let sink = self.sink()?;
        let wanted = services.to_vec();

        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => DriverEvent::ServicesDiscovered {
                    device,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|s| s.uuid)
                        .filter(|uuid| wanted.contains(uuid))
                        .collect(),
                    error: None,
                },
                Err(e) => DriverEvent::ServicesDiscovered {
                    device,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            sink.emit(event);
        });
        Ok(())
    }

    fn discover_characteristics(
        &mut self,
        device: DeviceHandle,
        service_uuid: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let sink = self.sink()?;

        // btleplug resolves characteristics together with services
        let found: Vec<Uuid> = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service_uuid)
            .flat_map(|s| s.characteristics.into_iter().map(|c| c.uuid))
            .filter(|uuid| characteristics.contains(uuid))
            .collect();

        sink.emit(DriverEvent::CharacteristicsDiscovered {
            device,
            service_uuid,
            characteristics: found,
            error: None,
        });
        Ok(())
    }

    fn write_value(
        &mut self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;
        let data = data.to_vec();

        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, &characteristic) {
                Ok(c) => peripheral
                    .write(&c, &data, WriteType::WithResponse)
                    .await
                    .map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            sink.emit(DriverEvent::WriteCompleted {
                device,
                characteristic,
                error: result.err().map(|e| e.to_string()),
            });
        });
        Ok(())
    }

    fn read_value(
        &mut self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
    ) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let sink = self.sink()?;
        let characteristic = *characteristic;

        tokio::spawn(async move {
            let result = match find_characteristic(&peripheral, &characteristic) {
                Ok(c) => peripheral.read(&c).await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };
            let event = match result {
                Ok(value) => DriverEvent::CharacteristicValueUpdated {
                    device,
                    characteristic,
                    value,
                    error: None,
                },
                Err(e) => DriverEvent::CharacteristicValueUpdated {
                    device,
                    characteristic,
                    value: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            sink.emit(event);
        });
        Ok(())
    }

    fn set_notify(
        &mut self,
        device: DeviceHandle,
        characteristic: &GattCharacteristic,
        enabled: bool,
    ) -> Result<()> {
        let peripheral = self.peripheral(device)?;
        let key = (device, *characteristic);
        let characteristic = *characteristic;

        if let Some(task) = self.notifying.remove(&key) {
            task.abort();
        }

        if !enabled {
            tokio::spawn(async move {
                if let Ok(c) = find_characteristic(&peripheral, &characteristic) {
                    if let Err(e) = peripheral.unsubscribe(&c).await {
                        warn!("Failed to unsubscribe {}: {}", characteristic, e);
                    }
                }
            });
            return Ok(());
        }

        let sink = self.sink()?;
        let task = tokio::spawn(async move {
            let c = match find_characteristic(&peripheral, &characteristic) {
                Ok(c) => c,
                Err(e) => {
                    error!("Cannot subscribe: {:#}", e);
                    return;
                }
            };
            if let Err(e) = peripheral.subscribe(&c).await {
                error!("Failed to subscribe to {}: {}", characteristic, e);
                return;
            }
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Notification stream unavailable: {}", e);
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic.uuid {
                    continue;
                }
                let delivered = sink.emit(DriverEvent::CharacteristicValueUpdated {
                    device,
                    characteristic,
                    value: notification.value,
                    error: None,
                });
                if !delivered {
                    break;
                }
            }
        });
        self.notifying.insert(key, task);
        Ok(())
    }
}
