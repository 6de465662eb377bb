//! Bluetooth device discovery for finding nearby peers

use anyhow::Result;
use bluer::{Adapter, Address, Device};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use spp_core::RemoteIdentity;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How long one scan runs, in seconds
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,
    /// Only report devices whose name starts with this
    #[serde(default)]
    pub name_prefix: Option<String>,
}

fn default_scan_secs() -> u64 {
    10
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_secs: default_scan_secs(),
            name_prefix: None,
        }
    }
}

/// A device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearbyDevice {
    pub address: Address,
    pub name: Option<String>,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

impl NearbyDevice {
    /// Identity to dial this device with
    pub fn identity(&self) -> RemoteIdentity {
        RemoteIdentity {
            name: self.name.clone(),
            address: self.address.to_string(),
        }
    }
}

/// Runs discovery scans; a running scan can be cut short from another task
pub struct BtDiscovery {
    config: DiscoveryConfig,
    stop: Notify,
    scanning: AtomicBool,
}

impl BtDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            stop: Notify::new(),
            scanning: AtomicBool::new(false),
        }
    }

    /// Get the default Bluetooth adapter, powered on
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Scan for the configured duration or until [`cancel`](Self::cancel).
    /// Devices come back strongest signal first.
    pub async fn scan(&self, adapter: &Adapter) -> Result<Vec<NearbyDevice>> {
        let mut found = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);
        info!("[BT] Scanning for {}s", self.config.scan_secs);

        let collect = async {
            while let Some(event) = discover.next().await {
                if let bluer::AdapterEvent::DeviceAdded(address) = event {
                    if !seen.insert(address) {
                        continue;
                    }
                    if let Ok(device) = adapter.device(address) {
                        if let Some(nearby) = self.inspect(&device).await {
                            debug!("[BT] Found {}", nearby.identity());
                            found.push(nearby);
                        }
                    }
                }
            }
        };
        let scan_window = timeout(Duration::from_secs(self.config.scan_secs), collect);

        match self.until_cancelled(scan_window).await {
            Some(_) => info!("[BT] Discovery scan completed"),
            None => info!("[BT] Discovery scan cancelled"),
        }

        sort_by_signal(&mut found);
        Ok(found)
    }

    /// Stop a scan in progress; no effect when none is running.
    ///
    /// Only scans started through this `BtDiscovery` are affected. Discovery
    /// started by other processes on the same adapter keeps running.
    pub fn cancel(&self) {
        if self.is_scanning() {
            self.stop.notify_waiters();
        }
    }

    /// Run `work` as the current scan; `None` if it was cancelled
    async fn until_cancelled<F: Future>(&self, work: F) -> Option<F::Output> {
        let stop = self.stop.notified();
        tokio::pin!(stop);
        // Registered before the scan is visible, so an early cancel still wakes it
        stop.as_mut().enable();
        self.scanning.store(true, Ordering::SeqCst);

        let outcome = tokio::select! {
            output = work => Some(output),
            _ = stop => None,
        };
        self.scanning.store(false, Ordering::SeqCst);
        outcome
    }

    async fn inspect(&self, device: &Device) -> Option<NearbyDevice> {
        let name = device.name().await.ok().flatten();
        if let Some(ref prefix) = self.config.name_prefix {
            if !name.as_deref().is_some_and(|name| name.starts_with(prefix)) {
                return None;
            }
        }
        Some(NearbyDevice {
            address: device.address(),
            name,
            rssi: device.rssi().await.ok().flatten(),
        })
    }
}

/// Strongest signal first; devices without a reading go last
fn sort_by_signal(devices: &mut [NearbyDevice]) {
    devices.sort_by(|a, b| {
        let rssi_a = a.rssi.unwrap_or(i16::MIN);
        let rssi_b = b.rssi.unwrap_or(i16::MIN);
        rssi_b.cmp(&rssi_a)
    });
}
