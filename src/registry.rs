//! Registry of configured devices.
//!
//! The registry holds one immutable [`DeviceSnapshot`] at a time. Loading a
//! device file builds a complete new snapshot before touching the registry,
//! then swaps it in under the write lock. A failed load leaves the current
//! snapshot untouched.
//!
//! Lookups return [`DeviceHandle`]s, so a request that resolved a device
//! keeps using that instance even if a reload replaces it meanwhile. Devices
//! dropped by a reload close their drivers once the last handle is gone.

use crate::config_file::parse_devices;
use crate::device::{Device, DeviceHandle};
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One complete, immutable device set.
#[derive(Debug, Default)]
pub struct DeviceSnapshot {
    source: Option<String>,
    devices: BTreeMap<String, DeviceHandle>,
}

impl DeviceSnapshot {
    /// Parse a device file body. No driver is opened.
    pub fn parse(source_name: &str, text: &str) -> Result<Self, ConfigError> {
        let mut devices = BTreeMap::new();
        for record in parse_devices(source_name, text)? {
            let device = Device::new(record.name.clone(), record.config)
                .map_err(|e| ConfigError::at(source_name, record.line, e.to_string()))?;
            devices.insert(record.name, Arc::new(device));
        }
        Ok(Self {
            source: Some(source_name.to_string()),
            devices,
        })
    }

    /// Label of the configuration this snapshot came from.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Device by name.
    pub fn get(&self, name: &str) -> Option<DeviceHandle> {
        self.devices.get(name).cloned()
    }

    /// Sorted device names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// All devices, sorted by name.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.values()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no device is configured.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Name to device mapping with atomic whole-set replacement.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    current: RwLock<Arc<DeviceSnapshot>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a device file, replacing all devices on success.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let source_name = path.display().to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::unreadable(&source_name, &e))?;
        self.load_str(&source_name, &text).await
    }

    /// Load device records from memory, replacing all devices on success.
    pub async fn load_str(&self, source_name: &str, text: &str) -> Result<(), ConfigError> {
        let snapshot = match DeviceSnapshot::parse(source_name, text) {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!("{}", e);
                return Err(e);
            }
        };
        info!(
            source = source_name,
            devices = snapshot.len(),
            "Device configuration loaded"
        );
        let old = {
            let mut guard = self.current.write().await;
            std::mem::replace(&mut *guard, snapshot)
        };
        // dropping the last handle may close drivers, which can block
        if let Err(e) = tokio::task::spawn_blocking(move || drop(old)).await {
            warn!("Failed to release old devices: {}", e);
        }
        Ok(())
    }

    /// Device by name in the current snapshot.
    pub async fn lookup(&self, name: &str) -> Option<DeviceHandle> {
        self.current.read().await.get(name)
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Arc<DeviceSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Sorted names of the current devices.
    pub async fn device_names(&self) -> Vec<String> {
        self.snapshot().await.names().map(str::to_string).collect()
    }

    /// Number of current devices.
    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }

    /// True when no device is configured.
    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_empty()
    }
}
