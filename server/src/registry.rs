//! Device registry: known devices, their last address and liveness.
//!
//! Records are keyed by the client-generated `device_id`, so repeated
//! registrations and heartbeats only ever refresh a single entry. Nothing is
//! hard-deleted: an explicit unregister retires the record, and silence longer
//! than the liveness window makes it read as offline. `online` is computed at
//! query time, there is no background expiry pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::envelope::now_ms;
use crate::error::RelayError;

/// Body of `POST /register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub email: String,
    pub device_name: String,
    #[serde(default)]
    pub local_ip: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

/// Snapshot of a device as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub email: String,
    pub device_name: String,
    pub local_ip: Option<String>,
    pub port: u16,
    /// Unix ms of the last registration or heartbeat.
    pub last_seen_ms: u64,
    pub last_seen_ago_ms: u64,
    pub registered_at_ms: u64,
    pub online: bool,
}

struct DeviceEntry {
    email: String,
    device_name: String,
    local_ip: Option<String>,
    port: u16,
    last_seen: Instant,
    last_seen_ms: u64,
    registered_at_ms: u64,
    /// Set by explicit unregister, cleared by the next register/heartbeat.
    retired: bool,
}

/// Authoritative `device_id → record` map.
#[derive(Clone)]
pub struct Registry {
    devices: Arc<RwLock<HashMap<String, DeviceEntry>>>,
    liveness_window: Duration,
}

impl Registry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            devices: Arc::new(RwLock::new(HashMap::new())),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Insert or overwrite a device record and mark it seen now.
    pub async fn register(&self, req: RegisterRequest) -> DeviceRecord {
        let now = Instant::now();
        let wall = now_ms();
        let mut devices = self.devices.write().await;
        let registered_at_ms = devices
            .get(&req.device_id)
            .map_or(wall, |d| d.registered_at_ms);
        let existed = devices.contains_key(&req.device_id);
        let entry = DeviceEntry {
            email: req.email,
            device_name: req.device_name,
            local_ip: req.local_ip,
            port: req.port,
            last_seen: now,
            last_seen_ms: wall,
            registered_at_ms,
            retired: false,
        };
        let record = self.snapshot(&req.device_id, &entry, now);
        devices.insert(req.device_id.clone(), entry);
        if existed {
            info!(device_id = %req.device_id, "Device re-registered");
        } else {
            info!(device_id = %req.device_id, email = %record.email, "Device registered");
        }
        record
    }

    /// Refresh liveness. The address only changes when one is supplied.
    pub async fn heartbeat(
        &self,
        device_id: &str,
        local_ip: Option<String>,
        port: Option<u16>,
    ) -> Result<DeviceRecord, RelayError> {
        let now = Instant::now();
        let mut devices = self.devices.write().await;
        let Some(entry) = devices.get_mut(device_id) else {
            warn!(device_id, "Heartbeat from unknown device, it should re-register");
            return Err(RelayError::UnknownDevice(device_id.to_string()));
        };
        entry.last_seen = now;
        entry.last_seen_ms = now_ms();
        entry.retired = false;
        if local_ip.is_some() {
            entry.local_ip = local_ip;
        }
        if let Some(p) = port {
            entry.port = p;
        }
        Ok(self.snapshot(device_id, entry, now))
    }

    /// Retire a device immediately. Returns `false` if it was never registered.
    pub async fn unregister(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(device_id) {
            Some(entry) => {
                entry.retired = true;
                info!(device_id, "Device unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        let now = Instant::now();
        let devices = self.devices.read().await;
        devices.get(device_id).map(|e| self.snapshot(device_id, e, now))
    }

    /// `Ok(())` if the device is registered and live, otherwise the reason.
    pub async fn check_online(&self, device_id: &str) -> Result<(), RelayError> {
        match self.get(device_id).await {
            None => Err(RelayError::UnknownDevice(device_id.to_string())),
            Some(d) if !d.online => Err(RelayError::DeviceOffline(device_id.to_string())),
            Some(_) => Ok(()),
        }
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    pub async fn list_by_email(&self, email: &str) -> Vec<DeviceRecord> {
        let now = Instant::now();
        let devices = self.devices.read().await;
        let mut list: Vec<DeviceRecord> = devices
            .iter()
            .filter(|(_, e)| e.email == email)
            .map(|(id, e)| self.snapshot(id, e, now))
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub async fn list_all(&self) -> Vec<DeviceRecord> {
        let now = Instant::now();
        let devices = self.devices.read().await;
        let mut list: Vec<DeviceRecord> = devices
            .iter()
            .map(|(id, e)| self.snapshot(id, e, now))
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    /// `(total, online)` device counts.
    pub async fn counts(&self) -> (usize, usize) {
        let now = Instant::now();
        let devices = self.devices.read().await;
        let online = devices.values().filter(|e| self.is_live(e, now)).count();
        (devices.len(), online)
    }

    fn is_live(&self, entry: &DeviceEntry, now: Instant) -> bool {
        !entry.retired && now.saturating_duration_since(entry.last_seen) < self.liveness_window
    }

    fn snapshot(&self, device_id: &str, entry: &DeviceEntry, now: Instant) -> DeviceRecord {
        #[allow(clippy::cast_possible_truncation)]
        let ago_ms = now.saturating_duration_since(entry.last_seen).as_millis() as u64;
        DeviceRecord {
            device_id: device_id.to_string(),
            email: entry.email.clone(),
            device_name: entry.device_name.clone(),
            local_ip: entry.local_ip.clone(),
            port: entry.port,
            last_seen_ms: entry.last_seen_ms,
            last_seen_ago_ms: ago_ms,
            registered_at_ms: entry.registered_at_ms,
            online: self.is_live(entry, now),
        }
    }
}
