//! Persistent associated device storage.
//!
//! This module defines the [`DeviceStorage`] contract the connection layer
//! relies on, and a thread-safe JSON implementation. Each associated device
//! has a record plus a 32-byte challenge secret used to prove its identity on
//! reconnect. The store persists to
//! `~/.local/share/companion/associated_devices.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use companion_protocol::crypto::{hmac_sha256, CHALLENGE_SECRET_LENGTH};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by device storage.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("device {0} is not associated")]
    NotFound(Uuid),

    #[error("challenge secret must be {expected} bytes, got {got}")]
    InvalidSecretLength { expected: usize, got: usize },

    #[error("no challenge secret stored for device {0}")]
    MissingSecret(Uuid),

    #[error("failed to persist device store: {0}")]
    Persistence(String),
}

/// A device that completed association with this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociatedDevice {
    /// The device's stable identifier.
    pub id: Uuid,
    /// Transport address last used by the device.
    #[serde(default)]
    pub address: String,
    /// Human-readable name for the device.
    #[serde(default)]
    pub name: String,
    /// Whether the host should connect to this device automatically.
    pub connection_enabled: bool,
    /// Head unit user that owns the device.
    pub user_id: i32,
    /// Operating system reported by the device.
    #[serde(default)]
    pub os_name: Option<String>,
    /// Operating system version reported by the device.
    #[serde(default)]
    pub os_version: Option<String>,
}

impl AssociatedDevice {
    /// Creates an enabled record owned by `user_id`.
    pub fn new(id: Uuid, user_id: i32) -> Self {
        Self {
            id,
            address: String::new(),
            name: String::new(),
            connection_enabled: true,
            user_id,
            os_name: None,
            os_version: None,
        }
    }
}

/// Storage collaborator used by the connection controller and negotiator.
pub trait DeviceStorage: Send + Sync {
    /// Computes `HMAC-SHA256(secret(device_id), value)`.
    fn hash_with_challenge_secret(
        &self,
        device_id: &Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>, StorageError>;

    /// Stores the challenge secret for a device, replacing any previous one.
    fn save_challenge_secret(&self, device_id: Uuid, secret: &[u8]) -> Result<(), StorageError>;

    /// Adds or replaces an associated device record.
    fn add_associated_device(&self, device: AssociatedDevice) -> Result<(), StorageError>;

    /// Looks up an associated device.
    fn associated_device(&self, device_id: &Uuid) -> Result<Option<AssociatedDevice>, StorageError>;

    /// Lists every associated device.
    fn associated_devices(&self) -> Result<Vec<AssociatedDevice>, StorageError>;

    /// Removes a device and its secret. Returns the removed record.
    fn remove_associated_device(
        &self,
        device_id: &Uuid,
    ) -> Result<Option<AssociatedDevice>, StorageError>;

    /// Enables or disables automatic connection for a device.
    fn set_connection_enabled(&self, device_id: &Uuid, enabled: bool) -> Result<(), StorageError>;
}

/// Serde support for challenge secrets (serializes as base64).
mod secret_serde {
    use companion_protocol::crypto::CHALLENGE_SECRET_LENGTH;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(
        secret: &[u8; CHALLENGE_SECRET_LENGTH],
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(secret);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; CHALLENGE_SECRET_LENGTH], D::Error>
    where
        D: Deserializer<'de>,
    {
        use base64::Engine;
        let encoded: String = Deserialize::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)?;
        if bytes.len() != CHALLENGE_SECRET_LENGTH {
            return Err(serde::de::Error::custom(format!(
                "invalid challenge secret length: expected {}, got {}",
                CHALLENGE_SECRET_LENGTH,
                bytes.len()
            )));
        }
        let mut arr = [0u8; CHALLENGE_SECRET_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

/// A stored challenge secret.
#[derive(Clone, Serialize, Deserialize)]
struct SecretEntry {
    device_id: Uuid,
    #[serde(with = "secret_serde")]
    secret: [u8; CHALLENGE_SECRET_LENGTH],
}

/// Wrapper for serializing the device store.
#[derive(Serialize, Deserialize)]
struct DeviceStoreData {
    /// Version of the store format.
    version: u32,
    devices: Vec<AssociatedDevice>,
    #[serde(default)]
    secrets: Vec<SecretEntry>,
}

#[derive(Default)]
struct StoreState {
    devices: HashMap<Uuid, AssociatedDevice>,
    secrets: HashMap<Uuid, [u8; CHALLENGE_SECRET_LENGTH]>,
}

/// JSON-file-backed [`DeviceStorage`].
///
/// Every mutation is written through to disk with an atomic rename. A store
/// created with [`JsonDeviceStore::in_memory`] never touches the filesystem.
pub struct JsonDeviceStore {
    /// The path to the JSON file, if persistent.
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
}

/// Returns the default device store path.
pub fn default_device_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("companion")
        .join("associated_devices.json")
}

impl JsonDeviceStore {
    /// Creates a store that persists to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Creates a store that only lives in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Creates a store at `path` and loads it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Returns the path to the store file, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the store from the JSON file.
    ///
    /// If the file does not exist, the store will be empty.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Device store not found, starting empty");
            return Ok(());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read device store: {}", path.display()))?;

        let data: DeviceStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse device store: {}", path.display()))?;

        let mut state = self.state.write();
        state.devices = data.devices.into_iter().map(|d| (d.id, d)).collect();
        state.secrets = data
            .secrets
            .into_iter()
            .map(|entry| (entry.device_id, entry.secret))
            .collect();

        tracing::info!(
            count = state.devices.len(),
            path = %path.display(),
            "Loaded associated devices"
        );
        Ok(())
    }

    /// Saves the store to the JSON file.
    ///
    /// Uses atomic write (write to temp file, then rename) to prevent corruption.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create device store directory: {}", parent.display())
            })?;
        }

        let contents = {
            let state = self.state.read();
            let mut devices: Vec<_> = state.devices.values().cloned().collect();
            devices.sort_by_key(|d| d.id);
            let mut secrets: Vec<_> = state
                .secrets
                .iter()
                .map(|(device_id, secret)| SecretEntry {
                    device_id: *device_id,
                    secret: *secret,
                })
                .collect();
            secrets.sort_by_key(|entry| entry.device_id);

            let data = DeviceStoreData {
                version: 1,
                devices,
                secrets,
            };
            serde_json::to_string_pretty(&data).context("Failed to serialize device store")?
        };

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp device store: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename temp device store {} to {}",
                temp_path.display(),
                path.display()
            )
        })?;

        tracing::debug!(path = %path.display(), "Saved device store");
        Ok(())
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.save()
            .map_err(|e| StorageError::Persistence(format!("{:#}", e)))
    }
}

impl DeviceStorage for JsonDeviceStore {
    fn hash_with_challenge_secret(
        &self,
        device_id: &Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>, StorageError> {
        let state = self.state.read();
        let secret = state
            .secrets
            .get(device_id)
            .ok_or(StorageError::MissingSecret(*device_id))?;
        Ok(hmac_sha256(secret, value))
    }

    fn save_challenge_secret(&self, device_id: Uuid, secret: &[u8]) -> Result<(), StorageError> {
        let secret = <[u8; CHALLENGE_SECRET_LENGTH]>::try_from(secret).map_err(|_| {
            StorageError::InvalidSecretLength {
                expected: CHALLENGE_SECRET_LENGTH,
                got: secret.len(),
            }
        })?;

        self.state.write().secrets.insert(device_id, secret);
        tracing::debug!(device_id = %device_id, "Stored challenge secret");
        self.persist()
    }

    fn add_associated_device(&self, device: AssociatedDevice) -> Result<(), StorageError> {
        tracing::info!(
            device_id = %device.id,
            name = %device.name,
            user_id = device.user_id,
            "Adding associated device"
        );
        self.state.write().devices.insert(device.id, device);
        self.persist()
    }

    fn associated_device(
        &self,
        device_id: &Uuid,
    ) -> Result<Option<AssociatedDevice>, StorageError> {
        Ok(self.state.read().devices.get(device_id).cloned())
    }

    fn associated_devices(&self) -> Result<Vec<AssociatedDevice>, StorageError> {
        let mut devices: Vec<_> = self.state.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(devices)
    }

    fn remove_associated_device(
        &self,
        device_id: &Uuid,
    ) -> Result<Option<AssociatedDevice>, StorageError> {
        let removed = {
            let mut state = self.state.write();
            state.secrets.remove(device_id);
            state.devices.remove(device_id)
        };
        if let Some(device) = &removed {
            tracing::info!(
                device_id = %device.id,
                name = %device.name,
                "Removed associated device"
            );
        }
        self.persist()?;
        Ok(removed)
    }

    fn set_connection_enabled(&self, device_id: &Uuid, enabled: bool) -> Result<(), StorageError> {
        {
            let mut state = self.state.write();
            let device = state
                .devices
                .get_mut(device_id)
                .ok_or(StorageError::NotFound(*device_id))?;
            tracing::info!(device_id = %device_id, enabled, "Changing connection enabled flag");
            device.connection_enabled = enabled;
        }
        self.persist()
    }
}
