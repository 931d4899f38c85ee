// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - persistent configuration.
//!
//! `CONFIG` is the single source of configuration truth.  Mutations go
//! through the async mutex; [`WrappedConfig::update_flash`] signals the
//! main task to serialise the current state to flash.

use alloc::string::String;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::once_lock::OnceLock;
use serde::{Deserialize, Serialize};

use nightjar_ble::central::DEFAULT_PASSKEY;
use nightjar_swd::protocol::Speed;

use crate::CONFIG_STORE_SIGNAL;

/// Global configuration handle.
pub static CONFIG: WrappedConfig = WrappedConfig::new();

/// WiFi station credentials.  The build-time values seed the very first
/// boot; the stored config wins afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::from(option_env!("SSID").unwrap_or("")),
            password: String::from(option_env!("PASSWORD").unwrap_or("")),
        }
    }
}

/// SWD settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwdConfig {
    pub speed: Speed,
    /// Poll the target with IDCODE reads while a session is up
    pub keepalive: bool,
}

impl Default for SwdConfig {
    fn default() -> Self {
        Self {
            speed: Speed::default(),
            keepalive: true,
        }
    }
}

/// BLE bridge settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BleConfig {
    /// Fixed passkey injected when the peer requests PIN entry
    pub passkey: u32,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            passkey: DEFAULT_PASSKEY,
        }
    }
}

/// Target power rail settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Rail polarity is board-specific: true means driving the control
    /// GPIO low turns the rail on.  Check the schematic, not the code.
    pub active_low: bool,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self { active_low: true }
    }
}

/// Everything nightjar persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wifi: WifiConfig,
    pub swd: SwdConfig,
    pub ble: BleConfig,
    pub power: PowerConfig,
    /// Human-readable description of the last fatal error, for the UI
    pub last_error: Option<String>,
}

impl Config {
    /// Queue the current state for persistence.  The main task owns the
    /// flash driver and drains the signal.
    pub fn update_flash(&self) {
        CONFIG_STORE_SIGNAL.signal(());
    }
}

/// Lazily-initialised global wrapper, in the spirit of a OnceLock of an
/// async Mutex.
pub struct WrappedConfig {
    inner: OnceLock<Mutex<CriticalSectionRawMutex, Config>>,
}

impl WrappedConfig {
    const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Install the configuration loaded from flash.  Called once during
    /// bring-up, before any task reads it.
    pub fn init(&self, config: Config) {
        if self.inner.init(Mutex::new(config)).is_err() {
            // Double init is a bring-up bug, not a runtime condition
            log::error!("Error: CONFIG initialised twice");
        }
    }

    /// Get the configuration mutex, waiting for bring-up to install it.
    pub async fn get(&self) -> &Mutex<CriticalSectionRawMutex, Config> {
        self.inner.get().await
    }

    /// Convenience: lock and clone the current state.
    pub async fn snapshot(&self) -> Config {
        self.get().await.lock().await.clone()
    }

    /// Convenience: lock for mutation.
    pub async fn lock(&self) -> MutexGuard<'_, CriticalSectionRawMutex, Config> {
        self.get().await.lock().await
    }
}
