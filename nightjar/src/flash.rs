// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - configuration persistence.
//!
//! The config lives as one JSON blob in a dedicated region of the ESP32's
//! own flash, behind a small header (magic, length, checksum).  This is
//! the firmware's only persistent key-value state; nothing owned by the
//! SWD or BLE cores is stored.

use alloc::vec;
use embedded_storage::{ReadStorage, Storage};
use esp_storage::FlashStorage;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::config::{CONFIG, Config};

// A spare data partition well clear of the app image
const CONFIG_OFFSET: u32 = 0x0031_0000;

// Header: magic, version, payload length, payload sum
const MAGIC: u32 = 0x4E4A_4346; // "NJCF"
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

// One sector is more than enough for the config JSON
const MAX_PAYLOAD: usize = 4096 - HEADER_LEN;

/// Configuration storage driver.  Owned by the main task.
pub struct Flash {
    storage: FlashStorage,
}

impl Flash {
    pub fn new() -> Self {
        Self {
            storage: FlashStorage::new(),
        }
    }

    /// Load the stored configuration into `CONFIG`, falling back to
    /// defaults on first boot or corruption.
    pub fn load_config(&mut self) {
        let config = match self.read_config() {
            Some(config) => {
                info!("OK:    Configuration loaded from flash");
                config
            }
            None => {
                info!("Note:  No stored configuration - using defaults");
                Config::default()
            }
        };
        CONFIG.init(config);
    }

    fn read_config(&mut self) -> Option<Config> {
        let mut header = [0u8; HEADER_LEN];
        self.storage.read(CONFIG_OFFSET, &mut header).ok()?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let stored_sum = u32::from_le_bytes(header[12..16].try_into().unwrap());

        if magic != MAGIC || version != VERSION || len == 0 || len > MAX_PAYLOAD {
            return None;
        }

        let mut payload = vec![0u8; len];
        self.storage
            .read(CONFIG_OFFSET + HEADER_LEN as u32, &mut payload)
            .ok()?;

        if checksum(&payload) != stored_sum {
            warn!("Note:  Stored configuration failed its checksum");
            return None;
        }

        match serde_json::from_slice(&payload) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Note:  Stored configuration unparseable: {e}");
                None
            }
        }
    }

    /// Serialise the current `CONFIG` state and write it out.
    pub async fn store_config(&mut self) {
        let config = CONFIG.snapshot().await;
        let payload = match serde_json::to_vec(&config) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Error: Config serialisation failed: {e}");
                return;
            }
        };
        if payload.len() > MAX_PAYLOAD {
            error!("Error: Config too large to store ({} bytes)", payload.len());
            return;
        }

        let mut record = vec![0u8; HEADER_LEN + payload.len()];
        record[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        record[4..8].copy_from_slice(&VERSION.to_le_bytes());
        record[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        record[12..16].copy_from_slice(&checksum(&payload).to_le_bytes());
        record[HEADER_LEN..].copy_from_slice(&payload);

        match self.storage.write(CONFIG_OFFSET, &record) {
            Ok(()) => info!("OK:    Configuration stored ({} bytes)", payload.len()),
            Err(e) => error!("Error: Config store failed: {e:?}"),
        }
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| {
        acc.rotate_left(5).wrapping_add(b as u32)
    })
}
