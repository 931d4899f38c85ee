// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - target power rail.
//!
//! The target's supply is switched by a MOSFET on one GPIO.  Which level
//! turns the rail on depends on the board's schematic, so polarity comes
//! from configuration, never from a hard-coded convention.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Timer};
use esp_hal::gpio::{DriveMode, Level, Output, OutputConfig, OutputPin};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::NightjarError;

/// The board's rail handle, installed during bring-up.  HTTP handlers
/// reach it through [`execute`].
pub static POWER: Mutex<CriticalSectionRawMutex, Option<PowerRail<'static>>> = Mutex::new(None);

/// Rail operations the HTTP surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    On,
    Off,
    Reboot,
}

/// Run one rail operation under the shared handle.
pub async fn execute(request: Request) -> Result<&'static str, NightjarError> {
    let mut guard = POWER.lock().await;
    let Some(rail) = guard.as_mut() else {
        return Err(NightjarError::InvalidState("no power rail configured"));
    };
    match request {
        Request::On => {
            rail.on();
            Ok("target power on")
        }
        Request::Off => {
            rail.off();
            Ok("target power off")
        }
        Request::Reboot => {
            rail.reboot().await;
            Ok("target power cycled")
        }
    }
}

// How long the rail stays off during a reboot - long enough for every
// capacitor on the target board to drain
const REBOOT_OFF_TIME: Duration = Duration::from_secs(15);

// Settle time after turning the rail back on
const POWER_ON_SETTLE: Duration = Duration::from_millis(200);

/// The switched target power rail.
pub struct PowerRail<'a> {
    pin: Output<'a>,
    active_low: bool,
    on: bool,
}

impl<'a> PowerRail<'a> {
    /// Take the control pin and turn the rail on.
    pub fn new(pin: impl OutputPin + 'a, active_low: bool) -> Self {
        let initial = if active_low { Level::Low } else { Level::High };
        let config = OutputConfig::default().with_drive_mode(DriveMode::PushPull);
        let pin = Output::new(pin, initial, config);
        info!(
            "OK:    Target rail on (control pin {}, {} = on)",
            if active_low { "low" } else { "high" },
            if active_low { "low" } else { "high" },
        );
        Self {
            pin,
            active_low,
            on: true,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn on(&mut self) {
        self.set(true);
        info!("OK:    Target power on");
    }

    pub fn off(&mut self) {
        self.set(false);
        info!("OK:    Target power off");
    }

    /// Full power cycle: off, drain, on, settle.
    pub async fn reboot(&mut self) {
        info!("Exec:  Target power cycle ({} s off)", REBOOT_OFF_TIME.as_secs());
        self.set(false);
        Timer::after(REBOOT_OFF_TIME).await;
        self.set(true);
        Timer::after(POWER_ON_SETTLE).await;
        info!("OK:    Target power cycle complete");
    }

    fn set(&mut self, on: bool) {
        let level = match (on, self.active_low) {
            (true, true) | (false, false) => Level::Low,
            (true, false) | (false, true) => Level::High,
        };
        self.pin.set_level(level);
        self.on = on;
    }
}
