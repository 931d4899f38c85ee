// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - WiFi nRF52 field programmer with a BLE serial bridge.
//!
//! Attaches to an nRF52 target over bit-banged SWD, exposes identify /
//! verify / erase / program / unlock operations over HTTP on the WiFi
//! station interface, and tunnels a paired BLE serial peripheral (Nordic
//! UART or Meshtastic) to TCP clients on port 4403.
//!
//! To use, set the SSID and PASSWORD environment variables at build time
//! (the stored configuration wins on later boots), then build and flash.
//!
//! Features:
//! - `httpd`: the HTTP control surface (port 80).
//! - `ble`: the BLE central bridge.
//! - `proxy`: the TCP fan-out proxy (port 4403; requires `ble`).
//!
//! Pin assignment (see the board schematic):
//! - GPIO4 SWCLK, GPIO3 SWDIO, GPIO5 target nRESET
//! - GPIO6 target power rail MOSFET (polarity from configuration)

#![no_std]
#![no_main]
#![feature(type_alias_impl_trait)]
#![feature(impl_trait_in_assoc_type)]

extern crate alloc;

use embassy_executor::Spawner;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use esp_alloc as _;
use esp_backtrace as _;
use esp_hal::{clock::CpuClock, timer::timg::TimerGroup};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_cell::make_static;

use nightjar_util::net::{Credentials, Wifi};

#[cfg(feature = "ble")]
mod ble;
mod config;
mod error;
mod flash;
mod http;
mod power;
#[cfg(feature = "proxy")]
mod proxy;
mod target;
mod upload;

use config::CONFIG;
use power::PowerRail;

esp_bootloader_esp_idf::esp_app_desc!();

/// Heap size for the application.  The WiFi and BLE stacks are the big
/// consumers.
pub const HEAP_SIZE: usize = 96 * 1024;

/// Signalled by `Config::update_flash()`; the main loop owns the flash
/// driver and performs the store.
pub static CONFIG_STORE_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Signalled by anything that needs a clean firmware restart.
pub static REBOOT_SIGNAL: Signal<CriticalSectionRawMutex, ()> = Signal::new();

// Health-monitor cadence
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[esp_hal_embassy::main]
async fn main(spawner: Spawner) -> ! {
    // Logger first, so bring-up is visible
    esp_println::logger::init_logger_from_env();

    info!("*** nightjar ***");

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    esp_alloc::heap_allocator!(size: HEAP_SIZE);

    let timg1 = TimerGroup::new(peripherals.TIMG1);
    esp_hal_embassy::init(timg1.timer0);

    // Load configuration before anything consults it
    let mut flash = flash::Flash::new();
    flash.load_config();
    let boot_config = CONFIG.snapshot().await;

    // Target power rail comes up first so the nRF52 is alive before any
    // SWD attempt
    let rail = PowerRail::new(peripherals.GPIO6, boot_config.power.active_low);
    power::POWER.lock().await.replace(rail);

    // The SWD target task owns its pins for the firmware's lifetime
    let swd = target::Target::new(
        boot_config.swd.speed,
        boot_config.swd.keepalive,
        peripherals.GPIO3,
        peripherals.GPIO4,
        Some(peripherals.GPIO5),
    );
    let target_sender = swd.request_sender();
    let swd = make_static!(swd);
    spawner.must_spawn(target::task(swd));

    // One esp-wifi controller serves both radios: WiFi station and the
    // BLE host
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let rng = esp_hal::rng::Rng::new(peripherals.RNG);
    let esp_wifi_ctrl = match esp_wifi::init(timg0.timer0, rng) {
        Ok(ctrl) => Some(&*make_static!(ctrl)),
        Err(e) => {
            error!("Error: esp-wifi init failed: {e:?} - radio surfaces disabled");
            None
        }
    };

    let wifi = esp_wifi_ctrl.and_then(|ctrl| {
        match Wifi::start(
            &spawner,
            ctrl,
            peripherals.WIFI,
            rng,
            Credentials {
                ssid: boot_config.wifi.ssid.clone(),
                password: boot_config.wifi.password.clone(),
            },
        ) {
            Ok(wifi) => Some(wifi),
            Err(e) => {
                error!("Error: WiFi bring-up failed: {e:?} - network surfaces disabled");
                None
            }
        }
    });

    #[cfg(feature = "ble")]
    if let Some(ctrl) = esp_wifi_ctrl {
        spawner.must_spawn(ble::trouble::task(
            ctrl,
            peripherals.BT,
            boot_config.ble.passkey,
        ));
    }

    if let Some(wifi) = wifi {
        wifi.wait_for_link_up().await;
        let net_config = wifi.wait_for_ipv4().await;
        info!("OK:    Network up at {}", net_config.address);

        if cfg!(feature = "httpd") {
            http::start(wifi.stack(), target_sender, &spawner).await;
        }

        #[cfg(feature = "proxy")]
        proxy::start(wifi.stack(), &spawner);
    }

    spawner.must_spawn(health_task());

    // The main task becomes the storage task: it owns the flash driver
    // and drains store/reboot signals
    loop {
        match select(CONFIG_STORE_SIGNAL.wait(), REBOOT_SIGNAL.wait()).await {
            Either::First(()) => {
                info!("Exec:  Store config to flash");
                flash.store_config().await;
            }
            Either::Second(()) => {
                info!("Exec:  Rebooting in 1 second");
                Timer::after(Duration::from_secs(1)).await;
                esp_hal::system::software_reset();
            }
        }
    }
}

// Periodic liveness line: uptime and heap headroom.
#[embassy_executor::task]
async fn health_task() {
    loop {
        Timer::after(HEALTH_INTERVAL).await;
        let uptime = Instant::now().as_secs();
        info!(
            "Note:  up {uptime}s, heap free {} bytes",
            esp_alloc::HEAP.free()
        );
    }
}
