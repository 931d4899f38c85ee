// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! WiFi station helper.
//!
//! Brings the station interface up, keeps it associated, and runs the
//! network stack.  The firmware gets back a [`Wifi`] handle carrying the
//! `embassy-net` stack to open sockets on.

use alloc::string::String;
use embassy_executor::Spawner;
use embassy_net::{Runner, Stack, StackResources, StaticConfigV4};
use embassy_time::{Duration, Timer};
use esp_hal::peripherals::WIFI;
use esp_hal::rng::Rng;
use esp_wifi::EspWifiController;
use esp_wifi::wifi::{
    ClientConfiguration, Configuration, WifiController, WifiDevice, WifiEvent, WifiState,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_cell::make_static;

// Pause between association attempts after a failure or disconnect
const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

// Poll interval while waiting for link / address
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Sockets the stack is provisioned for.  HTTP pool + proxy pool + BLE
/// bridge + DHCP + spare.
pub const STACK_SOCKETS: usize = 12;

/// WiFi bring-up failures
#[derive(Debug)]
pub enum Error {
    /// Interface creation failed
    Interface,
}

/// Station credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

/// A running WiFi station and its network stack.
pub struct Wifi {
    stack: Stack<'static>,
}

impl Wifi {
    /// Create the station interface on an already-initialised esp-wifi
    /// controller (the BLE stack shares the same controller), spawn the
    /// connection and stack runner tasks, and return the handle.  The
    /// station associates in the background; use [`Self::wait_for_ipv4`]
    /// before opening sockets.
    pub fn start(
        spawner: &Spawner,
        esp_wifi_ctrl: &'static EspWifiController<'static>,
        wifi: WIFI<'static>,
        mut rng: Rng,
        credentials: Credentials,
    ) -> Result<Wifi, Error> {
        let seed = (rng.random() as u64) << 32 | rng.random() as u64;

        let (controller, interfaces) = esp_wifi::wifi::new(esp_wifi_ctrl, wifi).map_err(|e| {
            error!("Error: WiFi interface creation failed: {e:?}");
            Error::Interface
        })?;

        let config = embassy_net::Config::dhcpv4(Default::default());
        let resources = make_static!(StackResources::<STACK_SOCKETS>::new());
        let (stack, runner) = embassy_net::new(interfaces.sta, config, resources, seed);

        spawner.must_spawn(connection_task(controller, credentials));
        spawner.must_spawn(net_task(runner));

        Ok(Wifi { stack })
    }

    /// The network stack, for opening sockets.
    pub fn stack(&self) -> Stack<'static> {
        self.stack
    }

    /// Wait until the link is up (associated and authenticated).
    pub async fn wait_for_link_up(&self) {
        loop {
            if self.stack.is_link_up() {
                return;
            }
            Timer::after(WAIT_POLL).await;
        }
    }

    /// Wait for a DHCP lease; returns the address configuration.
    pub async fn wait_for_ipv4(&self) -> StaticConfigV4 {
        loop {
            if let Some(config) = self.stack.config_v4() {
                return config;
            }
            Timer::after(WAIT_POLL).await;
        }
    }
}

// Keeps the station associated.  esp-wifi surfaces disconnects as events;
// on each one, wait out the backoff and reconnect.
#[embassy_executor::task]
async fn connection_task(mut controller: WifiController<'static>, credentials: Credentials) {
    debug!("Exec:  WiFi connection task started");

    loop {
        if esp_wifi::wifi::wifi_state() == WifiState::StaConnected {
            // Associated - park until the link drops
            controller.wait_for_event(WifiEvent::StaDisconnected).await;
            warn!("Note:  WiFi disconnected");
            Timer::after(RECONNECT_DELAY).await;
        }

        if !matches!(controller.is_started(), Ok(true)) {
            let config = Configuration::Client(ClientConfiguration {
                ssid: credentials.ssid.clone(),
                password: credentials.password.clone(),
                ..Default::default()
            });
            if let Err(e) = controller.set_configuration(&config) {
                error!("Error: WiFi configuration failed: {e:?}");
                Timer::after(RECONNECT_DELAY).await;
                continue;
            }
            if let Err(e) = controller.start_async().await {
                error!("Error: WiFi start failed: {e:?}");
                Timer::after(RECONNECT_DELAY).await;
                continue;
            }
            info!("OK:    WiFi started");
        }

        match controller.connect_async().await {
            Ok(()) => info!("OK:    WiFi associated"),
            Err(e) => {
                warn!("Note:  WiFi association failed: {e:?}");
                Timer::after(RECONNECT_DELAY).await;
            }
        }
    }
}

// Drives the smoltcp stack.
#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}
