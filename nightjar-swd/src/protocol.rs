// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! SWD wire protocol.
//!
//! Bit-bangs SWCLK/SWDIO on two GPIOs.  Data changes on the falling clock
//! edge and is sampled on the rising edge; SWCLK is always host-driven,
//! SWDIO changes hands at turnaround cycles.  `SwdProtocol` tracks which
//! side currently drives SWDIO so a turnaround is inserted exactly once
//! per direction change.
//!
//! A raw transaction contains no await points, and the transaction layer
//! runs each one inside a critical section so not even an interrupt can
//! stretch the clock mid-frame.

use embassy_time::{Duration, Timer};
use esp_hal::gpio::{
    DriveMode, DriveStrength, Flex, InputConfig, InputPin, Level, Output, OutputConfig, OutputPin,
    Pull,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::arm::Ack;

// JTAG-to-SWD select sequence, already bit-reversed for LSB-first
// transmission (documented MSB-first form is 0x79E7)
const JTAG_TO_SWD_SEQUENCE: u16 = 0xE79E;

// 128-bit dormant-exit selection alert, sent MSB-first per word
const SELECTION_ALERT_SEQUENCE: [u32; 4] = [0x49CF_9046, 0xA9B4_A161, 0x97F5_BBC7, 0x4570_3D98];

// SWD activation code after the selection alert, sent MSB-first
const SWD_ACTIVATION_CODE: u8 = 0x58;

// 50+ clock cycles with SWDIO high for a line reset
const LINE_RESET_HIGH_CYCLES: u32 = 56;

// 8+ cycles with SWDIO high to begin dormant exit
const DORMANT_EXIT_HIGH_CYCLES: u32 = 8;

// 4 cycles with SWDIO low after the selection alert
const DORMANT_EXIT_LOW_CYCLES: u32 = 4;

// nRESET pulse and post-release settle times
const NRESET_ASSERT: Duration = Duration::from_millis(10);
const NRESET_SETTLE: Duration = Duration::from_millis(50);

/// SWD clock speed setting.  Inter-edge delay is a busy-wait cycle count,
/// so the achieved frequency depends on the CPU clock; the figures are for
/// a 160 MHz ESP32-C3 and stay well under the nRF52's SWD maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    /// ~500 kHz
    Slow,
    /// ~1 MHz
    Medium,
    /// ~2 MHz
    #[default]
    Fast,
    /// ~4 MHz
    Turbo,
}

impl Speed {
    pub fn speed_khz(&self) -> u32 {
        match self {
            Speed::Slow => 500,
            Speed::Medium => 1000,
            Speed::Fast => 2000,
            Speed::Turbo => 4000,
        }
    }

    fn delay_cycles(&self) -> u32 {
        match self {
            Speed::Slow => 75,
            Speed::Medium => 33,
            Speed::Fast => 10,
            Speed::Turbo => 0,
        }
    }
}

// Which side drives SWDIO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrivePhase {
    Host,
    Target,
}

/// SWD wire protocol driver.
///
/// Owns SWCLK, SWDIO and (optionally) the target's nRESET line for the
/// lifetime of the session.  Used by `SwdInterface`; applications should
/// not normally need it directly.
#[derive(Debug)]
pub struct SwdProtocol<'a> {
    swclk: Output<'a>,
    swdio: Flex<'a>,
    nreset: Option<Output<'a>>,
    speed: Speed,
    delay_cycles: u32,
    drive: DrivePhase,
}

impl<'a> SwdProtocol<'a> {
    /// Create a protocol driver from the session's pins.
    ///
    /// SWDIO starts as an input with no pull - it is the target's job to
    /// drive it during its response phases.  SWCLK starts low.  If a
    /// nRESET pin is given it is driven high (deasserted).
    pub fn new(
        swdio_pin: impl InputPin + OutputPin + 'a,
        swclk_pin: impl OutputPin + 'a,
        nreset_pin: Option<impl OutputPin + 'a>,
    ) -> Self {
        let mut swdio = Flex::new(swdio_pin);
        let input_config = InputConfig::default().with_pull(Pull::None);
        swdio.apply_input_config(&input_config);
        swdio.set_input_enable(true);

        let output_config = OutputConfig::default()
            .with_drive_strength(DriveStrength::_20mA)
            .with_drive_mode(DriveMode::PushPull);
        let swclk = Output::new(swclk_pin, Level::Low, output_config);

        let nreset_config = OutputConfig::default().with_drive_mode(DriveMode::PushPull);
        let nreset = nreset_pin.map(|pin| Output::new(pin, Level::High, nreset_config));

        debug!("SWD pins configured, SWDIO released, SWCLK low");

        let speed = Speed::default();
        Self {
            swclk,
            swdio,
            nreset,
            speed,
            delay_cycles: speed.delay_cycles(),
            drive: DrivePhase::Target,
        }
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
        self.delay_cycles = speed.delay_cycles();
        debug!("SWD speed set to {speed:?}");
    }

    pub fn has_nreset(&self) -> bool {
        self.nreset.is_some()
    }

    /// Pulse the hardware reset line, if wired.  Leaves the target running
    /// its reset vector; the caller must reconnect.
    pub async fn pulse_nreset(&mut self) -> bool {
        let Some(nreset) = self.nreset.as_mut() else {
            return false;
        };
        nreset.set_low();
        Timer::after(NRESET_ASSERT).await;
        nreset.set_high();
        Timer::after(NRESET_SETTLE).await;
        true
    }

    #[inline]
    fn swd_delay(&self) {
        if self.delay_cycles > 0 {
            riscv::asm::delay(self.delay_cycles);
        }
    }

    #[inline]
    fn clock_pulse(&mut self) {
        self.swclk.set_high();
        self.swd_delay();
        self.swclk.set_low();
        self.swd_delay();
    }

    // Insert a turnaround cycle if the requested direction differs from
    // the current one.  The line is released for the turnaround clock and
    // re-driven afterwards when handing to the host.
    fn turnaround_to(&mut self, to: DrivePhase) {
        if self.drive == to {
            return;
        }
        self.swdio.set_output_enable(false);
        self.swdio.set_input_enable(true);
        self.clock_pulse();
        if to == DrivePhase::Host {
            self.swdio.set_input_enable(false);
            self.swdio.set_output_enable(true);
        }
        self.drive = to;
    }

    /// Write `count` bits, LSB first.  Takes the line if the target holds
    /// it.
    pub(crate) fn write_bits(&mut self, value: u32, count: u8) {
        self.turnaround_to(DrivePhase::Host);
        let mut value = value;
        for _ in 0..count {
            if value & 1 != 0 {
                self.swdio.set_high();
            } else {
                self.swdio.set_low();
            }
            self.clock_pulse();
            value >>= 1;
        }
    }

    /// Read `count` bits, LSB first.  Releases the line if the host holds
    /// it.
    pub(crate) fn read_bits(&mut self, count: u8) -> u32 {
        self.turnaround_to(DrivePhase::Target);
        let mut value = 0u32;
        let mut bit = 1u32;
        for _ in 0..count {
            if self.swdio.is_high() {
                value |= bit;
            }
            self.clock_pulse();
            bit <<= 1;
        }
        value
    }

    // Write `count` bits MSB first - only the dormant-exit sequences use
    // this ordering.
    fn write_bits_msb(&mut self, value: u32, count: u8) {
        self.turnaround_to(DrivePhase::Host);
        for ii in (0..count).rev() {
            if value & (1 << ii) != 0 {
                self.swdio.set_high();
            } else {
                self.swdio.set_low();
            }
            self.clock_pulse();
        }
    }

    // One low park cycle to close a transaction, host driving.
    pub(crate) fn write_park(&mut self) {
        self.turnaround_to(DrivePhase::Host);
        self.swdio.set_low();
        self.clock_pulse();
    }

    /// Line reset: 50+ clocks with SWDIO high, then one low cycle.
    pub fn line_reset(&mut self) {
        self.turnaround_to(DrivePhase::Host);
        self.swdio.set_high();
        for _ in 0..LINE_RESET_HIGH_CYCLES {
            self.clock_pulse();
        }
        self.swdio.set_low();
        self.clock_pulse();
    }

    /// JTAG-to-SWD switch: the 16-bit select sequence followed by a line
    /// reset.
    pub fn jtag_to_swd(&mut self) {
        self.write_bits(JTAG_TO_SWD_SEQUENCE as u32, 16);
        self.line_reset();
    }

    /// Dormant-state wakeup: 8 high cycles, the 128-bit selection alert,
    /// 4 low cycles, the SWD activation code, then a line reset.
    pub fn dormant_wakeup(&mut self) {
        self.turnaround_to(DrivePhase::Host);
        self.swdio.set_high();
        for _ in 0..DORMANT_EXIT_HIGH_CYCLES {
            self.clock_pulse();
        }

        for &word in SELECTION_ALERT_SEQUENCE.iter() {
            self.write_bits_msb(word, 32);
        }

        self.swdio.set_low();
        for _ in 0..DORMANT_EXIT_LOW_CYCLES {
            self.clock_pulse();
        }

        self.write_bits_msb(SWD_ACTIVATION_CODE as u32, 8);
        self.line_reset();
    }

    /// One raw SWD transaction: request, ACK, then a data phase whose
    /// direction and validity depend on the ACK.
    ///
    /// On a non-OK ACK the host reclaims the line and clocks 32 dummy zero
    /// bits plus park, so a WAITing target sees a completed frame and the
    /// wire ends in a known state.
    pub(crate) fn transact(&mut self, request: u8, read: bool, data: &mut u32) -> RawResponse {
        self.write_bits(request as u32, 8);

        let ack = Ack::from_bits(self.read_bits(3) as u8);

        match ack {
            Ack::Ok if read => {
                let value = self.read_bits(32);
                let parity = self.read_bits(1) != 0;
                self.write_park();

                if parity != parity32(value) {
                    debug!("SWD read parity error: data=0x{value:08X}");
                    return RawResponse::ParityError;
                }
                *data = value;
                RawResponse::Ok
            }
            Ack::Ok => {
                self.write_bits(*data, 32);
                self.write_bits(parity32(*data) as u32, 1);
                self.write_park();
                RawResponse::Ok
            }
            Ack::Wait => {
                self.write_bits(0, 32);
                self.write_park();
                RawResponse::Wait
            }
            Ack::Fault => {
                self.write_bits(0, 32);
                self.write_park();
                RawResponse::Fault
            }
            Ack::Invalid(bits) => {
                self.write_bits(0, 32);
                self.write_park();
                RawResponse::NoAck(bits)
            }
        }
    }
}

/// Outcome of a single raw transaction, before any retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawResponse {
    Ok,
    Wait,
    Fault,
    /// Data phase arrived with bad parity - the ACK was OK but the data
    /// cannot be trusted.
    ParityError,
    NoAck(u8),
}

/// SWD parity: 1 for an odd number of set bits.
#[inline]
pub(crate) fn parity32(value: u32) -> bool {
    value.count_ones() % 2 == 1
}
