// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! ARM Debug Port registers.
//!
//! Covers the ADIv5 register set nightjar uses against the nRF52's SW-DP:
//! IDCODE/ABORT at 0x0, CTRL/STAT at 0x4, SELECT at 0x8 and RDBUFF at 0xC.

use crate::arm::register::{DpRegister, ReadableRegister, RegisterDescriptor, WritableRegister};
use crate::{register_data_r, register_data_rw, register_data_w};
use alloc::{format, string::String};
use core::fmt;

/// IDCODE (DPIDR) register descriptor (read-only)
pub struct IdCodeRegister;

impl RegisterDescriptor for IdCodeRegister {
    const ADDRESS: u8 = 0x00;
    type Value = IdCode;
}

impl ReadableRegister for IdCodeRegister {}
impl DpRegister for IdCodeRegister {}

/// Debug Port IDCODE register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdCode(u32);

impl IdCode {
    /// IDCODE of the nRF52 family SW-DP (ARM DAP v2, designer ARM Ltd).
    pub const NRF52: IdCode = IdCode(0x2BA01477);

    pub const fn new(value: u32) -> Self {
        IdCode(value)
    }

    pub fn data(&self) -> u32 {
        self.0
    }

    /// Get JEDEC designer ID (bits 11:1)
    pub fn designer_id(&self) -> u16 {
        ((self.0 >> 1) & 0x7FF) as u16
    }

    /// Get part number (bits 27:20)
    pub fn part_number(&self) -> u8 {
        ((self.0 >> 20) & 0xFF) as u8
    }

    /// Get DP architecture version (bits 15:12)
    pub fn version(&self) -> u8 {
        ((self.0 >> 12) & 0xF) as u8
    }

    /// An absent or unpowered target reads as all-zeros or all-ones.  Both
    /// mean there is no usable DP on the wire.
    pub fn indicates_target(&self) -> bool {
        self.0 != 0 && self.0 != 0xFFFF_FFFF
    }

    /// Check the read-as-one LSB, which every valid IDCODE carries.
    pub fn is_valid(&self) -> bool {
        (self.0 & 1) == 1
    }
}

impl From<u32> for IdCode {
    fn from(value: u32) -> Self {
        IdCode(value)
    }
}

impl From<IdCode> for u32 {
    fn from(value: IdCode) -> u32 {
        value.0
    }
}

impl fmt::Display for IdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl serde::Serialize for IdCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("0x{:08X}", self.0))
    }
}

/// ABORT register descriptor (write-only, shares address 0x0 with IDCODE)
pub struct AbortRegister;

impl RegisterDescriptor for AbortRegister {
    const ADDRESS: u8 = 0x00;
    type Value = Abort;
}

impl WritableRegister for AbortRegister {}
impl DpRegister for AbortRegister {}

/// Debug Port ABORT register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Abort(u32);

register_data_w!(Abort);

impl Abort {
    const DAPABORT: u32 = 1 << 0;
    const STKCMPCLR: u32 = 1 << 1;
    const STKERRCLR: u32 = 1 << 2;
    const WDERRCLR: u32 = 1 << 3;
    const ORUNERRCLR: u32 = 1 << 4;

    /// The value written to recover from a FAULT ACK: clears ORUNERR,
    /// WDERR, STKERR and STKCMP.
    pub const CLEAR_STICKY: Abort =
        Abort(Self::STKCMPCLR | Self::STKERRCLR | Self::WDERRCLR | Self::ORUNERRCLR);

    pub fn set_dapabort(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::DAPABORT;
        } else {
            self.0 &= !Self::DAPABORT;
        }
    }

    pub fn set_stkcmpclr(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::STKCMPCLR;
        } else {
            self.0 &= !Self::STKCMPCLR;
        }
    }

    pub fn set_stkerrclr(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::STKERRCLR;
        } else {
            self.0 &= !Self::STKERRCLR;
        }
    }

    pub fn set_wderrclr(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::WDERRCLR;
        } else {
            self.0 &= !Self::WDERRCLR;
        }
    }

    pub fn set_orunerrclr(&mut self, enable: bool) {
        if enable {
            self.0 |= Self::ORUNERRCLR;
        } else {
            self.0 &= !Self::ORUNERRCLR;
        }
    }
}

/// CTRL/STAT register descriptor (read-write)
pub struct CtrlStatRegister;

impl RegisterDescriptor for CtrlStatRegister {
    const ADDRESS: u8 = 0x04;
    type Value = CtrlStat;
}

impl ReadableRegister for CtrlStatRegister {}
impl WritableRegister for CtrlStatRegister {}
impl DpRegister for CtrlStatRegister {}

/// Debug Port CTRL/STAT register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtrlStat(u32);

register_data_rw!(CtrlStat);

impl CtrlStat {
    const STICKYORUN: u32 = 1 << 1;
    const STICKYCMP: u32 = 1 << 4;
    const STICKYERR: u32 = 1 << 5;
    const READOK: u32 = 1 << 6;
    const WDATAERR: u32 = 1 << 7;
    const CDBGPWRUPREQ: u32 = 1 << 28;
    const CDBGPWRUPACK: u32 = 1 << 29;
    const CSYSPWRUPREQ: u32 = 1 << 30;
    const CSYSPWRUPACK: u32 = 1 << 31;

    /// Both power-up requests, as written at the start of the debug
    /// power-up handshake.
    pub const POWER_UP_REQ: CtrlStat = CtrlStat(Self::CDBGPWRUPREQ | Self::CSYSPWRUPREQ);

    /// Both power-up acknowledge bits; the handshake completes when the
    /// register reads back with these set.
    pub const POWER_UP_ACK_MASK: u32 = Self::CDBGPWRUPACK | Self::CSYSPWRUPACK;

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn stickyorun(&self) -> bool {
        self.0 & Self::STICKYORUN != 0
    }

    pub fn stickycmp(&self) -> bool {
        self.0 & Self::STICKYCMP != 0
    }

    pub fn stickyerr(&self) -> bool {
        self.0 & Self::STICKYERR != 0
    }

    pub fn readok(&self) -> bool {
        self.0 & Self::READOK != 0
    }

    pub fn wdataerr(&self) -> bool {
        self.0 & Self::WDATAERR != 0
    }

    pub fn cdbgpwrupack(&self) -> bool {
        self.0 & Self::CDBGPWRUPACK != 0
    }

    pub fn csyspwrupack(&self) -> bool {
        self.0 & Self::CSYSPWRUPACK != 0
    }

    /// True once both power domains have acknowledged.
    pub fn powered_up(&self) -> bool {
        self.0 & Self::POWER_UP_ACK_MASK == Self::POWER_UP_ACK_MASK
    }

    pub fn has_errors(&self) -> bool {
        self.stickyorun() || self.stickycmp() || self.stickyerr() || self.wdataerr()
    }

    /// Get error state description
    pub fn error_states(&self) -> String {
        let mut errors = [""; 4];
        let mut count = 0;

        if self.stickyorun() {
            errors[count] = "STICKYORUN";
            count += 1;
        }
        if self.stickycmp() {
            errors[count] = "STICKYCMP";
            count += 1;
        }
        if self.stickyerr() {
            errors[count] = "STICKYERR";
            count += 1;
        }
        if self.wdataerr() {
            errors[count] = "WDATAERR";
            count += 1;
        }

        if count == 0 {
            format!("No errors{}", if self.readok() { " (READOK)" } else { "" })
        } else {
            format!("Errors: {}", errors[..count].join(", "))
        }
    }

    /// Get power state description
    pub fn power_states(&self) -> String {
        format!(
            "Debug: {}, System: {}",
            if self.cdbgpwrupack() { "ACK" } else { "nak" },
            if self.csyspwrupack() { "ACK" } else { "nak" },
        )
    }
}

/// SELECT register descriptor (write-only on SW-DP)
pub struct SelectRegister;

impl RegisterDescriptor for SelectRegister {
    const ADDRESS: u8 = 0x08;
    type Value = Select;
}

impl WritableRegister for SelectRegister {}
impl DpRegister for SelectRegister {}

/// Debug Port SELECT register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Select(u32);

register_data_rw!(Select);

impl Select {
    const APSEL_MASK: u32 = 0xFF;
    const APSEL_SHIFT: u32 = 24;

    pub const DPBANKSEL_MASK: u32 = 0xF;
    pub const DPBANKSEL_SHIFT: u32 = 0;

    pub const APBANKSEL_MASK: u32 = 0xF;
    pub const APBANKSEL_SHIFT: u32 = 4;

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Get access port select
    pub fn apsel(&self) -> u32 {
        (self.0 >> Self::APSEL_SHIFT) & Self::APSEL_MASK
    }

    /// Get AP bank select
    pub fn apbanksel(&self) -> u32 {
        (self.0 >> Self::APBANKSEL_SHIFT) & Self::APBANKSEL_MASK
    }

    /// Set access port select
    pub fn set_apsel(&mut self, apsel: u32) {
        self.0 = (self.0 & !(Self::APSEL_MASK << Self::APSEL_SHIFT))
            | ((apsel & Self::APSEL_MASK) << Self::APSEL_SHIFT);
    }

    /// Set AP bank select from a register address - the bank is the
    /// address's bits 7:4.
    pub fn set_apbanksel_from_addr(&mut self, addr: u8) {
        let banksel = ((addr >> 4) & 0xF) as u32;
        self.0 = (self.0 & !(Self::APBANKSEL_MASK << Self::APBANKSEL_SHIFT))
            | (banksel << Self::APBANKSEL_SHIFT);
    }

    /// Set DP bank select from a register address.
    pub fn set_dpbanksel_from_addr(&mut self, addr: u8) {
        let banksel = ((addr >> 4) & 0xF) as u32;
        self.0 = (self.0 & !(Self::DPBANKSEL_MASK << Self::DPBANKSEL_SHIFT))
            | (banksel << Self::DPBANKSEL_SHIFT);
    }

    /// Build a SELECT value for the given AP index and AP register address.
    pub fn for_ap(ap_index: u8, addr: u8) -> Self {
        let mut select = Select::default();
        select.set_apsel(ap_index as u32);
        select.set_apbanksel_from_addr(addr);
        select
    }
}

/// RDBUFF register descriptor (read-only)
pub struct RdBuffRegister;

impl RegisterDescriptor for RdBuffRegister {
    const ADDRESS: u8 = 0x0C;
    type Value = RdBuff;
}

impl ReadableRegister for RdBuffRegister {}
impl DpRegister for RdBuffRegister {}

/// Debug Port RDBUFF register data.  Holds the result of the previous
/// posted AP read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdBuff(u32);

register_data_r!(RdBuff);

impl RdBuff {
    pub fn data(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_clear_sticky_is_0x1e() {
        assert_eq!(u32::from(Abort::CLEAR_STICKY), 0x1E);

        let mut abort = Abort::default();
        abort.set_stkcmpclr(true);
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        assert_eq!(abort, Abort::CLEAR_STICKY);
        abort.set_dapabort(true);
        assert_eq!(u32::from(abort), 0x1F);
    }

    #[test]
    fn ctrl_stat_power_up_bits() {
        assert_eq!(u32::from(CtrlStat::POWER_UP_REQ), 0x5000_0000);
        assert_eq!(CtrlStat::POWER_UP_ACK_MASK, 0xA000_0000);
        assert!(CtrlStat::from(0xF000_0000).powered_up());
        assert!(!CtrlStat::from(0x5000_0000).powered_up());
    }

    #[test]
    fn select_packs_apsel_and_banks() {
        let select = Select::for_ap(1, 0xFC);
        assert_eq!(select.value(), 0x0100_00F0);
        assert_eq!(select.apsel(), 1);
        assert_eq!(select.apbanksel(), 0xF);

        let select = Select::for_ap(0, 0x04);
        assert_eq!(select.value(), 0);
    }

    #[test]
    fn idcode_target_detection() {
        assert!(IdCode::NRF52.indicates_target());
        assert!(IdCode::NRF52.is_valid());
        assert!(!IdCode::new(0).indicates_target());
        assert!(!IdCode::new(0xFFFF_FFFF).indicates_target());
        assert_eq!(IdCode::NRF52.designer_id(), 0x23B);
        assert_eq!(IdCode::NRF52.version(), 1);
    }
}
