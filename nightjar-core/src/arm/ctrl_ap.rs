// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Nordic CTRL-AP registers.
//!
//! The CTRL-AP is a Nordic-specific Access Port that remains reachable when
//! APPROTECT has locked the MEM-AP out of the bus.  It provides chip-level
//! reset and the ERASEALL operation that clears flash, UICR and the
//! protection state together.

use crate::arm::ap::Idr;
use crate::arm::register::{
    ApRegister, ReadableRegister, RegisterDescriptor, WritableRegister,
};
use crate::{register_data_r, register_data_rw};
use core::fmt;

/// Mask applied to an AP IDR when looking for a Nordic CTRL-AP.
pub const IDR_MATCH_MASK: u32 = 0x0FFF_0000;

/// IDR patterns (under [`IDR_MATCH_MASK`]) identifying a CTRL-AP.  Both the
/// original and the revised Nordic JEP106 encodings appear in the field.
pub const IDR_MATCH_VALUES: [u32; 2] = [0x0288_0000, 0x1288_0000];

/// Returns true if the IDR identifies a Nordic CTRL-AP.
pub fn idr_matches(idr: Idr) -> bool {
    let masked = idr.value() & IDR_MATCH_MASK;
    IDR_MATCH_VALUES.contains(&masked)
}

/// RESET register descriptor (0x000, read-write).  Holds the chip in reset
/// while 1.
pub struct ResetRegister;

impl RegisterDescriptor for ResetRegister {
    const ADDRESS: u8 = 0x00;
    type Value = Reset;
}

impl ReadableRegister for ResetRegister {}
impl WritableRegister for ResetRegister {}
impl ApRegister for ResetRegister {}

/// CTRL-AP RESET register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reset(u32);

register_data_rw!(Reset);

impl Reset {
    pub const ASSERT: Reset = Reset(1);
    pub const RELEASE: Reset = Reset(0);
}

/// ERASEALL register descriptor (0x004, write-only in practice).  Writing 1
/// starts the erase-all operation.
pub struct EraseAllRegister;

impl RegisterDescriptor for EraseAllRegister {
    const ADDRESS: u8 = 0x04;
    type Value = EraseAll;
}

impl WritableRegister for EraseAllRegister {}
impl ApRegister for EraseAllRegister {}

/// CTRL-AP ERASEALL register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseAll(u32);

impl From<EraseAll> for u32 {
    fn from(value: EraseAll) -> u32 {
        value.0
    }
}

impl fmt::Display for EraseAll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl EraseAll {
    pub const START: EraseAll = EraseAll(1);
}

/// ERASEALLSTATUS register descriptor (0x008, read-only).  Reads 0 when no
/// erase is in progress.
pub struct EraseAllStatusRegister;

impl RegisterDescriptor for EraseAllStatusRegister {
    const ADDRESS: u8 = 0x08;
    type Value = EraseAllStatus;
}

impl ReadableRegister for EraseAllStatusRegister {}
impl ApRegister for EraseAllStatusRegister {}

/// CTRL-AP ERASEALLSTATUS register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseAllStatus(u32);

register_data_r!(EraseAllStatus);

impl EraseAllStatus {
    pub fn idle(&self) -> bool {
        self.0 == 0
    }
}

/// APPROTECTSTATUS register descriptor (0x00C, read-only).  Bit 0 set means
/// the MEM-AP is usable (protection disabled).
pub struct ApprotectStatusRegister;

impl RegisterDescriptor for ApprotectStatusRegister {
    const ADDRESS: u8 = 0x0C;
    type Value = ApprotectStatus;
}

impl ReadableRegister for ApprotectStatusRegister {}
impl ApRegister for ApprotectStatusRegister {}

/// CTRL-AP APPROTECTSTATUS register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApprotectStatus(u32);

register_data_r!(ApprotectStatus);

impl ApprotectStatus {
    pub fn enabled(&self) -> bool {
        self.0 & 1 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idr_match_rule() {
        // Values seen on real nRF52 silicon
        assert!(idr_matches(Idr::new(0x0288_0000)));
        assert!(idr_matches(Idr::new(0x1288_0000)));
        assert!(idr_matches(Idr::new(0x1288_00A1)));
        assert!(idr_matches(Idr::new(0xF288_0000)));

        // The MEM-AP and an empty slot must not match
        assert!(!idr_matches(Idr::new(0x2477_0011)));
        assert!(!idr_matches(Idr::new(0)));
    }

    #[test]
    fn register_values() {
        assert_eq!(u32::from(Reset::ASSERT), 1);
        assert_eq!(u32::from(EraseAll::START), 1);
        assert!(EraseAllStatus::from(0).idle());
        assert!(!EraseAllStatus::from(1).idle());
    }
}
