// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Generic Access Port registers.

use crate::arm::register::{ApRegister, ReadableRegister, RegisterDescriptor};
use crate::register_data_r;
use core::fmt;

/// Access Port Identification Register descriptor
pub struct IdrRegister;

impl RegisterDescriptor for IdrRegister {
    const ADDRESS: u8 = 0xFC;
    type Value = Idr;
}

impl ReadableRegister for IdrRegister {}
impl ApRegister for IdrRegister {}

register_data_r!(Idr);

/// Access Port Identification Register data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Idr(u32);

impl Idr {
    const CLASS_MASK: u32 = 0xF;
    const CLASS_SHIFT: u32 = 13;

    const TYPE_MASK: u32 = 0xF;
    const TYPE_SHIFT: u32 = 0;

    /// No Access Port at this index
    pub const CLASS_NONE: u32 = 0x0;
    /// Memory Access Port
    pub const CLASS_MEM_AP: u32 = 0x8;

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Get class field (bits 16:13)
    pub fn class(&self) -> u32 {
        (self.0 >> Self::CLASS_SHIFT) & Self::CLASS_MASK
    }

    /// Get AP type field (bits 3:0)
    pub fn ap_type(&self) -> u32 {
        (self.0 >> Self::TYPE_SHIFT) & Self::TYPE_MASK
    }

    /// An unimplemented AP index reads IDR as zero.
    pub fn is_present(&self) -> bool {
        self.0 != 0
    }

    pub fn is_mem_ap(&self) -> bool {
        self.class() == Self::CLASS_MEM_AP
    }
}

/// nRF52 AHB-AP (Cortex-M4) IDR value
pub const IDR_AHB_AP_CORTEX_M4: Idr = Idr::new(0x24770011);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ahb_ap_idr_is_mem_ap() {
        assert!(IDR_AHB_AP_CORTEX_M4.is_mem_ap());
        assert!(IDR_AHB_AP_CORTEX_M4.is_present());
        assert!(!Idr::default().is_present());
    }
}
