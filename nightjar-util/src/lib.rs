// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar-util - development utilities for building nightjar firmware.
//!
//! [`net`] - WiFi station bring-up over `esp-wifi` and `embassy-net`.

#![no_std]
#![feature(type_alias_impl_trait)]
#![feature(impl_trait_in_assoc_type)]

extern crate alloc;

pub mod net;
