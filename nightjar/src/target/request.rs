// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - requests to the target task.

use alloc::vec::Vec;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::target::Response;
use crate::upload::UploadKind;

/// Operations the HTTP surface can ask the target task to perform.  The
/// task owns the debug session; these are the only way to reach it.
#[derive(Debug)]
pub enum Command {
    /// Connect if not already connected; report IDCODE and APPROTECT
    CheckSwd,
    /// Drop the debug session and release the target
    ReleaseSwd,
    /// CTRL-AP erase-all: recovers an APPROTECTed part
    MassErase,
    /// NVMC erase plus the HwDisabled APPROTECT sentinel
    DisableProtection,
    /// NVMC mass erase (flash only)
    EraseAll,
    /// Open a streaming HEX upload
    UploadBegin { kind: UploadKind, total: usize },
    /// One chunk of HTTP body
    UploadChunk { data: Vec<u8> },
    /// Body fully received - flush and close the upload
    UploadFinish,
    /// The upload failed on the HTTP side - discard state
    UploadAbort,
}

/// A command plus the signal its response arrives on.  Each HTTP server
/// task owns one signal and reuses it per request.
pub struct Request {
    pub command: Command,
    pub response_signal: &'static Signal<CriticalSectionRawMutex, Response>,
}
