// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - HEX upload sessions.
//!
//! An upload streams through the target task chunk by chunk: HTTP body
//! bytes go into the HEX parser, decoded records into the coalescing
//! buffer, and each flushed image through erase-then-program.  Progress
//! is published in [`PROGRESS`] for the polling endpoint.

use alloc::format;
use alloc::string::String;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use nightjar_core::coalesce::{FlushChunk, PageCoalescer};
use nightjar_core::ihex::{Record, StreamParser};
use nightjar_swd::{DebugInterface, Nvmc};

use crate::error::NightjarError;

/// What the upload claims to contain; biases the base address when the
/// HEX stream carries no extended-linear-address record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Application image, above the SoftDevice
    App,
    /// Nordic SoftDevice, above the MBR
    SoftDevice,
    /// Bootloader, top of flash
    Bootloader,
    /// Whole image - addresses come from the file alone
    Full,
}

impl UploadKind {
    pub fn from_query(kind: &str) -> Option<Self> {
        match kind {
            "app" => Some(UploadKind::App),
            "softdevice" => Some(UploadKind::SoftDevice),
            "bootloader" => Some(UploadKind::Bootloader),
            "full" => Some(UploadKind::Full),
            _ => None,
        }
    }

    pub fn base_bias(&self) -> u32 {
        match self {
            UploadKind::App => 0x0002_6000,
            UploadKind::SoftDevice => 0x0000_1000,
            UploadKind::Bootloader => 0x000F_4000,
            UploadKind::Full => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::App => "app",
            UploadKind::SoftDevice => "softdevice",
            UploadKind::Bootloader => "bootloader",
            UploadKind::Full => "full",
        }
    }
}

/// Upload state for the polling endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Progress {
    pub in_progress: bool,
    /// HTTP body bytes consumed
    pub received: usize,
    /// Bytes committed to target flash
    pub flashed: usize,
    /// Content-Length of the upload
    pub total: usize,
    pub message: String,
}

/// Published progress, readable from any task.
pub static PROGRESS: Mutex<CriticalSectionRawMutex, Progress> = Mutex::new(Progress {
    in_progress: false,
    received: 0,
    flashed: 0,
    total: 0,
    message: String::new(),
});

/// One streaming upload.  Owned by the target task between UploadBegin
/// and UploadFinish/Abort.
pub struct UploadSession {
    kind: UploadKind,
    parser: StreamParser,
    coalescer: PageCoalescer,
    received: usize,
    flashed: usize,
    total: usize,
}

impl UploadSession {
    pub async fn begin(kind: UploadKind, total: usize) -> Self {
        info!("Exec:  Upload started: kind={}, {total} bytes", kind.as_str());
        let mut progress = PROGRESS.lock().await;
        *progress = Progress {
            in_progress: true,
            total,
            message: format!("receiving {} image", kind.as_str()),
            ..Progress::default()
        };

        Self {
            kind,
            parser: StreamParser::new(kind.base_bias()),
            coalescer: PageCoalescer::new(),
            received: 0,
            flashed: 0,
            total,
        }
    }

    /// Feed one chunk of HTTP body: parse, coalesce, flash whatever
    /// becomes ready.
    pub async fn feed(
        &mut self,
        debug: &mut DebugInterface<'_>,
        chunk: &[u8],
    ) -> Result<(), NightjarError> {
        self.parser.push(chunk)?;
        self.received += chunk.len();

        for record in self.parser.take_records() {
            match record {
                Record::Data { addr, bytes } => {
                    if let Some(flush) = self.coalescer.push(addr, &bytes) {
                        self.flash_chunk(debug, flush).await?;
                    }
                }
                Record::Eof | Record::UpperAddr(_) => {
                    if let Some(flush) = self.coalescer.finish() {
                        self.flash_chunk(debug, flush).await?;
                    }
                }
            }
        }

        self.publish_progress().await;
        Ok(())
    }

    /// Close the stream: flush the tail and verify the file terminated.
    pub async fn finish(
        &mut self,
        debug: &mut DebugInterface<'_>,
    ) -> Result<usize, NightjarError> {
        self.parser.finish()?;
        for record in self.parser.take_records() {
            if let Record::Data { addr, bytes } = record {
                if let Some(flush) = self.coalescer.push(addr, &bytes) {
                    self.flash_chunk(debug, flush).await?;
                }
            }
        }
        if let Some(flush) = self.coalescer.finish() {
            self.flash_chunk(debug, flush).await?;
        }

        if !self.parser.eof_seen() {
            warn!("Note:  Upload ended without an EOF record");
        }

        info!("OK:    Upload complete: {} bytes flashed", self.flashed);
        let mut progress = PROGRESS.lock().await;
        progress.in_progress = false;
        progress.flashed = self.flashed;
        progress.received = self.received;
        progress.message = format!("flashed {} bytes", self.flashed);

        Ok(self.flashed)
    }

    /// Record an aborted upload in the progress state.
    pub async fn abort(&self, reason: &NightjarError) {
        error!("Error: Upload aborted: {reason}");
        let mut progress = PROGRESS.lock().await;
        progress.in_progress = false;
        progress.message = format!("failed: {reason}");
    }

    // Erase the covering pages, program the image, account for it.
    async fn flash_chunk(
        &mut self,
        debug: &mut DebugInterface<'_>,
        chunk: FlushChunk,
    ) -> Result<(), NightjarError> {
        debug!(
            "Exec:  Flush 0x{:08X}, {} bytes ({})",
            chunk.base,
            chunk.data.len(),
            self.kind.as_str()
        );

        for page in chunk.pages() {
            Nvmc::new(debug).erase_page(page).await?;
        }
        Nvmc::new(debug).program_buffer(chunk.base, &chunk.data).await?;

        self.flashed += chunk.data.len();
        self.publish_progress().await;
        Ok(())
    }

    async fn publish_progress(&self) {
        let mut progress = PROGRESS.lock().await;
        progress.received = self.received;
        progress.flashed = self.flashed;
        progress.total = self.total;
    }
}
