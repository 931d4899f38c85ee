// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - the target task.
//!
//! Owns the debug session (and with it the SWD pins) for the firmware's
//! lifetime, so every SWD and flash operation is naturally serialised.
//! HTTP handlers talk to it over a request channel; while a session is
//! up and idle it runs a keepalive IDCODE poll so `/check_swd` stays
//! honest between requests.

use alloc::format;
use core::fmt;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, Timer};
use esp_hal::gpio::{InputPin, OutputPin};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use static_cell::make_static;

use nightjar_swd::protocol::Speed;
use nightjar_swd::{DebugInterface, Nvmc, ctrl_ap};

use crate::config::CONFIG;
use crate::error::NightjarError;
use crate::upload::{UploadKind, UploadSession};

pub(crate) mod request;
pub(crate) mod response;

pub(crate) use request::{Command, Request};
pub(crate) use response::Response;

/// Outstanding requests the channel will hold.  Should cover the HTTP
/// task pool.
pub const REQUEST_CHANNEL_SIZE: usize = 4;

// Keepalive cadence while connected and idle
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

/// The SWD target and its request plumbing.
pub struct Target<'a> {
    debug: DebugInterface<'a>,
    receiver: Receiver<'static, CriticalSectionRawMutex, Request, REQUEST_CHANNEL_SIZE>,
    sender: Sender<'static, CriticalSectionRawMutex, Request, REQUEST_CHANNEL_SIZE>,
    keepalive: bool,
    upload: Option<UploadSession>,
}

impl<'a> Target<'a> {
    pub fn new(
        speed: Speed,
        keepalive: bool,
        swdio_pin: impl InputPin + OutputPin + fmt::Debug + 'a,
        swclk_pin: impl OutputPin + fmt::Debug + 'a,
        nreset_pin: Option<impl OutputPin + fmt::Debug + 'a>,
    ) -> Target<'a> {
        debug!("Exec:  Create SWD debug interface");
        let mut debug = DebugInterface::from_pins(swdio_pin, swclk_pin, nreset_pin);
        debug.set_speed(speed);

        let channel = make_static!(Channel::new());
        Self {
            debug,
            receiver: channel.receiver(),
            sender: channel.sender(),
            keepalive,
            upload: None,
        }
    }

    /// Sender half for the HTTP surface.
    pub fn request_sender(
        &self,
    ) -> Sender<'static, CriticalSectionRawMutex, Request, REQUEST_CHANNEL_SIZE> {
        self.sender
    }

    async fn handle_request(&mut self, request: Request) {
        trace!("target: handling {:?}", request.command);
        let response: Response = match request.command {
            Command::CheckSwd => self.check_swd().await,
            Command::ReleaseSwd => self.release_swd(),
            Command::MassErase => self.mass_erase().await,
            Command::DisableProtection => self.disable_protection().await,
            Command::EraseAll => self.erase_all().await,
            Command::UploadBegin { kind, total } => self.upload_begin(kind, total).await,
            Command::UploadChunk { data } => self.upload_chunk(&data).await,
            Command::UploadFinish => self.upload_finish().await,
            Command::UploadAbort => self.upload_abort().await,
        }
        .into();

        // The last hard failure is kept for the UI across restarts
        if !response.success {
            let mut config = CONFIG.lock().await;
            config.last_error = Some(response.message.clone());
            config.update_flash();
        }

        request.response_signal.signal(response);
    }

    // Connect if needed, then report IDCODE and the APPROTECT state.
    async fn check_swd(&mut self) -> Result<Response, NightjarError> {
        let connected = if self.debug.is_connected().await {
            true
        } else {
            match self.debug.connect().await {
                Ok(_) => true,
                Err(e) => {
                    debug!("target: connect failed: {e}");
                    false
                }
            }
        };

        if !connected {
            return Ok(Response::ok("no target").with_data(serde_json::json!({
                "connected": false,
                "approtect": "0xFFFFFFFF",
                "status": "Unknown",
            })));
        }

        // An APPROTECTed part answers IDCODE but not memory reads; report
        // that distinctly rather than failing the whole request
        let (approtect, status) = match self.debug.read_approtect().await {
            Ok((raw, status)) => (format!("0x{raw:08X}"), status.as_str()),
            Err(e) => {
                debug!("target: APPROTECT unreadable: {e}");
                (format!("0x{:08X}", u32::MAX), "Protected (MEM-AP locked)")
            }
        };

        let idcode = self.debug.idcode().map(|id| format!("{id}"));
        let details = self.debug.details().map(|d| format!("{d}"));

        Ok(Response::ok("connected").with_data(serde_json::json!({
            "connected": true,
            "idcode": idcode,
            "device": details,
            "approtect": approtect,
            "status": status,
        })))
    }

    fn release_swd(&mut self) -> Result<Response, NightjarError> {
        self.debug.disconnect();
        Ok(Response::ok("released"))
    }

    async fn mass_erase(&mut self) -> Result<Response, NightjarError> {
        self.ensure_connected().await?;
        ctrl_ap::mass_erase(&mut self.debug).await?;
        Ok(Response::ok("mass erase complete, protection released"))
    }

    async fn disable_protection(&mut self) -> Result<Response, NightjarError> {
        self.ensure_connected().await?;
        Nvmc::new(&mut self.debug).disable_approtect().await?;
        Ok(Response::ok("APPROTECT disabled"))
    }

    async fn erase_all(&mut self) -> Result<Response, NightjarError> {
        self.ensure_connected().await?;
        Nvmc::new(&mut self.debug).erase_all().await?;
        Ok(Response::ok("chip erased"))
    }

    async fn upload_begin(
        &mut self,
        kind: UploadKind,
        total: usize,
    ) -> Result<Response, NightjarError> {
        if self.upload.is_some() {
            return Err(NightjarError::InvalidState("upload already in progress"));
        }
        self.ensure_connected().await?;
        self.upload = Some(UploadSession::begin(kind, total).await);
        Ok(Response::ok("upload open"))
    }

    async fn upload_chunk(&mut self, data: &[u8]) -> Result<Response, NightjarError> {
        let Some(mut session) = self.upload.take() else {
            return Err(NightjarError::InvalidState("no upload in progress"));
        };
        match session.feed(&mut self.debug, data).await {
            Ok(()) => {
                self.upload = Some(session);
                Ok(Response::ok("chunk accepted"))
            }
            Err(e) => {
                session.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn upload_finish(&mut self) -> Result<Response, NightjarError> {
        let Some(mut session) = self.upload.take() else {
            return Err(NightjarError::InvalidState("no upload in progress"));
        };
        match session.finish(&mut self.debug).await {
            Ok(flashed) => Ok(Response::ok(&format!("flashed {flashed} bytes"))
                .with_data(serde_json::json!({ "flashed": flashed }))),
            Err(e) => {
                session.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn upload_abort(&mut self) -> Result<Response, NightjarError> {
        if let Some(session) = self.upload.take() {
            session
                .abort(&NightjarError::InvalidState("aborted by client"))
                .await;
        }
        Ok(Response::ok("upload discarded"))
    }

    async fn ensure_connected(&mut self) -> Result<(), NightjarError> {
        if self.debug.is_connected().await {
            return Ok(());
        }
        self.debug.connect().await?;
        Ok(())
    }
}

/// Runs the target task: serve requests, keep the session alive in the
/// gaps.
#[embassy_executor::task]
pub async fn task(target: &'static mut Target<'static>) {
    info!("Exec:  Target task started");

    loop {
        match select(
            target.receiver.receive(),
            Timer::after(KEEPALIVE_INTERVAL),
        )
        .await
        {
            Either::First(request) => target.handle_request(request).await,
            Either::Second(()) => {
                // No keepalive probing mid-upload - the session is busy
                if target.keepalive && target.upload.is_none() && target.debug.session_active() {
                    if !target.debug.is_connected().await {
                        warn!("Note:  Target dropped off the wire");
                    }
                }
            }
        }
    }
}
