// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Physical CSI receiver lifecycle.
//!
//! One receiver can feed multiple logical output streams (virtual channels
//! multiplexed on one physical link), so the hardware must be started
//! exactly once and stopped exactly once no matter how many consumers are
//! active. [`CsiReceiver`] tracks that with a reference count: `start`
//! issues the hardware start only on the 0→1 transition, `stop` issues the
//! hardware stop only on the N→0 transition.
//!
//! State and count live behind one per-receiver mutex, so concurrent
//! start/stop from different logical streams is well defined.

use crate::channel::{HwDeviceHandle, PacketLocation, SessionHandle};
use crate::session::SessionManager;
use crate::Error;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Powered and configured, not carrying data.
    Init,
    /// At least one logical consumer is receiving frames.
    Streaming,
}

struct ReceiverState {
    state: LinkState,
    consumers: u32,
    configured: bool,
}

/// Driver for one physical CSI input.
pub struct CsiReceiver {
    manager: Arc<SessionManager>,
    session: SessionHandle,
    device: HwDeviceHandle,
    inner: Mutex<ReceiverState>,
}

impl CsiReceiver {
    /// Wrap an acquired receiver device. The receiver starts in the INIT
    /// state, unconfigured.
    pub fn new(
        manager: Arc<SessionManager>,
        session: SessionHandle,
        device: HwDeviceHandle,
    ) -> Self {
        CsiReceiver {
            manager,
            session,
            device,
            inner: Mutex::new(ReceiverState {
                state: LinkState::Init,
                consumers: 0,
                configured: false,
            }),
        }
    }

    pub fn device(&self) -> HwDeviceHandle {
        self.device
    }

    /// Apply the link configuration packet. Only valid in INIT; calling
    /// again while already configured is a no-op success.
    pub fn configure(&self, packet: PacketLocation) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != LinkState::Init {
            return Err(Error::InvalidState("receiver is streaming"));
        }
        if inner.configured {
            return Ok(());
        }

        self.manager
            .config_device(self.session, self.device, packet)?;
        inner.configured = true;
        Ok(())
    }

    /// Register one logical consumer. The hardware start request is issued
    /// only when the first consumer arrives.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.lock();

        if inner.consumers == 0 {
            if inner.state != LinkState::Init {
                return Err(Error::InvalidState("receiver is not in INIT"));
            }
            self.manager.start_device(self.session, self.device)?;
            inner.state = LinkState::Streaming;
        }

        inner.consumers += 1;
        Ok(())
    }

    /// Drop one logical consumer. The hardware stop request is issued only
    /// when the last consumer leaves; stopping with no active consumer is a
    /// state error and reaches no hardware.
    pub fn stop(&self) -> Result<(), Error> {
        let mut inner = self.lock();

        if inner.consumers == 0 {
            return Err(Error::InvalidState("receiver has no active consumers"));
        }

        inner.consumers -= 1;
        if inner.consumers == 0 {
            self.manager.stop_device(self.session, self.device)?;
            inner.state = LinkState::Init;
        }
        Ok(())
    }

    /// Number of logical consumers currently started.
    pub fn active_consumers(&self) -> u32 {
        self.lock().consumers
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().state == LinkState::Streaming
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReceiverState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CsiReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("CsiReceiver")
            .field("device", &self.device)
            .field("streaming", &(inner.state == LinkState::Streaming))
            .field("consumers", &inner.consumers)
            .finish()
    }
}
