// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Request/session management over the kernel control channel.
//!
//! One [`SessionManager`] owns one control channel exclusively: it creates
//! and destroys sessions, acquires devices and hardware resources, allocates
//! and maps DMA buffers, links devices for atomic request scheduling, and
//! runs the event thread that turns kernel notifications (start-of-frame,
//! error) into client callbacks.
//!
//! Every kernel round-trip is synchronous on the calling thread. Failed
//! control requests leave already-mutated state in place; callers converge
//! by invoking the matching stop/release path.

use crate::channel::{
    BufHandle, BufferFlags, ControlChannel, ControlReply, ControlRequest, EventClass,
    HardwareCaps, HwDeviceHandle, HwResourceHandle, LinkHandle, PacketLocation, RawEvent,
    SessionHandle, SyncMode,
};
use crate::Error;
use camlink_sys as sys;
use dma_buf::{DmaBuf, MappedDmaBuf};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Poll granularity of the event thread; bounds shutdown latency without
/// affecting delivery latency (the dequeue itself blocks on readiness).
const EVENT_POLL_MS: i32 = 100;

/// Notification delivered to the client callback from the event thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Hardware observed the start of a frame.
    FrameStart {
        frame_id: u64,
        request_id: u64,
        /// Raw device-clock timestamp.
        device_timestamp: u64,
        /// Device timestamp converted into the monotonic clock domain.
        monotonic_ns: u64,
    },
    /// The kernel reported a request failure.
    DeviceError { error_type: u32, request_id: u64 },
}

/// Converts device-clock timestamps into the monotonic domain.
///
/// The device clock and the host clock are not co-calibrated, so absolute
/// device readings are never trusted: the first frame (or any frame arriving
/// with no prior sample held) anchors to the current monotonic clock, and
/// every later frame accumulates the device-clock delta onto that base.
#[derive(Debug, Default)]
pub(crate) struct TimestampTracker {
    last: Option<(u64, u64)>,
}

impl TimestampTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn convert(&mut self, request_id: u64, device_ts: u64, now_ns: u64) -> u64 {
        match self.last {
            Some((prev_device, prev_mono)) if request_id != 1 => {
                let mono = prev_mono.wrapping_add(device_ts.wrapping_sub(prev_device));
                self.last = Some((device_ts, mono));
                mono
            }
            _ => {
                self.last = Some((device_ts, now_ns));
                now_ns
            }
        }
    }
}

/// A kernel buffer owned by this process: allocated fresh or mapped from a
/// caller-supplied native descriptor. Released explicitly through
/// [`SessionManager::release_buffer`], at most once.
pub struct DeviceBuffer {
    handle: BufHandle,
    len: u64,
    fd: Option<OwnedFd>,
    mapping: Option<MappedDmaBuf>,
    released: bool,
}

impl DeviceBuffer {
    pub fn handle(&self) -> BufHandle {
        self.handle
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The user-space mapping, when the buffer was allocated with user
    /// access and the mapping succeeded. Callers must handle `None`: a
    /// failed mapping degrades the buffer, it does not fail the allocation.
    pub fn mapping(&self) -> Option<&MappedDmaBuf> {
        self.mapping.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("mapped", &self.mapping.is_some())
            .field("released", &self.released)
            .finish()
    }
}

struct EventWorker {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owner of the control channel to the kernel pipeline manager.
pub struct SessionManager {
    channel: Arc<dyn ControlChannel>,
    caps: Mutex<Option<HardwareCaps>>,
    event: Mutex<Option<EventWorker>>,
}

impl SessionManager {
    pub fn new(channel: Arc<dyn ControlChannel>) -> Self {
        SessionManager {
            channel,
            caps: Mutex::new(None),
            event: Mutex::new(None),
        }
    }

    /// Query and cache the hardware capability structure. Subsequent calls
    /// return the cached copy.
    pub fn query_capabilities(&self) -> Result<HardwareCaps, Error> {
        let mut cached = self.lock_caps();
        if let Some(caps) = *cached {
            return Ok(caps);
        }
        match self.channel.submit(&ControlRequest::QueryCap)? {
            ControlReply::Capabilities(caps) => {
                *cached = Some(caps);
                Ok(caps)
            }
            _ => Err(Error::Hardware {
                op: "QUERY_CAP",
                code: 0,
            }),
        }
    }

    /// Create one session context. A negative kernel-reported handle is
    /// cleaned up immediately with a destroy request so a half-created
    /// session never leaks, and the failure is reported to the caller.
    pub fn create_session(&self) -> Result<SessionHandle, Error> {
        let handle = self
            .channel
            .submit(&ControlRequest::CreateSession)?
            .into_handle("CREATE_SESSION")?;

        if handle < 0 {
            log::error!("CREATE_SESSION returned invalid handle {}", handle);
            if let Err(err) = self.channel.submit(&ControlRequest::DestroySession {
                session: SessionHandle(handle),
            }) {
                log::warn!("cleanup of half-created session failed: {}", err);
            }
            return Err(Error::Hardware {
                op: "CREATE_SESSION",
                code: handle,
            });
        }
        Ok(SessionHandle(handle))
    }

    pub fn destroy_session(&self, session: SessionHandle) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::DestroySession { session })?;
        Ok(())
    }

    pub fn acquire_device(
        &self,
        session: SessionHandle,
        device_index: u32,
    ) -> Result<HwDeviceHandle, Error> {
        let handle = self
            .channel
            .submit(&ControlRequest::AcquireDevice {
                session,
                device_index,
            })?
            .into_handle("ACQUIRE_DEV")?;
        Ok(HwDeviceHandle(handle))
    }

    pub fn release_device(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
    ) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::ReleaseDevice { session, device })?;
        Ok(())
    }

    pub fn acquire_hw(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
    ) -> Result<HwResourceHandle, Error> {
        let handle = self
            .channel
            .submit(&ControlRequest::AcquireHw { session, device })?
            .into_handle("ACQUIRE_HW")?;
        Ok(HwResourceHandle(handle))
    }

    pub fn release_hw(&self, session: SessionHandle, hw: HwResourceHandle) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::ReleaseHw { session, hw })?;
        Ok(())
    }

    pub fn config_device(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
        packet: PacketLocation,
    ) -> Result<(), Error> {
        self.channel.submit(&ControlRequest::ConfigDevice {
            session,
            device,
            packet,
        })?;
        Ok(())
    }

    /// Configuration staged by an external collaborator, for example a
    /// sensor register sequence prepared by its driver.
    pub fn config_device_external(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
        packet: PacketLocation,
    ) -> Result<(), Error> {
        self.channel.submit(&ControlRequest::ConfigDeviceExternal {
            session,
            device,
            packet,
        })?;
        Ok(())
    }

    pub fn start_device(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
    ) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::StartDevice { session, device })?;
        Ok(())
    }

    pub fn stop_device(
        &self,
        session: SessionHandle,
        device: HwDeviceHandle,
    ) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::StopDevice { session, device })?;
        Ok(())
    }

    /// Bind devices of one session so requests can be scheduled against them
    /// as a unit.
    pub fn link(
        &self,
        session: SessionHandle,
        devices: &[HwDeviceHandle],
    ) -> Result<LinkHandle, Error> {
        let handle = self
            .channel
            .submit(&ControlRequest::Link {
                session,
                devices: devices.to_vec(),
            })?
            .into_handle("LINK")?;
        Ok(LinkHandle(handle))
    }

    pub fn unlink(&self, session: SessionHandle, link: LinkHandle) -> Result<(), Error> {
        self.channel
            .submit(&ControlRequest::Unlink { session, link })?;
        Ok(())
    }

    /// Ask the kernel to execute the previously configured packet for
    /// `request_id` on `link`. Request ids must be submitted in strictly
    /// increasing order per link.
    pub fn schedule(
        &self,
        session: SessionHandle,
        link: LinkHandle,
        request_id: u64,
        bubble: bool,
        sync_mode: SyncMode,
    ) -> Result<(), Error> {
        self.channel.submit(&ControlRequest::ScheduleRequest {
            session,
            link,
            request_id,
            bubble,
            sync_mode,
        })?;
        Ok(())
    }

    /// Allocate a kernel buffer. Requires a previously queried capability
    /// structure carrying non-zero device and processing-stage IOMMU
    /// handles; a missing handle is a parameter error and no allocation is
    /// attempted.
    pub fn alloc_buffer(
        &self,
        len: u64,
        align: u64,
        flags: BufferFlags,
    ) -> Result<DeviceBuffer, Error> {
        let mmu_handles = self.mmu_handles()?;
        let reply = self.channel.submit(&ControlRequest::AllocBuffer {
            len,
            align,
            flags,
            mmu_handles,
        })?;
        self.finish_buffer(reply, len, flags, None)
    }

    /// Map a caller-supplied native buffer (descriptor plus size) into the
    /// kernel's address space.
    pub fn map_native_buffer(
        &self,
        fd: RawFd,
        offset: u64,
        len: u64,
        flags: BufferFlags,
    ) -> Result<DeviceBuffer, Error> {
        let mmu_handles = self.mmu_handles()?;
        let reply = self.channel.submit(&ControlRequest::MapBuffer {
            fd,
            offset,
            len,
            flags,
            mmu_handles,
        })?;
        self.finish_buffer(reply, len, flags, Some(fd))
    }

    /// Release a buffer previously allocated or mapped through this manager.
    /// Releasing twice is an explicit error rather than a double-release of
    /// kernel state.
    pub fn release_buffer(&self, buffer: &mut DeviceBuffer) -> Result<(), Error> {
        if buffer.released {
            return Err(Error::NotMapped);
        }
        self.channel.submit(&ControlRequest::ReleaseBuffer {
            handle: buffer.handle,
        })?;
        buffer.released = true;
        buffer.mapping = None;
        buffer.fd = None;
        Ok(())
    }

    fn finish_buffer(
        &self,
        reply: ControlReply,
        len: u64,
        flags: BufferFlags,
        native_fd: Option<RawFd>,
    ) -> Result<DeviceBuffer, Error> {
        let (handle, fd) = match reply {
            ControlReply::Buffer { handle, fd } => (handle, fd),
            _ => {
                return Err(Error::Hardware {
                    op: "ALLOC_BUF",
                    code: 0,
                })
            }
        };

        let mapping = if flags.user_access {
            map_for_user(fd.as_ref(), native_fd)
        } else {
            None
        };

        Ok(DeviceBuffer {
            handle,
            len,
            fd,
            mapping,
            released: false,
        })
    }

    fn mmu_handles(&self) -> Result<[i32; 2], Error> {
        let caps = (*self.lock_caps())
            .ok_or(Error::InvalidParameter("hardware capabilities not queried"))?;
        let device = caps.device_mmu.non_secure;
        let stage = caps.stage_mmu.non_secure;
        if device == 0 || stage == 0 {
            return Err(Error::InvalidParameter("missing IOMMU handle"));
        }
        Ok([device, stage])
    }

    /// Start the event thread. Subscribes to the start-of-frame and error
    /// event classes, then delivers every kernel notification synchronously
    /// through `callback` until [`stop_event_thread`](Self::stop_event_thread)
    /// runs. Call immediately after session creation.
    pub fn start_event_thread(
        &self,
        callback: impl FnMut(SessionEvent) + Send + 'static,
    ) -> Result<(), Error> {
        let mut worker = self.lock_event();
        if worker.is_some() {
            return Err(Error::InvalidState("event thread already running"));
        }

        self.channel.subscribe(EventClass::StartOfFrame)?;
        self.channel.subscribe(EventClass::Error)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = spawn_event_thread(self.channel.clone(), shutdown.clone(), callback)?;
        *worker = Some(EventWorker { shutdown, thread });
        Ok(())
    }

    /// Ask the event thread to exit and join it. Safe to call when the
    /// thread was never started.
    pub fn stop_event_thread(&self) {
        let worker = self.lock_event().take();
        if let Some(worker) = worker {
            worker.shutdown.store(true, Ordering::SeqCst);
            if worker.thread.join().is_err() {
                log::error!("event thread panicked");
            }
        }
    }

    fn lock_caps(&self) -> std::sync::MutexGuard<'_, Option<HardwareCaps>> {
        self.caps.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_event(&self) -> std::sync::MutexGuard<'_, Option<EventWorker>> {
        self.event.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_event_thread();
    }
}

fn spawn_event_thread(
    channel: Arc<dyn ControlChannel>,
    shutdown: Arc<AtomicBool>,
    mut callback: impl FnMut(SessionEvent) + Send + 'static,
) -> Result<JoinHandle<()>, Error> {
    let thread = std::thread::Builder::new()
        .name("camlink-events".into())
        .spawn(move || {
            let mut tracker = TimestampTracker::new();
            while !shutdown.load(Ordering::SeqCst) {
                match channel.dequeue_event(EVENT_POLL_MS) {
                    Ok(Some(RawEvent::StartOfFrame {
                        frame_id,
                        request_id,
                        device_timestamp,
                    })) => {
                        let monotonic_ns =
                            tracker.convert(request_id, device_timestamp, sys::monotonic_ns());
                        callback(SessionEvent::FrameStart {
                            frame_id,
                            request_id,
                            device_timestamp,
                            monotonic_ns,
                        });
                    }
                    Ok(Some(RawEvent::Error {
                        error_type,
                        request_id,
                    })) => {
                        callback(SessionEvent::DeviceError {
                            error_type,
                            request_id,
                        });
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Transient dequeue failures are tolerated; the next
                        // readiness cycle retries.
                        log::debug!("event dequeue failed: {}", err);
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        })?;
    Ok(thread)
}

fn map_for_user(reply_fd: Option<&OwnedFd>, native_fd: Option<RawFd>) -> Option<MappedDmaBuf> {
    // Prefer the descriptor exported by the kernel; fall back to the
    // caller's native descriptor for mapped buffers.
    let dup = match reply_fd {
        Some(fd) => fd.try_clone(),
        None => match native_fd {
            Some(raw) => {
                // SAFETY: the caller's descriptor is valid for the duration
                // of this call; borrow_raw does not assume ownership.
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw) };
                borrowed.try_clone_to_owned()
            }
            None => {
                log::warn!("no descriptor available for user mapping");
                return None;
            }
        },
    };

    let dup = match dup {
        Ok(fd) => fd,
        Err(err) => {
            log::warn!("descriptor duplication for user mapping failed: {}", err);
            return None;
        }
    };

    // SAFETY: dup is an owned descriptor transferred to the DmaBuf.
    let dmabuf = unsafe { DmaBuf::from_raw_fd(dup.into_raw_fd()) };
    match dmabuf.memory_map() {
        Ok(mapping) => Some(mapping),
        Err(err) => {
            // A failed mapping degrades the virtual address to null; the
            // allocation itself stands.
            log::warn!("user mapping failed: {:?}", err);
            None
        }
    }
}
