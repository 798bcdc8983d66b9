// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Hardware stream pipeline for one logical output path.
//!
//! The pipeline owns two packet pools (frame submissions and configuration
//! blobs), drives the acquire → configure → submit → start/stop sequence
//! against the session manager, and keeps the buffer/fence bookkeeping for
//! outstanding frames.
//!
//! Lifecycle: `Unconfigured → Configured → Streaming → Configured(paused) →
//! Streaming → ... → Unconfigured`. Configuration submits the initial blob
//! as request id 1 by convention; frame request ids restart from 1 on every
//! start. A failed kernel call leaves in-memory state as-is; `stop` is the
//! convergence path back to `Unconfigured`.

use crate::channel::{
    BufferFlags, HwDeviceHandle, HwResourceHandle, LinkHandle, SessionHandle, SyncMode,
};
use crate::fence::Fence;
use crate::packet::{PacketPool, SlotLayout};
use crate::session::{DeviceBuffer, SessionManager};
use crate::Error;
use camlink_sys as sys;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Request id carried by the initial configuration packet.
const INIT_CONFIG_REQUEST_ID: u64 = 1;

/// Frame-submission packet slots per pipeline; bounds the number of
/// outstanding buffers.
const SUBMIT_SLOTS: usize = 8;

/// Configuration packet slots per pipeline.
const CONFIG_SLOTS: usize = 4;

const SUBMIT_LAYOUT: SlotLayout = SlotLayout {
    max_cmd_bufs: 2,
    max_io_configs: 4,
    max_patches: 8,
    payload_capacity: 256,
};

const CONFIG_LAYOUT: SlotLayout = SlotLayout {
    max_cmd_bufs: 2,
    max_io_configs: 0,
    max_patches: 0,
    payload_capacity: 1024,
};

/// Initial hardware configuration: resource limits plus the clock and
/// bandwidth plans programmed before streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Maximum concurrently active hardware resources
    pub resource_limit: u32,
    /// Core clock plan in hertz
    pub clock_hz: u64,
    /// Bandwidth plan in bytes per second
    pub bandwidth_bps: u64,
}

impl StreamConfig {
    /// Serialize into the configuration blob layout the hardware consumes.
    fn encode(&self) -> [u8; 24] {
        let mut blob = [0u8; 24];
        blob[..4].copy_from_slice(&self.resource_limit.to_le_bytes());
        blob[8..16].copy_from_slice(&self.clock_hz.to_le_bytes());
        blob[16..24].copy_from_slice(&self.bandwidth_bps.to_le_bytes());
        blob
    }
}

/// One caller-supplied native output buffer.
#[derive(Debug, Clone, Copy)]
pub struct NativeBuffer {
    pub fd: RawFd,
    pub len: u64,
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unconfigured,
    Configured,
    Streaming,
    /// Configured, streaming suspended without releasing resources.
    Paused,
}

struct OutstandingBuffer {
    buffer: DeviceBuffer,
    fence: Fence,
    fence_id: i32,
    len: u64,
    slot: usize,
}

/// Driver of one logical hardware output path.
pub struct StreamPipeline {
    manager: Arc<SessionManager>,
    session: SessionHandle,
    device_index: u32,
    state: PipelineState,
    device: Option<HwDeviceHandle>,
    hw: Option<HwResourceHandle>,
    link: Option<LinkHandle>,
    submit_backing: DeviceBuffer,
    config_backing: DeviceBuffer,
    submit_pool: PacketPool,
    config_pool: PacketPool,
    request_counter: u64,
    next_fence_id: i32,
    outstanding: Vec<OutstandingBuffer>,
}

impl StreamPipeline {
    /// Allocate the two packet pools and stamp their slot headers. Requires
    /// the session manager's capability query to have run (the pools live in
    /// kernel-shared command buffers).
    pub fn new(
        manager: Arc<SessionManager>,
        session: SessionHandle,
        device_index: u32,
    ) -> Result<Self, Error> {
        manager.query_capabilities()?;

        let submit_len = (SUBMIT_LAYOUT.stride_bytes() * SUBMIT_SLOTS) as u64;
        let submit_backing = manager.alloc_buffer(submit_len, 4096, BufferFlags::cmd())?;
        let submit_pool = PacketPool::new(submit_backing.handle().0, SUBMIT_SLOTS, SUBMIT_LAYOUT)?;

        let config_len = (CONFIG_LAYOUT.stride_bytes() * CONFIG_SLOTS) as u64;
        let config_backing = manager.alloc_buffer(config_len, 4096, BufferFlags::cmd())?;
        let config_pool = PacketPool::new(config_backing.handle().0, CONFIG_SLOTS, CONFIG_LAYOUT)?;

        Ok(StreamPipeline {
            manager,
            session,
            device_index,
            state: PipelineState::Unconfigured,
            device: None,
            hw: None,
            link: None,
            submit_backing,
            config_backing,
            submit_pool,
            config_pool,
            request_counter: INIT_CONFIG_REQUEST_ID,
            next_fence_id: 0,
            outstanding: Vec::with_capacity(SUBMIT_SLOTS),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Current value of the per-link request-id counter.
    pub fn request_counter(&self) -> u64 {
        self.request_counter
    }

    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.len()
    }

    /// Completion fence of one outstanding buffer.
    pub fn fence(&self, index: usize) -> Option<&Fence> {
        self.outstanding.get(index).map(|entry| &entry.fence)
    }

    /// Wire fence id carried by one outstanding buffer's IO descriptor, for
    /// correlating completion notifications.
    pub fn fence_id(&self, index: usize) -> Option<i32> {
        self.outstanding.get(index).map(|entry| entry.fence_id)
    }

    /// Region counts of one frame-submission packet slot, for diagnostics.
    pub fn submit_packet_counts(&self, index: usize) -> Result<(u32, u32, u32), Error> {
        self.submit_pool.counts(index)
    }

    /// Acquire the device and hardware resource, submit the initial
    /// configuration blob as request id 1, and link the device into the
    /// session. `Unconfigured → Configured`.
    pub fn configure(&mut self, config: &StreamConfig) -> Result<(), Error> {
        if self.state != PipelineState::Unconfigured {
            return Err(Error::InvalidState("pipeline is already configured"));
        }

        let device = self.manager.acquire_device(self.session, self.device_index)?;
        self.device = Some(device);

        let hw = self.manager.acquire_hw(self.session, device)?;
        self.hw = Some(hw);

        let blob = config.encode();
        let config_location = self.config_pool.location(0)?;
        {
            let mut slot = self.config_pool.slot_mut(0)?;
            slot.begin(sys::CAM_PACKET_INIT_CONFIG, INIT_CONFIG_REQUEST_ID);
            let payload_offset = slot.write_payload(&blob)?;
            slot.push_cmd_buf(sys::CmdBufDesc {
                mem_handle: config_location.mem_handle,
                offset: config_location.offset as u32 + payload_offset,
                size: CONFIG_LAYOUT.payload_capacity as u32,
                length: blob.len() as u32,
                kind: sys::CAM_CMD_BUF_GENERIC,
                meta_data: 0,
                reserved: 0,
            })?;
            slot.set_kmd_cmd_buf_index(0);
        }
        self.manager
            .config_device(self.session, device, config_location)?;

        let link = self.manager.link(self.session, &[device])?;
        self.link = Some(link);

        self.request_counter = 0;
        self.state = PipelineState::Configured;
        Ok(())
    }

    /// Issue the hardware start and schedule one request per supplied
    /// buffer. `Configured → Streaming`.
    pub fn start(&mut self, buffers: &[NativeBuffer]) -> Result<(), Error> {
        if self.state != PipelineState::Configured {
            return Err(Error::InvalidState("pipeline is not configured"));
        }
        let device = self.device()?;

        self.manager.start_device(self.session, device)?;
        self.request_counter = 0;
        self.state = PipelineState::Streaming;

        for buffer in buffers {
            self.enqueue(*buffer)?;
        }
        Ok(())
    }

    /// Map one native buffer and schedule a request for it. Valid while
    /// streaming; the buffer occupies the next free packet slot.
    pub fn enqueue(&mut self, native: NativeBuffer) -> Result<usize, Error> {
        if self.state != PipelineState::Streaming {
            return Err(Error::InvalidState("pipeline is not streaming"));
        }

        let slot = self.outstanding.len();
        if slot >= self.submit_pool.slot_count() {
            return Err(Error::CapacityExceeded("frame-submission packet slots"));
        }

        let buffer =
            self.manager
                .map_native_buffer(native.fd, 0, native.len, BufferFlags::hw())?;

        let fence = Fence::new();
        let fence_id = self.allocate_fence_id();
        self.submit_slot(slot, buffer.handle().0, native.len, fence_id)?;

        self.outstanding.push(OutstandingBuffer {
            buffer,
            fence,
            fence_id,
            len: native.len,
            slot,
        });
        Ok(slot)
    }

    /// Recycle an already-streaming buffer: release the prior fence, reset
    /// the packet slot, and reschedule the same mapping under a fresh
    /// request id.
    pub fn recycle_buffer(&mut self, index: usize) -> Result<(), Error> {
        if self.state != PipelineState::Streaming {
            return Err(Error::InvalidState("pipeline is not streaming"));
        }
        if index >= self.outstanding.len() {
            return Err(Error::InvalidParameter("buffer index out of range"));
        }

        let (slot, mem_handle, len) = {
            let entry = &self.outstanding[index];
            (entry.slot, entry.buffer.handle().0, entry.len)
        };

        let fence = Fence::new();
        let fence_id = self.allocate_fence_id();
        self.submit_slot(slot, mem_handle, len, fence_id)?;

        let entry = &mut self.outstanding[index];
        entry.fence = fence;
        entry.fence_id = fence_id;
        Ok(())
    }

    /// Hardware stop, unlink, release of every handle and buffer, and a
    /// reset of both packet pools. Any state → `Unconfigured`. The request
    /// counter is left at 1: the next configure's initial-config packet
    /// reuses request id 1 by convention.
    ///
    /// This is also the convergence path after a partially failed
    /// `configure`: whatever was acquired before the failure is released,
    /// and teardown continues past individual release failures (the first
    /// one is reported).
    pub fn stop(&mut self) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;
        let mut note = |result: Result<(), Error>| {
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        };

        if let Some(device) = self.device {
            if matches!(self.state, PipelineState::Streaming | PipelineState::Paused) {
                note(self.manager.stop_device(self.session, device));
            }
        }
        if let Some(link) = self.link.take() {
            note(self.manager.unlink(self.session, link));
        }
        if let Some(hw) = self.hw.take() {
            note(self.manager.release_hw(self.session, hw));
        }
        if let Some(device) = self.device.take() {
            note(self.manager.release_device(self.session, device));
        }

        for mut entry in self.outstanding.drain(..) {
            note(self.manager.release_buffer(&mut entry.buffer));
        }

        self.submit_pool.reset_all();
        self.config_pool.reset_all();
        self.request_counter = INIT_CONFIG_REQUEST_ID;
        self.state = PipelineState::Unconfigured;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Suspend streaming without releasing resources, and resubmit the
    /// initial configuration packet so the hardware returns to a known ready
    /// condition. `Streaming → Paused`.
    pub fn pause(&mut self) -> Result<(), Error> {
        if self.state != PipelineState::Streaming {
            return Err(Error::InvalidState("pipeline is not streaming"));
        }
        let device = self.device()?;

        self.manager.stop_device(self.session, device)?;
        self.manager
            .config_device(self.session, device, self.config_pool.location(0)?)?;
        self.state = PipelineState::Paused;
        Ok(())
    }

    /// Resume streaming: hardware start, then reschedule every outstanding
    /// buffer under fresh request ids and fences. `Paused → Streaming`.
    pub fn resume(&mut self) -> Result<(), Error> {
        if self.state != PipelineState::Paused {
            return Err(Error::InvalidState("pipeline is not paused"));
        }
        let device = self.device()?;

        self.manager.start_device(self.session, device)?;
        self.request_counter = 0;
        self.state = PipelineState::Streaming;

        for index in 0..self.outstanding.len() {
            self.recycle_buffer(index)?;
        }
        Ok(())
    }

    /// Build the frame packet in `slot` and schedule it under the next
    /// request id.
    fn submit_slot(
        &mut self,
        slot: usize,
        mem_handle: i64,
        len: u64,
        fence_id: i32,
    ) -> Result<(), Error> {
        let device = self.device()?;
        let link = self.link.ok_or(Error::InvalidState("pipeline has no link"))?;

        self.request_counter += 1;
        let request_id = self.request_counter;

        {
            let mut packet = self.submit_pool.slot_mut(slot)?;
            packet.begin(sys::CAM_PACKET_FRAME, request_id);
            packet.push_io_config(sys::BufferIoConfig {
                mem_handle,
                offset: 0,
                length: len as u32,
                format: 0,
                direction: sys::CAM_BUF_OUTPUT,
                fence: fence_id,
                flags: 0,
            })?;
        }

        let location = self.submit_pool.location(slot)?;
        self.manager.config_device(self.session, device, location)?;
        self.manager
            .schedule(self.session, link, request_id, false, SyncMode::NoSync)?;
        Ok(())
    }

    fn device(&self) -> Result<HwDeviceHandle, Error> {
        self.device
            .ok_or(Error::InvalidState("pipeline has no device"))
    }

    fn allocate_fence_id(&mut self) -> i32 {
        self.next_fence_id += 1;
        self.next_fence_id
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        // The packet pool backings live for the pipeline's whole lifetime;
        // everything else is released by stop().
        for backing in [&mut self.submit_backing, &mut self.config_backing] {
            if !backing.is_released() {
                if let Err(err) = self.manager.release_buffer(backing) {
                    log::warn!("packet pool backing release failed: {}", err);
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("state", &self.state)
            .field("device_index", &self.device_index)
            .field("request_counter", &self.request_counter)
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}
