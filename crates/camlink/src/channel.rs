// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Control protocol seam to the kernel pipeline manager.
//!
//! Every kernel interaction is one multiplexed control call carrying an
//! opcode and a fixed C-layout payload. Internally the protocol is a typed
//! [`ControlRequest`]/[`ControlReply`] pair; the flat byte layout only exists
//! inside [`KernelChannel`], at the system boundary. The [`ControlChannel`]
//! trait is the seam that test code and alternate transports implement.

use crate::Error;
use camlink_sys as sys;
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// Kernel-assigned session context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub i32);

/// Kernel-assigned device handle within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwDeviceHandle(pub i32);

/// Kernel-assigned hardware-resource handle bound to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwResourceHandle(pub i32);

/// Kernel-assigned link handle binding devices for request scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkHandle(pub i32);

/// Kernel memory handle for an allocated or mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle(pub i64);

/// Memory-management-unit handles reported by the hardware capability query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmuHandles {
    pub non_secure: i32,
    pub secure: i32,
}

/// Hardware capabilities reported by `QUERY_CAP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardwareCaps {
    pub version: u32,
    /// Hardware-reported instance index, used for sub-index assignment.
    pub slot: u32,
    /// IOMMU handles for device DMA.
    pub device_mmu: MmuHandles,
    /// IOMMU handles for the command-processing stage.
    pub stage_mmu: MmuHandles,
}

/// Buffer allocation/mapping flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Map the buffer into the caller's address space
    pub user_access: bool,
    /// Hardware reads and writes the buffer
    pub hw_read_write: bool,
    /// Buffer carries command packets
    pub cmd_buffer: bool,
    /// Buffer is shared with kernel-side consumers
    pub kernel_access: bool,
}

impl BufferFlags {
    /// Flags for a hardware frame buffer.
    pub fn hw() -> Self {
        BufferFlags {
            hw_read_write: true,
            ..Default::default()
        }
    }

    /// Flags for a user-visible command packet buffer.
    pub fn cmd() -> Self {
        BufferFlags {
            user_access: true,
            cmd_buffer: true,
            kernel_access: true,
            ..Default::default()
        }
    }

    pub fn to_raw(self) -> u32 {
        let mut raw = 0;
        if self.user_access {
            raw |= sys::CAM_MEM_FLAG_UMD_ACCESS;
        }
        if self.hw_read_write {
            raw |= sys::CAM_MEM_FLAG_HW_READ_WRITE;
        }
        if self.cmd_buffer {
            raw |= sys::CAM_MEM_FLAG_CMD_BUF;
        }
        if self.kernel_access {
            raw |= sys::CAM_MEM_FLAG_KMD_ACCESS;
        }
        raw
    }
}

/// Request scheduling hint: may the kernel absorb a late request as a bubble,
/// and must request execution be strictly serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    NoSync,
    Sync,
}

impl SyncMode {
    fn to_raw(self) -> u32 {
        match self {
            SyncMode::NoSync => sys::CAM_SYNC_MODE_NO_SYNC,
            SyncMode::Sync => sys::CAM_SYNC_MODE_SYNC,
        }
    }
}

/// Location of a command packet inside a kernel-shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLocation {
    pub mem_handle: i64,
    pub offset: u64,
}

/// One control request to the kernel pipeline manager. Each variant maps to
/// exactly one opcode of the wire protocol.
#[derive(Debug)]
pub enum ControlRequest {
    QueryCap,
    CreateSession,
    DestroySession {
        session: SessionHandle,
    },
    AcquireDevice {
        session: SessionHandle,
        device_index: u32,
    },
    ReleaseDevice {
        session: SessionHandle,
        device: HwDeviceHandle,
    },
    AcquireHw {
        session: SessionHandle,
        device: HwDeviceHandle,
    },
    ReleaseHw {
        session: SessionHandle,
        hw: HwResourceHandle,
    },
    ConfigDevice {
        session: SessionHandle,
        device: HwDeviceHandle,
        packet: PacketLocation,
    },
    /// Configuration applied on behalf of an external collaborator (for
    /// example a sensor register sequence staged by its driver).
    ConfigDeviceExternal {
        session: SessionHandle,
        device: HwDeviceHandle,
        packet: PacketLocation,
    },
    StartDevice {
        session: SessionHandle,
        device: HwDeviceHandle,
    },
    StopDevice {
        session: SessionHandle,
        device: HwDeviceHandle,
    },
    AllocBuffer {
        len: u64,
        align: u64,
        flags: BufferFlags,
        mmu_handles: [i32; 2],
    },
    MapBuffer {
        fd: RawFd,
        offset: u64,
        len: u64,
        flags: BufferFlags,
        mmu_handles: [i32; 2],
    },
    ReleaseBuffer {
        handle: BufHandle,
    },
    Link {
        session: SessionHandle,
        devices: Vec<HwDeviceHandle>,
    },
    Unlink {
        session: SessionHandle,
        link: LinkHandle,
    },
    ScheduleRequest {
        session: SessionHandle,
        link: LinkHandle,
        request_id: u64,
        bubble: bool,
        sync_mode: SyncMode,
    },
}

impl ControlRequest {
    /// Wire opcode for this request.
    pub fn op_code(&self) -> u32 {
        match self {
            ControlRequest::QueryCap => sys::CAM_QUERY_CAP,
            ControlRequest::CreateSession => sys::CAM_CREATE_SESSION,
            ControlRequest::DestroySession { .. } => sys::CAM_DESTROY_SESSION,
            ControlRequest::AcquireDevice { .. } => sys::CAM_ACQUIRE_DEV,
            ControlRequest::ReleaseDevice { .. } => sys::CAM_RELEASE_DEV,
            ControlRequest::AcquireHw { .. } => sys::CAM_ACQUIRE_HW,
            ControlRequest::ReleaseHw { .. } => sys::CAM_RELEASE_HW,
            ControlRequest::ConfigDevice { .. } => sys::CAM_CONFIG_DEV,
            ControlRequest::ConfigDeviceExternal { .. } => sys::CAM_CONFIG_DEV_EXTERNAL,
            ControlRequest::StartDevice { .. } => sys::CAM_START_DEV,
            ControlRequest::StopDevice { .. } => sys::CAM_STOP_DEV,
            ControlRequest::AllocBuffer { .. } => sys::CAM_ALLOC_BUF,
            ControlRequest::MapBuffer { .. } => sys::CAM_MAP_BUF,
            ControlRequest::ReleaseBuffer { .. } => sys::CAM_RELEASE_BUF,
            ControlRequest::Link { .. } => sys::CAM_LINK,
            ControlRequest::Unlink { .. } => sys::CAM_UNLINK,
            ControlRequest::ScheduleRequest { .. } => sys::CAM_SCHED_REQ,
        }
    }

    /// Stable operation name used in logs and hardware-failure errors.
    pub fn op_name(&self) -> &'static str {
        match self {
            ControlRequest::QueryCap => "QUERY_CAP",
            ControlRequest::CreateSession => "CREATE_SESSION",
            ControlRequest::DestroySession { .. } => "DESTROY_SESSION",
            ControlRequest::AcquireDevice { .. } => "ACQUIRE_DEV",
            ControlRequest::ReleaseDevice { .. } => "RELEASE_DEV",
            ControlRequest::AcquireHw { .. } => "ACQUIRE_HW",
            ControlRequest::ReleaseHw { .. } => "RELEASE_HW",
            ControlRequest::ConfigDevice { .. } => "CONFIG_DEV",
            ControlRequest::ConfigDeviceExternal { .. } => "CONFIG_DEV_EXTERNAL",
            ControlRequest::StartDevice { .. } => "START_DEV",
            ControlRequest::StopDevice { .. } => "STOP_DEV",
            ControlRequest::AllocBuffer { .. } => "ALLOC_BUF",
            ControlRequest::MapBuffer { .. } => "MAP_BUF",
            ControlRequest::ReleaseBuffer { .. } => "RELEASE_BUF",
            ControlRequest::Link { .. } => "LINK",
            ControlRequest::Unlink { .. } => "UNLINK",
            ControlRequest::ScheduleRequest { .. } => "SCHED_REQ",
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op_name())
    }
}

/// Reply to a [`ControlRequest`].
#[derive(Debug)]
pub enum ControlReply {
    /// Operation completed without output.
    Done,
    /// Kernel-assigned handle (session, device, hardware resource, or link).
    Handle(i32),
    /// Capability structure from `QUERY_CAP`.
    Capabilities(HardwareCaps),
    /// Buffer handle from `ALLOC_BUF`/`MAP_BUF`, plus an export descriptor
    /// when the kernel provides one.
    Buffer {
        handle: BufHandle,
        fd: Option<OwnedFd>,
    },
}

impl ControlReply {
    /// Extract a handle reply; anything else is a protocol error.
    pub fn into_handle(self, op: &'static str) -> Result<i32, Error> {
        match self {
            ControlReply::Handle(h) => Ok(h),
            _ => Err(Error::Hardware { op, code: 0 }),
        }
    }
}

/// Kernel event classes the control descriptor can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    StartOfFrame,
    Error,
}

impl EventClass {
    pub fn to_raw(self) -> u32 {
        match self {
            EventClass::StartOfFrame => sys::CAM_EVENT_CLASS_SOF,
            EventClass::Error => sys::CAM_EVENT_CLASS_ERROR,
        }
    }
}

/// One decoded kernel notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    StartOfFrame {
        frame_id: u64,
        request_id: u64,
        /// Device-clock timestamp in ticks.
        device_timestamp: u64,
    },
    Error {
        error_type: u32,
        request_id: u64,
    },
}

/// Transport carrying the control protocol. One instance owns one control
/// descriptor; it must not be driven from two threads without external
/// synchronization beyond what [`crate::session::SessionManager`] provides.
pub trait ControlChannel: Send + Sync {
    /// Issue one blocking control round-trip.
    fn submit(&self, request: &ControlRequest) -> Result<ControlReply, Error>;

    /// Subscribe to one event class.
    fn subscribe(&self, class: EventClass) -> Result<(), Error>;

    /// Dequeue one event, waiting up to `timeout_ms` (negative blocks
    /// indefinitely). Returns `Ok(None)` on timeout.
    fn dequeue_event(&self, timeout_ms: i32) -> Result<Option<RawEvent>, Error>;
}

/// The real control channel over the pipeline-manager character device.
#[derive(Debug)]
pub struct KernelChannel {
    fd: OwnedFd,
}

impl KernelChannel {
    /// Open the control node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(KernelChannel { fd: file.into() })
    }

    /// Open the default control node.
    pub fn open_default() -> Result<Self, Error> {
        Self::open(sys::CONTROL_NODE)
    }

    fn control<T>(&self, op: &'static str, op_code: u32, payload: &mut T) -> Result<(), Error> {
        let mut cmd = sys::ControlCmd {
            op_code,
            size: std::mem::size_of::<T>() as u32,
            handle_type: sys::CAM_HANDLE_USER_POINTER,
            reserved: 0,
            handle: payload as *mut T as u64,
        };
        let ret = unsafe { sys::camlink_control(self.fd.as_raw_fd(), &mut cmd) };
        if let Err(err) = ret {
            let code = err.raw_os_error().unwrap_or(-1);
            log::error!("{} control request failed: {}", op, code);
            return Err(Error::Hardware { op, code });
        }
        Ok(())
    }
}

fn mmu_array(handles: [i32; 2]) -> [i32; sys::CAM_MAX_MMU_HANDLES] {
    let mut hdls = [0; sys::CAM_MAX_MMU_HANDLES];
    hdls[0] = handles[0];
    hdls[1] = handles[1];
    hdls
}

fn buffer_reply(out: sys::BufHandleResult) -> ControlReply {
    let fd = if out.fd >= 0 {
        // SAFETY: the kernel exported a fresh descriptor owned by this reply.
        Some(unsafe { OwnedFd::from_raw_fd(out.fd) })
    } else {
        None
    };
    ControlReply::Buffer {
        handle: BufHandle(out.buf_handle),
        fd,
    }
}

impl ControlChannel for KernelChannel {
    fn submit(&self, request: &ControlRequest) -> Result<ControlReply, Error> {
        let op = request.op_name();
        let op_code = request.op_code();

        match request {
            ControlRequest::QueryCap => {
                let mut payload = sys::QueryCapCmd::default();
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Capabilities(HardwareCaps {
                    version: payload.version,
                    slot: payload.slot,
                    device_mmu: MmuHandles {
                        non_secure: payload.device_iommu.non_secure,
                        secure: payload.device_iommu.secure,
                    },
                    stage_mmu: MmuHandles {
                        non_secure: payload.stage_iommu.non_secure,
                        secure: payload.stage_iommu.secure,
                    },
                }))
            }
            ControlRequest::CreateSession => {
                let mut payload = sys::SessionInfo::default();
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Handle(payload.session_hdl))
            }
            ControlRequest::DestroySession { session } => {
                let mut payload = sys::SessionInfo {
                    session_hdl: session.0,
                    ..Default::default()
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::AcquireDevice {
                session,
                device_index,
            } => {
                let mut payload = sys::AcquireDevCmd {
                    session_hdl: session.0,
                    dev_hdl: 0,
                    dev_index: *device_index,
                    reserved: 0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Handle(payload.dev_hdl))
            }
            ControlRequest::ReleaseDevice { session, device } => {
                let mut payload = sys::ReleaseDevCmd {
                    session_hdl: session.0,
                    dev_hdl: device.0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::AcquireHw { session, device } => {
                let mut payload = sys::AcquireHwCmd {
                    session_hdl: session.0,
                    dev_hdl: device.0,
                    hw_hdl: 0,
                    reserved: 0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Handle(payload.hw_hdl))
            }
            ControlRequest::ReleaseHw { session, hw } => {
                let mut payload = sys::ReleaseHwCmd {
                    session_hdl: session.0,
                    hw_hdl: hw.0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::ConfigDevice {
                session,
                device,
                packet,
            }
            | ControlRequest::ConfigDeviceExternal {
                session,
                device,
                packet,
            } => {
                let mut payload = sys::ConfigDevCmd {
                    session_hdl: session.0,
                    dev_hdl: device.0,
                    packet_handle: packet.mem_handle,
                    offset: packet.offset,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::StartDevice { session, device }
            | ControlRequest::StopDevice { session, device } => {
                let mut payload = sys::StartStopCmd {
                    session_hdl: session.0,
                    dev_hdl: device.0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::AllocBuffer {
                len,
                align,
                flags,
                mmu_handles,
            } => {
                let mut payload = sys::AllocBufCmd {
                    len: *len,
                    align: *align,
                    mmu_hdls: mmu_array(*mmu_handles),
                    num_hdls: 2,
                    flags: flags.to_raw(),
                    out: sys::BufHandleResult::default(),
                };
                self.control(op, op_code, &mut payload)?;
                Ok(buffer_reply(payload.out))
            }
            ControlRequest::MapBuffer {
                fd,
                offset,
                len,
                flags,
                mmu_handles,
            } => {
                let mut payload = sys::MapBufCmd {
                    fd: *fd,
                    reserved: 0,
                    offset: *offset,
                    len: *len,
                    mmu_hdls: mmu_array(*mmu_handles),
                    num_hdls: 2,
                    flags: flags.to_raw(),
                    out: sys::BufHandleResult::default(),
                };
                self.control(op, op_code, &mut payload)?;
                Ok(buffer_reply(payload.out))
            }
            ControlRequest::ReleaseBuffer { handle } => {
                let mut payload = sys::ReleaseBufCmd {
                    buf_handle: handle.0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::Link { session, devices } => {
                if devices.is_empty() || devices.len() > sys::CAM_MAX_LINKED_DEVICES {
                    return Err(Error::InvalidParameter("link device count"));
                }
                let mut payload = sys::LinkCmd {
                    session_hdl: session.0,
                    num_devices: devices.len() as u32,
                    dev_hdls: [0; sys::CAM_MAX_LINKED_DEVICES],
                    link_hdl: 0,
                    reserved: 0,
                };
                for (slot, device) in payload.dev_hdls.iter_mut().zip(devices) {
                    *slot = device.0;
                }
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Handle(payload.link_hdl))
            }
            ControlRequest::Unlink { session, link } => {
                let mut payload = sys::UnlinkCmd {
                    session_hdl: session.0,
                    link_hdl: link.0,
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
            ControlRequest::ScheduleRequest {
                session,
                link,
                request_id,
                bubble,
                sync_mode,
            } => {
                let mut payload = sys::SchedReqCmd {
                    session_hdl: session.0,
                    link_hdl: link.0,
                    req_id: *request_id,
                    bubble_enable: u32::from(*bubble),
                    sync_mode: sync_mode.to_raw(),
                };
                self.control(op, op_code, &mut payload)?;
                Ok(ControlReply::Done)
            }
        }
    }

    fn subscribe(&self, class: EventClass) -> Result<(), Error> {
        let sub = sys::SubscribeEventCmd {
            class: class.to_raw(),
            id: 0,
            flags: 0,
            reserved: 0,
        };
        unsafe { sys::subscribe_event(self.fd.as_raw_fd(), &sub) }?;
        Ok(())
    }

    fn dequeue_event(&self, timeout_ms: i32) -> Result<Option<RawEvent>, Error> {
        if !sys::wait_readable(self.fd.as_raw_fd(), timeout_ms)? {
            return Ok(None);
        }

        let mut envelope = sys::EventEnvelope {
            class: 0,
            sequence: 0,
            payload: sys::EventPayload { raw: [0; 32] },
        };
        if let Err(err) = unsafe { sys::dequeue_event(self.fd.as_raw_fd(), &mut envelope) } {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        match envelope.class {
            sys::CAM_EVENT_CLASS_SOF => {
                // SAFETY: the kernel fills the payload matching the class tag.
                let sof = unsafe { envelope.payload.sof };
                Ok(Some(RawEvent::StartOfFrame {
                    frame_id: sof.frame_id,
                    request_id: sof.request_id,
                    device_timestamp: sof.timestamp,
                }))
            }
            sys::CAM_EVENT_CLASS_ERROR => {
                // SAFETY: as above.
                let error = unsafe { envelope.payload.error };
                Ok(Some(RawEvent::Error {
                    error_type: error.error_type,
                    request_id: error.request_id,
                }))
            }
            other => {
                log::debug!("ignoring unknown event class {}", other);
                Ok(None)
            }
        }
    }
}
