// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Kernel uAPI definitions for the camera pipeline manager.
//!
//! These mirror the C layouts consumed by the kernel subsystem and must not be
//! reordered or resized. Layouts are asserted by the unit tests in this crate.

use std::ffi::{c_char, c_int, c_void};

// ---------------------------------------------------------------------------
// ioctl request construction (asm-generic _IOC encoding)
// ---------------------------------------------------------------------------

const IOC_NRSHIFT: u64 = 0;
const IOC_TYPESHIFT: u64 = 8;
const IOC_SIZESHIFT: u64 = 16;
const IOC_DIRSHIFT: u64 = 30;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u64) << IOC_TYPESHIFT)
        | ((nr as u64) << IOC_NRSHIFT)
        | ((size as u64) << IOC_SIZESHIFT)
}

pub const fn ior<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ, ty, nr, std::mem::size_of::<T>())
}

pub const fn iow<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

pub const fn iowr<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

// ---------------------------------------------------------------------------
// Multiplexed control call
// ---------------------------------------------------------------------------

/// Default character device node owned by the request manager.
pub const CONTROL_NODE: &str = "/dev/camlink-mgr";

pub const CAM_QUERY_CAP: u32 = 1;
pub const CAM_ACQUIRE_DEV: u32 = 2;
pub const CAM_ACQUIRE_HW: u32 = 3;
pub const CAM_CONFIG_DEV: u32 = 4;
pub const CAM_CONFIG_DEV_EXTERNAL: u32 = 5;
pub const CAM_START_DEV: u32 = 6;
pub const CAM_STOP_DEV: u32 = 7;
pub const CAM_RELEASE_HW: u32 = 8;
pub const CAM_RELEASE_DEV: u32 = 9;
pub const CAM_ALLOC_BUF: u32 = 10;
pub const CAM_MAP_BUF: u32 = 11;
pub const CAM_RELEASE_BUF: u32 = 12;
pub const CAM_CREATE_SESSION: u32 = 13;
pub const CAM_DESTROY_SESSION: u32 = 14;
pub const CAM_LINK: u32 = 15;
pub const CAM_UNLINK: u32 = 16;
pub const CAM_SCHED_REQ: u32 = 17;

/// Payload is addressed through a user pointer.
pub const CAM_HANDLE_USER_POINTER: u32 = 1;
/// Payload is addressed through a kernel memory handle.
pub const CAM_HANDLE_MEM_HANDLE: u32 = 2;

/// Header of the single multiplexed control ioctl. `handle` points at the
/// opcode-specific payload struct of `size` bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ControlCmd {
    pub op_code: u32,
    pub size: u32,
    pub handle_type: u32,
    pub reserved: u32,
    pub handle: u64,
}

pub const CAMLINK_IOC_CONTROL: u64 = iowr::<ControlCmd>(b'V', 192);

// ---------------------------------------------------------------------------
// Control payloads, one fixed layout per opcode
// ---------------------------------------------------------------------------

pub const CAM_MAX_MMU_HANDLES: usize = 4;
pub const CAM_MAX_LINKED_DEVICES: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionInfo {
    pub session_hdl: i32,
    pub reserved: [i32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IommuHandles {
    pub non_secure: i32,
    pub secure: i32,
}

/// Filled by the kernel on `CAM_QUERY_CAP`. `slot` is the hardware-reported
/// instance index used for sub-index assignment at discovery time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryCapCmd {
    pub version: u32,
    pub slot: u32,
    pub device_iommu: IommuHandles,
    pub stage_iommu: IommuHandles,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireDevCmd {
    pub session_hdl: i32,
    /// Out: kernel-assigned device handle.
    pub dev_hdl: i32,
    pub dev_index: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseDevCmd {
    pub session_hdl: i32,
    pub dev_hdl: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireHwCmd {
    pub session_hdl: i32,
    pub dev_hdl: i32,
    /// Out: kernel-assigned hardware-resource handle.
    pub hw_hdl: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseHwCmd {
    pub session_hdl: i32,
    pub hw_hdl: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigDevCmd {
    pub session_hdl: i32,
    pub dev_hdl: i32,
    pub packet_handle: i64,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StartStopCmd {
    pub session_hdl: i32,
    pub dev_hdl: i32,
}

/// Buffer is mapped into the caller's address space.
pub const CAM_MEM_FLAG_UMD_ACCESS: u32 = 1 << 0;
/// Hardware may read and write the buffer.
pub const CAM_MEM_FLAG_HW_READ_WRITE: u32 = 1 << 1;
/// Buffer holds command packets.
pub const CAM_MEM_FLAG_CMD_BUF: u32 = 1 << 2;
/// Buffer is shared with kernel-side consumers.
pub const CAM_MEM_FLAG_KMD_ACCESS: u32 = 1 << 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BufHandleResult {
    pub buf_handle: i64,
    pub fd: i32,
    pub reserved: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocBufCmd {
    pub len: u64,
    pub align: u64,
    pub mmu_hdls: [i32; CAM_MAX_MMU_HANDLES],
    pub num_hdls: u32,
    pub flags: u32,
    pub out: BufHandleResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MapBufCmd {
    pub fd: i32,
    pub reserved: u32,
    pub offset: u64,
    pub len: u64,
    pub mmu_hdls: [i32; CAM_MAX_MMU_HANDLES],
    pub num_hdls: u32,
    pub flags: u32,
    pub out: BufHandleResult,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseBufCmd {
    pub buf_handle: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCmd {
    pub session_hdl: i32,
    pub num_devices: u32,
    pub dev_hdls: [i32; CAM_MAX_LINKED_DEVICES],
    /// Out: kernel-assigned link handle.
    pub link_hdl: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlinkCmd {
    pub session_hdl: i32,
    pub link_hdl: i32,
}

pub const CAM_SYNC_MODE_NO_SYNC: u32 = 0;
pub const CAM_SYNC_MODE_SYNC: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedReqCmd {
    pub session_hdl: i32,
    pub link_hdl: i32,
    pub req_id: u64,
    pub bubble_enable: u32,
    pub sync_mode: u32,
}

// ---------------------------------------------------------------------------
// Command packet binary layout
// ---------------------------------------------------------------------------

/// Packet carries the initial device configuration blob.
pub const CAM_PACKET_INIT_CONFIG: u32 = 1;
/// Packet carries one frame submission.
pub const CAM_PACKET_FRAME: u32 = 2;

/// Generic command buffer consumed by the kernel driver.
pub const CAM_CMD_BUF_GENERIC: u32 = 1;

/// Fixed packet header. The three region offsets are byte offsets from the
/// start of the header; the region counts must never exceed the capacities
/// fixed when the owning pool was allocated.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketHeader {
    pub size: u32,
    pub op_code: u32,
    pub request_id: u64,
    pub cmd_buf_offset: u32,
    pub num_cmd_bufs: u32,
    pub io_config_offset: u32,
    pub num_io_configs: u32,
    pub patch_offset: u32,
    pub num_patches: u32,
    /// Index of the command buffer consumed by the kernel driver itself.
    pub kmd_cmd_buf_index: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdBufDesc {
    pub mem_handle: i64,
    pub offset: u32,
    pub size: u32,
    pub length: u32,
    pub kind: u32,
    pub meta_data: u32,
    pub reserved: u32,
}

pub const CAM_BUF_INPUT: u32 = 1;
pub const CAM_BUF_OUTPUT: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferIoConfig {
    pub mem_handle: i64,
    pub offset: u32,
    pub length: u32,
    pub format: u32,
    pub direction: u32,
    pub fence: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrPatch {
    pub dst_buf_hdl: i64,
    pub src_buf_hdl: i64,
    pub dst_offset: u32,
    pub src_offset: u32,
}

// ---------------------------------------------------------------------------
// Event subscription and delivery
// ---------------------------------------------------------------------------

pub const CAM_EVENT_CLASS_SOF: u32 = 1;
pub const CAM_EVENT_CLASS_ERROR: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeEventCmd {
    pub class: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SofEventData {
    pub frame_id: u64,
    pub request_id: u64,
    /// Device (qtimer-domain) timestamp in ticks.
    pub timestamp: u64,
    pub reserved: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ErrorEventData {
    pub error_type: u32,
    pub device_hdl: i32,
    pub request_id: u64,
    pub reserved: [u64; 2],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union EventPayload {
    pub sof: SofEventData,
    pub error: ErrorEventData,
    pub raw: [u8; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct EventEnvelope {
    pub class: u32,
    pub sequence: u32,
    pub payload: EventPayload,
}

pub const CAMLINK_IOC_SUBSCRIBE_EVENT: u64 = iow::<SubscribeEventCmd>(b'V', 90);
pub const CAMLINK_IOC_DQEVENT: u64 = ior::<EventEnvelope>(b'V', 89);

// ---------------------------------------------------------------------------
// Media-graph enumeration
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MediaDeviceInfo {
    pub driver: [u8; 16],
    pub model: [u8; 32],
    pub serial: [u8; 40],
    pub bus_info: [u8; 32],
    pub media_version: u32,
    pub hw_revision: u32,
    pub driver_version: u32,
    pub reserved: [u32; 31],
}

/// Set in the entity id to request the next entity during enumeration.
pub const MEDIA_ENT_ID_FLAG_NEXT: u32 = 1 << 31;

pub const ENTITY_FN_CSI_RECEIVER: u32 = 0x0101;
pub const ENTITY_FN_STREAM_OUTPUT: u32 = 0x0102;
pub const ENTITY_FN_SENSOR: u32 = 0x0201;
pub const ENTITY_FN_CONTROL: u32 = 0x0301;
pub const ENTITY_FN_SYNC: u32 = 0x0302;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MediaEntityDesc {
    pub id: u32,
    pub name: [u8; 32],
    pub function: u32,
    pub revision: u32,
    pub flags: u32,
    pub group_id: u32,
    pub pads: u16,
    pub links: u16,
    pub reserved: [u32; 4],
    pub dev_major: u32,
    pub dev_minor: u32,
}

pub const MEDIA_IOC_DEVICE_INFO: u64 = iowr::<MediaDeviceInfo>(b'|', 0x00);
pub const MEDIA_IOC_ENUM_ENTITIES: u64 = iowr::<MediaEntityDesc>(b'|', 0x01);

// ---------------------------------------------------------------------------
// Board-configuration module and driver-library C ABI
// ---------------------------------------------------------------------------

/// Protocol version compiled into this crate. A module reporting any other
/// value is rejected outright.
pub const BOARD_PROTOCOL_VERSION: u32 = 0x0004_0002;

/// Well-known library name of the board-configuration module.
pub const BOARD_MODULE_NAME: &str = "libcamboard.so";

pub const BOARD_QUERY_SYMBOL: &[u8] = b"camlink_board_query\0";
pub const BOARD_POWER_SYMBOL: &[u8] = b"camlink_board_power\0";
pub const BOARD_LIFECYCLE_SYMBOL: &[u8] = b"camlink_board_lifecycle\0";

pub const BOARD_MAX_PORTS: usize = 8;
pub const BOARD_NAME_LEN: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BoardPort {
    pub csi_index: u32,
    pub lane_count: u32,
    pub i2c_bus: u32,
    pub gpio_reset: i32,
    pub gpio_power: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct BoardTopology {
    pub num_ports: u32,
    pub reserved: u32,
    pub ports: [BoardPort; BOARD_MAX_PORTS],
}

/// One dynamically hosted device driver as described by the board module.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BoardDriverDesc {
    pub category: u32,
    pub device_id: u32,
    pub library: [c_char; BOARD_NAME_LEN],
    pub open_symbol: [c_char; BOARD_NAME_LEN],
}

/// Category-tagged query interface returned by the module entry point. Null
/// function slots are treated as absent capabilities by the loader.
#[repr(C)]
pub struct BoardQueryInterface {
    pub size: u32,
    pub category: u32,
    pub get_protocol_version: Option<unsafe extern "C" fn() -> u32>,
    pub get_topology: Option<unsafe extern "C" fn(*mut BoardTopology) -> c_int>,
    pub get_driver_list:
        Option<unsafe extern "C" fn(*mut BoardDriverDesc, u32, *mut u32) -> c_int>,
    pub get_channel_map: Option<unsafe extern "C" fn(u32, *mut u32) -> c_int>,
}

#[repr(C)]
pub struct BoardPowerInterface {
    pub pre_power: Option<unsafe extern "C" fn(u32) -> c_int>,
    pub post_power: Option<unsafe extern "C" fn(u32) -> c_int>,
}

#[repr(C)]
pub struct BoardLifecycleInterface {
    pub init: Option<unsafe extern "C" fn() -> c_int>,
    pub deinit: Option<unsafe extern "C" fn() -> c_int>,
}

pub type BoardQueryFn = unsafe extern "C" fn() -> *const BoardQueryInterface;
pub type BoardPowerFn = unsafe extern "C" fn() -> *const BoardPowerInterface;
pub type BoardLifecycleFn = unsafe extern "C" fn() -> *const BoardLifecycleInterface;

pub type DriverCallbackFn = unsafe extern "C" fn(event: u32, user: *mut c_void);

/// Operations table filled by a driver library's open entry point.
#[repr(C)]
pub struct DriverOps {
    pub control: Option<
        unsafe extern "C" fn(
            ctx: *mut c_void,
            opcode: u32,
            input: *const c_void,
            input_len: usize,
            output: *mut c_void,
            output_len: usize,
            needed: *mut usize,
        ) -> c_int,
    >,
    pub register_callback:
        Option<unsafe extern "C" fn(ctx: *mut c_void, cb: DriverCallbackFn, user: *mut c_void) -> c_int>,
    pub close: Option<unsafe extern "C" fn(ctx: *mut c_void) -> c_int>,
}

/// Signature of the open symbol named by [`BoardDriverDesc::open_symbol`].
pub type DriverOpenFn =
    unsafe extern "C" fn(device_id: u32, ops: *mut DriverOps) -> *mut c_void;
