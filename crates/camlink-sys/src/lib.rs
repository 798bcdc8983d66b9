// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Low-level kernel ABI for the camlink camera pipeline manager.
//!
//! This crate holds everything that crosses the kernel boundary as raw bytes:
//! the multiplexed control call, per-opcode payload layouts, the command
//! packet binary format, event envelopes, media-graph enumeration structs,
//! and the C ABI of loadable board/driver modules. The safe orchestration
//! API lives in the `camlink` crate; nothing here should be used directly
//! unless you are implementing a new transport.
//!
//! The uAPI definitions are hand-maintained against the kernel headers.
//! Struct sizes are pinned by unit tests so accidental layout drift fails
//! the test suite rather than the hardware.

mod uapi;
pub use uapi::*;

use std::io;
use std::os::fd::RawFd;

/// Issue one multiplexed control request. Returns the kernel's errno as an
/// [`io::Error`] when the ioctl reports failure (negative return).
///
/// # Safety
///
/// `cmd.handle` must point at a valid, writable payload of `cmd.size` bytes
/// matching the layout the opcode expects, and `fd` must be a control node.
pub unsafe fn camlink_control(fd: RawFd, cmd: &mut ControlCmd) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, CAMLINK_IOC_CONTROL as libc::c_ulong, cmd as *mut _) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Subscribe the control descriptor to one event class.
///
/// # Safety
///
/// `fd` must be an open control node.
pub unsafe fn subscribe_event(fd: RawFd, sub: &SubscribeEventCmd) -> io::Result<()> {
    let ret = unsafe {
        libc::ioctl(
            fd,
            CAMLINK_IOC_SUBSCRIBE_EVENT as libc::c_ulong,
            sub as *const _,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Dequeue one pending event envelope. Fails with `EAGAIN` when the queue is
/// empty; callers are expected to [`wait_readable`] first.
///
/// # Safety
///
/// `fd` must be an open control node.
pub unsafe fn dequeue_event(fd: RawFd, event: &mut EventEnvelope) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, CAMLINK_IOC_DQEVENT as libc::c_ulong, event as *mut _) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Query the media device description of an enumeration node.
///
/// # Safety
///
/// `fd` must be an open media node.
pub unsafe fn media_device_info(fd: RawFd, info: &mut MediaDeviceInfo) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, MEDIA_IOC_DEVICE_INFO as libc::c_ulong, info as *mut _) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Fetch the next entity descriptor. Set [`MEDIA_ENT_ID_FLAG_NEXT`] in
/// `desc.id` before the call to walk the graph. Returns `Ok(false)` when the
/// graph is exhausted (`EINVAL`/`ENODEV` from the kernel).
///
/// # Safety
///
/// `fd` must be an open media node.
pub unsafe fn media_enum_entities(fd: RawFd, desc: &mut MediaEntityDesc) -> io::Result<bool> {
    let ret = unsafe { libc::ioctl(fd, MEDIA_IOC_ENUM_ENTITIES as libc::c_ulong, desc as *mut _) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EINVAL) | Some(libc::ENODEV) => Ok(false),
            _ => Err(err),
        };
    }
    Ok(true)
}

/// Block until `fd` becomes readable or `timeout_ms` elapses. A negative
/// timeout blocks indefinitely. Returns `Ok(false)` on timeout.
pub fn wait_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

/// Current CLOCK_MONOTONIC reading in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn control_cmd_layout() {
        assert_eq!(size_of::<ControlCmd>(), 24);
    }

    #[test]
    fn packet_layouts() {
        assert_eq!(size_of::<PacketHeader>(), 48);
        assert_eq!(size_of::<CmdBufDesc>(), 32);
        assert_eq!(size_of::<BufferIoConfig>(), 32);
        assert_eq!(size_of::<AddrPatch>(), 24);
    }

    #[test]
    fn event_layouts() {
        assert_eq!(size_of::<SofEventData>(), 32);
        assert_eq!(size_of::<ErrorEventData>(), 32);
        assert_eq!(size_of::<EventEnvelope>(), 40);
    }

    #[test]
    fn buffer_payload_layouts() {
        assert_eq!(size_of::<AllocBufCmd>(), 56);
        assert_eq!(size_of::<MapBufCmd>(), 64);
        assert_eq!(size_of::<LinkCmd>(), 48);
        assert_eq!(size_of::<SchedReqCmd>(), 24);
    }

    #[test]
    fn ioc_encoding() {
        // _IOWR('V', 192, 24-byte struct): dir=3, type=0x56, nr=0xC0, size=24
        let expected = (3u64 << 30) | (24u64 << 16) | (0x56u64 << 8) | 0xC0u64;
        assert_eq!(CAMLINK_IOC_CONTROL, expected);
    }

    #[test]
    fn monotonic_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
