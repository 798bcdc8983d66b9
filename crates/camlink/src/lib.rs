// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camlink Device Orchestration Core
//!
//! Camlink is the user-space orchestration layer for automotive camera
//! subsystems. It discovers camera hardware through the kernel media graph,
//! hosts pluggable sensor and device drivers, negotiates sessions with the
//! kernel-resident camera pipeline manager, and schedules per-frame hardware
//! requests with fence-based completion signaling.
//!
//! # Architecture
//!
//! - [`manager::DeviceManager`] - registry of statically linked and
//!   dynamically loaded device drivers
//! - [`board::BoardModule`] - board-specific configuration module loaded at
//!   registry initialization
//! - [`discovery`] - kernel media-graph enumeration and role classification
//! - [`receiver::CsiReceiver`] - reference-counted lifecycle of one physical
//!   CSI input shared by multiple logical streams
//! - [`session::SessionManager`] - control channel to the kernel pipeline
//!   manager: sessions, links, buffers, request scheduling, and the
//!   asynchronous event thread
//! - [`pipeline::StreamPipeline`] - per-logical-output command packet
//!   construction and buffer/fence bookkeeping
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use camlink::channel::KernelChannel;
//! use camlink::session::SessionManager;
//!
//! let channel = Arc::new(KernelChannel::open_default()?);
//! let manager = Arc::new(SessionManager::new(channel));
//! let caps = manager.query_capabilities()?;
//! let session = manager.create_session()?;
//! println!("session {:?} on hw v{:x}", session, caps.version);
//! # Ok::<(), camlink::Error>(())
//! ```
//!
//! # Threading
//!
//! All calls execute synchronously on the calling thread and may block on
//! kernel control round-trips. The one exception is the event thread owned by
//! [`session::SessionManager`], which delivers start-of-frame and error
//! notifications through a client callback until shut down.

use std::{
    error,
    ffi::NulError,
    fmt, io,
    num::TryFromIntError,
    str,
};

/// Error type for camlink operations
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An argument was null, out of range, or otherwise unusable
    InvalidParameter(&'static str),

    /// The operation is not valid in the object's current lifecycle state
    InvalidState(&'static str),

    /// A fixed-capacity table or packet region is full
    CapacityExceeded(&'static str),

    /// No registered driver matches the requested device identity
    UnsupportedClass(u32),

    /// A kernel control request returned failure; `code` is the raw errno
    Hardware { op: &'static str, code: i32 },

    /// Out of memory, or a mapping/allocation beyond kernel state failed
    Resource(&'static str),

    /// The buffer was never mapped, or was already released
    NotMapped,

    /// A loadable module could not be opened at runtime
    Library(libloading::Error),

    /// A required entry point is missing from a loaded module
    SymbolNotFound(&'static str),

    /// A loaded module reports a protocol version other than the compiled-in
    /// expectation
    VersionMismatch { expected: u32, found: u32 },

    /// Null pointer returned where a valid interface was expected
    NullPointer,

    /// I/O error from underlying system calls
    Io(io::Error),

    /// UTF-8 conversion error when converting C strings to Rust strings
    Utf8(str::Utf8Error),

    /// CString creation error (null byte found in string)
    CString(NulError),

    /// Integer conversion error (try_from failed)
    TryFromInt(TryFromIntError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidParameter(what) => write!(f, "invalid parameter: {}", what),
            Error::InvalidState(what) => write!(f, "invalid state: {}", what),
            Error::CapacityExceeded(what) => write!(f, "capacity exceeded: {}", what),
            Error::UnsupportedClass(id) => {
                write!(f, "device class {:#x} is not supported", id)
            }
            Error::Hardware { op, code } => {
                write!(f, "{} control request failed with code {}", op, code)
            }
            Error::Resource(what) => write!(f, "resource failure: {}", what),
            Error::NotMapped => write!(f, "buffer is not mapped"),
            Error::Library(err) => write!(f, "module could not be loaded: {}", err),
            Error::SymbolNotFound(sym) => write!(f, "entry point not found: {}", sym),
            Error::VersionMismatch { expected, found } => write!(
                f,
                "module protocol version {:#x} does not match expected {:#x}",
                found, expected
            ),
            Error::NullPointer => write!(f, "null pointer returned from loaded module"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Utf8(err) => write!(f, "UTF-8 conversion error: {}", err),
            Error::CString(err) => write!(f, "CString creation error: {}", err),
            Error::TryFromInt(err) => write!(f, "integer conversion error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Library(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Utf8(err) => Some(err),
            Error::CString(err) => Some(err),
            Error::TryFromInt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<libloading::Error> for Error {
    fn from(err: libloading::Error) -> Self {
        Error::Library(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(err: str::Utf8Error) -> Self {
        Error::Utf8(err)
    }
}

impl From<NulError> for Error {
    fn from(err: NulError) -> Self {
        Error::CString(err)
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::TryFromInt(err)
    }
}

/// The device module defines the driver trait and descriptor types.
pub mod device;

/// The manager module hosts the registry of device drivers.
pub mod manager;

/// The board module loads the board-specific configuration library.
pub mod board;

/// The discovery module enumerates the kernel media graph.
pub mod discovery;

/// The receiver module drives the physical CSI input lifecycle.
pub mod receiver;

/// The channel module defines the control protocol seam to the kernel.
pub mod channel;

/// The session module owns the control descriptor, sessions, and events.
pub mod session;

/// The packet module builds kernel-shared command packets.
pub mod packet;

/// The fence module provides per-buffer completion objects.
pub mod fence;

/// The pipeline module drives one logical hardware output path.
pub mod pipeline;
