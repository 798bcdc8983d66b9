// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Device driver descriptors and the pluggable driver interface.
//!
//! Drivers come in two flavors: statically linked Rust implementations of
//! [`DeviceDriver`], and dynamically loaded libraries described by the board
//! module and wrapped by [`crate::board`]. The registry in [`crate::manager`]
//! treats both uniformly through the trait.

use crate::Error;
use std::fmt;

/// Numeric device identity as published by a board module or static table.
pub type DeviceId = u32;

/// Classification of a registered device driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceCategory {
    /// Image sensor behind a CSI receiver
    Sensor = 1,

    /// Physical CSI receiver front-end
    Receiver = 2,

    /// Flash or torch illuminator
    Flash = 3,

    /// Lens actuator (focus, OIS)
    Actuator = 4,

    /// Calibration EEPROM
    Eeprom = 5,

    /// Board-specific device outside the standard roles
    Custom = 6,
}

impl DeviceCategory {
    /// Convert from the raw value used by loaded modules.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(DeviceCategory::Sensor),
            2 => Some(DeviceCategory::Receiver),
            3 => Some(DeviceCategory::Flash),
            4 => Some(DeviceCategory::Actuator),
            5 => Some(DeviceCategory::Eeprom),
            6 => Some(DeviceCategory::Custom),
            _ => None,
        }
    }

    /// Get human-readable name for this category
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCategory::Sensor => "Sensor",
            DeviceCategory::Receiver => "Receiver",
            DeviceCategory::Flash => "Flash",
            DeviceCategory::Actuator => "Actuator",
            DeviceCategory::Eeprom => "EEPROM",
            DeviceCategory::Custom => "Custom",
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable driver-table entry. Created when the registry initializes, never
/// mutated afterwards, destroyed when the owning library is unloaded.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Driver classification
    pub category: DeviceCategory,

    /// Numeric device identity, unique within the registry
    pub id: DeviceId,

    /// Library name for dynamically hosted drivers, `None` for static ones
    pub library: Option<String>,

    /// Open entry-point symbol for dynamically hosted drivers
    pub open_symbol: Option<String>,
}

impl DeviceInfo {
    /// Descriptor for a statically linked driver.
    pub fn new_static(category: DeviceCategory, id: DeviceId) -> Self {
        DeviceInfo {
            category,
            id,
            library: None,
            open_symbol: None,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.library {
            Some(lib) => write!(f, "{} {:#x} ({})", self.category, self.id, lib),
            None => write!(f, "{} {:#x} (static)", self.category, self.id),
        }
    }
}

/// Callback invoked by a driver to report device events. The event code is
/// driver-specific.
pub type DeviceCallback = Box<dyn FnMut(u32) + Send>;

/// One opened device. Obtained through [`crate::manager::DeviceManager::open`]
/// and returned to the registry with
/// [`crate::manager::DeviceManager::close`], which routes the driver's close
/// entry point through the registry lock.
pub struct DeviceHandle {
    pub(crate) id: DeviceId,
    pub(crate) instance: Option<Box<dyn DeviceInstance>>,
}

impl DeviceHandle {
    /// Identity of the driver this handle was opened from.
    pub fn id(&self) -> DeviceId {
        self.id
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("open", &self.instance.is_some())
            .finish()
    }
}

/// A device driver hosted by the registry. Implementations open device
/// instances; everything else goes through [`DeviceInstance`].
pub trait DeviceDriver: Send + Sync {
    fn open(&self) -> Result<Box<dyn DeviceInstance>, Error>;
}

/// One live device opened by a [`DeviceDriver`].
pub trait DeviceInstance: Send {
    /// Execute a driver-specific control transaction.
    ///
    /// Writes at most `output.len()` bytes and returns the number of bytes
    /// the full reply requires, which may exceed `output.len()` when the
    /// caller's buffer is too small.
    fn control(&mut self, opcode: u32, input: &[u8], output: &mut [u8]) -> Result<usize, Error>;

    /// Register the single event callback for this instance, replacing any
    /// previous one.
    fn register_callback(&mut self, callback: DeviceCallback) -> Result<(), Error>;

    /// Release the device. Called exactly once by the registry.
    fn close(&mut self) -> Result<(), Error>;
}
