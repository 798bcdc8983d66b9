// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Board-configuration module loader.
//!
//! The board module is a shared library located by a fixed well-known name
//! (override with `CAMLINK_BOARD_MODULE`). Its entry point returns a query
//! interface with four slots: protocol version and board topology are
//! mandatory, the driver list and channel map are optional. Two further
//! interfaces (power hooks, init/deinit hooks) are discovered independently
//! and modeled as absent capabilities when their entry points are missing.
//!
//! Per-sensor driver libraries named by the board module are wrapped here as
//! [`DeviceDriver`] trait objects over their C operations table.

use crate::device::{DeviceCallback, DeviceCategory, DeviceDriver, DeviceInfo, DeviceInstance};
use crate::Error;
use camlink_sys as sys;
use libloading::Library;
use std::ffi::{c_char, c_void};
use std::io;
use std::sync::{Arc, Mutex};

/// One physical camera port from the board topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Index of the CSI receiver this port is wired to
    pub csi_index: u32,
    /// Number of active data lanes
    pub lane_count: u32,
    /// I2C bus carrying the sensor control interface
    pub i2c_bus: u32,
    /// Reset GPIO, if wired
    pub gpio_reset: Option<u32>,
    /// Power-enable GPIO, if wired
    pub gpio_power: Option<u32>,
}

impl PortDescriptor {
    fn from_raw(raw: &sys::BoardPort) -> Self {
        PortDescriptor {
            csi_index: raw.csi_index,
            lane_count: raw.lane_count,
            i2c_bus: raw.i2c_bus,
            gpio_reset: u32::try_from(raw.gpio_reset).ok(),
            gpio_power: u32::try_from(raw.gpio_power).ok(),
        }
    }
}

/// A loaded board-configuration module.
#[derive(Debug)]
pub struct BoardModule {
    query: *const sys::BoardQueryInterface,
    power: Option<*const sys::BoardPowerInterface>,
    lifecycle: Option<*const sys::BoardLifecycleInterface>,
    version: u32,
    // Dropped last; every raw pointer above points into this mapping.
    _library: Library,
}

// SAFETY: the interface tables are immutable static data inside the loaded
// module and stay mapped for the lifetime of `_library`.
unsafe impl Send for BoardModule {}
unsafe impl Sync for BoardModule {}

impl BoardModule {
    /// Load and validate a board module. Missing mandatory entry points and
    /// protocol-version mismatches are hard failures.
    pub fn load(library: &str) -> Result<Self, Error> {
        let lib = unsafe { Library::new(library)? };

        let entry = unsafe { lib.get::<sys::BoardQueryFn>(sys::BOARD_QUERY_SYMBOL)? };
        let query = unsafe { entry() };
        if query.is_null() {
            return Err(Error::NullPointer);
        }

        let table = unsafe { &*query };
        let get_version = table
            .get_protocol_version
            .ok_or(Error::SymbolNotFound("get_protocol_version"))?;
        if table.get_topology.is_none() {
            return Err(Error::SymbolNotFound("get_topology"));
        }

        let version = unsafe { get_version() };
        if version != sys::BOARD_PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: sys::BOARD_PROTOCOL_VERSION,
                found: version,
            });
        }

        // Optional interfaces: a missing entry point or a null table means
        // the capability is absent, never an error.
        let power = unsafe { lib.get::<sys::BoardPowerFn>(sys::BOARD_POWER_SYMBOL) }
            .ok()
            .map(|entry| unsafe { entry() })
            .filter(|ptr| !ptr.is_null());
        let lifecycle = unsafe { lib.get::<sys::BoardLifecycleFn>(sys::BOARD_LIFECYCLE_SYMBOL) }
            .ok()
            .map(|entry| unsafe { entry() })
            .filter(|ptr| !ptr.is_null());

        log::debug!(
            "board module {} loaded, protocol {:#x}, power hooks {}, lifecycle hooks {}",
            library,
            version,
            power.is_some(),
            lifecycle.is_some(),
        );

        Ok(BoardModule {
            query,
            power,
            lifecycle,
            version,
            _library: lib,
        })
    }

    /// Protocol version reported by the module.
    pub fn protocol_version(&self) -> u32 {
        self.version
    }

    /// Query the board topology.
    pub fn topology(&self) -> Result<Vec<PortDescriptor>, Error> {
        let table = unsafe { &*self.query };
        let get_topology = table
            .get_topology
            .ok_or(Error::SymbolNotFound("get_topology"))?;

        let mut raw = sys::BoardTopology {
            num_ports: 0,
            reserved: 0,
            ports: [sys::BoardPort {
                csi_index: 0,
                lane_count: 0,
                i2c_bus: 0,
                gpio_reset: -1,
                gpio_power: -1,
                reserved: 0,
            }; sys::BOARD_MAX_PORTS],
        };
        let ret = unsafe { get_topology(&mut raw) };
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret).into());
        }

        let count = (raw.num_ports as usize).min(sys::BOARD_MAX_PORTS);
        Ok(raw.ports[..count].iter().map(PortDescriptor::from_raw).collect())
    }

    /// Query the dynamically hosted device drivers. A module without the
    /// driver-list capability hosts no dynamic drivers.
    pub fn driver_list(&self) -> Result<Vec<DeviceInfo>, Error> {
        let table = unsafe { &*self.query };
        let get_list = match table.get_driver_list {
            Some(f) => f,
            None => return Ok(Vec::new()),
        };

        let mut raw = [zeroed_driver_desc(); MAX_DRIVER_DESCS];
        let mut count: u32 = 0;
        let ret =
            unsafe { get_list(raw.as_mut_ptr(), MAX_DRIVER_DESCS as u32, &mut count) };
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret).into());
        }

        let mut drivers = Vec::new();
        for desc in raw.iter().take((count as usize).min(MAX_DRIVER_DESCS)) {
            match driver_info(desc) {
                Ok(info) => drivers.push(info),
                Err(err) => log::warn!("ignoring malformed driver entry: {}", err),
            }
        }
        Ok(drivers)
    }

    /// Map a logical channel to a device identity, if the module provides a
    /// channel map.
    pub fn channel_map(&self, channel: u32) -> Result<Option<u32>, Error> {
        let table = unsafe { &*self.query };
        let get_map = match table.get_channel_map {
            Some(f) => f,
            None => return Ok(None),
        };

        let mut device_id: u32 = 0;
        let ret = unsafe { get_map(channel, &mut device_id) };
        if ret < 0 {
            return Ok(None);
        }
        Ok(Some(device_id))
    }

    /// Run the optional pre-power hook for one port.
    pub fn pre_power(&self, port: u32) -> Result<(), Error> {
        self.power_hook(port, |table| table.pre_power)
    }

    /// Run the optional post-power hook for one port.
    pub fn post_power(&self, port: u32) -> Result<(), Error> {
        self.power_hook(port, |table| table.post_power)
    }

    fn power_hook(
        &self,
        port: u32,
        select: impl Fn(&sys::BoardPowerInterface) -> Option<unsafe extern "C" fn(u32) -> i32>,
    ) -> Result<(), Error> {
        let Some(table) = self.power else {
            return Ok(());
        };
        let Some(hook) = select(unsafe { &*table }) else {
            return Ok(());
        };
        let ret = unsafe { hook(port) };
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret).into());
        }
        Ok(())
    }

    /// Run the optional module init hook.
    pub(crate) fn init(&self) {
        if let Some(table) = self.lifecycle {
            if let Some(init) = unsafe { &*table }.init {
                let ret = unsafe { init() };
                if ret < 0 {
                    log::warn!("board module init hook failed: {}", ret);
                }
            }
        }
    }

    /// Run the optional module deinit hook.
    pub(crate) fn deinit(&self) {
        if let Some(table) = self.lifecycle {
            if let Some(deinit) = unsafe { &*table }.deinit {
                let ret = unsafe { deinit() };
                if ret < 0 {
                    log::warn!("board module deinit hook failed: {}", ret);
                }
            }
        }
    }
}

const MAX_DRIVER_DESCS: usize = 16;

fn zeroed_driver_desc() -> sys::BoardDriverDesc {
    sys::BoardDriverDesc {
        category: 0,
        device_id: 0,
        library: [0; sys::BOARD_NAME_LEN],
        open_symbol: [0; sys::BOARD_NAME_LEN],
    }
}

fn cstr_field(field: &[c_char]) -> Result<String, Error> {
    // The descriptor arrays are fixed width; require a terminator inside.
    let bytes: &[u8] = unsafe { std::slice::from_raw_parts(field.as_ptr().cast(), field.len()) };
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::InvalidParameter("unterminated descriptor string"))?;
    Ok(std::str::from_utf8(&bytes[..nul])?.to_string())
}

fn driver_info(desc: &sys::BoardDriverDesc) -> Result<DeviceInfo, Error> {
    let category = DeviceCategory::from_raw(desc.category)
        .ok_or(Error::InvalidParameter("unknown driver category"))?;
    let library = cstr_field(&desc.library)?;
    let open_symbol = cstr_field(&desc.open_symbol)?;
    if library.is_empty() || open_symbol.is_empty() {
        return Err(Error::InvalidParameter("empty driver library or symbol"));
    }
    Ok(DeviceInfo {
        category,
        id: desc.device_id,
        library: Some(library),
        open_symbol: Some(open_symbol),
    })
}

/// Load the driver library named by a dynamic device entry and wrap it as a
/// [`DeviceDriver`].
pub fn load_driver(info: &DeviceInfo) -> Result<Arc<dyn DeviceDriver>, Error> {
    let library = info
        .library
        .as_deref()
        .ok_or(Error::InvalidParameter("driver entry has no library"))?;
    let symbol = info
        .open_symbol
        .as_deref()
        .ok_or(Error::InvalidParameter("driver entry has no open symbol"))?;

    let lib = Arc::new(unsafe { Library::new(library)? });

    let mut name = symbol.as_bytes().to_vec();
    name.push(0);
    let open = unsafe { lib.get::<sys::DriverOpenFn>(&*name)? };
    // Detach the symbol lifetime; the Arc<Library> kept below outlives it.
    let open = unsafe { open.into_raw() };

    Ok(Arc::new(LoadedDriver {
        device_id: info.id,
        open,
        library: lib,
    }))
}

/// A dynamically loaded driver library.
struct LoadedDriver {
    device_id: u32,
    open: libloading::os::unix::Symbol<sys::DriverOpenFn>,
    library: Arc<Library>,
}

impl DeviceDriver for LoadedDriver {
    fn open(&self) -> Result<Box<dyn DeviceInstance>, Error> {
        let mut ops = sys::DriverOps {
            control: None,
            register_callback: None,
            close: None,
        };
        let ctx = unsafe { (self.open)(self.device_id, &mut ops) };
        if ctx.is_null() {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Box::new(LoadedInstance {
            ctx,
            ops,
            callback: Box::new(Mutex::new(None)),
            registered: false,
            _library: self.library.clone(),
        }))
    }
}

type CallbackCell = Mutex<Option<DeviceCallback>>;

unsafe extern "C" fn callback_trampoline(event: u32, user: *mut c_void) {
    let cell = unsafe { &*(user as *const CallbackCell) };
    if let Ok(mut guard) = cell.lock() {
        if let Some(callback) = guard.as_mut() {
            callback(event);
        }
    }
}

/// One opened dynamically loaded device.
struct LoadedInstance {
    ctx: *mut c_void,
    ops: sys::DriverOps,
    // Boxed for a stable address handed to the driver as callback user data.
    callback: Box<CallbackCell>,
    registered: bool,
    _library: Arc<Library>,
}

// SAFETY: the driver context is only touched through the ops table, which
// the driver contract requires to be callable from any single thread at a
// time; DeviceInstance hands out &mut receivers only.
unsafe impl Send for LoadedInstance {}

impl DeviceInstance for LoadedInstance {
    fn control(&mut self, opcode: u32, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        let control = self.ops.control.ok_or(Error::SymbolNotFound("control"))?;
        let mut needed: usize = 0;
        let ret = unsafe {
            control(
                self.ctx,
                opcode,
                input.as_ptr().cast(),
                input.len(),
                output.as_mut_ptr().cast(),
                output.len(),
                &mut needed,
            )
        };
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret).into());
        }
        Ok(needed)
    }

    fn register_callback(&mut self, callback: DeviceCallback) -> Result<(), Error> {
        if !self.registered {
            let register = self
                .ops
                .register_callback
                .ok_or(Error::SymbolNotFound("register_callback"))?;
            let user = self.callback.as_ref() as *const CallbackCell as *mut c_void;
            let ret = unsafe { register(self.ctx, callback_trampoline, user) };
            if ret < 0 {
                return Err(io::Error::from_raw_os_error(-ret).into());
            }
            self.registered = true;
        }

        if let Ok(mut guard) = self.callback.lock() {
            *guard = Some(callback);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let close = self.ops.close.ok_or(Error::SymbolNotFound("close"))?;
        let ret = unsafe { close(self.ctx) };
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret).into());
        }
        // Quiesce the trampoline before the context goes away.
        if let Ok(mut guard) = self.callback.lock() {
            *guard = None;
        }
        Ok(())
    }
}
