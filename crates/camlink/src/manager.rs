// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Device driver registry.
//!
//! The [`DeviceManager`] owns the table of known device drivers. Statically
//! linked drivers are handed in through [`DeviceManagerConfig`]; dynamically
//! hosted drivers are described by the board-configuration module and loaded
//! best-effort during [`DeviceManager::initialize`]. A driver library that
//! fails to load is logged and skipped so a missing optional device never
//! blocks the rest of the system; a board module that is configured but
//! broken fails initialization outright.

use crate::board::BoardModule;
use crate::device::{DeviceCallback, DeviceCategory, DeviceDriver, DeviceHandle, DeviceId, DeviceInfo};
use crate::Error;
use std::sync::{Arc, Mutex};

/// Fixed capacity of the registered-device table.
pub const MAX_REGISTERED_DEVICES: usize = 64;

/// One slot of the driver table.
struct RegisteredDevice {
    info: DeviceInfo,
    driver: Arc<dyn DeviceDriver>,
}

/// Construction-time configuration for [`DeviceManager`].
#[derive(Default)]
pub struct DeviceManagerConfig {
    static_drivers: Vec<(DeviceInfo, Arc<dyn DeviceDriver>)>,
    board_module: Option<String>,
}

impl DeviceManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a statically linked driver registered on every initialize.
    pub fn with_static_driver(
        mut self,
        info: DeviceInfo,
        driver: Arc<dyn DeviceDriver>,
    ) -> Self {
        self.static_drivers.push((info, driver));
        self
    }

    /// Load the named board-configuration module during initialize. A module
    /// that cannot be loaded is a hard initialization failure.
    pub fn with_board_module(mut self, library: impl Into<String>) -> Self {
        self.board_module = Some(library.into());
        self
    }

    /// Use the well-known board module name, honoring the
    /// `CAMLINK_BOARD_MODULE` environment variable override.
    pub fn with_default_board_module(self) -> Self {
        let name = std::env::var("CAMLINK_BOARD_MODULE")
            .unwrap_or_else(|_| camlink_sys::BOARD_MODULE_NAME.to_string());
        self.with_board_module(name)
    }
}

struct ManagerState {
    init_count: u32,
    devices: Vec<RegisteredDevice>,
    board: Option<BoardModule>,
}

/// Registry of device drivers. All table reads and writes are serialized by
/// one internal mutex, so concurrent `open` and `available_devices` calls
/// observe a consistent snapshot.
pub struct DeviceManager {
    config: DeviceManagerConfig,
    state: Mutex<ManagerState>,
}

impl DeviceManager {
    /// Create an uninitialized registry. No drivers are visible until
    /// [`initialize`](Self::initialize) runs.
    pub fn new(config: DeviceManagerConfig) -> Self {
        DeviceManager {
            config,
            state: Mutex::new(ManagerState {
                init_count: 0,
                devices: Vec::with_capacity(MAX_REGISTERED_DEVICES),
                board: None,
            }),
        }
    }

    /// Initialize the registry: reset the table, register the static
    /// drivers, then load the board module and its dynamically hosted
    /// drivers. Nested calls are reference-counted and must be balanced by
    /// [`uninitialize`](Self::uninitialize).
    pub fn initialize(&self) -> Result<(), Error> {
        let mut state = self.lock();

        if state.init_count > 0 {
            state.init_count += 1;
            return Ok(());
        }

        state.devices.clear();

        for (info, driver) in &self.config.static_drivers {
            Self::register_locked(&mut state, info.clone(), driver.clone())?;
        }

        if let Some(library) = &self.config.board_module {
            let board = BoardModule::load(library)?;
            board.init();

            for info in board.driver_list()? {
                let driver = match crate::board::load_driver(&info) {
                    Ok(driver) => driver,
                    Err(err) => {
                        log::warn!("skipping device {}: {}", info, err);
                        continue;
                    }
                };
                Self::register_locked(&mut state, info, driver)?;
            }

            state.board = Some(board);
        }

        state.init_count = 1;
        Ok(())
    }

    /// Release one initialization reference. On the last matching call the
    /// dynamically loaded libraries are dropped and the table is emptied.
    /// Calling without a matching initialize is a state error.
    pub fn uninitialize(&self) -> Result<(), Error> {
        let mut state = self.lock();

        if state.init_count == 0 {
            return Err(Error::InvalidState("uninitialize without initialize"));
        }

        state.init_count -= 1;
        if state.init_count == 0 {
            if let Some(board) = state.board.take() {
                board.deinit();
            }
            // Dropping the table releases the driver libraries.
            state.devices.clear();
        }
        Ok(())
    }

    /// Register one device driver. Fails with a state error before
    /// initialize and a capacity error once the fixed table is full.
    pub fn register_device(
        &self,
        info: DeviceInfo,
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        if state.init_count == 0 {
            return Err(Error::InvalidState("registry is not initialized"));
        }
        Self::register_locked(&mut state, info, driver)
    }

    fn register_locked(
        state: &mut ManagerState,
        info: DeviceInfo,
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<(), Error> {
        if state.devices.len() >= MAX_REGISTERED_DEVICES {
            return Err(Error::CapacityExceeded("registered-device table"));
        }
        log::debug!("registered device {}", info);
        state.devices.push(RegisteredDevice { info, driver });
        Ok(())
    }

    /// List the identities of all registered devices of one category, in
    /// registration order.
    ///
    /// Fills `out` with as many identities as fit and returns the total
    /// match count, which may exceed `out.len()`. Passing an empty slice is
    /// a count-only probe.
    pub fn available_devices(
        &self,
        category: DeviceCategory,
        out: &mut [DeviceId],
    ) -> Result<usize, Error> {
        let state = self.lock();
        if state.init_count == 0 {
            return Err(Error::InvalidState("registry is not initialized"));
        }

        let mut needed = 0;
        for device in &state.devices {
            if device.info.category != category {
                continue;
            }
            if needed < out.len() {
                out[needed] = device.info.id;
            }
            needed += 1;
        }
        Ok(needed)
    }

    /// Open the device with the given identity. The table scan and the
    /// driver's open entry point both run under the registry lock.
    pub fn open(&self, id: DeviceId) -> Result<DeviceHandle, Error> {
        let state = self.lock();
        if state.init_count == 0 {
            return Err(Error::InvalidState("registry is not initialized"));
        }

        let device = state
            .devices
            .iter()
            .find(|d| d.info.id == id)
            .ok_or(Error::UnsupportedClass(id))?;

        let instance = device.driver.open()?;
        Ok(DeviceHandle {
            id,
            instance: Some(instance),
        })
    }

    /// Close an opened device, routing the driver's close entry point
    /// through the registry lock the handle was opened under.
    pub fn close(&self, mut handle: DeviceHandle) -> Result<(), Error> {
        let _state = self.lock();
        let mut instance = handle
            .instance
            .take()
            .ok_or(Error::InvalidState("device already closed"))?;
        instance.close()
    }

    /// Execute a driver-specific control transaction on an opened device.
    /// Returns the number of bytes the full reply requires.
    pub fn control(
        &self,
        handle: &mut DeviceHandle,
        opcode: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error> {
        let _state = self.lock();
        let instance = handle
            .instance
            .as_mut()
            .ok_or(Error::InvalidState("device is closed"))?;
        instance.control(opcode, input, output)
    }

    /// Register the event callback for an opened device, replacing any
    /// previous one.
    pub fn register_callback(
        &self,
        handle: &mut DeviceHandle,
        callback: DeviceCallback,
    ) -> Result<(), Error> {
        let _state = self.lock();
        let instance = handle
            .instance
            .as_mut()
            .ok_or(Error::InvalidState("device is closed"))?;
        instance.register_callback(callback)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        // A poisoned registry lock means a driver panicked mid-registration;
        // the table contents are still structurally sound.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInstance;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubDriver {
        opens: AtomicU32,
        fail_open: bool,
    }

    impl StubDriver {
        fn new() -> Arc<Self> {
            Arc::new(StubDriver {
                opens: AtomicU32::new(0),
                fail_open: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(StubDriver {
                opens: AtomicU32::new(0),
                fail_open: true,
            })
        }
    }

    impl DeviceDriver for StubDriver {
        fn open(&self) -> Result<Box<dyn DeviceInstance>, Error> {
            if self.fail_open {
                return Err(Error::Resource("stub device out of instances"));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(StubInstance { closed: false }))
        }
    }

    struct StubInstance {
        closed: bool,
    }

    impl DeviceInstance for StubInstance {
        fn control(
            &mut self,
            opcode: u32,
            _input: &[u8],
            output: &mut [u8],
        ) -> Result<usize, Error> {
            let reply = opcode.to_le_bytes();
            let n = reply.len().min(output.len());
            output[..n].copy_from_slice(&reply[..n]);
            Ok(reply.len())
        }

        fn register_callback(&mut self, _callback: DeviceCallback) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            assert!(!self.closed);
            self.closed = true;
            Ok(())
        }
    }

    fn sensor_info(id: DeviceId) -> DeviceInfo {
        DeviceInfo::new_static(DeviceCategory::Sensor, id)
    }

    fn manager_with_static_sensor() -> DeviceManager {
        let config = DeviceManagerConfig::new()
            .with_static_driver(sensor_info(0x30), StubDriver::new());
        DeviceManager::new(config)
    }

    #[test]
    fn initialize_registers_static_devices() {
        // End-to-end: one static SENSOR, no board module.
        let manager = manager_with_static_sensor();
        manager.initialize().unwrap();

        let mut out = [0; 4];
        let count = manager
            .available_devices(DeviceCategory::Sensor, &mut out)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(out[0], 0x30);
    }

    #[test]
    fn uninitialized_registry_rejects_calls() {
        let manager = manager_with_static_sensor();
        let mut out = [0; 1];
        assert!(matches!(
            manager.available_devices(DeviceCategory::Sensor, &mut out),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            manager.register_device(sensor_info(1), StubDriver::new()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            manager.uninitialize(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn nested_initialize_is_reference_counted() {
        let manager = manager_with_static_sensor();
        manager.initialize().unwrap();
        manager.initialize().unwrap();

        manager.uninitialize().unwrap();
        // Still initialized after the first uninitialize.
        let mut out = [0; 1];
        assert_eq!(
            manager
                .available_devices(DeviceCategory::Sensor, &mut out)
                .unwrap(),
            1
        );

        manager.uninitialize().unwrap();
        assert!(matches!(
            manager.available_devices(DeviceCategory::Sensor, &mut out),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn available_devices_filters_by_category_in_registration_order() {
        let config = DeviceManagerConfig::new()
            .with_static_driver(sensor_info(7), StubDriver::new())
            .with_static_driver(
                DeviceInfo::new_static(DeviceCategory::Receiver, 8),
                StubDriver::new(),
            )
            .with_static_driver(sensor_info(9), StubDriver::new());
        let manager = DeviceManager::new(config);
        manager.initialize().unwrap();

        let mut out = [0; 4];
        let count = manager
            .available_devices(DeviceCategory::Sensor, &mut out)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(&out[..2], &[7, 9]);
    }

    #[test]
    fn available_devices_reports_needed_capacity_with_small_buffer() {
        let config = DeviceManagerConfig::new()
            .with_static_driver(sensor_info(1), StubDriver::new())
            .with_static_driver(sensor_info(2), StubDriver::new())
            .with_static_driver(sensor_info(3), StubDriver::new());
        let manager = DeviceManager::new(config);
        manager.initialize().unwrap();

        let mut out = [0; 1];
        let count = manager
            .available_devices(DeviceCategory::Sensor, &mut out)
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(out[0], 1);

        // Count-only probe with an empty slice.
        let count = manager
            .available_devices(DeviceCategory::Sensor, &mut [])
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn register_device_fails_at_capacity() {
        let manager = DeviceManager::new(DeviceManagerConfig::new());
        manager.initialize().unwrap();

        for id in 0..MAX_REGISTERED_DEVICES as u32 {
            manager
                .register_device(sensor_info(id), StubDriver::new())
                .unwrap();
        }
        assert!(matches!(
            manager.register_device(sensor_info(9999), StubDriver::new()),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn open_unknown_identity_is_unsupported_class() {
        let manager = manager_with_static_sensor();
        manager.initialize().unwrap();

        assert!(matches!(
            manager.open(0xdead),
            Err(Error::UnsupportedClass(0xdead))
        ));
    }

    #[test]
    fn open_propagates_driver_error() {
        let config = DeviceManagerConfig::new()
            .with_static_driver(sensor_info(5), StubDriver::failing());
        let manager = DeviceManager::new(config);
        manager.initialize().unwrap();

        assert!(matches!(manager.open(5), Err(Error::Resource(_))));
    }

    #[test]
    fn open_control_close_round_trip() {
        let manager = manager_with_static_sensor();
        manager.initialize().unwrap();

        let mut handle = manager.open(0x30).unwrap();
        assert_eq!(handle.id(), 0x30);

        let mut out = [0u8; 4];
        let needed = manager.control(&mut handle, 0xabcd, &[], &mut out).unwrap();
        assert_eq!(needed, 4);
        assert_eq!(u32::from_le_bytes(out), 0xabcd);

        // Short output buffer still reports the full reply length.
        let mut short = [0u8; 2];
        let needed = manager
            .control(&mut handle, 0x1234, &[], &mut short)
            .unwrap();
        assert_eq!(needed, 4);

        manager.close(handle).unwrap();
    }

    #[test]
    fn double_close_is_state_error() {
        let manager = manager_with_static_sensor();
        manager.initialize().unwrap();

        let mut handle = manager.open(0x30).unwrap();
        handle.instance.take().unwrap().close().unwrap();
        assert!(matches!(
            manager.close(handle),
            Err(Error::InvalidState(_))
        ));
    }
}
