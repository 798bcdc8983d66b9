// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Kernel media-graph enumeration.
//!
//! Discovery walks the enumerable media devices, classifies every entity by
//! hardware role, opens its device node, and records it in a
//! [`SubdeviceMap`] keyed by (role, sub-index). For roles that report their
//! own instance index (receiver, sensor) the sub-index comes from one
//! capability probe on the opened node, so numbering follows the hardware
//! rather than enumeration order.

use crate::Error;
use camlink_sys as sys;
use std::fmt;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

/// Hardware role of a discovered media entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRole {
    /// Physical CSI receiver front-end
    Receiver,
    /// Hardware stream-output node
    StreamOutput,
    /// Image sensor
    Sensor,
    /// Control node
    Control,
    /// Frame-synchronization node
    Sync,
}

impl EntityRole {
    /// Classify a media entity function code.
    pub fn from_function(function: u32) -> Option<Self> {
        match function {
            sys::ENTITY_FN_CSI_RECEIVER => Some(EntityRole::Receiver),
            sys::ENTITY_FN_STREAM_OUTPUT => Some(EntityRole::StreamOutput),
            sys::ENTITY_FN_SENSOR => Some(EntityRole::Sensor),
            sys::ENTITY_FN_CONTROL => Some(EntityRole::Control),
            sys::ENTITY_FN_SYNC => Some(EntityRole::Sync),
            _ => None,
        }
    }

    /// Whether the role reports its own instance index through a capability
    /// query.
    pub fn has_hardware_index(self) -> bool {
        matches!(self, EntityRole::Receiver | EntityRole::Sensor)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EntityRole::Receiver => "Receiver",
            EntityRole::StreamOutput => "StreamOutput",
            EntityRole::Sensor => "Sensor",
            EntityRole::Control => "Control",
            EntityRole::Sync => "Sync",
        }
    }
}

impl fmt::Display for EntityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One entity as reported by the media graph, before opening.
#[derive(Debug, Clone)]
pub struct DiscoveredEntity {
    pub name: String,
    pub function: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
}

impl DiscoveredEntity {
    /// Device node path for this entity.
    pub fn node_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/char/{}:{}", self.dev_major, self.dev_minor))
    }
}

/// One opened subdevice. The kernel handles are populated later by whichever
/// device acquires the entity through the session manager.
pub struct SubdeviceDescriptor {
    role: EntityRole,
    identity: u32,
    sub_index: u32,
    path: PathBuf,
    fd: OwnedFd,
    device_handle: Option<i32>,
    session_handle: Option<i32>,
}

impl SubdeviceDescriptor {
    pub fn role(&self) -> EntityRole {
        self.role
    }

    /// Raw entity-function identity.
    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn sub_index(&self) -> u32 {
        self.sub_index
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub fn device_handle(&self) -> Option<i32> {
        self.device_handle
    }

    pub fn session_handle(&self) -> Option<i32> {
        self.session_handle
    }

    /// Record the kernel handles assigned at acquire time.
    pub fn set_handles(&mut self, device: i32, session: i32) {
        self.device_handle = Some(device);
        self.session_handle = Some(session);
    }

    /// Clear the kernel handles at release time.
    pub fn clear_handles(&mut self) {
        self.device_handle = None;
        self.session_handle = None;
    }
}

impl fmt::Debug for SubdeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubdeviceDescriptor")
            .field("role", &self.role)
            .field("sub_index", &self.sub_index)
            .field("path", &self.path)
            .finish()
    }
}

/// Table of discovered subdevices keyed by (role, sub-index). Entries are
/// never removed during a session's lifetime.
#[derive(Default)]
pub struct SubdeviceMap {
    entries: Vec<SubdeviceDescriptor>,
}

impl SubdeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the map from enumerated entities.
    ///
    /// `open` turns an entity into an owned descriptor for its device node;
    /// `probe` performs the capability query for roles that report their own
    /// instance index. An entity whose open or probe fails is logged and
    /// skipped.
    pub fn assemble(
        entities: impl IntoIterator<Item = DiscoveredEntity>,
        mut open: impl FnMut(&DiscoveredEntity) -> Result<OwnedFd, Error>,
        mut probe: impl FnMut(&DiscoveredEntity, &OwnedFd) -> Result<u32, Error>,
    ) -> Self {
        let mut map = SubdeviceMap::new();
        let mut positional: [u32; 5] = [0; 5];

        for entity in entities {
            let Some(role) = EntityRole::from_function(entity.function) else {
                log::debug!("ignoring entity {} with unknown function {:#x}", entity.name, entity.function);
                continue;
            };

            let fd = match open(&entity) {
                Ok(fd) => fd,
                Err(err) => {
                    log::warn!("skipping entity {}: {}", entity.name, err);
                    continue;
                }
            };

            let sub_index = if role.has_hardware_index() {
                match probe(&entity, &fd) {
                    Ok(index) => index,
                    Err(err) => {
                        log::warn!(
                            "skipping entity {}: capability probe failed: {}",
                            entity.name,
                            err
                        );
                        continue;
                    }
                }
            } else {
                positional[role_index(role)]
            };
            positional[role_index(role)] += 1;

            log::debug!(
                "discovered {} {} sub-index {} at {}",
                role,
                entity.name,
                sub_index,
                entity.node_path().display()
            );

            map.entries.push(SubdeviceDescriptor {
                role,
                identity: entity.function,
                sub_index,
                path: entity.node_path(),
                fd,
                device_handle: None,
                session_handle: None,
            });
        }

        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubdeviceDescriptor> {
        self.entries.iter()
    }

    /// Look up one subdevice by role and sub-index.
    pub fn lookup(&self, role: EntityRole, sub_index: u32) -> Option<&SubdeviceDescriptor> {
        self.entries
            .iter()
            .find(|e| e.role == role && e.sub_index == sub_index)
    }

    pub fn lookup_mut(
        &mut self,
        role: EntityRole,
        sub_index: u32,
    ) -> Option<&mut SubdeviceDescriptor> {
        self.entries
            .iter_mut()
            .find(|e| e.role == role && e.sub_index == sub_index)
    }
}

fn role_index(role: EntityRole) -> usize {
    match role {
        EntityRole::Receiver => 0,
        EntityRole::StreamOutput => 1,
        EntityRole::Sensor => 2,
        EntityRole::Control => 3,
        EntityRole::Sync => 4,
    }
}

/// Enumerate every media device on the system and build the subdevice map.
///
/// Failure to open the first media node is an error; failure to open any
/// later node means enumeration is complete.
pub fn discover() -> Result<SubdeviceMap, Error> {
    let mut entities = Vec::new();

    for index in 0.. {
        let path = format!("/dev/media{}", index);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if index == 0 => return Err(err.into()),
            Err(_) => break,
        };

        let fd: OwnedFd = file.into();
        let mut info = unsafe { std::mem::zeroed::<sys::MediaDeviceInfo>() };
        unsafe { sys::media_device_info(fd.as_raw_fd(), &mut info) }?;
        log::debug!(
            "enumerating {} ({})",
            path,
            String::from_utf8_lossy(&info.model).trim_end_matches('\0')
        );

        let mut desc = unsafe { std::mem::zeroed::<sys::MediaEntityDesc>() };
        loop {
            desc.id |= sys::MEDIA_ENT_ID_FLAG_NEXT;
            if !unsafe { sys::media_enum_entities(fd.as_raw_fd(), &mut desc) }? {
                break;
            }
            let name_end = desc.name.iter().position(|&b| b == 0).unwrap_or(desc.name.len());
            entities.push(DiscoveredEntity {
                name: String::from_utf8_lossy(&desc.name[..name_end]).into_owned(),
                function: desc.function,
                dev_major: desc.dev_major,
                dev_minor: desc.dev_minor,
            });
        }
    }

    Ok(SubdeviceMap::assemble(entities, open_node, probe_sub_index))
}

fn open_node(entity: &DiscoveredEntity) -> Result<OwnedFd, Error> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(entity.node_path())?;
    Ok(file.into())
}

/// One capability round-trip on the subdevice node; the hardware reports its
/// own instance slot.
fn probe_sub_index(_entity: &DiscoveredEntity, fd: &OwnedFd) -> Result<u32, Error> {
    let mut payload = sys::QueryCapCmd::default();
    let mut cmd = sys::ControlCmd {
        op_code: sys::CAM_QUERY_CAP,
        size: std::mem::size_of::<sys::QueryCapCmd>() as u32,
        handle_type: sys::CAM_HANDLE_USER_POINTER,
        reserved: 0,
        handle: &mut payload as *mut sys::QueryCapCmd as u64,
    };
    if let Err(err) = unsafe { sys::camlink_control(fd.as_raw_fd(), &mut cmd) } {
        let code = err.raw_os_error().unwrap_or(-1);
        log::error!("QUERY_CAP control request failed: {}", code);
        return Err(Error::Hardware {
            op: "QUERY_CAP",
            code,
        });
    }
    Ok(payload.slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs::File;

    fn entity(name: &str, function: u32) -> DiscoveredEntity {
        DiscoveredEntity {
            name: name.to_string(),
            function,
            dev_major: 81,
            dev_minor: 0,
        }
    }

    fn stub_fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn classification_covers_all_roles() {
        assert_eq!(
            EntityRole::from_function(sys::ENTITY_FN_CSI_RECEIVER),
            Some(EntityRole::Receiver)
        );
        assert_eq!(
            EntityRole::from_function(sys::ENTITY_FN_STREAM_OUTPUT),
            Some(EntityRole::StreamOutput)
        );
        assert_eq!(
            EntityRole::from_function(sys::ENTITY_FN_SENSOR),
            Some(EntityRole::Sensor)
        );
        assert_eq!(
            EntityRole::from_function(sys::ENTITY_FN_CONTROL),
            Some(EntityRole::Control)
        );
        assert_eq!(
            EntityRole::from_function(sys::ENTITY_FN_SYNC),
            Some(EntityRole::Sync)
        );
        assert_eq!(EntityRole::from_function(0xffff), None);
    }

    #[test]
    fn probed_roles_use_hardware_reported_index() {
        // Hardware reports receiver instance 2 for the first enumerated
        // receiver; the map must not renumber it positionally.
        let entities = vec![
            entity("csi-rx", sys::ENTITY_FN_CSI_RECEIVER),
            entity("imx390", sys::ENTITY_FN_SENSOR),
        ];
        let map = SubdeviceMap::assemble(
            entities,
            |_| Ok(stub_fd()),
            |e, _| Ok(if e.function == sys::ENTITY_FN_CSI_RECEIVER { 2 } else { 5 }),
        );

        assert_eq!(map.len(), 2);
        assert!(map.lookup(EntityRole::Receiver, 2).is_some());
        assert!(map.lookup(EntityRole::Receiver, 0).is_none());
        assert!(map.lookup(EntityRole::Sensor, 5).is_some());
    }

    #[test]
    fn unprobed_roles_are_numbered_positionally() {
        let entities = vec![
            entity("out0", sys::ENTITY_FN_STREAM_OUTPUT),
            entity("out1", sys::ENTITY_FN_STREAM_OUTPUT),
            entity("ctrl", sys::ENTITY_FN_CONTROL),
        ];
        let map = SubdeviceMap::assemble(
            entities,
            |_| Ok(stub_fd()),
            |_, _| panic!("no probe for positional roles"),
        );

        assert_eq!(map.len(), 3);
        assert!(map.lookup(EntityRole::StreamOutput, 0).is_some());
        assert!(map.lookup(EntityRole::StreamOutput, 1).is_some());
        assert!(map.lookup(EntityRole::Control, 0).is_some());
    }

    #[test]
    fn failed_open_skips_entity_only() {
        let entities = vec![
            entity("broken", sys::ENTITY_FN_STREAM_OUTPUT),
            entity("works", sys::ENTITY_FN_CONTROL),
        ];
        let map = SubdeviceMap::assemble(
            entities,
            |e| {
                if e.name == "broken" {
                    Err(Error::Resource("node busy"))
                } else {
                    Ok(stub_fd())
                }
            },
            |_, _| Ok(0),
        );

        assert_eq!(map.len(), 1);
        assert!(map.lookup(EntityRole::Control, 0).is_some());
        assert!(map.lookup(EntityRole::StreamOutput, 0).is_none());
    }

    #[test]
    fn unknown_functions_are_ignored() {
        let map = SubdeviceMap::assemble(
            vec![entity("mystery", 0xbeef)],
            |_| Ok(stub_fd()),
            |_, _| Ok(0),
        );
        assert!(map.is_empty());
    }

    #[test]
    fn kernel_handles_are_recorded_and_cleared() {
        let mut map = SubdeviceMap::assemble(
            vec![entity("csi-rx", sys::ENTITY_FN_CSI_RECEIVER)],
            |_| Ok(stub_fd()),
            |_, _| Ok(0),
        );

        let desc = map.lookup_mut(EntityRole::Receiver, 0).unwrap();
        assert_eq!(desc.device_handle(), None);
        desc.set_handles(0x11, 0x22);
        assert_eq!(desc.device_handle(), Some(0x11));
        assert_eq!(desc.session_handle(), Some(0x22));
        desc.clear_handles();
        assert_eq!(desc.device_handle(), None);
    }

    #[ignore = "requires camera media devices on the target (run with --include-ignored)"]
    #[test]
    #[serial]
    fn discover_on_hardware() {
        let map = discover().unwrap();
        assert!(!map.is_empty());
    }
}
