// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Command packet pools.
//!
//! A pool is one kernel-shared allocation partitioned into fixed-stride
//! packet slots. Every slot holds a [`camlink_sys::PacketHeader`] followed by
//! three bounded regions (command-buffer descriptors, buffer-IO configs,
//! address patches) and a payload area for configuration blobs. Region byte
//! offsets are computed once when the pool is built and stamped into every
//! slot header; the region counts can never exceed the capacities fixed
//! here. Steady-state operation performs no allocation.

use crate::channel::PacketLocation;
use crate::Error;
use camlink_sys as sys;
use std::mem::size_of;

const HEADER_SIZE: usize = size_of::<sys::PacketHeader>();
const CMD_BUF_SIZE: usize = size_of::<sys::CmdBufDesc>();
const IO_CONFIG_SIZE: usize = size_of::<sys::BufferIoConfig>();
const PATCH_SIZE: usize = size_of::<sys::AddrPatch>();

fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Capacities of one packet slot, fixed at pool construction.
#[derive(Debug, Clone, Copy)]
pub struct SlotLayout {
    pub max_cmd_bufs: usize,
    pub max_io_configs: usize,
    pub max_patches: usize,
    pub payload_capacity: usize,
}

impl SlotLayout {
    /// Total bytes of one slot, including the payload area.
    pub fn stride_bytes(&self) -> usize {
        self.stride()
    }

    fn cmd_buf_offset(&self) -> usize {
        align8(HEADER_SIZE)
    }

    fn io_config_offset(&self) -> usize {
        self.cmd_buf_offset() + self.max_cmd_bufs * CMD_BUF_SIZE
    }

    fn patch_offset(&self) -> usize {
        self.io_config_offset() + self.max_io_configs * IO_CONFIG_SIZE
    }

    fn payload_offset(&self) -> usize {
        align8(self.patch_offset() + self.max_patches * PATCH_SIZE)
    }

    fn stride(&self) -> usize {
        align8(self.payload_offset() + self.payload_capacity)
    }
}

/// A ring of reusable command packet slots inside one kernel-shared buffer.
pub struct PacketPool {
    mem_handle: i64,
    layout: SlotLayout,
    slots: usize,
    stride: usize,
    // u64 backing keeps every slot 8-byte aligned for the header cast.
    arena: Vec<u64>,
}

impl PacketPool {
    /// Build a pool of `slots` packet slots backed by the kernel buffer
    /// `mem_handle`, stamping each slot header once.
    pub fn new(mem_handle: i64, slots: usize, layout: SlotLayout) -> Result<Self, Error> {
        if slots == 0 {
            return Err(Error::InvalidParameter("packet pool needs at least one slot"));
        }

        let stride = layout.stride();
        let total = stride * slots;
        let mut pool = PacketPool {
            mem_handle,
            layout,
            slots,
            stride,
            arena: vec![0; total / 8],
        };

        for index in 0..slots {
            let header = pool.header_mut(index);
            *header = sys::PacketHeader {
                size: stride as u32,
                op_code: 0,
                request_id: 0,
                cmd_buf_offset: layout.cmd_buf_offset() as u32,
                num_cmd_bufs: 0,
                io_config_offset: layout.io_config_offset() as u32,
                num_io_configs: 0,
                patch_offset: layout.patch_offset() as u32,
                num_patches: 0,
                kmd_cmd_buf_index: 0,
                flags: 0,
            };
        }

        Ok(pool)
    }

    pub fn slot_count(&self) -> usize {
        self.slots
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Location of one slot inside the kernel-shared buffer.
    pub fn location(&self, index: usize) -> Result<PacketLocation, Error> {
        self.check(index)?;
        Ok(PacketLocation {
            mem_handle: self.mem_handle,
            offset: (index * self.stride) as u64,
        })
    }

    /// Borrow one slot for packet construction.
    pub fn slot_mut(&mut self, index: usize) -> Result<PacketSlot<'_>, Error> {
        self.check(index)?;
        let layout = self.layout;
        let base = index * self.stride;
        let bytes = self.bytes_mut();
        Ok(PacketSlot {
            bytes: &mut bytes[base..base + layout.stride()],
            layout,
        })
    }

    /// Region counts of one slot header: (cmd buffers, IO configs, patches).
    pub fn counts(&self, index: usize) -> Result<(u32, u32, u32), Error> {
        self.check(index)?;
        let header = self.header(index);
        Ok((header.num_cmd_bufs, header.num_io_configs, header.num_patches))
    }

    /// Request id stamped into one slot header.
    pub fn request_id(&self, index: usize) -> Result<u64, Error> {
        self.check(index)?;
        Ok(self.header(index).request_id)
    }

    /// Reset every slot to empty, keeping the stamped offsets.
    pub fn reset_all(&mut self) {
        for index in 0..self.slots {
            let header = self.header_mut(index);
            header.op_code = 0;
            header.request_id = 0;
            header.num_cmd_bufs = 0;
            header.num_io_configs = 0;
            header.num_patches = 0;
            header.kmd_cmd_buf_index = 0;
        }
    }

    fn check(&self, index: usize) -> Result<(), Error> {
        if index >= self.slots {
            return Err(Error::InvalidParameter("packet slot index out of range"));
        }
        Ok(())
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.arena.len() * 8;
        // SAFETY: the u64 arena is a plain byte region; the cast only widens
        // the element view.
        unsafe { std::slice::from_raw_parts_mut(self.arena.as_mut_ptr().cast(), len) }
    }

    fn header(&self, index: usize) -> &sys::PacketHeader {
        let base = index * self.stride;
        // SAFETY: every slot base is 8-aligned inside the u64 arena and the
        // header layout was stamped at construction.
        unsafe { &*(self.arena.as_ptr().cast::<u8>().add(base) as *const sys::PacketHeader) }
    }

    fn header_mut(&mut self, index: usize) -> &mut sys::PacketHeader {
        let base = index * self.stride;
        // SAFETY: as in `header`.
        unsafe {
            &mut *(self.arena.as_mut_ptr().cast::<u8>().add(base) as *mut sys::PacketHeader)
        }
    }
}

/// One borrowed packet slot.
pub struct PacketSlot<'a> {
    bytes: &'a mut [u8],
    layout: SlotLayout,
}

impl PacketSlot<'_> {
    /// Start a new packet in this slot. The region counts are zeroed before
    /// anything is appended, so no descriptor from a previous frame can leak
    /// into the new one.
    pub fn begin(&mut self, op_code: u32, request_id: u64) {
        let header = self.header_mut();
        header.op_code = op_code;
        header.request_id = request_id;
        header.num_cmd_bufs = 0;
        header.num_io_configs = 0;
        header.num_patches = 0;
        header.kmd_cmd_buf_index = 0;
    }

    pub fn request_id(&self) -> u64 {
        self.header().request_id
    }

    /// Mark which command buffer the kernel driver consumes.
    pub fn set_kmd_cmd_buf_index(&mut self, index: u32) {
        self.header_mut().kmd_cmd_buf_index = index;
    }

    /// Append one command-buffer descriptor.
    pub fn push_cmd_buf(&mut self, desc: sys::CmdBufDesc) -> Result<(), Error> {
        let count = self.header().num_cmd_bufs as usize;
        if count >= self.layout.max_cmd_bufs {
            return Err(Error::CapacityExceeded("command-buffer descriptors"));
        }
        let offset = self.layout.cmd_buf_offset() + count * CMD_BUF_SIZE;
        // SAFETY: offset is in bounds and 8-aligned by construction.
        unsafe {
            std::ptr::write(
                self.bytes.as_mut_ptr().add(offset) as *mut sys::CmdBufDesc,
                desc,
            )
        };
        self.header_mut().num_cmd_bufs += 1;
        Ok(())
    }

    /// Append one buffer-IO descriptor.
    pub fn push_io_config(&mut self, config: sys::BufferIoConfig) -> Result<(), Error> {
        let count = self.header().num_io_configs as usize;
        if count >= self.layout.max_io_configs {
            return Err(Error::CapacityExceeded("buffer-IO descriptors"));
        }
        let offset = self.layout.io_config_offset() + count * IO_CONFIG_SIZE;
        // SAFETY: as in push_cmd_buf.
        unsafe {
            std::ptr::write(
                self.bytes.as_mut_ptr().add(offset) as *mut sys::BufferIoConfig,
                config,
            )
        };
        self.header_mut().num_io_configs += 1;
        Ok(())
    }

    /// Append one address patch.
    pub fn push_patch(&mut self, patch: sys::AddrPatch) -> Result<(), Error> {
        let count = self.header().num_patches as usize;
        if count >= self.layout.max_patches {
            return Err(Error::CapacityExceeded("address patches"));
        }
        let offset = self.layout.patch_offset() + count * PATCH_SIZE;
        // SAFETY: as in push_cmd_buf.
        unsafe {
            std::ptr::write(
                self.bytes.as_mut_ptr().add(offset) as *mut sys::AddrPatch,
                patch,
            )
        };
        self.header_mut().num_patches += 1;
        Ok(())
    }

    /// Copy a configuration blob into the slot's payload area. Returns the
    /// byte offset of the blob within the slot for use in a command-buffer
    /// descriptor.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<u32, Error> {
        if data.len() > self.layout.payload_capacity {
            return Err(Error::CapacityExceeded("packet payload"));
        }
        let offset = self.layout.payload_offset();
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(offset as u32)
    }

    /// Remaining descriptor capacity: (cmd buffers, IO configs, patches).
    pub fn remaining(&self) -> (usize, usize, usize) {
        let header = self.header();
        (
            self.layout.max_cmd_bufs - header.num_cmd_bufs as usize,
            self.layout.max_io_configs - header.num_io_configs as usize,
            self.layout.max_patches - header.num_patches as usize,
        )
    }

    fn header(&self) -> &sys::PacketHeader {
        // SAFETY: the slot starts with the stamped header and is 8-aligned.
        unsafe { &*(self.bytes.as_ptr() as *const sys::PacketHeader) }
    }

    fn header_mut(&mut self) -> &mut sys::PacketHeader {
        // SAFETY: as in `header`.
        unsafe { &mut *(self.bytes.as_mut_ptr() as *mut sys::PacketHeader) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_layout() -> SlotLayout {
        SlotLayout {
            max_cmd_bufs: 2,
            max_io_configs: 2,
            max_patches: 2,
            payload_capacity: 64,
        }
    }

    #[test]
    fn offsets_are_stamped_and_aligned() {
        let layout = small_layout();
        let pool = PacketPool::new(0x10, 4, layout).unwrap();

        assert_eq!(layout.cmd_buf_offset() % 8, 0);
        assert_eq!(layout.io_config_offset() % 8, 0);
        assert_eq!(layout.patch_offset() % 8, 0);
        assert_eq!(pool.stride() % 8, 0);
        assert_eq!(pool.counts(0).unwrap(), (0, 0, 0));
        assert_eq!(pool.counts(3).unwrap(), (0, 0, 0));
    }

    #[test]
    fn location_advances_by_stride() {
        let pool = PacketPool::new(0x10, 4, small_layout()).unwrap();
        let first = pool.location(0).unwrap();
        let second = pool.location(1).unwrap();
        assert_eq!(first.mem_handle, 0x10);
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, pool.stride() as u64);
        assert!(pool.location(4).is_err());
    }

    #[test]
    fn push_is_bounds_checked() {
        let mut pool = PacketPool::new(0x10, 1, small_layout()).unwrap();
        let mut slot = pool.slot_mut(0).unwrap();
        slot.begin(sys::CAM_CONFIG_DEV, 1);

        slot.push_io_config(sys::BufferIoConfig::default()).unwrap();
        slot.push_io_config(sys::BufferIoConfig::default()).unwrap();
        assert!(matches!(
            slot.push_io_config(sys::BufferIoConfig::default()),
            Err(Error::CapacityExceeded(_))
        ));

        assert_eq!(pool.counts(0).unwrap(), (0, 2, 0));
    }

    #[test]
    fn begin_resets_stale_counts() {
        // Slot reuse must never leak descriptor counts across frames.
        let mut pool = PacketPool::new(0x10, 1, small_layout()).unwrap();

        let mut slot = pool.slot_mut(0).unwrap();
        slot.begin(sys::CAM_CONFIG_DEV, 1);
        slot.push_cmd_buf(sys::CmdBufDesc::default()).unwrap();
        slot.push_io_config(sys::BufferIoConfig::default()).unwrap();
        slot.push_patch(sys::AddrPatch::default()).unwrap();
        assert_eq!(pool.counts(0).unwrap(), (1, 1, 1));

        let mut slot = pool.slot_mut(0).unwrap();
        slot.begin(sys::CAM_CONFIG_DEV, 2);
        slot.push_io_config(sys::BufferIoConfig::default()).unwrap();
        assert_eq!(pool.counts(0).unwrap(), (0, 1, 0));
        assert_eq!(pool.request_id(0).unwrap(), 2);
    }

    #[test]
    fn payload_is_bounds_checked() {
        let mut pool = PacketPool::new(0x10, 1, small_layout()).unwrap();
        let mut slot = pool.slot_mut(0).unwrap();

        let offset = slot.write_payload(&[0xa5; 64]).unwrap();
        assert_eq!(offset as usize % 8, 0);
        assert!(matches!(
            slot.write_payload(&[0; 65]),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn reset_all_empties_every_slot() {
        let mut pool = PacketPool::new(0x10, 2, small_layout()).unwrap();
        for index in 0..2 {
            let mut slot = pool.slot_mut(index).unwrap();
            slot.begin(sys::CAM_CONFIG_DEV, (index + 1) as u64);
            slot.push_patch(sys::AddrPatch::default()).unwrap();
        }

        pool.reset_all();
        for index in 0..2 {
            assert_eq!(pool.counts(index).unwrap(), (0, 0, 0));
            assert_eq!(pool.request_id(index).unwrap(), 0);
        }
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            PacketPool::new(0x10, 0, small_layout()),
            Err(Error::InvalidParameter(_))
        ));
    }
}
