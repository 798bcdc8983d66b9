// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Recording mock of the kernel control channel shared by the integration
//! tests. Replies with plausible handles, counts every operation, and can be
//! told to fail specific opcodes.

use camlink::channel::{
    BufHandle, ControlChannel, ControlReply, ControlRequest, EventClass, HardwareCaps,
    MmuHandles, RawEvent,
};
use camlink::Error;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MockChannel {
    ops: Mutex<Vec<&'static str>>,
    scheduled: Mutex<Vec<u64>>,
    subscriptions: Mutex<Vec<EventClass>>,
    events: Mutex<VecDeque<RawEvent>>,
    fail: Mutex<HashSet<&'static str>>,
    next_handle: AtomicI32,
}

impl MockChannel {
    pub fn new() -> Self {
        MockChannel {
            ops: Mutex::new(Vec::new()),
            scheduled: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            fail: Mutex::new(HashSet::new()),
            next_handle: AtomicI32::new(0x100),
        }
    }

    /// All operation names submitted so far, in order.
    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap().clone()
    }

    /// How many times one operation was submitted.
    pub fn count(&self, op: &str) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|&&o| o == op)
            .count()
    }

    /// Request ids passed to SCHED_REQ, in submission order.
    pub fn scheduled_ids(&self) -> Vec<u64> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<EventClass> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Make every future submission of `op` fail with a hardware error.
    pub fn fail_op(&self, op: &'static str) {
        self.fail.lock().unwrap().insert(op);
    }

    /// Queue a kernel event for the event thread to dequeue.
    pub fn push_event(&self, event: RawEvent) {
        self.events.lock().unwrap().push_back(event);
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel for MockChannel {
    fn submit(&self, request: &ControlRequest) -> Result<ControlReply, Error> {
        let op = request.op_name();
        self.ops.lock().unwrap().push(op);

        if self.fail.lock().unwrap().contains(op) {
            return Err(Error::Hardware { op, code: -5 });
        }

        if let ControlRequest::ScheduleRequest { request_id, .. } = request {
            self.scheduled.lock().unwrap().push(*request_id);
        }

        Ok(match request {
            ControlRequest::QueryCap => ControlReply::Capabilities(HardwareCaps {
                version: 0x0100,
                slot: 0,
                device_mmu: MmuHandles {
                    non_secure: 21,
                    secure: 0,
                },
                stage_mmu: MmuHandles {
                    non_secure: 22,
                    secure: 0,
                },
            }),
            ControlRequest::CreateSession
            | ControlRequest::AcquireDevice { .. }
            | ControlRequest::AcquireHw { .. }
            | ControlRequest::Link { .. } => {
                ControlReply::Handle(self.next_handle.fetch_add(1, Ordering::SeqCst))
            }
            ControlRequest::AllocBuffer { .. } | ControlRequest::MapBuffer { .. } => {
                ControlReply::Buffer {
                    handle: BufHandle(i64::from(
                        self.next_handle.fetch_add(1, Ordering::SeqCst),
                    )),
                    fd: None,
                }
            }
            _ => ControlReply::Done,
        })
    }

    fn subscribe(&self, class: EventClass) -> Result<(), Error> {
        self.subscriptions.lock().unwrap().push(class);
        Ok(())
    }

    fn dequeue_event(&self, timeout_ms: i32) -> Result<Option<RawEvent>, Error> {
        let event = self.events.lock().unwrap().pop_front();
        if event.is_none() {
            // Honor the poll timeout like the real channel would.
            std::thread::sleep(Duration::from_millis(timeout_ms.clamp(0, 5) as u64));
        }
        Ok(event)
    }
}
