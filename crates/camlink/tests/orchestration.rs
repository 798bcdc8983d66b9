// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Orchestration tests over a recording mock of the kernel control channel.
//
// Covered end to end:
//   - registry initialization with a static sensor and no board module
//   - configure/start/stop of a stream pipeline with zero buffers
//   - two logical streams sharing one physical CSI receiver
//   - command-packet slot reuse across buffer recycling
//   - pause/resume without resource churn
//   - event delivery through the session manager's event thread

mod common;

use camlink::channel::RawEvent;
use camlink::device::{DeviceCategory, DeviceInfo};
use camlink::manager::{DeviceManager, DeviceManagerConfig};
use camlink::pipeline::{NativeBuffer, PipelineState, StreamConfig, StreamPipeline};
use camlink::receiver::CsiReceiver;
use camlink::session::{SessionEvent, SessionManager};
use camlink::Error;
use common::MockChannel;
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

mod stub {
    use camlink::device::{DeviceCallback, DeviceDriver, DeviceInstance};
    use camlink::Error;

    pub struct StubSensor;

    impl DeviceDriver for StubSensor {
        fn open(&self) -> Result<Box<dyn DeviceInstance>, Error> {
            Ok(Box::new(StubInstance))
        }
    }

    struct StubInstance;

    impl DeviceInstance for StubInstance {
        fn control(
            &mut self,
            _opcode: u32,
            _input: &[u8],
            _output: &mut [u8],
        ) -> Result<usize, Error> {
            Ok(0)
        }

        fn register_callback(&mut self, _callback: DeviceCallback) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn session_setup() -> (Arc<MockChannel>, Arc<SessionManager>) {
    let channel = Arc::new(MockChannel::new());
    let manager = Arc::new(SessionManager::new(channel.clone()));
    (channel, manager)
}

fn test_config() -> StreamConfig {
    StreamConfig {
        resource_limit: 1,
        clock_hz: 480_000_000,
        bandwidth_bps: 1_000_000_000,
    }
}

fn stub_native_buffer(file: &std::fs::File) -> NativeBuffer {
    NativeBuffer {
        fd: file.as_raw_fd(),
        len: 4096,
    }
}

// Scenario A: one statically registered SENSOR and no board module.
#[test]
fn registry_with_static_sensor_only() {
    init_logging();

    let config = DeviceManagerConfig::new().with_static_driver(
        DeviceInfo::new_static(DeviceCategory::Sensor, 0x30),
        Arc::new(stub::StubSensor),
    );
    let registry = DeviceManager::new(config);
    registry.initialize().unwrap();

    let mut out = [0; 8];
    let count = registry
        .available_devices(DeviceCategory::Sensor, &mut out)
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(out[0], 0x30);

    registry.uninitialize().unwrap();
}

// Scenario B: configure → start → stop with zero output buffers.
#[test]
fn pipeline_lifecycle_with_zero_buffers() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager.clone(), session, 0).unwrap();

    pipeline.configure(&test_config()).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Configured);
    // The initial configuration went out as one CONFIG_DEV and the device
    // was linked into the session.
    assert_eq!(channel.count("CONFIG_DEV"), 1);
    assert_eq!(channel.count("LINK"), 1);

    pipeline.start(&[]).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Streaming);
    assert_eq!(channel.count("START_DEV"), 1);
    // No buffers were enqueued, so nothing was scheduled.
    assert!(channel.scheduled_ids().is_empty());

    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Unconfigured);
    assert_eq!(channel.count("STOP_DEV"), 1);
    assert_eq!(channel.count("UNLINK"), 1);
    assert_eq!(channel.count("RELEASE_HW"), 1);
    assert_eq!(channel.count("RELEASE_DEV"), 1);
    // Stop leaves the request counter at 1 for the next configure.
    assert_eq!(pipeline.request_counter(), 1);

    manager.destroy_session(session).unwrap();
}

// Scenario C: two logical streams share one physical receiver.
#[test]
fn shared_receiver_starts_hardware_exactly_once() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let device = manager.acquire_device(session, 0).unwrap();
    let receiver = CsiReceiver::new(manager.clone(), session, device);

    // Stream A: 0→1 issues the hardware start.
    receiver.start().unwrap();
    assert_eq!(channel.count("START_DEV"), 1);
    assert!(receiver.is_streaming());

    // Stream B: 1→2 is purely a count change.
    receiver.start().unwrap();
    assert_eq!(channel.count("START_DEV"), 1);
    assert_eq!(receiver.active_consumers(), 2);

    // Stream A stops: 2→1, no hardware call.
    receiver.stop().unwrap();
    assert_eq!(channel.count("STOP_DEV"), 0);

    // Stream B stops: 1→0 issues the hardware stop.
    receiver.stop().unwrap();
    assert_eq!(channel.count("STOP_DEV"), 1);
    assert!(!receiver.is_streaming());
}

#[test]
fn receiver_start_n_stop_n_is_balanced() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let device = manager.acquire_device(session, 1).unwrap();
    let receiver = CsiReceiver::new(manager, session, device);

    for _ in 0..5 {
        receiver.start().unwrap();
    }
    for _ in 0..5 {
        receiver.stop().unwrap();
    }

    assert_eq!(channel.count("START_DEV"), 1);
    assert_eq!(channel.count("STOP_DEV"), 1);
}

#[test]
fn receiver_stop_without_consumers_reaches_no_hardware() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let device = manager.acquire_device(session, 0).unwrap();
    let receiver = CsiReceiver::new(manager, session, device);

    let before = channel.ops().len();
    assert!(matches!(receiver.stop(), Err(Error::InvalidState(_))));
    assert_eq!(channel.ops().len(), before);
}

#[test]
fn receiver_reconfigure_in_init_is_noop() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let device = manager.acquire_device(session, 0).unwrap();
    let receiver = CsiReceiver::new(manager.clone(), session, device);

    // Borrow a packet location from a throwaway pipeline configuration: the
    // receiver only forwards it to CONFIG_DEV.
    let location = camlink::channel::PacketLocation {
        mem_handle: 0x55,
        offset: 0,
    };
    receiver.configure(location).unwrap();
    assert_eq!(channel.count("CONFIG_DEV"), 1);

    // Re-entrant configure while still in INIT is a no-op success.
    receiver.configure(location).unwrap();
    assert_eq!(channel.count("CONFIG_DEV"), 1);

    // Configure while streaming is a state error.
    receiver.start().unwrap();
    assert!(matches!(
        receiver.configure(location),
        Err(Error::InvalidState(_))
    ));
    receiver.stop().unwrap();
}

#[test]
fn request_ids_increase_per_enqueued_buffer() {
    init_logging();
    let (channel, manager) = session_setup();
    let file = std::fs::File::open("/dev/null").unwrap();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();
    pipeline.configure(&test_config()).unwrap();

    let buffers = [stub_native_buffer(&file), stub_native_buffer(&file)];
    pipeline.start(&buffers).unwrap();

    assert_eq!(pipeline.outstanding_buffers(), 2);
    assert_eq!(channel.scheduled_ids(), vec![1, 2]);
    assert_eq!(pipeline.request_counter(), 2);
}

#[test]
fn recycled_slot_never_leaks_stale_descriptors() {
    init_logging();
    let (channel, manager) = session_setup();
    let file = std::fs::File::open("/dev/null").unwrap();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();
    pipeline.configure(&test_config()).unwrap();
    pipeline.start(&[stub_native_buffer(&file)]).unwrap();

    assert_eq!(pipeline.submit_packet_counts(0).unwrap(), (0, 1, 0));
    let first_fence = pipeline.fence(0).cloned().unwrap();

    // Second submission of the same logical buffer index while streaming.
    pipeline.recycle_buffer(0).unwrap();

    // The slot was reset before the new descriptor was appended: exactly
    // one IO config, not two.
    assert_eq!(pipeline.submit_packet_counts(0).unwrap(), (0, 1, 0));
    assert_eq!(channel.scheduled_ids(), vec![1, 2]);

    // A fresh fence replaced the prior one.
    let second_fence = pipeline.fence(0).cloned().unwrap();
    first_fence
        .signal(camlink::fence::FenceStatus::Success)
        .unwrap();
    assert!(!second_fence.is_signaled());
}

#[test]
fn pause_resubmits_initial_config_and_resume_restarts_ids() {
    init_logging();
    let (channel, manager) = session_setup();
    let file = std::fs::File::open("/dev/null").unwrap();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();
    pipeline.configure(&test_config()).unwrap();
    pipeline.start(&[stub_native_buffer(&file)]).unwrap();
    let configs_before = channel.count("CONFIG_DEV");

    pipeline.pause().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Paused);
    assert_eq!(channel.count("STOP_DEV"), 1);
    // Pause resubmitted the initial configuration packet.
    assert_eq!(channel.count("CONFIG_DEV"), configs_before + 1);
    // Resources were kept: no release, no unlink.
    assert_eq!(channel.count("RELEASE_HW"), 0);
    assert_eq!(channel.count("UNLINK"), 0);

    pipeline.resume().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Streaming);
    assert_eq!(channel.count("START_DEV"), 2);
    // The outstanding buffer was rescheduled starting from request id 1.
    assert_eq!(channel.scheduled_ids(), vec![1, 1]);

    pipeline.stop().unwrap();
}

#[test]
fn enqueue_beyond_slot_capacity_is_rejected_before_kernel_state() {
    init_logging();
    let (channel, manager) = session_setup();
    let file = std::fs::File::open("/dev/null").unwrap();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();
    pipeline.configure(&test_config()).unwrap();
    pipeline.start(&[]).unwrap();

    for _ in 0..8 {
        pipeline.enqueue(stub_native_buffer(&file)).unwrap();
    }
    let maps_before = channel.count("MAP_BUF");
    assert!(matches!(
        pipeline.enqueue(stub_native_buffer(&file)),
        Err(Error::CapacityExceeded(_))
    ));
    assert_eq!(channel.count("MAP_BUF"), maps_before);
}

#[test]
fn failed_configure_converges_through_stop() {
    init_logging();
    let (channel, manager) = session_setup();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();

    // The hardware-resource acquire fails mid-configure; already-acquired
    // state is intentionally left in place.
    channel.fail_op("ACQUIRE_HW");
    assert!(matches!(
        pipeline.configure(&test_config()),
        Err(Error::Hardware {
            op: "ACQUIRE_HW",
            ..
        })
    ));
    assert_eq!(pipeline.state(), PipelineState::Unconfigured);

    // Convergence: stop releases the acquired device.
    pipeline.stop().unwrap();
    assert_eq!(channel.count("RELEASE_DEV"), 1);
}

#[test]
fn event_thread_delivers_frame_and_error_notifications() {
    init_logging();
    let (channel, manager) = session_setup();

    channel.push_event(RawEvent::StartOfFrame {
        frame_id: 1,
        request_id: 1,
        device_timestamp: 50_000,
    });
    channel.push_event(RawEvent::StartOfFrame {
        frame_id: 2,
        request_id: 2,
        device_timestamp: 83_333,
    });
    channel.push_event(RawEvent::Error {
        error_type: 7,
        request_id: 2,
    });

    let session = manager.create_session().unwrap();
    let (tx, rx) = mpsc::channel();
    manager
        .start_event_thread(move |event| {
            let _ = tx.send(event);
        })
        .unwrap();

    // Both event classes were subscribed immediately.
    assert_eq!(channel.subscriptions().len(), 2);

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let third = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    match (first, second) {
        (
            SessionEvent::FrameStart {
                request_id: 1,
                monotonic_ns: first_ns,
                ..
            },
            SessionEvent::FrameStart {
                request_id: 2,
                monotonic_ns: second_ns,
                ..
            },
        ) => {
            // Device-clock delta accumulated onto the monotonic anchor.
            assert_eq!(second_ns - first_ns, 33_333);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(
        third,
        SessionEvent::DeviceError {
            error_type: 7,
            request_id: 2
        }
    );

    manager.stop_event_thread();
    manager.destroy_session(session).unwrap();
}

#[test]
fn stop_surfaces_first_teardown_failure_but_completes() {
    init_logging();
    let (channel, manager) = session_setup();
    let file = std::fs::File::open("/dev/null").unwrap();

    let session = manager.create_session().unwrap();
    let mut pipeline = StreamPipeline::new(manager, session, 0).unwrap();
    pipeline.configure(&test_config()).unwrap();
    pipeline.start(&[stub_native_buffer(&file)]).unwrap();

    channel.fail_op("UNLINK");
    let err = pipeline.stop().unwrap_err();
    assert!(matches!(err, Error::Hardware { op: "UNLINK", .. }));

    // Teardown continued past the failure.
    assert_eq!(channel.count("RELEASE_HW"), 1);
    assert_eq!(channel.count("RELEASE_DEV"), 1);
    assert_eq!(channel.count("RELEASE_BUF"), 1);
    assert_eq!(pipeline.state(), PipelineState::Unconfigured);
    assert_eq!(pipeline.request_counter(), 1);
}
