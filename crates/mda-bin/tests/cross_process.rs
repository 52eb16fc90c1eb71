//! Producer in a child process, receiver and mirror in the test process.
#![cfg(unix)]

use mda_bus::{Endpoint, EventQueue, ReceiverExit, RemoteReceiver};
use mda_consumers::RemoteMirror;
use mda_core::config::{ChannelConfig, IndexConfig};
use mda_core::{AcquisitionEvent, Coordinate, FrameAccess, PixelType, SequenceDescriptor};
use serial_test::serial;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_mda-stream");

fn spawn_producer(socket: &Path, store: &Path, args: &[&str]) -> Child {
    Command::new(BIN)
        .arg("produce")
        .arg("--endpoint")
        .arg(format!("unix:{}", socket.display()))
        .arg("--store")
        .arg(store)
        .args(["--capacity-bytes", "1048576", "--width", "64", "--height", "64"])
        .args(args)
        .env("MDA_LOGGING__LEVEL", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap()
}

fn drain(queue: &mut EventQueue) -> Vec<AcquisitionEvent> {
    let mut events = Vec::new();
    while let Some(event) = queue.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn frame_ready_crosses_the_process_boundary_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mda.sock");
    let store = dir.path().join("frames.buf");

    let listener = Endpoint::Unix(socket.clone()).bind().await.unwrap();
    let child = spawn_producer(&socket, &store, &["--channels", "1", "--frames", "5"]);
    let started = Instant::now();

    let config = ChannelConfig {
        poll_timeout_ms: 50,
        ..ChannelConfig::default()
    };
    let receiver = RemoteReceiver::new(&config);
    let mirror = std::sync::Arc::new(
        RemoteMirror::new(&store, PixelType::U16, &IndexConfig::default()).unwrap(),
    );
    mirror.attach(&receiver);
    let mut queue = mirror.events().subscribe_queue();

    receiver.start(listener.accept().await.unwrap()).unwrap();
    assert!(receiver.wait_until_stopped(Duration::from_secs(10)).await);
    assert_eq!(receiver.exit_reason(), Some(ReceiverExit::StopMessage));
    assert!(started.elapsed() < Duration::from_secs(10));

    let events = drain(&mut queue);
    assert_eq!(events.len(), 6);
    assert_eq!(
        events[0],
        AcquisitionEvent::SequenceStarted(SequenceDescriptor::new(1, 1, 5))
    );
    let coordinates: Vec<Coordinate> = events[1..]
        .iter()
        .map(|event| match event {
            AcquisitionEvent::FrameReady(ready) => ready.coordinate,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(coordinates, (0..5).map(|t| Coordinate::new(0, 0, t)).collect::<Vec<_>>());

    for coordinate in &coordinates {
        let frame = mirror.get_frame(coordinate).unwrap();
        assert_eq!((frame.width, frame.height), (64, 64));
        assert!(frame.any_nonzero());
    }
    assert_ne!(
        mirror.get_frame(&coordinates[0]).unwrap(),
        mirror.get_frame(&coordinates[1]).unwrap()
    );

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("produced 5 frames of 5 declared"));
    // the backing file outlives the producer
    assert!(store.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn multi_channel_acquisition_arrives_channel_fastest() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("mda.sock");
    let store = dir.path().join("frames.buf");

    let listener = Endpoint::Unix(socket.clone()).bind().await.unwrap();
    let child = spawn_producer(&socket, &store, &["--channels", "2", "--frames", "3"]);

    let receiver = RemoteReceiver::new(&ChannelConfig::default());
    let mut queue = receiver.events().subscribe_queue();
    receiver.start(listener.accept().await.unwrap()).unwrap();
    receiver.join().await;

    let frames: Vec<Coordinate> = drain(&mut queue)
        .into_iter()
        .filter_map(|event| match event {
            AcquisitionEvent::FrameReady(ready) => Some(ready.coordinate),
            AcquisitionEvent::SequenceStarted(_) => None,
        })
        .collect();
    assert_eq!(frames.len(), 6);
    assert_eq!(frames[0], Coordinate::new(0, 0, 0));
    assert_eq!(frames[1], Coordinate::new(1, 0, 0));
    assert_eq!(frames[5], Coordinate::new(1, 0, 2));

    assert!(child.wait_with_output().unwrap().status.success());
}

#[test]
fn inspect_prints_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ring.buf");
    let ring = mda_storage::RingBuffer::create(&path, 4096, PixelType::U8).unwrap();
    ring.put(&[1; 100]).unwrap();

    let output = Command::new(BIN).arg("inspect").arg(&path).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("capacity    4096"));
    assert!(stdout.contains("pixel_type  u8"));
    assert!(stdout.contains("write_head  100"));
}

#[test]
fn produce_without_endpoint_fails() {
    let output = Command::new(BIN)
        .args(["produce", "--store", "/tmp/unused.buf"])
        .env_remove("MDA_CHANNEL__ENDPOINT")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no endpoint"));
}

#[test]
fn config_reflects_environment_overrides() {
    let output = Command::new(BIN)
        .arg("show-config")
        .env("MDA_STORE__CAPACITY_BYTES", "4096")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("capacity_bytes = 4096"));
}
