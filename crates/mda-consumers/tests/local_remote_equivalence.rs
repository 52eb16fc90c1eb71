//! Consumers see the same acquisition whether attached to the store in
//! process or to a mirror fed over a socket.
#![cfg(unix)]

use mda_bus::{ReceiverExit, RemoteForwarder, RemoteReceiver};
use mda_consumers::{DisplayCache, FrameSaver, OverflowPolicy, RemoteMirror};
use mda_core::{
    AcquisitionEvent, Coordinate, Frame, FrameAccess, PixelType, SequenceDescriptor, StreamConfig,
};
use mda_storage::FrameStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;

fn frame(c: u32, t: u32) -> Frame {
    let pixels: Vec<u16> = (0..64 * 32).map(|i| (i as u16) ^ ((c * 1000 + t) as u16)).collect();
    Frame::from_u16(64, 32, &pixels)
}

#[tokio::test]
async fn mirror_consumers_match_local_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.buf");

    let mut config = StreamConfig::default();
    config.store.capacity_bytes = 1 << 20;
    config.store.backing_path = Some(path.clone());
    config.channel.poll_timeout_ms = 20;
    let store = Arc::new(FrameStore::from_config(&config).unwrap());

    let (producer_end, consumer_end) = UnixStream::pair().unwrap();
    let forwarder = Arc::new(
        RemoteForwarder::new(Box::new(producer_end), config.channel.max_message_bytes).unwrap(),
    );
    forwarder.attach(store.events());

    let receiver = RemoteReceiver::new(&config.channel);
    let mirror = Arc::new(RemoteMirror::new(&path, PixelType::U16, &config.index).unwrap());
    mirror.attach(&receiver);

    let local = Arc::new(DisplayCache::new(store.clone(), OverflowPolicy::Grow));
    local.attach(store.as_ref());
    let remote = Arc::new(DisplayCache::new(mirror.clone(), OverflowPolicy::Grow));
    remote.attach(mirror.as_ref());
    let saver = Arc::new(FrameSaver::new(mirror.clone(), mirror.context().clone()));
    saver.attach(mirror.as_ref());

    let mut queue = mirror.events().subscribe_queue();
    receiver.start(Box::new(consumer_end)).unwrap();

    let descriptor = SequenceDescriptor::new(2, 1, 3);
    store.begin_sequence(&descriptor).unwrap();
    let mut written = Vec::new();
    for t in 0..3 {
        for c in 0..2 {
            let coordinate = Coordinate::new(c, 0, t);
            store.put(&frame(c, t), coordinate).unwrap();
            written.push(coordinate);
        }
    }

    let mut delivered = Vec::new();
    while delivered.len() < written.len() {
        match tokio::time::timeout(Duration::from_secs(5), queue.recv()).await {
            Ok(Some(AcquisitionEvent::FrameReady(ready))) => delivered.push(ready.coordinate),
            Ok(Some(AcquisitionEvent::SequenceStarted(started))) => assert_eq!(started, descriptor),
            other => panic!("mirror went quiet: {other:?}"),
        }
    }
    assert_eq!(delivered, written);

    forwarder.send_stop().await.unwrap();
    assert!(receiver.wait_until_stopped(Duration::from_secs(5)).await);
    assert_eq!(receiver.exit_reason(), Some(ReceiverExit::StopMessage));
    assert_eq!(receiver.stats().malformed, 0);

    assert_eq!(remote.descriptor(), Some(descriptor));
    assert_eq!(remote.dims(), local.dims());
    assert_eq!(remote.latest(), local.latest());
    for coordinate in &written {
        let expected = frame(coordinate.c, coordinate.t);
        assert_eq!(mirror.get_frame(coordinate).unwrap(), expected);
        assert_eq!(remote.frame(coordinate), local.frame(coordinate));
    }

    let assembled = saver.assemble().unwrap();
    assert!(assembled.missing.is_empty());
    assert_eq!(assembled.start_locator, Some(0));
    assert_eq!(assembled.stack.dims(), (2, 1, 3));
}
