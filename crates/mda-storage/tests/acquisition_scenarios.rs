//! End-to-end acquisition scenarios against the frame store.

use mda_core::{Coordinate, EdaError, Frame, PixelType, SequenceDescriptor, StreamConfig};
use mda_storage::{FrameStore, IndexTable, RingBuffer, RingBufferReader};
use parking_lot::Mutex;
use std::sync::Arc;

const SIDE: u32 = 512;
const FRAME_BYTES: u64 = (SIDE as u64) * (SIDE as u64) * 2;

fn pattern(seed: u16) -> Frame {
    let pixels: Vec<u16> = (0..SIDE * SIDE)
        .map(|i| seed.wrapping_mul(31).wrapping_add((i % 4096) as u16) | 1)
        .collect();
    Frame::from_u16(SIDE, SIDE, &pixels)
}

#[test]
fn two_channel_time_lapse_round_trips() {
    let store = FrameStore::new(
        RingBuffer::anonymous(20 * FRAME_BYTES, PixelType::U16).unwrap(),
        IndexTable::new((3, 1, 1000), 1 << 24).unwrap(),
    );

    let ready = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&ready);
    store
        .events()
        .on_frame_ready(move |event| r.lock().push(event.coordinate));
    let started = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&started);
    store.events().on_sequence_started(move |d| s.lock().push(*d));

    store
        .begin_sequence(&SequenceDescriptor::new(2, 1, 5))
        .unwrap();

    let mut inputs = Vec::new();
    for t in 0..5u32 {
        for c in 0..2u32 {
            let coord = Coordinate::new(c, 0, t);
            let frame = pattern((t * 2 + c) as u16);
            store.put(&frame, coord).unwrap();
            inputs.push((coord, frame));
        }
    }

    assert_eq!(*started.lock(), vec![SequenceDescriptor::new(2, 1, 5)]);
    let fired = ready.lock().clone();
    assert_eq!(fired.len(), 10);
    assert_eq!(fired, inputs.iter().map(|(c, _)| *c).collect::<Vec<_>>());

    for (coord, frame) in &inputs {
        let back = store.get(coord).unwrap();
        assert_eq!((back.width, back.height), (SIDE, SIDE));
        assert!(back.any_nonzero());
        assert_eq!(&back, frame);
    }

    let stats = store.stats();
    assert_eq!(stats.frames_written, 10);
    assert_eq!(stats.bytes_written, 10 * FRAME_BYTES);
    assert_eq!(stats.wraps, 0);
}

#[test]
fn time_index_beyond_initial_extent_grows_the_index() {
    let store = FrameStore::new(
        RingBuffer::anonymous(4 * FRAME_BYTES, PixelType::U16).unwrap(),
        IndexTable::new((3, 1, 1000), 1 << 24).unwrap(),
    );

    let early = Coordinate::new(0, 0, 999);
    let late = Coordinate::new(0, 0, 1000);
    store.put(&pattern(1), early).unwrap();
    store.put(&pattern(2), late).unwrap();

    assert_eq!(store.index().dims(), (3, 1, 2000));
    assert_eq!(store.stats().index_growths, 1);
    assert_eq!(store.get(&late).unwrap(), pattern(2));
    assert_eq!(store.get(&early).unwrap(), pattern(1));
}

#[test]
fn lookups_race_with_puts_without_tearing_the_index() {
    let store = Arc::new(FrameStore::new(
        RingBuffer::anonymous(64 * 1024 * 1024, PixelType::U8).unwrap(),
        IndexTable::new((1, 1, 8), 1 << 24).unwrap(),
    ));

    // published frames are re-read from a consumer thread while later puts
    // keep growing the index
    let (tx, rx) = std::sync::mpsc::channel();
    store.events().on_frame_ready(move |event| {
        let _ = tx.send(event.coordinate);
    });

    let reader_store = Arc::clone(&store);
    let reader = std::thread::spawn(move || {
        let mut checked = 0u32;
        for coord in rx {
            let frame = reader_store.get(&coord).unwrap();
            assert!(frame.data.iter().all(|&b| b == (coord.t % 251) as u8));
            checked += 1;
        }
        checked
    });

    for t in 0..2000u32 {
        store
            .put(&Frame::from_u8(8, 8, vec![(t % 251) as u8; 64]), Coordinate::new(0, 0, t))
            .unwrap();
    }
    store.events().clear();

    assert_eq!(reader.join().unwrap(), 2000);
    assert!(store.stats().index_growths >= 8);
}

#[test]
fn out_of_range_read_is_reported() {
    let ring = RingBuffer::anonymous(1024, PixelType::U8).unwrap();
    assert!(matches!(
        ring.read(1000, 64),
        Err(EdaError::OutOfRange { capacity: 1024, .. })
    ));
}

#[test]
fn file_backed_store_is_readable_from_a_second_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.buf");

    let mut config = StreamConfig::default();
    config.store.capacity_bytes = 8 * FRAME_BYTES;
    config.store.backing_path = Some(path.clone());
    let store = FrameStore::from_config(&config).unwrap();
    assert_eq!(store.backing_path(), Some(path.as_path()));

    let reader = RingBufferReader::open(&path).unwrap();
    let frame = pattern(9);
    let offset = store.put(&frame, Coordinate::new(0, 0, 0)).unwrap();

    let bytes = reader.read(offset, FRAME_BYTES).unwrap();
    assert_eq!(bytes, frame.data);
    assert_eq!(reader.write_head(), FRAME_BYTES);

    // closing releases the writer's mapping but leaves the file for readers
    store.close();
    assert!(path.exists());
    assert_eq!(reader.read(offset, FRAME_BYTES).unwrap(), frame.data);
}

#[test]
fn wrapping_overwrites_oldest_frames() {
    let store = FrameStore::new(
        RingBuffer::anonymous(3 * FRAME_BYTES, PixelType::U16).unwrap(),
        IndexTable::new((1, 1, 10), 1 << 20).unwrap(),
    );
    for t in 0..4u32 {
        store.put(&pattern(t as u16), Coordinate::new(0, 0, t)).unwrap();
    }
    assert_eq!(store.stats().wraps, 1);
    assert_eq!(store.locate(&Coordinate::new(0, 0, 3)).unwrap().offset, 0);
    // t=0 shared offset 0 and now reads t=3's bytes
    assert_eq!(store.get(&Coordinate::new(0, 0, 0)).unwrap(), pattern(3));
}
