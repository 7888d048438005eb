//! Shared segment behavior against real POSIX objects.
//!
//! Each test uses its own segment and lock names so tests can run in
//! parallel and never touch a live `/video_stream`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use live_alert::{
    FrameLayout, NamedLock, RelayError, ResourceNames, SharedFrameStore, SharedResources,
};

static NEXT: AtomicUsize = AtomicUsize::new(0);

fn names(tag: &str) -> ResourceNames {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    ResourceNames {
        segment: format!("/live_alert_it_{}_seg_{}_{}", tag, pid, n),
        lock: format!("/live_alert_it_{}_lock_{}_{}", tag, pid, n),
    }
}

/// What a well-behaved reader does: take the lock, copy both fields, release.
fn read_locked(lock: &NamedLock, reader: &SharedFrameStore) -> (Vec<u8>, u32) {
    let held = lock.acquire().expect("reader acquire");
    let frame = reader.frame().expect("reader frame").to_vec();
    let sequence = reader.sequence().expect("reader sequence");
    held.release().expect("reader release");
    (frame, sequence)
}

#[test]
fn segment_size_matches_layout() -> anyhow::Result<()> {
    for (w, h) in [(1, 1), (3, 5), (160, 120), (640, 480)] {
        let names = names("size");
        let layout = FrameLayout::new(w, h)?;
        let store = SharedFrameStore::create(&names.segment, layout)?;
        assert_eq!(store.segment_len(), w as usize * h as usize * 3 + 4);
        drop(store);
        SharedFrameStore::unlink(&names.segment)?;
    }
    Ok(())
}

#[test]
fn vga_counter_wraps_at_u32_max() -> anyhow::Result<()> {
    let names = names("vga");
    let layout = FrameLayout::new(640, 480)?;
    assert_eq!(layout.frame_len(), 921_600);

    let mut writer = SharedResources::open(names.clone(), layout, false)?;
    assert_eq!(writer.store().segment_len(), 921_604);

    let reader = SharedFrameStore::create(&names.segment, layout)?;
    let reader_lock = NamedLock::open(&names.lock)?;

    let zeros = vec![0u8; layout.frame_len()];
    writer.publish(&zeros, u32::MAX)?;
    let held = reader_lock.acquire()?;
    let segment = reader.segment()?;
    assert_eq!(segment.len(), 921_604);
    assert!(segment[..921_600].iter().all(|&b| b == 0));
    assert_eq!(&segment[921_600..], &[0xFF, 0xFF, 0xFF, 0xFF]);
    drop(held);

    writer.publish(&zeros, u32::MAX.wrapping_add(1))?;
    let held = reader_lock.acquire()?;
    assert_eq!(&reader.segment()?[921_600..], &[0x00, 0x00, 0x00, 0x00]);
    drop(held);

    drop(reader);
    drop(reader_lock);
    writer.teardown();
    Ok(())
}

#[test]
fn locked_reader_sees_frame_and_sequence_together() -> anyhow::Result<()> {
    let names = names("pair");
    let layout = FrameLayout::new(4, 3)?;
    let mut writer = SharedResources::open(names.clone(), layout, false)?;

    let reader = SharedFrameStore::create(&names.segment, layout)?;
    let reader_lock = NamedLock::open(&names.lock)?;

    for n in 1..=5u32 {
        let frame: Vec<u8> = (0..layout.frame_len())
            .map(|i| (i as u32 * n) as u8)
            .collect();
        writer.publish(&frame, n)?;
        let (seen, sequence) = read_locked(&reader_lock, &reader);
        assert_eq!(seen, frame);
        assert_eq!(sequence, n);
    }

    drop(reader);
    drop(reader_lock);
    writer.teardown();
    Ok(())
}

#[test]
fn writer_blocks_while_reader_holds_lock() -> anyhow::Result<()> {
    let names = names("block");
    let layout = FrameLayout::new(2, 2)?;
    let mut writer = SharedResources::open(names.clone(), layout, false)?;
    writer.publish(&[1u8; 12], 1)?;

    let reader_lock = NamedLock::open(&names.lock)?;
    let held = reader_lock.acquire()?;

    let handle = std::thread::spawn(move || {
        writer.publish(&[2u8; 12], 2).expect("publish after reader");
        writer
    });

    std::thread::sleep(Duration::from_millis(100));
    let reader = SharedFrameStore::create(&names.segment, layout)?;
    // The writer cannot have touched the segment yet.
    assert_eq!(reader.sequence()?, 1);
    assert_eq!(reader.frame()?, &[1u8; 12]);
    held.release()?;

    let mut writer = handle.join().expect("writer thread");
    let (frame, sequence) = read_locked(&reader_lock, &reader);
    assert_eq!(sequence, 2);
    assert_eq!(frame, vec![2u8; 12]);

    drop(reader);
    drop(reader_lock);
    writer.teardown();
    Ok(())
}

#[test]
fn create_after_close_and_unlink_succeeds() -> anyhow::Result<()> {
    let names = names("recreate");
    let layout = FrameLayout::new(8, 8)?;

    let mut store = SharedFrameStore::create(&names.segment, layout)?;
    store.close();
    assert!(SharedFrameStore::unlink(&names.segment)?);

    let again = SharedFrameStore::create(&names.segment, layout)?;
    assert!(again.was_created());
    assert_eq!(again.segment_len(), layout.segment_len());

    drop(again);
    SharedFrameStore::unlink(&names.segment)?;
    Ok(())
}

#[test]
fn existing_mapping_survives_unlink() -> anyhow::Result<()> {
    let names = names("survive");
    let layout = FrameLayout::new(2, 1)?;
    let mut writer = SharedResources::open(names.clone(), layout, false)?;
    let reader = SharedFrameStore::create(&names.segment, layout)?;

    assert!(SharedFrameStore::unlink(&names.segment)?);
    writer.publish(&[7u8; 6], 9)?;
    assert_eq!(reader.sequence()?, 9);
    assert_eq!(reader.frame()?, &[7u8; 6]);

    drop(reader);
    writer.teardown();
    Ok(())
}

#[test]
fn reset_stale_replaces_mismatched_segment() -> anyhow::Result<()> {
    let names = names("stale");
    let old = SharedFrameStore::create(&names.segment, FrameLayout::new(2, 2)?)?;
    drop(old);

    let layout = FrameLayout::new(3, 3)?;
    let err = SharedResources::open(names.clone(), layout, false)
        .err()
        .expect("mismatched segment must not be reused");
    assert!(matches!(err, RelayError::Resource { .. }));
    assert!(err.is_fatal());

    let mut resources = SharedResources::open(names, layout, true)?;
    assert!(resources.store().was_created());
    assert_eq!(resources.store().segment_len(), layout.segment_len());
    resources.teardown();
    Ok(())
}
