//! Cross-handle properties of the shared memory primitives

use minion_common::config::LockSettings;
use minion_common::consts::{BUFFER_IDENTITY, HEADER_SIZE};
use minion_shm::lock::LOCK_WRITE;
use minion_shm::{
    Access, SegmentLock, SharedArrayBuffer, SharedBuffer, SharedMemorySegment, SharedStateStore,
    ShmError, ShmResult,
};
use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn unique(prefix: &str) -> String {
    static CTR: AtomicU32 = AtomicU32::new(0);
    let id = CTR.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{id}", std::process::id())
}

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        // Eighths print and parse exactly
        (-1_000_000i32..1_000_000).prop_map(|n| Value::from(f64::from(n) / 8.0)),
        "[a-zA-Z0-9 _\\-]{0,16}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_buffer_roundtrip(value in arb_json().prop_filter("null clears the payload", |v| !v.is_null())) {
        let name = unique("prop_buffer");
        let mut buffer = SharedBuffer::create(&name, 16 * 1024, LockSettings::read_write()).unwrap();
        buffer.write(&value).unwrap();
        let read = buffer.read().unwrap();
        buffer.terminate().unwrap();
        prop_assert_eq!(read, Some(value));
    }

    #[test]
    fn prop_array_roundtrip_bit_exact(bits in prop::collection::vec(any::<u32>(), 1..64)) {
        let name = unique("prop_array");
        let values: Vec<f32> = bits.iter().copied().map(f32::from_bits).collect();
        let mut array = SharedArrayBuffer::create_for::<f32>(&name, &[values.len()], LockSettings::default()).unwrap();
        array.write_slice(&values).unwrap();
        let read = array.read::<f32>().unwrap();
        array.terminate().unwrap();

        let read_bits: Vec<u32> = read.iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(read_bits, bits);
    }
}

#[test]
fn test_array_shape_is_shared() -> ShmResult<()> {
    let name = unique("array_shared_shape");
    let mut owner = SharedArrayBuffer::create_for::<u8>(&name, &[2, 3, 4], LockSettings::default())?;
    let frame = ArrayD::from_shape_fn(IxDyn(&[2, 3, 4]), |idx| (idx[0] * 12 + idx[1] * 4 + idx[2]) as u8);
    owner.write(&frame)?;

    let viewer = SharedArrayBuffer::open(&name, LockSettings::default())?;
    assert_eq!(viewer.shape(), &[2, 3, 4]);
    assert_eq!(viewer.read::<u8>()?, frame);

    owner.terminate()?;
    Ok(())
}

/// Two writers that both refreshed before either wrote: the later whole-snapshot
/// write drops the earlier writer's key.
#[test]
fn test_concurrent_snapshot_writes_lose_updates() -> ShmResult<()> {
    let minion = unique("race");
    let mut w1 = SharedStateStore::create(&minion, 4096, LockSettings::default())?;
    let mut w2 = SharedStateStore::open(&minion, LockSettings::default())?;
    assert!(w2.get("a")?.is_none());

    w1.set("a", &1)?;
    w2.set("b", &2)?;

    let mut observer = SharedStateStore::open(&minion, LockSettings::default())?;
    assert_eq!(observer.get("b")?, Some(json!(2)));
    assert_eq!(observer.get("a")?, None);

    w1.terminate()?;
    Ok(())
}

#[test]
fn test_refresh_before_write_keeps_both_keys() -> ShmResult<()> {
    let minion = unique("no_race");
    let mut w1 = SharedStateStore::create(&minion, 4096, LockSettings::default())?;
    let mut w2 = SharedStateStore::open(&minion, LockSettings::default())?;

    w1.set("a", &1)?;
    w2.refresh()?;
    w2.set("b", &2)?;

    assert_eq!(w1.get("a")?, Some(json!(1)));
    assert_eq!(w1.get("b")?, Some(json!(2)));

    w1.terminate()?;
    Ok(())
}

#[test]
fn test_read_under_held_spin_lock_times_out() -> ShmResult<()> {
    let name = unique("spin_held");
    let settings = LockSettings::read_write().with_timeout(2_000);
    let mut buffer = SharedBuffer::create(&name, 256, settings)?;
    buffer.write(&json!({"frame": 1}))?;

    // Another process holding the write lock indefinitely
    let holder = SharedMemorySegment::attach(&name, BUFFER_IDENTITY, HEADER_SIZE)?;
    holder.header()?.lock.store(LOCK_WRITE, Ordering::Release);

    let start = Instant::now();
    assert!(matches!(
        buffer.read(),
        Err(ShmError::LockTimeout { attempts: 2_000, .. })
    ));
    assert!(matches!(
        buffer.write(&json!({"frame": 2})),
        Err(ShmError::LockTimeout { .. })
    ));
    assert!(start.elapsed() < Duration::from_secs(5));

    holder.header()?.lock.store(b' ', Ordering::Release);
    assert_eq!(buffer.read()?, Some(json!({"frame": 1})));

    buffer.terminate()?;
    Ok(())
}

#[test]
fn test_read_under_held_flock_times_out() -> ShmResult<()> {
    let name = unique("flock_held");
    let settings = LockSettings::default().with_timeout(500);
    let mut buffer = SharedBuffer::create(&name, 256, settings)?;
    buffer.write(&json!("ready"))?;

    let holder = SegmentLock::open(&name, settings)?;
    let unused = AtomicU8::new(0);
    let guard = holder.acquire(&unused, Access::Write)?;

    assert!(matches!(buffer.read(), Err(ShmError::LockTimeout { .. })));
    drop(guard);
    assert_eq!(buffer.read()?, Some(json!("ready")));

    buffer.terminate()?;
    Ok(())
}

#[test]
fn test_terminate_is_idempotent_everywhere() -> ShmResult<()> {
    let mut buffer = SharedBuffer::create(&unique("idem_buffer"), 64, LockSettings::default())?;
    let mut array = SharedArrayBuffer::create_for::<u8>(&unique("idem_array"), &[8], LockSettings::default())?;
    let mut store = SharedStateStore::create(&unique("idem_store"), 256, LockSettings::default())?;

    for _ in 0..2 {
        buffer.terminate()?;
        array.terminate()?;
        store.terminate()?;
    }
    assert!(!buffer.is_alive());
    assert!(!array.is_alive());
    assert!(!store.is_alive());
    Ok(())
}
