//! End-to-end memspace scenarios through the public handle.

use buddy::{AddrRange, Buddy, BuddyError, RangeDesc};

fn static_desc() -> RangeDesc {
    RangeDesc {
        name: "static-64k".into(),
        start: 0,
        len: 0x10000,
        max_len: 0,
        min_buf_size: 0x100,
        max_buf_size: 0x1000,
        color_bits: 0,
        block_size_hint: 0,
    }
}

fn static_space() -> Buddy {
    let desc = static_desc();
    let storage = vec![0u8; Buddy::sizing_static(&desc).unwrap() as usize];
    Buddy::create_static(
        &desc,
        storage,
        &[AddrRange {
            start: 0,
            len: 0x10000,
        }],
    )
    .unwrap()
}

#[test]
fn middle_free_is_reallocated() {
    let space = static_space();
    let _a = space.allocate(0x100, None).unwrap();
    let b = space.allocate(0x100, None).unwrap();
    let _c = space.allocate(0x200, None).unwrap();
    assert_eq!(space.free(b).unwrap(), 0x100);
    assert_eq!(space.allocate(0x100, None).unwrap(), b);
    space.check().unwrap();
}

#[test]
fn partial_allocation_accounting() {
    let space = static_space();
    let before = space.stats().unwrap();
    let a = space.allocate(0x500, None).unwrap();
    space.check().unwrap();

    let during = space.stats().unwrap();
    // 0x500 kept out of the 0x1000 buddy; 0x300 went back
    assert_eq!(before.free_bytes - during.free_bytes, 0x500);
    assert_eq!(during.used_bytes, 0x500);
    assert_eq!(during.complex_runs, 1);
    assert_eq!(during.complex_bytes, 0x500);

    assert_eq!(space.free(a).unwrap(), 0x500);
    space.check().unwrap();
    let after = space.stats().unwrap();
    assert_eq!(after.free_bytes, before.free_bytes);
    assert_eq!(after.used_bytes, 0);
}

#[test]
fn hot_add_grows_a_dynamic_memspace() {
    let desc = RangeDesc {
        name: "dyn-4m".into(),
        start: 0,
        len: 0x40000,
        max_len: 0x400000,
        min_buf_size: 0x1000,
        max_buf_size: 0x40000,
        color_bits: 0,
        block_size_hint: 0x40000,
    };
    let storage = vec![0u8; Buddy::sizing_dynamic(&desc).unwrap() as usize];
    let space = Buddy::create_dynamic(
        &desc,
        storage,
        &[AddrRange {
            start: 0,
            len: 0x40000,
        }],
    )
    .unwrap();
    space.check().unwrap();

    // the initial block can satisfy one maximum buffer, not two
    let a = space.allocate(0x40000, None).unwrap();
    assert_eq!(
        space.allocate(0x40000, None).unwrap_err(),
        BuddyError::NoResources
    );

    let need = space.hot_add_sizing(0x40000, 0x40000).unwrap();
    assert!(need > 0);
    space
        .hot_add(
            vec![0u8; need as usize],
            0x40000,
            0x40000,
            &[AddrRange {
                start: 0x40000,
                len: 0x40000,
            }],
        )
        .unwrap();
    space.check().unwrap();

    let b = space.allocate(0x40000, None).unwrap();
    assert_eq!(b, 0x40000);
    space.check().unwrap();

    // the same blocks a second time need no storage at all
    assert_eq!(space.hot_add_sizing(0x40000, 0x40000).unwrap(), 0);

    space.free(a).unwrap();
    space.free(b).unwrap();
    space.check().unwrap();
}

#[test]
fn hot_add_rejects_static_and_low_starts() {
    let space = static_space();
    assert_eq!(
        space.hot_add_sizing(0x10000, 0x10000).unwrap_err(),
        BuddyError::BadParam
    );
    assert_eq!(
        space
            .hot_add(Vec::new(), 0x10000, 0x10000, &[])
            .unwrap_err(),
        BuddyError::BadParam
    );

    let desc = RangeDesc {
        name: "dyn-low".into(),
        start: 0x100000,
        len: 0x40000,
        max_len: 0x200000,
        min_buf_size: 0x1000,
        max_buf_size: 0x40000,
        color_bits: 0,
        block_size_hint: 0,
    };
    let storage = vec![0u8; Buddy::sizing_dynamic(&desc).unwrap() as usize];
    let space = Buddy::create_dynamic(
        &desc,
        storage,
        &[AddrRange {
            start: 0x100000,
            len: 0x40000,
        }],
    )
    .unwrap();
    // below the low watermark
    assert_eq!(
        space.hot_add(Vec::new(), 0x80000, 0x40000, &[]).unwrap_err(),
        BuddyError::BadParam
    );
}

#[test]
fn free_then_allocate_is_idempotent_after_quiescence() {
    let space = static_space();
    let a = space.allocate(0x800, None).unwrap();
    let b = space.allocate(0x200, None).unwrap();
    space.free(a).unwrap();
    assert_eq!(space.allocate(0x800, None).unwrap(), a);
    space.free(b).unwrap();
    assert_eq!(space.allocate(0x200, None).unwrap(), b);
    space.check().unwrap();
}

#[test]
fn interleaved_frees_restore_initial_lists() {
    let space = static_space();
    let initial = space.stats().unwrap();

    let mut addrs = Vec::new();
    for size in [0x100u64, 0x300, 0x500, 0x1000, 0x200, 0x700] {
        addrs.push((size, space.allocate(size, None).unwrap()));
    }
    space.check().unwrap();
    // free in a different order than allocation
    addrs.rotate_left(3);
    for (size, addr) in addrs {
        let rounded = size.div_ceil(0x100) * 0x100;
        assert_eq!(space.free(addr).unwrap(), rounded);
        space.check().unwrap();
    }

    let restored = space.stats().unwrap();
    assert_eq!(restored.free_bytes, initial.free_bytes);
    for (a, b) in initial.shifts.iter().zip(restored.shifts.iter()) {
        assert_eq!(a.free_per_color, b.free_per_color, "shift {}", a.shift);
    }
}

#[test]
fn randomized_exercise_preserves_invariants() {
    let space = static_space();
    let mut rng: u64 = 0x9e37_79b9_7f4a_7c15;
    let mut next = move || {
        rng ^= rng << 13;
        rng ^= rng >> 7;
        rng ^= rng << 17;
        rng
    };

    let mut live: Vec<(u64, u64)> = Vec::new();
    for round in 0..2000 {
        if next() % 3 != 0 || live.is_empty() {
            let size = next() % 0x1000 + 1;
            match space.allocate(size, None) {
                Ok(addr) => live.push((addr, size)),
                Err(BuddyError::NoResources) => {
                    let (addr, _) = live.pop().unwrap();
                    space.free(addr).unwrap();
                }
                Err(e) => panic!("unexpected allocation failure: {e}"),
            }
        } else {
            let idx = next() as usize % live.len();
            let (addr, size) = live.swap_remove(idx);
            assert_eq!(space.free(addr).unwrap(), size.div_ceil(0x100) * 0x100);
        }
        if round % 16 == 0 {
            space.check().unwrap();
        }
    }

    for (addr, _) in live.drain(..) {
        space.free(addr).unwrap();
    }
    space.check().unwrap();
    let stats = space.stats().unwrap();
    assert_eq!(stats.used_bytes, 0);
    assert_eq!(stats.free_bytes, 0x10000);
}

#[test]
fn allocation_walk_sees_every_live_extent() {
    let space = static_space();
    let a = space.allocate(0x100, None).unwrap();
    let b = space.allocate(0x500, None).unwrap();
    let c = space.allocate(0x300, None).unwrap();

    let mut seen = Vec::new();
    space
        .for_each_allocation(|addr, len| seen.push((addr, len)))
        .unwrap();
    seen.sort_unstable();
    let mut want = vec![(a, 0x100u64), (b, 0x500), (c, 0x300)];
    want.sort_unstable();
    assert_eq!(seen, want);

    space.free(b).unwrap();
    let mut seen = Vec::new();
    space
        .for_each_allocation(|addr, len| seen.push((addr, len)))
        .unwrap();
    assert_eq!(seen.len(), 2);
}

#[test]
fn registry_lists_live_memspaces() {
    // unique name: other tests' memspaces share the registry
    let mut desc = static_desc();
    desc.name = "registry-probe".into();
    let storage = vec![0u8; Buddy::sizing_static(&desc).unwrap() as usize];
    let space = Buddy::create_static(
        &desc,
        storage,
        &[AddrRange {
            start: 0,
            len: 0x10000,
        }],
    )
    .unwrap();

    let _a = space.allocate(0x1000, None).unwrap();
    let mut out = String::new();
    buddy::dump_registry(&mut out).unwrap();
    assert!(out.contains("registry-probe"));

    space.destroy().unwrap();
    let mut out = String::new();
    buddy::dump_registry(&mut out).unwrap();
    assert!(!out.contains("registry-probe"));
}
