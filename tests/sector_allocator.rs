//! Whole-filesystem allocator scenarios that exercise the public API
//! only: a full alloc/free cycle of the data region in ascending,
//! descending, and a fixed deterministic shuffle order, and the
//! equivalent bijection over the inode region.

use ofs::error::FsError;
use ofs::fs::Filesystem;
use ofs::word::SectorId;

/// A small, seedless, deterministic permutation of `0..n`: reverses the
/// low and high halves of the index's bit pattern. Good enough to mix
/// up allocation order without pulling in a randomness crate.
fn bit_reversed_order(n: usize) -> Vec<usize> {
    let bits = usize::BITS - (n.max(1) - 1).leading_zeros().min(usize::BITS - 1);
    let mut order: Vec<usize> = (0..n)
        .map(|i| i.reverse_bits() >> (usize::BITS - bits))
        .collect();
    order.retain(|&v| v < n);
    let mut seen = vec![false; n];
    let mut out = Vec::with_capacity(n);
    for v in order {
        if !seen[v] {
            seen[v] = true;
            out.push(v);
        }
    }
    for i in 0..n {
        if !seen[i] {
            out.push(i);
        }
    }
    out
}

fn full_allocation_cycle(fs: &mut Filesystem) -> Vec<SectorId> {
    let mut allocated = Vec::new();
    loop {
        match fs.alloc_sector() {
            Ok(sector) => allocated.push(sector),
            Err(FsError::NoSpace) => break,
            Err(other) => panic!("unexpected allocator error: {other}"),
        }
    }
    allocated
}

#[test]
fn a_full_cycle_allocates_every_data_sector_exactly_once() {
    let mut fs = Filesystem::format_memory(8, 512);
    let (start, end) = fs.free_sector_range();

    let allocated = full_allocation_cycle(&mut fs);
    let expected_count = (end - start) as usize;
    assert_eq!(allocated.len(), expected_count);

    let mut sorted = allocated.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), expected_count, "allocator returned a duplicate");
    assert!(allocated.iter().all(|&s| s >= start && s < end));
}

#[test]
fn repeated_alloc_free_cycles_in_ascending_descending_and_shuffled_order_converge() {
    let mut fs = Filesystem::format_memory(8, 512);
    let (start, end) = fs.free_sector_range();
    let expected_count = (end - start) as usize;

    let mut allocated = full_allocation_cycle(&mut fs);
    assert_eq!(allocated.len(), expected_count);

    // Ascending.
    allocated.sort_unstable();
    for &s in &allocated {
        fs.free_sector(s);
    }
    let round = full_allocation_cycle(&mut fs);
    assert_eq!(round.len(), expected_count);
    let mut round_sorted = round.clone();
    round_sorted.sort_unstable();
    assert_eq!(round_sorted, allocated);

    // Descending.
    let mut descending = round;
    descending.sort_unstable_by(|a, b| b.cmp(a));
    for &s in &descending {
        fs.free_sector(s);
    }
    let round = full_allocation_cycle(&mut fs);
    assert_eq!(round.len(), expected_count);

    // A fixed, deterministic shuffle.
    let mut shuffled = round.clone();
    let order = bit_reversed_order(shuffled.len());
    let original = shuffled.clone();
    for (dst, &src_idx) in order.iter().enumerate() {
        shuffled[dst] = original[src_idx];
    }
    for &s in &shuffled {
        fs.free_sector(s);
    }
    let round = full_allocation_cycle(&mut fs);
    assert_eq!(round.len(), expected_count);
    let mut round_sorted = round;
    round_sorted.sort_unstable();
    let mut expected_sorted = allocated;
    expected_sorted.sort_unstable();
    assert_eq!(round_sorted, expected_sorted);
}

#[test]
fn inode_allocation_is_a_bijection_over_the_inode_region() {
    let mut fs = Filesystem::format_memory(8, 512);
    let total = fs.total_inodes();

    // The root directory's own inode (0) is already allocated by format.
    let mut allocated = Vec::new();
    loop {
        match fs.alloc_inode() {
            Ok(id) => allocated.push(id),
            Err(FsError::NoInode) => break,
            Err(other) => panic!("unexpected allocator error: {other}"),
        }
    }

    assert_eq!(allocated.len() as u32, total - 1);
    let mut sorted = allocated;
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len() as u32, total - 1);
    assert!(sorted.iter().all(|&id| (id as u32) < total));
}
