//! End-to-end scenario 1 (spec §8): map, cross-CPU read, then unmap with a
//! shootdown that must invalidate the peer's TLB entry before its
//! completion runs.

use machine::test_support::{BumpAllocator, MapFrameStore, RecordingIpi, RecordingTlb, TestPageTablePolicy};
use machine::{CachingMode, CpuId, CursorPolicy, PageFlags, PageTableWalker, PhysAddr, VirtAddr, VirtRange};
use nucleus::memory::page_space::{AsidCpuData, PageSpace, SyncResult};
use nucleus::memory::page_table::{map_single, unmap_single, Cursor};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[test]
fn map_then_cross_cpu_read_then_unmap_with_shootdown() {
    let store = MapFrameStore::new();
    let alloc = BumpAllocator::new(0x1000);
    let cursor = Cursor::new(TestPageTablePolicy, store);
    let root = alloc.allocate_frame().unwrap();

    let va = VirtAddr::new(0x4000);
    let frame = PhysAddr::new(0x9000);

    let space = PageSpace::new(root);
    let mut cpu_a = AsidCpuData::new(4);
    let mut cpu_b = AsidCpuData::new(4);
    let tlb = RecordingTlb::new();
    let ipi = RecordingIpi::new();

    let slot_a = PageSpace::activate(&space, &mut cpu_a, &tlb);

    map_single(
        &cursor,
        &TestPageTablePolicy,
        &alloc,
        root,
        va,
        frame,
        PageFlags::READABLE | PageFlags::WRITABLE,
        CachingMode::WriteBack,
    )
    .unwrap();

    let pte = cursor.read_leaf(root, va).unwrap();
    assert!(TestPageTablePolicy.pte_page_present(pte));
    assert_eq!(TestPageTablePolicy.pte_page_address(pte), frame);

    let slot_b = PageSpace::activate(&space, &mut cpu_b, &tlb);
    assert_eq!(space.num_bindings(), 2);

    let pte_from_b = cursor.read_leaf(root, va).unwrap();
    assert!(TestPageTablePolicy.pte_page_present(pte_from_b));
    assert_eq!(TestPageTablePolicy.pte_page_address(pte_from_b), frame);

    let status = unmap_single(&cursor, &TestPageTablePolicy, &alloc, root, va).unwrap();
    assert!(status.present);

    let completed = Arc::new(AtomicBool::new(false));
    let completed2 = completed.clone();
    let result = space.submit_shootdown(
        VirtRange::new(va, machine::PAGE_SIZE),
        CpuId::new(0),
        Some(cpu_a.binding_mut(slot_a)),
        &tlb,
        &ipi,
        &[CpuId::new(1)],
        Box::new(move || completed2.store(true, Ordering::SeqCst)),
    );

    assert_eq!(result, SyncResult::Asynchronous);
    assert!(!completed.load(Ordering::SeqCst), "peer hasn't run its IPI handler yet");
    assert_eq!(ipi.broadcasts(), vec![vec![CpuId::new(1)]]);

    space.handle_shootdown_ipi(cpu_b.binding_mut(slot_b), &tlb, CpuId::new(1));
    assert!(completed.load(Ordering::SeqCst));
    assert!(tlb.ranges().iter().any(|&(slot, v, len)| slot == slot_b && v == va && len == machine::PAGE_SIZE));

    let pte_after_unmap = cursor.read_leaf(root, va).unwrap();
    assert!(!TestPageTablePolicy.pte_page_present(pte_after_unmap), "read after unmap must fault");
}
