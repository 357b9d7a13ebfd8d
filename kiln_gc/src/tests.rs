//! GC Tests
//!
//! Tests for common GC scenarios that could cause memory leaks or corruption.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::{HeapConfig, HeapConfigBuilder, MemGrowingType},
    error::AllocError,
    object_header::{object_size, ObjectKind},
    region::{Region, DEFAULT_REGION_SIZE},
    space::SpaceType,
    tagged_value::{Address, TaggedValue},
    task_pool,
    visitor::{GcContext, RootVisitor},
    GcPhase, GcType, Heap,
};

/// Test nodes hold a value in slot 0 and a link in slot 1
const NODE_SLOTS: usize = 2;
const NODE_SIZE: usize = object_size(NODE_SLOTS, 0);

/// Simple test context implementing GcContext
/// Uses a list of root values
struct TestContext {
    roots: Vec<TaggedValue>,
}

impl TestContext {
    fn new() -> Self {
        TestContext { roots: Vec::new() }
    }

    fn add_root(&mut self, addr: Address) {
        self.roots.push(TaggedValue::from_address(addr));
    }

    fn root(&self, index: usize) -> Address {
        self.roots[index].heap_address().unwrap()
    }

    fn clear_roots(&mut self) {
        self.roots.clear();
    }
}

impl GcContext for TestContext {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        visitor.visit_root_range(&mut self.roots);
    }
}

/// Root provider sharing its roots with the test body
struct SharedRoots(Arc<Mutex<Vec<TaggedValue>>>);

impl GcContext for SharedRoots {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        visitor.visit_root_range(&mut self.0.lock());
    }
}

fn stop_the_world_config() -> HeapConfigBuilder {
    HeapConfigBuilder::from_heap_size(32 * 1024 * 1024)
        .enable_concurrent_mark(false)
        .enable_concurrent_sweep(false)
}

fn test_heap() -> Heap {
    Heap::new(stop_the_world_config().build())
}

fn concurrent_heap() -> Heap {
    // A zero trigger ratio starts marking on the first old allocation
    let config: HeapConfig = HeapConfigBuilder::new()
        .enable_concurrent_mark(true)
        .enable_concurrent_sweep(true)
        .concurrent_mark_trigger_ratio(0.0)
        .build();
    Heap::new(config)
}

fn alloc_node(heap: &mut Heap, ctx: &mut TestContext, value: i32, space: SpaceType) -> Address {
    let node = heap
        .allocate_object(ctx, ObjectKind::Plain, NODE_SLOTS, 0, space)
        .unwrap();
    heap.set_field(node, 0, TaggedValue::from_i32(value));
    node
}

fn link(heap: &Heap, from: Address, to: Address) {
    heap.set_field(from, 1, TaggedValue::from_address(to));
}

fn value_of(heap: &Heap, node: Address) -> i32 {
    heap.get_field(node, 0).as_i32()
}

fn next_of(heap: &Heap, node: Address) -> Option<Address> {
    heap.get_field(node, 1).heap_address()
}

fn space_of(addr: Address) -> SpaceType {
    unsafe { Region::from_address(addr) }.space()
}

/// Values along a linked list starting at `head`
fn list_values(heap: &Heap, head: Address) -> Vec<i32> {
    let mut values = Vec::new();
    let mut current = Some(head);
    while let Some(node) = current {
        values.push(value_of(heap, node));
        current = next_of(heap, node);
    }
    values
}

// ============================================================================
// Basic allocation and collection tests
// ============================================================================

#[test]
fn test_basic_alloc() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let node = alloc_node(&mut heap, &mut ctx, 42, SpaceType::Young);

    assert!(heap.contains_object(node));
    assert_eq!(value_of(&heap, node), 42);
    assert_eq!(heap.get_field(node, 1), TaggedValue::UNDEFINED);
    assert_eq!(heap.semi_space().heap_object_size(), NODE_SIZE);
    assert_eq!(heap.phase(), GcPhase::Idle);
}

#[test]
fn test_young_gc_collects_unreachable() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    for i in 0..10 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Young);
    }
    assert_eq!(heap.semi_space().heap_object_size(), 10 * NODE_SIZE);

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    assert_eq!(heap.semi_space().heap_object_size(), 0);
    assert_eq!(heap.stats().young_gc_count, 1);
    assert_eq!(heap.stats().last_freed_bytes, 10 * NODE_SIZE);
}

#[test]
fn test_young_gc_copies_rooted_list() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let head = alloc_node(&mut heap, &mut ctx, 0, SpaceType::Young);
    let mut tail = head;
    for i in 1..4 {
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Young);
        link(&heap, tail, node);
        tail = node;
    }
    for i in 100..110 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Young);
    }
    ctx.add_root(head);

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    assert_ne!(ctx.root(0), head, "survivors are copied");
    assert_eq!(list_values(&heap, ctx.root(0)), vec![0, 1, 2, 3]);
    assert_eq!(heap.semi_space().heap_object_size(), 4 * NODE_SIZE);
    assert_eq!(space_of(ctx.root(0)), SpaceType::Young);
}

#[test]
fn test_second_young_gc_promotes() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let node = alloc_node(&mut heap, &mut ctx, 7, SpaceType::Young);
    ctx.add_root(node);

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();
    assert_eq!(space_of(ctx.root(0)), SpaceType::Young);
    assert_eq!(heap.stats().last_promoted_bytes, 0);

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();
    assert_eq!(space_of(ctx.root(0)), SpaceType::Old);
    assert_eq!(heap.stats().last_promoted_bytes, NODE_SIZE);
    assert_eq!(heap.old_space().heap_object_size(), NODE_SIZE);
    assert_eq!(value_of(&heap, ctx.root(0)), 7);
}

#[test]
fn test_old_to_new_slot_keeps_young_alive() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let old = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    let young = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Young);
    link(&heap, old, young);
    ctx.add_root(old);

    let old_region = unsafe { Region::from_address(old) };
    let slot = crate::object_header::slot_address(old, 1);
    assert!(old_region.old_to_new_contains(slot));

    // First young GC: the target survives in young space, the entry stays
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();
    let survivor = next_of(&heap, old).unwrap();
    assert_ne!(survivor, young);
    assert_eq!(space_of(survivor), SpaceType::Young);
    assert_eq!(value_of(&heap, survivor), 2);
    assert!(old_region.old_to_new_contains(slot));

    // Second young GC: the target is promoted, the entry is dropped
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();
    let promoted = next_of(&heap, old).unwrap();
    assert_eq!(space_of(promoted), SpaceType::Old);
    assert_eq!(value_of(&heap, promoted), 2);
    assert!(!old_region.old_to_new_contains(slot));
}

#[test]
fn test_promoted_holder_records_young_target() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let holder = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Young);
    ctx.add_root(holder);
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    // The holder is aged, the new target is not
    let target = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Young);
    link(&heap, ctx.root(0), target);
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    let holder = ctx.root(0);
    let target = next_of(&heap, holder).unwrap();
    assert_eq!(space_of(holder), SpaceType::Old);
    assert_eq!(space_of(target), SpaceType::Young);

    let slot = crate::object_header::slot_address(holder, 1);
    assert!(unsafe { Region::from_address(holder) }.old_to_new_contains(slot));
    heap.verify();
}

// ============================================================================
// Marking collection tests
// ============================================================================

#[test]
fn test_full_gc_collects_unreachable_old() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    for i in 0..100 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
    }
    assert_eq!(heap.old_space().heap_object_size(), 100 * NODE_SIZE);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_eq!(heap.old_space().heap_object_size(), 0);
    assert_eq!(heap.old_space().region_count(), 0);
    assert_eq!(heap.stats().full_gc_count, 1);
}

#[test]
fn test_full_gc_compacts_and_updates_roots() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let head = alloc_node(&mut heap, &mut ctx, 0, SpaceType::Old);
    let mut tail = head;
    for i in 1..3 {
        for garbage in 0..20 {
            alloc_node(&mut heap, &mut ctx, -garbage, SpaceType::Old);
        }
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
        link(&heap, tail, node);
        tail = node;
    }
    ctx.add_root(head);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_ne!(ctx.root(0), head, "full gc evacuates all of old space");
    assert_eq!(list_values(&heap, ctx.root(0)), vec![0, 1, 2]);
    assert_eq!(heap.old_space().heap_object_size(), 3 * NODE_SIZE);
}

#[test]
fn test_full_gc_promotes_all_young() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let old = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    let young = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Young);
    link(&heap, old, young);
    ctx.add_root(old);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    let old = ctx.root(0);
    let promoted = next_of(&heap, old).unwrap();
    assert_eq!(space_of(promoted), SpaceType::Old);
    assert_eq!(value_of(&heap, promoted), 2);
    assert_eq!(heap.semi_space().heap_object_size(), 0);
    assert_eq!(heap.stats().last_promoted_bytes, NODE_SIZE);
    assert!(!unsafe { Region::from_address(old) }
        .old_to_new_contains(crate::object_header::slot_address(old, 1)));
}

#[test]
fn test_partial_gc_sweeps_then_evacuates_fragmented_region() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    for i in 0..10 {
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
        if i % 2 == 0 {
            ctx.add_root(node);
        }
    }
    let before: Vec<Address> = (0..5).map(|i| ctx.root(i)).collect();

    // Never swept regions are not collection set candidates: swept in place
    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    let after: Vec<Address> = (0..5).map(|i| ctx.root(i)).collect();
    assert_eq!(before, after);
    assert_eq!(heap.old_space().heap_object_size(), 5 * NODE_SIZE);
    assert!(heap.old_space().free_list_available() > 0);

    // Now the region is known to be mostly empty and gets evacuated
    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    for (index, &old_addr) in before.iter().enumerate() {
        assert_ne!(ctx.root(index), old_addr);
        assert_eq!(value_of(&heap, ctx.root(index)), index as i32 * 2);
    }
    assert_eq!(heap.old_space().region_count(), 1);
    assert_eq!(heap.old_space().heap_object_size(), 5 * NODE_SIZE);
    assert_eq!(heap.stats().partial_gc_count, 2);
}

#[test]
fn test_non_movable_objects_stay_in_place() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let kept = alloc_node(&mut heap, &mut ctx, 5, SpaceType::NonMovable);
    for i in 0..50 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::NonMovable);
    }
    ctx.add_root(kept);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_eq!(ctx.root(0), kept);
    assert_eq!(value_of(&heap, kept), 5);
    assert_eq!(heap.non_movable_space().heap_object_size(), NODE_SIZE);
}

#[test]
fn test_simple_cycle_collected() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let a = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    let b = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Old);
    link(&heap, a, b);
    link(&heap, b, a);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_eq!(heap.old_space().heap_object_size(), 0);
}

#[test]
fn test_rooted_cycle_survives() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let a = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    let b = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Young);
    let c = alloc_node(&mut heap, &mut ctx, 3, SpaceType::Old);
    link(&heap, a, b);
    link(&heap, b, c);
    link(&heap, c, a);
    ctx.add_root(a);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    let a = ctx.root(0);
    let b = next_of(&heap, a).unwrap();
    let c = next_of(&heap, b).unwrap();
    assert_eq!(next_of(&heap, c), Some(a));
    assert_eq!(
        [value_of(&heap, a), value_of(&heap, b), value_of(&heap, c)],
        [1, 2, 3]
    );
    assert_eq!(heap.old_space().heap_object_size(), 3 * NODE_SIZE);
}

#[test]
fn test_large_chain_survives_parallel_mark() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let n = 5000;
    let head = alloc_node(&mut heap, &mut ctx, 0, SpaceType::Old);
    ctx.add_root(head);
    let mut tail = head;
    for i in 1..n {
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
        link(&heap, tail, node);
        tail = node;
    }

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    let values = list_values(&heap, ctx.root(0));
    assert_eq!(values.len(), n as usize);
    assert!(values.iter().enumerate().all(|(i, &v)| v == i as i32));
    assert_eq!(heap.old_space().heap_object_size(), n as usize * NODE_SIZE);
}

#[test]
fn test_random_graph_survives_mixed_collections() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();
    let mut rng = StdRng::seed_from_u64(0x6b696c6e);

    // Model of the graph: each node links to an earlier node or nothing
    let count = 2000;
    let mut next: Vec<Option<usize>> = Vec::with_capacity(count);
    let mut nodes: Vec<Address> = Vec::with_capacity(count);
    let mut rooted = Vec::new();

    for i in 0..count {
        let space = if rng.random_bool(0.5) { SpaceType::Young } else { SpaceType::Old };
        let node = alloc_node(&mut heap, &mut ctx, i as i32, space);

        let target = if i > 0 && rng.random_bool(0.8) {
            Some(rng.random_range(0..i))
        } else {
            None
        };
        next.push(target);
        nodes.push(node);

        if rng.random_bool(0.05) {
            rooted.push(i);
            ctx.add_root(node);
        }
    }
    for (i, target) in next.iter().enumerate() {
        if let Some(target) = target {
            link(&heap, nodes[i], nodes[*target]);
        }
    }
    drop(nodes);

    for gc_type in [GcType::Young, GcType::Partial, GcType::Young, GcType::Full] {
        heap.collect_garbage(&mut ctx, gc_type).unwrap();
    }

    for (root_index, &start) in rooted.iter().enumerate() {
        let mut expected = Vec::new();
        let mut current = Some(start);
        while let Some(index) = current {
            expected.push(index as i32);
            current = next[index];
        }
        assert_eq!(list_values(&heap, ctx.root(root_index)), expected);
    }
    heap.verify();
}

#[test]
fn test_two_full_gcs_are_stable() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    for i in 0..200 {
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
        if i % 3 == 0 {
            ctx.add_root(node);
        }
    }

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    let first = heap.heap_object_size();
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_eq!(heap.heap_object_size(), first);
    assert_eq!(first, 67 * NODE_SIZE);
}

#[test]
fn test_huge_object_lifecycle() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let huge = heap
        .allocate_object(&mut ctx, ObjectKind::Array, 4, 512 * 1024, SpaceType::Old)
        .unwrap();
    assert_eq!(space_of(huge), SpaceType::HugeObject);
    assert_eq!(heap.huge_object_space().region_count(), 1);
    ctx.add_root(huge);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    assert_eq!(ctx.root(0), huge, "huge objects never move");
    assert_eq!(heap.huge_object_space().region_count(), 1);

    ctx.clear_roots();
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    assert_eq!(heap.huge_object_space().region_count(), 0);
    assert_eq!(heap.huge_object_space().heap_object_size(), 0);
}

// ============================================================================
// Global handle tests
// ============================================================================

#[test]
fn test_strong_global_keeps_alive() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let node = alloc_node(&mut heap, &mut ctx, 9, SpaceType::Young);
    let global = heap.global_handles().new_global(TaggedValue::from_address(node));

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    let moved = heap.global_handles().get(global).heap_address().unwrap();
    assert_ne!(moved, node);
    assert_eq!(value_of(&heap, moved), 9);
    heap.global_handles().dispose(global);
}

#[test]
fn test_weak_global_is_cleared() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let node = alloc_node(&mut heap, &mut ctx, 9, SpaceType::Old);
    let global = heap.global_handles().new_global(TaggedValue::from_address(node));
    heap.global_handles().set_weak(global);

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert!(heap.global_handles().get(global).is_undefined());
    assert_eq!(heap.old_space().heap_object_size(), 0);
}

#[test]
fn test_weak_global_follows_moved_target() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let node = alloc_node(&mut heap, &mut ctx, 3, SpaceType::Young);
    ctx.add_root(node);
    let global = heap.global_handles().new_global(TaggedValue::from_address(node));
    heap.global_handles().set_weak(global);

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    let weak_target = heap.global_handles().get(global).heap_address();
    assert_eq!(weak_target, Some(ctx.root(0)));
    assert!(heap.global_handles().is_weak(global));
}

#[test]
fn test_weak_callbacks_run_once() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let first_pass = Arc::new(AtomicUsize::new(0));
    let second_pass = Arc::new(AtomicUsize::new(0));

    let node = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    let global = heap.global_handles().new_global(TaggedValue::from_address(node));
    {
        let first_pass = first_pass.clone();
        let second_pass = second_pass.clone();
        heap.global_handles().set_weak_with_callback(
            global,
            Some(Box::new(move || {
                first_pass.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move || {
                second_pass.fetch_add(1, Ordering::SeqCst);
            })),
        );
    }

    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert_eq!(first_pass.load(Ordering::SeqCst), 1);
    assert_eq!(second_pass.load(Ordering::SeqCst), 1);
    assert!(heap.global_handles().get(global).is_undefined());
}

#[test]
fn test_root_provider() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let shared = Arc::new(Mutex::new(Vec::new()));
    let id = heap.add_root_provider(Box::new(SharedRoots(shared.clone())));

    let node = alloc_node(&mut heap, &mut ctx, 11, SpaceType::Young);
    shared.lock().push(TaggedValue::from_address(node));

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    let moved = shared.lock()[0].heap_address().unwrap();
    assert_eq!(value_of(&heap, moved), 11);
    assert_eq!(heap.old_space().heap_object_size(), NODE_SIZE);

    assert!(heap.remove_root_provider(id).is_some());
    assert!(heap.remove_root_provider(id).is_none());
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    assert_eq!(heap.old_space().heap_object_size(), 0);
}

// ============================================================================
// Concurrent marking tests
// ============================================================================

#[test]
fn test_concurrent_mark_finishes_with_remark() {
    let mut heap = concurrent_heap();
    let mut ctx = TestContext::new();

    let a = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    ctx.add_root(a);
    assert!(heap.is_marking());
    assert_eq!(heap.phase(), GcPhase::Marking);
    assert_eq!(heap.stats().concurrent_mark_count, 1);

    // Objects allocated and linked during the mark must survive it
    let b = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Old);
    link(&heap, a, b);
    let c = alloc_node(&mut heap, &mut ctx, 3, SpaceType::Young);
    link(&heap, b, c);
    assert!(unsafe { Region::from_address(b) }
        .cross_region_contains(crate::object_header::slot_address(b, 1)));

    // A young request during marking runs as partial
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    assert!(!heap.is_marking());
    assert_eq!(heap.stats().young_gc_count, 0);
    assert_eq!(heap.stats().partial_gc_count, 1);
    assert_eq!(heap.stats().last_gc_type, Some(GcType::Partial));

    let a = ctx.root(0);
    assert_eq!(list_values(&heap, a), vec![1, 2, 3]);
    let c = next_of(&heap, next_of(&heap, a).unwrap()).unwrap();
    assert_eq!(space_of(c), SpaceType::Old);
    heap.verify();
}

#[test]
fn test_insertion_barrier_keeps_moved_unmarked_object() {
    let mut heap = concurrent_heap();
    let mut ctx = TestContext::new();

    let count = 3000;
    let head = alloc_node(&mut heap, &mut ctx, 0, SpaceType::Old);
    ctx.add_root(head);
    let mut tail = head;
    for i in 1..count {
        let node = alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
        link(&heap, tail, node);
        tail = node;
    }

    // Start from a heap where no chain node carries a mark bit
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    assert!(!heap.is_marking());
    assert!(heap.try_trigger_concurrent_marking(&mut ctx));

    let holder = alloc_node(&mut heap, &mut ctx, -1, SpaceType::Old);
    ctx.add_root(holder);

    // Move the back half of the chain under the new holder, then cut the only
    // path the marker could still take to it
    let cut = count / 2;
    let mut before_cut = ctx.root(0);
    for _ in 1..cut {
        before_cut = next_of(&heap, before_cut).unwrap();
    }
    let moved = next_of(&heap, before_cut).unwrap();
    link(&heap, holder, moved);
    heap.set_field(before_cut, 1, TaggedValue::UNDEFINED);

    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    assert!(!heap.is_marking());

    assert_eq!(list_values(&heap, ctx.root(0)), (0..cut).collect::<Vec<_>>());
    let mut expected = vec![-1];
    expected.extend(cut..count);
    assert_eq!(list_values(&heap, ctx.root(1)), expected);
    assert_eq!(heap.verify(), count as usize + 1);
}

#[test]
fn test_full_gc_aborts_concurrent_mark() {
    let mut heap = concurrent_heap();
    let mut ctx = TestContext::new();

    let a = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    ctx.add_root(a);
    for i in 0..100 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
    }
    assert!(heap.is_marking());

    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();

    assert!(!heap.is_marking());
    assert_eq!(heap.stats().full_gc_count, 1);
    assert_eq!(heap.stats().partial_gc_count, 0);
    assert_eq!(value_of(&heap, ctx.root(0)), 1);
    assert_eq!(heap.old_space().heap_object_size(), NODE_SIZE);
}

#[test]
fn test_concurrent_sweep_merges_before_expanding() {
    let mut heap = Heap::new(
        HeapConfigBuilder::from_heap_size(32 * 1024 * 1024)
            .enable_concurrent_mark(false)
            .enable_concurrent_sweep(true)
            .build(),
    );
    let mut ctx = TestContext::new();

    let kept = alloc_node(&mut heap, &mut ctx, 1, SpaceType::Old);
    ctx.add_root(kept);
    for i in 0..2000 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Old);
    }
    assert_eq!(heap.old_space().region_count(), 1);

    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    let node = alloc_node(&mut heap, &mut ctx, 2, SpaceType::Old);

    assert_eq!(heap.old_space().region_count(), 1);
    assert_eq!(space_of(node), SpaceType::Old);
    assert_eq!(heap.old_space().heap_object_size(), 2 * NODE_SIZE);
    assert_eq!(heap.phase(), GcPhase::Idle);
}

// ============================================================================
// Allocation failure and escalation tests
// ============================================================================

#[test]
fn test_young_exhaustion_triggers_young_gc() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    for i in 0..100_000 {
        alloc_node(&mut heap, &mut ctx, i, SpaceType::Young);
    }

    assert!(heap.stats().young_gc_count > 0);
    assert_eq!(heap.stats().full_gc_count, 0);
}

#[test]
fn test_old_space_exhaustion_reports_oom() {
    let capacity = 4 * DEFAULT_REGION_SIZE;
    let mut heap = Heap::new(
        HeapConfigBuilder::new()
            .old_space_capacity(capacity)
            .min_old_space_limit(capacity)
            .enable_concurrent_mark(false)
            .enable_concurrent_sweep(false)
            .build(),
    );
    let mut ctx = TestContext::new();

    let mut allocated = 0;
    let error = loop {
        match heap.allocate_object(&mut ctx, ObjectKind::Plain, 0, 100 * 1024, SpaceType::Old) {
            Ok(object) => {
                ctx.add_root(object);
                allocated += 1;
            }
            Err(error) => break error,
        }
    };

    assert_eq!(allocated, 8);
    assert!(matches!(error, AllocError::OutOfMemory { space: SpaceType::Old, .. }));
    assert!(error.is_out_of_memory());
    assert!(heap.stats().full_gc_count >= 1);

    // Dropping the roots makes room again
    ctx.clear_roots();
    assert!(heap
        .allocate_object(&mut ctx, ObjectKind::Plain, 0, 100 * 1024, SpaceType::Old)
        .is_ok());
}

#[test]
fn test_oversized_object_reports_oom() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let error = heap
        .allocate_object(&mut ctx, ObjectKind::Plain, usize::MAX / 16, 0, SpaceType::Old)
        .unwrap_err();
    assert!(error.is_out_of_memory());

    let error = heap
        .allocate_object(&mut ctx, ObjectKind::Plain, 0, usize::MAX - 64, SpaceType::Young)
        .unwrap_err();
    assert!(matches!(error, AllocError::OutOfMemory { space: SpaceType::Young, .. }));

    // Nothing was collected or committed for the rejected requests
    assert_eq!(heap.stats().full_gc_count, 0);
    assert!(heap
        .allocate_object(&mut ctx, ObjectKind::Plain, NODE_SLOTS, 0, SpaceType::Old)
        .is_ok());
}

// ============================================================================
// Policy tests
// ============================================================================

#[test]
fn test_select_gc_type() {
    let heap = test_heap();
    assert_eq!(heap.select_gc_type(), GcType::Young);
}

#[test]
fn test_background_mode_is_reversible() {
    let mut heap = Heap::new(
        HeapConfigBuilder::new()
            .background_mark_task_count(1)
            .background_disables_concurrency(true)
            .build(),
    );
    let foreground_tasks = heap.max_mark_task_count();
    assert_eq!(foreground_tasks, task_pool::total_thread_num());

    heap.change_gc_params(true);
    assert!(heap.is_in_background());
    assert_eq!(heap.growing_type(), MemGrowingType::Conservative);
    assert!(!heap.is_concurrent_mark_enabled());
    assert!(!heap.is_concurrent_sweep_enabled());
    assert_eq!(heap.max_mark_task_count(), 1);
    assert_eq!(heap.semi_space().capacity(), heap.semi_space().min_capacity());

    heap.change_gc_params(false);
    assert!(!heap.is_in_background());
    assert_eq!(heap.growing_type(), MemGrowingType::HighThroughput);
    assert!(heap.is_concurrent_mark_enabled());
    assert!(heap.is_concurrent_sweep_enabled());
    assert_eq!(heap.max_mark_task_count(), foreground_tasks);
}

#[test]
fn test_memory_pressure() {
    let mut heap = test_heap();

    heap.notify_memory_pressure(true);
    assert_eq!(heap.growing_type(), MemGrowingType::Pressure);

    // Pressure wins over background tuning
    heap.change_gc_params(true);
    assert_eq!(heap.growing_type(), MemGrowingType::Pressure);
    heap.change_gc_params(false);
    assert_eq!(heap.growing_type(), MemGrowingType::Pressure);

    heap.notify_memory_pressure(false);
    assert_eq!(heap.growing_type(), MemGrowingType::Conservative);
}

#[test]
fn test_pressure_limits_old_generation_growth() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    heap.notify_memory_pressure(true);
    heap.collect_garbage(&mut ctx, GcType::Full).unwrap();
    assert_eq!(heap.old_space_limit(), heap.config().min_old_space_limit);
}

#[test]
fn test_idle_collection_runs_young_gc() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    // Fill young space past half of its capacity
    let half = heap.semi_space().capacity() / 2;
    while heap.semi_space().heap_object_size() <= half {
        heap.allocate_object(&mut ctx, ObjectKind::Plain, 0, 4096, SpaceType::Young)
            .unwrap();
    }

    assert!(!heap.trigger_idle_collection(&mut ctx, 10).unwrap());
    assert!(heap.trigger_idle_collection(&mut ctx, 5000).unwrap());
    assert_eq!(heap.stats().young_gc_count, 1);
    assert!(!heap.trigger_idle_collection(&mut ctx, 5000).unwrap());
}

#[test]
fn test_idle_collection_runs_full_gc_at_rest() {
    let mut heap = Heap::new(
        stop_the_world_config()
            .max_heap_size(64 * 1024 * 1024)
            .min_old_space_limit(8 * 1024 * 1024)
            .build(),
    );
    let mut ctx = TestContext::new();

    for _ in 0..25 {
        let object = heap
            .allocate_object(&mut ctx, ObjectKind::Plain, 0, 100 * 1024, SpaceType::Old)
            .unwrap();
        ctx.add_root(object);
    }
    assert_eq!(heap.stats().gc_count(), 0);

    // The heap has to stay unchanged over several long idle periods first
    assert!(!heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    assert!(!heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    assert!(heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    assert_eq!(heap.stats().full_gc_count, 1);

    // No further rest collection until the heap grows
    for _ in 0..5 {
        assert!(!heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    }
    assert_eq!(heap.stats().full_gc_count, 1);
    assert_eq!(ctx.roots.len(), 25);
}

#[test]
fn test_idle_collection_runs_partial_gc_over_old_limit() {
    let mut heap = Heap::new(
        stop_the_world_config()
            .max_heap_size(64 * 1024 * 1024)
            .min_old_space_limit(4 * DEFAULT_REGION_SIZE)
            .build(),
    );
    let mut ctx = TestContext::new();

    for _ in 0..12 {
        let object = heap
            .allocate_object(&mut ctx, ObjectKind::Plain, 0, 100 * 1024, SpaceType::Old)
            .unwrap();
        ctx.add_root(object);
    }
    let partial_gc_count = heap.stats().partial_gc_count;

    // Short idle periods never run an old generation collection
    assert!(!heap.trigger_idle_collection(&mut ctx, 5000).unwrap());
    assert_eq!(heap.stats().partial_gc_count, partial_gc_count);

    assert!(heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    assert_eq!(heap.stats().partial_gc_count, partial_gc_count + 1);
    assert_eq!(heap.stats().full_gc_count, 0);

    // The committed size left by that collection is the new idle limit
    assert!(!heap.trigger_idle_collection(&mut ctx, 20_000).unwrap());
    assert_eq!(heap.stats().partial_gc_count, partial_gc_count + 1);
}

#[test]
fn test_verify_after_mixed_collections() {
    let mut heap = test_heap();
    let mut ctx = TestContext::new();

    let old = alloc_node(&mut heap, &mut ctx, 0, SpaceType::Old);
    ctx.add_root(old);
    for i in 1..50 {
        let young = alloc_node(&mut heap, &mut ctx, i, SpaceType::Young);
        if i % 5 == 0 {
            link(&heap, ctx.root(0), young);
            ctx.add_root(young);
        }
    }

    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();
    heap.verify();
    heap.collect_garbage(&mut ctx, GcType::Partial).unwrap();
    heap.verify();
    heap.collect_garbage(&mut ctx, GcType::Young).unwrap();

    assert_eq!(heap.verify(), 10);
}
