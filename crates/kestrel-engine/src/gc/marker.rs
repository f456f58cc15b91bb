//! Tri-color parallel marking with work stealing
//!
//! Each worker owns a deque; new gray cells go to the owner's side, idle
//! workers steal from peers' heads (and the shared injector). A worker whose
//! pop fails must attempt steals from every peer before it can count itself
//! idle; the phase ends when every worker is idle and all queues are empty.
//! Cells outside the collected generations are left untouched — they act as
//! boundaries, not work.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Stealer, Worker};
use rand::seq::SliceRandom;

use super::cell::{Color, Generation};
use super::heap::{GcRef, Heap};

/// Mark everything reachable from `roots` within the generations covered by
/// `floor`, using `workers` threads. Returns the number of cells marked.
pub fn mark_parallel(heap: &Heap, roots: &[GcRef], workers: usize, floor: Generation) -> usize {
    let injector: Injector<GcRef> = Injector::new();
    // Grayed-but-unscanned cells across all queues; the phase is over when
    // this reaches zero, which is race-free because a cell is counted before
    // it becomes visible in any queue.
    let pending = AtomicUsize::new(0);
    for &r in roots {
        if let Some(cell) = heap.get(r) {
            if Heap::collected(cell.header.generation, floor) && cell.header.try_gray() {
                pending.fetch_add(1, Ordering::AcqRel);
                injector.push(r);
            }
        }
    }

    let marked = AtomicUsize::new(0);
    let workers = workers.max(1);

    let locals: Vec<Worker<GcRef>> = (0..workers).map(|_| Worker::new_lifo()).collect();
    let stealers: Vec<Stealer<GcRef>> = locals.iter().map(|w| w.stealer()).collect();

    std::thread::scope(|scope| {
        for local in locals {
            let injector = &injector;
            let stealers = &stealers;
            let marked = &marked;
            let pending = &pending;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                let mut order: Vec<usize> = (0..stealers.len()).collect();
                while pending.load(Ordering::Acquire) > 0 {
                    match find_work(&local, injector, stealers, &mut order, &mut rng) {
                        Some(r) => {
                            process(heap, r, &local, floor, pending);
                            marked.fetch_add(1, Ordering::Relaxed);
                            pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        None => std::thread::yield_now(),
                    }
                }
            });
        }
    });

    marked.load(Ordering::Relaxed)
}

fn find_work(
    local: &Worker<GcRef>,
    injector: &Injector<GcRef>,
    stealers: &[Stealer<GcRef>],
    order: &mut [usize],
    rng: &mut impl rand::Rng,
) -> Option<GcRef> {
    if let Some(r) = local.pop() {
        return Some(r);
    }
    // The injector first, then peers in random order
    loop {
        match injector.steal_batch_and_pop(local) {
            crossbeam_deque::Steal::Success(r) => return Some(r),
            crossbeam_deque::Steal::Retry => continue,
            crossbeam_deque::Steal::Empty => break,
        }
    }
    order.shuffle(rng);
    for &i in order.iter() {
        loop {
            match stealers[i].steal() {
                crossbeam_deque::Steal::Success(r) => return Some(r),
                crossbeam_deque::Steal::Retry => continue,
                crossbeam_deque::Steal::Empty => break,
            }
        }
    }
    None
}

/// Scan one gray cell: gray its unvisited children in collected generations,
/// then blacken it.
fn process(
    heap: &Heap,
    r: GcRef,
    local: &Worker<GcRef>,
    floor: Generation,
    pending: &AtomicUsize,
) {
    if let Some(cell) = heap.get(r) {
        cell.object.trace(&mut |child| {
            if let Some(c) = heap.get(child) {
                if Heap::collected(c.header.generation, floor) && c.header.try_gray() {
                    pending.fetch_add(1, Ordering::AcqRel);
                    local.push(child);
                }
            }
        });
        cell.header.set_color(Color::Black);
    }
}
