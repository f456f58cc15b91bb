//! Sweeping
//!
//! After marking, white cells in the collected generations are freed and
//! survivors age (promoting when they cross their generation's survival
//! count). With concurrent sweep enabled, the freed payloads are shipped to a
//! background thread and dropped there, keeping destructor work off the
//! pause.

use std::sync::mpsc::{channel, Sender};
use std::thread::JoinHandle;

use super::cell::{Color, GcBox, Generation};
use super::heap::Heap;

/// What one sweep did.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    /// Cells freed
    pub freed_objects: usize,
    /// Bytes freed
    pub freed_bytes: usize,
    /// Cells promoted to an older generation
    pub promoted: usize,
}

/// Background dropper for freed payloads.
pub struct ConcurrentSweeper {
    tx: Sender<Vec<GcBox>>,
    handle: Option<JoinHandle<()>>,
}

impl ConcurrentSweeper {
    /// Spawn the sweeper thread.
    pub fn spawn() -> Self {
        let (tx, rx) = channel::<Vec<GcBox>>();
        let handle = std::thread::Builder::new()
            .name("kestrel-gc-sweep".to_string())
            .spawn(move || {
                while let Ok(batch) = rx.recv() {
                    drop(batch);
                }
            })
            .expect("spawn sweeper thread");
        ConcurrentSweeper { tx, handle: Some(handle) }
    }

    fn submit(&self, batch: Vec<GcBox>) {
        // A disconnected sweeper degrades to dropping inline
        let _ = self.tx.send(batch);
    }
}

impl Drop for ConcurrentSweeper {
    fn drop(&mut self) {
        let (tx, _) = channel();
        drop(std::mem::replace(&mut self.tx, tx));
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Sweep the collected generations. White cells die; survivors age, promote,
/// and return to white for the next cycle.
pub fn sweep(
    heap: &mut Heap,
    floor: Generation,
    promotion_ages: &[u8; 3],
    concurrent: Option<&ConcurrentSweeper>,
) -> SweepOutcome {
    let mut outcome = SweepOutcome::default();
    let mut dead: Vec<GcBox> = Vec::new();

    for slot in heap.collected_slots(floor) {
        let color = match heap.get(super::GcRef(slot)) {
            Some(cell) => cell.header.color(),
            None => continue,
        };
        if color == Color::White {
            if let Some(cell) = heap.free_slot(slot) {
                outcome.freed_objects += 1;
                outcome.freed_bytes += cell.header.size;
                dead.push(cell);
            }
        } else {
            if heap.age_and_promote(slot, promotion_ages) {
                outcome.promoted += 1;
            }
            if let Some(cell) = heap.get(super::GcRef(slot)) {
                cell.header.set_color(Color::White);
            }
        }
    }

    match concurrent {
        Some(s) if !dead.is_empty() => s.submit(dead),
        _ => drop(dead),
    }
    outcome
}
