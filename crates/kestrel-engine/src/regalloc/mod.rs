//! Linear-scan register allocation
//!
//! Runs after scheduling. One pass over the linearized function collects, per
//! virtual register, the interval `[first_def, last_use]`; intervals are then
//! walked in start order, expiring finished intervals, assigning from the
//! free pool, and otherwise spilling whichever of the current and the
//! longest-lived active interval ends latest. The allocator owns the
//! spill-slot table: one per function, slots 8-byte aligned, growing down
//! from the frame pointer.

use rustc_hash::FxHashMap;

use crate::ir::instr::{IrFunction, Op, Operand, VReg};
use crate::opt::analysis::reverse_postorder;

/// A physical register number (meaning is per-target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg(pub u8);

/// Where a virtual register lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// In a physical register
    Reg(PhysReg),
    /// In the spill slot with this index (offset = -8 × (index + 1) from FP)
    Spill(u32),
}

impl Location {
    /// Frame-pointer-relative byte offset for spill slots.
    pub fn frame_offset(self) -> Option<i32> {
        match self {
            Location::Spill(i) => Some(-8 * (i as i32 + 1)),
            Location::Reg(_) => None,
        }
    }
}

/// A live interval over the linearized instruction numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    /// The virtual register
    pub reg: VReg,
    /// Position of the defining instruction
    pub start: u32,
    /// Position of the last use
    pub end: u32,
}

/// Result of allocation. Dropped with the per-function compile artifact;
/// backends read slots from here and never allocate their own.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// virtual → physical or spill slot
    pub mapping: FxHashMap<VReg, Location>,
    /// Number of spill slots used
    pub spill_slots: u32,
    /// The intervals, sorted by start (kept for diagnostics and stack maps)
    pub intervals: Vec<LiveInterval>,
}

impl Allocation {
    /// Location of a register.
    pub fn location(&self, reg: VReg) -> Option<Location> {
        self.mapping.get(&reg).copied()
    }

    /// Bytes of stack the spill area needs, 16-byte aligned for ABI frames.
    pub fn spill_area_size(&self) -> u32 {
        let raw = self.spill_slots * 8;
        (raw + 15) & !15
    }
}

/// Compute live intervals over the linearized block order.
pub fn live_intervals(func: &IrFunction) -> Vec<LiveInterval> {
    let order = reverse_postorder(func);
    let mut starts: FxHashMap<VReg, u32> = FxHashMap::default();
    let mut ends: FxHashMap<VReg, u32> = FxHashMap::default();
    // Linear position of each block's first instruction, for phi extension
    let mut block_end_pos: FxHashMap<crate::ir::instr::BlockId, u32> = FxHashMap::default();

    let mut pos: u32 = 0;
    for &bid in &order {
        let block = func.block(bid);
        for instr in &block.instrs {
            if let Some(d) = instr.dest {
                starts.entry(d).or_insert(pos);
                ends.entry(d).or_insert(pos);
            }
            if instr.op != Op::Phi {
                for r in instr.reg_uses() {
                    let e = ends.entry(r).or_insert(pos);
                    *e = (*e).max(pos);
                    starts.entry(r).or_insert(0);
                }
            }
            pos += 1;
        }
        // Terminator counts as one position
        if let Some(r) = func.block(bid).term.reg_uses() {
            let e = ends.entry(r).or_insert(pos);
            *e = (*e).max(pos);
            starts.entry(r).or_insert(0);
        }
        pos += 1;
        block_end_pos.insert(bid, pos - 1);
    }

    // Phi sources are live out of their predecessor block
    for &bid in &order {
        for instr in &func.block(bid).instrs {
            if instr.op == Op::Phi {
                for pair in instr.args.chunks(2) {
                    if let (Some(Operand::Block(pred)), Some(Operand::Reg(src))) =
                        (pair.first().copied(), pair.get(1).copied())
                    {
                        if let Some(&pend) = block_end_pos.get(&pred) {
                            let e = ends.entry(src).or_insert(pend);
                            *e = (*e).max(pend);
                            starts.entry(src).or_insert(0);
                        }
                    }
                }
            }
        }
    }

    let mut intervals: Vec<LiveInterval> = starts
        .into_iter()
        .map(|(reg, start)| LiveInterval { reg, start, end: ends.get(&reg).copied().unwrap_or(start) })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.reg.0));
    intervals
}

/// Run linear scan over `func` with the target's allocatable register set.
/// Callee-saved registers pinned by the ABI and the stack/frame registers
/// must already be excluded from `allocatable`.
pub fn allocate(func: &IrFunction, allocatable: &[PhysReg]) -> Allocation {
    let intervals = live_intervals(func);
    let mut free: Vec<PhysReg> = allocatable.to_vec();
    // Active intervals sorted by end, with their assigned register
    let mut active: Vec<(LiveInterval, PhysReg)> = Vec::new();
    let mut mapping: FxHashMap<VReg, Location> = FxHashMap::default();
    let mut next_slot: u32 = 0;

    for &iv in &intervals {
        // Expire intervals that ended before this one starts
        let mut i = 0;
        while i < active.len() {
            if active[i].0.end < iv.start {
                let (_, reg) = active.remove(i);
                free.push(reg);
            } else {
                i += 1;
            }
        }

        if let Some(reg) = free.pop() {
            mapping.insert(iv.reg, Location::Reg(reg));
            active.push((iv, reg));
            active.sort_by_key(|(a, _)| a.end);
            continue;
        }

        // Spill the interval with the latest end, current one included
        let victim_idx = active
            .iter()
            .enumerate()
            .max_by_key(|(_, (a, _))| a.end)
            .map(|(i, _)| i);
        match victim_idx {
            Some(vi) if active[vi].0.end > iv.end => {
                let (victim, reg) = active.remove(vi);
                mapping.insert(victim.reg, Location::Spill(next_slot));
                next_slot += 1;
                mapping.insert(iv.reg, Location::Reg(reg));
                active.push((iv, reg));
                active.sort_by_key(|(a, _)| a.end);
            }
            _ => {
                mapping.insert(iv.reg, Location::Spill(next_slot));
                next_slot += 1;
            }
        }
    }

    Allocation { mapping, spill_slots: next_slot, intervals }
}
