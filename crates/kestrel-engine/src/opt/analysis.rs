//! CFG analyses shared by the passes: reachability, reverse postorder,
//! dominators, and natural-loop detection.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::instr::{BlockId, IrFunction};

/// Blocks reachable from entry.
pub fn reachable_blocks(func: &IrFunction) -> FxHashSet<BlockId> {
    let mut seen = FxHashSet::default();
    if func.blocks.is_empty() {
        return seen;
    }
    let mut stack = vec![BlockId(0)];
    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        for s in func.block(b).term.successors() {
            stack.push(s);
        }
    }
    seen
}

/// Reverse postorder over reachable blocks.
pub fn reverse_postorder(func: &IrFunction) -> Vec<BlockId> {
    let mut visited = FxHashSet::default();
    let mut post = Vec::new();
    if func.blocks.is_empty() {
        return post;
    }

    // Iterative DFS with an explicit phase marker
    let mut stack: Vec<(BlockId, bool)> = vec![(BlockId(0), false)];
    while let Some((b, processed)) = stack.pop() {
        if processed {
            post.push(b);
            continue;
        }
        if !visited.insert(b) {
            continue;
        }
        stack.push((b, true));
        for s in func.block(b).term.successors() {
            if !visited.contains(&s) {
                stack.push((s, false));
            }
        }
    }
    post.reverse();
    post
}

/// Immediate dominators of reachable blocks, entry mapped to itself.
///
/// Standard iterative dataflow over reverse postorder.
pub fn dominators(func: &IrFunction) -> FxHashMap<BlockId, BlockId> {
    let rpo = reverse_postorder(func);
    let mut order: FxHashMap<BlockId, usize> = FxHashMap::default();
    for (i, &b) in rpo.iter().enumerate() {
        order.insert(b, i);
    }

    let mut idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    if rpo.is_empty() {
        return idom;
    }
    let entry = rpo[0];
    idom.insert(entry, entry);

    let intersect = |idom: &FxHashMap<BlockId, BlockId>,
                     order: &FxHashMap<BlockId, usize>,
                     mut a: BlockId,
                     mut b: BlockId| {
        while a != b {
            while order[&a] > order[&b] {
                a = idom[&a];
            }
            while order[&b] > order[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let preds: Vec<BlockId> = func
                .block(b)
                .preds
                .iter()
                .copied()
                .filter(|p| order.contains_key(p))
                .collect();
            let mut new_idom: Option<BlockId> = None;
            for &p in &preds {
                if idom.contains_key(&p) {
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &order, cur, p),
                    });
                }
            }
            if let Some(ni) = new_idom {
                if idom.get(&b) != Some(&ni) {
                    idom.insert(b, ni);
                    changed = true;
                }
            }
        }
    }
    idom
}

/// Whether `a` dominates `b`.
pub fn dominates(idom: &FxHashMap<BlockId, BlockId>, a: BlockId, b: BlockId) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        match idom.get(&cur) {
            Some(&d) if d != cur => cur = d,
            _ => return false,
        }
    }
}

/// A natural loop: header plus body (header included).
#[derive(Debug, Clone)]
pub struct NaturalLoop {
    /// The loop header
    pub header: BlockId,
    /// Latch blocks (sources of back-edges)
    pub latches: Vec<BlockId>,
    /// All blocks in the loop, header included
    pub body: FxHashSet<BlockId>,
}

/// Find natural loops via back-edges (an edge whose target dominates its
/// source). Loops sharing a header are merged.
pub fn natural_loops(func: &IrFunction) -> Vec<NaturalLoop> {
    let idom = dominators(func);
    let reachable = reachable_blocks(func);
    let mut loops: FxHashMap<BlockId, NaturalLoop> = FxHashMap::default();

    for &b in &reachable {
        for succ in func.block(b).term.successors() {
            if reachable.contains(&succ) && dominates(&idom, succ, b) {
                // b → succ is a back-edge; collect the loop body by walking
                // predecessors from the latch up to the header.
                let entry = loops.entry(succ).or_insert_with(|| NaturalLoop {
                    header: succ,
                    latches: Vec::new(),
                    body: {
                        let mut s = FxHashSet::default();
                        s.insert(succ);
                        s
                    },
                });
                entry.latches.push(b);
                let mut stack = vec![b];
                while let Some(n) = stack.pop() {
                    if entry.body.insert(n) {
                        for &p in &func.block(n).preds {
                            stack.push(p);
                        }
                    }
                }
            }
        }
    }

    let mut result: Vec<NaturalLoop> = loops.into_values().collect();
    result.sort_by_key(|l| l.header.0);
    result
}
