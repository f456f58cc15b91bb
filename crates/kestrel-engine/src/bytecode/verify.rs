//! Bytecode verification
//!
//! Checks the structural invariant every later stage depends on: the abstract
//! operand-stack depth at each reachable instruction is single-valued across
//! all control paths reaching it. Also computes the function's max stack
//! depth. A function failing verification indicates an emitter bug and is
//! treated as fatal by the caller.

use thiserror::Error;

use super::module::Function;
use super::opcode::Opcode;

/// Verification failures.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Two paths reach the same offset with different stack depths
    #[error("inconsistent stack depth at offset {offset}: {first} vs {second}")]
    InconsistentDepth {
        /// Instruction index
        offset: u32,
        /// Depth recorded first
        first: u32,
        /// Conflicting depth
        second: u32,
    },
    /// An instruction pops more values than the stack holds
    #[error("stack underflow at offset {0}")]
    Underflow(u32),
    /// A branch target is outside the function
    #[error("branch target {target} out of bounds at offset {offset}")]
    BadBranchTarget {
        /// Instruction index of the branch
        offset: u32,
        /// Its target
        target: u32,
    },
    /// Execution can fall off the end of the code
    #[error("control falls off the end of the function")]
    FallsOffEnd,
}

/// Verify a function and return its maximum operand-stack depth.
pub fn verify_function(func: &Function) -> Result<u32, VerifyError> {
    let len = func.code.len();
    if len == 0 {
        return Err(VerifyError::FallsOffEnd);
    }

    let mut depth_at: Vec<Option<u32>> = vec![None; len];
    let mut worklist: Vec<(usize, u32)> = vec![(0, 0)];
    // Catch handlers are entered with the thrown value on the stack;
    // finally handlers are entered with an empty stack.
    for h in &func.handlers {
        worklist.push((h.catch_offset as usize, 1));
        if let Some(f) = h.finally_offset {
            worklist.push((f as usize, 0));
        }
    }

    let mut max_depth = 0u32;

    while let Some((at, depth)) = worklist.pop() {
        if at >= len {
            return Err(VerifyError::FallsOffEnd);
        }
        match depth_at[at] {
            Some(prev) if prev != depth => {
                return Err(VerifyError::InconsistentDepth {
                    offset: at as u32,
                    first: prev,
                    second: depth,
                });
            }
            Some(_) => continue,
            None => depth_at[at] = Some(depth),
        }

        let instr = func.code[at];
        let op = instr.opcode;
        let (pops, pushes) = match op {
            Opcode::Call => (instr.b, 1),
            Opcode::NewArray => (instr.a, 1),
            _ => (op.pops() as u32, op.pushes() as u32),
        };
        if depth < pops {
            return Err(VerifyError::Underflow(at as u32));
        }
        let next_depth = depth - pops + pushes;
        max_depth = max_depth.max(next_depth);

        let mut branch = |target: u32, d: u32, worklist: &mut Vec<(usize, u32)>| {
            if target as usize >= len {
                return Err(VerifyError::BadBranchTarget { offset: at as u32, target });
            }
            worklist.push((target as usize, d));
            Ok(())
        };

        match op {
            Opcode::Jump => branch(instr.a, next_depth, &mut worklist)?,
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                branch(instr.a, next_depth, &mut worklist)?;
                worklist.push((at + 1, next_depth));
            }
            Opcode::Return | Opcode::ReturnUndefined | Opcode::Throw => {}
            _ => worklist.push((at + 1, next_depth)),
        }
    }

    Ok(max_depth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::module::Instruction;

    fn func_with(code: Vec<Instruction>) -> Function {
        let mut f = Function::new(0, 0);
        f.code = code;
        f
    }

    #[test]
    fn test_simple_function_verifies() {
        let f = func_with(vec![
            Instruction::with_a(Opcode::ConstI32, 5),
            Instruction::with_a(Opcode::ConstI32, 10),
            Instruction::new(Opcode::Add),
            Instruction::new(Opcode::Return),
        ]);
        assert_eq!(verify_function(&f).unwrap(), 2);
    }

    #[test]
    fn test_underflow_detected() {
        let f = func_with(vec![Instruction::new(Opcode::Add)]);
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::Underflow(0))
        ));
    }

    #[test]
    fn test_inconsistent_depth_detected() {
        // Path A reaches offset 4 with depth 1, path B with depth 0.
        let f = func_with(vec![
            Instruction::new(Opcode::ConstTrue),             // 0: depth 1
            Instruction::with_a(Opcode::JumpIfFalse, 4),     // 1: pops cond
            Instruction::with_a(Opcode::ConstI32, 1),        // 2: depth 1
            Instruction::with_a(Opcode::Jump, 4),            // 3
            Instruction::new(Opcode::ReturnUndefined),       // 4: depth 1 vs 0
        ]);
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::InconsistentDepth { offset: 4, .. })
        ));
    }

    #[test]
    fn test_branch_out_of_bounds() {
        let f = func_with(vec![Instruction::with_a(Opcode::Jump, 99)]);
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::BadBranchTarget { .. })
        ));
    }

    #[test]
    fn test_falls_off_end() {
        let f = func_with(vec![Instruction::new(Opcode::Nop)]);
        assert!(matches!(verify_function(&f), Err(VerifyError::FallsOffEnd)));
    }

    #[test]
    fn test_call_stack_effect() {
        let mut f = func_with(vec![
            Instruction::with_a(Opcode::ConstI32, 1),
            Instruction::with_a(Opcode::ConstI32, 2),
            Instruction::with_ab(Opcode::Call, 0, 2),
            Instruction::new(Opcode::Return),
        ]);
        f.arity = 0;
        assert_eq!(verify_function(&f).unwrap(), 2);
    }
}
