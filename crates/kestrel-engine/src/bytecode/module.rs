//! Bytecode module and function containers

use sha2::{Digest, Sha256};

use super::constants::{ConstantPool, StringTable};
use super::opcode::Opcode;

/// A decoded bytecode instruction: opcode plus up to three u32 operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The opcode
    pub opcode: Opcode,
    /// First operand (meaning depends on opcode)
    pub a: u32,
    /// Second operand
    pub b: u32,
    /// Third operand
    pub c: u32,
}

impl Instruction {
    /// Instruction with no operands.
    pub fn new(opcode: Opcode) -> Self {
        Instruction { opcode, a: 0, b: 0, c: 0 }
    }

    /// Instruction with one operand.
    pub fn with_a(opcode: Opcode, a: u32) -> Self {
        Instruction { opcode, a, b: 0, c: 0 }
    }

    /// Instruction with two operands.
    pub fn with_ab(opcode: Opcode, a: u32, b: u32) -> Self {
        Instruction { opcode, a, b, c: 0 }
    }
}

/// An exception-handler table entry.
///
/// Offsets are instruction indices. `finally_offset` is absent when the try
/// has no finally clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First instruction covered by the try region
    pub try_start: u32,
    /// One past the last covered instruction
    pub try_end: u32,
    /// Catch handler entry point
    pub catch_offset: u32,
    /// Finally handler entry point, if present
    pub finally_offset: Option<u32>,
    /// Local slot receiving the caught value
    pub catch_var_index: u32,
}

/// A compiled function.
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name (string-table index)
    pub name: u32,
    /// Number of parameters
    pub arity: u32,
    /// Number of local variable slots
    pub local_count: u32,
    /// Maximum operand-stack depth, filled by the verifier
    pub max_stack: u32,
    /// Strict-mode flag
    pub strict: bool,
    /// Instruction vector
    pub code: Vec<Instruction>,
    /// Exception handlers
    pub handlers: Vec<ExceptionHandler>,
    /// Optional local-name table (string-table indices, slot order)
    pub local_names: Vec<u32>,
}

impl Function {
    /// Create an empty function.
    pub fn new(name: u32, arity: u32) -> Self {
        Function {
            name,
            arity,
            local_count: 0,
            max_stack: 0,
            strict: false,
            code: Vec::new(),
            handlers: Vec::new(),
            local_names: Vec::new(),
        }
    }
}

/// A compiled module: functions plus the shared tables.
#[derive(Debug, Clone)]
pub struct Module {
    /// Module name (file name at emit time)
    pub name: String,
    /// Functions; index 0 is the synthetic main
    pub functions: Vec<Function>,
    /// Shared string table
    pub strings: StringTable,
    /// Shared constant pool
    pub constants: ConstantPool,
}

impl Module {
    /// Create an empty module.
    pub fn new(name: String) -> Self {
        Module {
            name,
            functions: Vec::new(),
            strings: StringTable::new(),
            constants: ConstantPool::new(),
        }
    }

    /// SHA-256 over the instruction stream and pool shapes. Keys the optional
    /// on-disk code cache together with the CPU feature set and engine version.
    pub fn checksum(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update((self.functions.len() as u32).to_le_bytes());
        for func in &self.functions {
            hasher.update(func.arity.to_le_bytes());
            hasher.update(func.local_count.to_le_bytes());
            hasher.update((func.code.len() as u32).to_le_bytes());
            for instr in &func.code {
                hasher.update([instr.opcode as u8]);
                hasher.update(instr.a.to_le_bytes());
                hasher.update(instr.b.to_le_bytes());
                hasher.update(instr.c.to_le_bytes());
            }
        }
        hasher.update((self.constants.len() as u32).to_le_bytes());
        hasher.update((self.strings.len() as u32).to_le_bytes());
        hasher.finalize().into()
    }
}

/// Errors from decoding an instruction stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Byte is not an opcode
    #[error("unknown opcode byte {0:#04x} at offset {1}")]
    UnknownOpcode(u8, usize),
    /// Stream ended inside an instruction
    #[error("truncated instruction stream at offset {0}")]
    Truncated(usize),
}

/// Encode an instruction vector: one opcode byte followed by its operands as
/// little-endian u32 words.
pub fn encode_code(code: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(code.len() * 4);
    for instr in code {
        out.push(instr.opcode as u8);
        let operands = [instr.a, instr.b, instr.c];
        for &operand in operands.iter().take(instr.opcode.operand_count()) {
            out.extend_from_slice(&operand.to_le_bytes());
        }
    }
    out
}

/// Decode an instruction stream produced by [`encode_code`].
pub fn decode_code(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < bytes.len() {
        let opcode = Opcode::from_u8(bytes[at]).ok_or(DecodeError::UnknownOpcode(bytes[at], at))?;
        at += 1;
        let mut operands = [0u32; 3];
        for operand in operands.iter_mut().take(opcode.operand_count()) {
            let end = at + 4;
            if end > bytes.len() {
                return Err(DecodeError::Truncated(at));
            }
            *operand = u32::from_le_bytes(bytes[at..end].try_into().unwrap());
            at = end;
        }
        out.push(Instruction { opcode, a: operands[0], b: operands[1], c: operands[2] });
    }
    Ok(out)
}
