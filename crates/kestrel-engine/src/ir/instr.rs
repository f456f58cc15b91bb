//! IR instructions, blocks, and functions

use rustc_hash::FxHashMap;

use super::types::JsType;

/// Virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

impl std::fmt::Display for VReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// An IR-level constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Const {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Int32
    I32(i32),
    /// Double
    F64(f64),
    /// String (module string-table index)
    Str(u32),
}

impl Const {
    /// Static type of this constant.
    pub fn ty(self) -> JsType {
        match self {
            Const::Undefined => JsType::Undefined,
            Const::Null => JsType::Null,
            Const::Bool(_) => JsType::Boolean,
            Const::I32(_) => JsType::Int32,
            Const::F64(_) => JsType::Float64,
            Const::Str(_) => JsType::String,
        }
    }
}

/// The canonical operand encoding, used by every pass and backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// A virtual register (SSA use of its defining instruction)
    Reg(VReg),
    /// An immediate constant
    Imm(Const),
    /// A block label (phi sources)
    Block(BlockId),
}

impl Operand {
    /// The register, if this operand is one.
    pub fn as_reg(self) -> Option<VReg> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    /// The immediate, if this operand is one.
    pub fn as_imm(self) -> Option<Const> {
        match self {
            Operand::Imm(c) => Some(c),
            _ => None,
        }
    }
}

/// Binary arithmetic operator kind, shared by the generic and the
/// type-specialized instruction forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    /// Addition (JS `+`: numeric add or concat in the generic form)
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Remainder
    Mod,
    /// `&` on int32
    BitAnd,
    /// `|` on int32
    BitOr,
    /// `^` on int32
    BitXor,
    /// `<<` (shift amount masked to 5 bits)
    Shl,
    /// `>>`
    Shr,
    /// `>>>`
    Ushr,
}

/// Comparison operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `===`
    StrictEq,
    /// `!==`
    StrictNe,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    /// The comparison with operand order swapped (`a < b` ⇔ `b > a`).
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }
}

/// IR operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // ===== Values =====
    /// Materialize a constant
    Const,
    /// Register copy
    Move,
    /// SSA phi; args alternate Block/Reg pairs
    Phi,

    // ===== Arithmetic =====
    /// Generic JS binary operator
    Bin(BinOp),
    /// Int32-specialized binary operator (guarded; overflow deoptimizes)
    BinInt(BinOp),
    /// Float64-specialized binary operator
    BinFloat(BinOp),
    /// String concatenation
    ConcatStr,
    /// Generic numeric negate
    Neg,
    /// Int32 negate
    NegInt,
    /// Float64 negate
    NegFloat,
    /// `~` (ToInt32 then complement)
    BitNot,
    /// `!` (ToBoolean then complement)
    Not,
    /// Fused multiply-add: args a, b, c → a*b + c (float)
    Fma,

    // ===== Comparison =====
    /// Generic comparison
    Cmp(CmpOp),
    /// Int32-specialized comparison
    CmpInt(CmpOp),
    /// Float64-specialized comparison
    CmpFloat(CmpOp),
    /// String-specialized comparison
    CmpStr(CmpOp),

    // ===== Conversions =====
    /// JS ToNumber
    ToNumber,
    /// JS ToString
    ToString,
    /// JS ToBoolean
    ToBoolean,
    /// ToInt32 (modulo 2^32)
    ToInt32,
    /// Exact widening int32 → double
    Int32ToDouble,
    /// Truncating double → int32 (guarded in specialized code)
    DoubleToInt32,

    // ===== Type tests =====
    /// `typeof`
    TypeOf,
    /// `instanceof`
    InstanceOf,
    /// `in`
    In,

    // ===== Guards (deopt on failure) =====
    /// Value must be an int32 number
    GuardInt,
    /// Value must be a number
    GuardFloat,
    /// Value must be a string
    GuardString,

    // ===== Locals / arguments / globals =====
    /// Load local slot (arg 0: Imm index)
    LoadLocal,
    /// Store local slot (args: Imm index, value)
    StoreLocal,
    /// Load argument
    LoadArg,
    /// Store argument
    StoreArg,
    /// Load global (arg: Imm string index)
    LoadGlobal,
    /// Store global
    StoreGlobal,

    // ===== Properties / elements =====
    /// args: object, Imm name → value
    GetProp,
    /// args: object, Imm name, value
    SetProp,
    /// args: object, Imm name → bool
    DelProp,
    /// args: object, index → value
    GetElem,
    /// args: object, index, value
    SetElem,
    /// args: object, index → bool
    DelElem,
    /// args: object, index, Imm offset → value (combined addressing form)
    GetElemOffset,

    // ===== Allocation =====
    /// New empty object
    NewObject,
    /// New array from element args
    NewArray,

    // ===== Calls =====
    /// args: Imm function index, then the call arguments
    Call,

    // ===== Vector (emitted by the vectorizer) =====
    /// Lane count of the widest vector unit; materialized by the backend
    VecWidth,
    /// args: array, index → vector of elements starting at index
    VecLoad,
    /// args: array, index, vector
    VecStore,
    /// Lane-wise binary op on vectors
    VecBin(BinOp),
    /// Lane-wise fused multiply-add: a*b + c
    VecFma,
    /// Horizontal sum reduction → scalar
    VecReduceSum,

    // ===== Runtime integration =====
    /// GC / tier-check poll; also an OSR entry anchor at loop headers
    Safepoint,
}

impl Op {
    /// Whether this operation has observable side effects (cannot be removed
    /// by DCE, reordered across other effects, or hoisted).
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Op::StoreLocal
                | Op::StoreArg
                | Op::StoreGlobal
                | Op::SetProp
                | Op::DelProp
                | Op::SetElem
                | Op::DelElem
                | Op::NewObject
                | Op::NewArray
                | Op::Call
                | Op::VecStore
                | Op::Safepoint
                | Op::GuardInt
                | Op::GuardFloat
                | Op::GuardString
                // Generic forms may invoke user code via valueOf/toString
                | Op::Bin(_)
                | Op::Cmp(_)
                | Op::Neg
                | Op::ToNumber
                | Op::ToString
                | Op::GetProp
                | Op::GetElem
                | Op::GetElemOffset
                | Op::InstanceOf
                | Op::In
        )
    }

    /// Whether the operation may read mutable memory (blocks CSE across
    /// stores and hoisting past effects even when it has none itself).
    pub fn reads_memory(self) -> bool {
        matches!(
            self,
            Op::LoadLocal
                | Op::LoadArg
                | Op::LoadGlobal
                | Op::GetProp
                | Op::GetElem
                | Op::GetElemOffset
                | Op::VecLoad
        )
    }
}

/// Deoptimization causes recorded with the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    /// A type guard observed an unexpected kind
    TypeInstability,
    /// Speculated int32 arithmetic overflowed
    ArithmeticOverflow,
    /// Object layout differed from the speculated shape
    UnexpectedShape,
    /// An inlined callee was invalidated
    InlineeInvalidated,
    /// Lowering hit an operation the tier does not support
    UnsupportedOperation,
}

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// Operation
    pub op: Op,
    /// Destination register, if the operation produces a value
    pub dest: Option<VReg>,
    /// Operands in the canonical encoding
    pub args: Vec<Operand>,
    /// Originating bytecode offset (instruction index) for deopt mapping
    pub bc: u32,
}

impl Instr {
    /// Iterate over register operands.
    pub fn reg_uses(&self) -> impl Iterator<Item = VReg> + '_ {
        self.args.iter().filter_map(|a| a.as_reg())
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Unconditional jump
    Jump(BlockId),
    /// Two-way branch on a boolean operand
    Branch {
        /// Condition value
        cond: Operand,
        /// Taken when truthy
        then_block: BlockId,
        /// Taken when falsy
        else_block: BlockId,
    },
    /// Return with an optional value
    Return(Option<Operand>),
    /// Throw
    Throw(Operand),
    /// Bail out to the interpreter
    Deopt {
        /// Why
        reason: DeoptReason,
        /// Bytecode offset to resume at
        bc: u32,
    },
    /// Not yet assigned (only during construction)
    None,
}

impl Terminator {
    /// Successor blocks.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            _ => vec![],
        }
    }

    /// Register operands read by this terminator.
    pub fn reg_uses(&self) -> Option<VReg> {
        match self {
            Terminator::Branch { cond, .. } => cond.as_reg(),
            Terminator::Return(Some(v)) | Terminator::Throw(v) => v.as_reg(),
            _ => None,
        }
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Identifier (also the index into `IrFunction::blocks`)
    pub id: BlockId,
    /// Instructions in order
    pub instrs: Vec<Instr>,
    /// Terminator
    pub term: Terminator,
    /// Predecessor blocks
    pub preds: Vec<BlockId>,
    /// Bytecode offset this block starts at
    pub bc_start: u32,
}

/// A complete IR function.
#[derive(Debug, Clone)]
pub struct IrFunction {
    /// Index in the module's function table
    pub func_index: u32,
    /// Parameter count
    pub param_count: u32,
    /// Local-slot count
    pub local_count: u32,
    /// Basic blocks; entry is block 0
    pub blocks: Vec<Block>,
    /// Next free virtual register
    pub next_reg: u32,
    /// Register types (filled during building and by type inference)
    pub reg_types: FxHashMap<VReg, JsType>,
    /// Loop headers by bytecode offset (OSR anchors)
    pub loop_headers: Vec<u32>,
}

impl IrFunction {
    /// Create an empty function.
    pub fn new(func_index: u32, param_count: u32, local_count: u32) -> Self {
        IrFunction {
            func_index,
            param_count,
            local_count,
            blocks: Vec::new(),
            next_reg: 0,
            reg_types: FxHashMap::default(),
            loop_headers: Vec::new(),
        }
    }

    /// Allocate a fresh register with a type.
    pub fn alloc_reg(&mut self, ty: JsType) -> VReg {
        let reg = VReg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    /// Type of a register (`Mixed` when untracked).
    pub fn reg_type(&self, reg: VReg) -> JsType {
        self.reg_types.get(&reg).copied().unwrap_or(JsType::Mixed)
    }

    /// Add a block and return its id.
    pub fn add_block(&mut self, bc_start: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            instrs: Vec::new(),
            term: Terminator::None,
            preds: Vec::new(),
            bc_start,
        });
        id
    }

    /// Shared block accessor.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Mutable block accessor.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// Total instruction count.
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Recompute predecessor lists from terminators.
    pub fn recompute_preds(&mut self) {
        for b in &mut self.blocks {
            b.preds.clear();
        }
        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .iter()
            .flat_map(|b| b.term.successors().into_iter().map(move |s| (b.id, s)))
            .collect();
        for (from, to) in edges {
            let preds = &mut self.blocks[to.0 as usize].preds;
            if !preds.contains(&from) {
                preds.push(from);
            }
        }
    }

    /// Map from each defined register to its defining (block, instr index).
    pub fn def_sites(&self) -> FxHashMap<VReg, (BlockId, usize)> {
        let mut map = FxHashMap::default();
        for block in &self.blocks {
            for (i, instr) in block.instrs.iter().enumerate() {
                if let Some(d) = instr.dest {
                    map.insert(d, (block.id, i));
                }
            }
        }
        map
    }
}
