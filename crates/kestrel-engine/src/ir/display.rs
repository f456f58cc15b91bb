//! Textual IR dump and parse-back
//!
//! The dump format round-trips for pure IR (constants, moves, phis,
//! arithmetic, comparisons, conversions, and control flow), which is what the
//! optimizer test-beds feed back in. Effectful operations print but are not
//! re-parsed.

use std::fmt;

use thiserror::Error;

use super::instr::{
    BinOp, BlockId, CmpOp, Const, Instr, IrFunction, Op, Operand, Terminator, VReg,
};
use super::types::JsType;

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Undefined => write!(f, "undefined"),
            Const::Null => write!(f, "null"),
            Const::Bool(b) => write!(f, "{}", b),
            Const::I32(v) => write!(f, "{}i", v),
            Const::F64(v) => {
                if v.is_nan() {
                    write!(f, "nanf")
                } else {
                    write!(f, "{:?}f", v)
                }
            }
            Const::Str(i) => write!(f, "str#{}", i),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Imm(c) => write!(f, "{}", c),
            Operand::Block(b) => write!(f, "{}", b),
        }
    }
}

fn bin_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Mod => "mod",
        BinOp::BitAnd => "and",
        BinOp::BitOr => "or",
        BinOp::BitXor => "xor",
        BinOp::Shl => "shl",
        BinOp::Shr => "shr",
        BinOp::Ushr => "ushr",
    }
}

fn bin_from_name(s: &str) -> Option<BinOp> {
    Some(match s {
        "add" => BinOp::Add,
        "sub" => BinOp::Sub,
        "mul" => BinOp::Mul,
        "div" => BinOp::Div,
        "mod" => BinOp::Mod,
        "and" => BinOp::BitAnd,
        "or" => BinOp::BitOr,
        "xor" => BinOp::BitXor,
        "shl" => BinOp::Shl,
        "shr" => BinOp::Shr,
        "ushr" => BinOp::Ushr,
        _ => return None,
    })
}

fn cmp_name(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::StrictEq => "seq",
        CmpOp::StrictNe => "sne",
        CmpOp::Lt => "lt",
        CmpOp::Le => "le",
        CmpOp::Gt => "gt",
        CmpOp::Ge => "ge",
    }
}

fn cmp_from_name(s: &str) -> Option<CmpOp> {
    Some(match s {
        "eq" => CmpOp::Eq,
        "ne" => CmpOp::Ne,
        "seq" => CmpOp::StrictEq,
        "sne" => CmpOp::StrictNe,
        "lt" => CmpOp::Lt,
        "le" => CmpOp::Le,
        "gt" => CmpOp::Gt,
        "ge" => CmpOp::Ge,
        _ => return None,
    })
}

/// Mnemonic for an operation.
pub fn op_name(op: Op) -> String {
    match op {
        Op::Const => "const".to_string(),
        Op::Move => "move".to_string(),
        Op::Phi => "phi".to_string(),
        Op::Bin(b) => format!("bin.{}", bin_name(b)),
        Op::BinInt(b) => format!("int.{}", bin_name(b)),
        Op::BinFloat(b) => format!("flt.{}", bin_name(b)),
        Op::ConcatStr => "concat".to_string(),
        Op::Neg => "neg".to_string(),
        Op::NegInt => "int.neg".to_string(),
        Op::NegFloat => "flt.neg".to_string(),
        Op::BitNot => "bitnot".to_string(),
        Op::Not => "not".to_string(),
        Op::Fma => "fma".to_string(),
        Op::Cmp(c) => format!("cmp.{}", cmp_name(c)),
        Op::CmpInt(c) => format!("icmp.{}", cmp_name(c)),
        Op::CmpFloat(c) => format!("fcmp.{}", cmp_name(c)),
        Op::CmpStr(c) => format!("scmp.{}", cmp_name(c)),
        Op::ToNumber => "tonumber".to_string(),
        Op::ToString => "tostring".to_string(),
        Op::ToBoolean => "tobool".to_string(),
        Op::ToInt32 => "toint32".to_string(),
        Op::Int32ToDouble => "i2d".to_string(),
        Op::DoubleToInt32 => "d2i".to_string(),
        Op::TypeOf => "typeof".to_string(),
        Op::InstanceOf => "instanceof".to_string(),
        Op::In => "in".to_string(),
        Op::GuardInt => "guard.int".to_string(),
        Op::GuardFloat => "guard.float".to_string(),
        Op::GuardString => "guard.str".to_string(),
        Op::LoadLocal => "load_local".to_string(),
        Op::StoreLocal => "store_local".to_string(),
        Op::LoadArg => "load_arg".to_string(),
        Op::StoreArg => "store_arg".to_string(),
        Op::LoadGlobal => "load_global".to_string(),
        Op::StoreGlobal => "store_global".to_string(),
        Op::GetProp => "get_prop".to_string(),
        Op::SetProp => "set_prop".to_string(),
        Op::DelProp => "del_prop".to_string(),
        Op::GetElem => "get_elem".to_string(),
        Op::SetElem => "set_elem".to_string(),
        Op::DelElem => "del_elem".to_string(),
        Op::GetElemOffset => "get_elem_off".to_string(),
        Op::NewObject => "new_object".to_string(),
        Op::NewArray => "new_array".to_string(),
        Op::Call => "call".to_string(),
        Op::VecWidth => "vwidth".to_string(),
        Op::VecLoad => "vload".to_string(),
        Op::VecStore => "vstore".to_string(),
        Op::VecBin(b) => format!("v.{}", bin_name(b)),
        Op::VecFma => "vfma".to_string(),
        Op::VecReduceSum => "vredsum".to_string(),
        Op::Safepoint => "safepoint".to_string(),
    }
}

fn op_from_name(s: &str) -> Option<Op> {
    if let Some(rest) = s.strip_prefix("bin.") {
        return bin_from_name(rest).map(Op::Bin);
    }
    if let Some(rest) = s.strip_prefix("int.") {
        if rest == "neg" {
            return Some(Op::NegInt);
        }
        return bin_from_name(rest).map(Op::BinInt);
    }
    if let Some(rest) = s.strip_prefix("flt.") {
        if rest == "neg" {
            return Some(Op::NegFloat);
        }
        return bin_from_name(rest).map(Op::BinFloat);
    }
    if let Some(rest) = s.strip_prefix("cmp.") {
        return cmp_from_name(rest).map(Op::Cmp);
    }
    if let Some(rest) = s.strip_prefix("icmp.") {
        return cmp_from_name(rest).map(Op::CmpInt);
    }
    if let Some(rest) = s.strip_prefix("fcmp.") {
        return cmp_from_name(rest).map(Op::CmpFloat);
    }
    if let Some(rest) = s.strip_prefix("scmp.") {
        return cmp_from_name(rest).map(Op::CmpStr);
    }
    Some(match s {
        "const" => Op::Const,
        "move" => Op::Move,
        "phi" => Op::Phi,
        "concat" => Op::ConcatStr,
        "neg" => Op::Neg,
        "bitnot" => Op::BitNot,
        "not" => Op::Not,
        "fma" => Op::Fma,
        "tonumber" => Op::ToNumber,
        "tostring" => Op::ToString,
        "tobool" => Op::ToBoolean,
        "toint32" => Op::ToInt32,
        "i2d" => Op::Int32ToDouble,
        "d2i" => Op::DoubleToInt32,
        "typeof" => Op::TypeOf,
        _ => return None,
    })
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function f{} params={} locals={} {{",
            self.func_index, self.param_count, self.local_count
        )?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.id)?;
            for instr in &block.instrs {
                write!(f, "  ")?;
                if let Some(d) = instr.dest {
                    write!(f, "{} = ", d)?;
                }
                write!(f, "{}", op_name(instr.op))?;
                for (i, arg) in instr.args.iter().enumerate() {
                    write!(f, "{} {}", if i == 0 { "" } else { "," }, arg)?;
                }
                writeln!(f)?;
            }
            match &block.term {
                Terminator::Jump(t) => writeln!(f, "  jump {}", t)?,
                Terminator::Branch { cond, then_block, else_block } => {
                    writeln!(f, "  branch {}, {}, {}", cond, then_block, else_block)?
                }
                Terminator::Return(Some(v)) => writeln!(f, "  ret {}", v)?,
                Terminator::Return(None) => writeln!(f, "  ret")?,
                Terminator::Throw(v) => writeln!(f, "  throw {}", v)?,
                Terminator::Deopt { reason, bc } => {
                    writeln!(f, "  deopt {:?} @{}", reason, bc)?
                }
                Terminator::None => writeln!(f, "  <none>")?,
            }
        }
        writeln!(f, "}}")
    }
}

/// Errors from parsing dumped IR.
#[derive(Debug, Error)]
pub enum ParseIrError {
    /// Header line missing or malformed
    #[error("malformed function header")]
    BadHeader,
    /// Unparseable line
    #[error("cannot parse line: {0}")]
    BadLine(String),
    /// Unknown mnemonic
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    /// Bad operand token
    #[error("cannot parse operand '{0}'")]
    BadOperand(String),
}

fn parse_operand(tok: &str) -> Result<Operand, ParseIrError> {
    let tok = tok.trim().trim_end_matches(',');
    if let Some(n) = tok.strip_prefix('v') {
        if let Ok(i) = n.parse::<u32>() {
            return Ok(Operand::Reg(VReg(i)));
        }
    }
    if let Some(n) = tok.strip_prefix('b') {
        if let Ok(i) = n.parse::<u32>() {
            return Ok(Operand::Block(BlockId(i)));
        }
    }
    if tok == "undefined" {
        return Ok(Operand::Imm(Const::Undefined));
    }
    if tok == "null" {
        return Ok(Operand::Imm(Const::Null));
    }
    if tok == "true" {
        return Ok(Operand::Imm(Const::Bool(true)));
    }
    if tok == "false" {
        return Ok(Operand::Imm(Const::Bool(false)));
    }
    if tok == "nanf" {
        return Ok(Operand::Imm(Const::F64(f64::NAN)));
    }
    if let Some(n) = tok.strip_prefix("str#") {
        if let Ok(i) = n.parse::<u32>() {
            return Ok(Operand::Imm(Const::Str(i)));
        }
    }
    if let Some(n) = tok.strip_suffix('i') {
        if let Ok(v) = n.parse::<i32>() {
            return Ok(Operand::Imm(Const::I32(v)));
        }
    }
    if let Some(n) = tok.strip_suffix('f') {
        if let Ok(v) = n.parse::<f64>() {
            return Ok(Operand::Imm(Const::F64(v)));
        }
    }
    Err(ParseIrError::BadOperand(tok.to_string()))
}

/// Parse a dumped pure-IR function back into an [`IrFunction`].
pub fn parse_ir(text: &str) -> Result<IrFunction, ParseIrError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines.next().ok_or(ParseIrError::BadHeader)?;
    if !header.starts_with("function ") {
        return Err(ParseIrError::BadHeader);
    }
    let mut func_index = 0u32;
    let mut params = 0u32;
    let mut locals = 0u32;
    for tok in header.split_whitespace() {
        if let Some(n) = tok.strip_prefix('f') {
            if let Ok(i) = n.parse::<u32>() {
                func_index = i;
            }
        }
        if let Some(n) = tok.strip_prefix("params=") {
            params = n.parse().map_err(|_| ParseIrError::BadHeader)?;
        }
        if let Some(n) = tok.strip_prefix("locals=") {
            locals = n.parse().map_err(|_| ParseIrError::BadHeader)?;
        }
    }

    let mut func = IrFunction::new(func_index, params, locals);
    let mut current: Option<BlockId> = None;
    let mut max_reg = 0u32;

    for line in lines {
        if line == "}" {
            break;
        }
        if let Some(name) = line.strip_suffix(':') {
            let n: u32 = name
                .strip_prefix('b')
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ParseIrError::BadLine(line.to_string()))?;
            while func.blocks.len() <= n as usize {
                func.add_block(0);
            }
            current = Some(BlockId(n));
            continue;
        }
        let bid = current.ok_or_else(|| ParseIrError::BadLine(line.to_string()))?;

        // Terminators
        if let Some(rest) = line.strip_prefix("jump ") {
            let t = parse_operand(rest)?;
            if let Operand::Block(b) = t {
                func.block_mut(bid).term = Terminator::Jump(b);
                continue;
            }
            return Err(ParseIrError::BadOperand(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix("branch ") {
            let toks: Vec<&str> = rest.split(',').map(str::trim).collect();
            if toks.len() != 3 {
                return Err(ParseIrError::BadLine(line.to_string()));
            }
            let cond = parse_operand(toks[0])?;
            let (t, e) = match (parse_operand(toks[1])?, parse_operand(toks[2])?) {
                (Operand::Block(t), Operand::Block(e)) => (t, e),
                _ => return Err(ParseIrError::BadLine(line.to_string())),
            };
            func.block_mut(bid).term = Terminator::Branch { cond, then_block: t, else_block: e };
            continue;
        }
        if line == "ret" {
            func.block_mut(bid).term = Terminator::Return(None);
            continue;
        }
        if let Some(rest) = line.strip_prefix("ret ") {
            func.block_mut(bid).term = Terminator::Return(Some(parse_operand(rest)?));
            continue;
        }
        if let Some(rest) = line.strip_prefix("throw ") {
            func.block_mut(bid).term = Terminator::Throw(parse_operand(rest)?);
            continue;
        }

        // Instruction: [dest =] op args
        let (dest, rest) = match line.split_once('=') {
            Some((d, r)) if d.trim().starts_with('v') => {
                let reg: u32 = d
                    .trim()
                    .strip_prefix('v')
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ParseIrError::BadLine(line.to_string()))?;
                max_reg = max_reg.max(reg + 1);
                (Some(VReg(reg)), r.trim())
            }
            _ => (None, line),
        };
        let mut parts = rest.splitn(2, ' ');
        let opname = parts.next().unwrap_or_default();
        let op = op_from_name(opname).ok_or_else(|| ParseIrError::UnknownOp(opname.to_string()))?;
        let args = match parts.next() {
            Some(argstr) => argstr
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_operand)
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };
        for arg in &args {
            if let Operand::Reg(r) = arg {
                max_reg = max_reg.max(r.0 + 1);
            }
        }
        func.block_mut(bid)
            .instrs
            .push(Instr { op, dest, args, bc: 0 });
        if let Some(d) = dest {
            func.reg_types.insert(d, JsType::Unknown);
        }
    }
    func.next_reg = max_reg;
    func.recompute_preds();
    Ok(func)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pure_function() -> IrFunction {
        let mut f = IrFunction::new(3, 1, 0);
        let b0 = f.add_block(0);
        let b1 = f.add_block(4);
        let b2 = f.add_block(7);
        let v0 = f.alloc_reg(JsType::Int32);
        let v1 = f.alloc_reg(JsType::Float64);
        let v2 = f.alloc_reg(JsType::Float64);
        let v3 = f.alloc_reg(JsType::Boolean);
        f.block_mut(b0).instrs = vec![
            Instr { op: Op::Const, dest: Some(v0), args: vec![Operand::Imm(Const::I32(41))], bc: 0 },
            Instr { op: Op::Int32ToDouble, dest: Some(v1), args: vec![Operand::Reg(v0)], bc: 1 },
            Instr {
                op: Op::BinFloat(BinOp::Add),
                dest: Some(v2),
                args: vec![Operand::Reg(v1), Operand::Imm(Const::F64(1.5))],
                bc: 2,
            },
            Instr {
                op: Op::CmpFloat(CmpOp::Lt),
                dest: Some(v3),
                args: vec![Operand::Reg(v2), Operand::Imm(Const::F64(100.0))],
                bc: 3,
            },
        ];
        f.block_mut(b0).term =
            Terminator::Branch { cond: Operand::Reg(v3), then_block: b1, else_block: b2 };
        f.block_mut(b1).term = Terminator::Return(Some(Operand::Reg(v2)));
        f.block_mut(b2).term = Terminator::Return(Some(Operand::Imm(Const::F64(0.0))));
        f.recompute_preds();
        f
    }

    #[test]
    fn test_dump_parse_roundtrip() {
        let f = sample_pure_function();
        let text = f.to_string();
        let parsed = parse_ir(&text).unwrap();

        assert_eq!(parsed.func_index, f.func_index);
        assert_eq!(parsed.param_count, f.param_count);
        assert_eq!(parsed.blocks.len(), f.blocks.len());
        for (a, b) in parsed.blocks.iter().zip(f.blocks.iter()) {
            assert_eq!(a.instrs.len(), b.instrs.len());
            for (x, y) in a.instrs.iter().zip(b.instrs.iter()) {
                assert_eq!(x.op, y.op);
                assert_eq!(x.dest, y.dest);
                assert_eq!(x.args, y.args);
            }
            assert_eq!(a.term, b.term);
        }
    }

    #[test]
    fn test_second_roundtrip_is_identity() {
        let f = sample_pure_function();
        let once = parse_ir(&f.to_string()).unwrap();
        let twice = parse_ir(&once.to_string()).unwrap();
        assert_eq!(once.to_string(), twice.to_string());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_ir("nonsense").is_err());
        assert!(parse_ir("function f0 params=0 locals=0 {\nb0:\n  v0 = frobnicate\n}").is_err());
    }
}
