//! Pretty-printing for the JIT IR
//!
//! Dump output for debugging promotion decisions: method dumps print each
//! block's statements as indented trees, one node per line, operands
//! before users.

use std::fmt;

use super::ir::{BinOp, BlockId, LocalId, MethodIr, NodeFlags, NodeId, NodeKind, PrimType};

impl fmt::Display for PrimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrimType::I8 => "i8",
            PrimType::U8 => "u8",
            PrimType::I16 => "i16",
            PrimType::U16 => "u16",
            PrimType::I32 => "i32",
            PrimType::I64 => "i64",
            PrimType::F32 => "f32",
            PrimType::F64 => "f64",
            PrimType::Ref => "ref",
            PrimType::Simd16 => "simd16",
        };
        write!(f, "{name}")
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:02}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BB{:02}", self.0)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
        };
        write!(f, "{name}")
    }
}

fn fmt_node(ir: &MethodIr, id: NodeId, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for op in ir.operands(id) {
        fmt_node(ir, op, depth + 1, f)?;
    }

    write!(f, "    {:indent$}", "", indent = depth * 2)?;
    match &ir.node(id).kind {
        NodeKind::IntConst { value, ty } => write!(f, "const.{ty} {value}")?,
        NodeKind::PatternConst { ty, pattern } => write!(f, "pattern.{ty} {pattern:#04x}")?,
        NodeKind::LocalRead { local, offset, ty } => write!(f, "load.{ty} {local}[+{offset}]")?,
        NodeKind::LocalStore { local, offset, ty, .. } => {
            write!(f, "store.{ty} {local}[+{offset}]")?
        }
        NodeKind::StructRead { local, offset, layout } => {
            write!(f, "load.struct {local}[+{offset}] (layout {})", layout.0)?
        }
        NodeKind::StructStore { local, offset, layout, .. } => {
            write!(f, "store.struct {local}[+{offset}] (layout {})", layout.0)?
        }
        NodeKind::LocalAddr { local } => write!(f, "addr {local}")?,
        NodeKind::IndirRead { ty, offset, .. } => write!(f, "ind.load.{ty} [+{offset}]")?,
        NodeKind::IndirStore { ty, offset, .. } => write!(f, "ind.store.{ty} [+{offset}]")?,
        NodeKind::BlkRead { layout, .. } => write!(f, "blk.load (layout {})", layout.0)?,
        NodeKind::BlkStore { layout, .. } => write!(f, "blk.store (layout {})", layout.0)?,
        NodeKind::InitPattern { pattern } => write!(f, "init {pattern:#04x}")?,
        NodeKind::Binary { op, ty, .. } => write!(f, "{op}.{ty}")?,
        NodeKind::Call { args, ret_buf, .. } => {
            write!(f, "call ({} args", args.len())?;
            if ret_buf.is_some() {
                write!(f, ", retbuf")?;
            }
            write!(f, ")")?
        }
        NodeKind::Select { .. } => write!(f, "select")?,
        NodeKind::Return { value } => {
            write!(f, "return{}", if value.is_some() { "" } else { " void" })?
        }
        NodeKind::Comma { .. } => write!(f, "comma")?,
        NodeKind::Nop => write!(f, "nop")?,
    }
    if ir.node(id).flags.contains(NodeFlags::VAR_DEATH) {
        write!(f, " (last use)")?;
    }
    writeln!(f)
}

impl fmt::Display for MethodIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "method {:#x} (locals: {}, blocks: {}) {{",
            self.method_hash,
            self.locals.len(),
            self.blocks.len()
        )?;

        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "  {} (weight {}):", BlockId(i as u32), block.weight)?;
            if !block.successors.is_empty() {
                write!(f, "    ; succs:")?;
                for succ in &block.successors {
                    write!(f, " {succ}")?;
                }
                writeln!(f)?;
            }
            for stmt in &block.statements {
                fmt_node(self, stmt.root, 0, f)?;
            }
        }

        writeln!(f, "}}")
    }
}
