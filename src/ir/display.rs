use std::fmt;

use super::*;

/// Prints a value the way the race dump refers to it:
/// instructions in full, everything else by reference.
pub struct ValueDisplay<'a> {
    procedure: &'a Procedure,
    id: ValueId,
}

impl<'a> ValueDisplay<'a> {
    pub(super) fn new(procedure: &'a Procedure, id: ValueId) -> Self {
        Self { procedure, id }
    }
}

fn write_ref(procedure: &Procedure, id: ValueId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = procedure.value(id);
    match (&value.kind, &value.name) {
        (ValueKind::Global(_), Some(name)) | (ValueKind::Function(_), Some(name)) => {
            write!(f, "@{}", name)
        }
        (ValueKind::Constant(constant), _) => match constant {
            Constant::Null => write!(f, "null"),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{}", x),
            Constant::Undef => write!(f, "undef"),
            Constant::BlockAddress => write!(f, "blockaddress"),
            Constant::Data => write!(f, "constant-data"),
            Constant::TokenNone => write!(f, "none"),
            Constant::Expr { operands } => {
                write!(f, "constexpr(")?;
                for (idx, op) in operands.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write_ref(procedure, *op, f)?;
                }
                write!(f, ")")
            }
        },
        (_, Some(name)) => write!(f, "%{}", name),
        (ValueKind::Global(_), None) | (ValueKind::Function(_), None) => write!(f, "@{}", id.0),
        (_, None) => write!(f, "%{}", id.0),
    }
}

fn write_operands(
    procedure: &Procedure,
    ops: &[ValueId],
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    for (idx, op) in ops.iter().enumerate() {
        write!(f, "{}", if idx == 0 { " " } else { ", " })?;
        write_ref(procedure, *op, f)?;
    }
    Ok(())
}

impl<'a> fmt::Display for ValueDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inst = match self.procedure.inst(self.id) {
            Some(inst) => inst,
            None => return write_ref(self.procedure, self.id, f),
        };
        if inst.ty != Type::Void {
            write_ref(self.procedure, self.id, f)?;
            write!(f, " = ")?;
        }
        let opcode = match &inst.kind {
            InstKind::Alloca { .. } => "alloca",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::AtomicRmw { .. } => "atomicrmw",
            InstKind::CmpXchg { .. } => "cmpxchg",
            InstKind::VaArg { .. } => "va_arg",
            InstKind::MemSet { .. } => "memset",
            InstKind::MemTransfer { .. } => "memcpy",
            InstKind::Call { .. } => "call",
            InstKind::Gep { .. } => "getelementptr",
            InstKind::Cast { .. } => "bitcast",
            InstKind::PtrToInt { .. } => "ptrtoint",
            InstKind::IntToPtr { .. } => "inttoptr",
            InstKind::Phi { .. } => "phi",
            InstKind::Select { .. } => "select",
            InstKind::Other { .. } => "op",
        };
        write!(f, "{}", opcode)?;
        if let InstKind::Call { callee, args } = &inst.kind {
            write!(f, " ")?;
            write_ref(self.procedure, *callee, f)?;
            write!(f, "(")?;
            for (idx, arg) in args.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write_ref(self.procedure, *arg, f)?;
            }
            return write!(f, ")");
        }
        write_operands(self.procedure, &inst.operands(), f)
    }
}
