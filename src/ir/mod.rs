//! A small arena IR for one fork-join procedure.
//! Values (arguments, globals, function symbols, constants and instructions)
//! live in one arena and are referred to by `ValueId`.
//! Blocks end in a `Terminator`, which carries the parallel-control markers
//! `Detach`, `Reattach` and `Sync` together with their sync region.
//! The detector only reads the IR; it is built with `ProcedureBuilder`
//! or deserialized from the driver's input.
use std::collections::VecDeque;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod builder;
mod display;

pub use builder::ProcedureBuilder;
pub use display::ValueDisplay;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The token shared by a detach, its reattaches and the syncs that wait for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncRegion(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Ptr,
    Int,
    Float,
    Void,
    Other,
}

/// Parameter attributes that matter for races with the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgAttrs {
    pub byval: bool,
    pub sret: bool,
    pub inalloca: bool,
    pub noalias: bool,
    pub readonly: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Argument {
    pub index: usize,
    pub ty: Type,
    #[serde(default)]
    pub attrs: ArgAttrs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    External,
    Internal,
    Private,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalVariable {
    #[serde(default)]
    pub constant: bool,
    pub linkage: Linkage,
    #[serde(default)]
    pub thread_local: bool,
    /// Name of the struct type of the global, if it has one.
    #[serde(default)]
    pub value_type: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocFnKind {
    Alloc,
    Realloc,
    Free,
}

/// Intrinsics the access classifier knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intrinsic {
    DbgInfo,
    DetachedRethrow,
    TaskframeResume,
    SyncUnwind,
    Annotation,
    Assume,
    InvariantStart,
    InvariantEnd,
    LaunderInvariantGroup,
    StripInvariantGroup,
    LifetimeStart,
    LifetimeEnd,
    PtrAnnotation,
    VarAnnotation,
    NoaliasScopeDecl,
    SyncregionStart,
    TaskframeCreate,
    TaskframeUse,
    TaskframeEnd,
    TaskframeLoadGuard,
    ThreadlocalAddress,
    /// Any other intrinsic; `accesses_memory` is false for `readnone` ones.
    Other { accesses_memory: bool },
}

/// A function symbol, used as the callee operand of calls.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionDecl {
    /// Recognized as a library function of the target.
    pub library: bool,
    pub noreturn: bool,
    pub alloc: Option<AllocFnKind>,
    pub intrinsic: Option<Intrinsic>,
    pub return_noalias: bool,
    /// Parameter indices marked `nocapture`.
    pub nocapture_params: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Null,
    Int(i64),
    Float(f64),
    Undef,
    BlockAddress,
    Data,
    TokenNone,
    /// A constant expression that could not be folded to a global.
    Expr { operands: Vec<ValueId> },
}

impl Constant {
    /// Constants that can never denote an address.
    pub fn is_non_address(&self) -> bool {
        !matches!(self, Constant::Expr { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstKind {
    Alloca {
        #[serde(default)]
        allocated_type: Option<String>,
    },
    Load {
        ptr: ValueId,
        #[serde(default)]
        size: Option<u64>,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
        #[serde(default)]
        size: Option<u64>,
    },
    AtomicRmw { ptr: ValueId, value: ValueId },
    CmpXchg {
        ptr: ValueId,
        cmp: ValueId,
        new: ValueId,
    },
    VaArg { list: ValueId },
    MemSet {
        dest: ValueId,
        value: ValueId,
        #[serde(default)]
        len: Option<u64>,
    },
    MemTransfer {
        dest: ValueId,
        src: ValueId,
        #[serde(default)]
        len: Option<u64>,
    },
    Call { callee: ValueId, args: Vec<ValueId> },
    Gep {
        base: ValueId,
        #[serde(default)]
        inbounds: bool,
    },
    Cast { operand: ValueId },
    PtrToInt { operand: ValueId },
    IntToPtr { operand: ValueId },
    Phi { incoming: Vec<ValueId> },
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    Other { operands: Vec<ValueId> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instruction {
    pub block: BlockId,
    pub ty: Type,
    pub kind: InstKind,
}

impl Instruction {
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        match &self.kind {
            InstKind::Alloca { .. } => SmallVec::new(),
            InstKind::Load { ptr, .. } => SmallVec::from_slice(&[*ptr]),
            InstKind::Store { value, ptr, .. } => SmallVec::from_slice(&[*value, *ptr]),
            InstKind::AtomicRmw { ptr, value } => SmallVec::from_slice(&[*ptr, *value]),
            InstKind::CmpXchg { ptr, cmp, new } => SmallVec::from_slice(&[*ptr, *cmp, *new]),
            InstKind::VaArg { list } => SmallVec::from_slice(&[*list]),
            InstKind::MemSet { dest, value, .. } => SmallVec::from_slice(&[*dest, *value]),
            InstKind::MemTransfer { dest, src, .. } => SmallVec::from_slice(&[*dest, *src]),
            InstKind::Call { callee, args } => {
                let mut ops = SmallVec::from_slice(args);
                ops.push(*callee);
                ops
            }
            InstKind::Gep { base, .. } => SmallVec::from_slice(&[*base]),
            InstKind::Cast { operand }
            | InstKind::PtrToInt { operand }
            | InstKind::IntToPtr { operand } => SmallVec::from_slice(&[*operand]),
            InstKind::Phi { incoming } => SmallVec::from_slice(incoming),
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => SmallVec::from_slice(&[*cond, *on_true, *on_false]),
            InstKind::Other { operands } => SmallVec::from_slice(operands),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, InstKind::Call { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Argument(Argument),
    Global(GlobalVariable),
    Function(FunctionDecl),
    Constant(Constant),
    Instruction(Instruction),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Value {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: ValueKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Terminator {
    Br { targets: Vec<BlockId> },
    Ret {
        #[serde(default)]
        value: Option<ValueId>,
    },
    Unreachable,
    Detach {
        region: SyncRegion,
        detached: BlockId,
        continuation: BlockId,
    },
    Reattach {
        region: SyncRegion,
        continuation: BlockId,
    },
    Sync { region: SyncRegion, target: BlockId },
}

impl Terminator {
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Br { targets } => SmallVec::from_slice(targets),
            Terminator::Ret { .. } | Terminator::Unreachable => SmallVec::new(),
            Terminator::Detach {
                detached,
                continuation,
                ..
            } => SmallVec::from_slice(&[*detached, *continuation]),
            Terminator::Reattach { continuation, .. } => SmallVec::from_slice(&[*continuation]),
            Terminator::Sync { target, .. } => SmallVec::from_slice(&[*target]),
        }
    }

    /// The region waited for, if this is a sync.
    pub fn synced_region(&self) -> Option<SyncRegion> {
        match self {
            Terminator::Sync { region, .. } => Some(*region),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    #[serde(default)]
    pub insts: Vec<ValueId>,
    pub terminator: Terminator,
}

/// The serialized form of a procedure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcedureData {
    pub name: String,
    /// The source module the procedure comes from.
    #[serde(default)]
    pub module: String,
    pub values: Vec<Value>,
    pub blocks: Vec<Block>,
}

/// A procedure plus its def-use index.
#[derive(Debug, Deserialize)]
#[serde(from = "ProcedureData")]
pub struct Procedure {
    data: ProcedureData,
    users: FxHashMap<ValueId, SmallVec<[ValueId; 4]>>,
    positions: FxHashMap<ValueId, usize>,
}

impl From<ProcedureData> for Procedure {
    fn from(data: ProcedureData) -> Self {
        let mut users: FxHashMap<ValueId, SmallVec<[ValueId; 4]>> = FxHashMap::default();
        let mut positions = FxHashMap::default();
        for block in &data.blocks {
            for (pos, id) in block.insts.iter().enumerate() {
                positions.insert(*id, pos);
                if let ValueKind::Instruction(inst) = &data.values[id.index()].kind {
                    for op in inst.operands() {
                        let entry = users.entry(op).or_default();
                        if !entry.contains(id) {
                            entry.push(*id);
                        }
                    }
                }
            }
        }
        Self {
            data,
            users,
            positions,
        }
    }
}

impl Procedure {
    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn module(&self) -> &str {
        &self.data.module
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.data.values[id.index()]
    }

    pub fn value_name(&self, id: ValueId) -> Option<&str> {
        self.value(id).name.as_deref()
    }

    pub fn num_values(&self) -> usize {
        self.data.values.len()
    }

    pub fn inst(&self, id: ValueId) -> Option<&Instruction> {
        match &self.value(id).kind {
            ValueKind::Instruction(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn argument(&self, id: ValueId) -> Option<&Argument> {
        match &self.value(id).kind {
            ValueKind::Argument(arg) => Some(arg),
            _ => None,
        }
    }

    pub fn global(&self, id: ValueId) -> Option<&GlobalVariable> {
        match &self.value(id).kind {
            ValueKind::Global(global) => Some(global),
            _ => None,
        }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.data.blocks[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.data.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.data
            .blocks
            .iter()
            .enumerate()
            .map(|(idx, block)| (BlockId(idx as u32), block))
    }

    /// All instructions in block order.
    pub fn instructions(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.data
            .blocks
            .iter()
            .flat_map(|block| block.insts.iter().copied())
    }

    /// Arguments in parameter order.
    pub fn arguments(&self) -> Vec<ValueId> {
        let mut args = (0..self.data.values.len())
            .map(|idx| ValueId(idx as u32))
            .filter_map(|id| self.argument(id).map(|arg| (arg.index, id)))
            .collect::<Vec<_>>();
        args.sort();
        args.into_iter().map(|(_, id)| id).collect()
    }

    /// The instructions that use `id` as an operand.
    pub fn users(&self, id: ValueId) -> &[ValueId] {
        self.users.get(&id).map(|u| u.as_slice()).unwrap_or(&[])
    }

    pub fn parent_block(&self, inst: ValueId) -> Option<BlockId> {
        self.inst(inst).map(|i| i.block)
    }

    pub fn is_pointer(&self, id: ValueId) -> bool {
        match &self.value(id).kind {
            ValueKind::Argument(arg) => arg.ty == Type::Ptr,
            ValueKind::Global(_) | ValueKind::Function(_) => true,
            ValueKind::Constant(Constant::Null) => true,
            ValueKind::Constant(_) => false,
            ValueKind::Instruction(inst) => inst.ty == Type::Ptr,
        }
    }

    /// The direct callee of a call, if any.
    pub fn called_function(&self, call: ValueId) -> Option<(ValueId, &FunctionDecl)> {
        let callee = match self.inst(call).map(|i| &i.kind) {
            Some(InstKind::Call { callee, .. }) => *callee,
            _ => return None,
        };
        match &self.value(callee).kind {
            ValueKind::Function(decl) => Some((callee, decl)),
            _ => None,
        }
    }

    pub fn intrinsic(&self, call: ValueId) -> Option<Intrinsic> {
        self.called_function(call).and_then(|(_, decl)| decl.intrinsic)
    }

    pub fn call_args(&self, call: ValueId) -> &[ValueId] {
        match self.inst(call).map(|i| &i.kind) {
            Some(InstKind::Call { args, .. }) => args,
            _ => &[],
        }
    }

    pub fn terminator(&self, block: BlockId) -> &Terminator {
        &self.block(block).terminator
    }

    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        self.terminator(block).successors()
    }

    /// Whether `to` may execute after `from` on some CFG path.
    pub fn is_potentially_reachable(&self, from: ValueId, to: ValueId) -> bool {
        let (from_block, to_block) = match (self.parent_block(from), self.parent_block(to)) {
            (Some(f), Some(t)) => (f, t),
            _ => return true,
        };
        if from_block == to_block && self.positions.get(&from) < self.positions.get(&to) {
            return true;
        }
        // Otherwise `to_block` must be reached again through a successor of `from_block`.
        let mut worklist = VecDeque::from_iter(self.successors(from_block));
        let mut visited = FxHashSet::default();
        while let Some(block) = worklist.pop_front() {
            if block == to_block {
                return true;
            }
            if !visited.insert(block) {
                continue;
            }
            worklist.extend(self.successors(block));
        }
        false
    }

    pub fn display(&self, id: ValueId) -> ValueDisplay<'_> {
        ValueDisplay::new(self, id)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "procedure {}:", self.name())?;
        for (_, block) in self.blocks() {
            writeln!(f, "{}:", block.name)?;
            for inst in &block.insts {
                writeln!(f, "  {}", self.display(*inst))?;
            }
            writeln!(f, "  {:?}", block.terminator)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_users_and_reachability() {
        let mut builder = ProcedureBuilder::new("f");
        let entry = builder.block("entry");
        let body = builder.block("body");
        let exit = builder.block("exit");
        let x = builder.alloca(entry, "x");
        let p = builder.gep(entry, x, true);
        let v = builder.constant(Constant::Int(1));
        let s1 = builder.store(body, v, p);
        let l1 = builder.load(exit, p);
        builder.terminate(
            entry,
            Terminator::Br {
                targets: vec![body],
            },
        );
        builder.terminate(
            body,
            Terminator::Br {
                targets: vec![body, exit],
            },
        );
        builder.terminate(exit, Terminator::Ret { value: None });
        let procedure = builder.finish();

        assert_eq!(procedure.users(x), &[p]);
        assert_eq!(procedure.users(p), &[s1, l1]);
        assert!(procedure.is_potentially_reachable(p, s1));
        assert!(procedure.is_potentially_reachable(s1, l1));
        // `body` loops on itself.
        assert!(procedure.is_potentially_reachable(s1, s1));
        assert!(!procedure.is_potentially_reachable(l1, s1));
        assert!(!procedure.is_potentially_reachable(s1, p));
    }

    #[test]
    fn test_deserialize_procedure() {
        let json = r#"{
            "name": "g",
            "values": [
                {"name": "p", "kind": {"argument": {"index": 0, "ty": "ptr"}}},
                {"kind": {"constant": {"int": 3}}},
                {"kind": {"instruction": {"block": 0, "ty": "void",
                    "kind": {"op": "store", "value": 1, "ptr": 0}}}}
            ],
            "blocks": [
                {"name": "entry", "insts": [2], "terminator": {"op": "ret"}}
            ]
        }"#;
        let procedure: Procedure = serde_json::from_str(json).unwrap();
        assert_eq!(procedure.name(), "g");
        assert_eq!(procedure.arguments(), vec![ValueId(0)]);
        assert_eq!(procedure.users(ValueId(0)), &[ValueId(2)]);
        assert!(procedure.is_pointer(ValueId(0)));
    }
}
