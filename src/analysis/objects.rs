//! Underlying objects of pointers and capture queries.
//! An underlying object is the allocation, argument or global an address
//! expression is derived from, found by walking back through casts and GEPs
//! (and, for the multi-object query, phis and selects).
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::loops::LoopInfo;
use crate::ir::{Constant, InstKind, Intrinsic, Procedure, ValueId, ValueKind};

/// Bound on the number of casts and GEPs stripped by `underlying_object`.
pub const MAX_LOOKUP: usize = 6;

/// The single underlying object of `ptr`.
pub fn underlying_object(procedure: &Procedure, ptr: ValueId) -> ValueId {
    let mut curr = ptr;
    for _ in 0..MAX_LOOKUP {
        match procedure.inst(curr).map(|i| &i.kind) {
            Some(InstKind::Cast { operand }) => curr = *operand,
            Some(InstKind::Gep { base, .. }) => curr = *base,
            Some(InstKind::Call { args, .. }) if returns_argument(procedure, curr) => {
                match args.first() {
                    Some(arg) => curr = *arg,
                    None => break,
                }
            }
            _ => break,
        }
    }
    curr
}

/// Calls returning a pointer aliasing their first argument.
fn returns_argument(procedure: &Procedure, call: ValueId) -> bool {
    matches!(
        procedure.intrinsic(call),
        Some(Intrinsic::LaunderInvariantGroup) | Some(Intrinsic::StripInvariantGroup)
    )
}

/// All underlying objects of `ptr`, looking through phis and selects.
/// A phi in a loop header whose inputs do not share one object is an object itself.
pub fn underlying_objects(
    procedure: &Procedure,
    ptr: ValueId,
    loops: &LoopInfo,
) -> SmallVec<[ValueId; 4]> {
    let mut objects = SmallVec::new();
    let mut visited = FxHashSet::default();
    let mut worklist = vec![ptr];
    while let Some(v) = worklist.pop() {
        let obj = underlying_object(procedure, v);
        if !visited.insert(obj) {
            continue;
        }
        match procedure.inst(obj) {
            Some(inst) => match &inst.kind {
                InstKind::Select {
                    on_true, on_false, ..
                } => {
                    worklist.push(*on_false);
                    worklist.push(*on_true);
                }
                InstKind::Phi { incoming } => {
                    let in_header = loops.loop_with_header(inst.block).is_some();
                    if in_header && !same_object_in_loop(procedure, incoming) {
                        objects.push(obj);
                    } else {
                        worklist.extend(incoming.iter().rev().copied());
                    }
                }
                _ => objects.push(obj),
            },
            None => objects.push(obj),
        }
    }
    objects
}

fn same_object_in_loop(procedure: &Procedure, incoming: &[ValueId]) -> bool {
    let mut objs = incoming.iter().map(|v| underlying_object(procedure, *v));
    match objs.next() {
        Some(first) => objs.all(|o| o == first),
        None => true,
    }
}

/// Strip casts and in-bounds GEPs.
pub fn strip_in_bounds_offsets(procedure: &Procedure, ptr: ValueId) -> ValueId {
    let mut curr = ptr;
    let mut visited = FxHashSet::default();
    while visited.insert(curr) {
        match procedure.inst(curr).map(|i| &i.kind) {
            Some(InstKind::Cast { operand }) => curr = *operand,
            Some(InstKind::Gep {
                base,
                inbounds: true,
            }) => curr = *base,
            _ => break,
        }
    }
    curr
}

/// A call returning memory not aliased by anything else at the call.
pub fn is_no_alias_call(procedure: &Procedure, v: ValueId) -> bool {
    procedure
        .called_function(v)
        .map_or(false, |(_, decl)| decl.return_noalias)
}

/// Allocas, globals, no-alias calls and no-alias or byval arguments.
pub fn is_identified_object(procedure: &Procedure, v: ValueId) -> bool {
    match &procedure.value(v).kind {
        ValueKind::Global(_) | ValueKind::Function(_) => true,
        ValueKind::Argument(arg) => arg.attrs.noalias || arg.attrs.byval,
        ValueKind::Instruction(inst) => match inst.kind {
            InstKind::Alloca { .. } => true,
            InstKind::Call { .. } => is_no_alias_call(procedure, v),
            _ => false,
        },
        ValueKind::Constant(_) => false,
    }
}

/// Thread-local globals and results of `threadlocal.address`.
pub fn is_thread_local_object(procedure: &Procedure, v: ValueId) -> bool {
    match &procedure.value(v).kind {
        ValueKind::Global(global) => global.thread_local,
        ValueKind::Instruction(_) => procedure.intrinsic(v) == Some(Intrinsic::ThreadlocalAddress),
        _ => false,
    }
}

pub fn is_null(procedure: &Procedure, v: ValueId) -> bool {
    matches!(procedure.value(v).kind, ValueKind::Constant(Constant::Null))
}

/// Answers whether a pointer may have escaped before an operation.
/// Results are memoized per `(stripped pointer, operation)`.
pub struct CaptureTracker<'a> {
    procedure: &'a Procedure,
    max_uses_to_explore: Option<usize>,
    cache: FxHashMap<(ValueId, ValueId, bool), bool>,
}

impl<'a> CaptureTracker<'a> {
    pub fn new(procedure: &'a Procedure, max_uses_to_explore: Option<usize>) -> Self {
        Self {
            procedure,
            max_uses_to_explore,
            cache: FxHashMap::default(),
        }
    }

    /// Whether `ptr` may be captured by `op` or by an operation that may execute before `op`.
    pub fn pointer_captured_before(&mut self, ptr: ValueId, op: ValueId) -> bool {
        self.query(ptr, op, true)
    }

    /// Like `pointer_captured_before`, but a capture by `op` itself does not count.
    pub fn pointer_captured_strictly_before(&mut self, ptr: ValueId, op: ValueId) -> bool {
        self.query(ptr, op, false)
    }

    fn query(&mut self, ptr: ValueId, op: ValueId, include_op: bool) -> bool {
        let stripped = strip_in_bounds_offsets(self.procedure, ptr);
        if is_null(self.procedure, stripped) {
            return false;
        }
        if let Some(result) = self.cache.get(&(stripped, op, include_op)) {
            return *result;
        }
        let result = match &self.procedure.value(stripped).kind {
            // Globals are assumed captured.
            ValueKind::Global(_) | ValueKind::Function(_) => true,
            ValueKind::Instruction(_) => self.captured_before(stripped, op, include_op),
            _ => true,
        };
        self.cache.insert((stripped, op, include_op), result);
        result
    }

    fn captured_before(&self, ptr: ValueId, op: ValueId, include_op: bool) -> bool {
        let procedure = self.procedure;
        let mut explored = 0;
        let mut visited = FxHashSet::default();
        let mut worklist = vec![ptr];
        visited.insert(ptr);
        while let Some(v) = worklist.pop() {
            for user in procedure.users(v) {
                explored += 1;
                if let Some(max) = self.max_uses_to_explore {
                    if explored > max {
                        return true;
                    }
                }
                match self.classify_use(v, *user) {
                    UseKind::NoCapture => {}
                    UseKind::Follow => {
                        if visited.insert(*user) {
                            worklist.push(*user);
                        }
                    }
                    UseKind::Capture => {
                        let at_op = *user == op;
                        if (at_op && include_op)
                            || (!at_op && procedure.is_potentially_reachable(*user, op))
                        {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    fn classify_use(&self, v: ValueId, user: ValueId) -> UseKind {
        let inst = match self.procedure.inst(user) {
            Some(inst) => inst,
            None => return UseKind::Capture,
        };
        match &inst.kind {
            InstKind::Cast { .. } | InstKind::Gep { .. } | InstKind::Phi { .. } => UseKind::Follow,
            InstKind::Select { cond, .. } => {
                if *cond == v {
                    UseKind::NoCapture
                } else {
                    UseKind::Follow
                }
            }
            InstKind::Load { .. } | InstKind::VaArg { .. } => UseKind::NoCapture,
            InstKind::MemSet { .. } | InstKind::MemTransfer { .. } => UseKind::NoCapture,
            InstKind::Store { value, .. } => {
                if *value == v {
                    UseKind::Capture
                } else {
                    UseKind::NoCapture
                }
            }
            InstKind::AtomicRmw { value, .. } => {
                if *value == v {
                    UseKind::Capture
                } else {
                    UseKind::NoCapture
                }
            }
            InstKind::CmpXchg { cmp, new, .. } => {
                if *cmp == v || *new == v {
                    UseKind::Capture
                } else {
                    UseKind::NoCapture
                }
            }
            InstKind::Call { args, .. } => {
                if returns_argument(self.procedure, user) {
                    return UseKind::Follow;
                }
                let decl = self.procedure.called_function(user).map(|(_, decl)| decl);
                if let Some(intrinsic) = decl.and_then(|d| d.intrinsic) {
                    if intrinsic != Intrinsic::ThreadlocalAddress
                        && !matches!(intrinsic, Intrinsic::Other { .. })
                    {
                        return UseKind::NoCapture;
                    }
                }
                let captured = args.iter().enumerate().any(|(idx, arg)| {
                    *arg == v && !decl.map_or(false, |d| d.nocapture_params.contains(&idx))
                });
                if captured {
                    UseKind::Capture
                } else {
                    UseKind::NoCapture
                }
            }
            InstKind::PtrToInt { .. } => UseKind::Capture,
            InstKind::Alloca { .. } | InstKind::IntToPtr { .. } | InstKind::Other { .. } => {
                UseKind::Capture
            }
        }
    }
}

enum UseKind {
    NoCapture,
    Follow,
    Capture,
}
