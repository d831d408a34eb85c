//! Memory accesses of operations.
//! An operation is retained for race checking by `check_instruction_for_race`;
//! `general_accesses` then splits it into one `GeneralAccess` per location it
//! may touch, plus an opaque access (no location) for calls that may touch
//! memory not reachable from their arguments.
use smallvec::SmallVec;

use super::allocation::{
    is_alloc_fn, is_free_fn, is_instrumentation_fn, is_realloc_fn, is_termination_fn,
};
use crate::analysis::alias::{AliasOracle, MemoryLocation, ModRef};
use crate::config::AnalysisConfig;
use crate::ir::{InstKind, Intrinsic, Procedure, Terminator, ValueId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeneralAccess {
    pub inst: ValueId,
    /// `None` for an opaque access.
    pub loc: Option<LocationKey>,
    /// Operand index for calls and memory transfers.
    pub operand: Option<usize>,
    pub mod_ref: ModRef,
}

/// The ordered, hashable part of a `MemoryLocation`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey {
    pub ptr: ValueId,
    pub size: Option<u64>,
}

impl From<MemoryLocation> for LocationKey {
    fn from(loc: MemoryLocation) -> Self {
        Self {
            ptr: loc.ptr,
            size: loc.size,
        }
    }
}

impl From<LocationKey> for MemoryLocation {
    fn from(key: LocationKey) -> Self {
        MemoryLocation::new(key.ptr, key.size)
    }
}

impl GeneralAccess {
    fn located(
        inst: ValueId,
        loc: MemoryLocation,
        operand: Option<usize>,
        mod_ref: ModRef,
    ) -> Self {
        Self {
            inst,
            loc: Some(loc.into()),
            operand,
            mod_ref,
        }
    }

    fn opaque(inst: ValueId, mod_ref: ModRef) -> Self {
        Self {
            inst,
            loc: None,
            operand: None,
            mod_ref,
        }
    }

    pub fn ptr(&self) -> Option<ValueId> {
        self.loc.map(|loc| loc.ptr)
    }

    pub fn location(&self) -> Option<MemoryLocation> {
        self.loc.map(MemoryLocation::from)
    }

    pub fn is_opaque(&self) -> bool {
        self.loc.is_none()
    }

    pub fn is_mod(&self) -> bool {
        self.mod_ref.is_mod()
    }

    pub fn is_ref(&self) -> bool {
        self.mod_ref.is_ref()
    }
}

/// A pointer together with whether it is written through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemAccessInfo {
    pub ptr: ValueId,
    pub is_mod: bool,
}

impl MemAccessInfo {
    pub fn new(ptr: ValueId, is_mod: bool) -> Self {
        Self { ptr, is_mod }
    }
}

/// Whether `inst` may read or write memory at all.
pub fn may_access_memory<A: AliasOracle>(procedure: &Procedure, inst: ValueId, alias: &A) -> bool {
    match procedure.inst(inst).map(|i| &i.kind) {
        Some(InstKind::Load { .. })
        | Some(InstKind::Store { .. })
        | Some(InstKind::AtomicRmw { .. })
        | Some(InstKind::CmpXchg { .. })
        | Some(InstKind::VaArg { .. })
        | Some(InstKind::MemSet { .. })
        | Some(InstKind::MemTransfer { .. }) => true,
        Some(InstKind::Call { .. }) => !alias.memory_effects(inst).does_not_access_memory(),
        _ => false,
    }
}

/// Whether `inst` should be checked for races.
pub fn check_instruction_for_race(
    procedure: &Procedure,
    inst: ValueId,
    config: &AnalysisConfig,
) -> bool {
    let instruction = match procedure.inst(inst) {
        Some(instruction) => instruction,
        None => return false,
    };
    match instruction.kind {
        InstKind::Load { .. }
        | InstKind::Store { .. }
        | InstKind::VaArg { .. }
        | InstKind::AtomicRmw { .. }
        | InstKind::CmpXchg { .. }
        | InstKind::MemSet { .. }
        | InstKind::MemTransfer { .. } => return true,
        InstKind::Call { .. } => {}
        _ => return false,
    }
    let called = procedure.called_function(inst);
    if let Some((callee, decl)) = called {
        match decl.intrinsic {
            Some(intrinsic) => {
                if !intrinsic_may_race(intrinsic) {
                    return false;
                }
            }
            None => {
                if procedure.value_name(callee).map_or(false, is_instrumentation_fn) {
                    return false;
                }
            }
        }
    }
    if config.assume_safe_malloc && is_alloc_fn(procedure, inst) {
        return is_realloc_fn(procedure, inst);
    }
    if config.ignore_termination_calls
        && matches!(procedure.terminator(instruction.block), Terminator::Unreachable)
    {
        let (callee, decl) = match called {
            Some(called) => called,
            // Indirect calls are checked.
            None => return true,
        };
        if !decl.noreturn {
            return false;
        }
        if procedure.value_name(callee).map_or(false, is_termination_fn) {
            return false;
        }
    }
    true
}

fn intrinsic_may_race(intrinsic: Intrinsic) -> bool {
    match intrinsic {
        Intrinsic::Other { accesses_memory } => accesses_memory,
        // `threadlocal.address` does not access memory.
        Intrinsic::ThreadlocalAddress => false,
        Intrinsic::DbgInfo
        | Intrinsic::DetachedRethrow
        | Intrinsic::TaskframeResume
        | Intrinsic::SyncUnwind
        | Intrinsic::Annotation
        | Intrinsic::Assume
        | Intrinsic::InvariantStart
        | Intrinsic::InvariantEnd
        | Intrinsic::LaunderInvariantGroup
        | Intrinsic::StripInvariantGroup
        | Intrinsic::LifetimeStart
        | Intrinsic::LifetimeEnd
        | Intrinsic::PtrAnnotation
        | Intrinsic::VarAnnotation
        | Intrinsic::NoaliasScopeDecl
        | Intrinsic::SyncregionStart
        | Intrinsic::TaskframeCreate
        | Intrinsic::TaskframeUse
        | Intrinsic::TaskframeEnd
        | Intrinsic::TaskframeLoadGuard => false,
    }
}

/// The pointer `inst` reads or writes, for operations with a single location.
pub fn accessed_pointer(procedure: &Procedure, inst: ValueId) -> Option<ValueId> {
    match procedure.inst(inst).map(|i| &i.kind)? {
        InstKind::Load { ptr, .. }
        | InstKind::Store { ptr, .. }
        | InstKind::AtomicRmw { ptr, .. }
        | InstKind::CmpXchg { ptr, .. } => Some(*ptr),
        InstKind::VaArg { list } => Some(*list),
        InstKind::MemSet { dest, .. } | InstKind::MemTransfer { dest, .. } => Some(*dest),
        _ => None,
    }
}

/// The memory accesses of `inst`.
pub fn general_accesses<A: AliasOracle>(
    procedure: &Procedure,
    inst: ValueId,
    alias: &A,
    config: &AnalysisConfig,
) -> SmallVec<[GeneralAccess; 2]> {
    let mut accesses = SmallVec::new();
    let kind = match procedure.inst(inst) {
        Some(instruction) => &instruction.kind,
        None => return accesses,
    };
    match kind {
        InstKind::Load { ptr, size } => {
            let loc = MemoryLocation::new(*ptr, *size);
            if !alias.points_to_constant_memory(&loc) {
                accesses.push(GeneralAccess::located(inst, loc, None, ModRef::REF));
            }
        }
        InstKind::Store { ptr, size, .. } => {
            let loc = MemoryLocation::new(*ptr, *size);
            accesses.push(GeneralAccess::located(inst, loc, None, ModRef::MOD));
        }
        InstKind::CmpXchg { ptr, .. } | InstKind::AtomicRmw { ptr, .. } => {
            let loc = MemoryLocation::unknown_size(*ptr);
            accesses.push(GeneralAccess::located(inst, loc, None, ModRef::MOD));
        }
        InstKind::VaArg { list } => {
            let loc = MemoryLocation::unknown_size(*list);
            if !alias.points_to_constant_memory(&loc) {
                accesses.push(GeneralAccess::located(inst, loc, None, ModRef::MOD_REF));
            }
        }
        InstKind::MemSet { dest, len, .. } => {
            let loc = MemoryLocation::new(*dest, *len);
            accesses.push(GeneralAccess::located(inst, loc, None, ModRef::MOD));
        }
        InstKind::MemTransfer { dest, src, len } => {
            let dest = MemoryLocation::new(*dest, *len);
            accesses.push(GeneralAccess::located(inst, dest, Some(0), ModRef::MOD));
            let loc = MemoryLocation::new(*src, *len);
            if !alias.points_to_constant_memory(&loc) {
                accesses.push(GeneralAccess::located(inst, loc, Some(1), ModRef::REF));
            }
        }
        InstKind::Call { args, .. } => {
            call_accesses(procedure, inst, args, alias, config, &mut accesses)
        }
        _ => {}
    }
    accesses
}

fn call_accesses<A: AliasOracle>(
    procedure: &Procedure,
    call: ValueId,
    args: &[ValueId],
    alias: &A,
    config: &AnalysisConfig,
    accesses: &mut SmallVec<[GeneralAccess; 2]>,
) {
    let effects = alias.memory_effects(call);
    let mut call_mask = effects.mod_ref;
    // An unused `invariant.start` only marks memory as read-only.
    if procedure.users(call).is_empty()
        && procedure.intrinsic(call) == Some(Intrinsic::InvariantStart)
    {
        call_mask &= ModRef::REF;
    }

    if is_alloc_fn(procedure, call) && is_realloc_fn(procedure, call) {
        if let Some(arg) = args.first() {
            accesses.push(GeneralAccess::located(
                call,
                MemoryLocation::unknown_size(*arg),
                Some(0),
                alias.arg_mod_ref(call, 0),
            ));
        }
        if !config.assume_safe_malloc {
            accesses.push(GeneralAccess::opaque(call, call_mask));
        }
        return;
    }

    for (idx, arg) in args.iter().enumerate() {
        if !procedure.is_pointer(*arg) {
            continue;
        }
        let loc = MemoryLocation::unknown_size(*arg);
        if alias.points_to_constant_memory(&loc) {
            continue;
        }
        let mask = alias.arg_mod_ref(call, idx) & call_mask;
        if !mask.is_empty() {
            accesses.push(GeneralAccess::located(call, loc, Some(idx), mask));
        }
    }

    if config.assume_safe_malloc && is_free_fn(procedure, call) {
        return;
    }
    if !effects.only_arg_memory {
        accesses.push(GeneralAccess::opaque(call, call_mask));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::alias::{AliasTable, MemoryEffects};
    use crate::ir::{AllocFnKind, ArgAttrs, Constant, FunctionDecl, ProcedureBuilder, Type};

    #[test]
    fn test_memory_instruction_accesses() {
        let mut builder = ProcedureBuilder::new("f");
        let entry = builder.block("entry");
        let p = builder.argument("p", Type::Ptr, ArgAttrs::default());
        let q = builder.argument("q", Type::Ptr, ArgAttrs::default());
        let ro = builder.argument("ro", Type::Ptr, ArgAttrs::default());
        let one = builder.constant(Constant::Int(1));
        let load = builder.load(entry, p);
        let store = builder.store(entry, one, q);
        let load_ro = builder.load(entry, ro);
        let copy = builder.push(
            entry,
            None,
            Type::Void,
            InstKind::MemTransfer {
                dest: p,
                src: ro,
                len: Some(8),
            },
        );
        let procedure = builder.finish();
        let mut alias = AliasTable::new();
        alias.set_constant_memory(ro);
        let config = AnalysisConfig::default();

        let accesses = general_accesses(&procedure, load, &alias, &config);
        assert_eq!(accesses.len(), 1);
        assert!(accesses[0].is_ref() && !accesses[0].is_mod());
        assert_eq!(accesses[0].ptr(), Some(p));

        let accesses = general_accesses(&procedure, store, &alias, &config);
        assert!(accesses[0].is_mod());

        assert!(general_accesses(&procedure, load_ro, &alias, &config).is_empty());

        // The read of constant memory is dropped.
        let accesses = general_accesses(&procedure, copy, &alias, &config);
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].operand, Some(0));
        assert_eq!(accesses[0].location(), Some(MemoryLocation::new(p, Some(8))));
    }

    #[test]
    fn test_call_accesses() {
        let mut builder = ProcedureBuilder::new("f");
        let entry = builder.block("entry");
        let p = builder.argument("p", Type::Ptr, ArgAttrs::default());
        let n = builder.argument("n", Type::Int, ArgAttrs::default());
        let g = builder.function("g", FunctionDecl::default());
        let free = builder.function(
            "free",
            FunctionDecl {
                library: true,
                alloc: Some(AllocFnKind::Free),
                ..FunctionDecl::default()
            },
        );
        let call = builder.call(entry, g, &[p, n], Type::Void);
        let arg_only = builder.call(entry, g, &[p], Type::Void);
        let free_call = builder.call(entry, free, &[p], Type::Void);
        let procedure = builder.finish();

        let mut alias = AliasTable::new();
        alias.set_arg_mod_ref(call, 0, ModRef::REF);
        alias.set_effects(
            arg_only,
            MemoryEffects {
                mod_ref: ModRef::MOD,
                only_arg_memory: true,
            },
        );
        let config = AnalysisConfig::default();

        let accesses = general_accesses(&procedure, call, &alias, &config);
        assert_eq!(accesses.len(), 2);
        assert_eq!(accesses[0].operand, Some(0));
        assert_eq!(accesses[0].mod_ref, ModRef::REF);
        assert!(accesses[1].is_opaque());
        assert_eq!(accesses[1].mod_ref, ModRef::MOD_REF);

        let accesses = general_accesses(&procedure, arg_only, &alias, &config);
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].mod_ref, ModRef::MOD);

        // Under safe malloc, a free call has no opaque access.
        let accesses = general_accesses(&procedure, free_call, &alias, &config);
        assert!(accesses.iter().all(|a| !a.is_opaque()));
        let unsafe_malloc = AnalysisConfig {
            assume_safe_malloc: false,
            ..AnalysisConfig::default()
        };
        let accesses = general_accesses(&procedure, free_call, &alias, &unsafe_malloc);
        assert!(accesses.iter().any(|a| a.is_opaque()));
    }

    #[test]
    fn test_check_instruction_for_race() {
        let mut builder = ProcedureBuilder::new("f");
        let entry = builder.block("entry");
        let dead = builder.block("dead");
        let p = builder.argument("p", Type::Ptr, ArgAttrs::default());
        let lifetime = builder.function(
            "llvm.lifetime.start",
            FunctionDecl {
                intrinsic: Some(Intrinsic::LifetimeStart),
                ..FunctionDecl::default()
            },
        );
        let prefetch = builder.function(
            "llvm.prefetch",
            FunctionDecl {
                intrinsic: Some(Intrinsic::Other {
                    accesses_memory: true,
                }),
                ..FunctionDecl::default()
            },
        );
        let csi = builder.function("__csi_load", FunctionDecl::default());
        let malloc = builder.function(
            "malloc",
            FunctionDecl {
                library: true,
                alloc: Some(AllocFnKind::Alloc),
                return_noalias: true,
                ..FunctionDecl::default()
            },
        );
        let printf = builder.function("printf", FunctionDecl::default());
        let abort = builder.function(
            "abort",
            FunctionDecl {
                noreturn: true,
                ..FunctionDecl::default()
            },
        );
        let other_noreturn = builder.function(
            "fail",
            FunctionDecl {
                noreturn: true,
                ..FunctionDecl::default()
            },
        );
        let c1 = builder.call(entry, lifetime, &[p], Type::Void);
        let c2 = builder.call(entry, csi, &[p], Type::Void);
        let c3 = builder.call(entry, malloc, &[p], Type::Ptr);
        let c4 = builder.call(entry, printf, &[p], Type::Int);
        let c5 = builder.call(entry, prefetch, &[p], Type::Void);
        let d1 = builder.call(dead, printf, &[p], Type::Int);
        let d2 = builder.call(dead, abort, &[], Type::Void);
        let d3 = builder.call(dead, other_noreturn, &[], Type::Void);
        let d4 = builder.call(dead, p, &[], Type::Void);
        let d5 = builder.call(dead, prefetch, &[p], Type::Void);
        builder.terminate(dead, Terminator::Unreachable);
        let procedure = builder.finish();
        let config = AnalysisConfig::default();

        assert!(!check_instruction_for_race(&procedure, c1, &config));
        assert!(!check_instruction_for_race(&procedure, c2, &config));
        assert!(!check_instruction_for_race(&procedure, c3, &config));
        assert!(check_instruction_for_race(&procedure, c4, &config));
        assert!(!check_instruction_for_race(&procedure, d1, &config));
        assert!(!check_instruction_for_race(&procedure, d2, &config));
        assert!(check_instruction_for_race(&procedure, d3, &config));
        assert!(check_instruction_for_race(&procedure, d4, &config));
        // Memory-touching intrinsics follow the termination-block rule too.
        assert!(check_instruction_for_race(&procedure, c5, &config));
        assert!(!check_instruction_for_race(&procedure, d5, &config));

        let keep_all = AnalysisConfig {
            assume_safe_malloc: false,
            ignore_termination_calls: false,
            ..AnalysisConfig::default()
        };
        assert!(check_instruction_for_race(&procedure, c3, &keep_all));
        assert!(check_instruction_for_race(&procedure, d1, &keep_all));
        assert!(check_instruction_for_race(&procedure, d5, &keep_all));
    }
}
