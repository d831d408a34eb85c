//! RaceDetector: detects determinacy races between logically parallel accesses.
//!
//! 1. Collect the accesses of every operation worth checking and index them
//!    by task, spindle and innermost loop.
//! 2. Record races with the caller (via ancestor) and with unknown code (opaque),
//!    both per procedure argument and per underlying object.
//! 3. Walk the task tree from the root: every access of a spindle is paired with
//!    every access of the tasks that may run in parallel with that spindle, and
//!    a pair is a local race if a dependence between the two may cross a
//!    parallel boundary.
pub mod result;

pub use result::{RaceData, RaceInfo, RaceSeverity, RaceType};

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use rustc_hash::FxHashSet;

use crate::analysis::alias::{AliasOracle, AliasResult, MemoryLocation, ModRef};
use crate::analysis::dependence::{Dependence, DependenceOracle, Direction};
use crate::analysis::loops::{LoopId, LoopInfo};
use crate::analysis::mpt::MaybeParallelTasks;
use crate::analysis::objects::{
    is_identified_object, is_no_alias_call, is_null, is_thread_local_object, underlying_object,
    underlying_objects, CaptureTracker,
};
use crate::analysis::taskinfo::{SpindleId, TaskId, TaskInfo};
use crate::config::AnalysisConfig;
use crate::interest::ignorelist::IgnoreList;
use crate::interest::memory::access::{
    accessed_pointer, check_instruction_for_race, general_accesses, may_access_memory,
    GeneralAccess, MemAccessInfo,
};
use crate::interest::memory::allocation::{is_alloc_fn, is_free_fn};
use crate::ir::{BlockId, Constant, InstKind, Linkage, Procedure, ValueId, ValueKind};

/// Where an access lives in the task and loop structure.
#[derive(Clone, Copy, Debug)]
struct AccessSite {
    block: BlockId,
    task: TaskId,
    spindle: SpindleId,
}

/// Detect determinacy races in one procedure.
pub struct RaceDetector<'a, A, D> {
    procedure: &'a Procedure,
    task_info: &'a TaskInfo,
    loops: &'a LoopInfo,
    alias: &'a A,
    dependence: &'a D,
    ignore_list: &'a IgnoreList,
    config: AnalysisConfig,
    captures: CaptureTracker<'a>,
    mpt: MaybeParallelTasks,
    mpt_in_loop: MaybeParallelTasks,
    task_accesses: BTreeMap<TaskId, Vec<GeneralAccess>>,
    spindle_accesses: BTreeMap<SpindleId, Vec<GeneralAccess>>,
    loop_accesses: BTreeMap<LoopId, Vec<GeneralAccess>>,
    access_to_objs: BTreeMap<MemAccessInfo, BTreeSet<ValueId>>,
    inst_accesses: BTreeMap<ValueId, Vec<MemAccessInfo>>,
}

impl<'a, A: AliasOracle, D: DependenceOracle> RaceDetector<'a, A, D> {
    pub fn new(
        procedure: &'a Procedure,
        task_info: &'a TaskInfo,
        loops: &'a LoopInfo,
        alias: &'a A,
        dependence: &'a D,
        ignore_list: &'a IgnoreList,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            procedure,
            task_info,
            loops,
            alias,
            dependence,
            ignore_list,
            config,
            captures: CaptureTracker::new(procedure, config.max_uses_to_explore),
            mpt: MaybeParallelTasks::compute(task_info, procedure),
            mpt_in_loop: MaybeParallelTasks::compute_in_loop_body(task_info, procedure, loops),
            task_accesses: BTreeMap::new(),
            spindle_accesses: BTreeMap::new(),
            loop_accesses: BTreeMap::new(),
            access_to_objs: BTreeMap::new(),
            inst_accesses: BTreeMap::new(),
        }
    }

    /// Run the detection and hand over the result.
    pub fn detect(&mut self) -> RaceInfo {
        debug!(
            "{}: {} tasks, {} spindles, {} loops",
            self.procedure.name(),
            self.task_info.num_tasks(),
            self.task_info.num_spindles(),
            self.loops.num_loops()
        );
        self.collect_accesses();
        let mut info = RaceInfo::new(self.access_to_objs.clone(), self.inst_accesses.clone());
        self.process_access_ptrs(&mut info);
        info
    }

    /// Accesses whose operation sits in the innermost loop `l`.
    pub fn loop_accesses(&self, l: LoopId) -> &[GeneralAccess] {
        self.loop_accesses.get(&l).map_or(&[], |a| a.as_slice())
    }

    pub fn maybe_parallel_tasks(&self) -> &MaybeParallelTasks {
        &self.mpt
    }

    fn collect_accesses(&mut self) {
        self.task_accesses.clear();
        self.spindle_accesses.clear();
        self.loop_accesses.clear();
        self.access_to_objs.clear();
        self.inst_accesses.clear();
        let procedure = self.procedure;
        for inst in procedure.instructions() {
            if may_access_memory(procedure, inst, self.alias)
                && check_instruction_for_race(procedure, inst, &self.config)
            {
                self.add_access(inst);
            }
        }
    }

    fn site(&self, inst: ValueId) -> Option<AccessSite> {
        let block = self.procedure.parent_block(inst)?;
        Some(AccessSite {
            block,
            task: self.task_info.task_for(block)?,
            spindle: self.task_info.spindle_for(block)?,
        })
    }

    fn is_ignored(&self, inst: ValueId) -> bool {
        if self.ignore_list.is_empty() {
            return false;
        }
        let procedure = self.procedure;
        let module = procedure.module();
        if procedure.inst(inst).map_or(false, |i| i.is_call()) {
            return match procedure.called_function(inst) {
                Some((callee, _)) => self
                    .ignore_list
                    .is_function_listed(procedure.value_name(callee).unwrap_or(""), module),
                None => false,
            };
        }
        let obj = match accessed_pointer(procedure, inst) {
            Some(ptr) => underlying_object(procedure, ptr),
            None => return false,
        };
        let ty = match &procedure.value(obj).kind {
            ValueKind::Global(global) => {
                let name = procedure.value_name(obj).unwrap_or("");
                if self.ignore_list.is_global_listed(name, module) {
                    return true;
                }
                global.value_type.as_deref()
            }
            ValueKind::Instruction(i) => match &i.kind {
                InstKind::Alloca { allocated_type } => allocated_type.as_deref(),
                _ => None,
            },
            _ => None,
        };
        ty.map_or(false, |ty| self.ignore_list.is_type_listed(ty))
    }

    fn add_access(&mut self, inst: ValueId) {
        if self.is_ignored(inst) {
            debug!("ignored: {}", self.procedure.display(inst));
            return;
        }
        let site = match self.site(inst) {
            Some(site) => site,
            None => {
                debug!("not in any spindle: {}", self.procedure.display(inst));
                return;
            }
        };
        let procedure = self.procedure;
        for access in general_accesses(procedure, inst, self.alias, &self.config) {
            self.task_accesses.entry(site.task).or_default().push(access);
            self.spindle_accesses.entry(site.spindle).or_default().push(access);
            if let Some(l) = self.loops.loop_for(site.block) {
                self.loop_accesses.entry(l).or_default().push(access);
            }
            let ptr = match access.ptr() {
                Some(ptr) => ptr,
                None => continue,
            };
            let key = MemAccessInfo::new(ptr, access.is_mod());
            let keys = self.inst_accesses.entry(inst).or_default();
            if !keys.contains(&key) {
                keys.push(key);
            }
            let objs = self.access_to_objs.entry(key).or_default();
            objs.extend(
                underlying_objects(procedure, ptr, self.loops)
                    .into_iter()
                    .filter(|obj| is_racy_object(procedure, *obj)),
            );
        }
    }

    fn objects_of(&self, access: &GeneralAccess) -> Vec<ValueId> {
        match access.ptr() {
            Some(ptr) => self
                .access_to_objs
                .get(&MemAccessInfo::new(ptr, access.is_mod()))
                .map(|objs| objs.iter().copied().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// The spindle of `task` standing for `spindle` when comparing maybe-parallel sets:
    /// the continuation of the child of `task` that holds `spindle`.
    fn rep_spindle_in_task(&self, spindle: SpindleId, task: TaskId) -> SpindleId {
        let ti = self.task_info;
        ti.sub_task_enclosing(task, ti.spindle(spindle).entry())
            .and_then(|encl| ti.task(encl).detach)
            .and_then(|detach| ti.spindle_for(detach.continuation))
            .unwrap_or(spindle)
    }

    /// Deepest loop level at which the two accesses must be compared, after
    /// moving the common loop out to the common task's entry if needed.
    fn max_loop_depth(
        &self,
        common_loop: Option<LoopId>,
        common_task: TaskId,
        (s1, s2): (SpindleId, SpindleId),
        min_obj_depth: usize,
    ) -> (Option<LoopId>, usize) {
        let ti = self.task_info;
        let mut common_loop = common_loop;
        let mut max_depth = common_loop.map_or(0, |l| self.loops.depth(l));
        if !ti.is_shared_eh(s1) && !ti.is_shared_eh(s2) {
            let task_entry = ti.task_entry_block(common_task);
            if let Some(l) = common_loop {
                if !self.loops.contains(l, task_entry) {
                    common_loop = self.loops.loop_for(task_entry);
                }
            }
            max_depth = common_loop.map_or(0, |l| self.loops.depth(l));
            if max_depth == 0 {
                max_depth = min_obj_depth;
            }
        }
        (common_loop, max_depth)
    }

    /// Whether the two accesses may run in parallel within one iteration of their common loop.
    fn parallel_in_iteration(
        &self,
        (s1, s2): (SpindleId, SpindleId),
        (b1, b2): (BlockId, BlockId),
    ) -> bool {
        self.mpt_in_loop.any_encloses(s1, self.task_info, b2)
            || self.mpt_in_loop.any_encloses(s2, self.task_info, b1)
    }

    /// Decide whether a dependence between two maybe-parallel accesses crosses a
    /// parallel boundary.
    fn check_dependence(
        &self,
        dependence: Option<Dependence>,
        ga1: &GeneralAccess,
        ga2: &GeneralAccess,
    ) -> bool {
        let dependence = match dependence {
            Some(dependence) => dependence,
            None => {
                debug!("no dependence");
                return false;
            }
        };
        let (site1, site2) = match (self.site(ga1.inst), self.site(ga2.inst)) {
            (Some(s1), Some(s2)) => (s1, s2),
            _ => return true,
        };
        let (b1, b2) = (site1.block, site2.block);
        let same_task = site1.task == site2.task;
        let common_loop = match self.loops.common_loop(b1, b2) {
            Some(l) => l,
            None => {
                debug!("no common loop, same task: {}", same_task);
                return !same_task;
            }
        };

        // Objects shared by both accesses bound the loop levels that matter.
        let objs1 = self.objects_of(ga1);
        let objs2 = self.objects_of(ga2);
        let all_shared =
            objs1.iter().all(|o| objs2.contains(o)) && objs2.iter().all(|o| objs1.contains(o));
        let min_obj_depth = if objs1.is_empty() || !all_shared {
            0
        } else {
            let mut common_obj_loop = Some(common_loop);
            for obj in &objs1 {
                if common_obj_loop.is_none() {
                    break;
                }
                common_obj_loop = if self.is_loop_local_object(*obj) {
                    self.procedure
                        .parent_block(*obj)
                        .and_then(|block| self.loops.common_loop_with(common_obj_loop, block))
                } else {
                    None
                };
            }
            common_obj_loop.map_or(0, |l| self.loops.depth(l))
        };

        let common_task = self.task_info.enclosing_task(b1, b2);
        let reps = (
            self.rep_spindle_in_task(site1.spindle, common_task),
            self.rep_spindle_in_task(site2.spindle, common_task),
        );
        let (common_loop, max_depth) =
            self.max_loop_depth(Some(common_loop), common_task, reps, min_obj_depth);
        debug!("loop depths: object {}, max {}", min_obj_depth, max_depth);

        if max_depth == min_obj_depth {
            if same_task {
                return false;
            }
            if max_depth == 0 {
                return true;
            }
            if !dependence.direction(max_depth).contains(Direction::EQ) {
                return false;
            }
            return self.parallel_in_iteration(reps, (b1, b2));
        }

        // The outermost level whose iterations may run in parallel with the second access.
        let mut min_depth_to_check = 1;
        let nest = common_loop.map(|l| self.loops.loop_nest(l)).unwrap_or_default();
        for l in nest.into_iter().rev() {
            if min_depth_to_check < min_obj_depth {
                min_depth_to_check += 1;
                continue;
            }
            let header = self.task_info.spindle_for(self.loops.header(l));
            if header.map_or(false, |s| self.mpt.any_encloses(s, self.task_info, b2)) {
                break;
            }
            min_depth_to_check += 1;
        }
        (min_depth_to_check..=max_depth).rev().any(|level| {
            dependence.is_scalar(level) || dependence.direction(level).intersects(!Direction::EQ)
        })
    }

    fn is_loop_local_object(&self, obj: ValueId) -> bool {
        match self.procedure.inst(obj).map(|i| &i.kind) {
            Some(InstKind::Alloca { .. }) => true,
            Some(InstKind::Call { .. }) => is_no_alias_call(self.procedure, obj),
            _ => false,
        }
    }

    fn may_write(&self, access: &GeneralAccess) -> bool {
        if access.is_mod() {
            return true;
        }
        match self.procedure.inst(access.inst).map(|i| &i.kind) {
            Some(InstKind::Store { .. })
            | Some(InstKind::AtomicRmw { .. })
            | Some(InstKind::CmpXchg { .. })
            | Some(InstKind::VaArg { .. })
            | Some(InstKind::MemSet { .. })
            | Some(InstKind::MemTransfer { .. }) => true,
            Some(InstKind::Call { .. }) => self.alias.memory_effects(access.inst).mod_ref.is_mod(),
            _ => false,
        }
    }

    /// Race check of a pair in which at least one access is opaque.
    fn check_opaque_accesses(&mut self, ga1: &GeneralAccess, ga2: &GeneralAccess) -> bool {
        if !self.may_write(ga1) && !self.may_write(ga2) {
            return false;
        }
        if ga1.is_opaque() && ga2.is_opaque() {
            return true;
        }
        let (located, opaque) = if ga1.is_opaque() { (ga2, ga1) } else { (ga1, ga2) };
        if let Some(ptr) = located.ptr() {
            if !self.captures.pointer_captured_strictly_before(ptr, opaque.inst) {
                debug!("not captured before the opaque access");
                return false;
            }
        }

        let (site1, site2) = match (self.site(ga1.inst), self.site(ga2.inst)) {
            (Some(s1), Some(s2)) => (s1, s2),
            _ => return true,
        };
        let (b1, b2) = (site1.block, site2.block);
        let same_task = site1.task == site2.task;
        let common_loop = self.loops.common_loop(b1, b2);
        if common_loop.is_none() {
            return !same_task;
        }
        let common_task = self.task_info.enclosing_task(b1, b2);
        let reps = (
            self.rep_spindle_in_task(site1.spindle, common_task),
            self.rep_spindle_in_task(site2.spindle, common_task),
        );
        let (_, max_depth) = self.max_loop_depth(common_loop, common_task, reps, 0);
        !(same_task && max_depth == 0)
    }

    /// Whether the underlying objects of two located accesses may be the same.
    fn underlying_objects_alias(
        &mut self,
        ga1: &GeneralAccess,
        ga2: &GeneralAccess,
    ) -> AliasResult {
        let (p1, p2) = match (ga1.ptr(), ga2.ptr()) {
            (Some(p1), Some(p2)) => (p1, p2),
            _ => return AliasResult::MayAlias,
        };
        let result = self
            .alias
            .alias(&MemoryLocation::unknown_size(p1), &MemoryLocation::unknown_size(p2));
        if result == AliasResult::NoAlias {
            return AliasResult::NoAlias;
        }
        let o1 = underlying_object(self.procedure, p1);
        let o2 = underlying_object(self.procedure, p2);
        if o1 == o2 {
            return AliasResult::MustAlias;
        }
        let identified1 = is_identified_object(self.procedure, o1);
        let identified2 = is_identified_object(self.procedure, o2);
        if !identified1 || !identified2 {
            if (identified1 && !self.captures.pointer_captured_before(o1, ga2.inst))
                || (identified2 && !self.captures.pointer_captured_before(o2, ga1.inst))
            {
                return AliasResult::NoAlias;
            }
            return AliasResult::MayAlias;
        }
        AliasResult::NoAlias
    }

    fn is_thread_local(&self, ptr: ValueId) -> bool {
        is_thread_local_object(self.procedure, ptr)
            || is_thread_local_object(self.procedure, underlying_object(self.procedure, ptr))
    }

    fn evaluate_maybe_parallel_accesses(
        &mut self,
        ga1: &GeneralAccess,
        ga2: &GeneralAccess,
        info: &mut RaceInfo,
    ) {
        if !ga1.is_mod() && !ga2.is_mod() {
            return;
        }
        let racy = if ga1.is_opaque() || ga2.is_opaque() {
            self.check_opaque_accesses(ga1, ga2)
        } else {
            let (p1, p2) = match (ga1.ptr(), ga2.ptr()) {
                (Some(p1), Some(p2)) => (p1, p2),
                _ => return,
            };
            if is_null(self.procedure, p1) || is_null(self.procedure, p2) {
                return;
            }
            if self.underlying_objects_alias(ga1, ga2) == AliasResult::NoAlias {
                return;
            }
            if self.is_thread_local(p1) && self.is_thread_local(p2) {
                return;
            }
            let dependence = self.dependence.depends(ga1.inst, ga2.inst);
            self.check_dependence(dependence, ga1, ga2)
        };
        debug!(
            "{} || {}: {}",
            self.procedure.display(ga1.inst),
            self.procedure.display(ga2.inst),
            if racy { "race" } else { "no race" }
        );
        if racy {
            self.record_local_race(ga1, ga2, info);
            self.record_local_race(ga2, ga1, info);
        }
    }

    fn record_local_race(
        &self,
        access: &GeneralAccess,
        racer: &GeneralAccess,
        info: &mut RaceInfo,
    ) {
        info.record_local_race(access, racer);
        for obj in self.objects_of(access) {
            if access.is_mod() {
                info.set_object_mod_ref(obj, ModRef::REF);
            }
            info.set_object_mod_ref(obj, ModRef::MOD);
        }
    }

    fn record_ancestor_race(&self, access: &GeneralAccess, obj: ValueId, info: &mut RaceInfo) {
        if access.is_mod() {
            info.record_race_via_ancestor_ref(access, None);
            info.set_object_mod_ref(obj, ModRef::REF);
        }
        info.record_race_via_ancestor_mod(access, None);
        info.set_object_mod_ref(obj, ModRef::MOD);
    }

    fn record_opaque_race(&self, access: &GeneralAccess, obj: ValueId, info: &mut RaceInfo) {
        info.record_opaque_race(access, None);
        if access.is_mod() {
            info.set_object_mod_ref(obj, ModRef::REF);
        }
        info.set_object_mod_ref(obj, ModRef::MOD);
    }

    /// Record races with code outside this procedure through the objects of `access`.
    fn check_objects(&self, access: &GeneralAccess, info: &mut RaceInfo) {
        let procedure = self.procedure;
        for obj in self.objects_of(access) {
            match &procedure.value(obj).kind {
                ValueKind::Instruction(inst) => match inst.kind {
                    InstKind::Alloca { .. } => {}
                    InstKind::Call { .. }
                        if self.config.assume_safe_malloc && is_alloc_fn(procedure, obj) => {}
                    _ => self.record_opaque_race(access, obj, info),
                },
                ValueKind::Argument(arg) => {
                    if !(arg.attrs.byval || arg.attrs.sret || arg.attrs.inalloca) {
                        self.record_ancestor_race(access, obj, info);
                    }
                }
                ValueKind::Global(global) => match global.linkage {
                    Linkage::Private | Linkage::Internal => {
                        self.record_ancestor_race(access, obj, info)
                    }
                    Linkage::External => self.record_opaque_race(access, obj, info),
                },
                ValueKind::Constant(Constant::Expr { .. }) => {
                    self.record_opaque_race(access, obj, info)
                }
                ValueKind::Constant(_) | ValueKind::Function(_) => {
                    warn!("unexpected underlying object {}", procedure.display(obj));
                    self.record_opaque_race(access, obj, info);
                }
            }
        }
    }

    fn check_for_races_helper(
        &mut self,
        task: TaskId,
        visited: &mut FxHashSet<TaskId>,
        info: &mut RaceInfo,
    ) {
        let ti = self.task_info;
        for spindle in ti.depth_first_in_task(task) {
            let accesses = self.spindle_accesses.get(&spindle).cloned().unwrap_or_default();
            for access in accesses.iter().filter(|a| !a.is_opaque()) {
                self.check_objects(access, info);
            }

            let parallel = self.mpt.tasks(spindle).iter().copied().collect::<Vec<_>>();
            for mpt in parallel {
                for other_task in ti.task_and_descendants(mpt) {
                    let others = self.task_accesses.get(&other_task).cloned().unwrap_or_default();
                    for ga1 in &accesses {
                        for ga2 in &others {
                            self.evaluate_maybe_parallel_accesses(ga1, ga2, info);
                        }
                    }
                }
            }

            for succ in ti.successors(spindle) {
                if ti.succ_in_sub_task(spindle, succ) {
                    let sub_task = ti.spindle(succ).task;
                    if visited.insert(sub_task) {
                        self.check_for_races_helper(sub_task, visited, info);
                    }
                }
            }
        }
    }

    /// Races through pointer arguments and opaque calls, then the task-tree walk.
    fn process_access_ptrs(&mut self, info: &mut RaceInfo) {
        let procedure = self.procedure;
        let ti = self.task_info;
        let args = procedure
            .arguments()
            .into_iter()
            .filter(|arg| procedure.is_pointer(*arg))
            .filter_map(|arg| procedure.argument(arg).map(|a| (arg, a.attrs)))
            .filter(|(_, attrs)| !(attrs.byval || attrs.sret || attrs.inalloca))
            .collect::<Vec<_>>();

        for spindle in ti.depth_first() {
            let accesses = self.spindle_accesses.get(&spindle).cloned().unwrap_or_default();
            for access in &accesses {
                if access.is_opaque()
                    && !self.alias.memory_effects(access.inst).only_arg_memory
                    && !(self.config.assume_safe_malloc
                        && (is_alloc_fn(procedure, access.inst)
                            || is_free_fn(procedure, access.inst)))
                {
                    info.record_opaque_race(access, None);
                }
                for (arg, attrs) in &args {
                    let arg_loc = MemoryLocation::unknown_size(*arg);
                    let mod_ref = match access.location() {
                        None => self.alias.mod_ref_info(access.inst, &arg_loc),
                        Some(loc) => {
                            if self.alias.alias(&loc, &arg_loc) == AliasResult::NoAlias {
                                continue;
                            }
                            access.mod_ref
                        }
                    };
                    if mod_ref.is_mod() && !attrs.readonly {
                        info.record_race_via_ancestor_ref(access, None);
                        info.record_race_via_ancestor_mod(access, None);
                        info.set_object_mod_ref(*arg, ModRef::MOD_REF);
                    }
                    if mod_ref.is_ref() {
                        info.record_race_via_ancestor_mod(access, None);
                        info.set_object_mod_ref(*arg, ModRef::MOD);
                    }
                }
            }
        }

        let root = ti.root_task();
        let mut visited = FxHashSet::default();
        visited.insert(root);
        self.check_for_races_helper(root, &mut visited, info);
    }
}

/// Values that may be the target of a racing access.
fn is_racy_object(procedure: &Procedure, obj: ValueId) -> bool {
    match &procedure.value(obj).kind {
        ValueKind::Constant(c) => !c.is_non_address(),
        ValueKind::Global(global) => !global.constant,
        ValueKind::Function(_) => false,
        ValueKind::Argument(_) | ValueKind::Instruction(_) => true,
    }
}
