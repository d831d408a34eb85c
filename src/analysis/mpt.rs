//! Maybe-parallel tasks.
//! For every spindle S, the set of tasks whose execution may overlap S.
//! A forward dataflow over the spindle graph, iterated in reverse post-order
//! until no set grows:
//! 1. S inherits the sets of its predecessors;
//! 2. an edge whose incoming block ends in a sync drops the tasks spawned in the synced region;
//! 3. entering the continuation of a detach, or reattaching into it, adds the spawned task.
//! The in-loop-body variant ignores loop back edges into the header spindle,
//! so its sets only contain tasks spawned earlier in the same iteration.
use std::collections::BTreeSet;

use log::debug;

use super::loops::LoopInfo;
use super::taskinfo::{SpindleId, TaskId, TaskInfo};
use crate::ir::{BlockId, Procedure, Terminator};

#[derive(Debug)]
pub struct MaybeParallelTasks {
    sets: Vec<BTreeSet<TaskId>>,
    rounds: usize,
}

impl MaybeParallelTasks {
    /// Maybe-parallel tasks following every spindle edge.
    pub fn compute(task_info: &TaskInfo, procedure: &Procedure) -> Self {
        Self::compute_with(task_info, procedure, None)
    }

    /// Maybe-parallel tasks ignoring the back edges of `loops`.
    pub fn compute_in_loop_body(
        task_info: &TaskInfo,
        procedure: &Procedure,
        loops: &LoopInfo,
    ) -> Self {
        Self::compute_with(task_info, procedure, Some(loops))
    }

    fn compute_with(task_info: &TaskInfo, procedure: &Procedure, loops: Option<&LoopInfo>) -> Self {
        let mut mpt = Self {
            sets: vec![BTreeSet::new(); task_info.num_spindles()],
            rounds: 0,
        };
        let order = task_info.reverse_post_order();
        loop {
            let mut changed = 0;
            for spindle in &order {
                if mpt.evaluate(*spindle, task_info, procedure, loops) {
                    changed += 1;
                }
            }
            if changed == 0 {
                break;
            }
            mpt.rounds += 1;
            debug!(
                "MPT{} round {}: {} spindles changed",
                if loops.is_some() { " in loop body" } else { "" },
                mpt.rounds,
                changed
            );
        }
        mpt
    }

    /// Update the set of `spindle`; returns whether it grew.
    fn evaluate(
        &mut self,
        spindle: SpindleId,
        task_info: &TaskInfo,
        procedure: &Procedure,
        loops: Option<&LoopInfo>,
    ) -> bool {
        let entry = task_info.spindle(spindle).entry();
        let task = task_info.spindle(spindle).task;
        let header_loop = loops.and_then(|loops| loops.loop_with_header(entry).map(|l| (loops, l)));
        let mut new_tasks = Vec::new();
        for (pred, incoming) in task_info.predecessors(spindle) {
            if let Some((loops, l)) = header_loop {
                if loops.contains(l, incoming) {
                    continue;
                }
            }
            let synced = procedure.terminator(incoming).synced_region();
            for t in &self.sets[pred.index()] {
                let killed = match (synced, task_info.task(*t).detach) {
                    (Some(region), Some(detach)) => detach.region == region,
                    _ => false,
                };
                if !killed && !self.sets[spindle.index()].contains(t) {
                    new_tasks.push(*t);
                }
            }
            if let Some(spawned) = spawned_task(task_info, procedure, task, pred, incoming, entry) {
                if !self.sets[spindle.index()].contains(&spawned) {
                    new_tasks.push(spawned);
                }
            }
        }
        let set = &mut self.sets[spindle.index()];
        let before = set.len();
        set.extend(new_tasks);
        set.len() > before
    }

    pub fn tasks(&self, spindle: SpindleId) -> &BTreeSet<TaskId> {
        &self.sets[spindle.index()]
    }

    /// Number of rounds that grew some set.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Whether some task that may run in parallel with `spindle` encloses `block`.
    pub fn any_encloses(&self, spindle: SpindleId, task_info: &TaskInfo, block: BlockId) -> bool {
        self.tasks(spindle)
            .iter()
            .any(|t| task_info.encloses(*t, block))
    }
}

/// The task spawned alongside the continuation `entry`, if the edge
/// `pred--|incoming|-->entry` is a detach-continue or reattach edge.
fn spawned_task(
    task_info: &TaskInfo,
    procedure: &Procedure,
    task: TaskId,
    pred: SpindleId,
    incoming: BlockId,
    entry: BlockId,
) -> Option<TaskId> {
    match procedure.terminator(incoming) {
        Terminator::Detach { continuation, .. } if *continuation == entry => task_info
            .sub_tasks(task)
            .find(|t| task_info.task(*t).detach.map_or(false, |d| d.detach == incoming)),
        Terminator::Reattach { continuation, .. } if *continuation == entry => {
            let pred_entry = task_info.spindle(pred).entry();
            task_info
                .sub_task_enclosing(task, pred_entry)
                .filter(|child| *child != task)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::taskinfo::{DetachInfo, SpindleKind};
    use crate::ir::{ProcedureBuilder, SyncRegion};

    fn b(i: u32) -> BlockId {
        BlockId(i)
    }

    /// b0: detach b1, continue b2; b1: reattach b2; b2: sync into b3.
    #[test]
    fn test_spawn_and_sync() {
        let mut builder = ProcedureBuilder::new("spawn");
        let blocks = (0..4).map(|i| builder.block(&format!("b{}", i))).collect::<Vec<_>>();
        let region = SyncRegion(0);
        builder.terminate(
            blocks[0],
            Terminator::Detach {
                region,
                detached: b(1),
                continuation: b(2),
            },
        );
        builder.terminate(
            blocks[1],
            Terminator::Reattach {
                region,
                continuation: b(2),
            },
        );
        builder.terminate(
            blocks[2],
            Terminator::Sync {
                region,
                target: b(3),
            },
        );
        let procedure = builder.finish();

        let mut ti = TaskInfo::new(&[b(0)]);
        let root = ti.root_task();
        let t1 = ti.add_task(
            root,
            DetachInfo {
                detach: b(0),
                continuation: b(2),
                region,
            },
            &[b(1)],
        );
        ti.add_spindle(root, SpindleKind::Phi, &[b(2)]);
        ti.add_spindle(root, SpindleKind::Sync, &[b(3)]);
        ti.link_spindles(&procedure);

        let mpt = MaybeParallelTasks::compute(&ti, &procedure);
        let s = |block| ti.spindle_for(b(block)).unwrap();
        assert!(mpt.tasks(s(0)).is_empty());
        assert!(mpt.tasks(s(1)).is_empty());
        assert_eq!(mpt.tasks(s(2)).iter().copied().collect::<Vec<_>>(), vec![t1]);
        assert!(mpt.tasks(s(3)).is_empty());
        assert!(mpt.any_encloses(s(2), &ti, b(1)));
        assert!(!mpt.any_encloses(s(3), &ti, b(1)));
        assert!(mpt.rounds() <= ti.num_tasks());
    }

    /// b0 -> b1 (header): detach b2, continue b3; b2: reattach b3;
    /// b3: branch to b1 or b4; b4: sync into b5.
    fn spawn_in_loop() -> (Procedure, TaskInfo, LoopInfo, TaskId) {
        let mut builder = ProcedureBuilder::new("loop");
        let blocks = (0..6).map(|i| builder.block(&format!("b{}", i))).collect::<Vec<_>>();
        let region = SyncRegion(0);
        builder.terminate(
            blocks[0],
            Terminator::Br {
                targets: vec![b(1)],
            },
        );
        builder.terminate(
            blocks[1],
            Terminator::Detach {
                region,
                detached: b(2),
                continuation: b(3),
            },
        );
        builder.terminate(
            blocks[2],
            Terminator::Reattach {
                region,
                continuation: b(3),
            },
        );
        builder.terminate(
            blocks[3],
            Terminator::Br {
                targets: vec![b(1), b(4)],
            },
        );
        builder.terminate(
            blocks[4],
            Terminator::Sync {
                region,
                target: b(5),
            },
        );
        let procedure = builder.finish();

        let mut ti = TaskInfo::new(&[b(0)]);
        let root = ti.root_task();
        ti.add_spindle(root, SpindleKind::Phi, &[b(1)]);
        let t1 = ti.add_task(
            root,
            DetachInfo {
                detach: b(1),
                continuation: b(3),
                region,
            },
            &[b(2)],
        );
        ti.add_spindle(root, SpindleKind::Phi, &[b(3), b(4)]);
        ti.add_spindle(root, SpindleKind::Sync, &[b(5)]);
        ti.link_spindles(&procedure);

        let mut loops = LoopInfo::new();
        loops.add_loop(None, b(1), &[b(1), b(2), b(3)]);
        (procedure, ti, loops, t1)
    }

    #[test]
    fn test_spawn_in_loop() {
        let (procedure, ti, loops, t1) = spawn_in_loop();
        let s = |block| ti.spindle_for(b(block)).unwrap();

        let mpt = MaybeParallelTasks::compute(&ti, &procedure);
        // The task of the previous iteration is still running.
        assert!(mpt.tasks(s(1)).contains(&t1));
        assert!(mpt.tasks(s(2)).contains(&t1));
        assert!(mpt.tasks(s(3)).contains(&t1));
        assert!(mpt.tasks(s(5)).is_empty());
        assert!(mpt.rounds() <= ti.num_tasks());

        let in_loop = MaybeParallelTasks::compute_in_loop_body(&ti, &procedure, &loops);
        assert!(in_loop.tasks(s(1)).is_empty());
        assert!(in_loop.tasks(s(2)).is_empty());
        assert!(in_loop.tasks(s(3)).contains(&t1));
        assert!(in_loop.tasks(s(5)).is_empty());

        // The in-loop sets are never larger.
        for spindle in ti.spindle_ids() {
            assert!(in_loop.tasks(spindle).is_subset(mpt.tasks(spindle)));
        }
    }
}
