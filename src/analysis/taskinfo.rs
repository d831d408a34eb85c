//! The task/spindle decomposition of a procedure.
//! Spindles are the nodes of a directed graph whose edges carry the incoming
//! block, i.e. the block of the predecessor spindle whose terminator transfers
//! control. Tasks form a tree rooted at the task of the whole procedure.
//! e.g., `Spindle1--|detach.bb|-->Spindle2` denotes that the terminator of
//! `detach.bb` in `Spindle1` enters `Spindle2`.
use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::visit::{Dfs, DfsPostOrder, EdgeRef, NodeFiltered};
use petgraph::Direction::{Incoming, Outgoing};
use petgraph::{Directed, Graph};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::GraphError;
use crate::ir::{BlockId, Procedure, SyncRegion};

/// The NodeIndex in the task tree, denoting a unique task.
pub type TaskId = NodeIndex;
/// The NodeIndex in the spindle graph, denoting a unique spindle.
pub type SpindleId = NodeIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleKind {
    Entry,
    Detach,
    Sync,
    Phi,
}

#[derive(Debug)]
pub struct Spindle {
    pub kind: SpindleKind,
    pub task: TaskId,
    /// Member blocks, the entry block first.
    pub blocks: Vec<BlockId>,
    pub shared_eh: bool,
}

impl Spindle {
    pub fn entry(&self) -> BlockId {
        self.blocks[0]
    }
}

/// The detach that spawned a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachInfo {
    pub detach: BlockId,
    pub continuation: BlockId,
    pub region: SyncRegion,
}

#[derive(Debug)]
pub struct Task {
    pub entry: SpindleId,
    /// `None` only for the root task.
    pub detach: Option<DetachInfo>,
    pub depth: usize,
}

#[derive(Debug, Deserialize)]
#[serde(try_from = "TaskInfoData")]
pub struct TaskInfo {
    tasks: Graph<Task, (), Directed>,
    spindles: Graph<Spindle, BlockId, Directed>,
    block_to_spindle: FxHashMap<BlockId, SpindleId>,
}

impl TaskInfo {
    /// Create the root task with its entry spindle.
    pub fn new(entry_blocks: &[BlockId]) -> Self {
        let mut info = Self {
            tasks: Graph::new(),
            spindles: Graph::new(),
            block_to_spindle: FxHashMap::default(),
        };
        let root = info.tasks.add_node(Task {
            entry: NodeIndex::new(0),
            detach: None,
            depth: 0,
        });
        info.add_spindle(root, SpindleKind::Entry, entry_blocks);
        info
    }

    /// Add a task spawned by `detach` within `parent`, with its entry spindle.
    pub fn add_task(
        &mut self,
        parent: TaskId,
        detach: DetachInfo,
        entry_blocks: &[BlockId],
    ) -> TaskId {
        self.add_task_with_kind(parent, detach, SpindleKind::Detach, entry_blocks)
    }

    fn add_task_with_kind(
        &mut self,
        parent: TaskId,
        detach: DetachInfo,
        kind: SpindleKind,
        entry_blocks: &[BlockId],
    ) -> TaskId {
        let task = self.tasks.add_node(Task {
            entry: NodeIndex::new(self.spindles.node_count()),
            detach: Some(detach),
            depth: self.tasks[parent].depth + 1,
        });
        self.tasks.add_edge(parent, task, ());
        self.add_spindle(task, kind, entry_blocks);
        task
    }

    pub fn add_spindle(
        &mut self,
        task: TaskId,
        kind: SpindleKind,
        blocks: &[BlockId],
    ) -> SpindleId {
        let spindle = self.spindles.add_node(Spindle {
            kind,
            task,
            blocks: blocks.to_vec(),
            shared_eh: false,
        });
        for block in blocks {
            self.block_to_spindle.insert(*block, spindle);
        }
        spindle
    }

    pub fn set_shared_eh(&mut self, spindle: SpindleId, shared_eh: bool) {
        self.spindles[spindle].shared_eh = shared_eh;
    }

    /// Add the edge `from--|incoming|-->to` if it does not exist yet.
    pub fn add_spindle_edge(&mut self, from: SpindleId, to: SpindleId, incoming: BlockId) {
        let exists = self
            .spindles
            .edges_connecting(from, to)
            .any(|e| *e.weight() == incoming);
        if !exists {
            self.spindles.add_edge(from, to, incoming);
        }
    }

    /// Derive the spindle edges from the CFG: every CFG edge entering
    /// the entry block of a spindle becomes a spindle edge.
    pub fn link_spindles(&mut self, procedure: &Procedure) {
        for (block, _) in procedure.blocks() {
            let from = match self.spindle_for(block) {
                Some(s) => s,
                None => continue,
            };
            for succ in procedure.successors(block) {
                if let Some(to) = self.spindle_for(succ) {
                    if self.spindles[to].entry() == succ {
                        self.add_spindle_edge(from, to, block);
                    }
                }
            }
        }
    }

    pub fn root_task(&self) -> TaskId {
        NodeIndex::new(0)
    }

    pub fn task(&self, task: TaskId) -> &Task {
        &self.tasks[task]
    }

    pub fn spindle(&self, spindle: SpindleId) -> &Spindle {
        &self.spindles[spindle]
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.node_count()
    }

    pub fn num_spindles(&self) -> usize {
        self.spindles.node_count()
    }

    pub fn num_spindle_edges(&self) -> usize {
        self.spindles.edge_count()
    }

    pub fn spindle_ids(&self) -> impl Iterator<Item = SpindleId> + '_ {
        self.spindles.node_indices()
    }

    pub fn spindle_for(&self, block: BlockId) -> Option<SpindleId> {
        self.block_to_spindle.get(&block).copied()
    }

    pub fn task_for(&self, block: BlockId) -> Option<TaskId> {
        self.spindle_for(block).map(|s| self.spindles[s].task)
    }

    pub fn parent_task(&self, task: TaskId) -> Option<TaskId> {
        self.tasks.neighbors_directed(task, Incoming).next()
    }

    pub fn sub_tasks(&self, task: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.neighbors_directed(task, Outgoing)
    }

    pub fn task_entry_block(&self, task: TaskId) -> BlockId {
        self.spindles[self.tasks[task].entry].entry()
    }

    pub fn is_root(&self, task: TaskId) -> bool {
        task == self.root_task()
    }

    pub fn is_shared_eh(&self, spindle: SpindleId) -> bool {
        self.spindles[spindle].shared_eh
    }

    /// Whether `outer` is `inner` or one of its ancestors.
    pub fn encloses_task(&self, outer: TaskId, inner: TaskId) -> bool {
        let mut curr = Some(inner);
        while let Some(t) = curr {
            if t == outer {
                return true;
            }
            if self.tasks[t].depth <= self.tasks[outer].depth {
                return false;
            }
            curr = self.parent_task(t);
        }
        false
    }

    /// Whether `task` encloses the task of `block`.
    pub fn encloses(&self, task: TaskId, block: BlockId) -> bool {
        self.task_for(block)
            .map_or(false, |inner| self.encloses_task(task, inner))
    }

    /// The deepest task enclosing both blocks.
    pub fn enclosing_task(&self, a: BlockId, b: BlockId) -> TaskId {
        let (mut a, mut b) = match (self.task_for(a), self.task_for(b)) {
            (Some(a), Some(b)) => (a, b),
            _ => return self.root_task(),
        };
        while self.tasks[a].depth > self.tasks[b].depth {
            a = self.parent_task(a).unwrap_or_else(|| self.root_task());
        }
        while self.tasks[b].depth > self.tasks[a].depth {
            b = self.parent_task(b).unwrap_or_else(|| self.root_task());
        }
        while a != b {
            a = self.parent_task(a).unwrap_or_else(|| self.root_task());
            b = self.parent_task(b).unwrap_or_else(|| self.root_task());
        }
        a
    }

    /// `task` itself if `block` is directly in it, otherwise the child of `task`
    /// that encloses `block`. `None` if `task` does not enclose `block`.
    pub fn sub_task_enclosing(&self, task: TaskId, block: BlockId) -> Option<TaskId> {
        let mut curr = self.task_for(block)?;
        loop {
            if curr == task {
                return Some(task);
            }
            let parent = self.parent_task(curr)?;
            if parent == task {
                return Some(curr);
            }
            curr = parent;
        }
    }

    /// Incoming edges of `spindle` as `(predecessor, incoming block)`.
    pub fn predecessors(&self, spindle: SpindleId) -> Vec<(SpindleId, BlockId)> {
        let mut preds = self
            .spindles
            .edges_directed(spindle, Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect::<Vec<_>>();
        preds.sort();
        preds
    }

    pub fn successors(&self, spindle: SpindleId) -> Vec<SpindleId> {
        let mut succs = self
            .spindles
            .neighbors_directed(spindle, Outgoing)
            .collect::<Vec<_>>();
        succs.sort();
        succs.dedup();
        succs
    }

    /// Whether the edge `spindle -> succ` enters a child task of the task of `spindle`.
    pub fn succ_in_sub_task(&self, spindle: SpindleId, succ: SpindleId) -> bool {
        self.parent_task(self.spindles[succ].task) == Some(self.spindles[spindle].task)
    }

    /// Spindles reachable from the root entry in reverse post-order,
    /// followed by unreachable spindles in index order.
    pub fn reverse_post_order(&self) -> Vec<SpindleId> {
        let start = self.tasks[self.root_task()].entry;
        let mut post_order = Vec::with_capacity(self.spindles.node_count());
        let mut dfs = DfsPostOrder::new(&self.spindles, start);
        while let Some(s) = dfs.next(&self.spindles) {
            post_order.push(s);
        }
        post_order.reverse();
        let mut seen = vec![false; self.spindles.node_count()];
        for s in &post_order {
            seen[s.index()] = true;
        }
        post_order.extend(self.spindles.node_indices().filter(|s| !seen[s.index()]));
        post_order
    }

    /// Spindles reachable from the root entry in depth-first pre-order.
    pub fn depth_first(&self) -> Vec<SpindleId> {
        let start = self.tasks[self.root_task()].entry;
        let mut order = Vec::new();
        let mut dfs = Dfs::new(&self.spindles, start);
        while let Some(s) = dfs.next(&self.spindles) {
            order.push(s);
        }
        order
    }

    /// Spindles of `task` reachable from its entry without leaving the task.
    pub fn depth_first_in_task(&self, task: TaskId) -> Vec<SpindleId> {
        let filtered = NodeFiltered::from_fn(&self.spindles, |s| self.spindles[s].task == task);
        let mut order = Vec::new();
        let mut dfs = Dfs::new(&filtered, self.tasks[task].entry);
        while let Some(s) = dfs.next(&filtered) {
            order.push(s);
        }
        order
    }

    /// `task` and all its descendants, in depth-first pre-order.
    pub fn task_and_descendants(&self, task: TaskId) -> Vec<TaskId> {
        let mut order = Vec::new();
        let mut dfs = Dfs::new(&self.tasks, task);
        while let Some(t) = dfs.next(&self.tasks) {
            order.push(t);
        }
        order
    }

    /// The spindle graph in dot format.
    pub fn dot(&self) -> String {
        format!(
            "{:?}",
            Dot::with_config(&self.spindles, &[Config::GraphContentOnly])
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDesc {
    #[serde(default)]
    pub parent: Option<usize>,
    #[serde(default)]
    pub detach: Option<DetachInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpindleDesc {
    pub task: usize,
    pub kind: SpindleKind,
    pub blocks: Vec<BlockId>,
    #[serde(default)]
    pub shared_eh: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpindleEdgeDesc {
    pub from: usize,
    pub to: usize,
    pub incoming: BlockId,
}

/// The serialized form. The first spindle listed for a task is its entry.
/// Without `edges`, the loader derives them from the CFG.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskInfoData {
    pub tasks: Vec<TaskDesc>,
    pub spindles: Vec<SpindleDesc>,
    #[serde(default)]
    pub edges: Vec<SpindleEdgeDesc>,
}

impl TryFrom<TaskInfoData> for TaskInfo {
    type Error = GraphError;

    fn try_from(data: TaskInfoData) -> Result<Self, Self::Error> {
        match data.tasks.first() {
            Some(root) if root.parent.is_none() && root.detach.is_none() => {}
            _ => return Err(GraphError::BadRoot),
        }
        let mut seen_blocks = FxHashMap::default();
        let mut first_spindle = vec![None; data.tasks.len()];
        for (index, desc) in data.spindles.iter().enumerate() {
            if desc.task >= data.tasks.len() {
                return Err(GraphError::DanglingIndex {
                    kind: "spindle",
                    index,
                    target: "task",
                    target_index: desc.task,
                });
            }
            if desc.blocks.is_empty() {
                return Err(GraphError::EmptySpindle(index));
            }
            for block in &desc.blocks {
                if seen_blocks.insert(*block, index).is_some() {
                    return Err(GraphError::DuplicateBlock {
                        kind: "spindle",
                        block: block.0,
                    });
                }
            }
            first_spindle[desc.task].get_or_insert(index);
        }
        let root_entry = first_spindle[0].ok_or(GraphError::EmptyTask(0))?;
        let mut info = TaskInfo::new(&data.spindles[root_entry].blocks);
        info.spindles[NodeIndex::new(0)].kind = data.spindles[root_entry].kind;
        let mut spindle_ids = vec![None; data.spindles.len()];
        spindle_ids[root_entry] = Some(NodeIndex::new(0));
        build_rest(info, &data, spindle_ids, &first_spindle)
    }
}

fn build_rest(
    mut info: TaskInfo,
    data: &TaskInfoData,
    mut spindle_ids: Vec<Option<SpindleId>>,
    first_spindle: &[Option<usize>],
) -> Result<TaskInfo, GraphError> {
    let mut task_ids = vec![info.root_task()];
    for (index, desc) in data.tasks.iter().enumerate().skip(1) {
        let parent = match desc.parent {
            Some(p) if p >= index => {
                return Err(GraphError::ParentOrder {
                    kind: "task",
                    index,
                    parent: p,
                })
            }
            Some(p) => task_ids[p],
            None => return Err(GraphError::BadRoot),
        };
        let detach = desc.detach.ok_or(GraphError::MissingDetach(index))?;
        let entry = first_spindle[index].ok_or(GraphError::EmptyTask(index))?;
        let entry_desc = &data.spindles[entry];
        let task = info.add_task_with_kind(parent, detach, entry_desc.kind, &entry_desc.blocks);
        spindle_ids[entry] = Some(info.tasks[task].entry);
        task_ids.push(task);
    }
    for (index, desc) in data.spindles.iter().enumerate() {
        if spindle_ids[index].is_none() {
            let task = task_ids[desc.task];
            spindle_ids[index] = Some(info.add_spindle(task, desc.kind, &desc.blocks));
        }
    }
    for (index, desc) in data.spindles.iter().enumerate() {
        if let Some(id) = spindle_ids[index] {
            info.set_shared_eh(id, desc.shared_eh);
        }
    }
    for (index, edge) in data.edges.iter().enumerate() {
        let lookup = |target_index: usize| {
            spindle_ids
                .get(target_index)
                .copied()
                .flatten()
                .ok_or(GraphError::DanglingIndex {
                    kind: "edge",
                    index,
                    target: "spindle",
                    target_index,
                })
        };
        let (from, to) = (lookup(edge.from)?, lookup(edge.to)?);
        info.add_spindle_edge(from, to, edge.incoming);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(i: u32) -> BlockId {
        BlockId(i)
    }

    /// entry(0) detaches 1, continues at 2, which syncs into 3.
    /// Task 1 detaches 4 (continuing at 5).
    fn nested() -> (TaskInfo, TaskId, TaskId) {
        let mut ti = TaskInfo::new(&[b(0)]);
        let root = ti.root_task();
        let t1 = ti.add_task(
            root,
            DetachInfo {
                detach: b(0),
                continuation: b(2),
                region: SyncRegion(0),
            },
            &[b(1)],
        );
        let t2 = ti.add_task(
            t1,
            DetachInfo {
                detach: b(1),
                continuation: b(5),
                region: SyncRegion(1),
            },
            &[b(4)],
        );
        ti.add_spindle(t1, SpindleKind::Phi, &[b(5)]);
        ti.add_spindle(root, SpindleKind::Phi, &[b(2)]);
        ti.add_spindle(root, SpindleKind::Sync, &[b(3)]);
        (ti, t1, t2)
    }

    #[test]
    fn test_task_tree_queries() {
        let (ti, t1, t2) = nested();
        let root = ti.root_task();
        assert_eq!(ti.num_tasks(), 3);
        assert_eq!(ti.task_for(b(4)), Some(t2));
        assert_eq!(ti.parent_task(t2), Some(t1));
        assert!(ti.encloses(t1, b(4)));
        assert!(ti.encloses(root, b(4)));
        assert!(!ti.encloses(t2, b(5)));
        assert_eq!(ti.enclosing_task(b(4), b(5)), t1);
        assert_eq!(ti.enclosing_task(b(4), b(2)), root);
        assert_eq!(ti.sub_task_enclosing(root, b(4)), Some(t1));
        assert_eq!(ti.sub_task_enclosing(root, b(2)), Some(root));
        assert_eq!(ti.sub_task_enclosing(t2, b(2)), None);
        assert_eq!(ti.task_entry_block(t1), b(1));
        assert_eq!(ti.task_and_descendants(t1), vec![t1, t2]);
    }

    #[test]
    fn test_task_info_from_data() {
        let json = r#"{
            "tasks": [
                {},
                {"parent": 0, "detach": {"detach": 0, "continuation": 2, "region": 0}}
            ],
            "spindles": [
                {"task": 0, "kind": "entry", "blocks": [0]},
                {"task": 1, "kind": "detach", "blocks": [1]},
                {"task": 0, "kind": "phi", "blocks": [2], "shared_eh": true}
            ],
            "edges": [
                {"from": 0, "to": 1, "incoming": 0},
                {"from": 0, "to": 2, "incoming": 0},
                {"from": 1, "to": 2, "incoming": 1}
            ]
        }"#;
        let ti: TaskInfo = serde_json::from_str(json).unwrap();
        let cont = ti.spindle_for(b(2)).unwrap();
        let detached = ti.spindle_for(b(1)).unwrap();
        assert!(ti.is_shared_eh(cont));
        assert_eq!(ti.predecessors(cont).len(), 2);
        assert!(ti.succ_in_sub_task(ti.spindle_for(b(0)).unwrap(), detached));
        assert!(!ti.succ_in_sub_task(detached, cont));
        assert_eq!(ti.reverse_post_order()[0], ti.spindle_for(b(0)).unwrap());

        let missing_detach = r#"{"tasks": [{}, {"parent": 0}],
            "spindles": [{"task": 0, "kind": "entry", "blocks": [0]},
                         {"task": 1, "kind": "detach", "blocks": [1]}]}"#;
        assert!(serde_json::from_str::<TaskInfo>(missing_detach).is_err());
    }
}
