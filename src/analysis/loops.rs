//! The loop forest of a procedure.
//! Loops are nodes of a petgraph `Graph` with edges from a parent loop to its
//! subloops. Depth starts at 1 for outermost loops; a block outside every loop
//! has depth 0.
use petgraph::graph::NodeIndex;
use petgraph::Direction::Incoming;
use petgraph::{Directed, Graph};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use super::GraphError;
use crate::ir::BlockId;

/// The NodeIndex in the loop forest, denoting a unique loop.
pub type LoopId = NodeIndex;

#[derive(Debug)]
pub struct Loop {
    pub header: BlockId,
    pub depth: usize,
    blocks: FxHashSet<BlockId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(try_from = "LoopInfoData")]
pub struct LoopInfo {
    forest: Graph<Loop, (), Directed>,
    innermost: FxHashMap<BlockId, LoopId>,
}

impl LoopInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loop nested in `parent`. The blocks are added to every enclosing loop as well.
    pub fn add_loop(
        &mut self,
        parent: Option<LoopId>,
        header: BlockId,
        blocks: &[BlockId],
    ) -> LoopId {
        let depth = parent.map_or(1, |p| self.forest[p].depth + 1);
        let mut members: FxHashSet<BlockId> = blocks.iter().copied().collect();
        members.insert(header);
        let id = self.forest.add_node(Loop {
            header,
            depth,
            blocks: members.clone(),
        });
        if let Some(parent) = parent {
            self.forest.add_edge(parent, id, ());
        }
        let mut ancestor = parent;
        while let Some(a) = ancestor {
            self.forest[a].blocks.extend(members.iter().copied());
            ancestor = self.parent(a);
        }
        for block in members {
            match self.innermost.get(&block) {
                Some(old) if self.forest[*old].depth >= depth => {}
                _ => {
                    self.innermost.insert(block, id);
                }
            }
        }
        id
    }

    /// The innermost loop containing `block`.
    pub fn loop_for(&self, block: BlockId) -> Option<LoopId> {
        self.innermost.get(&block).copied()
    }

    pub fn depth(&self, l: LoopId) -> usize {
        self.forest[l].depth
    }

    /// The loop depth of `block`, 0 outside every loop.
    pub fn loop_depth(&self, block: BlockId) -> usize {
        self.loop_for(block).map_or(0, |l| self.depth(l))
    }

    pub fn parent(&self, l: LoopId) -> Option<LoopId> {
        self.forest.neighbors_directed(l, Incoming).next()
    }

    pub fn header(&self, l: LoopId) -> BlockId {
        self.forest[l].header
    }

    pub fn contains(&self, l: LoopId, block: BlockId) -> bool {
        self.forest[l].blocks.contains(&block)
    }

    /// The loop whose header is `block`.
    pub fn loop_with_header(&self, block: BlockId) -> Option<LoopId> {
        self.loop_for(block).filter(|l| self.header(*l) == block)
    }

    /// `l` and its ancestors, innermost first.
    pub fn loop_nest(&self, l: LoopId) -> Vec<LoopId> {
        let mut nest = vec![l];
        let mut curr = l;
        while let Some(parent) = self.parent(curr) {
            nest.push(parent);
            curr = parent;
        }
        nest
    }

    /// The deepest loop containing both loops.
    pub fn common_loop_of_loops(&self, a: Option<LoopId>, b: Option<LoopId>) -> Option<LoopId> {
        let (mut a, mut b) = (a?, b?);
        while self.depth(a) > self.depth(b) {
            a = self.parent(a)?;
        }
        while self.depth(b) > self.depth(a) {
            b = self.parent(b)?;
        }
        while a != b {
            a = self.parent(a)?;
            b = self.parent(b)?;
        }
        Some(a)
    }

    /// The deepest loop containing both blocks.
    pub fn common_loop(&self, a: BlockId, b: BlockId) -> Option<LoopId> {
        self.common_loop_of_loops(self.loop_for(a), self.loop_for(b))
    }

    /// The deepest loop containing both `l` and `block`.
    pub fn common_loop_with(&self, l: Option<LoopId>, block: BlockId) -> Option<LoopId> {
        self.common_loop_of_loops(l, self.loop_for(block))
    }

    pub fn num_loops(&self) -> usize {
        self.forest.node_count()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoopDesc {
    pub header: BlockId,
    #[serde(default)]
    pub blocks: Vec<BlockId>,
    /// Index of the parent loop in the list.
    #[serde(default)]
    pub parent: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoopInfoData {
    #[serde(default)]
    pub loops: Vec<LoopDesc>,
}

impl TryFrom<LoopInfoData> for LoopInfo {
    type Error = GraphError;

    fn try_from(data: LoopInfoData) -> Result<Self, Self::Error> {
        let mut info = LoopInfo::new();
        let mut ids = Vec::with_capacity(data.loops.len());
        for (index, desc) in data.loops.iter().enumerate() {
            let parent = match desc.parent {
                Some(p) if p >= index => {
                    return Err(GraphError::ParentOrder {
                        kind: "loop",
                        index,
                        parent: p,
                    })
                }
                Some(p) => Some(ids[p]),
                None => None,
            };
            ids.push(info.add_loop(parent, desc.header, &desc.blocks));
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(i: u32) -> BlockId {
        BlockId(i)
    }

    #[test]
    fn test_loop_nest_queries() {
        let mut loops = LoopInfo::new();
        let outer = loops.add_loop(None, b(1), &[b(1), b(2), b(5)]);
        let inner = loops.add_loop(Some(outer), b(2), &[b(2), b(3)]);
        let sibling = loops.add_loop(Some(outer), b(5), &[b(5), b(6)]);

        assert_eq!(loops.loop_for(b(3)), Some(inner));
        assert_eq!(loops.loop_for(b(1)), Some(outer));
        assert_eq!(loops.loop_for(b(0)), None);
        assert_eq!(loops.loop_depth(b(3)), 2);
        assert_eq!(loops.loop_depth(b(0)), 0);
        // Blocks of subloops belong to the parent too.
        assert!(loops.contains(outer, b(6)));
        assert!(!loops.contains(inner, b(6)));
        assert_eq!(loops.common_loop(b(3), b(6)), Some(outer));
        assert_eq!(loops.common_loop(b(3), b(2)), Some(inner));
        assert_eq!(loops.common_loop(b(3), b(0)), None);
        assert_eq!(loops.common_loop_with(Some(sibling), b(1)), Some(outer));
        assert_eq!(loops.loop_with_header(b(2)), Some(inner));
        assert_eq!(loops.loop_with_header(b(3)), None);
        assert_eq!(loops.loop_nest(inner), vec![inner, outer]);
    }

    #[test]
    fn test_loop_info_from_data() {
        let json = r#"{"loops": [
            {"header": 1, "blocks": [1, 2, 3]},
            {"header": 2, "blocks": [2, 3], "parent": 0}
        ]}"#;
        let loops: LoopInfo = serde_json::from_str(json).unwrap();
        assert_eq!(loops.num_loops(), 2);
        assert_eq!(loops.loop_depth(BlockId(3)), 2);

        let bad = r#"{"loops": [{"header": 1, "parent": 0}]}"#;
        assert!(serde_json::from_str::<LoopInfo>(bad).is_err());
    }
}
