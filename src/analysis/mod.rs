//! Analyses consumed by the race detector.
//! `taskinfo` and `loops` describe the structure of the procedure,
//! `alias` and `dependence` are the oracles,
//! `objects` resolves underlying objects and answers capture queries,
//! and `mpt` computes the maybe-parallel tasks of every spindle.
pub mod alias;
pub mod dependence;
pub mod loops;
pub mod mpt;
pub mod objects;
pub mod taskinfo;

use thiserror::Error;

/// Inconsistencies found while building a task graph or loop forest
/// from its serialized description.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{kind} {index} refers to missing {target} {target_index}")]
    DanglingIndex {
        kind: &'static str,
        index: usize,
        target: &'static str,
        target_index: usize,
    },
    #[error("{kind} {index} must be declared after its parent {parent}")]
    ParentOrder {
        kind: &'static str,
        index: usize,
        parent: usize,
    },
    #[error("the first task must be the root task without a detach")]
    BadRoot,
    #[error("task {0} has no detach")]
    MissingDetach(usize),
    #[error("task {0} has no spindle")]
    EmptyTask(usize),
    #[error("spindle {0} has no block")]
    EmptySpindle(usize),
    #[error("block {block} is listed in more than one {kind}")]
    DuplicateBlock { kind: &'static str, block: u32 },
}
