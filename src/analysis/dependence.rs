//! The dependence-analysis oracle.
//! A `Dependence` reports, per common loop level (1 = outermost), the possible
//! directions of the dependence and whether it is scalar at that level.
use bitflags::bitflags;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::ir::ValueId;

bitflags! {
    /// Direction vector entry of one loop level.
    #[derive(Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct Direction: u8 {
        const LT = 0b001;
        const EQ = 0b010;
        const GT = 0b100;
        const LE = Self::LT.bits | Self::EQ.bits;
        const NE = Self::LT.bits | Self::GT.bits;
        const GE = Self::EQ.bits | Self::GT.bits;
        const ALL = Self::LT.bits | Self::EQ.bits | Self::GT.bits;
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::ALL
    }
}

impl TryFrom<String> for Direction {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "*" => return Ok(Direction::ALL),
            "none" => return Ok(Direction::empty()),
            _ => {}
        }
        let mut dir = Direction::empty();
        for c in s.chars() {
            dir |= match c {
                '<' => Direction::LT,
                '=' => Direction::EQ,
                '>' => Direction::GT,
                _ => return Err(format!("unknown direction `{}`", s)),
            };
        }
        Ok(dir)
    }
}

impl From<Direction> for String {
    fn from(dir: Direction) -> Self {
        if dir == Direction::ALL {
            return "*".to_owned();
        }
        if dir.is_empty() {
            return "none".to_owned();
        }
        let mut s = String::new();
        if dir.contains(Direction::LT) {
            s.push('<');
        }
        if dir.contains(Direction::EQ) {
            s.push('=');
        }
        if dir.contains(Direction::GT) {
            s.push('>');
        }
        s
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependenceKind {
    Flow,
    Anti,
    Output,
    Input,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependenceLevel {
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub scalar: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependence {
    pub kind: DependenceKind,
    #[serde(default)]
    pub levels: Vec<DependenceLevel>,
}

impl Dependence {
    /// A dependence about which nothing is known.
    pub fn confused(kind: DependenceKind) -> Self {
        Self {
            kind,
            levels: Vec::new(),
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Direction at `level`, counted from 1. Unknown levels allow every direction.
    pub fn direction(&self, level: usize) -> Direction {
        self.level(level).map_or(Direction::ALL, |l| l.direction)
    }

    pub fn is_scalar(&self, level: usize) -> bool {
        self.level(level).map_or(false, |l| l.scalar)
    }

    fn level(&self, level: usize) -> Option<&DependenceLevel> {
        level.checked_sub(1).and_then(|idx| self.levels.get(idx))
    }
}

pub trait DependenceOracle {
    /// The dependence from `src` to `dst`, `None` if they are independent.
    fn depends(&self, src: ValueId, dst: ValueId) -> Option<Dependence>;
}

/// Facts-driven dependence oracle.
/// Pairs are unordered; unknown pairs are dependent at every level.
#[derive(Debug, Default, Deserialize)]
#[serde(from = "DependenceTableData")]
pub struct DependenceTable {
    entries: FxHashMap<(ValueId, ValueId), Option<Dependence>>,
}

fn ordered(a: ValueId, b: ValueId) -> (ValueId, ValueId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl DependenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_independent(&mut self, a: ValueId, b: ValueId) {
        self.entries.insert(ordered(a, b), None);
    }

    pub fn set_dependence(&mut self, a: ValueId, b: ValueId, dependence: Dependence) {
        self.entries.insert(ordered(a, b), Some(dependence));
    }
}

impl DependenceOracle for DependenceTable {
    fn depends(&self, src: ValueId, dst: ValueId) -> Option<Dependence> {
        match self.entries.get(&ordered(src, dst)) {
            Some(entry) => entry.clone(),
            None => Some(Dependence::confused(DependenceKind::Output)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependenceDesc {
    pub src: ValueId,
    pub dst: ValueId,
    /// `None` marks the pair independent.
    #[serde(default)]
    pub dependence: Option<Dependence>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependenceTableData {
    pub pairs: Vec<DependenceDesc>,
}

impl From<DependenceTableData> for DependenceTable {
    fn from(data: DependenceTableData) -> Self {
        let mut table = DependenceTable::new();
        for desc in data.pairs {
            match desc.dependence {
                Some(dep) => table.set_dependence(desc.src, desc.dst, dep),
                None => table.set_independent(desc.src, desc.dst),
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependence_levels() {
        let dep = Dependence {
            kind: DependenceKind::Flow,
            levels: vec![
                DependenceLevel {
                    direction: Direction::EQ,
                    scalar: false,
                },
                DependenceLevel {
                    direction: Direction::LT,
                    scalar: true,
                },
            ],
        };
        assert_eq!(dep.direction(1), Direction::EQ);
        assert!(dep.is_scalar(2));
        assert_eq!(dep.direction(3), Direction::ALL);
        assert!(!dep.is_scalar(0));
        assert!(dep.direction(2).intersects(!Direction::EQ));
    }

    #[test]
    fn test_dependence_table() {
        let json = r#"{"pairs": [
            {"src": 1, "dst": 2},
            {"src": 4, "dst": 3, "dependence": {
                "kind": "output",
                "levels": [{"direction": "="}, {"direction": "<=", "scalar": true}]
            }}
        ]}"#;
        let table: DependenceTable = serde_json::from_str(json).unwrap();
        assert!(table.depends(ValueId(2), ValueId(1)).is_none());
        let dep = table.depends(ValueId(3), ValueId(4)).unwrap();
        assert_eq!(dep.direction(2), Direction::LE);
        assert!(table.depends(ValueId(5), ValueId(6)).is_some());
    }
}
