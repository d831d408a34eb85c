//! Load a subject (a procedure with its task graph, loops and oracle facts),
//! run the race detector on it and print the result.
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;
use thiserror::Error;

use crate::analysis::alias::{AliasTable, AliasTableData};
use crate::analysis::dependence::{DependenceTable, DependenceTableData};
use crate::analysis::loops::{LoopInfo, LoopInfoData};
use crate::analysis::taskinfo::{TaskInfo, TaskInfoData};
use crate::analysis::GraphError;
use crate::detector::race::{RaceDetector, RaceInfo, RaceSeverity};
use crate::detector::report::RaceReport;
use crate::interest::ignorelist::IgnoreList;
use crate::ir::{BlockId, Procedure, ProcedureData, ValueId, ValueKind};
use crate::options::{Options, OutputFormat};

#[derive(Debug, Error)]
pub enum SubjectError {
    #[error("cannot read subject {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed subject: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("inconsistent graph: {0}")]
    Graph(#[from] GraphError),

    #[error("{what} refers to missing value {value}")]
    MissingValue { what: String, value: u32 },

    #[error("{what} refers to missing block {block}")]
    MissingBlock { what: String, block: u32 },

    #[error("value {value} is listed in block {listed} but belongs to block {block}")]
    MisplacedInstruction { value: u32, listed: u32, block: u32 },
}

#[derive(Deserialize)]
struct SubjectData {
    procedure: ProcedureData,
    tasks: TaskInfoData,
    #[serde(default)]
    loops: LoopInfoData,
    #[serde(default)]
    alias: AliasTableData,
    #[serde(default)]
    dependence: DependenceTableData,
}

/// Everything the detector needs about one procedure.
#[derive(Debug)]
pub struct Subject {
    pub procedure: Procedure,
    pub task_info: TaskInfo,
    pub loops: LoopInfo,
    pub alias: AliasTable,
    pub dependence: DependenceTable,
}

impl Subject {
    pub fn from_file(path: &Path) -> Result<Self, SubjectError> {
        let text = fs::read_to_string(path).map_err(|source| SubjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SubjectError> {
        let data: SubjectData = serde_json::from_str(text)?;
        check_procedure(&data.procedure)?;
        check_graph_blocks(&data)?;

        let procedure = Procedure::from(data.procedure);
        let has_edges = !data.tasks.edges.is_empty();
        let mut task_info = TaskInfo::try_from(data.tasks)?;
        if !has_edges {
            task_info.link_spindles(&procedure);
        }
        Ok(Self {
            procedure,
            task_info,
            loops: LoopInfo::try_from(data.loops)?,
            alias: AliasTable::from(data.alias),
            dependence: DependenceTable::from(data.dependence),
        })
    }

    pub fn detect(&self, ignore_list: &IgnoreList, options: &Options) -> RaceInfo {
        let mut detector = RaceDetector::new(
            &self.procedure,
            &self.task_info,
            &self.loops,
            &self.alias,
            &self.dependence,
            ignore_list,
            options.to_config(),
        );
        detector.detect()
    }
}

/// Reject indices that would dangle once the def-use index is built.
fn check_procedure(data: &ProcedureData) -> Result<(), SubjectError> {
    let num_values = data.values.len() as u32;
    let num_blocks = data.blocks.len() as u32;
    let value = |what: &str, id: ValueId| {
        if id.0 < num_values {
            Ok(())
        } else {
            Err(SubjectError::MissingValue {
                what: what.to_owned(),
                value: id.0,
            })
        }
    };
    let block = |what: &str, id: BlockId| {
        if id.0 < num_blocks {
            Ok(())
        } else {
            Err(SubjectError::MissingBlock {
                what: what.to_owned(),
                block: id.0,
            })
        }
    };
    for (idx, b) in data.blocks.iter().enumerate() {
        let what = format!("block `{}`", b.name);
        for id in &b.insts {
            value(&what, *id)?;
            match &data.values[id.index()].kind {
                ValueKind::Instruction(inst) if inst.block.index() == idx => {}
                ValueKind::Instruction(inst) => {
                    return Err(SubjectError::MisplacedInstruction {
                        value: id.0,
                        listed: idx as u32,
                        block: inst.block.0,
                    })
                }
                _ => return Err(SubjectError::MissingValue { what, value: id.0 }),
            }
        }
        for succ in b.terminator.successors() {
            block(&what, succ)?;
        }
    }
    for (idx, v) in data.values.iter().enumerate() {
        if let ValueKind::Instruction(inst) = &v.kind {
            let what = format!("value {}", idx);
            block(&what, inst.block)?;
            for op in inst.operands() {
                value(&what, op)?;
            }
        }
    }
    Ok(())
}

/// Every block named by the task graph or the loop forest must exist.
fn check_graph_blocks(data: &SubjectData) -> Result<(), SubjectError> {
    let num_blocks = data.procedure.blocks.len() as u32;
    let spindle_blocks = data
        .tasks
        .spindles
        .iter()
        .flat_map(|s| s.blocks.iter().map(|b| ("spindle", *b)));
    let detach_blocks = data
        .tasks
        .tasks
        .iter()
        .filter_map(|t| t.detach)
        .flat_map(|d| [("detach", d.detach), ("detach", d.continuation)]);
    let edge_blocks = data
        .tasks
        .edges
        .iter()
        .map(|e| ("spindle edge", e.incoming));
    let loop_blocks = data
        .loops
        .loops
        .iter()
        .flat_map(|l| l.blocks.iter().chain([&l.header]).map(|b| ("loop", *b)));
    for (what, block) in spindle_blocks
        .chain(detach_blocks)
        .chain(edge_blocks)
        .chain(loop_blocks)
    {
        if block.0 >= num_blocks {
            return Err(SubjectError::MissingBlock {
                what: what.to_owned(),
                block: block.0,
            });
        }
    }
    Ok(())
}

pub struct RaceBudCallbacks {
    options: Options,
    ignore_list: IgnoreList,
}

impl RaceBudCallbacks {
    pub fn new(options: Options) -> Result<Self, Box<dyn Error>> {
        let ignore_list = IgnoreList::from_files(&options.ignore_lists)?;
        if !ignore_list.is_empty() {
            info!("Loaded ignore lists: {:?}", options.ignore_lists);
        }
        Ok(Self {
            options,
            ignore_list,
        })
    }

    /// Analyze the input subject and print the result; returns the overall severity.
    pub fn run(&self) -> Result<RaceSeverity, Box<dyn Error>> {
        let path = self.options.input.as_deref().ok_or("NoInputSubject")?;
        info!("Processing input file: {}", path.display());
        let subject = Subject::from_file(path)?;
        info!(
            "{}: {} blocks, {} tasks, {} loops",
            subject.procedure.name(),
            subject.procedure.num_blocks(),
            subject.task_info.num_tasks(),
            subject.loops.num_loops()
        );
        debug!("Spindle graph:\n{}", subject.task_info.dot());
        let race_info = subject.detect(&self.ignore_list, &self.options);
        println!("{}", self.render(&race_info, &subject.procedure)?);
        info!("Overall race type: {}", race_info.overall_race_type());
        Ok(race_info.overall_severity())
    }

    fn render(
        &self,
        race_info: &RaceInfo,
        procedure: &Procedure,
    ) -> Result<String, Box<dyn Error>> {
        Ok(match self.options.format() {
            OutputFormat::Text => race_info.display(procedure).to_string(),
            OutputFormat::Json => {
                serde_json::to_string_pretty(&RaceReport::new(race_info, procedure))?
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: &str = r#"{
        "procedure": {
            "name": "spawn",
            "values": [
                {"name": "x", "kind": {"instruction": {
                    "block": 0, "ty": "ptr", "kind": {"op": "alloca"}}}},
                {"kind": {"constant": {"int": 1}}},
                {"kind": {"instruction": {
                    "block": 1, "ty": "void", "kind": {"op": "store", "value": 1, "ptr": 0}}}},
                {"kind": {"instruction": {
                    "block": 2, "ty": "int", "kind": {"op": "load", "ptr": 0}}}}
            ],
            "blocks": [
                {"name": "entry", "insts": [0], "terminator": {
                    "op": "detach", "region": 0, "detached": 1, "continuation": 2}},
                {"name": "body", "insts": [2], "terminator": {
                    "op": "reattach", "region": 0, "continuation": 2}},
                {"name": "cont", "insts": [3], "terminator": {
                    "op": "sync", "region": 0, "target": 3}},
                {"name": "exit", "terminator": {"op": "ret"}}
            ]
        },
        "tasks": {
            "tasks": [
                {},
                {"parent": 0, "detach": {"detach": 0, "continuation": 2, "region": 0}}
            ],
            "spindles": [
                {"task": 0, "kind": "entry", "blocks": [0]},
                {"task": 1, "kind": "detach", "blocks": [1]},
                {"task": 0, "kind": "phi", "blocks": [2]},
                {"task": 0, "kind": "sync", "blocks": [3]}
            ]
        }
    }"#;

    fn options(flags: &str) -> Options {
        Options::parse_from_str(flags).unwrap()
    }

    #[test]
    fn test_subject_from_json() {
        let subject = Subject::from_json(SUBJECT).unwrap();
        assert_eq!(subject.procedure.num_blocks(), 4);
        assert_eq!(subject.task_info.num_tasks(), 2);
        assert_eq!(subject.task_info.num_spindle_edges(), 4);

        let info = subject.detect(&IgnoreList::new(), &options(""));
        assert!(info.might_race_locally(ValueId(2)));
        assert!(info.might_race_locally(ValueId(3)));
    }

    #[test]
    fn test_render() {
        let subject = Subject::from_json(SUBJECT).unwrap();
        let callbacks = RaceBudCallbacks::new(options("-f json")).unwrap();
        let info = subject.detect(&callbacks.ignore_list, &callbacks.options);
        let json = callbacks.render(&info, &subject.procedure).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["overall_race_type"], "Local");
        assert_eq!(value["races"].as_array().unwrap().len(), 2);
        assert_eq!(value["races"][0]["DeterminacyRace"]["possibility"], "Probably");
    }

    #[test]
    fn test_inconsistent_subject() {
        let bad_value = SUBJECT.replace(r#""ptr": 0}}}}"#, r#""ptr": 9}}}}"#);
        assert!(matches!(
            Subject::from_json(&bad_value),
            Err(SubjectError::MissingValue { value: 9, .. })
        ));
        let bad_block = SUBJECT.replace(r#""blocks": [3]"#, r#""blocks": [7]"#);
        assert!(matches!(
            Subject::from_json(&bad_block),
            Err(SubjectError::MissingBlock { block: 7, .. })
        ));
        let bad_incoming = SUBJECT.replace(
            r#""tasks": {"#,
            r#""tasks": {"edges": [{"from": 0, "to": 1, "incoming": 99}],"#,
        );
        assert!(matches!(
            Subject::from_json(&bad_incoming),
            Err(SubjectError::MissingBlock { block: 99, .. })
        ));
        let bad_continuation = SUBJECT.replace(
            r#""continuation": 2, "region""#,
            r#""continuation": 42, "region""#,
        );
        assert!(matches!(
            Subject::from_json(&bad_continuation),
            Err(SubjectError::MissingBlock { block: 42, .. })
        ));
        assert!(matches!(Subject::from_json("{"), Err(SubjectError::Parse(_))));
    }
}
