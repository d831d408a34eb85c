//! Reports for race findings.
//! ReportContent includes bug kind, possibility, diagnosis, and explanation.
//! One report is issued per race record; a `RaceReport` collects the reports
//! of a procedure together with the objects involved in races.
use serde::Serialize;

use crate::analysis::alias::ModRef;
use crate::detector::race::{RaceData, RaceInfo, RaceSeverity, RaceType};
use crate::interest::memory::access::GeneralAccess;
use crate::ir::Procedure;

#[derive(Debug, Serialize)]
pub struct ReportContent<D> {
    pub bug_kind: String,
    pub possibility: String,
    pub diagnosis: D,
    pub explanation: String,
}

impl<D: std::fmt::Debug> ReportContent<D> {
    pub fn new(bug_kind: String, possibility: String, diagnosis: D, explanation: String) -> Self {
        Self {
            bug_kind,
            possibility,
            diagnosis,
            explanation,
        }
    }
}

#[derive(Debug, Serialize)]
pub enum Report {
    DeterminacyRace(ReportContent<RaceDiagnosis>),
}

/// An access, with values rendered as text.
#[derive(Debug, Serialize)]
pub struct AccessDiagnosis {
    pub inst: String,
    pub ptr: Option<String>,
    pub operand: Option<usize>,
    pub mod_ref: ModRef,
}

impl AccessDiagnosis {
    fn new(access: &GeneralAccess, procedure: &Procedure) -> Self {
        Self {
            inst: procedure.display(access.inst).to_string(),
            ptr: access.ptr().map(|ptr| procedure.display(ptr).to_string()),
            operand: access.operand,
            mod_ref: access.mod_ref,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RaceDiagnosis {
    pub access: AccessDiagnosis,
    pub race_type: RaceType,
    /// Absent when the other side is unknown.
    pub racer: Option<AccessDiagnosis>,
}

#[derive(Debug, Serialize)]
pub struct ObjectDiagnosis {
    pub object: String,
    pub mod_ref: ModRef,
}

/// The serializable result of one procedure.
#[derive(Debug, Serialize)]
pub struct RaceReport {
    pub procedure: String,
    pub overall_race_type: RaceType,
    pub severity: RaceSeverity,
    pub races: Vec<Report>,
    pub objects: Vec<ObjectDiagnosis>,
}

fn possibility(race_type: RaceType) -> &'static str {
    match RaceSeverity::from(race_type) {
        RaceSeverity::Local => "Probably",
        _ => "Possibly",
    }
}

fn explanation(race_type: RaceType) -> &'static str {
    if race_type.is_local() {
        "The access and its racer may run in parallel in this procedure and may touch \
         the same memory, and at least one of them writes."
    } else if race_type.is_via_ancestor_mod() || race_type.is_via_ancestor_ref() {
        "The access touches memory visible to the caller, which may access it in \
         parallel with this procedure."
    } else {
        "The access touches memory that code not visible to the analysis may access in parallel."
    }
}

impl Report {
    fn new(data: &RaceData, procedure: &Procedure) -> Self {
        let diagnosis = RaceDiagnosis {
            access: AccessDiagnosis::new(&data.access, procedure),
            race_type: data.race_type,
            racer: data.racer.as_ref().map(|racer| AccessDiagnosis::new(racer, procedure)),
        };
        Report::DeterminacyRace(ReportContent::new(
            "DeterminacyRace".to_owned(),
            possibility(data.race_type).to_owned(),
            diagnosis,
            explanation(data.race_type).to_owned(),
        ))
    }
}

impl RaceReport {
    pub fn new(info: &RaceInfo, procedure: &Procedure) -> Self {
        let races = info
            .racing_instructions()
            .flat_map(|inst| info.races_for(inst))
            .map(|data| Report::new(data, procedure))
            .collect();
        let objects = info
            .objects_in_races()
            .map(|(obj, mod_ref)| ObjectDiagnosis {
                object: procedure.display(obj).to_string(),
                mod_ref,
            })
            .collect();
        Self {
            procedure: procedure.name().to_owned(),
            overall_race_type: info.overall_race_type(),
            severity: info.overall_severity(),
            races,
            objects,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_possibility() {
        assert_eq!(possibility(RaceType::LOCAL), "Probably");
        assert_eq!(possibility(RaceType::LOCAL | RaceType::OPAQUE), "Possibly");
        assert_eq!(possibility(RaceType::VIA_ANCESTOR_MOD), "Possibly");
    }

    #[test]
    fn test_empty_report() {
        let procedure = crate::ir::ProcedureBuilder::new("f").finish();
        let report = RaceReport::new(&RaceInfo::default(), &procedure);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["procedure"], "f");
        assert_eq!(json["overall_race_type"], "None");
        assert_eq!(json["severity"], "None");
        assert!(json["races"].as_array().unwrap().is_empty());
    }
}
