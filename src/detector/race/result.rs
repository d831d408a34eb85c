//! Race records of one procedure and the queries over them.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use crate::analysis::alias::ModRef;
use crate::interest::memory::access::{GeneralAccess, MemAccessInfo};
use crate::ir::{Procedure, ValueId};

bitflags! {
    /// The kinds of race an access may take part in.
    #[derive(Default, Serialize)]
    #[serde(into = "String")]
    pub struct RaceType: u8 {
        /// With a logically parallel access in the same procedure.
        const LOCAL = 0b0001;
        /// With a read by an ancestor of the procedure.
        const VIA_ANCESTOR_REF = 0b0010;
        /// With a write by an ancestor of the procedure.
        const VIA_ANCESTOR_MOD = 0b0100;
        /// With some access that cannot be identified.
        const OPAQUE = 0b1000;
        const VIA_ANCESTOR = Self::VIA_ANCESTOR_REF.bits | Self::VIA_ANCESTOR_MOD.bits;
    }
}

impl RaceType {
    pub fn is_local(self) -> bool {
        self.contains(RaceType::LOCAL)
    }

    pub fn is_via_ancestor(self) -> bool {
        self.intersects(RaceType::VIA_ANCESTOR)
    }

    pub fn is_via_ancestor_ref(self) -> bool {
        self.contains(RaceType::VIA_ANCESTOR_REF)
    }

    pub fn is_via_ancestor_mod(self) -> bool {
        self.contains(RaceType::VIA_ANCESTOR_MOD)
    }

    pub fn is_opaque(self) -> bool {
        self.contains(RaceType::OPAQUE)
    }
}

impl fmt::Display for RaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }
        if self.is_local() {
            write!(f, "Local")?;
        }
        if self.is_via_ancestor() {
            if self.is_local() {
                write!(f, ", ")?;
            }
            write!(f, "Via Ancestor")?;
            if self.is_via_ancestor_mod() {
                write!(f, " Mod")?;
            }
            if self.is_via_ancestor_ref() {
                write!(f, " Ref")?;
            }
        }
        if self.is_opaque() {
            if self.is_local() || self.is_via_ancestor() {
                write!(f, ", ")?;
            }
            write!(f, "Opaque")?;
        }
        Ok(())
    }
}

impl From<RaceType> for String {
    fn from(rt: RaceType) -> Self {
        rt.to_string()
    }
}

/// How conservative a race finding is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RaceSeverity {
    None,
    Local,
    Ancestor,
    Opaque,
}

impl From<RaceType> for RaceSeverity {
    fn from(rt: RaceType) -> Self {
        if rt.is_opaque() {
            RaceSeverity::Opaque
        } else if rt.is_via_ancestor() {
            RaceSeverity::Ancestor
        } else if rt.is_local() {
            RaceSeverity::Local
        } else {
            RaceSeverity::None
        }
    }
}

/// One race finding of an access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaceData {
    pub access: GeneralAccess,
    pub race_type: RaceType,
    /// `None` when the other side is unknown.
    pub racer: Option<GeneralAccess>,
}

impl RaceData {
    pub fn ptr(&self) -> Option<ValueId> {
        self.access.ptr()
    }
}

/// The result of race detection on one procedure.
#[derive(Debug, Default)]
pub struct RaceInfo {
    results: BTreeMap<ValueId, Vec<RaceData>>,
    object_mod_ref: BTreeMap<ValueId, ModRef>,
    access_to_objs: BTreeMap<MemAccessInfo, BTreeSet<ValueId>>,
    inst_accesses: BTreeMap<ValueId, Vec<MemAccessInfo>>,
}

impl RaceInfo {
    pub(crate) fn new(
        access_to_objs: BTreeMap<MemAccessInfo, BTreeSet<ValueId>>,
        inst_accesses: BTreeMap<ValueId, Vec<MemAccessInfo>>,
    ) -> Self {
        Self {
            access_to_objs,
            inst_accesses,
            ..Self::default()
        }
    }

    fn record(
        &mut self,
        access: &GeneralAccess,
        race_type: RaceType,
        racer: Option<&GeneralAccess>,
    ) {
        let data = RaceData {
            access: *access,
            race_type,
            racer: racer.copied(),
        };
        let records = self.results.entry(access.inst).or_default();
        if !records.contains(&data) {
            records.push(data);
        }
    }

    pub(crate) fn record_local_race(&mut self, access: &GeneralAccess, racer: &GeneralAccess) {
        self.record(access, RaceType::LOCAL, Some(racer));
    }

    pub(crate) fn record_race_via_ancestor_ref(
        &mut self,
        access: &GeneralAccess,
        racer: Option<&GeneralAccess>,
    ) {
        self.record(access, RaceType::VIA_ANCESTOR_REF, racer);
    }

    pub(crate) fn record_race_via_ancestor_mod(
        &mut self,
        access: &GeneralAccess,
        racer: Option<&GeneralAccess>,
    ) {
        self.record(access, RaceType::VIA_ANCESTOR_MOD, racer);
    }

    pub(crate) fn record_opaque_race(
        &mut self,
        access: &GeneralAccess,
        racer: Option<&GeneralAccess>,
    ) {
        self.record(access, RaceType::OPAQUE, racer);
    }

    pub(crate) fn set_object_mod_ref(&mut self, obj: ValueId, mod_ref: ModRef) {
        *self.object_mod_ref.entry(obj).or_default() |= mod_ref;
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Operations with at least one race record, in id order.
    pub fn racing_instructions(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.results.keys().copied()
    }

    pub fn races_for(&self, inst: ValueId) -> &[RaceData] {
        self.results.get(&inst).map_or(&[], |r| r.as_slice())
    }

    pub fn race_type(&self, inst: ValueId) -> RaceType {
        self.races_for(inst)
            .iter()
            .fold(RaceType::empty(), |rt, data| rt | data.race_type)
    }

    pub fn might_race(&self, inst: ValueId) -> bool {
        !self.race_type(inst).is_empty()
    }

    pub fn might_race_locally(&self, inst: ValueId) -> bool {
        self.race_type(inst).is_local()
    }

    pub fn might_race_via_ancestor(&self, inst: ValueId) -> bool {
        self.race_type(inst).is_via_ancestor()
    }

    pub fn might_race_via_ancestor_ref(&self, inst: ValueId) -> bool {
        self.race_type(inst).is_via_ancestor_ref()
    }

    pub fn might_race_via_ancestor_mod(&self, inst: ValueId) -> bool {
        self.race_type(inst).is_via_ancestor_mod()
    }

    pub fn might_race_opaquely(&self, inst: ValueId) -> bool {
        self.race_type(inst).is_opaque()
    }

    pub fn overall_race_type(&self) -> RaceType {
        self.results
            .values()
            .flatten()
            .fold(RaceType::empty(), |rt, data| rt | data.race_type)
    }

    pub fn overall_severity(&self) -> RaceSeverity {
        self.overall_race_type().into()
    }

    /// Underlying objects of every located access of `inst`.
    pub fn objects_for(&self, inst: ValueId) -> BTreeSet<ValueId> {
        self.inst_accesses
            .get(&inst)
            .into_iter()
            .flatten()
            .flat_map(|access| self.objects_for_access(*access))
            .collect()
    }

    pub fn objects_for_access(&self, access: MemAccessInfo) -> impl Iterator<Item = ValueId> + '_ {
        self.access_to_objs.get(&access).into_iter().flatten().copied()
    }

    /// Accumulated mod/ref of races on `obj`; empty if it is not involved in any.
    pub fn object_mod_ref(&self, obj: ValueId) -> ModRef {
        self.object_mod_ref.get(&obj).copied().unwrap_or_default()
    }

    pub fn object_involved_in_race(&self, obj: ValueId) -> bool {
        self.object_mod_ref.contains_key(&obj)
    }

    pub fn objects_in_races(&self) -> impl Iterator<Item = (ValueId, ModRef)> + '_ {
        self.object_mod_ref.iter().map(|(obj, mr)| (*obj, *mr))
    }

    /// The text dump of the result, with values printed from `procedure`.
    pub fn display<'a>(&'a self, procedure: &'a Procedure) -> RaceInfoDisplay<'a> {
        RaceInfoDisplay {
            info: self,
            procedure,
        }
    }
}

pub struct RaceInfoDisplay<'a> {
    info: &'a RaceInfo,
    procedure: &'a Procedure,
}

impl fmt::Display for RaceInfoDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (info, procedure) = (self.info, self.procedure);
        if info.is_empty() {
            return writeln!(f, "No possible races");
        }
        writeln!(f, "Overall race type: {}", info.overall_race_type())?;
        for (inst, records) in &info.results {
            writeln!(f, "  Result: {}", procedure.display(*inst))?;
            for data in records {
                match data.ptr() {
                    Some(ptr) => writeln!(f, "    ptr: {}", procedure.display(ptr))?,
                    None => writeln!(f, "    nullptr")?,
                }
                write!(f, "      {}", data.race_type)?;
                match &data.racer {
                    Some(racer) => {
                        write!(f, "\n      Racer:")?;
                        write!(f, "\n        I = {}", procedure.display(racer.inst))?;
                        write!(f, "\n        Loc = ")?;
                        match racer.ptr() {
                            None => write!(f, "nullptr")?,
                            Some(ptr) if Some(ptr) == data.ptr() => write!(f, "same pointer")?,
                            Some(ptr) => write!(f, "{}", procedure.display(ptr))?,
                        }
                        write!(f, "\n        OperandNum = ")?;
                        match racer.operand {
                            Some(n) => write!(f, "{}", n)?,
                            None => write!(f, "none")?,
                        }
                        write!(
                            f,
                            "\n        ModRef = {}{}",
                            if racer.is_mod() { "Mod " } else { "" },
                            if racer.is_ref() { "Ref" } else { "" }
                        )?;
                    }
                    None => write!(f, "\n      Opaque racer")?,
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "Underlying objects of races:")?;
        for (obj, mr) in &info.object_mod_ref {
            write!(f, "{}\n   ", procedure.display(*obj))?;
            if mr.is_mod() {
                write!(f, " Mod")?;
            }
            if mr.is_ref() {
                write!(f, " Ref")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
