//! The alias-analysis oracle.
//! The detector only asks the questions in `AliasOracle`; `AliasTable` answers
//! them from explicit facts and falls back to the most conservative answer
//! for everything it was not told.
use std::fmt;

use bitflags::bitflags;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::ir::ValueId;

bitflags! {
    /// Whether an operation may read (`REF`) or write (`MOD`) some memory.
    #[derive(Default, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct ModRef: u8 {
        const REF = 0b01;
        const MOD = 0b10;
        const MOD_REF = Self::REF.bits | Self::MOD.bits;
    }
}

impl ModRef {
    pub fn is_mod(self) -> bool {
        self.contains(ModRef::MOD)
    }

    pub fn is_ref(self) -> bool {
        self.contains(ModRef::REF)
    }
}

impl fmt::Display for ModRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match (self.is_mod(), self.is_ref()) {
            (true, true) => "mod_ref",
            (true, false) => "mod",
            (false, true) => "ref",
            (false, false) => "none",
        };
        write!(f, "{}", s)
    }
}

impl TryFrom<String> for ModRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "none" => Ok(ModRef::empty()),
            "ref" => Ok(ModRef::REF),
            "mod" => Ok(ModRef::MOD),
            "mod_ref" => Ok(ModRef::MOD_REF),
            _ => Err(format!("unknown mod/ref `{}`", s)),
        }
    }
}

impl From<ModRef> for String {
    fn from(mr: ModRef) -> Self {
        mr.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasResult {
    NoAlias,
    MayAlias,
    MustAlias,
}

/// A pointer plus the number of bytes accessed through it; `None` means unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryLocation {
    pub ptr: ValueId,
    pub size: Option<u64>,
}

impl MemoryLocation {
    pub fn new(ptr: ValueId, size: Option<u64>) -> Self {
        Self { ptr, size }
    }

    /// The location of anything before or after `ptr`.
    pub fn unknown_size(ptr: ValueId) -> Self {
        Self { ptr, size: None }
    }
}

/// Memory effects of a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEffects {
    pub mod_ref: ModRef,
    /// The call only touches memory pointed to by its arguments.
    #[serde(default)]
    pub only_arg_memory: bool,
}

impl MemoryEffects {
    pub fn unknown() -> Self {
        Self {
            mod_ref: ModRef::MOD_REF,
            only_arg_memory: false,
        }
    }

    pub fn does_not_access_memory(&self) -> bool {
        self.mod_ref.is_empty()
    }
}

pub trait AliasOracle {
    fn alias(&self, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult;

    fn points_to_constant_memory(&self, loc: &MemoryLocation) -> bool;

    fn memory_effects(&self, call: ValueId) -> MemoryEffects;

    /// Mod/ref of `call` on the memory of its argument `arg`.
    fn arg_mod_ref(&self, call: ValueId, arg: usize) -> ModRef;

    /// Mod/ref of the operation `inst` on `loc`.
    fn mod_ref_info(&self, inst: ValueId, loc: &MemoryLocation) -> ModRef;
}

/// Facts-driven alias oracle.
#[derive(Debug, Default, Deserialize)]
#[serde(from = "AliasTableData")]
pub struct AliasTable {
    no_alias: FxHashSet<(ValueId, ValueId)>,
    must_alias: FxHashSet<(ValueId, ValueId)>,
    constant_memory: FxHashSet<ValueId>,
    effects: FxHashMap<ValueId, MemoryEffects>,
    arg_mod_ref: FxHashMap<(ValueId, usize), ModRef>,
    mod_ref: FxHashMap<(ValueId, ValueId), ModRef>,
}

fn ordered(a: ValueId, b: ValueId) -> (ValueId, ValueId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_no_alias(&mut self, a: ValueId, b: ValueId) {
        self.no_alias.insert(ordered(a, b));
    }

    pub fn set_must_alias(&mut self, a: ValueId, b: ValueId) {
        self.must_alias.insert(ordered(a, b));
    }

    pub fn set_constant_memory(&mut self, ptr: ValueId) {
        self.constant_memory.insert(ptr);
    }

    pub fn set_effects(&mut self, call: ValueId, effects: MemoryEffects) {
        self.effects.insert(call, effects);
    }

    pub fn set_arg_mod_ref(&mut self, call: ValueId, arg: usize, mod_ref: ModRef) {
        self.arg_mod_ref.insert((call, arg), mod_ref);
    }

    pub fn set_mod_ref(&mut self, inst: ValueId, ptr: ValueId, mod_ref: ModRef) {
        self.mod_ref.insert((inst, ptr), mod_ref);
    }
}

impl AliasOracle for AliasTable {
    fn alias(&self, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        if a.ptr == b.ptr {
            return AliasResult::MustAlias;
        }
        let key = ordered(a.ptr, b.ptr);
        if self.no_alias.contains(&key) {
            AliasResult::NoAlias
        } else if self.must_alias.contains(&key) {
            AliasResult::MustAlias
        } else {
            AliasResult::MayAlias
        }
    }

    fn points_to_constant_memory(&self, loc: &MemoryLocation) -> bool {
        self.constant_memory.contains(&loc.ptr)
    }

    fn memory_effects(&self, call: ValueId) -> MemoryEffects {
        self.effects
            .get(&call)
            .copied()
            .unwrap_or_else(MemoryEffects::unknown)
    }

    fn arg_mod_ref(&self, call: ValueId, arg: usize) -> ModRef {
        self.arg_mod_ref
            .get(&(call, arg))
            .copied()
            .unwrap_or_else(|| self.memory_effects(call).mod_ref)
    }

    fn mod_ref_info(&self, inst: ValueId, loc: &MemoryLocation) -> ModRef {
        match self.mod_ref.get(&(inst, loc.ptr)) {
            Some(mr) => *mr,
            None => self
                .effects
                .get(&inst)
                .map_or(ModRef::MOD_REF, |effects| effects.mod_ref),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallEffectsDesc {
    pub call: ValueId,
    #[serde(flatten)]
    pub effects: MemoryEffects,
    /// Per-argument mod/ref, indexed by argument position.
    #[serde(default)]
    pub args: Vec<Option<ModRef>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModRefDesc {
    pub inst: ValueId,
    pub ptr: ValueId,
    pub mod_ref: ModRef,
}

/// The serialized form of an `AliasTable`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasTableData {
    pub no_alias: Vec<(ValueId, ValueId)>,
    pub must_alias: Vec<(ValueId, ValueId)>,
    pub constant_memory: Vec<ValueId>,
    pub calls: Vec<CallEffectsDesc>,
    pub mod_ref: Vec<ModRefDesc>,
}

impl From<AliasTableData> for AliasTable {
    fn from(data: AliasTableData) -> Self {
        let mut table = AliasTable::new();
        for (a, b) in data.no_alias {
            table.set_no_alias(a, b);
        }
        for (a, b) in data.must_alias {
            table.set_must_alias(a, b);
        }
        for ptr in data.constant_memory {
            table.set_constant_memory(ptr);
        }
        for call in data.calls {
            table.set_effects(call.call, call.effects);
            for (idx, mr) in call.args.into_iter().enumerate() {
                if let Some(mr) = mr {
                    table.set_arg_mod_ref(call.call, idx, mr);
                }
            }
        }
        for desc in data.mod_ref {
            table.set_mod_ref(desc.inst, desc.ptr, desc.mod_ref);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_table_defaults() {
        let mut table = AliasTable::new();
        let (p, q, r, call) = (ValueId(0), ValueId(1), ValueId(2), ValueId(3));
        table.set_no_alias(q, p);
        let loc = MemoryLocation::unknown_size;
        assert_eq!(table.alias(&loc(p), &loc(p)), AliasResult::MustAlias);
        assert_eq!(table.alias(&loc(p), &loc(q)), AliasResult::NoAlias);
        assert_eq!(table.alias(&loc(r), &loc(q)), AliasResult::MayAlias);
        assert_eq!(table.memory_effects(call), MemoryEffects::unknown());
        assert_eq!(table.arg_mod_ref(call, 0), ModRef::MOD_REF);
        table.set_effects(
            call,
            MemoryEffects {
                mod_ref: ModRef::REF,
                only_arg_memory: true,
            },
        );
        assert_eq!(table.arg_mod_ref(call, 0), ModRef::REF);
        assert_eq!(table.mod_ref_info(call, &loc(p)), ModRef::REF);
    }

    #[test]
    fn test_alias_table_from_json() {
        let json = r#"{
            "no_alias": [[0, 1]],
            "constant_memory": [4],
            "calls": [{"call": 3, "mod_ref": "ref", "only_arg_memory": true, "args": [null, "mod"]}]
        }"#;
        let table: AliasTable = serde_json::from_str(json).unwrap();
        let loc = MemoryLocation::unknown_size;
        assert_eq!(table.alias(&loc(ValueId(1)), &loc(ValueId(0))), AliasResult::NoAlias);
        assert!(table.points_to_constant_memory(&loc(ValueId(4))));
        assert!(table.memory_effects(ValueId(3)).only_arg_memory);
        assert_eq!(table.arg_mod_ref(ValueId(3), 1), ModRef::MOD);
        assert_eq!(table.arg_mod_ref(ValueId(3), 0), ModRef::REF);
        assert!(serde_json::from_str::<ModRef>(r#""both""#).is_err());
    }
}
