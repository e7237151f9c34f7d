//! The top-level container (§2 component E, §3 `Module`): a name-indexed
//! collection of units plus the per-module type interner.
//!
//! Generalizes a name-to-unit map keyed over a single unit kind to the
//! four unit kinds needed here, using `IndexMap` rather than `HashMap` so
//! iteration order is deterministic (needed for stable diagnostics and
//! textual round-trips, §8 property 6).

use indexmap::IndexMap;

use crate::error::ConstructError;
use crate::ty::TypeTable;
use crate::unit::{Signature, Unit, UnitKind, UnitName};

/// A module: the unique top-level container a verifier/pass pipeline
/// operates on (§3: "a unit name is unique within a module").
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Module {
    units: IndexMap<UnitName, Unit>,
    #[serde(skip)]
    types: TypeTable,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types_mut(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Declare a new unit. Fails if a unit with this name already exists
    /// (§3: unit names are unique within a module), or if `sig` names the
    /// same parameter twice.
    pub fn declare_unit(&mut self, name: impl Into<String>, kind: UnitKind, sig: Signature) -> Result<&mut Unit, ConstructError> {
        let name = name.into();
        if self.units.contains_key(&name) {
            return Err(ConstructError::DuplicateUnitName(name));
        }
        let mut seen = std::collections::HashSet::new();
        for param in &sig.params {
            if let Some(param_name) = &param.name {
                if !seen.insert(param_name) {
                    return Err(ConstructError::DuplicateParameterName(param_name.clone()));
                }
            }
        }
        let unit = Unit::new(name.clone(), kind, sig);
        let (index, _) = self.units.insert_full(name, unit);
        Ok(self.units.get_index_mut(index).expect("just inserted").1)
    }

    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn unit_mut(&mut self, name: &str) -> Option<&mut Unit> {
        self.units.get_mut(name)
    }

    pub fn remove_unit(&mut self, name: &str) -> Option<Unit> {
        self.units.shift_remove(name)
    }

    pub fn rename_unit(&mut self, old: &str, new: impl Into<String>) -> Result<(), ConstructError> {
        let new = new.into();
        if self.units.contains_key(&new) {
            return Err(ConstructError::DuplicateUnitName(new));
        }
        let (index, _, mut unit) = self
            .units
            .shift_remove_full(old)
            .ok_or_else(|| ConstructError::UnknownUnit(old.to_string()))?;
        unit.set_name(new.clone());
        let new_len = self.units.len();
        self.units.insert(new, unit);
        // Restore approximate position: IndexMap::insert appends, shifting
        // everything after `index` left by one; that is acceptable here
        // since unit order is not semantically meaningful (§3 only requires
        // uniqueness), but we avoid silently reordering unrelated units by
        // shifting the newly inserted entry back to `index` when it moved.
        if index < new_len {
            self.units.move_index(new_len, index);
        }
        Ok(())
    }

    pub fn units(&self) -> impl Iterator<Item = (&str, &Unit)> {
        self.units.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Look up the callee's signature for a `call`/`inst` construction site
    /// without giving the caller's `Unit` a live borrow of the whole module
    /// (mirrors Cretonne's `SigRef` indirection: resolve once, pass the
    /// resolved signature into the builder).
    pub fn signature_of(&self, unit_name: &str) -> Result<&Signature, ConstructError> {
        self.units
            .get(unit_name)
            .map(|u| u.signature())
            .ok_or_else(|| ConstructError::UnknownUnit(unit_name.to_string()))
    }

    /// Replace `old_name`'s unit wholesale with `replacement`, keeping the
    /// same module position. Used by `proclower` to swap a lowered
    /// process for its resulting entity (§4.7: "replaces P in the module,
    /// with the same name and port signature").
    pub fn replace_unit(&mut self, old_name: &str, replacement: Unit) -> Result<(), ConstructError> {
        let index = self
            .units
            .get_index_of(old_name)
            .ok_or_else(|| ConstructError::UnknownUnit(old_name.to_string()))?;
        let (_, slot) = self.units.get_index_mut(index).expect("index just found");
        *slot = replacement;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;
    use crate::unit::Param;

    #[test]
    fn declare_and_lookup_unit() {
        let mut m = Module::new();
        m.declare_unit("double", UnitKind::Function, Signature::new(vec![Param { name: None, ty: Type::int(32) }], vec![Type::int(32)]))
            .unwrap();
        assert!(m.unit("double").is_some());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn duplicate_unit_name_rejected() {
        let mut m = Module::new();
        m.declare_unit("u", UnitKind::Declaration, Signature::default()).unwrap();
        let err = m.declare_unit("u", UnitKind::Declaration, Signature::default());
        assert!(matches!(err, Err(ConstructError::DuplicateUnitName(_))));
    }

    #[test]
    fn duplicate_parameter_name_rejected() {
        let mut m = Module::new();
        let sig = Signature::new(
            vec![Param { name: Some("a".into()), ty: Type::int(1) }, Param { name: Some("a".into()), ty: Type::int(8) }],
            vec![],
        );
        let err = m.declare_unit("u", UnitKind::Function, sig);
        assert!(matches!(err, Err(ConstructError::DuplicateParameterName(name)) if name == "a"));
    }

    #[test]
    fn signature_of_resolves_cross_unit_calls() {
        let mut m = Module::new();
        m.declare_unit("callee", UnitKind::Function, Signature::new(vec![], vec![Type::int(1)])).unwrap();
        let sig = m.signature_of("callee").unwrap();
        assert_eq!(sig.returns, vec![Type::int(1)]);
        assert!(m.signature_of("missing").is_err());
    }
}
