// Parameter collections
// Insertion-ordered, index-backed, with base-first merge semantics

use std::collections::{BTreeMap, HashMap};

use crate::defs::ParamDef;
use crate::expression::{Evaluator, ResolutionError};
use crate::value::Value;

/// Ordered collection of parameter definitions.
///
/// Merging is base-first: a later entry with an existing name overrides it
/// in place, except list-typed `append` parameters, whose list defaults
/// concatenate onto the base list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamCollection {
    params: Vec<ParamDef>,
    indices: HashMap<String, usize>,
}

impl ParamCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_defs(defs: &[ParamDef]) -> Self {
        let mut collection = Self::new();
        for def in defs {
            collection.insert(def.clone());
        }
        collection
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        self.indices.get(name).map(|&i| &self.params[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamDef> {
        self.params.iter()
    }

    /// Insert or override one definition
    pub fn insert(&mut self, def: ParamDef) {
        match self.indices.get(&def.name) {
            Some(&i) => {
                let existing = &mut self.params[i];
                if existing.append {
                    if let (Some(Value::List(base)), Some(Value::List(extra))) =
                        (&existing.default, &def.default)
                    {
                        let mut merged = base.clone();
                        merged.extend(extra.clone());
                        existing.default = Some(Value::List(merged));
                        return;
                    }
                }
                self.params[i] = def;
            }
            None => {
                self.indices.insert(def.name.clone(), self.params.len());
                self.params.push(def);
            }
        }
    }

    /// Merge another collection on top of this one (this = base)
    pub fn merge(&mut self, other: &ParamCollection) {
        for def in other.iter() {
            self.insert(def.clone());
        }
    }

    /// Override default values by name without introducing new definitions.
    /// Unknown names are inserted as untyped definitions, matching how
    /// command-line overrides behave.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) {
        for (name, value) in overrides {
            match self.indices.get(name) {
                Some(&i) => self.params[i].default = Some(value.clone()),
                None => self.insert(ParamDef::new(name.clone()).with_default(value.clone())),
            }
        }
    }

    /// Evaluate every default through the evaluator, producing the resolved
    /// parameter table
    pub fn resolve(&self, eval: &Evaluator<'_>) -> Result<BTreeMap<String, Value>, ResolutionError> {
        let mut resolved = BTreeMap::new();
        for def in &self.params {
            let value = match &def.default {
                Some(value) => eval.resolve_value(value)?,
                None => Value::Null,
            };
            resolved.insert(def.name.clone(), value);
        }
        Ok(resolved)
    }
}
