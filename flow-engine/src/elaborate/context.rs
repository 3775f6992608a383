// Elaboration context
// Owns the package registry for one elaboration run; no global state

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::warn;

use super::model::Package;
use crate::defs::PackageDef;
use crate::error::{ElaborationError, Warning};
use crate::expression::QualifiedResolver;
use crate::runner::ImplRegistry;
use crate::value::Value;

/// Loads package definitions referenced by import paths
pub trait PackageLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<PackageDef, ElaborationError>;
}

/// In-memory loader keyed by path, used by tests and embedders that provide
/// definitions directly
#[derive(Default)]
pub struct MapLoader {
    defs: HashMap<String, PackageDef>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, def: PackageDef) {
        self.defs.insert(path.into(), def);
    }
}

impl PackageLoader for MapLoader {
    fn load(&self, path: &str) -> Result<PackageDef, ElaborationError> {
        self.defs.get(path).cloned().ok_or_else(|| ElaborationError::Load {
            path: path.to_string(),
            message: "no such package".to_string(),
        })
    }
}

/// Context for one elaboration run: the elaborated package map, command-line
/// overrides, built-in variables, and collected warnings
pub struct ElabContext {
    packages: HashMap<String, Package>,
    package_order: Vec<String>,
    pub cli_overrides: BTreeMap<String, Value>,
    builtins: BTreeMap<String, Value>,
    warnings: Vec<Warning>,
    pub registry: Arc<ImplRegistry>,
}

impl ElabContext {
    pub fn new(registry: Arc<ImplRegistry>) -> Self {
        Self {
            packages: HashMap::new(),
            package_order: Vec::new(),
            cli_overrides: BTreeMap::new(),
            builtins: BTreeMap::new(),
            warnings: Vec::new(),
            registry,
        }
    }

    pub fn with_cli_override(mut self, name: impl Into<String>, value: Value) -> Self {
        self.cli_overrides.insert(name.into(), value);
        self
    }

    /// Built-in variables are the only identifiers import-path expressions
    /// may reference
    pub fn with_builtin(mut self, name: impl Into<String>, value: Value) -> Self {
        self.builtins.insert(name.into(), value);
        self
    }

    pub fn builtins(&self) -> &BTreeMap<String, Value> {
        &self.builtins
    }

    pub fn insert_package(&mut self, package: Package) {
        if !self.packages.contains_key(&package.name) {
            self.package_order.push(package.name.clone());
        }
        self.packages.insert(package.name.clone(), package);
    }

    pub fn get_package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn get_package_mut(&mut self, name: &str) -> Option<&mut Package> {
        self.packages.get_mut(name)
    }

    /// Package names in elaboration order
    pub fn package_names(&self) -> &[String] {
        &self.package_order
    }

    pub fn add_warning(&mut self, warning: Warning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}

impl QualifiedResolver for ElabContext {
    fn is_package(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    fn resolve_qualified(&self, package: &str, name: &str) -> Option<Value> {
        self.packages.get(package)?.param_value(name)
    }
}
