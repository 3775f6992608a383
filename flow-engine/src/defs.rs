// Raw definition data model
// Unelaborated package/type/task definitions as handed to the engine by the
// flow-definition front end, plus the runtime data-item and marker types

use crate::value::Value;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// A declared parameter: type tag, default (possibly an unevaluated
/// `${{ }}` expression carried as a string), documentation, append mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,

    /// List-typed parameters marked append concatenate across the
    /// inheritance chain instead of replacing
    #[serde(default)]
    pub append: bool,
}

impl ParamDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: None,
            default: None,
            doc: None,
            append: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// A dataflow compatibility pattern: attribute name -> required value.
/// A consumer pattern matches a producer pattern when every attribute
/// named by the consumer is present in the producer with an equal value.
pub type Pattern = BTreeMap<String, Value>;

/// What a task accepts from upstream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConsumeSpec {
    /// "all" or "none" keyword
    Keyword(ConsumeKeyword),
    /// Explicit pattern list, OR semantics across patterns
    Patterns(Vec<Pattern>),
    /// Unspecified: accepts nothing
    #[default]
    #[serde(skip)]
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeKeyword {
    All,
    None,
}

impl ConsumeSpec {
    pub fn all() -> Self {
        ConsumeSpec::Keyword(ConsumeKeyword::All)
    }

    pub fn none() -> Self {
        ConsumeSpec::Keyword(ConsumeKeyword::None)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ConsumeSpec::Keyword(ConsumeKeyword::All))
    }

    pub fn patterns(&self) -> &[Pattern] {
        match self {
            ConsumeSpec::Patterns(patterns) => patterns,
            _ => &[],
        }
    }
}

/// Which received items a task re-emits to further downstream consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Passthrough {
    All,
    None,
    /// Items not matched by this task's own consume patterns pass through
    #[default]
    Unused,
}

/// Task visibility flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeFlag {
    /// Addressable as a run root
    Root,
    /// Visible to other packages
    Export,
    /// Private to the owning package
    Local,
    /// No explicit scope declared; package default applies
    #[default]
    PackageDefault,
}

/// Per-task cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub compression: Compression,

    /// Extra expressions mixed into the structural hash
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hash: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            compression: Compression::None,
            extra_hash: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

/// Compound-task expansion strategy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Strategy {
    /// Cross product over named variable lists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<BTreeMap<String, Vec<Value>>>,

    /// Name of a registered generator callback invoked at graph-build time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate: Option<String>,
}

/// Custom up-to-date check declaration.
/// A literal `false` always forces re-execution without invoking anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckSpec {
    Enabled(bool),
    Callback(String),
}

/// An unelaborated task definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,

    /// Base task this definition inherits from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,

    /// Explicit predecessors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    /// Inverse view: tasks this one feeds (merged into the same edge set)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feeds: Vec<String>,

    #[serde(default)]
    pub consumes: ConsumeSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<Pattern>,

    #[serde(default)]
    pub passthrough: Passthrough,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeFlag>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Compound-task body
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<TaskDef>,

    /// Implementation reference, resolved against the registry at
    /// elaboration time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// An unelaborated type definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// A fragment contributes additional tasks/types to its package namespace
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FragmentDef {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskDef>,
}

/// A package-level import: path plus optional configuration to select in
/// the imported package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImportDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<String>,
    },
}

impl ImportDef {
    pub fn path(&self) -> &str {
        match self {
            ImportDef::Path(p) => p,
            ImportDef::Detailed { path, .. } => path,
        }
    }

    pub fn config(&self) -> Option<&str> {
        match self {
            ImportDef::Path(_) => None,
            ImportDef::Detailed { config, .. } => config.as_deref(),
        }
    }
}

/// A named configuration: itself inheritable, contributing imports,
/// parameters, fragments, and task/type overrides
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<FragmentDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskDef>,

    /// Redirections: existing name -> most-derived replacement
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, String>,
}

/// An unelaborated package definition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageDef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragments: Vec<FragmentDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ConfigDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<TypeDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskDef>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub overrides: HashMap<String, String>,

    /// Default scope flag for tasks that declare none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_scope: Option<ScopeFlag>,
}

impl PackageDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a package definition from a YAML document
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(source)
    }
}

/// A typed unit of data produced by one task node and consumed by its
/// dependents. File-like items carry a base directory plus member paths;
/// everything else rides in the attribute map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataItem {
    /// Type tag, always present
    #[serde(rename = "type")]
    pub item_type: String,

    /// Producing node name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// Position in the producer's output list
    #[serde(default)]
    pub seq: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basedir: Option<PathBuf>,

    /// Member paths relative to basedir
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    /// Auxiliary metadata: include dirs, defines, arbitrary attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl DataItem {
    pub fn new(item_type: impl Into<String>) -> Self {
        Self {
            item_type: item_type.into(),
            ..Default::default()
        }
    }

    /// View of the item as a pattern: the type tag plus all attributes
    pub fn shape(&self) -> Pattern {
        let mut shape = self.attributes.clone();
        shape.insert("type".to_string(), Value::String(self.item_type.clone()));
        shape
    }
}

/// Severity-tagged diagnostic emitted by a task implementation.
/// Always user-visible regardless of severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub severity: Severity,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Marker {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            location: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_from_yaml() {
        let source = r#"
name: hdl
params:
  - name: top
    default: soc
tasks:
  - name: compile
    run: std.compile
    produces:
      - type: fileset
        filetype: verilog
  - name: elaborate
    needs: [compile]
    consumes:
      - type: fileset
        filetype: verilog
"#;
        let def = PackageDef::from_yaml(source).unwrap();

        assert_eq!(def.name, "hdl");
        assert_eq!(def.params[0].name, "top");
        assert_eq!(def.tasks.len(), 2);
        assert_eq!(def.tasks[1].needs, vec!["compile"]);
        assert_eq!(def.tasks[1].consumes.patterns().len(), 1);
    }

    #[test]
    fn test_consumes_keyword_from_yaml() {
        let source = r#"
name: p
tasks:
  - name: sink
    consumes: all
  - name: isolated
    consumes: none
"#;
        let def = PackageDef::from_yaml(source).unwrap();

        assert!(def.tasks[0].consumes.is_all());
        assert_eq!(def.tasks[1].consumes, ConsumeSpec::none());
    }

    #[test]
    fn test_check_spec_false_literal() {
        let source = r#"
name: p
tasks:
  - name: t
    check: false
  - name: u
    check: my.check
"#;
        let def = PackageDef::from_yaml(source).unwrap();

        assert_eq!(def.tasks[0].check, Some(CheckSpec::Enabled(false)));
        assert_eq!(
            def.tasks[1].check,
            Some(CheckSpec::Callback("my.check".to_string()))
        );
    }

    #[test]
    fn test_data_item_shape_includes_type() {
        let mut item = DataItem::new("fileset");
        item.attributes
            .insert("filetype".to_string(), Value::String("verilog".to_string()));

        let shape = item.shape();
        assert_eq!(shape.get("type"), Some(&Value::String("fileset".to_string())));
        assert_eq!(
            shape.get("filetype"),
            Some(&Value::String("verilog".to_string()))
        );
    }

    #[test]
    fn test_import_def_forms() {
        let plain = ImportDef::Path("lib/common.yaml".to_string());
        assert_eq!(plain.path(), "lib/common.yaml");
        assert_eq!(plain.config(), None);

        let detailed = ImportDef::Detailed {
            path: "lib/common.yaml".to_string(),
            config: Some("sim".to_string()),
        };
        assert_eq!(detailed.config(), Some("sim"));
    }
}
