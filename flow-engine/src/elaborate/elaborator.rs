// Package elaborator
// Turns raw package definitions into one merged, acyclic namespace of
// types and tasks. Stage order: imports, inheritance, fragments, config
// selection, config application, type/task flattening.

use std::collections::{BTreeMap, HashMap};

use super::context::{ElabContext, PackageLoader};
use super::model::{Package, Task, Type};
use super::params::ParamCollection;
use crate::defs::{
    ConfigDef, ConsumeSpec, ImportDef, PackageDef, Passthrough, ScopeFlag, TaskDef, TypeDef,
};
use crate::error::{ElaborationError, Warning};
use crate::expression::{
    extract_expressions, has_expressions, parse_expression, Evaluator, ScopeFrame, ScopeStack,
    Segment,
};
use crate::value::Value;

pub struct Elaborator<'a> {
    loader: &'a dyn PackageLoader,
}

impl<'a> Elaborator<'a> {
    pub fn new(loader: &'a dyn PackageLoader) -> Self {
        Self { loader }
    }

    /// Elaborate a root package definition into the context. Returns the
    /// package name.
    pub fn elaborate(
        &self,
        ctx: &mut ElabContext,
        def: &PackageDef,
        config: Option<&str>,
    ) -> Result<String, ElaborationError> {
        let mut in_progress = Vec::new();
        self.elaborate_inner(ctx, def, config, &mut in_progress)
    }

    fn elaborate_inner(
        &self,
        ctx: &mut ElabContext,
        def: &PackageDef,
        config: Option<&str>,
        in_progress: &mut Vec<String>,
    ) -> Result<String, ElaborationError> {
        if ctx.get_package(&def.name).is_some() {
            return Ok(def.name.clone());
        }
        if in_progress.contains(&def.name) {
            return Err(ElaborationError::InheritanceCycle(def.name.clone()));
        }
        in_progress.push(def.name.clone());

        // Stage 1: package-level imports
        for import in &def.imports {
            self.load_import(ctx, import, in_progress)?;
        }

        // Stage 4: configuration selection. Done before stage 5 needs its
        // imports: explicit argument, else a config literally named
        // "default", else none. (Import-site selections arrive through the
        // `config` argument when this package is loaded as an import.)
        let selected = match config {
            Some(name) => Some(def.configs.iter().find(|c| c.name == name).ok_or_else(
                || ElaborationError::MissingConfig {
                    name: name.to_string(),
                    package: def.name.clone(),
                },
            )?),
            None => def.configs.iter().find(|c| c.name == "default"),
        };
        let config_chain = match selected {
            Some(cfg) => flatten_config_chain(def, cfg)?,
            None => Vec::new(),
        };

        for cfg in &config_chain {
            for import in &cfg.imports {
                self.load_import(ctx, import, in_progress)?;
            }
        }

        // Stage 2: base-package inheritance
        let mut pkg = Package::new(&def.name);
        let mut params = ParamCollection::new();
        if let Some(base_name) = &def.uses {
            let base = ctx
                .get_package(base_name)
                .ok_or_else(|| ElaborationError::UnknownReference {
                    name: base_name.clone(),
                    package: def.name.clone(),
                })?
                .clone();
            params.merge(&base.params);
            for ty in base.types() {
                pkg.add_type(ty.clone())?;
            }
            // Base tasks are aliased into the derived namespace, keeping
            // their originating package and visibility flags
            for task in base.tasks() {
                pkg.replace_task(task.clone());
            }
            pkg.default_scope = base.default_scope;
        }
        params.merge(&ParamCollection::from_defs(&def.params));

        // Stage 3: fragments contribute to the same namespace; duplicate
        // names across the package's own definitions and its fragments are
        // fatal
        let mut raw_types: Vec<TypeDef> = Vec::new();
        let mut raw_tasks: Vec<TaskDef> = Vec::new();
        let mut seen_types: HashMap<String, ()> = HashMap::new();
        let mut seen_tasks: HashMap<String, ()> = HashMap::new();

        let mut contribute_type = |raw_types: &mut Vec<TypeDef>,
                                   seen: &mut HashMap<String, ()>,
                                   ty: &TypeDef|
         -> Result<(), ElaborationError> {
            if seen.insert(ty.name.clone(), ()).is_some() {
                return Err(ElaborationError::DuplicateName {
                    name: ty.name.clone(),
                    package: def.name.clone(),
                });
            }
            raw_types.push(ty.clone());
            Ok(())
        };
        let mut contribute_task = |raw_tasks: &mut Vec<TaskDef>,
                                   seen: &mut HashMap<String, ()>,
                                   task: &TaskDef|
         -> Result<(), ElaborationError> {
            if seen.insert(task.name.clone(), ()).is_some() {
                return Err(ElaborationError::DuplicateName {
                    name: task.name.clone(),
                    package: def.name.clone(),
                });
            }
            raw_tasks.push(task.clone());
            Ok(())
        };

        for ty in &def.types {
            contribute_type(&mut raw_types, &mut seen_types, ty)?;
        }
        for task in &def.tasks {
            contribute_task(&mut raw_tasks, &mut seen_tasks, task)?;
        }
        for fragment in &def.fragments {
            for ty in &fragment.types {
                contribute_type(&mut raw_types, &mut seen_types, ty)?;
            }
            for task in &fragment.tasks {
                contribute_task(&mut raw_tasks, &mut seen_tasks, task)?;
            }
        }

        // Stage 5: apply the configuration chain, base-first. Configuration
        // values take precedence over plain package values.
        let mut overrides: HashMap<String, String> = def.overrides.clone();
        for cfg in &config_chain {
            params.merge(&ParamCollection::from_defs(&cfg.params));
            for fragment in &cfg.fragments {
                for ty in &fragment.types {
                    contribute_type(&mut raw_types, &mut seen_types, ty)?;
                }
                for task in &fragment.tasks {
                    contribute_task(&mut raw_tasks, &mut seen_tasks, task)?;
                }
            }
            // Config-level types/tasks replace same-named earlier entries
            for ty in &cfg.types {
                if seen_types.contains_key(&ty.name) {
                    if let Some(slot) = raw_types.iter_mut().find(|t| t.name == ty.name) {
                        *slot = ty.clone();
                    }
                } else {
                    contribute_type(&mut raw_types, &mut seen_types, ty)?;
                }
            }
            for task in &cfg.tasks {
                if seen_tasks.contains_key(&task.name) {
                    if let Some(slot) = raw_tasks.iter_mut().find(|t| t.name == task.name) {
                        *slot = task.clone();
                    }
                } else {
                    contribute_task(&mut raw_tasks, &mut seen_tasks, task)?;
                }
            }
            overrides.extend(cfg.overrides.clone());
        }

        // Command-line overrides win over everything
        params.apply_overrides(&ctx.cli_overrides);

        // Resolve package parameters, declaration order, each default seeing
        // the ones before it
        let resolved = resolve_sequential(ctx, &params, ScopeStack::new(BTreeMap::new()), &def.name)?;
        pkg.params = params;
        pkg.resolved_params = resolved.values;
        if let Some(scope) = def.default_scope {
            pkg.default_scope = scope;
        }

        // Stage 6: flatten types, then tasks
        let mut warnings = Vec::new();

        for ty in &raw_types {
            let mut visiting = Vec::new();
            let flattened = flatten_type(&def.name, &raw_types, &pkg, ty, &mut visiting)?;
            pkg.replace_type(flattened);
        }

        for task in &raw_tasks {
            let mut visiting = Vec::new();
            let flattened = self.elaborate_task(
                ctx,
                &pkg,
                &raw_tasks,
                task,
                &mut visiting,
                &mut warnings,
                &[],
            )?;
            pkg.replace_task(flattened);
        }

        // Override redirections: edges and lookups of the overridden name
        // go to the most-derived definition
        for (old, new) in &overrides {
            if pkg.get_task(new).is_none() {
                return Err(ElaborationError::UnknownReference {
                    name: new.clone(),
                    package: def.name.clone(),
                });
            }
            pkg.add_alias(old.clone(), new.clone());
        }
        for task in pkg.tasks_mut() {
            for edge in task.needs.iter_mut().chain(task.feeds.iter_mut()) {
                if let Some(target) = overrides.get(edge) {
                    *edge = target.clone();
                }
            }
        }

        for warning in warnings {
            ctx.add_warning(warning);
        }

        in_progress.pop();
        ctx.insert_package(pkg);
        Ok(def.name.clone())
    }

    fn load_import(
        &self,
        ctx: &mut ElabContext,
        import: &ImportDef,
        in_progress: &mut Vec<String>,
    ) -> Result<(), ElaborationError> {
        let path = resolve_import_path(ctx, import.path())?;
        let loaded = self.loader.load(&path)?;
        self.elaborate_inner(ctx, &loaded, import.config(), in_progress)?;
        Ok(())
    }

    /// Flatten one task definition: `uses` chain, parameter merge, body
    /// elaboration, implementation resolution
    #[allow(clippy::too_many_arguments)]
    fn elaborate_task(
        &self,
        ctx: &ElabContext,
        pkg: &Package,
        raw_tasks: &[TaskDef],
        def: &TaskDef,
        visiting: &mut Vec<String>,
        warnings: &mut Vec<Warning>,
        enclosing: &[ScopeFrame],
    ) -> Result<Task, ElaborationError> {
        if visiting.contains(&def.name) {
            return Err(ElaborationError::InheritanceCycle(def.name.clone()));
        }
        visiting.push(def.name.clone());

        // Resolve the base task, if any
        let base = match &def.uses {
            None => None,
            Some(uses) if uses.contains('.') => {
                let (pkg_name, task_name) = uses.split_once('.').unwrap_or((uses, ""));
                let other = ctx.get_package(pkg_name).ok_or_else(|| {
                    ElaborationError::UnknownReference {
                        name: uses.clone(),
                        package: pkg.name.clone(),
                    }
                })?;
                let target =
                    other
                        .get_task(task_name)
                        .ok_or_else(|| ElaborationError::UnknownReference {
                            name: uses.clone(),
                            package: pkg.name.clone(),
                        })?;
                if !target.is_exported() {
                    warnings.push(Warning::Visibility {
                        from_package: pkg.name.clone(),
                        target: uses.clone(),
                    });
                }
                Some(target.clone())
            }
            Some(uses) => {
                if let Some(raw_base) = raw_tasks.iter().find(|t| &t.name == uses) {
                    Some(self.elaborate_task(
                        ctx, pkg, raw_tasks, raw_base, visiting, warnings, enclosing,
                    )?)
                } else if let Some(inherited) = pkg.get_task(uses) {
                    Some(inherited.clone())
                } else {
                    return Err(ElaborationError::UnknownReference {
                        name: uses.clone(),
                        package: pkg.name.clone(),
                    });
                }
            }
        };

        let mut task = match base {
            Some(base) => Task {
                name: def.name.clone(),
                package: pkg.name.clone(),
                ..base
            },
            None => Task {
                name: def.name.clone(),
                package: pkg.name.clone(),
                params: ParamCollection::new(),
                resolved_params: BTreeMap::new(),
                needs: Vec::new(),
                feeds: Vec::new(),
                consumes: ConsumeSpec::Unspecified,
                produces: Vec::new(),
                passthrough: Passthrough::Unused,
                scope: ScopeFlag::PackageDefault,
                cache: None,
                strategy: None,
                body: Vec::new(),
                implementation: None,
                check: None,
                deferred_params: Vec::new(),
            },
        };

        // Derived entries override by name, base-first
        task.params.merge(&ParamCollection::from_defs(&def.params));

        for need in &def.needs {
            if !task.needs.contains(need) {
                task.needs.push(need.clone());
            }
        }
        for feed in &def.feeds {
            if !task.feeds.contains(feed) {
                task.feeds.push(feed.clone());
            }
        }
        if def.consumes != ConsumeSpec::Unspecified {
            task.consumes = def.consumes.clone();
        }
        for pattern in &def.produces {
            if !task.produces.contains(pattern) {
                task.produces.push(pattern.clone());
            }
        }
        if def.passthrough != Passthrough::Unused {
            task.passthrough = def.passthrough;
        }
        task.scope = match def.scope {
            Some(scope) => scope,
            None if task.scope != ScopeFlag::PackageDefault => task.scope,
            None => pkg.default_scope,
        };
        if def.cache.is_some() {
            task.cache = def.cache.clone();
        }
        if def.strategy.is_some() {
            task.strategy = def.strategy.clone();
        }
        if def.check.is_some() {
            task.check = def.check.clone();
        }
        if let Some(run) = &def.run {
            task.implementation = Some(
                ctx.registry
                    .get_impl(run)
                    .ok_or_else(|| ElaborationError::UnknownImpl(run.clone()))?,
            );
        }

        // Resolve the task's parameter table; deferred defaults stay raw
        let mut scope = ScopeStack::new(pkg.resolved_params.clone());
        for frame in enclosing {
            scope.push(frame.clone());
        }
        // Matrix variables are bound per combination at graph build; their
        // first values stand in here so defaults referencing them resolve
        if let Some(matrix) = task.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
            let mut frame = ScopeFrame::for_task(&pkg.name, &def.name);
            for (name, values) in matrix {
                if let Some(first) = values.first() {
                    frame = frame.with_synthetic(name.clone(), first.clone());
                }
            }
            scope.push(frame);
        }
        let resolved = resolve_sequential(ctx, &task.params, scope, &task.name)?;
        task.resolved_params = resolved.values;
        task.deferred_params = resolved.deferred;

        // Compound body elaborates with this task's frame enclosing
        if !def.body.is_empty() {
            let mut own_frame = ScopeFrame::for_task(&pkg.name, &def.name);
            for (name, value) in &task.resolved_params {
                own_frame = own_frame.with_param(name.clone(), value.clone());
            }
            let mut frames = enclosing.to_vec();
            frames.push(own_frame);

            task.body = Vec::new();
            for child in &def.body {
                let elaborated = self.elaborate_task(
                    ctx, pkg, raw_tasks, child, visiting, warnings, &frames,
                )?;
                task.body.push(elaborated);
            }
        }

        visiting.pop();
        Ok(task)
    }
}

/// Resolved parameter table plus the names left deferred
pub struct ResolvedParams {
    pub values: BTreeMap<String, Value>,
    pub deferred: Vec<String>,
}

/// Resolve parameter defaults in declaration order, each one seeing the
/// parameters declared before it. Defaults referencing `inputs` or
/// `memento` are kept raw and reported as deferred.
pub fn resolve_sequential(
    ctx: &ElabContext,
    params: &ParamCollection,
    mut scope: ScopeStack,
    owner: &str,
) -> Result<ResolvedParams, ElaborationError> {
    scope.push(ScopeFrame::for_task("", owner));

    let mut values = BTreeMap::new();
    let mut deferred = Vec::new();

    for def in params.iter() {
        let Some(default) = &def.default else {
            values.insert(def.name.clone(), Value::Null);
            continue;
        };

        if value_is_deferred(default) {
            deferred.push(def.name.clone());
            values.insert(def.name.clone(), default.clone());
            continue;
        }

        let resolved = {
            let eval = Evaluator::with_registry(&scope, ctx);
            eval.resolve_value(default)?
        };
        if let Some(frame) = scope.top_mut() {
            frame.task_params.insert(def.name.clone(), resolved.clone());
        }
        values.insert(def.name.clone(), resolved);
    }

    Ok(ResolvedParams { values, deferred })
}

/// True when any embedded expression references runtime-only symbols
pub fn value_is_deferred(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            if !has_expressions(s) {
                return false;
            }
            extract_expressions(s).iter().any(|seg| match seg {
                Segment::Expr(expr) => parse_expression(expr)
                    .map(|ast| ast.is_deferred())
                    .unwrap_or(false),
                Segment::Text(_) => false,
            })
        }
        Value::List(items) => items.iter().any(value_is_deferred),
        Value::Map(map) => map.values().any(value_is_deferred),
        _ => false,
    }
}

/// Import paths may reference only built-in variables
fn resolve_import_path(ctx: &ElabContext, raw: &str) -> Result<String, ElaborationError> {
    if !has_expressions(raw) {
        return Ok(raw.to_string());
    }

    let scope = ScopeStack::new(ctx.builtins().clone());
    let eval = Evaluator::new(&scope);
    eval.interpolate(raw)
        .map(|v| v.as_string())
        .map_err(|_| ElaborationError::ImportExpression(raw.to_string()))
}

/// Walk a configuration's `uses` chain, base-first
fn flatten_config_chain<'d>(
    def: &'d PackageDef,
    cfg: &'d ConfigDef,
) -> Result<Vec<&'d ConfigDef>, ElaborationError> {
    let mut chain = vec![cfg];
    let mut current = cfg;

    while let Some(base_name) = &current.uses {
        if chain.iter().any(|c| &c.name == base_name) {
            return Err(ElaborationError::InheritanceCycle(base_name.clone()));
        }
        current = def
            .configs
            .iter()
            .find(|c| &c.name == base_name)
            .ok_or_else(|| ElaborationError::MissingConfig {
                name: base_name.clone(),
                package: def.name.clone(),
            })?;
        chain.push(current);
    }

    chain.reverse();
    Ok(chain)
}

/// Flatten one type's `uses` chain into a single parameter table
fn flatten_type(
    package: &str,
    raw_types: &[TypeDef],
    pkg: &Package,
    def: &TypeDef,
    visiting: &mut Vec<String>,
) -> Result<Type, ElaborationError> {
    if visiting.contains(&def.name) {
        return Err(ElaborationError::InheritanceCycle(def.name.clone()));
    }
    visiting.push(def.name.clone());

    let mut params = match &def.uses {
        None => ParamCollection::new(),
        Some(uses) => {
            if let Some(raw_base) = raw_types.iter().find(|t| &t.name == uses) {
                flatten_type(package, raw_types, pkg, raw_base, visiting)?.params
            } else if let Some(inherited) = pkg.get_type(uses) {
                inherited.params.clone()
            } else {
                return Err(ElaborationError::UnknownReference {
                    name: uses.clone(),
                    package: package.to_string(),
                });
            }
        }
    };
    params.merge(&ParamCollection::from_defs(&def.params));

    visiting.pop();
    Ok(Type {
        name: def.name.clone(),
        package: package.to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{FragmentDef, ParamDef};
    use crate::elaborate::context::MapLoader;
    use crate::runner::ImplRegistry;
    use std::sync::Arc;

    fn ctx() -> ElabContext {
        ElabContext::new(Arc::new(ImplRegistry::new()))
    }

    fn elaborate(ctx: &mut ElabContext, def: &PackageDef) -> Result<String, ElaborationError> {
        let loader = MapLoader::new();
        Elaborator::new(&loader).elaborate(ctx, def, None)
    }

    #[test]
    fn test_parameter_precedence_base_derived_cli() {
        let loader = {
            let mut loader = MapLoader::new();
            let mut base = PackageDef::new("base");
            base.params
                .push(ParamDef::new("v").with_default(Value::from(1.0)));
            loader.insert("base.yaml", base);
            loader
        };

        let mut derived = PackageDef::new("derived");
        derived.imports.push(ImportDef::Path("base.yaml".to_string()));
        derived.uses = Some("base".to_string());
        derived
            .params
            .push(ParamDef::new("v").with_default(Value::from(2.0)));

        // base < derived < CLI
        let mut ctx = ctx().with_cli_override("v", Value::from(3.0));
        Elaborator::new(&loader)
            .elaborate(&mut ctx, &derived, None)
            .unwrap();
        assert_eq!(
            ctx.get_package("derived").unwrap().param_value("v"),
            Some(Value::from(3.0))
        );

        // base < derived
        let mut ctx2 = ElabContext::new(Arc::new(ImplRegistry::new()));
        Elaborator::new(&loader)
            .elaborate(&mut ctx2, &derived, None)
            .unwrap();
        assert_eq!(
            ctx2.get_package("derived").unwrap().param_value("v"),
            Some(Value::from(2.0))
        );

        // base alone
        let mut base_only = PackageDef::new("solo");
        base_only.imports.push(ImportDef::Path("base.yaml".to_string()));
        base_only.uses = Some("base".to_string());
        let mut ctx3 = ElabContext::new(Arc::new(ImplRegistry::new()));
        Elaborator::new(&loader)
            .elaborate(&mut ctx3, &base_only, None)
            .unwrap();
        assert_eq!(
            ctx3.get_package("solo").unwrap().param_value("v"),
            Some(Value::from(1.0))
        );
    }

    #[test]
    fn test_type_inheritance_merge() {
        let mut def = PackageDef::new("p");
        def.types.push(TypeDef {
            name: "base_t".to_string(),
            uses: None,
            params: vec![
                ParamDef::new("a").with_default(Value::from("base")),
                ParamDef::new("c").with_default(Value::from("orig")),
            ],
            doc: None,
        });
        def.types.push(TypeDef {
            name: "derived_t".to_string(),
            uses: Some("base_t".to_string()),
            params: vec![
                ParamDef::new("a").with_default(Value::from("base")),
                ParamDef::new("b").with_default(Value::from("new")),
            ],
            doc: None,
        });

        let mut ctx = ctx();
        elaborate(&mut ctx, &def).unwrap();

        let pkg = ctx.get_package("p").unwrap();
        let ty = pkg.get_type("derived_t").unwrap();
        assert_eq!(ty.params.get("a").unwrap().default, Some(Value::from("base")));
        assert_eq!(ty.params.get("b").unwrap().default, Some(Value::from("new")));
        assert_eq!(ty.params.get("c").unwrap().default, Some(Value::from("orig")));
    }

    #[test]
    fn test_type_inheritance_cycle_fatal() {
        let mut def = PackageDef::new("p");
        def.types.push(TypeDef {
            name: "a".to_string(),
            uses: Some("b".to_string()),
            params: Vec::new(),
            doc: None,
        });
        def.types.push(TypeDef {
            name: "b".to_string(),
            uses: Some("a".to_string()),
            params: Vec::new(),
            doc: None,
        });

        let mut ctx = ctx();
        let err = elaborate(&mut ctx, &def).unwrap_err();
        assert!(matches!(err, ElaborationError::InheritanceCycle(_)));
    }

    #[test]
    fn test_duplicate_fragment_names_fatal() {
        let mut def = PackageDef::new("p");
        def.fragments.push(FragmentDef {
            name: "f1".to_string(),
            types: Vec::new(),
            tasks: vec![TaskDef::new("build")],
        });
        def.fragments.push(FragmentDef {
            name: "f2".to_string(),
            types: Vec::new(),
            tasks: vec![TaskDef::new("build")],
        });

        let mut ctx = ctx();
        let err = elaborate(&mut ctx, &def).unwrap_err();
        assert!(matches!(err, ElaborationError::DuplicateName { .. }));
    }

    #[test]
    fn test_config_default_selected_when_unnamed() {
        let mut def = PackageDef::new("p");
        def.params
            .push(ParamDef::new("mode").with_default(Value::from("plain")));
        def.configs.push(ConfigDef {
            name: "default".to_string(),
            params: vec![ParamDef::new("mode").with_default(Value::from("configured"))],
            ..Default::default()
        });

        let mut ctx = ctx();
        elaborate(&mut ctx, &def).unwrap();
        assert_eq!(
            ctx.get_package("p").unwrap().param_value("mode"),
            Some(Value::from("configured"))
        );
    }

    #[test]
    fn test_missing_config_fatal() {
        let def = PackageDef::new("p");
        let mut ctx = ctx();
        let loader = MapLoader::new();
        let err = Elaborator::new(&loader)
            .elaborate(&mut ctx, &def, Some("sim"))
            .unwrap_err();
        assert!(matches!(err, ElaborationError::MissingConfig { .. }));
    }

    #[test]
    fn test_config_below_cli_precedence() {
        let mut def = PackageDef::new("p");
        def.params
            .push(ParamDef::new("v").with_default(Value::from("package")));
        def.configs.push(ConfigDef {
            name: "default".to_string(),
            params: vec![ParamDef::new("v").with_default(Value::from("config"))],
            ..Default::default()
        });

        let mut ctx = ctx().with_cli_override("v", Value::from("cli"));
        elaborate(&mut ctx, &def).unwrap();
        assert_eq!(
            ctx.get_package("p").unwrap().param_value("v"),
            Some(Value::from("cli"))
        );
    }

    #[test]
    fn test_task_uses_chain_merges_params() {
        let mut def = PackageDef::new("p");
        let mut base = TaskDef::new("base_task");
        base.params
            .push(ParamDef::new("opt").with_default(Value::from("-O2")));
        let mut derived = TaskDef::new("derived_task");
        derived.uses = Some("base_task".to_string());
        derived
            .params
            .push(ParamDef::new("dbg").with_default(Value::from("-g")));
        def.tasks.push(base);
        def.tasks.push(derived);

        let mut ctx = ctx();
        elaborate(&mut ctx, &def).unwrap();

        let pkg = ctx.get_package("p").unwrap();
        let task = pkg.get_task("derived_task").unwrap();
        assert_eq!(task.resolved_params.get("opt"), Some(&Value::from("-O2")));
        assert_eq!(task.resolved_params.get("dbg"), Some(&Value::from("-g")));
    }

    #[test]
    fn test_override_redirects_edges_and_lookup() {
        let mut def = PackageDef::new("p");
        def.tasks.push(TaskDef::new("compile"));
        let mut custom = TaskDef::new("compile_fast");
        custom.uses = Some("compile".to_string());
        def.tasks.push(custom);
        let mut downstream = TaskDef::new("link");
        downstream.needs.push("compile".to_string());
        def.tasks.push(downstream);
        def.overrides
            .insert("compile".to_string(), "compile_fast".to_string());

        let mut ctx = ctx();
        elaborate(&mut ctx, &def).unwrap();

        let pkg = ctx.get_package("p").unwrap();
        assert_eq!(pkg.get_task("compile").unwrap().name, "compile_fast");
        assert_eq!(pkg.get_task("link").unwrap().needs, vec!["compile_fast"]);
    }

    #[test]
    fn test_cross_package_visibility_warning() {
        let loader = {
            let mut loader = MapLoader::new();
            let mut q = PackageDef::new("q");
            let mut hidden = TaskDef::new("hidden");
            hidden.scope = Some(ScopeFlag::Local);
            q.tasks.push(hidden);
            loader.insert("q.yaml", q);
            loader
        };

        let mut def = PackageDef::new("p");
        def.imports.push(ImportDef::Path("q.yaml".to_string()));
        let mut user = TaskDef::new("user");
        user.uses = Some("q.hidden".to_string());
        def.tasks.push(user);

        let mut ctx = ctx();
        Elaborator::new(&loader).elaborate(&mut ctx, &def, None).unwrap();

        // Warning emitted, elaboration still succeeds
        assert_eq!(ctx.warnings().len(), 1);
        assert!(matches!(ctx.warnings()[0], Warning::Visibility { .. }));
        assert!(ctx.get_package("p").unwrap().get_task("user").is_some());
    }

    #[test]
    fn test_import_site_config_selection() {
        let loader = {
            let mut loader = MapLoader::new();
            let mut lib = PackageDef::new("lib");
            lib.params
                .push(ParamDef::new("mode").with_default(Value::from("none")));
            lib.configs.push(ConfigDef {
                name: "sim".to_string(),
                params: vec![ParamDef::new("mode").with_default(Value::from("sim"))],
                ..Default::default()
            });
            loader.insert("lib.yaml", lib);
            loader
        };

        let mut def = PackageDef::new("p");
        def.imports.push(ImportDef::Detailed {
            path: "lib.yaml".to_string(),
            config: Some("sim".to_string()),
        });

        let mut ctx = ctx();
        Elaborator::new(&loader).elaborate(&mut ctx, &def, None).unwrap();
        assert_eq!(
            ctx.get_package("lib").unwrap().param_value("mode"),
            Some(Value::from("sim"))
        );
    }

    #[test]
    fn test_import_path_expression_restricted_to_builtins() {
        let loader = {
            let mut loader = MapLoader::new();
            loader.insert("lib/common.yaml", PackageDef::new("common"));
            loader
        };

        let mut def = PackageDef::new("p");
        def.imports
            .push(ImportDef::Path("${{ libdir }}/common.yaml".to_string()));

        // Allowed through a builtin
        let mut ctx = ctx().with_builtin("libdir", Value::from("lib"));
        Elaborator::new(&loader).elaborate(&mut ctx, &def, None).unwrap();
        assert!(ctx.get_package("common").is_some());

        // Rejected without it
        let mut bare = ElabContext::new(Arc::new(ImplRegistry::new()));
        let err = Elaborator::new(&loader)
            .elaborate(&mut bare, &def, None)
            .unwrap_err();
        assert!(matches!(err, ElaborationError::ImportExpression(_)));
    }

    #[test]
    fn test_deferred_params_stay_raw() {
        let mut def = PackageDef::new("p");
        let mut task = TaskDef::new("t");
        task.params.push(
            ParamDef::new("files").with_default(Value::from("${{ inputs | join(' ') }}")),
        );
        task.params
            .push(ParamDef::new("top").with_default(Value::from("soc")));
        def.tasks.push(task);

        let mut ctx = ctx();
        elaborate(&mut ctx, &def).unwrap();

        let pkg = ctx.get_package("p").unwrap();
        let task = pkg.get_task("t").unwrap();
        assert_eq!(task.deferred_params, vec!["files"]);
        assert_eq!(
            task.resolved_params.get("files"),
            Some(&Value::from("${{ inputs | join(' ') }}"))
        );
        assert_eq!(task.resolved_params.get("top"), Some(&Value::from("soc")));
    }

    #[test]
    fn test_unknown_impl_fatal() {
        let mut def = PackageDef::new("p");
        let mut task = TaskDef::new("t");
        task.run = Some("std.missing".to_string());
        def.tasks.push(task);

        let mut ctx = ctx();
        let err = elaborate(&mut ctx, &def).unwrap_err();
        assert!(matches!(err, ElaborationError::UnknownImpl(_)));
    }
}
