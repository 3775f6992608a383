// Graph builder
// Instantiates elaborated tasks into concrete nodes, derives explicit and
// implicit dataflow edges, and rejects cycles before anything runs

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::matrix::{combination_suffix, expand_matrix};
use super::node::{NodeId, NodeKind, NodeStatus, TaskGraph, TaskNode};
use super::patterns::consumes_match;
use crate::defs::TaskDef;
use crate::elaborate::{resolve_sequential, ElabContext, Package, ParamCollection, Task};
use crate::error::{GraphError, Warning};
use crate::expression::{ScopeFrame, ScopeStack};
use crate::value::Value;

pub struct GraphBuilder<'a> {
    ctx: &'a ElabContext,
    run_root: PathBuf,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: &'a ElabContext, run_root: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            run_root: run_root.into(),
        }
    }

    /// Build the graph for the requested root tasks, named `package.task`
    pub fn build(&self, roots: &[&str]) -> Result<TaskGraph, GraphError> {
        let mut graph = TaskGraph::new();
        let mut instantiated = HashMap::new();

        for root in roots {
            self.instantiate_named(&mut graph, &mut instantiated, root, None)?;
        }

        self.add_implicit_edges(&mut graph);
        self.report_unmatched_consumers(&mut graph);
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Resolve a (possibly qualified) task name and instantiate it. Returns
    /// the node representing the task's completion.
    fn instantiate_named(
        &self,
        graph: &mut TaskGraph,
        instantiated: &mut HashMap<String, NodeId>,
        name: &str,
        from_package: Option<&str>,
    ) -> Result<NodeId, GraphError> {
        let (pkg_name, task_name) = match name.split_once('.') {
            Some((pkg, task)) => (pkg, task),
            None => match from_package {
                Some(pkg) => (pkg, name),
                None => {
                    return Err(GraphError::unknown_dependency(format!(
                        "root task '{}' must be qualified as package.task",
                        name
                    )))
                }
            },
        };

        let pkg = self.ctx.get_package(pkg_name).ok_or_else(|| {
            GraphError::unknown_dependency(format!("unknown package '{}'", pkg_name))
        })?;
        let task = pkg.get_task(task_name).ok_or_else(|| {
            GraphError::unknown_dependency(format!("unknown task '{}.{}'", pkg_name, task_name))
        })?;

        // Cross-package reference to a task without the export flag: warn,
        // keep building
        if let Some(from) = from_package {
            if from != pkg_name && !task.is_exported() {
                graph.add_warning(Warning::Visibility {
                    from_package: from.to_string(),
                    target: format!("{}.{}", pkg_name, task_name),
                });
            }
        }

        let node_name = format!("{}.{}", pkg_name, pkg.resolve_alias(task_name));
        if let Some(&id) = instantiated.get(&node_name) {
            return Ok(id);
        }

        self.instantiate_task(
            graph,
            instantiated,
            pkg,
            task,
            node_name,
            BTreeMap::new(),
            &HashMap::new(),
        )
    }

    /// Instantiate one elaborated task: a leaf node, or a strategy/body
    /// expansion converging into an aggregation node
    #[allow(clippy::too_many_arguments)]
    fn instantiate_task(
        &self,
        graph: &mut TaskGraph,
        instantiated: &mut HashMap<String, NodeId>,
        pkg: &Package,
        task: &Task,
        node_name: String,
        synthetic: BTreeMap<String, Value>,
        siblings: &HashMap<String, NodeId>,
    ) -> Result<NodeId, GraphError> {
        // Predecessors first: needs resolve against body siblings, then the
        // package namespace
        let mut need_ids = Vec::new();
        for need in &task.needs {
            let id = match siblings.get(need) {
                Some(&id) => id,
                None => self.instantiate_named(graph, instantiated, need, Some(&pkg.name))?,
            };
            need_ids.push(id);
        }

        let matrix = task.strategy.as_ref().and_then(|s| s.matrix.as_ref());
        let generate = task.strategy.as_ref().and_then(|s| s.generate.as_deref());

        let completion_id = if let Some(matrix) = matrix {
            let aggregation =
                self.make_node(task, node_name.clone(), NodeKind::Aggregation, synthetic.clone());
            let agg_id = graph.add_node(aggregation);
            instantiated.insert(node_name.clone(), agg_id);

            for combination in expand_matrix(matrix) {
                let mut child_synthetic = synthetic.clone();
                child_synthetic.extend(combination.clone());
                let child_name = format!("{}{}", node_name, combination_suffix(&combination));

                let child_id = if task.body.is_empty() {
                    let mut child = self.make_node(
                        task,
                        child_name.clone(),
                        NodeKind::Leaf,
                        child_synthetic.clone(),
                    );
                    let resolved =
                        self.resolve_node_params(pkg, &task.params, &child_synthetic, &child_name)?;
                    child.params = resolved.0;
                    child.deferred_params = resolved.1;
                    let id = graph.add_node(child);
                    instantiated.insert(child_name, id);
                    id
                } else {
                    self.instantiate_body(
                        graph,
                        instantiated,
                        pkg,
                        task,
                        &child_name,
                        child_synthetic,
                    )?
                };

                graph.add_edge(child_id, agg_id);
                for &need in &need_ids {
                    graph.add_edge(need, child_id);
                }
            }

            agg_id
        } else if let Some(generator_name) = generate {
            let generator = self.ctx.registry.get_generator(generator_name).ok_or_else(|| {
                GraphError::invalid(format!(
                    "task '{}' references unknown generator '{}'",
                    node_name, generator_name
                ))
            })?;

            let aggregation =
                self.make_node(task, node_name.clone(), NodeKind::Aggregation, synthetic.clone());
            let agg_id = graph.add_node(aggregation);
            instantiated.insert(node_name.clone(), agg_id);

            // Generators see elaborated parameter values only
            let generated = generator.generate(&task.resolved_params);
            let mut generated_ids: HashMap<String, NodeId> = HashMap::new();

            for def in &generated {
                let child_name = format!("{}.{}", node_name, def.name);
                let child_id =
                    self.node_from_def(graph, pkg, task, def, child_name.clone(), &synthetic)?;
                instantiated.insert(child_name, child_id);

                for need in &def.needs {
                    match generated_ids.get(need) {
                        Some(&sibling) => graph.add_edge(sibling, child_id),
                        None => {
                            let id = self.instantiate_named(
                                graph,
                                instantiated,
                                need,
                                Some(&pkg.name),
                            )?;
                            graph.add_edge(id, child_id);
                        }
                    }
                }

                graph.add_edge(child_id, agg_id);
                for &need in &need_ids {
                    graph.add_edge(need, child_id);
                }
                generated_ids.insert(def.name.clone(), child_id);
            }

            agg_id
        } else if !task.body.is_empty() {
            let agg_id =
                self.instantiate_body(graph, instantiated, pkg, task, &node_name, synthetic)?;
            for &need in &need_ids {
                graph.add_edge(need, agg_id);
            }
            agg_id
        } else {
            let node = self.make_node(task, node_name.clone(), NodeKind::Leaf, synthetic);
            let id = graph.add_node(node);
            instantiated.insert(node_name, id);
            for &need in &need_ids {
                graph.add_edge(need, id);
            }
            id
        };

        // feeds is the inverse view of needs
        for feed in &task.feeds {
            let feed_id = match siblings.get(feed) {
                Some(&id) => id,
                None => self.instantiate_named(graph, instantiated, feed, Some(&pkg.name))?,
            };
            graph.add_edge(completion_id, feed_id);
        }

        Ok(completion_id)
    }

    /// Instantiate a compound body under `parent_name`, children converging
    /// into an aggregation node. Body `needs` may reference earlier siblings
    /// by their short name.
    fn instantiate_body(
        &self,
        graph: &mut TaskGraph,
        instantiated: &mut HashMap<String, NodeId>,
        pkg: &Package,
        task: &Task,
        parent_name: &str,
        synthetic: BTreeMap<String, Value>,
    ) -> Result<NodeId, GraphError> {
        let aggregation = self.make_node(
            task,
            parent_name.to_string(),
            NodeKind::Aggregation,
            synthetic.clone(),
        );
        let agg_id = graph.add_node(aggregation);
        instantiated.insert(parent_name.to_string(), agg_id);

        let mut sibling_ids: HashMap<String, NodeId> = HashMap::new();
        for child in &task.body {
            let child_name = format!("{}.{}", parent_name, child.name);
            let child_id = self.instantiate_task(
                graph,
                instantiated,
                pkg,
                child,
                child_name,
                synthetic.clone(),
                &sibling_ids,
            )?;
            sibling_ids.insert(child.name.clone(), child_id);
            graph.add_edge(child_id, agg_id);
        }

        Ok(agg_id)
    }

    /// Create a leaf node directly from a generated task definition
    fn node_from_def(
        &self,
        graph: &mut TaskGraph,
        pkg: &Package,
        parent: &Task,
        def: &TaskDef,
        node_name: String,
        synthetic: &BTreeMap<String, Value>,
    ) -> Result<NodeId, GraphError> {
        let implementation = match &def.run {
            Some(run) => Some(self.ctx.registry.get_impl(run).ok_or_else(|| {
                GraphError::invalid(format!(
                    "generated task '{}' references unknown implementation '{}'",
                    node_name, run
                ))
            })?),
            None => None,
        };

        let params = ParamCollection::from_defs(&def.params);
        let mut combined = synthetic.clone();
        for (name, value) in &parent.resolved_params {
            combined.entry(name.clone()).or_insert_with(|| value.clone());
        }
        let (values, deferred) = self.resolve_node_params(pkg, &params, &combined, &node_name)?;

        let node = TaskNode {
            id: 0,
            name: node_name.clone(),
            task_name: node_name.clone(),
            package: pkg.name.clone(),
            kind: NodeKind::Leaf,
            params: values,
            deferred_params: deferred,
            consumes: def.consumes.clone(),
            produces: def.produces.clone(),
            passthrough: def.passthrough,
            cache: def.cache.clone(),
            check: def.check.clone(),
            implementation,
            run_dir: self.run_root.join(&node_name),
            synthetic: synthetic.clone(),
            status: NodeStatus::Pending,
            changed: false,
            skipped: false,
            outputs: Vec::new(),
            markers: Vec::new(),
            started_at: None,
            finished_at: None,
        };
        Ok(graph.add_node(node))
    }

    fn make_node(
        &self,
        task: &Task,
        name: String,
        kind: NodeKind,
        synthetic: BTreeMap<String, Value>,
    ) -> TaskNode {
        TaskNode {
            id: 0,
            name: name.clone(),
            task_name: task.qualified_name(),
            package: task.package.clone(),
            kind,
            params: task.resolved_params.clone(),
            deferred_params: task.deferred_params.clone(),
            consumes: task.consumes.clone(),
            produces: task.produces.clone(),
            passthrough: task.passthrough,
            cache: task.cache.clone(),
            check: task.check.clone(),
            implementation: if kind == NodeKind::Leaf {
                task.implementation.clone()
            } else {
                None
            },
            run_dir: self.run_root.join(&name),
            synthetic,
            status: NodeStatus::Pending,
            changed: false,
            skipped: false,
            outputs: Vec::new(),
            markers: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Re-resolve a parameter collection with instantiation-time synthetic
    /// bindings (matrix variables) in scope
    fn resolve_node_params(
        &self,
        pkg: &Package,
        params: &ParamCollection,
        synthetic: &BTreeMap<String, Value>,
        owner: &str,
    ) -> Result<(BTreeMap<String, Value>, Vec<String>), GraphError> {
        let mut scope = ScopeStack::new(pkg.resolved_params.clone());
        let mut frame = ScopeFrame::for_task(&pkg.name, owner);
        for (name, value) in synthetic {
            frame = frame.with_synthetic(name.clone(), value.clone());
        }
        scope.push(frame);

        let resolved = resolve_sequential(self.ctx, params, scope, owner)
            .map_err(|e| GraphError::invalid(format!("task '{}': {}", owner, e)))?;
        Ok((resolved.values, resolved.deferred))
    }

    /// Implicit edges: producer -> consumer wherever a consume pattern
    /// subset-matches a produce pattern
    fn add_implicit_edges(&self, graph: &mut TaskGraph) {
        let mut edges = Vec::new();
        for consumer in graph.nodes() {
            if consumer.consumes.patterns().is_empty() {
                continue;
            }
            for producer in graph.nodes() {
                if producer.id == consumer.id {
                    continue;
                }
                if consumes_match(&consumer.consumes, &producer.produces) {
                    edges.push((producer.id, consumer.id));
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
    }

    /// A consume pattern no producer satisfies is reported, not fatal
    fn report_unmatched_consumers(&self, graph: &mut TaskGraph) {
        let mut warnings = Vec::new();
        for consumer in graph.nodes() {
            for pattern in consumer.consumes.patterns() {
                let matched = graph.nodes().iter().any(|producer| {
                    producer.id != consumer.id
                        && producer
                            .produces
                            .iter()
                            .any(|p| super::patterns::pattern_matches(pattern, p))
                });
                if !matched {
                    warnings.push(Warning::DataflowMismatch {
                        task: consumer.name.clone(),
                        pattern: Value::Map(pattern.clone()).canonical_json(),
                    });
                }
            }
        }
        for warning in warnings {
            graph.add_warning(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{ConsumeSpec, PackageDef, ParamDef, Pattern, Strategy};
    use crate::elaborate::{Elaborator, MapLoader};
    use crate::runner::ImplRegistry;
    use std::sync::Arc;

    fn build_ctx(def: PackageDef) -> ElabContext {
        let mut ctx = ElabContext::new(Arc::new(ImplRegistry::new()));
        let loader = MapLoader::new();
        Elaborator::new(&loader).elaborate(&mut ctx, &def, None).unwrap();
        ctx
    }

    fn pattern(pairs: &[(&str, &str)]) -> Pattern {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_needs_edges() {
        let mut def = PackageDef::new("p");
        def.tasks.push(TaskDef::new("compile"));
        let mut link = TaskDef::new("link");
        link.needs.push("compile".to_string());
        def.tasks.push(link);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.link"]).unwrap();

        assert_eq!(graph.len(), 2);
        let compile = graph.find("p.compile").unwrap();
        let link = graph.find("p.link").unwrap();
        assert_eq!(graph.successors(compile), &[link]);
    }

    #[test]
    fn test_feeds_merges_into_same_edge_set() {
        let mut def = PackageDef::new("p");
        let mut compile = TaskDef::new("compile");
        compile.feeds.push("link".to_string());
        def.tasks.push(compile);
        def.tasks.push(TaskDef::new("link"));

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run")
            .build(&["p.compile"])
            .unwrap();

        let compile = graph.find("p.compile").unwrap();
        let link = graph.find("p.link").unwrap();
        assert_eq!(graph.successors(compile), &[link]);
    }

    #[test]
    fn test_cycle_rejected_before_execution() {
        let mut def = PackageDef::new("p");
        let mut a = TaskDef::new("a");
        a.needs.push("b".to_string());
        let mut b = TaskDef::new("b");
        b.needs.push("a".to_string());
        def.tasks.push(a);
        def.tasks.push(b);

        let ctx = build_ctx(def);
        let err = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.a"]).unwrap_err();
        assert_eq!(err.kind, crate::error::GraphErrorKind::Cyclic);
    }

    #[test]
    fn test_matrix_expansion_nine_children_one_aggregation() {
        let mut def = PackageDef::new("p");
        let mut sweep = TaskDef::new("sweep");
        let mut matrix = BTreeMap::new();
        matrix.insert(
            "width".to_string(),
            vec![Value::from(8.0), Value::from(16.0), Value::from(32.0)],
        );
        matrix.insert(
            "mode".to_string(),
            vec![Value::from("a"), Value::from("b"), Value::from("c")],
        );
        sweep.strategy = Some(Strategy {
            matrix: Some(matrix),
            generate: None,
        });
        def.tasks.push(sweep);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.sweep"]).unwrap();

        // 9 children + 1 aggregation
        assert_eq!(graph.len(), 10);
        let agg = graph.find("p.sweep").unwrap();
        assert_eq!(graph.node(agg).kind, NodeKind::Aggregation);
        assert_eq!(graph.predecessors(agg).len(), 9);

        // Each child carries a distinct combination
        let mut bindings = std::collections::HashSet::new();
        for node in graph.nodes() {
            if node.kind == NodeKind::Leaf {
                bindings.insert(format!(
                    "{}-{}",
                    node.synthetic.get("width").unwrap().as_string(),
                    node.synthetic.get("mode").unwrap().as_string()
                ));
            }
        }
        assert_eq!(bindings.len(), 9);
    }

    #[test]
    fn test_matrix_params_resolved_per_combination() {
        let mut def = PackageDef::new("p");
        let mut sweep = TaskDef::new("sweep");
        let mut matrix = BTreeMap::new();
        matrix.insert("width".to_string(), vec![Value::from(8.0), Value::from(16.0)]);
        sweep.strategy = Some(Strategy {
            matrix: Some(matrix),
            generate: None,
        });
        sweep
            .params
            .push(ParamDef::new("flag").with_default(Value::from("-w${{ width }}")));
        def.tasks.push(sweep);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.sweep"]).unwrap();

        let child = graph.find("p.sweep[width=8]").unwrap();
        assert_eq!(
            graph.node(child).params.get("flag"),
            Some(&Value::from("-w8"))
        );
        let child = graph.find("p.sweep[width=16]").unwrap();
        assert_eq!(
            graph.node(child).params.get("flag"),
            Some(&Value::from("-w16"))
        );
    }

    #[test]
    fn test_generate_strategy_splices_nodes() {
        struct Fanout;
        impl crate::runner::Generator for Fanout {
            fn generate(&self, params: &BTreeMap<String, Value>) -> Vec<TaskDef> {
                let n = params
                    .get("count")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0) as usize;
                (0..n).map(|i| TaskDef::new(format!("part{}", i))).collect()
            }
        }

        let mut registry = ImplRegistry::new();
        registry.register_generator("fanout", Arc::new(Fanout));

        let mut def = PackageDef::new("p");
        let mut gen_task = TaskDef::new("split");
        gen_task.strategy = Some(Strategy {
            matrix: None,
            generate: Some("fanout".to_string()),
        });
        gen_task
            .params
            .push(ParamDef::new("count").with_default(Value::from(3.0)));
        def.tasks.push(gen_task);

        let mut ctx = ElabContext::new(Arc::new(registry));
        let loader = MapLoader::new();
        Elaborator::new(&loader).elaborate(&mut ctx, &def, None).unwrap();

        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.split"]).unwrap();

        // 3 generated + aggregation
        assert_eq!(graph.len(), 4);
        let agg = graph.find("p.split").unwrap();
        assert_eq!(graph.predecessors(agg).len(), 3);
        assert!(graph.find("p.split.part0").is_some());
    }

    #[test]
    fn test_implicit_consume_produce_edge() {
        let mut def = PackageDef::new("p");
        let mut producer = TaskDef::new("compile");
        producer
            .produces
            .push(pattern(&[("type", "fileset"), ("filetype", "verilog"), ("vendor", "s")]));
        def.tasks.push(producer);
        let mut consumer = TaskDef::new("elaborate");
        consumer.consumes =
            ConsumeSpec::Patterns(vec![pattern(&[("type", "fileset"), ("filetype", "verilog")])]);
        def.tasks.push(consumer);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run")
            .build(&["p.compile", "p.elaborate"])
            .unwrap();

        let compile = graph.find("p.compile").unwrap();
        let elaborate = graph.find("p.elaborate").unwrap();
        assert!(graph.successors(compile).contains(&elaborate));
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn test_unmatched_consumer_warns_not_fatal() {
        let mut def = PackageDef::new("p");
        let mut consumer = TaskDef::new("lonely");
        consumer.consumes =
            ConsumeSpec::Patterns(vec![pattern(&[("type", "fileset"), ("filetype", "vhdl")])]);
        def.tasks.push(consumer);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.lonely"]).unwrap();

        assert_eq!(graph.warnings().len(), 1);
        assert!(matches!(
            graph.warnings()[0],
            Warning::DataflowMismatch { .. }
        ));
    }

    #[test]
    fn test_compound_body_converges_to_aggregation() {
        let mut def = PackageDef::new("p");
        let mut compound = TaskDef::new("flow");
        compound.body.push(TaskDef::new("first"));
        let mut second = TaskDef::new("second");
        second.needs.push("first".to_string());
        compound.body.push(second);
        def.tasks.push(compound);

        let ctx = build_ctx(def);
        let graph = GraphBuilder::new(&ctx, "/tmp/run").build(&["p.flow"]).unwrap();

        assert_eq!(graph.len(), 3);
        let agg = graph.find("p.flow").unwrap();
        let first = graph.find("p.flow.first").unwrap();
        let second = graph.find("p.flow.second").unwrap();

        assert_eq!(graph.node(agg).kind, NodeKind::Aggregation);
        assert!(graph.successors(first).contains(&second));
        assert!(graph.successors(second).contains(&agg));
    }
}
