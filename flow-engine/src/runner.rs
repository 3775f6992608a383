// External collaborator interfaces
// Task implementations, generators, custom up-to-date checks, and the
// registry resolving implementation references during elaboration

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::defs::{DataItem, Marker, TaskDef};
use crate::value::Value;

/// Everything a task implementation receives when its node runs
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub params: BTreeMap<String, Value>,
    pub inputs: Vec<DataItem>,
    /// True when any upstream producer reported a change this run
    pub changed: bool,
    pub memento: Option<Value>,
}

/// Result of one task implementation invocation
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// 0 = success
    pub status: i32,
    pub changed: bool,
    pub outputs: Vec<DataItem>,
    pub markers: Vec<Marker>,
    pub memento: Option<Value>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            status: 0,
            changed: true,
            outputs: Vec::new(),
            markers: Vec::new(),
            memento: None,
        }
    }

    pub fn failure(status: i32) -> Self {
        Self {
            status,
            changed: true,
            outputs: Vec::new(),
            markers: Vec::new(),
            memento: None,
        }
    }

    pub fn with_output(mut self, item: DataItem) -> Self {
        self.outputs.push(item);
        self
    }

    pub fn with_memento(mut self, memento: Value) -> Self {
        self.memento = Some(memento);
        self
    }
}

/// One subprocess invocation, logged into the execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub status: i32,
}

/// Captured output of a subprocess run through the run context
#[derive(Debug, Clone)]
pub struct SubprocessResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Per-node run context handed to task implementations: the run directory,
/// a subprocess helper, and a diagnostic-marker emitter.
pub struct RunContext {
    run_dir: PathBuf,
    markers: Mutex<Vec<Marker>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl RunContext {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            markers: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Emit a diagnostic marker; markers are always surfaced to the user
    /// regardless of severity
    pub fn emit_marker(&self, marker: Marker) {
        if let Ok(mut markers) = self.markers.lock() {
            markers.push(marker);
        }
    }

    /// Run a subprocess in the run directory, capturing output and logging
    /// the invocation
    pub async fn exec_subprocess(
        &self,
        program: &str,
        args: &[&str],
    ) -> std::io::Result<SubprocessResult> {
        let resolved = which::which(program)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;

        let output = Command::new(&resolved)
            .args(args)
            .current_dir(&self.run_dir)
            .output()
            .await?;

        let status = output.status.code().unwrap_or(-1);

        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(Invocation {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                status,
            });
        }

        Ok(SubprocessResult {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Drain markers emitted through this context
    pub fn take_markers(&self) -> Vec<Marker> {
        self.markers.lock().map(|mut m| std::mem::take(&mut *m)).unwrap_or_default()
    }

    /// Drain the subprocess invocation log
    pub fn take_invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|mut i| std::mem::take(&mut *i))
            .unwrap_or_default()
    }
}

/// A task implementation, invoked by the scheduler once its node is running
#[async_trait]
pub trait TaskImpl: Send + Sync {
    async fn run(&self, ctx: &RunContext, input: TaskInput) -> TaskOutcome;
}

/// Shared handle to a resolved task implementation
pub type ImplHandle = Arc<dyn TaskImpl>;

/// Build-time generator for the `generate` strategy. Sees elaborated
/// parameter values only, never dataflow values.
pub trait Generator: Send + Sync {
    fn generate(&self, params: &BTreeMap<String, Value>) -> Vec<TaskDef>;
}

/// Custom up-to-date check, consulted after parameter and input-signature
/// comparison both pass
#[async_trait]
pub trait UpToDateCheck: Send + Sync {
    async fn is_up_to_date(&self, memento: Option<&Value>, run_dir: &Path) -> bool;
}

/// Registry mapping qualified names to implementations. References are
/// resolved here exactly once, during elaboration.
#[derive(Default)]
pub struct ImplRegistry {
    impls: HashMap<String, ImplHandle>,
    generators: HashMap<String, Arc<dyn Generator>>,
    checks: HashMap<String, Arc<dyn UpToDateCheck>>,
}

impl ImplRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_impl(&mut self, name: impl Into<String>, implementation: ImplHandle) {
        self.impls.insert(name.into(), implementation);
    }

    pub fn register_generator(&mut self, name: impl Into<String>, generator: Arc<dyn Generator>) {
        self.generators.insert(name.into(), generator);
    }

    pub fn register_check(&mut self, name: impl Into<String>, check: Arc<dyn UpToDateCheck>) {
        self.checks.insert(name.into(), check);
    }

    pub fn get_impl(&self, name: &str) -> Option<ImplHandle> {
        self.impls.get(name).cloned()
    }

    pub fn get_generator(&self, name: &str) -> Option<Arc<dyn Generator>> {
        self.generators.get(name).cloned()
    }

    pub fn get_check(&self, name: &str) -> Option<Arc<dyn UpToDateCheck>> {
        self.checks.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskImpl for Noop {
        async fn run(&self, _ctx: &RunContext, _input: TaskInput) -> TaskOutcome {
            TaskOutcome::success()
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ImplRegistry::new();
        registry.register_impl("std.noop", Arc::new(Noop));

        assert!(registry.get_impl("std.noop").is_some());
        assert!(registry.get_impl("std.missing").is_none());
    }

    #[test]
    fn test_marker_collection() {
        let ctx = RunContext::new("/tmp");
        ctx.emit_marker(Marker::warning("late binding"));
        ctx.emit_marker(Marker::info("done"));

        let markers = ctx.take_markers();
        assert_eq!(markers.len(), 2);
        assert!(ctx.take_markers().is_empty());
    }

    #[tokio::test]
    async fn test_subprocess_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::new(dir.path());

        let result = ctx.exec_subprocess("echo", &["hello"]).await.unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.stdout.trim(), "hello");

        let log = ctx.take_invocations();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].program, "echo");
    }

    #[tokio::test]
    async fn test_subprocess_missing_program() {
        let ctx = RunContext::new("/tmp");
        assert!(ctx
            .exec_subprocess("definitely-not-a-real-program-xyz", &[])
            .await
            .is_err());
    }
}
