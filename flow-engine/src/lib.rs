// flow-engine
// Dataflow task orchestration: packages of parameterized tasks are
// elaborated into a namespace, instantiated into a dependency graph, and
// executed concurrently with incremental checking and artifact caching.

pub mod cache;
pub mod defs;
pub mod elaborate;
pub mod error;
pub mod exec;
pub mod expression;
pub mod graph;
pub mod runner;
pub mod value;

pub use cache::{CacheProvider, HashProvider, HashRegistry, LocalCache, TieredCache};
pub use defs::{DataItem, Marker, PackageDef, Severity, TaskDef};
pub use elaborate::{ElabContext, Elaborator, MapLoader, PackageLoader};
pub use error::{EngineError, Result, Warning};
pub use exec::{ExecutionEvent, RunSummary, Scheduler};
pub use graph::{GraphBuilder, TaskGraph};
pub use runner::{
    Generator, ImplRegistry, RunContext, TaskImpl, TaskInput, TaskOutcome, UpToDateCheck,
};
pub use value::Value;
