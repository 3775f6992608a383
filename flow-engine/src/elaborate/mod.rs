// Elaboration
// Raw package definitions to a fully-merged namespace of types and tasks

pub mod context;
pub mod elaborator;
pub mod model;
pub mod params;

pub use context::{ElabContext, MapLoader, PackageLoader};
pub use elaborator::{resolve_sequential, value_is_deferred, Elaborator, ResolvedParams};
pub use model::{Package, Task, Type};
pub use params::ParamCollection;
