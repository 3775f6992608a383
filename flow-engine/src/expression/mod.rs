// Expression engine
// ${{ }} expressions: lexing, parsing, scoped evaluation, built-in filters

pub mod evaluator;
pub mod filters;
pub mod lexer;
pub mod parser;
pub mod scope;

pub use evaluator::{Evaluator, ResolutionError};
pub use lexer::{extract_expressions, has_expressions, Segment};
pub use parser::{parse_expression, Expr};
pub use scope::{QualifiedResolver, ScopeFrame, ScopeStack};
