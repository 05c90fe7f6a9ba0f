pub mod ast;
pub mod builtins;
pub mod env;
pub mod error;
pub mod eval;
pub mod interrupt;
pub mod options;
pub mod parser;
pub mod store;
pub mod string_escape;
pub mod symbols;

use std::path::Path;

use ast::ValueRef;
use error::MarlError;
use options::EvalOptions;

pub use eval::Evaluator;

/// Evaluate a source string against a fresh evaluator.
pub fn eval_source(src: &str, options: EvalOptions) -> Result<ValueRef, MarlError> {
    let expr = parser::parse_source(src)?;
    let mut state = Evaluator::new(options);
    let env = state.base_env();
    state.eval(&env, &expr)
}

/// Evaluate a file against a fresh evaluator.
pub fn eval_file(path: &Path, options: EvalOptions) -> Result<ValueRef, MarlError> {
    let mut state = Evaluator::new(options);
    state.eval_file(path)
}
