use std::path::PathBuf;

use marl_core::error::MarlError;
use marl_core::options::EvalOptions;
use marl_core::{parser, Evaluator};

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub source: Option<String>,
    pub file: Option<PathBuf>,
    /// Force the whole result instead of stopping at weak head normal form.
    pub strict: bool,
    pub options: EvalOptions,
}

impl RunRequest {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            file: None,
            strict: true,
            options: EvalOptions::default(),
        }
    }
}

/// Evaluate the request and render the result, reporting evaluator
/// statistics on the way out when enabled.
pub fn run(request: &RunRequest) -> Result<String, MarlError> {
    let mut state = Evaluator::new(request.options.clone());
    let value = if let Some(source) = &request.source {
        let expr = parser::parse_source(source)?;
        let env = state.base_env();
        state.eval(&env, &expr)?
    } else if let Some(file) = &request.file {
        state.eval_file(file)?
    } else {
        return Err(MarlError::eval("nothing to evaluate"));
    };
    if request.strict {
        state.strict_force_value(&value)?;
    }
    let rendered = format!("{}", value.borrow());
    state.print_stats();
    Ok(rendered)
}
