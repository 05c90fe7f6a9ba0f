use std::fmt;

use thiserror::Error;

use crate::ast::Pos;

pub const ERROR_TAG: &str = "\x1b[31m[ERROR]\x1b[0m";
pub const WARN_TAG: &str = "\x1b[33m[WARN]\x1b[0m";

/// Position and evaluation-trace information attached to an error as it
/// unwinds the dispatcher.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    pub pos: Option<Pos>,
    /// Innermost first; rendered outermost first, matching unwind order.
    pub trace: Vec<String>,
}

impl ErrorContext {
    fn set_pos(&mut self, pos: Pos) {
        if self.pos.is_none() {
            self.pos = Some(pos);
        }
    }
}

#[derive(Clone, Debug)]
pub struct EvalErrorData {
    pub message: String,
    pub context: ErrorContext,
}

impl EvalErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }
}

impl fmt::Display for EvalErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum MarlError {
    #[error("parse error: {0}")]
    Parse(EvalErrorData),

    #[error("undefined variable `{name}`")]
    UndefinedVariable { name: String, context: ErrorContext },

    #[error("value is {actual} while {expected} was expected")]
    TypeMismatch {
        expected: String,
        actual: String,
        context: ErrorContext,
    },

    #[error("{0}")]
    TypeError(EvalErrorData),

    #[error("attribute `{name}` missing")]
    AttrMissing { name: String, context: ErrorContext },

    #[error("the argument named `{name}` required by the function is missing")]
    MissingArgument { name: String, context: ErrorContext },

    #[error("function called with unexpected argument")]
    UnexpectedArgument { context: ErrorContext },

    #[error("assertion failed at {pos}")]
    Assertion { pos: Pos, context: ErrorContext },

    #[error("infinite recursion encountered")]
    InfiniteRecursion { context: ErrorContext },

    #[error("{0}")]
    Eval(EvalErrorData),

    #[error("evaluation interrupted")]
    Interrupted,
}

impl MarlError {
    pub fn parse(message: impl Into<String>) -> Self {
        MarlError::Parse(EvalErrorData::new(message))
    }

    pub fn undefined_variable(name: impl Into<String>) -> Self {
        MarlError::UndefinedVariable {
            name: name.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        MarlError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        MarlError::TypeError(EvalErrorData::new(message))
    }

    pub fn attr_missing(name: impl Into<String>) -> Self {
        MarlError::AttrMissing {
            name: name.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn missing_argument(name: impl Into<String>) -> Self {
        MarlError::MissingArgument {
            name: name.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn unexpected_argument() -> Self {
        MarlError::UnexpectedArgument {
            context: ErrorContext::default(),
        }
    }

    pub fn assertion(pos: Pos) -> Self {
        MarlError::Assertion {
            pos,
            context: ErrorContext::default(),
        }
    }

    pub fn infinite_recursion() -> Self {
        MarlError::InfiniteRecursion {
            context: ErrorContext::default(),
        }
    }

    pub fn eval(message: impl Into<String>) -> Self {
        MarlError::Eval(EvalErrorData::new(message))
    }

    pub fn with_pos(mut self, pos: Pos) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.set_pos(pos);
        }
        self
    }

    /// Attach a `while evaluating …` frame. Inner frames are added first.
    pub fn added_context(mut self, frame: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.trace.push(frame.into());
        }
        self
    }

    pub fn pos(&self) -> Option<Pos> {
        self.context_ref().and_then(|ctx| ctx.pos)
    }

    pub fn trace(&self) -> &[String] {
        self.context_ref()
            .map(|ctx| ctx.trace.as_slice())
            .unwrap_or(&[])
    }

    fn context_ref(&self) -> Option<&ErrorContext> {
        match self {
            MarlError::Parse(data) | MarlError::TypeError(data) | MarlError::Eval(data) => {
                Some(&data.context)
            }
            MarlError::UndefinedVariable { context, .. }
            | MarlError::TypeMismatch { context, .. }
            | MarlError::AttrMissing { context, .. }
            | MarlError::MissingArgument { context, .. }
            | MarlError::UnexpectedArgument { context }
            | MarlError::Assertion { context, .. }
            | MarlError::InfiniteRecursion { context } => Some(context),
            MarlError::Interrupted => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            MarlError::Parse(data) | MarlError::TypeError(data) | MarlError::Eval(data) => {
                Some(&mut data.context)
            }
            MarlError::UndefinedVariable { context, .. }
            | MarlError::TypeMismatch { context, .. }
            | MarlError::AttrMissing { context, .. }
            | MarlError::MissingArgument { context, .. }
            | MarlError::UnexpectedArgument { context }
            | MarlError::Assertion { context, .. }
            | MarlError::InfiniteRecursion { context } => Some(context),
            MarlError::Interrupted => None,
        }
    }
}

/// Render an error the way the CLI reports it: the message line, then the
/// evaluation trace outermost first, then the source position.
pub fn format_error(err: &MarlError) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("{} {}", ERROR_TAG, err));
    for frame in err.trace().iter().rev() {
        lines.push(format!("  {}", frame));
    }
    if let Some(pos) = err.pos() {
        lines.push(format!("  at {}", pos));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_frames_render_outermost_first() {
        let err = MarlError::attr_missing("x")
            .added_context("while evaluating the attribute `x`")
            .added_context("while evaluating the file `/tmp/a.marl`");
        let lines = format_error(&err);
        assert!(lines[0].contains("attribute `x` missing"));
        assert!(lines[1].contains("file `/tmp/a.marl`"));
        assert!(lines[2].contains("attribute `x`"));
    }

    #[test]
    fn first_position_wins() {
        let err = MarlError::eval("boom")
            .with_pos(Pos { line: 3, col: 7 })
            .with_pos(Pos { line: 9, col: 1 });
        assert_eq!(err.pos(), Some(Pos { line: 3, col: 7 }));
    }
}
