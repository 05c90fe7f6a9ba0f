use crate::eval::Evaluator;

/// Register a curried primop under its full name; names starting with `__`
/// also appear stripped inside the `builtins` attribute set.
#[macro_export]
macro_rules! def_primop {
    ($state:expr, $name:expr, $arity:expr, |$ev:ident, $args:ident| $body:expr) => {
        $state.add_primop(
            $name,
            $arity,
            move |$ev: &mut $crate::eval::Evaluator,
                  $args: &[$crate::ast::ValueRef]|
                  -> Result<$crate::ast::ValueRef, $crate::error::MarlError> { $body },
        );
    };
}

pub use def_primop;

mod attrs;
mod core;
mod list;
mod math;

pub fn install(state: &mut Evaluator) {
    core::install(state);
    math::install(state);
    list::install(state);
    attrs::install(state);
}
