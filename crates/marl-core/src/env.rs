use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Value, ValueRef};
use crate::error::MarlError;
use crate::symbols::Sym;

pub type EnvRef = Rc<RefCell<Env>>;

/// One frame of the lexical scope chain. A frame holding `with_attrs` is a
/// dynamic-scope frame introduced by a `with` expression.
#[derive(Default)]
pub struct Env {
    bindings: HashMap<Sym, ValueRef>,
    up: Option<EnvRef>,
    with_attrs: Option<ValueRef>,
}

impl Env {
    pub fn new_child(up: EnvRef) -> Self {
        Self {
            bindings: HashMap::new(),
            up: Some(up),
            with_attrs: None,
        }
    }

    pub fn set(&mut self, name: Sym, value: ValueRef) {
        self.bindings.insert(name, value);
    }

    pub fn get_local(&self, name: &Sym) -> Option<ValueRef> {
        self.bindings.get(name).cloned()
    }

    pub fn up(&self) -> Option<EnvRef> {
        self.up.clone()
    }

    pub fn set_with_attrs(&mut self, attrs: ValueRef) {
        self.with_attrs = Some(attrs);
    }

    pub fn with_attrs(&self) -> Option<ValueRef> {
        self.with_attrs.clone()
    }
}

pub fn new_ref(env: Env) -> EnvRef {
    Rc::new(RefCell::new(env))
}

/// Resolve `name` in `env`. Lexical bindings shadow every `with`-introduced
/// name; among `with` frames the outermost wins.
pub fn lookup_var(env: &EnvRef, name: &Sym) -> Result<ValueRef, MarlError> {
    let mut cursor = Some(env.clone());
    while let Some(frame) = cursor {
        let frame = frame.borrow();
        if let Some(found) = frame.get_local(name) {
            return Ok(found);
        }
        cursor = frame.up();
    }

    match lookup_with(Some(env.clone()), name) {
        Some(found) => Ok(found),
        None => Err(MarlError::undefined_variable(name.as_str())),
    }
}

/// Ascends before consulting its own frame, so the outermost `with` is
/// checked first.
fn lookup_with(env: Option<EnvRef>, name: &Sym) -> Option<ValueRef> {
    let frame = env?;
    let frame = frame.borrow();
    if let Some(found) = lookup_with(frame.up(), name) {
        return Some(found);
    }
    let attrs = frame.with_attrs()?;
    let found = match &*attrs.borrow() {
        Value::Attrs(map) => map.get(name).cloned(),
        _ => None,
    };
    found
}
