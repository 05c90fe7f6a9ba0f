use std::collections::HashMap;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::{
    new_value, Attrs, Context, Expr, ExprKind, Pattern, PrimOp, Value, ValueRef,
};
use crate::builtins;
use crate::env::{self, Env, EnvRef};
use crate::error::MarlError;
use crate::interrupt::check_for_interrupt;
use crate::options::{show_stats_from_env, unsafe_eq_disabled_from_env, EvalOptions};
use crate::parser;
use crate::store::{canon_path, is_derivation_path, LocalStore, Store, DRV_EXTENSION};
use crate::symbols::Sym;

#[derive(Clone, Copy, Debug, Default)]
pub struct EvalStats {
    pub nr_evaluated: usize,
    pub nr_values: usize,
    pub nr_envs: usize,
    pub max_depth: usize,
}

pub struct Evaluator {
    base_env: EnvRef,
    builtins: ValueRef,
    store: Rc<dyn Store>,
    options: EvalOptions,
    /// Makes `add_to_store` idempotent per source path.
    src_to_store: HashMap<String, String>,
    /// Parse trees, memoized by canonical path.
    file_cache: HashMap<PathBuf, Rc<Expr>>,
    stats: EvalStats,
    depth: usize,
    allow_unsafe_equality: bool,
}

impl Evaluator {
    pub fn new(options: EvalOptions) -> Self {
        let store = Rc::new(LocalStore::new(options.store_dir.clone()));
        Self::with_store(options, store)
    }

    pub fn with_store(options: EvalOptions, store: Rc<dyn Store>) -> Self {
        let base_env = env::new_ref(Env::default());
        let builtins_set = new_value(Value::Attrs(Attrs::new()));
        base_env
            .borrow_mut()
            .set(Sym::new("builtins"), builtins_set.clone());
        let mut state = Self {
            base_env,
            builtins: builtins_set,
            store,
            options,
            src_to_store: HashMap::new(),
            file_cache: HashMap::new(),
            stats: EvalStats::default(),
            depth: 0,
            allow_unsafe_equality: !unsafe_eq_disabled_from_env(),
        };
        builtins::install(&mut state);
        state
    }

    pub fn base_env(&self) -> EnvRef {
        self.base_env.clone()
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn options(&self) -> &EvalOptions {
        &self.options
    }

    /// Reserved: will select a stricter equality mode once one exists.
    pub fn allow_unsafe_equality(&self) -> bool {
        self.allow_unsafe_equality
    }

    pub fn alloc_value(&mut self, v: Value) -> ValueRef {
        self.stats.nr_values += 1;
        new_value(v)
    }

    fn alloc_env(&mut self, up: EnvRef) -> EnvRef {
        self.stats.nr_envs += 1;
        env::new_ref(Env::new_child(up))
    }

    fn mk_thunk(&mut self, env: &EnvRef, expr: &Rc<Expr>) -> ValueRef {
        self.alloc_value(Value::Thunk {
            env: env.clone(),
            expr: expr.clone(),
        })
    }

    /// Bind a constant under its full name in the base environment and under
    /// its `__`-stripped name inside `builtins`.
    pub fn add_constant(&mut self, name: &str, v: ValueRef) {
        self.base_env.borrow_mut().set(Sym::new(name), v.clone());
        let stripped = name.strip_prefix("__").unwrap_or(name);
        if let Value::Attrs(map) = &mut *self.builtins.borrow_mut() {
            map.insert(Sym::new(stripped), v);
        }
        self.stats.nr_values += 2;
    }

    pub fn add_primop(
        &mut self,
        name: &str,
        arity: usize,
        fun: impl Fn(&mut Evaluator, &[ValueRef]) -> Result<ValueRef, MarlError> + 'static,
    ) {
        let v = self.alloc_value(Value::PrimOp(Rc::new(PrimOp::new(name, arity, fun))));
        self.add_constant(name, v);
    }

    /// Evaluate a file, memoizing its parse tree by canonical path.
    pub fn eval_file(&mut self, path: &Path) -> Result<ValueRef, MarlError> {
        let canon = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let expr = match self.file_cache.get(&canon) {
            Some(cached) => cached.clone(),
            None => {
                let src = fs::read_to_string(&canon).map_err(|err| {
                    MarlError::eval(format!("cannot read `{}`: {}", canon.display(), err))
                })?;
                let base_dir = canon
                    .parent()
                    .map(|dir| dir.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "/".into());
                let parsed = Rc::new(parser::parse_source_in(&src, &base_dir)?);
                self.file_cache.insert(canon.clone(), parsed.clone());
                parsed
            }
        };
        let base = self.base_env();
        self.eval(&base, &expr).map_err(|err| {
            err.added_context(format!("while evaluating the file `{}`", canon.display()))
        })
    }

    pub fn eval(&mut self, env: &EnvRef, expr: &Expr) -> Result<ValueRef, MarlError> {
        check_for_interrupt()?;
        if self.depth >= self.options.max_depth {
            return Err(MarlError::infinite_recursion().with_pos(expr.pos));
        }
        self.stats.nr_evaluated += 1;
        self.depth += 1;
        if self.depth > self.stats.max_depth {
            self.stats.max_depth = self.depth;
        }
        let result = self.eval_expr(env, expr);
        self.depth -= 1;
        result
    }

    fn eval_expr(&mut self, env: &EnvRef, expr: &Expr) -> Result<ValueRef, MarlError> {
        match &expr.kind {
            ExprKind::Var(name) => {
                let found = env::lookup_var(env, name).map_err(|e| e.with_pos(expr.pos))?;
                self.force_value(&found)?;
                Ok(found)
            }

            ExprKind::Int(n) => Ok(self.alloc_value(Value::Int(*n))),

            ExprKind::Str(s) => Ok(self.alloc_value(Value::string(s.clone()))),

            ExprKind::Path(p) => Ok(self.alloc_value(Value::Path(p.clone()))),

            ExprKind::Attrs(binds) => {
                let mut map = Attrs::new();
                for bind in binds {
                    let thunk = self.mk_thunk(env, &bind.expr);
                    map.insert(bind.name.clone(), thunk);
                }
                Ok(self.alloc_value(Value::Attrs(map)))
            }

            ExprKind::Rec {
                rec_binds,
                nonrec_binds,
            } => {
                // The new environment and the attribute set share the same
                // handles, which is how the bindings see each other.
                let env2 = self.alloc_env(env.clone());
                let mut map = Attrs::new();
                for bind in rec_binds {
                    let thunk = self.mk_thunk(&env2, &bind.expr);
                    env2.borrow_mut().set(bind.name.clone(), thunk.clone());
                    map.insert(bind.name.clone(), thunk);
                }
                for bind in nonrec_binds {
                    let thunk = self.mk_thunk(env, &bind.expr);
                    env2.borrow_mut().set(bind.name.clone(), thunk.clone());
                    map.insert(bind.name.clone(), thunk);
                }
                Ok(self.alloc_value(Value::Attrs(map)))
            }

            ExprKind::Select { subject, name } => {
                let set = self.eval(env, subject)?;
                let map = self.force_attrs(&set)?;
                let Some(attr) = map.get(name).cloned() else {
                    return Err(MarlError::attr_missing(name.as_str()).with_pos(expr.pos));
                };
                self.force_value(&attr).map_err(|err| {
                    err.added_context(format!("while evaluating the attribute `{}`", name))
                })?;
                Ok(attr)
            }

            ExprKind::HasAttr { subject, name } => {
                let set = self.eval(env, subject)?;
                let map = self.force_attrs(&set)?;
                Ok(self.alloc_value(Value::Bool(map.contains_key(name))))
            }

            ExprKind::Function { pattern, body } => Ok(self.alloc_value(Value::Lambda {
                env: env.clone(),
                pattern: pattern.clone(),
                body: body.clone(),
            })),

            ExprKind::Call { fun, arg } => {
                let vfun = self.eval(env, fun)?;
                let varg = self.mk_thunk(env, arg);
                self.call_function(vfun, varg)
            }

            ExprKind::With { attrs, body } => {
                let env2 = self.alloc_env(env.clone());
                // Evaluated eagerly: the set must exist to take part in name
                // resolution.
                let vattrs = self.eval(env, attrs)?;
                self.force_attrs(&vattrs)?;
                env2.borrow_mut().set_with_attrs(vattrs);
                self.eval(&env2, body)
            }

            ExprKind::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.mk_thunk(env, item));
                }
                Ok(self.alloc_value(Value::List(out)))
            }

            ExprKind::OpEq(e1, e2) => {
                let v1 = self.eval(env, e1)?;
                let v2 = self.eval(env, e2)?;
                let eq = self.eq_values(&v1, &v2)?;
                Ok(self.alloc_value(Value::Bool(eq)))
            }

            ExprKind::OpNEq(e1, e2) => {
                let v1 = self.eval(env, e1)?;
                let v2 = self.eval(env, e2)?;
                let eq = self.eq_values(&v1, &v2)?;
                Ok(self.alloc_value(Value::Bool(!eq)))
            }

            ExprKind::OpConcat(e1, e2) => {
                let v1 = self.eval(env, e1)?;
                let mut items = self.force_list(&v1)?;
                let v2 = self.eval(env, e2)?;
                items.extend(self.force_list(&v2)?);
                Ok(self.alloc_value(Value::List(items)))
            }

            ExprKind::ConcatStrings(parts) => self.eval_concat(env, expr, parts),

            ExprKind::If { cond, then, els } => {
                if self.eval_bool(env, cond)? {
                    self.eval(env, then)
                } else {
                    self.eval(env, els)
                }
            }

            ExprKind::Assert { cond, body } => {
                if !self.eval_bool(env, cond)? {
                    return Err(MarlError::assertion(expr.pos));
                }
                self.eval(env, body)
            }

            ExprKind::OpNot(e1) => {
                let b = self.eval_bool(env, e1)?;
                Ok(self.alloc_value(Value::Bool(!b)))
            }

            ExprKind::OpImpl(e1, e2) => {
                let b = !self.eval_bool(env, e1)? || self.eval_bool(env, e2)?;
                Ok(self.alloc_value(Value::Bool(b)))
            }

            ExprKind::OpAnd(e1, e2) => {
                let b = self.eval_bool(env, e1)? && self.eval_bool(env, e2)?;
                Ok(self.alloc_value(Value::Bool(b)))
            }

            ExprKind::OpOr(e1, e2) => {
                let b = self.eval_bool(env, e1)? || self.eval_bool(env, e2)?;
                Ok(self.alloc_value(Value::Bool(b)))
            }

            ExprKind::OpUpdate(e1, e2) => {
                let v1 = self.eval(env, e1)?;
                let mut map = self.force_attrs(&v1)?;
                let v2 = self.eval(env, e2)?;
                for (name, value) in self.force_attrs(&v2)?.iter() {
                    map.insert(name.clone(), value.clone());
                }
                Ok(self.alloc_value(Value::Attrs(map)))
            }
        }
    }

    /// A `+` chain. The first element picks the mode: integers sum, a path
    /// stays a path (and tolerates no store-path context), anything else
    /// concatenates as a string whose context is the union of the parts'.
    fn eval_concat(
        &mut self,
        env: &EnvRef,
        expr: &Expr,
        parts: &[Rc<Expr>],
    ) -> Result<ValueRef, MarlError> {
        let first = self.eval(env, &parts[0])?;
        self.force_value(&first)?;

        if matches!(&*first.borrow(), Value::Int(_)) {
            let mut total = self.force_int(&first)?;
            for part in &parts[1..] {
                let v = self.eval(env, part)?;
                let n = self.force_int(&v)?;
                total = total
                    .checked_add(n)
                    .ok_or_else(|| MarlError::eval("integer overflow in addition"))?;
            }
            return Ok(self.alloc_value(Value::Int(total)));
        }

        let is_path = matches!(&*first.borrow(), Value::Path(_));
        let mut context = Context::new();
        let mut out = String::new();
        out.push_str(&self.coerce_to_string(&first, &mut context, false, !is_path)?);
        for part in &parts[1..] {
            let v = self.eval(env, part)?;
            out.push_str(&self.coerce_to_string(&v, &mut context, false, !is_path)?);
        }

        if is_path {
            if !context.is_empty() {
                return Err(MarlError::eval(format!(
                    "a string that refers to a store path cannot be appended to a path, in `{}`",
                    out
                ))
                .with_pos(expr.pos));
            }
            Ok(self.alloc_value(Value::Path(out)))
        } else {
            Ok(self.alloc_value(Value::string_with_context(out, context)))
        }
    }

    fn eval_bool(&mut self, env: &EnvRef, expr: &Expr) -> Result<bool, MarlError> {
        let v = self.eval(env, expr)?;
        let out = match &*v.borrow() {
            Value::Bool(b) => Ok(*b),
            other => {
                Err(MarlError::type_mismatch("a Boolean", other.type_name()).with_pos(expr.pos))
            }
        };
        out
    }

    pub fn call_function(
        &mut self,
        fun: ValueRef,
        arg: ValueRef,
    ) -> Result<ValueRef, MarlError> {
        enum FunKind {
            Prim { args_left: usize },
            Lambda {
                env: EnvRef,
                pattern: Rc<Pattern>,
                body: Rc<Expr>,
            },
            Other(&'static str),
        }

        let kind = match &*fun.borrow() {
            Value::PrimOp(p) => FunKind::Prim {
                args_left: p.arity(),
            },
            Value::PrimOpApp { args_left, .. } => FunKind::Prim {
                args_left: *args_left,
            },
            Value::Lambda { env, pattern, body } => FunKind::Lambda {
                env: env.clone(),
                pattern: pattern.clone(),
                body: body.clone(),
            },
            other => FunKind::Other(other.type_name()),
        };

        match kind {
            FunKind::Prim { args_left } if args_left > 1 => {
                Ok(self.alloc_value(Value::PrimOpApp {
                    left: fun,
                    right: arg,
                    args_left: args_left - 1,
                }))
            }
            FunKind::Prim { .. } => {
                // All arguments are in. Walk the chain back to the primop,
                // gathering the arguments leftmost first.
                let mut args = vec![arg];
                let mut cursor = fun;
                loop {
                    let left = match &*cursor.borrow() {
                        Value::PrimOpApp { left, right, .. } => {
                            args.push(right.clone());
                            Some(left.clone())
                        }
                        _ => None,
                    };
                    match left {
                        Some(left) => cursor = left,
                        None => break,
                    }
                }
                args.reverse();
                let primop = match &*cursor.borrow() {
                    Value::PrimOp(p) => p.clone(),
                    other => {
                        return Err(MarlError::type_mismatch(
                            "a built-in function",
                            other.type_name(),
                        ))
                    }
                };
                primop.call(self, &args)
            }
            FunKind::Lambda { env, pattern, body } => {
                let env2 = self.alloc_env(env);
                match &*pattern {
                    Pattern::Var(name) => {
                        env2.borrow_mut().set(name.clone(), arg);
                    }
                    Pattern::Attrs {
                        formals,
                        ellipsis,
                        alias,
                    } => {
                        let arg_map = self.force_attrs(&arg)?;
                        if let Some(alias) = alias {
                            env2.borrow_mut().set(alias.clone(), arg.clone());
                        }
                        let mut attrs_used = 0;
                        for formal in formals {
                            match arg_map.get(&formal.name) {
                                Some(actual) => {
                                    attrs_used += 1;
                                    let copy =
                                        self.alloc_value(Value::Copy(actual.clone()));
                                    env2.borrow_mut().set(formal.name.clone(), copy);
                                }
                                None => match &formal.default {
                                    // Defaults close over the call scope so
                                    // they can see sibling formals.
                                    Some(default) => {
                                        let thunk = self.mk_thunk(&env2, default);
                                        env2.borrow_mut().set(formal.name.clone(), thunk);
                                    }
                                    None => {
                                        return Err(MarlError::missing_argument(
                                            formal.name.as_str(),
                                        ))
                                    }
                                },
                            }
                        }
                        if !*ellipsis && attrs_used != arg_map.len() {
                            return Err(MarlError::unexpected_argument());
                        }
                    }
                }
                self.eval(&env2, &body)
            }
            FunKind::Other(type_name) => {
                Err(MarlError::type_mismatch("a function", type_name))
            }
        }
    }

    /// Call an entry-point function by synthesizing its attribute-set
    /// argument from `args`, falling back to declared defaults. Functions
    /// without an attribute-set pattern pass through unchanged.
    pub fn auto_call_function(
        &mut self,
        args: &Attrs,
        fun: ValueRef,
    ) -> Result<ValueRef, MarlError> {
        self.force_value(&fun)?;
        let formals = match &*fun.borrow() {
            Value::Lambda { pattern, .. } => match &**pattern {
                Pattern::Attrs { formals, .. } => formals.clone(),
                Pattern::Var(_) => return Ok(fun.clone()),
            },
            _ => return Ok(fun.clone()),
        };

        let mut actual = Attrs::new();
        for formal in &formals {
            match args.get(&formal.name) {
                Some(v) => {
                    actual.insert(formal.name.clone(), v.clone());
                }
                None => {
                    if formal.default.is_none() {
                        return Err(MarlError::missing_argument(formal.name.as_str()));
                    }
                }
            }
        }
        let varg = self.alloc_value(Value::Attrs(actual));
        self.call_function(fun, varg)
    }

    /// Force `v` to weak head normal form, overwriting the cell in place.
    pub fn force_value(&mut self, v: &ValueRef) -> Result<(), MarlError> {
        enum Pending {
            Done,
            Thunk,
            Copy(ValueRef),
            App(ValueRef, ValueRef),
            Blackhole,
        }

        let pending = match &*v.borrow() {
            Value::Thunk { .. } => Pending::Thunk,
            Value::Copy(target) => Pending::Copy(target.clone()),
            Value::App { fun, arg } => Pending::App(fun.clone(), arg.clone()),
            Value::Blackhole => Pending::Blackhole,
            _ => Pending::Done,
        };

        match pending {
            Pending::Done => Ok(()),
            Pending::Thunk => {
                let (tenv, texpr) = match mem::replace(&mut *v.borrow_mut(), Value::Blackhole)
                {
                    Value::Thunk { env, expr } => (env, expr),
                    _ => unreachable!("thunk vanished"),
                };
                let forced = self.eval(&tenv, &texpr).and_then(|result| {
                    self.force_value(&result)?;
                    Ok(result)
                });
                match forced {
                    Ok(result) => {
                        let out = result.borrow().clone();
                        *v.borrow_mut() = out;
                        Ok(())
                    }
                    Err(err) => {
                        // Restore the suspension so the failure reproduces on
                        // the next demand.
                        *v.borrow_mut() = Value::Thunk {
                            env: tenv,
                            expr: texpr,
                        };
                        Err(err)
                    }
                }
            }
            Pending::Copy(target) => {
                self.force_value(&target)?;
                let out = target.borrow().clone();
                *v.borrow_mut() = out;
                Ok(())
            }
            Pending::App(fun, arg) => {
                let result = self.call_function(fun, arg)?;
                self.force_value(&result)?;
                let out = result.borrow().clone();
                *v.borrow_mut() = out;
                Ok(())
            }
            Pending::Blackhole => Err(MarlError::infinite_recursion()),
        }
    }

    /// Force `v` and everything reachable through attribute sets and lists.
    pub fn strict_force_value(&mut self, v: &ValueRef) -> Result<(), MarlError> {
        self.force_value(v)?;
        let children: Vec<ValueRef> = match &*v.borrow() {
            Value::Attrs(map) => map.values().cloned().collect(),
            Value::List(items) => items.clone(),
            _ => Vec::new(),
        };
        for child in &children {
            self.strict_force_value(child)?;
        }
        Ok(())
    }

    pub fn force_int(&mut self, v: &ValueRef) -> Result<i64, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Int(n) => Ok(*n),
            other => Err(MarlError::type_mismatch("an integer", other.type_name())),
        };
        out
    }

    pub fn force_bool(&mut self, v: &ValueRef) -> Result<bool, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Bool(b) => Ok(*b),
            other => Err(MarlError::type_mismatch("a Boolean", other.type_name())),
        };
        out
    }

    pub fn force_attrs(&mut self, v: &ValueRef) -> Result<Attrs, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Attrs(map) => Ok(map.clone()),
            other => Err(MarlError::type_mismatch(
                "an attribute set",
                other.type_name(),
            )),
        };
        out
    }

    pub fn force_list(&mut self, v: &ValueRef) -> Result<Vec<ValueRef>, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::List(items) => Ok(items.clone()),
            other => Err(MarlError::type_mismatch("a list", other.type_name())),
        };
        out
    }

    pub fn force_function(&mut self, v: &ValueRef) -> Result<(), MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Lambda { .. } | Value::PrimOp(_) | Value::PrimOpApp { .. } => Ok(()),
            other => Err(MarlError::type_mismatch("a function", other.type_name())),
        };
        out
    }

    pub fn force_string(&mut self, v: &ValueRef) -> Result<String, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Str { s, .. } => Ok(s.clone()),
            other => Err(MarlError::type_mismatch("a string", other.type_name())),
        };
        out
    }

    pub fn force_string_ctx(
        &mut self,
        v: &ValueRef,
        context: &mut Context,
    ) -> Result<String, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Str { s, context: ctx } => {
                for path in ctx.iter() {
                    context.insert(path.clone());
                }
                Ok(s.clone())
            }
            other => Err(MarlError::type_mismatch("a string", other.type_name())),
        };
        out
    }

    pub fn force_string_no_ctx(&mut self, v: &ValueRef) -> Result<String, MarlError> {
        self.force_value(v)?;
        let out = match &*v.borrow() {
            Value::Str { s, context } => match context.iter().next() {
                None => Ok(s.clone()),
                Some(sample) => Err(MarlError::eval(format!(
                    "the string `{}` is not allowed to refer to a store path (such as `{}`)",
                    s, sample
                ))),
            },
            other => Err(MarlError::type_mismatch("a string", other.type_name())),
        };
        out
    }

    /// A value is a derivation iff it is an attribute set whose `type`
    /// attribute is the context-free string `"derivation"`.
    pub fn is_derivation(&mut self, v: &ValueRef) -> Result<bool, MarlError> {
        self.force_value(v)?;
        let attr = match &*v.borrow() {
            Value::Attrs(map) => map.get(&Sym::new("type")).cloned(),
            _ => return Ok(false),
        };
        match attr {
            Some(t) => Ok(self.force_string_no_ctx(&t)? == "derivation"),
            None => Ok(false),
        }
    }

    pub fn coerce_to_string(
        &mut self,
        v: &ValueRef,
        context: &mut Context,
        coerce_more: bool,
        copy_to_store: bool,
    ) -> Result<String, MarlError> {
        self.force_value(v)?;
        let value = v.borrow().clone();

        match value {
            Value::Str { s, context: ctx } => {
                for path in ctx.iter() {
                    context.insert(path.clone());
                }
                Ok(s)
            }

            Value::Path(p) => {
                let path = canon_path(&p);
                if !copy_to_store {
                    return Ok(path);
                }
                if is_derivation_path(&path) {
                    return Err(MarlError::eval(format!(
                        "file names are not allowed to end in `{}`",
                        DRV_EXTENSION
                    )));
                }
                let dst = match self.src_to_store.get(&path) {
                    Some(dst) => dst.clone(),
                    None => {
                        let dst = if self.options.read_only {
                            self.store.compute_store_path(Path::new(&path))?
                        } else {
                            self.store.add_to_store(Path::new(&path))?
                        };
                        self.src_to_store.insert(path, dst.clone());
                        dst
                    }
                };
                context.insert(dst.clone());
                Ok(dst)
            }

            Value::Attrs(map) => match map.get(&Sym::new("outPath")) {
                Some(out) => self.coerce_to_string(&out.clone(), context, coerce_more, copy_to_store),
                None => Err(MarlError::type_error(
                    "cannot coerce an attribute set (except a derivation) to a string",
                )),
            },

            Value::Bool(true) if coerce_more => Ok("1".into()),
            Value::Bool(false) if coerce_more => Ok(String::new()),
            Value::Null if coerce_more => Ok(String::new()),
            Value::Int(n) if coerce_more => Ok(n.to_string()),

            Value::List(items) if coerce_more => {
                let mut out = String::new();
                let len = items.len();
                for (i, item) in items.iter().enumerate() {
                    out.push_str(&self.coerce_to_string(
                        item,
                        context,
                        coerce_more,
                        copy_to_store,
                    )?);
                    // No separator before an empty-list element. Odd, but
                    // established behavior.
                    if i + 1 < len {
                        let empty_list =
                            matches!(&*item.borrow(), Value::List(inner) if inner.is_empty());
                        if !empty_list {
                            out.push(' ');
                        }
                    }
                }
                Ok(out)
            }

            other => Err(MarlError::type_error(format!(
                "cannot coerce {} to a string",
                other.type_name()
            ))),
        }
    }

    pub fn coerce_to_path(
        &mut self,
        v: &ValueRef,
        context: &mut Context,
    ) -> Result<String, MarlError> {
        let path = self.coerce_to_string(v, context, false, false)?;
        if path.is_empty() || !path.starts_with('/') {
            return Err(MarlError::eval(format!(
                "string `{}` doesn't represent an absolute path",
                path
            )));
        }
        Ok(path)
    }

    /// Structural equality. String contexts are ignored here, so two strings
    /// with different build inputs can compare equal; functions are never
    /// equal, not even to themselves.
    pub fn eq_values(&mut self, a: &ValueRef, b: &ValueRef) -> Result<bool, MarlError> {
        self.force_value(a)?;
        self.force_value(b)?;
        let va = a.borrow().clone();
        let vb = b.borrow().clone();

        match (va, vb) {
            (Value::Int(x), Value::Int(y)) => Ok(x == y),
            (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
            (Value::Null, Value::Null) => Ok(true),
            (Value::Str { s: x, .. }, Value::Str { s: y, .. }) => Ok(x == y),
            (Value::Path(x), Value::Path(y)) => Ok(x == y),

            (Value::List(xs), Value::List(ys)) => {
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                for (x, y) in xs.iter().zip(ys.iter()) {
                    if !self.eq_values(x, y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            (Value::Attrs(xs), Value::Attrs(ys)) => {
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                // Both iterate in canonical key order.
                for ((xk, xv), (yk, yv)) in xs.iter().zip(ys.iter()) {
                    if xk != yk || !self.eq_values(xv, yv)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    pub fn print_stats(&self) {
        if !show_stats_from_env() {
            return;
        }
        eprintln!(
            "evaluated {} expressions, reached evaluation depth {}, allocated {} values, allocated {} environments",
            self.stats.nr_evaluated, self.stats.max_depth, self.stats.nr_values, self.stats.nr_envs
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::store::MemoryStore;
    use std::cell::Cell;
    use std::thread;

    fn test_state() -> Evaluator {
        Evaluator::with_store(
            EvalOptions::default(),
            Rc::new(MemoryStore::new("/marl-test/store")),
        )
    }

    fn eval_in(state: &mut Evaluator, src: &str) -> ValueRef {
        let expr = parse_source(src).expect("source should parse");
        let env = state.base_env();
        state.eval(&env, &expr).expect("evaluation should succeed")
    }

    fn eval_src(src: &str) -> ValueRef {
        let mut state = test_state();
        eval_in(&mut state, src)
    }

    fn eval_err(src: &str) -> MarlError {
        let expr = parse_source(src).expect("source should parse");
        let mut state = test_state();
        let env = state.base_env();
        state
            .eval(&env, &expr)
            .expect_err("expected evaluation error")
    }

    fn as_int(v: &ValueRef) -> i64 {
        match &*v.borrow() {
            Value::Int(n) => *n,
            other => panic!("expected integer, got {}", other),
        }
    }

    fn as_bool(v: &ValueRef) -> bool {
        match &*v.borrow() {
            Value::Bool(b) => *b,
            other => panic!("expected Boolean, got {}", other),
        }
    }

    fn as_string(v: &ValueRef) -> String {
        match &*v.borrow() {
            Value::Str { s, .. } => s.clone(),
            other => panic!("expected string, got {}", other),
        }
    }

    fn string_context(v: &ValueRef) -> Context {
        match &*v.borrow() {
            Value::Str { context, .. } => context.clone(),
            other => panic!("expected string, got {}", other),
        }
    }

    fn run_with_large_stack<F>(f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(f)
            .expect("failed to spawn test thread with larger stack");
        handle.join().expect("test thread panicked");
    }

    #[test]
    fn literals_evaluate_to_themselves() {
        assert_eq!(as_int(&eval_src("42")), 42);
        assert_eq!(as_string(&eval_src("\"hello\"")), "hello");
        match &*eval_src("/etc/hosts").borrow() {
            Value::Path(p) => assert_eq!(p, "/etc/hosts"),
            other => panic!("expected path, got {}", other),
        }
    }

    #[test]
    fn selection_finds_attribute() {
        assert_eq!(as_int(&eval_src("{ a = 1; b = 2; }.b")), 2);
    }

    #[test]
    fn selection_reports_missing_attribute() {
        let err = eval_err("{ a = 1; }.b");
        assert!(err.to_string().contains("attribute `b` missing"));
    }

    #[test]
    fn selection_wraps_inner_failures() {
        let err = eval_err("{ a = nope; }.a");
        assert!(err.to_string().contains("undefined variable"));
        assert!(err
            .trace()
            .iter()
            .any(|frame| frame.contains("while evaluating the attribute `a`")));
    }

    #[test]
    fn recursive_bindings_see_each_other() {
        assert_eq!(as_int(&eval_src("rec { x = 1; y = x + 1; }.y")), 2);
    }

    #[test]
    fn inherited_bindings_use_the_outer_scope() {
        assert_eq!(as_int(&eval_src("let x = 1; in (rec { inherit x; y = 2; }).x")), 1);
    }

    #[test]
    fn let_shadowing_is_innermost() {
        assert_eq!(as_string(&eval_src("let x = \"a\"; in let x = \"b\"; in x")), "b");
    }

    #[test]
    fn with_outermost_wins() {
        assert_eq!(as_int(&eval_src("with { a = 1; }; with { a = 2; }; a")), 1);
    }

    #[test]
    fn lexical_bindings_shadow_with() {
        assert_eq!(as_int(&eval_src("let a = 5; in with { a = 2; }; a")), 5);
    }

    #[test]
    fn with_resolves_unshadowed_names() {
        assert_eq!(as_int(&eval_src("with { a = 2; }; a")), 2);
    }

    #[test]
    fn undefined_variable_is_reported() {
        let err = eval_err("missing");
        assert!(err.to_string().contains("undefined variable `missing`"));
    }

    #[test]
    fn has_attr_checks_membership() {
        assert!(as_bool(&eval_src("{ a = 1; } ? a")));
        assert!(!as_bool(&eval_src("{ a = 1; } ? b")));
    }

    #[test]
    fn lambda_application() {
        assert_eq!(as_int(&eval_src("(x: x) 42")), 42);
        assert_eq!(as_int(&eval_src("(x: y: x + y) 1 2")), 3);
    }

    #[test]
    fn pattern_defaults_see_sibling_formals() {
        assert_eq!(as_int(&eval_src("({ x, y ? x + 1 }: y) { x = 10; }")), 11);
        assert_eq!(as_int(&eval_src("({ x ? y, y ? 3 }: x) {}")), 3);
    }

    #[test]
    fn pattern_missing_argument() {
        let err = eval_err("({ x }: x) {}");
        assert!(err.to_string().contains("argument named `x`"));
    }

    #[test]
    fn pattern_unexpected_argument() {
        let err = eval_err("({ x }: x) { x = 1; y = 2; }");
        assert!(err.to_string().contains("unexpected argument"));
    }

    #[test]
    fn ellipsis_allows_extra_arguments() {
        assert_eq!(as_int(&eval_src("({ x, ... }: x) { x = 1; y = 2; }")), 1);
    }

    #[test]
    fn alias_binds_the_whole_argument() {
        assert_eq!(
            as_int(&eval_src("({ x, ... } @ args: args.y) { x = 1; y = 5; }")),
            5
        );
    }

    #[test]
    fn calling_a_non_function_fails() {
        let err = eval_err("1 2");
        assert!(err.to_string().contains("a function was expected"));
    }

    #[test]
    fn primops_curry() {
        assert_eq!(as_int(&eval_src("__add 1 2")), 3);
        assert_eq!(as_int(&eval_src("(__add 1) 2")), 3);
        assert!(as_bool(&eval_src("__add 1 2 == (__add 1) 2")));
    }

    #[test]
    fn builtins_set_aliases_stripped_names() {
        assert_eq!(as_int(&eval_src("builtins.add 1 2")), 3);
        assert!(as_bool(&eval_src(
            "builtins.isAttrs (builtins.listToAttrs [])"
        )));
    }

    #[test]
    fn plus_sums_integers() {
        assert_eq!(as_int(&eval_src("1 + 2")), 3);
        assert_eq!(as_int(&eval_src("1 + 2 + 3")), 6);
    }

    #[test]
    fn plus_rejects_mixed_integer_operands() {
        let err = eval_err("1 + \"a\"");
        assert!(err.to_string().contains("integer was expected"));
    }

    #[test]
    fn string_concatenation_is_associative() {
        assert_eq!(as_string(&eval_src("\"a\" + \"b\" + \"c\"")), "abc");
        assert!(as_bool(&eval_src(
            "(\"a\" + \"b\") + \"c\" == \"a\" + (\"b\" + \"c\")"
        )));
        assert!(as_bool(&eval_src("\"\" + \"x\" == \"x\"")));
    }

    #[test]
    fn interpolation_splices_strings() {
        assert_eq!(as_string(&eval_src("\"a${\"b\"}c\"")), "abc");
        assert_eq!(
            as_string(&eval_src("let name = \"pkg\"; in \"${name}-1.0\"")),
            "pkg-1.0"
        );
    }

    #[test]
    fn path_plus_string_stays_a_path() {
        let v = eval_src("/data/src + \"/main.c\"");
        match &*v.borrow() {
            Value::Path(p) => assert_eq!(p, "/data/src/main.c"),
            other => panic!("expected path, got {}", other),
        };
    }

    #[test]
    fn coercing_a_path_copies_it_and_records_context() {
        let mut state = test_state();
        let v = eval_in(&mut state, "\"input: \" + /data/src");
        let context = string_context(&v);
        assert_eq!(context.iter().count(), 1);
        let store_path = context.iter().next().unwrap();
        assert!(store_path.starts_with("/marl-test/store/"));
        assert!(as_string(&v).ends_with(store_path.as_str()));
    }

    #[test]
    fn read_only_mode_computes_without_inserting() {
        let store = Rc::new(MemoryStore::new("/marl-test/store"));
        let options = EvalOptions {
            read_only: true,
            ..EvalOptions::default()
        };
        let mut state = Evaluator::with_store(options, store.clone());
        let v = eval_in(&mut state, "\"\" + /data/src");
        assert!(as_string(&v).starts_with("/marl-test/store/"));
        assert!(store.added().is_empty());
    }

    #[test]
    fn source_to_store_mapping_is_memoized() {
        let store = Rc::new(MemoryStore::new("/marl-test/store"));
        let mut state = Evaluator::with_store(EvalOptions::default(), store.clone());
        let v = eval_in(&mut state, "[ (\"\" + /data/src) (\"\" + /data/src) ]");
        state.strict_force_value(&v).unwrap();
        assert_eq!(store.added().len(), 1);
    }

    #[test]
    fn context_bearing_string_cannot_extend_a_path() {
        let err = eval_err("/data/src + \"${/data/dep}\"");
        assert!(err
            .to_string()
            .contains("cannot be appended to a path"));
    }

    #[test]
    fn interpolated_path_coerces_to_a_string() {
        let v = eval_src("\"${/data/dep}\"");
        assert!(as_string(&v).starts_with("/marl-test/store/"));
        assert_eq!(string_context(&v).iter().count(), 1);
    }

    #[test]
    fn force_string_no_ctx_names_an_offender() {
        let mut state = test_state();
        let v = eval_in(&mut state, "\"\" + /data/src");
        let err = state.force_string_no_ctx(&v).unwrap_err();
        assert!(err.to_string().contains("/marl-test/store/"));
    }

    #[test]
    fn equality_is_structural() {
        assert!(as_bool(&eval_src("[ 1 2 ] == [ 1 2 ]")));
        assert!(!as_bool(&eval_src("[ 1 ] == [ 1 2 ]")));
        assert!(as_bool(&eval_src("{ a = 1; b = 2; } == { b = 2; a = 1; }")));
        assert!(!as_bool(&eval_src("{ a = 1; } == { b = 1; }")));
        assert!(as_bool(&eval_src("null == null")));
        assert!(as_bool(&eval_src("1 != 2")));
        assert!(!as_bool(&eval_src("1 == \"1\"")));
    }

    #[test]
    fn equality_ignores_string_context() {
        let mut state = test_state();
        let plain = state.alloc_value(Value::string("same"));
        let mut context = Context::new();
        context.insert("/marl-test/store/abc-dep".into());
        let tainted = state.alloc_value(Value::string_with_context("same", context));
        assert!(state.eq_values(&plain, &tainted).unwrap());
    }

    #[test]
    fn functions_are_never_equal() {
        assert!(!as_bool(&eval_src("(x: x) == (x: x)")));
        assert!(!as_bool(&eval_src("let f = x: x; in f == f")));
        assert!(!as_bool(&eval_src("__add == __add")));
    }

    #[test]
    fn update_overrides_and_is_idempotent() {
        let mut state = test_state();
        let v = eval_in(&mut state, "{ a = 1; b = 2; } // { b = 3; c = 4; }");
        state.strict_force_value(&v).unwrap();
        assert_eq!(format!("{}", v.borrow()), "{ a = 1; b = 3; c = 4; }");
        assert!(as_bool(&eval_src("let a = { x = 1; }; in (a // a) == a")));
        assert!(as_bool(&eval_src(
            "let a = { x = 1; }; b = { x = 2; y = 3; }; in ((a // b) // b) == (a // b)"
        )));
    }

    #[test]
    fn list_concatenation_is_a_monoid() {
        assert_eq!(as_int(&eval_src("__length ([ 1 ] ++ [ 2 3 ])")), 3);
        assert!(as_bool(&eval_src("let x = [ 1 2 ]; in ([] ++ x) == x")));
        assert!(as_bool(&eval_src("let x = [ 1 2 ]; in (x ++ []) == x")));
        assert!(as_bool(&eval_src(
            "([ 1 ] ++ [ 2 ]) ++ [ 3 ] == [ 1 ] ++ ([ 2 ] ++ [ 3 ])"
        )));
    }

    #[test]
    fn concatenation_preserves_element_identity() {
        // Elements are shared, not re-evaluated: the counter runs once even
        // though the element appears in a concatenated list.
        let mut state = test_state();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        state.add_primop("__count", 1, move |ev, args| {
            seen.set(seen.get() + 1);
            let n = ev.force_int(&args[0])?;
            Ok(ev.alloc_value(Value::Int(n)))
        });
        let v = eval_in(&mut state, "let xs = [ (__count 7) ]; in xs ++ xs");
        state.strict_force_value(&v).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn conditionals_and_logic() {
        assert_eq!(as_int(&eval_src("if true then 1 else 2")), 1);
        assert_eq!(as_int(&eval_src("if false then 1 else 2")), 2);
        assert!(as_bool(&eval_src("!false")));
        assert!(as_bool(&eval_src("false -> false")));
        assert!(as_bool(&eval_src("true -> true")));
        assert!(!as_bool(&eval_src("true && false")));
        assert!(as_bool(&eval_src("false || true")));
    }

    #[test]
    fn logic_short_circuits() {
        assert!(!as_bool(&eval_src("false && missing")));
        assert!(as_bool(&eval_src("true || missing")));
        assert!(as_bool(&eval_src("false -> missing")));
    }

    #[test]
    fn non_boolean_condition_is_a_type_error() {
        let err = eval_err("if 1 then 2 else 3");
        assert!(err.to_string().contains("a Boolean was expected"));
    }

    #[test]
    fn assertions() {
        assert_eq!(as_int(&eval_src("assert true; 5")), 5);
        let err = eval_err("assert 1 == 2; 5");
        assert!(err.to_string().contains("assertion failed"));
        assert!(err.pos().is_some());
    }

    #[test]
    fn laziness_skips_unused_bindings() {
        assert_eq!(as_int(&eval_src("let x = throw \"boom\"; in 42")), 42);
        assert_eq!(as_int(&eval_src("({ x ? throw \"no\" }: 1) {}")), 1);
        assert_eq!(as_int(&eval_src("__length [ (throw \"no\") missing ]")), 2);
    }

    #[test]
    fn aborting_primop_runs_only_when_demanded() {
        let mut state = test_state();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        state.add_primop("__blowUp", 1, move |_ev, _args| {
            seen.set(seen.get() + 1);
            Err(MarlError::eval("forced the forbidden thunk"))
        });
        let v = eval_in(&mut state, "let x = __blowUp 0; in 7");
        assert_eq!(as_int(&v), 7);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn thunks_are_memoized() {
        let mut state = test_state();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        state.add_primop("__count", 1, move |ev, args| {
            seen.set(seen.get() + 1);
            let n = ev.force_int(&args[0])?;
            Ok(ev.alloc_value(Value::Int(n)))
        });
        let v = eval_in(&mut state, "let y = __count 1; in [ y y y ]");
        state.strict_force_value(&v).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_thunks_are_restored() {
        let mut state = test_state();
        let v = eval_in(&mut state, "{ a = nope; }");
        let attr = match &*v.borrow() {
            Value::Attrs(map) => map.get(&Sym::new("a")).cloned().unwrap(),
            other => panic!("expected attribute set, got {}", other),
        };
        let first = state.force_value(&attr).unwrap_err();
        let second = state.force_value(&attr).unwrap_err();
        assert!(first.to_string().contains("undefined variable"));
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn self_referential_thunk_is_infinite_recursion() {
        let err = eval_err("rec { x = x; }.x");
        assert!(err.to_string().contains("infinite recursion"));
    }

    #[test]
    fn unforced_self_reference_is_fine() {
        assert_eq!(as_int(&eval_src("rec { x = x; y = 1; }.y")), 1);
    }

    #[test]
    fn runaway_application_is_infinite_recursion() {
        run_with_large_stack(|| {
            let options = EvalOptions {
                max_depth: 2_000,
                ..EvalOptions::default()
            };
            let mut state =
                Evaluator::with_store(options, Rc::new(MemoryStore::new("/marl-test/store")));
            let expr = parse_source("let f = x: f x; in f 1").unwrap();
            let env = state.base_env();
            let err = state
                .eval(&env, &expr)
                .expect_err("expected runaway recursion to be caught");
            assert!(err.to_string().contains("infinite recursion"));
        });
    }

    #[test]
    fn strict_forcing_traverses_nested_structures() {
        let mut state = test_state();
        let v = eval_in(&mut state, "{ a = { b = 1 + 1; }; c = [ (2 + 2) ]; }");
        assert_eq!(format!("{}", v.borrow()), "{ a = <code>; c = <code>; }");
        state.strict_force_value(&v).unwrap();
        assert_eq!(format!("{}", v.borrow()), "{ a = { b = 2; }; c = [ 4 ]; }");
    }

    #[test]
    fn coerce_more_converts_scalars() {
        assert_eq!(as_string(&eval_src("toString true")), "1");
        assert_eq!(as_string(&eval_src("toString false")), "");
        assert_eq!(as_string(&eval_src("toString null")), "");
        assert_eq!(as_string(&eval_src("toString 42")), "42");
        assert_eq!(as_string(&eval_src("toString \"x\"")), "x");
    }

    #[test]
    fn coerce_more_joins_lists_with_spaces() {
        assert_eq!(as_string(&eval_src("toString [ 1 2 3 ]")), "1 2 3");
    }

    #[test]
    fn no_separator_after_an_empty_list_element() {
        assert_eq!(as_string(&eval_src("toString [ \"a\" [] \"b\" ]")), "a b");
        assert_eq!(as_string(&eval_src("toString [ \"a\" \"\" \"b\" ]")), "a  b");
    }

    #[test]
    fn coerce_without_coerce_more_rejects_scalars() {
        let err = eval_err("\"x\" + true");
        assert!(err.to_string().contains("cannot coerce"));
    }

    #[test]
    fn coerce_to_path_validates_shape() {
        let mut state = test_state();
        let empty = state.alloc_value(Value::string(""));
        let mut context = Context::new();
        assert!(state.coerce_to_path(&empty, &mut context).is_err());
        let relative = state.alloc_value(Value::string("etc/hosts"));
        assert!(state.coerce_to_path(&relative, &mut context).is_err());
        let absolute = state.alloc_value(Value::string("/etc/hosts"));
        assert_eq!(
            state.coerce_to_path(&absolute, &mut context).unwrap(),
            "/etc/hosts"
        );
    }

    #[test]
    fn outpath_attribute_coerces_like_its_value() {
        let v = eval_src("\"x-\" + { outPath = \"/data/out\"; }");
        assert_eq!(as_string(&v), "x-/data/out");
        let err = eval_err("\"x-\" + { a = 1; }");
        assert!(err.to_string().contains("cannot coerce an attribute set"));
    }

    #[test]
    fn derivation_predicate() {
        let mut state = test_state();
        let v = eval_in(&mut state, "{ type = \"derivation\"; outPath = \"/o\"; }");
        assert!(state.is_derivation(&v).unwrap());
        let v = eval_in(&mut state, "{ type = \"package\"; }");
        assert!(!state.is_derivation(&v).unwrap());
        let v = eval_in(&mut state, "{ name = \"x\"; }");
        assert!(!state.is_derivation(&v).unwrap());
        let v = eval_in(&mut state, "42");
        assert!(!state.is_derivation(&v).unwrap());
    }

    #[test]
    fn derivation_files_cannot_be_coerced_into_the_store() {
        let err = eval_err("\"\" + /data/pkg.drv");
        assert!(err.to_string().contains(".drv"));
    }

    #[test]
    fn auto_call_fills_defaults() {
        let mut state = test_state();
        let fun = eval_in(&mut state, "{ x ? 4, y ? x + 1 }: y");
        let result = state.auto_call_function(&Attrs::new(), fun).unwrap();
        assert_eq!(as_int(&result), 5);
    }

    #[test]
    fn auto_call_prefers_supplied_arguments() {
        let mut state = test_state();
        let fun = eval_in(&mut state, "{ x ? 4, y ? x + 1 }: y");
        let mut args = Attrs::new();
        let ten = state.alloc_value(Value::Int(10));
        args.insert(Sym::new("x"), ten);
        let result = state.auto_call_function(&args, fun).unwrap();
        assert_eq!(as_int(&result), 11);
    }

    #[test]
    fn auto_call_requires_defaults_for_unsupplied_formals() {
        let mut state = test_state();
        let fun = eval_in(&mut state, "{ x }: x");
        let err = state.auto_call_function(&Attrs::new(), fun).unwrap_err();
        assert!(err.to_string().contains("argument named `x`"));
    }

    #[test]
    fn auto_call_passes_other_values_through() {
        let mut state = test_state();
        let fun = eval_in(&mut state, "x: x");
        let result = state.auto_call_function(&Attrs::new(), fun).unwrap();
        assert!(matches!(&*result.borrow(), Value::Lambda { .. }));
    }

    #[test]
    fn import_evaluates_and_caches_files() {
        let dir = std::env::temp_dir().join(format!("marl-eval-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("three.marl");
        fs::write(&file, "1 + 2").unwrap();

        let mut state = test_state();
        let src = format!("(import {}) + 10", file.display());
        let v = eval_in(&mut state, &src);
        assert_eq!(as_int(&v), 13);

        // The parse tree is reused; changing the file on disk is not seen.
        fs::write(&file, "100").unwrap();
        let v = eval_in(&mut state, &src);
        assert_eq!(as_int(&v), 13);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_errors_carry_the_file_context() {
        let dir = std::env::temp_dir().join(format!("marl-eval-err-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("bad.marl");
        fs::write(&file, "missing").unwrap();

        let mut state = test_state();
        let err = state.eval_file(&file).unwrap_err();
        assert!(err
            .trace()
            .iter()
            .any(|frame| frame.contains("while evaluating the file")));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn statistics_are_collected() {
        let mut state = test_state();
        let baseline = state.stats();
        eval_in(&mut state, "rec { x = 1; y = x + 1; }.y");
        let stats = state.stats();
        assert!(stats.nr_evaluated > baseline.nr_evaluated);
        assert!(stats.nr_values > baseline.nr_values);
        assert!(stats.nr_envs > baseline.nr_envs);
        assert!(stats.max_depth > 0);
    }

    #[test]
    fn unsafe_equality_flag_defaults_on() {
        // MARL_NO_UNSAFE_EQ is unset in the test environment.
        let state = test_state();
        assert!(state.allow_unsafe_equality());
    }
}
