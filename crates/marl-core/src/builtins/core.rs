use std::env;
use std::path::Path;

use crate::ast::{Context, Value};
use crate::builtins::def_primop;
use crate::error::MarlError;
use crate::eval::Evaluator;

pub(crate) fn install(state: &mut Evaluator) {
    let v = state.alloc_value(Value::Bool(true));
    state.add_constant("true", v);
    let v = state.alloc_value(Value::Bool(false));
    state.add_constant("false", v);
    let v = state.alloc_value(Value::Null);
    state.add_constant("null", v);

    def_primop!(state, "toString", 1, |ev, args| {
        let mut context = Context::new();
        let s = ev.coerce_to_string(&args[0], &mut context, true, false)?;
        Ok(ev.alloc_value(Value::string_with_context(s, context)))
    });
    def_primop!(state, "throw", 1, |ev, args| {
        let message = ev.force_string(&args[0])?;
        Err(MarlError::eval(message))
    });
    def_primop!(state, "abort", 1, |ev, args| {
        let message = ev.force_string(&args[0])?;
        Err(MarlError::eval(format!(
            "evaluation aborted with the following error message: `{}`",
            message
        )))
    });
    def_primop!(state, "import", 1, |ev, args| {
        let mut context = Context::new();
        let path = ev.coerce_to_path(&args[0], &mut context)?;
        ev.eval_file(Path::new(&path))
    });

    def_primop!(state, "isNull", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::Null);
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__isFunction", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(
            &*args[0].borrow(),
            Value::Lambda { .. } | Value::PrimOp(_) | Value::PrimOpApp { .. }
        );
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__isString", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::Str { .. });
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__isInt", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::Int(_));
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__isBool", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::Bool(_));
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__isList", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::List(_));
        Ok(ev.alloc_value(Value::Bool(out)))
    });
    def_primop!(state, "__typeOf", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let name = args[0].borrow().type_of();
        Ok(ev.alloc_value(Value::string(name)))
    });

    def_primop!(state, "__stringLength", 1, |ev, args| {
        let s = ev.force_string(&args[0])?;
        Ok(ev.alloc_value(Value::Int(s.len() as i64)))
    });
    def_primop!(state, "__substring", 3, |ev, args| {
        let start = ev.force_int(&args[0])?;
        let len = ev.force_int(&args[1])?;
        let mut context = Context::new();
        let s = ev.force_string_ctx(&args[2], &mut context)?;
        if start < 0 {
            return Err(MarlError::eval("negative start position in `__substring`"));
        }
        let sliced: String = if len < 0 {
            s.chars().skip(start as usize).collect()
        } else {
            s.chars().skip(start as usize).take(len as usize).collect()
        };
        Ok(ev.alloc_value(Value::string_with_context(sliced, context)))
    });
    def_primop!(state, "__getEnv", 1, |ev, args| {
        let name = ev.force_string_no_ctx(&args[0])?;
        let value = env::var(&name).unwrap_or_default();
        Ok(ev.alloc_value(Value::string(value)))
    });

    def_primop!(state, "baseNameOf", 1, |ev, args| {
        let mut context = Context::new();
        let s = ev.coerce_to_string(&args[0], &mut context, false, false)?;
        let base = s.rsplit('/').next().unwrap_or(&s).to_string();
        Ok(ev.alloc_value(Value::string_with_context(base, context)))
    });
    def_primop!(state, "dirOf", 1, |ev, args| {
        let mut context = Context::new();
        let s = ev.coerce_to_string(&args[0], &mut context, false, false)?;
        let dir = match s.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => s[..idx].to_string(),
            None => ".".to_string(),
        };
        Ok(ev.alloc_value(Value::string_with_context(dir, context)))
    });
}
