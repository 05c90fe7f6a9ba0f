use crate::ast::Value;
use crate::builtins::def_primop;
use crate::error::MarlError;
use crate::eval::Evaluator;

pub(crate) fn install(state: &mut Evaluator) {
    def_primop!(state, "__head", 1, |ev, args| {
        let items = ev.force_list(&args[0])?;
        items
            .first()
            .cloned()
            .ok_or_else(|| MarlError::eval("`__head` called on an empty list"))
    });
    def_primop!(state, "__tail", 1, |ev, args| {
        let items = ev.force_list(&args[0])?;
        if items.is_empty() {
            return Err(MarlError::eval("`__tail` called on an empty list"));
        }
        Ok(ev.alloc_value(Value::List(items[1..].to_vec())))
    });
    def_primop!(state, "__length", 1, |ev, args| {
        let items = ev.force_list(&args[0])?;
        Ok(ev.alloc_value(Value::Int(items.len() as i64)))
    });
    def_primop!(state, "__elemAt", 2, |ev, args| {
        let items = ev.force_list(&args[0])?;
        let index = ev.force_int(&args[1])?;
        if index < 0 || index as usize >= items.len() {
            return Err(MarlError::eval(format!(
                "list index {} is out of range",
                index
            )));
        }
        Ok(items[index as usize].clone())
    });
    def_primop!(state, "__elem", 2, |ev, args| {
        let items = ev.force_list(&args[1])?;
        for item in &items {
            if ev.eq_values(&args[0], item)? {
                return Ok(ev.alloc_value(Value::Bool(true)));
            }
        }
        Ok(ev.alloc_value(Value::Bool(false)))
    });
    // Applications are suspended, so mapping preserves laziness.
    def_primop!(state, "map", 2, |ev, args| {
        ev.force_function(&args[0])?;
        let items = ev.force_list(&args[1])?;
        let mut out = Vec::with_capacity(items.len());
        for item in &items {
            out.push(ev.alloc_value(Value::App {
                fun: args[0].clone(),
                arg: item.clone(),
            }));
        }
        Ok(ev.alloc_value(Value::List(out)))
    });
}
