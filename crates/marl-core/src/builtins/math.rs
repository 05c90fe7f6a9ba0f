use crate::ast::Value;
use crate::builtins::def_primop;
use crate::error::MarlError;
use crate::eval::Evaluator;

pub(crate) fn install(state: &mut Evaluator) {
    def_primop!(state, "__add", 2, |ev, args| {
        let a = ev.force_int(&args[0])?;
        let b = ev.force_int(&args[1])?;
        let out = a
            .checked_add(b)
            .ok_or_else(|| MarlError::eval("integer overflow in `__add`"))?;
        Ok(ev.alloc_value(Value::Int(out)))
    });
    def_primop!(state, "__sub", 2, |ev, args| {
        let a = ev.force_int(&args[0])?;
        let b = ev.force_int(&args[1])?;
        let out = a
            .checked_sub(b)
            .ok_or_else(|| MarlError::eval("integer overflow in `__sub`"))?;
        Ok(ev.alloc_value(Value::Int(out)))
    });
    def_primop!(state, "__mul", 2, |ev, args| {
        let a = ev.force_int(&args[0])?;
        let b = ev.force_int(&args[1])?;
        let out = a
            .checked_mul(b)
            .ok_or_else(|| MarlError::eval("integer overflow in `__mul`"))?;
        Ok(ev.alloc_value(Value::Int(out)))
    });
    def_primop!(state, "__div", 2, |ev, args| {
        let a = ev.force_int(&args[0])?;
        let b = ev.force_int(&args[1])?;
        if b == 0 {
            return Err(MarlError::eval("division by zero"));
        }
        let out = a
            .checked_div(b)
            .ok_or_else(|| MarlError::eval("integer overflow in `__div`"))?;
        Ok(ev.alloc_value(Value::Int(out)))
    });
    def_primop!(state, "__lessThan", 2, |ev, args| {
        let a = ev.force_int(&args[0])?;
        let b = ev.force_int(&args[1])?;
        Ok(ev.alloc_value(Value::Bool(a < b)))
    });
}
