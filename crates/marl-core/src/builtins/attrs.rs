use crate::ast::{Attrs, Value};
use crate::builtins::def_primop;
use crate::error::MarlError;
use crate::eval::Evaluator;
use crate::symbols::Sym;

pub(crate) fn install(state: &mut Evaluator) {
    def_primop!(state, "__attrNames", 1, |ev, args| {
        let map = ev.force_attrs(&args[0])?;
        let mut out = Vec::with_capacity(map.len());
        for name in map.keys() {
            out.push(ev.alloc_value(Value::string(name.as_str())));
        }
        Ok(ev.alloc_value(Value::List(out)))
    });
    def_primop!(state, "__getAttr", 2, |ev, args| {
        let name = ev.force_string_no_ctx(&args[0])?;
        let map = ev.force_attrs(&args[1])?;
        let Some(found) = map.get(&Sym::new(&name)).cloned() else {
            return Err(MarlError::attr_missing(name));
        };
        ev.force_value(&found)?;
        Ok(found)
    });
    def_primop!(state, "__hasAttr", 2, |ev, args| {
        let name = ev.force_string_no_ctx(&args[0])?;
        let map = ev.force_attrs(&args[1])?;
        Ok(ev.alloc_value(Value::Bool(map.contains_key(&Sym::new(&name)))))
    });
    def_primop!(state, "__removeAttrs", 2, |ev, args| {
        let mut map = ev.force_attrs(&args[0])?;
        let names = ev.force_list(&args[1])?;
        for name in &names {
            let name = ev.force_string_no_ctx(name)?;
            map.remove(&Sym::new(&name));
        }
        Ok(ev.alloc_value(Value::Attrs(map)))
    });
    // The first occurrence of a name wins.
    def_primop!(state, "__listToAttrs", 1, |ev, args| {
        let items = ev.force_list(&args[0])?;
        let mut map = Attrs::new();
        for item in &items {
            let entry = ev.force_attrs(item)?;
            let Some(name) = entry.get(&Sym::new("name")).cloned() else {
                return Err(MarlError::attr_missing("name"));
            };
            let name = ev.force_string_no_ctx(&name)?;
            let Some(value) = entry.get(&Sym::new("value")).cloned() else {
                return Err(MarlError::attr_missing("value"));
            };
            let key = Sym::new(&name);
            if !map.contains_key(&key) {
                map.insert(key, value);
            }
        }
        Ok(ev.alloc_value(Value::Attrs(map)))
    });
    def_primop!(state, "__isAttrs", 1, |ev, args| {
        ev.force_value(&args[0])?;
        let out = matches!(&*args[0].borrow(), Value::Attrs(_));
        Ok(ev.alloc_value(Value::Bool(out)))
    });
}
