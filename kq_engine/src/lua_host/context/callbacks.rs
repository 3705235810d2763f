use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use mlua::{
    FromLuaMulti, Function, IntoLuaMulti, Lua, RegistryKey, Result as LuaResult, Value,
};

use super::errors::BridgeError;
use super::ContextRef;

/// Token for a script value retained on behalf of the engine. The null token
/// is spelled `Option::<RefId>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RefId(NonZeroU32);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RefRegistry {
    last: u32,
    refs: BTreeMap<RefId, RegistryKey>,
}

impl RefRegistry {
    pub(crate) fn create_ref(&mut self, lua: &Lua, value: Value) -> LuaResult<RefId> {
        let key = lua.create_registry_value(value)?;
        self.last += 1;
        let id = match NonZeroU32::new(self.last) {
            Some(raw) => RefId(raw),
            None => unreachable!("reference counter starts above zero"),
        };
        self.refs.insert(id, key);
        Ok(id)
    }

    /// Resolves a token without consuming it.
    pub(crate) fn push_ref<'lua>(&self, lua: &'lua Lua, id: RefId) -> LuaResult<Value<'lua>> {
        let key = self.refs.get(&id).ok_or(BridgeError::InvalidRef(id))?;
        lua.registry_value(key)
    }

    /// Invalidates a token and hands back its registry slot.
    pub(crate) fn take(&mut self, id: RefId) -> Result<RegistryKey, BridgeError> {
        self.refs.remove(&id).ok_or(BridgeError::InvalidRef(id))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: RefId) -> bool {
        self.refs.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<RegistryKey> {
        std::mem::take(&mut self.refs).into_values().collect()
    }
}

pub(crate) fn create_ref(lua: &Lua, context: &ContextRef, value: Value) -> LuaResult<RefId> {
    context.borrow_mut().refs.create_ref(lua, value)
}

/// Resolves a callback token to its function. A token that does not point at
/// a function is reported and yields `None`.
pub(crate) fn push_callback<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    id: RefId,
) -> LuaResult<Option<Function<'lua>>> {
    let value = context.borrow().refs.push_ref(lua, id)?;
    match value {
        Value::Function(function) => Ok(Some(function)),
        other => {
            log::warn!(
                "No such Lua callback {id} (found a {} value)",
                other.type_name()
            );
            Ok(None)
        }
    }
}

/// Invokes a callback once with no arguments and destroys its token.
pub(crate) fn do_callback(
    lua: &Lua,
    context: &ContextRef,
    id: Option<RefId>,
    label: &str,
) -> LuaResult<()> {
    let Some(id) = id else {
        return Ok(());
    };
    let function = push_callback(lua, context, id)?;
    destroy_ref(lua, context, id)?;
    if let Some(function) = function {
        call_protected::<_, ()>(context, label, &function, ());
    }
    Ok(())
}

/// Destroys a callback token without calling it.
pub(crate) fn cancel_callback(lua: &Lua, context: &ContextRef, id: Option<RefId>) -> LuaResult<()> {
    match id {
        Some(id) => destroy_ref(lua, context, id),
        None => Ok(()),
    }
}

pub(crate) fn destroy_ref(lua: &Lua, context: &ContextRef, id: RefId) -> LuaResult<()> {
    let key = context.borrow_mut().refs.take(id)?;
    lua.remove_registry_value(key)
}

/// Calls into script code, reporting a raised error instead of propagating it.
pub(crate) fn call_protected<'lua, A, R>(
    context: &ContextRef,
    label: &str,
    function: &Function<'lua>,
    args: A,
) -> Option<R>
where
    A: IntoLuaMulti<'lua>,
    R: FromLuaMulti<'lua>,
{
    match function.call::<A, R>(args) {
        Ok(result) => Some(result),
        Err(err) => {
            report_script_error(context, label, &err);
            None
        }
    }
}

pub(crate) fn report_script_error(context: &ContextRef, label: &str, err: &mlua::Error) {
    log::error!("error in {label}: {err}");
    context
        .borrow_mut()
        .log_event(format!("script.error {label}"));
}

#[cfg(test)]
mod tests {
    use super::super::test_support::bare_context;
    use super::*;

    #[test]
    fn callback_runs_once_and_token_is_consumed() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        lua.load("calls = 0").exec().unwrap();
        let function: Function = lua.load("function() calls = calls + 1 end").eval().unwrap();
        let token = create_ref(&lua, &context, Value::Function(function)).unwrap();

        do_callback(&lua, &context, Some(token), "test callback").unwrap();
        assert_eq!(lua.globals().get::<_, i64>("calls").unwrap(), 1);
        assert!(!context.borrow().refs.contains(token));

        let err = do_callback(&lua, &context, Some(token), "test callback").unwrap_err();
        assert!(err.to_string().contains("already consumed"));
        assert_eq!(lua.globals().get::<_, i64>("calls").unwrap(), 1);

        let err = cancel_callback(&lua, &context, Some(token)).unwrap_err();
        assert!(err.to_string().contains("already consumed"));
    }

    #[test]
    fn null_token_is_a_no_op() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        do_callback(&lua, &context, None, "nothing").unwrap();
        cancel_callback(&lua, &context, None).unwrap();
        assert_eq!(context.borrow().refs.len(), 0);
    }

    #[test]
    fn cancelled_callback_is_never_called() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        lua.load("called = false").exec().unwrap();
        let function: Function = lua.load("function() called = true end").eval().unwrap();
        let token = create_ref(&lua, &context, Value::Function(function)).unwrap();

        cancel_callback(&lua, &context, Some(token)).unwrap();
        assert!(do_callback(&lua, &context, Some(token), "late").is_err());
        assert!(!lua.globals().get::<_, bool>("called").unwrap());
    }

    #[test]
    fn raising_callback_is_reported_and_consumed() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        let function: Function = lua.load("function() error('boom') end").eval().unwrap();
        let token = create_ref(&lua, &context, Value::Function(function)).unwrap();

        do_callback(&lua, &context, Some(token), "exploding callback").unwrap();
        assert!(!context.borrow().refs.contains(token));
        assert!(context
            .borrow()
            .events()
            .iter()
            .any(|event| event == "script.error exploding callback"));
    }

    #[test]
    fn non_function_reference_is_only_a_diagnostic() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        let token = create_ref(&lua, &context, Value::Integer(7)).unwrap();
        assert!(push_callback(&lua, &context, token).unwrap().is_none());
        do_callback(&lua, &context, Some(token), "number").unwrap();
        assert!(!context.borrow().refs.contains(token));
    }
}
