use mlua::{Function, IntoLuaMulti, Lua, MultiValue, Table, Value};

use super::callbacks::call_protected;
use super::ContextRef;
use crate::input::{is_known_key, InputEvent};

/// Looks up an event method on a script object. Only functions count.
pub(crate) fn find_method<'lua>(object: &Table<'lua>, name: &str) -> Option<Function<'lua>> {
    match object.get::<_, Value>(name) {
        Ok(Value::Function(function)) => Some(function),
        _ => None,
    }
}

/// Outcome of calling an optional event method.
#[derive(Debug)]
enum HookCall<'lua> {
    Missing,
    Failed,
    Returned(Value<'lua>),
}

/// Calls `object:name(args...)` if the method exists.
fn call_method<'lua, A>(
    lua: &'lua Lua,
    context: &ContextRef,
    object: &Table<'lua>,
    name: &str,
    args: A,
) -> HookCall<'lua>
where
    A: IntoLuaMulti<'lua>,
{
    let Some(function) = find_method(object, name) else {
        return HookCall::Missing;
    };
    let mut values = match args.into_lua_multi(lua) {
        Ok(values) => values.into_vec(),
        Err(err) => {
            log::error!("cannot pass arguments to {name}: {err}");
            return HookCall::Failed;
        }
    };
    values.insert(0, Value::Table(object.clone()));
    match call_protected::<_, Value>(context, name, &function, MultiValue::from_vec(values)) {
        Some(value) => HookCall::Returned(value),
        None => HookCall::Failed,
    }
}

pub(crate) fn on_started(lua: &Lua, context: &ContextRef, object: &Table) {
    call_method(lua, context, object, "on_started", ());
}

pub(crate) fn on_finished(lua: &Lua, context: &ContextRef, object: &Table) {
    call_method(lua, context, object, "on_finished", ());
}

pub(crate) fn on_update(lua: &Lua, context: &ContextRef, object: &Table) {
    call_method(lua, context, object, "on_update", ());
}

pub(crate) fn on_draw<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    object: &Table<'lua>,
    target: Value<'lua>,
) {
    call_method(lua, context, object, "on_draw", target);
}

/// Dispatches an input event, first to the generic `on_input` method and
/// then to the method matching its kind, and reports whether it was handled.
/// A method that raises an error counts as having handled the event so that
/// it does not reach other objects.
pub(crate) fn on_input<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    object: &Table<'lua>,
    event: &InputEvent,
) -> bool {
    let key = match event {
        InputEvent::KeyPressed { key, .. } | InputEvent::KeyReleased { key } => Some(key.as_str()),
        InputEvent::WindowClosing => None,
    };
    if key.is_some_and(|key| !is_known_key(key)) {
        return false;
    }

    let generic = match event_table(lua, event) {
        Ok(table) => call_method(lua, context, object, "on_input", table),
        Err(err) => {
            log::error!("cannot build input event: {err}");
            return true;
        }
    };
    if is_handled(generic) {
        return true;
    }

    let specific = match event {
        InputEvent::KeyPressed { key, modifiers } => match modifiers_table(lua, modifiers) {
            Ok(modifiers) => call_method(
                lua,
                context,
                object,
                "on_key_pressed",
                (key.as_str(), modifiers),
            ),
            Err(err) => {
                log::error!("cannot build key modifiers: {err}");
                return true;
            }
        },
        InputEvent::KeyReleased { key } => {
            call_method(lua, context, object, "on_key_released", key.as_str())
        }
        InputEvent::WindowClosing => HookCall::Missing,
    };
    is_handled(specific)
}

fn is_handled(outcome: HookCall) -> bool {
    match outcome {
        HookCall::Missing => false,
        HookCall::Failed => true,
        HookCall::Returned(value) => !matches!(value, Value::Nil | Value::Boolean(false)),
    }
}

/// `{type = "key_pressed", key = "space", modifiers = {...}}` and friends.
fn event_table<'lua>(lua: &'lua Lua, event: &InputEvent) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    match event {
        InputEvent::KeyPressed { key, modifiers } => {
            table.set("type", "key_pressed")?;
            table.set("key", key.as_str())?;
            table.set("modifiers", modifiers_table(lua, modifiers)?)?;
        }
        InputEvent::KeyReleased { key } => {
            table.set("type", "key_released")?;
            table.set("key", key.as_str())?;
        }
        InputEvent::WindowClosing => table.set("type", "window_closing")?,
    }
    Ok(table)
}

/// `{shift = true, control = true, alt = true}`, with absent keys for
/// modifiers that are up.
fn modifiers_table<'lua>(
    lua: &'lua Lua,
    modifiers: &crate::input::Modifiers,
) -> mlua::Result<Table<'lua>> {
    let table = lua.create_table()?;
    for (name, down) in [
        ("shift", modifiers.shift),
        ("control", modifiers.control),
        ("alt", modifiers.alt),
    ] {
        if down {
            table.set(name, true)?;
        }
    }
    Ok(table)
}
