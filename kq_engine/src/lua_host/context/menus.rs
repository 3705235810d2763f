use std::collections::BTreeSet;

use anyhow::Result;
use mlua::{Lua, Result as LuaResult, Table, Value, Variadic};

use super::args::Args;
use super::callbacks::{create_ref, destroy_ref, RefId};
use super::errors::BridgeError;
use super::hooks;
use super::timers::remove_timers;
use super::{ContextId, ContextRef};
use crate::input::InputEvent;

#[derive(Debug)]
struct MenuEntry {
    /// Reference to the menu table; `None` once the menu was stopped.
    menu: Option<RefId>,
    /// The menu itself seen as a context, for its own timers and menus.
    identity: ContextId,
    context: Option<ContextId>,
}

impl MenuEntry {
    fn is_live(&self) -> bool {
        self.menu.is_some()
    }

    fn belongs_to(&self, owner: ContextId) -> bool {
        self.is_live() && self.context == Some(owner)
    }
}

/// Menus in start order. Stopped menus stay as tombstones until the next
/// update so that indices held by an ongoing pass stay valid.
#[derive(Debug, Default)]
pub(crate) struct MenuRegistry {
    entries: Vec<MenuEntry>,
}

impl MenuRegistry {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_live()).count()
    }

    fn indices_of(&self, owner: ContextId) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.belongs_to(owner))
            .map(|(index, _)| index)
            .collect()
    }

    /// Whether `owner` is `menu` itself or one of the menus running under
    /// it, directly or through other menus.
    fn is_within(&self, owner: ContextId, menu: ContextId) -> bool {
        let mut pending = vec![owner];
        let mut visited = BTreeSet::new();
        while let Some(current) = pending.pop() {
            if current == menu {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            pending.extend(
                self.entries
                    .iter()
                    .filter(|entry| entry.is_live() && entry.identity == current)
                    .filter_map(|entry| entry.context),
            );
        }
        false
    }

    fn live_indices(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_live())
            .map(|(index, _)| index)
            .collect()
    }
}

fn menu_table<'lua>(lua: &'lua Lua, context: &ContextRef, menu: RefId) -> LuaResult<Table<'lua>> {
    match context.borrow().refs.push_ref(lua, menu)? {
        Value::Table(table) => Ok(table),
        other => Err(mlua::Error::RuntimeError(format!(
            "menu reference {menu} holds a {} value",
            other.type_name()
        ))),
    }
}

/// Registers a menu under a context and calls its `on_started`. A menu
/// cannot run under itself or under one of its own menus.
pub(crate) fn start_menu<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    owner: ContextId,
    menu: Table<'lua>,
) -> LuaResult<()> {
    let identity = ContextId::of_table(&menu);
    if context.borrow().menus.is_within(owner, identity) {
        return Err(BridgeError::MenuCycle.into());
    }
    let reference = create_ref(lua, context, Value::Table(menu.clone()))?;
    {
        let mut ctx = context.borrow_mut();
        ctx.menus.entries.push(MenuEntry {
            menu: Some(reference),
            identity,
            context: Some(owner),
        });
        ctx.log_event(format!("menu.start {reference}"));
    }
    hooks::on_started(lua, context, &menu);
    Ok(())
}

/// Tombstones one entry, then notifies the menu and tears down what it owns.
fn finish_menu(lua: &Lua, context: &ContextRef, index: usize) -> LuaResult<()> {
    let (reference, identity) = {
        let mut ctx = context.borrow_mut();
        let Some(entry) = ctx.menus.entries.get_mut(index) else {
            return Ok(());
        };
        let Some(reference) = entry.menu.take() else {
            return Ok(());
        };
        entry.context = None;
        let identity = entry.identity;
        ctx.log_event(format!("menu.stop {reference}"));
        (reference, identity)
    };
    let menu = menu_table(lua, context, reference)?;
    hooks::on_finished(lua, context, &menu);
    remove_timers(lua, context, identity)?;
    remove_menus(lua, context, identity)?;
    destroy_ref(lua, context, reference)
}

/// Stops every running instance of a menu table.
pub(crate) fn stop_menu(lua: &Lua, context: &ContextRef, menu: &Table) -> LuaResult<()> {
    let identity = ContextId::of_table(menu);
    let indices: Vec<usize> = {
        let ctx = context.borrow();
        ctx.menus
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_live() && entry.identity == identity)
            .map(|(index, _)| index)
            .collect()
    };
    for index in indices {
        finish_menu(lua, context, index)?;
    }
    Ok(())
}

/// Stops the menus of one context, calling `on_finished` on each.
pub(crate) fn remove_menus(lua: &Lua, context: &ContextRef, owner: ContextId) -> LuaResult<()> {
    let indices = context.borrow().menus.indices_of(owner);
    for index in indices {
        finish_menu(lua, context, index)?;
    }
    Ok(())
}

pub(crate) fn remove_all_menus(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let indices = context.borrow().menus.live_indices();
    for index in indices {
        finish_menu(lua, context, index)?;
    }
    Ok(())
}

/// Drops the tombstones left by stopped menus.
pub(crate) fn update_menus(context: &ContextRef) {
    context
        .borrow_mut()
        .menus
        .entries
        .retain(MenuEntry::is_live);
}

/// Teardown: releases every menu reference without notifying anyone.
pub(crate) fn destroy_menus(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let entries = std::mem::take(&mut context.borrow_mut().menus.entries);
    for reference in entries.into_iter().filter_map(|entry| entry.menu) {
        destroy_ref(lua, context, reference)?;
    }
    Ok(())
}

/// The menu at `index` if it still runs under `owner`.
fn live_menu<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    index: usize,
    owner: ContextId,
) -> LuaResult<Option<(Table<'lua>, ContextId)>> {
    let found = {
        let ctx = context.borrow();
        ctx.menus
            .entries
            .get(index)
            .filter(|entry| entry.belongs_to(owner))
            .and_then(|entry| entry.menu.map(|menu| (menu, entry.identity)))
    };
    match found {
        Some((menu, identity)) => Ok(Some((menu_table(lua, context, menu)?, identity))),
        None => Ok(None),
    }
}

pub(crate) fn menus_on_update(lua: &Lua, context: &ContextRef, owner: ContextId) -> LuaResult<()> {
    let indices = context.borrow().menus.indices_of(owner);
    for index in indices {
        // An earlier menu may have stopped this one.
        if let Some((menu, identity)) = live_menu(lua, context, index, owner)? {
            hooks::on_update(lua, context, &menu);
            menus_on_update(lua, context, identity)?;
        }
    }
    Ok(())
}

/// Draws the menus of a context in start order, each one above its own
/// child menus.
pub(crate) fn menus_on_draw<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    owner: ContextId,
    target: &Value<'lua>,
) -> LuaResult<()> {
    let indices = context.borrow().menus.indices_of(owner);
    for index in indices {
        if let Some((menu, identity)) = live_menu(lua, context, index, owner)? {
            hooks::on_draw(lua, context, &menu, target.clone());
            menus_on_draw(lua, context, identity, target)?;
        }
    }
    Ok(())
}

/// Offers an input event to the menus of a context, latest first. Each menu
/// sees it before its own children; propagation stops once handled.
pub(crate) fn menus_on_input(
    lua: &Lua,
    context: &ContextRef,
    owner: ContextId,
    event: &InputEvent,
) -> LuaResult<bool> {
    let indices = context.borrow().menus.indices_of(owner);
    for index in indices.into_iter().rev() {
        let Some((menu, identity)) = live_menu(lua, context, index, owner)? else {
            continue;
        };
        if hooks::on_input(lua, context, &menu, event) {
            return Ok(true);
        }
        if menus_on_input(lua, context, identity, event)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn install_menu_module(lua: &Lua, context: &ContextRef, kq: &Table) -> Result<()> {
    let module = lua.create_table()?;

    let start_context = context.clone();
    module.set(
        "start",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("start", values);
            let owner = args.check_context(1)?;
            let menu = args.check_table(2)?;
            start_menu(lua, &start_context, owner, menu)
        })?,
    )?;

    let stop_context = context.clone();
    module.set(
        "stop",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("stop", values);
            let menu = args.check_table(1)?;
            stop_menu(lua, &stop_context, &menu)
        })?,
    )?;

    let stop_all_context = context.clone();
    module.set(
        "stop_all",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("stop_all", values);
            if args.is_none_or_nil(1) {
                return remove_all_menus(lua, &stop_all_context);
            }
            let owner = args.check_context(1)?;
            remove_menus(lua, &stop_all_context, owner)
        })?,
    )?;

    kq.set("menu", module)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{bare_context, install_types};
    use super::super::timers::update_timers;
    use super::*;
    use crate::input::Modifiers;

    fn setup() -> (Lua, ContextRef) {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        install_menu_module(&lua, &context, &lua.globals().get("kq").unwrap()).unwrap();
        (lua, context)
    }

    fn owner_of(lua: &Lua, name: &str) -> ContextId {
        let table: Table = lua.globals().get(name).unwrap();
        ContextId::of_table(&table)
    }

    fn events(lua: &Lua) -> Vec<String> {
        lua.load("return log").eval().unwrap()
    }

    fn press(key: &str) -> InputEvent {
        InputEvent::KeyPressed {
            key: key.to_string(),
            modifiers: Modifiers::default(),
        }
    }

    const MENU_FACTORY: &str = r#"
        log = {}
        function make_menu(name, handles)
            local menu = {}
            function menu:on_started() log[#log + 1] = name .. ".started" end
            function menu:on_finished() log[#log + 1] = name .. ".finished" end
            function menu:on_draw(dst) log[#log + 1] = name .. ".draw" end
            function menu:on_key_pressed(key)
                log[#log + 1] = name .. ".key"
                return handles
            end
            return menu
        end
        game = {}
    "#;

    #[test]
    fn started_menu_gets_on_started_once() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load("title = make_menu('title'); kq.menu.start(game, title)")
            .exec()
            .unwrap();
        assert_eq!(events(&lua), ["title.started"]);
        assert_eq!(context.borrow().menus.live_count(), 1);
    }

    #[test]
    fn draw_goes_forward_and_input_goes_backward() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load(
            r#"
            kq.menu.start(game, make_menu('a', false))
            kq.menu.start(game, make_menu('b', true))
            kq.menu.start(game, make_menu('c', false))
            log = {}
        "#,
        )
        .exec()
        .unwrap();
        let game = owner_of(&lua, "game");
        menus_on_draw(&lua, &context, game, &Value::Nil).unwrap();
        assert_eq!(events(&lua), ["a.draw", "b.draw", "c.draw"]);

        lua.load("log = {}").exec().unwrap();
        assert!(menus_on_input(&lua, &context, game, &press("space")).unwrap());
        assert_eq!(events(&lua), ["c.key", "b.key"]);
    }

    #[test]
    fn stopping_a_context_finishes_its_menus_and_their_timers() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load(
            r#"
            pause = make_menu('pause')
            kq.menu.start(game, pause)
            kq.menu.start(pause, make_menu('options'))
            kq.menu.start({}, make_menu('other'))
            kq.timer.start(pause, 100, function() log[#log + 1] = "timer" end)
        "#,
        )
        .exec()
        .unwrap();
        lua.load("log = {}; kq.menu.stop_all(game)").exec().unwrap();
        assert_eq!(events(&lua), ["pause.finished", "options.finished"]);
        {
            let ctx = context.borrow();
            assert_eq!(ctx.menus.len(), 3);
            assert_eq!(ctx.menus.live_count(), 1);
        }

        update_menus(&context);
        assert_eq!(context.borrow().menus.len(), 1);
        context.borrow_mut().now = 200;
        update_timers(&lua, &context).unwrap();
        assert_eq!(events(&lua), ["pause.finished", "options.finished"]);
    }

    #[test]
    fn menu_can_stop_itself_while_handling_input() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load(
            r#"
            dialog = make_menu('dialog', true)
            function dialog:on_key_pressed(key)
                log[#log + 1] = "dialog.key"
                kq.menu.stop(self)
                kq.menu.start(game, self)
                return true
            end
            kq.menu.start(game, dialog)
            log = {}
        "#,
        )
        .exec()
        .unwrap();
        let game = owner_of(&lua, "game");
        assert!(menus_on_input(&lua, &context, game, &press("return")).unwrap());
        assert_eq!(
            events(&lua),
            ["dialog.key", "dialog.finished", "dialog.started"]
        );
        // The tombstone and the new entry coexist until the next update.
        assert_eq!(context.borrow().menus.len(), 2);
        update_menus(&context);
        assert_eq!(context.borrow().menus.len(), 1);
        assert_eq!(context.borrow().refs.len(), 1);
    }

    #[test]
    fn destroy_releases_references_silently() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load("kq.menu.start(game, make_menu('a')); kq.menu.start(game, make_menu('b')); log = {}")
            .exec()
            .unwrap();
        destroy_menus(&lua, &context).unwrap();
        assert!(events(&lua).is_empty());
        assert_eq!(context.borrow().menus.len(), 0);
        assert_eq!(context.borrow().refs.len(), 0);
    }

    #[test]
    fn menus_cannot_run_under_themselves() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load(
            r#"
            outer = make_menu('outer')
            inner = make_menu('inner')
            kq.menu.start(game, outer)
            kq.menu.start(outer, inner)
            self_ok, self_err = pcall(kq.menu.start, outer, outer)
            loop_ok, loop_err = pcall(kq.menu.start, inner, outer)
            function outer:on_update() log[#log + 1] = "outer.update" end
            function inner:on_update() log[#log + 1] = "inner.update" end
            log = {}
        "#,
        )
        .exec()
        .unwrap();
        let (self_ok, loop_ok, loop_err): (bool, bool, String) = lua
            .load("return self_ok, loop_ok, tostring(loop_err)")
            .eval()
            .unwrap();
        assert!(!self_ok);
        assert!(!loop_ok);
        assert!(loop_err.contains("cannot be started under itself"));
        assert_eq!(context.borrow().menus.live_count(), 2);

        let game = owner_of(&lua, "game");
        menus_on_update(&lua, &context, game).unwrap();
        menus_on_draw(&lua, &context, game, &Value::Nil).unwrap();
        assert!(!menus_on_input(&lua, &context, game, &press("space")).unwrap());
        assert_eq!(events(&lua)[..2], ["outer.update", "inner.update"]);
    }

    #[test]
    fn a_menu_may_run_under_two_unrelated_contexts() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load(
            r#"
            shared = make_menu('shared')
            other = {}
            kq.menu.start(game, shared)
            kq.menu.start(other, shared)
        "#,
        )
        .exec()
        .unwrap();
        assert_eq!(context.borrow().menus.live_count(), 2);
    }

    #[test]
    fn remove_all_notifies_every_live_menu() {
        let (lua, context) = setup();
        lua.load(MENU_FACTORY).exec().unwrap();
        lua.load("kq.menu.start(game, make_menu('a')); kq.menu.start({}, make_menu('b')); log = {}")
            .exec()
            .unwrap();
        lua.load("kq.menu.stop_all()").exec().unwrap();
        assert_eq!(events(&lua), ["a.finished", "b.finished"]);
        assert_eq!(context.borrow().menus.live_count(), 0);
    }
}
