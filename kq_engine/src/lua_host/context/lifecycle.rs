use anyhow::{anyhow, Context, Result};
use mlua::{Lua, Result as LuaResult, Table, Value};

use super::drawables::{destroy_drawables, update_drawables, Drawable};
use super::handles::{collect_finalized, expose, release_object};
use super::hooks;
use super::main_api::{install_audio_module, install_loader, install_main_module, load_script};
use super::menus::{
    destroy_menus, install_menu_module, menus_on_draw, menus_on_input, menus_on_update,
    remove_menus, update_menus,
};
use super::scriptable::{NativeObject, ObjectId};
use super::surfaces::{install_surface_module, install_text_surface_module, Surface};
use super::timers::{destroy_timers, install_timer_module, remove_timers, update_timers};
use super::{ContextId, ContextRef};
use crate::backend::Color;
use crate::input::InputEvent;

/// The surface the main loop renders every frame into. The engine keeps its
/// own reference on it until exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootSurface(ObjectId);

impl RootSurface {
    pub(crate) fn key(self) -> u64 {
        self.0.raw()
    }
}

fn main_table<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
) -> LuaResult<Option<(Table<'lua>, ContextId)>> {
    let ctx = context.borrow();
    let Some(identity) = ctx.main_context() else {
        return Ok(None);
    };
    Ok(ctx.main_table(lua)?.map(|table| (table, identity)))
}

/// Builds the `kq` API, runs `main.lua` and starts the main context.
pub(crate) fn initialize(lua: &Lua, context: &ContextRef) -> Result<RootSurface> {
    let kq = lua.create_table()?;
    install_main_module(lua, context, &kq)?;
    install_audio_module(lua, context, &kq)?;
    install_timer_module(lua, context, &kq)?;
    install_menu_module(lua, context, &kq)?;
    install_surface_module(lua, context, &kq)?;
    install_text_surface_module(lua, context, &kq)?;
    lua.globals().set("kq", kq)?;
    install_loader(lua, context)?;

    let root = {
        let mut ctx = context.borrow_mut();
        let (width, height) = ctx.renderer.screen_size();
        let id = ctx
            .objects
            .insert(NativeObject::Drawable(Drawable::surface(Surface::new(
                width, height,
            ))));
        ctx.objects.increment_refcount(id);
        id
    };

    let main_script = load_script(lua, context, "main")
        .context("compiling main.lua")?
        .ok_or_else(|| anyhow!("the quest has no main.lua"))?;
    main_script
        .call::<_, ()>(())
        .context("running main.lua")?;

    if let Some((main, _)) = main_table(lua, context)? {
        hooks::on_started(lua, context, &main);
    }
    context.borrow_mut().log_event("main.started");
    Ok(RootSurface(root))
}

/// One simulation step at virtual time `now` (milliseconds).
pub(crate) fn update(lua: &Lua, context: &ContextRef, now: u64) -> LuaResult<()> {
    context.borrow_mut().now = now;
    collect_finalized(lua, context)?;
    update_drawables(lua, context)?;
    update_menus(context);
    update_timers(lua, context)?;
    if let Some((main, identity)) = main_table(lua, context)? {
        hooks::on_update(lua, context, &main);
        menus_on_update(lua, context, identity)?;
    }
    Ok(())
}

/// Offers an input event to `kq.main`, then to its menus. Returns whether
/// some script handled it.
pub(crate) fn notify_input(lua: &Lua, context: &ContextRef, event: &InputEvent) -> LuaResult<bool> {
    let Some((main, identity)) = main_table(lua, context)? else {
        return Ok(false);
    };
    if hooks::on_input(lua, context, &main, event) {
        return Ok(true);
    }
    menus_on_input(lua, context, identity, event)
}

pub(crate) fn draw(lua: &Lua, context: &ContextRef, root: RootSurface) -> LuaResult<()> {
    let renderer = context.borrow().renderer.clone();
    renderer.fill(root.key(), Color::BLACK, None);
    if let Some((main, identity)) = main_table(lua, context)? {
        let target = Value::UserData(expose(lua, context, root.0)?);
        menus_on_draw(lua, context, identity, &target)?;
        hooks::on_draw(lua, context, &main, target);
    }
    renderer.present(root.key());
    Ok(())
}

/// Finishes the main context and tears every registry down. The Lua state
/// must be closed right after.
pub(crate) fn exit(lua: &Lua, context: &ContextRef, root: RootSurface) -> LuaResult<()> {
    collect_finalized(lua, context)?;
    if let Some((main, identity)) = main_table(lua, context)? {
        hooks::on_finished(lua, context, &main);
        remove_timers(lua, context, identity)?;
        remove_menus(lua, context, identity)?;
    }
    destroy_menus(lua, context)?;
    destroy_timers(lua, context)?;
    destroy_drawables(lua, context)?;
    release_object(lua, context, root.0)?;

    let main = context.borrow_mut().main.take();
    if let Some(main) = main {
        lua.remove_registry_value(main.key)?;
    }
    context.borrow_mut().log_event("main.finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::super::{finalize_after_close, EngineContext, EngineServices};
    use super::*;
    use crate::backend::{RecordingAudio, RecordingRenderer, RenderEvent};
    use crate::input::Modifiers;
    use kq_data::DataStore;

    fn start(main_lua: &str) -> (Lua, ContextRef, RootSurface, RecordingRenderer) {
        let lua = Lua::new();
        let renderer = RecordingRenderer::new((320, 240));
        let services = EngineServices {
            renderer: Rc::new(renderer.clone()),
            audio: Rc::new(RecordingAudio::new(["ok"])),
            data: DataStore::from_memory([("main.lua", main_lua.as_bytes().to_vec())]),
        };
        let context = Rc::new(RefCell::new(EngineContext::new(&lua, services).unwrap()));
        let root = initialize(&lua, &context).unwrap();
        (lua, context, root, renderer)
    }

    fn trace(lua: &Lua) -> Vec<String> {
        lua.load("return trace").eval().unwrap()
    }

    const TRACING_MAIN: &str = r#"
        trace = {}
        local function log(line) trace[#trace + 1] = line end
        local menu = {}
        function menu:on_update() log("menu.update") end
        function menu:on_draw() log("menu.draw") end
        function menu:on_key_pressed(key) log("menu.key " .. key) return true end
        function kq.main:on_started()
            log("main.started")
            kq.menu.start(self, menu)
            kq.timer.start(100, function() log("timer") end)
        end
        function kq.main:on_update() log("main.update") end
        function kq.main:on_draw(dst) log("main.draw") end
        function kq.main:on_key_pressed(key) log("main.key " .. key) return key == "space" end
        function kq.main:on_finished() log("main.finished") end
    "#;

    #[test]
    fn frame_order_follows_the_main_context() {
        let (lua, context, root, renderer) = start(TRACING_MAIN);
        assert_eq!(trace(&lua), ["main.started"]);

        update(&lua, &context, 25).unwrap();
        draw(&lua, &context, root).unwrap();
        assert_eq!(
            trace(&lua),
            ["main.started", "main.update", "menu.update", "menu.draw", "main.draw"]
        );

        update(&lua, &context, 125).unwrap();
        assert_eq!(trace(&lua)[5..], ["timer", "main.update", "menu.update"]);

        let events = renderer.events();
        assert_eq!(
            events.first(),
            Some(&RenderEvent::Fill {
                target: root.key(),
                color: Color::BLACK,
                area: None
            })
        );
        assert_eq!(events.last(), Some(&RenderEvent::Present { root: root.key() }));
    }

    #[test]
    fn input_reaches_main_before_its_menus() {
        let (lua, context, _, _) = start(TRACING_MAIN);
        let press = |key: &str| InputEvent::KeyPressed {
            key: key.to_string(),
            modifiers: Modifiers::default(),
        };
        assert!(notify_input(&lua, &context, &press("space")).unwrap());
        assert!(notify_input(&lua, &context, &press("return")).unwrap());
        assert_eq!(
            trace(&lua)[1..],
            ["main.key space", "main.key return", "menu.key return"]
        );
        assert!(!notify_input(&lua, &context, &InputEvent::WindowClosing).unwrap());
    }

    #[test]
    fn exit_finishes_main_and_releases_everything() {
        let (lua, context, root, _) = start(
            r#"
            function kq.main:on_started()
                kq.timer.start(1000, function() end)
                title = kq.text_surface.create({ text = "Title" })
                title:fade_in(10, function() end)
            end
            function kq.main:on_finished() finished = true end
            "#,
        );
        update(&lua, &context, 10).unwrap();
        exit(&lua, &context, root).unwrap();
        let finished: bool = lua.globals().get("finished").unwrap();
        assert!(finished);
        assert_eq!(context.borrow().timers.len(), 0);
        assert_eq!(context.borrow().drawables.len(), 0);

        drop(lua);
        finalize_after_close(&context);
        let ctx = context.borrow();
        assert_eq!(ctx.live_objects(), 0);
        assert_eq!(ctx.refs.len(), 0);
        assert!(ctx.events().iter().any(|event| event == "main.finished"));
    }

    #[test]
    fn missing_main_script_is_fatal() {
        let lua = Lua::new();
        let services = EngineServices {
            renderer: Rc::new(RecordingRenderer::new((320, 240))),
            audio: Rc::new(RecordingAudio::new(Vec::<String>::new())),
            data: DataStore::from_memory(Vec::<(&str, Vec<u8>)>::new()),
        };
        let context = Rc::new(RefCell::new(EngineContext::new(&lua, services).unwrap()));
        let err = initialize(&lua, &context).unwrap_err();
        assert!(err.to_string().contains("main.lua"));
    }
}
