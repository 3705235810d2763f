use std::collections::BTreeSet;

use anyhow::Result;
use mlua::{Lua, Result as LuaResult, Table, Value, Variadic};

use super::args::Args;
use super::callbacks::{cancel_callback, create_ref, do_callback, RefId};
use super::errors::BridgeError;
use super::handles::release_object;
use super::scriptable::{ObjectId, TypeTag};
use super::surfaces::{RenderingMode, Surface, TextSurface};
use super::transitions::{Direction, Transition, TransitionFade, DEFAULT_FADE_DELAY};
use super::{ContextRef, EngineContext};
use crate::backend::TextDraw;

#[derive(Debug)]
pub(crate) enum DrawableKind {
    Surface(Surface),
    Text(TextSurface),
}

/// Anything scripts can draw: a position, a kind-specific payload and at
/// most one running transition.
#[derive(Debug)]
pub(crate) struct Drawable {
    xy: (i32, i32),
    opacity: u8,
    transition: Option<Box<dyn Transition>>,
    transition_callback: Option<RefId>,
    kind: DrawableKind,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransitionUpdate {
    Idle,
    Running,
    Finished(Option<RefId>),
}

impl Drawable {
    pub(crate) fn surface(surface: Surface) -> Self {
        Self::new(DrawableKind::Surface(surface))
    }

    pub(crate) fn text(text: TextSurface) -> Self {
        Self::new(DrawableKind::Text(text))
    }

    fn new(kind: DrawableKind) -> Self {
        Self {
            xy: (0, 0),
            opacity: 255,
            transition: None,
            transition_callback: None,
            kind,
        }
    }

    pub(crate) fn type_tag(&self) -> TypeTag {
        match self.kind {
            DrawableKind::Surface(_) => TypeTag::Surface,
            DrawableKind::Text(_) => TypeTag::TextSurface,
        }
    }

    pub(crate) fn kind(&self) -> &DrawableKind {
        &self.kind
    }

    pub(crate) fn kind_mut(&mut self) -> &mut DrawableKind {
        &mut self.kind
    }

    pub(crate) fn xy(&self) -> (i32, i32) {
        self.xy
    }

    pub(crate) fn set_xy(&mut self, x: i32, y: i32) {
        self.xy = (x, y);
    }

    pub(crate) fn opacity(&self) -> u8 {
        self.opacity
    }

    #[cfg(test)]
    pub(crate) fn transition_name(&self) -> Option<&'static str> {
        self.transition.as_ref().map(|transition| transition.name())
    }

    /// Installs a started transition and returns the callback of the one it
    /// replaced, which the caller must cancel.
    pub(crate) fn start_transition(
        &mut self,
        mut transition: Box<dyn Transition>,
        callback: Option<RefId>,
        now: u64,
    ) -> Option<RefId> {
        let previous = self.stop_transition();
        transition.start(now);
        self.apply_alpha(transition.as_ref());
        self.transition = Some(transition);
        self.transition_callback = callback;
        previous
    }

    /// Detaches the transition, handing back its pending callback.
    pub(crate) fn stop_transition(&mut self) -> Option<RefId> {
        self.transition = None;
        self.transition_callback.take()
    }

    pub(crate) fn update(&mut self, now: u64) -> TransitionUpdate {
        let Some(mut transition) = self.transition.take() else {
            return TransitionUpdate::Idle;
        };
        transition.update(now);
        self.apply_alpha(transition.as_ref());
        if transition.is_finished() {
            TransitionUpdate::Finished(self.transition_callback.take())
        } else {
            self.transition = Some(transition);
            TransitionUpdate::Running
        }
    }

    fn apply_alpha(&mut self, transition: &dyn Transition) {
        if let Some(alpha) = transition.alpha() {
            self.opacity = alpha.min(255) as u8;
        }
    }
}

/// Drawables created by scripts of this world. Each entry holds one
/// reference on its object.
#[derive(Debug, Default)]
pub(crate) struct DrawableRegistry {
    live: BTreeSet<ObjectId>,
    to_remove: BTreeSet<ObjectId>,
}

impl DrawableRegistry {
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.live.contains(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn ids(&self) -> Vec<ObjectId> {
        self.live.iter().copied().collect()
    }

    pub(crate) fn schedule_removal(&mut self, id: ObjectId) {
        if self.live.contains(&id) {
            self.to_remove.insert(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending_removal(&self, id: ObjectId) -> bool {
        self.to_remove.contains(&id)
    }

    /// Drops bookkeeping for an object that was destroyed elsewhere.
    pub(crate) fn forget(&mut self, id: ObjectId) {
        self.live.remove(&id);
        self.to_remove.remove(&id);
    }

    fn add(&mut self, id: ObjectId) {
        self.live.insert(id);
    }

    fn take_removed(&mut self) -> Vec<ObjectId> {
        let pending = std::mem::take(&mut self.to_remove);
        pending
            .into_iter()
            .filter(|id| self.live.remove(id))
            .collect()
    }

    fn take_all(&mut self) -> Vec<ObjectId> {
        self.to_remove.clear();
        std::mem::take(&mut self.live).into_iter().collect()
    }
}

pub(crate) fn register_drawable(ctx: &mut EngineContext, id: ObjectId) {
    ctx.objects.increment_refcount(id);
    ctx.drawables.add(id);
}

/// Advances transitions, fires finish callbacks, then releases drawables
/// nobody can reach any more.
pub(crate) fn update_drawables(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let ids = context.borrow().drawables.ids();
    for id in ids {
        let outcome = {
            let mut guard = context.borrow_mut();
            let ctx = &mut *guard;
            if !ctx.drawables.contains(id) {
                continue;
            }
            let now = ctx.now;
            match ctx.objects.drawable_mut(id) {
                Some(drawable) => drawable.update(now),
                None => continue,
            }
        };
        if let TransitionUpdate::Finished(callback) = outcome {
            context
                .borrow_mut()
                .log_event(format!("drawable.transition_finished {id}"));
            do_callback(lua, context, callback, "transition callback")?;
        }
    }

    let removed = context.borrow_mut().drawables.take_removed();
    for id in removed {
        release_object(lua, context, id)?;
    }
    Ok(())
}

/// World teardown: drops the registry's reference on every drawable at
/// once, whatever else still points at them.
pub(crate) fn destroy_drawables(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let all = context.borrow_mut().drawables.take_all();
    for id in all {
        release_object(lua, context, id)?;
    }
    Ok(())
}

pub(crate) fn start_transition(
    lua: &Lua,
    context: &ContextRef,
    id: ObjectId,
    transition: Box<dyn Transition>,
    callback: Option<RefId>,
) -> LuaResult<()> {
    let started = {
        let mut guard = context.borrow_mut();
        let ctx = &mut *guard;
        let now = ctx.now;
        let name = transition.name();
        match ctx.objects.drawable_mut(id) {
            Some(drawable) => {
                let previous = drawable.start_transition(transition, callback, now);
                ctx.log_event(format!("drawable.transition {name} {id}"));
                Ok(previous)
            }
            None => Err(callback),
        }
    };
    match started {
        Ok(previous) => cancel_callback(lua, context, previous),
        Err(callback) => {
            cancel_callback(lua, context, callback)?;
            Err(BridgeError::StaleObject(id).into())
        }
    }
}

/// Renders a drawable onto a destination surface at its position plus the
/// given offset.
pub(crate) fn draw_drawable(ctx: &EngineContext, id: ObjectId, target: ObjectId, x: i32, y: i32) {
    let Some(drawable) = ctx.objects.drawable(id) else {
        return;
    };
    let (base_x, base_y) = drawable.xy();
    let (x, y) = (base_x + x, base_y + y);
    let opacity = drawable.opacity();
    match drawable.kind() {
        DrawableKind::Surface(_) => {
            ctx.renderer.blit(id.raw(), target.raw(), x, y, opacity);
        }
        DrawableKind::Text(text) => {
            if text.text().is_empty() {
                return;
            }
            let (width, height) = ctx.renderer.measure_text(text.font(), text.text());
            let (x, y) = text.anchor(x, y, width, height);
            ctx.renderer.draw_text(
                target.raw(),
                &TextDraw {
                    text: text.text().to_string(),
                    font: text.font().map(str::to_string),
                    color: text.color(),
                    antialiased: text.rendering_mode() == RenderingMode::Antialiasing,
                    x,
                    y,
                    opacity,
                },
            );
        }
    }
}

/// Methods every drawable type shares.
pub(crate) fn install_drawable_methods(
    lua: &Lua,
    context: &ContextRef,
    module: &Table,
) -> Result<()> {
    let draw_context = context.clone();
    module.set(
        "draw",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("draw", values);
            let id = args.check_drawable(1)?;
            let target = args.check_object(2, TypeTag::Surface)?;
            let x = args.opt_integer(3, 0)? as i32;
            let y = args.opt_integer(4, 0)? as i32;
            draw_drawable(&draw_context.borrow(), id, target, x, y);
            Ok(())
        })?,
    )?;

    let get_xy_context = context.clone();
    module.set(
        "get_xy",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("get_xy", values);
            let id = args.check_drawable(1)?;
            let ctx = get_xy_context.borrow();
            let (x, y) = ctx
                .objects
                .drawable(id)
                .map(Drawable::xy)
                .unwrap_or_default();
            Ok((x, y))
        })?,
    )?;

    let set_xy_context = context.clone();
    module.set(
        "set_xy",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("set_xy", values);
            let id = args.check_drawable(1)?;
            let x = args.check_integer(2)? as i32;
            let y = args.check_integer(3)? as i32;
            if let Some(drawable) = set_xy_context.borrow_mut().objects.drawable_mut(id) {
                drawable.set_xy(x, y);
            }
            Ok(())
        })?,
    )?;

    for (name, direction) in [("fade_in", Direction::In), ("fade_out", Direction::Out)] {
        let fade_context = context.clone();
        module.set(
            name,
            lua.create_function(move |lua, values: Variadic<Value>| {
                let args = Args::new(name, values);
                let id = args.check_drawable(1)?;
                // Optional delay, then optional callback.
                let mut index = 2;
                let mut delay = DEFAULT_FADE_DELAY;
                if args.is_number(index) {
                    delay = args.check_integer(index)?.max(1) as u64;
                    index += 1;
                }
                let callback = if args.len() >= index {
                    let function = args.check_function(index)?;
                    Some(create_ref(lua, &fade_context, Value::Function(function))?)
                } else {
                    None
                };
                let transition = Box::new(TransitionFade::new(direction, delay));
                start_transition(lua, &fade_context, id, transition, callback)
            })?,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::handles::{collect_finalized, expose};
    use super::super::scriptable::NativeObject;
    use super::super::test_support::{bare_context, install_types};
    use super::*;

    fn surface_object(context: &ContextRef) -> ObjectId {
        let mut ctx = context.borrow_mut();
        let id = ctx
            .objects
            .insert(NativeObject::Drawable(Drawable::surface(Surface::new(4, 4))));
        register_drawable(&mut ctx, id);
        id
    }

    #[test]
    fn finished_transition_fires_its_callback_once() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let id = surface_object(&context);
        lua.globals()
            .set("s", expose(&lua, &context, id).unwrap())
            .unwrap();
        lua.load("done = 0; s:fade_out(10, function() done = done + 1 end)")
            .exec()
            .unwrap();

        for step in 1..=40 {
            context.borrow_mut().now = step * 10;
            update_drawables(&lua, &context).unwrap();
        }
        assert_eq!(lua.globals().get::<_, i64>("done").unwrap(), 1);
        let ctx = context.borrow();
        let drawable = ctx.objects.drawable(id).unwrap();
        assert!(drawable.transition_name().is_none());
        assert_eq!(drawable.opacity(), 0);
        assert_eq!(ctx.refs.len(), 0);
    }

    #[test]
    fn new_transition_cancels_the_previous_callback() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let id = surface_object(&context);
        lua.globals()
            .set("s", expose(&lua, &context, id).unwrap())
            .unwrap();
        lua.load(
            r#"
            log = {}
            s:fade_out(function() log[#log + 1] = "out" end)
            s:fade_in(5, function() log[#log + 1] = "in" end)
        "#,
        )
        .exec()
        .unwrap();
        assert_eq!(context.borrow().refs.len(), 1);

        for step in 1..=100 {
            context.borrow_mut().now = step * 10;
            update_drawables(&lua, &context).unwrap();
        }
        let log: Vec<String> = lua.load("return log").eval().unwrap();
        assert_eq!(log, ["in"]);
    }

    #[test]
    fn unreachable_drawable_is_released_by_the_sweep() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let id = surface_object(&context);
        lua.globals()
            .set("s", expose(&lua, &context, id).unwrap())
            .unwrap();
        assert_eq!(context.borrow().objects.refcount(id), Some(2));

        lua.load("s = nil").exec().unwrap();
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        collect_finalized(&lua, &context).unwrap();
        {
            let ctx = context.borrow();
            assert_eq!(ctx.objects.refcount(id), Some(1));
            assert!(ctx.drawables.is_pending_removal(id));
        }

        update_drawables(&lua, &context).unwrap();
        let ctx = context.borrow();
        assert!(!ctx.objects.contains(id));
        assert!(!ctx.drawables.contains(id));
    }

    #[test]
    fn force_teardown_spares_objects_still_held_elsewhere() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let held = surface_object(&context);
        let orphan = surface_object(&context);
        context.borrow_mut().objects.increment_refcount(held);

        let callback = {
            let function = lua.create_function(|_, ()| Ok(())).unwrap();
            create_ref(&lua, &context, Value::Function(function)).unwrap()
        };
        start_transition(
            &lua,
            &context,
            orphan,
            Box::new(TransitionFade::new(Direction::Out, DEFAULT_FADE_DELAY)),
            Some(callback),
        )
        .unwrap();

        destroy_drawables(&lua, &context).unwrap();
        let ctx = context.borrow();
        assert_eq!(ctx.drawables.len(), 0);
        assert_eq!(ctx.objects.refcount(held), Some(1));
        assert!(!ctx.objects.contains(orphan));
        assert!(!ctx.refs.contains(callback));
    }
}
