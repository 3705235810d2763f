use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use mlua::{Function, Lua, Result as LuaResult, Table, Value, Variadic};

use super::args::Args;
use super::callbacks::{call_protected, cancel_callback, create_ref, do_callback, RefId};
use super::handles::{expose, release_object};
use super::scriptable::{NativeObject, ObjectId, TypeTag};
use super::{ContextId, ContextRef, EngineContext};

const SOUND_NORMAL: &str = "timer";
const SOUND_HURRY: &str = "timer_hurry";

/// Countdown against the engine clock. All dates are milliseconds of
/// simulated time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Timer {
    expiration_date: u64,
    finished: bool,
    suspended: bool,
    suspended_with_context: bool,
    when_suspended: Option<u64>,
    next_sound_date: Option<u64>,
}

impl Timer {
    pub(crate) fn new(now: u64, delay: u64) -> Self {
        Self {
            expiration_date: now + delay,
            finished: false,
            suspended: false,
            suspended_with_context: false,
            when_suspended: None,
            next_sound_date: None,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Suspending freezes the countdown; resuming pushes the deadline back
    /// by the time spent suspended.
    pub(crate) fn set_suspended(&mut self, suspended: bool, now: u64) {
        if suspended == self.suspended {
            return;
        }
        self.suspended = suspended;
        if suspended {
            self.when_suspended = Some(now);
        } else if let Some(since) = self.when_suspended.take() {
            let paused = now.saturating_sub(since);
            self.expiration_date += paused;
            if let Some(next) = self.next_sound_date.as_mut() {
                *next += paused;
            }
        }
    }

    pub(crate) fn is_suspended_with_context(&self) -> bool {
        self.suspended_with_context
    }

    pub(crate) fn set_suspended_with_context(&mut self, suspended_with_context: bool) {
        self.suspended_with_context = suspended_with_context;
    }

    pub(crate) fn is_with_sound(&self) -> bool {
        self.next_sound_date.is_some()
    }

    pub(crate) fn set_with_sound(&mut self, with_sound: bool, now: u64) {
        self.next_sound_date = with_sound.then_some(now);
    }

    /// Only timers flagged to follow their context get suspended with it,
    /// but resuming the context resumes every one of its timers.
    pub(crate) fn notify_context_suspended(&mut self, suspended: bool, now: u64) {
        if self.suspended_with_context || !suspended {
            self.set_suspended(suspended, now);
        }
    }

    pub(crate) fn remaining_time(&self, now: u64) -> u64 {
        if self.finished {
            return 0;
        }
        let reference = match (self.suspended, self.when_suspended) {
            (true, Some(since)) => since,
            _ => now,
        };
        self.expiration_date.saturating_sub(reference)
    }

    /// Advances the countdown. Returns the countdown sound due this frame.
    pub(crate) fn update(&mut self, now: u64) -> Option<&'static str> {
        if self.suspended || self.finished {
            return None;
        }
        self.finished = now >= self.expiration_date;

        let next = self.next_sound_date.as_mut()?;
        if now < *next {
            return None;
        }
        let remaining = self.expiration_date.saturating_sub(now);
        if remaining > 6000 {
            *next += 1000;
            Some(SOUND_NORMAL)
        } else {
            *next += if remaining > 2000 { 1000 } else { 250 };
            Some(SOUND_HURRY)
        }
    }
}

#[derive(Debug)]
struct TimerEntry {
    callback: Option<RefId>,
    context: ContextId,
}

/// Running timers with their callback and owning context. Each entry holds
/// one reference on its timer object.
#[derive(Debug, Default)]
pub(crate) struct TimerRegistry {
    entries: BTreeMap<ObjectId, TimerEntry>,
    to_remove: BTreeSet<ObjectId>,
}

impl TimerRegistry {
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn ids(&self) -> Vec<ObjectId> {
        self.entries.keys().copied().collect()
    }

    fn ids_of(&self, context: ContextId) -> Vec<ObjectId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.context == context)
            .map(|(id, _)| *id)
            .collect()
    }

    fn is_active(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id) && !self.to_remove.contains(&id)
    }
}

pub(crate) fn add_timer(
    ctx: &mut EngineContext,
    id: ObjectId,
    context: ContextId,
    callback: Option<RefId>,
) {
    ctx.objects.increment_refcount(id);
    ctx.timers
        .entries
        .insert(id, TimerEntry { callback, context });
}

/// Fires every timer whose deadline passed, in creation order, then sweeps
/// the ones that finished or were stopped.
pub(crate) fn update_timers(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let ids = context.borrow().timers.ids();
    for id in ids {
        let (finished, sound, callback, audio) = {
            let mut guard = context.borrow_mut();
            let ctx = &mut *guard;
            if !ctx.timers.is_active(id) {
                continue;
            }
            let now = ctx.now;
            let Some(timer) = ctx.objects.timer_mut(id) else {
                continue;
            };
            let sound = timer.update(now);
            let finished = timer.is_finished();
            let callback = if finished {
                ctx.timers.to_remove.insert(id);
                ctx.log_event(format!("timer.finished {id}"));
                ctx.timers
                    .entries
                    .get_mut(&id)
                    .and_then(|entry| entry.callback.take())
            } else {
                None
            };
            (finished, sound, callback, ctx.audio.clone())
        };
        if let Some(sound) = sound {
            if audio.sound_exists(sound) {
                audio.play_sound(sound);
            } else {
                log::debug!("countdown sound '{sound}' is not available");
            }
        }
        if finished {
            do_callback(lua, context, callback, "timer callback")?;
        }
    }
    sweep_timers(lua, context)
}

/// Stops a timer. Its callback is cancelled unless it already ran.
pub(crate) fn remove_timer(lua: &Lua, context: &ContextRef, id: ObjectId) -> LuaResult<()> {
    let callback = {
        let mut guard = context.borrow_mut();
        let ctx = &mut *guard;
        let Some(entry) = ctx.timers.entries.get_mut(&id) else {
            return Ok(());
        };
        let callback = entry.callback.take();
        ctx.timers.to_remove.insert(id);
        callback
    };
    cancel_callback(lua, context, callback)
}

/// Stops every timer attached to a context.
pub(crate) fn remove_timers(lua: &Lua, context: &ContextRef, owner: ContextId) -> LuaResult<()> {
    let ids = context.borrow().timers.ids_of(owner);
    for id in ids {
        remove_timer(lua, context, id)?;
    }
    Ok(())
}

pub(crate) fn sweep_timers(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let removed = std::mem::take(&mut context.borrow_mut().timers.to_remove);
    for id in removed {
        let entry = context.borrow_mut().timers.entries.remove(&id);
        if let Some(entry) = entry {
            cancel_callback(lua, context, entry.callback)?;
            release_object(lua, context, id)?;
        }
    }
    Ok(())
}

/// Teardown: cancels every pending callback and drops every entry at once.
pub(crate) fn destroy_timers(lua: &Lua, context: &ContextRef) -> LuaResult<()> {
    let entries = {
        let mut ctx = context.borrow_mut();
        ctx.timers.to_remove.clear();
        std::mem::take(&mut ctx.timers.entries)
    };
    for (id, entry) in entries {
        cancel_callback(lua, context, entry.callback)?;
        release_object(lua, context, id)?;
    }
    Ok(())
}

pub(crate) fn notify_context_suspended(ctx: &mut EngineContext, owner: ContextId, suspended: bool) {
    let now = ctx.now;
    for id in ctx.timers.ids_of(owner) {
        if let Some(timer) = ctx.objects.timer_mut(id) {
            timer.notify_context_suspended(suspended, now);
        }
    }
}

fn start_timer<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    args: &Args<'lua>,
) -> LuaResult<Value<'lua>> {
    // Parameters: [context] delay callback
    let (owner, first) = if args.is_number(1) {
        let owner = context.borrow().main_context();
        match owner {
            Some(owner) => (owner, 1),
            None => return Err(args.bad_type(1, "table or userdata").into()),
        }
    } else {
        (args.check_context(1)?, 2)
    };
    let delay = args.check_integer(first)?;
    if delay < 0 {
        return Err(args.invalid(first, "delay must not be negative").into());
    }
    let function = args.check_function(first + 1)?;

    if delay == 0 {
        call_protected::<_, ()>(context, "timer callback", &function, ());
        return Ok(Value::Nil);
    }

    let callback = create_ref(lua, context, Value::Function(function))?;
    let id = {
        let mut ctx = context.borrow_mut();
        let now = ctx.now;
        let id = ctx
            .objects
            .insert(NativeObject::Timer(Timer::new(now, delay as u64)));
        add_timer(&mut ctx, id, owner, Some(callback));
        ctx.log_event(format!("timer.start {id} {delay}"));
        id
    };
    Ok(Value::UserData(expose(lua, context, id)?))
}

/// Installs a method that reads or flips one flag of a timer.
fn timer_method<'lua, F, R>(
    lua: &'lua Lua,
    context: &ContextRef,
    name: &'static str,
    body: F,
) -> LuaResult<Function<'lua>>
where
    F: Fn(&mut EngineContext, ObjectId, &Args) -> LuaResult<R> + 'static,
    R: for<'any> mlua::IntoLuaMulti<'any>,
{
    let context = context.clone();
    lua.create_function(move |_, values: Variadic<Value>| {
        let args = Args::new(name, values);
        let id = args.check_object(1, TypeTag::Timer)?;
        let mut ctx = context.borrow_mut();
        body(&mut *ctx, id, &args)
    })
}

pub(crate) fn install_timer_module(lua: &Lua, context: &ContextRef, kq: &Table) -> Result<()> {
    let module = lua.create_table()?;

    let start_context = context.clone();
    module.set(
        "start",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("start", values);
            start_timer(lua, &start_context, &args)
        })?,
    )?;

    let stop_all_context = context.clone();
    module.set(
        "stop_all",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("stop_all", values);
            let owner = args.check_context(1)?;
            remove_timers(lua, &stop_all_context, owner)
        })?,
    )?;

    let suspend_all_context = context.clone();
    module.set(
        "suspend_all",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("suspend_all", values);
            let owner = args.check_context(1)?;
            let suspended = args.opt_bool(2, true);
            notify_context_suspended(&mut suspend_all_context.borrow_mut(), owner, suspended);
            Ok(())
        })?,
    )?;

    let stop_context = context.clone();
    module.set(
        "stop",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("stop", values);
            let id = args.check_object(1, TypeTag::Timer)?;
            remove_timer(lua, &stop_context, id)
        })?,
    )?;

    module.set(
        "is_suspended",
        timer_method(lua, context, "is_suspended", |ctx, id, _| {
            Ok(ctx.objects.timer(id).is_some_and(Timer::is_suspended))
        })?,
    )?;
    module.set(
        "set_suspended",
        timer_method(lua, context, "set_suspended", |ctx, id, args| {
            let suspended = args.opt_bool(2, true);
            let now = ctx.now;
            if let Some(timer) = ctx.objects.timer_mut(id) {
                timer.set_suspended(suspended, now);
            }
            Ok(())
        })?,
    )?;
    module.set(
        "is_suspended_with_context",
        timer_method(lua, context, "is_suspended_with_context", |ctx, id, _| {
            Ok(ctx
                .objects
                .timer(id)
                .is_some_and(Timer::is_suspended_with_context))
        })?,
    )?;
    module.set(
        "set_suspended_with_context",
        timer_method(lua, context, "set_suspended_with_context", |ctx, id, args| {
            let suspended_with_context = args.opt_bool(2, true);
            if let Some(timer) = ctx.objects.timer_mut(id) {
                timer.set_suspended_with_context(suspended_with_context);
            }
            Ok(())
        })?,
    )?;
    module.set(
        "is_with_sound",
        timer_method(lua, context, "is_with_sound", |ctx, id, _| {
            Ok(ctx.objects.timer(id).is_some_and(Timer::is_with_sound))
        })?,
    )?;
    module.set(
        "set_with_sound",
        timer_method(lua, context, "set_with_sound", |ctx, id, args| {
            let with_sound = args.opt_bool(2, true);
            let now = ctx.now;
            if let Some(timer) = ctx.objects.timer_mut(id) {
                timer.set_with_sound(with_sound, now);
            }
            Ok(())
        })?,
    )?;
    module.set(
        "get_remaining_time",
        timer_method(lua, context, "get_remaining_time", |ctx, id, _| {
            let now = ctx.now;
            Ok(ctx
                .objects
                .timer(id)
                .map(|timer| timer.remaining_time(now))
                .unwrap_or(0))
        })?,
    )?;

    context
        .borrow_mut()
        .method_tables
        .register(lua, TypeTag::Timer, module.clone())?;
    kq.set(TypeTag::Timer.field_name(), module)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{bare_context, bare_context_with_backends, install_types};
    use super::*;

    fn advance(lua: &Lua, context: &ContextRef, now: u64) {
        context.borrow_mut().now = now;
        update_timers(lua, context).unwrap();
    }

    #[test]
    fn suspension_shifts_the_deadline() {
        let mut timer = Timer::new(0, 1000);
        timer.update(400);
        timer.set_suspended(true, 400);
        assert_eq!(timer.remaining_time(900), 600);
        timer.update(1500);
        assert!(!timer.is_finished());
        timer.set_suspended(false, 1500);
        assert_eq!(timer.remaining_time(1500), 600);
        timer.update(2099);
        assert!(!timer.is_finished());
        timer.update(2100);
        assert!(timer.is_finished());
        assert_eq!(timer.remaining_time(2200), 0);
    }

    #[test]
    fn context_suspension_only_follows_flagged_timers() {
        let mut plain = Timer::new(0, 1000);
        let mut flagged = Timer::new(0, 1000);
        flagged.set_suspended_with_context(true);
        plain.notify_context_suspended(true, 100);
        flagged.notify_context_suspended(true, 100);
        assert!(!plain.is_suspended());
        assert!(flagged.is_suspended());

        plain.set_suspended(true, 200);
        plain.notify_context_suspended(false, 300);
        flagged.notify_context_suspended(false, 300);
        assert!(!plain.is_suspended());
        assert!(!flagged.is_suspended());
    }

    #[test]
    fn countdown_sound_speeds_up_near_the_end() {
        let mut timer = Timer::new(0, 8000);
        timer.set_with_sound(true, 0);
        assert_eq!(timer.update(0), Some("timer"));
        assert_eq!(timer.update(500), None);
        assert_eq!(timer.update(1000), Some("timer"));
        for now in [2000, 3000, 4000, 5000] {
            assert_eq!(timer.update(now), Some("timer_hurry"));
        }
        assert_eq!(timer.update(6000), Some("timer_hurry"));
        assert_eq!(timer.update(6100), None);
        assert_eq!(timer.update(6250), Some("timer_hurry"));
        assert_eq!(timer.update(6400), None);
        assert!(!timer.is_finished());
    }

    #[test]
    fn timer_fires_once_and_leaves_the_registry() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        lua.load(
            r#"
            owner = {}
            fired = 0
            kq.timer.start(owner, 1000, function() fired = fired + 1 end)
        "#,
        )
        .exec()
        .unwrap();
        assert_eq!(context.borrow().timers.len(), 1);

        advance(&lua, &context, 500);
        assert_eq!(lua.globals().get::<_, i64>("fired").unwrap(), 0);
        advance(&lua, &context, 1100);
        assert_eq!(lua.globals().get::<_, i64>("fired").unwrap(), 1);
        assert_eq!(context.borrow().timers.len(), 0);
        advance(&lua, &context, 3000);
        assert_eq!(lua.globals().get::<_, i64>("fired").unwrap(), 1);
        assert_eq!(context.borrow().refs.len(), 0);
    }

    #[test]
    fn stopping_the_context_cancels_its_timers() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        lua.load(
            r#"
            a, b = {}, {}
            fired = {}
            kq.timer.start(a, 1000, function() fired[#fired + 1] = "a" end)
            kq.timer.start(b, 1000, function() fired[#fired + 1] = "b" end)
        "#,
        )
        .exec()
        .unwrap();

        advance(&lua, &context, 500);
        lua.load("kq.timer.stop_all(a)").exec().unwrap();
        assert_eq!(context.borrow().refs.len(), 1);
        advance(&lua, &context, 1100);
        let fired: Vec<String> = lua.load("return fired").eval().unwrap();
        assert_eq!(fired, ["b"]);
        assert_eq!(context.borrow().timers.len(), 0);
    }

    #[test]
    fn callbacks_may_start_and_stop_timers() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        lua.load(
            r#"
            log = {}
            victim = kq.timer.start(200, function() log[#log + 1] = "victim" end)
            kq.timer.start(100, function()
                log[#log + 1] = "first"
                victim:stop()
                kq.timer.start(100, function() log[#log + 1] = "chained" end)
            end)
        "#,
        )
        .exec()
        .unwrap();

        advance(&lua, &context, 100);
        assert_eq!(context.borrow().timers.len(), 1);
        advance(&lua, &context, 250);
        let log: Vec<String> = lua.load("return log").eval().unwrap();
        assert_eq!(log, ["first", "chained"]);
    }

    #[test]
    fn zero_delay_runs_immediately() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let (handle_is_nil, ran): (bool, bool) = lua
            .load(
                r#"
                local ran = false
                local timer = kq.timer.start(0, function() ran = true end)
                return timer == nil, ran
            "#,
            )
            .eval()
            .unwrap();
        assert!(handle_is_nil);
        assert!(ran);
        assert_eq!(context.borrow().timers.len(), 0);
    }

    #[test]
    fn bad_context_is_rejected() {
        let lua = Lua::new();
        let context = bare_context(&lua);
        install_types(&lua, &context);
        let err = lua
            .load("kq.timer.start('main', 10, function() end)")
            .exec()
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("bad argument #1 to 'start' (table or userdata expected, got string)"));
        let err = lua.load("kq.timer.start({}, 10)").exec().unwrap_err();
        assert!(err.to_string().contains("function expected, got no value"));
    }

    #[test]
    fn timer_methods_and_countdown_sound() {
        let lua = Lua::new();
        let (context, _, audio) = bare_context_with_backends(&lua);
        install_types(&lua, &context);
        lua.load(
            r#"
            t = kq.timer.start(8000, function() end)
            t:set_with_sound(true)
            t:set_suspended_with_context()
        "#,
        )
        .exec()
        .unwrap();
        advance(&lua, &context, 1000);
        let (with_sound, follows, remaining): (bool, bool, u64) = lua
            .load("return t:is_with_sound(), t:is_suspended_with_context(), t:get_remaining_time()")
            .eval()
            .unwrap();
        assert!(with_sound);
        assert!(follows);
        assert_eq!(remaining, 7000);
        assert_eq!(audio.played(), vec!["timer".to_string()]);

        lua.load("kq.timer.suspend_all(kq.main, true)").exec().unwrap();
        let suspended: bool = lua.load("return t:is_suspended()").eval().unwrap();
        assert!(suspended);
        lua.load("t:set_suspended(false)").exec().unwrap();
        let suspended: bool = lua.load("return t:is_suspended()").eval().unwrap();
        assert!(!suspended);
    }
}
