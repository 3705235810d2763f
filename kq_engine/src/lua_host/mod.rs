mod context;

pub use context::EngineServices;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use mlua::{Lua, LuaOptions, StdLib};
use serde::Serialize;

use crate::input::InputEvent;
use context::{ContextRef, EngineContext, RootSurface};

/// What a finished (or still running) script engine did.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRunSummary {
    events: Vec<String>,
    dropped_events: u64,
    elapsed_ms: u64,
    live_objects: usize,
    destroyed_objects: u64,
}

impl EngineRunSummary {
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Oldest events trimmed from a long session's trace.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    pub fn destroyed_objects(&self) -> u64 {
        self.destroyed_objects
    }
}

/// Owns the Lua state and the engine objects its scripts can reach.
///
/// `exit` closes the state; it runs at most once and also on drop.
pub struct LuaContext {
    lua: Option<Lua>,
    context: ContextRef,
    root: RootSurface,
}

impl LuaContext {
    /// Creates the Lua state, installs the `kq` API and runs `main.lua`.
    pub fn new(services: EngineServices) -> Result<Self> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())
            .context("initialising Lua runtime with standard libraries")?;
        let context = Rc::new(RefCell::new(EngineContext::new(&lua, services)?));
        let root = context::initialize(&lua, &context)?;
        Ok(Self {
            lua: Some(lua),
            context,
            root,
        })
    }

    fn lua(&self) -> Result<&Lua> {
        match self.lua.as_ref() {
            Some(lua) => Ok(lua),
            None => bail!("the script engine has already exited"),
        }
    }

    pub fn update(&mut self, now: u64) -> Result<()> {
        let lua = self.lua()?;
        context::update(lua, &self.context, now).context("updating the script engine")?;
        Ok(())
    }

    pub fn notify_input(&mut self, event: &InputEvent) -> Result<bool> {
        let lua = self.lua()?;
        let handled = context::notify_input(lua, &self.context, event)
            .context("dispatching input to scripts")?;
        Ok(handled)
    }

    pub fn draw(&mut self) -> Result<()> {
        let lua = self.lua()?;
        context::draw(lua, &self.context, self.root).context("drawing the main context")?;
        Ok(())
    }

    /// Whether a script called `kq.main.exit()`.
    pub fn is_exit_requested(&self) -> bool {
        self.context.borrow().is_exit_requested()
    }

    pub fn is_running(&self) -> bool {
        self.lua.is_some()
    }

    pub fn exit(&mut self) -> Result<()> {
        let Some(lua) = self.lua.take() else {
            return Ok(());
        };
        let result = context::exit(&lua, &self.context, self.root);
        drop(lua);
        let destroyed = context::finalize_after_close(&self.context);
        log::debug!("closed Lua state; {destroyed} objects released by the collector");
        result.context("shutting down the script engine")?;
        Ok(())
    }

    pub fn summary(&self) -> EngineRunSummary {
        let ctx = self.context.borrow();
        EngineRunSummary {
            events: ctx.events().to_vec(),
            dropped_events: ctx.dropped_events(),
            elapsed_ms: ctx.now(),
            live_objects: ctx.live_objects(),
            destroyed_objects: ctx.destroyed_objects(),
        }
    }
}

impl Drop for LuaContext {
    fn drop(&mut self) {
        if let Err(err) = self.exit() {
            log::error!("{err:#}");
        }
    }
}
