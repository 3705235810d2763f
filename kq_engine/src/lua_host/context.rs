use std::cell::RefCell;
use std::rc::Rc;

mod args;
mod callbacks;
mod drawables;
mod errors;
mod handles;
mod hooks;
mod lifecycle;
mod main_api;
mod menus;
mod scriptable;
mod surfaces;
mod timers;
mod transitions;

pub(super) use handles::finalize_after_close;
pub(super) use lifecycle::{draw, exit, initialize, notify_input, update, RootSurface};

use anyhow::Result;
use callbacks::RefRegistry;
use drawables::DrawableRegistry;
use handles::{AugmentationStore, HandleCache, MethodTables};
use kq_data::{DataStore, StringResource};
use menus::MenuRegistry;
use mlua::{Lua, RegistryKey, Result as LuaResult, Table};
use scriptable::{ObjectArena, ObjectId};
use timers::TimerRegistry;

use crate::backend::{AudioBackend, RenderBackend};

/// Engine state shared by every Lua closure of one script runtime.
pub(crate) type ContextRef = Rc<RefCell<EngineContext>>;

/// Identity of whatever owns timers and menus: a script table (compared by
/// address) or a native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ContextId {
    Table(usize),
    Object(ObjectId),
}

impl ContextId {
    pub(crate) fn of_table(table: &Table) -> Self {
        ContextId::Table(table.to_pointer() as usize)
    }
}

/// Collaborators the host hands to the script bridge.
pub struct EngineServices {
    pub renderer: Rc<dyn RenderBackend>,
    pub audio: Rc<dyn AudioBackend>,
    pub data: DataStore,
}

/// Events kept once the trace is trimmed; it grows to twice this first.
const EVENT_TRACE_LIMIT: usize = 4096;

struct MainTable {
    key: RegistryKey,
    identity: ContextId,
}

pub(crate) struct EngineContext {
    now: u64,
    events: Vec<String>,
    dropped_events: u64,
    objects: ObjectArena,
    handles: HandleCache,
    augmentation: AugmentationStore,
    method_tables: MethodTables,
    refs: RefRegistry,
    timers: TimerRegistry,
    menus: MenuRegistry,
    drawables: DrawableRegistry,
    renderer: Rc<dyn RenderBackend>,
    audio: Rc<dyn AudioBackend>,
    data: DataStore,
    strings: StringResource,
    main: Option<MainTable>,
    exit_requested: bool,
}

impl EngineContext {
    pub(super) fn new(lua: &Lua, services: EngineServices) -> Result<Self> {
        let EngineServices {
            renderer,
            audio,
            data,
        } = services;
        let strings = StringResource::load(&data)?;
        Ok(Self {
            now: 0,
            events: Vec::new(),
            dropped_events: 0,
            objects: ObjectArena::default(),
            handles: HandleCache::new(lua)?,
            augmentation: AugmentationStore::default(),
            method_tables: MethodTables::default(),
            refs: RefRegistry::default(),
            timers: TimerRegistry::default(),
            menus: MenuRegistry::default(),
            drawables: DrawableRegistry::default(),
            renderer,
            audio,
            data,
            strings,
            main: None,
            exit_requested: false,
        })
    }

    pub(super) fn log_event(&mut self, event: impl Into<String>) {
        if self.events.len() >= 2 * EVENT_TRACE_LIMIT {
            let excess = self.events.len() - EVENT_TRACE_LIMIT;
            self.events.drain(..excess);
            self.dropped_events += excess as u64;
            log::debug!("event trace trimmed; {} events dropped so far", self.dropped_events);
        }
        self.events.push(event.into());
    }

    pub(super) fn events(&self) -> &[String] {
        &self.events
    }

    /// Events discarded from the front of the trace.
    pub(super) fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub(super) fn now(&self) -> u64 {
        self.now
    }

    pub(super) fn is_exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub(super) fn live_objects(&self) -> usize {
        self.objects.len()
    }

    pub(super) fn destroyed_objects(&self) -> u64 {
        self.objects.destroyed_count()
    }

    /// Context that timers started without an explicit one belong to.
    pub(crate) fn main_context(&self) -> Option<ContextId> {
        self.main.as_ref().map(|main| main.identity)
    }

    pub(crate) fn main_table<'lua>(&self, lua: &'lua Lua) -> LuaResult<Option<Table<'lua>>> {
        self.main
            .as_ref()
            .map(|main| lua.registry_value(&main.key))
            .transpose()
    }

    pub(crate) fn set_main_table(&mut self, lua: &Lua, table: Table) -> LuaResult<()> {
        let identity = ContextId::of_table(&table);
        let key = lua.create_registry_value(table)?;
        if let Some(previous) = self.main.replace(MainTable { key, identity }) {
            lua.remove_registry_value(previous.key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::backend::{RecordingAudio, RecordingRenderer};

    pub(crate) fn bare_context_with_backends(
        lua: &Lua,
    ) -> (ContextRef, RecordingRenderer, RecordingAudio) {
        let renderer = RecordingRenderer::new((320, 240));
        let audio = RecordingAudio::new(["timer", "timer_hurry", "danger"]);
        let data = DataStore::from_memory([(
            kq_data::strings::STRINGS_FILE,
            b"menu.quit Quit\nmenu.start Start\n".to_vec(),
        )]);
        let services = EngineServices {
            renderer: Rc::new(renderer.clone()),
            audio: Rc::new(audio.clone()),
            data,
        };
        let context = EngineContext::new(lua, services).unwrap();
        (Rc::new(RefCell::new(context)), renderer, audio)
    }

    pub(crate) fn bare_context(lua: &Lua) -> ContextRef {
        bare_context_with_backends(lua).0
    }

    /// Installs the object modules under a global `kq` table whose `main`
    /// field is registered as the main context.
    pub(crate) fn install_types(lua: &Lua, context: &ContextRef) {
        let kq = lua.create_table().unwrap();
        let main = lua.create_table().unwrap();
        kq.set("main", main.clone()).unwrap();
        context.borrow_mut().set_main_table(lua, main).unwrap();
        timers::install_timer_module(lua, context, &kq).unwrap();
        surfaces::install_surface_module(lua, context, &kq).unwrap();
        surfaces::install_text_surface_module(lua, context, &kq).unwrap();
        lua.globals().set("kq", kq).unwrap();
    }
}
