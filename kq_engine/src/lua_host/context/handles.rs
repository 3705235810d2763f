use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use mlua::{
    AnyUserData, Lua, MetaMethod, RegistryKey, Result as LuaResult, Table, UserData,
    UserDataMethods, Value,
};

use super::callbacks::cancel_callback;
use super::errors::BridgeError;
use super::scriptable::{NativeObject, ObjectId, Release, Scriptable, TypeTag};
use super::{ContextRef, EngineContext};

/// Ids of handles the script collector finalized since the last drain.
pub(crate) type FinalizeQueue = Rc<RefCell<Vec<ObjectId>>>;

/// Script-side value standing for one native object.
///
/// Reads go to the object's augmentation table first and then to the method
/// table of its type; writes always land in the augmentation table.
pub(crate) struct ObjectHandle {
    id: ObjectId,
    tag: TypeTag,
    context: Weak<RefCell<EngineContext>>,
    finalized: FinalizeQueue,
}

impl ObjectHandle {
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn tag(&self) -> TypeTag {
        self.tag
    }

    fn index<'lua>(&self, lua: &'lua Lua, key: Value<'lua>) -> LuaResult<Value<'lua>> {
        let Some(context) = self.context.upgrade() else {
            return Ok(Value::Nil);
        };
        let (augmentation, methods) = {
            let ctx = context.borrow();
            (
                ctx.augmentation.table(lua, self.id)?,
                ctx.method_tables.table(lua, self.tag)?,
            )
        };
        if let Some(table) = augmentation {
            let value: Value = table.raw_get(key.clone())?;
            if !matches!(value, Value::Nil) {
                return Ok(value);
            }
        }
        match methods {
            Some(methods) => methods.raw_get(key),
            None => Ok(Value::Nil),
        }
    }

    fn new_index<'lua>(&self, lua: &'lua Lua, key: Value<'lua>, value: Value<'lua>) -> LuaResult<()> {
        let context = self
            .context
            .upgrade()
            .ok_or(BridgeError::StaleObject(self.id))?;
        let table = context.borrow_mut().augmentation.ensure(lua, self.id)?;
        table.raw_set(key, value)
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.finalized.borrow_mut().push(self.id);
    }
}

impl UserData for ObjectHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: Value| this.index(lua, key));
        methods.add_meta_method(
            MetaMethod::NewIndex,
            |lua, this, (key, value): (Value, Value)| this.new_index(lua, key, value),
        );
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{} {}", this.tag.module_name(), this.id))
        });
    }
}

/// Lookup shortcut from object identity to its live handle.
///
/// The Lua side is a weak-valued table, so the cache never keeps a handle
/// alive; the Rust side counts handles whose finalization has not been
/// drained yet.
pub(crate) struct HandleCache {
    weak_table: RegistryKey,
    outstanding: BTreeMap<ObjectId, u32>,
    finalized: FinalizeQueue,
}

impl HandleCache {
    pub(crate) fn new(lua: &Lua) -> LuaResult<Self> {
        let table = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.set("__mode", "v")?;
        table.set_metatable(Some(meta));
        Ok(Self {
            weak_table: lua.create_registry_value(table)?,
            outstanding: BTreeMap::new(),
            finalized: Rc::new(RefCell::new(Vec::new())),
        })
    }

    fn lookup<'lua>(&self, lua: &'lua Lua, id: ObjectId) -> LuaResult<Option<AnyUserData<'lua>>> {
        let table: Table = lua.registry_value(&self.weak_table)?;
        match table.raw_get::<_, Value>(id.lua_key())? {
            Value::UserData(handle) => Ok(Some(handle)),
            _ => Ok(None),
        }
    }

    fn remember(&mut self, lua: &Lua, id: ObjectId, handle: &AnyUserData) -> LuaResult<()> {
        let table: Table = lua.registry_value(&self.weak_table)?;
        table.raw_set(id.lua_key(), handle.clone())?;
        *self.outstanding.entry(id).or_insert(0) += 1;
        Ok(())
    }

    fn forget(&mut self, lua: &Lua, id: ObjectId) -> LuaResult<()> {
        self.outstanding.remove(&id);
        let table: Table = lua.registry_value(&self.weak_table)?;
        table.raw_set(id.lua_key(), Value::Nil)
    }

    fn note_finalized(&mut self, id: ObjectId) {
        if let Some(count) = self.outstanding.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.outstanding.remove(&id);
            }
        }
    }

    fn take_finalized(&self) -> Vec<ObjectId> {
        std::mem::take(&mut *self.finalized.borrow_mut())
    }

    /// Handles of `id` whose finalization has not been drained yet.
    pub(crate) fn outstanding(&self, id: ObjectId) -> u32 {
        self.outstanding.get(&id).copied().unwrap_or(0)
    }
}

/// Extra fields scripts attached to objects, keyed by object identity so
/// they survive the handle being collected and re-created.
#[derive(Debug, Default)]
pub(crate) struct AugmentationStore {
    tables: BTreeMap<ObjectId, RegistryKey>,
}

impl AugmentationStore {
    pub(crate) fn table<'lua>(&self, lua: &'lua Lua, id: ObjectId) -> LuaResult<Option<Table<'lua>>> {
        self.tables
            .get(&id)
            .map(|key| lua.registry_value(key))
            .transpose()
    }

    fn ensure<'lua>(&mut self, lua: &'lua Lua, id: ObjectId) -> LuaResult<Table<'lua>> {
        if let Some(key) = self.tables.get(&id) {
            return lua.registry_value(key);
        }
        let table = lua.create_table()?;
        self.tables
            .insert(id, lua.create_registry_value(table.clone())?);
        Ok(table)
    }

    fn remove(&mut self, id: ObjectId) -> Option<RegistryKey> {
        self.tables.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.tables.contains_key(&id)
    }
}

/// Method table of each script-visible type.
#[derive(Debug, Default)]
pub(crate) struct MethodTables {
    tables: BTreeMap<TypeTag, RegistryKey>,
}

impl MethodTables {
    pub(crate) fn register(&mut self, lua: &Lua, tag: TypeTag, methods: Table) -> LuaResult<()> {
        if let Some(previous) = self.tables.insert(tag, lua.create_registry_value(methods)?) {
            lua.remove_registry_value(previous)?;
        }
        Ok(())
    }

    fn table<'lua>(&self, lua: &'lua Lua, tag: TypeTag) -> LuaResult<Option<Table<'lua>>> {
        self.tables
            .get(&tag)
            .map(|key| lua.registry_value(key))
            .transpose()
    }
}

/// Returns the live handle of an object, creating one (and retaining the
/// object for it) when none exists.
pub(crate) fn expose<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    id: ObjectId,
) -> LuaResult<AnyUserData<'lua>> {
    let (cached, tag) = {
        let ctx = context.borrow();
        let tag = ctx
            .objects
            .type_tag(id)
            .ok_or(BridgeError::StaleObject(id))?;
        (ctx.handles.lookup(lua, id)?, tag)
    };
    if let Some(handle) = cached {
        return Ok(handle);
    }

    let finalized = {
        let mut ctx = context.borrow_mut();
        ctx.objects.increment_refcount(id);
        ctx.handles.finalized.clone()
    };
    let handle = lua.create_userdata(ObjectHandle {
        id,
        tag,
        context: Rc::downgrade(context),
        finalized,
    })?;
    context.borrow_mut().handles.remember(lua, id, &handle)?;
    Ok(handle)
}

/// Drops one native reference to an object, tearing it down at zero.
pub(crate) fn release_object(lua: &Lua, context: &ContextRef, id: ObjectId) -> LuaResult<()> {
    let release = context.borrow_mut().objects.release(id);
    if let Release::Destroyed(object) = release {
        destroy_object(lua, context, id, object)?;
    }
    Ok(())
}

/// Applies the refcount decrements of every handle finalized since the last
/// call. Runs only between registry passes.
pub(crate) fn collect_finalized(lua: &Lua, context: &ContextRef) -> LuaResult<usize> {
    let ids = context.borrow().handles.take_finalized();
    for &id in &ids {
        let release = {
            let mut ctx = context.borrow_mut();
            ctx.handles.note_finalized(id);
            ctx.objects.release(id)
        };
        match release {
            Release::Destroyed(object) => destroy_object(lua, context, id, object)?,
            // Only the drawable registry still holds it: nobody can reach it
            // from script any more.
            Release::Retained(1) => {
                let mut ctx = context.borrow_mut();
                if ctx.drawables.contains(id) {
                    ctx.drawables.schedule_removal(id);
                }
            }
            Release::Retained(_) => {}
        }
    }
    Ok(ids.len())
}

fn destroy_object(
    lua: &Lua,
    context: &ContextRef,
    id: ObjectId,
    object: NativeObject,
) -> LuaResult<()> {
    let tag = object.type_tag();
    let (augmentation, transition_callback) = {
        let mut ctx = context.borrow_mut();
        // Every undrained handle still holds a reference to the object.
        debug_assert_eq!(
            ctx.handles.outstanding(id),
            0,
            "object {id} destroyed while a handle is outstanding"
        );
        ctx.drawables.forget(id);
        ctx.handles.forget(lua, id)?;
        let callback = match object {
            NativeObject::Drawable(mut drawable) => drawable.stop_transition(),
            NativeObject::Timer(_) => None,
        };
        ctx.log_event(format!("object.destroy {} {id}", tag.module_name()));
        (ctx.augmentation.remove(id), callback)
    };
    if let Some(key) = augmentation {
        lua.remove_registry_value(key)?;
    }
    cancel_callback(lua, context, transition_callback)
}

/// Settles the finalizations queued while the Lua state was closing. Only
/// Rust-side bookkeeping is left to do at that point.
pub(crate) fn finalize_after_close(context: &ContextRef) -> usize {
    let mut ctx = context.borrow_mut();
    let ids = ctx.handles.take_finalized();
    let mut destroyed = 0;
    for &id in &ids {
        ctx.handles.note_finalized(id);
        if !ctx.objects.contains(id) {
            continue;
        }
        if let Release::Destroyed(object) = ctx.objects.release(id) {
            let tag = object.type_tag();
            ctx.drawables.forget(id);
            ctx.augmentation.remove(id);
            if let NativeObject::Drawable(mut drawable) = object {
                if let Some(callback) = drawable.stop_transition() {
                    let _ = ctx.refs.take(callback);
                }
            }
            ctx.log_event(format!("object.destroy {} {id}", tag.module_name()));
            destroyed += 1;
        }
    }
    ctx.refs.drain();
    destroyed
}
