use std::collections::BTreeMap;
use std::fmt;

use super::drawables::Drawable;
use super::timers::Timer;

/// Identity of a native object shared with scripts. Ids are handed out in
/// creation order and never reused, so a stale id can only miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn lua_key(self) -> i64 {
        self.0 as i64
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TypeTag {
    Timer,
    Surface,
    TextSurface,
}

impl TypeTag {
    pub(crate) fn module_name(self) -> &'static str {
        match self {
            TypeTag::Timer => "kq.timer",
            TypeTag::Surface => "kq.surface",
            TypeTag::TextSurface => "kq.text_surface",
        }
    }

    /// Field of the global `kq` table holding this type's module.
    pub(crate) fn field_name(self) -> &'static str {
        match self {
            TypeTag::Timer => "timer",
            TypeTag::Surface => "surface",
            TypeTag::TextSurface => "text_surface",
        }
    }

    pub(crate) fn is_drawable(self) -> bool {
        matches!(self, TypeTag::Surface | TypeTag::TextSurface)
    }
}

/// Capability shared by every native object that scripts can hold.
pub(crate) trait Scriptable {
    fn type_tag(&self) -> TypeTag;
}

#[derive(Debug)]
pub(crate) enum NativeObject {
    Timer(Timer),
    Drawable(Drawable),
}

impl Scriptable for NativeObject {
    fn type_tag(&self) -> TypeTag {
        match self {
            NativeObject::Timer(_) => TypeTag::Timer,
            NativeObject::Drawable(drawable) => drawable.type_tag(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefCount(u32);

impl RefCount {
    pub(crate) fn increment(&mut self) -> u32 {
        self.0 += 1;
        self.0
    }

    pub(crate) fn decrement(&mut self) -> u32 {
        assert!(self.0 > 0, "refcount decremented below zero");
        self.0 -= 1;
        self.0
    }

    pub(crate) fn get(self) -> u32 {
        self.0
    }
}

/// Outcome of dropping one reference through [`ObjectArena::release`].
#[derive(Debug)]
pub(crate) enum Release {
    Retained(u32),
    Destroyed(NativeObject),
}

#[derive(Debug)]
struct Slot {
    refcount: RefCount,
    object: NativeObject,
}

/// Owner of every shared native object. Objects start with a zero refcount
/// and must be retained by a registry or a handle right after insertion.
#[derive(Debug, Default)]
pub(crate) struct ObjectArena {
    next_id: u64,
    slots: BTreeMap<ObjectId, Slot>,
    destroyed: u64,
}

impl ObjectArena {
    pub(crate) fn insert(&mut self, object: NativeObject) -> ObjectId {
        self.next_id += 1;
        let id = ObjectId(self.next_id);
        self.slots.insert(
            id,
            Slot {
                refcount: RefCount::default(),
                object,
            },
        );
        id
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn destroyed_count(&self) -> u64 {
        self.destroyed
    }

    pub(crate) fn type_tag(&self, id: ObjectId) -> Option<TypeTag> {
        self.slots.get(&id).map(|slot| slot.object.type_tag())
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, id: ObjectId) -> Option<u32> {
        self.slots.get(&id).map(|slot| slot.refcount.get())
    }

    pub(crate) fn increment_refcount(&mut self, id: ObjectId) -> u32 {
        self.slot_mut(id).refcount.increment()
    }

    pub(crate) fn decrement_refcount(&mut self, id: ObjectId) -> u32 {
        self.slot_mut(id).refcount.decrement()
    }

    /// Removes an object whose refcount already reached zero.
    pub(crate) fn delete(&mut self, id: ObjectId) -> NativeObject {
        let refcount = self.slot_mut(id).refcount.get();
        assert!(
            refcount == 0,
            "object {id} destroyed while still referenced ({refcount} refs)"
        );
        self.destroyed += 1;
        match self.slots.remove(&id) {
            Some(slot) => slot.object,
            None => unreachable!("slot {id} vanished during delete"),
        }
    }

    /// Drops one reference and deletes the object when it was the last one.
    pub(crate) fn release(&mut self, id: ObjectId) -> Release {
        match self.decrement_refcount(id) {
            0 => Release::Destroyed(self.delete(id)),
            remaining => Release::Retained(remaining),
        }
    }

    pub(crate) fn timer(&self, id: ObjectId) -> Option<&Timer> {
        match self.slots.get(&id).map(|slot| &slot.object) {
            Some(NativeObject::Timer(timer)) => Some(timer),
            _ => None,
        }
    }

    pub(crate) fn timer_mut(&mut self, id: ObjectId) -> Option<&mut Timer> {
        match self.slots.get_mut(&id).map(|slot| &mut slot.object) {
            Some(NativeObject::Timer(timer)) => Some(timer),
            _ => None,
        }
    }

    pub(crate) fn drawable(&self, id: ObjectId) -> Option<&Drawable> {
        match self.slots.get(&id).map(|slot| &slot.object) {
            Some(NativeObject::Drawable(drawable)) => Some(drawable),
            _ => None,
        }
    }

    pub(crate) fn drawable_mut(&mut self, id: ObjectId) -> Option<&mut Drawable> {
        match self.slots.get_mut(&id).map(|slot| &mut slot.object) {
            Some(NativeObject::Drawable(drawable)) => Some(drawable),
            _ => None,
        }
    }

    fn slot_mut(&mut self, id: ObjectId) -> &mut Slot {
        match self.slots.get_mut(&id) {
            Some(slot) => slot,
            None => panic!("refcount access on destroyed object {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer_object() -> NativeObject {
        NativeObject::Timer(Timer::new(0, 100))
    }

    #[test]
    fn object_is_deleted_exactly_when_count_hits_zero() {
        let mut arena = ObjectArena::default();
        let id = arena.insert(timer_object());
        assert_eq!(arena.increment_refcount(id), 1);
        assert_eq!(arena.increment_refcount(id), 2);
        assert_eq!(arena.increment_refcount(id), 3);

        assert!(matches!(arena.release(id), Release::Retained(2)));
        assert_eq!(arena.increment_refcount(id), 3);
        assert!(matches!(arena.release(id), Release::Retained(2)));
        assert!(matches!(arena.release(id), Release::Retained(1)));
        assert!(arena.contains(id));
        assert_eq!(arena.destroyed_count(), 0);

        match arena.release(id) {
            Release::Destroyed(object) => assert_eq!(object.type_tag(), TypeTag::Timer),
            other => panic!("expected destruction, got {other:?}"),
        }
        assert!(!arena.contains(id));
        assert_eq!(arena.destroyed_count(), 1);
    }

    #[test]
    fn ids_are_never_reused() {
        let mut arena = ObjectArena::default();
        let first = arena.insert(timer_object());
        arena.increment_refcount(first);
        let _ = arena.release(first);
        let second = arena.insert(timer_object());
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn decrementing_past_zero_fails_fast() {
        let mut arena = ObjectArena::default();
        let id = arena.insert(timer_object());
        arena.decrement_refcount(id);
    }

    #[test]
    #[should_panic(expected = "still referenced")]
    fn deleting_a_referenced_object_fails_fast() {
        let mut arena = ObjectArena::default();
        let id = arena.insert(timer_object());
        arena.increment_refcount(id);
        arena.delete(id);
    }

    #[test]
    #[should_panic(expected = "destroyed object")]
    fn releasing_twice_fails_fast() {
        let mut arena = ObjectArena::default();
        let id = arena.insert(timer_object());
        arena.increment_refcount(id);
        let _ = arena.release(id);
        let _ = arena.release(id);
    }
}
