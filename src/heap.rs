use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::object::Object;

/// Handle to a heap object: a slot index plus the generation of the slot at
/// allocation time, so a handle to a freed and reused slot is detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    object: Option<Object>,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Live objects per kind ("str", "class", ...), in name order.
    pub objects_by_kind: BTreeMap<&'static str, usize>,
    pub interned_strings: usize,
    pub collections: usize,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    live: usize,
    strings: HashMap<Rc<str>, ObjRef>,
    next_gc: usize,
    growth_factor: usize,
    collections: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new(1024, 2)
    }
}

impl Heap {
    pub fn new(initial_threshold: usize, growth_factor: usize) -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            strings: HashMap::new(),
            next_gc: initial_threshold.max(1),
            growth_factor: growth_factor.max(1),
            collections: 0,
        }
    }

    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.object = Some(object);
            return ObjRef { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, object: Some(object) });
        ObjRef { index, generation: 0 }
    }

    /// The interned string object for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(&r) = self.strings.get(text) {
            return r;
        }
        let text: Rc<str> = Rc::from(text);
        let r = self.alloc(Object::Str(text.clone()));
        self.strings.insert(text, r);
        r
    }

    pub fn try_get(&self, r: ObjRef) -> Option<&Object> {
        let slot = self.slots.get(r.index())?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        match self.try_get(r) {
            Some(object) => object,
            None => panic!("stale object handle {r:?}"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match self.slots.get_mut(r.index()) {
            Some(Slot { generation, object: Some(object) }) if *generation == r.generation => object,
            _ => panic!("stale object handle {r:?}"),
        }
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    pub fn should_collect(&self) -> bool {
        self.live >= self.next_gc
    }

    pub fn next_threshold(&self) -> usize {
        self.next_gc
    }

    /// Mark everything reachable from `roots`, free the rest, and return the
    /// number of objects freed. Interned strings are weak: an unreachable
    /// string leaves the intern table with its object.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> usize {
        let mut marked = vec![false; self.slots.len()];
        let mut work: Vec<ObjRef> = roots.into_iter().collect();

        while let Some(r) = work.pop() {
            let index = r.index();
            if index >= marked.len() || marked[index] {
                continue;
            }
            if let Some(object) = self.try_get(r) {
                marked[index] = true;
                object.trace(&mut work);
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if marked[index] {
                continue;
            }
            if let Some(object) = slot.object.take() {
                if let Object::Str(text) = &object {
                    self.strings.remove(text);
                }
                self.free_list.push(index as u32);
                freed += 1;
            }
        }

        self.live -= freed;
        self.collections += 1;
        self.next_gc = (self.live * self.growth_factor).max(self.next_gc);
        freed
    }

    pub fn stats(&self) -> HeapStats {
        let mut objects_by_kind = BTreeMap::new();
        for object in self.slots.iter().filter_map(|slot| slot.object.as_ref()) {
            *objects_by_kind.entry(object.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects: self.live,
            free_slots: self.free_list.len(),
            total_slots: self.slots.len(),
            objects_by_kind,
            interned_strings: self.strings.len(),
            collections: self.collections,
        }
    }
}
