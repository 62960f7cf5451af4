//! Garbage-collected heap
//!
//! Non-moving mark-and-sweep over a slot registry. Every allocation is
//! registered before its handle escapes to mutator code, so any reachable
//! handle refers to a registered cell. Collection never runs inside an
//! opcode: the interpreter polls [`Heap::should_collect`] between
//! instructions and drives [`Heap::collect`] with a root-walker closure.
//!
//! The walk is iterative (explicit worklist), so arbitrary cycles through
//! arrays, maps, and instance fields are fine.

use crate::object::HeapObject;
use crate::value::{ObjRef, Value};

/// Initial collection threshold, in registry entries
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Collector statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Completed collections
    pub collections: usize,
    /// Total objects freed across all collections
    pub objects_freed: usize,
}

struct HeapEntry {
    marked: bool,
    object: HeapObject,
}

/// The heap-object registry and collector
pub struct Heap {
    slots: Vec<Option<HeapEntry>>,
    free: Vec<u32>,
    live: usize,
    threshold: usize,
    initial_threshold: usize,
    stats: GcStats,
}

impl Heap {
    /// Create a heap with the default threshold
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    /// Create a heap that triggers collection above `threshold` live entries
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            threshold,
            initial_threshold: threshold,
            stats: GcStats::default(),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Register `object` and return its handle.
    ///
    /// The object is in the registry before the handle is returned, so it is
    /// visible to the next collection no matter where the handle ends up.
    pub fn alloc(&mut self, object: HeapObject) -> ObjRef {
        self.live += 1;
        let entry = HeapEntry {
            marked: false,
            object,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(entry);
                ObjRef::new(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(entry));
                ObjRef::new(index)
            }
        }
    }

    /// Allocate a String object
    pub fn alloc_string(&mut self, text: impl Into<String>) -> ObjRef {
        self.alloc(HeapObject::Str(text.into()))
    }

    /// Allocate an empty Array
    pub fn alloc_array(&mut self) -> ObjRef {
        self.alloc(HeapObject::Array(Vec::new()))
    }

    /// Allocate an empty Map
    pub fn alloc_map(&mut self) -> ObjRef {
        self.alloc(HeapObject::Map(Default::default()))
    }

    /// Allocate an Instance tagged with `class_name`
    pub fn alloc_instance(&mut self, class_name: impl Into<String>) -> ObjRef {
        self.alloc(HeapObject::Instance {
            class_name: class_name.into(),
            fields: Default::default(),
        })
    }

    /// Allocate a first-class function handle
    pub fn alloc_function(&mut self, index: u32) -> ObjRef {
        self.alloc(HeapObject::Function(index))
    }

    /// Allocate a bound method pairing `receiver` with a function index
    pub fn alloc_bound_method(&mut self, receiver: Value, method: u32) -> ObjRef {
        self.alloc(HeapObject::BoundMethod { receiver, method })
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Borrow the object behind a handle
    pub fn get(&self, handle: ObjRef) -> Option<&HeapObject> {
        self.slots
            .get(handle.index() as usize)?
            .as_ref()
            .map(|entry| &entry.object)
    }

    /// Mutably borrow the object behind a handle
    pub fn get_mut(&mut self, handle: ObjRef) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(handle.index() as usize)?
            .as_mut()
            .map(|entry| &mut entry.object)
    }

    /// Check whether a handle refers to a registered cell
    pub fn contains(&self, handle: ObjRef) -> bool {
        self.get(handle).is_some()
    }

    /// String payload behind a value, when it is a heap String
    pub fn str_value(&self, value: Value) -> Option<&str> {
        match value {
            Value::Object(r) => self.get(r)?.as_str(),
            _ => None,
        }
    }

    /// Display string of any value.
    ///
    /// This is the canonical textual form: it keys maps and feeds the
    /// string opcodes, so it must stay stable.
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Object(r) => match self.get(r) {
                Some(object) => object.display(),
                None => format!("<dangling@{}>", r.index()),
            },
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Live registry entries
    pub fn live(&self) -> usize {
        self.live
    }

    /// Current collection threshold
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Replace the collection threshold
    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold;
        self.initial_threshold = threshold;
    }

    /// Whether the mutator should trigger a collection before the next opcode
    pub fn should_collect(&self) -> bool {
        self.live > self.threshold
    }

    /// Collector statistics
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Run a full mark-and-sweep collection.
    ///
    /// `roots` is the mutator's root walker: it must invoke the supplied
    /// callback for every root value (operand stack, globals, constant
    /// pool). Returns the number of objects freed.
    pub fn collect<F>(&mut self, roots: F) -> usize
    where
        F: FnOnce(&mut dyn FnMut(Value)),
    {
        // Clear mark bits
        for entry in self.slots.iter_mut().flatten() {
            entry.marked = false;
        }

        // Gather roots
        let mut worklist: Vec<u32> = Vec::new();
        roots(&mut |value| {
            if let Value::Object(r) = value {
                worklist.push(r.index());
            }
        });

        // Trace
        while let Some(index) = worklist.pop() {
            let entry = match self.slots.get_mut(index as usize).and_then(Option::as_mut) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            entry.object.children(&mut |child| {
                if let Value::Object(r) = child {
                    worklist.push(r.index());
                }
            });
        }

        // Sweep
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Some(entry) if !entry.marked) {
                *slot = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.live -= freed;

        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.threshold = (self.live * 2).max(self.initial_threshold);

        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_registers_immediately() {
        let mut heap = Heap::new();
        let r = heap.alloc_string("hello");
        assert!(heap.contains(r));
        assert_eq!(heap.live(), 1);
        assert_eq!(heap.str_value(Value::Object(r)), Some("hello"));
    }

    #[test]
    fn test_alloc_never_collects() {
        // Collection runs only when the mutator polls, never inside alloc.
        let mut heap = Heap::with_threshold(1);
        for _ in 0..16 {
            heap.alloc_string("x");
        }
        assert_eq!(heap.live(), 16);
        assert_eq!(heap.stats().collections, 0);
        assert!(heap.should_collect());
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let keep = heap.alloc_string("keep");
        let _drop = heap.alloc_string("drop");

        let freed = heap.collect(|mark| mark(Value::Object(keep)));
        assert_eq!(freed, 1);
        assert_eq!(heap.live(), 1);
        assert!(heap.contains(keep));
        assert_eq!(heap.stats().collections, 1);
        assert_eq!(heap.stats().objects_freed, 1);
    }

    #[test]
    fn test_collect_traces_children() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string("inner");
        let array = heap.alloc_array();
        heap.get_mut(array)
            .unwrap()
            .as_array_mut()
            .unwrap()
            .push(Value::Object(inner));

        let freed = heap.collect(|mark| mark(Value::Object(array)));
        assert_eq!(freed, 0);
        assert!(heap.contains(inner));
    }

    #[test]
    fn test_collect_tolerates_cycles() {
        let mut heap = Heap::new();
        let a = heap.alloc_instance("Node");
        let b = heap.alloc_instance("Node");
        if let HeapObject::Instance { fields, .. } = heap.get_mut(a).unwrap() {
            fields.insert("next".into(), Value::Object(b));
        }
        if let HeapObject::Instance { fields, .. } = heap.get_mut(b).unwrap() {
            fields.insert("next".into(), Value::Object(a));
        }

        // Reachable cycle survives
        assert_eq!(heap.collect(|mark| mark(Value::Object(a))), 0);
        assert_eq!(heap.live(), 2);

        // Unreachable cycle is freed in full
        assert_eq!(heap.collect(|_mark| {}), 2);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn test_bound_method_keeps_receiver_alive() {
        let mut heap = Heap::new();
        let receiver = heap.alloc_instance("Widget");
        let bound = heap.alloc_bound_method(Value::Object(receiver), 4);

        heap.collect(|mark| mark(Value::Object(bound)));
        assert!(heap.contains(receiver));
        assert!(heap.contains(bound));
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = Heap::new();
        let dead = heap.alloc_string("dead");
        heap.collect(|_mark| {});
        assert!(!heap.contains(dead));

        // Freed slot is recycled for the next allocation
        let recycled = heap.alloc_string("new");
        assert_eq!(recycled.index(), dead.index());
        assert_eq!(heap.live(), 1);
    }

    #[test]
    fn test_threshold_regrowth() {
        let mut heap = Heap::with_threshold(4);
        let keep: Vec<_> = (0..8).map(|i| heap.alloc_string(i.to_string())).collect();
        heap.collect(|mark| {
            for r in &keep {
                mark(Value::Object(*r));
            }
        });
        // All eight survive, so the threshold doubles past them
        assert_eq!(heap.live(), 8);
        assert_eq!(heap.threshold(), 16);

        // With everything dead, the threshold falls back to the initial value
        heap.collect(|_mark| {});
        assert_eq!(heap.threshold(), 4);
    }

    #[test]
    fn test_display_forms() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("text");
        let inst = heap.alloc_instance("Thing");
        let f = heap.alloc_function(2);
        assert_eq!(heap.display(Value::Nil), "nil");
        assert_eq!(heap.display(Value::Bool(true)), "true");
        assert_eq!(heap.display(Value::Int(-3)), "-3");
        assert_eq!(heap.display(Value::Float(2.5)), "2.5");
        assert_eq!(heap.display(Value::Object(s)), "text");
        assert_eq!(heap.display(Value::Object(inst)), "<object:Thing>");
        assert_eq!(heap.display(Value::Object(f)), "<function@2>");
    }
}
