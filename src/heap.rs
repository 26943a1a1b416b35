// File: src/heap.rs
//
// Object heap and garbage collector for the Flax runtime.
// Objects live in an indexed arena and are referenced through ObjRef
// handles. Collection is precise mark-and-sweep: roots are the VM's stack,
// call frames, open upvalues, the globals table, the interner's "init"
// string, and any compiler-in-progress functions.

use crate::bytecode::Chunk;
use crate::debug::{self, DF_LOG_GC, DF_STRESS_GC};
use crate::object::{
    hash_string, NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance,
    ObjNative, ObjRef, ObjString, ObjUpvalue, UpvalueLocation,
};
use crate::table::Table;
use crate::value::{number_to_string, Value};
use crate::vm::CallFrame;

/// Initial allocation threshold before the first collection.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Arena slot: the object payload plus its GC header (mark bit and the
/// byte count charged when it was allocated).
struct Slot {
    marked: bool,
    size: usize,
    obj: Obj,
}

/// Transient roots the VM lends to the collector at each allocation site.
/// Compile-time allocations pass `GcRoots::NONE`; everything that can be
/// live during compilation (globals, interner, compiler chain) is owned by
/// the heap itself.
#[derive(Clone, Copy)]
pub struct GcRoots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    pub open_upvalues: Option<ObjRef>,
}

impl GcRoots<'_> {
    pub const NONE: GcRoots<'static> =
        GcRoots { stack: &[], frames: &[], open_upvalues: None };
}

/// Owner of every heap object, the string interner, and the global table.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Interner: maps string contents to the canonical object. Weak — the
    /// GC drops entries for strings that are otherwise unreachable.
    strings: Table,
    /// Global variable bindings. Owned here rather than by the VM so that
    /// collections triggered during compilation see them as roots.
    pub globals: Table,
    /// Canonical "init" string, looked up on every class instantiation.
    pub init_string: Option<ObjRef>,
    /// Gray worklist for the tracing phase. Plain system-allocated vector;
    /// the collector never allocates through itself.
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Functions currently being compiled, pushed by the compiler chain.
    compiler_roots: Vec<ObjRef>,
    /// Values pinned across an allocation by code that holds them only in
    /// Rust locals.
    temp_roots: Vec<Value>,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            globals: Table::new(),
            init_string: None,
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            compiler_roots: Vec::new(),
            temp_roots: Vec::new(),
        }
    }

    // ---- allocation -----------------------------------------------------

    fn alloc(&mut self, obj: Obj, roots: &GcRoots) -> ObjRef {
        if debug::enabled(DF_STRESS_GC) || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }

        let size = object_size(&obj);
        self.bytes_allocated += size;
        if debug::enabled(DF_LOG_GC) {
            eprintln!("gc: allocate {} bytes for {}", size, obj.kind_name());
        }

        let slot = Slot { marked: false, size, obj };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Interns a string by contents. Returns the canonical object if one
    /// exists, otherwise allocates and registers it.
    pub fn intern(&mut self, chars: &str, roots: &GcRoots) -> ObjRef {
        let hash = hash_string(chars);
        let found = self.strings.find_string(chars, hash, |r| {
            let s = string_of(&self.slots, r);
            (&*s.chars, s.hash)
        });
        if let Some(existing) = found {
            return existing;
        }

        let r = self.alloc(Obj::String(ObjString { chars: chars.into(), hash }), roots);
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// Interns an owned string, e.g. the result of concatenation. The
    /// buffer is dropped if an equal string is already interned.
    pub fn take_string(&mut self, chars: String, roots: &GcRoots) -> ObjRef {
        let hash = hash_string(&chars);
        let found = self.strings.find_string(&chars, hash, |r| {
            let s = string_of(&self.slots, r);
            (&*s.chars, s.hash)
        });
        if let Some(existing) = found {
            return existing;
        }

        let r = self.alloc(
            Obj::String(ObjString { chars: chars.into_boxed_str(), hash }),
            roots,
        );
        self.strings.set(r, hash, Value::Nil);
        r
    }

    /// A blank function shell for the compiler to fill in.
    pub fn new_function(&mut self, roots: &GcRoots) -> ObjRef {
        self.alloc(
            Obj::Function(ObjFunction {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name: None,
            }),
            roots,
        )
    }

    pub fn new_native(&mut self, function: NativeFn, roots: &GcRoots) -> ObjRef {
        self.alloc(Obj::Native(ObjNative { function }), roots)
    }

    pub fn new_closure(&mut self, function: ObjRef, roots: &GcRoots) -> ObjRef {
        let count = self.function(function).upvalue_count;
        self.alloc(
            Obj::Closure(ObjClosure { function, upvalues: Vec::with_capacity(count) }),
            roots,
        )
    }

    pub fn new_upvalue(&mut self, slot: usize, next: Option<ObjRef>, roots: &GcRoots) -> ObjRef {
        self.alloc(
            Obj::Upvalue(ObjUpvalue { location: UpvalueLocation::Open(slot), next }),
            roots,
        )
    }

    pub fn new_class(&mut self, name: ObjRef, roots: &GcRoots) -> ObjRef {
        self.alloc(Obj::Class(ObjClass { name, methods: Table::new() }), roots)
    }

    pub fn new_instance(&mut self, class: ObjRef, roots: &GcRoots) -> ObjRef {
        self.alloc(Obj::Instance(ObjInstance { class, fields: Table::new() }), roots)
    }

    pub fn new_bound_method(
        &mut self,
        receiver: Value,
        method: ObjRef,
        roots: &GcRoots,
    ) -> ObjRef {
        self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }), roots)
    }

    // ---- rooting helpers ------------------------------------------------

    pub fn push_temp(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp(&mut self) {
        self.temp_roots.pop();
    }

    pub fn push_compiler_root(&mut self, function: ObjRef) {
        self.compiler_roots.push(function);
    }

    pub fn pop_compiler_root(&mut self) {
        self.compiler_roots.pop();
    }

    // ---- accessors ------------------------------------------------------

    pub fn obj(&self, r: ObjRef) -> &Obj {
        &slot_of(&self.slots, r).obj
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        string_of(&self.slots, r)
    }

    pub fn str_slice(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match &slot_of(&self.slots, r).obj {
            Obj::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut ObjFunction {
        match &mut slot_of_mut(&mut self.slots, r).obj {
            Obj::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match &slot_of(&self.slots, r).obj {
            Obj::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match &mut slot_of_mut(&mut self.slots, r).obj {
            Obj::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match &slot_of(&self.slots, r).obj {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match &mut slot_of_mut(&mut self.slots, r).obj {
            Obj::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match &slot_of(&self.slots, r).obj {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match &mut slot_of_mut(&mut self.slots, r).obj {
            Obj::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match &slot_of(&self.slots, r).obj {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match &mut slot_of_mut(&mut self.slots, r).obj {
            Obj::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match &slot_of(&self.slots, r).obj {
            Obj::BoundMethod(b) => b,
            _ => panic!("object is not a bound method"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &ObjNative {
        match &slot_of(&self.slots, r).obj {
            Obj::Native(n) => n,
            _ => panic!("object is not a native function"),
        }
    }

    pub fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.obj(r), Obj::String(_))
    }

    pub fn is_class(&self, r: ObjRef) -> bool {
        matches!(self.obj(r), Obj::Class(_))
    }

    pub fn is_instance(&self, r: ObjRef) -> bool {
        matches!(self.obj(r), Obj::Instance(_))
    }

    /// Whether the handle currently names a live object. Test hook for GC
    /// behavior; real code never holds a handle across a collection that
    /// could free it.
    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.0 as usize)
            .map_or(false, |slot| slot.is_some())
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ---- printing -------------------------------------------------------

    /// Renders a value the way `print` shows it.
    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Obj(r) => self.object_to_string(r),
        }
    }

    fn object_to_string(&self, r: ObjRef) -> String {
        match self.obj(r) {
            Obj::String(s) => s.chars.to_string(),
            Obj::Function(_) => self.function_name(r),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => self.function_name(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Class(c) => self.str_slice(c.name).to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.str_slice(self.class(i.class).name))
            }
            Obj::BoundMethod(b) => self.function_name(self.closure(b.method).function),
        }
    }

    fn function_name(&self, function: ObjRef) -> String {
        match self.function(function).name {
            Some(name) => format!("<fn {}>", self.str_slice(name)),
            None => "<script>".to_string(),
        }
    }

    // ---- collection -----------------------------------------------------

    /// Runs a full mark-sweep cycle with the given transient roots.
    pub fn collect(&mut self, roots: &GcRoots) {
        let log = debug::enabled(DF_LOG_GC);
        let before = self.bytes_allocated;
        if log {
            eprintln!("-- gc begin");
        }

        self.mark_roots(roots);
        self.trace_references();
        // Interner entries are weak: drop the ones whose strings are about
        // to be swept, before the sweep frees them.
        self.strings.remove_unmarked(|r| {
            matches!(&self.slots[r.0 as usize], Some(slot) if slot.marked)
        });
        self.sweep(log);

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if log {
            eprintln!(
                "-- gc end: collected {} bytes (from {} to {}), next at {}",
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn mark_roots(&mut self, roots: &GcRoots) {
        for &value in roots.stack {
            self.mark_value(value);
        }
        for frame in roots.frames {
            self.mark_object(frame.closure);
        }

        let mut upvalue = roots.open_upvalues;
        while let Some(r) = upvalue {
            self.mark_object(r);
            upvalue = self.upvalue(r).next;
        }

        for index in 0..self.globals.capacity() {
            if let Some((key, value)) = self.globals.entry_at(index) {
                self.mark_object(key);
                self.mark_value(value);
            }
        }

        if let Some(init) = self.init_string {
            self.mark_object(init);
        }

        for index in 0..self.compiler_roots.len() {
            let r = self.compiler_roots[index];
            self.mark_object(r);
        }
        for index in 0..self.temp_roots.len() {
            let value = self.temp_roots[index];
            self.mark_value(value);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: ObjRef) {
        let slot = slot_of_mut(&mut self.slots, r);
        if slot.marked {
            return;
        }
        slot.marked = true;
        if debug::enabled(DF_LOG_GC) {
            eprintln!("gc: mark {}", slot.obj.kind_name());
        }
        self.gray.push(r);
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Marks everything an object references. Children are copied out
    /// first so marking never overlaps a borrow of the object itself.
    fn blacken(&mut self, r: ObjRef) {
        if debug::enabled(DF_LOG_GC) {
            eprintln!("gc: blacken {}", self.obj(r).kind_name());
        }

        let mut children: Vec<Value> = Vec::new();
        match &slot_of(&self.slots, r).obj {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Upvalue(u) => {
                if let UpvalueLocation::Closed(value) = u.location {
                    children.push(value);
                }
            }
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            Obj::Class(c) => {
                children.push(Value::Obj(c.name));
                for (key, _, value) in c.methods.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            Obj::Instance(i) => {
                children.push(Value::Obj(i.class));
                for (key, _, value) in i.fields.iter() {
                    children.push(Value::Obj(key));
                    children.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Obj(b.method));
            }
        }

        for value in children {
            self.mark_value(value);
        }
    }

    fn sweep(&mut self, log: bool) {
        for index in 0..self.slots.len() {
            let unmarked = matches!(&self.slots[index], Some(slot) if !slot.marked);
            if unmarked {
                if let Some(slot) = self.slots[index].take() {
                    if log {
                        eprintln!("gc: free {} ({} bytes)", slot.obj.kind_name(), slot.size);
                    }
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(slot.size);
                    self.free.push(index as u32);
                }
            } else if let Some(slot) = self.slots[index].as_mut() {
                slot.marked = false;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

fn slot_of<'a>(slots: &'a [Option<Slot>], r: ObjRef) -> &'a Slot {
    match slots.get(r.0 as usize) {
        Some(Some(slot)) => slot,
        _ => panic!("dangling object handle"),
    }
}

fn slot_of_mut<'a>(slots: &'a mut [Option<Slot>], r: ObjRef) -> &'a mut Slot {
    match slots.get_mut(r.0 as usize) {
        Some(Some(slot)) => slot,
        _ => panic!("dangling object handle"),
    }
}

fn string_of<'a>(slots: &'a [Option<Slot>], r: ObjRef) -> &'a ObjString {
    match &slot_of(slots, r).obj {
        Obj::String(s) => s,
        _ => panic!("object is not a string"),
    }
}

/// Approximate byte size charged against the GC pacing counters. Growth
/// that happens after allocation (chunk writes, table growth) is not
/// re-charged; the pacing only needs to be roughly proportional.
fn object_size(obj: &Obj) -> usize {
    use std::mem::size_of;
    let base = size_of::<Slot>();
    base + match obj {
        Obj::String(s) => s.chars.len(),
        Obj::Function(f) => {
            f.chunk.code.len() + f.chunk.lines.len() * 4
                + f.chunk.constants.len() * size_of::<Value>()
        }
        Obj::Native(_) => 0,
        Obj::Closure(c) => c.upvalues.capacity() * size_of::<ObjRef>(),
        Obj::Upvalue(_) => 0,
        Obj::Class(c) => c.methods.capacity() * 24,
        Obj::Instance(i) => i.fields.capacity() * 24,
        Obj::BoundMethod(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates_by_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello", &GcRoots::NONE);
        let b = heap.intern("hello", &GcRoots::NONE);
        let c = heap.intern("world", &GcRoots::NONE);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_slice(a), "hello");
    }

    #[test]
    fn test_take_string_reuses_interned() {
        let mut heap = Heap::new();
        let a = heap.intern("abc", &GcRoots::NONE);
        let b = heap.take_string(String::from("abc"), &GcRoots::NONE);
        assert_eq!(a, b);
    }

    #[test]
    fn test_collect_frees_unreachable_strings() {
        let mut heap = Heap::new();
        let garbage = heap.intern("garbage", &GcRoots::NONE);
        assert!(heap.is_live(garbage));

        heap.collect(&GcRoots::NONE);
        assert!(!heap.is_live(garbage));

        // The interner entry is gone too: re-interning builds a new object.
        let again = heap.intern("garbage", &GcRoots::NONE);
        assert!(heap.is_live(again));
    }

    #[test]
    fn test_collect_keeps_stack_roots() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept", &GcRoots::NONE);
        let stack = [Value::Obj(kept)];
        let roots = GcRoots { stack: &stack, frames: &[], open_upvalues: None };

        heap.collect(&roots);
        assert!(heap.is_live(kept));
        assert_eq!(heap.str_slice(kept), "kept");
    }

    #[test]
    fn test_collect_keeps_globals_and_their_values() {
        let mut heap = Heap::new();
        let name = heap.intern("answer", &GcRoots::NONE);
        let value = heap.intern("forty-two", &GcRoots::NONE);
        let hash = heap.string(name).hash;
        heap.globals.set(name, hash, Value::Obj(value));

        heap.collect(&GcRoots::NONE);
        assert!(heap.is_live(name));
        assert!(heap.is_live(value));
    }

    #[test]
    fn test_collect_traces_through_closures() {
        let mut heap = Heap::new();
        let function = heap.new_function(&GcRoots::NONE);
        let name = heap.intern("f", &GcRoots::NONE);
        heap.function_mut(function).name = Some(name);
        let closure = heap.new_closure(function, &GcRoots::NONE);

        let stack = [Value::Obj(closure)];
        let roots = GcRoots { stack: &stack, frames: &[], open_upvalues: None };
        heap.collect(&roots);

        assert!(heap.is_live(closure));
        assert!(heap.is_live(function));
        assert!(heap.is_live(name));
    }

    #[test]
    fn test_collect_traces_instances_and_classes() {
        let mut heap = Heap::new();
        let class_name = heap.intern("Point", &GcRoots::NONE);
        heap.push_temp(Value::Obj(class_name));
        let class = heap.new_class(class_name, &GcRoots::NONE);
        heap.push_temp(Value::Obj(class));
        let instance = heap.new_instance(class, &GcRoots::NONE);
        heap.pop_temp();
        heap.pop_temp();

        let field = heap.intern("x", &GcRoots::NONE);
        let hash = heap.string(field).hash;
        heap.instance_mut(instance).fields.set(field, hash, Value::Number(1.0));

        let stack = [Value::Obj(instance)];
        let roots = GcRoots { stack: &stack, frames: &[], open_upvalues: None };
        heap.collect(&roots);

        assert!(heap.is_live(instance));
        assert!(heap.is_live(class));
        assert!(heap.is_live(class_name));
        assert!(heap.is_live(field));
    }

    #[test]
    fn test_marked_objects_survive_and_marks_clear() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept", &GcRoots::NONE);
        let stack = [Value::Obj(kept)];
        let roots = GcRoots { stack: &stack, frames: &[], open_upvalues: None };

        // Two cycles in a row: marks from the first must not leak into the
        // second, or the second would keep garbage alive.
        heap.collect(&roots);
        let dropped = heap.intern("dropped", &GcRoots::NONE);
        heap.collect(&roots);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new();
        let garbage = heap.intern("garbage", &GcRoots::NONE);
        heap.collect(&GcRoots::NONE);
        let recycled = heap.intern("recycled", &GcRoots::NONE);
        // The freed arena slot is handed back out.
        assert_eq!(garbage.0, recycled.0);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_value_rendering() {
        let mut heap = Heap::new();
        let s = heap.intern("text", &GcRoots::NONE);
        assert_eq!(heap.value_to_string(Value::Nil), "nil");
        assert_eq!(heap.value_to_string(Value::Bool(true)), "true");
        assert_eq!(heap.value_to_string(Value::Number(2.5)), "2.5");
        assert_eq!(heap.value_to_string(Value::Obj(s)), "text");

        let f = heap.new_function(&GcRoots::NONE);
        assert_eq!(heap.value_to_string(Value::Obj(f)), "<script>");
        let name = heap.intern("blob", &GcRoots::NONE);
        heap.function_mut(f).name = Some(name);
        assert_eq!(heap.value_to_string(Value::Obj(f)), "<fn blob>");
    }
}
