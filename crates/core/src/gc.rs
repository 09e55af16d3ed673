//! Tri-color mark-sweep collector
//!
//! White objects are unmarked; gray objects are marked but not yet scanned
//! (they sit on the worklist); black objects are marked with their children
//! scanned. One pass: mark roots, drain the worklist, drop weakly-held
//! interned strings, then sweep the object list, freeing everything still
//! white and resetting survivors to white for the next cycle.

use crate::Value;
use crate::heap::Heap;
use crate::object::{ObjBody, ObjRef};
use tracing::trace;

/// After a collection, the next one triggers at live-size times this.
const HEAP_GROW_FACTOR: usize = 2;

/// Roots a caller holds beyond the heap's own (globals, protect stack,
/// cached "init"). The compiler has none of these; the VM supplies its
/// value stack, the closure of every call frame, and the open-upvalue list.
#[derive(Default, Clone, Copy)]
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub closures: &'a [ObjRef],
    pub open_upvalues: Option<ObjRef>,
}

pub fn collect(heap: &mut Heap, roots: Roots<'_>) {
    let before = heap.bytes_allocated;
    trace!(target: "lox_gc", "-- gc begin, {} bytes live", before);

    let mut gray = std::mem::take(&mut heap.gray);
    gray.clear();

    // Mark roots.
    for &value in roots.stack {
        mark_value(&mut gray, value);
    }
    for &closure in roots.closures {
        mark_object(&mut gray, closure);
    }
    let mut upvalue = roots.open_upvalues;
    while let Some(open) = upvalue {
        mark_object(&mut gray, open);
        upvalue = open.as_upvalue().next;
    }
    for (key, value) in heap.globals.iter() {
        mark_object(&mut gray, key);
        mark_value(&mut gray, value);
    }
    for &value in &heap.protect {
        mark_value(&mut gray, value);
    }
    if let Some(init) = heap.init_string {
        mark_object(&mut gray, init);
    }

    // Trace: blacken until the worklist is dry.
    while let Some(obj) = gray.pop() {
        blacken(&mut gray, obj);
    }
    heap.gray = gray;

    // The intern table holds its strings weakly; entries whose key did not
    // get marked above are about to be swept, so they must go first.
    heap.strings.retain_keys(|key| key.marked);

    sweep(heap);

    heap.next_gc = heap.bytes_allocated * HEAP_GROW_FACTOR;
    trace!(
        target: "lox_gc",
        "-- gc end, collected {} bytes ({} -> {}), next at {}",
        before - heap.bytes_allocated,
        before,
        heap.bytes_allocated,
        heap.next_gc
    );
}

fn mark_value(gray: &mut Vec<ObjRef>, value: Value) {
    if value.is_obj() {
        mark_object(gray, value.as_obj());
    }
}

fn mark_object(gray: &mut Vec<ObjRef>, mut obj: ObjRef) {
    if obj.marked {
        return;
    }
    trace!(target: "lox_gc", "{:p} mark {}", obj.as_ptr(), obj.type_name());
    obj.marked = true;
    gray.push(obj);
}

fn blacken(gray: &mut Vec<ObjRef>, obj: ObjRef) {
    trace!(target: "lox_gc", "{:p} blacken {}", obj.as_ptr(), obj.type_name());
    match &obj.body {
        // No outgoing references.
        ObjBody::String(_) | ObjBody::Native(_) => {}
        ObjBody::Upvalue(upvalue) => mark_value(gray, upvalue.closed),
        ObjBody::Function(function) => {
            if let Some(name) = function.name {
                mark_object(gray, name);
            }
            for &constant in &function.chunk.constants {
                mark_value(gray, constant);
            }
        }
        ObjBody::Closure(closure) => {
            mark_object(gray, closure.function);
            for &upvalue in closure.upvalues.iter() {
                mark_object(gray, upvalue);
            }
        }
        ObjBody::Class(class) => {
            mark_object(gray, class.name);
            for (key, value) in class.methods.iter() {
                mark_object(gray, key);
                mark_value(gray, value);
            }
        }
        ObjBody::Instance(instance) => {
            mark_object(gray, instance.class);
            for (key, value) in instance.fields.iter() {
                mark_object(gray, key);
                mark_value(gray, value);
            }
        }
        ObjBody::BoundMethod(bound) => {
            mark_value(gray, bound.receiver);
            mark_object(gray, bound.method);
        }
    }
}

// Unlink and free every white object; survivors turn white again.
fn sweep(heap: &mut Heap) {
    let mut previous: Option<ObjRef> = None;
    let mut current = heap.objects;
    while let Some(mut obj) = current {
        if obj.marked {
            obj.marked = false;
            previous = Some(obj);
            current = obj.next;
        } else {
            current = obj.next;
            match previous {
                Some(mut prev) => prev.next = current,
                None => heap.objects = current,
            }
            heap.free(obj);
        }
    }
}
