//! The object heap
//!
//! Owns every runtime object through one intrusive singly-linked list, the
//! collector's enumeration root. Also owns the two process-wide tables the
//! collector must see (interned strings, weakly; globals, strongly) and the
//! allocation accounting that decides when a collection runs.
//!
//! Allocation is the GC's only safe-point. A caller holding a fresh object
//! in a plain local across another allocation must root it first, either on
//! the VM value stack or on the `protect` stack here (push, work, pop).

use crate::gc::{self, Roots};
use crate::object::{Obj, ObjBody, ObjRef, StringObj};
use crate::table::{Table, hash_bytes};
use crate::Value;
use std::ptr::NonNull;
use tracing::trace;

/// First collection once a megabyte of objects is live.
const FIRST_GC_AT: usize = 1024 * 1024;

pub struct Heap {
    pub(crate) objects: Option<ObjRef>,
    /// Interned strings, keyed by content. Weak: the collector deletes
    /// entries whose key is otherwise unreachable.
    pub strings: Table,
    /// Global variable bindings. Lives here rather than in the VM so that
    /// collections triggered during compilation still see it as a root.
    pub globals: Table,
    /// Explicit temporary roots for the push-then-work-then-pop idiom.
    pub protect: Vec<Value>,
    pub(crate) gray: Vec<ObjRef>,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    /// The interned "init" string, cached for initializer dispatch.
    pub init_string: Option<ObjRef>,
}

impl Heap {
    pub fn new() -> Heap {
        let mut heap = Heap {
            objects: None,
            strings: Table::new(),
            globals: Table::new(),
            protect: Vec::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
            init_string: None,
        };
        let init = heap.intern(b"init", Roots::default());
        heap.init_string = Some(init);
        heap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Live objects on the heap (walks the object list).
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.objects;
        while let Some(obj) = current {
            count += 1;
            current = obj.next;
        }
        count
    }

    #[cfg(feature = "gc-stress")]
    pub fn should_collect(&self) -> bool {
        true
    }

    #[cfg(not(feature = "gc-stress"))]
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Allocates a new object, collecting first when the accounting (or
    /// stress mode) says so. `roots` is whatever the caller holds beyond
    /// this heap's own roots; the compiler passes none, the VM passes its
    /// stack, frames, and open upvalues.
    pub fn allocate(&mut self, body: ObjBody, roots: Roots<'_>) -> ObjRef {
        if self.should_collect() {
            gc::collect(self, roots);
        }
        self.allocate_raw(body)
    }

    /// Allocation without the trigger check, for callers that already
    /// collected this round.
    pub fn allocate_raw(&mut self, body: ObjBody) -> ObjRef {
        let size = object_size(&body);
        self.bytes_allocated += size;
        let boxed = Box::new(Obj { next: self.objects, marked: false, body });
        let obj = ObjRef::new(unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) });
        self.objects = Some(obj);
        trace!(target: "lox_gc", "{:p} allocate {} bytes for {}", obj.as_ptr(), size, obj.type_name());
        obj
    }

    /// Returns the canonical object for these bytes, allocating and
    /// registering it on first sight. Two interned strings with equal
    /// content are the same object.
    pub fn intern(&mut self, bytes: &[u8], roots: Roots<'_>) -> ObjRef {
        let hash = hash_bytes(bytes);
        if let Some(existing) = self.strings.find_string(hash, bytes, b"") {
            return existing;
        }
        let string = self.allocate(
            ObjBody::String(StringObj { bytes: bytes.into(), hash }),
            roots,
        );
        self.strings.set(string, Value::NIL);
        string
    }

    /// Interning for a concatenation. No trigger check: the VM collects
    /// with its own roots before calling, while both operands are still on
    /// its stack.
    pub fn intern_concat_raw(&mut self, first: &[u8], second: &[u8]) -> ObjRef {
        let mut buffer = Vec::with_capacity(first.len() + second.len());
        buffer.extend_from_slice(first);
        buffer.extend_from_slice(second);
        let hash = hash_bytes(&buffer);
        if let Some(existing) = self.strings.find_string(hash, first, second) {
            return existing;
        }
        let string =
            self.allocate_raw(ObjBody::String(StringObj { bytes: buffer.into_boxed_slice(), hash }));
        self.strings.set(string, Value::NIL);
        string
    }

    pub(crate) fn free(&mut self, obj: ObjRef) {
        let size = object_size(&obj.body);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        trace!(target: "lox_gc", "{:p} free {} bytes ({})", obj.as_ptr(), size, obj.type_name());
        // Safety: only the sweep phase and teardown call this, and only for
        // objects just unlinked from the list; no root can still reach them.
        unsafe { drop(Box::from_raw(obj.as_ptr())) };
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects.take();
        while let Some(obj) = current {
            current = obj.next;
            self.free(obj);
        }
    }
}

// Accounting estimate: the header plus the payload buffers that are fixed at
// allocation time. Embedded tables and chunks grow through the host
// allocator, which is not a GC safe-point, so they stay out of the ledger;
// the trigger policy only needs monotone growth.
fn object_size(body: &ObjBody) -> usize {
    let payload = match body {
        ObjBody::String(s) => s.bytes.len(),
        ObjBody::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
        _ => 0,
    };
    std::mem::size_of::<Obj>() + payload
}
