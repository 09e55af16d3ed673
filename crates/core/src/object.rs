//! Heap object model
//!
//! Every runtime object lives behind an `ObjRef`, a raw non-owning handle
//! into the heap. Objects carry a mark bit and an intrusive `next` link; the
//! heap's object list is the collector's sole enumeration root, and the
//! sweep phase is the only code that ever frees one.
//!
//! `ObjRef` dereferences through a raw pointer. That is not expressible as a
//! safe borrow, but it is correct in context: the VM is single-threaded, the
//! collector only runs at allocation points, and an object is never freed
//! while any root can still reach it.

use crate::Value;
use crate::chunk::Chunk;
use crate::table::Table;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Host function signature: argument slice in, result value out.
pub type NativeFn = fn(&[Value]) -> Value;

/// Non-owning handle to a heap object, valid for the object's GC-managed
/// lifetime. Copy and pointer-compared; string interning makes pointer
/// equality the same as content equality for strings.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(NonNull<Obj>);

impl ObjRef {
    pub(crate) fn new(ptr: NonNull<Obj>) -> ObjRef {
        ObjRef(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut Obj {
        self.0.as_ptr()
    }

    pub(crate) fn into_bits(self) -> u64 {
        self.0.as_ptr() as u64
    }

    /// # Safety
    /// `bits` must be a pointer previously produced by `into_bits` for an
    /// object that is still alive.
    pub(crate) unsafe fn from_bits(bits: u64) -> ObjRef {
        ObjRef(unsafe { NonNull::new_unchecked(bits as *mut Obj) })
    }

    /// Borrow the object for a caller-chosen lifetime, detached from this
    /// handle. Used where a borrow must outlive the handle temporary, e.g.
    /// the compiler holding its in-flight function's chunk open.
    ///
    /// # Safety
    /// The object must stay rooted for all of `'a`, and the caller must not
    /// create an aliasing mutable borrow during `'a`.
    pub unsafe fn resolve<'a>(self) -> &'a Obj {
        unsafe { &*self.0.as_ptr() }
    }

    /// Mutable counterpart of [`ObjRef::resolve`].
    ///
    /// # Safety
    /// As for `resolve`, plus exclusivity: no other borrow of this object
    /// may exist during `'a`.
    pub unsafe fn resolve_mut<'a>(self) -> &'a mut Obj {
        unsafe { &mut *self.0.as_ptr() }
    }
}

impl Deref for ObjRef {
    type Target = Obj;

    fn deref(&self) -> &Obj {
        unsafe { self.0.as_ref() }
    }
}

impl DerefMut for ObjRef {
    fn deref_mut(&mut self) -> &mut Obj {
        unsafe { self.0.as_mut() }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p} {})", self.0.as_ptr(), self.type_name())
    }
}

/// Object header plus payload. The header fields belong to the heap and the
/// collector; everything else goes through `body`.
pub struct Obj {
    pub(crate) next: Option<ObjRef>,
    pub(crate) marked: bool,
    pub body: ObjBody,
}

pub enum ObjBody {
    String(StringObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
}

/// Immutable interned byte string. Not required to be UTF-8; display is
/// lossy for non-UTF-8 content.
pub struct StringObj {
    pub bytes: Box<[u8]>,
    pub hash: u32,
}

impl StringObj {
    pub fn lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// A compiled function: its code lives in the embedded chunk. The runtime
/// callable is always a Closure wrapping one of these.
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Box<[ObjRef]>,
}

/// Where an upvalue currently reads from: a live stack slot, or its own
/// `closed` field once the slot has been hoisted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpvalueLocation {
    Stack(usize),
    Closed,
}

pub struct UpvalueObj {
    pub location: UpvalueLocation,
    pub closed: Value,
    /// Open-list link, sorted by descending stack slot.
    pub next: Option<ObjRef>,
}

pub struct NativeObj {
    pub function: NativeFn,
}

pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table,
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table,
}

/// A method read off an instance as a property: the receiver travels with
/// the closure so a later call binds `this` correctly.
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self.body {
            ObjBody::String(_) => "string",
            ObjBody::Function(_) => "function",
            ObjBody::Closure(_) => "closure",
            ObjBody::Upvalue(_) => "upvalue",
            ObjBody::Native(_) => "native",
            ObjBody::Class(_) => "class",
            ObjBody::Instance(_) => "instance",
            ObjBody::BoundMethod(_) => "bound method",
        }
    }

    pub fn as_string(&self) -> &StringObj {
        match &self.body {
            ObjBody::String(s) => s,
            _ => panic!("object is not a string"),
        }
    }

    pub fn as_function(&self) -> &FunctionObj {
        match &self.body {
            ObjBody::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn as_function_mut(&mut self) -> &mut FunctionObj {
        match &mut self.body {
            ObjBody::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn as_closure(&self) -> &ClosureObj {
        match &self.body {
            ObjBody::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn as_upvalue(&self) -> &UpvalueObj {
        match &self.body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut UpvalueObj {
        match &mut self.body {
            ObjBody::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn as_native(&self) -> &NativeObj {
        match &self.body {
            ObjBody::Native(n) => n,
            _ => panic!("object is not a native"),
        }
    }

    pub fn as_class(&self) -> &ClassObj {
        match &self.body {
            ObjBody::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn as_class_mut(&mut self) -> &mut ClassObj {
        match &mut self.body {
            ObjBody::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn as_instance(&self) -> &InstanceObj {
        match &self.body {
            ObjBody::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn as_instance_mut(&mut self) -> &mut InstanceObj {
        match &mut self.body {
            ObjBody::Instance(i) => i,
            _ => panic!("object is not an instance"),
        }
    }

    pub fn as_bound_method(&self) -> &BoundMethodObj {
        match &self.body {
            ObjBody::BoundMethod(b) => b,
            _ => panic!("object is not a bound method"),
        }
    }
}

fn write_function(function: &FunctionObj, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {}>", name.as_string().lossy()),
        None => f.write_str("<script>"),
    }
}

pub(crate) fn write_object(obj: ObjRef, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &obj.body {
        ObjBody::String(s) => write!(f, "{}", s.lossy()),
        ObjBody::Function(function) => write_function(function, f),
        ObjBody::Closure(closure) => write_function(closure.function.as_function(), f),
        ObjBody::Upvalue(_) => f.write_str("upvalue"),
        ObjBody::Native(_) => f.write_str("<native fn>"),
        ObjBody::Class(class) => write!(f, "{}", class.name.as_string().lossy()),
        ObjBody::Instance(instance) => {
            write!(f, "{} instance", instance.class.as_class().name.as_string().lossy())
        }
        ObjBody::BoundMethod(bound) => {
            write_function(bound.method.as_closure().function.as_function(), f)
        }
    }
}
