//! Lox core: the runtime substrate shared by the compiler and the VM
//!
//! Key design principles:
//! - Value: what the language talks about (nil, booleans, numbers, objects)
//! - Obj: heap objects in one intrusive list owned by the Heap
//! - Table: the sole map primitive, keyed by interned-string identity
//! - Heap + gc: allocation accounting and the tri-color collector

pub mod chunk;
pub mod disasm;
pub mod gc;
pub mod heap;
pub mod object;
pub mod table;

#[cfg(not(feature = "nanbox"))]
pub mod value;

#[cfg(feature = "nanbox")]
pub mod nanbox;

#[cfg(not(feature = "nanbox"))]
pub use value::Value;

#[cfg(feature = "nanbox")]
pub use nanbox::Value;

pub use chunk::{Chunk, OpCode};
pub use gc::Roots;
pub use heap::Heap;
pub use object::{Obj, ObjBody, ObjRef};
pub use table::Table;

use std::fmt;

/// Which kind of failure an error-marker value carries.
///
/// These exist inside the value taxonomy so that hosts and tests can assert
/// error outcomes positively instead of matching on printed diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Compile => f.write_str("<compile error>"),
            ErrorKind::Runtime => f.write_str("<runtime error>"),
        }
    }
}
