//! Lox compiler library
//!
//! Compiles Lox source text straight to bytecode in one pass: the scanner
//! hands tokens to a Pratt parser that emits into the current function's
//! chunk as it goes. The entry point is [`compile`], which returns the
//! implicit top-level function, ready for the VM to wrap in a closure.
//!
//! ```rust,ignore
//! use lox_core::Heap;
//!
//! let mut heap = Heap::new();
//! let function = lox_compiler::compile("print 1 + 2;", &mut heap);
//! assert!(function.is_some());
//! ```

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Scanner, Token, TokenKind};
