//! Lox runtime: the stack-based virtual machine
//!
//! The [`Vm`] owns the whole runtime world: the heap (objects, interned
//! strings, globals), the value stack, the call frames, and the open-upvalue
//! list. Hosts drive it through two calls:
//!
//! ```rust,ignore
//! use lox_runtime::Vm;
//!
//! let mut vm = Vm::new();
//! let result = vm.interpret("return 1 + 2;");
//! assert!(result.is_number());
//! ```
//!
//! Compile failures and runtime failures come back as error-marker values
//! rather than host-language errors; diagnostics go to stderr as they occur.

pub mod natives;
pub mod vm;

pub use vm::{FRAMES_MAX, STACK_MAX, Vm};
