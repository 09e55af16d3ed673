//! The virtual machine
//!
//! A fixed-size value stack, a fixed-size call frame array, and a tight
//! dispatch loop over the current frame's instruction pointer. Call frames
//! window the value stack: a frame's slot 0 holds its receiver (or the
//! callable itself), locals follow, temporaries grow above.
//!
//! Every allocation the VM performs is a potential collection, so anything
//! alive only in a host local across an allocation must be reachable from
//! the stack or the heap's protect stack first.

use crate::natives;
use lox_core::chunk::{Chunk, OpCode};
use lox_core::disasm;
use lox_core::gc;
use lox_core::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeFn, NativeObj, ObjBody,
    ObjRef, UpvalueLocation, UpvalueObj,
};
use lox_core::table::Table;
use lox_core::{Heap, Roots, Value};
use std::fmt::Write as _;
use tracing::trace;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// One function activation: the closure being run, its instruction pointer,
/// and the stack index where its slot window begins.
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    pub heap: Heap,
    stack: Box<[Value]>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<ObjRef>,
}

impl Vm {
    /// A fresh interpreter: "init" pre-interned, `clock` installed.
    pub fn new() -> Vm {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: vec![Value::NIL; STACK_MAX].into_boxed_slice(),
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
        };
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Registers a host function under a global name.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name.as_bytes(), Roots::default());
        // The name has no other root until the globals entry exists.
        self.heap.protect.push(Value::object(name));
        let native = self.heap.allocate(ObjBody::Native(NativeObj { function }), Roots::default());
        self.heap.globals.set(name, Value::object(native));
        self.heap.protect.pop();
    }

    /// Compiles and runs a source string. Returns the program's result
    /// value, or an error marker on compile or runtime failure.
    pub fn interpret(&mut self, source: &str) -> Value {
        let Some(function) = lox_compiler::compile(source, &mut self.heap) else {
            return Value::COMPILE_ERROR;
        };
        self.run_function(function)
    }

    /// Test hook: runs a caller-built chunk as the body of an anonymous
    /// top-level function.
    ///
    /// Heap objects referenced by the chunk's constants must stay rooted by
    /// the caller (e.g. on `heap.protect`) until this returns; wrapping the
    /// chunk allocates, and an allocation may collect.
    pub fn interpret_chunk(&mut self, chunk: Chunk) -> Value {
        let function = self.alloc(ObjBody::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk,
            name: None,
        }));
        self.run_function(function)
    }

    fn run_function(&mut self, function: ObjRef) -> Value {
        // The stack itself roots the function while the closure allocates.
        self.push(Value::object(function));
        let closure = self.alloc(ObjBody::Closure(ClosureObj { function, upvalues: Box::new([]) }));
        self.pop();
        self.push(Value::object(closure));
        if let Err(message) = self.call(closure, 0) {
            return self.runtime_error(message);
        }
        match self.run() {
            Ok(value) => value,
            Err(message) => self.runtime_error(message),
        }
    }

    // ---- stack ----------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack[self.stack_top] = value;
        self.stack_top += 1;
    }

    fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack_top - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack_top = 0;
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ---- frames and decoding --------------------------------------------

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch requires an active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("dispatch requires an active call frame")
    }

    fn chunk(&self) -> &Chunk {
        let function = self.frame().closure.as_closure().function;
        // Safety: the function is rooted through the frame's closure for as
        // long as the frame exists.
        &unsafe { function.resolve() }.as_function().chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.chunk().code[ip];
        self.frame_mut().ip = ip + 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frame().ip;
        let chunk = self.chunk();
        let value = u16::from_be_bytes([chunk.code[ip], chunk.code[ip + 1]]);
        self.frame_mut().ip = ip + 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.chunk().constants[index]
    }

    /// Reads a constant the compiler guarantees is an interned string.
    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj()
    }

    // ---- allocation and collection ---------------------------------------

    /// All runtime allocation funnels through here so the collector always
    /// sees the VM's roots.
    fn alloc(&mut self, body: ObjBody) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate_raw(body)
    }

    fn collect_garbage(&mut self) {
        let closures: Vec<ObjRef> = self.frames.iter().map(|frame| frame.closure).collect();
        gc::collect(
            &mut self.heap,
            Roots {
                stack: &self.stack[..self.stack_top],
                closures: &closures,
                open_upvalues: self.open_upvalues,
            },
        );
    }

    // ---- errors ----------------------------------------------------------

    /// Prints the message and a stack trace, resets the stacks, and yields
    /// the runtime-error marker the host observes.
    fn runtime_error(&mut self, message: String) -> Value {
        eprintln!("{}", message);
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_closure().function;
            let line = function.as_function().chunk.lines[frame.ip - 1];
            match function.as_function().name {
                Some(name) => eprintln!("[line {}] in {}()", line, name.as_string().lossy()),
                None => eprintln!("[line {}] in script", line),
            }
        }
        self.reset_stack();
        Value::RUNTIME_ERROR
    }

    // ---- dispatch --------------------------------------------------------

    fn run(&mut self) -> Result<Value, String> {
        loop {
            if tracing::enabled!(target: "lox_vm", tracing::Level::TRACE) {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = OpCode::try_from(byte)
                .map_err(|_| format!("unrecognized opcode: {}", byte))?;
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.heap.globals.set(name, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.heap.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(format!(
                                "Undefined variable '{}'.",
                                name.as_string().lossy()
                            ));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.heap.globals.set(name, value) {
                        // Assignment never implicitly declares.
                        self.heap.globals.delete(name);
                        return Err(format!(
                            "Undefined variable '{}'.",
                            name.as_string().lossy()
                        ));
                    }
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let index = self.frame().slots + slot;
                    self.stack[index] = self.peek(0);
                }

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frame().closure.as_closure().upvalues[slot];
                    let value = match upvalue.as_upvalue().location {
                        UpvalueLocation::Stack(index) => self.stack[index],
                        UpvalueLocation::Closed => upvalue.as_upvalue().closed,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let mut upvalue = self.frame().closure.as_closure().upvalues[slot];
                    match upvalue.as_upvalue().location {
                        UpvalueLocation::Stack(index) => self.stack[index] = value,
                        UpvalueLocation::Closed => upvalue.as_upvalue_mut().closed = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack_top - 1);
                    self.pop();
                }

                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    if !is_instance(receiver) {
                        return Err("Only instances have properties.".to_string());
                    }
                    let obj = receiver.as_obj();
                    if let Some(value) = obj.as_instance().fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = obj.as_instance().class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let target = self.peek(1);
                    if !is_instance(target) {
                        return Err("Only instances have fields.".to_string());
                    }
                    let mut obj = target.as_obj();
                    obj.as_instance_mut().fields.set(name, self.peek(0));
                    // Leave the assigned value as the expression result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(a == b));
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => self.binary_op(op)?,
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if a.is_string() && b.is_string() {
                        self.concatenate();
                    } else if a.is_number() && b.is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else {
                        return Err("Operands must be two numbers or two strings.".to_string());
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err("Operand must be a number.".to_string());
                    }
                    let value = self.pop().as_number();
                    self.push(Value::number(-value));
                }

                OpCode::Print => {
                    println!("{}", self.pop());
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // Peeks rather than pops; and/or rely on this.
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop().as_obj();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }

                OpCode::Closure => {
                    let function = self.read_constant().as_obj();
                    let upvalue_count = function.as_function().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().slots + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues.push(self.frame().closure.as_closure().upvalues[index]);
                        }
                    }
                    let closure = self.alloc(ObjBody::Closure(ClosureObj {
                        function,
                        upvalues: upvalues.into_boxed_slice(),
                    }));
                    self.push(Value::object(closure));
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("dispatch requires an active call frame");
                    self.close_upvalues(frame.slots);
                    self.stack_top = frame.slots;
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.push(result);
                }

                OpCode::Class => {
                    let name = self.read_string();
                    let class =
                        self.alloc(ObjBody::Class(ClassObj { name, methods: Table::new() }));
                    self.push(Value::object(class));
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let mut class = self.peek(1).as_obj();
                    class.as_class_mut().methods.set(name, method);
                    self.pop();
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_obj()
                        || !matches!(superclass.as_obj().body, ObjBody::Class(_))
                    {
                        return Err("Superclass must be a class.".to_string());
                    }
                    // Copy-down inheritance: the subclass starts from a
                    // snapshot of the superclass's method table.
                    let mut subclass = self.peek(0).as_obj();
                    let superclass = superclass.as_obj();
                    subclass.as_class_mut().methods.add_all(&superclass.as_class().methods);
                    self.pop();
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj();
                    self.bind_method(superclass, name)?;
                }
            }
        }
    }

    fn binary_op(&mut self, op: OpCode) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        let result = match op {
            OpCode::Greater => Value::bool(a > b),
            OpCode::Less => Value::bool(a < b),
            OpCode::Subtract => Value::number(a - b),
            OpCode::Multiply => Value::number(a * b),
            OpCode::Divide => Value::number(a / b),
            _ => unreachable!("binary_op dispatched on a non-binary opcode"),
        };
        self.push(result);
        Ok(())
    }

    // Operands stay on the stack until the result exists so a collection
    // triggered by the allocation cannot reclaim them.
    fn concatenate(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        let b = self.peek(0).as_obj();
        let a = self.peek(1).as_obj();
        let result = self.heap.intern_concat_raw(&a.as_string().bytes, &b.as_string().bytes);
        self.pop();
        self.pop();
        self.push(Value::object(result));
    }

    // ---- calls -----------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        if callee.is_obj() {
            let obj = callee.as_obj();
            match &obj.body {
                ObjBody::Closure(_) => return self.call(obj, arg_count),
                ObjBody::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack_top - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call(method, arg_count);
                }
                ObjBody::Class(_) => {
                    let class = obj;
                    let instance = self
                        .alloc(ObjBody::Instance(InstanceObj { class, fields: Table::new() }));
                    let slot = self.stack_top - arg_count - 1;
                    self.stack[slot] = Value::object(instance);
                    let init = self.heap.init_string.expect("\"init\" interned at startup");
                    if let Some(initializer) = class.as_class().methods.get(init) {
                        return self.call(initializer.as_obj(), arg_count);
                    }
                    if arg_count != 0 {
                        return Err(format!("Expected 0 arguments but got {}.", arg_count));
                    }
                    return Ok(());
                }
                ObjBody::Native(native) => {
                    let function = native.function;
                    let top = self.stack_top;
                    let result = function(&self.stack[top - arg_count..top]);
                    self.stack_top = top - arg_count - 1;
                    self.push(result);
                    return Ok(());
                }
                ObjBody::Function(_) => {
                    return Err(
                        "Encountered a raw function (should be wrapped in a closure).".to_string()
                    );
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    fn call(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), String> {
        let arity = closure.as_closure().function.as_function().arity as usize;
        if arg_count != arity {
            return Err(format!("Expected {} arguments but got {}.", arity, arg_count));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack_top - arg_count - 1,
        });
        Ok(())
    }

    /// `GET_PROPERTY + CALL` fused: fields that hold callables win over
    /// methods, and a plain method call skips the BoundMethod allocation.
    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), String> {
        let receiver = self.peek(arg_count);
        if !is_instance(receiver) {
            return Err("Only instances have methods.".to_string());
        }
        let obj = receiver.as_obj();
        if let Some(field) = obj.as_instance().fields.get(name) {
            let slot = self.stack_top - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }
        let class = obj.as_instance().class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), String> {
        let Some(method) = class.as_class().methods.get(name) else {
            return Err(format!("Undefined property '{}'.", name.as_string().lossy()));
        };
        self.call(method.as_obj(), arg_count)
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), String> {
        let Some(method) = class.as_class().methods.get(name) else {
            return Err(format!("Undefined property '{}'.", name.as_string().lossy()));
        };
        let bound = self.alloc(ObjBody::BoundMethod(BoundMethodObj {
            receiver: self.peek(0),
            method: method.as_obj(),
        }));
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    // ---- upvalues --------------------------------------------------------

    /// Finds the open upvalue for a stack slot, or inserts a new one at its
    /// sorted position so closures over the same binding share a capture.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            match upvalue.as_upvalue().location {
                UpvalueLocation::Stack(existing) if existing > slot => {
                    prev = Some(upvalue);
                    current = upvalue.as_upvalue().next;
                }
                UpvalueLocation::Stack(existing) if existing == slot => return upvalue,
                _ => break,
            }
        }

        let created = self.alloc(ObjBody::Upvalue(UpvalueObj {
            location: UpvalueLocation::Stack(slot),
            closed: Value::NIL,
            next: current,
        }));
        match prev {
            Some(mut prev) => prev.as_upvalue_mut().next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Hoists every open upvalue at or above `last` into its own storage.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(mut upvalue) = self.open_upvalues {
            let slot = match upvalue.as_upvalue().location {
                UpvalueLocation::Stack(slot) if slot >= last => slot,
                _ => break,
            };
            let value = self.stack[slot];
            let open = upvalue.as_upvalue_mut();
            open.closed = value;
            open.location = UpvalueLocation::Closed;
            self.open_upvalues = open.next;
        }
    }

    // ---- tracing ---------------------------------------------------------

    fn trace_instruction(&self) {
        let frame = self.frame();
        let function = frame.closure.as_closure().function;
        let mut line = String::new();
        disasm::disassemble_instruction(&function.as_function().chunk, frame.ip, &mut line);
        let mut stack_dump = String::new();
        for value in &self.stack[..self.stack_top] {
            let _ = write!(stack_dump, "[ {} ]", value);
        }
        trace!(target: "lox_vm", "{:<40} {}", line, stack_dump);
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

fn is_instance(value: Value) -> bool {
    value.is_obj() && matches!(value.as_obj().body, ObjBody::Instance(_))
}
