//! Single-pass Pratt compiler
//!
//! Tokens go straight to bytecode; there is no tree. Each function being
//! compiled gets its own state (locals, upvalue descriptors, lexical depth)
//! linked to the enclosing one, so nested declarations emit into their own
//! chunks while the outer compilation stays suspended. In-flight functions
//! are rooted on the heap's protect stack, which keeps them and everything
//! hanging off their constant arrays alive across any collection a
//! compile-time allocation triggers.
//!
//! On a syntax error the parser goes into panic mode, swallowing
//! diagnostics until the next statement boundary, then keeps going so one
//! run can report several independent errors. The compile still fails.

use crate::scanner::{Scanner, Token, TokenKind};
use lox_core::chunk::{Chunk, OpCode};
use lox_core::disasm;
use lox_core::object::{FunctionObj, ObjBody, ObjRef};
use lox_core::{Heap, Roots, Value};
use tracing::trace;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compiles a source string into the implicit top-level function, or `None`
/// if any compile error was reported.
pub fn compile(source: &str, heap: &mut Heap) -> Option<ObjRef> {
    let function = heap.allocate(
        ObjBody::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }),
        Roots::default(),
    );
    heap.protect.push(Value::object(function));

    let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut parser = Parser {
        scanner: Scanner::new(source),
        heap,
        compiler: FnCompiler::new(function, FunctionKind::Script),
        class_compiler: None,
        current: placeholder,
        previous: placeholder,
        had_error: false,
        panic_mode: false,
    };

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    let function = parser.end_compiler();
    let had_error = parser.had_error;

    heap.protect.pop();
    if had_error { None } else { Some(function) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Infix binding power for a token, `None` for tokens with no infix rule.
fn precedence_of(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::And => Precedence::And,
        TokenKind::Or => Precedence::Or,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Lexical depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. `enclosing` links parent-to-child so nested
/// functions suspend the outer compilation.
struct FnCompiler<'src> {
    enclosing: Option<Box<FnCompiler<'src>>>,
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

impl<'src> FnCompiler<'src> {
    fn new(function: ObjRef, kind: FunctionKind) -> Box<FnCompiler<'src>> {
        // Slot 0 is reserved: it binds `this` in method bodies and is an
        // anonymous stand-in for the function itself otherwise.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        Box::new(FnCompiler {
            enclosing: None,
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        })
    }

    /// Innermost-first scan of this function's locals. The flag reports
    /// whether the local has finished its initializer.
    fn resolve_local(&self, name: &str) -> Option<(u8, bool)> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((slot as u8, local.depth != -1));
            }
        }
        None
    }

    /// Walks the enclosing chain: a match in the parent's locals becomes a
    /// captured local; a match further out threads a forwarding upvalue
    /// through every level in between.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some((slot, initialized)) = enclosing.resolve_local(name) {
            if !initialized {
                return Err("Can't read local variable in its own initializer.");
            }
            enclosing.locals[slot as usize].is_captured = true;
            return self.add_upvalue(slot, true).map(Some);
        }
        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (slot, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(slot as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(CompilerUpvalue { index, is_local });
        let count = self.upvalues.len();
        // Safety: the in-flight function is protect-rooted and only this
        // compiler touches it.
        unsafe { self.function.resolve_mut() }.as_function_mut().upvalue_count = count;
        Ok((count - 1) as u8)
    }
}

struct ClassState {
    enclosing: Option<Box<ClassState>>,
    has_superclass: bool,
}

struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    compiler: Box<FnCompiler<'src>>,
    class_compiler: Option<Box<ClassState>>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Parser<'src, '_> {
    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
        self.had_error = true;
    }

    /// Skip to a statement boundary, then start diagnosing again.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission -------------------------------------------------------

    fn function_mut(&mut self) -> &mut FunctionObj {
        // Safety: the in-flight function is protect-rooted; the parser is
        // the only writer during compilation.
        unsafe { self.compiler.function.resolve_mut() }.as_function_mut()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.function_mut().chunk
    }

    fn chunk_len(&self) -> usize {
        let function = self.compiler.function;
        function.as_function().chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.compiler.kind == FunctionKind::Initializer {
            // An initializer implicitly returns its instance.
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk_mut().add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_ops(OpCode::Constant, index);
    }

    /// Emits a forward jump with a placeholder 16-bit offset; returns the
    /// offset of the placeholder for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over for a 16-bit jump.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large for a 16-bit jump.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ---- compiler stack -------------------------------------------------

    fn push_compiler(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme.as_bytes(), Roots::default());
        // Keep the name alive until the function that references it exists.
        self.heap.protect.push(Value::object(name));
        let function = self.heap.allocate(
            ObjBody::Function(FunctionObj {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name: Some(name),
            }),
            Roots::default(),
        );
        self.heap.protect.pop();
        self.heap.protect.push(Value::object(function));

        let enclosing = std::mem::replace(&mut self.compiler, FnCompiler::new(function, kind));
        self.compiler.enclosing = Some(enclosing);
    }

    /// Seals the current function and restores the enclosing compiler.
    fn end_compiler(&mut self) -> ObjRef {
        self.emit_return();
        let function = self.compiler.function;
        if !self.had_error {
            let label = match function.as_function().name {
                Some(name) => name.as_string().lossy().into_owned(),
                None => "<script>".to_string(),
            };
            trace!(
                target: "lox_compiler",
                "\n{}",
                disasm::disassemble_chunk(&function.as_function().chunk, &label)
            );
        }
        if let Some(enclosing) = self.compiler.enclosing.take() {
            self.compiler = enclosing;
        }
        function
    }

    // ---- scopes and variables -------------------------------------------

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        loop {
            let Some(local) = self.compiler.locals.last() else { break };
            if local.depth <= self.compiler.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.compiler.locals.pop();
        }
    }

    fn identifier_constant(&mut self, name: Token<'src>) -> u8 {
        let string = self.heap.intern(name.lexeme.as_bytes(), Roots::default());
        self.make_constant(Value::object(string))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        // Globals are late-bound; only locals are declared.
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let mut duplicate = false;
        for local in self.compiler.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.compiler.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    /// Resolution order: own locals, then the enclosing chain as upvalues,
    /// then a late-bound global by name.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let get_op;
        let set_op;
        let arg;
        if let Some((slot, initialized)) = self.compiler.resolve_local(name.lexeme) {
            if !initialized {
                self.error("Can't read local variable in its own initializer.");
            }
            get_op = OpCode::GetLocal;
            set_op = OpCode::SetLocal;
            arg = slot;
        } else {
            match self.compiler.resolve_upvalue(name.lexeme) {
                Ok(Some(slot)) => {
                    get_op = OpCode::GetUpvalue;
                    set_op = OpCode::SetUpvalue;
                    arg = slot;
                }
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(None) => {
                    get_op = OpCode::GetGlobal;
                    set_op = OpCode::SetGlobal;
                    arg = self.identifier_constant(name);
                }
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    // ---- declarations ---------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_ops(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        let enclosing = self.class_compiler.take();
        self.class_compiler =
            Some(Box::new(ClassState { enclosing, has_superclass: false }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A hidden scope binds `super` so methods can capture it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class_compiler.as_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.class_compiler.as_ref().is_some_and(|class| class.has_superclass) {
            self.end_scope();
        }
        self.class_compiler = self.class_compiler.take().and_then(|class| class.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_ops(OpCode::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may recurse into its own name.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.function_mut().arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.function_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = std::mem::take(&mut self.compiler.upvalues);
        let function = self.end_compiler();
        let constant = self.make_constant(Value::object(function));
        // The enclosing chunk now holds the function; it no longer needs
        // the protect root push_compiler gave it.
        self.heap.protect.pop();

        self.emit_ops(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    // Desugared at emit time: the increment clause compiles once, between
    // body-end and the back-jump to the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        // Top-level `return` is deliberately allowed so a host can read the
        // result of an evaluated line.
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        // Only expressions at assignment precedence may be targets; the
        // flag threads into the variable and property rules.
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch on the token that begins an expression. Returns false when
    /// the token has no prefix rule.
    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::Nil | TokenKind::True | TokenKind::False => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary dispatched on a non-unary token"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(precedence_of(operator).next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary dispatched on a non-binary token"),
        }
    }

    fn number(&mut self) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("number token scans as a valid f64");
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let string = self.heap.intern(contents.as_bytes(), Roots::default());
        self.emit_constant(Value::object(string));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            _ => unreachable!("literal dispatched on a non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this_(&mut self) {
        if self.class_compiler.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        let has_superclass =
            self.class_compiler.as_ref().map(|class| class.has_superclass);
        match has_superclass {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous);

        let this_token = Token { kind: TokenKind::Identifier, lexeme: "this", line: self.previous.line };
        let super_token = Token { kind: TokenKind::Identifier, lexeme: "super", line: self.previous.line };
        self.named_variable(this_token, false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(super_token, false);
            self.emit_ops(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(super_token, false);
            self.emit_ops(OpCode::GetSuper, name);
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property read + call.
            let arg_count = self.argument_list();
            self.emit_ops(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_ops(OpCode::GetProperty, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    arg_count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count
    }

    // Short-circuit operators lean on JumpIfFalse peeking the condition
    // rather than popping it.
    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(source: &str) -> bool {
        let mut heap = Heap::new();
        compile(source, &mut heap).is_some()
    }

    #[test]
    fn test_expressions_compile() {
        assert!(compiles("1 + 2 * 3 - 4 / -5;"));
        assert!(compiles("!(5 - 4 > 3 * 2 == !nil);"));
        assert!(compiles("\"a\" + \"b\";"));
        assert!(compiles("print 1 == 2;"));
    }

    #[test]
    fn test_statements_compile() {
        assert!(compiles("var x = 1; { var y = x; print y; }"));
        assert!(compiles("if (true) print 1; else print 2;"));
        assert!(compiles("while (false) { print 1; }"));
        assert!(compiles("for (var i = 0; i < 4; i = i + 1) { print i; }"));
        assert!(compiles("fun f(a, b) { return a + b; } f(1, 2);"));
    }

    #[test]
    fn test_classes_compile() {
        assert!(compiles("class A { m() { return this; } init() { this.x = 1; } }"));
        assert!(compiles("class A { m() { return 1; } } class B < A { m() { return super.m(); } }"));
    }

    #[test]
    fn test_top_level_return_is_allowed() {
        assert!(compiles("return 1 + 2;"));
        assert!(compiles("return;"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(!compiles("var x = 1; 2 * x = 3 + 4;"));
        assert!(!compiles("5 = 3;"));
    }

    #[test]
    fn test_duplicate_local() {
        assert!(!compiles("{ var x = 5; var x = 6; }"));
        // Distinct scopes may shadow.
        assert!(compiles("{ var x = 5; { var x = 6; } }"));
    }

    #[test]
    fn test_own_initializer_read_is_local_only() {
        assert!(!compiles("{ var a = a; }"));
        // The same shape is fine for globals: it reads the previous one.
        assert!(compiles("var a = 1; var a = a;"));
    }

    #[test]
    fn test_initializer_return_rules() {
        assert!(!compiles("class A { init() { return 1; } }"));
        assert!(compiles("class A { init() { return; } }"));
    }

    #[test]
    fn test_this_and_super_placement() {
        assert!(!compiles("print this;"));
        assert!(!compiles("fun f() { return this; }"));
        assert!(!compiles("class A { m() { return super.m(); } }"));
        assert!(!compiles("class A < A {}"));
    }

    #[test]
    fn test_missing_expression() {
        assert!(!compiles(";"));
        assert!(!compiles("print ;"));
    }

    #[test]
    fn test_multiple_errors_reported_after_sync() {
        // Both statements are bad; panic-mode recovery lets compilation
        // reach the second one, and the compile still fails.
        assert!(!compiles("var 1 = 2; print ;"));
    }

    #[test]
    fn test_jumps_land_on_instruction_starts() {
        let mut heap = Heap::new();
        let function = compile(
            "var i = 0;
             while (i < 3) {
               if (i == 1) print i; else print 0;
               i = i + 1;
             }
             for (var j = 0; j < 2; j = j + 1) {
               print j and true or false;
             }",
            &mut heap,
        )
        .expect("program compiles");
        let chunk = &function.as_function().chunk;

        // First pass: every decodable instruction boundary.
        let mut starts = std::collections::BTreeSet::new();
        let mut scratch = String::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            starts.insert(offset);
            offset = disasm::disassemble_instruction(chunk, offset, &mut scratch);
            scratch.clear();
        }
        assert_eq!(offset, chunk.code.len());

        // Second pass: every patched jump offset lands on one of them.
        for &start in &starts {
            let op = OpCode::try_from(chunk.code[start]).expect("valid opcode");
            let operand = || {
                u16::from_be_bytes([chunk.code[start + 1], chunk.code[start + 2]]) as usize
            };
            match op {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    assert!(starts.contains(&(start + 3 + operand())));
                }
                OpCode::Loop => {
                    assert!(starts.contains(&(start + 3 - operand())));
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_constant_limit_per_chunk() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {};\n", i, i));
        }
        // Each declaration burns at least one identifier constant, so 300
        // declarations exhaust the 8-bit constant space.
        assert!(!compiles(&source));
    }
}
