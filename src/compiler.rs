// File: src/compiler.rs
//
// Single-pass compiler for Flax.
// A Pratt parser that scans and emits bytecode in one pass, with no AST in
// between. Locals and upvalues are resolved while parsing; functions nest
// by pushing a fresh Compiler whose parent is the current one.

use crate::bytecode::OpCode;
use crate::debug::{self, DF_CODE, DF_SCANNING};
use crate::errors::CompileErrors;
use crate::heap::{GcRoots, Heap};
use crate::lexer::{self, Lexer, Token, TokenKind};
use crate::object::ObjRef;
use crate::value::Value;

/// Locals and upvalues are addressed by a one-byte operand.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Infix binding power, lowest to highest. `parse_precedence(p)` consumes
/// every operator that binds at least as tightly as `p`.
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
    /// The next-tighter level, used for left-associative binary operators.
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// What kind of function body the current compiler is emitting. Changes
/// the implicit return (`this` for initializers, `nil` otherwise) and
/// what occupies local slot zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. Functions nest: `enclosing` points at the
/// compiler for the surrounding function.
struct Compiler<'src> {
    enclosing: Option<Box<Compiler<'src>>>,
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl<'src> Compiler<'src> {
    fn new(function: ObjRef, kind: FunctionKind) -> Self {
        // Slot zero belongs to the callee (or the receiver, for methods):
        // reserving it here keeps local slots aligned with stack slots.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
        };
        Compiler {
            enclosing: None,
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Walks the locals backward so shadowing finds the innermost binding.
    fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("can't read local variable in its own initializer");
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    /// Looks the name up in enclosing functions, threading an upvalue
    /// through every level between the capture site and the local.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let enclosing = match self.enclosing.as_mut() {
            Some(enclosing) => enclosing,
            None => return Ok(None),
        };

        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[local as usize].is_captured = true;
            return self.add_upvalue(local, true).map(Some);
        }

        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        // Reuse an existing entry so a variable referenced twice captures
        // once.
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }

        if self.upvalues.len() == MAX_UPVALUES {
            return Err("too many closure variables in function");
        }

        self.upvalues.push(UpvalueRef { index, is_local });
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Tracks class-body nesting for `this`/`super` validation.
struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

pub struct Parser<'src, 'h> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    /// While set, further errors are swallowed until a statement boundary.
    panic_mode: bool,
    diagnostics: Vec<String>,
    compiler: Option<Box<Compiler<'src>>>,
    class_compiler: Option<Box<ClassCompiler>>,
    heap: &'h mut Heap,
}

/// Compiles a source string into a script function. On failure returns the
/// rendered diagnostics for every error found before synchronization gave
/// up.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileErrors> {
    if debug::enabled(DF_SCANNING) {
        lexer::dump_tokens(source);
    }

    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }

    let script = parser.end_compiler();
    if parser.had_error {
        Err(CompileErrors { diagnostics: parser.diagnostics })
    } else {
        Ok(script.function)
    }
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let function = heap.new_function(&GcRoots::NONE);
        heap.push_compiler_root(function);
        Parser {
            lexer: Lexer::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            compiler: Some(Box::new(Compiler::new(function, FunctionKind::Script))),
            class_compiler: None,
            heap,
        }
    }

    fn current_compiler(&self) -> &Compiler<'src> {
        match self.compiler.as_deref() {
            Some(compiler) => compiler,
            None => panic!("no active compiler"),
        }
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'src> {
        match self.compiler.as_deref_mut() {
            Some(compiler) => compiler,
            None => panic!("no active compiler"),
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // Error tokens carry their message as the lexeme.
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

    // ---- error reporting ------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let mut diagnostic = format!("[line {}] error", token.line);
        match token.kind {
            TokenKind::Eof => diagnostic.push_str(" at end"),
            TokenKind::Error => {}
            _ => {
                diagnostic.push_str(&format!(" at '{}'", token.lexeme));
            }
        }
        diagnostic.push_str(&format!(": {}", message));

        self.diagnostics.push(diagnostic);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skips tokens until a statement boundary so one mistake produces one
    /// diagnostic instead of a cascade.
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

    // ---- bytecode emission ----------------------------------------------

    fn chunk_offset(&self) -> usize {
        let function = self.current_compiler().function;
        self.heap.function(function).chunk.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let function = self.current_compiler().function;
        let line = self.previous.line;
        self.heap.function_mut(function).chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().kind == FunctionKind::Initializer {
            // An initializer implicitly returns its receiver.
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let function = self.current_compiler().function;
        let index = self.heap.function_mut(function).chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("too many constants in one chunk");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.heap.intern(name, &GcRoots::NONE);
        self.make_constant(Value::Obj(string))
    }

    /// Emits a jump with a two-byte placeholder and returns the offset of
    /// the placeholder for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves.
        let jump = self.chunk_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("too much code to jump over");
        }

        let function = self.current_compiler().function;
        let code = &mut self.heap.function_mut(function).chunk.code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);

        // +2 skips over the operand of the Loop instruction itself.
        let offset = self.chunk_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // ---- compiler nesting and scopes ------------------------------------

    fn push_compiler(&mut self, kind: FunctionKind) {
        let function = self.heap.new_function(&GcRoots::NONE);
        self.heap.push_compiler_root(function);

        let mut compiler = Box::new(Compiler::new(function, kind));
        compiler.enclosing = self.compiler.take();
        self.compiler = Some(compiler);

        if kind != FunctionKind::Script {
            let name = self.heap.intern(self.previous.lexeme, &GcRoots::NONE);
            self.heap.function_mut(function).name = Some(name);
        }
    }

    /// Finishes the current function and pops back to its parent. Returns
    /// the finished compiler: the caller needs its upvalue list to emit
    /// the `Closure` operands.
    fn end_compiler(&mut self) -> Box<Compiler<'src>> {
        self.emit_return();

        let mut finished = match self.compiler.take() {
            Some(compiler) => compiler,
            None => panic!("no active compiler"),
        };
        self.heap.function_mut(finished.function).upvalue_count = finished.upvalues.len();

        if debug::enabled(DF_CODE) && !self.had_error {
            let function = self.heap.function(finished.function);
            let name = match function.name {
                Some(name) => self.heap.str_slice(name).to_string(),
                None => "<script>".to_string(),
            };
            debug::disassemble_chunk(&function.chunk, self.heap, &name);
        }

        self.compiler = finished.enclosing.take();
        self.heap.pop_compiler_root();
        finished
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;

        loop {
            let captured = {
                let compiler = self.current_compiler();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => {
                        Some(local.is_captured)
                    }
                    _ => None,
                }
            };
            match captured {
                // A captured local moves to the heap instead of being
                // discarded.
                Some(true) => self.emit_op(OpCode::CloseUpvalue),
                Some(false) => self.emit_op(OpCode::Pop),
                None => break,
            }
            self.current_compiler_mut().locals.pop();
        }
    }

    // ---- variables ------------------------------------------------------

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous.lexeme)
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let compiler = self.current_compiler();
            for local in compiler.locals.iter().rev() {
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("already a variable with this name in this scope");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_compiler().locals.len() == MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        // Depth -1 marks "declared but not initialized": reading it before
        // the initializer finishes is an error.
        self.current_compiler_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let compiler = self.current_compiler_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        let depth = compiler.scope_depth;
        if let Some(local) = compiler.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let resolved = self.current_compiler().resolve_local(name);
        let (get_op, set_op, arg) = match resolved {
            Err(message) => {
                self.error(message);
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => match self.current_compiler_mut().resolve_upvalue(name) {
                Err(message) => {
                    self.error(message);
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, 0)
                }
                Ok(Some(index)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_byte(arg);
        } else {
            self.emit_op(get_op);
            self.emit_byte(arg);
        }
    }

    // ---- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        let prefix = match prefix {
            Some(prefix) => prefix,
            None => {
                self.error("expected expression");
                return;
            }
        };

        // Only the lowest precedence level may complete an assignment;
        // this is what rejects `a + b = c`.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // Trim the surrounding quotes; there are no escape sequences.
        let contents = &lexeme[1..lexeme.len() - 1];
        let string = self.heap.intern(contents, &GcRoots::NONE);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());

        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name);
        } else if self.match_token(TokenKind::LeftParen) {
            // Fused property access + call.
            let arg_count = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error("can't use 'this' outside of a class");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.class_compiler.as_deref() {
            None => self.error("can't use 'super' outside of a class"),
            Some(class) if !class.has_superclass => {
                self.error("can't use 'super' in a class with no superclass")
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("can't have more than 255 arguments");
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        arg_count.min(255) as u8
    }

    // ---- declarations and statements ------------------------------------

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
        self.consume(TokenKind::Identifier, "expected class name");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_byte(name_constant);
        self.define_variable(name_constant);

        self.class_compiler = Some(Box::new(ClassCompiler {
            enclosing: self.class_compiler.take(),
            has_superclass: false,
        }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            self.variable(false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("a class can't inherit from itself");
            }

            // `super` lives in a scope of its own so every method closure
            // of this class captures the same superclass slot.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class_compiler.as_deref_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);

        let has_superclass =
            self.class_compiler.as_deref().map_or(false, |class| class.has_superclass);
        if has_superclass {
            self.end_scope();
        }

        self.class_compiler =
            self.class_compiler.take().and_then(|mut class| class.enclosing.take());
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expected method name");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);

        self.emit_op(OpCode::Method);
        self.emit_byte(constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("expected function name");
        // Initialized immediately so the function can call itself.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.push_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.current_compiler().function;
                let arity = {
                    let f = self.heap.function_mut(function);
                    f.arity += 1;
                    f.arity
                };
                if arity > 255 {
                    self.error_at_current("can't have more than 255 parameters");
                }
                let constant = self.parse_variable("expected parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        let finished = self.end_compiler();
        let constant = self.make_constant(Value::Obj(finished.function));
        self.emit_op(OpCode::Closure);
        self.emit_byte(constant);

        for upvalue in &finished.upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("expected variable name");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");

        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
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
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

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
        let loop_start = self.chunk_offset();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` desugars in place: initializer, condition, body, with the
    /// increment clause compiled before the body but executed after it by
    /// jumping around it.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_offset();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_compiler().kind == FunctionKind::Script {
            self.error("can't return from top-level code");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().kind == FunctionKind::Initializer {
                self.error("can't return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }
}

/// The Pratt rule table: for each token kind, its prefix rule, infix rule,
/// and infix precedence.
fn rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;

    fn make<'src, 'h>(
        prefix: Option<ParseFn<'src, 'h>>,
        infix: Option<ParseFn<'src, 'h>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'h> {
        ParseRule { prefix, infix, precedence }
    }

    match kind {
        LeftParen => make(Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        RightParen => make(None, None, Precedence::None),
        LeftBrace => make(None, None, Precedence::None),
        RightBrace => make(None, None, Precedence::None),
        Comma => make(None, None, Precedence::None),
        Dot => make(None, Some(Parser::dot), Precedence::Call),
        Minus => make(Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => make(None, Some(Parser::binary), Precedence::Term),
        Semicolon => make(None, None, Precedence::None),
        Slash => make(None, Some(Parser::binary), Precedence::Factor),
        Star => make(None, Some(Parser::binary), Precedence::Factor),
        Bang => make(Some(Parser::unary), None, Precedence::None),
        BangEqual => make(None, Some(Parser::binary), Precedence::Equality),
        Equal => make(None, None, Precedence::None),
        EqualEqual => make(None, Some(Parser::binary), Precedence::Equality),
        Greater => make(None, Some(Parser::binary), Precedence::Comparison),
        GreaterEqual => make(None, Some(Parser::binary), Precedence::Comparison),
        Less => make(None, Some(Parser::binary), Precedence::Comparison),
        LessEqual => make(None, Some(Parser::binary), Precedence::Comparison),
        Identifier => make(Some(Parser::variable), None, Precedence::None),
        String => make(Some(Parser::string), None, Precedence::None),
        Number => make(Some(Parser::number), None, Precedence::None),
        And => make(None, Some(Parser::and_), Precedence::And),
        Class => make(None, None, Precedence::None),
        Else => make(None, None, Precedence::None),
        False => make(Some(Parser::literal), None, Precedence::None),
        For => make(None, None, Precedence::None),
        Fun => make(None, None, Precedence::None),
        If => make(None, None, Precedence::None),
        Nil => make(Some(Parser::literal), None, Precedence::None),
        Or => make(None, Some(Parser::or_), Precedence::Or),
        Print => make(None, None, Precedence::None),
        Return => make(None, None, Precedence::None),
        Super => make(Some(Parser::super_), None, Precedence::None),
        This => make(Some(Parser::this_), None, Precedence::None),
        True => make(Some(Parser::literal), None, Precedence::None),
        Var => make(None, None, Precedence::None),
        While => make(None, None, Precedence::None),
        Error => make(None, None, Precedence::None),
        Eof => make(None, None, Precedence::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("compile error");
        (heap, function)
    }

    fn compile_err(source: &str) -> CompileErrors {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected compile error")
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let source = "fun f(a, b) { return a * b + 1; } print f(2, 3);";
        let mut heap = Heap::new();
        let first = compile(source, &mut heap).expect("compile error");
        let second = compile(source, &mut heap).expect("compile error");
        assert_eq!(heap.function(first).chunk.code, heap.function(second).chunk.code);
        assert_eq!(heap.function(first).chunk.lines, heap.function(second).chunk.lines);
    }

    #[test]
    fn test_arithmetic_emission() {
        let (heap, function) = compile_ok("1 + 2;");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                OpCode::Constant as u8,
                0,
                OpCode::Constant as u8,
                1,
                OpCode::Add as u8,
                OpCode::Pop as u8,
                OpCode::Nil as u8,
                OpCode::Return as u8,
            ]
        );
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn test_lines_parallel_to_code() {
        let (heap, function) = compile_ok("var a = 1;\nprint a;\n");
        let chunk = &heap.function(function).chunk;
        assert_eq!(chunk.code.len(), chunk.lines.len());
    }

    #[test]
    fn test_locals_use_slot_operands() {
        let (heap, function) = compile_ok("{ var a = 7; print a; }");
        let code = &heap.function(function).chunk.code;
        assert!(code.contains(&(OpCode::GetLocal as u8)));
        assert!(!code.contains(&(OpCode::GetGlobal as u8)));
    }

    #[test]
    fn test_self_read_in_initializer_is_error_in_block() {
        let errors = compile_err("{ var a = a; }");
        assert!(errors
            .to_string()
            .contains("can't read local variable in its own initializer"));
    }

    #[test]
    fn test_global_self_reference_compiles() {
        // Globals are late-bound, so this is legal to compile (and fails
        // only at runtime).
        let mut heap = Heap::new();
        assert!(compile("var a = a;", &mut heap).is_ok());
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = compile_err("var a; var b; var c; a + b = c;");
        assert!(errors.to_string().contains("invalid assignment target"));
    }

    #[test]
    fn test_duplicate_local_is_error() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert!(errors
            .to_string()
            .contains("already a variable with this name in this scope"));
    }

    #[test]
    fn test_error_reports_line_and_lexeme() {
        let errors = compile_err("var 1 = 2;");
        let rendered = errors.to_string();
        assert!(rendered.starts_with("[line 1] error"), "got: {}", rendered);
        assert!(rendered.contains("expected variable name"));
    }

    #[test]
    fn test_panic_mode_collapses_cascades() {
        // A missing semicolon must not drown the user in follow-on errors:
        // the parser synchronizes at the statement boundary.
        let errors = compile_err("var a = 1\nvar b = 2;\nvar c = ;\n");
        assert!(errors.diagnostics.len() <= 2, "got: {:?}", errors.diagnostics);
    }

    #[test]
    fn test_this_outside_class_is_error() {
        let errors = compile_err("print this;");
        assert!(errors.to_string().contains("can't use 'this' outside of a class"));
    }

    #[test]
    fn test_super_without_superclass_is_error() {
        let errors = compile_err("class A { f() { super.f(); } }");
        assert!(errors
            .to_string()
            .contains("can't use 'super' in a class with no superclass"));
    }

    #[test]
    fn test_return_at_top_level_is_error() {
        let errors = compile_err("return 1;");
        assert!(errors.to_string().contains("can't return from top-level code"));
    }

    #[test]
    fn test_return_value_from_initializer_is_error() {
        let errors = compile_err("class A { init() { return 1; } }");
        assert!(errors.to_string().contains("can't return a value from an initializer"));
    }

    #[test]
    fn test_class_inheriting_from_itself_is_error() {
        let errors = compile_err("class A < A {}");
        assert!(errors.to_string().contains("a class can't inherit from itself"));
    }

    #[test]
    fn test_closure_captures_produce_upvalues() {
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { print x; } return inner; }",
        );
        // The outer function is the script's first function constant.
        let script_chunk = &heap.function(function).chunk;
        let outer = script_chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) if matches!(heap.obj(*r), crate::object::Obj::Function(_)) => {
                    Some(*r)
                }
                _ => None,
            })
            .expect("outer function constant");
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) if matches!(heap.obj(*r), crate::object::Obj::Function(_)) => {
                    Some(*r)
                }
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(heap.function(inner).upvalue_count, 1);
        assert!(heap.function(outer).chunk.code.contains(&(OpCode::CloseUpvalue as u8)));
    }

    #[test]
    fn test_too_many_constants_in_one_chunk() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {};\n", i));
        }
        let errors = compile_err(&source);
        assert!(errors.to_string().contains("too many constants in one chunk"));
    }

    #[test]
    fn test_jump_operands_are_big_endian_relative() {
        let (heap, function) = compile_ok("if (true) print 1;");
        let code = &heap.function(function).chunk.code;
        // True, JumpIfFalse hi lo, Pop, ...
        assert_eq!(code[0], OpCode::True as u8);
        assert_eq!(code[1], OpCode::JumpIfFalse as u8);
        let offset = ((code[2] as usize) << 8) | code[3] as usize;
        // The jump lands inside the chunk, past the then-branch.
        assert!(4 + offset < code.len());
    }
}
