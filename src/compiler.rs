use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::opcode::OpCode;
use crate::value::{FunctionObj, Obj, ObjRef, Value};
use crate::vm::{Vm, UINT8_COUNT};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Comparison, // < > <= >=
    Shift,      // << >>
    Term,       // + -
    Factor,     // * /
    Unary,      // ! - ~
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn<'s, 'v> = fn(&mut Compiler<'s, 'v>, bool);

struct ParseRule<'s, 'v> {
    prefix: Option<ParseFn<'s, 'v>>,
    infix: Option<ParseFn<'s, 'v>>,
    precedence: Precedence,
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'s> {
    name: &'s str,
    /// -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct CompUpvalue {
    index: u8,
    is_local: bool,
}

struct LoopState {
    start: usize,
    depth: i32,
    breaks: Vec<usize>,
}

/// Per-function compilation state. Nested function compilations stack; the
/// innermost is last. The function object itself lives in the heap from the
/// start and sits on the collector's compiler-root stack while it is here.
struct FnState<'s> {
    function: ObjRef,
    fn_type: FunctionType,
    locals: Vec<Local<'s>>,
    upvalues: Vec<CompUpvalue>,
    loops: Vec<LoopState>,
    scope_depth: i32,
    /// Advisory dedup of string constants, interned handle -> pool index.
    string_consts: FxHashMap<ObjRef, u16>,
}

struct ClassState {
    has_superclass: bool,
}

pub struct Compiler<'s, 'v> {
    vm: &'v mut Vm,
    lex: Lexer<'s>,
    cur: Token<'s>,
    prev: Token<'s>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    states: Vec<FnState<'s>>,
    classes: Vec<ClassState>,
}

/// Compile a source string to its top-level script function. On any parse
/// error the rendered diagnostics come back instead.
pub fn compile(vm: &mut Vm, source: &str) -> Result<ObjRef, Vec<String>> {
    let eof = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
    let mut c = Compiler {
        vm,
        lex: Lexer::new(source),
        cur: eof,
        prev: eof,
        had_error: false,
        panic_mode: false,
        errors: vec![],
        states: vec![],
        classes: vec![],
    };

    c.begin_function(FunctionType::Script, None);
    c.advance();
    while !c.matches(TokenKind::Eof) {
        c.declaration();
    }
    let (script, _) = c.end_function();

    if c.had_error {
        Err(c.errors)
    } else {
        Ok(script)
    }
}

impl<'s, 'v> Compiler<'s, 'v> {
    // ------------------------------------------------------------------
    // Function nesting
    // ------------------------------------------------------------------

    fn begin_function(&mut self, fn_type: FunctionType, name: Option<&str>) {
        let function = self.vm.alloc(Obj::Function(FunctionObj::new(None)));
        self.vm.heap.comp_roots.push(function);

        let slot0 = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        self.states.push(FnState {
            function,
            fn_type,
            locals: vec![Local { name: slot0, depth: 0, is_captured: false }],
            upvalues: vec![],
            loops: vec![],
            scope_depth: 0,
            string_consts: FxHashMap::default(),
        });

        // Interning can collect; the function is already rooted above, and
        // the name is wired in before the next allocation can happen.
        if let Some(name) = name {
            let name_ref = self.vm.intern(name);
            self.vm.heap.function_mut(function).name = Some(name_ref);
        }
    }

    fn end_function(&mut self) -> (ObjRef, Vec<CompUpvalue>) {
        self.emit_return();
        let state = self.states.pop().expect("function state underflow");
        self.vm.heap.function_mut(state.function).upvalue_count = state.upvalues.len();
        self.vm.heap.comp_roots.pop();
        (state.function, state.upvalues)
    }

    fn state(&self) -> &FnState<'s> {
        self.states.last().expect("no active function state")
    }

    fn state_mut(&mut self) -> &mut FnState<'s> {
        self.states.last_mut().expect("no active function state")
    }

    // ------------------------------------------------------------------
    // Token plumbing and diagnostics
    // ------------------------------------------------------------------

    fn advance(&mut self) {
        self.prev = self.cur;
        loop {
            self.cur = self.lex.next_token();
            if self.cur.kind != TokenKind::Error {
                break;
            }
            let msg = self.cur.lexeme;
            self.error_at_current(msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn next_is_identifier(&self) -> bool {
        let mut lex = self.lex.clone();
        lex.next_token().kind == TokenKind::Identifier
    }

    fn error(&mut self, msg: &str) {
        let token = self.prev;
        self.report(token, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        let token = self.cur;
        self.report(token, msg);
    }

    fn report(&mut self, token: Token<'s>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(format!("[line {}] Error{}: {}", token.line, at, msg));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.cur.kind != TokenKind::Eof {
            if self.prev.kind == TokenKind::Semicolon {
                return;
            }
            match self.cur.kind {
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

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn chunk_mut(&mut self) -> &mut Chunk {
        let f = self.state().function;
        &mut self.vm.heap.function_mut(f).chunk
    }

    fn chunk_len(&self) -> usize {
        let f = self.state().function;
        self.vm.heap.function(f).chunk.code.len()
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.prev.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_byte(&mut self, b: u8) {
        let line = self.prev.line;
        self.chunk_mut().write_u8(b, line);
    }

    fn emit_u16(&mut self, v: u16) {
        let line = self.prev.line;
        self.chunk_mut().write_u16(v, line);
    }

    /// Index-bearing opcodes use the short form whenever the index fits a
    /// byte, the `_LONG` form otherwise.
    fn emit_indexed(&mut self, short: OpCode, long: OpCode, idx: u16) {
        if idx <= u8::MAX as u16 {
            self.emit_op(short);
            self.emit_byte(idx as u8);
        } else {
            self.emit_op(long);
            self.emit_u16(idx);
        }
    }

    fn make_constant(&mut self, v: Value) -> u16 {
        let idx = self.chunk_mut().add_constant(v);
        if idx > u16::MAX as usize {
            self.error("Too many constants in one chunk. (max is 65536)");
            return 0;
        }
        idx as u16
    }

    fn emit_constant(&mut self, v: Value) {
        let idx = self.make_constant(v);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, idx);
    }

    fn string_constant(&mut self, s: ObjRef) -> u16 {
        if let Some(&idx) = self.state().string_consts.get(&s) {
            return idx;
        }
        let idx = self.make_constant(Value::Obj(s));
        self.state_mut().string_consts.insert(s, idx);
        idx
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let s = self.vm.intern(name);
        self.string_constant(s)
    }

    fn emit_return(&mut self) {
        if self.state().fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
            self.emit_op(OpCode::Return);
        } else {
            self.emit_op(OpCode::ReturnNil);
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, at: usize) {
        let jump = self.chunk_len() - at - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let f = self.state().function;
        Chunk::write_u16_at(&mut self.vm.heap.function_mut(f).chunk.code, at, jump as u16);
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::JumpBackwards);
        let offset = self.chunk_len() - start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(offset as u16);
    }

    // ------------------------------------------------------------------
    // Scopes, locals, upvalues
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let (pop, captured) = {
                let state = self.state();
                match state.locals.last() {
                    Some(l) if l.depth > state.scope_depth => (true, l.is_captured),
                    _ => (false, false),
                }
            };
            if !pop {
                break;
            }
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    /// Emit pops for locals deeper than `depth` without forgetting them;
    /// `break` and `continue` leave the scope bookkeeping to the block exit.
    fn discard_locals(&mut self, depth: i32) {
        let captured: Vec<bool> = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > depth)
            .map(|l| l.is_captured)
            .collect();
        for c in captured {
            if c {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'s str) {
        if self.state().locals.len() == UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.prev.lexeme;
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().expect("no local to initialize").depth = depth;
    }

    fn parse_variable(&mut self, msg: &str) -> u16 {
        self.consume(TokenKind::Identifier, msg);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.prev.lexeme)
    }

    fn define_variable(&mut self, global: u16) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.states[state_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth == -1));
                break;
            }
        }
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Try the enclosing function's locals first, marking a hit as captured;
    /// otherwise recurse outward and propagate as a non-local upvalue.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_idx - 1, name) {
            self.states[state_idx - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_idx - 1, name) {
            return Some(self.add_upvalue(state_idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.states[state_idx]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.states[state_idx].upvalues.len() == UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_idx].upvalues.push(CompUpvalue { index, is_local });
        (self.states[state_idx].upvalues.len() - 1) as u8
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.check(TokenKind::Fun) && self.next_is_identifier() {
            self.advance();
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.prev.lexeme;
        self.mark_initialized();
        self.function(FunctionType::Function, Some(name));
        self.define_variable(global);
    }

    fn function(&mut self, fn_type: FunctionType, name: Option<&str>) {
        self.begin_function(fn_type, name);
        self.begin_scope();

        self.consume(TokenKind::LParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RParen) {
            loop {
                let arity = self.vm.heap.function(self.state().function).arity + 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let f = self.state().function;
                self.vm.heap.function_mut(f).arity = arity;
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole state goes away with the function.
        let (function, upvalues) = self.end_function();
        let idx = self.make_constant(Value::Obj(function));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, idx);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.prev.lexeme;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.prev.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A scoped synthetic local lets methods close over the
            // superclass through the normal upvalue machinery.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.prev.lexeme;
        let name_const = self.identifier_constant(name);
        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type, Some(name));
        self.emit_indexed(OpCode::Method, OpCode::MethodLong, name_const);
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RBrace, "Expect '}' after block.");
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
        self.consume(TokenKind::LParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // The increment runs after the body, so it is emitted first and
        // reached through a jump trampoline.
        if !self.matches(TokenKind::RParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.begin_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn begin_loop(&mut self, start: usize) {
        let depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopState { start, depth, breaks: vec![] });
    }

    fn end_loop(&mut self) {
        let finished = self.state_mut().loops.pop().expect("loop state underflow");
        for jump in finished.breaks {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.state().loops.is_empty() {
            self.error("Cannot use 'break' outside of a loop.");
            return;
        }
        let depth = self.state().loops.last().unwrap().depth;
        self.discard_locals(depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.state_mut().loops.last_mut().unwrap().breaks.push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.state().loops.is_empty() {
            self.error("Cannot use 'continue' outside of a loop.");
            return;
        }
        let last = self.state().loops.last().unwrap();
        let (start, depth) = (last.start, last.depth);
        self.discard_locals(depth);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.state().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    // ------------------------------------------------------------------
    // Expressions (Pratt)
    // ------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, prec: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.prev.kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = prec <= Precedence::Assignment;
        prefix(self, can_assign);

        while prec <= Self::rule(self.cur.kind).precedence {
            self.advance();
            let infix = Self::rule(self.prev.kind).infix.expect("infix rule missing");
            infix(self, can_assign);
        }

        // An `=` nobody consumed cannot be a valid assignment.
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'s, 'v> {
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<ParseFn<'s, 'v>>,
            Option<ParseFn<'s, 'v>>,
            Precedence,
        ) = match kind {
            LParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            LBracket => (Some(Self::array_literal), Some(Self::subscript), Precedence::Call),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star => (None, Some(Self::binary), Precedence::Factor),
            Amp => (None, Some(Self::binary), Precedence::BitAnd),
            Pipe => (None, Some(Self::binary), Precedence::BitOr),
            Caret => (None, Some(Self::binary), Precedence::BitXor),
            LessLess | GreaterGreater => (None, Some(Self::binary), Precedence::Shift),
            Tilde | Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and_), Precedence::And),
            Or => (None, Some(Self::or_), Precedence::Or),
            True | False | Nil => (Some(Self::literal), None, Precedence::None),
            This => (Some(Self::this_), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            Fun => (Some(Self::lambda), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule { prefix, infix, precedence }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.prev.lexeme.parse().unwrap_or(0.0);
        if value >= 0.0 && value <= u8::MAX as f64 && value.fract() == 0.0 {
            self.emit_op(OpCode::ByteNum);
            self.emit_byte(value as u8);
        } else {
            self.emit_constant(Value::Number(value));
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.prev.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let s = self.vm.intern(contents);
        let idx = self.string_constant(s);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, idx);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.prev.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.prev.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Tilde => self.emit_op(OpCode::Invert),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.prev.kind;
        let precedence = Self::rule(op_kind).precedence;
        self.parse_precedence(precedence.next());
        match op_kind {
            TokenKind::BangEqual => self.emit_op(OpCode::Neq),
            TokenKind::EqualEqual => self.emit_op(OpCode::Eq),
            TokenKind::Greater => self.emit_op(OpCode::Gt),
            TokenKind::GreaterEqual => self.emit_op(OpCode::Gte),
            TokenKind::Less => self.emit_op(OpCode::Lt),
            TokenKind::LessEqual => self.emit_op(OpCode::Lte),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::LessLess => self.emit_op(OpCode::ShiftLeft),
            TokenKind::GreaterGreater => self.emit_op(OpCode::ShiftRight),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Pipe => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.prev.lexeme;
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: &'s str, can_assign: bool) {
        let top = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetLocal);
            } else {
                self.emit_op(OpCode::GetLocal);
            }
            self.emit_byte(slot);
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_op(OpCode::SetUpvalue);
            } else {
                self.emit_op(OpCode::GetUpvalue);
            }
            self.emit_byte(slot);
        } else {
            let idx = self.identifier_constant(name);
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, idx);
            } else {
                self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, idx);
            }
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression();
                argc += 1;
                if argc > 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let idx = self.identifier_constant(self.prev.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, idx);
        } else if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, idx);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, idx);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.expression();
                argc += 1;
                if argc > 255 {
                    self.error("Can't have more than 255 subscript indices.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "Expect ']' after subscript.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SubscriptAssign);
        } else {
            self.emit_op(OpCode::Subscript);
        }
        self.emit_byte(argc.min(255) as u8);
    }

    fn array_literal(&mut self, _can_assign: bool) {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.expression();
                count += 1;
                if count > 255 {
                    self.error("Can't have more than 255 elements in an array literal.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "Expect ']' after array elements.");
        self.emit_op(OpCode::NewArray);
        self.emit_byte(count.min(255) as u8);
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionType::Function, None);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let idx = self.identifier_constant(self.prev.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenKind::LParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_indexed(OpCode::SuperInvoke, OpCode::SuperInvokeLong, idx);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_indexed(OpCode::GetSuper, OpCode::GetSuperLong, idx);
        }
    }
}
