// File: src/compiler.rs
//
// Single-pass Pratt-parsing compiler: tokens go straight to bytecode, with
// no intermediate AST. Grounded on the teacher's "emit as you parse, patch
// jumps after the fact" idiom (`patch_jump`, scope-depth bookkeeping) but
// rebuilt around a real token stream and a real precedence table, since
// the teacher compiles from a pre-built AST and this language has none.

use crate::chunk::{Chunk, OpCode};
use crate::errors::Diagnostic;
use crate::gc;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::{fnv1a_hash, Heap, Obj, ObjFunction, ObjHandle, ObjString, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy)]
enum Prefix {
    None,
    Grouping,
    Unary,
    Number,
    StringLit,
    Literal,
    Variable,
}

#[derive(Clone, Copy)]
enum Infix {
    None,
    Binary,
    And,
    Or,
    Call,
}

struct ParseRule {
    prefix: Prefix,
    infix: Infix,
    precedence: Precedence,
}

/// Token kind to `{prefix?, infix?, precedence}` mapping, expressed as a
/// match rather than an array of function pointers — an equivalent
/// dispatch shape for a grammar where a literal array indexed by token
/// discriminant reads awkwardly next to an enum-based token stream.
fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    match kind {
        LeftParen => ParseRule { prefix: Prefix::Grouping, infix: Infix::Call, precedence: Precedence::Call },
        Minus => ParseRule { prefix: Prefix::Unary, infix: Infix::Binary, precedence: Precedence::Term },
        Plus => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Term },
        Slash => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Factor },
        Star => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Factor },
        Bang => ParseRule { prefix: Prefix::Unary, infix: Infix::None, precedence: Precedence::None },
        BangEqual => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Equality },
        EqualEqual => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Equality },
        Greater => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Comparison },
        GreaterEqual => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Comparison },
        Less => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Comparison },
        LessEqual => ParseRule { prefix: Prefix::None, infix: Infix::Binary, precedence: Precedence::Comparison },
        Identifier => ParseRule { prefix: Prefix::Variable, infix: Infix::None, precedence: Precedence::None },
        String => ParseRule { prefix: Prefix::StringLit, infix: Infix::None, precedence: Precedence::None },
        Number => ParseRule { prefix: Prefix::Number, infix: Infix::None, precedence: Precedence::None },
        And => ParseRule { prefix: Prefix::None, infix: Infix::And, precedence: Precedence::And },
        Or => ParseRule { prefix: Prefix::None, infix: Infix::Or, precedence: Precedence::Or },
        False => ParseRule { prefix: Prefix::Literal, infix: Infix::None, precedence: Precedence::None },
        Nil => ParseRule { prefix: Prefix::Literal, infix: Infix::None, precedence: Precedence::None },
        True => ParseRule { prefix: Prefix::Literal, infix: Infix::None, precedence: Precedence::None },
        _ => ParseRule { prefix: Prefix::None, infix: Infix::None, precedence: Precedence::None },
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
}

struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// One level of the conceptual "stack of compilers": the function
/// currently being emitted into, plus its locals and upvalue table.
/// Nesting is modeled as entries in `Compiler::states` rather than a
/// recursive struct, so the borrow of `heap`/`strings` never has to be
/// threaded through a self-referential chain.
struct FunctionState<'src> {
    function: ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(function_type: FunctionType, name: Option<ObjHandle>) -> Self {
        let mut function = ObjFunction::new();
        function.name = name;
        // Slot 0 is reserved for the callee itself and is never resolved
        // by name, so its lexeme is left empty.
        let sentinel = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        FunctionState {
            function,
            function_type,
            locals: vec![Local { name: sentinel, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    heap: &'heap mut Heap,
    strings: &'heap mut Table,
    states: Vec<FunctionState<'src>>,
}

/// Compile `source` into the top-level script function. On failure,
/// returns every diagnostic collected across panic-mode recovery points
/// (not just the first).
pub fn compile(source: &str, heap: &mut Heap, strings: &mut Table) -> Result<ObjFunction, Vec<Diagnostic>> {
    let sentinel = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: sentinel,
        current: sentinel,
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        heap,
        strings,
        states: vec![FunctionState::new(FunctionType::Script, None)],
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    compiler.emit_op(OpCode::Nil);
    compiler.emit_op(OpCode::Return);
    let state = compiler.states.pop().expect("script function state");

    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(state.function)
    }
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let tok = self.current;
            self.error_at(tok, tok.lexeme);
        }
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // ---- diagnostics --------------------------------------------------

    fn error(&mut self, message: &str) {
        let tok = self.previous;
        self.error_at(tok, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current;
        self.error_at(tok, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics.push(Diagnostic::at_token(token.line, token.lexeme, token.kind == TokenKind::Eof, message));
    }

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

    // ---- emission -------------------------------------------------

    fn current_state(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("compiler always has a current function state")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_state().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Emit `op` followed by a two-byte placeholder jump operand, and
    /// return the offset of the first placeholder byte for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.chunk_mut().patch_jump(offset) {
            self.error(&message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let jump = self.chunk_mut().code.len() + 2 - loop_start;
        if jump > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        let jump = jump as u16;
        self.emit_byte((jump >> 8) as u8);
        self.emit_byte((jump & 0xff) as u8);
    }

    fn emit_constant(&mut self, value: Value) {
        match self.chunk_mut().add_constant(value) {
            Some(index) => self.emit_op_byte(OpCode::Constant, index),
            None => self.error("Too many constants in one chunk."),
        }
    }

    /// Collect if the heap has grown past its trigger, rooting every
    /// constant of every function currently under construction (including
    /// enclosing ones) since none of them are reachable from the VM yet.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots = gc::Roots::new();
        for state in &self.states {
            roots.push_chunk_constants(&state.function.chunk);
        }
        gc::collect_garbage(self.heap, self.strings, roots);
    }

    /// Intern `s`, checked/collected-before-allocating so the freshly
    /// returned handle is never at risk until the caller stores it as a
    /// chunk constant (which happens immediately at every call site).
    fn intern_string(&mut self, s: &str) -> ObjHandle {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.strings.find_string(s, hash, self.heap) {
            return existing;
        }
        self.maybe_collect();
        let handle = self.heap.alloc(Obj::String(ObjString::new(s.to_string())));
        self.strings.set(handle, Value::Nil, self.heap);
        handle
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.intern_string(name);
        match self.chunk_mut().add_constant(Value::Obj(handle)) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    // ---- scopes and variables ---------------------------------------

    fn begin_scope(&mut self) {
        self.current_state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_state().scope_depth -= 1;
        let depth = self.current_state().scope_depth;
        loop {
            let last = match self.current_state().locals.last() {
                Some(local) if local.depth > depth => local.is_captured,
                _ => break,
            };
            if last {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_state().locals.pop();
        }
    }

    fn declare_variable(&mut self) {
        if self.current_state().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let depth = self.current_state().scope_depth;
        let mut duplicate = false;
        for local in self.current_state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name.lexeme == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        if self.current_state().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current_state().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current_state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let state = self.current_state();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&self, state_idx: usize, name: &str) -> Option<(usize, bool)> {
        let state = &self.states[state_idx];
        for (idx, local) in state.locals.iter().enumerate().rev() {
            if local.name.lexeme == name {
                return Some((idx, local.depth == -1));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;
        if let Some((local_idx, uninitialized)) = self.resolve_local(enclosing, name) {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            self.states[enclosing].locals[local_idx].is_captured = true;
            return Some(self.add_upvalue(state_idx, local_idx as u8, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        let state = &mut self.states[state_idx];
        for (i, up) in state.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if state.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        state.upvalues.push(UpvalueRef { index, is_local });
        state.function.upvalue_count = state.upvalues.len();
        (state.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let current_idx = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some((idx, uninitialized)) = self.resolve_local(current_idx, name) {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            (OpCode::GetLocal, OpCode::SetLocal, idx as u8)
        } else if let Some(idx) = self.resolve_upvalue(current_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, idx)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // ---- expressions --------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = rule(self.previous.kind).prefix;
        if matches!(prefix, Prefix::None) {
            self.error("Expect expression.");
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.apply_prefix(prefix, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix;
            self.apply_infix(infix, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn apply_prefix(&mut self, prefix: Prefix, can_assign: bool) {
        match prefix {
            Prefix::None => {}
            Prefix::Grouping => self.grouping(),
            Prefix::Unary => self.unary(),
            Prefix::Number => self.number(),
            Prefix::StringLit => self.string_lit(),
            Prefix::Literal => self.literal(),
            Prefix::Variable => self.variable(can_assign),
        }
    }

    fn apply_infix(&mut self, infix: Infix, can_assign: bool) {
        let _ = can_assign;
        match infix {
            Infix::None => {}
            Infix::Binary => self.binary(),
            Infix::And => self.and(),
            Infix::Or => self.or(),
            Infix::Call => self.call(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string_lit(&mut self) {
        let lexeme = self.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let handle = self.intern_string(content);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("literal() called for a non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!("unary() called for a non-unary operator"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        let parsed_rule = rule(operator);
        self.parse_precedence(parsed_rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
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
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary() called for a non-binary operator"),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op_byte(OpCode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    // ---- declarations and statements ---------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
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

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name_handle = self.intern_string(self.previous.lexeme);
        self.states.push(FunctionState::new(function_type, Some(name_handle)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.current_state().function.arity += 1;
                if self.current_state().function.arity as usize > MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
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

        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);

        let finished = self.states.pop().expect("pushed function state");
        self.maybe_collect();
        let handle = self.heap.alloc(Obj::Function(finished.function));

        match self.chunk_mut().add_constant(Value::Obj(handle)) {
            Some(index) => {
                self.emit_op_byte(OpCode::Closure, index);
                for up in &finished.upvalues {
                    self.emit_byte(up.is_local as u8);
                    self.emit_byte(up.index);
                }
            }
            None => self.error("Too many constants in one chunk."),
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

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
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
        let loop_start = self.chunk_mut().code.len();
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

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();
        let mut exit_jump: Option<usize> = None;

        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_state().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_op(OpCode::Nil);
            self.emit_op(OpCode::Return);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compiled(source: &str) -> ObjFunction {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        compile(source, &mut heap, &mut strings).expect("source should compile")
    }

    #[test]
    fn compiles_trailing_return() {
        let f = compiled("1 + 2;");
        let last_two = &f.chunk.code[f.chunk.code.len() - 2..];
        assert_eq!(last_two, &[OpCode::Nil as u8, OpCode::Return as u8]);
    }

    #[test]
    fn reports_multiple_diagnostics_across_synchronize_points() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let err = compile("var;\nvar;\n", &mut heap, &mut strings).unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn rejects_return_at_top_level() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let err = compile("return 1;", &mut heap, &mut strings).unwrap_err();
        assert!(err[0].message.contains("Can't return from top-level code."));
    }

    #[test]
    fn duplicate_local_declaration_is_an_error() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let err = compile("{ var x = 1; var x = 2; }", &mut heap, &mut strings).unwrap_err();
        assert!(err[0].message.contains("Already a variable with this name"));
    }

    #[test]
    fn function_declaration_emits_closure() {
        let f = compiled("fun f(a, b) { return a + b; } f(1, 2);");
        assert!(f.chunk.code.contains(&(OpCode::Closure as u8)));
    }
}
