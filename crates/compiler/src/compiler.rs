//! Single-pass Pratt compiler: source tokens straight to bytecode.
//!
//! Grounded on `original_source/compiler.c`'s rule table and parse loop
//! (`Rule{nud, led, precedence}`, `compiler_parse`'s `while
//! rules[current].precedence > bp`), extended with the statement forms and
//! fuller precedence ladder spec.md §4.5 describes (that earlier snapshot
//! only has expressions). Error wording matches `compiler_error` exactly.

use glint_core::{Chunk, Function, Opcode, Value, Var};

use crate::lexer::{Lexer, Token, TokenKind};

/// A single compile error. The compiler stops at the first one; there is no
/// panic-mode recovery, matching spec.md §7's "not recovered" policy.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub lexeme: Option<String>,
    pub message: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let at = match &self.lexeme {
            Some(l) => format!("near `{l}`"),
            None => "at end".to_string(),
        };
        write!(f, "!!! Compiler error, line {} ({at}): {}", self.line, self.message)
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Narrow interface onto the VM's global-variable namespace (spec.md §9's
/// design note): the compiler assigns stable slots without touching the
/// VM's HAMT directly.
pub trait Globals {
    /// Declares `name` if not already declared, returning its slot.
    /// Redeclaring an existing name just returns its existing slot (`var`/
    /// `let` at global scope rebinds rather than shadowing, matching free
    /// references' implicit declaration).
    fn declare_global(&mut self, name: &str, mutable: bool) -> u8;

    /// Resolves an already-declared global, returning its slot and whether
    /// it was declared mutable.
    fn resolve_global(&mut self, name: &str) -> Option<(u8, bool)>;
}

/// The compiler's window into the VM's heap: canonicalizes string constants
/// (so equal content shares one `Value`) and registers compiled functions as
/// heap objects the VM will track for teardown.
pub trait Interner {
    fn intern(&mut self, s: &str) -> Value;
    fn alloc_function(&mut self, function: Function) -> Value;
}

#[derive(Clone, Copy, PartialEq, PartialOrd, Debug)]
#[repr(u8)]
enum Precedence {
    Eof = 0,
    None,
    Interpolation,
    Or,
    And,
    Equality,
    Inequality,
    Addition,
    Multiplication,
    Exponentiation,
    Call,
    Unary,
}

fn rule_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Inequality,
        Plus | Minus => Precedence::Addition,
        Star | Slash => Precedence::Multiplication,
        StarStar => Precedence::Exponentiation,
        LeftParen => Precedence::Call,
        _ => Precedence::None,
    }
}

/// Per-function compile-time state: its in-progress chunk, local-scope
/// stack, and the heap arena backing local `Var` descriptors.
struct FunctionState {
    chunk: Chunk,
    arity: u8,
    /// One persistent HAMT snapshot per nested block; `scopes[0]` is the
    /// function body's top-level block.
    scopes: Vec<glint_core::Hamt>,
    /// Keys declared directly in each scope (not inherited), to detect
    /// "redefinition in the same scope" without conflating it with shadowing
    /// an outer block's binding.
    declared_in_scope: Vec<Vec<Value>>,
    local_count: u8,
    /// Local `Var` descriptors, heap-boxed so a `Value` pointer can address
    /// them from the scope HAMT. Reclaimed into the `Function` once this
    /// state is retired so nothing function-local ends up immortal.
    var_ptrs: Vec<*mut Var>,
    had_return: bool,
    /// Compile-only map from constant value to its pool index, mirroring
    /// `chunk_add_constant`'s separate `HAMT* constants` argument; never
    /// reaches the emitted `Chunk`.
    constants: glint_core::Hamt,
}

impl FunctionState {
    fn new() -> Self {
        FunctionState {
            chunk: Chunk::new(),
            arity: 0,
            scopes: vec![glint_core::Hamt::new()],
            declared_in_scope: vec![Vec::new()],
            local_count: 0,
            var_ptrs: Vec::new(),
            had_return: false,
            constants: glint_core::Hamt::new(),
        }
    }

    fn declare_local(&mut self, key: Value, mutable: bool, line: u32) -> Result<u8> {
        if self.local_count >= 254 {
            return Err(CompileError {
                line,
                lexeme: None,
                message: "too many local variables in function".to_string(),
            });
        }
        if self.declared_in_scope.last().unwrap().iter().any(|k| k.equal(key)) {
            return Err(CompileError {
                line,
                lexeme: None,
                message: "variable already declared in this scope".to_string(),
            });
        }
        let slot = self.local_count;
        self.local_count += 1;
        let boxed = Box::new(Var::new(slot as u32, mutable, false));
        let ptr: *mut Var = Box::into_raw(boxed);
        self.var_ptrs.push(ptr);
        let val = Value::from_var_ptr(ptr);

        let top = self.scopes.last_mut().unwrap();
        *top = top.with(key, val);
        self.declared_in_scope.last_mut().unwrap().push(key);
        Ok(slot)
    }

    fn resolve_local(&self, key: Value) -> Option<(u8, bool, bool)> {
        let top = self.scopes.last()?;
        let val = top.get(key)?;
        let var = unsafe { &*val.as_var_ptr() };
        Some((var.index as u8, var.mutable, var.initialized))
    }

    fn mark_initialized(&mut self, key: Value) {
        if let Some(val) = self.scopes.last().unwrap().get(key) {
            let var = unsafe { &mut *val.as_var_ptr() };
            var.initialized = true;
        }
    }

    /// True once we're inside at least one nested block of this function
    /// (as opposed to the function body's outermost implicit scope or, for
    /// the top-level script pseudo-function, bare source statements).
    fn in_nested_block(&self) -> bool {
        self.scopes.len() > 1
    }

    fn begin_scope(&mut self) {
        let snapshot = self.scopes.last().unwrap().clone();
        self.scopes.push(snapshot);
        self.declared_in_scope.push(Vec::new());
    }

    /// Pops the innermost scope, returning how many locals it declared (the
    /// caller emits that many `op_pop`s).
    fn end_scope(&mut self) -> u8 {
        self.scopes.pop();
        let declared = self.declared_in_scope.pop().unwrap().len() as u8;
        self.local_count -= declared;
        declared
    }

    /// Converts the tracked raw `Var` pointers back into owned boxes for
    /// the finished `Function` to carry. Safe: each pointer was produced by
    /// exactly one `Box::into_raw` in `declare_local`, and every scope HAMT
    /// that could reach it is dropped (via `self`) by the time this runs.
    fn reclaim_vars(self) -> Vec<Box<Var>> {
        self.var_ptrs
            .into_iter()
            .map(|p| unsafe { Box::from_raw(p) })
            .collect()
    }
}

/// A single host implementing both the global-slot namespace and the
/// string/function heap — in practice the `Vm`. Kept as one bound rather
/// than two separate `&mut` parameters, since both traits are almost always
/// implemented by the same object and two live `&mut` references into it
/// would alias.
pub trait Host: Globals + Interner {}
impl<T: Globals + Interner> Host for T {}

pub struct Compiler<'src, H: Host> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    host: &'src mut H,
    /// Stack of in-progress functions; index 0 is the top-level script body.
    /// `fun` declarations push a new frame and pop it once the body closes.
    functions: Vec<FunctionState>,
}

impl<'src, H: Host> Compiler<'src, H> {
    pub fn compile(source: &'src str, host: &'src mut H) -> Result<Function> {
        let mut lexer = Lexer::new(source);
        let first = lexer.next_token();
        let mut compiler = Compiler {
            lexer,
            previous: first,
            current: first,
            host,
            functions: vec![FunctionState::new()],
        };
        while !compiler.check(TokenKind::Eof) {
            compiler.declaration()?;
        }
        compiler.finish_script()
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> Result<()> {
        self.previous = self.current;
        self.current = self.lexer.next_token();
        if self.current.kind == TokenKind::Error {
            let tok = self.current;
            return Err(self.error_at(tok, tok.lexeme));
        }
        Ok(())
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<()> {
        if self.check(kind) {
            return self.advance();
        }
        Err(self.error_at_current(message))
    }

    fn error_at_current(&self, message: &str) -> CompileError {
        self.error_at(self.current, message)
    }

    fn error_at_previous(&self, message: &str) -> CompileError {
        self.error_at(self.previous, message)
    }

    fn error_at(&self, token: Token<'src>, message: &str) -> CompileError {
        CompileError {
            line: token.line,
            lexeme: if token.kind == TokenKind::Eof {
                None
            } else {
                Some(token.lexeme.to_string())
            },
            message: message.to_string(),
        }
    }

    // ---- emission helpers ----

    fn current_fn(&mut self) -> &mut FunctionState {
        self.functions.last_mut().unwrap()
    }

    fn emit(&mut self, op: Opcode, line: u32) {
        self.current_fn().chunk.add_byte(op as u8, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current_fn().chunk.add_byte(byte, line);
    }

    fn emit_constant_value(&mut self, value: Value, line: u32) -> Result<()> {
        let added = {
            let state = self.current_fn();
            state.chunk.add_constant(&mut state.constants, value)
        };
        let idx = match added {
            Some(idx) => idx,
            None => return Err(self.error_at_previous("too many constants in one chunk")),
        };
        self.emit(Opcode::Constant, line);
        self.emit_byte(idx, line);
        Ok(())
    }

    fn emit_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.emit(op, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.current_fn().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        let chunk = &mut self.current_fn().chunk;
        let jump = (chunk.len() - offset - 2) as i32;
        if jump > i16::MAX as i32 {
            return Err(self.error_at_previous("jump target too far"));
        }
        let bytes = (jump as i16).to_be_bytes();
        chunk.patch_byte(offset, bytes[0]);
        chunk.patch_byte(offset + 1, bytes[1]);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<()> {
        self.emit(Opcode::Jump, line);
        let chunk = &mut self.current_fn().chunk;
        let offset = (loop_start as i32) - (chunk.len() as i32 + 2);
        if offset < i16::MIN as i32 {
            return Err(self.error_at_previous("loop body too large"));
        }
        let bytes = (offset as i16).to_be_bytes();
        self.emit_byte(bytes[0], line);
        self.emit_byte(bytes[1], line);
        Ok(())
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) -> Result<()> {
        if self.check(TokenKind::Var) || self.check(TokenKind::Let) {
            self.var_declaration()
        } else if self.check(TokenKind::Fun) {
            self.fun_declaration()
        } else {
            self.statement()
        }
    }

    fn var_declaration(&mut self) -> Result<()> {
        let mutable = self.current.kind == TokenKind::Var;
        self.advance()?; // consume var/let
        let line = self.current.line;
        self.consume(TokenKind::Identifier, "expected variable name")?;
        let name = self.previous.lexeme;
        let is_local = self.current_fn().in_nested_block();

        let global_slot = if is_local {
            None
        } else {
            Some(self.host.declare_global(name, mutable))
        };
        if is_local {
            let key = self.host.intern(name);
            self.current_fn().declare_local(key, mutable, line)?;
        }

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            self.emit(Opcode::Nil, line);
        }
        self.consume(TokenKind::Semicolon, "expected `;` after variable declaration")?;

        if let Some(slot) = global_slot {
            self.emit(Opcode::DefineGlobal, line);
            self.emit_byte(slot, line);
        } else {
            let key = self.host.intern(name);
            self.current_fn().mark_initialized(key);
            // value is already sitting on the stack at this local's slot
        }
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<()> {
        self.advance()?; // consume `fun`
        let line = self.previous.line;
        self.consume(TokenKind::Identifier, "expected function name")?;
        let fn_name = self.previous.lexeme.to_string();
        let global_slot = self.host.declare_global(&fn_name, false);

        self.consume(TokenKind::LeftParen, "expected `(` after function name")?;
        self.functions.push(FunctionState::new());
        self.current_fn().begin_scope();

        let mut arity: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "expected parameter name")?;
                let pname = self.previous.lexeme;
                arity += 1;
                let key = self.host.intern(pname);
                self.current_fn().declare_local(key, true, self.previous.line)?;
                self.current_fn().mark_initialized(key);
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected `)` after parameters")?;
        self.current_fn().arity = arity;

        self.consume(TokenKind::LeftBrace, "expected `{` before function body")?;
        self.block()?;

        let mut state = self.functions.pop().unwrap();
        if !state.had_return {
            state.chunk.add_byte(Opcode::Nil as u8, self.previous.line);
            state.chunk.add_byte(Opcode::Return as u8, self.previous.line);
        }
        let arity = state.arity;
        let chunk = std::mem::take(&mut state.chunk);
        let _locals = state.reclaim_vars();

        let name_value = self.host.intern(&fn_name);
        let function = Function::script(name_value, arity, chunk);
        let fn_value = self.host.alloc_function(function);

        self.emit_constant_value(fn_value, line)?;
        self.emit(Opcode::DefineGlobal, line);
        self.emit_byte(global_slot, line);
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        match self.current.kind {
            TokenKind::LeftBrace => {
                self.advance()?;
                self.current_fn().begin_scope();
                self.block()?;
                let line = self.previous.line;
                let declared = self.current_fn().end_scope();
                for _ in 0..declared {
                    self.emit(Opcode::Pop, line);
                }
                Ok(())
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Switch => self.switch_statement(),
            TokenKind::Print => self.print_statement(),
            TokenKind::Return => self.return_statement(),
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) -> Result<()> {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        self.consume(TokenKind::RightBrace, "expected `}` after block")?;
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<()> {
        let line = self.current.line;
        self.expression()?;
        self.consume(TokenKind::Semicolon, "expected `;` after expression")?;
        self.emit(Opcode::Pop, line);
        Ok(())
    }

    fn print_statement(&mut self) -> Result<()> {
        self.advance()?;
        let line = self.previous.line;
        self.expression()?;
        self.consume(TokenKind::Semicolon, "expected `;` after value")?;
        self.emit(Opcode::Print, line);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        self.advance()?;
        let line = self.previous.line;
        if self.functions.len() == 1 {
            return Err(self.error_at_previous("cannot return from top-level code"));
        }
        if self.match_token(TokenKind::Semicolon)? {
            self.emit(Opcode::Nil, line);
            self.emit(Opcode::Return, line);
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "expected `;` after return value")?;
            self.emit(Opcode::Return, line);
        }
        self.current_fn().had_return = true;
        Ok(())
    }

    fn if_statement(&mut self) -> Result<()> {
        self.advance()?;
        let line = self.previous.line;
        self.expression()?;
        let else_jump = self.emit_jump(Opcode::JumpFalse, line);
        self.emit(Opcode::Pop, line);
        self.statement()?;

        if self.match_token(TokenKind::Else)? {
            let end_jump = self.emit_jump(Opcode::Jump, self.previous.line);
            self.patch_jump(else_jump)?;
            self.emit(Opcode::Pop, self.previous.line);
            self.statement()?;
            self.patch_jump(end_jump)?;
        } else {
            self.patch_jump(else_jump)?;
            self.emit(Opcode::Pop, self.previous.line);
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<()> {
        self.advance()?;
        let line = self.previous.line;
        let loop_start = self.current_fn().chunk.len();
        self.expression()?;
        let exit_jump = self.emit_jump(Opcode::JumpFalse, line);
        self.emit(Opcode::Pop, line);
        self.statement()?;
        self.emit_loop(loop_start, self.previous.line)?;
        self.patch_jump(exit_jump)?;
        self.emit(Opcode::Pop, self.previous.line);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<()> {
        self.advance()?;
        self.consume(TokenKind::LeftParen, "expected `(` after `for`")?;

        self.current_fn().begin_scope();

        if self.match_token(TokenKind::Semicolon)? {
            // no initializer
        } else if self.check(TokenKind::Var) || self.check(TokenKind::Let) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current_fn().chunk.len();

        let mut exit_jump: Option<usize> = None;
        if !self.check(TokenKind::Semicolon) {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "expected `;` after loop condition")?;
            exit_jump = Some(self.emit_jump(Opcode::JumpFalse, self.previous.line));
            self.emit(Opcode::Pop, self.previous.line);
        } else {
            self.advance()?;
        }

        // Increment is compiled now but jumped over on the first pass, and
        // looped back to just before the condition re-check thereafter.
        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump, self.previous.line);
            let increment_start = self.current_fn().chunk.len();
            self.expression()?;
            self.emit(Opcode::Pop, self.previous.line);
            self.consume(TokenKind::RightParen, "expected `)` after for clauses")?;
            self.emit_loop(loop_start, self.previous.line)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        } else {
            self.advance()?;
        }

        self.statement()?;
        self.emit_loop(loop_start, self.previous.line)?;

        if let Some(exit) = exit_jump {
            self.patch_jump(exit)?;
            self.emit(Opcode::Pop, self.previous.line);
        }

        let line = self.previous.line;
        let declared = self.current_fn().end_scope();
        for _ in 0..declared {
            self.emit(Opcode::Pop, line);
        }
        Ok(())
    }

    fn switch_statement(&mut self) -> Result<()> {
        self.advance()?;
        self.expression()?;
        self.consume(TokenKind::LeftBrace, "expected `{` after switch value")?;

        let mut break_jumps: Vec<usize> = Vec::new();
        let mut pending_fallthrough: Option<usize> = None;

        while self.check(TokenKind::Case) || self.check(TokenKind::Default) {
            let is_default = self.check(TokenKind::Default);
            self.advance()?;
            let case_line = self.previous.line;

            let mut next_jump = None;
            if !is_default {
                self.emit(Opcode::Dup, case_line);
                self.expression()?;
                self.emit(Opcode::Eq, case_line);
                next_jump = Some(self.emit_jump(Opcode::JumpFalse, case_line));
                self.emit(Opcode::Pop, case_line);
            }
            self.consume(TokenKind::Colon, "expected `:` after case label")?;

            // A pending `fallthrough` from the previous case jumps straight into
            // this case's body, past the label test above (and the true-path
            // `Pop` it ends with) so the subject is never re-tested.
            if let Some(offset) = pending_fallthrough.take() {
                self.patch_jump(offset)?;
            }

            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
            {
                if self.check(TokenKind::Fallthrough) {
                    self.advance()?;
                    self.consume(TokenKind::Semicolon, "expected `;` after `fallthrough`")?;
                    pending_fallthrough = Some(self.emit_jump(Opcode::Jump, self.previous.line));
                } else {
                    self.declaration()?;
                }
            }
            if pending_fallthrough.is_none() {
                break_jumps.push(self.emit_jump(Opcode::Jump, self.previous.line));
            }
            if let Some(offset) = next_jump {
                self.patch_jump(offset)?;
                self.emit(Opcode::Pop, self.previous.line);
            }
        }
        if let Some(offset) = pending_fallthrough.take() {
            self.patch_jump(offset)?;
        }
        self.consume(TokenKind::RightBrace, "expected `}` after switch body")?;
        for offset in break_jumps {
            self.patch_jump(offset)?;
        }
        self.emit(Opcode::Pop, self.previous.line); // discard switch subject
        Ok(())
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Or)
    }

    fn parse_precedence(&mut self, min_prec: Precedence) -> Result<()> {
        self.advance()?;
        let can_assign = min_prec <= Precedence::Or;
        let tok = self.previous;
        self.nud(tok, can_assign)?;

        while rule_precedence(self.current.kind) as u8 > min_prec as u8 {
            self.advance()?;
            let tok = self.previous;
            self.led(tok)?;
        }

        if can_assign && self.check(TokenKind::Equal) {
            return Err(self.error_at_current("invalid assignment target"));
        }
        Ok(())
    }

    fn nud(&mut self, token: Token<'src>, can_assign: bool) -> Result<()> {
        use TokenKind::*;
        match token.kind {
            Number => self.nud_number(token),
            String => self.nud_plain_string(token),
            StringPrefix => self.nud_string_interpolation(token),
            True => self.emit_constant_value(Value::from_true(), token.line),
            False => self.emit_constant_value(Value::from_false(), token.line),
            Nil => {
                self.emit(Opcode::Nil, token.line);
                Ok(())
            }
            Infinity => {
                self.emit(Opcode::Infinity, token.line);
                Ok(())
            }
            Identifier => self.nud_variable(token, can_assign),
            LeftParen => {
                self.expression()?;
                self.consume(RightParen, "expected `)` after expression")
            }
            Minus => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::Negate, token.line);
                Ok(())
            }
            Bang => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::Not, token.line);
                Ok(())
            }
            Quote => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::Quote, token.line);
                Ok(())
            }
            Bar => {
                self.expression()?;
                self.consume(Bar, "expected closing `|`")?;
                self.emit(Opcode::Bars, token.line);
                Ok(())
            }
            _ => Err(self.error_at(token, "expected expression")),
        }
    }

    fn led(&mut self, token: Token<'src>) -> Result<()> {
        use TokenKind::*;
        match token.kind {
            Plus => {
                self.parse_precedence(Precedence::Addition)?;
                self.emit(Opcode::Add, token.line);
                Ok(())
            }
            Minus => {
                self.parse_precedence(Precedence::Addition)?;
                self.emit(Opcode::Subtract, token.line);
                Ok(())
            }
            Star => {
                self.parse_precedence(Precedence::Multiplication)?;
                self.emit(Opcode::Multiply, token.line);
                Ok(())
            }
            Slash => {
                self.parse_precedence(Precedence::Multiplication)?;
                self.emit(Opcode::Divide, token.line);
                Ok(())
            }
            StarStar => {
                // Right-associative: recurse one rung below Exponentiation
                // (Multiplication) so a further `**` to the right keeps
                // grouping instead of terminating — `2 ** 2 ** 3` becomes
                // `2 ** (2 ** 3)`.
                self.parse_precedence(Precedence::Multiplication)?;
                self.emit(Opcode::Exponent, token.line);
                Ok(())
            }
            EqualEqual => {
                self.parse_precedence(Precedence::Equality)?;
                self.emit(Opcode::Eq, token.line);
                Ok(())
            }
            BangEqual => {
                self.parse_precedence(Precedence::Equality)?;
                self.emit(Opcode::Ne, token.line);
                Ok(())
            }
            Greater => {
                self.parse_precedence(Precedence::Inequality)?;
                self.emit(Opcode::Gt, token.line);
                Ok(())
            }
            GreaterEqual => {
                self.parse_precedence(Precedence::Inequality)?;
                self.emit(Opcode::Ge, token.line);
                Ok(())
            }
            Less => {
                self.parse_precedence(Precedence::Inequality)?;
                self.emit(Opcode::Lt, token.line);
                Ok(())
            }
            LessEqual => {
                self.parse_precedence(Precedence::Inequality)?;
                self.emit(Opcode::Le, token.line);
                Ok(())
            }
            And => {
                let jump = self.emit_jump(Opcode::JumpFalse, token.line);
                self.emit(Opcode::Pop, token.line);
                self.parse_precedence(Precedence::And)?;
                self.patch_jump(jump)
            }
            Or => {
                let jump = self.emit_jump(Opcode::JumpTrue, token.line);
                self.emit(Opcode::Pop, token.line);
                self.parse_precedence(Precedence::Or)?;
                self.patch_jump(jump)
            }
            LeftParen => self.finish_call(token.line),
            _ => Err(self.error_at(token, "unexpected operator")),
        }
    }

    fn finish_call(&mut self, line: u32) -> Result<()> {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected `)` after arguments")?;
        self.emit(Opcode::Call, line);
        self.emit_byte(argc, line);
        Ok(())
    }

    fn nud_number(&mut self, token: Token<'src>) -> Result<()> {
        let d: f64 = token
            .lexeme
            .parse()
            .map_err(|_| self.error_at(token, "invalid number literal"))?;
        if d == 0.0 {
            self.emit(Opcode::Zero, token.line);
            Ok(())
        } else if d == 1.0 {
            self.emit(Opcode::One, token.line);
            Ok(())
        } else {
            self.emit_constant_value(Value::from_number(d), token.line)
        }
    }

    fn nud_plain_string(&mut self, token: Token<'src>) -> Result<()> {
        self.emit_segment(token.lexeme, token.line)
    }

    fn emit_segment(&mut self, text: &str, line: u32) -> Result<()> {
        if text.is_empty() {
            self.emit(Opcode::Epsilon, line);
            Ok(())
        } else {
            let value = self.host.intern(text);
            self.emit_constant_value(value, line)
        }
    }

    fn nud_string_interpolation(&mut self, token: Token<'src>) -> Result<()> {
        self.emit_segment(token.lexeme, token.line)?;
        loop {
            self.parse_precedence(Precedence::Interpolation)?;
            self.emit(Opcode::Quote, self.previous.line);
            self.emit(Opcode::Multiply, self.previous.line);

            match self.current.kind {
                TokenKind::StringInfix => {
                    let seg = self.current;
                    self.advance()?;
                    self.emit_segment(seg.lexeme, seg.line)?;
                    self.emit(Opcode::Multiply, seg.line);
                }
                TokenKind::StringSuffix => {
                    let seg = self.current;
                    self.advance()?;
                    self.emit_segment(seg.lexeme, seg.line)?;
                    self.emit(Opcode::Multiply, seg.line);
                    return Ok(());
                }
                _ => return Err(self.error_at_current("expected continuation of interpolated string")),
            }
        }
    }

    fn nud_variable(&mut self, token: Token<'src>, can_assign: bool) -> Result<()> {
        let name = token.lexeme;
        let key = self.host.intern(name);

        if let Some((slot, mutable, _initialized)) = self.current_fn().resolve_local(key) {
            if can_assign && self.match_token(TokenKind::Equal)? {
                if !mutable {
                    return Err(self.error_at(token, "cannot assign to an immutable `let` binding"));
                }
                self.expression()?;
                self.emit(Opcode::SetLocal, token.line);
                self.emit_byte(slot, token.line);
            } else {
                self.emit(Opcode::GetLocal, token.line);
                self.emit_byte(slot, token.line);
            }
            return Ok(());
        }

        let (slot, mutable) = match self.host.resolve_global(name) {
            Some(existing) => existing,
            None => (self.host.declare_global(name, true), true),
        };
        if can_assign && self.match_token(TokenKind::Equal)? {
            if !mutable {
                return Err(self.error_at(token, "cannot assign to an immutable `let` binding"));
            }
            self.expression()?;
            self.emit(Opcode::SetGlobal, token.line);
            self.emit_byte(slot, token.line);
        } else {
            self.emit(Opcode::GetGlobal, token.line);
            self.emit_byte(slot, token.line);
        }
        Ok(())
    }

    fn finish_script(mut self) -> Result<Function> {
        let line = self.previous.line;
        self.emit(Opcode::Nil, line);
        self.emit(Opcode::Return, line);
        let mut state = self.functions.pop().unwrap();
        let chunk = std::mem::take(&mut state.chunk);
        let _locals = state.reclaim_vars();
        Ok(Function::script(Value::epsilon(), 0, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestHost {
        names: HashMap<String, (u8, bool)>,
        next_slot: u8,
        strings: HashMap<String, Value>,
        functions: Vec<Box<Function>>,
    }

    impl TestHost {
        fn new() -> Self {
            TestHost {
                names: HashMap::new(),
                next_slot: 0,
                strings: HashMap::new(),
                functions: Vec::new(),
            }
        }
    }

    impl Globals for TestHost {
        fn declare_global(&mut self, name: &str, mutable: bool) -> u8 {
            if let Some((slot, _)) = self.names.get(name) {
                return *slot;
            }
            let slot = self.next_slot;
            self.next_slot += 1;
            self.names.insert(name.to_string(), (slot, mutable));
            slot
        }

        fn resolve_global(&mut self, name: &str) -> Option<(u8, bool)> {
            self.names.get(name).copied()
        }
    }

    impl Interner for TestHost {
        fn intern(&mut self, s: &str) -> Value {
            if s.len() <= 6 && s.bytes().all(|b| b < 0x80) {
                return Value::from_short_bytes(s.as_bytes());
            }
            if let Some(v) = self.strings.get(s) {
                return *v;
            }
            let boxed = Box::new(glint_core::GlintString::from_str(s));
            let ptr = Box::into_raw(boxed);
            let value = Value::from_heap_string_ptr(ptr);
            self.strings.insert(s.to_string(), value);
            value
        }

        fn alloc_function(&mut self, function: Function) -> Value {
            let mut boxed = Box::new(function);
            let ptr: *mut Function = &mut *boxed;
            self.functions.push(boxed);
            Value::from_function_ptr(ptr)
        }
    }

    fn compile_ok(src: &str) -> Function {
        let mut host = TestHost::new();
        Compiler::compile(src, &mut host).expect("expected compile success")
    }

    fn compile_err(src: &str) -> CompileError {
        let mut host = TestHost::new();
        Compiler::compile(src, &mut host).expect_err("expected compile failure")
    }

    #[test]
    fn compiles_arithmetic() {
        let f = compile_ok("print 1 + 2 * 3;");
        assert!(f.chunk.as_ref().unwrap().len() > 0);
    }

    #[test]
    fn rejects_assignment_to_let_after_init() {
        let err = compile_err("let x = 1; x = 2;");
        assert!(err.message.contains("immutable"));
    }

    #[test]
    fn rejects_return_at_top_level() {
        let err = compile_err("return 1;");
        assert!(err.message.contains("top-level"));
    }

    #[test]
    fn error_format_matches_spec() {
        let err = compile_err("var = 1;");
        let rendered = format!("{err}");
        assert!(rendered.starts_with("!!! Compiler error, line"));
    }

    #[test]
    fn fallthrough_requires_semicolon() {
        let err = compile_err("switch 1 { case 1: fallthrough }");
        assert!(err.message.contains("fallthrough") || err.message.contains(";"));
    }

    #[test]
    fn function_and_interpolation_compile() {
        let f = compile_ok("fun add(a, b) { return a + b; } var x = 3; print \"x is ${x * 2}!\";");
        assert!(f.chunk.as_ref().unwrap().len() > 0);
    }
}
