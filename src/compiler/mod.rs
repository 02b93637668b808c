//! Single-pass recursive-descent compiler (spec.md §4.2): tokens straight to
//! bytecode, no AST.
//!
//! Grounded on the teacher's `bytecode/builder.rs` for the emission API
//! (`ChunkBuilder` here plays `CodeBuilder`'s role) and on
//! `examples/original_source/src/vm/compiler.c` for the single-pass
//! structure and precedence table. Variable resolution (locals innermost-out,
//! then upvalue capture across nested function compilers, then a global
//! fallback) follows spec.md §4.2 exactly; it has no teacher counterpart
//! since `parcadei-ouros` resolves names through a separate `namespace.rs`
//! pass over an AST (dropped — Pyro has no AST to run that pass over).

mod locals;

use locals::Scope;

use crate::{
    bytecode::{ChunkBuilder, Opcode},
    error::{Panic, PanicKind},
    heap::{Heap, HeapData, HeapId},
    lexer::{Lexer, Token, TokenKind},
    loc::SourceId,
    objects::PyroFunction,
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    BitOr,
    BitAnd,
    Term,
    Factor,
    Unary,
    Power,
    Postfix,
}

struct FunctionFrame {
    builder: ChunkBuilder,
    scope: Scope,
    arity: u8,
    is_variadic: bool,
    is_method: bool,
    name: HeapId,
    default_value_fns: Vec<HeapId>,
    loop_stack: Vec<LoopCtx>,
}

struct LoopCtx {
    start: usize,
    depth: i32,
    break_jumps: Vec<crate::bytecode::JumpLabel>,
}

struct ClassCtx {
    has_superclass: bool,
}

/// Compiles one source unit (the main script, or an imported module) into a
/// top-level `PyroFunction` with arity 0.
pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    source_id: SourceId,
    frames: Vec<FunctionFrame>,
    class_stack: Vec<ClassCtx>,
    heap: &'src mut Heap,
}

impl<'src> Compiler<'src> {
    pub fn compile(source: &'src str, source_id: SourceId, heap: &'src mut Heap) -> Result<HeapId, Panic> {
        let mut lexer = Lexer::new(source, source_id);
        let first = lexer.next_token()?;
        let script_name = heap.intern_str("$main");
        let mut compiler = Compiler {
            lexer,
            previous: first,
            current: first,
            source_id,
            frames: vec![FunctionFrame {
                builder: ChunkBuilder::new(),
                scope: Scope::new(),
                arity: 0,
                is_variadic: false,
                is_method: false,
                name: script_name,
                default_value_fns: Vec::new(),
                loop_stack: Vec::new(),
            }],
            class_stack: Vec::new(),
            heap,
        };
        compiler.advance()?;
        while !compiler.check(TokenKind::Eof) {
            compiler.statement()?;
        }
        let frame = compiler.frames.pop().expect("main frame present");
        compiler.builder_emit_return(frame.builder, 0)
    }

    fn builder_emit_return(&mut self, mut builder: ChunkBuilder, line: u32) -> Result<HeapId, Panic> {
        builder.emit(Opcode::LoadNull, line);
        builder.emit(Opcode::Return, line);
        let chunk = builder.build();
        let name = self.heap.intern_str("$main");
        let function = PyroFunction {
            name,
            chunk,
            source_id: self.source_id,
            arity: 0,
            is_variadic: false,
            is_method: false,
            upvalue_count: 0,
            default_value_fns: Vec::new(),
        };
        Ok(self.heap.alloc(HeapData::Function(function)))
    }

    fn frame(&mut self) -> &mut FunctionFrame {
        self.frames.last_mut().expect("at least one function frame")
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn advance(&mut self) -> Result<(), Panic> {
        self.previous = self.current;
        self.current = self.lexer.next_token()?;
        Ok(())
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> Result<bool, Panic> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<(), Panic> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(Panic::new(PanicKind::SyntaxError, message.to_string()).at(self.source_id, self.current.line))
        }
    }

    fn emit(&mut self, op: Opcode) {
        let line = self.line();
        self.frame().builder.emit(op, line);
    }

    fn emit_u8(&mut self, op: Opcode, operand: u8) {
        let line = self.line();
        self.frame().builder.emit_u8(op, operand, line);
    }

    fn emit_u16(&mut self, op: Opcode, operand: u16) {
        let line = self.line();
        self.frame().builder.emit_u16(op, operand, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.frame().builder.add_constant(value);
        self.emit_u16(Opcode::LoadConstant, index);
    }

    fn intern_current_lexeme(&mut self) -> HeapId {
        self.heap.intern_str(self.previous.lexeme)
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<(), Panic> {
        if self.matches(TokenKind::Var)? {
            self.var_statement()
        } else if self.matches(TokenKind::Def)? {
            self.def_statement()
        } else if self.matches(TokenKind::Class)? {
            self.class_statement()
        } else if self.matches(TokenKind::Enum)? {
            self.enum_statement()
        } else if self.matches(TokenKind::Typedef)? {
            self.typedef_statement()
        } else if self.matches(TokenKind::Import)? {
            self.import_statement()
        } else if self.matches(TokenKind::Echo)? {
            self.echo_statement()
        } else if self.matches(TokenKind::Assert)? {
            self.assert_statement()
        } else if self.matches(TokenKind::If)? {
            self.if_statement()
        } else if self.matches(TokenKind::While)? {
            self.while_statement()
        } else if self.matches(TokenKind::Loop)? {
            self.loop_statement()
        } else if self.matches(TokenKind::For)? {
            self.for_statement()
        } else if self.matches(TokenKind::Break)? {
            self.break_statement()
        } else if self.matches(TokenKind::Continue)? {
            self.continue_statement()
        } else if self.matches(TokenKind::Return)? {
            self.return_statement()
        } else if self.matches(TokenKind::With)? {
            self.with_statement()
        } else if self.matches(TokenKind::LeftBrace)? {
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    fn begin_scope(&mut self) {
        self.frame().scope.begin_scope();
    }

    fn end_scope(&mut self) {
        let line = self.line();
        let popped = self.frame().scope.end_scope();
        for local in popped.into_iter().rev() {
            if local.is_captured {
                self.frame().builder.emit(Opcode::CloseUpvalue, line);
            } else {
                self.frame().builder.emit(Opcode::Pop, line);
            }
        }
    }

    fn block(&mut self) -> Result<(), Panic> {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.statement()?;
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close block")
    }

    fn var_statement(&mut self) -> Result<(), Panic> {
        if self.check(TokenKind::LeftParen) {
            return self.destructuring_var_statement();
        }
        self.expect(TokenKind::Identifier, "expected variable name after 'var'")?;
        let name = self.intern_current_lexeme();
        if self.matches(TokenKind::Equal)? {
            self.expression()?;
        } else {
            self.emit(Opcode::LoadNull);
        }
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        self.define_variable(name);
        Ok(())
    }

    /// `var (a, b) = tup;` (spec.md §4.2): `Unpack` pops the right-hand value
    /// and pushes its elements back in order, so a local's slot index lines
    /// up with its declaration order same as any other local. A global bind
    /// pops instead (`DefinePubGlobal`'s own convention), so those have to
    /// run in reverse — the last name declared sits on top of the stack
    /// after `Unpack`.
    fn destructuring_var_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::LeftParen, "expected '(' to start a destructuring pattern")?;
        let mut names: Vec<HeapId> = Vec::new();
        loop {
            self.expect(TokenKind::Identifier, "expected variable name in destructuring pattern")?;
            names.push(self.intern_current_lexeme());
            if !self.matches(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' to close destructuring pattern")?;
        self.expect(TokenKind::Equal, "expected '=' after destructuring pattern")?;
        self.expression()?;
        self.expect(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        let count = u8::try_from(names.len()).expect("too many names in one destructuring pattern");
        self.emit_u8(Opcode::Unpack, count);
        if self.frame().scope.depth > 0 {
            for &name in &names {
                self.frame().scope.declare_local(name);
            }
        } else {
            for &name in names.iter().rev() {
                let index = self.frame().builder.add_string_constant(name);
                self.emit_u16(Opcode::DefinePubGlobal, index);
            }
        }
        Ok(())
    }

    fn define_variable(&mut self, name: HeapId) {
        if self.frame().scope.depth > 0 {
            self.frame().scope.declare_local(name);
            return;
        }
        let index = self.frame().builder.add_string_constant(name);
        self.emit_u16(Opcode::DefinePubGlobal, index);
    }

    fn def_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected function name after 'def'")?;
        let name = self.intern_current_lexeme();
        self.compile_function(name, false)?;
        self.define_variable(name);
        Ok(())
    }

    /// Compiles a function body. `is_method` reserves local slot 0 for an
    /// implicit receiver (so `self`/`super`, compiled directly to
    /// `GetLocal0`, read the value the call protocol places there) before
    /// any declared parameter claims it.
    fn compile_function(&mut self, name: HeapId, is_method: bool) -> Result<(), Panic> {
        self.frames.push(FunctionFrame {
            builder: ChunkBuilder::new(),
            scope: Scope::new(),
            arity: 0,
            is_variadic: false,
            is_method,
            name,
            default_value_fns: Vec::new(),
            loop_stack: Vec::new(),
        });
        self.frame().scope.begin_scope();
        if is_method {
            let self_name = self.heap.intern_str("self");
            self.frame().scope.declare_local(self_name);
        }

        self.expect(TokenKind::LeftParen, "expected '(' after function name")?;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expect(TokenKind::Identifier, "expected parameter name")?;
                let pname = self.intern_current_lexeme();
                self.frame().scope.declare_local(pname);
                self.frame().arity += 1;
                if self.matches(TokenKind::Equal)? {
                    self.expression()?;
                }
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after parameters")?;
        self.expect(TokenKind::LeftBrace, "expected '{' before function body")?;
        self.block()?;

        let line = self.line();
        self.frame().builder.emit(Opcode::LoadNull, line);
        self.frame().builder.emit(Opcode::Return, line);

        self.finish_closure()
    }

    /// Pops the current function frame, builds its `PyroFunction`, and emits
    /// the `MakeClosure` instruction (with trailing upvalue-descriptor
    /// pairs) into the *enclosing* frame — shared tail for both ordinary
    /// function/method bodies and `try EXPR`'s synthetic zero-arg closure.
    fn finish_closure(&mut self) -> Result<(), Panic> {
        let frame = self.frames.pop().expect("pushed function frame");
        let upvalues = frame.scope.upvalues().to_vec();
        let chunk = frame.builder.build();
        let function = PyroFunction {
            name: frame.name,
            chunk,
            source_id: self.source_id,
            arity: frame.arity,
            is_variadic: frame.is_variadic,
            is_method: frame.is_method,
            upvalue_count: u8::try_from(upvalues.len()).unwrap_or(u8::MAX),
            default_value_fns: frame.default_value_fns,
        };
        let function_id = self.heap.alloc(HeapData::Function(function));
        let const_index = self.frame().builder.add_constant(Value::Obj(function_id));
        let upvalue_count = u8::try_from(upvalues.len()).unwrap_or(u8::MAX);
        let line = self.line();
        self.frame().builder.emit_u16(Opcode::MakeClosure, const_index, line);
        self.frame().builder.emit_raw_u8(upvalue_count, line);
        for up in upvalues {
            self.frame().builder.emit_raw_u8(u8::from(up.is_local), line);
            self.frame().builder.emit_raw_u8(up.index, line);
        }
        Ok(())
    }

    /// `try EXPR` (spec.md §4.4): compiles `EXPR` as its own zero-arg
    /// function — parsing only a single `Precedence::Unary` operand, not a
    /// full assignment-level expression, matching
    /// `examples/original_source/src/vm/compiler.c`'s `parse_try_expr` — then
    /// emits `Opcode::Try`, which calls the closure at runtime and converts
    /// any panic raised while running it into an `Error` value instead of
    /// propagating.
    fn try_expression(&mut self) -> Result<(), Panic> {
        let name = self.heap.intern_str("$try");
        self.frames.push(FunctionFrame {
            builder: ChunkBuilder::new(),
            scope: Scope::new(),
            arity: 0,
            is_variadic: false,
            is_method: false,
            name,
            default_value_fns: Vec::new(),
            loop_stack: Vec::new(),
        });
        self.frame().scope.begin_scope();

        self.parse_precedence(Precedence::Unary)?;

        let line = self.line();
        self.frame().builder.emit(Opcode::Return, line);

        self.finish_closure()?;
        self.emit(Opcode::Try);
        Ok(())
    }

    fn class_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected class name")?;
        let name = self.intern_current_lexeme();
        let name_const = self.frame().builder.add_string_constant(name);
        self.emit_u16(Opcode::MakeClass, name_const);

        let mut has_superclass = false;
        if self.matches(TokenKind::Extends)? {
            self.expect(TokenKind::Identifier, "expected superclass name after 'extends'")?;
            self.variable(false)?;
            self.emit(Opcode::Inherit);
            has_superclass = true;
        }
        self.class_stack.push(ClassCtx { has_superclass });

        self.expect(TokenKind::LeftBrace, "expected '{' before class body")?;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member()?;
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close class body")?;
        self.class_stack.pop();

        self.define_variable(name);
        Ok(())
    }

    fn class_member(&mut self) -> Result<(), Panic> {
        let is_static = self.matches(TokenKind::Static)?;
        let is_pub = self.matches(TokenKind::Pub)?;
        let _is_pri = self.matches(TokenKind::Pri)?;

        if self.matches(TokenKind::Var)? {
            self.expect(TokenKind::Identifier, "expected field name")?;
            let field_name = self.intern_current_lexeme();
            if self.matches(TokenKind::Equal)? {
                self.expression()?;
            } else {
                self.emit(Opcode::LoadNull);
            }
            self.expect(TokenKind::Semicolon, "expected ';' after field declaration")?;
            let const_index = self.frame().builder.add_string_constant(field_name);
            let op = if is_static {
                Opcode::DefineStaticField
            } else if is_pub {
                Opcode::DefinePubField
            } else {
                Opcode::DefinePriField
            };
            self.emit_u16(op, const_index);
            return Ok(());
        }

        self.expect(TokenKind::Def, "expected 'def' or 'var' in class body")?;
        self.expect(TokenKind::Identifier, "expected method name")?;
        let method_name = self.intern_current_lexeme();
        self.compile_function(method_name, true)?;
        let const_index = self.frame().builder.add_string_constant(method_name);
        let op = if is_static {
            Opcode::DefineStaticMethod
        } else if is_pub {
            Opcode::DefinePubMethod
        } else {
            Opcode::DefinePriMethod
        };
        self.emit_u16(op, const_index);
        Ok(())
    }

    /// `enum Name { A, B = expr, C }` (spec.md §4.3's `MakeEnum` opcode):
    /// each member's default value is compiled as an ordinary expression
    /// (or `LoadNull` if omitted) and pushed before `MakeEnum` runs, member
    /// names trailing as raw constant-pool indices the same way
    /// `finish_closure` trails upvalue descriptors after `MakeClosure`.
    fn enum_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected enum name")?;
        let name = self.intern_current_lexeme();
        let name_const = self.frame().builder.add_string_constant(name);

        self.expect(TokenKind::LeftBrace, "expected '{' before enum body")?;
        let mut member_consts: Vec<u16> = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expect(TokenKind::Identifier, "expected enum member name")?;
                let member_name = self.intern_current_lexeme();
                member_consts.push(self.frame().builder.add_string_constant(member_name));
                if self.matches(TokenKind::Equal)? {
                    self.expression()?;
                } else {
                    self.emit(Opcode::LoadNull);
                }
                if !self.matches(TokenKind::Comma)? || self.check(TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightBrace, "expected '}' to close enum body")?;

        let count = u8::try_from(member_consts.len()).expect("too many members in one enum");
        let line = self.line();
        self.frame().builder.emit_u16(Opcode::MakeEnum, name_const, line);
        self.frame().builder.emit_raw_u8(count, line);
        for member_const in member_consts {
            self.frame().builder.emit_raw_u16(member_const, line);
        }
        self.define_variable(name);
        Ok(())
    }

    /// `typedef Name = ...;` (spec.md §4.2: "type syntax is parsed and
    /// discarded"). No type system exists to check against, so this just
    /// consumes tokens to the terminating `;` without emitting anything.
    fn typedef_statement(&mut self) -> Result<(), Panic> {
        while !self.check(TokenKind::Semicolon) && !self.check(TokenKind::Eof) {
            self.advance()?;
        }
        self.expect(TokenKind::Semicolon, "expected ';' after typedef")?;
        Ok(())
    }

    /// `import a::b::c;` or `import a::b::{x, y};` (spec.md §4.7): resolved
    /// and executed entirely at runtime by `ImportModule`/`ImportNamedMembers`
    /// (`vm/import.rs`) — the compiler's only job is to collect the dotted
    /// path's segments (and, for the brace form, the member list) as
    /// constant-pool indices and trail them after the opcode the same way
    /// `enum_statement` trails its member names.
    fn import_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected module name after 'import'")?;
        let mut segments: Vec<u16> = Vec::new();
        let first = self.intern_current_lexeme();
        segments.push(self.frame().builder.add_string_constant(first));

        while self.matches(TokenKind::ColonColon)? {
            if self.matches(TokenKind::LeftBrace)? {
                let mut members: Vec<u16> = Vec::new();
                loop {
                    self.expect(TokenKind::Identifier, "expected member name in import list")?;
                    let member_name = self.intern_current_lexeme();
                    members.push(self.frame().builder.add_string_constant(member_name));
                    if !self.matches(TokenKind::Comma)? {
                        break;
                    }
                }
                self.expect(TokenKind::RightBrace, "expected '}' to close import list")?;
                self.expect(TokenKind::Semicolon, "expected ';' after import statement")?;
                self.emit_import(Opcode::ImportNamedMembers, &segments, &members);
                return Ok(());
            }
            self.expect(TokenKind::Identifier, "expected module name segment after '::'")?;
            let segment = self.intern_current_lexeme();
            segments.push(self.frame().builder.add_string_constant(segment));
        }
        self.expect(TokenKind::Semicolon, "expected ';' after import statement")?;
        self.emit_import(Opcode::ImportModule, &segments, &[]);
        Ok(())
    }

    fn emit_import(&mut self, op: Opcode, segments: &[u16], members: &[u16]) {
        let line = self.line();
        self.frame().builder.emit(op, line);
        let seg_count = u8::try_from(segments.len()).expect("too many import path segments");
        self.frame().builder.emit_raw_u8(seg_count, line);
        for &segment in segments {
            self.frame().builder.emit_raw_u16(segment, line);
        }
        if op == Opcode::ImportNamedMembers {
            let member_count = u8::try_from(members.len()).expect("too many imported members");
            self.frame().builder.emit_raw_u8(member_count, line);
            for &member in members {
                self.frame().builder.emit_raw_u16(member, line);
            }
        }
    }

    fn echo_statement(&mut self) -> Result<(), Panic> {
        let mut count: u16 = 0;
        if !self.check(TokenKind::Semicolon) {
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::Semicolon, "expected ';' after echo statement")?;
        self.emit_u16(Opcode::Echo, count);
        Ok(())
    }

    fn assert_statement(&mut self) -> Result<(), Panic> {
        self.expression()?;
        if self.matches(TokenKind::Comma)? {
            self.expression()?;
        } else {
            self.emit(Opcode::LoadNull);
        }
        self.expect(TokenKind::Semicolon, "expected ';' after assert statement")?;
        self.emit(Opcode::AssertFailed);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), Panic> {
        self.expression()?;
        let line = self.line();
        let then_jump = self.frame().builder.emit_jump(Opcode::PopJumpIfFalse, line);
        self.expect(TokenKind::LeftBrace, "expected '{' after if condition")?;
        self.begin_scope();
        self.block()?;
        self.end_scope();

        if self.matches(TokenKind::Else)? {
            let line = self.line();
            let else_jump = self.frame().builder.emit_jump(Opcode::Jump, line);
            self.frame().builder.patch_jump(then_jump);
            if self.matches(TokenKind::If)? {
                self.if_statement()?;
            } else {
                self.expect(TokenKind::LeftBrace, "expected '{' after else")?;
                self.begin_scope();
                self.block()?;
                self.end_scope();
            }
            self.frame().builder.patch_jump(else_jump);
        } else {
            self.frame().builder.patch_jump(then_jump);
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), Panic> {
        let loop_start = self.frame().builder.offset();
        let depth = self.frame().scope.depth;
        self.frame().loop_stack.push(LoopCtx { start: loop_start, depth, break_jumps: Vec::new() });

        self.expression()?;
        let line = self.line();
        let exit_jump = self.frame().builder.emit_jump(Opcode::PopJumpIfFalse, line);
        self.expect(TokenKind::LeftBrace, "expected '{' after while condition")?;
        self.begin_scope();
        self.block()?;
        self.end_scope();

        let line = self.line();
        self.frame().builder.emit_jump_back(Opcode::JumpBack, loop_start, line);
        self.frame().builder.patch_jump(exit_jump);

        let ctx = self.frame().loop_stack.pop().unwrap();
        for label in ctx.break_jumps {
            self.frame().builder.patch_jump(label);
        }
        Ok(())
    }

    fn loop_statement(&mut self) -> Result<(), Panic> {
        let loop_start = self.frame().builder.offset();
        let depth = self.frame().scope.depth;
        self.frame().loop_stack.push(LoopCtx { start: loop_start, depth, break_jumps: Vec::new() });

        self.expect(TokenKind::LeftBrace, "expected '{' after 'loop'")?;
        self.begin_scope();
        self.block()?;
        self.end_scope();

        let line = self.line();
        self.frame().builder.emit_jump_back(Opcode::JumpBack, loop_start, line);

        let ctx = self.frame().loop_stack.pop().unwrap();
        for label in ctx.break_jumps {
            self.frame().builder.patch_jump(label);
        }
        Ok(())
    }

    /// Desugars to: evaluate and stash the iterator in a hidden local slot,
    /// reserve the loop variable's slot with a `null` placeholder, then each
    /// iteration overwrites that slot via `SetLocal` rather than leaving a
    /// fresh value sitting on top of the stack (which would desynchronize
    /// every later local's slot index from its compile-time number).
    fn for_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected loop variable name")?;
        let var_name = self.intern_current_lexeme();
        self.expect(TokenKind::In, "expected 'in' after for-loop variable")?;
        self.expression()?;
        self.emit(Opcode::GetIterator);

        self.begin_scope();
        let iter_name = self.heap.intern_str("$iter");
        let iter_slot = self.frame().scope.declare_local(iter_name).ok_or_else(|| self.error("too many locals"))?;

        self.emit(Opcode::LoadNull);
        let var_slot = self.frame().scope.declare_local(var_name).ok_or_else(|| self.error("too many locals"))?;

        let loop_start = self.frame().builder.offset();
        let depth = self.frame().scope.depth;
        self.frame().loop_stack.push(LoopCtx { start: loop_start, depth, break_jumps: Vec::new() });

        self.emit_u8(Opcode::GetLocal, iter_slot);
        self.emit(Opcode::GetNextFromIterator);
        let line = self.line();
        let exit_jump = self.frame().builder.emit_jump(Opcode::JumpIfErr, line);
        self.emit_u8(Opcode::SetLocal, var_slot);
        self.emit(Opcode::Pop);

        self.expect(TokenKind::LeftBrace, "expected '{' after for-loop header")?;
        self.begin_scope();
        self.block()?;
        self.end_scope();

        let line = self.line();
        self.frame().builder.emit_jump_back(Opcode::JumpBack, loop_start, line);
        self.frame().builder.patch_jump(exit_jump);
        self.emit(Opcode::Pop);

        let ctx = self.frame().loop_stack.pop().unwrap();
        for label in ctx.break_jumps {
            self.frame().builder.patch_jump(label);
        }
        self.end_scope();
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Semicolon, "expected ';' after 'break'")?;
        let line = self.line();
        let label = self.frame().builder.emit_jump(Opcode::Jump, line);
        match self.frame().loop_stack.last_mut() {
            Some(ctx) => ctx.break_jumps.push(label),
            None => return Err(self.error("'break' outside a loop")),
        }
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Semicolon, "expected ';' after 'continue'")?;
        let Some(ctx) = self.frame().loop_stack.last() else {
            return Err(self.error("'continue' outside a loop"));
        };
        let (start, _depth) = (ctx.start, ctx.depth);
        let line = self.line();
        self.frame().builder.emit_jump_back(Opcode::JumpBack, start, line);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), Panic> {
        if self.matches(TokenKind::Semicolon)? {
            self.emit(Opcode::LoadNull);
        } else {
            self.expression()?;
            self.expect(TokenKind::Semicolon, "expected ';' after return value")?;
        }
        self.emit(Opcode::Return);
        Ok(())
    }

    fn with_statement(&mut self) -> Result<(), Panic> {
        self.expression()?;
        self.emit(Opcode::StartWith);
        self.expect(TokenKind::LeftBrace, "expected '{' after with-block expression")?;
        self.begin_scope();
        self.block()?;
        self.end_scope();
        self.emit(Opcode::EndWith);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), Panic> {
        self.expression()?;
        self.expect(TokenKind::Semicolon, "expected ';' after expression statement")?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn error(&self, message: &str) -> Panic {
        Panic::new(PanicKind::SyntaxError, message.to_string()).at(self.source_id, self.current.line)
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<(), Panic> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, min_prec: Precedence) -> Result<(), Panic> {
        self.advance()?;
        let can_assign = min_prec <= Precedence::Assignment;
        self.prefix(can_assign)?;

        while min_prec <= self.infix_precedence(self.current.kind) {
            self.advance()?;
            self.infix(can_assign)?;
        }

        if can_assign && self.matches(TokenKind::Equal)? {
            return Err(self.error("invalid assignment target"));
        }
        Ok(())
    }

    fn infix_precedence(&self, kind: TokenKind) -> Precedence {
        use TokenKind as T;
        match kind {
            T::Hook | T::HookHook | T::BangBang => Precedence::Ternary,
            T::BarBar => Precedence::Or,
            T::AmpAmp => Precedence::And,
            T::EqualEqual | T::BangEqual => Precedence::Equality,
            T::Less | T::LessEqual | T::Greater | T::GreaterEqual | T::In => Precedence::Comparison,
            T::Bar | T::Caret => Precedence::BitOr,
            T::Amp | T::LessLess | T::GreaterGreater => Precedence::BitAnd,
            T::Plus | T::Minus => Precedence::Term,
            T::Star | T::Slash | T::SlashSlash | T::Percent | T::Mod | T::Rem => Precedence::Factor,
            T::StarStar => Precedence::Power,
            T::LeftParen | T::LeftBracket | T::Dot | T::Colon | T::ColonColon => Precedence::Postfix,
            _ => Precedence::None,
        }
    }

    fn prefix(&mut self, can_assign: bool) -> Result<(), Panic> {
        use TokenKind as T;
        match self.previous.kind {
            T::Int | T::HexInt | T::OctalInt | T::BinaryInt => self.integer_literal(),
            T::Float => self.float_literal(),
            T::True => {
                self.emit(Opcode::LoadTrue);
                Ok(())
            }
            T::False => {
                self.emit(Opcode::LoadFalse);
                Ok(())
            }
            T::Null => {
                self.emit(Opcode::LoadNull);
                Ok(())
            }
            T::String | T::EscapedString | T::RawString => self.string_literal(),
            T::StringFragment => self.interpolated_string(),
            T::Identifier => self.variable(can_assign),
            T::SelfKw => {
                self.emit(Opcode::GetLocal0);
                Ok(())
            }
            T::Super => self.super_access(),
            T::Try => self.try_expression(),
            T::LeftParen => {
                self.expression()?;
                self.expect(T::RightParen, "expected ')' after expression")
            }
            T::LeftBracket => self.vector_literal(),
            T::Minus => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::UnaryMinus);
                Ok(())
            }
            T::Plus => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::UnaryPlus);
                Ok(())
            }
            T::Bang => {
                self.parse_precedence(Precedence::Unary)?;
                self.emit(Opcode::UnaryBang);
                Ok(())
            }
            other => Err(self.error(&format!("unexpected token {other:?} in expression position"))),
        }
    }

    fn infix(&mut self, can_assign: bool) -> Result<(), Panic> {
        use TokenKind as T;
        match self.previous.kind {
            T::Plus => self.binary(Opcode::BinaryPlus, Precedence::Term),
            T::Minus => self.binary(Opcode::BinaryMinus, Precedence::Term),
            T::Star => self.binary(Opcode::BinaryStar, Precedence::Factor),
            T::Slash => self.binary(Opcode::BinarySlash, Precedence::Factor),
            T::SlashSlash => self.binary(Opcode::BinarySlashSlash, Precedence::Factor),
            T::Percent | T::Rem => self.binary(Opcode::BinaryPercent, Precedence::Factor),
            T::Mod => self.binary(Opcode::BinaryMod, Precedence::Factor),
            T::StarStar => self.binary_right_assoc(Opcode::BinaryStarStar, Precedence::Power),
            T::EqualEqual => self.binary(Opcode::BinaryEqualEqual, Precedence::Equality),
            T::BangEqual => self.binary(Opcode::BinaryBangEqual, Precedence::Equality),
            T::Less => self.binary(Opcode::BinaryLess, Precedence::Comparison),
            T::LessEqual => self.binary(Opcode::BinaryLessEqual, Precedence::Comparison),
            T::Greater => self.binary(Opcode::BinaryGreater, Precedence::Comparison),
            T::GreaterEqual => self.binary(Opcode::BinaryGreaterEqual, Precedence::Comparison),
            T::In => self.binary(Opcode::BinaryIn, Precedence::Comparison),
            T::Bar => self.binary(Opcode::BinaryBar, Precedence::BitOr),
            T::Caret => self.binary(Opcode::BinaryCaret, Precedence::BitOr),
            T::Amp => self.binary(Opcode::BinaryAmp, Precedence::BitAnd),
            T::LessLess => self.binary(Opcode::BinaryLessLess, Precedence::BitAnd),
            T::GreaterGreater => self.binary(Opcode::BinaryGreaterGreater, Precedence::BitAnd),
            T::AmpAmp => self.logical_and(),
            T::BarBar => self.logical_or(),
            T::LeftParen => self.call_expression(),
            T::Dot => self.field_access(can_assign),
            T::Colon => self.method_call(),
            T::ColonColon => self.module_member_access(),
            T::LeftBracket => self.index_access(can_assign),
            other => Err(self.error(&format!("unexpected infix token {other:?}"))),
        }
    }

    fn binary(&mut self, op: Opcode, prec: Precedence) -> Result<(), Panic> {
        let next = Precedence::from_u8(prec.as_u8() + 1);
        self.parse_precedence(next)?;
        self.emit(op);
        Ok(())
    }

    fn binary_right_assoc(&mut self, op: Opcode, prec: Precedence) -> Result<(), Panic> {
        self.parse_precedence(prec)?;
        self.emit(op);
        Ok(())
    }

    fn logical_and(&mut self) -> Result<(), Panic> {
        let line = self.line();
        let end_jump = self.frame().builder.emit_jump(Opcode::JumpIfFalse, line);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.frame().builder.patch_jump(end_jump);
        Ok(())
    }

    fn logical_or(&mut self) -> Result<(), Panic> {
        let line = self.line();
        let end_jump = self.frame().builder.emit_jump(Opcode::JumpIfTrue, line);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.frame().builder.patch_jump(end_jump);
        Ok(())
    }

    fn call_expression(&mut self) -> Result<(), Panic> {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after call arguments")?;
        self.emit_u8(Opcode::CallValue, argc);
        Ok(())
    }

    fn field_access(&mut self, can_assign: bool) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected field name after '.'")?;
        let name = self.intern_current_lexeme();
        let const_index = self.frame().builder.add_string_constant(name);
        if can_assign && self.matches(TokenKind::Equal)? {
            self.expression()?;
            self.emit_u16(Opcode::SetField, const_index);
        } else {
            self.emit_u16(Opcode::GetField, const_index);
        }
        Ok(())
    }

    /// `receiver:method(...)` (spec.md §4.1's postfix `:` precedence level):
    /// sugar for fetching the bound method through the same `GetField` path
    /// as `receiver.method` and immediately calling it, so the VM needs no
    /// separate method-call opcode.
    fn method_call(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected method name after ':'")?;
        let name = self.intern_current_lexeme();
        let const_index = self.frame().builder.add_string_constant(name);
        self.emit_u16(Opcode::GetField, const_index);
        self.expect(TokenKind::LeftParen, "expected '(' after method name")?;
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after call arguments")?;
        self.emit_u8(Opcode::CallValue, argc);
        Ok(())
    }

    /// `module::member` / `EnumName::Variant` (spec.md §4.1's `::` postfix
    /// level): read-only lookup, unlike `.`'s `GetField`/`SetField` pair —
    /// neither a module's nor an enum's members are assignable from outside.
    fn module_member_access(&mut self) -> Result<(), Panic> {
        self.expect(TokenKind::Identifier, "expected name after '::'")?;
        let name = self.intern_current_lexeme();
        let const_index = self.frame().builder.add_string_constant(name);
        self.emit_u16(Opcode::GetMember, const_index);
        Ok(())
    }

    fn index_access(&mut self, can_assign: bool) -> Result<(), Panic> {
        self.expression()?;
        self.expect(TokenKind::RightBracket, "expected ']' after index expression")?;
        if can_assign && self.matches(TokenKind::Equal)? {
            self.expression()?;
            self.emit(Opcode::SetIndex);
        } else {
            self.emit(Opcode::GetIndex);
        }
        Ok(())
    }

    /// `super.method(...)` / `super.method` (spec.md §4.2's copy-down
    /// inheritance still leaves `super` meaningful for a subclass that wants
    /// its superclass's original, un-overridden method body).
    fn super_access(&mut self) -> Result<(), Panic> {
        if !self.class_stack.last().is_some_and(|c| c.has_superclass) {
            return Err(self.error("'super' can only be used inside a class with 'extends'"));
        }
        self.expect(TokenKind::Dot, "expected '.' after 'super'")?;
        self.expect(TokenKind::Identifier, "expected superclass method name after 'super.'")?;
        let name = self.intern_current_lexeme();
        let const_index = self.frame().builder.add_string_constant(name);
        self.emit(Opcode::GetLocal0);
        self.emit_u16(Opcode::GetSuperMethod, const_index);
        if self.matches(TokenKind::LeftParen)? {
            let mut argc: u8 = 0;
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.expression()?;
                    argc += 1;
                    if !self.matches(TokenKind::Comma)? {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RightParen, "expected ')' after call arguments")?;
            self.emit_u8(Opcode::CallValue, argc);
        }
        Ok(())
    }

    fn integer_literal(&mut self) -> Result<(), Panic> {
        let lexeme: String = self.previous.lexeme.chars().filter(|c| *c != '_').collect();
        let value = match self.previous.kind {
            TokenKind::HexInt => i64::from_str_radix(lexeme.trim_start_matches("0x").trim_start_matches("0X"), 16),
            TokenKind::OctalInt => i64::from_str_radix(lexeme.trim_start_matches("0o").trim_start_matches("0O"), 8),
            TokenKind::BinaryInt => i64::from_str_radix(lexeme.trim_start_matches("0b").trim_start_matches("0B"), 2),
            _ => lexeme.parse::<i64>(),
        }
        .map_err(|_| self.error("invalid integer literal"))?;
        self.emit_constant(Value::I64(value));
        Ok(())
    }

    fn float_literal(&mut self) -> Result<(), Panic> {
        let lexeme: String = self.previous.lexeme.chars().filter(|c| *c != '_').collect();
        let value: f64 = lexeme.parse().map_err(|_| self.error("invalid float literal"))?;
        self.emit_constant(Value::F64(value));
        Ok(())
    }

    fn string_literal(&mut self) -> Result<(), Panic> {
        let raw = self.previous.lexeme;
        let inner = &raw[1..raw.len() - 1];
        let unescaped = if self.previous.kind == TokenKind::EscapedString { unescape(inner) } else { inner.to_string() };
        let id = self.heap.intern_str(&unescaped);
        self.emit_constant(Value::Obj(id));
        Ok(())
    }

    /// `"text${expr}more${expr;spec}tail"` (spec.md §4.1): the lexer hands
    /// back alternating fragment and embedded-expression tokens, each
    /// fragment already delimited at `${`/`}`/the closing quote. Emits one
    /// constant per literal fragment and one `Stringify`/`Format` per
    /// embedded expression, then a single `ConcatStrings` over the lot.
    /// `self.previous` is the initial `StringFragment` token on entry, set
    /// by `parse_precedence`'s dispatch into `prefix`.
    fn interpolated_string(&mut self) -> Result<(), Panic> {
        let mut count: u8 = 0;
        self.emit_fragment_constant(self.previous.lexeme, true, false);
        count += 1;
        loop {
            self.parse_precedence(Precedence::Assignment)?;
            if self.check(TokenKind::Semicolon) {
                self.lexer.enter_format_specifier_mode();
                self.advance()?;
                let spec_text = self.current.lexeme.to_string();
                self.advance()?;
                let spec_id = self.heap.intern_str(&spec_text);
                self.emit_constant(Value::Obj(spec_id));
                self.emit(Opcode::Format);
            } else {
                self.emit(Opcode::Stringify);
            }
            count += 1;
            let is_final = self.current.kind == TokenKind::StringFragmentFinal;
            self.emit_fragment_constant(self.current.lexeme, false, is_final);
            count += 1;
            self.advance()?;
            if is_final {
                break;
            }
        }
        self.emit_u8(Opcode::ConcatStrings, count);
        Ok(())
    }

    /// Strips the delimiters a fragment token's raw lexeme carries (the
    /// opening `"` on the first fragment, the trailing `${`/closing `"` on
    /// every fragment) and runs what's left through the same escape
    /// expansion plain string literals get.
    fn emit_fragment_constant(&mut self, raw: &str, is_initial: bool, is_final: bool) {
        let start = usize::from(is_initial);
        let end_trim = if is_final { 1 } else { 2 };
        let inner = &raw[start..raw.len() - end_trim];
        let unescaped = unescape(inner);
        let id = self.heap.intern_str(&unescaped);
        self.emit_constant(Value::Obj(id));
    }

    fn vector_literal(&mut self) -> Result<(), Panic> {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression()?;
                count += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightBracket, "expected ']' to close vector literal")?;
        self.emit_u8(Opcode::MakeVec, count);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), Panic> {
        let name = self.intern_current_lexeme();

        if let Some(slot) = self.frame().scope.resolve_local(name) {
            if can_assign && self.matches(TokenKind::Equal)? {
                self.expression()?;
                self.emit_u8(Opcode::SetLocal, slot);
            } else {
                self.emit_u8(Opcode::GetLocal, slot);
            }
            return Ok(());
        }

        if let Some(up_index) = self.resolve_upvalue(self.frames.len() - 1, name) {
            if can_assign && self.matches(TokenKind::Equal)? {
                self.expression()?;
                self.emit_u8(Opcode::SetUpvalue, up_index);
            } else {
                self.emit_u8(Opcode::GetUpvalue, up_index);
            }
            return Ok(());
        }

        let const_index = self.frame().builder.add_string_constant(name);
        if can_assign && self.matches(TokenKind::Equal)? {
            self.expression()?;
            self.emit_u16(Opcode::SetGlobal, const_index);
        } else {
            self.emit_u16(Opcode::GetGlobal, const_index);
        }
        Ok(())
    }

    /// Resolves `name` as an upvalue of the function at `frame_index`,
    /// recursively capturing it through every intermediate function compiler
    /// between the definition site and the reference (spec.md §4.2).
    fn resolve_upvalue(&mut self, frame_index: usize, name: HeapId) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing_index = frame_index - 1;
        if let Some(local_slot) = self.frames[enclosing_index].scope.resolve_local(name) {
            self.frames[enclosing_index].scope.mark_captured(local_slot);
            return self.frames[frame_index].scope.add_upvalue(true, local_slot);
        }
        let outer_upvalue = self.resolve_upvalue(enclosing_index, name)?;
        self.frames[frame_index].scope.add_upvalue(false, outer_upvalue)
    }
}

impl Precedence {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Self {
        const TABLE: [Precedence; 14] = [
            Precedence::None,
            Precedence::Assignment,
            Precedence::Ternary,
            Precedence::Or,
            Precedence::And,
            Precedence::Equality,
            Precedence::Comparison,
            Precedence::BitOr,
            Precedence::BitAnd,
            Precedence::Term,
            Precedence::Factor,
            Precedence::Unary,
            Precedence::Power,
            Precedence::Postfix,
        ];
        TABLE[v as usize]
    }
}

/// Expands the subset of spec.md §4.1's escape sequences that don't require
/// the VM's own rune-aware decoding; `\x`/`\u`/`\U` expand straight to the
/// corresponding Unicode scalar value.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('0') => out.push('\0'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('$') => out.push('$'),
            Some('{') => out.push('{'),
            Some('b') => out.push('\u{8}'),
            Some('e') => out.push('\u{1b}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('x') => push_hex_escape(&mut chars, &mut out, 2),
            Some('u') => push_hex_escape(&mut chars, &mut out, 4),
            Some('U') => push_hex_escape(&mut chars, &mut out, 8),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn push_hex_escape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, out: &mut String, digits: usize) {
    let mut code = 0u32;
    for _ in 0..digits {
        if let Some(d) = chars.next().and_then(|c| c.to_digit(16)) {
            code = code * 16 + d;
        }
    }
    if let Some(c) = char::from_u32(code) {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_arithmetic_echo_statement() {
        let mut heap = Heap::new();
        let source_id = SourceId(heap.intern_str("test"));
        let id = Compiler::compile("echo 1 + 2 * 3;", source_id, &mut heap).expect("compiles");
        let HeapData::Function(func) = heap.get(id) else { panic!("expected function") };
        assert!(func.chunk.code.contains(&(Opcode::Echo as u8)));
    }

    #[test]
    fn compiles_function_definition_and_call() {
        let mut heap = Heap::new();
        let source_id = SourceId(heap.intern_str("test"));
        let id = Compiler::compile("def add(a, b) { return a + b; } echo add(1, 2);", source_id, &mut heap)
            .expect("compiles");
        let HeapData::Function(func) = heap.get(id) else { panic!("expected function") };
        assert!(func.chunk.code.contains(&(Opcode::CallValue as u8)));
    }
}
