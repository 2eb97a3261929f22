//! The single-pass bytecode compiler.
//!
//! A recursive-descent parser builds one [`Node`] per declaration and emits
//! it straight into the current function's chunk. Nested functions push a
//! fresh [`FuncState`] onto an explicit stack; upvalue resolution walks that
//! stack instead of chasing parent pointers. Errors accumulate in the chain
//! and parsing keeps going, so one pass can surface several problems.

use std::rc::Rc;

use glua_core::{flags, Closure, ErrorChain, Function, GluaError, UpvalueDesc, Value};
use glua_scanner::{Token, TokenKind};

use crate::ast::{self, BinaryOp, Node, TableEntry, UnaryOp};
use crate::disasm;
use crate::emit::Emitter;
use crate::opcodes::Op;

/// Locals and upvalues are byte-indexed.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARITY: usize = 255;

/// Whether a trailing expression's value should be kept for printing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Script,
    Repl,
}

/// Compile a token stream into the top-level function.
pub fn compile(tokens: &[Token], mode: Mode) -> Result<Function, ErrorChain> {
    let mut compiler = Compiler::new(tokens, mode);
    compiler.compile();
    compiler.finish()
}

/// How a name resolved at a use site.
enum Resolution {
    Local(u8),
    Upvalue(u8),
    Global,
}

struct Local {
    name: String,
    depth: usize,
}

struct UpvalueInfo {
    name: String,
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. The innermost function being compiled is
/// the last entry of `Compiler::funcs`.
struct FuncState {
    emitter: Emitter,
    name: String,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: usize,
}

impl FuncState {
    /// Slot 0 is the callee: unnamed for the top-level script, the
    /// function's own name otherwise so the body can recurse through it.
    fn new(name: &str, parameters: &[String]) -> Self {
        let mut locals = vec![Local {
            name: name.to_string(),
            depth: 0,
        }];
        for parameter in parameters {
            locals.push(Local {
                name: parameter.clone(),
                depth: 0,
            });
        }
        FuncState {
            emitter: Emitter::new(),
            name: name.to_string(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct Compiler<'t> {
    tokens: &'t [Token],
    pos: usize,
    eof: Token,
    funcs: Vec<FuncState>,
    mode: Mode,
    errors: ErrorChain,
}

impl<'t> Compiler<'t> {
    fn new(tokens: &'t [Token], mode: Mode) -> Self {
        Compiler {
            tokens,
            pos: 0,
            eof: Token::eof(0),
            funcs: vec![FuncState::new("", &[])],
            mode,
            errors: ErrorChain::new(),
        }
    }

    fn compile(&mut self) {
        while !self.check(TokenKind::Eof) {
            let declaration = self.declaration();
            if flags::PRINT_AST {
                eprint!("{}", ast::dump(&declaration));
            }
            self.emit_node(&declaration);
        }
    }

    fn finish(mut self) -> Result<Function, ErrorChain> {
        let function = self.end_function();
        if self.errors.is_empty() {
            Ok(function)
        } else {
            Err(self.errors)
        }
    }

    // --- Token cursor ---

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos + 1).unwrap_or(&self.eof)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn consume(&mut self, kind: TokenKind) {
        if !self.check(kind) {
            self.error(format!("Expected {:?}, found {}", kind, self.current()));
        }
        self.advance();
    }

    fn error(&mut self, message: impl Into<String>) {
        let line = self.current().line;
        self.errors.push(GluaError::compile(message, line));
    }

    // --- Parsing: declarations and statements ---

    fn declaration(&mut self) -> Node {
        let node = match self.current().kind {
            TokenKind::Global => self.global_declaration(),
            TokenKind::Local => self.local_declaration(),
            _ => self.statement(),
        };

        // Semicolons are permitted separators, never required.
        if self.check(TokenKind::Semicolon) {
            self.advance();
        }

        node
    }

    fn global_declaration(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::Global);
        let (names, values) = self.variable_declaration();
        Node::GlobalDecl {
            names,
            values,
            line,
        }
    }

    fn local_declaration(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::Local);
        let (names, values) = self.variable_declaration();
        Node::LocalDecl {
            names,
            values,
            line,
        }
    }

    fn variable_declaration(&mut self) -> (Vec<String>, Vec<Node>) {
        let mut names = vec![self.identifier()];
        while self.check(TokenKind::Comma) {
            self.advance();
            names.push(self.identifier());
        }

        if !self.check(TokenKind::Equal) {
            return (names, Vec::new());
        }
        self.advance();

        let mut values = vec![self.rhs_expression()];
        while self.check(TokenKind::Comma) {
            self.advance();
            values.push(self.rhs_expression());
        }

        (names, values)
    }

    fn statement(&mut self) -> Node {
        let line = self.current().line;
        match self.current().kind {
            TokenKind::Assert => {
                self.advance();
                Node::Assert {
                    value: Box::new(self.expression()),
                    line,
                }
            }
            TokenKind::Function => self.function_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::Do => {
                self.advance();
                let statements = self.block();
                self.consume(TokenKind::End);
                Node::Block { statements, line }
            }
            TokenKind::Return => self.return_statement(),
            _ => self.assignment(),
        }
    }

    fn function_statement(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::Function);
        let name = self.identifier();
        let parameters = self.parameters();

        let mut body = Vec::new();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            body.push(self.declaration());
        }
        self.consume(TokenKind::End);

        Node::FunctionDecl {
            name,
            parameters,
            body,
            line,
        }
    }

    fn parameters(&mut self) -> Vec<String> {
        self.consume(TokenKind::LeftParen);

        let mut parameters = Vec::new();
        while !self.check(TokenKind::RightParen) && !self.check(TokenKind::Eof) {
            parameters.push(self.identifier());
            if self.check(TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }

        self.consume(TokenKind::RightParen);
        parameters
    }

    /// Statements up to the token that closes the enclosing construct. Also
    /// stops at `Eof` so a truncated program cannot loop forever.
    fn block(&mut self) -> Vec<Node> {
        let mut statements = Vec::new();
        loop {
            match self.current().kind {
                TokenKind::End | TokenKind::Else | TokenKind::Eof => return statements,
                _ => statements.push(self.declaration()),
            }
        }
    }

    fn while_statement(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::While);
        let condition = self.expression();
        self.consume(TokenKind::Do);
        let body = self.block();
        self.consume(TokenKind::End);

        Node::While {
            condition: Box::new(condition),
            body,
            line,
        }
    }

    fn for_statement(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::For);
        let variable = self.identifier();
        self.consume(TokenKind::Equal);

        // Only the first return of any call matters here, so these are
        // plain expressions.
        let mut values = vec![self.expression()];
        while self.check(TokenKind::Comma) {
            self.advance();
            values.push(self.expression());
        }

        self.consume(TokenKind::Do);
        let body = self.block();
        self.consume(TokenKind::End);

        Node::For {
            variable,
            values,
            body,
            line,
        }
    }

    fn if_statement(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::If);
        let condition = Box::new(self.expression());
        self.consume(TokenKind::Then);
        let then_branch = self.block();

        let else_branch = if self.check(TokenKind::Else) {
            self.advance();
            Some(self.block())
        } else {
            None
        };
        self.consume(TokenKind::End);

        Node::If {
            condition,
            then_branch,
            else_branch,
            line,
        }
    }

    fn return_statement(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::Return);

        // A bare `return` returns a single nil.
        if matches!(
            self.current().kind,
            TokenKind::End | TokenKind::Else | TokenKind::Semicolon | TokenKind::Eof
        ) {
            return Node::Return {
                values: vec![Node::Literal {
                    value: Value::Nil,
                    line,
                }],
                line,
            };
        }

        let mut values = vec![self.expression()];
        while self.check(TokenKind::Comma) {
            self.advance();
            values.push(self.expression());
        }

        Node::Return { values, line }
    }

    /// Either an expression statement or, once `=` or `,` shows up, a
    /// multiple assignment whose first target was parsed as an rvalue.
    fn assignment(&mut self) -> Node {
        let line = self.current().line;
        let expression = self.expression();

        if self.check(TokenKind::Equal) || self.check(TokenKind::Comma) {
            self.multiple_assignment(expression, line)
        } else {
            Node::ExpressionStmt {
                expression: Box::new(expression),
                line,
            }
        }
    }

    fn multiple_assignment(&mut self, first: Node, line: u32) -> Node {
        let mut targets = vec![self.lvalue(first)];
        while self.check(TokenKind::Comma) {
            self.advance();
            let target = self.expression();
            targets.push(self.lvalue(target));
        }

        self.consume(TokenKind::Equal);

        let mut values = vec![self.rhs_expression()];
        while self.check(TokenKind::Comma) {
            self.advance();
            values.push(self.rhs_expression());
        }

        Node::MultipleAssignment {
            targets,
            values,
            line,
        }
    }

    fn lvalue(&mut self, node: Node) -> Node {
        let line = node.line();
        match ast::to_lvalue(node) {
            Ok(target) => target,
            Err(error) => {
                self.errors.push(error);
                // Placeholder so emission stays balanced; the error above
                // prevents the program from ever running.
                Node::VariableAssignment {
                    name: String::new(),
                    line,
                }
            }
        }
    }

    /// An expression in RHS position: calls expand their full return
    /// sequence.
    fn rhs_expression(&mut self) -> Node {
        let expression = self.expression();
        ast::expand_calls(expression)
    }

    fn identifier(&mut self) -> String {
        let text = self.current().text.clone();
        self.consume(TokenKind::Identifier);
        text
    }

    // --- Parsing: expressions ---

    fn expression(&mut self) -> Node {
        self.logic_or()
    }

    fn logic_or(&mut self) -> Node {
        let mut node = self.logic_and();
        while self.check(TokenKind::Or) {
            let line = self.current().line;
            self.advance();
            let rhs = self.logic_and();
            node = Node::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
                line,
            };
        }
        node
    }

    fn logic_and(&mut self) -> Node {
        let mut node = self.comparison();
        while self.check(TokenKind::And) {
            let line = self.current().line;
            self.advance();
            let rhs = self.comparison();
            node = Node::Binary {
                op: BinaryOp::And,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
                line,
            };
        }
        node
    }

    fn comparison(&mut self) -> Node {
        let mut node = self.term();
        if self.comparison_op().is_none() {
            return node;
        }

        let mut chained = false;
        while let Some(op) = self.comparison_op() {
            if chained {
                // `a < b < c` would compare a boolean to a number at
                // runtime; reject it here instead.
                self.error("Comparison chains are not supported");
            }
            let line = self.current().line;
            self.advance();
            let rhs = self.term();
            node = Node::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
                line,
            };
            chained = true;
        }
        node
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.current().kind {
            TokenKind::EqualEqual => Some(BinaryOp::Equals),
            TokenKind::TildeEqual => Some(BinaryOp::NotEquals),
            TokenKind::Less => Some(BinaryOp::Less),
            TokenKind::LessEqual => Some(BinaryOp::LessEqual),
            TokenKind::Greater => Some(BinaryOp::Greater),
            TokenKind::GreaterEqual => Some(BinaryOp::GreaterEqual),
            _ => None,
        }
    }

    fn term(&mut self) -> Node {
        let mut node = self.factor();
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => return node,
            };
            let line = self.current().line;
            self.advance();
            let rhs = self.factor();
            node = Node::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
                line,
            };
        }
    }

    fn factor(&mut self) -> Node {
        let mut node = self.unary();
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                _ => return node,
            };
            let line = self.current().line;
            self.advance();
            let rhs = self.unary();
            node = Node::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
                line,
            };
        }
    }

    fn unary(&mut self) -> Node {
        let line = self.current().line;
        match self.current().kind {
            TokenKind::Minus => {
                self.advance();
                Node::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(self.unary()),
                    line,
                }
            }
            TokenKind::Bang => {
                self.advance();
                Node::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(self.unary()),
                    line,
                }
            }
            _ => self.exponent(),
        }
    }

    fn exponent(&mut self) -> Node {
        let base = self.call_expression();
        if self.check(TokenKind::Caret) {
            let line = self.current().line;
            self.advance();
            let power = self.call_expression();
            Node::Binary {
                op: BinaryOp::Power,
                lhs: Box::new(base),
                rhs: Box::new(power),
                line,
            }
        } else {
            base
        }
    }

    fn call_expression(&mut self) -> Node {
        let mut node = self.primary();
        loop {
            let line = self.current().line;
            match self.current().kind {
                TokenKind::Dot => {
                    self.advance();
                    let attribute = self.identifier();
                    node = Node::TableAccess {
                        table: Box::new(node),
                        key: Box::new(Node::Literal {
                            value: Value::string(attribute),
                            line,
                        }),
                        line,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression();
                    self.consume(TokenKind::RightBracket);
                    node = Node::TableAccess {
                        table: Box::new(node),
                        key: Box::new(key),
                        line,
                    };
                }
                TokenKind::LeftParen => {
                    let arguments = self.arguments();
                    node = Node::Call {
                        callee: Box::new(node),
                        arguments,
                        is_assignment: false,
                        line,
                    };
                }
                _ => return node,
            }
        }
    }

    fn arguments(&mut self) -> Vec<Node> {
        self.consume(TokenKind::LeftParen);

        let mut arguments = Vec::new();
        while !self.check(TokenKind::RightParen) && !self.check(TokenKind::Eof) {
            arguments.push(self.expression());
            if !self.check(TokenKind::RightParen) {
                self.consume(TokenKind::Comma);
            }
        }

        self.consume(TokenKind::RightParen);
        arguments
    }

    fn primary(&mut self) -> Node {
        let line = self.current().line;
        match self.current().kind {
            TokenKind::True => {
                self.advance();
                Node::Literal {
                    value: Value::Boolean(true),
                    line,
                }
            }
            TokenKind::False => {
                self.advance();
                Node::Literal {
                    value: Value::Boolean(false),
                    line,
                }
            }
            TokenKind::Nil => {
                self.advance();
                Node::Literal {
                    value: Value::Nil,
                    line,
                }
            }
            TokenKind::Number => {
                let text = self.current().text.clone();
                self.advance();
                match text.parse::<f64>() {
                    Ok(number) => Node::Literal {
                        value: Value::Number(number),
                        line,
                    },
                    Err(_) => {
                        self.errors.push(GluaError::compile(
                            format!("Cannot parse number: {text}"),
                            line,
                        ));
                        Node::Literal {
                            value: Value::Nil,
                            line,
                        }
                    }
                }
            }
            TokenKind::String => {
                let text = self.current().text.clone();
                self.advance();
                Node::Literal {
                    value: Value::string(text),
                    line,
                }
            }
            TokenKind::Identifier => {
                let name = self.current().text.clone();
                self.advance();
                Node::Variable { name, line }
            }
            TokenKind::LeftBrace => self.table_literal(),
            TokenKind::LeftParen => {
                self.advance();
                let node = self.expression();
                self.consume(TokenKind::RightParen);
                node
            }
            _ => {
                self.error(format!("Unexpected token: {}", self.current()));
                self.advance();
                Node::Literal {
                    value: Value::Nil,
                    line,
                }
            }
        }
    }

    fn table_literal(&mut self) -> Node {
        let line = self.current().line;
        self.consume(TokenKind::LeftBrace);

        let mut entries = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            entries.push(self.pair());
        }
        self.consume(TokenKind::RightBrace);

        Node::TableLiteral { entries, line }
    }

    fn pair(&mut self) -> TableEntry {
        let entry = if self.check(TokenKind::LeftBracket) {
            self.advance();
            let key = self.expression();
            self.consume(TokenKind::RightBracket);
            self.consume(TokenKind::Equal);
            let value = self.expression();
            TableEntry::Pair { key, value }
        } else if self.check(TokenKind::Identifier) && self.peek().kind == TokenKind::Equal {
            let line = self.current().line;
            let name = self.identifier();
            self.consume(TokenKind::Equal);
            let value = self.expression();
            TableEntry::Pair {
                key: Node::Literal {
                    value: Value::string(name),
                    line,
                },
                value,
            }
        } else {
            TableEntry::Positional(self.expression())
        };

        if self.check(TokenKind::Comma) {
            self.advance();
        }
        entry
    }

    // --- Emission ---

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn emit_op(&mut self, op: Op) {
        self.func().emitter.emit_op(op);
    }

    fn emit_byte(&mut self, byte: u8) {
        self.func().emitter.emit_byte(byte);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.func().emitter.add_constant(value) {
            Ok(index) => index,
            Err(error) => {
                self.errors.push(error);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        if let Err(error) = self.func().emitter.emit_constant(value) {
            self.errors.push(error);
        }
    }

    fn patch_jump(&mut self, source: usize, dest: usize) {
        if let Err(error) = self.func().emitter.patch_jump(source, dest) {
            self.errors.push(error);
        }
    }

    fn emit_node(&mut self, node: &Node) {
        self.func().emitter.set_line(node.line());
        match node {
            Node::Literal { value, .. } => self.emit_literal(value),

            Node::Variable { name, .. } => match self.resolve(name) {
                Resolution::Local(slot) => {
                    self.emit_op(Op::GetLocal);
                    self.emit_byte(slot);
                }
                Resolution::Upvalue(index) => {
                    self.emit_op(Op::GetUpvalue);
                    self.emit_byte(index);
                }
                Resolution::Global => {
                    let name = self.make_constant(Value::string(name.as_str()));
                    self.emit_op(Op::GetGlobal);
                    self.emit_byte(name);
                }
            },

            Node::VariableAssignment { name, .. } => match self.resolve(name) {
                Resolution::Local(slot) => {
                    self.emit_op(Op::SetLocal);
                    self.emit_byte(slot);
                }
                Resolution::Upvalue(index) => {
                    self.emit_op(Op::SetUpvalue);
                    self.emit_byte(index);
                }
                Resolution::Global => {
                    let name = self.make_constant(Value::string(name.as_str()));
                    self.emit_op(Op::SetGlobal);
                    self.emit_byte(name);
                }
            },

            Node::TableAccess { table, key, .. } => {
                self.emit_node(table);
                self.emit_node(key);
                self.emit_op(Op::GetTable);
            }

            Node::TableAssignment { table, key, .. } => {
                self.emit_node(table);
                self.emit_node(key);
                self.emit_op(Op::SetTable);
            }

            Node::TableLiteral { entries, .. } => {
                self.emit_op(Op::CreateTable);
                // Keyed pairs first, positional values after; the table
                // sits on top of the stack throughout.
                for entry in entries {
                    if let TableEntry::Pair { key, value } = entry {
                        self.emit_node(key);
                        self.emit_node(value);
                        self.emit_op(Op::InitTable);
                    }
                }
                for entry in entries {
                    if let TableEntry::Positional(value) = entry {
                        self.emit_node(value);
                        self.emit_op(Op::InsertTable);
                    }
                }
            }

            Node::Binary { op, lhs, rhs, .. } => {
                self.emit_node(lhs);
                self.emit_node(rhs);
                match op {
                    BinaryOp::Add => self.emit_op(Op::Add),
                    BinaryOp::Subtract => self.emit_op(Op::Subtract),
                    BinaryOp::Multiply => self.emit_op(Op::Multiply),
                    BinaryOp::Divide => self.emit_op(Op::Divide),
                    BinaryOp::Power => self.emit_op(Op::Power),
                    BinaryOp::Equals => self.emit_op(Op::Equals),
                    BinaryOp::Less => self.emit_op(Op::Less),
                    BinaryOp::Greater => self.emit_op(Op::Greater),
                    BinaryOp::And => self.emit_op(Op::And),
                    BinaryOp::Or => self.emit_op(Op::Or),
                    BinaryOp::NotEquals => {
                        self.emit_op(Op::Equals);
                        self.emit_op(Op::Not);
                    }
                    BinaryOp::LessEqual => {
                        self.emit_op(Op::Greater);
                        self.emit_op(Op::Not);
                    }
                    BinaryOp::GreaterEqual => {
                        self.emit_op(Op::Less);
                        self.emit_op(Op::Not);
                    }
                }
            }

            Node::Unary { op, operand, .. } => {
                self.emit_node(operand);
                match op {
                    UnaryOp::Negate => self.emit_op(Op::Negate),
                    UnaryOp::Not => self.emit_op(Op::Not),
                }
            }

            Node::Call {
                callee,
                arguments,
                is_assignment,
                ..
            } => {
                self.emit_node(callee);
                for argument in arguments {
                    self.emit_node(argument);
                }
                if arguments.len() > MAX_ARITY {
                    self.error("Too many arguments in call");
                }
                self.emit_op(Op::Call);
                self.emit_byte(arguments.len() as u8);
                self.emit_byte(*is_assignment as u8);
            }

            Node::ExpressionStmt { expression, .. } => {
                self.emit_node(expression);
                self.emit_op(Op::Pop);
            }

            Node::Assert { value, .. } => {
                self.emit_node(value);
                self.emit_op(Op::Assert);
            }

            Node::MultipleAssignment {
                targets, values, ..
            } => {
                self.emit_op(Op::AssignStart);
                for value in values {
                    self.emit_node(value);
                }
                for target in targets {
                    self.emit_node(target);
                }
                self.emit_op(Op::AssignCleanup);
            }

            Node::GlobalDecl { names, values, .. } => {
                self.emit_op(Op::AssignStart);
                for value in values {
                    self.emit_node(value);
                }
                for name in names {
                    let name = self.make_constant(Value::string(name.as_str()));
                    self.emit_op(Op::SetGlobal);
                    self.emit_byte(name);
                }
                self.emit_op(Op::AssignCleanup);
            }

            Node::LocalDecl { names, values, .. } => {
                if names.len() > MAX_ARITY {
                    self.error("Too many names in local declaration");
                }
                self.emit_op(Op::LocalAllocate);
                self.emit_byte(names.len() as u8);
                for value in values {
                    self.emit_node(value);
                }
                self.emit_op(Op::LocalCleanup);
                for name in names {
                    self.add_local(name);
                }
            }

            Node::FunctionDecl {
                name,
                parameters,
                body,
                line,
            } => self.emit_function(name, parameters, body, *line),

            Node::While {
                condition, body, ..
            } => {
                let loop_to = self.func().emitter.position();
                self.emit_node(condition);
                let exit_jump = self.func().emitter.emit_jump(Op::JumpIfFalse);

                self.begin_scope();
                for statement in body {
                    self.emit_node(statement);
                }
                self.end_scope();

                let loop_jump = self.func().emitter.emit_jump(Op::Loop);
                self.patch_jump(loop_jump, loop_to);
                let after = self.func().emitter.position();
                self.patch_jump(exit_jump, after);
            }

            Node::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.emit_node(condition);
                let else_jump = self.func().emitter.emit_jump(Op::JumpIfFalse);

                self.begin_scope();
                for statement in then_branch {
                    self.emit_node(statement);
                }
                self.end_scope();

                match else_branch {
                    Some(else_branch) => {
                        // There is no unconditional jump; nil is falsy, so
                        // this pair always skips the else branch.
                        self.emit_op(Op::Nil);
                        let end_jump = self.func().emitter.emit_jump(Op::JumpIfFalse);

                        let else_start = self.func().emitter.position();
                        self.patch_jump(else_jump, else_start);

                        self.begin_scope();
                        for statement in else_branch {
                            self.emit_node(statement);
                        }
                        self.end_scope();

                        let after = self.func().emitter.position();
                        self.patch_jump(end_jump, after);
                    }
                    None => {
                        let after = self.func().emitter.position();
                        self.patch_jump(else_jump, after);
                    }
                }
            }

            Node::Block { statements, .. } => {
                self.begin_scope();
                for statement in statements {
                    self.emit_node(statement);
                }
                self.end_scope();
            }

            Node::For {
                variable,
                values,
                body,
                ..
            } => {
                // Value enumeration: the body runs once per listed value
                // with the loop variable rebound before each run.
                self.begin_scope();
                self.emit_op(Op::LocalAllocate);
                self.emit_byte(1);
                self.emit_op(Op::LocalCleanup);
                let slot = self.add_local(variable);

                for value in values {
                    self.emit_op(Op::AssignStart);
                    self.emit_node(value);
                    self.emit_op(Op::SetLocal);
                    self.emit_byte(slot);
                    self.emit_op(Op::AssignCleanup);

                    self.begin_scope();
                    for statement in body {
                        self.emit_node(statement);
                    }
                    self.end_scope();
                }

                self.end_scope();
            }

            Node::Return { values, .. } => {
                if values.len() > MAX_ARITY {
                    self.error("Too many return values");
                }
                for value in values {
                    self.emit_node(value);
                }
                self.emit_op(Op::Return);
                self.emit_byte(values.len() as u8);
            }
        }
    }

    fn emit_literal(&mut self, value: &Value) {
        match value {
            Value::Nil => self.emit_op(Op::Nil),
            Value::Number(n) if *n == 0.0 => self.emit_op(Op::Zero),
            _ => self.emit_constant(value.clone()),
        }
    }

    /// Compile a nested function with a child state, then bind the resulting
    /// closure to its name in the enclosing scope: a global at top level, a
    /// local anywhere else.
    fn emit_function(&mut self, name: &str, parameters: &[String], body: &[Node], line: u32) {
        if parameters.len() + 1 > MAX_LOCALS {
            self.error("Too many parameters");
        }

        self.funcs.push(FuncState::new(name, parameters));
        self.func().emitter.set_line(line);
        for statement in body {
            self.emit_node(statement);
        }
        let function = self.end_function();

        let upvalues = function.upvalues.clone();
        let closure = Value::Closure(Rc::new(Closure::new(function.chunk, &function.name)));

        self.func().emitter.set_line(line);
        let top_level = self.funcs.len() == 1 && self.func().scope_depth == 0;

        if top_level {
            let name = self.make_constant(Value::string(name));
            self.emit_op(Op::AssignStart);
            self.emit_constant(closure);
            self.emit_op(Op::Closure);
            self.emit_upvalue_captures(&upvalues);
            self.emit_op(Op::SetGlobal);
            self.emit_byte(name);
            self.emit_op(Op::AssignCleanup);
        } else {
            self.emit_constant(closure);
            self.emit_op(Op::Closure);
            self.emit_upvalue_captures(&upvalues);
            self.add_local(name);
        }
    }

    fn emit_upvalue_captures(&mut self, upvalues: &[UpvalueDesc]) {
        for desc in upvalues {
            self.emit_op(Op::CreateUpvalue);
            match desc {
                UpvalueDesc::ParentLocal(index) => {
                    self.emit_byte(*index);
                    self.emit_byte(1);
                }
                UpvalueDesc::ParentUpvalue(index) => {
                    self.emit_byte(*index);
                    self.emit_byte(0);
                }
            }
        }
    }

    /// Emit the implicit trailing return and package up the innermost
    /// function state.
    fn end_function(&mut self) -> Function {
        let repl_patch =
            self.mode == Mode::Repl && self.func().emitter.last_byte() == Some(Op::Pop as u8);
        if repl_patch {
            // Return the last expression's value so the REPL can print it.
            self.func().emitter.replace_last_byte(Op::Return as u8);
            self.func().emitter.emit_byte(1);
        } else {
            self.emit_op(Op::Nil);
            self.emit_op(Op::Return);
            self.emit_byte(1);
        }

        let state = self.funcs.pop().unwrap();
        let function = Function {
            chunk: state.emitter.into_chunk(),
            name: state.name,
            upvalues: state
                .upvalues
                .iter()
                .map(|upvalue| {
                    if upvalue.is_local {
                        UpvalueDesc::ParentLocal(upvalue.index)
                    } else {
                        UpvalueDesc::ParentUpvalue(upvalue.index)
                    }
                })
                .collect(),
        };

        if flags::PRINT_BYTECODE {
            eprint!("{}", disasm::disassemble(&function.chunk, &function.name));
        }

        function
    }

    // --- Scopes and name resolution ---

    fn begin_scope(&mut self) {
        self.func().scope_depth += 1;
    }

    /// Drop this scope's locals and, if there were any, emit the combined
    /// close-and-trim instruction.
    fn end_scope(&mut self) {
        let func = self.funcs.last_mut().unwrap();
        func.scope_depth -= 1;
        let depth = func.scope_depth;

        let mut dropped = 0;
        while func.locals.last().is_some_and(|local| local.depth > depth) {
            func.locals.pop();
            dropped += 1;
        }

        if dropped > 0 {
            let keep = func.locals.len() as u8;
            func.emitter.emit_op(Op::CloseUpvalues);
            func.emitter.emit_byte(keep);
        }
    }

    fn add_local(&mut self, name: &str) -> u8 {
        if self.func().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function");
            return 0;
        }
        let depth = self.func().scope_depth;
        let slot = self.func().locals.len() as u8;
        self.func().locals.push(Local {
            name: name.to_string(),
            depth,
        });
        slot
    }

    fn resolve(&mut self, name: &str) -> Resolution {
        let top = self.funcs.len() - 1;
        if let Some(slot) = Self::resolve_local(&self.funcs[top], name) {
            return Resolution::Local(slot);
        }
        if let Some(index) = self.resolve_upvalue(top, name) {
            return Resolution::Upvalue(index);
        }
        Resolution::Global
    }

    /// Newest binding wins, so shadowed names resolve to the inner local.
    fn resolve_local(func: &FuncState, name: &str) -> Option<u8> {
        func.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, _)| slot as u8)
    }

    /// Resolve `name` as an upvalue of `funcs[func_index]`, creating
    /// descriptors down the chain as needed.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }

        if let Some(existing) = self.funcs[func_index]
            .upvalues
            .iter()
            .position(|upvalue| upvalue.name == name)
        {
            return Some(existing as u8);
        }

        if let Some(slot) = Self::resolve_local(&self.funcs[func_index - 1], name) {
            return Some(self.add_upvalue(func_index, name, slot, true));
        }

        if let Some(index) = self.resolve_upvalue(func_index - 1, name) {
            return Some(self.add_upvalue(func_index, name, index, false));
        }

        None
    }

    fn add_upvalue(&mut self, func_index: usize, name: &str, index: u8, is_local: bool) -> u8 {
        if self.funcs[func_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many captured variables in function");
            return 0;
        }
        let upvalues = &mut self.funcs[func_index].upvalues;
        upvalues.push(UpvalueInfo {
            name: name.to_string(),
            index,
            is_local,
        });
        (upvalues.len() - 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glua_scanner::scan;

    fn compile_source(source: &str, mode: Mode) -> Result<Function, ErrorChain> {
        let (tokens, errors) = scan(source);
        assert!(errors.is_empty(), "scan errors: {errors}");
        compile(&tokens, mode)
    }

    fn script(source: &str) -> Function {
        compile_source(source, Mode::Script).expect("compilation failed")
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let function = script("1 + 2");
        assert_eq!(
            function.chunk.code,
            vec![
                Op::Constant as u8,
                0,
                Op::Constant as u8,
                1,
                Op::Add as u8,
                Op::Pop as u8,
                Op::Nil as u8,
                Op::Return as u8,
                1,
            ]
        );
        assert_eq!(
            function.chunk.constants,
            vec![Value::Number(1.0), Value::Number(2.0)]
        );
    }

    #[test]
    fn test_repl_mode_returns_trailing_expression() {
        let function = compile_source("1 + 2", Mode::Repl).unwrap();
        assert_eq!(
            &function.chunk.code[5..],
            &[Op::Return as u8, 1],
            "trailing pop should be rewritten to a return"
        );
        assert!(!function.chunk.code.contains(&(Op::Pop as u8)));
    }

    #[test]
    fn test_zero_literal_uses_zero_op() {
        let function = script("0");
        assert_eq!(function.chunk.code[0], Op::Zero as u8);
        assert!(function.chunk.constants.is_empty());
    }

    #[test]
    fn test_equal_constants_share_a_slot() {
        let function = script("x = 1 + 1 + 1");
        let ones = function
            .chunk
            .constants
            .iter()
            .filter(|c| **c == Value::Number(1.0))
            .count();
        assert_eq!(ones, 1);
    }

    #[test]
    fn test_while_jumps_stay_in_bounds() {
        let function = script("while true do x = 1 end");
        let code = &function.chunk.code;

        let mut pc = 0;
        while pc < code.len() {
            let op = Op::from_u8(code[pc]).expect("invalid opcode");
            match op {
                Op::JumpIfFalse => {
                    let distance = ((code[pc + 1] as usize) << 8) | code[pc + 2] as usize;
                    assert!(pc + 3 + distance <= code.len());
                }
                Op::Loop => {
                    let distance = ((code[pc + 1] as usize) << 8) | code[pc + 2] as usize;
                    assert!(distance <= pc + 3);
                }
                _ => {}
            }
            pc += 1 + op.operand_len();
        }
    }

    #[test]
    fn test_local_declaration_layout() {
        let function = script("local a, b = 1, 2 a = b");
        let code = &function.chunk.code;
        assert_eq!(&code[..2], &[Op::LocalAllocate as u8, 2]);
        // Slot 0 is the callee, so a and b land in slots 1 and 2.
        let set_local = code
            .windows(2)
            .position(|w| w == [Op::SetLocal as u8, 1])
            .expect("assignment to `a` missing");
        assert!(code[..set_local]
            .windows(2)
            .any(|w| w == [Op::GetLocal as u8, 2]));
    }

    #[test]
    fn test_global_declaration_brackets_with_assign_ops() {
        let function = script("global x = 1");
        let code = &function.chunk.code;
        assert_eq!(code[0], Op::AssignStart as u8);
        assert!(code.contains(&(Op::SetGlobal as u8)));
        assert!(code.contains(&(Op::AssignCleanup as u8)));
    }

    #[test]
    fn test_nested_function_captures_parent_local() {
        let function = script("function f(x) function g() return x end return g end");

        // f is a closure constant of the top-level chunk.
        let f = function
            .chunk
            .constants
            .iter()
            .find_map(|c| c.as_closure())
            .expect("f should be compiled into a closure constant");
        assert_eq!(&*f.name, "f");

        // g captures x, a local of f at slot 1, so f's code carries a
        // CreateUpvalue for its immediate local.
        assert!(f
            .chunk
            .code
            .windows(3)
            .any(|w| w == [Op::CreateUpvalue as u8, 1, 1]));
    }

    #[test]
    fn test_chained_upvalue_capture() {
        let function =
            script("function f(x) function g() function h() return x end return h end return g end");
        let f = function
            .chunk
            .constants
            .iter()
            .find_map(|c| c.as_closure())
            .unwrap();
        let g = f
            .chunk
            .constants
            .iter()
            .find_map(|c| c.as_closure())
            .unwrap();
        // h reaches x through g's upvalue 0.
        assert!(g
            .chunk
            .code
            .windows(3)
            .any(|w| w == [Op::CreateUpvalue as u8, 0, 0]));
    }

    #[test]
    fn test_shadowing_resolves_to_newest_local() {
        let function = script("local x = 1 do local x = 2 y = x end");
        let code = &function.chunk.code;
        // The inner read of x must use the inner slot (2), not slot 1.
        assert!(code.windows(2).any(|w| w == [Op::GetLocal as u8, 2]));
    }

    #[test]
    fn test_scope_exit_closes_upvalues() {
        let function = script("do local x = 1 end");
        let code = &function.chunk.code;
        assert!(code.windows(2).any(|w| w == [Op::CloseUpvalues as u8, 1]));
    }

    #[test]
    fn test_comparison_chain_is_rejected() {
        let errors = compile_source("x = 1 < 2 < 3", Mode::Script).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("Comparison chains")));
    }

    #[test]
    fn test_invalid_assignment_target_is_rejected() {
        let errors = compile_source("1 = 2", Mode::Script).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("Invalid assignment target")));
    }

    #[test]
    fn test_multiple_errors_in_one_pass() {
        let errors = compile_source("1 = 2; 3 = 4", Mode::Script).unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn test_not_equal_compiles_to_equals_not() {
        let function = script("x = 1 ~= 2");
        let code = &function.chunk.code;
        assert!(code
            .windows(2)
            .any(|w| w == [Op::Equals as u8, Op::Not as u8]));
    }

    #[test]
    fn test_call_operands_carry_arity_and_expansion() {
        let function = script("a, b = f(1, 2)");
        let code = &function.chunk.code;
        assert!(code.windows(3).any(|w| w == [Op::Call as u8, 2, 1]));

        let function = script("f(1, 2)");
        let code = &function.chunk.code;
        assert!(code.windows(3).any(|w| w == [Op::Call as u8, 2, 0]));
    }

    #[test]
    fn test_empty_return_has_arity_one() {
        let function = script("function f() return end");
        let f = function
            .chunk
            .constants
            .iter()
            .find_map(|c| c.as_closure())
            .unwrap();
        assert!(f
            .chunk
            .code
            .windows(3)
            .any(|w| w == [Op::Nil as u8, Op::Return as u8, 1]));
    }

    #[test]
    fn test_truncated_program_terminates() {
        let result = compile_source("while true do", Mode::Script);
        assert!(result.is_err());
    }
}
