//! Recursive-descent parser with precedence climbing for binary operators.
//!
//! Precedence, lowest to highest: assignment (statement position only),
//! `||`, `&&`, equality, comparison, additive, multiplicative, unary
//! minus, then call/index/method postfix.
//!
//! On a parse error the parser enters panic mode: it reports the first
//! error at the offending token, suppresses further reports until it
//! consumes a semicolon or reaches a synchronizing keyword, then resumes.
//! The whole source is always scanned so one pass can report several
//! errors; any recorded error fails the parse.

use crate::{
    ast::{AssignTarget, BinaryOp, ClosureBody, Expr, ExprKind, IterMethod, Stmt, StmtKind, UnaryOp},
    error::CompileError,
    lex::{Lexer, Token, TokenKind},
};

pub(crate) fn parse(source: &str) -> Result<Vec<Stmt>, Vec<CompileError>> {
    let mut parser = Parser::new(source);
    let mut stmts = Vec::new();
    while !parser.check(TokenKind::Eof) {
        stmts.push(parser.statement());
        if parser.panicking {
            parser.synchronize();
        }
    }
    if parser.errors.is_empty() {
        Ok(stmts)
    } else {
        Err(parser.errors)
    }
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    errors: Vec<CompileError>,
    panicking: bool,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let mut errors = Vec::new();
        let mut current = lexer.next_token();
        // Skip leading error tokens so `current` is always usable.
        while current.kind == TokenKind::Error {
            errors.push(CompileError::new(current.line, current.lexeme));
            current = lexer.next_token();
        }
        let panicking = !errors.is_empty();
        Self {
            lexer,
            previous: current,
            current,
            errors,
            panicking,
        }
    }

    // === token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // Error tokens carry their diagnostic as the lexeme.
            let (line, message) = (self.current.line, self.current.lexeme);
            self.error_at_line(line, message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_here(message);
        }
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let line = self.current.line;
        self.error_at_line(line, message);
    }

    fn error_at_line(&mut self, line: u32, message: impl Into<String>) {
        if self.panicking {
            return;
        }
        self.panicking = true;
        self.errors.push(CompileError::new(line, message));
    }

    fn synchronize(&mut self) {
        self.panicking = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Fn
                | TokenKind::Let
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // === statements ===

    fn statement(&mut self) -> Stmt {
        let line = self.current.line;
        let kind = match self.current.kind {
            TokenKind::Let => self.let_statement(),
            TokenKind::Fn => self.fn_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Loop => self.loop_statement(),
            TokenKind::Break => {
                self.advance();
                self.terminator();
                StmtKind::Break
            }
            TokenKind::Return => self.return_statement(),
            TokenKind::LeftBrace => StmtKind::Block(self.block()),
            _ => self.expression_statement(),
        };
        Stmt { kind, line }
    }

    fn let_statement(&mut self) -> StmtKind {
        self.advance();
        let mutable = self.matches(TokenKind::Mut);
        let name = self.binding_name("expected binding name after 'let'");
        self.consume(TokenKind::Equal, "expected '=' after binding name");
        let init = self.expression();
        self.terminator();
        StmtKind::Let { name, mutable, init }
    }

    fn fn_statement(&mut self) -> StmtKind {
        self.advance();
        let name = self.binding_name("expected function name after 'fn'");
        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        let params = self.parameter_list(TokenKind::RightParen);
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        let body = self.block();
        StmtKind::Fn { name, params, body }
    }

    fn if_statement(&mut self) -> StmtKind {
        self.advance();
        let cond = self.expression();
        let then_block = self.block();
        let else_block = if self.matches(TokenKind::Else) {
            Some(self.block())
        } else {
            None
        };
        StmtKind::If {
            cond,
            then_block,
            else_block,
        }
    }

    fn while_statement(&mut self) -> StmtKind {
        self.advance();
        let cond = self.expression();
        let body = self.block();
        StmtKind::While { cond, body }
    }

    fn for_statement(&mut self) -> StmtKind {
        self.advance();
        let var = self.binding_name("expected loop variable after 'for'");
        self.consume(TokenKind::In, "expected 'in' after loop variable");
        let iterable = self.expression();
        let body = self.block();
        StmtKind::ForIn { var, iterable, body }
    }

    fn loop_statement(&mut self) -> StmtKind {
        self.advance();
        let body = self.block();
        StmtKind::Loop { body }
    }

    fn return_statement(&mut self) -> StmtKind {
        self.advance();
        // `return` with no value: the next token starts something else.
        let value = if self.check(TokenKind::RightBrace)
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::Eof)
        {
            None
        } else {
            Some(self.expression())
        };
        self.terminator();
        StmtKind::Return(value)
    }

    fn expression_statement(&mut self) -> StmtKind {
        let expr = self.expression();
        if self.matches(TokenKind::Equal) {
            let target = match expr.kind {
                ExprKind::Name(name) => Some(AssignTarget::Name(name)),
                ExprKind::Index { target, index } => Some(AssignTarget::Index { target, index }),
                _ => {
                    self.error_here("invalid assignment target");
                    None
                }
            };
            let value = self.expression();
            self.terminator();
            return match target {
                Some(target) => StmtKind::Assign { target, value },
                None => StmtKind::Expr(value),
            };
        }
        self.terminator();
        StmtKind::Expr(expr)
    }

    /// Statements may optionally end with a semicolon.
    fn terminator(&mut self) {
        self.matches(TokenKind::Semicolon);
    }

    fn block(&mut self) -> Vec<Stmt> {
        self.consume(TokenKind::LeftBrace, "expected '{'");
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            stmts.push(self.statement());
            if self.panicking {
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
        stmts
    }

    fn binding_name(&mut self, message: &str) -> String {
        if self.check(TokenKind::Ident) {
            let name = self.current.lexeme.to_owned();
            self.advance();
            name
        } else {
            self.error_here(message);
            String::new()
        }
    }

    fn parameter_list(&mut self, closer: TokenKind) -> Vec<String> {
        let mut params = Vec::new();
        if self.check(closer) {
            return params;
        }
        loop {
            params.push(self.binding_name("expected parameter name"));
            if !self.matches(TokenKind::Comma) {
                return params;
            }
        }
    }

    // === expressions, lowest precedence first ===

    fn expression(&mut self) -> Expr {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Expr {
        let mut lhs = self.and_expr();
        while self.matches(TokenKind::PipePipe) {
            let line = self.previous.line;
            let rhs = self.and_expr();
            lhs = Expr {
                kind: ExprKind::Logical {
                    and: false,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
        lhs
    }

    fn and_expr(&mut self) -> Expr {
        let mut lhs = self.equality();
        while self.matches(TokenKind::AmpAmp) {
            let line = self.previous.line;
            let rhs = self.equality();
            lhs = Expr {
                kind: ExprKind::Logical {
                    and: true,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            };
        }
        lhs
    }

    fn equality(&mut self) -> Expr {
        let mut lhs = self.comparison();
        loop {
            let op = match self.current.kind {
                TokenKind::EqualEqual => BinaryOp::Eq,
                TokenKind::BangEqual => BinaryOp::Ne,
                _ => return lhs,
            };
            self.advance();
            let line = self.previous.line;
            let rhs = self.comparison();
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn comparison(&mut self) -> Expr {
        let mut lhs = self.term();
        loop {
            let op = match self.current.kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEqual => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEqual => BinaryOp::Ge,
                _ => return lhs,
            };
            self.advance();
            let line = self.previous.line;
            let rhs = self.term();
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn term(&mut self) -> Expr {
        let mut lhs = self.factor();
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return lhs,
            };
            self.advance();
            let line = self.previous.line;
            let rhs = self.factor();
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn factor(&mut self) -> Expr {
        let mut lhs = self.unary();
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return lhs,
            };
            self.advance();
            let line = self.previous.line;
            let rhs = self.unary();
            lhs = binary(op, lhs, rhs, line);
        }
    }

    fn unary(&mut self) -> Expr {
        if self.matches(TokenKind::Minus) {
            let line = self.previous.line;
            let operand = self.unary();
            return Expr {
                kind: ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                line,
            };
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Expr {
        let mut expr = self.primary();
        loop {
            if self.matches(TokenKind::LeftParen) {
                let line = self.previous.line;
                let args = self.argument_list();
                expr = Expr {
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                    line,
                };
            } else if self.matches(TokenKind::LeftBracket) {
                let line = self.previous.line;
                let index = self.expression();
                self.consume(TokenKind::RightBracket, "expected ']' after index");
                expr = Expr {
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                    line,
                };
            } else if self.matches(TokenKind::Dot) {
                expr = self.method_link(expr);
            } else {
                return expr;
            }
        }
    }

    /// One `.name(…)` link. Chains must begin with `.iter()`; subsequent
    /// links collect method name and arguments, with a second (seed)
    /// argument accepted only for `fold`.
    fn method_link(&mut self, expr: Expr) -> Expr {
        let line = self.previous.line;
        let name = self.binding_name("expected method name after '.'");
        self.consume(TokenKind::LeftParen, "expected '(' after method name");
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            args.push(self.expression());
            while self.matches(TokenKind::Comma) {
                if name == "fold" && args.len() == 1 {
                    args.push(self.expression());
                } else {
                    self.error_here("only fold takes a seed argument");
                    args.push(self.expression());
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after method arguments");

        if let ExprKind::IterChain { source, mut methods } = expr.kind {
            methods.push(IterMethod { name, args, line });
            return Expr {
                kind: ExprKind::IterChain { source, methods },
                line: expr.line,
            };
        }
        if name == "iter" {
            if !args.is_empty() {
                self.error_here("iter() takes no arguments");
            }
            return Expr {
                kind: ExprKind::IterChain {
                    source: Box::new(expr),
                    methods: Vec::new(),
                },
                line,
            };
        }
        self.error_here("expected 'iter()' to begin a method chain");
        expr
    }

    fn argument_list(&mut self) -> Vec<Expr> {
        let mut args = Vec::new();
        if self.matches(TokenKind::RightParen) {
            return args;
        }
        loop {
            args.push(self.expression());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        args
    }

    fn primary(&mut self) -> Expr {
        let line = self.current.line;
        let kind = match self.current.kind {
            TokenKind::Int => {
                let text = self.current.lexeme;
                self.advance();
                match text.parse::<i32>() {
                    Ok(value) => ExprKind::Int(value),
                    Err(_) => {
                        self.error_at_line(line, "integer literal out of range");
                        ExprKind::Int(0)
                    }
                }
            }
            TokenKind::Float => {
                let text = self.current.lexeme;
                self.advance();
                ExprKind::Float(text.parse::<f32>().unwrap_or(0.0))
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::None => {
                self.advance();
                ExprKind::None
            }
            TokenKind::Str => {
                // The lexeme includes its quotes.
                let text = self.current.lexeme;
                self.advance();
                ExprKind::Str(text[1..text.len() - 1].to_owned())
            }
            TokenKind::Ident => {
                let name = self.current.lexeme.to_owned();
                self.advance();
                ExprKind::Name(name)
            }
            TokenKind::LeftParen => {
                self.advance();
                let inner = self.expression();
                self.consume(TokenKind::RightParen, "expected ')' after expression");
                return inner;
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elems = Vec::new();
                if !self.matches(TokenKind::RightBracket) {
                    loop {
                        elems.push(self.expression());
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.consume(TokenKind::RightBracket, "expected ']' after array elements");
                }
                ExprKind::Array(elems)
            }
            TokenKind::Pipe => {
                self.advance();
                let params = self.parameter_list(TokenKind::Pipe);
                self.consume(TokenKind::Pipe, "expected '|' after closure parameters");
                return self.closure_body(params, line);
            }
            TokenKind::PipePipe => {
                // `||` in primary position is an empty parameter list.
                self.advance();
                return self.closure_body(Vec::new(), line);
            }
            _ => {
                self.error_here("expected expression");
                self.advance_unless_sync();
                ExprKind::None
            }
        };
        Expr { kind, line }
    }

    fn closure_body(&mut self, params: Vec<String>, line: u32) -> Expr {
        let body = if self.check(TokenKind::LeftBrace) {
            ClosureBody::Block(self.block())
        } else {
            ClosureBody::Expr(Box::new(self.expression()))
        };
        Expr {
            kind: ExprKind::Closure { params, body },
            line,
        }
    }

    /// After "expected expression", step past the offending token unless it
    /// is one the synchronizer needs to see.
    fn advance_unless_sync(&mut self) {
        match self.current.kind {
            TokenKind::Eof
            | TokenKind::Semicolon
            | TokenKind::RightBrace
            | TokenKind::Fn
            | TokenKind::Let
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Return => {}
            _ => self.advance(),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, line: u32) -> Expr {
    Expr {
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        line,
    }
}
