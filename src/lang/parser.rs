//! Recursive-descent parser for the taught language.

use super::ast::{BinOp, BoolOpKind, CmpOp, Expr, FuncDef, Program, Span, Stmt, Target, UnaryOp};
use super::lexer::{Tok, Token};
use super::SyntaxError;

pub fn parse(tokens: &[Token]) -> Result<Program, SyntaxError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        func_depth: 0,
    };
    let body = parser.parse_program()?;
    Ok(Program { body })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    func_depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Span, SyntaxError> {
        if self.peek() == &tok {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        let span = self.span();
        SyntaxError::new(message, span.line, span.col)
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        while self.peek() != &Tok::Eof {
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        match self.peek() {
            Tok::If => self.if_statement(),
            Tok::While => self.while_statement(),
            Tok::For => self.for_statement(),
            Tok::Def => self.def_statement(),
            _ => {
                let stmt = self.simple_statement()?;
                self.end_of_statement()?;
                Ok(stmt)
            }
        }
    }

    fn end_of_statement(&mut self) -> Result<(), SyntaxError> {
        if self.eat(&Tok::Newline) || self.peek() == &Tok::Eof || self.peek() == &Tok::Dedent {
            Ok(())
        } else {
            Err(self.error("expected end of line"))
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        self.advance();
        let mut branches = Vec::new();
        let test = self.expression()?;
        let body = self.block()?;
        branches.push((test, body));
        let mut orelse = Vec::new();
        loop {
            if self.eat(&Tok::Elif) {
                let test = self.expression()?;
                let body = self.block()?;
                branches.push((test, body));
            } else if self.eat(&Tok::Else) {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            orelse,
            span,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        self.advance();
        let test = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::While { test, body, span })
    }

    fn for_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        self.advance();
        let var = self.ident("a loop variable")?;
        self.expect(Tok::In, "`in`")?;
        let iter = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::For {
            var,
            iter,
            body,
            span,
        })
    }

    fn def_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        self.advance();
        let name = self.ident("a function name")?;
        self.expect(Tok::LParen, "`(`")?;
        let mut params = Vec::new();
        if self.peek() != &Tok::RParen {
            loop {
                params.push(self.ident("a parameter name")?);
                if !self.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        self.expect(Tok::RParen, "`)`")?;
        self.func_depth += 1;
        let body = self.block();
        self.func_depth -= 1;
        Ok(Stmt::FuncDef(FuncDef {
            name,
            params,
            body: body?,
            span,
        }))
    }

    fn ident(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    /// A colon-introduced suite: either an indented block or a single
    /// simple statement on the same line.
    fn block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(Tok::Colon, "`:`")?;
        if self.eat(&Tok::Newline) {
            if !self.eat(&Tok::Indent) {
                return Err(self.error("expected an indented block"));
            }
            let mut body = Vec::new();
            while self.peek() != &Tok::Dedent && self.peek() != &Tok::Eof {
                body.push(self.statement()?);
            }
            self.eat(&Tok::Dedent);
            if body.is_empty() {
                return Err(self.error("expected an indented block"));
            }
            Ok(body)
        } else {
            let stmt = self.simple_statement()?;
            self.end_of_statement()?;
            Ok(vec![stmt])
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        match self.peek() {
            Tok::Return => {
                if self.func_depth == 0 {
                    return Err(self.error("'return' outside function"));
                }
                self.advance();
                let value = if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) {
                    None
                } else {
                    Some(self.expression()?)
                };
                Ok(Stmt::Return { value, span })
            }
            Tok::Break => {
                self.advance();
                Ok(Stmt::Break { span })
            }
            Tok::Continue => {
                self.advance();
                Ok(Stmt::Continue { span })
            }
            Tok::Pass => {
                self.advance();
                Ok(Stmt::Pass { span })
            }
            _ => {
                let expr = self.expression()?;
                match self.peek() {
                    Tok::Assign => {
                        self.advance();
                        let target = self.expr_to_target(expr)?;
                        let value = self.expression()?;
                        if self.peek() == &Tok::Assign {
                            return Err(self.error("chained assignment is not supported"));
                        }
                        Ok(Stmt::Assign {
                            target,
                            value,
                            span,
                        })
                    }
                    Tok::PlusEq | Tok::MinusEq | Tok::StarEq => {
                        let op = match self.peek() {
                            Tok::PlusEq => BinOp::Add,
                            Tok::MinusEq => BinOp::Sub,
                            _ => BinOp::Mul,
                        };
                        self.advance();
                        let target = self.expr_to_target(expr)?;
                        let value = self.expression()?;
                        Ok(Stmt::AugAssign {
                            target,
                            op,
                            value,
                            span,
                        })
                    }
                    _ => Ok(Stmt::Expr { value: expr, span }),
                }
            }
        }
    }

    fn expr_to_target(&self, expr: Expr) -> Result<Target, SyntaxError> {
        match expr {
            Expr::Name { id, .. } => Ok(Target::Name(id)),
            Expr::Subscript { value, index, .. } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            other => {
                let span = other.span();
                Err(SyntaxError::new(
                    "cannot assign to this expression",
                    span.line,
                    span.col,
                ))
            }
        }
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        while self.peek() == &Tok::Or {
            self.advance();
            let right = self.and_expr()?;
            let span = left.span();
            left = Expr::BoolOp {
                op: BoolOpKind::Or,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        while self.peek() == &Tok::And {
            self.advance();
            let right = self.not_expr()?;
            let span = left.span();
            left = Expr::BoolOp {
                op: BoolOpKind::And,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek() == &Tok::Not {
            let span = self.span();
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                span,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.arith()?;
        let mut comparisons: Vec<(CmpOp, Span, Expr)> = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::EqEq => CmpOp::Eq,
                Tok::NotEq => CmpOp::NotEq,
                Tok::Lt => CmpOp::Lt,
                Tok::LtE => CmpOp::LtE,
                Tok::Gt => CmpOp::Gt,
                Tok::GtE => CmpOp::GtE,
                Tok::In => CmpOp::In,
                Tok::Not => {
                    // `not in` is the only postfix use of `not`.
                    let span = self.span();
                    self.advance();
                    if !self.eat(&Tok::In) {
                        return Err(SyntaxError::new("expected `in` after `not`", span.line, span.col));
                    }
                    let right = self.arith()?;
                    comparisons.push((CmpOp::NotIn, span, right));
                    continue;
                }
                _ => break,
            };
            let span = self.span();
            self.advance();
            let right = self.arith()?;
            comparisons.push((op, span, right));
        }
        if comparisons.is_empty() {
            return Ok(first);
        }
        // Chain `a < b < c` as `a < b and b < c`.
        let mut left_operand = first;
        let mut result: Option<Expr> = None;
        for (op, _op_span, right) in comparisons {
            let span = left_operand.span();
            let compare = Expr::Compare {
                op,
                left: Box::new(left_operand.clone()),
                right: Box::new(right.clone()),
                span,
            };
            result = Some(match result {
                None => compare,
                Some(acc) => {
                    let span = acc.span();
                    Expr::BoolOp {
                        op: BoolOpKind::And,
                        left: Box::new(acc),
                        right: Box::new(compare),
                        span,
                    }
                }
            });
            left_operand = right;
        }
        Ok(result.expect("at least one comparison"))
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            let span = left.span();
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::SlashSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            let span = left.span();
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek() == &Tok::Minus {
            let span = self.span();
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
                span,
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        loop {
            let span = expr.span();
            match self.peek() {
                Tok::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != &Tok::RParen {
                        loop {
                            args.push(self.expression()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(Tok::RParen, "`)`")?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        span,
                    };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(Tok::RBracket, "`]`")?;
                    expr = Expr::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                        span,
                    };
                }
                Tok::Dot => {
                    self.advance();
                    let attr = self.ident("an attribute name")?;
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        match self.peek().clone() {
            Tok::Int(value) => {
                self.advance();
                Ok(Expr::Int { value, span })
            }
            Tok::Str(value) => {
                self.advance();
                Ok(Expr::Str { value, span })
            }
            Tok::True => {
                self.advance();
                Ok(Expr::Bool { value: true, span })
            }
            Tok::False => {
                self.advance();
                Ok(Expr::Bool { value: false, span })
            }
            Tok::None => {
                self.advance();
                Ok(Expr::None { span })
            }
            Tok::Ident(id) => {
                self.advance();
                Ok(Expr::Name { id, span })
            }
            Tok::LParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(Tok::RParen, "`)`")?;
                Ok(expr)
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != &Tok::RBracket {
                    loop {
                        items.push(self.expression()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        if self.peek() == &Tok::RBracket {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket, "`]`")?;
                Ok(Expr::List { items, span })
            }
            Tok::LBrace => {
                self.advance();
                let mut items = Vec::new();
                if self.peek() != &Tok::RBrace {
                    loop {
                        let key = self.expression()?;
                        self.expect(Tok::Colon, "`:`")?;
                        let value = self.expression()?;
                        items.push((key, value));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        if self.peek() == &Tok::RBrace {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBrace, "`}`")?;
                Ok(Expr::Map { items, span })
            }
            _ => Err(self.error("invalid syntax")),
        }
    }
}
