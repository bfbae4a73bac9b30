//! Parser
//!
//! Recursive descent with one token of lookahead, operator precedence
//! for expressions. Produces the syntax tree; all register and scope
//! decisions belong to the code generator.

use crate::ast::{BinOp, Block, Expr, ExprKind, FuncBody, Stat, StatKind, TableItem, UnOp};
use crate::error::CompileError;
use crate::lexer::{Lexer, Token};

/// Binding powers: (left, right). Right < left makes an operator
/// right-associative.
fn binary_priority(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 1),
        BinOp::And => (2, 2),
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Ne | BinOp::Eq => (3, 3),
        BinOp::Concat => (9, 8),
        BinOp::Add | BinOp::Sub => (10, 10),
        BinOp::Mul | BinOp::Div | BinOp::Mod => (11, 11),
        BinOp::Pow => (14, 13),
    }
}

const UNARY_PRIORITY: u8 = 12;

fn binop_of(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        Token::Caret => BinOp::Pow,
        Token::Concat => BinOp::Concat,
        Token::EqEq => BinOp::Eq,
        Token::NotEq => BinOp::Ne,
        Token::Less => BinOp::Lt,
        Token::LessEq => BinOp::Le,
        Token::Greater => BinOp::Gt,
        Token::GreaterEq => BinOp::Ge,
        Token::And => BinOp::And,
        Token::Or => BinOp::Or,
        _ => return None,
    })
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    token: Token,
    line: u32,
    chunk: String,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a [u8], chunk: &str) -> Result<Parser<'a>, CompileError> {
        let mut lexer = Lexer::new(src, chunk);
        let (token, line) = lexer.next_token()?;
        Ok(Parser {
            lexer,
            token,
            line,
            chunk: chunk.to_string(),
        })
    }

    /// Parses a whole chunk: a block terminated by end of input.
    pub fn parse_chunk(mut self) -> Result<Block, CompileError> {
        let block = self.block()?;
        self.expect_token(Token::Eof)?;
        Ok(block)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(&self.chunk, self.line, message)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        let (next, line) = self.lexer.next_token()?;
        self.line = line;
        Ok(std::mem::replace(&mut self.token, next))
    }

    fn check(&self, token: &Token) -> bool {
        self.token == *token
    }

    fn accept(&mut self, token: &Token) -> Result<bool, CompileError> {
        if self.check(token) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_token(&mut self, token: Token) -> Result<(), CompileError> {
        if self.token == token {
            self.advance()?;
            Ok(())
        } else {
            Err(self.error(format!(
                "{} expected near {}",
                token.describe(),
                self.token.describe()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        match self.token.clone() {
            Token::Name(n) => {
                self.advance()?;
                Ok(n)
            }
            other => Err(self.error(format!("<name> expected near {}", other.describe()))),
        }
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.token,
            Token::Eof | Token::End | Token::Else | Token::Elseif | Token::Until
        )
    }

    fn block(&mut self) -> Result<Block, CompileError> {
        let mut stats = Vec::new();
        loop {
            if self.block_follows() {
                return Ok(Block { stats });
            }
            if self.check(&Token::Return) {
                stats.push(self.return_stat()?);
                return Ok(Block { stats });
            }
            if let Some(stat) = self.statement()? {
                stats.push(stat);
            }
        }
    }

    fn return_stat(&mut self) -> Result<Stat, CompileError> {
        let line = self.line;
        self.expect_token(Token::Return)?;
        let exprs = if self.block_follows() || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        let _ = self.accept(&Token::Semi)?;
        Ok(Stat {
            kind: StatKind::Return(exprs),
            line,
        })
    }

    /// One statement; `None` for a bare ';'.
    fn statement(&mut self) -> Result<Option<Stat>, CompileError> {
        let line = self.line;
        let kind = match &self.token {
            Token::Semi => {
                self.advance()?;
                return Ok(None);
            }
            Token::If => self.if_stat()?,
            Token::While => {
                self.advance()?;
                let condition = self.expression()?;
                self.expect_token(Token::Do)?;
                let body = self.block()?;
                self.expect_token(Token::End)?;
                StatKind::While(condition, body)
            }
            Token::Do => {
                self.advance()?;
                let body = self.block()?;
                self.expect_token(Token::End)?;
                StatKind::Do(body)
            }
            Token::For => self.for_stat()?,
            Token::Repeat => {
                self.advance()?;
                let body = self.block()?;
                self.expect_token(Token::Until)?;
                let condition = self.expression()?;
                StatKind::Repeat(body, condition)
            }
            Token::Function => {
                self.advance()?;
                // funcname: Name {'.' Name} [':' Name]
                let mut target = Expr {
                    kind: ExprKind::Name(self.expect_name()?),
                    line,
                };
                let mut name = match &target.kind {
                    ExprKind::Name(n) => n.clone(),
                    _ => unreachable!(),
                };
                let mut is_method = false;
                loop {
                    if self.accept(&Token::Dot)? {
                        let field = self.expect_name()?;
                        name = format!("{name}.{field}");
                        target = Expr {
                            kind: ExprKind::Index(
                                Box::new(target),
                                Box::new(Expr {
                                    kind: ExprKind::Str(field.into_bytes()),
                                    line,
                                }),
                            ),
                            line,
                        };
                    } else if self.accept(&Token::Colon)? {
                        let method = self.expect_name()?;
                        name = format!("{name}:{method}");
                        target = Expr {
                            kind: ExprKind::Index(
                                Box::new(target),
                                Box::new(Expr {
                                    kind: ExprKind::Str(method.into_bytes()),
                                    line,
                                }),
                            ),
                            line,
                        };
                        is_method = true;
                        break;
                    } else {
                        break;
                    }
                }
                let mut body = self.function_body(name, line)?;
                if is_method {
                    body.params.insert(0, "self".to_string());
                }
                StatKind::Function(target, body)
            }
            Token::Local => {
                self.advance()?;
                if self.accept(&Token::Function)? {
                    let name = self.expect_name()?;
                    let body = self.function_body(name.clone(), line)?;
                    StatKind::LocalFunction(name, body)
                } else {
                    let mut names = vec![self.expect_name()?];
                    while self.accept(&Token::Comma)? {
                        names.push(self.expect_name()?);
                    }
                    let exprs = if self.accept(&Token::Assign)? {
                        self.expr_list()?
                    } else {
                        Vec::new()
                    };
                    StatKind::Local(names, exprs)
                }
            }
            Token::Break => {
                self.advance()?;
                StatKind::Break
            }
            Token::Goto => {
                self.advance()?;
                StatKind::Goto(self.expect_name()?)
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.expect_name()?;
                self.expect_token(Token::DoubleColon)?;
                StatKind::Label(name)
            }
            _ => self.expr_stat()?,
        };
        Ok(Some(Stat { kind, line }))
    }

    fn if_stat(&mut self) -> Result<StatKind, CompileError> {
        self.expect_token(Token::If)?;
        let mut arms = Vec::new();
        let condition = self.expression()?;
        self.expect_token(Token::Then)?;
        arms.push((condition, self.block()?));
        let mut else_block = None;
        loop {
            if self.accept(&Token::Elseif)? {
                let condition = self.expression()?;
                self.expect_token(Token::Then)?;
                arms.push((condition, self.block()?));
            } else if self.accept(&Token::Else)? {
                else_block = Some(self.block()?);
                break;
            } else {
                break;
            }
        }
        self.expect_token(Token::End)?;
        Ok(StatKind::If { arms, else_block })
    }

    fn for_stat(&mut self) -> Result<StatKind, CompileError> {
        self.expect_token(Token::For)?;
        let first = self.expect_name()?;
        if self.accept(&Token::Assign)? {
            let start = self.expression()?;
            self.expect_token(Token::Comma)?;
            let limit = self.expression()?;
            let step = if self.accept(&Token::Comma)? {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect_token(Token::Do)?;
            let body = self.block()?;
            self.expect_token(Token::End)?;
            return Ok(StatKind::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }
        let mut names = vec![first];
        while self.accept(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        self.expect_token(Token::In)?;
        let exprs = self.expr_list()?;
        self.expect_token(Token::Do)?;
        let body = self.block()?;
        self.expect_token(Token::End)?;
        Ok(StatKind::GenericFor { names, exprs, body })
    }

    /// Assignment or call statement.
    fn expr_stat(&mut self) -> Result<StatKind, CompileError> {
        let first = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.accept(&Token::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target.kind, ExprKind::Name(_) | ExprKind::Index(_, _)) {
                    return Err(self.error("syntax error near '=' (cannot assign)"));
                }
            }
            self.expect_token(Token::Assign)?;
            let values = self.expr_list()?;
            return Ok(StatKind::Assign(targets, values));
        }
        match &first.kind {
            ExprKind::Call { .. } => Ok(StatKind::Call(first)),
            _ => Err(self.error("syntax error (expression is not a statement)")),
        }
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut exprs = vec![self.expression()?];
        while self.accept(&Token::Comma)? {
            exprs.push(self.expression()?);
        }
        Ok(exprs)
    }

    fn expression(&mut self) -> Result<Expr, CompileError> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, limit: u8) -> Result<Expr, CompileError> {
        let line = self.line;
        let mut left = match &self.token {
            Token::Not => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                Expr {
                    kind: ExprKind::Unary(UnOp::Not, Box::new(operand)),
                    line,
                }
            }
            Token::Minus => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                Expr {
                    kind: ExprKind::Unary(UnOp::Neg, Box::new(operand)),
                    line,
                }
            }
            Token::Hash => {
                self.advance()?;
                let operand = self.sub_expression(UNARY_PRIORITY)?;
                Expr {
                    kind: ExprKind::Unary(UnOp::Len, Box::new(operand)),
                    line,
                }
            }
            _ => self.simple_expr()?,
        };
        while let Some(op) = binop_of(&self.token) {
            let (left_priority, right_priority) = binary_priority(op);
            if left_priority <= limit {
                break;
            }
            let op_line = self.line;
            self.advance()?;
            let right = self.sub_expression(right_priority)?;
            left = Expr {
                kind: ExprKind::Binary(op, Box::new(left), Box::new(right)),
                line: op_line,
            };
        }
        Ok(left)
    }

    fn simple_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line;
        let kind = match self.token.clone() {
            Token::Nil => {
                self.advance()?;
                ExprKind::Nil
            }
            Token::True => {
                self.advance()?;
                ExprKind::True
            }
            Token::False => {
                self.advance()?;
                ExprKind::False
            }
            Token::Int(i) => {
                self.advance()?;
                ExprKind::Int(i)
            }
            Token::Num(n) => {
                self.advance()?;
                ExprKind::Num(n)
            }
            Token::Str(s) => {
                self.advance()?;
                ExprKind::Str(s)
            }
            Token::Ellipsis => {
                self.advance()?;
                ExprKind::Vararg
            }
            Token::Function => {
                self.advance()?;
                let body = self.function_body("anonymous".to_string(), line)?;
                ExprKind::Function(body)
            }
            Token::LBrace => return self.table_constructor(),
            _ => return self.suffixed_expr(),
        };
        Ok(Expr { kind, line })
    }

    /// primaryexp { '.' Name | '[' exp ']' | ':' Name args | args }
    fn suffixed_expr(&mut self) -> Result<Expr, CompileError> {
        let line = self.line;
        let mut expr = match self.token.clone() {
            Token::Name(n) => {
                self.advance()?;
                Expr {
                    kind: ExprKind::Name(n),
                    line,
                }
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.expression()?;
                self.expect_token(Token::RParen)?;
                Expr {
                    kind: ExprKind::Paren(Box::new(inner)),
                    line,
                }
            }
            other => {
                return Err(self.error(format!("unexpected symbol near {}", other.describe())));
            }
        };
        loop {
            let line = self.line;
            match &self.token {
                Token::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    expr = Expr {
                        kind: ExprKind::Index(
                            Box::new(expr),
                            Box::new(Expr {
                                kind: ExprKind::Str(field.into_bytes()),
                                line,
                            }),
                        ),
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect_token(Token::RBracket)?;
                    expr = Expr {
                        kind: ExprKind::Index(Box::new(expr), Box::new(key)),
                        line,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            func: Box::new(expr),
                            method: Some(method),
                            args,
                        },
                        line,
                    };
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let args = self.call_args()?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            func: Box::new(expr),
                            method: None,
                            args,
                        },
                        line,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let line = self.line;
        match self.token.clone() {
            Token::LParen => {
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect_token(Token::RParen)?;
                Ok(args)
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(vec![Expr {
                    kind: ExprKind::Str(s),
                    line,
                }])
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            other => Err(self.error(format!(
                "function arguments expected near {}",
                other.describe()
            ))),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr, CompileError> {
        let line = self.line;
        self.expect_token(Token::LBrace)?;
        let mut items = Vec::new();
        loop {
            if self.check(&Token::RBrace) {
                break;
            }
            match self.token.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect_token(Token::RBracket)?;
                    self.expect_token(Token::Assign)?;
                    items.push(TableItem::Pair(key, self.expression()?));
                }
                Token::Name(n) => {
                    if self.peek_is_assign()? {
                        self.advance()?;
                        self.advance()?;
                        let key = Expr {
                            kind: ExprKind::Str(n.into_bytes()),
                            line: self.line,
                        };
                        items.push(TableItem::Pair(key, self.expression()?));
                    } else {
                        items.push(TableItem::Item(self.expression()?));
                    }
                }
                _ => items.push(TableItem::Item(self.expression()?)),
            }
            if !(self.accept(&Token::Comma)? || self.accept(&Token::Semi)?) {
                break;
            }
        }
        self.expect_token(Token::RBrace)?;
        Ok(Expr {
            kind: ExprKind::Table(items),
            line,
        })
    }

    /// Whether a `Name` token is followed by '='. Needs a second token of
    /// lookahead, which only the table constructor requires.
    fn peek_is_assign(&mut self) -> Result<bool, CompileError> {
        // Clone the lexer state cheaply by scanning from the same
        // position: the lexer is small, so a peek copy is fine.
        let mut probe = self.lexer_probe();
        let (next, _) = probe.next_token()?;
        Ok(next == Token::Assign)
    }

    fn lexer_probe(&self) -> Lexer<'a> {
        self.lexer.probe()
    }

    fn function_body(&mut self, name: String, line: u32) -> Result<FuncBody, CompileError> {
        self.expect_token(Token::LParen)?;
        let mut params = Vec::new();
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                match self.token.clone() {
                    Token::Name(n) => {
                        self.advance()?;
                        params.push(n);
                    }
                    Token::Ellipsis => {
                        self.advance()?;
                        is_vararg = true;
                        break;
                    }
                    other => {
                        return Err(
                            self.error(format!("<name> expected near {}", other.describe()))
                        );
                    }
                }
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect_token(Token::RParen)?;
        let body = self.block()?;
        let end_line = self.line;
        self.expect_token(Token::End)?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
            line,
            end_line,
            name,
        })
    }
}
