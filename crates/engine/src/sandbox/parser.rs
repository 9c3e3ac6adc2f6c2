//! Recursive-descent parser producing the sandbox syntax tree.
//!
//! Binary operators are parsed by precedence climbing; everything else is plain recursive
//! descent. Newlines carry no meaning (there is no automatic semicolon insertion), which is
//! adequate for the single-expression function strings tool documents embed.

use std::rc::Rc;

use super::SandboxError;
use super::ast::*;
use super::lexer::{TemplateChunk, Token, TokenKind, tokenize};
use super::value::format_number;

/// Words that can never name a binding.
const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "default", "delete", "do", "else", "false", "finally", "for",
    "function", "if", "in", "instanceof", "let", "new", "null", "return", "switch", "this", "throw", "true", "try", "typeof",
    "var", "void", "while",
];

/// Maximum expression nesting accepted before the parser gives up.
const MAX_NESTING: usize = 256;

static EOF_TOKEN: TokenKind = TokenKind::Eof;

/// Parse a source string holding exactly one expression (a trailing `;` is tolerated).
pub(crate) fn parse_expression_source(source: &str) -> Result<Expr, SandboxError> {
    let mut parser = Parser::new(tokenize(source)?, 0);
    let expr = parser.parse_expression()?;
    parser.eat_punct(";");
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
    base_offset: usize,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, base_offset: usize) -> Self {
        Self {
            tokens,
            index: 0,
            base_offset,
            nesting: 0,
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        self.tokens
            .get(self.index + ahead)
            .or_else(|| self.tokens.last())
            .map(|token| &token.kind)
            .unwrap_or(&EOF_TOKEN)
    }

    fn position(&self) -> usize {
        self.base_offset + self.tokens.get(self.index).map(|token| token.pos).unwrap_or_default()
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            message: message.into(),
            position: self.position(),
        }
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), TokenKind::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), SandboxError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{punct}' but found {}", describe(self.peek()))))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Identifier(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_eof(&self) -> Result<(), SandboxError> {
        match self.peek() {
            TokenKind::Eof => Ok(()),
            other => Err(self.error(format!("unexpected {} after end of expression", describe(other)))),
        }
    }

    fn expect_binding_name(&mut self) -> Result<String, SandboxError> {
        match self.peek().clone() {
            TokenKind::Identifier(name) if !RESERVED.contains(&name.as_str()) => {
                self.index += 1;
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier but found {}", describe(&other)))),
        }
    }

    fn expect_property_name(&mut self) -> Result<String, SandboxError> {
        match self.advance() {
            TokenKind::Identifier(name) => Ok(name),
            other => Err(self.error(format!("expected property name but found {}", describe(&other)))),
        }
    }

    // ---- statements ----

    fn parse_block(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        self.expect_punct("{")?;
        let mut statements = Vec::new();
        while !self.eat_punct("}") {
            if matches!(self.peek(), TokenKind::Eof) {
                return Err(self.error("expected '}' before end of input"));
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.nested(Self::parse_statement_inner)
    }

    fn parse_statement_inner(&mut self) -> Result<Stmt, SandboxError> {
        if self.is_punct("{") {
            return Ok(Stmt::Block(self.parse_block()?));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        let keyword = match self.peek() {
            TokenKind::Identifier(name) => name.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "const" | "let" | "var" => {
                let kind = self.parse_decl_kind()?;
                let statement = self.parse_declarations(kind)?;
                self.eat_punct(";");
                Ok(statement)
            }
            "function" if matches!(self.peek_at(1), TokenKind::Identifier(_)) => {
                self.index += 1;
                let function = self.parse_function_rest()?;
                Ok(Stmt::FunctionDecl(Rc::new(function)))
            }
            "return" => {
                self.index += 1;
                let argument = if self.is_punct(";") || self.is_punct("}") || matches!(self.peek(), TokenKind::Eof) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.eat_punct(";");
                Ok(Stmt::Return(argument))
            }
            "if" => {
                self.index += 1;
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                let consequent = Box::new(self.parse_statement()?);
                let alternate = if self.eat_keyword("else") {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    test,
                    consequent,
                    alternate,
                })
            }
            "for" => {
                self.index += 1;
                self.parse_for()
            }
            "while" => {
                self.index += 1;
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { test, body })
            }
            "do" => {
                self.index += 1;
                let body = Box::new(self.parse_statement()?);
                if !self.eat_keyword("while") {
                    return Err(self.error("expected 'while' after do block"));
                }
                self.expect_punct("(")?;
                let test = self.parse_expression()?;
                self.expect_punct(")")?;
                self.eat_punct(";");
                Ok(Stmt::DoWhile { body, test })
            }
            "switch" => {
                self.index += 1;
                self.parse_switch()
            }
            "break" => {
                self.index += 1;
                self.eat_punct(";");
                Ok(Stmt::Break)
            }
            "continue" => {
                self.index += 1;
                self.eat_punct(";");
                Ok(Stmt::Continue)
            }
            "throw" => {
                self.index += 1;
                let argument = self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt::Throw(argument))
            }
            "try" => {
                self.index += 1;
                self.parse_try()
            }
            _ => {
                let expr = self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_decl_kind(&mut self) -> Result<DeclKind, SandboxError> {
        match self.advance() {
            TokenKind::Identifier(word) if word == "const" => Ok(DeclKind::Const),
            TokenKind::Identifier(word) if word == "let" => Ok(DeclKind::Let),
            TokenKind::Identifier(word) if word == "var" => Ok(DeclKind::Var),
            other => Err(self.error(format!("expected declaration but found {}", describe(&other)))),
        }
    }

    fn parse_declarations(&mut self, kind: DeclKind) -> Result<Stmt, SandboxError> {
        let first = self.parse_binding_pattern()?;
        self.parse_declarations_from(kind, first)
    }

    fn parse_declarations_from(&mut self, kind: DeclKind, first: Pattern) -> Result<Stmt, SandboxError> {
        let mut declarations = Vec::new();
        let mut pattern = first;
        loop {
            let init = if self.eat_punct("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if init.is_none() && (kind == DeclKind::Const || !matches!(pattern, Pattern::Identifier(_))) {
                return Err(self.error("missing initializer in declaration"));
            }
            declarations.push((pattern, init));
            if !self.eat_punct(",") {
                break;
            }
            pattern = self.parse_binding_pattern()?;
        }
        Ok(Stmt::VarDecl { kind, declarations })
    }

    fn parse_for(&mut self) -> Result<Stmt, SandboxError> {
        self.expect_punct("(")?;
        let init = if self.is_keyword("const") || self.is_keyword("let") || self.is_keyword("var") {
            let kind = self.parse_decl_kind()?;
            let pattern = self.parse_binding_pattern()?;
            if self.eat_keyword("of") {
                let iterable = self.parse_assignment()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                return Ok(Stmt::ForOf {
                    kind,
                    pattern,
                    iterable,
                    body,
                });
            }
            if self.eat_keyword("in") {
                let object = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                return Ok(Stmt::ForIn {
                    kind,
                    pattern,
                    object,
                    body,
                });
            }
            let declarations = self.parse_declarations_from(kind, pattern)?;
            self.expect_punct(";")?;
            Some(Box::new(declarations))
        } else if self.eat_punct(";") {
            None
        } else {
            let expr = self.parse_expression()?;
            self.expect_punct(";")?;
            Some(Box::new(Stmt::Expr(expr)))
        };
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, SandboxError> {
        self.expect_punct("(")?;
        let discriminant = self.parse_expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.eat_punct("}") {
            let test = if self.eat_keyword("case") {
                Some(self.parse_expression()?)
            } else if self.eat_keyword("default") {
                None
            } else {
                return Err(self.error(format!("expected 'case' or 'default' but found {}", describe(self.peek()))));
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !(self.is_keyword("case") || self.is_keyword("default") || self.is_punct("}")) {
                if matches!(self.peek(), TokenKind::Eof) {
                    return Err(self.error("unterminated switch statement"));
                }
                body.push(self.parse_statement()?);
            }
            cases.push(SwitchCase { test, body });
        }
        Ok(Stmt::Switch { discriminant, cases })
    }

    fn parse_try(&mut self) -> Result<Stmt, SandboxError> {
        let block = self.parse_block()?;
        let mut param = None;
        let mut handler = None;
        if self.eat_keyword("catch") {
            if self.eat_punct("(") {
                param = Some(self.parse_binding_pattern()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.parse_block()?);
        }
        let finalizer = if self.eat_keyword("finally") {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    // ---- patterns and functions ----

    fn parse_binding_pattern(&mut self) -> Result<Pattern, SandboxError> {
        if self.eat_punct("{") {
            let mut properties = Vec::new();
            let mut rest = None;
            while !self.eat_punct("}") {
                if self.eat_punct("...") {
                    rest = Some(self.expect_binding_name()?);
                    self.eat_punct(",");
                    continue;
                }
                let (key, shorthand) = self.parse_property_key()?;
                let value = if self.eat_punct(":") {
                    self.parse_binding_pattern()?
                } else {
                    match shorthand {
                        Some(name) if !RESERVED.contains(&name.as_str()) => Pattern::Identifier(name),
                        _ => return Err(self.error("invalid shorthand in object pattern")),
                    }
                };
                let default = if self.eat_punct("=") {
                    Some(self.parse_assignment()?)
                } else {
                    None
                };
                properties.push(ObjectPatternProperty { key, value, default });
                if !self.eat_punct(",") {
                    self.expect_punct("}")?;
                    break;
                }
            }
            return Ok(Pattern::Object { properties, rest });
        }
        if self.eat_punct("[") {
            let mut elements = Vec::new();
            let mut rest = None;
            while !self.eat_punct("]") {
                if self.eat_punct(",") {
                    elements.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    rest = Some(Box::new(self.parse_binding_pattern()?));
                    self.eat_punct(",");
                    continue;
                }
                let pattern = self.parse_binding_pattern()?;
                let default = if self.eat_punct("=") {
                    Some(self.parse_assignment()?)
                } else {
                    None
                };
                elements.push(Some(PatternElement { pattern, default }));
                if !self.eat_punct(",") {
                    self.expect_punct("]")?;
                    break;
                }
            }
            return Ok(Pattern::Array { elements, rest });
        }
        Ok(Pattern::Identifier(self.expect_binding_name()?))
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, SandboxError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.eat_punct(")") {
            let rest = self.eat_punct("...");
            let pattern = self.parse_binding_pattern()?;
            let default = if !rest && self.eat_punct("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            params.push(Param { pattern, default, rest });
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(params)
    }

    /// Parses `name? (params) { body }` after the `function` keyword.
    fn parse_function_rest(&mut self) -> Result<FunctionDef, SandboxError> {
        let name = match self.peek() {
            TokenKind::Identifier(_) => Some(self.expect_binding_name()?),
            _ => None,
        };
        let params = self.parse_params()?;
        let body = FunctionBody::Block(self.parse_block()?);
        Ok(FunctionDef { name, params, body })
    }

    fn is_arrow_ahead(&self) -> bool {
        match self.peek() {
            TokenKind::Identifier(name) => {
                !RESERVED.contains(&name.as_str()) && matches!(self.peek_at(1), TokenKind::Punct("=>"))
            }
            TokenKind::Punct("(") => {
                let mut depth = 0usize;
                for (offset, token) in self.tokens[self.index..].iter().enumerate() {
                    match token.kind {
                        TokenKind::Punct("(" | "[" | "{") => depth += 1,
                        TokenKind::Punct(")" | "]" | "}") => {
                            depth = depth.saturating_sub(1);
                            if depth == 0 {
                                return matches!(self.peek_at(offset + 1), TokenKind::Punct("=>"));
                            }
                        }
                        TokenKind::Eof => return false,
                        _ => {}
                    }
                }
                false
            }
            _ => false,
        }
    }

    fn parse_arrow(&mut self) -> Result<Expr, SandboxError> {
        let params = if self.is_punct("(") {
            self.parse_params()?
        } else {
            vec![Param {
                pattern: Pattern::Identifier(self.expect_binding_name()?),
                default: None,
                rest: false,
            }]
        };
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.parse_block()?)
        } else {
            FunctionBody::Expression(self.parse_assignment()?)
        };
        Ok(Expr::Function(Rc::new(FunctionDef { name: None, params, body })))
    }

    // ---- expressions ----

    fn parse_expression(&mut self) -> Result<Expr, SandboxError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, SandboxError> {
        self.nested(Self::parse_assignment_inner)
    }

    fn nested<T>(&mut self, parse: fn(&mut Self) -> Result<T, SandboxError>) -> Result<T, SandboxError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error("expression is nested too deeply"));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    fn parse_assignment_inner(&mut self) -> Result<Expr, SandboxError> {
        if self.is_arrow_ahead() {
            return self.parse_arrow();
        }
        let target = self.parse_conditional()?;
        let op = match self.peek() {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::Compound(BinaryOp::Add),
            TokenKind::Punct("-=") => AssignOp::Compound(BinaryOp::Sub),
            TokenKind::Punct("*=") => AssignOp::Compound(BinaryOp::Mul),
            TokenKind::Punct("/=") => AssignOp::Compound(BinaryOp::Div),
            TokenKind::Punct("%=") => AssignOp::Compound(BinaryOp::Rem),
            TokenKind::Punct("**=") => AssignOp::Compound(BinaryOp::Pow),
            TokenKind::Punct("??=") => AssignOp::Logical(LogicalOp::Nullish),
            TokenKind::Punct("||=") => AssignOp::Logical(LogicalOp::Or),
            TokenKind::Punct("&&=") => AssignOp::Logical(LogicalOp::And),
            _ => return Ok(target),
        };
        if !is_assignable(&target) {
            return Err(self.error("invalid assignment target"));
        }
        self.index += 1;
        let value = self.parse_assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn parse_conditional(&mut self) -> Result<Expr, SandboxError> {
        let test = self.parse_binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.parse_assignment()?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        Ok(Expr::Conditional(Box::new(test), Box::new(consequent), Box::new(alternate)))
    }

    fn binary_operator(&self) -> Option<(u8, BinaryKind)> {
        let operator = match self.peek() {
            TokenKind::Punct(punct) => *punct,
            TokenKind::Identifier(word) if word == "in" => "in",
            _ => return None,
        };
        let entry = match operator {
            "??" => (1, BinaryKind::Logical(LogicalOp::Nullish)),
            "||" => (2, BinaryKind::Logical(LogicalOp::Or)),
            "&&" => (3, BinaryKind::Logical(LogicalOp::And)),
            "|" => (4, BinaryKind::Binary(BinaryOp::BitOr)),
            "^" => (5, BinaryKind::Binary(BinaryOp::BitXor)),
            "&" => (6, BinaryKind::Binary(BinaryOp::BitAnd)),
            "==" => (7, BinaryKind::Binary(BinaryOp::Eq)),
            "!=" => (7, BinaryKind::Binary(BinaryOp::NotEq)),
            "===" => (7, BinaryKind::Binary(BinaryOp::StrictEq)),
            "!==" => (7, BinaryKind::Binary(BinaryOp::StrictNotEq)),
            "<" => (8, BinaryKind::Binary(BinaryOp::Lt)),
            ">" => (8, BinaryKind::Binary(BinaryOp::Gt)),
            "<=" => (8, BinaryKind::Binary(BinaryOp::LtEq)),
            ">=" => (8, BinaryKind::Binary(BinaryOp::GtEq)),
            "in" => (8, BinaryKind::Binary(BinaryOp::In)),
            "+" => (9, BinaryKind::Binary(BinaryOp::Add)),
            "-" => (9, BinaryKind::Binary(BinaryOp::Sub)),
            "*" => (10, BinaryKind::Binary(BinaryOp::Mul)),
            "/" => (10, BinaryKind::Binary(BinaryOp::Div)),
            "%" => (10, BinaryKind::Binary(BinaryOp::Rem)),
            "**" => (11, BinaryKind::Binary(BinaryOp::Pow)),
            _ => return None,
        };
        Some(entry)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, SandboxError> {
        let mut left = self.parse_unary()?;
        while let Some((precedence, kind)) = self.binary_operator() {
            if precedence < min_precedence {
                break;
            }
            self.index += 1;
            let right_assoc = matches!(kind, BinaryKind::Binary(BinaryOp::Pow));
            let right = self.parse_binary(if right_assoc { precedence } else { precedence + 1 })?;
            left = match kind {
                BinaryKind::Binary(op) => Expr::Binary(op, Box::new(left), Box::new(right)),
                BinaryKind::Logical(op) => Expr::Logical(op, Box::new(left), Box::new(right)),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SandboxError> {
        self.nested(Self::parse_unary_inner)
    }

    fn parse_unary_inner(&mut self) -> Result<Expr, SandboxError> {
        let op = match self.peek() {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("-") => Some(UnaryOp::Negate),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Identifier(word) if word == "typeof" => Some(UnaryOp::TypeOf),
            TokenKind::Identifier(word) if word == "void" => Some(UnaryOp::Void),
            TokenKind::Identifier(word) if word == "delete" => Some(UnaryOp::Delete),
            TokenKind::Punct(punct @ ("++" | "--")) => {
                let increment = *punct == "++";
                self.index += 1;
                let target = self.parse_unary()?;
                if !is_assignable(&target) {
                    return Err(self.error("invalid update target"));
                }
                return Ok(Expr::Update {
                    increment,
                    prefix: true,
                    target: Box::new(target),
                });
            }
            _ => None,
        };
        if let Some(op) = op {
            self.index += 1;
            let argument = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(argument)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, SandboxError> {
        let expr = self.parse_call_member()?;
        if let TokenKind::Punct(punct @ ("++" | "--")) = self.peek() {
            let increment = *punct == "++";
            if !is_assignable(&expr) {
                return Err(self.error("invalid update target"));
            }
            self.index += 1;
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = if self.eat_keyword("new") {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.expect_property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Static(name),
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                if self.is_punct("(") {
                    let args = self.parse_arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat_punct("[") {
                    let property = self.parse_expression()?;
                    self.expect_punct("]")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberKey::Computed(Box::new(property)),
                        optional: true,
                    };
                } else {
                    let name = self.expect_property_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberKey::Static(name),
                        optional: true,
                    };
                }
            } else if self.eat_punct("[") {
                let property = self.parse_expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberKey::Computed(Box::new(property)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                let args = self.parse_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_new(&mut self) -> Result<Expr, SandboxError> {
        let mut callee = self.parse_primary()?;
        loop {
            if self.eat_punct(".") {
                let name = self.expect_property_name()?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: MemberKey::Static(name),
                    optional: false,
                };
            } else if self.eat_punct("[") {
                let property = self.parse_expression()?;
                self.expect_punct("]")?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: MemberKey::Computed(Box::new(property)),
                    optional: false,
                };
            } else {
                break;
            }
        }
        let args = if self.is_punct("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    fn parse_arguments(&mut self) -> Result<Vec<Element>, SandboxError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(Element::Spread(self.parse_assignment()?));
            } else {
                args.push(Element::Item(self.parse_assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, SandboxError> {
        let position = self.position();
        match self.advance() {
            TokenKind::Number(value) => Ok(Expr::Number(value)),
            TokenKind::String(value) => Ok(Expr::String(value)),
            TokenKind::Template(chunks) => self.parse_template(chunks),
            TokenKind::Regex { pattern, flags } => Ok(Expr::Regex { pattern, flags }),
            TokenKind::Identifier(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "function" => Ok(Expr::Function(Rc::new(self.parse_function_rest()?))),
                "this" | "class" => Err(SandboxError::Syntax {
                    message: format!("'{name}' is not supported in tool expressions"),
                    position,
                }),
                _ if RESERVED.contains(&name.as_str()) => Err(SandboxError::Syntax {
                    message: format!("unexpected keyword '{name}'"),
                    position,
                }),
                _ => Ok(Expr::Identifier(name)),
            },
            TokenKind::Punct("(") => {
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct("[") => self.parse_array_literal(),
            TokenKind::Punct("{") => self.parse_object_literal(),
            other => Err(SandboxError::Syntax {
                message: format!("unexpected {}", describe(&other)),
                position,
            }),
        }
    }

    fn parse_template(&mut self, chunks: Vec<TemplateChunk>) -> Result<Expr, SandboxError> {
        let mut parts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match chunk {
                TemplateChunk::Text(text) => parts.push(TemplatePart::Text(text)),
                TemplateChunk::Expr { source, offset } => {
                    let base = self.base_offset + offset;
                    let tokens = tokenize(&source).map_err(|error| error.shifted(base))?;
                    let mut nested = Parser::new(tokens, base);
                    let expr = nested.parse_expression()?;
                    nested.expect_eof()?;
                    parts.push(TemplatePart::Expr(expr));
                }
            }
        }
        Ok(Expr::Template(parts))
    }

    fn parse_array_literal(&mut self) -> Result<Expr, SandboxError> {
        let mut elements = Vec::new();
        while !self.eat_punct("]") {
            if self.eat_punct("...") {
                elements.push(Element::Spread(self.parse_assignment()?));
            } else {
                elements.push(Element::Item(self.parse_assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct("]")?;
                break;
            }
        }
        Ok(Expr::Array(elements))
    }

    /// Returns the key and, for identifier keys, the name usable as a shorthand binding.
    fn parse_property_key(&mut self) -> Result<(PropertyKey, Option<String>), SandboxError> {
        match self.advance() {
            TokenKind::Identifier(name) => Ok((PropertyKey::Static(name.clone()), Some(name))),
            TokenKind::String(value) => Ok((PropertyKey::Static(value), None)),
            TokenKind::Number(value) => Ok((PropertyKey::Static(format_number(value)), None)),
            TokenKind::Punct("[") => {
                let expr = self.parse_assignment()?;
                self.expect_punct("]")?;
                Ok((PropertyKey::Computed(expr), None))
            }
            other => Err(self.error(format!("expected property key but found {}", describe(&other)))),
        }
    }

    fn parse_object_literal(&mut self) -> Result<Expr, SandboxError> {
        let mut properties = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                properties.push(Property::Spread(self.parse_assignment()?));
            } else {
                let (key, shorthand) = self.parse_property_key()?;
                let value = if self.eat_punct(":") {
                    self.parse_assignment()?
                } else if self.is_punct("(") {
                    let params = self.parse_params()?;
                    let body = FunctionBody::Block(self.parse_block()?);
                    Expr::Function(Rc::new(FunctionDef {
                        name: shorthand,
                        params,
                        body,
                    }))
                } else {
                    match shorthand {
                        Some(name) if !RESERVED.contains(&name.as_str()) => Expr::Identifier(name),
                        _ => return Err(self.error("expected ':' after property key")),
                    }
                };
                properties.push(Property::KeyValue(key, value));
            }
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(properties))
    }
}

enum BinaryKind {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn is_assignable(expr: &Expr) -> bool {
    matches!(expr, Expr::Identifier(_) | Expr::Member { optional: false, .. })
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(value) => format!("number {}", format_number(*value)),
        TokenKind::String(_) => "string literal".to_string(),
        TokenKind::Template(_) => "template literal".to_string(),
        TokenKind::Regex { .. } => "regular expression".to_string(),
        TokenKind::Identifier(name) => format!("'{name}'"),
        TokenKind::Punct(punct) => format!("'{punct}'"),
        TokenKind::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_def(source: &str) -> Rc<FunctionDef> {
        match parse_expression_source(source).expect("parse") {
            Expr::Function(def) => def,
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn parses_single_param_arrow_with_expression_body() {
        let def = function_def("(ctx) => ctx.users");
        assert_eq!(def.params.len(), 1);
        assert!(matches!(def.body, FunctionBody::Expression(Expr::Member { .. })));
    }

    #[test]
    fn parses_block_body_with_statements() {
        let def = function_def(
            "function (ctx) { const out = []; for (const u of ctx.users) { if (u.active) out.push(u.id); } return out; }",
        );
        let FunctionBody::Block(statements) = &def.body else {
            panic!("expected block body");
        };
        assert_eq!(statements.len(), 3);
        assert!(matches!(statements[1], Stmt::ForOf { .. }));
    }

    #[test]
    fn respects_operator_precedence() {
        let expr = parse_expression_source("1 + 2 * 3 ** 2").expect("parse");
        let Expr::Binary(BinaryOp::Add, _, right) = expr else {
            panic!("expected addition at the root");
        };
        assert!(matches!(*right, Expr::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn parses_destructuring_params_and_optional_chains() {
        let def = function_def("({ users: [first], meta }) => first?.id ?? meta?.['total']");
        assert!(matches!(def.params[0].pattern, Pattern::Object { .. }));
        assert!(matches!(def.body, FunctionBody::Expression(Expr::Logical(LogicalOp::Nullish, _, _))));
    }

    #[test]
    fn parenthesized_object_body_is_an_object_literal() {
        let def = function_def("(x) => ({ id: x.id, ...x.extra })");
        assert!(matches!(def.body, FunctionBody::Expression(Expr::Object(ref props)) if props.len() == 2));
    }

    #[test]
    fn reports_position_of_syntax_errors() {
        let error = parse_expression_source("(ctx) => ctx.users.map(u => u.id").expect_err("unterminated call");
        let SandboxError::Syntax { position, .. } = error else {
            panic!("expected syntax error");
        };
        assert_eq!(position, "(ctx) => ctx.users.map(u => u.id".len());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse_expression_source("(ctx) => ctx.a ctx.b").is_err());
    }

    #[test]
    fn rejects_pathological_nesting() {
        let source = format!("{}1{}", "(".repeat(1000), ")".repeat(1000));
        assert!(parse_expression_source(&source).is_err());
    }

    #[test]
    fn template_errors_point_into_the_substitution() {
        let error = parse_expression_source("`a${ 1 + }`").expect_err("bad template");
        assert!(matches!(error, SandboxError::Syntax { .. }));
    }
}
