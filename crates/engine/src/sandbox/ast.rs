//! Syntax tree of the sandbox language subset.

use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    Template(Vec<TemplatePart>),
    Regex { pattern: String, flags: String },
    Identifier(String),
    Array(Vec<Element>),
    Object(Vec<Property>),
    Function(Rc<FunctionDef>),
    Unary(UnaryOp, Box<Expr>),
    Update { increment: bool, prefix: bool, target: Box<Expr> },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign { op: AssignOp, target: Box<Expr>, value: Box<Expr> },
    Member { object: Box<Expr>, property: MemberKey, optional: bool },
    Call { callee: Box<Expr>, args: Vec<Element>, optional: bool },
    New { callee: Box<Expr>, args: Vec<Element> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TemplatePart {
    Text(String),
    Expr(Expr),
}

/// Array literal element or call argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Element {
    Item(Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Property {
    KeyValue(PropertyKey, Expr),
    Spread(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropertyKey {
    Static(String),
    Computed(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MemberKey {
    Static(String),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Negate,
    Plus,
    BitNot,
    TypeOf,
    Void,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    In,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssignOp {
    Assign,
    Compound(BinaryOp),
    Logical(LogicalOp),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub body: FunctionBody,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Param {
    pub pattern: Pattern,
    pub default: Option<Expr>,
    pub rest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FunctionBody {
    Expression(Expr),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pattern {
    Identifier(String),
    Object {
        properties: Vec<ObjectPatternProperty>,
        rest: Option<String>,
    },
    Array {
        elements: Vec<Option<PatternElement>>,
        rest: Option<Box<Pattern>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectPatternProperty {
    pub key: PropertyKey,
    pub value: Pattern,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PatternElement {
    pub pattern: Pattern,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeclKind {
    Const,
    Let,
    Var,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Expr(Expr),
    VarDecl {
        kind: DeclKind,
        declarations: Vec<(Pattern, Option<Expr>)>,
    },
    FunctionDecl(Rc<FunctionDef>),
    Return(Option<Expr>),
    If {
        test: Expr,
        consequent: Box<Stmt>,
        alternate: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ForOf {
        kind: DeclKind,
        pattern: Pattern,
        iterable: Expr,
        body: Box<Stmt>,
    },
    ForIn {
        kind: DeclKind,
        pattern: Pattern,
        object: Expr,
        body: Box<Stmt>,
    },
    While {
        test: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        test: Expr,
    },
    Switch {
        discriminant: Expr,
        cases: Vec<SwitchCase>,
    },
    Break,
    Continue,
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        param: Option<Pattern>,
        handler: Option<Vec<Stmt>>,
        finalizer: Option<Vec<Stmt>>,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SwitchCase {
    /// `None` for the `default` clause.
    pub test: Option<Expr>,
    pub body: Vec<Stmt>,
}
