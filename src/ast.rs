//! The abstract syntax consumed by code generation.
//!
//! The tree arrives from the parser with compile-time-constant expressions
//! already folded into `Expr::Int` / `Expr::Str` literals, so the code
//! generator never needs to evaluate constant subtrees itself.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i32),
    Str(String),
    Var(String),
    /// Array element access; the index must be a folded constant.
    Index(String, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Call(String, Vec<Expr>),
    /// One raw input byte.
    ReadChar,
    /// One input byte converted from an ASCII digit.
    ReadInt,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    IntDecl { name: String, init: Option<Expr> },
    StrDecl { name: String, value: String },
    ArrayDecl { name: String, size: i32 },
    Assign { name: String, value: Expr },
    /// Compound assignment: `name op= value`.
    OpAssign { op: BinOp, name: String, value: Expr },
    IndexAssign { name: String, index: Expr, value: Expr },
    If { cond: Expr, then: Vec<Stmt>, els: Option<Vec<Stmt>> },
    While { cond: Expr, body: Vec<Stmt> },
    For { var: String, start: Expr, stop: Expr, step: Expr, body: Vec<Stmt> },
    Call { name: String, args: Vec<Expr> },
    Return(Expr),
    /// Print an integer as decimal digits, a string variable cell by cell,
    /// or a string literal as immediate text.
    Print(Expr),
    /// Print a single raw byte.
    PrintChar(Expr),
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub returns: bool,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub body: Vec<Stmt>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}
