//! Abstract syntax tree for the shading-language front-end

use crate::symbols::StorageQualifier;

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `a % b`
    Mod,
    /// `a == b`
    Eq,
    /// `a != b`
    Ne,
    /// `a < b`
    Lt,
    /// `a <= b`
    Le,
    /// `a > b`
    Gt,
    /// `a >= b`
    Ge,
    /// `a && b` (short-circuit)
    And,
    /// `a || b` (short-circuit)
    Or,
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Integer literal
    IntLit(i32),
    /// Float literal
    FloatLit(f32),
    /// Boolean literal
    BoolLit(bool),
    /// Variable reference
    Ident {
        /// Referenced name
        name: String,
        /// 1-based source line of the reference
        line: u32,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        expr: Box<Expr>,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// Assignment (plain or compound)
    Assign {
        /// Assignment target (must be an lvalue)
        target: Box<Expr>,
        /// Compound operator, if any (`+=` carries `Add`)
        op: Option<BinaryOp>,
        /// Assigned value
        value: Box<Expr>,
        /// 1-based source line
        line: u32,
    },
    /// Conditional expression `c ? a : b`
    Ternary {
        /// Condition
        cond: Box<Expr>,
        /// Value when true
        then_expr: Box<Expr>,
        /// Value when false
        else_expr: Box<Expr>,
    },
    /// Function, intrinsic or constructor call
    Call {
        /// Callee name
        callee: String,
        /// Arguments in source order
        args: Vec<Expr>,
        /// 1-based source line
        line: u32,
    },
    /// Member access / swizzle
    Member {
        /// Base expression
        base: Box<Expr>,
        /// Field or swizzle name
        field: String,
    },
    /// Array or component indexing
    Index {
        /// Base expression
        base: Box<Expr>,
        /// Index expression
        index: Box<Expr>,
    },
    /// `++x` / `--x`
    PreIncDec {
        /// Target lvalue
        target: Box<Expr>,
        /// Increment (true) or decrement
        inc: bool,
        /// 1-based source line
        line: u32,
    },
    /// `x++` / `x--`
    PostIncDec {
        /// Target lvalue
        target: Box<Expr>,
        /// Increment (true) or decrement
        inc: bool,
        /// 1-based source line
        line: u32,
    },
}

impl Expr {
    /// Whether the expression tree contains an assignment or inc/dec
    pub fn has_side_effects(&self) -> bool {
        match self {
            Expr::Assign { .. } | Expr::PreIncDec { .. } | Expr::PostIncDec { .. } => true,
            Expr::Unary { expr, .. } => expr.has_side_effects(),
            Expr::Binary { lhs, rhs, .. } => lhs.has_side_effects() || rhs.has_side_effects(),
            Expr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                cond.has_side_effects()
                    || then_expr.has_side_effects()
                    || else_expr.has_side_effects()
            }
            Expr::Call { args, .. } => args.iter().any(Expr::has_side_effects),
            Expr::Member { base, .. } => base.has_side_effects(),
            Expr::Index { base, index } => base.has_side_effects() || index.has_side_effects(),
            _ => false,
        }
    }
}

/// One declarator of a local declaration (`float a = 1.0, b[2];`)
#[derive(Debug, Clone, PartialEq)]
pub struct Declarator {
    /// Declared name
    pub name: String,
    /// Array size, if declared as an array
    pub array_size: Option<u16>,
    /// Initializer, if any
    pub init: Option<Expr>,
}

/// A brace-delimited statement list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// Statements in order
    pub stmts: Vec<Stmt>,
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Local variable declaration
    Decl {
        /// Declared type name
        ty: String,
        /// Declarators sharing the type
        declarators: Vec<Declarator>,
        /// 1-based source line
        line: u32,
    },
    /// Expression statement
    Expr {
        /// The expression
        expr: Expr,
        /// 1-based source line
        line: u32,
    },
    /// `if` / `else`
    If {
        /// Condition
        cond: Expr,
        /// Taken when the condition holds
        then_branch: Block,
        /// Taken otherwise
        else_branch: Option<Block>,
        /// 1-based source line
        line: u32,
    },
    /// `for` loop
    For {
        /// Loop initializer
        init: Option<Box<Stmt>>,
        /// Loop condition (absent means always true)
        cond: Option<Expr>,
        /// Per-iteration step
        step: Option<Expr>,
        /// Loop body
        body: Block,
        /// 1-based source line
        line: u32,
    },
    /// `while` loop
    While {
        /// Loop condition
        cond: Expr,
        /// Loop body
        body: Block,
        /// 1-based source line
        line: u32,
    },
    /// `do { } while` loop
    DoWhile {
        /// Loop body
        body: Block,
        /// Loop condition
        cond: Expr,
        /// 1-based source line
        line: u32,
    },
    /// `return`
    Return {
        /// Returned value, if any
        value: Option<Expr>,
        /// 1-based source line
        line: u32,
    },
    /// `break`
    Break {
        /// 1-based source line
        line: u32,
    },
    /// `continue`
    Continue {
        /// 1-based source line
        line: u32,
    },
    /// `discard`
    Discard {
        /// 1-based source line
        line: u32,
    },
    /// Nested block
    Block(Block),
}

impl Stmt {
    /// 1-based source line of the statement
    pub fn line(&self) -> u32 {
        match self {
            Stmt::Decl { line, .. }
            | Stmt::Expr { line, .. }
            | Stmt::If { line, .. }
            | Stmt::For { line, .. }
            | Stmt::While { line, .. }
            | Stmt::DoWhile { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Discard { line } => *line,
            Stmt::Block(block) => block.stmts.first().map(Stmt::line).unwrap_or(0),
        }
    }
}

/// A file-scope variable declaration
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDecl {
    /// Storage class
    pub qualifier: StorageQualifier,
    /// Declared type name
    pub ty: String,
    /// Declared name
    pub name: String,
    /// Array size, if declared as an array
    pub array_size: Option<u16>,
    /// Initializer, if any
    pub init: Option<Expr>,
    /// HLSL semantic annotation, if any
    pub semantic: Option<String>,
    /// 1-based source line
    pub line: u32,
}

/// A structure definition
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    /// Structure name
    pub name: String,
    /// Ordered `(name, type)` fields
    pub fields: Vec<(String, String)>,
    /// 1-based source line
    pub line: u32,
}

/// One function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    /// Parameter name
    pub name: String,
    /// Declared type name
    pub ty: String,
    /// HLSL semantic annotation, if any
    pub semantic: Option<String>,
}

/// A function definition
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// Return type name
    pub ret: String,
    /// Function name
    pub name: String,
    /// Parameters in declaration order
    pub params: Vec<ParamDecl>,
    /// Return-value semantic annotation (`: SV_Target`), if any
    pub semantic: Option<String>,
    /// Function body
    pub body: Block,
    /// 1-based source line
    pub line: u32,
}

/// A parsed translation unit
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Shader {
    /// File-scope variables, in declaration order
    pub globals: Vec<GlobalDecl>,
    /// Structure definitions
    pub structs: Vec<StructDecl>,
    /// Function definitions
    pub functions: Vec<FunctionDecl>,
}
