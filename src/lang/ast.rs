//! Abstract syntax tree for the taught language.

/// Source position of a token or node (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// A parsed program: the ordered top-level statements.
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Assign {
        target: Target,
        value: Expr,
        span: Span,
    },
    AugAssign {
        target: Target,
        op: BinOp,
        value: Expr,
        span: Span,
    },
    Expr {
        value: Expr,
        span: Span,
    },
    If {
        /// Condition/body pairs: the `if` arm followed by any `elif` arms.
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
        span: Span,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    For {
        var: String,
        iter: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    FuncDef(FuncDef),
    Return {
        value: Option<Expr>,
        span: Span,
    },
    Break {
        span: Span,
    },
    Continue {
        span: Span,
    },
    Pass {
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assign { span, .. }
            | Stmt::AugAssign { span, .. }
            | Stmt::Expr { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Pass { span } => *span,
            Stmt::FuncDef(def) => def.span,
        }
    }
}

/// Assignment target: a plain name or a subscripted container slot.
#[derive(Debug, Clone)]
pub enum Target {
    Name(String),
    Subscript { value: Expr, index: Expr },
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Expr {
    None {
        span: Span,
    },
    Bool {
        value: bool,
        span: Span,
    },
    Int {
        value: i64,
        span: Span,
    },
    Str {
        value: String,
        span: Span,
    },
    Name {
        id: String,
        span: Span,
    },
    List {
        items: Vec<Expr>,
        span: Span,
    },
    Map {
        items: Vec<(Expr, Expr)>,
        span: Span,
    },
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    BoolOp {
        op: BoolOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
        span: Span,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::None { span }
            | Expr::Bool { span, .. }
            | Expr::Int { span, .. }
            | Expr::Str { span, .. }
            | Expr::Name { span, .. }
            | Expr::List { span, .. }
            | Expr::Map { span, .. }
            | Expr::BinOp { span, .. }
            | Expr::UnaryOp { span, .. }
            | Expr::BoolOp { span, .. }
            | Expr::Compare { span, .. }
            | Expr::Call { span, .. }
            | Expr::Attribute { span, .. }
            | Expr::Subscript { span, .. } => *span,
        }
    }

    /// True for literal leaves that carry no evaluation information.
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Expr::None { .. } | Expr::Bool { .. } | Expr::Int { .. } | Expr::Str { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// A reference to any statement or expression node, used by tree walkers
/// (disallowed-construct counting, linting).
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Stmt(&'a Stmt),
    Expr(&'a Expr),
}

/// Collect every descendant node of `body` in pre-order. The enclosing
/// block itself is not a node, so counting over the result naturally
/// excludes the root.
pub fn walk(body: &[Stmt]) -> Vec<NodeRef<'_>> {
    let mut nodes = Vec::new();
    for stmt in body {
        walk_stmt(stmt, &mut nodes);
    }
    nodes
}

fn walk_stmt<'a>(stmt: &'a Stmt, nodes: &mut Vec<NodeRef<'a>>) {
    nodes.push(NodeRef::Stmt(stmt));
    match stmt {
        Stmt::Assign { target, value, .. } => {
            walk_target(target, nodes);
            walk_expr(value, nodes);
        }
        Stmt::AugAssign { target, value, .. } => {
            walk_target(target, nodes);
            walk_expr(value, nodes);
        }
        Stmt::Expr { value, .. } => walk_expr(value, nodes),
        Stmt::If {
            branches, orelse, ..
        } => {
            for (test, body) in branches {
                walk_expr(test, nodes);
                for s in body {
                    walk_stmt(s, nodes);
                }
            }
            for s in orelse {
                walk_stmt(s, nodes);
            }
        }
        Stmt::While { test, body, .. } => {
            walk_expr(test, nodes);
            for s in body {
                walk_stmt(s, nodes);
            }
        }
        Stmt::For { iter, body, .. } => {
            walk_expr(iter, nodes);
            for s in body {
                walk_stmt(s, nodes);
            }
        }
        Stmt::FuncDef(def) => {
            for s in &def.body {
                walk_stmt(s, nodes);
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                walk_expr(value, nodes);
            }
        }
        Stmt::Break { .. } | Stmt::Continue { .. } | Stmt::Pass { .. } => {}
    }
}

fn walk_target<'a>(target: &'a Target, nodes: &mut Vec<NodeRef<'a>>) {
    if let Target::Subscript { value, index } = target {
        walk_expr(value, nodes);
        walk_expr(index, nodes);
    }
}

fn walk_expr<'a>(expr: &'a Expr, nodes: &mut Vec<NodeRef<'a>>) {
    nodes.push(NodeRef::Expr(expr));
    match expr {
        Expr::None { .. }
        | Expr::Bool { .. }
        | Expr::Int { .. }
        | Expr::Str { .. }
        | Expr::Name { .. } => {}
        Expr::List { items, .. } => {
            for item in items {
                walk_expr(item, nodes);
            }
        }
        Expr::Map { items, .. } => {
            for (k, v) in items {
                walk_expr(k, nodes);
                walk_expr(v, nodes);
            }
        }
        Expr::BinOp { left, right, .. }
        | Expr::BoolOp { left, right, .. }
        | Expr::Compare { left, right, .. } => {
            walk_expr(left, nodes);
            walk_expr(right, nodes);
        }
        Expr::UnaryOp { operand, .. } => walk_expr(operand, nodes),
        Expr::Call { func, args, .. } => {
            walk_expr(func, nodes);
            for arg in args {
                walk_expr(arg, nodes);
            }
        }
        Expr::Attribute { value, .. } => walk_expr(value, nodes),
        Expr::Subscript { value, index, .. } => {
            walk_expr(value, nodes);
            walk_expr(index, nodes);
        }
    }
}

/// True if any statement in `body` (recursively) is a `return`.
pub fn contains_return(body: &[Stmt]) -> bool {
    walk(body)
        .iter()
        .any(|node| matches!(node, NodeRef::Stmt(Stmt::Return { .. })))
}

/// Find a top-level function definition by name.
pub fn find_function<'a>(body: &'a [Stmt], name: &str) -> Option<&'a FuncDef> {
    body.iter().find_map(|stmt| match stmt {
        Stmt::FuncDef(def) if def.name == name => Some(def),
        _ => None,
    })
}
