//! Abstract syntax tree for Mica
//!
//! Built by the parser with all type checks already applied: every
//! variable reference carries its resolved type, and every call carries
//! the callee's return tuple. The HLIR generator consumes these nodes
//! without re-checking.

use crate::types::{EnumOption, EnumTypeDefn, TupleField, Type};

/// A variable together with its type.
///
/// `reference` marks a parameter passed by logical address that the
/// callee may mutate.
#[derive(Debug, Clone, PartialEq)]
pub struct VarWithType {
    pub name: String,
    pub typ: Type,
    pub reference: bool,
}

impl VarWithType {
    pub fn new(name: impl Into<String>, typ: Type) -> Self {
        VarWithType {
            name: name.into(),
            typ,
            reference: false,
        }
    }
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum Decl {
    Func(FuncDecl),
    Type(TypeDefn),
    Enum(EnumTypeDefn),
}

/// A function declaration:
/// `func NAME ( args ) ( returns ) [ -> affects( effects ) ] { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    pub name: String,
    pub args: Vec<VarWithType>,
    pub ret: Vec<VarWithType>,
    /// Declared side-effect classes. Parsed and attached; codegen
    /// ignores them.
    pub effects: Vec<String>,
    pub body: Block,
}

/// A `type NAME = Type` alias declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDefn {
    pub name: String,
    pub concrete: Type,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(LetStmt),
    Mut(MutStmt),
    Assign {
        target: AssignTarget,
        value: Expr,
    },
    Return {
        val: Option<Expr>,
    },
    If {
        condition: Expr,
        body: Block,
        else_body: Block,
    },
    While {
        condition: Expr,
        body: Block,
    },
    Match(MatchStmt),
    Assert {
        predicate: Expr,
        message: String,
    },
    /// A function call in statement position.
    Call(FuncCall),
    /// A bare nested block with its own scope.
    Block(Block),
}

/// An immutable binding. Shadowing an earlier `let` is allowed;
/// shadowing a `mutable` is rejected during parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    pub var: VarWithType,
    pub val: Expr,
}

/// A mutable binding: identical to `let` but the name is also recorded
/// in the mutables set, permitting later `=` assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct MutStmt {
    pub var: VarWithType,
    pub initial: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Var(VarWithType),
    Index(ArrayValue),
}

/// Indexed access `base[index]` into an array or slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub base: VarWithType,
    pub index: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchStmt {
    pub condition: Expr,
    pub cases: Vec<MatchCase>,
}

/// One `case` arm. For enum discriminants `bindings` names the locals
/// introduced for the constructor's parameters; for sum-type
/// discriminants the condition variable is rebound at the narrowed type.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: MatchPattern,
    pub bindings: Vec<VarWithType>,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchPattern {
    /// Plain value equality (integer, bool, …).
    Value(Expr),
    /// An enum constructor, optionally destructuring its parameters.
    Enum(EnumOption),
    /// A member type of a sum-typed discriminant.
    Type(Type),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Geq,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Geq
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncCall {
    pub name: String,
    pub args: Vec<Expr>,
    /// The callee's declared return tuple, filled from its prototype.
    pub returns: Vec<VarWithType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLiteral(i64),
    BoolLiteral(bool),
    /// Raw literal text: escape sequences (`\n`, `\"`) are kept verbatim
    /// until emission.
    StringLiteral(String),
    Var(VarWithType),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call(FuncCall),
    /// Construction of an enum value: `Ctor arg0 arg1 …`.
    EnumValue {
        option: EnumOption,
        params: Vec<Expr>,
    },
    /// `{ v0, v1, … }`
    ArrayLiteral(Vec<Expr>),
    Index(ArrayValue),
    /// A (length, base) view over an array, produced by slice casts.
    Slice {
        base: Box<Expr>,
        size: usize,
    },
    Cast {
        val: Box<Expr>,
        typ: Type,
    },
    Tuple(Vec<Expr>),
    /// Parenthesized grouping; precedence was resolved during parsing.
    Brackets(Box<Expr>),
    /// `let` in value position (loop and branch conditions).
    Let(Box<LetStmt>),
}

impl Expr {
    /// The static type of this expression, when it has one.
    pub fn typ(&self) -> Option<Type> {
        match self {
            Expr::IntLiteral(_) => Some(Type::Literal("int".into())),
            Expr::BoolLiteral(_) => Some(Type::Literal("bool".into())),
            Expr::StringLiteral(_) => Some(Type::Literal("string".into())),
            Expr::Var(v) => Some(v.typ.clone()),
            Expr::Binary { op, left, .. } => {
                if op.is_comparison() {
                    Some(Type::Literal("bool".into()))
                } else {
                    left.typ()
                }
            }
            Expr::Call(fc) => match fc.returns.len() {
                0 => None,
                1 => Some(fc.returns[0].typ.clone()),
                _ => Some(Type::Tuple(
                    fc.returns
                        .iter()
                        .map(|r| TupleField {
                            name: r.name.clone(),
                            typ: r.typ.clone(),
                        })
                        .collect(),
                )),
            },
            Expr::EnumValue { option, .. } => Some(Type::Literal(option.parent.clone())),
            Expr::ArrayLiteral(elems) => {
                let base = elems.first().and_then(|e| e.typ())?;
                Some(Type::Array {
                    base: Box::new(base),
                    size: elems.len(),
                })
            }
            Expr::Index(av) => match av.base.typ.concrete() {
                Type::Array { base, .. } | Type::Slice { base } => Some((**base).clone()),
                _ => None,
            },
            Expr::Slice { base, .. } => {
                let elem = match base.typ()?.concrete() {
                    Type::Array { base, .. } | Type::Slice { base } => (**base).clone(),
                    other => other.clone(),
                };
                Some(Type::Slice {
                    base: Box::new(elem),
                })
            }
            Expr::Cast { typ, .. } => Some(typ.clone()),
            Expr::Tuple(elems) => Some(Type::Tuple(
                elems
                    .iter()
                    .map(|e| TupleField {
                        name: String::new(),
                        typ: e.typ().unwrap_or(Type::Literal(String::new())),
                    })
                    .collect(),
            )),
            Expr::Brackets(inner) => inner.typ(),
            Expr::Let(l) => Some(l.var.typ.clone()),
        }
    }

    /// Literal expressions use compatibility checking rather than exact
    /// nominal matching in assignments and calls.
    pub fn is_literal(&self) -> bool {
        match self {
            Expr::IntLiteral(_)
            | Expr::BoolLiteral(_)
            | Expr::StringLiteral(_)
            | Expr::EnumValue { .. }
            | Expr::ArrayLiteral(_) => true,
            Expr::Brackets(inner) => inner.is_literal(),
            _ => false,
        }
    }
}
