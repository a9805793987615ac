//! High-level IR for Mica
//!
//! Each function lowers to a linear opcode sequence over an abstract
//! register file, with structured control flow (IF, LOOP, JUMPTABLE,
//! ASSERT) that the MLIR pass later flattens. Registers are ids only;
//! their size and signedness live in the [`RegisterData`] side table.

use std::collections::HashMap;

use crate::ast::{
    ArrayValue, AssignTarget, BinOp, Block, Decl, Expr, FuncCall, FuncDecl, LetStmt,
    MatchPattern, MatchStmt, Stmt, VarWithType,
};
use crate::parser::Callables;
use crate::types::{Type, TypeInfo, TypeRegistry};

/// Mapping from enum constructor name to its discriminant index.
pub type EnumMap = HashMap<String, usize>;

/// Collect the constructor indexes of every enum declaration.
pub fn enum_map(decls: &[Decl]) -> EnumMap {
    let mut map = EnumMap::new();
    for decl in decls {
        if let Decl::Enum(defn) = decl {
            for (i, option) in defn.options.iter().enumerate() {
                map.insert(option.constructor.clone(), i);
            }
        }
    }
    map
}

/// An abstract register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Register {
    IntLiteral(i64),
    /// Raw literal text; becomes a data-symbol reference at emission.
    StringLiteral(String),
    /// A stack-resident binding. Every id maps to exactly one canonical
    /// stack slot.
    LocalValue(usize),
    /// A scratch value that never outlives a call boundary.
    TempValue(usize),
    /// The i-th incoming argument slot. Slice, string, and array
    /// arguments occupy two consecutive slots.
    FuncArg { id: usize, reference: bool },
    /// The i-th return slot of the current function. Slot 0 is the
    /// architectural return register.
    FuncRetVal(usize),
    /// The i-th return slot of call number `call`; valid until the next
    /// CALL is emitted.
    LastFuncCallRetVal { call: usize, ret: usize },
    /// The address of the inner register.
    Pointer(Box<Register>),
    /// A slice's base pointer derived from the inner register.
    SliceBasePointer(Box<Register>),
    /// `base + offset × scale` indexed addressing.
    Offset {
        base: Box<Register>,
        offset: Box<Register>,
        scale: usize,
    },
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Register::IntLiteral(n) => write!(f, "${}", n),
            Register::StringLiteral(s) => write!(f, "$\"{}\"", s),
            Register::LocalValue(id) => write!(f, "LV{}", id),
            Register::TempValue(id) => write!(f, "TV{}", id),
            Register::FuncArg { id, .. } => write!(f, "P{}", id),
            Register::FuncRetVal(id) => write!(f, "FR{}", id),
            Register::LastFuncCallRetVal { call, ret } => write!(f, "LFC{}.{}", call, ret),
            Register::Pointer(inner) => write!(f, "&{}", inner),
            Register::SliceBasePointer(inner) => write!(f, "&base({})", inner),
            Register::Offset {
                base,
                offset,
                scale,
            } => write!(f, "&({}+{}*{})", base, offset, scale),
        }
    }
}

/// Metadata for one register: display name, type info, and slice
/// bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RegisterInfo {
    pub name: String,
    pub type_info: TypeInfo,
    pub variable: Option<VarWithType>,
    /// Element count; only meaningful for slice length registers.
    pub slice_size: usize,
    pub creator: Option<VarWithType>,
}

/// Side table mapping registers to their metadata. Allocation and
/// metadata assignment happen in a single operation.
#[derive(Debug, Clone, Default)]
pub struct RegisterData {
    info: HashMap<Register, RegisterInfo>,
}

impl RegisterData {
    pub fn insert(&mut self, reg: Register, info: RegisterInfo) {
        self.info.insert(reg, info);
    }

    pub fn get(&self, reg: &Register) -> Option<&RegisterInfo> {
        self.info.get(reg)
    }

    pub fn type_info(&self, reg: &Register) -> TypeInfo {
        self.info
            .get(reg)
            .map(|i| i.type_info)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Geq,
}

/// A condition: the opcodes computing it plus the register holding the
/// result.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub body: Vec<Opcode>,
    pub register: Register,
}

/// One arm of a JUMPTABLE.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpCase {
    pub condition: Condition,
    pub body: Vec<Opcode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Mov {
        src: Register,
        dst: Register,
    },
    Arith {
        op: ArithOp,
        left: Register,
        right: Register,
        dst: Register,
    },
    Cmp {
        op: CmpOp,
        left: Register,
        right: Register,
        dst: Register,
    },
    Call {
        fname: String,
        args: Vec<Register>,
        tail_call: bool,
    },
    Ret,
    If {
        condition: Condition,
        body: Vec<Opcode>,
        else_body: Vec<Opcode>,
    },
    Loop {
        /// Populated only when the condition introduces shadows: run
        /// once before loop entry.
        initializer: Vec<Opcode>,
        condition: Condition,
        body: Vec<Opcode>,
    },
    JumpTable(Vec<JumpCase>),
    Assert {
        predicate: Condition,
        message: String,
    },
}

/// A lowered function body.
#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub name: String,
    pub body: Vec<Opcode>,
    pub num_args: usize,
    pub num_locals: usize,
}

/// Internal consistency failures during IR generation. User-level
/// failures (incompatible sum members, undefined callees) surface here;
/// impossible states panic.
#[derive(Debug)]
pub struct IrError(pub String);

impl std::fmt::Display for IrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IrError {}

fn arith(op: ArithOp, left: Register, right: Register, dst: Register) -> Opcode {
    Opcode::Arith {
        op,
        left,
        right,
        dst,
    }
}

fn cmp(op: CmpOp, left: Register, right: Register, dst: Register) -> Opcode {
    Opcode::Cmp {
        op,
        left,
        right,
        dst,
    }
}

/// Byte length of a string literal after escape processing: `\n` and
/// `\"` each collapse to one byte.
pub fn str_literal_len(s: &str) -> usize {
    let mut len = 0;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(_) => len += 1,
                None => len += 1,
            }
        } else {
            len += c.len_utf8();
        }
    }
    len
}

/// Generate the HLIR for one function declaration.
pub fn generate(
    decl: &FuncDecl,
    type_infos: &TypeRegistry,
    callables: &Callables,
    enums: &EnumMap,
) -> Result<(Func, RegisterData), IrError> {
    let mut ctx = FuncContext::new(type_infos, callables, enums);

    let mut nargs = 0usize;
    for arg in &decl.args {
        nargs = ctx.claim_arg_slots(arg, nargs);
    }
    ctx.num_func_args = nargs;

    let mut rn = 0usize;
    for (i, rv) in decl.ret.iter().enumerate() {
        if let Type::Sum(_) = rv.typ.concrete() {
            ctx.ret_sum_types.insert(i, rv.typ.clone());
        }
        for slot in rv.typ.slots(type_infos) {
            ctx.rettypes.push(slot);
            ctx.register_info.insert(
                Register::FuncRetVal(rn),
                RegisterInfo {
                    name: String::new(),
                    type_info: slot,
                    variable: Some(rv.clone()),
                    slice_size: 0,
                    creator: Some(rv.clone()),
                },
            );
            rn += 1;
        }
    }

    let mut body = ctx.compile_block(&decl.body)?;
    if !matches!(body.last(), Some(Opcode::Ret)) {
        body.push(Opcode::Ret);
    }

    tracing::debug!(func = %decl.name, ops = body.len(), locals = ctx.next_local, "generated hlir");
    Ok((
        Func {
            name: decl.name.clone(),
            body,
            num_args: nargs,
            num_locals: ctx.next_local,
        },
        ctx.register_info,
    ))
}

struct FuncContext<'a> {
    values: HashMap<String, Register>,
    slice_base: HashMap<String, Register>,
    next_local: usize,
    next_temp: usize,
    type_infos: &'a TypeRegistry,
    callables: &'a Callables,
    enums: &'a EnumMap,
    rettypes: Vec<TypeInfo>,
    ret_sum_types: HashMap<usize, Type>,
    register_info: RegisterData,
    /// Monotone per-function call counter; reset for every function.
    call_num: usize,
    loop_cond: bool,
    loop_initializer: Vec<Opcode>,
    num_func_args: usize,
}

impl<'a> FuncContext<'a> {
    fn new(type_infos: &'a TypeRegistry, callables: &'a Callables, enums: &'a EnumMap) -> Self {
        FuncContext {
            values: HashMap::new(),
            slice_base: HashMap::new(),
            next_local: 0,
            next_temp: 0,
            type_infos,
            callables,
            enums,
            rettypes: Vec::new(),
            ret_sum_types: HashMap::new(),
            register_info: RegisterData::default(),
            call_num: 0,
            loop_cond: false,
            loop_initializer: Vec::new(),
            num_func_args: 0,
        }
    }

    // ------------------------------------------------------------------
    // Register allocation
    // ------------------------------------------------------------------

    fn next_temp_register(&mut self) -> Register {
        let r = Register::TempValue(self.next_temp);
        self.next_temp += 1;
        r
    }

    /// Reserve the next local slot for `var` and record its metadata.
    fn next_local_register(&mut self, var: &VarWithType) -> Register {
        if var.name.is_empty() {
            panic!("No name for variable");
        }
        let lv = Register::LocalValue(self.next_local);
        self.next_local += 1;
        self.values.insert(var.name.clone(), lv.clone());
        self.register_info.insert(
            lv.clone(),
            RegisterInfo {
                name: var.name.clone(),
                type_info: var.typ.info(self.type_infos),
                variable: Some(var.clone()),
                slice_size: 0,
                creator: None,
            },
        );
        lv
    }

    /// Reserve argument slot `id` for `var`. Must happen for every
    /// parameter before any local registers are allocated.
    fn func_param_register(&mut self, var: &VarWithType, id: usize, info: TypeInfo) -> Register {
        let fa = Register::FuncArg {
            id,
            reference: var.reference,
        };
        self.values.insert(var.name.clone(), fa.clone());
        self.register_info.insert(
            fa.clone(),
            RegisterInfo {
                name: var.name.clone(),
                type_info: info,
                variable: Some(var.clone()),
                slice_size: 0,
                creator: None,
            },
        );
        fa
    }

    /// Record a slot's metadata without binding a variable name to it.
    fn note_arg_slot(&mut self, id: usize, reference: bool, info: TypeInfo, var: &VarWithType) {
        self.register_info.insert(
            Register::FuncArg { id, reference },
            RegisterInfo {
                name: String::new(),
                type_info: info,
                variable: Some(var.clone()),
                slice_size: 0,
                creator: Some(var.clone()),
            },
        );
    }

    /// Claim the incoming argument slots for one declared parameter,
    /// returning the next free slot index.
    fn claim_arg_slots(&mut self, arg: &VarWithType, mut nargs: usize) -> usize {
        match arg.typ.concrete() {
            Type::Slice { .. } => {
                // Slices pass as {length, base pointer}: two slots. The
                // variable maps to the length slot.
                self.func_param_register(arg, nargs, TypeInfo::new(0, false));
                nargs += 1;
                self.note_arg_slot(nargs, arg.reference, TypeInfo::new(8, false), arg);
                nargs += 1;
            }
            Type::Literal(name) if name == "string" => {
                self.func_param_register(arg, nargs, TypeInfo::new(0, false));
                nargs += 1;
                self.note_arg_slot(nargs, arg.reference, TypeInfo::new(8, false), arg);
                nargs += 1;
            }
            Type::Array { .. } => {
                // Arrays pass as if they were slices; the variable maps
                // to the base-pointer slot.
                let size_var = VarWithType::new(
                    format!("{}.size", arg.name),
                    Type::Literal("uint64".to_string()),
                );
                self.func_param_register(&size_var, nargs, TypeInfo::new(8, false));
                nargs += 1;
                self.func_param_register(arg, nargs, TypeInfo::new(8, false));
                nargs += 1;
            }
            Type::Sum(_) => {
                self.func_param_register(arg, nargs, TypeInfo::new(0, false));
                nargs += 1;
                self.note_arg_slot(nargs, arg.reference, TypeInfo::default(), arg);
                nargs += 1;
            }
            Type::Enum(defn) => {
                self.func_param_register(arg, nargs, TypeInfo::new(0, false));
                nargs += 1;
                for _ in 0..defn.max_params() {
                    self.note_arg_slot(nargs, arg.reference, TypeInfo::default(), arg);
                    nargs += 1;
                }
            }
            Type::Tuple(fields) => {
                self.func_param_register(arg, nargs, TypeInfo::default());
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        self.note_arg_slot(
                            nargs,
                            arg.reference,
                            field.typ.info(self.type_infos),
                            arg,
                        );
                    }
                    nargs += 1;
                }
            }
            _ => {
                let info = arg.typ.info(self.type_infos);
                self.func_param_register(arg, nargs, info);
                nargs += 1;
            }
        }
        nargs
    }

    fn get(&self, name: &str) -> Register {
        match self.values.get(name) {
            Some(r) => r.clone(),
            None => panic!("Could not get variable named {}", name),
        }
    }

    fn safe_get(&self, name: &str) -> Option<Register> {
        self.values.get(name).cloned()
    }

    fn set_local(&mut self, name: &str, reg: Register) {
        self.values.insert(name.to_string(), reg);
    }

    fn enum_index(&self, constructor: &str) -> usize {
        match self.enums.get(constructor) {
            Some(i) => *i,
            None => panic!("Attempt to retrieve invalid enum option {}", constructor),
        }
    }

    /// Step a local or argument register forward by `by` slots.
    fn advance_register(&self, reg: &Register, by: usize) -> Register {
        match reg {
            Register::LocalValue(id) => Register::LocalValue(id + by),
            Register::FuncArg { id, reference } => Register::FuncArg {
                id: id + by,
                reference: *reference,
            },
            other => panic!("Can not advance register {}", other),
        }
    }

    fn get_register(&self, expr: &Expr) -> Register {
        match expr {
            Expr::StringLiteral(s) => Register::StringLiteral(s.clone()),
            Expr::IntLiteral(n) => Register::IntLiteral(*n),
            Expr::BoolLiteral(b) => Register::IntLiteral(if *b { 1 } else { 0 }),
            Expr::Var(v) => self.get(&v.name),
            Expr::EnumValue { option, .. } => {
                Register::IntLiteral(self.enum_index(&option.constructor) as i64)
            }
            other => panic!("Unhandled expression in get_register: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn compile_block(&mut self, block: &Block) -> Result<Vec<Opcode>, IrError> {
        let mut ops = Vec::new();
        for stmt in &block.stmts {
            match stmt {
                Stmt::Call(fc) => {
                    if fc.name == "len" {
                        continue;
                    }
                    let call_ops = self.call_func(fc, false)?;
                    ops.extend(call_ops);
                }
                Stmt::Let(l) => self.compile_binding(&mut ops, &l.var, &l.val)?,
                Stmt::Mut(m) => self.compile_binding(&mut ops, &m.var, &m.initial)?,
                Stmt::Return { val } => self.compile_return(&mut ops, val.as_ref())?,
                Stmt::Assign { target, value } => {
                    self.compile_assignment(&mut ops, target, value)?;
                }
                Stmt::If {
                    condition,
                    body,
                    else_body,
                } => {
                    let saved = self.values.clone();
                    let (cbody, c) = self.evaluate_value(condition)?;
                    let body_ops = self.compile_block(body)?;
                    let else_ops = self.compile_block(else_body)?;
                    ops.push(Opcode::If {
                        condition: Condition {
                            body: cbody,
                            register: c[0].clone(),
                        },
                        body: body_ops,
                        else_body: else_ops,
                    });
                    self.values = saved;
                }
                Stmt::While { condition, body } => {
                    self.loop_cond = true;
                    self.loop_initializer.clear();
                    let (cbody, c) = self.evaluate_value(condition)?;
                    self.loop_cond = false;
                    let initializer = std::mem::take(&mut self.loop_initializer);

                    let body_ops = self.compile_block(body)?;
                    ops.push(Opcode::Loop {
                        initializer,
                        condition: Condition {
                            body: cbody,
                            register: c[0].clone(),
                        },
                        body: body_ops,
                    });
                }
                Stmt::Match(m) => self.compile_match(&mut ops, m)?,
                Stmt::Assert { predicate, message } => {
                    let (pbody, pregs) = self.evaluate_value(predicate)?;
                    ops.push(Opcode::Assert {
                        predicate: Condition {
                            body: pbody,
                            register: pregs[0].clone(),
                        },
                        message: message.clone(),
                    });
                }
                Stmt::Block(b) => {
                    let saved = self.values.clone();
                    let inner = self.compile_block(b)?;
                    ops.extend(inner);
                    self.values = saved;
                }
            }
        }
        Ok(ops)
    }

    /// `let` and `mutable` share their lowering; mutability was enforced
    /// during parsing.
    fn compile_binding(
        &mut self,
        ops: &mut Vec<Opcode>,
        var: &VarWithType,
        val: &Expr,
    ) -> Result<(), IrError> {
        // Slices store their size ahead of the elements, so the size
        // register is claimed before the value is evaluated.
        if let Type::Slice { .. } = var.typ.concrete() {
            match val {
                Expr::Var(src) => {
                    // Aliasing needs no IR, just a scope entry pointing at
                    // the existing registers.
                    let nvr = self.get(&src.name);
                    self.set_local(&var.name, nvr);
                    if let Some(base) = self.slice_base.get(&src.name).cloned() {
                        self.slice_base.insert(var.name.clone(), base);
                    }
                    return Ok(());
                }
                Expr::Cast { .. } => {
                    self.next_local_register(var);
                }
                Expr::ArrayLiteral(elems) => {
                    let reg = self.next_local_register(var);
                    ops.push(Opcode::Mov {
                        src: Register::IntLiteral(elems.len() as i64),
                        dst: reg.clone(),
                    });
                    if let Some(info) = self.register_info.info.get_mut(&reg) {
                        info.slice_size = elems.len();
                    }
                }
                Expr::Slice { base, size } => {
                    let reg = self.next_local_register(var);
                    ops.push(Opcode::Mov {
                        src: Register::IntLiteral(*size as i64),
                        dst: reg.clone(),
                    });
                    if let Some(info) = self.register_info.info.get_mut(&reg) {
                        info.slice_size = *size;
                        info.creator = Some(var.clone());
                    }
                    let (bops, brvs) = self.evaluate_value(base)?;
                    ops.extend(bops);
                    self.slice_base.insert(var.name.clone(), brvs[0].clone());
                }
                other => panic!("Unhandled value in slice binding: {:?}", other),
            }
        }

        // The old binding, if any, stays visible while the initializer is
        // evaluated: `let x = x + 1` reads the shadowed value.
        let (body, rvs) = self.evaluate_value(val)?;
        ops.extend(body);

        match var.typ.concrete().clone() {
            Type::Array { base, .. } => {
                for (i, r) in rvs.iter().enumerate() {
                    let entry = VarWithType::new(format!("{}[{}]", var.name, i), (*base).clone());
                    let reg = self.next_local_register(&entry);
                    ops.push(Opcode::Mov {
                        src: r.clone(),
                        dst: reg.clone(),
                    });
                    if i == 0 {
                        self.values.insert(var.name.clone(), reg);
                    }
                }
            }
            Type::Slice { base } => {
                for (i, r) in rvs.iter().enumerate() {
                    let entry = VarWithType::new(format!("{}[{}]", var.name, i), (*base).clone());
                    let reg = self.next_local_register(&entry);
                    ops.push(Opcode::Mov {
                        src: r.clone(),
                        dst: reg,
                    });
                }
            }
            _ => {
                for (i, r) in rvs.iter().enumerate() {
                    let reg = if i == 0 {
                        self.next_local_register(var)
                    } else {
                        let entry = VarWithType::new(format!("{}[{}]", var.name, i), var.typ.clone());
                        let reg = self.next_local_register(&entry);
                        // Carry the source's metadata onto the implicit
                        // extra slot.
                        if let Some(src_info) = self.register_info.get(r).cloned() {
                            let mut info = src_info;
                            info.name = entry.name.clone();
                            info.variable = Some(entry.clone());
                            self.register_info.insert(reg.clone(), info);
                        }
                        reg
                    };
                    if i == 0 {
                        self.values.insert(var.name.clone(), reg.clone());
                    }
                    ops.push(Opcode::Mov {
                        src: r.clone(),
                        dst: reg,
                    });
                }
                // Enum bindings always span tag + widest-constructor
                // slots so that pattern destructuring and argument
                // passing see one layout.
                if let Type::Enum(defn) = var.typ.concrete() {
                    for extra in rvs.len()..(1 + defn.max_params()) {
                        let entry =
                            VarWithType::new(format!("{}[{}]", var.name, extra), var.typ.clone());
                        let reg = self.next_local_register(&entry);
                        ops.push(Opcode::Mov {
                            src: Register::IntLiteral(0),
                            dst: reg,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_return(
        &mut self,
        ops: &mut Vec<Opcode>,
        val: Option<&Expr>,
    ) -> Result<(), IrError> {
        match val {
            None => {}
            Some(Expr::Call(fc)) if fc.name != "len" => {
                // A call directly wrapped by return is a tail-call
                // candidate; the callee leaves its values in the return
                // slots.
                let call_ops = self.call_func(fc, true)?;
                ops.extend(call_ops);
            }
            Some(Expr::EnumValue { option, params }) => {
                ops.push(Opcode::Mov {
                    src: Register::IntLiteral(self.enum_index(&option.constructor) as i64),
                    dst: Register::FuncRetVal(0),
                });
                for (i, p) in params.iter().enumerate() {
                    let (pops, pregs) = self.evaluate_value(p)?;
                    ops.extend(pops);
                    ops.push(Opcode::Mov {
                        src: pregs[0].clone(),
                        dst: Register::FuncRetVal(1 + i),
                    });
                }
            }
            Some(arg) => {
                if !self.rettypes.is_empty() {
                    if let Some(Type::Sum(members)) =
                        self.ret_sum_types.get(&0).map(|t| t.concrete().clone())
                    {
                        let got = arg
                            .typ()
                            .map(|t| t.type_name())
                            .unwrap_or_default();
                        let tag = members
                            .iter()
                            .position(|m| m.type_name() == got)
                            .ok_or_else(|| {
                                IrError(format!("Invalid value for sum type {}", got))
                            })?;
                        ops.push(Opcode::Mov {
                            src: Register::IntLiteral(tag as i64),
                            dst: Register::FuncRetVal(0),
                        });
                        let (body, rvs) = self.evaluate_value(arg)?;
                        ops.extend(body);
                        for (j, v) in rvs.iter().enumerate() {
                            ops.push(Opcode::Mov {
                                src: v.clone(),
                                dst: Register::FuncRetVal(j + 1),
                            });
                        }
                    } else {
                        let (body, rvs) = self.evaluate_value(arg)?;
                        ops.extend(body);
                        for (j, v) in rvs.iter().enumerate() {
                            ops.push(Opcode::Mov {
                                src: v.clone(),
                                dst: Register::FuncRetVal(j),
                            });
                        }
                    }
                }
            }
        }
        ops.push(Opcode::Ret);
        Ok(())
    }

    fn compile_assignment(
        &mut self,
        ops: &mut Vec<Opcode>,
        target: &AssignTarget,
        value: &Expr,
    ) -> Result<(), IrError> {
        match target {
            AssignTarget::Var(v) => {
                let dst = self.get(&v.name);
                let (body, rvs) = self.evaluate_value(value)?;
                ops.extend(body);
                for (i, r) in rvs.iter().enumerate() {
                    let dst_reg = if i == 0 {
                        dst.clone()
                    } else {
                        self.advance_register(&dst, i)
                    };
                    ops.push(Opcode::Mov {
                        src: r.clone(),
                        dst: dst_reg,
                    });
                }
            }
            AssignTarget::Index(av) => {
                let (base, elem_info, scale) = self.index_base(av);
                let (ibody, index) = self.evaluate_value(&av.index)?;
                if index.len() != 1 {
                    return Err(IrError(
                        "Must have exactly one value for index.".to_string(),
                    ));
                }
                let (vbody, rvs) = self.evaluate_value(value)?;
                ops.extend(ibody);
                ops.extend(vbody);
                let dst = Register::Offset {
                    base: Box::new(base),
                    offset: Box::new(index[0].clone()),
                    scale,
                };
                self.register_info.insert(
                    dst.clone(),
                    RegisterInfo {
                        name: String::new(),
                        type_info: elem_info,
                        variable: Some(av.base.clone()),
                        slice_size: 0,
                        creator: Some(av.base.clone()),
                    },
                );
                ops.push(Opcode::Mov {
                    src: rvs[0].clone(),
                    dst,
                });
            }
        }
        Ok(())
    }

    /// Resolve the base register, element info, and addressing scale for
    /// an indexed access. Slice bases sit one slot past the length
    /// register. String elements are (length, pointer) pairs, so their
    /// scale is 16; the backend emulates that with two word loads.
    fn index_base(&self, av: &ArrayValue) -> (Register, TypeInfo, usize) {
        let reg = self.get(&av.base.name);
        let (base_reg, elem) = match av.base.typ.concrete() {
            Type::Array { base, .. } => (reg, (**base).clone()),
            Type::Slice { base } => (self.advance_register(&reg, 1), (**base).clone()),
            Type::Literal(n) if n == "string" => (
                self.advance_register(&reg, 1),
                Type::Literal("byte".to_string()),
            ),
            _ => panic!("Can only index into arrays or slices"),
        };
        let info = elem.info(self.type_infos);
        let scale = if elem.type_name() == "string" {
            16
        } else {
            info.byte_size()
        };
        (base_reg, info, scale)
    }

    fn compile_match(&mut self, ops: &mut Vec<Opcode>, m: &MatchStmt) -> Result<(), IrError> {
        let (cbody, condleft) = self.evaluate_value(&m.condition)?;
        ops.extend(cbody);

        let mut jt: Vec<JumpCase> = Vec::new();
        for case in &m.cases {
            let saved = self.values.clone();
            let condition = match &case.pattern {
                MatchPattern::Type(t) => {
                    let members = match m
                        .condition
                        .typ()
                        .map(|ty| ty.concrete().clone())
                    {
                        Some(Type::Sum(members)) => members,
                        _ => panic!("Type pattern on non-sum discriminant"),
                    };
                    let tag = members
                        .iter()
                        .position(|s| s.type_name() == t.type_name())
                        .ok_or_else(|| {
                            IrError("No match for type in sum type destructuring".to_string())
                        })?;
                    let r = self.next_temp_register();
                    // Rebind the discriminant at the narrowed type: the
                    // payload lives one slot past the tag.
                    if let Expr::Var(v) = &m.condition {
                        let payload = self.advance_register(&condleft[0], 1);
                        self.set_local(&v.name, payload);
                    }
                    Condition {
                        body: vec![Opcode::Cmp {
                            op: CmpOp::Eq,
                            left: condleft[0].clone(),
                            right: Register::IntLiteral(tag as i64),
                            dst: r.clone(),
                        }],
                        register: r,
                    }
                }
                MatchPattern::Enum(option) => {
                    let tag = self.enum_index(&option.constructor);
                    let r = self.next_temp_register();
                    // The constructor's parameters alias the slots after
                    // the discriminant register.
                    for (j, binding) in case.bindings.iter().enumerate() {
                        let slot = self.advance_register(&condleft[0], 1 + j);
                        self.set_local(&binding.name, slot);
                    }
                    Condition {
                        body: vec![Opcode::Cmp {
                            op: CmpOp::Eq,
                            left: condleft[0].clone(),
                            right: Register::IntLiteral(tag as i64),
                            dst: r.clone(),
                        }],
                        register: r,
                    }
                }
                MatchPattern::Value(v) => {
                    let (mut body, condright) = self.evaluate_value(v)?;
                    if matches!(m.condition, Expr::BoolLiteral(true)) {
                        Condition {
                            body,
                            register: condright[0].clone(),
                        }
                    } else {
                        let r = self.next_temp_register();
                        body.push(Opcode::Cmp {
                            op: CmpOp::Eq,
                            left: condleft[0].clone(),
                            right: condright[0].clone(),
                            dst: r.clone(),
                        });
                        Condition { body, register: r }
                    }
                }
            };

            let body = self.compile_block(&case.body)?;
            jt.push(JumpCase { condition, body });
            self.values = saved;
        }
        ops.push(Opcode::JumpTable(jt));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_func(&mut self, fc: &FuncCall, tailcall: bool) -> Result<Vec<Opcode>, IrError> {
        let sigs = self
            .callables
            .get(&fc.name)
            .ok_or_else(|| IrError(format!("Can not call undefined function {}", fc.name)))?;
        if sigs.len() > 1 {
            return Err(IrError("Multiple dispatch not yet implemented".to_string()));
        }
        let signature = sigs[0].clone();

        let mut ops: Vec<Opcode> = Vec::new();
        let mut arg_regs: Vec<Register> = Vec::new();

        for (i, arg) in fc.args.iter().enumerate() {
            // A sum-typed parameter gets its member tag prepended.
            if let Some(want) = signature.args.get(i) {
                if let Type::Sum(members) = want.typ.concrete() {
                    let got = arg.typ().map(|t| t.type_name()).unwrap_or_default();
                    let tag = members
                        .iter()
                        .position(|m| m.type_name() == got)
                        .ok_or_else(|| {
                            IrError(format!("{} is not compatible with {}", got, want.typ))
                        })?;
                    arg_regs.push(Register::IntLiteral(tag as i64));
                }
            }

            match arg {
                Expr::EnumValue { params, .. } => {
                    arg_regs.push(self.get_register(arg));
                    for p in params {
                        let (pops, pregs) = self.evaluate_value(p)?;
                        ops.extend(pops);
                        arg_regs.push(pregs[0].clone());
                    }
                    // The parameter claims tag + widest-constructor
                    // slots; shorter constructors pad with zeros.
                    if let Some(want) = signature.args.get(i) {
                        if let Type::Enum(defn) = want.typ.concrete() {
                            for _ in params.len()..defn.max_params() {
                                arg_regs.push(Register::IntLiteral(0));
                            }
                        }
                    }
                }
                Expr::StringLiteral(s) => {
                    // Strings decompose into (length, pointer) pairs so
                    // later phases need no special cases.
                    arg_regs.push(Register::IntLiteral(str_literal_len(s) as i64));
                    arg_regs.push(self.get_register(arg));
                }
                Expr::IntLiteral(_) | Expr::BoolLiteral(_) => {
                    arg_regs.push(self.get_register(arg));
                }
                Expr::Cast { val, typ } => {
                    self.call_arg_cast(&mut ops, &mut arg_regs, val, typ)?;
                }
                Expr::Index(_) => {
                    let (aops, rvs) = self.evaluate_value(arg)?;
                    ops.extend(aops);
                    arg_regs.extend(rvs);
                }
                Expr::Var(v) => {
                    self.call_arg_var(&mut arg_regs, v, signature.args.get(i))?;
                }
                Expr::Call(_) => {
                    let (aops, _) = self.evaluate_value(arg)?;
                    ops.extend(aops);
                    arg_regs.push(Register::LastFuncCallRetVal {
                        call: self.call_num - 1,
                        ret: 0,
                    });
                }
                Expr::Slice { base, size } => {
                    let (bops, brvs) = self.evaluate_value(base)?;
                    ops.extend(bops);
                    arg_regs.push(Register::IntLiteral(*size as i64));
                    arg_regs.push(Register::SliceBasePointer(Box::new(brvs[0].clone())));
                }
                other => {
                    let (aops, rvs) = self.evaluate_value(other)?;
                    ops.extend(aops);
                    arg_regs.extend(rvs);
                }
            }
        }

        // Register this call's return slots so values stay addressable
        // until the next call overwrites them.
        let mut rv = 0usize;
        for ret in &signature.ret {
            for slot in ret.typ.slots(self.type_infos) {
                self.register_info.insert(
                    Register::LastFuncCallRetVal {
                        call: self.call_num,
                        ret: rv,
                    },
                    RegisterInfo {
                        name: String::new(),
                        type_info: slot,
                        variable: Some(ret.clone()),
                        slice_size: 0,
                        creator: Some(ret.clone()),
                    },
                );
                rv += 1;
            }
        }
        self.call_num += 1;

        // The frame can only be reused when the callee's argument layout
        // is size-compatible with ours.
        let tail = tailcall && arg_regs.len() == self.num_func_args;
        ops.push(Opcode::Call {
            fname: fc.name.clone(),
            args: arg_regs,
            tail_call: tail,
        });
        Ok(ops)
    }

    /// Slice, string, and aggregate variables expand to multiple
    /// argument registers.
    fn call_arg_var(
        &mut self,
        arg_regs: &mut Vec<Register>,
        v: &VarWithType,
        want: Option<&VarWithType>,
    ) -> Result<(), IrError> {
        match v.typ.concrete().clone() {
            Type::Slice { .. } => {
                let lv = self.get(&v.name);
                match lv {
                    Register::LocalValue(_) => {
                        arg_regs.push(lv.clone());
                        if let Some(base) = self.slice_base.get(&v.name).cloned() {
                            arg_regs.push(Register::SliceBasePointer(Box::new(base)));
                        } else {
                            let first = self.get(&format!("{}[0]", v.name));
                            let p = Register::Pointer(Box::new(first));
                            self.register_info.insert(
                                p.clone(),
                                RegisterInfo {
                                    name: String::new(),
                                    type_info: TypeInfo::new(8, false),
                                    variable: Some(v.clone()),
                                    slice_size: 0,
                                    creator: Some(v.clone()),
                                },
                            );
                            arg_regs.push(p);
                        }
                    }
                    Register::FuncArg { id, reference } => {
                        arg_regs.push(Register::FuncArg { id, reference });
                        arg_regs.push(Register::FuncArg {
                            id: id + 1,
                            reference: false,
                        });
                    }
                    other => panic!("Unhandled register type for slice: {}", other),
                }
            }
            Type::Array { size, .. } => {
                arg_regs.push(Register::IntLiteral(size as i64));
                let lv = self.get(&v.name);
                match lv {
                    Register::SliceBasePointer(_) | Register::FuncArg { .. } => {
                        arg_regs.push(lv);
                    }
                    Register::LocalValue(_) => {
                        arg_regs.push(Register::SliceBasePointer(Box::new(lv)));
                    }
                    other => panic!("Unhandled register type for array: {}", other),
                }
            }
            Type::Enum(defn) => {
                // Tag plus the payload slots, which sit right after the
                // tag register.
                let lv = self.get(&v.name);
                arg_regs.push(lv.clone());
                for j in 0..defn.max_params() {
                    arg_regs.push(self.advance_register(&lv, 1 + j));
                }
            }
            _ => {
                let mut lv = self.get(&v.name);
                if want.map(|w| w.reference).unwrap_or(false) {
                    lv = Register::Pointer(Box::new(lv));
                }
                if v.typ.concrete().type_name() == "string" {
                    match lv {
                        Register::LocalValue(id) => {
                            arg_regs.push(Register::LocalValue(id));
                            arg_regs.push(Register::LocalValue(id + 1));
                        }
                        Register::FuncArg { id, reference } => {
                            arg_regs.push(Register::FuncArg { id, reference });
                            arg_regs.push(Register::FuncArg {
                                id: id + 1,
                                reference: false,
                            });
                        }
                        other => panic!("Unhandled register type for string: {}", other),
                    }
                } else {
                    arg_regs.push(lv);
                }
            }
        }
        Ok(())
    }

    fn call_arg_cast(
        &mut self,
        ops: &mut Vec<Opcode>,
        arg_regs: &mut Vec<Register>,
        val: &Expr,
        typ: &Type,
    ) -> Result<(), IrError> {
        if val.is_literal() {
            if let Expr::StringLiteral(s) = val {
                arg_regs.push(Register::IntLiteral(str_literal_len(s) as i64));
                arg_regs.push(self.get_register(val));
            } else {
                arg_regs.push(self.get_register(val));
            }
            return Ok(());
        }
        match typ.concrete() {
            Type::Slice { .. } => {
                let (nops, rvs) = self.evaluate_value(val)?;
                ops.extend(nops);
                match rvs[0].clone() {
                    Register::LocalValue(id) => {
                        arg_regs.push(Register::LocalValue(id));
                        let next = Register::LocalValue(id + 1);
                        self.register_info.insert(
                            next.clone(),
                            RegisterInfo {
                                name: String::new(),
                                type_info: TypeInfo::new(8, false),
                                variable: None,
                                slice_size: 0,
                                creator: None,
                            },
                        );
                        arg_regs.push(next);
                    }
                    Register::FuncArg { id, reference } => {
                        arg_regs.push(Register::FuncArg { id, reference });
                        arg_regs.push(Register::SliceBasePointer(Box::new(Register::FuncArg {
                            id: id + 1,
                            reference: false,
                        })));
                    }
                    other => panic!("Unhandled register type for slice cast: {}", other),
                }
            }
            t if t.type_name() == "string" => {
                let (nops, rvs) = self.evaluate_value(val)?;
                ops.extend(nops);
                match rvs[0].clone() {
                    Register::LocalValue(id) => {
                        arg_regs.push(Register::LocalValue(id));
                        arg_regs.push(Register::Pointer(Box::new(Register::LocalValue(id + 1))));
                    }
                    Register::FuncArg { id, reference } => {
                        arg_regs.push(Register::FuncArg { id, reference });
                        arg_regs.push(Register::Pointer(Box::new(Register::FuncArg {
                            id: id + 1,
                            reference: false,
                        })));
                    }
                    other => panic!("Unhandled register type for string cast: {}", other),
                }
            }
            _ => {
                let (nops, rvs) = self.evaluate_value(val)?;
                ops.extend(nops);
                arg_regs.extend(rvs);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Evaluate a value expression: the opcodes computing it plus the
    /// registers that hold the result.
    fn evaluate_value(&mut self, val: &Expr) -> Result<(Vec<Opcode>, Vec<Register>), IrError> {
        let mut ops = Vec::new();
        match val {
            Expr::Binary { op, left, right } => {
                let (lbody, lregs) = self.evaluate_value(left)?;
                ops.extend(lbody);
                let (rbody, rregs) = self.evaluate_value(right)?;
                ops.extend(rbody);
                let dst = self.next_temp_register();
                let (l, r) = (lregs[0].clone(), rregs[0].clone());
                let opcode = match op {
                    BinOp::Add => arith(ArithOp::Add, l, r, dst.clone()),
                    BinOp::Sub => arith(ArithOp::Sub, l, r, dst.clone()),
                    BinOp::Mul => arith(ArithOp::Mul, l, r, dst.clone()),
                    BinOp::Div => arith(ArithOp::Div, l, r, dst.clone()),
                    BinOp::Mod => arith(ArithOp::Mod, l, r, dst.clone()),
                    BinOp::Eq => cmp(CmpOp::Eq, l, r, dst.clone()),
                    BinOp::Neq => cmp(CmpOp::Neq, l, r, dst.clone()),
                    BinOp::Lt => cmp(CmpOp::Lt, l, r, dst.clone()),
                    BinOp::Lte => cmp(CmpOp::Lte, l, r, dst.clone()),
                    BinOp::Gt => cmp(CmpOp::Gt, l, r, dst.clone()),
                    BinOp::Geq => cmp(CmpOp::Geq, l, r, dst.clone()),
                };
                ops.push(opcode);
                Ok((ops, vec![dst]))
            }
            Expr::StringLiteral(s) => Ok((
                ops,
                vec![
                    Register::IntLiteral(str_literal_len(s) as i64),
                    Register::StringLiteral(s.clone()),
                ],
            )),
            Expr::IntLiteral(_) | Expr::BoolLiteral(_) | Expr::Var(_) => {
                Ok((ops, vec![self.get_register(val)]))
            }
            Expr::Index(av) => {
                let (base, elem_info, scale) = self.index_base(av);
                let offset_reg = match &*av.index {
                    // Literal indexes inline the scale multiplication.
                    Expr::IntLiteral(n) => Register::IntLiteral(*n),
                    other => {
                        let (obody, oregs) = self.evaluate_value(other)?;
                        ops.extend(obody);
                        oregs[0].clone()
                    }
                };
                let a = Register::Offset {
                    base: Box::new(base),
                    offset: Box::new(offset_reg),
                    scale,
                };
                self.register_info.insert(
                    a.clone(),
                    RegisterInfo {
                        name: String::new(),
                        type_info: elem_info,
                        variable: Some(av.base.clone()),
                        slice_size: 0,
                        creator: Some(av.base.clone()),
                    },
                );
                Ok((ops, vec![a]))
            }
            Expr::Call(fc) => {
                if fc.name == "len" {
                    return self.evaluate_len(fc);
                }
                let call_ops = self.call_func(fc, false)?;
                ops.extend(call_ops);
                let mut regs = Vec::new();
                let mut i = 0usize;
                for ret in &fc.returns {
                    for slot in ret.typ.slots(self.type_infos) {
                        let reg = Register::LastFuncCallRetVal {
                            call: self.call_num - 1,
                            ret: i,
                        };
                        self.register_info.insert(
                            reg.clone(),
                            RegisterInfo {
                                name: String::new(),
                                type_info: slot,
                                variable: Some(ret.clone()),
                                slice_size: 0,
                                creator: Some(ret.clone()),
                            },
                        );
                        regs.push(reg);
                        i += 1;
                    }
                }
                Ok((ops, regs))
            }
            Expr::EnumValue { params, .. } => {
                let mut regs = vec![self.get_register(val)];
                for p in params {
                    let (pops, pregs) = self.evaluate_value(p)?;
                    ops.extend(pops);
                    regs.push(pregs[0].clone());
                }
                Ok((ops, regs))
            }
            Expr::ArrayLiteral(elems) => {
                let mut regs = Vec::with_capacity(elems.len());
                for e in elems {
                    let (eops, eregs) = self.evaluate_value(e)?;
                    ops.extend(eops);
                    regs.extend(eregs);
                }
                Ok((ops, regs))
            }
            Expr::Cast { val, .. } => self.evaluate_value(val),
            Expr::Brackets(inner) => self.evaluate_value(inner),
            Expr::Let(l) => self.evaluate_let(l),
            Expr::Tuple(elems) => {
                let mut regs = Vec::new();
                for e in elems {
                    let (eops, eregs) = self.evaluate_value(e)?;
                    ops.extend(eops);
                    regs.extend(eregs);
                }
                Ok((ops, regs))
            }
            Expr::Slice { base, .. } => {
                let (bops, bregs) = self.evaluate_value(base)?;
                Ok((bops, vec![Register::Pointer(Box::new(bregs[0].clone()))]))
            }
        }
    }

    /// Shadowing in value position. Inside a loop condition the shadow
    /// slot is pre-allocated and seeded from the shadowed value before
    /// loop entry; the right-hand side then reads and writes that same
    /// slot on every iteration.
    fn evaluate_let(&mut self, l: &LetStmt) -> Result<(Vec<Opcode>, Vec<Register>), IrError> {
        let mut lv: Option<Register> = None;
        if self.loop_cond {
            if let Some(oldval) = self.safe_get(&l.var.name) {
                let reg = self.next_local_register(&l.var);
                self.loop_initializer.push(Opcode::Mov {
                    src: oldval,
                    dst: reg.clone(),
                });
                lv = Some(reg);
            }
        }
        let (mut ops, rvs) = self.evaluate_value(&l.val)?;
        let lv = match lv {
            Some(reg) => reg,
            None => self.next_local_register(&l.var),
        };
        ops.push(Opcode::Mov {
            src: rvs[0].clone(),
            dst: lv.clone(),
        });
        Ok((ops, vec![lv]))
    }

    /// `len` compiles to a register read, not a call: slices and strings
    /// carry their length in the first slot of the pair, arrays have a
    /// static size.
    fn evaluate_len(&mut self, fc: &FuncCall) -> Result<(Vec<Opcode>, Vec<Register>), IrError> {
        match &fc.args[0] {
            Expr::Var(v) => match v.typ.concrete() {
                Type::Array { size, .. } => {
                    Ok((Vec::new(), vec![Register::IntLiteral(*size as i64)]))
                }
                Type::Slice { .. } => Ok((Vec::new(), vec![self.get(&v.name)])),
                Type::Literal(n) if n == "string" => Ok((Vec::new(), vec![self.get(&v.name)])),
                other => Err(IrError(format!(
                    "len requires a slice, string, or array (got {})",
                    other.type_name()
                ))),
            },
            Expr::StringLiteral(s) => Ok((
                Vec::new(),
                vec![Register::IntLiteral(str_literal_len(s) as i64)],
            )),
            other => Err(IrError(format!(
                "len requires a slice, string, or array (got {:?})",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn hlir_for(src: &str, fname: &str) -> (Func, RegisterData) {
        let program = parser::parse(src).unwrap();
        let enums = enum_map(&program.decls);
        let decl = program.find_func(fname).unwrap();
        generate(decl, &program.type_infos, &program.callables, &enums).unwrap()
    }

    fn find_calls(ops: &[Opcode], out: &mut Vec<(String, usize, bool)>) {
        for op in ops {
            match op {
                Opcode::Call {
                    fname,
                    args,
                    tail_call,
                } => out.push((fname.clone(), args.len(), *tail_call)),
                Opcode::If {
                    condition,
                    body,
                    else_body,
                } => {
                    find_calls(&condition.body, out);
                    find_calls(body, out);
                    find_calls(else_body, out);
                }
                Opcode::Loop {
                    initializer,
                    condition,
                    body,
                } => {
                    find_calls(initializer, out);
                    find_calls(&condition.body, out);
                    find_calls(body, out);
                }
                Opcode::JumpTable(cases) => {
                    for c in cases {
                        find_calls(&c.condition.body, out);
                        find_calls(&c.body, out);
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_args_left_to_right() {
        let (f, _) = hlir_for(
            r#"func g() (int) { return 1 }
            func h() (int) { return 2 }
            func f(a, b int) () { }
            func main() () {
                f(g(), h())
            }"#,
            "main",
        );
        let mut calls = Vec::new();
        find_calls(&f.body, &mut calls);
        let names: Vec<&str> = calls.iter().map(|c| c.0.as_str()).collect();
        assert_eq!(names, vec!["g", "h", "f"]);
    }

    #[test]
    fn test_slice_arg_claims_two_slots() {
        let (f, _) = hlir_for(
            r#"func first(args []string, n int) () {
            }"#,
            "first",
        );
        // Two slots for the slice pair plus one for the int.
        assert_eq!(f.num_args, 3);
    }

    #[test]
    fn test_string_arg_claims_two_slots() {
        let (f, _) = hlir_for(r#"func p(s string) () { }"#, "p");
        assert_eq!(f.num_args, 2);
    }

    #[test]
    fn test_num_locals_matches_max_id() {
        let (f, _) = hlir_for(
            r#"func main() () {
                let a = 1
                let b = 2
                let c = a + b
            }"#,
            "main",
        );
        assert_eq!(f.num_locals, 3);
        let mut max_id = None;
        fn walk(ops: &[Opcode], max_id: &mut Option<usize>) {
            let mut see = |r: &Register| {
                if let Register::LocalValue(id) = r {
                    *max_id = Some(max_id.map_or(*id, |m: usize| m.max(*id)));
                }
            };
            for op in ops {
                match op {
                    Opcode::Mov { src, dst } => {
                        see(src);
                        see(dst);
                    }
                    Opcode::Arith {
                        left, right, dst, ..
                    }
                    | Opcode::Cmp {
                        left, right, dst, ..
                    } => {
                        see(left);
                        see(right);
                        see(dst);
                    }
                    _ => {}
                }
            }
        }
        walk(&f.body, &mut max_id);
        assert_eq!(f.num_locals, max_id.unwrap() + 1);
    }

    #[test]
    fn test_tail_call_marked() {
        let (f, _) = hlir_for(
            r#"func countdown(n int) (int) {
                return countdown(n - 1)
            }"#,
            "countdown",
        );
        let mut calls = Vec::new();
        find_calls(&f.body, &mut calls);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2, "return f(...) must be marked as a tail call");
    }

    #[test]
    fn test_tail_call_requires_compatible_layout() {
        // Caller takes one slot, callee takes two: frame reuse is not
        // size-compatible, so a regular call is emitted.
        let (f, _) = hlir_for(
            r#"func two(a, b int) (int) {
                return a
            }
            func one(n int) (int) {
                return two(n, 3)
            }"#,
            "one",
        );
        let mut calls = Vec::new();
        find_calls(&f.body, &mut calls);
        assert!(!calls[0].2);
    }

    #[test]
    fn test_nested_call_arg_not_tail() {
        let (f, _) = hlir_for(
            r#"func g(n int) (int) { return n }
            func f(n int) (int) {
                return g(g(n))
            }"#,
            "f",
        );
        let mut calls = Vec::new();
        find_calls(&f.body, &mut calls);
        assert_eq!(calls.len(), 2);
        assert!(!calls[0].2, "argument call must not be tail-called");
        assert!(calls[1].2, "outer return call is the tail call");
    }

    #[test]
    fn test_loop_shadow_preallocates_initializer() {
        let (f, _) = hlir_for(
            r#"func main() () -> affects(IO) {
                let i = 0
                while (let i = i + 1) < 3 {
                    PrintInt(i)
                }
            }"#,
            "main",
        );
        let l = f
            .body
            .iter()
            .find_map(|op| match op {
                Opcode::Loop {
                    initializer,
                    condition,
                    ..
                } => Some((initializer.clone(), condition.clone())),
                _ => None,
            })
            .expect("expected a loop");
        let (initializer, condition) = l;
        // One-time initializer copies the outer value into the shadow
        // slot.
        assert_eq!(initializer.len(), 1);
        match &initializer[0] {
            Opcode::Mov { src, dst } => {
                assert_eq!(*src, Register::LocalValue(0));
                assert_eq!(*dst, Register::LocalValue(1));
            }
            other => panic!("expected MOV initializer, got {:?}", other),
        }
        // The condition body writes the same shadow slot it reads.
        let writes_shadow = condition.body.iter().any(|op| {
            matches!(op, Opcode::Mov { dst, .. } if *dst == Register::LocalValue(1))
        });
        assert!(writes_shadow);
    }

    #[test]
    fn test_enum_value_construction() {
        let (f, _) = hlir_for(
            r#"enum Maybe = None | Some int

            func main() () {
                let x Maybe = Some 5
            }"#,
            "main",
        );
        // Tag then payload into consecutive locals.
        match &f.body[0] {
            Opcode::Mov { src, dst } => {
                assert_eq!(*src, Register::IntLiteral(1));
                assert_eq!(*dst, Register::LocalValue(0));
            }
            other => panic!("expected tag MOV, got {:?}", other),
        }
        match &f.body[1] {
            Opcode::Mov { src, dst } => {
                assert_eq!(*src, Register::IntLiteral(5));
                assert_eq!(*dst, Register::LocalValue(1));
            }
            other => panic!("expected payload MOV, got {:?}", other),
        }
    }

    #[test]
    fn test_match_lowers_to_jumptable() {
        let (f, _) = hlir_for(
            r#"enum Maybe = None | Some int

            func main() () -> affects(IO) {
                let x Maybe = Some 5
                match x {
                case None:
                    PrintInt(-1)
                case Some n:
                    PrintInt(n)
                }
            }"#,
            "main",
        );
        let jt = f
            .body
            .iter()
            .find_map(|op| match op {
                Opcode::JumpTable(cases) => Some(cases.clone()),
                _ => None,
            })
            .expect("expected a jump table");
        assert_eq!(jt.len(), 2);
        // Each case tests discriminant equality against its index.
        match &jt[0].condition.body[0] {
            Opcode::Cmp { op, right, .. } => {
                assert_eq!(*op, CmpOp::Eq);
                assert_eq!(*right, Register::IntLiteral(0));
            }
            other => panic!("expected EQ, got {:?}", other),
        }
        match &jt[1].condition.body[0] {
            Opcode::Cmp { right, .. } => assert_eq!(*right, Register::IntLiteral(1)),
            other => panic!("expected EQ, got {:?}", other),
        }
        // The Some case's binding aliases the payload slot, so PrintInt
        // is called with LocalValue(1).
        let mut calls = Vec::new();
        find_calls(&jt[1].body, &mut calls);
        assert_eq!(calls[0].0, "PrintInt");
    }

    #[test]
    fn test_len_is_intrinsic() {
        let (f, _) = hlir_for(
            r#"func main() () {
                let args []string = { "a", "b" }
                let length = len(args)
            }"#,
            "main",
        );
        let mut calls = Vec::new();
        find_calls(&f.body, &mut calls);
        assert!(calls.is_empty(), "len must not emit a CALL");
    }

    #[test]
    fn test_slice_literal_layout() {
        let (f, data) = hlir_for(
            r#"func main() () {
                let xs []int = { 7, 8, 9 }
            }"#,
            "main",
        );
        // Size word first, then consecutive element slots.
        match &f.body[0] {
            Opcode::Mov { src, dst } => {
                assert_eq!(*src, Register::IntLiteral(3));
                assert_eq!(*dst, Register::LocalValue(0));
                let info = data.get(dst).unwrap();
                assert_eq!(info.slice_size, 3);
            }
            other => panic!("expected size MOV, got {:?}", other),
        }
        assert_eq!(f.num_locals, 4);
    }

    #[test]
    fn test_string_literal_len() {
        assert_eq!(str_literal_len("foobar"), 6);
        assert_eq!(str_literal_len(r"a\nb"), 3);
        assert_eq!(str_literal_len(r"\n"), 1);
        assert_eq!(str_literal_len(r#"say \"hi\""#), 8);
    }

    #[test]
    fn test_mutation_through_reference() {
        let (f, _) = hlir_for(
            r#"func changer(mutable x int, y int) (int) {
                x = 4
                return x + y
            }"#,
            "changer",
        );
        // The write goes to the argument slot, which carries the
        // reference flag.
        match &f.body[0] {
            Opcode::Mov { src, dst } => {
                assert_eq!(*src, Register::IntLiteral(4));
                assert_eq!(
                    *dst,
                    Register::FuncArg {
                        id: 0,
                        reference: true
                    }
                );
            }
            other => panic!("expected MOV to argument, got {:?}", other),
        }
    }

    #[test]
    fn test_body_ends_with_ret() {
        let (f, _) = hlir_for(r#"func main() () { let x = 1 }"#, "main");
        assert!(matches!(f.body.last(), Some(Opcode::Ret)));
    }
}
