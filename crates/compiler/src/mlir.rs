//! Mid-level IR for Mica
//!
//! HLIR with the structure removed: IF, LOOP, JUMPTABLE, and ASSERT
//! flatten into labels and conditional jumps, and every register is
//! annotated with its size and signedness from the HLIR side table.
//! Comparisons feeding a branch fuse into the branch; comparisons whose
//! result is stored are materialized through a branch pair.

use crate::config::CompilerConfig;
use crate::hlir::{self, str_literal_len, ArithOp, CmpOp, RegisterData};
use crate::types::TypeInfo;

/// A register annotated with its machine-level properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Register {
    IntLiteral(i64),
    StringLiteral(String),
    LocalValue { id: usize, info: TypeInfo },
    TempValue(usize),
    FuncArg {
        id: usize,
        info: TypeInfo,
        reference: bool,
    },
    /// Outgoing argument slot for the next CALL.
    FuncCallArg { id: usize, info: TypeInfo },
    FuncRetVal { id: usize, info: TypeInfo },
    Pointer(Box<Register>),
    SliceBasePointer(Box<Register>),
    Offset {
        base: Box<Register>,
        offset: Box<Register>,
        scale: usize,
        info: TypeInfo,
    },
}

impl Register {
    /// Size in bytes; 0 means word-sized.
    pub fn size(&self) -> usize {
        match self {
            Register::IntLiteral(_) | Register::StringLiteral(_) => 0,
            Register::LocalValue { info, .. }
            | Register::FuncArg { info, .. }
            | Register::FuncCallArg { info, .. }
            | Register::FuncRetVal { info, .. } => info.size,
            Register::TempValue(_) => 8,
            Register::Pointer(inner) | Register::SliceBasePointer(inner) => inner.size(),
            Register::Offset { info, .. } => info.size,
        }
    }

    pub fn signed(&self) -> bool {
        match self {
            Register::IntLiteral(_) => true,
            Register::StringLiteral(_) => false,
            Register::LocalValue { info, .. }
            | Register::FuncArg { info, .. }
            | Register::FuncCallArg { info, .. }
            | Register::FuncRetVal { info, .. } => info.signed,
            Register::TempValue(_) => true,
            Register::Pointer(inner) | Register::SliceBasePointer(inner) => inner.signed(),
            Register::Offset { info, .. } => info.signed,
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Register::IntLiteral(n) => write!(f, "${}", n),
            Register::StringLiteral(s) => write!(f, "$\"{}\"", s),
            Register::LocalValue { id, .. } => write!(f, "LV{}", id),
            Register::TempValue(id) => write!(f, "TV{}", id),
            Register::FuncArg { id, .. } => write!(f, "P{}", id),
            Register::FuncCallArg { id, .. } => write!(f, "FA{}", id),
            Register::FuncRetVal { id, .. } => write!(f, "FR{}", id),
            Register::Pointer(inner) => write!(f, "&{}", inner),
            Register::SliceBasePointer(inner) => write!(f, "&base({})", inner),
            Register::Offset {
                base,
                offset,
                scale,
                ..
            } => write!(f, "&({}+{}*{})", base, offset, scale),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub String);

impl Label {
    pub fn inline(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.0)
    }
}

/// Condition code for a conditional jump, in amd64 terms: the jump is
/// taken when `src CC dst` holds for the preceding comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl JumpCond {
    fn of(op: CmpOp) -> JumpCond {
        match op {
            CmpOp::Eq => JumpCond::Eq,
            CmpOp::Neq => JumpCond::Ne,
            CmpOp::Lt => JumpCond::Lt,
            CmpOp::Lte => JumpCond::Le,
            CmpOp::Gt => JumpCond::Gt,
            CmpOp::Geq => JumpCond::Ge,
        }
    }

    fn inverse(self) -> JumpCond {
        match self {
            JumpCond::Eq => JumpCond::Ne,
            JumpCond::Ne => JumpCond::Eq,
            JumpCond::Lt => JumpCond::Ge,
            JumpCond::Le => JumpCond::Gt,
            JumpCond::Gt => JumpCond::Le,
            JumpCond::Ge => JumpCond::Lt,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Label(Label),
    Jmp(Label),
    /// `CMP src, dst` then jump to `label` when `src cond dst`.
    JumpIf {
        cond: JumpCond,
        label: Label,
        src: Register,
        dst: Register,
    },
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
    Call {
        fname: String,
        args: Vec<Register>,
        tail_call: bool,
    },
    Ret,
}

/// A flattened function, carrying the numbers the backend needs to size
/// the stack frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Func {
    pub name: String,
    pub body: Vec<Opcode>,
    pub num_args: usize,
    pub num_locals: usize,
    /// Largest outgoing argument count across all CALLs.
    pub largest_func_call: usize,
}

/// Flatten one HLIR function into MLIR.
pub fn lower(func: &hlir::Func, data: &RegisterData, config: &CompilerConfig) -> Func {
    let mut l = Lowering {
        data,
        config,
        label_count: 0,
        largest_func_call: 0,
        out: Vec::new(),
    };
    l.lower_ops(&func.body);
    tracing::debug!(func = %func.name, ops = l.out.len(), "lowered to mlir");
    Func {
        name: func.name.clone(),
        body: l.out,
        num_args: func.num_args,
        num_locals: func.num_locals,
        largest_func_call: l.largest_func_call,
    }
}

struct Lowering<'a> {
    data: &'a RegisterData,
    config: &'a CompilerConfig,
    label_count: usize,
    largest_func_call: usize,
    out: Vec<Opcode>,
}

impl<'a> Lowering<'a> {
    fn fresh_label(&mut self, prefix: &str) -> Label {
        let l = Label(format!("{}{}", prefix, self.label_count));
        self.label_count += 1;
        l
    }

    fn convert(&self, reg: &hlir::Register) -> Register {
        let info = self.data.type_info(reg);
        match reg {
            hlir::Register::IntLiteral(n) => Register::IntLiteral(*n),
            hlir::Register::StringLiteral(s) => Register::StringLiteral(s.clone()),
            hlir::Register::LocalValue(id) => Register::LocalValue { id: *id, info },
            hlir::Register::TempValue(id) => Register::TempValue(*id),
            hlir::Register::FuncArg { id, reference } => Register::FuncArg {
                id: *id,
                info,
                reference: *reference,
            },
            hlir::Register::FuncRetVal(id) => Register::FuncRetVal { id: *id, info },
            // The most recent call's values sit in the return slots
            // until the next CALL clobbers them.
            hlir::Register::LastFuncCallRetVal { ret, .. } => Register::FuncRetVal {
                id: *ret,
                info,
            },
            hlir::Register::Pointer(inner) => Register::Pointer(Box::new(self.convert(inner))),
            hlir::Register::SliceBasePointer(inner) => {
                Register::SliceBasePointer(Box::new(self.convert(inner)))
            }
            hlir::Register::Offset {
                base,
                offset,
                scale,
            } => Register::Offset {
                base: Box::new(self.convert(base)),
                offset: Box::new(self.convert(offset)),
                scale: *scale,
                info,
            },
        }
    }

    fn lower_ops(&mut self, ops: &[hlir::Opcode]) {
        for op in ops {
            self.lower_op(op);
        }
    }

    fn lower_op(&mut self, op: &hlir::Opcode) {
        match op {
            hlir::Opcode::Mov { src, dst } => {
                let src = self.convert(src);
                let dst = self.convert(dst);
                self.out.push(Opcode::Mov { src, dst });
            }
            hlir::Opcode::Arith {
                op,
                left,
                right,
                dst,
            } => {
                let left = self.convert(left);
                let right = self.convert(right);
                let dst = self.convert(dst);
                self.out.push(Opcode::Arith {
                    op: *op,
                    left,
                    right,
                    dst,
                });
            }
            hlir::Opcode::Cmp {
                op,
                left,
                right,
                dst,
            } => {
                // A standalone comparison materializes its boolean
                // through a branch pair.
                let done = self.fresh_label("cmp");
                let dst = self.convert(dst);
                self.out.push(Opcode::Mov {
                    src: Register::IntLiteral(1),
                    dst: dst.clone(),
                });
                self.out.push(Opcode::JumpIf {
                    cond: JumpCond::of(*op),
                    label: done.clone(),
                    src: self.convert(left),
                    dst: self.convert(right),
                });
                self.out.push(Opcode::Mov {
                    src: Register::IntLiteral(0),
                    dst,
                });
                self.out.push(Opcode::Label(done));
            }
            hlir::Opcode::Call {
                fname,
                args,
                tail_call,
            } => {
                let args: Vec<Register> = args.iter().map(|a| self.convert(a)).collect();
                // 16-byte elements expand to two outgoing slots.
                let slots: usize = args
                    .iter()
                    .map(|a| match a {
                        Register::Offset { scale: 16, .. } => 2,
                        _ => 1,
                    })
                    .sum();
                self.largest_func_call = self.largest_func_call.max(slots);
                self.out.push(Opcode::Call {
                    fname: fname.clone(),
                    args,
                    tail_call: *tail_call,
                });
            }
            hlir::Opcode::Ret => self.out.push(Opcode::Ret),
            hlir::Opcode::If {
                condition,
                body,
                else_body,
            } => {
                let else_label = self.fresh_label("else");
                let end_label = self.fresh_label("endif");
                self.lower_condition(condition, &else_label, true);
                self.lower_ops(body);
                if else_body.is_empty() {
                    self.out.push(Opcode::Label(else_label));
                } else {
                    self.out.push(Opcode::Jmp(end_label.clone()));
                    self.out.push(Opcode::Label(else_label));
                    self.lower_ops(else_body);
                    self.out.push(Opcode::Label(end_label));
                }
            }
            hlir::Opcode::Loop {
                initializer,
                condition,
                body,
            } => {
                let start = self.fresh_label("loop");
                let end = self.fresh_label("loopend");
                self.lower_ops(initializer);
                self.out.push(Opcode::Label(start.clone()));
                self.lower_condition(condition, &end, true);
                self.lower_ops(body);
                self.out.push(Opcode::Jmp(start));
                self.out.push(Opcode::Label(end));
            }
            hlir::Opcode::JumpTable(cases) => {
                // Cases are tested top to bottom; the first match wins.
                let end = self.fresh_label("jtend");
                for case in cases {
                    let next = self.fresh_label("jtcase");
                    self.lower_condition(&case.condition, &next, true);
                    self.lower_ops(&case.body);
                    self.out.push(Opcode::Jmp(end.clone()));
                    self.out.push(Opcode::Label(next));
                }
                self.out.push(Opcode::Label(end));
            }
            hlir::Opcode::Assert { predicate, message } => {
                if !self.config.emit_asserts {
                    return;
                }
                let ok = self.fresh_label("assertok");
                self.lower_condition(predicate, &ok, false);
                // Predicate failed: report and exit through the runtime.
                let len = str_literal_len(message) as i64;
                let args = vec![
                    Register::IntLiteral(len),
                    Register::StringLiteral(message.clone()),
                ];
                self.largest_func_call = self.largest_func_call.max(args.len());
                self.out.push(Opcode::Call {
                    fname: "PrintString".to_string(),
                    args,
                    tail_call: false,
                });
                self.out.push(Opcode::Call {
                    fname: "exits".to_string(),
                    args: Vec::new(),
                    tail_call: false,
                });
                self.out.push(Opcode::Label(ok));
            }
        }
    }

    /// Emit a condition's body and a jump to `label`. With `invert` the
    /// jump is taken when the condition FAILS (fall through into the
    /// guarded body); without it, when the condition HOLDS.
    fn lower_condition(&mut self, condition: &hlir::Condition, label: &Label, invert: bool) {
        // When the condition body ends with the comparison producing the
        // condition register, the comparison fuses into the jump.
        if let Some((rest, hlir::Opcode::Cmp {
            op,
            left,
            right,
            dst,
        })) = condition.body.split_last().map(|(l, r)| (r, l))
        {
            if *dst == condition.register {
                self.lower_ops(rest);
                let cond = if invert {
                    JumpCond::of(*op).inverse()
                } else {
                    JumpCond::of(*op)
                };
                self.out.push(Opcode::JumpIf {
                    cond,
                    label: label.clone(),
                    src: self.convert(left),
                    dst: self.convert(right),
                });
                return;
            }
        }
        // Otherwise test the register against zero.
        self.lower_ops(&condition.body);
        self.out.push(Opcode::JumpIf {
            cond: if invert { JumpCond::Eq } else { JumpCond::Ne },
            label: label.clone(),
            src: self.convert(&condition.register),
            dst: Register::IntLiteral(0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlir::enum_map;
    use crate::parser;

    fn mlir_for(src: &str, fname: &str) -> Func {
        let program = parser::parse(src).unwrap();
        let enums = enum_map(&program.decls);
        let decl = program.find_func(fname).unwrap();
        let (f, data) =
            hlir::generate(decl, &program.type_infos, &program.callables, &enums).unwrap();
        lower(&f, &data, &CompilerConfig::default())
    }

    fn call_targets(f: &Func) -> Vec<(String, usize)> {
        f.body
            .iter()
            .filter_map(|op| match op {
                Opcode::Call { fname, args, .. } => Some((fname.clone(), args.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_call_targets_preserved() {
        let src = r#"func g() (int) { return 1 }
        func h() (int) { return 2 }
        func f(a, b int) () { }
        func main() () {
            f(g(), h())
        }"#;
        let f = mlir_for(src, "main");
        let calls = call_targets(&f);
        assert_eq!(
            calls,
            vec![
                ("g".to_string(), 0),
                ("h".to_string(), 0),
                ("f".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_while_flattens_to_labels_and_jumps() {
        let f = mlir_for(
            r#"func main() () -> affects(IO) {
                mutable i = 0
                while i < 3 {
                    i = i + 1
                }
            }"#,
            "main",
        );
        let labels: Vec<&str> = f
            .body
            .iter()
            .filter_map(|op| match op {
                Opcode::Label(l) => Some(l.inline()),
                _ => None,
            })
            .collect();
        assert!(labels.iter().any(|l| l.starts_with("loop")));
        assert!(labels.iter().any(|l| l.starts_with("loopend")));
        // The loop condition `i < 3` fuses into an inverted jump to the
        // end label.
        let jump = f
            .body
            .iter()
            .find_map(|op| match op {
                Opcode::JumpIf { cond, label, .. } => Some((*cond, label.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(jump.0, JumpCond::Ge);
        assert!(jump.1.inline().starts_with("loopend"));
        // And there is a back-edge.
        assert!(f
            .body
            .iter()
            .any(|op| matches!(op, Opcode::Jmp(l) if l.inline().starts_with("loop"))));
    }

    #[test]
    fn test_if_without_else() {
        let f = mlir_for(
            r#"func main() () -> affects(IO) {
                let x = 1
                if x == 1 {
                    PrintInt(x)
                }
            }"#,
            "main",
        );
        // No else body: a single skip label, no unconditional jump.
        let jump = f
            .body
            .iter()
            .find_map(|op| match op {
                Opcode::JumpIf { cond, .. } => Some(*cond),
                _ => None,
            })
            .unwrap();
        assert_eq!(jump, JumpCond::Ne);
        assert!(!f.body.iter().any(|op| matches!(op, Opcode::Jmp(_))));
    }

    #[test]
    fn test_jumptable_tests_in_order() {
        let f = mlir_for(
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
        // Two case tests, each jumping past its body when the tag does
        // not match, and a shared end label.
        let jumps: Vec<JumpCond> = f
            .body
            .iter()
            .filter_map(|op| match op {
                Opcode::JumpIf { cond, .. } => Some(*cond),
                _ => None,
            })
            .collect();
        assert_eq!(jumps, vec![JumpCond::Ne, JumpCond::Ne]);
        let jmps = f
            .body
            .iter()
            .filter(|op| matches!(op, Opcode::Jmp(l) if l.inline().starts_with("jtend")))
            .count();
        assert_eq!(jmps, 2);
    }

    #[test]
    fn test_largest_func_call_tracked() {
        let f = mlir_for(
            r#"func wide(a, b, c int) () { }
            func main() () {
                wide(1, 2, 3)
            }"#,
            "main",
        );
        assert_eq!(f.largest_func_call, 3);
    }

    #[test]
    fn test_standalone_comparison_materializes() {
        let f = mlir_for(
            r#"func main() () {
                let a = 1
                let b = a == 1
            }"#,
            "main",
        );
        // MOV $1, tv; JE done; MOV $0, tv; done:
        let movs: Vec<i64> = f
            .body
            .iter()
            .filter_map(|op| match op {
                Opcode::Mov {
                    src: Register::IntLiteral(n),
                    dst: Register::TempValue(_),
                } => Some(*n),
                _ => None,
            })
            .collect();
        assert!(movs.contains(&1));
        assert!(movs.contains(&0));
        assert!(f
            .body
            .iter()
            .any(|op| matches!(op, Opcode::JumpIf { cond: JumpCond::Eq, .. })));
    }

    #[test]
    fn test_asserts_can_be_discarded() {
        let src = r#"func main() () {
            let x = 1
            assert x == 1
        }"#;
        let program = parser::parse(src).unwrap();
        let enums = enum_map(&program.decls);
        let decl = program.find_func("main").unwrap();
        let (f, data) =
            hlir::generate(decl, &program.type_infos, &program.callables, &enums).unwrap();

        let with = lower(&f, &data, &CompilerConfig::default());
        assert!(with
            .body
            .iter()
            .any(|op| matches!(op, Opcode::Call { fname, .. } if fname == "PrintString")));

        let without = lower(
            &f,
            &data,
            &CompilerConfig::default().with_asserts(false),
        );
        assert!(!without
            .body
            .iter()
            .any(|op| matches!(op, Opcode::Call { .. })));
    }

    #[test]
    fn test_tail_call_flag_survives_lowering() {
        let f = mlir_for(
            r#"func countdown(n int) (int) {
                return countdown(n - 1)
            }"#,
            "countdown",
        );
        assert!(f
            .body
            .iter()
            .any(|op| matches!(op, Opcode::Call { tail_call: true, .. })));
    }
}
