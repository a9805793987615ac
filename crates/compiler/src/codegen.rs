//! amd64 code generation via Plan-9 assembly text
//!
//! Converts each MLIR opcode to one or more assembly instructions.
//! Physical registers are assigned greedily in a fixed order (AX is
//! reserved for the first return value, BP for the platform convention)
//! and values spill to their canonical stack slots when the pool runs
//! dry. After every CALL the register mapping is cleared, so the next
//! read of a local reloads from memory.
//!
//! Register assignment is a function of opcode order and the fixed
//! allocation order: the same MLIR input always yields byte-identical
//! assembly.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::config::CompilerConfig;
use crate::hlir::ArithOp;
use crate::mlir::{self, JumpCond, Label, Opcode, Register};
use crate::types::TypeInfo;

/// Errors the backend can produce on valid IR: register exhaustion and
/// formatting failures. Impossible IR shapes panic; they indicate a bug
/// in an earlier phase.
#[derive(Debug)]
pub enum CodegenError {
    NoRegistersAvailable,
    Format(std::fmt::Error),
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::NoRegistersAvailable => write!(f, "No physical registers available"),
            CodegenError::Format(e) => write!(f, "assembly formatting error: {}", e),
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<std::fmt::Error> for CodegenError {
    fn from(e: std::fmt::Error) -> Self {
        CodegenError::Format(e)
    }
}

/// Allocation order for the general pool. AX is reserved for return
/// value 0 and BP for the frame convention; DX is skipped while a
/// DIV/MOD needs it.
const POOL: [&str; 13] = [
    "BX", "CX", "DX", "SI", "DI", "R8", "R9", "R10", "R11", "R12", "R13", "R14", "R15",
];

#[derive(Default)]
struct RegisterFile {
    ax: Option<Register>,
    pool: [Option<Register>; 13],
}

impl RegisterFile {
    /// Claim the first free register for `r`.
    fn next_physical(&mut self, r: &Register, skip_dx: bool) -> Result<&'static str, CodegenError> {
        for (i, name) in POOL.iter().enumerate() {
            if skip_dx && *name == "DX" {
                continue;
            }
            if self.pool[i].is_none() {
                self.pool[i] = Some(r.clone());
                return Ok(name);
            }
        }
        Err(CodegenError::NoRegistersAvailable)
    }

    /// The first free register, unclaimed.
    fn temp_physical(&self, skip_dx: bool) -> Result<&'static str, CodegenError> {
        for (i, name) in POOL.iter().enumerate() {
            if skip_dx && *name == "DX" {
                continue;
            }
            if self.pool[i].is_none() {
                return Ok(name);
            }
        }
        Err(CodegenError::NoRegistersAvailable)
    }

    /// A second free register for resolving the same op.
    fn temp_physical2(&self, skip_dx: bool) -> Result<&'static str, CodegenError> {
        let mut found = false;
        for (i, name) in POOL.iter().enumerate() {
            if skip_dx && *name == "DX" {
                continue;
            }
            if self.pool[i].is_none() {
                if found {
                    return Ok(name);
                }
                found = true;
            }
        }
        Err(CodegenError::NoRegistersAvailable)
    }

    fn raw_lookup(&self, r: &Register) -> Option<&'static str> {
        if self.ax.as_ref() == Some(r) {
            return Some("AX");
        }
        for (i, name) in POOL.iter().enumerate() {
            if self.pool[i].as_ref() == Some(r) {
                return Some(name);
            }
        }
        None
    }

    fn holder(&self, name: &str) -> Option<&Register> {
        if name == "AX" {
            return self.ax.as_ref();
        }
        let idx = POOL.iter().position(|n| *n == name)?;
        self.pool[idx].as_ref()
    }

    fn clear(&mut self) {
        self.ax = None;
        for slot in &mut self.pool {
            *slot = None;
        }
    }
}

struct Amd64<'a> {
    regs: RegisterFile,
    string_symbols: &'a HashMap<String, String>,
    /// Offsets of local slots relative to FP for the current function.
    lv_offsets: HashMap<usize, usize>,
    /// Local registers known to hold slice base addresses, which must be
    /// read as values rather than taken by address.
    slice_base: HashSet<Register>,
    peephole: bool,
}

impl<'a> Amd64<'a> {
    fn new(string_symbols: &'a HashMap<String, String>, func: &mlir::Func, peephole: bool) -> Self {
        let mut lv_offsets = HashMap::new();
        for id in 0..func.num_locals {
            lv_offsets.insert(id, 8 * (func.num_args + id));
        }
        Amd64 {
            regs: RegisterFile::default(),
            string_symbols,
            lv_offsets,
            slice_base: HashSet::new(),
            peephole,
        }
    }

    fn is_slice_base(&self, r: &Register) -> bool {
        matches!(r, Register::SliceBasePointer(_)) || self.slice_base.contains(r)
    }

    /// The physical register currently holding `r`, with pointer
    /// indirection applied for reference arguments.
    fn get_physical(&self, r: &Register) -> Option<String> {
        let name = self.regs.raw_lookup(r)?;
        if let Register::FuncArg {
            reference: true, ..
        } = r
        {
            return Some(format!("({})", name));
        }
        Some(name.to_string())
    }

    /// Render a register as an operand. `altform` selects the callee
    /// view for return slots and forces the stack form for arguments.
    fn to_physical(&self, r: &Register, altform: bool) -> String {
        match r {
            Register::StringLiteral(s) => {
                let sym = self
                    .string_symbols
                    .get(s)
                    .unwrap_or_else(|| panic!("Uninterned string literal {:?}", s));
                // +8 skips the length prefix.
                format!("${}+8(SB)", sym)
            }
            Register::IntLiteral(n) => format!("${}", n),
            Register::FuncCallArg { id, .. } => format!("{}(SP)", 8 * id),
            Register::LocalValue { id, .. } => {
                format!("LV{}+{}(FP)", id, self.lv_offsets[id])
            }
            Register::FuncRetVal { id, .. } => {
                if *id == 0 {
                    "AX".to_string()
                } else if altform {
                    format!("rv{}+{}(FP)", id, id * 8)
                } else {
                    format!("{}(SP)", id * 8)
                }
            }
            Register::FuncArg { id, .. } => {
                if !altform {
                    if let Some(phys) = self.get_physical(r) {
                        return phys;
                    }
                }
                format!("P{}+{}(FP)", id, id * 8)
            }
            Register::Pointer(inner) => match &**inner {
                Register::LocalValue { .. } => {
                    format!("${}", self.to_physical(inner, false))
                }
                Register::Offset { base, .. } => self.to_physical(base, false),
                other => panic!("Unhandled pointer target {}", other),
            },
            Register::TempValue(_) => match self.get_physical(r) {
                Some(phys) => phys,
                None => panic!("Unknown TempValue register"),
            },
            // The base address; callers index into it themselves.
            Register::Offset { base, .. } => self.to_physical(base, false),
            Register::SliceBasePointer(inner) => self.to_physical(inner, false),
        }
    }

    fn single_reg_suffix(&self, size: usize) -> &'static str {
        match size {
            1 => "B",
            2 => "W",
            4 => "L",
            0 | 8 => "Q",
            other => panic!("Unhandled register size {} in MOV", other),
        }
    }

    /// MOV suffix for a src/dst pair: truncate to the destination width,
    /// or widen with sign/zero extension when the destination is larger.
    fn op_suffix(&self, src: &Register, dst: &Register) -> String {
        let ssize = src.size();
        let dsize = dst.size();
        if ssize == 0 || ssize == dsize {
            self.single_reg_suffix(dsize).to_string()
        } else if dsize == 0 {
            self.single_reg_suffix(ssize).to_string()
        } else if dsize > ssize {
            let mut base = format!(
                "{}{}",
                self.single_reg_suffix(ssize),
                self.single_reg_suffix(dsize)
            );
            if dst.signed() {
                base.push_str("SX");
            } else {
                base.push_str("ZX");
            }
            base
        } else {
            self.single_reg_suffix(dsize).to_string()
        }
    }

    /// Suffix for loading a memory element of `info` into a full
    /// register, widening as needed.
    fn load_suffix(&self, info: TypeInfo) -> String {
        if info.byte_size() >= 8 {
            "Q".to_string()
        } else {
            format!(
                "{}Q{}",
                self.single_reg_suffix(info.size),
                if info.signed { "SX" } else { "ZX" }
            )
        }
    }

    fn convert_instruction(&mut self, op: &Opcode) -> Result<String, CodegenError> {
        match op {
            Opcode::Label(_) | Opcode::Ret => Ok(match op {
                Opcode::Ret => "RET".to_string(),
                Opcode::Label(l) => l.to_string(),
                _ => unreachable!(),
            }),
            Opcode::Jmp(label) => Ok(format!("JMP {}", label.inline())),
            Opcode::JumpIf {
                cond,
                label,
                src,
                dst,
            } => self.convert_jump(*cond, label, src, dst),
            Opcode::Mov { src, dst } => self.convert_mov(src, dst),
            Opcode::Arith {
                op,
                left,
                right,
                dst,
            } => match op {
                ArithOp::Add => self.convert_addsub("ADDQ", left, right, dst),
                ArithOp::Sub => self.convert_addsub("SUBQ", left, right, dst),
                ArithOp::Mul => self.convert_mul(left, right, dst),
                ArithOp::Div => self.convert_divmod(left, right, dst, false),
                ArithOp::Mod => self.convert_divmod(left, right, dst, true),
            },
            Opcode::Call {
                fname,
                args,
                tail_call,
            } => self.convert_call(fname, args, *tail_call),
        }
    }

    /// Resolve a source operand into a physical register, emitting loads
    /// as needed. Literals and immediates come back as `$n` forms.
    fn resolve_src(
        &mut self,
        v: &mut String,
        src: &Register,
        suffix: &str,
    ) -> Result<String, CodegenError> {
        match src {
            Register::TempValue(_) => Ok(self
                .get_physical(src)
                .unwrap_or_else(|| panic!("Unknown TempValue register"))),
            Register::LocalValue { .. }
            | Register::FuncArg { .. }
            | Register::FuncRetVal { .. }
            | Register::Pointer(_)
            | Register::StringLiteral(_) => {
                if let Some(r) = self.get_physical(src) {
                    return Ok(r);
                }
                let t = self.regs.temp_physical(false)?;
                write!(v, "MOV{} {}, {}\n\t", suffix, self.to_physical(src, false), t)?;
                Ok(t.to_string())
            }
            Register::Offset {
                offset,
                scale,
                info,
                ..
            } => {
                if let Some(r) = self.get_physical(src) {
                    return Ok(r);
                }
                let t = self.regs.temp_physical(false)?;
                let offr = match self.get_physical(offset) {
                    Some(r) => r,
                    None => {
                        let r = self.regs.next_physical(offset, false)?.to_string();
                        write!(v, "MOVQ {}, {}\n\t", self.to_physical(offset, false), r)?;
                        r
                    }
                };
                let load = self.load_suffix(*info);
                write!(
                    v,
                    "MOV{} {}({}*{}), {}\n\t",
                    load,
                    self.to_physical(src, false),
                    offr,
                    scale,
                    t
                )?;
                Ok(t.to_string())
            }
            _ => Ok(self.to_physical(src, false)),
        }
    }

    fn convert_mov(&mut self, src: &Register, dst: &Register) -> Result<String, CodegenError> {
        let mut v = String::new();
        let mut returning = false;
        let suffix = self.op_suffix(src, dst);

        let dst_phys: String = match dst {
            Register::FuncRetVal { .. } => {
                returning = true;
                self.to_physical(dst, true)
            }
            Register::TempValue(_) => match self.get_physical(dst) {
                Some(d) => d,
                None => self.regs.next_physical(dst, false)?.to_string(),
            },
            _ => self.to_physical(dst, true),
        };

        // Taking a slice base pointer out of an offset needs the address
        // computed, not the value loaded.
        if let Register::Pointer(inner) = src {
            if let Register::Offset {
                base,
                offset,
                scale,
                ..
            } = &**inner
            {
                if let Some(r) = self.get_physical(src) {
                    write!(v, "MOV{} {}, {}", suffix, r, dst_phys)?;
                    return Ok(v);
                }
                let idx = self.regs.temp_physical(false)?;
                write!(v, "MOVQ {}, {}\n\t", self.to_physical(offset, returning), idx)?;
                write!(
                    v,
                    "MOVQ ${}({}*{}), {}\n\t",
                    self.to_physical(base, false),
                    idx,
                    scale,
                    idx
                )?;
                write!(v, "MOVQ {}, {}", idx, dst_phys)?;
                self.slice_base.insert(dst.clone());
                return Ok(v);
            }
        }

        // A reference destination needs its pointer register claimed
        // before the source resolution grabs a scratch register.
        let ref_reg = match dst {
            Register::FuncArg {
                reference: true, ..
            } => Some(self.regs.next_physical(dst, false)?),
            _ => None,
        };

        let src_phys = match src {
            Register::IntLiteral(_) | Register::FuncCallArg { .. } => {
                self.to_physical(src, returning)
            }
            _ => self.resolve_src(&mut v, src, &suffix)?,
        };

        match dst {
            Register::FuncArg {
                reference: true, ..
            } => {
                // Store through the pointer held in the argument slot.
                let reg = ref_reg.expect("claimed above");
                write!(v, "MOV{} {}, {}\n\t", self.op_suffix(src, dst), dst_phys, reg)?;
                write!(
                    v,
                    "MOV{} {}, ({})",
                    self.single_reg_suffix(dst.size()),
                    src_phys,
                    reg
                )?;
            }
            Register::Offset {
                base,
                offset,
                scale,
                ..
            } => {
                let offr = match self.get_physical(offset) {
                    Some(r) => r,
                    None => {
                        let r = self.regs.next_physical(offset, false)?.to_string();
                        let sfx = match **offset {
                            Register::IntLiteral(_) => "Q".to_string(),
                            _ => self.op_suffix(
                                base,
                                &Register::TempValue(usize::MAX), // word-sized
                            ),
                        };
                        write!(v, "MOV{} {}, {}\n\t", sfx, self.to_physical(offset, false), r)?;
                        r
                    }
                };
                let sfx = self.single_reg_suffix(*scale);
                match &**base {
                    Register::LocalValue { .. } => {
                        let tmp = self.regs.temp_physical(false)?;
                        write!(v, "MOVQ ${}, {}\n\t", dst_phys, tmp)?;
                        write!(v, "MOV{} {}, ({})({}*{})", sfx, src_phys, tmp, offr, scale)?;
                    }
                    Register::FuncArg { .. } => {
                        let tmp = self.regs.temp_physical(false)?;
                        write!(v, "MOVQ {}, {}\n\t", dst_phys, tmp)?;
                        write!(v, "MOV{} {}, ({})({}*{})", sfx, src_phys, tmp, offr, scale)?;
                    }
                    _ => {
                        write!(v, "MOV{} {}, {}({}*{})", sfx, src_phys, dst_phys, offr, scale)?;
                    }
                }
            }
            _ => {
                write!(v, "MOV{} {}, {}", suffix, src_phys, dst_phys)?;
            }
        }
        Ok(v)
    }

    fn convert_addsub(
        &mut self,
        mnemonic: &str,
        left: &Register,
        right: &Register,
        dst: &Register,
    ) -> Result<String, CodegenError> {
        let mut v = String::new();

        // Constant peepholes on subtraction.
        if mnemonic == "SUBQ" && self.peephole {
            match right {
                Register::IntLiteral(0) => {
                    let dstreg = self.dst_register(&mut v, left, dst)?;
                    let _ = dstreg;
                    return Ok(v.trim_end_matches("\n\t").to_string());
                }
                Register::IntLiteral(1) => {
                    let dstreg = self.dst_register(&mut v, left, dst)?;
                    write!(v, "DECQ {}", dstreg)?;
                    return Ok(v);
                }
                Register::IntLiteral(-1) => {
                    let dstreg = self.dst_register(&mut v, left, dst)?;
                    write!(v, "INCQ {}", dstreg)?;
                    return Ok(v);
                }
                _ => {}
            }
        }

        let dstreg = self.dst_register(&mut v, left, dst)?;
        // The right operand moves through a scratch register so that
        // immediates and memory operands take the same path.
        let r = self.regs.temp_physical(true)?;
        let rphys = self.resolve_src(&mut v, right, "Q")?;
        write!(v, "MOVQ {}, {}\n\t", rphys, r)?;
        write!(v, "{} {}, {}", mnemonic, r, dstreg)?;
        Ok(v)
    }

    /// Materialize `dst` as a physical register seeded with `left`.
    fn dst_register(
        &mut self,
        v: &mut String,
        left: &Register,
        dst: &Register,
    ) -> Result<String, CodegenError> {
        let dstreg = match self.get_physical(dst) {
            Some(d) => d,
            None => self.regs.next_physical(dst, false)?.to_string(),
        };
        let lphys = self.resolve_src(v, left, "Q")?;
        write!(v, "MOVQ {}, {}\n\t", lphys, dstreg)?;
        Ok(dstreg)
    }

    fn convert_mul(
        &mut self,
        left: &Register,
        right: &Register,
        dst: &Register,
    ) -> Result<String, CodegenError> {
        let mut v = String::new();
        // MUL multiplies AX by the operand with the overflow in DX, so
        // preserve both when someone else lives there.
        let pop_ax = self.preserve(&mut v, "AX", left)?;
        let pop_dx = self.preserve(&mut v, "DX", dst)?;

        let l = self
            .get_physical(left)
            .unwrap_or_else(|| self.to_physical(left, false));
        write!(v, "MOVQ {}, AX // {}\n\t", l, left)?;

        let r = self.regs.temp_physical(true)?;
        let rt = self
            .get_physical(right)
            .unwrap_or_else(|| self.to_physical(right, false));
        write!(v, "MOVQ {}, {}\n\t", rt, r)?;
        write!(v, "MULQ {}\n\t", r)?;

        let dstreg = match self.get_physical(dst) {
            Some(d) => d,
            None => self.regs.next_physical(dst, false)?.to_string(),
        };
        write!(v, "MOVQ AX, {}", dstreg)?;
        self.restore(&mut v, pop_dx, "DX")?;
        self.restore(&mut v, pop_ax, "AX")?;
        Ok(v)
    }

    fn convert_divmod(
        &mut self,
        left: &Register,
        right: &Register,
        dst: &Register,
        modulo: bool,
    ) -> Result<String, CodegenError> {
        let mut v = String::new();
        // Division clobbers AX (quotient) and DX (remainder).
        let pop_ax = self.preserve(&mut v, "AX", left)?;
        let pop_dx = self.preserve(&mut v, "DX", dst)?;

        if let Register::Offset { offset, scale, .. } = left {
            // Offsets resolve before moving into AX. The widening load
            // zero-extends regardless of element signedness.
            let r = self.regs.temp_physical(false)?;
            let r2 = self.regs.temp_physical2(false)?;
            write!(v, "MOVQ {}, {}\n\t", self.to_physical(offset, false), r)?;
            write!(v, "MOVQ {}, {}\n\t", self.to_physical(left, false), r2)?;
            let load = match *scale {
                1 => "BQZX",
                2 => "WQZX",
                4 => "LQZX",
                _ => "Q",
            };
            write!(v, "MOV{} ({})({}*{}), {}\n\t", load, r2, r, scale, r)?;
            write!(v, "MOVQ {}, AX\n\t", r)?;
        } else {
            let l = self
                .get_physical(left)
                .unwrap_or_else(|| self.to_physical(left, false));
            write!(v, "MOVQ {}, AX // {}\n\t", l, left)?;
        }
        write!(v, "MOVQ $0, DX\n\t")?;

        let r = self.regs.temp_physical2(true)?;
        let rt = self
            .get_physical(right)
            .unwrap_or_else(|| self.to_physical(right, false));
        write!(v, "MOVQ {}, {}\n\t", rt, r)?;

        if left.signed() {
            write!(v, "IDIVQ {}\n\t", r)?;
        } else {
            write!(v, "DIVQ {}\n\t", r)?;
        }

        let result = if modulo { "DX" } else { "AX" };
        let dstreg = match self.get_physical(dst) {
            Some(d) => d,
            None => self.regs.next_physical(dst, false)?.to_string(),
        };
        write!(v, "MOVQ {}, {}", result, dstreg)?;
        self.restore(&mut v, pop_dx, "DX")?;
        self.restore(&mut v, pop_ax, "AX")?;
        Ok(v)
    }

    /// Push `name` when it holds a live value other than `keep`.
    fn preserve(
        &mut self,
        v: &mut String,
        name: &str,
        keep: &Register,
    ) -> Result<bool, CodegenError> {
        match self.regs.holder(name) {
            Some(r) if r != keep => {
                write!(v, "PUSHQ {}\n\t", name)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn restore(&mut self, v: &mut String, popped: bool, name: &str) -> Result<(), CodegenError> {
        if popped {
            write!(v, "\n\tPOPQ {}", name)?;
        }
        Ok(())
    }

    fn convert_jump(
        &mut self,
        cond: JumpCond,
        label: &Label,
        src: &Register,
        dst: &Register,
    ) -> Result<String, CodegenError> {
        let op = match cond {
            JumpCond::Eq => "JE",
            JumpCond::Ne => "JNE",
            JumpCond::Lt => "JL",
            JumpCond::Le => "JLE",
            JumpCond::Gt => "JG",
            JumpCond::Ge => "JGE",
        };
        match src {
            Register::TempValue(_) => {
                let srcr = self
                    .get_physical(src)
                    .unwrap_or_else(|| panic!("Unknown TempValue register"));
                Ok(format!(
                    "CMPQ {}, {}\n\t{} {}",
                    srcr,
                    self.to_physical(dst, false),
                    op,
                    label.inline()
                ))
            }
            Register::Offset {
                base,
                offset,
                scale,
                info,
            } => {
                let mut v = String::new();
                let dstr = match self.get_physical(dst) {
                    Some(d) => d,
                    None => {
                        let d = self.regs.next_physical(dst, false)?.to_string();
                        write!(
                            v,
                            "MOV{} {}, {}\n\t",
                            self.single_reg_suffix(dst.size()),
                            self.to_physical(dst, false),
                            d
                        )?;
                        d
                    }
                };
                let idx = self.regs.temp_physical(false)?;
                let srcr = self.regs.temp_physical2(false)?;
                write!(v, "MOVQ {}, {}\n\t", self.to_physical(offset, false), idx)?;
                match &**base {
                    Register::FuncArg { .. } => {
                        write!(v, "MOVQ {}, {}\n\t", self.to_physical(base, false), srcr)?;
                    }
                    Register::LocalValue { .. } => {
                        if self.is_slice_base(base) {
                            write!(v, "MOVQ {}, {}\n\t", self.to_physical(base, false), srcr)?;
                        } else {
                            write!(v, "MOVQ ${}, {}\n\t", self.to_physical(base, false), srcr)?;
                        }
                    }
                    other => panic!("Unhandled base for offset comparison: {}", other),
                }
                let load = self.load_suffix(*info);
                write!(v, "MOV{} ({})({}*{}), {}\n\t", load, srcr, idx, scale, srcr)?;
                write!(v, "CMPQ {}, {}\n\t{} {}", srcr, dstr, op, label.inline())?;
                Ok(v)
            }
            _ => {
                let srcr = self.regs.temp_physical(false)?;
                let sfx = self.op_suffix(src, dst);
                let mut v = String::new();
                write!(v, "MOV{} {}, {}\n\t", sfx, self.to_physical(src, false), srcr)?;
                let dstr = match dst {
                    Register::TempValue(_) => match self.get_physical(dst) {
                        Some(d) => d,
                        None => self.regs.next_physical(dst, false)?.to_string(),
                    },
                    _ => self.to_physical(dst, false),
                };
                write!(
                    v,
                    "CMP{} {}, {}\n\t{} {}",
                    self.single_reg_suffix(dst.size()),
                    srcr,
                    dstr,
                    op,
                    label.inline()
                )?;
                Ok(v)
            }
        }
    }

    fn convert_call(
        &mut self,
        fname: &str,
        args: &[Register],
        tail_call: bool,
    ) -> Result<String, CodegenError> {
        let mut v = String::new();
        if tail_call {
            // Shuffle every argument that lives in the current frame
            // into a scratch register first, so writing the argument
            // slots can not clobber an unsourced value.
            for arg in args {
                if matches!(arg, Register::FuncArg { .. } | Register::LocalValue { .. }) {
                    let src = self.to_physical(arg, false);
                    let phys = self.regs.next_physical(arg, false)?;
                    let sfx = self.single_reg_suffix(arg.size());
                    write!(v, "// preserving {}\n\tMOV{} {}, {}\n\t", arg, sfx, src, phys)?;
                }
            }
        }

        for (i, arg) in args.iter().enumerate() {
            let dst: Register = if tail_call {
                Register::FuncArg {
                    id: i,
                    info: TypeInfo::new(arg.size(), arg.signed()),
                    reference: false,
                }
            } else {
                Register::FuncCallArg {
                    id: i,
                    info: TypeInfo::new(8, arg.signed()),
                }
            };
            let mut fa = self.to_physical(&dst, true);
            let mut suffix = "Q".to_string();
            let phys_arg: String;

            match arg {
                Register::StringLiteral(_) => {
                    let src = self.to_physical(arg, false);
                    match self.get_physical(arg) {
                        Some(r) => phys_arg = r,
                        None => {
                            let t = self.regs.temp_physical(false)?;
                            write!(v, "MOVQ {}, {}\n\t", src, t)?;
                            phys_arg = t.to_string();
                        }
                    }
                }
                Register::SliceBasePointer(inner) => {
                    match self.get_physical(arg) {
                        Some(r) => phys_arg = r,
                        None => {
                            let t = self.regs.temp_physical(false)?;
                            match &**inner {
                                Register::Offset { offset, scale, .. } => {
                                    let offr = self.regs.temp_physical2(false)?;
                                    write!(
                                        v,
                                        "MOVQ {}, {}\n\t",
                                        self.to_physical(offset, false),
                                        offr
                                    )?;
                                    write!(
                                        v,
                                        "LEAQ {}({}*{}), {}\n\t",
                                        self.to_physical(inner, false),
                                        offr,
                                        scale,
                                        t
                                    )?;
                                }
                                Register::LocalValue { .. } => {
                                    // Pass the address of the base, not
                                    // the value.
                                    write!(
                                        v,
                                        "MOVQ ${}, {}\n\t",
                                        self.to_physical(inner, false),
                                        t
                                    )?;
                                }
                                Register::FuncArg { .. } => {
                                    // Already an address; pass the value.
                                    write!(
                                        v,
                                        "MOVQ {}, {}\n\t",
                                        self.to_physical(inner, false),
                                        t
                                    )?;
                                }
                                other => {
                                    panic!("Unhandled slice base pointer target {}", other)
                                }
                            }
                            phys_arg = t.to_string();
                        }
                    }
                }
                Register::LocalValue { .. }
                | Register::FuncArg { .. }
                | Register::Pointer(_) => {
                    let mut load_sfx = self.op_suffix(arg, &dst);
                    if matches!(arg, Register::Pointer(_)) {
                        load_sfx = "Q".to_string();
                    }
                    let src = self.to_physical(arg, false);
                    match self.get_physical(arg) {
                        Some(r) => phys_arg = r,
                        None => {
                            let t = self.regs.temp_physical(false)?;
                            write!(v, "MOV{} {}, {}\n\t", load_sfx, src, t)?;
                            phys_arg = t.to_string();
                        }
                    }
                }
                Register::TempValue(_) => {
                    suffix = self.op_suffix(arg, &dst);
                    phys_arg = self
                        .get_physical(arg)
                        .unwrap_or_else(|| panic!("Unknown TempValue register"));
                }
                Register::Offset {
                    base,
                    offset,
                    scale,
                    info,
                } => {
                    let src = self.to_physical(arg, false);
                    match self.get_physical(arg) {
                        Some(r) => phys_arg = r,
                        None => {
                            let t = self.regs.next_physical(arg, false)?.to_string();
                            let offr = match self.get_physical(offset) {
                                Some(r) => r,
                                None => {
                                    let r = self.regs.next_physical(offset, false)?.to_string();
                                    write!(
                                        v,
                                        "MOVQ {}, {}\n\t",
                                        self.to_physical(offset, false),
                                        r
                                    )?;
                                    r
                                }
                            };
                            let base_addr = self.regs.temp_physical(false)?;
                            if matches!(&**base, Register::FuncArg { .. })
                                || self.is_slice_base(base)
                            {
                                write!(v, "MOVQ {}, {}\n\t", src, base_addr)?;
                            } else {
                                write!(v, "MOVQ ${}, {}\n\t", src, base_addr)?;
                            }
                            let load = self.load_suffix(*info);
                            let mut scale = *scale;
                            let fakescale = scale == 16;
                            if fakescale {
                                // Scales must be 1, 2, 4, or 8: a 16-byte
                                // element is loaded as two word halves
                                // with the index doubled.
                                write!(v, "SALQ $1, {}\n\t", offr)?;
                                scale = 8;
                            }
                            write!(
                                v,
                                "MOV{} ({})({}*{}), {}\n\t",
                                if fakescale { "Q".to_string() } else { load },
                                base_addr,
                                offr,
                                scale,
                                t
                            )?;
                            if fakescale {
                                if tail_call {
                                    panic!("Unhandled tail call with wide element");
                                }
                                write!(v, "MOVQ {}, {}\n\t", t, fa)?;
                                let dst2 = Register::FuncCallArg {
                                    id: i + 1,
                                    info: TypeInfo::new(8, arg.signed()),
                                };
                                fa = self.to_physical(&dst2, true);
                                write!(v, "INCQ {}\n\t", offr)?;
                                write!(
                                    v,
                                    "MOVQ ({})({}*{}), {}\n\t",
                                    base_addr, offr, scale, t
                                )?;
                            }
                            phys_arg = t;
                        }
                    }
                }
                _ => {
                    phys_arg = self.to_physical(arg, true);
                }
            }
            write!(v, "MOV{} {}, {}\n\t", suffix, phys_arg, fa)?;
        }

        if tail_call {
            // Reuse the stack frame: jump one instruction past the
            // symbol start, skipping the linker-inserted SUBQ $k, SP.
            let tmp = self.regs.temp_physical(false)?;
            write!(v, "MOVQ ${}+14(SB), {}\n\t", fname, tmp)?;
            write!(v, "JMP {}", tmp)?;
            return Ok(v);
        }
        write!(v, "CALL {}+0(SB)", fname)?;
        // The callee owns every register now; forget our mappings.
        self.regs.clear();
        Ok(v)
    }
}

/// Emits a full assembly file: one TEXT symbol per function, the string
/// data symbols, and the fixed runtime stub text.
pub struct CodeGen {
    config: CompilerConfig,
    string_symbols: HashMap<String, String>,
    string_order: Vec<String>,
}

impl CodeGen {
    pub fn new(config: CompilerConfig) -> Self {
        CodeGen {
            config,
            string_symbols: HashMap::new(),
            string_order: Vec::new(),
        }
    }

    pub fn codegen_program(&mut self, funcs: &[mlir::Func]) -> Result<String, CodegenError> {
        for f in funcs {
            for op in &f.body {
                self.intern_strings_in(op);
            }
        }

        let mut out = String::new();
        for f in funcs {
            self.codegen_func(&mut out, f)?;
            writeln!(out)?;
        }
        self.emit_string_globals(&mut out)?;
        out.push_str(RUNTIME_STUBS);
        Ok(out)
    }

    fn intern_strings_in(&mut self, op: &Opcode) {
        let mut see = |r: &Register| self.intern_register(r);
        match op {
            Opcode::Mov { src, dst } => {
                see(src);
                see(dst);
            }
            Opcode::Arith {
                left, right, dst, ..
            } => {
                see(left);
                see(right);
                see(dst);
            }
            Opcode::JumpIf { src, dst, .. } => {
                see(src);
                see(dst);
            }
            Opcode::Call { args, .. } => {
                for a in args {
                    see(a);
                }
            }
            Opcode::Label(_) | Opcode::Jmp(_) | Opcode::Ret => {}
        }
    }

    fn intern_register(&mut self, r: &Register) {
        match r {
            Register::StringLiteral(s) => {
                if !self.string_symbols.contains_key(s) {
                    let sym = format!("str{}", self.string_order.len());
                    self.string_symbols.insert(s.clone(), sym);
                    self.string_order.push(s.clone());
                }
            }
            Register::Pointer(inner) | Register::SliceBasePointer(inner) => {
                self.intern_register(inner)
            }
            Register::Offset { base, offset, .. } => {
                self.intern_register(base);
                self.intern_register(offset);
            }
            _ => {}
        }
    }

    fn codegen_func(&mut self, out: &mut String, f: &mlir::Func) -> Result<(), CodegenError> {
        let mut backend = Amd64::new(&self.string_symbols, f, self.config.peephole);
        let frame_size = 8 * (f.num_locals + f.largest_func_call);
        let arg_size = 8 * f.num_args;
        writeln!(out, "TEXT {}(SB), 0, ${}-{}", f.name, frame_size, arg_size)?;

        // Zero the frame so uninitialized slots read deterministically.
        for id in 0..f.num_locals {
            writeln!(out, "\tMOVQ $0, LV{}+{}(FP)", id, backend.lv_offsets[&id])?;
        }

        for op in &f.body {
            if let Opcode::Label(l) = op {
                writeln!(out, "{}", l)?;
                continue;
            }
            let text = backend.convert_instruction(op)?;
            if text.is_empty() {
                continue;
            }
            writeln!(out, "\t{}", text)?;
        }
        Ok(())
    }

    fn emit_string_globals(&self, out: &mut String) -> Result<(), CodegenError> {
        for lit in &self.string_order {
            let sym = &self.string_symbols[lit];
            let bytes = unescape_string(lit);
            writeln!(out, "DATA {}+0(SB)/8, ${}", sym, bytes.len())?;
            for (i, chunk) in bytes.chunks(8).enumerate() {
                writeln!(
                    out,
                    "DATA {}+{}(SB)/{}, $\"{}\"",
                    sym,
                    8 + i * 8,
                    chunk.len(),
                    escape_asm_bytes(chunk)
                )?;
            }
            writeln!(out, "GLOBL {}(SB), 8+16, ${}", sym, 8 + bytes.len())?;
        }
        Ok(())
    }
}

/// Process source escapes into raw bytes: the data symbol stores what
/// the program sees at runtime, so `\n` becomes a single 0x0A.
fn unescape_string(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => bytes.push(b'\n'),
                Some('t') => bytes.push(b'\t'),
                Some('"') => bytes.push(b'"'),
                Some('\\') => bytes.push(b'\\'),
                Some(other) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => bytes.push(b'\\'),
            }
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    bytes
}

/// Re-escape raw bytes for a `$"…"` assembly operand.
fn escape_asm_bytes(bytes: &[u8]) -> String {
    let mut s = String::new();
    for &b in bytes {
        match b {
            b'\n' => s.push_str("\\n"),
            b'\t' => s.push_str("\\t"),
            b'"' => s.push_str("\\\""),
            b'\\' => s.push_str("\\\\"),
            0x20..=0x7e => s.push(b as char),
            other => s.push_str(&format!("\\{:03o}", other)),
        }
    }
    s
}

/// Fixed runtime text appended to every output: the entry point, the
/// exit path, and the syscall wrappers. `PrintInt` and `PrintString`
/// are linker-provided and only declared by the compiler.
const RUNTIME_STUBS: &str = r#"#define NPRIVATES 16
GLOBL argv(SB), 8+16, $8
GLOBL _tos(SB), 8+16, $8
GLOBL _privates(SB), 8+16, $8
GLOBL _nprivates(SB), 8+16, $4

TEXT	_main(SB), 21, $144
	CALL	main(SB)
loop:
	MOVQ	$0, 0(SP)
	CALL	exits(SB)
	JMP	loop

TEXT exits(SB), 20, $0
	MOVQ $8, BP
	SYSCALL
	RET // Unreached

// ssize_t write(int fd, const void *buf, size_t nbytes)
// Strings are struct{size, [size]char}, so the params get reordered
// for the syscall.
TEXT Write(SB), 20, $0-24
	MOVQ $-1, offset+24(FP)
	MOVQ str+8(FP), R8
	LEAQ 8(R8), SI
	MOVQ 0(R8), DX
	MOVQ DX, nbytes+16(FP)
	MOVQ SI, buf+8(FP)

	MOVQ $51, BP // pwrite syscall
	SYSCALL
	RET

// ssize_t read(int fd, void *buf, size_t nbytes)
TEXT Read(SB), 20, $0-24
	MOVQ $-1, offset+24(FP)
	MOVQ buf+16(FP), SI // buf
	MOVQ len+8(FP), DX // nbytes
	MOVQ DX, nbytes+16(FP)
	MOVQ SI, buf+8(FP)
	MOVQ $50, BP // pread syscall
	SYSCALL
	RET

// int open(char *file, int omode)
// The string parameter is struct{n int, buf [n]byte}; the syscall wants
// a C string, so callers must pass pre-terminated bytes.
TEXT Open(SB), 20, $0-24
	MOVQ file+0(FP), BX
	LEAQ 8(BX), DI
	MOVQ DI, file+0(FP)
	MOVQ $0, omode+8(FP) // omode = 0 = OREAD
	MOVQ $14, BP // open syscall
	SYSCALL
	RET

// int create(char *file, int omode, ulong perm)
// Callers must pass pre-terminated bytes, as with Open.
TEXT Create(SB), 20, $0-24
	MOVQ file+0(FP), BX
	LEAQ 8(BX), DI
	MOVQ 0(BX), CX
	// MOVB $0, (DI)(CX*1)
	MOVQ DI, file+0(FP)
	MOVQ $1, omode+8(FP) // omode = OWRITE
	MOVQ $438, perms+16(FP) // 438 decimal = 0666 octal
	MOVQ $22, BP // create syscall
	SYSCALL
	RET

TEXT Close(SB), 20, $0-8
	MOVQ $4, BP // close syscall
	SYSCALL
	RET

TEXT PrintByteSlice(SB), 20, $0-24
	MOVQ $-1, offset+24(FP)
	MOVQ nbytes+0(FP), DX // nbytes
	MOVQ DX, nbytes+16(FP)
	MOVQ buf+8(FP), SI // buf
	MOVQ SI, buf+8(FP)
	MOVQ $1, fd+0(FP)
	MOVQ $51, BP // pwrite syscall
	SYSCALL
	RET
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlir::{self, enum_map};
    use crate::parser;

    fn compile(src: &str) -> String {
        compile_with(src, CompilerConfig::default())
    }

    fn compile_with(src: &str, config: CompilerConfig) -> String {
        let program = parser::parse(src).unwrap();
        let enums = enum_map(&program.decls);
        let mut funcs = Vec::new();
        for decl in &program.decls {
            if let crate::ast::Decl::Func(f) = decl {
                let (hf, data) =
                    hlir::generate(f, &program.type_infos, &program.callables, &enums).unwrap();
                funcs.push(mlir::lower(&hf, &data, &config));
            }
        }
        CodeGen::new(config).codegen_program(&funcs).unwrap()
    }

    #[test]
    fn test_text_directive_and_frame() {
        let asm = compile(
            r#"func main() () {
                let a = 1
                let b = 2
            }"#,
        );
        // Two locals, no calls: 16-byte frame, no arguments.
        assert!(asm.contains("TEXT main(SB), 0, $16-0"));
        assert!(asm.contains("MOVQ $0, LV0+0(FP)"));
        assert!(asm.contains("MOVQ $0, LV1+8(FP)"));
        assert!(asm.contains("RET"));
    }

    #[test]
    fn test_codegen_is_deterministic() {
        let src = r#"func main() () -> affects(IO) {
            let args []string = { "foo", "bar", "baz" }
            mutable i = 1
            let length = len(args)
            while i < length {
                PrintString(args[i])
                i = i + 1
                if i != length {
                    PrintString(" ")
                }
            }
            PrintString("\n")
        }"#;
        let a = compile(src);
        let b = compile(src);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sub_peepholes() {
        let asm = compile(
            r#"func main() () {
                mutable i = 10
                i = i - 1
            }"#,
        );
        assert!(asm.contains("DECQ"));
        assert!(!asm.contains("SUBQ $1"));

        let plain = compile_with(
            r#"func main() () {
                mutable i = 10
                i = i - 1
            }"#,
            CompilerConfig::default().with_peephole(false),
        );
        assert!(!plain.contains("DECQ"));
        assert!(plain.contains("SUBQ"));
    }

    #[test]
    fn test_sub_minus_one_becomes_inc() {
        let asm = compile(
            r#"func main() () {
                mutable i = 10
                i = i - -1
            }"#,
        );
        assert!(asm.contains("INCQ"));
    }

    #[test]
    fn test_string_symbol_layout() {
        let asm = compile(
            r#"func main() () -> affects(IO) {
                PrintString("foobar")
            }"#,
        );
        // Length prefix, chunked payload, and the +8 reference that
        // skips the prefix.
        assert!(asm.contains("DATA str0+0(SB)/8, $6"));
        assert!(asm.contains("DATA str0+8(SB)/6, $\"foobar\""));
        assert!(asm.contains("GLOBL str0(SB), 8+16, $14"));
        assert!(asm.contains("$str0+8(SB)"));
    }

    #[test]
    fn test_newline_escape_counts_one_byte() {
        let asm = compile(
            r#"func main() () -> affects(IO) {
                PrintString("\n")
            }"#,
        );
        assert!(asm.contains("DATA str0+0(SB)/8, $1"));
        assert!(asm.contains("DATA str0+8(SB)/1, $\"\\n\""));
    }

    #[test]
    fn test_string_deduplicated() {
        let asm = compile(
            r#"func main() () -> affects(IO) {
                PrintString(" ")
                PrintString(" ")
            }"#,
        );
        assert!(asm.contains("str0"));
        assert!(!asm.contains("str1"));
    }

    #[test]
    fn test_tail_call_jumps_past_prologue() {
        let asm = compile(
            r#"func countdown(n int) (int) {
                return countdown(n - 1)
            }"#,
        );
        assert!(asm.contains("$countdown+14(SB)"));
        assert!(asm.contains("JMP"));
    }

    #[test]
    fn test_regular_call_convention() {
        let asm = compile(
            r#"func f(a int) (int) { return a }
            func main() () {
                let x = f(3)
            }"#,
        );
        assert!(asm.contains("CALL f+0(SB)"));
        // Outgoing argument goes to the bottom of the frame.
        assert!(asm.contains("0(SP)"));
    }

    #[test]
    fn test_div_uses_ax_dx() {
        let asm = compile(
            r#"func main() () {
                let a = 10
                let b = a / 3
            }"#,
        );
        assert!(asm.contains("IDIVQ"));
        assert!(asm.contains("MOVQ $0, DX"));
        assert!(asm.contains("MOVQ AX,"));
    }

    #[test]
    fn test_mod_takes_remainder_from_dx() {
        let asm = compile(
            r#"func main() () {
                let a = 10
                let b = a % 3
            }"#,
        );
        assert!(asm.contains("IDIVQ"));
        assert!(asm.contains("MOVQ DX,"));
    }

    #[test]
    fn test_mod_on_indexed_signed_byte_zero_extends() {
        let asm = compile(
            r#"func main() () {
                let a [3]int8 = { -1, 2, 3 }
                let b = a[0] % 2
            }"#,
        );
        // An indexed operand reaches AX through an unconditionally
        // zero-extending widening load, even for signed elements; the
        // division itself still honors the element's signedness.
        assert!(asm.contains("MOVBQZX"));
        assert!(!asm.contains("MOVBQSX"));
        assert!(asm.contains("IDIVQ"));
        assert!(asm.contains("MOVQ DX,"));
    }

    #[test]
    fn test_div_on_indexed_int16_element() {
        let asm = compile(
            r#"func main() () {
                let a [2]int16 = { 100, 7 }
                let b = a[1] / 3
            }"#,
        );
        assert!(asm.contains("MOVWQZX"));
        assert!(!asm.contains("MOVWQSX"));
        assert!(asm.contains("IDIVQ"));
        assert!(asm.contains("MOVQ AX,"));
    }

    #[test]
    fn test_mul_goes_through_ax() {
        let asm = compile(
            r#"func main() () {
                let a = 6
                let b = a * 7
            }"#,
        );
        assert!(asm.contains("MULQ"));
        assert!(asm.contains("MOVQ AX,"));
    }

    #[test]
    fn test_runtime_stubs_appended() {
        let asm = compile(r#"func main() () { }"#);
        assert!(asm.contains("TEXT\t_main(SB), 21, $144"));
        assert!(asm.contains("TEXT exits(SB), 20, $0"));
        assert!(asm.contains("TEXT Write(SB), 20, $0-24"));
        assert!(asm.contains("TEXT Open(SB), 20, $0-24"));
        assert!(asm.contains("TEXT PrintByteSlice(SB), 20, $0-24"));
    }

    #[test]
    fn test_assert_calls_printstring_and_exits() {
        let asm = compile(
            r#"func main() () {
                let x = 1
                assert x == 1 "x must be 1\n"
            }"#,
        );
        assert!(asm.contains("CALL PrintString+0(SB)"));
        assert!(asm.contains("CALL exits+0(SB)"));
        assert!(asm.contains("assertok"));
    }

    #[test]
    fn test_escape_asm_bytes() {
        assert_eq!(escape_asm_bytes(b"hi"), "hi");
        assert_eq!(escape_asm_bytes(b"a\nb"), "a\\nb");
        assert_eq!(escape_asm_bytes(b"\""), "\\\"");
        assert_eq!(escape_asm_bytes(&[0x01]), "\\001");
    }

    #[test]
    fn test_unescape_string() {
        assert_eq!(unescape_string(r"a\nb"), b"a\nb");
        assert_eq!(unescape_string(r#"say \"hi\""#), b"say \"hi\"");
        assert_eq!(unescape_string("plain"), b"plain");
    }

    #[test]
    fn test_widening_mov_for_small_locals() {
        // A bool local is one byte; comparing it against a literal uses
        // a widening or byte-sized access rather than a plain MOVQ.
        let asm = compile(
            r#"func main() () -> affects(IO) {
                let b = true
                if b {
                    PrintInt(1)
                }
            }"#,
        );
        assert!(asm.contains("MOVB") || asm.contains("CMPB"));
    }
}
