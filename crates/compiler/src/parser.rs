//! Two-pass parser and type checker for Mica
//!
//! Pass 1 registers every function prototype and every `type`/`enum`
//! declaration, skipping function bodies by bracket balance, so forward
//! references and out-of-order definitions resolve. Pass 2 re-scans the
//! token stream and builds the fully type-checked AST.
//!
//! All checks happen during construction: the first failure aborts with
//! a message and no recovery is attempted.

use std::collections::HashMap;

use crate::ast::{
    ArrayValue, AssignTarget, BinOp, Block, Decl, Expr, FuncCall, FuncDecl, LetStmt, MatchCase,
    MatchPattern, MatchStmt, MutStmt, Stmt, TypeDefn, VarWithType,
};
use crate::lexer::{self, Token};
use crate::types::{EnumOption, EnumTypeDefn, TupleField, Type, TypeInfo, TypeRegistry};

/// A function prototype: everything a call site needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncSig {
    pub name: String,
    pub args: Vec<VarWithType>,
    pub ret: Vec<VarWithType>,
    pub effects: Vec<String>,
}

/// All known callables by name. More than one entry for a name means the
/// source attempted multiple dispatch, which is rejected when the name is
/// called.
pub type Callables = HashMap<String, Vec<FuncSig>>;

/// Parser output: the declarations plus the tables later phases need.
#[derive(Debug, Clone)]
pub struct Program {
    pub decls: Vec<Decl>,
    pub type_infos: TypeRegistry,
    pub callables: Callables,
}

impl Program {
    pub fn find_func(&self, name: &str) -> Option<&FuncDecl> {
        self.decls.iter().find_map(|d| match d {
            Decl::Func(f) if f.name == name => Some(f),
            _ => None,
        })
    }
}

/// Parse failures: `Syntax` for malformed structure, `Type` for checks
/// that failed on well-formed structure.
#[derive(Debug)]
pub enum ParseError {
    Syntax(String),
    Type(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Syntax(msg) => write!(f, "{}", msg),
            ParseError::Type(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

fn syntax(msg: impl Into<String>) -> ParseError {
    ParseError::Syntax(msg.into())
}

fn type_err(msg: impl Into<String>) -> ParseError {
    ParseError::Type(msg.into())
}

/// Symbol tables threaded through both passes.
struct Context {
    /// Named types (user aliases and enums) by name.
    types: HashMap<String, Type>,
    type_infos: TypeRegistry,
    functions: Callables,
    enum_options: HashMap<String, EnumOption>,
    variables: HashMap<String, VarWithType>,
    mutables: HashMap<String, VarWithType>,
    cur_func: Option<FuncSig>,
}

impl Context {
    fn new() -> Self {
        let mut functions: Callables = HashMap::new();
        for sig in builtin_sigs() {
            functions.insert(sig.name.clone(), vec![sig]);
        }
        Context {
            types: HashMap::new(),
            type_infos: TypeRegistry::with_primitives(),
            functions,
            enum_options: HashMap::new(),
            variables: HashMap::new(),
            mutables: HashMap::new(),
            cur_func: None,
        }
    }

    fn is_type_name(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }
}

/// The pre-declared free functions the compiler recognizes but does not
/// implement: runtime stubs and linker-provided helpers.
fn builtin_sigs() -> Vec<FuncSig> {
    let string_t = Type::Literal("string".to_string());
    let int_t = Type::Literal("int".to_string());
    let int64_t = Type::Literal("int64".to_string());
    let uint64_t = Type::Literal("uint64".to_string());
    let byteslice_t = Type::Slice {
        base: Box::new(Type::Literal("byte".to_string())),
    };
    let sig = |name: &str, args: Vec<VarWithType>, ret: Vec<Type>| FuncSig {
        name: name.to_string(),
        args,
        ret: ret
            .into_iter()
            .map(|t| VarWithType::new("", t))
            .collect(),
        effects: Vec::new(),
    };
    vec![
        sig(
            "PrintInt",
            vec![VarWithType::new("n", int_t.clone())],
            vec![],
        ),
        sig(
            "PrintString",
            vec![VarWithType::new("str", string_t.clone())],
            vec![],
        ),
        sig(
            "PrintByteSlice",
            vec![VarWithType::new("s", byteslice_t.clone())],
            vec![],
        ),
        sig(
            "len",
            vec![VarWithType::new("v", byteslice_t.clone())],
            vec![uint64_t],
        ),
        sig(
            "Open",
            vec![VarWithType::new("file", string_t.clone())],
            vec![int64_t.clone()],
        ),
        sig(
            "Create",
            vec![VarWithType::new("file", string_t.clone())],
            vec![int64_t.clone()],
        ),
        sig(
            "Close",
            vec![VarWithType::new("fd", int64_t.clone())],
            vec![],
        ),
        sig(
            "Read",
            vec![
                VarWithType::new("fd", int64_t.clone()),
                VarWithType::new("buf", byteslice_t.clone()),
            ],
            vec![int64_t.clone()],
        ),
        sig(
            "Write",
            vec![
                VarWithType::new("fd", int64_t.clone()),
                VarWithType::new("str", string_t),
            ],
            vec![int64_t],
        ),
    ]
}

/// Argument checking is relaxed for these: `PrintInt` accepts every
/// integer width and `len` accepts any slice, string, or array.
const UNCHECKED_CALLS: &[&str] = &["PrintInt", "len"];

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    ctx: Context,
}

/// Parse a complete source text into a checked [`Program`].
pub fn parse(source: &str) -> Result<Program, ParseError> {
    Parser::new(source).parse()
}

impl Parser {
    pub fn new(source: &str) -> Self {
        Parser {
            tokens: lexer::strip_trivia(lexer::tokenize(source)),
            pos: 0,
            ctx: Context::new(),
        }
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        self.extract_prototypes()?;
        tracing::debug!(
            functions = self.ctx.functions.len(),
            types = self.ctx.types.len(),
            "prototype pass complete"
        );

        self.pos = 0;
        let mut decls = Vec::new();
        while !self.at_end() {
            decls.push(self.parse_top_level()?);
        }
        Ok(Program {
            decls,
            type_infos: self.ctx.type_infos.clone(),
            callables: self.ctx.functions.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, off: usize) -> Option<&Token> {
        self.tokens.get(self.pos + off)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn check_char(&self, c: &str) -> bool {
        matches!(self.peek(), Some(Token::Char(s)) if s == c)
    }

    fn check_op(&self, o: &str) -> bool {
        matches!(self.peek(), Some(Token::Operator(s)) if s == o)
    }

    fn check_keyword(&self, k: &str) -> bool {
        matches!(self.peek(), Some(Token::Keyword(s)) if s == k)
    }

    fn consume_char(&mut self, c: &str) -> bool {
        if self.check_char(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_op(&mut self, o: &str) -> bool {
        if self.check_op(o) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_keyword(&mut self, k: &str) -> bool {
        if self.check_keyword(k) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, c: &str, context: &str) -> Result<(), ParseError> {
        if self.consume_char(c) {
            Ok(())
        } else {
            Err(syntax(format!(
                "Expected '{}' in {}, got '{}'",
                c,
                context,
                self.current_text()
            )))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token::Unknown(s)) => Ok(s),
            other => Err(syntax(format!(
                "Expected identifier in {}, got '{}'",
                context,
                other.map(|t| t.text().to_string()).unwrap_or_default()
            ))),
        }
    }

    fn current_text(&self) -> String {
        self.peek()
            .map(|t| t.text().to_string())
            .unwrap_or_else(|| "end of file".to_string())
    }

    // ------------------------------------------------------------------
    // Pass 1: prototypes and type declarations
    // ------------------------------------------------------------------

    fn extract_prototypes(&mut self) -> Result<(), ParseError> {
        // First walk: types and enums, so that argument types resolve in
        // any declaration order.
        self.pos = 0;
        while !self.at_end() {
            match self.advance() {
                Some(Token::Keyword(k)) if k == "func" => {
                    self.expect_ident("function declaration")?;
                    self.skip_prototype()?;
                    self.skip_block()?;
                }
                Some(Token::Keyword(k)) if k == "type" => {
                    let name = self.expect_ident("type declaration")?;
                    if !self.consume_op("=") {
                        return Err(syntax(format!(
                            "Expected '=' after type name '{}'",
                            name
                        )));
                    }
                    let concrete = self.parse_type()?;
                    let info = concrete.info(&self.ctx.type_infos);
                    self.ctx.type_infos.register(name.clone(), info);
                    self.ctx.types.insert(
                        name.clone(),
                        Type::User {
                            name,
                            concrete: Box::new(concrete),
                        },
                    );
                }
                Some(Token::Keyword(k)) if k == "enum" => {
                    let name = self.expect_ident("enum declaration")?;
                    if !self.consume_op("=") {
                        return Err(syntax(format!(
                            "Expected '=' after enum name '{}'",
                            name
                        )));
                    }
                    let defn = self.parse_enum_options(&name)?;
                    for option in &defn.options {
                        self.ctx
                            .enum_options
                            .insert(option.constructor.clone(), option.clone());
                    }
                    self.ctx
                        .type_infos
                        .register(name.clone(), TypeInfo::new(0, false));
                    self.ctx.types.insert(name, Type::Enum(defn));
                }
                Some(other) => {
                    return Err(syntax(format!(
                        "Invalid top level token: {}",
                        other.text()
                    )));
                }
                None => break,
            }
        }

        // Second walk: function prototypes, now that every type is known.
        self.pos = 0;
        while !self.at_end() {
            match self.advance() {
                Some(Token::Keyword(k)) if k == "func" => {
                    let name = self.expect_ident("function declaration")?;
                    let (args, ret, effects) = self.parse_prototype()?;
                    self.skip_block()?;
                    let sig = FuncSig {
                        name: name.clone(),
                        args,
                        ret,
                        effects,
                    };
                    self.ctx.functions.entry(name).or_default().push(sig);
                }
                Some(Token::Keyword(k)) if k == "type" => {
                    self.expect_ident("type declaration")?;
                    self.consume_op("=");
                    self.parse_type()?;
                }
                Some(Token::Keyword(k)) if k == "enum" => {
                    let name = self.expect_ident("enum declaration")?;
                    self.consume_op("=");
                    self.parse_enum_options(&name)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn skip_prototype(&mut self) -> Result<(), ParseError> {
        self.skip_tuple()?;
        self.skip_tuple()?;
        // Effect lists run from `->` to the block start.
        if self.check_op("->") {
            while !self.at_end() && !self.check_char("{") {
                self.pos += 1;
            }
        }
        Ok(())
    }

    fn skip_tuple(&mut self) -> Result<(), ParseError> {
        if !self.consume_char("(") {
            return Err(syntax(format!(
                "Can not skip tuple. Expecting '(', not '{}'",
                self.current_text()
            )));
        }
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance() {
                Some(Token::Char(c)) if c == "(" => depth += 1,
                Some(Token::Char(c)) if c == ")" => depth -= 1,
                Some(_) => {}
                None => return Err(syntax("Missing closing ')' for tuple.")),
            }
        }
        Ok(())
    }

    fn skip_block(&mut self) -> Result<(), ParseError> {
        if !self.consume_char("{") {
            return Err(syntax("Can not skip block. Not a block start."));
        }
        let mut level = 1usize;
        while level > 0 {
            match self.advance() {
                Some(Token::Char(c)) if c == "{" => level += 1,
                Some(Token::Char(c)) if c == "}" => level -= 1,
                Some(_) => {}
                None => return Err(syntax("Missing closing bracket for block")),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass 2: full declarations
    // ------------------------------------------------------------------

    fn parse_top_level(&mut self) -> Result<Decl, ParseError> {
        match self.advance() {
            Some(Token::Keyword(k)) if k == "func" => self.parse_func_decl().map(Decl::Func),
            Some(Token::Keyword(k)) if k == "type" => {
                let name = self.expect_ident("type declaration")?;
                self.consume_op("=");
                self.parse_type()?;
                let concrete = match self.ctx.types.get(&name) {
                    Some(Type::User { concrete, .. }) => (**concrete).clone(),
                    Some(other) => other.clone(),
                    None => return Err(type_err(format!("Invalid type: {}", name))),
                };
                Ok(Decl::Type(TypeDefn { name, concrete }))
            }
            Some(Token::Keyword(k)) if k == "enum" => {
                let name = self.expect_ident("enum declaration")?;
                self.consume_op("=");
                self.parse_enum_options(&name)?;
                match self.ctx.types.get(&name) {
                    Some(Type::Enum(defn)) => Ok(Decl::Enum(defn.clone())),
                    _ => Err(type_err(format!("Invalid enum type: {}", name))),
                }
            }
            other => Err(syntax(format!(
                "Invalid top level token: {}",
                other.map(|t| t.text().to_string()).unwrap_or_default()
            ))),
        }
    }

    fn parse_func_decl(&mut self) -> Result<FuncDecl, ParseError> {
        let name = self.expect_ident("function declaration")?;
        let (args, ret, effects) = self.parse_prototype()?;

        // Fresh scope per function: arguments seed the variables map, and
        // reference parameters are writable through `=`.
        self.ctx.variables.clear();
        self.ctx.mutables.clear();
        for arg in &args {
            self.ctx.variables.insert(arg.name.clone(), arg.clone());
            if arg.reference {
                self.ctx.mutables.insert(arg.name.clone(), arg.clone());
            }
        }
        self.ctx.cur_func = Some(FuncSig {
            name: name.clone(),
            args: args.clone(),
            ret: ret.clone(),
            effects: effects.clone(),
        });

        let body = self.parse_block()?;
        Ok(FuncDecl {
            name,
            args,
            ret,
            effects,
            body,
        })
    }

    fn parse_prototype(
        &mut self,
    ) -> Result<(Vec<VarWithType>, Vec<VarWithType>, Vec<String>), ParseError> {
        let args = self.parse_arg_tuple()?;
        let ret = self.parse_type_list()?;
        let effects = self.parse_effect_list()?;
        Ok((args, ret, effects))
    }

    /// `( [mutable] name[, name…] Type, … )`
    fn parse_arg_tuple(&mut self) -> Result<Vec<VarWithType>, ParseError> {
        self.expect_char("(", "argument list")?;
        let mut args = Vec::new();
        loop {
            if self.consume_char(")") {
                return Ok(args);
            }
            let mutable = self.consume_keyword("mutable");
            let mut names: Vec<String> = Vec::new();
            let typ = loop {
                match self.peek() {
                    Some(Token::Type(_)) => break self.parse_type()?,
                    Some(Token::Char(c)) if c == "[" || c == "(" => break self.parse_type()?,
                    Some(Token::Unknown(n)) if self.ctx.is_type_name(n) => {
                        break self.parse_type()?;
                    }
                    Some(Token::Unknown(_)) => {
                        names.push(self.expect_ident("argument list")?);
                        self.consume_char(",");
                    }
                    _ => {
                        return Err(syntax(format!(
                            "Invalid token in argument list: {}",
                            self.current_text()
                        )));
                    }
                }
            };
            if names.is_empty() {
                return Err(syntax("Expected name before type in argument list"));
            }
            for name in names {
                args.push(VarWithType {
                    name,
                    typ: typ.clone(),
                    reference: mutable,
                });
            }
            self.consume_char(",");
        }
    }

    /// `( Type, Type, … )` — anonymous entries, used for return tuples.
    fn parse_type_list(&mut self) -> Result<Vec<VarWithType>, ParseError> {
        self.expect_char("(", "return list")?;
        let mut rets = Vec::new();
        loop {
            if self.consume_char(")") {
                return Ok(rets);
            }
            let typ = self.parse_type()?;
            rets.push(VarWithType::new("", typ));
            self.consume_char(",");
        }
    }

    /// `-> affects( ID, ID, … )`
    fn parse_effect_list(&mut self) -> Result<Vec<String>, ParseError> {
        if !self.consume_op("->") {
            return Ok(Vec::new());
        }
        if !self.consume_keyword("affects") {
            return Err(syntax(format!(
                "Not at start of an effect list. Expecting 'affects', not '{}'",
                self.current_text()
            )));
        }
        self.expect_char("(", "effect list")?;
        let mut effects = Vec::new();
        loop {
            if self.consume_char(")") {
                return Ok(effects);
            }
            if self.consume_char(",") {
                continue;
            }
            match self.advance() {
                Some(t) => effects.push(t.text().to_string()),
                None => return Err(syntax("Effect lists must end with a block start.")),
            }
        }
    }

    fn parse_enum_options(&mut self, enum_name: &str) -> Result<EnumTypeDefn, ParseError> {
        let mut options = Vec::new();
        let mut current: Option<EnumOption> = None;
        loop {
            match self.peek() {
                Some(Token::Unknown(s)) | Some(Token::Type(s)) => {
                    let s = s.clone();
                    self.pos += 1;
                    match current.as_mut() {
                        None => {
                            current = Some(EnumOption {
                                constructor: s,
                                parameters: Vec::new(),
                                parent: enum_name.to_string(),
                            });
                        }
                        Some(option) => option.parameters.push(s),
                    }
                }
                Some(Token::Operator(o)) if o == "|" => {
                    self.pos += 1;
                    match current.take() {
                        Some(option) => options.push(option),
                        None => return Err(syntax("Expected constructor before '|'")),
                    }
                }
                Some(Token::Keyword(_)) | None => break,
                Some(other) => {
                    return Err(syntax(format!(
                        "Invalid token in enum declaration: {}",
                        other.text()
                    )));
                }
            }
        }
        match current.take() {
            Some(option) => options.push(option),
            None => {
                return Err(syntax(format!(
                    "Enum '{}' must have at least one constructor",
                    enum_name
                )));
            }
        }
        Ok(EnumTypeDefn {
            name: enum_name.to_string(),
            options,
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let mut typ = self.parse_single_type()?;
        // `T | U | …` builds a sum type, flattened left to right.
        if self.check_op("|") {
            let mut members = vec![typ];
            while self.consume_op("|") {
                members.push(self.parse_single_type()?);
            }
            typ = Type::Sum(members);
        }
        Ok(typ)
    }

    fn parse_single_type(&mut self) -> Result<Type, ParseError> {
        match self.peek().cloned() {
            Some(Token::Char(c)) if c == "[" => {
                self.pos += 1;
                if self.consume_char("]") {
                    let base = self.parse_single_type()?;
                    return Ok(Type::Slice {
                        base: Box::new(base),
                    });
                }
                let size_tok = self.expect_ident("array size")?;
                let size: usize = size_tok
                    .parse()
                    .map_err(|_| syntax("Array size must be an int literal"))?;
                self.expect_char("]", "array type")?;
                let base = self.parse_single_type()?;
                Ok(Type::Array {
                    base: Box::new(base),
                    size,
                })
            }
            Some(Token::Char(c)) if c == "(" => {
                self.pos += 1;
                let mut fields = Vec::new();
                loop {
                    if self.consume_char(")") {
                        return Ok(Type::Tuple(fields));
                    }
                    let name = self.expect_ident("tuple type")?;
                    let typ = self.parse_single_type()?;
                    fields.push(TupleField { name, typ });
                    self.consume_char(",");
                }
            }
            Some(Token::Type(name)) => {
                self.pos += 1;
                Ok(Type::Literal(name))
            }
            Some(Token::Unknown(name)) => {
                self.pos += 1;
                match self.ctx.types.get(&name) {
                    Some(t) => Ok(t.clone()),
                    None => Err(type_err(format!("Invalid type: {}", name))),
                }
            }
            _ => Err(syntax(format!(
                "Expected type, got '{}'",
                self.current_text()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        self.expect_char("{", "block")?;
        let saved_vars = self.ctx.variables.clone();
        let saved_muts = self.ctx.mutables.clone();
        let mut stmts = Vec::new();
        loop {
            if self.consume_char("}") {
                self.ctx.variables = saved_vars;
                self.ctx.mutables = saved_muts;
                return Ok(Block { stmts });
            }
            if self.at_end() {
                return Err(syntax("Unterminated block statement"));
            }
            if self.check_char("{") {
                stmts.push(Stmt::Block(self.parse_block()?));
                continue;
            }
            stmts.push(self.parse_stmt()?);
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek().cloned() {
            Some(Token::Unknown(name)) => match self.peek_at(1) {
                Some(Token::Char(c)) if c == "(" => {
                    self.pos += 1;
                    let call = self.parse_func_call(&name, None)?;
                    Ok(Stmt::Call(call))
                }
                Some(Token::Char(c)) if c == "." => {
                    // Method-call sugar: `recv.F(a)` is `F(recv, a)`.
                    let recv = self
                        .ctx
                        .variables
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| type_err(format!("Undefined variable: {}", name)))?;
                    self.pos += 2;
                    let fname = self.expect_ident("method call")?;
                    let call = self.parse_func_call(&fname, Some(Expr::Var(recv)))?;
                    Ok(Stmt::Call(call))
                }
                Some(Token::Char(c)) if c == "[" => {
                    let target = self.parse_value()?;
                    let av = match target {
                        Expr::Index(av) => av,
                        _ => return Err(type_err("Can not index non-array value")),
                    };
                    if !self.consume_op("=") {
                        return Err(syntax("Invalid variable assignment."));
                    }
                    let value = self.parse_value()?;
                    let elem = match av.base.typ.concrete() {
                        Type::Array { base, .. } | Type::Slice { base } => (**base).clone(),
                        _ => return Err(type_err("Can not index non-array value")),
                    };
                    self.check_assignable(&elem, &value, &av.base.name)?;
                    self.check_index_writable(&av.base)?;
                    Ok(Stmt::Assign {
                        target: AssignTarget::Index(av),
                        value,
                    })
                }
                Some(Token::Operator(o)) if o == "=" => {
                    self.pos += 2;
                    let var = self
                        .ctx
                        .variables
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| {
                            type_err(format!("Invalid variable for assignment: {}", name))
                        })?;
                    if !self.ctx.mutables.contains_key(&name) {
                        return Err(type_err(format!(
                            "Can not assign to immutable let variable \"{}\".",
                            name
                        )));
                    }
                    let value = self.parse_value()?;
                    self.check_assignable(&var.typ, &value, &name)?;
                    Ok(Stmt::Assign {
                        target: AssignTarget::Var(var),
                        value,
                    })
                }
                _ => Err(syntax(format!(
                    "Don't know how to handle token after '{}': '{}'",
                    name,
                    self.peek_at(1)
                        .map(|t| t.text().to_string())
                        .unwrap_or_default()
                ))),
            },
            Some(Token::Keyword(k)) => match k.as_str() {
                "let" => {
                    self.pos += 1;
                    self.parse_let().map(Stmt::Let)
                }
                "mutable" => {
                    self.pos += 1;
                    self.parse_mut().map(Stmt::Mut)
                }
                "return" => {
                    self.pos += 1;
                    self.parse_return()
                }
                "while" => {
                    self.pos += 1;
                    self.parse_while()
                }
                "if" => {
                    self.pos += 1;
                    self.parse_if()
                }
                "match" => {
                    self.pos += 1;
                    self.parse_match()
                }
                "assert" => {
                    self.pos += 1;
                    self.parse_assert()
                }
                other => Err(syntax(format!("Unimplemented keyword: {}", other))),
            },
            other => Err(syntax(format!(
                "Unhandled token in block: '{}'",
                other.map(|t| t.text().to_string()).unwrap_or_default()
            ))),
        }
    }

    /// Body of a `let`, after the keyword has been consumed.
    fn parse_let(&mut self) -> Result<LetStmt, ParseError> {
        let name = self.expect_ident("let statement")?;
        if self.ctx.mutables.contains_key(&name) {
            return Err(type_err(format!(
                "Can not shadow mutable variable \"{}\".",
                name
            )));
        }
        let declared = self.parse_optional_binding_type()?;
        if !self.consume_op("=") {
            return Err(syntax("Invalid let statement"));
        }
        let val = self.parse_value()?;
        let var = self.finish_binding(name, declared, &val)?;
        self.ctx.variables.insert(var.name.clone(), var.clone());
        Ok(LetStmt { var, val })
    }

    fn parse_mut(&mut self) -> Result<MutStmt, ParseError> {
        let name = self.expect_ident("mutable declaration")?;
        if self.ctx.mutables.contains_key(&name) {
            return Err(type_err(format!(
                "Can not shadow mutable variable \"{}\".",
                name
            )));
        }
        let declared = self.parse_optional_binding_type()?;
        if !self.consume_op("=") {
            return Err(syntax("Invalid mutable declaration"));
        }
        let initial = self.parse_value()?;
        let var = self.finish_binding(name, declared, &initial)?;
        self.ctx.variables.insert(var.name.clone(), var.clone());
        self.ctx.mutables.insert(var.name.clone(), var.clone());
        Ok(MutStmt { var, initial })
    }

    fn parse_optional_binding_type(&mut self) -> Result<Option<Type>, ParseError> {
        match self.peek() {
            Some(Token::Type(_)) => Ok(Some(self.parse_type()?)),
            Some(Token::Unknown(n)) if self.ctx.is_type_name(n) => Ok(Some(self.parse_type()?)),
            Some(Token::Char(c)) if c == "[" || c == "(" => Ok(Some(self.parse_type()?)),
            _ => Ok(None),
        }
    }

    /// Resolve the binding's type (declared or inferred) and check the
    /// initializer against it.
    fn finish_binding(
        &mut self,
        name: String,
        declared: Option<Type>,
        val: &Expr,
    ) -> Result<VarWithType, ParseError> {
        let typ = match declared {
            Some(t) => t,
            None => {
                let inferred = val.typ().ok_or_else(|| {
                    type_err(format!(
                        "Can not infer a type for variable \"{}\"",
                        name
                    ))
                })?;
                // Resolve a bare enum-parent name to its definition.
                match inferred {
                    Type::Literal(n) => match self.ctx.types.get(&n) {
                        Some(t) => t.clone(),
                        None => Type::Literal(n),
                    },
                    t => t,
                }
            }
        };
        self.check_assignable(&typ, val, &name)?;
        Ok(VarWithType::new(name, typ))
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let sig = self.ctx.cur_func.clone().expect("return outside function");
        if sig.ret.is_empty() {
            return Ok(Stmt::Return { val: None });
        }
        let val = self.parse_value()?;
        self.check_return_value(&sig, &val)?;
        Ok(Stmt::Return { val: Some(val) })
    }

    fn check_return_value(&self, sig: &FuncSig, val: &Expr) -> Result<(), ParseError> {
        if sig.ret.len() == 1 {
            let want = &sig.ret[0].typ;
            if let Type::Sum(members) = want.concrete() {
                let got = val
                    .typ()
                    .ok_or_else(|| type_err("Return value has no type"))?;
                if members.iter().any(|m| m.type_name() == got.type_name()) {
                    return Ok(());
                }
                return Err(type_err(format!(
                    "Invalid value for sum type {}",
                    want.type_name()
                )));
            }
            return self.check_assignable_msg(want, val, || {
                format!(
                    "Can not return {} from function returning {}.",
                    val.typ().map(|t| t.type_name()).unwrap_or_default(),
                    want.type_name()
                )
            });
        }
        // Multi-value returns: a tuple literal or a call with a matching
        // return tuple.
        match val {
            Expr::Tuple(elems) => {
                if elems.len() != sig.ret.len() {
                    return Err(type_err(format!(
                        "Unexpected number of return values: got {} want {}.",
                        elems.len(),
                        sig.ret.len()
                    )));
                }
                for (elem, want) in elems.iter().zip(&sig.ret) {
                    self.check_assignable(&want.typ, elem, "return value")?;
                }
                Ok(())
            }
            Expr::Call(fc) => {
                if fc.returns.len() != sig.ret.len() {
                    return Err(type_err(format!(
                        "Unexpected number of return values: got {} want {}.",
                        fc.returns.len(),
                        sig.ret.len()
                    )));
                }
                Ok(())
            }
            _ => Err(type_err(
                "Functions with multiple return values must return a tuple",
            )),
        }
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let condition = self.parse_value()?;
        self.check_bool_condition(&condition, "while")?;
        let body = self.parse_block()?;
        Ok(Stmt::While { condition, body })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let condition = self.parse_value()?;
        self.check_bool_condition(&condition, "if")?;
        let body = self.parse_block()?;
        let else_body = if self.consume_keyword("else") {
            if self.check_keyword("if") {
                self.pos += 1;
                Block {
                    stmts: vec![self.parse_if()?],
                }
            } else {
                self.parse_block()?
            }
        } else {
            Block::default()
        };
        Ok(Stmt::If {
            condition,
            body,
            else_body,
        })
    }

    fn check_bool_condition(&self, cond: &Expr, what: &str) -> Result<(), ParseError> {
        match cond.typ() {
            Some(t) if t.type_name() == "bool" => Ok(()),
            Some(t) => Err(type_err(format!(
                "{} condition must be a boolean, got {}",
                what,
                t.type_name()
            ))),
            None => Err(type_err(format!("{} condition must be a boolean", what))),
        }
    }

    fn parse_match(&mut self) -> Result<Stmt, ParseError> {
        let condition = self.parse_value()?;
        let cond_type = condition
            .typ()
            .ok_or_else(|| type_err("Match condition has no type"))?;
        let cond_type = self.resolve_named(cond_type);
        self.expect_char("{", "match statement")?;

        let mut cases = Vec::new();
        loop {
            if self.consume_char("}") {
                break;
            }
            if !self.consume_keyword("case") {
                return Err(syntax(format!(
                    "Expected 'case' in match statement, got '{}'",
                    self.current_text()
                )));
            }
            let case = self.parse_match_case(&condition, &cond_type)?;
            cases.push(case);
        }
        if cases.is_empty() {
            return Err(syntax("Match statement must have at least one case"));
        }
        Ok(Stmt::Match(MatchStmt { condition, cases }))
    }

    fn parse_match_case(
        &mut self,
        condition: &Expr,
        cond_type: &Type,
    ) -> Result<MatchCase, ParseError> {
        let saved_vars = self.ctx.variables.clone();

        let (pattern, bindings) = match cond_type.concrete() {
            Type::Enum(defn) => {
                let ctor = self.expect_ident("match case")?;
                let option = defn
                    .options
                    .iter()
                    .find(|o| o.constructor == ctor)
                    .cloned()
                    .ok_or_else(|| {
                        type_err(format!(
                            "'{}' is not a constructor of enum {}",
                            ctor, defn.name
                        ))
                    })?;
                let mut bindings = Vec::new();
                while let Some(Token::Unknown(b)) = self.peek().cloned() {
                    self.pos += 1;
                    bindings.push(b);
                }
                if bindings.len() != option.parameters.len() {
                    return Err(type_err(format!(
                        "Constructor {} has {} parameters, pattern binds {}",
                        option.constructor,
                        option.parameters.len(),
                        bindings.len()
                    )));
                }
                let bound: Vec<VarWithType> = bindings
                    .into_iter()
                    .zip(&option.parameters)
                    .map(|(name, tname)| {
                        let typ = self.lookup_type_name(tname);
                        VarWithType::new(name, typ)
                    })
                    .collect();
                for b in &bound {
                    self.ctx.variables.insert(b.name.clone(), b.clone());
                }
                (MatchPattern::Enum(option), bound)
            }
            Type::Sum(members) => {
                let narrowed = self.parse_type()?;
                if !members
                    .iter()
                    .any(|m| m.type_name() == narrowed.type_name())
                {
                    return Err(type_err("No match for type in sum type destructuring"));
                }
                // The case body sees the discriminant rebound at the
                // narrowed type.
                if let Expr::Var(v) = condition {
                    let rebound = VarWithType {
                        name: v.name.clone(),
                        typ: narrowed.clone(),
                        reference: v.reference,
                    };
                    self.ctx.variables.insert(v.name.clone(), rebound);
                }
                (MatchPattern::Type(narrowed), Vec::new())
            }
            _ => {
                let val = self.parse_value()?;
                if !val.is_literal() {
                    if let (Some(vt), ct) = (val.typ(), cond_type) {
                        if vt.type_name() != ct.type_name() {
                            return Err(type_err(format!(
                                "Match case type {} does not match condition type {}",
                                vt.type_name(),
                                ct.type_name()
                            )));
                        }
                    }
                } else {
                    self.check_assignable(cond_type, &val, "match case")?;
                }
                (MatchPattern::Value(val), Vec::new())
            }
        };

        self.expect_char(":", "match case")?;
        let mut stmts = Vec::new();
        while !self.check_keyword("case") && !self.check_char("}") {
            if self.at_end() {
                return Err(syntax("Unterminated match statement"));
            }
            stmts.push(self.parse_stmt()?);
        }
        self.ctx.variables = saved_vars;
        Ok(MatchCase {
            pattern,
            bindings,
            body: Block { stmts },
        })
    }

    fn parse_assert(&mut self) -> Result<Stmt, ParseError> {
        let predicate = self.parse_value()?;
        self.check_bool_condition(&predicate, "assert")?;
        let message = if self.check_char("\"") {
            self.parse_string_literal()?
        } else {
            r"assertion failed\n".to_string()
        };
        Ok(Stmt::Assert { predicate, message })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_value(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Operator(o)) => match binop_for(o) {
                    Some(op) => op,
                    None => break,
                },
                _ => break,
            };
            let prec = precedence(op);
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let right = self.parse_binary(prec + 1)?;
            self.check_binary(op, &left, &right)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.check_op("-") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return match inner {
                Expr::IntLiteral(n) => Ok(Expr::IntLiteral(-n)),
                _ => Err(syntax("Can only negate integer literals")),
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            Some(Token::Unknown(s)) => {
                if let Ok(n) = s.parse::<i64>() {
                    self.pos += 1;
                    return Ok(Expr::IntLiteral(n));
                }
                if s == "true" || s == "false" {
                    self.pos += 1;
                    return Ok(Expr::BoolLiteral(s == "true"));
                }
                if let Some(option) = self.ctx.enum_options.get(&s).cloned() {
                    self.pos += 1;
                    return self.parse_enum_value(option);
                }
                match self.peek_at(1) {
                    Some(Token::Char(c)) if c == "(" => {
                        if !self.ctx.functions.contains_key(&s) {
                            return Err(type_err(format!("Undefined function: {}", s)));
                        }
                        self.pos += 1;
                        let call = self.parse_func_call(&s, None)?;
                        Ok(Expr::Call(call))
                    }
                    Some(Token::Char(c)) if c == "[" => {
                        let base = self
                            .ctx
                            .variables
                            .get(&s)
                            .cloned()
                            .ok_or_else(|| type_err(format!("Undefined variable: {}", s)))?;
                        if !matches!(
                            base.typ.concrete(),
                            Type::Array { .. } | Type::Slice { .. }
                        ) {
                            return Err(type_err("Can only index into arrays or slices"));
                        }
                        self.pos += 2;
                        let index = self.parse_value()?;
                        self.expect_char("]", "index expression")?;
                        Ok(Expr::Index(ArrayValue {
                            base,
                            index: Box::new(index),
                        }))
                    }
                    _ => {
                        self.pos += 1;
                        let var = self
                            .ctx
                            .variables
                            .get(&s)
                            .cloned()
                            .ok_or_else(|| type_err(format!("Undefined variable: {}", s)))?;
                        Ok(Expr::Var(var))
                    }
                }
            }
            Some(Token::Char(c)) if c == "\"" => {
                Ok(Expr::StringLiteral(self.parse_string_literal()?))
            }
            Some(Token::Char(c)) if c == "(" => {
                self.pos += 1;
                if self.check_keyword("let") {
                    self.pos += 1;
                    let l = self.parse_let()?;
                    self.expect_char(")", "let expression")?;
                    return Ok(Expr::Brackets(Box::new(Expr::Let(Box::new(l)))));
                }
                let first = self.parse_value()?;
                if self.consume_char(",") {
                    let mut elems = vec![first];
                    loop {
                        if self.consume_char(")") {
                            return Ok(Expr::Tuple(elems));
                        }
                        elems.push(self.parse_value()?);
                        self.consume_char(",");
                    }
                }
                self.expect_char(")", "parenthesized expression")?;
                Ok(Expr::Brackets(Box::new(first)))
            }
            Some(Token::Char(c)) if c == "{" => {
                self.pos += 1;
                let mut elems = Vec::new();
                loop {
                    if self.consume_char("}") {
                        return Ok(Expr::ArrayLiteral(elems));
                    }
                    elems.push(self.parse_value()?);
                    self.consume_char(",");
                }
            }
            Some(Token::Keyword(k)) if k == "cast" => {
                self.pos += 1;
                self.expect_char("(", "cast expression")?;
                let val = self.parse_value()?;
                self.expect_char(")", "cast expression")?;
                if !self.consume_keyword("as") {
                    return Err(syntax(format!(
                        "Expected 'as' in cast expression, got '{}'",
                        self.current_text()
                    )));
                }
                let typ = self.parse_type()?;
                self.build_cast(val, typ)
            }
            Some(Token::Keyword(k)) if k == "let" => {
                self.pos += 1;
                let l = self.parse_let()?;
                Ok(Expr::Let(Box::new(l)))
            }
            other => Err(syntax(format!(
                "Unexpected token in expression: '{}'",
                other.map(|t| t.text().to_string()).unwrap_or_default()
            ))),
        }
    }

    fn parse_string_literal(&mut self) -> Result<String, ParseError> {
        self.expect_char("\"", "string literal")?;
        let s = match self.advance() {
            Some(Token::Str(s)) => s,
            other => {
                return Err(syntax(format!(
                    "Malformed string literal: '{}'",
                    other.map(|t| t.text().to_string()).unwrap_or_default()
                )));
            }
        };
        self.expect_char("\"", "string literal")?;
        Ok(s)
    }

    fn parse_enum_value(&mut self, option: EnumOption) -> Result<Expr, ParseError> {
        let mut params = Vec::new();
        for tname in option.parameters.clone() {
            let val = self.parse_primary()?;
            let want = self.lookup_type_name(&tname);
            self.check_assignable(&want, &val, &option.constructor)?;
            params.push(val);
        }
        Ok(Expr::EnumValue { option, params })
    }

    /// `cast ( v ) as T`. Casting an array to a slice produces the
    /// (length, base) view; everything else stays a Cast node.
    fn build_cast(&mut self, val: Expr, typ: Type) -> Result<Expr, ParseError> {
        if let Type::Slice { .. } = typ.concrete() {
            if let Some(Type::Array { size, .. }) = val.typ().map(|t| t.concrete().clone()) {
                return Ok(Expr::Slice {
                    base: Box::new(val),
                    size,
                });
            }
        }
        if val.is_literal() {
            self.check_assignable(&typ, &val, "cast")?;
        }
        Ok(Expr::Cast {
            val: Box::new(val),
            typ,
        })
    }

    fn parse_func_call(
        &mut self,
        name: &str,
        receiver: Option<Expr>,
    ) -> Result<FuncCall, ParseError> {
        let sigs = self
            .ctx
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| type_err(format!("Undefined function: {}", name)))?;
        if sigs.len() > 1 {
            return Err(type_err("Multiple dispatch not yet implemented"));
        }
        let sig = sigs[0].clone();

        self.expect_char("(", "function call")?;
        let mut args: Vec<Expr> = Vec::new();
        if let Some(r) = receiver {
            args.push(r);
        }
        loop {
            if self.consume_char(")") {
                break;
            }
            args.push(self.parse_value()?);
            if self.consume_char(",") {
                continue;
            }
            self.expect_char(")", "function call")?;
            break;
        }

        if args.len() != sig.args.len() {
            return Err(type_err(format!(
                "Unexpected number of parameters to {}: got {} want {}.",
                name,
                args.len(),
                sig.args.len()
            )));
        }
        if !UNCHECKED_CALLS.contains(&name) {
            for (arg, want) in args.iter().zip(&sig.args) {
                self.check_call_arg(name, want, arg)?;
            }
        }
        Ok(FuncCall {
            name: name.to_string(),
            args,
            returns: sig.ret,
        })
    }

    fn check_call_arg(
        &self,
        fname: &str,
        want: &VarWithType,
        arg: &Expr,
    ) -> Result<(), ParseError> {
        let fail = || {
            type_err(format!(
                "Incompatible call to {}: argument {} must be of type {} (got {})",
                fname,
                want.name,
                want.typ.type_name(),
                arg.typ().map(|t| t.type_name()).unwrap_or_default()
            ))
        };
        if let Type::Sum(members) = want.typ.concrete() {
            if arg.is_literal() {
                if members.iter().any(|m| self.compatible(m, arg).is_ok()) {
                    return Ok(());
                }
                return Err(fail());
            }
            let got = match arg.typ() {
                Some(t) => t,
                None => return Err(fail()),
            };
            if members.iter().any(|m| m.type_name() == got.type_name()) {
                return Ok(());
            }
            return Err(fail());
        }
        if arg.is_literal() {
            return self.compatible(&want.typ, arg).map_err(|_| fail());
        }
        let got = match arg.typ() {
            Some(t) => t,
            None => return Err(fail()),
        };
        if got.type_name() == want.typ.type_name() {
            Ok(())
        } else {
            Err(fail())
        }
    }

    // ------------------------------------------------------------------
    // Type checks
    // ------------------------------------------------------------------

    fn resolve_named(&self, t: Type) -> Type {
        match t {
            Type::Literal(name) => match self.ctx.types.get(&name) {
                Some(resolved) => resolved.clone(),
                None => Type::Literal(name),
            },
            other => other,
        }
    }

    fn lookup_type_name(&self, name: &str) -> Type {
        match self.ctx.types.get(name) {
            Some(t) => t.clone(),
            None => Type::Literal(name.to_string()),
        }
    }

    fn check_binary(&self, op: BinOp, left: &Expr, right: &Expr) -> Result<(), ParseError> {
        let fail = |lt: &str, rt: &str| {
            type_err(format!(
                "Type mismatch in {:?} expression: {} vs {}",
                op, lt, rt
            ))
        };
        if left.is_literal() || right.is_literal() {
            return Ok(());
        }
        let lt = left
            .typ()
            .ok_or_else(|| type_err("Operand has no type"))?;
        let rt = right
            .typ()
            .ok_or_else(|| type_err("Operand has no type"))?;
        // Integer widths freely mix in arithmetic and comparisons.
        if lt.is_integer(&self.ctx.type_infos) && rt.is_integer(&self.ctx.type_infos) {
            return Ok(());
        }
        if lt.type_name() == rt.type_name() {
            if !op.is_comparison() && !lt.is_integer(&self.ctx.type_infos) {
                return Err(type_err(format!(
                    "Arithmetic requires integer operands, got {}",
                    lt.type_name()
                )));
            }
            return Ok(());
        }
        Err(fail(&lt.type_name(), &rt.type_name()))
    }

    fn check_assignable(
        &self,
        target: &Type,
        val: &Expr,
        name: &str,
    ) -> Result<(), ParseError> {
        self.check_assignable_msg(target, val, || {
            format!(
                "Incompatible assignment for variable \"{}\": can not assign {} to {}.",
                name,
                val.typ().map(|t| t.type_name()).unwrap_or_default(),
                target.type_name()
            )
        })
    }

    fn check_assignable_msg(
        &self,
        target: &Type,
        val: &Expr,
        msg: impl Fn() -> String,
    ) -> Result<(), ParseError> {
        if val.is_literal() {
            return self
                .compatible(target, val)
                .map_err(|e| type_err(format!("{} {}", msg(), e)));
        }
        let got = val.typ().ok_or_else(|| type_err(msg()))?;
        if got.type_name() == target.type_name() {
            return Ok(());
        }
        // Both integers: literal-free arithmetic results flow into any
        // integer binding of the same family.
        if got.is_integer(&self.ctx.type_infos) && target.is_integer(&self.ctx.type_infos) {
            return Ok(());
        }
        Err(type_err(msg()))
    }

    /// Literal-compatibility: an int literal flows into any integer type
    /// it fits in, a string literal into `string`, an enum constructor
    /// into its parent enum.
    fn compatible(&self, target: &Type, val: &Expr) -> Result<(), String> {
        let concrete = target.concrete();
        match val {
            Expr::Brackets(inner) => self.compatible(target, inner),
            Expr::IntLiteral(n) => match concrete {
                Type::Literal(name) if self.ctx.type_infos.is_integer(name) => {
                    if self.ctx.type_infos.fits(name, *n) {
                        Ok(())
                    } else {
                        Err(format!("{} overflows {}", n, name))
                    }
                }
                _ => Err(format!(
                    "can not use integer literal as {}",
                    target.type_name()
                )),
            },
            Expr::BoolLiteral(_) => {
                if concrete.type_name() == "bool" {
                    Ok(())
                } else {
                    Err(format!(
                        "can not use boolean literal as {}",
                        target.type_name()
                    ))
                }
            }
            Expr::StringLiteral(_) => {
                if concrete.type_name() == "string" {
                    Ok(())
                } else {
                    Err(format!(
                        "can not use string literal as {}",
                        target.type_name()
                    ))
                }
            }
            Expr::EnumValue { option, .. } => {
                if target.type_name() == option.parent {
                    Ok(())
                } else {
                    Err(format!(
                        "constructor {} belongs to {}, not {}",
                        option.constructor,
                        option.parent,
                        target.type_name()
                    ))
                }
            }
            Expr::ArrayLiteral(elems) => match concrete {
                Type::Array { base, size } => {
                    if elems.len() != *size {
                        return Err(format!(
                            "array literal has {} elements, type wants {}",
                            elems.len(),
                            size
                        ));
                    }
                    for e in elems {
                        self.element_compatible(base, e)?;
                    }
                    Ok(())
                }
                Type::Slice { base } => {
                    for e in elems {
                        self.element_compatible(base, e)?;
                    }
                    Ok(())
                }
                _ => Err(format!(
                    "can not use array literal as {}",
                    target.type_name()
                )),
            },
            other => {
                let got = other
                    .typ()
                    .ok_or_else(|| "value has no type".to_string())?;
                if got.type_name() == target.type_name() {
                    Ok(())
                } else {
                    Err(format!(
                        "can not assign {} to {}",
                        got.type_name(),
                        target.type_name()
                    ))
                }
            }
        }
    }

    fn element_compatible(&self, base: &Type, elem: &Expr) -> Result<(), String> {
        if elem.is_literal() {
            self.compatible(base, elem)
        } else {
            let got = elem
                .typ()
                .ok_or_else(|| "element has no type".to_string())?;
            if got.type_name() == base.type_name() {
                Ok(())
            } else {
                Err(format!(
                    "can not use {} element in {} collection",
                    got.type_name(),
                    base.type_name()
                ))
            }
        }
    }

    fn check_index_writable(&self, base: &VarWithType) -> Result<(), ParseError> {
        if self.ctx.mutables.contains_key(&base.name) || base.reference {
            Ok(())
        } else {
            Err(type_err(format!(
                "Can not assign to immutable let variable \"{}\".",
                base.name
            )))
        }
    }
}

fn binop_for(op: &str) -> Option<BinOp> {
    match op {
        "+" => Some(BinOp::Add),
        "-" => Some(BinOp::Sub),
        "*" => Some(BinOp::Mul),
        "/" => Some(BinOp::Div),
        "%" => Some(BinOp::Mod),
        "==" => Some(BinOp::Eq),
        "!=" => Some(BinOp::Neq),
        "<" => Some(BinOp::Lt),
        "<=" => Some(BinOp::Lte),
        ">" => Some(BinOp::Gt),
        ">=" => Some(BinOp::Geq),
        _ => None,
    }
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Geq => 1,
        BinOp::Add | BinOp::Sub => 2,
        BinOp::Mul | BinOp::Div | BinOp::Mod => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_function() {
        let program = parse(
            r#"func main() () -> affects(IO) {
                let n int = 5
                PrintInt(n)
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        assert_eq!(main.name, "main");
        assert!(main.args.is_empty());
        assert!(main.ret.is_empty());
        assert_eq!(main.effects, vec!["IO".to_string()]);
        assert_eq!(main.body.stmts.len(), 2);
    }

    #[test]
    fn test_out_of_order_definitions() {
        let program = parse(
            r#"func main() () -> affects(IO) {
                PrintInt(foo())
            }

            func foo() (int) {
                return 3
            }"#,
        )
        .unwrap();
        assert!(program.find_func("foo").is_some());
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[0] {
            Stmt::Call(fc) => match &fc.args[0] {
                Expr::Call(inner) => assert_eq!(inner.name, "foo"),
                other => panic!("expected nested call, got {:?}", other),
            },
            other => panic!("expected call statement, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_rejected() {
        let err = parse(
            r#"func main() () {
                PrintInt(x)
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("Undefined variable: x")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_variable_defined_later_rejected() {
        assert!(
            parse(
                r#"func main() () {
                    PrintInt(x)
                    let x int = 3
                }"#,
            )
            .is_err()
        );
    }

    #[test]
    fn test_block_scope() {
        let err = parse(
            r#"func main() () {
                if true {
                    let x int = 3
                }
                PrintInt(x)
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Type(_)));
    }

    #[test]
    fn test_shadow_mutable_rejected() {
        let err = parse(
            r#"func main() () {
                mutable x = 3
                let x = 4
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("shadow mutable")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_let_shadowing_allowed() {
        let program = parse(
            r#"func main() () -> affects(IO) {
                let n int = 5
                PrintInt(n)
                let n string = "hello"
                PrintString(n)
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        assert_eq!(main.body.stmts.len(), 4);
    }

    #[test]
    fn test_assign_to_immutable_rejected() {
        let err = parse(
            r#"func main() () {
                let x = 3
                x = 4
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("immutable")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_assign_to_mutable() {
        assert!(
            parse(
                r#"func main() () {
                    mutable x = 3
                    x = 4
                }"#,
            )
            .is_ok()
        );
    }

    #[test]
    fn test_reference_parameter_assignable() {
        let program = parse(
            r#"func changer(mutable x int, y int) (int) {
                x = 4
                return x + y
            }"#,
        )
        .unwrap();
        let f = program.find_func("changer").unwrap();
        assert!(f.args[0].reference);
        assert!(!f.args[1].reference);
    }

    #[test]
    fn test_incompatible_assignment_rejected() {
        let err = parse(
            r#"func main() () {
                let x int = "hello"
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Type(_)));
    }

    #[test]
    fn test_literal_overflow_rejected() {
        let err = parse(
            r#"func main() () {
                let x uint8 = 300
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("overflows")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_argument_count() {
        let err = parse(
            r#"func main() () {
                PrintString("a", "b")
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("number of parameters")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_undefined_function_rejected() {
        let err = parse(
            r#"func main() () {
                frobnicate(1)
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("Undefined function")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_if_condition_must_be_bool() {
        let err = parse(
            r#"func main() () {
                if 3 {
                    PrintInt(1)
                }
            }"#,
        )
        .unwrap_err();
        match err {
            ParseError::Type(msg) => assert!(msg.contains("boolean")),
            other => panic!("expected type error, got {:?}", other),
        }
    }

    #[test]
    fn test_slice_binding_and_index() {
        let program = parse(
            r#"func main() () -> affects(IO) {
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
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[0] {
            Stmt::Let(l) => assert_eq!(l.var.typ.type_name(), "[]string"),
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn test_let_in_loop_condition() {
        let program = parse(
            r#"func main() () -> affects(IO) {
                let i = 0
                while (let i = i + 1) < 3 {
                    PrintInt(i)
                }
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[1] {
            Stmt::While { condition, .. } => match condition {
                Expr::Binary { op, left, .. } => {
                    assert_eq!(*op, BinOp::Lt);
                    assert!(matches!(**left, Expr::Brackets(_)));
                }
                other => panic!("expected comparison, got {:?}", other),
            },
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_declaration_and_match() {
        let program = parse(
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
        )
        .unwrap();
        match &program.decls[0] {
            Decl::Enum(defn) => {
                assert_eq!(defn.name, "Maybe");
                assert_eq!(defn.options.len(), 2);
                assert_eq!(defn.options[1].constructor, "Some");
                assert_eq!(defn.options[1].parameters, vec!["int".to_string()]);
            }
            other => panic!("expected enum declaration, got {:?}", other),
        }
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[1] {
            Stmt::Match(m) => {
                assert_eq!(m.cases.len(), 2);
                match &m.cases[1].pattern {
                    MatchPattern::Enum(option) => assert_eq!(option.constructor, "Some"),
                    other => panic!("expected enum pattern, got {:?}", other),
                }
                assert_eq!(m.cases[1].bindings[0].name, "n");
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_match_wrong_constructor_rejected() {
        let err = parse(
            r#"enum Maybe = None | Some int

            func main() () {
                let x Maybe = None
                match x {
                case Nothing:
                    PrintInt(0)
                }
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Type(_)));
    }

    #[test]
    fn test_sum_type_declaration() {
        let program = parse(
            r#"func pick(v int | string) () {
            }

            func main() () {
                pick(3)
            }"#,
        )
        .unwrap();
        let pick = program.find_func("pick").unwrap();
        assert_eq!(pick.args[0].typ.type_name(), "int | string");
    }

    #[test]
    fn test_return_type_checked() {
        let err = parse(
            r#"func foo() (int) {
                return "hello"
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Type(_)));
    }

    #[test]
    fn test_user_type_alias() {
        let program = parse(
            r#"type Fd = int64

            func main() () {
                let f Fd = 3
            }"#,
        )
        .unwrap();
        match &program.decls[0] {
            Decl::Type(td) => {
                assert_eq!(td.name, "Fd");
                assert_eq!(td.concrete.type_name(), "int64");
            }
            other => panic!("expected type declaration, got {:?}", other),
        }
    }

    #[test]
    fn test_method_call_sugar() {
        let program = parse(
            r#"func double(n int) (int) {
                return n + n
            }

            func main() () -> affects(IO) {
                let x = 4
                x.double()
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[1] {
            Stmt::Call(fc) => {
                assert_eq!(fc.name, "double");
                assert_eq!(fc.args.len(), 1);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_cast_array_to_slice() {
        let program = parse(
            r#"func main() () -> affects(IO) {
                let arr [2]byte = { 1, 2 }
                PrintByteSlice(cast(arr) as []byte)
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        match &main.body.stmts[1] {
            Stmt::Call(fc) => match &fc.args[0] {
                Expr::Slice { size, .. } => assert_eq!(*size, 2),
                other => panic!("expected slice view, got {:?}", other),
            },
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_assert_statement() {
        let program = parse(
            r#"func main() () {
                let x = 3
                assert x == 3
            }"#,
        )
        .unwrap();
        let main = program.find_func("main").unwrap();
        assert!(matches!(main.body.stmts[1], Stmt::Assert { .. }));
    }

    #[test]
    fn test_multiple_names_one_type() {
        let program = parse(
            r#"func add(a, b int) (int) {
                return a + b
            }"#,
        )
        .unwrap();
        let add = program.find_func("add").unwrap();
        assert_eq!(add.args.len(), 2);
        assert_eq!(add.args[0].typ.type_name(), "int");
        assert_eq!(add.args[1].typ.type_name(), "int");
    }

    #[test]
    fn test_prototype_preserved() {
        let program = parse(
            r#"func changer(mutable x int, y int) (int) {
                x = 4
                return x + y
            }"#,
        )
        .unwrap();
        let sig = &program.callables["changer"][0];
        assert_eq!(sig.args.len(), 2);
        assert_eq!(sig.args[0].name, "x");
        assert!(sig.args[0].reference);
        assert_eq!(sig.args[1].name, "y");
        assert!(!sig.args[1].reference);
        assert_eq!(sig.ret.len(), 1);
        assert_eq!(sig.ret[0].typ.type_name(), "int");
    }
}
