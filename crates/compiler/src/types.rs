//! Type system for Mica
//!
//! Types are value trees: user and enum types are referenced by name into
//! the registries built during parsing, so no reference cycles exist.
//! Every type resolves to an `Info { size, signed }` pair; a size of zero
//! means "one machine word" on the target.

use std::collections::HashMap;

/// Size and signedness of a value of some type.
///
/// `size` is in bytes; 0 means word-sized (8 bytes on amd64, but kept as 0
/// so the backend can pick the platform default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TypeInfo {
    pub size: usize,
    pub signed: bool,
}

impl TypeInfo {
    pub fn new(size: usize, signed: bool) -> Self {
        TypeInfo { size, signed }
    }

    /// Concrete byte width, with 0 resolved to the platform word.
    pub fn byte_size(&self) -> usize {
        if self.size == 0 { 8 } else { self.size }
    }
}

/// A named field of a tuple type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleField {
    pub name: String,
    pub typ: Type,
}

/// One constructor of an enumerated type.
///
/// `parameters` holds the *type names* of the constructor's parameter
/// slots; `parent` is the name of the enum the constructor belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumOption {
    pub constructor: String,
    pub parameters: Vec<String>,
    pub parent: String,
}

/// An enumerated type definition: an ordered list of constructors.
///
/// Runtime layout is `{constructor_index: word, param0, param1, …}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumTypeDefn {
    pub name: String,
    pub options: Vec<EnumOption>,
}

impl EnumTypeDefn {
    /// Largest parameter count across all constructors.
    pub fn max_params(&self) -> usize {
        self.options
            .iter()
            .map(|o| o.parameters.len())
            .max()
            .unwrap_or(0)
    }
}

/// A source-level type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// A primitive or plain named type (`int`, `bool`, `string`, …).
    Literal(String),
    /// A named alias over a concrete type (`type Fd = int64`).
    User { name: String, concrete: Box<Type> },
    /// Fixed-size array `[N]T`: `N × sizeof(T)` contiguous bytes.
    Array { base: Box<Type>, size: usize },
    /// Slice `[]T`. Allocated: `{length: word, elements…}`; passed:
    /// `{length: word, base_pointer: word}`.
    Slice { base: Box<Type> },
    /// Ordered named fields.
    Tuple(Vec<TupleField>),
    /// Discriminated union of types; layout `{tag: word, payload: widest}`.
    Sum(Vec<Type>),
    /// Enumerated type with constructors.
    Enum(EnumTypeDefn),
}

impl Type {
    /// The canonical name of this type, used for nominal comparisons.
    pub fn type_name(&self) -> String {
        match self {
            Type::Literal(name) => name.clone(),
            Type::User { name, .. } => name.clone(),
            Type::Array { base, size } => format!("[{}]{}", size, base.type_name()),
            Type::Slice { base } => format!("[]{}", base.type_name()),
            Type::Tuple(fields) => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{} {}", f.name, f.typ.type_name()))
                    .collect();
                format!("({})", inner.join(", "))
            }
            Type::Sum(members) => {
                let names: Vec<String> = members.iter().map(|m| m.type_name()).collect();
                names.join(" | ")
            }
            Type::Enum(defn) => defn.name.clone(),
        }
    }

    /// Resolve user-type aliases down to the underlying concrete type.
    pub fn concrete(&self) -> &Type {
        match self {
            Type::User { concrete, .. } => concrete.concrete(),
            other => other,
        }
    }

    /// Scalar info for a value of this type. Aggregates report word size;
    /// their members are looked at individually through [`Type::slots`].
    pub fn info(&self, registry: &TypeRegistry) -> TypeInfo {
        match self {
            Type::Literal(name) => registry.lookup(name).unwrap_or_default(),
            Type::User { concrete, .. } => concrete.info(registry),
            Type::Array { .. }
            | Type::Slice { .. }
            | Type::Tuple(_)
            | Type::Sum(_)
            | Type::Enum(_) => TypeInfo::default(),
        }
    }

    /// The per-slot layout of a value of this type as it appears in
    /// argument and return registers.
    ///
    /// Slices, strings, and arrays occupy two consecutive word slots
    /// (length, base pointer). Sum types occupy a tag word plus a payload
    /// word. Enums occupy the tag word plus one word per parameter of the
    /// widest constructor. Tuples flatten their fields.
    pub fn slots(&self, registry: &TypeRegistry) -> Vec<TypeInfo> {
        match self {
            Type::Literal(name) if name == "string" => {
                vec![TypeInfo::new(0, false), TypeInfo::new(8, false)]
            }
            Type::Literal(name) => vec![registry.lookup(name).unwrap_or_default()],
            Type::User { concrete, .. } => concrete.slots(registry),
            Type::Slice { .. } | Type::Array { .. } => {
                vec![TypeInfo::new(0, false), TypeInfo::new(8, false)]
            }
            Type::Tuple(fields) => fields.iter().flat_map(|f| f.typ.slots(registry)).collect(),
            Type::Sum(_) => vec![TypeInfo::new(0, false), TypeInfo::default()],
            Type::Enum(defn) => {
                let mut slots = vec![TypeInfo::new(0, false)];
                slots.extend(std::iter::repeat(TypeInfo::default()).take(defn.max_params()));
                slots
            }
        }
    }

    /// True for the integer family (including `byte`).
    pub fn is_integer(&self, registry: &TypeRegistry) -> bool {
        match self.concrete() {
            Type::Literal(name) => registry.is_integer(name),
            _ => false,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Registry mapping type names to their [`TypeInfo`].
///
/// Pre-populated with the primitives; extended as `type` and `enum`
/// declarations are parsed.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    infos: HashMap<String, TypeInfo>,
}

impl TypeRegistry {
    pub fn with_primitives() -> Self {
        let mut infos = HashMap::new();
        infos.insert("int".to_string(), TypeInfo::new(0, true));
        infos.insert("uint".to_string(), TypeInfo::new(0, false));
        infos.insert("int8".to_string(), TypeInfo::new(1, true));
        infos.insert("uint8".to_string(), TypeInfo::new(1, false));
        infos.insert("byte".to_string(), TypeInfo::new(1, false));
        infos.insert("int16".to_string(), TypeInfo::new(2, true));
        infos.insert("uint16".to_string(), TypeInfo::new(2, false));
        infos.insert("int32".to_string(), TypeInfo::new(4, true));
        infos.insert("uint32".to_string(), TypeInfo::new(4, false));
        infos.insert("int64".to_string(), TypeInfo::new(8, true));
        infos.insert("uint64".to_string(), TypeInfo::new(8, false));
        infos.insert("bool".to_string(), TypeInfo::new(1, false));
        infos.insert("string".to_string(), TypeInfo::new(0, false));
        TypeRegistry { infos }
    }

    pub fn lookup(&self, name: &str) -> Option<TypeInfo> {
        self.infos.get(name).copied()
    }

    pub fn register(&mut self, name: impl Into<String>, info: TypeInfo) {
        self.infos.insert(name.into(), info);
    }

    pub fn is_integer(&self, name: &str) -> bool {
        matches!(
            name,
            "int"
                | "uint"
                | "int8"
                | "uint8"
                | "byte"
                | "int16"
                | "uint16"
                | "int32"
                | "uint32"
                | "int64"
                | "uint64"
        )
    }

    /// Whether an integer literal value fits in the named integer type.
    pub fn fits(&self, name: &str, value: i64) -> bool {
        match name {
            "int" | "int64" => true,
            "uint" | "uint64" => value >= 0,
            "int8" => i8::try_from(value).is_ok(),
            "uint8" | "byte" => u8::try_from(value).is_ok(),
            "int16" => i16::try_from(value).is_ok(),
            "uint16" => u16::try_from(value).is_ok(),
            "int32" => i32::try_from(value).is_ok(),
            "uint32" => u32::try_from(value).is_ok(),
            _ => false,
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_primitives()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_infos() {
        let reg = TypeRegistry::with_primitives();
        assert_eq!(reg.lookup("int"), Some(TypeInfo::new(0, true)));
        assert_eq!(reg.lookup("byte"), Some(TypeInfo::new(1, false)));
        assert_eq!(reg.lookup("int16"), Some(TypeInfo::new(2, true)));
        assert_eq!(reg.lookup("uint64"), Some(TypeInfo::new(8, false)));
        assert_eq!(reg.lookup("nosuch"), None);
    }

    #[test]
    fn test_type_names() {
        let arr = Type::Array {
            base: Box::new(Type::Literal("int".into())),
            size: 5,
        };
        assert_eq!(arr.type_name(), "[5]int");

        let slice = Type::Slice {
            base: Box::new(Type::Literal("string".into())),
        };
        assert_eq!(slice.type_name(), "[]string");

        let sum = Type::Sum(vec![
            Type::Literal("int".into()),
            Type::Literal("string".into()),
        ]);
        assert_eq!(sum.type_name(), "int | string");
    }

    #[test]
    fn test_slice_slots() {
        let reg = TypeRegistry::with_primitives();
        let slice = Type::Slice {
            base: Box::new(Type::Literal("byte".into())),
        };
        let slots = slice.slots(&reg);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0], TypeInfo::new(0, false));
        assert_eq!(slots[1], TypeInfo::new(8, false));
    }

    #[test]
    fn test_string_is_two_slots() {
        let reg = TypeRegistry::with_primitives();
        let slots = Type::Literal("string".into()).slots(&reg);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_enum_slots() {
        let reg = TypeRegistry::with_primitives();
        let maybe = Type::Enum(EnumTypeDefn {
            name: "Maybe".into(),
            options: vec![
                EnumOption {
                    constructor: "None".into(),
                    parameters: vec![],
                    parent: "Maybe".into(),
                },
                EnumOption {
                    constructor: "Some".into(),
                    parameters: vec!["int".into()],
                    parent: "Maybe".into(),
                },
            ],
        });
        // Tag word plus the widest constructor's single parameter.
        assert_eq!(maybe.slots(&reg).len(), 2);
    }

    #[test]
    fn test_literal_fits() {
        let reg = TypeRegistry::with_primitives();
        assert!(reg.fits("uint8", 255));
        assert!(!reg.fits("uint8", 256));
        assert!(!reg.fits("uint64", -1));
        assert!(reg.fits("int8", -128));
        assert!(!reg.fits("int8", 128));
        assert!(reg.fits("int", i64::MAX));
    }
}
