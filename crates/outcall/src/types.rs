//! Call-site and target descriptions
//!
//! The interpreter owns these; the dispatcher only reads them. A slot in the
//! argument buffer is always one 64-bit word, and every `ValType` describes
//! how that word is reinterpreted when it is read or written.

use std::fmt;
use std::str::FromStr;

/// Fixed-width value type a word slot can be reinterpreted as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    /// One byte, zero or one
    Bool,
    /// 8-bit integer
    I8,
    /// 16-bit integer
    I16,
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// Single-precision float
    F32,
    /// Double-precision float
    F64,
    /// Host pointer
    Ptr,
}

impl ValType {
    /// Number of bytes read from (or written to) a word slot
    pub const fn byte_width(self) -> usize {
        match self {
            ValType::Bool | ValType::I8 => 1,
            ValType::I16 => 2,
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
            ValType::Ptr => std::mem::size_of::<usize>(),
        }
    }

    /// Whether the value travels in a floating-point register
    pub const fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }

    /// Whether the value is a signed integer (`Bool` and `Ptr` are not)
    pub const fn is_signed_int(self) -> bool {
        matches!(self, ValType::I8 | ValType::I16 | ValType::I32 | ValType::I64)
    }

    /// Mask selecting the bytes of a word that belong to this type
    pub const fn word_mask(self) -> u64 {
        match self.byte_width() {
            8 => u64::MAX,
            n => (1u64 << (n * 8)) - 1,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValType::Bool => "bool",
            ValType::I8 => "i8",
            ValType::I16 => "i16",
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::Ptr => "ptr",
        };
        f.write_str(text)
    }
}

impl FromStr for ValType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "i1" => Ok(ValType::Bool),
            "i8" | "char" => Ok(ValType::I8),
            "i16" | "short" => Ok(ValType::I16),
            "i32" | "int" => Ok(ValType::I32),
            "i64" | "long" => Ok(ValType::I64),
            "f32" | "float" => Ok(ValType::F32),
            "f64" | "double" => Ok(ValType::F64),
            "ptr" | "pointer" => Ok(ValType::Ptr),
            other => Err(format!("unknown value type `{}`", other)),
        }
    }
}

/// The function an external call targets, as declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFunction {
    /// Symbol name, possibly prefixed with the assembly-name marker
    pub name: String,
    /// Declared parameter types
    pub params: Vec<ValType>,
    /// Declared result type (`None` = void)
    pub result: Option<ValType>,
    /// Whether the declaration accepts trailing variadic arguments
    pub variadic: bool,
}

impl ExternalFunction {
    /// Describe a non-variadic target
    pub fn new(name: impl Into<String>, params: Vec<ValType>, result: Option<ValType>) -> Self {
        ExternalFunction {
            name: name.into(),
            params,
            result,
            variadic: false,
        }
    }

    /// Describe a variadic target (`printf`-style)
    pub fn variadic(name: impl Into<String>, params: Vec<ValType>, result: Option<ValType>) -> Self {
        ExternalFunction {
            variadic: true,
            ..ExternalFunction::new(name, params, result)
        }
    }
}

/// Identity of one call instruction in the interpreted program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteId(pub u64);

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site#{}", self.0)
    }
}

/// Shape of the call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallKind {
    /// Plain call
    #[default]
    Call,
    /// Call with an unwind edge; dispatched exactly like `Call`
    Invoke,
}

/// One occurrence of an external call, with its own argument layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Cache key
    pub id: CallSiteId,
    /// Instruction shape
    pub kind: CallKind,
    /// Apparent type of each argument expression
    pub args: Vec<ValType>,
    /// Result type of the call (`None` = void)
    pub result: Option<ValType>,
}

impl CallSite {
    /// Describe a plain call site
    pub fn new(id: CallSiteId, args: Vec<ValType>, result: Option<ValType>) -> Self {
        CallSite {
            id,
            kind: CallKind::Call,
            args,
            result,
        }
    }

    /// Same call site, as an invoke instruction
    pub fn invoke(mut self) -> Self {
        self.kind = CallKind::Invoke;
        self
    }

    /// Words the argument buffer must hold: the result slot plus one per argument
    pub fn buffer_words(&self) -> usize {
        self.args.len() + 1
    }
}
