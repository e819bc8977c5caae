use crate::{ast::Program, token::{Positioned, Primitive}};

mod runtime;
pub mod wat;

/// Lowers a parsed program into a WebAssembly text module.
///
/// With memory management, the module carries a bump allocator that string
/// literals and struct literals are allocated from. Without it, every
/// allocation grows the memory by a fresh page.
pub fn generate(
    program: &Program,
    with_memory_management: bool,
) -> Result<String, Positioned<Error>> {
    wat::Generator::new(with_memory_management).generate(program)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A type name with no machine representation.
    UnknownType { name: Box<str> },
}

/// The machine-level value types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    /// Sized integers and booleans collapse to `i32`. Strings are pointers.
    pub fn of(primitive: Primitive) -> ValType {
        match primitive {
            Primitive::U8
            | Primitive::I8
            | Primitive::U16
            | Primitive::I16
            | Primitive::U32
            | Primitive::I32
            | Primitive::Bool
            | Primitive::Str => ValType::I32,
            Primitive::U64 | Primitive::I64 => ValType::I64,
            Primitive::F32 => ValType::F32,
            Primitive::F64 => ValType::F64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
        }
    }

    /// Size in bytes.
    pub fn size(self) -> u32 {
        match self {
            ValType::I32 | ValType::F32 => 4,
            ValType::I64 | ValType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }
}

impl std::fmt::Display for ValType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
