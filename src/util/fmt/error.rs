use std::fmt;

use crate::{codegen, parser, token::Positioned};

impl<T: fmt::Display> fmt::Display for Positioned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.pos, self.inner)
    }
}

impl fmt::Display for parser::Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use parser::Error::*;
        match self {
            Unexpected { actual, expected } => {
                write!(f, "expected next token to be {expected:?}, got {actual:?} instead")
            }
            UnexpectedEof { expected } => {
                write!(f, "unexpected end of input, expected {expected:?}")
            }
            UnexpectedOperator { actual } => write!(f, "unexpected operator {actual:?}"),
            NoPrefixRule { token } => write!(f, "no prefix parse function for {token:?} found"),
            MalformedSignature { actual } => {
                write!(f, "malformed function signature near {actual:?}")
            }
            UndefinedStruct(name) => write!(f, "undefined struct '{name}'"),
            TooManyStructValues(name) => write!(f, "too many values in struct literal '{name}'"),
            UnknownStructField { name, field } => {
                write!(f, "struct '{name}' has no field '{field}'")
            }
            DuplicateStructField(field) => write!(f, "field '{field}' is set more than once"),
            InvalidAssignmentTarget => {
                write!(f, "left-hand side of assignment must be an identifier")
            }
            InvalidCallee => write!(f, "only named functions can be called"),
            InferenceOutsideStatement => {
                write!(f, "':=' is only allowed at the start of a statement")
            }
            CannotInferType => write!(f, "cannot infer type from initializer"),
            InvalidNumber => write!(f, "invalid number literal"),
        }
    }
}

impl fmt::Display for codegen::Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            codegen::Error::UnknownType { name } => write!(f, "unknown type '{name}'"),
        }
    }
}

impl std::error::Error for parser::Error {}
impl std::error::Error for codegen::Error {}
