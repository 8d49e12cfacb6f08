//! Field and method type descriptors.
//!
//! Grammar:
//! ```text
//! field  := 'Z' | 'B' | 'C' | 'D' | 'F' | 'I' | 'J' | 'S' | 'V'
//!         | 'L' name ';'
//!         | '[' field
//! method := '(' field* ')' field
//! ```
use std::fmt;

use crate::error::FormatError;

/// Primitive types of the instruction set, including `void`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Boolean,
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Void,
}

impl PrimitiveType {
    pub const ALL: [PrimitiveType; 9] = [
        PrimitiveType::Boolean,
        PrimitiveType::Byte,
        PrimitiveType::Char,
        PrimitiveType::Double,
        PrimitiveType::Float,
        PrimitiveType::Int,
        PrimitiveType::Long,
        PrimitiveType::Short,
        PrimitiveType::Void,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'Z' => Self::Boolean,
            b'B' => Self::Byte,
            b'C' => Self::Char,
            b'D' => Self::Double,
            b'F' => Self::Float,
            b'I' => Self::Int,
            b'J' => Self::Long,
            b'S' => Self::Short,
            b'V' => Self::Void,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            Self::Boolean => 'Z',
            Self::Byte => 'B',
            Self::Char => 'C',
            Self::Double => 'D',
            Self::Float => 'F',
            Self::Int => 'I',
            Self::Long => 'J',
            Self::Short => 'S',
            Self::Void => 'V',
        }
    }

    /// Source-language keyword, e.g. `int`.
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Char => "char",
            Self::Double => "double",
            Self::Float => "float",
            Self::Int => "int",
            Self::Long => "long",
            Self::Short => "short",
            Self::Void => "void",
        }
    }

    /// Long and double take two stack and local slots.
    pub fn is_wide(self) -> bool {
        matches!(self, Self::Long | Self::Double)
    }
}

/// Parsed type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Primitive(PrimitiveType),
    /// Internal class name, e.g. `java/lang/String`.
    Object(String),
    Array(Box<TypeDescriptor>),
    Method {
        params: Vec<TypeDescriptor>,
        ret: Box<TypeDescriptor>,
    },
}

impl TypeDescriptor {
    /// Parses a complete descriptor. Leftover input is an error.
    pub fn parse(descriptor: &str) -> Result<Self, FormatError> {
        let (ty, consumed) = Self::parse_at(descriptor, 0)?;
        if consumed != descriptor.len() {
            return Err(malformed(descriptor, consumed));
        }
        Ok(ty)
    }

    /// Parses one descriptor starting at byte `start` and returns it with the
    /// number of bytes it spans.
    pub fn parse_at(descriptor: &str, start: usize) -> Result<(Self, usize), FormatError> {
        let bytes = descriptor.as_bytes();
        match bytes.get(start) {
            Some(b'(') => {
                let mut pos = start + 1;
                let mut params = Vec::new();
                loop {
                    match bytes.get(pos) {
                        Some(b')') => break,
                        Some(_) => {
                            let (param, len) = Self::parse_field_at(descriptor, pos)?;
                            params.push(param);
                            pos += len;
                        }
                        None => return Err(malformed(descriptor, pos)),
                    }
                }
                pos += 1;
                let (ret, len) = Self::parse_field_at(descriptor, pos)?;
                pos += len;
                Ok((
                    TypeDescriptor::Method {
                        params,
                        ret: Box::new(ret),
                    },
                    pos - start,
                ))
            }
            _ => Self::parse_field_at(descriptor, start),
        }
    }

    fn parse_field_at(descriptor: &str, start: usize) -> Result<(Self, usize), FormatError> {
        let bytes = descriptor.as_bytes();
        let Some(&code) = bytes.get(start) else {
            return Err(malformed(descriptor, start));
        };
        if let Some(primitive) = PrimitiveType::from_code(code) {
            return Ok((TypeDescriptor::Primitive(primitive), 1));
        }
        match code {
            b'L' => {
                let end = bytes[start..]
                    .iter()
                    .position(|&b| b == b';')
                    .map(|offset| start + offset)
                    .ok_or_else(|| malformed(descriptor, start))?;
                if end == start + 1 {
                    return Err(malformed(descriptor, start));
                }
                let name = descriptor[start + 1..end].to_string();
                Ok((TypeDescriptor::Object(name), end - start + 1))
            }
            b'[' => {
                let (element, len) = Self::parse_field_at(descriptor, start + 1)?;
                Ok((TypeDescriptor::Array(Box::new(element)), len + 1))
            }
            _ => Err(malformed(descriptor, start)),
        }
    }

    /// Number of operand stack or local slots a value of this type takes.
    pub fn slot_width(&self) -> usize {
        match self {
            TypeDescriptor::Primitive(PrimitiveType::Void) => 0,
            TypeDescriptor::Primitive(p) if p.is_wide() => 2,
            _ => 1,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.slot_width() == 2
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeDescriptor::Primitive(PrimitiveType::Void))
    }

    /// Parameter types of a method descriptor, empty for field types.
    pub fn params(&self) -> &[TypeDescriptor] {
        match self {
            TypeDescriptor::Method { params, .. } => params,
            _ => &[],
        }
    }

    pub fn return_type(&self) -> Option<&TypeDescriptor> {
        match self {
            TypeDescriptor::Method { ret, .. } => Some(ret),
            _ => None,
        }
    }

    /// Concatenated parameter descriptors, the key of a constructor.
    pub fn parameter_descriptor(&self) -> String {
        self.params().iter().map(ToString::to_string).collect()
    }

    /// Total slots taken by the parameters.
    pub fn parameter_slots(&self) -> usize {
        self.params().iter().map(TypeDescriptor::slot_width).sum()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeDescriptor::Primitive(p) => write!(f, "{}", p.code()),
            TypeDescriptor::Object(name) => write!(f, "L{name};"),
            TypeDescriptor::Array(element) => write!(f, "[{element}"),
            TypeDescriptor::Method { params, ret } => {
                write!(f, "(")?;
                for param in params {
                    write!(f, "{param}")?;
                }
                write!(f, "){ret}")
            }
        }
    }
}

fn malformed(descriptor: &str, position: usize) -> FormatError {
    FormatError::BadDescriptor {
        descriptor: descriptor.to_string(),
        position,
    }
}
