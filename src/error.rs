//! Error taxonomy shared by the class-file decoder, the type model and the
//! interpreter.
use std::fmt;
use std::io;

use crate::trace::Throwable;

/// Result alias used by everything that links or executes code.
pub type Result<T> = std::result::Result<T, VmError>;

/// Structural problems in class bytes or descriptors. These abort the
/// definition of the class they were found in.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unexpected end of input at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unknown constant tag {tag} at pool index {index}")]
    UnknownConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {0} is not a usable entry")]
    BadConstantIndex(u16),

    #[error("constant pool index {index} holds {found}, expected {expected}")]
    ConstantMismatch {
        index: u16,
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed descriptor {descriptor:?} at position {position}")]
    BadDescriptor { descriptor: String, position: usize },

    #[error("duplicate {kind} {key} in class {class}")]
    DuplicateMember {
        class: String,
        kind: &'static str,
        key: String,
    },

    #[error("attribute {name} declares {declared} bytes but its content is {used} bytes")]
    AttributeLength {
        name: String,
        declared: u32,
        used: u32,
    },

    #[error("{0} trailing bytes after the class definition")]
    TrailingBytes(usize),
}

/// Guest-level runtime conditions. With guest exception translation turned
/// on each of these becomes an instance of [`RuntimeErrorKind::guest_class`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    NullPointer,
    Arithmetic,
    ArrayIndexOutOfBounds,
    NegativeArraySize,
    ArrayStore,
    ClassCast,
    AbstractMethod,
    StackOverflow,
}

impl RuntimeErrorKind {
    /// Internal name of the guest throwable this condition maps to.
    pub fn guest_class(&self) -> &'static str {
        match self {
            Self::NullPointer => "java/lang/NullPointerException",
            Self::Arithmetic => "java/lang/ArithmeticException",
            Self::ArrayIndexOutOfBounds => "java/lang/ArrayIndexOutOfBoundsException",
            Self::NegativeArraySize => "java/lang/NegativeArraySizeException",
            Self::ArrayStore => "java/lang/ArrayStoreException",
            Self::ClassCast => "java/lang/ClassCastException",
            Self::AbstractMethod => "java/lang/AbstractMethodError",
            Self::StackOverflow => "java/lang/StackOverflowError",
        }
    }
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.guest_class();
        write!(f, "{}", name.rsplit('/').next().unwrap_or(name))
    }
}

/// Everything that can go wrong while loading, linking or running code.
///
/// Only [`VmError::Throw`] takes part in exception-table matching. `Format`
/// and `Fatal` always abort the current invocation chain.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("class {0} not found")]
    ClassNotFound(String),

    #[error("no such field {class}.{name}:{descriptor}")]
    NoSuchField {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("no such method {class}.{name}{descriptor}")]
    NoSuchMethod {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("unsatisfied link {0}")]
    UnsatisfiedLink(String),

    #[error("{kind}: {message}")]
    Runtime {
        kind: RuntimeErrorKind,
        message: String,
    },

    #[error("uncaught {}", .0.class_name())]
    Throw(Throwable),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("i/o error while fetching {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl VmError {
    pub fn fatal(message: impl Into<String>) -> Self {
        VmError::Fatal(message.into())
    }

    /// Guest class a linkage failure translates to, if any.
    pub(crate) fn linkage_guest_class(&self) -> Option<&'static str> {
        match self {
            VmError::ClassNotFound(_) => Some("java/lang/NoClassDefFoundError"),
            VmError::NoSuchField { .. } => Some("java/lang/NoSuchFieldError"),
            VmError::NoSuchMethod { .. } => Some("java/lang/NoSuchMethodError"),
            VmError::UnsatisfiedLink(_) => Some("java/lang/UnsatisfiedLinkError"),
            _ => None,
        }
    }

    /// Returns the guest throwable carried by this error.
    pub fn throwable(&self) -> Option<&Throwable> {
        match self {
            VmError::Throw(throwable) => Some(throwable),
            _ => None,
        }
    }
}
