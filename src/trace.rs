//! Stack traces of guest throwables.
use std::fmt::{self, Write};

use crate::object::{ObjectRef, Value};
use crate::runtime::Runtime;
use crate::thread::NATIVE_LINE;

/// Slot holding a throwable's message.
pub const DETAIL_MESSAGE: &str = "java/lang/Throwable:detailMessage";

/// One frame of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    pub class_name: String,
    pub method_name: String,
    pub source_file: Option<String>,
    // UNKNOWN_LINE, NATIVE_LINE or a source line.
    pub line: i32,
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}(", self.class_name.replace('/', "."), self.method_name)?;
        match (&self.source_file, self.line) {
            (_, NATIVE_LINE) => write!(f, "Native Method)"),
            (Some(file), line) if line >= 0 => write!(f, "{file}:{line})"),
            (Some(file), _) => write!(f, "{file})"),
            (None, _) => write!(f, "Unknown Source)"),
        }
    }
}

/// Innermost frame first.
pub type StackTrace = Vec<StackTraceElement>;

/// A thrown guest object together with the call stack at the throw site.
#[derive(Debug, Clone)]
pub struct Throwable {
    pub object: ObjectRef,
    pub trace: StackTrace,
}

impl Throwable {
    pub fn new(object: ObjectRef, trace: StackTrace) -> Self {
        Self { object, trace }
    }

    /// Internal name of the thrown object's class.
    pub fn class_name(&self) -> &str {
        self.object.class().name()
    }

    /// Message stored in the throwable, if it has one.
    pub fn message(&self, rt: &Runtime) -> Option<String> {
        match self.object.get_field(DETAIL_MESSAGE) {
            Ok(Value::Reference(Some(message))) => rt.host_string(&message).ok(),
            _ => None,
        }
    }

    /// Formats the throwable the way an uncaught exception is reported:
    /// a header line followed by one `at` line per frame.
    pub fn render(&self, rt: &Runtime) -> String {
        let mut s = String::new();
        let name = self.class_name().replace('/', ".");
        let _ = match self.message(rt) {
            Some(message) => write!(&mut s, "{name}: {message}"),
            None => write!(&mut s, "{name}"),
        };
        for element in &self.trace {
            let _ = write!(&mut s, "\n\tat {element}");
        }
        s
    }
}
