//! A class-file virtual machine: decoder, runtime type model and bytecode
//! interpreter.
pub mod bootstrap;
pub mod bytecode;
pub mod class;
pub mod config;
pub mod constant_pool;
pub mod descriptor;
pub mod error;
pub mod interpreter;
pub mod jvm;
pub mod loader;
pub mod native;
pub mod object;
pub mod runtime;
pub mod thread;
pub mod trace;

pub use class::{Class, Field, HostClassBuilder, Method};
pub use config::RuntimeConfig;
pub use error::{FormatError, Result, RuntimeErrorKind, VmError};
pub use loader::{ClassLoader, ClassSource, DirectoryClassSource, MemoryClassSource};
pub use native::{native, NativeMethod};
pub use object::{Object, ObjectRef, Value};
pub use runtime::{run_on_guest_stack, Runtime};
pub use trace::Throwable;
