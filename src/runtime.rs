//! JVM runtime module responsible for creating a new runtime
//! environment and running programs.
//!
//! `Runtime` is the single execution context: it owns the root class
//! loader, the primitive classes, the interned strings and the
//! current-thread slot, and every method call goes through
//! [`Runtime::invoke`].
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::class::{Class, Method, MethodBody};
use crate::config::{RuntimeConfig, RESERVED_FRAMES};
use crate::descriptor::PrimitiveType;
use crate::error::{Result, RuntimeErrorKind, VmError};
use crate::interpreter::Interpreter;
use crate::loader::{ClassLoader, ClassSource};
use crate::native::{NativeMethod, NativeRegistry};
use crate::object::{ArrayStorage, Object, ObjectRef, Value};
use crate::thread::{ContextGuard, FrameGuard, Thread};
use crate::trace::Throwable;

pub const STRING: &str = "java/lang/String";
pub const STRING_VALUE: &str = "java/lang/String:value";
pub const CLASS: &str = "java/lang/Class";

/// Runs `f` on a new host thread whose stack holds `config`'s call depth,
/// so running out of depth raises a stack overflow instead of exhausting
/// the host stack. A [`Runtime`] stays on the thread that built it, so `f`
/// builds its own. Panics in `f` resume on the caller.
pub fn run_on_guest_stack<T, F>(config: &RuntimeConfig, f: F) -> std::io::Result<T>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name("drip-guest".to_string())
            .stack_size(config.host_stack_size())
            .spawn_scoped(scope, f)?;
        match handle.join() {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}

pub struct Runtime {
    config: RuntimeConfig,
    loader: Rc<ClassLoader>,
    primitives: HashMap<PrimitiveType, Rc<Class>>,
    strings: RefCell<HashMap<String, ObjectRef>>,
    current: RefCell<Option<Rc<Thread>>>,
    main_thread: Rc<Thread>,
    // Set while a guest throwable is being built for a host error.
    translating: Cell<bool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, source: Option<Box<dyn ClassSource>>) -> Self {
        let loader = ClassLoader::new("root", None, source);
        let primitives = PrimitiveType::ALL
            .iter()
            .map(|&p| (p, Class::primitive(p, Rc::downgrade(&loader))))
            .collect();
        Self {
            config,
            loader,
            primitives,
            strings: RefCell::new(HashMap::new()),
            current: RefCell::new(None),
            main_thread: Thread::new(None),
            translating: Cell::new(false),
        }
    }

    /// Runtime with the default configuration over one class source.
    pub fn with_source(source: Box<dyn ClassSource>) -> Self {
        Self::new(RuntimeConfig::default(), Some(source))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The root class loader.
    pub fn loader(&self) -> &Rc<ClassLoader> {
        &self.loader
    }

    /// Native registry of the root loader.
    pub fn natives(&self) -> &NativeRegistry {
        self.loader.natives()
    }

    pub fn primitive_class(&self, primitive: PrimitiveType) -> Rc<Class> {
        match self.primitives.get(&primitive) {
            Some(class) => class.clone(),
            None => unreachable!("every primitive class is created with the runtime"),
        }
    }

    /// Loads a class through the root loader.
    pub fn load_class(&self, name: &str) -> Result<Rc<Class>> {
        self.loader.load_class(self, name)
    }

    /// Defines class bytes in the root loader.
    pub fn define_class(&self, bytes: &[u8]) -> Result<Rc<Class>> {
        self.loader.define_class_file(bytes)
    }

    pub(crate) fn current_slot(&self) -> &RefCell<Option<Rc<Thread>>> {
        &self.current
    }

    /// Thread whose stack receives frames right now.
    pub fn current_thread(&self) -> Rc<Thread> {
        self.current
            .borrow()
            .clone()
            .unwrap_or_else(|| self.main_thread.clone())
    }

    pub fn main_thread(&self) -> &Rc<Thread> {
        &self.main_thread
    }

    /// Calls `method` with `args`, receiver first for instance methods.
    /// The declaring class is initialized first.
    pub fn invoke(&self, method: &Rc<Method>, args: Vec<Value>) -> Result<Option<Value>> {
        let class = method.class()?;
        class.try_init(self)?;

        let thread = self.current_thread();
        if let Some(max) = self.config.max_call_depth {
            let limit = if self.translating.get() { max + RESERVED_FRAMES } else { max };
            if thread.depth() >= limit {
                return Err(self.raise(
                    RuntimeErrorKind::StackOverflow,
                    format!("call depth {} exceeded", max),
                ));
            }
        }

        let frame = FrameGuard::push(thread, &class, method);
        trace!(class = class.name(), method = method.name(), descriptor = method.descriptor(), "invoke");
        match method.body() {
            MethodBody::Bytecode(code) => {
                Interpreter::new(self, frame.thread().clone(), class.clone(), method.clone(), code.clone(), args)?
                    .run()
            }
            MethodBody::Host(host) => self.call_host(host.clone(), args),
            MethodBody::Native => {
                let key = method.native_key();
                match self.lookup_native(&class, &key) {
                    Some(native) => {
                        debug!(key = %key, "calling native method");
                        self.call_host(native, args)
                    }
                    None => Err(self.translate(VmError::UnsatisfiedLink(key))),
                }
            }
            MethodBody::Abstract => Err(self.raise(
                RuntimeErrorKind::AbstractMethod,
                format!("{}.{}{}", class.java_name(), method.name(), method.descriptor()),
            )),
        }
    }

    fn call_host(&self, host: NativeMethod, args: Vec<Value>) -> Result<Option<Value>> {
        let _context = ContextGuard::capture(self);
        host(self, args)
    }

    /// Natives are looked up in the defining loader, then its parents.
    fn lookup_native(&self, class: &Class, key: &str) -> Option<NativeMethod> {
        let mut loader = Some(class.loader().unwrap_or_else(|| self.loader.clone()));
        while let Some(current) = loader {
            if let Some(native) = current.natives().lookup(key) {
                return Some(native);
            }
            loader = current.parent().cloned();
        }
        None
    }

    /// Resolves and calls a static method.
    pub fn invoke_static(
        &self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let class = self.load_class(class_name)?;
        let method = class.resolve_method(self, name, descriptor, false)?;
        if !method.is_static() {
            return Err(VmError::fatal(format!("{class_name}.{name}{descriptor} is not static")));
        }
        self.invoke(&method, args)
    }

    /// Calls an instance method through the receiver's dispatch table.
    /// `args` excludes the receiver.
    pub fn invoke_virtual(
        &self,
        receiver: &ObjectRef,
        name: &str,
        descriptor: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let class = receiver.class();
        class.try_init(self)?;
        let method = class
            .find_virtual(&format!("{name}{descriptor}"))
            .ok_or_else(|| VmError::NoSuchMethod {
                class: class.name().to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::object(receiver.clone()));
        full.extend(args);
        self.invoke(&method, full)
    }

    /// Allocates an instance and runs the constructor taking
    /// `param_descriptor`.
    pub fn new_instance_with(&self, class_name: &str, param_descriptor: &str, args: Vec<Value>) -> Result<ObjectRef> {
        let class = self.load_class(class_name)?;
        let object = class.new_instance(self)?;
        class.invoke_constructor(self, &object, param_descriptor, args)?;
        Ok(object)
    }

    /// Builds a guest string from host text.
    pub fn guest_string(&self, text: &str) -> Result<ObjectRef> {
        let char_array = self.primitive_class(PrimitiveType::Char).array_class();
        char_array.try_init(self)?;
        let chars = Object::with_storage(char_array, ArrayStorage::Char(text.encode_utf16().collect()));

        let string_class = self.load_class(STRING)?;
        let object = string_class.new_instance(self)?;
        if string_class.constructor("[C").is_some() {
            string_class.invoke_constructor(self, &object, "[C", vec![Value::object(chars)])?;
        } else {
            object.put_field(STRING_VALUE, Value::object(chars))?;
        }
        Ok(object)
    }

    /// Reads a guest string back into host text. Lone surrogates are
    /// replaced.
    pub fn host_string(&self, object: &ObjectRef) -> Result<String> {
        let Value::Reference(Some(value)) = object.get_field(STRING_VALUE)? else {
            return Err(VmError::fatal("string has no value"));
        };
        let storage = value.array()?;
        let text = match &*storage {
            ArrayStorage::Char(units) => String::from_utf16_lossy(units),
            _ => return Err(VmError::fatal("string value is not a char array")),
        };
        Ok(text)
    }

    /// The canonical guest string for `text`. String literals resolve here.
    pub fn intern(&self, text: &str) -> Result<ObjectRef> {
        if let Some(existing) = self.strings.borrow().get(text) {
            return Ok(existing.clone());
        }
        let object = self.guest_string(text)?;
        Ok(self
            .strings
            .borrow_mut()
            .entry(text.to_string())
            .or_insert(object)
            .clone())
    }

    /// Canonical version of an existing guest string.
    pub fn intern_object(&self, object: &ObjectRef) -> Result<ObjectRef> {
        let text = self.host_string(object)?;
        Ok(self
            .strings
            .borrow_mut()
            .entry(text)
            .or_insert_with(|| object.clone())
            .clone())
    }

    /// The `java/lang/Class` instance standing for `class`, created on
    /// first request.
    pub fn class_object(&self, class: &Rc<Class>) -> Result<ObjectRef> {
        if let Some(mirror) = class.mirror_cell().get() {
            return Ok(mirror.clone());
        }
        let mirror = self.load_class(CLASS)?.new_instance(self)?;
        mirror.set_mirrored_class(class);
        Ok(class.mirror_cell().get_or_init(|| mirror).clone())
    }

    /// Wraps a guest object as a propagating throwable with the current
    /// call stack.
    pub fn throw(&self, object: ObjectRef) -> VmError {
        VmError::Throw(Throwable::new(object, self.current_thread().snapshot()))
    }

    /// Reports a runtime condition. With guest exceptions on this is an
    /// instance of the matching guest class, otherwise a host error.
    pub fn raise(&self, kind: RuntimeErrorKind, message: impl Into<String>) -> VmError {
        let message = message.into();
        if !self.config.guest_exceptions || self.translating.get() {
            return VmError::Runtime { kind, message };
        }
        match self.build_throwable(kind.guest_class(), &message) {
            Some(throwable) => VmError::Throw(throwable),
            None => VmError::Runtime { kind, message },
        }
    }

    /// Turns linkage failures into guest throwables when guest exceptions
    /// are on. Everything else is returned unchanged.
    pub fn translate(&self, err: VmError) -> VmError {
        if !self.config.guest_exceptions || self.translating.get() {
            return err;
        }
        let Some(class_name) = err.linkage_guest_class() else {
            return err;
        };
        let message = match &err {
            VmError::ClassNotFound(name) => name.replace('/', "."),
            other => other.to_string(),
        };
        match self.build_throwable(class_name, &message) {
            Some(throwable) => VmError::Throw(throwable),
            None => err,
        }
    }

    fn build_throwable(&self, class_name: &str, message: &str) -> Option<Throwable> {
        let trace = self.current_thread().snapshot();
        self.translating.set(true);
        let built = self.construct_throwable(class_name, message);
        self.translating.set(false);
        match built {
            Ok(object) => Some(Throwable::new(object, trace)),
            Err(err) => {
                debug!(class = class_name, error = %err, "could not build guest throwable");
                None
            }
        }
    }

    fn construct_throwable(&self, class_name: &str, message: &str) -> Result<ObjectRef> {
        let class = self.load_class(class_name)?;
        let object = class.new_instance(self)?;
        if class.constructor("Ljava/lang/String;").is_some() {
            let message = self.guest_string(message)?;
            class.invoke_constructor(self, &object, "Ljava/lang/String;", vec![Value::object(message)])?;
        } else {
            class.invoke_constructor(self, &object, "", Vec::new())?;
        }
        Ok(object)
    }

    /// Runs `object.run()V` on a fresh logical thread bound to `object`,
    /// then switches back to the calling thread.
    pub fn start_thread(&self, object: &ObjectRef) -> Result<()> {
        let thread = Thread::new(Some(object.clone()));
        debug!(object = ?object, "starting thread");
        let _context = ContextGuard::enter(self, thread);
        self.invoke_virtual(object, "run", "()V", Vec::new())?;
        Ok(())
    }

    /// `Object.wait` with a timeout. There is no other thread that could
    /// notify, so this returns at once.
    pub fn wait_object(&self, object: &ObjectRef, millis: i64) -> Result<()> {
        debug!(object = ?object, millis, "wait returns immediately");
        Ok(())
    }
}
