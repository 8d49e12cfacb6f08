//! Runtime type model: classes, fields, methods and their two-phase
//! lifecycle.
//!
//! A class is *defined* when its metadata is built and registered with a
//! loader. Loading it through a loader also *links* it: the superclass and
//! interfaces are loaded and linked, then the ancestry set and the dispatch
//! and constructor tables are built. No guest code runs while linking.
//!
//! A class is *initialized* on first active use. Initialization succeeds at
//! most once and goes through these steps in order:
//!
//! 1. link the class,
//! 2. initialize the superclass and the interfaces,
//! 3. give every static field its zero or constant value,
//! 4. run `<clinit>()V`.
//!
//! A failed initialization leaves the class uninitialized, so the next
//! active use tries again and reports the failure again.
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::{PrimitiveType, TypeDescriptor};
use crate::error::{FormatError, Result, RuntimeErrorKind, VmError};
use crate::jvm::{CodeAttribute, JVMClassFile};
use crate::loader::ClassLoader;
use crate::native::{native, NativeMethod, NativeRegistry};
use crate::object::{ArrayStorage, Object, ObjectRef, Value};
use crate::runtime::Runtime;

/// Access and property flags shared by classes, fields and methods.
pub mod flags {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const PROTECTED: u16 = 0x0004;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const SYNCHRONIZED: u16 = 0x0020;
    pub const NATIVE: u16 = 0x0100;
    pub const INTERFACE: u16 = 0x0200;
    pub const ABSTRACT: u16 = 0x0400;
}

pub const CONSTRUCTOR: &str = "<init>";
pub const CLASS_INITIALIZER: &str = "<clinit>";
pub const OBJECT: &str = "java/lang/Object";

/// Process-unique class identity, the element type of ancestry sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClassId(u64);

static NEXT_CLASS_ID: AtomicU64 = AtomicU64::new(1);

impl ClassId {
    fn next() -> Self {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Progress of [`Class::try_init`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    // Re-entrant initialization requests return at once.
    InProgress,
    Initialized,
}

/// What a class was built from.
pub enum ClassKind {
    Primitive(PrimitiveType),
    Array {
        element: Rc<Class>,
    },
    File {
        pool: ConstantPool,
        super_name: Option<String>,
        interface_names: Vec<String>,
    },
    Host {
        super_class: Option<Rc<Class>>,
        interfaces: Vec<Rc<Class>>,
    },
}

/// Compile-time value of a static field.
#[derive(Debug, Clone)]
pub enum ConstantValue {
    /// `ConstantValue` attribute pointing into the class's pool.
    Index(u16),
    Value(Value),
}

pub struct Field {
    class: Weak<Class>,
    class_name: String,
    access_flags: u16,
    name: String,
    descriptor: String,
    ty: TypeDescriptor,
    constant: Option<ConstantValue>,
}

impl Field {
    pub fn class(&self) -> Result<Rc<Class>> {
        self.class
            .upgrade()
            .ok_or_else(|| VmError::fatal(format!("class {} was dropped", self.class_name)))
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn ty(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & flags::STATIC != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & flags::PRIVATE != 0
    }

    /// `name:descriptor`, the key in the declaring class's field map.
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.descriptor)
    }

    /// `declaringClass:name`, the instance slot of this field.
    pub fn slot_key(&self) -> String {
        format!("{}:{}", self.class_name, self.name)
    }

    /// Reads a static field, initializing the declaring class first.
    pub fn get_static(&self, rt: &Runtime) -> Result<Value> {
        let class = self.class()?;
        class.try_init(rt)?;
        let value = class.statics.borrow().get(&self.key()).cloned();
        value.ok_or_else(|| VmError::fatal(format!("{}.{} is not static", self.class_name, self.name)))
    }

    pub fn put_static(&self, rt: &Runtime, value: Value) -> Result<()> {
        let class = self.class()?;
        class.try_init(rt)?;
        let mut statics = class.statics.borrow_mut();
        match statics.get_mut(&self.key()) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::fatal(format!("{}.{} is not static", self.class_name, self.name))),
        }
    }

    pub fn get_field(&self, object: &Object) -> Result<Value> {
        object.get_field(&self.slot_key())
    }

    pub fn put_field(&self, object: &Object, value: Value) -> Result<()> {
        object.put_field(&self.slot_key(), value)
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class_name, self.name, self.descriptor)
    }
}

/// How a method runs.
#[derive(Clone)]
pub enum MethodBody {
    Bytecode(Rc<CodeAttribute>),
    /// Looked up in the defining loader's native registry on every call.
    Native,
    /// Bound host callable of a host-defined or synthesized method.
    Host(NativeMethod),
    Abstract,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MethodBody::Bytecode(code) => write!(f, "Bytecode({} bytes)", code.code.len()),
            MethodBody::Native => write!(f, "Native"),
            MethodBody::Host(_) => write!(f, "Host"),
            MethodBody::Abstract => write!(f, "Abstract"),
        }
    }
}

pub struct Method {
    class: Weak<Class>,
    class_name: String,
    access_flags: u16,
    name: String,
    descriptor: String,
    ty: TypeDescriptor,
    body: MethodBody,
    exceptions: Vec<String>,
}

impl Method {
    pub fn class(&self) -> Result<Rc<Class>> {
        self.class
            .upgrade()
            .ok_or_else(|| VmError::fatal(format!("class {} was dropped", self.class_name)))
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn ty(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn body(&self) -> &MethodBody {
        &self.body
    }

    pub fn code(&self) -> Option<&Rc<CodeAttribute>> {
        match &self.body {
            MethodBody::Bytecode(code) => Some(code),
            _ => None,
        }
    }

    /// Checked exceptions declared by the method.
    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & flags::STATIC != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & flags::PRIVATE != 0
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.body, MethodBody::Abstract)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }

    /// `name` + `descriptor`, the dispatch key.
    pub fn key(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }

    /// Concatenated parameter descriptors, the constructor key.
    pub fn param_descriptor(&self) -> String {
        self.ty.parameter_descriptor()
    }

    /// `class#name descriptor`, the native bridge key.
    pub fn native_key(&self) -> String {
        NativeRegistry::key(&self.class_name, &self.name, &self.descriptor)
    }

    pub fn returns_void(&self) -> bool {
        self.ty.return_type().map_or(true, TypeDescriptor::is_void)
    }

    /// Invokes the method through the runtime. `args` has the receiver first
    /// for instance methods.
    pub fn invoke(self: &Rc<Self>, rt: &Runtime, args: Vec<Value>) -> Result<Option<Value>> {
        rt.invoke(self, args)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}{} {:?}", self.class_name, self.name, self.descriptor, self.body)
    }
}

/// Member data collected before the owning class exists.
struct FieldProto {
    access_flags: u16,
    name: String,
    descriptor: String,
    ty: TypeDescriptor,
    constant: Option<ConstantValue>,
}

struct MethodProto {
    access_flags: u16,
    name: String,
    descriptor: String,
    ty: TypeDescriptor,
    body: MethodBody,
    exceptions: Vec<String>,
}

fn field_type(class: &str, descriptor: &str) -> std::result::Result<TypeDescriptor, FormatError> {
    let ty = TypeDescriptor::parse(descriptor)?;
    if matches!(ty, TypeDescriptor::Method { .. }) || ty.is_void() {
        return Err(FormatError::BadDescriptor {
            descriptor: format!("{class} field {descriptor}"),
            position: 0,
        });
    }
    Ok(ty)
}

fn method_type(class: &str, descriptor: &str) -> std::result::Result<TypeDescriptor, FormatError> {
    let ty = TypeDescriptor::parse(descriptor)?;
    if !matches!(ty, TypeDescriptor::Method { .. }) {
        return Err(FormatError::BadDescriptor {
            descriptor: format!("{class} method {descriptor}"),
            position: 0,
        });
    }
    Ok(ty)
}

/// The runtime representation of a loaded type.
pub struct Class {
    id: ClassId,
    name: String,
    access_flags: u16,
    loader: Weak<ClassLoader>,
    kind: ClassKind,
    source_file: Option<String>,
    fields: HashMap<String, Rc<Field>>,
    methods: HashMap<String, Rc<Method>>,

    init_state: Cell<InitState>,
    linking: Cell<bool>,
    super_class: OnceCell<Option<Rc<Class>>>,
    interfaces: OnceCell<Vec<Rc<Class>>>,
    ancestry: OnceCell<HashSet<ClassId>>,
    vtable: OnceCell<HashMap<String, Rc<Method>>>,
    constructors: OnceCell<HashMap<String, Rc<Method>>>,
    // Keyed like the field map.
    statics: RefCell<HashMap<String, Value>>,
    array_class: OnceCell<Rc<Class>>,
    mirror: OnceCell<ObjectRef>,
}

impl Class {
    fn assemble(
        name: String,
        access_flags: u16,
        loader: Weak<ClassLoader>,
        kind: ClassKind,
        source_file: Option<String>,
        fields: Vec<FieldProto>,
        methods: Vec<MethodProto>,
    ) -> std::result::Result<Rc<Class>, FormatError> {
        let mut seen = HashSet::new();
        for field in &fields {
            let key = format!("{}:{}", field.name, field.descriptor);
            if !seen.insert(key.clone()) {
                return Err(FormatError::DuplicateMember {
                    class: name,
                    kind: "field",
                    key,
                });
            }
        }
        seen.clear();
        for method in &methods {
            let key = format!("{}{}", method.name, method.descriptor);
            if !seen.insert(key.clone()) {
                return Err(FormatError::DuplicateMember {
                    class: name,
                    kind: "method",
                    key,
                });
            }
        }

        Ok(Rc::new_cyclic(|this: &Weak<Class>| {
            let fields = fields
                .into_iter()
                .map(|proto| {
                    let field = Field {
                        class: this.clone(),
                        class_name: name.clone(),
                        access_flags: proto.access_flags,
                        name: proto.name,
                        descriptor: proto.descriptor,
                        ty: proto.ty,
                        constant: proto.constant,
                    };
                    (field.key(), Rc::new(field))
                })
                .collect();
            let methods = methods
                .into_iter()
                .map(|proto| {
                    let method = Method {
                        class: this.clone(),
                        class_name: name.clone(),
                        access_flags: proto.access_flags,
                        name: proto.name,
                        descriptor: proto.descriptor,
                        ty: proto.ty,
                        body: proto.body,
                        exceptions: proto.exceptions,
                    };
                    (method.key(), Rc::new(method))
                })
                .collect();
            Class {
                id: ClassId::next(),
                name,
                access_flags,
                loader,
                kind,
                source_file,
                fields,
                methods,
                init_state: Cell::new(InitState::Uninitialized),
                linking: Cell::new(false),
                super_class: OnceCell::new(),
                interfaces: OnceCell::new(),
                ancestry: OnceCell::new(),
                vtable: OnceCell::new(),
                constructors: OnceCell::new(),
                statics: RefCell::new(HashMap::new()),
                array_class: OnceCell::new(),
                mirror: OnceCell::new(),
            }
        }))
    }

    /// Builds a class from decoded class bytes. Nothing is loaded or run.
    pub fn from_class_file(
        file: JVMClassFile,
        loader: Weak<ClassLoader>,
    ) -> std::result::Result<Rc<Class>, FormatError> {
        let pool = &file.constant_pool;
        let name = file.name()?.to_string();
        let super_name = file.super_name()?.map(str::to_string);
        let interface_names = file
            .interface_names()?
            .into_iter()
            .map(str::to_string)
            .collect();
        let source_file = file.source_file()?.map(str::to_string);

        let mut fields = Vec::with_capacity(file.fields.len());
        for info in &file.fields {
            let descriptor = pool.utf8(info.descriptor_index)?.to_string();
            fields.push(FieldProto {
                access_flags: info.access_flags,
                name: pool.utf8(info.name_index)?.to_string(),
                ty: field_type(&name, &descriptor)?,
                descriptor,
                constant: info.constant_value_index().map(ConstantValue::Index),
            });
        }

        let mut methods = Vec::with_capacity(file.methods.len());
        for info in &file.methods {
            let descriptor = pool.utf8(info.descriptor_index)?.to_string();
            let body = match info.code() {
                Some(code) => MethodBody::Bytecode(Rc::new(code.clone())),
                None if info.access_flags & flags::NATIVE != 0 => MethodBody::Native,
                None => MethodBody::Abstract,
            };
            let exceptions = info
                .exception_indices()
                .iter()
                .map(|&index| pool.class_name(index).map(str::to_string))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            methods.push(MethodProto {
                access_flags: info.access_flags,
                name: pool.utf8(info.name_index)?.to_string(),
                ty: method_type(&name, &descriptor)?,
                descriptor,
                body,
                exceptions,
            });
        }

        let access_flags = file.access_flags;
        let pool = file.constant_pool;
        pool.bind_loader(loader.clone());
        let kind = ClassKind::File {
            pool,
            super_name,
            interface_names,
        };
        Self::assemble(name, access_flags, loader, kind, source_file, fields, methods)
    }

    /// Class standing for a primitive type. Its name is the type keyword.
    pub fn primitive(primitive: PrimitiveType, loader: Weak<ClassLoader>) -> Rc<Class> {
        let built = Self::assemble(
            primitive.keyword().to_string(),
            flags::PUBLIC | flags::FINAL | flags::ABSTRACT,
            loader,
            ClassKind::Primitive(primitive),
            None,
            Vec::new(),
            Vec::new(),
        );
        match built {
            Ok(class) => class,
            Err(_) => unreachable!("a class without members has no duplicates"),
        }
    }

    fn array(element: &Rc<Class>) -> Rc<Class> {
        let name = format!("[{}", element.descriptor());
        let clone = MethodProto {
            access_flags: flags::PUBLIC,
            name: "clone".to_string(),
            descriptor: "()Ljava/lang/Object;".to_string(),
            ty: TypeDescriptor::Method {
                params: Vec::new(),
                ret: Box::new(TypeDescriptor::Object(OBJECT.to_string())),
            },
            body: MethodBody::Host(native(|_, args| {
                let receiver = args.first().map(Value::as_reference).transpose()?.flatten();
                match receiver {
                    Some(array) => Ok(Some(Value::object(array.shallow_clone()))),
                    None => Err(VmError::fatal("array clone without receiver")),
                }
            })),
            exceptions: Vec::new(),
        };
        let built = Self::assemble(
            name,
            flags::PUBLIC | flags::FINAL | flags::ABSTRACT,
            element.loader.clone(),
            ClassKind::Array {
                element: element.clone(),
            },
            None,
            Vec::new(),
            vec![clone],
        );
        match built {
            Ok(class) => class,
            Err(_) => unreachable!("array classes declare a single method"),
        }
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name with dots, as shown to users.
    pub fn java_name(&self) -> String {
        self.name.replace('/', ".")
    }

    pub fn access_flags(&self) -> u16 {
        self.access_flags
    }

    pub fn kind(&self) -> &ClassKind {
        &self.kind
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    pub fn loader(&self) -> Option<Rc<ClassLoader>> {
        self.loader.upgrade()
    }

    fn defining_loader(&self, rt: &Runtime) -> Rc<ClassLoader> {
        self.loader.upgrade().unwrap_or_else(|| rt.loader().clone())
    }

    pub fn constant_pool(&self) -> Option<&ConstantPool> {
        match &self.kind {
            ClassKind::File { pool, .. } => Some(pool),
            _ => None,
        }
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & flags::INTERFACE != 0
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self.kind, ClassKind::Primitive(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. })
    }

    pub fn primitive_type(&self) -> Option<PrimitiveType> {
        match self.kind {
            ClassKind::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// Element class of an array class.
    pub fn element_class(&self) -> Option<&Rc<Class>> {
        match &self.kind {
            ClassKind::Array { element } => Some(element),
            _ => None,
        }
    }

    /// Field descriptor naming this class.
    pub fn descriptor(&self) -> TypeDescriptor {
        match &self.kind {
            ClassKind::Primitive(p) => TypeDescriptor::Primitive(*p),
            ClassKind::Array { element } => TypeDescriptor::Array(Box::new(element.descriptor())),
            _ => TypeDescriptor::Object(self.name.clone()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init_state.get() == InitState::Initialized
    }

    pub fn init_state(&self) -> InitState {
        self.init_state.get()
    }

    /// Whether ancestry and dispatch tables have been built.
    pub fn is_linked(&self) -> bool {
        self.ancestry.get().is_some()
    }

    pub fn declared_fields(&self) -> impl Iterator<Item = &Rc<Field>> {
        self.fields.values()
    }

    pub fn declared_methods(&self) -> impl Iterator<Item = &Rc<Method>> {
        self.methods.values()
    }

    /// Declared field, no inheritance.
    pub fn field(&self, name: &str, descriptor: &str) -> Option<&Rc<Field>> {
        self.fields.get(&format!("{name}:{descriptor}"))
    }

    /// Declared method, no inheritance.
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&Rc<Method>> {
        self.methods.get(&format!("{name}{descriptor}"))
    }

    /// Superclass if it has been resolved.
    pub fn super_class(&self) -> Option<Rc<Class>> {
        self.super_class.get().cloned().flatten()
    }

    /// Resolves the superclass through the defining loader. Arrays of
    /// references extend the array of their element's superclass, every
    /// other array extends the root class.
    pub fn resolve_super(&self, rt: &Runtime) -> Result<Option<Rc<Class>>> {
        if let Some(resolved) = self.super_class.get() {
            return Ok(resolved.clone());
        }
        let resolved = match &self.kind {
            ClassKind::Primitive(_) => None,
            ClassKind::File { super_name, .. } => match super_name {
                Some(super_name) => Some(self.defining_loader(rt).load_class(rt, super_name)?),
                None => None,
            },
            ClassKind::Host { super_class, .. } => super_class.clone(),
            ClassKind::Array { element } => {
                let element_super = match element.kind {
                    ClassKind::Primitive(_) => None,
                    _ => element.resolve_super(rt)?,
                };
                match element_super {
                    Some(element_super) => Some(element_super.array_class()),
                    None => Some(rt.load_class(OBJECT)?),
                }
            }
        };
        Ok(self.super_class.get_or_init(|| resolved).clone())
    }

    /// Resolves the directly implemented interfaces.
    pub fn resolve_interfaces(&self, rt: &Runtime) -> Result<Vec<Rc<Class>>> {
        if let Some(resolved) = self.interfaces.get() {
            return Ok(resolved.clone());
        }
        let resolved = match &self.kind {
            ClassKind::File { interface_names, .. } => {
                let loader = self.defining_loader(rt);
                interface_names
                    .iter()
                    .map(|name| loader.load_class(rt, name))
                    .collect::<Result<Vec<_>>>()?
            }
            ClassKind::Host { interfaces, .. } => interfaces.clone(),
            ClassKind::Primitive(_) | ClassKind::Array { .. } => Vec::new(),
        };
        Ok(self.interfaces.get_or_init(|| resolved).clone())
    }

    /// Loads and links the superclass and interfaces, then builds the
    /// ancestry set and the dispatch tables. Runs no guest code.
    pub fn link(&self, rt: &Runtime) -> Result<()> {
        if self.is_linked() {
            return Ok(());
        }
        if self.linking.replace(true) {
            return Err(VmError::fatal(format!("class circularity involving {}", self.name)));
        }
        let linked = self.link_parents(rt);
        self.linking.set(false);
        let (super_class, interfaces) = linked?;

        let mut ancestry = HashSet::new();
        ancestry.insert(self.id);
        for parent in super_class.iter().chain(interfaces.iter()) {
            if let Some(set) = parent.ancestry.get() {
                ancestry.extend(set.iter().copied());
            }
        }
        self.build_dispatch_tables(super_class.as_deref(), &interfaces);
        let _ = self.ancestry.set(ancestry);
        debug!(class = %self.name, "linked");
        Ok(())
    }

    fn link_parents(&self, rt: &Runtime) -> Result<(Option<Rc<Class>>, Vec<Rc<Class>>)> {
        let super_class = self.resolve_super(rt)?;
        if let Some(super_class) = &super_class {
            super_class.link(rt)?;
        }
        let interfaces = self.resolve_interfaces(rt)?;
        for interface in &interfaces {
            interface.link(rt)?;
        }
        Ok((super_class, interfaces))
    }

    /// Initializes the class on first call. Later calls, including re-entrant
    /// ones from inside the static initializer, return immediately. On
    /// failure the class goes back to uninitialized.
    pub fn try_init(&self, rt: &Runtime) -> Result<()> {
        if self.init_state.get() != InitState::Uninitialized {
            return Ok(());
        }
        self.init_state.set(InitState::InProgress);
        debug!(class = %self.name, "initializing");
        match self.run_init(rt) {
            Ok(()) => {
                self.init_state.set(InitState::Initialized);
                debug!(class = %self.name, "initialized");
                Ok(())
            }
            Err(err) => {
                self.init_state.set(InitState::Uninitialized);
                debug!(class = %self.name, error = %err, "initialization failed");
                Err(err)
            }
        }
    }

    fn run_init(&self, rt: &Runtime) -> Result<()> {
        self.link(rt)?;
        if let Some(super_class) = self.super_class() {
            super_class.try_init(rt)?;
        }
        for interface in self.interfaces.get().into_iter().flatten() {
            interface.try_init(rt)?;
        }

        let mut statics = Vec::new();
        for field in self.fields.values().filter(|f| f.is_static()) {
            let value = match &field.constant {
                Some(ConstantValue::Index(index)) => self.constant_value(rt, *index)?,
                Some(ConstantValue::Value(value)) => value.clone(),
                None => Value::zero_for(&field.ty),
            };
            statics.push((field.key(), value));
        }
        self.statics.borrow_mut().extend(statics);

        if let Some(clinit) = self.method(CLASS_INITIALIZER, "()V") {
            rt.invoke(clinit, Vec::new())?;
        }
        Ok(())
    }

    /// Same as [`Class::try_init`].
    pub fn init(&self, rt: &Runtime) -> Result<()> {
        self.try_init(rt)
    }

    fn constant_value(&self, rt: &Runtime, index: u16) -> Result<Value> {
        let pool = self
            .constant_pool()
            .ok_or_else(|| VmError::fatal(format!("{} has no constant pool", self.name)))?;
        Ok(match pool.get(index)? {
            Constant::Integer(v) => Value::Int(*v),
            Constant::Float(v) => Value::Float(*v),
            Constant::Long(v) => Value::Long(*v),
            Constant::Double(v) => Value::Double(*v),
            Constant::String { .. } => Value::object(pool.resolve_string(rt, index)?),
            other => {
                return Err(FormatError::ConstantMismatch {
                    index,
                    expected: "ConstantValue",
                    found: other.kind_name(),
                }
                .into())
            }
        })
    }

    fn build_dispatch_tables(&self, super_class: Option<&Class>, interfaces: &[Rc<Class>]) {
        let mut vtable = super_class
            .and_then(|s| s.vtable.get().cloned())
            .unwrap_or_default();
        let mut constructors = HashMap::new();
        for method in self.methods.values() {
            if method.is_static() {
                continue;
            }
            if method.is_constructor() {
                constructors.insert(method.param_descriptor(), method.clone());
            } else if !method.is_private() {
                vtable.insert(method.key(), method.clone());
            }
        }
        // Default methods fill gaps, concrete ones before abstract ones.
        for want_abstract in [false, true] {
            for interface in interfaces {
                let Some(table) = interface.vtable.get() else { continue };
                for (key, method) in table {
                    if method.is_abstract() == want_abstract && !vtable.contains_key(key) {
                        vtable.insert(key.clone(), method.clone());
                    }
                }
            }
        }
        let _ = self.vtable.set(vtable);
        let _ = self.constructors.set(constructors);
    }

    /// Dispatch target for `key` (`name` + descriptor) on instances of this
    /// class.
    pub fn find_virtual(&self, key: &str) -> Option<Rc<Method>> {
        self.vtable.get().and_then(|table| table.get(key).cloned())
    }

    pub fn constructor(&self, param_descriptor: &str) -> Option<Rc<Method>> {
        self.constructors
            .get()
            .and_then(|table| table.get(param_descriptor).cloned())
    }

    /// True when `other` is this class or one of its ancestors.
    pub fn has_ancestor(&self, other: &Class) -> bool {
        match self.ancestry.get() {
            Some(set) => set.contains(&other.id),
            None => self.id == other.id,
        }
    }

    /// `instanceof` semantics: `null` is never an instance.
    pub fn instance_of(&self, object: Option<&ObjectRef>) -> bool {
        object.map_or(false, |object| object.class().has_ancestor(self))
    }

    /// Whether values of `other` can be stored where this class is expected.
    pub fn is_assignable_from(&self, rt: &Runtime, other: &Class) -> Result<bool> {
        other.link(rt)?;
        Ok(other.has_ancestor(self))
    }

    /// `checkcast` semantics: `null` always passes.
    pub fn check_cast(&self, rt: &Runtime, object: Option<&ObjectRef>) -> Result<()> {
        match object {
            Some(object) if !object.class().has_ancestor(self) => Err(rt.raise(
                RuntimeErrorKind::ClassCast,
                format!(
                    "class {} cannot be cast to class {}",
                    object.class().java_name(),
                    self.java_name()
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Field resolution: own fields, then superclasses skipping private
    /// members, then superinterfaces.
    pub fn resolve_field(self: &Rc<Self>, rt: &Runtime, name: &str, descriptor: &str) -> Result<Rc<Field>> {
        if let Some(field) = self.field(name, descriptor) {
            return Ok(field.clone());
        }
        let mut current = self.resolve_super(rt)?;
        while let Some(class) = current {
            if let Some(field) = class.field(name, descriptor) {
                if !field.is_private() {
                    return Ok(field.clone());
                }
            }
            current = class.resolve_super(rt)?;
        }
        for interface in self.all_interfaces(rt)? {
            if let Some(field) = interface.field(name, descriptor) {
                return Ok(field.clone());
            }
        }
        Err(VmError::NoSuchField {
            class: self.name.clone(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    /// Method resolution: own methods, then superclasses skipping private
    /// members (and static ones for interface references), then
    /// superinterfaces.
    pub fn resolve_method(
        self: &Rc<Self>,
        rt: &Runtime,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<Rc<Method>> {
        if let Some(method) = self.method(name, descriptor) {
            return Ok(method.clone());
        }
        let mut current = self.resolve_super(rt)?;
        while let Some(class) = current {
            if let Some(method) = class.method(name, descriptor) {
                if !method.is_private() && !(interface && method.is_static()) {
                    return Ok(method.clone());
                }
            }
            current = class.resolve_super(rt)?;
        }
        for candidate in self.all_interfaces(rt)? {
            if let Some(method) = candidate.method(name, descriptor) {
                if !method.is_private() && !method.is_static() {
                    return Ok(method.clone());
                }
            }
        }
        Err(VmError::NoSuchMethod {
            class: self.name.clone(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    /// Every interface implemented by this class or its superclasses,
    /// breadth first, without duplicates.
    fn all_interfaces(self: &Rc<Self>, rt: &Runtime) -> Result<Vec<Rc<Class>>> {
        let mut seen = HashSet::new();
        let mut queue = Vec::new();
        let mut current = Some(self.clone());
        while let Some(class) = current {
            queue.extend(class.resolve_interfaces(rt)?);
            current = class.resolve_super(rt)?;
        }
        let mut out = Vec::new();
        let mut next = 0;
        while next < queue.len() {
            let interface = queue[next].clone();
            next += 1;
            if seen.insert(interface.id) {
                queue.extend(interface.resolve_interfaces(rt)?);
                out.push(interface);
            }
        }
        Ok(out)
    }

    /// The array class whose elements are instances of this class, created
    /// on first request and cached.
    pub fn array_class(self: &Rc<Self>) -> Rc<Class> {
        self.array_class.get_or_init(|| Class::array(self)).clone()
    }

    /// Allocates an instance with every instance field, including inherited
    /// and shadowed ones, set to its zero value. No constructor runs.
    pub fn new_instance(self: &Rc<Self>, rt: &Runtime) -> Result<ObjectRef> {
        if self.is_array() || self.is_primitive() {
            return Err(VmError::fatal(format!("cannot instantiate {} with new", self.name)));
        }
        self.try_init(rt)?;
        let mut slots = HashMap::new();
        let mut current = Some(self.clone());
        while let Some(class) = current {
            for field in class.fields.values().filter(|f| !f.is_static()) {
                slots.insert(field.slot_key(), Value::zero_for(&field.ty));
            }
            current = class.resolve_super(rt)?;
        }
        Ok(Object::with_fields(self.clone(), slots))
    }

    /// Allocates an array of this array class. Extra lengths allocate
    /// nested arrays, `[2, 3]` on `[[I` gives two `int[3]`.
    pub fn new_array(self: &Rc<Self>, rt: &Runtime, lengths: &[i32]) -> Result<ObjectRef> {
        let element = self
            .element_class()
            .ok_or_else(|| VmError::fatal(format!("{} is not an array class", self.name)))?
            .clone();
        let Some((&length, rest)) = lengths.split_first() else {
            return Err(VmError::fatal("array allocation without a length"));
        };
        if let Some(negative) = lengths.iter().find(|&&len| len < 0) {
            return Err(rt.raise(RuntimeErrorKind::NegativeArraySize, negative.to_string()));
        }
        self.try_init(rt)?;
        let mut storage = ArrayStorage::new(&element.descriptor(), length as usize);
        if !rest.is_empty() {
            if let ArrayStorage::Reference(slots) = &mut storage {
                for slot in slots.iter_mut() {
                    *slot = Some(element.new_array(rt, rest)?);
                }
            }
        }
        Ok(Object::with_storage(self.clone(), storage))
    }

    /// Runs the constructor with the given parameter descriptor on an
    /// already allocated `object`. `args` excludes the receiver.
    pub fn invoke_constructor(
        self: &Rc<Self>,
        rt: &Runtime,
        object: &ObjectRef,
        param_descriptor: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        self.try_init(rt)?;
        let constructor = self.constructor(param_descriptor).ok_or_else(|| VmError::NoSuchMethod {
            class: self.name.clone(),
            name: CONSTRUCTOR.to_string(),
            descriptor: format!("({param_descriptor})V"),
        })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::object(object.clone()));
        full.extend(args);
        rt.invoke(&constructor, full)?;
        Ok(())
    }

    /// Current value of a static field without triggering initialization.
    pub fn static_value(&self, name: &str, descriptor: &str) -> Option<Value> {
        self.statics.borrow().get(&format!("{name}:{descriptor}")).cloned()
    }

    pub(crate) fn mirror_cell(&self) -> &OnceCell<ObjectRef> {
        &self.mirror
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("init_state", &self.init_state.get())
            .finish()
    }
}

/// Builds classes that have no byte representation, with host closures as
/// method bodies.
pub struct HostClassBuilder {
    name: String,
    access_flags: u16,
    super_class: Option<Rc<Class>>,
    interfaces: Vec<Rc<Class>>,
    source_file: Option<String>,
    fields: Vec<(u16, String, String, Option<Value>)>,
    methods: Vec<(u16, String, String, MethodBody)>,
}

impl HostClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access_flags: flags::PUBLIC | flags::SUPER,
            super_class: None,
            interfaces: Vec::new(),
            source_file: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn access_flags(mut self, access_flags: u16) -> Self {
        self.access_flags = access_flags;
        self
    }

    pub fn super_class(mut self, super_class: Rc<Class>) -> Self {
        self.super_class = Some(super_class);
        self
    }

    pub fn interface(mut self, interface: Rc<Class>) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }

    pub fn field(mut self, access_flags: u16, name: &str, descriptor: &str) -> Self {
        self.fields.push((access_flags, name.to_string(), descriptor.to_string(), None));
        self
    }

    /// Static field with an initial value applied during initialization.
    pub fn static_field(mut self, name: &str, descriptor: &str, value: Value) -> Self {
        self.fields.push((
            flags::PUBLIC | flags::STATIC,
            name.to_string(),
            descriptor.to_string(),
            Some(value),
        ));
        self
    }

    pub fn method(mut self, access_flags: u16, name: &str, descriptor: &str, body: NativeMethod) -> Self {
        self.methods.push((
            access_flags,
            name.to_string(),
            descriptor.to_string(),
            MethodBody::Host(body),
        ));
        self
    }

    /// Method resolved through the native registry when called.
    pub fn native_method(mut self, access_flags: u16, name: &str, descriptor: &str) -> Self {
        self.methods.push((
            access_flags | flags::NATIVE,
            name.to_string(),
            descriptor.to_string(),
            MethodBody::Native,
        ));
        self
    }

    pub fn abstract_method(mut self, access_flags: u16, name: &str, descriptor: &str) -> Self {
        self.methods.push((
            access_flags | flags::ABSTRACT,
            name.to_string(),
            descriptor.to_string(),
            MethodBody::Abstract,
        ));
        self
    }

    /// Builds the class for `loader`. Register it with
    /// [`ClassLoader::define_class`].
    pub fn build(self, loader: &Rc<ClassLoader>) -> std::result::Result<Rc<Class>, FormatError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        for (access_flags, name, descriptor, value) in self.fields {
            fields.push(FieldProto {
                access_flags,
                ty: field_type(&self.name, &descriptor)?,
                name,
                descriptor,
                constant: value.map(ConstantValue::Value),
            });
        }
        let mut methods = Vec::with_capacity(self.methods.len());
        for (access_flags, name, descriptor, body) in self.methods {
            methods.push(MethodProto {
                access_flags,
                ty: method_type(&self.name, &descriptor)?,
                name,
                descriptor,
                body,
                exceptions: Vec::new(),
            });
        }
        Class::assemble(
            self.name,
            self.access_flags,
            Rc::downgrade(loader),
            ClassKind::Host {
                super_class: self.super_class,
                interfaces: self.interfaces,
            },
            self.source_file,
            fields,
            methods,
        )
    }
}
