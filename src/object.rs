//! Guest values and heap objects.
use std::cell::{Cell, OnceCell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::class::Class;
use crate::descriptor::{PrimitiveType, TypeDescriptor};
use crate::error::{Result, VmError};

/// Shared handle to a heap object. Lifetime follows the host's reference
/// counting, there is no collector.
pub type ObjectRef = Rc<Object>;

/// A single operand stack or local variable slot.
///
/// Long and double values are followed by a [`Value::Top`] filler slot
/// wherever they are stored in slots.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(Option<ObjectRef>),
    /// Pushed by `jsr`, consumed by `ret`.
    ReturnAddress(usize),
    Top,
}

impl Value {
    pub const NULL: Value = Value::Reference(None);

    pub fn object(object: ObjectRef) -> Self {
        Value::Reference(Some(object))
    }

    /// Default value of a field or array element of the given type.
    pub fn zero_for(ty: &TypeDescriptor) -> Self {
        match ty {
            TypeDescriptor::Primitive(p) => Self::zero_for_primitive(*p),
            _ => Value::NULL,
        }
    }

    pub fn zero_for_primitive(primitive: PrimitiveType) -> Self {
        match primitive {
            PrimitiveType::Long => Value::Long(0),
            PrimitiveType::Float => Value::Float(0.0),
            PrimitiveType::Double => Value::Double(0.0),
            PrimitiveType::Void => Value::Top,
            _ => Value::Int(0),
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Value::Long(_) | Value::Double(_))
    }

    pub fn as_int(&self) -> Result<i32> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(mismatch("int", other)),
        }
    }

    pub fn as_long(&self) -> Result<i64> {
        match self {
            Value::Long(v) => Ok(*v),
            other => Err(mismatch("long", other)),
        }
    }

    pub fn as_float(&self) -> Result<f32> {
        match self {
            Value::Float(v) => Ok(*v),
            other => Err(mismatch("float", other)),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Double(v) => Ok(*v),
            other => Err(mismatch("double", other)),
        }
    }

    pub fn as_reference(&self) -> Result<Option<ObjectRef>> {
        match self {
            Value::Reference(v) => Ok(v.clone()),
            other => Err(mismatch("reference", other)),
        }
    }

    pub fn as_return_address(&self) -> Result<usize> {
        match self {
            Value::ReturnAddress(v) => Ok(*v),
            other => Err(mismatch("returnAddress", other)),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Reference(_) => "reference",
            Value::ReturnAddress(_) => "returnAddress",
            Value::Top => "top",
        }
    }
}

/// Bitwise equality for primitives, identity for references.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Reference(a), Value::Reference(b)) => same_object(a.as_ref(), b.as_ref()),
            (Value::ReturnAddress(a), Value::ReturnAddress(b)) => a == b,
            (Value::Top, Value::Top) => true,
            _ => false,
        }
    }
}

fn mismatch(expected: &str, found: &Value) -> VmError {
    VmError::fatal(format!("expected {expected} value, found {}", found.kind_name()))
}

/// Reference identity, `null == null`.
pub fn same_object(a: Option<&ObjectRef>, b: Option<&ObjectRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Typed backing storage of an array. Booleans share the byte storage.
#[derive(Debug, Clone)]
pub enum ArrayStorage {
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Reference(Vec<Option<ObjectRef>>),
}

impl ArrayStorage {
    /// Zero-filled storage for elements of `element`.
    pub fn new(element: &TypeDescriptor, len: usize) -> Self {
        match element {
            TypeDescriptor::Primitive(p) => match p {
                PrimitiveType::Boolean | PrimitiveType::Byte => ArrayStorage::Byte(vec![0; len]),
                PrimitiveType::Char => ArrayStorage::Char(vec![0; len]),
                PrimitiveType::Short => ArrayStorage::Short(vec![0; len]),
                PrimitiveType::Int => ArrayStorage::Int(vec![0; len]),
                PrimitiveType::Long => ArrayStorage::Long(vec![0; len]),
                PrimitiveType::Float => ArrayStorage::Float(vec![0.0; len]),
                PrimitiveType::Double => ArrayStorage::Double(vec![0.0; len]),
                PrimitiveType::Void => ArrayStorage::Reference(vec![None; len]),
            },
            _ => ArrayStorage::Reference(vec![None; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayStorage::Byte(v) => v.len(),
            ArrayStorage::Char(v) => v.len(),
            ArrayStorage::Short(v) => v.len(),
            ArrayStorage::Int(v) => v.len(),
            ArrayStorage::Long(v) => v.len(),
            ArrayStorage::Float(v) => v.len(),
            ArrayStorage::Double(v) => v.len(),
            ArrayStorage::Reference(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index` widened to its slot value. The index must already
    /// be bounds checked.
    pub fn load(&self, index: usize) -> Value {
        match self {
            ArrayStorage::Byte(v) => Value::Int(v[index] as i32),
            ArrayStorage::Char(v) => Value::Int(v[index] as i32),
            ArrayStorage::Short(v) => Value::Int(v[index] as i32),
            ArrayStorage::Int(v) => Value::Int(v[index]),
            ArrayStorage::Long(v) => Value::Long(v[index]),
            ArrayStorage::Float(v) => Value::Float(v[index]),
            ArrayStorage::Double(v) => Value::Double(v[index]),
            ArrayStorage::Reference(v) => Value::Reference(v[index].clone()),
        }
    }

    /// Stores `value` at a bounds-checked `index`, narrowing ints to the
    /// element width. A value of the wrong category is fatal.
    pub fn store(&mut self, index: usize, value: Value) -> Result<()> {
        match (self, value) {
            (ArrayStorage::Byte(v), Value::Int(x)) => v[index] = x as i8,
            (ArrayStorage::Char(v), Value::Int(x)) => v[index] = x as u16,
            (ArrayStorage::Short(v), Value::Int(x)) => v[index] = x as i16,
            (ArrayStorage::Int(v), Value::Int(x)) => v[index] = x,
            (ArrayStorage::Long(v), Value::Long(x)) => v[index] = x,
            (ArrayStorage::Float(v), Value::Float(x)) => v[index] = x,
            (ArrayStorage::Double(v), Value::Double(x)) => v[index] = x,
            (ArrayStorage::Reference(v), Value::Reference(x)) => v[index] = x,
            (storage, value) => {
                return Err(VmError::fatal(format!(
                    "cannot store {} into {} array",
                    value.kind_name(),
                    storage.kind_name()
                )))
            }
        }
        Ok(())
    }

    fn kind_name(&self) -> &'static str {
        match self {
            ArrayStorage::Byte(_) => "byte",
            ArrayStorage::Char(_) => "char",
            ArrayStorage::Short(_) => "short",
            ArrayStorage::Int(_) => "int",
            ArrayStorage::Long(_) => "long",
            ArrayStorage::Float(_) => "float",
            ArrayStorage::Double(_) => "double",
            ArrayStorage::Reference(_) => "reference",
        }
    }

    /// Copies `len` elements between two storages of the same kind.
    /// `src` and `self` may not be the same storage; use
    /// [`ArrayStorage::copy_within`] for that.
    pub fn copy_from(&mut self, dest_pos: usize, src: &ArrayStorage, src_pos: usize, len: usize) -> Result<()> {
        let (d, s) = (dest_pos..dest_pos + len, src_pos..src_pos + len);
        match (self, src) {
            (ArrayStorage::Byte(a), ArrayStorage::Byte(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Char(a), ArrayStorage::Char(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Short(a), ArrayStorage::Short(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Int(a), ArrayStorage::Int(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Long(a), ArrayStorage::Long(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Float(a), ArrayStorage::Float(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Double(a), ArrayStorage::Double(b)) => a[d].copy_from_slice(&b[s]),
            (ArrayStorage::Reference(a), ArrayStorage::Reference(b)) => a[d].clone_from_slice(&b[s]),
            (a, b) => {
                return Err(VmError::fatal(format!(
                    "cannot copy {} array into {} array",
                    b.kind_name(),
                    a.kind_name()
                )))
            }
        }
        Ok(())
    }

    /// Overlap-safe copy inside one storage.
    pub fn copy_within(&mut self, src_pos: usize, dest_pos: usize, len: usize) {
        let s = src_pos..src_pos + len;
        match self {
            ArrayStorage::Byte(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Char(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Short(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Int(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Long(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Float(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Double(v) => v.copy_within(s, dest_pos),
            ArrayStorage::Reference(v) => {
                let copied: Vec<_> = v[s].to_vec();
                v[dest_pos..dest_pos + len].clone_from_slice(&copied);
            }
        }
    }
}

enum ObjectBody {
    /// Instance slots keyed `declaringClass:fieldName`.
    Fields(RefCell<HashMap<String, Value>>),
    Array(RefCell<ArrayStorage>),
}

/// An instance of a class or an array.
pub struct Object {
    class: Rc<Class>,
    body: ObjectBody,
    hash: Cell<Option<i32>>,
    /// Set on `java/lang/Class` instances standing for a runtime class.
    mirrored: OnceCell<Weak<Class>>,
}

static NEXT_HASH: AtomicU32 = AtomicU32::new(1);

impl Object {
    pub fn with_fields(class: Rc<Class>, fields: HashMap<String, Value>) -> ObjectRef {
        Rc::new(Object {
            class,
            body: ObjectBody::Fields(RefCell::new(fields)),
            hash: Cell::new(None),
            mirrored: OnceCell::new(),
        })
    }

    pub fn with_storage(class: Rc<Class>, storage: ArrayStorage) -> ObjectRef {
        Rc::new(Object {
            class,
            body: ObjectBody::Array(RefCell::new(storage)),
            hash: Cell::new(None),
            mirrored: OnceCell::new(),
        })
    }

    pub fn class(&self) -> &Rc<Class> {
        &self.class
    }

    pub fn is_array(&self) -> bool {
        matches!(self.body, ObjectBody::Array(_))
    }

    /// Identity hash, assigned on first request and stable afterwards.
    pub fn identity_hash(&self) -> i32 {
        if let Some(hash) = self.hash.get() {
            return hash;
        }
        let seed = NEXT_HASH.fetch_add(1, Ordering::Relaxed);
        let hash = (seed.wrapping_mul(0x9E37_79B9) >> 1) as i32;
        self.hash.set(Some(hash));
        hash
    }

    pub fn get_field(&self, key: &str) -> Result<Value> {
        match &self.body {
            ObjectBody::Fields(fields) => fields
                .borrow()
                .get(key)
                .cloned()
                .ok_or_else(|| VmError::fatal(format!("{} has no slot {key}", self.class.name()))),
            ObjectBody::Array(_) => Err(VmError::fatal(format!("array has no field {key}"))),
        }
    }

    pub fn put_field(&self, key: &str, value: Value) -> Result<()> {
        match &self.body {
            ObjectBody::Fields(fields) => {
                let mut fields = fields.borrow_mut();
                match fields.get_mut(key) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(VmError::fatal(format!("{} has no slot {key}", self.class.name()))),
                }
            }
            ObjectBody::Array(_) => Err(VmError::fatal(format!("array has no field {key}"))),
        }
    }

    pub fn array(&self) -> Result<Ref<'_, ArrayStorage>> {
        match &self.body {
            ObjectBody::Array(storage) => Ok(storage.borrow()),
            ObjectBody::Fields(_) => Err(self.not_an_array()),
        }
    }

    pub fn array_mut(&self) -> Result<RefMut<'_, ArrayStorage>> {
        match &self.body {
            ObjectBody::Array(storage) => Ok(storage.borrow_mut()),
            ObjectBody::Fields(_) => Err(self.not_an_array()),
        }
    }

    pub fn array_length(&self) -> Result<usize> {
        Ok(self.array()?.len())
    }

    fn not_an_array(&self) -> VmError {
        VmError::fatal(format!("{} is not an array", self.class.name()))
    }

    /// Shallow copy with a fresh identity.
    pub fn shallow_clone(&self) -> ObjectRef {
        match &self.body {
            ObjectBody::Fields(fields) => Object::with_fields(self.class.clone(), fields.borrow().clone()),
            ObjectBody::Array(storage) => Object::with_storage(self.class.clone(), storage.borrow().clone()),
        }
    }

    /// Runtime class this `java/lang/Class` instance stands for.
    pub fn mirrored_class(&self) -> Option<Rc<Class>> {
        self.mirrored.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_mirrored_class(&self, class: &Rc<Class>) {
        let _ = self.mirrored.set(Rc::downgrade(class));
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:08x}", self.class.name(), self.identity_hash())
    }
}
