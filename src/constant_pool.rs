//! Constant pool decoding and symbolic reference resolution.
//!
//! The pool is 1-indexed. Long and double constants take two slots and the
//! second one is [`Constant::Unusable`], so indices written by a compiler
//! stay valid without any remapping.
use std::cell::OnceCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::class::{Class, Field, Method};
use crate::error::{FormatError, Result};
use crate::jvm::ClassReader;
use crate::loader::ClassLoader;
use crate::object::ObjectRef;
use crate::runtime::Runtime;

/// Constant pool tags.
pub mod tag {
    pub const UTF8: u8 = 1;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const CLASS: u8 = 7;
    pub const STRING: u8 = 8;
    pub const FIELD_REF: u8 = 9;
    pub const METHOD_REF: u8 = 10;
    pub const INTERFACE_METHOD_REF: u8 = 11;
    pub const NAME_AND_TYPE: u8 = 12;
    pub const METHOD_HANDLE: u8 = 15;
    pub const METHOD_TYPE: u8 = 16;
    pub const DYNAMIC: u8 = 17;
    pub const INVOKE_DYNAMIC: u8 = 18;
}

/// Symbolic reference to a field or method plus its resolution cache.
pub struct MemberRef<T> {
    pub class_index: u16,
    pub name_and_type_index: u16,
    resolved: OnceCell<Rc<T>>,
}

impl<T> MemberRef<T> {
    fn new(class_index: u16, name_and_type_index: u16) -> Self {
        Self {
            class_index,
            name_and_type_index,
            resolved: OnceCell::new(),
        }
    }
}

impl<T> fmt::Debug for MemberRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemberRef")
            .field("class_index", &self.class_index)
            .field("name_and_type_index", &self.name_and_type_index)
            .field("resolved", &self.resolved.get().is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum Constant {
    /// Slot 0 and the slot after a long or double.
    Unusable,
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class {
        name_index: u16,
        resolved: OnceCell<Rc<Class>>,
    },
    String {
        string_index: u16,
        resolved: OnceCell<ObjectRef>,
    },
    FieldRef(MemberRef<Field>),
    MethodRef(MemberRef<Method>),
    InterfaceMethodRef(MemberRef<Method>),
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
}

impl Constant {
    /// Tag byte this entry was decoded from, `0` for unusable slots.
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Unusable => 0,
            Constant::Utf8(_) => tag::UTF8,
            Constant::Integer(_) => tag::INTEGER,
            Constant::Float(_) => tag::FLOAT,
            Constant::Long(_) => tag::LONG,
            Constant::Double(_) => tag::DOUBLE,
            Constant::Class { .. } => tag::CLASS,
            Constant::String { .. } => tag::STRING,
            Constant::FieldRef(_) => tag::FIELD_REF,
            Constant::MethodRef(_) => tag::METHOD_REF,
            Constant::InterfaceMethodRef(_) => tag::INTERFACE_METHOD_REF,
            Constant::NameAndType { .. } => tag::NAME_AND_TYPE,
            Constant::MethodHandle { .. } => tag::METHOD_HANDLE,
            Constant::MethodType { .. } => tag::METHOD_TYPE,
            Constant::Dynamic { .. } => tag::DYNAMIC,
            Constant::InvokeDynamic { .. } => tag::INVOKE_DYNAMIC,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Unusable => "Unusable",
            Constant::Utf8(_) => "Utf8",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::Class { .. } => "Class",
            Constant::String { .. } => "String",
            Constant::FieldRef(_) => "Fieldref",
            Constant::MethodRef(_) => "Methodref",
            Constant::InterfaceMethodRef(_) => "InterfaceMethodref",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType { .. } => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
        }
    }

    fn read(reader: &mut ClassReader, index: u16) -> std::result::Result<Self, FormatError> {
        let tag = reader.u8()?;
        Ok(match tag {
            tag::UTF8 => {
                let len = reader.u16()?;
                Constant::Utf8(decode_modified_utf8(&reader.bytes(len as usize)?))
            }
            tag::INTEGER => Constant::Integer(reader.i32()?),
            tag::FLOAT => Constant::Float(reader.f32()?),
            tag::LONG => Constant::Long(reader.i64()?),
            tag::DOUBLE => Constant::Double(reader.f64()?),
            tag::CLASS => Constant::Class {
                name_index: reader.u16()?,
                resolved: OnceCell::new(),
            },
            tag::STRING => Constant::String {
                string_index: reader.u16()?,
                resolved: OnceCell::new(),
            },
            tag::FIELD_REF => Constant::FieldRef(MemberRef::new(reader.u16()?, reader.u16()?)),
            tag::METHOD_REF => Constant::MethodRef(MemberRef::new(reader.u16()?, reader.u16()?)),
            tag::INTERFACE_METHOD_REF => {
                Constant::InterfaceMethodRef(MemberRef::new(reader.u16()?, reader.u16()?))
            }
            tag::NAME_AND_TYPE => Constant::NameAndType {
                name_index: reader.u16()?,
                descriptor_index: reader.u16()?,
            },
            tag::METHOD_HANDLE => Constant::MethodHandle {
                reference_kind: reader.u8()?,
                reference_index: reader.u16()?,
            },
            tag::METHOD_TYPE => Constant::MethodType {
                descriptor_index: reader.u16()?,
            },
            tag::DYNAMIC => Constant::Dynamic {
                bootstrap_method_attr_index: reader.u16()?,
                name_and_type_index: reader.u16()?,
            },
            tag::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                bootstrap_method_attr_index: reader.u16()?,
                name_and_type_index: reader.u16()?,
            },
            tag => return Err(FormatError::UnknownConstantTag { tag, index }),
        })
    }
}

/// Per-class constant pool.
pub struct ConstantPool {
    entries: Vec<Constant>,
    // Bound once the owning class is defined.
    loader: OnceCell<Weak<ClassLoader>>,
}

impl ConstantPool {
    /// Reads `count - 1` entries starting at `offset`, the byte right after
    /// the pool size. Returns the pool and the offset just past it.
    pub fn read(bytes: &[u8], offset: usize, count: u16) -> std::result::Result<(Self, usize), FormatError> {
        let mut reader = ClassReader::at(bytes, offset);
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        let mut index = 1u16;
        while index < count {
            let constant = Constant::read(&mut reader, index)?;
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            entries.push(constant);
            index += 1;
            if wide {
                entries.push(Constant::Unusable);
                index += 1;
            }
        }
        Ok((
            Self {
                entries,
                loader: OnceCell::new(),
            },
            reader.offset(),
        ))
    }

    /// Number of slots including slot 0, i.e. the `count` field.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub(crate) fn bind_loader(&self, loader: Weak<ClassLoader>) {
        let _ = self.loader.set(loader);
    }

    /// Usable entry at `index`.
    pub fn get(&self, index: u16) -> std::result::Result<&Constant, FormatError> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(FormatError::BadConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> std::result::Result<&str, FormatError> {
        match self.get(index)? {
            Constant::Utf8(text) => Ok(text),
            other => Err(mismatch(index, "Utf8", other)),
        }
    }

    /// Name of the class referenced by the `Class` entry at `index`.
    pub fn class_name(&self, index: u16) -> std::result::Result<&str, FormatError> {
        match self.get(index)? {
            Constant::Class { name_index, .. } => self.utf8(*name_index),
            other => Err(mismatch(index, "Class", other)),
        }
    }

    pub fn name_and_type(&self, index: u16) -> std::result::Result<(&str, &str), FormatError> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            other => Err(mismatch(index, "NameAndType", other)),
        }
    }

    /// `(class, name, descriptor)` of a field or method reference.
    pub fn member_ref(&self, index: u16) -> std::result::Result<(&str, &str, &str), FormatError> {
        let (class_index, nat_index) = match self.get(index)? {
            Constant::FieldRef(r) => (r.class_index, r.name_and_type_index),
            Constant::MethodRef(r) | Constant::InterfaceMethodRef(r) => (r.class_index, r.name_and_type_index),
            other => return Err(mismatch(index, "member reference", other)),
        };
        let (name, descriptor) = self.name_and_type(nat_index)?;
        Ok((self.class_name(class_index)?, name, descriptor))
    }

    pub fn integer(&self, index: u16) -> std::result::Result<i32, FormatError> {
        match self.get(index)? {
            Constant::Integer(v) => Ok(*v),
            other => Err(mismatch(index, "Integer", other)),
        }
    }

    pub fn float(&self, index: u16) -> std::result::Result<f32, FormatError> {
        match self.get(index)? {
            Constant::Float(v) => Ok(*v),
            other => Err(mismatch(index, "Float", other)),
        }
    }

    pub fn long(&self, index: u16) -> std::result::Result<i64, FormatError> {
        match self.get(index)? {
            Constant::Long(v) => Ok(*v),
            other => Err(mismatch(index, "Long", other)),
        }
    }

    pub fn double(&self, index: u16) -> std::result::Result<f64, FormatError> {
        match self.get(index)? {
            Constant::Double(v) => Ok(*v),
            other => Err(mismatch(index, "Double", other)),
        }
    }

    /// Text of the `String` entry at `index`.
    pub fn string(&self, index: u16) -> std::result::Result<&str, FormatError> {
        match self.get(index)? {
            Constant::String { string_index, .. } => self.utf8(*string_index),
            other => Err(mismatch(index, "String", other)),
        }
    }

    fn loader(&self, rt: &Runtime) -> Rc<ClassLoader> {
        self.loader
            .get()
            .and_then(Weak::upgrade)
            .unwrap_or_else(|| rt.loader().clone())
    }

    /// Loads the class named by the `Class` entry at `index`.
    pub fn resolve_class(&self, rt: &Runtime, index: u16) -> Result<Rc<Class>> {
        match self.get(index)? {
            Constant::Class {
                name_index,
                resolved,
            } => {
                if let Some(class) = resolved.get() {
                    return Ok(class.clone());
                }
                let name = self.utf8(*name_index)?;
                let class = self.loader(rt).load_class(rt, name)?;
                Ok(resolved.get_or_init(|| class).clone())
            }
            other => Err(mismatch(index, "Class", other).into()),
        }
    }

    /// Resolves a `Fieldref` through the referenced class and its ancestors.
    pub fn resolve_field(&self, rt: &Runtime, index: u16) -> Result<Rc<Field>> {
        match self.get(index)? {
            Constant::FieldRef(member) => {
                if let Some(field) = member.resolved.get() {
                    return Ok(field.clone());
                }
                let class = self.resolve_class(rt, member.class_index)?;
                let (name, descriptor) = self.name_and_type(member.name_and_type_index)?;
                let field = class.resolve_field(rt, name, descriptor)?;
                debug!(class = class.name(), name, descriptor, "resolved field");
                Ok(member.resolved.get_or_init(|| field).clone())
            }
            other => Err(mismatch(index, "Fieldref", other).into()),
        }
    }

    /// Resolves a `Methodref` or `InterfaceMethodref`.
    pub fn resolve_method(&self, rt: &Runtime, index: u16) -> Result<Rc<Method>> {
        let (member, interface) = match self.get(index)? {
            Constant::MethodRef(member) => (member, false),
            Constant::InterfaceMethodRef(member) => (member, true),
            other => return Err(mismatch(index, "Methodref", other).into()),
        };
        if let Some(method) = member.resolved.get() {
            return Ok(method.clone());
        }
        let class = self.resolve_class(rt, member.class_index)?;
        let (name, descriptor) = self.name_and_type(member.name_and_type_index)?;
        let method = class.resolve_method(rt, name, descriptor, interface)?;
        debug!(class = class.name(), name, descriptor, "resolved method");
        Ok(member.resolved.get_or_init(|| method).clone())
    }

    /// Interned guest string for the `String` entry at `index`.
    pub fn resolve_string(&self, rt: &Runtime, index: u16) -> Result<ObjectRef> {
        match self.get(index)? {
            Constant::String {
                string_index,
                resolved,
            } => {
                if let Some(object) = resolved.get() {
                    return Ok(object.clone());
                }
                let object = rt.intern(self.utf8(*string_index)?)?;
                Ok(resolved.get_or_init(|| object).clone())
            }
            other => Err(mismatch(index, "String", other).into()),
        }
    }
}

impl fmt::Debug for ConstantPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

fn mismatch(index: u16, expected: &'static str, found: &Constant) -> FormatError {
    FormatError::ConstantMismatch {
        index,
        expected,
        found: found.kind_name(),
    }
}

/// Decodes the class file flavour of UTF-8: NUL is two bytes and
/// supplementary characters are surrogate pairs encoded separately.
pub fn decode_modified_utf8(bytes: &[u8]) -> String {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i] as u16;
        if b & 0x80 == 0 {
            units.push(b);
            i += 1;
        } else if b & 0xE0 == 0xC0 && i + 1 < bytes.len() {
            units.push(((b & 0x1F) << 6) | (bytes[i + 1] as u16 & 0x3F));
            i += 2;
        } else if b & 0xF0 == 0xE0 && i + 2 < bytes.len() {
            units.push(((b & 0x0F) << 12) | ((bytes[i + 1] as u16 & 0x3F) << 6) | (bytes[i + 2] as u16 & 0x3F));
            i += 3;
        } else {
            units.push(0xFFFD);
            i += 1;
        }
    }
    String::from_utf16_lossy(&units)
}
