//! Lightweight implementation of a parser and decoder for JVM bytecode
//! class files.
//!
//! Decoding is purely structural: names stay as constant pool indices and
//! nothing is loaded or linked here. [`crate::class::Class`] turns a
//! [`JVMClassFile`] into a runtime class.
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use tracing::warn;

use crate::constant_pool::ConstantPool;
use crate::error::FormatError;

/// Class file magic number.
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Reads a class file from disk.
pub fn read_class_file(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}

/// Big-endian cursor over class bytes. Every short read is reported as
/// [`FormatError::UnexpectedEof`] at the offset where it started.
pub struct ClassReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ClassReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::at(bytes, 0)
    }

    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(offset as u64);
        Self { cursor }
    }

    pub fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.offset())
    }

    fn eof(&self) -> FormatError {
        FormatError::UnexpectedEof {
            offset: self.offset(),
        }
    }

    pub fn u8(&mut self) -> Result<u8, FormatError> {
        let offset = self.offset();
        self.cursor.read_u8().map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn u16(&mut self) -> Result<u16, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn u32(&mut self) -> Result<u32, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn i32(&mut self) -> Result<i32, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn i64(&mut self) -> Result<i64, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_i64::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn f32(&mut self) -> Result<f32, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_f32::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn f64(&mut self) -> Result<f64, FormatError> {
        let offset = self.offset();
        self.cursor
            .read_f64::<BigEndian>()
            .map_err(|_| FormatError::UnexpectedEof { offset })
    }

    pub fn bytes(&mut self, len: usize) -> Result<Vec<u8>, FormatError> {
        if self.remaining() < len {
            return Err(self.eof());
        }
        let mut buf = vec![0; len];
        self.cursor.read_exact(&mut buf).map_err(|_| self.eof())?;
        Ok(buf)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), FormatError> {
        if self.remaining() < len {
            return Err(self.eof());
        }
        self.cursor.set_position((self.offset() + len) as u64);
        Ok(())
    }
}

/// One row of a method's exception table. `start_pc..end_pc` is half open
/// and `catch_type == 0` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

impl ExceptionTableEntry {
    pub fn covers(&self, pc: usize) -> bool {
        (self.start_pc as usize) <= pc && pc < (self.end_pc as usize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

/// Body of a method with bytecode.
#[derive(Debug, Clone, Default)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    // Sorted by start_pc.
    pub line_numbers: Vec<LineNumberEntry>,
}

impl CodeAttribute {
    /// Source line of the instruction at `pc`, if the class carries line
    /// numbers.
    pub fn line_at(&self, pc: usize) -> Option<u16> {
        let next = self
            .line_numbers
            .partition_point(|entry| entry.start_pc as usize <= pc);
        next.checked_sub(1)
            .map(|index| self.line_numbers[index].line_number)
    }
}

/// Attributes the decoder understands. Everything else is skipped by its
/// declared length.
#[derive(Debug, Clone)]
pub enum AttributeInfo {
    ConstantValueAttribute { constant_value_index: u16 },
    CodeAttribute(CodeAttribute),
    ExceptionsAttribute { exception_index_table: Vec<u16> },
    SourceFileAttribute { sourcefile_index: u16 },
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl FieldInfo {
    pub fn constant_value_index(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attr| match attr {
            AttributeInfo::ConstantValueAttribute {
                constant_value_index,
            } => Some(*constant_value_index),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<AttributeInfo>,
}

impl MethodInfo {
    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|attr| match attr {
            AttributeInfo::CodeAttribute(code) => Some(code),
            _ => None,
        })
    }

    pub fn exception_indices(&self) -> &[u16] {
        self.attributes
            .iter()
            .find_map(|attr| match attr {
                AttributeInfo::ExceptionsAttribute {
                    exception_index_table,
                } => Some(exception_index_table.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }
}

/// Decoded class file.
#[derive(Debug)]
pub struct JVMClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    // Zero only for the root class.
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<AttributeInfo>,
}

impl JVMClassFile {
    pub fn name(&self) -> Result<&str, FormatError> {
        self.constant_pool.class_name(self.this_class)
    }

    pub fn super_name(&self) -> Result<Option<&str>, FormatError> {
        match self.super_class {
            0 => Ok(None),
            index => self.constant_pool.class_name(index).map(Some),
        }
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, FormatError> {
        self.interfaces
            .iter()
            .map(|&index| self.constant_pool.class_name(index))
            .collect()
    }

    pub fn source_file(&self) -> Result<Option<&str>, FormatError> {
        for attr in &self.attributes {
            if let AttributeInfo::SourceFileAttribute { sourcefile_index } = attr {
                return self.constant_pool.utf8(*sourcefile_index).map(Some);
            }
        }
        Ok(None)
    }
}

/// Where an attribute appears decides which names are recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttributeScope {
    Class,
    Field,
    Method,
}

/// Class file decoder.
pub struct JVMParser;

impl JVMParser {
    /// Decodes a whole class file. The input must contain exactly one class.
    pub fn parse(bytes: &[u8]) -> Result<JVMClassFile, FormatError> {
        let mut reader = ClassReader::new(bytes);
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let minor_version = reader.u16()?;
        let major_version = reader.u16()?;
        let count = reader.u16()?;
        let (constant_pool, end) = ConstantPool::read(bytes, reader.offset(), count)?;
        let mut reader = ClassReader::at(bytes, end);

        let access_flags = reader.u16()?;
        let this_class = reader.u16()?;
        let super_class = reader.u16()?;
        let interface_count = reader.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| reader.u16())
            .collect::<Result<Vec<_>, _>>()?;

        let field_count = reader.u16()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let access_flags = reader.u16()?;
            let name_index = reader.u16()?;
            let descriptor_index = reader.u16()?;
            let attributes = Self::parse_attributes(&mut reader, &constant_pool, AttributeScope::Field)?;
            fields.push(FieldInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let method_count = reader.u16()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            let access_flags = reader.u16()?;
            let name_index = reader.u16()?;
            let descriptor_index = reader.u16()?;
            let attributes = Self::parse_attributes(&mut reader, &constant_pool, AttributeScope::Method)?;
            methods.push(MethodInfo {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }

        let attributes = Self::parse_attributes(&mut reader, &constant_pool, AttributeScope::Class)?;
        if reader.remaining() != 0 {
            return Err(FormatError::TrailingBytes(reader.remaining()));
        }

        Ok(JVMClassFile {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn parse_attributes(
        reader: &mut ClassReader,
        pool: &ConstantPool,
        scope: AttributeScope,
    ) -> Result<Vec<AttributeInfo>, FormatError> {
        let count = reader.u16()?;
        let mut attributes = Vec::new();
        for _ in 0..count {
            let name_index = reader.u16()?;
            let declared = reader.u32()?;
            let name = pool.utf8(name_index)?;
            let start = reader.offset();
            let attribute = match (scope, name) {
                (AttributeScope::Field, "ConstantValue") => Some(AttributeInfo::ConstantValueAttribute {
                    constant_value_index: reader.u16()?,
                }),
                (AttributeScope::Method, "Code") => {
                    Some(AttributeInfo::CodeAttribute(Self::parse_code(reader, pool)?))
                }
                (AttributeScope::Method, "Exceptions") => {
                    let len = reader.u16()?;
                    let exception_index_table = (0..len).map(|_| reader.u16()).collect::<Result<Vec<_>, _>>()?;
                    Some(AttributeInfo::ExceptionsAttribute {
                        exception_index_table,
                    })
                }
                (AttributeScope::Class, "SourceFile") => Some(AttributeInfo::SourceFileAttribute {
                    sourcefile_index: reader.u16()?,
                }),
                _ => {
                    warn!(attribute = name, "skipping unrecognized attribute");
                    reader.skip(declared as usize)?;
                    None
                }
            };
            let used = (reader.offset() - start) as u32;
            if used != declared {
                return Err(FormatError::AttributeLength {
                    name: name.to_string(),
                    declared,
                    used,
                });
            }
            if let Some(attribute) = attribute {
                attributes.push(attribute);
            }
        }
        Ok(attributes)
    }

    fn parse_code(reader: &mut ClassReader, pool: &ConstantPool) -> Result<CodeAttribute, FormatError> {
        let max_stack = reader.u16()?;
        let max_locals = reader.u16()?;
        let code_length = reader.u32()?;
        let code = reader.bytes(code_length as usize)?;
        let table_length = reader.u16()?;
        let mut exception_table = Vec::with_capacity(table_length as usize);
        for _ in 0..table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: reader.u16()?,
                end_pc: reader.u16()?,
                handler_pc: reader.u16()?,
                catch_type: reader.u16()?,
            });
        }

        let mut line_numbers = Vec::new();
        let count = reader.u16()?;
        for _ in 0..count {
            let name_index = reader.u16()?;
            let declared = reader.u32()?;
            let name = pool.utf8(name_index)?;
            let start = reader.offset();
            match name {
                "LineNumberTable" => {
                    let len = reader.u16()?;
                    for _ in 0..len {
                        line_numbers.push(LineNumberEntry {
                            start_pc: reader.u16()?,
                            line_number: reader.u16()?,
                        });
                    }
                }
                "StackMapTable" => reader.skip(declared as usize)?,
                _ => {
                    warn!(attribute = name, "skipping unrecognized code attribute");
                    reader.skip(declared as usize)?;
                }
            }
            let used = (reader.offset() - start) as u32;
            if used != declared {
                return Err(FormatError::AttributeLength {
                    name: name.to_string(),
                    declared,
                    used,
                });
            }
        }
        line_numbers.sort_by_key(|entry| entry.start_pc);

        Ok(CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            line_numbers,
        })
    }
}
