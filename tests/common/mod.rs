//! Class-file assembler for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use byteorder::{BigEndian, WriteBytesExt};

use drip::bootstrap;
use drip::bytecode::OPCode;
use drip::class::flags;
use drip::{MemoryClassSource, Runtime, RuntimeConfig};

pub const OBJECT: &str = "java/lang/Object";

fn modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

/// Bytecode with forward and backward labels.
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    // (operand offset, instruction start, label, four byte operand)
    fixups: Vec<(usize, usize, &'static str, bool)>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: OPCode) -> &mut Self {
        self.code.push(op.into());
        self
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.code.push(value as u8);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.code.write_u16::<BigEndian>(value).unwrap();
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.code.write_i32::<BigEndian>(value).unwrap();
        self
    }

    pub fn label(&mut self, name: &'static str) -> &mut Self {
        self.labels.insert(name, self.code.len());
        self
    }

    /// Branch instruction with a two byte offset to `label`.
    pub fn jump(&mut self, op: OPCode, label: &'static str) -> &mut Self {
        let start = self.code.len();
        self.op(op);
        self.fixups.push((self.code.len(), start, label, false));
        self.u16(0)
    }

    /// Four byte offset to `label` relative to the instruction at `start`,
    /// for switch tables.
    pub fn offset32(&mut self, start: usize, label: &'static str) -> &mut Self {
        self.fixups.push((self.code.len(), start, label, true));
        self.i32(0)
    }

    /// Zero padding up to the next four byte boundary.
    pub fn align(&mut self) -> &mut Self {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut code = self.code.clone();
        for &(at, start, label, wide) in &self.fixups {
            let target = *self.labels.get(label).unwrap_or_else(|| panic!("unknown label {label}"));
            let offset = target as i64 - start as i64;
            if wide {
                code[at..at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                code[at..at + 2].copy_from_slice(&(offset as i16).to_be_bytes());
            }
        }
        code
    }
}

/// `Code` attribute contents.
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    // (start, end, handler, catch type index)
    pub handlers: Vec<(u16, u16, u16, u16)>,
    // (start pc, line)
    pub lines: Vec<(u16, u16)>,
}

impl Code {
    pub fn new(max_stack: u16, max_locals: u16, bytes: Vec<u8>) -> Self {
        Self {
            max_stack,
            max_locals,
            bytes,
            handlers: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn handler(mut self, start: u16, end: u16, handler: u16, catch_type: u16) -> Self {
        self.handlers.push((start, end, handler, catch_type));
        self
    }

    pub fn line(mut self, start_pc: u16, line: u16) -> Self {
        self.lines.push((start_pc, line));
        self
    }
}

pub struct ClassBuilder {
    name: String,
    pool: Vec<u8>,
    pool_slots: u16,
    interned: HashMap<String, u16>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
    attributes: Vec<Vec<u8>>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            name: name.to_string(),
            pool: Vec::new(),
            pool_slots: 1,
            interned: HashMap::new(),
            access_flags: flags::PUBLIC | flags::SUPER,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        };
        builder.this_class = builder.class(name);
        if let Some(super_name) = super_name {
            builder.super_class = builder.class(super_name);
        }
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry(&mut self, key: String, slots: u16, encode: impl FnOnce(&mut Vec<u8>)) -> u16 {
        if let Some(&index) = self.interned.get(&key) {
            return index;
        }
        let index = self.pool_slots;
        encode(&mut self.pool);
        self.pool_slots += slots;
        self.interned.insert(key, index);
        index
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        let bytes = modified_utf8(text);
        self.entry(format!("utf8:{text}"), 1, |pool| {
            pool.push(1);
            pool.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
            pool.extend_from_slice(&bytes);
        })
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        self.entry(format!("class:{name}"), 1, |pool| {
            pool.push(7);
            pool.write_u16::<BigEndian>(name_index).unwrap();
        })
    }

    pub fn string(&mut self, text: &str) -> u16 {
        let string_index = self.utf8(text);
        self.entry(format!("string:{text}"), 1, |pool| {
            pool.push(8);
            pool.write_u16::<BigEndian>(string_index).unwrap();
        })
    }

    pub fn integer(&mut self, value: i32) -> u16 {
        self.entry(format!("int:{value}"), 1, |pool| {
            pool.push(3);
            pool.write_i32::<BigEndian>(value).unwrap();
        })
    }

    pub fn float(&mut self, value: f32) -> u16 {
        self.entry(format!("float:{}", value.to_bits()), 1, |pool| {
            pool.push(4);
            pool.write_f32::<BigEndian>(value).unwrap();
        })
    }

    pub fn long(&mut self, value: i64) -> u16 {
        self.entry(format!("long:{value}"), 2, |pool| {
            pool.push(5);
            pool.write_i64::<BigEndian>(value).unwrap();
        })
    }

    pub fn double(&mut self, value: f64) -> u16 {
        self.entry(format!("double:{}", value.to_bits()), 2, |pool| {
            pool.push(6);
            pool.write_f64::<BigEndian>(value).unwrap();
        })
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.entry(format!("nat:{name}:{descriptor}"), 1, |pool| {
            pool.push(12);
            pool.write_u16::<BigEndian>(name_index).unwrap();
            pool.write_u16::<BigEndian>(descriptor_index).unwrap();
        })
    }

    fn member(&mut self, tag: u8, class: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(class);
        let nat_index = self.name_and_type(name, descriptor);
        self.entry(format!("member{tag}:{class}.{name}:{descriptor}"), 1, |pool| {
            pool.push(tag);
            pool.write_u16::<BigEndian>(class_index).unwrap();
            pool.write_u16::<BigEndian>(nat_index).unwrap();
        })
    }

    pub fn field_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member(9, class, name, descriptor)
    }

    pub fn method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member(10, class, name, descriptor)
    }

    pub fn interface_method_ref(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.member(11, class, name, descriptor)
    }

    pub fn access_flags(&mut self, access_flags: u16) -> &mut Self {
        self.access_flags = access_flags;
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        let index = self.class(name);
        self.interfaces.push(index);
        self
    }

    fn attribute(&mut self, name: &str, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(self.utf8(name)).unwrap();
        out.write_u32::<BigEndian>(body.len() as u32).unwrap();
        out.extend_from_slice(body);
        out
    }

    fn member_info(&mut self, access_flags: u16, name: &str, descriptor: &str, attributes: Vec<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u16::<BigEndian>(access_flags).unwrap();
        out.write_u16::<BigEndian>(self.utf8(name)).unwrap();
        out.write_u16::<BigEndian>(self.utf8(descriptor)).unwrap();
        out.write_u16::<BigEndian>(attributes.len() as u16).unwrap();
        for attribute in attributes {
            out.extend_from_slice(&attribute);
        }
        out
    }

    pub fn field(&mut self, access_flags: u16, name: &str, descriptor: &str) -> &mut Self {
        let info = self.member_info(access_flags, name, descriptor, Vec::new());
        self.fields.push(info);
        self
    }

    /// Field with a `ConstantValue` attribute pointing at `constant`.
    pub fn constant_field(&mut self, access_flags: u16, name: &str, descriptor: &str, constant: u16) -> &mut Self {
        let attribute = self.attribute("ConstantValue", &constant.to_be_bytes());
        let info = self.member_info(access_flags, name, descriptor, vec![attribute]);
        self.fields.push(info);
        self
    }

    pub fn method(&mut self, access_flags: u16, name: &str, descriptor: &str, code: Code) -> &mut Self {
        let mut body = Vec::new();
        body.write_u16::<BigEndian>(code.max_stack).unwrap();
        body.write_u16::<BigEndian>(code.max_locals).unwrap();
        body.write_u32::<BigEndian>(code.bytes.len() as u32).unwrap();
        body.extend_from_slice(&code.bytes);
        body.write_u16::<BigEndian>(code.handlers.len() as u16).unwrap();
        for (start, end, handler, catch_type) in &code.handlers {
            for value in [start, end, handler, catch_type] {
                body.write_u16::<BigEndian>(*value).unwrap();
            }
        }
        if code.lines.is_empty() {
            body.write_u16::<BigEndian>(0).unwrap();
        } else {
            let mut table = Vec::new();
            table.write_u16::<BigEndian>(code.lines.len() as u16).unwrap();
            for (start_pc, line) in &code.lines {
                table.write_u16::<BigEndian>(*start_pc).unwrap();
                table.write_u16::<BigEndian>(*line).unwrap();
            }
            let attribute = self.attribute("LineNumberTable", &table);
            body.write_u16::<BigEndian>(1).unwrap();
            body.extend_from_slice(&attribute);
        }
        let attribute = self.attribute("Code", &body);
        let info = self.member_info(access_flags, name, descriptor, vec![attribute]);
        self.methods.push(info);
        self
    }

    /// Method without a `Code` attribute, native or abstract by its flags.
    pub fn bodiless_method(&mut self, access_flags: u16, name: &str, descriptor: &str) -> &mut Self {
        let info = self.member_info(access_flags, name, descriptor, Vec::new());
        self.methods.push(info);
        self
    }

    /// `<init>()V` calling the superclass's no-argument constructor.
    pub fn default_constructor(&mut self, super_name: &str) -> &mut Self {
        let super_init = self.method_ref(super_name, "<init>", "()V");
        let mut asm = Asm::new();
        asm.op(OPCode::Aload0)
            .op(OPCode::Invokespecial)
            .u16(super_init)
            .op(OPCode::Return);
        self.method(flags::PUBLIC, "<init>", "()V", Code::new(1, 1, asm.finish()))
    }

    pub fn source_file(&mut self, file: &str) -> &mut Self {
        let index = self.utf8(file);
        let attribute = self.attribute("SourceFile", &index.to_be_bytes());
        self.attributes.push(attribute);
        self
    }

    /// Class attribute with an arbitrary name and payload.
    pub fn raw_attribute(&mut self, name: &str, payload: &[u8]) -> &mut Self {
        let attribute = self.attribute(name, payload);
        self.attributes.push(attribute);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(0xCAFE_BABE).unwrap();
        out.write_u16::<BigEndian>(0).unwrap();
        out.write_u16::<BigEndian>(52).unwrap();
        out.write_u16::<BigEndian>(self.pool_slots).unwrap();
        out.extend_from_slice(&self.pool);
        out.write_u16::<BigEndian>(self.access_flags).unwrap();
        out.write_u16::<BigEndian>(self.this_class).unwrap();
        out.write_u16::<BigEndian>(self.super_class).unwrap();
        out.write_u16::<BigEndian>(self.interfaces.len() as u16).unwrap();
        for index in &self.interfaces {
            out.write_u16::<BigEndian>(*index).unwrap();
        }
        for members in [&self.fields, &self.methods, &self.attributes] {
            out.write_u16::<BigEndian>(members.len() as u16).unwrap();
            for member in members {
                out.extend_from_slice(member);
            }
        }
        out
    }
}

/// `java/lang/Object` with an empty constructor, as class bytes.
pub fn object_class() -> Vec<u8> {
    let mut class = ClassBuilder::new(OBJECT, None);
    let mut asm = Asm::new();
    asm.op(OPCode::Return);
    class.method(flags::PUBLIC, "<init>", "()V", Code::new(0, 1, asm.finish()));
    class.build()
}

/// Subclass of `super_name` with only a default constructor.
pub fn subclass(name: &str, super_name: &str) -> ClassBuilder {
    let mut class = ClassBuilder::new(name, Some(super_name));
    class.default_constructor(super_name);
    class
}

/// Runtime over the given classes plus `java/lang/Object` from bytes, with
/// the core natives and the fallback library in place.
pub fn runtime_with(config: RuntimeConfig, classes: Vec<ClassBuilder>) -> Runtime {
    let source = MemoryClassSource::new().with(OBJECT, object_class());
    for class in classes {
        source.insert(class.name().to_string(), class.build());
    }
    let rt = Runtime::new(config, Some(Box::new(source)));
    bootstrap::register_core_natives(&rt);
    bootstrap::define_fallback_core(&rt).unwrap();
    rt
}

/// Runs `f` on a host thread with room for `config`'s call depth.
pub fn on_guest_stack<T: Send>(config: &RuntimeConfig, f: impl FnOnce() -> T + Send) -> T {
    drip::run_on_guest_stack(config, f).unwrap()
}

pub fn runtime(classes: Vec<ClassBuilder>) -> Runtime {
    runtime_with(RuntimeConfig::default(), classes)
}

pub fn guest_exceptions() -> RuntimeConfig {
    RuntimeConfig {
        guest_exceptions: true,
        ..RuntimeConfig::default()
    }
}
