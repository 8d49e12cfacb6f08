//! Interpreter for JVM bytecode.
//!
//! One [`Interpreter`] runs one invocation of a method with a `Code`
//! attribute. Calls out of the method go back through [`Runtime::invoke`],
//! so nested invocations nest on the host stack.
use std::cmp::Ordering;
use std::rc::Rc;

use tracing::trace;

use crate::bytecode::{array_type, OPCode};
use crate::class::{Class, Method};
use crate::constant_pool::{Constant, ConstantPool};
use crate::descriptor::PrimitiveType;
use crate::error::{FormatError, Result, RuntimeErrorKind, VmError};
use crate::jvm::{ClassReader, CodeAttribute};
use crate::object::{same_object, ObjectRef, Value};
use crate::runtime::Runtime;
use crate::thread::Thread;
use crate::trace::Throwable;

/// What the loop does after an instruction.
enum Flow {
    Continue,
    Return(Option<Value>),
}

/// Slot categories checked by typed loads and stores.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Slot {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl Slot {
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Slot::Int, Value::Int(_))
                | (Slot::Long, Value::Long(_))
                | (Slot::Float, Value::Float(_))
                | (Slot::Double, Value::Double(_))
                | (Slot::Reference, Value::Reference(_))
        )
    }
}

fn pool(class: &Class) -> Result<&ConstantPool> {
    class
        .constant_pool()
        .ok_or_else(|| VmError::fatal(format!("{} has no constant pool", class.name())))
}

/// Distance of `opcode` from the first opcode of its group, e.g. `iload_2`
/// from `iload_0`.
fn offset_from(opcode: OPCode, base: OPCode) -> usize {
    usize::from(u8::from(opcode) - u8::from(base))
}

/// `fcmpl`/`fcmpg` and the double forms. `nan` is the result for unordered
/// operands.
fn compare_floats(a: f64, b: f64, nan: i32) -> i32 {
    match a.partial_cmp(&b) {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None => nan,
    }
}

/// Element type of a `newarray` type code.
fn newarray_element(atype: u8) -> Option<PrimitiveType> {
    Some(match atype {
        array_type::T_BOOLEAN => PrimitiveType::Boolean,
        array_type::T_CHAR => PrimitiveType::Char,
        array_type::T_FLOAT => PrimitiveType::Float,
        array_type::T_DOUBLE => PrimitiveType::Double,
        array_type::T_BYTE => PrimitiveType::Byte,
        array_type::T_SHORT => PrimitiveType::Short,
        array_type::T_INT => PrimitiveType::Int,
        array_type::T_LONG => PrimitiveType::Long,
        _ => return None,
    })
}

/// `Interpreter` for a stack based virtual machine for JVM bytecode.
pub struct Interpreter<'rt> {
    rt: &'rt Runtime,
    thread: Rc<Thread>,
    class: Rc<Class>,
    method: Rc<Method>,
    code: Rc<CodeAttribute>,
    // Operand stack, wide values are followed by `Value::Top`.
    stack: Vec<Value>,
    locals: Vec<Value>,
    pc: usize,
    // Offset of the instruction being executed.
    start: usize,
    // Last throwable handed to a handler in this frame, rethrown with its
    // original trace.
    caught: Option<Throwable>,
}

impl<'rt> Interpreter<'rt> {
    /// Sets up a frame. `args` holds one value per parameter with the
    /// receiver first for instance methods.
    pub fn new(
        rt: &'rt Runtime,
        thread: Rc<Thread>,
        class: Rc<Class>,
        method: Rc<Method>,
        code: Rc<CodeAttribute>,
        args: Vec<Value>,
    ) -> Result<Self> {
        let max_locals = code.max_locals as usize;
        let mut locals = Vec::with_capacity(max_locals);
        for arg in args {
            let wide = arg.is_wide();
            locals.push(arg);
            if wide {
                locals.push(Value::Top);
            }
        }
        let expected = method.ty().parameter_slots() + usize::from(!method.is_static());
        if locals.len() != expected {
            return Err(VmError::fatal(format!(
                "{:?} takes {expected} argument slots, got {}",
                method,
                locals.len()
            )));
        }
        if locals.len() > max_locals {
            return Err(VmError::fatal(format!(
                "{:?} declares {max_locals} locals for {} argument slots",
                method,
                locals.len()
            )));
        }
        locals.resize(max_locals, Value::Top);
        Ok(Self {
            rt,
            thread,
            class,
            method,
            stack: Vec::with_capacity(code.max_stack as usize),
            code,
            locals,
            pc: 0,
            start: 0,
            caught: None,
        })
    }

    /// Runs the method to completion. Errors not handled by the method's
    /// exception table are returned to the caller.
    pub fn run(mut self) -> Result<Option<Value>> {
        loop {
            self.start = self.pc;
            if let Some(line) = self.code.line_at(self.start) {
                self.thread.set_line(i32::from(line));
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) => match self.rt.translate(err) {
                    VmError::Throw(throwable) => match self.find_handler(&throwable)? {
                        Some(handler) => {
                            trace!(
                                method = self.method.name(),
                                handler,
                                exception = throwable.class_name(),
                                "caught"
                            );
                            self.stack.clear();
                            self.stack.push(Value::object(throwable.object.clone()));
                            self.pc = handler;
                            self.caught = Some(throwable);
                        }
                        None => return Err(VmError::Throw(throwable)),
                    },
                    other => return Err(other),
                },
            }
        }
    }

    /// First exception table entry covering the faulting instruction whose
    /// catch type is an ancestor of the thrown object's class.
    fn find_handler(&self, throwable: &Throwable) -> Result<Option<usize>> {
        for entry in &self.code.exception_table {
            if !entry.covers(self.start) {
                continue;
            }
            if entry.catch_type == 0 {
                return Ok(Some(entry.handler_pc as usize));
            }
            let catch_type = pool(&self.class)?.resolve_class(self.rt, entry.catch_type)?;
            if throwable.object.class().has_ancestor(&catch_type) {
                return Ok(Some(entry.handler_pc as usize));
            }
        }
        Ok(None)
    }

    fn operand<T>(&mut self, read: impl FnOnce(&mut ClassReader) -> std::result::Result<T, FormatError>) -> Result<T> {
        let mut reader = ClassReader::at(&self.code.code, self.pc);
        let value = read(&mut reader)?;
        self.pc = reader.offset();
        Ok(value)
    }

    fn u8(&mut self) -> Result<u8> {
        self.operand(|r| r.u8())
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        self.operand(|r| r.u16())
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32> {
        self.operand(|r| r.i32())
    }

    fn i32_at(&self, offset: usize) -> Result<i32> {
        Ok(ClassReader::at(&self.code.code, offset).i32()?)
    }

    fn push_slot(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.code.max_stack as usize {
            return Err(VmError::fatal(format!("operand stack overflow in {:?}", self.method)));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop_slot(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::fatal(format!("operand stack underflow in {:?}", self.method)))
    }

    fn push(&mut self, value: Value) -> Result<()> {
        let wide = value.is_wide();
        self.push_slot(value)?;
        if wide {
            self.push_slot(Value::Top)?;
        }
        Ok(())
    }

    /// Pops one value, both slots of a wide one.
    fn pop(&mut self) -> Result<Value> {
        match self.pop_slot()? {
            Value::Top => {
                let value = self.pop_slot()?;
                if value.is_wide() {
                    Ok(value)
                } else {
                    Err(VmError::fatal(format!("filler slot above a narrow value in {:?}", self.method)))
                }
            }
            value => Ok(value),
        }
    }

    fn pop_int(&mut self) -> Result<i32> {
        self.pop()?.as_int()
    }

    fn pop_long(&mut self) -> Result<i64> {
        self.pop()?.as_long()
    }

    fn pop_float(&mut self) -> Result<f32> {
        self.pop()?.as_float()
    }

    fn pop_double(&mut self) -> Result<f64> {
        self.pop()?.as_double()
    }

    fn pop_reference(&mut self) -> Result<Option<ObjectRef>> {
        self.pop()?.as_reference()
    }

    fn non_null(&self, object: Option<ObjectRef>, message: impl FnOnce() -> String) -> Result<ObjectRef> {
        object.ok_or_else(|| self.rt.raise(RuntimeErrorKind::NullPointer, message()))
    }

    fn local(&self, index: usize) -> Result<Value> {
        self.locals
            .get(index)
            .cloned()
            .ok_or_else(|| VmError::fatal(format!("local {index} out of range in {:?}", self.method)))
    }

    fn store_local(&mut self, index: usize, value: Value) -> Result<()> {
        let width = if value.is_wide() { 2 } else { 1 };
        if index + width > self.locals.len() {
            return Err(VmError::fatal(format!("local {index} out of range in {:?}", self.method)));
        }
        self.locals[index] = value;
        if width == 2 {
            self.locals[index + 1] = Value::Top;
        }
        Ok(())
    }

    fn load(&mut self, index: usize, slot: Slot) -> Result<()> {
        let value = self.local(index)?;
        if !slot.accepts(&value) {
            return Err(VmError::fatal(format!("local {index} does not hold {slot:?} in {:?}", self.method)));
        }
        self.push(value)
    }

    fn store(&mut self, index: usize, slot: Slot) -> Result<()> {
        let value = self.pop()?;
        let ok = slot.accepts(&value) || (slot == Slot::Reference && matches!(value, Value::ReturnAddress(_)));
        if !ok {
            return Err(VmError::fatal(format!("cannot store into local {index} as {slot:?} in {:?}", self.method)));
        }
        self.store_local(index, value)
    }

    /// Moves to `start + offset` of the current instruction.
    fn jump(&mut self, offset: i32) -> Result<()> {
        let target = self.start as i64 + i64::from(offset);
        if target < 0 || target as usize >= self.code.code.len() {
            return Err(VmError::fatal(format!(
                "branch from {} to {target} leaves {:?}",
                self.start, self.method
            )));
        }
        self.pc = target as usize;
        Ok(())
    }

    fn branch_if(&mut self, condition: bool) -> Result<()> {
        let offset = self.i16()?;
        if condition {
            self.jump(i32::from(offset))?;
        }
        Ok(())
    }

    fn int_op(&mut self, op: impl FnOnce(i32, i32) -> i32) -> Result<()> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        self.push(Value::Int(op(a, b)))
    }

    fn long_op(&mut self, op: impl FnOnce(i64, i64) -> i64) -> Result<()> {
        let b = self.pop_long()?;
        let a = self.pop_long()?;
        self.push(Value::Long(op(a, b)))
    }

    fn long_shift(&mut self, op: impl FnOnce(i64, u32) -> i64) -> Result<()> {
        let shift = self.pop_int()?;
        let a = self.pop_long()?;
        self.push(Value::Long(op(a, shift as u32)))
    }

    fn float_op(&mut self, op: impl FnOnce(f32, f32) -> f32) -> Result<()> {
        let b = self.pop_float()?;
        let a = self.pop_float()?;
        self.push(Value::Float(op(a, b)))
    }

    fn double_op(&mut self, op: impl FnOnce(f64, f64) -> f64) -> Result<()> {
        let b = self.pop_double()?;
        let a = self.pop_double()?;
        self.push(Value::Double(op(a, b)))
    }

    fn int_division(&mut self, op: impl FnOnce(i32, i32) -> i32) -> Result<()> {
        let b = self.pop_int()?;
        let a = self.pop_int()?;
        if b == 0 {
            return Err(self.rt.raise(RuntimeErrorKind::Arithmetic, "/ by zero"));
        }
        self.push(Value::Int(op(a, b)))
    }

    fn long_division(&mut self, op: impl FnOnce(i64, i64) -> i64) -> Result<()> {
        let b = self.pop_long()?;
        let a = self.pop_long()?;
        if b == 0 {
            return Err(self.rt.raise(RuntimeErrorKind::Arithmetic, "/ by zero"));
        }
        self.push(Value::Long(op(a, b)))
    }

    /// Pops index and array of an array instruction and checks them.
    /// `kinds` are the accepted prefixes of the array's class name.
    fn array_operands(&mut self, kinds: &[&str]) -> Result<(ObjectRef, usize)> {
        let index = self.pop_int()?;
        let array = self.pop_reference()?;
        let array = self.non_null(array, || "Cannot access an element of a null array".to_string())?;
        let name = array.class().name();
        if !kinds.iter().any(|kind| name.starts_with(kind)) {
            return Err(VmError::fatal(format!("{name} used as {} array", kinds.join("/"))));
        }
        let length = array.array_length()?;
        if index < 0 || index as usize >= length {
            return Err(self.rt.raise(
                RuntimeErrorKind::ArrayIndexOutOfBounds,
                format!("Index {index} out of bounds for length {length}"),
            ));
        }
        Ok((array, index as usize))
    }

    fn array_load(&mut self, kinds: &[&str]) -> Result<()> {
        let (array, index) = self.array_operands(kinds)?;
        let value = array.array()?.load(index);
        self.push(value)
    }

    fn array_store(&mut self, kinds: &[&str]) -> Result<()> {
        let value = self.pop()?;
        let (array, index) = self.array_operands(kinds)?;
        let mut storage = array.array_mut()?;
        storage.store(index, value)
    }

    fn ldc(&mut self, index: u16) -> Result<()> {
        let class = self.class.clone();
        let pool = pool(&class)?;
        let value = match pool.get(index)? {
            Constant::Integer(v) => Value::Int(*v),
            Constant::Float(v) => Value::Float(*v),
            Constant::String { .. } => Value::object(pool.resolve_string(self.rt, index)?),
            Constant::Class { .. } => {
                let class = pool.resolve_class(self.rt, index)?;
                Value::object(self.rt.class_object(&class)?)
            }
            other => {
                return Err(VmError::fatal(format!(
                    "ldc of a {} constant is not supported",
                    other.kind_name()
                )))
            }
        };
        self.push(value)
    }

    fn ldc2(&mut self, index: u16) -> Result<()> {
        let class = self.class.clone();
        let value = match pool(&class)?.get(index)? {
            Constant::Long(v) => Value::Long(*v),
            Constant::Double(v) => Value::Double(*v),
            other => {
                return Err(FormatError::ConstantMismatch {
                    index,
                    expected: "Long or Double",
                    found: other.kind_name(),
                }
                .into())
            }
        };
        self.push(value)
    }

    /// Pops the arguments of `method`, receiver first when `receiver` is
    /// set.
    fn pop_args(&mut self, method: &Method, receiver: bool) -> Result<Vec<Value>> {
        let count = method.ty().params().len();
        let mut args = Vec::with_capacity(count + 1);
        for _ in 0..count {
            args.push(self.pop()?);
        }
        if receiver {
            args.push(Value::Reference(self.pop_reference()?));
        }
        args.reverse();
        Ok(args)
    }

    fn invoke(&mut self, opcode: OPCode) -> Result<()> {
        let index = self.u16()?;
        if opcode == OPCode::Invokeinterface {
            // Argument count and a zero byte, both redundant.
            self.u8()?;
            self.u8()?;
        }
        let class = self.class.clone();
        let method = pool(&class)?.resolve_method(self.rt, index)?;
        let is_static = opcode == OPCode::Invokestatic;
        if method.is_static() != is_static {
            return Err(VmError::fatal(format!("{opcode} on {:?}", method)));
        }
        let args = self.pop_args(&method, !is_static)?;

        let target = if is_static {
            method
        } else {
            let receiver = args.first().map(Value::as_reference).transpose()?.flatten();
            let receiver = self.non_null(receiver, || {
                format!("Cannot invoke \"{}.{}{}\" on null", method.class_name(), method.name(), method.descriptor())
            })?;
            if opcode == OPCode::Invokespecial || method.is_private() {
                method
            } else {
                receiver.class().find_virtual(&method.key()).ok_or_else(|| {
                    self.rt.raise(
                        RuntimeErrorKind::AbstractMethod,
                        format!("{}.{}{}", receiver.class().java_name(), method.name(), method.descriptor()),
                    )
                })?
            }
        };

        let result = self.rt.invoke(&target, args)?;
        match (target.returns_void(), result) {
            (true, _) => Ok(()),
            (false, Some(value)) => self.push(value),
            (false, None) => Err(VmError::fatal(format!("{:?} returned no value", target))),
        }
    }

    fn table_switch(&mut self) -> Result<()> {
        self.pc = (self.pc + 3) & !3;
        let default = self.i32()?;
        let low = self.i32()?;
        let high = self.i32()?;
        if high < low {
            return Err(VmError::fatal(format!("tableswitch with low {low} above high {high}")));
        }
        let table = self.pc;
        let key = self.pop_int()?;
        let offset = if key < low || key > high {
            default
        } else {
            self.i32_at(table + 4 * (i64::from(key) - i64::from(low)) as usize)?
        };
        self.jump(offset)
    }

    fn lookup_switch(&mut self) -> Result<()> {
        self.pc = (self.pc + 3) & !3;
        let default = self.i32()?;
        let pairs = self.i32()?;
        if pairs < 0 {
            return Err(VmError::fatal(format!("lookupswitch with {pairs} pairs")));
        }
        let key = self.pop_int()?;
        let mut offset = default;
        for _ in 0..pairs {
            let candidate = self.i32()?;
            let target = self.i32()?;
            if candidate == key {
                offset = target;
                break;
            }
        }
        self.jump(offset)
    }

    fn wide(&mut self) -> Result<()> {
        let byte = self.u8()?;
        let opcode = OPCode::try_from(byte)
            .map_err(|_| VmError::fatal(format!("unknown opcode {byte:#04x} after wide")))?;
        let index = usize::from(self.u16()?);
        match opcode {
            OPCode::Iload => self.load(index, Slot::Int),
            OPCode::Lload => self.load(index, Slot::Long),
            OPCode::Fload => self.load(index, Slot::Float),
            OPCode::Dload => self.load(index, Slot::Double),
            OPCode::Aload => self.load(index, Slot::Reference),
            OPCode::Istore => self.store(index, Slot::Int),
            OPCode::Lstore => self.store(index, Slot::Long),
            OPCode::Fstore => self.store(index, Slot::Float),
            OPCode::Dstore => self.store(index, Slot::Double),
            OPCode::Astore => self.store(index, Slot::Reference),
            OPCode::Ret => {
                self.pc = self.local(index)?.as_return_address()?;
                Ok(())
            }
            OPCode::Iinc => {
                let delta = i32::from(self.i16()?);
                let value = self.local(index)?.as_int()?;
                self.store_local(index, Value::Int(value.wrapping_add(delta)))
            }
            other => Err(VmError::fatal(format!("wide {other} is not a valid instruction"))),
        }
    }

    fn step(&mut self) -> Result<Flow> {
        let byte = self.u8()?;
        let opcode = OPCode::try_from(byte)
            .map_err(|_| VmError::fatal(format!("unknown opcode {byte:#04x} at {}", self.start)))?;
        trace!(pc = self.start, opcode = opcode.mnemonic(), depth = self.stack.len(), "step");

        match opcode {
            OPCode::Nop => {}
            OPCode::AconstNull => self.push(Value::NULL)?,
            OPCode::IconstM1 => self.push(Value::Int(-1))?,
            OPCode::Iconst0 | OPCode::Iconst1 | OPCode::Iconst2 | OPCode::Iconst3 | OPCode::Iconst4 | OPCode::Iconst5 => {
                self.push(Value::Int(offset_from(opcode, OPCode::Iconst0) as i32))?
            }
            OPCode::Lconst0 | OPCode::Lconst1 => self.push(Value::Long(offset_from(opcode, OPCode::Lconst0) as i64))?,
            OPCode::Fconst0 | OPCode::Fconst1 | OPCode::Fconst2 => {
                self.push(Value::Float(offset_from(opcode, OPCode::Fconst0) as f32))?
            }
            OPCode::Dconst0 | OPCode::Dconst1 => {
                self.push(Value::Double(offset_from(opcode, OPCode::Dconst0) as f64))?
            }
            OPCode::Bipush => {
                let value = self.i8()?;
                self.push(Value::Int(i32::from(value)))?
            }
            OPCode::Sipush => {
                let value = self.i16()?;
                self.push(Value::Int(i32::from(value)))?
            }
            OPCode::Ldc => {
                let index = self.u8()?;
                self.ldc(u16::from(index))?
            }
            OPCode::LdcW => {
                let index = self.u16()?;
                self.ldc(index)?
            }
            OPCode::Ldc2W => {
                let index = self.u16()?;
                self.ldc2(index)?
            }

            OPCode::Iload | OPCode::Lload | OPCode::Fload | OPCode::Dload | OPCode::Aload => {
                let index = usize::from(self.u8()?);
                let slot = [Slot::Int, Slot::Long, Slot::Float, Slot::Double, Slot::Reference]
                    [offset_from(opcode, OPCode::Iload)];
                self.load(index, slot)?
            }
            OPCode::Iload0 | OPCode::Iload1 | OPCode::Iload2 | OPCode::Iload3 => {
                self.load(offset_from(opcode, OPCode::Iload0), Slot::Int)?
            }
            OPCode::Lload0 | OPCode::Lload1 | OPCode::Lload2 | OPCode::Lload3 => {
                self.load(offset_from(opcode, OPCode::Lload0), Slot::Long)?
            }
            OPCode::Fload0 | OPCode::Fload1 | OPCode::Fload2 | OPCode::Fload3 => {
                self.load(offset_from(opcode, OPCode::Fload0), Slot::Float)?
            }
            OPCode::Dload0 | OPCode::Dload1 | OPCode::Dload2 | OPCode::Dload3 => {
                self.load(offset_from(opcode, OPCode::Dload0), Slot::Double)?
            }
            OPCode::Aload0 | OPCode::Aload1 | OPCode::Aload2 | OPCode::Aload3 => {
                self.load(offset_from(opcode, OPCode::Aload0), Slot::Reference)?
            }
            OPCode::Iaload => self.array_load(&["[I"])?,
            OPCode::Laload => self.array_load(&["[J"])?,
            OPCode::Faload => self.array_load(&["[F"])?,
            OPCode::Daload => self.array_load(&["[D"])?,
            OPCode::Aaload => self.array_load(&["[L", "[["])?,
            OPCode::Baload => self.array_load(&["[B", "[Z"])?,
            OPCode::Caload => self.array_load(&["[C"])?,
            OPCode::Saload => self.array_load(&["[S"])?,

            OPCode::Istore | OPCode::Lstore | OPCode::Fstore | OPCode::Dstore | OPCode::Astore => {
                let index = usize::from(self.u8()?);
                let slot = [Slot::Int, Slot::Long, Slot::Float, Slot::Double, Slot::Reference]
                    [offset_from(opcode, OPCode::Istore)];
                self.store(index, slot)?
            }
            OPCode::Istore0 | OPCode::Istore1 | OPCode::Istore2 | OPCode::Istore3 => {
                self.store(offset_from(opcode, OPCode::Istore0), Slot::Int)?
            }
            OPCode::Lstore0 | OPCode::Lstore1 | OPCode::Lstore2 | OPCode::Lstore3 => {
                self.store(offset_from(opcode, OPCode::Lstore0), Slot::Long)?
            }
            OPCode::Fstore0 | OPCode::Fstore1 | OPCode::Fstore2 | OPCode::Fstore3 => {
                self.store(offset_from(opcode, OPCode::Fstore0), Slot::Float)?
            }
            OPCode::Dstore0 | OPCode::Dstore1 | OPCode::Dstore2 | OPCode::Dstore3 => {
                self.store(offset_from(opcode, OPCode::Dstore0), Slot::Double)?
            }
            OPCode::Astore0 | OPCode::Astore1 | OPCode::Astore2 | OPCode::Astore3 => {
                self.store(offset_from(opcode, OPCode::Astore0), Slot::Reference)?
            }
            OPCode::Iastore => self.array_store(&["[I"])?,
            OPCode::Lastore => self.array_store(&["[J"])?,
            OPCode::Fastore => self.array_store(&["[F"])?,
            OPCode::Dastore => self.array_store(&["[D"])?,
            // Element assignability is not checked.
            OPCode::Aastore => self.array_store(&["[L", "[["])?,
            OPCode::Bastore => self.array_store(&["[B", "[Z"])?,
            OPCode::Castore => self.array_store(&["[C"])?,
            OPCode::Sastore => self.array_store(&["[S"])?,

            OPCode::Pop => {
                self.pop_slot()?;
            }
            OPCode::Pop2 => {
                self.pop_slot()?;
                self.pop_slot()?;
            }
            OPCode::Dup => {
                let v1 = self.pop_slot()?;
                self.push_slot(v1.clone())?;
                self.push_slot(v1)?;
            }
            OPCode::DupX1 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v1.clone())?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::DupX2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                self.push_slot(v1.clone())?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v2.clone())?;
                self.push_slot(v1.clone())?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2X1 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                self.push_slot(v2.clone())?;
                self.push_slot(v1.clone())?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Dup2X2 => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                let v3 = self.pop_slot()?;
                let v4 = self.pop_slot()?;
                self.push_slot(v2.clone())?;
                self.push_slot(v1.clone())?;
                self.push_slot(v4)?;
                self.push_slot(v3)?;
                self.push_slot(v2)?;
                self.push_slot(v1)?;
            }
            OPCode::Swap => {
                let v1 = self.pop_slot()?;
                let v2 = self.pop_slot()?;
                self.push_slot(v1)?;
                self.push_slot(v2)?;
            }

            OPCode::Iadd => self.int_op(i32::wrapping_add)?,
            OPCode::Ladd => self.long_op(i64::wrapping_add)?,
            OPCode::Fadd => self.float_op(|a, b| a + b)?,
            OPCode::Dadd => self.double_op(|a, b| a + b)?,
            OPCode::Isub => self.int_op(i32::wrapping_sub)?,
            OPCode::Lsub => self.long_op(i64::wrapping_sub)?,
            OPCode::Fsub => self.float_op(|a, b| a - b)?,
            OPCode::Dsub => self.double_op(|a, b| a - b)?,
            OPCode::Imul => self.int_op(i32::wrapping_mul)?,
            OPCode::Lmul => self.long_op(i64::wrapping_mul)?,
            OPCode::Fmul => self.float_op(|a, b| a * b)?,
            OPCode::Dmul => self.double_op(|a, b| a * b)?,
            OPCode::Idiv => self.int_division(i32::wrapping_div)?,
            OPCode::Ldiv => self.long_division(i64::wrapping_div)?,
            OPCode::Fdiv => self.float_op(|a, b| a / b)?,
            OPCode::Ddiv => self.double_op(|a, b| a / b)?,
            OPCode::Irem => self.int_division(i32::wrapping_rem)?,
            OPCode::Lrem => self.long_division(i64::wrapping_rem)?,
            OPCode::Frem => self.float_op(|a, b| a % b)?,
            OPCode::Drem => self.double_op(|a, b| a % b)?,
            OPCode::Ineg => {
                let a = self.pop_int()?;
                self.push(Value::Int(a.wrapping_neg()))?
            }
            OPCode::Lneg => {
                let a = self.pop_long()?;
                self.push(Value::Long(a.wrapping_neg()))?
            }
            OPCode::Fneg => {
                let a = self.pop_float()?;
                self.push(Value::Float(-a))?
            }
            OPCode::Dneg => {
                let a = self.pop_double()?;
                self.push(Value::Double(-a))?
            }
            OPCode::Ishl => self.int_op(|a, b| a.wrapping_shl(b as u32))?,
            OPCode::Lshl => self.long_shift(i64::wrapping_shl)?,
            OPCode::Ishr => self.int_op(|a, b| a.wrapping_shr(b as u32))?,
            OPCode::Lshr => self.long_shift(i64::wrapping_shr)?,
            OPCode::Iushr => self.int_op(|a, b| (a as u32).wrapping_shr(b as u32) as i32)?,
            OPCode::Lushr => self.long_shift(|a, b| (a as u64).wrapping_shr(b) as i64)?,
            OPCode::Iand => self.int_op(|a, b| a & b)?,
            OPCode::Land => self.long_op(|a, b| a & b)?,
            OPCode::Ior => self.int_op(|a, b| a | b)?,
            OPCode::Lor => self.long_op(|a, b| a | b)?,
            OPCode::Ixor => self.int_op(|a, b| a ^ b)?,
            OPCode::Lxor => self.long_op(|a, b| a ^ b)?,
            OPCode::Iinc => {
                let index = usize::from(self.u8()?);
                let delta = i32::from(self.i8()?);
                let value = self.local(index)?.as_int()?;
                self.store_local(index, Value::Int(value.wrapping_add(delta)))?
            }

            // `as` saturates float to integer casts and maps NaN to zero.
            OPCode::I2l => {
                let a = self.pop_int()?;
                self.push(Value::Long(i64::from(a)))?
            }
            OPCode::I2f => {
                let a = self.pop_int()?;
                self.push(Value::Float(a as f32))?
            }
            OPCode::I2d => {
                let a = self.pop_int()?;
                self.push(Value::Double(f64::from(a)))?
            }
            OPCode::L2i => {
                let a = self.pop_long()?;
                self.push(Value::Int(a as i32))?
            }
            OPCode::L2f => {
                let a = self.pop_long()?;
                self.push(Value::Float(a as f32))?
            }
            OPCode::L2d => {
                let a = self.pop_long()?;
                self.push(Value::Double(a as f64))?
            }
            OPCode::F2i => {
                let a = self.pop_float()?;
                self.push(Value::Int(a as i32))?
            }
            OPCode::F2l => {
                let a = self.pop_float()?;
                self.push(Value::Long(a as i64))?
            }
            OPCode::F2d => {
                let a = self.pop_float()?;
                self.push(Value::Double(f64::from(a)))?
            }
            OPCode::D2i => {
                let a = self.pop_double()?;
                self.push(Value::Int(a as i32))?
            }
            OPCode::D2l => {
                let a = self.pop_double()?;
                self.push(Value::Long(a as i64))?
            }
            OPCode::D2f => {
                let a = self.pop_double()?;
                self.push(Value::Float(a as f32))?
            }
            OPCode::I2b => {
                let a = self.pop_int()?;
                self.push(Value::Int(i32::from(a as i8)))?
            }
            OPCode::I2c => {
                let a = self.pop_int()?;
                self.push(Value::Int(i32::from(a as u16)))?
            }
            OPCode::I2s => {
                let a = self.pop_int()?;
                self.push(Value::Int(i32::from(a as i16)))?
            }

            OPCode::Lcmp => {
                let b = self.pop_long()?;
                let a = self.pop_long()?;
                self.push(Value::Int(a.cmp(&b) as i32))?
            }
            OPCode::Fcmpl | OPCode::Fcmpg => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                let nan = if opcode == OPCode::Fcmpl { -1 } else { 1 };
                self.push(Value::Int(compare_floats(f64::from(a), f64::from(b), nan)))?
            }
            OPCode::Dcmpl | OPCode::Dcmpg => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                let nan = if opcode == OPCode::Dcmpl { -1 } else { 1 };
                self.push(Value::Int(compare_floats(a, b, nan)))?
            }
            OPCode::Ifeq => {
                let a = self.pop_int()?;
                self.branch_if(a == 0)?
            }
            OPCode::Ifne => {
                let a = self.pop_int()?;
                self.branch_if(a != 0)?
            }
            OPCode::Iflt => {
                let a = self.pop_int()?;
                self.branch_if(a < 0)?
            }
            OPCode::Ifge => {
                let a = self.pop_int()?;
                self.branch_if(a >= 0)?
            }
            OPCode::Ifgt => {
                let a = self.pop_int()?;
                self.branch_if(a > 0)?
            }
            OPCode::Ifle => {
                let a = self.pop_int()?;
                self.branch_if(a <= 0)?
            }
            OPCode::IfIcmpeq
            | OPCode::IfIcmpne
            | OPCode::IfIcmplt
            | OPCode::IfIcmpge
            | OPCode::IfIcmpgt
            | OPCode::IfIcmple => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let taken = match opcode {
                    OPCode::IfIcmpeq => a == b,
                    OPCode::IfIcmpne => a != b,
                    OPCode::IfIcmplt => a < b,
                    OPCode::IfIcmpge => a >= b,
                    OPCode::IfIcmpgt => a > b,
                    _ => a <= b,
                };
                self.branch_if(taken)?
            }
            OPCode::IfAcmpeq | OPCode::IfAcmpne => {
                let b = self.pop_reference()?;
                let a = self.pop_reference()?;
                let same = same_object(a.as_ref(), b.as_ref());
                self.branch_if(same == (opcode == OPCode::IfAcmpeq))?
            }

            OPCode::Goto => {
                let offset = self.i16()?;
                self.jump(i32::from(offset))?
            }
            OPCode::GotoW => {
                let offset = self.i32()?;
                self.jump(offset)?
            }
            OPCode::Jsr => {
                let offset = self.i16()?;
                self.push(Value::ReturnAddress(self.pc))?;
                self.jump(i32::from(offset))?
            }
            OPCode::JsrW => {
                let offset = self.i32()?;
                self.push(Value::ReturnAddress(self.pc))?;
                self.jump(offset)?
            }
            OPCode::Ret => {
                let index = usize::from(self.u8()?);
                self.pc = self.local(index)?.as_return_address()?;
            }
            OPCode::Tableswitch => self.table_switch()?,
            OPCode::Lookupswitch => self.lookup_switch()?,
            OPCode::Ireturn => return Ok(Flow::Return(Some(Value::Int(self.pop_int()?)))),
            OPCode::Lreturn => return Ok(Flow::Return(Some(Value::Long(self.pop_long()?)))),
            OPCode::Freturn => return Ok(Flow::Return(Some(Value::Float(self.pop_float()?)))),
            OPCode::Dreturn => return Ok(Flow::Return(Some(Value::Double(self.pop_double()?)))),
            OPCode::Areturn => return Ok(Flow::Return(Some(Value::Reference(self.pop_reference()?)))),
            OPCode::Return => return Ok(Flow::Return(None)),

            OPCode::Getstatic | OPCode::Putstatic | OPCode::Getfield | OPCode::Putfield => {
                let index = self.u16()?;
                let class = self.class.clone();
                let field = pool(&class)?.resolve_field(self.rt, index)?;
                let is_static = matches!(opcode, OPCode::Getstatic | OPCode::Putstatic);
                if field.is_static() != is_static {
                    return Err(VmError::fatal(format!("{opcode} on {:?}", field)));
                }
                match opcode {
                    OPCode::Getstatic => {
                        let value = field.get_static(self.rt)?;
                        self.push(value)?
                    }
                    OPCode::Putstatic => {
                        let value = self.pop()?;
                        field.put_static(self.rt, value)?
                    }
                    OPCode::Getfield => {
                        let object = self.pop_reference()?;
                        let object = self.non_null(object, || format!("Cannot read field \"{}\"", field.name()))?;
                        let value = field.get_field(&object)?;
                        self.push(value)?
                    }
                    _ => {
                        let value = self.pop()?;
                        let object = self.pop_reference()?;
                        let object = self.non_null(object, || format!("Cannot assign field \"{}\"", field.name()))?;
                        field.put_field(&object, value)?
                    }
                }
            }
            OPCode::Invokevirtual | OPCode::Invokespecial | OPCode::Invokestatic | OPCode::Invokeinterface => {
                self.invoke(opcode)?
            }
            OPCode::Invokedynamic => {
                return Err(VmError::fatal(format!("invokedynamic in {:?} is not supported", self.method)))
            }

            OPCode::New => {
                let index = self.u16()?;
                let class = self.class.clone();
                let target = pool(&class)?.resolve_class(self.rt, index)?;
                let object = target.new_instance(self.rt)?;
                self.push(Value::object(object))?
            }
            OPCode::Newarray => {
                let atype = self.u8()?;
                let element = newarray_element(atype)
                    .ok_or_else(|| VmError::fatal(format!("newarray with unknown type {atype}")))?;
                let length = self.pop_int()?;
                let array_class = self.rt.primitive_class(element).array_class();
                let array = array_class.new_array(self.rt, &[length])?;
                self.push(Value::object(array))?
            }
            OPCode::Anewarray => {
                let index = self.u16()?;
                let class = self.class.clone();
                let element = pool(&class)?.resolve_class(self.rt, index)?;
                let length = self.pop_int()?;
                let array = element.array_class().new_array(self.rt, &[length])?;
                self.push(Value::object(array))?
            }
            OPCode::Multianewarray => {
                let index = self.u16()?;
                let dimensions = self.u8()?;
                if dimensions == 0 {
                    return Err(VmError::fatal("multianewarray with zero dimensions"));
                }
                let class = self.class.clone();
                let array_class = pool(&class)?.resolve_class(self.rt, index)?;
                let mut lengths = Vec::with_capacity(usize::from(dimensions));
                for _ in 0..dimensions {
                    lengths.push(self.pop_int()?);
                }
                lengths.reverse();
                let array = array_class.new_array(self.rt, &lengths)?;
                self.push(Value::object(array))?
            }
            OPCode::Arraylength => {
                let array = self.pop_reference()?;
                let array = self.non_null(array, || "Cannot read the array length of null".to_string())?;
                let length = array.array_length()?;
                self.push(Value::Int(length as i32))?
            }
            OPCode::Athrow => {
                let object = self.pop_reference()?;
                let object = self.non_null(object, || "Cannot throw null".to_string())?;
                return Err(match self.caught.take() {
                    Some(caught) if Rc::ptr_eq(&caught.object, &object) => {
                        VmError::Throw(Throwable::new(object, caught.trace))
                    }
                    _ => self.rt.throw(object),
                });
            }
            OPCode::Checkcast => {
                let index = self.u16()?;
                let class = self.class.clone();
                let target = pool(&class)?.resolve_class(self.rt, index)?;
                let object = match self.stack.last() {
                    Some(value) => value.as_reference()?,
                    None => return Err(VmError::fatal(format!("operand stack underflow in {:?}", self.method))),
                };
                target.check_cast(self.rt, object.as_ref())?
            }
            OPCode::Instanceof => {
                let index = self.u16()?;
                let class = self.class.clone();
                let target = pool(&class)?.resolve_class(self.rt, index)?;
                let object = self.pop_reference()?;
                self.push(Value::Int(i32::from(target.instance_of(object.as_ref()))))?
            }
            OPCode::Monitorenter | OPCode::Monitorexit => {
                // One thread runs at a time, so monitors only check for null.
                let object = self.pop_reference()?;
                self.non_null(object, || format!("Cannot {opcode} on null"))?;
            }

            OPCode::Wide => self.wide()?,
            OPCode::Ifnull => {
                let object = self.pop_reference()?;
                self.branch_if(object.is_none())?
            }
            OPCode::Ifnonnull => {
                let object = self.pop_reference()?;
                self.branch_if(object.is_some())?
            }
            OPCode::Breakpoint => {
                return Err(VmError::fatal(format!("breakpoint at {} in {:?}", self.start, self.method)))
            }
        }
        Ok(Flow::Continue)
    }
}
