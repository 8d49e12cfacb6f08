//! Core native bindings and a fallback core library.
//!
//! [`register_core_natives`] binds the host side of the `java/lang` natives
//! the interpreter needs. Several are staged: a class's
//! `registerNatives()V` registers its siblings the first time it runs.
//! [`define_fallback_core`] defines host versions of the classes the
//! runtime itself instantiates when the class path does not supply them.
use std::rc::Rc;

use tracing::debug;

use crate::class::{flags, Class, HostClassBuilder, OBJECT};
use crate::descriptor::PrimitiveType;
use crate::error::{Result, RuntimeErrorKind, VmError};
use crate::native::native;
use crate::object::{same_object, ObjectRef, Value};
use crate::runtime::{Runtime, CLASS, STRING};
use crate::trace::DETAIL_MESSAGE;

fn arg(args: &[Value], index: usize) -> Result<&Value> {
    args.get(index)
        .ok_or_else(|| VmError::fatal(format!("native called without argument {index}")))
}

fn receiver(args: &[Value]) -> Result<ObjectRef> {
    arg(args, 0)?
        .as_reference()?
        .ok_or_else(|| VmError::fatal("native instance method called on null"))
}

fn mirrored(args: &[Value]) -> Result<Rc<Class>> {
    receiver(args)?
        .mirrored_class()
        .ok_or_else(|| VmError::fatal("receiver is not a class object"))
}

fn boolean(value: bool) -> Option<Value> {
    Some(Value::Int(i32::from(value)))
}

/// Registers the core natives with the root loader.
pub fn register_core_natives(rt: &Runtime) {
    let natives = rt.natives();

    natives.register(
        "java/lang/Object#registerNatives()V",
        native(|rt, _| {
            let natives = rt.natives();
            natives.register(
                "java/lang/Object#hashCode()I",
                native(|_, args| Ok(Some(Value::Int(receiver(&args)?.identity_hash())))),
            );
            natives.register(
                "java/lang/Object#getClass()Ljava/lang/Class;",
                native(|rt, args| {
                    let this = receiver(&args)?;
                    Ok(Some(Value::object(rt.class_object(this.class())?)))
                }),
            );
            natives.register(
                "java/lang/Object#wait(J)V",
                native(|rt, args| {
                    rt.wait_object(&receiver(&args)?, arg(&args, 1)?.as_long()?)?;
                    Ok(None)
                }),
            );
            Ok(None)
        }),
    );

    natives.register(
        "java/lang/Class#registerNatives()V",
        native(|rt, _| {
            let natives = rt.natives();
            natives.register(
                "java/lang/Class#getName0()Ljava/lang/String;",
                native(|rt, args| Ok(Some(Value::object(rt.guest_string(&mirrored(&args)?.java_name())?)))),
            );
            natives.register(
                "java/lang/Class#desiredAssertionStatus0(Ljava/lang/Class;)Z",
                native(|_, _| Ok(boolean(false))),
            );
            natives.register(
                "java/lang/Class#getPrimitiveClass(Ljava/lang/String;)Ljava/lang/Class;",
                native(|rt, args| {
                    let name = arg(&args, 0)?
                        .as_reference()?
                        .ok_or_else(|| rt.raise(RuntimeErrorKind::NullPointer, "primitive class name is null"))?;
                    let name = rt.host_string(&name)?;
                    let primitive = PrimitiveType::ALL
                        .into_iter()
                        .find(|p| p.keyword() == name)
                        .ok_or_else(|| rt.translate(VmError::ClassNotFound(name)))?;
                    Ok(Some(Value::object(rt.class_object(&rt.primitive_class(primitive))?)))
                }),
            );
            natives.register(
                "java/lang/Class#getComponentType()Ljava/lang/Class;",
                native(|rt, args| {
                    Ok(Some(match mirrored(&args)?.element_class() {
                        Some(element) => Value::object(rt.class_object(element)?),
                        None => Value::NULL,
                    }))
                }),
            );
            natives.register(
                "java/lang/Class#isArray()Z",
                native(|_, args| Ok(boolean(mirrored(&args)?.is_array()))),
            );
            natives.register(
                "java/lang/Class#isPrimitive()Z",
                native(|_, args| Ok(boolean(mirrored(&args)?.is_primitive()))),
            );
            natives.register(
                "java/lang/Class#isInterface()Z",
                native(|_, args| Ok(boolean(mirrored(&args)?.is_interface()))),
            );
            Ok(None)
        }),
    );

    natives.register("java/lang/ClassLoader#registerNatives()V", native(|_, _| Ok(None)));

    natives.register(
        "java/lang/System#registerNatives()V",
        native(|rt, _| {
            rt.natives().register(
                "java/lang/System#identityHashCode(Ljava/lang/Object;)I",
                native(|_, args| {
                    let hash = arg(&args, 0)?.as_reference()?.map_or(0, |object| object.identity_hash());
                    Ok(Some(Value::Int(hash)))
                }),
            );
            Ok(None)
        }),
    );
    natives.register(
        "java/lang/System#arraycopy(Ljava/lang/Object;ILjava/lang/Object;II)V",
        native(|rt, args| {
            array_copy(
                rt,
                arg(&args, 0)?.as_reference()?,
                arg(&args, 1)?.as_int()?,
                arg(&args, 2)?.as_reference()?,
                arg(&args, 3)?.as_int()?,
                arg(&args, 4)?.as_int()?,
            )?;
            Ok(None)
        }),
    );

    natives.register(
        "java/lang/Float#floatToRawIntBits(F)I",
        native(|_, args| Ok(Some(Value::Int(arg(&args, 0)?.as_float()?.to_bits() as i32)))),
    );
    natives.register(
        "java/lang/Float#intBitsToFloat(I)F",
        native(|_, args| Ok(Some(Value::Float(f32::from_bits(arg(&args, 0)?.as_int()? as u32))))),
    );
    natives.register(
        "java/lang/Double#doubleToRawLongBits(D)J",
        native(|_, args| Ok(Some(Value::Long(arg(&args, 0)?.as_double()?.to_bits() as i64)))),
    );
    natives.register(
        "java/lang/Double#longBitsToDouble(J)D",
        native(|_, args| Ok(Some(Value::Double(f64::from_bits(arg(&args, 0)?.as_long()? as u64))))),
    );

    natives.register(
        "java/lang/String#intern()Ljava/lang/String;",
        native(|rt, args| Ok(Some(Value::object(rt.intern_object(&receiver(&args)?)?)))),
    );

    // Traces are captured when an object is thrown.
    natives.register(
        "java/lang/Throwable#fillInStackTrace(I)Ljava/lang/Throwable;",
        native(|_, args| Ok(Some(Value::object(receiver(&args)?)))),
    );

    natives.register(
        "java/lang/Thread#registerNatives()V",
        native(|rt, _| {
            let natives = rt.natives();
            natives.register(
                "java/lang/Thread#currentThread()Ljava/lang/Thread;",
                native(|rt, _| Ok(Some(Value::Reference(rt.current_thread().object())))),
            );
            natives.register(
                "java/lang/Thread#isAlive()Z",
                native(|rt, args| {
                    let this = receiver(&args)?;
                    let current = rt.current_thread().object();
                    Ok(boolean(same_object(current.as_ref(), Some(&this))))
                }),
            );
            natives.register(
                "java/lang/Thread#start0()V",
                native(|rt, args| {
                    rt.start_thread(&receiver(&args)?)?;
                    Ok(None)
                }),
            );
            Ok(None)
        }),
    );
    natives.register("java/lang/Thread#setPriority0(I)V", native(|_, _| Ok(None)));

    natives.register(
        "java/security/AccessController#doPrivileged(Ljava/security/PrivilegedAction;)Ljava/lang/Object;",
        native(|rt, args| {
            let action = arg(&args, 0)?
                .as_reference()?
                .ok_or_else(|| rt.raise(RuntimeErrorKind::NullPointer, "privileged action is null"))?;
            let result = rt.invoke_virtual(&action, "run", "()Ljava/lang/Object;", Vec::new())?;
            Ok(Some(result.unwrap_or(Value::NULL)))
        }),
    );
    natives.register(
        "java/security/AccessController#getStackAccessControlContext()Ljava/security/AccessControlContext;",
        native(|_, _| Ok(Some(Value::NULL))),
    );

    debug!(count = natives.len(), "registered core natives");
}

/// `System.arraycopy`. Copies inside one array behave as if through a
/// temporary buffer.
pub fn array_copy(
    rt: &Runtime,
    src: Option<ObjectRef>,
    src_pos: i32,
    dest: Option<ObjectRef>,
    dest_pos: i32,
    length: i32,
) -> Result<()> {
    let src = src.ok_or_else(|| rt.raise(RuntimeErrorKind::NullPointer, "arraycopy: source is null"))?;
    let dest = dest.ok_or_else(|| rt.raise(RuntimeErrorKind::NullPointer, "arraycopy: destination is null"))?;
    for (array, role) in [(&src, "source"), (&dest, "destination")] {
        if !array.is_array() {
            return Err(rt.raise(
                RuntimeErrorKind::ArrayStore,
                format!("arraycopy: {role} type {} is not an array", array.class().java_name()),
            ));
        }
    }
    let (src_len, dest_len) = (src.array_length()?, dest.array_length()?);
    let in_bounds = |pos: i32, len: usize| {
        pos >= 0 && length >= 0 && (pos as usize).checked_add(length as usize).map_or(false, |end| end <= len)
    };
    if !in_bounds(src_pos, src_len) {
        return Err(rt.raise(
            RuntimeErrorKind::ArrayIndexOutOfBounds,
            format!("arraycopy: last source index {} out of bounds for length {src_len}", i64::from(src_pos) + i64::from(length)),
        ));
    }
    if !in_bounds(dest_pos, dest_len) {
        return Err(rt.raise(
            RuntimeErrorKind::ArrayIndexOutOfBounds,
            format!("arraycopy: last destination index {} out of bounds for length {dest_len}", i64::from(dest_pos) + i64::from(length)),
        ));
    }
    let (src_pos, dest_pos, length) = (src_pos as usize, dest_pos as usize, length as usize);
    if Rc::ptr_eq(&src, &dest) {
        src.array_mut()?.copy_within(src_pos, dest_pos, length);
        return Ok(());
    }
    let copied = {
        let from = src.array()?;
        let mut to = dest.array_mut()?;
        to.copy_from(dest_pos, &from, src_pos, length)
    };
    copied.map_err(|_| {
        rt.raise(
            RuntimeErrorKind::ArrayStore,
            format!(
                "arraycopy: type mismatch: can not copy {} into {}",
                src.class().java_name(),
                dest.class().java_name()
            ),
        )
    })
}

/// Throwable classes of the fallback library with their superclasses,
/// parents first.
const THROWABLES: &[(&str, &str)] = &[
    ("java/lang/Exception", "java/lang/Throwable"),
    ("java/lang/Error", "java/lang/Throwable"),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/IndexOutOfBoundsException", "java/lang/RuntimeException"),
    ("java/lang/ArrayIndexOutOfBoundsException", "java/lang/IndexOutOfBoundsException"),
    ("java/lang/NegativeArraySizeException", "java/lang/RuntimeException"),
    ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/LinkageError", "java/lang/Error"),
    ("java/lang/NoClassDefFoundError", "java/lang/LinkageError"),
    ("java/lang/IncompatibleClassChangeError", "java/lang/LinkageError"),
    ("java/lang/NoSuchFieldError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/NoSuchMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/AbstractMethodError", "java/lang/IncompatibleClassChangeError"),
    ("java/lang/UnsatisfiedLinkError", "java/lang/LinkageError"),
    ("java/lang/VirtualMachineError", "java/lang/Error"),
    ("java/lang/StackOverflowError", "java/lang/VirtualMachineError"),
];

/// Loads `name`, or defines the class built by `build` when no loader
/// has it.
fn load_or_define(
    rt: &Runtime,
    name: &str,
    build: impl FnOnce() -> Result<HostClassBuilder>,
) -> Result<Rc<Class>> {
    match rt.load_class(name) {
        Err(VmError::ClassNotFound(missing)) if missing == name => {
            debug!(class = name, "defining fallback class");
            let class = build()?.build(rt.loader())?;
            Ok(rt.loader().define_class(class))
        }
        other => other,
    }
}

fn set_message(args: &[Value]) -> Result<Option<Value>> {
    receiver(args)?.put_field(DETAIL_MESSAGE, arg(args, 1)?.clone())?;
    Ok(None)
}

/// Throwable constructors are per class, so every fallback throwable gets
/// `()V` and `(Ljava/lang/String;)V`.
fn with_throwable_constructors(builder: HostClassBuilder) -> HostClassBuilder {
    builder
        .method(flags::PUBLIC, "<init>", "()V", native(|_, _| Ok(None)))
        .method(flags::PUBLIC, "<init>", "(Ljava/lang/String;)V", native(|_, args| set_message(&args)))
}

/// Defines host versions of `java/lang/Object`, `Class`, `String`,
/// `Throwable` and the throwables raised by the runtime, each only when the
/// class cannot be loaded.
pub fn define_fallback_core(rt: &Runtime) -> Result<()> {
    let object = load_or_define(rt, OBJECT, || {
        Ok(HostClassBuilder::new(OBJECT)
            .method(flags::PUBLIC, "<init>", "()V", native(|_, _| Ok(None)))
            .method(
                flags::PUBLIC,
                "hashCode",
                "()I",
                native(|_, args| Ok(Some(Value::Int(receiver(&args)?.identity_hash())))),
            )
            .method(
                flags::PUBLIC,
                "equals",
                "(Ljava/lang/Object;)Z",
                native(|_, args| {
                    let this = receiver(&args)?;
                    let other = arg(&args, 1)?.as_reference()?;
                    Ok(boolean(same_object(Some(&this), other.as_ref())))
                }),
            )
            .method(
                flags::PUBLIC | flags::FINAL,
                "getClass",
                "()Ljava/lang/Class;",
                native(|rt, args| Ok(Some(Value::object(rt.class_object(receiver(&args)?.class())?)))),
            ))
    })?;

    load_or_define(rt, CLASS, || {
        Ok(HostClassBuilder::new(CLASS)
            .access_flags(flags::PUBLIC | flags::FINAL | flags::SUPER)
            .super_class(object.clone()))
    })?;

    load_or_define(rt, STRING, || {
        Ok(HostClassBuilder::new(STRING)
            .access_flags(flags::PUBLIC | flags::FINAL | flags::SUPER)
            .super_class(object.clone())
            .field(flags::PRIVATE | flags::FINAL, "value", "[C")
            .method(
                flags::PUBLIC,
                "<init>",
                "([C)V",
                native(|_, args| {
                    receiver(&args)?.put_field(crate::runtime::STRING_VALUE, arg(&args, 1)?.clone())?;
                    Ok(None)
                }),
            )
            .method(
                flags::PUBLIC,
                "length",
                "()I",
                native(|rt, args| {
                    let length = rt.host_string(&receiver(&args)?)?.encode_utf16().count();
                    Ok(Some(Value::Int(length as i32)))
                }),
            ))
    })?;

    load_or_define(rt, "java/lang/Throwable", || {
        Ok(with_throwable_constructors(
            HostClassBuilder::new("java/lang/Throwable")
                .super_class(object.clone())
                .field(flags::PRIVATE, "detailMessage", "Ljava/lang/String;")
                .method(
                    flags::PUBLIC,
                    "getMessage",
                    "()Ljava/lang/String;",
                    native(|_, args| Ok(Some(receiver(&args)?.get_field(DETAIL_MESSAGE)?))),
                ),
        ))
    })?;

    for &(name, super_name) in THROWABLES {
        let super_class = rt.load_class(super_name)?;
        load_or_define(rt, name, || {
            Ok(with_throwable_constructors(HostClassBuilder::new(name).super_class(super_class)))
        })?;
    }
    Ok(())
}
