mod common;

use std::rc::Rc;

use drip::bytecode::array_type::T_INT;
use drip::bytecode::OPCode::*;
use drip::class::flags::{ABSTRACT, FINAL, INTERFACE, NATIVE, PUBLIC, STATIC};
use drip::class::InitState;
use drip::{native, ObjectRef, RuntimeConfig, RuntimeErrorKind, Value, VmError};

use common::{guest_exceptions, on_guest_stack, runtime, runtime_with, subclass, Asm, ClassBuilder, Code, OBJECT};

const PS: u16 = PUBLIC | STATIC;

fn int(result: drip::Result<Option<Value>>) -> i32 {
    match result {
        Ok(Some(Value::Int(v))) => v,
        other => panic!("expected an int, got {other:?}"),
    }
}

fn long(result: drip::Result<Option<Value>>) -> i64 {
    match result {
        Ok(Some(Value::Long(v))) => v,
        other => panic!("expected a long, got {other:?}"),
    }
}

fn object(result: drip::Result<Option<Value>>) -> ObjectRef {
    match result {
        Ok(Some(Value::Reference(Some(object)))) => object,
        other => panic!("expected an object, got {other:?}"),
    }
}

fn runtime_kind(result: drip::Result<Option<Value>>) -> (RuntimeErrorKind, String) {
    match result {
        Err(VmError::Runtime { kind, message }) => (kind, message),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn adds_two_ints() {
    let mut calc = ClassBuilder::new("t/Calc", Some(OBJECT));
    let mut asm = Asm::new();
    asm.op(Iload0).op(Iload1).op(Iadd).op(Ireturn);
    calc.method(PS, "add", "(II)I", Code::new(2, 2, asm.finish()));

    let rt = runtime(vec![calc]);
    let args = vec![Value::Int(40), Value::Int(2)];
    assert_eq!(int(rt.invoke_static("t/Calc", "add", "(II)I", args)), 42);
}

#[test]
fn main_returns_forty_two() {
    let mut main = ClassBuilder::new("t/Main", Some(OBJECT));
    let mut asm = Asm::new();
    asm.op(Bipush).u8(40).op(Bipush).u8(2).op(Iadd).op(Ireturn);
    main.method(PS, "main", "()I", Code::new(2, 0, asm.finish()));

    let rt = runtime(vec![main]);
    assert_eq!(int(rt.invoke_static("t/Main", "main", "()I", vec![])), 42);
}

#[test]
fn loops_with_backward_branches() {
    let mut calc = ClassBuilder::new("t/Sum", Some(OBJECT));
    let mut asm = Asm::new();
    asm.op(Iconst0)
        .op(Istore1)
        .label("loop")
        .op(Iload0)
        .jump(Ifle, "end")
        .op(Iload1)
        .op(Iload0)
        .op(Iadd)
        .op(Istore1)
        .op(Iinc)
        .u8(0)
        .i8(-1)
        .jump(Goto, "loop")
        .label("end")
        .op(Iload1)
        .op(Ireturn);
    calc.method(PS, "sum", "(I)I", Code::new(2, 2, asm.finish()));

    let rt = runtime(vec![calc]);
    assert_eq!(int(rt.invoke_static("t/Sum", "sum", "(I)I", vec![Value::Int(10)])), 55);
    assert_eq!(int(rt.invoke_static("t/Sum", "sum", "(I)I", vec![Value::Int(0)])), 0);
}

#[test]
fn static_initializer_runs_once() {
    let mut counter = ClassBuilder::new("t/Counter", Some(OBJECT));
    counter.field(PS, "counter", "I");
    let slot = counter.field_ref("t/Counter", "counter", "I");
    let mut clinit = Asm::new();
    clinit
        .op(Getstatic)
        .u16(slot)
        .op(Bipush)
        .u8(7)
        .op(Iadd)
        .op(Putstatic)
        .u16(slot)
        .op(Return);
    counter.method(STATIC, "<clinit>", "()V", Code::new(2, 0, clinit.finish()));
    let mut get = Asm::new();
    get.op(Getstatic).u16(slot).op(Ireturn);
    counter.method(PS, "get", "()I", Code::new(1, 0, get.finish()));

    let mut reader = ClassBuilder::new("t/Reader", Some(OBJECT));
    let foreign = reader.field_ref("t/Counter", "counter", "I");
    let mut read = Asm::new();
    read.op(Getstatic).u16(foreign).op(Ireturn);
    reader.method(PS, "read", "()I", Code::new(1, 0, read.finish()));

    let rt = runtime(vec![counter, reader]);
    assert!(!rt.load_class("t/Counter").unwrap().is_initialized());
    assert_eq!(int(rt.invoke_static("t/Reader", "read", "()I", vec![])), 7);
    assert_eq!(int(rt.invoke_static("t/Counter", "get", "()I", vec![])), 7);
    assert_eq!(int(rt.invoke_static("t/Counter", "get", "()I", vec![])), 7);

    let class = rt.load_class("t/Counter").unwrap();
    class.try_init(&rt).unwrap();
    assert!(class.is_initialized());
    assert!(matches!(class.static_value("counter", "I"), Some(Value::Int(7))));
}

#[test]
fn constant_value_fields_are_set_before_the_initializer() {
    let mut limits = ClassBuilder::new("t/Limits", Some(OBJECT));
    let small = limits.integer(99);
    let big = limits.long(1 << 40);
    limits.constant_field(PS | FINAL, "SMALL", "I", small);
    limits.constant_field(PS | FINAL, "BIG", "J", big);
    let big_ref = limits.field_ref("t/Limits", "BIG", "J");
    let mut asm = Asm::new();
    asm.op(Getstatic).u16(big_ref).op(Lreturn);
    limits.method(PS, "big", "()J", Code::new(2, 0, asm.finish()));

    let rt = runtime(vec![limits]);
    assert_eq!(long(rt.invoke_static("t/Limits", "big", "()J", vec![])), 1 << 40);
    let class = rt.load_class("t/Limits").unwrap();
    assert!(matches!(class.static_value("SMALL", "I"), Some(Value::Int(99))));
}

fn fragile() -> Vec<ClassBuilder> {
    let mut fragile = subclass("t/Fragile", OBJECT);
    let mut clinit = Asm::new();
    clinit.op(Iconst1).op(Iconst0).op(Idiv).op(Pop).op(Return);
    fragile.method(STATIC, "<clinit>", "()V", Code::new(2, 0, clinit.finish()));
    let mut answer = Asm::new();
    answer.op(Bipush).u8(42).op(Ireturn);
    fragile.method(PS, "f", "()I", Code::new(1, 0, answer.finish()));

    let mut child = subclass("t/Child", "t/Fragile");
    let mut answer = Asm::new();
    answer.op(Bipush).u8(43).op(Ireturn);
    child.method(PS, "g", "()I", Code::new(1, 0, answer.finish()));

    let mut orphan = subclass("t/Orphan", "t/Missing");
    let mut answer = Asm::new();
    answer.op(Bipush).u8(44).op(Ireturn);
    orphan.method(PS, "f", "()I", Code::new(1, 0, answer.finish()));
    vec![fragile, child, orphan]
}

#[test]
fn failed_initialization_is_retried_and_fails_again() {
    let rt = runtime(fragile());
    for _ in 0..2 {
        let (kind, _) = runtime_kind(rt.invoke_static("t/Fragile", "f", "()I", vec![]));
        assert_eq!(kind, RuntimeErrorKind::Arithmetic);
        let (kind, _) = runtime_kind(rt.invoke_static("t/Child", "g", "()I", vec![]));
        assert_eq!(kind, RuntimeErrorKind::Arithmetic);
        match rt.invoke_static("t/Orphan", "f", "()I", vec![]) {
            Err(VmError::ClassNotFound(name)) => assert_eq!(name, "t/Missing"),
            other => panic!("expected the superclass to be missing, got {other:?}"),
        }
    }
    for name in ["t/Fragile", "t/Child"] {
        let class = rt.load_class(name).unwrap();
        assert!(class.is_linked());
        assert_eq!(class.init_state(), InitState::Uninitialized);
    }
    assert!(!rt.loader().find_loaded("t/Orphan").unwrap().is_initialized());
}

fn shapes() -> Vec<ClassBuilder> {
    let mut base = subclass("t/Base", OBJECT);
    let mut one = Asm::new();
    one.op(Iconst1).op(Ireturn);
    base.method(PUBLIC, "m", "()I", Code::new(1, 1, one.finish()));

    let mut sub = subclass("t/Sub", "t/Base");
    let mut two = Asm::new();
    two.op(Iconst2).op(Ireturn);
    sub.method(PUBLIC, "m", "()I", Code::new(1, 1, two.finish()));
    let base_m = sub.method_ref("t/Base", "m", "()I");
    let mut call_super = Asm::new();
    call_super.op(Aload0).op(Invokespecial).u16(base_m).op(Ireturn);
    sub.method(PUBLIC, "callSuper", "()I", Code::new(1, 1, call_super.finish()));

    let mut main = ClassBuilder::new("t/Shapes", Some(OBJECT));
    for (name, class) in [("viaSub", "t/Sub"), ("viaBase", "t/Base")] {
        let class_index = main.class(class);
        let init = main.method_ref(class, "<init>", "()V");
        let m = main.method_ref("t/Base", "m", "()I");
        let mut asm = Asm::new();
        asm.op(New)
            .u16(class_index)
            .op(Dup)
            .op(Invokespecial)
            .u16(init)
            .op(Invokevirtual)
            .u16(m)
            .op(Ireturn);
        main.method(PS, name, "()I", Code::new(2, 0, asm.finish()));
    }
    vec![base, sub, main]
}

#[test]
fn virtual_calls_dispatch_on_the_receiver() {
    let rt = runtime(shapes());
    assert_eq!(int(rt.invoke_static("t/Shapes", "viaSub", "()I", vec![])), 2);
    assert_eq!(int(rt.invoke_static("t/Shapes", "viaBase", "()I", vec![])), 1);
}

#[test]
fn invokespecial_calls_the_named_implementation() {
    let rt = runtime(shapes());
    let sub = rt.new_instance_with("t/Sub", "", vec![]).unwrap();
    assert_eq!(int(rt.invoke_virtual(&sub, "m", "()I", vec![])), 2);
    assert_eq!(int(rt.invoke_virtual(&sub, "callSuper", "()I", vec![])), 1);
}

#[test]
fn interface_default_methods_fill_the_dispatch_table() {
    let mut greeter = ClassBuilder::new("t/Greeter", Some(OBJECT));
    greeter.access_flags(PUBLIC | INTERFACE | ABSTRACT);
    let mut five = Asm::new();
    five.op(Bipush).u8(5).op(Ireturn);
    greeter.method(PUBLIC, "greet", "()I", Code::new(1, 1, five.finish()));
    greeter.bodiless_method(PUBLIC | ABSTRACT, "name", "()I");

    let mut imp = subclass("t/Impl", OBJECT);
    imp.interface("t/Greeter");
    let mut three = Asm::new();
    three.op(Iconst3).op(Ireturn);
    imp.method(PUBLIC, "name", "()I", Code::new(1, 1, three.finish()));

    let mut main = ClassBuilder::new("t/Greet", Some(OBJECT));
    let impl_class = main.class("t/Impl");
    let init = main.method_ref("t/Impl", "<init>", "()V");
    let greet = main.interface_method_ref("t/Greeter", "greet", "()I");
    let name = main.interface_method_ref("t/Greeter", "name", "()I");
    let mut asm = Asm::new();
    asm.op(New)
        .u16(impl_class)
        .op(Dup)
        .op(Invokespecial)
        .u16(init)
        .op(Astore0)
        .op(Aload0)
        .op(Invokeinterface)
        .u16(greet)
        .u8(1)
        .u8(0)
        .op(Aload0)
        .op(Invokeinterface)
        .u16(name)
        .u8(1)
        .u8(0)
        .op(Iadd)
        .op(Ireturn);
    main.method(PS, "run", "()I", Code::new(2, 1, asm.finish()));

    let rt = runtime(vec![greeter, imp, main]);
    assert_eq!(int(rt.invoke_static("t/Greet", "run", "()I", vec![])), 8);

    let imp = rt.load_class("t/Impl").unwrap();
    let greeter = rt.load_class("t/Greeter").unwrap();
    assert!(imp.has_ancestor(&greeter));
    assert!(greeter.is_interface());
}

fn interfaces() -> Vec<ClassBuilder> {
    let mut first = ClassBuilder::new("t/I1", Some(OBJECT));
    first.access_flags(PUBLIC | INTERFACE | ABSTRACT);
    let mut second = ClassBuilder::new("t/I2", Some(OBJECT));
    second.access_flags(PUBLIC | INTERFACE | ABSTRACT).interface("t/I1");
    let mut both = subclass("t/Both", OBJECT);
    both.interface("t/I2");
    let plain = subclass("t/Plain", OBJECT);

    let mut checks = ClassBuilder::new("t/Checks", Some(OBJECT));
    for (suffix, target) in [("I1", "t/I1"), ("I2", "t/I2")] {
        let target = checks.class(target);
        let mut is = Asm::new();
        is.op(Aload0).op(Instanceof).u16(target).op(Ireturn);
        checks.method(PS, &format!("is{suffix}"), "(Ljava/lang/Object;)I", Code::new(1, 1, is.finish()));
        let mut cast = Asm::new();
        cast.op(Aload0).op(Checkcast).u16(target).op(Pop).op(Iconst1).op(Ireturn);
        checks.method(PS, &format!("cast{suffix}"), "(Ljava/lang/Object;)I", Code::new(1, 1, cast.finish()));
    }
    for class in ["t/Both", "t/Plain"] {
        let class_index = checks.class(class);
        let init = checks.method_ref(class, "<init>", "()V");
        let mut make = Asm::new();
        make.op(New).u16(class_index).op(Dup).op(Invokespecial).u16(init).op(Areturn);
        let name = format!("make{}", &class[2..]);
        checks.method(PS, &name, "()Ljava/lang/Object;", Code::new(2, 0, make.finish()));
    }
    vec![first, second, both, plain, checks]
}

#[test]
fn implemented_interfaces_pass_instanceof_and_checkcast() {
    let rt = runtime(interfaces());
    let check = |name: &str, value: Value| int(rt.invoke_static("t/Checks", name, "(Ljava/lang/Object;)I", vec![value]));
    let both = Value::object(object(rt.invoke_static("t/Checks", "makeBoth", "()Ljava/lang/Object;", vec![])));
    let plain = Value::object(object(rt.invoke_static("t/Checks", "makePlain", "()Ljava/lang/Object;", vec![])));

    // t/I1 is only reached through t/I2.
    for name in ["isI1", "isI2", "castI1", "castI2"] {
        assert_eq!(check(name, both.clone()), 1, "{name}");
    }
    assert_eq!(check("isI1", plain.clone()), 0);
    assert_eq!(check("isI2", plain.clone()), 0);
    let (kind, _) = runtime_kind(rt.invoke_static("t/Checks", "castI1", "(Ljava/lang/Object;)I", vec![plain]));
    assert_eq!(kind, RuntimeErrorKind::ClassCast);
    assert_eq!(check("isI1", Value::Reference(None)), 0);
    assert_eq!(check("castI2", Value::Reference(None)), 1);
}

#[test]
fn ancestry_holds_in_any_initialization_order() {
    let names = ["t/Both", "t/I2", "t/I1"];
    for order in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [1, 2, 0]] {
        let rt = runtime(interfaces());
        let classes: Vec<_> = names.iter().map(|name| rt.load_class(name).unwrap()).collect();
        for &index in &order {
            classes[index].try_init(&rt).unwrap();
            for (i, class) in classes.iter().enumerate() {
                for (j, other) in classes.iter().enumerate() {
                    assert_eq!(class.has_ancestor(other), i <= j, "{} / {} after {order:?}", names[i], names[j]);
                }
            }
        }
    }
}

fn reentrant() -> Vec<ClassBuilder> {
    let mut top = subclass("t/Top", OBJECT);
    top.field(PS, "made", "Ljava/lang/Object;");
    let made = top.field_ref("t/Top", "made", "Ljava/lang/Object;");
    let bottom_index = top.class("t/Bottom");
    let bottom_init = top.method_ref("t/Bottom", "<init>", "()V");
    let top_index = top.class("t/Top");
    let mut clinit = Asm::new();
    clinit
        .op(New)
        .u16(bottom_index)
        .op(Dup)
        .op(Invokespecial)
        .u16(bottom_init)
        .op(Putstatic)
        .u16(made)
        .op(Return);
    top.method(STATIC, "<clinit>", "()V", Code::new(2, 0, clinit.finish()));
    let mut check = Asm::new();
    check.op(Getstatic).u16(made).op(Instanceof).u16(top_index).op(Ireturn);
    top.method(PS, "madeIsTop", "()I", Code::new(1, 0, check.finish()));
    vec![top, subclass("t/Bottom", "t/Top")]
}

#[test]
fn superclass_initializers_may_instantiate_their_subclasses() {
    for first in ["t/Top", "t/Bottom"] {
        let rt = runtime(reentrant());
        rt.load_class(first).unwrap().try_init(&rt).unwrap();
        assert_eq!(int(rt.invoke_static("t/Top", "madeIsTop", "()I", vec![])), 1, "{first} first");

        let top = rt.load_class("t/Top").unwrap();
        let bottom = rt.load_class("t/Bottom").unwrap();
        assert!(top.is_initialized() && bottom.is_initialized());
        assert!(bottom.has_ancestor(&top));
        match top.static_value("made", "Ljava/lang/Object;") {
            Some(Value::Reference(Some(made))) => assert!(Rc::ptr_eq(made.class(), &bottom)),
            other => panic!("expected an instance, got {other:?}"),
        }
    }
}

#[test]
fn integer_arithmetic_wraps() {
    let mut math = ClassBuilder::new("t/Wrap", Some(OBJECT));
    let max = math.integer(i32::MAX);
    let min = math.integer(i32::MIN);
    let long_max = math.long(i64::MAX);

    let mut asm = Asm::new();
    asm.op(Ldc).u8(max as u8).op(Iconst1).op(Iadd).op(Ireturn);
    math.method(PS, "overflow", "()I", Code::new(2, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Ldc2W).u16(long_max).op(Lconst1).op(Ladd).op(Lreturn);
    math.method(PS, "longOverflow", "()J", Code::new(4, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Ldc).u8(min as u8).op(IconstM1).op(Idiv).op(Ireturn);
    math.method(PS, "minDiv", "()I", Code::new(2, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Iconst1).op(Bipush).u8(33).op(Ishl).op(Ireturn);
    math.method(PS, "shift", "()I", Code::new(2, 0, asm.finish()));

    let rt = runtime(vec![math]);
    assert_eq!(int(rt.invoke_static("t/Wrap", "overflow", "()I", vec![])), i32::MIN);
    assert_eq!(long(rt.invoke_static("t/Wrap", "longOverflow", "()J", vec![])), i64::MIN);
    assert_eq!(int(rt.invoke_static("t/Wrap", "minDiv", "()I", vec![])), i32::MIN);
    assert_eq!(int(rt.invoke_static("t/Wrap", "shift", "()I", vec![])), 2);
}

#[test]
fn instance_fields_hold_wide_values() {
    let mut point = subclass("t/Point", OBJECT);
    point.field(PUBLIC, "x", "I").field(PUBLIC, "y", "J");
    let point_class = point.class("t/Point");
    let init = point.method_ref("t/Point", "<init>", "()V");
    let x = point.field_ref("t/Point", "x", "I");
    let y = point.field_ref("t/Point", "y", "J");
    let big = point.long(5_000_000_000);
    let mut asm = Asm::new();
    asm.op(New)
        .u16(point_class)
        .op(Dup)
        .op(Invokespecial)
        .u16(init)
        .op(Astore0)
        .op(Aload0)
        .op(Iconst3)
        .op(Putfield)
        .u16(x)
        .op(Aload0)
        .op(Ldc2W)
        .u16(big)
        .op(Putfield)
        .u16(y)
        .op(Aload0)
        .op(Getfield)
        .u16(x)
        .op(I2l)
        .op(Aload0)
        .op(Getfield)
        .u16(y)
        .op(Ladd)
        .op(Lreturn);
    point.method(PS, "sum", "()J", Code::new(4, 1, asm.finish()));

    let rt = runtime(vec![point]);
    assert_eq!(long(rt.invoke_static("t/Point", "sum", "()J", vec![])), 5_000_000_003);
}

fn arrays() -> ClassBuilder {
    let mut arrays = ClassBuilder::new("t/Arrays", Some(OBJECT));

    let mut asm = Asm::new();
    asm.op(Iconst3)
        .op(Newarray)
        .u8(T_INT)
        .op(Astore0)
        .op(Aload0)
        .op(Iconst1)
        .op(Bipush)
        .u8(42)
        .op(Iastore)
        .op(Aload0)
        .op(Iconst1)
        .op(Iaload)
        .op(Aload0)
        .op(Arraylength)
        .op(Iadd)
        .op(Ireturn);
    arrays.method(PS, "store", "()I", Code::new(3, 1, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Iconst3).op(Newarray).u8(T_INT).op(Iconst3).op(Iaload).op(Ireturn);
    arrays.method(PS, "outOfBounds", "()I", Code::new(2, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(IconstM1).op(Newarray).u8(T_INT).op(Arraylength).op(Ireturn);
    arrays.method(PS, "negative", "()I", Code::new(1, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(AconstNull).op(Arraylength).op(Ireturn);
    arrays.method(PS, "nullLength", "()I", Code::new(1, 0, asm.finish()));

    let grid = arrays.class("[[I");
    let mut asm = Asm::new();
    asm.op(Iconst2)
        .op(Iconst3)
        .op(Multianewarray)
        .u16(grid)
        .u8(2)
        .op(Astore0)
        .op(Aload0)
        .op(Iconst1)
        .op(Aaload)
        .op(Arraylength)
        .op(Aload0)
        .op(Arraylength)
        .op(Iadd)
        .op(Ireturn);
    arrays.method(PS, "grid", "()I", Code::new(2, 1, asm.finish()));
    arrays
}

#[test]
fn arrays_store_and_load_elements() {
    let rt = runtime(vec![arrays()]);
    assert_eq!(int(rt.invoke_static("t/Arrays", "store", "()I", vec![])), 45);
    assert_eq!(int(rt.invoke_static("t/Arrays", "grid", "()I", vec![])), 5);
}

#[test]
fn array_faults_are_runtime_errors() {
    let rt = runtime(vec![arrays()]);
    let (kind, message) = runtime_kind(rt.invoke_static("t/Arrays", "outOfBounds", "()I", vec![]));
    assert_eq!(kind, RuntimeErrorKind::ArrayIndexOutOfBounds);
    assert_eq!(message, "Index 3 out of bounds for length 3");

    let (kind, _) = runtime_kind(rt.invoke_static("t/Arrays", "negative", "()I", vec![]));
    assert_eq!(kind, RuntimeErrorKind::NegativeArraySize);

    let (kind, _) = runtime_kind(rt.invoke_static("t/Arrays", "nullLength", "()I", vec![]));
    assert_eq!(kind, RuntimeErrorKind::NullPointer);
}

#[test]
fn string_literals_are_interned() {
    let mut strings = ClassBuilder::new("t/Strings", Some(OBJECT));
    let hi = strings.string("hi");
    let string_class = strings.class("java/lang/String");
    let mut asm = Asm::new();
    asm.op(Ldc).u8(hi as u8).op(Areturn);
    strings.method(PS, "hello", "()Ljava/lang/String;", Code::new(1, 0, asm.finish()));
    let mut asm = Asm::new();
    asm.op(Ldc).u8(hi as u8).op(Instanceof).u16(string_class).op(Ireturn);
    strings.method(PS, "isString", "()I", Code::new(1, 0, asm.finish()));

    let rt = runtime(vec![strings]);
    let first = match rt.invoke_static("t/Strings", "hello", "()Ljava/lang/String;", vec![]) {
        Ok(Some(Value::Reference(Some(object)))) => object,
        other => panic!("expected a string, got {other:?}"),
    };
    let second = match rt.invoke_static("t/Strings", "hello", "()Ljava/lang/String;", vec![]) {
        Ok(Some(Value::Reference(Some(object)))) => object,
        other => panic!("expected a string, got {other:?}"),
    };
    assert_eq!(rt.host_string(&first).unwrap(), "hi");
    assert!(Rc::ptr_eq(&first, &second));
    assert!(Rc::ptr_eq(&first, &rt.intern("hi").unwrap()));
    assert_eq!(int(rt.invoke_static("t/Strings", "isString", "()I", vec![])), 1);
}

#[test]
fn failed_casts_raise_class_cast() {
    let mut casts = ClassBuilder::new("t/Casts", Some(OBJECT));
    let text = casts.string("x");
    let other = casts.class("t/Other");
    let mut asm = Asm::new();
    asm.op(Ldc).u8(text as u8).op(Checkcast).u16(other).op(Pop).op(Iconst0).op(Ireturn);
    casts.method(PS, "cast", "()I", Code::new(1, 0, asm.finish()));

    let rt = runtime(vec![casts, subclass("t/Other", OBJECT)]);
    let (kind, _) = runtime_kind(rt.invoke_static("t/Casts", "cast", "()I", vec![]));
    assert_eq!(kind, RuntimeErrorKind::ClassCast);
}

#[test]
fn switches_pick_their_targets() {
    let mut switches = ClassBuilder::new("t/Switch", Some(OBJECT));

    let mut asm = Asm::new();
    asm.op(Iload0);
    let start = asm.pc();
    asm.op(Tableswitch)
        .align()
        .offset32(start, "default")
        .i32(1)
        .i32(3)
        .offset32(start, "one")
        .offset32(start, "two")
        .offset32(start, "three");
    for (label, value) in [("one", 10), ("two", 20), ("three", 30), ("default", -1)] {
        asm.label(label).op(Bipush).i8(value).op(Ireturn);
    }
    switches.method(PS, "table", "(I)I", Code::new(1, 1, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Iload0);
    let start = asm.pc();
    asm.op(Lookupswitch)
        .align()
        .offset32(start, "default")
        .i32(2)
        .i32(-5)
        .offset32(start, "negative")
        .i32(100)
        .offset32(start, "hundred");
    for (label, value) in [("negative", 1), ("hundred", 2), ("default", 0)] {
        asm.label(label).op(Bipush).i8(value).op(Ireturn);
    }
    switches.method(PS, "lookup", "(I)I", Code::new(1, 1, asm.finish()));

    let rt = runtime(vec![switches]);
    let table = |key| int(rt.invoke_static("t/Switch", "table", "(I)I", vec![Value::Int(key)]));
    assert_eq!(table(1), 10);
    assert_eq!(table(3), 30);
    assert_eq!(table(0), -1);
    assert_eq!(table(4), -1);
    let lookup = |key| int(rt.invoke_static("t/Switch", "lookup", "(I)I", vec![Value::Int(key)]));
    assert_eq!(lookup(-5), 1);
    assert_eq!(lookup(100), 2);
    assert_eq!(lookup(7), 0);
}

#[test]
fn subroutines_return_through_local_addresses() {
    let mut sub = ClassBuilder::new("t/Jsr", Some(OBJECT));
    let mut asm = Asm::new();
    asm.op(Iconst0)
        .op(Istore0)
        .jump(Jsr, "sub")
        .op(Iload0)
        .op(Ireturn)
        .label("sub")
        .op(Astore1)
        .op(Iinc)
        .u8(0)
        .i8(5)
        .op(Ret)
        .u8(1);
    sub.method(PS, "run", "()I", Code::new(1, 2, asm.finish()));

    let rt = runtime(vec![sub]);
    assert_eq!(int(rt.invoke_static("t/Jsr", "run", "()I", vec![])), 5);
}

/// `t/E1 extends RuntimeException`, `t/E2 extends t/E1` and a class whose
/// methods throw one of them from offset 0..8 and return 1 or 2 from the
/// handlers at 8 and 11.
fn throwers() -> Vec<ClassBuilder> {
    let mut catcher = ClassBuilder::new("t/Catch", Some(OBJECT));
    let e1 = catcher.class("t/E1");
    let e2 = catcher.class("t/E2");
    let cases: [(&str, &str, Vec<(u16, u16, u16, u16)>); 5] = [
        ("firstMatch", "t/E2", vec![(0, 8, 8, e1), (0, 8, 11, e2)]),
        ("skipsOther", "t/E1", vec![(0, 8, 11, e2), (0, 8, 8, e1)]),
        ("catchAll", "t/E1", vec![(0, 8, 11, 0)]),
        ("outsideRange", "t/E1", vec![(0, 3, 8, 0)]),
        ("uncaught", "t/E1", vec![]),
    ];
    for (name, thrown, handlers) in cases {
        let class_index = catcher.class(thrown);
        let init = catcher.method_ref(thrown, "<init>", "()V");
        let mut asm = Asm::new();
        asm.op(New)
            .u16(class_index)
            .op(Dup)
            .op(Invokespecial)
            .u16(init)
            .op(Athrow)
            .op(Pop)
            .op(Iconst1)
            .op(Ireturn)
            .op(Pop)
            .op(Iconst2)
            .op(Ireturn);
        let mut code = Code::new(2, 0, asm.finish());
        for (start, end, handler, catch_type) in handlers {
            code = code.handler(start, end, handler, catch_type);
        }
        catcher.method(PS, name, "()I", code);
    }
    vec![
        subclass("t/E1", "java/lang/RuntimeException"),
        subclass("t/E2", "t/E1"),
        catcher,
    ]
}

#[test]
fn handlers_match_in_table_order() {
    let rt = runtime(throwers());
    assert_eq!(int(rt.invoke_static("t/Catch", "firstMatch", "()I", vec![])), 1);
    assert_eq!(int(rt.invoke_static("t/Catch", "skipsOther", "()I", vec![])), 1);
    assert_eq!(int(rt.invoke_static("t/Catch", "catchAll", "()I", vec![])), 2);
}

#[test]
fn throws_outside_handler_ranges_propagate() {
    let rt = runtime(throwers());
    for name in ["outsideRange", "uncaught"] {
        match rt.invoke_static("t/Catch", name, "()I", vec![]) {
            Err(VmError::Throw(throwable)) => assert_eq!(throwable.class_name(), "t/E1"),
            other => panic!("expected a throw from {name}, got {other:?}"),
        }
    }

    let e2 = rt.load_class("t/E2").unwrap();
    for ancestor in ["t/E1", "java/lang/RuntimeException", "java/lang/Throwable", OBJECT] {
        assert!(e2.has_ancestor(&rt.load_class(ancestor).unwrap()), "{ancestor}");
    }
    assert!(!e2.has_ancestor(&rt.load_class("t/Catch").unwrap()));
}

#[test]
fn uncaught_throwables_carry_the_call_stack() {
    let mut boom = ClassBuilder::new("t/Boom", Some(OBJECT));
    boom.source_file("Boom.java");
    let e1 = boom.class("t/E1");
    let e1_init = boom.method_ref("t/E1", "<init>", "()V");
    let inner = boom.method_ref("t/Boom", "inner", "()V");

    let mut asm = Asm::new();
    asm.op(New).u16(e1).op(Dup).op(Invokespecial).u16(e1_init).op(Athrow);
    boom.method(PS, "inner", "()V", Code::new(2, 0, asm.finish()).line(0, 10).line(7, 11));

    let mut asm = Asm::new();
    asm.op(Invokestatic).u16(inner).op(Return);
    boom.method(PS, "outer", "()V", Code::new(0, 0, asm.finish()).line(0, 20));

    let mut classes = throwers();
    classes.push(boom);
    let rt = runtime(classes);
    let throwable = match rt.invoke_static("t/Boom", "outer", "()V", vec![]) {
        Err(VmError::Throw(throwable)) => throwable,
        other => panic!("expected a throw, got {other:?}"),
    };
    assert_eq!(throwable.trace.len(), 2);
    assert_eq!(throwable.trace[0].method_name, "inner");
    assert_eq!(throwable.trace[0].line, 11);
    assert_eq!(throwable.trace[1].method_name, "outer");
    assert_eq!(
        throwable.render(&rt),
        "t.E1\n\tat t.Boom.inner(Boom.java:11)\n\tat t.Boom.outer(Boom.java:20)"
    );
}

fn divider() -> ClassBuilder {
    let mut div = ClassBuilder::new("t/Div", Some(OBJECT));
    let arithmetic = div.class("java/lang/ArithmeticException");
    let get_message = div.method_ref("java/lang/Throwable", "getMessage", "()Ljava/lang/String;");

    let mut asm = Asm::new();
    asm.op(Iload0)
        .op(Iload1)
        .op(Idiv)
        .op(Ireturn)
        .op(Pop)
        .op(IconstM1)
        .op(Ireturn);
    div.method(PS, "safeDiv", "(II)I", Code::new(2, 2, asm.finish()).handler(0, 4, 4, arithmetic));

    let mut asm = Asm::new();
    asm.op(Iconst1)
        .op(Iconst0)
        .op(Idiv)
        .op(Pop)
        .op(AconstNull)
        .op(Areturn)
        .op(Invokevirtual)
        .u16(get_message)
        .op(Areturn);
    let code = Code::new(2, 0, asm.finish()).handler(0, 6, 6, arithmetic);
    div.method(PS, "message", "()Ljava/lang/String;", code);
    div
}

#[test]
fn guest_exceptions_reach_bytecode_handlers() {
    let rt = runtime_with(guest_exceptions(), vec![divider()]);
    let div = |a, b| int(rt.invoke_static("t/Div", "safeDiv", "(II)I", vec![Value::Int(a), Value::Int(b)]));
    assert_eq!(div(6, 3), 2);
    assert_eq!(div(1, 0), -1);

    match rt.invoke_static("t/Div", "message", "()Ljava/lang/String;", vec![]) {
        Ok(Some(Value::Reference(Some(message)))) => assert_eq!(rt.host_string(&message).unwrap(), "/ by zero"),
        other => panic!("expected a message, got {other:?}"),
    }
}

#[test]
fn runtime_conditions_skip_handlers_without_translation() {
    let rt = runtime(vec![divider()]);
    let (kind, message) = runtime_kind(rt.invoke_static("t/Div", "safeDiv", "(II)I", vec![Value::Int(1), Value::Int(0)]));
    assert_eq!(kind, RuntimeErrorKind::Arithmetic);
    assert_eq!(message, "/ by zero");
}

fn recursion() -> ClassBuilder {
    let mut rec = ClassBuilder::new("t/Rec", Some(OBJECT));
    let recurse = rec.method_ref("t/Rec", "recurse", "()V");
    let overflow = rec.class("java/lang/StackOverflowError");
    let mut asm = Asm::new();
    asm.op(Invokestatic).u16(recurse).op(Return);
    rec.method(PS, "recurse", "()V", Code::new(0, 0, asm.finish()));

    let mut asm = Asm::new();
    asm.op(Invokestatic)
        .u16(recurse)
        .op(Iconst0)
        .op(Ireturn)
        .op(Pop)
        .op(Iconst1)
        .op(Ireturn);
    rec.method(PS, "guarded", "()I", Code::new(1, 0, asm.finish()).handler(0, 3, 5, overflow));
    rec
}

fn overflows(config: &RuntimeConfig) {
    on_guest_stack(config, || {
        let rt = runtime_with(config.clone(), vec![recursion()]);
        let (kind, _) = runtime_kind(rt.invoke_static("t/Rec", "recurse", "()V", vec![]));
        assert_eq!(kind, RuntimeErrorKind::StackOverflow);
        assert_eq!(rt.current_thread().depth(), 0);
    });
}

fn catches_overflow(config: &RuntimeConfig) {
    on_guest_stack(config, || {
        let rt = runtime_with(config.clone(), vec![recursion()]);
        assert_eq!(int(rt.invoke_static("t/Rec", "guarded", "()I", vec![])), 1);
        assert_eq!(rt.current_thread().depth(), 0);
    });
}

#[test]
fn unbounded_recursion_overflows() {
    overflows(&RuntimeConfig {
        max_call_depth: Some(64),
        ..RuntimeConfig::default()
    });
}

#[test]
fn unbounded_recursion_overflows_at_the_default_depth() {
    overflows(&RuntimeConfig::default());
}

#[test]
fn stack_overflow_is_catchable_as_a_guest_error() {
    catches_overflow(&RuntimeConfig {
        max_call_depth: Some(64),
        ..guest_exceptions()
    });
}

#[test]
fn stack_overflow_is_catchable_at_the_default_depth() {
    catches_overflow(&guest_exceptions());
}

fn natives() -> ClassBuilder {
    let mut holder = ClassBuilder::new("t/N", Some(OBJECT));
    holder.bodiless_method(PS | NATIVE, "f", "()I");
    let f = holder.method_ref("t/N", "f", "()I");
    let link_error = holder.class("java/lang/UnsatisfiedLinkError");
    let mut asm = Asm::new();
    asm.op(Invokestatic).u16(f).op(Ireturn).op(Pop).op(IconstM1).op(Ireturn);
    holder.method(PS, "tryF", "()I", Code::new(1, 0, asm.finish()).handler(0, 4, 4, link_error));
    holder
}

#[test]
fn native_methods_link_through_the_registry() {
    let rt = runtime(vec![natives()]);
    match rt.invoke_static("t/N", "f", "()I", vec![]) {
        Err(VmError::UnsatisfiedLink(key)) => assert_eq!(key, "t/N#f()I"),
        other => panic!("expected an unsatisfied link, got {other:?}"),
    }

    rt.natives().register("t/N#f()I", native(|_, _| Ok(Some(Value::Int(9)))));
    assert_eq!(int(rt.invoke_static("t/N", "f", "()I", vec![])), 9);
    assert_eq!(int(rt.invoke_static("t/N", "tryF", "()I", vec![])), 9);
}

#[test]
fn missing_natives_become_link_errors() {
    let rt = runtime_with(guest_exceptions(), vec![natives()]);
    assert_eq!(int(rt.invoke_static("t/N", "tryF", "()I", vec![])), -1);
}
