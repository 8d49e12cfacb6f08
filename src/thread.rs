//! Logical threads and the current-thread slot.
//!
//! Only one thread runs at a time. A [`ContextGuard`] saves the slot when
//! execution may leave the interpreter (class fetches, native calls,
//! thread starts) and puts it back when dropped, so frames are always
//! pushed onto the stack of the thread that owns them.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::class::{Class, Method};
use crate::object::ObjectRef;
use crate::runtime::Runtime;
use crate::trace::{StackTrace, StackTraceElement};

/// Line value for frames without line information.
pub const UNKNOWN_LINE: i32 = -1;
/// Line value for frames running host code.
pub const NATIVE_LINE: i32 = -2;

#[derive(Debug)]
pub struct StackFrame {
    class_name: String,
    method_name: String,
    source_file: Option<String>,
    line: Cell<i32>,
}

/// A guest thread: its call stack and the `java/lang/Thread` object it
/// belongs to, if any.
#[derive(Debug, Default)]
pub struct Thread {
    object: RefCell<Option<ObjectRef>>,
    frames: RefCell<Vec<StackFrame>>,
}

impl Thread {
    pub fn new(object: Option<ObjectRef>) -> Rc<Self> {
        Rc::new(Thread {
            object: RefCell::new(object),
            frames: RefCell::new(Vec::new()),
        })
    }

    pub fn object(&self) -> Option<ObjectRef> {
        self.object.borrow().clone()
    }

    pub fn set_object(&self, object: ObjectRef) {
        *self.object.borrow_mut() = Some(object);
    }

    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    fn push(&self, class: &Class, method: &Method) {
        let line = if method.code().is_some() { UNKNOWN_LINE } else { NATIVE_LINE };
        self.frames.borrow_mut().push(StackFrame {
            class_name: class.name().to_string(),
            method_name: method.name().to_string(),
            source_file: class.source_file().map(str::to_string),
            line: Cell::new(line),
        });
    }

    fn pop(&self) {
        self.frames.borrow_mut().pop();
    }

    /// Records the source line of the innermost frame.
    pub fn set_line(&self, line: i32) {
        if let Some(frame) = self.frames.borrow().last() {
            frame.line.set(line);
        }
    }

    /// Copy of the call stack, innermost frame first.
    pub fn snapshot(&self) -> StackTrace {
        self.frames
            .borrow()
            .iter()
            .rev()
            .map(|frame| StackTraceElement {
                class_name: frame.class_name.clone(),
                method_name: frame.method_name.clone(),
                source_file: frame.source_file.clone(),
                line: frame.line.get(),
            })
            .collect()
    }
}

/// Restores the current-thread slot to the value it had when the guard was
/// created.
pub struct ContextGuard<'rt> {
    rt: &'rt Runtime,
    saved: Option<Rc<Thread>>,
}

impl<'rt> ContextGuard<'rt> {
    /// Remembers the current slot without changing it.
    pub fn capture(rt: &'rt Runtime) -> Self {
        Self {
            rt,
            saved: rt.current_slot().borrow().clone(),
        }
    }

    /// Makes `thread` current until the guard is dropped.
    pub fn enter(rt: &'rt Runtime, thread: Rc<Thread>) -> Self {
        let saved = rt.current_slot().replace(Some(thread));
        Self { rt, saved }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        *self.rt.current_slot().borrow_mut() = self.saved.take();
    }
}

/// Keeps a frame on a thread's stack for the duration of a call.
pub struct FrameGuard {
    thread: Rc<Thread>,
}

impl FrameGuard {
    pub fn push(thread: Rc<Thread>, class: &Class, method: &Method) -> Self {
        thread.push(class, method);
        Self { thread }
    }

    pub fn thread(&self) -> &Rc<Thread> {
        &self.thread
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.thread.pop();
    }
}
