//! Class loaders and the class byte sources behind them.
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::class::Class;
use crate::descriptor::PrimitiveType;
use crate::error::{FormatError, Result, VmError};
use crate::jvm::{read_class_file, JVMParser};
use crate::native::NativeRegistry;
use crate::runtime::Runtime;
use crate::thread::ContextGuard;

/// Supplier of class bytes by internal name (`java/lang/Object`, no
/// `.class` suffix). `Ok(None)` means the source does not have the class.
pub trait ClassSource {
    fn find_class(&self, name: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Internal binary names: slash separated segments without `.`, `;`, `[`
/// or `\`.
fn is_binary_name(name: &str) -> bool {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| {
        Regex::new(r"^[^/.;\[\\]+(/[^/.;\[\\]+)*$").unwrap_or_else(|_| unreachable!("pattern is valid"))
    })
    .is_match(name)
}

/// Looks classes up as `<root>/<name>.class` under a list of roots, first
/// match wins.
#[derive(Debug, Clone)]
pub struct DirectoryClassSource {
    roots: Vec<PathBuf>,
}

impl DirectoryClassSource {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl ClassSource for DirectoryClassSource {
    fn find_class(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        if !is_binary_name(name) {
            return Ok(None);
        }
        for root in &self.roots {
            let path = root.join(format!("{name}.class"));
            match read_class_file(&path) {
                Ok(bytes) => {
                    debug!(path = %path.display(), "read class file");
                    return Ok(Some(bytes));
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

/// In-memory class bytes, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryClassSource {
    classes: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryClassSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: Vec<u8>) {
        self.classes.borrow_mut().insert(name.into(), bytes);
    }

    pub fn with(self, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl ClassSource for MemoryClassSource {
    fn find_class(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.classes.borrow().get(name).cloned())
    }
}

/// Owns the classes defined through it and the native methods bound to
/// them. Lookups delegate to the parent first.
pub struct ClassLoader {
    name: String,
    parent: Option<Rc<ClassLoader>>,
    source: Option<Box<dyn ClassSource>>,
    classes: RefCell<HashMap<String, Rc<Class>>>,
    natives: NativeRegistry,
    this: Weak<ClassLoader>,
}

impl ClassLoader {
    pub fn new(
        name: impl Into<String>,
        parent: Option<Rc<ClassLoader>>,
        source: Option<Box<dyn ClassSource>>,
    ) -> Rc<Self> {
        let name = name.into();
        Rc::new_cyclic(|this| ClassLoader {
            name,
            parent,
            source,
            classes: RefCell::new(HashMap::new()),
            natives: NativeRegistry::new(),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Rc<ClassLoader>> {
        self.parent.as_ref()
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Class defined by this loader under `name`, without delegation.
    pub fn find_loaded(&self, name: &str) -> Option<Rc<Class>> {
        self.classes.borrow().get(name).cloned()
    }

    /// Registers a class. Redefining a name keeps the first class and
    /// returns it.
    pub fn define_class(&self, class: Rc<Class>) -> Rc<Class> {
        let mut classes = self.classes.borrow_mut();
        if let Some(existing) = classes.get(class.name()) {
            warn!(class = class.name(), loader = %self.name, "class already defined, keeping the first definition");
            return existing.clone();
        }
        debug!(class = class.name(), loader = %self.name, "defined class");
        classes.insert(class.name().to_string(), class.clone());
        class
    }

    /// Decodes and defines class bytes. The class is not initialized.
    pub fn define_class_file(&self, bytes: &[u8]) -> Result<Rc<Class>> {
        let file = JVMParser::parse(bytes)?;
        let class = Class::from_class_file(file, self.this.clone())?;
        Ok(self.define_class(class))
    }

    /// Loads and links a class by internal name or field descriptor.
    ///
    /// Single primitive codes map to the primitive classes, `[` prefixes
    /// to array classes and `L...;` to the named class. Plain names are
    /// looked up here, then in the parent, then fetched from the source.
    /// The class stays defined when linking fails.
    pub fn load_class(&self, rt: &Runtime, name: &str) -> Result<Rc<Class>> {
        let class = self.find_or_define(rt, name)?;
        class.link(rt)?;
        Ok(class)
    }

    fn find_or_define(&self, rt: &Runtime, name: &str) -> Result<Rc<Class>> {
        let bytes = name.as_bytes();
        if bytes.len() == 1 {
            if let Some(primitive) = PrimitiveType::from_code(bytes[0]) {
                return Ok(rt.primitive_class(primitive));
            }
        }
        match bytes.first() {
            Some(b'[') => return Ok(self.load_class(rt, &name[1..])?.array_class()),
            Some(b'L') if name.ends_with(';') => return self.load_class(rt, &name[1..name.len() - 1]),
            Some(b'(') | None => {
                return Err(FormatError::BadDescriptor {
                    descriptor: name.to_string(),
                    position: 0,
                }
                .into())
            }
            _ => {}
        }

        if let Some(class) = self.find_loaded(name) {
            return Ok(class);
        }
        if let Some(parent) = &self.parent {
            match parent.load_class(rt, name) {
                Err(VmError::ClassNotFound(missing)) if missing == name => {}
                other => return other,
            }
        }
        if let Some(source) = &self.source {
            let fetched = {
                let _context = ContextGuard::capture(rt);
                source.find_class(name).map_err(|source| VmError::Io {
                    name: name.to_string(),
                    source,
                })?
            };
            if let Some(bytes) = fetched {
                self.define_class_file(&bytes)?;
            }
        }
        self.find_loaded(name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }
}
