//! VM registry: class table, classpath, native libraries, and the
//! class-object bootstrap (`spec.md` §4.E).
//!
//! Every field lives behind a `RefCell` so loading (which recurses through
//! superclass resolution) and execution (which allocates through the
//! manager) can both work from a shared `&Registry` — the call bridge and
//! the interpreter hold one reference each rather than juggling exclusive
//! borrows across a recursive class graph.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::class::{load_class, Class};
use crate::env::Environment;
use crate::error::{VmError, VmResult};
use crate::ffi::LibrarySet;
use crate::gc::{GcStats, Manager};
use crate::object::ArrayRef;
use crate::value::{TypeTag, Value};

/// The runtime's own root class for string instances
/// (`spec.md` §6: `Llscript.lang.String;`).
pub const STRING_CLASS: &str = "lscript.lang.String";
/// Qualified name of a class's static initializer, run to completion the
/// first time the class is loaded (`spec.md` §4.E).
pub const STATIC_INIT: &str = "<staticinit>(";

/// Primordial classes loaded (without superclass linkage) at VM creation,
/// in link order (`spec.md` §4.E).
pub const PRIMORDIAL_CLASSES: [&str; 3] = ["lscript.lang.Object", "lscript.lang.Class", STRING_CLASS];

/// Owns the class table, classpath, native libraries, and the heap/GC
/// manager for one VM instance.
pub struct Registry {
    classes: RefCell<FxHashMap<String, Arc<Class>>>,
    classpath: RefCell<Vec<PathBuf>>,
    libraries: RefCell<LibrarySet>,
    manager: RefCell<Manager>,
    /// Strong references pinning each loaded class's runtime `Class`
    /// object so it survives GC regardless of reachability
    /// (`spec.md` §4.B, §4.E).
    class_objects: RefCell<FxHashMap<String, Value>>,
}

impl Registry {
    /// Create a registry over a freshly allocated heap; the classpath
    /// starts empty.
    pub fn new(heap_size: usize) -> VmResult<Registry> {
        Ok(Registry {
            classes: RefCell::new(FxHashMap::default()),
            classpath: RefCell::new(Vec::new()),
            libraries: RefCell::new(LibrarySet::new()),
            manager: RefCell::new(Manager::new(heap_size)?),
            class_objects: RefCell::new(FxHashMap::default()),
        })
    }

    /// Append a directory to the classpath, trimming a trailing
    /// separator (`spec.md` §4.E).
    pub fn add_path(&self, dir: impl AsRef<Path>) {
        let mut path = dir.as_ref().to_path_buf();
        while path.as_os_str().to_string_lossy().ends_with(std::path::MAIN_SEPARATOR) {
            path.pop();
        }
        self.classpath.borrow_mut().push(path);
    }

    /// Open a host dynamic library and reserve the next resolution slot.
    pub fn load_library(&self, path: impl AsRef<Path>) -> VmResult<()> {
        self.libraries.borrow_mut().load(path).map_err(|e| VmError::LinkError(e.to_string()))
    }

    /// Resolve a mangled native symbol against every loaded library, in
    /// load order (`spec.md` §6).
    pub fn resolve_native(&self, safe_class_name: &str, function_name: &str) -> Option<lsvm_abi::NativeFn> {
        let symbol = format!("{safe_class_name}_{function_name}");
        self.libraries.borrow().resolve(&symbol)
    }

    /// Table lookup only; does not attempt to load.
    pub fn get_class(&self, name: &str) -> Option<Arc<Class>> {
        self.classes.borrow().get(name).cloned()
    }

    /// Return the cached class or load it from the classpath, probing
    /// each entry in insertion order for `<dir>/a/b/C.lb` given a dotted
    /// name `a.b.C` (`spec.md` §4.E, §6).
    pub fn load_class(&self, name: &str) -> VmResult<Arc<Class>> {
        if let Some(cached) = self.get_class(name) {
            return Ok(cached);
        }
        let bytes = self.read_classpath_file(name)?;
        self.load_class_binary(name, &bytes)
    }

    /// Load a class directly from a file path, under its dotted `name`.
    pub fn load_class_file(&self, name: &str, path: impl AsRef<Path>) -> VmResult<Arc<Class>> {
        if let Some(cached) = self.get_class(name) {
            return Ok(cached);
        }
        let bytes = fs::read(path.as_ref())
            .map_err(|e| VmError::ClassNotFound(format!("{}: {e}", path.as_ref().display())))?;
        self.load_class_binary(name, &bytes)
    }

    /// Load a class directly from an in-memory linked `.lb` buffer.
    pub fn load_class_binary(&self, name: &str, bytes: &[u8]) -> VmResult<Arc<Class>> {
        if let Some(cached) = self.get_class(name) {
            return Ok(cached);
        }
        let mut resolve_super = |sup_name: &str| -> VmResult<Option<Arc<Class>>> { Ok(Some(self.load_class(sup_name)?)) };
        let class = load_class(bytes, &mut resolve_super)?;
        if class.name != name {
            return Err(VmError::ClassNotFound(format!("expected class `{name}`, file declared `{}`", class.name)));
        }
        let arc = Arc::new(class);
        self.classes.borrow_mut().insert(name.to_owned(), Arc::clone(&arc));
        self.run_static_init(&arc)?;
        Ok(arc)
    }

    fn read_classpath_file(&self, name: &str) -> VmResult<Vec<u8>> {
        let relative = name.replace('.', &std::path::MAIN_SEPARATOR.to_string());
        for dir in self.classpath.borrow().iter() {
            let candidate = dir.join(format!("{relative}.lb"));
            if let Ok(bytes) = fs::read(&candidate) {
                return Ok(bytes);
            }
        }
        Err(VmError::ClassNotFound(name.to_owned()))
    }

    fn run_static_init(&self, class: &Arc<Class>) -> VmResult<()> {
        let Some(function) = class.function(STATIC_INIT) else { return Ok(()) };
        let mut env = Environment::new(4096)?;
        crate::interpreter::call_function(self, &mut env, class, &function, &[])?;
        if let Some(exc) = env.exception() {
            return Err(exc.error.clone());
        }
        Ok(())
    }

    // -- heap / GC passthroughs -------------------------------------------

    /// Allocate a zeroed instance of `class`.
    pub fn alloc_object(&self, class: &Arc<Class>) -> VmResult<crate::object::ObjectRef> {
        self.manager.borrow_mut().alloc_object(class)
    }

    /// Allocate a zeroed array of `length` elements of `element_tag`.
    pub fn alloc_array(&self, element_tag: TypeTag, length: u32) -> VmResult<ArrayRef> {
        self.manager.borrow_mut().alloc_array(element_tag, length)
    }

    /// Construct a `String` instance wrapping `text` (`spec.md` §4.G
    /// "Object set", `string` sub-opcode; §9: "treat `String` as an
    /// opaque wrapper exposing `chars`").
    pub fn make_string(&self, text: &str) -> VmResult<Value> {
        let string_class = self.load_class(STRING_CLASS)?;
        let chars_field = string_class
            .field("chars")
            .copied()
            .ok_or_else(|| VmError::FieldNotFound("chars".into()))?;

        let bytes = text.as_bytes();
        let array = self.alloc_array(TypeTag::Char, bytes.len() as u32)?;
        for (i, b) in bytes.iter().enumerate() {
            array.set(i as i64, &Value::from_raw(TypeTag::Char, crate::value::AccessType::Dynamic, crate::value::AccessModifier::Varying, *b as u64))?;
        }

        let obj = self.alloc_object(&string_class)?;
        let array_value = unsafe { Value::from_ptr(TypeTag::CharArray, array.0) };
        obj.write_field(&chars_field, &array_value);
        Ok(unsafe { Value::from_ptr(TypeTag::Object, obj.0) })
    }

    /// Pin a value so it survives collection regardless of reachability.
    pub fn create_strong_reference(&self, value: &Value) {
        self.manager.borrow_mut().create_strong_reference(value);
    }

    /// Release a previous pin.
    pub fn destroy_strong_reference(&self, value: &Value) {
        self.manager.borrow_mut().destroy_strong_reference(value);
    }

    /// Run one mark-and-sweep cycle rooted at `roots`, plus every pinned
    /// class-object strong reference.
    pub fn collect(&self, roots: &[Value]) -> GcStats {
        self.manager.borrow_mut().gc(roots)
    }

    /// Current heap occupancy snapshot.
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.manager.borrow().heap_stats()
    }

    /// Bootstrap the three primordial classes and pin a `Class` runtime
    /// object for each loaded class thereafter (`spec.md` §4.E).
    ///
    /// The primordial classes are loaded without superclass linkage (none
    /// declare an `extends`); this registry does not separately "fix up"
    /// their superclass pointers, since `lscript.lang.Object` has none and
    /// `Class`/`String` link to it normally through their own `extends`
    /// declaration once present on the classpath.
    pub fn bootstrap(&self) -> VmResult<()> {
        for name in PRIMORDIAL_CLASSES {
            let class = self.load_class(name)?;
            self.register_class_object(name, &class)?;
        }
        Ok(())
    }

    fn register_class_object(&self, name: &str, class: &Arc<Class>) -> VmResult<()> {
        if self.class_objects.borrow().contains_key(name) {
            return Ok(());
        }
        let Some(class_class) = self.get_class("lscript.lang.Class") else {
            // Bootstrapping `Class` itself: nothing to wrap with yet.
            return Ok(());
        };
        let handle_field = match class_class.field("handle") {
            Some(f) => *f,
            None => return Ok(()),
        };
        let obj = self.alloc_object(&class_class)?;
        obj.write_field(&handle_field, &Value::from_raw(TypeTag::Long, crate::value::AccessType::Dynamic, crate::value::AccessModifier::Varying, Arc::as_ptr(class) as u64));
        if let Some(name_field) = class_class.field("name") {
            let name_value = self.make_string(name)?;
            obj.write_field(name_field, &name_value);
        }
        let value = unsafe { Value::from_ptr(TypeTag::Object, obj.0) };
        self.create_strong_reference(&value);
        self.class_objects.borrow_mut().insert(name.to_owned(), value);
        Ok(())
    }

    /// Load a non-primordial class and register its `Class` object, for
    /// host code or tests that load classes one at a time after bootstrap.
    pub fn load_class_with_object(&self, name: &str) -> VmResult<Arc<Class>> {
        let class = self.load_class(name)?;
        self.register_class_object(name, &class)?;
        Ok(class)
    }
}
