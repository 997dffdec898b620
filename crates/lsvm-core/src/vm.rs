//! Host-facing embedding API (`spec.md` §6).
//!
//! [`Vm`] owns one [`crate::registry::Registry`] and wires together
//! classpath setup, native library loading, and main-entry execution
//! behind the shape a CLI host drives (see `lsvm-cli`).

use std::path::Path;
use std::sync::Arc;

use crate::env::Environment;
use crate::error::{VmError, VmResult};
use crate::registry::Registry;
use crate::value::{TypeTag, Value};

/// 2 GiB, the default heap size (`spec.md` §6).
pub const DEFAULT_HEAP_SIZE: usize = 2 * 1024 * 1024 * 1024;
/// 2 KiB, the default per-environment stack size (`spec.md` §6).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024;

/// Qualified name every host searches for on the classpath's main class
/// (`spec.md` §6).
pub const MAIN_QUALIFIED_NAME: &str = "main([Llscript.lang.String;";

/// Construction parameters for a [`Vm`], mirroring the CLI flags in
/// `spec.md` §6.
pub struct VmOptions {
    /// `-heaps`: total heap size in bytes.
    pub heap_size: usize,
    /// `-stacks`: per-environment stack size in bytes.
    pub stack_size: usize,
    /// `-path`: classpath directories, in probe order.
    pub classpath: Vec<std::path::PathBuf>,
    /// `-verbose`: echo diagnostic information about class loading.
    pub verbose: bool,
    /// `-verr`: echo diagnostic information for runtime errors.
    pub verr: bool,
    /// `-nodebug`: skip loading debug symbols (a no-op here; this runtime
    /// never loads a separate debug-symbol table, so the flag is accepted
    /// and recorded but otherwise inert).
    pub nodebug: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            heap_size: DEFAULT_HEAP_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            classpath: Vec::new(),
            verbose: false,
            verr: false,
            nodebug: false,
        }
    }
}

/// The result of running a main entry point: the process exit code and,
/// if execution ended in an uncaught exception, the environment that
/// recorded it (kept alive so the host can walk its frame chain for a
/// stack trace, `spec.md` §7).
pub struct RunOutcome {
    /// `0` on normal return, nonzero if `main` raised an exception.
    pub exit_code: i32,
    /// Set when `exit_code != 0`.
    pub failed_environment: Option<Environment>,
}

/// One VM instance: a class registry plus the options it was built with.
pub struct Vm {
    registry: Registry,
    options: VmOptions,
}

impl Vm {
    /// Build a VM over a fresh heap, add the configured classpath, and
    /// bootstrap the primordial classes (`spec.md` §4.E).
    pub fn new(options: VmOptions) -> VmResult<Vm> {
        let registry = Registry::new(options.heap_size)?;
        for dir in &options.classpath {
            registry.add_path(dir);
        }
        registry.bootstrap()?;
        Ok(Vm { registry, options })
    }

    /// Add a classpath entry after construction.
    pub fn add_classpath(&self, dir: impl AsRef<Path>) {
        self.registry.add_path(dir);
    }

    /// Open a native library for later symbol resolution (`spec.md` §6:
    /// "the first library is reserved for host-exported runtime
    /// symbols" — callers should load any host runtime shim first).
    pub fn load_library(&self, path: impl AsRef<Path>) -> VmResult<()> {
        self.registry.load_library(path)
    }

    /// The underlying registry, for hosts that need direct class-table
    /// access (tests, REPL-style tools).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Options this VM was constructed with.
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Locate `main_class`'s `main([Llscript.lang.String;` and run it to
    /// completion with `args` wrapped as a `lscript.lang.String[]`.
    pub fn run_main(&self, main_class: &str, args: &[String]) -> VmResult<RunOutcome> {
        let class = self.registry.load_class_with_object(main_class)?;
        let function = class
            .function(MAIN_QUALIFIED_NAME)
            .ok_or_else(|| VmError::FunctionNotFound(format!("{main_class}.{MAIN_QUALIFIED_NAME}")))?;

        if self.options.verbose {
            eprintln!("lsvm: running {main_class}.{MAIN_QUALIFIED_NAME}");
        }

        let args_value = self.build_args_array(args)?;
        let mut env = Environment::new(self.options.stack_size)?;
        match crate::interpreter::call_function(&self.registry, &mut env, &class, &function, &[args_value]) {
            Ok(_) => Ok(RunOutcome { exit_code: 0, failed_environment: None }),
            Err(e) => {
                if self.options.verr {
                    eprintln!("lsvm: {main_class} raised {e}");
                }
                Ok(RunOutcome { exit_code: 1, failed_environment: Some(env) })
            }
        }
    }

    fn build_args_array(&self, args: &[String]) -> VmResult<Value> {
        let array = self.registry.alloc_array(TypeTag::Object, args.len() as u32)?;
        for (i, arg) in args.iter().enumerate() {
            let string_value = self.registry.make_string(arg)?;
            array.set(i as i64, &string_value)?;
        }
        Ok(unsafe { Value::from_ptr(TypeTag::ObjectArray, array.0) })
    }

    /// Run one mark-and-sweep collection over `roots` plus every pinned
    /// class object.
    pub fn collect(&self, roots: &[Value]) -> crate::gc::GcStats {
        self.registry.collect(roots)
    }
}

/// Print an uncaught exception the way `spec.md` §7 describes: kind and
/// message, the function and bytecode offset it was raised at, then a
/// frame-by-frame trace of every still-active call.
pub fn print_exception_trace(env: &Environment) {
    let Some(exc) = env.exception() else { return };
    eprintln!("Uncaught {}", exc.error);
    eprintln!("  at {} (offset {:#x})", exc.function_name, exc.offset);
    for frame in env.frame_names() {
        eprintln!("  in {frame}");
    }
}

#[allow(unused)]
fn _assert_send(_: Arc<Registry>) {}
