//! End-to-end scenarios exercising the class loader, interpreter, and
//! registry together: a static call that returns a value, virtual
//! dispatch through a `new`'d instance, array bounds, a multi-branch
//! `if`/`elif`/`else` chain, a GC sweep, and a failed native link. Each
//! test hand-assembles a minimal linked `.lb` buffer the same way
//! `class.rs`'s own unit tests do — no declaration carries a length
//! prefix; a `function` declaration's body runs until the next
//! recognized declaration opcode or end of buffer — then drives it
//! through `Registry`/`interpreter::call_function` exactly as a host
//! would.

use std::collections::HashMap;
use std::fs;

use lsvm_core::bytecode::{arith_op, decl, func_flags, literal_kind, object_kind, operand_kind, return_kind};
use lsvm_core::env::Environment;
use lsvm_core::error::VmError;
use lsvm_core::registry::Registry;
use lsvm_core::value::TypeTag;

fn cstr(s: &str) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    v
}

fn declare_opcode(tag: TypeTag) -> u8 {
    0x10 + tag as u8
}

fn wrap_class(body: Vec<u8>) -> Vec<u8> {
    let mut full = vec![0u8];
    full.extend_from_slice(&1u32.to_le_bytes());
    full.extend(body);
    full
}

/// A non-static, zero-argument, empty-body constructor usable as a
/// `new` target: `<init>( { ret }`.
fn trivial_ctor() -> Vec<u8> {
    let mut body = vec![0u8]; // flags: not static, not native, not abstract
    body.push(TypeTag::Int as u8); // return tag (unused)
    body.extend(cstr("<init>"));
    body.push(0); // arg_count
    body.push(0x30); // Return
    body.push(return_kind::VOID);
    body
}

fn write_class(dir: &std::path::Path, name: &str, bytes: &[u8]) {
    let relative = name.replace('.', std::path::MAIN_SEPARATOR_STR);
    let path = dir.join(format!("{relative}.lb"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

/// A tiny byte-code assembler for instruction streams that need forward
/// jump targets: `label` records the current position under a name,
/// `patch_u64` reserves 8 placeholder bytes to be filled in once every
/// label has been recorded.
#[derive(Default)]
struct Asm {
    bytes: Vec<u8>,
    labels: HashMap<&'static str, usize>,
    patches: Vec<(usize, &'static str)>,
}

impl Asm {
    fn label(&mut self, name: &'static str) {
        self.labels.insert(name, self.bytes.len());
    }

    fn push_bytes(&mut self, b: &[u8]) {
        self.bytes.extend_from_slice(b);
    }

    fn patch_u64(&mut self, target: &'static str) {
        let at = self.bytes.len();
        self.bytes.extend_from_slice(&0u64.to_le_bytes());
        self.patches.push((at, target));
    }

    /// Same as `patch_u64` but the target is the position right after
    /// this very placeholder (used by `else`, which always jumps
    /// straight into its own body).
    fn patch_u64_here(&mut self) {
        let at = self.bytes.len();
        self.bytes.extend_from_slice(&0u64.to_le_bytes());
        let here = at + 8;
        self.bytes[at..at + 8].copy_from_slice(&(here as u64).to_le_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        for (at, target) in &self.patches {
            let pos = *self.labels.get(target).unwrap_or_else(|| panic!("undefined label {target}")) as u64;
            self.bytes[*at..*at + 8].copy_from_slice(&pos.to_le_bytes());
        }
        self.bytes
    }
}

#[test]
fn static_call_returns_a_value_through_the_register() {
    let dir = tempfile::tempdir().unwrap();

    // helper( -- static, returns Int 42.
    let mut helper = vec![func_flags::STATIC];
    helper.push(TypeTag::Int as u8);
    helper.extend(cstr("helper"));
    helper.push(0);
    helper.push(0x30); // Return
    helper.push(return_kind::DWORD);
    helper.extend_from_slice(&42u32.to_le_bytes());

    // main( -- static, calls helper(, copies the return register into
    // a local, and returns it.
    let mut main = vec![func_flags::STATIC];
    main.push(TypeTag::Int as u8);
    main.extend(cstr("main"));
    main.push(0);
    main.push(declare_opcode(TypeTag::Int));
    main.extend(cstr("result"));
    main.push(0x40); // StaticCall
    main.extend(cstr("")); // current class
    main.extend(cstr("helper("));
    main.push(0); // zero args
    main.push(0x2B); // SetReturn
    main.extend(cstr("result"));
    main.push(0x30); // Return
    main.push(return_kind::VAR);
    main.extend(cstr("result"));

    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Greeter"));
    body.push(decl::FUNCTION);
    body.extend(helper);
    body.push(decl::FUNCTION);
    body.extend(main);
    write_class(dir.path(), "Greeter", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Greeter").unwrap();
    let function = class.function("main(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 42);
}

#[test]
fn arithmetic_adds_two_locals_and_returns_their_destination_typed_sum() {
    let dir = tempfile::tempdir().unwrap();

    let mut main = vec![func_flags::STATIC];
    main.push(TypeTag::Int as u8);
    main.extend(cstr("main"));
    main.push(0);
    main.push(declare_opcode(TypeTag::Int));
    main.extend(cstr("x"));
    main.push(0x28); // SetLiteral
    main.push(literal_kind::DWORD);
    main.extend(cstr("x"));
    main.extend_from_slice(&3u32.to_le_bytes());
    main.push(declare_opcode(TypeTag::Int));
    main.extend(cstr("y"));
    main.push(0x28);
    main.push(literal_kind::DWORD);
    main.extend(cstr("y"));
    main.extend_from_slice(&4u32.to_le_bytes());
    main.push(0x50); // Arithmetic
    main.push(arith_op::ADD);
    main.extend(cstr("x"));
    main.extend(cstr("x"));
    main.push(operand_kind::VALUE);
    main.extend(cstr("y"));
    main.push(0x30);
    main.push(return_kind::VAR);
    main.extend(cstr("x"));

    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Arith"));
    body.push(decl::FUNCTION);
    body.extend(main);
    write_class(dir.path(), "Arith", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Arith").unwrap();
    let function = class.function("main(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 7);
}

#[test]
fn array_length_is_readable_and_out_of_bounds_access_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let mut good = vec![func_flags::STATIC];
    good.push(TypeTag::UInt as u8);
    good.extend(cstr("good"));
    good.push(0);
    good.push(declare_opcode(TypeTag::IntArray));
    good.extend(cstr("arr"));
    good.push(0x29); // SetObject
    good.extend(cstr("arr"));
    good.push(object_kind::ARRAY);
    good.push(TypeTag::Int as u8);
    good.extend_from_slice(&3u32.to_le_bytes());
    good.push(declare_opcode(TypeTag::UInt));
    good.extend(cstr("len"));
    good.push(0x2A); // SetVar
    good.extend(cstr("len"));
    good.extend(cstr("arr.length"));
    good.push(0x30);
    good.push(return_kind::VAR);
    good.extend(cstr("len"));

    let mut bad = vec![func_flags::STATIC];
    bad.push(TypeTag::Int as u8);
    bad.extend(cstr("bad"));
    bad.push(0);
    bad.push(declare_opcode(TypeTag::IntArray));
    bad.extend(cstr("arr"));
    bad.push(0x29);
    bad.extend(cstr("arr"));
    bad.push(object_kind::ARRAY);
    bad.push(TypeTag::Int as u8);
    bad.extend_from_slice(&3u32.to_le_bytes());
    bad.push(declare_opcode(TypeTag::Int));
    bad.extend(cstr("x"));
    bad.push(0x2A);
    bad.extend(cstr("x"));
    bad.extend(cstr("arr[10]"));
    bad.push(0x30);
    bad.push(return_kind::VAR);
    bad.extend(cstr("x"));

    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Arrays"));
    body.push(decl::FUNCTION);
    body.extend(good);
    body.push(decl::FUNCTION);
    body.extend(bad);
    write_class(dir.path(), "Arrays", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Arrays").unwrap();

    let good_fn = class.function("good(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &good_fn, &[]).unwrap();
    assert_eq!(result.as_u32(), 3);

    let bad_fn = class.function("bad(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let err = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &bad_fn, &[]).unwrap_err();
    assert!(matches!(err, VmError::BadArrayIndex { index: 10, length: 3 }));
}

#[test]
fn dynamic_call_dispatches_on_the_receivers_concrete_class() {
    let dir = tempfile::tempdir().unwrap();

    let mut base_greet = vec![0u8]; // non-static
    base_greet.push(TypeTag::Int as u8);
    base_greet.extend(cstr("greet"));
    base_greet.push(0);
    base_greet.push(0x30);
    base_greet.push(return_kind::DWORD);
    base_greet.extend_from_slice(&1u32.to_le_bytes());

    let mut base_body = Vec::new();
    base_body.push(decl::CLASS);
    base_body.extend(cstr("Base"));
    base_body.push(decl::FUNCTION);
    base_body.extend(trivial_ctor());
    base_body.push(decl::FUNCTION);
    base_body.extend(base_greet);
    write_class(dir.path(), "Base", &wrap_class(base_body));

    let mut derived_greet = vec![0u8];
    derived_greet.push(TypeTag::Int as u8);
    derived_greet.extend(cstr("greet"));
    derived_greet.push(0);
    derived_greet.push(0x30);
    derived_greet.push(return_kind::DWORD);
    derived_greet.extend_from_slice(&2u32.to_le_bytes());

    let mut derived_body = Vec::new();
    derived_body.push(decl::CLASS);
    derived_body.extend(cstr("Derived"));
    derived_body.push(decl::EXTENDS);
    derived_body.extend(cstr("Base"));
    derived_body.push(decl::FUNCTION);
    derived_body.extend(derived_greet);
    write_class(dir.path(), "Derived", &wrap_class(derived_body));

    let mut main = vec![func_flags::STATIC];
    main.push(TypeTag::Int as u8);
    main.extend(cstr("main"));
    main.push(0);
    main.push(declare_opcode(TypeTag::Object));
    main.extend(cstr("obj"));
    main.push(0x29); // SetObject
    main.extend(cstr("obj"));
    main.push(object_kind::NEW);
    main.extend(cstr("Derived"));
    main.extend(cstr("<init>("));
    main.push(0); // zero ctor args
    main.push(declare_opcode(TypeTag::Int));
    main.extend(cstr("result"));
    main.push(0x41); // DynamicCall
    main.extend(cstr("obj"));
    main.extend(cstr("greet("));
    main.push(0);
    main.push(0x2B); // SetReturn
    main.extend(cstr("result"));
    main.push(0x30);
    main.push(return_kind::VAR);
    main.extend(cstr("result"));

    let mut main_body = Vec::new();
    main_body.push(decl::CLASS);
    main_body.extend(cstr("Main"));
    main_body.push(decl::FUNCTION);
    main_body.extend(main);
    write_class(dir.path(), "Main", &wrap_class(main_body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Main").unwrap();
    let function = class.function("main(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 2, "dispatch must pick Derived::greet, not the inherited Base one");
}

/// Assembles `branch(` with two baked-in locals `x`/`y` so that exactly
/// one of the `if`/`elif`/`else` arms fires, depending on `(x, y)`:
///
/// ```text
/// if    x    -> @elif    result = 10; end -> @done
/// @elif: elif <cleanup> y -> @else   result = 20; end -> @done
/// @else: else -> (falls straight into its own body)
///                result = 30
/// @done: return result
/// ```
///
/// `elif`'s leading `<cleanup-off>` field (`spec.md` §4.G) is encoded as
/// a dummy `0` and only ever decoded-and-discarded, never acted on,
/// matching this interpreter's dispatch.
fn branch_function(x: i32, y: i32) -> Vec<u8> {
    let mut header = vec![func_flags::STATIC];
    header.push(TypeTag::Int as u8);
    header.extend(cstr("branch"));
    header.push(0); // arg_count

    let mut a = Asm::default();
    a.push_bytes(&[declare_opcode(TypeTag::Int)]);
    a.push_bytes(&cstr("x"));
    a.push_bytes(&[0x28, literal_kind::DWORD]);
    a.push_bytes(&cstr("x"));
    a.push_bytes(&x.to_le_bytes());

    a.push_bytes(&[declare_opcode(TypeTag::Int)]);
    a.push_bytes(&cstr("y"));
    a.push_bytes(&[0x28, literal_kind::DWORD]);
    a.push_bytes(&cstr("y"));
    a.push_bytes(&y.to_le_bytes());

    a.push_bytes(&[declare_opcode(TypeTag::Int)]);
    a.push_bytes(&cstr("result"));

    // if x -> @elif
    a.push_bytes(&[0x60, 0xFF, operand_kind::VALUE]);
    a.push_bytes(&cstr("x"));
    a.patch_u64("elif");

    // if-body: result = 10; end -> @done
    a.push_bytes(&[0x28, literal_kind::DWORD]);
    a.push_bytes(&cstr("result"));
    a.push_bytes(&10i32.to_le_bytes());
    a.push_bytes(&[0x63]);
    a.patch_u64("done");

    // elif <cleanup=0> y -> @else
    a.label("elif");
    a.push_bytes(&[0x61]);
    a.push_bytes(&0u64.to_le_bytes()); // cleanup-off, discarded
    a.push_bytes(&[0xFF, operand_kind::VALUE]);
    a.push_bytes(&cstr("y"));
    a.patch_u64("else");

    // elif-body: result = 20; end -> @done
    a.push_bytes(&[0x28, literal_kind::DWORD]);
    a.push_bytes(&cstr("result"));
    a.push_bytes(&20i32.to_le_bytes());
    a.push_bytes(&[0x63]);
    a.patch_u64("done");

    // else -> (its own body, right next)
    a.label("else");
    a.push_bytes(&[0x62]);
    a.patch_u64_here();

    // else-body: result = 30
    a.push_bytes(&[0x28, literal_kind::DWORD]);
    a.push_bytes(&cstr("result"));
    a.push_bytes(&30i32.to_le_bytes());

    a.label("done");
    a.push_bytes(&[0x30, return_kind::VAR]);
    a.push_bytes(&cstr("result"));

    let mut body = header;
    body.extend(a.finish());
    body
}

#[test]
fn if_branch_fires_when_the_leading_comparator_is_truthy() {
    let dir = tempfile::tempdir().unwrap();
    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Branchy"));
    body.push(decl::FUNCTION);
    body.extend(branch_function(1, 0));
    write_class(dir.path(), "Branchy", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Branchy").unwrap();
    let function = class.function("branch(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 10);
}

#[test]
fn elif_branch_fires_when_if_fails_but_elif_is_truthy() {
    let dir = tempfile::tempdir().unwrap();
    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Branchy"));
    body.push(decl::FUNCTION);
    body.extend(branch_function(0, 1));
    write_class(dir.path(), "Branchy", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Branchy").unwrap();
    let function = class.function("branch(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 20);
}

#[test]
fn else_branch_fires_when_both_if_and_elif_fail() {
    let dir = tempfile::tempdir().unwrap();
    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Branchy"));
    body.push(decl::FUNCTION);
    body.extend(branch_function(0, 0));
    write_class(dir.path(), "Branchy", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Branchy").unwrap();
    let function = class.function("branch(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let result = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap();
    assert_eq!(result.as_i32(), 30);
}

#[test]
fn native_function_with_no_loaded_library_fails_to_link() {
    let dir = tempfile::tempdir().unwrap();

    let mut missing = vec![func_flags::STATIC | func_flags::NATIVE];
    missing.push(TypeTag::Int as u8);
    missing.extend(cstr("missing"));
    missing.push(0);

    let mut body = Vec::new();
    body.push(decl::CLASS);
    body.extend(cstr("Natives"));
    body.push(decl::FUNCTION);
    body.extend(missing);
    write_class(dir.path(), "Natives", &wrap_class(body));

    let registry = Registry::new(1 << 20).unwrap();
    registry.add_path(dir.path());
    let class = registry.load_class("Natives").unwrap();
    let function = class.function("missing(").unwrap();
    let mut env = Environment::new(4096).unwrap();
    let err = lsvm_core::interpreter::call_function(&registry, &mut env, &class, &function, &[]).unwrap_err();
    assert!(matches!(err, VmError::LinkError(_)));
}

#[test]
fn collecting_with_no_roots_reclaims_every_allocation() {
    let registry = Registry::new(1 << 20).unwrap();
    for _ in 0..8 {
        registry.alloc_array(TypeTag::Int, 16).unwrap();
    }
    let stats = registry.collect(&[]);
    assert_eq!(stats.live, 0);
}

#[test]
fn a_strongly_referenced_allocation_survives_a_collection() {
    let registry = Registry::new(1 << 20).unwrap();
    let arr = registry.alloc_array(TypeTag::Int, 4).unwrap();
    let value = unsafe { lsvm_core::value::Value::from_ptr(TypeTag::IntArray, arr.0) };
    registry.create_strong_reference(&value);
    let stats = registry.collect(&[]);
    assert_eq!(stats.live, 1);
    registry.destroy_strong_reference(&value);
    let stats = registry.collect(&[]);
    assert_eq!(stats.live, 0);
}
