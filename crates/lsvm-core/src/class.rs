//! Class loader and descriptor (`spec.md` §4.D).
//!
//! The on-disk format carries no length prefix anywhere: a small header
//! (`compressed` flag, `version`) is followed by a flat stream mixing
//! top-level declarations (`class`, `extends`, `global`, `function`)
//! directly with the instruction bytes of each interpreted function's
//! body. `class`/`extends`/`global`/`function` occupy opcode bytes
//! `0x01..=0x04`, a range no instruction opcode ever starts in, so the
//! scanner tells a declaration from an instruction by byte value alone
//! and otherwise advances by decoding (and discarding) one instruction at
//! a time via [`crate::bytecode::skip_instruction`] — the same
//! architecture as the original loader's per-opcode skip switch
//! (`examples/original_source/lscriptlib/internal/class.c`,
//! `register_functions`/`register_static_fields`/
//! `register_field_offests`), adapted to a single scanning pass that
//! records each declaration's byte range for the later per-purpose passes
//! to re-walk.

use std::cell::RefCell;
use std::ops::Range;
use std::sync::Arc;

use lsvm_abi::NativeFn;
use rustc_hash::FxHashMap;

use crate::bytecode::{decl, func_flags, skip_instruction, Cursor};
use crate::error::{VmError, VmResult};
use crate::value::{sizeof_type, AccessModifier, AccessType, TypeTag, Value};

/// A single instance (non-static) field's storage descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    /// The field's declared type.
    pub tag: TypeTag,
    /// Whether the field is `const` (write-once at construction).
    pub modifier: AccessModifier,
    /// Byte offset into an instance's field area.
    pub offset: usize,
}

/// How a function's body is provided.
#[derive(Debug)]
pub enum FunctionKind {
    /// Interpreted body starting at this absolute offset into the owning
    /// class's `code` buffer.
    Interpreted {
        /// Offset of the first instruction.
        location: usize,
    },
    /// Body provided by a host dynamic library, resolved lazily on first
    /// call (`spec.md` §4.G.5).
    Native {
        /// Cached resolved symbol, filled in by the call bridge.
        resolved: RefCell<Option<NativeFn>>,
    },
    /// No body; calling it raises `ILLEGAL_STATE`.
    Abstract,
}

/// A function's full descriptor, shared by `Arc` between a superclass and
/// any subclass that does not override it (`spec.md` §9: "model with
/// shared ownership ... avoid per-function reference counters inline").
#[derive(Debug)]
pub struct FunctionDescriptor {
    /// Simple (unqualified) name.
    pub name: String,
    /// `simple(argsig` qualified name, unique within the owning class.
    pub qualified_name: String,
    /// Whether this is a static (class-level) function.
    pub is_static: bool,
    /// Body provenance.
    pub kind: FunctionKind,
    /// Declared return type.
    pub return_tag: TypeTag,
    /// Return class name, when `return_tag` is `Object`.
    pub return_class: Option<String>,
    /// Argument names, in declaration order.
    pub arg_names: Vec<String>,
    /// Argument types, parallel to `arg_names`.
    pub arg_types: Vec<TypeTag>,
    /// Argument class names (for object/object-array args), parallel to
    /// `arg_names`.
    pub arg_classes: Vec<Option<String>>,
    /// name -> index into `arg_names`/`arg_types`.
    pub arg_index: FxHashMap<String, usize>,
    /// Safe (underscored) name of the class that declared this function,
    /// used for native symbol mangling even after adoption by subclasses.
    pub owner_safe_name: String,
    /// Sum of `sizeof_type` over all arguments — the argument buffer's
    /// total byte length (`spec.md` §4.H).
    pub total_arg_bytes: usize,
}

impl FunctionDescriptor {
    /// Number of declared arguments.
    pub fn arg_count(&self) -> usize {
        self.arg_names.len()
    }
}

/// A loaded class: functions, fields, and the raw instruction buffer its
/// interpreted functions execute out of.
#[derive(Debug)]
pub struct Class {
    /// Fully-qualified dotted name.
    pub name: String,
    /// Dots replaced with underscores, used for native symbol mangling.
    pub safe_name: String,
    /// The linked superclass, if any.
    pub superclass: Option<Arc<Class>>,
    /// The class's owned instruction buffer (function bodies only).
    pub code: Box<[u8]>,
    /// Qualified-name -> function, including inherited entries adopted
    /// from the superclass.
    pub functions: RefCell<FxHashMap<String, Arc<FunctionDescriptor>>>,
    /// name -> current static field value.
    pub static_fields: RefCell<FxHashMap<String, Value>>,
    /// name -> instance field descriptor, including inherited fields.
    pub instance_fields: FxHashMap<String, FieldDescriptor>,
    /// Sum of instance field sizes (own plus inherited); an instance's
    /// field area is exactly this many bytes.
    pub instance_size: usize,
}

impl Class {
    /// Look up a static or instance field by name (including inherited).
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.instance_fields.get(name)
    }

    /// Look up a function by qualified name, including inherited ones.
    pub fn function(&self, qualified_name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.functions.borrow().get(qualified_name).cloned()
    }

    /// Whether `other` is this class or one of its ancestors.
    pub fn is_or_extends(&self, other: &str) -> bool {
        if self.name == other {
            return true;
        }
        match &self.superclass {
            Some(sup) => sup.is_or_extends(other),
            None => false,
        }
    }
}

/// Parsed function header, prior to resolving its body bytes against the
/// class's final `code` buffer offset.
struct ParsedFunction {
    desc: FunctionDescriptor,
}

/// Parse a class descriptor out of a linked `.lb` buffer.
///
/// `resolve_super` is consulted when the loader encounters an `extends`
/// declaration; returning `Ok(None)` leaves the superclass unlinked for
/// the registry to wire in later (`spec.md` §4.D: "the loader may be
/// asked to skip this step").
pub fn load_class(
    bytes: &[u8],
    resolve_super: &mut dyn FnMut(&str) -> VmResult<Option<Arc<Class>>>,
) -> VmResult<Class> {
    if bytes.len() < 5 {
        return Err(VmError::ClassNotFound("bytecode header truncated".into()));
    }
    let _compressed = bytes[0]; // spec.md §9: meaning undocumented, ignored.
    let _version = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let body = &bytes[5..];

    let (name, superclass_name, decls) = scan_header_declarations(body)?;
    let name = name.ok_or_else(|| VmError::ClassNotFound("missing `class` declaration".into()))?;
    let safe_name = name.replace('.', "_");

    let superclass = match &superclass_name {
        Some(sup_name) => resolve_super(sup_name)?,
        None => None,
    };

    // Pass 1: function registration, assembling the class's code buffer in
    // the same walk so each interpreted function's location can be fixed
    // up to its real offset as its body is appended.
    let mut functions = FxHashMap::default();
    let mut code = Vec::new();
    for (opcode, range) in &decls {
        if *opcode == decl::FUNCTION {
            let decl_body = &body[range.clone()];
            let mut parsed = parse_function(decl_body, &safe_name)?;
            if let FunctionKind::Interpreted { location } = &mut parsed.desc.kind {
                *location = code.len();
                append_function_body(decl_body, &mut code)?;
            }
            functions.insert(parsed.desc.qualified_name.clone(), Arc::new(parsed.desc));
        }
    }

    // Adopt inherited functions not overridden by this class.
    if let Some(sup) = &superclass {
        for (qname, func) in sup.functions.borrow().iter() {
            functions.entry(qname.clone()).or_insert_with(|| Arc::clone(func));
        }
    }

    // Pass 2: static field registration. Pass 3: field-offset assignment.
    let mut static_fields = FxHashMap::default();
    let mut instance_fields: FxHashMap<String, FieldDescriptor> =
        superclass.as_ref().map(|s| s.instance_fields.clone()).unwrap_or_default();
    let mut instance_size = superclass.as_ref().map(|s| s.instance_size).unwrap_or(0);

    for (opcode, range) in &decls {
        if *opcode != decl::GLOBAL {
            continue;
        }
        let mut c = Cursor::new(&body[range.clone()]);
        let field_name = c.read_cstr()?;
        let modifier = if c.read_u8()? == 1 { AccessModifier::Const } else { AccessModifier::Varying };
        let access = if c.read_u8()? == 1 { AccessType::Static } else { AccessType::Dynamic };
        let tag_byte = c.read_u8()?;
        let tag = TypeTag::from_byte(tag_byte)
            .ok_or_else(|| VmError::ClassNotFound(format!("bad field type tag {tag_byte:#x}")))?;

        match access {
            AccessType::Static => {
                let bits = c.read_u64()?;
                let value = Value::from_raw(tag, AccessType::Static, modifier, bits);
                static_fields.insert(field_name, value);
            }
            AccessType::Dynamic => {
                let offset = instance_size;
                instance_size += sizeof_type(tag);
                instance_fields.insert(field_name, FieldDescriptor { tag, modifier, offset });
            }
        }
    }

    Ok(Class {
        name,
        safe_name,
        superclass,
        code: code.into_boxed_slice(),
        functions: RefCell::new(functions),
        static_fields: RefCell::new(static_fields),
        instance_fields,
        instance_size,
    })
}

/// Whether `b` is one of the four top-level declaration opcodes. No
/// instruction opcode starts in this range, which is what lets the
/// scanner below tell a declaration from an instruction by byte value
/// alone.
fn is_decl_opcode(b: u8) -> bool {
    matches!(b, decl::CLASS | decl::EXTENDS | decl::GLOBAL | decl::FUNCTION)
}

/// Walk the unframed declaration/instruction stream once, returning the
/// class name, superclass name (if any), and every `global`/`function`
/// declaration's byte range (excluding its own opcode byte, matching the
/// slice `parse_function`/`append_function_body` expect) for the later
/// passes to re-walk.
///
/// A function declaration's body is not separately bounded by anything in
/// the format: after its header, the walker keeps decoding one
/// instruction at a time (`crate::bytecode::skip_instruction`) until it
/// reaches the next recognized declaration opcode or the end of the
/// buffer, exactly mirroring the original loader's linear scan.
fn scan_header_declarations(body: &[u8]) -> VmResult<(Option<String>, Option<String>, Vec<(u8, Range<usize>)>)> {
    let mut class_name = None;
    let mut superclass_name = None;
    let mut decls = Vec::new();

    let mut pos = 0usize;
    while pos < body.len() {
        let opcode = body[pos];
        match opcode {
            decl::CLASS => {
                let mut c = Cursor::at(body, pos + 1);
                class_name = Some(c.read_cstr()?);
                pos = c.pos();
            }
            decl::EXTENDS => {
                let mut c = Cursor::at(body, pos + 1);
                superclass_name = Some(c.read_cstr()?);
                pos = c.pos();
            }
            decl::GLOBAL => {
                let start = pos + 1;
                let mut c = Cursor::at(body, start);
                skip_global_payload(&mut c)?;
                decls.push((decl::GLOBAL, start..c.pos()));
                pos = c.pos();
            }
            decl::FUNCTION => {
                let start = pos + 1;
                let mut c = Cursor::at(body, start);
                let shape = skip_function_header(&mut c)?;
                if !shape.is_native && !shape.is_abstract {
                    while c.pos() < body.len() && !is_decl_opcode(body[c.pos()]) {
                        skip_instruction(&mut c)?;
                    }
                }
                decls.push((decl::FUNCTION, start..c.pos()));
                pos = c.pos();
            }
            other => {
                return Err(VmError::ClassNotFound(format!("unknown top-level declaration {other:#x}")));
            }
        }
    }

    Ok((class_name, superclass_name, decls))
}

fn skip_global_payload(c: &mut Cursor<'_>) -> VmResult<()> {
    c.read_cstr()?; // name
    c.read_u8()?; // modifier
    let access = c.read_u8()?;
    c.read_u8()?; // type tag
    if access == 1 {
        c.read_u64()?; // static initial value
    }
    Ok(())
}

/// Shape of a function header relevant to finding where its body (if any)
/// ends: whether it has one at all. Shares the header layout with
/// [`parse_function`]/`append_function_body` but only walks past it.
struct FunctionHeaderShape {
    is_native: bool,
    is_abstract: bool,
}

fn skip_function_header(c: &mut Cursor<'_>) -> VmResult<FunctionHeaderShape> {
    let flags = c.read_u8()?;
    let is_native = flags & func_flags::NATIVE != 0;
    let is_abstract = flags & func_flags::ABSTRACT != 0;

    let return_tag_byte = c.read_u8()?;
    let return_tag = TypeTag::from_byte(return_tag_byte)
        .ok_or_else(|| VmError::ClassNotFound(format!("bad return type tag {return_tag_byte:#x}")))?;
    if matches!(return_tag, TypeTag::Object) || return_tag.element_tag() == Some(TypeTag::Object) {
        c.read_cstr()?;
    }
    c.read_cstr()?; // name
    let arg_count = c.read_u8()? as usize;
    for _ in 0..arg_count {
        let tag_byte = c.read_u8()?;
        let tag = TypeTag::from_byte(tag_byte)
            .ok_or_else(|| VmError::ClassNotFound(format!("bad arg type tag {tag_byte:#x}")))?;
        if matches!(tag, TypeTag::Object) || tag.element_tag() == Some(TypeTag::Object) {
            c.read_cstr()?;
        }
        c.read_cstr()?; // arg name
    }

    Ok(FunctionHeaderShape { is_native, is_abstract })
}

fn parse_function(decl_body: &[u8], owner_safe_name: &str) -> VmResult<ParsedFunction> {
    let mut c = Cursor::new(decl_body);
    let flags = c.read_u8()?;
    let is_static = flags & func_flags::STATIC != 0;
    let is_native = flags & func_flags::NATIVE != 0;
    let is_abstract = flags & func_flags::ABSTRACT != 0;

    let return_tag_byte = c.read_u8()?;
    let return_tag = TypeTag::from_byte(return_tag_byte)
        .ok_or_else(|| VmError::ClassNotFound(format!("bad return type tag {return_tag_byte:#x}")))?;
    let return_class = if matches!(return_tag, TypeTag::Object) || return_tag.element_tag() == Some(TypeTag::Object) {
        Some(c.read_cstr()?)
    } else {
        None
    };

    let name = c.read_cstr()?;
    let arg_count = c.read_u8()? as usize;

    let mut arg_names = Vec::with_capacity(arg_count);
    let mut arg_types = Vec::with_capacity(arg_count);
    let mut arg_classes = Vec::with_capacity(arg_count);
    let mut arg_index = FxHashMap::with_capacity_and_hasher(arg_count, Default::default());
    let mut total_arg_bytes = 0usize;
    let mut qualified = String::new();
    qualified.push_str(&name);
    qualified.push('(');

    for i in 0..arg_count {
        let tag_byte = c.read_u8()?;
        let tag = TypeTag::from_byte(tag_byte)
            .ok_or_else(|| VmError::ClassNotFound(format!("bad arg type tag {tag_byte:#x}")))?;
        let class_name = if matches!(tag, TypeTag::Object) || tag.element_tag() == Some(TypeTag::Object) {
            Some(c.read_cstr()?)
        } else {
            None
        };
        let arg_name = c.read_cstr()?;

        qualified.push_str(&tag.signature_code());
        if let Some(cn) = &class_name {
            qualified.push_str(cn);
            qualified.push(';');
        }

        total_arg_bytes += sizeof_type(tag);
        arg_index.insert(arg_name.clone(), i);
        arg_names.push(arg_name);
        arg_types.push(tag);
        arg_classes.push(class_name);
    }

    let kind = if is_abstract {
        FunctionKind::Abstract
    } else if is_native {
        FunctionKind::Native { resolved: RefCell::new(None) }
    } else {
        // The remaining bytes of this declaration's body are the
        // function's instruction stream; its eventual offset within the
        // owning class's assembled `code` buffer is fixed up by
        // `append_function_body`/`load_class` and recorded there.
        FunctionKind::Interpreted { location: 0 }
    };

    Ok(ParsedFunction {
        desc: FunctionDescriptor {
            name,
            qualified_name: qualified,
            is_static,
            kind,
            return_tag,
            return_class,
            arg_names,
            arg_types,
            arg_classes,
            arg_index,
            owner_safe_name: owner_safe_name.to_owned(),
            total_arg_bytes,
        },
    })
}

/// Re-parse a function declaration's header far enough to find where its
/// instruction body starts within `decl_body`, and append those bytes to
/// the class's running `code` buffer. The caller records `code.len()`
/// before calling this as the function's fixed-up `Interpreted` location.
///
/// This duplicates the header-skipping walk from [`parse_function`]
/// rather than threading a byte range back out of it, which keeps body
/// extraction a simple function of the declaration bytes alone.
fn append_function_body(decl_body: &[u8], code: &mut Vec<u8>) -> VmResult<()> {
    let mut c = Cursor::new(decl_body);
    let flags = c.read_u8()?;
    let is_native = flags & func_flags::NATIVE != 0;
    let is_abstract = flags & func_flags::ABSTRACT != 0;

    let return_tag_byte = c.read_u8()?;
    let return_tag = TypeTag::from_byte(return_tag_byte)
        .ok_or_else(|| VmError::ClassNotFound("bad return type tag".into()))?;
    if matches!(return_tag, TypeTag::Object) || return_tag.element_tag() == Some(TypeTag::Object) {
        c.read_cstr()?;
    }
    c.read_cstr()?; // name
    let arg_count = c.read_u8()? as usize;
    for _ in 0..arg_count {
        let tag_byte = c.read_u8()?;
        let tag = TypeTag::from_byte(tag_byte).ok_or_else(|| VmError::ClassNotFound("bad arg type tag".into()))?;
        if matches!(tag, TypeTag::Object) || tag.element_tag() == Some(TypeTag::Object) {
            c.read_cstr()?;
        }
        c.read_cstr()?; // arg name
    }

    if !is_native && !is_abstract {
        let body_start = c.pos();
        code.extend_from_slice(&decl_body[body_start..]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    /// Builds an unframed `.lb` buffer: no declaration carries a length —
    /// each one is just its opcode byte directly followed by its payload,
    /// matching the real on-disk format.
    fn sample_class_bytes() -> Vec<u8> {
        let mut body = Vec::new();

        body.push(decl::CLASS);
        body.extend(encode_cstr("Hello"));

        // static int `count` = 7
        body.push(decl::GLOBAL);
        body.extend(encode_cstr("count"));
        body.push(0); // varying
        body.push(1); // static
        body.push(TypeTag::Int as u8);
        body.extend_from_slice(&7u64.to_le_bytes());

        // function main( -- static, interpreted, returns Int, no args, one Noop instruction.
        body.push(decl::FUNCTION);
        body.push(func_flags::STATIC);
        body.push(TypeTag::Int as u8);
        body.extend(encode_cstr("main"));
        body.push(0); // arg_count
        body.push(0x00); // Noop instruction byte

        let mut full = vec![0u8]; // compressed flag
        full.extend_from_slice(&1u32.to_le_bytes()); // version
        full.extend(body);
        full
    }

    #[test]
    fn loads_class_name_functions_and_statics() {
        let bytes = sample_class_bytes();
        let class = load_class(&bytes, &mut |_| Ok(None)).unwrap();
        assert_eq!(class.name, "Hello");
        assert_eq!(class.safe_name, "Hello");
        assert!(class.function("main(").is_some());
        let count = class.static_fields.borrow().get("count").copied().unwrap();
        assert_eq!(count.as_i32(), 7);
    }

    #[test]
    fn qualified_name_includes_signature() {
        let bytes = sample_class_bytes();
        let class = load_class(&bytes, &mut |_| Ok(None)).unwrap();
        let f = class.function("main(").unwrap();
        assert_eq!(f.qualified_name, "main(");
        assert_eq!(f.arg_count(), 0);
    }

    #[test]
    fn missing_class_declaration_is_an_error() {
        let mut full = vec![0u8];
        full.extend_from_slice(&1u32.to_le_bytes());
        assert!(load_class(&full, &mut |_| Ok(None)).is_err());
    }

    /// A multi-instruction function body followed by another declaration
    /// exercises the scanner's core job: finding where an unframed
    /// function body ends by decoding instructions one at a time rather
    /// than trusting a length field.
    #[test]
    fn scanner_finds_the_next_declaration_past_a_multi_instruction_body() {
        let mut body = Vec::new();
        body.push(decl::CLASS);
        body.extend(encode_cstr("Multi"));

        body.push(decl::FUNCTION);
        body.push(func_flags::STATIC);
        body.push(TypeTag::Int as u8);
        body.extend(encode_cstr("run"));
        body.push(0); // arg_count
        body.push(crate::bytecode::encode_declare_var(TypeTag::Int));
        body.extend(encode_cstr("x"));
        body.push(0x29); // SetObject
        body.extend(encode_cstr("x"));
        body.push(4); // object_kind::NULL
        body.push(0x00); // Noop

        body.push(decl::GLOBAL);
        body.extend(encode_cstr("total"));
        body.push(0);
        body.push(1);
        body.push(TypeTag::Int as u8);
        body.extend_from_slice(&3u64.to_le_bytes());

        let mut full = vec![0u8];
        full.extend_from_slice(&1u32.to_le_bytes());
        full.extend(body);

        let class = load_class(&full, &mut |_| Ok(None)).unwrap();
        assert!(class.function("run(").is_some());
        let total = class.static_fields.borrow().get("total").copied().unwrap();
        assert_eq!(total.as_i32(), 3);
    }
}
