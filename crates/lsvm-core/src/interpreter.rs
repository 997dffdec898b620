//! The bytecode dispatch loop (`spec.md` §4.G, §4.H).
//!
//! Every call — `static_call`, `dynamic_call`, a `new` constructor
//! invocation, and a class's `<staticinit>(` — is driven through
//! [`enter_and_run`], which pushes one call frame and recurses into
//! [`run`] until that frame's own `ret*` instruction pops it. This
//! mirrors bytecode call depth onto the native Rust call stack instead of
//! cooperatively threading a single flat dispatch loop through saved
//! instruction pointers; every pushed frame therefore carries
//! [`crate::env::FRAME_RETURN_NATIVE`] (every call is, from the
//! dispatch loop's point of view, a "return to native" call). Recorded as
//! a simplification of `spec.md` §4.G/§4.H's cooperative-loop phrasing in
//! `DESIGN.md`.
//!
//! Control-flow markers resolve an ambiguity `spec.md` §4.G leaves open
//! (see `DESIGN.md`): `if`/`elif`/`while` always evaluate their own
//! comparator and jump to their `<off>` on failure; `else`/`end` always
//! perform an unconditional jump to their `<cleanup-off>`, whether
//! reached by fallthrough or as a jump target. A loop's back-edge and
//! each non-final branch's "skip the rest" edge are both expressed with
//! an `end` opcode placed at the close of the relevant body. `elif`
//! additionally carries a leading `<cleanup-off>` field ahead of its
//! comparator, unlike `if`/`while`; this dispatch loop reads and
//! discards it before evaluating the comparator exactly as `if` does
//! (see `DESIGN.md`). Any offset equal to [`crate::bytecode::NO_BRANCH`]
//! ("proceed forward", `spec.md` §4.G) falls through to the next
//! instruction instead of jumping, for both the conditional and
//! unconditional forms.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::sync::Arc;

use lsvm_abi::NativeFn;

use crate::bytecode::{arith_op, comparator, literal_kind, object_kind, operand_kind, return_kind, unary_op, Cursor, Opcode, NO_BRANCH};
use crate::class::{Class, FunctionDescriptor, FunctionKind};
use crate::env::{CodeLocation, Environment};
use crate::error::{VmError, VmResult};
use crate::object::{ArrayRef, ObjectRef};
use crate::registry::Registry;
use crate::value::{AccessModifier, AccessType, TypeTag, Value};

enum AfterInstr {
    Advance,
    Jump(usize),
    Halted,
}

/// Run the environment's dispatch loop until its instruction pointer
/// becomes `None` (a `FRAME_RETURN_NATIVE` frame popped) or an exception
/// is recorded.
pub fn run(registry: &Registry, env: &mut Environment) -> VmResult<()> {
    loop {
        if env.exception().is_some() || env.ip().is_none() {
            return Ok(());
        }
        step(registry, env)?;
    }
}

/// Call `function` on `class` with no receiver and return its produced
/// value, propagating any exception raised during execution.
pub fn call_function(
    registry: &Registry,
    env: &mut Environment,
    class: &Arc<Class>,
    function: &Arc<FunctionDescriptor>,
    args: &[Value],
) -> VmResult<Value> {
    enter_and_run(registry, env, class, function, None, args)
}

fn enter_and_run(
    registry: &Registry,
    env: &mut Environment,
    class: &Arc<Class>,
    function: &Arc<FunctionDescriptor>,
    receiver: Option<Value>,
    args: &[Value],
) -> VmResult<Value> {
    match &function.kind {
        FunctionKind::Abstract => {
            Err(VmError::IllegalState(format!("abstract function {} reached", function.qualified_name)))
        }
        FunctionKind::Native { resolved } => {
            let native = resolve_native_cached(registry, function, resolved)?;
            Ok(unsafe { crate::ffi::invoke(native, env as *mut Environment, class, args, function.return_tag) })
        }
        FunctionKind::Interpreted { location } => {
            env.push_frame(None, Arc::clone(function), Arc::clone(class), crate::env::FRAME_RETURN_NATIVE)?;
            if let Some(recv) = receiver {
                let offset = env.push_value(recv)?;
                env.bind_existing("this", offset);
            }
            for (i, name) in function.arg_names.iter().enumerate() {
                let tag = function.arg_types[i];
                let value = args.get(i).copied().unwrap_or_else(|| Value::new(tag, AccessType::Dynamic, AccessModifier::Varying));
                let slot = env.push_value(value)?;
                env.bind_existing(name, slot);
            }
            env.set_ip(Some(CodeLocation { class: Arc::clone(class), offset: *location }));
            run(registry, env)?;
            if let Some(exc) = env.exception() {
                return Err(exc.error.clone());
            }
            Ok(env.registers.get_as(function.return_tag))
        }
    }
}

fn resolve_native_cached(
    registry: &Registry,
    function: &Arc<FunctionDescriptor>,
    resolved: &RefCell<Option<NativeFn>>,
) -> VmResult<NativeFn> {
    if let Some(f) = *resolved.borrow() {
        return Ok(f);
    }
    let symbol = registry
        .resolve_native(&function.owner_safe_name, &function.name)
        .ok_or_else(|| VmError::LinkError(format!("{}_{}", function.owner_safe_name, function.name)))?;
    *resolved.borrow_mut() = Some(symbol);
    Ok(symbol)
}

fn step(registry: &Registry, env: &mut Environment) -> VmResult<()> {
    let loc = env.ip().cloned().expect("run() only calls step() while the instruction pointer is set");
    let code: &[u8] = &loc.class.code;
    let mut c = Cursor::at(code, loc.offset);

    let opcode_byte = match c.read_u8() {
        Ok(b) => b,
        Err(e) => {
            env.raise(e, current_function_name(env), loc.offset);
            return Ok(());
        }
    };

    match dispatch(registry, env, &loc.class, &mut c, opcode_byte) {
        Ok(AfterInstr::Advance) => env.set_ip(Some(CodeLocation { class: Arc::clone(&loc.class), offset: c.pos() })),
        Ok(AfterInstr::Jump(target)) => env.set_ip(Some(CodeLocation { class: Arc::clone(&loc.class), offset: target })),
        Ok(AfterInstr::Halted) => {}
        Err(e) => env.raise(e, current_function_name(env), loc.offset),
    }
    Ok(())
}

fn current_function_name(env: &Environment) -> String {
    env.current_function().map(|f| f.qualified_name.clone()).unwrap_or_else(|| "<entry>".to_owned())
}

fn dispatch(registry: &Registry, env: &mut Environment, class: &Arc<Class>, c: &mut Cursor<'_>, opcode_byte: u8) -> VmResult<AfterInstr> {
    if let Some(tag) = crate::bytecode::decode_declare_var(opcode_byte) {
        let name = c.read_cstr()?;
        env.declare_var(&name, tag)?;
        return Ok(AfterInstr::Advance);
    }

    let opcode = Opcode::from_byte(opcode_byte).ok_or(VmError::BadCommand { opcode: opcode_byte })?;
    match opcode {
        Opcode::Noop => Ok(AfterInstr::Advance),
        Opcode::DeclareVar => unreachable!("handled via decode_declare_var above"),
        Opcode::SetLiteral => {
            do_set_literal(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::SetObject => {
            do_set_object(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::SetVar => {
            do_set_var(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::SetReturn => {
            do_set_return(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::Return => do_return(c, env, registry),
        Opcode::StaticCall => {
            do_static_call(c, env, registry, class)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::DynamicCall => {
            do_dynamic_call(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::Arithmetic => {
            do_arithmetic(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::Unary => {
            do_unary(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::Cast => {
            do_cast(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::If | Opcode::While => do_conditional(c, env, registry),
        Opcode::Elif => {
            let _cleanup_off = c.read_u64()?;
            do_conditional(c, env, registry)
        }
        Opcode::Else | Opcode::End => do_unconditional(c),
        Opcode::Push => {
            do_push(c, env, registry)?;
            Ok(AfterInstr::Advance)
        }
        Opcode::Pop => {
            do_pop(c, env)?;
            Ok(AfterInstr::Advance)
        }
    }
}

// -- set family -----------------------------------------------------------

fn do_set_literal(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let kind = c.read_u8()?;
    let dst = c.read_cstr()?;
    let bits = match kind {
        literal_kind::BYTE => c.read_u8()? as u64,
        literal_kind::WORD => c.read_u16()? as u64,
        literal_kind::DWORD => c.read_u32()? as u64,
        literal_kind::QWORD => c.read_u64()?,
        literal_kind::REAL4 => c.read_f32()?.to_bits() as u64,
        literal_kind::REAL8 => c.read_f64()?.to_bits(),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    };
    let mut current = resolve_named(registry, env, &dst)?;
    current.set_bits(bits);
    write_named(registry, env, &dst, current)
}

fn do_set_object(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let dst = c.read_cstr()?;
    let kind = c.read_u8()?;
    let value = match kind {
        object_kind::NEW => {
            let class_name = c.read_cstr()?;
            let ctor_name = c.read_cstr()?;
            let args = read_arg_list(c, registry, env)?;
            let class = registry.load_class(&class_name)?;
            let obj = registry.alloc_object(&class)?;
            let obj_value = unsafe { Value::from_ptr(TypeTag::Object, obj.0) };
            let ctor = class.function(&ctor_name).ok_or_else(|| VmError::FunctionNotFound(ctor_name.clone()))?;
            enter_and_run(registry, env, &class, &ctor, Some(obj_value), &args)?;
            if let Some(exc) = env.exception() {
                return Err(exc.error.clone());
            }
            obj_value
        }
        object_kind::ARRAY => {
            let elem_byte = c.read_u8()?;
            let elem_tag = TypeTag::from_byte(elem_byte).ok_or(VmError::BadCommand { opcode: elem_byte })?;
            let length = c.read_u32()?;
            let array_tag = elem_tag.array_of().ok_or(VmError::BadCommand { opcode: elem_byte })?;
            let arr = registry.alloc_array(elem_tag, length)?;
            unsafe { Value::from_ptr(array_tag, arr.0) }
        }
        object_kind::STRING => {
            let literal = c.read_cstr()?;
            registry.make_string(&literal)?
        }
        object_kind::VALUE => {
            let src = c.read_cstr()?;
            resolve_named(registry, env, &src)?
        }
        object_kind::NULL => Value::null(),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    };
    write_named(registry, env, &dst, value)
}

fn do_set_var(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let dst = c.read_cstr()?;
    let src = c.read_cstr()?;
    let dst_val = resolve_named(registry, env, &dst)?;
    let src_val = resolve_named(registry, env, &src)?;
    let dst_tag = dst_val.type_tag();
    let result = if dst_tag.is_reference() {
        if src_val.type_tag() != dst_tag {
            return Err(VmError::BadVariableName(format!("cannot assign {src} to {dst}: reference type mismatch")));
        }
        src_val
    } else {
        cast_value(&src_val, dst_tag)
    };
    write_named(registry, env, &dst, result)
}

fn do_set_return(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let dst = c.read_cstr()?;
    let dst_val = resolve_named(registry, env, &dst)?;
    let value = env.registers.get_as(dst_val.type_tag());
    write_named(registry, env, &dst, value)
}

fn do_return(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<AfterInstr> {
    let kind = c.read_u8()?;
    let function = env.current_function().cloned().ok_or_else(|| VmError::Internal("ret outside of any call".into()))?;
    let tag = function.return_tag;
    let value = match kind {
        return_kind::VOID => Value::new(tag, AccessType::Dynamic, AccessModifier::Varying),
        return_kind::BYTE => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_u8()? as u64),
        return_kind::WORD => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_u16()? as u64),
        return_kind::DWORD => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_u32()? as u64),
        return_kind::QWORD => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_u64()?),
        return_kind::REAL4 => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_f32()?.to_bits() as u64),
        return_kind::REAL8 => Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, c.read_f64()?.to_bits()),
        return_kind::VAR => {
            let name = c.read_cstr()?;
            let found = resolve_named(registry, env, &name)?;
            cast_value(&found, tag)
        }
        return_kind::REG => env.registers.get_as(tag),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    };
    finish_return(env, value)
}

fn finish_return(env: &mut Environment, value: Value) -> VmResult<AfterInstr> {
    env.registers.set_from(&value);
    env.pop_frame()?;
    env.set_ip(None);
    Ok(AfterInstr::Halted)
}

// -- calls ------------------------------------------------------------------

fn read_arg_list(c: &mut Cursor<'_>, registry: &Registry, env: &Environment) -> VmResult<Vec<Value>> {
    let n = c.read_u8()? as usize;
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        args.push(read_operand(c, registry, env)?);
    }
    Ok(args)
}

fn do_static_call(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry, current_class: &Arc<Class>) -> VmResult<()> {
    let class_name = c.read_cstr()?;
    let qualname = c.read_cstr()?;
    let args = read_arg_list(c, registry, env)?;
    let class = if class_name.is_empty() { Arc::clone(current_class) } else { registry.load_class(&class_name)? };
    let function = class.function(&qualname).ok_or_else(|| VmError::FunctionNotFound(qualname.clone()))?;
    enter_and_run(registry, env, &class, &function, None, &args)?;
    if let Some(exc) = env.exception() {
        return Err(exc.error.clone());
    }
    Ok(())
}

fn do_dynamic_call(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let receiver_name = c.read_cstr()?;
    let qualname = c.read_cstr()?;
    let args = read_arg_list(c, registry, env)?;
    let receiver = resolve_named(registry, env, &receiver_name)?;
    if receiver.is_null() {
        return Err(VmError::NullDereference);
    }
    let obj = ObjectRef(unsafe { receiver.as_ptr() });
    let concrete: &Class = unsafe { &*obj.class_ptr() };
    let class = registry.get_class(&concrete.name).ok_or_else(|| VmError::ClassNotFound(concrete.name.clone()))?;
    let function = class.function(&qualname).ok_or_else(|| VmError::FunctionNotFound(qualname.clone()))?;
    enter_and_run(registry, env, &class, &function, Some(receiver), &args)?;
    if let Some(exc) = env.exception() {
        return Err(exc.error.clone());
    }
    Ok(())
}

// -- arithmetic / cast --------------------------------------------------------

fn do_arithmetic(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let op = c.read_u8()?;
    let dst = c.read_cstr()?;
    let src = c.read_cstr()?;
    let arg = read_operand(c, registry, env)?;
    let dst_val = resolve_named(registry, env, &dst)?;
    let src_val = resolve_named(registry, env, &src)?;
    let result = apply_arith(op, dst_val.type_tag(), &src_val, &arg)?;
    write_named(registry, env, &dst, result)
}

fn do_unary(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let op = c.read_u8()?;
    let dst = c.read_cstr()?;
    let src = c.read_cstr()?;
    let dst_val = resolve_named(registry, env, &dst)?;
    let src_val = resolve_named(registry, env, &src)?;
    let result = apply_unary(op, dst_val.type_tag(), &src_val)?;
    write_named(registry, env, &dst, result)
}

fn do_cast(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let dst_tag_byte = c.read_u8()?;
    let dst_tag = TypeTag::from_byte(dst_tag_byte).ok_or(VmError::BadCommand { opcode: dst_tag_byte })?;
    let dst = c.read_cstr()?;
    let src = c.read_cstr()?;
    let src_val = resolve_named(registry, env, &src)?;
    write_named(registry, env, &dst, cast_value(&src_val, dst_tag))
}

// -- control flow -------------------------------------------------------------

fn do_conditional(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<AfterInstr> {
    let cmp = c.read_u8()?;
    let a = read_operand(c, registry, env)?;
    let taken = if cmp == comparator::TRUTHY {
        truthy(&a)
    } else {
        let b = read_operand(c, registry, env)?;
        compare(cmp, &a, &b)?
    };
    let offset = c.read_u64()?;
    if taken || offset == NO_BRANCH {
        Ok(AfterInstr::Advance)
    } else {
        Ok(AfterInstr::Jump(offset as usize))
    }
}

fn do_unconditional(c: &mut Cursor<'_>) -> VmResult<AfterInstr> {
    let offset = c.read_u64()?;
    if offset == NO_BRANCH {
        Ok(AfterInstr::Advance)
    } else {
        Ok(AfterInstr::Jump(offset as usize))
    }
}

// -- push / pop ----------------------------------------------------------------

fn do_push(c: &mut Cursor<'_>, env: &mut Environment, registry: &Registry) -> VmResult<()> {
    let kind = c.read_u8()?;
    let value = match kind {
        operand_kind::RET => Value::from_raw(TypeTag::Long, AccessType::Dynamic, AccessModifier::Varying, env.registers.qword_reg),
        operand_kind::VALUE => {
            let name = c.read_cstr()?;
            resolve_named(registry, env, &name)?
        }
        _ => return Err(VmError::BadCommand { opcode: kind }),
    };
    env.push_value(value)?;
    Ok(())
}

fn do_pop(c: &mut Cursor<'_>, env: &mut Environment) -> VmResult<()> {
    let _kind = c.read_u8()?;
    env.pop_value()?;
    Ok(())
}

// -- operand / variable resolution ----------------------------------------------

fn read_operand(c: &mut Cursor<'_>, registry: &Registry, env: &Environment) -> VmResult<Value> {
    let kind = c.read_u8()?;
    Ok(match kind {
        operand_kind::BYTE => Value::from_raw(TypeTag::Char, AccessType::Dynamic, AccessModifier::Varying, c.read_u8()? as u64),
        operand_kind::WORD => Value::from_raw(TypeTag::Short, AccessType::Dynamic, AccessModifier::Varying, c.read_u16()? as u64),
        operand_kind::DWORD => Value::from_raw(TypeTag::Int, AccessType::Dynamic, AccessModifier::Varying, c.read_u32()? as u64),
        operand_kind::QWORD => Value::from_raw(TypeTag::Long, AccessType::Dynamic, AccessModifier::Varying, c.read_u64()?),
        operand_kind::REAL4 => Value::from_raw(TypeTag::Float, AccessType::Dynamic, AccessModifier::Varying, c.read_f32()?.to_bits() as u64),
        operand_kind::REAL8 => Value::from_raw(TypeTag::Double, AccessType::Dynamic, AccessModifier::Varying, c.read_f64()?.to_bits()),
        operand_kind::VALUE => {
            let name = c.read_cstr()?;
            resolve_named(registry, env, &name)?
        }
        operand_kind::STRING => {
            let literal = c.read_cstr()?;
            registry.make_string(&literal)?
        }
        operand_kind::RET => Value::from_raw(TypeTag::Long, AccessType::Dynamic, AccessModifier::Varying, env.registers.qword_reg),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    })
}

fn split_bracket(name: &str) -> Option<(&str, &str)> {
    if !name.ends_with(']') {
        return None;
    }
    let open = name.find('[')?;
    Some((&name[..open], &name[open + 1..name.len() - 1]))
}

fn resolve_index(registry: &Registry, env: &Environment, expr: &str) -> VmResult<i64> {
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(n);
    }
    Ok(resolve_named(registry, env, expr)?.as_i64())
}

/// Implements `resolve_variable` (`spec.md` §4.F): plain identifier,
/// dotted object-field or static-field path, or bracketed array index.
fn resolve_named(registry: &Registry, env: &Environment, name: &str) -> VmResult<Value> {
    if let Some((base, index_expr)) = split_bracket(name) {
        let base_val = resolve_named(registry, env, base)?;
        if !base_val.type_tag().is_array() {
            return Err(VmError::BadVariableName(name.to_owned()));
        }
        if base_val.is_null() {
            return Err(VmError::NullDereference);
        }
        let index = resolve_index(registry, env, index_expr)?;
        let arr = ArrayRef(unsafe { base_val.as_ptr() });
        return arr.get(index);
    }

    if let Some(dot) = name.find('.') {
        let segments: Vec<&str> = name.split('.').collect();
        if env.has_local(segments[0]) {
            let mut current = env.read_local(segments[0])?;
            for seg in &segments[1..] {
                current = step_field(current, seg)?;
            }
            return Ok(current);
        }
        let _ = dot;
        let field_name = segments[segments.len() - 1];
        let class_name = segments[..segments.len() - 1].join(".");
        let class = registry.get_class(&class_name).ok_or_else(|| VmError::BadVariableName(name.to_owned()))?;
        return class.static_fields.borrow().get(field_name).copied().ok_or_else(|| VmError::FieldNotFound(field_name.to_owned()));
    }

    if env.has_local(name) {
        return env.read_local(name);
    }
    env.current_class_static(name).ok_or_else(|| VmError::BadVariableName(name.to_owned()))
}

fn step_field(current: Value, seg: &str) -> VmResult<Value> {
    if seg == "length" && current.type_tag().is_array() {
        if current.is_null() {
            return Err(VmError::NullDereference);
        }
        let arr = ArrayRef(unsafe { current.as_ptr() });
        return Ok(Value::from_raw(TypeTag::UInt, AccessType::Dynamic, AccessModifier::Varying, arr.length() as u64));
    }
    if current.is_null() {
        return Err(VmError::NullDereference);
    }
    if current.type_tag() != TypeTag::Object {
        return Err(VmError::FieldNotFound(seg.to_owned()));
    }
    let obj = ObjectRef(unsafe { current.as_ptr() });
    let class = unsafe { &*obj.class_ptr() };
    let field = class.field(seg).ok_or_else(|| VmError::FieldNotFound(seg.to_owned()))?;
    Ok(obj.read_field(field))
}

fn write_named(registry: &Registry, env: &mut Environment, name: &str, value: Value) -> VmResult<()> {
    if let Some((base, index_expr)) = split_bracket(name) {
        let base_val = resolve_named(registry, env, base)?;
        if !base_val.type_tag().is_array() {
            return Err(VmError::BadVariableName(name.to_owned()));
        }
        if base_val.is_null() {
            return Err(VmError::NullDereference);
        }
        let index = resolve_index(registry, env, index_expr)?;
        let arr = ArrayRef(unsafe { base_val.as_ptr() });
        return arr.set(index, &value);
    }

    if let Some(_dot) = name.find('.') {
        let segments: Vec<&str> = name.split('.').collect();
        if env.has_local(segments[0]) {
            let mut current = env.read_local(segments[0])?;
            for seg in &segments[1..segments.len() - 1] {
                current = step_field(current, seg)?;
            }
            let last = segments[segments.len() - 1];
            if current.is_null() {
                return Err(VmError::NullDereference);
            }
            let obj = ObjectRef(unsafe { current.as_ptr() });
            let class = unsafe { &*obj.class_ptr() };
            let field = class.field(last).ok_or_else(|| VmError::FieldNotFound(last.to_owned()))?;
            obj.write_field(field, &value);
            return Ok(());
        }
        let field_name = segments[segments.len() - 1];
        let class_name = segments[..segments.len() - 1].join(".");
        let class = registry.get_class(&class_name).ok_or_else(|| VmError::BadVariableName(name.to_owned()))?;
        let mut fields = class.static_fields.borrow_mut();
        return match fields.get_mut(field_name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(VmError::FieldNotFound(field_name.to_owned())),
        };
    }

    if env.has_local(name) {
        return env.write_local(name, value);
    }
    if env.write_current_class_static(name, value) {
        return Ok(());
    }
    Err(VmError::BadVariableName(name.to_owned()))
}

// -- numeric helpers -------------------------------------------------------------

fn numeric_as_i64(v: &Value) -> i64 {
    use TypeTag::*;
    match v.type_tag() {
        Char => v.as_i8() as i64,
        UChar | Bool => v.as_u8() as i64,
        Short => v.as_i16() as i64,
        UShort => v.as_u16() as i64,
        Int => v.as_i32() as i64,
        UInt => v.as_u32() as i64,
        Long | ULong => v.as_i64(),
        Float => v.as_f32() as i64,
        Double => v.as_f64() as i64,
        _ => 0,
    }
}

fn numeric_as_f64(v: &Value) -> f64 {
    match v.type_tag() {
        TypeTag::Float => v.as_f32() as f64,
        TypeTag::Double => v.as_f64(),
        _ => numeric_as_i64(v) as f64,
    }
}

fn truthy(v: &Value) -> bool {
    if v.type_tag().is_reference() {
        return !v.is_null();
    }
    if matches!(v.type_tag(), TypeTag::Float | TypeTag::Double) {
        numeric_as_f64(v) != 0.0
    } else {
        numeric_as_i64(v) != 0
    }
}

fn compare(op: u8, a: &Value, b: &Value) -> VmResult<bool> {
    let is_float = matches!(a.type_tag(), TypeTag::Float | TypeTag::Double) || matches!(b.type_tag(), TypeTag::Float | TypeTag::Double);
    let ord = if is_float {
        numeric_as_f64(a).partial_cmp(&numeric_as_f64(b))
    } else {
        Some(numeric_as_i64(a).cmp(&numeric_as_i64(b)))
    };
    let Some(ord) = ord else {
        // NaN on either side: every ordered comparison is false, `!=` is true.
        return Ok(op == comparator::NE);
    };
    Ok(match op {
        comparator::EQ => ord == Ordering::Equal,
        comparator::NE => ord != Ordering::Equal,
        comparator::LT => ord == Ordering::Less,
        comparator::LE => ord != Ordering::Greater,
        comparator::GT => ord == Ordering::Greater,
        comparator::GE => ord != Ordering::Less,
        _ => return Err(VmError::BadCommand { opcode: op }),
    })
}

/// Static cast per the `spec.md` §4.G cast matrix: any numeric source to
/// any numeric destination; reference types pass through unchanged
/// (callers enforce the "types must match exactly" rule separately for
/// `setv`).
fn cast_value(src: &Value, dst: TypeTag) -> Value {
    use TypeTag::*;
    let raw = |bits: u64| Value::from_raw(dst, AccessType::Dynamic, AccessModifier::Varying, bits);
    match dst {
        Bool => raw((numeric_as_i64(src) != 0) as u64),
        Char => raw(numeric_as_i64(src) as i8 as u8 as u64),
        UChar => raw(numeric_as_i64(src) as u8 as u64),
        Short => raw(numeric_as_i64(src) as i16 as u16 as u64),
        UShort => raw(numeric_as_i64(src) as u16 as u64),
        Int => raw(numeric_as_i64(src) as i32 as u32 as u64),
        UInt => raw(numeric_as_i64(src) as u32 as u64),
        Long | ULong => raw(numeric_as_i64(src) as u64),
        Float => raw((numeric_as_f64(src) as f32).to_bits() as u64),
        Double => raw(numeric_as_f64(src).to_bits()),
        _ => *src,
    }
}

/// `add/sub/mul/div/mod/and/or/xor/lsh/rsh`, casting both operands to
/// `dst_tag` before combining (`spec.md` §9: "this spec picks
/// 'destination type' as the contract"). Division/modulo by zero
/// produces zero rather than a host trap (`spec.md` §4.G: either is
/// acceptable).
fn apply_arith(op: u8, dst_tag: TypeTag, src: &Value, arg: &Value) -> VmResult<Value> {
    let src_c = cast_value(src, dst_tag);
    let arg_c = cast_value(arg, dst_tag);

    if matches!(dst_tag, TypeTag::Float | TypeTag::Double) {
        let a = numeric_as_f64(&src_c);
        let b = numeric_as_f64(&arg_c);
        let r = match op {
            arith_op::ADD => a + b,
            arith_op::SUB => a - b,
            arith_op::MUL => a * b,
            arith_op::DIV => a / b,
            arith_op::MOD => a % b,
            _ => return Err(VmError::BadCommand { opcode: op }),
        };
        return Ok(cast_value(&Value::from_raw(TypeTag::Double, AccessType::Dynamic, AccessModifier::Varying, r.to_bits()), dst_tag));
    }

    let a = numeric_as_i64(&src_c);
    let b = numeric_as_i64(&arg_c);
    let r: i64 = match op {
        arith_op::ADD => a.wrapping_add(b),
        arith_op::SUB => a.wrapping_sub(b),
        arith_op::MUL => a.wrapping_mul(b),
        arith_op::DIV => if b == 0 { 0 } else { a.wrapping_div(b) },
        arith_op::MOD => if b == 0 { 0 } else { a.wrapping_rem(b) },
        arith_op::AND => a & b,
        arith_op::OR => a | b,
        arith_op::XOR => a ^ b,
        arith_op::LSH => a.wrapping_shl(b as u32),
        arith_op::RSH => a.wrapping_shr(b as u32),
        _ => return Err(VmError::BadCommand { opcode: op }),
    };
    Ok(cast_value(&Value::from_raw(TypeTag::Long, AccessType::Dynamic, AccessModifier::Varying, r as u64), dst_tag))
}

fn apply_unary(op: u8, dst_tag: TypeTag, src: &Value) -> VmResult<Value> {
    let src_c = cast_value(src, dst_tag);
    if matches!(dst_tag, TypeTag::Float | TypeTag::Double) {
        let v = numeric_as_f64(&src_c);
        let r = match op {
            unary_op::NEG => -v,
            unary_op::NOT => return Err(VmError::BadCommand { opcode: op }),
            _ => return Err(VmError::BadCommand { opcode: op }),
        };
        return Ok(cast_value(&Value::from_raw(TypeTag::Double, AccessType::Dynamic, AccessModifier::Varying, r.to_bits()), dst_tag));
    }
    let v = numeric_as_i64(&src_c);
    let r = match op {
        unary_op::NEG => v.wrapping_neg(),
        unary_op::NOT => !v,
        _ => return Err(VmError::BadCommand { opcode: op }),
    };
    Ok(cast_value(&Value::from_raw(TypeTag::Long, AccessType::Dynamic, AccessModifier::Varying, r as u64), dst_tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_matrix_bool_is_zero_or_one() {
        let v = Value::from_i32(42);
        assert_eq!(cast_value(&v, TypeTag::Bool).as_bool(), true);
        let zero = Value::from_i32(0);
        assert_eq!(cast_value(&zero, TypeTag::Bool).as_bool(), false);
    }

    #[test]
    fn cast_float_to_int_truncates() {
        let v = Value::from_f64(3.9);
        assert_eq!(cast_value(&v, TypeTag::Int).as_i32(), 3);
        let v = Value::from_f64(-3.9);
        assert_eq!(cast_value(&v, TypeTag::Int).as_i32(), -3);
    }

    #[test]
    fn arithmetic_casts_to_destination_type() {
        let dst_tag = TypeTag::Int;
        let src = Value::from_i32(3);
        let arg = Value::from_f64(2.5);
        let result = apply_arith(arith_op::ADD, dst_tag, &src, &arg).unwrap();
        assert_eq!(result.as_i32(), 5);
    }

    #[test]
    fn division_by_zero_yields_zero_not_a_trap() {
        let dst_tag = TypeTag::Int;
        let src = Value::from_i32(10);
        let arg = Value::from_i32(0);
        let result = apply_arith(arith_op::DIV, dst_tag, &src, &arg).unwrap();
        assert_eq!(result.as_i32(), 0);
    }

    #[test]
    fn split_bracket_extracts_base_and_index() {
        assert_eq!(split_bracket("arr[3]"), Some(("arr", "3")));
        assert_eq!(split_bracket("plain"), None);
    }

    #[test]
    fn compare_orders_integers() {
        let a = Value::from_i32(1);
        let b = Value::from_i32(2);
        assert!(compare(comparator::LT, &a, &b).unwrap());
        assert!(!compare(comparator::GT, &a, &b).unwrap());
    }
}
