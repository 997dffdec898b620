//! Call bridge: builds the argument buffer and trampolines into a
//! resolved native function (`spec.md` §4.H).
//!
//! The buffer handed to a native function carries the environment
//! pointer, the class pointer, then the declared arguments, exactly as
//! `spec.md` §4.H describes — but each slot is a tagged
//! [`lsvm_abi::NativeValue`] rather than an untyped 8-byte word. This
//! keeps the boundary type-safe on the Rust side of the ABI while
//! preserving the three-part buffer shape the spec names; recorded as a
//! deliberate divergence in `DESIGN.md`.

use std::sync::Arc;

use lsvm_abi::{NativeFn, NativeValue};

use crate::class::Class;
use crate::env::Environment;
use crate::value::{AccessModifier, AccessType, TypeTag, Value};

/// Convert a VM value into its native-ABI representation.
pub fn value_to_native(v: &Value) -> NativeValue {
    match v.type_tag() {
        TypeTag::Bool => NativeValue::bool(v.as_bool()),
        TypeTag::Char | TypeTag::UChar | TypeTag::Short | TypeTag::UShort | TypeTag::Int | TypeTag::UInt => {
            NativeValue::i32(v.as_i32())
        }
        TypeTag::Long | TypeTag::ULong => NativeValue::i64(v.as_i64()),
        TypeTag::Float => NativeValue::f64(v.as_f32() as f64),
        TypeTag::Double => NativeValue::f64(v.as_f64()),
        tag if tag.is_reference() => unsafe { NativeValue::from_ptr(v.as_ptr() as *mut ()) },
        _ => NativeValue::null(),
    }
}

/// Convert a native-ABI return value back into a VM value of the
/// callee's declared return type.
pub fn native_to_value(nv: &NativeValue, return_tag: TypeTag) -> Value {
    if return_tag.is_reference() {
        let ptr = unsafe { nv.as_ptr() }.unwrap_or(std::ptr::null_mut());
        return unsafe { Value::from_ptr(return_tag, ptr as *mut u8) };
    }
    match return_tag {
        TypeTag::Bool => Value::from_bool(nv.as_bool().unwrap_or(false)),
        TypeTag::Float => {
            let f = nv.as_f64().unwrap_or(0.0) as f32;
            Value::from_raw(return_tag, AccessType::Dynamic, AccessModifier::Varying, f.to_bits() as u64)
        }
        TypeTag::Double => Value::from_f64(nv.as_f64().unwrap_or(0.0)),
        _ => {
            let bits = nv.as_i64().unwrap_or_else(|| nv.as_i32().unwrap_or(0) as i64);
            Value::from_raw(return_tag, AccessType::Dynamic, AccessModifier::Varying, bits as u64)
        }
    }
}

/// Call a resolved native function, passing the environment pointer and
/// class pointer ahead of the declared arguments, and decode its return
/// value as `return_tag`.
///
/// # Safety
/// `native` must have been resolved against a symbol whose actual
/// definition matches the [`NativeFn`] calling convention, and `env`/
/// `class` must remain valid for the duration of the call.
pub unsafe fn invoke(
    native: NativeFn,
    env: *mut Environment,
    class: &Arc<Class>,
    args: &[Value],
    return_tag: TypeTag,
) -> Value {
    let mut buf = Vec::with_capacity(2 + args.len());
    unsafe {
        buf.push(NativeValue::from_ptr(env as *mut ()));
        buf.push(NativeValue::from_ptr(Arc::as_ptr(class) as *mut ()));
    }
    buf.extend(args.iter().map(value_to_native));

    let result = native(buf.as_ptr(), buf.len());
    native_to_value(&result, return_tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trips_through_native_value() {
        let v = Value::from_i32(-9);
        let nv = value_to_native(&v);
        let back = native_to_value(&nv, TypeTag::Int);
        assert_eq!(back.as_i32(), -9);
    }

    #[test]
    fn bool_round_trips() {
        let v = Value::from_bool(true);
        let nv = value_to_native(&v);
        assert_eq!(native_to_value(&nv, TypeTag::Bool).as_bool(), true);
    }
}
