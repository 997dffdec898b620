//! Per-environment execution state (`spec.md` §4.F).
//!
//! Locals, arguments, and scratch push/pop values live on a raw byte
//! stack that grows from high addresses toward low, holding full
//! [`Value`] records (16 bytes each). Call bookkeeping (saved base,
//! saved instruction pointer, current function, frame flags) is kept as
//! a parallel `Vec<Frame>` rather than literally interleaved into the
//! same byte buffer — the spec's "4 words" frame header describes the
//! fields that must be saved and restored, not a binary layout any
//! external tool reads, so a plain Rust struct satisfies the same frame
//! symmetry invariant (`spec.md` §8) without unsafe encoding. Recorded
//! in `DESIGN.md`.
//!
//! Variable scoping is likewise simplified to one scope per call frame
//! (not one per nested control-flow block) — see `DESIGN.md`'s Open
//! Question resolution for `resolve_variable`'s scope-chain shape.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::class::{Class, FunctionDescriptor};
use crate::error::{VmError, VmResult};
use crate::value::{sizeof_type, AccessModifier, AccessType, TypeTag, Value};

const VALUE_SIZE: usize = 16;

/// Bit set in [`Frame::flags`] when unwinding this frame should end the
/// dispatch loop (`spec.md` §4.G: "return native").
pub const FRAME_RETURN_NATIVE: u8 = 0x1;

/// An instruction pointer: which class's `code` buffer, and the offset
/// within it.
#[derive(Clone)]
pub struct CodeLocation {
    /// Owning class (bytecode and statics live here).
    pub class: Arc<Class>,
    /// Byte offset into `class.code`.
    pub offset: usize,
}

/// One active call's saved state.
struct Frame {
    saved_base: usize,
    saved_ip: Option<CodeLocation>,
    function: Arc<FunctionDescriptor>,
    class: Arc<Class>,
    flags: u8,
}

/// name -> stack byte offset of that variable's 16-byte `Value` slot.
type Scope = FxHashMap<String, usize>;

/// The set of typed return registers `setr`/`ret*` read and write
/// (`spec.md` §4.F, §4.G).
#[derive(Default, Clone)]
pub struct ReturnRegisters {
    /// 1-byte kinds: char, uchar, bool.
    pub byte_reg: u8,
    /// 2-byte kinds: short, ushort.
    pub word_reg: u16,
    /// 4-byte integer kinds: int, uint.
    pub dword_reg: u32,
    /// 8-byte integer kinds: long, ulong.
    pub qword_reg: u64,
    /// 32-bit float.
    pub real4_reg: f32,
    /// 64-bit float.
    pub real8_reg: f64,
    /// Object/array reference register (the "void-pointer" register).
    pub ptr_reg: Value,
}

impl ReturnRegisters {
    /// Store `value` into the register matching its type.
    pub fn set_from(&mut self, value: &Value) {
        match value.type_tag() {
            TypeTag::Char | TypeTag::UChar | TypeTag::Bool => self.byte_reg = value.as_u8(),
            TypeTag::Short | TypeTag::UShort => self.word_reg = value.as_u16(),
            TypeTag::Int | TypeTag::UInt => self.dword_reg = value.as_u32(),
            TypeTag::Long | TypeTag::ULong => self.qword_reg = value.as_u64(),
            TypeTag::Float => self.real4_reg = value.as_f32(),
            TypeTag::Double => self.real8_reg = value.as_f64(),
            tag if tag.is_reference() => self.ptr_reg = *value,
            _ => {}
        }
    }

    /// Build a `Value` of `tag` from whichever register matches it
    /// (`spec.md` §4.G: "`setr <dst>`: copies the appropriate return
    /// register, chosen by the destination's type").
    pub fn get_as(&self, tag: TypeTag) -> Value {
        if tag.is_reference() {
            return self.ptr_reg;
        }
        let bits = match tag {
            TypeTag::Char | TypeTag::UChar | TypeTag::Bool => self.byte_reg as u64,
            TypeTag::Short | TypeTag::UShort => self.word_reg as u64,
            TypeTag::Int | TypeTag::UInt => self.dword_reg as u64,
            TypeTag::Long | TypeTag::ULong => self.qword_reg,
            TypeTag::Float => self.real4_reg.to_bits() as u64,
            TypeTag::Double => self.real8_reg.to_bits(),
            _ => 0,
        };
        Value::from_raw(tag, AccessType::Dynamic, AccessModifier::Varying, bits)
    }
}

/// A recorded exception (`spec.md` §7): kind, optional message, and the
/// location it was raised at, for the host's stack-trace printer.
#[derive(Debug, Clone)]
pub struct Exception {
    /// The error kind.
    pub error: VmError,
    /// Function in which the exception was raised.
    pub function_name: String,
    /// Byte offset within that function's class's bytecode.
    pub offset: usize,
}

/// A single-threaded execution context: its own stack, scope chain, and
/// exception slot.
pub struct Environment {
    stack: Box<[u8]>,
    sp: usize,
    frame_base: usize,
    frames: Vec<Frame>,
    scopes: Vec<Scope>,
    ip: Option<CodeLocation>,
    pub registers: ReturnRegisters,
    exception: Option<Exception>,
}

impl Environment {
    /// Create a new environment with a stack of `stack_size` bytes.
    ///
    /// A sentinel value is pushed first so the initial frame has a
    /// distinct frame base (`spec.md` §4.F).
    pub fn new(stack_size: usize) -> VmResult<Environment> {
        let stack_size = stack_size.max(VALUE_SIZE);
        let mut env = Environment {
            stack: vec![0u8; stack_size].into_boxed_slice(),
            sp: stack_size,
            frame_base: stack_size,
            frames: Vec::new(),
            scopes: Vec::new(),
            ip: None,
            registers: ReturnRegisters::default(),
            exception: None,
        };
        env.push_value(Value::null())?;
        env.frame_base = env.sp;
        env.scopes.push(Scope::default());
        Ok(env)
    }

    /// Current instruction pointer, or `None` if the dispatch loop should
    /// halt.
    pub fn ip(&self) -> Option<&CodeLocation> {
        self.ip.as_ref()
    }

    /// Overwrite the instruction pointer.
    pub fn set_ip(&mut self, loc: Option<CodeLocation>) {
        self.ip = loc;
    }

    /// The current frame's class (bottommost frame before any call has
    /// the bootstrap caller's class, supplied by whoever starts
    /// execution).
    pub fn current_class(&self) -> Option<&Arc<Class>> {
        self.frames.last().map(|f| &f.class)
    }

    /// The current frame's function, if any has been entered yet.
    pub fn current_function(&self) -> Option<&Arc<FunctionDescriptor>> {
        self.frames.last().map(|f| &f.function)
    }

    /// Exception currently recorded on this environment, if any.
    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    /// Record an exception (`spec.md` §7: setting it does not unwind by
    /// itself; the dispatch loop checks after each sub-operation).
    pub fn raise(&mut self, error: VmError, function_name: impl Into<String>, offset: usize) {
        self.exception = Some(Exception { error, function_name: function_name.into(), offset });
    }

    /// Clear any recorded exception.
    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    // -- raw value stack -------------------------------------------------

    fn read_value_at(&self, offset: usize) -> Value {
        let flags = u64::from_ne_bytes(self.stack[offset..offset + 8].try_into().unwrap());
        let payload = u64::from_ne_bytes(self.stack[offset + 8..offset + 16].try_into().unwrap());
        Value::from_words(flags, payload)
    }

    fn write_value_at(&mut self, offset: usize, value: Value) {
        let (flags, payload) = value.into_words();
        self.stack[offset..offset + 8].copy_from_slice(&flags.to_ne_bytes());
        self.stack[offset + 8..offset + 16].copy_from_slice(&payload.to_ne_bytes());
    }

    /// Push a 16-byte `Value` slot, returning its stack offset.
    pub fn push_value(&mut self, value: Value) -> VmResult<usize> {
        if self.sp < VALUE_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.sp -= VALUE_SIZE;
        self.write_value_at(self.sp, value);
        Ok(self.sp)
    }

    /// Pop the most recently pushed 16-byte slot and return its value.
    pub fn pop_value(&mut self) -> VmResult<Value> {
        if self.sp + VALUE_SIZE > self.stack.len() {
            return Err(VmError::Internal("pop on empty stack".into()));
        }
        let v = self.read_value_at(self.sp);
        self.sp += VALUE_SIZE;
        Ok(v)
    }

    // -- scope chain ------------------------------------------------------

    /// Declare a new variable in the current (innermost) scope.
    pub fn declare_var(&mut self, name: &str, tag: TypeTag) -> VmResult<()> {
        let scope = self.scopes.last().expect("at least one scope is always active");
        if scope.contains_key(name) {
            return Err(VmError::BadVariableName(name.to_owned()));
        }
        let value = Value::new(tag, AccessType::Dynamic, AccessModifier::Varying);
        let offset = self.push_value(value)?;
        self.scopes.last_mut().unwrap().insert(name.to_owned(), offset);
        Ok(())
    }

    /// Bind `name` to an already-pushed slot (used for declared call
    /// arguments and `this`).
    pub fn bind_existing(&mut self, name: &str, offset: usize) {
        self.scopes.last_mut().unwrap().insert(name.to_owned(), offset);
    }

    fn lookup_offset(&self, name: &str) -> Option<usize> {
        self.scopes.last().and_then(|s| s.get(name).copied())
    }

    /// Read a plain (undotted, unindexed) local variable's current value.
    pub fn read_local(&self, name: &str) -> VmResult<Value> {
        self.lookup_offset(name)
            .map(|off| self.read_value_at(off))
            .ok_or_else(|| VmError::BadVariableName(name.to_owned()))
    }

    /// Overwrite a plain local variable's current value.
    pub fn write_local(&mut self, name: &str, value: Value) -> VmResult<()> {
        let off = self.lookup_offset(name).ok_or_else(|| VmError::BadVariableName(name.to_owned()))?;
        self.write_value_at(off, value);
        Ok(())
    }

    /// Whether `name` is bound as a local in the current scope.
    pub fn has_local(&self, name: &str) -> bool {
        self.lookup_offset(name).is_some()
    }

    // -- frames -----------------------------------------------------------

    /// Push a new call frame, saving the caller's base and resume point.
    pub fn push_frame(
        &mut self,
        resume_at: Option<CodeLocation>,
        function: Arc<FunctionDescriptor>,
        class: Arc<Class>,
        flags: u8,
    ) -> VmResult<()> {
        self.frames.push(Frame { saved_base: self.frame_base, saved_ip: resume_at, function, class, flags });
        self.frame_base = self.sp;
        self.scopes.push(Scope::default());
        Ok(())
    }

    /// Pop the current frame, restoring the caller's base, scope, and
    /// instruction pointer. Returns `true` if the popped frame was
    /// flagged "return native" (the dispatch loop should halt).
    pub fn pop_frame(&mut self) -> VmResult<bool> {
        let frame = self.frames.pop().ok_or(VmError::Internal("frame underflow".into()))?;
        self.scopes.pop();
        // Discard this call's locals by resetting sp back to the frame base.
        self.sp = self.frame_base;
        self.frame_base = frame.saved_base;
        self.ip = frame.saved_ip;
        Ok(frame.flags & FRAME_RETURN_NATIVE != 0)
    }

    /// Current call depth (number of active frames).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Qualified names of every active frame, innermost first, for the
    /// host's frame-by-frame stack trace (`spec.md` §7).
    pub fn frame_names(&self) -> Vec<String> {
        self.frames.iter().rev().map(|f| f.function.qualified_name.clone()).collect()
    }

    /// Static field names exposed directly in the current scope, per
    /// `spec.md` §4.G.4: resolving an unqualified name also checks the
    /// current frame's class's static table.
    pub fn current_class_static(&self, name: &str) -> Option<Value> {
        self.current_class()?.static_fields.borrow().get(name).copied()
    }

    /// Write through to the current frame's class's static table.
    pub fn write_current_class_static(&self, name: &str, value: Value) -> bool {
        match self.current_class() {
            Some(class) => {
                let mut fields = class.static_fields.borrow_mut();
                if let Some(slot) = fields.get_mut(name) {
                    *slot = value;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

/// Size in bytes of a slot laid out in the caller-materialized argument
/// buffer (`spec.md` §4.H) for a function's arguments, in order.
pub fn argument_buffer_len(function: &FunctionDescriptor) -> usize {
    function.arg_types.iter().map(|t| sizeof_type(*t)).sum()
}
