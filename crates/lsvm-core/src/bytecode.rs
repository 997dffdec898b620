//! Byte-slice cursor and opcode table for the linked `.lb` bytecode format
//! (`spec.md` §4.D, §4.G, §6).
//!
//! `spec.md` §9 calls out "raw pointer arithmetic over bytecode" as a
//! pattern that needs re-architecting: instructions are modeled here as
//! typed reads over a byte slice through [`Cursor`], which tracks its own
//! position and exposes peek/advance operations for fixed-width fields and
//! NUL-terminated names. Neither the class loader nor the interpreter
//! touches a raw byte offset directly.

use crate::error::{VmError, VmResult};

/// A read cursor over a class's bytecode buffer.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Start a cursor at the beginning of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    /// Start a cursor at `bytes`, positioned at `offset`.
    pub fn at(bytes: &'a [u8], offset: usize) -> Self {
        Cursor { bytes, pos: offset }
    }

    /// Current absolute byte offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Whether the cursor has consumed the whole buffer.
    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Jump to an absolute offset (used for linked control-flow targets).
    pub fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }

    fn take(&mut self, n: usize) -> VmResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated())?;
        if end > self.bytes.len() {
            return Err(truncated());
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte and advance.
    pub fn read_u8(&mut self) -> VmResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16` and advance.
    pub fn read_u16(&mut self) -> VmResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian `u32` and advance.
    pub fn read_u32(&mut self) -> VmResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian `u64` and advance.
    pub fn read_u64(&mut self) -> VmResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Read a little-endian `i64` and advance.
    pub fn read_i64(&mut self) -> VmResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a 32-bit float and advance.
    pub fn read_f32(&mut self) -> VmResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a 64-bit float and advance.
    pub fn read_f64(&mut self) -> VmResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read bytes up to (not including) the next NUL byte, advancing past
    /// the NUL, and decode as UTF-8. Used for names and string literals.
    pub fn read_cstr(&mut self) -> VmResult<String> {
        let start = self.pos;
        loop {
            if self.pos >= self.bytes.len() {
                return Err(truncated());
            }
            if self.bytes[self.pos] == 0 {
                break;
            }
            self.pos += 1;
        }
        let s = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| VmError::Internal("bytecode name is not valid utf-8".into()))?
            .to_owned();
        self.pos += 1; // consume the NUL
        Ok(s)
    }

    /// Skip `n` raw bytes without interpreting them.
    pub fn skip(&mut self, n: usize) -> VmResult<()> {
        self.take(n).map(|_| ())
    }
}

fn truncated() -> VmError {
    VmError::ClassNotFound("truncated bytecode record".into())
}

/// Top-level declaration opcodes (`spec.md` §4.D).
pub mod decl {
    /// `class <name\0>`.
    pub const CLASS: u8 = 0x01;
    /// `extends <name\0>`.
    pub const EXTENDS: u8 = 0x02;
    /// `global <name\0> ...`.
    pub const GLOBAL: u8 = 0x03;
    /// `function ...`.
    pub const FUNCTION: u8 = 0x04;
}

/// Function flag bits packed into the function declaration's flags byte.
pub mod func_flags {
    /// Set when the function is declared `static`.
    pub const STATIC: u8 = 0x01;
    /// Set when the function body is provided by a native library.
    pub const NATIVE: u8 = 0x02;
    /// Set when the function has no body and may not be called directly.
    pub const ABSTRACT: u8 = 0x04;
}

/// Type-tag bytes as they appear in the bytecode stream, ordered to match
/// `value::TypeTag`'s discriminants so decoding is a direct cast.
pub fn decode_type_byte(b: u8) -> Option<crate::value::TypeTag> {
    crate::value::TypeTag::from_byte(b)
}

/// `declare` opcodes occupy `0x10..=0x27`, one per [`crate::value::TypeTag`]
/// discriminant, so the type is carried in the opcode byte itself rather
/// than a following operand (`spec.md` §4.G: "one opcode per type tag").
pub fn decode_declare_var(b: u8) -> Option<crate::value::TypeTag> {
    if !(0x10..=0x27).contains(&b) {
        return None;
    }
    crate::value::TypeTag::from_byte(b - 0x10)
}

/// Encode the `declare` opcode byte for `tag`.
pub fn encode_declare_var(tag: crate::value::TypeTag) -> u8 {
    0x10 + tag as u8
}

/// Literal-width selector following a [`Opcode::SetLiteral`] opcode
/// (`setb/setw/setd/setq/setr4/setr8`).
pub mod literal_kind {
    /// `setb`: 1-byte literal.
    pub const BYTE: u8 = 0;
    /// `setw`: 2-byte literal.
    pub const WORD: u8 = 1;
    /// `setd`: 4-byte integer literal.
    pub const DWORD: u8 = 2;
    /// `setq`: 8-byte integer literal.
    pub const QWORD: u8 = 3;
    /// `setr4`: 4-byte float literal.
    pub const REAL4: u8 = 4;
    /// `setr8`: 8-byte float literal.
    pub const REAL8: u8 = 5;
}

/// `seto` sub-opcode selector (`spec.md` §4.G "Object set").
pub mod object_kind {
    /// `new <class\0> <ctor\0> <args...>`.
    pub const NEW: u8 = 0;
    /// `<primitive-tag> <length:u32>` — new primitive/object array.
    pub const ARRAY: u8 = 1;
    /// `string <literal\0>`.
    pub const STRING: u8 = 2;
    /// `value <src\0>`.
    pub const VALUE: u8 = 3;
    /// `null`.
    pub const NULL: u8 = 4;
}

/// Operand-list entry kind, shared by argument lists (`spec.md` §4.H) and
/// literal/comparison operands that may be either an immediate or a named
/// variable.
pub mod operand_kind {
    /// Raw 1-byte immediate.
    pub const BYTE: u8 = 0;
    /// Raw 2-byte immediate.
    pub const WORD: u8 = 1;
    /// Raw 4-byte immediate.
    pub const DWORD: u8 = 2;
    /// Raw 8-byte immediate.
    pub const QWORD: u8 = 3;
    /// Raw 4-byte float immediate.
    pub const REAL4: u8 = 4;
    /// Raw 8-byte float immediate.
    pub const REAL8: u8 = 5;
    /// `value <name\0>` — read from a variable.
    pub const VALUE: u8 = 6;
    /// `string <literal\0>` — construct a `String`, pass by reference.
    pub const STRING: u8 = 7;
    /// `ret` — take the current qword return register.
    pub const RET: u8 = 8;
}

/// `add/sub/mul/div/mod/and/or/xor/lsh/rsh` selector following
/// [`Opcode::Arithmetic`].
pub mod arith_op {
    /// `add`.
    pub const ADD: u8 = 0;
    /// `sub`.
    pub const SUB: u8 = 1;
    /// `mul`.
    pub const MUL: u8 = 2;
    /// `div`.
    pub const DIV: u8 = 3;
    /// `mod`.
    pub const MOD: u8 = 4;
    /// `and`.
    pub const AND: u8 = 5;
    /// `or`.
    pub const OR: u8 = 6;
    /// `xor`.
    pub const XOR: u8 = 7;
    /// `lsh`.
    pub const LSH: u8 = 8;
    /// `rsh`.
    pub const RSH: u8 = 9;
}

/// `neg/not` selector following [`Opcode::Unary`].
pub mod unary_op {
    /// `neg`.
    pub const NEG: u8 = 0;
    /// `not`.
    pub const NOT: u8 = 1;
}

/// Comparator byte used by `if`/`while` (`spec.md` §4.G: "comparator
/// byte"). A comparison instruction with no comparator byte (single
/// operand) tests truthiness instead.
pub mod comparator {
    /// No second operand: test the first operand's truthiness.
    pub const TRUTHY: u8 = 0xFF;
    /// `==`.
    pub const EQ: u8 = 0;
    /// `!=`.
    pub const NE: u8 = 1;
    /// `<`.
    pub const LT: u8 = 2;
    /// `<=`.
    pub const LE: u8 = 3;
    /// `>`.
    pub const GT: u8 = 4;
    /// `>=`.
    pub const GE: u8 = 5;
}

/// Sentinel "proceed forward" branch offset (`spec.md` §4.G: "An offset of
/// all-ones means 'proceed forward'").
pub const NO_BRANCH: u64 = u64::MAX;

/// `ret/retb/retw/retd/retq/retr4/retr8/retv/retr` selector following
/// [`Opcode::Return`].
pub mod return_kind {
    /// `ret` — bare unwind, no value produced.
    pub const VOID: u8 = 0;
    /// `retb` — 1-byte immediate operand.
    pub const BYTE: u8 = 1;
    /// `retw` — 2-byte immediate operand.
    pub const WORD: u8 = 2;
    /// `retd` — 4-byte immediate operand.
    pub const DWORD: u8 = 3;
    /// `retq` — 8-byte immediate operand.
    pub const QWORD: u8 = 4;
    /// `retr4` — 4-byte float immediate operand.
    pub const REAL4: u8 = 5;
    /// `retr8` — 8-byte float immediate operand.
    pub const REAL8: u8 = 6;
    /// `retv <name\0>` — variable operand.
    pub const VAR: u8 = 7;
    /// `retr` — take the current return register matching the callee's
    /// declared return type (no operand).
    pub const REG: u8 = 8;
}

/// Interpreter opcodes (`spec.md` §4.G). Grouped by range; only the
/// mnemonics the spec names are enumerated, each carrying its own operand
/// shape documented at the call site that decodes it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// No operation; advance by one byte.
    Noop = 0x00,
    /// Declare a variable of a given type (one opcode per type tag,
    /// `0x10..=0x27` below carry the type in the opcode itself via
    /// `DeclareVar(TypeTag)` constructed by the decoder). The remaining
    /// mnemonics below are numbered to leave this whole range free.
    DeclareVar = 0x10,
    /// `setb/setw/setd/setq/setr4/setr8` literal set.
    SetLiteral = 0x28,
    /// `seto` object/array/string/value/null set.
    SetObject = 0x29,
    /// `setv` static-cast variable copy.
    SetVar = 0x2A,
    /// `setr` return-register copy.
    SetReturn = 0x2B,
    /// `ret` family.
    Return = 0x30,
    /// `static_call`.
    StaticCall = 0x40,
    /// `dynamic_call`.
    DynamicCall = 0x41,
    /// `add/sub/mul/div/mod/and/or/xor/lsh/rsh`.
    Arithmetic = 0x50,
    /// `neg/not`.
    Unary = 0x51,
    /// `castX`.
    Cast = 0x52,
    /// `if`.
    If = 0x60,
    /// `elif <cleanup-off> <compare> <off>` — carries a leading 8-byte
    /// `cleanup-off` field ahead of the `if`-shaped comparator/operand/off
    /// payload, unlike `if`/`while` (`spec.md` §4.G).
    Elif = 0x61,
    /// `else`.
    Else = 0x62,
    /// `end`.
    End = 0x63,
    /// `while`.
    While = 0x64,
    /// `push`.
    Push = 0x70,
    /// `pop`.
    Pop = 0x71,
}

impl Opcode {
    /// Decode a raw opcode byte, or `None` for an opcode this dispatch
    /// table does not recognize (`spec.md` §4.G: "any unknown opcode
    /// raises `BAD_COMMAND`").
    pub fn from_byte(b: u8) -> Option<Opcode> {
        use Opcode::*;
        if (0x10..=0x27).contains(&b) {
            return Some(DeclareVar);
        }
        Some(match b {
            0x00 => Noop,
            0x28 => SetLiteral,
            0x29 => SetObject,
            0x2A => SetVar,
            0x2B => SetReturn,
            0x30 => Return,
            0x40 => StaticCall,
            0x41 => DynamicCall,
            0x50 => Arithmetic,
            0x51 => Unary,
            0x52 => Cast,
            0x60 => If,
            0x61 => Elif,
            0x62 => Else,
            0x63 => End,
            0x64 => While,
            0x70 => Push,
            0x71 => Pop,
            _ => return None,
        })
    }
}

/// Decode and discard exactly one instruction starting at the cursor's
/// current position, advancing past it.
///
/// The `.lb` format carries no length prefix anywhere (`spec.md` §4.D):
/// the class loader finds the next top-level declaration by walking the
/// instruction stream one instruction at a time, which requires knowing
/// every opcode's byte length. This mirrors the original loader's
/// per-opcode skip switch (`examples/original_source/lscriptlib/internal/class.c`,
/// `register_functions`) without interpreting operand values.
pub fn skip_instruction(c: &mut Cursor<'_>) -> VmResult<()> {
    let opcode_byte = c.read_u8()?;
    if decode_declare_var(opcode_byte).is_some() {
        c.read_cstr()?; // declared name
        return Ok(());
    }
    let opcode = Opcode::from_byte(opcode_byte).ok_or(VmError::BadCommand { opcode: opcode_byte })?;
    match opcode {
        Opcode::Noop => {}
        Opcode::DeclareVar => unreachable!("handled via decode_declare_var above"),
        Opcode::SetLiteral => {
            let kind = c.read_u8()?;
            c.read_cstr()?; // dst
            skip_literal_payload(c, kind)?;
        }
        Opcode::SetObject => {
            c.read_cstr()?; // dst
            let kind = c.read_u8()?;
            match kind {
                object_kind::NEW => {
                    c.read_cstr()?; // class
                    c.read_cstr()?; // ctor
                    skip_arg_list(c)?;
                }
                object_kind::ARRAY => {
                    c.read_u8()?; // element tag
                    c.read_u32()?; // length
                }
                object_kind::STRING | object_kind::VALUE => {
                    c.read_cstr()?;
                }
                object_kind::NULL => {}
                _ => return Err(VmError::BadCommand { opcode: kind }),
            }
        }
        Opcode::SetVar => {
            c.read_cstr()?; // dst
            c.read_cstr()?; // src
        }
        Opcode::SetReturn => {
            c.read_cstr()?; // dst
        }
        Opcode::Return => {
            let kind = c.read_u8()?;
            skip_return_payload(c, kind)?;
        }
        Opcode::StaticCall => {
            c.read_cstr()?; // class
            c.read_cstr()?; // qualified name
            skip_arg_list(c)?;
        }
        Opcode::DynamicCall => {
            c.read_cstr()?; // receiver
            c.read_cstr()?; // qualified name
            skip_arg_list(c)?;
        }
        Opcode::Arithmetic => {
            c.read_u8()?; // op
            c.read_cstr()?; // dst
            c.read_cstr()?; // src
            skip_operand(c)?;
        }
        Opcode::Unary => {
            c.read_u8()?; // op
            c.read_cstr()?; // dst
            c.read_cstr()?; // src
        }
        Opcode::Cast => {
            c.read_u8()?; // destination type tag
            c.read_cstr()?; // dst
            c.read_cstr()?; // src
        }
        Opcode::If | Opcode::While => {
            skip_conditional_payload(c)?;
        }
        Opcode::Elif => {
            c.read_u64()?; // cleanup-off
            skip_conditional_payload(c)?;
        }
        Opcode::Else | Opcode::End => {
            c.read_u64()?; // cleanup-off
        }
        Opcode::Push => {
            let kind = c.read_u8()?;
            match kind {
                operand_kind::RET => {}
                operand_kind::VALUE => {
                    c.read_cstr()?;
                }
                _ => return Err(VmError::BadCommand { opcode: kind }),
            }
        }
        Opcode::Pop => {
            c.read_u8()?; // kind, unused at runtime too
        }
    }
    Ok(())
}

fn skip_literal_payload(c: &mut Cursor<'_>, kind: u8) -> VmResult<()> {
    match kind {
        literal_kind::BYTE => drop(c.read_u8()?),
        literal_kind::WORD => drop(c.read_u16()?),
        literal_kind::DWORD | literal_kind::REAL4 => drop(c.read_u32()?),
        literal_kind::QWORD | literal_kind::REAL8 => drop(c.read_u64()?),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    }
    Ok(())
}

fn skip_return_payload(c: &mut Cursor<'_>, kind: u8) -> VmResult<()> {
    match kind {
        return_kind::VOID | return_kind::REG => {}
        return_kind::BYTE => drop(c.read_u8()?),
        return_kind::WORD => drop(c.read_u16()?),
        return_kind::DWORD | return_kind::REAL4 => drop(c.read_u32()?),
        return_kind::QWORD | return_kind::REAL8 => drop(c.read_u64()?),
        return_kind::VAR => drop(c.read_cstr()?),
        _ => return Err(VmError::BadCommand { opcode: kind }),
    }
    Ok(())
}

/// Decode and discard one operand (shared shape for argument lists,
/// arithmetic's right-hand operand, and comparator operands).
fn skip_operand(c: &mut Cursor<'_>) -> VmResult<()> {
    let kind = c.read_u8()?;
    match kind {
        operand_kind::BYTE => drop(c.read_u8()?),
        operand_kind::WORD => drop(c.read_u16()?),
        operand_kind::DWORD | operand_kind::REAL4 => drop(c.read_u32()?),
        operand_kind::QWORD | operand_kind::REAL8 => drop(c.read_u64()?),
        operand_kind::VALUE | operand_kind::STRING => drop(c.read_cstr()?),
        operand_kind::RET => {}
        _ => return Err(VmError::BadCommand { opcode: kind }),
    }
    Ok(())
}

fn skip_arg_list(c: &mut Cursor<'_>) -> VmResult<()> {
    let n = c.read_u8()? as usize;
    for _ in 0..n {
        skip_operand(c)?;
    }
    Ok(())
}

fn skip_conditional_payload(c: &mut Cursor<'_>) -> VmResult<()> {
    let cmp = c.read_u8()?;
    skip_operand(c)?;
    if cmp != comparator::TRUTHY {
        skip_operand(c)?;
    }
    c.read_u64()?; // off
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fixed_width_fields_in_order() {
        let bytes = [0x05u8, 0xAA, 0xBB, 0x01, 0x02, 0x03, 0x04];
        let mut c = Cursor::new(&bytes);
        assert_eq!(c.read_u8().unwrap(), 0x05);
        assert_eq!(c.read_u16().unwrap(), 0xBBAA);
        assert_eq!(c.read_u32().unwrap(), 0x04030201);
    }

    #[test]
    fn reads_nul_terminated_name() {
        let bytes = b"Hello\0rest";
        let mut c = Cursor::new(bytes);
        assert_eq!(c.read_cstr().unwrap(), "Hello");
        assert_eq!(c.pos(), 6);
    }

    #[test]
    fn truncated_read_is_an_error() {
        let bytes = [0x01u8];
        let mut c = Cursor::new(&bytes);
        assert!(c.read_u32().is_err());
    }

    #[test]
    fn unterminated_name_is_an_error() {
        let bytes = b"no-nul-here";
        let mut c = Cursor::new(bytes);
        assert!(c.read_cstr().is_err());
    }

    #[test]
    fn skip_instruction_advances_past_a_declare_var() {
        let mut bytes = vec![encode_declare_var(crate::value::TypeTag::Int)];
        bytes.extend_from_slice(b"x\0");
        bytes.push(Opcode::Noop as u8);
        let mut c = Cursor::new(&bytes);
        skip_instruction(&mut c).unwrap();
        assert_eq!(c.pos(), bytes.len() - 1);
    }

    #[test]
    fn skip_instruction_consumes_the_elif_cleanup_offset() {
        let mut bytes = vec![Opcode::Elif as u8];
        bytes.extend_from_slice(&99u64.to_le_bytes()); // cleanup-off
        bytes.push(comparator::TRUTHY);
        bytes.push(operand_kind::BYTE);
        bytes.push(1);
        bytes.extend_from_slice(&42u64.to_le_bytes()); // off
        bytes.push(Opcode::Noop as u8);
        let mut c = Cursor::new(&bytes);
        skip_instruction(&mut c).unwrap();
        assert_eq!(c.pos(), bytes.len() - 1);
    }

    #[test]
    fn skip_instruction_rejects_an_unknown_opcode() {
        let bytes = [0xEFu8];
        let mut c = Cursor::new(&bytes);
        assert!(skip_instruction(&mut c).is_err());
    }
}
