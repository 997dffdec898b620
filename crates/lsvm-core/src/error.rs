//! VM error kinds (`spec.md` §7).
//!
//! Every fallible runtime API returns `Result<T, VmError>`. In addition to
//! the `Result`, the interpreter records the same information inside the
//! owning [`crate::env::Environment`]'s exception slot (`spec.md` §4.F) so
//! that a frame-chain walk can print a stack trace after the dispatch loop
//! has already unwound past the point of failure.

use thiserror::Error;

/// The error kinds raised anywhere in the runtime, one per row of the
/// `spec.md` §7 table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    /// Heap or host allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The environment's stack pointer would cross the stack floor.
    #[error("stack overflow")]
    StackOverflow,

    /// An unknown opcode or malformed operand was decoded.
    #[error("bad command: opcode {opcode:#04x}")]
    BadCommand {
        /// The opcode byte that could not be dispatched.
        opcode: u8,
    },

    /// An internal invariant was violated (e.g. missing current scope).
    #[error("internal vm error: {0}")]
    Internal(String),

    /// A call target exists but cannot be invoked as-is (abstract function
    /// reached, stdio misuse, etc).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// `load_class` could not locate or parse the requested class.
    #[error("class not found: {0}")]
    ClassNotFound(String),

    /// Function-name resolution (`spec.md` §4.F) failed.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// A named field does not exist on the receiver's class.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// A receiver or array access target was null.
    #[error("null dereference")]
    NullDereference,

    /// `resolve_variable` failed, or a name was redeclared in one scope.
    #[error("bad variable name: {0}")]
    BadVariableName(String),

    /// An array index was out of `[0, length)`.
    #[error("bad array index: {index} (length {length})")]
    BadArrayIndex {
        /// The offending index.
        index: i64,
        /// The array's length.
        length: u32,
    },

    /// A native symbol could not be resolved in any loaded library.
    #[error("link error: {0}")]
    LinkError(String),
}

/// Convenience alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;
