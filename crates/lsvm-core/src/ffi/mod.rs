//! Dynamic native-library loading and the native call bridge
//! (`spec.md` §4.E, §4.H, §4.J).

/// Native call trampoline: argument buffer construction and return
/// decoding.
pub mod bridge;

/// `dlopen`/`dlsym`/`dlclose` wrappers and ordered symbol resolution.
pub mod loader;

pub use bridge::invoke;
pub use loader::{LibrarySet, LoadError, Library};
