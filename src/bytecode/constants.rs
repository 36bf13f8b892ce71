//! Intrinsic names and magic numbers of the VM.
//!
//! The exact spellings come from the runtime; the decompiler only ever
//! compares against them.

/// Marks the extent of a try/catch/finally region.
pub const TRY_HOOK_FUNCTION: &str = "@@try_hook@@";

/// Constructor-call intrinsic; calls to it become `new` expressions.
pub const NEW_OBJECT_FUNCTION: &str = "@@NewGMLObject@@";

/// Struct-literal intrinsic.
pub const NULL_OBJECT_FUNCTION: &str = "@@NullObject@@";

/// Row stride of flattened 2D arrays in legacy bytecode.
pub const OLD_ARRAY_LIMIT: i32 = 32000;
