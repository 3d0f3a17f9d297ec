//! Dependency crate for auto-generated data types
//!
//! Hostcyphal stack users should not depend on this crate directly.
//!
//! The stack relies on the `canadensis` code generator to convert Cyphal DSDL to
//! (de)serializable Rust structs. Generated types implement [`Serialize`] and [`Deserialize`]
//! and declare their extent through [`DataType`]; the presentation layer sizes receive
//! buffers from the extent.

pub use canadensis_encoding::*;

/// The receive buffer size for a data type, derived from the DSDL extent.
///
/// Falls back to the provided value for delimited types whose extent is not declared.
pub fn extent_bytes<T: DataType>(fallback: usize) -> usize {
    match T::EXTENT_BYTES {
        Some(extent) => extent as usize,
        None => fallback,
    }
}

/// Serializes a value into a freshly allocated buffer sized from `size_bits`.
pub fn to_vec<T: Serialize>(value: &T) -> Vec<u8> {
    let length = value.size_bits().div_ceil(8);
    let mut bytes = vec![0; length];
    value.serialize_to_bytes(&mut bytes);
    bytes
}
