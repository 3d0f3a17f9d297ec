//! Hand-written data types for tests and examples
//!
//! Production applications generate their types from DSDL; these two cover the cases the
//! test suites need without dragging the generator in.

mod byte_array;
mod empty;

pub use byte_array::ByteArray;
pub use empty::Empty;
