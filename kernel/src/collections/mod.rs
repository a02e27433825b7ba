//! Collections used by the process core

pub mod dynamic_array;

pub use dynamic_array::{DynamicArray, TypedArray};
