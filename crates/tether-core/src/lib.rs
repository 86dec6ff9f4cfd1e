//! Tether core types: values, strings, tables and the arena heap.

pub mod gc;
pub mod object;
pub mod string;
pub mod table;
pub mod value;
