//! Tether runtime: the stack-based state native code talks to.

pub mod cache;
pub mod callinfo;
pub mod config;
pub mod error;
pub mod index;
pub mod metamethod;
pub mod state;

pub use cache::CacheKey;
pub use config::StateConfig;
pub use error::LuaError;
pub use index::{Pseudo, StackIndex};
pub use state::{NativeFn, State, MULTRET};
pub use tether_core::object::ValueType;
