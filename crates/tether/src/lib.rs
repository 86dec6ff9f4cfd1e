//! Tether: format-string argument marshaling and reflective property
//! binding on top of the tether runtime.

pub mod accessor;
pub mod arg;
pub mod call;
pub mod class;
pub mod descriptor;
pub mod format;
pub mod helpers;
pub mod peer;
pub mod shared;

pub use call::{
    call, call_core, call_global, call_method, call_method_at, fatal_report, load_libs, pcall,
    pcall_ef, pcall_global, pcall_method, pcall_method_at, Mode, Thrown,
};
pub use class::{Bound, ClassDef};
pub use descriptor::{DescriptorTable, MemberDescriptor, TypeTag};
pub use format::{marshal, Arg, FormatError, FormatSpec};
pub use peer::{bind_peer, install_peer, Addressing, OverrideTable, Peer};
pub use tether_runtime::{LuaError, NativeFn, StackIndex, State, StateConfig, MULTRET};
