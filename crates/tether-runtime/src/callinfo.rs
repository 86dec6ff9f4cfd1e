//! Call frame information.

use std::panic::Location;

/// Where a native function came from, reported by frame introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Created at this source location.
    Rust(&'static Location<'static>),
    /// Registered under a name; no line is known.
    Named(&'static str),
}

/// A call frame on the state's call stack.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack position where the function value lives (results land here).
    pub func_stack_idx: usize,
    /// Stack position of the first argument.
    pub base: usize,
    /// Expected number of results (-1 = multi-return).
    pub num_results: i32,
    pub origin: Origin,
}

impl CallInfo {
    pub fn new(func_stack_idx: usize, num_results: i32, origin: Origin) -> Self {
        CallInfo {
            func_stack_idx,
            base: func_stack_idx + 1,
            num_results,
            origin,
        }
    }
}

/// Source position of an active frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub source: String,
    pub line: Option<u32>,
}

impl From<Origin> for FrameInfo {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Rust(loc) => FrameInfo {
                source: loc.file().to_string(),
                line: Some(loc.line()),
            },
            Origin::Named(name) => FrameInfo {
                source: name.to_string(),
                line: None,
            },
        }
    }
}
