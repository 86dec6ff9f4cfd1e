//! Tagged stack indices.

/// A location outside the value stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pseudo {
    /// The registry table.
    Registry,
    /// The n-th (1-based) captured value of the running function.
    Upvalue(usize),
    /// The global namespace table.
    Environment,
}

/// An index naming a value reachable from the running frame.
///
/// Absolute indices are 1-based from the frame's first argument.
/// `RelativeToTop(1)` is the topmost value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackIndex {
    Absolute(usize),
    RelativeToTop(usize),
    Pseudo(Pseudo),
}

impl StackIndex {
    pub const TOP: StackIndex = StackIndex::RelativeToTop(1);
    pub const REGISTRY: StackIndex = StackIndex::Pseudo(Pseudo::Registry);
    pub const ENVIRONMENT: StackIndex = StackIndex::Pseudo(Pseudo::Environment);

    pub fn upvalue(n: usize) -> StackIndex {
        StackIndex::Pseudo(Pseudo::Upvalue(n))
    }

    pub fn is_pseudo(self) -> bool {
        matches!(self, StackIndex::Pseudo(_))
    }
}

/// Positive numbers are absolute, negative numbers count down from the top.
/// Zero is not a valid index and maps to `Absolute(0)`, which never resolves.
impl From<i32> for StackIndex {
    fn from(i: i32) -> Self {
        if i < 0 {
            StackIndex::RelativeToTop(i.unsigned_abs() as usize)
        } else {
            StackIndex::Absolute(i as usize)
        }
    }
}

impl From<Pseudo> for StackIndex {
    fn from(p: Pseudo) -> Self {
        StackIndex::Pseudo(p)
    }
}
