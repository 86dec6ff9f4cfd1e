//! Pre-interned names of the metafields the runtime dispatches on.

use tether_core::string::{StringId, StringInterner};

pub struct MetamethodNames {
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub gc: StringId,
    pub name: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            gc: strings.intern(b"__gc"),
            name: strings.intern(b"__name"),
        }
    }
}
