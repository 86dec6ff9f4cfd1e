//! Member descriptors: where a named field lives inside a native block and
//! how to convert it.

use std::ffi::{c_char, c_int, c_long, c_uint, c_ulong, c_void};
use std::mem::size_of;

use indexmap::IndexMap;
use thiserror::Error;

/// The native representation of a bound member.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Pointer,
    SChar,
    SShort,
    SLong,
    SInt,
    UChar,
    UShort,
    ULong,
    UInt,
    /// A `char *`; assignment stores the interned string's pointer.
    String,
    Boolean,
    Float,
    Double,
}

impl TypeTag {
    const ALL: [TypeTag; 13] = [
        TypeTag::Pointer,
        TypeTag::SChar,
        TypeTag::SShort,
        TypeTag::SLong,
        TypeTag::SInt,
        TypeTag::UChar,
        TypeTag::UShort,
        TypeTag::ULong,
        TypeTag::UInt,
        TypeTag::String,
        TypeTag::Boolean,
        TypeTag::Float,
        TypeTag::Double,
    ];

    /// Width in bytes of the native field.
    pub fn size(self) -> usize {
        match self {
            TypeTag::Pointer => size_of::<*mut c_void>(),
            TypeTag::SChar | TypeTag::UChar | TypeTag::Boolean => 1,
            TypeTag::SShort | TypeTag::UShort => 2,
            TypeTag::SInt => size_of::<c_int>(),
            TypeTag::UInt => size_of::<c_uint>(),
            TypeTag::SLong => size_of::<c_long>(),
            TypeTag::ULong => size_of::<c_ulong>(),
            TypeTag::String => size_of::<*const c_char>(),
            TypeTag::Float => 4,
            TypeTag::Double => 8,
        }
    }
}

impl TryFrom<u8> for TypeTag {
    type Error = DescriptorError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        TypeTag::ALL
            .get(raw as usize)
            .copied()
            .ok_or(DescriptorError::UnknownTag(raw))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("unknown member type tag {0}")]
    UnknownTag(u8),
    #[error("member '{0}' is described twice")]
    Duplicate(&'static str),
}

/// A named field at a byte offset inside a native block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemberDescriptor {
    pub offset: usize,
    pub name: &'static str,
    pub tag: TypeTag,
}

impl MemberDescriptor {
    pub const fn new(offset: usize, name: &'static str, tag: TypeTag) -> Self {
        MemberDescriptor { offset, name, tag }
    }

    /// Build a descriptor from an untyped tag, as found in tables produced
    /// outside Rust.
    pub fn from_raw(offset: usize, name: &'static str, raw: u8) -> Result<Self, DescriptorError> {
        Ok(MemberDescriptor::new(offset, name, TypeTag::try_from(raw)?))
    }

    /// One past the last byte this member touches.
    pub fn end(&self) -> usize {
        self.offset + self.tag.size()
    }
}

/// The members of one bound type, by name.
#[derive(Clone, Debug, Default)]
pub struct DescriptorTable {
    members: IndexMap<&'static str, MemberDescriptor>,
    extent: usize,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(
        members: impl IntoIterator<Item = MemberDescriptor>,
    ) -> Result<Self, DescriptorError> {
        let mut table = DescriptorTable::new();
        for m in members {
            table.insert(m)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, member: MemberDescriptor) -> Result<(), DescriptorError> {
        if self.members.contains_key(member.name) {
            return Err(DescriptorError::Duplicate(member.name));
        }
        self.extent = self.extent.max(member.end());
        self.members.insert(member.name, member);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MemberDescriptor> {
        self.members.get(name)
    }

    /// Smallest block size that holds every member.
    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberDescriptor> {
        self.members.values()
    }
}

/// Rust field types with a native member representation.
pub trait MemberField {
    const TAG: TypeTag;
}

macro_rules! member_field {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl MemberField for $ty {
                const TAG: TypeTag = TypeTag::$tag;
            }
        )*
    };
}

member_field! {
    i8 => SChar,
    i16 => SShort,
    i32 => SInt,
    u8 => UChar,
    u16 => UShort,
    u32 => UInt,
    f32 => Float,
    f64 => Double,
    bool => Boolean,
    *const c_char => String,
    *mut c_char => String,
    *mut c_void => Pointer,
    *const c_void => Pointer,
}

// `long` is 32 bits on Windows, where it already maps to `i32`.
#[cfg(not(windows))]
member_field! {
    c_long => SLong,
    c_ulong => ULong,
}

/// Tag of the field selected by `field`. Used by [`member!`](crate::member).
pub fn tag_of<S, F: MemberField>(_field: fn(&S) -> &F) -> TypeTag {
    F::TAG
}

/// Describe a field of a `#[repr(C)]` struct, taking its offset and type
/// tag from the declaration.
///
/// ```
/// use tether::member;
/// #[repr(C)]
/// struct Point { x: i32, y: f64 }
/// let d = member!(Point, y);
/// assert_eq!(d.offset, 8);
/// assert_eq!(d.name, "y");
/// ```
#[macro_export]
macro_rules! member {
    ($ty:ty, $field:ident) => {
        $crate::member!($ty, $field, stringify!($field))
    };
    ($ty:ty, $field:ident, $name:expr) => {
        $crate::descriptor::MemberDescriptor::new(
            ::core::mem::offset_of!($ty, $field),
            $name,
            $crate::descriptor::tag_of(|v: &$ty| &v.$field),
        )
    };
}
