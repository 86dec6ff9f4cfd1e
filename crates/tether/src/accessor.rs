//! Typed access to native objects behind script handles, and the stock
//! constructor and finalizer hooks for bound classes.
//!
//! A handle for a [`Bound`] type `T` is one of:
//! - an instance of `T::TYPE_NAME`, whose block holds the `T` itself;
//! - an instance of `T::BOXED_TYPE_NAME`, whose block holds a `*mut T`;
//! - a full userdata or light handle of any other kind, taken to address
//!   a `T` directly.
//!
//! The hooks (`cons_*`, `gc_*`) have the [`NativeFn`](tether_runtime::NativeFn)
//! signature and are meant to be installed with
//! [`ClassDef::constructor`](crate::class::ClassDef::constructor) and
//! [`ClassDef::finalizer`](crate::class::ClassDef::finalizer). Constructors
//! receive the new instance as argument 1 and the source as argument 2.

use std::ffi::c_void;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

use tether_core::gc::USERDATA_ALIGN;
use tether_runtime::{LuaError, StackIndex, State};

use crate::args;
use crate::class::{self, Bound};
use crate::shared::{self, RefCounted};

fn block_ptr(state: &State, idx: StackIndex) -> Result<NonNull<u8>, LuaError> {
    state.to_userdata(idx).ok_or_else(|| match idx {
        StackIndex::Absolute(arg) => state.type_error(arg, "userdata"),
        _ => LuaError::runtime(format!("userdata expected, got {}", state.type_name(idx))),
    })
}

/// Address of the `T` behind the handle at `idx`.
pub fn ptr<T: Bound>(state: &mut State, idx: impl Into<StackIndex>) -> Result<NonNull<T>, LuaError> {
    let idx = state.abs_index(idx);
    if class::is_instance(state, idx)? {
        if class::is_type(state, idx, T::BOXED_TYPE_NAME)? {
            return boxed_get::<T>(state, idx)?
                .ok_or_else(|| LuaError::runtime(format!("{} holds a null pointer", T::BOXED_TYPE_NAME)));
        }
        if !class::is_type(state, idx, T::TYPE_NAME)? {
            let arg = match idx {
                StackIndex::Absolute(n) => n.to_string(),
                other => format!("{other:?}"),
            };
            return Err(LuaError::runtime(format!(
                "Arg #{arg}: non-{} / {}",
                T::TYPE_NAME,
                T::BOXED_TYPE_NAME
            )));
        }
    }
    Ok(block_ptr(state, idx)?.cast())
}

/// Like [`ptr`], but nil or none yields `None`.
pub fn ptr_or_null<T: Bound>(
    state: &mut State,
    idx: impl Into<StackIndex>,
) -> Result<Option<NonNull<T>>, LuaError> {
    let idx = state.abs_index(idx);
    if state.is_none_or_nil(idx) {
        return Ok(None);
    }
    ptr::<T>(state, idx).map(Some)
}

/// Read the pointer held by the boxed instance at `idx`.
pub fn boxed_get<T>(state: &State, idx: impl Into<StackIndex>) -> Result<Option<NonNull<T>>, LuaError> {
    let block = block_ptr(state, idx.into())?;
    // SAFETY: boxed blocks are pointer-sized and pointer-aligned.
    Ok(NonNull::new(unsafe { block.as_ptr().cast::<*mut T>().read() }))
}

/// Store `value` in the boxed instance at `dest`. No reference counting.
pub fn boxed_set<T>(state: &State, dest: impl Into<StackIndex>, value: *mut T) -> Result<(), LuaError> {
    let block = block_ptr(state, dest.into())?;
    // SAFETY: boxed blocks are pointer-sized and pointer-aligned.
    unsafe { block.as_ptr().cast::<*mut T>().write(value) };
    Ok(())
}

/// Store the object behind the handle at `source` in the boxed instance
/// at `dest`.
pub fn boxed_set_from<T: Bound>(
    state: &mut State,
    dest: impl Into<StackIndex>,
    source: impl Into<StackIndex>,
) -> Result<(), LuaError> {
    let dest = state.abs_index(dest);
    let value = ptr::<T>(state, source)?;
    boxed_set(state, dest, value.as_ptr())
}

/// Store `value` in the boxed instance at `dest`, retaining it. With
/// `check_target`, the previously held object (if any) is released; the
/// new value is retained first, so storing the same object is safe.
///
/// # Safety
///
/// `value` and the currently held pointer (when `check_target` is set)
/// must be live objects, and the instance must own one reference to its
/// current target.
pub unsafe fn boxed_set_ref<T: RefCounted>(
    state: &State,
    dest: impl Into<StackIndex>,
    value: Option<NonNull<T>>,
    check_target: bool,
) -> Result<(), LuaError> {
    let dest = dest.into();
    let old = boxed_get::<T>(state, dest)?;
    if let Some(v) = value {
        shared::retain(v);
    }
    if check_target {
        if let Some(old) = old {
            shared::release(old);
        }
    }
    boxed_set(state, dest, value.map_or(ptr::null_mut(), NonNull::as_ptr))
}

/// [`boxed_set_ref`] with the object behind the handle at `source`, or
/// null when `source` is nil.
///
/// # Safety
///
/// Same as [`boxed_set_ref`].
pub unsafe fn boxed_set_ref_from<T: Bound + RefCounted>(
    state: &mut State,
    dest: impl Into<StackIndex>,
    source: impl Into<StackIndex>,
    check_target: bool,
) -> Result<(), LuaError> {
    let dest = state.abs_index(dest);
    let value = ptr_or_null::<T>(state, source)?;
    boxed_set_ref(state, dest, value, check_target)
}

/// Push a new `T::TYPE_NAME` instance built from a copy of `value`. The
/// class constructor must be [`cons_copy::<T>`].
pub fn copy<T: Bound + Clone>(state: &mut State, value: &T) -> Result<(), LuaError> {
    class::new_instance(state, T::TYPE_NAME, "u", &args![value as *const T])
}

/// Fill the slot at `idx` with `value`, or push a fresh copy if the slot
/// is nil or absent. With `truncate`, the stack is cut back to `idx` after
/// filling so the filled slot is the result.
pub fn get_member_arg<T: Bound + Clone>(
    state: &mut State,
    idx: usize,
    value: &T,
    truncate: bool,
) -> Result<usize, LuaError> {
    let slot = StackIndex::Absolute(idx);
    if state.is_none_or_nil(slot) {
        copy(state, value)?;
    } else {
        let target = ptr::<T>(state, slot)?;
        // SAFETY: the handle addresses a live, initialized `T`.
        unsafe { *target.as_ptr() = value.clone() };
        if truncate {
            state.set_top(idx);
        }
    }
    Ok(1)
}

/// Like [`get_member_arg`], with the value produced by `fill` writing into
/// a default-constructed `T`.
pub fn get_member_ref<O, T: Bound + Clone + Default>(
    state: &mut State,
    object: &O,
    idx: usize,
    fill: impl FnOnce(&O, &mut T),
    truncate: bool,
) -> Result<usize, LuaError> {
    let mut value = T::default();
    fill(object, &mut value);
    get_member_arg(state, idx, &value, truncate)
}

/// Like [`get_member_arg`], with the value returned by `get`.
pub fn get_member_retv<O, T: Bound + Clone>(
    state: &mut State,
    object: &O,
    idx: usize,
    get: impl FnOnce(&O) -> T,
    truncate: bool,
) -> Result<usize, LuaError> {
    let value = get(object);
    get_member_arg(state, idx, &value, truncate)
}

fn check_layout<T>() -> Result<(), LuaError> {
    if align_of::<T>() > USERDATA_ALIGN {
        return Err(LuaError::runtime(format!(
            "alignment {} exceeds userdata alignment {USERDATA_ALIGN}",
            align_of::<T>()
        )));
    }
    Ok(())
}

/// Constructor: copy the `T` behind argument 2 into the new instance.
pub fn cons_copy<T: Bound + Clone>(state: &mut State) -> Result<usize, LuaError> {
    check_layout::<T>()?;
    let source = ptr::<T>(state, 2)?;
    let dest = block_ptr(state, StackIndex::Absolute(1))?.cast::<T>();
    // SAFETY: the instance block is sized and aligned for `T` and still
    // uninitialized; the source is a live `T`.
    unsafe { dest.as_ptr().write((*source.as_ptr()).clone()) };
    Ok(0)
}

/// Constructor for boxed instances: point at the object behind argument 2.
/// The object is borrowed, not owned.
pub fn cons_boxed_copy<T: Bound>(state: &mut State) -> Result<usize, LuaError> {
    boxed_set_from::<T>(state, 1, 2)?;
    Ok(0)
}

/// Constructor for boxed instances: adopt a new default `T`, retaining it.
pub fn cons_ref<T: RefCounted + Default>(state: &mut State) -> Result<usize, LuaError> {
    let fresh = NonNull::from(Box::leak(Box::<T>::default()));
    // SAFETY: `fresh` is live and the instance holds no target yet.
    unsafe { boxed_set_ref(state, 1, Some(fresh), false)? };
    Ok(0)
}

/// Constructor for boxed instances: share the target of the boxed
/// instance at argument 2.
pub fn cons_ref_copy<T: Bound + RefCounted>(state: &mut State) -> Result<usize, LuaError> {
    let target = boxed_get::<T>(state, 2)?;
    // SAFETY: the source instance keeps its target alive.
    unsafe { boxed_set_ref(state, 1, target, false)? };
    Ok(0)
}

/// Constructor for boxed instances: retain the object behind argument 2,
/// which must not be nil.
pub fn cons_refp<T: Bound + RefCounted>(state: &mut State) -> Result<usize, LuaError> {
    let target = ptr::<T>(state, 2)?;
    // SAFETY: the handle addresses a live object.
    unsafe { boxed_set_ref(state, 1, Some(target), false)? };
    Ok(0)
}

/// Constructor for boxed instances: retain the object behind argument 2,
/// or hold null when it is nil.
pub fn cons_refp_or_null<T: Bound + RefCounted>(state: &mut State) -> Result<usize, LuaError> {
    // SAFETY: the handle, if any, addresses a live object.
    unsafe { boxed_set_ref_from::<T>(state, 1, 2, false)? };
    Ok(0)
}

/// Finalizer for boxed reference-counted instances: release the target.
pub fn gc_ref<T: RefCounted>(state: &mut State) -> Result<usize, LuaError> {
    // SAFETY: the instance owns one reference to its target.
    unsafe { boxed_set_ref::<T>(state, 1, None, true)? };
    Ok(0)
}

/// Finalizer for inline instances: drop the `T` in place.
pub fn gc_dtor<T>(state: &mut State) -> Result<usize, LuaError> {
    let block = block_ptr(state, StackIndex::Absolute(1))?;
    // SAFETY: finalizers run once, and inline instances hold an
    // initialized `T` by the time they can be collected.
    unsafe { ptr::drop_in_place(block.as_ptr().cast::<T>()) };
    Ok(0)
}

/// Allocate an uninitialized, registry-anchored block for a `T` whose
/// finalizer drops it in place. The caller must initialize the block
/// before the object can be released.
pub fn install_raw_gc_object<T: 'static>(state: &mut State) -> Result<NonNull<T>, LuaError> {
    check_layout::<T>()?;
    let block = state.new_userdata(size_of::<T>());
    state.create_table(0, 1);
    state.push_function(gc_dtor::<T>);
    state.set_field(-2, "__gc")?;
    state.set_metatable(-2)?;
    // registry[light(block)] = userdata
    state.push_light(block.as_ptr().cast::<c_void>())?;
    state.insert(-2)?;
    state.raw_set(StackIndex::REGISTRY)?;
    Ok(block.cast())
}

/// Like [`install_raw_gc_object`], with the block holding `T::default()`.
pub fn install_gc_object<T: Default + 'static>(state: &mut State) -> Result<NonNull<T>, LuaError> {
    let object = install_raw_gc_object::<T>(state)?;
    // SAFETY: the block is sized and aligned for `T`.
    unsafe { object.as_ptr().write(T::default()) };
    Ok(object)
}

/// Drop the registry anchor of an object from [`install_gc_object`], so
/// the next collection finalizes it.
pub fn release_gc_object<T>(state: &mut State, object: NonNull<T>) -> Result<(), LuaError> {
    state.push_light(object.as_ptr().cast::<c_void>())?;
    state.push_nil();
    state.raw_set(StackIndex::REGISTRY)
}
