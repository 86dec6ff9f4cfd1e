use std::ffi::{c_char, CStr};
use std::ptr;

use tether::accessor::{cons_copy, gc_dtor, ptr as object_ptr};
use tether::class::{define, is_type, new_instance};
use tether::descriptor::DescriptorTable;
use tether::{args, member, Addressing, Bound, ClassDef, LuaError, OverrideTable, Peer, State};

#[derive(Clone, Debug)]
#[repr(C)]
struct Sprite {
    x: i32,
    y: i32,
    scale: f32,
    name: *const c_char,
    hidden: bool,
}

impl Default for Sprite {
    fn default() -> Self {
        Sprite {
            x: 0,
            y: 0,
            scale: 1.0,
            name: ptr::null(),
            hidden: false,
        }
    }
}

impl Bound for Sprite {
    const TYPE_NAME: &'static str = "Sprite";
    const BOXED_TYPE_NAME: &'static str = "SpriteRef";
}

fn sprite_members() -> DescriptorTable {
    DescriptorTable::from_members([
        member!(Sprite, x),
        member!(Sprite, y),
        member!(Sprite, scale),
        member!(Sprite, name),
        member!(Sprite, hidden),
    ])
    .unwrap()
}

fn area(s: &mut State) -> Result<usize, LuaError> {
    let sprite = object_ptr::<Sprite>(s, 1)?;
    let sprite = unsafe { sprite.as_ref() };
    s.push_integer(sprite.x as i64 * sprite.y as i64);
    Ok(1)
}

fn reject_negative(s: &mut State) -> Result<usize, LuaError> {
    let v = s.check_integer(3)?;
    if v < 0 {
        return Err(LuaError::runtime("x must not be negative"));
    }
    let data = s.to_pointer(4).ok_or_else(|| LuaError::runtime("no data"))?;
    unsafe { (*data.cast::<Sprite>()).x = v as i32 };
    Ok(0)
}

fn sprite_state() -> State {
    let mut s = State::new();
    let peer = Peer::new(sprite_members(), Addressing::Inline)
        .with_setters(OverrideTable::new().with("x", reject_negative));
    define(
        &mut s,
        ClassDef::inline::<Sprite>()
            .constructor(cons_copy::<Sprite>)
            .finalizer(gc_dtor::<Sprite>)
            .method("area", area)
            .properties(peer),
    )
    .unwrap();
    s
}

#[test]
fn test_script_view_of_native_object() {
    let mut s = sprite_state();
    let proto = Sprite {
        x: 3,
        y: 4,
        scale: 0.5,
        ..Sprite::default()
    };
    new_instance(&mut s, "Sprite", "u", &args![&proto as *const Sprite]).unwrap();
    assert!(is_type(&mut s, 1, "Sprite").unwrap());

    s.get_field(1, "scale").unwrap();
    assert_eq!(s.to_number(-1), Some(0.5));
    s.get_field(1, "name").unwrap();
    assert!(s.is_nil(-1));
    s.pop(2);

    tether::call_method_at(&mut s, 1, "area", 1, "", &[]).unwrap();
    assert_eq!(s.to_integer(-1), Some(12));
    s.pop(1);

    s.push_string("hero");
    s.set_field(1, "name").unwrap();
    s.push_bool(true);
    s.set_field(1, "hidden").unwrap();
    let sprite = unsafe { object_ptr::<Sprite>(&mut s, 1).unwrap().as_ref() };
    assert!(sprite.hidden);
    assert_eq!(unsafe { CStr::from_ptr(sprite.name) }.to_bytes(), b"hero");
}

#[test]
fn test_setter_override_guards_writes() {
    let mut s = sprite_state();
    let proto = Sprite {
        name: ptr::null(),
        ..Sprite::default()
    };
    new_instance(&mut s, "Sprite", "u", &args![&proto as *const Sprite]).unwrap();
    s.push_integer(9);
    s.set_field(1, "x").unwrap();
    s.push_integer(-1);
    let err = s.set_field(1, "x").unwrap_err();
    assert_eq!(err.to_string(), "x must not be negative");
    s.set_top(1);
    s.get_field(1, "x").unwrap();
    assert_eq!(s.to_integer(-1), Some(9));
}

#[test]
fn test_protected_constructor_failure() {
    let mut s = sprite_state();
    s.push_integer(1);
    // The copy constructor needs a handle, not a number.
    let err = new_instance(&mut s, "Sprite", "i", &args![5]).unwrap_err();
    assert!(err.to_string().contains("userdata"), "{err}");
    assert_eq!(s.top(), 1);
}
