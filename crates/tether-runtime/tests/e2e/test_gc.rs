use super::helpers::*;
use std::cell::Cell;
use tether_runtime::{LuaError, State, StateConfig};

thread_local! {
    static FINALIZED: Cell<usize> = const { Cell::new(0) };
}

fn count_finalizer(_: &mut State) -> Result<usize, LuaError> {
    FINALIZED.with(|f| f.set(f.get() + 1));
    Ok(0)
}

fn finalizable(s: &mut State) {
    s.new_userdata(8);
    s.new_metatable("Finalizable").unwrap();
    s.push_function(count_finalizer);
    s.raw_set_field(-2, "__gc").unwrap();
    s.set_metatable(-2).unwrap();
}

#[test]
fn test_reachable_objects_survive() {
    let mut s = manual_gc_state();
    s.new_table();
    s.new_table();
    s.raw_seti(1, 1).unwrap();
    s.push_integer(i64::MAX);
    s.set_global("big").unwrap();
    let before = s.live_objects();
    s.collect_garbage();
    assert_eq!(s.live_objects(), before);
    s.raw_geti(1, 1).unwrap();
    assert!(s.is_table(-1));
    s.get_global("big").unwrap();
    assert_eq!(s.to_integer(-1), Some(i64::MAX));
}

#[test]
fn test_upvalues_keep_values_alive() {
    fn noop(_: &mut State) -> Result<usize, LuaError> {
        Ok(0)
    }
    let mut s = manual_gc_state();
    s.new_table();
    s.push_closure(noop, 1);
    let before = s.live_objects();
    s.collect_garbage();
    assert_eq!(s.live_objects(), before);
    s.pop(1);
    assert_eq!(s.collect_garbage(), 2);
}

#[test]
fn test_finalizer_runs_once_for_unreachable_userdata() {
    FINALIZED.with(|f| f.set(0));
    let mut s = manual_gc_state();
    finalizable(&mut s);
    s.collect_garbage();
    assert_eq!(FINALIZED.with(Cell::get), 0);
    s.pop(1);
    s.collect_garbage();
    assert_eq!(FINALIZED.with(Cell::get), 1);
    s.collect_garbage();
    s.collect_garbage();
    assert_eq!(FINALIZED.with(Cell::get), 1);
}

#[test]
fn test_automatic_collection_steps() {
    let mut s = State::with_config(StateConfig {
        gc_interval: Some(16),
        ..StateConfig::default()
    });
    for _ in 0..1_000 {
        s.new_table();
        s.pop(1);
    }
    assert!(s.live_objects() < 64);
}
