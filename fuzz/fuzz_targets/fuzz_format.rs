#![no_main]

use libfuzzer_sys::fuzz_target;
use tether::format::{marshal, Arg};
use tether::State;

fuzz_target!(|data: &[u8]| {
    // Marshaling must never panic: malformed formats are errors, and a
    // failed marshal leaves the stack as it found it.
    let Ok(format) = std::str::from_utf8(data) else {
        return;
    };
    let args = [
        Arg::Bool(true),
        Arg::Int(1),
        Arg::Str("k"),
        Arg::Bool(false),
        Arg::Num(0.5),
        Arg::Int(-1),
        Arg::Str("v"),
    ];
    let mut state = State::new();
    state.push_integer(0);
    match marshal(&mut state, format, &args) {
        Ok(n) => assert_eq!(state.top(), n + 1),
        Err(_) => assert_eq!(state.top(), 1),
    }
});
