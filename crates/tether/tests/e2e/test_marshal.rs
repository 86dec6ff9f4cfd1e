use proptest::prelude::*;
use tether::{args, marshal, Arg, FormatError, FormatSpec, State};

#[test]
fn test_reused_spec() {
    let spec = FormatSpec::parse("{ K s i K s b }");
    let mut s = State::new();
    for i in 0..3 {
        marshal(&mut s, &spec, &args!["n", i, "odd", i % 2 == 1]).unwrap();
    }
    assert_eq!(s.top(), 3);
    s.get_field(3, "n").unwrap();
    assert_eq!(s.to_integer(-1), Some(2));
}

#[test]
fn test_keyed_pairs_build_exactly_those_keys() {
    let mut s = State::new();
    let n = marshal(&mut s, "{ K s i K s i }", &args!["a", 1, "b", 2]).unwrap();
    assert_eq!(n, 1);
    assert!(s.is_table(1));
    let mut seen = Vec::new();
    s.push_nil();
    while s.next(1).unwrap() {
        seen.push((s.to_string_lossy(-2).unwrap(), s.to_integer(-1).unwrap()));
        s.pop(1);
    }
    seen.sort();
    assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
    assert_eq!(s.top(), 1);
}

#[test]
fn test_deeply_nested_table() {
    let mut s = State::new();
    marshal(&mut s, "{{{{ i }}}}", &args![9]).unwrap();
    for _ in 0..4 {
        s.raw_geti(-1, 1).unwrap();
    }
    assert_eq!(s.to_integer(-1), Some(9));
}

#[test]
fn test_relative_index_into_partial_table() {
    let mut s = State::new();
    s.push_string("outer");
    // `r -1` sees the table under construction on top of the stack.
    marshal(&mut s, "{ a r }", &args![-1, -1]).unwrap();
    s.raw_geti(-1, 1).unwrap();
    assert_eq!(s.to_string_lossy(-1).as_deref(), Some("outer"));
    s.pop(1);
    s.raw_geti(-1, 2).unwrap();
    assert!(s.is_table(-1));
}

#[test]
fn test_error_keeps_first_problem() {
    let mut s = State::new();
    let err = marshal(&mut s, "{ K 0 i", &args![1]).unwrap_err();
    assert_eq!(err, FormatError::NullKey);
}

/// A format built from `n` conditional integers inside a table.
fn conditional_table(flags: &[bool]) -> (String, Vec<Arg<'static>>) {
    let mut format = String::from("{");
    let mut args = Vec::new();
    for (i, &flag) in flags.iter().enumerate() {
        format.push_str(" C i");
        args.push(Arg::Bool(flag));
        args.push(Arg::Int(i as i64));
    }
    format.push_str(" }");
    (format, args)
}

proptest! {
    #[test]
    fn prop_conditions_keep_args_aligned(flags in proptest::collection::vec(any::<bool>(), 0..16)) {
        let (format, args) = conditional_table(&flags);
        let mut s = State::new();
        marshal(&mut s, format.as_str(), &args).unwrap();
        let kept: Vec<i64> = flags
            .iter()
            .enumerate()
            .filter(|(_, &f)| f)
            .map(|(i, _)| i as i64)
            .collect();
        prop_assert_eq!(s.raw_len(1), kept.len());
        for (slot, expected) in kept.iter().enumerate() {
            s.raw_geti(1, slot as i64 + 1).unwrap();
            prop_assert_eq!(s.to_integer(-1), Some(*expected));
            s.pop(1);
        }
    }

    #[test]
    fn prop_balanced_braces_push_one_table(depth in 1usize..12) {
        let format = format!("{}{}", "{".repeat(depth), "}".repeat(depth));
        let mut s = State::new();
        prop_assert_eq!(marshal(&mut s, format.as_str(), &[]), Ok(1));
        prop_assert!(s.is_table(1));
    }

    #[test]
    fn prop_unbalanced_braces_leave_stack_clean(open in 1usize..8, close in 0usize..8) {
        prop_assume!(open != close);
        let format = format!("{}{}", "{".repeat(open), "}".repeat(close));
        let mut s = State::new();
        s.push_integer(1);
        let err = marshal(&mut s, format.as_str(), &[]).unwrap_err();
        let expected = if open > close { FormatError::UnclosedTable } else { FormatError::UnopenedTable };
        prop_assert_eq!(err, expected);
        prop_assert_eq!(s.top(), 1);
    }

    #[test]
    fn prop_integers_round_trip(values in proptest::collection::vec(-1_000_000i64..1_000_000, 0..20)) {
        let format = "i ".repeat(values.len());
        let args: Vec<Arg<'_>> = values.iter().map(|&v| Arg::Int(v)).collect();
        let mut s = State::new();
        prop_assert_eq!(marshal(&mut s, format.as_str(), &args), Ok(values.len()));
        for (i, v) in values.iter().enumerate() {
            prop_assert_eq!(s.to_integer(i as i32 + 1), Some(*v));
        }
    }
}
