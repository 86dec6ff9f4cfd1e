use proptest::prelude::*;
use tether_runtime::{StackIndex, State};

#[derive(Clone, Debug)]
enum Op {
    Push(i64),
    Pop(usize),
    SetTop(usize),
    Insert(usize),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<i64>().prop_map(Op::Push),
        (0usize..4).prop_map(Op::Pop),
        (0usize..12).prop_map(Op::SetTop),
        (0usize..12).prop_map(Op::Insert),
        (0usize..12).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn prop_stack_matches_model(ops in proptest::collection::vec(op(), 0..64)) {
        let mut s = State::new();
        let mut model: Vec<Option<i64>> = Vec::new();
        for op in ops {
            match op {
                Op::Push(i) => {
                    s.push_integer(i);
                    model.push(Some(i));
                }
                Op::Pop(n) => {
                    s.pop(n);
                    model.truncate(model.len().saturating_sub(n));
                }
                Op::SetTop(n) => {
                    s.set_top(n);
                    model.resize(n, None);
                }
                Op::Insert(at) if at >= 1 && at <= model.len() => {
                    s.insert(StackIndex::Absolute(at)).unwrap();
                    if let Some(v) = model.pop() {
                        model.insert(at - 1, v);
                    }
                }
                Op::Remove(at) if at >= 1 && at <= model.len() => {
                    s.remove(StackIndex::Absolute(at)).unwrap();
                    model.remove(at - 1);
                }
                Op::Insert(_) | Op::Remove(_) => {}
            }
            prop_assert_eq!(s.top(), model.len());
        }
        for (i, expected) in model.iter().enumerate() {
            let idx = StackIndex::Absolute(i + 1);
            match expected {
                Some(v) => prop_assert_eq!(s.to_integer(idx), Some(*v)),
                None => prop_assert!(s.is_nil(idx)),
            }
        }
    }

    #[test]
    fn prop_border_of_dense_prefix(n in 0i64..64, hole in 1i64..64) {
        let mut s = State::new();
        s.new_table();
        for i in 1..=n {
            s.push_integer(i);
            s.raw_seti(1, i).unwrap();
        }
        prop_assert_eq!(s.raw_len(1), n as usize);
        if hole <= n {
            s.push_nil();
            s.raw_seti(1, hole).unwrap();
            let len = s.raw_len(1);
            // Any border is valid: t[len] is non-nil (or len is 0) and t[len + 1] is nil.
            s.raw_geti(1, len as i64 + 1).unwrap();
            prop_assert!(s.is_nil(-1));
            s.pop(1);
            if len > 0 {
                s.raw_geti(1, len as i64).unwrap();
                prop_assert!(!s.is_nil(-1));
                s.pop(1);
            }
        }
    }
}
