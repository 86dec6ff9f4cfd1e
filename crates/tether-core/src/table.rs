//! Hybrid array+hash table.

use crate::gc::GcIdx;
use crate::string::StringId;
use crate::value::{TValue, SMALL_INT_MAX, SMALL_INT_MIN};
use indexmap::IndexMap;

/// A normalized table key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Integer(i64),
    String(StringId),
    /// Non-integral float key, stored as raw bits for hashing.
    Float(u64),
    /// GC object key (table, function, userdata), stored as raw TValue bits.
    GcPtr(u64),
    Boolean(bool),
    /// Light handle key, stored as its address.
    Light(usize),
}

impl TableKey {
    /// Normalize a value into a key. Returns `None` for nil and NaN.
    ///
    /// Boxed integers are not resolved here (that needs the heap); callers
    /// holding one should build `TableKey::Integer` themselves.
    pub fn from_value(v: TValue) -> Option<TableKey> {
        if v.is_nil() {
            return None;
        }
        if let Some(i) = v.as_integer() {
            return Some(TableKey::Integer(i));
        }
        if let Some(f) = v.as_float() {
            if f.is_nan() {
                return None;
            }
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                return Some(TableKey::Integer(f as i64));
            }
            return Some(TableKey::Float(f.to_bits()));
        }
        if let Some(b) = v.as_bool() {
            return Some(TableKey::Boolean(b));
        }
        if let Some(sid) = v.as_string_id() {
            return Some(TableKey::String(sid));
        }
        if let Some(p) = v.as_light() {
            return Some(TableKey::Light(p));
        }
        if v.is_gc() {
            return Some(TableKey::GcPtr(v.raw_bits()));
        }
        None
    }

    /// Convert back to a value. Integers outside the small range come back
    /// as `Err(i)` so the caller can box them.
    pub fn to_value(self) -> Result<TValue, i64> {
        match self {
            TableKey::Integer(i) if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&i) => {
                Ok(TValue::from_integer(i))
            }
            TableKey::Integer(i) => Err(i),
            TableKey::String(sid) => Ok(TValue::from_string_id(sid)),
            TableKey::Float(bits) => Ok(TValue::from_float(f64::from_bits(bits))),
            TableKey::Boolean(b) => Ok(TValue::from_bool(b)),
            TableKey::GcPtr(bits) => Ok(TValue::from_raw_bits(bits)),
            TableKey::Light(p) => Ok(TValue::from_light(p).unwrap_or_default()),
        }
    }
}

/// A table: hybrid array + insertion-ordered hash map.
pub struct Table {
    /// Array part (1-indexed: array[0] corresponds to key 1).
    array: Vec<TValue>,
    /// Hash part for non-sequential keys. Entries set to nil stay behind as
    /// tombstones so `next` can continue past them.
    hash: IndexMap<TableKey, TValue>,
    pub metatable: Option<GcIdx<Table>>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Lookup by normalized key.
    pub fn get(&self, key: TableKey) -> TValue {
        if let TableKey::Integer(i) = key {
            return self.raw_geti(i);
        }
        self.hash.get(&key).copied().unwrap_or_default()
    }

    /// Store by normalized key.
    pub fn set(&mut self, key: TableKey, value: TValue) {
        if let TableKey::Integer(i) = key {
            self.raw_seti(i, value);
            return;
        }
        if value.is_nil() {
            if let Some(slot) = self.hash.get_mut(&key) {
                *slot = value;
            }
        } else {
            self.hash.insert(key, value);
        }
    }

    /// Raw get by value key. Nil and NaN keys read as nil.
    pub fn raw_get(&self, key: TValue) -> TValue {
        match TableKey::from_value(key) {
            Some(tk) => self.get(tk),
            None => TValue::nil(),
        }
    }

    /// Raw set by value key.
    pub fn raw_set(&mut self, key: TValue, value: TValue) -> Result<(), &'static str> {
        if key.is_nil() {
            return Err("table index is nil");
        }
        match TableKey::from_value(key) {
            Some(tk) => {
                self.set(tk, value);
                Ok(())
            }
            None => Err("table index is NaN"),
        }
    }

    /// Fast integer get (1-indexed).
    pub fn raw_geti(&self, key: i64) -> TValue {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Integer(key))
                .copied()
                .unwrap_or_default()
        }
    }

    /// Fast integer set (1-indexed).
    pub fn raw_seti(&mut self, key: i64, value: TValue) {
        if key >= 1 {
            let idx = (key - 1) as usize;
            if idx < self.array.len() {
                self.array[idx] = value;
                if idx + 1 == self.array.len() && value.is_nil() {
                    self.trim_array();
                }
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                self.migrate_hash_to_array();
                return;
            }
        }
        if value.is_nil() {
            if let Some(slot) = self.hash.get_mut(&TableKey::Integer(key)) {
                *slot = value;
            }
        } else {
            self.hash.insert(TableKey::Integer(key), value);
        }
    }

    pub fn raw_get_str(&self, key: StringId) -> TValue {
        self.hash
            .get(&TableKey::String(key))
            .copied()
            .unwrap_or_default()
    }

    pub fn raw_set_str(&mut self, key: StringId, value: TValue) {
        self.set(TableKey::String(key), value);
    }

    /// Border of the sequence: the largest n such that t[n] is non-nil and
    /// t[n+1] is nil, searched in the array part first.
    pub fn length(&self) -> i64 {
        if self.array.last().is_some_and(|v| v.is_nil()) {
            let mut lo = 0usize;
            let mut hi = self.array.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.array[mid].is_nil() {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            return lo as i64;
        }
        let mut n = self.array.len() as i64;
        while !self
            .hash
            .get(&TableKey::Integer(n + 1))
            .copied()
            .unwrap_or_default()
            .is_nil()
        {
            n += 1;
        }
        n
    }

    /// The entry following `key` in iteration order (`None` starts).
    /// `Err(())` means the key is not present in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Option<TableKey>) -> Result<Option<(TableKey, TValue)>, ()> {
        let array_start = match key {
            None => 0,
            Some(TableKey::Integer(i)) if i >= 1 && (i as usize) <= self.array.len() => i as usize,
            Some(tk) => {
                let pos = self.hash.get_index_of(&tk).ok_or(())?;
                return Ok(self.next_in_hash(pos + 1));
            }
        };
        for (j, v) in self.array.iter().enumerate().skip(array_start) {
            if !v.is_nil() {
                return Ok(Some((TableKey::Integer(j as i64 + 1), *v)));
            }
        }
        Ok(self.next_in_hash(0))
    }

    fn next_in_hash(&self, from: usize) -> Option<(TableKey, TValue)> {
        (from..self.hash.len())
            .filter_map(|i| self.hash.get_index(i))
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (*k, *v))
    }

    /// Every value and GC key held by the table (for collector traversal).
    pub fn references(&self) -> impl Iterator<Item = TValue> + '_ {
        let keys = self.hash.iter().filter_map(|(k, v)| match k {
            TableKey::GcPtr(bits) if !v.is_nil() => Some(TValue::from_raw_bits(*bits)),
            _ => None,
        });
        self.array
            .iter()
            .copied()
            .chain(self.hash.values().copied())
            .chain(keys)
    }

    fn migrate_hash_to_array(&mut self) {
        loop {
            let next_idx = self.array.len() as i64 + 1;
            match self.hash.shift_remove(&TableKey::Integer(next_idx)) {
                Some(v) if !v.is_nil() => self.array.push(v),
                _ => break,
            }
        }
    }

    fn trim_array(&mut self) {
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
