//! Tables: the only aggregate data structure in the language.

use hashbrown::HashMap;

use crate::value::Value;

/// A mapping from non-nil values to non-nil values.
///
/// `size` counts anonymous inserts so positional entries in a table literal
/// land at keys `1..n`, matching Lua's array convention. Deleting entries
/// never rewinds the counter.
#[derive(Debug, Default)]
pub struct Table {
    entries: HashMap<Value, Value>,
    size: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            entries: HashMap::new(),
            size: 0,
        }
    }

    /// Look up a key. Missing keys read as nil.
    pub fn get(&self, key: &Value) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Nil)
    }

    /// Store `value` under `key`. Storing nil deletes the key; a nil key is
    /// rejected and reported as a runtime error at the call site.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if key.is_nil() {
            return false;
        }
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
        true
    }

    /// Append `value` under the next integer key.
    pub fn insert(&mut self, value: Value) {
        self.size += 1;
        self.entries.insert(Value::Number(self.size as f64), value);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The anonymous-insert counter, i.e. the highest integer key handed out
    /// by [`Table::insert`].
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut table = Table::new();
        assert!(table.set(Value::string("k"), Value::Number(3.0)));
        assert_eq!(table.get(&Value::string("k")), Value::Number(3.0));
    }

    #[test]
    fn test_missing_key_is_nil() {
        let table = Table::new();
        assert_eq!(table.get(&Value::string("missing")), Value::Nil);
    }

    #[test]
    fn test_nil_key_is_rejected() {
        let mut table = Table::new();
        assert!(!table.set(Value::Nil, Value::Number(1.0)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_nil_value_deletes() {
        let mut table = Table::new();
        table.set(Value::Number(1.0), Value::string("x"));
        assert_eq!(table.len(), 1);
        table.set(Value::Number(1.0), Value::Nil);
        assert!(table.is_empty());
        assert_eq!(table.get(&Value::Number(1.0)), Value::Nil);
    }

    #[test]
    fn test_insert_assigns_sequential_keys() {
        let mut table = Table::new();
        table.insert(Value::string("a"));
        table.insert(Value::string("b"));
        assert_eq!(table.size(), 2);
        assert_eq!(table.get(&Value::Number(1.0)), Value::string("a"));
        assert_eq!(table.get(&Value::Number(2.0)), Value::string("b"));
    }

    #[test]
    fn test_insert_ignores_deletions() {
        let mut table = Table::new();
        table.insert(Value::string("a"));
        table.set(Value::Number(1.0), Value::Nil);
        table.insert(Value::string("b"));
        assert_eq!(table.get(&Value::Number(2.0)), Value::string("b"));
        assert_eq!(table.size(), 2);
    }

    #[test]
    fn test_boolean_and_number_keys_are_distinct() {
        let mut table = Table::new();
        table.set(Value::Boolean(true), Value::string("bool"));
        table.set(Value::Number(1.0), Value::string("num"));
        assert_eq!(table.get(&Value::Boolean(true)), Value::string("bool"));
        assert_eq!(table.get(&Value::Number(1.0)), Value::string("num"));
    }
}
