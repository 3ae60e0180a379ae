//! Immutable name -> {handler, arity} table built once before serving.

use crate::database::Db;
use crate::protocol::Reply;
use bytes::Bytes;
use hashbrown::HashMap;

/// Handler for one command. `args` excludes the command name.
pub type ExecFn = fn(db: &Db, args: &[Bytes]) -> Reply;

#[derive(Clone, Copy)]
pub struct Command {
    pub exec: ExecFn,
    /// `N >= 0` requires exactly N elements (name included), `-N` at least N
    pub arity: i32,
}

impl Command {
    #[inline]
    pub fn accepts(&self, argc: usize) -> bool {
        validate_arity(self.arity, argc)
    }
}

/// Check an element count (command name included) against an arity rule
///
/// `SET k v` has arity 3; `EXISTS k1 k2 ...` has arity -2.
pub fn validate_arity(arity: i32, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= arity.unsigned_abs() as usize
    }
}

/// Lookup table of every command the storage engine understands
#[derive(Clone, Default)]
pub struct CommandTable {
    entries: HashMap<String, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the built-in key and string commands
    pub fn builtin() -> Self {
        let mut table = Self::new();
        crate::commands::register_builtin(&mut table);
        table
    }

    /// Register a handler. Names are stored lower-cased.
    pub fn register(&mut self, name: &str, exec: ExecFn, arity: i32) {
        self.entries
            .insert(name.to_ascii_lowercase(), Command { exec, arity });
    }

    /// Case-insensitive lookup
    pub fn lookup(&self, name: &[u8]) -> Option<&Command> {
        match std::str::from_utf8(name) {
            Ok(s) if s.bytes().all(|b| !b.is_ascii_uppercase()) => self.entries.get(s),
            Ok(s) => self.entries.get(&s.to_ascii_lowercase()),
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_arity() {
        assert!(!validate_arity(3, 2));
        assert!(validate_arity(3, 3));
        assert!(!validate_arity(3, 4));
    }

    #[test]
    fn minimum_arity() {
        assert!(!validate_arity(-2, 1));
        assert!(validate_arity(-2, 2));
        assert!(validate_arity(-2, 3));
        assert!(validate_arity(-2, 4));
        assert!(validate_arity(-2, 40));
    }

    #[test]
    fn lookup_ignores_case() {
        let table = CommandTable::builtin();
        assert!(table.lookup(b"get").is_some());
        assert!(table.lookup(b"GeT").is_some());
        assert!(table.lookup(b"nope").is_none());
        assert!(table.lookup(&[0xff, 0xfe]).is_none());
    }
}
