//! # String Arena
//!
//! String interning for identifiers, literals, and display names. Every name
//! that flows through the middle end is a copyable `Symbol`; the arena is the
//! only place the backing bytes live.

use serde::{Deserialize, Serialize};
use std::fmt;
use string_interner::{DefaultBackend, StringInterner, Symbol as SymbolTrait};

/// A copyable token for an interned string.
///
/// Two symbols from the same arena are equal iff the strings they intern are
/// equal. Symbols serialize as their raw index, so round-tripping a module
/// snapshot requires the arena that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(string_interner::DefaultSymbol);

impl Symbol {
    pub(crate) fn new(raw: string_interner::DefaultSymbol) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0.to_usize()
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.to_usize().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let index = usize::deserialize(deserializer)?;
        let raw = string_interner::DefaultSymbol::try_from_usize(index)
            .ok_or_else(|| D::Error::custom(format!("invalid symbol index {index}")))?;
        Ok(Symbol(raw))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym#{}", self.0.to_usize())
    }
}

/// Arena of interned strings shared by a whole compilation unit.
pub struct StringArena {
    interner: StringInterner<DefaultBackend>,
}

impl StringArena {
    pub fn new() -> Self {
        Self {
            interner: StringInterner::new(),
        }
    }

    /// Intern a string, returning its symbol. Repeated calls with equal
    /// strings return equal symbols.
    pub fn intern(&mut self, s: impl AsRef<str>) -> Symbol {
        Symbol::new(self.interner.get_or_intern(s.as_ref()))
    }

    /// Look up a previously interned string without inserting.
    pub fn get(&self, s: impl AsRef<str>) -> Option<Symbol> {
        self.interner.get(s.as_ref()).map(Symbol::new)
    }

    /// Resolve a symbol back to its string.
    pub fn resolve(&self, sym: Symbol) -> &str {
        self.interner
            .resolve(sym.0)
            .expect("symbol from a different arena")
    }

    pub fn len(&self) -> usize {
        self.interner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

impl Default for StringArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StringArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringArena")
            .field("interned", &self.interner.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_dedups() {
        let mut arena = StringArena::new();
        let a = arena.intern("speak");
        let b = arena.intern("speak");
        let c = arena.intern("fetch");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(arena.resolve(a), "speak");
        assert_eq!(arena.resolve(c), "fetch");
    }

    #[test]
    fn test_get_without_insert() {
        let mut arena = StringArena::new();
        assert!(arena.get("dispose").is_none());
        let sym = arena.intern("dispose");
        assert_eq!(arena.get("dispose"), Some(sym));
    }
}
