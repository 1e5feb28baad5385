//! Tape address allocation.
//!
//! Scopes form a strict stack over the tape: a new scope starts at the
//! frontier of its parent, so no scope can alias an ancestor's live cells.
//! Within a scope, deleted interior symbols go to a free list for first-fit
//! reuse and the trailing symbol contracts the frontier like a bump
//! allocator.

use std::collections::HashMap;

use crate::errors::{CompileError, CompileResult};

/// Prefix for compiler-generated scratch symbols. User identifiers are
/// validated against it so the two namespaces can never collide.
const TEMP_PREFIX: &str = "$t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Const {
    Int(u8),
    Str(String),
}

/// A named tape region. Cloning a `Symbol` clones the record, not the cells
/// it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: usize,
    pub size: usize,
    pub kind: ValueKind,
    /// Set for literal-backed values so callers can materialize or print
    /// them without a runtime computation.
    pub constant: Option<Const>,
}

impl Symbol {
    pub fn is_temp(&self) -> bool {
        self.name.starts_with(TEMP_PREFIX)
    }
}

#[derive(Debug)]
struct Scope {
    start: usize,
    size: usize,
    symbols: HashMap<String, Symbol>,
    /// Reusable holes as (address, len) pairs, always inside the occupied
    /// range.
    free: Vec<(usize, usize)>,
}

impl Scope {
    fn new(start: usize) -> Self {
        Scope {
            start,
            size: 0,
            symbols: HashMap::new(),
            free: Vec::new(),
        }
    }

    // First-fit over the free list, splitting oversized holes; falls back to
    // bump allocation at the frontier.
    fn alloc(&mut self, size: usize) -> usize {
        if let Some(i) = self.free.iter().position(|&(_, len)| len >= size) {
            let (addr, len) = self.free.remove(i);
            if len > size {
                self.free.push((addr + size, len - size));
            }
            return addr;
        }
        let addr = self.start + self.size;
        self.size += size;
        addr
    }

    fn frontier(&self) -> usize {
        self.start + self.size
    }
}

#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
    next_temp: usize,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        ScopeStack {
            scopes: vec![Scope::new(0)],
            next_temp: 0,
        }
    }

    fn top(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    /// Define a user symbol in the innermost scope.
    pub fn define(&mut self, name: &str, size: usize, kind: ValueKind) -> CompileResult<Symbol> {
        validate_identifier(name)?;
        self.define_synthetic(name, size, kind)
    }

    /// Define a compiler-internal symbol, skipping identifier validation.
    pub(crate) fn define_synthetic(
        &mut self,
        name: &str,
        size: usize,
        kind: ValueKind,
    ) -> CompileResult<Symbol> {
        debug_assert!(size >= 1);
        let top = self.top();
        if top.symbols.contains_key(name) {
            return Err(CompileError::DuplicateSymbol(name.to_string()));
        }
        let address = top.alloc(size);
        let sym = Symbol {
            name: name.to_string(),
            address,
            size,
            kind,
            constant: None,
        };
        top.symbols.insert(name.to_string(), sym.clone());
        Ok(sym)
    }

    /// A fresh single-cell scratch symbol.
    pub fn temp(&mut self) -> Symbol {
        self.temp_sized(1)
    }

    pub fn temp_sized(&mut self, size: usize) -> Symbol {
        let name = format!("{}{}", TEMP_PREFIX, self.next_temp);
        self.next_temp += 1;
        self.define_synthetic(&name, size, ValueKind::Int)
            .expect("temp names are unique within a statement")
    }

    /// A scratch symbol that remembers the literal it will hold.
    pub fn temp_const(&mut self, value: u8) -> Symbol {
        let mut sym = self.temp();
        sym.constant = Some(Const::Int(value));
        let top = self.top();
        top.symbols.insert(sym.name.clone(), sym.clone());
        sym
    }

    /// Remove a symbol from the innermost scope. The trailing occupant
    /// contracts the frontier; interior symbols become free holes.
    pub fn delete(&mut self, sym: &Symbol) -> CompileResult<()> {
        let top = self.top();
        let owned = top
            .symbols
            .remove(&sym.name)
            .ok_or_else(|| CompileError::Allocator(format!("delete of unknown symbol {}", sym.name)))?;
        if owned.address != sym.address || owned.size != sym.size {
            return Err(CompileError::Allocator(format!(
                "stale symbol record for {}",
                sym.name
            )));
        }
        if owned.address + owned.size == top.frontier() {
            top.size -= owned.size;
        } else {
            top.free.push((owned.address, owned.size));
        }
        Ok(())
    }

    /// Purge every scratch symbol from the innermost scope, called once per
    /// source statement. Recomputes the occupied range from the surviving
    /// symbols and resets the temp counter so temp addresses and names are
    /// bounded per statement.
    pub fn delete_temps(&mut self) {
        let top = self.top();
        top.symbols.retain(|name, _| !name.starts_with(TEMP_PREFIX));
        let frontier = top
            .symbols
            .values()
            .map(|s| s.address + s.size)
            .max()
            .unwrap_or(top.start);
        top.size = frontier - top.start;
        top.free.retain(|&(addr, len)| addr + len <= frontier);
        self.next_temp = 0;
    }

    /// Current temp-counter position. Codegen saves it before walking a
    /// nested block and restores it afterwards: the per-statement counter
    /// reset inside the block must not hand out names the suspended outer
    /// statement still holds live.
    pub(crate) fn temp_mark(&self) -> usize {
        self.next_temp
    }

    pub(crate) fn temp_reset(&mut self, mark: usize) {
        self.next_temp = mark;
    }

    /// Push a child scope starting at the parent's frontier.
    pub fn enter(&mut self) {
        let start = self.top().frontier();
        self.scopes.push(Scope::new(start));
    }

    /// Pop the innermost scope, invalidating every symbol it owns.
    pub fn exit(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot exit the root scope");
        self.scopes.pop();
    }

    /// Walk the scope stack from innermost outward.
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|s| s.symbols.get(name))
    }

    #[cfg(test)]
    fn top_range(&self) -> (usize, usize) {
        let top = self.scopes.last().unwrap();
        (top.start, top.size)
    }
}

pub(crate) fn validate_identifier(name: &str) -> CompileResult<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(CompileError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn overlaps(a: &Symbol, b: &Symbol) -> bool {
        a.address < b.address + b.size && b.address < a.address + a.size
    }

    #[test]
    fn test_no_overlap_between_live_symbols() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let b = scopes.define("b", 3, ValueKind::Int).unwrap();
        let t = scopes.temp();
        let live = [&a, &b, &t];
        for (i, x) in live.iter().enumerate() {
            for y in live.iter().skip(i + 1) {
                assert!(!overlaps(x, y), "{} overlaps {}", x.name, y.name);
            }
        }
    }

    #[test]
    fn test_trailing_delete_contracts_frontier() {
        let mut scopes = ScopeStack::new();
        scopes.define("a", 2, ValueKind::Int).unwrap();
        let before = scopes.top_range();
        let b = scopes.define("b", 4, ValueKind::Int).unwrap();
        scopes.delete(&b).unwrap();
        assert_eq!(scopes.top_range(), before);
    }

    #[test]
    fn test_interior_delete_goes_to_free_list_and_is_reused() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 2, ValueKind::Int).unwrap();
        scopes.define("b", 1, ValueKind::Int).unwrap();
        scopes.delete(&a).unwrap();
        // The freed hole is reused first-fit; the oversized remainder stays
        // free for the next request.
        let c = scopes.define("c", 1, ValueKind::Int).unwrap();
        let d = scopes.define("d", 1, ValueKind::Int).unwrap();
        assert_eq!(c.address, a.address);
        assert_eq!(d.address, a.address + 1);
    }

    #[test]
    fn test_duplicate_symbol_rejected() {
        let mut scopes = ScopeStack::new();
        scopes.define("x", 1, ValueKind::Int).unwrap();
        assert!(matches!(
            scopes.define("x", 1, ValueKind::Int),
            Err(CompileError::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn test_shadowing_in_child_scope_is_allowed() {
        let mut scopes = ScopeStack::new();
        let outer = scopes.define("x", 1, ValueKind::Int).unwrap();
        scopes.enter();
        let inner = scopes.define("x", 1, ValueKind::Int).unwrap();
        assert_ne!(outer.address, inner.address);
        assert_eq!(scopes.resolve("x").unwrap().address, inner.address);
        scopes.exit();
        assert_eq!(scopes.resolve("x").unwrap().address, outer.address);
    }

    #[test]
    fn test_delete_unknown_symbol_is_fatal() {
        let mut scopes = ScopeStack::new();
        let x = scopes.define("x", 1, ValueKind::Int).unwrap();
        scopes.delete(&x).unwrap();
        assert!(matches!(
            scopes.delete(&x),
            Err(CompileError::Allocator(_))
        ));
    }

    #[test]
    fn test_child_scope_starts_at_parent_frontier() {
        let mut scopes = ScopeStack::new();
        scopes.define("a", 5, ValueKind::Int).unwrap();
        scopes.enter();
        let b = scopes.define("b", 1, ValueKind::Int).unwrap();
        assert_eq!(b.address, 5);
    }

    #[test]
    fn test_delete_temps_recomputes_frontier_and_resets_counter() {
        let mut scopes = ScopeStack::new();
        scopes.define("a", 1, ValueKind::Int).unwrap();
        let t0 = scopes.temp();
        let _t1 = scopes.temp();
        scopes.define("b", 1, ValueKind::Int).unwrap();
        let _t2 = scopes.temp();
        scopes.delete_temps();
        // Frontier shrinks to the last live user symbol.
        let (start, size) = scopes.top_range();
        assert_eq!(start, 0);
        assert_eq!(size, 4);
        // Temp numbering restarts and new temps allocate past the frontier.
        let fresh = scopes.temp();
        assert_eq!(fresh.name, t0.name);
        assert_eq!(fresh.address, 4);
    }

    #[test]
    fn test_temp_names_cannot_collide_with_identifiers() {
        let mut scopes = ScopeStack::new();
        assert!(matches!(
            scopes.define("$t0", 1, ValueKind::Int),
            Err(CompileError::InvalidIdentifier(_))
        ));
        let t = scopes.temp();
        assert!(t.is_temp());
    }
}
