//! Instruction emission.
//!
//! The emitter mirrors the machine's data pointer so every primitive can be
//! addressed with a minimal `>`/`<` run, and records a human-readable note
//! per fragment. Notes never contain a reserved character, so the annotated
//! listing is itself a runnable program.

use std::cmp::Ordering;

use crate::scope::Symbol;

/// The eight characters with machine meaning.
pub const RESERVED: [char; 8] = ['[', ']', '<', '>', '+', '-', ',', '.'];

/// Delimiter introducing an annotation in the listed output.
pub const COMMENT_CHAR: char = '#';

#[derive(Debug, Clone)]
struct Fragment {
    code: String,
    note: String,
    depth: usize,
}

#[derive(Debug, Default)]
pub struct Emitter {
    frags: Vec<Fragment>,
    ptr: usize,
    depth: usize,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the data pointer will be after running the code so far.
    pub fn position(&self) -> usize {
        self.ptr
    }

    fn push(&mut self, code: String, note: String) {
        assert!(
            !note.chars().any(|c| RESERVED.contains(&c)),
            "annotation would corrupt the instruction stream: {note}"
        );
        self.frags.push(Fragment {
            code,
            note,
            depth: self.depth,
        });
    }

    /// Emit a structural comment with no instructions.
    pub fn note(&mut self, note: impl Into<String>) {
        self.push(String::new(), note.into());
    }

    pub fn move_to(&mut self, sym: &Symbol) {
        self.move_to_cell(sym, 0);
    }

    pub fn move_to_cell(&mut self, sym: &Symbol, offset: usize) {
        debug_assert!(offset < sym.size);
        let target = sym.address + offset;
        match target.cmp(&self.ptr) {
            Ordering::Greater => {
                let diff = target - self.ptr;
                self.push(">".repeat(diff), format!("move to {}", sym.name));
            }
            Ordering::Less => {
                let diff = self.ptr - target;
                self.push("<".repeat(diff), format!("move to {}", sym.name));
            }
            Ordering::Equal => {}
        }
        self.ptr = target;
    }

    pub fn inc(&mut self, sym: &Symbol, amount: usize) {
        if amount == 0 {
            return;
        }
        self.move_to(sym);
        self.push("+".repeat(amount), format!("add {amount}"));
    }

    pub fn dec(&mut self, sym: &Symbol, amount: usize) {
        if amount == 0 {
            return;
        }
        self.move_to(sym);
        self.push("-".repeat(amount), format!("sub {amount}"));
    }

    /// Zero every cell of the symbol with the `[-]` idiom.
    pub fn set_zero(&mut self, sym: &Symbol) {
        for i in 0..sym.size {
            self.move_to_cell(sym, i);
            self.push("[-]".to_string(), format!("zero {}", sym.name));
        }
    }

    pub fn load_int(&mut self, sym: &Symbol, value: u8) {
        debug_assert_eq!(sym.size, 1);
        self.set_zero(sym);
        if value > 0 {
            self.push("+".repeat(value as usize), format!("load {value}"));
        }
    }

    /// Zero and load each cell of a string symbol to its byte value.
    pub fn load_str(&mut self, sym: &Symbol, text: &str) {
        debug_assert_eq!(sym.size, text.len());
        for (i, byte) in text.bytes().enumerate() {
            self.move_to_cell(sym, i);
            self.push("[-]".to_string(), format!("zero {}", sym.name));
            if byte > 0 {
                self.push("+".repeat(byte as usize), format!("load {byte}"));
            }
        }
    }

    /// Destructive move: drain `src` into `dst`, leaving `src` at zero.
    pub fn transfer(&mut self, dst: &Symbol, src: &Symbol) {
        debug_assert_eq!(dst.size, 1);
        debug_assert_eq!(src.size, 1);
        self.set_zero(dst);
        self.begin_loop(src);
        self.dec(src, 1);
        self.inc(dst, 1);
        self.end_loop(src);
    }

    /// Non-destructive copy via a scratch cell: drain `src` into both `dst`
    /// and `scratch`, then drain `scratch` back into `src`. `dst` and
    /// `scratch` are zeroed first so a reclaimed cell never leaks a stale
    /// value into the fragment.
    pub fn copy(&mut self, dst: &Symbol, src: &Symbol, scratch: &Symbol) {
        debug_assert_eq!(dst.size, 1);
        debug_assert_eq!(src.size, 1);
        self.set_zero(dst);
        self.set_zero(scratch);
        self.begin_loop(src);
        self.dec(src, 1);
        self.inc(dst, 1);
        self.inc(scratch, 1);
        self.end_loop(src);
        self.begin_loop(scratch);
        self.dec(scratch, 1);
        self.inc(src, 1);
        self.end_loop(scratch);
    }

    /// Open a loop guarded by `sym`. The body must bring the pointer back by
    /// pairing with `end_loop` on the same symbol, and must eventually zero
    /// it or the loop never terminates.
    pub fn begin_loop(&mut self, sym: &Symbol) {
        self.move_to(sym);
        self.push("[".to_string(), format!("loop while {}", sym.name));
        self.depth += 1;
    }

    pub fn end_loop(&mut self, sym: &Symbol) {
        self.move_to(sym);
        self.depth -= 1;
        self.push("]".to_string(), format!("end loop {}", sym.name));
    }

    /// Open a loop that zeroes its own guard on entry, so the body runs
    /// exactly once if the guard was non-zero and not at all otherwise.
    pub fn begin_once(&mut self, guard: &Symbol) {
        self.move_to(guard);
        self.push("[".to_string(), format!("once if {}", guard.name));
        self.depth += 1;
        self.push("[-]".to_string(), "consume guard".to_string());
    }

    pub fn end_once(&mut self, guard: &Symbol) {
        self.move_to(guard);
        self.depth -= 1;
        self.push("]".to_string(), format!("end once {}", guard.name));
    }

    pub fn output_cell(&mut self, sym: &Symbol) {
        self.move_to(sym);
        self.push(".".to_string(), format!("write {}", sym.name));
    }

    /// One output per occupied cell, in address order.
    pub fn output_cells(&mut self, sym: &Symbol) {
        for i in 0..sym.size {
            self.move_to_cell(sym, i);
            self.push(".".to_string(), format!("write {}", sym.name));
        }
    }

    pub fn input_cell(&mut self, sym: &Symbol) {
        self.move_to(sym);
        self.push(",".to_string(), format!("read into {}", sym.name));
    }

    /// The bare instruction stream.
    pub fn program(&self) -> String {
        self.frags.iter().map(|f| f.code.as_str()).collect()
    }

    /// The instruction stream with indentation and per-fragment notes. Still
    /// a valid program: notes contain no reserved characters.
    pub fn annotated(&self) -> String {
        let mut out = String::new();
        for frag in &self.frags {
            if frag.code.is_empty() && frag.note.is_empty() {
                continue;
            }
            out.push_str(&"    ".repeat(frag.depth));
            if frag.note.is_empty() {
                out.push_str(&frag.code);
            } else if frag.code.is_empty() {
                out.push(COMMENT_CHAR);
                out.push(' ');
                out.push_str(&frag.note);
            } else {
                out.push_str(&format!("{:<32}{} {}", frag.code, COMMENT_CHAR, frag.note));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::scope::{ScopeStack, ValueKind};
    use pretty_assertions::assert_eq;

    fn run(emit: &Emitter) -> Machine {
        let mut vm = Machine::new(&emit.program()).unwrap().with_tape_len(64);
        vm.run().unwrap();
        vm
    }

    #[test]
    fn test_move_to_emits_minimal_runs() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let b = scopes.define("b", 1, ValueKind::Int).unwrap();
        let far = scopes.define("far", 4, ValueKind::Int).unwrap();
        let mut emit = Emitter::new();
        emit.move_to(&b);
        emit.move_to_cell(&far, 3);
        emit.move_to(&a);
        emit.move_to(&a);
        assert_eq!(emit.program(), ">>>>><<<<<");
        assert_eq!(emit.position(), a.address);
    }

    #[test]
    fn test_set_zero_is_idempotent() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let mut emit = Emitter::new();
        emit.inc(&a, 41);
        emit.set_zero(&a);
        emit.set_zero(&a);
        let vm = run(&emit);
        assert_eq!(vm.dump_cells(1), &[0]);
    }

    #[test]
    fn test_load_int_overwrites_previous_value() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let mut emit = Emitter::new();
        emit.load_int(&a, 200);
        emit.load_int(&a, 7);
        let vm = run(&emit);
        assert_eq!(vm.dump_cells(1), &[7]);
    }

    #[test]
    fn test_transfer_consumes_source() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let b = scopes.define("b", 1, ValueKind::Int).unwrap();
        let mut emit = Emitter::new();
        emit.load_int(&a, 3);
        emit.load_int(&b, 9);
        emit.transfer(&a, &b);
        let vm = run(&emit);
        assert_eq!(vm.dump_cells(2), &[9, 0]);
    }

    #[test]
    fn test_copy_preserves_source_for_all_values() {
        for value in [0u8, 1, 7, 128, 255] {
            let mut scopes = ScopeStack::new();
            let dst = scopes.define("dst", 1, ValueKind::Int).unwrap();
            let src = scopes.define("src", 1, ValueKind::Int).unwrap();
            let scratch = scopes.temp();
            let mut emit = Emitter::new();
            emit.load_int(&src, value);
            emit.copy(&dst, &src, &scratch);
            let vm = run(&emit);
            assert_eq!(vm.dump_cells(3), &[value, value, 0]);
        }
    }

    #[test]
    fn test_once_runs_body_exactly_once_for_any_nonzero_guard() {
        for guard_value in [0u8, 1, 2, 200] {
            let mut scopes = ScopeStack::new();
            let g = scopes.define("g", 1, ValueKind::Int).unwrap();
            let hits = scopes.define("hits", 1, ValueKind::Int).unwrap();
            let mut emit = Emitter::new();
            emit.load_int(&g, guard_value);
            emit.begin_once(&g);
            emit.inc(&hits, 1);
            emit.end_once(&g);
            let vm = run(&emit);
            let expected = u8::from(guard_value != 0);
            assert_eq!(vm.dump_cells(2), &[0, expected]);
        }
    }

    #[test]
    fn test_annotated_listing_still_runs() {
        let mut scopes = ScopeStack::new();
        let a = scopes.define("a", 1, ValueKind::Int).unwrap();
        let mut emit = Emitter::new();
        emit.note("produce a byte");
        emit.load_int(&a, 65);
        emit.output_cell(&a);
        let mut vm = Machine::new(&emit.annotated()).unwrap().with_tape_len(8);
        vm.run().unwrap();
        assert_eq!(vm.output(), b"A");
    }

    #[test]
    #[should_panic(expected = "annotation would corrupt")]
    fn test_reserved_characters_rejected_in_notes() {
        let mut emit = Emitter::new();
        emit.note("a + b");
    }
}
