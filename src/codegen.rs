//! Code generation: lowers the AST to the eight tape-machine primitives.
//!
//! Every operator is synthesized from increment/decrement/loop idioms over
//! scratch cells handed out by the scope allocator. Operands are never
//! mutated unless the operation is an explicit in-place form used by
//! compound assignment; everything else computes into a fresh temp.

use std::collections::HashSet;

use log::{debug, trace};

use crate::ast::{BinOp, Expr, Program, Stmt};
use crate::emit::Emitter;
use crate::errors::{CompileError, CompileResult};
use crate::scope::{Const, ScopeStack, Symbol, ValueKind};
use crate::Overflow;

const ASCII_ZERO: usize = 48;

/// Constant-bound loops with bodies below this statement count are unrolled.
const UNROLL_LIMIT: usize = 8;

/// Name of the callee-side return slot. Starts with `$` so user identifiers
/// cannot shadow it, but outside the temp prefix so statement-level temp
/// purges leave it alone.
const RET_NAME: &str = "$ret";

pub struct CodeGen<'p> {
    program: &'p Program,
    emit: Emitter,
    scopes: ScopeStack,
    policy: Overflow,
    active_calls: Vec<String>,
    ret_slot: Option<Symbol>,
}

impl<'p> CodeGen<'p> {
    pub fn new(program: &'p Program) -> Self {
        CodeGen {
            program,
            emit: Emitter::new(),
            scopes: ScopeStack::new(),
            policy: Overflow::default(),
            active_calls: Vec::new(),
            ret_slot: None,
        }
    }

    /// Target the same overflow policy the interpreter will run with. The
    /// comparison and division encodings depend on it.
    pub fn with_policy(mut self, policy: Overflow) -> Self {
        self.policy = policy;
        self
    }

    pub fn compile(mut self) -> CompileResult<Emitter> {
        let mut seen = HashSet::new();
        for f in &self.program.functions {
            crate::scope::validate_identifier(&f.name)?;
            if !seen.insert(f.name.as_str()) {
                return Err(CompileError::DuplicateFunction(f.name.clone()));
            }
        }
        debug!(
            "compiling {} functions and {} top level statements",
            self.program.functions.len(),
            self.program.body.len()
        );
        for stmt in &self.program.body {
            self.stmt(stmt)?;
            self.scopes.delete_temps();
        }
        Ok(self.emit)
    }

    fn stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::IntDecl { name, init } => match init {
                Some(Expr::Int(n)) => {
                    let value = int_literal(*n)?;
                    let sym = self.scopes.define(name, 1, ValueKind::Int)?;
                    self.emit.load_int(&sym, value);
                    Ok(())
                }
                Some(expr) => {
                    let value = self.eval(expr)?;
                    self.expect_scalar(&value)?;
                    let sym = self.scopes.define(name, 1, ValueKind::Int)?;
                    self.copy_val(&sym, &value)
                }
                None => {
                    let sym = self.scopes.define(name, 1, ValueKind::Int)?;
                    self.emit.set_zero(&sym);
                    Ok(())
                }
            },
            Stmt::StrDecl { name, value } => {
                if value.is_empty() {
                    return Err(CompileError::TypeMismatch("empty string literal".into()));
                }
                let sym = self.scopes.define(name, value.len(), ValueKind::Str)?;
                self.emit.load_str(&sym, value);
                Ok(())
            }
            Stmt::ArrayDecl { name, size } => {
                if !(1..=255).contains(size) {
                    return Err(CompileError::ArraySize(*size));
                }
                let sym = self.scopes.define(name, *size as usize, ValueKind::Int)?;
                self.emit.set_zero(&sym);
                Ok(())
            }
            Stmt::Assign { name, value } => self.assign(name, value),
            Stmt::OpAssign { op, name, value } => self.op_assign(*op, name, value),
            Stmt::IndexAssign { name, index, value } => {
                let elem = self.index_symbol(name, index)?;
                match value {
                    Expr::Int(n) => {
                        self.emit.load_int(&elem, int_literal(*n)?);
                        Ok(())
                    }
                    _ => {
                        let v = self.eval(value)?;
                        self.expect_scalar(&v)?;
                        self.copy_val(&elem, &v)
                    }
                }
            }
            Stmt::If { cond, then, els } => self.stmt_if(cond, then, els.as_deref()),
            Stmt::While { cond, body } => self.stmt_while(cond, body),
            Stmt::For {
                var,
                start,
                stop,
                step,
                body,
            } => self.stmt_for(var, start, stop, step, body),
            Stmt::Call { name, args } => {
                self.call(name, args, false)?;
                Ok(())
            }
            Stmt::Return(expr) => {
                let slot = self
                    .ret_slot
                    .clone()
                    .ok_or(CompileError::ReturnOutsideFunction)?;
                match expr {
                    Expr::Int(n) => {
                        self.emit.load_int(&slot, int_literal(*n)?);
                        Ok(())
                    }
                    _ => {
                        let v = self.eval(expr)?;
                        self.expect_scalar(&v)?;
                        self.copy_val(&slot, &v)
                    }
                }
            }
            Stmt::Print(expr) => self.print_value(expr),
            Stmt::PrintChar(expr) => {
                let v = self.eval(expr)?;
                self.expect_scalar(&v)?;
                self.emit.output_cell(&v);
                Ok(())
            }
            Stmt::Block(stmts) => self.block(stmts),
        }
    }

    fn block(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
        let mark = self.scopes.temp_mark();
        self.scopes.enter();
        for stmt in stmts {
            self.stmt(stmt)?;
            self.scopes.delete_temps();
        }
        self.scopes.exit();
        self.scopes.temp_reset(mark);
        Ok(())
    }

    fn assign(&mut self, name: &str, value: &Expr) -> CompileResult<()> {
        let sym = self
            .scopes
            .resolve(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownIdentifier(name.to_string()))?;
        match sym.kind {
            ValueKind::Str => match value {
                Expr::Str(text) => {
                    if text.len() != sym.size {
                        return Err(CompileError::TypeMismatch(format!(
                            "string {} holds {} cells but the literal has {} bytes",
                            name,
                            sym.size,
                            text.len()
                        )));
                    }
                    self.emit.load_str(&sym, text);
                    Ok(())
                }
                _ => Err(CompileError::TypeMismatch(format!(
                    "{name} is a string and can only be assigned a string literal"
                ))),
            },
            ValueKind::Int => {
                if sym.size != 1 {
                    return Err(CompileError::TypeMismatch(format!(
                        "{name} is an array and must be assigned element by element"
                    )));
                }
                match value {
                    Expr::Int(n) => {
                        self.emit.load_int(&sym, int_literal(*n)?);
                        Ok(())
                    }
                    _ => {
                        let v = self.eval(value)?;
                        self.expect_scalar(&v)?;
                        self.copy_val(&sym, &v)
                    }
                }
            }
        }
    }

    fn op_assign(&mut self, op: BinOp, name: &str, value: &Expr) -> CompileResult<()> {
        let sym = self
            .scopes
            .resolve(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownIdentifier(name.to_string()))?;
        self.expect_scalar(&sym)?;
        let v = self.eval(value)?;
        self.expect_scalar(&v)?;
        if matches!(op, BinOp::Div | BinOp::Mod) && is_const_zero(value, &v) {
            return Err(CompileError::DivisionByZero);
        }
        match op {
            BinOp::Add => self.add_into(&sym, &v),
            BinOp::Sub => self.sub_into(&sym, &v),
            BinOp::Mul => {
                let r = self.op_mul(&sym, &v)?;
                self.emit.transfer(&sym, &r);
                self.scopes.delete(&r)
            }
            BinOp::Div => {
                let q = self.op_div(&sym, &v)?;
                self.emit.transfer(&sym, &q);
                self.scopes.delete(&q)
            }
            BinOp::Mod => {
                let r = self.op_mod(&sym, &v)?;
                self.emit.transfer(&sym, &r);
                self.scopes.delete(&r)
            }
            other => Err(CompileError::TypeMismatch(format!(
                "operator {other:?} cannot be used in compound assignment"
            ))),
        }
    }

    fn stmt_if(&mut self, cond: &Expr, then: &[Stmt], els: Option<&[Stmt]>) -> CompileResult<()> {
        self.emit.note("if");
        let c = self.eval(cond)?;
        self.expect_scalar(&c)?;
        let g = self.scopes.temp();
        match els {
            None => {
                self.copy_val(&g, &c)?;
                self.emit.begin_once(&g);
                self.block(then)?;
                self.emit.end_once(&g);
            }
            Some(els) => {
                // The else flag starts raised; the true branch lowers it.
                let else_flag = self.scopes.temp();
                self.emit.load_int(&else_flag, 1);
                self.copy_val(&g, &c)?;
                self.emit.begin_once(&g);
                self.emit.set_zero(&else_flag);
                self.emit.end_once(&g);
                // The guard was consumed deciding the flag; recopy it.
                self.copy_val(&g, &c)?;
                self.emit.begin_once(&g);
                self.block(then)?;
                self.emit.end_once(&g);
                self.emit.begin_once(&else_flag);
                self.block(els)?;
                self.emit.end_once(&else_flag);
            }
        }
        Ok(())
    }

    fn stmt_while(&mut self, cond: &Expr, body: &[Stmt]) -> CompileResult<()> {
        if matches!(cond, Expr::Int(0)) {
            trace!("while with constant false condition elided");
            return Ok(());
        }
        self.emit.note("while");
        let g = self.scopes.temp();
        let c = self.eval(cond)?;
        self.expect_scalar(&c)?;
        self.copy_val(&g, &c)?;
        self.emit.begin_loop(&g);
        self.block(body)?;
        // The condition is re-evaluated in full on every iteration.
        let c2 = self.eval(cond)?;
        self.expect_scalar(&c2)?;
        self.copy_val(&g, &c2)?;
        self.emit.end_loop(&g);
        Ok(())
    }

    fn stmt_for(
        &mut self,
        var: &str,
        start: &Expr,
        stop: &Expr,
        step: &Expr,
        body: &[Stmt],
    ) -> CompileResult<()> {
        if let Some((a, b, s)) = const_bounds(start, stop, step)? {
            if s >= 1
                && unroll_exit_in_range(a, b, s)
                && body.len() < UNROLL_LIMIT
                && !stmts_have_io_or_calls(body)
                && !stmts_assign_to(body, var)
            {
                return self.unroll_for(var, a, b, s, body);
            }
        }
        self.emit.note(format!("for {var}"));
        self.scopes.enter();
        let counter = match start {
            Expr::Int(n) => {
                let value = int_literal(*n)?;
                let counter = self.scopes.define(var, 1, ValueKind::Int)?;
                self.emit.load_int(&counter, value);
                counter
            }
            _ => {
                let v = self.eval(start)?;
                self.expect_scalar(&v)?;
                let counter = self.scopes.define(var, 1, ValueKind::Int)?;
                self.copy_val(&counter, &v)?;
                counter
            }
        };
        let g = self.scopes.temp();
        let le = self.cmp_le_expr(&counter, stop)?;
        self.emit.transfer(&g, &le);
        self.emit.begin_loop(&g);
        self.block(body)?;
        let sv = self.eval(step)?;
        self.expect_scalar(&sv)?;
        self.add_into(&counter, &sv)?;
        let le = self.cmp_le_expr(&counter, stop)?;
        self.emit.transfer(&g, &le);
        self.emit.end_loop(&g);
        self.scopes.exit();
        Ok(())
    }

    // counter <= stop, with stop re-evaluated at the call site.
    fn cmp_le_expr(&mut self, counter: &Symbol, stop: &Expr) -> CompileResult<Symbol> {
        let sv = self.eval(stop)?;
        self.expect_scalar(&sv)?;
        self.op_le(counter, &sv)
    }

    fn unroll_for(
        &mut self,
        var: &str,
        start: u8,
        stop: u8,
        step: u8,
        body: &[Stmt],
    ) -> CompileResult<()> {
        debug!("unrolling for {var} over {start}..={stop} step {step}");
        let mut i = start as u16;
        while i <= stop as u16 {
            self.scopes.enter();
            let counter = self.scopes.define(var, 1, ValueKind::Int)?;
            self.emit.load_int(&counter, i as u8);
            // Same shape as the runtime form: the body gets its own scope.
            self.block(body)?;
            self.scopes.exit();
            i += step as u16;
        }
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[Expr], want_value: bool) -> CompileResult<Option<Symbol>> {
        let program = self.program;
        let func = program
            .function(name)
            .ok_or_else(|| CompileError::UnknownFunction(name.to_string()))?;
        if func.params.len() != args.len() {
            return Err(CompileError::ArityMismatch {
                name: name.to_string(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        if self.active_calls.iter().any(|c| c == name) {
            return Err(CompileError::RecursiveCall(name.to_string()));
        }
        if want_value && !func.returns {
            return Err(CompileError::VoidCall(name.to_string()));
        }
        trace!("expanding call to {name}");
        self.emit.note(format!("call {name}"));
        let mut arg_vals = Vec::with_capacity(args.len());
        for arg in args {
            let v = self.eval(arg)?;
            self.expect_scalar(&v)?;
            arg_vals.push(v);
        }
        // Allocated in the caller's scope so the result survives scope exit.
        let ret_out = want_value.then(|| self.scopes.temp());
        self.scopes.enter();
        for (param, value) in func.params.iter().zip(&arg_vals) {
            let p = self.scopes.define(param, 1, ValueKind::Int)?;
            self.copy_val(&p, value)?;
        }
        let ret_slot = if func.returns {
            let slot = self.scopes.define_synthetic(RET_NAME, 1, ValueKind::Int)?;
            self.emit.set_zero(&slot);
            Some(slot)
        } else {
            None
        };
        let saved_slot = std::mem::replace(&mut self.ret_slot, ret_slot.clone());
        self.active_calls.push(name.to_string());
        let mark = self.scopes.temp_mark();
        for stmt in &func.body {
            self.stmt(stmt)?;
            self.scopes.delete_temps();
        }
        self.scopes.temp_reset(mark);
        self.active_calls.pop();
        self.ret_slot = saved_slot;
        if let (Some(out), Some(slot)) = (&ret_out, &ret_slot) {
            // Relocate the return value before the callee's addresses die.
            self.emit.transfer(out, slot);
        }
        self.scopes.exit();
        Ok(ret_out)
    }

    fn eval(&mut self, expr: &Expr) -> CompileResult<Symbol> {
        match expr {
            Expr::Int(n) => {
                let value = int_literal(*n)?;
                Ok(self.const_cell(value))
            }
            Expr::Str(_) => Err(CompileError::TypeMismatch(
                "string literal outside assignment or print".into(),
            )),
            Expr::Var(name) => self
                .scopes
                .resolve(name)
                .cloned()
                .ok_or_else(|| CompileError::UnknownIdentifier(name.to_string())),
            Expr::Index(name, index) => self.index_symbol(name, index),
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs)?;
                self.expect_scalar(&a)?;
                let b = self.eval(rhs)?;
                self.expect_scalar(&b)?;
                if matches!(op, BinOp::Div | BinOp::Mod) && is_const_zero(rhs, &b) {
                    return Err(CompileError::DivisionByZero);
                }
                match op {
                    BinOp::Add => self.op_add(&a, &b),
                    BinOp::Sub => self.op_sub(&a, &b),
                    BinOp::Mul => self.op_mul(&a, &b),
                    BinOp::Div => self.op_div(&a, &b),
                    BinOp::Mod => self.op_mod(&a, &b),
                    BinOp::Eq => self.op_eq(&a, &b),
                    BinOp::Ne => self.op_ne(&a, &b),
                    BinOp::Lt => self.op_lt(&a, &b),
                    BinOp::Le => self.op_le(&a, &b),
                    BinOp::Gt => self.op_lt(&b, &a),
                    BinOp::Ge => self.op_le(&b, &a),
                    BinOp::And => self.op_and(&a, &b),
                    BinOp::Or => self.op_or(&a, &b),
                }
            }
            Expr::Not(inner) => {
                let v = self.eval(inner)?;
                self.expect_scalar(&v)?;
                self.op_not(&v)
            }
            Expr::Call(name, args) => Ok(self
                .call(name, args, true)?
                .expect("value-producing call always yields a symbol")),
            Expr::ReadChar => {
                let t = self.scopes.temp();
                self.emit.input_cell(&t);
                Ok(t)
            }
            Expr::ReadInt => {
                let t = self.scopes.temp();
                self.emit.input_cell(&t);
                self.emit.dec(&t, ASCII_ZERO);
                Ok(t)
            }
        }
    }

    fn index_symbol(&mut self, name: &str, index: &Expr) -> CompileResult<Symbol> {
        let base = self
            .scopes
            .resolve(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownIdentifier(name.to_string()))?;
        if base.kind != ValueKind::Int || base.size == 1 {
            return Err(CompileError::TypeMismatch(format!("{name} is not an array")));
        }
        let i = match index {
            Expr::Int(n) if *n >= 0 => *n as usize,
            Expr::Int(n) => return Err(CompileError::LiteralRange(*n)),
            _ => return Err(CompileError::NonConstantIndex),
        };
        if i >= base.size {
            return Err(CompileError::IndexOutOfBounds {
                name: name.to_string(),
                index: i,
                size: base.size,
            });
        }
        Ok(Symbol {
            name: format!("{name}:{i}"),
            address: base.address + i,
            size: 1,
            kind: ValueKind::Int,
            constant: None,
        })
    }

    // ---- cell-level helpers -------------------------------------------------

    fn expect_scalar(&self, sym: &Symbol) -> CompileResult<()> {
        if sym.kind == ValueKind::Int && sym.size == 1 {
            Ok(())
        } else {
            Err(CompileError::TypeMismatch(format!(
                "{} is not an integer value",
                sym.name
            )))
        }
    }

    fn const_cell(&mut self, value: u8) -> Symbol {
        let t = self.scopes.temp_const(value);
        self.emit.load_int(&t, value);
        t
    }

    /// Non-destructive copy; allocates and releases the scratch cell.
    fn copy_val(&mut self, dst: &Symbol, src: &Symbol) -> CompileResult<()> {
        if dst.address == src.address {
            return Ok(());
        }
        let scratch = self.scopes.temp();
        self.emit.copy(dst, src, &scratch);
        self.scopes.delete(&scratch)
    }

    fn fresh_copy(&mut self, src: &Symbol) -> CompileResult<Symbol> {
        let t = self.scopes.temp();
        self.copy_val(&t, src)?;
        Ok(t)
    }

    /// In-place `a += b`.
    fn add_into(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<()> {
        let t = self.fresh_copy(b)?;
        self.emit.begin_loop(&t);
        self.emit.dec(&t, 1);
        self.emit.inc(a, 1);
        self.emit.end_loop(&t);
        self.scopes.delete(&t)
    }

    /// In-place `a -= b`, under whichever underflow behavior the machine
    /// policy gives plain decrements.
    fn sub_into(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<()> {
        let t = self.fresh_copy(b)?;
        self.emit.begin_loop(&t);
        self.emit.dec(&t, 1);
        self.emit.dec(a, 1);
        self.emit.end_loop(&t);
        self.scopes.delete(&t)
    }

    /// In-place `a = max(a - b, 0)` regardless of policy. Under `Saturate`
    /// the machine already clamps; under `Wrap` each step probes the minuend
    /// and a break flag stops the drain before it can underflow.
    fn sub_clamped_into(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<()> {
        if self.policy == Overflow::Saturate {
            return self.sub_into(a, b);
        }
        let t = self.fresh_copy(b)?;
        let probe = self.scopes.temp();
        let flag = self.scopes.temp();
        self.emit.begin_loop(&t);
        self.emit.dec(&t, 1);
        self.copy_val(&probe, a)?;
        self.emit.load_int(&flag, 1);
        self.emit.begin_once(&probe);
        self.emit.set_zero(&flag);
        self.emit.dec(a, 1);
        self.emit.end_once(&probe);
        self.emit.begin_once(&flag);
        self.emit.set_zero(&t);
        self.emit.end_once(&flag);
        self.emit.end_loop(&t);
        self.scopes.delete(&t)?;
        self.scopes.delete(&probe)?;
        self.scopes.delete(&flag)
    }

    /// `max(a - b, 0)` into a fresh temp.
    fn diff_clamped(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let d = self.fresh_copy(a)?;
        self.sub_clamped_into(&d, b)?;
        Ok(d)
    }

    fn op_add(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.fresh_copy(a)?;
        self.add_into(&r, b)?;
        Ok(r)
    }

    fn op_sub(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.fresh_copy(a)?;
        self.sub_into(&r, b)?;
        Ok(r)
    }

    /// Repeated addition: b rounds of adding a copy of a.
    fn op_mul(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.set_zero(&r);
        let rounds = self.fresh_copy(b)?;
        let inner = self.scopes.temp();
        self.emit.begin_loop(&rounds);
        self.emit.dec(&rounds, 1);
        self.copy_val(&inner, a)?;
        self.emit.begin_loop(&inner);
        self.emit.dec(&inner, 1);
        self.emit.inc(&r, 1);
        self.emit.end_loop(&inner);
        self.emit.end_loop(&rounds);
        self.scopes.delete(&rounds)?;
        self.scopes.delete(&inner)?;
        Ok(r)
    }

    /// Quotient by guarded repeated subtraction: subtract b only while the
    /// working copy still holds at least b, so the count never overshoots
    /// and the result is identical under both overflow policies.
    fn op_div(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let work = self.fresh_copy(a)?;
        let q = self.scopes.temp();
        self.emit.set_zero(&q);
        let g = self.scopes.temp();
        self.ge_into(&g, &work, b)?;
        self.emit.begin_loop(&g);
        self.sub_into(&work, b)?;
        self.emit.inc(&q, 1);
        self.ge_into(&g, &work, b)?;
        self.emit.end_loop(&g);
        self.scopes.delete(&work)?;
        self.scopes.delete(&g)?;
        Ok(q)
    }

    /// `a - (a / b) * b`. The product never exceeds a, so the final
    /// subtraction cannot underflow.
    fn op_mod(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let q = self.op_div(a, b)?;
        let m = self.op_mul(&q, b)?;
        let r = self.fresh_copy(a)?;
        self.sub_into(&r, &m)?;
        self.scopes.delete(&q)?;
        self.scopes.delete(&m)?;
        Ok(r)
    }

    /// r := (x >= y), via the clamped difference y - x.
    fn ge_into(&mut self, r: &Symbol, x: &Symbol, y: &Symbol) -> CompileResult<()> {
        self.emit.load_int(r, 1);
        let d = self.diff_clamped(y, x)?;
        self.emit.begin_once(&d);
        self.emit.set_zero(r);
        self.emit.end_once(&d);
        self.scopes.delete(&d)
    }

    fn op_eq(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.load_int(&r, 1);
        let d = self.diff_clamped(a, b)?;
        self.emit.begin_once(&d);
        self.emit.set_zero(&r);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        let d = self.diff_clamped(b, a)?;
        self.emit.begin_once(&d);
        self.emit.set_zero(&r);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        Ok(r)
    }

    fn op_ne(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.set_zero(&r);
        let d = self.diff_clamped(a, b)?;
        self.emit.begin_once(&d);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        let d = self.diff_clamped(b, a)?;
        self.emit.begin_once(&d);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        Ok(r)
    }

    /// Two independent directional probes; a single saturating subtraction
    /// loses the sign, so both differences are consulted.
    fn op_lt(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.set_zero(&r);
        let d = self.diff_clamped(b, a)?;
        self.emit.begin_once(&d);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        let d = self.diff_clamped(a, b)?;
        self.emit.begin_once(&d);
        self.emit.set_zero(&r);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        Ok(r)
    }

    fn op_le(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.load_int(&r, 1);
        let d = self.diff_clamped(a, b)?;
        self.emit.begin_once(&d);
        self.emit.set_zero(&r);
        self.emit.end_once(&d);
        self.scopes.delete(&d)?;
        Ok(r)
    }

    fn op_and(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.set_zero(&r);
        let ca = self.fresh_copy(a)?;
        let cb = self.scopes.temp();
        self.emit.begin_once(&ca);
        self.copy_val(&cb, b)?;
        self.emit.begin_once(&cb);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&cb);
        self.emit.end_once(&ca);
        self.scopes.delete(&ca)?;
        self.scopes.delete(&cb)?;
        Ok(r)
    }

    fn op_or(&mut self, a: &Symbol, b: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.set_zero(&r);
        let ca = self.fresh_copy(a)?;
        self.emit.begin_once(&ca);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&ca);
        self.scopes.delete(&ca)?;
        let cb = self.fresh_copy(b)?;
        self.emit.begin_once(&cb);
        self.emit.load_int(&r, 1);
        self.emit.end_once(&cb);
        self.scopes.delete(&cb)?;
        Ok(r)
    }

    fn op_not(&mut self, x: &Symbol) -> CompileResult<Symbol> {
        let r = self.scopes.temp();
        self.emit.load_int(&r, 1);
        let cx = self.fresh_copy(x)?;
        self.emit.begin_once(&cx);
        self.emit.set_zero(&r);
        self.emit.end_once(&cx);
        self.scopes.delete(&cx)?;
        Ok(r)
    }

    // ---- printing -----------------------------------------------------------

    fn print_value(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Str(text) => {
                self.print_literal(text);
                Ok(())
            }
            Expr::Var(name) => {
                let sym = self
                    .scopes
                    .resolve(name)
                    .cloned()
                    .ok_or_else(|| CompileError::UnknownIdentifier(name.to_string()))?;
                if sym.kind == ValueKind::Str {
                    self.emit.output_cells(&sym);
                    Ok(())
                } else {
                    self.expect_scalar(&sym)?;
                    self.print_int(&sym)
                }
            }
            _ => {
                let v = self.eval(expr)?;
                self.expect_scalar(&v)?;
                self.print_int(&v)
            }
        }
    }

    /// Compile-time-known text: load the first byte, then step to each next
    /// byte by its signed delta instead of a full reload.
    fn print_literal(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let t = self.scopes.temp();
        let bytes = text.as_bytes();
        self.emit.load_int(&t, bytes[0]);
        self.emit.output_cell(&t);
        for pair in bytes.windows(2) {
            let (prev, next) = (pair[0] as i32, pair[1] as i32);
            if next >= prev {
                self.emit.inc(&t, (next - prev) as usize);
            } else {
                self.emit.dec(&t, (prev - next) as usize);
            }
            self.emit.output_cell(&t);
        }
    }

    /// Decimal digits with leading-zero suppression: hundreds print only when
    /// non-zero, tens when the hundreds printed or the tens digit is
    /// non-zero, units always.
    fn print_int(&mut self, sym: &Symbol) -> CompileResult<()> {
        let hundred = self.const_cell(100);
        let ten = self.const_cell(10);
        let hundreds = self.op_div(sym, &hundred)?;
        let rest = self.op_mod(sym, &hundred)?;
        let tens = self.op_div(&rest, &ten)?;
        let units = self.op_mod(&rest, &ten)?;
        let printed_hundreds = self.scopes.temp();
        self.emit.set_zero(&printed_hundreds);
        let probe = self.fresh_copy(&hundreds)?;
        self.emit.begin_once(&probe);
        self.emit.inc(&hundreds, ASCII_ZERO);
        self.emit.output_cell(&hundreds);
        self.emit.load_int(&printed_hundreds, 1);
        self.emit.end_once(&probe);
        let show_tens = self.scopes.temp();
        self.emit.set_zero(&show_tens);
        let probe = self.fresh_copy(&tens)?;
        self.emit.begin_once(&probe);
        self.emit.load_int(&show_tens, 1);
        self.emit.end_once(&probe);
        self.emit.begin_once(&printed_hundreds);
        self.emit.load_int(&show_tens, 1);
        self.emit.end_once(&printed_hundreds);
        self.emit.begin_once(&show_tens);
        self.emit.inc(&tens, ASCII_ZERO);
        self.emit.output_cell(&tens);
        self.emit.end_once(&show_tens);
        self.emit.inc(&units, ASCII_ZERO);
        self.emit.output_cell(&units);
        Ok(())
    }
}

fn int_literal(n: i32) -> CompileResult<u8> {
    u8::try_from(n).map_err(|_| CompileError::LiteralRange(n))
}

fn is_const_zero(expr: &Expr, sym: &Symbol) -> bool {
    matches!(expr, Expr::Int(0)) || matches!(sym.constant, Some(Const::Int(0)))
}

// Unrolling must match the runtime loop exactly, so the first counter value
// past the stop has to stay inside a byte; otherwise the runtime counter
// would clamp or wrap there and the two forms would diverge.
fn unroll_exit_in_range(start: u8, stop: u8, step: u8) -> bool {
    let mut i = start as u32;
    while i <= stop as u32 {
        i += step as u32;
    }
    i <= 255
}

fn const_bounds(start: &Expr, stop: &Expr, step: &Expr) -> CompileResult<Option<(u8, u8, u8)>> {
    match (start, stop, step) {
        (Expr::Int(a), Expr::Int(b), Expr::Int(s)) => Ok(Some((
            int_literal(*a)?,
            int_literal(*b)?,
            int_literal(*s)?,
        ))),
        _ => Ok(None),
    }
}

fn expr_has_io_or_calls(expr: &Expr) -> bool {
    match expr {
        Expr::Call(..) | Expr::ReadChar | Expr::ReadInt => true,
        Expr::Binary(_, lhs, rhs) => expr_has_io_or_calls(lhs) || expr_has_io_or_calls(rhs),
        Expr::Not(inner) => expr_has_io_or_calls(inner),
        Expr::Index(_, index) => expr_has_io_or_calls(index),
        Expr::Int(_) | Expr::Str(_) | Expr::Var(_) => false,
    }
}

fn stmts_have_io_or_calls(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::Print(_) | Stmt::PrintChar(_) | Stmt::Call { .. } => true,
        Stmt::IntDecl { init, .. } => init.as_ref().is_some_and(expr_has_io_or_calls),
        Stmt::StrDecl { .. } | Stmt::ArrayDecl { .. } => false,
        Stmt::Assign { value, .. } | Stmt::OpAssign { value, .. } | Stmt::Return(value) => {
            expr_has_io_or_calls(value)
        }
        Stmt::IndexAssign { index, value, .. } => {
            expr_has_io_or_calls(index) || expr_has_io_or_calls(value)
        }
        Stmt::If { cond, then, els } => {
            expr_has_io_or_calls(cond)
                || stmts_have_io_or_calls(then)
                || els.as_deref().is_some_and(stmts_have_io_or_calls)
        }
        Stmt::While { cond, body } => expr_has_io_or_calls(cond) || stmts_have_io_or_calls(body),
        Stmt::For {
            start,
            stop,
            step,
            body,
            ..
        } => {
            expr_has_io_or_calls(start)
                || expr_has_io_or_calls(stop)
                || expr_has_io_or_calls(step)
                || stmts_have_io_or_calls(body)
        }
        Stmt::Block(stmts) => stmts_have_io_or_calls(stmts),
    })
}

// Conservative: shadowed redeclarations also count, which only means the
// loop stays in its runtime form.
fn stmts_assign_to(stmts: &[Stmt], var: &str) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::Assign { name, .. }
        | Stmt::OpAssign { name, .. }
        | Stmt::IndexAssign { name, .. } => name == var,
        Stmt::If { then, els, .. } => {
            stmts_assign_to(then, var) || els.as_deref().is_some_and(|e| stmts_assign_to(e, var))
        }
        Stmt::While { body, .. } | Stmt::For { body, .. } => stmts_assign_to(body, var),
        Stmt::Block(stmts) => stmts_assign_to(stmts, var),
        _ => false,
    })
}
