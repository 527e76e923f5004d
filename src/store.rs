//! Tape store and the module-level recorder.
//!
//! Every recording primitive operates on "the current tape", resolved here.
//! By default the tape is thread-local and untouched by any lock. Switching
//! to the multi-thread store with [`mt_safe_on`] keys tapes by thread
//! identity in a shared map; the mutex guards map access only and is never
//! held while recording or differentiating, at the cost of a map round-trip
//! per primitive.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::op::Op;
use crate::tape::{Cell, Tape};

static MT_SAFE: AtomicBool = AtomicBool::new(false);

static TAPES: Lazy<Mutex<FxHashMap<ThreadId, Tape>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

thread_local! {
    static TAPE: RefCell<Tape> = RefCell::new(Tape::new());
}

/// Switches the store to multi-thread mode, for running inference on
/// several threads in parallel. The switch is one-way: tapes may already be
/// held by other threads, so there is no way back to the fast path.
pub fn mt_safe_on() {
    MT_SAFE.store(true, Ordering::SeqCst);
}

fn mt_safe() -> bool {
    MT_SAFE.load(Ordering::SeqCst)
}

/// Resolves the calling thread's tape and runs `f` on it.
///
/// In multi-thread mode the tape is taken out of the shared map and put
/// back afterwards, so `f` runs without any lock held.
pub(crate) fn with_tape<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
    if mt_safe() {
        let id = thread::current().id();
        let mut tape = TAPES.lock().unwrap().remove(&id).unwrap_or_default();
        let r = f(&mut tape);
        TAPES.lock().unwrap().insert(id, tape);
        r
    } else {
        TAPE.with(|t| f(&mut t.borrow_mut()))
    }
}

/// Discards the calling thread's tape. Call at thread exit in multi-thread
/// mode to release the thread's entry in the store.
pub fn drop_tape() {
    if mt_safe() {
        TAPES.lock().unwrap().remove(&thread::current().id());
    } else {
        TAPE.with(|t| *t.borrow_mut() = Tape::new());
    }
}

/// Discards all tapes. Fresh tapes are created on next use.
pub fn clear_tape() {
    if mt_safe() {
        TAPES.lock().unwrap().clear();
    } else {
        TAPE.with(|t| *t.borrow_mut() = Tape::new());
    }
}

// The recorder, resolved against the current tape. This is the surface
// generated model code calls into; see the methods on [`Tape`] for the
// semantics of each primitive.

/// See [`Tape::setup`].
pub fn setup(x: &[f64]) -> Vec<Cell> {
    with_tape(|t| t.setup(x))
}

/// See [`Tape::value`].
pub fn value(x: f64) -> Cell {
    with_tape(|t| t.value(x))
}

/// See [`Tape::read`].
#[must_use]
pub fn read(c: Cell) -> f64 {
    with_tape(|t| t.read(c))
}

/// See [`Tape::ret`].
pub fn ret(c: Cell) -> f64 {
    with_tape(|t| t.ret(c))
}

/// See [`Tape::enter`].
pub fn enter(formals: &[Cell]) {
    with_tape(|t| t.enter(formals));
}

/// See [`Tape::arithmetic`].
pub fn arithmetic(op: Op, args: &[Cell]) -> Cell {
    with_tape(|t| t.arithmetic(op, args))
}

/// See [`Tape::assignment`].
pub fn assignment(target: Cell, source: Cell) {
    with_tape(|t| t.assignment(target, source));
}

/// See [`Tape::parallel_assignment`].
pub fn parallel_assignment(cells: &[Cell]) {
    with_tape(|t| t.parallel_assignment(cells));
}

/// See [`Tape::elemental1`].
pub fn elemental1(f: fn(f64) -> f64, x: Cell) -> Cell {
    with_tape(|t| t.elemental1(f, x))
}

/// See [`Tape::elemental2`].
pub fn elemental2(f: fn(f64, f64) -> f64, x: Cell, y: Cell) -> Cell {
    with_tape(|t| t.elemental2(f, x, y))
}

/// See [`Tape::elemental_n`].
pub fn elemental_n(f: fn(&[f64]) -> f64, args: &[Cell]) -> Cell {
    with_tape(|t| t.elemental_n(f, args))
}

/// See [`Tape::called`].
#[must_use]
pub fn called() -> bool {
    with_tape(|t| t.called())
}

/// Invokes one differentiated function from another; see [`Tape::call`].
///
/// The tape is released while `wrapped` runs, so the wrapped body records
/// through this module like any other differentiated code.
pub fn call(wrapped: impl FnOnce(&[Cell]), narg: usize, args: &[Cell]) -> Cell {
    let (icall, vararg) = with_tape(|t| t.begin_call(narg, args));
    wrapped(&vararg);
    with_tape(|t| t.end_call(icall))
}

/// See [`Tape::gradient`].
pub fn gradient() -> Vec<f64> {
    with_tape(Tape::gradient)
}

/// See [`Tape::pop`].
pub fn pop() {
    with_tape(Tape::pop);
}
