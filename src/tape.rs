use rustc_hash::FxHashMap;

use crate::elementals::{gradient_of, Elemental, Gradient};
use crate::op::Op;

/// Handle to a mutable scalar slot (a "place") on the tape.
///
/// Handles are cheap to copy and compare; two handles are the same storage
/// exactly when they are equal. A handle is only meaningful on the tape that
/// issued it, and only until the frame that allocated it is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cell(pub(crate) usize);

/// What a record stands for, with the per-kind argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Placeholder; skipped by the backward pass.
    Dummy,
    /// Simultaneous assignment to `arity` targets.
    Assignment { arity: usize },
    Arithmetic { op: Op },
    /// Call to a registered elemental; `index` points into the elemental log.
    Elemental { index: usize },
    /// Top of the record log just before a nested differentiated call.
    /// Neutralized to `Dummy` when the call returns; the backward pass must
    /// never see one.
    Call,
}

/// One recorded instruction. Fixed size; arguments live in the place log and
/// the value store, so a record is two indices and a kind.
#[derive(Debug, Clone, Copy)]
struct Record {
    kind: Kind,
    /// First place of this record's window in the place log.
    p: usize,
    /// First entry of this record's save area in the value store.
    v: usize,
}

/// Gradient of one recorded elemental call.
#[derive(Clone, Copy)]
struct ElementalEntry {
    /// Argument count.
    n: usize,
    grad: Gradient,
}

/// Snapshot of the tape extents at entry to a differentiated evaluation.
/// Popping a frame truncates every array back to these lengths.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Number of parameters.
    n: usize,
    /// Records.
    r: usize,
    /// Places.
    p: usize,
    /// Values.
    v: usize,
    /// Elementals.
    e: usize,
}

/// The execution trace of a forward evaluation.
///
/// The tape owns all scalar storage: cells are indices into the value store,
/// which doubles as the save area for values overwritten by assignments and
/// for elemental arguments. Records, places, values and elemental entries are
/// append-only; a counter frame per evaluation supports nesting, and popping
/// a frame is O(1) truncation.
///
/// ```
/// use tapegrad::{Op, Tape};
///
/// let mut tape = Tape::new();
/// let x = tape.setup(&[2.0, 4.0]);
/// let q = tape.arithmetic(Op::Div, &[x[0], x[1]]);
/// tape.ret(q);
/// assert_eq!(tape.gradient(), vec![0.25, -0.125]);
/// ```
#[derive(Debug)]
pub struct Tape {
    records: Vec<Record>,
    places: Vec<Cell>,
    values: Vec<f64>,
    elementals: Vec<ElementalEntry>,
    frames: Vec<Frame>,
    /// Adjoint slot per place, parallel to `places`; rebuilt per backward pass.
    adj: Vec<usize>,
    /// Dense adjoint values, indexed by the slots in `adj`.
    adv: Vec<f64>,
}

impl std::fmt::Debug for ElementalEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ElementalEntry(n: {})", self.n)
    }
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        let mut tape = Self {
            records: Vec::new(),
            places: Vec::new(),
            values: Vec::new(),
            elementals: Vec::new(),
            frames: Vec::new(),
            adj: Vec::new(),
            adv: Vec::new(),
        };
        // A leading placeholder keeps `called` well-defined on a fresh tape.
        tape.records.push(Record {
            kind: Kind::Dummy,
            p: 0,
            v: 0,
        });
        tape
    }

    /// Allocates a new cell holding `x`.
    pub fn value(&mut self, x: f64) -> Cell {
        self.values.push(x);
        Cell(self.values.len() - 1)
    }

    /// Current value of a cell.
    #[must_use]
    pub fn read(&self, c: Cell) -> f64 {
        self.values[c.0]
    }

    /// Opens a frame for the forward pass and returns the parameter cells,
    /// one per entry of `x`, in order.
    ///
    /// The first place of the frame is the result slot, filled in by
    /// [`ret`](Tape::ret); the parameter places follow it and are where
    /// [`gradient`](Tape::gradient) collects the partials.
    pub fn setup(&mut self, x: &[f64]) -> Vec<Cell> {
        self.push_frame(x.len());
        let result = self.value(0.0);
        self.places.push(result);
        let mut params = Vec::with_capacity(x.len());
        for &xi in x {
            let c = self.value(xi);
            self.places.push(c);
            params.push(c);
        }
        params
    }

    fn push_frame(&mut self, n: usize) {
        self.frames.push(Frame {
            n,
            r: self.records.len(),
            p: self.places.len(),
            v: self.values.len(),
            e: self.elementals.len(),
        });
    }

    /// Copies the actual arguments of a nested call into the formal
    /// parameter cells.
    ///
    /// The caller has appended the actuals to the place log (see
    /// [`call`](Tape::call)); this records the parallel assignment that
    /// connects them to `formals`, so adjoints of the callee's parameters
    /// propagate out to the caller's argument expressions.
    pub fn enter(&mut self, formals: &[Cell]) {
        let p0 = self.places.len() - formals.len();
        let actuals: Vec<Cell> = self.places[p0..].to_vec();
        self.parallel_assign(formals, &actuals);
    }

    /// Installs `c` as the result of the current frame and returns its value.
    pub fn ret(&mut self, c: Cell) -> f64 {
        let f = self.frames.last().expect("no active frame");
        self.places[f.p] = c;
        self.values[c.0]
    }

    /// Records an arithmetic operation, evaluates it eagerly, and returns
    /// the result cell.
    pub fn arithmetic(&mut self, op: Op, args: &[Cell]) -> Cell {
        assert_eq!(args.len(), op.arity(), "arithmetic: wrong operand count");
        let p = self.value(0.0);
        self.records.push(Record {
            kind: Kind::Arithmetic { op },
            p: self.places.len(),
            v: 0,
        });
        self.places.push(p);
        self.places.extend_from_slice(args);
        let r = match op {
            Op::Neg => -self.values[args[0].0],
            Op::Add => self.values[args[0].0] + self.values[args[1].0],
            Op::Sub => self.values[args[0].0] - self.values[args[1].0],
            Op::Mul => self.values[args[0].0] * self.values[args[1].0],
            Op::Div => self.values[args[0].0] / self.values[args[1].0],
        };
        self.values[p.0] = r;
        p
    }

    /// Records a single-target assignment `*target = *source`.
    ///
    /// Most assignments are single-valued; this avoids the loops and the
    /// intermediate copies of the parallel form.
    pub fn assignment(&mut self, target: Cell, source: Cell) {
        self.records.push(Record {
            kind: Kind::Assignment { arity: 1 },
            p: self.places.len(),
            v: self.values.len(),
        });
        self.places.push(target);
        self.places.push(source);
        let saved = self.values[target.0];
        self.values.push(saved);
        self.values[target.0] = self.values[source.0];
    }

    /// Records a parallel assignment. `cells` holds the k targets followed
    /// by the k sources.
    pub fn parallel_assignment(&mut self, cells: &[Cell]) {
        assert!(
            cells.len() % 2 == 0,
            "parallel_assignment: odd number of cells"
        );
        let (targets, sources) = cells.split_at(cells.len() / 2);
        self.parallel_assign(targets, sources);
    }

    pub(crate) fn parallel_assign(&mut self, targets: &[Cell], sources: &[Cell]) {
        assert_eq!(targets.len(), sources.len());
        self.records.push(Record {
            kind: Kind::Assignment {
                arity: targets.len(),
            },
            p: self.places.len(),
            v: self.values.len(),
        });
        self.places.extend_from_slice(targets);
        for &t in targets {
            let pre = self.values[t.0];
            self.values.push(pre);
        }
        self.places.extend_from_slice(sources);
        let v0 = self.values.len();
        for &s in sources {
            let sv = self.values[s.0];
            self.values.push(sv);
        }
        // Writes go through the copies, so every source is read before any
        // target is written; `x, y = y, x` stays correct.
        for (i, &t) in targets.iter().enumerate() {
            self.values[t.0] = self.values[v0 + i];
        }
    }

    /// Records a call to a one-argument elemental.
    pub fn elemental1(&mut self, f: fn(f64) -> f64, x: Cell) -> Cell {
        self.elemental(Elemental::Unary(f), &[x])
    }

    /// Records a call to a two-argument elemental.
    pub fn elemental2(&mut self, f: fn(f64, f64) -> f64, x: Cell, y: Cell) -> Cell {
        self.elemental(Elemental::Binary(f), &[x, y])
    }

    /// Records a call to a slice-argument elemental.
    pub fn elemental_n(&mut self, f: fn(&[f64]) -> f64, args: &[Cell]) -> Cell {
        self.elemental(Elemental::Nary(f), args)
    }

    /// Records an elemental call, evaluates it, and returns the result cell.
    ///
    /// # Panics
    ///
    /// Panics if no gradient is registered for `f`. The evaluation cannot
    /// continue: derivatives do not propagate through unregistered functions.
    pub fn elemental(&mut self, f: Elemental, args: &[Cell]) -> Cell {
        let grad = gradient_of(f).expect("not an elemental");
        let p = self.value(0.0);
        self.records.push(Record {
            kind: Kind::Elemental {
                index: self.elementals.len(),
            },
            p: self.places.len(),
            v: self.values.len(),
        });
        self.elementals.push(ElementalEntry {
            n: args.len(),
            grad,
        });
        self.places.push(p);
        self.places.extend_from_slice(args);
        // Argument values are copied to the tape so the backward pass can
        // hand them to the gradient without chasing places.
        let v0 = self.values.len();
        for &a in args {
            let av = self.values[a.0];
            self.values.push(av);
        }
        let r = f.invoke(&self.values[v0..v0 + args.len()]);
        self.values[p.0] = r;
        p
    }

    /// True iff the last record is a call marker, i.e. the current function
    /// was invoked from another differentiated function. Prologues use this
    /// to choose between [`enter`](Tape::enter) and [`setup`](Tape::setup).
    #[must_use]
    pub fn called(&self) -> bool {
        matches!(
            self.records.last(),
            Some(Record {
                kind: Kind::Call,
                ..
            })
        )
    }

    /// Invokes one differentiated function from another on the same tape.
    ///
    /// The first `narg` cells of `args` are appended to the place log, where
    /// the callee's [`enter`](Tape::enter) finds them; any cells past `narg`
    /// are bundled into fresh cells connected by a recorded parallel
    /// assignment and passed to `wrapped` as its variadic slice. The callee's
    /// result is whatever it installed in the frame's result slot.
    pub fn call<F>(&mut self, wrapped: F, narg: usize, args: &[Cell]) -> Cell
    where
        F: FnOnce(&mut Self, &[Cell]),
    {
        let (icall, vararg) = self.begin_call(narg, args);
        wrapped(self, &vararg);
        self.end_call(icall)
    }

    pub(crate) fn begin_call(&mut self, narg: usize, args: &[Cell]) -> (usize, Vec<Cell>) {
        let vararg = if narg < args.len() {
            self.variadic(&args[narg..])
        } else {
            Vec::new()
        };
        self.places.extend_from_slice(&args[..narg]);
        let icall = self.records.len();
        self.records.push(Record {
            kind: Kind::Call,
            p: 0,
            v: 0,
        });
        (icall, vararg)
    }

    pub(crate) fn end_call(&mut self, icall: usize) -> Cell {
        // Call markers decay once the callee returns; the backward pass
        // treats a live one as corruption.
        self.records[icall].kind = Kind::Dummy;
        let f = self.frames.last().expect("no active frame");
        self.places[f.p]
    }

    /// Wraps trailing arguments into fresh cells for a variadic callee.
    fn variadic(&mut self, args: &[Cell]) -> Vec<Cell> {
        let mut bundle = Vec::with_capacity(args.len());
        for _ in args {
            bundle.push(self.value(0.0));
        }
        self.parallel_assign(&bundle, args);
        bundle
    }

    /// Runs the backward pass on the current frame, returns the partials
    /// with respect to the parameters, and pops the frame.
    ///
    /// Must be called immediately after the forward evaluation, at most once
    /// per frame.
    pub fn gradient(&mut self) -> Vec<f64> {
        self.backward();
        let partials = self.partials();
        self.adv.clear();
        self.pop();
        partials
    }

    /// Discards the current frame, truncating every array to its length at
    /// [`setup`](Tape::setup). Called by [`gradient`](Tape::gradient);
    /// call it directly to drop an evaluation whose gradient is not needed.
    pub fn pop(&mut self) {
        let f = self.frames.pop().expect("no active frame");
        self.records.truncate(f.r);
        self.places.truncate(f.p);
        self.values.truncate(f.v);
        self.elementals.truncate(f.e);
        self.adj.truncate(f.p);
    }

    fn backward(&mut self) {
        let f = *self.frames.last().expect("no active frame");

        // A map keyed by storage identity would work, but hashing on every
        // record is slow. Instead each place is resolved once here into a
        // compact adjoint slot; aliased places share a slot, which is what
        // makes `x + x`, `a * a` and `x = x` come out right. The record walk
        // below then only does dense indexing.
        if self.adj.len() < self.places.len() {
            self.adj.resize(self.places.len(), 0);
        }
        let mut slots: FxHashMap<Cell, usize> = FxHashMap::default();
        slots.reserve(self.places.len() - f.p);
        for i in f.p..self.places.len() {
            let c = self.places[i];
            let slot = if let Some(&j) = slots.get(&c) {
                j
            } else {
                let j = self.adv.len();
                slots.insert(c, j);
                self.adv.push(0.0);
                j
            };
            self.adj[i] = slot;
        }

        // The frame's result slot seeds the walk.
        self.adv[self.adj[f.p]] = 1.0;

        for ir in (f.r..self.records.len()).rev() {
            let r = self.records[ir];
            match r.kind {
                Kind::Dummy => {}
                Kind::Assignment { arity: 1 } => {
                    // Undo the overwrite so earlier records see the value
                    // the target held before the assignment.
                    let t = self.places[r.p];
                    self.values[t.0] = self.values[r.v];
                    let a = self.adv[self.adj[r.p]];
                    // The left-hand side was overwritten, so its adjoint
                    // restarts at zero; clearing before accumulating keeps
                    // `x = x` an identity.
                    self.adv[self.adj[r.p]] = 0.0;
                    self.adv[self.adj[r.p + 1]] += a;
                }
                Kind::Assignment { arity: k } => {
                    for i in 0..k {
                        let t = self.places[r.p + i];
                        self.values[t.0] = self.values[r.v + i];
                    }
                    // The save area has served its purpose; reuse it to
                    // stash the target adjoints.
                    for i in 0..k {
                        self.values[r.v + i] = self.adv[self.adj[r.p + i]];
                    }
                    for i in 0..k {
                        self.adv[self.adj[r.p + i]] = 0.0;
                    }
                    for i in 0..k {
                        self.adv[self.adj[r.p + k + i]] += self.values[r.v + i];
                    }
                }
                Kind::Arithmetic { op } => {
                    let a = self.adv[self.adj[r.p]];
                    match op {
                        Op::Neg => self.adv[self.adj[r.p + 1]] -= a,
                        Op::Add => {
                            self.adv[self.adj[r.p + 1]] += a;
                            self.adv[self.adj[r.p + 2]] += a;
                        }
                        Op::Sub => {
                            self.adv[self.adj[r.p + 1]] += a;
                            self.adv[self.adj[r.p + 2]] -= a;
                        }
                        Op::Mul => {
                            let ax = a * self.values[self.places[r.p + 2].0];
                            let ay = a * self.values[self.places[r.p + 1].0];
                            self.adv[self.adj[r.p + 1]] += ax;
                            self.adv[self.adj[r.p + 2]] += ay;
                        }
                        Op::Div => {
                            let ax = a / self.values[self.places[r.p + 2].0];
                            let ay = -ax * self.values[self.places[r.p].0];
                            self.adv[self.adj[r.p + 1]] += ax;
                            self.adv[self.adj[r.p + 2]] += ay;
                        }
                    }
                }
                Kind::Elemental { index } => {
                    let a = self.adv[self.adj[r.p]];
                    let ElementalEntry { n, grad } = self.elementals[index];
                    let result = self.values[self.places[r.p].0];
                    let d = grad(result, &self.values[r.v..r.v + n]);
                    assert!(d.len() >= n, "elemental gradient returned too few partials");
                    for (i, di) in d.iter().enumerate().take(n) {
                        self.adv[self.adj[r.p + 1 + i]] += a * di;
                    }
                }
                Kind::Call => panic!("live call marker on the tape"),
            }
        }
    }

    /// Partial derivatives of the frame's parameters, in parameter order.
    fn partials(&self) -> Vec<f64> {
        let f = self.frames.last().expect("no active frame");
        (0..f.n).map(|i| self.adv[self.adj[f.p + 1 + i]]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elementals;

    fn lengths(t: &Tape) -> [usize; 5] {
        [
            t.records.len(),
            t.places.len(),
            t.values.len(),
            t.elementals.len(),
            t.frames.len(),
        ]
    }

    #[test]
    fn record_is_small() {
        assert_eq!(std::mem::size_of::<Record>(), 32);
    }

    #[test]
    fn pop_restores_lengths() {
        let mut t = Tape::new();
        let before = lengths(&t);

        let x = t.setup(&[0.0, 1.0]);
        let s = t.arithmetic(Op::Add, &[x[0], x[1]]);
        t.assignment(x[1], s);
        t.ret(x[1]);
        t.gradient();
        assert_eq!(lengths(&t), before);
        assert!(t.adv.is_empty());

        // Without the gradient.
        let x = t.setup(&[2.0]);
        let c = t.elemental1(elementals::sqrt, x[0]);
        t.ret(c);
        t.pop();
        assert_eq!(lengths(&t), before);
    }

    #[test]
    fn pop_restores_lengths_nested() {
        let mut t = Tape::new();
        let x = t.setup(&[3.0]);
        let outer = lengths(&t);

        let y = t.setup(&[5.0]);
        let m = t.arithmetic(Op::Mul, &[y[0], y[0]]);
        t.ret(m);
        assert_eq!(t.gradient(), vec![10.0]);
        assert_eq!(lengths(&t), outer);

        let r = t.arithmetic(Op::Neg, &[x[0]]);
        t.ret(r);
        assert_eq!(t.gradient(), vec![-1.0]);
    }

    #[test]
    fn ret_installs_result_slot() {
        let mut t = Tape::new();
        let x = t.setup(&[7.0]);
        let f = *t.frames.last().unwrap();
        assert_ne!(t.places[f.p], x[0]);
        assert_eq!(t.ret(x[0]), 7.0);
        assert_eq!(t.places[f.p], x[0]);
        t.pop();
    }

    #[test]
    fn call_marker_decays() {
        let mut t = Tape::new();
        let x = t.setup(&[2.0]);
        let r = t.call(
            |t, _| {
                assert!(t.called());
                let a = t.value(0.0);
                t.enter(&[a]);
                let sq = t.arithmetic(Op::Mul, &[a, a]);
                t.ret(sq);
            },
            1,
            &[x[0]],
        );
        assert!(!t.called());
        assert_eq!(t.read(r), 4.0);
        t.ret(r);
        assert_eq!(t.gradient(), vec![4.0]);
    }

    #[test]
    fn value_allocates_fresh_cells() {
        let mut t = Tape::new();
        let a = t.value(1.5);
        let b = t.value(1.5);
        assert_ne!(a, b);
        assert_eq!(t.read(a), 1.5);
    }

    #[test]
    #[should_panic(expected = "no active frame")]
    fn gradient_without_frame_panics() {
        Tape::new().gradient();
    }

    #[test]
    #[should_panic(expected = "not an elemental")]
    fn unregistered_elemental_panics() {
        fn cube(x: f64) -> f64 {
            x * x * x
        }
        let mut t = Tape::new();
        let x = t.setup(&[2.0]);
        t.elemental1(cube, x[0]);
    }
}
