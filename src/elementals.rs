//! Elemental functions and their registered derivatives.
//!
//! An elemental is a scalar-in/scalar-out function the tape cannot
//! differentiate by itself; its analytic derivative is supplied by
//! registration. The standard real-valued library functions are registered
//! up front; models register their own with [`register_elemental`].

use std::sync::RwLock;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// Gradient of an elemental: receives the function value and the argument
/// values, and returns one partial derivative per argument. Depending on the
/// function, either the value or the arguments may go unused.
pub type Gradient = fn(f64, &[f64]) -> Vec<f64>;

/// A differentiable scalar function, tagged by shape.
///
/// One- and two-argument functions dispatch without allocation; `Nary`
/// covers functions over a slice of reals, whatever their fan-in.
#[derive(Debug, Clone, Copy)]
pub enum Elemental {
    Unary(fn(f64) -> f64),
    Binary(fn(f64, f64) -> f64),
    Nary(fn(&[f64]) -> f64),
}

impl Elemental {
    /// Stable identity of the underlying function, used as the registry key.
    fn key(self) -> usize {
        match self {
            Elemental::Unary(f) => f as usize,
            Elemental::Binary(f) => f as usize,
            Elemental::Nary(f) => f as usize,
        }
    }

    pub(crate) fn invoke(self, args: &[f64]) -> f64 {
        match self {
            Elemental::Unary(f) => {
                assert_eq!(args.len(), 1, "elemental: wrong argument count");
                f(args[0])
            }
            Elemental::Binary(f) => {
                assert_eq!(args.len(), 2, "elemental: wrong argument count");
                f(args[0], args[1])
            }
            Elemental::Nary(f) => f(args),
        }
    }
}

static REGISTRY: Lazy<RwLock<FxHashMap<usize, Gradient>>> =
    Lazy::new(|| RwLock::new(builtins()));

/// Registers the gradient for an elemental function. Overwrites any earlier
/// registration for the same function.
///
/// Registration is expected to happen at startup, before evaluations begin.
pub fn register_elemental(f: Elemental, grad: Gradient) {
    REGISTRY.write().unwrap().insert(f.key(), grad);
}

/// The registered gradient for `f`, if any.
pub(crate) fn gradient_of(f: Elemental) -> Option<Gradient> {
    REGISTRY.read().unwrap().get(&f.key()).copied()
}

// Standard library elementals. These are the function identities models are
// expected to call; each wraps the corresponding f64 method so the call site
// and the registry agree on the key.

#[must_use]
pub fn sqrt(x: f64) -> f64 {
    x.sqrt()
}

#[must_use]
pub fn exp(x: f64) -> f64 {
    x.exp()
}

#[must_use]
pub fn log(x: f64) -> f64 {
    x.ln()
}

#[must_use]
pub fn pow(x: f64, y: f64) -> f64 {
    x.powf(y)
}

#[must_use]
pub fn sin(x: f64) -> f64 {
    x.sin()
}

#[must_use]
pub fn cos(x: f64) -> f64 {
    x.cos()
}

#[must_use]
pub fn tan(x: f64) -> f64 {
    x.tan()
}

fn builtins() -> FxHashMap<usize, Gradient> {
    let mut m: FxHashMap<usize, Gradient> = FxHashMap::default();
    m.insert(Elemental::Unary(sqrt).key(), |v, _| vec![0.5 / v]);

    // Exponential and logarithmic.
    m.insert(Elemental::Unary(exp).key(), |v, _| vec![v]);
    m.insert(Elemental::Unary(log).key(), |_, a| vec![1.0 / a[0]]);
    // Only the partial with respect to the exponent is registered;
    // differentiating through the base of `pow` aborts in the backward
    // pass when the second partial is requested.
    m.insert(Elemental::Binary(pow).key(), |v, a| vec![v * a[0].ln()]);

    // Trigonometric.
    m.insert(Elemental::Unary(sin).key(), |_, a| vec![a[0].cos()]);
    m.insert(Elemental::Unary(cos).key(), |_, a| vec![-a[0].sin()]);
    m.insert(Elemental::Unary(tan).key(), |v, _| vec![1.0 + v * v]);
    m
}
