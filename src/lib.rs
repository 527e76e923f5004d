#![warn(clippy::pedantic)]
// Recorder misuse is uniformly fatal; per-function panic sections would
// just repeat the error-handling policy.
#![allow(clippy::missing_panics_doc)]

//! Tape-based reverse-mode automatic differentiation for probabilistic
//! models.
//!
//! A model computes a scalar objective from a vector of real parameters as
//! ordinary numeric code; recording that computation on a tape yields the
//! gradient with respect to all parameters in one backward sweep, at a cost
//! proportional to the forward evaluation.
//!
//! The crate-root functions record on the calling thread's tape and are the
//! contract for mechanically rewritten model code; [`Tape`] carries the same
//! primitives as methods for use with an explicit tape.
//!
//! ```
//! use tapegrad::{arithmetic, gradient, ret, setup, Op};
//!
//! let x = setup(&[3.0, 5.0]);
//! let y = arithmetic(Op::Mul, &[x[0], x[1]]);
//! ret(y);
//! assert_eq!(gradient(), vec![5.0, 3.0]);
//! ```
//!
//! Elementals, scalar functions with registered analytic derivatives,
//! extend the reachable function space beyond the arithmetic operators:
//!
//! ```
//! use tapegrad::{elemental1, elementals, gradient, ret, setup};
//!
//! let x = setup(&[4.0]);
//! let r = elemental1(elementals::sqrt, x[0]);
//! ret(r);
//! assert_eq!(gradient(), vec![0.25]);
//! ```

pub mod elementals;
pub mod op;
pub mod store;
pub mod tape;

pub use elementals::{register_elemental, Elemental, Gradient};
pub use op::Op;
pub use store::{
    arithmetic, assignment, call, called, clear_tape, drop_tape, elemental1, elemental2,
    elemental_n, enter, gradient, mt_safe_on, parallel_assignment, pop, read, ret, setup, value,
};
pub use tape::{Cell, Tape};
