//! Multi-thread store behavior. These tests flip the process-wide store
//! into multi-thread mode, which is one-way, so the single-tape fast path
//! is exercised by the other integration suites instead.

use std::thread;

use serial_test::serial;
use tapegrad::{
    arithmetic, called, clear_tape, drop_tape, gradient, mt_safe_on, ret, setup, Op,
};

// `clear_tape` empties the shared store, so these tests cannot overlap.

#[test]
#[serial]
fn gradients_on_parallel_threads() {
    mt_safe_on();
    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let xi = f64::from(i);
                for _ in 0..100 {
                    let x = setup(&[xi, 3.0]);
                    let m = arithmetic(Op::Mul, &[x[0], x[1]]);
                    ret(m);
                    assert_eq!(gradient(), vec![3.0, xi]);
                }
                drop_tape();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
#[serial]
fn drop_tape_discards_recordings() {
    mt_safe_on();
    // Abandon an evaluation mid-flight.
    let x = setup(&[1.0]);
    let _ = arithmetic(Op::Neg, &[x[0]]);
    drop_tape();
    // The thread starts over on a fresh tape.
    assert!(!called());
    let x = setup(&[2.0]);
    let s = arithmetic(Op::Add, &[x[0], x[0]]);
    ret(s);
    assert_eq!(gradient(), vec![2.0]);
}

#[test]
#[serial]
fn clear_tape_resets_the_store() {
    mt_safe_on();
    let x = setup(&[1.0]);
    let _ = arithmetic(Op::Neg, &[x[0]]);
    clear_tape();
    let x = setup(&[4.0]);
    let m = arithmetic(Op::Mul, &[x[0], x[0]]);
    ret(m);
    assert_eq!(gradient(), vec![8.0]);
}

#[test]
#[serial]
fn threads_do_not_share_frames() {
    mt_safe_on();
    // An unfinished frame on this thread is invisible to others.
    let x = setup(&[1.0, 2.0]);
    let sum = arithmetic(Op::Add, &[x[0], x[1]]);
    let other = thread::spawn(|| {
        let y = setup(&[7.0]);
        let n = arithmetic(Op::Neg, &[y[0]]);
        ret(n);
        let g = gradient();
        drop_tape();
        g
    })
    .join()
    .unwrap();
    assert_eq!(other, vec![-1.0]);
    ret(sum);
    assert_eq!(gradient(), vec![1.0, 1.0]);
}
