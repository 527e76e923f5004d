//! Fits a normal distribution to synthetic data by gradient ascent on the
//! log-likelihood.
//!
//! The model is written the way mechanical rewriting leaves it: every
//! float expression goes through the recorder, the per-point density is a
//! differentiated method invoked through `call`, and the entry point opens
//! the tape frame with `setup`. Parameters are the mean and the log of the
//! standard deviation, so the ascent is unconstrained.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tapegrad as ad;
use tapegrad::{Cell, Op};

struct Model {
    data: Vec<f64>,
}

impl Model {
    /// log N(y | mu, exp(lsigma)), differentiated; callable only from
    /// another differentiated method.
    fn log_pdf(y0: f64, mu0: f64, lsigma0: f64) -> f64 {
        let (y, mu, lsigma);
        if ad::called() {
            y = ad::value(y0);
            mu = ad::value(mu0);
            lsigma = ad::value(lsigma0);
            ad::enter(&[y, mu, lsigma]);
        } else {
            panic!("log_pdf called outside observe");
        }
        let sigma = ad::elemental1(ad::elementals::exp, lsigma);
        let dev = ad::arithmetic(
            Op::Div,
            &[ad::arithmetic(Op::Sub, &[y, mu]), sigma],
        );
        let dev2 = ad::arithmetic(Op::Mul, &[dev, dev]);
        let half = ad::value(0.5);
        let ln_2pi = ad::value((2.0 * std::f64::consts::PI).ln());
        // -lsigma - 0.5*(ln(2*pi) + dev^2)
        let ll = ad::arithmetic(
            Op::Sub,
            &[
                ad::arithmetic(Op::Neg, &[lsigma]),
                ad::arithmetic(
                    Op::Mul,
                    &[half, ad::arithmetic(Op::Add, &[ln_2pi, dev2])],
                ),
            ],
        );
        ad::ret(ll)
    }

    /// Log-likelihood of the data under x = [mu, lsigma].
    fn observe(&self, x: &[f64]) -> f64 {
        let p: Vec<Cell> = ad::setup(x);
        let mut ll = ad::value(0.0);
        for &d in &self.data {
            let li = ad::call(
                |_| {
                    Self::log_pdf(0.0, 0.0, 0.0);
                },
                3,
                &[ad::value(d), p[0], p[1]],
            );
            let next = ad::arithmetic(Op::Add, &[ll, li]);
            ad::assignment(ll, next);
        }
        ad::ret(ll)
    }
}

fn main() {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let true_mu = 0.5;
    let true_sigma = 2.0;
    let data: Vec<f64> = Normal::new(true_mu, true_sigma)
        .unwrap()
        .sample_iter(&mut rng)
        .take(1000)
        .collect();

    let n = data.len() as f64;
    let sample_mean = data.iter().sum::<f64>() / n;
    let sample_std =
        (data.iter().map(|d| (d - sample_mean).powi(2)).sum::<f64>() / n).sqrt();

    let model = Model { data };
    let mut x = [0.0, 0.0];
    let rate = 0.1 / n;

    for step in 0..=1500 {
        let ll = model.observe(&x);
        let g = ad::gradient();
        if step % 250 == 0 {
            println!(
                "step {step:5}  ll {ll:12.3}  mu {:8.4}  sigma {:8.4}",
                x[0],
                x[1].exp()
            );
        }
        for (xi, gi) in x.iter_mut().zip(&g) {
            *xi += rate * gi;
        }
    }

    println!();
    println!("fitted  mu {:8.4}  sigma {:8.4}", x[0], x[1].exp());
    println!("sample  mu {sample_mean:8.4}  sigma {sample_std:8.4}");
}
