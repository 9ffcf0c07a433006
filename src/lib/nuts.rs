//! No-U-Turn sampler with multinomial trajectory sampling and a diagonal
//! Euclidean metric.
//!
//! One [`NutsChain`] owns its random stream and adaptation state. Warmup runs
//! dual averaging on the step size and re-estimates the inverse mass matrix at
//! the end of every slow window; after warmup both are frozen.

use crate::adapt::{DualAverage, RunningVariance, WarmupSchedule};
use crate::density::LogDensity;
use crate::error::{AbError, Result};
use log::{debug, trace};
use rand::Rng;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Energy error beyond which a trajectory is declared divergent.
const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Attempts at finding a finite starting point.
const MAX_INIT_ATTEMPTS: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct NutsSettings {
    pub draws: usize,
    pub tune: usize,
    pub target_accept: f64,
    pub max_tree_depth: u32,
}

/// Statistics recorded for every kept draw.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DrawStats {
    pub lp: f64,
    pub energy: f64,
    pub step_size: f64,
    pub tree_depth: u32,
    pub n_steps: u32,
    pub acceptance_rate: f64,
    pub diverging: bool,
}

/// Output of one chain, positions on the unconstrained scale.
#[derive(Clone, Debug)]
pub struct ChainDraws {
    pub positions: Vec<Vec<f64>>,
    pub stats: Vec<DrawStats>,
    pub tune_divergences: usize,
    pub step_size: f64,
    pub inv_mass: Vec<f64>,
}

#[derive(Clone, Debug)]
struct Point {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

/// A (sub)trajectory; `first` and `last` are in integration order.
struct Subtree {
    first: Point,
    last: Point,
    proposal: Point,
    rho: Vec<f64>,
    log_sum_weight: f64,
    sum_accept: f64,
    n_leapfrog: u32,
    diverging: bool,
    turning: bool,
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

pub struct NutsChain<'a, D: LogDensity> {
    density: &'a D,
    settings: NutsSettings,
    rng: Xoshiro256PlusPlus,
    inv_mass: Vec<f64>,
    step_size: f64,
}

impl<'a, D: LogDensity> NutsChain<'a, D> {
    pub fn new(density: &'a D, settings: NutsSettings, rng: Xoshiro256PlusPlus) -> Self {
        let dim = density.dim();
        Self {
            density,
            settings,
            rng,
            inv_mass: vec![1.0; dim],
            step_size: 1.0,
        }
    }

    /// Run warmup followed by the kept draws.
    pub fn run(mut self) -> Result<ChainDraws> {
        let dim = self.density.dim();
        let mut current = self.initial_point()?;
        self.step_size = self.find_reasonable_step(&current)?;

        let tune = self.settings.tune;
        let schedule = WarmupSchedule::new(tune);
        let mut dual = DualAverage::new(self.step_size, self.settings.target_accept);
        let mut variance = RunningVariance::new(dim);

        let mut positions = Vec::with_capacity(self.settings.draws);
        let mut stats = Vec::with_capacity(self.settings.draws);
        let mut tune_divergences = 0;

        for iter in 0..tune + self.settings.draws {
            let (next, draw_stats) = self.transition(&current);
            current = next;

            if iter < tune {
                if draw_stats.diverging {
                    tune_divergences += 1;
                }
                dual.update(draw_stats.acceptance_rate);
                self.step_size = dual.current_step();

                if schedule.in_metric_window(iter) {
                    variance.add(&current.q);
                }
                if schedule.ends_window(iter) {
                    self.inv_mass = variance.regularized();
                    variance.reset();
                    self.step_size = self.find_reasonable_step(&current)?;
                    dual.restart(self.step_size);
                    trace!("Window closed at iteration {}, step size {}", iter + 1, self.step_size);
                }
                if iter + 1 == tune {
                    self.step_size = dual.final_step();
                    debug!(
                        "Warmup done: step size {:.4}, inverse mass {:?}",
                        self.step_size, self.inv_mass
                    );
                }
            } else {
                positions.push(current.q.clone());
                stats.push(draw_stats);
            }
        }

        Ok(ChainDraws {
            positions,
            stats,
            tune_divergences,
            step_size: self.step_size,
            inv_mass: self.inv_mass,
        })
    }

    fn initial_point(&mut self) -> Result<Point> {
        let dim = self.density.dim();
        for attempt in 0..MAX_INIT_ATTEMPTS {
            let q: Vec<f64> = (0..dim).map(|_| self.rng.gen_range(-1.0..1.0)).collect();
            let mut grad = vec![0.0; dim];
            let logp = self.density.logp_and_grad(&q, &mut grad);
            if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
                trace!("Initial point found after {} attempts", attempt + 1);
                return Ok(Point {
                    q,
                    p: vec![0.0; dim],
                    grad,
                    logp,
                });
            }
        }
        Err(AbError::SamplingFailure(format!(
            "no finite starting point after {} attempts",
            MAX_INIT_ATTEMPTS
        )))
    }

    fn sample_momentum(&mut self) -> Vec<f64> {
        let mut p = Vec::with_capacity(self.inv_mass.len());
        for i in 0..self.inv_mass.len() {
            let z: f64 = self.rng.sample(StandardNormal);
            p.push(z / self.inv_mass[i].sqrt());
        }
        p
    }

    fn kinetic(&self, p: &[f64]) -> f64 {
        0.5 * p.iter().zip(&self.inv_mass).map(|(p, m)| p * p * m).sum::<f64>()
    }

    fn hamiltonian(&self, point: &Point) -> f64 {
        -point.logp + self.kinetic(&point.p)
    }

    fn p_sharp(&self, p: &[f64]) -> Vec<f64> {
        p.iter().zip(&self.inv_mass).map(|(p, m)| p * m).collect()
    }

    /// Both ends of the trajectory still move away from each other.
    fn no_u_turn(&self, a: &[f64], b: &[f64], rho: &[f64]) -> bool {
        let dot = |x: Vec<f64>| x.iter().zip(rho).map(|(x, r)| x * r).sum::<f64>();
        dot(self.p_sharp(a)) > 0.0 && dot(self.p_sharp(b)) > 0.0
    }

    fn leapfrog(&self, point: &Point, step: f64) -> Point {
        let dim = point.q.len();
        let mut p: Vec<f64> = (0..dim).map(|i| point.p[i] + 0.5 * step * point.grad[i]).collect();
        let q: Vec<f64> = (0..dim)
            .map(|i| point.q[i] + step * self.inv_mass[i] * p[i])
            .collect();
        let mut grad = vec![0.0; dim];
        let logp = self.density.logp_and_grad(&q, &mut grad);
        for i in 0..dim {
            p[i] += 0.5 * step * grad[i];
        }
        Point { q, p, grad, logp }
    }

    /// Double or halve the step size until one leapfrog step crosses an
    /// acceptance probability of 0.8.
    fn find_reasonable_step(&mut self, start: &Point) -> Result<f64> {
        let threshold = 0.8f64.ln();
        let mut step = self.step_size;
        let mut direction = 0.0;
        loop {
            let mut point = start.clone();
            point.p = self.sample_momentum();
            let h0 = self.hamiltonian(&point);
            let next = self.leapfrog(&point, step);
            let mut h = self.hamiltonian(&next);
            if h.is_nan() {
                h = f64::INFINITY;
            }
            let delta = h0 - h;

            if direction == 0.0 {
                direction = if delta > threshold { 1.0 } else { -1.0 };
            } else if (direction > 0.0 && !(delta > threshold))
                || (direction < 0.0 && !(delta < threshold))
            {
                return Ok(step);
            }
            step = if direction > 0.0 { step * 2.0 } else { step * 0.5 };

            if step > 1e7 {
                return Err(AbError::SamplingFailure(
                    "step size search diverged, the posterior looks improper".to_string(),
                ));
            }
            if step == 0.0 {
                return Err(AbError::SamplingFailure(
                    "step size collapsed to zero, no valid leapfrog step".to_string(),
                ));
            }
        }
    }

    fn transition(&mut self, current: &Point) -> (Point, DrawStats) {
        let mut start = current.clone();
        start.p = self.sample_momentum();
        let h0 = self.hamiltonian(&start);

        let mut minus = start.clone();
        let mut plus = start.clone();
        let mut proposal = start.clone();
        let mut rho = start.p.clone();
        let mut log_sum_weight = 0.0;
        let mut sum_accept = 0.0;
        let mut n_leapfrog = 0;
        let mut depth = 0;
        let mut diverging = false;

        while depth < self.settings.max_tree_depth {
            let forward = self.rng.gen_bool(0.5);
            let sub = if forward {
                self.build_tree(&plus, 1.0, depth, h0)
            } else {
                self.build_tree(&minus, -1.0, depth, h0)
            };
            depth += 1;
            n_leapfrog += sub.n_leapfrog;
            sum_accept += sub.sum_accept;

            if sub.diverging {
                diverging = true;
                break;
            }
            if sub.turning {
                break;
            }

            let ln_u: f64 = self.rng.gen_range(0.0f64..1.0).ln();
            if ln_u < sub.log_sum_weight - log_sum_weight {
                proposal = sub.proposal.clone();
            }
            log_sum_weight = log_add_exp(log_sum_weight, sub.log_sum_weight);

            let rho_total = add(&rho, &sub.rho);
            let keeps_going = if forward {
                self.no_u_turn(&minus.p, &sub.last.p, &rho_total)
                    && self.no_u_turn(&minus.p, &sub.first.p, &add(&rho, &sub.first.p))
                    && self.no_u_turn(&plus.p, &sub.last.p, &add(&sub.rho, &plus.p))
            } else {
                self.no_u_turn(&sub.last.p, &plus.p, &rho_total)
                    && self.no_u_turn(&sub.last.p, &minus.p, &add(&sub.rho, &minus.p))
                    && self.no_u_turn(&sub.first.p, &plus.p, &add(&rho, &sub.first.p))
            };
            if forward {
                plus = sub.last;
            } else {
                minus = sub.last;
            }
            rho = rho_total;
            if !keeps_going {
                break;
            }
        }

        let stats = DrawStats {
            lp: proposal.logp,
            energy: self.hamiltonian(&proposal),
            step_size: self.step_size,
            tree_depth: depth,
            n_steps: n_leapfrog,
            acceptance_rate: if n_leapfrog > 0 {
                sum_accept / n_leapfrog as f64
            } else {
                0.0
            },
            diverging,
        };
        (proposal, stats)
    }

    fn build_tree(&mut self, start: &Point, direction: f64, depth: u32, h0: f64) -> Subtree {
        if depth == 0 {
            let next = self.leapfrog(start, direction * self.step_size);
            let mut h = self.hamiltonian(&next);
            if h.is_nan() {
                h = f64::INFINITY;
            }
            let diverging = h - h0 > MAX_ENERGY_ERROR;
            let weight = h0 - h;
            return Subtree {
                first: next.clone(),
                last: next.clone(),
                rho: next.p.clone(),
                proposal: next,
                log_sum_weight: weight,
                sum_accept: weight.exp().min(1.0),
                n_leapfrog: 1,
                diverging,
                turning: false,
            };
        }

        let init = self.build_tree(start, direction, depth - 1, h0);
        if init.diverging || init.turning {
            return init;
        }
        let fin = self.build_tree(&init.last, direction, depth - 1, h0);
        let n_leapfrog = init.n_leapfrog + fin.n_leapfrog;
        let sum_accept = init.sum_accept + fin.sum_accept;
        if fin.diverging || fin.turning {
            return Subtree {
                n_leapfrog,
                sum_accept,
                ..fin
            };
        }

        let log_sum_weight = log_add_exp(init.log_sum_weight, fin.log_sum_weight);
        let ln_u: f64 = self.rng.gen_range(0.0f64..1.0).ln();
        let proposal = if ln_u < fin.log_sum_weight - log_sum_weight {
            fin.proposal
        } else {
            init.proposal
        };

        let rho = add(&init.rho, &fin.rho);
        let turning = !self.no_u_turn(&init.first.p, &fin.last.p, &rho)
            || !self.no_u_turn(&init.first.p, &fin.first.p, &add(&init.rho, &fin.first.p))
            || !self.no_u_turn(&init.last.p, &fin.last.p, &add(&fin.rho, &init.last.p));

        Subtree {
            first: init.first,
            last: fin.last,
            proposal,
            rho,
            log_sum_weight,
            sum_accept,
            n_leapfrog,
            diverging: false,
            turning,
        }
    }
}
