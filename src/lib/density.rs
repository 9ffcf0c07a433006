//! Numerical evaluation of a compiled [`ModelSpec`].
//!
//! The sampler works on the unconstrained space: every free node owns one
//! coordinate `u`, mapped onto its support by the prior's [`Transform`]. The
//! joint log density is
//!
//! ```text
//! Σ ln prior(x_i) + Σ ln |dx_i/du_i| + Σ ln likelihood(data | nodes)
//! ```
//!
//! and its gradient is accumulated with a single reverse pass over the nodes,
//! which are stored in declaration (topological) order.

use crate::error::{AbError, Result};
use crate::model::{xlogy, Expr, Likelihood, ModelSpec, Node, Prior, Transform};
use statrs::function::gamma::{digamma, ln_gamma};

/// A differentiable log density over `R^dim`.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Log density at `position`; its gradient is written into `grad`.
    fn logp_and_grad(&self, position: &[f64], grad: &mut [f64]) -> f64;
}

#[derive(Clone, Debug)]
enum CompiledNode {
    Free {
        prior: Prior,
        transform: Transform,
        coord: usize,
    },
    Ratio(usize, usize),
    Product(usize, usize),
    Difference(usize, usize),
}

/// Likelihood terms reduced to the sufficient statistics they need.
#[derive(Clone, Debug)]
enum CompiledLikelihood {
    Binomial {
        trials: f64,
        successes: f64,
        ln_choose: f64,
        p: usize,
    },
    Gamma {
        n: f64,
        sum_x: f64,
        sum_ln_x: f64,
        shape: usize,
        rate: usize,
    },
}

impl CompiledLikelihood {
    fn ln_likelihood(&self, values: &[f64]) -> f64 {
        match *self {
            CompiledLikelihood::Binomial {
                trials,
                successes,
                ln_choose,
                p,
            } => {
                let p = values[p];
                if !(0.0..=1.0).contains(&p) {
                    return f64::NEG_INFINITY;
                }
                ln_choose + xlogy(successes, p) + xlogy(trials - successes, 1.0 - p)
            }
            CompiledLikelihood::Gamma {
                n,
                sum_x,
                sum_ln_x,
                shape,
                rate,
            } => {
                if n == 0.0 {
                    return 0.0;
                }
                let (a, b) = (values[shape], values[rate]);
                if !(a > 0.0 && b > 0.0) {
                    return f64::NEG_INFINITY;
                }
                n * a * b.ln() - n * ln_gamma(a) + (a - 1.0) * sum_ln_x - b * sum_x
            }
        }
    }

    fn accumulate_grad(&self, values: &[f64], adj: &mut [f64]) {
        match *self {
            CompiledLikelihood::Binomial {
                trials,
                successes,
                p,
                ..
            } => {
                let x = values[p];
                let failures = trials - successes;
                if successes > 0.0 {
                    adj[p] += successes / x;
                }
                if failures > 0.0 {
                    adj[p] -= failures / (1.0 - x);
                }
            }
            CompiledLikelihood::Gamma {
                n,
                sum_x,
                sum_ln_x,
                shape,
                rate,
            } => {
                if n == 0.0 {
                    return;
                }
                let (a, b) = (values[shape], values[rate]);
                adj[shape] += n * b.ln() - n * digamma(a) + sum_ln_x;
                adj[rate] += n * a / b - sum_x;
            }
        }
    }
}

/// A validated model resolved to node indices.
#[derive(Clone, Debug)]
pub struct CompiledModel {
    names: Vec<String>,
    nodes: Vec<CompiledNode>,
    likelihoods: Vec<CompiledLikelihood>,
    dim: usize,
}

impl CompiledModel {
    pub(crate) fn from_spec(spec: &ModelSpec) -> Result<Self> {
        let names: Vec<String> = spec.nodes().iter().map(|n| n.name().to_string()).collect();
        let lookup = |owner: &str, name: &str| -> Result<usize> {
            names.iter().position(|n| n == name).ok_or_else(|| {
                AbError::InvalidModel(format!("'{}' refers to unknown node '{}'", owner, name))
            })
        };

        let mut nodes = Vec::with_capacity(spec.nodes().len());
        let mut dim = 0;
        for node in spec.nodes() {
            let compiled = match node {
                Node::Free { prior, .. } => {
                    dim += 1;
                    CompiledNode::Free {
                        prior: *prior,
                        transform: prior.transform(),
                        coord: dim - 1,
                    }
                }
                Node::Deterministic { name, expr } => {
                    let (a, b) = expr.operands();
                    let (a, b) = (lookup(name, a)?, lookup(name, b)?);
                    match expr {
                        Expr::Ratio(..) => CompiledNode::Ratio(a, b),
                        Expr::Product(..) => CompiledNode::Product(a, b),
                        Expr::Difference(..) => CompiledNode::Difference(a, b),
                    }
                }
            };
            nodes.push(compiled);
        }

        let mut likelihoods = Vec::with_capacity(spec.likelihoods().len());
        for likelihood in spec.likelihoods() {
            let compiled = match likelihood {
                Likelihood::Binomial {
                    name,
                    trials,
                    successes,
                    p,
                } => {
                    let (n, k) = (*trials as f64, *successes as f64);
                    CompiledLikelihood::Binomial {
                        trials: n,
                        successes: k,
                        ln_choose: ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0),
                        p: lookup(name, p)?,
                    }
                }
                Likelihood::Gamma {
                    name,
                    observed,
                    shape,
                    rate,
                } => CompiledLikelihood::Gamma {
                    n: observed.len() as f64,
                    sum_x: observed.iter().sum(),
                    sum_ln_x: observed.iter().map(|x| x.ln()).sum(),
                    shape: lookup(name, shape)?,
                    rate: lookup(name, rate)?,
                },
            };
            likelihoods.push(compiled);
        }

        Ok(Self {
            names,
            nodes,
            likelihoods,
            dim,
        })
    }

    /// Node names in declaration order; also the order of [`Self::constrain`].
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Names of the free nodes, in coordinate order.
    pub fn free_names(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .zip(&self.names)
            .filter(|(node, _)| matches!(node, CompiledNode::Free { .. }))
            .map(|(_, name)| name.as_str())
            .collect()
    }

    fn forward(&self, position: &[f64], values: &mut [f64]) {
        for (i, node) in self.nodes.iter().enumerate() {
            values[i] = match *node {
                CompiledNode::Free {
                    transform, coord, ..
                } => transform.constrain(position[coord]),
                CompiledNode::Ratio(a, b) => values[a] / values[b],
                CompiledNode::Product(a, b) => values[a] * values[b],
                CompiledNode::Difference(a, b) => values[a] - values[b],
            };
        }
    }

    /// Values of every node (free and deterministic) at `position`.
    pub fn constrain(&self, position: &[f64]) -> Vec<f64> {
        let mut values = vec![0.0; self.nodes.len()];
        self.forward(position, &mut values);
        values
    }

    /// Unconstrained position for the given free-node values.
    pub fn unconstrain(&self, free_values: &[(&str, f64)]) -> Result<Vec<f64>> {
        let mut position = vec![f64::NAN; self.dim];
        for &(name, value) in free_values {
            let idx = self
                .index_of(name)
                .ok_or_else(|| AbError::InvalidModel(format!("unknown node '{}'", name)))?;
            match self.nodes[idx] {
                CompiledNode::Free {
                    transform, coord, ..
                } => position[coord] = transform.unconstrain(value),
                _ => {
                    return Err(AbError::InvalidModel(format!(
                        "'{}' is deterministic and has no coordinate",
                        name
                    )));
                }
            }
        }
        if position.iter().any(|u| !u.is_finite()) {
            return Err(AbError::InvalidModel(
                "every free node needs a value inside its support".to_string(),
            ));
        }
        Ok(position)
    }

    pub fn logp(&self, position: &[f64]) -> f64 {
        let mut grad = vec![0.0; self.dim];
        self.logp_and_grad(position, &mut grad)
    }
}

impl LogDensity for CompiledModel {
    fn dim(&self) -> usize {
        self.dim
    }

    fn logp_and_grad(&self, position: &[f64], grad: &mut [f64]) -> f64 {
        let mut values = vec![0.0; self.nodes.len()];
        self.forward(position, &mut values);

        let mut logp = 0.0;
        let mut adj = vec![0.0; self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            if let CompiledNode::Free {
                prior,
                transform,
                coord,
            } = node
            {
                logp += prior.ln_pdf(values[i]) + transform.ln_jacobian(position[*coord]);
                adj[i] += prior.d_ln_pdf(values[i]);
            }
        }
        for likelihood in &self.likelihoods {
            logp += likelihood.ln_likelihood(&values);
            likelihood.accumulate_grad(&values, &mut adj);
        }

        // Reverse pass: every node is visited after all nodes that depend on it.
        for i in (0..self.nodes.len()).rev() {
            let g = adj[i];
            match self.nodes[i] {
                CompiledNode::Free {
                    transform, coord, ..
                } => {
                    grad[coord] = g * transform.dx_du(values[i]) + transform.d_ln_jacobian(values[i]);
                }
                CompiledNode::Ratio(a, b) => {
                    adj[a] += g / values[b];
                    adj[b] -= g * values[a] / (values[b] * values[b]);
                }
                CompiledNode::Product(a, b) => {
                    adj[a] += g * values[b];
                    adj[b] += g * values[a];
                }
                CompiledNode::Difference(a, b) => {
                    adj[a] += g;
                    adj[b] -= g;
                }
            }
        }
        logp
    }
}
