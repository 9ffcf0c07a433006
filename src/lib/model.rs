//! Declarative description of a probabilistic model.
//!
//! A [`ModelSpec`] is an ordered list of named nodes (free parameters with a
//! prior, or deterministic functions of earlier nodes) plus the likelihood
//! terms that tie nodes to observed data. It carries no numerics of its own:
//! [`ModelSpec::compile`] validates it and hands back a
//! [`CompiledModel`](crate::density::CompiledModel) the sampler can evaluate.

use crate::density::CompiledModel;
use crate::error::{AbError, Result};
use crate::table::ArmData;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

/// Names recorded in the posterior trace of the A/B model, in trace order.
pub const TRACE_VARIABLES: [&str; 12] = [
    "p_control",
    "p_variant",
    "mu_control",
    "mu_variant",
    "alpha",
    "beta_control",
    "beta_variant",
    "cvr_lift",
    "arpc_lift",
    "arpu_control",
    "arpu_variant",
    "arpu_lift",
];

/// Prior distribution of a free parameter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Beta { alpha: f64, beta: f64 },
    HalfNormal { sigma: f64 },
}

impl Prior {
    /// Map from the unconstrained real line onto the prior's support.
    pub fn transform(&self) -> Transform {
        match self {
            Prior::Beta { .. } => Transform::Logit,
            Prior::HalfNormal { .. } => Transform::Log,
        }
    }

    pub fn mean(&self) -> f64 {
        match *self {
            Prior::Beta { alpha, beta } => alpha / (alpha + beta),
            Prior::HalfNormal { sigma } => sigma * (2.0 / PI).sqrt(),
        }
    }

    pub fn ln_pdf(&self, x: f64) -> f64 {
        match *self {
            Prior::Beta { alpha, beta } => {
                if !(0.0..=1.0).contains(&x) {
                    return f64::NEG_INFINITY;
                }
                let log_beta = ln_gamma(alpha) + ln_gamma(beta) - ln_gamma(alpha + beta);
                xlogy(alpha - 1.0, x) + xlogy(beta - 1.0, 1.0 - x) - log_beta
            }
            Prior::HalfNormal { sigma } => {
                if x < 0.0 {
                    return f64::NEG_INFINITY;
                }
                0.5 * (2.0 / PI).ln() - sigma.ln() - x * x / (2.0 * sigma * sigma)
            }
        }
    }

    /// Derivative of `ln_pdf` with respect to `x`.
    pub fn d_ln_pdf(&self, x: f64) -> f64 {
        match *self {
            Prior::Beta { alpha, beta } => {
                let mut d = 0.0;
                if alpha != 1.0 {
                    d += (alpha - 1.0) / x;
                }
                if beta != 1.0 {
                    d -= (beta - 1.0) / (1.0 - x);
                }
                d
            }
            Prior::HalfNormal { sigma } => -x / (sigma * sigma),
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        let ok = match *self {
            Prior::Beta { alpha, beta } => {
                alpha.is_finite() && beta.is_finite() && alpha > 0.0 && beta > 0.0
            }
            Prior::HalfNormal { sigma } => sigma.is_finite() && sigma > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(AbError::InvalidModel(format!(
                "prior of '{}' has invalid parameters: {:?}",
                name, self
            )))
        }
    }
}

/// `a * ln(b)` with the convention `0 * ln(0) = 0`.
pub(crate) fn xlogy(a: f64, b: f64) -> f64 {
    if a == 0.0 { 0.0 } else { a * b.ln() }
}

/// `ln(1 + e^z)` without overflow.
fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// Bijection between the real line and a constrained support.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    /// (0, 1) via the logistic function.
    Logit,
    /// (0, ∞) via the exponential.
    Log,
}

impl Transform {
    pub fn constrain(&self, u: f64) -> f64 {
        match self {
            Transform::Logit => {
                if u >= 0.0 {
                    1.0 / (1.0 + (-u).exp())
                } else {
                    let e = u.exp();
                    e / (1.0 + e)
                }
            }
            Transform::Log => u.exp(),
        }
    }

    pub fn unconstrain(&self, x: f64) -> f64 {
        match self {
            Transform::Logit => (x / (1.0 - x)).ln(),
            Transform::Log => x.ln(),
        }
    }

    /// `ln |dx/du|` evaluated at `u`.
    pub fn ln_jacobian(&self, u: f64) -> f64 {
        match self {
            Transform::Logit => -softplus(-u) - softplus(u),
            Transform::Log => u,
        }
    }

    /// `dx/du` expressed through the constrained value `x`.
    pub fn dx_du(&self, x: f64) -> f64 {
        match self {
            Transform::Logit => x * (1.0 - x),
            Transform::Log => x,
        }
    }

    /// `d ln|dx/du| / du` expressed through the constrained value `x`.
    pub fn d_ln_jacobian(&self, x: f64) -> f64 {
        match self {
            Transform::Logit => 1.0 - 2.0 * x,
            Transform::Log => 1.0,
        }
    }
}

/// Deterministic function of two earlier nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Ratio(String, String),
    Product(String, String),
    Difference(String, String),
}

impl Expr {
    pub fn ratio(a: &str, b: &str) -> Self {
        Expr::Ratio(a.to_string(), b.to_string())
    }

    pub fn product(a: &str, b: &str) -> Self {
        Expr::Product(a.to_string(), b.to_string())
    }

    pub fn difference(a: &str, b: &str) -> Self {
        Expr::Difference(a.to_string(), b.to_string())
    }

    pub fn operands(&self) -> (&str, &str) {
        match self {
            Expr::Ratio(a, b) | Expr::Product(a, b) | Expr::Difference(a, b) => (a, b),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Free { name: String, prior: Prior },
    Deterministic { name: String, expr: Expr },
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Free { name, .. } | Node::Deterministic { name, .. } => name,
        }
    }
}

/// Observed data attached to nodes of the model.
#[derive(Clone, Debug, PartialEq)]
pub enum Likelihood {
    /// `successes ~ Binomial(trials, p)`.
    Binomial {
        name: String,
        trials: u64,
        successes: u64,
        p: String,
    },
    /// Every value of `observed ~ Gamma(shape, rate)`.
    Gamma {
        name: String,
        observed: Vec<f64>,
        shape: String,
        rate: String,
    },
}

impl Likelihood {
    pub fn name(&self) -> &str {
        match self {
            Likelihood::Binomial { name, .. } | Likelihood::Gamma { name, .. } => name,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Likelihood::Binomial {
                name,
                trials,
                successes,
                ..
            } => {
                if successes > trials {
                    return Err(AbError::InvalidModel(format!(
                        "'{}': {} successes out of {} trials",
                        name, successes, trials
                    )));
                }
            }
            Likelihood::Gamma { name, observed, .. } => {
                if let Some(bad) = observed.iter().find(|x| !x.is_finite() || **x <= 0.0) {
                    return Err(AbError::InvalidModel(format!(
                        "'{}': Gamma observations must be finite and strictly positive, got {}",
                        name, bad
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ordered model description: nodes first, then likelihood terms.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelSpec {
    nodes: Vec<Node>,
    likelihoods: Vec<Likelihood>,
}

impl ModelSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free(mut self, name: &str, prior: Prior) -> Self {
        self.nodes.push(Node::Free {
            name: name.to_string(),
            prior,
        });
        self
    }

    pub fn deterministic(mut self, name: &str, expr: Expr) -> Self {
        self.nodes.push(Node::Deterministic {
            name: name.to_string(),
            expr,
        });
        self
    }

    pub fn observe(mut self, likelihood: Likelihood) -> Self {
        self.likelihoods.push(likelihood);
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn likelihoods(&self) -> &[Likelihood] {
        &self.likelihoods
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(Node::name).collect()
    }

    /// Check names, references, prior parameters and observed data, then
    /// resolve everything to indices.
    pub fn compile(&self) -> Result<CompiledModel> {
        for (i, node) in self.nodes.iter().enumerate() {
            let name = node.name();
            if name.is_empty() {
                return Err(AbError::InvalidModel(format!("node {} has an empty name", i)));
            }
            if self.nodes[..i].iter().any(|n| n.name() == name) {
                return Err(AbError::InvalidModel(format!("duplicate node '{}'", name)));
            }
            match node {
                Node::Free { prior, .. } => prior.validate(name)?,
                Node::Deterministic { expr, .. } => {
                    let (a, b) = expr.operands();
                    for operand in [a, b] {
                        if !self.nodes[..i].iter().any(|n| n.name() == operand) {
                            return Err(AbError::InvalidModel(format!(
                                "'{}' depends on '{}', which is not declared before it",
                                name, operand
                            )));
                        }
                    }
                }
            }
        }
        if !self.nodes.iter().any(|n| matches!(n, Node::Free { .. })) {
            return Err(AbError::InvalidModel("model has no free parameters".to_string()));
        }
        for (i, likelihood) in self.likelihoods.iter().enumerate() {
            let name = likelihood.name();
            if self.nodes.iter().any(|n| n.name() == name)
                || self.likelihoods[..i].iter().any(|l| l.name() == name)
            {
                return Err(AbError::InvalidModel(format!("duplicate name '{}'", name)));
            }
            likelihood.validate()?;
        }
        CompiledModel::from_spec(self)
    }
}

/// Priors of the A/B model; swap any of them without touching the sampler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbPriors {
    /// Prior of `p_control` and `p_variant`.
    pub conversion: Prior,
    /// Prior of `mu_control` and `mu_variant`.
    pub revenue_mean: Prior,
    /// Prior of the shared Gamma shape `alpha`.
    pub revenue_shape: Prior,
}

impl Default for AbPriors {
    fn default() -> Self {
        Self {
            conversion: Prior::Beta {
                alpha: 1.0,
                beta: 1.0,
            },
            revenue_mean: Prior::HalfNormal { sigma: 1.0 },
            revenue_shape: Prior::HalfNormal { sigma: 1.0 },
        }
    }
}

/// Joint conversion / revenue model over both arms with default priors.
pub fn ab_test_model(control: &ArmData, variant: &ArmData) -> ModelSpec {
    ab_test_model_with_priors(control, variant, &AbPriors::default())
}

/// Conversions are Binomial in `p_arm`; revenue of converting users is
/// Gamma with a shape `alpha` shared by both arms and rate `alpha / mu_arm`,
/// so `mu_arm` is the mean revenue of a converting user.
pub fn ab_test_model_with_priors(control: &ArmData, variant: &ArmData, priors: &AbPriors) -> ModelSpec {
    let binomial = |name: &str, data: &ArmData, p: &str| Likelihood::Binomial {
        name: name.to_string(),
        trials: data.n_users,
        successes: data.n_converted,
        p: p.to_string(),
    };
    let gamma = |name: &str, data: &ArmData, rate: &str| Likelihood::Gamma {
        name: name.to_string(),
        observed: data.revenue.clone(),
        shape: "alpha".to_string(),
        rate: rate.to_string(),
    };

    ModelSpec::new()
        .free("p_control", priors.conversion)
        .free("p_variant", priors.conversion)
        .free("mu_control", priors.revenue_mean)
        .free("mu_variant", priors.revenue_mean)
        .free("alpha", priors.revenue_shape)
        .deterministic("beta_control", Expr::ratio("alpha", "mu_control"))
        .deterministic("beta_variant", Expr::ratio("alpha", "mu_variant"))
        .deterministic("cvr_lift", Expr::difference("p_variant", "p_control"))
        .deterministic("arpc_lift", Expr::difference("mu_variant", "mu_control"))
        .deterministic("arpu_control", Expr::product("p_control", "mu_control"))
        .deterministic("arpu_variant", Expr::product("p_variant", "mu_variant"))
        .deterministic("arpu_lift", Expr::difference("arpu_variant", "arpu_control"))
        .observe(binomial("y_control", control, "p_control"))
        .observe(binomial("y_variant", variant, "p_variant"))
        .observe(gamma("revenue_control", control, "beta_control"))
        .observe(gamma("revenue_variant", variant, "beta_variant"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Arm;
    use statrs::distribution::{Beta, Continuous, Normal};

    fn arm(arm: Arm, n_users: u64, revenue: Vec<f64>) -> ArmData {
        ArmData {
            arm,
            n_users,
            n_converted: revenue.len() as u64,
            revenue,
        }
    }

    #[test]
    fn test_beta_prior_matches_statrs() {
        let prior = Prior::Beta {
            alpha: 2.5,
            beta: 4.0,
        };
        let reference = Beta::new(2.5, 4.0).unwrap();
        for x in [0.05, 0.3, 0.5, 0.9] {
            assert!((prior.ln_pdf(x) - reference.ln_pdf(x)).abs() < 1e-10);
        }
        let uniform = Prior::Beta {
            alpha: 1.0,
            beta: 1.0,
        };
        assert!(uniform.ln_pdf(0.0).abs() < 1e-12);
        assert_eq!(uniform.d_ln_pdf(0.3), 0.0);
    }

    #[test]
    fn test_half_normal_prior_matches_statrs() {
        let prior = Prior::HalfNormal { sigma: 1.5 };
        let normal = Normal::new(0.0, 1.5).unwrap();
        for x in [0.0, 0.1, 1.0, 4.0] {
            let expected = normal.ln_pdf(x) + 2f64.ln();
            assert!((prior.ln_pdf(x) - expected).abs() < 1e-10);
        }
        assert_eq!(prior.ln_pdf(-0.1), f64::NEG_INFINITY);
        assert!((prior.mean() - 1.5 * (2.0 / PI).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_transforms_round_trip() {
        for u in [-30.0, -2.0, 0.0, 0.7, 25.0] {
            let p = Transform::Logit.constrain(u);
            assert!(p > 0.0 && p < 1.0);
            if u.abs() < 20.0 {
                assert!((Transform::Logit.unconstrain(p) - u).abs() < 1e-9);
            }
            let x = Transform::Log.constrain(u);
            assert!((Transform::Log.unconstrain(x) - u).abs() < 1e-12);
        }
        let u: f64 = 0.4;
        let p = Transform::Logit.constrain(u);
        assert!((Transform::Logit.ln_jacobian(u) - (p * (1.0 - p)).ln()).abs() < 1e-12);
        assert!(Transform::Logit.ln_jacobian(-800.0).is_finite());
    }

    #[test]
    fn test_ab_model_declares_trace_variables() {
        let control = arm(Arm::Control, 10, vec![1.0, 2.0]);
        let variant = arm(Arm::Variant, 12, vec![3.0]);
        let spec = ab_test_model(&control, &variant);
        assert_eq!(spec.node_names(), TRACE_VARIABLES.to_vec());
        assert_eq!(spec.likelihoods().len(), 4);
        assert!(spec.compile().is_ok());
    }

    #[test]
    fn test_compile_rejects_undeclared_dependency() {
        let spec = ModelSpec::new()
            .free("a", Prior::HalfNormal { sigma: 1.0 })
            .deterministic("c", Expr::product("a", "b"));
        assert!(matches!(spec.compile(), Err(AbError::InvalidModel(_))));
    }

    #[test]
    fn test_compile_rejects_duplicates() {
        let spec = ModelSpec::new()
            .free("a", Prior::HalfNormal { sigma: 1.0 })
            .free("a", Prior::HalfNormal { sigma: 2.0 });
        assert!(matches!(spec.compile(), Err(AbError::InvalidModel(_))));

        let spec = ModelSpec::new()
            .free("p", Prior::Beta { alpha: 1.0, beta: 1.0 })
            .observe(Likelihood::Binomial {
                name: "p".to_string(),
                trials: 3,
                successes: 1,
                p: "p".to_string(),
            });
        assert!(matches!(spec.compile(), Err(AbError::InvalidModel(_))));
    }

    #[test]
    fn test_compile_rejects_bad_prior() {
        let spec = ModelSpec::new().free("a", Prior::HalfNormal { sigma: 0.0 });
        assert!(matches!(spec.compile(), Err(AbError::InvalidModel(_))));
        let spec = ModelSpec::new().free("p", Prior::Beta { alpha: -1.0, beta: 1.0 });
        assert!(matches!(spec.compile(), Err(AbError::InvalidModel(_))));
    }

    #[test]
    fn test_compile_rejects_non_positive_revenue() {
        let control = arm(Arm::Control, 10, vec![1.0, 0.0]);
        let variant = arm(Arm::Variant, 12, vec![3.0]);
        let err = ab_test_model(&control, &variant).compile().unwrap_err();
        match err {
            AbError::InvalidModel(msg) => assert!(msg.contains("revenue_control"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_compile_rejects_too_many_successes() {
        let mut control = arm(Arm::Control, 1, vec![1.0, 2.0]);
        control.n_converted = 2;
        let variant = arm(Arm::Variant, 12, vec![3.0]);
        assert!(matches!(
            ab_test_model(&control, &variant).compile(),
            Err(AbError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_empty_revenue_arm_compiles() {
        let control = arm(Arm::Control, 50, vec![]);
        let variant = arm(Arm::Variant, 50, vec![4.0]);
        assert!(ab_test_model(&control, &variant).compile().is_ok());
    }
}
