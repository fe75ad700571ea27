//! Covariance-kernel expression trees.
//!
//! A [`Kernel`] mirrors the kernel configuration found on a fitted
//! Gaussian-process estimator: a closed set of leaf kernels combined by sum
//! and product nodes to arbitrary depth. The tree is immutable input to the
//! compiler; leaves carry only scalar or small fixed-shape parameters, never
//! tensors.

use serde::{Deserialize, Serialize};

/// Length-scale parameter of the stationary kernels.
///
/// RBF and Matérn accept an anisotropic per-feature scale; the other kernels
/// require a scalar and reject `PerFeature` at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LengthScale {
    Scalar(f64),
    PerFeature(Vec<f64>),
}

impl LengthScale {
    /// Returns the scalar value, if this is a scalar scale.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            LengthScale::Scalar(value) => Some(*value),
            LengthScale::PerFeature(_) => None,
        }
    }

    /// Flattens to the per-feature divisor values used to scale inputs.
    pub fn values(&self) -> Vec<f64> {
        match self {
            LengthScale::Scalar(value) => vec![*value],
            LengthScale::PerFeature(values) => values.clone(),
        }
    }
}

impl From<f64> for LengthScale {
    fn from(value: f64) -> Self {
        LengthScale::Scalar(value)
    }
}

impl From<Vec<f64>> for LengthScale {
    fn from(values: Vec<f64>) -> Self {
        LengthScale::PerFeature(values)
    }
}

/// Covariance-kernel expression, closed under sum and product composition.
///
/// Dispatch is by exact variant: a kernel that is structurally similar to
/// another never borrows its formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Kernel {
    Sum(Box<Kernel>, Box<Kernel>),
    Product(Box<Kernel>, Box<Kernel>),
    Constant {
        constant_value: f64,
    },
    Rbf {
        length_scale: LengthScale,
    },
    Matern {
        length_scale: LengthScale,
        nu: f64,
    },
    RationalQuadratic {
        length_scale: LengthScale,
        alpha: f64,
    },
    ExpSineSquared {
        length_scale: LengthScale,
        periodicity: f64,
    },
    DotProduct {
        sigma_0: f64,
    },
    /// Generic pairwise-metric kernel. The metric arrives as a free-form
    /// string from the fitted estimator's configuration; only `"cosine"`
    /// currently compiles.
    Pairwise {
        metric: String,
        gamma: Option<f64>,
    },
    White {
        noise_level: f64,
    },
}

impl Kernel {
    pub fn sum(k1: Kernel, k2: Kernel) -> Self {
        Kernel::Sum(Box::new(k1), Box::new(k2))
    }

    pub fn product(k1: Kernel, k2: Kernel) -> Self {
        Kernel::Product(Box::new(k1), Box::new(k2))
    }

    pub fn rbf(length_scale: impl Into<LengthScale>) -> Self {
        Kernel::Rbf {
            length_scale: length_scale.into(),
        }
    }

    pub fn matern(length_scale: impl Into<LengthScale>, nu: f64) -> Self {
        Kernel::Matern {
            length_scale: length_scale.into(),
            nu,
        }
    }

    /// Human-readable variant name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Sum(..) => "Sum",
            Kernel::Product(..) => "Product",
            Kernel::Constant { .. } => "Constant",
            Kernel::Rbf { .. } => "RBF",
            Kernel::Matern { .. } => "Matern",
            Kernel::RationalQuadratic { .. } => "RationalQuadratic",
            Kernel::ExpSineSquared { .. } => "ExpSineSquared",
            Kernel::DotProduct { .. } => "DotProduct",
            Kernel::Pairwise { .. } => "Pairwise",
            Kernel::White { .. } => "White",
        }
    }
}
