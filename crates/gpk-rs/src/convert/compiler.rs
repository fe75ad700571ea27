//! Recursive kernel-to-graph compilation.
//!
//! The dispatcher walks the kernel expression tree, recursing through sum and
//! product nodes and handing each leaf to its formula compiler. Formula
//! compilers receive resolved scalar parameters and already-compiled operand
//! subgraphs; they never recurse themselves. Everything numeric passes
//! through the constant materializer so one compilation carries exactly one
//! floating precision.

use crate::graph::spec::ReduceKind;
use crate::kernel::{Kernel, LengthScale};

use super::constants;
use super::distance::{self, DistanceMetric};
use super::emit::{EmitCtx, ValueRef};
use super::zeros::{zero_vector_of_size, CountAxis, ZeroShape};
use super::{CompileError, DistanceOptim, PointSet};

/// Stages a point set as a graph value: symbolic tensors resolve to their
/// registered id, host arrays materialize as constants in the configured
/// precision.
pub(crate) fn resolve(
    ctx: &mut EmitCtx<'_>,
    points: &PointSet,
) -> Result<ValueRef, CompileError> {
    match points {
        PointSet::Graph(id) => ctx.lookup(*id),
        PointSet::Host(array) => {
            let literal = constants::float_literal(
                ctx.dtype(),
                &[array.rows(), array.cols()],
                array.values(),
            )?;
            Ok(ctx.constant(literal))
        }
    }
}

/// Compiles the full kernel matrix `k(X, X_train)` (or `k(X, X)` when no
/// training set is supplied).
pub(crate) fn compile(
    ctx: &mut EmitCtx<'_>,
    kernel: &Kernel,
    x: &PointSet,
    x_train: Option<&PointSet>,
    optim: Option<DistanceOptim>,
) -> Result<ValueRef, CompileError> {
    match kernel {
        Kernel::Sum(k1, k2) => {
            let lhs = compile(ctx, k1, x, x_train, optim)?;
            let rhs = compile(ctx, k2, x, x_train, optim)?;
            ctx.add(&lhs, &rhs)
        }
        Kernel::Product(k1, k2) => {
            let lhs = compile(ctx, k1, x, x_train, optim)?;
            let rhs = compile(ctx, k2, x, x_train, optim)?;
            ctx.mul(&lhs, &rhs)
        }
        Kernel::Constant { constant_value } => {
            let mat = zero_outer_product(ctx, x, x_train)?;
            let value = ctx.scalar(*constant_value)?;
            ctx.add(&mat, &value)
        }
        Kernel::Rbf { length_scale } => {
            stationary(ctx, x, x_train, optim, length_scale, StationaryKind::Rbf)
        }
        Kernel::Matern { length_scale, nu } => stationary(
            ctx,
            x,
            x_train,
            optim,
            length_scale,
            StationaryKind::Matern(*nu),
        ),
        Kernel::RationalQuadratic {
            length_scale,
            alpha,
        } => rational_quadratic(ctx, x, x_train, optim, length_scale, *alpha),
        Kernel::ExpSineSquared {
            length_scale,
            periodicity,
        } => exp_sine_squared(ctx, x, x_train, optim, length_scale, *periodicity),
        Kernel::DotProduct { sigma_0 } => dot_product(ctx, x, x_train, *sigma_0),
        Kernel::Pairwise { metric, .. } => pairwise_kernel(ctx, x, x_train, metric),
        Kernel::White { noise_level } => white(ctx, x, x_train, *noise_level),
    }
}

/// Compiles only the diagonal of `k(X, X)`.
///
/// Every stationary kernel above has unit self-similarity, so the diagonal
/// reduces to a shape-adaptive vector of ones; DotProduct needs row norms but
/// no matrix product. Remaining variants have no cheap closed form and fail.
pub(crate) fn compile_diag(
    ctx: &mut EmitCtx<'_>,
    kernel: &Kernel,
    x: &PointSet,
) -> Result<ValueRef, CompileError> {
    match kernel {
        Kernel::Sum(k1, k2) => {
            let lhs = compile_diag(ctx, k1, x)?;
            let rhs = compile_diag(ctx, k2, x)?;
            ctx.add(&lhs, &rhs)
        }
        Kernel::Product(k1, k2) => {
            let lhs = compile_diag(ctx, k1, x)?;
            let rhs = compile_diag(ctx, k2, x)?;
            ctx.mul(&lhs, &rhs)
        }
        Kernel::Constant { constant_value } => {
            let x_ref = resolve(ctx, x)?;
            let zeros = zero_vector_of_size(ctx, &x_ref, CountAxis::Rows, ZeroShape::Flat)?;
            let value = ctx.scalar(*constant_value)?;
            ctx.add(&zeros, &value)
        }
        Kernel::Rbf { .. }
        | Kernel::Matern { .. }
        | Kernel::RationalQuadratic { .. }
        | Kernel::ExpSineSquared { .. } => {
            let x_ref = resolve(ctx, x)?;
            let zeros = zero_vector_of_size(ctx, &x_ref, CountAxis::Rows, ZeroShape::Flat)?;
            let one = ctx.scalar(1.0)?;
            ctx.add(&zeros, &one)
        }
        Kernel::DotProduct { sigma_0 } => {
            let x_ref = resolve(ctx, x)?;
            let sq_norms = ctx.reduce(ReduceKind::SumSquare, &x_ref, &[1], false)?;
            let sigma = ctx.scalar(sigma_0 * sigma_0)?;
            ctx.add(&sq_norms, &sigma)
        }
        other => Err(CompileError::Unsupported {
            kernel: other.name(),
            detail: "diagonal compilation is not implemented for this kernel".to_string(),
        }),
    }
}

#[derive(Clone, Copy)]
enum StationaryKind {
    Rbf,
    Matern(f64),
}

/// RBF and Matérn share their distance plumbing: inputs are divided by the
/// (possibly per-feature) length scale, then the pairwise distance feeds the
/// kernel-specific closed form.
fn stationary(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    optim: Option<DistanceOptim>,
    length_scale: &LengthScale,
    kind: StationaryKind,
) -> Result<ValueRef, CompileError> {
    let metric = match kind {
        StationaryKind::Rbf => DistanceMetric::SqEuclidean,
        StationaryKind::Matern(_) => DistanceMetric::Euclidean,
    };

    let scale_values = length_scale.values();
    let scale_literal =
        constants::float_literal(ctx.dtype(), &[scale_values.len()], &scale_values)?;
    let scale = ctx.constant(scale_literal);

    let x_ref = resolve(ctx, x)?;
    let x_scaled = ctx.div(&x_ref, &scale)?;
    let dist = match x_train {
        None => distance::self_pairwise(ctx, &x_scaled, metric)?,
        Some(train) => {
            let train_ref = resolve(ctx, train)?;
            let train_scaled = ctx.div(&train_ref, &scale)?;
            distance::pairwise(ctx, &x_scaled, &train_scaled, metric, optim)?
        }
    };

    match kind {
        StationaryKind::Rbf => {
            // exp(-0.5 * d²)
            let half = ctx.scalar(0.5)?;
            let scaled = ctx.mul(&dist, &half)?;
            let negated = ctx.neg(&scaled);
            Ok(ctx.exp(&negated))
        }
        StationaryKind::Matern(nu) if nu == 0.5 => {
            // exp(-d)
            let negated = ctx.neg(&dist);
            Ok(ctx.exp(&negated))
        }
        StationaryKind::Matern(nu) if nu == 1.5 => {
            // K = d·√3; (1 + K)·exp(-K)
            let sqrt3 = ctx.scalar(3f64.sqrt())?;
            let k = ctx.mul(&dist, &sqrt3)?;
            let neg_k = ctx.neg(&k);
            let exp_k = ctx.exp(&neg_k);
            let one = ctx.scalar(1.0)?;
            let k_plus_one = ctx.add(&k, &one)?;
            ctx.mul(&k_plus_one, &exp_k)
        }
        StationaryKind::Matern(nu) if nu == 2.5 => {
            // K = d·√5; (1 + K + K²/3)·exp(-K)
            let sqrt5 = ctx.scalar(5f64.sqrt())?;
            let k = ctx.mul(&dist, &sqrt5)?;
            let neg_k = ctx.neg(&k);
            let exp_k = ctx.exp(&neg_k);
            let one = ctx.scalar(1.0)?;
            let three = ctx.scalar(3.0)?;
            let k_plus_one = ctx.add(&k, &one)?;
            let k_squared = ctx.mul(&k, &k)?;
            let k_squared_third = ctx.div(&k_squared, &three)?;
            let poly = ctx.add(&k_plus_one, &k_squared_third)?;
            ctx.mul(&poly, &exp_k)
        }
        StationaryKind::Matern(nu) if nu.is_infinite() && nu.is_sign_positive() => {
            // exp(-d²/2), the RBF limit
            let squared = ctx.mul(&dist, &dist)?;
            let two = ctx.scalar(2.0)?;
            let halved = ctx.div(&squared, &two)?;
            let negated = ctx.neg(&halved);
            Ok(ctx.exp(&negated))
        }
        StationaryKind::Matern(nu) => Err(CompileError::Unsupported {
            kernel: "Matern",
            detail: format!("nu={nu} has no closed-form graph translation"),
        }),
    }
}

fn rational_quadratic(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    optim: Option<DistanceOptim>,
    length_scale: &LengthScale,
    alpha: f64,
) -> Result<ValueRef, CompileError> {
    let ls = scalar_length_scale("RationalQuadratic", length_scale)?;
    let x_ref = resolve(ctx, x)?;
    let dists = pairwise_against_train(ctx, &x_ref, x_train, DistanceMetric::SqEuclidean, optim)?;

    // (1 + d² / (2·α·ℓ²))^(-α)
    let denom = ctx.scalar(ls * ls * alpha * 2.0)?;
    let scaled = ctx.div(&dists, &denom)?;
    let one = ctx.scalar(1.0)?;
    let base = ctx.add(&scaled, &one)?;
    let neg_alpha = ctx.scalar(-alpha)?;
    ctx.pow(&base, &neg_alpha)
}

fn exp_sine_squared(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    optim: Option<DistanceOptim>,
    length_scale: &LengthScale,
    periodicity: f64,
) -> Result<ValueRef, CompileError> {
    let ls = scalar_length_scale("ExpSineSquared", length_scale)?;
    let x_ref = resolve(ctx, x)?;
    let dists = pairwise_against_train(ctx, &x_ref, x_train, DistanceMetric::Euclidean, optim)?;

    // exp(-2·(sin(π·d/p) / ℓ)²)
    let period = ctx.scalar(periodicity)?;
    let pi = ctx.scalar(std::f64::consts::PI)?;
    let by_period = ctx.div(&dists, &period)?;
    let arg = ctx.mul(&by_period, &pi)?;
    let sin_of_arg = ctx.sin(&arg);
    let ls_const = ctx.scalar(ls)?;
    let scaled_sin = ctx.div(&sin_of_arg, &ls_const)?;
    let two = ctx.scalar(2.0)?;
    let squared = ctx.pow(&scaled_sin, &two)?;
    let minus_two = ctx.scalar(-2.0)?;
    let exponent = ctx.mul(&squared, &minus_two)?;
    Ok(ctx.exp(&exponent))
}

fn dot_product(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    sigma_0: f64,
) -> Result<ValueRef, CompileError> {
    let x_ref = resolve(ctx, x)?;
    let train = x_train.unwrap_or(x);
    // A host training set is transposed on the host; a symbolic one needs a
    // transpose node.
    let train_t = match train {
        PointSet::Host(array) => {
            let literal = constants::float_literal(
                ctx.dtype(),
                &[array.cols(), array.rows()],
                &array.transposed_values(),
            )?;
            ctx.constant(literal)
        }
        PointSet::Graph(_) => {
            let train_ref = resolve(ctx, train)?;
            ctx.transpose2(&train_ref)?
        }
    };
    let cross = ctx.matmul(&x_ref, &train_t)?;
    let sigma = ctx.scalar(sigma_0 * sigma_0)?;
    ctx.add(&cross, &sigma)
}

fn pairwise_kernel(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    metric: &str,
) -> Result<ValueRef, CompileError> {
    if metric != "cosine" {
        return Err(CompileError::Unsupported {
            kernel: "Pairwise",
            detail: format!("metric `{metric}` is not implemented"),
        });
    }

    let train = x_train.unwrap_or(x);
    // Row-normalized transpose of the training set, folded on the host when
    // the points are known at compile time.
    let norm_train_t = match train {
        PointSet::Host(array) => {
            let normalized = array.l2_normalized_rows();
            let literal = constants::float_literal(
                ctx.dtype(),
                &[normalized.cols(), normalized.rows()],
                &normalized.transposed_values(),
            )?;
            ctx.constant(literal)
        }
        PointSet::Graph(_) => {
            let train_ref = resolve(ctx, train)?;
            let norms = ctx.reduce(ReduceKind::L2, &train_ref, &[1], true)?;
            let normalized = ctx.div(&train_ref, &norms)?;
            ctx.transpose2(&normalized)?
        }
    };

    let x_ref = resolve(ctx, x)?;
    let x_norms = ctx.reduce(ReduceKind::L2, &x_ref, &[1], true)?;
    let x_normalized = ctx.div(&x_ref, &x_norms)?;
    ctx.matmul(&x_normalized, &norm_train_t)
}

fn white(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
    noise_level: f64,
) -> Result<ValueRef, CompileError> {
    let mat = zero_outer_product(ctx, x, x_train)?;
    if x_train.is_some() {
        // Noise never correlates an evaluation point with a training point.
        return Ok(mat);
    }
    let eye = ctx.eye_like(&mat)?;
    let noise = ctx.scalar(noise_level)?;
    ctx.mul(&eye, &noise)
}

/// `[n_x, n_y]` zero matrix built purely from runtime row counts: the outer
/// product of two shape-adaptive zero columns.
fn zero_outer_product(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    x_train: Option<&PointSet>,
) -> Result<ValueRef, CompileError> {
    let x_ref = resolve(ctx, x)?;
    let zeros_x = zero_vector_of_size(ctx, &x_ref, CountAxis::Rows, ZeroShape::KeepSecondDim)?;
    let zeros_y = match x_train {
        None => zeros_x.clone(),
        Some(train) => {
            let train_ref = resolve(ctx, train)?;
            zero_vector_of_size(ctx, &train_ref, CountAxis::Rows, ZeroShape::KeepSecondDim)?
        }
    };
    let zeros_y_t = ctx.transpose2(&zeros_y)?;
    ctx.matmul(&zeros_x, &zeros_y_t)
}

/// Distance of `x` against the training set, or against itself when the
/// caller supplied no second point set.
fn pairwise_against_train(
    ctx: &mut EmitCtx<'_>,
    x_ref: &ValueRef,
    x_train: Option<&PointSet>,
    metric: DistanceMetric,
    optim: Option<DistanceOptim>,
) -> Result<ValueRef, CompileError> {
    match x_train {
        None => distance::pairwise(ctx, x_ref, x_ref, metric, optim),
        Some(train) => {
            let train_ref = resolve(ctx, train)?;
            distance::pairwise(ctx, x_ref, &train_ref, metric, optim)
        }
    }
}

fn scalar_length_scale(
    kernel: &'static str,
    length_scale: &LengthScale,
) -> Result<f64, CompileError> {
    length_scale
        .as_scalar()
        .ok_or_else(|| CompileError::Unsupported {
            kernel,
            detail: "length_scale must be a scalar, not per-feature".to_string(),
        })
}
