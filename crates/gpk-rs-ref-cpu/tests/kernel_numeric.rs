//! Numeric properties of compiled kernel graphs, checked end to end against
//! the reference evaluator.

use anyhow::Result;
use gpk_rs::graph::spec::{
    DType, Dimension, OpsetVersion, Program, ProgramBuilder, Shape, TensorSpec,
};
use gpk_rs::{
    compile_kernel, compile_kernel_diag, compile_pairwise_distance, CompileOptions,
    DistanceMetric, DistanceOptim, HostArray, Kernel, LengthScale, PointSet, LATEST_OPSET,
};
use gpk_rs_ref_cpu::{CpuTensor, ReferenceCpuBackend, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn options(dtype: DType) -> CompileOptions {
    CompileOptions::new(dtype, LATEST_OPSET)
}

fn symbolic_points(
    builder: &mut ProgramBuilder,
    dtype: DType,
    rows: &str,
    features: usize,
) -> PointSet {
    let spec = TensorSpec::new(
        dtype,
        Shape::new(vec![
            Dimension::symbolic(rows),
            Dimension::Static(features),
        ]),
    );
    PointSet::Graph(builder.add_parameter(spec))
}

/// Full kernel matrix program with one or two symbolic inputs.
fn full_program(
    kernel: &Kernel,
    dtype: DType,
    optim: Option<DistanceOptim>,
    features: usize,
    with_train: bool,
) -> Result<Program> {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, dtype, "n_x", features);
    let train = with_train.then(|| symbolic_points(&mut builder, dtype, "n_train", features));
    let mut options = options(dtype);
    options.optim = optim;
    let root = compile_kernel(&mut builder, kernel, &x, train.as_ref(), &options, Some("kernel"))?;
    let function = builder.finish("main", vec![root]);
    Ok(Program::new("main").with_functions(vec![function]))
}

/// Full kernel matrix program with a compile-time-known training set.
fn full_program_host_train(
    kernel: &Kernel,
    dtype: DType,
    train: HostArray,
    features: usize,
) -> Result<Program> {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, dtype, "n_x", features);
    let train = PointSet::Host(train);
    let root = compile_kernel(
        &mut builder,
        kernel,
        &x,
        Some(&train),
        &options(dtype),
        Some("kernel"),
    )?;
    let function = builder.finish("main", vec![root]);
    Ok(Program::new("main").with_functions(vec![function]))
}

fn diag_program(kernel: &Kernel, dtype: DType, features: usize) -> Result<Program> {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, dtype, "n_x", features);
    let root = compile_kernel_diag(&mut builder, kernel, &x, &options(dtype), Some("diag"))?;
    let function = builder.finish("main", vec![root]);
    Ok(Program::new("main").with_functions(vec![function]))
}

fn distance_program(
    metric: DistanceMetric,
    optim: Option<DistanceOptim>,
    features: usize,
) -> Result<Program> {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, DType::F64, "n_x", features);
    let y = symbolic_points(&mut builder, DType::F64, "n_y", features);
    let mut options = options(DType::F64);
    options.optim = optim;
    let root = compile_pairwise_distance(&mut builder, &x, &y, metric, &options)?;
    let function = builder.finish("main", vec![root]);
    Ok(Program::new("main").with_functions(vec![function]))
}

fn run(program: &Program, inputs: &[CpuTensor]) -> (Vec<usize>, Vec<f64>) {
    let outputs = ReferenceCpuBackend::new()
        .run_program(program, inputs)
        .expect("program evaluates");
    let output = &outputs[0];
    (
        output.dims.clone(),
        output.to_f64_vec().expect("float output"),
    )
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<f64> {
    (0..rows * cols).map(|_| rng.gen_range(-2.0..2.0)).collect()
}

fn assert_close(expected: &[f64], actual: &[f64], tolerance: f64) {
    assert_eq!(expected.len(), actual.len(), "length mismatch");
    for (index, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        let scale = e.abs().max(a.abs()).max(1.0);
        assert!(
            (e - a).abs() <= tolerance * scale,
            "mismatch at {index}: expected {e}, got {a}"
        );
    }
}

#[test]
fn rbf_matches_the_closed_form_on_concrete_points() -> Result<()> {
    let program = full_program(&Kernel::rbf(1.0), DType::F64, None, 1, false)?;
    let x = CpuTensor::from_f64s(&[3, 1], &[0.0, 1.0, 2.0]);
    let (dims, values) = run(&program, &[x]);

    assert_eq!(dims, vec![3, 3]);
    let e05 = (-0.5f64).exp();
    let e2 = (-2.0f64).exp();
    let expected = [1.0, e05, e2, e05, 1.0, e05, e2, e05, 1.0];
    assert_close(&expected, &values, 1e-12);
    Ok(())
}

#[test]
fn diagonal_compilation_equals_the_full_matrix_diagonal() -> Result<()> {
    let kernels = vec![
        Kernel::Constant { constant_value: 1.7 },
        Kernel::rbf(1.2),
        Kernel::matern(0.9, 0.5),
        Kernel::matern(1.1, 1.5),
        Kernel::matern(1.3, 2.5),
        Kernel::matern(0.8, f64::INFINITY),
        Kernel::RationalQuadratic {
            length_scale: LengthScale::Scalar(1.3),
            alpha: 0.7,
        },
        Kernel::ExpSineSquared {
            length_scale: LengthScale::Scalar(1.1),
            periodicity: 1.4,
        },
        Kernel::DotProduct { sigma_0: 0.4 },
        Kernel::sum(Kernel::rbf(1.0), Kernel::Constant { constant_value: 0.3 }),
        Kernel::product(
            Kernel::rbf(1.0),
            Kernel::RationalQuadratic {
                length_scale: LengthScale::Scalar(0.9),
                alpha: 1.2,
            },
        ),
    ];

    let mut rng = StdRng::seed_from_u64(7);
    for kernel in &kernels {
        for &rows in &[1usize, 2, 50] {
            for &features in &[1usize, 5] {
                let data = random_matrix(&mut rng, rows, features);
                let x = CpuTensor::from_f64s(&[rows, features], &data);

                let full = full_program(kernel, DType::F64, None, features, false)?;
                let diag = diag_program(kernel, DType::F64, features)?;
                let (full_dims, full_values) = run(&full, &[x.clone()]);
                let (diag_dims, diag_values) = run(&diag, &[x]);

                assert_eq!(full_dims, vec![rows, rows]);
                assert_eq!(diag_dims, vec![rows]);
                let full_diag: Vec<f64> =
                    (0..rows).map(|i| full_values[i * rows + i]).collect();
                assert_close(&full_diag, &diag_values, 1e-9);
            }
        }
    }
    Ok(())
}

#[test]
fn sum_and_product_compose_elementwise() -> Result<()> {
    let k1 = Kernel::rbf(1.0);
    let k2 = Kernel::RationalQuadratic {
        length_scale: LengthScale::Scalar(1.4),
        alpha: 0.6,
    };

    let mut rng = StdRng::seed_from_u64(11);
    let data = random_matrix(&mut rng, 6, 3);
    let x = CpuTensor::from_f64s(&[6, 3], &data);

    let (_, lhs) = run(&full_program(&k1, DType::F64, None, 3, false)?, &[x.clone()]);
    let (_, rhs) = run(&full_program(&k2, DType::F64, None, 3, false)?, &[x.clone()]);

    let sum_kernel = Kernel::sum(k1.clone(), k2.clone());
    let (_, summed) = run(&full_program(&sum_kernel, DType::F64, None, 3, false)?, &[x.clone()]);
    let expected_sum: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(a, b)| a + b).collect();
    assert_close(&expected_sum, &summed, 1e-12);

    let product_kernel = Kernel::product(k1, k2);
    let (_, multiplied) = run(&full_program(&product_kernel, DType::F64, None, 3, false)?, &[x]);
    let expected_product: Vec<f64> = lhs.iter().zip(rhs.iter()).map(|(a, b)| a * b).collect();
    assert_close(&expected_product, &multiplied, 1e-12);
    Ok(())
}

#[test]
fn rbf_and_matern_with_infinite_nu_agree() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(13);
    let data = random_matrix(&mut rng, 8, 4);
    let x = CpuTensor::from_f64s(&[8, 4], &data);

    let rbf = full_program(&Kernel::rbf(1.7), DType::F64, None, 4, false)?;
    let matern = full_program(&Kernel::matern(1.7, f64::INFINITY), DType::F64, None, 4, false)?;
    let (_, rbf_values) = run(&rbf, &[x.clone()]);
    let (_, matern_values) = run(&matern, &[x]);
    assert_close(&rbf_values, &matern_values, 1e-9);
    Ok(())
}

#[test]
fn matern_nu_half_has_an_exactly_unit_diagonal() -> Result<()> {
    let program = full_program(&Kernel::matern(1.0, 0.5), DType::F64, None, 1, false)?;
    let x = CpuTensor::from_f64s(&[3, 1], &[0.0, 1.0, 2.0]);
    let (dims, values) = run(&program, &[x]);
    assert_eq!(dims, vec![3, 3]);
    for i in 0..3 {
        assert_eq!(values[i * 3 + i], 1.0, "self-distance must map to exactly 1");
    }
    Ok(())
}

#[test]
fn distance_strategies_agree_for_both_metrics() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(17);
    let x = CpuTensor::from_f64s(&[5, 3], &random_matrix(&mut rng, 5, 3));
    let y = CpuTensor::from_f64s(&[4, 3], &random_matrix(&mut rng, 4, 3));

    for metric in [DistanceMetric::Euclidean, DistanceMetric::SqEuclidean] {
        let generic = distance_program(metric, None, 3)?;
        let fused = distance_program(metric, Some(DistanceOptim::Fused), 3)?;
        let (generic_dims, generic_values) = run(&generic, &[x.clone(), y.clone()]);
        let (fused_dims, fused_values) = run(&fused, &[x.clone(), y.clone()]);
        assert_eq!(generic_dims, vec![5, 4]);
        assert_eq!(fused_dims, vec![5, 4]);
        assert_close(&generic_values, &fused_values, 1e-5);
    }
    Ok(())
}

#[test]
fn constant_kernel_depends_only_on_row_counts() -> Result<()> {
    let program = full_program(
        &Kernel::Constant { constant_value: 2.5 },
        DType::F64,
        None,
        2,
        false,
    )?;

    let mut rng = StdRng::seed_from_u64(19);
    let first = CpuTensor::from_f64s(&[3, 2], &random_matrix(&mut rng, 3, 2));
    let second = CpuTensor::from_f64s(&[3, 2], &random_matrix(&mut rng, 3, 2));
    let (first_dims, first_values) = run(&program, &[first]);
    let (second_dims, second_values) = run(&program, &[second]);

    assert_eq!(first_dims, vec![3, 3]);
    assert_eq!(second_dims, vec![3, 3]);
    assert_eq!(first_values, vec![2.5; 9]);
    assert_eq!(first_values, second_values, "content must not matter");
    Ok(())
}

#[test]
fn white_kernel_is_scaled_identity_against_itself() -> Result<()> {
    let program = full_program(&Kernel::White { noise_level: 0.5 }, DType::F64, None, 2, false)?;
    let mut rng = StdRng::seed_from_u64(23);
    let x = CpuTensor::from_f64s(&[3, 2], &random_matrix(&mut rng, 3, 2));
    let (dims, values) = run(&program, &[x]);

    assert_eq!(dims, vec![3, 3]);
    let mut expected = vec![0.0; 9];
    for diag in 0..3 {
        expected[diag * 3 + diag] = 0.5;
    }
    assert_eq!(values, expected);
    Ok(())
}

#[test]
fn white_kernel_is_zero_between_distinct_point_sets() -> Result<()> {
    let program = full_program(&Kernel::White { noise_level: 0.5 }, DType::F64, None, 2, true)?;
    let mut rng = StdRng::seed_from_u64(29);
    let x = CpuTensor::from_f64s(&[3, 2], &random_matrix(&mut rng, 3, 2));
    let train = CpuTensor::from_f64s(&[4, 2], &random_matrix(&mut rng, 4, 2));
    let (dims, values) = run(&program, &[x, train]);

    assert_eq!(dims, vec![3, 4]);
    assert_eq!(values, vec![0.0; 12]);
    Ok(())
}

#[test]
fn dot_product_of_orthogonal_vectors_reduces_to_sigma_squared() -> Result<()> {
    let program = full_program(&Kernel::DotProduct { sigma_0: 1.0 }, DType::F64, None, 2, true)?;
    let x = CpuTensor::from_f64s(&[1, 2], &[1.0, 0.0]);
    let train = CpuTensor::from_f64s(&[1, 2], &[0.0, 1.0]);
    let (dims, values) = run(&program, &[x, train]);
    assert_eq!(dims, vec![1, 1]);
    assert_eq!(values, vec![1.0]);
    Ok(())
}

#[test]
fn host_and_graph_training_sets_agree() -> Result<()> {
    let train_values = vec![0.2, -1.4, 0.7, 1.1, -0.3, 0.5];
    let host = HostArray::new(3, 2, train_values.clone())?;
    let mut rng = StdRng::seed_from_u64(31);
    let x_values = random_matrix(&mut rng, 4, 2);
    let x = CpuTensor::from_f64s(&[4, 2], &x_values);
    let train = CpuTensor::from_f64s(&[3, 2], &train_values);

    for kernel in [
        Kernel::DotProduct { sigma_0: 0.8 },
        Kernel::Pairwise {
            metric: "cosine".to_string(),
            gamma: None,
        },
    ] {
        let graph_program = full_program(&kernel, DType::F64, None, 2, true)?;
        let host_program = full_program_host_train(&kernel, DType::F64, host.clone(), 2)?;
        let (graph_dims, graph_values) = run(&graph_program, &[x.clone(), train.clone()]);
        let (host_dims, host_values) = run(&host_program, &[x.clone()]);
        assert_eq!(graph_dims, host_dims);
        assert_eq!(
            graph_values, host_values,
            "folded and emitted branches must agree for {}",
            kernel.name()
        );
    }
    Ok(())
}

#[test]
fn f32_compilation_stays_f32_and_tracks_f64() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(37);
    let data = random_matrix(&mut rng, 5, 3);

    let f64_program = full_program(&Kernel::rbf(1.3), DType::F64, None, 3, false)?;
    let (_, f64_values) = run(&f64_program, &[CpuTensor::from_f64s(&[5, 3], &data)]);

    let f32_program = full_program(&Kernel::rbf(1.3), DType::F32, None, 3, false)?;
    let narrowed: Vec<f32> = data.iter().map(|v| *v as f32).collect();
    let outputs = ReferenceCpuBackend::new()
        .run_program(&f32_program, &[CpuTensor::from_f32s(&[5, 3], &narrowed)])
        .expect("f32 program evaluates");
    assert!(
        matches!(outputs[0].data, TensorData::F32(_)),
        "f32 compilations must not widen"
    );
    let f32_values = outputs[0].to_f64_vec()?;
    assert_close(&f64_values, &f32_values, 1e-5);
    Ok(())
}

#[test]
fn per_feature_length_scale_scales_each_feature() -> Result<()> {
    let length_scales = vec![0.5, 2.0];
    let kernel = Kernel::rbf(length_scales.clone());
    let program = full_program(&kernel, DType::F64, None, 2, false)?;

    let mut rng = StdRng::seed_from_u64(41);
    let data = random_matrix(&mut rng, 4, 2);
    let (dims, values) = run(&program, &[CpuTensor::from_f64s(&[4, 2], &data)]);
    assert_eq!(dims, vec![4, 4]);

    for i in 0..4 {
        for j in 0..4 {
            let mut squared = 0.0;
            for (feature, scale) in length_scales.iter().enumerate() {
                let diff = (data[i * 2 + feature] - data[j * 2 + feature]) / scale;
                squared += diff * diff;
            }
            let expected = (-0.5 * squared).exp();
            let actual = values[i * 4 + j];
            assert!(
                (expected - actual).abs() <= 1e-9,
                "mismatch at ({i}, {j}): expected {expected}, got {actual}"
            );
        }
    }
    Ok(())
}

#[test]
fn exp_sine_squared_matches_the_closed_form() -> Result<()> {
    let kernel = Kernel::ExpSineSquared {
        length_scale: LengthScale::Scalar(1.2),
        periodicity: 1.7,
    };
    let program = full_program(&kernel, DType::F64, None, 1, false)?;

    let data = vec![-1.3, 0.2, 0.9, 2.4];
    let (dims, values) = run(&program, &[CpuTensor::from_f64s(&[4, 1], &data)]);
    assert_eq!(dims, vec![4, 4]);

    for i in 0..4 {
        for j in 0..4 {
            let distance = (data[i] - data[j]).abs();
            let arg = std::f64::consts::PI * distance / 1.7;
            let expected = (-2.0 * (arg.sin() / 1.2).powi(2)).exp();
            let actual = values[i * 4 + j];
            assert!(
                (expected - actual).abs() <= 1e-6,
                "mismatch at ({i}, {j}): expected {expected}, got {actual}"
            );
        }
    }
    Ok(())
}

#[test]
fn rational_quadratic_matches_the_closed_form() -> Result<()> {
    let (length_scale, alpha) = (1.4, 0.8);
    let kernel = Kernel::RationalQuadratic {
        length_scale: LengthScale::Scalar(length_scale),
        alpha,
    };
    let program = full_program(&kernel, DType::F64, None, 1, false)?;

    let data = vec![0.0, 0.7, -1.9, 3.2];
    let (_, values) = run(&program, &[CpuTensor::from_f64s(&[4, 1], &data)]);

    for i in 0..4 {
        for j in 0..4 {
            let squared = (data[i] - data[j]).powi(2);
            let expected =
                (1.0 + squared / (2.0 * alpha * length_scale * length_scale)).powf(-alpha);
            let actual = values[i * 4 + j];
            assert!(
                (expected - actual).abs() <= 1e-9,
                "mismatch at ({i}, {j}): expected {expected}, got {actual}"
            );
        }
    }
    Ok(())
}

#[test]
fn evaluator_rejects_unknown_op_versions() -> Result<()> {
    use gpk_rs::graph::spec::{Instruction, Operation, TensorLiteral};

    let literal = TensorLiteral::from_f64s(&[1], &[1.0]);
    let instruction = Instruction {
        id: gpk_rs::ValueId(0),
        op: Operation::Constant(literal.clone()),
        operands: vec![],
        output: literal.spec.clone(),
        op_version: OpsetVersion(99),
    };
    let result = ReferenceCpuBackend::new().execute_instruction(&instruction, &[]);
    assert!(result.is_err(), "opset 99 must be rejected");
    Ok(())
}
