use gpk_rs::graph::spec::{
    DType, Dimension, ElementwiseBinaryOp, Function, Operation, OpsetVersion, Program,
    ProgramBuilder, Shape, TensorSpec,
};
use gpk_rs::{
    compile_kernel, compile_kernel_diag, CompileError, CompileOptions, DistanceOptim, HostArray,
    Kernel, LengthScale, PointSet, ValueId,
};

fn options() -> CompileOptions {
    CompileOptions::new(DType::F64, OpsetVersion(1))
}

/// Registers a symbolic `[?rows, features]` point set with the builder.
fn symbolic_points(builder: &mut ProgramBuilder, rows: &str, features: usize) -> PointSet {
    let spec = TensorSpec::new(
        DType::F64,
        Shape::new(vec![
            Dimension::symbolic(rows),
            Dimension::Static(features),
        ]),
    );
    PointSet::Graph(builder.add_parameter(spec))
}

fn op_names(function: &Function) -> Vec<&'static str> {
    function.body.iter().map(|instr| instr.op.name()).collect()
}

#[test]
fn missing_op_version_fails_before_emitting() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let options = CompileOptions {
        dtype: DType::F64,
        op_version: None,
        optim: None,
    };

    let full = compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, None, &options, None);
    assert!(matches!(full, Err(CompileError::MissingOpVersion)));

    let diag = compile_kernel_diag(&mut builder, &Kernel::rbf(1.0), &x, &options, None);
    assert!(matches!(diag, Err(CompileError::MissingOpVersion)));

    let function = builder.finish("main", vec![]);
    assert!(function.body.is_empty(), "no instruction may be staged");
}

#[test]
fn si64_precision_is_rejected() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let options = CompileOptions {
        dtype: DType::Si64,
        op_version: Some(OpsetVersion(1)),
        optim: None,
    };
    let result = compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, None, &options, None);
    assert!(matches!(
        result,
        Err(CompileError::UnsupportedDType(DType::Si64))
    ));
}

#[test]
fn every_instruction_carries_the_requested_op_version() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 3);
    let options = CompileOptions::new(DType::F64, OpsetVersion(1));

    compile_kernel(&mut builder, &Kernel::rbf(1.5), &x, None, &options, None)
        .expect("rbf compiles");

    let function = builder.finish("main", vec![]);
    assert!(!function.body.is_empty());
    for instruction in &function.body {
        assert_eq!(instruction.op_version, OpsetVersion(1));
    }
}

#[test]
fn sum_and_product_compile_to_elementwise_combinations() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let kernel = Kernel::sum(
        Kernel::rbf(1.0),
        Kernel::Constant { constant_value: 0.5 },
    );
    let root = compile_kernel(&mut builder, &kernel, &x, None, &options(), None)
        .expect("sum kernel compiles");

    let function = builder.finish("main", vec![root]);
    let root_instr = function
        .body
        .iter()
        .find(|instr| instr.id == root)
        .expect("root instruction present");
    assert_eq!(
        root_instr.op,
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Add)
    );

    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let kernel = Kernel::product(
        Kernel::rbf(1.0),
        Kernel::Constant { constant_value: 0.5 },
    );
    let root = compile_kernel(&mut builder, &kernel, &x, None, &options(), None)
        .expect("product kernel compiles");
    let function = builder.finish("main", vec![root]);
    let root_instr = function
        .body
        .iter()
        .find(|instr| instr.id == root)
        .expect("root instruction present");
    assert_eq!(
        root_instr.op,
        Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul)
    );
}

#[test]
fn unsupported_matern_nu_rolls_back_cleanly() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let kernel = Kernel::matern(1.0, 0.75);

    let result = compile_kernel(&mut builder, &kernel, &x, None, &options(), Some("kernel"));
    match result {
        Err(CompileError::Unsupported { kernel, detail }) => {
            assert_eq!(kernel, "Matern");
            assert!(detail.contains("0.75"), "detail should name nu: {detail}");
        }
        other => panic!("expected unsupported-construct error, got {other:?}"),
    }

    let function = builder.finish("main", vec![]);
    assert!(
        function.body.is_empty(),
        "failed compilation must leave no partial graph"
    );
    assert!(function.output_names.is_empty());
}

#[test]
fn unknown_pairwise_metric_is_reported_with_context() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let kernel = Kernel::Pairwise {
        metric: "laplacian".to_string(),
        gamma: None,
    };
    let result = compile_kernel(&mut builder, &kernel, &x, None, &options(), None);
    match result {
        Err(CompileError::Unsupported { kernel, detail }) => {
            assert_eq!(kernel, "Pairwise");
            assert!(detail.contains("laplacian"));
        }
        other => panic!("expected unsupported-construct error, got {other:?}"),
    }
}

#[test]
fn exp_sine_squared_requires_scalar_length_scale() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let kernel = Kernel::ExpSineSquared {
        length_scale: LengthScale::PerFeature(vec![1.0, 2.0]),
        periodicity: 1.0,
    };
    let result = compile_kernel(&mut builder, &kernel, &x, None, &options(), None);
    match result {
        Err(CompileError::Unsupported { kernel, .. }) => assert_eq!(kernel, "ExpSineSquared"),
        other => panic!("expected unsupported-construct error, got {other:?}"),
    }
}

#[test]
fn diagonal_path_rejects_white_and_pairwise_kernels() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);

    let white = compile_kernel_diag(
        &mut builder,
        &Kernel::White { noise_level: 0.1 },
        &x,
        &options(),
        None,
    );
    match white {
        Err(CompileError::Unsupported { kernel, .. }) => assert_eq!(kernel, "White"),
        other => panic!("expected unsupported-construct error, got {other:?}"),
    }

    let pairwise = compile_kernel_diag(
        &mut builder,
        &Kernel::Pairwise {
            metric: "cosine".to_string(),
            gamma: None,
        },
        &x,
        &options(),
        None,
    );
    assert!(matches!(
        pairwise,
        Err(CompileError::Unsupported { kernel: "Pairwise", .. })
    ));

    let function = builder.finish("main", vec![]);
    assert!(function.body.is_empty());
}

#[test]
fn dot_product_rejects_non_2d_points() {
    let mut builder = ProgramBuilder::new();
    let spec = TensorSpec::new(DType::F64, Shape::new(vec![Dimension::symbolic("n_x")]));
    let x = PointSet::Graph(builder.add_parameter(spec));
    let result = compile_kernel(
        &mut builder,
        &Kernel::DotProduct { sigma_0: 1.0 },
        &x,
        None,
        &options(),
        None,
    );
    assert!(matches!(result, Err(CompileError::ShapeMismatch { .. })));
}

#[test]
fn unregistered_input_value_is_rejected() {
    let mut builder = ProgramBuilder::new();
    let x = PointSet::Graph(ValueId(99));
    let result = compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, None, &options(), None);
    assert!(matches!(result, Err(CompileError::UnknownValue(ValueId(99)))));
}

#[test]
fn point_sets_must_agree_on_feature_count() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let train = PointSet::Host(
        HostArray::new(3, 3, vec![0.0; 9]).expect("host array dims match values"),
    );
    let result = compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, Some(&train), &options(), None);
    assert!(matches!(result, Err(CompileError::ShapeMismatch { .. })));
}

#[test]
fn distance_optim_parses_known_modes_only() {
    assert_eq!("fused".parse::<DistanceOptim>().unwrap(), DistanceOptim::Fused);
    match "speedy".parse::<DistanceOptim>() {
        Err(CompileError::UnknownOptimization(mode)) => assert_eq!(mode, "speedy"),
        other => panic!("expected unknown-optimization error, got {other:?}"),
    }
}

#[test]
fn fused_optim_swaps_the_distance_subgraph_for_a_custom_call() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let train = symbolic_points(&mut builder, "n_train", 2);
    let fused = options().with_optim(DistanceOptim::Fused);
    compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, Some(&train), &fused, None)
        .expect("fused rbf compiles");
    let function = builder.finish("main", vec![]);
    assert!(op_names(&function).contains(&"custom_call"));

    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let train = symbolic_points(&mut builder, "n_train", 2);
    compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, Some(&train), &options(), None)
        .expect("generic rbf compiles");
    let function = builder.finish("main", vec![]);
    assert!(!op_names(&function).contains(&"custom_call"));
}

#[test]
fn white_kernel_uses_eye_like_only_against_itself() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    compile_kernel(
        &mut builder,
        &Kernel::White { noise_level: 0.3 },
        &x,
        None,
        &options(),
        None,
    )
    .expect("white kernel compiles");
    let function = builder.finish("main", vec![]);
    assert!(op_names(&function).contains(&"eye_like"));

    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let train = symbolic_points(&mut builder, "n_train", 2);
    compile_kernel(
        &mut builder,
        &Kernel::White { noise_level: 0.3 },
        &x,
        Some(&train),
        &options(),
        None,
    )
    .expect("white kernel compiles");
    let function = builder.finish("main", vec![]);
    assert!(!op_names(&function).contains(&"eye_like"));
}

#[test]
fn output_names_never_collide_silently() {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);

    compile_kernel(&mut builder, &Kernel::rbf(1.0), &x, None, &options(), Some("kernel"))
        .expect("first compilation claims the name");
    let second = compile_kernel(
        &mut builder,
        &Kernel::rbf(2.0),
        &x,
        None,
        &options(),
        Some("kernel"),
    );
    assert!(matches!(second, Err(CompileError::Graph(_))));
}

#[test]
fn programs_render_and_round_trip_through_json() -> anyhow::Result<()> {
    let mut builder = ProgramBuilder::new();
    let x = symbolic_points(&mut builder, "n_x", 2);
    let root = compile_kernel(
        &mut builder,
        &Kernel::sum(Kernel::rbf(1.0), Kernel::White { noise_level: 0.2 }),
        &x,
        None,
        &options(),
        Some("kernel"),
    )?;

    let function = builder.finish("main", vec![root]);
    let program = Program::new("main").with_functions(vec![function]);

    let rendered = program.to_string();
    assert!(rendered.contains("func @main"));
    assert!(rendered.contains("kernel = %"));

    let round_tripped = Program::from_json_str(&program.to_json_string()?)?;
    assert_eq!(round_tripped, program);
    Ok(())
}
