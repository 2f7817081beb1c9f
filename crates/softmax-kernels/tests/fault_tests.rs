//! Failure surfaces: missing devices, memory limits and faulted kernels.

use serial_test::serial;
use softmax_common::{
    CombineMode, DeviceTarget, QueueOrdering, ResidencyKind, SoftmaxConfig, SoftmaxError, Strategy,
};
use softmax_device::{AccessMode, AllocationGuard, ContextBuilder, KernelFault, strategy_for};
use softmax_kernels::{Shift, SoftmaxEvaluator, flat, tiled};

#[test]
#[serial(softmax_env)]
fn gpu_target_without_device_is_unavailable() {
    temp_env::with_var_unset("SOFTMAX_GPU_FAKE", || {
        let err = SoftmaxEvaluator::new(SoftmaxConfig {
            target: DeviceTarget::Gpu,
            ..SoftmaxConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, SoftmaxError::DeviceUnavailable { target: DeviceTarget::Gpu, .. }));
    });
}

#[test]
#[serial(softmax_env)]
fn emulated_gpu_runs_every_strategy() {
    temp_env::with_var("SOFTMAX_GPU_FAKE", Some("1"), || {
        let evaluator = SoftmaxEvaluator::new(SoftmaxConfig {
            target: DeviceTarget::Gpu,
            threads: 2,
            ..SoftmaxConfig::default()
        })
        .unwrap();
        assert_eq!(evaluator.context().device().name, "emulated-gpu");
        for strategy in Strategy::ALL {
            let eval = evaluator.evaluate_timed(strategy, &[1.0, 2.0, 3.0, 4.0]).unwrap();
            assert!((eval.checksum - 1.0).abs() < 1e-12, "{strategy}");
        }
    });
}

#[test]
fn memory_limit_raises_allocation_failure_without_leaks() {
    let evaluator = SoftmaxEvaluator::new(SoftmaxConfig {
        target: DeviceTarget::Cpu,
        threads: 2,
        memory_limit: 4096,
        ..SoftmaxConfig::default()
    })
    .unwrap();
    let input = vec![1.0; 1000];
    for strategy in Strategy::ALL.into_iter().filter(|s| s.uses_device()) {
        let err = evaluator.evaluate_with(strategy, &input).unwrap_err();
        assert!(matches!(err, SoftmaxError::AllocationFailure { .. }), "{strategy}: {err}");
    }
    let stats = evaluator.context().memory_stats();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.leaked_allocations, 0);

    // The sequential path allocates nothing on the device.
    assert_eq!(evaluator.sequential(&input).unwrap().len(), 1000);
}

#[test]
fn faulted_dependency_aborts_kernel_and_staging_is_still_released() {
    let ctx = ContextBuilder::new(DeviceTarget::Cpu)
        .ordering(QueueOrdering::Unordered)
        .threads(2)
        .build()
        .unwrap();
    for kind in ResidencyKind::ALL {
        let strategy = strategy_for(kind);
        let staged = strategy.stage(&ctx, &[1.0, 2.0, 3.0]).unwrap();

        let bad = ctx
            .launch("corrupt_input")
            .single_task(|| Err(KernelFault::new("index 3 out of bounds")))
            .unwrap();
        let softmax = flat::launch_naive(&ctx, &staged, &Shift::Zero, &[bad]).unwrap();
        staged.record_output_writer(&softmax);

        let err = ctx.wait(&softmax).unwrap_err();
        match &err {
            SoftmaxError::ExecutionFault { kernel, reason } => {
                assert_eq!(kernel, flat::NAIVE_KERNEL);
                assert!(reason.contains("corrupt_input"), "{reason}");
            }
            other => panic!("{kind}: expected ExecutionFault, got {other}"),
        }
        strategy.release(&ctx, staged).unwrap();
    }
    ctx.wait_all().unwrap();
    let stats = ctx.memory_stats();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.leaked_allocations, 0);
}

#[test]
fn staged_copy_retrieve_surfaces_writer_fault() {
    let ctx = ContextBuilder::new(DeviceTarget::Cpu).threads(2).build().unwrap();
    let strategy = strategy_for(ResidencyKind::StagedCopy);
    let staged = strategy.stage(&ctx, &[0.0; 8]).unwrap();

    let bad = ctx.launch("bad").single_task(|| Err(KernelFault::new("boom"))).unwrap();
    let softmax = flat::launch_naive(&ctx, &staged, &Shift::Zero, &[bad]).unwrap();
    staged.record_output_writer(&softmax);

    let err = strategy.retrieve(&ctx, &staged).unwrap_err();
    assert!(err.is_execution_fault());
    strategy.release(&ctx, staged).unwrap();
}

#[test]
fn out_of_bounds_read_inside_softmax_kernel_faults_without_output() {
    let ctx = ContextBuilder::new(DeviceTarget::Cpu)
        .ordering(QueueOrdering::Unordered)
        .threads(2)
        .build()
        .unwrap();
    let kernels = ["naive", "reduced", "tiled-two-pass", "tiled-atomic"];
    for kind in ResidencyKind::ALL {
        for kernel in kernels {
            let strategy = strategy_for(kind);
            let staged = strategy.stage(&ctx, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
            let mut scratch = AllocationGuard::new(&ctx);
            // A shift scalar with no element behind it: every task's read of
            // index 0 is out of bounds.
            let empty = scratch.track(ctx.malloc_device(0, "empty_shift").unwrap());
            let shift = Shift::Device(empty.view(AccessMode::Read));

            let combine = match kernel {
                "tiled-atomic" => CombineMode::Atomic,
                _ => CombineMode::TwoPass,
            };
            let last = match kernel {
                "naive" => flat::launch_naive(&ctx, &staged, &shift, &[]),
                "reduced" => flat::launch_reduced(&ctx, &staged, &shift, 2, &[], &mut scratch),
                _ => tiled::launch_tiled(&ctx, &staged, &shift, 2, combine, &[], &mut scratch),
            }
            .unwrap();
            staged.record_output_writer(&last);

            let output = ctx.wait(&last).and_then(|()| strategy.retrieve(&ctx, &staged));
            match output {
                Err(SoftmaxError::ExecutionFault { .. }) => {}
                Err(other) => panic!("{kind}/{kernel}: expected ExecutionFault, got {other}"),
                Ok(values) => panic!("{kind}/{kernel}: faulted kernel produced {values:?}"),
            }
            strategy.release(&ctx, staged).unwrap();
            drop(scratch);
        }
    }
    ctx.wait_all().unwrap();
    let stats = ctx.memory_stats();
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.leaked_allocations, 0);
}

#[test]
fn naive_kernel_fault_names_the_out_of_bounds_read() {
    let ctx = ContextBuilder::new(DeviceTarget::Cpu).threads(2).build().unwrap();
    let strategy = strategy_for(ResidencyKind::SharedManaged);
    let staged = strategy.stage(&ctx, &[0.5, 1.5]).unwrap();
    let empty = ctx.malloc_device(0, "empty_shift").unwrap();

    let shift = Shift::Device(empty.view(AccessMode::Read));
    let event = flat::launch_naive(&ctx, &staged, &shift, &[]).unwrap();
    match ctx.wait(&event).unwrap_err() {
        SoftmaxError::ExecutionFault { kernel, reason } => {
            assert_eq!(kernel, flat::NAIVE_KERNEL);
            assert!(reason.contains("out of bounds"), "{reason}");
        }
        other => panic!("expected ExecutionFault, got {other}"),
    }
    strategy.release(&ctx, staged).unwrap();
    ctx.free(empty).unwrap();
}
