//! Distribution properties over random inputs.

use proptest::prelude::*;
use softmax_common::Strategy as EvalStrategy;
use softmax_common::{CombineMode, DeviceTarget, SoftmaxConfig, max_abs_diff, validate_distribution};
use softmax_kernels::{SoftmaxEvaluator, reference};
use std::sync::LazyLock;

static EVALUATOR: LazyLock<SoftmaxEvaluator> = LazyLock::new(|| {
    SoftmaxEvaluator::new(SoftmaxConfig {
        target: DeviceTarget::Cpu,
        threads: 4,
        group_size: 32,
        reduction_chunk: 64,
        ..SoftmaxConfig::default()
    })
    .expect("cpu evaluator")
});

static ATOMIC_EVALUATOR: LazyLock<SoftmaxEvaluator> = LazyLock::new(|| {
    SoftmaxEvaluator::new(SoftmaxConfig {
        target: DeviceTarget::Cpu,
        threads: 4,
        group_size: 20,
        combine: CombineMode::Atomic,
        ..SoftmaxConfig::default()
    })
    .expect("cpu evaluator")
});

fn logits() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-40.0f64..40.0, 1..400)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_every_strategy_is_a_distribution(input in logits()) {
        for strategy in EvalStrategy::ALL {
            let output = EVALUATOR.evaluate_with(strategy, &input).unwrap();
            prop_assert_eq!(output.len(), input.len());
            prop_assert!(validate_distribution(&output, 1e-6).is_ok(), "{}", strategy);
        }
    }

    #[test]
    fn prop_device_strategies_match_reference(input in logits()) {
        let expected = reference::softmax(&input);
        for strategy in EvalStrategy::ALL {
            let output = EVALUATOR.evaluate_with(strategy, &input).unwrap();
            prop_assert!(max_abs_diff(&output, &expected) <= 1e-9, "{}", strategy);
        }
    }

    #[test]
    fn prop_atomic_tiled_matches_reference(input in logits()) {
        let expected = reference::softmax(&input);
        let output = ATOMIC_EVALUATOR.evaluate_with(EvalStrategy::TiledGroup, &input).unwrap();
        prop_assert!(max_abs_diff(&output, &expected) <= 1e-9);
    }

    #[test]
    fn prop_shift_invariance(input in logits(), offset in -20.0f64..20.0) {
        let shifted: Vec<f64> = input.iter().map(|x| x + offset).collect();
        let a = EVALUATOR.tiled_group(&input).unwrap();
        let b = EVALUATOR.tiled_group(&shifted).unwrap();
        prop_assert!(max_abs_diff(&a, &b) <= 1e-9);
    }
}
