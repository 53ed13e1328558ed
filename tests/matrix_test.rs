//! Property tests for the campaign matrix
//!
//! - size is configs × frequencies × repetitions
//! - identifiers are unique and round-trip through `TaskId::parse`
//! - rebuilding from the same inputs yields the same tasks

mod common;

use proptest::prelude::*;

use minis_validation::campaign::{build_matrix, TaskId};
use minis_validation::config::FrequencySet;

const TITLES: [&str; 3] = ["config_PC_Exc.yaml", "config_PC_Inh.yaml", "config_L23_BTC_Inh.yaml"];

fn arb_frequencies() -> impl Strategy<Value = Vec<f64>> {
    proptest::collection::btree_set(1u32..20_000, 1..8)
        .prop_map(|set| set.into_iter().map(|n| f64::from(n) / 1000.0).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matrix_size_and_unique_ids(
        n_configs in 1usize..=3,
        frequencies in arb_frequencies(),
        repetitions in 1u32..6,
        seed in 0u64..1_000,
    ) {
        let configs: Vec<_> = TITLES[..n_configs].iter().map(|t| common::job_config(t)).collect();
        let freqs = FrequencySet::new(frequencies.clone()).unwrap();
        let tasks = build_matrix(&configs, &freqs, repetitions, seed).unwrap();

        prop_assert_eq!(tasks.len(), n_configs * frequencies.len() * repetitions as usize);

        let mut ids: Vec<&str> = tasks.iter().map(|t| t.id().as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), tasks.len());

        for (i, task) in tasks.iter().enumerate() {
            prop_assert_eq!(task.index(), i);
            prop_assert_eq!(task.seed(), seed + u64::from(task.repetition()));
            let (title, frequency, repetition) = TaskId::parse(task.id().as_str()).unwrap();
            prop_assert_eq!(title.as_str(), task.job_title());
            prop_assert!((frequency - task.frequency()).abs() < 5e-4);
            prop_assert_eq!(repetition, task.repetition());
        }
    }

    #[test]
    fn prop_matrix_is_deterministic(frequencies in arb_frequencies(), repetitions in 1u32..4) {
        let configs = vec![common::job_config(TITLES[0]), common::job_config(TITLES[1])];
        let freqs = FrequencySet::new(frequencies).unwrap();
        let first = build_matrix(&configs, &freqs, repetitions, 7).unwrap();
        let second = build_matrix(&configs, &freqs, repetitions, 7).unwrap();
        prop_assert_eq!(first, second);
    }
}

#[test]
fn test_zero_repetitions_rejected() {
    let freqs = FrequencySet::new(vec![0.1]).unwrap();
    assert!(build_matrix(&[common::job_config(TITLES[0])], &freqs, 0, 0).is_err());
}

#[test]
fn test_frequencies_colliding_at_three_decimals_rejected() {
    let freqs = FrequencySet::new(vec![0.1, 0.1001]).unwrap();
    assert!(build_matrix(&[common::job_config(TITLES[0])], &freqs, 1, 0).is_err());
}
