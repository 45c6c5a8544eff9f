//! End-to-end pipeline runs with every live source failing.
//!
//! No network access: each logical dataset gets scripted failing candidates,
//! so every run exercises the synthetic fallback from resolution through
//! simulation.

mod common;

use eduscore_backend::cache::CacheStore;
use eduscore_backend::config::PipelineConfig;
use eduscore_backend::fallback::AttemptOutcome;
use eduscore_backend::models::{metric_names, ConsolidatedRow, Provenance, QualityFlag};
use eduscore_backend::modeling::{EffectKind, ModelKind};
use eduscore_backend::simulation::{Perturbation, Scenario};
use eduscore_backend::Pipeline;

fn pipeline(config: PipelineConfig) -> Pipeline {
    let datasets = common::failing_datasets(&config);
    Pipeline::with_datasets(config, CacheStore::open_in_memory().unwrap(), datasets).unwrap()
}

#[tokio::test]
async fn test_all_sources_failing_falls_back_and_trains() {
    let pipeline = pipeline(PipelineConfig::default());
    let run = pipeline.run_pipeline().await.unwrap();

    for (name, provenance, attempts) in run.provenance_report() {
        assert_eq!(provenance, Provenance::Synthetic, "dataset {}", name);
        assert_eq!(attempts.len(), 3);
        assert!(attempts[..2]
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::Failed(_))));
    }

    let dataset = &run.dataset;
    assert_eq!(dataset.len(), 51);
    assert!(dataset.is_fully_synthetic());
    for row in dataset.training_rows() {
        assert!(dataset
            .required_features
            .iter()
            .all(|f| row.feature(f).map_or(false, f64::is_finite)));
        assert!(row.has_flag(|f| matches!(f, QualityFlag::SyntheticSource { .. })));
    }

    let report = pipeline.train_and_select(dataset).unwrap();
    let best = report.selected.result();
    assert!(best.test_r2 >= 0.5, "best held-out R² {}", best.test_r2);
    assert_eq!(report.results.iter().filter(|r| r.selected).count(), 1);
    assert_eq!(report.results.len(), ModelKind::ALL.len());
    assert!(report
        .results
        .iter()
        .filter(|r| !r.is_converged())
        .all(|r| !r.selected && r.failure_reason().is_some()));
}

#[tokio::test]
async fn test_spending_increase_on_reference_row() {
    let mut config = PipelineConfig::default();
    config.training.roster = vec![ModelKind::Linear];
    let pipeline = pipeline(config);
    let run = pipeline.run_pipeline().await.unwrap();
    let report = pipeline.train_and_select(&run.dataset).unwrap();
    let model = &report.selected;

    let effects = model.feature_effects();
    assert_eq!(effects.kind, EffectKind::Coefficient);
    assert!(effects.get(metric_names::PER_PUPIL_SPENDING).unwrap() > 0.0);

    let base = ConsolidatedRow::new("REF")
        .with_feature(metric_names::PER_PUPIL_SPENDING, 10_000.0)
        .with_feature(metric_names::POVERTY_RATE, 15.0)
        .with_feature(metric_names::MEDIAN_HOUSEHOLD_INCOME, 65_000.0)
        .with_feature(metric_names::PUPIL_TEACHER_RATIO, 16.0);
    let scenario = Scenario::new(base.clone())
        .with(Perturbation::percent(metric_names::PER_PUPIL_SPENDING, 20.0));

    let out = pipeline.simulate(model, &scenario).unwrap();
    assert!(out.predicted_outcome > out.baseline_outcome);
    assert_eq!(scenario.base_row, base);

    let rejected = Scenario::new(base)
        .with(Perturbation::percent(metric_names::PER_PUPIL_SPENDING, 500.0));
    assert!(pipeline.simulate(model, &rejected).is_err());
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let a = pipeline(PipelineConfig::default());
    let b = pipeline(PipelineConfig::default());
    let run_a = a.run_pipeline().await.unwrap();
    let run_b = b.run_pipeline().await.unwrap();
    assert_eq!(run_a.dataset, run_b.dataset);

    let report_a = a.train_and_select(&run_a.dataset).unwrap();
    let report_b = b.train_and_select(&run_b.dataset).unwrap();
    assert_eq!(report_a.selected.kind(), report_b.selected.kind());
    assert_eq!(report_a.results.len(), report_b.results.len());
    for (ra, rb) in report_a.results.iter().zip(&report_b.results) {
        assert_eq!(ra.status, rb.status);
        if ra.is_converged() {
            assert_eq!(ra, rb);
        }
    }
}

#[tokio::test]
async fn test_population_scenario_over_fallback_data() {
    let pipeline = pipeline(PipelineConfig::default());
    let run = pipeline.run_pipeline().await.unwrap();
    let report = pipeline.train_and_select(&run.dataset).unwrap();

    let effect = pipeline
        .simulate_population(
            &report.selected,
            &run.dataset,
            &[Perturbation::percent(metric_names::PER_PUPIL_SPENDING, 20.0)],
        )
        .unwrap();
    assert_eq!(effect.rows, 51);
    assert!(effect.min_delta <= effect.mean_delta && effect.mean_delta <= effect.max_delta);
}
