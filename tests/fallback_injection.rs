//! Exhaustive failure injection across the four logical datasets.

mod common;

use eduscore_backend::cache::CacheStore;
use eduscore_backend::config::PipelineConfig;
use eduscore_backend::fallback::LogicalDataset;
use eduscore_backend::models::Provenance;
use eduscore_backend::pipeline::standard_datasets;
use eduscore_backend::sources::SourceAdapter;
use eduscore_backend::Pipeline;
use std::sync::Arc;

#[tokio::test]
async fn test_every_success_failure_combination_yields_a_dataset() {
    let config = PipelineConfig::default();
    let template = standard_datasets(&config);
    let kinds = common::failure_kinds();
    let n = template.len();

    for mask in 0u32..(1 << n) {
        let datasets: Vec<LogicalDataset> = template
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let adapter: Arc<dyn SourceAdapter> = if mask & (1 << i) != 0 {
                    common::LiveStandIn::new(&format!("{}_live", d.name))
                } else {
                    let kind = kinds[i % kinds.len()].clone();
                    common::FailingAdapter::new(&format!("{}_down", d.name), kind)
                };
                LogicalDataset::new(d.name.clone(), d.query.clone()).with_candidate(adapter)
            })
            .collect();

        let pipeline =
            Pipeline::with_datasets(config.clone(), CacheStore::open_in_memory().unwrap(), datasets)
                .unwrap();
        let run = pipeline.run_pipeline().await.unwrap();

        assert_eq!(run.dataset.len(), 51, "mask {:04b}", mask);
        for (i, (name, provenance, _)) in run.provenance_report().into_iter().enumerate() {
            let expected = if mask & (1 << i) != 0 {
                Provenance::Live
            } else {
                Provenance::Synthetic
            };
            assert_eq!(provenance, expected, "mask {:04b} dataset {}", mask, name);
        }
        for resolved in &run.resolved {
            assert!(!resolved.records.is_empty());
        }
        assert_eq!(run.dataset.is_fully_synthetic(), mask == 0);
        assert_eq!(run.dataset.training_rows().count(), 51);
    }
}
