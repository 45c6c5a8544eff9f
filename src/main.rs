//! EduScore - state education outcome pipeline
//! Fetches, consolidates, trains, and runs a demonstration spending scenario.

use anyhow::{Context, Result};
use dotenv::dotenv;
use eduscore_backend::{
    models::metric_names,
    simulation::{Perturbation, Scenario},
    Pipeline, PipelineConfig,
};
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_SPENDING_INCREASE_PCT: f64 = 20.0;

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🎓 EduScore pipeline starting");

    let config = PipelineConfig::from_env();
    config.validate().context("Invalid pipeline configuration")?;
    info!(cache = %config.cache_path, seed = config.training.seed, "configuration loaded");

    let pipeline = Pipeline::from_config(config).context("Failed to initialize pipeline")?;

    let run = pipeline.run_pipeline().await.context("Data stages failed")?;
    for (name, provenance, attempts) in run.provenance_report() {
        info!(dataset = name, provenance = %provenance, attempts = attempts.len(), "📦 dataset");
    }
    match pipeline.cache().stats() {
        Ok(stats) => info!(
            entries = stats.entries,
            stale = stats.stale_entries,
            "💾 response cache"
        ),
        Err(e) => warn!(error = %e, "cache stats unavailable"),
    }
    for (metric, value) in &run.dataset.context {
        info!(metric = %metric, value, "🌎 national context");
    }

    let report = pipeline
        .train_and_select(&run.dataset)
        .context("Model training failed")?;

    info!(
        "📊 {:<18} {:>9} {:>9} {:>8} {:>9} {:>8}",
        "model", "train_r2", "test_r2", "mae", "cv_mean", "cv_std"
    );
    for r in report.results.iter().filter(|r| r.is_converged()) {
        info!(
            "📊 {:<18} {:>9.4} {:>9.4} {:>8.3} {:>9.4} {:>8.4}{}",
            r.kind.as_str(),
            r.train_r2,
            r.test_r2,
            r.mae,
            r.cv_mean,
            r.cv_std,
            if r.selected { "  ← selected" } else { "" }
        );
    }
    for (kind, reason) in report.failures() {
        warn!(kind = %kind, reason = %reason, "📊 model kind failed");
    }

    let model = &report.selected;
    for (feature, effect) in &model.feature_effects().values {
        info!(feature = %feature, effect, "feature effect");
    }

    let spending_up =
        Perturbation::percent(metric_names::PER_PUPIL_SPENDING, DEMO_SPENDING_INCREASE_PCT);

    let baseline = pipeline
        .simulator()
        .population_baseline(model, &run.dataset)
        .context("Failed to build population baseline")?;
    let median_state = pipeline
        .simulate(model, &Scenario::new(baseline).with(spending_up.clone()))
        .context("Baseline scenario failed")?;
    info!(
        scenario = %spending_up,
        baseline = median_state.baseline_outcome,
        predicted = median_state.predicted_outcome,
        delta = median_state.delta_outcome,
        "🧪 median-state scenario"
    );

    let population = pipeline
        .simulate_population(model, &run.dataset, &[spending_up.clone()])
        .context("Population scenario failed")?;
    info!(
        scenario = %spending_up,
        states = population.rows,
        mean_delta = population.mean_delta,
        min_delta = population.min_delta,
        max_delta = population.max_delta,
        "🧪 population scenario"
    );

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eduscore_backend=info,eduscore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
