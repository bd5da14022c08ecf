use anyhow::{Context, Result};
use common::clock::{Clock, SystemClock};
use common::config::Config;
use common::db::AsyncDb;
use reputation::InvestmentEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

mod cli;
mod jobs;
mod metrics;
mod scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(&Config::default_path())?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("hubd", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;

    let db = AsyncDb::open(&config.database.path, config.database.tables.clone())
        .await
        .with_context(|| format!("failed to open hub database at {}", config.database.path))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if cmd != cli::Command::Run {
        let app = cli::App::new(db, clock, &config);
        let out = app.run_command(cmd).await?;
        println!("{out}");
        return Ok(());
    }

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();
    tracing::info!(
        min_points = config.investment.min_points,
        payout_multiplier = config.investment.payout_multiplier,
        window_days = config.investment.window_days,
        "hubd starting"
    );

    run(db, clock, config).await
}

/// Periodic settlement. Streak awards run in the process that writes the comment.
async fn run(db: AsyncDb, clock: Arc<dyn Clock>, config: Config) -> Result<()> {
    let engine = InvestmentEngine::new(db.clone(), clock, config.investment);

    // Spawn the worker before the scheduler so the first tick has a receiver.
    let (settlement_tx, mut settlement_rx) = tokio::sync::mpsc::channel::<()>(8);
    let batch_limit = config.settlement.batch_limit;
    let worker = tokio::spawn({
        let db = db.clone();
        async move {
            while settlement_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "settlement");
                match jobs::run_settlement_once(&db, &engine, batch_limit)
                    .instrument(span)
                    .await
                {
                    Ok(report) => tracing::info!(
                        due = report.due,
                        won = report.won,
                        lost = report.lost,
                        failed = report.failed,
                        "settlement done"
                    ),
                    Err(e) => tracing::error!(error = %e, "settlement failed"),
                }
            }
        }
    });

    let _scheduler = scheduler::start(vec![scheduler::JobSpec {
        name: "settlement".to_string(),
        interval: Duration::from_secs(config.settlement.interval_secs),
        tick: settlement_tx,
        run_immediately: true,
    }]);

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
        res = worker => {
            res.context("settlement worker panicked")?;
            tracing::warn!("settlement worker exited");
        }
    }

    tracing::info!("hubd stopped");
    Ok(())
}
