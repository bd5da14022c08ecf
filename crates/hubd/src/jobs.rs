use anyhow::Result;
use common::db::AsyncDb;
use reputation::investment::SettleDueReport;
use reputation::InvestmentEngine;
use std::time::Instant;

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%SZ', 'now')";

/// Persists the state of a background job in the `job_status` table.
pub struct JobTracker {
    db: AsyncDb,
    job_name: String,
    start_time: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &str) -> Result<Self> {
        let name = job_name.to_string();
        db.call_named("job_tracker.start", move |conn, t| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (job_name, status, last_run_at, updated_at)
                     VALUES (?1, 'running', {NOW}, {NOW})
                     ON CONFLICT(job_name) DO UPDATE SET
                        status = 'running',
                        last_run_at = {NOW},
                        updated_at = {NOW},
                        last_error = NULL,
                        duration_ms = NULL",
                    table = t.job_status
                ),
                rusqlite::params![name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name: job_name.to_string(),
            start_time: Instant::now(),
        })
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name;
        let meta_str = metadata.map(|v| v.to_string());

        self.db
            .call_named("job_tracker.success", move |conn, t| {
                conn.execute(
                    &format!(
                        "UPDATE {table} SET
                            status = 'idle',
                            duration_ms = ?2,
                            metadata = ?3,
                            updated_at = {NOW}
                         WHERE job_name = ?1",
                        table = t.job_status
                    ),
                    rusqlite::params![name, duration_ms, meta_str],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.start_time.elapsed().as_millis() as i64;
        let name = self.job_name;
        let error_msg = format!("{error:#}");

        self.db
            .call_named("job_tracker.fail", move |conn, t| {
                conn.execute(
                    &format!(
                        "UPDATE {table} SET
                            status = 'failed',
                            duration_ms = ?2,
                            last_error = ?3,
                            updated_at = {NOW}
                         WHERE job_name = ?1",
                        table = t.job_status
                    ),
                    rusqlite::params![name, duration_ms, error_msg],
                )?;
                Ok(())
            })
            .await
    }
}

/// One settlement sweep, recorded in `job_status` as `settlement`.
pub async fn run_settlement_once(
    db: &AsyncDb,
    engine: &InvestmentEngine,
    batch_limit: u32,
) -> Result<SettleDueReport> {
    let tracker = JobTracker::start(db, "settlement").await?;
    match engine.settle_due(batch_limit).await {
        Ok(report) => {
            metrics::gauge!("hub_settlement_due_last_run").set(report.due as f64);
            tracker.success(Some(serde_json::to_value(report)?)).await?;
            Ok(report)
        }
        Err(err) => {
            let err = anyhow::Error::from(err).context("settlement sweep failed");
            tracker.fail(&err).await?;
            Err(err)
        }
    }
}
