use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ocrflow_core::app::PipelineBuilder;
use ocrflow_core::config::OcrflowConfig;
use ocrflow_core::domain::{JobId, JobState, OcrError, Priority, QueueEvent, Submission};
use ocrflow_core::impls::{FileStore, InMemoryStore, ScriptStep, ScriptedBackend, TracingSink};
use ocrflow_core::polling::PollingConfig;
use ocrflow_core::ports::DurableStore;

const RECEIPT: &str = "GREEN GROCER\n\
    Apples 3.20\n\
    Oat milk 2.49\n\
    SUBTOTAL 5.69\n\
    TAX 0.46\n\
    TOTAL 6.15\n\
    VISA 6.15\n\
    Thank you for shopping";

const W4: &str = "Form W-4 (2024)\n\
    Employee's Withholding Certificate\n\
    Name: Alex Morgan\n\
    SSN 987-65-4321\n\
    [x] Single or Married filing separately\n\
    Step 3: Claim dependents  $2,000\n\
    Step 4(c) Extra withholding  25.00";

/// 引数なしで動かすときの設定（間隔を短くしてすぐ終わるように）
fn demo_config() -> OcrflowConfig {
    let mut config = OcrflowConfig::default();
    config.polling = PollingConfig::fixed(Duration::from_millis(100), Duration::from_secs(10));
    config.retry.base_delay_ms = 200;
    config.queue.housekeeping_interval_ms = 100;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) 設定: 第 1 引数の JSON ファイル、第 2 引数はデータディレクトリ
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading config {path}"))?;
            OcrflowConfig::from_json(&json).with_context(|| format!("parsing config {path}"))?
        }
        None => demo_config(),
    };
    let store: Arc<dyn DurableStore> = match args.next() {
        Some(dir) => Arc::new(FileStore::new(dir)),
        None => Arc::new(InMemoryStore::new()),
    };

    // (B) 台本つきのバックエンド（最初の submit だけ一時的に失敗させる）
    let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(20)));
    backend
        .fail_next_submits(OcrError::Network("connection reset by peer".into()), 1)
        .await;
    backend
        .push_status_script(vec![
            ScriptStep::Queued { position: 2 },
            ScriptStep::Processing { percent: 40 },
            ScriptStep::Processing { percent: 80 },
            ScriptStep::CompleteEcho,
        ])
        .await;

    // (C) キューを構築して起動
    let queue = PipelineBuilder::new()
        .with_config(config)
        .backend(backend.clone())
        .store(store)
        .sink(Arc::new(TracingSink))
        .with_builtin_processors()
        .expect_processors(&["receipt", "w4"])
        .build()
        .await?;
    let restored = queue.restore().await?;
    if restored.jobs > 0 {
        info!(?restored, "resumed previous run");
    }
    let mut events = queue.subscribe();
    queue.start().await?;

    // (D) 投入
    let receipt = queue
        .enqueue(Submission::new(RECEIPT.as_bytes().to_vec()), Priority::Normal)
        .await?;
    let w4 = queue
        .enqueue(
            Submission::new(W4.as_bytes().to_vec()).with_document_type("w4"),
            Priority::High,
        )
        .await?;
    let mut pending: HashSet<JobId> = [receipt, w4].into_iter().collect();

    // (E) 完了（または再試行されない失敗）まで通知を待つ
    let wait = async {
        while !pending.is_empty() {
            match events.recv().await {
                Ok(QueueEvent::JobCompleted { job }) => {
                    let extraction = job
                        .extraction
                        .as_ref()
                        .map(serde_json::to_string_pretty)
                        .transpose()?;
                    println!(
                        "completed {} (retries={}, cached={}):\n{}",
                        job.job_id,
                        job.retry_count,
                        job.served_from_cache,
                        extraction.unwrap_or_else(|| "<no extraction>".into())
                    );
                    pending.remove(&job.job_id);
                }
                Ok(QueueEvent::JobStateChanged {
                    job,
                    to: JobState::Failed,
                    ..
                }) if job.last_error.as_ref().is_some_and(|e| !e.retryable) => {
                    println!("failed {}: {:?}", job.job_id, job.last_error);
                    pending.remove(&job.job_id);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event receiver lagged"),
                Err(RecvError::Closed) => break,
            }
        }
        Ok::<_, anyhow::Error>(())
    };
    tokio::select! {
        result = wait => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // (F) 統計を出して停止
    println!("counts: {:?}", queue.counts().await);
    println!(
        "statistics: {}",
        serde_json::to_string_pretty(&queue.statistics())?
    );
    println!(
        "cache: {}",
        serde_json::to_string_pretty(&queue.cache().stats().await)?
    );
    println!("backend submits: {}", backend.submit_count());
    queue.stop().await?;
    Ok(())
}
