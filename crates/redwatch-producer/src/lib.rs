//! Producer loop: harvesting cycles at a fixed interval, one broker
//! connection per cycle, and a short cooldown after a failed cycle so a
//! broken source or broker never turns into a tight failure loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redwatch_core::RawNotice;
use redwatch_queue::NoticeSink;
use redwatch_source::NoticeSource;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "redwatch-producer";

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Gap between the end of one successful cycle and the start of the next.
    pub interval: Duration,
    /// Shorter fixed pause after a cycle that failed outright.
    pub cooldown: Duration,
}

impl ProducerConfig {
    pub fn from_env() -> Self {
        let interval_secs = std::env::var("SCRAPING_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);
        Self {
            interval: Duration::from_secs(interval_secs),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub harvested: usize,
    /// Records dropped for lacking a usable name.
    pub skipped: usize,
    pub published: usize,
}

pub struct Producer {
    source: Arc<dyn NoticeSource>,
    sink: Arc<dyn NoticeSink>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        source: Arc<dyn NoticeSource>,
        sink: Arc<dyn NoticeSink>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config,
        }
    }

    /// One harvesting cycle: collect a bounded batch, drop nameless
    /// records, and publish the rest through a connection the sink opens
    /// and closes within this call. An empty batch publishes nothing.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleSummary> {
        let batch = self.source.collect().await.context("collecting notices")?;
        let harvested = batch.len();
        let valid: Vec<RawNotice> = batch
            .into_iter()
            .filter(RawNotice::has_usable_name)
            .collect();
        let skipped = harvested - valid.len();
        if skipped > 0 {
            warn!(skipped, "dropped notices without a usable name");
        }

        if valid.is_empty() {
            warn!("no notices harvested this cycle");
            return Ok(CycleSummary {
                harvested,
                skipped,
                published: 0,
            });
        }

        let published = self
            .sink
            .publish_batch(&valid)
            .await
            .context("publishing notices")?;
        Ok(CycleSummary {
            harvested,
            skipped,
            published,
        })
    }

    /// Run cycles until `shutdown` fires. A failed cycle is logged and
    /// followed by the cooldown instead of the interval; it never escapes
    /// this loop.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "starting producer"
        );
        loop {
            let pause = match self.run_cycle().await {
                Ok(summary) => {
                    info!(
                        harvested = summary.harvested,
                        published = summary.published,
                        "cycle complete"
                    );
                    self.config.interval
                }
                Err(err) => {
                    error!(error = format!("{err:#}"), "cycle failed, cooling down");
                    self.config.cooldown
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, stopping producer");
                    break;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
        Ok(())
    }
}
