use crate::config::SensorsConfig;
use crate::hardware::{BulkEndpoint, ReadyGuard, ReadyLine, TransferStatus};
use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorSummary {
    pub bytes_written: u64,
    pub transfers_completed: u64,
    pub transfers_dropped: u64,
}

/// Streams a sensor device's bulk endpoint into one timestamped
/// append-only file, pipelining a fixed pool of in-flight reads. The
/// ready line is asserted for the duration of the capture; the device
/// enable/disable control transfer is sent exactly once each, the disable
/// on every exit path.
pub struct SensorRecorder {
    cfg: SensorsConfig,
}

impl SensorRecorder {
    pub fn new(cfg: SensorsConfig) -> Self {
        SensorRecorder { cfg }
    }

    /// Output path for a capture started at `start_time` (UNIX seconds).
    pub fn output_path(&self, start_time: f64) -> PathBuf {
        self.cfg.output_dir.join(format!("{start_time:.3}_sensors.dat"))
    }

    pub async fn run<E, L>(
        &self,
        endpoint: E,
        line: Option<L>,
        start_time: f64,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SensorSummary>
    where
        E: BulkEndpoint,
        L: ReadyLine,
    {
        tokio::fs::create_dir_all(&self.cfg.output_dir)
            .await
            .with_context(|| format!("creating output dir {}", self.cfg.output_dir.display()))?;

        // Asserted for as long as the stream is live; dropped (deasserted)
        // when this function returns, error paths included.
        let ready = match line {
            Some(line) => {
                let mut guard = ReadyGuard::acquire(line)?;
                guard.assert()?;
                Some(guard)
            }
            None => None,
        };

        let path = self.output_path(start_time);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        tracing::info!("recording sensor stream to {}", path.display());

        let result = self.stream_loop(&endpoint, file, shutdown).await;

        // The disable control transfer is owed to the device no matter how
        // the loop ended.
        if let Err(e) = endpoint.set_streaming(false).await {
            tracing::warn!("disable control transfer failed: {e:#}");
        }
        drop(ready);

        result
    }

    async fn stream_loop<E: BulkEndpoint>(
        &self,
        endpoint: &E,
        mut file: tokio::fs::File,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SensorSummary> {
        let mut summary = SensorSummary::default();
        let mut stopping = false;

        // Steady-state pipeline: keep transfer_count reads in flight and
        // resubmit each slot as it completes.
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..self.cfg.transfer_count {
            in_flight.push(endpoint.read(self.cfg.buffer_size));
        }

        endpoint.set_streaming(true).await.context("enable control transfer")?;

        tokio::pin!(shutdown);
        loop {
            let status = tokio::select! {
                // Stop requests take priority over completions so that a
                // stop observed between completions halts resubmission.
                biased;
                _ = &mut shutdown, if !stopping => {
                    tracing::info!("stop requested, draining {} transfers", in_flight.len());
                    stopping = true;
                    continue;
                }
                status = in_flight.next() => match status {
                    Some(status) => status,
                    // Nothing left in flight: the pipeline has drained.
                    None => break,
                },
            };

            match status {
                TransferStatus::Completed(data) => {
                    summary.transfers_completed += 1;
                    summary.bytes_written += data.len() as u64;
                    // Arrival order is file order; this loop is the only
                    // writer of the handle.
                    file.write_all(&data).await?;
                    if !stopping {
                        in_flight.push(endpoint.read(self.cfg.buffer_size));
                    }
                }
                TransferStatus::Cancelled => {
                    summary.transfers_dropped += 1;
                }
                TransferStatus::Failed(reason) => {
                    summary.transfers_dropped += 1;
                    tracing::warn!("transfer failed, buffer dropped: {reason}");
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        tracing::info!(
            "sensor stream closed: {} bytes, {} transfers ({} dropped)",
            summary.bytes_written,
            summary.transfers_completed,
            summary.transfers_dropped
        );
        Ok(summary)
    }
}
