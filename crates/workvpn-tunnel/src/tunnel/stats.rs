//! Periodic counter sampling while a tunnel is up.

use crate::tunnel::backend::{EngineSample, StatisticsSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Samples a [`StatisticsSource`] on a fixed interval and forwards every
/// answered sample. Unanswered or failed samples are skipped, so the
/// receiver keeps whatever it last saw.
pub struct StatsPoller {
    task: JoinHandle<()>,
}

impl StatsPoller {
    pub fn spawn(
        source: Arc<dyn StatisticsSource>,
        interval: Duration,
        sink: mpsc::Sender<EngineSample>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; start one interval in.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match source.sample().await {
                    Ok(sample) if sample.counters.is_some() || sample.state_tag.is_some() => {
                        if sink.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => log::debug!("stats sample timed out, keeping last values"),
                    Err(e) => log::debug!("stats sample failed: {}", e),
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use workvpn_core::{TrafficCounters, VpnError, VpnResult};

    struct Counting {
        calls: AtomicU64,
        /// Every `fail_every`-th call errors.
        fail_every: u64,
    }

    #[async_trait]
    impl StatisticsSource for Counting {
        async fn sample(&self) -> VpnResult<EngineSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(VpnError::query_timeout("bytecount"));
            }
            Ok(EngineSample {
                counters: Some(TrafficCounters::new(n * 100, n * 10)),
                state_tag: Some("CONNECTED".into()),
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl StatisticsSource for Silent {
        async fn sample(&self) -> VpnResult<EngineSample> {
            Ok(EngineSample::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        let source = Arc::new(Counting {
            calls: AtomicU64::new(0),
            fail_every: 0,
        });
        let poller = StatsPoller::spawn(source, Duration::from_secs(1), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.counters, Some(TrafficCounters::new(100, 10)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.counters, Some(TrafficCounters::new(200, 20)));
        assert!(poller.is_running());
        poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_skipped() {
        let (tx, mut rx) = mpsc::channel(16);
        let source = Arc::new(Counting {
            calls: AtomicU64::new(0),
            fail_every: 2,
        });
        let _poller = StatsPoller::spawn(source, Duration::from_secs(1), tx);

        assert_eq!(
            rx.recv().await.unwrap().counters,
            Some(TrafficCounters::new(100, 10))
        );
        // call 2 fails; next delivered sample is call 3
        assert_eq!(
            rx.recv().await.unwrap().counters,
            Some(TrafficCounters::new(300, 30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_samples_are_not_forwarded() {
        let (tx, mut rx) = mpsc::channel(16);
        let _poller = StatsPoller::spawn(Arc::new(Silent), Duration::from_secs(1), tx);
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sink_closes() {
        let (tx, rx) = mpsc::channel(1);
        let poller = StatsPoller::spawn(
            Arc::new(Counting {
                calls: AtomicU64::new(0),
                fail_every: 0,
            }),
            Duration::from_secs(1),
            tx,
        );
        drop(rx);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!poller.is_running());
    }
}
