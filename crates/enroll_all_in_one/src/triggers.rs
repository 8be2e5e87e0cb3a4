use anyhow::Context;
use async_trait::async_trait;
use enroll_common::domain::DomainResult;
use enroll_runner::AppProcess;
use enrollment_engine::mqtt::BrokerEndpoint;
use enrollment_engine::{ProcessorTrigger, TriggerSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answers whether the broker can currently be reached
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Opens a plain TCP connection to the broker's host and port
pub struct TcpReachabilityProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpReachabilityProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    pub fn for_broker(url: &str, timeout: Duration) -> DomainResult<Self> {
        let endpoint = BrokerEndpoint::parse(url)?;
        Ok(Self::new(endpoint.host, endpoint.port, timeout))
    }
}

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn is_reachable(&self) -> bool {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(host = %self.host, port = self.port, error = %e, "broker probe failed");
                false
            }
            Err(_) => {
                debug!(host = %self.host, port = self.port, "broker probe timed out");
                false
            }
        }
    }
}

/// Remembers the last probe result and reports unreachable -> reachable edges
#[derive(Debug, Default)]
struct ReachabilityTracker {
    last: Option<bool>,
}

impl ReachabilityTracker {
    /// True only when the broker was seen unreachable and is reachable now
    fn observe(&mut self, reachable: bool) -> bool {
        let regained = self.last == Some(false) && reachable;
        self.last = Some(reachable);
        regained
    }
}

/// Fires a queue pass whenever the broker comes back after being unreachable
pub struct ConnectivityWatcher {
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    trigger: ProcessorTrigger,
}

impl ConnectivityWatcher {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        trigger: ProcessorTrigger,
    ) -> Self {
        Self {
            probe,
            interval,
            trigger,
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tracker = ReachabilityTracker::default();

        info!(interval_secs = self.interval.as_secs(), "connectivity watcher started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("connectivity watcher stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let reachable = self.probe.is_reachable().await;
                    if tracker.observe(reachable) {
                        info!("broker reachable again, requesting queue pass");
                        self.trigger.fire(TriggerSource::NetworkReachable);
                    } else if !reachable {
                        debug!("broker unreachable");
                    }
                }
            }
        }
    }

    pub fn into_runner_process(self) -> AppProcess {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}

/// Maps SIGUSR1 from the host shell to a foreground trigger
pub struct ForegroundSignalListener {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
    trigger: ProcessorTrigger,
}

impl ForegroundSignalListener {
    /// Install the handler now so a signal sent before `run` is not lost
    pub fn bind(trigger: ProcessorTrigger) -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let signal = signal(SignalKind::user_defined1())
                .context("failed to install SIGUSR1 handler")?;
            Ok(Self { signal, trigger })
        }
        #[cfg(not(unix))]
        {
            warn!("foreground signal is only available on unix");
            Ok(Self { trigger })
        }
    }

    #[cfg(unix)]
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                received = self.signal.recv() => {
                    if received.is_none() {
                        warn!("SIGUSR1 stream closed");
                        return Ok(());
                    }
                    info!("application foregrounded, requesting queue pass");
                    self.trigger.fire(TriggerSource::Foregrounded);
                }
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        let _ = self.trigger;
        ctx.cancelled().await;
        Ok(())
    }

    pub fn into_runner_process(self) -> AppProcess {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}
