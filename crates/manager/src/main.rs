use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use fleet_kubehub::{KubeConnector, KubeLeaseStore, KubeStatusWriter, KubeWatchSource, KubeconfigSecretResolver};
use fleet_leader::{LeaderConfig, LeaderCoordinator};
use fleet_orchestrator::{remote_indexes, Concurrency, FeatureGates, ManagerConfig, Orchestrator};
use fleet_tracker::{ConnectionTracker, TrackerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LEASE_NAME: &str = "fleet-controller-leader-election";

#[derive(Parser, Debug)]
#[command(name = "fleet-manager", version, about = "Fleet controller manager")]
struct Cli {
    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-bind-addr", env = "FLEET_METRICS_ADDR")]
    metrics_bind_addr: Option<String>,

    /// Run controllers only while holding the leader lease
    #[arg(long = "leader-elect", env = "FLEET_LEADER_ELECT", action = ArgAction::SetTrue)]
    leader_elect: bool,

    #[arg(long = "leader-elect-lease-duration", default_value = "15s", value_parser = parse_duration)]
    lease_duration: Duration,

    #[arg(long = "leader-elect-renew-deadline", default_value = "10s", value_parser = parse_duration)]
    renew_deadline: Duration,

    #[arg(long = "leader-elect-retry-period", default_value = "2s", value_parser = parse_duration)]
    retry_period: Duration,

    /// Namespace holding the leader lease
    #[arg(long = "leader-elect-namespace", env = "POD_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    /// Holder identity; defaults to <hostname>_<uuid>
    #[arg(long = "identity", env = "FLEET_IDENTITY")]
    identity: Option<String>,

    /// Watch only this namespace (default: all)
    #[arg(long = "namespace", env = "FLEET_NAMESPACE")]
    namespace: Option<String>,

    /// Only process objects whose watch-filter label has this value
    #[arg(long = "watch-filter", env = "FLEET_WATCH_FILTER")]
    watch_filter: Option<String>,

    /// Periodic resync of every cached object
    #[arg(long = "sync-period", default_value = "10m", value_parser = parse_duration)]
    sync_period: Duration,

    /// e.g. MachinePool=true,ClusterResourceSet=false
    #[arg(long = "feature-gates", env = "FLEET_FEATURE_GATES", default_value = "")]
    feature_gates: FeatureGates,

    #[arg(long = "cluster-concurrency", default_value_t = 10)]
    cluster_concurrency: usize,
    #[arg(long = "machine-concurrency", default_value_t = 10)]
    machine_concurrency: usize,
    #[arg(long = "machineset-concurrency", default_value_t = 10)]
    machine_set_concurrency: usize,
    #[arg(long = "machinedeployment-concurrency", default_value_t = 10)]
    machine_deployment_concurrency: usize,
    #[arg(long = "machinepool-concurrency", default_value_t = 10)]
    machine_pool_concurrency: usize,
    #[arg(long = "clusterresourceset-concurrency", default_value_t = 10)]
    cluster_resource_set_concurrency: usize,
    #[arg(long = "machinehealthcheck-concurrency", default_value_t = 10)]
    machine_health_check_concurrency: usize,

    /// Budget for a remote cache's first listing
    #[arg(long = "remote-startup-timeout", default_value = "30s", value_parser = parse_duration)]
    remote_startup_timeout: Duration,

    #[arg(long = "remote-health-interval", default_value = "10s", value_parser = parse_duration)]
    remote_health_interval: Duration,

    /// Consecutive failed probes before a remote connection is dropped
    #[arg(long = "remote-failure-threshold", default_value_t = 3)]
    remote_failure_threshold: u32,

    #[arg(long = "webhook-port", default_value_t = 9443)]
    webhook_port: u16,
}

/// `250ms`, `15s`, `10m`, `1h`; a bare number is seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n = u64::from_str(num).map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = |per: u64| n.checked_mul(per).map(Duration::from_secs).ok_or_else(|| format!("duration {s:?} is too large"));
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => secs(60),
        "h" => secs(3600),
        other => Err(format!("unknown duration unit {other:?} in {s:?}")),
    }
}

impl Cli {
    fn identity(&self) -> String {
        if let Some(id) = self.identity.as_ref().filter(|s| !s.is_empty()) {
            return id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "fleet-manager".to_string());
        format!("{}_{}", host, uuid::Uuid::new_v4())
    }

    fn manager_config(&self) -> Result<ManagerConfig> {
        if self.leader_elect && self.renew_deadline >= self.lease_duration {
            anyhow::bail!(
                "--leader-elect-renew-deadline ({:?}) must be shorter than --leader-elect-lease-duration ({:?})",
                self.renew_deadline,
                self.lease_duration
            );
        }
        let leader = self.leader_elect.then(|| LeaderConfig {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            ..LeaderConfig::new(LEASE_NAME, &self.lease_namespace, &self.identity())
        });
        Ok(ManagerConfig {
            namespace: self.namespace.clone().filter(|s| !s.is_empty()),
            watch_filter: self.watch_filter.clone().filter(|s| !s.is_empty()),
            sync_period: self.sync_period,
            concurrency: Concurrency {
                cluster: self.cluster_concurrency,
                machine: self.machine_concurrency,
                machine_set: self.machine_set_concurrency,
                machine_deployment: self.machine_deployment_concurrency,
                machine_pool: self.machine_pool_concurrency,
                cluster_resource_set: self.cluster_resource_set_concurrency,
                machine_health_check: self.machine_health_check_concurrency,
            },
            gates: self.feature_gates,
            leader,
            tracker: TrackerConfig {
                startup_timeout: self.remote_startup_timeout,
                health_interval: self.remote_health_interval,
                failure_threshold: self.remote_failure_threshold.max(1),
                ..TrackerConfig::default()
            },
            webhook_port: self.webhook_port,
            ..ManagerConfig::default()
        })
    }
}

fn init_tracing() {
    let env = std::env::var("FLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr.filter(|a| !a.is_empty()) else { return };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        },
        Err(_) => warn!(addr = %addr, "invalid metrics bind address; expected host:port"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.manager_config()?;
    info!(config = %serde_json::to_string(&config)?, "starting manager");

    let client = fleet_kubehub::local_client().await?;
    let root = CancellationToken::new();
    let tracker = ConnectionTracker::new(
        Arc::new(KubeconfigSecretResolver::new(client.clone())),
        KubeConnector::default(),
        config.tracker.clone(),
        remote_indexes(),
        &root,
    );
    let source = KubeWatchSource::new(client.clone())
        .namespace(config.namespace.clone())
        .label_selector(config.label_selector());
    let mut orchestrator =
        Orchestrator::new(config.clone(), Arc::new(source), tracker, Arc::new(KubeStatusWriter::new(client.clone())));
    if let Some(leader) = &config.leader {
        let store = KubeLeaseStore::new(client.clone(), &leader.namespace);
        info!(identity = %leader.identity, lease = %leader.lease_name, namespace = %leader.namespace, "leader election enabled");
        orchestrator = orchestrator.with_leader(LeaderCoordinator::new(Arc::new(store), leader.clone()));
    }
    info!(controllers = ?orchestrator.enabled_controllers(), "controller table");

    let shutdown = root.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        shutdown.cancel();
    });
    orchestrator.run(root).await.context("running manager")
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_bind_addr.as_deref());
    match run(cli).await {
        Ok(()) => {
            info!("manager exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "manager failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_common_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("15s"), Ok(Duration::from_secs(15)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("2"), Ok(Duration::from_secs(2)));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = parse_duration(&format!("{}h", u64::MAX / 60)).unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert_eq!(parse_duration(&format!("{}s", u64::MAX)), Ok(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn flags_become_manager_config() {
        let cli = Cli::try_parse_from([
            "fleet-manager",
            "--leader-elect",
            "--identity",
            "pod-a",
            "--machine-concurrency",
            "4",
            "--feature-gates",
            "MachinePool=true",
            "--watch-filter",
            "team-a",
        ])
        .unwrap();
        let cfg = cli.manager_config().unwrap();
        let leader = cfg.leader.unwrap();
        assert_eq!(leader.identity, "pod-a");
        assert_eq!(leader.lease_duration, Duration::from_secs(15));
        assert_eq!(cfg.concurrency.machine, 4);
        assert!(cfg.gates.machine_pool);
        assert_eq!(cfg.sync_period, Duration::from_secs(600));
        assert_eq!(cfg.watch_filter.as_deref(), Some("team-a"));
    }

    #[test]
    fn leader_election_is_off_by_default() {
        let cli = Cli::try_parse_from(["fleet-manager"]).unwrap();
        let cfg = cli.manager_config().unwrap();
        assert!(cfg.leader.is_none());
        assert_eq!(cfg.webhook_port, 9443);
        assert_eq!(cfg.gates, FeatureGates::default());
    }

    #[test]
    fn renew_deadline_must_fit_in_lease() {
        let cli = Cli::try_parse_from(["fleet-manager", "--leader-elect", "--leader-elect-renew-deadline", "20s"]).unwrap();
        assert!(cli.manager_config().is_err());
        assert!(Cli::try_parse_from(["fleet-manager", "--feature-gates", "Bogus=true"]).is_err());
    }
}
