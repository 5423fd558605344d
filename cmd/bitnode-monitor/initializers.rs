use std::{io::IsTerminal, sync::Arc, time::Duration};

use bitnode_watchdog::{
    alerter::{LogNotifier, MAX_POLL_TIMEOUT_SECS, Notifier, TelegramAlerter},
    audit::AuditLog,
    collector::{
        Collector, GatewayJournal, GatewaySources, HostMetrics, JournalCounter, NodeRpc,
        SystemdUnit,
    },
    commands::{CommandContext, run_command_loop},
    config::MonitorConfig,
    miner::{MinerClient, MinerWatch},
    recovery::{DEFAULT_ACTION_TIMEOUT, RecoveryGate},
    regression::RegressionEstimator,
    router::AlertRouter,
    service::{Dispatcher, StallRecovery, run_main_loop, run_miner_loop},
    service_control::{CorrectiveAction, SystemdRestart},
    sources::{MinerSource, bounded},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, filter::Directive};

use crate::cli::{LogColor, Options};


pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => std::io::stdout().is_terminal(),
    };

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_target(include_target)
        .with_ansi(use_color)
        .init();
}

fn init_notifier(config: &MonitorConfig) -> (Arc<dyn Notifier>, Option<TelegramAlerter>) {
    match config.telegram() {
        Some((token, chat_id)) => {
            let alerter = TelegramAlerter::new(token, chat_id);
            (Arc::new(alerter.clone()), Some(alerter))
        }
        None => {
            warn!("telegram disabled, alerts go to the log and the audit file only");
            (Arc::new(LogNotifier), None)
        }
    }
}

fn init_node(config: &MonitorConfig) -> eyre::Result<Arc<NodeRpc>> {
    let node = NodeRpc::new(config.node_rpc_url.clone(), config.source_timeout)?;
    let node = match (&config.node_rpc_user, &config.node_rpc_password) {
        (Some(user), Some(password)) => node.with_credentials(user.clone(), password.clone()),
        _ => node,
    };
    Ok(Arc::new(node))
}

fn init_gateway(config: &MonitorConfig) -> eyre::Result<Option<GatewaySources>> {
    let Some(unit) = &config.gateway_unit else {
        return Ok(None);
    };
    let systemd = Arc::new(SystemdUnit::new(unit.clone(), config.source_timeout));
    Ok(Some(GatewaySources {
        health: systemd.clone(),
        jobs: Arc::new(GatewayJournal::new(unit.clone(), config.source_timeout)?),
        diagnostics: systemd,
    }))
}

/// Wires every collaborator from `config`, spawns the loops and waits for
/// ctrl-c.
pub async fn run_monitor(config: MonitorConfig) -> eyre::Result<()> {
    config.validate()?;

    let node = init_node(&config)?;
    // Without the node there is nothing to compare the indexer against.
    let tip = bounded(config.source_timeout, node.block_count())
        .await
        .map_err(|error| {
            eyre::eyre!("node RPC at {} is unreachable: {error}", config.node_rpc_url)
        })?;
    info!(tip, url = %config.node_rpc_url, "node RPC reachable");

    let audit = Arc::new(AuditLog::new(config.audit_log_path.clone()));
    let (notifier, telegram) = init_notifier(&config);
    let dispatcher = Dispatcher::new(audit.clone(), notifier.clone());

    let indexer = JournalCounter::new(
        config.indexer_unit.clone(),
        &config.indexer_height_pattern,
        config.source_timeout,
    )?
    .with_lines(config.indexer_journal_lines);
    let metrics = Arc::new(HostMetrics::new(
        config.hwmon_root.clone(),
        config.disk_mount.clone(),
    ));
    let gateway = init_gateway(&config)?;

    let mut collector = Collector::new(
        node.clone(),
        Arc::new(indexer),
        metrics.clone(),
        config.source_timeout,
    );
    if let Some(gateway) = &gateway {
        collector = collector.with_gateway(gateway.clone());
    }

    let restart: Arc<dyn CorrectiveAction> =
        Arc::new(SystemdRestart::new(DEFAULT_ACTION_TIMEOUT));
    let gate = RecoveryGate::new(
        config.auto_recovery_enabled,
        config.min_recovery_interval,
        config.dependency_latency_threshold,
        config.probe_timeout,
    );
    let auto_recovery = gate.enabled_flag();
    let recovery = StallRecovery {
        gate,
        probe: node.clone(),
        action: restart.clone(),
        target: config.indexer_unit.clone(),
    };

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(run_main_loop(
        collector,
        AlertRouter::new(&config),
        Some(recovery),
        dispatcher.clone(),
        config.check_interval,
        cancel.clone(),
    ));

    let miner: Option<Arc<dyn MinerSource>> = match &config.miner_url {
        Some(url) => {
            let client: Arc<dyn MinerSource> =
                Arc::new(MinerClient::new(url, config.source_timeout)?);
            tracker.spawn(run_miner_loop(
                client.clone(),
                MinerWatch::new(url, &config),
                dispatcher.clone(),
                config.miner_poll_interval,
                config.source_timeout,
                cancel.clone(),
            ));
            Some(client)
        }
        None => None,
    };

    if let Some(telegram) = telegram {
        let context = CommandContext {
            audit: audit.clone(),
            node: node.clone(),
            metrics,
            gateway,
            miner,
            restart,
            indexer_unit: config.indexer_unit.clone(),
            node_unit: config.node_unit.clone(),
            auto_recovery,
            cpu_threshold: config.cpu_alert_threshold,
            ram_threshold: config.ram_alert_threshold,
            temp_threshold: config.temp_alert_threshold,
            read_timeout: config.source_timeout,
            estimator: RegressionEstimator::default(),
        };
        tracker.spawn(run_command_loop(
            telegram.inbox(MAX_POLL_TIMEOUT_SECS),
            context,
            notifier.clone(),
            cancel.clone(),
        ));
    }
    tracker.close();

    audit.append(&format!(
        "[START] monitor started, check every {}s, auto-restart {}",
        config.check_interval.as_secs(),
        if config.auto_recovery_enabled { "on" } else { "off" }
    ));

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");

    cancel.cancel();
    // A tick blocked on a slow source is bounded by its own timeouts.
    if tokio::time::timeout(shutdown_grace(&config), tracker.wait())
        .await
        .is_err()
    {
        warn!("loops did not stop in time, exiting anyway");
    }
    audit.append("[STOP] monitor stopped");
    Ok(())
}

fn shutdown_grace(config: &MonitorConfig) -> Duration {
    config.probe_timeout + DEFAULT_ACTION_TIMEOUT
}
