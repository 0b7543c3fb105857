// sqltap daemon entry point: wires an interceptor, the enrichment pipeline,
// and the fan-out broker together.
use anyhow::{Context, Result};
use sqltap_broker::Broker;
use sqltap_common::Event;
use sqltap_detect::Detector;
use sqltap_proxy::{mysql::MySqlProxy, postgres::PostgresProxy, ProxySettings};
use std::sync::Arc;
use tapd::config::{Driver, TapdConfig};
use tapd::{observability, pipeline};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<()> {
    let config = TapdConfig::from_env_or_yaml().context("load configuration")?;
    let prometheus = observability::init_observability();

    tracing::info!(
        driver = %config.driver,
        listen = %config.listen,
        upstream = %config.upstream,
        "starting sqltap"
    );

    let broker = Arc::new(Broker::new(config.broker_buffer));

    let detector = if config.nplus1_threshold > 0 {
        tracing::info!(
            threshold = config.nplus1_threshold,
            window_ms = config.nplus1_window.as_millis() as u64,
            cooldown_ms = config.nplus1_cooldown.as_millis() as u64,
            "n+1 detection enabled"
        );
        Some(Arc::new(Detector::new(
            config.nplus1_threshold,
            config.nplus1_window,
            config.nplus1_cooldown,
        )))
    } else {
        tracing::info!("n+1 detection disabled");
        None
    };
    if config.slow_threshold.is_zero() {
        tracing::info!("slow query detection disabled");
    } else {
        tracing::info!(
            threshold_ms = config.slow_threshold.as_millis() as u64,
            "slow query detection enabled"
        );
    }

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(prometheus, metrics_bind).await {
            tracing::warn!(error = %err, "metrics server exited");
        }
    });

    let (serve_task, events) = start_proxy(&config).await?;
    tokio::spawn(pipeline::run(
        events,
        Arc::clone(&broker),
        detector,
        config.slow_threshold,
    ));

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    serve_task.abort();
    tracing::info!("sqltap stopped");
    Ok(())
}

async fn start_proxy(config: &TapdConfig) -> Result<(JoinHandle<()>, mpsc::Receiver<Event>)> {
    let mut settings = ProxySettings::new(config.listen, config.upstream.clone());
    settings.event_queue_depth = config.event_queue_depth;
    settings.max_frame_bytes = config.max_frame_bytes;

    match config.driver {
        Driver::Postgres => {
            let (proxy, events) = PostgresProxy::bind(settings)
                .await
                .context("bind postgres proxy")?;
            let handle = tokio::spawn(async move {
                if let Err(err) = proxy.serve().await {
                    tracing::warn!(error = %err, "proxy accept loop exited");
                }
            });
            Ok((handle, events))
        }
        Driver::Mysql | Driver::Tidb => {
            let (proxy, events) = MySqlProxy::bind(settings)
                .await
                .context("bind mysql proxy")?;
            let handle = tokio::spawn(async move {
                if let Err(err) = proxy.serve().await {
                    tracing::warn!(error = %err, "proxy accept loop exited");
                }
            });
            Ok((handle, events))
        }
    }
}
