use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use daybook::config::Settings;
use daybook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use daybook::sink::LogSink;
use daybook::tenant::TenantManager;
use daybook::wire;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves on ctrl-c, or SIGTERM where the platform has it.
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
            Err(e) => warn!("SIGTERM unavailable ({e}); stopping on ctrl-c only"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}

/// Wait until every connection permit is back or the timeout passes.
async fn drain(semaphore: &Semaphore, max_connections: usize) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while semaphore.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let open = max_connections - semaphore.available_permits();
            warn!("gave up waiting on {open} open connections");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("no connections left open");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    daybook::observability::init(settings.metrics_port)?;
    let tls_acceptor = daybook::tls::load_tls_acceptor(&settings)?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let max_connections = settings.max_connections;
    let tenant_manager = Arc::new(TenantManager::new(
        settings.data_dir.clone(),
        settings.compact_threshold,
        settings.tenant.clone(),
        Arc::new(LogSink),
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    let jobs = &settings.tenant.jobs;
    info!(
        data_dir = %settings.data_dir.display(),
        max_connections,
        tls = tls_acceptor.is_some(),
        metrics_port = ?settings.metrics_port,
        "daybook listening on {addr}"
    );
    info!(
        "daily jobs at {:02}:00, UTC{:+} min, locale {}",
        jobs.run_at_hour, jobs.utc_offset_minutes, jobs.locale
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("shutting down, no new connections");
                break;
            }
        };

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("{peer} turned away, {max_connections} connections already open");
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        info!("accepted {peer}");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let tenants = tenant_manager.clone();
        let password = settings.password.clone();
        let tls = tls_acceptor.clone();

        tokio::spawn(async move {
            if let Err(e) = wire::process_connection(socket, tenants, password, tls).await {
                error!("{peer}: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }

    drain(&semaphore, max_connections).await;
    info!("daybook stopped");
    Ok(())
}
