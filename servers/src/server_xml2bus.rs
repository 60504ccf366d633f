//! # XML to Bus Bridge Server
//!
//! Accepts connections from the hospital paging system, which sends its
//! pages as a continuous XML stream, and republishes every page as an
//! `"<identifier>;<text>"` entry on a Redis stream.
//!
//! ## Functionality:
//! - **XML Listener**: Binds the configured TCP port and runs one session per
//!   upstream connection (see `lib_xml2bus::ingestors`).
//! - **Liveness Probes**: Answers the paging system's `___PING___` pages with
//!   the acknowledgement it expects.
//! - **Publisher**: Drains the hand-off queue into the bus, retrying through
//!   bus outages. Without a bus URL records are only logged.
//! - **Admin Server**: `/`, `/health` and `/status` over HTTP.
//! - **Graceful Shutdown**: `tokio-graceful` coordinates all tasks on
//!   Ctrl+C/SIGTERM, or when the listener fails under the strict accept policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use static_init::dynamic;
use tokio::sync::oneshot;
use tokio_graceful::Shutdown;
use tracing::{error, info};

use lib_xml2bus::core::{HandoffQueue, DEFAULT_QUEUE_CAPACITY};
use lib_xml2bus::ingestors::{XmlListener, DEFAULT_XML_PORT};

mod xml2bus_logic;

use xml2bus_logic::admin::{self, AdminState};
use xml2bus_logic::config::load_config;
use xml2bus_logic::logger::setup_logging;
use xml2bus_logic::publisher::{self, LogSink, RedisStreamSink, StreamIdentity};

// load .env files before anything else
#[dynamic]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("failed to load configuration")?;

    let log_dir = config.log_dir.clone().unwrap_or_else(|| "./logs".into());
    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_dir, &log_level)?;

    let queue_capacity = config.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
    let overflow_policy = config.overflow_policy.unwrap_or_default();
    let queue = Arc::new(
        HandoffQueue::new(queue_capacity, overflow_policy).context("invalid hand-off queue settings")?,
    );
    info!("Hand-off queue: capacity {}, overflow policy {}", queue_capacity, overflow_policy);

    let xml_addr = config.xml_addr();
    let listener = XmlListener::bind(
        &xml_addr,
        Arc::clone(&queue),
        config.session_config(),
        config.accept_errors.unwrap_or_default(),
    )
    .await
    .context("cannot start the XML listener")?;
    info!("Listening for XML paging connections on {}", listener.local_addr()?);

    // Fired by the listener when it stops on its own, which only happens on a fatal error.
    let (fatal_tx, fatal_rx) = oneshot::channel::<()>();
    let shutdown = Shutdown::new(async move {
        tokio::select! {
            _ = tokio_graceful::default_signal() => {}
            _ = fatal_rx => {}
        }
    });

    let admin_state = AdminState {
        xml_port: config.xml_port.unwrap_or(DEFAULT_XML_PORT),
        queue: Arc::clone(&queue),
    };
    let http_port = config.http_port.unwrap_or(80);
    shutdown.spawn_task_fn(move |guard| admin::run(http_port, admin_state, guard));

    let retry_delay = config.reconnect_delay();
    let identity = StreamIdentity {
        subject: config.subject.clone().unwrap_or_default(),
        cluster_id: config.cluster_id.clone().unwrap_or_default(),
        client_id: config.client_id.clone().unwrap_or_default(),
    };
    match config.bus_url.as_deref() {
        Some(url) => {
            let sink = RedisStreamSink::new(url, identity, config.async_publish.unwrap_or(false))?;
            let queue = Arc::clone(&queue);
            shutdown.spawn_task_fn(move |guard| publisher::run(queue, sink, retry_delay, guard));
        }
        None => {
            info!("No bus URL configured, records are logged only");
            let sink = LogSink::new(identity.subject);
            let queue = Arc::clone(&queue);
            shutdown.spawn_task_fn(move |guard| publisher::run(queue, sink, retry_delay, guard));
        }
    }

    let listener_task = shutdown.spawn_task_fn(move |guard| async move {
        let result = listener.serve_until(async move { guard.cancelled().await }).await;
        if result.is_err() {
            let _ = fatal_tx.send(());
        }
        result
    });

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    if listener_task.is_finished() {
        if let Ok(Err(e)) = listener_task.await {
            error!("XML listener failed: {}", e);
            return Err(e).context("XML listener stopped");
        }
    }

    info!("Bye!");
    Ok(())
}
