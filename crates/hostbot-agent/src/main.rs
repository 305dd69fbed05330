use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod config;
mod error;
mod gate;
mod keys;
mod ledger;
mod logfile;
mod notify;
mod render;
mod restart;
mod store;
mod supervisor;
mod telegram;

/// Stderr always; plus a daily rolling file when `HOSTBOT_SERVICE_LOG_DIR` is
/// set. The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = std::env::var("HOSTBOT_SERVICE_LOG_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hostbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = config::Config::from_env()?;
    let stop_on_exit = config.stop_on_exit;
    let client = telegram::TelegramClient::new(&config.telegram_api, &config.bot_token)?;

    let (outbox, notices) = notify::Outbox::channel();
    let app = app::App::open(config, outbox).await?;
    tracing::info!(
        owner_id = app.config.owner_id,
        version = env!("CARGO_PKG_VERSION"),
        "hostbot starting"
    );

    let result = tokio::select! {
        res = telegram::run(app.clone(), client, notices) => res,
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    app.supervisor.shutdown(stop_on_exit).await;
    if let Err(e) = &result {
        tracing::error!(error = %error::format_error_chain(e), "hostbot stopped");
    }
    result
}
