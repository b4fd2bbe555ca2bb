//! Process plumbing for the scanlink binaries: configuration, logging, the
//! dispatcher's console and image store, and the device's capture provider.

pub mod config;
pub mod console;
pub mod logging;
pub mod provider;
pub mod store;

/// Resolves on Ctrl+C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
