//! Hirewire Watch
//!
//! Terminal notification watcher. Logs in from the environment, prints a
//! summary on every change and reads one-letter commands from stdin.

mod render;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use hirewire_client::{
    HttpBackend, NotificationRuntime, StaticIdentity, SurfaceAdapter, SurfaceRole, WsTransport,
};
use hirewire_core::{ConfigError, NotifyConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let role = role_from_env();
    let identity = identity_from_env();

    let backend = Arc::new(HttpBackend::new(&config.service)?);
    let transport = Arc::new(WsTransport::new(config.service.push_url.clone()));
    let handle = NotificationRuntime::spawn(config, backend, transport);

    let mut adapter = SurfaceAdapter::new(role, handle.clone());
    adapter
        .on_render(move |snapshot| render::print_summary(role, snapshot))
        .await;

    if handle.initialize_from(&identity).await?.is_none() {
        tracing::warn!("HIREWIRE_USER_ID and HIREWIRE_TOKEN must both be set");
        handle.shutdown();
        return Ok(());
    }

    println!("{}", render::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match line.trim() {
                    "o" => {
                        if let Some(notice) = adapter.open_panel().await {
                            println!("! {}", notice);
                        }
                    }
                    "r" => handle.refresh()?,
                    "l" => render::print_panel(&adapter.panel_items(20)),
                    "q" => break,
                    "" => {}
                    other => println!("unknown command {:?}\n{}", other, render::HELP),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    adapter.detach();
    handle.teardown().await?;
    handle.shutdown();
    Ok(())
}

/// Config file plus environment overrides
fn load_config() -> Result<NotifyConfig, ConfigError> {
    let mut config = NotifyConfig::load_standard()?;
    if let Ok(url) = std::env::var("HIREWIRE_BASE_URL") {
        config.service.base_url = url;
    }
    if let Ok(url) = std::env::var("HIREWIRE_PUSH_URL") {
        config.service.push_url = url;
    }
    config.validate()?;
    Ok(config)
}

fn identity_from_env() -> StaticIdentity {
    match (
        std::env::var("HIREWIRE_USER_ID"),
        std::env::var("HIREWIRE_TOKEN"),
    ) {
        (Ok(user), Ok(token)) => StaticIdentity::new(user, token),
        _ => StaticIdentity::anonymous(),
    }
}

fn role_from_env() -> SurfaceRole {
    match std::env::var("HIREWIRE_ROLE").as_deref() {
        Ok("freelancer") => SurfaceRole::Freelancer,
        Ok("admin") => SurfaceRole::Admin,
        _ => SurfaceRole::Client,
    }
}
