use std::error::Error;
use std::path::PathBuf;

use egress_guard::config::EgressConfig;
use egress_guard::policy::{ContainerPolicy, EgressMode};
use egress_guard::{logging, EgressSystem};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => EgressConfig::load(&path)?,
        None => EgressConfig::default(),
    };
    logging::init(&config.logging)?;

    let system = EgressSystem::builder(config.clone()).build()?;
    info!(default_mode = %config.policy.default_mode, "configuration loaded");

    println!("egress-guard {}", env!("CARGO_PKG_VERSION"));
    for mode in EgressMode::ALL {
        let policy = ContainerPolicy::derive(mode, &config.policy);
        println!(
            "  {:<9} dns={:<15} proxy_required={:<5} tor_required={:<5} speculative={:<5} https_upgrade={:<5} ice_relay_only={}",
            mode.to_string(),
            policy.dns_strategy.to_string(),
            policy.proxy_required,
            policy.tor_required,
            policy.speculative_connections_allowed,
            policy.https_upgrade,
            policy.ice_relay_only,
        );
    }
    let transports: Vec<String> = config.tor.transport_preference.iter().map(ToString::to_string).collect();
    println!("  tor transports: {}", transports.join(", "));

    system.shutdown().await;
    Ok(())
}
