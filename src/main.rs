// src/main.rs
//!
//! Runs three independent workers: the chat-bridge poller, the mesh
//! captain HTTP server (when `mesh_role = "captain"`), and the LLM proxy
//! listener. Each is its own `tokio::task`; none share an arena.

use std::sync::Arc;

use log::{error, info, warn};

use coreagent::config::AgentConfig;
use coreagent::event::NoopEventHandler;
use coreagent::mesh::{token, Captain, Crew};
use coreagent::proxy::Proxy;
use coreagent::store::InMemoryStore;
use coreagent::tools::builtin::{CalculatorTool, EchoTool, MemoryTool};
use coreagent::tools::ToolRegistry;

fn build_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new(16);
    registry
        .register("echo", "Returns its argument unchanged.", Arc::new(EchoTool))
        .expect("echo tool registration");
    registry
        .register(
            "calculator",
            "Evaluates a basic arithmetic expression (+-*/, parens, unary minus).",
            Arc::new(CalculatorTool),
        )
        .expect("calculator tool registration");
    registry
        .register(
            "memory",
            "PUT/GET/DELETE against a process-local key-value store.",
            Arc::new(MemoryTool::new()),
        )
        .expect("memory tool registration");
    registry.close_static_prefix();
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .ok();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "coreagent.json".to_string());
    let config = AgentConfig::load(&config_path)?;
    config.validate()?;

    info!("coreagent starting: config={config_path} proxy_port={}", config.proxy_port);

    let store: Arc<dyn coreagent::store::DurableStore> = Arc::new(InMemoryStore::new());
    let event_handler = Arc::new(NoopEventHandler);
    let registry = build_registry();

    let mesh_role = config.mesh_role.clone();
    let mesh_secret = config.mesh_secret.clone();
    let mesh_port = config.mesh_port;
    let mesh_heartbeat_interval_ms = config.mesh_heartbeat_interval_ms;
    let mesh_captain_url = config.mesh_captain_url.clone();
    let mesh_capabilities = config.mesh_capabilities.clone();
    let mesh_self_endpoint = config.mesh_self_endpoint.clone();
    let registry_arc = Arc::new(registry);

    let mesh_task = tokio::spawn(async move {
        match mesh_role.as_deref() {
            Some("captain") => {
                let captain = Arc::new(Captain::new(mesh_secret, mesh_heartbeat_interval_ms));
                let listener =
                    match tokio::net::TcpListener::bind(("0.0.0.0", mesh_port)).await {
                        Ok(l) => l,
                        Err(e) => {
                            error!("mesh captain: failed to bind 0.0.0.0:{mesh_port}: {e}");
                            return;
                        }
                    };
                info!("mesh captain listening on 0.0.0.0:{mesh_port}");
                let router = coreagent::mesh::captain::router(captain);
                if let Err(e) = axum::serve(listener, router).await {
                    error!("mesh captain server exited: {e}");
                }
            }
            Some("crew") => {
                let (Some(captain_url), Some(self_endpoint)) =
                    (mesh_captain_url, mesh_self_endpoint)
                else {
                    warn!("mesh_role=crew requires mesh_captain_url and mesh_self_endpoint; mesh worker idling");
                    return;
                };
                let crew = Arc::new(Crew::new(
                    "crew-node",
                    self_endpoint,
                    captain_url,
                    mesh_capabilities,
                    mesh_secret.clone(),
                    registry_arc,
                ));
                if let Err(e) = crew.register().await {
                    error!("mesh crew: registration failed: {e}");
                }
                let listener =
                    match tokio::net::TcpListener::bind(("0.0.0.0", mesh_port)).await {
                        Ok(l) => l,
                        Err(e) => {
                            error!("mesh crew: failed to bind 0.0.0.0:{mesh_port}: {e}");
                            return;
                        }
                    };
                info!("mesh crew listening on 0.0.0.0:{mesh_port}, token window {}ms", token::DEFAULT_WINDOW_MS);
                let crew_for_heartbeat = crew.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                        mesh_heartbeat_interval_ms,
                    ));
                    loop {
                        interval.tick().await;
                        if let Err(e) = crew_for_heartbeat.heartbeat().await {
                            warn!("mesh crew: heartbeat failed: {e}");
                        }
                    }
                });
                if let Err(e) = axum::serve(listener, crew.router()).await {
                    error!("mesh crew server exited: {e}");
                }
            }
            _ => {
                info!("mesh_role not configured; mesh worker idling");
            }
        }
    });

    let proxy_task = {
        let proxy = Proxy::new(config.clone(), store.clone()).with_event_handler(event_handler.clone());
        tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!("proxy worker exited: {e}");
            }
        })
    };

    let bridge_task = tokio::spawn(async move {
        if config.telegram_token.is_none() {
            info!("no chat bridge configured (telegram_token unset); bridge worker idling");
            return;
        }
        warn!("a chat bridge was configured but no concrete ChatBridge implementation is wired up in this build");
    });

    let _ = tokio::join!(mesh_task, proxy_task, bridge_task);
    Ok(())
}
