// node: Standalone Matter node serving the built-in light data model over
// UDP.

use std::path::Path;
use std::sync::Arc;

use mtr_exchange::{ExchangeConfig, ExchangeManager, NodeId, SessionManager};
use mtr_im::client::ClientSubscriptions;
use mtr_im::data_model::PermissiveAccessControl;
use mtr_im::{InteractionServer, SubscriptionEngine};
use tracing::{info, warn};

use node::config::load_config;
use node::crypto::PassthroughCrypto;
use node::model::LightDataModel;
use node::store::SqliteSubscriptionStore;
use node::transport::UdpTransport;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "node starting");

    let cfg = match load_config() {
        Ok(cfg) => {
            info!(
                node_id = cfg.node_id,
                bind = %cfg.udp.bind,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let store = match SqliteSubscriptionStore::open(Path::new(&cfg.store.sqlite_path)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("FATAL: failed to open subscription store: {e}");
            std::process::exit(1);
        }
    };

    let sessions = Arc::new(SessionManager::new(NodeId(cfg.node_id)));
    let manager = ExchangeManager::new(
        sessions,
        Arc::new(PassthroughCrypto),
        ExchangeConfig::default(),
    );
    let data_model = Arc::new(LightDataModel::new());
    let acl = Arc::new(PermissiveAccessControl);
    let engine = SubscriptionEngine::new(
        manager.clone(),
        data_model.clone(),
        acl.clone(),
        cfg.interaction.clone(),
        Some(store),
    );
    let server = InteractionServer::new(
        data_model,
        acl,
        cfg.interaction.clone(),
        engine.clone(),
        ClientSubscriptions::new(),
    );
    if let Err(e) = manager.add_protocol_handler(server) {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    }

    let transport = match UdpTransport::start(&cfg.udp.bind, manager.clone()).await {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", cfg.udp.bind);
            std::process::exit(1);
        }
    };
    manager.add_transport(transport);

    // Revive persisted subscriptions. Operational peer discovery lives
    // outside this binary, so revival only succeeds for peers that still
    // have a session; the rest re-subscribe on their own.
    let resume_sessions = manager.sessions().clone();
    let revived = engine
        .resume_persisted(move |peer| {
            let sessions = resume_sessions.clone();
            async move {
                sessions.session_for_peer(&peer).ok_or(
                    mtr_im::InteractionError::Exchange(mtr_exchange::ExchangeError::NoSession(
                        peer,
                    )),
                )
            }
        })
        .await;
    if revived > 0 {
        info!(revived, "persisted subscriptions re-established");
    }

    info!("node running, ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "signal wait failed");
    }
    info!("shutting down");
    manager.close().await;
}
