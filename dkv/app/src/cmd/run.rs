// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tracing::info;

use dkv_api::app_router;
use dkv_kv::KvMap;
use dkv_service::{bootstrap, KvService, ServiceConfig};

use crate::cmd::Cmd;
use crate::options::RunArgs;
use crate::settings::{RouterSettings, ServerSettings, Settings};

#[async_trait]
impl Cmd for RunArgs {
    async fn exec(&self, settings: Settings) -> anyhow::Result<()> {
        run(settings).await
    }
}

/// Run the node. This method acts as our composition root.
async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(?settings, "starting");

    let service = settings.service;
    let kv = KvMap::new();
    let service_config = ServiceConfig {
        key_max_len: service.key_max_len,
        val_max_len: service.val_max_len,
        max_map_size: service.max_map_size,
        raft_timeout: service.raft_timeout,
    };

    let kv_service = if service.debug {
        info!("debug mode: consensus disabled, writes go straight to the map");
        KvService::debug(kv, service_config)
    } else {
        let raft = dkv_raft::start(service.raft_node_id, kv.clone(), &service.raft_store_dir)
            .await
            .context("error starting the consensus node")?;

        // Peers must be able to reach this node before bootstrap: the
        // leader's catch-up traffic to a joining follower and the votes for
        // our own election both arrive here.
        let raft_addr: SocketAddr = service
            .raft_addr
            .parse()
            .context("invalid SERVICE_RAFT_ADDR")?;
        let raft_server = axum::Server::try_bind(&raft_addr)
            .context("error binding the raft address")?
            .serve(dkv_raft::api::raft_router(raft.clone()).into_make_service());
        info!(%raft_addr, "raft transport listening");
        tokio::spawn(async move {
            if let Err(e) = raft_server.await {
                tracing::error!("raft listener failed: {e}");
            }
        });

        if service.raft_leader {
            bootstrap::bootstrap_leader(
                &raft,
                service.raft_node_id,
                &service.raft_addr,
                &service.raft_store_dir,
                service.raft_timeout,
            )
            .await
            .context("error bootstrapping the leader")?;
        } else {
            let join_addr = service
                .raft_join_addr
                .as_deref()
                .ok_or_else(|| anyhow!("SERVICE_RAFT_JOIN_ADDR is required on follower nodes"))?;
            bootstrap::join_leader(
                join_addr,
                service.raft_node_id,
                &service.raft_addr,
                service.raft_timeout,
            )
            .await
            .context("error joining the leader")?;
        }

        KvService::new(kv, raft, service_config)
    };

    serve_api(settings.server, settings.router, Arc::new(kv_service)).await
}

/// Serve the public API until SIGINT/SIGTERM, then drain within the
/// configured shutdown deadline.
async fn serve_api(
    server: ServerSettings,
    router: RouterSettings,
    service: Arc<KvService>,
) -> anyhow::Result<()> {
    let app = app_router(service, router.request_timeout);
    let addr: SocketAddr = server.address.parse().context("invalid SERVER_ADDRESS")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http = axum::Server::try_bind(&addr)
        .context("error binding the server address")?
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });

    info!(listen_addr = %addr, "server listening");
    let mut handle = tokio::spawn(http);

    tokio::select! {
        res = &mut handle => {
            let res = res.context("server task panicked")?;
            res.map_err(|e| anyhow!("server encountered an error: {e}"))
        }
        _ = shutdown_signal() => {
            info!("server shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(server.shutdown_timeout, handle).await {
                Ok(res) => {
                    res.context("server task panicked")?
                        .context("server failed to shut down gracefully")?;
                    Ok(())
                }
                Err(_) => Err(anyhow!(
                    "server failed to shut down within {:?}",
                    server.shutdown_timeout
                )),
            }
        }
    }
}

async fn shutdown_signal() {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install the SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install the SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
