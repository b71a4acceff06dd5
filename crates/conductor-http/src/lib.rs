//! HTTP front door for the permission and question bridges.
//!
//! Tool servers running inside an agent call `POST /permission` and
//! `POST /question` on localhost and block until a human answers.

mod routes;

use axum::Router;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::sync::oneshot;

pub use routes::{permission_router, question_router, PermissionResponse};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl ServerError {
    /// The port is taken, typically by another instance.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ServerError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Handle to a running bridge server.
#[derive(Debug, Default)]
pub struct BridgeServerHandle {
    addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<std::thread::JoinHandle<()>>,
}

impl BridgeServerHandle {
    /// Check if the server is running.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop the server gracefully.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

impl Drop for BridgeServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve `router` on `127.0.0.1:port` (0 picks a free port).
///
/// The port is bound before returning, so a port in use is reported here.
/// The server runs in a separate thread with its own tokio runtime.
pub fn start_bridge_server(router: Router, port: u16) -> Result<BridgeServerHandle, ServerError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let bind_err = |source| ServerError::Bind { addr, source };

    let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = std::thread::spawn(move || {
        rt.block_on(async move {
            let listener = match tokio::net::TcpListener::from_std(listener) {
                Ok(l) => l,
                Err(e) => {
                    log::error!("Failed to register bridge listener {}: {}", local_addr, e);
                    return;
                }
            };

            log::info!("Bridge server listening on http://{}", local_addr);

            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.await.ok();
                    log::info!("Bridge server on {} shutting down", local_addr);
                })
                .await
                .ok();
        });
    });

    Ok(BridgeServerHandle {
        addr: Some(local_addr),
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

/// Like [`start_bridge_server`], but a port that can't be bound is only a
/// warning: the bridge is then simply unavailable.
pub fn try_start_bridge_server(router: Router, port: u16, name: &str) -> Option<BridgeServerHandle> {
    match start_bridge_server(router, port) {
        Ok(handle) => Some(handle),
        Err(e) if e.is_addr_in_use() => {
            log::warn!("{} bridge not started: port {} is already in use", name, port);
            None
        }
        Err(e) => {
            log::warn!("{} bridge not started: {}", name, e);
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
