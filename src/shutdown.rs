/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file shutdown.rs
 * @brief Graceful shutdown signalling
 */

use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-backed shutdown signal. The server's accept loop holds a
/// `Shutdown`; anything may hold a `ShutdownHandle` and trigger it once.
#[derive(Debug)]
pub struct Shutdown {
    receiver: broadcast::Receiver<()>,
}

#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: broadcast::Sender<()>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (sender, receiver) = broadcast::channel(1);
    (ShutdownHandle { sender }, Shutdown { receiver })
}

impl Shutdown {
    /// Resolves when shutdown is requested. Also resolves if every handle
    /// was dropped, so a vanished controller cannot wedge the server.
    pub async fn triggered(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }

    /// Wire ctrl-c to this handle. Used by the binary entry point; tests
    /// trigger the handle directly instead.
    pub fn trigger_on_ctrl_c(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                handle.trigger();
            }
        });
    }
}
