#![allow(dead_code)]

use axum::Router;
use condo_verifier::config::{MatcherConfig, PeripheralConfig};
use std::net::SocketAddr;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{}", addr)
}

/// A base URL on which nothing is listening.
pub async fn closed_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn matcher_config(endpoint: &str) -> MatcherConfig {
    MatcherConfig {
        endpoint: endpoint.to_string(),
        verify_path: "/api/v1/face/verify".to_string(),
        health_path: "/health".to_string(),
        connect_timeout_ms: 1000,
        fast_timeout_ms: 300,
        precise_timeout_ms: 2000,
        health_timeout_ms: 500,
    }
}

pub fn peripheral_config() -> PeripheralConfig {
    PeripheralConfig {
        base_url: None,
        snapshot_timeout_ms: 500,
        max_connect_attempts: 2,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 20,
    }
}

pub const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];
