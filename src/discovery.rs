//! Local-network coordinator discovery over UDP broadcast.
//!
//! The coordinator answers queries naming its service type with the URL of
//! its WebSocket endpoint; a worker broadcasts a query and takes the first
//! matching answer within its timeout.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{HiveError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryQuery {
    query: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryAnswer {
    service: String,
    url: String,
}

/// Answers discovery queries for one service type.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    service_type: String,
    url: String,
}

impl DiscoveryResponder {
    /// Bind the responder. Port 0 picks an ephemeral port (useful in tests;
    /// real deployments use a well-known port the workers broadcast to).
    pub async fn bind(port: u16, service_type: String, url: String) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        tracing::info!(
            addr = %socket.local_addr()?,
            service_type = %service_type,
            "Discovery responder listening"
        );
        Ok(Self {
            socket,
            service_type,
            url,
        })
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "Discovery receive error");
                            continue;
                        }
                    };
                    let query: DiscoveryQuery = match serde_json::from_slice(&buf[..len]) {
                        Ok(q) => q,
                        Err(_) => continue,
                    };
                    if query.query != self.service_type {
                        continue;
                    }
                    let answer = DiscoveryAnswer {
                        service: self.service_type.clone(),
                        url: self.url.clone(),
                    };
                    match serde_json::to_vec(&answer) {
                        Ok(bytes) => {
                            if let Err(e) = self.socket.send_to(&bytes, peer).await {
                                tracing::warn!(peer = %peer, error = %e, "Discovery answer failed");
                            } else {
                                tracing::debug!(peer = %peer, "Answered discovery query");
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to encode discovery answer"),
                    }
                }
            }
        }
    }
}

/// Broadcast a query for `service_type` and return the first matching
/// coordinator URL, or a timeout error.
pub async fn discover(service_type: &str, port: u16, timeout: Duration) -> Result<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;

    let query = serde_json::to_vec(&DiscoveryQuery {
        query: service_type.to_string(),
    })?;
    // Broadcast for the LAN case, loopback for the same-host case.
    socket.send_to(&query, ("255.255.255.255", port)).await.ok();
    socket.send_to(&query, ("127.0.0.1", port)).await?;

    let wait = async {
        let mut buf = [0u8; 1024];
        loop {
            let (len, _peer) = socket.recv_from(&mut buf).await?;
            if let Ok(answer) = serde_json::from_slice::<DiscoveryAnswer>(&buf[..len]) {
                if answer.service == service_type {
                    return Ok(answer.url);
                }
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(HiveError::DiscoveryTimeout {
            service: service_type.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discover_finds_matching_responder() {
        let responder = DiscoveryResponder::bind(
            0,
            "taskhive".to_string(),
            "ws://10.0.0.1:7400/ws".to_string(),
        )
        .await
        .unwrap();
        let port = responder.local_port().unwrap();

        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(async move { responder.run(run_token).await });

        let url = discover("taskhive", port, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(url, "ws://10.0.0.1:7400/ws");
        token.cancel();
    }

    #[tokio::test]
    async fn discover_ignores_other_services() {
        let responder = DiscoveryResponder::bind(
            0,
            "other-service".to_string(),
            "ws://10.0.0.1:7400/ws".to_string(),
        )
        .await
        .unwrap();
        let port = responder.local_port().unwrap();

        let token = CancellationToken::new();
        let run_token = token.clone();
        tokio::spawn(async move { responder.run(run_token).await });

        let err = discover("taskhive", port, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::DiscoveryTimeout { .. }));
        token.cancel();
    }
}
