//! Network infrastructure: implements `NetworkProbe` using `spawn_blocking`.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::Result;

use crate::application::ports::NetworkProbe;

/// Production implementation that performs real TCP dials.
pub struct TokioNetworkProbe {
    dial_timeout: Duration,
}

impl TokioNetworkProbe {
    #[must_use]
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl NetworkProbe for TokioNetworkProbe {
    async fn check_tcp_connectivity(&self, host: &str, port: u16) -> Result<bool> {
        let host = host.to_string();
        let timeout = self.dial_timeout;
        let result = tokio::task::spawn_blocking(move || {
            let addrs = (host.as_str(), port)
                .to_socket_addrs()
                .map_err(|e| anyhow::anyhow!("cannot resolve {host}: {e}"))?;
            Ok::<bool, anyhow::Error>(
                addrs
                    .into_iter()
                    .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok()),
            )
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking panicked: {e}"))??;
        Ok(result)
    }
}
