use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tstream_types::{Connection, Protocol};

/// Default timeout for poller endpoint requests
pub const POLLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Total wait cap for instance metadata requests
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    host: String,
    port: u16,
    https: bool,
    allow_self_signed: bool,
}

impl ClientKey {
    fn from_connection(connection: &Connection) -> Self {
        Self {
            host: connection.host.clone(),
            port: connection.port,
            https: connection.protocol == Protocol::Https,
            allow_self_signed: connection.allow_self_signed_cert,
        }
    }
}

/// Reusable per-endpoint HTTP clients with connection pooling.
#[derive(Default)]
pub struct HttpClientPool {
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl HttpClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for a device connection; reused across cycles targeting
    /// the same endpoint.
    pub fn client_for(&self, connection: &Connection) -> Result<reqwest::Client> {
        let key = ClientKey::from_connection(connection);
        let mut clients = self.clients.lock().expect("client pool lock poisoned");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .timeout(POLLER_TIMEOUT)
            .danger_accept_invalid_certs(connection.allow_self_signed_cert)
            .build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Base URL for a device connection
    pub fn base_url(connection: &Connection) -> String {
        let scheme = match connection.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        format!("{}://{}:{}", scheme, connection.host, connection.port)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("client pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.clients
            .lock()
            .expect("client pool lock poisoned")
            .clear();
    }
}

/// Client for instance metadata requests: keep-alive disabled (the
/// socket must not be reused) and the total wait capped.
pub fn metadata_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(host: &str) -> Connection {
        Connection {
            host: host.to_string(),
            port: 8100,
            protocol: Protocol::Https,
            allow_self_signed_cert: false,
        }
    }

    #[test]
    fn test_clients_reused_per_endpoint() {
        let pool = HttpClientPool::new();
        pool.client_for(&connection("a")).unwrap();
        pool.client_for(&connection("a")).unwrap();
        assert_eq!(pool.len(), 1);
        pool.client_for(&connection("b")).unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_base_url() {
        assert_eq!(
            HttpClientPool::base_url(&connection("device.example.com")),
            "https://device.example.com:8100"
        );
    }
}
