//! Free TCP port allocation
//!
//! Test runs ask the pool for ports to start local servers on. A port is
//! handed out only if no earlier caller holds it and it can be bound right
//! now. It stays reserved until released, even when nothing listens on it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use devpool_core::prelude::*;

pub const DEFAULT_BASE_PORT: u16 = 8300;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_RETRIES: u32 = 1000;

/// Where the search starts and how many ports it may try
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub from: u16,
    pub host: String,
    pub retries: u32,
}

impl Default for PortRequest {
    fn default() -> Self {
        Self {
            from: DEFAULT_BASE_PORT,
            host: DEFAULT_HOST.to_string(),
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Owned set of handed-out ports
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reserved(reserved: BTreeSet<u16>) -> Self {
        Self { reserved }
    }

    pub fn reserved(&self) -> &BTreeSet<u16> {
        &self.reserved
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    /// Lowest port at or above `port` nobody holds
    fn next_unreserved(&self, mut port: u16) -> Option<u16> {
        while self.reserved.contains(&port) {
            port = port.checked_add(1)?;
        }
        Some(port)
    }

    /// Reserve the lowest free port at or above `request.from`
    pub async fn reserve(&mut self, request: &PortRequest) -> Result<u16> {
        // Port 0 would let the OS pick
        let mut candidate = self.next_unreserved(request.from.max(1));

        for attempt in 0..request.retries {
            let Some(port) = candidate else {
                break;
            };
            if port_is_free(&request.host, port).await {
                self.reserved.insert(port);
                debug!(port, attempt, "Reserved port");
                return Ok(port);
            }
            trace!(port, "Port in use");
            candidate = port
                .checked_add(1)
                .and_then(|next| self.next_unreserved(next));
        }

        Err(Error::NoFreePort {
            from: request.from,
            attempts: request.retries,
        })
    }

    /// Give a port back; `false` if it was not reserved
    pub fn release(&mut self, port: u16) -> bool {
        self.reserved.remove(&port)
    }
}

async fn port_is_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(from: u16, retries: u32) -> PortRequest {
        PortRequest {
            from,
            host: "127.0.0.1".to_string(),
            retries,
        }
    }

    /// A port the OS considers free right now
    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_reserved_ports_are_not_handed_out_twice() {
        let base = unused_port();
        let mut ports = PortAllocator::new();

        let first = ports.reserve(&local(base, 100)).await.unwrap();
        let second = ports.reserve(&local(base, 100)).await.unwrap();
        assert!(first >= base);
        assert!(second > first);
        assert!(ports.is_reserved(first));
        assert!(ports.is_reserved(second));
    }

    #[tokio::test]
    async fn test_bound_port_is_skipped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut ports = PortAllocator::new();

        let port = ports.reserve(&local(taken, 100)).await.unwrap();
        assert_ne!(port, taken);
        assert!(port > taken);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut ports = PortAllocator::new();

        let err = ports.reserve(&local(taken, 1)).await.unwrap_err();
        assert!(matches!(err, Error::NoFreePort { attempts: 1, .. }));
        assert!(ports.reserved().is_empty());
    }

    #[tokio::test]
    async fn test_search_stops_at_last_port() {
        let mut ports = PortAllocator::with_reserved(BTreeSet::from([u16::MAX]));
        let err = ports.reserve(&local(u16::MAX, 10)).await.unwrap_err();
        assert!(matches!(err, Error::NoFreePort { .. }));
    }

    #[tokio::test]
    async fn test_release_frees_port_for_reuse() {
        let base = unused_port();
        let mut ports = PortAllocator::new();
        let port = ports.reserve(&local(base, 100)).await.unwrap();

        assert!(ports.release(port));
        assert!(!ports.release(port));
        assert_eq!(ports.reserve(&local(port, 100)).await.unwrap(), port);
    }

    #[test]
    fn test_default_request() {
        let request = PortRequest::default();
        assert_eq!(request.from, 8300);
        assert_eq!(request.host, "0.0.0.0");
        assert_eq!(request.retries, 1000);
    }
}
