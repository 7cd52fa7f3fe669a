//! Local port reservation
//!
//! Ports are probed by binding a listener and dropping it again, so the
//! caller receives a number rather than a socket. The native tunnel client
//! binds the port itself later on. Another process can grab the port in
//! between; that window is accepted.

use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, trace};

use crate::error::PortError;

/// Default lower bound of the auto-allocation range (inclusive)
pub const DEFAULT_MIN_PORT: u16 = 8000;

/// Default upper bound of the auto-allocation range (inclusive)
pub const DEFAULT_MAX_PORT: u16 = 9000;

/// Picks free local TCP ports without holding them.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    bind_ip: Ipv4Addr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    /// Probe on all interfaces, the way the native client listens
    pub fn new() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
        }
    }

    /// Probe on a specific local address
    pub fn with_bind_ip(bind_ip: Ipv4Addr) -> Self {
        Self { bind_ip }
    }

    /// Reserve a port.
    ///
    /// A non-zero `preferred` narrows the range to that single port and a
    /// bind failure is reported, never remapped. With `preferred == 0` the
    /// first bindable port of `[range_min, range_max]` is returned.
    pub async fn acquire(
        &self,
        preferred: u16,
        range_min: u16,
        range_max: u16,
    ) -> Result<u16, PortError> {
        if preferred != 0 {
            return self.probe(preferred).await.map(|_| preferred).map_err(|source| {
                PortError::Unavailable {
                    port: preferred,
                    source,
                }
            });
        }

        if range_min > range_max {
            return Err(PortError::InvalidRange {
                min: range_min,
                max: range_max,
            });
        }

        for port in scan_order(range_min, range_max, std::process::id()) {
            match self.probe(port).await {
                Ok(()) => {
                    debug!("Reserved local port {}", port);
                    return Ok(port);
                }
                Err(e) => trace!("Port {} unavailable: {}", port, e),
            }
        }

        Err(PortError::NoPortAvailable {
            min: range_min,
            max: range_max,
        })
    }

    async fn probe(&self, port: u16) -> std::io::Result<()> {
        let listener = TcpListener::bind(SocketAddr::from((self.bind_ip, port))).await?;
        // Released before returning so the tunnel client can bind it.
        drop(listener);
        Ok(())
    }
}

/// Every port of the range exactly once, starting at a seed-derived offset so
/// concurrent builds on one host begin their scans at different ports.
fn scan_order(min: u16, max: u16, seed: u32) -> impl Iterator<Item = u16> {
    let span = u32::from(max - min) + 1;
    let offset = seed % span;
    (0..span).map(move |i| {
        let step = (offset + i) % span;
        // step < span <= u16::MAX + 1 and min + step <= max
        (u32::from(min) + step) as u16
    })
}
