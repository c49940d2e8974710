//! Network interface address poller

use std::net::Ipv4Addr;
use std::time::Duration;

use nix::errno::Errno;
use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Unknown network interface '{name}': {source}")]
    UnknownInterface {
        name: String,
        #[source]
        source: Errno,
    },

    #[error("Failed to list interface addresses: {0}")]
    Addresses(#[source] Errno),

    #[error("Address handler failed for '{interface}': {error}")]
    Handler {
        interface: String,
        error: anyhow::Error,
    },
}

/// First IPv4 address of `interface`, if it has one.
pub fn ipv4_address(interface: &str) -> Result<Option<Ipv4Addr>, NetworkError> {
    let addrs = getifaddrs().map_err(NetworkError::Addresses)?;

    Ok(addrs
        .filter(|ifaddr| ifaddr.interface_name == interface)
        .filter_map(|ifaddr| ifaddr.address)
        .find_map(|addr| addr.as_sockaddr_in().map(|sin| Ipv4Addr::from(sin.ip()))))
}

/// Periodically reports the IPv4 address of a fixed set of interfaces.
pub struct NetworkMonitor {
    interfaces: Vec<String>,
    interval: Duration,
    stop: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Every interface must exist when the monitor is created.
    pub fn new<I, S>(interfaces: I, interval: Duration) -> Result<Self, NetworkError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let interfaces: Vec<String> = interfaces.into_iter().map(Into::into).collect();
        for name in &interfaces {
            let index = if_nametoindex(name.as_str()).map_err(|source| NetworkError::UnknownInterface {
                name: name.clone(),
                source,
            })?;
            tracing::debug!("Monitoring interface {} (index {})", name, index);
        }

        let (stop, _) = watch::channel(false);
        Ok(Self {
            interfaces,
            interval,
            stop,
        })
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Poll immediately and then once per interval, calling `handler` for
    /// every interface with its address or `None`. Returns when the handler
    /// fails, listing addresses fails, or [`close`](Self::close) is called.
    pub async fn run<F>(&self, mut handler: F) -> Result<(), NetworkError>
    where
        F: FnMut(&str, Option<Ipv4Addr>) -> anyhow::Result<()>,
    {
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return Ok(());
        }

        let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));

        loop {
            tokio::select! {
                tick = ticks.next() => {
                    if tick.is_none() {
                        return Ok(());
                    }
                }
                _ = stop.changed() => return Ok(()),
            }

            for interface in &self.interfaces {
                let address = ipv4_address(interface)?;
                tracing::trace!("{}: {:?}", interface, address);
                handler(interface, address).map_err(|error| NetworkError::Handler {
                    interface: interface.clone(),
                    error,
                })?;
            }
        }
    }

    /// Stop a running [`run`](Self::run) at its next wait. Idempotent.
    pub fn close(&self) {
        self.stop.send_replace(true);
    }
}
