//! Public façade over a proxy session.
//!
//! A [`Proxy`] is a thin, thread-safe handle around the session worker:
//! create binds the socket and starts the worker, configure swaps the channel
//! parameters live, inject feeds synthetic ingress, destroy shuts everything
//! down. Every operation after creation reports a [`ResultCode`]; operational
//! failures are sticky and readable through [`Proxy::last_result`].

use std::net::SocketAddr;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::channel::ChannelStatsSnapshot;
use crate::config::{ChannelConfig, ProxyConfig};
use crate::error::{Error, Result};
use crate::session::{InjectCommand, SessionHandle, SessionShared};
use crate::types::ResultCode;

/// Per-direction statistics snapshot for a proxy.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProxyStats {
    pub c2s: ChannelStatsSnapshot,
    pub s2c: ChannelStatsSnapshot,
}

/// Handle to a running impairment proxy.
///
/// Dropping the handle shuts the session down.
pub struct Proxy {
    shared: std::sync::Arc<SessionShared>,
    // API entry points are serialised among themselves; the slot empties on
    // destroy.
    session: Mutex<Option<SessionHandle>>,
}

impl Proxy {
    /// Bind the UDP listener, start the worker, and begin asynchronous
    /// resolution of `server_host`.
    ///
    /// Returns immediately; client datagrams that arrive before resolution
    /// completes are buffered in the C2S channel until a destination exists.
    pub fn create(
        proxy_config: &ProxyConfig,
        channel_config: ChannelConfig,
        server_host: impl Into<String>,
        server_port: u16,
    ) -> Result<Self> {
        proxy_config.validate()?;
        channel_config.validate()?;

        let host = server_host.into();
        if host.is_empty() {
            return Err(Error::InvalidConfig("server hostname is empty".into()));
        }
        if server_port == 0 {
            return Err(Error::InvalidConfig("server port must be nonzero".into()));
        }

        let session = SessionHandle::spawn(proxy_config, channel_config, host, server_port)?;
        let shared = std::sync::Arc::clone(&session.shared);

        Ok(Self {
            shared,
            session: Mutex::new(Some(session)),
        })
    }

    /// Local address of the UDP listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Swap the channel parameters live. The impairment RNG is not reseeded.
    pub fn configure(&self, channel_config: ChannelConfig) -> ResultCode {
        if channel_config.validate().is_err() {
            return ResultCode::InvalidArgument;
        }

        let session = self.session.lock();
        if session.is_none() {
            return ResultCode::Shutdown;
        }

        *self.shared.channel_config.lock() = channel_config;
        debug!("channel configuration updated");
        ResultCode::Success
    }

    /// Feed a synthetic datagram into the ingress path as if it arrived from
    /// `127.0.0.1:source_port`.
    pub fn inject(&self, source_port: u16, bytes: &[u8]) -> ResultCode {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return ResultCode::Shutdown;
        };

        if bytes.len() > self.shared.max_datagram_bytes {
            return ResultCode::InvalidArgument;
        }

        match session.inject_tx.try_send(InjectCommand {
            source_port,
            payload: bytes.to_vec(),
        }) {
            Ok(()) => ResultCode::Success,
            Err(TrySendError::Full(_)) => ResultCode::AllocationFailed,
            Err(TrySendError::Closed(_)) => ResultCode::Shutdown,
        }
    }

    /// Sticky result of the session: the first operational failure, or
    /// `Success`.
    pub fn last_result(&self) -> ResultCode {
        self.shared.last_result.get()
    }

    /// Per-direction delivery statistics.
    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            c2s: self.shared.c2s_stats.snapshot(),
            s2c: self.shared.s2c_stats.snapshot(),
        }
    }

    /// Shut down the session and release its resources.
    ///
    /// The first call returns `Success`; subsequent calls return the benign
    /// `Shutdown` code.
    pub fn destroy(&self) -> ResultCode {
        let mut session = self.session.lock();
        match session.take() {
            Some(mut handle) => {
                handle.shutdown();
                ResultCode::Success
            }
            None => ResultCode::Shutdown,
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("local_addr", &self.shared.local_addr)
            .field("last_result", &self.last_result())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_invalid_channel_config() {
        let channel = ChannelConfig {
            loss_rate: 2.0,
            ..ChannelConfig::default()
        };
        let err = Proxy::create(&ProxyConfig::default(), channel, "localhost", 4000).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidArgument);
    }

    #[test]
    fn create_rejects_empty_hostname() {
        let err =
            Proxy::create(&ProxyConfig::default(), ChannelConfig::default(), "", 4000).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidArgument);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let proxy = Proxy::create(
            &ProxyConfig::default(),
            ChannelConfig::transparent(),
            "127.0.0.1",
            4000,
        )
        .unwrap();

        assert_eq!(proxy.destroy(), ResultCode::Success);
        assert_eq!(proxy.destroy(), ResultCode::Shutdown);
        assert_eq!(proxy.configure(ChannelConfig::default()), ResultCode::Shutdown);
        assert_eq!(proxy.inject(5000, b"late"), ResultCode::Shutdown);
    }

    #[tokio::test]
    async fn inject_rejects_oversized_datagram() {
        let proxy = Proxy::create(
            &ProxyConfig::default(),
            ChannelConfig::transparent(),
            "127.0.0.1",
            4000,
        )
        .unwrap();

        let oversized = vec![0u8; proxy.shared.max_datagram_bytes + 1];
        assert_eq!(proxy.inject(5000, &oversized), ResultCode::InvalidArgument);
        assert_eq!(proxy.last_result(), ResultCode::Success);
    }
}
