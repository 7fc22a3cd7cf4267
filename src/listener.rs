// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::{info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use std::net::SocketAddr;

use crate::{
    addr::NoiseAddr,
    config::{ListenerConfig, Role},
    conn::NoiseConn,
    errors::NoiseError,
};

/// A passive acceptor wrapping incoming TCP streams into responder-side
/// [`NoiseConn`]s.
///
/// The listener never performs handshakes itself: every accepted connection
/// comes back in the `Init` state, so callers can drive many handshakes
/// concurrently. `accept` calls are serialized among themselves, and closing
/// is tracked separately so an in-flight accept unblocks promptly.
#[derive(Debug)]
pub struct NoiseListener {
    inner: Mutex<Option<TcpListener>>,
    accept_guard: Mutex<()>,
    closed: CancellationToken,
    config: ListenerConfig,
    local: Option<SocketAddr>,
}

impl NoiseListener {
    /// Binds a TCP listener on `addr` with the given responder configuration.
    pub async fn bind(addr: SocketAddr, config: ListenerConfig) -> Result<Self, NoiseError> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr().ok();
        info!(
            "listening for `{}` connections on {:?}",
            config.pattern(),
            local
        );
        Ok(Self {
            inner: Mutex::new(Some(listener)),
            accept_guard: Mutex::new(()),
            closed: CancellationToken::new(),
            config,
            local,
        })
    }

    /// Wraps an already-bound TCP listener.
    pub fn from_listener(
        listener: TcpListener,
        config: ListenerConfig,
    ) -> Result<Self, NoiseError> {
        config.validate()?;
        let local = listener.local_addr().ok();
        Ok(Self {
            inner: Mutex::new(Some(listener)),
            accept_guard: Mutex::new(()),
            closed: CancellationToken::new(),
            config,
            local,
        })
    }

    /// Waits for an incoming stream and wraps it into a fresh responder
    /// connection in the `Init` state. The caller is responsible for running
    /// the handshake.
    pub async fn accept(&self) -> Result<NoiseConn<TcpStream>, NoiseError> {
        let _serialize = self.accept_guard.lock().await;

        let (stream, peer) = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            accepted = self.accept_inner() => accepted?,
        };
        info!("accepted connection from {}", peer);
        NoiseConn::from_tcp(stream, self.config.conn_config())
    }

    async fn accept_inner(&self) -> Result<(TcpStream, SocketAddr), NoiseError> {
        let guard = self.inner.lock().await;
        match &*guard {
            Some(listener) => Ok(listener.accept().await?),
            None => Err(self.closed_error()),
        }
    }

    /// Closes the listener and unblocks in-flight `accept` calls. Idempotent.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut guard = self.inner.lock().await;
        if guard.take().is_some() {
            info!("listener on {:?} closed", self.local);
        } else {
            warn!("listener closed twice");
        }
    }

    /// Local endpoint, decorated with pattern and role.
    pub fn local_addr(&self) -> NoiseAddr {
        NoiseAddr::new(self.config.pattern(), Role::Responder, self.local)
    }

    fn closed_error(&self) -> NoiseError {
        NoiseError::WrongState {
            op: "accept",
            state: crate::conn::ConnState::Closed,
        }
    }
}
