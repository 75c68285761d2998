//! Creates plain or secure sockets depending on the configuration.

use crate::config::TransportConfig;
use crate::error::Error;
use crate::events::EventQueue;
use crate::multiplexer::MultiplexerHandle;
use crate::secure::{SecureSocket, TlsContext};
use crate::socket::{DataSocket, TcpListenSocket, TcpSocket};
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Builds sockets that share one multiplexer, event queue and TLS context.
#[derive(Debug, Clone)]
pub struct SocketFactory {
    mux: MultiplexerHandle,
    events: EventQueue,
    config: Arc<TransportConfig>,
    tls: Option<Arc<TlsContext>>,
}

impl SocketFactory {
    /// Creates a factory. With `tls_enabled` the TLS context is built from
    /// the configuration, which may generate a certificate.
    pub fn new(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: TransportConfig,
    ) -> Result<Self, Error> {
        let tls = if config.tls_enabled {
            Some(Arc::new(TlsContext::from_config(&config)?))
        } else {
            None
        };
        Ok(Self {
            mux,
            events,
            config: Arc::new(config),
            tls,
        })
    }

    /// Creates a factory for secure sockets with a prepared context.
    pub fn with_tls_context(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: TransportConfig,
        context: Arc<TlsContext>,
    ) -> Self {
        Self {
            mux,
            events,
            config: Arc::new(config),
            tls: Some(context),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn tls_context(&self) -> Option<&Arc<TlsContext>> {
        self.tls.as_ref()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn multiplexer(&self) -> &MultiplexerHandle {
        &self.mux
    }

    /// An unconnected socket, secure if TLS is enabled.
    pub fn create(&self) -> Arc<dyn DataSocket> {
        match &self.tls {
            Some(context) => self.secure_socket(context.clone()),
            None => self.create_plain(),
        }
    }

    /// An unconnected plain socket, regardless of the TLS setting.
    pub fn create_plain(&self) -> Arc<TcpSocket> {
        TcpSocket::new(self.mux.clone(), self.events.clone(), self.config.clone())
    }

    /// An unconnected secure socket.
    ///
    /// # Errors
    ///
    /// [`Error::TlsNotConfigured`] if the factory has no TLS context.
    pub fn create_secure(&self) -> Result<Arc<SecureSocket>, Error> {
        let context = self.tls.clone().ok_or(Error::TlsNotConfigured)?;
        Ok(self.secure_socket(context))
    }

    fn secure_socket(&self, context: Arc<TlsContext>) -> Arc<SecureSocket> {
        SecureSocket::new(
            self.mux.clone(),
            self.events.clone(),
            self.config.clone(),
            context,
        )
    }

    /// An unbound listener whose accepted sockets come from this factory.
    pub fn create_listener(&self) -> Arc<TcpListenSocket> {
        TcpListenSocket::new(self.clone(), self.events.clone())
    }

    pub(crate) fn wrap_accepted(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Arc<dyn DataSocket>, Error> {
        debug!(%peer, secure = self.is_secure(), "Wrapping accepted stream");
        let socket: Arc<dyn DataSocket> = match &self.tls {
            Some(context) => SecureSocket::from_stream(
                self.mux.clone(),
                self.events.clone(),
                self.config.clone(),
                context.clone(),
                stream,
            )?,
            None => TcpSocket::from_stream(
                self.mux.clone(),
                self.events.clone(),
                self.config.clone(),
                stream,
            )?,
        };
        Ok(socket)
    }
}
