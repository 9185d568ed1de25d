//! Remote module server: exposes activated modules to peer
//! instances over the same length-prefixed request/response wire protocol
//! the client speaks. The server never owns module lifecycle decisions
//! itself; it drives them through a [`RemoteExportTarget`] (implemented by
//! [`crate::manager::ModuleManager`]) so activation/refcounting stays the
//! manager's sole responsibility.

use super::codec::{read_frame, write_frame, Request, Response, WireValue};
use crate::error::TransportError;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
type BoxedStream = Box<dyn Stream>;

/// What the server needs from the module manager to honor the protocol.
/// Kept as a trait so `remote::server` does not depend on `manager`'s
/// concrete types.
#[async_trait::async_trait]
pub trait RemoteExportTarget: Send + Sync {
    fn allow_remote(&self, module: &str) -> bool;

    fn remotable_names(&self) -> Vec<String>;

    /// Interface identifiers `module` declares, reported to the peer on
    /// `acquire` so its connector bind can check `interface` compatibility
    /// without a second round trip.
    fn declared_interfaces(&self, module: &str) -> Vec<String>;

    /// Activates `module` if needed and records one more remote holder on
    /// it.
    async fn acquire_for_remote(&self, module: &str) -> Result<(), TransportError>;

    /// Drops one remote holder; deactivates `module` if that was the last
    /// reason it was active.
    async fn release_for_remote(&self, module: &str);

    /// # Errors
    /// [`TransportError::Remote`] wrapping whatever the module's dynamic
    /// surface reports for an unknown attribute or a call it declines.
    fn call(
        &self,
        module: &str,
        attr: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError>;

    /// # Errors
    /// See [`RemoteExportTarget::call`].
    fn get_attr(&self, module: &str, attr: &str) -> Result<serde_json::Value, TransportError>;

    /// # Errors
    /// See [`RemoteExportTarget::call`].
    fn set_attr(
        &self,
        module: &str,
        attr: &str,
        value: serde_json::Value,
    ) -> Result<(), TransportError>;
}

/// TLS parameters for the server listener.
pub struct ServerTlsConfig {
    pub cert_chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Binds `(address, port)` and serves the remote module protocol
/// until the returned task is aborted or the listener
/// errors.
pub struct RemoteServer {
    target: Arc<dyn RemoteExportTarget>,
    handles: DashMap<u64, String>,
    next_handle: AtomicU64,
}

impl RemoteServer {
    #[must_use]
    pub fn new(target: Arc<dyn RemoteExportTarget>) -> Arc<Self> {
        Arc::new(Self {
            target,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Accepts connections until the socket errors. Each connection is
    /// handled on its own `tokio` task so unrelated peers never block on
    /// one another.
    ///
    /// # Errors
    /// Propagates a listener bind/accept failure.
    pub async fn serve(
        self: &Arc<Self>,
        address: &str,
        port: u16,
        tls: Option<ServerTlsConfig>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind((address, port)).await?;
        let acceptor = tls.map(build_acceptor).transpose()?;
        loop {
            let (socket, peer) = listener.accept().await?;
            let this = Arc::clone(self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                this.handle_connection(socket, peer, acceptor).await;
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        socket: TcpStream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
    ) {
        let mut stream: BoxedStream = match acceptor {
            None => Box::new(socket),
            Some(acc) => match acc.accept(socket).await {
                Ok(s) => Box::new(s),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            },
        };

        let mut owned_handles: Vec<u64> = Vec::new();
        loop {
            let req: Request = match read_frame(&mut stream).await {
                Ok(r) => r,
                Err(_) => break,
            };
            let resp = self.handle_request(req, &mut owned_handles).await;
            if write_frame(&mut stream, &resp).await.is_err() {
                break;
            }
        }

        // Transport error / disconnect mid-session:
        // every handle this peer opened is released, which may cascade into
        // deactivating modules the shared-exporter policy no longer needs.
        for handle in owned_handles {
            if let Some((_, module)) = self.handles.remove(&handle) {
                self.target.release_for_remote(&module).await;
            }
        }
    }

    async fn handle_request(&self, req: Request, owned_handles: &mut Vec<u64>) -> Response {
        match req {
            Request::ListRemotable => Response::Remotable {
                modules: self.target.remotable_names(),
            },
            Request::Acquire { module_name } => self.handle_acquire(module_name, owned_handles).await,
            Request::Release { handle } => {
                owned_handles.retain(|h| *h != handle);
                if let Some((_, module)) = self.handles.remove(&handle) {
                    self.target.release_for_remote(&module).await;
                }
                Response::Released
            }
            Request::Call { handle, attr, args } => self.with_module(handle, |target, module| {
                target
                    .call(module, &attr, args.into_iter().map(WireValue::into_json).collect())
                    .map(|v| Response::Value {
                        value: WireValue::from_json(v),
                    })
            }),
            Request::GetAttr { handle, attr } => self.with_module(handle, |target, module| {
                target
                    .get_attr(module, &attr)
                    .map(|v| Response::Value {
                        value: WireValue::from_json(v),
                    })
            }),
            Request::SetAttr { handle, attr, value } => self.with_module(handle, |target, module| {
                target
                    .set_attr(module, &attr, value.into_json())
                    .map(|()| Response::Released)
            }),
        }
    }

    async fn handle_acquire(&self, module_name: String, owned_handles: &mut Vec<u64>) -> Response {
        if !self.target.allow_remote(&module_name) {
            return error_response(&TransportError::NotRemotable { module: module_name });
        }
        if let Err(e) = self.target.acquire_for_remote(&module_name).await {
            return error_response(&e);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let interfaces = self.target.declared_interfaces(&module_name);
        self.handles.insert(handle, module_name);
        owned_handles.push(handle);
        Response::Acquired { handle, interfaces }
    }

    fn with_module(
        &self,
        handle: u64,
        f: impl FnOnce(&Arc<dyn RemoteExportTarget>, &str) -> Result<Response, TransportError>,
    ) -> Response {
        let Some(module) = self.handles.get(&handle) else {
            return error_response(&TransportError::UnknownHandle(handle));
        };
        match f(&self.target, module.value()) {
            Ok(resp) => resp,
            Err(e) => error_response(&e),
        }
    }
}

fn error_response(e: &TransportError) -> Response {
    Response::Error {
        class: error_class(e).to_string(),
        message: e.to_string(),
    }
}

fn error_class(e: &TransportError) -> &'static str {
    match e {
        TransportError::NotRemotable { .. } => "NotRemotable",
        TransportError::Disconnected { .. } => "Disconnected",
        TransportError::TimedOut(_) => "TimedOut",
        TransportError::UnknownHandle(_) => "UnknownHandle",
        TransportError::Remote { .. } => "Remote",
        TransportError::Io(_) => "Io",
        TransportError::Codec(_) => "Codec",
    }
}

fn build_acceptor(tls: ServerTlsConfig) -> std::io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut tls.cert_chain_pem.as_slice())
        .filter_map(Result::ok)
        .collect();
    let key = rustls_pemfile::private_key(&mut tls.key_pem.as_slice())
        .map_err(std::io::Error::other)?
        .ok_or_else(|| std::io::Error::other("no private key found in keyfile"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(std::io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
