//! Remote client proxy: a
//! background connection thread drives a synchronous request/response
//! protocol so that [`crate::meta::connector::ConnectorProxy`]'s
//! synchronous `call`/`get_attr`/`set_attr` surface can be satisfied from
//! any caller thread without requiring that thread to run its own `tokio`
//! reactor.

use super::codec::{read_frame, write_frame, Request, Response, WireValue};
use crate::error::TransportError;
use rustls_pki_types::ServerName;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}
type BoxedStream = Box<dyn Stream>;

/// TLS parameters for an outgoing remote-module connection. Plaintext is
/// the default; this is opt-in.
#[derive(Clone)]
pub struct ClientTlsConfig {
    pub root_ca_pem: Vec<u8>,
    pub server_name: String,
}

enum ClientJob {
    Acquire {
        module_name: String,
        reply: std_mpsc::Sender<Result<(u64, Vec<String>), TransportError>>,
    },
    Release {
        handle: u64,
    },
    Call {
        handle: u64,
        attr: String,
        args: Vec<serde_json::Value>,
        reply: std_mpsc::Sender<Result<serde_json::Value, TransportError>>,
    },
    GetAttr {
        handle: u64,
        attr: String,
        reply: std_mpsc::Sender<Result<serde_json::Value, TransportError>>,
    },
    SetAttr {
        handle: u64,
        attr: String,
        value: serde_json::Value,
        reply: std_mpsc::Sender<Result<(), TransportError>>,
    },
}

/// One connection to a peer's remote module server. Owns a dedicated OS
/// thread + single-threaded runtime driving a strictly request/response
/// wire protocol; every `acquire`d module gets its own
/// [`RemoteConnectorStub`] sharing this connection.
pub struct RemoteClient {
    tx: std_mpsc::Sender<ClientJob>,
    join: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RemoteClient {
    /// Opens a connection to `(host, port)`, optionally over TLS.
    ///
    /// # Errors
    /// Returns [`TransportError::Io`] if the initial TCP connect fails.
    pub fn connect(
        host: &str,
        port: u16,
        tls: Option<ClientTlsConfig>,
    ) -> Result<Arc<Self>, TransportError> {
        let (tx, rx) = std_mpsc::channel::<ClientJob>();
        let host = host.to_string();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();
        let join = std::thread::Builder::new()
            .name(format!("labstation-remote-client-{host}:{port}"))
            .spawn(move || client_thread(&host, port, tls, &rx, &ready_tx))
            .unwrap_or_else(|e| unreachable!("spawning client thread must not fail: {e}"));
        ready_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| TransportError::Disconnected {
                peer: format!("{port}"),
            })?
            .map_err(|reason| TransportError::Codec(reason))?;
        Ok(Arc::new(Self {
            tx,
            join: parking_lot::Mutex::new(Some(join)),
        }))
    }

    /// # Errors
    /// [`TransportError::NotRemotable`]/[`TransportError::Remote`] if the
    /// server refuses, [`TransportError::Disconnected`] if the connection
    /// drops mid-call.
    pub fn acquire(self: &Arc<Self>, module_name: &str) -> Result<RemoteConnectorStub, TransportError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.tx
            .send(ClientJob::Acquire {
                module_name: module_name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| disconnected())?;
        let (handle, interfaces) = reply_rx.recv().map_err(|_| disconnected())??;
        Ok(RemoteConnectorStub {
            handle,
            interfaces,
            client: self.clone(),
        })
    }

    fn release(&self, handle: u64) {
        let _ = self.tx.send(ClientJob::Release { handle });
    }

    fn call(
        &self,
        handle: u64,
        attr: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.tx
            .send(ClientJob::Call {
                handle,
                attr: attr.to_string(),
                args,
                reply: reply_tx,
            })
            .map_err(|_| disconnected())?;
        reply_rx.recv().map_err(|_| disconnected())?
    }

    fn get_attr(&self, handle: u64, attr: &str) -> Result<serde_json::Value, TransportError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.tx
            .send(ClientJob::GetAttr {
                handle,
                attr: attr.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| disconnected())?;
        reply_rx.recv().map_err(|_| disconnected())?
    }

    fn set_attr(&self, handle: u64, attr: &str, value: serde_json::Value) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.tx
            .send(ClientJob::SetAttr {
                handle,
                attr: attr.to_string(),
                value,
                reply: reply_tx,
            })
            .map_err(|_| disconnected())?;
        reply_rx.recv().map_err(|_| disconnected())?
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(join) = self.join.lock().take() {
            drop(self.tx.clone());
            let _ = join.join();
        }
    }
}

fn disconnected() -> TransportError {
    TransportError::Disconnected {
        peer: "remote-server".to_string(),
    }
}

/// The client-side half of a bound `Connector`: one
/// acquired handle, sharing its parent [`RemoteClient`]'s connection.
/// Reference-counted server-side: this stub's `Drop` releases the
/// handle, but in-flight calls already dispatched complete normally.
pub struct RemoteConnectorStub {
    handle: u64,
    interfaces: Vec<String>,
    client: Arc<RemoteClient>,
}

impl RemoteConnectorStub {
    /// Interface identifiers the remote target reported at `acquire` time.
    #[must_use]
    pub fn declared_interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// # Errors
    /// See [`RemoteClient::call`].
    pub fn call(
        &self,
        attr: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        self.client.call(self.handle, attr, args)
    }

    /// # Errors
    /// See [`RemoteClient::get_attr`].
    pub fn get_attr(&self, attr: &str) -> Result<serde_json::Value, TransportError> {
        self.client.get_attr(self.handle, attr)
    }

    /// # Errors
    /// See [`RemoteClient::set_attr`].
    pub fn set_attr(&self, attr: &str, value: serde_json::Value) -> Result<(), TransportError> {
        self.client.set_attr(self.handle, attr, value)
    }
}

impl Drop for RemoteConnectorStub {
    fn drop(&mut self) {
        self.client.release(self.handle);
    }
}

fn client_thread(
    host: &str,
    port: u16,
    tls: Option<ClientTlsConfig>,
    rx: &std_mpsc::Receiver<ClientJob>,
    ready_tx: &std_mpsc::Sender<Result<(), String>>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| unreachable!("current-thread runtime must build: {e}"));

    let mut stream: BoxedStream = match rt.block_on(open_stream(host, port, tls.as_ref())) {
        Ok(s) => {
            let _ = ready_tx.send(Ok(()));
            s
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    while let Ok(job) = rx.recv() {
        rt.block_on(handle_job(&mut stream, job));
    }
}

async fn open_stream(
    host: &str,
    port: u16,
    tls: Option<&ClientTlsConfig>,
) -> Result<BoxedStream, TransportError> {
    let tcp = TcpStream::connect((host, port)).await?;
    match tls {
        None => Ok(Box::new(tcp)),
        Some(cfg) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in
                rustls_pemfile::certs(&mut cfg.root_ca_pem.as_slice()).filter_map(Result::ok)
            {
                let _ = roots.add(cert);
            }
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let server_name = ServerName::try_from(cfg.server_name.clone())
                .map_err(|e| TransportError::Codec(e.to_string()))?;
            let tls_stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(tls_stream))
        }
    }
}

async fn handle_job(stream: &mut BoxedStream, job: ClientJob) {
    match job {
        ClientJob::Acquire { module_name, reply } => {
            let req = Request::Acquire { module_name };
            let _ = reply.send(match roundtrip(stream, req).await {
                Ok(Response::Acquired { handle, interfaces }) => Ok((handle, interfaces)),
                Ok(Response::Error { class, message }) => Err(TransportError::Remote { class, message }),
                Ok(_) => Err(TransportError::Codec("unexpected response to acquire".into())),
                Err(e) => Err(e),
            });
        }
        ClientJob::Release { handle } => {
            let _ = roundtrip(stream, Request::Release { handle }).await;
        }
        ClientJob::Call {
            handle,
            attr,
            args,
            reply,
        } => {
            let req = Request::Call {
                handle,
                attr,
                args: args.into_iter().map(WireValue::from_json).collect(),
            };
            let _ = reply.send(value_response(roundtrip(stream, req).await));
        }
        ClientJob::GetAttr {
            handle,
            attr,
            reply,
        } => {
            let req = Request::GetAttr { handle, attr };
            let _ = reply.send(value_response(roundtrip(stream, req).await));
        }
        ClientJob::SetAttr {
            handle,
            attr,
            value,
            reply,
        } => {
            let req = Request::SetAttr {
                handle,
                attr,
                value: WireValue::from_json(value),
            };
            let _ = reply.send(match roundtrip(stream, req).await {
                Ok(Response::Released | Response::Value { .. }) => Ok(()),
                Ok(Response::Error { class, message }) => Err(TransportError::Remote { class, message }),
                Ok(_) => Err(TransportError::Codec("unexpected response to set_attr".into())),
                Err(e) => Err(e),
            });
        }
    }
}

fn value_response(
    resp: Result<Response, TransportError>,
) -> Result<serde_json::Value, TransportError> {
    match resp {
        Ok(Response::Value { value }) => Ok(value.into_json()),
        Ok(Response::Error { class, message }) => Err(TransportError::Remote { class, message }),
        Ok(_) => Err(TransportError::Codec("unexpected response shape".into())),
        Err(e) => Err(e),
    }
}

async fn roundtrip(stream: &mut BoxedStream, req: Request) -> Result<Response, TransportError> {
    write_frame(stream, &req).await?;
    read_frame(stream).await.map_err(TransportError::from)
}
