//! Remote module channel: a transparent proxy so a
//! `Connector` can bind to a module living in another process exactly as it
//! would bind to a local one, modulo the call-by-value boundary.

pub mod client;
pub mod codec;
pub mod server;

pub use client::{ClientTlsConfig, RemoteClient, RemoteConnectorStub};
pub use codec::{Request, Response, WireValue};
pub use server::{RemoteExportTarget, RemoteServer, ServerTlsConfig};
