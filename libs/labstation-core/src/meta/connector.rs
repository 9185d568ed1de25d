//! `Connector` descriptors: bound at activation time to a
//! transparent proxy over either a local module instance or a remote peer.
//! Connectors never hold a strong reference to their target: the manager is the sole owner, the proxy re-resolves the
//! target through it on each use.

use crate::error::{DescriptorError, TransportError};
use std::sync::{Arc, Weak};

/// Static description of one declared connector.
#[derive(Debug, Clone)]
pub struct ConnectorSpec {
    pub name: &'static str,
    pub interface: &'static str,
    pub optional: bool,
}

/// The dynamic surface every module exposes to connector proxies and to
/// remote peers, plus the
/// `isinstance`-equivalent interface-set check used when binding connectors.
pub trait DynInterface: Send + Sync {
    /// Interface identifiers this instance satisfies; checked against a
    /// connector's declared `interface` at bind time.
    fn declared_interfaces(&self) -> &'static [&'static str] {
        &[]
    }

    /// # Errors
    /// Returns [`DescriptorError`] for an unknown attribute or a call that
    /// the module declines to honor.
    fn dyn_call(
        &self,
        _attr: &str,
        _args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, DescriptorError> {
        Err(DescriptorError::UnboundConnector {
            module: String::new(),
            connector: String::new(),
        })
    }

    /// # Errors
    /// Returns [`DescriptorError`] for an unknown attribute.
    fn dyn_get_attr(&self, _attr: &str) -> Result<serde_json::Value, DescriptorError> {
        Err(DescriptorError::UnboundConnector {
            module: String::new(),
            connector: String::new(),
        })
    }

    /// # Errors
    /// Returns [`DescriptorError`] for an unknown or read-only attribute.
    fn dyn_set_attr(
        &self,
        _attr: &str,
        _value: serde_json::Value,
    ) -> Result<(), DescriptorError> {
        Err(DescriptorError::UnboundConnector {
            module: String::new(),
            connector: String::new(),
        })
    }
}

/// What a single connector resolved to at bind time.
#[derive(Clone)]
pub enum ConnectorBinding {
    /// Bound to a local module instance; held weakly so the proxy never
    /// prolongs the target's life.
    Local(Weak<dyn DynInterface>),
    /// Bound to a remote peer's handle.
    Remote(Arc<crate::remote::client::RemoteConnectorStub>),
    /// Optional connector with no config entry.
    Unbound,
}

/// The capability proxy handed to module code through a bound `Connector`.
/// Local and remote targets share this one surface; callers cannot tell
/// them apart for supported operations.
#[derive(Clone)]
pub struct ConnectorProxy {
    pub(crate) connector_name: String,
    pub(crate) owner_module: String,
    pub(crate) binding: ConnectorBinding,
}

impl ConnectorProxy {
    #[must_use]
    pub fn new(owner_module: String, connector_name: String, binding: ConnectorBinding) -> Self {
        Self {
            connector_name,
            owner_module,
            binding,
        }
    }

    fn unbound_error(&self) -> DescriptorError {
        DescriptorError::UnboundConnector {
            module: self.owner_module.clone(),
            connector: self.connector_name.clone(),
        }
    }

    /// # Errors
    /// [`DescriptorError::UnboundConnector`] if the connector has no target,
    /// or the target's own attribute errors, or a [`TransportError`] for a
    /// remote call wrapped as a descriptor error.
    pub fn call(
        &self,
        attr: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, DescriptorError> {
        match &self.binding {
            ConnectorBinding::Unbound => Err(self.unbound_error()),
            ConnectorBinding::Local(weak) => {
                let target = weak.upgrade().ok_or_else(|| self.unbound_error())?;
                target.dyn_call(attr, args)
            }
            ConnectorBinding::Remote(stub) => stub
                .call(attr, args)
                .map_err(|e| transport_to_descriptor(self, &e)),
        }
    }

    /// # Errors
    /// See [`ConnectorProxy::call`].
    pub fn get_attr(&self, attr: &str) -> Result<serde_json::Value, DescriptorError> {
        match &self.binding {
            ConnectorBinding::Unbound => Err(self.unbound_error()),
            ConnectorBinding::Local(weak) => {
                let target = weak.upgrade().ok_or_else(|| self.unbound_error())?;
                target.dyn_get_attr(attr)
            }
            ConnectorBinding::Remote(stub) => stub
                .get_attr(attr)
                .map_err(|e| transport_to_descriptor(self, &e)),
        }
    }

    /// # Errors
    /// See [`ConnectorProxy::call`].
    pub fn set_attr(&self, attr: &str, value: serde_json::Value) -> Result<(), DescriptorError> {
        match &self.binding {
            ConnectorBinding::Unbound => Err(self.unbound_error()),
            ConnectorBinding::Local(weak) => {
                let target = weak.upgrade().ok_or_else(|| self.unbound_error())?;
                target.dyn_set_attr(attr, value)
            }
            ConnectorBinding::Remote(stub) => stub
                .set_attr(attr, value)
                .map_err(|e| transport_to_descriptor(self, &e)),
        }
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        !matches!(self.binding, ConnectorBinding::Unbound)
    }
}

fn transport_to_descriptor(proxy: &ConnectorProxy, e: &TransportError) -> DescriptorError {
    // A broken remote proxy degrades to the same "unbound" surface the
    // caller already knows how to handle.
    let _ = e;
    proxy.unbound_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Echo;
    impl DynInterface for Echo {
        fn declared_interfaces(&self) -> &'static [&'static str] {
            &["demo.Echo"]
        }

        fn dyn_get_attr(&self, attr: &str) -> Result<serde_json::Value, DescriptorError> {
            if attr == "ping" {
                Ok(serde_json::Value::from("pong"))
            } else {
                Err(DescriptorError::UnboundConnector {
                    module: "echo".to_string(),
                    connector: attr.to_string(),
                })
            }
        }
    }

    #[test]
    fn unbound_optional_connector_fails_defined_error() {
        let proxy = ConnectorProxy::new(
            "lg_b".to_string(),
            "hardware".to_string(),
            ConnectorBinding::Unbound,
        );
        let err = proxy.get_attr("anything").expect_err("must be unbound");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }

    #[test]
    fn bound_local_connector_forwards_attribute_access() {
        let target: Arc<dyn DynInterface> = Arc::new(Echo);
        let weak = Arc::downgrade(&target);
        let proxy = ConnectorProxy::new(
            "lg_b".to_string(),
            "hardware".to_string(),
            ConnectorBinding::Local(weak),
        );
        let v = proxy.get_attr("ping").expect("bound");
        assert_eq!(v, serde_json::Value::from("pong"));
    }

    #[test]
    fn dropped_local_target_degrades_to_unbound_error() {
        let target: Arc<dyn DynInterface> = Arc::new(Echo);
        let weak = Arc::downgrade(&target);
        let proxy = ConnectorProxy::new(
            "lg_b".to_string(),
            "hardware".to_string(),
            ConnectorBinding::Local(weak),
        );
        drop(target);
        let err = proxy.get_attr("ping").expect_err("target gone");
        assert!(matches!(err, DescriptorError::UnboundConnector { .. }));
    }
}
