//! Module base: the read-only meta every module exposes, its
//! module-scoped logger, and the lifecycle-hook contract. The FSM itself
//! lives in [`crate::fsm`].

use crate::config::ModuleKind;
use crate::fsm::FsmHandle;
use crate::meta::DynInterface;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Read-only identity/meta every module instance exposes.
#[derive(Debug, Clone)]
pub struct ModuleMetaInfo {
    pub name: String,
    pub kind: ModuleKind,
    pub uuid: Uuid,
    pub threaded: bool,
    pub default_data_dir: std::path::PathBuf,
}

/// Thread-safe, record-based, module-scoped logger. Built
/// on `tracing`: every record carries the owning module's name as a field
/// so a single subscriber can demultiplex per-module output.
#[derive(Debug, Clone)]
pub struct ModuleLogger {
    module: Arc<str>,
}

impl ModuleLogger {
    #[must_use]
    pub fn new(module: &str) -> Self {
        Self {
            module: Arc::from(module),
        }
    }

    /// Builds a logger for use in unit tests, where no subscriber may be
    /// installed; records are still emitted through `tracing` and simply
    /// go nowhere without a subscriber.
    #[must_use]
    pub fn for_test(module: &str) -> Self {
        Self::new(module)
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(module = %self.module, "{msg}");
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(module = %self.module, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(module = %self.module, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(module = %self.module, "{msg}");
    }

    /// `critical` additionally initiates orderly shutdown; the
    /// logging call itself only records, the shutdown trigger is the
    /// caller's responsibility (usually the module manager observing the
    /// emitted event).
    pub fn critical(&self, msg: &str) {
        tracing::error!(module = %self.module, critical = true, "{msg}");
    }
}

/// Per-instance context handed to lifecycle hooks: the module's own meta,
/// its logger, and the per-user app-state directory for status files.
/// Deliberately thin — cross-module access happens only through bound
/// `Connector` proxies, never through this struct.
#[derive(Clone)]
pub struct ModuleCtx {
    pub meta: ModuleMetaInfo,
    pub logger: ModuleLogger,
    pub app_state_dir: std::path::PathBuf,
    /// Proxies for this instance's bound `Connector`s, keyed by declared
    /// connector name.
    pub connectors: std::collections::BTreeMap<String, crate::meta::ConnectorProxy>,
    /// The module's own FSM handle (`idle <-> locked` self-lock only; see
    /// I2). Hooks read and toggle their own lock state through this, never
    /// through any other transition.
    pub state: FsmHandle,
}

/// Every module implements this: lifecycle hooks plus the
/// dynamic attribute surface connectors and remote peers dispatch through.
#[async_trait]
pub trait Module: DynInterface + Send + Sync + 'static {
    fn meta(&self) -> &ModuleMetaInfo;

    /// Runs once per activation, on the module's worker (main thread if
    /// `threaded=false`). Must be overridden; the default errors so a
    /// forgotten override is loud rather than silently inert.
    async fn on_activate(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Runs once per deactivation, before the state flips to `deactivated`.
    /// Status dump happens after this returns or raises, still before
    /// `deactivated`.
    async fn on_deactivate(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Loads this module's `Status` fields from `app_state_dir`, called by
    /// the manager just before `on_activate`. The default
    /// is a no-op for modules declaring no `Status` fields; generated
    /// implementations delegate to [`crate::meta::status::load`].
    fn load_status(&self, _app_state_dir: &std::path::Path, _logger: &ModuleLogger) {}

    /// Dumps this module's `Status` fields, called by the manager after
    /// `on_deactivate` returns or raises, before the state flips to
    /// `deactivated`. Default is a no-op.
    fn dump_status(&self, _app_state_dir: &std::path::Path, _logger: &ModuleLogger) {}

    /// Declared `Connector`s this module's class exposes. The
    /// default is empty for modules declaring none; generated
    /// implementations list every `Connector` field so the manager knows
    /// which config `connect:` entries are required vs. optional.
    fn connector_specs(&self) -> &'static [crate::meta::ConnectorSpec] {
        &[]
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Constructor inputs for a module class: raw config
/// options plus the identity/logger the instance is built with. `Option`
/// materialization happens inside the constructor function itself, setting
/// each value exactly once, at construction.
pub struct ModuleConstructArgs<'a> {
    pub meta: ModuleMetaInfo,
    pub raw_options: &'a serde_json::Map<String, serde_json::Value>,
    pub logger: ModuleLogger,
}

/// One registered module class. Modules register themselves with `inventory::submit!` so the
/// manager can resolve the opaque `implementation_ref` string from config to
/// a constructible type without a central match statement.
pub struct ModuleClass {
    pub implementation_ref: &'static str,
    pub construct:
        fn(&ModuleConstructArgs<'_>) -> Result<Arc<dyn Module>, crate::error::DescriptorError>,
}

inventory::collect!(ModuleClass);

/// Looks up a registered class by its config-level `module.Class` locator.
#[must_use]
pub fn resolve_class(implementation_ref: &str) -> Option<&'static ModuleClass> {
    inventory::iter::<ModuleClass>()
        .find(|c| c.implementation_ref == implementation_ref)
}
