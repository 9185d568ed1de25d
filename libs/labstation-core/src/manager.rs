//! Module manager: the authoritative table of module
//! descriptors plus instances, keyed by name. Owns dependency-ordered
//! activation/deactivation and the refcounted "shared exporter" teardown a
//! deactivation walks on the way down.

use crate::config::{
    ModuleDescriptorRaw, ModuleKind, NormalizedModule, RemoteModuleDescriptor, ValidatedConfig,
};
use crate::error::{DescriptorError, HookError, InvariantError, ResolutionError, RuntimeError, TransportError};
use crate::fsm::{Fsm, FsmHandle, FsmState};
use crate::meta::{ConnectorBinding, ConnectorProxy, ConnectorSpec, DynInterface};
use crate::module::{self, Module, ModuleConstructArgs, ModuleCtx, ModuleLogger, ModuleMetaInfo};
use crate::remote::{ClientTlsConfig, RemoteClient, RemoteConnectorStub};
use crate::thread_manager::ThreadManager;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Structured event emitted on every state change, consumed by GUIs, servers and loggers alike.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    StateChanged {
        module: String,
        from: FsmState,
        to: FsmState,
    },
    ModuleBroken {
        module: String,
        reason: String,
    },
}

enum EntryKind {
    Local {
        instance: Arc<dyn Module>,
    },
    Remote {
        native_module_name: String,
        address: String,
        port: u16,
        root_ca_pem: Option<Vec<u8>>,
        stub: Mutex<Option<Arc<RemoteConnectorStub>>>,
    },
    Broken {
        reason: String,
    },
}

struct ModuleEntry {
    name: String,
    kind: ModuleKind,
    declaration_index: usize,
    threaded: bool,
    allow_remote: bool,
    connections: BTreeMap<String, String>,
    fsm: Arc<Fsm>,
    /// Set by a direct user `activate`/`deactivate` call.
    explicit: AtomicBool,
    /// How many currently-active modules depend on this one.
    dependent_count: AtomicUsize,
    /// How many remote peers currently hold an acquired handle on this
    /// module.
    remote_count: AtomicUsize,
    entry_kind: EntryKind,
}

/// One row of [`ModuleManager::snapshot`].
#[derive(Debug, Clone)]
pub struct ModuleSnapshotRow {
    pub name: String,
    pub kind: ModuleKind,
    pub state: FsmState,
    pub has_appdata: bool,
    pub thread: Option<String>,
    pub is_remote: bool,
    pub is_broken: bool,
}

/// Holds the authoritative table of module descriptors plus instances,
/// keyed by name. The only component allowed to mutate module state.
pub struct ModuleManager {
    thread_manager: Arc<ThreadManager>,
    app_state_dir: PathBuf,
    entries: DashMap<String, Arc<ModuleEntry>>,
    remote_clients: DashMap<(String, u16), Arc<RemoteClient>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl ModuleManager {
    /// Eagerly constructs every declared module: class resolution, option materialization and
    /// resolution-failure detection all happen once, deterministically, at
    /// startup. Activation is deferred entirely to [`ModuleManager::activate`].
    #[must_use]
    pub fn new(
        cfg: &ValidatedConfig,
        thread_manager: Arc<ThreadManager>,
        app_state_dir: PathBuf,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(256);
        let manager = Arc::new(Self {
            thread_manager,
            app_state_dir,
            entries: DashMap::new(),
            remote_clients: DashMap::new(),
            events,
        });
        for m in cfg.modules_in_declaration_order() {
            manager.construct_entry(m);
        }
        manager
    }

    fn construct_entry(&self, m: &NormalizedModule) {
        let connections = m.connections();
        let allow_remote = m.allow_remote();

        let entry_kind = match &m.descriptor {
            ModuleDescriptorRaw::Remote(r) => Self::construct_remote_entry(r),
            ModuleDescriptorRaw::Local(l) => match module::resolve_class(&l.module_class) {
                None => {
                    self.emit(ManagerEvent::ModuleBroken {
                        module: m.name.clone(),
                        reason: l.module_class.clone(),
                    });
                    EntryKind::Broken {
                        reason: l.module_class.clone(),
                    }
                }
                Some(class) => {
                    let meta = ModuleMetaInfo {
                        name: m.name.clone(),
                        kind: m.kind,
                        uuid: Uuid::new_v4(),
                        threaded: m.kind.default_threaded(),
                        default_data_dir: self.app_state_dir.join("data").join(&m.name),
                    };
                    let logger = ModuleLogger::new(&m.name);
                    let args = ModuleConstructArgs {
                        meta,
                        raw_options: &l.options,
                        logger,
                    };
                    match (class.construct)(&args) {
                        Ok(instance) => EntryKind::Local { instance },
                        Err(e) => {
                            self.emit(ManagerEvent::ModuleBroken {
                                module: m.name.clone(),
                                reason: e.to_string(),
                            });
                            EntryKind::Broken {
                                reason: e.to_string(),
                            }
                        }
                    }
                }
            },
        };

        let threaded = matches!(&entry_kind, EntryKind::Local { instance } if instance.meta().threaded);

        let entry = Arc::new(ModuleEntry {
            name: m.name.clone(),
            kind: m.kind,
            declaration_index: m.declaration_index,
            threaded,
            allow_remote,
            connections,
            fsm: Arc::new(Fsm::new(m.name.clone())),
            explicit: AtomicBool::new(false),
            dependent_count: AtomicUsize::new(0),
            remote_count: AtomicUsize::new(0),
            entry_kind,
        });
        self.entries.insert(m.name.clone(), entry);
    }

    fn construct_remote_entry(r: &RemoteModuleDescriptor) -> EntryKind {
        // `certfile` doubles as the client-side root CA bundle used to
        // verify the remote peer's certificate.
        let root_ca_pem = r.certfile.as_ref().and_then(|p| std::fs::read(p).ok());
        EntryKind::Remote {
            native_module_name: r.native_module_name.clone(),
            address: r.address.clone(),
            port: r.port,
            root_ca_pem,
            stub: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    fn require_entry(&self, name: &str) -> Result<Arc<ModuleEntry>, RuntimeError> {
        self.entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| RuntimeError::Invariant(InvariantError::UnknownModule(name.to_string())))
    }

    fn is_needed(entry: &ModuleEntry) -> bool {
        entry.explicit.load(Ordering::SeqCst)
            || entry.dependent_count.load(Ordering::SeqCst) > 0
            || entry.remote_count.load(Ordering::SeqCst) > 0
    }

    fn tie_break_key(&self, name: &str) -> Reverse<(u8, usize, String)> {
        let entry = self
            .entries
            .get(name)
            .unwrap_or_else(|| unreachable!("topo_closure only keys nodes already in the table"));
        Reverse((entry.kind.activation_rank(), entry.declaration_index, name.to_string()))
    }

    /// Topologically sorts the transitive closure of `root`'s dependency
    /// graph (edges from a module to the connector targets it names in
    /// `connect:`), honoring the declaration-order tie-break. `root` is the
    /// last element of the returned order.
    ///
    /// # Errors
    /// [`DescriptorError::CyclicDependency`] if the graph is cyclic.
    fn topo_closure(&self, root: &str) -> Result<Vec<String>, DescriptorError> {
        let mut nodes: HashSet<String> = HashSet::new();
        let mut stack = vec![root.to_string()];
        while let Some(n) = stack.pop() {
            if !nodes.insert(n.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&n) {
                for target in entry.connections.values() {
                    if self.entries.contains_key(target) {
                        stack.push(target.clone());
                    }
                }
            }
        }

        let mut in_degree: HashMap<String, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
        let mut dependents_of: HashMap<String, Vec<String>> = HashMap::new();
        for n in &nodes {
            let entry = self
                .entries
                .get(n)
                .unwrap_or_else(|| unreachable!("n came from the nodes set built above"));
            for target in entry.connections.values() {
                if nodes.contains(target) {
                    *in_degree
                        .get_mut(n)
                        .unwrap_or_else(|| unreachable!("n is a key of in_degree")) += 1;
                    dependents_of.entry(target.clone()).or_default().push(n.clone());
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(u8, usize, String)>> = nodes
            .iter()
            .filter(|n| in_degree[*n] == 0)
            .map(|n| self.tie_break_key(n))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse((_, _, n))) = ready.pop() {
            order.push(n.clone());
            if let Some(deps) = dependents_of.get(&n) {
                for d in deps {
                    let deg = in_degree
                        .get_mut(d)
                        .unwrap_or_else(|| unreachable!("d is a key of in_degree"));
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(self.tie_break_key(d));
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            let cycle: Vec<String> = nodes.into_iter().filter(|n| !order.contains(n)).collect();
            return Err(DescriptorError::CyclicDependency {
                module: root.to_string(),
                cycle: cycle.join(" -> "),
            });
        }

        Ok(order)
    }

    fn build_connectors(
        &self,
        entry: &ModuleEntry,
        specs: &'static [ConnectorSpec],
    ) -> Result<BTreeMap<String, ConnectorProxy>, DescriptorError> {
        let mut out = BTreeMap::new();
        for spec in specs {
            let target_name = entry.connections.get(spec.name);
            let binding = match target_name {
                None => {
                    if spec.optional {
                        ConnectorBinding::Unbound
                    } else {
                        return Err(DescriptorError::UnresolvedConnector {
                            module: entry.name.clone(),
                            connector: spec.name.to_string(),
                        });
                    }
                }
                Some(target) => match self.entries.get(target) {
                    None => {
                        return Err(DescriptorError::UnknownConnectorTarget {
                            module: entry.name.clone(),
                            connector: spec.name.to_string(),
                            target: target.clone(),
                        });
                    }
                    Some(target_entry) => match &target_entry.entry_kind {
                        EntryKind::Local { instance } => {
                            if !instance.declared_interfaces().contains(&spec.interface) {
                                return Err(DescriptorError::InterfaceMismatch {
                                    module: entry.name.clone(),
                                    connector: spec.name.to_string(),
                                    interface: spec.interface.to_string(),
                                    target: target.clone(),
                                });
                            }
                            let di: Arc<dyn DynInterface> = instance.clone();
                            ConnectorBinding::Local(Arc::downgrade(&di))
                        }
                        EntryKind::Remote { stub, .. } => match stub.lock().clone() {
                            Some(s) => {
                                if !s.declared_interfaces().iter().any(|i| i == spec.interface) {
                                    return Err(DescriptorError::InterfaceMismatch {
                                        module: entry.name.clone(),
                                        connector: spec.name.to_string(),
                                        interface: spec.interface.to_string(),
                                        target: target.clone(),
                                    });
                                }
                                ConnectorBinding::Remote(s)
                            }
                            None => ConnectorBinding::Unbound,
                        },
                        EntryKind::Broken { .. } => ConnectorBinding::Unbound,
                    },
                },
            };
            out.insert(
                spec.name.to_string(),
                ConnectorProxy::new(entry.name.clone(), spec.name.to_string(), binding),
            );
        }
        Ok(out)
    }

    fn remote_client_for(
        &self,
        address: &str,
        port: u16,
        root_ca_pem: &Option<Vec<u8>>,
    ) -> Result<Arc<RemoteClient>, TransportError> {
        let key = (address.to_string(), port);
        if let Some(c) = self.remote_clients.get(&key) {
            return Ok(c.clone());
        }
        let tls = root_ca_pem.clone().map(|pem| ClientTlsConfig {
            root_ca_pem: pem,
            server_name: address.to_string(),
        });
        let client = RemoteClient::connect(address, port, tls)?;
        self.remote_clients.insert(key, client.clone());
        Ok(client)
    }

    /// Idempotent: a no-op if `name` is already `idle`/`locked`.
    /// On first activation, topologically sorts and activates the
    /// transitive closure of `name`'s required/optional-but-configured
    /// connectors before `name` itself.
    ///
    /// # Errors
    /// Propagates whatever resolution/descriptor/hook/invariant/transport
    /// error aborted activation of `name` or one of its dependencies.
    /// Dependencies already activated on `name`'s behalf are *not* rolled
    /// back on failure — they remain live roots awaiting explicit
    /// deactivation.
    pub async fn activate(&self, name: &str) -> Result<(), RuntimeError> {
        let root = self.require_entry(name)?;
        root.explicit.store(true, Ordering::SeqCst);
        if root.fsm.state().is_live() {
            return Ok(());
        }

        let order = self.topo_closure(name)?;
        for n in &order {
            let entry = self.require_entry(n)?;
            // Every non-root node in the closure gains one more dependent
            // (this activation), whether or not it was already live — two
            // independently-activated modules sharing a dependency must
            // both be counted, or the dependency cascades away the moment
            // the first of them deactivates.
            if n != name {
                entry.dependent_count.fetch_add(1, Ordering::SeqCst);
            }
            if entry.fsm.state().is_live() {
                continue;
            }
            self.activate_one(&entry).await?;
        }
        Ok(())
    }

    async fn activate_one(&self, entry: &Arc<ModuleEntry>) -> Result<(), RuntimeError> {
        if entry.fsm.state().is_live() {
            return Ok(());
        }

        match &entry.entry_kind {
            EntryKind::Broken { reason } => Err(RuntimeError::Resolution(ResolutionError::ClassNotFound {
                name: entry.name.clone(),
                implementation_ref: reason.clone(),
            })),
            EntryKind::Local { instance } => self.activate_local(entry, instance).await,
            EntryKind::Remote {
                native_module_name,
                address,
                port,
                root_ca_pem,
                stub,
            } => {
                self.activate_remote(entry, native_module_name, address, *port, root_ca_pem, stub)
                    .await
            }
        }
    }

    async fn activate_local(
        &self,
        entry: &Arc<ModuleEntry>,
        instance: &Arc<dyn Module>,
    ) -> Result<(), RuntimeError> {
        entry.fsm.begin_activate()?;
        self.emit(ManagerEvent::StateChanged {
            module: entry.name.clone(),
            from: FsmState::Deactivated,
            to: FsmState::Activating,
        });

        let connectors = match self.build_connectors(entry, instance.connector_specs()) {
            Ok(c) => c,
            Err(e) => {
                entry.fsm.activate_failed()?;
                self.emit(ManagerEvent::StateChanged {
                    module: entry.name.clone(),
                    from: FsmState::Activating,
                    to: FsmState::Deactivated,
                });
                return Err(RuntimeError::Descriptor(e));
            }
        };

        let logger = ModuleLogger::new(&entry.name);
        instance.load_status(&self.app_state_dir, &logger);

        let ctx = ModuleCtx {
            meta: instance.meta().clone(),
            logger,
            app_state_dir: self.app_state_dir.clone(),
            connectors,
            state: FsmHandle::new(entry.fsm.clone()),
        };

        let hook_result: anyhow::Result<()> = if entry.threaded {
            self.thread_manager.get_or_create(&entry.name);
            let inst = instance.clone();
            let ctx2 = ctx.clone();
            match self
                .thread_manager
                .dispatch(&entry.name, move || async move { inst.on_activate(&ctx2).await }, None)
                .await
            {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!(e)),
            }
        } else {
            instance.on_activate(&ctx).await
        };

        match hook_result {
            Ok(()) => {
                entry.fsm.activate_succeeded()?;
                self.emit(ManagerEvent::StateChanged {
                    module: entry.name.clone(),
                    from: FsmState::Activating,
                    to: FsmState::Idle,
                });
                Ok(())
            }
            Err(e) => {
                entry.fsm.activate_failed()?;
                self.emit(ManagerEvent::StateChanged {
                    module: entry.name.clone(),
                    from: FsmState::Activating,
                    to: FsmState::Deactivated,
                });
                Err(RuntimeError::Hook(HookError::ActivateFailed {
                    module: entry.name.clone(),
                    source: e,
                }))
            }
        }
    }

    async fn activate_remote(
        &self,
        entry: &Arc<ModuleEntry>,
        native_module_name: &str,
        address: &str,
        port: u16,
        root_ca_pem: &Option<Vec<u8>>,
        stub: &Mutex<Option<Arc<RemoteConnectorStub>>>,
    ) -> Result<(), RuntimeError> {
        entry.fsm.begin_activate()?;
        self.emit(ManagerEvent::StateChanged {
            module: entry.name.clone(),
            from: FsmState::Deactivated,
            to: FsmState::Activating,
        });

        let outcome = self
            .remote_client_for(address, port, root_ca_pem)
            .and_then(|client| client.acquire(native_module_name));

        match outcome {
            Ok(acquired) => {
                *stub.lock() = Some(Arc::new(acquired));
                entry.fsm.activate_succeeded()?;
                self.emit(ManagerEvent::StateChanged {
                    module: entry.name.clone(),
                    from: FsmState::Activating,
                    to: FsmState::Idle,
                });
                Ok(())
            }
            Err(e) => {
                entry.fsm.activate_failed()?;
                self.emit(ManagerEvent::StateChanged {
                    module: entry.name.clone(),
                    from: FsmState::Activating,
                    to: FsmState::Deactivated,
                });
                Err(RuntimeError::Transport(e))
            }
        }
    }

    fn live_dependents_of(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().fsm.state().is_live() && e.value().connections.values().any(|t| t == name))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Recursively deactivates dependents first (top-down closure), then
    /// `name` itself; after `name` comes down, walks its own dependencies
    /// and cascades further deactivation to any that are no longer needed
    /// by any other explicit user, dependent, or remote acquirer. Persisted
    /// status is dumped regardless of hook outcome.
    ///
    /// # Errors
    /// Propagates a hook or invariant failure encountered while tearing down
    /// `name` or one of its forced-down dependents/dependencies.
    pub async fn deactivate(&self, name: &str) -> Result<(), RuntimeError> {
        self.require_entry(name)?.explicit.store(false, Ordering::SeqCst);

        let mut queue: VecDeque<String> = VecDeque::from([name.to_string()]);
        let mut processed: HashSet<String> = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if processed.contains(&current) {
                continue;
            }
            let Some(entry) = self.entries.get(&current).map(|e| e.value().clone()) else {
                continue;
            };
            if !entry.fsm.state().is_live() {
                processed.insert(current);
                continue;
            }

            let pending: Vec<String> = self
                .live_dependents_of(&current)
                .into_iter()
                .filter(|d| !processed.contains(d))
                .collect();
            if !pending.is_empty() {
                queue.push_front(current);
                for d in pending.into_iter().rev() {
                    queue.push_front(d);
                }
                continue;
            }

            self.deactivate_one(&entry).await?;
            processed.insert(current);

            for target in entry.connections.values() {
                let Some(target_entry) = self.entries.get(target).map(|e| e.value().clone()) else {
                    continue;
                };
                // Saturating: a target whose count already dropped to 0
                // (e.g. it was deactivated through some other path) must
                // not wrap around to `usize::MAX`.
                let was = target_entry
                    .dependent_count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
                    .unwrap_or(0);
                if was <= 1 && target_entry.fsm.state().is_live() && !Self::is_needed(&target_entry) {
                    queue.push_back(target.clone());
                }
            }
        }

        Ok(())
    }

    async fn deactivate_one(&self, entry: &Arc<ModuleEntry>) -> Result<(), RuntimeError> {
        let from = entry.fsm.state();
        entry.fsm.begin_deactivate()?;
        self.emit(ManagerEvent::StateChanged {
            module: entry.name.clone(),
            from,
            to: FsmState::Deactivating,
        });

        let hook_result: anyhow::Result<()> = match &entry.entry_kind {
            EntryKind::Local { instance } => {
                let connectors = self
                    .build_connectors(entry, instance.connector_specs())
                    .unwrap_or_default();
                let logger = ModuleLogger::new(&entry.name);
                let ctx = ModuleCtx {
                    meta: instance.meta().clone(),
                    logger,
                    app_state_dir: self.app_state_dir.clone(),
                    connectors,
                    state: FsmHandle::new(entry.fsm.clone()),
                };
                if entry.threaded {
                    let inst = instance.clone();
                    let ctx2 = ctx.clone();
                    match self
                        .thread_manager
                        .dispatch(&entry.name, move || async move { inst.on_deactivate(&ctx2).await }, None)
                        .await
                    {
                        Ok(r) => r,
                        Err(e) => Err(anyhow::anyhow!(e)),
                    }
                } else {
                    instance.on_deactivate(&ctx).await
                }
            }
            EntryKind::Remote { stub, .. } => {
                // `Drop` on the stub releases the server-side handle.
                *stub.lock() = None;
                Ok(())
            }
            EntryKind::Broken { .. } => Ok(()),
        };

        if let Err(e) = &hook_result {
            tracing::error!(module = %entry.name, error = %e, "on_deactivate failed");
        }

        if let EntryKind::Local { instance } = &entry.entry_kind {
            instance.dump_status(&self.app_state_dir, &ModuleLogger::new(&entry.name));
        }

        if entry.threaded {
            self.thread_manager.release(&entry.name);
        }

        entry.fsm.finish_deactivate()?;
        self.emit(ManagerEvent::StateChanged {
            module: entry.name.clone(),
            from: FsmState::Deactivating,
            to: FsmState::Deactivated,
        });

        hook_result.map_err(|e| {
            RuntimeError::Hook(HookError::DeactivateFailed {
                module: entry.name.clone(),
                source: e,
            })
        })
    }

    /// Equivalent to `deactivate` then `activate`; does not re-resolve the
    /// module class.
    ///
    /// # Errors
    /// See [`ModuleManager::deactivate`] and [`ModuleManager::activate`].
    pub async fn reload(&self, name: &str) -> Result<(), RuntimeError> {
        self.deactivate(name).await?;
        self.activate(name).await
    }

    /// Activates every module named in `global.startup_modules`, in the order given.
    ///
    /// # Errors
    /// Propagates the first activation failure encountered.
    pub async fn activate_startup_modules(&self, names: &[String]) -> Result<(), RuntimeError> {
        for name in names {
            self.activate(name).await?;
        }
        Ok(())
    }

    /// Ordered read-only view suitable for table rendering.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ModuleSnapshotRow> {
        let mut entries: Vec<Arc<ModuleEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| (e.kind.activation_rank(), e.declaration_index));
        entries
            .into_iter()
            .map(|entry| ModuleSnapshotRow {
                name: entry.name.clone(),
                kind: entry.kind,
                state: entry.fsm.state(),
                has_appdata: matches!(entry.entry_kind, EntryKind::Local { .. }),
                thread: entry.threaded.then(|| entry.name.clone()),
                is_remote: matches!(entry.entry_kind, EntryKind::Remote { .. }),
                is_broken: matches!(entry.entry_kind, EntryKind::Broken { .. }),
            })
            .collect()
    }

    fn dyn_dispatch<T>(
        &self,
        module: &str,
        f: impl FnOnce(&Arc<dyn Module>) -> Result<T, DescriptorError>,
    ) -> Result<T, TransportError> {
        let entry = self
            .entries
            .get(module)
            .ok_or_else(|| TransportError::NotRemotable {
                module: module.to_string(),
            })?;
        match &entry.entry_kind {
            EntryKind::Local { instance } => f(instance).map_err(|e| TransportError::Remote {
                class: "DescriptorError".to_string(),
                message: e.to_string(),
            }),
            _ => Err(TransportError::NotRemotable {
                module: module.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl crate::remote::server::RemoteExportTarget for ModuleManager {
    fn allow_remote(&self, module: &str) -> bool {
        self.entries.get(module).is_some_and(|e| e.allow_remote)
    }

    fn remotable_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().allow_remote)
            .map(|e| e.key().clone())
            .collect()
    }

    fn declared_interfaces(&self, module: &str) -> Vec<String> {
        match self.entries.get(module).map(|e| e.value().clone()) {
            Some(entry) => match &entry.entry_kind {
                EntryKind::Local { instance } => instance
                    .declared_interfaces()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                EntryKind::Remote { .. } | EntryKind::Broken { .. } => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    async fn acquire_for_remote(&self, module: &str) -> Result<(), TransportError> {
        let entry = self
            .entries
            .get(module)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransportError::NotRemotable {
                module: module.to_string(),
            })?;
        entry.remote_count.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.activate(module).await {
            entry.remote_count.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::Remote {
                class: "ActivationFailed".to_string(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    async fn release_for_remote(&self, module: &str) {
        let Some(entry) = self.entries.get(module).map(|e| e.value().clone()) else {
            return;
        };
        let prev = entry.remote_count.fetch_sub(1, Ordering::SeqCst);
        if prev <= 1 && !Self::is_needed(&entry) {
            let _ = self.deactivate(module).await;
        }
    }

    fn call(&self, module: &str, attr: &str, args: Vec<serde_json::Value>) -> Result<serde_json::Value, TransportError> {
        self.dyn_dispatch(module, |inst| inst.dyn_call(attr, args))
    }

    fn get_attr(&self, module: &str, attr: &str) -> Result<serde_json::Value, TransportError> {
        self.dyn_dispatch(module, |inst| inst.dyn_get_attr(attr))
    }

    fn set_attr(&self, module: &str, attr: &str, value: serde_json::Value) -> Result<(), TransportError> {
        self.dyn_dispatch(module, |inst| inst.dyn_set_attr(attr, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GlobalConfig, LocalModuleDescriptor};
    use async_trait::async_trait;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::AtomicU32;

    struct Echo {
        meta: ModuleMetaInfo,
        activations: AtomicU32,
    }

    #[async_trait]
    impl Module for Echo {
        fn meta(&self) -> &ModuleMetaInfo {
            &self.meta
        }
        async fn on_activate(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_deactivate(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
    impl DynInterface for Echo {}

    fn validated_config(yaml_like: Vec<(&str, ModuleKind, Map<String, String>)>) -> ValidatedConfig {
        // Builds a ValidatedConfig directly rather than round-tripping
        // through YAML, matching this module's narrow unit-test scope.
        let mut modules = std::collections::BTreeMap::new();
        for (index, (name, kind, connect)) in yaml_like.into_iter().enumerate() {
            modules.insert(
                name.to_string(),
                NormalizedModule {
                    name: name.to_string(),
                    kind,
                    declaration_index: index,
                    descriptor: ModuleDescriptorRaw::Local(LocalModuleDescriptor {
                        module_class: format!("test.{name}"),
                        allow_remote: false,
                        options: serde_json::Map::new(),
                        connections: connect.into_iter().collect(),
                    }),
                },
            );
        }
        ValidatedConfig::for_tests(GlobalConfig::default(), modules)
    }

    fn manager_with_echo_classes(cfg: &ValidatedConfig, names: &[&str]) -> Arc<ModuleManager> {
        let tm = Arc::new(ThreadManager::new());
        let manager = ModuleManager::new(cfg, tm, std::env::temp_dir().join("labstation-manager-test"));
        // Since `inventory`-registered classes can't be created ad hoc in a
        // unit test, every "broken" entry the eager pass produced is
        // replaced here with a constructed `Echo`, matching what a real
        // `inventory::submit!` registration would have produced.
        for name in names {
            let kind = manager
                .entries
                .get(*name)
                .map(|e| e.value().kind)
                .unwrap_or(ModuleKind::Logic);
            let meta = ModuleMetaInfo {
                name: (*name).to_string(),
                kind,
                uuid: Uuid::new_v4(),
                threaded: kind.default_threaded(),
                default_data_dir: std::env::temp_dir(),
            };
            let instance: Arc<dyn Module> = Arc::new(Echo {
                meta,
                activations: AtomicU32::new(0),
            });
            if let Some(mut entry) = manager.entries.get_mut(*name) {
                let connections = entry.connections.clone();
                let declaration_index = entry.declaration_index;
                *entry = Arc::new(ModuleEntry {
                    name: (*name).to_string(),
                    kind,
                    declaration_index,
                    threaded: instance.meta().threaded,
                    allow_remote: false,
                    connections,
                    fsm: Arc::new(Fsm::new(*name)),
                    explicit: AtomicBool::new(false),
                    dependent_count: AtomicUsize::new(0),
                    remote_count: AtomicUsize::new(0),
                    entry_kind: EntryKind::Local { instance },
                });
            }
        }
        manager
    }

    #[tokio::test]
    async fn two_modules_one_connector_activate_in_dependency_order() {
        let mut connect = Map::new();
        connect.insert("hardware".to_string(), "hw_a".to_string());
        let cfg = validated_config(vec![
            ("hw_a", ModuleKind::Hardware, Map::new()),
            ("lg_b", ModuleKind::Logic, connect),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["hw_a", "lg_b"]);

        manager.activate("lg_b").await.expect("activates");
        let snap = manager.snapshot();
        let hw = snap.iter().find(|r| r.name == "hw_a").expect("present");
        let lg = snap.iter().find(|r| r.name == "lg_b").expect("present");
        assert_eq!(hw.state, FsmState::Idle);
        assert_eq!(lg.state, FsmState::Idle);

        manager.deactivate("hw_a").await.expect("deactivates");
        let snap = manager.snapshot();
        assert_eq!(snap.iter().find(|r| r.name == "hw_a").unwrap().state, FsmState::Deactivated);
        assert_eq!(snap.iter().find(|r| r.name == "lg_b").unwrap().state, FsmState::Deactivated);
    }

    #[tokio::test]
    async fn deactivating_hardware_cascades_to_its_dependent_first() {
        let mut connect = Map::new();
        connect.insert("hardware".to_string(), "hw_a".to_string());
        let cfg = validated_config(vec![
            ("hw_a", ModuleKind::Hardware, Map::new()),
            ("lg_b", ModuleKind::Logic, connect),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["hw_a", "lg_b"]);
        manager.activate("lg_b").await.expect("activates");

        // hw_a was activated purely as lg_b's dependency; deactivating it
        // directly must force lg_b down too rather than erroring.
        manager.deactivate("hw_a").await.expect("cascades");
        let snap = manager.snapshot();
        assert_eq!(snap.iter().find(|r| r.name == "lg_b").unwrap().state, FsmState::Deactivated);
    }

    #[tokio::test]
    async fn activating_a_root_does_not_disturb_an_unrelated_module() {
        let cfg = validated_config(vec![
            ("hw_a", ModuleKind::Hardware, Map::new()),
            ("hw_b", ModuleKind::Hardware, Map::new()),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["hw_a", "hw_b"]);
        manager.activate("hw_a").await.expect("activates");
        let snap = manager.snapshot();
        assert_eq!(snap.iter().find(|r| r.name == "hw_a").unwrap().state, FsmState::Idle);
        assert_eq!(snap.iter().find(|r| r.name == "hw_b").unwrap().state, FsmState::Deactivated);
    }

    #[tokio::test]
    async fn shared_dependency_survives_while_a_sibling_activator_remains_live() {
        let mut connect_b = Map::new();
        connect_b.insert("hardware".to_string(), "hw_a".to_string());
        let mut connect_c = Map::new();
        connect_c.insert("hardware".to_string(), "hw_a".to_string());
        let cfg = validated_config(vec![
            ("hw_a", ModuleKind::Hardware, Map::new()),
            ("lg_b", ModuleKind::Logic, connect_b),
            ("lg_c", ModuleKind::Logic, connect_c),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["hw_a", "lg_b", "lg_c"]);

        manager.activate("lg_b").await.expect("activates");
        manager.activate("lg_c").await.expect("activates");

        // hw_a is now live on behalf of two independent activators; tearing
        // down the first must not cascade hw_a away while lg_c still needs it.
        manager.deactivate("lg_b").await.expect("deactivates");
        let snap = manager.snapshot();
        assert_eq!(snap.iter().find(|r| r.name == "hw_a").unwrap().state, FsmState::Idle);
        assert_eq!(snap.iter().find(|r| r.name == "lg_c").unwrap().state, FsmState::Idle);

        manager.deactivate("lg_c").await.expect("deactivates");
        let snap = manager.snapshot();
        assert_eq!(snap.iter().find(|r| r.name == "hw_a").unwrap().state, FsmState::Deactivated);
    }

    static MISMATCHED_HARDWARE_SPEC: &[ConnectorSpec] = &[ConnectorSpec {
        name: "hardware",
        interface: "demo.hardware.Thermometer",
        optional: false,
    }];

    #[test]
    fn build_connectors_rejects_a_local_target_missing_the_declared_interface() {
        let mut connect = Map::new();
        connect.insert("hardware".to_string(), "hw_a".to_string());
        let cfg = validated_config(vec![
            ("hw_a", ModuleKind::Hardware, Map::new()),
            ("lg_b", ModuleKind::Logic, connect),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["hw_a", "lg_b"]);
        let lg_b = manager.entries.get("lg_b").expect("present").value().clone();

        // Echo declares no interfaces, so it cannot satisfy a connector
        // requiring "demo.hardware.Thermometer".
        let err = manager
            .build_connectors(&lg_b, MISMATCHED_HARDWARE_SPEC)
            .expect_err("target does not declare the required interface");
        assert!(matches!(err, DescriptorError::InterfaceMismatch { .. }));
    }

    #[test]
    fn cyclic_connector_graph_is_rejected() {
        let mut a_to_b = Map::new();
        a_to_b.insert("peer".to_string(), "b".to_string());
        let mut b_to_a = Map::new();
        b_to_a.insert("peer".to_string(), "a".to_string());
        let cfg = validated_config(vec![
            ("a", ModuleKind::Logic, a_to_b),
            ("b", ModuleKind::Logic, b_to_a),
        ]);
        let manager = manager_with_echo_classes(&cfg, &["a", "b"]);
        let err = manager.topo_closure("a").expect_err("cyclic graph must be rejected");
        assert!(matches!(err, DescriptorError::CyclicDependency { .. }));
    }
}
