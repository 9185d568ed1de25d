//! Typed `serde` structs standing in for JSON-Schema draft-07 validation:
//! the same required/optional/default semantics, reproduced as Rust types
//! and a hand-rolled [`validate`] pass instead of a schema-engine dependency.

use crate::error::ValidationError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

fn is_valid_identifier(name: &str) -> bool {
    static IDENT: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .unwrap_or_else(|e| unreachable!("static identifier pattern must compile: {e}"))
    });
    IDENT.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    Gui,
    Logic,
    Hardware,
}

impl ModuleKind {
    /// Tie-break order for activation within a topological level:
    /// hardware before logic before gui.
    #[must_use]
    pub fn activation_rank(self) -> u8 {
        match self {
            ModuleKind::Hardware => 0,
            ModuleKind::Logic => 1,
            ModuleKind::Gui => 2,
        }
    }

    #[must_use]
    pub fn default_threaded(self) -> bool {
        matches!(self, ModuleKind::Logic)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Gui => "gui",
            ModuleKind::Logic => "logic",
            ModuleKind::Hardware => "hardware",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub startup_modules: Vec<String>,
    #[serde(default)]
    pub remote_modules_server: Option<RemoteServerConfig>,
    #[serde(default = "default_namespace_server_port")]
    pub namespace_server_port: u16,
    #[serde(default = "default_true")]
    pub force_remote_calls_by_value: bool,
    #[serde(default)]
    pub hide_manager_window: bool,
    #[serde(default = "default_stylesheet")]
    pub stylesheet: String,
    #[serde(default)]
    pub default_data_dir: Option<String>,
    #[serde(default = "default_true")]
    pub daily_data_dirs: bool,
    #[serde(default)]
    pub extension_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_namespace_server_port() -> u16 {
    18861
}
fn default_stylesheet() -> String {
    "qdark.qss".to_string()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            startup_modules: Vec::new(),
            remote_modules_server: None,
            namespace_server_port: default_namespace_server_port(),
            force_remote_calls_by_value: true,
            hide_manager_window: false,
            stylesheet: default_stylesheet(),
            default_data_dir: None,
            daily_data_dirs: true,
            extension_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub certfile: Option<String>,
    #[serde(default)]
    pub keyfile: Option<String>,
}

/// A module descriptor as it appears on the wire, before the local/remote
/// split and the duplicate-name / identifier checks have run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ModuleDescriptorRaw {
    Remote(RemoteModuleDescriptor),
    Local(LocalModuleDescriptor),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalModuleDescriptor {
    #[serde(rename = "module.Class")]
    pub module_class: String,
    #[serde(default)]
    pub allow_remote: bool,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default, rename = "connect")]
    pub connections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteModuleDescriptor {
    pub native_module_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub certfile: Option<String>,
    #[serde(default)]
    pub keyfile: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub gui: IndexMap<String, ModuleDescriptorRaw>,
    #[serde(default)]
    pub logic: IndexMap<String, ModuleDescriptorRaw>,
    #[serde(default)]
    pub hardware: IndexMap<String, ModuleDescriptorRaw>,
    /// Additive user keys outside the reserved sections; preserved verbatim
    /// on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One normalized module descriptor, with its declaration order preserved
/// for the activation tie-break rule.
#[derive(Debug, Clone)]
pub struct NormalizedModule {
    pub name: String,
    pub kind: ModuleKind,
    pub declaration_index: usize,
    pub descriptor: ModuleDescriptorRaw,
}

impl NormalizedModule {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self.descriptor, ModuleDescriptorRaw::Remote(_))
    }

    #[must_use]
    pub fn allow_remote(&self) -> bool {
        match &self.descriptor {
            ModuleDescriptorRaw::Local(l) => l.allow_remote,
            ModuleDescriptorRaw::Remote(_) => false,
        }
    }

    #[must_use]
    pub fn connections(&self) -> BTreeMap<String, String> {
        match &self.descriptor {
            ModuleDescriptorRaw::Local(l) => l.connections.clone(),
            ModuleDescriptorRaw::Remote(_) => BTreeMap::new(),
        }
    }
}

/// A config document that has passed [`validate`]. Construction is only
/// possible through `validate`, so holding one is proof of schema validity.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub global: GlobalConfig,
    pub modules: BTreeMap<String, NormalizedModule>,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl ValidatedConfig {
    /// Modules in activation tie-break order: topological level is resolved
    /// elsewhere (module manager); this is the declaration-order component
    /// of that tie-break (hardware, then logic, then gui; within a kind,
    /// file declaration order).
    #[must_use]
    pub fn modules_in_declaration_order(&self) -> Vec<&NormalizedModule> {
        let mut v: Vec<&NormalizedModule> = self.modules.values().collect();
        v.sort_by_key(|m| (m.kind.activation_rank(), m.declaration_index));
        v
    }

    pub(super) fn to_raw(&self) -> RawConfig {
        let mut gui = IndexMap::new();
        let mut logic = IndexMap::new();
        let mut hardware = IndexMap::new();
        for m in self.modules_in_declaration_order() {
            let bucket = match m.kind {
                ModuleKind::Gui => &mut gui,
                ModuleKind::Logic => &mut logic,
                ModuleKind::Hardware => &mut hardware,
            };
            bucket.insert(m.name.clone(), m.descriptor.clone());
        }
        RawConfig {
            global: self.global.clone(),
            gui,
            logic,
            hardware,
            extra: self.extra.clone(),
        }
    }
}

#[cfg(test)]
impl ValidatedConfig {
    /// Builds a `ValidatedConfig` directly from already-normalized modules,
    /// bypassing `validate`, for unit tests elsewhere in the crate that need
    /// a config fixture without round-tripping through YAML.
    #[must_use]
    pub fn for_tests(global: GlobalConfig, modules: BTreeMap<String, NormalizedModule>) -> Self {
        Self {
            global,
            modules,
            extra: serde_json::Map::new(),
        }
    }
}

/// Validates a raw config document, returning every structural problem
/// found rather than stopping at the first one.
///
/// # Errors
/// Returns the accumulated [`ValidationError`]s when any section is
/// malformed, an identifier is invalid, or a name collides across kinds.
pub(super) fn validate(raw: RawConfig) -> Result<ValidatedConfig, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut modules: BTreeMap<String, NormalizedModule> = BTreeMap::new();
    let mut owner_kind: BTreeMap<String, ModuleKind> = BTreeMap::new();

    // Processed in the reverse of activation order (gui, logic, hardware):
    // when a name is declared under more than one section, the section
    // processed last owns it and the earlier ones are reported as the
    // duplicates, so a name declared under both `logic` and `hardware`
    // flags the `hardware` entry.
    let sections: [(&str, ModuleKind, &IndexMap<String, ModuleDescriptorRaw>); 3] = [
        ("gui", ModuleKind::Gui, &raw.gui),
        ("logic", ModuleKind::Logic, &raw.logic),
        ("hardware", ModuleKind::Hardware, &raw.hardware),
    ];

    for (section_name, kind, section) in sections {
        for (index, (name, descriptor)) in section.iter().enumerate() {
            let path = format!("{section_name}.{name}");

            if !is_valid_identifier(name) {
                errors.push(ValidationError::InvalidModuleName {
                    path: path.clone(),
                    name: name.clone(),
                });
                continue;
            }

            // Field-level "forbidden for remote" checks happen at the serde
            // level already (options/connect simply aren't part of
            // RemoteModuleDescriptor), so nothing further to flag for a
            // `Remote` descriptor beyond the identifier/name checks above.

            if let Some(other) = owner_kind.get(name) {
                errors.push(ValidationError::DuplicateModuleName {
                    path: path.clone(),
                    name: name.clone(),
                    other_kind: other.as_str().to_string(),
                });
                continue;
            }
            owner_kind.insert(name.clone(), kind);

            modules.insert(
                name.clone(),
                NormalizedModule {
                    name: name.clone(),
                    kind,
                    declaration_index: index,
                    descriptor: descriptor.clone(),
                },
            );
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ValidatedConfig {
        global: raw.global,
        modules,
        extra: raw.extra,
    })
}
