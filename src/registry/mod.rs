//! Message registry
//!
//! Process-wide catalog of message schemas, built once at startup by
//! aggregating module descriptors and immutable afterwards. Lookups
//! run without locking; share the built registry behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::schema::{MessageSchema, ModuleDescriptor};

/// Registry construction errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Two incompatible definitions of one message were linked into the
    /// same process. Fatal configuration error, surfaced at startup.
    #[error(
        "conflicting definitions for message '{name}': \
         registered crc {existing:#010x}, incoming crc {incoming:#010x}"
    )]
    SchemaConflict {
        name: String,
        existing: u32,
        incoming: u32,
    },

    #[error("module '{0}' registered twice")]
    DuplicateModule(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Accumulates module descriptors during startup
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    by_name: HashMap<String, Arc<MessageSchema>>,
    by_identity: HashMap<String, HashMap<u32, Arc<MessageSchema>>>,
    owners: HashMap<String, String>,
    modules: HashMap<String, Arc<ModuleDescriptor>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every message of a module
    ///
    /// Idempotent per exact `(name, crc)` pair; a different schema under
    /// an already-registered name is a `SchemaConflict`.
    pub fn register_module(&mut self, module: ModuleDescriptor) -> RegistryResult<&mut Self> {
        if self.modules.contains_key(&module.name) {
            return Err(RegistryError::DuplicateModule(module.name));
        }

        for schema in module.messages() {
            match self.by_name.get(&schema.name) {
                Some(existing) if existing.crc == schema.crc => {
                    trace!(message = %schema.name, "Schema already registered, skipping");
                }
                Some(existing) => {
                    return Err(RegistryError::SchemaConflict {
                        name: schema.name.clone(),
                        existing: existing.crc,
                        incoming: schema.crc,
                    });
                }
                None => {
                    self.by_name.insert(schema.name.clone(), Arc::clone(schema));
                    self.owners.insert(schema.name.clone(), module.name.clone());
                }
            }
            // The identity is module-qualified, so it is recorded even
            // when another module registered the name first
            self.by_identity
                .entry(module.name.clone())
                .or_default()
                .insert(schema.crc, Arc::clone(schema));
        }

        debug!(
            module = %module.name,
            version = %module.api_version,
            messages = module.messages().len(),
            "Registered module"
        );
        self.modules
            .insert(module.name.clone(), Arc::new(module));
        Ok(self)
    }

    /// Finish aggregation and freeze the registry
    pub fn build(self) -> Registry {
        Registry {
            by_name: self.by_name,
            by_identity: self.by_identity,
            owners: self.owners,
            modules: self.modules,
        }
    }
}

/// Immutable schema catalog
///
/// No message name, and no `(module, crc)` identity, maps to more than
/// one schema. The schema alone determines a payload's layout, so a
/// lookup here must precede every decode.
#[derive(Debug)]
pub struct Registry {
    by_name: HashMap<String, Arc<MessageSchema>>,
    by_identity: HashMap<String, HashMap<u32, Arc<MessageSchema>>>,
    owners: HashMap<String, String>,
    modules: HashMap<String, Arc<ModuleDescriptor>>,
}

impl Registry {
    /// Build a registry from a set of module descriptors
    pub fn from_modules(
        modules: impl IntoIterator<Item = ModuleDescriptor>,
    ) -> RegistryResult<Self> {
        let mut builder = RegistryBuilder::new();
        for module in modules {
            builder.register_module(module)?;
        }
        Ok(builder.build())
    }

    /// Look up a schema by message name
    pub fn lookup_by_name(&self, name: &str) -> Option<&Arc<MessageSchema>> {
        self.by_name.get(name)
    }

    /// Look up a schema by module-qualified identity; allocation-free,
    /// this sits on the connection handshake path
    pub fn lookup_by_identity(&self, module: &str, crc: u32) -> Option<&Arc<MessageSchema>> {
        self.by_identity.get(module)?.get(&crc)
    }

    /// Module that owns the named message
    pub fn module_of(&self, message: &str) -> Option<&str> {
        self.owners.get(message).map(String::as_str)
    }

    /// Descriptor of a registered module
    pub fn module(&self, name: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.modules.get(name)
    }

    /// All registered modules
    pub fn modules(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.modules.values()
    }

    /// All registered schemas
    pub fn all(&self) -> impl Iterator<Item = &Arc<MessageSchema>> {
        self.by_name.values()
    }
}
