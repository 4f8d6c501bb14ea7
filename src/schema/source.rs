//! Schema source format
//!
//! Modules are described by JSON documents generated from the
//! dataplane's API description: module name, semantic API version,
//! named sub-struct types, and per-message name, kind tag and fields.
//!
//! Declared CRC hex strings are optional. When present they are
//! cross-checked against the locally computed fingerprint, so a stale
//! definition file fails at load instead of at the first decode.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::{
    ArrayMode, FieldKind, FieldLayout, MessageKind, MessageSchema, ModuleDescriptor, ScalarKind,
    SchemaError, SchemaResult, StructLayout,
};

/// Top-level module definition document
#[derive(Debug, Deserialize)]
pub struct ModuleDef {
    pub module: String,
    pub version: String,
    #[serde(default)]
    pub crc: Option<String>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
    pub messages: Vec<MessageDef>,
}

/// Named sub-struct type definition
#[derive(Debug, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

/// One message definition
#[derive(Debug, Deserialize)]
pub struct MessageDef {
    pub name: String,
    pub kind: KindDef,
    #[serde(default)]
    pub crc: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

/// Message kind tag
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindDef {
    Request,
    Reply,
    Event,
}

impl From<KindDef> for MessageKind {
    fn from(kind: KindDef) -> Self {
        match kind {
            KindDef::Request => MessageKind::Request,
            KindDef::Reply => MessageKind::Reply,
            KindDef::Event => MessageKind::Event,
        }
    }
}

/// One field definition
#[derive(Debug, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub array: Option<ArrayDef>,
}

/// Array mode of a field definition
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayDef {
    /// `{"fixed": 24}`
    Fixed(usize),
    /// `{"counted_by": "count"}`
    CountedBy(String),
}

/// Load one module definition file
pub fn load_module(path: &Path) -> SchemaResult<ModuleDescriptor> {
    let text = fs::read_to_string(path)?;
    parse_module(&text)
}

/// Load every `.json` module definition in a directory, sorted by name
pub fn load_dir(dir: &Path) -> SchemaResult<Vec<ModuleDescriptor>> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    paths.sort();

    let mut modules = Vec::with_capacity(paths.len());
    for path in &paths {
        let module = load_module(path)?;
        debug!(
            module = %module.name,
            version = %module.api_version,
            crc = %format_args!("{:#010x}", module.module_crc),
            messages = module.messages().len(),
            "Loaded module definition"
        );
        modules.push(module);
    }
    Ok(modules)
}

/// Parse a module definition document
pub fn parse_module(text: &str) -> SchemaResult<ModuleDescriptor> {
    let def: ModuleDef = serde_json::from_str(text)?;

    // Types may reference earlier types, so resolve in declaration order
    let mut types: Vec<Arc<StructLayout>> = Vec::with_capacity(def.types.len());
    for type_def in &def.types {
        let fields = resolve_fields(&type_def.fields, &types)?;
        types.push(Arc::new(StructLayout::new(type_def.name.clone(), fields)?));
    }

    let mut messages = Vec::with_capacity(def.messages.len());
    for message_def in &def.messages {
        let fields = resolve_fields(&message_def.fields, &types)?;
        let schema = MessageSchema::new(
            message_def.name.clone(),
            message_def.kind.into(),
            fields,
        )?;
        if let Some(declared) = &message_def.crc {
            let declared = parse_crc(declared)?;
            if declared != schema.crc {
                return Err(SchemaError::FingerprintMismatch {
                    owner: schema.name,
                    declared,
                    computed: schema.crc,
                });
            }
        }
        messages.push(schema);
    }

    let module = ModuleDescriptor::with_types(def.module, def.version, types, messages)?;
    if let Some(declared) = &def.crc {
        let declared = parse_crc(declared)?;
        if declared != module.module_crc {
            return Err(SchemaError::FingerprintMismatch {
                owner: module.name,
                declared,
                computed: module.module_crc,
            });
        }
    }
    Ok(module)
}

fn resolve_fields(
    defs: &[FieldDef],
    types: &[Arc<StructLayout>],
) -> SchemaResult<Vec<FieldLayout>> {
    defs.iter()
        .map(|def| {
            let kind = match ScalarKind::parse(&def.ty) {
                Some(scalar) => FieldKind::Scalar(scalar),
                None => match types.iter().find(|t| t.name == def.ty) {
                    Some(layout) => FieldKind::Struct(Arc::clone(layout)),
                    None => return Err(SchemaError::UnknownType(def.ty.clone())),
                },
            };
            let array = match &def.array {
                None => ArrayMode::None,
                Some(ArrayDef::Fixed(n)) => ArrayMode::Fixed(*n),
                Some(ArrayDef::CountedBy(count)) => ArrayMode::CountedBy(count.clone()),
            };
            Ok(FieldLayout {
                name: def.name.clone(),
                kind,
                array,
            })
        })
        .collect()
}

fn parse_crc(text: &str) -> SchemaResult<u32> {
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(digits, 16).map_err(|_| SchemaError::InvalidCrc(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE_MODULE: &str = r#"{
        "module": "lease",
        "version": "2.0.1",
        "types": [
            {
                "name": "domain_server",
                "fields": [
                    {"name": "address", "type": "u8", "array": {"fixed": 16}}
                ]
            }
        ],
        "messages": [
            {
                "name": "lease_dump",
                "kind": "request",
                "fields": []
            },
            {
                "name": "lease_details",
                "kind": "reply",
                "fields": [
                    {"name": "sw_if_index", "type": "u32"},
                    {"name": "hostname", "type": "u8", "array": {"fixed": 64}},
                    {"name": "count", "type": "u8"},
                    {"name": "domain_servers", "type": "domain_server",
                     "array": {"counted_by": "count"}}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_module() {
        let module = parse_module(LEASE_MODULE).unwrap();
        assert_eq!(module.name, "lease");
        assert_eq!(module.api_version, "2.0.1");
        assert_eq!(module.messages().len(), 2);

        let details = module.message("lease_details").unwrap();
        assert_eq!(details.kind, MessageKind::Reply);
        assert_eq!(details.fields.len(), 4);
        assert!(matches!(
            &details.fields[3].kind,
            FieldKind::Struct(layout) if layout.name == "domain_server"
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{
            "module": "m", "version": "1.0.0",
            "messages": [
                {"name": "x", "kind": "request",
                 "fields": [{"name": "f", "type": "no_such_type"}]}
            ]
        }"#;
        assert!(matches!(
            parse_module(text),
            Err(SchemaError::UnknownType(ty)) if ty == "no_such_type"
        ));
    }

    #[test]
    fn test_empty_type_rejected() {
        let text = r#"{
            "module": "m", "version": "1.0.0",
            "types": [{"name": "hollow", "fields": []}],
            "messages": []
        }"#;
        assert!(matches!(
            parse_module(text),
            Err(SchemaError::EmptyStruct(name)) if name == "hollow"
        ));
    }

    #[test]
    fn test_declared_crc_mismatch_rejected() {
        let text = r#"{
            "module": "m", "version": "1.0.0",
            "messages": [
                {"name": "x", "kind": "request", "crc": "0xdeadbeef", "fields": []}
            ]
        }"#;
        // The computed fingerprint of an empty request is not 0xdeadbeef
        assert!(matches!(
            parse_module(text),
            Err(SchemaError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn test_declared_crc_accepted_when_matching() {
        let module = parse_module(LEASE_MODULE).unwrap();
        let details = module.message("lease_details").unwrap();

        let tagged = LEASE_MODULE.replace(
            "\"name\": \"lease_details\",\n                \"kind\": \"reply\",",
            &format!(
                "\"name\": \"lease_details\",\n                \"kind\": \"reply\",\n                \"crc\": \"{:#010x}\",",
                details.crc
            ),
        );
        assert_ne!(tagged, LEASE_MODULE);
        let reparsed = parse_module(&tagged).unwrap();
        assert_eq!(reparsed.message("lease_details").unwrap().crc, details.crc);
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("lease.json"), LEASE_MODULE).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let modules = load_dir(dir.path()).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "lease");
    }
}
