use alloy_dyn_abi::DynSolType;
use alloy_json_abi::{Event, JsonAbi};
use alloy_primitives::{B256, keccak256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::models::errors::CatalogError;
use crate::utils::to_snake_case;

/// Columns every decoded row carries. Event parameters that would collide with
/// one of these get an `_arg` suffix.
pub const BASE_COLUMNS: [&str; 7] = [
    "block_number",
    "block_timestamp",
    "tx_hash",
    "log_index",
    "address",
    "event_name",
    "chain",
];

/// How a parameter is laid out on the wire, resolved once at catalog load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Single 32-byte slot: address, bool, intN, uintN, bytesN, function
    Word,
    /// bytes, string
    DynamicBytes,
    /// T[] and T[k]
    Array,
    Tuple,
}

impl ParamKind {
    pub fn of(ty: &DynSolType) -> Self {
        match ty {
            DynSolType::Address
            | DynSolType::Bool
            | DynSolType::Int(_)
            | DynSolType::Uint(_)
            | DynSolType::FixedBytes(_)
            | DynSolType::Function => ParamKind::Word,
            DynSolType::Bytes | DynSolType::String => ParamKind::DynamicBytes,
            DynSolType::Array(_) | DynSolType::FixedArray(..) => ParamKind::Array,
            _ => ParamKind::Tuple,
        }
    }

    /// Indexed parameters of any non-word kind are stored as a keccak hash
    pub fn is_hashed_when_indexed(&self) -> bool {
        !matches!(self, ParamKind::Word)
    }
}

#[derive(Debug, Clone)]
pub struct EventParam {
    pub name: String,
    pub column: String,
    pub indexed: bool,
    pub type_name: String,
    pub ty: DynSolType,
    pub kind: ParamKind,
}

#[derive(Debug, Clone)]
pub struct EventDescriptor {
    pub name: String,
    pub params: Vec<EventParam>,
    pub signature: String,
    pub hash: B256,
}

impl EventDescriptor {
    pub fn from_abi_event(event: &Event) -> Result<Self, CatalogError> {
        let params = event
            .inputs
            .iter()
            .enumerate()
            .map(|(position, input)| {
                let type_name = input.selector_type().into_owned();
                let ty = DynSolType::parse(&type_name).map_err(|e| CatalogError::UnsupportedType {
                    event: event.name.clone(),
                    ty: type_name.clone(),
                    reason: e.to_string(),
                })?;

                let name = if input.name.is_empty() {
                    format!("arg_{position}")
                } else {
                    input.name.clone()
                };
                let mut column = to_snake_case(&name);
                if BASE_COLUMNS.contains(&column.as_str()) {
                    column.push_str("_arg");
                }

                Ok(EventParam {
                    name,
                    column,
                    indexed: input.indexed,
                    kind: ParamKind::of(&ty),
                    type_name,
                    ty,
                })
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;

        let types: Vec<&str> = params.iter().map(|p| p.type_name.as_str()).collect();
        let signature = format!("{}({})", event.name, types.join(","));
        let hash = signature_hash(&event.name, &types);

        Ok(EventDescriptor {
            name: event.name.clone(),
            params,
            signature,
            hash,
        })
    }

    pub fn indexed(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| p.indexed)
    }

    pub fn non_indexed(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| !p.indexed)
    }
}

/// keccak256 of `name(type1,type2,...)` using canonical type names
pub fn signature_hash<S: AsRef<str>>(name: &str, types: &[S]) -> B256 {
    let types: Vec<&str> = types.iter().map(|t| t.as_ref()).collect();
    keccak256(format!("{}({})", name, types.join(",")))
}

/// Read-only lookup from topic0 to event descriptor.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    by_hash: HashMap<B256, EventDescriptor>,
}

impl EventRegistry {
    /// Load every `*.json` file in `dir`, in file name order.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let io_err = |source| CatalogError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut paths = fs::read_dir(dir)
            .map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        paths.retain(|p| p.extension().is_some_and(|ext| ext == "json"));
        paths.sort();

        let mut registry = EventRegistry::default();
        for path in paths {
            let label = path.display().to_string();
            let contents = fs::read_to_string(&path).map_err(|source| CatalogError::Io {
                path: label.clone(),
                source,
            })?;
            registry.load_json(&contents, &label)?;
        }

        info!(
            "Loaded {} event descriptors from {}",
            registry.len(),
            dir.display()
        );
        Ok(registry)
    }

    /// Accepts a bare ABI array or a build artifact with an `abi` field.
    pub fn load_json(&mut self, contents: &str, label: &str) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidAbi {
            path: label.to_string(),
            reason,
        };

        let value: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| invalid(e.to_string()))?;
        let abi_value = match value {
            serde_json::Value::Array(_) => value,
            serde_json::Value::Object(mut obj) => obj
                .remove("abi")
                .ok_or_else(|| invalid("object without an 'abi' field".to_string()))?,
            _ => return Err(invalid("expected an array or an artifact object".to_string())),
        };
        let abi: JsonAbi = serde_json::from_value(abi_value).map_err(|e| invalid(e.to_string()))?;

        for event in abi.events() {
            self.insert_event(event)?;
        }
        Ok(())
    }

    pub fn insert_event(&mut self, event: &Event) -> Result<(), CatalogError> {
        // Anonymous events have no topic0 to key on
        if event.anonymous {
            return Ok(());
        }
        let descriptor = EventDescriptor::from_abi_event(event)?;
        self.insert(descriptor);
        Ok(())
    }

    /// First descriptor wins for a given signature.
    pub fn insert(&mut self, descriptor: EventDescriptor) {
        if self.by_hash.contains_key(&descriptor.hash) {
            debug!("Duplicate event signature {} ignored", descriptor.signature);
            return;
        }
        self.by_hash.insert(descriptor.hash, descriptor);
    }

    pub fn get(&self, topic0: &B256) -> Option<&EventDescriptor> {
        self.by_hash.get(topic0)
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}
