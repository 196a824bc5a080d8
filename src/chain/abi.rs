//! Interface descriptor of the catalog contract.
//!
//! The descriptor is loaded once at startup, either from a truffle build
//! artifact (`{"abi": [...], "networks": {...}}`), from a bare ABI array, or
//! from the ABI bundled with the crate. Entries are indexed by name.

use alloy::json_abi::{Event, Function, JsonAbi};
use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BUNDLED_ABI: &str = include_str!("../../abi/ProductosChain.json");

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid interface description: {0}")]
    Json(#[from] serde_json::Error),
}

/// A truffle build artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildArtifact {
    pub abi: JsonAbi,
    #[serde(default)]
    pub networks: HashMap<String, ArtifactNetwork>,
}

/// Deployment record of an artifact for one network id.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactNetwork {
    pub address: Address,
}

impl BuildArtifact {
    pub fn from_path(path: &Path) -> Result<Self, DescriptorError> {
        let raw = read(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn deployed_address(&self, network_id: &str) -> Option<Address> {
        self.networks.get(network_id).map(|network| network.address)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AbiSource {
    Artifact(BuildArtifact),
    Bare(JsonAbi),
}

#[derive(Debug, Clone)]
enum AbiEntry {
    Function(Function),
    Event(Event),
}

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    entries: HashMap<String, AbiEntry>,
}

impl InterfaceDescriptor {
    pub fn new(abi: JsonAbi) -> Self {
        let mut entries = HashMap::new();
        // first overload of a name wins
        for function in abi.functions() {
            entries
                .entry(function.name.clone())
                .or_insert_with(|| AbiEntry::Function(function.clone()));
        }
        for event in abi.events() {
            entries
                .entry(event.name.clone())
                .or_insert_with(|| AbiEntry::Event(event.clone()));
        }
        Self { entries }
    }

    pub fn bundled() -> Result<Self, DescriptorError> {
        Self::from_json(BUNDLED_ABI)
    }

    pub fn from_path(path: &Path) -> Result<Self, DescriptorError> {
        Self::from_json(&read(path)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, DescriptorError> {
        let abi = match serde_json::from_str(raw)? {
            AbiSource::Artifact(artifact) => artifact.abi,
            AbiSource::Bare(abi) => abi,
        };
        Ok(Self::new(abi))
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        match self.entries.get(name)? {
            AbiEntry::Function(function) => Some(function),
            AbiEntry::Event(_) => None,
        }
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        match self.entries.get(name)? {
            AbiEntry::Event(event) => Some(event),
            AbiEntry::Function(_) => None,
        }
    }
}

fn read(path: &Path) -> Result<String, DescriptorError> {
    std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_bundled_descriptor_indexes_catalog_interface() {
        let descriptor = InterfaceDescriptor::bundled().unwrap();

        for name in [
            "crearProducto",
            "editarProducto",
            "eliminarProducto",
            "actualizarProducto",
            "listarProductos",
        ] {
            assert!(descriptor.function(name).is_some(), "missing {name}");
        }
        for name in [
            "EventoCrearProducto",
            "EventoActualizarProducto",
            "EventoEliminarProducto",
        ] {
            assert!(descriptor.event(name).is_some(), "missing {name}");
        }
        assert!(descriptor.function("EventoCrearProducto").is_none());
    }

    #[test]
    fn test_artifact_with_deployment_table() {
        let raw = format!(
            r#"{{"abi": {BUNDLED_ABI}, "networks": {{"1337": {{"address": "0x5FbDB2315678afecb367f032d93F642f64180aa3"}}}}}}"#
        );
        let descriptor = InterfaceDescriptor::from_json(&raw).unwrap();
        assert!(descriptor.function("crearProducto").is_some());

        let artifact: BuildArtifact = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            artifact.deployed_address("1337"),
            Some(address!("5FbDB2315678afecb367f032d93F642f64180aa3"))
        );
        assert_eq!(artifact.deployed_address("1"), None);
    }

    #[test]
    fn test_missing_file() {
        let err = InterfaceDescriptor::from_path(Path::new("nope/ProductosChain.json"))
            .unwrap_err();
        assert!(matches!(err, DescriptorError::Io { .. }));
    }
}
