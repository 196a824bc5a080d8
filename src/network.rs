//! Deployment modes and where the catalog contract lives in each.
//!
//! | Mode          | Node endpoint                      | Contract address and ABI                                  |
//! |---------------|------------------------------------|-----------------------------------------------------------|
//! | `production`  | `${PROVIDER}/${PROJECT_ID}`        | `CONTRACT_ADDRESS`; ABI from `ledger.abi_path` or bundled |
//! | `development` | `ledger.development_endpoint`      | the build artifact's record for the development network   |
//!
//! Either way the interface must agree with the compiled contract bindings.
//! Everything here runs once at startup, and every failure is fatal.

use alloy::primitives::Address;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

use crate::chain::abi::{BuildArtifact, DescriptorError, InterfaceDescriptor};
use crate::chain::evm::{InterfaceMismatch, check_interface};
use crate::config::LedgerConfig;
use crate::from_env;

/// Startup misconfiguration.
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("invalid {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },
    #[error("contract build artifact {path} is unavailable, was the contract migrated? {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: DescriptorError,
    },
    #[error("build artifact has no deployment for network id {0}")]
    NotDeployed(String),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("contract interface does not match the bindings: {0}")]
    Interface(#[from] InterfaceMismatch),
    #[error("invalid ledger endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    Production,
    Development,
}

impl Display for Deployment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Deployment::Production => write!(f, "production"),
            Deployment::Development => write!(f, "development"),
        }
    }
}

/// The catalog contract as deployed: its interface and address.
#[derive(Debug, Clone)]
pub struct ContractDeployment {
    pub descriptor: Arc<InterfaceDescriptor>,
    pub address: Address,
}

impl Deployment {
    /// Reads `APP_ENV`. Only `production` selects production.
    pub fn from_env() -> Self {
        Self::from_app_env(from_env::var(from_env::ENV_APP_ENV).as_deref())
    }

    pub fn from_app_env(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("production") => {
                Deployment::Production
            }
            _ => Deployment::Development,
        }
    }

    /// WebSocket endpoint of the ledger node.
    pub fn endpoint(&self, ledger: &LedgerConfig) -> Result<Url, DeploymentError> {
        let endpoint = match self {
            Deployment::Production => production_endpoint(
                from_env::var(from_env::ENV_PROVIDER).as_deref(),
                from_env::var(from_env::ENV_PROJECT_ID).as_deref(),
            )?,
            Deployment::Development => ledger.development_endpoint.clone(),
        };
        Url::parse(&endpoint).map_err(|source| DeploymentError::Endpoint { endpoint, source })
    }

    /// Resolves the contract interface and address, and checks the interface
    /// against the bindings.
    pub fn resolve_contract(
        &self,
        ledger: &LedgerConfig,
    ) -> Result<ContractDeployment, DeploymentError> {
        let contract = match self {
            Deployment::Production => {
                let descriptor = match &ledger.abi_path {
                    Some(path) => InterfaceDescriptor::from_path(path)?,
                    None => InterfaceDescriptor::bundled()?,
                };
                let address = parse_contract_address(
                    from_env::var(from_env::ENV_CONTRACT_ADDRESS).as_deref(),
                )?;
                ContractDeployment {
                    descriptor: Arc::new(descriptor),
                    address,
                }
            }
            Deployment::Development => resolve_from_artifact(ledger)?,
        };
        check_interface(&contract.descriptor)?;
        Ok(contract)
    }
}

fn production_endpoint(
    provider: Option<&str>,
    project_id: Option<&str>,
) -> Result<String, DeploymentError> {
    let provider = provider.ok_or(DeploymentError::MissingEnv(from_env::ENV_PROVIDER))?;
    let project_id = project_id.ok_or(DeploymentError::MissingEnv(from_env::ENV_PROJECT_ID))?;
    Ok(format!("{}/{}", provider.trim_end_matches('/'), project_id))
}

fn parse_contract_address(value: Option<&str>) -> Result<Address, DeploymentError> {
    let value = value.ok_or(DeploymentError::MissingEnv(from_env::ENV_CONTRACT_ADDRESS))?;
    Address::from_str(value.trim()).map_err(|e| DeploymentError::InvalidEnv {
        name: from_env::ENV_CONTRACT_ADDRESS,
        reason: e.to_string(),
    })
}

fn resolve_from_artifact(ledger: &LedgerConfig) -> Result<ContractDeployment, DeploymentError> {
    let artifact = BuildArtifact::from_path(&ledger.artifact_path).map_err(|source| {
        DeploymentError::Artifact {
            path: ledger.artifact_path.clone(),
            source,
        }
    })?;
    let address = artifact
        .deployed_address(&ledger.development_network_id)
        .ok_or_else(|| DeploymentError::NotDeployed(ledger.development_network_id.clone()))?;
    Ok(ContractDeployment {
        descriptor: Arc::new(InterfaceDescriptor::new(artifact.abi)),
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use std::io::Write;

    const BUNDLED_ABI: &str = include_str!("../abi/ProductosChain.json");

    fn artifact_file(networks: &str) -> tempfile::NamedTempFile {
        artifact_file_with(BUNDLED_ABI, networks)
    }

    fn artifact_file_with(abi: &str, networks: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"abi": {abi}, "networks": {networks}}}"#).unwrap();
        file
    }

    fn ledger_with_artifact(path: PathBuf) -> LedgerConfig {
        LedgerConfig {
            artifact_path: path,
            ..LedgerConfig::default()
        }
    }

    #[test]
    fn test_deployment_from_app_env() {
        assert_eq!(
            Deployment::from_app_env(Some("production")),
            Deployment::Production
        );
        assert_eq!(
            Deployment::from_app_env(Some(" PRODUCTION ")),
            Deployment::Production
        );
        assert_eq!(
            Deployment::from_app_env(Some("staging")),
            Deployment::Development
        );
        assert_eq!(Deployment::from_app_env(None), Deployment::Development);
        assert_eq!(Deployment::Development.to_string(), "development");
    }

    #[test]
    fn test_development_endpoint_from_config() {
        let url = Deployment::Development
            .endpoint(&LedgerConfig::default())
            .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8545/");
    }

    #[test]
    fn test_production_endpoint() {
        assert_eq!(
            production_endpoint(Some("wss://mainnet.example.io/ws/v3/"), Some("abc123")).unwrap(),
            "wss://mainnet.example.io/ws/v3/abc123"
        );
        assert!(matches!(
            production_endpoint(None, Some("abc123")),
            Err(DeploymentError::MissingEnv("PROVIDER"))
        ));
        assert!(matches!(
            production_endpoint(Some("wss://x"), None),
            Err(DeploymentError::MissingEnv("PROJECT_ID"))
        ));
    }

    #[test]
    fn test_contract_address_from_env_value() {
        assert_eq!(
            parse_contract_address(Some(" 0x5FbDB2315678afecb367f032d93F642f64180aa3 ")).unwrap(),
            address!("5FbDB2315678afecb367f032d93F642f64180aa3")
        );
        assert!(matches!(
            parse_contract_address(None),
            Err(DeploymentError::MissingEnv("CONTRACT_ADDRESS"))
        ));
        assert!(matches!(
            parse_contract_address(Some("0x1234")),
            Err(DeploymentError::InvalidEnv { .. })
        ));
    }

    #[test]
    fn test_development_address_from_artifact() {
        let file = artifact_file(
            r#"{"1337": {"address": "0x5FbDB2315678afecb367f032d93F642f64180aa3"}}"#,
        );
        let deployment = Deployment::Development
            .resolve_contract(&ledger_with_artifact(file.path().to_path_buf()))
            .unwrap();

        assert_eq!(
            deployment.address,
            address!("5FbDB2315678afecb367f032d93F642f64180aa3")
        );
        assert!(deployment.descriptor.function("eliminarProducto").is_some());
    }

    #[test]
    fn test_missing_deployment_record_is_fatal() {
        let file = artifact_file(
            r#"{"5777": {"address": "0x5FbDB2315678afecb367f032d93F642f64180aa3"}}"#,
        );
        let err = Deployment::Development
            .resolve_contract(&ledger_with_artifact(file.path().to_path_buf()))
            .unwrap_err();
        assert!(matches!(err, DeploymentError::NotDeployed(id) if id == "1337"));
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Deployment::Development
            .resolve_contract(&ledger_with_artifact(dir.path().join("missing.json")))
            .unwrap_err();
        assert!(matches!(err, DeploymentError::Artifact { .. }));
    }

    #[test]
    fn test_mismatched_artifact_interface_is_fatal() {
        let abi = BUNDLED_ABI.replace("\"crearProducto\"", "\"crearProductoV2\"");
        let file = artifact_file_with(
            &abi,
            r#"{"1337": {"address": "0x5FbDB2315678afecb367f032d93F642f64180aa3"}}"#,
        );
        let err = Deployment::Development
            .resolve_contract(&ledger_with_artifact(file.path().to_path_buf()))
            .unwrap_err();
        assert!(matches!(
            err,
            DeploymentError::Interface(InterfaceMismatch::Missing("crearProducto"))
        ));
    }
}
