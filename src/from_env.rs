//! Environment variables read at startup.
//!
//! Values are trimmed, and an empty value counts as unset.

use alloy::signers::local::PrivateKeySigner;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::chain::SigningIdentity;
use crate::network::{Deployment, DeploymentError};

pub const ENV_APP_ENV: &str = "APP_ENV";
pub const ENV_PROVIDER: &str = "PROVIDER";
pub const ENV_PROJECT_ID: &str = "PROJECT_ID";
pub const ENV_CONTRACT_ADDRESS: &str = "CONTRACT_ADDRESS";
pub const ENV_PRIVATE_KEY: &str = "PRIVATE_KEY";
pub const ENV_ESTIMATE_GAS: &str = "ESTIMATE_GAS";
pub const ENV_GAS_PRICE: &str = "GAS_PRICE";
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";

pub const DEFAULT_ESTIMATE_GAS: u64 = 3_000_000;
pub const DEFAULT_GAS_PRICE_GWEI: u64 = 20;
pub const DEFAULT_HOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 8080;

pub fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Gas values applied when a request leaves them out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasDefaults {
    /// Gas limit of a write, and the fallback when no estimate is possible.
    pub gas_limit: u64,
    pub gas_price_gwei: u64,
}

impl Default for GasDefaults {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_ESTIMATE_GAS,
            gas_price_gwei: DEFAULT_GAS_PRICE_GWEI,
        }
    }
}

impl GasDefaults {
    pub fn from_env() -> Result<Self, DeploymentError> {
        Self::parse(
            var(ENV_ESTIMATE_GAS).as_deref(),
            var(ENV_GAS_PRICE).as_deref(),
        )
    }

    pub fn parse(gas_limit: Option<&str>, gas_price: Option<&str>) -> Result<Self, DeploymentError> {
        let defaults = Self::default();
        Ok(Self {
            gas_limit: parse_or(ENV_ESTIMATE_GAS, gas_limit, defaults.gas_limit)?,
            gas_price_gwei: parse_or(ENV_GAS_PRICE, gas_price, defaults.gas_price_gwei)?,
        })
    }
}

/// Key that signs write transactions.
///
/// Production requires `PRIVATE_KEY`. Development leaves signing to the
/// local node's unlocked accounts.
pub fn signing_identity(deployment: Deployment) -> Result<Option<SigningIdentity>, DeploymentError> {
    match deployment {
        Deployment::Production => {
            let key = var(ENV_PRIVATE_KEY).ok_or(DeploymentError::MissingEnv(ENV_PRIVATE_KEY))?;
            parse_signing_key(&key).map(Some)
        }
        Deployment::Development => Ok(None),
    }
}

fn parse_signing_key(key: &str) -> Result<SigningIdentity, DeploymentError> {
    PrivateKeySigner::from_str(key)
        .map(SigningIdentity::new)
        .map_err(|e| DeploymentError::InvalidEnv {
            name: ENV_PRIVATE_KEY,
            reason: e.to_string(),
        })
}

/// Listen address from `HOST` and `PORT`.
pub fn listen_addr() -> Result<SocketAddr, DeploymentError> {
    let host = parse_or(ENV_HOST, var(ENV_HOST).as_deref(), DEFAULT_HOST)?;
    let port = parse_or(ENV_PORT, var(ENV_PORT).as_deref(), DEFAULT_PORT)?;
    Ok(SocketAddr::new(host, port))
}

fn parse_or<T>(name: &'static str, value: Option<&str>, default: T) -> Result<T, DeploymentError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(value) => value.trim().parse().map_err(|e: T::Err| DeploymentError::InvalidEnv {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_gas_defaults() {
        assert_eq!(
            GasDefaults::parse(None, None).unwrap(),
            GasDefaults {
                gas_limit: 3_000_000,
                gas_price_gwei: 20
            }
        );
        assert_eq!(
            GasDefaults::parse(Some("6721975"), Some(" 5 ")).unwrap(),
            GasDefaults {
                gas_limit: 6_721_975,
                gas_price_gwei: 5
            }
        );
    }

    #[test]
    fn test_invalid_gas_value() {
        let err = GasDefaults::parse(Some("lots"), None).unwrap_err();
        assert!(matches!(err, DeploymentError::InvalidEnv { name: "ESTIMATE_GAS", .. }));
    }

    #[test]
    fn test_signing_key() {
        let identity = parse_signing_key(
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        )
        .unwrap();
        assert_eq!(
            identity.address(),
            address!("70997970C51812dc3A010C7d01b50e0d17dc79C8")
        );
        assert!(matches!(
            parse_signing_key("not-a-key"),
            Err(DeploymentError::InvalidEnv { name: "PRIVATE_KEY", .. })
        ));
    }

    #[test]
    fn test_development_has_no_signing_identity() {
        assert!(signing_identity(Deployment::Development).unwrap().is_none());
    }
}
