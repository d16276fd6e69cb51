use std::{collections::BTreeSet, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Network identity of a server. Fixed at construction; the sole key a
/// [`Connection`](crate::Connection) is identified by.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::new(ErrorKind::InvalidAddress, format!("invalid address: {s:?}"));
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

/// A discovery child name: `host:port#version@protocol`.
///
/// The `#version` and `@protocol` parts are optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    pub address: ServerAddress,
    pub version: Option<String>,
    pub protocol: Option<String>,
}

impl ServerUrl {
    #[must_use]
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            version: None,
            protocol: None,
        }
    }
}

impl FromStr for ServerUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (rest, protocol) = match s.rsplit_once('@') {
            Some((rest, protocol)) => (rest, Some(protocol)),
            None => (s, None),
        };
        let (address, version) = match rest.split_once('#') {
            Some((address, version)) => (address, Some(version)),
            None => (rest, None),
        };
        let non_empty = |v: Option<&str>| v.filter(|v| !v.is_empty()).map(str::to_string);
        Ok(Self {
            address: address.parse()?,
            version: non_empty(version),
            protocol: non_empty(protocol),
        })
    }
}

impl std::fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)?;
        if let Some(version) = &self.version {
            write!(f, "#{version}")?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, "@{protocol}")?;
        }
        Ok(())
    }
}

/// Interface name plus version, e.g. `com.example.Foo@1.0`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceKey {
    pub name: String,
    pub version: String,
}

impl InterfaceKey {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}

impl FromStr for InterfaceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = s.split_once('@').unwrap_or((s, ""));
        if name.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid interface key: {s:?}"),
            ));
        }
        Ok(Self::new(name, version))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDetail {
    pub class_name: String,
    #[serde(default)]
    pub version: String,
}

/// Data blob stored under each server's discovery node.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub interface_detail_list: Vec<InterfaceDetail>,
}

impl ServerInfo {
    /// # Errors
    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            Error::new(
                ErrorKind::DeserializeFailed,
                format!("invalid server info: {e}"),
            )
        })
    }

    #[must_use]
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a InterfaceKey>) -> Self {
        Self {
            interface_detail_list: keys
                .into_iter()
                .map(|key| InterfaceDetail {
                    class_name: key.name.clone(),
                    version: key.version.clone(),
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn interface_keys(&self) -> BTreeSet<InterfaceKey> {
        self.interface_detail_list
            .iter()
            .map(|detail| InterfaceKey::new(&detail.class_name, &detail.version))
            .collect()
    }
}
