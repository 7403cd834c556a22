//! Service endpoint URIs.
//!
//! An adaptation service is addressed as `icap://host[:port]/resource` or
//! `ecap://host[:port]/resource`. The scheme prefix is fixed per service
//! kind; after it, the first `:` or `/` separates the host from the
//! port-or-resource. Over-long resources are accepted with a warning.

use thiserror::Error;
use tracing::warn;

/// Longest resource name we accept without complaining.
const RESOURCE_WARN_LEN: usize = 1024;

/// Which adaptation protocol family a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Icap,
    Ecap,
}

impl ServiceKind {
    pub fn scheme_prefix(self) -> &'static str {
        match self {
            ServiceKind::Icap => "icap://",
            ServiceKind::Ecap => "ecap://",
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            ServiceKind::Icap => Some(1344),
            ServiceKind::Ecap => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Icap => "icap",
            ServiceKind::Ecap => "ecap",
        }
    }
}

/// Parsed service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: ServiceKind,
    pub host: String,
    pub port: Option<u16>,
    /// Path past `host[:port]/`, without the leading slash. May be empty.
    pub resource: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("service uri {uri:?} has no icap:// or ecap:// scheme")]
    UnknownScheme { uri: String },

    #[error("service uri {uri:?} has an empty host")]
    EmptyHost { uri: String },

    #[error("service uri {uri:?} has no host/resource separator")]
    MissingSeparator { uri: String },

    #[error("service uri {uri:?} has a malformed port {port:?}")]
    MalformedPort { uri: String, port: String },
}

/// Parse a service URI into its endpoint parts.
pub fn parse_endpoint(uri: &str) -> Result<Endpoint, UriError> {
    let (kind, rest) = if let Some(rest) = uri.strip_prefix(ServiceKind::Icap.scheme_prefix()) {
        (ServiceKind::Icap, rest)
    } else if let Some(rest) = uri.strip_prefix(ServiceKind::Ecap.scheme_prefix()) {
        (ServiceKind::Ecap, rest)
    } else {
        return Err(UriError::UnknownScheme { uri: uri.into() });
    };

    let sep = rest
        .find(|c| c == ':' || c == '/')
        .ok_or_else(|| UriError::MissingSeparator { uri: uri.into() })?;
    let host = &rest[..sep];
    if host.is_empty() {
        return Err(UriError::EmptyHost { uri: uri.into() });
    }

    let mut port = kind.default_port();
    let after = &rest[sep..];
    let resource = if let Some(port_and_more) = after.strip_prefix(':') {
        // an explicit port follows, up to the resource slash or end
        let (port_str, resource) = match port_and_more.find('/') {
            Some(slash) => (&port_and_more[..slash], &port_and_more[slash + 1..]),
            None => (port_and_more, ""),
        };
        port = Some(port_str.parse().map_err(|_| UriError::MalformedPort {
            uri: uri.into(),
            port: port_str.into(),
        })?);
        resource
    } else {
        &after[1..] // skip the '/'
    };

    if resource.len() > RESOURCE_WARN_LEN {
        warn!(
            target: "adaptation",
            "long resource name (>{RESOURCE_WARN_LEN}) in {uri}, probably wrong"
        );
    }

    Ok(Endpoint {
        kind,
        host: host.to_string(),
        port,
        resource: resource.to_string(),
    })
}
