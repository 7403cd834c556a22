use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::adaptation::{parse_endpoint, Bypass, Method, ServiceInfo, UriError, VectPoint};

use super::schema::{AdaptationConfig, Config};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("malformed service directive {line:?}: expected <identity> <kind> <bypass> <uri>")]
    MalformedServiceLine { line: String },

    #[error("unknown service kind {kind:?} in {line:?}")]
    UnknownKind { kind: String, line: String },

    #[error("malformed bypass flag {value:?} in {line:?}: expected 0 or 1")]
    MalformedBypass { value: String, line: String },

    #[error("duplicate service identity {identity:?}")]
    DuplicateService { identity: String },

    #[error(transparent)]
    Uri(#[from] UriError),
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

/// Like `load`, but a missing file yields the built-in defaults.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    load(path)
}

/// Parse one `<identity> <kind> <bypass> <uri>` directive.
pub fn parse_service_line(line: &str) -> Result<ServiceInfo, ConfigError> {
    let mut words = line.split_whitespace();
    let (Some(identity), Some(kind), Some(bypass), Some(uri), None) = (
        words.next(),
        words.next(),
        words.next(),
        words.next(),
        words.next(),
    ) else {
        return Err(ConfigError::MalformedServiceLine { line: line.into() });
    };

    let (method, point) = match kind {
        "reqmod_precache" => (Method::Reqmod, VectPoint::PreCache),
        "reqmod_postcache" => (Method::Reqmod, VectPoint::PostCache),
        "respmod_precache" => (Method::Respmod, VectPoint::PreCache),
        "respmod_postcache" => (Method::Respmod, VectPoint::PostCache),
        other => {
            return Err(ConfigError::UnknownKind {
                kind: other.into(),
                line: line.into(),
            })
        }
    };

    let bypass = match bypass {
        "0" => Bypass::Essential,
        "1" => Bypass::Optional,
        other => {
            return Err(ConfigError::MalformedBypass {
                value: other.into(),
                line: line.into(),
            })
        }
    };

    let endpoint = parse_endpoint(uri)?;

    Ok(ServiceInfo {
        identity: identity.to_string(),
        method,
        point,
        bypass,
        endpoint,
        uri: uri.to_string(),
    })
}

/// Parse and validate every configured service directive. Any bad line
/// fails the whole load; duplicates are rejected here so the registry can
/// assume unique identities.
pub fn parse_services(config: &AdaptationConfig) -> Result<Vec<ServiceInfo>, ConfigError> {
    let mut seen = HashSet::new();
    let mut services = Vec::with_capacity(config.services.len());
    for line in &config.services {
        let info = parse_service_line(line)?;
        if !seen.insert(info.identity.clone()) {
            return Err(ConfigError::DuplicateService {
                identity: info.identity,
            });
        }
        services.push(info);
    }
    Ok(services)
}
