//! Connection-string construction and validation
//!
//! Format: `scheme://[username:password@]host[:port][,host[:port]...][/database][?options]`

use crate::core::{Result, SyncError};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref URI_PATTERN: Regex = Regex::new(
        concat!(
            r"^(?P<scheme>[a-z][a-z0-9+.-]*)://",
            r"(?:(?P<username>[^:@/]+):(?P<password>[^@/]*)@)?",
            r"(?P<hosts>[A-Za-z0-9._-]+(?::\d{1,5})?(?:,[A-Za-z0-9._-]+(?::\d{1,5})?)*)",
            r"(?:/(?P<database>[^?]*))?",
            r"(?:\?(?P<options>.*))?$",
        )
    )
    .expect("connection URI pattern is valid");
}

/// Parsed pieces of a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriParts {
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub hosts: String,
    pub database: Option<String>,
}

pub fn is_connection_uri(candidate: &str) -> bool {
    URI_PATTERN.is_match(candidate)
}

pub fn parse(uri: &str) -> Result<UriParts> {
    let caps = URI_PATTERN.captures(uri).ok_or_else(|| {
        SyncError::InvalidConfig(format!("malformed connection string: {}", mask_password(uri)))
    })?;

    let named = |name: &str| {
        caps.name(name)
            .map(|m| m.as_str().to_string())
            .filter(|s| !s.is_empty())
    };

    Ok(UriParts {
        scheme: named("scheme").unwrap_or_default(),
        username: named("username"),
        password: named("password"),
        hosts: named("hosts").unwrap_or_default(),
        database: named("database"),
    })
}

/// Build an endpoint URI from loose settings.
///
/// A `host` that already is a full connection string is returned unchanged.
/// Credentials are embedded only when both username and password are set.
pub fn build_endpoint(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<String> {
    if is_connection_uri(host) {
        return Ok(host.to_string());
    }

    let mut authority = match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    if let (Some(user), Some(pass)) = (username, password) {
        if !user.is_empty() && !pass.is_empty() {
            authority = format!("{}:{}@{}", user, pass, authority);
        }
    }

    let uri = format!("{}://{}/", scheme, authority);
    if !is_connection_uri(&uri) {
        return Err(SyncError::InvalidConfig(format!(
            "cannot build a connection string from host '{}': {}",
            host,
            mask_password(&uri)
        )));
    }

    Ok(uri)
}

/// Replace the password of a connection string with `***`
pub fn mask_password(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &uri[scheme_end + 3..at];
            match credentials.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &uri[..scheme_end + 3],
                    &credentials[..colon],
                    &uri[at..]
                ),
                None => uri.to_string(),
            }
        }
        _ => uri.to_string(),
    }
}
