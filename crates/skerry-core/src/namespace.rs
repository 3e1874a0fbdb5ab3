//! Namespace path parsing.

use crate::error::ResolveError;

/// Where a shared namespace lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsPath {
    /// A container name given directly.
    Name(String),
    /// `/proc/<pid>/ns[/<ns>]`.
    Proc { pid: u32, ns: Option<String> },
}

impl NsPath {
    /// Parse the `path` of an OCI namespace entry.
    ///
    /// Values without a `/` are container names. Anything else must have
    /// the shape `/proc/<digits>/ns` optionally followed by one namespace
    /// name.
    pub fn parse(value: &str) -> Result<Self, ResolveError> {
        if !value.contains('/') {
            return Ok(Self::Name(value.to_string()));
        }
        let malformed = || ResolveError::MalformedPath(value.to_string());

        let rest = value.strip_prefix("/proc/").ok_or_else(malformed)?;
        let mut segments = rest.split('/');

        let pid = segments.next().ok_or_else(malformed)?;
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let pid: u32 = pid.parse().map_err(|_| malformed())?;

        if segments.next() != Some("ns") {
            return Err(malformed());
        }
        let ns = match (segments.next(), segments.next()) {
            (None, _) | (Some(""), None) => None,
            (Some(name), None) => Some(name.to_string()),
            _ => return Err(malformed()),
        };
        Ok(Self::Proc { pid, ns })
    }
}
