//! Mapping namespace paths to the sandbox that owns them.

use crate::error::ResolveError;
use crate::namespace::NsPath;
use crate::state::StateStore;
use std::collections::BTreeSet;

/// Resolve a namespace path to the name of the sandbox hosting it.
///
/// A bare name is returned unchanged. A `/proc/<pid>/ns/...` path matches
/// every state record with that pid. Containers of one sandbox share the
/// VMM pid, so the matches must agree on a single owning sandbox.
pub fn resolve_shared_sandbox(store: &StateStore, ns_path: &str) -> Result<String, ResolveError> {
    let pid = match NsPath::parse(ns_path)? {
        NsPath::Name(name) => return Ok(name),
        NsPath::Proc { pid, .. } => pid,
    };

    let mut owners = BTreeSet::new();
    for id in store.ids()? {
        let state = match store.load(&id) {
            Ok(state) => state,
            Err(e) => {
                tracing::trace!(entry = %id, error = %e, "Skipping unreadable state");
                continue;
            }
        };
        if state.pid == pid {
            owners.insert(state.owner().to_string());
        }
    }

    let mut owners = owners.into_iter();
    match (owners.next(), owners.next()) {
        (None, _) => Err(ResolveError::NotFound { pid }),
        (Some(owner), None) => {
            tracing::debug!(ns_path, pid, sandbox = %owner, "Resolved shared namespace");
            Ok(owner)
        }
        (Some(first), Some(second)) => {
            let mut sandboxes = vec![first, second];
            sandboxes.extend(owners);
            Err(ResolveError::Ambiguous { sandboxes })
        }
    }
}
