//! Abstract binding over zero-or-more remote scopes. The engine only ever
//! fetches component bundles and pushes them; the wire transport behind a
//! remote is someone else's concern.

use std::collections::BTreeMap;

use log::{error, info};

use crate::scope::error::{Result, ScopeError};
use crate::scope::id::BitId;
use crate::scope::models::ComponentObjects;

/// A single remote scope, addressed by name
pub trait RemoteScope {
    fn name(&self) -> &str;

    /// Returns the requested components with either just their head version
    /// or their full objects closure
    fn fetch(&mut self, ids: &[BitId], only_head: bool) -> Result<Vec<ComponentObjects>>;

    /// Pushes component bundles. Atomic on the remote side; returns the id
    /// strings the remote accepted.
    fn push_many(&mut self, bundles: Vec<ComponentObjects>) -> Result<Vec<String>>;
}

/// Resolver over the remotes an operation may talk to, keyed by name.
/// Composed once per operation from process-wide remotes and scope-local
/// overrides; it is injected, never read from shared state.
#[derive(Default)]
pub struct Remotes {
    remotes: BTreeMap<String, Box<dyn RemoteScope>>,
}

impl Remotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, remote: Box<dyn RemoteScope>) {
        self.remotes.insert(remote.name().to_string(), remote);
    }

    /// Combines process-wide remotes with scope-local ones. On a name
    /// collision the scope-local remote wins.
    pub fn compose(global: Remotes, local: Remotes) -> Remotes {
        let mut remotes = global.remotes;
        remotes.extend(local.remotes);
        Remotes { remotes }
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.remotes.contains_key(name)
    }

    /// Resolves a remote by name
    pub fn resolve(&mut self, name: &str) -> Result<&mut dyn RemoteScope> {
        match self.remotes.get_mut(name) {
            Some(remote) => Ok(remote.as_mut()),
            None => Err(ScopeError::RemoteScopeNotFound(name.to_string())),
        }
    }

    /// Fetches from the remote owning `scope_name`, falling back to the
    /// other known remotes when it fails. The first error is surfaced if
    /// every remote fails.
    pub fn fetch_from_any(
        &mut self,
        scope_name: &str,
        ids: &[BitId],
        only_head: bool,
    ) -> Result<Vec<ComponentObjects>> {
        let mut order: Vec<String> = Vec::with_capacity(self.remotes.len());
        if self.remotes.contains_key(scope_name) {
            order.push(scope_name.to_string());
        }
        order.extend(
            self.remotes
                .keys()
                .filter(|name| name.as_str() != scope_name)
                .cloned(),
        );

        let mut first_err: Option<ScopeError> = None;

        for name in order {
            if let Some(remote) = self.remotes.get_mut(&name) {
                match remote.fetch(ids, only_head) {
                    Ok(bundles) => {
                        info!("Fetched {} component(s) from remote {}", bundles.len(), name);
                        return Ok(bundles);
                    }
                    Err(e) => {
                        error!("Fetching from remote {} failed: {}", name, e);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        Err(first_err
            .unwrap_or_else(|| ScopeError::RemoteScopeNotFound(scope_name.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::{RemoteScope, Remotes};
    use crate::scope::error::{Result, ScopeError};
    use crate::scope::id::BitId;
    use crate::scope::models::ComponentObjects;

    struct StubRemote {
        name: String,
        fail: bool,
    }

    impl RemoteScope for StubRemote {
        fn name(&self) -> &str {
            &self.name
        }

        fn fetch(&mut self, _ids: &[BitId], _only_head: bool) -> Result<Vec<ComponentObjects>> {
            if self.fail {
                Err(ScopeError::PermissionDenied(self.name.clone()))
            } else {
                Ok(vec![])
            }
        }

        fn push_many(&mut self, _bundles: Vec<ComponentObjects>) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn remote(name: &str, fail: bool) -> Box<dyn RemoteScope> {
        Box::new(StubRemote {
            name: name.to_string(),
            fail,
        })
    }

    #[test]
    fn resolve_unknown_remote_fails() {
        let mut remotes = Remotes::new();
        assert!(matches!(
            remotes.resolve("nowhere"),
            Err(ScopeError::RemoteScopeNotFound(_))
        ));
    }

    #[test]
    fn local_remotes_override_global_on_collision() {
        let mut global = Remotes::new();
        global.add(remote("shared", true));
        let mut local = Remotes::new();
        local.add(remote("shared", false));

        let mut composed = Remotes::compose(global, local);
        assert!(!composed.is_empty());
        assert!(composed.contains("shared"));

        let ids: Vec<BitId> = vec![];
        assert!(composed.fetch_from_any("shared", &ids, false).is_ok());
    }

    #[test]
    fn fetch_falls_back_to_next_remote_and_surfaces_first_error() {
        let ids: Vec<BitId> = vec![];

        let mut remotes = Remotes::new();
        remotes.add(remote("primary", true));
        remotes.add(remote("secondary", false));
        assert!(remotes.fetch_from_any("primary", &ids, false).is_ok());

        let mut all_failing = Remotes::new();
        all_failing.add(remote("primary", true));
        all_failing.add(remote("secondary", true));
        match all_failing.fetch_from_any("primary", &ids, false) {
            Err(ScopeError::PermissionDenied(name)) => assert_eq!("primary", name),
            other => panic!("expected the first error, got {:?}", other),
        }
    }
}
