//! In-memory repository and token directories for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::sync::RwLock;

use tracing::info;

use hubjobs_core::{Identifier, MembershipReplaced, MembershipSink, Username, reconcile_members};
use hubjobs_jobs::{DirectoryError, RepositoryDirectory, TokenDirectory};

#[derive(Debug, Clone, Default)]
struct RepositoryState {
    hook_set: bool,
    subscribers: BTreeSet<Username>,
}

struct SubscriberSet<'a>(&'a mut BTreeSet<Username>);

impl MembershipSink<Username> for SubscriberSet<'_> {
    type Error = Infallible;

    fn remove(&mut self, member: &Username) -> Result<(), Infallible> {
        self.0.remove(member);
        Ok(())
    }

    fn add(&mut self, member: &Username) -> Result<(), Infallible> {
        self.0.insert(member.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRepositoryDirectory {
    repositories: RwLock<HashMap<Identifier, RepositoryState>>,
}

impl InMemoryRepositoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository without hook or subscribers.
    pub fn add_repository(&self, repository: impl Into<Identifier>) {
        self.repositories
            .write()
            .unwrap()
            .entry(repository.into())
            .or_default();
    }

    /// Replace the subscribers of `repository` with `desired`.
    pub fn replace_subscribers(
        &self,
        repository: &Identifier,
        desired: &BTreeSet<Username>,
    ) -> Result<MembershipReplaced<Username>, DirectoryError> {
        let mut repositories = self.repositories.write().unwrap();
        let state = repositories
            .get_mut(repository)
            .ok_or_else(|| DirectoryError::Unknown(repository.clone()))?;
        let current = state.subscribers.clone();
        let Ok(replaced) = reconcile_members(&current, desired, &mut SubscriberSet(&mut state.subscribers));
        if !replaced.is_noop() {
            info!(
                identifier = %repository,
                removed = replaced.removed.len(),
                added = replaced.added.len(),
                "subscribers replaced"
            );
        }
        Ok(replaced)
    }

    pub fn subscribers(&self, repository: &Identifier) -> BTreeSet<Username> {
        self.repositories
            .read()
            .unwrap()
            .get(repository)
            .map(|s| s.subscribers.clone())
            .unwrap_or_default()
    }

    fn with_state<T>(
        &self,
        repository: &Identifier,
        f: impl FnOnce(&RepositoryState) -> T,
    ) -> Result<T, DirectoryError> {
        self.repositories
            .read()
            .unwrap()
            .get(repository)
            .map(f)
            .ok_or_else(|| DirectoryError::Unknown(repository.clone()))
    }
}

impl RepositoryDirectory for InMemoryRepositoryDirectory {
    fn has_subscriptions(&self, repository: &Identifier) -> Result<bool, DirectoryError> {
        self.with_state(repository, |s| !s.subscribers.is_empty())
    }

    fn hook_set(&self, repository: &Identifier) -> Result<bool, DirectoryError> {
        self.with_state(repository, |s| s.hook_set)
    }

    fn set_hook(&self, repository: &Identifier, hook_set: bool) -> Result<(), DirectoryError> {
        let mut repositories = self.repositories.write().unwrap();
        let state = repositories
            .get_mut(repository)
            .ok_or_else(|| DirectoryError::Unknown(repository.clone()))?;
        state.hook_set = hook_set;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    available: bool,
    /// Seconds left on the rate-limit counter, `None` once expired.
    rate_limit_ttl: Option<u64>,
}

#[derive(Debug, Default)]
pub struct InMemoryTokenDirectory {
    tokens: RwLock<HashMap<Identifier, TokenState>>,
}

impl InMemoryTokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `token` unusable for `ttl` seconds.
    pub fn rate_limit(&self, token: impl Into<Identifier>, ttl: u64) {
        self.tokens.write().unwrap().insert(
            token.into(),
            TokenState {
                available: false,
                rate_limit_ttl: Some(ttl),
            },
        );
    }

    /// Let the rate-limit counter of `token` expire.
    pub fn expire(&self, token: &Identifier) {
        if let Some(state) = self.tokens.write().unwrap().get_mut(token) {
            state.rate_limit_ttl = None;
        }
    }

    pub fn is_available(&self, token: &Identifier) -> bool {
        self.tokens
            .read()
            .unwrap()
            .get(token)
            .is_some_and(|s| s.available)
    }
}

impl TokenDirectory for InMemoryTokenDirectory {
    fn reset_flags(&self, token: &Identifier) -> Result<bool, DirectoryError> {
        let mut tokens = self.tokens.write().unwrap();
        let state = tokens
            .get_mut(token)
            .ok_or_else(|| DirectoryError::Unknown(token.clone()))?;
        if state.rate_limit_ttl.is_some() {
            return Ok(false);
        }
        state.available = true;
        Ok(true)
    }

    fn rate_limit_ttl(&self, token: &Identifier) -> Result<Option<u64>, DirectoryError> {
        let tokens = self.tokens.read().unwrap();
        let state = tokens
            .get(token)
            .ok_or_else(|| DirectoryError::Unknown(token.clone()))?;
        Ok(state.rate_limit_ttl)
    }

    fn mark_rate_limited(&self, token: &Identifier, ttl: u64) -> Result<(), DirectoryError> {
        self.rate_limit(token.clone(), ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(names: &[&str]) -> BTreeSet<Username> {
        names.iter().map(|n| Username::parse(*n).unwrap()).collect()
    }

    #[test]
    fn replacing_subscribers_emits_one_diff() {
        let dir = InMemoryRepositoryDirectory::new();
        let repo = Identifier::from("42");
        dir.add_repository(repo.clone());
        dir.replace_subscribers(&repo, &users(&["alice", "bob"])).unwrap();

        let replaced = dir.replace_subscribers(&repo, &users(&["bob", "carol"])).unwrap();

        assert_eq!(replaced.removed, users(&["alice"]));
        assert_eq!(replaced.added, users(&["carol"]));
        assert_eq!(dir.subscribers(&repo), users(&["bob", "carol"]));
        assert!(dir.has_subscriptions(&repo).unwrap());

        let cleared = dir.replace_subscribers(&repo, &BTreeSet::new()).unwrap();
        assert_eq!(cleared.removed, users(&["bob", "carol"]));
        assert!(!dir.has_subscriptions(&repo).unwrap());
    }

    #[test]
    fn unknown_repository_is_an_error() {
        let dir = InMemoryRepositoryDirectory::new();
        let repo = Identifier::from("404");
        assert_eq!(dir.hook_set(&repo), Err(DirectoryError::Unknown(repo.clone())));
        assert!(dir.set_hook(&repo, true).is_err());
        assert!(dir.replace_subscribers(&repo, &users(&["alice"])).is_err());
    }

    #[test]
    fn token_is_reset_only_after_expiry() {
        let tokens = InMemoryTokenDirectory::new();
        let token = Identifier::from("tok");
        tokens.rate_limit(token.clone(), 5);

        assert!(!tokens.reset_flags(&token).unwrap());
        assert_eq!(tokens.rate_limit_ttl(&token).unwrap(), Some(5));
        assert!(!tokens.is_available(&token));

        tokens.expire(&token);
        assert!(tokens.reset_flags(&token).unwrap());
        assert!(tokens.is_available(&token));
        assert_eq!(tokens.rate_limit_ttl(&token).unwrap(), None);
    }

    #[test]
    fn marking_a_token_rate_limited_makes_it_unavailable() {
        let tokens = InMemoryTokenDirectory::new();
        let token = Identifier::from("fresh");
        tokens.mark_rate_limited(&token, 30).unwrap();

        assert!(!tokens.is_available(&token));
        assert_eq!(tokens.rate_limit_ttl(&token).unwrap(), Some(30));
        assert!(!tokens.reset_flags(&token).unwrap());
    }
}
