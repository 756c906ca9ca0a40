//! In-memory resource store.
//!
//! Keeps objects in a map and records every call, so tests can assert on the
//! exact sequence a task issued. Readiness is simulated: a write bumps the
//! object's generation and readiness polls move `observed_generation` toward
//! it according to the configured [`Readiness`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{ClientError, ResourceClient};
use crate::resource::{ManagedResource, ResourceKey};

/// Client verb recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    CreateIfAbsent,
    CreateOrUpdate,
    Delete,
    IsReady,
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub key: ResourceKey,
}

/// How stored objects report readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as written.
    Immediate,
    /// Ready on the n-th poll after the latest write.
    AfterPolls(u32),
    Never,
}

#[derive(Debug, Clone)]
struct Stored {
    resource: ManagedResource,
    generation: u64,
    observed_generation: u64,
    polls: u32,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ResourceKey, Stored>,
    journal: Vec<Call>,
    failures: HashMap<(CallKind, ResourceKey), ClientError>,
    readiness: HashMap<ResourceKey, Readiness>,
}

#[derive(Debug)]
pub struct MemoryClient {
    state: Mutex<State>,
    default_readiness: Readiness,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::with_readiness(Readiness::Immediate)
    }

    pub fn with_readiness(readiness: Readiness) -> Self {
        Self {
            state: Mutex::new(State::default()),
            default_readiness: readiness,
        }
    }

    /// Override readiness of one object.
    pub async fn set_readiness(&self, key: ResourceKey, readiness: Readiness) {
        self.state.lock().await.readiness.insert(key, readiness);
    }

    /// Make every `kind` call on `key` fail with `error` until cleared.
    pub async fn fail_on(&self, kind: CallKind, key: ResourceKey, error: ClientError) {
        self.state.lock().await.failures.insert((kind, key), error);
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Store an object directly, bypassing the journal.
    pub async fn insert(&self, resource: ManagedResource) {
        let mut state = self.state.lock().await;
        let key = resource.key.clone();
        state.objects.insert(key, Stored::new(resource));
    }

    pub async fn snapshot(&self, key: &ResourceKey) -> Option<ManagedResource> {
        let state = self.state.lock().await;
        state.objects.get(key).map(|s| s.resource.clone())
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().await.objects.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    /// Generation of a stored object; bumped on every effective write.
    pub async fn generation(&self, key: &ResourceKey) -> Option<u64> {
        let state = self.state.lock().await;
        state.objects.get(key).map(|s| s.generation)
    }

    pub async fn journal(&self) -> Vec<Call> {
        self.state.lock().await.journal.clone()
    }

    /// Journal entries that change the store.
    pub async fn writes(&self) -> Vec<Call> {
        self.journal()
            .await
            .into_iter()
            .filter(|c| {
                matches!(
                    c.kind,
                    CallKind::CreateIfAbsent | CallKind::CreateOrUpdate | CallKind::Delete
                )
            })
            .collect()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }
}

impl Stored {
    fn new(resource: ManagedResource) -> Self {
        Self {
            resource,
            generation: 1,
            observed_generation: 0,
            polls: 0,
        }
    }

    fn replace(&mut self, resource: ManagedResource) {
        self.resource = resource;
        self.generation += 1;
        self.polls = 0;
    }
}

impl State {
    fn record(&mut self, kind: CallKind, key: &ResourceKey) -> Result<(), ClientError> {
        self.journal.push(Call {
            kind,
            key: key.clone(),
        });
        match self.failures.get(&(kind, key.clone())) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn create_if_absent(&self, resource: &ManagedResource) -> Result<bool, ClientError> {
        let mut state = self.state.lock().await;
        state.record(CallKind::CreateIfAbsent, &resource.key)?;
        if state.objects.contains_key(&resource.key) {
            return Ok(false);
        }
        debug!(resource = %resource.key, "Creating object");
        state
            .objects
            .insert(resource.key.clone(), Stored::new(resource.clone()));
        Ok(true)
    }

    async fn create_or_update(&self, resource: &ManagedResource) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.record(CallKind::CreateOrUpdate, &resource.key)?;
        match state.objects.get_mut(&resource.key) {
            Some(stored) if stored.resource == *resource => {}
            Some(stored) => {
                debug!(resource = %resource.key, "Updating object");
                stored.replace(resource.clone());
            }
            None => {
                debug!(resource = %resource.key, "Creating object");
                state
                    .objects
                    .insert(resource.key.clone(), Stored::new(resource.clone()));
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        state.record(CallKind::Delete, key)?;
        if state.objects.remove(key).is_some() {
            debug!(resource = %key, "Deleted object");
        }
        Ok(())
    }

    async fn is_ready(&self, key: &ResourceKey) -> Result<bool, ClientError> {
        let mut state = self.state.lock().await;
        state.record(CallKind::IsReady, key)?;
        let readiness = state
            .readiness
            .get(key)
            .copied()
            .unwrap_or(self.default_readiness);
        let Some(stored) = state.objects.get_mut(key) else {
            return Ok(false);
        };
        if stored.observed_generation == stored.generation {
            return Ok(true);
        }
        stored.polls += 1;
        let ready = match readiness {
            Readiness::Immediate => true,
            Readiness::AfterPolls(n) => stored.polls >= n,
            Readiness::Never => false,
        };
        if ready {
            stored.observed_generation = stored.generation;
        }
        Ok(ready)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ManagedResource>, ClientError> {
        let mut state = self.state.lock().await;
        state.record(CallKind::Get, key)?;
        Ok(state.objects.get(key).map(|s| s.resource.clone()))
    }
}
