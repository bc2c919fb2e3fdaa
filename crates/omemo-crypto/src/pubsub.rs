//! Bundle publish/subscribe service interface and an in-memory hub.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use omemo_protocol::{Identifier, PubSubItems, PubSubPayload};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct FetchError(pub String);

/// The pub/sub service bundles and device lists are published through.
#[async_trait::async_trait(?Send)]
pub trait BundleService {
    /// Retrieve the items of `node` owned by `identifier`.
    async fn retrieve_items(
        &self,
        node: &str,
        identifier: &Identifier,
    ) -> Result<PubSubItems, FetchError>;

    /// Publish `payload` as the current item of the local account's `node`.
    async fn publish_items(&self, node: &str, payload: PubSubPayload) -> Result<(), FetchError>;
}

type NodeKey = (Identifier, String);

#[derive(Default)]
struct HubState {
    items: HashMap<NodeKey, PubSubPayload>,
    unavailable: HashSet<NodeKey>,
    retrievals: HashMap<NodeKey, usize>,
}

/// In-memory pub/sub hub shared by several accounts.
///
/// Each account talks to the hub through its own [`PubSubClient`].
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| {
            warn!("pubsub mutex poisoned, recovering");
            p.into_inner()
        })
    }

    /// A client publishing as `owner`.
    pub fn client(&self, owner: Identifier) -> PubSubClient {
        PubSubClient {
            hub: self.clone(),
            owner,
        }
    }

    /// Make retrievals of `node` fail (or succeed again).
    pub fn set_unavailable(&self, owner: &Identifier, node: &str, unavailable: bool) {
        let key = (owner.clone(), node.to_string());
        let mut state = self.state();
        if unavailable {
            state.unavailable.insert(key);
        } else {
            state.unavailable.remove(&key);
        }
    }

    /// Replace the current item of a node directly.
    pub fn set_item(&self, owner: &Identifier, node: &str, payload: PubSubPayload) {
        self.state()
            .items
            .insert((owner.clone(), node.to_string()), payload);
    }

    pub fn item(&self, owner: &Identifier, node: &str) -> Option<PubSubPayload> {
        self.state()
            .items
            .get(&(owner.clone(), node.to_string()))
            .cloned()
    }

    /// How many times `node` of `owner` has been retrieved.
    pub fn retrievals(&self, owner: &Identifier, node: &str) -> usize {
        self.state()
            .retrievals
            .get(&(owner.clone(), node.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// One account's connection to a [`MemoryPubSub`] hub.
#[derive(Clone)]
pub struct PubSubClient {
    hub: MemoryPubSub,
    owner: Identifier,
}

#[async_trait::async_trait(?Send)]
impl BundleService for PubSubClient {
    async fn retrieve_items(
        &self,
        node: &str,
        identifier: &Identifier,
    ) -> Result<PubSubItems, FetchError> {
        let key = (identifier.clone(), node.to_string());
        let mut state = self.hub.state();
        *state.retrievals.entry(key.clone()).or_default() += 1;

        if state.unavailable.contains(&key) {
            return Err(FetchError(format!("service unavailable for {node}")));
        }

        match state.items.get(&key) {
            Some(payload) => Ok(PubSubItems {
                node: node.to_string(),
                items: vec![payload.clone()],
            }),
            None => Err(FetchError(format!("item-not-found: {node} of {identifier}"))),
        }
    }

    async fn publish_items(&self, node: &str, payload: PubSubPayload) -> Result<(), FetchError> {
        debug!(owner = %self.owner, node, "publishing item");
        self.hub
            .state()
            .items
            .insert((self.owner.clone(), node.to_string()), payload);
        Ok(())
    }
}
