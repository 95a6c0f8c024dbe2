use arena_chat::ContextFetch;
use arena_core::records::{Hub, Identity, MatchRecord, Tournament, User};
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;

use crate::client::RestClient;

/// Bridges the REST client into the chat core's context cache. Fetch
/// failures degrade to `None`; the cache treats them like missing
/// records and the classifier drops what it cannot resolve.
#[derive(Clone)]
pub struct RestFetch {
    client: RestClient,
}

impl RestFetch {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

impl ContextFetch for RestFetch {
    fn hub(&self, id: &str) -> BoxFuture<'static, Option<Hub>> {
        let client = self.client.clone();
        let id = id.to_string();
        async move {
            client.hub(&id).await.unwrap_or_else(|error| {
                warn!(%error, id, "hub fetch failed");
                None
            })
        }
        .boxed()
    }

    fn match_record(&self, id: &str) -> BoxFuture<'static, Option<MatchRecord>> {
        let client = self.client.clone();
        let id = id.to_string();
        async move {
            client.match_record(&id).await.unwrap_or_else(|error| {
                warn!(%error, id, "match fetch failed");
                None
            })
        }
        .boxed()
    }

    fn user(&self, id: &str) -> BoxFuture<'static, Option<User>> {
        let client = self.client.clone();
        let id = id.to_string();
        async move {
            client.user(&id).await.unwrap_or_else(|error| {
                warn!(%error, id, "user fetch failed");
                None
            })
        }
        .boxed()
    }

    fn tournament(&self, id: &str) -> BoxFuture<'static, Option<Tournament>> {
        let client = self.client.clone();
        let id = id.to_string();
        async move {
            client.tournament(&id).await.unwrap_or_else(|error| {
                warn!(%error, id, "tournament fetch failed");
                None
            })
        }
        .boxed()
    }

    fn identity(&self, _id: &str) -> BoxFuture<'static, Option<Identity>> {
        let client = self.client.clone();
        async move {
            client.identity().await.unwrap_or_else(|error| {
                warn!(%error, "identity fetch failed");
                None
            })
        }
        .boxed()
    }
}
