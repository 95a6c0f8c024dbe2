use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arena_core::config::ChatConfig;
use arena_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::address::Address;
use crate::correlator::{self, Correlator};
use crate::error::ChatError;
use crate::stanza::Presence;
use crate::transport::TransportHandle;

/// A live room subscription, keyed by the bare room address.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub target: Address,
    pub priority: i64,
    pub init: bool,
    pub updates: bool,
    pub subscribed_at: DateTime<Utc>,
}

/// Tracks which rooms the session is subscribed to and replays them
/// after a reconnect. Subscriptions are presence requests confirmed by
/// a correlated presence from the room itself.
pub struct RoomManager<B: EventBus> {
    config: Arc<ChatConfig>,
    bus: Arc<B>,
    transport: TransportHandle,
    correlator: Arc<Correlator>,
    conference_domain: String,
    subscriptions: DashMap<String, Subscription>,
    sequence: AtomicU64,
}

impl<B: EventBus> RoomManager<B> {
    pub fn new(
        config: Arc<ChatConfig>,
        bus: Arc<B>,
        transport: TransportHandle,
        correlator: Arc<Correlator>,
        conference_domain: impl Into<String>,
    ) -> Self {
        Self {
            config,
            bus,
            transport,
            correlator,
            conference_domain: conference_domain.into(),
            subscriptions: DashMap::new(),
            sequence: AtomicU64::new(1),
        }
    }

    /// Address of a match room.
    pub fn match_room(&self, match_id: &str) -> Result<Address, ChatError> {
        Ok(Address::new(
            self.conference_domain.clone(),
            Some(format!("match-{match_id}")),
            None,
        )?)
    }

    /// Address of one team's room within a match.
    pub fn team_room(&self, match_id: &str, team_id: &str) -> Result<Address, ChatError> {
        Ok(Address::new(
            self.conference_domain.clone(),
            Some(format!("team-{match_id}_{team_id}")),
            None,
        )?)
    }

    /// Address of a hub's general room.
    pub fn hub_room(&self, hub_id: &str) -> Result<Address, ChatError> {
        Ok(Address::new(
            self.conference_domain.clone(),
            Some(format!("hub-{hub_id}-general")),
            None,
        )?)
    }

    /// Subscribe to one room and wait for the room's confirmation.
    pub async fn subscribe(&self, target: &Address, priority: i64) -> Result<(), ChatError> {
        self.request(target, priority, true, true).await?;
        self.record(target, priority, true, true);
        self.publish(EventPayload::Subscribed {
            target: target.to_string(),
        });
        Ok(())
    }

    /// Subscribe to a match room and both team rooms in parallel. Team
    /// room failures are tolerated; the match room is mandatory.
    pub async fn subscribe_match(
        &self,
        match_id: &str,
        team_ids: [&str; 2],
        priority: i64,
    ) -> Result<(), ChatError> {
        let match_target = self.match_room(match_id)?;
        let left = self.team_room(match_id, team_ids[0])?;
        let right = self.team_room(match_id, team_ids[1])?;

        let (match_result, left_result, right_result) = tokio::join!(
            self.subscribe(&match_target, priority),
            self.subscribe(&left, priority),
            self.subscribe(&right, priority),
        );

        for (target, result) in [(&left, left_result), (&right, right_result)] {
            if let Err(error) = result {
                warn!(target = %target, %error, "team room subscription failed");
            }
        }
        match_result
    }

    /// Unsubscribe from a room. The server is told best-effort; the
    /// local record goes away regardless.
    pub async fn unsubscribe(&self, target: &Address) -> Result<(), ChatError> {
        let id = self.next_id();
        let frame = Presence::unsubscribe(id, target).to_element().to_wire();
        let outcome = self.transport.send(frame).await;
        self.subscriptions.remove(&target.without_resource().to_string());
        self.publish(EventPayload::Unsubscribed {
            target: target.to_string(),
        });
        outcome
    }

    /// Re-issue every recorded subscription after a reconnect.
    pub async fn replay(&self) -> usize {
        let recorded: Vec<Subscription> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let attempts = recorded.iter().map(|subscription| {
            self.request(
                &subscription.target,
                subscription.priority,
                subscription.init,
                subscription.updates,
            )
        });

        let mut replayed = 0;
        for (subscription, result) in recorded.iter().zip(join_all(attempts).await) {
            match result {
                Ok(()) => replayed += 1,
                Err(error) => {
                    warn!(target = %subscription.target, %error, "subscription replay failed");
                }
            }
        }

        self.publish(EventPayload::SubscriptionsReplayed { count: replayed });
        debug!(replayed, total = recorded.len(), "subscriptions replayed");
        replayed
    }

    /// Forget all records, e.g. when the user logs out.
    pub fn clear(&self) {
        self.subscriptions.clear();
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_subscribed(&self, target: &Address) -> bool {
        self.subscriptions
            .contains_key(&target.without_resource().to_string())
    }

    async fn request(
        &self,
        target: &Address,
        priority: i64,
        init: bool,
        updates: bool,
    ) -> Result<(), ChatError> {
        let id = self.next_id();
        let frame = Presence::subscribe(id, target, priority)
            .without_feed(init, updates)
            .to_element()
            .to_wire();
        let confirmation = correlator::all(vec![
            correlator::named("presence"),
            correlator::from_bare(target),
        ]);
        self.correlator
            .send_and_wait(
                &self.transport,
                frame,
                confirmation,
                self.config.request_timeout(),
            )
            .await?;
        Ok(())
    }

    fn record(&self, target: &Address, priority: i64, init: bool, updates: bool) {
        let bare = target.without_resource();
        self.subscriptions.insert(
            bare.to_string(),
            Subscription {
                target: bare,
                priority,
                init,
                updates,
                subscribed_at: Utc::now(),
            },
        );
    }

    fn next_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("sub_{n}")
    }

    fn publish(&self, payload: EventPayload) {
        let Ok(channel) = Channel::new("room.subscriptions") else {
            return;
        };
        if let Err(error) = self
            .bus
            .publish(Event::new(channel, EventSource::Rooms, payload))
        {
            debug!(%error, "room event dropped");
        }
    }
}
