use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::address::Address;
use crate::error::ChatError;
use crate::stanza::Stanza;
use crate::transport::TransportHandle;

/// Decides whether an inbound stanza answers a pending request.
pub type Predicate = Arc<dyn Fn(&Stanza) -> bool + Send + Sync>;

struct Pending {
    predicate: Predicate,
    sender: oneshot::Sender<Stanza>,
}

/// Matches inbound stanzas against registered expectations.
///
/// Every waiter whose predicate accepts a stanza resolves with it,
/// each at most once; claimed stanzas are consumed, everything else
/// flows onward to the regular dispatch path. Waiters that time out
/// deregister themselves.
pub struct Correlator {
    pending: DashMap<u64, Pending>,
    next_key: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_key: AtomicU64::new(1),
        }
    }

    /// Register an expectation. The returned handle resolves with the
    /// first stanza the predicate accepts.
    pub fn expect(self: &Arc<Self>, predicate: Predicate) -> PendingReply {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(key, Pending { predicate, sender });
        PendingReply {
            key,
            receiver,
            correlator: Arc::clone(self),
        }
    }

    /// Offer an inbound stanza to all waiters. Every matching waiter
    /// resolves; returns `true` when at least one claimed it.
    pub fn offer(&self, stanza: &Stanza) -> bool {
        let candidates: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| (entry.value().predicate)(stanza))
            .map(|entry| *entry.key())
            .collect();

        let mut claimed = false;
        for key in candidates {
            // remove first so each waiter resolves at most once even
            // when offers race
            if let Some((_, pending)) = self.pending.remove(&key) {
                if pending.sender.send(stanza.clone()).is_ok() {
                    claimed = true;
                } else {
                    debug!(key, "waiter vanished before delivery");
                }
            }
        }
        claimed
    }

    /// Register, send, then await the correlated reply.
    pub async fn send_and_wait(
        self: &Arc<Self>,
        handle: &TransportHandle,
        frame: String,
        predicate: Predicate,
        timeout: Duration,
    ) -> Result<Stanza, ChatError> {
        let reply = self.expect(predicate);
        handle.send(frame).await?;
        reply.wait(timeout).await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered expectation waiting for its reply.
pub struct PendingReply {
    key: u64,
    receiver: oneshot::Receiver<Stanza>,
    correlator: Arc<Correlator>,
}

impl PendingReply {
    pub async fn wait(mut self, timeout: Duration) -> Result<Stanza, ChatError> {
        // Drop deregisters the expectation on every exit path
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(stanza)) => Ok(stanza),
            Ok(Err(_)) => Err(ChatError::Protocol("correlator dropped waiter".into())),
            Err(_) => Err(ChatError::Timeout),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.pending.remove(&self.key);
    }
}

/// Accepts stanzas carrying the given id.
pub fn with_id(id: impl Into<String>) -> Predicate {
    let id = id.into();
    Arc::new(move |stanza| stanza.id() == Some(id.as_str()))
}

/// Accepts stanzas whose bare sender matches.
pub fn from_bare(address: &Address) -> Predicate {
    let bare = address.without_resource();
    Arc::new(move |stanza| {
        stanza
            .from()
            .map(|from| from.without_resource() == bare)
            .unwrap_or(false)
    })
}

/// Accepts stanzas of the given element name.
pub fn named(name: &'static str) -> Predicate {
    Arc::new(move |stanza| stanza.name().eq_ignore_ascii_case(name))
}

/// Accepts only stanzas every inner predicate accepts.
pub fn all(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |stanza| predicates.iter().all(|predicate| predicate(stanza)))
}

/// Accepts stanzas any inner predicate accepts.
pub fn any(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |stanza| predicates.iter().any(|predicate| predicate(stanza)))
}

#[cfg(test)]
mod tests {
    use crate::element::Element;
    use crate::stanza::StanzaRegistry;

    use super::*;

    fn stanza(raw: &str) -> Stanza {
        StanzaRegistry::with_defaults()
            .parse(Element::parse(raw).expect("element should parse"))
            .expect("stanza should parse")
    }

    #[tokio::test]
    async fn claims_matching_stanza_once() {
        let correlator = Arc::new(Correlator::new());
        let reply = correlator.expect(with_id("q1"));

        let answer = stanza("<iq id='q1' type='result'/>");
        assert!(correlator.offer(&answer));
        // a second identical offer finds no waiter
        assert!(!correlator.offer(&answer));

        let claimed = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(claimed.id(), Some("q1"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn one_stanza_resolves_every_matching_expectation() {
        let correlator = Arc::new(Correlator::new());
        let by_id = correlator.expect(with_id("q1"));
        let by_name = correlator.expect(named("iq"));

        assert!(correlator.offer(&stanza("<iq id='q1' type='result'/>")));

        let first = by_id.wait(Duration::from_secs(1)).await.unwrap();
        let second = by_name.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.id(), Some("q1"));
        assert_eq!(second.id(), Some("q1"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_stanzas_flow_past() {
        let correlator = Arc::new(Correlator::new());
        let _reply = correlator.expect(with_id("q1"));
        assert!(!correlator.offer(&stanza("<iq id='q2' type='result'/>")));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_deregisters_the_waiter() {
        let correlator = Arc::new(Correlator::new());
        let reply = correlator.expect(with_id("q1"));

        let outcome = reply.wait(Duration::from_secs(5)).await;
        assert!(matches!(outcome, Err(ChatError::Timeout)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_reply_deregisters() {
        let correlator = Arc::new(Correlator::new());
        drop(correlator.expect(with_id("q1")));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn all_combinator_requires_every_predicate() {
        let correlator = Arc::new(Correlator::new());
        let sender = Address::parse("room@conf/u1").unwrap();
        let _reply = correlator.expect(all(vec![named("presence"), from_bare(&sender)]));

        assert!(!correlator.offer(&stanza("<presence from='other@conf/u1'/>")));
        assert!(correlator.offer(&stanza("<presence from='room@conf/u9'/>")));
    }

    #[tokio::test]
    async fn any_combinator_accepts_either() {
        let correlator = Arc::new(Correlator::new());
        let _reply = correlator.expect(any(vec![with_id("a"), with_id("b")]));
        assert!(correlator.offer(&stanza("<iq id='b' type='result'/>")));
    }
}
