//! Client subscriptions and their feed timers
//!
//! A subscription targets one variable, every variable of one hardware
//! interface (empty variable) or everything (both empty). Each active
//! subscription owns a tokio timer that posts a [`FeedRequest`]; the router
//! answers it with the current user values the subscription covers.
//!
//! When a client holds both a broad and a narrow subscription, a variable is
//! only sent by the most specific one. [`SubscriptionManager::more_specific_subscription_exists`]
//! is the check the router uses for that.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use qc_protocol::WILDCARD;
use qc_state::VariableKey;

use crate::connection::ClientId;

/// Subscription target with `*` folded to empty
fn normalize(target: &str) -> String {
    if target == WILDCARD {
        String::new()
    } else {
        target.to_string()
    }
}

// ============================================================================
// Subscription
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client: ClientId,
    pub hw_interface: String,
    pub variable: String,
    pub interval: Duration,
}

impl Subscription {
    pub fn new(client: ClientId, hw_interface: &str, variable: &str, interval: Duration) -> Self {
        Self {
            client,
            hw_interface: normalize(hw_interface),
            variable: normalize(variable),
            interval,
        }
    }

    /// 0 for everything, 1 for a whole interface, 2 for one variable
    pub fn specificity(&self) -> u8 {
        match (self.hw_interface.is_empty(), self.variable.is_empty()) {
            (true, _) => 0,
            (false, true) => 1,
            (false, false) => 2,
        }
    }

    /// Whether values of `key` are sent by this subscription
    pub fn covers(&self, key: &VariableKey) -> bool {
        (self.hw_interface.is_empty() || self.hw_interface == key.hw_interface)
            && (self.variable.is_empty() || self.variable == key.name)
    }

    /// Whether this subscription's target contains `other`'s
    pub fn includes(&self, other: &Subscription) -> bool {
        if self.same_target(other) {
            return true;
        }
        if self.hw_interface.is_empty() && self.variable.is_empty() {
            return true;
        }
        self.hw_interface == other.hw_interface
            && self.variable.is_empty()
            && other.specificity() > self.specificity()
    }

    fn same_target(&self, other: &Subscription) -> bool {
        self.hw_interface == other.hw_interface && self.variable == other.variable
    }

    fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            client: self.client,
            hw_interface: self.hw_interface.clone(),
            variable: self.variable.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SubscriptionKey {
    client: ClientId,
    hw_interface: String,
    variable: String,
}

/// A subscription timer fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    pub client: ClientId,
    pub hw_interface: String,
    pub variable: String,
}

// ============================================================================
// FeedTask - periodic `FeedRequest` emitter
// ============================================================================

#[derive(Debug)]
struct FeedTask {
    handle: JoinHandle<()>,
}

impl FeedTask {
    fn start(subscription: &Subscription, feed_tx: mpsc::UnboundedSender<FeedRequest>) -> Self {
        let request = FeedRequest {
            client: subscription.client,
            hw_interface: subscription.hw_interface.clone(),
            variable: subscription.variable.clone(),
        };
        let period = subscription.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if feed_tx.send(request.clone()).is_err() {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct ActiveSubscription {
    subscription: Subscription,
    _task: FeedTask,
}

// ============================================================================
// SubscriptionManager
// ============================================================================

#[derive(Debug)]
pub struct SubscriptionManager {
    active: BTreeMap<SubscriptionKey, ActiveSubscription>,
    feed_tx: mpsc::UnboundedSender<FeedRequest>,
}

impl SubscriptionManager {
    /// Create an empty manager and the receiving end of its feed channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FeedRequest>) {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let manager = Self {
            active: BTreeMap::new(),
            feed_tx,
        };
        (manager, feed_rx)
    }

    /// Start a subscription unless an identical one exists
    ///
    /// Must be called from within a tokio runtime. Returns whether a new
    /// subscription was created.
    pub fn subscribe(
        &mut self,
        client: ClientId,
        interval: Duration,
        hw_interface: &str,
        variable: &str,
    ) -> bool {
        let subscription = Subscription::new(client, hw_interface, variable, interval);
        let key = subscription.key();
        if self.active.contains_key(&key) {
            trace!(%client, hw_interface, variable, "Subscription already exists");
            return false;
        }

        debug!(
            %client,
            hw_interface = %subscription.hw_interface,
            variable = %subscription.variable,
            ?interval,
            "Subscribed"
        );
        let task = FeedTask::start(&subscription, self.feed_tx.clone());
        self.active.insert(
            key,
            ActiveSubscription {
                subscription,
                _task: task,
            },
        );
        true
    }

    /// Remove the client's subscriptions matching the pattern
    ///
    /// `*` in a position matches any value there, anything else (including
    /// an empty string) must match exactly. Returns the number removed.
    pub fn unsubscribe(&mut self, client: ClientId, hw_interface: &str, variable: &str) -> usize {
        let matches = |key: &SubscriptionKey| {
            key.client == client
                && (hw_interface == WILDCARD || key.hw_interface == hw_interface)
                && (variable == WILDCARD || key.variable == variable)
        };
        let before = self.active.len();
        self.active.retain(|key, _| !matches(key));
        let removed = before - self.active.len();
        debug!(%client, hw_interface, variable, removed, "Unsubscribed");
        removed
    }

    /// Remove every subscription of the client; idempotent
    pub fn cancel_client(&mut self, client: ClientId) -> usize {
        let before = self.active.len();
        self.active.retain(|key, _| key.client != client);
        let removed = before - self.active.len();
        if removed > 0 {
            debug!(%client, removed, "Cancelled client subscriptions");
        }
        removed
    }

    /// Drop every subscription
    pub fn clear(&mut self) {
        self.active.clear();
    }

    /// The subscription a feed request was raised for
    pub fn get(&self, client: ClientId, hw_interface: &str, variable: &str) -> Option<&Subscription> {
        let key = SubscriptionKey {
            client,
            hw_interface: normalize(hw_interface),
            variable: normalize(variable),
        };
        self.active.get(&key).map(|active| &active.subscription)
    }

    /// Subscriptions of one client
    pub fn for_client(&self, client: ClientId) -> impl Iterator<Item = &Subscription> {
        self.active
            .values()
            .map(|active| &active.subscription)
            .filter(move |subscription| subscription.client == client)
    }

    /// Whether a narrower subscription of the same client sends `variable` instead
    pub fn more_specific_subscription_exists(
        &self,
        variable: &VariableKey,
        subscription: &Subscription,
    ) -> bool {
        self.for_client(subscription.client).any(|other| {
            subscription.includes(other)
                && other.specificity() > subscription.specificity()
                && other.covers(variable)
        })
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CLIENT: ClientId = ClientId(1);
    const OTHER: ClientId = ClientId(2);
    const SECOND: Duration = Duration::from_secs(1);

    fn sub(hw_interface: &str, variable: &str) -> Subscription {
        Subscription::new(CLIENT, hw_interface, variable, SECOND)
    }

    fn key(hw_interface: &str, name: &str) -> VariableKey {
        VariableKey::new(hw_interface, name)
    }

    // ========================================================================
    // Subscription matching
    // ========================================================================

    #[rstest]
    #[case(sub("", ""), sub("hwiA", "x"), true)]
    #[case(sub("hwiA", ""), sub("hwiA", "x"), true)]
    #[case(sub("hwiA", ""), sub("hwiA", ""), true)]
    #[case(sub("hwiA", "x"), sub("hwiA", "x"), true)]
    #[case(sub("hwiA", ""), sub("hwiB", "x"), false)]
    #[case(sub("hwiA", "x"), sub("hwiA", ""), false)]
    #[case(sub("hwiA", "x"), sub("hwiA", "y"), false)]
    #[case(sub("hwiA", "x"), sub("", ""), false)]
    fn test_includes(#[case] a: Subscription, #[case] b: Subscription, #[case] expected: bool) {
        assert_eq!(a.includes(&b), expected);
    }

    #[test]
    fn test_wildcard_normalized() {
        let all = Subscription::new(CLIENT, "*", "*", SECOND);
        assert_eq!(all.specificity(), 0);
        assert!(all.covers(&key("hwiZ", "anything")));
        assert_eq!(sub("hwiA", "*"), sub("hwiA", ""));
    }

    #[test]
    fn test_covers() {
        assert!(sub("hwiA", "").covers(&key("hwiA", "y")));
        assert!(!sub("hwiA", "").covers(&key("hwiB", "y")));
        assert!(sub("hwiA", "x").covers(&key("hwiA", "x")));
        assert!(!sub("hwiA", "x").covers(&key("hwiA", "y")));
    }

    // ========================================================================
    // Manager
    // ========================================================================

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let (mut manager, _rx) = SubscriptionManager::new();
        assert!(manager.subscribe(CLIENT, SECOND, "hwiA", "x"));
        assert!(!manager.subscribe(CLIENT, Duration::from_secs(5), "hwiA", "x"));
        assert!(manager.subscribe(OTHER, SECOND, "hwiA", "x"));
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.get(CLIENT, "hwiA", "x").unwrap().interval, SECOND);
    }

    #[tokio::test]
    async fn test_specificity_scenario() {
        let (mut manager, _rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, SECOND, "hwiA", "");
        manager.subscribe(CLIENT, SECOND, "hwiA", "x");

        let broad = manager.get(CLIENT, "hwiA", "").unwrap().clone();
        let narrow = manager.get(CLIENT, "hwiA", "x").unwrap().clone();

        // The broad subscription leaves x to the narrow one
        assert!(manager.more_specific_subscription_exists(&key("hwiA", "x"), &broad));
        assert!(!manager.more_specific_subscription_exists(&key("hwiA", "y"), &broad));
        assert!(!manager.more_specific_subscription_exists(&key("hwiA", "x"), &narrow));
    }

    #[tokio::test]
    async fn test_specificity_is_per_client() {
        let (mut manager, _rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, SECOND, "", "");
        manager.subscribe(OTHER, SECOND, "hwiA", "x");

        let everything = manager.get(CLIENT, "", "").unwrap().clone();
        assert!(!manager.more_specific_subscription_exists(&key("hwiA", "x"), &everything));
    }

    #[tokio::test]
    async fn test_unsubscribe_patterns() {
        let (mut manager, _rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, SECOND, "hwiA", "");
        manager.subscribe(CLIENT, SECOND, "hwiA", "x");
        manager.subscribe(CLIENT, SECOND, "hwiB", "x");
        manager.subscribe(OTHER, SECOND, "hwiA", "x");

        assert_eq!(manager.unsubscribe(CLIENT, "hwiA", "x"), 1);
        assert_eq!(manager.unsubscribe(CLIENT, "*", "x"), 1);
        assert_eq!(manager.unsubscribe(CLIENT, "hwiA", "y"), 0);
        assert_eq!(manager.for_client(CLIENT).count(), 1);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let (mut manager, _rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, SECOND, "", "");
        manager.subscribe(CLIENT, SECOND, "hwiA", "");
        manager.subscribe(CLIENT, SECOND, "hwiA", "x");
        manager.subscribe(OTHER, SECOND, "hwiA", "");

        assert_eq!(manager.unsubscribe(CLIENT, WILDCARD, WILDCARD), 3);
        assert_eq!(manager.for_client(CLIENT).count(), 0);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_client_is_idempotent() {
        let (mut manager, _rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, SECOND, "hwiA", "");
        manager.subscribe(CLIENT, SECOND, "hwiB", "");

        assert_eq!(manager.cancel_client(CLIENT), 2);
        assert_eq!(manager.cancel_client(CLIENT), 0);
        assert!(manager.is_empty());
    }

    // ========================================================================
    // Feed timers
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_feed_requests_follow_interval() {
        let (mut manager, mut rx) = SubscriptionManager::new();
        let started = Instant::now();
        manager.subscribe(CLIENT, Duration::from_millis(250), "hwiA", "*");

        for expected in 1..=2u64 {
            let request = rx.recv().await.unwrap();
            assert_eq!(
                request,
                FeedRequest {
                    client: CLIENT,
                    hw_interface: "hwiA".into(),
                    variable: String::new(),
                }
            );
            assert!(started.elapsed() >= Duration::from_millis(250 * expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_timer() {
        let (mut manager, mut rx) = SubscriptionManager::new();
        manager.subscribe(CLIENT, Duration::from_millis(50), "hwiA", "");
        manager.unsubscribe(CLIENT, "hwiA", "");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
