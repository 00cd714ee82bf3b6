//! The matching core: pairs a polling proxy with a waiting client offer
//! within bounded time.
//!
//! Proxies queue in arrival order (first to poll is first served); clients
//! take the oldest compatible proxy and wait for its answer on a dedicated
//! one-shot channel. One mutex guards the queue and the answer-routing
//! map; nobody ever waits while holding it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use drift_proto::messages::{NatClass, ProxyType};

const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// How long a polling proxy waits for a client offer.
    pub proxy_timeout: Duration,
    /// How long a client waits for the matched proxy's answer.
    pub client_timeout: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

/// A proxy parked in `proxy_poll`, waiting for an offer.
struct PollingProxy {
    arrival: u64,
    sid: String,
    nat: NatClass,
    proxy_type: ProxyType,
    offer_tx: oneshot::Sender<(String, NatClass)>,
}

// Min-heap on arrival: the longest-waiting proxy is served first.
impl PartialEq for PollingProxy {
    fn eq(&self, other: &Self) -> bool {
        self.arrival == other.arrival
    }
}
impl Eq for PollingProxy {}
impl PartialOrd for PollingProxy {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PollingProxy {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the smallest arrival first.
        other.arrival.cmp(&self.arrival)
    }
}

struct MatcherState {
    next_arrival: u64,
    proxies: BinaryHeap<PollingProxy>,
    answer_routes: HashMap<String, oneshot::Sender<String>>,
}

pub enum PollOutcome {
    /// A client offer arrived; the proxy answers via `proxy_answer`.
    Matched {
        offer: String,
        client_nat: NatClass,
    },
    /// No client within the deadline.
    NoMatch,
}

pub enum OfferOutcome {
    Answered { answer: String, rtt: Duration },
    /// No compatible proxy was available; the client is turned away
    /// immediately.
    Denied,
    /// A proxy took the offer but never answered in time.
    AnswerTimeout,
}

pub enum AnswerOutcome {
    Delivered,
    /// The waiting client gave up before the answer arrived.
    ClientGone,
    /// The sid never matched, or its client entry was already reaped.
    UnknownSid,
}

/// Restricted and unknown clients need an unrestricted proxy; unrestricted
/// clients take anything.
fn nat_compatible(client: NatClass, proxy: NatClass) -> bool {
    client == NatClass::Unrestricted || proxy == NatClass::Unrestricted
}

pub struct Matcher {
    config: MatcherConfig,
    state: Mutex<MatcherState>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::with_config(MatcherConfig::default())
    }

    pub fn with_config(config: MatcherConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MatcherState {
                next_arrival: 0,
                proxies: BinaryHeap::new(),
                answer_routes: HashMap::new(),
            }),
        }
    }

    /// Park a polling proxy until a client offer arrives or the proxy
    /// deadline passes.
    pub async fn proxy_poll(&self, sid: &str, proxy_type: ProxyType, nat: NatClass) -> PollOutcome {
        let (offer_tx, offer_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            let arrival = state.next_arrival;
            state.next_arrival += 1;
            state.proxies.push(PollingProxy {
                arrival,
                sid: sid.to_string(),
                nat,
                proxy_type,
                offer_tx,
            });
        }

        match timeout(self.config.proxy_timeout, offer_rx).await {
            Ok(Ok((offer, client_nat))) => PollOutcome::Matched { offer, client_nat },
            // Timed out (or the matcher was torn down). Dropping offer_rx
            // marks the queue entry as served; sweep it out now.
            _ => {
                debug!(sid, "proxy poll expired without a client");
                self.state
                    .lock()
                    .unwrap()
                    .proxies
                    .retain(|p| !p.offer_tx.is_closed());
                PollOutcome::NoMatch
            }
        }
    }

    /// Hand `offer` to the oldest compatible proxy and wait for its
    /// answer.
    pub async fn client_offer(&self, offer: String, client_nat: NatClass) -> OfferOutcome {
        let start = Instant::now();
        let (mut answer_tx, answer_rx) = oneshot::channel();

        // Deliver to the first live compatible proxy. A proxy that times
        // out between our pop and our send just means another scan.
        let matched_sid = loop {
            let candidate = {
                let mut state = self.state.lock().unwrap();
                let mut incompatible = Vec::new();
                let mut found = None;
                while let Some(proxy) = state.proxies.pop() {
                    if proxy.offer_tx.is_closed() {
                        continue; // abandoned poll, reaped lazily
                    }
                    if nat_compatible(client_nat, proxy.nat) {
                        found = Some(proxy);
                        break;
                    }
                    incompatible.push(proxy);
                }
                // Incompatible proxies keep their place in line.
                for proxy in incompatible {
                    state.proxies.push(proxy);
                }
                if let Some(proxy) = &found {
                    state.answer_routes.insert(proxy.sid.clone(), answer_tx);
                }
                found
            };

            let Some(proxy) = candidate else {
                return OfferOutcome::Denied;
            };
            match proxy.offer_tx.send((offer.clone(), client_nat)) {
                Ok(()) => break proxy.sid,
                Err(_) => {
                    // Lost the race with the proxy's timeout; reclaim the
                    // routing entry and try the next one.
                    match self.state.lock().unwrap().answer_routes.remove(&proxy.sid) {
                        Some(tx) => answer_tx = tx,
                        // A stray answer POST already consumed the route;
                        // whatever it sent is waiting on our channel.
                        None => break proxy.sid,
                    }
                }
            }
        };

        match timeout(self.config.client_timeout, answer_rx).await {
            Ok(Ok(answer)) => OfferOutcome::Answered {
                answer,
                rtt: start.elapsed(),
            },
            _ => {
                debug!(sid = %matched_sid, "client gave up waiting for answer");
                self.state
                    .lock()
                    .unwrap()
                    .answer_routes
                    .remove(&matched_sid);
                OfferOutcome::AnswerTimeout
            }
        }
    }

    /// Route a proxy's answer back to the client waiting on `sid`.
    pub fn proxy_answer(&self, sid: &str, answer: String) -> AnswerOutcome {
        let route = self.state.lock().unwrap().answer_routes.remove(sid);
        match route {
            None => AnswerOutcome::UnknownSid,
            Some(tx) => match tx.send(answer) {
                Ok(()) => AnswerOutcome::Delivered,
                Err(_) => AnswerOutcome::ClientGone,
            },
        }
    }

    /// Live (still-waiting) proxies, for the debug endpoint. Sweeps
    /// abandoned entries as a side effect.
    pub fn available_proxies(&self) -> Vec<(String, ProxyType)> {
        let mut state = self.state.lock().unwrap();
        state.proxies.retain(|p| !p.offer_tx.is_closed());
        let mut proxies: Vec<_> = state
            .proxies
            .iter()
            .map(|p| (p.sid.clone(), p.proxy_type))
            .collect();
        proxies.sort_by(|a, b| a.0.cmp(&b.0));
        proxies
    }

    /// Drain every waiter; parked proxies observe "no match" and waiting
    /// clients observe a gone counterpart.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.proxies.clear();
        state.answer_routes.clear();
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast() -> Matcher {
        Matcher::with_config(MatcherConfig {
            proxy_timeout: Duration::from_millis(100),
            client_timeout: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn offer_and_answer_round_trip() {
        let matcher = Arc::new(fast());

        let m = matcher.clone();
        let proxy = tokio::spawn(async move {
            m.proxy_poll("prox-1", ProxyType::Standalone, NatClass::Unrestricted)
                .await
        });

        // Give the proxy a moment to enqueue.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let m = matcher.clone();
        let client =
            tokio::spawn(async move { m.client_offer("the-offer".into(), NatClass::Unknown).await });

        match proxy.await.unwrap() {
            PollOutcome::Matched { offer, client_nat } => {
                assert_eq!(offer, "the-offer");
                assert_eq!(client_nat, NatClass::Unknown);
            }
            PollOutcome::NoMatch => panic!("proxy should have matched"),
        }

        match matcher.proxy_answer("prox-1", "the-answer".into()) {
            AnswerOutcome::Delivered => {}
            _ => panic!("answer should reach the waiting client"),
        }

        match client.await.unwrap() {
            OfferOutcome::Answered { answer, .. } => assert_eq!(answer, "the-answer"),
            _ => panic!("client should have received the answer"),
        }
    }

    #[tokio::test]
    async fn client_denied_when_no_proxies() {
        let matcher = fast();
        match matcher.client_offer("offer".into(), NatClass::Restricted).await {
            OfferOutcome::Denied => {}
            _ => panic!("expected immediate denial"),
        }
    }

    #[tokio::test]
    async fn proxy_poll_times_out_and_is_reaped() {
        let matcher = fast();
        match matcher
            .proxy_poll("prox-1", ProxyType::Badge, NatClass::Unrestricted)
            .await
        {
            PollOutcome::NoMatch => {}
            _ => panic!("expected timeout"),
        }
        assert!(matcher.available_proxies().is_empty());

        // A client arriving just after the timeout finds nothing.
        match matcher.client_offer("offer".into(), NatClass::Unrestricted).await {
            OfferOutcome::Denied => {}
            _ => panic!("late client should be denied"),
        }
    }

    #[tokio::test]
    async fn client_times_out_when_proxy_never_answers() {
        let matcher = Arc::new(fast());

        let m = matcher.clone();
        let proxy = tokio::spawn(async move {
            m.proxy_poll("slow-proxy", ProxyType::Webext, NatClass::Unrestricted)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        match matcher.client_offer("offer".into(), NatClass::Unknown).await {
            OfferOutcome::AnswerTimeout => {}
            _ => panic!("expected answer timeout"),
        }
        proxy.await.unwrap();

        // The routing entry is gone, so a very late answer sees that.
        match matcher.proxy_answer("slow-proxy", "late".into()) {
            AnswerOutcome::UnknownSid => {}
            _ => panic!("route should have been removed"),
        }
    }

    #[tokio::test]
    async fn restricted_client_skips_restricted_proxies() {
        let matcher = Arc::new(Matcher::with_config(MatcherConfig {
            proxy_timeout: Duration::from_secs(2),
            client_timeout: Duration::from_secs(2),
        }));

        let m = matcher.clone();
        let restricted_proxy = tokio::spawn(async move {
            m.proxy_poll("restricted", ProxyType::Standalone, NatClass::Restricted)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let m = matcher.clone();
        let open_proxy = tokio::spawn(async move {
            m.proxy_poll("open", ProxyType::Standalone, NatClass::Unrestricted)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Despite arriving second, the unrestricted proxy gets the job.
        let m = matcher.clone();
        let client =
            tokio::spawn(async move { m.client_offer("offer".into(), NatClass::Restricted).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        match open_proxy.await.unwrap() {
            PollOutcome::Matched { .. } => {}
            PollOutcome::NoMatch => panic!("unrestricted proxy should match"),
        }

        matcher.proxy_answer("open", "answer".into());
        client.await.unwrap();

        // The restricted proxy is still waiting its turn.
        let waiting = matcher.available_proxies();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].0, "restricted");
        drop(restricted_proxy);
    }

    #[tokio::test]
    async fn restricted_only_pool_denies_restricted_client() {
        let matcher = Arc::new(fast());
        let m = matcher.clone();
        let proxy = tokio::spawn(async move {
            m.proxy_poll("restricted", ProxyType::Mobile, NatClass::Restricted)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        match matcher.client_offer("offer".into(), NatClass::Unknown).await {
            OfferOutcome::Denied => {}
            _ => panic!("restricted pool cannot serve a restricted client"),
        }
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn proxies_serve_in_arrival_order() {
        let matcher = Arc::new(Matcher::with_config(MatcherConfig {
            proxy_timeout: Duration::from_secs(2),
            client_timeout: Duration::from_secs(2),
        }));

        let mut polls = Vec::new();
        for i in 0..3 {
            let m = matcher.clone();
            polls.push(tokio::spawn(async move {
                m.proxy_poll(&format!("prox-{i}"), ProxyType::Standalone, NatClass::Unrestricted)
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for i in 0..3 {
            let m = matcher.clone();
            tokio::spawn(async move { m.client_offer(format!("offer-{i}"), NatClass::Unrestricted).await });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Oldest proxy gets the first client's offer, and so on down.
        for (i, poll) in polls.into_iter().enumerate() {
            match poll.await.unwrap() {
                PollOutcome::Matched { offer, .. } => assert_eq!(offer, format!("offer-{i}")),
                PollOutcome::NoMatch => panic!("proxy {i} should have matched"),
            }
        }
    }

    #[tokio::test]
    async fn shutdown_drains_waiters() {
        let matcher = Arc::new(Matcher::with_config(MatcherConfig {
            proxy_timeout: Duration::from_secs(5),
            client_timeout: Duration::from_secs(5),
        }));
        let m = matcher.clone();
        let proxy = tokio::spawn(async move {
            m.proxy_poll("prox", ProxyType::Standalone, NatClass::Unrestricted)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        matcher.shutdown();
        match tokio::time::timeout(Duration::from_secs(1), proxy).await {
            Ok(Ok(PollOutcome::NoMatch)) => {}
            _ => panic!("drained proxy should observe no match promptly"),
        }
    }
}
