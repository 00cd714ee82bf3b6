//! Privacy-preserving aggregate metrics.
//!
//! Per-country, per-type, and per-NAT-class unique proxy IP sets plus a
//! handful of monotonic event counters. Event counters are rounded up to
//! the next multiple of 8 on emission so a single event cannot be
//! attributed; IP-set cardinalities are emitted raw. Every measurement
//! interval the snapshot is appended to a log file and the accumulator
//! starts over.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use drift_proto::messages::{NatClass, ProxyType};

use crate::geoip::Geolocator;

const DEFAULT_MEASUREMENT_INTERVAL: Duration = Duration::from_secs(86_400);

/// Round an event count up to the next multiple of 8.
fn bin(count: u64) -> u64 {
    count.div_ceil(8) * 8
}

#[derive(Default)]
struct MetricsState {
    country_ips: HashMap<String, HashSet<IpAddr>>,
    all_ips: HashSet<IpAddr>,
    typed_ips: HashMap<ProxyType, HashSet<IpAddr>>,
    nat_ips: HashMap<NatClass, HashSet<IpAddr>>,

    idle_count: u64,
    denied_count: u64,
    restricted_denied_count: u64,
    unrestricted_denied_count: u64,
    match_count: u64,

    rtt_total: Duration,
    rtt_samples: u64,
}

pub struct Metrics {
    geo: Arc<dyn Geolocator>,
    interval: Duration,
    state: Mutex<MetricsState>,
}

impl Metrics {
    pub fn new(geo: Arc<dyn Geolocator>) -> Self {
        Self::with_interval(geo, DEFAULT_MEASUREMENT_INTERVAL)
    }

    pub fn with_interval(geo: Arc<dyn Geolocator>, interval: Duration) -> Self {
        Self {
            geo,
            interval,
            state: Mutex::new(MetricsState::default()),
        }
    }

    /// Record one proxy poll: the IP joins the country, type, and NAT
    /// sets.
    pub fn record_proxy_poll(&self, ip: IpAddr, proxy_type: ProxyType, nat: NatClass) {
        let country = self.geo.country(ip);
        let mut state = self.state.lock().unwrap();
        state.all_ips.insert(ip);
        state.typed_ips.entry(proxy_type).or_default().insert(ip);
        state.nat_ips.entry(nat).or_default().insert(ip);
        if let Some(country) = country {
            state.country_ips.entry(country).or_default().insert(ip);
        }
    }

    /// A proxy polled and timed out without serving a client.
    pub fn record_idle_poll(&self) {
        self.state.lock().unwrap().idle_count += 1;
    }

    /// A client was turned away with no proxy available.
    pub fn record_denied(&self, client_nat: NatClass) {
        let mut state = self.state.lock().unwrap();
        state.denied_count += 1;
        match client_nat {
            NatClass::Unrestricted => state.unrestricted_denied_count += 1,
            NatClass::Restricted | NatClass::Unknown => state.restricted_denied_count += 1,
        }
    }

    /// A client offer reached a proxy.
    pub fn record_match(&self) {
        self.state.lock().unwrap().match_count += 1;
    }

    /// Offer-to-answer round trip observed by a client.
    pub fn record_rtt(&self, rtt: Duration) {
        let mut state = self.state.lock().unwrap();
        state.rtt_total += rtt;
        state.rtt_samples += 1;
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        (state.rtt_samples > 0).then(|| state.rtt_total / state.rtt_samples as u32)
    }

    /// Render the current accumulator in the stats-line format.
    pub fn render(&self) -> String {
        let state = self.state.lock().unwrap();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "snowflake-stats-end {now} ({} s)",
            self.interval.as_secs()
        );

        // Countries ordered by descending unique-IP count, ties by name.
        let mut countries: Vec<(&String, usize)> = state
            .country_ips
            .iter()
            .map(|(cc, ips)| (cc, ips.len()))
            .collect();
        countries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let listing = countries
            .iter()
            .map(|(cc, n)| format!("{cc}={n}"))
            .collect::<Vec<_>>()
            .join(",");
        let _ = writeln!(out, "snowflake-ips {listing}");
        let _ = writeln!(out, "snowflake-ips-total {}", state.all_ips.len());

        for proxy_type in [ProxyType::Standalone, ProxyType::Badge, ProxyType::Webext] {
            let n = state.typed_ips.get(&proxy_type).map_or(0, HashSet::len);
            let _ = writeln!(out, "snowflake-ips-{} {n}", proxy_type.as_str());
        }

        let _ = writeln!(out, "snowflake-idle-count {}", bin(state.idle_count));
        let _ = writeln!(out, "client-denied-count {}", bin(state.denied_count));
        let _ = writeln!(
            out,
            "client-restricted-denied-count {}",
            bin(state.restricted_denied_count)
        );
        let _ = writeln!(
            out,
            "client-unrestricted-denied-count {}",
            bin(state.unrestricted_denied_count)
        );
        let _ = writeln!(
            out,
            "client-snowflake-match-count {}",
            bin(state.match_count)
        );

        for nat in [NatClass::Restricted, NatClass::Unrestricted, NatClass::Unknown] {
            let n = state.nat_ips.get(&nat).map_or(0, HashSet::len);
            let _ = writeln!(out, "snowflake-ips-nat-{} {n}", nat.as_str());
        }

        out
    }

    /// Render the snapshot and reset the accumulator for the next
    /// measurement interval.
    pub fn rollover(&self) -> String {
        let snapshot = self.render();
        *self.state.lock().unwrap() = MetricsState::default();
        snapshot
    }

    /// Run the periodic rollover, appending each snapshot to `log_path`.
    /// IO failures are logged and never fatal.
    pub fn spawn_rollover(self: Arc<Self>, log_path: PathBuf) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let snapshot = self.rollover();
                info!("metrics rollover, writing snapshot to {}", log_path.display());
                let result = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&log_path)
                    .and_then(|mut f| f.write_all(snapshot.as_bytes()));
                if let Err(e) = result {
                    warn!("failed to append metrics snapshot: {e}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::NullGeolocator;

    struct FixedGeo;
    impl Geolocator for FixedGeo {
        fn country(&self, ip: IpAddr) -> Option<String> {
            match ip {
                IpAddr::V4(v4) if v4.octets()[0] == 10 => Some("AA".into()),
                IpAddr::V4(_) => Some("BB".into()),
                IpAddr::V6(_) => None,
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn binning_rounds_up_to_eight() {
        assert_eq!(bin(0), 0);
        assert_eq!(bin(1), 8);
        assert_eq!(bin(8), 8);
        assert_eq!(bin(9), 16);
    }

    #[test]
    fn counters_are_binned_but_ip_counts_are_raw() {
        let metrics = Metrics::new(Arc::new(FixedGeo));
        metrics.record_proxy_poll(ip("10.0.0.1"), ProxyType::Standalone, NatClass::Unrestricted);
        metrics.record_proxy_poll(ip("10.0.0.2"), ProxyType::Standalone, NatClass::Restricted);
        metrics.record_proxy_poll(ip("192.0.2.7"), ProxyType::Badge, NatClass::Unknown);
        // Same IP twice: sets dedupe.
        metrics.record_proxy_poll(ip("10.0.0.1"), ProxyType::Standalone, NatClass::Unrestricted);

        metrics.record_denied(NatClass::Restricted);
        metrics.record_match();

        let text = metrics.render();
        assert!(text.contains("snowflake-ips AA=2,BB=1\n"), "{text}");
        assert!(text.contains("snowflake-ips-total 3\n"), "{text}");
        assert!(text.contains("snowflake-ips-standalone 2\n"), "{text}");
        assert!(text.contains("snowflake-ips-badge 1\n"), "{text}");
        assert!(text.contains("snowflake-ips-webext 0\n"), "{text}");
        assert!(text.contains("client-denied-count 8\n"), "{text}");
        assert!(text.contains("client-restricted-denied-count 8\n"), "{text}");
        assert!(text.contains("client-unrestricted-denied-count 0\n"), "{text}");
        assert!(text.contains("client-snowflake-match-count 8\n"), "{text}");
        assert!(text.contains("snowflake-ips-nat-restricted 1\n"), "{text}");
        assert!(text.contains("snowflake-ips-nat-unrestricted 1\n"), "{text}");
        assert!(text.contains("snowflake-ips-nat-unknown 1\n"), "{text}");
    }

    #[test]
    fn unknown_client_nat_counts_as_restricted_denial() {
        let metrics = Metrics::new(Arc::new(NullGeolocator));
        metrics.record_denied(NatClass::Unknown);
        let text = metrics.render();
        assert!(text.contains("client-restricted-denied-count 8\n"), "{text}");
        assert!(text.contains("client-unrestricted-denied-count 0\n"), "{text}");
    }

    #[test]
    fn rollover_resets_the_accumulator() {
        let metrics = Metrics::new(Arc::new(NullGeolocator));
        metrics.record_idle_poll();
        metrics.record_proxy_poll(ip("192.0.2.1"), ProxyType::Webext, NatClass::Unknown);

        let snapshot = metrics.rollover();
        assert!(snapshot.contains("snowflake-idle-count 8\n"));
        assert!(snapshot.contains("snowflake-ips-total 1\n"));

        let fresh = metrics.render();
        assert!(fresh.contains("snowflake-idle-count 0\n"));
        assert!(fresh.contains("snowflake-ips-total 0\n"));
    }

    #[test]
    fn unlocatable_ips_still_count_toward_totals() {
        let metrics = Metrics::new(Arc::new(FixedGeo));
        metrics.record_proxy_poll(ip("2001:db8::1"), ProxyType::Mobile, NatClass::Unknown);
        let text = metrics.render();
        assert!(text.contains("snowflake-ips \n"), "{text}");
        assert!(text.contains("snowflake-ips-total 1\n"), "{text}");
    }

    #[test]
    fn average_rtt_tracks_samples() {
        let metrics = Metrics::new(Arc::new(NullGeolocator));
        assert!(metrics.average_rtt().is_none());
        metrics.record_rtt(Duration::from_millis(100));
        metrics.record_rtt(Duration::from_millis(300));
        assert_eq!(metrics.average_rtt(), Some(Duration::from_millis(200)));
    }
}
