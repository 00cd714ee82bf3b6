//! IP-to-country lookup for the metrics aggregator.
//!
//! The broker only needs a country code per proxy IP, so the seam is a
//! one-method trait; metrics never knows where the answer comes from. The
//! file-backed implementation reads the tor-maintained range databases:
//!
//! IPv4 lines: `INTIPLOW,INTIPHIGH,CC` (addresses as unsigned integers),
//! or the quoted five-field variant `"INTIPLOW","INTIPHIGH","CC",...`.
//! IPv6 lines: `IPV6LOW,IPV6HIGH,CC` with textual addresses.
//! Blank lines and `#` comments are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum GeoipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed entry at {path}:{line}: {text:?}")]
    Malformed {
        path: String,
        line: usize,
        text: String,
    },
}

/// Resolve an IP address to an ISO country code.
pub trait Geolocator: Send + Sync {
    fn country(&self, ip: IpAddr) -> Option<String>;
}

/// Geolocator for deployments without databases: everything is nowhere.
pub struct NullGeolocator;

impl Geolocator for NullGeolocator {
    fn country(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

#[derive(Debug)]
struct Range<A> {
    low: A,
    high: A,
    country: String,
}

/// Range tables loaded from the tor geoip file format.
#[derive(Debug)]
pub struct GeoIpTable {
    v4: Vec<Range<u32>>,
    v6: Vec<Range<u128>>,
}

impl GeoIpTable {
    /// Load both databases. Either path may be absent from the
    /// configuration; the corresponding family then never resolves.
    pub fn load(v4_path: Option<&Path>, v6_path: Option<&Path>) -> Result<Self, GeoipError> {
        let mut v4 = Vec::new();
        if let Some(path) = v4_path {
            v4 = load_ranges(path, parse_v4_entry)?;
            info!("loaded {} IPv4 geoip ranges from {}", v4.len(), path.display());
        }
        let mut v6 = Vec::new();
        if let Some(path) = v6_path {
            v6 = load_ranges(path, parse_v6_entry)?;
            info!("loaded {} IPv6 geoip ranges from {}", v6.len(), path.display());
        }
        v4.sort_by_key(|r| r.low);
        v6.sort_by_key(|r| r.low);
        Ok(Self { v4, v6 })
    }
}

impl Geolocator for GeoIpTable {
    fn country(&self, ip: IpAddr) -> Option<String> {
        match ip {
            IpAddr::V4(v4) => lookup(&self.v4, u32::from(v4)),
            IpAddr::V6(v6) => lookup(&self.v6, u128::from(v6)),
        }
    }
}

fn lookup<A: Ord + Copy>(table: &[Range<A>], addr: A) -> Option<String> {
    let idx = table.partition_point(|r| r.low <= addr);
    if idx == 0 {
        return None;
    }
    let range = &table[idx - 1];
    (addr <= range.high).then(|| range.country.clone())
}

fn load_ranges<A>(
    path: &Path,
    parse: fn(&str) -> Option<Range<A>>,
) -> Result<Vec<Range<A>>, GeoipError> {
    let reader = BufReader::new(File::open(path)?);
    let mut ranges = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse(trimmed) {
            Some(range) => ranges.push(range),
            None => {
                return Err(GeoipError::Malformed {
                    path: path.display().to_string(),
                    line: idx + 1,
                    text: trimmed.to_string(),
                })
            }
        }
    }
    Ok(ranges)
}

fn parse_v4_entry(line: &str) -> Option<Range<u32>> {
    let fields: Vec<&str> = line
        .split(',')
        .map(|f| f.trim_matches('"'))
        .collect();
    if fields.len() < 3 {
        return None;
    }
    Some(Range {
        low: fields[0].parse().ok()?,
        high: fields[1].parse().ok()?,
        country: fields[2].to_string(),
    })
}

fn parse_v6_entry(line: &str) -> Option<Range<u128>> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 3 {
        return None;
    }
    let low: Ipv6Addr = fields[0].trim().parse().ok()?;
    let high: Ipv6Addr = fields[1].trim().parse().ok()?;
    Some(Range {
        low: u128::from(low),
        high: u128::from(high),
        country: fields[2].trim().to_string(),
    })
}
