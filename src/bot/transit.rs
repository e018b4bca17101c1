//! Transit data lookups with read-through caching.
//!
//! [`TransitApi`] is the raw upstream (LTA DataMall in production, see
//! `datamall.rs`). [`TransitData`] sits on top of it and answers the three
//! questions the bot asks: which stops a service calls at, which stop a user
//! meant, and when the next buses arrive. Route listings and the stop
//! directory are cached in bounded [`moka`] caches; arrivals are always live.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

static SERVICE_NO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{1,5}$").unwrap());

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitError {
    /// The call succeeded but nothing matched.
    #[error("not found")]
    NotFound,
    #[error("transit data unavailable: {0}")]
    UpstreamUnavailable(String),
}

/// One row of a service's route as returned upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEntry {
    pub service_no: String,
    pub direction: u8,
    pub sequence: u32,
    pub stop_code: String,
}

/// Directory entry for a physical stop.
#[derive(Debug, Clone, PartialEq)]
pub struct StopInfo {
    pub code: String,
    pub description: String,
    pub road_name: String,
}

/// A stop on a particular service's route.
#[derive(Debug, Clone, PartialEq)]
pub struct BusStop {
    pub code: String,
    pub description: String,
    pub road_name: String,
    pub direction: u8,
    pub sequence: u32,
}

impl BusStop {
    pub fn display_name(&self) -> String {
        if !self.description.is_empty() {
            self.description.clone()
        } else if !self.road_name.is_empty() {
            self.road_name.clone()
        } else {
            format!("Stop {}", self.code)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrowdLevel {
    SeatsAvailable,
    StandingAvailable,
    LimitedStanding,
}

impl CrowdLevel {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SEA" => Some(Self::SeatsAvailable),
            "SDA" => Some(Self::StandingAvailable),
            "LSD" => Some(Self::LimitedStanding),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::SeatsAvailable => "Seats available",
            Self::StandingAvailable => "Standing available",
            Self::LimitedStanding => "Limited standing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    SingleDeck,
    DoubleDeck,
    Bendy,
}

impl BusType {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SD" => Some(Self::SingleDeck),
            "DD" => Some(Self::DoubleDeck),
            "BD" => Some(Self::Bendy),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::SingleDeck => "single deck",
            Self::DoubleDeck => "double deck",
            Self::Bendy => "bendy",
        }
    }
}

/// Estimated arrival of one bus of a service at a stop.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalPrediction {
    pub eta: DateTime<Utc>,
    pub crowd: Option<CrowdLevel>,
    pub wheelchair_accessible: bool,
    pub bus_type: Option<BusType>,
}

impl ArrivalPrediction {
    /// Whole minutes until arrival, never negative.
    pub fn minutes_from(&self, now: DateTime<Utc>) -> i64 {
        (self.eta - now).num_minutes().max(0)
    }
}

/// Raw upstream transit API.
#[async_trait]
pub trait TransitApi: Send + Sync {
    /// Every route row for a service. Empty if the service does not exist.
    async fn bus_routes(&self, service_no: &str) -> Result<Vec<RouteEntry>, TransitError>;

    /// The full stop directory.
    async fn bus_stops(&self) -> Result<Vec<StopInfo>, TransitError>;

    /// Upcoming arrivals of a service at a stop. Empty if none are known.
    async fn bus_arrivals(
        &self,
        stop_code: &str,
        service_no: &str,
    ) -> Result<Vec<ArrivalPrediction>, TransitError>;
}

/// Result of resolving a user's stop reply against a route.
#[derive(Debug, Clone, PartialEq)]
pub enum StopMatch {
    Found(BusStop),
    /// Several route stops matched the name; the user must be more specific.
    Ambiguous(Vec<BusStop>),
}

/// Bounds for the route and stop caches.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub max_routes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_routes: 500,
        }
    }
}

type StopDirectory = HashMap<String, StopInfo>;

/// Cached view over a [`TransitApi`].
pub struct TransitData {
    api: Arc<dyn TransitApi>,
    /// service_no -> ordered, de-duplicated route stops. Unknown services
    /// are cached as empty routes.
    routes: Cache<String, Arc<Vec<BusStop>>>,
    /// Single entry holding the stop directory keyed by stop code.
    directory: Cache<(), Arc<StopDirectory>>,
}

impl TransitData {
    pub fn new(api: Arc<dyn TransitApi>, settings: CacheSettings) -> Self {
        let routes = Cache::builder()
            .max_capacity(settings.max_routes)
            .time_to_live(settings.ttl)
            .build();
        let directory = Cache::builder()
            .max_capacity(1)
            .time_to_live(settings.ttl)
            .build();
        Self { api, routes, directory }
    }

    /// Load the stop directory ahead of the first lookup.
    pub async fn warm_up(&self) -> Result<usize, TransitError> {
        Ok(self.directory().await?.len())
    }

    async fn directory(&self) -> Result<Arc<StopDirectory>, TransitError> {
        self.directory
            .try_get_with((), async {
                let stops = self.api.bus_stops().await?;
                info!("Loaded {} bus stops into directory", stops.len());
                let directory: StopDirectory =
                    stops.into_iter().map(|s| (s.code.clone(), s)).collect();
                Ok::<_, TransitError>(Arc::new(directory))
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Stops served by a service, ordered by direction then sequence.
    pub async fn list_route_stops(&self, service_no: &str) -> Result<Arc<Vec<BusStop>>, TransitError> {
        let key = service_no.trim().to_uppercase();
        let route = self
            .routes
            .try_get_with(key.clone(), self.load_route(&key))
            .await
            .map_err(|e| (*e).clone())?;

        if route.is_empty() {
            Err(TransitError::NotFound)
        } else {
            Ok(route)
        }
    }

    async fn load_route(&self, service_no: &str) -> Result<Arc<Vec<BusStop>>, TransitError> {
        let mut entries = self.api.bus_routes(service_no).await?;
        if entries.is_empty() {
            info!("Bus {} has no route rows", service_no);
            return Ok(Arc::new(Vec::new()));
        }

        let directory = self.directory().await?;
        entries.sort_by_key(|e| (e.direction, e.sequence));

        let mut seen = HashSet::new();
        let stops: Vec<BusStop> = entries
            .into_iter()
            .filter(|e| seen.insert(e.stop_code.clone()))
            .map(|e| {
                let info = directory.get(&e.stop_code);
                BusStop {
                    description: info.map(|i| i.description.clone()).unwrap_or_default(),
                    road_name: info.map(|i| i.road_name.clone()).unwrap_or_default(),
                    code: e.stop_code,
                    direction: e.direction,
                    sequence: e.sequence,
                }
            })
            .collect();

        info!("Loaded route for bus {} ({} stops)", service_no, stops.len());
        Ok(Arc::new(stops))
    }

    /// Resolve a stop code or name against a service's route.
    pub async fn find_stop(&self, service_no: &str, query: &str) -> Result<StopMatch, TransitError> {
        let route = self.list_route_stops(service_no).await?;
        let query = query.trim();
        if query.is_empty() {
            return Err(TransitError::NotFound);
        }

        if is_stop_code(query) {
            return route
                .iter()
                .find(|s| s.code == query)
                .cloned()
                .map(StopMatch::Found)
                .ok_or(TransitError::NotFound);
        }

        let needle = query.to_lowercase();
        let matches: Vec<&BusStop> = route
            .iter()
            .filter(|s| {
                s.description.to_lowercase().contains(&needle)
                    || s.road_name.to_lowercase().contains(&needle)
            })
            .collect();
        debug!("Stop query {:?} on bus {}: {} match(es)", query, service_no, matches.len());

        match matches.as_slice() {
            [] => Err(TransitError::NotFound),
            [only] => Ok(StopMatch::Found((*only).clone())),
            _ => {
                let exact: Vec<&&BusStop> = matches
                    .iter()
                    .filter(|s| s.description.to_lowercase() == needle)
                    .collect();
                match exact.as_slice() {
                    [only] => Ok(StopMatch::Found((**only).clone())),
                    _ => Ok(StopMatch::Ambiguous(matches.into_iter().cloned().collect())),
                }
            }
        }
    }

    /// Live arrivals of a service at a stop, soonest first.
    pub async fn get_arrivals(
        &self,
        service_no: &str,
        stop_code: &str,
    ) -> Result<Vec<ArrivalPrediction>, TransitError> {
        let service_no = service_no.trim().to_uppercase();
        let mut arrivals = self.api.bus_arrivals(stop_code, &service_no).await?;
        if arrivals.is_empty() {
            return Err(TransitError::NotFound);
        }
        arrivals.sort_by_key(|a| a.eta);
        Ok(arrivals)
    }
}

/// Normalize a reply into a service number ("61m" -> "61M").
pub fn parse_service_no(input: &str) -> Result<String, String> {
    let normalized = input.trim().to_uppercase();
    if SERVICE_NO.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(format!("'{}' doesn't look like a bus number", input.trim()))
    }
}

/// Stop codes are exactly five digits.
pub fn is_stop_code(input: &str) -> bool {
    input.len() == 5 && input.bytes().all(|b| b.is_ascii_digit())
}
