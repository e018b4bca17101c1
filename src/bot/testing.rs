//! In-process fakes for the transit API and Telegram.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::bot::message::Reply;
use crate::bot::scheduler::Messenger;
use crate::bot::transit::{ArrivalPrediction, RouteEntry, StopInfo, TransitApi, TransitError};

/// Transit API backed by fixed data, counting upstream calls.
pub struct FakeTransit {
    routes: HashMap<String, Vec<RouteEntry>>,
    stops: Vec<StopInfo>,
    arrivals: Mutex<HashMap<(String, String), Vec<ArrivalPrediction>>>,
    failing: AtomicBool,
    failing_stops: Mutex<HashSet<String>>,
    hanging_stops: Mutex<HashSet<String>>,
    route_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    arrival_calls: AtomicUsize,
}

fn route_entry(service_no: &str, direction: u8, sequence: u32, stop_code: &str) -> RouteEntry {
    RouteEntry {
        service_no: service_no.to_string(),
        direction,
        sequence,
        stop_code: stop_code.to_string(),
    }
}

fn stop_info(code: &str, description: &str, road_name: &str) -> StopInfo {
    StopInfo {
        code: code.to_string(),
        description: description.to_string(),
        road_name: road_name.to_string(),
    }
}

impl FakeTransit {
    /// Bus 965 loops Sembawang Int -> Canberra Rd -> Admiralty Dr -> back.
    /// Route rows are deliberately out of order.
    pub fn sample() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            "965".to_string(),
            vec![
                route_entry("965", 2, 2, "46009"),
                route_entry("965", 1, 3, "83141"),
                route_entry("965", 1, 1, "46009"),
                route_entry("965", 2, 1, "46971"),
                route_entry("965", 1, 2, "83139"),
            ],
        );
        routes.insert(
            "970".to_string(),
            vec![
                route_entry("970", 1, 1, "01012"),
                route_entry("970", 1, 2, "01013"),
            ],
        );

        let stops = vec![
            stop_info("46009", "Sembawang Int", "Sembawang Dr"),
            stop_info("83139", "Blk 123", "Canberra Rd"),
            stop_info("83141", "Blk 1234", "Canberra Rd"),
            stop_info("46971", "Opp Blk 456", "Admiralty Dr"),
            stop_info("01012", "Hotel Grand Pacific", "Victoria St"),
            stop_info("01013", "St. Joseph's Ch", "Victoria St"),
        ];

        Self {
            routes,
            stops,
            arrivals: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            failing_stops: Mutex::new(HashSet::new()),
            hanging_stops: Mutex::new(HashSet::new()),
            route_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            arrival_calls: AtomicUsize::new(0),
        }
    }

    /// A prediction `minutes` (plus a few seconds) after `now`.
    pub fn arrival(now: DateTime<Utc>, minutes: i64) -> ArrivalPrediction {
        ArrivalPrediction {
            eta: now + chrono::Duration::seconds(minutes * 60 + 20),
            crowd: None,
            wheelchair_accessible: false,
            bus_type: None,
        }
    }

    pub fn set_arrivals(&self, stop_code: &str, service_no: &str, arrivals: Vec<ArrivalPrediction>) {
        self.arrivals
            .lock()
            .unwrap()
            .insert((stop_code.to_string(), service_no.to_string()), arrivals);
    }

    /// Make every upstream call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make arrival lookups for one stop fail.
    pub fn fail_stop(&self, stop_code: &str) {
        self.failing_stops.lock().unwrap().insert(stop_code.to_string());
    }

    /// Make arrival lookups for one stop never answer.
    pub fn hang_stop(&self, stop_code: &str) {
        self.hanging_stops.lock().unwrap().insert(stop_code.to_string());
    }

    pub fn route_calls(&self) -> usize {
        self.route_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn arrival_calls(&self) -> usize {
        self.arrival_calls.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), TransitError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TransitError::UpstreamUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransitApi for FakeTransit {
    async fn bus_routes(&self, service_no: &str) -> Result<Vec<RouteEntry>, TransitError> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.routes.get(service_no).cloned().unwrap_or_default())
    }

    async fn bus_stops(&self) -> Result<Vec<StopInfo>, TransitError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        Ok(self.stops.clone())
    }

    async fn bus_arrivals(
        &self,
        stop_code: &str,
        service_no: &str,
    ) -> Result<Vec<ArrivalPrediction>, TransitError> {
        self.arrival_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        if self.failing_stops.lock().unwrap().contains(stop_code) {
            return Err(TransitError::UpstreamUnavailable("HTTP 503".to_string()));
        }
        let hang = self.hanging_stops.lock().unwrap().contains(stop_code);
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(self
            .arrivals
            .lock()
            .unwrap()
            .get(&(stop_code.to_string(), service_no.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Messenger that records everything sent.
#[derive(Default)]
pub struct RecordingMessenger {
    sent: Mutex<Vec<(i64, Reply)>>,
    failing_chats: Mutex<HashSet<i64>>,
}

impl RecordingMessenger {
    pub fn sent(&self) -> Vec<(i64, Reply)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, reply)| reply.text)
            .collect()
    }

    /// Make sends to one chat fail, as if the user blocked the bot.
    pub fn fail_chat(&self, chat_id: i64) {
        self.failing_chats.lock().unwrap().insert(chat_id);
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), String> {
        if self.failing_chats.lock().unwrap().contains(&chat_id) {
            return Err("Forbidden: bot was blocked by the user".to_string());
        }
        self.sent.lock().unwrap().push((chat_id, reply.clone()));
        Ok(())
    }
}
