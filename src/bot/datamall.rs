//! LTA DataMall client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::bot::transit::{
    ArrivalPrediction, BusType, CrowdLevel, RouteEntry, StopInfo, TransitApi, TransitError,
};

pub const DEFAULT_BASE_URL: &str = "https://datamall2.mytransport.sg/ltaodataservice";

/// DataMall returns at most this many rows per request.
const PAGE_SIZE: usize = 500;
const RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct DataMallClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Attempts per request when the request times out.
    retries: u32,
}

#[derive(Deserialize, Debug)]
struct ODataPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RouteRow {
    #[serde(default)]
    service_no: String,
    #[serde(default)]
    direction: u8,
    #[serde(default)]
    stop_sequence: u32,
    #[serde(default)]
    bus_stop_code: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct StopRow {
    bus_stop_code: String,
    #[serde(default)]
    road_name: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ArrivalResponse {
    #[serde(default)]
    services: Vec<ServiceRow>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ServiceRow {
    service_no: String,
    #[serde(default)]
    next_bus: Option<NextBusRow>,
    #[serde(default)]
    next_bus2: Option<NextBusRow>,
    #[serde(default)]
    next_bus3: Option<NextBusRow>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct NextBusRow {
    /// RFC 3339, or empty when no bus is predicted.
    #[serde(default)]
    estimated_arrival: String,
    #[serde(default)]
    load: String,
    #[serde(default)]
    feature: String,
    #[serde(default, rename = "Type")]
    bus_type: String,
}

impl NextBusRow {
    fn prediction(&self) -> Option<ArrivalPrediction> {
        let eta = DateTime::parse_from_rfc3339(self.estimated_arrival.trim()).ok()?;
        Some(ArrivalPrediction {
            eta: eta.with_timezone(&Utc),
            crowd: CrowdLevel::from_code(&self.load),
            wheelchair_accessible: self.feature == "WAB",
            bus_type: BusType::from_code(&self.bus_type),
        })
    }
}

fn unavailable(endpoint: &str, detail: impl std::fmt::Display) -> TransitError {
    TransitError::UpstreamUnavailable(format!("{endpoint}: {detail}"))
}

/// Predictions for one service out of a stop's arrival board.
fn arrivals_from_response(response: &ArrivalResponse, service_no: &str) -> Vec<ArrivalPrediction> {
    response
        .services
        .iter()
        .filter(|s| s.service_no.eq_ignore_ascii_case(service_no))
        .flat_map(|s| [&s.next_bus, &s.next_bus2, &s.next_bus3])
        .filter_map(|row| row.as_ref().and_then(NextBusRow::prediction))
        .collect()
}

/// `$filter` is a hint upstream; rows for other services are dropped here.
fn routes_from_rows(rows: Vec<RouteRow>, service_no: &str) -> Vec<RouteEntry> {
    rows.into_iter()
        .filter(|r| r.service_no == service_no && !r.bus_stop_code.is_empty())
        .map(|r| RouteEntry {
            service_no: r.service_no,
            direction: r.direction,
            sequence: r.stop_sequence,
            stop_code: r.bus_stop_code,
        })
        .collect()
}

impl DataMallClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, TransitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| unavailable("client", e))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            retries: retries.max(1),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, TransitError> {
        let url = format!("{}/{}", self.base_url, endpoint);

        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let sent = self
                .client
                .get(&url)
                .header("AccountKey", &self.api_key)
                .header(ACCEPT, "application/json")
                .query(query)
                .send()
                .await;
            match sent {
                Ok(response) => break response,
                Err(e) if e.is_timeout() && attempt < self.retries => {
                    warn!(
                        "{} timed out, retrying (attempt {}/{})",
                        endpoint, attempt, self.retries
                    );
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
                Err(e) => return Err(unavailable(endpoint, e)),
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| unavailable(endpoint, format!("failed to read response: {e}")))?;
        debug!("{} response status: {}", endpoint, status);

        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            return Err(unavailable(endpoint, format!("HTTP {status}: {snippet}")));
        }

        serde_json::from_str(&body)
            .map_err(|e| unavailable(endpoint, format!("failed to parse response: {e}")))
    }

    /// Follow `$skip` paging until a short page comes back.
    async fn get_all<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        filter: Option<&str>,
    ) -> Result<Vec<T>, TransitError> {
        let mut rows = Vec::new();
        let mut skip = 0;
        loop {
            let mut query = vec![("$top", PAGE_SIZE.to_string()), ("$skip", skip.to_string())];
            if let Some(filter) = filter {
                query.push(("$filter", filter.to_string()));
            }

            let page: ODataPage<T> = self.get_json(endpoint, &query).await?;
            let count = page.value.len();
            rows.extend(page.value);
            debug!("{}: fetched {} rows at skip {}", endpoint, count, skip);

            if count < PAGE_SIZE {
                return Ok(rows);
            }
            skip += PAGE_SIZE;
        }
    }
}

#[async_trait]
impl TransitApi for DataMallClient {
    async fn bus_routes(&self, service_no: &str) -> Result<Vec<RouteEntry>, TransitError> {
        let filter = format!("ServiceNo eq '{service_no}'");
        let rows: Vec<RouteRow> = self.get_all("BusRoutes", Some(&filter)).await?;
        let routes = routes_from_rows(rows, service_no);
        info!("Retrieved {} route rows for bus {}", routes.len(), service_no);
        Ok(routes)
    }

    async fn bus_stops(&self) -> Result<Vec<StopInfo>, TransitError> {
        let rows: Vec<StopRow> = self.get_all("BusStops", None).await?;
        Ok(rows
            .into_iter()
            .map(|r| StopInfo {
                code: r.bus_stop_code,
                description: r.description,
                road_name: r.road_name,
            })
            .collect())
    }

    async fn bus_arrivals(
        &self,
        stop_code: &str,
        service_no: &str,
    ) -> Result<Vec<ArrivalPrediction>, TransitError> {
        let query = [
            ("BusStopCode", stop_code.to_string()),
            ("ServiceNo", service_no.to_string()),
        ];
        let response: ArrivalResponse = self.get_json("v3/BusArrival", &query).await?;
        Ok(arrivals_from_response(&response, service_no))
    }
}
