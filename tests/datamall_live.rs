//! Live checks against LTA DataMall.
//!
//! These tests need a DataMall account key in `LTA_API_KEY`.
//!
//! Run with: cargo test --features integ_test --test datamall_live

#[cfg(feature = "integ_test")]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use busbuddy::bot::datamall::DEFAULT_BASE_URL;
    use busbuddy::bot::transit::{StopMatch, TransitApi, TransitError};
    use busbuddy::bot::{CacheSettings, DataMallClient, TransitData};

    fn client() -> Option<DataMallClient> {
        let Ok(key) = std::env::var("LTA_API_KEY") else {
            eprintln!("Skipping test: LTA_API_KEY not set");
            return None;
        };
        Some(DataMallClient::new(DEFAULT_BASE_URL, &key, Duration::from_secs(10), 3).unwrap())
    }

    #[tokio::test]
    async fn test_stop_directory_spans_pages() {
        let Some(client) = client() else { return };
        let stops = client.bus_stops().await.unwrap();
        // Singapore has several thousand stops
        assert!(stops.len() > 500, "only {} stops", stops.len());
        assert!(stops.iter().any(|s| s.code == "01012"));
    }

    #[tokio::test]
    async fn test_route_lookup() {
        let Some(client) = client() else { return };
        let data = TransitData::new(Arc::new(client), CacheSettings::default());

        let route = data.list_route_stops("965").await.unwrap();
        assert!(!route.is_empty());
        assert!(route.windows(2).all(|w| (w[0].direction, w[0].sequence) <= (w[1].direction, w[1].sequence)));

        let first = route[0].code.clone();
        assert!(matches!(
            data.find_stop("965", &first).await,
            Ok(StopMatch::Found(stop)) if stop.code == first
        ));
        assert_eq!(data.list_route_stops("ZZZZZ").await, Err(TransitError::NotFound));
    }

    #[tokio::test]
    async fn test_arrivals_parse() {
        let Some(client) = client() else { return };
        // Empty outside operating hours; only the call itself must succeed
        let arrivals = client.bus_arrivals("83139", "15").await.unwrap();
        assert!(arrivals.len() <= 3);
    }
}
