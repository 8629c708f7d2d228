//! Snapshot tests for generated HTTP requests
//!
//! # Update snapshots
//!
//! ```
//! INSTA_UPDATE=always cargo test
//! ```

use application_insights_delivery::{
    ChannelConfig, DeliveryOutcome, HttpTransport, RetryConfig, SamplingConfig, StorageConfig,
    TelemetryChannel, TelemetryItem, TelemetryKind,
};
use format::requests_to_string;
use recording_client::RecordingClient;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

// Fake instrumentation key (this is a random uuid)
const CONNECTION_STRING: &str = "InstrumentationKey=0fdcec70-0ce5-4085-89d9-9ae8ead9af66";

fn config(dir: &TempDir) -> ChannelConfig {
    ChannelConfig::from_connection_string(CONNECTION_STRING)
        .expect("connection string is valid")
        .with_storage(StorageConfig::new(dir.path()))
        .with_retry(
            RetryConfig::default()
                .with_idle_interval(Duration::from_millis(10))
                .with_dispatch_interval(Duration::ZERO)
                .with_backoff(Duration::ZERO, Duration::ZERO)
                .with_jitter(false),
        )
}

fn timestamp() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1592736000)
}

#[tokio::test]
async fn sampled_batch() {
    let dir = TempDir::new().unwrap();
    let client = RecordingClient::new(vec![200]);
    let channel = TelemetryChannel::new(
        config(&dir).with_sampling(SamplingConfig::default().with_percentage(50.0)),
        HttpTransport::new(client.clone()),
    )
    .unwrap();

    // Scores ~33.5, kept at 50%
    let kept_operation = "4bf92f3577b34da6a3ce929d0e0e4736";
    // Scores ~90.2, dropped at 50%
    let dropped_operation = "5b8efff798038103d269b633813fc60c";
    let items = vec![
        TelemetryItem::new(TelemetryKind::Request, timestamp()).with_operation_id(kept_operation),
        TelemetryItem::new(TelemetryKind::Event, timestamp())
            .with_operation_id(kept_operation)
            .with_data(serde_json::json!({
                "baseData": { "name": "checkout", "ver": 2 },
                "baseType": "EventData",
            })),
        TelemetryItem::new(TelemetryKind::Request, timestamp())
            .with_operation_id(dropped_operation),
        TelemetryItem::new(TelemetryKind::Metric, timestamp()),
    ];

    let outcome = channel.track(items).await.unwrap();
    channel.shutdown().await;

    assert_eq!(Some(DeliveryOutcome::Success), outcome);
    insta::assert_snapshot!(requests_to_string(client.requests()), @r###"
    POST /v2/track HTTP/1.1
    host: dc.services.visualstudio.com
    content-type: application/x-json-stream
    content-encoding: gzip

    {"name":"Microsoft.ApplicationInsights.Request","time":"2020-06-21T10:40:00.000Z","sampleRate":50.0,"iKey":"0fdcec70-0ce5-4085-89d9-9ae8ead9af66","tags":{"ai.operation.id":"4bf92f3577b34da6a3ce929d0e0e4736"}}
    {"name":"Microsoft.ApplicationInsights.Event","time":"2020-06-21T10:40:00.000Z","sampleRate":50.0,"iKey":"0fdcec70-0ce5-4085-89d9-9ae8ead9af66","tags":{"ai.operation.id":"4bf92f3577b34da6a3ce929d0e0e4736"},"data":{"baseData":{"name":"checkout","ver":2},"baseType":"EventData"}}
    {"name":"Microsoft.ApplicationInsights.Metric","time":"2020-06-21T10:40:00.000Z","iKey":"0fdcec70-0ce5-4085-89d9-9ae8ead9af66"}
    "###);
}

#[tokio::test]
async fn retried_batch_is_sent_unchanged() {
    let dir = TempDir::new().unwrap();
    let client = RecordingClient::new(vec![503, 429, 200]);
    let channel =
        TelemetryChannel::new(config(&dir), HttpTransport::new(client.clone())).unwrap();

    let item = TelemetryItem::new(TelemetryKind::Message, timestamp()).with_operation_id("abc");
    let outcome = channel.track(vec![item]).await.unwrap();
    assert!(outcome.unwrap().is_transient());

    for _ in 0..200 {
        if channel.store().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    channel.shutdown().await;

    let requests = client.requests();
    assert_eq!(3, requests.len());
    assert!(requests.iter().all(|req| req.body() == requests[0].body()));
    assert!(dir.path().read_dir().unwrap().next().is_none());
}

mod recording_client {
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};
    use opentelemetry_http::{HttpClient, HttpError};
    use std::sync::{Arc, Mutex};

    /// Answers with the scripted status codes in order, then with 200.
    #[derive(Debug, Clone)]
    pub struct RecordingClient {
        requests: Arc<Mutex<Vec<Request<Bytes>>>>,
        statuses: Arc<Mutex<Vec<u16>>>,
    }

    impl RecordingClient {
        pub fn new(mut statuses: Vec<u16>) -> Self {
            statuses.reverse();
            RecordingClient {
                requests: Arc::new(Mutex::new(Vec::new())),
                statuses: Arc::new(Mutex::new(statuses)),
            }
        }

        pub fn requests(&self) -> Vec<Request<Bytes>> {
            self.requests
                .lock()
                .expect("requests mutex is healthy")
                .drain(..)
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_bytes(&self, req: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            let status = self
                .statuses
                .lock()
                .expect("statuses mutex is healthy")
                .pop()
                .unwrap_or(200);
            self.requests
                .lock()
                .expect("requests mutex is healthy")
                .push(req);
            Ok(Response::builder()
                .status(status)
                .body(Bytes::from("{}"))
                .expect("response is well formed"))
        }
    }
}

mod format {
    use bytes::Bytes;
    use flate2::read::GzDecoder;
    use http::Request;
    use std::io::Read;

    pub fn requests_to_string(requests: Vec<Request<Bytes>>) -> String {
        requests
            .into_iter()
            .map(request_to_string)
            .collect::<Vec<_>>()
            .join("\n\n\n")
    }

    fn request_to_string(req: Request<Bytes>) -> String {
        let method = req.method();
        let path = req.uri().path_and_query().expect("path exists");
        let version = format!("{:?}", req.version());
        let host = req.uri().authority().expect("authority exists");
        let headers = req
            .headers()
            .into_iter()
            .map(|(name, value)| {
                let value = value.to_str().expect("header value is valid string");
                format!("{}: {}", name, value)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let body = decompress(req.body());
        format!("{method} {path} {version}\nhost: {host}\n{headers}\n\n{body}")
    }

    fn decompress(body: &[u8]) -> String {
        let mut decompressed = String::new();
        GzDecoder::new(body)
            .read_to_string(&mut decompressed)
            .expect("body is gzipped utf-8");
        decompressed
    }
}
