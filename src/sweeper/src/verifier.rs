//! Chain Verifier
//!
//! Re-checks spent claims directly against a chain hub. The claim index
//! lags behind the chain, so a claim it reports as spent may have been
//! updated since; such streams are switched back to valid before any of
//! their blobs can be purged.

use crate::error::SweepResult;
use crate::state::LocalStateStore;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::config::ChainConfig;
use common::model::StreamRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Text the hub returns for a claim id it does not know.
pub const NOT_FOUND_MARKER: &str = "Could not find claim at";

const GET_CLAIM_METHOD: &str = "blockchain.claimtrie.getclaimbyid";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClaimLookup: Send + Sync {
    /// Whether the chain still knows the claim.
    async fn claim_exists(&self, claim_id: &str) -> Result<bool, VerifyError>;
}

#[derive(Serialize)]
struct HubRequest<'a> {
    id: u32,
    method: &'a str,
    params: [&'a str; 1],
}

#[derive(Deserialize)]
struct HubResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Line-delimited JSON client for a chain hub.
#[derive(Debug, Clone)]
pub struct HubClient {
    address: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl HubClient {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            address: config.address.clone(),
            connect_timeout: config.connect_timeout,
            io_timeout: config.io_timeout,
        }
    }

    async fn round_trip(&self, claim_id: &str) -> Result<String, VerifyError> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| VerifyError::Timeout("connect"))?
            .map_err(|source| VerifyError::Connect {
                address: self.address.clone(),
                source,
            })?;

        let request = HubRequest {
            id: 0,
            method: GET_CLAIM_METHOD,
            params: [claim_id],
        };
        let mut payload =
            serde_json::to_vec(&request).map_err(|e| VerifyError::Protocol(e.to_string()))?;
        payload.push(b'\n');

        timeout(self.io_timeout, stream.write_all(&payload))
            .await
            .map_err(|_| VerifyError::Timeout("write"))??;

        let mut line = String::new();
        let read = timeout(self.io_timeout, BufReader::new(stream).read_line(&mut line))
            .await
            .map_err(|_| VerifyError::Timeout("read"))??;
        if read == 0 {
            return Err(VerifyError::Protocol(
                "connection closed before a response".to_string(),
            ));
        }
        Ok(line)
    }
}

/// Decoded result text of a hub response line.
fn decode_result(line: &str) -> Result<String, VerifyError> {
    let response: HubResponse =
        serde_json::from_str(line.trim_end()).map_err(|e| VerifyError::Decode(e.to_string()))?;
    if let Some(error) = response.error {
        return Err(VerifyError::Protocol(format!("hub returned an error: {error}")));
    }
    let encoded = response
        .result
        .ok_or_else(|| VerifyError::Protocol("response has no result".to_string()))?;
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| VerifyError::Decode(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl ClaimLookup for HubClient {
    async fn claim_exists(&self, claim_id: &str) -> Result<bool, VerifyError> {
        let line = self.round_trip(claim_id).await?;
        let body = decode_result(&line)?;
        Ok(!body.contains(NOT_FOUND_MARKER))
    }
}

pub struct ChainVerifier {
    lookup: Arc<dyn ClaimLookup>,
}

impl ChainVerifier {
    pub fn new(lookup: Arc<dyn ClaimLookup>) -> Self {
        Self { lookup }
    }

    /// Re-check every spent record with a known claim id and flip the ones
    /// the chain still knows back to valid. Returns the number of corrections.
    ///
    /// Lookup failures keep the current classification. A failure to clear a
    /// corrected stream from the cache is fatal.
    pub async fn double_check(
        &self,
        records: &mut [StreamRecord],
        store: Option<&LocalStateStore>,
    ) -> SweepResult<usize> {
        let candidates = records
            .iter()
            .filter(|r| r.spent && r.claim_id.is_some())
            .count();
        tracing::info!(candidates, "Double-checking spent claims against the chain");

        let mut corrected = 0;
        for record in records.iter_mut().filter(|r| r.spent) {
            let Some(claim_id) = record.claim_id.as_deref() else {
                continue;
            };

            let outcome = self.lookup.claim_exists(claim_id).await;
            match outcome {
                Ok(false) => {
                    tracing::debug!(stream_id = record.stream_id, claim_id, "Claim confirmed gone");
                }
                Ok(true) => {
                    tracing::warn!(
                        stream_id = record.stream_id,
                        sd_hash = %record.sd_hash,
                        claim_id,
                        "Claim reported spent still exists on chain, keeping stream"
                    );
                    if let Some(store) = store {
                        store.unflag_stream(record.stream_id).await?;
                    }
                    record.mark_live();
                    corrected += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        stream_id = record.stream_id,
                        claim_id,
                        error = %e,
                        "Chain lookup failed, keeping current classification"
                    );
                }
            }
        }

        tracing::info!(corrected, "Chain double-check complete");
        Ok(corrected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::{BidState, BlobInfo};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    /// Serve one connection: read the request line, answer with `body`
    /// base64-encoded, or stay silent when `body` is `None`.
    async fn serve_once(body: Option<&'static str>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind listener");
        let address = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut request = String::new();
            BufReader::new(reader).read_line(&mut request).await.unwrap();

            match body {
                Some(body) => {
                    let response = serde_json::json!({
                        "jsonrpc": "2.0",
                        "result": STANDARD.encode(body),
                        "id": 0,
                    });
                    writer
                        .write_all(format!("{response}\n").as_bytes())
                        .await
                        .unwrap();
                }
                None => tokio::time::sleep(Duration::from_secs(5)).await,
            }
            request
        });
        (address, handle)
    }

    fn client(address: String) -> HubClient {
        HubClient::new(&ChainConfig {
            address,
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(200),
        })
    }

    fn spent_record(id: i64, claim_id: &str) -> StreamRecord {
        let mut record = StreamRecord::new(id, format!("sd{id}"));
        record.apply_classification(Some(BidState::Spent), Some(claim_id.to_string()));
        record
    }

    #[tokio::test]
    async fn test_request_line_format() {
        let (address, server) = serve_once(Some("{}")).await;
        client(address).claim_exists("abc123").await.unwrap();

        let request = server.await.unwrap();
        assert_eq!(
            request,
            "{\"id\":0,\"method\":\"blockchain.claimtrie.getclaimbyid\",\"params\":[\"abc123\"]}\n"
        );
    }

    #[tokio::test]
    async fn test_exact_marker_means_gone() {
        let (address, _server) = serve_once(Some(NOT_FOUND_MARKER)).await;
        assert!(!client(address).claim_exists("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_with_claim_id_means_gone() {
        let (address, _server) = serve_once(Some("Could not find claim at abc")).await;
        assert!(!client(address).claim_exists("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_any_other_body_means_exists() {
        let (address, _server) = serve_once(Some("{\"claim_id\":\"abc\",\"name\":\"x\"}")).await;
        assert!(client(address).claim_exists("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_silent_hub_times_out() {
        let (address, _server) = serve_once(None).await;
        let err = client(address).claim_exists("abc").await.unwrap_err();
        assert!(matches!(err, VerifyError::Timeout("read")));
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(decode_result("not json"), Err(VerifyError::Decode(_))));
        assert!(matches!(
            decode_result("{\"result\":\"%%%\"}"),
            Err(VerifyError::Decode(_))
        ));
        assert!(matches!(
            decode_result("{\"error\":{\"code\":1}}"),
            Err(VerifyError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_double_check_corrects_false_negative() {
        let (address, _server) = serve_once(Some("{\"claim_id\":\"live\"}")).await;
        let store = LocalStateStore::in_memory().await.unwrap();
        let mut record = spent_record(1, "live");
        record.inventory = Some(HashMap::from([("b1".to_string(), BlobInfo::new(1))]));
        store.upsert_streams(std::slice::from_ref(&record)).await.unwrap();
        store.store_blobs(std::slice::from_ref(&record)).await.unwrap();

        let mut records = vec![record];
        let verifier = ChainVerifier::new(Arc::new(client(address)));
        let corrected = verifier.double_check(&mut records, Some(&store)).await.unwrap();

        assert_eq!(corrected, 1);
        assert!(records[0].is_valid());
        assert!(records[0].inventory.is_none());
        assert!(store.load_streams().await.unwrap()[0].is_valid());
        assert_eq!(store.count_blobs(false).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_check_keeps_classification_on_timeout() {
        let (address, _server) = serve_once(None).await;
        let mut records = vec![spent_record(1, "unknown")];

        let verifier = ChainVerifier::new(Arc::new(client(address)));
        let corrected = verifier.double_check(&mut records, None).await.unwrap();

        assert_eq!(corrected, 0);
        assert!(records[0].spent);
        assert!(!records[0].is_valid());
    }

    #[tokio::test]
    async fn test_double_check_only_queries_spent_with_claim_id() {
        let mut lookup = MockClaimLookup::new();
        lookup
            .expect_claim_exists()
            .withf(|claim_id| claim_id == "spent-claim")
            .times(1)
            .returning(|_| Ok(false));

        let mut expired = StreamRecord::new(2, "sd2");
        expired.apply_classification(Some(BidState::Expired), Some("expired-claim".to_string()));
        let mut no_claim = StreamRecord::new(3, "sd3");
        no_claim.apply_classification(Some(BidState::Spent), None);
        let mut records = vec![spent_record(1, "spent-claim"), expired, no_claim];

        let verifier = ChainVerifier::new(Arc::new(lookup));
        let corrected = verifier.double_check(&mut records, None).await.unwrap();

        assert_eq!(corrected, 0);
        assert!(records[0].spent);
        assert!(records[2].spent);
    }
}
