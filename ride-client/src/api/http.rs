//! HTTP implementation of [`RideApi`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use ride_types::{BookingId, BookingRequest, FareQuote, NearbyQuery, ParticipantId, RideSnapshot};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ApiError, RideApi};

/// Lists come back bare or wrapped, depending on the endpoint version.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody<T> {
    Bare(Vec<T>),
    Quotes { quotes: Vec<T> },
    Rides { rides: Vec<T> },
}

impl<T> ListBody<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Self::Bare(items) | Self::Quotes { quotes: items } | Self::Rides { rides: items } => {
                items
            }
        }
    }
}

/// Ride resource API over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpRideApi {
    base: String,
    client: reqwest::Client,
}

impl HttpRideApi {
    /// Create a client for the API rooted at `base` (e.g. `http://host/api`).
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ridesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> Result<String, ApiError> {
        let url = self.url(path);
        debug!(%url, "POST");
        let request = self.client.post(&url);
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        let response = request.send().await.map_err(network)?;
        read_body(response).await
    }

    async fn get(&self, path: &str) -> Result<String, ApiError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self.client.get(&url).send().await.map_err(network)?;
        read_body(response).await
    }
}

fn network(e: reqwest::Error) -> ApiError {
    ApiError::Network(e.to_string())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Server-provided reason from an error body (`message` or `error`).
fn reason(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn read_body(response: reqwest::Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await.map_err(network)?;
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound);
    }
    if !status.is_success() {
        let message = reason(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    // Some endpoints answer 200 with {"success": false, "error": ...}.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                message: reason(&body).unwrap_or_else(|| "request refused".to_string()),
            });
        }
    }
    Ok(body)
}

fn snapshot(body: &str) -> Result<RideSnapshot, ApiError> {
    RideSnapshot::from_json(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Command responses may or may not carry the ride.
fn optional_snapshot(body: &str) -> Option<RideSnapshot> {
    if body.trim().is_empty() {
        return None;
    }
    RideSnapshot::from_json(body)
        .ok()
        .filter(|ride| ride.booking_id.is_some())
}

/// `/rides/{id}{suffix}` with the id percent-encoded as one path segment.
fn ride_path(booking_id: &BookingId, suffix: &str) -> String {
    format!("/rides/{}{suffix}", urlencoding::encode(booking_id.as_str()))
}

fn list<T: serde::de::DeserializeOwned>(body: &str) -> Result<Vec<T>, ApiError> {
    serde_json::from_str::<ListBody<T>>(body)
        .map(ListBody::into_vec)
        .map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl RideApi for HttpRideApi {
    async fn ride(&self, booking_id: &BookingId) -> Result<RideSnapshot, ApiError> {
        let body = self.get(&ride_path(booking_id, "")).await?;
        snapshot(&body)
    }

    async fn quote(&self, request: &BookingRequest) -> Result<Vec<FareQuote>, ApiError> {
        let body = self.post("/rides/quote", Some(to_value(request)?)).await?;
        list(&body)
    }

    async fn book(&self, request: &BookingRequest) -> Result<RideSnapshot, ApiError> {
        let body = self.post("/rides/book", Some(to_value(request)?)).await?;
        let ride = snapshot(&body)?;
        if ride.booking_id.is_none() {
            return Err(ApiError::Decode("booking response without booking id".into()));
        }
        Ok(ride)
    }

    async fn accept(
        &self,
        booking_id: &BookingId,
        provider: &ParticipantId,
    ) -> Result<RideSnapshot, ApiError> {
        let body = self
            .post(
                &ride_path(booking_id, "/accept"),
                Some(json!({ "driverId": provider })),
            )
            .await?;
        let mut ride = snapshot(&body)?;
        if ride.booking_id.is_none() {
            ride.booking_id = Some(booking_id.clone());
        }
        Ok(ride)
    }

    async fn verify_code(&self, booking_id: &BookingId, code: &str) -> Result<(), ApiError> {
        self.post(
            &ride_path(booking_id, "/verify-otp"),
            Some(json!({ "otp": code })),
        )
        .await?;
        Ok(())
    }

    async fn start(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError> {
        let body = self.post(&ride_path(booking_id, "/start"), None).await?;
        Ok(optional_snapshot(&body))
    }

    async fn complete(&self, booking_id: &BookingId) -> Result<Option<RideSnapshot>, ApiError> {
        let body = self.post(&ride_path(booking_id, "/complete"), None).await?;
        Ok(optional_snapshot(&body))
    }

    async fn cancel(&self, booking_id: &BookingId) -> Result<(), ApiError> {
        self.post(&ride_path(booking_id, "/cancel"), None).await?;
        Ok(())
    }

    async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<RideSnapshot>, ApiError> {
        let url = self.url("/rides/nearby");
        debug!(%url, radius = query.radius, "GET");
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(network)?;
        let body = read_body(response).await?;
        list(&body)
    }
}
