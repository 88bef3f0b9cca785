use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

type HmacSha1 = Hmac<Sha1>;

const KEY_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeocodeStatus {
    Ok,
    ZeroResults,
    Other(String),
}

impl GeocodeStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "OK" => GeocodeStatus::Ok,
            "ZERO_RESULTS" => GeocodeStatus::ZeroResults,
            other if other.is_empty() => GeocodeStatus::Other("ERROR".to_string()),
            other => GeocodeStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GeocodeStatus::Ok => "OK",
            GeocodeStatus::ZeroResults => "ZERO_RESULTS",
            GeocodeStatus::Other(status) => status,
        }
    }

    /// Only OK and ZERO_RESULTS are final answers worth caching.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GeocodeStatus::Ok | GeocodeStatus::ZeroResults)
    }
}

impl fmt::Display for GeocodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for GeocodeStatus {
    fn from(value: String) -> Self {
        GeocodeStatus::parse(&value)
    }
}

impl From<GeocodeStatus> for String {
    fn from(value: GeocodeStatus) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub status: GeocodeStatus,
    pub coordinates: Option<Coordinates>,
    pub raw: serde_json::Value,
}

impl GeocodeResult {
    pub fn ok(lat: f64, lng: f64) -> Self {
        Self {
            status: GeocodeStatus::Ok,
            coordinates: Some(Coordinates { lat, lng }),
            raw: serde_json::Value::Null,
        }
    }

    pub fn zero_results() -> Self {
        Self::with_status(GeocodeStatus::ZeroResults)
    }

    pub fn with_status(status: GeocodeStatus) -> Self {
        Self {
            status,
            coordinates: None,
            raw: serde_json::Value::Null,
        }
    }
}

/// A remote geocoding capability. One call is one billable request.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> AppResult<GeocodeResult>;
}

/// Google Geocoding API client using premium-plan client id + URL signing.
pub struct GoogleGeocoder {
    http: reqwest::Client,
    endpoint: Url,
    client_id: String,
    signing_key: SecretString,
}

impl GoogleGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client_id = config
            .google_client_id
            .clone()
            .ok_or_else(|| AppError::Config("missing Google Maps client id".into()))?;
        let signing_key = config
            .google_crypto_key
            .clone()
            .ok_or_else(|| AppError::Config("missing Google Maps crypto key".into()))?;
        decode_key(&signing_key)?;

        let endpoint = Url::parse(&config.geocode_endpoint).map_err(|err| {
            AppError::Config(format!(
                "invalid geocode endpoint {}: {err}",
                config.geocode_endpoint
            ))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("geocode-batch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            client_id,
            signing_key,
        })
    }

    fn signed_url(&self, address: &str) -> AppResult<Url> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("address", address)
            .append_pair("client", &self.client_id);
        let signature = sign_url(&url, &self.signing_key)?;
        let signed = format!("{url}&signature={signature}");
        Url::parse(&signed).map_err(|err| AppError::Config(format!("invalid signed url: {err}")))
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> AppResult<GeocodeResult> {
        let url = self.signed_url(address)?;
        trace!(address, "requesting geocode");
        let response = self.http.get(url).send().await?.error_for_status()?;
        let raw: serde_json::Value = response.json().await?;
        parse_response(raw)
    }
}

fn decode_key(key: &SecretString) -> AppResult<Vec<u8>> {
    KEY_DECODER
        .decode(key.expose_secret().trim())
        .map_err(|err| AppError::Config(format!("crypto key is not url-safe base64: {err}")))
}

/// Signs `path?query` with HMAC-SHA1 and returns the url-safe base64 digest.
pub fn sign_url(url: &Url, key: &SecretString) -> AppResult<String> {
    let key = decode_key(key)?;
    let to_sign = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|err| AppError::Config(format!("invalid crypto key: {err}")))?;
    mac.update(to_sign.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

fn parse_response(raw: serde_json::Value) -> AppResult<GeocodeResult> {
    #[derive(Deserialize)]
    struct Response {
        status: Option<String>,
        #[serde(default)]
        results: Vec<ResponseResult>,
    }

    #[derive(Deserialize)]
    struct ResponseResult {
        geometry: Option<ResponseGeometry>,
    }

    #[derive(Deserialize)]
    struct ResponseGeometry {
        location: Option<ResponseLocation>,
    }

    #[derive(Deserialize)]
    struct ResponseLocation {
        lat: f64,
        lng: f64,
    }

    let parsed: Response = serde_json::from_value(raw.clone())?;
    let status = GeocodeStatus::parse(parsed.status.as_deref().unwrap_or_default());
    let coordinates = parsed
        .results
        .into_iter()
        .next()
        .and_then(|result| result.geometry)
        .and_then(|geometry| geometry.location)
        .map(|location| Coordinates {
            lat: location.lat,
            lng: location.lng,
        });

    Ok(GeocodeResult {
        status,
        coordinates,
        raw,
    })
}
