//! Cached HTTP responses and the rules for what may be cached.

use axum::{
    body::{Body, HttpBody},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header, response::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::CacheError;

/// Status, headers and body of a response, as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Bytes,
}

impl CachedResponse {
    /// Capture a response. Header values must be valid UTF-8.
    pub fn from_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Self, CacheError> {
        let headers = headers
            .iter()
            .map(|(name, value)| {
                let value = std::str::from_utf8(value.as_bytes()).map_err(|err| {
                    CacheError::serialization(format!("header `{name}` is not UTF-8: {err}"))
                })?;
                Ok((name.as_str().to_string(), value.to_string()))
            })
            .collect::<Result<Vec<_>, CacheError>>()?;

        Ok(Self {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    pub fn encode(&self) -> Result<Bytes, CacheError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(CacheError::serialization)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(raw).map_err(CacheError::serialization)
    }

    /// Rebuild the response with status, headers and body as captured.
    pub fn to_response(&self) -> Response {
        let Ok(status) = StatusCode::from_u16(self.status) else {
            warn!(status = self.status, "Cached response has an invalid status");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "Skipping unreadable cached header"),
            }
        }

        response
    }
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

fn cache_control_forbids(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-cache" || directive == "no-store")
}

/// Requests asking for a fresh response skip the cache entirely.
pub fn request_bypasses_cache(headers: &HeaderMap) -> bool {
    cache_control_forbids(headers)
}

/// Whether a buffered response may be stored.
pub fn should_store_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool {
    if !status.is_success() || body.is_empty() {
        return false;
    }

    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }

    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    !cache_control_forbids(headers)
}

/// Outcome of trying to buffer a handler response.
#[derive(Debug)]
pub enum Buffered {
    Complete { parts: Parts, body: Bytes },
    /// Too large or of unknown length; handed back untouched.
    Passthrough(Response),
    /// The body failed mid-stream; nothing is left to forward.
    Failed(String),
}

/// Collect the body of `response` when its length is known to fit in `limit`.
pub async fn buffer_response(response: Response, limit: usize) -> Buffered {
    let fits = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= limit as u64);
    if !fits {
        return Buffered::Passthrough(response);
    }

    let (parts, body) = response.into_parts();
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Buffered::Complete {
            parts,
            body: collected.to_bytes(),
        },
        Err(err) => Buffered::Failed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn encode_decode_preserves_response() {
        let cached = CachedResponse::from_parts(
            StatusCode::CREATED,
            &headers(&[("content-type", "application/json"), ("x-trace", "a"), ("x-trace", "b")]),
            Bytes::from_static(&[0, 159, 146, 150]),
        )
        .unwrap();

        let decoded = CachedResponse::decode(&cached.encode().unwrap()).unwrap();
        assert_eq!(decoded, cached);

        let response = decoded.to_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        let traces: Vec<_> = response.headers().get_all("x-trace").iter().collect();
        assert_eq!(traces, vec!["a", "b"]);
    }

    #[test]
    fn non_utf8_header_is_a_serialization_error() {
        let mut map = HeaderMap::new();
        map.insert("x-raw", HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap());
        let err = CachedResponse::from_parts(StatusCode::OK, &map, Bytes::new()).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            CachedResponse::decode(b"not json"),
            Err(CacheError::Serialization(_))
        ));
    }

    #[test]
    fn storable_responses() {
        let ok = headers(&[("content-type", "application/json")]);
        assert!(should_store_response(StatusCode::OK, &ok, b"[]"));
        assert!(!should_store_response(StatusCode::OK, &ok, b""));
        assert!(!should_store_response(StatusCode::NOT_FOUND, &ok, b"{}"));
        assert!(!should_store_response(
            StatusCode::OK,
            &headers(&[("set-cookie", "sid=1")]),
            b"{}"
        ));
        assert!(!should_store_response(
            StatusCode::OK,
            &headers(&[("content-type", "text/event-stream")]),
            b"data: x"
        ));
        assert!(!should_store_response(
            StatusCode::OK,
            &headers(&[("cache-control", "private, No-Store")]),
            b"{}"
        ));
    }

    #[test]
    fn request_cache_control_bypasses() {
        assert!(request_bypasses_cache(&headers(&[("cache-control", "no-cache")])));
        assert!(!request_bypasses_cache(&headers(&[("cache-control", "max-age=0")])));
        assert!(!request_bypasses_cache(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn buffer_respects_limit() {
        let small = Response::new(Body::from("hello"));
        match buffer_response(small, 16).await {
            Buffered::Complete { body, .. } => assert_eq!(body, Bytes::from_static(b"hello")),
            other => panic!("expected complete, got {other:?}"),
        }

        let large = Response::new(Body::from(vec![b'x'; 64]));
        assert!(matches!(
            buffer_response(large, 16).await,
            Buffered::Passthrough(_)
        ));
    }
}
