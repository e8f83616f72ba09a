//! # Spotify Web API Client
//!
//! Implements [`RecommendationService`] on top of two Web API endpoints:
//! `GET /search?type=track` and `GET /recommendations?seed_tracks=...`.
//!
//! Authentication uses the client-credentials flow. The access token is cached
//! until shortly before it expires; a `401` drops it and the request is tried
//! once more with a fresh token.

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::SpotifySettings;
use crate::recommender::{RecommendationService, RemoteTrack, MAX_SEEDS};

/// Tokens are refreshed this long before the service says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Upper bound on a token lifetime, whatever `expires_in` says.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tracks: Option<TrackPage>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<RemoteTrack>,
}

#[derive(Debug, Default, Deserialize)]
struct RecommendationsResponse {
    #[serde(default)]
    tracks: Vec<RemoteTrack>,
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN < self.expires_at
    }
}

/// Blocking Spotify client backed by `ureq`.
pub struct SpotifyClient {
    http_client: ureq::Agent,
    settings: SpotifySettings,
    token: Option<AccessToken>,
}

impl SpotifyClient {
    pub fn new(settings: SpotifySettings) -> Self {
        let timeout = Duration::from_secs(settings.timeout_secs);
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            http_client,
            settings,
            token: None,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.settings.api_base.trim_end_matches('/'))
    }

    fn access_token(&mut self) -> Result<String> {
        if let Some(token) = self.token.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.clone());
        }

        debug!("Requesting Spotify access token");
        let response: TokenResponse = self
            .http_client
            .post(&self.settings.auth_url)
            .send_form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ])
            .map_err(|err| anyhow!("Spotify token request failed: {}", describe_failure(err)))?
            .into_json()
            .context("Spotify token response did not parse")?;

        info!("Obtained Spotify access token (valid {}s)", response.expires_in);
        let value = response.access_token;
        let lifetime = Duration::from_secs(response.expires_in).min(MAX_TOKEN_LIFETIME);
        self.token = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    fn get_json<T: DeserializeOwned>(&mut self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = self.endpoint(path);
        let mut refreshed = false;
        loop {
            let token = self.access_token()?;
            let mut request = self
                .http_client
                .get(&url)
                .set("Authorization", &format!("Bearer {token}"));
            for (param, value) in query {
                request = request.query(param, value);
            }
            match request.call() {
                Ok(response) => {
                    return response
                        .into_json()
                        .with_context(|| format!("Spotify {path} response did not parse"));
                }
                Err(ureq::Error::Status(401, _)) if !refreshed => {
                    debug!("Spotify rejected the cached token; refreshing");
                    self.token = None;
                    refreshed = true;
                }
                Err(err) => {
                    return Err(anyhow!("Spotify {path} request failed: {}", describe_failure(err)))
                }
            }
        }
    }
}

/// Status code plus whatever message the service put in the error body.
fn describe_failure(err: ureq::Error) -> String {
    match err {
        ureq::Error::Status(code, response) => {
            let body: Option<Value> = response.into_json().ok();
            let message = body.as_ref().and_then(error_message);
            match message {
                Some(message) => format!("HTTP {code}: {message}"),
                None => format!("HTTP {code}"),
            }
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    }
}

/// Web API errors are `{"error": {"message": ..}}`; the token endpoint uses
/// `{"error": "..", "error_description": ".."}`.
fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error_description").and_then(Value::as_str))
        .or_else(|| error.as_str())
        .map(str::to_string)
}

impl RecommendationService for SpotifyClient {
    fn search_tracks(&mut self, query: &str) -> Result<Vec<RemoteTrack>> {
        let response: SearchResponse = self.get_json("search", &[("q", query), ("type", "track")])?;
        Ok(response.tracks.unwrap_or_default().items)
    }

    fn recommend(&mut self, seed_ids: &[String]) -> Result<Vec<RemoteTrack>> {
        if seed_ids.is_empty() || seed_ids.len() > MAX_SEEDS {
            return Err(anyhow!(
                "recommendations need 1 to {MAX_SEEDS} seed tracks, got {}",
                seed_ids.len()
            ));
        }
        let seeds = seed_ids.join(",");
        let response: RecommendationsResponse =
            self.get_json("recommendations", &[("seed_tracks", seeds.as_str())])?;
        Ok(response.tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Minimal HTTP server: answers each accepted connection with the next
    /// `(status, body)` pair and records the request lines it saw.
    fn http_server(replies: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for (status, body) in replies {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    let header = header.trim_end();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap();
                        }
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();
                seen.push(request_line.trim_end().to_string());

                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
            }
            seen
        });
        (base, handle)
    }

    fn settings_for(base: &str) -> SpotifySettings {
        SpotifySettings {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            api_base: format!("{base}/v1"),
            auth_url: format!("{base}/api/token"),
            timeout_secs: 5,
        }
    }

    const TOKEN: &str = r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600}"#;

    #[test]
    fn test_search_response_shape() {
        let parsed: SearchResponse = serde_json::from_str(
            r#"{"tracks":{"items":[{"id":"1","name":"Song A","artists":[{"name":"Artist X"}],"album":{"name":"Album 1"},"popularity":50}]}}"#,
        )
        .unwrap();
        let items = parsed.tracks.unwrap().items;
        assert_eq!(items[0].primary_artist(), Some("Artist X"));
        assert_eq!(items[0].album.as_ref().unwrap().name.as_deref(), Some("Album 1"));
    }

    #[test]
    fn test_recommendations_tolerate_missing_fields() {
        let parsed: RecommendationsResponse =
            serde_json::from_str(r#"{"seeds":[],"tracks":[{"id":"2","name":"Song B"}]}"#).unwrap();
        assert_eq!(parsed.tracks.len(), 1);
        assert!(parsed.tracks[0].artists.is_empty());
        assert!(parsed.tracks[0].album.is_none());
    }

    #[test]
    fn test_error_message_shapes() {
        let api: Value = serde_json::from_str(r#"{"error":{"status":400,"message":"invalid id"}}"#).unwrap();
        assert_eq!(error_message(&api).as_deref(), Some("invalid id"));

        let token: Value = serde_json::from_str(
            r#"{"error":"invalid_client","error_description":"Invalid client secret"}"#,
        )
        .unwrap();
        assert_eq!(error_message(&token).as_deref(), Some("Invalid client secret"));

        let bare: Value = serde_json::from_str(r#"{"error":"invalid_client"}"#).unwrap();
        assert_eq!(error_message(&bare).as_deref(), Some("invalid_client"));

        assert_eq!(error_message(&Value::Null), None);
    }

    #[test]
    fn test_recommend_rejects_bad_seed_counts() {
        let mut client = SpotifyClient::new(settings_for("http://127.0.0.1:9"));
        assert!(client.recommend(&[]).is_err());
        let too_many: Vec<String> = (0..6).map(|n| n.to_string()).collect();
        assert!(client.recommend(&too_many).is_err());
    }

    #[test]
    fn test_token_is_fetched_once_and_reused() {
        let (base, server) = http_server(vec![
            (200, TOKEN),
            (200, r#"{"tracks":{"items":[]}}"#),
            (200, r#"{"tracks":[{"id":"9","name":"Song B","artists":[{"name":"Artist X"}],"album":{"name":"Two"}}]}"#),
        ]);
        let mut client = SpotifyClient::new(settings_for(&base));

        assert!(client.search_tracks("Song A").unwrap().is_empty());
        let recs = client.recommend(&["1".to_string(), "2".to_string()]).unwrap();
        assert_eq!(recs[0].id.as_deref(), Some("9"));

        let seen = server.join().unwrap();
        assert!(seen[0].starts_with("POST /api/token"));
        assert!(seen[1].starts_with("GET /v1/search?"));
        assert!(seen[1].contains("type=track"));
        assert!(seen[2].starts_with("GET /v1/recommendations?seed_tracks="));
    }

    #[test]
    fn test_huge_token_lifetime_is_capped() {
        let (base, server) = http_server(vec![
            (200, r#"{"access_token":"abc","expires_in":18446744073709551615}"#),
            (200, r#"{"tracks":{"items":[]}}"#),
        ]);
        let mut client = SpotifyClient::new(settings_for(&base));
        assert!(client.search_tracks("Song A").unwrap().is_empty());

        let token = client.token.as_ref().unwrap();
        assert!(token.is_fresh());
        assert!(token.expires_at <= Instant::now() + MAX_TOKEN_LIFETIME);
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[test]
    fn test_unauthorized_refreshes_token_once() {
        let (base, server) = http_server(vec![
            (200, TOKEN),
            (401, r#"{"error":{"status":401}}"#),
            (200, TOKEN),
            (200, r#"{"tracks":{"items":[{"id":"1","name":"Song A"}]}}"#),
        ]);
        let mut client = SpotifyClient::new(settings_for(&base));
        let hits = client.search_tracks("Song A").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(server.join().unwrap().len(), 4);
    }

    #[test]
    fn test_server_error_is_reported() {
        let (base, server) = http_server(vec![
            (200, TOKEN),
            (503, r#"{"error":{"status":503,"message":"Service unavailable"}}"#),
        ]);
        let mut client = SpotifyClient::new(settings_for(&base));
        let err = client.search_tracks("Song A").unwrap_err().to_string();
        assert!(err.contains("search"));
        assert!(err.contains("HTTP 503: Service unavailable"));
        server.join().unwrap();
    }
}
