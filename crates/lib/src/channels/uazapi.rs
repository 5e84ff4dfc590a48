//! Uazapi-compatible WhatsApp gateway client.
//!
//! Deployments disagree on paths and field names, so every send walks a list of candidate routes
//! in order and stops at the first 2xx. Payloads carry either the full set of known field aliases
//! (compatible mode) or a reduced canonical set (minimal mode).

use crate::channels::gateway::{GatewayError, MessagingGateway};
use crate::channels::retry::{send_with_retry, RawResponse, RetryPolicy};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_TEXT_PATHS: [&str; 8] = [
    "/send/text",
    "/api/send/text",
    "/send-text",
    "/api/send-text",
    "/message/text",
    "/api/message/text",
    "/messages/text",
    "/api/messages/text",
];

pub const DEFAULT_MEDIA_PATHS: [&str; 8] = [
    "/send/media",
    "/api/send/media",
    "/send-media",
    "/api/send-media",
    "/message/media",
    "/api/message/media",
    "/messages/media",
    "/api/messages/media",
];

const WAIT_PATHS: [&str; 2] = ["/wait", "/send/wait"];
const DOWNLOAD_PATH: &str = "/message/download";
const DEFAULT_WAIT_PULSE: Duration = Duration::from_millis(5500);
const DEFAULT_MIN_VISIBLE: Duration = Duration::from_millis(1000);
/// Send delay used after `/wait` pulses already covered the typing time.
const AFTER_PULSES_DELAY_MS: u64 = 300;

/// Connection and compatibility settings for the gateway client.
#[derive(Debug, Clone)]
pub struct UazapiSettings {
    pub base_send: String,
    pub token_send: String,
    pub base_download: String,
    pub token_download: String,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Emit only canonical field names instead of every known alias.
    pub minimal_payload: bool,
    /// Candidate text routes in priority order; empty means DEFAULT_TEXT_PATHS.
    pub text_paths: Vec<String>,
    /// Candidate media routes in priority order; empty means DEFAULT_MEDIA_PATHS.
    pub media_paths: Vec<String>,
    /// Longest single typing pulse.
    pub wait_pulse: Duration,
    /// Shortest send delay worth asking for; smaller non-zero delays are raised to it.
    pub min_visible: Duration,
    /// Hold the typing indicator with `/wait` pulses before a delayed send instead of relying on
    /// the send's own `delay` field.
    pub legacy_wait: bool,
}

impl UazapiSettings {
    pub fn new(base_send: impl Into<String>, token_send: impl Into<String>) -> Self {
        let base_send = base_send.into();
        let token_send = token_send.into();
        Self {
            base_download: base_send.clone(),
            token_download: token_send.clone(),
            base_send,
            token_send,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            minimal_payload: true,
            text_paths: Vec::new(),
            media_paths: Vec::new(),
            wait_pulse: DEFAULT_WAIT_PULSE,
            min_visible: DEFAULT_MIN_VISIBLE,
            legacy_wait: false,
        }
    }
}

/// Gateway client: text/media sends, media download and typing pulses.
#[derive(Clone)]
pub struct UazapiClient {
    settings: UazapiSettings,
    client: reqwest::Client,
}

impl UazapiClient {
    pub fn new(mut settings: UazapiSettings) -> Result<Self, reqwest::Error> {
        settings.base_send = settings.base_send.trim_end_matches('/').to_string();
        settings.base_download = settings.base_download.trim_end_matches('/').to_string();
        if settings.text_paths.is_empty() {
            settings.text_paths = DEFAULT_TEXT_PATHS.iter().map(|p| p.to_string()).collect();
        }
        if settings.media_paths.is_empty() {
            settings.media_paths = DEFAULT_MEDIA_PATHS.iter().map(|p| p.to_string()).collect();
        }
        if settings.wait_pulse.is_zero() {
            settings.wait_pulse = DEFAULT_WAIT_PULSE;
        }
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { settings, client })
    }

    fn post_json(&self, url: &str, token: &str, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Accept", "application/json")
            .header("token", token)
            .header("convert", "true")
            .json(body)
    }

    async fn post_once_with_retry(
        &self,
        operation: &'static str,
        url: &str,
        token: &str,
        body: &Value,
    ) -> Result<RawResponse, GatewayError> {
        log::debug!("gateway {}: POST {}", operation, url);
        send_with_retry(&self.settings.retry, operation, || self.post_json(url, token, body))
            .await
            .map_err(|source| GatewayError::Transport {
                operation,
                route: url.to_string(),
                source,
            })
    }

    /// Try each route in order; first 2xx wins. The error describes the last route attempted.
    async fn post_to_candidates(
        &self,
        operation: &'static str,
        paths: &[String],
        body: &Value,
    ) -> Result<(), GatewayError> {
        let mut last = None;
        for path in paths {
            let url = join_url(&self.settings.base_send, path);
            match self
                .post_once_with_retry(operation, &url, &self.settings.token_send, body)
                .await
            {
                Ok(res) if res.status.is_success() => return Ok(()),
                Ok(res) => {
                    log::debug!("gateway {}: {} answered {}", operation, url, res.status);
                    last = Some(GatewayError::Status {
                        operation,
                        route: url,
                        status: res.status.as_u16(),
                        body: res.body_text(),
                    });
                }
                Err(e) => {
                    log::debug!("gateway {}: {}", operation, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(GatewayError::NoRoutes(operation)))
    }

    /// Delay to put on a send payload, in ms. With legacy pulses the typing time is spent here
    /// and only a short delay remains for the send itself.
    async fn send_delay_ms(&self, to: &str, delay: Duration) -> u64 {
        if delay.is_zero() {
            return 0;
        }
        let delay = delay.max(self.settings.min_visible);
        if !self.settings.legacy_wait {
            return delay.as_millis() as u64;
        }
        self.indicate_typing(to, delay).await;
        AFTER_PULSES_DELAY_MS
    }

    /// One typing pulse: `/wait`, then `/send/wait`. Outcome is ignored.
    async fn wait_pulse(&self, number: &str, chat_id: &str, ms: u64) {
        let body = wait_payload(number, chat_id, ms, self.settings.minimal_payload);
        for path in WAIT_PATHS {
            let url = join_url(&self.settings.base_send, path);
            match self
                .post_once_with_retry("typing", &url, &self.settings.token_send, &body)
                .await
            {
                Ok(res) if res.status.is_success() => return,
                Ok(res) => log::debug!("gateway typing: {} answered {}", url, res.status),
                Err(e) => log::debug!("gateway typing: {}", e),
            }
        }
    }
}

#[async_trait]
impl MessagingGateway for UazapiClient {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), GatewayError> {
        self.send_text_with_delay(to, text, Duration::ZERO).await
    }

    async fn send_media(&self, to: &str, kind: &str, data: &[u8]) -> Result<(), GatewayError> {
        self.send_media_with_delay(to, kind, data, Duration::ZERO).await
    }

    async fn send_text_with_delay(
        &self,
        to: &str,
        text: &str,
        delay: Duration,
    ) -> Result<(), GatewayError> {
        let (number, chat_id) = chat_address(to);
        let delay_ms = self.send_delay_ms(to, delay).await;
        let mut body = text_payload(&number, &chat_id, text, self.settings.minimal_payload);
        add_delay(&mut body, delay_ms, self.settings.minimal_payload);
        self.post_to_candidates("send text", &self.settings.text_paths, &body)
            .await
    }

    async fn send_media_with_delay(
        &self,
        to: &str,
        kind: &str,
        data: &[u8],
        delay: Duration,
    ) -> Result<(), GatewayError> {
        let (number, chat_id) = chat_address(to);
        let delay_ms = self.send_delay_ms(to, delay).await;
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let mut body = media_payload(
            &number,
            &chat_id,
            kind,
            &encoded,
            self.settings.minimal_payload,
        );
        add_delay(&mut body, delay_ms, self.settings.minimal_payload);
        self.post_to_candidates("send media", &self.settings.media_paths, &body)
            .await
    }

    async fn resolve_and_fetch_media(
        &self,
        external_message_id: &str,
    ) -> Result<(Bytes, String), GatewayError> {
        let url = join_url(&self.settings.base_download, DOWNLOAD_PATH);
        let body = json!({ "id": external_message_id, "return_link": true });
        let res = self
            .post_once_with_retry("media link", &url, &self.settings.token_download, &body)
            .await?;
        if !res.status.is_success() {
            return Err(GatewayError::Status {
                operation: "media link",
                route: url,
                status: res.status.as_u16(),
                body: res.body_text(),
            });
        }
        let descriptor: Value =
            serde_json::from_slice(&res.body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let link = ["fileURL", "fileUrl", "url"]
            .iter()
            .find_map(|k| descriptor.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .ok_or(GatewayError::MissingMediaLink)?
            .to_string();

        let res = send_with_retry(&self.settings.retry, "media fetch", || self.client.get(&link))
            .await
            .map_err(|source| GatewayError::Transport {
                operation: "media fetch",
                route: link.clone(),
                source,
            })?;
        if !res.status.is_success() {
            return Err(GatewayError::Status {
                operation: "media fetch",
                route: link,
                status: res.status.as_u16(),
                body: res.body_text(),
            });
        }
        Ok((res.body, link))
    }

    async fn indicate_typing(&self, to: &str, duration: Duration) {
        let (number, chat_id) = chat_address(to);
        let pulse = self.settings.wait_pulse.as_millis() as u64;
        let mut remaining = duration.as_millis() as u64;
        while remaining > 0 {
            let step = remaining.min(pulse);
            self.wait_pulse(&number, &chat_id, step).await;
            remaining -= step;
            if remaining > 0 && step >= 2000 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Join base and path with a single `/`. A base ending in `/api` and a path starting with
/// `/api/` do not repeat the segment.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if base.ends_with("/api") && path.starts_with("/api/") {
        path = path["/api".len()..].to_string();
    }
    format!("{}{}", base, path)
}

/// `(number, chat_id)` for a bare number or a full chat address.
pub fn chat_address(to: &str) -> (String, String) {
    let number: String = to.chars().filter(|c| c.is_ascii_digit()).collect();
    if to.contains('@') {
        (number, to.trim().to_string())
    } else {
        let chat_id = format!("{}@s.whatsapp.net", number);
        (number, chat_id)
    }
}

fn text_payload(number: &str, chat_id: &str, text: &str, minimal: bool) -> Value {
    if minimal {
        return json!({ "number": number, "text": text });
    }
    json!({
        "number": number,
        "text": text,
        "chatId": chat_id,
        "chatid": chat_id,
        "readchat": true,
        "linkPreview": false,
    })
}

fn media_payload(number: &str, chat_id: &str, kind: &str, file: &str, minimal: bool) -> Value {
    if minimal {
        return json!({ "number": number, "type": kind, "file": file });
    }
    json!({
        "number": number,
        "type": kind,
        "file": file,
        "chatId": chat_id,
        "chatid": chat_id,
        "readchat": true,
        "linkPreview": false,
    })
}

/// Server-side send delay. Compatible mode adds every typing alias deployments are known to read.
fn add_delay(body: &mut Value, delay_ms: u64, minimal: bool) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    if delay_ms == 0 {
        return;
    }
    map.insert("delay".into(), json!(delay_ms));
    if minimal {
        return;
    }
    map.insert("typing".into(), json!(true));
    map.insert("typingTime".into(), json!(delay_ms));
    map.insert("typing_time".into(), json!(delay_ms));
    map.insert("showTyping".into(), json!(true));
}

fn wait_payload(number: &str, chat_id: &str, ms: u64, minimal: bool) -> Value {
    if minimal {
        return json!({ "number": number, "duration": ms });
    }
    json!({
        "number": number,
        "chatId": chat_id,
        "chatid": chat_id,
        "ms": ms,
        "time": ms,
        "duration": ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, minimal: bool) -> UazapiClient {
        let mut settings = UazapiSettings::new(server.uri(), "tok");
        settings.retry = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        };
        settings.minimal_payload = minimal;
        UazapiClient::new(settings).unwrap()
    }

    async fn request_bodies(server: &MockServer) -> Vec<(String, Value)> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                let body = serde_json::from_slice(&r.body).unwrap_or(Value::Null);
                (r.url.path().to_string(), body)
            })
            .collect()
    }

    #[test]
    fn join_url_dedupes_api_segment() {
        assert_eq!(join_url("http://h/", "/send/text"), "http://h/send/text");
        assert_eq!(join_url("http://h", "send/text"), "http://h/send/text");
        assert_eq!(join_url("http://h/api", "/api/send/text"), "http://h/api/send/text");
        assert_eq!(join_url("http://h/api", "/send/text"), "http://h/api/send/text");
    }

    #[test]
    fn chat_address_forms() {
        assert_eq!(
            chat_address("55 11 9999"),
            ("55119999".to_string(), "55119999@s.whatsapp.net".to_string())
        );
        assert_eq!(
            chat_address("5511@c.us"),
            ("5511".to_string(), "5511@c.us".to_string())
        );
    }

    #[tokio::test]
    async fn send_text_stops_at_first_success_in_declared_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send/text"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/send/text"))
            .and(header("token", "tok"))
            .and(header("convert", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server, true).send_text("5511", "hi").await.unwrap();

        let paths: Vec<String> = request_bodies(&server)
            .await
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(paths, vec!["/send/text", "/api/send/text"]);
    }

    #[tokio::test]
    async fn all_routes_404_reports_last_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
            .mount(&server)
            .await;

        let err = client_for(&server, true)
            .send_text("5511", "hi")
            .await
            .unwrap_err();
        match err {
            GatewayError::Status { route, status, body, .. } => {
                assert_eq!(route, format!("{}/api/messages/text", server.uri()));
                assert_eq!(status, 404);
                assert_eq!(body, "not here");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(request_bodies(&server).await.len(), DEFAULT_TEXT_PATHS.len());
    }

    #[tokio::test]
    async fn transient_503_then_success_on_same_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send/text"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/send/text"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        client_for(&server, true).send_text("5511", "hi").await.unwrap();
        let requests = request_bodies(&server).await;
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|(p, _)| p == "/send/text"));
    }

    #[tokio::test]
    async fn persistent_5xx_moves_to_next_route_after_retry_cap() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send/text"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/send/text"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server, true).send_text("5511", "hi").await.unwrap();
    }

    #[tokio::test]
    async fn minimal_and_compatible_text_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        client_for(&server, true).send_text("5511", "a").await.unwrap();
        client_for(&server, false).send_text("5511", "b").await.unwrap();

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0].1, json!({ "number": "5511", "text": "a" }));
        let compat = &bodies[1].1;
        assert_eq!(compat["chatId"], "5511@s.whatsapp.net");
        assert_eq!(compat["chatid"], "5511@s.whatsapp.net");
        assert_eq!(compat["readchat"], true);
        assert_eq!(compat["linkPreview"], false);
    }

    #[tokio::test]
    async fn delayed_sends_carry_delay_aliases() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        client_for(&server, true)
            .send_text_with_delay("5511", "a", Duration::from_millis(2500))
            .await
            .unwrap();
        client_for(&server, false)
            .send_media_with_delay("5511", "audio", b"mp3", Duration::from_millis(200))
            .await
            .unwrap();

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0].1, json!({ "number": "5511", "text": "a", "delay": 2500 }));
        let compat = &bodies[1].1;
        assert_eq!(bodies[1].0, "/send/media");
        assert_eq!(compat["delay"], 1000);
        assert_eq!(compat["typing"], true);
        assert_eq!(compat["typingTime"], 1000);
        assert_eq!(compat["typing_time"], 1000);
        assert_eq!(compat["showTyping"], true);
    }

    #[tokio::test]
    async fn legacy_wait_pulses_then_sends_with_short_delay() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut settings = UazapiSettings::new(server.uri(), "tok");
        settings.minimal_payload = false;
        settings.legacy_wait = true;
        settings.wait_pulse = Duration::from_millis(1000);
        UazapiClient::new(settings)
            .unwrap()
            .send_text_with_delay("5511", "hi", Duration::from_millis(1500))
            .await
            .unwrap();

        let bodies = request_bodies(&server).await;
        let paths: Vec<&str> = bodies.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/wait", "/wait", "/send/text"]);
        assert_eq!(bodies[1].1["ms"], 500);
        assert_eq!(bodies[2].1["delay"], 300);
        assert_eq!(bodies[2].1["typingTime"], 300);
    }

    #[tokio::test]
    async fn send_media_encodes_base64() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send/media"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        client_for(&server, true)
            .send_media("5511", "audio", b"mp3")
            .await
            .unwrap();
        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0].1["type"], "audio");
        assert_eq!(bodies[0].1["file"], "bXAz");
    }

    #[tokio::test]
    async fn fetch_media_resolves_link_then_downloads() {
        let server = MockServer::start().await;
        let link = format!("{}/files/abc.ogg", server.uri());
        Mock::given(method("POST"))
            .and(path("/message/download"))
            .and(header("token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fileURL": link })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/abc.ogg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"OggS".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let (data, url) = client_for(&server, true)
            .resolve_and_fetch_media("MSG1")
            .await
            .unwrap();
        assert_eq!(&data[..], b"OggS");
        assert_eq!(url, link);
        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0].1, json!({ "id": "MSG1", "return_link": true }));
    }

    #[tokio::test]
    async fn fetch_media_without_link_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/download"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fileURL": "" })))
            .mount(&server)
            .await;

        let err = client_for(&server, true)
            .resolve_and_fetch_media("MSG1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingMediaLink));
    }

    #[tokio::test]
    async fn typing_pulses_swallow_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let mut settings = UazapiSettings::new(server.uri(), "tok");
        settings.wait_pulse = Duration::from_millis(500);
        settings.minimal_payload = false;
        let client = UazapiClient::new(settings).unwrap();
        client
            .indicate_typing("5511", Duration::from_millis(1200))
            .await;

        let bodies = request_bodies(&server).await;
        // three pulses (500, 500, 200), each tried on both wait routes
        assert_eq!(bodies.len(), 6);
        assert_eq!(bodies[0].0, "/wait");
        assert_eq!(bodies[1].0, "/send/wait");
        assert_eq!(bodies[4].1["duration"], 200);
        assert_eq!(bodies[4].1["ms"], 200);
    }
}
