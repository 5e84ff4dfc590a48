//! Webhook payload normalization: reduce the gateway's many payload shapes to one InboundEvent.
//!
//! Shapes are tried from most to least specific; the first one that yields a chat or sender
//! address wins. When no structured shape matches, the raw bytes are scanned for anything that
//! looks like a chat address and a minimal event is synthesized from it.

use crate::channels::inbound::{InboundEvent, MessageKind, NormalizeError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Direct-chat addresses only: `<digits>@s.whatsapp.net` or `<digits>@c.us`.
static DIRECT_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)@(?:s\.whatsapp\.net|c\.us)$").expect("direct address pattern")
});

/// Any recognized chat address embedded in arbitrary text (direct, group, broadcast, channel).
static ANY_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)@(s\.whatsapp\.net|c\.us|g\.us|broadcast|newsletter)")
        .expect("any address pattern")
});

/// Gateways send `null` for absent fields; treat it like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Message fields as the gateway sends them. Several names exist for the same value; see `resolve`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMessage {
    #[serde(rename = "messageType", deserialize_with = "null_as_default")]
    message_type: String,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    type_name: String,
    content: Option<Value>,
    text: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    sender: String,
    #[serde(rename = "senderName", deserialize_with = "null_as_default")]
    sender_name: String,
    #[serde(deserialize_with = "null_as_default")]
    chatid: String,
    #[serde(rename = "chatId", deserialize_with = "null_as_default")]
    chat_id: String,
    #[serde(deserialize_with = "null_as_default")]
    messageid: String,
    #[serde(rename = "messageId", deserialize_with = "null_as_default")]
    message_id: String,
    #[serde(deserialize_with = "null_as_default")]
    id: String,
    #[serde(rename = "buttonOrListid", deserialize_with = "null_as_default")]
    button_or_list_id: String,
    #[serde(rename = "fromMe", deserialize_with = "null_as_default")]
    from_me: bool,
    #[serde(rename = "wasSentByApi", deserialize_with = "null_as_default")]
    was_sent_by_api: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatInfo {
    #[serde(deserialize_with = "null_as_default")]
    wa_chatid: String,
    #[serde(rename = "wa_lastMessageSender", deserialize_with = "null_as_default")]
    wa_last_message_sender: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvelopeBody {
    #[serde(deserialize_with = "null_as_default")]
    message: WireMessage,
    #[serde(deserialize_with = "null_as_default")]
    chat: ChatInfo,
}

/// `{ "body": { "message": {..}, "chat": {..} } }`
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(deserialize_with = "null_as_default")]
    body: EnvelopeBody,
}

/// `{ "message": {..} }`
#[derive(Debug, Deserialize)]
struct Wrapped {
    #[serde(deserialize_with = "null_as_default")]
    message: WireMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageKey {
    #[serde(rename = "remoteJid", deserialize_with = "null_as_default")]
    remote_jid: String,
    #[serde(rename = "fromMe", deserialize_with = "null_as_default")]
    from_me: bool,
    #[serde(deserialize_with = "null_as_default")]
    id: String,
}

/// `{ "key": { "remoteJid", "fromMe", "id" }, "pushName", "message": { "conversation" | "<kind>Message": .. } }`
#[derive(Debug, Deserialize)]
struct Keyed {
    #[serde(deserialize_with = "null_as_default")]
    key: MessageKey,
    #[serde(default, rename = "pushName", deserialize_with = "null_as_default")]
    push_name: String,
    #[serde(default, rename = "messageType", deserialize_with = "null_as_default")]
    message_type: String,
    #[serde(default)]
    message: Value,
}

/// Message fields after alias resolution, before identity extraction.
#[derive(Debug, Default)]
struct Candidate {
    chat_address: String,
    sender_address: String,
    sender_name: String,
    message_type: String,
    content: String,
    message_id: String,
    is_echo: bool,
}

impl Candidate {
    fn has_address(&self) -> bool {
        !self.chat_address.is_empty() || !self.sender_address.is_empty()
    }
}

impl WireMessage {
    fn resolve(self) -> Candidate {
        let chat_address = first_non_empty([&self.chatid, &self.chat_id]);
        let message_id = if !self.messageid.is_empty() {
            self.messageid.clone()
        } else if !self.message_id.is_empty() {
            self.message_id.clone()
        } else {
            strip_owner_prefix(&self.id).to_string()
        };
        let content = self
            .content
            .as_ref()
            .and_then(content_text)
            .or_else(|| self.text.clone().filter(|t| !t.is_empty()))
            .or_else(|| Some(self.button_or_list_id.clone()).filter(|b| !b.is_empty()))
            .unwrap_or_default();
        let message_type = first_non_empty([&self.message_type, &self.type_name]);
        Candidate {
            chat_address,
            sender_address: self.sender,
            sender_name: self.sender_name,
            message_type,
            content,
            message_id,
            is_echo: self.from_me || self.was_sent_by_api,
        }
    }
}

fn first_non_empty<const N: usize>(values: [&String; N]) -> String {
    values
        .iter()
        .find(|v| !v.trim().is_empty())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// `owner:ABC123` → `ABC123`.
fn strip_owner_prefix(id: &str) -> &str {
    match id.split_once(':') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => id,
    }
}

/// Content may be a plain string or an object carrying text/caption.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["text", "caption", "conversation"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

type ShapeAttempt = fn(&Value) -> Option<Candidate>;

/// Prioritized shape attempts; each is independent and short-circuits on the first usable result.
const SHAPES: [(&str, ShapeAttempt); 4] = [
    ("envelope", try_envelope),
    ("wrapped", try_wrapped),
    ("keyed", try_keyed),
    ("bare", try_bare),
];

fn try_envelope(value: &Value) -> Option<Candidate> {
    let env: Envelope = serde_json::from_value(value.clone()).ok()?;
    let chat = env.body.chat;
    let mut c = env.body.message.resolve();
    if c.chat_address.is_empty() {
        c.chat_address = first_non_empty([&chat.wa_chatid, &chat.wa_last_message_sender]);
    }
    Some(c).filter(Candidate::has_address)
}

fn try_wrapped(value: &Value) -> Option<Candidate> {
    let w: Wrapped = serde_json::from_value(value.clone()).ok()?;
    Some(w.message.resolve()).filter(Candidate::has_address)
}

fn try_keyed(value: &Value) -> Option<Candidate> {
    let k: Keyed = serde_json::from_value(value.clone()).ok()?;
    let (message_type, content) = keyed_message_body(&k.message);
    let c = Candidate {
        chat_address: k.key.remote_jid.trim().to_string(),
        sender_address: String::new(),
        sender_name: k.push_name,
        message_type: if k.message_type.is_empty() {
            message_type
        } else {
            k.message_type
        },
        content,
        message_id: k.key.id,
        is_echo: k.key.from_me,
    };
    Some(c).filter(Candidate::has_address)
}

/// Keyed payloads nest the body as `{ "conversation": ".." }` or `{ "<kind>Message": {..} }`.
fn keyed_message_body(message: &Value) -> (String, String) {
    let Some(map) = message.as_object() else {
        return (String::new(), String::new());
    };
    if let Some(text) = map.get("conversation").and_then(Value::as_str) {
        return ("conversation".to_string(), text.to_string());
    }
    for (key, body) in map {
        if key.ends_with("Message") {
            return (key.clone(), content_text(body).unwrap_or_default());
        }
    }
    (String::new(), String::new())
}

fn try_bare(value: &Value) -> Option<Candidate> {
    let m: WireMessage = serde_json::from_value(value.clone()).ok()?;
    Some(m.resolve()).filter(Candidate::has_address)
}

/// Strip a direct-chat address to its numeric identity. Group, broadcast and channel addresses
/// are rejected.
pub fn sender_id_from_address(address: &str) -> Option<String> {
    DIRECT_ADDRESS
        .captures(address.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// First direct-chat identity found anywhere in `raw`.
fn scan_direct_identity(raw: &str) -> Option<String> {
    ANY_ADDRESS.captures_iter(raw).find_map(|c| {
        let full = c.get(0)?.as_str();
        sender_id_from_address(full)
    })
}

/// Normalize a raw webhook body into an InboundEvent.
pub fn normalize(raw: &[u8]) -> Result<InboundEvent, NormalizeError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();

    let candidate = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
            let value = match value {
                Value::Array(items) if !items.is_empty() => {
                    items.into_iter().next().unwrap_or_default()
                }
                other => other,
            };
            SHAPES.iter().find_map(|(name, attempt)| {
                let c = attempt(&value)?;
                log::debug!("normalize: matched {} payload shape", name);
                Some(c)
            })
        }
        Err(_) => None,
    };

    let candidate = match candidate {
        Some(c) => c,
        None => {
            let Some(found) = ANY_ADDRESS.find(trimmed) else {
                return Err(NormalizeError::Parse);
            };
            log::debug!("normalize: no structured shape matched, using scanned address");
            Candidate {
                chat_address: found.as_str().to_string(),
                ..Candidate::default()
            }
        }
    };

    let sender_id = sender_id_from_address(&candidate.chat_address)
        .or_else(|| sender_id_from_address(&candidate.sender_address))
        .or_else(|| scan_direct_identity(trimmed));
    let sender_id = match sender_id {
        Some(id) => id,
        None if candidate.is_echo => String::new(),
        None => return Err(NormalizeError::Identity(candidate.chat_address)),
    };

    let kind = MessageKind::from_gateway_type(&candidate.message_type).unwrap_or(MessageKind::Text);
    Ok(InboundEvent {
        sender_id,
        sender_display_name: Some(candidate.sender_name).filter(|n| !n.trim().is_empty()),
        kind,
        raw_type: candidate.message_type,
        raw_content: candidate.content,
        external_message_id: Some(candidate.message_id).filter(|id| !id.is_empty()),
        is_echo: candidate.is_echo,
    })
}
