//! Shared message model for RelayMQ.
//!
//! The wire envelope uses deliberately short JSON keys (`co`, `no`, `sg`, ...)
//! to keep broker payloads small. Consumers and publishers on other stacks
//! depend on these exact keys, so they are pinned here with serde renames and
//! covered by tests.

use serde::{Deserialize, Serialize};

pub mod crypto;
pub mod logging;

/// AMQP exchange kind for endpoint topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Topic,
    Headers,
    Fanout,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
            ExchangeType::Fanout => "fanout",
        }
    }
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message protection scheme.
///
/// `Plain` signs the content as-is; `Aes` encrypts the content with AES-GCM
/// under the signature key before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SignatureType {
    #[default]
    Plain,
    Aes,
}

impl From<SignatureType> for u8 {
    fn from(value: SignatureType) -> Self {
        match value {
            SignatureType::Plain => 0,
            SignatureType::Aes => 1,
        }
    }
}

impl TryFrom<u8> for SignatureType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SignatureType::Plain),
            1 => Ok(SignatureType::Aes),
            other => Err(format!("unknown signature type {other}")),
        }
    }
}

/// Dead-letter topology attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlxConfig {
    #[serde(rename = "ex")]
    pub exchange: String,
    #[serde(rename = "qe")]
    pub queue: String,
    #[serde(rename = "ru")]
    pub router: String,
}

fn default_confirm_timeout() -> u64 {
    30
}

/// Per-endpoint publishing options carried inside every message.
///
/// The signature key never leaves the process: it is skipped during
/// serialization and must be re-supplied on the consuming side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOptions {
    #[serde(rename = "ex")]
    pub exchange: String,
    #[serde(rename = "qe")]
    pub queue: String,
    #[serde(rename = "kd", default)]
    pub kind: ExchangeType,
    #[serde(rename = "ru", default)]
    pub router: String,
    #[serde(rename = "st", default)]
    pub sig_type: SignatureType,
    #[serde(skip)]
    pub sig_key: String,
    #[serde(rename = "du", default)]
    pub durable: bool,
    #[serde(rename = "ad", default)]
    pub auto_delete: bool,
    #[serde(rename = "ev", default)]
    pub exclusive: bool,
    #[serde(rename = "ut", default)]
    pub use_transaction: bool,
    /// Deadline in seconds for reconciling publisher confirms in batch mode.
    #[serde(rename = "ct", default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
    #[serde(rename = "dlx_config", default, skip_serializing_if = "Option::is_none")]
    pub dlx: Option<DlxConfig>,
}

impl MessageOptions {
    pub fn new(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            kind: ExchangeType::Direct,
            router: String::new(),
            sig_type: SignatureType::Plain,
            sig_key: String::new(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            use_transaction: false,
            confirm_timeout_secs: default_confirm_timeout(),
            dlx: None,
        }
    }

    pub fn with_router(mut self, router: impl Into<String>) -> Self {
        self.router = router.into();
        self
    }

    pub fn with_kind(mut self, kind: ExchangeType) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_signature(mut self, sig_type: SignatureType, key: impl Into<String>) -> Self {
        self.sig_type = sig_type;
        self.sig_key = key.into();
        self
    }

    pub fn with_transaction(mut self, use_transaction: bool) -> Self {
        self.use_transaction = use_transaction;
        self
    }

    pub fn with_dlx(mut self, dlx: DlxConfig) -> Self {
        self.dlx = Some(dlx);
        self
    }
}

/// The broker-facing message envelope.
///
/// `content` holds the application payload: plaintext for
/// [`SignatureType::Plain`], base64(nonce ‖ ciphertext) after AES-GCM
/// protection. The signature is hex HMAC-SHA256 over content ‖ nonce and is
/// always computed after any encryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "co")]
    pub content: String,
    #[serde(rename = "ty", default)]
    pub msg_type: i64,
    /// Delivery delay in seconds; 0 publishes immediately.
    #[serde(rename = "dy", default)]
    pub delay_secs: u64,
    #[serde(rename = "rt", default)]
    pub retries: u32,
    #[serde(rename = "pr", default)]
    pub priority: u8,
    #[serde(rename = "no", default)]
    pub nonce: String,
    #[serde(rename = "sg", default)]
    pub signature: String,
    /// Broker TTL in milliseconds, as a decimal string. Derived from
    /// `delay_secs` during preprocessing; empty means no expiration.
    #[serde(rename = "ex", default)]
    pub expiration: String,
    #[serde(rename = "op")]
    pub options: MessageOptions,
}

impl Message {
    pub fn new(options: MessageOptions, msg_type: i64, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            msg_type,
            delay_secs: 0,
            retries: 0,
            priority: 0,
            nonce: String::new(),
            signature: String::new(),
            expiration: String::new(),
            options,
        }
    }

    pub fn with_delay(mut self, delay_secs: u64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_keys_are_stable() {
        let mut options = MessageOptions::new("orders.ex", "orders.q").with_router("orders");
        options.sig_key = "super-secret".to_string();
        let msg = Message::new(options, 7, "hello").with_priority(3);

        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["co"], "hello");
        assert_eq!(value["ty"], 7);
        assert_eq!(value["pr"], 3);
        assert_eq!(value["dy"], 0);
        assert_eq!(value["op"]["ex"], "orders.ex");
        assert_eq!(value["op"]["qe"], "orders.q");
        assert_eq!(value["op"]["ru"], "orders");
        assert_eq!(value["op"]["kd"], "direct");
        assert_eq!(value["op"]["st"], 0);
        // The signature key must never be serialized.
        assert!(value["op"].get("sig_key").is_none());
        assert!(!serde_json::to_string(&msg).unwrap().contains("super-secret"));
    }

    #[test]
    fn test_dlx_config_round_trip() {
        let dlx = DlxConfig {
            exchange: "orders.dlx".to_string(),
            queue: "orders.dlq".to_string(),
            router: "dead".to_string(),
        };
        let options = MessageOptions::new("orders.ex", "orders.q").with_dlx(dlx.clone());
        let msg = Message::new(options, 1, "x");

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.options.dlx, Some(dlx));
    }

    #[test]
    fn test_dlx_absent_is_omitted() {
        let msg = Message::new(MessageOptions::new("e", "q"), 1, "x");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("dlx_config"));
    }

    #[test]
    fn test_signature_type_wire_format() {
        assert_eq!(u8::from(SignatureType::Plain), 0);
        assert_eq!(u8::from(SignatureType::Aes), 1);
        assert_eq!(SignatureType::try_from(1).unwrap(), SignatureType::Aes);
        assert!(SignatureType::try_from(2).is_err());
    }

    #[test]
    fn test_deserialize_minimal_envelope() {
        // Consumers must accept envelopes with optional fields omitted.
        let json = r#"{"co":"payload","op":{"ex":"e","qe":"q"}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.content, "payload");
        assert_eq!(msg.msg_type, 0);
        assert_eq!(msg.options.kind, ExchangeType::Direct);
        assert_eq!(msg.options.confirm_timeout_secs, 30);
        assert!(msg.nonce.is_empty());
    }

    #[test]
    fn test_exchange_type_serializes_lowercase() {
        for (kind, expected) in [
            (ExchangeType::Direct, "\"direct\""),
            (ExchangeType::Topic, "\"topic\""),
            (ExchangeType::Headers, "\"headers\""),
            (ExchangeType::Fanout, "\"fanout\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
            assert_eq!(kind.as_str(), expected.trim_matches('"'));
        }
    }
}
