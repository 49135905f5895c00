//! SMS transport over a simple HTTP gateway.
//!
//! `poll` fetches inbound messages strictly after a monotonic id;
//! `send` posts outbound text, chunked on whitespace so no single SMS
//! exceeds the configured size. The peer is assumed pre-bound — there is
//! no authentication beyond the gateway's own.

use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use foreman_config::SmsConfig;
use foreman_core::{InboundSms, SmsTransport};

#[derive(Debug, Deserialize)]
struct InboundPayload {
    messages: Vec<InboundMessage>,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    id: i64,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    to: &'a str,
    from: &'a str,
    text: &'a str,
}

pub struct HttpSmsGateway {
    client: Client,
    config: SmsConfig,
}

impl HttpSmsGateway {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SmsTransport for HttpSmsGateway {
    async fn poll(&self, last_id: i64) -> Result<Vec<InboundSms>> {
        let url = format!(
            "{}/messages",
            self.config.gateway_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(url)
            .query(&[("after", last_id.to_string()), ("to", self.config.from_number.clone())])
            .send()
            .await?
            .error_for_status()?;

        let payload: InboundPayload = response.json().await?;
        let mut messages: Vec<InboundSms> = payload
            .messages
            .into_iter()
            .filter(|m| m.id > last_id)
            .map(|m| InboundSms { id: m.id, text: m.text })
            .collect();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/send", self.config.gateway_url.trim_end_matches('/'));
        for chunk in chunk_message(text, self.config.max_chunk) {
            debug!(len = chunk.len(), "sending sms chunk");
            let body = OutboundMessage {
                to: &self.config.to_number,
                from: &self.config.from_number,
                text: &chunk,
            };
            let response = self.client.post(&url).json(&body).send().await?;
            if !response.status().is_success() {
                bail!("sms gateway returned {}", response.status());
            }
        }
        Ok(())
    }
}

/// Split on whitespace boundaries so no chunk exceeds `max_len`. A single
/// overlong word is hard-split rather than dropped.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = vec![];
    let mut current = String::new();
    for word in text.split_inclusive(char::is_whitespace) {
        if current.len() + word.len() > max_len && !current.is_empty() {
            chunks.push(current.trim_end().to_string());
            current = String::new();
        }
        if word.len() > max_len {
            let mut rest = word;
            while rest.len() > max_len {
                let mut cut = max_len;
                while cut > 0 && !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(word);
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    chunks
}
