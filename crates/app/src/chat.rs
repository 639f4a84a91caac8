//! Chat lines carried as application payloads

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tether_net::{Device, Envelope};

/// One line of chat as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        Ok(Envelope::text(serde_json::to_string(self)?))
    }

    /// Read a chat line back out of an envelope.
    ///
    /// Plain text from other applications is accepted as-is and stamped
    /// with the receive time. Binary payloads are not chat.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let text = envelope.payload()?.as_text()?;
        match serde_json::from_str(text) {
            Ok(line) => Some(line),
            Err(_) => Some(Self::new(text)),
        }
    }

    /// `[12:04:31] alice: hello`
    pub fn render(&self, sender: Option<&Device>) -> String {
        let name = sender.map_or("?", |d| d.name.as_str());
        let at = self.sent_at.with_timezone(&Local).format("%H:%M:%S");
        format!("[{}] {}: {}", at, name, self.text)
    }
}

/// What the user typed
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Say(String),
    Who,
    Quit,
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => Input::Empty,
            "/who" => Input::Who,
            "/quit" | "/exit" => Input::Quit,
            text => Input::Say(text.to_string()),
        }
    }
}

/// Roster listing for `/who`
pub fn render_roster(owner: Option<&Device>, peers: &[Device]) -> String {
    let mut out = String::new();
    if let Some(owner) = owner {
        out.push_str(&format!("  {} (owner)\n", owner.name));
    }
    for peer in peers {
        out.push_str(&format!("  {}\n", peer.name));
    }
    if out.is_empty() {
        out.push_str("  nobody else here\n");
    }
    out
}
