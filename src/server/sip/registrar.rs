//! Registration table
//!
//! Entries are keyed by Call-ID, not by address-of-record: a device that
//! re-registers with a fresh Call-ID gets a second, independent entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

/// A user agent that announced itself with REGISTER
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredAgent {
    /// Contact header as received
    pub contact: String,
    /// When the registration lapses. Not enforced unless sweeping is enabled.
    pub expires_at: DateTime<Utc>,
    pub call_id: String,
    /// Signaling source the REGISTER came from
    pub source: SocketAddr,
}

impl RegisteredAgent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub struct Registrar {
    /// Fixed validity window granted to every registration, in seconds
    expires: u32,
    agents: RwLock<HashMap<String, RegisteredAgent>>,
}

impl Registrar {
    pub fn new(expires: u32) -> Self {
        Self {
            expires,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    /// Store or replace the entry for `call_id`. Requested validity is ignored.
    pub async fn register(
        &self,
        call_id: &str,
        contact: &str,
        source: SocketAddr,
    ) -> RegisteredAgent {
        let agent = RegisteredAgent {
            contact: contact.to_string(),
            expires_at: Utc::now() + Duration::seconds(self.expires as i64),
            call_id: call_id.to_string(),
            source,
        };

        self.agents
            .write()
            .await
            .insert(call_id.to_string(), agent.clone());

        agent
    }

    pub async fn get(&self, call_id: &str) -> Option<RegisteredAgent> {
        self.agents.read().await.get(call_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Drop every entry whose validity has lapsed; returns how many went
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, agent| !agent.is_expired(now));
        before - agents.len()
    }
}
