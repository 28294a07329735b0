//! Proxy configuration synthesis.
//!
//! [`synthesize`] is a pure function of a registry snapshot, the public port
//! and the static [`ProxySettings`]. Each active account becomes one client
//! whose `email` is the account tag; that tag is what the stats counters are
//! keyed by, so it must stay in step with [`crate::stats::counter_name`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ProxySettings;
use crate::error::LifecycleError;
use crate::registry::RegistrySnapshot;

/// Service exposed on the stats API inbound.
pub const STATS_SERVICE: &str = "StatsService";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub log: LogSection,
    pub api: ApiSection,
    pub policy: PolicySection,
    pub routing: RoutingSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
    pub access: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    pub levels: BTreeMap<String, LevelPolicy>,
    pub system: SystemPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    pub stats_user_uplink: bool,
    pub stats_user_downlink: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSection {
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    pub inbound_tag: Vec<String>,
    pub outbound_tag: String,
    /// Optional domain matchers; omitted from the document when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    pub tag: String,
}

/// Inbound settings; vmess carries `clients`, dokodemo-door an `address`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundSettings {
    Clients { clients: Vec<Client> },
    Forward { address: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub alter_id: u32,
    pub email: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    pub ws_settings: WsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsSettings {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub tag: String,
}

impl ProxyConfig {
    /// Clients of the public inbound.
    #[must_use]
    pub fn clients(&self) -> &[Client] {
        self.inbounds
            .iter()
            .find_map(|inbound| match &inbound.settings {
                InboundSettings::Clients { clients } => Some(clients.as_slice()),
                InboundSettings::Forward { .. } => None,
            })
            .unwrap_or_default()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, LifecycleError> {
        serde_json::to_vec_pretty(self).map_err(|e| LifecycleError::Synthesis(e.to_string()))
    }
}

/// Build the proxy configuration for the active accounts in `snapshot`.
///
/// An empty active set still yields one client with a fresh random id so
/// the inbound stays valid.
#[must_use]
pub fn synthesize(snapshot: &RegistrySnapshot, port: u16, settings: &ProxySettings) -> ProxyConfig {
    let mut clients: Vec<Client> = snapshot
        .active()
        .into_iter()
        .map(|account| Client {
            id: account.id.clone(),
            alter_id: 0,
            email: account.tag(),
            level: settings.user_level,
        })
        .collect();

    if clients.is_empty() {
        let placeholder = Uuid::new_v4().to_string();
        clients.push(Client {
            email: crate::account::tag_for(&placeholder),
            id: placeholder,
            alter_id: 0,
            level: settings.user_level,
        });
    }

    let mut levels = BTreeMap::new();
    levels.insert(
        settings.user_level.to_string(),
        LevelPolicy {
            stats_user_uplink: true,
            stats_user_downlink: true,
        },
    );

    ProxyConfig {
        log: LogSection {
            loglevel: settings.log_level.clone(),
            access: settings.access_log.clone(),
            error: settings.error_log.clone(),
        },
        api: ApiSection {
            tag: settings.api_tag.clone(),
            services: vec![STATS_SERVICE.to_string()],
        },
        policy: PolicySection {
            levels,
            system: SystemPolicy {
                stats_inbound_uplink: false,
                stats_inbound_downlink: false,
            },
        },
        routing: RoutingSection {
            rules: vec![RoutingRule {
                kind: "field".to_string(),
                inbound_tag: vec![settings.api_tag.clone()],
                outbound_tag: settings.api_tag.clone(),
                domain: None,
                protocol: None,
            }],
        },
        inbounds: vec![
            Inbound {
                listen: None,
                port,
                protocol: settings.inbound_protocol.clone(),
                settings: InboundSettings::Clients { clients },
                stream_settings: Some(StreamSettings {
                    network: settings.network.clone(),
                    security: settings.security.clone(),
                    ws_settings: WsSettings {
                        path: settings.ws_path.clone(),
                    },
                }),
                tag: settings.inbound_tag.clone(),
            },
            Inbound {
                listen: Some(settings.api_listen.clone()),
                port: settings.api_port,
                protocol: "dokodemo-door".to_string(),
                settings: InboundSettings::Forward {
                    address: settings.api_listen.clone(),
                },
                stream_settings: None,
                tag: settings.api_tag.clone(),
            },
        ],
        outbounds: vec![
            Outbound {
                protocol: "freedom".to_string(),
                settings: serde_json::Map::new(),
                tag: settings.direct_outbound_tag.clone(),
            },
            Outbound {
                protocol: "blackhole".to_string(),
                settings: serde_json::Map::new(),
                tag: settings.api_tag.clone(),
            },
        ],
    }
}
