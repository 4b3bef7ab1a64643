//! Configuration types for the eyelink binary.
//! Parsed from ~/.eyelink/config.toml.

use eyelink_protocol::PROFILE_0;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::client::{DiscoveryConfig, EyeClientConfig};
use crate::discovery::DiscoverySettings;
use crate::eye::EyeSettings;
use crate::heartbeat::HeartbeatConfig;
use crate::local_addr;
use crate::server::ThumbnailPolling;
use crate::vision::CommandProvider;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub eye: EyeSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub vision: VisionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Where the discovery service listens for REGISTER_EYE broadcasts.
    #[serde(default = "default_discovery_bind")]
    pub discovery_bind: String,
    /// Address control and data ports are bound on.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// IP sent to eyes in REGISTER_EYE_ACK. Detected when unset.
    pub advertise_ip: Option<String>,
    #[serde(default = "default_first_control_port")]
    pub first_control_port: u16,
    /// Request a thumbnail from every eye this often. 0 disables polling.
    #[serde(default = "default_thumbnail_interval")]
    pub thumbnail_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            discovery_bind: default_discovery_bind(),
            bind_ip: default_bind_ip(),
            advertise_ip: None,
            first_control_port: default_first_control_port(),
            thumbnail_interval_secs: default_thumbnail_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EyeSection {
    /// Stable name the eye registers under. Overridden by `--name`.
    pub name: Option<String>,
    /// Destination of REGISTER_EYE broadcasts.
    #[serde(default = "default_discovery_target")]
    pub discovery_target: String,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_secs: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
}

impl Default for EyeSection {
    fn default() -> Self {
        Self {
            name: None,
            discovery_target: default_discovery_target(),
            retry_count: default_retry_count(),
            recv_timeout_secs: default_recv_timeout(),
            error_backoff_secs: default_error_backoff(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    /// Delay before the first ping. Defaults to `interval_secs`.
    pub grace_secs: Option<u64>,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_heartbeat_timeout(),
            interval_secs: default_heartbeat_interval(),
            grace_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionSection {
    /// Seconds an unanswered vision request keeps the eye busy.
    #[serde(default = "default_vision_timeout")]
    pub request_timeout_secs: u64,
    /// Eye side: program that captures a picture and writes it to the
    /// server's data port. Arguments support {width} {height} {host} {port}.
    pub picture_command: Option<Vec<String>>,
    /// Eye side: program that streams video to the server's data port.
    /// Arguments additionally support {length} and {framerate}.
    pub stream_command: Option<Vec<String>>,
}

impl Default for VisionSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_vision_timeout(),
            picture_command: None,
            stream_command: None,
        }
    }
}

// Default value functions
fn default_discovery_bind() -> String {
    format!("0.0.0.0:{}", PROFILE_0.discovery_port)
}
fn default_bind_ip() -> String {
    "0.0.0.0".into()
}
fn default_first_control_port() -> u16 {
    PROFILE_0.first_control_port
}
fn default_thumbnail_interval() -> u64 {
    60
}
fn default_discovery_target() -> String {
    format!("255.255.255.255:{}", PROFILE_0.discovery_port)
}
fn default_retry_count() -> u32 {
    PROFILE_0.discovery_retry_count
}
fn default_recv_timeout() -> u64 {
    PROFILE_0.discovery_recv_timeout_secs
}
fn default_error_backoff() -> u64 {
    PROFILE_0.discovery_error_backoff_secs
}
fn default_heartbeat_timeout() -> u64 {
    PROFILE_0.heartbeat_timeout_secs
}
fn default_heartbeat_interval() -> u64 {
    PROFILE_0.heartbeat_interval_secs
}
fn default_write_timeout() -> u64 {
    PROFILE_0.write_timeout_secs
}
fn default_reconnect_delay() -> u64 {
    2
}
fn default_vision_timeout() -> u64 {
    30
}

impl NodeConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        let h = &self.heartbeat;
        HeartbeatConfig {
            timeout: Duration::from_secs(h.timeout_secs),
            interval: Duration::from_secs(h.interval_secs),
            grace: Duration::from_secs(h.grace_secs.unwrap_or(h.interval_secs)),
        }
    }

    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            write_timeout: Duration::from_secs(self.channel.write_timeout_secs),
            reconnect_delay: Duration::from_secs(self.channel.reconnect_delay_secs),
            ..ChannelConfig::default()
        }
    }

    pub fn discovery(&self) -> anyhow::Result<DiscoveryConfig> {
        Ok(DiscoveryConfig {
            target: self.eye.discovery_target.parse()?,
            retry_count: self.eye.retry_count,
            recv_timeout: Duration::from_secs(self.eye.recv_timeout_secs),
            error_backoff: Duration::from_secs(self.eye.error_backoff_secs),
        })
    }

    pub fn discovery_bind(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.discovery_bind.parse()?)
    }

    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        Ok(self.server.bind_ip.parse()?)
    }

    pub fn advertise_ip(&self) -> anyhow::Result<Option<IpAddr>> {
        match &self.server.advertise_ip {
            Some(ip) => Ok(Some(ip.parse()?)),
            None => Ok(None),
        }
    }

    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision.request_timeout_secs)
    }

    pub fn eye_settings(&self) -> anyhow::Result<EyeSettings> {
        Ok(EyeSettings {
            bind_ip: self.bind_ip()?,
            channel: self.channel(),
            heartbeat: self.heartbeat(),
            vision_timeout: self.vision_timeout(),
        })
    }

    /// Server role settings, with the advertised IP resolved.
    pub fn discovery_settings(&self) -> anyhow::Result<DiscoverySettings> {
        let bind_ip = self.bind_ip()?;
        Ok(DiscoverySettings {
            bind: self.discovery_bind()?,
            first_control_port: self.server.first_control_port,
            advertise_ip: local_addr::advertise_ip(self.advertise_ip()?, bind_ip),
            eye: self.eye_settings()?,
        })
    }

    /// Polling settings, or None when `thumbnail_interval_secs` is 0.
    pub fn thumbnail_polling(&self) -> Option<ThumbnailPolling> {
        match self.server.thumbnail_interval_secs {
            0 => None,
            secs => Some(ThumbnailPolling::every(
                Duration::from_secs(secs),
                self.vision_timeout(),
            )),
        }
    }

    /// Eye role settings. `name` overrides `eye.name`; one of them is required.
    pub fn eye_client(&self, name: Option<String>) -> anyhow::Result<EyeClientConfig> {
        let name = name
            .or_else(|| self.eye.name.clone())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| anyhow::anyhow!("eye name not set (use --name or [eye] name)"))?;
        Ok(EyeClientConfig {
            name,
            discovery: self.discovery()?,
            channel: self.channel(),
            heartbeat: self.heartbeat(),
        })
    }

    pub fn vision_provider(&self) -> CommandProvider {
        CommandProvider::new(
            self.vision.picture_command.clone(),
            self.vision.stream_command.clone(),
        )
    }
}
