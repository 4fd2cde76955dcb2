//! Server configuration

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Media server configuration, built once at startup and shared by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// PEM certificate used for DTLS (generated when unset)
    pub certificate_path: Option<PathBuf>,
    /// PEM private key matching `certificate_path`
    pub key_path: Option<PathBuf>,
    /// Audio codecs accepted in offers, as `name/clockrate`
    pub audio_supported_codecs: Vec<String>,
    /// Video codecs accepted in offers, as `name/clockrate`
    pub video_supported_codecs: Vec<String>,
    /// RTP header extension URIs kept in answers
    pub supported_header_extensions: Vec<String>,
    /// Public address advertised as a server-reflexive candidate
    pub public_ip: Option<IpAddr>,
    /// Address advertised as the host candidate (detected when unset)
    pub host_ip: Option<IpAddr>,
    /// Address media sockets bind to
    pub bind_ip: IpAddr,
    /// Debounce before the first NACK for a detected gap
    pub nack_wait_time_ms: u64,
    /// Interval between NACK retries for still-missing packets
    pub nack_retry_interval_ms: u64,
    /// Accept offers without a DTLS fingerprint and exchange plain RTP
    pub disable_webrtc_encryption: bool,
    /// Append DTLS master secrets to `key_log_output_path`
    pub output_dtls_secrets: bool,
    pub key_log_output_path: PathBuf,
    /// WebSocket signalling listen address
    pub signalling_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            certificate_path: None,
            key_path: None,
            audio_supported_codecs: vec!["opus/48000".into()],
            video_supported_codecs: vec!["VP8/90000".into()],
            supported_header_extensions: vec!["urn:ietf:params:rtp-hdrext:sdes:mid".into()],
            public_ip: None,
            host_ip: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            nack_wait_time_ms: 0,
            nack_retry_interval_ms: 50,
            disable_webrtc_encryption: false,
            output_dtls_secrets: false,
            key_log_output_path: PathBuf::from("keylog.log"),
            signalling_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
        }
    }
}

impl ServerConfig {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("org", "sfu", "sfu").context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location yields the built-in defaults; an
    /// explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = Self::default_path()?;
                if !p.exists() {
                    tracing::debug!("No config at {}, using defaults", p.display());
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid config")
    }

    /// Write this configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).context("Failed to create config directory")?;
            }
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn nack_wait(&self) -> Duration {
        Duration::from_millis(self.nack_wait_time_ms)
    }

    pub fn nack_retry_interval(&self) -> Duration {
        Duration::from_millis(self.nack_retry_interval_ms)
    }

    /// Codec list for an SDP media type (`audio`/`video`).
    pub fn supported_codecs(&self, media_type: &str) -> &[String] {
        match media_type {
            "audio" => &self.audio_supported_codecs,
            "video" => &self.video_supported_codecs,
            _ => &[],
        }
    }
}
