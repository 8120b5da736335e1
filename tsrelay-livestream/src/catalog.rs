//! Channel catalog collaborator.
//!
//! The relay asks the catalog which upstream to pull for a channel, which
//! alternates to fail over to, and tells it when a channel's allocation can be
//! released. `StaticCatalog` serves these from configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, info, warn};
use tsrelay_core::config::{CatalogConfig, ChannelConfig, ProfileConfig, StreamConfig};

use crate::error::{RelayError, RelayResult};

pub const PROXY_PROFILE: &str = "Proxy";
pub const REDIRECT_PROFILE: &str = "Redirect";

/// How a channel's upstream reaches clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryProfile {
    /// Pull the upstream over HTTP and relay it.
    Proxy,
    /// Answer clients with a redirect to the upstream; nothing is relayed.
    Redirect,
    /// Run an external command and relay its stdout.
    Command {
        name: String,
        command: String,
        parameters: String,
    },
}

impl DeliveryProfile {
    #[must_use]
    pub fn from_config(profile: &ProfileConfig) -> Self {
        match profile.name.as_str() {
            PROXY_PROFILE => Self::Proxy,
            REDIRECT_PROFILE => Self::Redirect,
            _ => Self::Command {
                name: profile.name.clone(),
                command: profile.command.clone(),
                parameters: profile.parameters.clone(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Proxy => PROXY_PROFILE,
            Self::Redirect => REDIRECT_PROFILE,
            Self::Command { name, .. } => name,
        }
    }

    /// Program and arguments for a command profile, with `{streamUrl}` and
    /// `{userAgent}` substituted per argument.
    #[must_use]
    pub fn build_command(&self, url: &str, user_agent: &str) -> Option<(String, Vec<String>)> {
        let Self::Command {
            command,
            parameters,
            ..
        } = self
        else {
            return None;
        };
        let args = parameters
            .split_whitespace()
            .map(|arg| {
                arg.replace("{streamUrl}", url)
                    .replace("{userAgent}", user_agent)
            })
            .collect();
        Some((command.clone(), args))
    }
}

/// A concrete upstream to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub stream_id: Option<i64>,
    pub url: String,
    pub user_agent: String,
    pub profile: DeliveryProfile,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Pick the stream a channel should play and allocate it.
    async fn resolve(&self, channel_id: &str) -> RelayResult<StreamSource>;

    /// Other streams for the channel in catalog order, excluding `current`.
    async fn alternates(&self, channel_id: &str, current: Option<i64>) -> RelayResult<Vec<StreamSource>>;

    fn profile_by_name(&self, name: &str) -> Option<DeliveryProfile>;

    /// Release the channel's allocation. Returns false if nothing was allocated.
    async fn release(&self, channel_id: &str) -> RelayResult<bool>;
}

/// Apply a stream's regex search/replace to its URL.
///
/// `$1`-style backreferences are accepted. An invalid pattern leaves the URL
/// untouched.
#[must_use]
pub fn transform_url(url: &str, search: &str, replace: &str) -> String {
    let pattern = match Regex::new(search) {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, pattern = search, "Invalid URL search pattern, using URL as-is");
            return url.to_string();
        }
    };
    // `$1abc` would name group "1abc"; brace numeric groups
    let braced = match Regex::new(r"\$(\d+)") {
        Ok(re) => re.replace_all(replace, "$${${1}}").into_owned(),
        Err(_) => replace.to_string(),
    };
    pattern.replace_all(url, braced.as_str()).into_owned()
}

/// Catalog backed by configuration records.
pub struct StaticCatalog {
    channels: HashMap<String, ChannelConfig>,
    profiles: HashMap<String, DeliveryProfile>,
    default_profile: String,
    default_user_agent: String,
    allocations: DashMap<String, Option<i64>>,
    releases: AtomicU64,
}

impl StaticCatalog {
    #[must_use]
    pub fn new(config: &CatalogConfig, default_user_agent: &str) -> Self {
        let mut profiles: HashMap<String, DeliveryProfile> = config
            .profiles
            .iter()
            .map(|p| (p.name.clone(), DeliveryProfile::from_config(p)))
            .collect();
        profiles.insert(PROXY_PROFILE.to_string(), DeliveryProfile::Proxy);
        profiles.insert(REDIRECT_PROFILE.to_string(), DeliveryProfile::Redirect);

        Self {
            channels: config
                .channels
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect(),
            profiles,
            default_profile: config
                .default_profile
                .clone()
                .unwrap_or_else(|| PROXY_PROFILE.to_string()),
            default_user_agent: default_user_agent.to_string(),
            allocations: DashMap::new(),
            releases: AtomicU64::new(0),
        }
    }

    /// Allocations actually released so far.
    #[must_use]
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    fn channel(&self, channel_id: &str) -> RelayResult<&ChannelConfig> {
        self.channels
            .get(channel_id)
            .ok_or_else(|| RelayError::NoStream(channel_id.to_string()))
    }

    fn channel_profile(&self, channel: &ChannelConfig) -> RelayResult<DeliveryProfile> {
        let name = channel.profile.as_deref().unwrap_or(&self.default_profile);
        self.profile_by_name(name)
            .ok_or_else(|| RelayError::NoProfile(format!("{name} (channel {})", channel.id)))
    }

    fn source(&self, stream: &StreamConfig, profile: &DeliveryProfile) -> StreamSource {
        let url = match (&stream.search_pattern, &stream.replace_pattern) {
            (Some(search), Some(replace)) if !search.is_empty() => {
                transform_url(&stream.url, search, replace)
            }
            _ => stream.url.clone(),
        };
        StreamSource {
            stream_id: Some(stream.id),
            url,
            user_agent: stream
                .user_agent
                .clone()
                .filter(|ua| !ua.is_empty())
                .unwrap_or_else(|| self.default_user_agent.clone()),
            profile: profile.clone(),
        }
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn resolve(&self, channel_id: &str) -> RelayResult<StreamSource> {
        let channel = self.channel(channel_id)?;
        let stream = channel
            .streams
            .iter()
            .find(|s| !s.url.is_empty())
            .ok_or_else(|| RelayError::NoStream(channel_id.to_string()))?;
        let profile = self.channel_profile(channel)?;
        let source = self.source(stream, &profile);

        self.allocations.insert(channel_id.to_string(), source.stream_id);
        debug!(channel_id, stream_id = ?source.stream_id, profile = profile.name(), "Resolved stream");
        Ok(source)
    }

    async fn alternates(&self, channel_id: &str, current: Option<i64>) -> RelayResult<Vec<StreamSource>> {
        let channel = self.channel(channel_id)?;
        let profile = self.channel_profile(channel)?;
        Ok(channel
            .streams
            .iter()
            .filter(|s| !s.url.is_empty() && Some(s.id) != current)
            .map(|s| self.source(s, &profile))
            .collect())
    }

    fn profile_by_name(&self, name: &str) -> Option<DeliveryProfile> {
        self.profiles.get(name).cloned()
    }

    async fn release(&self, channel_id: &str) -> RelayResult<bool> {
        let released = self.allocations.remove(channel_id).is_some();
        if released {
            self.releases.fetch_add(1, Ordering::SeqCst);
            info!(channel_id, "Released stream allocation");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: i64, url: &str) -> StreamConfig {
        StreamConfig {
            id,
            url: url.to_string(),
            ..StreamConfig::default()
        }
    }

    fn catalog() -> StaticCatalog {
        let config = CatalogConfig {
            default_profile: None,
            profiles: vec![ProfileConfig {
                name: "ffmpeg".to_string(),
                command: "ffmpeg".to_string(),
                parameters: "-user_agent {userAgent} -i {streamUrl} -c copy -f mpegts pipe:1"
                    .to_string(),
            }],
            channels: vec![
                ChannelConfig {
                    id: "news".to_string(),
                    streams: vec![stream(1, "http://a/1.ts"), stream(2, "http://b/2.ts"), stream(3, "http://c/3.ts")],
                    ..ChannelConfig::default()
                },
                ChannelConfig {
                    id: "film".to_string(),
                    profile: Some("ffmpeg".to_string()),
                    streams: vec![stream(9, "http://f/9.ts")],
                    ..ChannelConfig::default()
                },
                ChannelConfig {
                    id: "empty".to_string(),
                    ..ChannelConfig::default()
                },
            ],
        };
        StaticCatalog::new(&config, "VLC/3.0.20 LibVLC/3.0.20")
    }

    #[test]
    fn test_transform_url() {
        assert_eq!(
            transform_url("http://host/live/123.ts", r"live/(\d+)\.ts", "hls/$1abc.m3u8"),
            "http://host/hls/123abc.m3u8"
        );
        assert_eq!(transform_url("http://x", "(", "y"), "http://x");
    }

    #[test]
    fn test_build_command() {
        let profile = catalog().profile_by_name("ffmpeg").unwrap();
        let (program, args) = profile.build_command("http://u/1.ts", "VLC").unwrap();
        assert_eq!(program, "ffmpeg");
        assert_eq!(args[1], "VLC");
        assert_eq!(args[3], "http://u/1.ts");
        assert!(DeliveryProfile::Proxy.build_command("u", "a").is_none());
    }

    #[tokio::test]
    async fn test_resolve_and_alternates() {
        let catalog = catalog();
        let source = catalog.resolve("news").await.unwrap();
        assert_eq!(source.stream_id, Some(1));
        assert_eq!(source.user_agent, "VLC/3.0.20 LibVLC/3.0.20");
        assert_eq!(source.profile, DeliveryProfile::Proxy);

        let alternates = catalog.alternates("news", Some(2)).await.unwrap();
        let ids: Vec<_> = alternates.iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec![Some(1), Some(3)]);

        let film = catalog.resolve("film").await.unwrap();
        assert_eq!(film.profile.name(), "ffmpeg");
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let catalog = catalog();
        assert!(matches!(catalog.resolve("missing").await, Err(RelayError::NoStream(_))));
        assert!(matches!(catalog.resolve("empty").await, Err(RelayError::NoStream(_))));
    }

    #[tokio::test]
    async fn test_release_once() {
        let catalog = catalog();
        catalog.resolve("news").await.unwrap();
        assert!(catalog.release("news").await.unwrap());
        assert!(!catalog.release("news").await.unwrap());
        assert_eq!(catalog.release_count(), 1);
    }
}
