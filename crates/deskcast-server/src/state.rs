use crate::rtc::RtcEngine;
use crate::ws::connections::ConnectionManager;
use deskcast_media::CaptureSettings;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    /// Concurrent viewer connections accepted; each one runs its own encoder
    pub max_viewers: usize,
    pub signaling: SignalingConfig,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Hold the offer until ICE gathering finishes so it carries host candidates.
    /// The viewer never receives trickled candidates from the server.
    pub gather_before_offer: bool,
    pub gather_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    /// Replaces the generated ffmpeg arguments entirely when set
    pub args: Option<Vec<String>>,
    pub input_format: Option<String>,
    pub input: Option<String>,
    pub video_size: String,
    pub bitrate: String,
    pub threads: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_viewers: 1,
            signaling: SignalingConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            gather_before_offer: true,
            gather_timeout_ms: 3000,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let capture = CaptureSettings::default();
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            input_format: None,
            input: None,
            video_size: capture.video_size,
            bitrate: capture.bitrate,
            threads: capture.threads,
        }
    }
}

impl EncoderConfig {
    pub fn capture_settings(&self) -> CaptureSettings {
        let mut capture = CaptureSettings::default();
        if let Some(input_format) = &self.input_format {
            capture.input_format = input_format.clone();
        }
        if let Some(input) = &self.input {
            capture.input = input.clone();
        }
        capture.video_size = self.video_size.clone();
        capture.bitrate = self.bitrate.clone();
        capture.threads = self.threads;
        capture
    }

    /// Arguments the encoder process is started with
    pub fn command_args(&self) -> Vec<String> {
        match &self.args {
            Some(args) => args.clone(),
            None => self.capture_settings().ffmpeg_args(),
        }
    }
}

impl Config {
    /// Load from `deskcast.{toml,yaml,json}` if present, then `DESKCAST_*` environment
    /// variables (`__` separates nested keys, e.g. `DESKCAST_ENCODER__PROGRAM`).
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("deskcast").required(false))
            .add_source(
                config::Environment::with_prefix("DESKCAST")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("encoder.args"),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> anyhow::Result<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_viewers == 0 {
            anyhow::bail!("max_viewers must be at least 1");
        }
        if self.encoder.program.trim().is_empty() {
            anyhow::bail!("encoder.program must not be empty");
        }
        if self.bind_address.trim().is_empty() {
            anyhow::bail!("bind_address must not be empty");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub rtc: Arc<RtcEngine>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let rtc = Arc::new(RtcEngine::new()?);
        let connections = Arc::new(ConnectionManager::new());

        Ok(Self {
            config,
            rtc,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn from_toml(toml: &str) -> anyhow::Result<Config> {
        Config::from_builder(
            config::Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("").unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.max_viewers, 1);
        assert!(config.signaling.gather_before_offer);
        assert_eq!(config.encoder.program, "ffmpeg");
        assert!(config.encoder.command_args().contains(&"libvpx".to_string()));
    }

    #[test]
    fn test_nested_overrides() {
        let config = from_toml(
            r#"
            bind_address = "127.0.0.1:9000"
            max_viewers = 3

            [signaling]
            gather_before_offer = false

            [encoder]
            input_format = "x11grab"
            input = ":1"
            video_size = "1280x720"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.max_viewers, 3);
        assert!(!config.signaling.gather_before_offer);
        assert_eq!(config.signaling.gather_timeout_ms, 3000);

        let args = config.encoder.command_args();
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "x11grab"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == ":1"));
        assert!(args.windows(2).any(|w| w[0] == "-video_size" && w[1] == "1280x720"));
    }

    #[test]
    fn test_explicit_args_replace_generated_ones() {
        let config = from_toml(
            r#"
            [encoder]
            program = "cat"
            args = ["capture.ivf"]
            "#,
        )
        .unwrap();

        assert_eq!(config.encoder.program, "cat");
        assert_eq!(config.encoder.command_args(), vec!["capture.ivf".to_string()]);
    }

    #[test]
    fn test_rejects_zero_viewers() {
        assert!(from_toml("max_viewers = 0").is_err());
    }
}
