//! Relay process launcher
//!
//! Builds the `puller | transcoder` shell pipeline that pulls a remote stream
//! and serves an audio-only transcode over HTTP on a local port.

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::RelayConfig;
use crate::error::Result;
use crate::metadata::QualityVariant;
use crate::process::{RelayHandle, RelayProcess};

/// Starts relays for a selected source
#[async_trait]
pub trait RelayLauncher: Send + Sync {
    /// Start a relay of `source` served on `port`
    ///
    /// Returns once the relay has been started, not once it serves data.
    async fn launch(&self, source: &QualityVariant, port: u16) -> Result<Box<dyn RelayHandle>>;
}

/// Launches relays as `bash -c "<puller> | <transcoder>"`
pub struct CommandLauncher {
    config: RelayConfig,
}

impl CommandLauncher {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Shell pipeline for relaying `source` on `port`
    pub fn pipeline(&self, source: &QualityVariant, port: u16) -> String {
        let cfg = &self.config;

        let puller = format!(
            "{} --live -r {} -W {} -p {} --jtv {} --playpath {} --quiet --flv -",
            shell_quote(&cfg.puller),
            shell_quote(&source.connect),
            shell_quote(&cfg.swf_url),
            shell_quote(&cfg.page_url),
            shell_quote(&source.token),
            shell_quote(&source.play),
        );

        let sout = format!(
            "#transcode{{vcodec=none,acodec={},ab={}k}}:standard{{access=http,mux={},dst=:{}}}",
            cfg.audio_codec, cfg.audio_bitrate_kbps, cfg.mux, port
        );
        let transcoder = format!(
            "{} --intf=dummy --play-and-exit --rc-fake-tty -vvv - --sout {}",
            shell_quote(&cfg.transcoder),
            shell_quote(&sout),
        );

        format!("{} | {}", puller, transcoder)
    }
}

#[async_trait]
impl RelayLauncher for CommandLauncher {
    async fn launch(&self, source: &QualityVariant, port: u16) -> Result<Box<dyn RelayHandle>> {
        let mut command = Command::new(&self.config.shell);
        command.arg("-c").arg(self.pipeline(source, port));

        tracing::info!(port, play = %source.play, bitrate = ?source.bitrate, "Starting relay");
        let relay = RelayProcess::spawn(command)?;
        Ok(Box::new(relay))
    }
}

/// Quote `value` as a single POSIX shell word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    fn source() -> QualityVariant {
        QualityVariant {
            play: "live_1234_abc".to_string(),
            token: "{\"chansub\":\"x\"}".to_string(),
            connect: "rtmp://199.9.255.1/app".to_string(),
            bitrate: Some(1200.0),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_pipeline_shape() {
        let launcher = CommandLauncher::new(RelayConfig::default());
        let cmd = launcher.pipeline(&source(), 6001);

        assert!(cmd.starts_with("'rtmpdump' --live -r 'rtmp://199.9.255.1/app'"));
        assert!(cmd.contains("--jtv '{\"chansub\":\"x\"}'"));
        assert!(cmd.contains("--playpath 'live_1234_abc'"));
        assert!(cmd.contains(" | 'vlc' --intf=dummy --play-and-exit"));
        assert!(cmd.contains(
            "'#transcode{vcodec=none,acodec=mp3,ab=72k}:standard{access=http,mux=ts,dst=:6001}'"
        ));
    }

    #[test]
    fn test_pipeline_quotes_hostile_upstream_values() {
        let launcher = CommandLauncher::new(RelayConfig::default());
        let mut hostile = source();
        hostile.token = "x'; rm -rf / #".to_string();

        let cmd = launcher.pipeline(&hostile, 6001);
        assert!(cmd.contains(r"--jtv 'x'\''; rm -rf / #'"));
    }

    #[tokio::test]
    async fn test_launch_runs_configured_shell() {
        // `true` ignores the pipeline and exits, standing in for a relay
        let config = RelayConfig {
            shell: "true".to_string(),
            ..RelayConfig::default()
        };
        let relay = CommandLauncher::new(config)
            .launch(&source(), 6001)
            .await
            .unwrap();
        assert!(relay.pid().is_some());
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let config = RelayConfig {
            shell: "/nonexistent/shell".to_string(),
            ..RelayConfig::default()
        };
        let err = CommandLauncher::new(config)
            .launch(&source(), 6001)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ProcessLaunch(_)));
    }
}
