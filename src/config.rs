use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::coordinator::DEFAULT_TIMEOUT;
use crate::error::{Error, Result};

/// Termination signals that can be bound to a shutdown trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TermSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    UserDefined1,
    UserDefined2,
}

impl TermSignal {
    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::UserDefined1 => "SIGUSR1",
            Self::UserDefined2 => "SIGUSR2",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Maximum wait per stage, e.g. `500ms` or `5s`.
    #[serde(default = "ShutdownConfig::default_stage_timeout", with = "humantime_serde")]
    pub stage_timeout: Duration,
    /// Process exit code after a signal-triggered shutdown.
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default = "ShutdownConfig::default_signals")]
    pub signals: Vec<TermSignal>,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Self::default_stage_timeout(),
            exit_code: 0,
            signals: Self::default_signals(),
        }
    }
}

impl ShutdownConfig {
    const fn default_stage_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }

    fn default_signals() -> Vec<TermSignal> {
        vec![TermSignal::Interrupt, TermSignal::Terminate]
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_yaml_str(&data)
    }

    pub fn validated(self) -> Result<Self> {
        if self.stage_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "stage-timeout must be greater than zero".into(),
            ));
        }
        if self.signals.is_empty() {
            return Err(Error::InvalidConfig(
                "signals must name at least one signal".into(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{ShutdownConfig, TermSignal};
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = ShutdownConfig::from_yaml_str("{}").unwrap();
        assert_eq!(cfg.stage_timeout, Duration::from_secs(5));
        assert_eq!(cfg.exit_code, 0);
        assert_eq!(
            cfg.signals,
            vec![TermSignal::Interrupt, TermSignal::Terminate]
        );
    }

    #[test]
    fn parses_humantime_and_signal_names() {
        let yaml = r#"
stage-timeout: 250ms
exit-code: 3
signals: [hangup, user-defined1]
"#;
        let cfg = ShutdownConfig::from_yaml_str(yaml).unwrap().validated().unwrap();
        assert_eq!(cfg.stage_timeout, Duration::from_millis(250));
        assert_eq!(cfg.exit_code, 3);
        assert_eq!(cfg.signals, vec![TermSignal::Hangup, TermSignal::UserDefined1]);
        assert_eq!(cfg.signals[1].name(), "SIGUSR1");
    }

    #[test]
    fn rejects_unknown_keys_and_signals() {
        assert!(matches!(
            ShutdownConfig::from_yaml_str("stage-timeot: 1s"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ShutdownConfig::from_yaml_str("signals: [kill]"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn validation_rejects_zero_timeout_and_empty_signals() {
        let zero = ShutdownConfig::from_yaml_str("stage-timeout: 0s").unwrap();
        assert!(matches!(zero.validated(), Err(Error::InvalidConfig(_))));

        let none = ShutdownConfig::from_yaml_str("signals: []").unwrap();
        assert!(matches!(none.validated(), Err(Error::InvalidConfig(_))));
    }
}
