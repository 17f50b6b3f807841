use std::time::Duration;

use segmark_core::types::ProjectId;
use segmark_core::viewport::{ZoomLimits, DEFAULT_MAX_SCALE, DEFAULT_MIN_SCALE, DEFAULT_ZOOM_FACTOR};
use segmark_inference::channel::{InferenceConfig, DEFAULT_REQUEST_TIMEOUT};
use segmark_inference::reconnect::{ReconnectConfig, DEFAULT_RECONNECT_DELAY};

/// Default inference endpoint.
pub const DEFAULT_INFERENCE_WS_URL: &str = "ws://localhost:8000/api/v1/sam3/inference";

/// Default persistence API root.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

/// Default quiet period before a resize burst is applied.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Session configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub project_id: ProjectId,
    pub inference_ws_url: String,
    pub api_base_url: String,
    /// Bounded wait per inference request.
    pub inference_timeout: Duration,
    pub reconnect_delay: Duration,
    pub resize_debounce: Duration,
    pub zoom: ZoomLimits,
}

impl SessionConfig {
    /// Configuration with defaults for everything but the project.
    pub fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            inference_ws_url: DEFAULT_INFERENCE_WS_URL.into(),
            api_base_url: DEFAULT_API_BASE_URL.into(),
            inference_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
            zoom: ZoomLimits::default(),
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                                       |
    /// |------------------------|-----------------------------------------------|
    /// | `PROJECT_ID`           | required                                      |
    /// | `INFERENCE_WS_URL`     | `ws://localhost:8000/api/v1/sam3/inference`   |
    /// | `API_BASE_URL`         | `http://localhost:8000/api/v1`                |
    /// | `INFERENCE_TIMEOUT_MS` | `10000`                                       |
    /// | `RECONNECT_DELAY_MS`   | `3000`                                        |
    /// | `RESIZE_DEBOUNCE_MS`   | `50`                                          |
    /// | `ZOOM_FACTOR`          | `1.05`                                        |
    /// | `ZOOM_MIN`             | `0.1`                                         |
    /// | `ZOOM_MAX`             | `10`                                          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_project = lookup("PROJECT_ID").ok_or(ConfigError::Missing("PROJECT_ID"))?;
        let project_id = uuid::Uuid::parse_str(raw_project.trim()).map_err(|e| {
            ConfigError::Invalid {
                var: "PROJECT_ID",
                value: raw_project.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut config = Self::new(project_id);
        if let Some(url) = lookup("INFERENCE_WS_URL") {
            config.inference_ws_url = url;
        }
        if let Some(url) = lookup("API_BASE_URL") {
            config.api_base_url = url;
        }

        config.inference_timeout =
            millis(&lookup, "INFERENCE_TIMEOUT_MS", config.inference_timeout)?;
        config.reconnect_delay = millis(&lookup, "RECONNECT_DELAY_MS", config.reconnect_delay)?;
        config.resize_debounce = millis(&lookup, "RESIZE_DEBOUNCE_MS", config.resize_debounce)?;

        config.zoom = ZoomLimits {
            factor: positive(&lookup, "ZOOM_FACTOR", DEFAULT_ZOOM_FACTOR)?,
            min: positive(&lookup, "ZOOM_MIN", DEFAULT_MIN_SCALE)?,
            max: positive(&lookup, "ZOOM_MAX", DEFAULT_MAX_SCALE)?,
        };
        if config.zoom.min > config.zoom.max {
            return Err(ConfigError::Invalid {
                var: "ZOOM_MIN",
                value: config.zoom.min.to_string(),
                reason: format!("must not exceed ZOOM_MAX ({})", config.zoom.max),
            });
        }

        Ok(config)
    }

    pub fn inference(&self) -> InferenceConfig {
        InferenceConfig {
            request_timeout: self.inference_timeout,
            reconnect: ReconnectConfig::fixed(self.reconnect_delay),
            ..InferenceConfig::new(self.inference_ws_url.clone())
        }
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: f64,
) -> Result<f64, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(default);
    };
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        Ok(_) => Err(ConfigError::Invalid {
            var,
            value,
            reason: "must be a positive number".into(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    const PROJECT: &str = "0b7e8f4a-3c1d-4e2f-9a8b-7c6d5e4f3a2b";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = SessionConfig::from_lookup(lookup(&[("PROJECT_ID", PROJECT)])).unwrap();
        assert_eq!(config.inference_ws_url, DEFAULT_INFERENCE_WS_URL);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.inference_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.resize_debounce, Duration::from_millis(50));
        assert_eq!(config.zoom, ZoomLimits::default());
    }

    #[test]
    fn project_id_required() {
        assert_matches!(
            SessionConfig::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("PROJECT_ID"))
        );
    }

    #[test]
    fn invalid_project_id_rejected() {
        assert_matches!(
            SessionConfig::from_lookup(lookup(&[("PROJECT_ID", "not-a-uuid")])),
            Err(ConfigError::Invalid { var: "PROJECT_ID", .. })
        );
    }

    #[test]
    fn overrides_parse() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PROJECT_ID", PROJECT),
            ("INFERENCE_TIMEOUT_MS", "2500"),
            ("ZOOM_FACTOR", "1.2"),
            ("ZOOM_MAX", "4"),
        ]))
        .unwrap();
        assert_eq!(config.inference_timeout, Duration::from_millis(2500));
        assert_eq!(config.zoom.factor, 1.2);
        assert_eq!(config.zoom.max, 4.0);
        assert_eq!(config.inference().request_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn bad_numbers_rejected() {
        assert_matches!(
            SessionConfig::from_lookup(lookup(&[
                ("PROJECT_ID", PROJECT),
                ("RESIZE_DEBOUNCE_MS", "soon"),
            ])),
            Err(ConfigError::Invalid { var: "RESIZE_DEBOUNCE_MS", .. })
        );
        assert_matches!(
            SessionConfig::from_lookup(lookup(&[("PROJECT_ID", PROJECT), ("ZOOM_FACTOR", "-1")])),
            Err(ConfigError::Invalid { var: "ZOOM_FACTOR", .. })
        );
        assert_matches!(
            SessionConfig::from_lookup(lookup(&[("PROJECT_ID", PROJECT), ("ZOOM_MIN", "20")])),
            Err(ConfigError::Invalid { var: "ZOOM_MIN", .. })
        );
    }
}
