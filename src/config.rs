use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::error::EngineError;
use crate::windowing::{WindowingConfig, WindowingConfigFile};

const DEFAULT_MQ_HOST: &str = "mosquitto";
const DEFAULT_MQ_PORT: u16 = 1883;
const DEFAULT_VIDEO_PLUGIN_TOPIC: &str = "/plugins/video";
const DEFAULT_GATE_PLUGIN_TOPIC: &str = "/plugins/gate";
const DEFAULT_OUTPUT_TOPIC: &str = "/engine";

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    mq_host: Option<String>,
    mq_port: Option<u16>,
    video_plugin_topics: Option<TopicList>,
    gate_plugin_topic: Option<String>,
    output_topic: Option<String>,
    static_metadata: Option<Value>,
    windowing: Option<WindowingConfigFile>,
    event_ttl: Option<f64>,
    reservations_refresh_duration: Option<f64>,
    sleep_duration: Option<f64>,
}

/// Accepts either a single topic or a list of topics.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TopicList {
    One(String),
    Many(Vec<String>),
}

impl TopicList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(topic) => vec![topic],
            Self::Many(topics) => topics,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mq_host: String,
    pub mq_port: u16,
    pub video_plugin_topics: Vec<String>,
    pub gate_plugin_topic: String,
    pub output_topic: String,
    pub static_metadata: Value,
    pub windowing: WindowingConfig,
    /// Ledger entries at least this old are pruned.
    pub event_ttl: Duration,
    pub reservations_refresh: Duration,
    /// Longest wait for an inbound message before housekeeping runs.
    pub sleep_duration: Duration,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file_cfg = read_config_file(path)?;
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Result<Self> {
        let windowing = WindowingConfig::from_file(
            file.windowing
                .ok_or_else(|| EngineError::config("missing required option 'windowing'"))?,
        )?;
        let event_ttl = seconds("event_ttl", file.event_ttl)?;
        let reservations_refresh = seconds(
            "reservations_refresh_duration",
            file.reservations_refresh_duration,
        )?;
        let sleep_duration = seconds("sleep_duration", file.sleep_duration)?;

        Ok(Self {
            mq_host: file.mq_host.unwrap_or_else(|| DEFAULT_MQ_HOST.to_string()),
            mq_port: file.mq_port.unwrap_or(DEFAULT_MQ_PORT),
            video_plugin_topics: file
                .video_plugin_topics
                .map(TopicList::into_vec)
                .unwrap_or_else(|| vec![DEFAULT_VIDEO_PLUGIN_TOPIC.to_string()]),
            gate_plugin_topic: file
                .gate_plugin_topic
                .unwrap_or_else(|| DEFAULT_GATE_PLUGIN_TOPIC.to_string()),
            output_topic: file
                .output_topic
                .unwrap_or_else(|| DEFAULT_OUTPUT_TOPIC.to_string()),
            static_metadata: file
                .static_metadata
                .unwrap_or_else(|| Value::Object(Default::default())),
            windowing,
            event_ttl,
            reservations_refresh,
            sleep_duration,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("CORE_ENGINE_MQ_HOST") {
            if !host.trim().is_empty() {
                self.mq_host = host;
            }
        }
        if let Ok(port) = std::env::var("CORE_ENGINE_MQ_PORT") {
            self.mq_port = port.trim().parse().map_err(|_| {
                EngineError::config("CORE_ENGINE_MQ_PORT must be a valid port number")
            })?;
        }
        if let Ok(topic) = std::env::var("CORE_ENGINE_OUTPUT_TOPIC") {
            if !topic.trim().is_empty() {
                self.output_topic = topic;
            }
        }
        if let Ok(ttl) = std::env::var("CORE_ENGINE_EVENT_TTL") {
            let secs: f64 = ttl.trim().parse().map_err(|_| {
                EngineError::config("CORE_ENGINE_EVENT_TTL must be a number of seconds")
            })?;
            self.event_ttl = seconds("event_ttl", Some(secs))?;
        }
        if let Ok(strategy) = std::env::var("CORE_ENGINE_WINDOWING_STRATEGY") {
            if !strategy.trim().is_empty() {
                self.windowing.strategy = strategy.trim().parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.windowing.validate()?;
        if self.video_plugin_topics.is_empty() {
            return Err(EngineError::config("'video_plugin_topics' must not be empty").into());
        }
        if self.video_plugin_topics.contains(&self.gate_plugin_topic) {
            return Err(EngineError::config(format!(
                "topic {} is configured as both a video and a gate source",
                self.gate_plugin_topic
            ))
            .into());
        }
        if self.sleep_duration.is_zero() {
            return Err(EngineError::config("'sleep_duration' must be greater than zero").into());
        }
        if self.reservations_refresh.is_zero() {
            return Err(EngineError::config(
                "'reservations_refresh_duration' must be greater than zero",
            )
            .into());
        }
        Ok(())
    }
}

fn seconds(name: &str, value: Option<f64>) -> Result<Duration> {
    let secs =
        value.ok_or_else(|| EngineError::config(format!("missing required option '{}'", name)))?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        EngineError::config(format!(
            "'{}' must be a non-negative number of seconds, got {}",
            name, secs
        ))
        .into()
    })
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EngineError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    let parsed: Result<EngineConfigFile, String> = if is_toml {
        toml::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| {
        EngineError::config(format!("invalid config file {}: {}", path.display(), e)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::WindowingStrategy;

    fn parse(json: &str) -> Result<EngineConfig> {
        let file: EngineConfigFile = serde_json::from_str(json)?;
        let cfg = EngineConfig::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    const MINIMAL: &str = r#"{
        "windowing": {"strategy": "most_freq", "window_size": 8, "defined_min": 0.3, "defined_max": 0.7},
        "event_ttl": 30,
        "reservations_refresh_duration": 60,
        "sleep_duration": 0.1
    }"#;

    #[test]
    fn defaults_fill_transport_options() {
        let cfg = parse(MINIMAL).expect("config");
        assert_eq!(cfg.mq_host, "mosquitto");
        assert_eq!(cfg.mq_port, 1883);
        assert_eq!(cfg.video_plugin_topics, vec!["/plugins/video"]);
        assert_eq!(cfg.gate_plugin_topic, "/plugins/gate");
        assert_eq!(cfg.output_topic, "/engine");
        assert!(cfg.static_metadata.as_object().unwrap().is_empty());
        assert_eq!(cfg.windowing.strategy, WindowingStrategy::MostFreq);
        assert_eq!(cfg.event_ttl, Duration::from_secs(30));
        assert_eq!(cfg.sleep_duration, Duration::from_millis(100));
    }

    #[test]
    fn single_video_topic_is_accepted() {
        let json = MINIMAL.replacen('{', r#"{"video_plugin_topics": "/cams/north","#, 1);
        let cfg = parse(&json).expect("config");
        assert_eq!(cfg.video_plugin_topics, vec!["/cams/north"]);
    }

    #[test]
    fn missing_windowing_is_a_configuration_error() {
        let json = r#"{"event_ttl": 1, "reservations_refresh_duration": 1, "sleep_duration": 1}"#;
        let err = parse(json).unwrap_err();
        let engine_err = err.downcast_ref::<EngineError>().expect("engine error");
        assert_eq!(engine_err.code(), "CONFIGURATION_ERROR");
        assert!(err.to_string().contains("windowing"));
    }

    #[test]
    fn unknown_strategy_fails_startup() {
        let json = MINIMAL.replace("most_freq", "median");
        let err = parse(&json).unwrap_err();
        assert!(err.to_string().contains("wrong windowing strategy"));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let json = MINIMAL.replace("\"event_ttl\": 30", "\"event_ttl\": -1");
        assert!(parse(&json).is_err());
    }

    #[test]
    fn zero_sleep_is_rejected() {
        let json = MINIMAL.replace("\"sleep_duration\": 0.1", "\"sleep_duration\": 0");
        assert!(parse(&json).is_err());
    }
}
