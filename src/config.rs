use serde::Deserialize;
use std::path::PathBuf;

pub const SEGMENTATION_MODEL_FILE: &str = "maskrcnn_resnet50_fpn.onnx";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ModelConfig {
    pub fn segmentation_model_path(&self) -> PathBuf {
        self.model_dir.join(SEGMENTATION_MODEL_FILE)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.segmentation_model_path().exists() {
            return Err(format!(
                "Segmentation model not found: {:?}",
                self.segmentation_model_path()
            ));
        }
        if self.intra_threads == 0 {
            return Err("model.intra_threads must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Debug, Default)]
pub struct CameraConfig {
    #[serde(default)]
    pub backend: CameraBackend,
}

/// Capture API handed to the platform video layer when opening a device.
#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    #[default]
    Any,
    V4l2,
    Dshow,
    Msmf,
    Avfoundation,
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("CAP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    validated(config.try_deserialize::<Config>()?)
}

fn validated(config: Config) -> Result<Config, config::ConfigError> {
    config
        .model
        .validate()
        .map_err(config::ConfigError::Message)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn parse(yaml: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Config>()
    }

    #[test]
    fn test_parse_full_configuration() {
        let config = parse(
            r#"
server:
  host: 127.0.0.1
  port: 8501
log_level: DEBUG
model:
  model_dir: ./models
  intra_threads: 2
camera:
  backend: v4l2
"#,
        )
        .unwrap();

        assert_eq!(config.server.get_address(), "127.0.0.1:8501");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.model.intra_threads, 2);
        assert_eq!(
            config.model.segmentation_model_path(),
            PathBuf::from("./models").join(SEGMENTATION_MODEL_FILE)
        );
        assert_eq!(config.camera.backend, CameraBackend::V4l2);
    }

    #[test]
    fn test_camera_section_is_optional() {
        let config = parse(
            r#"
server:
  host: 127.0.0.1
  port: 8501
log_level: info
model:
  model_dir: ./models
"#,
        )
        .unwrap();

        assert_eq!(config.camera.backend, CameraBackend::Any);
        assert!(config.model.intra_threads >= 1);
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let result = parse(
            r#"
server:
  host: 127.0.0.1
  port: 8501
log_level: trace
model:
  model_dir: ./models
"#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_environment_from_string() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_missing_segmentation_model_fails_validation() {
        let model = ModelConfig {
            model_dir: PathBuf::from("/nonexistent/models"),
            intra_threads: 1,
        };

        let err = model.validate().unwrap_err();
        assert!(err.contains(SEGMENTATION_MODEL_FILE));
    }

    #[test]
    fn test_validation_failure_is_returned_as_config_error() {
        let config = parse(
            r#"
server:
  host: 127.0.0.1
  port: 8501
log_level: info
model:
  model_dir: /nonexistent/models
"#,
        )
        .unwrap();

        match validated(config) {
            Err(config::ConfigError::Message(message)) => {
                assert!(message.contains(SEGMENTATION_MODEL_FILE))
            }
            other => panic!("expected a validation message, got {:?}", other),
        }
    }
}
