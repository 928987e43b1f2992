use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct TraceryConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollaboratorConfig {
    /// "http" or "disabled"
    pub backend: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            backend: "http".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            timeout_seconds: 60,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// "heuristic" or "collaborator"
    pub segmenter: String,
    pub max_sample_urls: usize,
    pub max_sample_actions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segmenter: "heuristic".to_string(),
            max_sample_urls: 3,
            max_sample_actions: 3,
        }
    }
}

impl TraceryConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .build()?;
        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_optional_sections_fall_back_to_defaults() {
        let raw = r#"
            [service]
            socket_path = "/tmp/tracery-test.sock"
            log_level = "debug"

            [database]
            url = "sqlite::memory:"
            max_connections = 1
        "#;
        let config: TraceryConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.segmenter, "heuristic");
        assert_eq!(config.pipeline.max_sample_urls, 3);
        assert_eq!(config.collaborator.backend, "http");
        assert_eq!(config.collaborator.api_key_env, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_explicit_pipeline_section() {
        let raw = r#"
            [service]
            socket_path = "/tmp/tracery-test.sock"
            log_level = "info"

            [database]
            url = "sqlite::memory:"
            max_connections = 1

            [pipeline]
            segmenter = "collaborator"
            max_sample_urls = 5
            max_sample_actions = 2
        "#;
        let config: TraceryConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.segmenter, "collaborator");
        assert_eq!(config.pipeline.max_sample_actions, 2);
    }
}
