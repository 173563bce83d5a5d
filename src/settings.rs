use config::{Config, ConfigError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerCfg,
    pub llm: crate::llm::LlmCfg,
    /// Only needed by the `train` subcommand; serve-only deployments may
    /// omit the section entirely.
    pub train: Option<crate::llm::train::TrainCfg>,
}

#[derive(Debug, Deserialize)]
pub struct ServerCfg {
    pub bind_addr: String,
    pub like_store: String,
    pub ui_dir: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let c = Config::builder()
            .add_source(config::File::with_name("config/llm"))
            .build()?;
        c.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn train_section_is_optional() {
        let c = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                bind_addr = "127.0.0.1:0"
                like_store = "like.json"

                [llm]
                model_id = "base"
                adapter_dir = "lora-adapter"
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = c.try_deserialize().unwrap();
        assert!(settings.train.is_none());
        assert_eq!(settings.server.bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn train_section_parses_when_present() {
        let c = Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                bind_addr = "127.0.0.1:0"
                like_store = "like.json"

                [llm]
                model_id = "base"

                [train]
                data = "data.json"
                output_dir = "out"
                rank = 4
                "#,
                FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let settings: Settings = c.try_deserialize().unwrap();
        let train = settings.train.unwrap();
        assert_eq!(train.rank, 4);
        assert_eq!(train.epochs, 3);
    }
}
