#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Norm { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::error::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Norm {
            message: message.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
