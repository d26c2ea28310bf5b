use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_sync_total_limit")]
    pub sync_total_limit: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| {
                AppConfig {
                    bind_addr: default_bind_addr(),
                    database_url: None,
                    redis_url: None,
                    sync_total_limit: default_sync_total_limit(),
                }
                .normalize()
            })
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.redis_url = Self::normalize_opt(self.redis_url.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_sync_total_limit() -> i64 {
    crate::updates::pull::DEFAULT_TOTAL_LIMIT
}
