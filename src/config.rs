use std::env;

use crate::error::ConfigError;

const PRODUCTION_API_URL: &str = "https://merry-comfort-production.up.railway.app";
const LAN_API_URL: &str = "http://192.168.1.9:5000";
const LOCALHOST_API_URL: &str = "http://localhost:5000";
const EMULATOR_API_URL: &str = "http://10.0.2.2:5000";
const DEFAULT_DATABASE_URL: &str = "sqlite://student-risk.db?mode=rwc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Production,
}

impl AppEnvironment {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(value.to_string())),
        }
    }
}

/// The client target the base URL is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Android,
    Emulator,
    Simulator,
    Web,
}

impl Platform {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "emulator" => Ok(Self::Emulator),
            "simulator" => Ok(Self::Simulator),
            "web" => Ok(Self::Web),
            _ => Err(ConfigError::InvalidPlatform(value.to_string())),
        }
    }
}

pub fn resolve_api_url(environment: AppEnvironment, platform: Platform) -> &'static str {
    match (environment, platform) {
        (AppEnvironment::Production, _) => PRODUCTION_API_URL,
        (AppEnvironment::Development, Platform::Web | Platform::Simulator) => LOCALHOST_API_URL,
        (AppEnvironment::Development, Platform::Emulator) => EMULATOR_API_URL,
        (AppEnvironment::Development, Platform::Ios | Platform::Android) => LAN_API_URL,
    }
}

/// Top-level configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub platform: Platform,
    pub api_url: String,
    pub database_url: String,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::parse(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        )?;
        let platform =
            Platform::parse(&env::var("APP_PLATFORM").unwrap_or_else(|_| "web".to_string()))?;
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            platform,
            api_url: resolve_api_url(environment, platform).to_string(),
            database_url,
            telemetry: TelemetryConfig { log_level },
        })
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}
