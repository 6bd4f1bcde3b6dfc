use std::path::PathBuf;

use crate::api::normalize_backend_url;
use crate::model::ScannerSettings;

pub const ENV_BACKEND: &str = "ATTEND_GATE_BACKEND";
pub const ENV_TOKEN_FILE: &str = "ATTEND_GATE_TOKEN_FILE";
pub const ENV_LOCATION: &str = "ATTEND_GATE_LOCATION";
pub const ENV_TEST_CODE: &str = "ATTEND_GATE_TEST_CODE";
pub const ENV_TIMEOUT_SECS: &str = "ATTEND_GATE_TIMEOUT_SECS";

const DEFAULT_TOKEN_FILE: &str = ".attend-gate-token";

/// 扫码站启动配置：运行参数 + 令牌文件位置（仅主机端使用）。
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub settings: ScannerSettings,
    pub token_file: PathBuf,
}

impl GateConfig {
    /// 编译期注入的默认值（build.rs 从 .env 读取）。
    pub fn compiled() -> Self {
        let mut settings = ScannerSettings::default();
        if let Some(url) = compiled_value(option_env!("BACKEND_BASE_URL")) {
            settings.backend_base_url = normalize_backend_url(url);
        }
        if let Some(location) = compiled_value(option_env!("GATE_LOCATION")) {
            settings.location = location.to_string();
        }
        if let Some(code) = compiled_value(option_env!("TEST_QR_CODE")) {
            settings.test_code = code.to_string();
        }
        Self {
            settings,
            token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
        }
    }

    /// 用环境变量覆盖默认值；非法数值忽略并告警。
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = value(ENV_BACKEND) {
            self.settings.backend_base_url = normalize_backend_url(&url);
        }
        if let Some(path) = value(ENV_TOKEN_FILE) {
            self.token_file = PathBuf::from(path);
        }
        if let Some(location) = value(ENV_LOCATION) {
            self.settings.location = location;
        }
        if let Some(code) = value(ENV_TEST_CODE) {
            self.settings.test_code = code;
        }
        if let Some(raw) = value(ENV_TIMEOUT_SECS) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => self.settings.request_timeout_secs = secs,
                _ => log::warn!("Ignoring {}={:?}: expected a positive integer", ENV_TIMEOUT_SECS, raw),
            }
        }
    }

    /// 编译期默认值叠加进程环境变量。
    pub fn from_env() -> Self {
        let mut config = Self::compiled();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }
}

fn compiled_value(value: Option<&'static str>) -> Option<&'static str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
