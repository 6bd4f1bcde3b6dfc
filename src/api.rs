#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
}

pub const SCAN_CHECK_PATH: &str = "/attendance/scan/check";
pub const SCAN_MARK_PATH: &str = "/attendance/scan/mark";

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_backend_url(&base_url.into()),
        }
    }

    pub fn check_url(&self) -> String {
        format!("{}{}", self.base_url, SCAN_CHECK_PATH)
    }

    pub fn mark_url(&self) -> String {
        format!("{}{}", self.base_url, SCAN_MARK_PATH)
    }
}

/// 规范化后端地址（自动补齐协议/去尾斜杠）。
pub fn normalize_backend_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut url = trimmed.to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("http://{}", url);
    }
    url.trim_end_matches('/').to_string()
}
