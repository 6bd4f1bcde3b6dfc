use std::fmt;

/// 扫码会话状态（对外展示用的扁平枚举）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStatus {
    Idle,
    AwaitingDecode,
    Validating,
    Marking,
    Success,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::AwaitingDecode => "awaiting_decode",
            ScanStatus::Validating => "validating",
            ScanStatus::Marking => "marking",
            ScanStatus::Success => "success",
            ScanStatus::Error => "error",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScanStatus::Idle => "Camera paused",
            ScanStatus::AwaitingDecode => "Ready to scan",
            ScanStatus::Validating => "Checking code...",
            ScanStatus::Marking => "Marking attendance...",
            ScanStatus::Success => "Entry marked",
            ScanStatus::Error => "Scan failed",
        }
    }

    /// 会话进行中（含结果展示窗口），此时拒绝新的解码。
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ScanStatus::Validating | ScanStatus::Marking | ScanStatus::Success | ScanStatus::Error
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 物理采集设备（扫码头/摄像头）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraDescriptor {
    pub id: String,
    pub label: String,
}

impl CameraDescriptor {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// 参会者基本信息。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attendee {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// 校验通过后返回的报名记录（只读快照）。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registration {
    pub registration_number: Option<String>,
    pub registration_type: Option<String>,
    pub attendee: Attendee,
}

impl Registration {
    /// 面板展示用名称：优先姓名，其次报名号。
    pub fn display_name(&self) -> Option<&str> {
        self.attendee
            .name
            .as_deref()
            .or(self.registration_number.as_deref())
    }
}

/// 校验接口的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckResult {
    Valid(Registration),
    Invalid { reason: String },
}

/// 签到接口的回执。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkReceipt {
    pub message: Option<String>,
}

/// 状态机请求的反馈提示。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedbackCue {
    Pending,
    Success {
        title: String,
        description: Option<String>,
    },
    Error {
        title: String,
        description: Option<String>,
    },
    Clear,
}

/// 扫码站运行参数（可配置项）。
#[derive(Clone, Debug)]
pub struct ScannerSettings {
    pub backend_base_url: String,
    pub location: String,
    pub mark_count: u32,
    pub mark_notes: String,
    pub frames_per_second: u32,
    pub success_display_ms: u64,
    pub error_display_ms: u64,
    pub request_timeout_secs: u64,
    pub history_max: usize,
    pub test_code: String,
}

impl ScannerSettings {
    /// 使用指定后端地址构建默认参数。
    pub fn with_backend(base_url: impl Into<String>) -> Self {
        Self {
            backend_base_url: base_url.into(),
            location: "Main Gate".to_string(),
            mark_count: 1,
            mark_notes: "Marked via QR scanner".to_string(),
            frames_per_second: 8,
            success_display_ms: 2000,
            error_display_ms: 3000,
            request_timeout_secs: 10,
            history_max: 20,
            test_code: "AOA12345".to_string(),
        }
    }
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self::with_backend("http://localhost:5000/api")
    }
}
