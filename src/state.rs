//! 扫码会话状态机。
//!
//! 纯状态转换：不启动线程、不睡眠、不做 I/O。驱动方提供单调毫秒时钟，
//! 并负责执行返回的 [`ScanAction`]（停/启摄像头、发请求、反馈提示）。

use crate::model::{CheckResult, FeedbackCue, MarkReceipt, Registration, ScanStatus, ScannerSettings};
use crate::net::ServiceError;

/// 单调毫秒时间。
pub type NowMs = u64;

/// 会话编号，用于丢弃过期的网络回包。
pub type SessionId = u32;

pub const INVALID_QR_MESSAGE: &str = "Invalid QR Code";
pub const MARK_FAILED_MESSAGE: &str = "Failed to mark attendance";
pub const MARKED_MESSAGE: &str = "Attendance marked";
pub const SUCCESS_TITLE: &str = "Entry Marked";
pub const ERROR_TITLE: &str = "Scan Failed";

/// 扫码会话（同一时刻至多一个）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// 摄像头未运行。
    Idle,
    /// 摄像头运行中，等待解码。
    AwaitingDecode,
    Validating {
        session: SessionId,
        code: String,
    },
    Marking {
        session: SessionId,
        code: String,
        registration: Registration,
    },
    Success {
        session: SessionId,
        code: String,
        registration: Registration,
        message: String,
        close_at_ms: NowMs,
    },
    Error {
        session: SessionId,
        code: String,
        message: String,
        close_at_ms: NowMs,
    },
}

impl ScanState {
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanState::Idle => ScanStatus::Idle,
            ScanState::AwaitingDecode => ScanStatus::AwaitingDecode,
            ScanState::Validating { .. } => ScanStatus::Validating,
            ScanState::Marking { .. } => ScanStatus::Marking,
            ScanState::Success { .. } => ScanStatus::Success,
            ScanState::Error { .. } => ScanStatus::Error,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        match self {
            ScanState::Idle | ScanState::AwaitingDecode => None,
            ScanState::Validating { session, .. }
            | ScanState::Marking { session, .. }
            | ScanState::Success { session, .. }
            | ScanState::Error { session, .. } => Some(*session),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ScanState::Idle | ScanState::AwaitingDecode => None,
            ScanState::Validating { code, .. }
            | ScanState::Marking { code, .. }
            | ScanState::Success { code, .. }
            | ScanState::Error { code, .. } => Some(code),
        }
    }

    pub fn registration(&self) -> Option<&Registration> {
        match self {
            ScanState::Marking { registration, .. } | ScanState::Success { registration, .. } => {
                Some(registration)
            }
            _ => None,
        }
    }

    /// 结果文案（仅结果态）。
    pub fn message(&self) -> Option<&str> {
        match self {
            ScanState::Success { message, .. } | ScanState::Error { message, .. } => Some(message),
            _ => None,
        }
    }

    fn close_at_ms(&self) -> Option<NowMs> {
        match self {
            ScanState::Success { close_at_ms, .. } | ScanState::Error { close_at_ms, .. } => {
                Some(*close_at_ms)
            }
            _ => None,
        }
    }
}

/// 状态机输入事件。
#[derive(Debug)]
pub enum ScanEvent {
    /// 摄像头解码出一段内容。
    Decoded { code: String },
    /// 手动测试扫码（跳过摄像头，走同一套流程）。
    TestScan { code: String },
    CheckCompleted {
        session: SessionId,
        result: Result<CheckResult, ServiceError>,
    },
    MarkCompleted {
        session: SessionId,
        result: Result<MarkReceipt, ServiceError>,
    },
    /// 操作员手动关闭结果面板。
    Dismissed,
    CameraStarted,
    CameraStopped,
}

/// 状态机要求驱动方执行的动作。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanAction {
    StopCamera,
    StartCamera,
    SendCheck { session: SessionId, code: String },
    SendMark { session: SessionId, code: String },
    Feedback(FeedbackCue),
}

/// 自动关闭窗口。
#[derive(Clone, Copy, Debug)]
pub struct DisplayWindows {
    pub success_ms: u64,
    pub error_ms: u64,
}

impl From<&ScannerSettings> for DisplayWindows {
    fn from(settings: &ScannerSettings) -> Self {
        Self {
            success_ms: settings.success_display_ms,
            error_ms: settings.error_display_ms,
        }
    }
}

/// 扫码分发器：唯一的状态转换入口。
#[derive(Clone, Debug)]
pub struct ScanDispatcher {
    windows: DisplayWindows,
    state: ScanState,
    next_session: SessionId,
}

impl ScanDispatcher {
    pub fn new(windows: DisplayWindows) -> Self {
        Self {
            windows,
            state: ScanState::Idle,
            next_session: 1,
        }
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn status(&self) -> ScanStatus {
        self.state.status()
    }

    /// 下一个自动关闭时间点（供驱动方计算等待超时）。
    pub fn next_deadline(&self) -> Option<NowMs> {
        self.state.close_at_ms()
    }

    pub fn handle(&mut self, now_ms: NowMs, event: ScanEvent) -> Vec<ScanAction> {
        match event {
            ScanEvent::Decoded { code } => self.begin(code, "camera"),
            ScanEvent::TestScan { code } => self.begin(code, "test"),
            ScanEvent::CheckCompleted { session, result } => {
                self.on_check_completed(now_ms, session, result)
            }
            ScanEvent::MarkCompleted { session, result } => {
                self.on_mark_completed(now_ms, session, result)
            }
            ScanEvent::Dismissed => match self.state {
                ScanState::Success { .. } | ScanState::Error { .. } => self.finish(),
                _ => Vec::new(),
            },
            ScanEvent::CameraStarted => {
                if self.state == ScanState::Idle {
                    self.state = ScanState::AwaitingDecode;
                }
                Vec::new()
            }
            ScanEvent::CameraStopped => {
                if self.state == ScanState::AwaitingDecode {
                    self.state = ScanState::Idle;
                }
                Vec::new()
            }
        }
    }

    /// 结果展示窗口到期则自动回到空闲。
    pub fn poll_timers(&mut self, now_ms: NowMs) -> Vec<ScanAction> {
        match self.state.close_at_ms() {
            Some(close_at) if now_ms >= close_at => self.finish(),
            _ => Vec::new(),
        }
    }

    fn begin(&mut self, raw: String, source: &str) -> Vec<ScanAction> {
        let code = raw.trim();
        if code.is_empty() {
            return Vec::new();
        }
        if self.state.status().is_in_flight() {
            // 会话进行中，丢弃重复解码
            log::debug!("Ignoring {} scan {:?} while {}", source, code, self.state.status());
            return Vec::new();
        }
        let session = self.next_session;
        self.next_session = self.next_session.wrapping_add(1).max(1);
        log::info!("Scan #{} started from {}: {}", session, source, code);
        self.state = ScanState::Validating {
            session,
            code: code.to_string(),
        };
        vec![
            ScanAction::StopCamera,
            ScanAction::Feedback(FeedbackCue::Pending),
            ScanAction::SendCheck {
                session,
                code: code.to_string(),
            },
        ]
    }

    fn on_check_completed(
        &mut self,
        now_ms: NowMs,
        session: SessionId,
        result: Result<CheckResult, ServiceError>,
    ) -> Vec<ScanAction> {
        let code = match &self.state {
            ScanState::Validating { session: current, code } if *current == session => code.clone(),
            _ => {
                log::debug!("Dropping stale check result for scan #{}", session);
                return Vec::new();
            }
        };
        match result {
            Ok(CheckResult::Valid(registration)) => {
                self.state = ScanState::Marking {
                    session,
                    code: code.clone(),
                    registration,
                };
                vec![ScanAction::SendMark { session, code }]
            }
            Ok(CheckResult::Invalid { reason }) => self.fail(now_ms, session, code, reason),
            Err(err) => {
                let message = err.server_message().unwrap_or(INVALID_QR_MESSAGE).to_string();
                self.fail(now_ms, session, code, message)
            }
        }
    }

    fn on_mark_completed(
        &mut self,
        now_ms: NowMs,
        session: SessionId,
        result: Result<MarkReceipt, ServiceError>,
    ) -> Vec<ScanAction> {
        let (code, registration) = match &self.state {
            ScanState::Marking {
                session: current,
                code,
                registration,
            } if *current == session => (code.clone(), registration.clone()),
            _ => {
                log::debug!("Dropping stale mark result for scan #{}", session);
                return Vec::new();
            }
        };
        match result {
            Ok(receipt) => {
                let message = receipt
                    .message
                    .filter(|msg| !msg.trim().is_empty())
                    .unwrap_or_else(|| MARKED_MESSAGE.to_string());
                log::info!("Scan #{} marked: {}", session, message);
                let description = match registration.display_name() {
                    Some(name) => format!("{} - {}", name, message),
                    None => message.clone(),
                };
                self.state = ScanState::Success {
                    session,
                    code,
                    registration,
                    message,
                    close_at_ms: now_ms.saturating_add(self.windows.success_ms),
                };
                vec![ScanAction::Feedback(FeedbackCue::Success {
                    title: SUCCESS_TITLE.to_string(),
                    description: Some(description),
                })]
            }
            // 已校验但未签到：不自动重试，提示重新扫码
            Err(err) => {
                let message = err.server_message().unwrap_or(MARK_FAILED_MESSAGE).to_string();
                self.fail(now_ms, session, code, message)
            }
        }
    }

    fn fail(
        &mut self,
        now_ms: NowMs,
        session: SessionId,
        code: String,
        message: String,
    ) -> Vec<ScanAction> {
        log::info!("Scan #{} failed: {}", session, message);
        self.state = ScanState::Error {
            session,
            code,
            message: message.clone(),
            close_at_ms: now_ms.saturating_add(self.windows.error_ms),
        };
        vec![ScanAction::Feedback(FeedbackCue::Error {
            title: ERROR_TITLE.to_string(),
            description: Some(message),
        })]
    }

    /// 结束当前会话，回到空闲并重启摄像头。
    fn finish(&mut self) -> Vec<ScanAction> {
        self.state = ScanState::Idle;
        vec![
            ScanAction::Feedback(FeedbackCue::Clear),
            ScanAction::StartCamera,
        ]
    }
}
