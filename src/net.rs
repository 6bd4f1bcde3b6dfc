use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::api::ApiConfig;
use crate::model::{Attendee, CheckResult, MarkReceipt, Registration, ScannerSettings};
use crate::pipeline::GateEvent;
use crate::state::{ScanEvent, SessionId};
use crate::token::{TokenError, TokenStore};

/// 后端调用错误。
#[derive(Debug)]
pub enum ServiceError {
    Transport(String),
    Json(serde_json::Error),
    HttpStatus { status: u16, message: Option<String> },
    MissingToken,
    Token(TokenError),
}

impl ServiceError {
    /// 后端在错误响应体中给出的提示文案。
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ServiceError::HttpStatus { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Transport(msg) => write!(f, "transport error: {}", msg),
            ServiceError::Json(err) => write!(f, "malformed response: {}", err),
            ServiceError::HttpStatus { status, message } => match message {
                Some(message) => write!(f, "HTTP {}: {}", status, message),
                None => write!(f, "HTTP {}", status),
            },
            ServiceError::MissingToken => f.write_str("no access token stored"),
            ServiceError::Token(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Json(err)
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        ServiceError::Token(err)
    }
}

/// 原始 HTTP 响应。
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP 传输层（桌面用 reqwest，固件用 EspHttpConnection）。
pub trait HttpTransport: Send + 'static {
    fn post_json(&self, url: &str, bearer: &str, body: &[u8]) -> Result<HttpResponse, ServiceError>;
}

/// 签到服务的两个操作：校验、签到。
pub trait AttendanceService: Send + 'static {
    fn check(&self, qr_code: &str) -> Result<CheckResult, ServiceError>;
    fn mark(&self, qr_code: &str) -> Result<MarkReceipt, ServiceError>;
    fn set_base_url(&mut self, _base_url: String) {}
}

/// 基于 HTTP 的签到服务客户端。
pub struct HttpAttendanceService<T, K> {
    api: ApiConfig,
    transport: T,
    tokens: K,
    location: String,
    count: u32,
    notes: String,
}

impl<T: HttpTransport, K: TokenStore> HttpAttendanceService<T, K> {
    pub fn new(settings: &ScannerSettings, transport: T, tokens: K) -> Self {
        Self {
            api: ApiConfig::new(settings.backend_base_url.clone()),
            transport,
            tokens,
            location: settings.location.clone(),
            count: settings.mark_count,
            notes: settings.mark_notes.clone(),
        }
    }

    fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<Vec<u8>, ServiceError> {
        // 令牌在调用时读取
        let token = self.tokens.load()?.ok_or(ServiceError::MissingToken)?;
        let payload = serde_json::to_vec(body)?;
        log::debug!("POST {}", url);
        let response = self.transport.post_json(url, &token, &payload)?;
        if !(200..300).contains(&response.status) {
            return Err(ServiceError::HttpStatus {
                status: response.status,
                message: error_message(&response.body),
            });
        }
        Ok(response.body)
    }
}

impl<T: HttpTransport, K: TokenStore> AttendanceService for HttpAttendanceService<T, K> {
    fn check(&self, qr_code: &str) -> Result<CheckResult, ServiceError> {
        let body = self.post(&self.api.check_url(), &CheckRequest { qr_code })?;
        let payload: CheckResponse = serde_json::from_slice(&body)?;
        Ok(payload.into())
    }

    fn mark(&self, qr_code: &str) -> Result<MarkReceipt, ServiceError> {
        let request = MarkRequest {
            qr_code,
            count: self.count,
            location: &self.location,
            notes: &self.notes,
        };
        let body = self.post(&self.api.mark_url(), &request)?;
        // 无异常即视为成功，回执体可为空
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(MarkReceipt::default());
        }
        let payload: MarkResponse = serde_json::from_slice(&body)?;
        Ok(MarkReceipt {
            message: payload.message,
        })
    }

    fn set_base_url(&mut self, base_url: String) {
        self.api = ApiConfig::new(base_url);
        log::info!("Attendance backend set to {}", self.api.base_url);
    }
}

/// 网络线程指令。
#[derive(Clone, Debug)]
pub enum NetCommand {
    Check { session: SessionId, code: String },
    Mark { session: SessionId, code: String },
    SetBackend { base_url: String },
}

/// 启动网络线程：顺序执行校验/签到请求，完成结果回送事件通道。
pub fn spawn_network_loop<S: AttendanceService>(
    mut service: S,
    command_rx: Receiver<NetCommand>,
    event_tx: Sender<GateEvent>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(cmd) = command_rx.recv() {
            let event = match cmd {
                NetCommand::Check { session, code } => {
                    let result = service.check(&code);
                    if let Err(ref err) = result {
                        log::warn!("Scan check failed for {}: {}", code, err);
                    }
                    ScanEvent::CheckCompleted { session, result }
                }
                NetCommand::Mark { session, code } => {
                    let result = service.mark(&code);
                    if let Err(ref err) = result {
                        log::warn!("Attendance mark failed for {}: {}", code, err);
                    }
                    ScanEvent::MarkCompleted { session, result }
                }
                NetCommand::SetBackend { base_url } => {
                    service.set_base_url(base_url);
                    continue;
                }
            };
            // 事件循环已退出时结果直接丢弃
            if event_tx.send(GateEvent::Scan(event)).is_err() {
                break;
            }
        }
    })
}

/// 从错误响应体中提取提示文案。
fn error_message(body: &[u8]) -> Option<String> {
    let payload: ErrorResponse = serde_json::from_slice(body).ok()?;
    payload
        .reason
        .or(payload.message)
        .or(payload.error)
        .filter(|msg| !msg.trim().is_empty())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest<'a> {
    qr_code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkRequest<'a> {
    qr_code: &'a str,
    count: u32,
    location: &'a str,
    notes: &'a str,
}

#[derive(Deserialize)]
struct CheckResponse {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    registration: Option<RegistrationResponse>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    #[serde(default)]
    user_id: Option<UserResponse>,
    #[serde(default)]
    registration_number: Option<String>,
    #[serde(default)]
    registration_type: Option<String>,
}

#[derive(Deserialize)]
struct UserResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct MarkResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<CheckResponse> for CheckResult {
    fn from(value: CheckResponse) -> Self {
        if !value.valid {
            let reason = value
                .reason
                .or(value.message)
                .filter(|msg| !msg.trim().is_empty())
                .unwrap_or_else(|| crate::state::INVALID_QR_MESSAGE.to_string());
            return CheckResult::Invalid { reason };
        }
        let registration = value.registration.map(Registration::from).unwrap_or_default();
        CheckResult::Valid(registration)
    }
}

impl From<RegistrationResponse> for Registration {
    fn from(value: RegistrationResponse) -> Self {
        let attendee = value
            .user_id
            .map(|user| Attendee {
                name: user.name,
                email: user.email,
            })
            .unwrap_or_default();
        Registration {
            registration_number: value.registration_number,
            registration_type: value.registration_type,
            attendee,
        }
    }
}
