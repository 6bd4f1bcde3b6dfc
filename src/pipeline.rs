use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{RecentScans, ScanRecord};
use crate::camera::{CameraError, CameraSessionManager, CaptureBackend, DecodeCallback};
use crate::feedback::{FeedbackDevice, FeedbackPresenter};
use crate::model::{CameraDescriptor, FeedbackCue, ScanStatus, ScannerSettings};
use crate::net::{NetCommand, ServiceError};
use crate::state::{DisplayWindows, NowMs, ScanAction, ScanDispatcher, ScanEvent, SessionId};

// 无待办计时时的最长等待。
const IDLE_WAIT_MS: u64 = 100;

/// 事件循环的输入。
#[derive(Debug)]
pub enum GateEvent {
    Scan(ScanEvent),
    SwitchCamera { camera_id: String },
    SetBackend { base_url: String },
    Shutdown,
}

/// 事件循环与网络线程之间的通道集合。
pub struct GateChannels {
    pub event_tx: Sender<GateEvent>,
    pub event_rx: Receiver<GateEvent>,
    pub net_cmd_tx: Sender<NetCommand>,
    pub net_cmd_rx: Receiver<NetCommand>,
}

impl GateChannels {
    /// 创建默认的 mpsc 通道。
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        let (net_cmd_tx, net_cmd_rx) = mpsc::channel();
        Self {
            event_tx,
            event_rx,
            net_cmd_tx,
            net_cmd_rx,
        }
    }
}

impl Default for GateChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// 操作员面板读取的共享状态快照。
#[derive(Clone, Debug)]
pub struct GateStatus {
    pub status: ScanStatus,
    pub session: Option<SessionId>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub attendee: Option<String>,
    pub attendee_email: Option<String>,
    pub registration_type: Option<String>,
    pub cameras: Vec<CameraDescriptor>,
    pub selected_camera: Option<String>,
    pub active_camera: Option<String>,
    pub camera_error: Option<String>,
    pub backend_base_url: String,
    pub backend_reachable: Option<bool>,
    pub location: String,
    pub test_code: String,
    pub recent: RecentScans,
}

impl GateStatus {
    pub fn new(settings: &ScannerSettings) -> Self {
        Self {
            status: ScanStatus::Idle,
            session: None,
            code: None,
            message: None,
            attendee: None,
            attendee_email: None,
            registration_type: None,
            cameras: Vec::new(),
            selected_camera: None,
            active_camera: None,
            camera_error: None,
            backend_base_url: crate::api::normalize_backend_url(&settings.backend_base_url),
            backend_reachable: None,
            location: settings.location.clone(),
            test_code: settings.test_code.clone(),
            recent: RecentScans::new(settings.history_max),
        }
    }
}

/// 单调时钟（毫秒）。
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> NowMs {
        self.started.elapsed().as_millis() as NowMs
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// 扫码站运行时：持有状态机、摄像头与反馈设备，解释状态机动作。
pub struct GateRuntime<B: CaptureBackend, D: FeedbackDevice> {
    dispatcher: ScanDispatcher,
    camera: CameraSessionManager<B>,
    presenter: FeedbackPresenter<D>,
    net_cmd_tx: Sender<NetCommand>,
    event_tx: Sender<GateEvent>,
    status: Arc<Mutex<GateStatus>>,
    camera_error: Option<String>,
    backend_reachable: Option<bool>,
}

impl<B: CaptureBackend, D: FeedbackDevice> GateRuntime<B, D> {
    pub fn new(
        settings: &ScannerSettings,
        camera: CameraSessionManager<B>,
        presenter: FeedbackPresenter<D>,
        net_cmd_tx: Sender<NetCommand>,
        event_tx: Sender<GateEvent>,
        status: Arc<Mutex<GateStatus>>,
    ) -> Self {
        Self {
            dispatcher: ScanDispatcher::new(DisplayWindows::from(settings)),
            camera,
            presenter,
            net_cmd_tx,
            event_tx,
            status,
            camera_error: None,
            backend_reachable: None,
        }
    }

    pub fn next_deadline(&self) -> Option<NowMs> {
        self.dispatcher.next_deadline()
    }

    /// 枚举设备并启动默认摄像头。无设备时只记录，不重试。
    pub fn boot(&mut self, now_ms: NowMs) {
        match self.camera.list_cameras() {
            Ok(cameras) => log::info!("Found {} camera(s)", cameras.len()),
            Err(err) => {
                log::warn!("Camera enumeration failed: {}", err);
                self.camera_error = Some(err.to_string());
            }
        }
        if self.camera_error.is_none() {
            self.start_camera(now_ms);
        }
        self.publish();
    }

    /// 处理一个事件，返回 false 表示应退出循环。
    pub fn handle_event(&mut self, now_ms: NowMs, event: GateEvent) -> bool {
        match event {
            GateEvent::Scan(scan) => {
                self.observe_backend(&scan);
                let actions = self.dispatcher.handle(now_ms, scan);
                self.execute(now_ms, actions);
            }
            GateEvent::SwitchCamera { camera_id } => self.switch_camera(now_ms, &camera_id),
            GateEvent::SetBackend { base_url } => {
                let base_url = crate::api::normalize_backend_url(&base_url);
                if let Ok(mut status) = self.status.lock() {
                    status.backend_base_url = base_url.clone();
                }
                if self.net_cmd_tx.send(NetCommand::SetBackend { base_url }).is_err() {
                    log::warn!("Backend update dropped: network worker stopped");
                }
            }
            GateEvent::Shutdown => return false,
        }
        self.publish();
        true
    }

    /// 检查自动关闭计时。
    pub fn poll(&mut self, now_ms: NowMs) {
        let actions = self.dispatcher.poll_timers(now_ms);
        if !actions.is_empty() {
            self.execute(now_ms, actions);
            self.publish();
        }
    }

    /// 退出时释放摄像头；未完成的请求结果被丢弃。
    pub fn shutdown(&mut self) {
        self.camera.stop();
        self.publish();
        log::info!("Scanner runtime stopped");
    }

    fn execute(&mut self, now_ms: NowMs, actions: Vec<ScanAction>) {
        for action in actions {
            match action {
                ScanAction::StopCamera => self.camera.stop(),
                ScanAction::StartCamera => self.start_camera(now_ms),
                ScanAction::SendCheck { session, code } => {
                    if self
                        .net_cmd_tx
                        .send(NetCommand::Check { session, code })
                        .is_err()
                    {
                        let event = ScanEvent::CheckCompleted {
                            session,
                            result: Err(worker_gone()),
                        };
                        let follow_up = self.dispatcher.handle(now_ms, event);
                        self.execute(now_ms, follow_up);
                    }
                }
                ScanAction::SendMark { session, code } => {
                    if self
                        .net_cmd_tx
                        .send(NetCommand::Mark { session, code })
                        .is_err()
                    {
                        let event = ScanEvent::MarkCompleted {
                            session,
                            result: Err(worker_gone()),
                        };
                        let follow_up = self.dispatcher.handle(now_ms, event);
                        self.execute(now_ms, follow_up);
                    }
                }
                ScanAction::Feedback(cue) => {
                    if matches!(cue, FeedbackCue::Success { .. } | FeedbackCue::Error { .. }) {
                        self.record_result(now_ms);
                    }
                    self.presenter.present(&cue);
                }
            }
        }
    }

    fn start_camera(&mut self, now_ms: NowMs) {
        let callback = self.decode_callback();
        let result = self.camera.restart(callback);
        self.after_camera_start(now_ms, result);
    }

    fn switch_camera(&mut self, now_ms: NowMs, camera_id: &str) {
        if self.dispatcher.status().is_in_flight() {
            // 会话结束回到空闲时再用新设备启动
            match self.camera.select(camera_id) {
                Ok(()) => log::info!("Camera {} selected for next scan", camera_id),
                Err(err) => log::warn!("Camera switch rejected: {}", err),
            }
            return;
        }
        let callback = self.decode_callback();
        match self.camera.switch(camera_id, callback) {
            // 未知设备：保持当前解码循环与状态不变
            Err(CameraError::UnknownCamera(id)) => {
                log::warn!("Camera switch rejected: unknown camera {}", id);
            }
            result => self.after_camera_start(now_ms, result),
        }
    }

    fn after_camera_start(&mut self, now_ms: NowMs, result: Result<(), CameraError>) {
        let event = match result {
            Ok(()) => {
                self.camera_error = None;
                ScanEvent::CameraStarted
            }
            Err(err) => {
                let message = err.to_string();
                if self.camera_error.as_deref() != Some(message.as_str()) {
                    log::warn!("Camera start failed: {}", message);
                }
                self.camera_error = Some(message);
                ScanEvent::CameraStopped
            }
        };
        let actions = self.dispatcher.handle(now_ms, event);
        self.execute(now_ms, actions);
    }

    fn decode_callback(&self) -> DecodeCallback {
        let event_tx = self.event_tx.clone();
        Box::new(move |code| {
            let _ = event_tx.send(GateEvent::Scan(ScanEvent::Decoded { code }));
        })
    }

    fn observe_backend(&mut self, event: &ScanEvent) {
        let reachable = match event {
            ScanEvent::CheckCompleted { result, .. } => reachable_from(result),
            ScanEvent::MarkCompleted { result, .. } => reachable_from(result),
            _ => None,
        };
        if reachable.is_some() {
            self.backend_reachable = reachable;
        }
    }

    fn record_result(&mut self, now_ms: NowMs) {
        let state = self.dispatcher.state();
        let (Some(session), Some(code), Some(message)) = (state.session(), state.code(), state.message())
        else {
            return;
        };
        let record = ScanRecord {
            session,
            code: code.to_string(),
            status: state.status(),
            message: message.to_string(),
            finished_at_ms: now_ms,
        };
        if let Ok(mut status) = self.status.lock() {
            status.recent.push(record);
        }
    }

    fn publish(&self) {
        let Ok(mut status) = self.status.lock() else {
            return;
        };
        let state = self.dispatcher.state();
        status.status = state.status();
        status.session = state.session();
        status.code = state.code().map(str::to_string);
        status.message = state.message().map(str::to_string);
        let registration = state.registration();
        status.attendee = registration
            .and_then(|reg| reg.display_name())
            .map(str::to_string);
        status.attendee_email = registration.and_then(|reg| reg.attendee.email.clone());
        status.registration_type = registration.and_then(|reg| reg.registration_type.clone());
        status.cameras = self.camera.cameras().to_vec();
        status.selected_camera = self.camera.selected().map(str::to_string);
        status.active_camera = self.camera.active_camera().map(str::to_string);
        status.camera_error = self.camera_error.clone();
        status.backend_reachable = self.backend_reachable;
    }
}

/// 事件循环：等待事件或到期计时，收到 Shutdown 后退出。
pub fn run_event_loop<B: CaptureBackend, D: FeedbackDevice>(
    runtime: &mut GateRuntime<B, D>,
    event_rx: &Receiver<GateEvent>,
    clock: &MonotonicClock,
) {
    runtime.boot(clock.now_ms());
    loop {
        let now = clock.now_ms();
        runtime.poll(now);
        let wait_ms = runtime
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now).min(IDLE_WAIT_MS))
            .unwrap_or(IDLE_WAIT_MS)
            .max(1);
        match event_rx.recv_timeout(Duration::from_millis(wait_ms)) {
            Ok(event) => {
                if !runtime.handle_event(clock.now_ms(), event) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    runtime.shutdown();
}

/// 由请求结果推断后端可达性；请求未发出时返回 None（保持原值）。
fn reachable_from<T>(result: &Result<T, ServiceError>) -> Option<bool> {
    match result {
        Ok(_) => Some(true),
        Err(ServiceError::Transport(_)) => Some(false),
        Err(ServiceError::HttpStatus { .. } | ServiceError::Json(_)) => Some(true),
        Err(ServiceError::MissingToken | ServiceError::Token(_)) => None,
    }
}

fn worker_gone() -> ServiceError {
    ServiceError::Transport("network worker stopped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::FakeBackend;
    use crate::camera::DecodeConfig;
    use crate::feedback::NullFeedback;
    use crate::model::{Attendee, CheckResult, MarkReceipt, Registration};
    use std::sync::atomic::Ordering;

    struct Harness {
        runtime: GateRuntime<FakeBackend, NullFeedback>,
        backend: FakeBackend,
        net_rx: Receiver<NetCommand>,
        event_rx: Receiver<GateEvent>,
        status: Arc<Mutex<GateStatus>>,
    }

    impl Harness {
        fn new(backend: FakeBackend) -> Self {
            let settings = ScannerSettings::default();
            let channels = GateChannels::new();
            let status = Arc::new(Mutex::new(GateStatus::new(&settings)));
            let camera = CameraSessionManager::new(backend.clone(), DecodeConfig::from(&settings));
            let runtime = GateRuntime::new(
                &settings,
                camera,
                FeedbackPresenter::new(NullFeedback),
                channels.net_cmd_tx,
                channels.event_tx,
                status.clone(),
            );
            Self {
                runtime,
                backend,
                net_rx: channels.net_cmd_rx,
                event_rx: channels.event_rx,
                status,
            }
        }

        /// 模拟最近一次打开的设备解码出内容，并把事件交给运行时。
        fn decode(&mut self, now_ms: NowMs, code: &str) {
            {
                let mut callbacks = self.backend.callbacks.lock().unwrap();
                let callback = callbacks.last_mut().expect("camera never opened");
                callback(code.to_string());
            }
            let event = self.event_rx.try_recv().expect("decode event");
            assert!(self.runtime.handle_event(now_ms, event));
        }

        fn scan(&mut self, now_ms: NowMs, event: ScanEvent) {
            assert!(self.runtime.handle_event(now_ms, GateEvent::Scan(event)));
        }

        fn snapshot(&self) -> GateStatus {
            self.status.lock().unwrap().clone()
        }

        fn open_handles(&self) -> usize {
            self.backend.open_now.load(Ordering::SeqCst)
        }
    }

    fn valid() -> CheckResult {
        CheckResult::Valid(Registration {
            registration_number: Some("R-001".into()),
            registration_type: Some("delegate".into()),
            attendee: Attendee {
                name: Some("Jane Doe".into()),
                email: None,
            },
        })
    }

    #[test]
    fn successful_scan_restarts_camera_after_window() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[
            ("0", "Front Camera"),
            ("1", "Back Camera"),
        ]));
        h.runtime.boot(0);
        assert_eq!(h.snapshot().status, ScanStatus::AwaitingDecode);
        assert_eq!(h.snapshot().active_camera.as_deref(), Some("1"));

        h.decode(10, "AOA12345");
        assert_eq!(h.open_handles(), 0);
        assert!(matches!(
            h.net_rx.try_recv(),
            Ok(NetCommand::Check { session: 1, ref code }) if code == "AOA12345"
        ));

        h.scan(20, ScanEvent::CheckCompleted {
            session: 1,
            result: Ok(valid()),
        });
        assert!(matches!(h.net_rx.try_recv(), Ok(NetCommand::Mark { session: 1, .. })));
        assert_eq!(h.snapshot().status, ScanStatus::Marking);

        h.scan(30, ScanEvent::MarkCompleted {
            session: 1,
            result: Ok(MarkReceipt::default()),
        });
        let snapshot = h.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Success);
        assert_eq!(snapshot.attendee.as_deref(), Some("Jane Doe"));
        assert_eq!(snapshot.message.as_deref(), Some(crate::state::MARKED_MESSAGE));
        assert_eq!(snapshot.backend_reachable, Some(true));
        assert_eq!(snapshot.recent.success_count(), 1);
        assert_eq!(h.runtime.next_deadline(), Some(2030));

        h.runtime.poll(2029);
        assert_eq!(h.snapshot().status, ScanStatus::Success);
        h.runtime.poll(2030);
        assert_eq!(h.snapshot().status, ScanStatus::AwaitingDecode);
        assert_eq!(h.open_handles(), 1);
        assert_eq!(h.backend.max_open.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_failure_marks_backend_unreachable() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("0", "USB Camera")]));
        h.runtime.boot(0);
        h.scan(5, ScanEvent::TestScan {
            code: "AOA12345".into(),
        });
        let _ = h.net_rx.try_recv();
        h.scan(10, ScanEvent::CheckCompleted {
            session: 1,
            result: Err(ServiceError::Transport("connection refused".into())),
        });
        let snapshot = h.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Error);
        assert_eq!(snapshot.message.as_deref(), Some(crate::state::INVALID_QR_MESSAGE));
        assert_eq!(snapshot.backend_reachable, Some(false));
        assert_eq!(snapshot.recent.error_count(), 1);

        // 手动关闭立即恢复扫码
        h.scan(20, ScanEvent::Dismissed);
        assert_eq!(h.snapshot().status, ScanStatus::AwaitingDecode);
        assert_eq!(h.runtime.next_deadline(), None);
        assert_eq!(h.open_handles(), 1);
    }

    #[test]
    fn switching_camera_mid_session_only_reselects() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "Rear A"), ("b", "B")]));
        h.runtime.boot(0);
        h.decode(10, "AOA12345");
        assert!(h.runtime.handle_event(
            11,
            GateEvent::SwitchCamera {
                camera_id: "b".into()
            }
        ));
        assert_eq!(h.open_handles(), 0);
        assert_eq!(h.snapshot().selected_camera.as_deref(), Some("b"));

        h.scan(12, ScanEvent::CheckCompleted {
            session: 1,
            result: Ok(CheckResult::Invalid {
                reason: "Registration not found".into(),
            }),
        });
        h.scan(13, ScanEvent::Dismissed);
        assert_eq!(h.snapshot().active_camera.as_deref(), Some("b"));
    }

    #[test]
    fn failed_camera_start_leaves_gate_idle() {
        let backend = FakeBackend::with_cameras(&[("a", "A")]);
        backend.failing.lock().unwrap().push("a".into());
        let mut h = Harness::new(backend);
        h.runtime.boot(0);
        let snapshot = h.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Idle);
        assert!(snapshot.camera_error.is_some());

        // 测试扫码仍可用
        h.scan(5, ScanEvent::TestScan {
            code: "AOA12345".into(),
        });
        assert_eq!(h.snapshot().status, ScanStatus::Validating);
    }

    #[test]
    fn dead_network_worker_fails_the_session() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "A")]));
        h.runtime.boot(0);
        drop(std::mem::replace(&mut h.net_rx, mpsc::channel().1));
        h.decode(10, "AOA12345");
        let snapshot = h.snapshot();
        assert_eq!(snapshot.status, ScanStatus::Error);
        assert_eq!(snapshot.backend_reachable, None);
    }

    #[test]
    fn unknown_camera_switch_keeps_scanner_running() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "Rear A"), ("b", "B")]));
        h.runtime.boot(0);
        assert!(h.runtime.handle_event(
            5,
            GateEvent::SwitchCamera {
                camera_id: "zzz".into()
            }
        ));
        let snapshot = h.snapshot();
        assert_eq!(snapshot.status, ScanStatus::AwaitingDecode);
        assert_eq!(snapshot.active_camera.as_deref(), Some("a"));
        assert_eq!(snapshot.camera_error, None);
        assert_eq!(h.open_handles(), 1);

        // 扫码枪仍然可以开启新会话
        h.decode(10, "AOA12345");
        assert!(matches!(h.net_rx.try_recv(), Ok(NetCommand::Check { session: 1, .. })));
    }

    #[test]
    fn missing_token_leaves_reachability_unchanged() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "A")]));
        h.runtime.boot(0);
        h.scan(5, ScanEvent::TestScan {
            code: "AOA12345".into(),
        });
        h.scan(10, ScanEvent::CheckCompleted {
            session: 1,
            result: Err(ServiceError::MissingToken),
        });
        assert_eq!(h.snapshot().status, ScanStatus::Error);
        assert_eq!(h.snapshot().backend_reachable, None);

        h.scan(20, ScanEvent::Dismissed);
        h.scan(25, ScanEvent::TestScan {
            code: "AOA12345".into(),
        });
        h.scan(30, ScanEvent::CheckCompleted {
            session: 2,
            result: Err(ServiceError::HttpStatus {
                status: 409,
                message: None,
            }),
        });
        assert_eq!(h.snapshot().backend_reachable, Some(true));

        h.scan(40, ScanEvent::Dismissed);
        h.scan(45, ScanEvent::TestScan {
            code: "AOA12345".into(),
        });
        h.scan(50, ScanEvent::CheckCompleted {
            session: 3,
            result: Err(ServiceError::MissingToken),
        });
        assert_eq!(h.snapshot().backend_reachable, Some(true));
    }

    #[test]
    fn registration_details_are_published() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "A")]));
        h.runtime.boot(0);
        h.decode(10, "AOA12345");
        h.scan(20, ScanEvent::CheckCompleted {
            session: 1,
            result: Ok(CheckResult::Valid(Registration {
                registration_number: Some("R-001".into()),
                registration_type: Some("speaker".into()),
                attendee: Attendee {
                    name: Some("Jane Doe".into()),
                    email: Some("jane@example.com".into()),
                },
            })),
        });
        h.scan(30, ScanEvent::MarkCompleted {
            session: 1,
            result: Ok(MarkReceipt::default()),
        });
        let snapshot = h.snapshot();
        assert_eq!(snapshot.attendee_email.as_deref(), Some("jane@example.com"));
        assert_eq!(snapshot.registration_type.as_deref(), Some("speaker"));

        h.scan(40, ScanEvent::Dismissed);
        assert_eq!(h.snapshot().attendee_email, None);
    }

    #[test]
    fn backend_update_survives_stopped_worker() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "A")]));
        h.runtime.boot(0);
        drop(std::mem::replace(&mut h.net_rx, mpsc::channel().1));
        assert!(h.runtime.handle_event(
            5,
            GateEvent::SetBackend {
                base_url: "10.0.0.5:5000/api/".into()
            }
        ));
        assert_eq!(h.snapshot().backend_base_url, "http://10.0.0.5:5000/api");
    }

    #[test]
    fn shutdown_event_stops_the_loop() {
        let mut h = Harness::new(FakeBackend::with_cameras(&[("a", "A")]));
        h.runtime.boot(0);
        assert!(!h.runtime.handle_event(1, GateEvent::Shutdown));
        h.runtime.shutdown();
        assert_eq!(h.open_handles(), 0);
        assert_eq!(h.snapshot().active_camera, None);
    }
}
