use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use attend_gate::camera::{CameraSessionManager, DecodeConfig};
use attend_gate::feedback::{FeedbackDevice, FeedbackError, FeedbackPresenter, Panel, Tone};
use attend_gate::model::{
    Attendee, CameraDescriptor, CheckResult, MarkReceipt, Registration, ScanStatus, ScannerSettings,
};
use attend_gate::net::{spawn_network_loop, AttendanceService, ServiceError};
use attend_gate::pipeline::{
    run_event_loop, GateChannels, GateEvent, GateRuntime, GateStatus, MonotonicClock,
};
use attend_gate::scanner::{ByteQueuePort, LineScannerBackend};
use attend_gate::state::ScanEvent;

type Log = Arc<Mutex<Vec<String>>>;

/// 固定应答的签到服务：AOA12345 有效，其余无效。
struct ScriptedService {
    calls: Log,
    mark_delay: Duration,
}

impl AttendanceService for ScriptedService {
    fn check(&self, qr_code: &str) -> Result<CheckResult, ServiceError> {
        self.calls.lock().unwrap().push(format!("check:{}", qr_code));
        if qr_code == "AOA12345" {
            Ok(CheckResult::Valid(Registration {
                registration_number: Some("R-0001".into()),
                registration_type: Some("delegate".into()),
                attendee: Attendee {
                    name: Some("Jane Doe".into()),
                    email: Some("jane@example.com".into()),
                },
            }))
        } else {
            Ok(CheckResult::Invalid {
                reason: "Registration not found".into(),
            })
        }
    }

    fn mark(&self, qr_code: &str) -> Result<MarkReceipt, ServiceError> {
        thread::sleep(self.mark_delay);
        self.calls.lock().unwrap().push(format!("mark:{}", qr_code));
        Ok(MarkReceipt {
            message: Some("Attendance marked".into()),
        })
    }
}

struct RecordingFeedback {
    log: Log,
}

impl FeedbackDevice for RecordingFeedback {
    fn vibrate(&mut self, pattern_ms: &[u32]) -> Result<(), FeedbackError> {
        self.log.lock().unwrap().push(format!("vibrate:{:?}", pattern_ms));
        Ok(())
    }

    fn play(&mut self, _tones: &[Tone]) -> Result<(), FeedbackError> {
        Err(FeedbackError::Unsupported)
    }

    fn show_panel(&mut self, panel: &Panel) {
        self.log.lock().unwrap().push(format!("panel:{}", panel.title));
    }

    fn clear_panel(&mut self) {
        self.log.lock().unwrap().push("clear".into());
    }
}

struct Gate {
    port: ByteQueuePort,
    event_tx: Sender<GateEvent>,
    status: Arc<Mutex<GateStatus>>,
    calls: Log,
    feedback: Log,
    handle: Option<thread::JoinHandle<()>>,
}

impl Gate {
    fn start(mark_delay: Duration) -> Self {
        let settings = ScannerSettings {
            frames_per_second: 50,
            success_display_ms: 300,
            error_display_ms: 300,
            ..ScannerSettings::default()
        };
        let calls: Log = Arc::default();
        let feedback: Log = Arc::default();
        let GateChannels {
            event_tx,
            event_rx,
            net_cmd_tx,
            net_cmd_rx,
        } = GateChannels::new();
        let status = Arc::new(Mutex::new(GateStatus::new(&settings)));
        let service = ScriptedService {
            calls: calls.clone(),
            mark_delay,
        };
        spawn_network_loop(service, net_cmd_rx, event_tx.clone());

        let port = ByteQueuePort::new();
        let backend = LineScannerBackend::new(vec![(
            CameraDescriptor::new("stdin", "Keyboard wedge scanner"),
            port.clone(),
        )]);
        let mut runtime = GateRuntime::new(
            &settings,
            CameraSessionManager::new(backend, DecodeConfig::from(&settings)),
            FeedbackPresenter::new(RecordingFeedback {
                log: feedback.clone(),
            }),
            net_cmd_tx,
            event_tx.clone(),
            status.clone(),
        );
        let handle = thread::spawn(move || {
            run_event_loop(&mut runtime, &event_rx, &MonotonicClock::new());
        });
        let gate = Self {
            port,
            event_tx,
            status,
            calls,
            feedback,
            handle: Some(handle),
        };
        gate.wait_for(ScanStatus::AwaitingDecode);
        gate
    }

    fn wait_for(&self, wanted: ScanStatus) -> GateStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.status.lock().unwrap().clone();
            if snapshot.status == wanted {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}, still {:?}",
                wanted,
                snapshot.status
            );
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        let _ = self.event_tx.send(GateEvent::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn valid_code_is_checked_marked_and_scanning_resumes() {
    let gate = Gate::start(Duration::ZERO);
    gate.port.feed_line("AOA12345");

    let success = gate.wait_for(ScanStatus::Success);
    assert_eq!(success.attendee.as_deref(), Some("Jane Doe"));
    assert_eq!(success.message.as_deref(), Some("Attendance marked"));
    assert_eq!(success.active_camera, None);

    let resumed = gate.wait_for(ScanStatus::AwaitingDecode);
    assert_eq!(resumed.active_camera.as_deref(), Some("stdin"));
    assert_eq!(resumed.recent.success_count(), 1);
    assert_eq!(gate.calls(), vec!["check:AOA12345", "mark:AOA12345"]);

    let feedback = gate.feedback.lock().unwrap().clone();
    assert_eq!(
        feedback,
        vec!["vibrate:[60]", "vibrate:[120, 60, 120]", "panel:Entry Marked", "clear"]
    );
}

#[test]
fn invalid_code_shows_reason_and_never_marks() {
    let gate = Gate::start(Duration::ZERO);
    gate.port.feed_line("BADCODE");

    let error = gate.wait_for(ScanStatus::Error);
    assert_eq!(error.message.as_deref(), Some("Registration not found"));
    assert_eq!(error.code.as_deref(), Some("BADCODE"));

    gate.event_tx
        .send(GateEvent::Scan(ScanEvent::Dismissed))
        .unwrap();
    let resumed = gate.wait_for(ScanStatus::AwaitingDecode);
    assert_eq!(resumed.recent.error_count(), 1);
    assert_eq!(gate.calls(), vec!["check:BADCODE"]);
}

#[test]
fn decodes_during_marking_are_ignored() {
    let gate = Gate::start(Duration::from_millis(300));
    gate.port.feed_line("AOA12345");
    gate.wait_for(ScanStatus::Marking);

    gate.port.feed_line("OTHER1");
    gate.event_tx
        .send(GateEvent::Scan(ScanEvent::Decoded {
            code: "OTHER2".into(),
        }))
        .unwrap();
    gate.event_tx
        .send(GateEvent::Scan(ScanEvent::TestScan {
            code: "AOA12345".into(),
        }))
        .unwrap();

    let success = gate.wait_for(ScanStatus::Success);
    assert_eq!(success.session, Some(1));
    gate.wait_for(ScanStatus::AwaitingDecode);
    assert_eq!(gate.calls(), vec!["check:AOA12345", "mark:AOA12345"]);
}

#[test]
fn test_scan_runs_the_same_flow_without_camera_input() {
    let gate = Gate::start(Duration::ZERO);
    gate.event_tx
        .send(GateEvent::Scan(ScanEvent::TestScan {
            code: "AOA12345".into(),
        }))
        .unwrap();
    let success = gate.wait_for(ScanStatus::Success);
    assert_eq!(success.attendee.as_deref(), Some("Jane Doe"));
    assert_eq!(gate.calls(), vec!["check:AOA12345", "mark:AOA12345"]);
}
