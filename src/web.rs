use std::sync::mpsc::Sender;

use serde_json::{json, Value};

use crate::model::ScanStatus;
use crate::pipeline::{GateEvent, GateStatus};
use crate::state::ScanEvent;
use crate::token::TokenStore;

/// 操作员动作（由 Web UI 或控制台触发）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorAction {
    Dismiss,
    TestScan,
    SwitchCamera { camera_id: String },
    SetBackend { base_url: String },
    SetToken { token: String },
}

/// 最近记录的一行。
#[derive(Clone, Debug)]
pub struct HistoryRow {
    pub session: u32,
    pub code: String,
    pub status: ScanStatus,
    pub message: String,
}

/// Web UI 展示的状态面板数据。
#[derive(Clone, Debug)]
pub struct StatusPanel {
    pub status: ScanStatus,
    pub code: Option<String>,
    pub message: Option<String>,
    pub attendee: Option<String>,
    pub attendee_email: Option<String>,
    pub registration_type: Option<String>,
    pub cameras: Vec<(String, String)>,
    pub active_camera: Option<String>,
    pub selected_camera: Option<String>,
    pub camera_error: Option<String>,
    pub backend_base_url: String,
    pub backend_reachable: Option<bool>,
    pub location: String,
    pub test_code: String,
    pub success_count: u32,
    pub error_count: u32,
    pub history: Vec<HistoryRow>,
}

impl From<&GateStatus> for StatusPanel {
    fn from(status: &GateStatus) -> Self {
        Self {
            status: status.status,
            code: status.code.clone(),
            message: status.message.clone(),
            attendee: status.attendee.clone(),
            attendee_email: status.attendee_email.clone(),
            registration_type: status.registration_type.clone(),
            cameras: status
                .cameras
                .iter()
                .map(|camera| (camera.id.clone(), camera.label.clone()))
                .collect(),
            active_camera: status.active_camera.clone(),
            selected_camera: status.selected_camera.clone(),
            camera_error: status.camera_error.clone(),
            backend_base_url: status.backend_base_url.clone(),
            backend_reachable: status.backend_reachable,
            location: status.location.clone(),
            test_code: status.test_code.clone(),
            success_count: status.recent.success_count(),
            error_count: status.recent.error_count(),
            history: status
                .recent
                .newest_first()
                .map(|record| HistoryRow {
                    session: record.session,
                    code: record.code.clone(),
                    status: record.status,
                    message: record.message.clone(),
                })
                .collect(),
        }
    }
}

fn tone_class(status: ScanStatus) -> &'static str {
    match status {
        ScanStatus::Success => "tone-success",
        ScanStatus::Error => "tone-error",
        ScanStatus::Validating | ScanStatus::Marking => "tone-busy",
        ScanStatus::Idle | ScanStatus::AwaitingDecode => "tone-normal",
    }
}

fn reachability_label(reachable: Option<bool>) -> (&'static str, &'static str) {
    match reachable {
        Some(true) => ("dot-ok", "Reachable"),
        Some(false) => ("dot-bad", "Unreachable"),
        None => ("dot-unknown", "Unknown"),
    }
}

/// 渲染操作员页面（手工拼接 HTML）。
pub fn render_index(panel: &StatusPanel) -> String {
    let (dot_class, reach_text) = reachability_label(panel.backend_reachable);
    let headline = match panel.status {
        ScanStatus::Success => crate::state::SUCCESS_TITLE,
        ScanStatus::Error => crate::state::ERROR_TITLE,
        other => other.label(),
    };

    let mut html = String::new();
    html.push_str("<!doctype html><html><head><meta charset=\"utf-8\">");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">");
    html.push_str("<title>AttendGate Scanner</title>");
    html.push_str("<style>");
    html.push_str(":root{--bg:#0f172a;--panel:#0b1220;--text:#f8fafc;--muted:#94a3b8;");
    html.push_str("--accent:#f59e0b;--stroke:rgba(148,163,184,0.25);--ok:#10b981;--bad:#ef4444;}");
    html.push_str("*{box-sizing:border-box}body{margin:0;font-family:system-ui,sans-serif;color:var(--text);");
    html.push_str("background:linear-gradient(180deg,#0b1220,#111827);}h2{margin:0 0 12px 0;font-weight:600}");
    html.push_str(".screen{padding:24px 20px;border-bottom:1px solid var(--stroke);min-height:40vh;display:flex;flex-direction:column;gap:12px;}");
    html.push_str(".tone-normal{background:linear-gradient(135deg,#0b1220,#111827);}");
    html.push_str(".tone-busy{background:linear-gradient(135deg,rgba(245,158,11,0.45),rgba(15,23,42,0.95));}");
    html.push_str(".tone-success{background:linear-gradient(135deg,rgba(16,185,129,0.55),rgba(15,23,42,0.95));}");
    html.push_str(".tone-error{background:linear-gradient(135deg,rgba(239,68,68,0.6),rgba(15,23,42,0.95));}");
    html.push_str(".headline{font-size:36px;font-weight:700;}.sub{color:var(--muted);font-size:14px;}");
    html.push_str(".message{padding:12px 16px;border-radius:12px;background:rgba(255,255,255,0.08);font-size:18px;}");
    html.push_str(".operator{padding:20px;display:flex;flex-direction:column;gap:16px;background:var(--panel);}");
    html.push_str(".grid{display:grid;gap:12px;grid-template-columns:repeat(auto-fit,minmax(160px,1fr));}");
    html.push_str(".card{padding:12px;border-radius:12px;border:1px solid var(--stroke);background:rgba(2,6,23,0.6);}");
    html.push_str("button{padding:10px 14px;border-radius:12px;border:1px solid var(--stroke);background:#111827;color:var(--text);font-weight:600;}");
    html.push_str("button.primary{background:var(--accent);color:#0b1220;border-color:transparent;}");
    html.push_str("form{display:flex;flex-wrap:wrap;gap:8px;align-items:center;}");
    html.push_str("input,select{padding:10px 12px;border-radius:10px;border:1px solid var(--stroke);background:#0f172a;color:var(--text);min-width:160px;}");
    html.push_str(".status-dot{display:inline-block;width:8px;height:8px;border-radius:50%;margin-right:6px;}");
    html.push_str(".dot-ok{background:var(--ok)}.dot-bad{background:var(--bad)}.dot-unknown{background:var(--muted)}");
    html.push_str("table{width:100%;border-collapse:collapse;font-size:14px}td{padding:6px;border-bottom:1px solid var(--stroke)}");
    html.push_str("</style></head><body>");

    html.push_str("<section id=\"result-screen\" class=\"screen ");
    html.push_str(tone_class(panel.status));
    html.push_str("\">");
    html.push_str("<div class=\"sub\">");
    html.push_str(&escape_html(&panel.location));
    html.push_str(" · <span id=\"scan-status\">");
    html.push_str(panel.status.label());
    html.push_str("</span></div>");
    html.push_str("<div class=\"headline\" id=\"headline\">");
    html.push_str(&escape_html(headline));
    html.push_str("</div>");
    html.push_str("<div class=\"sub\">Attendee: <span id=\"attendee\">");
    html.push_str(&escape_html(panel.attendee.as_deref().unwrap_or("—")));
    html.push_str("</span> · Code: <span id=\"scan-code\">");
    html.push_str(&escape_html(panel.code.as_deref().unwrap_or("—")));
    html.push_str("</span></div>");
    if panel.attendee_email.is_some() || panel.registration_type.is_some() {
        html.push_str("<div class=\"sub\" id=\"registration\">");
        html.push_str(&escape_html(panel.attendee_email.as_deref().unwrap_or("")));
        if let Some(kind) = panel.registration_type.as_deref() {
            html.push_str(" · ");
            html.push_str(&escape_html(kind));
        }
        html.push_str("</div>");
    }
    html.push_str("<div class=\"message\" id=\"scan-message\">");
    html.push_str(&escape_html(panel.message.as_deref().unwrap_or("Ready to scan")));
    html.push_str("</div>");
    if matches!(panel.status, ScanStatus::Success | ScanStatus::Error) {
        html.push_str("<div><button class=\"primary\" onclick=\"location.href='/action?type=dismiss'\">Dismiss</button></div>");
    }
    html.push_str("</section>");

    html.push_str("<section class=\"operator\"><h2>Operator</h2><div class=\"grid\">");
    html.push_str("<div class=\"card\"><div class=\"sub\">Camera</div><div id=\"active-camera\">");
    html.push_str(&escape_html(panel.active_camera.as_deref().unwrap_or("stopped")));
    html.push_str("</div>");
    if let Some(err) = panel.camera_error.as_deref() {
        html.push_str("<div class=\"sub\" id=\"camera-error\">");
        html.push_str(&escape_html(err));
        html.push_str("</div>");
    }
    html.push_str("</div>");
    html.push_str("<div class=\"card\"><div class=\"sub\">Backend</div><div><span id=\"backend-dot\" class=\"status-dot ");
    html.push_str(dot_class);
    html.push_str("\"></span><span id=\"backend-text\">");
    html.push_str(reach_text);
    html.push_str("</span></div><div class=\"sub\" id=\"backend-address\">");
    html.push_str(&escape_html(&panel.backend_base_url));
    html.push_str("</div></div>");
    html.push_str("<div class=\"card\"><div class=\"sub\">Marked / Failed</div><div id=\"counters\">");
    html.push_str(&panel.success_count.to_string());
    html.push_str(" / ");
    html.push_str(&panel.error_count.to_string());
    html.push_str("</div></div></div>");

    html.push_str("<div class=\"grid\">");
    html.push_str("<button onclick=\"location.href='/action?type=test'\">Test scan (");
    html.push_str(&escape_html(&panel.test_code));
    html.push_str(")</button></div>");

    if !panel.cameras.is_empty() {
        html.push_str("<form action=\"/action\" method=\"get\"><input type=\"hidden\" name=\"type\" value=\"camera\"><select name=\"id\">");
        for (id, label) in &panel.cameras {
            html.push_str("<option value=\"");
            html.push_str(&escape_html(id));
            html.push('"');
            if panel.selected_camera.as_deref() == Some(id.as_str()) {
                html.push_str(" selected");
            }
            html.push('>');
            html.push_str(&escape_html(label));
            html.push_str("</option>");
        }
        html.push_str("</select><button type=\"submit\">Switch camera</button></form>");
    }

    html.push_str("<form action=\"/action\" method=\"get\"><input type=\"hidden\" name=\"type\" value=\"backend\">");
    html.push_str("<input id=\"backend-input\" name=\"url\" type=\"text\" placeholder=\"Backend, e.g. 192.168.1.20:5000/api\" value=\"");
    html.push_str(&escape_html(&panel.backend_base_url));
    html.push_str("\"><button type=\"submit\">Update backend</button></form>");
    html.push_str("<form action=\"/action\" method=\"get\"><input type=\"hidden\" name=\"type\" value=\"token\">");
    html.push_str("<input name=\"value\" type=\"password\" placeholder=\"Bearer token\">");
    html.push_str("<button type=\"submit\">Save token</button></form>");

    html.push_str("<table id=\"history\">");
    for row in &panel.history {
        html.push_str("<tr><td>#");
        html.push_str(&row.session.to_string());
        html.push_str("</td><td>");
        html.push_str(&escape_html(&row.code));
        html.push_str("</td><td>");
        html.push_str(row.status.label());
        html.push_str("</td><td>");
        html.push_str(&escape_html(&row.message));
        html.push_str("</td></tr>");
    }
    html.push_str("</table></section>");

    html.push_str("<script>");
    html.push_str("let last=null;");
    html.push_str("async function refresh(){try{const r=await fetch('/status',{cache:'no-store'});");
    html.push_str("if(!r.ok)return;const s=await r.json();const key=s.status+':'+s.session+':'+s.history.length;");
    html.push_str("if(last!==null&&last!==key&&document.activeElement.tagName!=='INPUT'){location.reload();}last=key;}catch(e){}}");
    html.push_str("refresh();setInterval(refresh,1000);");
    html.push_str("</script></body></html>");
    html
}

/// 状态接口的 JSON 载荷。
pub fn status_json(status: &GateStatus) -> Value {
    let history: Vec<Value> = status
        .recent
        .newest_first()
        .map(|record| {
            json!({
                "session": record.session,
                "code": record.code,
                "status": record.status.as_str(),
                "message": record.message,
                "finished_at_ms": record.finished_at_ms,
            })
        })
        .collect();
    let cameras: Vec<Value> = status
        .cameras
        .iter()
        .map(|camera| json!({ "id": camera.id, "label": camera.label }))
        .collect();
    json!({
        "status": status.status.as_str(),
        "session": status.session,
        "code": status.code,
        "message": status.message,
        "attendee": status.attendee,
        "attendee_email": status.attendee_email,
        "registration_type": status.registration_type,
        "location": status.location,
        "cameras": cameras,
        "selected_camera": status.selected_camera,
        "active_camera": status.active_camera,
        "camera_error": status.camera_error,
        "backend_base_url": status.backend_base_url,
        "backend_reachable": status.backend_reachable,
        "counters": {
            "success": status.recent.success_count(),
            "error": status.recent.error_count(),
        },
        "history": history,
    })
}

/// 解析 URL 查询字符串为 OperatorAction。
pub fn parse_action(query: &str) -> Option<OperatorAction> {
    let action_type = query_value(query, "type")?;
    match action_type.as_str() {
        "dismiss" => Some(OperatorAction::Dismiss),
        "test" => Some(OperatorAction::TestScan),
        "camera" => {
            let camera_id = non_blank(query_value(query, "id")?)?;
            Some(OperatorAction::SwitchCamera { camera_id })
        }
        "backend" => {
            let base_url = non_blank(query_value(query, "url")?)?;
            Some(OperatorAction::SetBackend { base_url })
        }
        "token" => {
            let token = non_blank(query_value(query, "value")?)?;
            Some(OperatorAction::SetToken { token })
        }
        _ => None,
    }
}

/// 执行操作员动作：扫码相关事件送入事件循环，令牌直接写入存储。
pub fn apply_action<K: TokenStore>(
    action: OperatorAction,
    event_tx: &Sender<GateEvent>,
    tokens: &K,
    test_code: &str,
) {
    let event = match action {
        OperatorAction::Dismiss => GateEvent::Scan(ScanEvent::Dismissed),
        OperatorAction::TestScan => GateEvent::Scan(ScanEvent::TestScan {
            code: test_code.to_string(),
        }),
        OperatorAction::SwitchCamera { camera_id } => GateEvent::SwitchCamera { camera_id },
        OperatorAction::SetBackend { base_url } => GateEvent::SetBackend { base_url },
        OperatorAction::SetToken { token } => {
            match tokens.store(&token) {
                Ok(()) => log::info!("Access token updated"),
                Err(err) => log::warn!("Access token not saved: {}", err),
            }
            return;
        }
    };
    if event_tx.send(event).is_err() {
        log::warn!("Operator action dropped: scanner runtime stopped");
    }
}

/// 解析控制台命令（以 `:` 开头的行）。
pub fn parse_console_command(line: &str) -> Option<OperatorAction> {
    let rest = line.trim().strip_prefix(':')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next()?.to_ascii_lowercase();
    let argument = parts.next().map(str::trim).unwrap_or("");
    match command.as_str() {
        "dismiss" => Some(OperatorAction::Dismiss),
        "test" => Some(OperatorAction::TestScan),
        "camera" => non_blank(argument.to_string()).map(|camera_id| OperatorAction::SwitchCamera { camera_id }),
        "backend" => non_blank(argument.to_string()).map(|base_url| OperatorAction::SetBackend { base_url }),
        "token" => non_blank(argument.to_string()).map(|token| OperatorAction::SetToken { token }),
        _ => None,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// 获取查询参数值（已 URL 解码）。
fn query_value(query: &str, key: &str) -> Option<String> {
    for part in query.split('&') {
        let mut iter = part.splitn(2, '=');
        let k = iter.next()?;
        let v = iter.next().unwrap_or("");
        if k == key {
            return Some(decode_component(v));
        }
    }
    None
}

/// URL 解码（处理 %xx 与 +），按 UTF-8 组装。
fn decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ScanRecord;
    use crate::model::{CameraDescriptor, ScannerSettings};

    #[test]
    fn parses_panel_actions() {
        assert_eq!(parse_action("type=dismiss"), Some(OperatorAction::Dismiss));
        assert_eq!(parse_action("type=test"), Some(OperatorAction::TestScan));
        assert_eq!(
            parse_action("type=camera&id=uart1"),
            Some(OperatorAction::SwitchCamera {
                camera_id: "uart1".into()
            })
        );
        assert_eq!(
            parse_action("type=backend&url=http%3A%2F%2F10.0.0.5%3A5000%2Fapi"),
            Some(OperatorAction::SetBackend {
                base_url: "http://10.0.0.5:5000/api".into()
            })
        );
        assert_eq!(parse_action("type=backend&url="), None);
        assert_eq!(parse_action("type=reboot"), None);
        assert_eq!(parse_action("id=uart1"), None);
    }

    #[test]
    fn decodes_utf8_percent_sequences() {
        assert_eq!(decode_component("Gate+%E5%85%A5%E5%8F%A3"), "Gate 入口");
        assert_eq!(decode_component("100%"), "100%");
        assert_eq!(decode_component("%zz"), "%zz");
    }

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_console_command(":dismiss"), Some(OperatorAction::Dismiss));
        assert_eq!(parse_console_command("  :TEST "), Some(OperatorAction::TestScan));
        assert_eq!(
            parse_console_command(":token  abc.def "),
            Some(OperatorAction::SetToken {
                token: "abc.def".into()
            })
        );
        assert_eq!(parse_console_command(":camera"), None);
        assert_eq!(parse_console_command("AOA12345"), None);
    }

    #[test]
    fn actions_route_to_events_and_token_store() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = crate::token::FileTokenStore::new(dir.path().join("token"));
        let (tx, rx) = std::sync::mpsc::channel();

        apply_action(OperatorAction::TestScan, &tx, &tokens, "AOA12345");
        apply_action(
            OperatorAction::SetToken {
                token: "abc".into(),
            },
            &tx,
            &tokens,
            "AOA12345",
        );
        apply_action(OperatorAction::Dismiss, &tx, &tokens, "AOA12345");

        match rx.try_recv().unwrap() {
            GateEvent::Scan(ScanEvent::TestScan { code }) => assert_eq!(code, "AOA12345"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            GateEvent::Scan(ScanEvent::Dismissed)
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(tokens.load().unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn index_escapes_server_text() {
        let mut status = GateStatus::new(&ScannerSettings::default());
        status.status = ScanStatus::Error;
        status.message = Some("<b>Registration not found</b>".into());
        status.cameras = vec![CameraDescriptor::new("stdin", "Keyboard wedge scanner")];
        let html = render_index(&StatusPanel::from(&status));
        assert!(html.contains("&lt;b&gt;Registration not found&lt;/b&gt;"));
        assert!(html.contains("Scan Failed"));
        assert!(html.contains("type=dismiss"));
        assert!(html.contains("Keyboard wedge scanner"));
    }

    #[test]
    fn registration_details_are_shown() {
        let mut status = GateStatus::new(&ScannerSettings::default());
        status.status = ScanStatus::Success;
        status.attendee = Some("Jane Doe".into());
        status.attendee_email = Some("jane@example.com".into());
        status.registration_type = Some("speaker".into());
        let html = render_index(&StatusPanel::from(&status));
        assert!(html.contains("jane@example.com · speaker"));

        let value = status_json(&status);
        assert_eq!(value["attendee_email"], "jane@example.com");
        assert_eq!(value["registration_type"], "speaker");

        let idle = GateStatus::new(&ScannerSettings::default());
        assert!(!render_index(&StatusPanel::from(&idle)).contains("id=\"registration\""));
    }

    #[test]
    fn status_json_lists_history_newest_first() {
        let mut status = GateStatus::new(&ScannerSettings::default());
        for session in 1..=2 {
            status.recent.push(ScanRecord {
                session,
                code: "AOA12345".into(),
                status: ScanStatus::Success,
                message: "Attendance marked".into(),
                finished_at_ms: u64::from(session) * 1000,
            });
        }
        let value = status_json(&status);
        assert_eq!(value["status"], "idle");
        assert_eq!(value["history"][0]["session"], 2);
        assert_eq!(value["counters"]["success"], 2);
        assert_eq!(value["backend_reachable"], Value::Null);
    }
}
