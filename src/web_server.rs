use std::sync::{mpsc::Sender, Arc, Mutex};

use embedded_svc::http::Method;
use embedded_svc::io::Write as _;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::io::EspIOError;
use serde_json::json;

use crate::pipeline::{GateEvent, GateStatus};
use crate::token::TokenStore;
use crate::web::{apply_action, parse_action, render_index, status_json, StatusPanel};

/// 启动内置 HTTP 服务（操作员结果面板）。
pub fn start_server<K: TokenStore>(
    status: Arc<Mutex<GateStatus>>,
    event_tx: Sender<GateEvent>,
    tokens: K,
) -> Result<EspHttpServer<'static>, EspIOError> {
    let mut server = EspHttpServer::new(&Configuration {
        stack_size: 8192,
        ..Default::default()
    })?;

    // 首页：渲染 HTML
    let status_root = status.clone();
    server.fn_handler("/", Method::Get, move |req| {
        let page = match status_root.lock() {
            Ok(status) => render_index(&StatusPanel::from(&*status)),
            Err(_) => "<!doctype html><p>Scanner status unavailable</p>".to_string(),
        };
        req.into_response(200, Some("OK"), &[("content-type", "text/html; charset=utf-8")])?
            .write_all(page.as_bytes())
            .map(|_| ())
    })?;

    // 状态接口：JSON
    let status_json_state = status.clone();
    server.fn_handler("/status", Method::Get, move |req| {
        let payload = match status_json_state.lock() {
            Ok(status) => status_json(&status),
            Err(_) => json!({ "status": "unknown" }),
        };
        let body = payload.to_string();
        req.into_response(200, Some("OK"), &[("content-type", "application/json")])?
            .write_all(body.as_bytes())
            .map(|_| ())
    })?;

    // 操作接口：通过 query 参数触发动作
    let status_action = status.clone();
    let event_action = Mutex::new(event_tx);
    server.fn_handler("/action", Method::Get, move |req| {
        if let Some(query) = req.uri().splitn(2, '?').nth(1) {
            if let Some(action) = parse_action(query) {
                let test_code = status_action
                    .lock()
                    .map(|s| s.test_code.clone())
                    .unwrap_or_default();
                if let Ok(event_tx) = event_action.lock() {
                    apply_action(action, &event_tx, &tokens, &test_code);
                }
            }
        }
        req.into_response(303, Some("See Other"), &[("Location", "/")])?
            .write_all(b"")
            .map(|_| ())
    })?;

    Ok(server)
}
