//! 主机端控制台：键盘楔形扫码枪把条码当作一行文本输入到 stdin，
//! 以 `:` 开头的行是操作员命令。

use std::io::{self, BufRead, Write as _};
use std::sync::mpsc::Sender;
use std::thread;

use crate::feedback::{FeedbackDevice, FeedbackError, Panel, PanelKind, Tone};
use crate::pipeline::GateEvent;
use crate::scanner::ByteQueuePort;
use crate::token::TokenStore;
use crate::web::{apply_action, parse_console_command};

const HELP: &str = "commands: :dismiss  :test  :camera <id>  :backend <url>  :token <value>  :quit";

/// 一行输入的处理结果。
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleFlow {
    Continue,
    Quit,
}

/// 分发一行 stdin 输入：命令交给操作员动作，其余当作扫码数据。
pub fn route_console_line<K: TokenStore>(
    line: &str,
    port: &ByteQueuePort,
    event_tx: &Sender<GateEvent>,
    tokens: &K,
    test_code: &str,
) -> ConsoleFlow {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ConsoleFlow::Continue;
    }
    if !trimmed.starts_with(':') {
        port.feed_line(trimmed);
        return ConsoleFlow::Continue;
    }
    if trimmed.eq_ignore_ascii_case(":quit") {
        let _ = event_tx.send(GateEvent::Shutdown);
        return ConsoleFlow::Quit;
    }
    match parse_console_command(trimmed) {
        Some(action) => apply_action(action, event_tx, tokens, test_code),
        None => log::warn!("Unknown command {:?}; {}", trimmed, HELP),
    }
    ConsoleFlow::Continue
}

/// 启动 stdin 读取线程；EOF 时请求退出。
pub fn spawn_console_reader<K: TokenStore>(
    port: ByteQueuePort,
    event_tx: Sender<GateEvent>,
    tokens: K,
    test_code: String,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            log::info!("{}", HELP);
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        log::warn!("stdin read failed: {}", err);
                        break;
                    }
                };
                if route_console_line(&line, &port, &event_tx, &tokens, &test_code) == ConsoleFlow::Quit {
                    return;
                }
            }
            let _ = event_tx.send(GateEvent::Shutdown);
        })
}

/// 控制台反馈：结果写日志，提示音用终端响铃，无振动。
#[derive(Debug, Default)]
pub struct ConsoleFeedback {
    bell: bool,
}

impl ConsoleFeedback {
    pub fn new(bell: bool) -> Self {
        Self { bell }
    }
}

impl FeedbackDevice for ConsoleFeedback {
    fn vibrate(&mut self, _pattern_ms: &[u32]) -> Result<(), FeedbackError> {
        Err(FeedbackError::Unsupported)
    }

    fn play(&mut self, _tones: &[Tone]) -> Result<(), FeedbackError> {
        if !self.bell {
            return Err(FeedbackError::Unsupported);
        }
        let mut stderr = io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|_| stderr.flush())
            .map_err(|err| FeedbackError::Device(err.to_string()))
    }

    fn show_panel(&mut self, panel: &Panel) {
        let description = panel.description.as_deref().unwrap_or("");
        match panel.kind {
            PanelKind::Success => log::info!("[{}] {}", panel.title, description),
            PanelKind::Error => log::warn!("[{}] {}", panel.title, description),
        }
    }

    fn clear_panel(&mut self) {
        log::info!("Ready to scan");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ScanEvent;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::scanner::ScannerPort;

    #[test]
    fn scans_and_commands_are_routed_separately() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = crate::token::FileTokenStore::new(dir.path().join("token"));
        let mut port = ByteQueuePort::new();
        let (tx, rx) = mpsc::channel();

        let flow = route_console_line(" AOA12345 \n", &port, &tx, &tokens, "AOA12345");
        assert_eq!(flow, ConsoleFlow::Continue);
        let mut buf = [0u8; 32];
        let count = port.read_chunk(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..count], b"AOA12345\n");

        route_console_line(":dismiss", &port, &tx, &tokens, "AOA12345");
        assert!(matches!(rx.try_recv(), Ok(GateEvent::Scan(ScanEvent::Dismissed))));

        route_console_line(":bogus", &port, &tx, &tokens, "AOA12345");
        assert!(rx.try_recv().is_err());

        assert_eq!(
            route_console_line(":quit", &port, &tx, &tokens, "AOA12345"),
            ConsoleFlow::Quit
        );
        assert!(matches!(rx.try_recv(), Ok(GateEvent::Shutdown)));
    }
}
