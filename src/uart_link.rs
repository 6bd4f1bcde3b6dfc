use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use esp_idf_hal::delay::TickType;
use esp_idf_hal::uart::UartRxDriver;

use crate::camera::CameraError;
use crate::scanner::ScannerPort;

/// UART 扫码模块端口（模块按行输出解码结果）。
#[derive(Clone)]
pub struct UartScannerPort {
    rx: Arc<UartRxDriver<'static>>,
}

impl UartScannerPort {
    pub fn new(rx: UartRxDriver<'static>) -> Self {
        Self { rx: Arc::new(rx) }
    }
}

impl ScannerPort for UartScannerPort {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CameraError> {
        let ticks = TickType::new_millis(timeout.as_millis() as u64).ticks();
        match self.rx.read(buf, ticks) {
            Ok(count) => {
                log_bytes("UART RX:", &buf[..count]);
                Ok(count)
            }
            Err(err) => Err(CameraError::Read(format!("{:?}", err))),
        }
    }

    fn discard_pending(&mut self) {
        if let Err(err) = self.rx.clear() {
            log::debug!("UART RX clear failed: {:?}", err);
        }
    }
}

fn log_bytes(prefix: &str, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    let mut line = String::with_capacity(prefix.len() + bytes.len() * 3);
    line.push_str(prefix);
    line.push(' ');
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{:02X}", byte);
    }
    log::debug!("{}", line);
}
