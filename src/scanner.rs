use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::camera::{CameraError, CaptureBackend, DecodeCallback, DecodeConfig, DecodeLoop, FrameSource};
use crate::model::CameraDescriptor;

/// 单行最大长度，超长视为噪声丢弃。
pub const MAX_LINE_LEN: usize = 512;

/// 行组装器：逐字节拼出扫码头输出的一行（CR/LF/CRLF 结尾）。
pub struct LineAssembler {
    buffer: Vec<u8>,
    overflow: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            overflow: false,
        }
    }

    /// 推入一个字节，若组装出非空行则返回。
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if byte == b'\r' || byte == b'\n' {
            let overflow = std::mem::replace(&mut self.overflow, false);
            let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
            self.buffer.clear();
            if overflow || line.is_empty() {
                return None;
            }
            return Some(line);
        }
        if self.buffer.len() >= MAX_LINE_LEN {
            self.overflow = true;
            return None;
        }
        self.buffer.push(byte);
        None
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflow = false;
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// 扫码头字节端口（UART、stdin 等）。
pub trait ScannerPort: Clone + Send + 'static {
    /// 在超时内读取字节，无数据返回 0。
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CameraError>;
    /// 丢弃暂停期间积压的数据。
    fn discard_pending(&mut self) {}
}

/// 内存字节队列端口，由其他线程写入。
#[derive(Clone, Default)]
pub struct ByteQueuePort {
    inner: Arc<(Mutex<VecDeque<u8>>, Condvar)>,
}

impl ByteQueuePort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, bytes: &[u8]) {
        let (queue, ready) = &*self.inner;
        if let Ok(mut queue) = queue.lock() {
            queue.extend(bytes.iter().copied());
            ready.notify_all();
        }
    }

    /// 以一行的形式写入。
    pub fn feed_line(&self, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.feed(&bytes);
    }
}

impl ScannerPort for ByteQueuePort {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, CameraError> {
        let (queue, ready) = &*self.inner;
        let guard = queue
            .lock()
            .map_err(|_| CameraError::Read("scanner queue poisoned".to_string()))?;
        let (mut guard, _) = ready
            .wait_timeout_while(guard, timeout, |queue| queue.is_empty())
            .map_err(|_| CameraError::Read("scanner queue poisoned".to_string()))?;
        let count = buf.len().min(guard.len());
        for (slot, byte) in buf.iter_mut().zip(guard.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn discard_pending(&mut self) {
        if let Ok(mut queue) = self.inner.0.lock() {
            queue.clear();
        }
    }
}

/// 把端口字节流转换为逐帧解码结果。
pub struct PortFrameSource<P> {
    port: P,
    assembler: LineAssembler,
    pending: VecDeque<String>,
}

impl<P: ScannerPort> PortFrameSource<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            assembler: LineAssembler::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<P: ScannerPort> FrameSource for PortFrameSource<P> {
    fn next_frame(&mut self, budget: Duration) -> Option<String> {
        if let Some(line) = self.pending.pop_front() {
            return Some(line);
        }
        let mut buf = [0u8; 128];
        match self.port.read_chunk(&mut buf, budget) {
            Ok(count) => {
                for &byte in &buf[..count] {
                    if let Some(line) = self.assembler.push(byte) {
                        self.pending.push_back(line);
                    }
                }
            }
            Err(err) => {
                log::warn!("Scanner read error: {}", err);
            }
        }
        self.pending.pop_front()
    }
}

/// 串行扫码头后端：设备列表固定，每个设备对应一个端口。
pub struct LineScannerBackend<P> {
    ports: Vec<(CameraDescriptor, P)>,
}

impl<P: ScannerPort> LineScannerBackend<P> {
    pub fn new(ports: Vec<(CameraDescriptor, P)>) -> Self {
        Self { ports }
    }
}

impl<P: ScannerPort> CaptureBackend for LineScannerBackend<P> {
    type Session = DecodeLoop;

    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError> {
        Ok(self.ports.iter().map(|(camera, _)| camera.clone()).collect())
    }

    fn open(
        &mut self,
        camera: &CameraDescriptor,
        config: &DecodeConfig,
        on_decode: DecodeCallback,
    ) -> Result<DecodeLoop, CameraError> {
        let (_, port) = self
            .ports
            .iter()
            .find(|(candidate, _)| candidate.id == camera.id)
            .ok_or_else(|| CameraError::UnknownCamera(camera.id.clone()))?;
        let mut port = port.clone();
        // 暂停期间的扫码不计入
        port.discard_pending();
        DecodeLoop::spawn(PortFrameSource::new(port), config, on_decode).map_err(|err| match err {
            CameraError::DeviceStart { reason, .. } => CameraError::DeviceStart {
                camera_id: camera.id.clone(),
                reason,
            },
            other => other,
        })
    }
}
