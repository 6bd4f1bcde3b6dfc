//! 摄像头会话管理：同一时刻只允许一个解码循环持有采集设备。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::model::{CameraDescriptor, ScannerSettings};

/// 摄像头相关错误。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    /// 没有可用的采集设备。
    NoCamera,
    UnknownCamera(String),
    /// 设备启动/切换失败。
    DeviceStart { camera_id: String, reason: String },
    Release(String),
    /// 采集端口读取失败。
    Read(String),
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraError::NoCamera => f.write_str("no camera found"),
            CameraError::UnknownCamera(id) => write!(f, "unknown camera {}", id),
            CameraError::DeviceStart { camera_id, reason } => {
                write!(f, "camera {} failed to start: {}", camera_id, reason)
            }
            CameraError::Release(reason) => write!(f, "camera release failed: {}", reason),
            CameraError::Read(reason) => write!(f, "capture read failed: {}", reason),
        }
    }
}

impl std::error::Error for CameraError {}

/// 解码参数（固定帧率）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeConfig {
    pub frames_per_second: u32,
}

impl DecodeConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.frames_per_second.max(1)))
    }
}

impl From<&ScannerSettings> for DecodeConfig {
    fn from(settings: &ScannerSettings) -> Self {
        Self {
            frames_per_second: settings.frames_per_second,
        }
    }
}

/// 解码成功回调。
pub type DecodeCallback = Box<dyn FnMut(String) + Send + 'static>;

/// 正在运行的采集会话。
pub trait CaptureSession {
    fn release(self) -> Result<(), CameraError>;
}

/// 平台采集后端。
pub trait CaptureBackend {
    type Session: CaptureSession;

    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError>;
    fn open(
        &mut self,
        camera: &CameraDescriptor,
        config: &DecodeConfig,
        on_decode: DecodeCallback,
    ) -> Result<Self::Session, CameraError>;
}

/// 每帧轮询一次的数据源。
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self, budget: Duration) -> Option<String>;
}

/// 通用解码循环：按固定帧间隔轮询数据源，停止时等待线程退出。
pub struct DecodeLoop {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DecodeLoop {
    pub fn spawn<S: FrameSource>(
        mut source: S,
        config: &DecodeConfig,
        mut on_decode: DecodeCallback,
    ) -> Result<Self, CameraError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let interval = config.frame_interval();
        let handle = thread::Builder::new()
            .name("decode-loop".to_string())
            .spawn(move || {
                let mut last: Option<String> = None;
                while flag.load(Ordering::Acquire) {
                    let started = std::time::Instant::now();
                    if let Some(code) = source.next_frame(interval) {
                        // 同一内容连续出现只回调一次
                        if last.as_deref() != Some(code.as_str()) && flag.load(Ordering::Acquire) {
                            on_decode(code.clone());
                        }
                        last = Some(code);
                    }
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
            })
            .map_err(|err| CameraError::DeviceStart {
                camera_id: String::new(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl CaptureSession for DecodeLoop {
    fn release(mut self) -> Result<(), CameraError> {
        self.running.store(false, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CameraError::Release("decode loop panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for DecodeLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 摄像头会话管理器。
pub struct CameraSessionManager<B: CaptureBackend> {
    backend: B,
    config: DecodeConfig,
    cameras: Option<Vec<CameraDescriptor>>,
    selected: Option<String>,
    active: Option<(String, B::Session)>,
}

impl<B: CaptureBackend> CameraSessionManager<B> {
    pub fn new(backend: B, config: DecodeConfig) -> Self {
        Self {
            backend,
            config,
            cameras: None,
            selected: None,
            active: None,
        }
    }

    /// 枚举设备（仅首次调用访问后端，之后返回缓存列表；枚举失败按空列表缓存）。
    pub fn list_cameras(&mut self) -> Result<&[CameraDescriptor], CameraError> {
        if self.cameras.is_none() {
            let found = match self.backend.enumerate() {
                Ok(found) => found,
                Err(err) => {
                    self.cameras = Some(Vec::new());
                    return Err(err);
                }
            };
            if self.selected.is_none() {
                self.selected = preferred_camera(&found).map(|cam| cam.id.clone());
            }
            self.cameras = Some(found);
        }
        match self.cameras.as_deref() {
            Some(cameras) if !cameras.is_empty() => Ok(cameras),
            _ => Err(CameraError::NoCamera),
        }
    }

    pub fn cameras(&self) -> &[CameraDescriptor] {
        self.cameras.as_deref().unwrap_or(&[])
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// 当前正在解码的设备。
    pub fn active_camera(&self) -> Option<&str> {
        self.active.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// 选择下一次启动使用的设备（不启动）。
    pub fn select(&mut self, camera_id: &str) -> Result<(), CameraError> {
        let camera = self.lookup(camera_id)?;
        self.selected = Some(camera.id);
        Ok(())
    }

    /// 启动指定设备；未知设备直接拒绝，不影响当前解码循环。
    /// 设备有效时先完全释放旧的解码循环再打开。
    pub fn start(&mut self, camera_id: &str, on_decode: DecodeCallback) -> Result<(), CameraError> {
        let camera = self.lookup(camera_id)?;
        self.stop();
        self.selected = Some(camera.id.clone());
        let session = self.backend.open(&camera, &self.config, on_decode)?;
        log::info!("Camera {} ({}) started", camera.id, camera.label);
        self.active = Some((camera.id, session));
        Ok(())
    }

    /// 使用已选设备重新启动。
    pub fn restart(&mut self, on_decode: DecodeCallback) -> Result<(), CameraError> {
        if self.selected.is_none() {
            self.list_cameras()?;
        }
        let camera_id = self.selected.clone().ok_or(CameraError::NoCamera)?;
        self.start(&camera_id, on_decode)
    }

    /// 停止解码循环（幂等，释放失败仅记录日志）。
    pub fn stop(&mut self) {
        if let Some((camera_id, session)) = self.active.take() {
            match session.release() {
                Ok(()) => log::info!("Camera {} stopped", camera_id),
                Err(err) => log::debug!("Camera {} release ignored: {}", camera_id, err),
            }
        }
    }

    pub fn switch(&mut self, camera_id: &str, on_decode: DecodeCallback) -> Result<(), CameraError> {
        self.start(camera_id, on_decode)
    }

    fn lookup(&mut self, camera_id: &str) -> Result<CameraDescriptor, CameraError> {
        self.list_cameras()?
            .iter()
            .find(|cam| cam.id == camera_id)
            .cloned()
            .ok_or_else(|| CameraError::UnknownCamera(camera_id.to_string()))
    }
}

impl<B: CaptureBackend> Drop for CameraSessionManager<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 默认设备：优先后置摄像头，否则取第一个。
fn preferred_camera(cameras: &[CameraDescriptor]) -> Option<&CameraDescriptor> {
    cameras
        .iter()
        .find(|cam| {
            let label = cam.label.to_lowercase();
            label.contains("back") || label.contains("rear")
        })
        .or_else(|| cameras.first())
}
