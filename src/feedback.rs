use std::fmt;

use crate::model::FeedbackCue;

/// 一个提示音（频率 + 时长）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tone {
    pub frequency_hz: u32,
    pub duration_ms: u32,
}

impl Tone {
    /// GPIO 方波参数：半周期（微秒）与周期数；频率为 0 时视为静音。
    pub fn square_wave(&self) -> Option<(u32, u32)> {
        if self.frequency_hz == 0 {
            return None;
        }
        let half_period_us = (500_000 / self.frequency_hz).max(1);
        let cycles = self.duration_ms.saturating_mul(self.frequency_hz) / 1000;
        Some((half_period_us, cycles))
    }
}

const fn tone(frequency_hz: u32, duration_ms: u32) -> Tone {
    Tone {
        frequency_hz,
        duration_ms,
    }
}

const PENDING_VIBRATION: &[u32] = &[60];
const PENDING_TONES: &[Tone] = &[tone(1500, 80)];
const SUCCESS_VIBRATION: &[u32] = &[120, 60, 120];
const SUCCESS_TONES: &[Tone] = &[tone(880, 120), tone(1320, 180)];
const ERROR_VIBRATION: &[u32] = &[400];
const ERROR_TONES: &[Tone] = &[tone(440, 200), tone(220, 300)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanelKind {
    Success,
    Error,
}

/// 结果面板内容。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Panel {
    pub kind: PanelKind,
    pub title: String,
    pub description: Option<String>,
}

/// 一次提示的完整编排（振动 + 音调 + 面板）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CuePlan {
    pub vibration_ms: &'static [u32],
    pub tones: &'static [Tone],
    pub panel: PanelChange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PanelChange {
    Keep,
    Show(Panel),
    Clear,
}

/// 反馈硬件访问失败（静默处理，不提示操作员）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    Unsupported,
    Device(String),
}

impl fmt::Display for FeedbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackError::Unsupported => f.write_str("not supported on this device"),
            FeedbackError::Device(msg) => write!(f, "device error: {}", msg),
        }
    }
}

impl std::error::Error for FeedbackError {}

/// 反馈设备：由构造方注入，测试可替换为 [`NullFeedback`]。
pub trait FeedbackDevice {
    fn vibrate(&mut self, pattern_ms: &[u32]) -> Result<(), FeedbackError>;
    fn play(&mut self, tones: &[Tone]) -> Result<(), FeedbackError>;
    fn show_panel(&mut self, panel: &Panel);
    fn clear_panel(&mut self);
}

/// 不做任何事的反馈设备。
#[derive(Clone, Copy, Debug, Default)]
pub struct NullFeedback;

impl FeedbackDevice for NullFeedback {
    fn vibrate(&mut self, _pattern_ms: &[u32]) -> Result<(), FeedbackError> {
        Ok(())
    }

    fn play(&mut self, _tones: &[Tone]) -> Result<(), FeedbackError> {
        Ok(())
    }

    fn show_panel(&mut self, _panel: &Panel) {}

    fn clear_panel(&mut self) {}
}

/// 提示 -> 振动/音调/面板 的映射。
pub fn cue_plan(cue: &FeedbackCue) -> CuePlan {
    match cue {
        FeedbackCue::Pending => CuePlan {
            vibration_ms: PENDING_VIBRATION,
            tones: PENDING_TONES,
            panel: PanelChange::Keep,
        },
        FeedbackCue::Success { title, description } => CuePlan {
            vibration_ms: SUCCESS_VIBRATION,
            tones: SUCCESS_TONES,
            panel: PanelChange::Show(Panel {
                kind: PanelKind::Success,
                title: title.clone(),
                description: description.clone(),
            }),
        },
        FeedbackCue::Error { title, description } => CuePlan {
            vibration_ms: ERROR_VIBRATION,
            tones: ERROR_TONES,
            panel: PanelChange::Show(Panel {
                kind: PanelKind::Error,
                title: title.clone(),
                description: description.clone(),
            }),
        },
        FeedbackCue::Clear => CuePlan {
            vibration_ms: &[],
            tones: &[],
            panel: PanelChange::Clear,
        },
    }
}

/// 反馈呈现器：无自身状态，所有副作用均为尽力而为。
pub struct FeedbackPresenter<D> {
    device: D,
}

impl<D: FeedbackDevice> FeedbackPresenter<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn present(&mut self, cue: &FeedbackCue) {
        let plan = cue_plan(cue);
        if !plan.vibration_ms.is_empty() {
            if let Err(err) = self.device.vibrate(plan.vibration_ms) {
                log::debug!("Vibration skipped: {}", err);
            }
        }
        if !plan.tones.is_empty() {
            if let Err(err) = self.device.play(plan.tones) {
                log::debug!("Tone skipped: {}", err);
            }
        }
        match plan.panel {
            PanelChange::Keep => {}
            PanelChange::Show(panel) => self.device.show_panel(&panel),
            PanelChange::Clear => self.device.clear_panel(),
        }
    }
}
