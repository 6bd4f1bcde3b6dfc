use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_hal::rmt::{config::TransmitConfig, FixedLengthSignal, PinState, Pulse, TxRmtDriver};
use esp_idf_hal::sys::EspError;
use esp_idf_hal::{peripheral::Peripheral, rmt::RmtChannel};
use smart_leds::{SmartLedsWrite, RGB8};

use crate::feedback::{FeedbackDevice, FeedbackError, Panel, PanelKind, Tone};

// 亮度缩放（约 30%）。
const BRIGHTNESS_SCALE: u8 = 77;

/// WS2812 智能灯封装（通过 RMT 发送）。
pub struct SmartLed<'d> {
    tx: TxRmtDriver<'d>,
}

impl<'d> SmartLed<'d> {
    pub fn new<C, P, Ch, Pin>(channel: C, pin: P) -> Result<Self, EspError>
    where
        C: Peripheral<P = Ch> + 'd,
        P: Peripheral<P = Pin> + 'd,
        Ch: RmtChannel,
        Pin: OutputPin,
    {
        let config = TransmitConfig::new().clock_divider(1);
        let tx = TxRmtDriver::new(channel, pin, &config)?;
        Ok(Self { tx })
    }

    pub fn set_color(&mut self, color: RGB8) -> Result<(), EspError> {
        self.write([color].into_iter())
    }

    fn apply_brightness(color: RGB8) -> RGB8 {
        let scale = BRIGHTNESS_SCALE as u16;
        let apply = |v| ((v as u16 * scale) / 255) as u8;
        RGB8 {
            r: apply(color.r),
            g: apply(color.g),
            b: apply(color.b),
        }
    }

    /// 生成 GRB 24bit 脉冲序列。
    fn render_signal(&self, color: RGB8) -> Result<FixedLengthSignal<24>, EspError> {
        let color = Self::apply_brightness(color);
        let grb: u32 = ((color.g as u32) << 16) | ((color.r as u32) << 8) | color.b as u32;
        let ticks_hz = self.tx.counter_clock()?;
        let (t0h, t0l, t1h, t1l) = (
            Pulse::new_with_duration(ticks_hz, PinState::High, &Duration::from_nanos(350))?,
            Pulse::new_with_duration(ticks_hz, PinState::Low, &Duration::from_nanos(800))?,
            Pulse::new_with_duration(ticks_hz, PinState::High, &Duration::from_nanos(700))?,
            Pulse::new_with_duration(ticks_hz, PinState::Low, &Duration::from_nanos(600))?,
        );
        let mut signal = FixedLengthSignal::<24>::new();
        for i in (0..24).rev() {
            let bit = (grb & (1 << i)) != 0;
            let (hi, lo) = if bit { (t1h, t1l) } else { (t0h, t0l) };
            signal.set(23 - i as usize, &(hi, lo))?;
        }
        Ok(signal)
    }
}

impl SmartLedsWrite for SmartLed<'_> {
    type Color = RGB8;
    type Error = EspError;

    fn write<T, I>(&mut self, iterator: T) -> Result<(), Self::Error>
    where
        T: IntoIterator<Item = I>,
        I: Into<Self::Color>,
    {
        let mut iter = iterator.into_iter();
        let color = iter.next().map(Into::into).unwrap_or(RGB8::default());
        let signal = self.render_signal(color)?;
        self.tx.start_blocking(&signal)?;
        Ok(())
    }
}

/// 无源蜂鸣器：在反馈线程内按音调频率翻转 GPIO 输出方波。
pub struct Buzzer {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl Buzzer {
    pub fn new(pin: PinDriver<'static, AnyOutputPin, Output>) -> Self {
        Self { pin }
    }

    fn play(&mut self, tone: Tone) -> Result<(), EspError> {
        let Some((half_period_us, cycles)) = tone.square_wave() else {
            thread::sleep(Duration::from_millis(u64::from(tone.duration_ms)));
            return Ok(());
        };
        for _ in 0..cycles {
            self.pin.set_high()?;
            Ets::delay_us(half_period_us);
            self.pin.set_low()?;
            Ets::delay_us(half_period_us);
        }
        Ok(())
    }
}

enum LedCommand {
    Vibrate(Vec<u32>),
    Play(Vec<Tone>),
    Color(RGB8),
}

/// 固件反馈设备：灯色 + 蜂鸣器 + 振动马达，由后台线程执行以免阻塞事件循环。
pub struct LedFeedback {
    tx: Sender<LedCommand>,
    has_buzzer: bool,
    has_motor: bool,
}

impl LedFeedback {
    pub fn spawn<C, P, Ch, Pin>(
        channel: C,
        pin: P,
        buzzer: Option<Buzzer>,
        motor: Option<PinDriver<'static, AnyOutputPin, Output>>,
    ) -> Self
    where
        C: Peripheral<P = Ch> + Send + 'static,
        P: Peripheral<P = Pin> + Send + 'static,
        Ch: RmtChannel + Send + 'static,
        Pin: OutputPin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let has_buzzer = buzzer.is_some();
        let has_motor = motor.is_some();
        thread::spawn(move || {
            let led = match SmartLed::new(channel, pin) {
                Ok(led) => Some(led),
                Err(err) => {
                    log::warn!("Smart LED init failed: {:?}", err);
                    None
                }
            };
            run_worker(rx, led, buzzer, motor);
        });
        Self {
            tx,
            has_buzzer,
            has_motor,
        }
    }

    fn send(&self, command: LedCommand) -> Result<(), FeedbackError> {
        self.tx
            .send(command)
            .map_err(|_| FeedbackError::Device("feedback worker stopped".to_string()))
    }
}

impl FeedbackDevice for LedFeedback {
    fn vibrate(&mut self, pattern_ms: &[u32]) -> Result<(), FeedbackError> {
        if !self.has_motor {
            return Err(FeedbackError::Unsupported);
        }
        self.send(LedCommand::Vibrate(pattern_ms.to_vec()))
    }

    fn play(&mut self, tones: &[Tone]) -> Result<(), FeedbackError> {
        if !self.has_buzzer {
            return Err(FeedbackError::Unsupported);
        }
        self.send(LedCommand::Play(tones.to_vec()))
    }

    fn show_panel(&mut self, panel: &Panel) {
        let _ = self.send(LedCommand::Color(panel_color(panel.kind)));
    }

    fn clear_panel(&mut self) {
        let _ = self.send(LedCommand::Color(RGB8::default()));
    }
}

fn run_worker(
    rx: Receiver<LedCommand>,
    mut led: Option<SmartLed<'static>>,
    mut buzzer: Option<Buzzer>,
    mut motor: Option<PinDriver<'static, AnyOutputPin, Output>>,
) {
    while let Ok(command) = rx.recv() {
        match command {
            LedCommand::Color(color) => {
                if let Some(led) = led.as_mut() {
                    if let Err(err) = led.set_color(color) {
                        log::warn!("Smart LED update failed: {:?}", err);
                    }
                }
            }
            LedCommand::Play(tones) => {
                if let Some(buzzer) = buzzer.as_mut() {
                    for tone in tones {
                        if let Err(err) = buzzer.play(tone) {
                            log::debug!("Buzzer failed: {:?}", err);
                            break;
                        }
                    }
                }
            }
            LedCommand::Vibrate(pattern) => {
                if let Some(motor) = motor.as_mut() {
                    // 偶数位为振动时长，奇数位为间隔
                    for (idx, ms) in pattern.iter().enumerate() {
                        let result = if idx % 2 == 0 {
                            motor.set_high()
                        } else {
                            motor.set_low()
                        };
                        if let Err(err) = result {
                            log::debug!("Vibration motor failed: {:?}", err);
                            break;
                        }
                        thread::sleep(Duration::from_millis(u64::from(*ms)));
                    }
                    let _ = motor.set_low();
                }
            }
        }
    }
}

fn panel_color(kind: PanelKind) -> RGB8 {
    match kind {
        PanelKind::Success => RGB8 { r: 0, g: 255, b: 0 },
        PanelKind::Error => RGB8 { r: 255, g: 0, b: 0 },
    }
}
