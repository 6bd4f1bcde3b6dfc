use std::sync::{Arc, Mutex};
use std::time::Duration;

use attend_gate::camera::{CameraSessionManager, DecodeConfig};
use attend_gate::config::GateConfig;
use attend_gate::feedback::FeedbackPresenter;
use attend_gate::model::CameraDescriptor;
use attend_gate::net::{spawn_network_loop, HttpAttendanceService};
use attend_gate::pipeline::{run_event_loop, GateChannels, GateRuntime, GateStatus, MonotonicClock};
use attend_gate::scanner::LineScannerBackend;

type BoxError = Box<dyn std::error::Error>;

#[cfg(target_os = "espidf")]
fn main() {
    // ESP-IDF 运行时初始化（链接补丁 & 日志）
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("AttendGate scanner booting (ESP-IDF)...");
    if let Err(err) = run_firmware() {
        log::error!("Scanner firmware stopped: {}", err);
    }
    // 出错后保持任务存活，便于串口查看日志
    loop {
        esp_idf_hal::delay::FreeRtos::delay_ms(1000);
    }
}

#[cfg(target_os = "espidf")]
fn run_firmware() -> Result<(), BoxError> {
    use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, OutputPin as _, PinDriver};
    use esp_idf_hal::prelude::*;
    use esp_idf_hal::uart;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use attend_gate::esp_http::{connect_wifi, EspHttpTransport, NvsTokenStore};
    use attend_gate::smart_led::{Buzzer, LedFeedback};
    use attend_gate::uart_link::UartScannerPort;

    let settings = GateConfig::compiled().settings;

    // 外设初始化：UART 扫码模块 + LED + 蜂鸣器 + 振动马达
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let nvs = EspDefaultNvsPartition::take()?;
    let uart_config = uart::config::Config::new().baudrate(Hertz(9_600));
    let uart = uart::UartDriver::new(
        peripherals.uart1,
        pins.gpio17,
        pins.gpio18,
        AnyInputPin::none(),
        AnyOutputPin::none(),
        &uart_config,
    )?;
    let (_uart_tx, uart_rx) = uart.into_split();

    let buzzer = Buzzer::new(PinDriver::output(pins.gpio4.downgrade_output())?);
    let motor = PinDriver::output(pins.gpio5.downgrade_output())?;
    let feedback = LedFeedback::spawn(peripherals.rmt.channel0, pins.gpio48, Some(buzzer), Some(motor));

    // 连接 Wi-Fi（失败不阻塞主流程，后端状态显示为不可达）
    let _wifi = match connect_wifi(peripherals.modem, Some(nvs.clone())) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            log::warn!("Wi-Fi connect failed: {}", err);
            None
        }
    };

    let GateChannels {
        event_tx,
        event_rx,
        net_cmd_tx,
        net_cmd_rx,
    } = GateChannels::new();
    let status = Arc::new(Mutex::new(GateStatus::new(&settings)));

    let tokens = NvsTokenStore::new(nvs)?;
    let transport = EspHttpTransport::new(Duration::from_secs(settings.request_timeout_secs));
    let service = HttpAttendanceService::new(&settings, transport, tokens.clone());
    let _net_handle = spawn_network_loop(service, net_cmd_rx, event_tx.clone());

    let _server = match attend_gate::web_server::start_server(status.clone(), event_tx.clone(), tokens) {
        Ok(server) => Some(server),
        Err(err) => {
            log::warn!("Web server start failed: {:?}", err);
            None
        }
    };

    let backend = LineScannerBackend::new(vec![(
        CameraDescriptor::new("uart1", "Rear QR module (UART1)"),
        UartScannerPort::new(uart_rx),
    )]);
    let camera = CameraSessionManager::new(backend, DecodeConfig::from(&settings));
    let mut runtime = GateRuntime::new(
        &settings,
        camera,
        FeedbackPresenter::new(feedback),
        net_cmd_tx,
        event_tx,
        status,
    );
    run_event_loop(&mut runtime, &event_rx, &MonotonicClock::new());
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("AttendGate scanner starting (host)...");
    if let Err(err) = run_host() {
        log::error!("Scanner stopped: {}", err);
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "espidf"))]
fn run_host() -> Result<(), BoxError> {
    use attend_gate::console::{spawn_console_reader, ConsoleFeedback};
    use attend_gate::http_client::ReqwestTransport;
    use attend_gate::scanner::ByteQueuePort;
    use attend_gate::token::{FileTokenStore, TokenStore};

    let config = GateConfig::from_env();
    let settings = config.settings;
    log::info!(
        "Backend {} · location {:?} · token file {}",
        settings.backend_base_url,
        settings.location,
        config.token_file.display()
    );

    let tokens = FileTokenStore::new(config.token_file);
    match tokens.load() {
        Ok(Some(_)) => {}
        Ok(None) => log::warn!("No access token stored; enter `:token <value>` before scanning"),
        Err(err) => log::warn!("Access token unreadable: {}", err),
    }

    let GateChannels {
        event_tx,
        event_rx,
        net_cmd_tx,
        net_cmd_rx,
    } = GateChannels::new();
    let status = Arc::new(Mutex::new(GateStatus::new(&settings)));

    let transport = ReqwestTransport::new(Duration::from_secs(settings.request_timeout_secs))?;
    let service = HttpAttendanceService::new(&settings, transport, tokens.clone());
    let _net_handle = spawn_network_loop(service, net_cmd_rx, event_tx.clone());

    // 键盘楔形扫码枪：stdin 每行一个条码
    let port = ByteQueuePort::new();
    let _console = spawn_console_reader(port.clone(), event_tx.clone(), tokens, settings.test_code.clone())?;
    let backend = LineScannerBackend::new(vec![(
        CameraDescriptor::new("stdin", "Keyboard wedge scanner"),
        port,
    )]);

    let camera = CameraSessionManager::new(backend, DecodeConfig::from(&settings));
    let mut runtime = GateRuntime::new(
        &settings,
        camera,
        FeedbackPresenter::new(ConsoleFeedback::new(true)),
        net_cmd_tx,
        event_tx,
        status,
    );
    run_event_loop(&mut runtime, &event_rx, &MonotonicClock::new());
    Ok(())
}
