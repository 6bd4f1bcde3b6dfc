use core::convert::TryInto;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embedded_svc::http::client::Client as HttpClient;
use embedded_svc::http::Method;
use embedded_svc::io::{Read as _, Write as _};
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::sys::EspError;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::io::EspIOError;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};

use crate::net::{HttpResponse, HttpTransport, ServiceError};
use crate::token::{non_empty, TokenError, TokenStore};

const WIFI_SSID: &str = match option_env!("WIFI_SSID") {
    Some(value) => value,
    None => "",
};
const WIFI_PASS: &str = match option_env!("WIFI_PASS") {
    Some(value) => value,
    None => "",
};

const TOKEN_NAMESPACE: &str = "attend";
const TOKEN_KEY: &str = "token";
const TOKEN_MAX_LEN: usize = 1024;

/// Wi-Fi 或 HTTP 初始化失败。
#[derive(Debug)]
pub enum LinkError {
    Esp(EspError),
    Config(&'static str),
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Esp(err) => write!(f, "{}", err),
            LinkError::Config(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<EspError> for LinkError {
    fn from(err: EspError) -> Self {
        LinkError::Esp(err)
    }
}

pub fn connect_wifi(
    modem: Modem,
    nvs: Option<EspDefaultNvsPartition>,
) -> Result<BlockingWifi<EspWifi<'static>>, LinkError> {
    if WIFI_SSID.is_empty() {
        return Err(LinkError::Config("WIFI_SSID not set at build time"));
    }
    let sys_loop = EspSystemEventLoop::take()?;
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sys_loop.clone(), nvs)?, sys_loop)?;

    let auth_method = if WIFI_PASS.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    let wifi_configuration = Configuration::Client(ClientConfiguration {
        ssid: WIFI_SSID
            .try_into()
            .map_err(|_| LinkError::Config("WIFI_SSID too long"))?,
        bssid: None,
        auth_method,
        password: WIFI_PASS
            .try_into()
            .map_err(|_| LinkError::Config("WIFI_PASS too long"))?,
        channel: None,
        ..Default::default()
    });

    wifi.set_configuration(&wifi_configuration)?;
    wifi.start()?;
    log::info!("Wi-Fi started");
    wifi.connect()?;
    log::info!("Wi-Fi connected to {}", WIFI_SSID);
    wifi.wait_netif_up()?;
    log::info!("Wi-Fi netif up");
    Ok(wifi)
}

/// 固件 HTTP 传输：每次请求新建连接，HTTPS 使用内置证书包。
pub struct EspHttpTransport {
    timeout: Duration,
}

impl EspHttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn post(&self, url: &str, bearer: &str, body: &[u8]) -> Result<HttpResponse, EspIOError> {
        let config = HttpConfiguration {
            timeout: Some(self.timeout),
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let authorization = format!("Bearer {}", bearer);
        let content_length = body.len().to_string();
        let headers = [
            ("content-type", "application/json"),
            ("content-length", content_length.as_str()),
            ("authorization", authorization.as_str()),
        ];

        let mut client = HttpClient::wrap(EspHttpConnection::new(&config)?);
        let mut request = client.request(Method::Post, url, &headers)?;
        request.write_all(body)?;
        request.flush()?;
        let mut response = request.submit()?;
        let status = response.status();
        let mut payload = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let len = response.read(&mut buf)?;
            if len == 0 {
                break;
            }
            payload.extend_from_slice(&buf[..len]);
        }
        Ok(HttpResponse {
            status,
            body: payload,
        })
    }
}

impl HttpTransport for EspHttpTransport {
    fn post_json(&self, url: &str, bearer: &str, body: &[u8]) -> Result<HttpResponse, ServiceError> {
        self.post(url, bearer, body)
            .map_err(|err| ServiceError::Transport(format!("{:?}", err)))
    }
}

/// NVS 中保存的访问令牌。
#[derive(Clone)]
pub struct NvsTokenStore {
    nvs: Arc<Mutex<EspNvs<NvsDefault>>>,
}

impl NvsTokenStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(partition, TOKEN_NAMESPACE, true)?;
        Ok(Self {
            nvs: Arc::new(Mutex::new(nvs)),
        })
    }
}

impl TokenStore for NvsTokenStore {
    fn load(&self) -> Result<Option<String>, TokenError> {
        let nvs = self
            .nvs
            .lock()
            .map_err(|_| TokenError::Storage("nvs lock poisoned".to_string()))?;
        let mut buf = vec![0u8; TOKEN_MAX_LEN];
        let value = nvs
            .get_str(TOKEN_KEY, &mut buf)
            .map_err(|err| TokenError::Storage(err.to_string()))?;
        Ok(value.and_then(non_empty))
    }

    fn store(&self, token: &str) -> Result<(), TokenError> {
        let nvs = self
            .nvs
            .lock()
            .map_err(|_| TokenError::Storage("nvs lock poisoned".to_string()))?;
        nvs.set_str(TOKEN_KEY, token.trim())
            .map_err(|err| TokenError::Storage(err.to_string()))
    }
}
