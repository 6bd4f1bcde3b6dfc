//! 签到扫码站：扫码 -> 校验 -> 签到 -> 结果展示 -> 自动恢复扫码。
//!
//! 状态机、摄像头会话、反馈映射与后端协议与平台无关；
//! ESP32 固件与桌面主机只在采集端口、HTTP 传输、反馈硬件上不同。

// 模块划分：状态机、采集、反馈、网络与操作员界面
pub mod api;
pub mod cache;
pub mod camera;
pub mod config;
pub mod feedback;
pub mod model;
pub mod net;
pub mod pipeline;
pub mod scanner;
pub mod state;
pub mod token;
pub mod web;

#[cfg(not(target_os = "espidf"))]
pub mod console;
#[cfg(not(target_os = "espidf"))]
pub mod http_client;

#[cfg(target_os = "espidf")]
pub mod esp_http;
#[cfg(target_os = "espidf")]
pub mod smart_led;
#[cfg(target_os = "espidf")]
pub mod uart_link;
#[cfg(target_os = "espidf")]
pub mod web_server;
