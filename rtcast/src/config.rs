//! The narrow configuration seam. The server core never reads files or
//! process-wide statics; everything is injected through [AppConfig].

use std::time::Duration;

/// Configuration methods the core consumes. One trait, injected via
/// constructors so tests can run against [MemoryConfig].
pub trait AppConfig {
    // Stream caster (GB28181 ingest).
    fn get_stream_caster_listen(&self) -> u16;
    fn get_stream_caster_output(&self) -> String;

    // HTTP hooks.
    fn get_vhost_http_hooks_enabled(&self, vhost: &str) -> bool;
    fn get_vhost_on_play(&self, vhost: &str) -> Vec<String>;
    fn get_vhost_on_stop(&self, vhost: &str) -> Vec<String>;

    // HTTP remux.
    fn get_vhost_http_remux_enabled(&self, vhost: &str) -> bool;
    fn get_vhost_http_remux_mount(&self, vhost: &str) -> String;
    fn get_vhost_http_remux_fast_cache(&self, vhost: &str) -> Duration;

    // Exec.
    fn get_exec_enabled(&self, vhost: &str) -> bool;
    fn get_exec_publishs(&self, vhost: &str) -> Vec<String>;

    // Circuit breaker.
    fn get_circuit_breaker_enabled(&self) -> bool;
    fn get_high_threshold(&self) -> u32;
    fn get_high_pulse(&self) -> u32;
    fn get_critical_threshold(&self) -> u32;
    fn get_critical_pulse(&self) -> u32;
    fn get_dying_threshold(&self) -> u32;
    fn get_dying_pulse(&self) -> u32;

    // Heartbeat.
    fn get_heartbeat_enabled(&self) -> bool;
    fn get_heartbeat_interval(&self) -> Duration;
    fn get_heartbeat_url(&self) -> String;
    fn get_heartbeat_device_id(&self) -> String;
    fn get_heartbeat_summaries(&self) -> bool;

    // Raw API.
    fn get_raw_api(&self) -> bool;
    fn get_raw_api_allow_reload(&self) -> bool;
    fn get_raw_api_allow_query(&self) -> bool;

    // Transcode scope lookup: whether a vhost/scope pair delegates to an
    // external transcoder.
    fn get_transcode_enabled(&self, vhost: &str, scope: &str) -> bool;
}

/// In-memory configuration, used by tests and the binary's flag layer.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub stream_caster_listen: u16,
    pub stream_caster_output: String,
    pub http_hooks_enabled: bool,
    pub on_play: Vec<String>,
    pub on_stop: Vec<String>,
    pub http_remux_enabled: bool,
    pub http_remux_mount: String,
    pub http_remux_fast_cache: Duration,
    pub exec_enabled: bool,
    pub exec_publishs: Vec<String>,
    pub circuit_breaker_enabled: bool,
    pub high_threshold: u32,
    pub high_pulse: u32,
    pub critical_threshold: u32,
    pub critical_pulse: u32,
    pub dying_threshold: u32,
    pub dying_pulse: u32,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_url: String,
    pub heartbeat_device_id: String,
    pub heartbeat_summaries: bool,
    pub raw_api: bool,
    pub raw_api_allow_reload: bool,
    pub raw_api_allow_query: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stream_caster_listen: 9000,
            stream_caster_output: "rtmp://127.0.0.1/live/[stream]".to_string(),
            http_hooks_enabled: false,
            on_play: vec![],
            on_stop: vec![],
            http_remux_enabled: true,
            http_remux_mount: "[vhost]/[app]/[stream].flv".to_string(),
            http_remux_fast_cache: Duration::from_secs(3),
            exec_enabled: false,
            exec_publishs: vec![],
            circuit_breaker_enabled: true,
            high_threshold: 90,
            high_pulse: 2,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
            heartbeat_enabled: false,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_url: String::new(),
            heartbeat_device_id: String::new(),
            heartbeat_summaries: false,
            raw_api: false,
            raw_api_allow_reload: false,
            raw_api_allow_query: false,
        }
    }
}

impl AppConfig for MemoryConfig {
    fn get_stream_caster_listen(&self) -> u16 {
        self.stream_caster_listen
    }
    fn get_stream_caster_output(&self) -> String {
        self.stream_caster_output.clone()
    }
    fn get_vhost_http_hooks_enabled(&self, _vhost: &str) -> bool {
        self.http_hooks_enabled
    }
    fn get_vhost_on_play(&self, _vhost: &str) -> Vec<String> {
        self.on_play.clone()
    }
    fn get_vhost_on_stop(&self, _vhost: &str) -> Vec<String> {
        self.on_stop.clone()
    }
    fn get_vhost_http_remux_enabled(&self, _vhost: &str) -> bool {
        self.http_remux_enabled
    }
    fn get_vhost_http_remux_mount(&self, _vhost: &str) -> String {
        self.http_remux_mount.clone()
    }
    fn get_vhost_http_remux_fast_cache(&self, _vhost: &str) -> Duration {
        self.http_remux_fast_cache
    }
    fn get_exec_enabled(&self, _vhost: &str) -> bool {
        self.exec_enabled
    }
    fn get_exec_publishs(&self, _vhost: &str) -> Vec<String> {
        self.exec_publishs.clone()
    }
    fn get_circuit_breaker_enabled(&self) -> bool {
        self.circuit_breaker_enabled
    }
    fn get_high_threshold(&self) -> u32 {
        self.high_threshold
    }
    fn get_high_pulse(&self) -> u32 {
        self.high_pulse
    }
    fn get_critical_threshold(&self) -> u32 {
        self.critical_threshold
    }
    fn get_critical_pulse(&self) -> u32 {
        self.critical_pulse
    }
    fn get_dying_threshold(&self) -> u32 {
        self.dying_threshold
    }
    fn get_dying_pulse(&self) -> u32 {
        self.dying_pulse
    }
    fn get_heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }
    fn get_heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
    fn get_heartbeat_url(&self) -> String {
        self.heartbeat_url.clone()
    }
    fn get_heartbeat_device_id(&self) -> String {
        self.heartbeat_device_id.clone()
    }
    fn get_heartbeat_summaries(&self) -> bool {
        self.heartbeat_summaries
    }
    fn get_raw_api(&self) -> bool {
        self.raw_api
    }
    fn get_raw_api_allow_reload(&self) -> bool {
        self.raw_api_allow_reload
    }
    fn get_raw_api_allow_query(&self) -> bool {
        self.raw_api_allow_query
    }
    fn get_transcode_enabled(&self, _vhost: &str, _scope: &str) -> bool {
        false
    }
}
