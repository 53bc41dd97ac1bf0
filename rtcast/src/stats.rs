//! Statistics collector feeding the public API, and the circuit breaker
//! that sheds feedback work under load.
//!
//! Both are injected via constructors; nothing here is a process-wide
//! static.

use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::config::AppConfig;

/// Kind of a connected client, rendered into the API as e.g. `rtmp-play`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientType {
    RtmpPlay,
    FlvPlay,
    TsPlay,
    AacPlay,
    Mp3Play,
    RtcPlay,
    RtcPublish,
    GbPublish,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::RtmpPlay => "rtmp-play",
            ClientType::FlvPlay => "flv-play",
            ClientType::TsPlay => "ts-play",
            ClientType::AacPlay => "aac-play",
            ClientType::Mp3Play => "mp3-play",
            ClientType::RtcPlay => "rtc-play",
            ClientType::RtcPublish => "rtc-publish",
            ClientType::GbPublish => "gb-publish",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatClient {
    pub id: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub typ: ClientType,
    pub ip: String,
}

#[derive(Debug, Clone, Default)]
pub struct StatStream {
    pub id: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub active: bool,
    pub nb_clients: usize,
    pub frames: u64,
    pub send_bytes: u64,
    pub recv_bytes: u64,
}

/// Per-process statistic registry. Publishes `server_id`, `service_id` and
/// `service_pid` into every API response envelope.
pub struct Statistic {
    pub server_id: String,
    pub service_id: String,
    pub service_pid: String,
    clients: RefCell<HashMap<String, StatClient>>,
    streams: RefCell<HashMap<String, StatStream>>,
}

impl Statistic {
    pub fn new(server_id: &str, service_id: &str, service_pid: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            service_id: service_id.to_string(),
            service_pid: service_pid.to_string(),
            clients: RefCell::new(HashMap::new()),
            streams: RefCell::new(HashMap::new()),
        }
    }

    pub fn on_client(&self, client: StatClient) {
        let key = stream_key(&client.vhost, &client.app, &client.stream);
        let mut streams = self.streams.borrow_mut();
        let entry = streams.entry(key.clone()).or_insert_with(|| StatStream {
            id: key.clone(),
            vhost: client.vhost.clone(),
            app: client.app.clone(),
            stream: client.stream.clone(),
            ..Default::default()
        });
        entry.nb_clients += 1;
        self.clients.borrow_mut().insert(client.id.clone(), client);
    }

    pub fn on_disconnect(&self, client_id: &str) {
        let client = self.clients.borrow_mut().remove(client_id);
        if let Some(client) = client {
            let key = stream_key(&client.vhost, &client.app, &client.stream);
            let mut streams = self.streams.borrow_mut();
            if let Some(s) = streams.get_mut(&key) {
                s.nb_clients = s.nb_clients.saturating_sub(1);
            }
        }
    }

    pub fn on_stream_publish(&self, vhost: &str, app: &str, stream: &str) {
        let key = stream_key(vhost, app, stream);
        let mut streams = self.streams.borrow_mut();
        let entry = streams.entry(key.clone()).or_insert_with(|| StatStream {
            id: key,
            vhost: vhost.to_string(),
            app: app.to_string(),
            stream: stream.to_string(),
            ..Default::default()
        });
        entry.active = true;
    }

    pub fn on_stream_close(&self, vhost: &str, app: &str, stream: &str) {
        let key = stream_key(vhost, app, stream);
        if let Some(s) = self.streams.borrow_mut().get_mut(&key) {
            s.active = false;
        }
    }

    pub fn nb_clients(&self) -> usize {
        self.clients.borrow().len()
    }

    pub fn nb_streams(&self) -> usize {
        self.streams.borrow().len()
    }

    pub fn client(&self, id: &str) -> Option<StatClient> {
        self.clients.borrow().get(id).cloned()
    }

    pub fn dumps_clients(&self) -> Value {
        let clients = self.clients.borrow();
        let mut out: Vec<Value> = clients.values().map(dump_client).collect();
        out.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Value::Array(out)
    }

    pub fn dumps_client(&self, id: &str) -> Option<Value> {
        self.clients.borrow().get(id).map(dump_client)
    }

    pub fn dumps_streams(&self) -> Value {
        let streams = self.streams.borrow();
        let mut out: Vec<Value> = streams
            .values()
            .map(|s| {
                json!({
                    "id": s.id,
                    "vhost": s.vhost,
                    "app": s.app,
                    "name": s.stream,
                    "clients": s.nb_clients,
                    "publish": {"active": s.active},
                    "frames": s.frames,
                    "send_bytes": s.send_bytes,
                    "recv_bytes": s.recv_bytes,
                })
            })
            .collect();
        out.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Value::Array(out)
    }

    pub fn dumps_vhosts(&self) -> Value {
        let streams = self.streams.borrow();
        let mut vhosts: Vec<&str> = streams.values().map(|s| s.vhost.as_str()).collect();
        vhosts.sort_unstable();
        vhosts.dedup();
        Value::Array(
            vhosts
                .into_iter()
                .map(|v| {
                    let nb = streams.values().filter(|s| s.vhost == v).count();
                    json!({"name": v, "enabled": true, "streams": nb})
                })
                .collect(),
        )
    }
}

fn stream_key(vhost: &str, app: &str, stream: &str) -> String {
    format!("{vhost}/{app}/{stream}")
}

fn dump_client(c: &StatClient) -> Value {
    json!({
        "id": c.id,
        "vhost": c.vhost,
        "app": c.app,
        "stream": c.stream,
        "ip": c.ip,
        "type": c.typ.as_str(),
    })
}

/// Water levels the breaker reports, sampled each pulse from the injected
/// config thresholds. The RTC receive path consults it before doing NACK
/// and PLI work.
pub struct CircuitBreaker {
    enabled: bool,
    high_threshold: u32,
    high_pulse: u32,
    critical_threshold: u32,
    critical_pulse: u32,
    dying_threshold: u32,
    dying_pulse: u32,
    hybrid_high_water: RefCell<u32>,
    hybrid_critical_water: RefCell<u32>,
    hybrid_dying_water: RefCell<u32>,
}

impl CircuitBreaker {
    pub fn new(config: &dyn AppConfig) -> Self {
        Self {
            enabled: config.get_circuit_breaker_enabled(),
            high_threshold: config.get_high_threshold(),
            high_pulse: config.get_high_pulse(),
            critical_threshold: config.get_critical_threshold(),
            critical_pulse: config.get_critical_pulse(),
            dying_threshold: config.get_dying_threshold(),
            dying_pulse: config.get_dying_pulse(),
            hybrid_high_water: RefCell::new(0),
            hybrid_critical_water: RefCell::new(0),
            hybrid_dying_water: RefCell::new(0),
        }
    }

    /// Feeds one load sample (percent CPU). Each threshold crossing charges
    /// the matching pulse counter; counters decay by one per sample.
    pub fn sample(&self, cpu_percent: u32) {
        if !self.enabled {
            return;
        }
        let charge = |water: &RefCell<u32>, threshold: u32, pulse: u32| {
            let mut w = water.borrow_mut();
            if cpu_percent > threshold {
                *w = pulse;
            } else {
                *w = w.saturating_sub(1);
            }
        };
        charge(&self.hybrid_high_water, self.high_threshold, self.high_pulse);
        charge(
            &self.hybrid_critical_water,
            self.critical_threshold,
            self.critical_pulse,
        );
        charge(&self.hybrid_dying_water, self.dying_threshold, self.dying_pulse);
    }

    pub fn hybrid_high_water_level(&self) -> bool {
        self.enabled && *self.hybrid_high_water.borrow() > 0
    }

    pub fn hybrid_critical_water_level(&self) -> bool {
        self.enabled && *self.hybrid_critical_water.borrow() > 0
    }

    pub fn hybrid_dying_water_level(&self) -> bool {
        self.enabled && *self.hybrid_dying_water.borrow() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    #[test]
    fn test_client_registry() {
        let stat = Statistic::new("srv", "svc", "1234");
        stat.on_client(StatClient {
            id: "test_client_456".to_string(),
            vhost: "__defaultVhost__".to_string(),
            app: "live".to_string(),
            stream: "livestream".to_string(),
            typ: ClientType::RtmpPlay,
            ip: "127.0.0.1".to_string(),
        });

        assert_eq!(stat.nb_clients(), 1);
        let dumped = stat.dumps_client("test_client_456").unwrap();
        assert_eq!(dumped["id"], "test_client_456");
        assert_eq!(dumped["vhost"], "__defaultVhost__");
        assert_eq!(dumped["stream"], "livestream");
        assert_eq!(dumped["type"], "rtmp-play");

        stat.on_disconnect("test_client_456");
        assert_eq!(stat.nb_clients(), 0);
    }

    #[test]
    fn test_stream_publish_lifecycle() {
        let stat = Statistic::new("srv", "svc", "1");
        stat.on_stream_publish("__defaultVhost__", "live", "cam1");
        assert_eq!(stat.nb_streams(), 1);
        let streams = stat.dumps_streams();
        assert_eq!(streams[0]["publish"]["active"], true);

        stat.on_stream_close("__defaultVhost__", "live", "cam1");
        let streams = stat.dumps_streams();
        assert_eq!(streams[0]["publish"]["active"], false);
    }

    #[test]
    fn test_circuit_breaker_water_levels() {
        let config = MemoryConfig {
            high_threshold: 90,
            high_pulse: 2,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(&config);
        assert!(!breaker.hybrid_high_water_level());

        breaker.sample(92);
        assert!(breaker.hybrid_high_water_level());
        assert!(!breaker.hybrid_critical_water_level());

        // Decays after the pulse budget of calm samples.
        breaker.sample(10);
        assert!(breaker.hybrid_high_water_level());
        breaker.sample(10);
        assert!(!breaker.hybrid_high_water_level());

        breaker.sample(100);
        assert!(breaker.hybrid_critical_water_level());
        assert!(breaker.hybrid_dying_water_level());
    }
}
