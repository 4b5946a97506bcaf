//! Prometheus-compatible metrics endpoint
//!
//! Counters are updated by the tick loop and read by a small HTTP task on the
//! same runtime. Default endpoint: http://localhost:9100/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const TICK_HISTORY: usize = 1000;

/// Metrics registry for one node
#[derive(Debug)]
pub struct NodeMetrics {
    role: &'static str,

    // Connections
    pub connections_active: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub abuse_disconnects: AtomicU64,
    pub auth_failures: AtomicU64,

    // Traffic
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,

    // Sessions (slave) and slaves (master)
    pub sessions_active: AtomicU64,
    pub players: AtomicU64,
    pub slaves_registered: AtomicU64,
    pub master_connected: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    pub overloaded_ticks: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl NodeMetrics {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            connections_active: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            abuse_disconnects: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            players: AtomicU64::new(0),
            slaves_registered: AtomicU64::new(0),
            master_connected: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            overloaded_ticks: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Record a tick's busy time and refresh the percentiles
    pub fn record_tick_time(&self, duration: Duration, overloaded: bool) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        if overloaded {
            self.overloaded_ticks.fetch_add(1, Ordering::Relaxed);
        }

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let last = sorted.len() - 1;
            let p95 = ((sorted.len() as f32 * 0.95) as usize).min(last);
            let p99 = ((sorted.len() as f32 * 0.99) as usize).min(last);

            self.tick_time_p95_us.store(sorted[p95], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted[last], Ordering::Relaxed);
        }
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);
        let role = self.role;

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP session_mesh_{name} {help}\n# TYPE session_mesh_{name} {kind}\nsession_mesh_{name}{{role=\"{role}\"}} {value}\n",
                    name = $name,
                    help = $help,
                    kind = $type,
                    role = role,
                    value = $value
                ));
            };
        }

        metric!("connections_active", "Open TCP connections", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("connections_accepted_total", "Accepted TCP connections", "counter",
            self.connections_accepted.load(Ordering::Relaxed));
        metric!("connections_rejected_total", "Connections closed by authentication or policy", "counter",
            self.connections_rejected.load(Ordering::Relaxed));
        metric!("abuse_disconnects_total", "Overflow and flood disconnects", "counter",
            self.abuse_disconnects.load(Ordering::Relaxed));
        metric!("auth_failures_total", "Failed authentication attempts", "counter",
            self.auth_failures.load(Ordering::Relaxed));

        metric!("messages_sent_total", "Records queued for sending", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("messages_received_total", "Records decoded", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("bytes_sent_total", "TCP bytes written", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("bytes_received_total", "TCP bytes read", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("datagrams_sent_total", "UDP datagrams sent", "counter",
            self.datagrams_sent.load(Ordering::Relaxed));
        metric!("datagrams_received_total", "UDP datagrams received", "counter",
            self.datagrams_received.load(Ordering::Relaxed));

        metric!("sessions_active", "Occupied sessions", "gauge",
            self.sessions_active.load(Ordering::Relaxed));
        metric!("players", "Players seated in sessions", "gauge",
            self.players.load(Ordering::Relaxed));
        metric!("slaves_registered", "Registered slave nodes", "gauge",
            self.slaves_registered.load(Ordering::Relaxed));
        metric!("master_connected", "Master link state (0/1)", "gauge",
            self.master_connected.load(Ordering::Relaxed));

        metric!("tick_time_microseconds", "Last tick busy time", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("tick_count", "Ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("overloaded_ticks_total", "Ticks that overran the tick period", "counter",
            self.overloaded_ticks.load(Ordering::Relaxed));
        metric!("uptime_seconds", "Node uptime", "counter", self.uptime_seconds());

        output
    }

    pub fn to_json(&self) -> String {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "role": self.role,
            "network": {
                "connections": load(&self.connections_active),
                "accepted": load(&self.connections_accepted),
                "rejected": load(&self.connections_rejected),
                "abuse_disconnects": load(&self.abuse_disconnects),
                "messages_sent": load(&self.messages_sent),
                "messages_received": load(&self.messages_received),
                "bytes_sent": load(&self.bytes_sent),
                "bytes_received": load(&self.bytes_received),
            },
            "sessions": {
                "active": load(&self.sessions_active),
                "players": load(&self.players),
                "slaves": load(&self.slaves_registered),
                "master_connected": load(&self.master_connected) == 1,
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "overloaded_ticks": load(&self.overloaded_ticks),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

/// Serve `/metrics`, `/metrics/json` and `/health` until the listener fails
pub async fn start_metrics_server(metrics: Arc<NodeMetrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = http_response(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Failed to read from metrics socket {}: {}", peer, e),
            }
        });
    }
}

fn http_response(metrics: &NodeMetrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
