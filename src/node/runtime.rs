//! Tick loops
//!
//! One loop per process. Each tick runs, in order: TCP accept and reads, UDP
//! drain, master link, node tick, then the outbound flushes and teardown of
//! closed connections. The loop then sleeps out the rest of the tick period;
//! a tick that overran its period is recorded as lag.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::info;

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;
use crate::net::master_link::{LinkEvent, MasterLink};
use crate::net::tcp_server::TcpServer;
use crate::net::udp_server::UdpServer;
use crate::node::master::MasterNode;
use crate::node::slave::SlaveNode;
use crate::node::stats::ProcessStats;

/// Longest the listener waits for a new connection in one tick
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct TickPacer {
    period: Duration,
}

impl TickPacer {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time left in the tick after `busy`; negative when the tick overran
    pub fn idle_us(&self, busy: Duration) -> i64 {
        self.period.as_micros() as i64 - busy.as_micros() as i64
    }

    pub async fn sleep(&self, idle_us: i64) {
        if idle_us > 0 {
            tokio::time::sleep(Duration::from_micros(idle_us as u64)).await;
        }
    }
}

pub struct SlaveRuntime {
    node: SlaveNode,
    tcp: TcpServer,
    udp: UdpServer,
    link: MasterLink,
    pacer: TickPacer,
    metrics: Arc<NodeMetrics>,
}

impl SlaveRuntime {
    /// Bind both sockets. Port 0 binds an ephemeral port, which is then the
    /// one advertised to the master.
    pub async fn bind(config: &NodeConfig, metrics: Arc<NodeMetrics>) -> anyhow::Result<Self> {
        let tcp = TcpServer::bind(config.tcp_addr(), config.dos_config(), POLL_TIMEOUT)
            .await
            .with_context(|| format!("binding TCP {}", config.tcp_addr()))?;
        let udp = UdpServer::bind(config.udp_addr())
            .await
            .with_context(|| format!("binding UDP {}", config.udp_addr()))?;

        let master_host = config.master_host.as_deref().context("slave requires master_host")?;
        let master_port = config.master_port.context("slave requires master_port")?;

        let mut settings = config.slave_settings();
        settings.tcp_port = tcp.local_addr()?.port();
        settings.udp_port = udp.local_addr()?.port();

        info!(
            "Slave {} on tcp/{} udp/{}, master at {}:{}",
            settings.node_id, settings.tcp_port, settings.udp_port, master_host, master_port
        );

        Ok(Self {
            node: SlaveNode::new(settings, Box::new(ProcessStats::new()), metrics.clone()),
            tcp,
            udp,
            link: MasterLink::new(master_host, master_port),
            pacer: TickPacer::new(config.tick_period()),
            metrics,
        })
    }

    pub fn node(&self) -> &SlaveNode {
        &self.node
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Run one tick without pacing
    pub async fn tick_once(&mut self) {
        let now = Instant::now();

        for event in self.tcp.poll(self.node.connections_mut(), now).await {
            self.node.handle_tcp_event(event, now);
        }
        for (from, data) in self.udp.drain() {
            self.node.handle_datagram(from, &data, now);
        }
        for event in self.link.poll().await {
            match event {
                LinkEvent::Connected => self.node.on_master_connected(now),
                LinkEvent::Data(data) => self.node.on_master_data(&data),
                LinkEvent::Disconnected => self.node.on_master_disconnected(),
            }
        }

        self.node.tick(now);

        self.tcp.flush(self.node.connections_mut());
        let datagrams = self.udp.flush(self.node.connections_mut());
        NodeMetrics::add(&self.metrics.datagrams_sent, datagrams as u64);
        self.link.flush(self.node.master_out_mut());

        self.tcp.drop_closed(self.node.connections());
        self.node.reap_closed();
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let started = Instant::now();
            self.tick_once().await;
            let busy = started.elapsed();
            let idle_us = self.pacer.idle_us(busy);

            self.node.record_tick_idle(idle_us);
            self.metrics.record_tick_time(busy, idle_us <= 0);
            self.pacer.sleep(idle_us).await;
        }
    }
}

pub struct MasterRuntime {
    node: MasterNode,
    tcp: TcpServer,
    pacer: TickPacer,
    metrics: Arc<NodeMetrics>,
}

impl MasterRuntime {
    pub async fn bind(config: &NodeConfig, metrics: Arc<NodeMetrics>) -> anyhow::Result<Self> {
        let tcp = TcpServer::bind(config.tcp_addr(), config.dos_config(), POLL_TIMEOUT)
            .await
            .with_context(|| format!("binding TCP {}", config.tcp_addr()))?;
        info!("Master {} on tcp/{}", config.node_id, tcp.local_addr()?.port());

        Ok(Self {
            node: MasterNode::new(config.master_settings(), metrics.clone()),
            tcp,
            pacer: TickPacer::new(config.tick_period()),
            metrics,
        })
    }

    pub fn node(&self) -> &MasterNode {
        &self.node
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub async fn tick_once(&mut self) {
        let now = Instant::now();

        for event in self.tcp.poll(self.node.connections_mut(), now).await {
            self.node.handle_tcp_event(event, now);
        }
        self.node.tick(now);

        self.tcp.flush(self.node.connections_mut());
        self.tcp.drop_closed(self.node.connections());
        self.node.reap_closed();
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            let started = Instant::now();
            self.tick_once().await;
            let busy = started.elapsed();
            let idle_us = self.pacer.idle_us(busy);

            self.metrics.record_tick_time(busy, idle_us <= 0);
            self.pacer.sleep(idle_us).await;
        }
    }
}
