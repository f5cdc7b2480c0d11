//! Concrete collaborator implementations for the telemetry publisher's two
//! sampling contracts (component C). The core only specifies the
//! `SystemStatsCollector`/`StreamsCollector` traits; these are the
//! deployment-shape instances `main` actually wires in.

use std::fs;
use std::time::Duration;

use crate::bus::NodeStatsPayload;
use crate::telemetry::{StreamsCollector, SystemStatsCollector};

/// Samples host CPU/RAM usage from `/proc`, with a static configured lat/lon
/// and bandwidth left at the reserved `0.0` per SPEC_FULL.md 9 ("the source
/// hints at but does not compute it").
pub struct ProcSystemStatsCollector {
    lat: f64,
    lon: f64,
}

impl ProcSystemStatsCollector {
    #[must_use]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

#[async_trait::async_trait]
impl SystemStatsCollector for ProcSystemStatsCollector {
    async fn sample(&self) -> NodeStatsPayload {
        let (cpu, ram, load5) =
            tokio::task::spawn_blocking(|| (sample_cpu_pct(), sample_ram_pct(), sample_load5()))
                .await
                .unwrap_or((0.0, 0.0, 0.0));

        NodeStatsPayload {
            cpu,
            ram,
            bandwidth: 0.0,
            load5,
            lat: self.lat,
            lon: self.lon,
        }
    }
}

/// Short-window CPU sample: two `/proc/stat` reads a fixed interval apart,
/// matching SPEC_FULL.md 4.C's "CPU via short sampling window". Falls back
/// to `0.0` on any read/parse failure (non-Linux hosts, restricted
/// containers) rather than erroring the whole telemetry tick.
fn sample_cpu_pct() -> f64 {
    let Some(before) = read_proc_stat_totals() else { return 0.0 };
    std::thread::sleep(Duration::from_millis(200));
    let Some(after) = read_proc_stat_totals() else { return 0.0 };

    let idle_delta = after.idle.saturating_sub(before.idle) as f64;
    let total_delta = after.total.saturating_sub(before.total) as f64;
    if total_delta <= 0.0 {
        return 0.0;
    }
    ((total_delta - idle_delta) / total_delta * 100.0).clamp(0.0, 100.0)
}

struct ProcStatTotals {
    idle: u64,
    total: u64,
}

fn read_proc_stat_totals() -> Option<ProcStatTotals> {
    let contents = fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line.split_whitespace().skip(1).filter_map(|f| f.parse().ok()).collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3];
    let total = fields.iter().sum();
    Some(ProcStatTotals { idle, total })
}

fn sample_ram_pct() -> f64 {
    let Some(contents) = fs::read_to_string("/proc/meminfo").ok() else { return 0.0 };
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    let Some(total) = field("MemTotal:") else { return 0.0 };
    let Some(available) = field("MemAvailable:") else { return 0.0 };
    if total <= 0.0 {
        return 0.0;
    }
    ((total - available) / total * 100.0).clamp(0.0, 100.0)
}

fn sample_load5() -> f64 {
    fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).map(str::to_string))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

/// Queries the local media server's currently active streams over its HTTP
/// control surface and classifies them as playback vs ingest. The concrete
/// endpoint shape is deployment-specific (SPEC_FULL.md 6 scopes the media
/// server control API as an external collaborator); this implementation
/// expects a small JSON summary at `{base_url}{streams_path}` of the form
/// `{"playback": [...], "ingest": [...]}` and degrades to "no streams" on
/// any transport or decode failure, matching the no-retry policy in 4.C.
pub struct HttpStreamsCollector {
    client: reqwest::Client,
    url: String,
}

impl HttpStreamsCollector {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, streams_path: &str) -> Self {
        Self {
            client,
            url: format!("{}{streams_path}", base_url.trim_end_matches('/')),
        }
    }
}

#[derive(serde::Deserialize)]
struct StreamsSummary {
    #[serde(default)]
    playback: Vec<String>,
    #[serde(default)]
    ingest: Vec<String>,
}

#[async_trait::async_trait]
impl StreamsCollector for HttpStreamsCollector {
    async fn sample(&self) -> (Vec<String>, Vec<String>) {
        match self.client.get(&self.url).timeout(Duration::from_secs(15)).send().await {
            Ok(resp) => match resp.json::<StreamsSummary>().await {
                Ok(summary) => (summary.playback, summary.ingest),
                Err(_) => (Vec::new(), Vec::new()),
            },
            Err(_) => (Vec::new(), Vec::new()),
        }
    }
}
