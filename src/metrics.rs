//! Job-keyed metric emission, Graphite plaintext protocol.
//!
//! Every job gets its own namespace under `<prefix>.job.<name>.`. Emission
//! is fire-and-forget: a send happens on a spawned task, and a sink that is
//! down only produces debug logs. No scheduler decision depends on metric
//! delivery.

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::MetricsConfig;

#[derive(Debug, Clone)]
pub struct MetricsSink {
    addr: Option<String>,
    prefix: String,
}

impl MetricsSink {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            addr: config.graphite_addr.clone(),
            prefix: config.prefix.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            addr: None,
            prefix: String::new(),
        }
    }

    /// Emit one gauge sample for a job. Returns immediately.
    pub fn emit(&self, job_name: &str, key: &str, value: f64) {
        let Some(addr) = self.addr.clone() else {
            return;
        };

        let line = format!(
            "{}.job.{}.{} {} {}\n",
            self.prefix,
            sanitize(job_name),
            key,
            value,
            Utc::now().timestamp()
        );

        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(mut stream) => {
                    if let Err(e) = stream.write_all(line.as_bytes()).await {
                        tracing::debug!(addr = %addr, error = %e, "Metric write failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "Metric sink unreachable");
                }
            }
        });
    }

    /// Status transitions are emitted as `status.<name>` pulses so any
    /// time-series collector can reconstruct the lifecycle.
    pub fn status_change(&self, job_name: &str, status: &str) {
        self.emit(job_name, &format!("status.{}", status), 1.0);
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
