use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Install the Prometheus recorder and serve `/metrics` on localhost.
pub fn start_metrics_server(port: u16) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    info!(%addr, "configuring metrics exporter");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("metrics server ready at http://{}/metrics", addr);
    Ok(addr)
}
