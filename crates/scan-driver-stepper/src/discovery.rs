//! Locating the stage controller among the system's serial ports.

use std::time::Duration;

use scan_core::serial::{open_serial_async, SerialLink, DEFAULT_BAUD_RATE};
use scan_core::{ScanError, ScanResult};
use tracing::{debug, info, warn};

/// Open the controller link.
///
/// When `preferred` is non-empty only that port is tried. Otherwise every port
/// the OS reports is opened in turn and the first one that completes the
/// greeting handshake wins. `timeout` becomes the link's default reply deadline.
pub async fn find_controller_port(preferred: &str, timeout: Duration) -> ScanResult<SerialLink> {
    info!("searching for stage controller port");
    let candidates = candidate_ports(preferred)?;

    for port_name in &candidates {
        match try_port(port_name, timeout).await {
            Ok(link) => {
                info!(port = %port_name, "stage controller found");
                return Ok(link);
            }
            Err(e) => debug!(port = %port_name, error = %e, "port rejected"),
        }
    }

    warn!(tried = candidates.len(), "no stage controller found");
    Err(ScanError::LinkFault {
        port: if preferred.is_empty() {
            "<auto>".to_string()
        } else {
            preferred.to_string()
        },
        message: format!(
            "no stage controller answered on {} candidate port(s); connect the controller and try again",
            candidates.len()
        ),
    })
}

fn candidate_ports(preferred: &str) -> ScanResult<Vec<String>> {
    if !preferred.is_empty() {
        return Ok(vec![preferred.to_string()]);
    }
    let ports = serialport::available_ports().map_err(|e| ScanError::LinkFault {
        port: "<auto>".to_string(),
        message: format!("could not enumerate serial ports: {e}"),
    })?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

async fn try_port(port_name: &str, timeout: Duration) -> ScanResult<SerialLink> {
    let port = open_serial_async(port_name, DEFAULT_BAUD_RATE, "stage controller").await?;
    let mut link = SerialLink::new(port_name, Box::new(port), timeout);
    if let Err(e) = link.handshake().await {
        link.close().await;
        return Err(e);
    }
    Ok(link)
}
