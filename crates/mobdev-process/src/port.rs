use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

use mobdev_traits::config::Config;
use mobdev_traits::process::ProcessError;

/// Timing of a [`wait_for_port`] poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortWait {
    /// Delay between two failed probes.
    pub interval: Duration,
    /// Overall deadline, measured from the first probe.
    pub timeout: Duration,
    /// Bound on a single connect attempt.
    pub probe_timeout: Duration,
}

impl Default for PortWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            timeout: Duration::from_millis(30000),
            probe_timeout: Duration::from_millis(1000),
        }
    }
}

impl PortWait {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.port_wait_interval(),
            timeout: config.port_wait_timeout(),
            probe_timeout: config.port_probe_timeout(),
        }
    }
}

/// Makes one connection attempt. The socket is closed straight away.
pub async fn is_port_open(host: &str, port: u16, probe_timeout: Duration) -> bool {
    match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            trace!("{}:{} not reachable: {}", host, port, e);
            false
        }
        Err(_) => {
            trace!("{}:{} probe timed out", host, port);
            false
        }
    }
}

/// Polls `host:port` at a fixed interval until it accepts a connection.
pub async fn wait_for_port(host: &str, port: u16, wait: PortWait) -> Result<(), ProcessError> {
    let started = Instant::now();
    let deadline = started + wait.timeout;

    while Instant::now() < deadline {
        if is_port_open(host, port, wait.probe_timeout).await {
            debug!("Port {} on {} is open after {:?}", port, host, started.elapsed());
            return Ok(());
        }
        sleep(wait.interval).await;
    }

    Err(ProcessError::Timeout {
        port,
        host: host.to_string(),
        waited_ms: started.elapsed().as_millis(),
    })
}

/// Asks the OS for a currently unused loopback port.
pub async fn find_free_port() -> Result<u16, ProcessError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> PortWait {
        PortWait {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(400),
            probe_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_is_port_open_with_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_is_port_open_on_closed_port() {
        let port = find_free_port().await.unwrap();
        assert!(!is_port_open("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_wait_for_port_sees_late_listener() {
        let port = find_free_port().await.unwrap();
        let server = tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            // Keep the listener alive until the poll has connected.
            let _ = listener.accept().await;
        });

        let wait = PortWait { timeout: Duration::from_secs(5), ..quick() };
        wait_for_port("127.0.0.1", port, wait).await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_wait_for_port_times_out() {
        let port = find_free_port().await.unwrap();
        let err = wait_for_port("127.0.0.1", port, quick()).await.unwrap_err();
        match err {
            ProcessError::Timeout { port: p, waited_ms, .. } => {
                assert_eq!(p, port);
                assert!(waited_ms >= 400);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_port_wait_from_config() {
        let config = Config {
            port_wait_interval_ms: Some(250),
            ..Config::empty()
        };
        let wait = PortWait::from_config(&config);
        assert_eq!(wait.interval, Duration::from_millis(250));
        assert_eq!(wait.timeout, Duration::from_millis(30000));
    }
}
