use crate::ProbeError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONN_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ProbeError::InvalidConnTest(format!(
                "unknown protocol '{other}'"
            ))),
        }
    }
}

/// Arguments for a guest-side "can I connect" test.
///
/// Renders as `<proto> <dst> <port> wait <duration>[ <base64 payload>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnTestSpec {
    pub proto: Protocol,
    pub dst: String,
    pub port: u16,
    pub wait: Duration,
    pub payload: Option<String>,
}

impl ConnTestSpec {
    #[must_use]
    pub fn new(proto: Protocol, dst: impl Into<String>, port: u16) -> Self {
        Self {
            proto,
            dst: dst.into(),
            port,
            wait: DEFAULT_CONN_WAIT,
            payload: None,
        }
    }

    /// A zero or missing wait falls back to the default.
    #[must_use]
    pub fn with_wait(mut self, wait: Option<Duration>) -> Self {
        self.wait = match wait {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_CONN_WAIT,
        };
        self
    }

    /// Attach a UDP payload.
    ///
    /// # Errors
    /// Returns `ProbeError::InvalidConnTest` if the payload is not valid base64.
    pub fn with_payload(mut self, payload: Option<&str>) -> Result<Self, ProbeError> {
        if let Some(payload) = payload.filter(|p| !p.is_empty()) {
            STANDARD
                .decode(payload)
                .map_err(|e| ProbeError::InvalidConnTest(format!("invalid UDP payload: {e}")))?;
            self.payload = Some(payload.to_string());
        }
        Ok(self)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut spec = format!(
            "{} {} {} wait {}",
            self.proto,
            self.dst,
            self.port,
            compact_duration(self.wait)
        );

        if self.proto == Protocol::Udp
            && let Some(payload) = &self.payload
        {
            spec.push(' ');
            spec.push_str(payload);
        }

        spec
    }
}

// The guest agent only accepts compact durations such as "90s", never "1m 30s".
fn compact_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_render_defaults_wait() {
        let spec = ConnTestSpec::new(Protocol::Tcp, "10.0.0.2", 80).with_wait(None);
        assert_eq!(spec.render(), "tcp 10.0.0.2 80 wait 5s");

        let zero = ConnTestSpec::new(Protocol::Tcp, "10.0.0.2", 80)
            .with_wait(Some(Duration::ZERO));
        assert_eq!(zero.wait, DEFAULT_CONN_WAIT);
    }

    #[test]
    fn test_render_udp_payload() {
        let spec = ConnTestSpec::new(Protocol::Udp, "10.0.0.2", 53)
            .with_wait(Some(Duration::from_secs(90)))
            .with_payload(Some("aGVsbG8="))
            .unwrap();
        assert_eq!(spec.render(), "udp 10.0.0.2 53 wait 90s aGVsbG8=");
    }

    #[test]
    fn test_payload_ignored_for_tcp() {
        let spec = ConnTestSpec::new(Protocol::Tcp, "h", 22)
            .with_payload(Some("aGVsbG8="))
            .unwrap();
        assert_eq!(spec.render(), "tcp h 22 wait 5s");
    }

    #[test]
    fn test_invalid_payload_rejected() {
        let err = ConnTestSpec::new(Protocol::Udp, "h", 53)
            .with_payload(Some("not base64!"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidConnTest(_)));
    }

    #[test]
    fn test_sub_second_wait() {
        let spec =
            ConnTestSpec::new(Protocol::Tcp, "h", 1).with_wait(Some(Duration::from_millis(1500)));
        assert_eq!(spec.render(), "tcp h 1 wait 1500ms");
    }
}
