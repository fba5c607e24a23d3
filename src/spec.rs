//! ndt7 protocol data types.
//!
//! These structs match the JSON measurement messages defined in the
//! [ndt7 specification](https://github.com/m-lab/ndt-server/blob/master/spec/ndt7-protocol.md).
//! [`Direction`] doubles as the transfer direction of the HTTP endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Measurement computed by the client.
    Client,
    /// Measurement computed by the server.
    Server,
}

/// Which way payload bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Server emits bytes to the client (GET, `/ndt/v7/download`).
    Download,
    /// Client emits bytes to the server (PUT, `/ndt/v7/upload`).
    Upload,
}

impl Direction {
    /// Which side sends binary payload for this direction.
    pub fn sender(self) -> Origin {
        match self {
            Direction::Download => Origin::Server,
            Direction::Upload => Origin::Client,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Client => f.write_str("client"),
            Origin::Server => f.write_str("server"),
        }
    }
}

/// Application-level throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Microseconds elapsed since the start of the test.
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
    /// Total payload bytes transferred so far.
    #[serde(rename = "NumBytes")]
    pub num_bytes: i64,
}

/// Endpoint addresses and connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Client address as `ip:port`.
    #[serde(rename = "Client")]
    pub client: String,
    /// Server address as `ip:port`.
    #[serde(rename = "Server")]
    pub server: String,
    /// Unique identifier for the test assigned by the server.
    #[serde(rename = "UUID", skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// TCP connection metrics reported by kernel-instrumented peers.
///
/// This crate never produces these, but accepts them from other ndt7 servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TCPInfo {
    /// Bytes acknowledged by the peer.
    #[serde(rename = "BytesAcked", skip_serializing_if = "Option::is_none")]
    pub bytes_acked: Option<i64>,
    /// Bytes received from the peer.
    #[serde(rename = "BytesReceived", skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    /// Microseconds elapsed since the TCP connection was established.
    #[serde(rename = "ElapsedTime", skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<i64>,
    /// Minimum round-trip time observed (microseconds).
    #[serde(rename = "MinRTT", skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<i64>,
    /// Smoothed round-trip time (microseconds).
    #[serde(rename = "RTT", skip_serializing_if = "Option::is_none")]
    pub rtt: Option<i64>,
}

/// A single measurement message exchanged during an ndt7 test.
///
/// Each side sends its own [`AppInfo`] counters; the server adds
/// [`ConnectionInfo`] to the first message of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Application-level throughput counters.
    #[serde(rename = "AppInfo", skip_serializing_if = "Option::is_none")]
    pub app_info: Option<AppInfo>,
    /// Connection endpoint addresses.
    #[serde(rename = "ConnectionInfo", skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
    /// Which side produced this measurement.
    #[serde(rename = "Origin", skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Which subtest this measurement belongs to.
    #[serde(rename = "Test", skip_serializing_if = "Option::is_none")]
    pub test: Option<Direction>,
    /// TCP-level metrics from the kernel.
    #[serde(rename = "TCPInfo", skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TCPInfo>,
}

impl Measurement {
    /// Payload bytes the producer claims to have moved, if present.
    pub fn num_bytes(&self) -> Option<u64> {
        self.app_info
            .as_ref()
            .and_then(|app| u64::try_from(app.num_bytes).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_measurement() {
        let measurement = Measurement {
            app_info: Some(AppInfo::default()),
            origin: Some(Origin::Server),
            test: Some(Direction::Download),
            ..Default::default()
        };

        let json_output = serde_json::to_string(&measurement).unwrap();
        assert!(json_output.contains(r#""AppInfo""#));
        assert!(json_output.contains(r#""ElapsedTime""#));
        assert!(json_output.contains(r#""Origin":"server""#));
        assert!(json_output.contains(r#""Test":"download""#));

        // Omited fields are absent
        assert!(!json_output.contains("TCPInfo"));
        assert!(!json_output.contains("ConnectionInfo"));
    }

    #[test]
    fn empty_measurement_is_empty_object() {
        let json_output = serde_json::to_string(&Measurement::default()).unwrap();
        assert_eq!(json_output, "{}");
    }

    #[test]
    fn accepts_foreign_server_messages() {
        let json = r#"{
            "AppInfo": {"ElapsedTime": 1234, "NumBytes": 5678},
            "ConnectionInfo": {
                "Client": "1.2.3.4:5678",
                "Server": "[::1]:2345",
                "UUID": "abc-1234"
            },
            "Origin": "server",
            "Test": "upload",
            "TCPInfo": {"RTT": 6000, "MinRTT": 5000, "BusyTime": 10}
        }"#;
        let m: Measurement = serde_json::from_str(json).unwrap();

        assert_eq!(m.num_bytes(), Some(5678));
        assert_eq!(m.origin, Some(Origin::Server));
        assert_eq!(m.test, Some(Direction::Upload));
        assert_eq!(m.connection_info.unwrap().uuid.as_deref(), Some("abc-1234"));
        assert_eq!(m.tcp_info.unwrap().min_rtt, Some(5000));
    }

    #[test]
    fn negative_byte_count_is_not_a_count() {
        let m = Measurement {
            app_info: Some(AppInfo {
                elapsed_time: 1,
                num_bytes: -1,
            }),
            ..Default::default()
        };
        assert_eq!(m.num_bytes(), None);
    }

    #[test]
    fn sender_role_follows_direction() {
        assert_eq!(Direction::Download.sender(), Origin::Server);
        assert_eq!(Direction::Upload.sender(), Origin::Client);
    }
}
