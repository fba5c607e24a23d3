//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Size of each filler chunk handed out by the byte source (1 MiB).
pub const CHUNK_SIZE: usize = 1 << 20;

/// Value of the Sec-WebSocket-Protocol header.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "net.measurementlab.ndt.v7";

/// URL path for the download test.
pub const DOWNLOAD_URL_PATH: &str = "/ndt/v7/download";

/// URL path for the upload test.
pub const UPLOAD_URL_PATH: &str = "/ndt/v7/upload";

/// Initial size of binary messages (8 KiB).
pub const INITIAL_MESSAGE_SIZE: usize = 1 << 13;

/// Maximum size of binary messages (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = CHUNK_SIZE;

/// Threshold for scaling binary messages. When the current message size is
/// <= 1/SCALING_FRACTION of the total bytes sent, the message size doubles.
pub const SCALING_FRACTION: usize = 16;

/// How long the sending side of an ndt7 session keeps sending.
pub const SEND_DURATION: Duration = Duration::from_secs(10);

/// Time after which the receiving side of an ndt7 session gives up.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for individual I/O operations.
pub const IO_TIMEOUT: Duration = Duration::from_secs(7);

/// Interval between measurement updates.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Measurement frames queued while the pump is busy; extra ticks are dropped.
pub const REPORT_QUEUE: usize = 16;

/// HTTP/2 stream and connection flow-control windows (1 GiB).
pub const H2_WINDOW_SIZE: u32 = 1 << 30;

/// HTTP/2 maximum frame size (protocol maximum, ~16 MiB).
pub const H2_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Default number of bytes moved by an HTTP measurement (16 GiB).
pub const DEFAULT_TRANSFER_BYTES: u64 = 1 << 34;
