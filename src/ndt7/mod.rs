//! ndt7 measurement exchange over WebSocket.
//!
//! One side of a session sends binary payload ([`sender`]), the other counts
//! it ([`receiver`]); both send JSON measurement frames describing their own
//! view every [`params::UPDATE_INTERVAL`](crate::params::UPDATE_INTERVAL).
//! Which side sends follows from the session's
//! [`Direction`](crate::spec::Direction): the server for downloads, the client
//! for uploads. The role code is shared by client and server and works over
//! any WebSocket transport, cleartext or TLS.

use std::time::Duration;

pub mod receiver;
pub mod report;
pub mod sender;
pub mod server;

pub use server::Ndt7Server;

/// When a session stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Sender: how long to send. Receiver: how long to wait for the sender.
    pub duration: Duration,
    /// Sender only: stop after this many payload bytes.
    pub bytes: Option<u64>,
}

impl Limits {
    /// Time-bounded limits.
    pub fn duration(duration: Duration) -> Self {
        Limits {
            duration,
            bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Transport;
    use crate::emitter::tests::{Event, Recorder};
    use crate::error::PerfError;
    use crate::meter::Session;
    use crate::params;
    use crate::spec::{Direction, Origin};

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn sessions(direction: Direction) -> (Session, Session) {
        let server = Session::new(direction, Transport::Ndt7, Origin::Server);
        let client = Session::new(direction, Transport::Ndt7, Origin::Client);
        match direction {
            Direction::Download => (server, client),
            Direction::Upload => (client, server),
        }
    }

    #[tokio::test]
    async fn receiver_count_matches_sender_final_frame() {
        let (tx_ws, rx_ws) = pair().await;
        let (tx_session, rx_session) = sessions(Direction::Download);
        let sent_events = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let bytes = 5 * params::CHUNK_SIZE as u64 + 123;
        let sending = sender::run(
            tx_ws,
            tx_session,
            Limits {
                duration: Duration::from_secs(30),
                bytes: Some(bytes),
            },
            sent_events.clone(),
            cancel.clone(),
        );
        let receiving = receiver::run(
            rx_ws,
            rx_session,
            Limits::duration(Duration::from_secs(30)),
            Arc::new(Recorder::default()),
            cancel.clone(),
        );
        let (sent, received) = tokio::join!(sending, receiving);
        let (sent, received) = (sent.unwrap(), received.unwrap());

        assert_eq!(sent.local.bytes, bytes);
        assert_eq!(received.local.bytes, bytes);
        let final_frame = received.peer.expect("sender's final measurement");
        assert_eq!(final_frame.num_bytes(), Some(bytes));
        assert_eq!(final_frame.origin, Some(Origin::Server));
        assert!(matches!(
            sent_events.events().last(),
            Some(Event::Complete(r)) if r.bytes == bytes
        ));
    }

    #[tokio::test]
    async fn time_bounded_upload_reports_periodically() {
        let (rx_ws, tx_ws) = pair().await;
        let (tx_session, rx_session) = sessions(Direction::Upload);
        let received_events = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let sending = sender::run(
            tx_ws,
            tx_session,
            Limits::duration(Duration::from_millis(1200)),
            Arc::new(Recorder::default()),
            cancel.clone(),
        );
        let receiving = receiver::run(
            rx_ws,
            rx_session,
            Limits::duration(Duration::from_secs(30)),
            received_events.clone(),
            cancel.clone(),
        );
        let (sent, received) = tokio::join!(sending, receiving);
        let (sent, received) = (sent.unwrap(), received.unwrap());

        assert!(sent.local.bytes > 0);
        assert_eq!(received.local.bytes, sent.local.bytes);
        assert_eq!(received.peer.unwrap().num_bytes(), Some(sent.local.bytes));

        let peer_counts: Vec<u64> = received_events
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Peer(m) => m.num_bytes(),
                _ => None,
            })
            .collect();
        // periodic frames plus the final one
        assert!(peer_counts.len() >= 3, "{peer_counts:?}");
        assert!(peer_counts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn sender_stops_when_receiver_goes_away() {
        let (tx_ws, rx_ws) = pair().await;
        let (tx_session, rx_session) = sessions(Direction::Download);
        let cancel = CancellationToken::new();

        let sending = sender::run(
            tx_ws,
            tx_session,
            Limits::duration(Duration::from_secs(30)),
            Arc::new(Recorder::default()),
            cancel.clone(),
        );
        let receiving = receiver::run(
            rx_ws,
            rx_session,
            Limits::duration(Duration::from_millis(300)),
            Arc::new(Recorder::default()),
            cancel.clone(),
        );
        let (sent, received) = tokio::join!(sending, receiving);
        let received = received.unwrap();

        assert!(received.local.bytes > 0);
        // whatever the sender saw, it ended well before its 30 s budget
        if let Ok(sent) = sent {
            assert!(sent.local.elapsed < Duration::from_secs(30));
        }
    }

    #[tokio::test]
    async fn cancellation_ends_both_roles() {
        let (tx_ws, rx_ws) = pair().await;
        let (tx_session, rx_session) = sessions(Direction::Download);
        let cancel = CancellationToken::new();
        let recorder = Arc::new(Recorder::default());

        let sending = sender::run(
            tx_ws,
            tx_session,
            Limits::duration(Duration::from_secs(30)),
            recorder.clone(),
            cancel.clone(),
        );
        let receiving = receiver::run(
            rx_ws,
            rx_session,
            Limits::duration(Duration::from_secs(30)),
            Arc::new(Recorder::default()),
            cancel.clone(),
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        };
        let (sent, received, ()) = tokio::join!(sending, receiving, canceller);

        assert!(matches!(sent, Err(PerfError::Cancelled)));
        assert!(matches!(received, Err(PerfError::Cancelled)));
        assert!(matches!(recorder.events().last(), Some(Event::Error(r)) if r.bytes > 0));
    }

    #[tokio::test]
    async fn binary_from_receiver_is_a_protocol_violation() {
        use futures_util::SinkExt;

        let (tx_ws, mut rogue) = pair().await;
        let (tx_session, _) = sessions(Direction::Download);

        let sending = sender::run(
            tx_ws,
            tx_session,
            Limits::duration(Duration::from_secs(30)),
            Arc::new(Recorder::default()),
            CancellationToken::new(),
        );
        let misbehaving = async {
            let _ = rogue
                .send(tokio_tungstenite::tungstenite::Message::binary(vec![1u8, 2, 3]))
                .await;
            rogue
        };
        let (sent, _rogue) = tokio::join!(sending, misbehaving);
        assert!(matches!(sent, Err(PerfError::Protocol(_))));
    }
}
