use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::models::messages::{PeerPresenceMessage, SendMessage, UpdateMessage};
use crate::ws::connctx::ConnId;
use crate::ws::session::Session;

/// Item fanned out to every subscriber of a session
#[derive(Clone, Debug)]
pub enum Outbound {
    /// `origin` is `None` for updates that came from another process
    Update { origin: Option<ConnId>, update: Arc<Vec<u8>> },
    Presence { origin: ConnId, payload: Arc<Vec<u8>> },
}

impl Outbound {
    /// What `conn` should receive for this item; nothing if it originated it
    pub fn for_subscriber(&self, conn: ConnId) -> Option<SendMessage> {
        match self {
            Outbound::Update { origin, .. } if *origin == Some(conn) => None,
            Outbound::Update { update, .. } => Some(SendMessage::Update(UpdateMessage { update: update.to_vec() })),
            Outbound::Presence { origin, .. } if *origin == conn => None,
            Outbound::Presence { origin, payload } => Some(SendMessage::Presence(PeerPresenceMessage {
                conn: *origin,
                payload: payload.to_vec(),
            })),
        }
    }
}

pub fn encode(msg: &SendMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            error!("Failed to encode outgoing message: {}", e);
            None
        }
    }
}

/// Deliver a session's broadcast to one connection until either side closes.
///
/// Items arrive in the order the session produced them. A receiver that
/// fell behind is resynchronized with a full snapshot.
pub async fn forward_updates<S>(session: Arc<Session>, conn: ConnId, mut rx: Receiver<Outbound>, sink: Arc<Mutex<S>>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let msg = match rx.recv().await {
            Ok(item) => match item.for_subscriber(conn) {
                Some(msg) => msg,
                None => continue,
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!("Connection {} lagged {} messages on {}, resyncing", conn, skipped, session.name());
                match session.snapshot() {
                    Ok(snapshot) => SendMessage::Update(UpdateMessage { update: snapshot }),
                    Err(e) => {
                        error!("Failed to resync connection {}: {}", conn, e);
                        break;
                    }
                }
            }
            Err(RecvError::Closed) => break,
        };

        let Some(frame) = encode(&msg) else { continue };
        if let Err(e) = sink.lock().await.send(frame).await {
            debug!("Connection {} went away: {}", conn, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memstore::MemoryStore;
    use crate::services::persistence::{PersistenceAdapter, RetryPolicy};
    use crate::ws::testing::{client_update, text_of};
    use std::time::Duration;

    #[test]
    fn originator_is_skipped() {
        let update = Outbound::Update { origin: Some(1), update: Arc::new(vec![1]) };
        assert!(update.for_subscriber(1).is_none());
        assert!(matches!(update.for_subscriber(2), Some(SendMessage::Update(_))));

        let remote = Outbound::Update { origin: None, update: Arc::new(vec![1]) };
        assert!(remote.for_subscriber(1).is_some());

        let presence = Outbound::Presence { origin: 3, payload: Arc::new(vec![9]) };
        assert!(presence.for_subscriber(3).is_none());
        match presence.for_subscriber(4) {
            Some(SendMessage::Presence(p)) => assert_eq!(p.conn, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn lagging_receiver_gets_snapshot() {
        let adapter = PersistenceAdapter::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(10),
            RetryPolicy { max_attempts: 1, backoff: Duration::from_millis(1) },
        );
        let session = Session::create("doc", adapter.load("doc").await.unwrap(), &adapter, 1);
        let rx = session.subscribe();
        session.apply_local(1, &client_update("a")).unwrap();
        session.apply_local(1, &client_update("b")).unwrap();

        let (frames_tx, mut frames) = tokio::sync::mpsc::unbounded_channel::<Message>();
        let sink = futures_util::sink::unfold(frames_tx, |tx, frame: Message| async move {
            tx.send(frame).map_err(|e| e.to_string())?;
            Ok::<_, String>(tx)
        });
        let sink = Arc::new(Mutex::new(Box::pin(sink)));
        let task = tokio::spawn(forward_updates(session.clone(), 2, rx, sink));

        // Snapshot for the lag, then the one update still buffered
        let mut sent = Vec::new();
        for _ in 0..2 {
            match frames.recv().await.unwrap() {
                Message::Text(text) => sent.push(serde_json::from_str::<SendMessage>(&text).unwrap()),
                other => panic!("unexpected {:?}", other),
            }
        }
        task.abort();

        match &sent[0] {
            SendMessage::Update(msg) => assert_eq!(text_of(&msg.update).len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        match &sent[1] {
            SendMessage::Update(msg) => assert_eq!(text_of(&msg.update), "b"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(frames.try_recv().is_err());
    }
}
