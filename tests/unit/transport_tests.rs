//! Unit tests for the messenger queue: delivery, photo decoding, and
//! retry behavior, exercised against a recording transport double.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;

use moltd::transport::{MessengerService, Outbound, Transport};
use moltd::{AppError, Result};

#[derive(Default)]
struct RecordingTransport {
    messages: Mutex<Vec<(i64, String)>>,
    photos: Mutex<Vec<(i64, Vec<u8>, String)>>,
    fail_next: AtomicBool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_message(&self, chat_id: i64, text: &str, _is_progress: bool) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::Transport("synthetic outage".into()));
        }
        self.messages
            .lock()
            .expect("messages lock")
            .push((chat_id, text.to_owned()));
        Ok(())
    }

    async fn send_photo(&self, chat_id: i64, image: &[u8], caption: &str) -> Result<()> {
        self.photos
            .lock()
            .expect("photos lock")
            .push((chat_id, image.to_vec(), caption.to_owned()));
        Ok(())
    }

    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for(mut check: impl FnMut() -> bool, deadline: Duration) {
    let start = tokio::time::Instant::now();
    while !check() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn text_messages_are_delivered_in_order() {
    let transport = Arc::new(RecordingTransport::default());
    let (service, _drain) = MessengerService::start(Arc::clone(&transport) as Arc<dyn Transport>);

    for text in ["one", "two", "three"] {
        service
            .enqueue(Outbound::Text {
                chat_id: 5,
                text: text.to_owned(),
                is_progress: false,
            })
            .await
            .expect("enqueue");
    }

    wait_for(
        || transport.messages.lock().expect("lock").len() == 3,
        Duration::from_secs(2),
    )
    .await;
    let messages = transport.messages.lock().expect("lock");
    let texts: Vec<&str> = messages.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(texts, ["one", "two", "three"]);
}

#[tokio::test]
async fn photo_payloads_are_base64_decoded() {
    let transport = Arc::new(RecordingTransport::default());
    let (service, _drain) = MessengerService::start(Arc::clone(&transport) as Arc<dyn Transport>);

    let payload = base64::engine::general_purpose::STANDARD.encode(b"png bytes");
    service
        .enqueue(Outbound::Photo {
            chat_id: 9,
            image_base64: payload,
            caption: "chart".into(),
        })
        .await
        .expect("enqueue");

    wait_for(
        || !transport.photos.lock().expect("lock").is_empty(),
        Duration::from_secs(2),
    )
    .await;
    let photos = transport.photos.lock().expect("lock");
    assert_eq!(photos[0], (9, b"png bytes".to_vec(), "chart".to_owned()));
}

#[tokio::test]
async fn an_invalid_photo_payload_does_not_stall_the_queue() {
    let transport = Arc::new(RecordingTransport::default());
    let (service, _drain) = MessengerService::start(Arc::clone(&transport) as Arc<dyn Transport>);

    service
        .enqueue(Outbound::Photo {
            chat_id: 1,
            image_base64: "!!! not base64 !!!".into(),
            caption: String::new(),
        })
        .await
        .expect("enqueue bad photo");
    service
        .enqueue(Outbound::Text {
            chat_id: 1,
            text: "still alive".into(),
            is_progress: false,
        })
        .await
        .expect("enqueue text");

    wait_for(
        || !transport.messages.lock().expect("lock").is_empty(),
        Duration::from_secs(5),
    )
    .await;
    assert!(transport.photos.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn delivery_is_retried_after_a_transient_failure() {
    let transport = Arc::new(RecordingTransport::default());
    transport.fail_next.store(true, Ordering::SeqCst);
    let (service, _drain) = MessengerService::start(Arc::clone(&transport) as Arc<dyn Transport>);

    service
        .enqueue(Outbound::Text {
            chat_id: 2,
            text: "eventually".into(),
            is_progress: false,
        })
        .await
        .expect("enqueue");

    // First attempt fails, the retry (after ~1s backoff) succeeds.
    wait_for(
        || !transport.messages.lock().expect("lock").is_empty(),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(
        transport.messages.lock().expect("lock")[0].1,
        "eventually"
    );
}

#[tokio::test]
async fn enqueue_lossy_drops_silently_when_closed() {
    let transport = Arc::new(RecordingTransport::default());
    let (service, drain) = MessengerService::start(Arc::clone(&transport) as Arc<dyn Transport>);

    // Closing the drain side must not make enqueue_lossy panic.
    drain.abort();
    service.enqueue_lossy(Outbound::Typing { chat_id: 1 });
}
