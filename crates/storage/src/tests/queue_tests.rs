use super::*;
use crate::memory::MemoryKvStore;

fn login(raw: &str) -> Login {
    Login::parse(raw).expect("login")
}

async fn setup() -> (Arc<dyn KvStore>, QueueStore) {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    store.create_dir("/users/alice").await.expect("alice");
    store.create_dir("/users/bob").await.expect("bob");
    (Arc::clone(&store), QueueStore::new(store))
}

fn message(body: &str) -> ChatMessage {
    ChatMessage::new(login("alice"), login("bob"), body)
}

fn bodies(entries: &[QueueEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.decode().expect("decode").body)
        .collect()
}

#[tokio::test]
async fn ensure_user_queues_is_idempotent() {
    let (store, queues) = setup().await;
    queues.ensure_user_queues(&login("bob")).await.expect("first");
    queues.ensure_user_queues(&login("bob")).await.expect("second");
    assert!(store.exists("/users/bob/to_send_queue").await.expect("exists"));
    assert!(store.exists("/users/bob/sent_queue").await.expect("exists"));
}

#[tokio::test]
async fn ensure_user_queues_rejects_unknown_login() {
    let (store, queues) = setup().await;
    let err = queues
        .ensure_user_queues(&login("ghost"))
        .await
        .err()
        .expect("should fail");
    assert!(matches!(err, QueueError::UserNotFound(ref l) if l.as_str() == "ghost"));
    assert!(!store.exists("/users/ghost").await.expect("exists"));
}

#[tokio::test]
async fn peek_all_returns_enqueue_order() {
    let (_store, queues) = setup().await;
    let bob = login("bob");
    queues.ensure_user_queues(&bob).await.expect("queues");
    for body in ["one", "two", "three", "four"] {
        queues
            .enqueue(&bob, QueueName::ToSend, &message(body))
            .await
            .expect("enqueue");
    }

    let all = queues.drain(&bob, QueueName::ToSend, DrainMode::PeekAll).await;
    assert_eq!(bodies(&all), vec!["one", "two", "three", "four"]);

    let one = queues.drain(&bob, QueueName::ToSend, DrainMode::PeekOne).await;
    assert_eq!(bodies(&one), vec!["one"]);
}

#[tokio::test]
async fn drain_of_missing_queue_is_empty_not_error() {
    let (_store, queues) = setup().await;
    let entries = queues
        .drain(&login("ghost"), QueueName::ToSend, DrainMode::PeekAll)
        .await;
    assert!(entries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn block_one_times_out_with_empty_result() {
    let (_store, queues) = setup().await;
    let bob = login("bob");
    queues.ensure_user_queues(&bob).await.expect("queues");
    let entries = queues
        .drain(
            &bob,
            QueueName::ToSend,
            DrainMode::BlockOne(Duration::from_secs(30)),
        )
        .await;
    assert!(entries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_block_one_waits_out_its_timeout() {
    let (_store, queues) = setup().await;
    let started = tokio::time::Instant::now();
    let entries = queues
        .drain(
            &login("ghost"),
            QueueName::ToSend,
            DrainMode::BlockOne(Duration::from_secs(30)),
        )
        .await;
    assert!(entries.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test]
async fn block_one_returns_entry_enqueued_while_waiting() {
    let (_store, queues) = setup().await;
    let bob = login("bob");
    queues.ensure_user_queues(&bob).await.expect("queues");

    let reader = queues.clone();
    let reader_login = bob.clone();
    let waiting = tokio::spawn(async move {
        reader
            .drain(
                &reader_login,
                QueueName::ToSend,
                DrainMode::BlockOne(Duration::from_secs(30)),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    queues
        .enqueue(&bob, QueueName::ToSend, &message("wake"))
        .await
        .expect("enqueue");

    let entries = waiting.await.expect("join");
    assert_eq!(bodies(&entries), vec!["wake"]);
}

#[tokio::test]
async fn commit_moves_entries_from_to_send_to_sent() {
    let (store, queues) = setup().await;
    let bob = login("bob");
    queues.ensure_user_queues(&bob).await.expect("queues");
    queues
        .enqueue(&bob, QueueName::ToSend, &message("hi"))
        .await
        .expect("enqueue");
    queues
        .enqueue(&bob, QueueName::ToSend, &message("there"))
        .await
        .expect("enqueue");

    let batch = queues.drain(&bob, QueueName::ToSend, DrainMode::PeekAll).await;
    queues.commit(&bob, &batch).await.expect("commit");

    for entry in &batch {
        assert!(matches!(
            store.get(&entry.key).await,
            Err(KvError::NotFound(_))
        ));
    }
    let sent = queues.drain(&bob, QueueName::Sent, DrainMode::PeekAll).await;
    assert_eq!(bodies(&sent), vec!["hi", "there"]);
    assert!(queues
        .drain(&bob, QueueName::ToSend, DrainMode::PeekAll)
        .await
        .is_empty());
}

#[tokio::test]
async fn history_keeps_newest_entries_oldest_first() {
    let (_store, queues) = setup().await;
    let bob = login("bob");
    queues.ensure_user_queues(&bob).await.expect("queues");
    for i in 0..15 {
        queues
            .enqueue(&bob, QueueName::Sent, &message(&format!("m{i}")))
            .await
            .expect("enqueue");
    }

    let history = queues.history(&bob, 10).await;
    let expected: Vec<String> = (5..15).map(|i| format!("m{i}")).collect();
    assert_eq!(bodies(&history), expected);

    let short = queues.history(&login("alice"), 10).await;
    assert!(short.is_empty());
}
