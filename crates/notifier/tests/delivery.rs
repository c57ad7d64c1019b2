//! Delivery worker behaviour against the in-memory store and fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_common::types::MessageStatus;
use courier_engine::election::FixedRole;
use courier_engine::gc::MessageGc;
use courier_engine::messages::MessageRepository;
use courier_engine::preferences::{KindRegistration, Preferences, Registration};
use courier_engine::strategies::Target;
use courier_notifier::{
    QueueGauge, Resolution, SendError, Template, Templates, WorkerError, WorkerPool,
};
use courier_queue::{JobQueue, NewJob};
use courier_test_utils::{FakeDirectory, Harness, options, request};

// ============================================================
// Shared helpers
// ============================================================

fn directory() -> FakeDirectory {
    FakeDirectory::new()
        .with_user("user-1", "one@example.com")
        .with_user("user-2", "two@example.com")
        .with_user("user-3", "three@example.com")
        .with_user("user-4", "four@example.com")
}

async fn notify_user(h: &Harness, guid: &str) -> String {
    let responses = h
        .strategies
        .notify(
            &Target::User(guid.to_string()),
            request(options("maintenance", "Down at noon")),
        )
        .await
        .unwrap();
    responses[0].message_id.clone()
}

// ============================================================
// Single delivery outcomes
// ============================================================

#[tokio::test]
async fn test_successful_delivery_marks_delivered_and_removes_job() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);

    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));
    assert!(h.store.job(&id).is_none());
    assert_eq!(
        h.store.history(&id),
        vec![
            MessageStatus::Queued,
            MessageStatus::Delivering,
            MessageStatus::Delivered
        ]
    );

    let sent = h.mailer.sent_to("one@example.com");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "CF Notification: Maintenance");
    assert_eq!(sent[0].message_id, id);
    let text = sent[0].text.as_deref().unwrap();
    assert!(text.starts_with("Down at noon"));
    assert!(text.contains("This message was sent directly to you."));
    assert!(sent[0].html.is_none());
}

#[tokio::test]
async fn test_email_recipient_skips_directory_lookup() {
    let h = Harness::new(directory());
    let responses = h
        .strategies
        .notify(
            &Target::Email("ops@example.com".to_string()),
            request(options("maintenance", "hello")),
        )
        .await
        .unwrap();

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
    assert_eq!(h.directory.email_lookups(), 0);
    assert_eq!(
        h.store.status(&responses[0].message_id),
        Some(MessageStatus::Delivered)
    );
}

#[tokio::test]
async fn test_reply_to_is_passed_through() {
    let h = Harness::new(directory());
    let mut opts = options("maintenance", "hello");
    opts.reply_to = "support@example.com".to_string();
    h.strategies
        .notify(&Target::User("user-1".to_string()), request(opts))
        .await
        .unwrap();

    h.drain().await;
    let sent = h.mailer.sent();
    assert_eq!(sent[0].reply_to.as_deref(), Some("support@example.com"));
}

#[tokio::test]
async fn test_transient_failure_retries_then_delivers() {
    let h = Harness::new(directory());
    h.mailer.fail_next(
        "one@example.com",
        vec![SendError::Transient("421 try later".to_string())],
    );
    let id = notify_user(&h, "user-1").await;

    assert_eq!(
        h.drain().await,
        vec![
            Resolution::Retried {
                delay: Duration::ZERO
            },
            Resolution::Delivered
        ]
    );
    assert_eq!(
        h.store.history(&id),
        vec![
            MessageStatus::Queued,
            MessageStatus::Delivering,
            MessageStatus::Failed,
            MessageStatus::Delivering,
            MessageStatus::Delivered
        ]
    );
    assert_eq!(h.mailer.attempts(), 2);
}

#[tokio::test]
async fn test_transient_failures_stop_at_max_attempts() {
    let h = Harness::new(directory());
    h.mailer.fail_always(
        "one@example.com",
        SendError::Transient("connection reset".to_string()),
    );
    let id = notify_user(&h, "user-1").await;

    let resolutions = h.drain().await;

    // The harness allows three attempts in total.
    assert_eq!(resolutions.len(), 3);
    assert_eq!(resolutions.last(), Some(&Resolution::Undeliverable));
    assert_eq!(h.mailer.attempts(), 3);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Undeliverable));
    assert!(h.store.job(&id).is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = Harness::new(directory());
    h.mailer.fail_always(
        "one@example.com",
        SendError::Permanent("550 mailbox unavailable".to_string()),
    );
    let id = notify_user(&h, "user-1").await;

    assert_eq!(h.drain().await, vec![Resolution::Undeliverable]);
    assert_eq!(h.mailer.attempts(), 1);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Undeliverable));
    assert!(h.store.job(&id).is_none());
}

#[tokio::test]
async fn test_unknown_user_is_undeliverable() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-gone").await;

    assert_eq!(h.drain().await, vec![Resolution::Undeliverable]);
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Undeliverable));
}

#[tokio::test]
async fn test_directory_outage_is_retried() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    h.directory.make_unavailable("user-1");

    let worker = h.worker("worker-0");
    let job = h.services.feed.queue().reserve("worker-0").await.unwrap().unwrap();
    let resolution = worker.process(job).await.unwrap();

    assert!(matches!(resolution, Resolution::Retried { .. }));
    assert_eq!(h.store.status(&id), Some(MessageStatus::Failed));
    assert_eq!(h.store.job(&id).unwrap().attempts, 1);
}

#[tokio::test]
async fn test_decrypt_failure_is_retried() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    h.cipher.set_broken(true);

    let worker = h.worker("worker-0");
    let job = h.services.feed.queue().reserve("worker-0").await.unwrap().unwrap();
    let resolution = worker.process(job).await.unwrap();

    assert!(matches!(resolution, Resolution::Retried { .. }));
    assert_eq!(h.mailer.attempts(), 0);

    h.cipher.set_broken(false);
    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));
}

#[tokio::test]
async fn test_render_failure_is_undeliverable() {
    let templates = Templates::default().with_kind(
        "broken",
        Template {
            subject: "{{no_such_field}}".to_string(),
            text: "{{text}}".to_string(),
            html: "{{html}}".to_string(),
        },
    );
    let h = Harness::with_templates(directory(), templates);
    let responses = h
        .strategies
        .notify(
            &Target::User("user-1".to_string()),
            request(options("broken", "hello")),
        )
        .await
        .unwrap();

    assert_eq!(h.drain().await, vec![Resolution::Undeliverable]);
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(
        h.store.status(&responses[0].message_id),
        Some(MessageStatus::Undeliverable)
    );
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let h = Harness::new(directory());
    h.store.insert_message("m-bad", MessageStatus::Queued, chrono::Utc::now());
    h.store
        .insert_job(NewJob::new("m-bad", &serde_json::json!({"unexpected": true})).unwrap());

    assert_eq!(h.drain().await, vec![Resolution::Undeliverable]);
    assert_eq!(h.store.status("m-bad"), Some(MessageStatus::Undeliverable));
    assert!(h.store.job("m-bad").is_none());
}

// ============================================================
// Unsubscribe preferences
// ============================================================

fn registration(kind_id: &str, critical: bool) -> Registration {
    Registration {
        client_id: "mister-client".to_string(),
        source_description: "Platform notices".to_string(),
        kinds: vec![KindRegistration {
            id: kind_id.to_string(),
            description: "Maintenance windows".to_string(),
            critical,
        }],
    }
}

#[tokio::test]
async fn test_unsubscribed_user_is_not_mailed() {
    let h = Harness::new(directory());
    h.preferences.unsubscribe("user-1", "mister-client", "maintenance");
    let id = notify_user(&h, "user-1").await;
    let other = notify_user(&h, "user-2").await;

    let resolutions = h.drain().await;

    assert!(resolutions.contains(&Resolution::Unsubscribed));
    assert!(resolutions.contains(&Resolution::Delivered));
    assert_eq!(h.store.status(&id), Some(MessageStatus::Undeliverable));
    assert!(h.store.job(&id).is_none());
    assert!(h.mailer.sent_to("one@example.com").is_empty());
    assert_eq!(h.store.status(&other), Some(MessageStatus::Delivered));
    assert_eq!(h.directory.email_lookups(), 1);
}

#[tokio::test]
async fn test_global_unsubscribe_stops_every_non_critical_kind() {
    let h = Harness::new(directory());
    h.preferences.unsubscribe_globally("user-1");
    let id = notify_user(&h, "user-1").await;

    assert_eq!(h.drain().await, vec![Resolution::Unsubscribed]);
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Undeliverable));
}

#[tokio::test]
async fn test_critical_kind_ignores_unsubscribes() {
    let h = Harness::new(directory());
    h.preferences
        .register(&registration("maintenance", true))
        .await
        .unwrap();
    h.preferences.unsubscribe("user-1", "mister-client", "maintenance");
    h.preferences.unsubscribe_globally("user-1");
    let id = notify_user(&h, "user-1").await;

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));
}

#[tokio::test]
async fn test_unsubscribe_from_other_kind_does_not_apply() {
    let h = Harness::new(directory());
    h.preferences.unsubscribe("user-1", "mister-client", "marketing");
    h.preferences.unsubscribe("user-1", "other-client", "maintenance");
    notify_user(&h, "user-1").await;

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
}

#[tokio::test]
async fn test_email_recipients_skip_preferences() {
    let h = Harness::new(directory());
    h.preferences.set_down(true);
    h.strategies
        .notify(
            &Target::Email("ops@example.com".to_string()),
            request(options("maintenance", "hello")),
        )
        .await
        .unwrap();

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
}

#[tokio::test]
async fn test_preferences_outage_is_retried() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    h.preferences.set_down(true);

    let worker = h.worker("worker-0");
    let job = h.services.feed.queue().reserve("worker-0").await.unwrap().unwrap();
    let resolution = worker.process(job).await.unwrap();

    assert!(matches!(resolution, Resolution::Retried { .. }));
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Failed));

    h.preferences.set_down(false);
    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
}

// ============================================================
// Storage failures
// ============================================================

#[tokio::test]
async fn test_short_storage_outage_is_absorbed() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    h.store.fail_status_updates(2);

    assert_eq!(h.drain().await, vec![Resolution::Delivered]);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));
}

#[tokio::test]
async fn test_persistent_storage_failure_stops_worker() {
    let h = Harness::new(directory());
    notify_user(&h, "user-1").await;
    h.store.fail_status_updates(usize::MAX);

    let worker = h.worker("worker-0");
    let result = tokio::time::timeout(Duration::from_secs(5), worker.run())
        .await
        .expect("worker did not stop");

    assert!(matches!(result, Err(WorkerError::Storage { .. })));
    assert_eq!(h.mailer.attempts(), 0);
}

#[tokio::test]
async fn test_lost_lease_does_not_remove_reclaimed_job() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    let queue = h.services.feed.queue().clone();

    let stale = queue.reserve("worker-a").await.unwrap().unwrap();
    h.store.expire_leases();
    let fresh = queue.reserve("worker-b").await.unwrap().unwrap();
    assert_eq!(fresh.message_id, id);

    // The stale holder finishes first; it must neither send nor record.
    let resolution = h.worker("worker-a").process(stale).await.unwrap();
    assert_eq!(resolution, Resolution::Abandoned);
    assert!(h.store.job(&id).is_some());
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(h.store.history(&id), vec![MessageStatus::Queued]);

    let resolution = h.worker("worker-b").process(fresh).await.unwrap();
    assert_eq!(resolution, Resolution::Delivered);
    assert!(h.store.job(&id).is_none());
}

#[tokio::test]
async fn test_stale_worker_cannot_overwrite_finished_message() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    let queue = h.services.feed.queue().clone();

    let stale = queue.reserve("worker-a").await.unwrap().unwrap();
    h.store.expire_leases();
    let fresh = queue.reserve("worker-b").await.unwrap().unwrap();

    h.worker("worker-b").process(fresh).await.unwrap();
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));

    h.mailer.fail_next(
        "one@example.com",
        vec![SendError::Transient("421 try later".to_string())],
    );
    let resolution = h.worker("worker-a").process(stale).await.unwrap();

    assert_eq!(resolution, Resolution::Abandoned);
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivered));
    assert_eq!(
        h.store.history(&id),
        vec![
            MessageStatus::Queued,
            MessageStatus::Delivering,
            MessageStatus::Delivered
        ]
    );
    assert!(h.store.job(&id).is_none());

    // The finished message is still collectable.
    let gc = MessageGc::new(
        Arc::new(h.store.clone()),
        Arc::new(FixedRole::leader()),
        Duration::ZERO,
        Duration::from_secs(60),
    );
    assert_eq!(gc.sweep().await.unwrap(), 1);
    assert!(h.store.status(&id).is_none());
}

#[tokio::test]
async fn test_lease_lost_mid_send_leaves_job_to_new_holder() {
    let h = Harness::new(directory());
    let id = notify_user(&h, "user-1").await;
    let queue = h.services.feed.queue().clone();

    let stale = queue.reserve("worker-a").await.unwrap().unwrap();
    // Mark delivering under the first lease, then lose it before the outcome.
    assert!(h.store.update_status(&id, MessageStatus::Delivering, "worker-a").await.unwrap());
    h.store.expire_leases();
    let fresh = queue.reserve("worker-b").await.unwrap().unwrap();

    assert!(
        !h.store
            .update_status(&id, MessageStatus::Undeliverable, "worker-a")
            .await
            .unwrap()
    );
    assert_eq!(h.store.status(&id), Some(MessageStatus::Delivering));
    assert!(!queue.delete(&stale).await.unwrap());

    assert_eq!(
        h.worker("worker-b").process(fresh).await.unwrap(),
        Resolution::Delivered
    );
}

// ============================================================
// Pool
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_delivers_each_job_once() {
    let mut directory = FakeDirectory::new();
    for i in 0..20 {
        directory = directory.with_user(&format!("user-{i}"), &format!("user{i}@example.com"));
    }
    let h = Harness::new(directory);

    let mut pool = WorkerPool::start(4, "test", h.services.clone());
    assert_eq!(pool.len(), 4);

    let responses = h
        .strategies
        .notify(&Target::Everyone, request(options("maintenance", "hello")))
        .await
        .unwrap();
    assert_eq!(responses.len(), 20);

    let queue = h.services.feed.queue().clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while queue.len().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue did not drain");

    let mut per_address: HashMap<String, usize> = HashMap::new();
    for mail in h.mailer.sent() {
        *per_address.entry(mail.to).or_default() += 1;
    }
    assert_eq!(per_address.len(), 20);
    assert!(per_address.values().all(|&n| n == 1));

    for response in &responses {
        assert_eq!(
            h.store.status(&response.message_id),
            Some(MessageStatus::Delivered)
        );
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_pool_wait_reports_fatal_worker() {
    let h = Harness::new(directory());
    notify_user(&h, "user-1").await;
    h.store.fail_status_updates(usize::MAX);

    let mut pool = WorkerPool::start(2, "test", h.services.clone());
    let result = tokio::time::timeout(Duration::from_secs(5), pool.wait())
        .await
        .expect("pool did not report");

    assert!(result.is_err());
    pool.shutdown().await;
}

// ============================================================
// Queue gauge
// ============================================================

#[tokio::test]
async fn test_gauge_reports_only_when_leading() {
    let h = Harness::new(directory());
    notify_user(&h, "user-1").await;
    notify_user(&h, "user-2").await;
    let queue = h.services.feed.queue().clone();

    let leader = QueueGauge::new(
        queue.clone(),
        Arc::new(FixedRole::leader()),
        Duration::from_secs(60),
    );
    assert_eq!(leader.tick().await, Some(2));

    let follower = QueueGauge::new(queue, Arc::new(FixedRole::follower()), Duration::from_secs(60));
    assert_eq!(follower.tick().await, None);
}

#[tokio::test]
async fn test_gauge_survives_zero_interval() {
    let h = Harness::new(directory());
    let queue = h.services.feed.queue().clone();

    let task = QueueGauge::new(queue.clone(), Arc::new(FixedRole::leader()), Duration::ZERO).spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());
    task.abort();

    let gauge = QueueGauge::new(queue, Arc::new(FixedRole::leader()), Duration::MAX);
    assert_eq!(gauge.tick().await, Some(0));
}
