//! Background consumers of [`HubEvent`]s.

use crate::event_bus::EventBus;
use crate::events::HubEvent;
use crate::streak::StreakAwarder;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const STREAK_FAILURES_METRIC: &str = "hub_streak_award_failures_total";
pub const EVENTS_METRIC: &str = "hub_events_total";

/// Log every event and count it by type until the bus closes.
pub fn spawn_logging_subscriber(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let kind = event.kind();
                    metrics::counter!(EVENTS_METRIC, "type" => kind).increment(1);
                    match event {
                        HubEvent::CommentPosted {
                            user_id,
                            comment_id,
                            post_id,
                            posted_at,
                        } => tracing::info!(
                            event_type = kind,
                            user_id,
                            comment_id,
                            post_id,
                            %posted_at,
                            "hub event: comment posted"
                        ),
                        HubEvent::ModerationChanged {
                            post_id,
                            status,
                            changed_at,
                        } => tracing::info!(
                            event_type = kind,
                            post_id,
                            status = status.as_str(),
                            %changed_at,
                            "hub event: moderation changed"
                        ),
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "logging subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Award streak points for every `CommentPosted` until the bus closes.
///
/// Subscribes before spawning, so events published right after this returns are seen.
/// Award failures are logged and counted here and never reach the comment's writer.
pub fn spawn_streak_subscriber(bus: &EventBus, awarder: StreakAwarder) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(HubEvent::CommentPosted {
                    user_id,
                    comment_id,
                    post_id,
                    posted_at,
                }) => {
                    if let Err(err) = awarder.award(user_id, comment_id, posted_at).await {
                        metrics::counter!(STREAK_FAILURES_METRIC).increment(1);
                        tracing::warn!(
                            user_id,
                            comment_id,
                            post_id,
                            error = %err,
                            "streak award failed"
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    metrics::counter!(STREAK_FAILURES_METRIC).increment(missed);
                    tracing::warn!(missed, "streak subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => {
                    tracing::info!("streak subscriber shutting down (event bus closed)");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubStore, NewPost};
    use crate::points::PointsLedger;
    use chrono::{TimeZone, Utc};
    use common::clock::{Clock, FixedClock};
    use common::config::Streak;
    use common::db::AsyncDb;
    use common::types::ModerationStatus;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reply_awards_streak_after_bus_drains() {
        let db = AsyncDb::open_memory().await.unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
        ));
        let bus = EventBus::new(16);
        let hub = HubStore::new(db.clone(), clock.clone(), bus.clone());
        let awarder = StreakAwarder::new(db.clone(), Streak::default());
        let handle = spawn_streak_subscriber(&bus, awarder);

        let author = hub.create_user("a@hub.io").await.unwrap();
        let replier = hub.create_user("r@hub.io").await.unwrap();
        let hub_id = hub.create_hub(1, "h", None).await.unwrap();
        let root = hub
            .create_post(NewPost::thread(hub_id, author, "t", "c"))
            .await
            .unwrap();
        hub.create_post(NewPost::reply(hub_id, replier, root, "first"))
            .await
            .unwrap();
        hub.create_post(NewPost::reply(hub_id, replier, root, "second"))
            .await
            .unwrap();

        drop(hub);
        drop(bus);
        handle.await.unwrap();

        let ledger = PointsLedger::new(db, clock);
        assert_eq!(ledger.get_balance(replier).await.unwrap(), 5);
        assert_eq!(ledger.get_balance(author).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_award_does_not_stop_the_subscriber() {
        let db = AsyncDb::open_memory().await.unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 6, 2, 9, 0, 0).unwrap(),
        ));
        let bus = EventBus::new(16);
        let hub = HubStore::new(db.clone(), clock.clone(), bus.clone());
        let awarder = StreakAwarder::new(db.clone(), Streak::default());
        let handle = spawn_streak_subscriber(&bus, awarder);

        // Unknown user and comment: the ledger insert violates foreign keys.
        bus.publish(HubEvent::CommentPosted {
            user_id: 99,
            comment_id: 99,
            post_id: 98,
            posted_at: clock.now(),
        });

        let user = hub.create_user("u@hub.io").await.unwrap();
        let hub_id = hub.create_hub(1, "h", None).await.unwrap();
        let root = hub
            .create_post(NewPost::thread(hub_id, user, "t", "c"))
            .await
            .unwrap();
        hub.create_post(NewPost::reply(hub_id, user, root, "still counted"))
            .await
            .unwrap();

        drop(hub);
        drop(bus);
        handle.await.unwrap();

        let ledger = PointsLedger::new(db, clock);
        assert_eq!(ledger.get_balance(user).await.unwrap(), 5);
        assert_eq!(ledger.get_balance(99).await.unwrap(), 0);
    }

    #[test]
    fn test_logging_subscriber_counts_every_event_type() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        // Current-thread, so the spawned subscriber records into the local recorder.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let at = Utc.with_ymd_and_hms(2026, 6, 3, 9, 0, 0).unwrap();
                let bus = EventBus::new(16);
                let task = spawn_logging_subscriber(&bus);
                bus.publish(HubEvent::CommentPosted {
                    user_id: 1,
                    comment_id: 2,
                    post_id: 3,
                    posted_at: at,
                });
                bus.publish(HubEvent::ModerationChanged {
                    post_id: 2,
                    status: ModerationStatus::Flagged,
                    changed_at: at,
                });
                drop(bus);
                task.await.unwrap();
            });
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("hub_events_total{type=\"comment_posted\"} 1"),
            "got:\n{rendered}"
        );
        assert!(rendered.contains("hub_events_total{type=\"moderation_changed\"} 1"));
    }
}
