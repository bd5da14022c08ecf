use anyhow::{Context, Result};
use common::clock::Clock;
use common::config::{Config, Streak};
use common::db::AsyncDb;
use common::types::{LedgerReason, ModerationStatus, VoteType};
use reputation::event_bus::EventBus;
use reputation::events::subscribers::{spawn_logging_subscriber, spawn_streak_subscriber};
use reputation::hub::{HubStore, NewPost};
use reputation::points::PointsEntry;
use reputation::streak::StreakAwarder;
use reputation::{InvestmentEngine, PointsLedger};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::task::JoinHandle;

const DEFAULT_LEDGER_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Balance { user_id: i64 },
    Ledger { user_id: i64, limit: u32 },
    Grant { user_id: i64, delta: i64 },
    Reconcile { user_id: i64 },
    Invest { user_id: i64, comment_id: i64, amount: i64 },
    Settle { investment_id: i64 },
    SettleDue,
    Comment {
        hub_id: i64,
        user_id: i64,
        parent_id: i64,
        content: String,
    },
    Vote { post_id: i64, user_id: i64, vote: VoteType },
    View { post_id: i64 },
    Moderate { post_id: i64, status: ModerationStatus },
    Link { post_id: i64, item_type: String, item_id: i64 },
    Hubs { org_id: i64 },
    Posts { hub_id: i64 },
    Thread { post_id: i64 },
}

fn int_arg<T>(
    args: &mut impl Iterator<Item = String>,
    name: &str,
    usage: &str,
) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
{
    let raw = args.next().ok_or_else(|| format!("usage: {usage}"))?;
    raw.parse()
        .map_err(|_err| format!("{name} must be an integer, got {raw:?}\nusage: {usage}"))
}

fn named_arg<T>(
    args: &mut impl Iterator<Item = String>,
    usage: &str,
) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = args.next().ok_or_else(|| format!("usage: {usage}"))?;
    raw.parse().map_err(|err| format!("{err}\nusage: {usage}"))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "balance" => Ok(Command::Balance {
            user_id: int_arg(&mut args, "user", "hubd balance <user>")?,
        }),
        "ledger" => {
            let usage = "hubd ledger <user> [limit]";
            let user_id = int_arg(&mut args, "user", usage)?;
            let limit = match args.next() {
                Some(raw) => raw.parse().map_err(|err| {
                    format!("limit must be a positive integer, got {raw:?}: {err}")
                })?,
                None => DEFAULT_LEDGER_LIMIT,
            };
            Ok(Command::Ledger { user_id, limit })
        }
        "grant" => {
            let usage = "hubd grant <user> <delta>";
            Ok(Command::Grant {
                user_id: int_arg(&mut args, "user", usage)?,
                delta: int_arg(&mut args, "delta", usage)?,
            })
        }
        "reconcile" => Ok(Command::Reconcile {
            user_id: int_arg(&mut args, "user", "hubd reconcile <user>")?,
        }),
        "invest" => {
            let usage = "hubd invest <user> <comment> <amount>";
            Ok(Command::Invest {
                user_id: int_arg(&mut args, "user", usage)?,
                comment_id: int_arg(&mut args, "comment", usage)?,
                amount: int_arg(&mut args, "amount", usage)?,
            })
        }
        "settle" => Ok(Command::Settle {
            investment_id: int_arg(&mut args, "investment", "hubd settle <investment>")?,
        }),
        "settle-due" => Ok(Command::SettleDue),
        "comment" => {
            let usage = "hubd comment <hub> <user> <parent> <content...>";
            let hub_id = int_arg(&mut args, "hub", usage)?;
            let user_id = int_arg(&mut args, "user", usage)?;
            let parent_id = int_arg(&mut args, "parent", usage)?;
            let content = args.collect::<Vec<_>>().join(" ");
            if content.trim().is_empty() {
                return Err(format!("comment content is empty\nusage: {usage}"));
            }
            Ok(Command::Comment {
                hub_id,
                user_id,
                parent_id,
                content,
            })
        }
        "vote" => {
            let usage = "hubd vote <post> <user> <up|down>";
            Ok(Command::Vote {
                post_id: int_arg(&mut args, "post", usage)?,
                user_id: int_arg(&mut args, "user", usage)?,
                vote: named_arg(&mut args, usage)?,
            })
        }
        "view" => Ok(Command::View {
            post_id: int_arg(&mut args, "post", "hubd view <post>")?,
        }),
        "moderate" => {
            let usage = "hubd moderate <post> <pending|approved|flagged|removed>";
            Ok(Command::Moderate {
                post_id: int_arg(&mut args, "post", usage)?,
                status: named_arg(&mut args, usage)?,
            })
        }
        "link" => {
            let usage = "hubd link <post> <item-type> <item>";
            Ok(Command::Link {
                post_id: int_arg(&mut args, "post", usage)?,
                item_type: args.next().ok_or_else(|| format!("usage: {usage}"))?,
                item_id: int_arg(&mut args, "item", usage)?,
            })
        }
        "hubs" => Ok(Command::Hubs {
            org_id: int_arg(&mut args, "org", "hubd hubs <org>")?,
        }),
        "posts" => Ok(Command::Posts {
            hub_id: int_arg(&mut args, "hub", "hubd posts <hub>")?,
        }),
        "thread" => Ok(Command::Thread {
            post_id: int_arg(&mut args, "post", "hubd thread <post>")?,
        }),
        other => Err(format!("unknown command: {other}")),
    }
}

/// A hub store for one command. Its events feed the streak and logging subscribers.
struct HubSession {
    hub: HubStore,
    subscribers: Vec<JoinHandle<()>>,
}

impl HubSession {
    /// Drop the store, which holds the only sender, and wait for the subscribers to drain.
    async fn close(self) -> Result<()> {
        let Self { hub, subscribers } = self;
        drop(hub);
        for handle in subscribers {
            handle.await.context("hub event subscriber panicked")?;
        }
        Ok(())
    }
}

/// Handles for the one-shot operator commands.
pub struct App {
    db: AsyncDb,
    clock: Arc<dyn Clock>,
    ledger: PointsLedger,
    engine: InvestmentEngine,
    streak: Streak,
    batch_limit: u32,
}

impl App {
    pub fn new(db: AsyncDb, clock: Arc<dyn Clock>, config: &Config) -> Self {
        Self {
            ledger: PointsLedger::new(db.clone(), clock.clone()),
            engine: InvestmentEngine::new(db.clone(), clock.clone(), config.investment),
            streak: config.streak,
            batch_limit: config.settlement.batch_limit,
            db,
            clock,
        }
    }

    /// Run one command and return what should be printed.
    pub async fn run_command(&self, cmd: Command) -> Result<String> {
        match cmd {
            Command::Run => Ok(String::new()),
            Command::Balance { user_id } => {
                let balance = self.ledger.get_balance(user_id).await?;
                Ok(format!("user {user_id}: {balance} points"))
            }
            Command::Ledger { user_id, limit } => self.show_ledger(user_id, limit).await,
            Command::Grant { user_id, delta } => {
                let receipt = self
                    .ledger
                    .add_points(PointsEntry::new(user_id, delta, LedgerReason::Adjustment))
                    .await?;
                Ok(format!(
                    "entry {}: user {user_id} {delta:+}, balance {}",
                    receipt.entry_id, receipt.balance
                ))
            }
            Command::Reconcile { user_id } => {
                let rec = self.ledger.reconcile(user_id).await?;
                let mut out = serde_json::to_string_pretty(&rec)?;
                if !rec.is_consistent() {
                    tracing::error!(
                        user_id,
                        balance = rec.balance,
                        ledger_sum = rec.ledger_sum,
                        "balance does not match ledger"
                    );
                    out.push_str("\nINCONSISTENT");
                }
                Ok(out)
            }
            Command::Invest {
                user_id,
                comment_id,
                amount,
            } => {
                let summary = self.engine.invest(user_id, comment_id, amount).await?;
                Ok(serde_json::to_string_pretty(&summary)?)
            }
            Command::Settle { investment_id } => {
                let summary = self.engine.settle(investment_id).await?;
                Ok(serde_json::to_string_pretty(&summary)?)
            }
            Command::SettleDue => {
                let report =
                    crate::jobs::run_settlement_once(&self.db, &self.engine, self.batch_limit)
                        .await?;
                Ok(serde_json::to_string_pretty(&report)?)
            }
            Command::Comment {
                hub_id,
                user_id,
                parent_id,
                content,
            } => self.comment(hub_id, user_id, parent_id, &content).await,
            cmd => {
                let session = self.open_hub();
                let out = Self::run_hub_command(&session.hub, cmd).await;
                session.close().await?;
                out
            }
        }
    }

    fn open_hub(&self) -> HubSession {
        let bus = EventBus::new(16);
        let mut subscribers = vec![spawn_logging_subscriber(&bus)];
        let awarder = StreakAwarder::new(self.db.clone(), self.streak);
        if awarder.enabled() {
            subscribers.push(spawn_streak_subscriber(&bus, awarder));
        }
        HubSession {
            hub: HubStore::new(self.db.clone(), self.clock.clone(), bus),
            subscribers,
        }
    }

    async fn run_hub_command(hub: &HubStore, cmd: Command) -> Result<String> {
        match cmd {
            Command::Vote {
                post_id,
                user_id,
                vote,
            } => {
                let score = hub.vote(post_id, user_id, vote).await?;
                Ok(format!("post {post_id}: score {score}"))
            }
            Command::View { post_id } => {
                let views = hub.record_view(post_id).await?;
                Ok(format!("post {post_id}: {views} views"))
            }
            Command::Moderate { post_id, status } => {
                hub.set_moderation_status(post_id, status).await?;
                Ok(format!("post {post_id}: {status}"))
            }
            Command::Link {
                post_id,
                item_type,
                item_id,
            } => {
                let link_id = hub.add_link(post_id, &item_type, item_id).await?;
                Ok(format!("link {link_id}: post {post_id} -> {item_type} {item_id}"))
            }
            Command::Hubs { org_id } => {
                Ok(serde_json::to_string_pretty(&hub.hubs_by_org(org_id).await?)?)
            }
            Command::Posts { hub_id } => {
                Ok(serde_json::to_string_pretty(&hub.posts_by_hub(hub_id).await?)?)
            }
            Command::Thread { post_id } => {
                Ok(serde_json::to_string_pretty(&hub.thread(post_id).await?)?)
            }
            other => anyhow::bail!("not a hub command: {other:?}"),
        }
    }

    async fn show_ledger(&self, user_id: i64, limit: u32) -> Result<String> {
        let entries = self.ledger.history(user_id, limit).await?;
        let mut out = format!("Ledger for user {user_id} (newest first):");
        for e in entries {
            let created_at = e
                .created_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_default();
            write!(
                out,
                "\n{id:>6}  {created_at}  {delta:>+6}  {reason}",
                id = e.id,
                delta = e.delta,
                reason = e.reason,
            )?;
            if let Some(c) = e.ref_comment_id {
                write!(out, "  comment={c}")?;
            }
            if let Some(i) = e.investment_id {
                write!(out, "  investment={i}")?;
            }
            if let Some(day) = &e.day_key {
                write!(out, "  day={day}")?;
            }
        }
        Ok(out)
    }

    /// Post a reply, then wait for the streak award before returning.
    async fn comment(
        &self,
        hub_id: i64,
        user_id: i64,
        parent_id: i64,
        content: &str,
    ) -> Result<String> {
        let session = self.open_hub();
        let posted = session
            .hub
            .create_post(NewPost::reply(hub_id, user_id, parent_id, content))
            .await;
        session.close().await?;
        let comment_id = posted?;

        let balance = self.ledger.get_balance(user_id).await?;
        Ok(format!(
            "comment {comment_id} posted under {parent_id}; user {user_id} balance {balance}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::clock::FixedClock;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("hubd".to_string())
            .chain(list.iter().map(|s| s.to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults_to_run() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
        assert_eq!(parse_args(args(&["run"])).unwrap(), Command::Run);
    }

    #[test]
    fn test_parse_invest_and_ledger() {
        assert_eq!(
            parse_args(args(&["invest", "4", "11", "25"])).unwrap(),
            Command::Invest {
                user_id: 4,
                comment_id: 11,
                amount: 25
            }
        );
        assert_eq!(
            parse_args(args(&["ledger", "4"])).unwrap(),
            Command::Ledger {
                user_id: 4,
                limit: DEFAULT_LEDGER_LIMIT
            }
        );
        assert_eq!(
            parse_args(args(&["grant", "2", "-15"])).unwrap(),
            Command::Grant {
                user_id: 2,
                delta: -15
            }
        );
    }

    #[test]
    fn test_parse_comment_joins_content() {
        assert_eq!(
            parse_args(args(&["comment", "1", "2", "3", "hello", "there"])).unwrap(),
            Command::Comment {
                hub_id: 1,
                user_id: 2,
                parent_id: 3,
                content: "hello there".to_string()
            }
        );
        assert!(parse_args(args(&["comment", "1", "2", "3"])).is_err());
    }

    #[test]
    fn test_parse_hub_commands() {
        assert_eq!(
            parse_args(args(&["vote", "7", "2", "down"])).unwrap(),
            Command::Vote {
                post_id: 7,
                user_id: 2,
                vote: VoteType::Down
            }
        );
        assert_eq!(
            parse_args(args(&["moderate", "7", "removed"])).unwrap(),
            Command::Moderate {
                post_id: 7,
                status: ModerationStatus::Removed
            }
        );
        assert_eq!(
            parse_args(args(&["link", "7", "task", "40"])).unwrap(),
            Command::Link {
                post_id: 7,
                item_type: "task".to_string(),
                item_id: 40
            }
        );
        let err = parse_args(args(&["moderate", "7", "hidden"])).unwrap_err();
        assert!(err.starts_with("unknown moderation status value"), "{err}");
        assert!(parse_args(args(&["vote", "7", "2"])).unwrap_err().contains("usage"));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_args(args(&["invest", "4", "x", "25"])).unwrap_err();
        assert!(err.starts_with("comment must be an integer"));
        assert!(parse_args(args(&["settle"])).unwrap_err().contains("usage"));
        assert_eq!(
            parse_args(args(&["frobnicate"])).unwrap_err(),
            "unknown command: frobnicate"
        );
    }

    #[tokio::test]
    async fn test_operator_flow_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");
        let config = Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let db = AsyncDb::open(path.to_str().unwrap(), config.database.tables.clone())
            .await
            .unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 8, 3, 15, 0, 0).unwrap(),
        ));

        let hub = HubStore::new(db.clone(), clock.clone(), EventBus::default());
        let asker = hub.create_user("asker@hub.io").await.unwrap();
        let talker = hub.create_user("talker@hub.io").await.unwrap();
        let investor = hub.create_user("investor@hub.io").await.unwrap();
        let hub_id = hub.create_hub(1, "rust", None).await.unwrap();
        let root = hub
            .create_post(NewPost::thread(hub_id, asker, "lifetimes", "help"))
            .await
            .unwrap();

        let app = App::new(db, clock, &config);

        let out = app
            .run_command(Command::Comment {
                hub_id,
                user_id: talker,
                parent_id: root,
                content: "use 'a".to_string(),
            })
            .await
            .unwrap();
        assert!(out.ends_with(&format!("user {talker} balance 5")), "{out}");

        let out = app
            .run_command(Command::Grant {
                user_id: investor,
                delta: 50,
            })
            .await
            .unwrap();
        assert!(out.ends_with("balance 50"));

        let out = app
            .run_command(Command::Invest {
                user_id: investor,
                comment_id: root + 1,
                amount: 20,
            })
            .await
            .unwrap();
        let summary: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(summary["balance_after"], 30);
        assert_eq!(summary["status"], "pending");

        let out = app
            .run_command(Command::Settle {
                investment_id: summary["investment_id"].as_i64().unwrap(),
            })
            .await
            .unwrap();
        let settled: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(settled["status"], "won");
        assert_eq!(settled["payout_amount"], 40);

        let out = app
            .run_command(Command::Balance { user_id: investor })
            .await
            .unwrap();
        assert_eq!(out, format!("user {investor}: 70 points"));

        let out = app
            .run_command(Command::Ledger {
                user_id: investor,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(out.lines().count(), 4);
        assert!(out.contains("invest_payout"));

        let out = app
            .run_command(Command::Reconcile { user_id: investor })
            .await
            .unwrap();
        assert!(!out.contains("INCONSISTENT"));

        let err = app
            .run_command(Command::Invest {
                user_id: investor,
                comment_id: root,
                amount: 20,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("thread root"));
    }

    #[test]
    fn test_hub_commands_feed_event_subscribers() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        // Current-thread, so the spawned subscribers record into the local recorder.
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let config =
                    Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
                let db = AsyncDb::open_memory().await.unwrap();
                let clock = Arc::new(FixedClock::new(
                    Utc.with_ymd_and_hms(2026, 8, 4, 9, 0, 0).unwrap(),
                ));
                let setup = HubStore::new(db.clone(), clock.clone(), EventBus::default());
                let asker = setup.create_user("asker@hub.io").await.unwrap();
                let talker = setup.create_user("talker@hub.io").await.unwrap();
                let hub_id = setup.create_hub(1, "rust", None).await.unwrap();
                let root = setup
                    .create_post(NewPost::thread(hub_id, asker, "traits", "dyn or impl?"))
                    .await
                    .unwrap();
                let app = App::new(db, clock, &config);

                let out = app
                    .run_command(Command::Comment {
                        hub_id,
                        user_id: talker,
                        parent_id: root,
                        content: "impl when you can".to_string(),
                    })
                    .await
                    .unwrap();
                assert!(out.ends_with(&format!("user {talker} balance 5")), "{out}");
                let reply = root + 1;

                let vote = |vote| Command::Vote {
                    post_id: reply,
                    user_id: asker,
                    vote,
                };
                let out = app.run_command(vote(VoteType::Up)).await.unwrap();
                assert_eq!(out, format!("post {reply}: score 1"));
                let out = app.run_command(vote(VoteType::Down)).await.unwrap();
                assert_eq!(out, format!("post {reply}: score 1"));

                let out = app
                    .run_command(Command::Moderate {
                        post_id: reply,
                        status: ModerationStatus::Flagged,
                    })
                    .await
                    .unwrap();
                assert_eq!(out, format!("post {reply}: flagged"));

                let out = app
                    .run_command(Command::Thread { post_id: root })
                    .await
                    .unwrap();
                let thread: serde_json::Value = serde_json::from_str(&out).unwrap();
                assert_eq!(thread["comments"].as_array().unwrap().len(), 1);
                assert_eq!(thread["comments"][0]["moderation_status"], "flagged");
                assert!(thread["standings"]["top_by_score"].is_null());

                let out = app.run_command(Command::Hubs { org_id: 1 }).await.unwrap();
                let hubs: serde_json::Value = serde_json::from_str(&out).unwrap();
                assert_eq!(hubs[0]["name"], "rust");
            });
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("hub_events_total{type=\"comment_posted\"} 1"),
            "got:\n{rendered}"
        );
        assert!(rendered.contains("hub_events_total{type=\"moderation_changed\"} 1"));
        assert!(rendered.contains("hub_points_awarded_total{reason=\"comment_streak\"} 5"));
    }
}
