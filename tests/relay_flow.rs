//! End-to-end relay flows against the in-memory service and transport

use a3s_relay::remote::{
    MemorySessionService, PendingPermission, PendingQuestionRequest, PermissionReply,
    QuestionInfo, QuestionOption, RemoteCall,
};
use a3s_relay::transport::{MemoryTransport, Update};
use a3s_relay::{Bot, PollerConfig, RelayConfig, UpdateHandler, UpdatePoller};
use std::sync::Arc;
use std::time::Duration;

const CHAT: i64 = 7;
const USER: i64 = 500;

struct Relay {
    remote: Arc<MemorySessionService>,
    transport: Arc<MemoryTransport>,
    bot: Bot,
}

fn relay() -> Relay {
    let mut config = RelayConfig::default();
    config.telegram.bot_token = "123:abc".into();
    config.telegram.allowed_users = vec![USER.to_string()];
    config.agent.working_directory = "/srv/app".into();
    config.agent.session_prefix = "tg".into();
    config.notifier.poll_interval_ms = 10;

    let remote = Arc::new(MemorySessionService::new());
    let transport = Arc::new(MemoryTransport::new());
    let bot = Bot::new(config, remote.clone(), transport.clone()).with_delete_pause(Duration::ZERO);
    Relay {
        remote,
        transport,
        bot,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

impl Relay {
    async fn send(&self, update: Update) {
        self.bot.handle_update(update).await.unwrap();
    }

    fn has_text(&self, needle: &str) -> bool {
        self.transport
            .texts(CHAT)
            .iter()
            .any(|t| t.contains(needle))
    }
}

#[tokio::test]
async fn test_poller_drives_conversation() {
    let r = relay();
    r.remote.set_reply("Refactored.\n\n```rust\nfn main() {}\n```");
    r.transport.push_updates(vec![
        Update::text(10, CHAT, USER, "/start"),
        Update::text(11, CHAT, USER, "refactor this function"),
    ]);

    let poller = Arc::new(UpdatePoller::new(
        r.transport.clone(),
        Arc::new(r.bot.clone()),
        PollerConfig {
            wait: Duration::from_millis(10),
            backoff: Duration::from_millis(10),
            grace: Duration::from_millis(10),
        },
    ));
    let handle = poller.spawn();
    wait_until("both updates", || poller.last_update_id() == 11).await;
    assert!(r.bot.wait_idle(Duration::from_secs(5)).await);
    poller.stop().await;
    handle.await.unwrap();

    let texts = r.transport.texts(CHAT);
    assert!(texts[0].starts_with("🤖 <b>a3s-relay</b>"));
    assert_eq!(
        texts.last().unwrap(),
        "<pre><code class=\"language-rust\">fn main() {}</code></pre>"
    );
    assert!(texts.iter().any(|t| t.starts_with("Refactored.")));
    assert_eq!(r.transport.webhook_deletes(), 1);
}

#[tokio::test]
async fn test_long_reply_is_split_under_budget() {
    let r = relay();
    let reply = "a".repeat(9000);
    r.remote.set_reply(reply.clone());
    r.send(Update::text(1, CHAT, USER, "write a lot")).await;
    assert!(r.bot.wait_idle(Duration::from_secs(5)).await);

    // First message is the status line
    let texts = r.transport.texts(CHAT);
    let chunks = &texts[1..];
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.len() <= 4000));
    assert_eq!(chunks.concat(), reply);
}

#[tokio::test]
async fn test_question_form_round_trip() {
    let r = relay();
    r.remote.insert_session("ses_1", "tg-7", None, 1_700_000_000_000);
    r.remote.set_prompt_delay(Duration::from_millis(400));
    r.remote.push_question(PendingQuestionRequest {
        id: "que_1".into(),
        session_id: "ses_1".into(),
        questions: vec![
            QuestionInfo {
                header: "Database".into(),
                question: "Which engine?".into(),
                options: vec![
                    QuestionOption {
                        label: "Postgres".into(),
                        description: None,
                    },
                    QuestionOption {
                        label: "SQLite".into(),
                        description: None,
                    },
                ],
                multiple: false,
            },
            QuestionInfo {
                header: "Migrations".into(),
                question: "Run them now?".into(),
                options: vec![
                    QuestionOption {
                        label: "Yes".into(),
                        description: None,
                    },
                    QuestionOption {
                        label: "No".into(),
                        description: None,
                    },
                ],
                multiple: false,
            },
        ],
        tool: None,
    });

    r.send(Update::text(1, CHAT, USER, "set up storage")).await;
    wait_until("first question", || r.has_text("(1/2)")).await;

    let prompt = r.transport.last(CHAT).unwrap();
    let markup = prompt.options.reply_markup.unwrap();
    assert!(markup.callback_data().contains(&"q:ans:que_1:0:1"));

    r.send(Update::callback(2, CHAT, USER, "q:ans:que_1:0:1")).await;
    assert!(r.has_text("(2/2)"));
    r.send(Update::callback(3, CHAT, USER, "q:ans:que_1:1:0")).await;
    assert!(r.has_text("✅ Answer sent: SQLite / Yes"));

    assert!(r.bot.wait_idle(Duration::from_secs(5)).await);
    let replies: Vec<_> = r
        .remote
        .calls()
        .into_iter()
        .filter(|c| matches!(c, RemoteCall::ReplyQuestion { .. }))
        .collect();
    assert_eq!(
        replies,
        vec![RemoteCall::ReplyQuestion {
            request_id: "que_1".into(),
            answers: vec![vec!["SQLite".into()], vec!["Yes".into()]],
        }]
    );
    // Surfaced once even though the notifier kept polling
    assert_eq!(
        r.transport
            .texts(CHAT)
            .iter()
            .filter(|t| t.contains("(1/2)"))
            .count(),
        1
    );
    assert_eq!(r.bot.notifier().pending_question_count(), 0);
}

#[tokio::test]
async fn test_permission_prompt_and_reply() {
    let r = relay();
    r.remote.insert_session("ses_1", "tg-7", None, 1_700_000_000_000);
    r.remote.set_prompt_delay(Duration::from_millis(400));
    r.remote.push_permission(PendingPermission {
        id: "per_1".into(),
        session_id: "ses_1".into(),
        permission: "bash".into(),
        patterns: vec!["cargo publish".into()],
        always: vec![],
        metadata: serde_json::Value::Null,
        tool: None,
    });

    r.send(Update::text(1, CHAT, USER, "ship it")).await;
    wait_until("permission prompt", || r.has_text("Permission required")).await;
    assert!(r.has_text("<code>cargo publish</code>"));

    r.send(Update::callback(2, CHAT, USER, "perm:once:per_1")).await;
    assert!(r.has_text("✅ Allowed once."));
    assert!(r.remote.calls().contains(&RemoteCall::ReplyPermission {
        request_id: "per_1".into(),
        reply: PermissionReply::Once,
    }));
    assert!(r.bot.wait_idle(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_reset_then_sweep() {
    let r = relay();
    r.remote.insert_session("ses_root", "tg-7", None, 1_700_000_000_000);
    r.remote.insert_session("ses_a", "child a", Some("ses_root"), 1_700_000_000_001);
    r.remote.insert_session("ses_b", "child b", Some("ses_a"), 1_700_000_000_002);

    r.send(Update::text(1, CHAT, USER, "/reset")).await;
    assert_eq!(
        r.remote.deletes(),
        vec!["ses_b".to_string(), "ses_a".to_string(), "ses_root".to_string()]
    );
    assert!(r.has_text("Deleted sessions: 3"));

    assert_eq!(r.bot.registry().len(), 1);
    assert_eq!(r.bot.registry().sweep_idle(Duration::from_secs(3600)), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(r.bot.registry().sweep_idle(Duration::ZERO), 1);
    assert!(r.bot.registry().is_empty());
}
