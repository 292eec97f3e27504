//! Interaction notifier
//!
//! While an invocation is running the agent may stop and wait for the user:
//! either a permission decision or a form of one or more questions. The
//! notifier polls the remote service for such requests, surfaces each one
//! once as a message with inline buttons, and drives the question forms one
//! question at a time.
//!
//! Seen-id sets grow for the life of the process. Request ids are unique per
//! server lifetime, so entries are never reused, but nothing prunes them.

use crate::callback::{CallbackData, PermissionAction, MAX_CALLBACK_BYTES};
use crate::error::{RelayError, Result};
use crate::registry::ChatSession;
use crate::remote::{
    PendingPermission, PendingQuestionRequest, PermissionReply, QuestionInfo, SessionService,
};
use crate::render::escape_html;
use crate::transport::{ChatTransport, InlineKeyboardButton, InlineKeyboardMarkup, SendOptions};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// Longest option label shown on a button face
const MAX_BUTTON_LABEL_CHARS: usize = 40;

/// Answer accumulator for one question request
#[derive(Debug, Clone)]
struct QuestionState {
    questions: Vec<QuestionInfo>,
    index: usize,
    answers: Vec<Vec<String>>,
    total: usize,
}

enum Step {
    Unknown,
    Stale,
    Invalid,
    Next(usize, QuestionInfo),
    Submit(Vec<Vec<String>>),
}

pub struct InteractionNotifier {
    service: Arc<dyn SessionService>,
    transport: Arc<dyn ChatTransport>,
    seen_permissions: DashSet<String>,
    seen_questions: DashSet<String>,
    questions: DashMap<String, QuestionState>,
}

impl InteractionNotifier {
    pub fn new(service: Arc<dyn SessionService>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            service,
            transport,
            seen_permissions: DashSet::new(),
            seen_questions: DashSet::new(),
            questions: DashMap::new(),
        }
    }

    /// Question forms still being answered
    pub fn pending_question_count(&self) -> usize {
        self.questions.len()
    }

    /// Requests surfaced so far
    pub fn seen_count(&self) -> usize {
        self.seen_permissions.len() + self.seen_questions.len()
    }

    /// Surface new requests for the chat's bound session
    ///
    /// Returns how many prompts were sent. Listing failures are logged and
    /// skipped.
    pub async fn poll_and_notify(&self, chat: &ChatSession) -> usize {
        let Some(session_id) = chat.remote_session_id.as_deref() else {
            return 0;
        };
        let dir = chat.working_directory.as_str();
        let mut surfaced = 0;

        let (permissions, questions) = futures::join!(
            self.service.list_permissions(dir),
            self.service.list_questions(dir)
        );

        match permissions {
            Ok(permissions) => {
                for permission in permissions.iter().filter(|p| p.session_id == session_id) {
                    if !self.seen_permissions.insert(permission.id.clone()) {
                        continue;
                    }
                    if self.notify_permission(chat.chat_id, permission).await {
                        surfaced += 1;
                    } else {
                        self.seen_permissions.remove(&permission.id);
                    }
                }
            }
            Err(e) => tracing::warn!(chat_id = chat.chat_id, "Permission poll failed: {}", e),
        }

        match questions {
            Ok(requests) => {
                for request in requests.iter().filter(|q| q.session_id == session_id) {
                    if !self.seen_questions.insert(request.id.clone()) {
                        continue;
                    }
                    if self.notify_question(chat.chat_id, request).await {
                        surfaced += 1;
                    } else {
                        self.seen_questions.remove(&request.id);
                        self.questions.remove(&request.id);
                    }
                }
            }
            Err(e) => tracing::warn!(chat_id = chat.chat_id, "Question poll failed: {}", e),
        }

        surfaced
    }

    async fn notify_permission(&self, chat_id: i64, permission: &PendingPermission) -> bool {
        let (text, keyboard) = permission_prompt(permission);
        match self
            .transport
            .send_message(chat_id, &text, &SendOptions::html().with_keyboard(keyboard))
            .await
        {
            Ok(_) => {
                tracing::info!(chat_id, request_id = %permission.id, permission = %permission.permission, "Permission requested");
                true
            }
            Err(e) => {
                tracing::warn!(chat_id, request_id = %permission.id, "Failed to send permission prompt: {}", e);
                false
            }
        }
    }

    async fn notify_question(&self, chat_id: i64, request: &PendingQuestionRequest) -> bool {
        let Some(first) = request.questions.first() else {
            tracing::warn!(chat_id, request_id = %request.id, "Question request has no questions");
            return true;
        };
        let total = request.questions.len();
        self.questions.insert(
            request.id.clone(),
            QuestionState {
                questions: request.questions.clone(),
                index: 0,
                answers: vec![Vec::new(); total],
                total,
            },
        );

        match self.send_question(chat_id, &request.id, 0, total, first).await {
            Ok(()) => {
                tracing::info!(chat_id, request_id = %request.id, total, "Question requested");
                true
            }
            Err(e) => {
                tracing::warn!(chat_id, request_id = %request.id, "Failed to send question prompt: {}", e);
                false
            }
        }
    }

    async fn send_question(
        &self,
        chat_id: i64,
        request_id: &str,
        index: usize,
        total: usize,
        question: &QuestionInfo,
    ) -> Result<()> {
        let (text, keyboard) = question_prompt(request_id, index, total, question);
        self.transport
            .send_message(chat_id, &text, &SendOptions::html().with_keyboard(keyboard))
            .await?;
        Ok(())
    }

    async fn say(&self, chat_id: i64, text: &str) -> Result<()> {
        self.transport
            .send_message(chat_id, text, &SendOptions::default())
            .await?;
        Ok(())
    }

    /// Store one answer under the map lock and decide what happens next
    fn record_answer(&self, request_id: &str, question: usize, option: usize) -> Step {
        let Some(mut state) = self.questions.get_mut(request_id) else {
            return Step::Unknown;
        };
        if state.index != question || question >= state.total {
            return Step::Stale;
        }
        let Some(label) = state.questions[question]
            .options
            .get(option)
            .map(|o| o.label.clone())
        else {
            return Step::Invalid;
        };

        state.answers[question] = vec![label];
        if question + 1 < state.total {
            state.index += 1;
            Step::Next(state.total, state.questions[question + 1].clone())
        } else {
            // Parked past the end while the reply is in flight
            state.index = state.total;
            Step::Submit(state.answers.clone())
        }
    }

    /// Record option `option` for question `question` of a request
    ///
    /// The last answer submits the whole form in one reply.
    pub async fn answer_question(
        &self,
        chat: &ChatSession,
        request_id: &str,
        question: usize,
        option: usize,
    ) -> Result<()> {
        match self.record_answer(request_id, question, option) {
            Step::Unknown => {
                self.say(chat.chat_id, "⚠️ This question is no longer pending.")
                    .await
            }
            Step::Stale => {
                self.say(chat.chat_id, "⚠️ That answer is for a question already handled.")
                    .await
            }
            Step::Invalid => {
                let err = RelayError::InvalidSelection(format!("option {}", option + 1));
                self.say(chat.chat_id, &err.user_message("Question answer"))
                    .await
            }
            Step::Next(total, next) => {
                self.send_question(chat.chat_id, request_id, question + 1, total, &next)
                    .await
            }
            Step::Submit(answers) => {
                match self
                    .service
                    .reply_question(&chat.working_directory, request_id, &answers)
                    .await
                {
                    Ok(()) => {
                        self.questions.remove(request_id);
                        tracing::info!(chat_id = chat.chat_id, request_id, "Question answered");
                        self.say(chat.chat_id, &confirmation(&answers)).await
                    }
                    Err(e) => {
                        tracing::error!(chat_id = chat.chat_id, request_id, "Question reply failed: {}", e);
                        if let Some(mut state) = self.questions.get_mut(request_id) {
                            state.index = question;
                        }
                        self.say(chat.chat_id, &e.user_message("Question reply"))
                            .await
                    }
                }
            }
        }
    }

    /// Dismiss a whole question form; nothing answered so far is sent
    pub async fn reject_question(&self, chat: &ChatSession, request_id: &str) -> Result<()> {
        self.questions.remove(request_id);
        match self
            .service
            .reject_question(&chat.working_directory, request_id)
            .await
        {
            Ok(()) => {
                tracing::info!(chat_id = chat.chat_id, request_id, "Question rejected");
                self.say(chat.chat_id, "🚫 Question dismissed.").await
            }
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, request_id, "Question reject failed: {}", e);
                self.say(chat.chat_id, &e.user_message("Question reject"))
                    .await
            }
        }
    }

    /// Forward a permission decision
    pub async fn reply_permission(
        &self,
        chat: &ChatSession,
        request_id: &str,
        reply: PermissionReply,
    ) -> Result<()> {
        match self
            .service
            .reply_permission(&chat.working_directory, request_id, reply, None)
            .await
        {
            Ok(()) => {
                tracing::info!(chat_id = chat.chat_id, request_id, reply = reply.as_str(), "Permission replied");
                let text = match reply {
                    PermissionReply::Once => "✅ Allowed once.",
                    PermissionReply::Always => "✅ Always allowed.",
                    PermissionReply::Reject => "🚫 Permission rejected.",
                };
                self.say(chat.chat_id, text).await
            }
            Err(e) => {
                tracing::error!(chat_id = chat.chat_id, request_id, "Permission reply failed: {}", e);
                self.say(chat.chat_id, &e.user_message("Permission reply"))
                    .await
            }
        }
    }
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_BUTTON_LABEL_CHARS {
        return label.to_string();
    }
    let mut cut: String = label.chars().take(MAX_BUTTON_LABEL_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// Button for `data`, or `None` if the payload would be rejected
fn button(text: impl Into<String>, data: CallbackData) -> Option<InlineKeyboardButton> {
    let encoded = data.encode();
    if encoded.len() > MAX_CALLBACK_BYTES {
        tracing::warn!(data = %encoded, "Callback payload too long; button dropped");
        return None;
    }
    Some(InlineKeyboardButton::callback(text, encoded))
}

fn permission_prompt(permission: &PendingPermission) -> (String, InlineKeyboardMarkup) {
    let mut text = format!(
        "🔐 <b>Permission required</b>\n\n<b>{}</b>",
        escape_html(&permission.permission)
    );
    if !permission.patterns.is_empty() {
        text.push('\n');
        for pattern in &permission.patterns {
            text.push_str(&format!("\n• <code>{}</code>", escape_html(pattern)));
        }
    }

    let id = &permission.id;
    let perm = |action, label: &str| {
        button(
            label,
            CallbackData::Permission {
                action,
                request_id: id.clone(),
            },
        )
    };
    let rows = vec![
        [
            perm(PermissionAction::Reply(PermissionReply::Once), "✅ Allow once"),
            perm(PermissionAction::Reply(PermissionReply::Always), "♾️ Always"),
        ],
        [
            perm(PermissionAction::Reply(PermissionReply::Reject), "❌ Reject"),
            perm(PermissionAction::Retry, "🔁 Retry"),
        ],
    ]
    .into_iter()
    .map(|row| row.into_iter().flatten().collect::<Vec<_>>())
    .filter(|row| !row.is_empty())
    .collect();

    (text, InlineKeyboardMarkup::new(rows))
}

fn question_prompt(
    request_id: &str,
    index: usize,
    total: usize,
    question: &QuestionInfo,
) -> (String, InlineKeyboardMarkup) {
    let mut text = String::from("❓ ");
    if !question.header.is_empty() {
        text.push_str(&format!("<b>{}</b> ", escape_html(&question.header)));
    }
    text.push_str(&format!("({}/{})\n\n{}", index + 1, total, escape_html(&question.question)));

    let has_descriptions = question.options.iter().any(|o| o.description.is_some());
    if has_descriptions {
        text.push('\n');
        for (i, option) in question.options.iter().enumerate() {
            text.push_str(&format!("\n{}. <b>{}</b>", i + 1, escape_html(&option.label)));
            if let Some(description) = &option.description {
                text.push_str(&format!(": {}", escape_html(description)));
            }
        }
    }

    let mut rows: Vec<Vec<InlineKeyboardButton>> = question
        .options
        .iter()
        .enumerate()
        .filter_map(|(o, option)| {
            button(
                truncate_label(&option.label),
                CallbackData::QuestionAnswer {
                    request_id: request_id.to_string(),
                    question: index,
                    option: o,
                },
            )
        })
        .map(|b| vec![b])
        .collect();
    if let Some(dismiss) = button(
        "✖️ Dismiss",
        CallbackData::QuestionReject {
            request_id: request_id.to_string(),
        },
    ) {
        rows.push(vec![dismiss]);
    }

    (text, InlineKeyboardMarkup::new(rows))
}

fn confirmation(answers: &[Vec<String>]) -> String {
    let picked: Vec<String> = answers.iter().map(|a| a.join(", ")).collect();
    format!("✅ Answer sent: {}", picked.join(" / "))
}
