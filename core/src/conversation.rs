//! Shared conversation substrate.
//!
//! All personas collaborate through one append-only, typed-message history.
//! Messages carry a `kind` tag; unknown kinds are preserved as raw values so
//! a newer writer's messages survive a round-trip through an older reader.
//! The conversation is a single-writer entity: mutation happens only through
//! [`Conversation::append`], reads are snapshots.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ConversationError, ConversationResult};
use crate::phase::Phase;

/// A recorded decision inside a persona-work message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_offs: Option<String>,
}

/// A question routed to another persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "for")]
    pub for_persona: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Declared upstream/downstream relationships of a work item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyNote {
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub provides_for: Vec<String>,
}

/// Structured summary of what a persona produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonaWork {
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub files_created: Vec<PathBuf>,
    #[serde(default)]
    pub deliverables: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub dependencies: DependencyNote,
}

/// Sub-type of a discussion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionKind {
    Discussion,
    Question,
    Proposal,
    Concern,
}

impl Default for DiscussionKind {
    fn default() -> Self {
        DiscussionKind::Discussion
    }
}

/// Free-form group-discussion contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionNote {
    pub content: String,
    #[serde(default)]
    pub message_type: DiscussionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Severity of a system notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

impl Default for SystemLevel {
    fn default() -> Self {
        SystemLevel::Info
    }
}

/// Orchestrator-emitted notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemNote {
    pub content: String,
    #[serde(default)]
    pub level: SystemLevel,
}

/// Reply to a previously asked question, linked by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: Uuid,
    pub answer_text: String,
    pub author: String,
}

/// Message payload, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    PersonaWork(PersonaWork),
    Discussion(DiscussionNote),
    System(SystemNote),
    Answer(Answer),
    /// Any kind this version does not understand, kept verbatim.
    Unknown(serde_json::Value),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::PersonaWork(_) => MessageKind::PersonaWork,
            MessagePayload::Discussion(_) => MessageKind::Discussion,
            MessagePayload::System(_) => MessageKind::System,
            MessagePayload::Answer(_) => MessageKind::Answer,
            MessagePayload::Unknown(_) => MessageKind::Unknown,
        }
    }
}

/// Message kind discriminant, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    PersonaWork,
    Discussion,
    System,
    Answer,
    Unknown,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TaggedPayloadRef<'a> {
    PersonaWork(&'a PersonaWork),
    Discussion(&'a DiscussionNote),
    System(&'a SystemNote),
    Answer(&'a Answer),
}

impl Serialize for MessagePayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessagePayload::PersonaWork(w) => TaggedPayloadRef::PersonaWork(w).serialize(serializer),
            MessagePayload::Discussion(d) => TaggedPayloadRef::Discussion(d).serialize(serializer),
            MessagePayload::System(n) => TaggedPayloadRef::System(n).serialize(serializer),
            MessagePayload::Answer(a) => TaggedPayloadRef::Answer(a).serialize(serializer),
            MessagePayload::Unknown(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MessagePayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        let parsed = match kind {
            "persona_work" => serde_json::from_value(value.clone()).map(MessagePayload::PersonaWork),
            "discussion" => serde_json::from_value(value.clone()).map(MessagePayload::Discussion),
            "system" => serde_json::from_value(value.clone()).map(MessagePayload::System),
            "answer" => serde_json::from_value(value.clone()).map(MessagePayload::Answer),
            _ => return Ok(MessagePayload::Unknown(value)),
        };
        // A recognized kind with fields we cannot parse is still preserved.
        Ok(parsed.unwrap_or(MessagePayload::Unknown(value)))
    }
}

/// One entry in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    /// Persona id, or `"system"`.
    pub source: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(source: &str, phase: Phase, payload: MessagePayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            phase,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn system(phase: Phase, level: SystemLevel, content: &str) -> Self {
        Self::new(
            "system",
            phase,
            MessagePayload::System(SystemNote {
                content: content.to_string(),
                level,
            }),
        )
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

/// Filter for [`Conversation::filter`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub source: Option<String>,
    pub phase: Option<Phase>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Aggregate statistics over the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStats {
    pub messages: usize,
    pub decisions: usize,
    pub questions: usize,
    pub answers: usize,
    pub concerns: usize,
}

/// On-disk form of a conversation.
#[derive(Debug, Serialize, Deserialize)]
struct ConversationDump {
    session_id: Uuid,
    messages: Vec<Message>,
}

struct Inner {
    messages: Vec<Message>,
    ids: HashSet<Uuid>,
}

/// Append-only conversation history with an optional on-disk mirror.
pub struct Conversation {
    session_id: Uuid,
    inner: RwLock<Inner>,
    mirror: Option<PathBuf>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            inner: RwLock::new(Inner {
                messages: Vec::new(),
                ids: HashSet::new(),
            }),
            mirror: None,
        }
    }

    /// Mirror every append to `path` as a single JSON document.
    pub fn with_mirror(mut self, path: &Path) -> Self {
        self.mirror = Some(path.to_path_buf());
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }

    /// Append a message and return its id.
    ///
    /// Ids must be globally unique; `created_at` is clamped so ordering by
    /// timestamp stays a total order even across clock jitter.
    pub fn append(&self, mut message: Message) -> ConversationResult<Uuid> {
        let mut inner = self.inner.write();
        if !inner.ids.insert(message.id) {
            return Err(ConversationError::DuplicateId(message.id));
        }
        if let Some(last) = inner.messages.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        let id = message.id;
        inner.messages.push(message);

        if let Some(path) = &self.mirror {
            let dump = ConversationDump {
                session_id: self.session_id,
                messages: inner.messages.clone(),
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
        }
        Ok(id)
    }

    /// Snapshot of all messages, in append order.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// Messages matching the query, in append order.
    pub fn filter(&self, query: &MessageQuery) -> Vec<Message> {
        let inner = self.inner.read();
        let mut matched: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| {
                query.source.as_deref().map_or(true, |s| m.source == s)
                    && query.phase.map_or(true, |p| m.phase == p)
                    && query.kind.map_or(true, |k| m.kind() == k)
                    && query.since.map_or(true, |t| m.created_at >= t)
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            if matched.len() > limit {
                matched.drain(..matched.len() - limit);
            }
        }
        matched
    }

    /// Build the persona-focused context used to prompt `persona_id`.
    ///
    /// Contains: recent persona-work from other personas (full
    /// serialization), open questions addressed to the persona, answers to
    /// the persona's own questions, and trailing system notices.
    pub fn context_for(&self, persona_id: &str, max_messages: Option<usize>) -> String {
        let max = max_messages.unwrap_or(10);
        let inner = self.inner.read();
        let mut sections = Vec::new();

        let work: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| m.source != persona_id)
            .filter(|m| matches!(m.payload, MessagePayload::PersonaWork(_)))
            .collect();
        if !work.is_empty() {
            let mut out = String::from("## Recent work from other personas\n");
            for message in work.iter().rev().take(max).rev() {
                if let MessagePayload::PersonaWork(w) = &message.payload {
                    let body = serde_json::to_string_pretty(w).unwrap_or_default();
                    out.push_str(&format!("### {} ({})\n{}\n", message.source, message.phase, body));
                }
            }
            sections.push(out);
        }

        let answered: HashSet<Uuid> = inner
            .messages
            .iter()
            .filter_map(|m| match &m.payload {
                MessagePayload::Answer(a) => Some(a.question_id),
                _ => None,
            })
            .collect();

        let mut for_me = String::new();
        for message in &inner.messages {
            if let MessagePayload::PersonaWork(w) = &message.payload {
                for question in &w.questions {
                    if question.for_persona == persona_id && !answered.contains(&question.id) {
                        for_me.push_str(&format!(
                            "- from {}: {}\n",
                            message.source, question.question
                        ));
                        if let Some(context) = &question.context {
                            for_me.push_str(&format!("  context: {}\n", context));
                        }
                    }
                }
            }
        }
        if !for_me.is_empty() {
            sections.push(format!("## Open questions addressed to you\n{}", for_me));
        }

        let my_questions: HashSet<Uuid> = inner
            .messages
            .iter()
            .filter(|m| m.source == persona_id)
            .filter_map(|m| match &m.payload {
                MessagePayload::PersonaWork(w) => {
                    Some(w.questions.iter().map(|q| q.id).collect::<Vec<_>>())
                }
                _ => None,
            })
            .flatten()
            .collect();
        let mut answers = String::new();
        for message in &inner.messages {
            if let MessagePayload::Answer(a) = &message.payload {
                if my_questions.contains(&a.question_id) {
                    answers.push_str(&format!("- {}: {}\n", a.author, a.answer_text));
                }
            }
        }
        if !answers.is_empty() {
            sections.push(format!("## Answers to your questions\n{}", answers));
        }

        let notices: Vec<&Message> = inner
            .messages
            .iter()
            .filter(|m| matches!(m.payload, MessagePayload::System(_)))
            .collect();
        if !notices.is_empty() {
            let mut out = String::from("## System notices\n");
            for message in notices.iter().rev().take(5).rev() {
                if let MessagePayload::System(n) = &message.payload {
                    out.push_str(&format!("- [{}] {}\n", message.phase, n.content));
                }
            }
            sections.push(out);
        }

        sections.join("\n")
    }

    /// Questions not yet matched by an answer message, with their asker.
    pub fn unanswered_questions(&self, phase: Option<Phase>) -> Vec<(String, Question)> {
        let inner = self.inner.read();
        let answered: HashSet<Uuid> = inner
            .messages
            .iter()
            .filter_map(|m| match &m.payload {
                MessagePayload::Answer(a) => Some(a.question_id),
                _ => None,
            })
            .collect();

        let mut pending = Vec::new();
        for message in &inner.messages {
            if let Some(p) = phase {
                if message.phase != p {
                    continue;
                }
            }
            if let MessagePayload::PersonaWork(w) = &message.payload {
                for question in &w.questions {
                    if !answered.contains(&question.id) {
                        pending.push((message.source.clone(), question.clone()));
                    }
                }
            }
        }
        pending
    }

    pub fn summary_stats(&self) -> ConversationStats {
        let inner = self.inner.read();
        let mut stats = ConversationStats {
            messages: inner.messages.len(),
            ..Default::default()
        };
        for message in &inner.messages {
            match &message.payload {
                MessagePayload::PersonaWork(w) => {
                    stats.decisions += w.decisions.len();
                    stats.questions += w.questions.len();
                    stats.concerns += w.concerns.len();
                }
                MessagePayload::Answer(_) => stats.answers += 1,
                _ => {}
            }
        }
        stats
    }

    /// Serialize the full conversation to `path`.
    pub fn save(&self, path: &Path) -> ConversationResult<()> {
        let inner = self.inner.read();
        let dump = ConversationDump {
            session_id: self.session_id,
            messages: inner.messages.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&dump)?)?;
        Ok(())
    }

    /// Load a conversation previously written by [`Conversation::save`].
    pub fn load(path: &Path) -> ConversationResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let dump: ConversationDump = serde_json::from_str(&content)?;
        let ids = dump.messages.iter().map(|m| m.id).collect();
        Ok(Self {
            session_id: dump.session_id,
            inner: RwLock::new(Inner {
                messages: dump.messages,
                ids,
            }),
            mirror: None,
        })
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_message(source: &str, phase: Phase, summary: &str) -> Message {
        Message::new(
            source,
            phase,
            MessagePayload::PersonaWork(PersonaWork {
                summary: summary.to_string(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_append_assigns_order_and_rejects_duplicates() {
        let conversation = Conversation::new();
        let first = work_message("backend_developer", Phase::Implementation, "built API");
        let id = conversation.append(first.clone()).unwrap();
        assert_eq!(id, first.id);

        let err = conversation.append(first).unwrap_err();
        assert!(matches!(err, ConversationError::DuplicateId(_)));
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn test_created_at_is_monotonic() {
        let conversation = Conversation::new();
        let first = work_message("a", Phase::Design, "first");
        conversation.append(first.clone()).unwrap();

        let mut stale = work_message("b", Phase::Design, "second");
        stale.created_at = first.created_at - chrono::Duration::seconds(60);
        let stale_id = stale.id;
        conversation.append(stale).unwrap();

        let messages = conversation.messages();
        assert!(messages[1].created_at >= messages[0].created_at);
        assert_eq!(messages[1].id, stale_id);
    }

    #[test]
    fn test_filter_by_kind_source_and_limit() {
        let conversation = Conversation::new();
        for i in 0..5 {
            conversation
                .append(work_message("a", Phase::Design, &format!("work {}", i)))
                .unwrap();
        }
        conversation
            .append(Message::system(Phase::Design, SystemLevel::Info, "notice"))
            .unwrap();

        let work = conversation.filter(&MessageQuery::new().kind(MessageKind::PersonaWork));
        assert_eq!(work.len(), 5);

        let limited = conversation.filter(
            &MessageQuery::new()
                .kind(MessageKind::PersonaWork)
                .limit(2),
        );
        assert_eq!(limited.len(), 2);
        if let MessagePayload::PersonaWork(w) = &limited[1].payload {
            assert_eq!(w.summary, "work 4");
        } else {
            panic!("expected persona work");
        }

        let system = conversation.filter(&MessageQuery::new().source("system"));
        assert_eq!(system.len(), 1);
    }

    #[test]
    fn test_context_for_includes_questions_and_answers() {
        let conversation = Conversation::new();
        let question = Question {
            id: Uuid::new_v4(),
            for_persona: "backend_developer".to_string(),
            question: "JWT or cookies?".to_string(),
            context: None,
        };
        let mut work = PersonaWork {
            summary: "drafted auth design".to_string(),
            ..Default::default()
        };
        work.questions.push(question.clone());
        conversation
            .append(Message::new(
                "solution_architect",
                Phase::Design,
                MessagePayload::PersonaWork(work),
            ))
            .unwrap();

        let context = conversation.context_for("backend_developer", None);
        assert!(context.contains("JWT or cookies?"));
        assert!(context.contains("solution_architect"));

        conversation
            .append(Message::new(
                "backend_developer",
                Phase::Design,
                MessagePayload::Answer(Answer {
                    question_id: question.id,
                    answer_text: "JWT with refresh tokens".to_string(),
                    author: "backend_developer".to_string(),
                }),
            ))
            .unwrap();

        // Once answered, the question leaves the open list and the asker
        // sees the answer.
        let context = conversation.context_for("backend_developer", None);
        assert!(!context.contains("Open questions"));
        let asker_context = conversation.context_for("solution_architect", None);
        assert!(asker_context.contains("JWT with refresh tokens"));
    }

    #[test]
    fn test_summary_stats() {
        let conversation = Conversation::new();
        let mut work = PersonaWork {
            summary: "work".to_string(),
            ..Default::default()
        };
        work.decisions.push(Decision {
            decision: "use postgres".to_string(),
            rationale: "relational fit".to_string(),
            alternatives: vec!["sqlite".to_string()],
            trade_offs: None,
        });
        work.concerns.push("tight deadline".to_string());
        work.questions.push(Question {
            id: Uuid::new_v4(),
            for_persona: "qa_engineer".to_string(),
            question: "coverage target?".to_string(),
            context: None,
        });
        conversation
            .append(Message::new("a", Phase::Design, MessagePayload::PersonaWork(work)))
            .unwrap();
        conversation
            .append(Message::new(
                "qa_engineer",
                Phase::Design,
                MessagePayload::Answer(Answer {
                    question_id: Uuid::new_v4(),
                    answer_text: "80%".to_string(),
                    author: "qa_engineer".to_string(),
                }),
            ))
            .unwrap();

        let stats = conversation.summary_stats();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.questions, 1);
        assert_eq!(stats.answers, 1);
        assert_eq!(stats.concerns, 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");

        let conversation = Conversation::new();
        conversation
            .append(work_message("a", Phase::Requirements, "gathered stories"))
            .unwrap();
        conversation
            .append(Message::system(Phase::Requirements, SystemLevel::Warning, "slow"))
            .unwrap();
        conversation.save(&path).unwrap();

        let loaded = Conversation::load(&path).unwrap();
        assert_eq!(loaded.session_id(), conversation.session_id());
        assert_eq!(loaded.messages(), conversation.messages());
    }

    #[test]
    fn test_unknown_kind_survives_round_trip() {
        let raw = serde_json::json!({
            "id": Uuid::new_v4(),
            "source": "future_tool",
            "phase": "design",
            "created_at": Utc::now(),
            "kind": "vote",
            "ballot": {"choice": "option-b", "weight": 3}
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.kind(), MessageKind::Unknown);

        let serialized = serde_json::to_value(&message).unwrap();
        assert_eq!(serialized["kind"], "vote");
        assert_eq!(serialized["ballot"]["weight"], 3);
    }

    #[test]
    fn test_mirror_written_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.json");
        let conversation = Conversation::new().with_mirror(&path);
        conversation
            .append(work_message("a", Phase::Design, "x"))
            .unwrap();
        let loaded = Conversation::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_unanswered_questions_by_phase() {
        let conversation = Conversation::new();
        let q = Question {
            id: Uuid::new_v4(),
            for_persona: "b".to_string(),
            question: "which db?".to_string(),
            context: None,
        };
        let mut work = PersonaWork::default();
        work.summary = "w".to_string();
        work.questions.push(q.clone());
        conversation
            .append(Message::new("a", Phase::Design, MessagePayload::PersonaWork(work)))
            .unwrap();

        assert_eq!(conversation.unanswered_questions(Some(Phase::Design)).len(), 1);
        assert_eq!(conversation.unanswered_questions(Some(Phase::Testing)).len(), 0);

        conversation
            .append(Message::new(
                "b",
                Phase::Design,
                MessagePayload::Answer(Answer {
                    question_id: q.id,
                    answer_text: "postgres".to_string(),
                    author: "b".to_string(),
                }),
            ))
            .unwrap();
        assert!(conversation.unanswered_questions(None).is_empty());
    }
}
