//! Group-discussion orchestrator.
//!
//! Runs a bounded multi-round discussion among personas at phase
//! boundaries, checking for consensus after each round and synthesizing the
//! outcome into a system message. Also routes pending cross-persona
//! questions to their target and appends the replies as answer messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::conversation::{
    Answer, Conversation, DiscussionKind, DiscussionNote, Message, MessagePayload, SystemLevel,
};
use crate::errors::{GroupChatError, GroupChatResult};
use crate::llm::{extract_json, GenerationOptions, LlmBackend};
use crate::phase::Phase;

/// Group-chat tuning knobs.
#[derive(Debug, Clone)]
pub struct GroupChatConfig {
    pub max_rounds: u32,
    /// Consensus confidence needed to stop early.
    pub consensus_threshold: f64,
    /// How many trailing messages each prompt sees.
    pub recent_window: usize,
}

impl Default for GroupChatConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            consensus_threshold: 0.7,
            recent_window: 20,
        }
    }
}

/// A discussion participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub persona_id: String,
    pub expertise: String,
}

impl Participant {
    pub fn new(persona_id: &str, expertise: &str) -> Self {
        Self {
            persona_id: persona_id.to_string(),
            expertise: expertise.to_string(),
        }
    }
}

/// Outcome of a consensus probe after one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusCheck {
    pub reached: bool,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub outstanding: Vec<String>,
}

impl ConsensusCheck {
    fn inconclusive() -> Self {
        Self {
            reached: false,
            confidence: 0.0,
            rationale: "consensus response was not parseable".to_string(),
            outstanding: Vec::new(),
        }
    }
}

/// Synthesized result of a finished discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionSynthesis {
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
}

/// What a discussion produced.
#[derive(Debug, Clone)]
pub struct DiscussionOutcome {
    pub consensus: Option<DiscussionSynthesis>,
    pub consensus_reached: bool,
    pub rounds: u32,
    pub messages: usize,
}

/// Drives structured discussions over the shared conversation.
pub struct GroupChatOrchestrator {
    backend: Arc<dyn LlmBackend>,
    config: GroupChatConfig,
}

impl GroupChatOrchestrator {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            backend,
            config: GroupChatConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GroupChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a multi-round discussion on `topic` among `participants`.
    pub async fn run_discussion(
        &self,
        conversation: &Conversation,
        phase: Phase,
        topic: &str,
        requirement: &str,
        participants: &[Participant],
    ) -> GroupChatResult<DiscussionOutcome> {
        if participants.len() < 2 {
            return Err(GroupChatError::NotEnoughParticipants(participants.len()));
        }

        let mut appended = 0usize;
        conversation.append(Message::system(
            phase,
            SystemLevel::Info,
            &format!("Discussion opened: {}", topic),
        ))?;
        appended += 1;

        let mut rounds = 0u32;
        let mut reached = false;
        for round in 1..=self.config.max_rounds {
            rounds = round;
            for participant in participants {
                let prompt = self.participant_prompt(
                    conversation,
                    topic,
                    requirement,
                    participant,
                    round,
                );
                let response = self
                    .backend
                    .generate_text(&prompt, &GenerationOptions::default())
                    .await?;
                conversation.append(Message::new(
                    &participant.persona_id,
                    phase,
                    MessagePayload::Discussion(DiscussionNote {
                        content: response,
                        message_type: DiscussionKind::Discussion,
                        reply_to: None,
                        metadata: json!({ "round": round, "topic": topic }),
                    }),
                ))?;
                appended += 1;
            }

            let check = self.consensus_check(conversation, topic).await?;
            debug!(
                round,
                reached = check.reached,
                confidence = check.confidence,
                "consensus check"
            );
            if check.reached && check.confidence >= self.config.consensus_threshold {
                reached = true;
                info!(topic, round, confidence = check.confidence, "consensus reached");
                break;
            }
        }

        let synthesis = self.synthesize(conversation, topic).await?;
        conversation.append(Message::system(
            phase,
            SystemLevel::Info,
            &format!("Discussion closed: {}. {}", topic, synthesis.summary),
        ))?;
        appended += 1;

        Ok(DiscussionOutcome {
            consensus: Some(synthesis),
            consensus_reached: reached,
            rounds,
            messages: appended,
        })
    }

    /// Route up to `max` unanswered questions in `phase` to their targets.
    /// Returns how many answers were appended.
    pub async fn resolve_pending_questions(
        &self,
        conversation: &Conversation,
        phase: Phase,
        max: usize,
    ) -> GroupChatResult<usize> {
        let pending = conversation.unanswered_questions(Some(phase));
        let mut answered = 0usize;

        for (asker, question) in pending.into_iter().take(max) {
            let context = conversation.context_for(&question.for_persona, Some(5));
            let prompt = format!(
                "You are persona '{target}'.\n\
                 Persona '{asker}' asked you: {question}\n\
                 {extra}\n\
                 Conversation context:\n{context}\n\n\
                 Answer the question directly and concretely.",
                target = question.for_persona,
                asker = asker,
                question = question.question,
                extra = question
                    .context
                    .as_deref()
                    .map(|c| format!("Question context: {}", c))
                    .unwrap_or_default(),
                context = context,
            );
            let answer_text = match self
                .backend
                .generate_text(&prompt, &GenerationOptions::default())
                .await
            {
                Ok(text) => text,
                Err(error) => {
                    warn!(%error, question = %question.question, "question routing failed");
                    continue;
                }
            };
            conversation.append(Message::new(
                &question.for_persona,
                phase,
                MessagePayload::Answer(Answer {
                    question_id: question.id,
                    answer_text,
                    author: question.for_persona.clone(),
                }),
            ))?;
            answered += 1;
        }
        Ok(answered)
    }

    fn participant_prompt(
        &self,
        conversation: &Conversation,
        topic: &str,
        requirement: &str,
        participant: &Participant,
        round: u32,
    ) -> String {
        format!(
            "You are persona '{id}' with expertise in {expertise}.\n\
             Topic under discussion: {topic}\n\
             Requirement: {requirement}\n\
             Round: {round}\n\n\
             Recent conversation (oldest first):\n{recent}\n\n\
             Contribute your position. Raise concrete concerns or proposals; \
             agree explicitly when you agree.",
            id = participant.persona_id,
            expertise = participant.expertise,
            topic = topic,
            requirement = requirement,
            round = round,
            recent = render_recent(conversation, self.config.recent_window),
        )
    }

    async fn consensus_check(
        &self,
        conversation: &Conversation,
        topic: &str,
    ) -> GroupChatResult<ConsensusCheck> {
        let prompt = format!(
            "Assess whether the participants have reached consensus on: {topic}\n\n\
             Recent conversation (oldest first):\n{recent}\n\n\
             Respond with JSON only: {{\"reached\": bool, \"confidence\": number, \
             \"rationale\": string, \"outstanding\": [string]}}",
            topic = topic,
            recent = render_recent(conversation, self.config.recent_window),
        );
        let response = self
            .backend
            .generate_text(&prompt, &GenerationOptions::default())
            .await?;
        Ok(extract_json(&response)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(ConsensusCheck::inconclusive))
    }

    async fn synthesize(
        &self,
        conversation: &Conversation,
        topic: &str,
    ) -> GroupChatResult<DiscussionSynthesis> {
        let prompt = format!(
            "Synthesize the discussion on: {topic}\n\n\
             Full conversation (oldest first):\n{all}\n\n\
             Respond with JSON only: {{\"summary\": string, \"decisions\": [string], \
             \"action_items\": [string], \"open_questions\": [string]}}",
            topic = topic,
            all = render_recent(conversation, usize::MAX),
        );
        let response = self
            .backend
            .generate_text(&prompt, &GenerationOptions::default())
            .await?;
        Ok(extract_json(&response)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| DiscussionSynthesis {
                summary: response.trim().to_string(),
                decisions: Vec::new(),
                action_items: Vec::new(),
                open_questions: Vec::new(),
            }))
    }
}

/// Render the trailing `window` messages, oldest first, one line each.
fn render_recent(conversation: &Conversation, window: usize) -> String {
    let messages = conversation.messages();
    let skip = messages.len().saturating_sub(window);
    let mut out = String::new();
    for message in messages.iter().skip(skip) {
        let line = match &message.payload {
            MessagePayload::PersonaWork(w) => format!("{} (work): {}", message.source, w.summary),
            MessagePayload::Discussion(d) => format!("{}: {}", message.source, d.content),
            MessagePayload::System(n) => format!("system: {}", n.content),
            MessagePayload::Answer(a) => format!("{} (answer): {}", message.source, a.answer_text),
            MessagePayload::Unknown(_) => format!("{}: <unrecognized message>", message.source),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}
