//! Cross-persona question routing and conversation persistence, end to end.

use std::sync::Arc;

use maestro_core::{
    CannedBackend, Conversation, GroupChatOrchestrator, Message, MessageKind, MessagePayload,
    MessageQuery, PersonaWork, Phase, Question,
};
use uuid::Uuid;

fn question_for(target: &str, text: &str) -> (Question, Message) {
    let question = Question {
        id: Uuid::new_v4(),
        for_persona: target.to_string(),
        question: text.to_string(),
        context: Some("auth decision pending".to_string()),
    };
    let mut work = PersonaWork {
        summary: "drafted the auth design".to_string(),
        ..Default::default()
    };
    work.questions.push(question.clone());
    let message = Message::new(
        "solution_architect",
        Phase::Design,
        MessagePayload::PersonaWork(work),
    );
    (question, message)
}

#[tokio::test]
async fn test_question_routing_and_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let conversation = Conversation::new();

    let (question, message) = question_for("backend_developer", "JWT or cookies?");
    conversation.append(message).unwrap();

    // Route pending questions through the collaborator.
    let backend = Arc::new(CannedBackend::new().with_default("JWT with short-lived refresh tokens."));
    let orchestrator = GroupChatOrchestrator::new(backend);
    let answered = orchestrator
        .resolve_pending_questions(&conversation, Phase::Design, 10)
        .await
        .unwrap();
    assert_eq!(answered, 1);

    // The answer is linked by question id and visible to the asker.
    let answers = conversation.filter(&MessageQuery::new().kind(MessageKind::Answer));
    assert_eq!(answers.len(), 1);
    if let MessagePayload::Answer(answer) = &answers[0].payload {
        assert_eq!(answer.question_id, question.id);
        assert_eq!(answer.author, "backend_developer");
    } else {
        panic!("expected answer payload");
    }
    let asker_context = conversation.context_for("solution_architect", None);
    assert!(asker_context.contains("JWT with short-lived refresh tokens."));

    // Saving and reloading preserves ids, timestamps, and every field.
    let path = dir.path().join("conversation.json");
    conversation.save(&path).unwrap();
    let reloaded = Conversation::load(&path).unwrap();
    assert_eq!(reloaded.session_id(), conversation.session_id());
    assert_eq!(reloaded.messages(), conversation.messages());
    assert_eq!(reloaded.summary_stats(), conversation.summary_stats());

    // Ids stay unique and ordering by created_at is a total order.
    let messages = reloaded.messages();
    let mut ids = std::collections::HashSet::new();
    for window in messages.windows(2) {
        assert!(window[0].created_at <= window[1].created_at);
    }
    for message in &messages {
        assert!(ids.insert(message.id), "duplicate id {}", message.id);
    }

    // Nothing left to resolve after reload.
    assert!(reloaded.unanswered_questions(None).is_empty());
}

#[tokio::test]
async fn test_unresolved_questions_cap() {
    let conversation = Conversation::new();
    for index in 0..5 {
        let (_, message) = question_for("qa_engineer", &format!("edge case {}?", index));
        conversation.append(message).unwrap();
    }

    let backend = Arc::new(CannedBackend::new().with_default("Covered by the regression suite."));
    let orchestrator = GroupChatOrchestrator::new(backend);
    let answered = orchestrator
        .resolve_pending_questions(&conversation, Phase::Design, 3)
        .await
        .unwrap();
    assert_eq!(answered, 3);
    assert_eq!(conversation.unanswered_questions(Some(Phase::Design)).len(), 2);
}
