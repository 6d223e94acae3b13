//! Utterance pre-filter
//!
//! Cheap pattern checks that keep trivia away from the classifier:
//! greetings, "can you hear me?" communication checks, sub-3-character
//! fragments, and farewells. For the gray zone in between, an
//! intent-strength score decides whether a should-classify LLM call is
//! worth making at all.

use once_cell::sync::Lazy;

use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::types::Language;

/// Verdict for one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefilterVerdict {
    /// Real content; classify it.
    Process,
    Greeting,
    CommunicationCheck,
    TooShort,
    Farewell,
}

/// Greetings in the four call languages.
static GREETINGS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        // English
        "hi", "hello", "hey", "ok", "okay", "thanks", "thank you",
        // German
        "hallo", "guten tag", "guten morgen", "danke",
        // Hindi / mixed
        "namaste", "namaskar", "dhanyavad", "shukriya", "haanji",
    ]
});

/// Communication checks ("can you hear me?").
static COMM_CHECKS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "can you hear me",
        "are you there",
        "hello can you hear",
        "hörst du mich",
        "können sie mich hören",
        "sind sie da",
        "kya aap sun sakte hain",
        "sun rahe ho",
        "awaaz aa rahi hai",
    ]
});

static FAREWELLS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "bye", "goodbye", "bye bye", "see you", "that's all",
        "tschüss", "auf wiedersehen", "auf wiederhören",
        "alvida", "phir milenge",
    ]
});

/// Words that signal actionable intent; drive the strength score.
static INTENT_WORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "appointment", "termin", "shift", "cancel", "reschedule", "move",
        "book", "late", "delay", "invoice", "bill", "schedule", "available",
        "availability", "meeting", "confirm", "verschieben", "absagen",
    ]
});

/// Classify trivia without an LLM in the loop.
pub fn prefilter(text: &str) -> PrefilterVerdict {
    let cleaned = text.trim().trim_end_matches(['.', '!', '?']).to_lowercase();
    if cleaned.chars().count() < 3 {
        return PrefilterVerdict::TooShort;
    }
    if FAREWELLS
        .iter()
        .any(|phrase| cleaned == *phrase || cleaned.ends_with(&format!(" {phrase}")))
    {
        return PrefilterVerdict::Farewell;
    }
    if COMM_CHECKS.iter().any(|phrase| cleaned.contains(phrase)) {
        return PrefilterVerdict::CommunicationCheck;
    }
    // Greeting only when the whole utterance is a greeting; "hello, I need
    // to move my appointment" must go through.
    if GREETINGS.iter().any(|greeting| cleaned == *greeting)
        || cleaned
            .split([' ', ','])
            .filter(|word| !word.is_empty())
            .all(|word| GREETINGS.contains(&word))
    {
        return PrefilterVerdict::Greeting;
    }
    PrefilterVerdict::Process
}

/// Score how much actionable intent an utterance carries, 0.0..=1.0.
pub fn intent_strength(text: &str) -> f32 {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = INTENT_WORDS.iter().filter(|word| lower.contains(*word)).count();
    let density = hits as f32 / (words.len() as f32).sqrt();
    // Longer utterances carry more signal even without keyword hits.
    let length_bonus = (words.len() as f32 / 20.0).min(0.3);
    (density + length_bonus).min(1.0)
}

/// For mid-strength utterances (0.2..0.6): ask the model whether a full
/// classification is worth it. Errs on the side of classifying.
pub async fn should_classify(llm: &dyn ChatModel, text: &str) -> bool {
    let strength = intent_strength(text);
    if strength >= 0.6 {
        return true;
    }
    if strength < 0.2 {
        // Small talk; not worth a classifier round-trip.
        return false;
    }
    let request = ChatRequest::deterministic(
        vec![
            ChatMessage::system(
                "Answer yes or no: does this utterance from a phone caller \
                 contain a request the agent should act on?",
            ),
            ChatMessage::user(text),
        ],
        15,
    );
    match llm.chat(request).await {
        Ok(outcome) => !outcome.text.trim().to_lowercase().starts_with("no"),
        Err(_) => true,
    }
}

/// Canned reply for filtered trivia, in the caller's language.
pub fn canned_reply(verdict: PrefilterVerdict, language: Language) -> &'static str {
    match (verdict, language) {
        (PrefilterVerdict::Greeting, Language::German) => "Hallo! Wie kann ich Ihnen helfen?",
        (PrefilterVerdict::Greeting, Language::Hindi | Language::HindiMixed) => {
            "Namaste! Main aapki kya madad kar sakti hoon?"
        }
        (PrefilterVerdict::Greeting, _) => "Hello! How can I help you today?",
        (PrefilterVerdict::CommunicationCheck, Language::German) => {
            "Ja, ich höre Sie. Wie kann ich helfen?"
        }
        (PrefilterVerdict::CommunicationCheck, Language::Hindi | Language::HindiMixed) => {
            "Haan, main sun sakti hoon. Boliye."
        }
        (PrefilterVerdict::CommunicationCheck, _) => "Yes, I can hear you. How can I help?",
        (PrefilterVerdict::Farewell, Language::German) => "Auf Wiederhören!",
        (PrefilterVerdict::Farewell, Language::Hindi | Language::HindiMixed) => "Alvida, namaste!",
        (PrefilterVerdict::Farewell, _) => "Goodbye, have a great day!",
        (_, Language::German) => "Entschuldigung, das habe ich nicht verstanden.",
        (_, Language::Hindi | Language::HindiMixed) => "Maaf kijiye, main samjhi nahi.",
        (_, _) => "Sorry, I didn't catch that. Could you say it again?",
    }
}
