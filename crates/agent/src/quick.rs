//! Regex fast path for intents that never need the oracle.
//!
//! A latency optimization only: anything this module cannot name falls
//! through to the oracle, so a miss costs a network call, never correctness.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuickIntent {
    Confirmation,
    Cancellation,
    Undo,
    Greeting,
    Thanks,
}

static GREETING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hola|buenos días|buenas tardes|buenas noches|buenas|hey|hello|hi)[\s!.]*$")
        .expect("greeting regex")
});

static THANKS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(gracias|muchas gracias|mil gracias|thanks|thank you|ty)[\s!.]*$")
        .expect("thanks regex")
});

const CONFIRM_PHRASES: &[&str] =
    &["sí", "si", "ok", "okay", "dale", "confirmo", "correcto", "claro", "va", "sale", "yes", "yep"];

const CANCEL_PHRASES: &[&str] = &[
    "no",
    "cancelar",
    "cancela",
    "olvídalo",
    "olvidalo",
    "mejor no",
    "ya no",
    "cancel",
    "nevermind",
];

pub fn classify_quick_pattern(text: &str) -> Option<QuickIntent> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();

    if clerky_core::history::is_undo_request(trimmed) {
        return Some(QuickIntent::Undo);
    }
    if CONFIRM_PHRASES.iter().any(|p| *p == lowered) {
        return Some(QuickIntent::Confirmation);
    }
    if CANCEL_PHRASES.iter().any(|p| *p == lowered) {
        return Some(QuickIntent::Cancellation);
    }
    if GREETING_RE.is_match(trimmed) {
        return Some(QuickIntent::Greeting);
    }
    if THANKS_RE.is_match(trimmed) {
        return Some(QuickIntent::Thanks);
    }
    None
}

/// Sub-intent used when a side message interrupts an active collection flow:
/// does the user want to continue, abandon it, or was that just courtesy?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowSubIntent {
    Continue,
    CancelFlow,
    Thanks,
    Other,
}

static CANCEL_FLOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(ya no quiero|ya no|olvida (la|el|eso)|cancela (la|el|todo|eso)|dejémoslo|dejemoslo|empezar de nuevo|forget (it|that)|start over)\b",
    )
    .expect("cancel flow regex")
});

static CONTINUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(sigamos|continuemos|continuar|seguimos|donde íbamos|donde ibamos|continue|resume)\b")
        .expect("continue regex")
});

pub fn classify_flow_sub_intent(text: &str) -> FlowSubIntent {
    if CANCEL_FLOW_RE.is_match(text) {
        return FlowSubIntent::CancelFlow;
    }
    if CONTINUE_RE.is_match(text) {
        return FlowSubIntent::Continue;
    }
    if THANKS_RE.is_match(text.trim()) {
        return FlowSubIntent::Thanks;
    }
    FlowSubIntent::Other
}

#[cfg(test)]
mod tests {
    use super::{classify_flow_sub_intent, classify_quick_pattern, FlowSubIntent, QuickIntent};

    #[test]
    fn common_phrases_resolve_without_the_oracle() {
        assert_eq!(classify_quick_pattern("dale"), Some(QuickIntent::Confirmation));
        assert_eq!(classify_quick_pattern("  Sí  "), Some(QuickIntent::Confirmation));
        assert_eq!(classify_quick_pattern("olvídalo"), Some(QuickIntent::Cancellation));
        assert_eq!(classify_quick_pattern("hola!"), Some(QuickIntent::Greeting));
        assert_eq!(classify_quick_pattern("muchas gracias"), Some(QuickIntent::Thanks));
        assert_eq!(classify_quick_pattern("deshaz lo último"), Some(QuickIntent::Undo));
    }

    #[test]
    fn substantive_messages_fall_through() {
        assert_eq!(classify_quick_pattern("quiero agendar una cita"), None);
        assert_eq!(classify_quick_pattern("hola, quiero una cita para mañana"), None);
        assert_eq!(classify_quick_pattern(""), None);
    }

    #[test]
    fn flow_sub_intent_detects_abandonment_and_resumption() {
        assert_eq!(classify_flow_sub_intent("ya no quiero la cita"), FlowSubIntent::CancelFlow);
        assert_eq!(classify_flow_sub_intent("sigamos con la cita"), FlowSubIntent::Continue);
        assert_eq!(classify_flow_sub_intent("gracias"), FlowSubIntent::Thanks);
        assert_eq!(classify_flow_sub_intent("¿qué productos tienen?"), FlowSubIntent::Other);
    }
}
