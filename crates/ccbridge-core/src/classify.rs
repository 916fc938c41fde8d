//! Waiting-state classifier.
//!
//! Inspects the assistant's last text block (and whether an ExitPlanMode
//! tool_use is pending) and tags what kind of input the agent is waiting for.
//! Callers only surface the tag after the transcript has gone quiet; short
//! completed statements and ordinary questions do not trigger a notification
//! on their own.

use once_cell::sync::Lazy;
use regex::Regex;

/// Minimum text length for a trailing `?` to count as a real question.
const QUESTION_MIN_LEN: usize = 10;

static YES_NO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(y/n\)|\[y/n\]|confirm\?").unwrap());
static PRESS_ENTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)press enter|hit enter").unwrap());

/// Fixed choices offered when the agent awaits plan approval.
pub const PLAN_CHOICES: [&str; 4] = [
    "Accept plan",
    "Accept & keep planning",
    "Reject",
    "Reject & keep planning",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingKind {
    YesNo,
    Enter,
    Question,
    MultipleChoice,
}

impl WaitingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingKind::YesNo => "YES_NO",
            WaitingKind::Enter => "ENTER",
            WaitingKind::Question => "QUESTION",
            WaitingKind::MultipleChoice => "MULTIPLE_CHOICE",
        }
    }
}

/// Classify the assistant's tail state. A pending ExitPlanMode always wins:
/// the plan-approval prompt is the actionable one even when the plan text
/// itself ends in a question mark.
pub fn classify_waiting(last_text: Option<&str>, has_exit_plan_mode: bool) -> Option<WaitingKind> {
    if has_exit_plan_mode {
        return Some(WaitingKind::MultipleChoice);
    }

    let text = last_text?.trim_end();
    if text.is_empty() {
        return None;
    }
    if YES_NO.is_match(text) {
        return Some(WaitingKind::YesNo);
    }
    if PRESS_ENTER.is_match(text) {
        return Some(WaitingKind::Enter);
    }
    if text.ends_with('?') && text.chars().count() > QUESTION_MIN_LEN {
        return Some(WaitingKind::Question);
    }
    None
}
