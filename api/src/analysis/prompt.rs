use coach_core::analysis::{AnalysisMode, AnalysisRequest};
use coach_core::truth::{TimeWindow, TruthEvent, format_game_clock, render_fact_line};

fn describe_window(window: Option<&TimeWindow>) -> String {
    match window {
        None => "entire match".to_string(),
        Some(window) if window.is_unbounded() => "entire match".to_string(),
        Some(TimeWindow {
            start_ms,
            end_ms: Some(end_ms),
        }) => format!(
            "{} to {}",
            format_game_clock(*start_ms),
            format_game_clock(*end_ms)
        ),
        Some(TimeWindow {
            start_ms,
            end_ms: None,
        }) => format!("{} to end of match", format_game_clock(*start_ms)),
    }
}

/// Assemble the generation prompt. Verified events are injected as the only facts the
/// model may cite; kill categories come from the extractor, never from the model.
pub fn build_prompt(
    request: &AnalysisRequest,
    truth: &[TruthEvent],
    window: Option<&TimeWindow>,
    tolerance_ms: i64,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are a League of Legends coach reviewing participant {} in match {}.\n",
        request.subject_id, request.evidence.match_id
    ));
    prompt.push_str(&format!("Review window: {}.\n", describe_window(window)));
    match request.mode {
        AnalysisMode::Match => {
            prompt.push_str("Evidence: match timeline only.\n");
        }
        AnalysisMode::Vod => {
            prompt.push_str(&format!(
                "Evidence: match timeline plus {} attached gameplay frame(s).\n",
                request.evidence.frames.len()
            ));
        }
    }

    prompt.push_str("\nVerified events (events marked subject_involved include the player):\n");
    if truth.is_empty() {
        prompt.push_str("(no verified events in this window)\n");
    }
    for event in truth {
        prompt.push_str("- ");
        prompt.push_str(&render_fact_line(event));
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "\nRules:\n\
         - Every insight timestamp_ms must be within {} seconds of a verified event above.\n\
         - Do not describe fights, kills or objectives that are not listed.\n\
         - Use exact in-game item names for item_recommendations.\n",
        tolerance_ms / 1000
    ));

    if let Some(question) = request
        .freeform_question
        .as_deref()
        .map(str::trim)
        .filter(|question| !question.is_empty())
    {
        prompt.push_str(&format!("\nPlayer question: {question}\n"));
    }

    prompt.push_str("\nRespond only with JSON matching the provided response schema.\n");
    prompt
}

#[cfg(test)]
mod tests {
    use coach_core::analysis::{AnalysisMode, AnalysisRequest, EvidencePayload};
    use coach_core::truth::{KillCategory, TimeWindow, TruthEvent, TruthEventKind};

    use super::build_prompt;

    fn request(question: Option<&str>) -> AnalysisRequest {
        AnalysisRequest {
            subject_id: 4,
            mode: AnalysisMode::Match,
            time_window: None,
            evidence: EvidencePayload {
                match_id: "EUW1_99".to_string(),
                timeline: None,
                frames: Vec::new(),
            },
            freeform_question: question.map(str::to_string),
        }
    }

    #[test]
    fn prompt_lists_verified_events_and_window() {
        let truth = vec![TruthEvent {
            kind: TruthEventKind::Kill,
            timestamp_ms: 754_000,
            participant_ids: vec![4, 9],
            derived_category: Some(KillCategory::SoloKill),
            detail: None,
            involves_subject: true,
        }];
        let window = TimeWindow {
            start_ms: 0,
            end_ms: Some(840_000),
        };

        let prompt = build_prompt(&request(Some("Why did I lose lane?")), &truth, Some(&window), 60_000);

        assert!(prompt.contains("participant 4 in match EUW1_99"));
        assert!(prompt.contains("Review window: 00:00 to 14:00."));
        assert!(prompt.contains("- [12:34] t=754000ms Kill (SoloKill) participants=[4, 9] subject_involved"));
        assert!(prompt.contains("within 60 seconds"));
        assert!(prompt.contains("Player question: Why did I lose lane?"));
    }

    #[test]
    fn empty_truth_and_blank_question_are_handled() {
        let prompt = build_prompt(&request(Some("   ")), &[], None, 60_000);
        assert!(prompt.contains("(no verified events in this window)"));
        assert!(prompt.contains("Review window: entire match."));
        assert!(!prompt.contains("Player question"));
    }
}
