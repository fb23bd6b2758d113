use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_MAX_TRUTH_EVENTS: usize = 40;
pub const EARLY_PHASE_END_MS: i64 = 14 * 60_000;
pub const LATE_PHASE_START_MS: i64 = 25 * 60_000;

const EVENT_ELITE_MONSTER_KILL: &str = "ELITE_MONSTER_KILL";
const EVENT_BUILDING_KILL: &str = "BUILDING_KILL";
const EVENT_CHAMPION_KILL: &str = "CHAMPION_KILL";
const EVENT_SKILL_LEVEL_UP: &str = "SKILL_LEVEL_UP";

/// Chronological match timeline as returned by the game-data provider.
/// Only the fields the extractor reads are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    #[serde(default)]
    pub frames: Vec<TimelineFrame>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimelineFrame {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killer_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub victim_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assisting_participant_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monster_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monster_sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tower_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_slot: Option<i32>,
}

/// Verified event kinds. Declaration order is the grounding priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TruthEventKind {
    Objective,
    Turret,
    Kill,
    SkillUp,
}

impl TruthEventKind {
    pub fn priority(self) -> u8 {
        match self {
            TruthEventKind::Objective => 0,
            TruthEventKind::Turret => 1,
            TruthEventKind::Kill => 2,
            TruthEventKind::SkillUp => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TruthEventKind::Objective => "Objective",
            TruthEventKind::Turret => "Turret",
            TruthEventKind::Kill => "Kill",
            TruthEventKind::SkillUp => "SkillUp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KillCategory {
    SoloKill,
    GroupKill,
}

impl KillCategory {
    pub fn from_assists(assists: usize) -> Self {
        if assists == 0 {
            KillCategory::SoloKill
        } else {
            KillCategory::GroupKill
        }
    }

    fn label(self) -> &'static str {
        match self {
            KillCategory::SoloKill => "SoloKill",
            KillCategory::GroupKill => "GroupKill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TruthEvent {
    pub kind: TruthEventKind,
    pub timestamp_ms: i64,
    pub participant_ids: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_category: Option<KillCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub involves_subject: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WindowPreset {
    Early,
    Late,
    Full,
}

/// Half-open window `[start_ms, end_ms)`; no end means "until the match ends".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeWindow {
    pub start_ms: i64,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

impl TimeWindow {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && self.end_ms.is_none_or(|end| timestamp_ms < end)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start_ms <= 0 && self.end_ms.is_none()
    }
}

/// A window as requested by the caller: a named phase or explicit bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum WindowSelection {
    Preset(WindowPreset),
    Range(TimeWindow),
}

impl WindowSelection {
    pub fn resolve(self) -> TimeWindow {
        match self {
            WindowSelection::Preset(WindowPreset::Early) => TimeWindow {
                start_ms: 0,
                end_ms: Some(EARLY_PHASE_END_MS),
            },
            WindowSelection::Preset(WindowPreset::Late) => TimeWindow {
                start_ms: LATE_PHASE_START_MS,
                end_ms: None,
            },
            WindowSelection::Preset(WindowPreset::Full) => TimeWindow {
                start_ms: 0,
                end_ms: None,
            },
            WindowSelection::Range(window) => window,
        }
    }
}

/// Derive the bounded, prioritized set of verified events for one subject.
///
/// Output is sorted by kind priority then timestamp; the sort is stable so events
/// sharing both keep their timeline order. Truncation keeps the head of that order,
/// dropping the lowest-priority, latest events first.
pub fn extract(
    timeline: &Timeline,
    subject_id: i32,
    window: Option<&TimeWindow>,
    limit: usize,
) -> Vec<TruthEvent> {
    let mut events: Vec<TruthEvent> = timeline
        .frames
        .iter()
        .flat_map(|frame| frame.events.iter())
        .filter(|event| window.is_none_or(|w| w.contains(event.timestamp)))
        .filter_map(|event| classify(event, subject_id))
        .collect();

    events.sort_by_key(|event| (event.kind.priority(), event.timestamp_ms));
    events.truncate(limit);
    events
}

fn classify(event: &TimelineEvent, subject_id: i32) -> Option<TruthEvent> {
    match event.kind.as_str() {
        EVENT_ELITE_MONSTER_KILL => {
            let participants =
                collect_participants(event.killer_id, None, &event.assisting_participant_ids);
            Some(TruthEvent {
                kind: TruthEventKind::Objective,
                timestamp_ms: event.timestamp,
                involves_subject: participants.contains(&subject_id),
                participant_ids: participants,
                derived_category: None,
                detail: event
                    .monster_sub_type
                    .clone()
                    .or_else(|| event.monster_type.clone()),
            })
        }
        EVENT_BUILDING_KILL => {
            let participants =
                collect_participants(event.killer_id, None, &event.assisting_participant_ids);
            Some(TruthEvent {
                kind: TruthEventKind::Turret,
                timestamp_ms: event.timestamp,
                involves_subject: participants.contains(&subject_id),
                participant_ids: participants,
                derived_category: None,
                detail: event
                    .tower_type
                    .clone()
                    .or_else(|| event.building_type.clone()),
            })
        }
        EVENT_CHAMPION_KILL => {
            let participants = collect_participants(
                event.killer_id,
                event.victim_id,
                &event.assisting_participant_ids,
            );
            Some(TruthEvent {
                kind: TruthEventKind::Kill,
                timestamp_ms: event.timestamp,
                involves_subject: participants.contains(&subject_id),
                participant_ids: participants,
                derived_category: Some(KillCategory::from_assists(
                    event.assisting_participant_ids.len(),
                )),
                detail: None,
            })
        }
        EVENT_SKILL_LEVEL_UP if event.participant_id == Some(subject_id) => Some(TruthEvent {
            kind: TruthEventKind::SkillUp,
            timestamp_ms: event.timestamp,
            participant_ids: vec![subject_id],
            derived_category: None,
            detail: event.skill_slot.and_then(skill_slot_label).map(str::to_string),
            involves_subject: true,
        }),
        _ => None,
    }
}

/// Killer first, then victim, then assists. Id 0 is the game's "no champion" marker
/// (minion or tower executes) and is not a participant.
fn collect_participants(killer: Option<i32>, victim: Option<i32>, assists: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(2 + assists.len());
    for id in killer
        .into_iter()
        .chain(victim)
        .chain(assists.iter().copied())
    {
        if id > 0 && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn skill_slot_label(slot: i32) -> Option<&'static str> {
    match slot {
        1 => Some("Q"),
        2 => Some("W"),
        3 => Some("E"),
        4 => Some("R"),
        _ => None,
    }
}

pub fn format_game_clock(timestamp_ms: i64) -> String {
    let total_seconds = timestamp_ms.max(0) / 1000;
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}

/// One prompt line per verified event, injected as fact for the generator.
pub fn render_fact_line(event: &TruthEvent) -> String {
    let mut line = format!(
        "[{}] t={}ms {}",
        format_game_clock(event.timestamp_ms),
        event.timestamp_ms,
        event.kind.label()
    );
    if let Some(category) = event.derived_category {
        line.push_str(&format!(" ({})", category.label()));
    }
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" {detail}"));
    }
    if !event.participant_ids.is_empty() {
        let ids: Vec<String> = event.participant_ids.iter().map(i32::to_string).collect();
        line.push_str(&format!(" participants=[{}]", ids.join(", ")));
    }
    if event.involves_subject {
        line.push_str(" subject_involved");
    }
    line
}
