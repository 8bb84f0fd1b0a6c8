//! Speaker selection — a pure function over conversation state.
//!
//! Four strategies. `manual` never auto-selects; `list` rotates over
//! position order; `natural` runs the SillyTavern-compatible three-phase
//! activation (mention, talkativeness, fallback); `pooled` lets every
//! participant speak once per epoch and deliberately terminates auto-mode
//! when the pool drains.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use troupe_store::{Message, ReplyOrder, Role, SpaceMembership};

/// Source of uniform draws. Kept as a trait so tests can script outcomes;
/// production uses [`ClockDice`] (no rand dependency, same approach as the
/// backoff jitter elsewhere in the stack).
pub trait Dice: Send {
    /// Uniform draw from [0, 1).
    fn roll(&mut self) -> f64;
}

/// SplitMix64 generator seeded from the system clock.
pub struct ClockDice {
    state: u64,
}

impl ClockDice {
    pub fn new() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e37_79b9_7f4a_7c15);
        Self { state: nanos }
    }
}

impl Default for ClockDice {
    fn default() -> Self {
        Self::new()
    }
}

impl Dice for ClockDice {
    fn roll(&mut self) -> f64 {
        // SplitMix64 step.
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Scripted draws for deterministic tests. Returns 1.0 once exhausted
/// (so unscripted talkativeness checks fail closed).
pub struct ScriptedDice {
    values: std::collections::VecDeque<f64>,
}

impl ScriptedDice {
    pub fn new(values: Vec<f64>) -> Self {
        Self {
            values: values.into(),
        }
    }
}

impl Dice for ScriptedDice {
    fn roll(&mut self) -> f64 {
        self.values.pop_front().unwrap_or(1.0)
    }
}

/// Everything a strategy may look at. Pure data — no store access.
pub struct SelectorInput<'a> {
    pub reply_order: ReplyOrder,
    pub allow_self: bool,
    /// Eligible memberships in position order.
    pub members: &'a [SpaceMembership],
    /// Author of the most recent assistant message, if any.
    pub previous_speaker_id: Option<&'a str>,
    /// Prompt-window history, oldest first.
    pub history: &'a [Message],
}

/// Pick the next speaker, or `None` when the strategy declines
/// (manual mode, empty cast, drained pool).
pub fn select_speaker(input: &SelectorInput<'_>, dice: &mut dyn Dice) -> Option<String> {
    if input.members.is_empty() {
        return None;
    }
    match input.reply_order {
        ReplyOrder::Manual => None,
        ReplyOrder::List => select_list(input),
        ReplyOrder::Natural => select_natural(input, dice),
        ReplyOrder::Pooled => select_pooled(input, dice),
    }
}

/// The deterministic queue a strategy would produce for one round, used for
/// round materialization and UI previews. Each member appears at most once.
pub fn predicted_queue(input: &SelectorInput<'_>, limit: usize) -> Vec<String> {
    let queue: Vec<String> = match input.reply_order {
        ReplyOrder::Manual => Vec::new(),
        ReplyOrder::List => rotation(input),
        ReplyOrder::Natural => {
            // Talkativeness-desc, then position — the likeliest speakers first.
            let mut sorted: Vec<&SpaceMembership> = candidates(input).collect();
            sorted.sort_by(|a, b| {
                b.effective_talkativeness()
                    .partial_cmp(&a.effective_talkativeness())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.position.cmp(&b.position))
            });
            sorted.into_iter().map(|m| m.id.clone()).collect()
        }
        ReplyOrder::Pooled => {
            let spoken = epoch_speakers(input.history);
            candidates(input)
                .filter(|m| !spoken.contains(m.id.as_str()))
                .map(|m| m.id.clone())
                .collect()
        }
    };
    queue.into_iter().take(limit).collect()
}

// --- strategies ------------------------------------------------------------

fn select_list(input: &SelectorInput<'_>) -> Option<String> {
    rotation(input).into_iter().next()
}

/// Position-ordered rotation starting after the previous speaker.
fn rotation(input: &SelectorInput<'_>) -> Vec<String> {
    let n = input.members.len();
    let start = input
        .previous_speaker_id
        .and_then(|prev| input.members.iter().position(|m| m.id == prev))
        .map(|idx| (idx + 1) % n)
        .unwrap_or(0);

    (0..n)
        .map(|k| &input.members[(start + k) % n])
        .filter(|m| {
            input.allow_self || input.previous_speaker_id.is_none_or(|prev| m.id != prev)
        })
        .map(|m| m.id.clone())
        .collect()
}

/// Three-phase natural activation against the latest non-system message.
fn select_natural(input: &SelectorInput<'_>, dice: &mut dyn Dice) -> Option<String> {
    let activation_text = input
        .history
        .iter()
        .rev()
        .find(|m| m.role != Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    let words = tokenize(activation_text);

    let pool: Vec<&SpaceMembership> = candidates(input).collect();

    // Phase 1: whole-word mentions.
    let mentioned: Vec<&SpaceMembership> = pool
        .iter()
        .copied()
        .filter(|m| is_mentioned(&m.display_name, &words))
        .collect();

    // Phase 2: talkativeness draws.
    let chatty: Vec<&SpaceMembership> = pool
        .iter()
        .copied()
        .filter(|m| m.effective_talkativeness() >= dice.roll())
        .collect();

    // Phase 3: union, then uniform pick.
    let mut activated: Vec<&SpaceMembership> = mentioned;
    for m in chatty {
        if !activated.iter().any(|a| a.id == m.id) {
            activated.push(m);
        }
    }
    if !activated.is_empty() {
        return Some(pick_uniform(&activated, dice).id.clone());
    }

    // Fallback 1: anyone who talks at all.
    let talkers: Vec<&SpaceMembership> = pool
        .iter()
        .copied()
        .filter(|m| m.effective_talkativeness() > 0.0)
        .collect();
    if !talkers.is_empty() {
        return Some(pick_uniform(&talkers, dice).id.clone());
    }

    // Fallback 2: plain rotation.
    select_list(input)
}

/// Pooled: one turn per participant per epoch; a drained pool returns None.
fn select_pooled(input: &SelectorInput<'_>, dice: &mut dyn Dice) -> Option<String> {
    let spoken = epoch_speakers(input.history);
    let unspoken: Vec<&SpaceMembership> = candidates(input)
        .filter(|m| !spoken.contains(m.id.as_str()))
        .collect();
    if unspoken.is_empty() {
        return None;
    }
    Some(pick_uniform(&unspoken, dice).id.clone())
}

// --- helpers ---------------------------------------------------------------

/// Eligible members minus the previous speaker when self-responses are off.
fn candidates<'a>(
    input: &'a SelectorInput<'_>,
) -> impl Iterator<Item = &'a SpaceMembership> + 'a {
    input.members.iter().filter(move |m| {
        input.allow_self || input.previous_speaker_id.is_none_or(|prev| m.id != prev)
    })
}

/// Membership ids with an assistant message in the current epoch — the
/// timeline suffix after the most recent user message.
fn epoch_speakers(history: &[Message]) -> HashSet<&str> {
    let epoch_start = history
        .iter()
        .rposition(|m| m.role == Role::User)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    history[epoch_start..]
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .filter_map(|m| m.author_membership_id.as_deref())
        .collect()
}

fn pick_uniform<'a>(pool: &[&'a SpaceMembership], dice: &mut dyn Dice) -> &'a SpaceMembership {
    let idx = ((dice.roll() * pool.len() as f64) as usize).min(pool.len() - 1);
    pool[idx]
}

fn word_matcher() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w+\b").expect("static regex"))
}

fn tokenize(text: &str) -> HashSet<String> {
    word_matcher()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// A candidate is mentioned when any whole word of its display name appears
/// in the activation text.
fn is_mentioned(display_name: &str, words: &HashSet<String>) -> bool {
    word_matcher()
        .find_iter(display_name)
        .any(|m| words.contains(&m.as_str().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_store::{
        CopilotMode, MemberStatus, MembershipKind, Participation, Visibility,
    };

    fn member(id: &str, name: &str, position: i64, talkativeness: Option<f64>) -> SpaceMembership {
        SpaceMembership {
            id: id.into(),
            space_id: "s-1".into(),
            kind: MembershipKind::Character,
            display_name: name.into(),
            avatar_url: None,
            bubble_class: None,
            position,
            participation: Participation::Active,
            status: MemberStatus::Active,
            talkativeness,
            copilot_mode: CopilotMode::None,
            copilot_remaining_steps: 0,
            persona: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn msg(author: Option<&str>, role: Role, content: &str, seq: i64) -> Message {
        Message {
            id: format!("m-{seq}"),
            conversation_id: "c-1".into(),
            seq,
            role,
            visibility: Visibility::Normal,
            author_membership_id: author.map(String::from),
            text_content_id: "t".into(),
            content: content.into(),
            active_swipe_id: None,
            swipe_count: 0,
            run_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn cast() -> Vec<SpaceMembership> {
        vec![
            member("m-alice", "Alice", 0, Some(0.9)),
            member("m-bob", "Bob", 1, Some(0.1)),
            member("m-cleo", "Cleo Fairweather", 2, None),
        ]
    }

    fn input<'a>(
        reply_order: ReplyOrder,
        members: &'a [SpaceMembership],
        previous: Option<&'a str>,
        history: &'a [Message],
    ) -> SelectorInput<'a> {
        SelectorInput {
            reply_order,
            allow_self: false,
            members,
            previous_speaker_id: previous,
            history,
        }
    }

    #[test]
    fn manual_never_selects() {
        let members = cast();
        let mut dice = ScriptedDice::new(vec![0.0]);
        assert_eq!(
            select_speaker(&input(ReplyOrder::Manual, &members, None, &[]), &mut dice),
            None
        );
    }

    #[test]
    fn list_rotates_from_previous() {
        let members = cast();
        let mut dice = ScriptedDice::new(vec![]);
        let next = select_speaker(
            &input(ReplyOrder::List, &members, Some("m-alice"), &[]),
            &mut dice,
        );
        assert_eq!(next.as_deref(), Some("m-bob"));

        // Wraps around the tail.
        let next = select_speaker(
            &input(ReplyOrder::List, &members, Some("m-cleo"), &[]),
            &mut dice,
        );
        assert_eq!(next.as_deref(), Some("m-alice"));
    }

    #[test]
    fn list_skips_previous_when_self_disallowed() {
        let members = vec![member("m-solo", "Solo", 0, None)];
        let mut dice = ScriptedDice::new(vec![]);
        let next = select_speaker(
            &input(ReplyOrder::List, &members, Some("m-solo"), &[]),
            &mut dice,
        );
        assert_eq!(next, None);

        let mut with_self = input(ReplyOrder::List, &members, Some("m-solo"), &[]);
        with_self.allow_self = true;
        let next = select_speaker(&with_self, &mut ScriptedDice::new(vec![]));
        assert_eq!(next.as_deref(), Some("m-solo"));
    }

    #[test]
    fn natural_mention_beats_talkativeness() {
        let members = cast();
        let history = vec![msg(None, Role::User, "What do you think, Bob?", 1)];
        // Talkativeness draws all fail (1.0), uniform pick takes index 0.
        let mut dice = ScriptedDice::new(vec![1.0, 1.0, 1.0, 0.0]);
        let next = select_speaker(&input(ReplyOrder::Natural, &members, None, &history), &mut dice);
        assert_eq!(next.as_deref(), Some("m-bob"));
    }

    #[test]
    fn natural_mention_matches_any_name_word_case_insensitive() {
        let members = cast();
        let history = vec![msg(None, Role::User, "ask FAIRWEATHER about the storm.", 1)];
        let mut dice = ScriptedDice::new(vec![1.0, 1.0, 1.0, 0.0]);
        let next = select_speaker(&input(ReplyOrder::Natural, &members, None, &history), &mut dice);
        assert_eq!(next.as_deref(), Some("m-cleo"));
    }

    #[test]
    fn natural_talkativeness_draw_includes_candidates() {
        let members = cast();
        let history = vec![msg(None, Role::User, "anyone?", 1)];
        // Draws: alice 0.5 <= 0.9 pass, bob 0.5 > 0.1 fail, cleo 0.5 vs default 0.5 pass.
        // Then uniform 0.9 over [alice, cleo] -> cleo.
        let mut dice = ScriptedDice::new(vec![0.5, 0.5, 0.5, 0.9]);
        let next = select_speaker(&input(ReplyOrder::Natural, &members, None, &history), &mut dice);
        assert_eq!(next.as_deref(), Some("m-cleo"));
    }

    #[test]
    fn natural_excludes_previous_speaker() {
        let members = cast();
        let history = vec![msg(Some("m-alice"), Role::Assistant, "Alice Alice Alice", 1)];
        // Even though "Alice" is mentioned, she was the previous speaker.
        let mut dice = ScriptedDice::new(vec![1.0, 1.0, 0.0]);
        let next = select_speaker(
            &input(ReplyOrder::Natural, &members, Some("m-alice"), &history),
            &mut dice,
        );
        assert_ne!(next.as_deref(), Some("m-alice"));
    }

    #[test]
    fn natural_falls_back_to_rotation_when_nobody_talks() {
        let members = vec![
            member("m-a", "Aye", 0, Some(0.0)),
            member("m-b", "Bee", 1, Some(0.0)),
        ];
        let history = vec![msg(None, Role::User, "silence", 1)];
        let mut dice = ScriptedDice::new(vec![1.0, 1.0]);
        let next = select_speaker(
            &input(ReplyOrder::Natural, &members, Some("m-a"), &history),
            &mut dice,
        );
        assert_eq!(next.as_deref(), Some("m-b"));
    }

    #[test]
    fn pooled_excludes_epoch_speakers_and_drains() {
        let members = cast();
        let history = vec![
            msg(Some("m-alice"), Role::Assistant, "old turn", 1),
            msg(None, Role::User, "new epoch", 2),
            msg(Some("m-bob"), Role::Assistant, "spoken", 3),
        ];
        // Alice spoke before the epoch boundary, so she is still in the pool.
        let mut dice = ScriptedDice::new(vec![0.0]);
        let next = select_speaker(
            &input(ReplyOrder::Pooled, &members, Some("m-bob"), &history),
            &mut dice,
        );
        assert_eq!(next.as_deref(), Some("m-alice"));

        // Everyone has spoken in the epoch: the pool drains to None.
        let full = vec![
            msg(None, Role::User, "go", 1),
            msg(Some("m-alice"), Role::Assistant, "a", 2),
            msg(Some("m-bob"), Role::Assistant, "b", 3),
            msg(Some("m-cleo"), Role::Assistant, "c", 4),
        ];
        let mut dice = ScriptedDice::new(vec![0.0]);
        let next = select_speaker(
            &input(ReplyOrder::Pooled, &members, Some("m-cleo"), &full),
            &mut dice,
        );
        assert_eq!(next, None);
    }

    #[test]
    fn predicted_queue_shapes_per_strategy() {
        let members = cast();
        let empty: Vec<Message> = Vec::new();

        assert!(predicted_queue(&input(ReplyOrder::Manual, &members, None, &empty), 10).is_empty());

        let rotation = predicted_queue(
            &input(ReplyOrder::List, &members, Some("m-alice"), &empty),
            10,
        );
        assert_eq!(rotation, vec!["m-bob", "m-cleo"]);

        // Natural: talkativeness desc, then position (cleo defaults to 0.5).
        let natural = predicted_queue(&input(ReplyOrder::Natural, &members, None, &empty), 10);
        assert_eq!(natural, vec!["m-alice", "m-cleo", "m-bob"]);

        let history = vec![
            msg(None, Role::User, "go", 1),
            msg(Some("m-bob"), Role::Assistant, "b", 2),
        ];
        let pooled = predicted_queue(&input(ReplyOrder::Pooled, &members, None, &history), 10);
        assert_eq!(pooled, vec!["m-alice", "m-cleo"]);
    }
}
