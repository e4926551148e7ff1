/// 出席文档随机变更
///
/// 每个发布周期前调用一次，随机源由调用方注入，便于复现
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike};
use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

use super::document::{
    AudioPlace, PlaceIs, PresenceDocument, Sphere, TextPlace, UserInputState, VideoPlace,
    ACTIVITIES, MOODS, UNKNOWN,
};

pub const FALLBACK_NOTE: &str = "Fortune is not installed";

const STATUS_ICON_BASE: &str = "http://sipsimpleclient.com/chrome/site/StatusIcons";

/// `fortune` 最长运行时间，超时按不可用处理
pub const FORTUNE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

static NOTE_SEPARATOR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n|\t").ok());

/// 外部随机文本来源（便签内容）
#[async_trait]
pub trait NoteSource: Send + Sync {
    /// 不可用时返回 None
    async fn random_note(&self) -> Option<String>;
}

/// 调用本机 `fortune` 程序
#[derive(Debug, Clone)]
pub struct FortuneNoteSource {
    program: String,
    args: Vec<String>,
    timeout: std::time::Duration,
}

impl Default for FortuneNoteSource {
    fn default() -> Self {
        Self {
            program: "fortune".to_string(),
            args: Vec::new(),
            timeout: FORTUNE_TIMEOUT,
        }
    }
}

#[async_trait]
impl NoteSource for FortuneNoteSource {
    async fn random_note(&self) -> Option<String> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!("{} exited with {}", self.program, output.status);
                return None;
            }
            Ok(Err(e)) => {
                debug!("无法运行 {}: {}", self.program, e);
                return None;
            }
            Err(_) => {
                debug!("{} 超过 {:?} 未返回", self.program, self.timeout);
                return None;
            }
        };
        normalize_note(&String::from_utf8_lossy(&output.stdout))
    }
}

/// 固定内容，None 表示不可用
#[derive(Debug, Clone, Default)]
pub struct FixedNoteSource(pub Option<String>);

#[async_trait]
impl NoteSource for FixedNoteSource {
    async fn random_note(&self) -> Option<String> {
        self.0.clone()
    }
}

/// 换行和制表符折叠为单个空格
pub fn normalize_note(raw: &str) -> Option<String> {
    let parts: Vec<&str> = match NOTE_SEPARATOR.as_ref() {
        Some(separator) => separator.split(raw).collect(),
        None => raw.split(['\n', '\t']).collect(),
    };
    let note = parts
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if note.trim().is_empty() {
        None
    } else {
        Some(note)
    }
}

/// 各项随机变更的概率
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationPolicy {
    pub status_toggle: f64,
    pub place_change: f64,
    pub user_input_flip: f64,
}

impl Default for MutationPolicy {
    fn default() -> Self {
        Self {
            status_toggle: 0.5,
            place_change: 0.5,
            user_input_flip: 0.5,
        }
    }
}

pub struct PresenceMutator<R> {
    rng: R,
    policy: MutationPolicy,
}

impl<R: Rng> PresenceMutator<R> {
    pub fn new(rng: R) -> Self {
        Self::with_policy(rng, MutationPolicy::default())
    }

    pub fn with_policy(rng: R, policy: MutationPolicy) -> Self {
        let policy = MutationPolicy {
            status_toggle: policy.status_toggle.clamp(0.0, 1.0),
            place_change: policy.place_change.clamp(0.0, 1.0),
            user_input_flip: policy.user_input_flip.clamp(0.0, 1.0),
        };
        Self { rng, policy }
    }

    /// 原地修改文档的状态字段；实体和元素 id 不变
    ///
    /// `note` 由调用方事先从 [`NoteSource`] 取得，None 时使用 [`FALLBACK_NOTE`]
    pub fn mutate(
        &mut self,
        document: &mut PresenceDocument,
        now: DateTime<FixedOffset>,
        note: Option<String>,
    ) {
        let policy = self.policy;

        let service = document.main_service_mut();
        if self.rng.random_bool(policy.status_toggle) {
            service.status = service.status.toggled();
            service.timestamp = now;
        }

        let icon = if self.rng.random_bool(0.5) { "available" } else { "busy" };
        let note = note.unwrap_or_else(|| FALLBACK_NOTE.to_string());
        let activities = self.sample_without_unknown(ACTIVITIES);
        let mood = self.sample_without_unknown(MOODS);

        let person = document.person_mut();
        person.sphere = Some(sphere_at(&now));
        person.privacy.audio = self.rng.random_bool(0.5);
        person.privacy.text = self.rng.random_bool(0.5);
        person.privacy.video = self.rng.random_bool(0.5);
        person.status_icon = Some(format!("{}/{}.png", STATUS_ICON_BASE, icon));
        person.note = Some(note);
        person.activities = Some(activities);
        person.mood = Some(mood);

        let place = person.place_is.get_or_insert_with(PlaceIs::default);
        if self.rng.random_bool(policy.place_change) {
            place.audio = Some(pick(&mut self.rng, AudioPlace::ALL));
        }
        if self.rng.random_bool(policy.place_change) {
            place.video = Some(pick(&mut self.rng, VideoPlace::ALL));
        }
        if self.rng.random_bool(policy.place_change) {
            place.text = Some(pick(&mut self.rng, TextPlace::ALL));
        }
        person.timestamp = now;

        let user_input = &mut document.device_mut().user_input;
        if self.rng.random_bool(policy.user_input_flip) {
            match user_input.value {
                UserInputState::Idle => {
                    user_input.value = UserInputState::Active;
                    user_input.last_input = None;
                }
                UserInputState::Active => {
                    user_input.value = UserInputState::Idle;
                    user_input.last_input = Some(now - Duration::seconds(30));
                }
            }
        }
    }

    /// 1 到 2 个值，不放回抽样，排除 unknown
    fn sample_without_unknown(&mut self, values: &[&'static str]) -> Vec<&'static str> {
        let mut candidates: Vec<&'static str> =
            values.iter().copied().filter(|v| *v != UNKNOWN).collect();
        let count = self.rng.random_range(1..=2usize).min(candidates.len());
        let mut chosen = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = self.rng.random_range(0..candidates.len());
            chosen.push(candidates.remove(idx));
        }
        chosen
    }
}

fn pick<R: Rng, T: Copy>(rng: &mut R, values: &[T]) -> T {
    values[rng.random_range(0..values.len())]
}

/// 工作日 9:00-18:00 为 work，其余为 home
pub fn sphere_at(now: &DateTime<FixedOffset>) -> Sphere {
    let weekday = now.weekday().number_from_monday();
    let hour = now.hour();
    if weekday > 5 || !(9..18).contains(&hour) {
        return Sphere::Home;
    }

    let date = now.date_naive();
    let offset = *now.offset();
    let window = date
        .and_hms_opt(9, 0, 0)
        .zip(date.and_hms_opt(18, 0, 0))
        .and_then(|(since, until)| {
            Some((
                since.and_local_timezone(offset).single()?,
                until.and_local_timezone(offset).single()?,
            ))
        });

    match window {
        Some((since, until)) => Sphere::Work { since, until },
        None => Sphere::Home,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::document::{BasicStatus, ElementIds};
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
    }

    fn document() -> PresenceDocument {
        PresenceDocument::with_ids(
            "alice@example.com",
            "UA",
            at(2024, 5, 15, 8, 0),
            ElementIds {
                main_service: "aaaaaaaa".into(),
                email_service: "bbbbbbbb".into(),
                person: "cccccccc".into(),
                device: "dddddddd".into(),
            },
        )
    }

    fn mutator(seed: u64) -> PresenceMutator<StdRng> {
        PresenceMutator::new(StdRng::seed_from_u64(seed))
    }

    fn hello() -> Option<String> {
        Some("hello".into())
    }

    #[test]
    fn test_sphere_on_weekday_work_hours() {
        // 2024-05-15 is a Wednesday
        let now = at(2024, 5, 15, 10, 0);
        assert_eq!(
            sphere_at(&now),
            Sphere::Work {
                since: at(2024, 5, 15, 9, 0),
                until: at(2024, 5, 15, 18, 0),
            }
        );
    }

    #[test]
    fn test_sphere_on_weekend_and_evenings() {
        // Saturday
        assert_eq!(sphere_at(&at(2024, 5, 18, 10, 0)), Sphere::Home);
        assert_eq!(sphere_at(&at(2024, 5, 15, 18, 0)), Sphere::Home);
        assert_eq!(sphere_at(&at(2024, 5, 15, 8, 59)), Sphere::Home);
    }

    #[test]
    fn test_mutation_is_reproducible() {
        let now = at(2024, 5, 15, 10, 0);
        let mut first = document();
        let mut second = document();
        mutator(42).mutate(&mut first, now, hello());
        mutator(42).mutate(&mut second, now, hello());
        assert_eq!(first, second);
        assert_eq!(first.to_pidf().unwrap(), second.to_pidf().unwrap());
    }

    #[test]
    fn test_identity_is_preserved() {
        let mut doc = document();
        let mut m = mutator(1);
        for i in 0..20 {
            m.mutate(&mut doc, at(2024, 5, 15, 10, i), hello());
        }
        assert_eq!(doc.entity(), "sip:alice@example.com");
        assert_eq!(doc.main_service().id(), "aaaaaaaa");
        assert_eq!(doc.email_service().id(), "bbbbbbbb");
        assert_eq!(doc.person().id(), "cccccccc");
        assert_eq!(doc.device().id(), "dddddddd");
    }

    #[test]
    fn test_mood_and_activities_exclude_unknown() {
        let mut doc = document();
        let mut m = mutator(9);
        for _ in 0..200 {
            m.mutate(&mut doc, at(2024, 5, 15, 10, 0), hello());
            let person = doc.person();
            for values in [person.activities.as_ref().unwrap(), person.mood.as_ref().unwrap()] {
                assert!((1..=2).contains(&values.len()));
                assert!(!values.contains(&UNKNOWN));
            }
            assert!(doc.validate().is_ok());
        }
    }

    #[test]
    fn test_note_falls_back_when_unavailable() {
        let mut doc = document();
        let mut m = PresenceMutator::new(StdRng::seed_from_u64(5));
        m.mutate(&mut doc, at(2024, 5, 18, 10, 0), None);
        assert_eq!(doc.person().note.as_deref(), Some(FALLBACK_NOTE));
        assert!(doc.person().place_is.is_some());
    }

    #[test]
    fn test_forced_flips() {
        let policy = MutationPolicy {
            status_toggle: 1.0,
            place_change: 1.0,
            user_input_flip: 1.0,
        };
        let now = at(2024, 5, 15, 10, 0);
        let mut doc = document();
        let mut m = PresenceMutator::with_policy(StdRng::seed_from_u64(3), policy);

        m.mutate(&mut doc, now, None);
        assert_eq!(doc.main_service().status, BasicStatus::Closed);
        assert_eq!(doc.main_service().timestamp, now);
        assert_eq!(doc.device().user_input.value, UserInputState::Idle);
        assert_eq!(doc.device().user_input.last_input, Some(now - Duration::seconds(30)));
        let place = doc.person().place_is.unwrap();
        assert!(place.audio.is_some() && place.video.is_some() && place.text.is_some());

        m.mutate(&mut doc, now, None);
        assert_eq!(doc.main_service().status, BasicStatus::Open);
        assert_eq!(doc.device().user_input.value, UserInputState::Active);
        assert_eq!(doc.device().user_input.last_input, None);
    }

    #[test]
    fn test_no_flips() {
        let policy = MutationPolicy {
            status_toggle: 0.0,
            place_change: 0.0,
            user_input_flip: 0.0,
        };
        let mut doc = document();
        let mut m = PresenceMutator::with_policy(StdRng::seed_from_u64(3), policy);
        m.mutate(&mut doc, at(2024, 5, 15, 10, 0), None);
        assert_eq!(doc.main_service().status, BasicStatus::Open);
        assert_eq!(doc.device().user_input.value, UserInputState::Active);
        assert_eq!(doc.person().place_is, Some(PlaceIs::default()));
    }

    #[test]
    fn test_normalize_note() {
        assert_eq!(
            normalize_note("Line one\n\tindented\n\n").as_deref(),
            Some("Line one indented")
        );
        assert_eq!(normalize_note("\n\n"), None);
    }

    #[test]
    fn test_normalize_note_repeatedly() {
        for i in 0..100 {
            let raw = format!("fortune {}\n\tsays hi", i);
            assert_eq!(normalize_note(&raw), Some(format!("fortune {} says hi", i)));
        }
    }

    #[tokio::test]
    async fn test_missing_fortune_program_is_unavailable() {
        let source = FortuneNoteSource {
            program: "/nonexistent/fortune-for-tests".to_string(),
            args: Vec::new(),
            timeout: FORTUNE_TIMEOUT,
        };
        assert_eq!(source.random_note().await, None);
    }

    #[tokio::test]
    async fn test_hung_fortune_program_times_out() {
        let source = FortuneNoteSource {
            program: "sleep".to_string(),
            args: vec!["10".to_string()],
            timeout: std::time::Duration::from_millis(100),
        };
        let started = std::time::Instant::now();
        assert_eq!(source.random_note().await, None);
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_fixed_note_source() {
        assert_eq!(FixedNoteSource(hello()).random_note().await, hello());
        assert_eq!(FixedNoteSource(None).random_note().await, None);
    }
}
