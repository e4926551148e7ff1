/// Presence 模块
///
/// - `PresenceDocument`: PIDF/RPID 文档，启动时构造一次
/// - `PresenceMutator`: 每个发布周期前随机修改文档
/// - `NoteSource`: 便签文本来源（`fortune` 或固定内容）

mod document;
mod mutator;

pub use document::{
    AudioPlace, BasicStatus, Device, ElementIds, Person, PlaceIs, PresenceDocument, Privacy,
    Service, Sphere, TextPlace, UserInput, UserInputState, VideoPlace, ACTIVITIES, MOODS,
    PIDF_CONTENT_TYPE, UNKNOWN,
};
pub use mutator::{
    normalize_note, sphere_at, FixedNoteSource, FortuneNoteSource, MutationPolicy, NoteSource,
    PresenceMutator, FALLBACK_NOTE, FORTUNE_TIMEOUT,
};
