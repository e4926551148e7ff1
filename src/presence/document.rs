//! PIDF / RPID presence document (RFC 3863, RFC 4479, RFC 4480).
//!
//! The document is built once per account. Element ids and the entity are
//! fixed at construction; only status and content fields change afterwards.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use std::collections::HashSet;

use crate::error::DocumentError;
use crate::utils::random_element_id;

pub const PIDF_CONTENT_TYPE: &str = "application/pidf+xml";

const NS_PIDF: &str = "urn:ietf:params:xml:ns:pidf";
const NS_DM: &str = "urn:ietf:params:xml:ns:pidf:data-model";
const NS_RPID: &str = "urn:ietf:params:xml:ns:pidf:rpid";

/// RPID activity 取值，`unknown` 在最后
pub const ACTIVITIES: &[&str] = &[
    "appointment",
    "away",
    "breakfast",
    "busy",
    "dinner",
    "holiday",
    "in-transit",
    "looking-for-work",
    "meal",
    "meeting",
    "on-the-phone",
    "performance",
    "permanent-absence",
    "playing",
    "presentation",
    "shopping",
    "sleeping",
    "spectator",
    "steering",
    "travel",
    "tv",
    "vacation",
    "working",
    "worship",
    "unknown",
];

/// RPID mood 取值，`unknown` 在最后
pub const MOODS: &[&str] = &[
    "afraid",
    "amazed",
    "angry",
    "annoyed",
    "anxious",
    "ashamed",
    "bored",
    "brave",
    "calm",
    "cold",
    "confused",
    "contented",
    "cranky",
    "curious",
    "depressed",
    "disappointed",
    "disgusted",
    "distracted",
    "embarrassed",
    "excited",
    "flirtatious",
    "frustrated",
    "grumpy",
    "guilty",
    "happy",
    "hot",
    "humbled",
    "humiliated",
    "hungry",
    "hurt",
    "impressed",
    "in_awe",
    "in_love",
    "indignant",
    "interested",
    "invincible",
    "jealous",
    "lonely",
    "mean",
    "moody",
    "nervous",
    "neutral",
    "offended",
    "playful",
    "proud",
    "relieved",
    "remorseful",
    "restless",
    "sad",
    "sarcastic",
    "serious",
    "shocked",
    "shy",
    "sick",
    "sleepy",
    "stressed",
    "surprised",
    "thirsty",
    "worried",
    "unknown",
];

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicStatus {
    Open,
    Closed,
}

impl BasicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasicStatus::Open => "open",
            BasicStatus::Closed => "closed",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            BasicStatus::Open => BasicStatus::Closed,
            BasicStatus::Closed => BasicStatus::Open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sphere {
    Home,
    Work {
        since: DateTime<FixedOffset>,
        until: DateTime<FixedOffset>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Privacy {
    pub audio: bool,
    pub text: bool,
    pub video: bool,
}

macro_rules! place_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }
    };
}

place_enum!(AudioPlace {
    Noisy => "noisy",
    Ok => "ok",
    Quiet => "quiet",
    Unknown => "unknown",
});

place_enum!(VideoPlace {
    TooBright => "toobright",
    Ok => "ok",
    Dark => "dark",
    Unknown => "unknown",
});

place_enum!(TextPlace {
    Uncomfortable => "uncomfortable",
    Inappropriate => "inappropriate",
    Ok => "ok",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceIs {
    pub audio: Option<AudioPlace>,
    pub video: Option<VideoPlace>,
    pub text: Option<TextPlace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInputState {
    Active,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInput {
    pub value: UserInputState,
    pub last_input: Option<DateTime<FixedOffset>>,
}

impl Default for UserInput {
    fn default() -> Self {
        Self {
            value: UserInputState::Active,
            last_input: None,
        }
    }
}

/// `<tuple>`：联系出席实体的一种方式
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    id: String,
    contact: String,
    priority: f32,
    pub status: BasicStatus,
    pub timestamp: DateTime<FixedOffset>,
}

impl Service {
    fn new(id: String, contact: String, priority: f32, now: DateTime<FixedOffset>) -> Self {
        Self {
            id,
            contact,
            priority,
            status: BasicStatus::Open,
            timestamp: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }
}

/// `<dm:person>`：富出席信息字段
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    id: String,
    pub sphere: Option<Sphere>,
    pub privacy: Privacy,
    pub status_icon: Option<String>,
    pub note: Option<String>,
    pub activities: Option<Vec<&'static str>>,
    pub mood: Option<Vec<&'static str>>,
    pub place_is: Option<PlaceIs>,
    pub time_offset: i32,
    pub timestamp: DateTime<FixedOffset>,
}

impl Person {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// `<dm:device>`：发布方用户代理
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    id: String,
    note: String,
    pub user_input: UserInput,
    pub timestamp: DateTime<FixedOffset>,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn note(&self) -> &str {
        &self.note
    }
}

/// 元素 id，通常为 8 个随机小写字母
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementIds {
    pub main_service: String,
    pub email_service: String,
    pub person: String,
    pub device: String,
}

impl ElementIds {
    pub fn random() -> Self {
        Self {
            main_service: random_element_id(),
            email_service: random_element_id(),
            person: random_element_id(),
            device: random_element_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceDocument {
    entity: String,
    main_service: Service,
    email_service: Service,
    person: Person,
    device: Device,
}

impl PresenceDocument {
    /// `account` 为不带 `sip:` 的 `user@domain`
    pub fn new(account: &str, user_agent: &str, now: DateTime<FixedOffset>) -> Self {
        Self::with_ids(account, user_agent, now, ElementIds::random())
    }

    pub fn with_ids(
        account: &str,
        user_agent: &str,
        now: DateTime<FixedOffset>,
        ids: ElementIds,
    ) -> Self {
        Self {
            entity: format!("sip:{}", account),
            main_service: Service::new(ids.main_service, format!("sip:{}", account), 0.0, now),
            email_service: Service::new(ids.email_service, format!("mailto:{}", account), 0.5, now),
            person: Person {
                id: ids.person,
                sphere: None,
                privacy: Privacy::default(),
                status_icon: None,
                note: None,
                activities: None,
                mood: None,
                place_is: None,
                time_offset: now.offset().local_minus_utc() / 60,
                timestamp: now,
            },
            device: Device {
                id: ids.device,
                note: format!("Powered by {}", user_agent),
                user_input: UserInput::default(),
                timestamp: now,
            },
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn main_service(&self) -> &Service {
        &self.main_service
    }

    pub fn main_service_mut(&mut self) -> &mut Service {
        &mut self.main_service
    }

    pub fn email_service(&self) -> &Service {
        &self.email_service
    }

    pub fn person(&self) -> &Person {
        &self.person
    }

    pub fn person_mut(&mut self) -> &mut Person {
        &mut self.person
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// 校验后序列化为 `application/pidf+xml`
    pub fn to_pidf(&self) -> Result<Vec<u8>, DocumentError> {
        self.validate()?;
        Ok(self.to_xml().into_bytes())
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.entity.trim().is_empty() || self.entity == "sip:" {
            return Err(DocumentError::EmptyEntity);
        }
        if let Some(values) = &self.person.activities {
            check_unique("activities", values)?;
        }
        if let Some(values) = &self.person.mood {
            check_unique("mood", values)?;
        }
        if let Some(Sphere::Work { since, until }) = &self.person.sphere {
            if until < since {
                return Err(DocumentError::InvertedSphereWindow);
            }
        }
        if let Some(note) = &self.person.note {
            check_xml_chars("person note", note)?;
        }
        if let Some(icon) = &self.person.status_icon {
            check_xml_chars("status-icon", icon)?;
        }
        check_xml_chars("device note", &self.device.note)?;
        check_xml_chars("entity", &self.entity)
    }

    fn to_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<presence xmlns=\"{}\" xmlns:dm=\"{}\" xmlns:rpid=\"{}\" entity=\"{}\">\n",
            NS_PIDF,
            NS_DM,
            NS_RPID,
            xml_escape(&self.entity)
        ));
        write_service(&mut xml, &self.main_service);
        write_service(&mut xml, &self.email_service);
        write_person(&mut xml, &self.person);
        write_device(&mut xml, &self.device);
        xml.push_str("</presence>\n");
        xml
    }
}

fn write_service(xml: &mut String, service: &Service) {
    xml.push_str(&format!("  <tuple id=\"{}\">\n", xml_escape(&service.id)));
    xml.push_str(&format!(
        "    <status><basic>{}</basic></status>\n",
        service.status.as_str()
    ));
    xml.push_str("    <rpid:relationship><rpid:self/></rpid:relationship>\n");
    xml.push_str(&format!(
        "    <contact priority=\"{}\">{}</contact>\n",
        service.priority,
        xml_escape(&service.contact)
    ));
    xml.push_str(&format!("    <timestamp>{}</timestamp>\n", timestamp(&service.timestamp)));
    xml.push_str("  </tuple>\n");
}

fn write_person(xml: &mut String, person: &Person) {
    xml.push_str(&format!("  <dm:person id=\"{}\">\n", xml_escape(&person.id)));

    if let Some(activities) = &person.activities {
        xml.push_str("    <rpid:activities>");
        for value in activities {
            xml.push_str(&format!("<rpid:{}/>", value));
        }
        xml.push_str("</rpid:activities>\n");
    }

    if let Some(mood) = &person.mood {
        xml.push_str("    <rpid:mood>");
        for value in mood {
            xml.push_str(&format!("<rpid:{}/>", value));
        }
        xml.push_str("</rpid:mood>\n");
    }

    if let Some(place) = &person.place_is {
        xml.push_str("    <rpid:place-is>");
        if let Some(audio) = place.audio {
            xml.push_str(&format!("<rpid:audio><rpid:{}/></rpid:audio>", audio.as_str()));
        }
        if let Some(video) = place.video {
            xml.push_str(&format!("<rpid:video><rpid:{}/></rpid:video>", video.as_str()));
        }
        if let Some(text) = place.text {
            xml.push_str(&format!("<rpid:text><rpid:{}/></rpid:text>", text.as_str()));
        }
        xml.push_str("</rpid:place-is>\n");
    }

    xml.push_str("    <rpid:privacy>");
    if person.privacy.audio {
        xml.push_str("<rpid:audio/>");
    }
    if person.privacy.text {
        xml.push_str("<rpid:text/>");
    }
    if person.privacy.video {
        xml.push_str("<rpid:video/>");
    }
    xml.push_str("</rpid:privacy>\n");

    match &person.sphere {
        Some(Sphere::Home) => xml.push_str("    <rpid:sphere><rpid:home/></rpid:sphere>\n"),
        Some(Sphere::Work { since, until }) => xml.push_str(&format!(
            "    <rpid:sphere from=\"{}\" until=\"{}\"><rpid:work/></rpid:sphere>\n",
            timestamp(since),
            timestamp(until)
        )),
        None => {}
    }

    if let Some(icon) = &person.status_icon {
        xml.push_str(&format!("    <rpid:status-icon>{}</rpid:status-icon>\n", xml_escape(icon)));
    }

    xml.push_str(&format!("    <rpid:time-offset>{}</rpid:time-offset>\n", person.time_offset));

    if let Some(note) = &person.note {
        xml.push_str(&format!("    <dm:note xml:lang=\"en\">{}</dm:note>\n", xml_escape(note)));
    }
    xml.push_str(&format!("    <dm:timestamp>{}</dm:timestamp>\n", timestamp(&person.timestamp)));
    xml.push_str("  </dm:person>\n");
}

fn write_device(xml: &mut String, device: &Device) {
    xml.push_str(&format!("  <dm:device id=\"{}\">\n", xml_escape(&device.id)));
    let value = match device.user_input.value {
        UserInputState::Active => "active",
        UserInputState::Idle => "idle",
    };
    match &device.user_input.last_input {
        Some(last) => xml.push_str(&format!(
            "    <rpid:user-input last-input=\"{}\">{}</rpid:user-input>\n",
            timestamp(last),
            value
        )),
        None => xml.push_str(&format!("    <rpid:user-input>{}</rpid:user-input>\n", value)),
    }
    xml.push_str(&format!(
        "    <dm:note xml:lang=\"en\">{}</dm:note>\n",
        xml_escape(&device.note)
    ));
    xml.push_str(&format!("    <dm:timestamp>{}</dm:timestamp>\n", timestamp(&device.timestamp)));
    xml.push_str("  </dm:device>\n");
}

fn timestamp(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn check_unique(element: &'static str, values: &[&'static str]) -> Result<(), DocumentError> {
    let mut seen = HashSet::new();
    for value in values {
        if !seen.insert(*value) {
            return Err(DocumentError::DuplicateValue {
                element,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

fn check_xml_chars(element: &'static str, value: &str) -> Result<(), DocumentError> {
    let invalid = value
        .chars()
        .any(|c| ((c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r')) || matches!(c, '\u{FFFE}' | '\u{FFFF}'));
    if invalid {
        Err(DocumentError::InvalidCharacters { element })
    } else {
        Ok(())
    }
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
