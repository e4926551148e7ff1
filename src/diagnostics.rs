/// 运行时诊断开关
///
/// 两个开关可在运行中通过按键切换，读取方每次使用时重新读取
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

pub const HELP_TEXT: &str = "\
Available keys:
  t  toggle SIP message tracing
  n  toggle notification tracing
  ?  show this help
  q  unpublish and exit";

#[derive(Debug, Default)]
pub struct DiagnosticFlags {
    trace_sip: AtomicBool,
    trace_notifications: AtomicBool,
}

impl DiagnosticFlags {
    pub fn new(trace_sip: bool, trace_notifications: bool) -> Self {
        Self {
            trace_sip: AtomicBool::new(trace_sip),
            trace_notifications: AtomicBool::new(trace_notifications),
        }
    }

    pub fn trace_sip(&self) -> bool {
        self.trace_sip.load(Ordering::Relaxed)
    }

    pub fn trace_notifications(&self) -> bool {
        self.trace_notifications.load(Ordering::Relaxed)
    }

    /// 返回切换后的值
    pub fn toggle_trace_sip(&self) -> bool {
        !self.trace_sip.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn toggle_trace_notifications(&self) -> bool {
        !self.trace_notifications.fetch_xor(true, Ordering::Relaxed)
    }
}

/// 按键对应的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Toggled,
    Help,
    Quit,
    Ignored,
}

/// 处理一个按键
pub fn handle_key(flags: &DiagnosticFlags, key: char) -> KeyAction {
    match key.to_ascii_lowercase() {
        't' => {
            let on = flags.toggle_trace_sip();
            info!("SIP tracing is now {}", if on { "on" } else { "off" });
            KeyAction::Toggled
        }
        'n' => {
            let on = flags.toggle_trace_notifications();
            info!("Notification tracing is now {}", if on { "on" } else { "off" });
            KeyAction::Toggled
        }
        '?' | 'h' => KeyAction::Help,
        'q' => KeyAction::Quit,
        _ => KeyAction::Ignored,
    }
}

/// 处理一行输入，返回第一个有意义的动作
pub fn handle_line(flags: &DiagnosticFlags, line: &str) -> KeyAction {
    let mut result = KeyAction::Ignored;
    for key in line.chars().filter(|c| !c.is_whitespace()) {
        match handle_key(flags, key) {
            KeyAction::Quit => return KeyAction::Quit,
            KeyAction::Ignored => {}
            action => {
                if result == KeyAction::Ignored {
                    result = action;
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_flags() {
        let flags = DiagnosticFlags::new(false, true);
        assert_eq!(handle_key(&flags, 't'), KeyAction::Toggled);
        assert!(flags.trace_sip());
        assert_eq!(handle_key(&flags, 'N'), KeyAction::Toggled);
        assert!(!flags.trace_notifications());
        assert_eq!(handle_key(&flags, 't'), KeyAction::Toggled);
        assert!(!flags.trace_sip());
    }

    #[test]
    fn test_handle_line() {
        let flags = DiagnosticFlags::default();
        assert_eq!(handle_line(&flags, "?\n"), KeyAction::Help);
        assert_eq!(handle_line(&flags, "tq"), KeyAction::Quit);
        assert!(flags.trace_sip());
        assert_eq!(handle_line(&flags, "  x "), KeyAction::Ignored);
    }
}
