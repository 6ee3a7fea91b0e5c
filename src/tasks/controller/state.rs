use std::time::{Duration, Instant};

use crate::history::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Home,
    Scanning,
    Revealing,
    Result,
    HistoryList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenChange {
    pub from: Screen,
    pub to: Screen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
    pub expires_at: Instant,
}

/// Screen navigation, the selected entry and the transient error toast.
///
/// Pure bookkeeping; scanning, lookups and history writes are driven by the controller.
pub struct ScreenSM {
    screen: Screen,
    selected: Option<HistoryEntry>,
    result_return: Screen,
    toast: Option<Toast>,
    error_display: Duration,
}

impl ScreenSM {
    pub fn new(error_display: Duration) -> Self {
        Self {
            screen: Screen::Home,
            selected: None,
            result_return: Screen::Home,
            toast: None,
            error_display,
        }
    }

    pub fn current(&self) -> Screen {
        self.screen
    }

    pub fn selected(&self) -> Option<&HistoryEntry> {
        self.selected.as_ref()
    }

    pub fn toast(&self) -> Option<&Toast> {
        self.toast.as_ref()
    }

    pub fn error_deadline(&self) -> Option<Instant> {
        self.toast.as_ref().map(|toast| toast.expires_at)
    }

    pub fn on_scan_requested(&mut self) -> Option<ScreenChange> {
        if self.screen == Screen::Home {
            return self.goto(Screen::Scanning);
        }
        None
    }

    /// Scanning ended, by a decode, a failure or the user.
    pub fn on_scan_finished(&mut self) -> Option<ScreenChange> {
        if self.screen == Screen::Scanning {
            return self.goto(Screen::Home);
        }
        None
    }

    pub fn on_reveal_started(&mut self) -> Option<ScreenChange> {
        if self.screen == Screen::Home {
            return self.goto(Screen::Revealing);
        }
        None
    }

    pub fn on_reveal_finished(&mut self, entry: HistoryEntry) -> Option<ScreenChange> {
        if self.screen != Screen::Revealing {
            return None;
        }
        self.selected = Some(entry);
        self.result_return = Screen::Home;
        self.goto(Screen::Result)
    }

    pub fn on_history_requested(&mut self) -> Option<ScreenChange> {
        match self.screen {
            Screen::Home | Screen::Result | Screen::HistoryList => self.goto(Screen::HistoryList),
            Screen::Scanning | Screen::Revealing => None,
        }
    }

    pub fn on_entry_selected(&mut self, entry: HistoryEntry) -> Option<ScreenChange> {
        if self.screen != Screen::HistoryList {
            return None;
        }
        self.selected = Some(entry);
        self.result_return = Screen::HistoryList;
        self.goto(Screen::Result)
    }

    pub fn on_back(&mut self) -> Option<ScreenChange> {
        match self.screen {
            Screen::Result => self.goto(self.result_return),
            Screen::HistoryList => self.goto(Screen::Home),
            Screen::Home | Screen::Scanning | Screen::Revealing => None,
        }
    }

    /// History was wiped; nothing that shows an entry may stay on screen.
    pub fn on_history_cleared(&mut self) -> Option<ScreenChange> {
        self.selected = None;
        self.result_return = Screen::Home;
        match self.screen {
            Screen::Result | Screen::HistoryList => self.goto(Screen::Home),
            _ => None,
        }
    }

    /// Show `message` until `now + error_display`, replacing any current toast.
    pub fn raise_error(&mut self, message: impl Into<String>, now: Instant) {
        self.toast = Some(Toast {
            message: message.into(),
            expires_at: now + self.error_display,
        });
    }

    pub fn clear_error(&mut self) -> bool {
        self.toast.take().is_some()
    }

    /// Drop an expired toast. Returns whether anything changed.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        match &self.toast {
            Some(toast) if now >= toast.expires_at => {
                self.toast = None;
                true
            }
            _ => false,
        }
    }

    fn goto(&mut self, to: Screen) -> Option<ScreenChange> {
        if self.screen == to {
            return None;
        }
        let ch = ScreenChange {
            from: self.screen,
            to,
        };
        self.screen = to;
        Some(ch)
    }
}
