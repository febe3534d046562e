//! Terminal implementations of the host collaborators.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::terminal::{self, ClearType};
use crossterm::{cursor, event, execute, style};
use serde_json::Value;
use tracing::{debug, warn};

use dlg_core::{InputLock, MessageSurface, RenderSurface, SlotId, SwitchStore, VariableStore};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Line ending for terminal output. Raw mode needs an explicit carriage return.
fn line_ending() -> &'static str {
    if terminal::is_raw_mode_enabled().unwrap_or(false) {
        "\r\n"
    } else {
        "\n"
    }
}

fn to_terminal(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', line_ending())
}

/// Variables kept in memory and written through to a JSON file.
pub struct FileVariableStore {
    path: Option<PathBuf>,
    values: Mutex<HashMap<SlotId, Value>>,
}

impl FileVariableStore {
    /// Open the store at `path`. A missing file starts empty.
    pub fn open(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read variables file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid variables file: {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
        })
    }

    /// A store that never touches the disk.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            values: Mutex::new(HashMap::new()),
        }
    }

    pub fn remove(&self, id: &SlotId) {
        let mut values = guard(&self.values);
        values.remove(id);
        self.persist(&values);
    }

    pub fn snapshot(&self) -> Vec<(SlotId, Value)> {
        let mut entries: Vec<_> = guard(&self.values)
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn persist(&self, values: &HashMap<SlotId, Value>) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_string_pretty(values)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to persist variables to {}: {}", path.display(), e);
        }
    }
}

impl VariableStore for FileVariableStore {
    fn get(&self, id: &SlotId) -> Option<Value> {
        guard(&self.values).get(id).cloned()
    }

    fn set(&self, id: &SlotId, value: Value) {
        let mut values = guard(&self.values);
        values.insert(id.clone(), value);
        self.persist(&values);
    }
}

/// Switches seeded from the config file and toggled from the prompt.
#[derive(Default)]
pub struct ConfigSwitches {
    values: Mutex<HashMap<SlotId, bool>>,
}

impl ConfigSwitches {
    pub fn new(initial: &HashMap<String, bool>) -> Self {
        let values = initial
            .iter()
            .map(|(id, on)| (SlotId::from(id.as_str()), *on))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }

    pub fn set(&self, id: &SlotId, on: bool) {
        guard(&self.values).insert(id.clone(), on);
    }
}

impl SwitchStore for ConfigSwitches {
    fn get(&self, id: &SlotId) -> bool {
        guard(&self.values).get(id).copied().unwrap_or(false)
    }
}

/// Scroll state of the answer area.
///
/// The first `viewport` lines of an answer print immediately; anything past
/// that is held back until the view is scrolled to the end.
#[derive(Debug, Clone, Default)]
struct ScrollState {
    /// Lines visible before holding back. 0 = unbounded.
    viewport: usize,
    /// Lines printed for the current answer
    printed_lines: usize,
    /// Output waiting for a scroll
    pending: String,
    /// Next indicator frame, while nothing of the answer has arrived
    waiting: Option<usize>,
}

const INDICATOR_FRAMES: [&str; 3] = ["・", "・・", "・・・"];

impl ScrollState {
    fn new(viewport: usize) -> Self {
        Self {
            viewport,
            ..Self::default()
        }
    }

    fn reset(&mut self) {
        self.printed_lines = 0;
        self.pending.clear();
        self.waiting = None;
    }

    fn start_waiting(&mut self) {
        self.waiting = Some(0);
    }

    fn next_indicator(&mut self) -> Option<&'static str> {
        let frame = self.waiting?;
        self.waiting = Some(frame + 1);
        Some(INDICATOR_FRAMES[frame % INDICATOR_FRAMES.len()])
    }

    /// Whether the indicator was showing.
    fn stop_waiting(&mut self) -> bool {
        self.waiting.take().is_some()
    }

    fn is_at_end(&self) -> bool {
        self.pending.is_empty()
    }

    /// Split `text` into the part that fits the viewport and hold the rest.
    fn admit(&mut self, text: &str) -> String {
        if self.viewport == 0 {
            return text.to_string();
        }
        if !self.pending.is_empty() {
            self.pending.push_str(text);
            return String::new();
        }

        let mut visible = String::new();
        for (i, ch) in text.char_indices() {
            if ch == '\n' {
                if self.printed_lines + 1 >= self.viewport {
                    self.pending.push_str(&text[i..]);
                    break;
                }
                self.printed_lines += 1;
            }
            visible.push(ch);
        }
        visible
    }

    fn take_pending(&mut self) -> String {
        self.printed_lines = 0;
        std::mem::take(&mut self.pending)
    }
}

/// Live answer area on stdout.
pub struct TerminalSurface {
    scroll: Mutex<ScrollState>,
    /// Animate a waiting indicator until the first fragment arrives.
    indicator: bool,
}

impl TerminalSurface {
    pub fn new(viewport_lines: usize, indicator: bool) -> Self {
        Self {
            scroll: Mutex::new(ScrollState::new(viewport_lines)),
            indicator,
        }
    }

    /// Advance the waiting indicator, if it is showing.
    pub fn tick(&self) {
        let Some(frame) = guard(&self.scroll).next_indicator() else {
            return;
        };
        let mut stdout = std::io::stdout();
        let _ = execute!(
            stdout,
            cursor::MoveToColumn(0),
            terminal::Clear(ClearType::CurrentLine),
            style::Print(frame)
        );
    }

    /// Remove the waiting indicator, if it is showing.
    pub fn stop_waiting(&self) {
        if guard(&self.scroll).stop_waiting() {
            Self::erase_line();
        }
    }

    fn erase_line() {
        let mut stdout = std::io::stdout();
        let _ = execute!(
            stdout,
            cursor::MoveToColumn(0),
            terminal::Clear(ClearType::CurrentLine)
        );
    }

    fn write(text: &str) {
        if text.is_empty() {
            return;
        }
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(to_terminal(text).as_bytes());
        let _ = stdout.flush();
    }
}

impl RenderSurface for TerminalSurface {
    fn clear(&self) {
        let mut scroll = guard(&self.scroll);
        scroll.reset();
        if self.indicator {
            scroll.start_waiting();
        }
        drop(scroll);
        Self::write("\n");
    }

    fn append(&self, text: &str) {
        let (visible, was_waiting) = {
            let mut scroll = guard(&self.scroll);
            (scroll.admit(text), scroll.stop_waiting())
        };
        if was_waiting {
            Self::erase_line();
        }
        Self::write(&visible);
    }

    fn scroll_to_end(&self) {
        let pending = guard(&self.scroll).take_pending();
        Self::write(&pending);
    }

    fn is_scrolled_to_end(&self) -> bool {
        guard(&self.scroll).is_at_end()
    }
}

/// Suspends line editing by switching the terminal to raw mode, so keys
/// typed while an answer streams are neither echoed nor queued as input.
#[derive(Default)]
pub struct TerminalInputLock {
    engaged: AtomicBool,
}

impl TerminalInputLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputLock for TerminalInputLock {
    fn lock(&self) {
        if !atty::is(atty::Stream::Stdin) {
            return;
        }
        match terminal::enable_raw_mode() {
            Ok(()) => self.engaged.store(true, Ordering::SeqCst),
            Err(e) => warn!("Failed to enable raw mode: {}", e),
        }
    }

    fn unlock(&self) {
        if !self.engaged.swap(false, Ordering::SeqCst) {
            return;
        }
        // Discard keys pressed while locked.
        let mut discarded = 0usize;
        while matches!(event::poll(Duration::ZERO), Ok(true)) {
            if event::read().is_err() {
                break;
            }
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Dropped input received while locked");
        }
        if let Err(e) = terminal::disable_raw_mode() {
            warn!("Failed to disable raw mode: {}", e);
        }
        TerminalSurface::write("\n");
    }
}

/// Message window on stderr.
#[derive(Default)]
pub struct TerminalMessages;

impl MessageSurface for TerminalMessages {
    fn add(&self, text: &str) {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}{}", line_ending(), to_terminal(text));
        let _ = write!(stderr, "{}", line_ending());
        let _ = stderr.flush();
    }
}

/// No-op lock for non-interactive use.
pub struct NoInputLock;

impl InputLock for NoInputLock {
    fn lock(&self) {}

    fn unlock(&self) {}
}
