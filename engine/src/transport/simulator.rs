//! An in-process simulator transport driven by a scripted response model
//! of the device, for tests (spec.md §4.2, §6). It implements the same
//! `Transport` interface as the real serial link so the controller and
//! recorder can be exercised without hardware.

use super::{Transport, TransportOpener};
use crate::codec;
use crate::error::TransportError;
use crate::reading::{Mode, SensorConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared, mutable simulated-device state, so a test can hold a handle to
/// the same script the controller is talking to (e.g. to assert "zero
/// bytes written" for a rejected config-time verb, per spec.md §8f).
#[derive(Clone)]
pub struct SimulatorScript {
    inner: Arc<Mutex<ScriptState>>,
}

#[derive(Clone, Copy)]
enum PendingField {
    Averaging,
    AdcRate,
    Tag,
}

struct ScriptState {
    config: SensorConfig,
    in_menu: bool,
    freerun_active: bool,
    bytes_written: u64,
    pending: VecDeque<String>,
    last_freerun_emit: Instant,
    pending_field: Option<PendingField>,
}

impl SimulatorScript {
    pub fn new(config: SensorConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptState {
                config,
                in_menu: false,
                freerun_active: false,
                bytes_written: 0,
                pending: VecDeque::new(),
                last_freerun_emit: Instant::now(),
                pending_field: None,
            })),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().unwrap().bytes_written
    }

    pub fn config(&self) -> SensorConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn in_menu(&self) -> bool {
        self.inner.lock().unwrap().in_menu
    }

    fn push_line(&self, line: impl Into<String>) {
        self.inner.lock().unwrap().pending.push_back(line.into());
    }

    fn handle_write(&self, bytes: &[u8]) {
        let mut state = self.inner.lock().unwrap();
        state.bytes_written += bytes.len() as u64;
        let text = String::from_utf8_lossy(bytes).to_string();
        drop(state);
        self.handle_command(&text);
    }

    fn handle_command(&self, text: &str) {
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed == "\x1b" || text.starts_with('\x1b') {
            self.inner.lock().unwrap().in_menu = true;
            self.push_line(codec::MENU_PROMPT_LINE);
            return;
        }
        if trimmed == "^" {
            let cfg = self.inner.lock().unwrap().config.clone();
            self.push_line(codec::format_config_dump(&cfg));
            self.push_line(codec::MENU_PROMPT_LINE);
            return;
        }
        if trimmed == "X" {
            // Reset-to-exit: the device drops out of the menu. The
            // controller is responsible for the post-reset settle/flush;
            // the simulator just stops claiming to be "in menu" and, if
            // freerun mode is configured, starts emitting readings.
            let mut state = self.inner.lock().unwrap();
            state.in_menu = false;
            if state.config.mode == Mode::Freerun {
                state.freerun_active = true;
                state.last_freerun_emit = Instant::now();
            }
            return;
        }
        if let Some(rest) = trimmed.strip_prefix('*') {
            // polled_init: "*<tag>Q000!"
            let _ = rest;
            return;
        }
        if let Some(tag) = trimmed.strip_prefix('>') {
            // polled_query: ">" + tag
            let mut state = self.inner.lock().unwrap();
            if state.config.mode == Mode::Polled {
                let cfg = state.config.clone();
                let tag_char = tag.chars().next().unwrap_or(' ');
                let row = Self::synth_reading_row(&cfg, Some(tag_char));
                state.pending.push_back(row);
            }
            return;
        }
        // A bare menu-letter command (e.g. "A") followed later by a
        // numeric reply line. The simulator is permissive: it just applies
        // whatever the controller encodes, via `apply_config_write`.
        self.apply_config_write(trimmed);
    }

    fn apply_config_write(&self, letter_or_value: &str) {
        let mut state = self.inner.lock().unwrap();
        // A field selector (e.g. "A") and its value ("125") arrive as two
        // separate writes. The prompt only reappears once the value half
        // lands, matching the real device's single-dialog-at-a-time menu:
        // queuing it early would let a stray prompt line jump ahead of a
        // later config-dump or reading in the simulator's read queue.
        if let Some(field) = state.pending_field.take() {
            match field {
                PendingField::Averaging => {
                    if let Ok(n) = letter_or_value.parse::<u32>() {
                        state.config.averaging = n;
                    }
                }
                PendingField::AdcRate => {
                    if let Ok(n) = letter_or_value.parse::<u32>() {
                        state.config.adc_rate_hz = n;
                    }
                }
                PendingField::Tag => {
                    if let Some(c) = letter_or_value.chars().next() {
                        state.config.tag = Some(c);
                    }
                }
            }
            state.pending.push_back(codec::MENU_PROMPT_LINE.to_string());
            return;
        }
        match letter_or_value.chars().next() {
            Some('A') => state.pending_field = Some(PendingField::Averaging),
            Some('R') => state.pending_field = Some(PendingField::AdcRate),
            Some('F') => {
                state.config.mode = Mode::Freerun;
                state.pending.push_back(codec::MENU_PROMPT_LINE.to_string());
            }
            Some('P') => {
                // Polled mode needs a TAG letter before the dialog closes.
                state.config.mode = Mode::Polled;
                state.pending_field = Some(PendingField::Tag);
            }
            _ => {
                state.pending.push_back(codec::MENU_PROMPT_LINE.to_string());
            }
        }
    }

    fn synth_reading_row(cfg: &SensorConfig, tag: Option<char>) -> String {
        let value = 1.0;
        let mut fields = vec![format!("{value}")];
        if cfg.include_temp {
            fields.push("22.5".to_string());
        }
        if cfg.include_vin {
            fields.push("5.0".to_string());
        }
        match tag {
            Some(t) => format!("{t},{}", fields.join(",")),
            None => fields.join(","),
        }
    }

    fn tick_freerun(&self) {
        let mut state = self.inner.lock().unwrap();
        if !state.freerun_active {
            return;
        }
        let period = Duration::from_secs_f64(state.config.sample_period_s().max(0.05));
        if state.last_freerun_emit.elapsed() >= period {
            let cfg = state.config.clone();
            state.last_freerun_emit = Instant::now();
            let row = Self::synth_reading_row(&cfg, None);
            state.pending.push_back(row);
        }
    }

    fn pop_line(&self) -> Option<String> {
        self.tick_freerun();
        self.inner.lock().unwrap().pending.pop_front()
    }
}

pub struct SimulatorTransport {
    script: SimulatorScript,
    open: bool,
}

impl SimulatorTransport {
    pub fn new(script: SimulatorScript) -> Self {
        Self { script, open: true }
    }
}

impl Transport for SimulatorTransport {
    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.script.handle_write(bytes);
        Ok(bytes.len())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.script.pop_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn flush_input(&mut self) {
        self.script.inner.lock().unwrap().pending.clear();
    }
}

pub struct SimulatorOpener {
    pub script: SimulatorScript,
}

impl TransportOpener for SimulatorOpener {
    fn open(&self, _port: &str, _baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SimulatorTransport::new(self.script.clone())))
    }
}
