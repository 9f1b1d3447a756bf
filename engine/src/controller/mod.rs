//! The instrument state machine (spec.md §4.4). Owns the transport, the
//! ring buffer, the reader thread, the live config snapshot, and the
//! "last known good" connection parameters used by `reconnect()`.
//!
//! Public verbs are serialized by a single controller-level lock (`state`).
//! The transport gets its own lock so the reader thread can block on
//! `read_line` without holding `state` — matching spec.md §5's rule that
//! the reader "holds no controller lock while blocked on I/O" and takes a
//! lock only to append to the ring buffer or to transition to ERROR.

use crate::codec::{self, Classified};
use crate::error::ControllerError;
use crate::reading::{ControllerState, Mode, Reading, SensorConfig};
use crate::ring_buffer::RingBuffer;
use crate::transport::{Transport, TransportOpener, DEFAULT_READ_TIMEOUT};
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POST_OPEN_SETTLE: Duration = Duration::from_millis(1200);
const MENU_PROMPT_TIMEOUT: Duration = Duration::from_secs(3);
const POST_RESET_SETTLE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy)]
struct Acquisition {
    mode: Mode,
    poll_hz: f64,
    tag: Option<char>,
}

/// A sleep that a waiting thread can be woken out of early. Used for the
/// polled reader's inter-query cadence instead of a plain `thread::sleep`
/// so `pause()`/`stop()` return promptly instead of waiting out the period.
struct StopSignal {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn request(&self) {
        let mut flag = self.flag.lock().unwrap();
        *flag = true;
        self.condvar.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.flag.lock().unwrap()
    }

    /// Sleeps up to `dur`, returning early the moment `request()` is
    /// called. Returns whether a stop was requested.
    fn wait(&self, dur: Duration) -> bool {
        let flag = self.flag.lock().unwrap();
        let (flag, _) = self
            .condvar
            .wait_timeout_while(flag, dur, |stopped| !*stopped)
            .unwrap();
        *flag
    }
}

struct ReaderHandle {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

struct StateInner {
    phase: ControllerState,
    config: Option<SensorConfig>,
    port: Option<String>,
    baud: Option<u32>,
    opener: Option<Arc<dyn TransportOpener>>,
    reader: Option<ReaderHandle>,
    remembered: Option<Acquisition>,
    sensor_id: String,
}

pub struct InstrumentController {
    state: Arc<Mutex<StateInner>>,
    transport: Arc<Mutex<Option<Box<dyn Transport>>>>,
    ring: Arc<RingBuffer>,
}

impl InstrumentController {
    pub fn new(ring_capacity: usize, sensor_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StateInner {
                phase: ControllerState::Disconnected,
                config: None,
                port: None,
                baud: None,
                opener: None,
                reader: None,
                remembered: None,
                sensor_id: sensor_id.into(),
            })),
            transport: Arc::new(Mutex::new(None)),
            ring: Arc::new(RingBuffer::new(ring_capacity)),
        }
    }

    pub fn ring_buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.ring)
    }

    pub fn state(&self) -> ControllerState {
        self.state.lock().unwrap().phase
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state(), ControllerState::Disconnected)
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.ring.snapshot()
    }

    pub fn latest(&self) -> Option<Reading> {
        self.ring.snapshot().into_iter().next_back()
    }

    pub fn clear_buffer(&self) {
        self.ring.clear();
    }

    fn require_phase(&self, expected: &[ControllerState], attempted: &'static str) -> Result<(), ControllerError> {
        let phase = self.state();
        if expected.contains(&phase) {
            Ok(())
        } else {
            Err(ControllerError::InvalidState {
                current: phase,
                attempted,
            })
        }
    }

    /// Joins any live reader thread, signalling it to stop first. Never
    /// called while holding `state`'s lock — the reader only ever needs
    /// that lock briefly, so joining it without holding the lock ourselves
    /// is what keeps this deadlock-free.
    fn stop_reader_if_any(&self) {
        let reader = {
            let mut state = self.state.lock().unwrap();
            state.reader.take()
        };
        if let Some(reader) = reader {
            reader.stop.request();
            let _ = reader.handle.join();
        }
    }

    pub fn connect(&self, opener: Arc<dyn TransportOpener>, port: &str, baud: u32) -> Result<(), ControllerError> {
        self.require_phase(&[ControllerState::Disconnected], "connect")?;

        let mut transport = opener.open(port, baud)?;
        let outcome = (|| -> Result<SensorConfig, ControllerError> {
            std::thread::sleep(POST_OPEN_SETTLE);
            transport.flush_input();
            transport.write(&codec::menu_enter())?;
            wait_for_menu_prompt(&mut *transport, MENU_PROMPT_TIMEOUT)?;
            transport.write(&codec::get_config())?;
            let cfg = read_config_dump(&mut *transport, MENU_PROMPT_TIMEOUT)?;
            wait_for_menu_prompt(&mut *transport, MENU_PROMPT_TIMEOUT)?;
            Ok(cfg)
        })();

        match outcome {
            Ok(cfg) => {
                *self.transport.lock().unwrap() = Some(transport);
                let mut state = self.state.lock().unwrap();
                state.phase = ControllerState::ConfigMenu;
                state.sensor_id = cfg.sensor_id.clone();
                state.config = Some(cfg);
                state.port = Some(port.to_string());
                state.baud = Some(baud);
                state.opener = Some(opener);
                Ok(())
            }
            Err(e) => {
                transport.close();
                self.state.lock().unwrap().phase = ControllerState::Disconnected;
                Err(e)
            }
        }
    }

    pub fn disconnect(&self) {
        self.stop_reader_if_any();
        if let Some(mut t) = self.transport.lock().unwrap().take() {
            t.close();
        }
        self.ring.clear();
        let mut state = self.state.lock().unwrap();
        state.phase = ControllerState::Disconnected;
        state.config = None;
        state.remembered = None;
    }

    pub fn reconnect(&self) -> Result<(), ControllerError> {
        let (opener, port, baud) = {
            let state = self.state.lock().unwrap();
            (state.opener.clone(), state.port.clone(), state.baud)
        };
        let opener = opener.ok_or(ControllerError::ConnectionLost)?;
        let port = port.ok_or(ControllerError::ConnectionLost)?;
        let baud = baud.ok_or(ControllerError::ConnectionLost)?;
        self.disconnect();
        self.connect(opener, &port, baud)
    }

    pub fn get_config(&self) -> Result<SensorConfig, ControllerError> {
        self.require_phase(&[ControllerState::ConfigMenu], "get_config")?;
        let mut transport = self.transport.lock().unwrap();
        let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
        t.write(&codec::get_config())?;
        let cfg = read_config_dump(t, MENU_PROMPT_TIMEOUT)?;
        wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        drop(transport);
        self.state.lock().unwrap().config = Some(cfg.clone());
        Ok(cfg)
    }

    pub fn set_averaging(&self, n: u32) -> Result<SensorConfig, ControllerError> {
        self.require_phase(&[ControllerState::ConfigMenu], "set_averaging")?;
        if !(1..=65535).contains(&n) {
            return Err(ControllerError::InvalidConfigValue(format!(
                "averaging {n} not in [1, 65535]"
            )));
        }
        self.write_config_field(codec::menu_command('A'), codec::numeric_reply(n as i64))
    }

    pub fn set_adc_rate(&self, hz: u32) -> Result<SensorConfig, ControllerError> {
        self.require_phase(&[ControllerState::ConfigMenu], "set_adc_rate")?;
        if !SensorConfig::ALLOWED_RATES.contains(&hz) {
            return Err(ControllerError::InvalidConfigValue(format!(
                "adc_rate_hz {hz} not one of {:?}",
                SensorConfig::ALLOWED_RATES
            )));
        }
        self.write_config_field(codec::menu_command('R'), codec::numeric_reply(hz as i64))
    }

    pub fn set_mode(&self, mode: Mode, tag: Option<char>) -> Result<SensorConfig, ControllerError> {
        self.require_phase(&[ControllerState::ConfigMenu], "set_mode")?;
        match mode {
            Mode::Freerun => {
                if tag.is_some() {
                    return Err(ControllerError::InvalidConfigValue(
                        "tag must be omitted for freerun mode".into(),
                    ));
                }
                self.write_single_menu_command(codec::menu_command('F'))
            }
            Mode::Polled => {
                let tag = tag.ok_or_else(|| {
                    ControllerError::InvalidConfigValue("tag is required for polled mode".into())
                })?;
                if !tag.is_ascii_uppercase() {
                    return Err(ControllerError::InvalidConfigValue(format!(
                        "tag {tag:?} not in A-Z"
                    )));
                }
                self.write_config_field(codec::menu_command('P'), codec::menu_command(tag))
            }
        }
    }

    /// Shared shape of `set_averaging`/`set_adc_rate`/polled `set_mode`:
    /// menu letter, then the value, then wait for the prompt to reappear —
    /// the sole success signal — then re-read the config snapshot.
    fn write_config_field(&self, selector: Vec<u8>, value: Vec<u8>) -> Result<SensorConfig, ControllerError> {
        let mut transport = self.transport.lock().unwrap();
        let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
        t.write(&selector)?;
        t.write(&value)?;
        wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        t.write(&codec::get_config())?;
        let cfg = read_config_dump(t, MENU_PROMPT_TIMEOUT)?;
        wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        drop(transport);
        self.state.lock().unwrap().config = Some(cfg.clone());
        Ok(cfg)
    }

    /// As above but for a selector with no following value (freerun mode
    /// has no TAG to supply).
    fn write_single_menu_command(&self, selector: Vec<u8>) -> Result<SensorConfig, ControllerError> {
        let mut transport = self.transport.lock().unwrap();
        let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
        t.write(&selector)?;
        wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        t.write(&codec::get_config())?;
        let cfg = read_config_dump(t, MENU_PROMPT_TIMEOUT)?;
        wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        drop(transport);
        self.state.lock().unwrap().config = Some(cfg.clone());
        Ok(cfg)
    }

    pub fn start(&self, poll_hz: f64) -> Result<(), ControllerError> {
        self.require_phase(&[ControllerState::ConfigMenu], "start")?;
        let cfg = self
            .state
            .lock()
            .unwrap()
            .config
            .clone()
            .ok_or_else(|| ControllerError::InvalidResponse("no config snapshot available".into()))?;

        {
            let mut transport = self.transport.lock().unwrap();
            let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
            t.write(&codec::menu_exit())?;
        }
        std::thread::sleep(POST_RESET_SETTLE);
        {
            let mut transport = self.transport.lock().unwrap();
            if let Some(t) = transport.as_deref_mut() {
                t.flush_input();
            }
        }

        let (new_phase, acq) = match cfg.mode {
            Mode::Freerun => (
                ControllerState::AcqFreerun,
                Acquisition {
                    mode: Mode::Freerun,
                    poll_hz,
                    tag: None,
                },
            ),
            Mode::Polled => {
                let tag = cfg.tag.ok_or_else(|| {
                    ControllerError::InvalidConfigValue("polled mode requires a configured tag".into())
                })?;
                (
                    ControllerState::AcqPolled,
                    Acquisition {
                        mode: Mode::Polled,
                        poll_hz,
                        tag: Some(tag),
                    },
                )
            }
        };

        self.spawn_reader(acq, cfg.sample_period_s());
        let mut state = self.state.lock().unwrap();
        state.phase = new_phase;
        state.remembered = Some(acq);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), ControllerError> {
        let phase = self.state();
        if !phase.is_acquiring() {
            return Err(ControllerError::InvalidState {
                current: phase,
                attempted: "pause",
            });
        }
        self.stop_reader_if_any();
        {
            let mut transport = self.transport.lock().unwrap();
            let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
            t.write(&codec::menu_enter())?;
            wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        }
        self.state.lock().unwrap().phase = ControllerState::Paused;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ControllerError> {
        self.require_phase(&[ControllerState::Paused], "resume")?;
        let acq = self
            .state
            .lock()
            .unwrap()
            .remembered
            .ok_or_else(|| ControllerError::InvalidResponse("no remembered acquisition to resume".into()))?;

        let sample_period_s = {
            let mut transport = self.transport.lock().unwrap();
            let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
            t.write(&codec::get_config())?;
            let cfg = read_config_dump(t, MENU_PROMPT_TIMEOUT)?;
            wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
            let period = cfg.sample_period_s();
            drop(transport);
            self.state.lock().unwrap().config = Some(cfg);
            period
        };

        {
            let mut transport = self.transport.lock().unwrap();
            let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
            t.write(&codec::menu_exit())?;
        }
        std::thread::sleep(POST_RESET_SETTLE);
        {
            let mut transport = self.transport.lock().unwrap();
            if let Some(t) = transport.as_deref_mut() {
                t.flush_input();
            }
        }

        self.spawn_reader(acq, sample_period_s);
        let new_phase = match acq.mode {
            Mode::Freerun => ControllerState::AcqFreerun,
            Mode::Polled => ControllerState::AcqPolled,
        };
        self.state.lock().unwrap().phase = new_phase;
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ControllerError> {
        let phase = self.state();
        if !(phase.is_acquiring() || phase == ControllerState::Paused) {
            return Err(ControllerError::InvalidState {
                current: phase,
                attempted: "stop",
            });
        }
        self.stop_reader_if_any();
        {
            let mut transport = self.transport.lock().unwrap();
            let t = transport.as_deref_mut().ok_or(ControllerError::ConnectionLost)?;
            t.write(&codec::menu_enter())?;
            wait_for_menu_prompt(t, MENU_PROMPT_TIMEOUT)?;
        }
        let mut state = self.state.lock().unwrap();
        state.phase = ControllerState::ConfigMenu;
        state.remembered = None;
        Ok(())
    }

    fn spawn_reader(&self, acq: Acquisition, sample_period_s: f64) {
        let stop = Arc::new(StopSignal::new());
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let ring = Arc::clone(&self.ring);
        let sensor_id = self.state.lock().unwrap().sensor_id.clone();
        let stop_for_thread = Arc::clone(&stop);

        let handle = match acq.mode {
            Mode::Freerun => {
                std::thread::spawn(move || run_freerun_reader(transport, state, ring, stop_for_thread, sensor_id))
            }
            Mode::Polled => {
                let tag = acq.tag.expect("polled acquisition always carries a tag");
                let warmup = Duration::from_secs_f64((sample_period_s + 0.5).max(0.5));
                std::thread::spawn(move || {
                    run_polled_reader(transport, state, ring, stop_for_thread, sensor_id, tag, acq.poll_hz, warmup)
                })
            }
        };

        self.state.lock().unwrap().reader = Some(ReaderHandle { stop, handle });
    }
}

fn wait_for_menu_prompt(transport: &mut dyn Transport, timeout: Duration) -> Result<(), ControllerError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ControllerError::MenuTimeout);
        }
        match transport.read_line(remaining.min(DEFAULT_READ_TIMEOUT)) {
            Ok(Some(line)) => match codec::classify(&line, None) {
                Ok(Classified::MenuPrompt) => return Ok(()),
                Ok(Classified::ErrorBanner { tag, text }) => {
                    return Err(ControllerError::InvalidResponse(format!("{tag}: {text}")))
                }
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            },
            Ok(None) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_config_dump(transport: &mut dyn Transport, timeout: Duration) -> Result<SensorConfig, ControllerError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ControllerError::MenuTimeout);
        }
        match transport.read_line(remaining.min(DEFAULT_READ_TIMEOUT)) {
            Ok(Some(line)) => match codec::classify(&line, None) {
                Ok(Classified::ConfigDump(cfg)) => return Ok(cfg),
                Ok(Classified::ErrorBanner { tag, text }) => {
                    return Err(ControllerError::InvalidResponse(format!("{tag}: {text}")))
                }
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            },
            Ok(None) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn mark_error(state: &Mutex<StateInner>) {
    state.lock().unwrap().phase = ControllerState::Error;
}

fn run_freerun_reader(
    transport: Arc<Mutex<Option<Box<dyn Transport>>>>,
    state: Arc<Mutex<StateInner>>,
    ring: Arc<RingBuffer>,
    stop: Arc<StopSignal>,
    sensor_id: String,
) {
    loop {
        if stop.is_set() {
            return;
        }
        let line = {
            let mut guard = transport.lock().unwrap();
            match guard.as_deref_mut() {
                Some(t) => t.read_line(DEFAULT_READ_TIMEOUT),
                None => return,
            }
        };
        match line {
            Ok(Some(text)) => match codec::classify(&text, None) {
                Ok(Classified::FreerunReading { value, temp_c, vin }) => {
                    ring.push(Reading::new(Utc::now(), sensor_id.clone(), Mode::Freerun, value, temp_c, vin));
                }
                Ok(Classified::MenuPrompt) => {
                    warn!("unexpected MENU_PROMPT during freerun acquisition");
                    mark_error(&state);
                    return;
                }
                Ok(Classified::ErrorBanner { tag, text }) => {
                    warn!("device error banner during freerun acquisition ({tag}): {text}");
                }
                Ok(Classified::BannerLine) | Ok(Classified::Unknown) | Ok(Classified::Echo) => {
                    debug!("dropping unclassified line during freerun acquisition: {text:?}");
                }
                Ok(Classified::ConfigDump(_)) | Ok(Classified::PolledReading { .. }) => {
                    debug!("dropping out-of-band line during freerun acquisition: {text:?}");
                }
                Err(e) => warn!("codec error during freerun acquisition: {e}"),
            },
            Ok(None) => continue,
            Err(e) => {
                error!("transport error during freerun acquisition: {e}");
                mark_error(&state);
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_polled_reader(
    transport: Arc<Mutex<Option<Box<dyn Transport>>>>,
    state: Arc<Mutex<StateInner>>,
    ring: Arc<RingBuffer>,
    stop: Arc<StopSignal>,
    sensor_id: String,
    tag: char,
    poll_hz: f64,
    warmup: Duration,
) {
    {
        let mut guard = transport.lock().unwrap();
        match guard.as_deref_mut() {
            Some(t) => {
                if let Err(e) = t.write(&codec::polled_init(tag)) {
                    error!("transport error priming polled mode: {e}");
                    mark_error(&state);
                    return;
                }
            }
            None => return,
        }
    }
    std::thread::sleep(warmup);

    let cadence = Duration::from_secs_f64((1.0 / poll_hz).max(0.01));
    loop {
        if stop.is_set() {
            return;
        }
        {
            let mut guard = transport.lock().unwrap();
            match guard.as_deref_mut() {
                Some(t) => {
                    if let Err(e) = t.write(&codec::polled_query(tag)) {
                        error!("transport error during polled query: {e}");
                        mark_error(&state);
                        return;
                    }
                }
                None => return,
            }
        }
        let line = {
            let mut guard = transport.lock().unwrap();
            guard.as_deref_mut().map(|t| t.read_line(DEFAULT_READ_TIMEOUT))
        };
        match line {
            Some(Ok(Some(text))) => match codec::classify(&text, Some(tag)) {
                Ok(Classified::PolledReading { value, temp_c, vin, .. }) => {
                    ring.push(Reading::new(Utc::now(), sensor_id.clone(), Mode::Polled, value, temp_c, vin));
                }
                Ok(_) => debug!("dropping unexpected line while polling TAG {tag}: {text:?}"),
                Err(e) => warn!("codec error while polling TAG {tag}: {e}"),
            },
            Some(Ok(None)) => {}
            Some(Err(e)) => {
                error!("transport error during polled acquisition: {e}");
                mark_error(&state);
                return;
            }
            None => return,
        }
        if stop.wait(cadence) {
            return;
        }
    }
}
