//! DFU Session - High-level orchestrator for a firmware update.
//!
//! The session owns the transport, the parsed image and all runtime state.
//! Hosts either push received bytes through [`DfuSession::on_data`] and poll
//! [`DfuSession::check_timeout`], or let [`DfuSession::run`] do both.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::UpdateError;
use crate::events::{DfuEvent, DfuObserver, PacketDirection, TracingObserver};
use crate::payload::FirmwareImage;
use crate::protocol::AckError;
use crate::protocol::constants::{
    DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_DATA_SIZE,
    DEFAULT_MAX_ROW_RETRIES, MAX_FRAGMENT_SIZE,
};
use crate::state::handlers::{self, HandlerContext, handle_ack};
use crate::state::machine::{SessionState, UpdateState};
use crate::transport::{DfuTransport, TransportError};

/// Largest read requested from the transport by `run`.
const READ_CHUNK: usize = 256;

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the `.cyacd` image.
    pub image_path: Option<String>,
    /// Serial port name.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Largest row fragment carried by one frame.
    pub max_data_size: usize,
    /// How long to wait for each acknowledgement.
    pub ack_timeout_ms: u64,
    /// Extra attempts for a row that fails verification.
    pub max_row_retries: u32,
    /// Bound of the receive buffer.
    pub max_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image_path: None,
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            max_data_size: DEFAULT_MAX_DATA_SIZE,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            max_row_retries: DEFAULT_MAX_ROW_RETRIES,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `max_data_size` limited to what one frame can carry.
    pub fn fragment_size(&self) -> usize {
        self.max_data_size.clamp(1, MAX_FRAGMENT_SIZE)
    }
}

/// DFU Session - drives one update at a time over `transport`.
pub struct DfuSession<T: DfuTransport, O: DfuObserver = TracingObserver> {
    config: SessionConfig,
    transport: T,
    observer: Arc<O>,
    image: Option<FirmwareImage>,
    state: SessionState,
}

impl<T: DfuTransport> DfuSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig, transport: T) -> Self {
        Self::with_observer(config, transport, Arc::new(TracingObserver))
    }
}

impl<T: DfuTransport, O: DfuObserver> DfuSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, transport: T, observer: Arc<O>) -> Self {
        let state = SessionState::new(config.max_buffer_size);
        Self {
            config,
            transport,
            observer,
            image: None,
            state,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Image of the current or last update.
    pub fn image(&self) -> Option<&FirmwareImage> {
        self.image.as_ref()
    }

    pub fn state(&self) -> UpdateState {
        self.state.state
    }

    /// Condition that ended the last update, if it failed.
    pub fn last_error(&self) -> Option<&UpdateError> {
        self.state.last_error.as_ref()
    }

    fn context(&mut self) -> Option<HandlerContext<'_, T, O>> {
        let image = self.image.as_ref()?;
        Some(HandlerContext {
            transport: &self.transport,
            observer: self.observer.as_ref(),
            session: &mut self.state,
            image,
            config: &self.config,
        })
    }

    /// Parse `text` and start flashing it.
    pub fn start_update(&mut self, text: &str) -> Result<()> {
        let image = FirmwareImage::parse(text)?;
        self.start(image)
    }

    /// Start flashing an already parsed image.
    ///
    /// Device-side failures are reported through the observer, not here.
    pub fn start(&mut self, image: FirmwareImage) -> Result<()> {
        if self.state.state.is_active() {
            bail!("An update is already in progress ({})", self.state.state);
        }
        let Some(header) = image.header() else {
            bail!("Firmware image has no header");
        };
        info!(
            silicon_id = %header.silicon_id,
            silicon_rev = %header.silicon_rev,
            checksum = %header.checksum_type,
            rows = image.rows().len(),
            "Starting update"
        );

        if self.config.fragment_size() != self.config.max_data_size {
            warn!(
                max_data_size = self.config.max_data_size,
                used = self.config.fragment_size(),
                "max_data_size out of range, clamped"
            );
        }

        self.state = SessionState::new(self.config.max_buffer_size);
        self.image = Some(image);
        if let Some(mut ctx) = self.context() {
            let result = handlers::begin(&mut ctx);
            ctx.conclude(result);
        }
        Ok(())
    }

    /// Feed bytes received from the transport.
    ///
    /// Every complete frame is handled. A malformed frame is dropped without
    /// touching the update and the first such error is returned.
    pub fn on_data(&mut self, bytes: &[u8]) -> Result<(), AckError> {
        self.state.accumulator.extend(bytes)?;

        let mut first_error = None;
        while let Some(frame) = self.state.accumulator.next_frame() {
            let Some(mut ctx) = self.context() else {
                debug!(len = frame.len(), "No update running, frame dropped");
                continue;
            };
            ctx.emit(DfuEvent::Packet {
                direction: PacketDirection::Rx,
                command: ctx.session.pending_command(),
                length: frame.len(),
                data: frame.iter().take(handlers::PACKET_PREVIEW_LEN).copied().collect(),
            });

            let ack = hex::encode_upper(&frame);
            match handle_ack(&ack, &mut ctx) {
                Ok(result) => ctx.conclude(result),
                Err(e) => {
                    warn!(error = %e, ack = %ack, "Unusable acknowledgement");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fail the update if the pending acknowledgement is overdue at `now`.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let Some(pending) = self.state.pending else {
            return false;
        };
        if now < pending.deadline || self.state.state.is_terminal() {
            return false;
        }

        let err = UpdateError::Timeout {
            command: pending.command,
            timeout_ms: self.config.ack_timeout_ms,
        };
        if let Some(mut ctx) = self.context() {
            ctx.fail(err);
        }
        true
    }

    /// Read from the transport until the update finishes.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> Result<()> {
        if self.state.state == UpdateState::Idle {
            bail!("No update started");
        }

        while !self.state.state.is_terminal() {
            match self.transport.read(READ_CHUNK) {
                Ok(bytes) => {
                    if !bytes.is_empty()
                        && let Err(e) = self.on_data(&bytes)
                    {
                        warn!(error = %e, "Discarded inbound data");
                    }
                }
                Err(TransportError::Timeout { .. }) => {}
                Err(e) if !self.transport.is_connected() => {
                    let err = UpdateError::Transport(e.to_string());
                    if let Some(mut ctx) = self.context() {
                        ctx.fail(err);
                    }
                }
                Err(e) => {
                    warn!(error = ?e, "Transient read error, retrying...");
                    thread::sleep(Duration::from_millis(50));
                }
            }
            self.check_timeout(Instant::now());
        }

        match &self.state.last_error {
            Some(e) => Err(anyhow!(e.clone()).context("Firmware update failed")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::checksum::{ChecksumType, packet_checksum};
    use crate::protocol::constants::*;
    use crate::transport::MockTransport;

    const SAMPLE: &str = "0E50119E0000
:0100D5008000400020916A0100F1CB0100F1CB010080B500AF024B83F3088806F0DBF8C0460040002080B500AF374B12221A6007F03FFD364B180007F077FF012007F048FD302007F053FB324B324A1A60324B8022D2051A60314B314A126802210A431A602F4B304A1A60304B00221A602F4B2F4A126808218A431A60FA23DB00180007F088
:0100D6008083FB2B4B180007F0B3FC2A4BA022D2001A60294B294A1A60294B802292001A60254B284A1A60284B284A1A60224B284A1A60284B00221A601F4B274A1A60274B802292001A601C4B254A1A60254B802212061A60244B8022D2021A60234B43221A60234B41221A60224B44221A60224B40221A60214B42221A60074B8022D205C3
:END";

    fn reply(status: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![PACKET_START, status];
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(data);
        let checksum = packet_checksum(ChecksumType::Summation, &frame[1..]);
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.push(PACKET_END);
        frame
    }

    /// Simulated bootloader answering every frame synchronously.
    struct FakeBootloader {
        silicon_id: [u8; 4],
        silicon_rev: u8,
        flash_size: [u8; 4],
        /// Per-array overrides of `flash_size`.
        array_flash_size: Vec<(u8, [u8; 4])>,
        row_checksums: Vec<([u8; 2], u8)>,
        bad_verifies: AtomicUsize,
        reject: Option<u8>,
        silent: Option<u8>,
        checksum_ok: bool,
    }

    impl FakeBootloader {
        fn for_image(text: &str) -> Self {
            let image = FirmwareImage::parse(text).unwrap();
            Self {
                silicon_id: [0x9E, 0x11, 0x50, 0x0E],
                silicon_rev: 0x00,
                flash_size: [0x00, 0x00, 0xFF, 0x01],
                array_flash_size: Vec::new(),
                row_checksums: image
                    .rows()
                    .iter()
                    .map(|r| (r.row_bytes(), r.expected_device_checksum(image.checksum_type())))
                    .collect(),
                bad_verifies: AtomicUsize::new(0),
                reject: None,
                silent: None,
                checksum_ok: true,
            }
        }

        fn respond(&self, frame: &[u8]) -> Option<Vec<u8>> {
            let opcode = frame[1];
            if self.silent == Some(opcode) {
                return None;
            }
            if self.reject == Some(opcode) {
                return Some(reply(0x01, &[]));
            }
            let data = &frame[FRAME_HEADER_SIZE..frame.len() - FRAME_TRAILER_SIZE];
            match opcode {
                CMD_ENTER_BOOTLOADER => {
                    let mut info = self.silicon_id.to_vec();
                    info.extend_from_slice(&[self.silicon_rev, 0x3C, 0x01, 0x01]);
                    Some(reply(0x00, &info))
                }
                CMD_GET_FLASH_SIZE => {
                    let size = self
                        .array_flash_size
                        .iter()
                        .find(|(array, _)| *array == data[0])
                        .map_or(self.flash_size, |(_, size)| *size);
                    Some(reply(0x00, &size))
                }
                CMD_SEND_DATA | CMD_PROGRAM_ROW => Some(reply(0x00, &[])),
                CMD_VERIFY_ROW => {
                    let row = [data[1], data[2]];
                    let mut checksum = self
                        .row_checksums
                        .iter()
                        .find(|(r, _)| *r == row)
                        .map(|(_, c)| *c)
                        .unwrap_or(0);
                    if self.bad_verifies.load(Ordering::SeqCst) > 0 {
                        self.bad_verifies.fetch_sub(1, Ordering::SeqCst);
                        checksum = checksum.wrapping_add(1);
                    }
                    Some(reply(0x00, &[checksum]))
                }
                CMD_VERIFY_CHECKSUM => {
                    let status = if self.checksum_ok { 0x00 } else { 0x01 };
                    Some(reply(status, &[0x01]))
                }
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<DfuEvent>>,
    }

    impl DfuObserver for Recorder {
        fn on_event(&self, event: &DfuEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn progress(&self) -> Vec<u8> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    DfuEvent::Progress { percentage, .. } => Some(*percentage),
                    _ => None,
                })
                .collect()
        }

        fn error_code(&self) -> Option<&'static str> {
            self.events.lock().unwrap().iter().find_map(|e| match e {
                DfuEvent::Error { code, .. } => Some(*code),
                _ => None,
            })
        }

        fn count(&self, pred: impl Fn(&DfuEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| pred(*e)).count()
        }

        fn position(&self, pred: impl Fn(&DfuEvent) -> bool) -> Option<usize> {
            self.events.lock().unwrap().iter().position(pred)
        }
    }

    fn session_with(
        fake: FakeBootloader,
        config: SessionConfig,
    ) -> (DfuSession<MockTransport, Recorder>, MockTransport, Arc<Recorder>) {
        let mock = MockTransport::with_responder(move |frame| fake.respond(frame));
        let recorder = Arc::new(Recorder::default());
        let session = DfuSession::with_observer(config, mock.clone(), recorder.clone());
        (session, mock, recorder)
    }

    fn opcodes(mock: &MockTransport) -> Vec<u8> {
        mock.get_writes().iter().map(|w| w[1]).collect()
    }

    #[test]
    fn test_full_update() {
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();

        assert_eq!(session.state(), UpdateState::Done);
        assert_eq!(
            opcodes(&mock),
            vec![
                CMD_ENTER_BOOTLOADER,
                CMD_GET_FLASH_SIZE,
                CMD_PROGRAM_ROW,
                CMD_VERIFY_ROW,
                CMD_PROGRAM_ROW,
                CMD_VERIFY_ROW,
                CMD_VERIFY_CHECKSUM,
                CMD_EXIT_BOOTLOADER,
            ]
        );

        let start = recorder
            .position(|e| matches!(e, DfuEvent::FlashStart))
            .unwrap();
        let first_progress = recorder
            .position(|e| matches!(e, DfuEvent::Progress { .. }))
            .unwrap();
        let finish = recorder
            .position(|e| matches!(e, DfuEvent::FlashFinished))
            .unwrap();
        assert!(start < first_progress && first_progress < finish);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashStart)), 1);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashFinished)), 1);
        assert_eq!(recorder.progress(), vec![50, 100]);
        assert!(recorder.error_code().is_none());
    }

    #[test]
    fn test_program_row_frame_layout() {
        let (mut session, mock, _) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();

        let program = &mock.get_writes()[2];
        assert_eq!(program[1], CMD_PROGRAM_ROW);
        assert_eq!(u16::from_le_bytes([program[2], program[3]]), 3 + 128);
        assert_eq!(&program[4..7], &[0x01, 0xD5, 0x00]);
        assert_eq!(&program[7..9], &[0x00, 0x40]);

        let verify = &mock.get_writes()[3];
        assert_eq!(&verify[4..7], &[0x01, 0xD5, 0x00]);
    }

    #[test]
    fn test_large_row_is_fragmented_in_order() {
        let config = SessionConfig {
            max_data_size: 50,
            ..Default::default()
        };
        let (mut session, mock, _) = session_with(FakeBootloader::for_image(SAMPLE), config);
        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();

        let writes = mock.get_writes();
        assert_eq!(
            &opcodes(&mock)[2..6],
            &[CMD_SEND_DATA, CMD_SEND_DATA, CMD_PROGRAM_ROW, CMD_VERIFY_ROW]
        );

        let payload = |w: &Vec<u8>| w[FRAME_HEADER_SIZE..w.len() - FRAME_TRAILER_SIZE].to_vec();
        let mut reassembled = payload(&writes[2]);
        reassembled.extend(payload(&writes[3]));
        let last = payload(&writes[4]);
        assert_eq!(&last[..3], &[0x01, 0xD5, 0x00]);
        reassembled.extend_from_slice(&last[3..]);

        let image = FirmwareImage::parse(SAMPLE).unwrap();
        assert_eq!(reassembled, image.rows()[0].data());
        assert_eq!(payload(&writes[2]).len(), 50);
        assert_eq!(last.len(), 3 + 28);
    }

    #[test]
    fn test_device_mismatch_stops_update() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.silicon_id = [0x04, 0xC8, 0x11, 0x93];
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        assert!(session.run().is_err());

        assert_eq!(session.state(), UpdateState::Error);
        assert_eq!(recorder.error_code(), Some("DEVICE_MISMATCH"));
        assert_eq!(opcodes(&mock), vec![CMD_ENTER_BOOTLOADER]);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashStart)), 0);
    }

    #[test]
    fn test_row_out_of_range_before_any_write() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.flash_size = [0x00, 0x01, 0xFF, 0x01];
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        assert!(session.run().is_err());

        assert_eq!(recorder.error_code(), Some("ROW_OUT_OF_RANGE"));
        assert_eq!(opcodes(&mock), vec![CMD_ENTER_BOOTLOADER, CMD_GET_FLASH_SIZE]);
    }

    #[test]
    fn test_row_checksum_mismatch_is_retried() {
        let fake = FakeBootloader::for_image(SAMPLE);
        fake.bad_verifies.store(1, Ordering::SeqCst);
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();

        let programs = opcodes(&mock)
            .iter()
            .filter(|&&op| op == CMD_PROGRAM_ROW)
            .count();
        assert_eq!(programs, 3);
        assert_eq!(recorder.progress(), vec![50, 100]);
        assert_eq!(session.state(), UpdateState::Done);
    }

    #[test]
    fn test_row_retries_exhausted() {
        let fake = FakeBootloader::for_image(SAMPLE);
        fake.bad_verifies.store(100, Ordering::SeqCst);
        let config = SessionConfig {
            max_row_retries: 2,
            ..Default::default()
        };
        let (mut session, mock, recorder) = session_with(fake, config);

        session.start_update(SAMPLE).unwrap();
        assert!(session.run().is_err());

        let programs = opcodes(&mock)
            .iter()
            .filter(|&&op| op == CMD_PROGRAM_ROW)
            .count();
        assert_eq!(programs, 3);
        assert_eq!(recorder.error_code(), Some("ROW_CHECKSUM_MISMATCH"));
        assert!(session.last_error().unwrap().is_retriable());
    }

    #[test]
    fn test_device_status_error() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.reject = Some(CMD_PROGRAM_ROW);
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        assert!(session.run().is_err());

        assert_eq!(recorder.error_code(), Some("DEVICE_STATUS_ERROR"));
        assert_eq!(*opcodes(&mock).last().unwrap(), CMD_PROGRAM_ROW);
        assert_eq!(
            session.last_error(),
            Some(&UpdateError::DeviceStatus {
                command: crate::protocol::Command::ProgramRow
            })
        );
    }

    #[test]
    fn test_image_checksum_failure_is_fatal() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.checksum_ok = false;
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        assert!(session.run().is_err());

        assert_eq!(recorder.error_code(), Some("IMAGE_CHECKSUM_MISMATCH"));
        assert_eq!(*opcodes(&mock).last().unwrap(), CMD_VERIFY_CHECKSUM);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashFinished)), 0);
    }

    #[test]
    fn test_timeout() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.silent = Some(CMD_GET_FLASH_SIZE);
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(SAMPLE).unwrap();
        // Deliver the enter-bootloader reply by hand.
        for chunk in mock.drain_rx() {
            session.on_data(&chunk).unwrap();
        }
        assert_eq!(session.state(), UpdateState::ReadingFlashSize);

        assert!(!session.check_timeout(Instant::now()));
        assert!(session.check_timeout(Instant::now() + Duration::from_secs(60)));
        assert_eq!(session.state(), UpdateState::Error);
        assert_eq!(recorder.error_code(), Some("TIMEOUT"));

        // Already failed, nothing further to report.
        assert!(!session.check_timeout(Instant::now() + Duration::from_secs(120)));
    }

    #[test]
    fn test_run_times_out() {
        let mut fake = FakeBootloader::for_image(SAMPLE);
        fake.silent = Some(CMD_ENTER_BOOTLOADER);
        let config = SessionConfig {
            ack_timeout_ms: 20,
            ..Default::default()
        };
        let (mut session, _, recorder) = session_with(fake, config);

        session.start_update(SAMPLE).unwrap();
        let err = session.run().unwrap_err();
        assert!(format!("{:#}", err).contains("ENTER_BOOTLOADER"));
        assert_eq!(recorder.error_code(), Some("TIMEOUT"));
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        session.start_update(SAMPLE).unwrap();

        for _ in 0..64 {
            if session.state().is_terminal() {
                break;
            }
            for chunk in mock.drain_rx() {
                for byte in chunk {
                    session.on_data(&[byte]).unwrap();
                }
            }
        }

        assert_eq!(session.state(), UpdateState::Done);
        assert_eq!(recorder.progress(), vec![50, 100]);
    }

    #[test]
    fn test_malformed_ack_keeps_state() {
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        session.start_update(SAMPLE).unwrap();
        mock.drain_rx();

        // Well framed but too short for an enter-bootloader answer.
        let short = reply(0x00, &[]);
        assert!(matches!(
            session.on_data(&short),
            Err(AckError::MalformedFrame(_))
        ));
        // Delimited span too short for the silicon fields.
        assert!(matches!(
            session.on_data(&[0x01, 0x00, 0x00, 0x00, 0x00, 0x55, 0x17]),
            Err(AckError::MalformedFrame(_))
        ));
        // Noise without a start marker is dropped.
        session.on_data(&[0x55, 0x17]).unwrap();
        // An unterminated span that outgrows the buffer.
        assert!(matches!(
            session.on_data(&[0x01; DEFAULT_MAX_BUFFER_SIZE + 1]),
            Err(AckError::MalformedFrame(_))
        ));

        assert_eq!(session.state(), UpdateState::EnteringBootloader);
        assert!(recorder.error_code().is_none());
    }

    #[test]
    fn test_start_validation() {
        let (mut session, _, _) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());

        assert!(session.start_update("").is_err());
        assert_eq!(session.state(), UpdateState::Idle);
        assert!(session.run().is_err());

        assert!(session.start_update(":0100").is_err());

        session.start_update(SAMPLE).unwrap();
        // Replies are still queued, so the first update is in progress.
        assert!(session.start_update(SAMPLE).is_err());
    }

    #[test]
    fn test_header_only_image() {
        let header_only = "0E50119E0000";
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(header_only), SessionConfig::default());

        session.start_update(header_only).unwrap();
        session.run().unwrap();

        assert_eq!(
            opcodes(&mock),
            vec![
                CMD_ENTER_BOOTLOADER,
                CMD_VERIFY_CHECKSUM,
                CMD_EXIT_BOOTLOADER
            ]
        );
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashStart)), 1);
        assert!(recorder.progress().is_empty());
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashFinished)), 1);
    }

    #[test]
    fn test_late_exit_ack_is_only_logged() {
        let (mut session, _, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();

        session.on_data(&reply(0x00, &[])).unwrap();
        assert_eq!(session.state(), UpdateState::Done);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashFinished)), 1);
    }

    #[test]
    fn test_write_failure() {
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        mock.disconnect();

        session.start_update(SAMPLE).unwrap();
        assert_eq!(session.state(), UpdateState::Error);
        assert_eq!(recorder.error_code(), Some("TRANSPORT_ERROR"));
        assert!(session.run().is_err());
    }

    #[test]
    fn test_session_can_restart_after_finish() {
        let (mut session, mock, recorder) =
            session_with(FakeBootloader::for_image(SAMPLE), SessionConfig::default());
        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();
        mock.clear_writes();

        session.start_update(SAMPLE).unwrap();
        session.run().unwrap();
        assert_eq!(mock.get_writes().len(), 8);
        assert_eq!(recorder.count(|e| matches!(e, DfuEvent::FlashStart)), 2);
    }

    /// Header `009E1150` rev `0E`, one row in array 0 whose verification
    /// sum is 0xFE.
    const CAPTURED_IMAGE: &str = "50119E000E00\n:0000D50002004027\n:END";

    #[test]
    fn test_captured_acknowledgements_drive_update() {
        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let mut session =
            DfuSession::with_observer(SessionConfig::default(), mock.clone(), recorder.clone());
        session.start_update(CAPTURED_IMAGE).unwrap();

        let steps = [
            ("01000800009E11500E003C0101ACFE17", UpdateState::ReadingFlashSize),
            ("010004000000D500FF0126FE17", UpdateState::ProgrammingRow(0)),
            ("010000AAFE17", UpdateState::VerifyingRow(0)),
            ("01000001FE17", UpdateState::VerifyingChecksum),
            ("010000AAFE17", UpdateState::Done),
        ];
        for (ack, state) in steps {
            session.on_data(&hex::decode(ack).unwrap()).unwrap();
            assert_eq!(session.state(), state, "after {}", ack);
        }

        assert_eq!(
            opcodes(&mock),
            vec![
                CMD_ENTER_BOOTLOADER,
                CMD_GET_FLASH_SIZE,
                CMD_PROGRAM_ROW,
                CMD_VERIFY_ROW,
                CMD_VERIFY_CHECKSUM,
                CMD_EXIT_BOOTLOADER,
            ]
        );
        assert_eq!(recorder.progress(), vec![100]);
        assert!(recorder.error_code().is_none());
    }

    #[test]
    fn test_captured_acknowledgements_in_one_delivery() {
        let mock = MockTransport::new();
        let mut session = DfuSession::new(SessionConfig::default(), mock.clone());
        session.start_update(CAPTURED_IMAGE).unwrap();

        // Enter and flash-size replies arrive back to back.
        let mut stream = hex::decode("01000800009E11500E003C0101ACFE17").unwrap();
        stream.extend(hex::decode("010004000000D500FF0126FE17").unwrap());
        session.on_data(&stream).unwrap();
        assert_eq!(session.state(), UpdateState::ProgrammingRow(0));
    }

    #[test]
    fn test_captured_error_status() {
        let mock = MockTransport::new();
        let recorder = Arc::new(Recorder::default());
        let mut session =
            DfuSession::with_observer(SessionConfig::default(), mock.clone(), recorder.clone());
        session.start_update(CAPTURED_IMAGE).unwrap();

        session
            .on_data(&hex::decode("01010800009E11500E003C0101ACFE17").unwrap())
            .unwrap();
        assert_eq!(session.state(), UpdateState::Error);
        assert_eq!(recorder.error_code(), Some("DEVICE_STATUS_ERROR"));
    }

    /// Row D5 in array 2, row D6 in array 1.
    fn two_array_image() -> String {
        let mut lines: Vec<String> = SAMPLE.lines().map(str::to_string).collect();
        lines[1].replace_range(1..3, "02");
        lines.join("\n")
    }

    fn flash_size_requests(mock: &MockTransport) -> Vec<u8> {
        mock.get_writes()
            .iter()
            .filter(|w| w[1] == CMD_GET_FLASH_SIZE)
            .map(|w| w[FRAME_HEADER_SIZE])
            .collect()
    }

    #[test]
    fn test_flash_size_requested_per_array() {
        let image = two_array_image();
        let (mut session, mock, _) =
            session_with(FakeBootloader::for_image(&image), SessionConfig::default());
        session.start_update(&image).unwrap();
        session.run().unwrap();

        assert_eq!(flash_size_requests(&mock), vec![0x02, 0x01]);
        assert_eq!(
            &opcodes(&mock)[..4],
            &[
                CMD_ENTER_BOOTLOADER,
                CMD_GET_FLASH_SIZE,
                CMD_GET_FLASH_SIZE,
                CMD_PROGRAM_ROW
            ]
        );
        assert_eq!(session.state(), UpdateState::Done);
    }

    #[test]
    fn test_second_array_out_of_range_before_any_write() {
        let image = two_array_image();
        let mut fake = FakeBootloader::for_image(&image);
        // Array 1 starts at row 0x100, past its row 0xD6.
        fake.array_flash_size = vec![(0x01, [0x00, 0x01, 0xFF, 0x01])];
        let (mut session, mock, recorder) = session_with(fake, SessionConfig::default());

        session.start_update(&image).unwrap();
        assert!(session.run().is_err());

        assert_eq!(recorder.error_code(), Some("ROW_OUT_OF_RANGE"));
        assert_eq!(flash_size_requests(&mock), vec![0x02, 0x01]);
        assert!(
            !opcodes(&mock)
                .iter()
                .any(|&op| op == CMD_PROGRAM_ROW || op == CMD_SEND_DATA)
        );
        assert!(matches!(
            session.last_error(),
            Some(UpdateError::RowOutOfRange { array_id: 0x01, .. })
        ));
    }

    #[test]
    fn test_oversized_max_data_size_is_clamped() {
        let row_len = u16::MAX as usize;
        let image = format!(
            "0E50119E0000\n:0100D5{:04X}{}00\n:END",
            row_len,
            "00".repeat(row_len)
        );
        let config = SessionConfig {
            max_data_size: usize::MAX,
            ..Default::default()
        };
        assert_eq!(config.fragment_size(), MAX_FRAGMENT_SIZE);

        let (mut session, mock, _) = session_with(FakeBootloader::for_image(&image), config);
        session.start_update(&image).unwrap();
        session.run().unwrap();

        let mut sent = 0;
        for w in mock.get_writes() {
            let declared = u16::from_le_bytes([w[2], w[3]]) as usize;
            assert_eq!(declared, w.len() - MIN_FRAME_SIZE);
            match w[1] {
                CMD_SEND_DATA => sent += declared,
                CMD_PROGRAM_ROW => sent += declared - ROW_ADDRESS_SIZE,
                _ => {}
            }
        }
        assert_eq!(sent, row_len);
        assert_eq!(session.state(), UpdateState::Done);
    }

    #[test]
    fn test_fragment_size_bounds() {
        let zero = SessionConfig {
            max_data_size: 0,
            ..Default::default()
        };
        assert_eq!(zero.fragment_size(), 1);
        assert_eq!(SessionConfig::default().fragment_size(), DEFAULT_MAX_DATA_SIZE);
    }

    #[test]
    fn test_config_defaults_and_toml() {
        let config: SessionConfig = toml::from_str("baud_rate = 57600\nport = \"/dev/ttyACM0\"").unwrap();
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.max_data_size, DEFAULT_MAX_DATA_SIZE);
        assert_eq!(config.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
        assert_eq!(config.max_row_retries, DEFAULT_MAX_ROW_RETRIES);

        let path = std::env::temp_dir().join(format!("cydfu-config-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = SessionConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
