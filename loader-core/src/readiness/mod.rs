//! Readiness handshake shared with the controller process.
//!
//! The loader owns one 4-byte slot named after its process id. It writes the
//! sentinel `0` before doing anything else and the endpoint port once boot
//! completes. A controller that knows the pid opens the same slot and polls it;
//! any non-zero value is final.

mod file;
#[cfg(windows)]
mod mapped;

pub use file::FileSlot;
#[cfg(windows)]
pub use mapped::MappedSlot;

use crate::error::ReadinessError;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Prefix of every handshake segment name.
pub const SEGMENT_PREFIX: &str = "Reloaded-Mod-Loader-Server-PID-";

/// Size of the handshake value in bytes.
pub const SLOT_SIZE: usize = std::mem::size_of::<i32>();

/// Slot storage used on this platform.
#[cfg(windows)]
pub type PlatformSlot = MappedSlot;
#[cfg(not(windows))]
pub type PlatformSlot = FileSlot;

/// Name of the handshake segment for a process.
pub fn segment_name(pid: u32) -> String {
    format!("{}{}", SEGMENT_PREFIX, pid)
}

/// Backing store for the handshake value.
pub trait SlotStorage: Send + Sync {
    /// Create the slot for `pid`, or open it if it already exists.
    fn create(pid: u32) -> Result<Self, ReadinessError>
    where
        Self: Sized;

    /// Open an existing slot for `pid` without creating it.
    fn open(pid: u32) -> Result<Self, ReadinessError>
    where
        Self: Sized;

    fn store(&self, value: i32) -> Result<(), ReadinessError>;

    fn load(&self) -> Result<i32, ReadinessError>;
}

/// Observed handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// Still booting, or boot failed.
    Loading,
    /// Boot completed; the value is the endpoint port.
    Ready(i32),
}

impl ReadinessState {
    pub fn from_raw(value: i32) -> Self {
        if value > 0 {
            Self::Ready(value)
        } else {
            Self::Loading
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unset,
    Sentinel,
    Committed(i32),
}

/// Writer side of the handshake, owned by the loader.
pub struct ReadinessPublisher<S: SlotStorage = PlatformSlot> {
    storage: S,
    pid: u32,
    phase: Mutex<Phase>,
}

impl ReadinessPublisher<PlatformSlot> {
    /// Create or open the handshake segment for `pid`.
    ///
    /// # Errors
    /// Returns `ReadinessError::SegmentCreateFailed` if the segment cannot be created.
    pub fn publish(pid: u32) -> Result<Self, ReadinessError> {
        Ok(Self::with_storage(PlatformSlot::create(pid)?, pid))
    }
}

impl<S: SlotStorage> ReadinessPublisher<S> {
    /// Wrap an already created slot.
    pub fn with_storage(storage: S, pid: u32) -> Self {
        log::debug!("Handshake segment '{}' ready", segment_name(pid));
        Self {
            storage,
            pid,
            phase: Mutex::new(Phase::Unset),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write the loading sentinel.
    ///
    /// # Errors
    /// Returns `ReadinessError::AlreadyCommitted` once a token has been committed.
    pub fn reset(&self) -> Result<(), ReadinessError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);

        if let Phase::Committed(token) = *phase {
            return Err(ReadinessError::AlreadyCommitted(token));
        }

        self.storage.store(0)?;
        *phase = Phase::Sentinel;
        Ok(())
    }

    /// Publish the final readiness token.
    ///
    /// # Errors
    /// * `ReadinessError::InvalidToken` - token is not positive
    /// * `ReadinessError::AlreadyCommitted` - a token was already published
    pub fn commit(&self, token: i32) -> Result<(), ReadinessError> {
        if token <= 0 {
            return Err(ReadinessError::InvalidToken(token));
        }

        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);

        if let Phase::Committed(existing) = *phase {
            return Err(ReadinessError::AlreadyCommitted(existing));
        }

        self.storage.store(token)?;
        *phase = Phase::Committed(token);

        log::info!("Published readiness token {} for process {}", token, self.pid);
        Ok(())
    }

    /// The committed token, if any.
    pub fn committed(&self) -> Option<i32> {
        match *self.phase.lock().unwrap_or_else(PoisonError::into_inner) {
            Phase::Committed(token) => Some(token),
            _ => None,
        }
    }

    /// Read back what the controller would see.
    pub fn state(&self) -> Result<ReadinessState, ReadinessError> {
        self.storage.load().map(ReadinessState::from_raw)
    }
}

/// Reader side of the handshake, used by the controller.
pub struct ReadinessReader<S: SlotStorage = PlatformSlot> {
    storage: S,
    pid: u32,
}

impl ReadinessReader<PlatformSlot> {
    /// Open the handshake segment of a running loader.
    ///
    /// # Errors
    /// Returns `ReadinessError::SegmentOpenFailed` if no loader published one.
    pub fn open(pid: u32) -> Result<Self, ReadinessError> {
        Ok(Self::with_storage(PlatformSlot::open(pid)?, pid))
    }
}

impl<S: SlotStorage> ReadinessReader<S> {
    pub fn with_storage(storage: S, pid: u32) -> Self {
        Self { storage, pid }
    }

    pub fn read(&self) -> Result<ReadinessState, ReadinessError> {
        self.storage.load().map(ReadinessState::from_raw)
    }

    /// Poll until the slot holds a token or `timeout` elapses.
    ///
    /// # Errors
    /// Returns `ReadinessError::Timeout` if the loader never became ready.
    pub fn wait(&self, timeout: Duration, interval: Duration) -> Result<i32, ReadinessError> {
        let started = Instant::now();

        loop {
            if let ReadinessState::Ready(token) = self.read()? {
                log::debug!(
                    "Process {} ready after {}ms",
                    self.pid,
                    started.elapsed().as_millis()
                );
                return Ok(token);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ReadinessError::Timeout {
                    pid: self.pid,
                    waited,
                });
            }

            std::thread::sleep(interval.min(timeout - waited));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publisher(dir: &TempDir, pid: u32) -> ReadinessPublisher<FileSlot> {
        let slot = FileSlot::create_in(dir.path(), pid).expect("Failed to create slot");
        ReadinessPublisher::with_storage(slot, pid)
    }

    fn reader(dir: &TempDir, pid: u32) -> ReadinessReader<FileSlot> {
        let slot = FileSlot::open_in(dir.path(), pid).expect("Failed to open slot");
        ReadinessReader::with_storage(slot, pid)
    }

    #[test]
    fn test_segment_name_is_deterministic() {
        assert_eq!(segment_name(4242), "Reloaded-Mod-Loader-Server-PID-4242");
        assert_eq!(segment_name(4242), segment_name(4242));
        assert_ne!(segment_name(1), segment_name(2));
    }

    #[test]
    fn test_state_from_raw() {
        assert_eq!(ReadinessState::from_raw(0), ReadinessState::Loading);
        assert_eq!(ReadinessState::from_raw(-5), ReadinessState::Loading);
        assert_eq!(ReadinessState::from_raw(8080), ReadinessState::Ready(8080));
    }

    #[test]
    fn test_reset_then_commit_visible_to_reader() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, 100);

        publisher.reset().unwrap();
        let reader = reader(&dir, 100);
        assert_eq!(reader.read().unwrap(), ReadinessState::Loading);

        publisher.commit(31337).unwrap();
        assert_eq!(reader.read().unwrap(), ReadinessState::Ready(31337));
        assert_eq!(publisher.committed(), Some(31337));
    }

    #[test]
    fn test_commit_rejects_non_positive_token() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, 101);
        publisher.reset().unwrap();

        assert!(matches!(
            publisher.commit(0),
            Err(ReadinessError::InvalidToken(0))
        ));
        assert!(matches!(
            publisher.commit(-7),
            Err(ReadinessError::InvalidToken(-7))
        ));
        assert_eq!(publisher.state().unwrap(), ReadinessState::Loading);
    }

    #[test]
    fn test_committed_token_never_reverts() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, 102);
        publisher.reset().unwrap();
        publisher.commit(5000).unwrap();

        assert!(matches!(
            publisher.reset(),
            Err(ReadinessError::AlreadyCommitted(5000))
        ));
        assert!(matches!(
            publisher.commit(6000),
            Err(ReadinessError::AlreadyCommitted(5000))
        ));

        for _ in 0..3 {
            assert_eq!(publisher.state().unwrap(), ReadinessState::Ready(5000));
        }
    }

    #[test]
    fn test_wait_returns_token() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, 103);
        publisher.reset().unwrap();
        let reader = reader(&dir, 103);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(30));
                publisher.commit(1234).unwrap();
            });

            let token = reader
                .wait(Duration::from_secs(5), Duration::from_millis(5))
                .unwrap();
            assert_eq!(token, 1234);
        });
    }

    #[test]
    fn test_wait_times_out_on_sentinel() {
        let dir = TempDir::new().unwrap();
        let publisher = publisher(&dir, 104);
        publisher.reset().unwrap();
        let reader = reader(&dir, 104);

        match reader.wait(Duration::from_millis(40), Duration::from_millis(10)) {
            Err(ReadinessError::Timeout { pid: 104, .. }) => {}
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }
}
