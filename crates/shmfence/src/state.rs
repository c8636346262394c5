//! Fence state word and its transition protocol

use crate::wait::WaitPrimitive;
use crate::wait::WaitResult;
use crate::{Error, Result};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

/// Values the fence word can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FenceState {
    /// Not triggered, at least one waiter may be parked
    UnsetParked = -1,
    /// Not triggered, nobody parked
    Unset = 0,
    /// Triggered
    Set = 1,
}

impl FenceState {
    /// Convert from the raw word value
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            -1 => Some(FenceState::UnsetParked),
            0 => Some(FenceState::Unset),
            1 => Some(FenceState::Set),
            _ => None,
        }
    }
}

/// The fence word as laid out in shared memory
///
/// A single `i32` at offset 0, no header. Zero-filled storage is a valid,
/// untriggered fence.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct FenceCell {
    word: AtomicI32,
}

/// Size in bytes of the shared segment backing one fence
pub const FENCE_SIZE: usize = std::mem::size_of::<FenceCell>();

impl FenceCell {
    /// Create an untriggered fence cell
    pub const fn new() -> Self {
        Self {
            word: AtomicI32::new(FenceState::Unset as i32),
        }
    }

    /// Raw word value
    pub fn raw(&self) -> i32 {
        self.word.load(Ordering::SeqCst)
    }

    /// Current state, `None` if the word holds a foreign value
    pub fn state(&self) -> Option<FenceState> {
        FenceState::from_i32(self.raw())
    }

    /// CAS `from -> to`, returning the value observed before the swap.
    fn transition(&self, from: FenceState, to: FenceState) -> i32 {
        match self
            .word
            .compare_exchange(from as i32, to as i32, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Move the fence to SET, waking parked waiters if any.
    ///
    /// Triggering an already triggered fence succeeds without side effects.
    /// The wake is only issued when a waiter announced itself by parking.
    pub fn trigger<W: WaitPrimitive>(&self, waiter: &W) -> Result<()> {
        if self.transition(FenceState::Unset, FenceState::Set) == FenceState::UnsetParked as i32 {
            self.word.store(FenceState::Set as i32, Ordering::SeqCst);
            tracing::trace!("fence triggered with parked waiters, waking");
            waiter.wake_all(&self.word).map_err(Error::Io)?;
        }
        Ok(())
    }

    /// Block until the fence is SET.
    ///
    /// Returns immediately if it already is. Spurious and interrupted waits
    /// are retried; any other wait failure is returned, as is a word holding
    /// a value outside the three fence states.
    pub fn wait<W: WaitPrimitive>(&self, waiter: &W) -> Result<()> {
        loop {
            let prev = self.transition(FenceState::Unset, FenceState::UnsetParked);
            match FenceState::from_i32(prev) {
                Some(FenceState::Set) => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("fence word holds {}", prev),
                    )))
                }
            }

            tracing::trace!("parking on fence");
            match waiter.wait_while_equals(&self.word, FenceState::UnsetParked as i32) {
                WaitResult::Woken | WaitResult::WouldBlock => continue,
                WaitResult::Error(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Whether the fence is SET
    pub fn query(&self) -> bool {
        self.raw() == FenceState::Set as i32
    }

    /// Move a SET fence back to UNSET; no effect otherwise.
    pub fn reset(&self) {
        self.transition(FenceState::Set, FenceState::Unset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Scripted wait primitive that records every call
    #[derive(Default)]
    struct Recorder {
        waits: AtomicUsize,
        wakes: AtomicUsize,
        script: Mutex<Vec<Step>>,
    }

    enum Step {
        Spurious,
        Interrupted,
        TriggerElsewhere,
        Fail(io::ErrorKind),
    }

    impl Recorder {
        fn scripted(mut steps: Vec<Step>) -> Self {
            steps.reverse();
            Self {
                script: Mutex::new(steps),
                ..Default::default()
            }
        }
    }

    impl WaitPrimitive for Recorder {
        fn wait_while_equals(&self, word: &AtomicI32, expected: i32) -> WaitResult {
            self.waits.fetch_add(1, Ordering::SeqCst);
            assert_eq!(expected, FenceState::UnsetParked as i32);
            match self.script.lock().unwrap().pop() {
                Some(Step::Spurious) => WaitResult::Woken,
                Some(Step::Interrupted) => WaitResult::WouldBlock,
                Some(Step::TriggerElsewhere) => {
                    word.store(FenceState::Set as i32, Ordering::SeqCst);
                    WaitResult::Woken
                }
                Some(Step::Fail(kind)) => WaitResult::Error(io::Error::from(kind)),
                None => panic!("unexpected park"),
            }
        }

        fn wake_all(&self, _word: &AtomicI32) -> io::Result<()> {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenWake;

    impl WaitPrimitive for BrokenWake {
        fn wait_while_equals(&self, _word: &AtomicI32, _expected: i32) -> WaitResult {
            WaitResult::WouldBlock
        }

        fn wake_all(&self, _word: &AtomicI32) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::EFAULT))
        }
    }

    #[test]
    fn test_fence_size() {
        assert_eq!(FENCE_SIZE, 4);
        assert_eq!(FenceCell::default().state(), Some(FenceState::Unset));
    }

    #[test]
    fn test_state_from_i32() {
        assert_eq!(FenceState::from_i32(-1), Some(FenceState::UnsetParked));
        assert_eq!(FenceState::from_i32(0), Some(FenceState::Unset));
        assert_eq!(FenceState::from_i32(1), Some(FenceState::Set));
        assert_eq!(FenceState::from_i32(2), None);
    }

    #[test]
    fn test_trigger_without_waiters_skips_wake() {
        let cell = FenceCell::new();
        let rec = Recorder::default();

        cell.trigger(&rec).unwrap();
        assert!(cell.query());
        assert_eq!(rec.wakes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trigger_with_parked_waiter_wakes() {
        let cell = FenceCell::new();
        let rec = Recorder::default();
        cell.word.store(FenceState::UnsetParked as i32, Ordering::SeqCst);

        cell.trigger(&rec).unwrap();
        assert_eq!(cell.state(), Some(FenceState::Set));
        assert_eq!(rec.wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_is_idempotent() {
        let cell = FenceCell::new();
        let rec = Recorder::default();

        cell.trigger(&rec).unwrap();
        cell.trigger(&rec).unwrap();
        assert!(cell.query());
        assert_eq!(rec.wakes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_trigger_surfaces_wake_failure() {
        let cell = FenceCell::new();
        cell.word.store(FenceState::UnsetParked as i32, Ordering::SeqCst);

        let err = cell.trigger(&BrokenWake).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.io_error().raw_os_error(), Some(libc::EFAULT));
        // the state change itself has already happened
        assert!(cell.query());
    }

    #[test]
    fn test_wait_after_trigger_never_parks() {
        let cell = FenceCell::new();
        let rec = Recorder::default();

        cell.trigger(&rec).unwrap();
        cell.wait(&rec).unwrap();
        assert_eq!(rec.waits.load(Ordering::SeqCst), 0);
        assert!(cell.query());
    }

    #[test]
    fn test_wait_retries_spurious_and_interrupted() {
        let cell = FenceCell::new();
        let rec = Recorder::scripted(vec![
            Step::Spurious,
            Step::Interrupted,
            Step::TriggerElsewhere,
        ]);

        cell.wait(&rec).unwrap();
        assert_eq!(rec.waits.load(Ordering::SeqCst), 3);
        assert_eq!(cell.state(), Some(FenceState::Set));
    }

    #[test]
    fn test_wait_marks_parked_before_blocking() {
        let cell = FenceCell::new();
        let rec = Recorder::scripted(vec![Step::Fail(io::ErrorKind::InvalidInput)]);

        let err = cell.wait(&rec).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(cell.state(), Some(FenceState::UnsetParked));
    }

    #[test]
    fn test_wait_on_corrupt_word_fails() {
        let cell = FenceCell::new();
        let rec = Recorder::default();
        cell.word.store(7, Ordering::SeqCst);

        let err = cell.wait(&rec).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.io_error().kind(), io::ErrorKind::InvalidData);
        assert_eq!(rec.waits.load(Ordering::SeqCst), 0);
        assert_eq!(cell.raw(), 7);
    }

    #[test]
    fn test_reset() {
        let cell = FenceCell::new();
        let rec = Recorder::default();

        cell.reset();
        assert_eq!(cell.state(), Some(FenceState::Unset));

        cell.trigger(&rec).unwrap();
        cell.reset();
        assert!(!cell.query());
        assert_eq!(cell.state(), Some(FenceState::Unset));
    }

    #[test]
    fn test_reset_leaves_parked_marker() {
        let cell = FenceCell::new();
        cell.word.store(FenceState::UnsetParked as i32, Ordering::SeqCst);

        cell.reset();
        assert_eq!(cell.state(), Some(FenceState::UnsetParked));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_threads_on_local_cell() {
        use crate::wait::Futex;
        use std::thread;
        use std::time::Duration;

        let cell = FenceCell::new();
        thread::scope(|s| {
            let waiters: Vec<_> = (0..4).map(|_| s.spawn(|| cell.wait(&Futex))).collect();

            thread::sleep(Duration::from_millis(50));
            cell.trigger(&Futex).unwrap();

            for w in waiters {
                w.join().unwrap().unwrap();
            }
        });
        assert!(cell.query());
    }
}
