//! Software multi-word compare-and-swap.
//!
//! Timothy L. Harris, Keir Fraser and Ian A. Pratt. A Practical Multi-Word Compare-and-Swap
//! Operation. DISC 2002.
//!
//! A cell holds either a value or a descriptor, told apart by the two low bits:
//!
//! - `0b00`: a value, encoded by [`Word`].
//! - `0b01`: an entry of an MCAS descriptor that is being installed (the RDCSS step).
//! - `0b10`: an MCAS descriptor that owns the cell until it is decided.
//!
//! An MCAS first installs its descriptor into every cell, in address order, then decides with one
//! CAS on its status, then replaces the descriptor with the new (or, on failure, the old) values.
//! A thread that finds a descriptor in a cell finishes that operation before it goes on.
//!
//! Helping is iterative. A frame only ever waits on a descriptor that owns a cell with a higher
//! address than every cell the frame owns, so the chain of frames cannot cycle and is bounded by
//! the number of in-flight operations.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering::*};

use crossbeam_epoch::{pin, Guard, Owned, Shared};
use tracing::trace;

use crate::error::{Error, Result};

const TAG_MASK: usize = 0b11;
const RDCSS_TAG: usize = 0b01;
const MCAS_TAG: usize = 0b10;

/// A value that fits a cell.
///
/// `into_raw` must leave the two low bits clear, and `from_raw(into_raw(x)) == x` for every `x`.
/// Types with values that do not survive the shift, like `usize`, go through [`Small`].
pub trait Word: Copy + Eq {
    /// Encodes the value.
    fn into_raw(self) -> usize;
    /// Decodes a value produced by `into_raw`.
    fn from_raw(raw: usize) -> Self;
}

/// A `usize` of at most [`Small::MAX`], so that it fits a cell next to the tag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Small(usize);

impl Small {
    /// Largest value that fits.
    pub const MAX: usize = usize::MAX >> 2;

    /// Fails with [`Error::InvalidArgument`] if `value` exceeds [`Small::MAX`].
    pub fn new(value: usize) -> Result<Self> {
        if value > Self::MAX {
            return Err(Error::InvalidArgument(format!(
                "{value} does not fit an MCAS cell (max {})",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    /// The value.
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl Word for Small {
    #[inline]
    fn into_raw(self) -> usize {
        self.0 << 2
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        Self(raw >> 2)
    }
}

impl Word for u8 {
    #[inline]
    fn into_raw(self) -> usize {
        usize::from(self) << 2
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        (raw >> 2) as u8
    }
}

#[cfg(target_pointer_width = "64")]
impl Word for u32 {
    #[inline]
    fn into_raw(self) -> usize {
        (self as usize) << 2
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        (raw >> 2) as u32
    }
}

impl Word for bool {
    #[inline]
    fn into_raw(self) -> usize {
        usize::from(self) << 2
    }

    #[inline]
    fn from_raw(raw: usize) -> Self {
        raw != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Status {
    Undecided = 0,
    Successful = 1,
    Failed = 2,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Undecided,
            1 => Self::Successful,
            _ => Self::Failed,
        }
    }
}

struct Slot {
    cell: *const AtomicUsize,
    expected: usize,
    new: usize,
    /// The descriptor this slot belongs to.
    owner: *const Descriptor,
}

struct Descriptor {
    status: AtomicU8,
    slots: Box<[Slot]>,
}

impl Descriptor {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Acquire))
    }
}

#[inline]
fn tagged<T>(ptr: *const T, tag: usize) -> usize {
    ptr as usize | tag
}

#[inline]
fn untagged<T>(raw: usize) -> *const T {
    (raw & !TAG_MASK) as *const T
}

/// Finishes the install of `slot`: points the cell at the owning descriptor if it is still
/// undecided, or puts the expected value back.
///
/// # Safety
///
/// `slot`, its descriptor and its cell must be alive.
unsafe fn complete(slot: &Slot) {
    let owner = unsafe { &*slot.owner };
    let cell = unsafe { &*slot.cell };
    let target = if owner.status() == Status::Undecided {
        tagged(slot.owner, MCAS_TAG)
    } else {
        slot.expected
    };
    let _ = cell.compare_exchange(tagged(slot, RDCSS_TAG), target, AcqRel, Acquire);
}

/// Installs `slot` into its cell if the cell holds the expected value and the owner is undecided.
/// Returns what the cell held before.
///
/// # Safety
///
/// As for `complete`.
unsafe fn rdcss(slot: &Slot) -> usize {
    let cell = unsafe { &*slot.cell };
    let mine = tagged(slot, RDCSS_TAG);
    loop {
        match cell.compare_exchange(slot.expected, mine, AcqRel, Acquire) {
            Ok(seen) => {
                unsafe { complete(slot) };
                return seen;
            }
            Err(seen) if seen & TAG_MASK == RDCSS_TAG => {
                unsafe { complete(&*untagged::<Slot>(seen)) };
            }
            Err(seen) => return seen,
        }
    }
}

enum Step {
    Help(*const Descriptor),
    Done(bool),
}

/// Progress of one descriptor being helped.
struct Frame {
    desc: *const Descriptor,
    next: usize,
}

impl Frame {
    fn new(desc: *const Descriptor) -> Self {
        Self { desc, next: 0 }
    }

    /// # Safety
    ///
    /// The descriptor must be alive.
    unsafe fn step(&mut self) -> Step {
        let desc = unsafe { &*self.desc };
        let mine = tagged(self.desc, MCAS_TAG);

        if desc.status() == Status::Undecided {
            let mut outcome = Status::Successful;
            while let Some(slot) = desc.slots.get(self.next) {
                let seen = unsafe { rdcss(slot) };
                if seen & TAG_MASK == MCAS_TAG {
                    if seen != mine {
                        return Step::Help(untagged(seen));
                    }
                } else if seen != slot.expected {
                    outcome = Status::Failed;
                    break;
                }
                self.next += 1;
            }
            if desc
                .status
                .compare_exchange(Status::Undecided as u8, outcome as u8, AcqRel, Acquire)
                .is_ok()
            {
                trace!(?outcome, cells = desc.slots.len(), "mcas decided");
            }
        }

        let succeeded = desc.status() == Status::Successful;
        for slot in desc.slots.iter() {
            let value = if succeeded { slot.new } else { slot.expected };
            let _ = unsafe { &*slot.cell }.compare_exchange(mine, value, AcqRel, Acquire);
        }
        Step::Done(succeeded)
    }
}

/// Runs `desc` to completion, helping whatever it runs into.
///
/// # Safety
///
/// The descriptor must be alive, which holds for any descriptor read from a cell while pinned.
unsafe fn help(desc: *const Descriptor) -> bool {
    let mut frames = vec![Frame::new(desc)];
    let mut outcome = false;
    while let Some(frame) = frames.last_mut() {
        match unsafe { frame.step() } {
            Step::Help(other) => frames.push(Frame::new(other)),
            Step::Done(succeeded) => {
                outcome = succeeded;
                let _ = frames.pop();
            }
        }
    }
    outcome
}

/// Finishes whatever operation `raw` belongs to.
///
/// # Safety
///
/// `raw` must have been read from a cell while pinned.
unsafe fn help_raw(raw: usize) {
    match raw & TAG_MASK {
        RDCSS_TAG => unsafe { complete(&*untagged::<Slot>(raw)) },
        MCAS_TAG => {
            let _ = unsafe { help(untagged(raw)) };
        }
        _ => {}
    }
}

/// A word that can take part in an [`mcas`].
pub struct McasCell<T> {
    raw: AtomicUsize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for McasCell<T> {}
unsafe impl<T: Send + Sync> Sync for McasCell<T> {}

impl<T: Word + fmt::Debug> fmt::Debug for McasCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("McasCell").field(&self.read(&pin())).finish()
    }
}

impl<T: Word> McasCell<T> {
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        let raw = value.into_raw();
        debug_assert_eq!(raw & TAG_MASK, 0, "Word::into_raw must clear the two low bits");
        Self {
            raw: AtomicUsize::new(raw),
            _marker: PhantomData,
        }
    }

    /// Reads the current value, finishing any operation in flight on this cell.
    pub fn read(&self, _guard: &Guard) -> T {
        loop {
            let raw = self.raw.load(Acquire);
            if raw & TAG_MASK == 0 {
                return T::from_raw(raw);
            }
            // SAFETY: read while pinned.
            unsafe { help_raw(raw) };
        }
    }

    /// Single-word CAS that respects operations in flight. Returns `true` on success.
    pub fn compare_and_swap(&self, expected: T, new: T, _guard: &Guard) -> bool {
        let (expected, new) = (expected.into_raw(), new.into_raw());
        loop {
            match self.raw.compare_exchange(expected, new, AcqRel, Acquire) {
                Ok(_) => return true,
                Err(seen) if seen & TAG_MASK == 0 => return false,
                // SAFETY: read while pinned.
                Err(seen) => unsafe { help_raw(seen) },
            }
        }
    }

    /// Reads without helping. Only for a cell nobody else can reach.
    pub(crate) fn into_inner(self) -> T {
        T::from_raw(self.raw.into_inner())
    }
}

/// One `(cell, expected, new)` triple of an [`mcas`].
pub struct McasEntry<'a> {
    cell: &'a AtomicUsize,
    expected: usize,
    new: usize,
}

impl fmt::Debug for McasEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McasEntry")
            .field("cell", &(self.cell as *const AtomicUsize))
            .finish_non_exhaustive()
    }
}

impl<'a> McasEntry<'a> {
    /// Expects `cell` to hold `expected`, and replaces it with `new`.
    pub fn new<T: Word>(cell: &'a McasCell<T>, expected: T, new: T) -> Self {
        Self {
            cell: &cell.raw,
            expected: expected.into_raw(),
            new: new.into_raw(),
        }
    }

    fn addr(&self) -> usize {
        self.cell as *const AtomicUsize as usize
    }
}

/// Atomically replaces the expected value of every entry with its new value, if all cells hold
/// their expected values. Returns whether it did.
///
/// Entries are sorted by cell address first. A cell may appear only once.
pub fn mcas(entries: &mut [McasEntry<'_>], guard: &Guard) -> Result<bool> {
    entries.sort_unstable_by_key(McasEntry::addr);
    if entries.windows(2).any(|w| w[0].addr() == w[1].addr()) {
        return Err(Error::InvalidArgument(
            "a cell appears twice in one mcas".to_string(),
        ));
    }
    if entries.is_empty() {
        return Ok(true);
    }

    let mut desc = Owned::new(Descriptor {
        status: AtomicU8::new(Status::Undecided as u8),
        slots: entries
            .iter()
            .map(|e| Slot {
                cell: e.cell,
                expected: e.expected,
                new: e.new,
                owner: core::ptr::null(),
            })
            .collect(),
    });
    let owner: *const Descriptor = &*desc;
    for slot in desc.slots.iter_mut() {
        slot.owner = owner;
    }
    let desc = desc.into_shared(guard);

    // SAFETY: we own the descriptor until it is retired below.
    let succeeded = unsafe { help(desc.as_raw()) };
    retire(desc, guard);
    Ok(succeeded)
}

/// Frees `desc` after two grace periods.
///
/// A helper that saw the descriptor undecided may still install one of its slots into a cell
/// whose value came back to the expected one, after the operation finished. Such a helper was
/// pinned before the retirement, and takes its slot out before it unpins; the second grace period
/// covers the threads that read the slot in between.
fn retire(desc: Shared<'_, Descriptor>, guard: &Guard) {
    let raw = desc.as_raw() as usize;
    guard.defer(move || {
        let guard = pin();
        // SAFETY: one grace period passed, so no cell can refer to the descriptor anymore.
        unsafe { guard.defer_destroy(Shared::from(raw as *const Descriptor)) };
    });
}
