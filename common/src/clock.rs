/// A single reading of the device clock.
///
/// Before time synchronization completes the only usable time base is
/// seconds since boot; afterwards it is epoch seconds. The tag makes the
/// clock mode explicit so consumers never have to guess it from the
/// magnitude of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeReading {
    /// Seconds since boot; the clock has not synchronized yet.
    Relative(u64),
    /// Epoch seconds from a synchronized clock.
    Absolute(u64),
}

impl TimeReading {
    pub fn seconds(self) -> u64 {
        match self {
            Self::Relative(secs) | Self::Absolute(secs) => secs,
        }
    }

    pub fn is_synced(self) -> bool {
        matches!(self, Self::Absolute(_))
    }
}

/// Seam to the time-source collaborator. A reading may flip from
/// `Relative` to `Absolute` between calls (synchronization completing);
/// it never flips back, and the untagged value only ever jumps forward.
pub trait Clock {
    fn now(&self) -> TimeReading;
}
