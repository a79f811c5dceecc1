//! Identifier types shared by every component.

int_like!(FlagId, AtomicFlagId, u32, AtomicU32);
int_like!(UnitId, AtomicUnitId, u32, AtomicU32);
int_like!(ProbeId, AtomicProbeId, u32, AtomicU32);

// Byte offset into the executable text region.
int_like!(TextAddr, usize);

impl UnitId {
    /// The unit that owns statically declared keys; it is never unloaded.
    pub const CORE: Self = Self::new(0);
}

impl TextAddr {
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self::new(self.0 + bytes)
    }

    /// Signed distance from `self` to `to`.
    #[inline]
    pub const fn distance_to(self, to: TextAddr) -> i64 {
        to.0 as i64 - self.0 as i64
    }

    /// Applies a signed displacement, `None` if the result is negative.
    #[inline]
    pub fn offset(self, disp: i64) -> Option<TextAddr> {
        let addr = (self.0 as i64).checked_add(disp)?;
        usize::try_from(addr).ok().map(TextAddr::new)
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }
}
