/// Index of one RDMA path (connection) inside a session.
strong_type!(ConId, u16);

/// Index of a tag slot in a session's pool. Fits the 16-bit buffer id that
/// travels in immediate data.
strong_type!(TagId, u16);

/// Opaque caller context echoed back in the completion callback.
strong_type!(OpCookie, u64);

impl TagId {
    /// Slot index as a `usize` for indexing the pool arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}
