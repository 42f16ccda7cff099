use std::time::Duration;

/// Tunables for a scan/compress session.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Size of each read from a content stream.
    pub chunk_size: usize,
    /// Output bytes are coalesced until this many are pending, then handed
    /// to the sink in one write. `0` writes every record and chunk as-is.
    pub write_threshold: usize,
    /// Interval between average/current speed reports.
    pub speed_interval: Duration,
    /// Archive directories as their own (empty) entries.
    pub include_directories: bool,
    /// Capacity of the queue feeding progress observers.
    pub progress_queue: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            write_threshold: 4 * 1024 * 1024,
            speed_interval: Duration::from_secs(5),
            include_directories: false,
            progress_queue: 1024,
        }
    }
}

impl ArchiveOptions {
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn write_threshold(mut self, bytes: usize) -> Self {
        self.write_threshold = bytes;
        self
    }

    pub fn speed_interval(mut self, interval: Duration) -> Self {
        self.speed_interval = interval;
        self
    }

    pub fn include_directories(mut self, include: bool) -> Self {
        self.include_directories = include;
        self
    }

    pub fn progress_queue(mut self, capacity: usize) -> Self {
        self.progress_queue = capacity.max(1);
        self
    }
}
