use std::time::Duration;
use time::OffsetDateTime;

/// Counters a session accumulates over its lifetime.
///
/// Shown in the session log line on terminate and fetchable by the client.
#[derive(Clone, Debug)]
pub struct ConnectionStatistics {
    created_at: OffsetDateTime,
    roundtrip_count: u64,
    rows_streamed: u64,
    lob_bytes_read: u64,
    lob_bytes_written: u64,
    accumulated_wait: Duration,
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self {
            created_at: OffsetDateTime::now_utc(),
            roundtrip_count: 0,
            rows_streamed: 0,
            lob_bytes_read: 0,
            lob_bytes_written: 0,
            accumulated_wait: Duration::ZERO,
        }
    }
}

impl ConnectionStatistics {
    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn add_roundtrip(&mut self, wait: Duration) {
        self.roundtrip_count += 1;
        self.accumulated_wait += wait;
    }

    pub fn add_rows_streamed(&mut self, rows: u64) {
        self.rows_streamed += rows;
    }

    pub fn add_lob_bytes_read(&mut self, bytes: u64) {
        self.lob_bytes_read += bytes;
    }

    pub fn add_lob_bytes_written(&mut self, bytes: u64) {
        self.lob_bytes_written += bytes;
    }

    pub fn roundtrip_count(&self) -> u64 {
        self.roundtrip_count
    }

    pub fn rows_streamed(&self) -> u64 {
        self.rows_streamed
    }

    pub fn reset(&mut self) {
        let created_at = self.created_at;
        *self = Self::default();
        self.created_at = created_at;
    }
}

impl std::fmt::Display for ConnectionStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} roundtrips ({} ms accumulated), {} rows, {} lob bytes read, {} lob bytes written",
            self.roundtrip_count,
            self.accumulated_wait.as_millis(),
            self.rows_streamed,
            self.lob_bytes_read,
            self.lob_bytes_written,
        )
    }
}
