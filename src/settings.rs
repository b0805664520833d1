use std::time::Duration;

const DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down";

const MIB: u64 = 1024 * 1024;

/// Converts MiB to bytes, `None` if the result does not fit in a `u64`.
pub fn mib_to_bytes(mb: u64) -> Option<u64> {
    mb.checked_mul(MIB)
}

/// Converts KiB to bytes (at least 1 KiB), saturating at `usize::MAX`.
pub fn kib_to_bytes(kb: usize) -> usize {
    kb.max(1).saturating_mul(1024)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub ping_target: String,
    pub ping_count: u32,
    pub ping_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Overrides the sized download URL when set.
    pub download_url: Option<String>,
    pub download_size_mb: u64,
    /// Remote upload sink. Unset or blank means simulate locally.
    pub upload_url: Option<String>,
    pub upload_size_mb: u64,
    pub chunk_kb: usize,
    pub read_chunk_kb: usize,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_target: "8.8.8.8".to_string(),
            ping_count: 5,
            ping_interval_ms: 500,
            probe_timeout_ms: 3_000,
            download_url: None,
            download_size_mb: 100,
            upload_url: None,
            upload_size_mb: 10,
            chunk_kb: 128,
            read_chunk_kb: 256,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn download_size_bytes(&self) -> u64 {
        self.download_size_mb.saturating_mul(1_000_000)
    }

    pub fn download_url(&self) -> String {
        match self.download_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("{}?bytes={}", DOWNLOAD_URL, self.download_size_bytes()),
        }
    }

    /// Configured sink, if any is actually set.
    pub fn upload_url(&self) -> Option<&str> {
        self.upload_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn upload_size_bytes(&self) -> u64 {
        mib_to_bytes(self.upload_size_mb).unwrap_or(u64::MAX)
    }

    pub fn chunk_bytes(&self) -> usize {
        kib_to_bytes(self.chunk_kb)
    }

    pub fn read_chunk_bytes(&self) -> usize {
        kib_to_bytes(self.read_chunk_kb)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
