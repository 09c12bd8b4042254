//! 以帳戶為單位的固定視窗速率限制。

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::debug;

use crate::error::{AcmeError, Result};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// 每個鍵在 `window` 內最多允許 `limit` 次；`limit` 為 0 表示不限制。
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// 每小時 `limit` 次。
    pub fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(3600))
    }

    /// 記錄一次請求；超過上限時回傳 `RateLimited`，且不計入本次。
    pub fn check(&self, key: &str) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        if entry.count >= self.limit {
            let retry_in = self.window.saturating_sub(now.duration_since(entry.started));
            debug!("Rate limit hit for {}", key);
            return Err(AcmeError::RateLimited(format!(
                "at most {} new orders per {}s, retry in {}s",
                self.limit,
                self.window.as_secs(),
                retry_in.as_secs()
            )));
        }
        entry.count += 1;
        Ok(())
    }

    /// 移除已過期的視窗，回傳移除數量。
    pub fn purge(&self) -> usize {
        let before = self.windows.len();
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < self.window);
        before - self.windows.len()
    }
}
