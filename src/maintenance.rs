//! 背景維護：定期清除過期 nonce、讓逾期的訂單與授權失效、對帳 processing 中的訂單，
//! 並接手沒有執行緒在驗證的 processing 挑戰。

use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info};

use crate::{
    nonce::NonceStore, order::OrderEngine, rate_limit::RateLimiter, validator::ChallengeValidator,
};

/// 單次維護的結果統計。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub nonces_purged: usize,
    pub expired: usize,
    pub reconciled: usize,
    pub resumed: usize,
}

/// 維護工作需要的元件。
#[derive(Debug, Clone)]
pub struct Maintenance {
    nonces: Arc<NonceStore>,
    engine: Arc<OrderEngine>,
    validator: ChallengeValidator,
    limiter: Arc<RateLimiter>,
}

impl Maintenance {
    pub fn new(
        nonces: Arc<NonceStore>,
        engine: Arc<OrderEngine>,
        validator: ChallengeValidator,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            nonces,
            engine,
            validator,
            limiter,
        }
    }

    /// 執行一次維護；單一步驟失敗只記錄，不影響其他步驟。
    pub fn run_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        match self.nonces.purge_expired() {
            Ok(n) => report.nonces_purged = n,
            Err(e) => error!("Nonce purge failed: {}", e),
        }
        match self.engine.expire_stale() {
            Ok(n) => report.expired = n,
            Err(e) => error!("Expiry pass failed: {}", e),
        }
        match self.engine.reconcile() {
            Ok(n) => report.reconciled = n,
            Err(e) => error!("Reconciliation failed: {}", e),
        }
        match self.validator.resume_stalled() {
            Ok(n) => report.resumed = n,
            Err(e) => error!("Resuming challenge validation failed: {}", e),
        }
        self.limiter.purge();
        debug!("Maintenance pass: {:?}", report);
        report
    }

    /// 在背景執行緒上每隔 `interval` 執行一次，直到 [`MaintenanceHandle::stop`]。
    pub fn spawn(self, interval: Duration) -> std::io::Result<MaintenanceHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("acme-maintenance".to_string())
            .spawn(move || {
                info!("Maintenance running every {:?}", interval);
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.run_once();
                        }
                        // 收到停止訊號或傳送端已釋放
                        _ => break,
                    }
                }
                info!("Maintenance stopped");
            })?;
        Ok(MaintenanceHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// 背景維護執行緒的控制代碼。
#[derive(Debug)]
pub struct MaintenanceHandle {
    stop: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// 通知執行緒停止並等待結束。
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ca::tests::{issued, ScriptedBackend},
        nonce::NonceT,
        order::tests::{account, engine_with},
        payload::Identifier,
    };
    use chrono::Utc;
    use std::{collections::HashMap, time::Instant};

    fn maintenance(nonce_ttl: Duration) -> (Maintenance, crate::account::AccountRegistry) {
        let (engine, registry) = engine_with(Arc::new(ScriptedBackend::new(Ok(issued()))));
        let engine = Arc::new(engine);
        let nonces = Arc::new(NonceStore::new(engine.store().clone(), nonce_ttl));
        let validator = ChallengeValidator::new(engine.clone(), HashMap::new());
        (
            Maintenance::new(nonces, engine, validator, Arc::new(RateLimiter::per_hour(10))),
            registry,
        )
    }

    #[test]
    fn test_run_once() {
        let (maintenance, registry) = maintenance(Duration::from_millis(10));
        maintenance.nonces.issue().unwrap();
        maintenance.nonces.issue().unwrap();

        let account = account(&registry);
        let order = maintenance
            .engine
            .create_order(&account, &[Identifier::dns("example.com")])
            .unwrap();
        let mut stale = maintenance
            .engine
            .store()
            .get::<crate::order::Order>(&order.id)
            .unwrap();
        stale.expires = Utc::now() - chrono::Duration::seconds(1);
        maintenance.engine.store().put(&stale).unwrap();

        thread::sleep(Duration::from_millis(20));
        let report = maintenance.run_once();
        assert_eq!(report.nonces_purged, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.reconciled, 0);
        assert_eq!(report.resumed, 0);
    }

    #[test]
    fn test_spawn_and_stop() {
        let (maintenance, _) = maintenance(Duration::from_secs(60));
        let handle = maintenance.spawn(Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
