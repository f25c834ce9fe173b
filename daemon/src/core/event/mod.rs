//! Cooperative internal task scheduler. One task runs at a time; every
//! interval gets a random jitter so the cluster's nodes drift apart instead
//! of firing in lockstep.

use crate::config::EventConfig;
use crate::core::CoreContext;
use casualchain_common::{
    config::{EVENT_DRAIN_TIMEOUT_MS, EVENT_JITTER_MAX_MS, EVENT_TICK_MS},
    error::{ModuleError, Result},
    time::{get_current_time_in_millis, TimestampMillis},
};
use log::{debug, error, info, warn};
use rand::Rng;
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::Mutex;

/// Whitelisted method paths the scheduler may invoke.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    DeliveryPool,
    AppendBlocks,
    ScanAndFixPool,
    ScanAndFixBlock,
    SyncCaches,
    Watchdog,
}

impl FromStr for TaskKind {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system.postDeliveryPool" => Ok(Self::DeliveryPool),
            "system.postAppendBlocks" => Ok(Self::AppendBlocks),
            "system.postScanAndFixPool" => Ok(Self::ScanAndFixPool),
            "system.postScanAndFixBlock" => Ok(Self::ScanAndFixBlock),
            "system.postSyncCaches" => Ok(Self::SyncCaches),
            "core.watchdog" => Ok(Self::Watchdog),
            other => Err(ModuleError::validation(
                "event",
                "register",
                "CheckMethodPath",
                format!("{} is not a registered method path", other),
            )),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeliveryPool => "system.postDeliveryPool",
            Self::AppendBlocks => "system.postAppendBlocks",
            Self::ScanAndFixPool => "system.postScanAndFixPool",
            Self::ScanAndFixBlock => "system.postScanAndFixBlock",
            Self::SyncCaches => "system.postSyncCaches",
            Self::Watchdog => "core.watchdog",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Run,
    Done,
    Error,
}

#[derive(Debug)]
pub struct InternalEvent {
    pub event_id: u32,
    pub task: TaskKind,
    pub min_interval_ms: TimestampMillis,
    pub next_execute_ms: TimestampMillis,
    pub status: EventStatus,
    pub exit_on_error: bool,
    /// Jitter keeps cluster members out of sync; the watchdog runs without
    /// it so config edits apply promptly.
    pub jitter: bool,
    pub execution_result: Option<String>,
}

pub struct EventModule {
    events: Mutex<Vec<InternalEvent>>,
    next_id: AtomicU32,
    runcounter: AtomicU64,
    stopped: AtomicBool,
}

impl Default for EventModule {
    fn default() -> Self {
        Self::new()
    }
}

impl EventModule {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            runcounter: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn register(
        &self,
        method_path: &str,
        min_interval_ms: TimestampMillis,
        exit_on_error: bool,
    ) -> Result<u32> {
        let task = TaskKind::from_str(method_path)?;
        let event_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let jitter = task != TaskKind::Watchdog;
        self.events.lock().await.push(InternalEvent {
            event_id,
            task,
            min_interval_ms,
            next_execute_ms: get_current_time_in_millis() + min_interval_ms,
            status: EventStatus::Queued,
            exit_on_error,
            jitter,
            execution_result: None,
        });
        debug!("registered event {} ({})", event_id, task);
        Ok(event_id)
    }

    /// Register the standard internal task set.
    pub async fn register_internal_events(&self, config: &EventConfig) -> Result<()> {
        self.register("system.postDeliveryPool", config.delivery_interval_ms, false)
            .await?;
        self.register("system.postAppendBlocks", config.append_interval_ms, false)
            .await?;
        self.register("system.postScanAndFixPool", config.fixpool_interval_ms, false)
            .await?;
        self.register("system.postScanAndFixBlock", config.fixblock_interval_ms, false)
            .await?;
        self.register("system.postSyncCaches", config.synccache_interval_ms, false)
            .await?;
        self.register("core.watchdog", EVENT_TICK_MS, false).await?;
        Ok(())
    }

    pub fn runcounter(&self) -> u64 {
        self.runcounter.load(Ordering::SeqCst)
    }

    /// Clear the queue and wait for in-flight events to drain.
    pub async fn unregister_all_internal_events(&self) {
        self.events.lock().await.clear();
        let deadline = get_current_time_in_millis() + EVENT_DRAIN_TIMEOUT_MS;
        while self.runcounter() > 0 {
            if get_current_time_in_millis() > deadline {
                warn!("event drain timed out with {} in flight", self.runcounter());
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// The loop. One tick per second; every due event runs to completion
    /// before the next is considered.
    pub async fn run(&self, ctx: &CoreContext) {
        info!("event loop started");
        let mut interval = tokio::time::interval(Duration::from_millis(EVENT_TICK_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.stopped.load(Ordering::SeqCst) {
            interval.tick().await;

            let due: Vec<(u32, TaskKind, bool)> = {
                let now = get_current_time_in_millis();
                let mut events = self.events.lock().await;
                events
                    .iter_mut()
                    .filter(|e| now >= e.next_execute_ms)
                    .map(|e| {
                        e.status = EventStatus::Run;
                        (e.event_id, e.task, e.exit_on_error)
                    })
                    .collect()
            };

            for (event_id, task, exit_on_error) in due {
                self.runcounter.fetch_add(1, Ordering::SeqCst);
                let outcome = execute(ctx, task).await;
                self.runcounter.fetch_sub(1, Ordering::SeqCst);

                let failed = outcome.is_err();
                let summary = match outcome {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("event {} ({}) failed: {}", event_id, task, e);
                        e.to_string()
                    }
                };

                let mut events = self.events.lock().await;
                if let Some(event) = events.iter_mut().find(|e| e.event_id == event_id) {
                    event.status = if failed { EventStatus::Error } else { EventStatus::Done };
                    event.execution_result = Some(summary);
                    let jitter = if event.jitter {
                        rand::thread_rng().gen_range(0..EVENT_JITTER_MAX_MS)
                    } else {
                        0
                    };
                    event.next_execute_ms =
                        get_current_time_in_millis() + event.min_interval_ms + jitter;
                }
                drop(events);

                if failed && exit_on_error {
                    error!("event {} ({}) failed with exit_on_error, stopping loop", event_id, task);
                    self.stop();
                    break;
                }
            }
        }
        info!("event loop stopped");
    }
}

async fn execute(ctx: &CoreContext, task: TaskKind) -> Result<String> {
    match task {
        TaskKind::DeliveryPool => {
            let report = ctx.system.post_delivery_pool(ctx, false).await?;
            Ok(format!("delivered {}", report.delivered))
        }
        TaskKind::AppendBlocks => {
            let sealed = ctx.system.post_append_blocks(ctx).await?;
            Ok(format!("sealed {}", sealed.len()))
        }
        TaskKind::ScanAndFixPool => {
            let report = ctx.system.post_scan_and_fix_pool(ctx).await?;
            Ok(format!("added {}, removed {}", report.added, report.removed))
        }
        TaskKind::ScanAndFixBlock => {
            let report = ctx.system.post_scan_and_fix_block(ctx).await?;
            Ok(format!("adopted {}", report.adopted))
        }
        TaskKind::SyncCaches => {
            let known = ctx.system.post_sync_caches(ctx).await?;
            Ok(format!("{} keys cached", known))
        }
        TaskKind::Watchdog => {
            if ctx.conf.take_reload().await?.is_some() {
                info!("configuration reloaded");
                ctx.keyring.refresh_public_key_cache(ctx).await?;
                Ok("config applied".to_string())
            } else {
                Ok("idle".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_paths_roundtrip() {
        for path in [
            "system.postDeliveryPool",
            "system.postAppendBlocks",
            "system.postScanAndFixPool",
            "system.postScanAndFixBlock",
            "system.postSyncCaches",
            "core.watchdog",
        ] {
            let task = TaskKind::from_str(path).unwrap();
            assert_eq!(task.to_string(), path);
        }
        assert!(TaskKind::from_str("system.dropEverything").is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_path() {
        let module = EventModule::new();
        assert!(module.register("nope", 1000, false).await.is_err());
        let id = module
            .register("system.postDeliveryPool", 1000, false)
            .await
            .unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn test_unregister_clears_queue() {
        let module = EventModule::new();
        module
            .register("system.postDeliveryPool", 1000, false)
            .await
            .unwrap();
        module.unregister_all_internal_events().await;
        assert!(module.events.lock().await.is_empty());
    }
}
