use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::engine::SyncEngine;
use crate::scope::{ScopeSnapshot, TenantScope};

/// Default period between timer-driven refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// What caused a refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    Timer,
    Focus,
    ScopeActivated,
}

/// True if `next` has a remote-valid site or company that `prev` did not.
fn scope_activated(prev: &TenantScope, next: &TenantScope) -> bool {
    let site = next.remote_site().is_some() && next.remote_site() != prev.remote_site();
    let company = next.remote_company().is_some() && next.remote_company() != prev.remote_company();
    site || company
}

/// Spawn the refresh loop.
///
/// Each trigger spawns its own `refresh_all` pass; a slow pass never delays
/// the next trigger. The loop ends when the scope sender is dropped or the
/// returned handle is aborted.
pub fn spawn_refresh_loop(
    engine: SyncEngine,
    mut scope_rx: watch::Receiver<ScopeSnapshot>,
    focus: Arc<Notify>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last = scope_rx.borrow_and_update().scope.clone();
        if scope_activated(&TenantScope::default(), &last) {
            spawn_refresh(&engine, Trigger::Startup);
        }

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => Trigger::Timer,
                _ = focus.notified() => Trigger::Focus,
                changed = scope_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let scope = scope_rx.borrow_and_update().scope.clone();
                    let activated = scope_activated(&last, &scope);
                    last = scope;
                    if !activated {
                        continue;
                    }
                    Trigger::ScopeActivated
                }
            };
            spawn_refresh(&engine, trigger);
        }
        debug!("Refresh loop stopped");
    })
}

fn spawn_refresh(engine: &SyncEngine, trigger: Trigger) {
    debug!(?trigger, "Refresh triggered");
    let engine = engine.clone();
    tokio::spawn(async move {
        engine.refresh_all().await;
    });
}
