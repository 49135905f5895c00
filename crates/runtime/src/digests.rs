//! Cron-scheduled digests (morning, evening, weekly revenue summary).

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use foreman_brain::ThinkEngine;
use foreman_config::DigestConfig;
use foreman_notify::{NotificationPipeline, Tier, resolve_timezone};
use foreman_state::StateStore;

/// Run one digest schedule until shutdown. Each firing generates a
/// fleet digest sized for a single SMS and records `last_digest`.
pub fn spawn_digest_task(
    label: &'static str,
    config: DigestConfig,
    think: Arc<ThinkEngine>,
    pipeline: Arc<NotificationPipeline>,
    store: Arc<StateStore>,
    shutdown: &watch::Sender<bool>,
) -> JoinHandle<()> {
    let mut rx = shutdown.subscribe();
    tokio::spawn(async move {
        let schedule = match Schedule::from_str(&config.cron) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(%err, label, cron = %config.cron, "invalid digest cron; task disabled");
                return;
            }
        };
        // empty timezone means the host's zone, same as quiet hours
        let tz = match resolve_timezone(&config.timezone) {
            Ok(tz) => tz,
            Err(err) => {
                warn!(%err, label, "invalid digest timezone; task disabled");
                return;
            }
        };

        loop {
            let Some(next) = schedule.upcoming(tz).next() else {
                break;
            };
            let wait = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    info!(label, "digest firing");
                    match think.generate_digest().await {
                        Some(digest) => {
                            pipeline.notify(&digest, Tier::Action).await;
                            store.update(|doc| doc.last_digest = Some(Utc::now())).await;
                        }
                        None => warn!(label, "digest generation skipped"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_ok() && *rx.borrow() { break; }
                }
            }
        }
    })
}
