//! Background task that re-checks donations stuck in `pending`.
//!
//! Webhooks can be lost. Every `SWEEP_INTERVAL_SECS` this asks the provider
//! about donations older than `SWEEP_MIN_AGE_SECS` and feeds the answer
//! through the same reconciliation path as a webhook.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::Result;
use crate::providers::PaymentUpdate;
use crate::reconciliation::{Outcome, Reconciler};

/// Donations checked per pass.
const BATCH_SIZE: i64 = 50;

pub struct SweeperConfig {
    pub interval: Duration,
    pub min_age_secs: i64,
}

/// Run until `shutdown` is cancelled.
pub async fn run(reconciler: Arc<Reconciler>, config: SweeperConfig, shutdown: CancellationToken) {
    info!(
        "Pending-donation sweeper starting (every {}s, min age {}s)",
        config.interval.as_secs(),
        config.min_age_secs
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }

        match sweep_once(&reconciler, config.min_age_secs).await {
            Ok(0) => {}
            Ok(settled) => info!("Sweeper settled {settled} donations"),
            Err(e) => error!("Sweeper pass failed: {e}"),
        }
    }

    info!("Pending-donation sweeper stopped");
}

/// One pass. Returns how many donations this pass moved out of `pending`.
pub async fn sweep_once(reconciler: &Reconciler, min_age_secs: i64) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::seconds(min_age_secs);
    let stale = db::stale_pending_donations(&reconciler.pool, cutoff, BATCH_SIZE).await?;

    let mut settled = 0;
    for donation in stale {
        // Marked before the lookup so failures rotate to the back.
        db::mark_swept(&reconciler.pool, &donation.payment_id, Utc::now()).await?;

        let provider = match reconciler.providers.get(donation.provider) {
            Ok(p) => p,
            Err(e) => {
                warn!(payment_id = %donation.payment_id, "Sweeper skipped donation: {e}");
                continue;
            }
        };

        let payment = match provider.get_payment_status(&donation.payment_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(payment_id = %donation.payment_id, "Sweeper lookup failed: {e}");
                continue;
            }
        };

        let update = PaymentUpdate::new(donation.payment_id.clone(), payment.raw_status);
        if let Outcome::Transitioned(_) = reconciler.apply_update(&update).await? {
            settled += 1;
        }
    }
    Ok(settled)
}
