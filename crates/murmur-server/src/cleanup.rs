use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use murmur_db::TokenLedger;

/// Background task that deletes refresh-token records past their expiry.
pub async fn run_cleanup_loop(ledger: TokenLedger, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match purge_once(&ledger).await {
            Ok(0) => {}
            Ok(count) => info!("Cleanup: purged {} expired refresh tokens", count),
            Err(e) => warn!("Cleanup error: {}", e),
        }
    }
}

async fn purge_once(ledger: &TokenLedger) -> anyhow::Result<usize> {
    let ledger = ledger.clone();
    let removed = tokio::task::spawn_blocking(move || ledger.purge_expired(Utc::now())).await??;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use murmur_db::Database;

    #[tokio::test]
    async fn purge_removes_only_expired_records() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db
            .create_user(&murmur_db::models::NewUser {
                username: "alice",
                email: "a@x.com",
                password_hash: "x",
                display_name: None,
            })
            .unwrap();
        let ledger = TokenLedger::new(db);

        ledger.issue(user.id, "old", chrono::Duration::seconds(-5)).unwrap();
        ledger.issue(user.id, "live", chrono::Duration::days(1)).unwrap();

        assert_eq!(purge_once(&ledger).await.unwrap(), 1);
        assert!(ledger.find("old").unwrap().is_none());
        assert!(ledger.find("live").unwrap().is_some());
    }
}
