//! Background purge of expired records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::traits::Database;

/// Spawn a background task that purges expired records every `every`.
pub fn spawn_expiry_sweep(db: Arc<dyn Database>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match db.purge_expired(Utc::now()).await {
                Ok(counts) => debug!(removed = counts.total(), "Expiry sweep finished"),
                Err(e) => warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::workflow::types::{Connection, Conversation, MessageContext, UserInfo};

    #[tokio::test]
    async fn sweep_removes_expired_records() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let expired = Conversation::new(
            "old",
            UserInfo::anonymous(),
            "古い相談",
            MessageContext::default(),
            None,
            chrono::Duration::seconds(-10),
        );
        let live = Conversation::new(
            "new",
            UserInfo::anonymous(),
            "新しい相談",
            MessageContext::default(),
            None,
            chrono::Duration::days(7),
        );
        db.insert_conversation(&expired).await.unwrap();
        db.insert_conversation(&live).await.unwrap();
        let now = Utc::now();
        db.put_connection(&Connection {
            connection_id: "ws-old".into(),
            user_id: "u1".into(),
            connected_at: now - chrono::Duration::hours(3),
            expires_at: now - chrono::Duration::hours(1),
        })
        .await
        .unwrap();

        let handle = spawn_expiry_sweep(db.clone(), Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(5), async {
            while db.get_conversation("old").await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep did not run");
        handle.abort();

        assert!(db.get_conversation("new").await.unwrap().is_some());
        assert!(db.get_connection("ws-old").await.unwrap().is_none());
    }
}
