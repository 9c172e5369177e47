use async_trait::async_trait;

use crate::error::Result;
use crate::types::AlertRecord;
use super::{ChannelKind, NotificationChannel};

/// Records the alert and nothing more. The alert manager already persists
/// the record itself, so this channel only logs the hand-off.
pub struct DatabaseOnlyChannel;

#[async_trait]
impl NotificationChannel for DatabaseOnlyChannel {
    fn name(&self) -> &str { "database" }

    fn kind(&self) -> ChannelKind { ChannelKind::DatabaseOnly }

    async fn send(&self, alert: &AlertRecord) -> Result<()> {
        tracing::info!(
            alert_id = %alert.id,
            level = %alert.level,
            state = alert.state.as_str(),
            metric = %alert.metric,
            "{}",
            alert.message
        );
        Ok(())
    }
}
