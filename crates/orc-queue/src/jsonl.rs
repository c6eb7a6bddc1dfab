use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orc_types::Envelope;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::QueueError;
use crate::{Delivery, DeliveryId, Queue};

struct PendingEntry {
    offset: usize,
    delivery_count: u32,
    claimed_at: Instant,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct GroupState {
    /// Next never-before-delivered offset in the log.
    cursor: usize,
    /// Entries claimed but not yet acked, keyed by delivery id (= offset).
    pending: HashMap<String, PendingEntry>,
}

/// File-backed queue: the append log is mirrored in memory and persisted as
/// JSONL for restart durability (`orchestrator::store`'s `events.jsonl`
/// idiom). Consumer-group state (cursor, pending set) is in-process only,
/// matching this component's single-replica scope (spec §1 Non-goals: no
/// cross-replica consensus).
pub struct JsonlQueue {
    path: PathBuf,
    log: AsyncMutex<Vec<Envelope>>,
    groups: StdMutex<HashMap<String, GroupState>>,
}

impl JsonlQueue {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_owned();
        let mut log = Vec::new();
        if let Ok(file) = tokio::fs::File::open(&path).await {
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                log.push(serde_json::from_str(&line)?);
            }
        }
        Ok(Self {
            path,
            log: AsyncMutex::new(log),
            groups: StdMutex::new(HashMap::new()),
        })
    }

    fn group_mut<'a>(
        groups: &'a mut HashMap<String, GroupState>,
        group: &str,
    ) -> &'a mut GroupState {
        groups.entry(group.to_string()).or_default()
    }
}

#[async_trait]
impl Queue for JsonlQueue {
    async fn publish(&self, envelope: Envelope) -> Result<(), QueueError> {
        let line = serde_json::to_string(&envelope)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        let mut log = self.log.lock().await;
        log.push(envelope);
        Ok(())
    }

    async fn poll(
        &self,
        consumer_group: &str,
        max: usize,
        visibility_timeout_ms: u64,
    ) -> Result<Vec<Delivery>, QueueError> {
        let log = self.log.lock().await;
        let mut groups = self.groups.lock().unwrap();
        let group = Self::group_mut(&mut groups, consumer_group);

        let mut taken = Vec::new();
        while taken.len() < max && group.cursor < log.len() {
            let offset = group.cursor;
            group.cursor += 1;
            taken.push((offset, 1));
        }

        let visibility_timeout = Duration::from_millis(visibility_timeout_ms);
        let mut deliveries = Vec::with_capacity(taken.len());
        for (offset, delivery_count) in taken {
            group.pending.insert(
                offset.to_string(),
                PendingEntry {
                    offset,
                    delivery_count,
                    claimed_at: Instant::now(),
                    visibility_timeout,
                },
            );
            deliveries.push(Delivery {
                delivery_id: DeliveryId(offset.to_string()),
                envelope: log[offset].clone(),
                delivery_count,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, consumer_group: &str, delivery_id: &DeliveryId) -> Result<(), QueueError> {
        let mut groups = self.groups.lock().unwrap();
        let group = Self::group_mut(&mut groups, consumer_group);
        group
            .pending
            .remove(&delivery_id.0)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery_id.0.clone()))
    }

    async fn reclaim_expired(&self, consumer_group: &str) -> Result<Vec<Delivery>, QueueError> {
        let log = self.log.lock().await;
        let mut groups = self.groups.lock().unwrap();
        let group = Self::group_mut(&mut groups, consumer_group);
        let expired: Vec<String> = group
            .pending
            .iter()
            .filter(|(_, entry)| entry.claimed_at.elapsed() >= entry.visibility_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = group.pending.remove(&id) {
                reclaimed.push(Delivery {
                    delivery_id: DeliveryId(id),
                    envelope: log[entry.offset].clone(),
                    delivery_count: entry.delivery_count,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn pending(&self, consumer_group: &str) -> Result<Vec<Delivery>, QueueError> {
        let log = self.log.lock().await;
        let mut groups = self.groups.lock().unwrap();
        let group = Self::group_mut(&mut groups, consumer_group);
        Ok(group
            .pending
            .iter()
            .map(|(id, entry)| Delivery {
                delivery_id: DeliveryId(id.clone()),
                envelope: log[entry.offset].clone(),
                delivery_count: entry.delivery_count,
            })
            .collect())
    }

    async fn pending_count(&self, consumer_group: &str) -> Result<usize, QueueError> {
        let mut groups = self.groups.lock().unwrap();
        Ok(Self::group_mut(&mut groups, consumer_group).pending.len())
    }
}
