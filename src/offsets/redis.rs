use std::path::Path;

use redis::Commands;
use serde::{Deserialize, Serialize};

use super::range_set::{OffsetRange, OffsetRangeSet, TopicPartition};
use super::store::OffsetPersistence;
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    partitions: Vec<PartitionRanges>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionRanges {
    topic: String,
    partition: u32,
    ranges: Vec<RangeEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RangeEntry {
    from: u64,
    to: u64,
    #[serde(rename = "lastProcessed")]
    last_processed: i64,
}

/// Offset backend storing one JSON envelope per topic in redis.
pub struct RedisOffsetPersistence {
    client: redis::Client,
    prefix: String,
}

impl RedisOffsetPersistence {
    /// Connects lazily to the given redis URL; keys are
    /// `<prefix>/offsets/<topic>`.
    pub fn new(url: &str, prefix: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
        })
    }

    fn key(&self, topic: &str) -> String {
        format!("{}/offsets/{topic}", self.prefix)
    }
}

impl OffsetPersistence for RedisOffsetPersistence {
    fn read(&self, topic: &str) -> Result<OffsetRangeSet> {
        let mut conn = self.client.get_connection()?;
        let raw: Option<String> = conn.get(self.key(topic))?;
        let mut set = OffsetRangeSet::new();
        let Some(raw) = raw else {
            return Ok(set);
        };

        let envelope: Envelope = serde_json::from_str(&raw)?;
        for partition in envelope.partitions {
            let tp = TopicPartition::new(partition.topic, partition.partition);
            for entry in partition.ranges {
                let mut range = OffsetRange::new(entry.from, entry.to)?;
                range.last_processed = entry.last_processed;
                set.add(&tp, range);
            }
        }
        Ok(set)
    }

    fn write(&self, topic: &str, set: &OffsetRangeSet, _staging: &Path) -> Result<()> {
        let mut partitions: Vec<PartitionRanges> = Vec::new();
        for tp in set.topic_partitions() {
            let ranges: Vec<RangeEntry> = set
                .ranges()
                .filter(|(t, _)| *t == tp)
                .map(|(_, r)| RangeEntry {
                    from: r.from,
                    to: r.to,
                    last_processed: r.last_processed,
                })
                .collect();
            partitions.push(PartitionRanges {
                topic: tp.topic.clone(),
                partition: tp.partition,
                ranges,
            });
        }
        partitions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));

        let payload = serde_json::to_string(&Envelope { partitions })?;
        let mut conn = self.client.get_connection()?;
        let _: () = conn.set(self.key(topic), payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope {
            partitions: vec![PartitionRanges {
                topic: "t".into(),
                partition: 2,
                ranges: vec![RangeEntry {
                    from: 0,
                    to: 41,
                    last_processed: 1_493_711_175_000,
                }],
            }],
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"lastProcessed\":1493711175000"), "{json}");
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.partitions[0].ranges[0].to, 41);
    }
}
