//! The versioned shard topology map.
//!
//! A [`ShardletMap`] is the process-wide routing table: shardlet → physical
//! shard, plus the shard descriptors themselves. It is built once per
//! topology version from the central metadata store and is immutable
//! afterwards; a new topology version means constructing a new map and a new
//! [`crate::SqlService`] around it. There is no ambient singleton.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use sqlx_core::query_as::query_as;
use sqlx_postgres::PgPoolOptions;
use tracing::{info, instrument, warn};

use fhirshard_core::{ShardId, ShardletId};

use crate::config::ShardingConfig;
use crate::error::{ShardError, is_transient};
use crate::Result;

/// Descriptor of one physical shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// The shard's id, assigned by the topology at load time.
    pub shard_id: ShardId,
    /// Connection URL of the shard database.
    pub connection_string: String,
    /// Schema version the shard reported.
    pub version: i32,
}

/// One row of the central metadata query.
///
/// `shardlet_id` is `None` for a shard that currently owns no shardlets (the
/// central query left-joins shards to their shardlet assignments); such a row
/// makes construction fail the coverage invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardletMapRow {
    pub shard_id: i16,
    pub connection_string: String,
    pub shardlet_id: Option<i16>,
    pub shard_version: i32,
}

const SHARDLET_QUERY: &str = r#"
    SELECT s.shard_id, s.connection_string, l.shardlet_id, s.shard_version
    FROM shard_map.shards s
    LEFT JOIN shard_map.shardlets l
      ON l.topology_version = s.topology_version AND l.shard_id = s.shard_id
    WHERE s.topology_version = COALESCE($1, (SELECT MAX(topology_version) FROM shard_map.shards))
    ORDER BY s.shard_id, l.shardlet_id
"#;

/// Immutable mapping from shardlet to physical shard.
///
/// Safely shared across threads once constructed; both internal maps are
/// read-only for the lifetime of the instance.
#[derive(Debug, Clone)]
pub struct ShardletMap {
    version: Option<i32>,
    shardlet_to_shard: HashMap<ShardletId, ShardId>,
    shards: BTreeMap<ShardId, Shard>,
}

impl ShardletMap {
    /// Loads the topology from the central metadata store.
    ///
    /// Transient connection failures are retried with a fixed delay
    /// indefinitely: during a cloud failover event liveness matters more than
    /// fast failure, and a storage engine that cannot route is not useful
    /// anyway. Callers that need a bound must wrap this in a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::NoShardlets`] for an empty topology and
    /// [`ShardError::IncompleteTopology`] when coverage validation fails.
    /// Non-transient database errors propagate as-is.
    #[instrument(skip(config), fields(version = ?config.topology_version))]
    pub async fn load(config: &ShardingConfig) -> Result<Self> {
        let retry_delay = Duration::from_millis(config.retry_delay_ms);
        loop {
            match Self::try_load(config).await {
                Ok(map) => {
                    info!(
                        shards = map.shards.len(),
                        shardlets = map.shardlet_to_shard.len(),
                        version = ?map.version,
                        "Shard topology loaded"
                    );
                    return Ok(map);
                }
                Err(ShardError::Connection(e)) if is_transient(&e) => {
                    warn!(error = %e, delay_ms = config.retry_delay_ms, "Transient error loading shard topology, retrying");
                    tokio::time::sleep(retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_load(config: &ShardingConfig) -> Result<Self> {
        // Short-lived connection: topology is read once per map instance.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&config.central_url)
            .await?;

        let rows: Vec<(i16, String, Option<i16>, i32)> = query_as(SHARDLET_QUERY)
            .bind(config.topology_version)
            .fetch_all(&pool)
            .await?;

        pool.close().await;

        let rows = rows
            .into_iter()
            .map(
                |(shard_id, connection_string, shardlet_id, shard_version)| ShardletMapRow {
                    shard_id,
                    connection_string,
                    shardlet_id,
                    shard_version,
                },
            )
            .collect();

        Self::from_rows(rows, config.topology_version)
    }

    /// Builds and validates a map from already-fetched metadata rows.
    ///
    /// Invariants enforced here:
    /// - the row set is non-empty;
    /// - every shard owns at least one shardlet;
    /// - a shardlet maps to exactly one shard;
    /// - shardlet ids are within the valid range.
    pub fn from_rows(rows: Vec<ShardletMapRow>, version: Option<i32>) -> Result<Self> {
        if rows.is_empty() {
            return Err(ShardError::NoShardlets { version });
        }

        let mut shardlet_to_shard = HashMap::new();
        let mut shards = BTreeMap::new();

        for row in &rows {
            let shard_id = ShardId::new(row.shard_id);
            shards.entry(shard_id).or_insert_with(|| Shard {
                shard_id,
                connection_string: row.connection_string.clone(),
                version: row.shard_version,
            });

            let Some(raw_shardlet) = row.shardlet_id else {
                continue;
            };
            let shardlet = ShardletId::new(raw_shardlet).map_err(|e| {
                ShardError::incomplete_topology(format!(
                    "shard {shard_id} references invalid shardlet: {e}"
                ))
            })?;

            if let Some(previous) = shardlet_to_shard.insert(shardlet, shard_id)
                && previous != shard_id
            {
                return Err(ShardError::incomplete_topology(format!(
                    "shardlet {shardlet} is mapped to both shard {previous} and shard {shard_id}"
                )));
            }
        }

        if shardlet_to_shard.is_empty() {
            return Err(ShardError::NoShardlets { version });
        }

        // Every known shard must be reachable through at least one shardlet,
        // otherwise merges would silently never touch it.
        for shard_id in shards.keys() {
            if !shardlet_to_shard.values().any(|s| s == shard_id) {
                return Err(ShardError::incomplete_topology(format!(
                    "shard {shard_id} owns no shardlets"
                )));
            }
        }

        Ok(Self {
            version,
            shardlet_to_shard,
            shards,
        })
    }

    /// The topology version this map was built for (`None` = latest).
    #[must_use]
    pub fn version(&self) -> Option<i32> {
        self.version
    }

    /// Resolves the shard owning a shardlet.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::UnknownShardlet`] for shardlets outside the map.
    pub fn shard_for(&self, shardlet_id: ShardletId) -> Result<ShardId> {
        self.shardlet_to_shard
            .get(&shardlet_id)
            .copied()
            .ok_or(ShardError::UnknownShardlet(shardlet_id))
    }

    /// Returns the descriptor of a shard.
    #[must_use]
    pub fn shard(&self, shard_id: ShardId) -> Option<&Shard> {
        self.shards.get(&shard_id)
    }

    /// All shard ids, in ascending order.
    #[must_use]
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// All shard descriptors, ordered by shard id.
    pub fn shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    /// Number of shardlet assignments in the map.
    #[must_use]
    pub fn shardlet_count(&self) -> usize {
        self.shardlet_to_shard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(shard_id: i16, shardlet_id: Option<i16>) -> ShardletMapRow {
        ShardletMapRow {
            shard_id,
            connection_string: format!("postgres://localhost/shard_{shard_id}"),
            shardlet_id,
            shard_version: 1,
        }
    }

    #[test]
    fn test_empty_topology_is_fatal() {
        let err = ShardletMap::from_rows(Vec::new(), Some(2)).unwrap_err();
        assert!(matches!(err, ShardError::NoShardlets { version: Some(2) }));
    }

    #[test]
    fn test_shard_without_shardlets_fails_coverage() {
        let rows = vec![row(0, Some(1024)), row(0, Some(1025)), row(1, None)];
        let err = ShardletMap::from_rows(rows, None).unwrap_err();
        assert!(matches!(err, ShardError::IncompleteTopology { .. }));
        assert!(err.to_string().contains("shard 1 owns no shardlets"));
    }

    #[test]
    fn test_shardlet_mapped_to_two_shards_fails() {
        let rows = vec![row(0, Some(1024)), row(1, Some(1024))];
        let err = ShardletMap::from_rows(rows, None).unwrap_err();
        assert!(matches!(err, ShardError::IncompleteTopology { .. }));
    }

    #[test]
    fn test_out_of_range_shardlet_fails() {
        let rows = vec![row(0, Some(4096))];
        let err = ShardletMap::from_rows(rows, None).unwrap_err();
        assert!(matches!(err, ShardError::IncompleteTopology { .. }));
    }

    #[test]
    fn test_routing_and_accessors() {
        let rows = vec![
            row(0, Some(1024)),
            row(0, Some(1026)),
            row(1, Some(1025)),
            row(1, Some(1027)),
        ];
        let map = ShardletMap::from_rows(rows, Some(7)).unwrap();

        assert_eq!(map.version(), Some(7));
        assert_eq!(map.shard_ids(), vec![ShardId::new(0), ShardId::new(1)]);
        assert_eq!(map.shardlet_count(), 4);

        let shardlet = ShardletId::new(1025).unwrap();
        assert_eq!(map.shard_for(shardlet).unwrap(), ShardId::new(1));

        let unknown = ShardletId::new(2000).unwrap();
        assert!(matches!(
            map.shard_for(unknown),
            Err(ShardError::UnknownShardlet(_))
        ));

        let shard = map.shard(ShardId::new(0)).unwrap();
        assert_eq!(shard.connection_string, "postgres://localhost/shard_0");
    }
}
