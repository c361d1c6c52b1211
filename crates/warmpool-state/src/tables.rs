//! redb table definitions for the warmpool state store.
//!
//! String-keyed tables hold JSON-serialized entities. The outbox and the
//! utilization history are keyed by a monotonically increasing `u64` drawn
//! from the `sequences` table inside the inserting transaction.

use redb::TableDefinition;

/// String-keyed table of JSON values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Sequence-keyed table of JSON values.
pub type SeqTable = TableDefinition<'static, u64, &'static [u8]>;

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: JsonTable = TableDefinition::new("instances");

/// Stage owners keyed by `{stage_id}`.
pub const STAGE_OWNERS: JsonTable = TableDefinition::new("stage_owner");

/// Capacity reservations keyed by `{stage_id}`.
pub const CAPACITY_RESERVATIONS: JsonTable = TableDefinition::new("capacity_reservation");

/// Outbox jobs keyed by job ID.
pub const OUTBOX_JOBS: SeqTable = TableDefinition::new("outbox_jobs");

/// Utilization samples keyed by record ID.
pub const UTILIZATION_HISTORY: SeqTable = TableDefinition::new("instance_utilization_history");

/// Last issued ID per sequence-keyed table.
pub const SEQUENCES: TableDefinition<'static, &'static str, u64> =
    TableDefinition::new("sequences");
