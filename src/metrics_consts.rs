pub const EVENTS_RECEIVED: &str = "fleet_stats_events_received";
pub const EVENT_DECODE_ERROR: &str = "fleet_stats_event_decode_error";
pub const AID_SYNTHESIZED: &str = "fleet_stats_aid_synthesized";
pub const WINDOWS_EMITTED: &str = "fleet_stats_windows_emitted";
pub const WINDOWS_HELD: &str = "fleet_stats_windows_held";
pub const BATCH_SIZE: &str = "fleet_stats_batch_size";
pub const DUPLICATES_FILTERED: &str = "fleet_stats_duplicates_filtered";
pub const EMPTY_COMMITS: &str = "fleet_stats_empty_commits";
pub const COMMITS_ISSUED: &str = "fleet_stats_commits_issued";
pub const COMMIT_FAILED: &str = "fleet_stats_commit_failed";
pub const COMMIT_TIME: &str = "fleet_stats_commit_time_ms";
pub const VEHICLES_COMMITTED: &str = "fleet_stats_vehicles_committed";
pub const UPDATES_PUBLISHED: &str = "fleet_stats_updates_published";
pub const PUBLISH_FAILED: &str = "fleet_stats_publish_failed";
pub const BROKER_ERRORS: &str = "fleet_stats_broker_errors";
pub const BROKER_CONNECTS: &str = "fleet_stats_broker_connects";
pub const READ_FALLBACKS: &str = "fleet_stats_read_fallbacks";
pub const STORE_TIMEOUTS: &str = "fleet_stats_store_timeouts";
