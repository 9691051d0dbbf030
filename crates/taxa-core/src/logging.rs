//! Structured logging schema and field name constants for taxa.
//!
//! Every tracing event in both crates names its fields from this list, so
//! log aggregation can query by the same field names regardless of which
//! backend emitted the event.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events, completed mutations |
//! | DEBUG | Decision points (no-op moves, pruning), intermediate values |
//! | TRACE | Per-node iteration during renumbering |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "taxonomy", "database", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "service", "tree", "memory_store", "pg_store", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "add_term", "remove_term", "move_up", "reparent", "recover"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Vocabulary UUID being operated on.
pub const VOCABULARY_ID: &str = "vocabulary_id";

/// Vocabulary alias (tree scope key).
pub const VOCABULARY_ALIAS: &str = "vocabulary_alias";

/// Term UUID being operated on.
pub const TERM_ID: &str = "term_id";

/// Taxonomy node UUID being operated on.
pub const TAXONOMY_ID: &str = "taxonomy_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of nodes in the affected vocabulary tree.
pub const NODE_COUNT: &str = "node_count";

/// Number of node rows written by a unit of work.
pub const ROWS_CHANGED: &str = "rows_changed";

/// Requested move distance.
pub const STEP: &str = "step";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_are_unique() {
        let fields = [
            SUBSYSTEM,
            COMPONENT,
            OPERATION,
            VOCABULARY_ID,
            VOCABULARY_ALIAS,
            TERM_ID,
            TAXONOMY_ID,
            DURATION_MS,
            NODE_COUNT,
            ROWS_CHANGED,
            STEP,
            POOL_SIZE,
            POOL_IDLE,
            ERROR_MSG,
        ];
        let unique: std::collections::HashSet<_> = fields.iter().collect();
        assert_eq!(unique.len(), fields.len());
    }

    #[test]
    fn test_field_names_are_snake_case() {
        for field in [VOCABULARY_ID, TERM_ID, TAXONOMY_ID, NODE_COUNT, OPERATION] {
            assert!(field
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
