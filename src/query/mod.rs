//! # Aggregation Queries
//!
//! The small query surface over ordered scans: parse a statement, build
//! the aggregator, stream the merged (tree ⊕ staging) rows through the
//! optional predicate, produce one result row.
//!
//! The environment owns the database handles and plugin registry; this
//! module only wires a parsed query to a row stream.
//!
//! ## Module Organization
//!
//! - [`parser`]: the statement grammar
//! - [`plugins`]: aggregates and the predicate registry

pub mod parser;
pub mod plugins;

use eyre::Result;

use crate::encoding::keys::KeyType;
use crate::query::parser::{Field, ParsedQuery};
use crate::query::plugins::{Aggregator, PluginRegistry, QueryResult};
use crate::scan::merge::MergeScan;

/// Runs a parsed aggregate over a merged row stream.
pub fn run(
    query: &ParsedQuery,
    key_type: KeyType,
    registry: &PluginRegistry,
    mut rows: MergeScan<'_>,
) -> Result<QueryResult> {
    let mut aggregator = Aggregator::new(&query.function, query.field, key_type)?;

    let predicate = match &query.predicate {
        Some((name, field)) => Some((registry.get(name)?, *field)),
        None => None,
    };

    while let Some((key, record)) = rows.next_row()? {
        if let Some((test, field)) = &predicate {
            let bytes = match field {
                Field::Key => key.as_slice(),
                Field::Record => record.as_slice(),
            };
            if !test(bytes) {
                continue;
            }
        }
        aggregator.feed(&key, &record)?;
    }

    Ok(aggregator.finish())
}
