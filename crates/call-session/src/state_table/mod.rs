pub mod types;
pub mod builder;
pub mod tables;

pub use types::*;
pub use builder::StateTableBuilder;

use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    /// The master state table - single source of truth for all transitions
    pub static ref MASTER_TABLE: Arc<MasterStateTable> = Arc::new(build_master_table());
}

/// Build the complete master state table
fn build_master_table() -> MasterStateTable {
    let mut builder = StateTableBuilder::new();
    tables::add_call_transitions(&mut builder);
    let table = builder.build();

    if let Err(errors) = table.validate() {
        // The table is static data; a broken table is a programming error
        panic!("Invalid call state table: {:?}", errors);
    }

    tracing::debug!("Built call state table with {} transitions", table.transition_count());
    table
}
