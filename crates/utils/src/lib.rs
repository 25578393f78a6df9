pub mod accounts;
pub mod database;
pub mod transactions;

// Re-export commonly used items
pub use crate::accounts::{account_map_from_sources, build_account_map, map_transaction_accounts, AccountMap};
pub use crate::database::{read_json_file, read_optional_json_file, write_json_file};
pub use crate::transactions::{
    combine_transfers_by_id, duplicate_key, filter_duplicates, map_grouped_by_key, sort_transactions_by_date,
};
