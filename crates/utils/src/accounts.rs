use models::{Account, NormalizedTransaction, SourceAccount};
use std::collections::HashMap;

/// Raw account reference (instrument id, card number, IBAN...) to the account it belongs to.
pub type AccountMap = HashMap<String, Account>;

/// Builds the reference table used by `map_transaction_accounts`.
///
/// Every reference is passed to `resolve`; references it cannot resolve are
/// left out of the table.
///
/// # Arguments
/// * `references` - Raw references seen in transactions
/// * `resolve` - Resolves one reference against the holder's known accounts
pub fn build_account_map<'a, I, F>(references: I, mut resolve: F) -> AccountMap
where
    I: IntoIterator<Item = &'a str>,
    F: FnMut(&str) -> Option<Account>,
{
    let mut map = AccountMap::new();
    for reference in references {
        if map.contains_key(reference) {
            continue;
        }
        if let Some(account) = resolve(reference) {
            map.insert(reference.to_string(), account);
        }
    }
    map
}

/// Registers each source account under its own id, its sync ids and the
/// instrument ids it is fetched by.
pub fn account_map_from_sources(sources: &[SourceAccount]) -> AccountMap {
    let mut map = AccountMap::new();
    for source in sources {
        let account = &source.account;
        let references = std::iter::once(&account.id)
            .chain(account.sync_ids.iter())
            .chain(source.instrument_ids.iter());
        for reference in references {
            map.entry(reference.clone()).or_insert_with(|| account.clone());
        }
    }
    map
}

/// Rewrites the account sides of each transaction to canonical account ids.
///
/// A transaction where neither side resolves is dropped, it does not touch
/// any account the holder cares about. A side that does not resolve is kept
/// as-is (external counterparty). Survivors keep their input order.
pub fn map_transaction_accounts(
    transactions: Vec<NormalizedTransaction>,
    accounts: &AccountMap,
) -> Vec<NormalizedTransaction> {
    let mut filtered = Vec::with_capacity(transactions.len());
    for mut txn in transactions {
        let income = accounts.get(&txn.income_account).map(|a| a.id.clone());
        let outcome = accounts.get(&txn.outcome_account).map(|a| a.id.clone());
        if income.is_none() && outcome.is_none() {
            continue;
        }
        if let Some(id) = income {
            txn.income_account = id;
        }
        if let Some(id) = outcome {
            txn.outcome_account = id;
        }
        filtered.push(txn);
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::AccountKind;
    use serde_json::json;

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            kind: AccountKind::Card,
            title: None,
            sync_ids: vec![],
        }
    }

    fn txn(income_account: &str, outcome_account: &str) -> NormalizedTransaction {
        serde_json::from_value(json!({
            "date": "2024-02-01",
            "incomeAccount": income_account,
            "income": 10.0,
            "outcomeAccount": outcome_account,
            "outcome": 10.0
        }))
        .unwrap()
    }

    #[test]
    fn resolves_one_side_and_keeps_the_other() {
        let map: AccountMap = [("4111".to_string(), account("acc-1"))].into_iter().collect();

        let out = map_transaction_accounts(vec![txn("4111", "EXTERNAL")], &map);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].income_account, "acc-1");
        assert_eq!(out[0].outcome_account, "EXTERNAL");
    }

    #[test]
    fn drops_transactions_resolving_on_neither_side() {
        let map: AccountMap = [("4111".to_string(), account("acc-1"))].into_iter().collect();

        let out = map_transaction_accounts(
            vec![txn("X", "Y"), txn("4111", "4111"), txn("Z", "4111")],
            &map,
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].income_account, "acc-1");
        assert_eq!(out[0].outcome_account, "acc-1");
        assert_eq!(out[1].income_account, "Z");
        assert_eq!(out[1].outcome_account, "acc-1");
    }

    #[test]
    fn build_map_skips_unresolved_references() {
        let map = build_account_map(["4111", "9999", "4111"], |reference| {
            (reference == "4111").then(|| account("acc-1"))
        });
        assert_eq!(map.len(), 1);
        assert_eq!(map["4111"].id, "acc-1");
    }

    #[test]
    fn source_accounts_register_all_their_references() {
        let mut card = account("acc-1");
        card.sync_ids = vec!["4111".to_string()];
        let sources = vec![SourceAccount {
            account: card,
            instrument_ids: vec!["inst-7".to_string()],
        }];

        let map = account_map_from_sources(&sources);

        for reference in ["acc-1", "4111", "inst-7"] {
            assert_eq!(map[reference].id, "acc-1");
        }
    }
}
