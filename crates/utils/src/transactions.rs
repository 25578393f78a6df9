use models::NormalizedTransaction;
use std::collections::HashMap;
use std::hash::Hash;

/// Groups `items` by `key_of` and replaces every group with whatever `reduce`
/// returns for it.
///
/// Groups are reduced in first-seen-key order and each group keeps the input
/// order of its members. A reducer returning `None` (or an empty vector) drops
/// the whole group. Items whose key is the "no grouping" value (e.g. `None`
/// for an `Option` key) still form one group like any other key.
///
/// # Arguments
/// * `items` - Items to group
/// * `key_of` - Extracts the grouping key of an item
/// * `reduce` - Maps one group and its key to the items that replace it
///
/// # Example
/// ```
/// use utils::map_grouped_by_key;
///
/// let words = vec!["apple", "avocado", "banana"];
/// let firsts = map_grouped_by_key(words, |w| w.chars().next(), |group, _| group.into_iter().next().map(|w| vec![w]));
/// assert_eq!(firsts, vec!["apple", "banana"]);
/// ```
pub fn map_grouped_by_key<T, K, F, G>(items: impl IntoIterator<Item = T>, mut key_of: F, mut reduce: G) -> Vec<T>
where
    K: Eq + Hash + Clone,
    F: FnMut(&T) -> K,
    G: FnMut(Vec<T>, &K) -> Option<Vec<T>>,
{
    let mut slots: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();

    for item in items {
        let key = key_of(&item);
        match slots.get(&key) {
            Some(&slot) => groups[slot].1.push(item),
            None => {
                slots.insert(key.clone(), groups.len());
                groups.push((key, vec![item]));
            }
        }
    }

    let mut result = Vec::new();
    for (key, group) in groups {
        if let Some(reduced) = reduce(group, &key) {
            result.extend(reduced);
        }
    }
    result
}

/// Merges paired transfer legs that share a transfer id into one record.
///
/// A pair is merged only when exactly two legs carry the id and their transfer
/// types differ: the first leg survives and receives the second leg's
/// counterpart fields (`<type>`, `<type>Account`, `<type>BankID`, named after
/// the second leg's own type). Any other group is surfaced leg by leg. Transfer
/// markers are removed from every returned transaction.
pub fn combine_transfers_by_id(transactions: Vec<NormalizedTransaction>) -> Vec<NormalizedTransaction> {
    map_grouped_by_key(
        transactions,
        |txn| txn.transfer_id.clone(),
        |mut group, key| {
            if key.is_some() && group.len() == 2 && group[0].transfer_type != group[1].transfer_type {
                let second = group.pop()?;
                let mut surviving = group.pop()?;
                copy_counterpart_fields(&mut surviving, &second);
                group = vec![surviving];
            }
            for txn in group.iter_mut() {
                txn.strip_transfer_marker();
            }
            Some(group)
        },
    )
}

fn copy_counterpart_fields(target: &mut NormalizedTransaction, source: &NormalizedTransaction) {
    let Some(kind) = source.transfer_type.as_deref() else {
        return;
    };
    for postfix in ["", "Account", "BankID"] {
        let field = format!("{kind}{postfix}");
        if let Some(value) = source.extra.get(&field) {
            target.extra.insert(field, value.clone());
        }
    }
}

/// Fingerprint of the economic event a transaction describes.
///
/// The payee only counts for movements inside one account; for everything
/// else the two sides and amounts already identify the event.
pub fn duplicate_key(txn: &NormalizedTransaction) -> String {
    let payee = match &txn.payee {
        Some(payee) if txn.is_internal_movement() => payee.trim(),
        _ => "",
    };
    format!(
        "{}|{}|{}|{}|{}|{}",
        txn.date.fingerprint(),
        payee,
        txn.income_account,
        txn.income,
        txn.outcome_account,
        txn.outcome
    )
}

/// Drops transactions whose `duplicate_key` was already seen. The first
/// occurrence wins, so feed the most authoritative records first.
pub fn filter_duplicates(transactions: Vec<NormalizedTransaction>) -> Vec<NormalizedTransaction> {
    map_grouped_by_key(transactions, duplicate_key, |group, _| {
        group.into_iter().next().map(|first| vec![first])
    })
}

/// Sort transactions in-place by `date` ascending. Sorting is stable.
pub fn sort_transactions_by_date(transactions: &mut [NormalizedTransaction]) {
    transactions.sort_by_key(|txn| txn.date.sort_instant());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn txn(value: serde_json::Value) -> NormalizedTransaction {
        serde_json::from_value(value).unwrap()
    }

    fn leg(transfer_id: &str, transfer_type: &str, field: &str, value: &str) -> NormalizedTransaction {
        txn(json!({
            "date": "2023-01-01",
            "incomeAccount": "CARD",
            "income": 0.0,
            "outcomeAccount": "CARD",
            "outcome": 100.0,
            "transferId": transfer_id,
            "transferType": transfer_type,
            field: value
        }))
    }

    #[test]
    fn grouping_keeps_every_item_in_first_seen_order() {
        let items = vec![(1, 'a'), (2, 'b'), (1, 'c'), (3, 'd'), (2, 'e')];
        let mut calls = Vec::new();
        let out = map_grouped_by_key(
            items,
            |(k, _)| *k,
            |group, key| {
                calls.push((*key, group.len()));
                Some(group)
            },
        );
        assert_eq!(out, vec![(1, 'a'), (1, 'c'), (2, 'b'), (2, 'e'), (3, 'd')]);
        assert_eq!(calls, vec![(1, 2), (2, 2), (3, 1)]);
    }

    #[test]
    fn grouping_treats_sentinel_key_as_one_group() {
        let items = vec![Some(1), None, Some(1), None];
        let mut sentinel_calls = 0;
        let out = map_grouped_by_key(
            items,
            |item| *item,
            |group, key| {
                if key.is_none() {
                    sentinel_calls += 1;
                    assert_eq!(group.len(), 2);
                }
                Some(group)
            },
        );
        assert_eq!(sentinel_calls, 1);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn grouping_drops_groups_the_reducer_rejects() {
        let out = map_grouped_by_key(vec![1, 2, 3, 4, 5], |n| n % 2, |group, key| {
            match *key {
                0 => None,
                _ => Some(group),
            }
        });
        assert_eq!(out, vec![1, 3, 5]);

        let out = map_grouped_by_key(vec![1, 2], |n| *n, |_, _| Some(Vec::new()));
        assert!(out.is_empty());
    }

    #[test]
    fn opposite_legs_merge_into_one_record() {
        let mut b = leg("T1", "account", "account", "ACC1");
        b.extra.insert("accountBankID".to_string(), json!("044525225"));
        let a = leg("T1", "card", "card", "4111");

        let out = combine_transfers_by_id(vec![a.clone(), b]);

        assert_eq!(out.len(), 1);
        let mut expected = a;
        expected.strip_transfer_marker();
        expected.extra.insert("account".to_string(), json!("ACC1"));
        expected.extra.insert("accountBankID".to_string(), json!("044525225"));
        assert_eq!(out[0], expected);
        assert!(out[0].extra.get("accountAccount").is_none());
    }

    #[test]
    fn three_legs_sharing_an_id_pass_through() {
        let legs = vec![
            leg("T2", "card", "card", "4111"),
            leg("T2", "account", "account", "ACC1"),
            leg("T2", "account", "account", "ACC2"),
        ];
        let out = combine_transfers_by_id(legs.clone());
        assert_eq!(out.len(), 3);
        for (before, after) in legs.iter().zip(&out) {
            assert!(!after.has_transfer_marker());
            assert_eq!(before.extra, after.extra);
        }
    }

    #[test]
    fn same_typed_or_lonely_legs_are_not_merged() {
        let out = combine_transfers_by_id(vec![
            leg("T3", "card", "card", "4111"),
            leg("T3", "card", "card", "5222"),
            leg("T4", "account", "account", "ACC1"),
        ]);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|t| !t.has_transfer_marker()));
    }

    #[test]
    fn combining_clean_output_again_is_a_no_op() {
        let once = combine_transfers_by_id(vec![
            leg("T1", "card", "card", "4111"),
            leg("T1", "account", "account", "ACC1"),
            txn(json!({"date": "2023-01-02", "incomeAccount": "A", "income": 5.0, "outcomeAccount": "X", "outcome": 0.0})),
        ]);
        let twice = combine_transfers_by_id(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn identical_records_collapse_to_the_first() {
        let shop = json!({
            "date": "2023-01-01",
            "payee": "Shop",
            "incomeAccount": "A",
            "income": 0,
            "outcomeAccount": "B",
            "outcome": 100
        });
        let mut first = txn(shop.clone());
        first.extra.insert("comment".to_string(), json!("first"));
        let second = txn(shop);

        let out = filter_duplicates(vec![first.clone(), second]);
        assert_eq!(out, vec![first]);
    }

    #[test]
    fn payee_only_separates_internal_movements() {
        let base = |payee: &str, outcome_account: &str| {
            txn(json!({
                "date": "2023-01-01",
                "payee": payee,
                "incomeAccount": "A",
                "income": 0,
                "outcomeAccount": outcome_account,
                "outcome": 100
            }))
        };

        // Different payees across two accounts: same event.
        assert_eq!(filter_duplicates(vec![base("Shop", "B"), base("Other", "B")]).len(), 1);
        // Different payees inside one account: distinct events.
        assert_eq!(filter_duplicates(vec![base("Shop", "A"), base("Other", "A")]).len(), 2);
        // Surrounding whitespace does not matter.
        assert_eq!(filter_duplicates(vec![base("Shop", "A"), base(" Shop ", "A")]).len(), 1);
    }

    #[test]
    fn instant_and_day_dates_do_not_collide() {
        let day = txn(json!({"date": "2023-01-01", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0}));
        let instant = txn(json!({"date": "2023-01-01T00:00:00Z", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0}));
        assert_ne!(duplicate_key(&day), duplicate_key(&instant));
        assert!(duplicate_key(&instant).starts_with("1672531200000|"));
    }

    #[test]
    fn test_sort_transactions_by_date() {
        let mut txns = vec![
            txn(json!({"date": "2026-01-10", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0, "tag": "A"})),
            txn(json!({"date": "2025-12-01T10:00:00Z", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0, "tag": "B"})),
            txn(json!({"date": "2026-01-10", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0, "tag": "C"})),
            txn(json!({"date": "2025-12-01", "incomeAccount": "A", "income": 1, "outcomeAccount": "B", "outcome": 0, "tag": "D"})),
        ];

        sort_transactions_by_date(&mut txns);

        let tags: Vec<&str> = txns.iter().map(|t| t.extra["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["D", "B", "A", "C"]);
    }
}
