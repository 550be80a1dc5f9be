//! Local stage: filter then substring-match records already held in memory.

use ordo_core::{OrderFilter, OrderRecord};
use rustc_hash::FxHashSet;
use serde::Serialize;

/// Field that satisfied a free-text match, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Number,
    Name,
    Email,
    Phone,
    Company,
}

/// First field of `o` containing `needle` (already trimmed and lowercased).
/// An empty needle matches on the order number.
pub fn match_field(o: &OrderRecord, needle: &str) -> Option<MatchField> {
    if needle.is_empty() { return Some(MatchField::Number); }
    let hit = |v: Option<&str>| v.map(|s| s.to_lowercase().contains(needle)).unwrap_or(false);
    if hit(Some(o.number.as_str())) { return Some(MatchField::Number); }
    if hit(o.customer.name.as_deref()) { return Some(MatchField::Name); }
    if hit(o.customer.email.as_deref()) { return Some(MatchField::Email); }
    if hit(o.customer.phone.as_deref()) { return Some(MatchField::Phone); }
    if hit(o.customer.company.as_deref()) { return Some(MatchField::Company); }
    None
}

/// Records passing `filters` whose searchable fields contain `needle`, in input order.
pub fn local_scan<'a, I>(records: I, needle: &str, filters: &OrderFilter) -> Vec<OrderRecord>
where
    I: IntoIterator<Item = &'a OrderRecord>,
{
    records
        .into_iter()
        .filter(|o| filters.matches(o))
        .filter(|o| match_field(o, needle).is_some())
        .cloned()
        .collect()
}

/// Local records first, then remote records not already present; newest first.
pub fn merge(local: Vec<OrderRecord>, remote: Vec<OrderRecord>) -> Vec<OrderRecord> {
    let mut seen: FxHashSet<String> = local.iter().map(|o| o.id.clone()).collect();
    let mut out = local;
    for r in remote {
        if seen.insert(r.id.clone()) { out.push(r); }
    }
    // Stable: ties keep local ahead of remote.
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::FulfillmentStatus;

    fn rec(id: &str, number: &str, ts: i64, name: Option<&str>, email: Option<&str>) -> OrderRecord {
        OrderRecord::new(id, number, ts, FulfillmentStatus::NotFulfilled).with_customer(name, email)
    }

    #[test]
    fn first_matching_field_wins() {
        let mut o = rec("1", "1001", 0, Some("Jo 1001"), Some("jo@acme.com"));
        o.customer.company = Some("Acme".into());
        o.customer.phone = Some("+1 555".into());
        assert_eq!(match_field(&o, "1001"), Some(MatchField::Number));
        assert_eq!(match_field(&o, "jo"), Some(MatchField::Name));
        assert_eq!(match_field(&o, "@acme"), Some(MatchField::Email));
        assert_eq!(match_field(&o, "555"), Some(MatchField::Phone));
        assert_eq!(match_field(&o, "acme"), Some(MatchField::Email));
        o.customer.email = None;
        assert_eq!(match_field(&o, "acme"), Some(MatchField::Company));
        assert_eq!(match_field(&o, "zzz"), None);
    }

    #[test]
    fn scan_is_case_insensitive_and_filtered() {
        let mut b = rec("b", "2", 20, Some("JOHN Smith"), None);
        b.status = FulfillmentStatus::Fulfilled;
        let items = vec![rec("a", "1", 10, Some("John Doe"), None), b, rec("c", "3", 30, Some("Ann"), None)];
        let all = local_scan(&items, "john", &OrderFilter::default());
        assert_eq!(all.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        let f = OrderFilter { status: Some(FulfillmentStatus::Fulfilled), ..OrderFilter::default() };
        assert_eq!(local_scan(&items, "john", &f).len(), 1);
        assert_eq!(local_scan(&items, "", &OrderFilter { created_from: Some(20), ..OrderFilter::default() }).len(), 2);
    }

    #[test]
    fn merge_prefers_local_and_sorts_newest_first() {
        let mut local_a = rec("a", "1", 10, Some("local"), None);
        local_a.number = "local".into();
        let local = vec![local_a, rec("b", "2", 30, None, None)];
        let remote = vec![rec("a", "remote", 10, None, None), rec("c", "3", 20, None, None)];
        let out = merge(local, remote);
        assert_eq!(out.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["b", "c", "a"]);
        assert_eq!(out[2].number, "local");
    }
}
