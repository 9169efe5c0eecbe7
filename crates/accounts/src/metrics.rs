//! Counters recorded by the account services
//!
//! - `oa_token_refresh_total` (counter): label `outcome`
//!   (`refreshed`, `reused`, `invalid_grant`, `error`)
//! - `oa_pool_pick_total` (counter): label `outcome`
//!   (`picked`, `inactive`, `no_eligible`, `error`)
//! - `oa_usage_fetch_total` (counter): label `outcome`
//!   (`fetched`, `skipped`, `failed`, `cancelled`)
//!
//! No exporter is installed here; whatever recorder the process sets up
//! receives them.

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("oa_token_refresh_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_pick(outcome: &'static str) {
    metrics::counter!("oa_pool_pick_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_usage_fetch(outcome: &'static str) {
    metrics::counter!("oa_usage_fetch_total", "outcome" => outcome).increment(1);
}
