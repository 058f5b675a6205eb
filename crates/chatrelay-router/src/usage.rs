//! Per-backend usage accounting

use chatrelay_core::BackendId;
use chatrelay_llm::Usage;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackendUsage {
    pub requests: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Default)]
pub struct UsageLedger {
    totals: DashMap<BackendId, BackendUsage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, backend: &BackendId, usage: Option<Usage>) {
        let mut entry = self.totals.entry(backend.clone()).or_default();
        entry.requests += 1;
        if let Some(u) = usage {
            entry.prompt_tokens += u64::from(u.prompt_tokens);
            entry.completion_tokens += u64::from(u.completion_tokens);
        }
    }

    pub fn record_failure(&self, backend: &BackendId) {
        self.totals.entry(backend.clone()).or_default().failures += 1;
    }

    pub fn get(&self, backend: &BackendId) -> BackendUsage {
        self.totals.get(backend).map(|u| *u).unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BackendUsage> {
        self.totals
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }
}
