//! Per-layer registry of named, toggleable low-rank patches

use std::collections::BTreeMap;

use crate::delta::effective_scale;
use crate::layers::matmul_t;
use candle_core::Tensor;
use lorapatch_common::Result;

/// Suffixes of the physical records a fused q/k/v adapter expands into
pub const SLICE_SUFFIXES: [&str; 3] = ["_q", "_k", "_v"];

/// True when `record` is the record for `adapter` or one of its slice records
pub fn belongs_to(record: &str, adapter: &str) -> bool {
    match record.strip_prefix(adapter) {
        Some("") => true,
        Some(rest) => SLICE_SUFFIXES.contains(&rest),
        None => false,
    }
}

/// One patch held by an additive layer
#[derive(Debug, Clone)]
pub struct AppliedRecord {
    /// `[rank, in]`
    pub down: Tensor,
    /// `[out, rank]`, zero outside the slice rows for fused targets
    pub up: Tensor,
    pub alpha: Option<f32>,
    pub scale: f32,
    pub enabled: bool,
}

impl AppliedRecord {
    pub fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    pub fn effective_scale(&self) -> f32 {
        effective_scale(self.alpha, self.rank(), self.scale)
    }

    /// `effective_scale * (x @ down.T @ up.T)`
    pub fn contribution(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = matmul_t(x, &self.down)?;
        let out = matmul_t(&hidden, &self.up)?;
        Ok(out.affine(self.effective_scale() as f64, 0.0)?)
    }
}

/// Ordered map of record name to [`AppliedRecord`]
#[derive(Debug, Clone, Default)]
pub struct PatchRegistry {
    records: BTreeMap<String, AppliedRecord>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record called `name`
    pub fn insert(&mut self, name: impl Into<String>, record: AppliedRecord) -> Option<AppliedRecord> {
        self.records.insert(name.into(), record)
    }

    pub fn get(&self, name: &str) -> Option<&AppliedRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AppliedRecord)> {
        self.records.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Toggle every record of `adapter`; returns how many were touched
    pub fn set_enabled(&mut self, adapter: &str, enabled: bool) -> usize {
        self.matching_mut(adapter).map(|r| r.enabled = enabled).count()
    }

    pub fn set_all_enabled(&mut self, enabled: bool) -> usize {
        self.records.values_mut().map(|r| r.enabled = enabled).count()
    }

    /// Rescale every record of `adapter`; returns how many were touched
    pub fn set_scale(&mut self, adapter: &str, scale: f32) -> usize {
        self.matching_mut(adapter).map(|r| r.scale = scale).count()
    }

    /// Remove the exact record `name`
    pub fn remove(&mut self, name: &str) -> bool {
        self.records.remove(name).is_some()
    }

    /// Remove every record of `adapter`; returns how many were removed
    pub fn remove_adapter(&mut self, adapter: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|name, _| !belongs_to(name, adapter));
        before - self.records.len()
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.records.len();
        self.records.clear();
        removed
    }

    /// Sum of the enabled records' contributions, `None` when nothing is enabled
    pub fn contribution(&self, x: &Tensor) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        for record in self.records.values().filter(|r| r.enabled) {
            let part = record.contribution(x)?;
            total = Some(match total {
                Some(acc) => (acc + part)?,
                None => part,
            });
        }
        Ok(total)
    }

    fn matching_mut<'a>(&'a mut self, adapter: &'a str) -> impl Iterator<Item = &'a mut AppliedRecord> {
        self.records.iter_mut().filter(move |(name, _)| belongs_to(name, adapter)).map(|(_, r)| r)
    }
}
