//! Ingestion configuration
//!
//! Tunables for the scheduler, the redundancy detector, index staging and
//! merging. Every field has a default and can be overridden through a
//! `SEQDEX_*` environment variable (a `.env` file is honoured by the binary).

use crate::detector::DetectorConfig;
use crate::index::{MergeOptions, WriterOptions};
use crate::memory::MemoryBudget;
use crate::parser::{EmptySequencePolicy, ParserOptions};
use seqdex_common::{Result, SeqdexError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main ingestion configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// How often the scheduler polls for finished work (ms)
    pub poll_interval_ms: u64,
    /// Identifiers kept in memory before spilling to disk
    pub detector_max_in_memory: usize,
    /// Memory budget of the identifier set (MiB)
    pub detector_memory_mb: u64,
    /// Memory budget of the index staging buffer (MiB)
    pub staging_memory_mb: u64,
    /// Entry count from which merge sources are appended in bulk
    pub merge_bulk_threshold: u64,
    /// Store source paths in relocatable form
    pub relocatable_sources: bool,
    /// Load whole indexes in memory when opening them for queries
    pub load_index_in_memory: bool,
    pub empty_sequence_policy: EmptySequencePolicy,
    pub verbose: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            detector_max_in_memory: 5_000_000,
            detector_memory_mb: 512,
            staging_memory_mb: 64,
            merge_bulk_threshold: 10_000,
            relocatable_sources: false,
            load_index_in_memory: false,
            empty_sequence_policy: EmptySequencePolicy::WarnAndSkip,
            verbose: false,
        }
    }
}

/// Read and parse `name`, falling back to `default` when unset
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SeqdexError::config(format!("{name}={raw:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(SeqdexError::config(format!("{name}: {e}"))),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    ///
    /// Recognised variables: `SEQDEX_POLL_INTERVAL_MS`,
    /// `SEQDEX_DETECTOR_MAX_IN_MEMORY`, `SEQDEX_DETECTOR_MEMORY_MB`,
    /// `SEQDEX_STAGING_MEMORY_MB`, `SEQDEX_MERGE_BULK_THRESHOLD`,
    /// `SEQDEX_RELOCATABLE_SOURCES`, `SEQDEX_LOAD_INDEX_IN_MEMORY`,
    /// `SEQDEX_EMPTY_SEQUENCE` (`skip` or `fail`), `SEQDEX_VERBOSE`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            poll_interval_ms: env_parse("SEQDEX_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            detector_max_in_memory: env_parse(
                "SEQDEX_DETECTOR_MAX_IN_MEMORY",
                defaults.detector_max_in_memory,
            )?,
            detector_memory_mb: env_parse("SEQDEX_DETECTOR_MEMORY_MB", defaults.detector_memory_mb)?,
            staging_memory_mb: env_parse("SEQDEX_STAGING_MEMORY_MB", defaults.staging_memory_mb)?,
            merge_bulk_threshold: env_parse(
                "SEQDEX_MERGE_BULK_THRESHOLD",
                defaults.merge_bulk_threshold,
            )?,
            relocatable_sources: env_parse(
                "SEQDEX_RELOCATABLE_SOURCES",
                defaults.relocatable_sources,
            )?,
            load_index_in_memory: env_parse(
                "SEQDEX_LOAD_INDEX_IN_MEMORY",
                defaults.load_index_in_memory,
            )?,
            empty_sequence_policy: env_parse(
                "SEQDEX_EMPTY_SEQUENCE",
                defaults.empty_sequence_policy,
            )?,
            verbose: env_parse("SEQDEX_VERBOSE", defaults.verbose)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or thrash the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(SeqdexError::config("poll interval must be positive"));
        }
        if self.detector_max_in_memory == 0 {
            return Err(SeqdexError::config(
                "detector must hold at least one identifier in memory",
            ));
        }
        if self.detector_memory_mb == 0 || self.staging_memory_mb == 0 {
            return Err(SeqdexError::config("memory budgets must be positive"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn detector(&self) -> DetectorConfig {
        DetectorConfig {
            max_in_memory: self.detector_max_in_memory,
            memory_budget: MemoryBudget::from_megabytes(self.detector_memory_mb),
        }
    }

    pub fn writer(&self) -> WriterOptions {
        WriterOptions {
            staging_budget: MemoryBudget::from_megabytes(self.staging_memory_mb),
            relocatable_sources: self.relocatable_sources,
        }
    }

    pub fn merge(&self) -> MergeOptions {
        MergeOptions {
            bulk_threshold: self.merge_bulk_threshold,
            writer: self.writer(),
            ..MergeOptions::default()
        }
    }

    pub fn parser(&self, check_redundancy: bool) -> ParserOptions {
        ParserOptions {
            verbose: self.verbose,
            check_redundancy,
            empty_sequence: self.empty_sequence_policy,
        }
    }
}
